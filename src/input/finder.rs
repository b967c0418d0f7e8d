// SPDX-License-Identifier: Apache-2.0

use glob::{MatchOptions, Pattern, glob};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Exclude patterns follow fnmatch semantics: a leading dot must be matched literally.
const EXCLUDE_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: true,
};

/// FileFinder expands watch patterns into regular files and applies basename excludes.
#[derive(Debug, Clone, Default)]
pub struct FileFinder {
    exclude: Vec<Pattern>,
}

impl FileFinder {
    /// Create a FileFinder with the given exclude patterns
    pub fn new(exclude: &[String]) -> Result<Self> {
        let mut finder = Self::default();
        finder.add_excludes(exclude)?;
        Ok(finder)
    }

    /// Append exclude patterns. Invalid patterns are rejected before any is added.
    pub fn add_excludes(&mut self, exclude: &[String]) -> Result<()> {
        let parsed = exclude
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;
        self.exclude.extend(parsed);
        Ok(())
    }

    /// Expand `pattern` into the regular files it currently matches.
    ///
    /// A pattern that matches nothing but names an existing regular file is treated as a
    /// single match, so literal paths containing glob metacharacters still work.
    pub fn find_files(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let matches = glob(pattern).map_err(|e| Error::InvalidGlob(e.to_string()))?;

        let mut paths: Vec<PathBuf> = matches
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!(pattern, error = %e, "Skipping unreadable glob entry");
                    None
                }
            })
            .collect();

        if paths.is_empty() {
            let literal = Path::new(pattern);
            if literal.is_file() {
                debug!(pattern, "Glob matched nothing, using pattern as a literal file");
                paths.push(literal.to_path_buf());
            }
        }

        // Directories and other non-regular entries are never tracked
        paths.retain(|p| p.is_file());
        Ok(paths)
    }

    /// Return the first exclude pattern matching the basename of `path`.
    pub fn excluded_by(&self, path: &Path) -> Option<&str> {
        let name = path.file_name()?.to_str()?;
        self.exclude
            .iter()
            .find(|p| p.matches_with(name, EXCLUDE_MATCH_OPTIONS))
            .map(|p| p.as_str())
    }
}
