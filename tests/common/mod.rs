// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tailwatch::{Action, Context, Listener, Observer, ReadStrategy, TailConfig};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<(PathBuf, Action)>>>,
}

impl Recorder {
    pub fn snapshot(&self) -> Vec<(PathBuf, Action)> {
        self.events.lock().unwrap().clone()
    }

    /// Actions seen for `path`, ignoring `eof` markers.
    pub fn actions_for(&self, path: &Path) -> Vec<Action> {
        self.snapshot()
            .into_iter()
            .filter(|(p, a)| p == path && *a != Action::Eof)
            .map(|(_, a)| a)
            .collect()
    }

    pub fn lines_for(&self, path: &Path) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|(p, _)| p == path)
            .filter_map(|(_, a)| match a {
                Action::Line(l) => Some(String::from_utf8(l).unwrap()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, path: &Path, action: &Action) -> usize {
        self.snapshot()
            .iter()
            .filter(|(p, a)| p == path && a == action)
            .count()
    }

    pub fn wait_for<F>(&self, what: &str, cond: F)
    where
        F: Fn(&Recorder) -> bool,
    {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while !cond(self) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; recorded: {:?}",
                self.snapshot()
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Listener for Recorder {
    fn accept(&mut self, ctx: &Context, action: Action) {
        self.events.lock().unwrap().push((ctx.path.clone(), action));
    }
}

impl Observer for Recorder {
    type Listener = Recorder;

    fn channel_for(&self, _ctx: &Context) -> Recorder {
        self.clone()
    }
}

/// Fast polling, immediate checkpoint writes, checkpoints inside `dir`.
pub fn fast_config(dir: &Path) -> TailConfig {
    TailConfig {
        sincedb_path: Some(dir.join("sincedb")),
        stat_interval: Duration::from_millis(10),
        discover_interval: 1,
        sincedb_write_interval: Duration::ZERO,
        wait_for_files: Duration::from_millis(20),
        ..Default::default()
    }
}

/// A reader running its poll loop on a background thread.
pub struct Running<R: ReadStrategy + 'static> {
    pub reader: Arc<R>,
    pub recorder: Recorder,
    handle: Option<JoinHandle<tailwatch::Result<()>>>,
}

impl<R: ReadStrategy + 'static> Running<R> {
    pub fn start(reader: R, patterns: &[&str]) -> Self {
        for pattern in patterns {
            reader.monitor(pattern).unwrap();
        }
        let reader = Arc::new(reader);
        let recorder = Recorder::default();
        let handle = {
            let reader = reader.clone();
            let recorder = recorder.clone();
            std::thread::spawn(move || reader.subscribe(&recorder))
        };
        Self {
            reader,
            recorder,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) -> Recorder {
        self.reader.quit().unwrap();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
        self.recorder.clone()
    }
}

impl<R: ReadStrategy + 'static> Drop for Running<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.reader.quit();
            let _ = handle.join();
        }
    }
}

pub fn pattern(dir: &Path, glob: &str) -> String {
    dir.join(glob).display().to_string()
}

pub fn append(path: &Path, data: &[u8]) {
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    f.write_all(data).unwrap();
}
