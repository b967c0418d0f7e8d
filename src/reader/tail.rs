// SPDX-License-Identifier: Apache-2.0

use std::io::Read;

use super::{ReadBase, ReadStrategy, record_position, report_read_error};
use crate::config::TailConfig;
use crate::error::Result;
use crate::observer::{Action, Context, Listener, Observer};
use crate::watcher::WatchedFile;

const READ_BLOCK_SIZE: usize = 32768;

/// Line-oriented reader: each event drains the file and emits one `line` per delimiter.
pub struct TailReader {
    base: ReadBase,
}

impl TailReader {
    pub fn new(config: &TailConfig) -> Result<Self> {
        Ok(Self {
            base: ReadBase::new(config)?,
        })
    }

    /// Read to end of file. The checkpoint advances per completed line, so a partial line
    /// at EOF is read again after a restart.
    fn read_lines<L: Listener>(&self, wf: &mut WatchedFile, listener: &mut L, ctx: &Context) -> bool {
        let Some(key) = wf.checkpoint_key() else {
            return false;
        };
        let mut buf = vec![0u8; READ_BLOCK_SIZE];
        let mut changed = false;

        loop {
            let Some(file) = wf.file_mut() else {
                break;
            };
            match file.read(&mut buf) {
                Ok(0) => {
                    listener.accept(ctx, Action::Eof);
                    break;
                }
                Ok(n) => {
                    changed = true;
                    for token in wf.buffer_extract(&buf[..n]) {
                        listener.accept(ctx, Action::Line(token.bytes));
                        self.base.checkpoints().advance(key, token.consumed as u64);
                    }
                }
                Err(e) => {
                    report_read_error(wf, listener, ctx, e);
                    break;
                }
            }
        }

        if changed {
            record_position(wf);
        }
        changed
    }
}

impl ReadStrategy for TailReader {
    fn base(&self) -> &ReadBase {
        &self.base
    }

    fn subscribe<O: Observer>(&self, observer: &O) -> Result<()> {
        self.base.run_poll_loop(|event, wf| {
            self.base
                .handle_event(event, wf, observer, |wf, listener, ctx| {
                    self.read_lines(wf, listener, ctx)
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::RecordingObserver;
    use super::*;
    use crate::input::FileIdentity;
    use std::fs;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn reader_in(dir: &TempDir) -> TailReader {
        TailReader::new(&TailConfig {
            sincedb_path: Some(dir.path().join("sincedb")),
            stat_interval: Duration::from_millis(10),
            sincedb_write_interval: Duration::ZERO,
            ..Default::default()
        })
        .unwrap()
    }

    fn pass(reader: &TailReader, observer: &RecordingObserver) {
        reader.base.watch().each(|event, wf| {
            reader
                .base
                .handle_event(event, wf, observer, |wf, l, ctx| reader.read_lines(wf, l, ctx));
        });
    }

    #[test]
    fn test_initial_file_read_from_start() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, b"one\ntwo\n").unwrap();

        let reader = reader_in(&dir);
        let observer = RecordingObserver::default();
        reader.monitor(&log.display().to_string()).unwrap();
        pass(&reader, &observer);

        assert_eq!(
            observer.actions(),
            vec![
                Action::Created,
                Action::Line(b"one".to_vec()),
                Action::Line(b"two".to_vec()),
                Action::Eof,
            ]
        );
        let id = FileIdentity::from_path(&log).unwrap();
        assert_eq!(reader.base.checkpoints().get(&id), Some(8));
    }

    #[test]
    fn test_partial_line_completed_later() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, b"hel").unwrap();

        let reader = reader_in(&dir);
        let observer = RecordingObserver::default();
        reader.monitor(&log.display().to_string()).unwrap();
        pass(&reader, &observer);
        assert_eq!(observer.actions(), vec![Action::Created, Action::Eof]);

        let mut f = fs::OpenOptions::new().append(true).open(&log).unwrap();
        f.write_all(b"lo\n").unwrap();
        pass(&reader, &observer);

        assert_eq!(
            observer.actions(),
            vec![Action::Line(b"hello".to_vec()), Action::Eof]
        );
        let id = FileIdentity::from_path(&log).unwrap();
        assert_eq!(reader.base.checkpoints().get(&id), Some(6));
    }

    #[test]
    fn test_delete_drains_open_handle() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, b"first\n").unwrap();

        let reader = reader_in(&dir);
        let observer = RecordingObserver::default();
        reader.monitor(&log.display().to_string()).unwrap();
        pass(&reader, &observer);
        observer.take();

        // Written and removed between passes
        let mut f = fs::OpenOptions::new().append(true).open(&log).unwrap();
        f.write_all(b"last words\n").unwrap();
        drop(f);
        fs::remove_file(&log).unwrap();
        pass(&reader, &observer);

        assert_eq!(
            observer.actions(),
            vec![
                Action::Line(b"last words".to_vec()),
                Action::Eof,
                Action::Deleted
            ]
        );
    }

    #[test]
    fn test_custom_delimiter() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, b"a\r\nb\r\n").unwrap();

        let reader = TailReader::new(&TailConfig {
            sincedb_path: Some(dir.path().join("sincedb")),
            delimiter: b"\r\n".to_vec(),
            ..Default::default()
        })
        .unwrap();
        let observer = RecordingObserver::default();
        reader.monitor(&log.display().to_string()).unwrap();
        pass(&reader, &observer);

        let lines: Vec<_> = observer
            .actions()
            .into_iter()
            .filter_map(|a| match a {
                Action::Line(l) => Some(l),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
        let id = FileIdentity::from_path(&log).unwrap();
        assert_eq!(reader.base.checkpoints().get(&id), Some(6));
    }

    #[test]
    fn test_long_line_split_at_max_line_size() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("a.log");
        fs::write(&log, b"0123456789\nok\n").unwrap();

        let reader = TailReader::new(&TailConfig {
            sincedb_path: Some(dir.path().join("sincedb")),
            max_line_size: 4,
            ..Default::default()
        })
        .unwrap();
        let observer = RecordingObserver::default();
        reader.monitor(&log.display().to_string()).unwrap();
        pass(&reader, &observer);

        assert_eq!(
            observer.actions(),
            vec![
                Action::Created,
                Action::Line(b"0123".to_vec()),
                Action::Line(b"4567".to_vec()),
                Action::Line(b"89".to_vec()),
                Action::Line(b"ok".to_vec()),
                Action::Eof,
            ]
        );
        let id = FileIdentity::from_path(&log).unwrap();
        assert_eq!(reader.base.checkpoints().get(&id), Some(14));
    }
}
