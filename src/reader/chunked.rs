// SPDX-License-Identifier: Apache-2.0

//! Raw chunk reading without line splitting.
//!
//! Depth-first drains a file completely on every event before moving to the next one.
//! Breadth-first leaves reading to a dedicated thread that takes one chunk from each open
//! file in turn, so a single busy file cannot starve the others.

use std::io::Read;
use std::time::Duration;

use tracing::debug;

use super::{ReadBase, ReadStrategy, record_position, report_read_error};
use crate::config::TailConfig;
use crate::error::Result;
use crate::observer::{Action, Context, Listener, Observer};
use crate::watcher::{SLEEP_SLICE, WatchEvent, WatchedFile, stoppable_sleep};

const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOrder {
    DepthFirst,
    BreadthFirst,
}

pub struct ChunkedReader {
    base: ReadBase,
    order: ChunkOrder,
}

impl ChunkedReader {
    pub fn new(config: &TailConfig, order: ChunkOrder) -> Result<Self> {
        Ok(Self {
            base: ReadBase::new(config)?,
            order,
        })
    }

    pub fn order(&self) -> ChunkOrder {
        self.order
    }

    /// Read until EOF, emitting one chunk per read.
    fn drain<L: Listener>(&self, wf: &mut WatchedFile, listener: &mut L, ctx: &Context) -> bool {
        let Some(key) = wf.checkpoint_key() else {
            return false;
        };
        let mut buf = vec![0u8; self.base.config().chunk_size];
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
                    listener.accept(ctx, Action::Chunk(buf[..n].to_vec()));
                    self.base.checkpoints().advance(key, n as u64);
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

    /// Read at most one chunk. `eof` is only reported when a file first runs dry.
    fn read_one<O: Observer>(&self, wf: &mut WatchedFile, observer: &O, buf: &mut [u8]) -> bool {
        let Some(key) = wf.checkpoint_key() else {
            return false;
        };
        let ctx = ReadBase::context(wf);
        let Some(file) = wf.file_mut() else {
            return false;
        };

        match file.read(buf) {
            Ok(0) => {
                if !wf.at_eof() {
                    wf.set_at_eof(true);
                    observer.channel_for(&ctx).accept(&ctx, Action::Eof);
                }
                false
            }
            Ok(n) => {
                wf.set_at_eof(false);
                observer
                    .channel_for(&ctx)
                    .accept(&ctx, Action::Chunk(buf[..n].to_vec()));
                self.base.checkpoints().advance(key, n as u64);
                record_position(wf);
                true
            }
            Err(e) => {
                let mut listener = observer.channel_for(&ctx);
                report_read_error(wf, &mut listener, &ctx, e);
                false
            }
        }
    }

    fn read_breadth_first<O: Observer>(&self, observer: &O) {
        let watch = self.base.watch();
        let token = watch.stop_token();
        let config = self.base.config();
        let mut buf = vec![0u8; config.chunk_size];

        debug!(chunk_size = config.chunk_size, "Starting breadth-first reads");
        while !token.is_cancelled() {
            if !watch.has_open_files() {
                stoppable_sleep(&token, config.wait_for_files, WAIT_SLICE, || {
                    watch.has_open_files()
                });
                continue;
            }

            let mut changed = false;
            watch.with_open_files(|wf| {
                if self.read_one(wf, observer, &mut buf) {
                    changed = true;
                }
            });

            if changed {
                self.base.checkpoints().maybe_flush(true);
            } else {
                stoppable_sleep(&token, config.stat_interval, SLEEP_SLICE, || false);
            }
        }
        debug!("Breadth-first reads stopped");
    }
}

impl ReadStrategy for ChunkedReader {
    fn base(&self) -> &ReadBase {
        &self.base
    }

    fn subscribe<O: Observer>(&self, observer: &O) -> Result<()> {
        match self.order {
            ChunkOrder::DepthFirst => self.base.run_poll_loop(|event, wf| {
                self.base
                    .handle_event(event, wf, observer, |wf, listener, ctx| {
                        self.drain(wf, listener, ctx)
                    })
            }),
            ChunkOrder::BreadthFirst => {
                std::thread::scope(|s| {
                    s.spawn(|| self.read_breadth_first(observer));
                    // Reads happen on the other thread; a file that goes away is still
                    // drained here before its handle is released.
                    self.base.poll(|event, wf| {
                        self.base
                            .handle_event(event, wf, observer, |wf, listener, ctx| {
                                event == WatchEvent::Delete && self.drain(wf, listener, ctx)
                            })
                    });
                });
                self.base.sincedb_write("shutdown")
            }
        }
    }
}
