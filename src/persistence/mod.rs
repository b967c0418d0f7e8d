// SPDX-License-Identifier: Apache-2.0

//! Durable read progress.
//!
//! `sincedb` owns the on-disk format and crash-safe writes, `checkpoints` the shared,
//! lock-serialized store the read strategies update.

mod checkpoints;
pub mod sincedb;

pub use checkpoints::Checkpoints;
pub use sincedb::SinceDb;
