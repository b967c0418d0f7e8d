// SPDX-License-Identifier: Apache-2.0

mod file_id;
mod finder;

pub use file_id::FileIdentity;
pub use finder::FileFinder;
