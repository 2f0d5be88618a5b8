// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! User-facing append-only transaction log with a block-structured on-disk
//! format, batched durable writes and memory-mapped readback.
//!
//! This log is independent of the storage engine's own write-ahead log: it
//! records application-level entries ordered by batch timestamp. A store is
//! one directory of sequence-numbered [`LogFile`]s; the newest file is the
//! write target and rotation happens by size. See [`format`] for the exact
//! byte layout.

pub mod format;

mod file;
mod mmap;
mod store;

pub use file::{BatchInfo, LogFile};
pub use mmap::MemoryMap;
pub use store::{now_ms, LogRangeIter, LogRecord, LogStoreOptions, TransactionLogStore};

use thiserror::Error;

/// Result alias for transaction log operations.
pub type LogResult<T> = Result<T, LogError>;

#[derive(Debug, Error)]
pub enum LogError {
	#[error("transaction log i/o: {0}")]
	Io(#[from] std::io::Error),
	/// The on-disk layout is damaged beyond use: bad magic token, truncated
	/// header, or a sequence-number gap.
	#[error("invalid transaction log format: {0}")]
	Format(String),
	#[error("no log file with sequence number {0}")]
	UnknownSequence(u64),
	#[error("transaction log store is closed")]
	Closed,
}

/// A `(sequence number, byte offset)` pair identifying a point in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
	pub sequence: u64,
	pub offset: u64,
}

/// One entry recorded under a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
	pub txn_id: u32,
	pub data: Vec<u8>,
}
