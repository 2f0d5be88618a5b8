// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use thiserror::Error;

use woofdb_txnlog::LogError;

use crate::engine::TxnMode;

/// Result alias for store operations.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Errors surfaced by the mediation layer.
///
/// An engine `NotFound` status is never an error: absent values come back as
/// `Ok(None)`. Everything else reaches the caller in one of these shapes.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database is not open")]
	DatabaseNotOpen,
	#[error("transaction is closed")]
	TxnClosed,
	#[error("iterator is closed")]
	IteratorClosed,
	/// The path is already served by a descriptor opened in the other mode.
	#[error("database is already open in {0} mode")]
	ConflictingMode(TxnMode),
	#[error("failed to create column family {name}: {source}")]
	ColumnFamilyCreate { name: String, source: rocksdb::Error },
	#[error("failed to open storage engine: {0}")]
	EngineOpen(String),
	#[error("commit failed: {0}")]
	CommitFailed(rocksdb::Error),
	/// Optimistic validation failure or pessimistic lock timeout; the
	/// transaction may be retried from scratch.
	#[error("transaction conflict: {0}")]
	Conflict(rocksdb::Error),
	#[error("transaction is already bound to log {0:?}")]
	LogAlreadyBound(String),
	#[error(transparent)]
	Log(#[from] LogError),
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	#[error("storage engine error: {0}")]
	Engine(#[from] rocksdb::Error),
}

/// Classify an engine commit status: contention statuses become the
/// retryable [`StoreError::Conflict`], anything else is a hard failure.
pub(crate) fn commit_error(err: rocksdb::Error) -> StoreError {
	use rocksdb::ErrorKind;
	match err.kind() {
		ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::TimedOut => StoreError::Conflict(err),
		_ => StoreError::CommitFailed(err),
	}
}
