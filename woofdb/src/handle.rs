// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Host-side handles: the per-open database handle and the transaction log
//! surface.

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use woofdb_txnlog::{LogRangeIter, MemoryMap, Position, TransactionLogStore};

use crate::descriptor::DbDescriptor;
use crate::engine::read_options;
use crate::error::{Result, StoreError};
use crate::iter::{range_read_options, RangeIter, RangeOptions};
use crate::stats::{IoStats, StatsKind};
use crate::txn::DbTransaction;

pub(crate) struct HandleCore {
	descriptor: Mutex<Option<Arc<DbDescriptor>>>,
	column: String,
}

/// A lightweight per-open handle onto a shared descriptor, bound to one
/// column family.
///
/// Handles share-own their descriptor: the engine stays open while any
/// handle (or subordinate resource) is alive, and the registry lets the
/// descriptor expire once the last one goes.
pub struct DbHandle {
	core: Arc<HandleCore>,
}

impl DbHandle {
	pub(crate) fn new(descriptor: Arc<DbDescriptor>, column: String) -> DbHandle {
		DbHandle { core: Arc::new(HandleCore { descriptor: Mutex::new(Some(descriptor)), column }) }
	}

	fn descriptor(&self) -> Result<Arc<DbDescriptor>> {
		match self.core.descriptor.lock().as_ref() {
			Some(descriptor) if !descriptor.is_closed() => Ok(descriptor.clone()),
			_ => Err(StoreError::DatabaseNotOpen),
		}
	}

	/// The column family this handle reads and writes.
	pub fn column(&self) -> &str {
		&self.core.column
	}

	pub fn is_open(&self) -> bool {
		self.descriptor().is_ok()
	}

	/// Drop this handle's share of the descriptor. Idempotent; the engine
	/// closes once every handle and subordinate resource is gone.
	pub fn close(&self) {
		self.core.descriptor.lock().take();
	}

	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let descriptor = self.descriptor()?;
		let value = descriptor.engine().get(&self.core.column, key, &read_options())?;
		let stats = descriptor.stats();
		stats.tally_reads(1);
		stats.tally_bytes_read(value.as_ref().map_or(0, |v| v.len() as u64));
		Ok(value)
	}

	pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		let descriptor = self.descriptor()?;
		descriptor.engine().put(&self.core.column, key, value, descriptor.disable_wal())?;
		let stats = descriptor.stats();
		stats.tally_writes(1);
		stats.tally_bytes_written((key.len() + value.len()) as u64);
		Ok(())
	}

	pub fn remove(&self, key: &[u8]) -> Result<()> {
		let descriptor = self.descriptor()?;
		descriptor.engine().delete(&self.core.column, key, descriptor.disable_wal())?;
		descriptor.stats().tally_writes(1);
		Ok(())
	}

	/// Force a memtable flush of this handle's column family.
	pub fn flush(&self) -> Result<()> {
		self.descriptor()?.engine().flush(&self.core.column)
	}

	/// Begin a transaction in the descriptor's mode.
	pub fn create_transaction(&self) -> Result<DbTransaction> {
		DbTransaction::begin(self.descriptor()?, self.core.column.clone())
	}

	/// Bounded range iteration over this handle's column family.
	pub fn range(&self, options: &RangeOptions) -> Result<RangeIter> {
		let descriptor = self.descriptor()?;
		let readopts = range_read_options(options);
		let raw = descriptor.engine().raw_iterator(&self.core.column, readopts);
		Ok(RangeIter::new(descriptor, None, raw, options))
	}

	/// The named transaction log of this database, created on first use.
	pub fn transaction_log(&self, name: &str) -> Result<TransactionLog> {
		let descriptor = self.descriptor()?;
		let store = descriptor.resolve_log_store(name)?;
		Ok(TransactionLog { descriptor, store })
	}

	/// I/O statistics of the underlying descriptor.
	pub fn io_stats(&self, kind: StatsKind) -> Result<IoStats> {
		Ok(self.descriptor()?.stats().take(kind))
	}

	/// Run `callback` now if `key` is free, else queue it behind the current
	/// holder. Returns `true` when it was started immediately. The handle is
	/// the callback's owner: if the handle is gone when the callback's turn
	/// comes, it is skipped.
	pub fn lock_call(&self, key: &str, callback: impl FnOnce() + Send + 'static) -> Result<bool> {
		let descriptor = self.descriptor()?;
		Ok(descriptor.locks().lock_call(key, self.lock_owner(), Box::new(callback)))
	}

	/// Conditional enqueue variant of [`lock_call`](Self::lock_call).
	pub fn lock_enqueue(
		&self,
		key: &str,
		callback: impl FnOnce() + Send + 'static,
		skip_if_exists: bool,
	) -> Result<bool> {
		let descriptor = self.descriptor()?;
		Ok(descriptor.locks().enqueue(key, self.lock_owner(), Box::new(callback), skip_if_exists))
	}

	/// Release `key`, starting the next queued live-owner callback.
	pub fn lock_release(&self, key: &str) -> Result<bool> {
		Ok(self.descriptor()?.locks().release(key))
	}

	/// Fire the next queued callback for `key` asynchronously.
	pub fn lock_fire_next(&self, key: &str) -> Result<bool> {
		Ok(self.descriptor()?.locks().fire_next(key))
	}

	/// Fire the next queued callback for `key` on the calling thread.
	pub fn lock_fire_next_immediate(&self, key: &str) -> Result<bool> {
		Ok(self.descriptor()?.locks().fire_next_immediate(key))
	}

	/// Whether `key` currently has a running or queued callback.
	pub fn lock_exists(&self, key: &str) -> Result<bool> {
		Ok(self.descriptor()?.locks().contains(key))
	}

	fn lock_owner(&self) -> Weak<dyn Any + Send + Sync> {
		let core: Arc<dyn Any + Send + Sync> = self.core.clone();
		Arc::downgrade(&core)
	}

	#[cfg(test)]
	pub(crate) fn descriptor_for_tests(&self) -> Arc<DbDescriptor> {
		self.descriptor().unwrap()
	}
}

/// Host surface of one named transaction log.
///
/// Entries are buffered on a transaction via [`add_entry`](Self::add_entry)
/// and reach the store as one batch when the transaction commits.
pub struct TransactionLog {
	descriptor: Arc<DbDescriptor>,
	store: Arc<TransactionLogStore>,
}

impl TransactionLog {
	pub fn name(&self) -> &str {
		self.store.name()
	}

	/// Buffer `data` on `txn`, binding the transaction to this log.
	pub fn add_entry(&self, txn: &DbTransaction, data: &[u8]) -> Result<()> {
		txn.add_log_entry(&self.store, data)
	}

	/// Buffer `data` on the open transaction with this id, resolved through
	/// the descriptor's transaction table.
	pub fn add_entry_by_id(&self, txn_id: u32, data: &[u8]) -> Result<()> {
		let txn = self.descriptor.txn_get(txn_id).ok_or(StoreError::TxnClosed)?;
		txn.add_log_entry(&self.store, data)
	}

	/// Decoded records from `from` (or the oldest retained batch) onward.
	pub fn range(&self, from: Option<Position>) -> Result<LogRangeIter> {
		Ok(self.store.range(from)?)
	}

	/// Locate the first batch at or past `timestamp`.
	pub fn find_position(&self, timestamp: f64) -> Result<Option<Position>> {
		Ok(self.store.find_position(timestamp)?)
	}

	/// Shared read mapping of the file with the given sequence number.
	pub fn memory_map(&self, sequence: u64) -> Result<Arc<MemoryMap>> {
		Ok(self.store.mapping(sequence)?)
	}

	/// Block until queued batches are durable, surfacing any writer error.
	pub fn flush(&self) -> Result<()> {
		Ok(self.store.flush()?)
	}

	/// End of the durably written region.
	pub fn flushed_position(&self) -> Position {
		self.store.flushed_position()
	}

	/// End of the region acknowledged to committers.
	pub fn committed_position(&self) -> Position {
		self.store.committed_position()
	}

	/// Unlink files past the retention window. Returns how many were
	/// removed.
	pub fn prune(&self) -> usize {
		self.store.prune()
	}
}
