// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One engine transaction: snapshot, buffered log entries, commit and
//! rollback lifecycle.

use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;

use woofdb_txnlog::{LogEntry, TransactionLogStore};

use crate::descriptor::{Closable, DbDescriptor};
use crate::dispatch::{dispatcher, spawn_worker};
use crate::engine::EngineTxn;
use crate::error::{commit_error, Result, StoreError};
use crate::iter::{range_read_options, IterShared, RangeIter, RangeOptions};

struct OpenTxn {
	txn: EngineTxn,
	/// Log entries buffered for the bound store, in enqueue order.
	entries: Vec<Vec<u8>>,
	log: Option<Arc<TransactionLogStore>>,
}

enum TxnState {
	Open(Box<OpenTxn>),
	/// A commit is in flight; the transaction refuses everything else.
	Committing,
	Closed,
}

pub(crate) struct TxnShared {
	id: u32,
	column: String,
	state: Mutex<TxnState>,
	iters: Mutex<Vec<Weak<IterShared>>>,
	descriptor: Arc<DbDescriptor>,
}

/// A transaction over one database, registered with its descriptor by a
/// monotonically increasing id until it commits, aborts or closes.
///
/// Reads are snapshot-consistent from the moment the transaction began.
/// Dropping the handle rolls an open transaction back.
pub struct DbTransaction {
	shared: Arc<TxnShared>,
}

impl DbTransaction {
	pub(crate) fn begin(descriptor: Arc<DbDescriptor>, column: String) -> Result<DbTransaction> {
		let id = descriptor.allocate_txn_id()?;
		let txn = descriptor.engine().begin_txn(descriptor.disable_wal(), descriptor.lock_timeout());
		let shared = Arc::new(TxnShared {
			id,
			column,
			state: Mutex::new(TxnState::Open(Box::new(OpenTxn {
				txn,
				entries: Vec::new(),
				log: None,
			}))),
			iters: Mutex::new(Vec::new()),
			descriptor,
		});
		shared.descriptor.txn_install(id, Arc::downgrade(&shared));
		let shared_dyn: Arc<dyn Closable> = shared.clone();
		let closable: Weak<dyn Closable> = Arc::downgrade(&shared_dyn);
		shared.descriptor.attach(closable);
		Ok(DbTransaction { shared })
	}

	/// Identifier of this transaction, unique within its descriptor.
	pub fn id(&self) -> u32 {
		self.shared.id
	}

	pub fn is_open(&self) -> bool {
		matches!(&*self.shared.state.lock(), TxnState::Open(_))
	}

	/// Snapshot-consistent read through the engine transaction.
	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.shared.read(key)
	}

	/// Asynchronous read: runs on a worker thread, the completion is
	/// delivered on the host dispatch thread.
	pub fn get_async(
		&self,
		key: &[u8],
		completion: impl FnOnce(Result<Option<Vec<u8>>>) + Send + 'static,
	) {
		let shared = self.shared.clone();
		let key = key.to_vec();
		spawn_worker("woofdb-get", move || {
			let result = shared.read(&key);
			dispatcher().dispatch(Box::new(move || completion(result)));
		});
	}

	pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		let mut state = self.shared.state.lock();
		let open = open_state_mut(&mut state)?;
		open.txn.put(self.shared.descriptor.engine(), &self.shared.column, key, value)?;
		let stats = self.shared.descriptor.stats();
		stats.tally_writes(1);
		stats.tally_bytes_written((key.len() + value.len()) as u64);
		Ok(())
	}

	pub fn remove(&self, key: &[u8]) -> Result<()> {
		let mut state = self.shared.state.lock();
		let open = open_state_mut(&mut state)?;
		open.txn.delete(self.shared.descriptor.engine(), &self.shared.column, key)?;
		self.shared.descriptor.stats().tally_writes(1);
		Ok(())
	}

	/// Range iteration over the transaction's snapshot view.
	pub fn range(&self, options: &RangeOptions) -> Result<RangeIter> {
		let state = self.shared.state.lock();
		let open = open_state(&state)?;
		let readopts = range_read_options(options);
		let raw =
			open.txn.raw_iterator(self.shared.descriptor.engine(), &self.shared.column, readopts);
		drop(state);
		Ok(RangeIter::new(
			self.shared.descriptor.clone(),
			Some(self.shared.clone()),
			raw,
			options,
		))
	}

	/// Buffer one entry for `store`. The first entry binds the transaction
	/// to the store for its remaining lifetime.
	pub(crate) fn add_log_entry(&self, store: &Arc<TransactionLogStore>, data: &[u8]) -> Result<()> {
		self.shared.add_log_entry(store, data)
	}

	/// Commit on the calling thread: engine commit, then hand the buffered
	/// entries to the bound log store as one durable batch.
	pub fn commit_sync(&self) -> Result<()> {
		let open = self.shared.take_open()?;
		self.shared.commit_open(open)
	}

	/// Asynchronous commit. The engine work runs on a worker thread and the
	/// completion is delivered on the host dispatch thread.
	pub fn commit(&self, completion: impl FnOnce(Result<()>) + Send + 'static) {
		match self.shared.take_open() {
			Err(err) => dispatcher().dispatch(Box::new(move || completion(Err(err)))),
			Ok(open) => {
				let shared = self.shared.clone();
				spawn_worker("woofdb-commit", move || {
					let result = shared.commit_open(open);
					dispatcher().dispatch(Box::new(move || completion(result)));
				});
			}
		}
	}

	/// Roll back and close. Refused while a commit is in flight.
	pub fn abort(&self) -> Result<()> {
		let open = self.shared.take_open()?;
		self.shared.rollback_open(open);
		Ok(())
	}

	/// Idempotent teardown; an open transaction is rolled back.
	pub fn close(&self) {
		if let Ok(open) = self.shared.take_open() {
			self.shared.rollback_open(open);
		}
	}
}

impl Drop for DbTransaction {
	fn drop(&mut self) {
		self.close();
	}
}

impl TxnShared {
	pub(crate) fn add_log_entry(&self, store: &Arc<TransactionLogStore>, data: &[u8]) -> Result<()> {
		let mut state = self.state.lock();
		let open = open_state_mut(&mut state)?;
		match &open.log {
			Some(bound) if !Arc::ptr_eq(bound, store) => {
				return Err(StoreError::LogAlreadyBound(bound.name().to_owned()))
			}
			Some(_) => {}
			None => open.log = Some(store.clone()),
		}
		open.entries.push(data.to_vec());
		Ok(())
	}

	fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let state = self.state.lock();
		let open = open_state(&state)?;
		let value = open.txn.get(self.descriptor.engine(), &self.column, key)?;
		let stats = self.descriptor.stats();
		stats.tally_reads(1);
		stats.tally_bytes_read(value.as_ref().map_or(0, |v| v.len() as u64));
		Ok(value)
	}

	pub(crate) fn register_iter(&self, iter: Weak<IterShared>) {
		let mut iters = self.iters.lock();
		iters.retain(|weak| weak.upgrade().is_some());
		iters.push(iter);
	}

	fn close_iters(&self) {
		let iters = std::mem::take(&mut *self.iters.lock());
		for weak in iters {
			if let Some(iter) = weak.upgrade() {
				iter.close_resource();
			}
		}
	}

	/// Move the open state out, leaving `Committing` behind. Iterators are
	/// closed first, under the same state lock, because they borrow the
	/// engine transaction.
	fn take_open(&self) -> Result<Box<OpenTxn>> {
		let mut state = self.state.lock();
		if !matches!(&*state, TxnState::Open(_)) {
			return Err(StoreError::TxnClosed);
		}
		self.close_iters();
		match std::mem::replace(&mut *state, TxnState::Committing) {
			TxnState::Open(open) => Ok(open),
			_ => unreachable!("state checked open under the same lock; qed"),
		}
	}

	fn commit_open(&self, open: Box<OpenTxn>) -> Result<()> {
		let OpenTxn { txn, entries, log } = *open;
		let result = txn.commit(self.descriptor.engine());
		self.finish();
		match result {
			Ok(()) => {
				self.descriptor.stats().tally_transactions(1);
				if let Some(store) = log {
					if !entries.is_empty() {
						let records: Vec<LogEntry> = entries
							.into_iter()
							.map(|data| LogEntry { txn_id: self.id, data })
							.collect();
						// the engine commit stands; a log persistence
						// failure is reported by the store, not here
						if let Err(err) = store.append_sync(&records) {
							warn!(
								"transaction {} committed but its log batch failed to persist: {}",
								self.id, err
							);
						}
					}
				}
				Ok(())
			}
			Err(err) => Err(commit_error(err)),
		}
	}

	fn rollback_open(&self, open: Box<OpenTxn>) {
		let OpenTxn { txn, entries, log } = *open;
		drop(entries);
		drop(log);
		if let Err(err) = txn.rollback() {
			warn!("rollback of transaction {} failed: {}", self.id, err);
		}
		drop(txn);
		self.finish();
	}

	fn finish(&self) {
		*self.state.lock() = TxnState::Closed;
		self.descriptor.txn_remove(self.id);
		self.descriptor.detach(self as *const TxnShared as *const ());
	}
}

impl Closable for TxnShared {
	fn close_resource(&self) {
		if let Ok(open) = self.take_open() {
			self.rollback_open(open);
		}
	}
}

fn open_state<'a>(state: &'a parking_lot::MutexGuard<'_, TxnState>) -> Result<&'a OpenTxn> {
	match &**state {
		TxnState::Open(open) => Ok(&**open),
		_ => Err(StoreError::TxnClosed),
	}
}

fn open_state_mut<'a>(
	state: &'a mut parking_lot::MutexGuard<'_, TxnState>,
) -> Result<&'a mut OpenTxn> {
	match &mut **state {
		TxnState::Open(open) => Ok(&mut **open),
		_ => Err(StoreError::TxnClosed),
	}
}
