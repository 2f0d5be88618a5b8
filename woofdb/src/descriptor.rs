// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-database shared state.
//!
//! A descriptor is shared-owned by every live handle of its path and holds
//! everything the handles share: the engine, the column-family set, the
//! transaction table, the lock table, attached closables and the
//! transaction-log stores. The registry observes descriptors through weak
//! references only.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use woofdb_txnlog::{LogStoreOptions, TransactionLogStore};

use crate::engine::{Engine, OpenOptions, TxnMode};
use crate::error::{Result, StoreError};
use crate::locks::LockTable;
use crate::settings::settings;
use crate::stats::RunningStats;
use crate::txn::TxnShared;

/// A subordinate resource that must be torn down before the engine.
pub(crate) trait Closable: Send + Sync {
	fn close_resource(&self);
}

struct DescriptorInner {
	columns: HashSet<String>,
	txns: HashMap<u32, Weak<TxnShared>>,
	next_txn_id: u32,
	closables: Vec<Weak<dyn Closable>>,
	log_stores: HashMap<String, Arc<TransactionLogStore>>,
	closed: bool,
}

pub(crate) struct DbDescriptor {
	path: PathBuf,
	mode: TxnMode,
	disable_wal: bool,
	lock_timeout: Duration,
	log_options: LogStoreOptions,
	options: OpenOptions,
	engine: Engine,
	inner: Mutex<DescriptorInner>,
	// own mutex, so lock traffic never nests with the structural one
	locks: LockTable,
	stats: RunningStats,
}

impl DbDescriptor {
	pub fn open(path: PathBuf, options: &OpenOptions) -> Result<DbDescriptor> {
		let (engine, columns) = Engine::open(&path, options)?;
		let log_options = LogStoreOptions {
			max_file_size: options.max_log_file_size.unwrap_or_else(|| settings().max_log_file_size()),
			retention: options.log_retention.or_else(|| settings().log_retention()),
		};
		Ok(DbDescriptor {
			path,
			mode: options.mode,
			disable_wal: options.disable_wal,
			lock_timeout: options.lock_timeout,
			log_options,
			options: options.clone(),
			engine,
			inner: Mutex::new(DescriptorInner {
				columns: columns.into_iter().collect(),
				txns: HashMap::new(),
				next_txn_id: 1,
				closables: Vec::new(),
				log_stores: HashMap::new(),
				closed: false,
			}),
			locks: LockTable::new(),
			stats: RunningStats::new(),
		})
	}

	pub fn mode(&self) -> TxnMode {
		self.mode
	}

	pub fn disable_wal(&self) -> bool {
		self.disable_wal
	}

	pub fn lock_timeout(&self) -> Duration {
		self.lock_timeout
	}

	pub fn engine(&self) -> &Engine {
		&self.engine
	}

	pub fn locks(&self) -> &LockTable {
		&self.locks
	}

	pub fn stats(&self) -> &RunningStats {
		&self.stats
	}

	pub fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	/// Make sure the named column family exists, creating it on the live
	/// engine if needed.
	pub fn ensure_column(&self, name: &str) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(StoreError::DatabaseNotOpen);
		}
		if inner.columns.contains(name) {
			return Ok(());
		}
		self.engine
			.create_cf(name, &self.options)
			.map_err(|source| StoreError::ColumnFamilyCreate { name: name.to_owned(), source })?;
		debug!("created column family {:?} on {:?}", name, self.path);
		inner.columns.insert(name.to_owned());
		Ok(())
	}

	/// Issue the next transaction id. Ids are strictly monotonic within the
	/// descriptor; exhausting the 32-bit space is an error, never a reuse.
	pub fn allocate_txn_id(&self) -> Result<u32> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(StoreError::DatabaseNotOpen);
		}
		if inner.next_txn_id == u32::MAX {
			return Err(StoreError::InvalidArgument("transaction id space exhausted".into()));
		}
		let id = inner.next_txn_id;
		inner.next_txn_id += 1;
		Ok(id)
	}

	pub fn txn_install(&self, id: u32, txn: Weak<TxnShared>) {
		self.inner.lock().txns.insert(id, txn);
	}

	/// The open transaction with this id, if the host still holds it.
	pub fn txn_get(&self, id: u32) -> Option<Arc<TxnShared>> {
		self.inner.lock().txns.get(&id).and_then(Weak::upgrade)
	}

	pub fn txn_remove(&self, id: u32) {
		self.inner.lock().txns.remove(&id);
	}

	#[cfg(test)]
	pub fn txn_count(&self) -> usize {
		self.inner.lock().txns.len()
	}

	pub fn attach(&self, closable: Weak<dyn Closable>) {
		let mut inner = self.inner.lock();
		inner.closables.retain(|weak| weak.upgrade().is_some());
		inner.closables.push(closable);
	}

	pub fn detach(&self, target: *const ()) {
		self.inner
			.lock()
			.closables
			.retain(|weak| weak.as_ptr() as *const () != target && weak.upgrade().is_some());
	}

	/// The transaction log store for `name`, constructed on first use.
	pub fn resolve_log_store(&self, name: &str) -> Result<Arc<TransactionLogStore>> {
		if name.is_empty() || name.contains(['/', '\\']) {
			return Err(StoreError::InvalidArgument(format!("invalid transaction log name {:?}", name)));
		}
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(StoreError::DatabaseNotOpen);
		}
		if let Some(store) = inner.log_stores.get(name) {
			return Ok(store.clone());
		}
		let dir = self.path.join("txnlog").join(name);
		let store = TransactionLogStore::open(dir, name, self.log_options)?;
		inner.log_stores.insert(name.to_owned(), store.clone());
		Ok(store)
	}

	/// Close every attached resource and shut the log stores down. Handles
	/// observe the closed flag and fail further operations; the engine itself
	/// is released once the last strong reference drops.
	pub fn close_all(&self) {
		let (closables, stores) = {
			let mut inner = self.inner.lock();
			if inner.closed {
				return;
			}
			inner.closed = true;
			(
				std::mem::take(&mut inner.closables),
				std::mem::take(&mut inner.log_stores),
			)
		};
		for closable in closables {
			if let Some(closable) = closable.upgrade() {
				closable.close_resource();
			}
		}
		for (name, store) in stores {
			if let Err(err) = store.flush() {
				warn!("failed to flush transaction log {:?} on close: {}", name, err);
			}
			store.shutdown();
		}
		debug!("closed database descriptor for {:?}", self.path);
	}
}

impl Drop for DbDescriptor {
	fn drop(&mut self) {
		// stores not already shut down by an explicit close still get their
		// queues drained before the engine goes away
		let inner = self.inner.get_mut();
		for store in inner.log_stores.values() {
			store.shutdown();
		}
		debug!("dropped database descriptor for {:?}", self.path);
	}
}
