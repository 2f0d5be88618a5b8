// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Embedding layer over a transactional, column-family-aware storage engine.
//!
//! Multiple host-side handles multiplex onto a single shared engine instance
//! per filesystem path. The layer coordinates transactions (optimistic and
//! pessimistic) with snapshot reads, bounded range iteration, named
//! serialized callback queues, and a user-facing append-only transaction log
//! with batched durable writes (see the `woofdb-txnlog` crate).
//!
//! ```no_run
//! use woofdb::{open, OpenOptions};
//!
//! let _embedder = woofdb::embedder_attach();
//! let db = open("/tmp/woof", &OpenOptions::default()).unwrap();
//! db.put(b"key", b"value").unwrap();
//! let txn = db.create_transaction().unwrap();
//! txn.put(b"key", b"newer").unwrap();
//! txn.commit_sync().unwrap();
//! ```

mod descriptor;
mod dispatch;
mod engine;
mod error;
mod handle;
mod iter;
mod locks;
mod registry;
mod settings;
mod stats;
mod txn;

pub use engine::{OpenOptions, TxnMode};
pub use error::{Result, StoreError};
pub use handle::{DbHandle, TransactionLog};
pub use iter::{RangeIter, RangeItem, RangeOptions};
pub use locks::LockCallback;
pub use registry::{registry, DbRegistry};
pub use settings::{settings, Settings, DEFAULT_BLOCK_CACHE_SIZE, DEFAULT_MAX_LOG_FILE_SIZE};
pub use stats::{IoStats, StatsKind};
pub use txn::DbTransaction;

pub use woofdb_txnlog::format::{
	BLOCK_HEADER_SIZE, BLOCK_SIZE, CONTINUATION_FLAG, FILE_HEADER_SIZE, TXN_HEADER_SIZE, WOOF_TOKEN,
};
pub use woofdb_txnlog::{LogEntry, LogError, LogRangeIter, LogRecord, MemoryMap, Position};

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;

/// Key type, inline up to 32 bytes.
pub type DbKey = SmallVec<[u8; 32]>;

/// Open a database, reusing the shared engine instance for its path. See
/// [`DbRegistry::open`].
pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<DbHandle> {
	registry().open(path, options)
}

static EMBEDDERS: AtomicUsize = AtomicUsize::new(0);

/// Keeps the process-wide singletons alive. When the last guard drops, every
/// descriptor is closed, the log stores are flushed, and the host dispatch
/// thread is joined.
#[must_use = "teardown runs when the guard drops"]
pub struct EmbedderGuard(());

/// Register an embedder. The registry and settings singletons stay up for at
/// least as long as the returned guard.
pub fn embedder_attach() -> EmbedderGuard {
	EMBEDDERS.fetch_add(1, Ordering::SeqCst);
	EmbedderGuard(())
}

impl Drop for EmbedderGuard {
	fn drop(&mut self) {
		if EMBEDDERS.fetch_sub(1, Ordering::SeqCst) == 1 {
			registry().purge_all();
			dispatch::dispatcher().shutdown();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;
	use std::time::Duration;

	fn keys_of(iter: RangeIter) -> Vec<Vec<u8>> {
		iter.map(|item| item.unwrap().0.to_vec()).collect()
	}

	fn seeded_db(dir: &Path) -> DbHandle {
		let db = open(dir, &OpenOptions::default()).unwrap();
		for key in [b"a", b"b", b"c", b"d", b"e"] {
			db.put(key, key).unwrap();
		}
		db
	}

	#[test]
	fn put_get_remove_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		assert!(db.get(b"k").unwrap().is_none());
		db.put(b"k", b"\x00\xFFbytes\x01").unwrap();
		assert_eq!(db.get(b"k").unwrap().unwrap(), b"\x00\xFFbytes\x01");
		db.remove(b"k").unwrap();
		assert!(db.get(b"k").unwrap().is_none());
	}

	#[test]
	fn commit_publishes_abort_discards() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		let txn = db.create_transaction().unwrap();
		txn.put(b"x", b"1").unwrap();
		txn.commit_sync().unwrap();
		assert_eq!(db.get(b"x").unwrap().unwrap(), b"1");

		let txn = db.create_transaction().unwrap();
		txn.put(b"x", b"2").unwrap();
		txn.abort().unwrap();
		assert_eq!(db.get(b"x").unwrap().unwrap(), b"1");
	}

	#[test]
	fn async_commit_completes_on_the_dispatch_thread() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		let txn = db.create_transaction().unwrap();
		txn.put(b"x", b"async").unwrap();
		let (tx, rx) = mpsc::channel();
		txn.commit(move |result| {
			tx.send(result.is_ok()).unwrap();
		});
		assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
		assert_eq!(db.get(b"x").unwrap().unwrap(), b"async");
	}

	#[test]
	fn async_get_completes_with_the_snapshot_value() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		db.put(b"k", b"v").unwrap();

		let txn = db.create_transaction().unwrap();
		let (tx, rx) = mpsc::channel();
		txn.get_async(b"k", move |result| {
			tx.send(result.unwrap().unwrap()).unwrap();
		});
		assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), b"v");
		txn.abort().unwrap();
	}

	#[test]
	fn snapshot_reads_ignore_later_writes() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		db.put(b"k", b"before").unwrap();

		let txn = db.create_transaction().unwrap();
		db.put(b"k", b"after").unwrap();
		assert_eq!(txn.get(b"k").unwrap().unwrap(), b"before");
		txn.abort().unwrap();
		assert_eq!(db.get(b"k").unwrap().unwrap(), b"after");
	}

	#[test]
	fn transaction_sees_its_own_writes() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		let txn = db.create_transaction().unwrap();
		txn.put(b"k", b"mine").unwrap();
		assert_eq!(txn.get(b"k").unwrap().unwrap(), b"mine");
		assert!(db.get(b"k").unwrap().is_none(), "uncommitted writes stay private");
		txn.commit_sync().unwrap();
	}

	#[test]
	fn optimistic_conflict_surfaces_as_conflict() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		let first = db.create_transaction().unwrap();
		let second = db.create_transaction().unwrap();
		first.put(b"k", b"1").unwrap();
		second.put(b"k", b"2").unwrap();
		first.commit_sync().unwrap();
		assert!(matches!(second.commit_sync(), Err(StoreError::Conflict(_))));
		assert_eq!(db.get(b"k").unwrap().unwrap(), b"1");
	}

	#[test]
	fn pessimistic_mode_commits() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::with_mode(TxnMode::Pessimistic)).unwrap();

		db.put(b"base", b"v").unwrap();
		let txn = db.create_transaction().unwrap();
		txn.put(b"k", b"locked").unwrap();
		assert_eq!(txn.get(b"base").unwrap().unwrap(), b"v");
		txn.commit_sync().unwrap();
		assert_eq!(db.get(b"k").unwrap().unwrap(), b"locked");
	}

	#[test]
	fn transaction_ids_are_monotonic_and_tracked() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let descriptor = db.descriptor_for_tests();

		let first = db.create_transaction().unwrap();
		let second = db.create_transaction().unwrap();
		assert!(second.id() > first.id());

		// registered while open, gone after commit/abort
		assert!(descriptor.txn_get(first.id()).is_some());
		first.commit_sync().unwrap();
		assert!(descriptor.txn_get(first.id()).is_none());
		second.abort().unwrap();
		assert_eq!(descriptor.txn_count(), 0);
	}

	#[test]
	fn closed_transaction_refuses_operations() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		let txn = db.create_transaction().unwrap();
		txn.commit_sync().unwrap();
		assert!(!txn.is_open());
		assert!(matches!(txn.get(b"k"), Err(StoreError::TxnClosed)));
		assert!(matches!(txn.put(b"k", b"v"), Err(StoreError::TxnClosed)));
		assert!(matches!(txn.abort(), Err(StoreError::TxnClosed)));
		assert!(matches!(txn.commit_sync(), Err(StoreError::TxnClosed)));
		// close stays idempotent
		txn.close();
		txn.close();
	}

	#[test]
	fn range_bound_algebra() {
		let dir = tempfile::tempdir().unwrap();
		let db = seeded_db(dir.path());

		let mut options = RangeOptions::between(b"b", b"d");
		options.exclusive_start = true;
		options.inclusive_end = true;
		assert_eq!(keys_of(db.range(&options).unwrap()), vec![b"c".to_vec(), b"d".to_vec()]);

		options.reverse = true;
		assert_eq!(keys_of(db.range(&options).unwrap()), vec![b"d".to_vec(), b"c".to_vec()]);
	}

	#[test]
	fn range_default_bounds() {
		let dir = tempfile::tempdir().unwrap();
		let db = seeded_db(dir.path());

		// inclusive start, exclusive end
		let options = RangeOptions::between(b"b", b"d");
		assert_eq!(keys_of(db.range(&options).unwrap()), vec![b"b".to_vec(), b"c".to_vec()]);

		// unbounded
		assert_eq!(keys_of(db.range(&RangeOptions::default()).unwrap()).len(), 5);
	}

	#[test]
	fn range_emits_values_only_when_asked() {
		let dir = tempfile::tempdir().unwrap();
		let db = seeded_db(dir.path());

		let mut with_values = db.range(&RangeOptions::between(b"a", b"b")).unwrap();
		let (key, value) = with_values.next().unwrap().unwrap();
		assert_eq!(&*key, b"a");
		assert_eq!(value.as_deref(), Some(&b"a"[..]));

		let mut options = RangeOptions::between(b"a", b"b");
		options.values = false;
		let mut keys_only = db.range(&options).unwrap();
		let (key, value) = keys_only.next().unwrap().unwrap();
		assert_eq!(&*key, b"a");
		assert!(value.is_none());
	}

	#[test]
	fn transaction_range_observes_buffered_writes() {
		let dir = tempfile::tempdir().unwrap();
		let db = seeded_db(dir.path());

		let txn = db.create_transaction().unwrap();
		txn.put(b"bb", b"bb").unwrap();
		let keys = keys_of(txn.range(&RangeOptions::between(b"b", b"c")).unwrap());
		assert_eq!(keys, vec![b"b".to_vec(), b"bb".to_vec()]);
		txn.abort().unwrap();
	}

	#[test]
	fn iterator_close_is_idempotent_and_final() {
		let dir = tempfile::tempdir().unwrap();
		let db = seeded_db(dir.path());

		let mut iter = db.range(&RangeOptions::default()).unwrap();
		assert!(iter.next().is_some());
		iter.close();
		iter.close();
		assert!(iter.next().is_none());
	}

	#[test]
	fn handle_close_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		assert!(db.is_open());
		db.close();
		db.close();
		assert!(!db.is_open());
		assert!(matches!(db.get(b"k"), Err(StoreError::DatabaseNotOpen)));
		assert!(matches!(db.create_transaction(), Err(StoreError::DatabaseNotOpen)));
	}

	#[test]
	fn lock_callbacks_serialize_per_key() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let (tx, rx) = mpsc::channel();

		for i in 1..=3 {
			let tx = tx.clone();
			let started = db
				.lock_call("fingerprint", move || {
					tx.send(i).unwrap();
				})
				.unwrap();
			assert_eq!(started, i == 1);
		}

		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
		assert!(rx.try_recv().is_err());
		db.lock_release("fingerprint").unwrap();
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
		db.lock_release("fingerprint").unwrap();
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
		db.lock_release("fingerprint").unwrap();
	}

	#[test]
	fn committed_entries_reach_the_transaction_log() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let log = db.transaction_log("audit").unwrap();

		let txn = db.create_transaction().unwrap();
		let id = txn.id();
		txn.put(b"k", b"v").unwrap();
		log.add_entry(&txn, b"entry-1").unwrap();
		log.add_entry(&txn, b"entry-2").unwrap();
		txn.commit_sync().unwrap();

		let records: Vec<_> = log.range(None).unwrap().map(|r| r.unwrap()).collect();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].txn_id, id);
		assert_eq!(records[0].data, b"entry-1");
		assert_eq!(records[1].data, b"entry-2");
		assert_eq!(records[0].timestamp, records[1].timestamp);
	}

	#[test]
	fn entries_can_be_added_by_transaction_id() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let log = db.transaction_log("audit").unwrap();

		let txn = db.create_transaction().unwrap();
		log.add_entry_by_id(txn.id(), b"by-id").unwrap();
		let missing = txn.id() + 1;
		assert!(matches!(log.add_entry_by_id(missing, b"nope"), Err(StoreError::TxnClosed)));
		txn.commit_sync().unwrap();
		// the id no longer resolves once the transaction closed
		assert!(matches!(log.add_entry_by_id(txn.id(), b"late"), Err(StoreError::TxnClosed)));

		let records: Vec<_> = log.range(None).unwrap().map(|r| r.unwrap()).collect();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].data, b"by-id");
	}

	#[test]
	fn aborted_entries_never_reach_the_log() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let log = db.transaction_log("audit").unwrap();

		let txn = db.create_transaction().unwrap();
		log.add_entry(&txn, b"discarded").unwrap();
		txn.abort().unwrap();

		assert_eq!(log.range(None).unwrap().count(), 0);
	}

	#[test]
	fn a_transaction_binds_to_one_log() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let first = db.transaction_log("first").unwrap();
		let second = db.transaction_log("second").unwrap();

		let txn = db.create_transaction().unwrap();
		first.add_entry(&txn, b"ok").unwrap();
		assert!(matches!(
			second.add_entry(&txn, b"nope"),
			Err(StoreError::LogAlreadyBound(name)) if name == "first"
		));
		// the bound log keeps accepting
		first.add_entry(&txn, b"still ok").unwrap();
		txn.abort().unwrap();
	}

	#[test]
	fn log_stores_are_shared_per_name() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();
		let log_a = db.transaction_log("audit").unwrap();
		let log_b = db.transaction_log("audit").unwrap();

		let txn = db.create_transaction().unwrap();
		log_a.add_entry(&txn, b"entry").unwrap();
		// the same store backs both surfaces, so no LogAlreadyBound here
		log_b.add_entry(&txn, b"entry").unwrap();
		txn.commit_sync().unwrap();
		assert_eq!(log_b.range(None).unwrap().count(), 2);
	}

	#[test]
	fn io_stats_observe_traffic() {
		let dir = tempfile::tempdir().unwrap();
		let db = open(dir.path(), &OpenOptions::default()).unwrap();

		db.put(b"k", b"value").unwrap();
		db.get(b"k").unwrap();
		let txn = db.create_transaction().unwrap();
		txn.put(b"t", b"v").unwrap();
		txn.commit_sync().unwrap();

		let stats = db.io_stats(StatsKind::Overall).unwrap();
		assert!(stats.writes >= 2);
		assert!(stats.reads >= 1);
		assert!(stats.bytes_written >= 8);
		assert_eq!(stats.transactions, 1);
	}

	#[test]
	fn log_file_constants_are_exported() {
		assert_eq!(WOOF_TOKEN, 0x574F_4F46);
		assert_eq!(FILE_HEADER_SIZE, 13);
		assert_eq!(BLOCK_HEADER_SIZE, 13);
		assert_eq!(TXN_HEADER_SIZE, 8);
		assert_eq!(CONTINUATION_FLAG & 1, CONTINUATION_FLAG);
		assert_eq!(BLOCK_SIZE % 2, 0);
	}
}
