// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The storage engine behind a descriptor: one RocksDB instance per path,
//! opened in the transaction mode the descriptor was created with.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use rocksdb::{
	BlockBasedOptions, BoundColumnFamily, ColumnFamilyDescriptor, DBRawIteratorWithThreadMode,
	MultiThreaded, OptimisticTransactionDB, OptimisticTransactionOptions, Options, ReadOptions,
	SnapshotWithThreadMode, Transaction, TransactionDB, TransactionDBOptions, TransactionOptions,
	WriteOptions, DB,
};

use crate::error::{Result, StoreError};
use crate::settings::settings;

type OptimisticDb = OptimisticTransactionDB<MultiThreaded>;
type PessimisticDb = TransactionDB<MultiThreaded>;

const CF_PROOF: &str = "column families are created before they are used; qed";
const CORRUPTION_FILE_NAME: &str = "CORRUPTED";

/// Conflict-detection mode of a descriptor, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
	/// Check for conflicts at commit.
	Optimistic,
	/// Take row locks at access, with a lock timeout.
	Pessimistic,
}

impl fmt::Display for TxnMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TxnMode::Optimistic => f.write_str("optimistic"),
			TxnMode::Pessimistic => f.write_str("pessimistic"),
		}
	}
}

/// Options accepted by [`open`](crate::open).
#[derive(Debug, Clone)]
pub struct OpenOptions {
	/// Column family served by the returned handle.
	pub column: String,
	pub mode: TxnMode,
	/// Background engine threads; `None` sizes from the CPU count.
	pub parallelism: Option<u32>,
	/// Opt out of the process-wide shared block cache.
	pub no_block_cache: bool,
	/// Skip the engine write-ahead log for writes through this database.
	pub disable_wal: bool,
	/// Lock timeout for pessimistic transactions.
	pub lock_timeout: Duration,
	/// Transaction log retention; `None` falls back to the process setting.
	pub log_retention: Option<Duration>,
	/// Transaction log rotation threshold; `None` falls back to the process
	/// setting.
	pub max_log_file_size: Option<u64>,
}

impl Default for OpenOptions {
	fn default() -> Self {
		OpenOptions {
			column: rocksdb::DEFAULT_COLUMN_FAMILY_NAME.to_owned(),
			mode: TxnMode::Optimistic,
			parallelism: None,
			no_block_cache: false,
			disable_wal: false,
			lock_timeout: Duration::from_millis(10_000),
			log_retention: None,
			max_log_file_size: None,
		}
	}
}

impl OpenOptions {
	pub fn with_column(column: &str) -> Self {
		OpenOptions { column: column.to_owned(), ..Default::default() }
	}

	pub fn with_mode(mode: TxnMode) -> Self {
		OpenOptions { mode, ..Default::default() }
	}

	pub(crate) fn validate(&self) -> Result<()> {
		if self.column.is_empty() {
			return Err(StoreError::InvalidArgument("column family name must not be empty".into()));
		}
		if self.parallelism == Some(0) {
			return Err(StoreError::InvalidArgument("parallelism must be at least one thread".into()));
		}
		Ok(())
	}
}

enum EngineKind {
	Optimistic(OptimisticDb),
	Pessimistic(PessimisticDb),
}

/// The open engine instance plus the path it serves.
pub(crate) struct Engine {
	path: PathBuf,
	kind: EngineKind,
}

impl Engine {
	/// Open the engine at `path`, creating it and any missing column
	/// families. Returns the engine and the full set of column family names
	/// present after the open.
	pub(crate) fn open(path: &Path, options: &OpenOptions) -> Result<(Engine, Vec<String>)> {
		let db_opts = generate_options(options);
		let block_opts = generate_block_based_options(options);

		// attempt repair if a previous session marked the engine corrupted
		let marker = path.join(CORRUPTION_FILE_NAME);
		if marker.exists() {
			warn!("engine at {:?} was marked corrupted, attempting repair", path);
			DB::repair(&db_opts, path).map_err(|err| StoreError::EngineOpen(err.to_string()))?;
			fs::remove_file(&marker).map_err(|err| StoreError::EngineOpen(err.to_string()))?;
		}

		let mut columns = DB::list_cf(&db_opts, path).unwrap_or_default();
		if columns.is_empty() {
			columns.push(rocksdb::DEFAULT_COLUMN_FAMILY_NAME.to_owned());
		}
		if !columns.iter().any(|name| name == &options.column) {
			columns.push(options.column.clone());
		}

		let kind = match open_kind(&db_opts, &block_opts, path, options, &columns) {
			Ok(kind) => kind,
			Err(err) if is_corrupted(&err) => {
				warn!("engine at {:?} corrupted: {}, attempting repair", path, err);
				DB::repair(&db_opts, path).map_err(|err| StoreError::EngineOpen(err.to_string()))?;
				open_kind(&db_opts, &block_opts, path, options, &columns)
					.map_err(|err| StoreError::EngineOpen(err.to_string()))?
			}
			Err(err) => return Err(StoreError::EngineOpen(err.to_string())),
		};
		debug!("opened {} engine at {:?} with {} column families", options.mode, path, columns.len());
		Ok((Engine { path: path.to_owned(), kind }, columns))
	}

	pub(crate) fn create_cf(&self, name: &str, options: &OpenOptions) -> Result<(), rocksdb::Error> {
		let block_opts = generate_block_based_options(options);
		let cf_opts = column_options(&block_opts);
		match &self.kind {
			EngineKind::Optimistic(db) => db.create_cf(name, &cf_opts),
			EngineKind::Pessimistic(db) => db.create_cf(name, &cf_opts),
		}
	}

	pub(crate) fn get(
		&self,
		column: &str,
		key: &[u8],
		readopts: &ReadOptions,
	) -> Result<Option<Vec<u8>>, rocksdb::Error> {
		match &self.kind {
			EngineKind::Optimistic(db) => db
				.get_pinned_cf_opt(&self.cf_optimistic(db, column), key, readopts)
				.map(|value| value.map(|v| v.as_ref().to_vec())),
			EngineKind::Pessimistic(db) => db
				.get_pinned_cf_opt(&self.cf_pessimistic(db, column), key, readopts)
				.map(|value| value.map(|v| v.as_ref().to_vec())),
		}
	}

	pub(crate) fn put(
		&self,
		column: &str,
		key: &[u8],
		value: &[u8],
		disable_wal: bool,
	) -> Result<(), rocksdb::Error> {
		let writeopts = write_options(disable_wal);
		let result = match &self.kind {
			EngineKind::Optimistic(db) => {
				db.put_cf_opt(&self.cf_optimistic(db, column), key, value, &writeopts)
			}
			EngineKind::Pessimistic(db) => {
				// direct writes on the pessimistic engine go through a
				// short transaction so the write options still apply
				let txn = db.transaction_opt(&writeopts, &TransactionOptions::default());
				txn.put_cf(&self.cf_pessimistic(db, column), key, value)?;
				txn.commit()
			}
		};
		self.check_for_corruption(result)
	}

	pub(crate) fn delete(
		&self,
		column: &str,
		key: &[u8],
		disable_wal: bool,
	) -> Result<(), rocksdb::Error> {
		let writeopts = write_options(disable_wal);
		let result = match &self.kind {
			EngineKind::Optimistic(db) => {
				db.delete_cf_opt(&self.cf_optimistic(db, column), key, &writeopts)
			}
			EngineKind::Pessimistic(db) => {
				let txn = db.transaction_opt(&writeopts, &TransactionOptions::default());
				txn.delete_cf(&self.cf_pessimistic(db, column), key)?;
				txn.commit()
			}
		};
		self.check_for_corruption(result)
	}

	/// Force a memtable flush of one column family.
	pub(crate) fn flush(&self, column: &str) -> Result<()> {
		match &self.kind {
			EngineKind::Optimistic(db) => {
				db.flush_cf(&self.cf_optimistic(db, column)).map_err(StoreError::Engine)
			}
			// the pessimistic engine does not expose a direct memtable flush
			EngineKind::Pessimistic(_) => Err(StoreError::InvalidArgument(
				"flush is not supported by the pessimistic engine".into(),
			)),
		}
	}

	/// Begin an engine transaction with a snapshot taken at creation time.
	pub(crate) fn begin_txn(&self, disable_wal: bool, lock_timeout: Duration) -> EngineTxn {
		let writeopts = write_options(disable_wal);
		match &self.kind {
			EngineKind::Optimistic(db) => {
				let mut txn_opts = OptimisticTransactionOptions::default();
				txn_opts.set_snapshot(true);
				let txn = db.transaction_opt(&writeopts, &txn_opts);
				// SAFETY: the engine is owned by the descriptor and every
				// transaction holds an `Arc` of that descriptor, dropping the
				// engine transaction first; qed
				EngineTxn::Optimistic(unsafe {
					std::mem::transmute::<Transaction<'_, OptimisticDb>, Transaction<'static, OptimisticDb>>(txn)
				})
			}
			EngineKind::Pessimistic(db) => {
				let mut txn_opts = TransactionOptions::default();
				txn_opts.set_snapshot(true);
				txn_opts.set_lock_timeout(lock_timeout.as_millis() as i64);
				let txn = db.transaction_opt(&writeopts, &txn_opts);
				// SAFETY: as above; qed
				EngineTxn::Pessimistic(unsafe {
					std::mem::transmute::<Transaction<'_, PessimisticDb>, Transaction<'static, PessimisticDb>>(txn)
				})
			}
		}
	}

	/// Raw engine iterator over one column family.
	///
	/// The returned iterator borrows the engine with an erased lifetime: the
	/// caller must hold the owning descriptor alive and close the iterator
	/// through the closable walk before teardown.
	pub(crate) fn raw_iterator(&self, column: &str, readopts: ReadOptions) -> RawEngineIter {
		match &self.kind {
			EngineKind::Optimistic(db) => {
				let iter = db.raw_iterator_cf_opt(&self.cf_optimistic(db, column), readopts);
				// SAFETY: see above; qed
				RawEngineIter::Db(unsafe { std::mem::transmute(iter) })
			}
			EngineKind::Pessimistic(db) => {
				let iter = db.raw_iterator_cf_opt(&self.cf_pessimistic(db, column), readopts);
				// SAFETY: see above; qed
				RawEngineIter::PessimisticDb(unsafe { std::mem::transmute(iter) })
			}
		}
	}

	/// Record a corruption marker so the next open attempts repair.
	fn check_for_corruption<T>(&self, result: Result<T, rocksdb::Error>) -> Result<T, rocksdb::Error> {
		if let Err(ref err) = result {
			if err.kind() == rocksdb::ErrorKind::Corruption {
				warn!("engine at {:?} corrupted: {}. Repair will be triggered on next open", self.path, err);
				let _ = fs::File::create(self.path.join(CORRUPTION_FILE_NAME));
			}
		}
		result
	}

	fn cf_optimistic<'a>(&self, db: &'a OptimisticDb, column: &str) -> Arc<BoundColumnFamily<'a>> {
		db.cf_handle(column).expect(CF_PROOF)
	}

	fn cf_pessimistic<'a>(&self, db: &'a PessimisticDb, column: &str) -> Arc<BoundColumnFamily<'a>> {
		db.cf_handle(column).expect(CF_PROOF)
	}
}

fn open_kind(
	db_opts: &Options,
	block_opts: &BlockBasedOptions,
	path: &Path,
	options: &OpenOptions,
	columns: &[String],
) -> Result<EngineKind, rocksdb::Error> {
	let descriptors: Vec<ColumnFamilyDescriptor> = columns
		.iter()
		.map(|name| ColumnFamilyDescriptor::new(name, column_options(block_opts)))
		.collect();
	match options.mode {
		TxnMode::Optimistic => {
			OptimisticTransactionDB::open_cf_descriptors(db_opts, path, descriptors)
				.map(EngineKind::Optimistic)
		}
		TxnMode::Pessimistic => {
			let mut txn_db_opts = TransactionDBOptions::default();
			let timeout = options.lock_timeout.as_millis() as i64;
			txn_db_opts.set_txn_lock_timeout(timeout);
			txn_db_opts.set_default_lock_timeout(timeout);
			TransactionDB::open_cf_descriptors(db_opts, &txn_db_opts, path, descriptors)
				.map(EngineKind::Pessimistic)
		}
	}
}

fn is_corrupted(err: &rocksdb::Error) -> bool {
	err.kind() == rocksdb::ErrorKind::Corruption
		|| err.as_ref().starts_with("Invalid argument: You have to open all column families")
}

/// Generate the engine options from the open options.
fn generate_options(options: &OpenOptions) -> Options {
	let mut opts = Options::default();
	opts.create_if_missing(true);
	opts.create_missing_column_families(true);
	opts.set_use_fsync(false);
	opts.set_bytes_per_sync(1024 * 1024);
	opts.set_keep_log_file_num(1);
	opts.set_enable_blob_files(true);
	let threads = options
		.parallelism
		.map(|threads| threads as i32)
		.unwrap_or_else(|| std::cmp::max(1, num_cpus::get() as i32 / 2));
	opts.increase_parallelism(threads);
	opts
}

/// Generate the block based options, wiring in the shared block cache unless
/// the open opted out.
fn generate_block_based_options(options: &OpenOptions) -> BlockBasedOptions {
	let mut block_opts = BlockBasedOptions::default();
	if !options.no_block_cache {
		block_opts.set_block_cache(&settings().block_cache());
	}
	block_opts.set_cache_index_and_filter_blocks(true);
	block_opts.set_pin_l0_filter_and_index_blocks_in_cache(true);
	block_opts.set_bloom_filter(10.0, true);
	block_opts
}

fn column_options(block_opts: &BlockBasedOptions) -> Options {
	let mut opts = Options::default();
	opts.set_level_compaction_dynamic_level_bytes(true);
	opts.set_block_based_table_factory(block_opts);
	opts
}

pub(crate) fn write_options(disable_wal: bool) -> WriteOptions {
	let mut writeopts = WriteOptions::default();
	writeopts.disable_wal(disable_wal);
	writeopts
}

pub(crate) fn read_options() -> ReadOptions {
	let mut readopts = ReadOptions::default();
	readopts.set_verify_checksums(false);
	readopts
}

/// An open engine transaction in the mode of its descriptor.
///
/// The transaction was begun with `set_snapshot`, so the engine pinned a
/// snapshot at creation. Reads and iterators fetch that snapshot per call:
/// the wrapper returned by the engine is a short-lived view of a snapshot
/// the transaction itself owns, and read options copy the underlying
/// pointer, so the wrapper never has to outlive the call.
pub(crate) enum EngineTxn {
	Optimistic(Transaction<'static, OptimisticDb>),
	Pessimistic(Transaction<'static, PessimisticDb>),
}

fn snapshot_read_options<D: rocksdb::DBAccess>(snapshot: &SnapshotWithThreadMode<'_, D>) -> ReadOptions {
	let mut readopts = read_options();
	readopts.set_snapshot(snapshot);
	readopts
}

impl EngineTxn {
	pub(crate) fn get(
		&self,
		engine: &Engine,
		column: &str,
		key: &[u8],
	) -> Result<Option<Vec<u8>>, rocksdb::Error> {
		match (self, &engine.kind) {
			(EngineTxn::Optimistic(txn), EngineKind::Optimistic(db)) => {
				let snapshot = txn.snapshot();
				let readopts = snapshot_read_options(&snapshot);
				txn.get_pinned_cf_opt(&engine.cf_optimistic(db, column), key, &readopts)
					.map(|value| value.map(|v| v.as_ref().to_vec()))
			}
			(EngineTxn::Pessimistic(txn), EngineKind::Pessimistic(db)) => {
				let snapshot = txn.snapshot();
				let readopts = snapshot_read_options(&snapshot);
				txn.get_pinned_cf_opt(&engine.cf_pessimistic(db, column), key, &readopts)
					.map(|value| value.map(|v| v.as_ref().to_vec()))
			}
			_ => unreachable!("a transaction always matches the mode of its engine; qed"),
		}
	}

	pub(crate) fn put(
		&self,
		engine: &Engine,
		column: &str,
		key: &[u8],
		value: &[u8],
	) -> Result<(), rocksdb::Error> {
		match (self, &engine.kind) {
			(EngineTxn::Optimistic(txn), EngineKind::Optimistic(db)) => {
				txn.put_cf(&engine.cf_optimistic(db, column), key, value)
			}
			(EngineTxn::Pessimistic(txn), EngineKind::Pessimistic(db)) => {
				txn.put_cf(&engine.cf_pessimistic(db, column), key, value)
			}
			_ => unreachable!("a transaction always matches the mode of its engine; qed"),
		}
	}

	pub(crate) fn delete(
		&self,
		engine: &Engine,
		column: &str,
		key: &[u8],
	) -> Result<(), rocksdb::Error> {
		match (self, &engine.kind) {
			(EngineTxn::Optimistic(txn), EngineKind::Optimistic(db)) => {
				txn.delete_cf(&engine.cf_optimistic(db, column), key)
			}
			(EngineTxn::Pessimistic(txn), EngineKind::Pessimistic(db)) => {
				txn.delete_cf(&engine.cf_pessimistic(db, column), key)
			}
			_ => unreachable!("a transaction always matches the mode of its engine; qed"),
		}
	}

	pub(crate) fn commit(self, engine: &Engine) -> Result<(), rocksdb::Error> {
		let result = match self {
			EngineTxn::Optimistic(txn) => txn.commit(),
			EngineTxn::Pessimistic(txn) => txn.commit(),
		};
		engine.check_for_corruption(result)
	}

	pub(crate) fn rollback(&self) -> Result<(), rocksdb::Error> {
		match self {
			EngineTxn::Optimistic(txn) => txn.rollback(),
			EngineTxn::Pessimistic(txn) => txn.rollback(),
		}
	}

	/// Raw iterator over the transaction's view, snapshot applied.
	///
	/// Same lifetime contract as [`Engine::raw_iterator`], with the
	/// transaction itself standing in for the engine.
	pub(crate) fn raw_iterator(
		&self,
		engine: &Engine,
		column: &str,
		mut readopts: ReadOptions,
	) -> RawEngineIter {
		match (self, &engine.kind) {
			(EngineTxn::Optimistic(txn), EngineKind::Optimistic(db)) => {
				let snapshot = txn.snapshot();
				readopts.set_snapshot(&snapshot);
				let iter = txn.raw_iterator_cf_opt(&engine.cf_optimistic(db, column), readopts);
				// SAFETY: see above; qed
				RawEngineIter::Txn(unsafe { std::mem::transmute(iter) })
			}
			(EngineTxn::Pessimistic(txn), EngineKind::Pessimistic(db)) => {
				let snapshot = txn.snapshot();
				readopts.set_snapshot(&snapshot);
				let iter = txn.raw_iterator_cf_opt(&engine.cf_pessimistic(db, column), readopts);
				// SAFETY: see above; qed
				RawEngineIter::PessimisticTxn(unsafe { std::mem::transmute(iter) })
			}
			_ => unreachable!("a transaction always matches the mode of its engine; qed"),
		}
	}
}

/// A raw engine iterator over any of the four read sources.
pub(crate) enum RawEngineIter {
	Db(DBRawIteratorWithThreadMode<'static, OptimisticDb>),
	PessimisticDb(DBRawIteratorWithThreadMode<'static, PessimisticDb>),
	Txn(DBRawIteratorWithThreadMode<'static, Transaction<'static, OptimisticDb>>),
	PessimisticTxn(DBRawIteratorWithThreadMode<'static, Transaction<'static, PessimisticDb>>),
}

macro_rules! each_iter {
	($self:expr, $iter:ident => $body:expr) => {
		match $self {
			RawEngineIter::Db($iter) => $body,
			RawEngineIter::PessimisticDb($iter) => $body,
			RawEngineIter::Txn($iter) => $body,
			RawEngineIter::PessimisticTxn($iter) => $body,
		}
	};
}

impl RawEngineIter {
	pub fn seek_to_first(&mut self) {
		each_iter!(self, iter => iter.seek_to_first())
	}

	pub fn seek_to_last(&mut self) {
		each_iter!(self, iter => iter.seek_to_last())
	}

	pub fn next(&mut self) {
		each_iter!(self, iter => iter.next())
	}

	pub fn prev(&mut self) {
		each_iter!(self, iter => iter.prev())
	}

	pub fn valid(&self) -> bool {
		each_iter!(self, iter => iter.valid())
	}

	pub fn key(&self) -> Option<&[u8]> {
		each_iter!(self, iter => iter.key())
	}

	pub fn value(&self) -> Option<&[u8]> {
		each_iter!(self, iter => iter.value())
	}

	pub fn status(&self) -> Result<(), rocksdb::Error> {
		each_iter!(self, iter => iter.status())
	}
}
