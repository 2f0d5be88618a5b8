// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The transaction log store: an ordered set of log files with a background
//! batch writer.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::file::LogFile;
use crate::format::{
	batch_disk_size, block_offset, decode_entries, encode_entry, BlockHeader, BLOCK_HEADER_SIZE,
	BLOCK_SIZE, FILE_HEADER_SIZE,
};
use crate::mmap::MemoryMap;
use crate::{LogEntry, LogError, LogResult, Position};

const LOG_FILE_EXT: &str = "wlog";

/// Store tunables.
#[derive(Debug, Clone, Copy)]
pub struct LogStoreOptions {
	/// Rotate to a new file once appending would cross this size.
	pub max_file_size: u64,
	/// Unlink files wholly older than this; `None` keeps everything.
	pub retention: Option<Duration>,
}

impl Default for LogStoreOptions {
	fn default() -> Self {
		LogStoreOptions { max_file_size: 16 * 1024 * 1024, retention: None }
	}
}

struct PendingBatch {
	timestamp: f64,
	payload: Vec<u8>,
}

struct WriterState {
	pending: VecDeque<PendingBatch>,
	/// Durably written position (end of the last flushed batch).
	flushed: Position,
	/// Position acknowledged back to callers.
	committed: Position,
	/// Latched writer failure, surfaced by the next store operation.
	last_error: Option<String>,
	last_timestamp: f64,
	writer: Option<JoinHandle<()>>,
	/// A batch is being written outside the state lock.
	writing: bool,
	shutdown: bool,
}

/// An append-only store of timestamp-ordered entry batches, one directory of
/// sequence-numbered files per log name.
///
/// Batches are queued by committers and flushed by a lazily spawned writer
/// thread, one vectored write and one durable sync per batch. The newest
/// file is always the write target; sequence numbers are contiguous.
pub struct TransactionLogStore {
	name: String,
	dir: PathBuf,
	options: LogStoreOptions,
	/// Back-reference handed to the writer thread.
	me: Weak<TransactionLogStore>,
	files: RwLock<BTreeMap<u64, Arc<LogFile>>>,
	state: Mutex<WriterState>,
	work: Condvar,
}

impl TransactionLogStore {
	/// Open the store directory, recovering any existing files. A fresh store
	/// starts with file sequence 1.
	pub fn open(dir: PathBuf, name: &str, options: LogStoreOptions) -> LogResult<Arc<Self>> {
		fs::create_dir_all(&dir)?;

		let mut sequences = Vec::new();
		for entry in fs::read_dir(&dir)? {
			let entry = entry?;
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some(LOG_FILE_EXT) {
				continue;
			}
			if let Some(seq) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse::<u64>().ok()) {
				sequences.push(seq);
			}
		}
		sequences.sort_unstable();

		let mut files = BTreeMap::new();
		for pair in sequences.windows(2) {
			if pair[1] != pair[0] + 1 {
				return Err(LogError::Format(format!(
					"sequence-number gap in log {:?}: {} is followed by {}",
					name, pair[0], pair[1]
				)));
			}
		}
		for seq in &sequences {
			let file = LogFile::open(file_path(&dir, *seq), *seq)?;
			files.insert(*seq, Arc::new(file));
		}
		if files.is_empty() {
			let file = LogFile::create(file_path(&dir, 1), 1, now_ms())?;
			files.insert(1, Arc::new(file));
		}

		let newest = files.values().last().expect("a write target always exists; qed");
		let position = Position { sequence: newest.sequence(), offset: newest.append_offset() };
		let last_timestamp =
			files.values().map(|f| f.newest_timestamp()).fold(f64::MIN, f64::max);

		Ok(Arc::new_cyclic(|me| TransactionLogStore {
			name: name.to_owned(),
			dir,
			options,
			me: me.clone(),
			files: RwLock::new(files),
			state: Mutex::new(WriterState {
				pending: VecDeque::new(),
				flushed: position,
				committed: position,
				last_error: None,
				last_timestamp,
				writer: None,
				writing: false,
				shutdown: false,
			}),
			work: Condvar::new(),
		}))
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Queue a batch of entries for the background writer. Returns the batch
	/// timestamp assigned to the whole batch, strictly greater than any
	/// previously assigned one.
	pub fn append(&self, entries: &[LogEntry]) -> LogResult<f64> {
		let mut payload = Vec::new();
		for entry in entries {
			encode_entry(&mut payload, entry.txn_id, &entry.data);
		}

		let mut state = self.state.lock();
		if state.shutdown {
			return Err(LogError::Closed);
		}
		take_error(&mut state)?;
		let timestamp = next_timestamp(&mut state);
		state.pending.push_back(PendingBatch { timestamp, payload });
		self.ensure_writer(&mut state);
		self.work.notify_all();
		Ok(timestamp)
	}

	/// Queue a batch and block until it is durable.
	pub fn append_sync(&self, entries: &[LogEntry]) -> LogResult<f64> {
		let timestamp = self.append(entries)?;
		self.flush()?;
		Ok(timestamp)
	}

	/// Block until the pending queue is drained, then surface any latched
	/// writer error.
	pub fn flush(&self) -> LogResult<()> {
		let mut state = self.state.lock();
		while !state.pending.is_empty() || state.writing {
			if state.shutdown {
				return Err(LogError::Closed);
			}
			self.work.notify_all();
			self.work.wait(&mut state);
		}
		take_error(&mut state)
	}

	/// End of the durably written region.
	pub fn flushed_position(&self) -> Position {
		self.state.lock().flushed
	}

	/// End of the region acknowledged to callers.
	pub fn committed_position(&self) -> Position {
		self.state.lock().committed
	}

	/// Locate the first batch with a timestamp at or past `timestamp`: a
	/// binary search over the files' newest batch timestamps, then a block
	/// scan inside the located file.
	pub fn find_position(&self, timestamp: f64) -> LogResult<Option<Position>> {
		let files: Vec<Arc<LogFile>> = self.files.read().values().cloned().collect();
		let ix = files.partition_point(|f| f.newest_timestamp() < timestamp);
		let file = match files.get(ix) {
			Some(file) => file,
			None => return Ok(None),
		};
		for batch in file.batches()? {
			if batch.timestamp >= timestamp {
				return Ok(Some(Position { sequence: file.sequence(), offset: batch.offset }));
			}
		}
		Ok(None)
	}

	/// Shared read mapping of the file with the given sequence number.
	pub fn mapping(&self, sequence: u64) -> LogResult<Arc<MemoryMap>> {
		let file = self
			.files
			.read()
			.get(&sequence)
			.cloned()
			.ok_or(LogError::UnknownSequence(sequence))?;
		Ok(file.mapping()?)
	}

	/// Iterate decoded records from `from` (or the oldest retained batch) to
	/// the end of the flushed region.
	pub fn range(&self, from: Option<Position>) -> LogResult<LogRangeIter> {
		let files: VecDeque<Arc<LogFile>> = self
			.files
			.read()
			.values()
			.filter(|f| from.map_or(true, |p| f.sequence() >= p.sequence))
			.cloned()
			.collect();
		Ok(LogRangeIter { files, current: None, records: VecDeque::new(), from })
	}

	/// Unlink files wholly older than the retention window. Only a prefix of
	/// the sequence range is eligible, the write target and files with live
	/// mappings never are. Returns the number of files removed.
	pub fn prune(&self) -> usize {
		let retention = match self.options.retention {
			Some(retention) => retention,
			None => return 0,
		};
		let cutoff = now_ms() - retention.as_secs_f64() * 1000.0;
		let mut files = self.files.write();
		let newest = *files.keys().next_back().expect("a write target always exists; qed");

		let mut removed = 0;
		loop {
			let victim = match files.iter().next() {
				Some((seq, file))
					if *seq != newest
						&& file.newest_timestamp() < cutoff
						&& !file.has_live_mapping() =>
				{
					*seq
				}
				_ => break,
			};
			let file = files.remove(&victim).expect("key observed under the same lock; qed");
			if let Err(err) = fs::remove_file(file.path()) {
				warn!("failed to unlink expired log file {:?}: {}", file.path(), err);
				files.insert(victim, file);
				break;
			}
			debug!("pruned log file {} of {:?}", victim, self.name);
			removed += 1;
		}
		removed
	}

	/// Drain the queue, stop the writer and join it. Further appends fail
	/// with [`LogError::Closed`]. Idempotent.
	pub fn shutdown(&self) {
		let writer = {
			let mut state = self.state.lock();
			while (!state.pending.is_empty() || state.writing) && state.writer.is_some() {
				self.work.notify_all();
				self.work.wait(&mut state);
			}
			state.shutdown = true;
			self.work.notify_all();
			state.writer.take()
		};
		if let Some(writer) = writer {
			let _ = writer.join();
		}
	}

	fn ensure_writer(&self, state: &mut WriterState) {
		if state.writer.is_some() {
			return;
		}
		let store = self.me.upgrade().expect("the store is only reachable through its Arc; qed");
		let writer = thread::Builder::new()
			.name(format!("woofdb-txnlog-{}", self.name))
			.spawn(move || writer_loop(store))
			.expect("failed to spawn the transaction log writer thread");
		state.writer = Some(writer);
	}

	/// Write one batch, rotating the target file first if the batch would
	/// cross `max_file_size`. Returns the end position of the batch.
	fn write_batch(&self, batch: &PendingBatch) -> LogResult<Position> {
		let file = self.file_for_append(batch)?;
		file.append_batch(batch.timestamp, &batch.payload)?;
		Ok(Position { sequence: file.sequence(), offset: file.append_offset() })
	}

	fn file_for_append(&self, batch: &PendingBatch) -> LogResult<Arc<LogFile>> {
		let mut files = self.files.write();
		let current =
			files.values().next_back().cloned().expect("a write target always exists; qed");
		let needed = batch_disk_size(batch.payload.len());
		if current.is_batch_empty() || current.append_offset() + needed <= self.options.max_file_size {
			return Ok(current);
		}

		let sequence = current.sequence() + 1;
		debug!("rotating transaction log {:?} to sequence {}", self.name, sequence);
		let file = Arc::new(LogFile::create(
			file_path(&self.dir, sequence),
			sequence,
			batch.timestamp,
		)?);
		files.insert(sequence, file.clone());
		drop(files);
		self.prune();
		Ok(file)
	}
}

fn writer_loop(store: Arc<TransactionLogStore>) {
	loop {
		let batch = {
			let mut state = store.state.lock();
			loop {
				if state.shutdown {
					return;
				}
				if let Some(batch) = state.pending.pop_front() {
					state.writing = true;
					break batch;
				}
				store.work.notify_all();
				store.work.wait(&mut state);
			}
		};

		let result = store.write_batch(&batch);
		let mut state = store.state.lock();
		state.writing = false;
		match result {
			Ok(position) => {
				state.flushed = position;
				state.committed = position;
			}
			Err(err) => {
				warn!("transaction log {:?} flush failed: {}", store.name, err);
				state.last_error = Some(err.to_string());
			}
		}
		store.work.notify_all();
	}
}

/// A decoded entry together with the timestamp of the batch that carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
	pub timestamp: f64,
	pub txn_id: u32,
	pub data: Vec<u8>,
}

/// Iterator over the flushed records of a store, file by file via the shared
/// read mappings.
pub struct LogRangeIter {
	files: VecDeque<Arc<LogFile>>,
	current: Option<(Arc<MemoryMap>, u64)>,
	records: VecDeque<LogRecord>,
	from: Option<Position>,
}

impl LogRangeIter {
	/// Decode the next batch of the current file into `records`. `Ok(false)`
	/// means the store is exhausted.
	fn read_next_batch(&mut self) -> LogResult<bool> {
		loop {
			if self.current.is_none() {
				let file = match self.files.pop_front() {
					Some(file) => file,
					None => return Ok(false),
				};
				let map = file.mapping()?;
				self.current = Some((map, FILE_HEADER_SIZE as u64));
			}

			let (map, offset) = self.current.as_mut().expect("set above; qed");
			if *offset + BLOCK_HEADER_SIZE as u64 > map.len() as u64 {
				self.current = None;
				continue;
			}
			let header = BlockHeader::decode(&map[*offset as usize..])?;
			if header.len == 0 {
				self.current = None;
				continue;
			}

			let batch_offset = *offset;
			let block = (batch_offset - FILE_HEADER_SIZE as u64) / BLOCK_SIZE as u64;
			let mut payload = Vec::new();
			let mut blocks = 0u64;
			loop {
				let at = block_offset(block + blocks) as usize;
				if at + BLOCK_HEADER_SIZE > map.len() {
					return Err(LogError::Format("batch continuation past end of file".into()));
				}
				let current = BlockHeader::decode(&map[at..])?;
				let from = at + BLOCK_HEADER_SIZE;
				let to = from + current.len as usize;
				if to > map.len() {
					return Err(LogError::Format("block payload past end of file".into()));
				}
				payload.extend_from_slice(&map[from..to]);
				blocks += 1;
				if !current.continues() {
					break;
				}
			}
			*offset = block_offset(block + blocks);

			let sequence = map.sequence();
			if let Some(from) = self.from {
				if sequence == from.sequence && batch_offset < from.offset {
					continue;
				}
			}

			for (txn_id, data) in decode_entries(&payload)? {
				self.records.push_back(LogRecord { timestamp: header.timestamp, txn_id, data });
			}
			return Ok(true);
		}
	}
}

impl Iterator for LogRangeIter {
	type Item = LogResult<LogRecord>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if let Some(record) = self.records.pop_front() {
				return Some(Ok(record));
			}
			match self.read_next_batch() {
				Ok(true) => continue,
				Ok(false) => return None,
				Err(err) => {
					self.files.clear();
					self.current = None;
					return Some(Err(err));
				}
			}
		}
	}
}

fn file_path(dir: &std::path::Path, sequence: u64) -> PathBuf {
	dir.join(format!("{:010}.{}", sequence, LOG_FILE_EXT))
}

fn take_error(state: &mut WriterState) -> LogResult<()> {
	match state.last_error.take() {
		Some(msg) => Err(LogError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))),
		None => Ok(()),
	}
}

/// Assign the next batch timestamp, strictly monotonic even when the wall
/// clock stalls.
fn next_timestamp(state: &mut WriterState) -> f64 {
	let now = now_ms();
	let timestamp = if now <= state.last_timestamp { state.last_timestamp + 0.001 } else { now };
	state.last_timestamp = timestamp;
	timestamp
}

/// Milliseconds since the epoch as an IEEE-754 double.
pub fn now_ms() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs_f64() * 1000.0)
		.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn entry(txn_id: u32, data: &[u8]) -> LogEntry {
		LogEntry { txn_id, data: data.to_vec() }
	}

	fn open_store(dir: &std::path::Path, options: LogStoreOptions) -> Arc<TransactionLogStore> {
		TransactionLogStore::open(dir.join("audit"), "audit", options).unwrap()
	}

	#[test]
	fn append_and_read_back() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());

		store.append_sync(&[entry(1, b"one"), entry(1, b"two")]).unwrap();
		store.append_sync(&[entry(2, b"three")]).unwrap();

		let records: Vec<_> = store.range(None).unwrap().map(Result::unwrap).collect();
		assert_eq!(records.len(), 3);
		assert_eq!(records[0].txn_id, 1);
		assert_eq!(records[0].data, b"one");
		assert_eq!(records[2].txn_id, 2);
		assert_eq!(records[2].data, b"three");
		// both entries of the first batch share its timestamp
		assert_eq!(records[0].timestamp, records[1].timestamp);
		assert!(records[2].timestamp > records[1].timestamp);

		store.shutdown();
	}

	#[test]
	fn store_recovers_after_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = open_store(dir.path(), LogStoreOptions::default());
			store.append_sync(&[entry(5, b"persisted")]).unwrap();
			store.shutdown();
		}
		let store = open_store(dir.path(), LogStoreOptions::default());
		let records: Vec<_> = store.range(None).unwrap().map(Result::unwrap).collect();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].data, b"persisted");
		store.shutdown();
	}

	#[test]
	fn rotation_at_max_file_size() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(
			dir.path(),
			LogStoreOptions { max_file_size: 4096, retention: None },
		);

		// each batch occupies one whole block slot, so the second batch
		// would cross the 4096 byte limit and must go to file 2
		let first_ts = store.append_sync(&[entry(1, &vec![0u8; 600])]).unwrap();
		store.append_sync(&[entry(2, &vec![1u8; 600])]).unwrap();

		let flushed = store.flushed_position();
		assert_eq!(flushed.sequence, 2);
		assert!(dir.path().join("audit").join("0000000001.wlog").exists());
		assert!(dir.path().join("audit").join("0000000002.wlog").exists());

		// a timestamp within the first file resolves to (sequence 1, offset
		// at or past the file header)
		let position = store.find_position(first_ts).unwrap().unwrap();
		assert_eq!(position.sequence, 1);
		assert!(position.offset >= FILE_HEADER_SIZE as u64);

		// the whole range still reads across the rotation
		let records: Vec<_> = store.range(None).unwrap().map(Result::unwrap).collect();
		assert_eq!(records.len(), 2);
		assert_eq!(records[1].txn_id, 2);

		store.shutdown();
	}

	#[test]
	fn find_position_after_everything_is_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());
		let ts = store.append_sync(&[entry(1, b"x")]).unwrap();
		assert!(store.find_position(ts + 1000.0).unwrap().is_none());
		store.shutdown();
	}

	#[test]
	fn range_from_position_skips_earlier_batches() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());
		store.append_sync(&[entry(1, b"a")]).unwrap();
		let ts = store.append_sync(&[entry(2, b"b")]).unwrap();
		store.append_sync(&[entry(3, b"c")]).unwrap();

		let position = store.find_position(ts).unwrap().unwrap();
		let records: Vec<_> =
			store.range(Some(position)).unwrap().map(Result::unwrap).collect();
		assert_eq!(records.len(), 2);
		assert_eq!(records[0].data, b"b");
		assert_eq!(records[1].data, b"c");
		store.shutdown();
	}

	#[test]
	fn gap_in_sequence_numbers_is_fatal() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = open_store(
				dir.path(),
				LogStoreOptions { max_file_size: 4096, retention: None },
			);
			store.append_sync(&[entry(1, &vec![0u8; 600])]).unwrap();
			store.append_sync(&[entry(2, &vec![0u8; 600])]).unwrap();
			store.append_sync(&[entry(3, &vec![0u8; 600])]).unwrap();
			store.shutdown();
		}
		fs::remove_file(dir.path().join("audit").join("0000000002.wlog")).unwrap();
		let err = TransactionLogStore::open(
			dir.path().join("audit"),
			"audit",
			LogStoreOptions::default(),
		)
		.err()
		.unwrap();
		assert!(matches!(err, LogError::Format(_)));
	}

	#[test]
	fn retention_prunes_only_closed_prefix() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(
			dir.path(),
			LogStoreOptions { max_file_size: 4096, retention: Some(Duration::from_millis(0)) },
		);
		store.append_sync(&[entry(1, &vec![0u8; 600])]).unwrap();
		store.append_sync(&[entry(2, &vec![0u8; 600])]).unwrap();
		store.append_sync(&[entry(3, &vec![0u8; 600])]).unwrap();

		// everything is older than a zero retention window except the write
		// target, which is never pruned
		thread::sleep(Duration::from_millis(5));
		let removed = store.prune();
		assert_eq!(removed, 2);
		assert!(!dir.path().join("audit").join("0000000001.wlog").exists());
		assert!(dir.path().join("audit").join("0000000003.wlog").exists());
		store.shutdown();
	}

	#[test]
	fn live_mapping_blocks_pruning() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(
			dir.path(),
			LogStoreOptions { max_file_size: 4096, retention: Some(Duration::from_millis(0)) },
		);
		store.append_sync(&[entry(1, &vec![0u8; 600])]).unwrap();
		store.append_sync(&[entry(2, &vec![0u8; 600])]).unwrap();

		let map = store.mapping(1).unwrap();
		thread::sleep(Duration::from_millis(5));
		assert_eq!(store.prune(), 0);
		drop(map);
		assert_eq!(store.prune(), 1);
		store.shutdown();
	}

	#[test]
	fn append_after_shutdown_fails() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());
		store.shutdown();
		assert!(matches!(store.append(&[entry(1, b"x")]), Err(LogError::Closed)));
	}

	#[test]
	fn shutdown_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());
		store.append_sync(&[entry(1, b"x")]).unwrap();
		store.shutdown();
		store.shutdown();
	}

	#[test]
	fn timestamps_are_strictly_monotonic() {
		let dir = tempfile::tempdir().unwrap();
		let store = open_store(dir.path(), LogStoreOptions::default());
		let mut last = f64::MIN;
		for i in 0..100 {
			let ts = store.append(&[entry(i, b"t")]).unwrap();
			assert!(ts > last);
			last = ts;
		}
		store.flush().unwrap();
		store.shutdown();
	}
}
