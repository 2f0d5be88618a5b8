// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A single transaction log file, addressed by sequence number.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::format::{
	block_offset, blocks_for, BlockHeader, FileHeader, BLOCK_HEADER_SIZE, BLOCK_PAYLOAD,
	CONTINUATION_FLAG, FILE_HEADER_SIZE,
};
use crate::mmap::MemoryMap;
use crate::{LogError, LogResult};

/// One batch as found on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchInfo {
	/// Offset of the batch's first block.
	pub offset: u64,
	pub timestamp: f64,
	/// Total payload bytes across all blocks of the batch.
	pub payload_len: u64,
	/// Block slots the batch occupies.
	pub blocks: u64,
}

struct FileInner {
	file: File,
	/// Block slots in use; the next batch starts at `block_offset(blocks)`.
	blocks: u64,
	/// Physical bytes written (the final block of a batch may be short).
	size: u64,
	/// Timestamp of the newest batch, or the header timestamp when empty.
	newest_timestamp: f64,
}

/// An append-only log file with a fixed header and block-aligned batches.
///
/// Writes are serialized by the per-file mutex; reads go through a shared
/// [`MemoryMap`] so the host can read flushed batches without touching the
/// write path.
pub struct LogFile {
	sequence: u64,
	path: PathBuf,
	header: FileHeader,
	inner: Mutex<FileInner>,
	mapping: Mutex<Option<Arc<MemoryMap>>>,
}

impl LogFile {
	/// Create a fresh file and persist its header.
	pub fn create(path: PathBuf, sequence: u64, initial_timestamp: f64) -> LogResult<LogFile> {
		let mut file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
		let header = FileHeader::new(initial_timestamp);
		file.write_all(&header.encode())?;
		file.sync_data()?;
		Ok(LogFile {
			sequence,
			path,
			header,
			inner: Mutex::new(FileInner {
				file,
				blocks: 0,
				size: FILE_HEADER_SIZE as u64,
				newest_timestamp: initial_timestamp,
			}),
			mapping: Mutex::new(None),
		})
	}

	/// Open an existing file, validating the header and recovering the block
	/// count, physical size and newest batch timestamp.
	pub fn open(path: PathBuf, sequence: u64) -> LogResult<LogFile> {
		let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
		let len = file.metadata()?.len();
		if len < FILE_HEADER_SIZE as u64 {
			return Err(LogError::Format("file header shorter than the header size".into()));
		}
		let mut buf = [0u8; FILE_HEADER_SIZE];
		file.read_exact(&mut buf)?;
		let header = FileHeader::decode(&buf)?;

		let batches = scan_blocks(&mut file, len)?;
		let (blocks, size, newest_timestamp) = match batches.last() {
			Some(last) => {
				let blocks = (last.offset - FILE_HEADER_SIZE as u64) / crate::format::BLOCK_SIZE as u64
					+ last.blocks;
				let tail = last.payload_len
					- (last.blocks - 1) * BLOCK_PAYLOAD as u64;
				let size = block_offset(blocks - 1) + BLOCK_HEADER_SIZE as u64 + tail;
				(blocks, size, last.timestamp)
			}
			None => (0, FILE_HEADER_SIZE as u64, header.initial_timestamp),
		};

		Ok(LogFile {
			sequence,
			path,
			header,
			inner: Mutex::new(FileInner { file, blocks, size, newest_timestamp }),
			mapping: Mutex::new(None),
		})
	}

	pub fn sequence(&self) -> u64 {
		self.sequence
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn header(&self) -> &FileHeader {
		&self.header
	}

	/// Physical size in bytes.
	pub fn size(&self) -> u64 {
		self.inner.lock().size
	}

	/// Offset at which the next batch would be written.
	pub fn append_offset(&self) -> u64 {
		block_offset(self.inner.lock().blocks)
	}

	/// Timestamp of the newest batch.
	pub fn newest_timestamp(&self) -> f64 {
		self.inner.lock().newest_timestamp
	}

	pub fn is_batch_empty(&self) -> bool {
		self.inner.lock().blocks == 0
	}

	/// Append one batch with a single vectored write followed by a durable
	/// sync of the data pages. Returns the offset of the batch's first block.
	pub fn append_batch(&self, timestamp: f64, payload: &[u8]) -> io::Result<u64> {
		let mut inner = self.inner.lock();
		let start = block_offset(inner.blocks);
		let blocks = blocks_for(payload.len());

		let mut headers = Vec::with_capacity(blocks as usize);
		for i in 0..blocks {
			let from = i as usize * BLOCK_PAYLOAD;
			let to = ((i as usize + 1) * BLOCK_PAYLOAD).min(payload.len());
			let last = i + 1 == blocks;
			let header = BlockHeader {
				timestamp,
				len: (to - from) as u32,
				flags: if last { 0 } else { CONTINUATION_FLAG },
			};
			headers.push((header.encode(), from, to));
		}

		let mut slices: Vec<&[u8]> = Vec::with_capacity(headers.len() * 2);
		for (header, from, to) in &headers {
			slices.push(&header[..]);
			slices.push(&payload[*from..*to]);
		}

		inner.file.seek(SeekFrom::Start(start))?;
		write_all_vectored(&mut inner.file, slices)?;
		inner.file.sync_data()?;

		inner.blocks += blocks;
		let tail = payload.len() as u64 - (blocks - 1) * BLOCK_PAYLOAD as u64;
		inner.size = block_offset(inner.blocks - 1) + BLOCK_HEADER_SIZE as u64 + tail;
		inner.newest_timestamp = timestamp;
		trace!("appended batch of {} bytes to log file {} at {}", payload.len(), self.sequence, start);
		Ok(start)
	}

	/// Walk the block headers and report every batch.
	pub fn batches(&self) -> LogResult<Vec<BatchInfo>> {
		let mut inner = self.inner.lock();
		let len = inner.size;
		scan_blocks(&mut inner.file, len)
	}

	/// The shared read mapping, created lazily and refreshed when the file
	/// has grown past the mapped length.
	pub fn mapping(&self) -> io::Result<Arc<MemoryMap>> {
		let size = self.inner.lock().size;
		let mut mapping = self.mapping.lock();
		if let Some(map) = mapping.as_ref() {
			if map.len() as u64 >= size {
				return Ok(map.clone());
			}
		}
		let map = Arc::new(MemoryMap::new(self.sequence, &self.inner.lock().file)?);
		*mapping = Some(map.clone());
		Ok(map)
	}

	/// Whether any reader still holds a mapping of this file.
	pub fn has_live_mapping(&self) -> bool {
		self.mapping.lock().as_ref().map_or(false, |map| Arc::strong_count(map) > 1)
	}
}

/// Walk block headers from the start of the block region to `len`.
fn scan_blocks(file: &mut File, len: u64) -> LogResult<Vec<BatchInfo>> {
	let mut batches = Vec::new();
	let mut block = 0u64;
	loop {
		let offset = block_offset(block);
		if offset + BLOCK_HEADER_SIZE as u64 > len {
			break;
		}
		file.seek(SeekFrom::Start(offset))?;
		let mut buf = [0u8; BLOCK_HEADER_SIZE];
		file.read_exact(&mut buf)?;
		let header = BlockHeader::decode(&buf)?;
		if header.len == 0 {
			break;
		}

		let mut info = BatchInfo {
			offset,
			timestamp: header.timestamp,
			payload_len: header.len as u64,
			blocks: 1,
		};
		let mut current = header;
		while current.continues() {
			let next = block_offset(block + info.blocks);
			if next + BLOCK_HEADER_SIZE as u64 > len {
				return Err(LogError::Format("batch continuation past end of file".into()));
			}
			file.seek(SeekFrom::Start(next))?;
			file.read_exact(&mut buf)?;
			current = BlockHeader::decode(&buf)?;
			info.payload_len += current.len as u64;
			info.blocks += 1;
		}

		block += info.blocks;
		batches.push(info);
	}
	Ok(batches)
}

/// `Write::write_vectored` with an explicit short-write loop.
fn write_all_vectored(file: &mut File, mut slices: Vec<&[u8]>) -> io::Result<()> {
	let mut ix = 0;
	while ix < slices.len() {
		let iov: Vec<IoSlice<'_>> = slices[ix..].iter().map(|s| IoSlice::new(s)).collect();
		let mut written = file.write_vectored(&iov)?;
		if written == 0 {
			return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write batch"));
		}
		while ix < slices.len() && written >= slices[ix].len() {
			written -= slices[ix].len();
			ix += 1;
		}
		if ix < slices.len() && written > 0 {
			slices[ix] = &slices[ix][written..];
		}
	}
	Ok(())
}
