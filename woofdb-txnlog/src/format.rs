// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! On-disk layout of a transaction log file, format version 1.
//!
//! A file starts with a fixed header and is followed by blocks aligned on
//! `BLOCK_SIZE` boundaries (measured from the end of the file header). Each
//! block carries its own header; a batch larger than one block chains into
//! the following blocks with `CONTINUATION_FLAG` set on every block except
//! the last. All integers and floats are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::LogError;

/// Magic token identifying a transaction log file.
pub const WOOF_TOKEN: u32 = 0x574F_4F46;

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// File header: magic (4) + version (1) + initial timestamp (8).
pub const FILE_HEADER_SIZE: usize = 13;

/// Block slot size. Must be even.
pub const BLOCK_SIZE: usize = 4096;

/// Block header: batch timestamp (8) + payload length (4) + flags (1).
pub const BLOCK_HEADER_SIZE: usize = 13;

/// Per-entry header inside a batch payload: transaction id (4) + data length (4).
pub const TXN_HEADER_SIZE: usize = 8;

/// Set on every block of a batch except the last one.
pub const CONTINUATION_FLAG: u8 = 0b0000_0001;

/// Payload capacity of a single block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileHeader {
	pub version: u8,
	/// Timestamp recorded when the file was created, milliseconds since the epoch.
	pub initial_timestamp: f64,
}

impl FileHeader {
	pub fn new(initial_timestamp: f64) -> Self {
		FileHeader { version: FORMAT_VERSION, initial_timestamp }
	}

	pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
		let mut buf = [0u8; FILE_HEADER_SIZE];
		LittleEndian::write_u32(&mut buf[0..4], WOOF_TOKEN);
		buf[4] = self.version;
		LittleEndian::write_f64(&mut buf[5..13], self.initial_timestamp);
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
		if buf.len() < FILE_HEADER_SIZE {
			return Err(LogError::Format("file header shorter than the header size".into()));
		}
		let magic = LittleEndian::read_u32(&buf[0..4]);
		if magic != WOOF_TOKEN {
			return Err(LogError::Format(format!("bad magic token {:#010x}", magic)));
		}
		Ok(FileHeader { version: buf[4], initial_timestamp: LittleEndian::read_f64(&buf[5..13]) })
	}
}

/// Decoded block header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockHeader {
	/// Timestamp of the batch this block belongs to.
	pub timestamp: f64,
	/// Payload bytes stored in this block.
	pub len: u32,
	pub flags: u8,
}

impl BlockHeader {
	pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
		let mut buf = [0u8; BLOCK_HEADER_SIZE];
		LittleEndian::write_f64(&mut buf[0..8], self.timestamp);
		LittleEndian::write_u32(&mut buf[8..12], self.len);
		buf[12] = self.flags;
		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self, LogError> {
		if buf.len() < BLOCK_HEADER_SIZE {
			return Err(LogError::Format("truncated block header".into()));
		}
		let header = BlockHeader {
			timestamp: LittleEndian::read_f64(&buf[0..8]),
			len: LittleEndian::read_u32(&buf[8..12]),
			flags: buf[12],
		};
		if header.len as usize > BLOCK_PAYLOAD {
			return Err(LogError::Format(format!("block payload length {} exceeds block size", header.len)));
		}
		Ok(header)
	}

	/// Whether the batch continues in the next block.
	pub fn continues(&self) -> bool {
		self.flags & CONTINUATION_FLAG != 0
	}
}

/// Byte offset of block `index` within a file.
pub fn block_offset(index: u64) -> u64 {
	FILE_HEADER_SIZE as u64 + index * BLOCK_SIZE as u64
}

/// Number of block slots a payload of `len` bytes occupies.
pub fn blocks_for(len: usize) -> u64 {
	if len == 0 {
		1
	} else {
		((len + BLOCK_PAYLOAD - 1) / BLOCK_PAYLOAD) as u64
	}
}

/// Bytes a payload occupies on disk, counting whole block slots for all but
/// the final block of the batch.
pub fn batch_disk_size(len: usize) -> u64 {
	blocks_for(len) * BLOCK_SIZE as u64
}

/// Append one entry to a batch payload under construction.
pub fn encode_entry(payload: &mut Vec<u8>, txn_id: u32, data: &[u8]) {
	let mut header = [0u8; TXN_HEADER_SIZE];
	LittleEndian::write_u32(&mut header[0..4], txn_id);
	LittleEndian::write_u32(&mut header[4..8], data.len() as u32);
	payload.extend_from_slice(&header);
	payload.extend_from_slice(data);
}

/// Split a batch payload back into `(txn_id, data)` entries.
pub fn decode_entries(mut payload: &[u8]) -> Result<Vec<(u32, Vec<u8>)>, LogError> {
	let mut entries = Vec::new();
	while !payload.is_empty() {
		if payload.len() < TXN_HEADER_SIZE {
			return Err(LogError::Format("truncated entry header".into()));
		}
		let txn_id = LittleEndian::read_u32(&payload[0..4]);
		let len = LittleEndian::read_u32(&payload[4..8]) as usize;
		payload = &payload[TXN_HEADER_SIZE..];
		if payload.len() < len {
			return Err(LogError::Format("entry data extends past the batch payload".into()));
		}
		entries.push((txn_id, payload[..len].to_vec()));
		payload = &payload[len..];
	}
	Ok(entries)
}
