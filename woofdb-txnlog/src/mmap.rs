// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Read-only memory mapping of a log file, shared between the producing
//! [`LogFile`](crate::LogFile) and any outstanding readers.

use std::fs::File;
use std::io;
use std::ops::Deref;

use memmap2::{Mmap, MmapOptions};

/// A shared, read-only view of one log file identified by sequence number.
///
/// The mapping is immutable: it covers the file as it was when the map was
/// created. A file that grows afterwards is remapped by the owning
/// [`LogFile`](crate::LogFile); readers holding an older mapping simply see
/// a shorter, still batch-aligned view.
pub struct MemoryMap {
	sequence: u64,
	map: Mmap,
}

impl MemoryMap {
	pub(crate) fn new(sequence: u64, file: &File) -> io::Result<Self> {
		// The file is written append-only while mapped; flushed batches are
		// never mutated in place, so a shared read mapping stays coherent.
		let map = unsafe { MmapOptions::new().map(file)? };
		Ok(MemoryMap { sequence, map })
	}

	/// Sequence number of the mapped file.
	pub fn sequence(&self) -> u64 {
		self.sequence
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.is_empty()
	}
}

impl Deref for MemoryMap {
	type Target = [u8];

	fn deref(&self) -> &[u8] {
		&self.map
	}
}

impl AsRef<[u8]> for MemoryMap {
	fn as_ref(&self) -> &[u8] {
		&self.map
	}
}
