// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-database i/o statistics.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Statistic kind to query.
#[derive(Debug, Clone, Copy)]
pub enum StatsKind {
	/// Overall statistics since the descriptor was opened.
	Overall,
	/// Statistics since the previous `SincePrevious` query.
	SincePrevious,
}

/// Statistic for the `span` period.
#[derive(Debug, Clone)]
pub struct IoStats {
	/// Number of read operations.
	pub reads: u64,
	/// Number of write operations.
	pub writes: u64,
	/// Number of bytes read.
	pub bytes_read: u64,
	/// Number of bytes written.
	pub bytes_written: u64,
	/// Number of committed transactions.
	pub transactions: u64,
	/// Start of the statistic period.
	pub started: Instant,
	/// Total duration of the statistic period.
	pub span: Duration,
}

struct RawStats {
	reads: u64,
	writes: u64,
	bytes_read: u64,
	bytes_written: u64,
	transactions: u64,
}

impl RawStats {
	fn combine(&self, other: &RawStats) -> RawStats {
		RawStats {
			reads: self.reads + other.reads,
			writes: self.writes + other.writes,
			bytes_read: self.bytes_read + other.bytes_read,
			bytes_written: self.bytes_written + other.bytes_written,
			transactions: self.transactions + other.transactions,
		}
	}
}

struct OverallStats {
	stats: RawStats,
	last_taken: Instant,
	started: Instant,
}

pub(crate) struct RunningStats {
	reads: AtomicU64,
	writes: AtomicU64,
	bytes_read: AtomicU64,
	bytes_written: AtomicU64,
	transactions: AtomicU64,
	overall: RwLock<OverallStats>,
}

impl RunningStats {
	pub fn new() -> Self {
		RunningStats {
			reads: 0.into(),
			writes: 0.into(),
			bytes_read: 0.into(),
			bytes_written: 0.into(),
			transactions: 0.into(),
			overall: RwLock::new(OverallStats {
				stats: RawStats { reads: 0, writes: 0, bytes_read: 0, bytes_written: 0, transactions: 0 },
				last_taken: Instant::now(),
				started: Instant::now(),
			}),
		}
	}

	pub fn tally_reads(&self, val: u64) {
		self.reads.fetch_add(val, AtomicOrdering::Relaxed);
	}

	pub fn tally_bytes_read(&self, val: u64) {
		self.bytes_read.fetch_add(val, AtomicOrdering::Relaxed);
	}

	pub fn tally_writes(&self, val: u64) {
		self.writes.fetch_add(val, AtomicOrdering::Relaxed);
	}

	pub fn tally_bytes_written(&self, val: u64) {
		self.bytes_written.fetch_add(val, AtomicOrdering::Relaxed);
	}

	pub fn tally_transactions(&self, val: u64) {
		self.transactions.fetch_add(val, AtomicOrdering::Relaxed);
	}

	fn take_current(&self) -> RawStats {
		RawStats {
			reads: self.reads.swap(0, AtomicOrdering::Relaxed),
			writes: self.writes.swap(0, AtomicOrdering::Relaxed),
			bytes_read: self.bytes_read.swap(0, AtomicOrdering::Relaxed),
			bytes_written: self.bytes_written.swap(0, AtomicOrdering::Relaxed),
			transactions: self.transactions.swap(0, AtomicOrdering::Relaxed),
		}
	}

	fn peek_current(&self) -> RawStats {
		RawStats {
			reads: self.reads.load(AtomicOrdering::Relaxed),
			writes: self.writes.load(AtomicOrdering::Relaxed),
			bytes_read: self.bytes_read.load(AtomicOrdering::Relaxed),
			bytes_written: self.bytes_written.load(AtomicOrdering::Relaxed),
			transactions: self.transactions.load(AtomicOrdering::Relaxed),
		}
	}

	pub fn take(&self, kind: StatsKind) -> IoStats {
		let (raw, started) = match kind {
			StatsKind::SincePrevious => {
				let mut overall = self.overall.write();
				let current = self.take_current();
				overall.stats = overall.stats.combine(&current);
				let started = overall.last_taken;
				overall.last_taken = Instant::now();
				(current, started)
			}
			StatsKind::Overall => {
				let overall = self.overall.read();
				(overall.stats.combine(&self.peek_current()), overall.started)
			}
		};
		IoStats {
			reads: raw.reads,
			writes: raw.writes,
			bytes_read: raw.bytes_read,
			bytes_written: raw.bytes_written,
			transactions: raw.transactions,
			started,
			span: started.elapsed(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn since_previous_resets_the_period() {
		let stats = RunningStats::new();
		stats.tally_reads(3);
		stats.tally_bytes_read(30);

		let taken = stats.take(StatsKind::SincePrevious);
		assert_eq!(taken.reads, 3);
		assert_eq!(taken.bytes_read, 30);

		let taken = stats.take(StatsKind::SincePrevious);
		assert_eq!(taken.reads, 0);

		// the overall view keeps everything
		stats.tally_writes(1);
		let overall = stats.take(StatsKind::Overall);
		assert_eq!(overall.reads, 3);
		assert_eq!(overall.writes, 1);
	}
}
