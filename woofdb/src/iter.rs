// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded range iteration over a database or a transaction.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rocksdb::ReadOptions;

use crate::descriptor::{Closable, DbDescriptor};
use crate::engine::{read_options, RawEngineIter};
use crate::error::{Result, StoreError};
use crate::txn::TxnShared;
use crate::DbKey;

/// Options accepted by `range`.
#[derive(Debug, Clone)]
pub struct RangeOptions {
	/// Lower bound; `None` starts at the first key.
	pub start: Option<DbKey>,
	/// Upper bound; `None` runs to the last key.
	pub end: Option<DbKey>,
	/// Leave the start key itself out of the range.
	pub exclusive_start: bool,
	/// Take the end key itself into the range.
	pub inclusive_end: bool,
	/// Traverse from the end of the range towards the start.
	pub reverse: bool,
	/// Emit values alongside keys.
	pub values: bool,
}

impl Default for RangeOptions {
	fn default() -> Self {
		RangeOptions {
			start: None,
			end: None,
			exclusive_start: false,
			inclusive_end: false,
			reverse: false,
			values: true,
		}
	}
}

impl RangeOptions {
	pub fn between(start: &[u8], end: &[u8]) -> Self {
		RangeOptions {
			start: Some(DbKey::from_slice(start)),
			end: Some(DbKey::from_slice(end)),
			..Default::default()
		}
	}
}

/// A key paired with its value when the iterator was configured to emit
/// values.
pub type RangeItem = (Box<[u8]>, Option<Box<[u8]>>);

/// Engine read options implementing the range bounds.
///
/// The engine's upper bound is exclusive, so an inclusive end appends a zero
/// byte. An exclusive start appends a zero byte to the lower bound, which is
/// the byte-successor of the start key; no key orders strictly between the
/// two, so this equals stepping off the start key in either traversal
/// direction.
pub(crate) fn range_read_options(options: &RangeOptions) -> ReadOptions {
	let mut readopts = read_options();
	if let Some(start) = &options.start {
		let mut lower = start.to_vec();
		if options.exclusive_start {
			lower.push(0);
		}
		readopts.set_iterate_lower_bound(lower);
	}
	if let Some(end) = &options.end {
		let mut upper = end.to_vec();
		if options.inclusive_end {
			upper.push(0);
		}
		readopts.set_iterate_upper_bound(upper);
	}
	readopts
}

struct IterState {
	raw: Option<RawEngineIter>,
	started: bool,
	user_closed: bool,
}

pub(crate) struct IterShared {
	descriptor: Arc<DbDescriptor>,
	/// Keeps a transaction-backed iterator's transaction alive.
	txn: Option<Arc<TxnShared>>,
	values: bool,
	reverse: bool,
	state: Mutex<IterState>,
}

impl Closable for IterShared {
	fn close_resource(&self) {
		let mut state = self.state.lock();
		state.raw = None;
	}
}

/// A bounded range iterator.
///
/// Implements [`Iterator`]; [`close`](RangeIter::close) is the analogue of
/// the host iteration protocol's `return`/`throw` and eagerly releases the
/// engine resources. Dropping the iterator closes it. An iterator whose
/// descriptor or transaction was closed underneath it yields
/// [`StoreError::IteratorClosed`].
pub struct RangeIter {
	shared: Arc<IterShared>,
}

impl RangeIter {
	pub(crate) fn new(
		descriptor: Arc<DbDescriptor>,
		txn: Option<Arc<TxnShared>>,
		raw: RawEngineIter,
		options: &RangeOptions,
	) -> RangeIter {
		let shared = Arc::new(IterShared {
			descriptor,
			txn,
			values: options.values,
			reverse: options.reverse,
			state: Mutex::new(IterState { raw: Some(raw), started: false, user_closed: false }),
		});
		let shared_dyn: Arc<dyn Closable> = shared.clone();
		let closable: Weak<dyn Closable> = Arc::downgrade(&shared_dyn);
		shared.descriptor.attach(closable);
		if let Some(txn) = &shared.txn {
			txn.register_iter(Arc::downgrade(&shared));
		}
		RangeIter { shared }
	}

	/// Release the engine iterator. Idempotent; `next` reports end-of-range
	/// afterwards.
	pub fn close(&self) {
		{
			let mut state = self.shared.state.lock();
			state.user_closed = true;
			state.raw = None;
		}
		self.detach();
	}

	fn detach(&self) {
		self.shared.descriptor.detach(Arc::as_ptr(&self.shared) as *const ());
	}
}

impl Iterator for RangeIter {
	type Item = Result<RangeItem>;

	fn next(&mut self) -> Option<Self::Item> {
		let mut state = self.shared.state.lock();
		let IterState { raw, started, user_closed } = &mut *state;
		let iter = match raw {
			Some(iter) => iter,
			None if *user_closed => return None,
			None => return Some(Err(StoreError::IteratorClosed)),
		};

		if !*started {
			*started = true;
			if self.shared.reverse {
				iter.seek_to_last();
			} else {
				iter.seek_to_first();
			}
		} else if self.shared.reverse {
			iter.prev();
		} else {
			iter.next();
		}

		if iter.valid() {
			let key = iter.key().expect("a valid iterator has a key; qed").to_vec().into_boxed_slice();
			let value = if self.shared.values {
				iter.value().map(|value| value.to_vec().into_boxed_slice())
			} else {
				None
			};
			return Some(Ok((key, value)));
		}

		let status = iter.status();
		*raw = None;
		*user_closed = true;
		drop(state);
		self.detach();
		match status {
			Ok(()) => None,
			Err(err) => Some(Err(err.into())),
		}
	}
}

impl Drop for RangeIter {
	fn drop(&mut self) {
		self.close();
	}
}
