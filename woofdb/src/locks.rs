// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Named serialized callback queues.
//!
//! Host code uses these to serialize asynchronous work that shares a
//! fingerprint: at most one callback per key runs at a time, queued
//! callbacks fire in enqueue order on the host dispatch thread, and a queued
//! callback whose owner has gone away is skipped without blocking its
//! successors.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Weak;

use parking_lot::Mutex;

use crate::dispatch::dispatcher;

/// A queued unit of host work.
pub type LockCallback = Box<dyn FnOnce() + Send + 'static>;

/// Weak handle whose liveness gates a queued callback.
pub(crate) type LockOwner = Weak<dyn Any + Send + Sync>;

struct LockEntry {
	running: bool,
	queue: VecDeque<(LockCallback, LockOwner)>,
}

/// Per-descriptor lock table. Deliberately guarded by its own mutex so lock
/// traffic never contends with the descriptor's structural lock.
pub(crate) struct LockTable {
	entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
	pub fn new() -> Self {
		LockTable { entries: Mutex::new(HashMap::new()) }
	}

	/// Run `callback` now if the key is free, otherwise queue it. Returns
	/// `true` when the callback was started immediately.
	pub fn lock_call(&self, key: &str, owner: LockOwner, callback: LockCallback) -> bool {
		let mut entries = self.entries.lock();
		match entries.get_mut(key) {
			Some(entry) => {
				entry.queue.push_back((callback, owner));
				false
			}
			None => {
				entries.insert(key.to_owned(), LockEntry { running: true, queue: VecDeque::new() });
				drop(entries);
				dispatcher().dispatch(callback);
				true
			}
		}
	}

	/// Conditional enqueue. With `skip_if_exists` the call is a no-op when
	/// the key already has a runner. Returns `true` when the callback was
	/// queued or started.
	pub fn enqueue(
		&self,
		key: &str,
		owner: LockOwner,
		callback: LockCallback,
		skip_if_exists: bool,
	) -> bool {
		let mut entries = self.entries.lock();
		match entries.get_mut(key) {
			Some(_) if skip_if_exists => false,
			Some(entry) => {
				entry.queue.push_back((callback, owner));
				true
			}
			None => {
				entries.insert(key.to_owned(), LockEntry { running: true, queue: VecDeque::new() });
				drop(entries);
				dispatcher().dispatch(callback);
				true
			}
		}
	}

	/// Release the key's runner. The next queued callback with a live owner
	/// is started on the host thread; expired owners are discarded in the
	/// same pass. When the queue drains the entry is removed. Returns `false`
	/// when the key held no entry.
	pub fn release(&self, key: &str) -> bool {
		let next = {
			let mut entries = self.entries.lock();
			let entry = match entries.get_mut(key) {
				Some(entry) => entry,
				None => return false,
			};
			entry.running = false;
			let next = next_live(entry);
			if next.is_some() {
				entry.running = true;
			} else {
				entries.remove(key);
			}
			next
		};
		if let Some(callback) = next {
			dispatcher().dispatch(callback);
		}
		true
	}

	/// Start the next queued live-owner callback asynchronously on the host
	/// thread. Returns `false` when nothing was queued.
	pub fn fire_next(&self, key: &str) -> bool {
		match self.pop_next(key) {
			Some(callback) => {
				dispatcher().dispatch(callback);
				true
			}
			None => false,
		}
	}

	/// Synchronous variant of [`fire_next`](Self::fire_next): the callback
	/// runs on the calling thread before this returns.
	pub fn fire_next_immediate(&self, key: &str) -> bool {
		match self.pop_next(key) {
			Some(callback) => {
				callback();
				true
			}
			None => false,
		}
	}

	/// Whether the key currently has a runner or queued callbacks.
	pub fn contains(&self, key: &str) -> bool {
		self.entries.lock().contains_key(key)
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	fn pop_next(&self, key: &str) -> Option<LockCallback> {
		let mut entries = self.entries.lock();
		let entry = entries.get_mut(key)?;
		let next = next_live(entry);
		if next.is_some() {
			entry.running = true;
		}
		next
	}
}

fn next_live(entry: &mut LockEntry) -> Option<LockCallback> {
	while let Some((callback, owner)) = entry.queue.pop_front() {
		if owner.upgrade().is_some() {
			return Some(callback);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{mpsc, Arc};
	use std::time::Duration;

	fn owner() -> (Arc<()>, LockOwner) {
		let strong = Arc::new(());
		let strong_dyn: Arc<dyn Any + Send + Sync> = strong.clone();
		let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&strong_dyn);
		(strong, weak)
	}

	#[test]
	fn first_caller_runs_immediately() {
		let table = LockTable::new();
		let (_strong, weak) = owner();
		let (tx, rx) = mpsc::channel();
		let started = table.lock_call("k", weak, Box::new(move || tx.send(()).unwrap()));
		assert!(started);
		rx.recv_timeout(Duration::from_secs(5)).unwrap();
		assert!(table.contains("k"));
		assert!(table.release("k"));
		assert!(!table.contains("k"));
	}

	#[test]
	fn callbacks_serialize_in_fifo_order() {
		let table = Arc::new(LockTable::new());
		let (_strong, weak) = owner();
		let (tx, rx) = mpsc::channel();

		for i in 0..3 {
			let tx = tx.clone();
			let started = table.lock_call(
				"k",
				weak.clone(),
				Box::new(move || {
					tx.send(i).unwrap();
				}),
			);
			assert_eq!(started, i == 0);
		}

		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 0);
		assert!(rx.try_recv().is_err(), "only one callback may run at a time");
		table.release("k");
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
		table.release("k");
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
		table.release("k");
		assert!(!table.contains("k"));
		assert_eq!(table.len(), 0);
	}

	#[test]
	fn expired_owner_is_skipped_in_the_release_pass() {
		let table = LockTable::new();
		let (keeper, live) = owner();
		let (tx, rx) = mpsc::channel();

		{
			let tx = tx.clone();
			table.lock_call("k", live.clone(), Box::new(move || tx.send("first").unwrap()));
		}
		{
			let (dead_strong, dead) = owner();
			let tx = tx.clone();
			table.lock_call("k", dead, Box::new(move || tx.send("dead").unwrap()));
			drop(dead_strong);
		}
		{
			let tx = tx.clone();
			table.lock_call("k", live, Box::new(move || tx.send("last").unwrap()));
		}

		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
		table.release("k");
		// the dead owner's callback is discarded, the next live one fires
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "last");
		table.release("k");
		assert!(!table.contains("k"));
		drop(keeper);
	}

	#[test]
	fn skip_if_exists_is_reentrant() {
		let table = LockTable::new();
		let (_strong, weak) = owner();
		let (tx, rx) = mpsc::channel();

		{
			let tx = tx.clone();
			assert!(table.enqueue("k", weak.clone(), Box::new(move || tx.send(1).unwrap()), true));
		}
		rx.recv_timeout(Duration::from_secs(5)).unwrap();
		// the key has a runner, so the conditional enqueue is a no-op
		assert!(!table.enqueue("k", weak.clone(), Box::new(|| panic!("skipped")), true));
		// an unconditional enqueue still queues
		{
			let tx = tx.clone();
			assert!(table.enqueue("k", weak, Box::new(move || tx.send(2).unwrap()), false));
		}
		table.release("k");
		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
		table.release("k");
	}

	#[test]
	fn fire_next_immediate_runs_inline() {
		let table = LockTable::new();
		let (_strong, weak) = owner();
		let (tx, rx) = mpsc::channel();
		table.lock_call("k", weak.clone(), Box::new(|| {}));
		{
			let tx = tx.clone();
			table.enqueue("k", weak, Box::new(move || tx.send(()).unwrap()), false);
		}
		assert!(table.fire_next_immediate("k"));
		rx.try_recv().unwrap();
		assert!(!table.fire_next_immediate("k"));
	}

	#[test]
	fn release_of_unknown_key_reports_false() {
		let table = LockTable::new();
		assert!(!table.release("missing"));
	}
}
