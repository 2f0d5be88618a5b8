// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Marshalling of completions onto a single host thread.
//!
//! Commit completions and lock-table firings originate on worker threads but
//! must be delivered in send order on one thread, the way a host runtime
//! drains its loop. The dispatcher owns that thread; it starts lazily and is
//! shut down explicitly when the last embedder detaches.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use log::warn;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

static DISPATCHER: Lazy<Dispatcher> = Lazy::new(|| Dispatcher { inner: Mutex::new(None) });

/// The process-wide dispatcher.
pub(crate) fn dispatcher() -> &'static Dispatcher {
	&DISPATCHER
}

struct DispatchInner {
	tx: Sender<Job>,
	thread: JoinHandle<()>,
}

pub(crate) struct Dispatcher {
	inner: Mutex<Option<DispatchInner>>,
}

impl Dispatcher {
	/// Enqueue a job for the host thread. Jobs run in send order.
	pub fn dispatch(&self, job: Job) {
		let mut inner = self.inner.lock();
		let inner = inner.get_or_insert_with(spawn_host_thread);
		if inner.tx.send(job).is_err() {
			warn!("host dispatch thread is gone, dropping completion");
		}
	}

	/// Drain outstanding jobs and join the host thread. Idempotent; a later
	/// `dispatch` restarts the thread.
	pub fn shutdown(&self) {
		let inner = self.inner.lock().take();
		if let Some(DispatchInner { tx, thread }) = inner {
			drop(tx);
			if let Err(err) = thread.join() {
				warn!("host dispatch thread panicked: {:?}", err);
			}
		}
	}
}

fn spawn_host_thread() -> DispatchInner {
	let (tx, rx) = unbounded::<Job>();
	let thread = thread::Builder::new()
		.name("woofdb-dispatch".into())
		.spawn(move || {
			for job in rx {
				job();
			}
		})
		.expect("failed to spawn the host dispatch thread");
	DispatchInner { tx, thread }
}

/// Run engine work off the caller's thread; the completion is expected to go
/// back through [`Dispatcher::dispatch`].
pub(crate) fn spawn_worker(name: &str, work: impl FnOnce() + Send + 'static) {
	if let Err(err) = thread::Builder::new().name(name.into()).spawn(work) {
		warn!("failed to spawn worker thread {}: {}", name, err);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::mpsc;

	#[test]
	fn jobs_run_in_send_order() {
		let (tx, rx) = mpsc::channel();
		for i in 0..10 {
			let tx = tx.clone();
			dispatcher().dispatch(Box::new(move || {
				tx.send(i).unwrap();
			}));
		}
		let seen: Vec<i32> = rx.iter().take(10).collect();
		assert_eq!(seen, (0..10).collect::<Vec<_>>());
	}
}
