// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Process-wide tunables and the shared block cache.

use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rocksdb::Cache;

use crate::error::{Result, StoreError};

const MB: usize = 1024 * 1024;

/// Default capacity of the shared block cache.
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 32 * MB;

/// Default rotation threshold for transaction log files.
pub const DEFAULT_MAX_LOG_FILE_SIZE: u64 = 16 * MB as u64;

static SETTINGS: Lazy<Settings> = Lazy::new(|| Settings {
	inner: Mutex::new(SettingsInner {
		cache: None,
		cache_size: DEFAULT_BLOCK_CACHE_SIZE,
		max_log_file_size: DEFAULT_MAX_LOG_FILE_SIZE,
		log_retention: None,
	}),
});

/// The process-wide settings.
pub fn settings() -> &'static Settings {
	&SETTINGS
}

struct SettingsInner {
	cache: Option<Cache>,
	cache_size: usize,
	max_log_file_size: u64,
	log_retention: Option<Duration>,
}

/// Global tunables installed by the embedder. The block cache is shared by
/// every database opened in the process and is created lazily on first open.
pub struct Settings {
	inner: Mutex<SettingsInner>,
}

impl Settings {
	/// Set the shared block cache capacity. Only permitted before the cache
	/// is materialized by the first database open.
	pub fn set_block_cache_size(&self, bytes: usize) -> Result<()> {
		let mut inner = self.inner.lock();
		if inner.cache.is_some() {
			return Err(StoreError::InvalidArgument(
				"the shared block cache size cannot change once a database is open".into(),
			));
		}
		inner.cache_size = bytes;
		Ok(())
	}

	/// The shared LRU block cache, created on first use.
	pub(crate) fn block_cache(&self) -> Cache {
		let mut inner = self.inner.lock();
		let size = inner.cache_size;
		inner.cache.get_or_insert_with(|| Cache::new_lru_cache(size)).clone()
	}

	/// Default rotation threshold for transaction log files, overridable per
	/// open.
	pub fn max_log_file_size(&self) -> u64 {
		self.inner.lock().max_log_file_size
	}

	pub fn set_max_log_file_size(&self, bytes: u64) {
		self.inner.lock().max_log_file_size = bytes;
	}

	/// Default transaction log retention, overridable per open. `None` keeps
	/// log files forever.
	pub fn log_retention(&self) -> Option<Duration> {
		self.inner.lock().log_retention
	}

	pub fn set_log_retention(&self, retention: Option<Duration>) {
		self.inner.lock().log_retention = retention;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cache_size_is_frozen_once_materialized() {
		let _cache = settings().block_cache();
		assert!(matches!(
			settings().set_block_cache_size(64 * MB),
			Err(StoreError::InvalidArgument(_))
		));
	}
}
