// Copyright 2024 Parity Technologies
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The process-wide registry of open databases.
//!
//! One descriptor per path: concurrent opens of the same path share the
//! engine, and the registry holds only weak references so a database closes
//! once the last handle is gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::descriptor::DbDescriptor;
use crate::engine::OpenOptions;
use crate::error::{Result, StoreError};
use crate::handle::DbHandle;

static REGISTRY: Lazy<DbRegistry> = Lazy::new(|| DbRegistry { dbs: Mutex::new(HashMap::new()) });

/// The process-wide registry.
pub fn registry() -> &'static DbRegistry {
	&REGISTRY
}

/// Path → weak descriptor map behind a single mutex.
pub struct DbRegistry {
	dbs: Mutex<HashMap<PathBuf, Weak<DbDescriptor>>>,
}

impl DbRegistry {
	/// Open `path`, reusing the live descriptor when one exists. A reused
	/// descriptor must have been opened in the same mode; the requested
	/// column family is created on it if missing. An expired or closed entry
	/// is treated as absent and the engine is reopened, all under the
	/// registry mutex.
	pub fn open(&self, path: impl AsRef<Path>, options: &OpenOptions) -> Result<DbHandle> {
		options.validate()?;
		let path = normalize(path.as_ref())?;
		let mut dbs = self.dbs.lock();

		if let Some(descriptor) = dbs.get(&path).and_then(Weak::upgrade) {
			if !descriptor.is_closed() {
				if descriptor.mode() != options.mode {
					return Err(StoreError::ConflictingMode(descriptor.mode()));
				}
				descriptor.ensure_column(&options.column)?;
				return Ok(DbHandle::new(descriptor, options.column.clone()));
			}
		}

		dbs.remove(&path);
		let descriptor = Arc::new(DbDescriptor::open(path.clone(), options)?);
		dbs.insert(path, Arc::downgrade(&descriptor));
		Ok(DbHandle::new(descriptor, options.column.clone()))
	}

	/// Drop expired entries.
	pub fn purge(&self) {
		self.dbs.lock().retain(|_, weak| weak.upgrade().is_some());
	}

	/// Close every live descriptor and clear the map. Runs on last embedder
	/// teardown; outstanding handles observe `DatabaseNotOpen` afterwards.
	pub fn purge_all(&self) {
		let dbs = std::mem::take(&mut *self.dbs.lock());
		for (_, weak) in dbs {
			if let Some(descriptor) = weak.upgrade() {
				descriptor.close_all();
			}
		}
	}

	/// Number of live entries, after a sweep.
	pub fn size(&self) -> usize {
		let mut dbs = self.dbs.lock();
		dbs.retain(|_, weak| weak.upgrade().is_some());
		dbs.len()
	}
}

/// Absolute, symlink-resolved form of the database path. The directory is
/// created first because the engine would create it anyway.
fn normalize(path: &Path) -> Result<PathBuf> {
	let absolute = if path.is_absolute() {
		path.to_owned()
	} else {
		std::env::current_dir()
			.map_err(|err| StoreError::EngineOpen(err.to_string()))?
			.join(path)
	};
	std::fs::create_dir_all(&absolute).map_err(|err| StoreError::EngineOpen(err.to_string()))?;
	absolute.canonicalize().map_err(|err| StoreError::EngineOpen(err.to_string()))
}
