// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode table: the bridge between host filesystem identity and the
//! opaque inode numbers handed to the kernel.
//!
//! Each live inode owns a path-only (`O_PATH`) descriptor to its source
//! object, so directories, sockets, fifos and regular files are all
//! representable. The number reported to the kernel is the address of the
//! record's heap allocation, which is stable for the record's lifetime;
//! resolution always goes through the id map, never a pointer cast.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Canonical identity of a source object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub ino: libc::ino64_t,
    pub dev: libc::dev_t,
}

impl InodeKey {
    pub fn from_stat(st: &libc::stat) -> Self {
        Self {
            ino: st.st_ino,
            dev: st.st_dev,
        }
    }
}

#[derive(Debug, Default)]
struct InodeRefs {
    /// The kernel's reference count: raised by lookup, lowered by forget.
    lookup_count: u64,
    /// Open file handles currently outstanding against this inode.
    open_count: u64,
}

/// One live source object. Never moved once allocated; the descriptor is
/// closed when the last `Arc` drops.
#[derive(Debug)]
pub struct InodeData {
    fd: OwnedFd,
    key: InodeKey,
    generation: u64,
    refs: Mutex<InodeRefs>,
}

impl InodeData {
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn key(&self) -> InodeKey {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn id(self: &Arc<Self>) -> u64 {
        Arc::as_ptr(self) as u64
    }

    pub fn lookup_count(&self) -> u64 {
        self.refs.lock().unwrap().lookup_count
    }

    pub fn open_count(&self) -> u64 {
        self.refs.lock().unwrap().open_count
    }

    /// Extra kernel reference on an already-registered record (hard
    /// links reply with the existing entry).
    pub fn inc_lookup(&self) {
        self.refs.lock().unwrap().lookup_count += 1;
    }

    pub fn inc_open(&self) {
        self.refs.lock().unwrap().open_count += 1;
    }

    pub fn dec_open(&self) {
        let mut refs = self.refs.lock().unwrap();
        refs.open_count = refs.open_count.saturating_sub(1);
    }
}

/// Table of live inodes plus the distinguished root record. The root is
/// never inserted into the maps and never forgotten.
#[derive(Debug)]
pub struct InodeTable {
    root: Arc<InodeData>,
    maps: Mutex<Maps>,
    generation: AtomicU64,
}

#[derive(Debug, Default)]
struct Maps {
    by_key: HashMap<InodeKey, Arc<InodeData>>,
    by_id: HashMap<u64, Arc<InodeData>>,
}

/// Outcome of a lookup against the table.
pub struct Registered {
    pub ino: u64,
    pub generation: u64,
    pub data: Arc<InodeData>,
}

impl InodeTable {
    /// Builds the table around an already-open path-only descriptor for
    /// the mount source.
    pub fn new(root_fd: OwnedFd, root_key: InodeKey) -> Self {
        let root = Arc::new(InodeData {
            fd: root_fd,
            key: root_key,
            generation: 0,
            refs: Mutex::new(InodeRefs {
                // Matches the kernel's implicit reference on the root.
                lookup_count: 2,
                open_count: 0,
            }),
        });
        Self {
            root,
            maps: Mutex::new(Maps::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Arc<InodeData> {
        &self.root
    }

    /// Resolves a kernel-supplied inode number. The root id maps to the
    /// root record regardless of its address.
    pub fn get(&self, ino: u64) -> io::Result<Arc<InodeData>> {
        if ino == fuser::FUSE_ROOT_ID {
            return Ok(Arc::clone(&self.root));
        }
        self.maps
            .lock()
            .unwrap()
            .by_id
            .get(&ino)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))
    }

    /// Finds the record for `key`, bumping its lookup count, or inserts a
    /// new record owning `fd`. The caller's `fd` is dropped (closed) when
    /// the key was already present.
    pub fn register(&self, key: InodeKey, fd: OwnedFd) -> Registered {
        let mut maps = self.maps.lock().unwrap();
        if let Some(existing) = maps.by_key.get(&key) {
            let data = Arc::clone(existing);
            drop(maps);
            data.refs.lock().unwrap().lookup_count += 1;
            let ino = data.id();
            return Registered {
                ino,
                generation: data.generation(),
                data,
            };
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let data = Arc::new(InodeData {
            fd,
            key,
            generation,
            refs: Mutex::new(InodeRefs {
                lookup_count: 1,
                open_count: 0,
            }),
        });
        let ino = data.id();
        maps.by_key.insert(key, Arc::clone(&data));
        maps.by_id.insert(ino, Arc::clone(&data));
        drop(maps);
        debug!(target: "interposefs::inode", ino, ?key, generation, "inode registered");
        Registered {
            ino,
            generation,
            data,
        }
    }

    /// Drops `nlookup` kernel references. At zero the record leaves the
    /// table and its descriptor closes with the last `Arc`. Forgets that
    /// would underflow (races with concurrent lookups on a just-removed
    /// record) are ignored.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == fuser::FUSE_ROOT_ID {
            return;
        }
        let mut maps = self.maps.lock().unwrap();
        let Some(data) = maps.by_id.get(&ino).cloned() else {
            return;
        };
        let remove = {
            let mut refs = data.refs.lock().unwrap();
            refs.lookup_count = refs.lookup_count.saturating_sub(nlookup);
            refs.lookup_count == 0
        };
        if remove {
            maps.by_id.remove(&ino);
            maps.by_key.remove(&data.key());
            debug!(target: "interposefs::inode", ino, key = ?data.key(), "inode dropped");
        }
    }

    /// Number of live records, root excluded.
    pub fn len(&self) -> usize {
        self.maps.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches every record, closing all descriptors. Called from the
    /// session `destroy` hook.
    pub fn clear(&self) {
        let mut maps = self.maps.lock().unwrap();
        maps.by_key.clear();
        maps.by_id.clear();
    }
}
