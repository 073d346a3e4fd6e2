//! Process-wide dentry lookup cache.
//!
//! A chained hash table keyed by `(parent inode address, child name)`.
//! One coarse spinlock guards the whole table — lookups are short and the
//! profile never justified striping. Every cached dentry is held by a
//! strong reference, so a hit can always hand one out.
//!
//! Sized at boot to ~0.5% of physical memory, clamped to [1 MiB, 16 MiB]
//! of bucket storage; until [`init`] runs, a small default keeps host
//! tests and early boot working.

use alloc::sync::Arc;
use alloc::vec::Vec;

use boson_core::sync::SpinLock;
use boson_core::{Error, Result, kinfo};

use crate::dentry::Dentry;

/// Bucket count before [`init`].
const DEFAULT_BUCKETS: usize = 1024;

/// Estimated bytes per bucket for boot sizing.
const BUCKET_COST: usize = 64;

struct Entry {
    hash: u64,
    parent: usize,
    dentry: Arc<Dentry>,
}

struct Table {
    buckets: Vec<Vec<Entry>>,
}

impl Table {
    const fn empty() -> Self {
        Self {
            buckets: Vec::new(),
        }
    }

    fn ensure(&mut self) {
        if self.buckets.is_empty() {
            self.buckets.resize_with(DEFAULT_BUCKETS, Vec::new);
        }
    }

    fn bucket(&mut self, hash: u64) -> &mut Vec<Entry> {
        self.ensure();
        let idx = (hash as usize) & (self.buckets.len() - 1);
        &mut self.buckets[idx]
    }
}

static TABLE: SpinLock<Table> = SpinLock::new(Table::empty());

/// FNV-1a over the parent inode address and the name bytes.
fn hash_key(parent_inode: usize, name: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in parent_inode.to_ne_bytes() {
        h = (h ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    for &byte in name.as_bytes() {
        h = (h ^ byte as u64).wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

fn parent_key(parent: &Dentry) -> Option<usize> {
    parent.inode().map(|inode| Arc::as_ptr(&inode) as usize)
}

/// Sizes the table for the machine. Call once during boot.
///
/// # Errors
///
/// Returns `InvalidArgs` for a zero memory size.
pub fn init(phys_mem_bytes: u64) -> Result<()> {
    if phys_mem_bytes == 0 {
        return Err(Error::InvalidArgs);
    }
    let budget = (phys_mem_bytes / 200).clamp(1 << 20, 16 << 20) as usize;
    let buckets = (budget / BUCKET_COST).next_power_of_two();
    let mut table = TABLE.lock();
    table.buckets = Vec::new();
    table.buckets.resize_with(buckets, Vec::new);
    kinfo!("dentry cache: {} buckets ({} KiB)", buckets, budget >> 10);
    Ok(())
}

/// Looks up `(parent, name)`.
#[must_use]
pub fn get(parent: &Dentry, name: &str) -> Option<Arc<Dentry>> {
    let key = parent_key(parent)?;
    let hash = hash_key(key, name);
    let mut table = TABLE.lock();
    table
        .bucket(hash)
        .iter()
        .find(|e| e.hash == hash && e.parent == key && e.dentry.name() == name)
        .map(|e| e.dentry.clone())
}

/// Inserts a dentry keyed by its parent and name.
///
/// Insertion is unconditional; callers avoid duplicates by holding the
/// parent's lookup path (`Dentry` resolution goes through the cache
/// first).
pub fn insert(parent: &Dentry, dentry: &Arc<Dentry>) {
    let Some(key) = parent_key(parent) else {
        return;
    };
    let hash = hash_key(key, dentry.name());
    let mut table = TABLE.lock();
    table.bucket(hash).push(Entry {
        hash,
        parent: key,
        dentry: dentry.clone(),
    });
}

/// Removes `(parent, name)`, returning the dentry if it was cached.
pub fn remove(parent: &Dentry, name: &str) -> Option<Arc<Dentry>> {
    let key = parent_key(parent)?;
    let hash = hash_key(key, name);
    let mut table = TABLE.lock();
    let bucket = table.bucket(hash);
    let pos = bucket
        .iter()
        .position(|e| e.hash == hash && e.parent == key && e.dentry.name() == name)?;
    Some(bucket.remove(pos).dentry)
}
