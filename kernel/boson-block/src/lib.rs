//! Block I/O engine.
//!
//! [`drive::Drive`] is the class every block driver implements against:
//! request descriptors come from a fixed-capacity slab whose global index
//! doubles as the wire id, submission goes through per-CPU or single
//! software queues, and completion is dispatched by id from the driver's
//! IRQ handler. Cache-backed reads sit on top via the mm crate's block
//! cache.
//!
//! [`gpt`] parses GUID partition tables into the drive's partition list.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod drive;
pub mod gpt;

pub use drive::{
    CachedCursor, Drive, DriveFlags, DriveIo, IoCallback, IoOperation, IoRequest, IoStatus,
    Partition,
};
