//! The Drive class: request slab, submit queues, completion, cached reads.
//!
//! # Request lifecycle
//!
//! `read_async` / `write_async` carve an [`IoRequest`] out of the drive's
//! slab (never blocking) and hand it to the driver's
//! [`DriveIo::handle_io`]. A `true` return means the hardware queue took
//! it; `false` parks it on the software submit queue, from which
//! completions pull the next request. The driver's IRQ handler finishes a
//! request with [`Drive::complete_io`], passing the 16-bit id — the slab's
//! index↔address bijection turns it back into the descriptor without any
//! pointer crossing the DMA boundary.
//!
//! # Synchronous reads
//!
//! [`Drive::read_block`] enrolls the current task on the request's
//! embedded wait queue *before* submitting, then sleeps. Reversing that
//! order would race the completion; see the wait-queue docs.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

use boson_core::percpu::{CpuLocal, MAX_CPUS};
use boson_core::sync::{IrqSpinLock, SpinLock};
use boson_core::{Error, Result, ktrace};
use boson_mm::cache::{BlockSize, CacheBlock, CacheController};
use boson_mm::oma::SafeOma;
use boson_sched::waitq::WaitQueue;
use boson_sched::{init_wait, wait};

/// In-flight request descriptors per slab arena.
pub const REQUESTS_PER_ARENA: u32 = 198;

bitflags! {
    /// Drive capabilities.
    #[derive(Debug, Clone, Copy)]
    pub struct DriveFlags: u32 {
        /// One submit queue per CPU instead of a single locked queue.
        const MULTI_QUEUE   = 1 << 0;
        /// The drive may carry a partition table.
        const PARTITIONABLE = 1 << 1;
    }
}

/// Direction of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoOperation {
    /// Device-to-memory.
    Read = 0,
    /// Memory-to-device.
    Write = 1,
}

/// Completion status of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IoStatus {
    /// Not yet completed.
    Pending = 0,
    /// Completed successfully.
    Success = 1,
    /// The device reported failure.
    Failed = 2,
}

impl IoStatus {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Pending,
            1 => Self::Success,
            _ => Self::Failed,
        }
    }
}

/// Completion callback, invoked from the driver's IRQ context.
pub type IoCallback = fn(&IoRequest, IoStatus);

/// An in-flight block request, living in the drive's slab.
pub struct IoRequest {
    /// Slab slot ordinal; id ↔ address is a fixed bijection.
    pub id: u16,
    /// Direction.
    pub operation: IoOperation,
    /// Starting logical block address.
    pub lba: u64,
    /// Number of logical blocks.
    pub lba_count: u32,
    /// Physical buffer address handed to the device.
    pub buffer: *mut u8,
    /// Completion callback.
    callback: IoCallback,
    /// Opaque cookie for the callback.
    pub context: *mut (),
    /// Tasks blocked on this request.
    pub wait: WaitQueue,
    /// Software submit queue link, guarded by the queue lock.
    next: Cell<*mut IoRequest>,
}

// SAFETY: Raw fields are either immutable after construction or guarded
// (next by the submit queue lock, wait internally atomic).
unsafe impl Send for IoRequest {}
// SAFETY: As above.
unsafe impl Sync for IoRequest {}

/// Block-driver interface.
pub trait DriveIo: Send + Sync {
    /// Offers a request to the device.
    ///
    /// Returns `true` if the device accepted it into its hardware queue;
    /// `false` asks the drive to park it on the software queue, to be
    /// re-offered when a completion frees device slots.
    fn handle_io(&self, drive: &Drive, request: &IoRequest) -> bool;
}

// ---------------------------------------------------------------------------
// Software submit queue
// ---------------------------------------------------------------------------

/// Intrusive FIFO of parked requests.
struct ReqList {
    head: *mut IoRequest,
    tail: *mut IoRequest,
    len: usize,
}

// SAFETY: Only touched under the owning lock.
unsafe impl Send for ReqList {}

impl ReqList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    fn push_back(&mut self, req: NonNull<IoRequest>) {
        // SAFETY: Requests stay alive while parked (slab slot held).
        unsafe { req.as_ref() }.next.set(ptr::null_mut());
        if self.tail.is_null() {
            self.head = req.as_ptr();
        } else {
            // SAFETY: Tail is a live parked request.
            unsafe { (*self.tail).next.set(req.as_ptr()) };
        }
        self.tail = req.as_ptr();
        self.len += 1;
    }

    fn pop_front(&mut self) -> Option<NonNull<IoRequest>> {
        let head = NonNull::new(self.head)?;
        // SAFETY: Head is a live parked request.
        self.head = unsafe { head.as_ref() }.next.get();
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        self.len -= 1;
        Some(head)
    }
}

/// Submit queue geometry, chosen by [`DriveFlags::MULTI_QUEUE`].
enum SubmitQueues {
    /// One queue, shared: spinlock-guarded.
    Single(IrqSpinLock<ReqList>),
    /// One queue per CPU: only the owning CPU pushes and pops, with IRQs
    /// masked by the lock, so the lock is never contended.
    PerCpu(CpuLocal<IrqSpinLock<ReqList>>),
}

impl SubmitQueues {
    fn queue(&self) -> &IrqSpinLock<ReqList> {
        match self {
            Self::Single(q) => q,
            Self::PerCpu(per_cpu) => per_cpu.get(),
        }
    }
}

// ---------------------------------------------------------------------------
// Partitions
// ---------------------------------------------------------------------------

/// A contiguous LBA range of a drive.
#[derive(Debug, Clone)]
pub struct Partition {
    /// 0 is the whole-drive base partition; GPT entries start at 1.
    pub index: u32,
    /// First LBA of the range.
    pub first_lba: u64,
    /// Number of LBAs.
    pub lba_count: u64,
    /// Device-node name (`<drive>N` or `<drive>pN`).
    pub name: String,
}

impl Partition {
    /// Byte offset of the partition start.
    #[must_use]
    pub fn byte_offset(&self, lba_shift: u32) -> u64 {
        self.first_lba << lba_shift
    }
}

// ---------------------------------------------------------------------------
// Drive
// ---------------------------------------------------------------------------

/// A block device.
pub struct Drive {
    name: String,
    lba_size: u32,
    lba_shift: u32,
    capacity: u64,
    flags: DriveFlags,
    queues: SubmitQueues,
    requests: SafeOma,
    /// Logical-block cache for this drive.
    pub cache: CacheController,
    partitions: SpinLock<Vec<Arc<Partition>>>,
    io: Arc<dyn DriveIo>,
}

/// Arena rank holding [`REQUESTS_PER_ARENA`] request slots plus bitmap.
fn request_arena_rank() -> u32 {
    let stride = (core::mem::size_of::<IoRequest>() + 15) & !15;
    let needed = REQUESTS_PER_ARENA as usize * stride + 64;
    let mut rank = 0;
    while boson_mm::frames::rank_bytes(rank) < needed {
        rank += 1;
    }
    rank
}

impl Drive {
    /// Creates a drive. `lba_size` must be a power of two; `capacity` is
    /// in bytes. A partitionable drive starts with the base partition
    /// covering the whole device.
    #[must_use]
    pub fn new(
        name: String,
        lba_size: u32,
        capacity: u64,
        flags: DriveFlags,
        io: Arc<dyn DriveIo>,
    ) -> Arc<Self> {
        assert!(lba_size.is_power_of_two());
        let lba_shift = lba_size.trailing_zeros();
        let stride = (core::mem::size_of::<IoRequest>() + 15) & !15;
        let queues = if flags.contains(DriveFlags::MULTI_QUEUE) {
            SubmitQueues::PerCpu(CpuLocal::new(
                [const { IrqSpinLock::new(ReqList::new()) }; MAX_CPUS],
            ))
        } else {
            SubmitQueues::Single(IrqSpinLock::new(ReqList::new()))
        };
        let mut partitions = Vec::new();
        if flags.contains(DriveFlags::PARTITIONABLE) {
            partitions.push(Arc::new(Partition {
                index: 0,
                first_lba: 0,
                lba_count: capacity >> lba_shift,
                name: name.clone(),
            }));
        }
        Arc::new(Self {
            name,
            lba_size,
            lba_shift,
            capacity,
            flags,
            queues,
            requests: SafeOma::with_capacity(stride, request_arena_rank(), REQUESTS_PER_ARENA),
            cache: CacheController::new(BlockSize::Medium),
            partitions: SpinLock::new(partitions),
            io,
        })
    }

    /// Drive name (`nvme0`, `ram0`, …).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical block size in bytes.
    #[must_use]
    pub fn lba_size(&self) -> u32 {
        self.lba_size
    }

    /// log2 of the logical block size.
    #[must_use]
    pub fn lba_shift(&self) -> u32 {
        self.lba_shift
    }

    /// Capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Capability flags.
    #[must_use]
    pub fn flags(&self) -> DriveFlags {
        self.flags
    }

    /// Snapshot of the partition list.
    #[must_use]
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.lock().clone()
    }

    /// Appends a partition (GPT probe).
    pub fn add_partition(&self, partition: Arc<Partition>) {
        self.partitions.lock().push(partition);
    }

    /// In-flight request count (diagnostics).
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.requests.used()
    }

    // -- Async submission -------------------------------------------------

    /// Builds a request in a fresh slab slot. Never blocks.
    fn alloc_request(
        &self,
        operation: IoOperation,
        lba: u64,
        lba_count: u32,
        buffer: *mut u8,
        callback: IoCallback,
        context: *mut (),
    ) -> Result<NonNull<IoRequest>> {
        let (slot, index) = self.requests.alloc_indexed()?;
        debug_assert!(index <= u16::MAX as u32, "request id overflows 16 bits");
        let req = slot.cast::<IoRequest>();
        // SAFETY: The slot is an exclusive, properly sized and aligned
        // slab allocation.
        unsafe {
            req.as_ptr().write(IoRequest {
                id: index as u16,
                operation,
                lba,
                lba_count,
                buffer,
                callback,
                context,
                wait: WaitQueue::new(),
                next: Cell::new(ptr::null_mut()),
            });
        }
        Ok(req)
    }

    /// Hands a request to the driver; parks it on the software queue if
    /// the device is full.
    fn submit(&self, req: NonNull<IoRequest>) {
        // SAFETY: The request was just built in a live slab slot.
        let accepted = self.io.handle_io(self, unsafe { req.as_ref() });
        if !accepted {
            self.queues.queue().lock().push_back(req);
        }
    }

    /// Submits an asynchronous read of `lba_count` blocks. Never blocks;
    /// the callback fires from the driver's IRQ context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if no request slot is available; the
    /// request is not submitted.
    pub fn read_async(
        &self,
        lba: u64,
        lba_count: u32,
        buffer: *mut u8,
        callback: IoCallback,
        context: *mut (),
    ) -> Result<u16> {
        let req = self.alloc_request(IoOperation::Read, lba, lba_count, buffer, callback, context)?;
        // SAFETY: Freshly built request.
        let id = unsafe { req.as_ref() }.id;
        self.submit(req);
        Ok(id)
    }

    /// Submits an asynchronous write. Symmetric to [`Drive::read_async`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`] if no request slot is available.
    pub fn write_async(
        &self,
        lba: u64,
        lba_count: u32,
        buffer: *mut u8,
        callback: IoCallback,
        context: *mut (),
    ) -> Result<u16> {
        let req =
            self.alloc_request(IoOperation::Write, lba, lba_count, buffer, callback, context)?;
        // SAFETY: Freshly built request.
        let id = unsafe { req.as_ref() }.id;
        self.submit(req);
        Ok(id)
    }

    // -- Completion -------------------------------------------------------

    /// Finishes the request with the given id. Driver IRQ context.
    ///
    /// Invokes the callback, wakes waiters, frees the slab slot, then
    /// offers the next parked request to the device.
    pub fn complete_io(&self, id: u16, status: IoStatus) {
        let Some(slot) = self.requests.addr_of(id as u32) else {
            ktrace!("{}: completion for stale id {id}", self.name);
            return;
        };
        let req = slot.cast::<IoRequest>();
        // SAFETY: The slab slot holds a live request until freed below.
        unsafe {
            let r = req.as_ref();
            (r.callback)(r, status);
            r.wait.wake_all();
            ptr::drop_in_place(req.as_ptr());
        }
        self.requests.free_index(id as u32);
        self.pump();
    }

    /// Offers one parked request to the device.
    fn pump(&self) {
        let next = self.queues.queue().lock().pop_front();
        if let Some(req) = next {
            self.submit(req);
        }
    }

    // -- Synchronous cached reads ----------------------------------------

    /// Number of LBAs covered by one cache block.
    fn lbas_per_block(&self) -> u32 {
        (self.cache.block_size().bytes() as u32) >> self.lba_shift
    }

    /// Synchronously reads the cache block with the given index,
    /// populating it from the device on a miss.
    ///
    /// # Errors
    ///
    /// `NoMemory` on allocation failure, `IoFailed` if the device reports
    /// an error.
    pub fn read_block(&self, index: u32) -> Result<Arc<CacheBlock>> {
        if let Some(block) = self.cache.get(index) {
            return Ok(block);
        }
        let block = self.cache.create_block(index)?;
        let lba = index as u64 * self.lbas_per_block() as u64;
        self.read_sync(lba, self.lbas_per_block(), block.base().as_ptr())?;
        Ok(self.cache.insert_or_free(block))
    }

    /// Synchronous read: enroll, submit, sleep until completion.
    ///
    /// # Errors
    ///
    /// `NoMemory` if no request slot is free, `IoFailed` on device error.
    pub fn read_sync(&self, lba: u64, lba_count: u32, buffer: *mut u8) -> Result<()> {
        let status_cell = AtomicU8::new(IoStatus::Pending as u8);

        fn on_complete(req: &IoRequest, status: IoStatus) {
            // SAFETY: The context points at the submitter's status cell,
            // alive until it observes the store below.
            let cell = unsafe { &*req.context.cast::<AtomicU8>() };
            cell.store(status as u8, Ordering::Release);
        }

        let req = self.alloc_request(
            IoOperation::Read,
            lba,
            lba_count,
            buffer,
            on_complete,
            (&raw const status_cell).cast_mut().cast(),
        )?;

        // Enroll before submitting: the completion may fire on another
        // CPU the instant the device sees the request.
        let entry = init_wait();
        if let Some(entry) = &entry {
            // SAFETY: The entry outlives the wait (this frame).
            unsafe { req.as_ref().wait.enroll(entry) };
        }
        self.submit(req);
        match entry {
            Some(_) => wait(),
            // Pre-scheduler (or host) fallback: poll the cell.
            None => {
                while IoStatus::from_raw(status_cell.load(Ordering::Acquire)) == IoStatus::Pending {
                    core::hint::spin_loop();
                }
            }
        }

        match IoStatus::from_raw(status_cell.load(Ordering::Acquire)) {
            IoStatus::Success => Ok(()),
            _ => Err(Error::IoFailed),
        }
    }

    /// Reads `len` bytes at byte `offset` through the block cache.
    ///
    /// # Errors
    ///
    /// Propagates [`Drive::read_block`] failures.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<alloc::vec::Vec<u8>> {
        let block_bytes = self.cache.block_size().bytes() as u64;
        let mut out = alloc::vec::Vec::with_capacity(len);
        let mut pos = offset;
        let end = offset + len as u64;
        let mut cursor = self.read_cached(pos)?;
        while pos < end {
            self.read_cached_next(&mut cursor, pos)?;
            let inside = (pos % block_bytes) as usize;
            let take = ((end - pos) as usize).min(block_bytes as usize - inside);
            out.extend_from_slice(&cursor.block().bytes()[inside..inside + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    /// Opens a cursor over the cache at the given byte offset.
    ///
    /// # Errors
    ///
    /// Propagates [`Drive::read_block`] failures.
    pub fn read_cached(&self, offset: u64) -> Result<CachedCursor> {
        let block_bytes = self.cache.block_size().bytes() as u64;
        let index = (offset / block_bytes) as u32;
        Ok(CachedCursor {
            block: self.read_block(index)?,
            index,
        })
    }

    /// Rolls a cursor to a new byte offset, keeping the current block
    /// reference when the offset stays inside it (sequential scans skip
    /// the cache lookup entirely).
    ///
    /// # Errors
    ///
    /// Propagates [`Drive::read_block`] failures.
    pub fn read_cached_next(&self, cursor: &mut CachedCursor, offset: u64) -> Result<()> {
        let block_bytes = self.cache.block_size().bytes() as u64;
        let index = (offset / block_bytes) as u32;
        if index != cursor.index {
            cursor.block = self.read_block(index)?;
            cursor.index = index;
        }
        Ok(())
    }
}

/// A position in a drive's block cache, holding the covering block.
pub struct CachedCursor {
    block: Arc<CacheBlock>,
    index: u32,
}

impl CachedCursor {
    /// The covering cache block.
    #[must_use]
    pub fn block(&self) -> &Arc<CacheBlock> {
        &self.block
    }

    /// Bytes of the block starting at `offset` within the drive, clamped
    /// to the block end.
    #[must_use]
    pub fn bytes_at(&self, offset: u64, block_bytes: usize) -> &[u8] {
        let inside = (offset as usize) % block_bytes;
        &self.block.bytes()[inside..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// RAM-backed driver completing synchronously inside `handle_io`.
    struct RamDisk {
        store: Mutex<Vec<u8>>,
        lba_size: usize,
        /// When false, reject everything (exercise the software queue).
        accept: core::sync::atomic::AtomicBool,
        seen: Mutex<Vec<u16>>,
    }

    impl RamDisk {
        fn new(capacity: usize, lba_size: usize) -> Self {
            Self {
                store: Mutex::new(vec![0; capacity]),
                lba_size,
                accept: core::sync::atomic::AtomicBool::new(true),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl DriveIo for RamDisk {
        fn handle_io(&self, drive: &Drive, request: &IoRequest) -> bool {
            if !self.accept.load(Ordering::SeqCst) {
                return false;
            }
            self.seen.lock().unwrap().push(request.id);
            let offset = request.lba as usize * self.lba_size;
            let len = request.lba_count as usize * self.lba_size;
            let id = request.id;
            {
                let mut store = self.store.lock().unwrap();
                match request.operation {
                    // SAFETY: The submitter's buffer covers `len` bytes.
                    IoOperation::Read => unsafe {
                        ptr::copy_nonoverlapping(store[offset..].as_ptr(), request.buffer, len);
                    },
                    IoOperation::Write => unsafe {
                        ptr::copy_nonoverlapping(request.buffer, store[offset..].as_mut_ptr(), len);
                    },
                }
            }
            drive.complete_io(id, IoStatus::Success);
            true
        }
    }

    fn mkdrive(capacity: usize) -> (Arc<Drive>, Arc<RamDisk>) {
        test_support::install_frames();
        let disk = Arc::new(RamDisk::new(capacity, 512));
        let drive = Drive::new(
            String::from("ram0"),
            512,
            capacity as u64,
            DriveFlags::PARTITIONABLE,
            disk.clone(),
        );
        (drive, disk)
    }

    #[test]
    fn request_lifecycle_completes_once() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        static LAST_STATUS: AtomicU8 = AtomicU8::new(IoStatus::Pending as u8);
        fn record(_req: &IoRequest, status: IoStatus) {
            FIRED.fetch_add(1, Ordering::SeqCst);
            LAST_STATUS.store(status as u8, Ordering::SeqCst);
        }

        let (drive, _disk) = mkdrive(1 << 20);
        let mut buf = vec![0u8; 8 * 512];
        let before = FIRED.load(Ordering::SeqCst);
        drive
            .read_async(0, 8, buf.as_mut_ptr(), record, ptr::null_mut())
            .unwrap();
        // Synchronous driver: already completed.
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 1);
        assert_eq!(
            IoStatus::from_raw(LAST_STATUS.load(Ordering::SeqCst)),
            IoStatus::Success
        );
        // The slab slot was freed.
        assert_eq!(drive.inflight(), 0);
    }

    #[test]
    fn rejected_requests_park_in_fifo_order() {
        fn nop(_req: &IoRequest, _status: IoStatus) {}

        let (drive, disk) = mkdrive(1 << 20);
        disk.accept.store(false, Ordering::SeqCst);
        let mut buf = vec![0u8; 512];
        let id1 = drive
            .read_async(1, 1, buf.as_mut_ptr(), nop, ptr::null_mut())
            .unwrap();
        let id2 = drive
            .read_async(2, 1, buf.as_mut_ptr(), nop, ptr::null_mut())
            .unwrap();
        assert_eq!(drive.inflight(), 2);
        assert!(disk.seen.lock().unwrap().is_empty());

        // Device drains: pump offers parked requests in submit order.
        disk.accept.store(true, Ordering::SeqCst);
        drive.pump();
        // Completing id1 pumps id2 automatically.
        let seen = disk.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![id1, id2]);
        assert_eq!(drive.inflight(), 0);
    }

    #[test]
    fn read_write_roundtrip_through_device() {
        fn nop(_req: &IoRequest, _status: IoStatus) {}

        let (drive, _disk) = mkdrive(1 << 20);
        let mut out = vec![0u8; 512];
        out[..32].copy_from_slice(b"boson block layer payload.......");
        drive
            .write_async(4, 1, out.as_mut_ptr(), nop, ptr::null_mut())
            .unwrap();
        let mut readback = vec![0u8; 512];
        drive
            .read_async(4, 1, readback.as_mut_ptr(), nop, ptr::null_mut())
            .unwrap();
        assert_eq!(readback, out);
    }

    #[test]
    fn sync_read_resolves_wake_race_without_losing_the_task() {
        use boson_sched::task::SleepState;

        let _gate = test_support::current_gate();
        // The device completes inside submit, so the wakeup always lands
        // between enroll and wait(): the task must observe it and keep
        // running instead of sleeping forever.
        let (drive, _disk) = mkdrive(1 << 20);
        fn noop_entry(_: usize) {}
        let task = boson_sched::task::Task::new_kernel("reader", noop_entry, 0, 0).unwrap();
        boson_sched::adopt_boot_task(task.clone());

        let block = drive.read_block(5).unwrap();
        assert_eq!(block.index(), 5);
        assert_eq!(task.sleep_state(), SleepState::Awake);
        assert_eq!(boson_sched::scheduler().preempt_depth(), 0);
        assert_eq!(drive.inflight(), 0);

        // Detach the adopted task so later tests run the poll path.
        assert!(boson_sched::scheduler::detach_boot_task().is_some());
    }

    #[test]
    fn read_block_populates_and_hits_cache() {
        let _gate = test_support::current_gate();
        let (drive, disk) = mkdrive(1 << 20);
        {
            let mut store = disk.store.lock().unwrap();
            store[0..4].copy_from_slice(b"gptX");
        }
        let block = drive.read_block(0).unwrap();
        assert_eq!(&block.bytes()[..4], b"gptX");
        let submissions = disk.seen.lock().unwrap().len();
        // Second read is a pure cache hit.
        let again = drive.read_block(0).unwrap();
        assert!(Arc::ptr_eq(&block, &again));
        assert_eq!(disk.seen.lock().unwrap().len(), submissions);
    }

    #[test]
    fn cursor_reuses_block_within_range() {
        let _gate = test_support::current_gate();
        let (drive, disk) = mkdrive(1 << 20);
        let block_bytes = drive.cache.block_size().bytes() as u64;
        let mut cursor = drive.read_cached(0).unwrap();
        let first = Arc::as_ptr(cursor.block());
        let submissions = disk.seen.lock().unwrap().len();

        // Move within the same block: no new read.
        drive.read_cached_next(&mut cursor, block_bytes - 1).unwrap();
        assert_eq!(Arc::as_ptr(cursor.block()), first);
        assert_eq!(disk.seen.lock().unwrap().len(), submissions);

        // Cross the block boundary: one new read.
        drive.read_cached_next(&mut cursor, block_bytes).unwrap();
        assert_ne!(Arc::as_ptr(cursor.block()), first);
        assert_eq!(disk.seen.lock().unwrap().len(), submissions + 1);
    }

    #[test]
    fn base_partition_covers_whole_drive() {
        let (drive, _disk) = mkdrive(1 << 20);
        let parts = drive.partitions();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].index, 0);
        assert_eq!(parts[0].lba_count, (1 << 20) / 512);
    }
}
