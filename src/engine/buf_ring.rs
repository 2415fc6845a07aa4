//! Ring-mapped receive buffer group.
//!
//! A contiguous backing allocation split into fixed-size slots and
//! registered with the kernel under a single group id. The kernel picks a
//! slot for each receive; the completion's flags say which one. Slots are
//! returned to the group by publishing the entry again and advancing the
//! shared tail.

use io_uring::types::BufRingEntry;
use io_uring::IoUring;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

/// The single buffer group used for receives.
pub const RECV_BGID: u16 = 0;

/// A provided buffer ring registered with the kernel.
pub struct BufRing {
    /// Ring entries shared with the kernel.
    ring_ptr: *mut BufRingEntry,
    /// Backing store for the buffer slots.
    slots_ptr: *mut u8,
    ring_layout: Layout,
    slots_layout: Layout,
    /// Slot count; must be a power of two for the tail mask.
    entries: u16,
    /// Size of each slot.
    slot_size: usize,
    /// Publish position, mirrored into the ring header on every update.
    tail: AtomicU16,
}

impl BufRing {
    /// Allocate the group and register it with the ring under `bgid`.
    pub fn new(ring: &IoUring, entries: u16, slot_size: usize, bgid: u16) -> io::Result<Self> {
        if !entries.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer ring entries must be a power of two",
            ));
        }

        // Both regions are page-aligned; the kernel maps the entry ring.
        let ring_layout =
            Layout::from_size_align(std::mem::size_of::<BufRingEntry>() * entries as usize, 4096)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ring_ptr = unsafe { alloc_zeroed(ring_layout) as *mut BufRingEntry };
        if ring_ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate buffer ring entries",
            ));
        }

        let slots_layout = Layout::from_size_align(slot_size * entries as usize, 4096)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let slots_ptr = unsafe { alloc_zeroed(slots_layout) };
        if slots_ptr.is_null() {
            unsafe { dealloc(ring_ptr as *mut u8, ring_layout) };
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate buffer slots",
            ));
        }

        let group = Self {
            ring_ptr,
            slots_ptr,
            ring_layout,
            slots_layout,
            entries,
            slot_size,
            tail: AtomicU16::new(0),
        };

        // Hand every slot to the kernel before registration.
        for bid in 0..entries {
            group.publish(bid);
        }

        // Safety: the entry ring and slots stay allocated for the lifetime
        // of the registration; `BufRing` is dropped only after the IoUring.
        unsafe {
            ring.submitter()
                .register_buf_ring(ring_ptr as u64, entries, bgid)?;
        }

        Ok(group)
    }

    /// Borrow the first `len` bytes of a slot the kernel filled.
    ///
    /// The slice is only valid until the slot is recycled.
    pub fn slice(&self, bid: u16, len: usize) -> &[u8] {
        debug_assert!(bid < self.entries);
        let len = len.min(self.slot_size);
        unsafe {
            std::slice::from_raw_parts(self.slots_ptr.add(bid as usize * self.slot_size), len)
        }
    }

    /// Return a slot to the group after its completion has been handled.
    pub fn recycle(&self, bid: u16) {
        self.publish(bid);
    }

    /// Write a slot's entry at the tail and advance it.
    fn publish(&self, bid: u16) {
        let tail = self.tail.load(Ordering::Relaxed);
        let idx = tail & (self.entries - 1);

        unsafe {
            let entry = self.ring_ptr.add(idx as usize);
            (*entry).set_addr(self.slots_ptr.add(bid as usize * self.slot_size) as u64);
            (*entry).set_len(self.slot_size as u32);
            (*entry).set_bid(bid);
        }

        let new_tail = tail.wrapping_add(1);
        self.tail.store(new_tail, Ordering::Release);

        // The kernel reads the tail from the ring header.
        unsafe {
            let tail_ptr = BufRingEntry::tail(self.ring_ptr) as *mut u16;
            std::ptr::write_volatile(tail_ptr, new_tail);
        }
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        // The ring must already be gone (or about to be); dropping the
        // backing store while a registration is live would hand freed
        // memory to the kernel.
        unsafe {
            dealloc(self.slots_ptr, self.slots_layout);
            dealloc(self.ring_ptr as *mut u8, self.ring_layout);
        }
    }
}

// One engine, one thread: the group is never shared across threads, but the
// owning server may be moved into a thread at startup.
unsafe impl Send for BufRing {}
