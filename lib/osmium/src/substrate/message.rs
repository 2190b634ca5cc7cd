use crate::substrate::ring::{Region, RingAlloc};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Message lifecycle. Only the producer moves a slot `Free -> Used`, only the consumer moves
/// it `Used -> Done`, and only the producer reclaims `Done -> Free` during garbage
/// collection. The ring head advances strictly in FIFO order, stopping at the first slot
/// that is not yet done.
pub const STATUS_FREE: u8 = 0;
pub const STATUS_USED: u8 = 1;
pub const STATUS_DONE: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    region: Region,
    data_size: usize,
}

struct Slot {
    status: AtomicU8,
    meta: UnsafeCell<SlotMeta>,
}

/// The memory shared between the producing and consuming thread: the payload bytes and the
/// slot headers. The producer writes a slot's payload and metadata only while the slot is
/// `Free`, and publishes with a release store of `Used`; the consumer reads them only after
/// observing `Used` through the channel queue's acquire, and hands the bytes back with a
/// release store of `Done` that the producer's gc acquires. That protocol is the entire
/// safety argument for the unchecked accesses below.
pub struct MessageBuffers {
    mem: UnsafeCell<Box<[u8]>>,
    slots: Box<[Slot]>,
}

unsafe impl Send for MessageBuffers {}
unsafe impl Sync for MessageBuffers {}

/// Handle to a message placed in a [`MessageBuffers`]. Plain data so it can ride through the
/// channel queues.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageRef {
    pub slot: u32,
}

impl MessageBuffers {
    fn new(num_slots: usize, ring_bytes: usize) -> MessageBuffers {
        let slots: Vec<Slot> = (0..num_slots)
            .map(|_| Slot {
                status: AtomicU8::new(STATUS_FREE),
                meta: UnsafeCell::new(SlotMeta::default()),
            })
            .collect();

        MessageBuffers {
            mem: UnsafeCell::new(vec![0u8; ring_bytes].into_boxed_slice()),
            slots: slots.into_boxed_slice(),
        }
    }

    /// The payload bytes of a message. Valid on the consumer side for any message received
    /// through a channel queue (status `Used`).
    #[inline]
    pub fn payload(&self, msg: MessageRef) -> &[u8] {
        let slot = &self.slots[msg.slot as usize];
        debug_assert_eq!(slot.status.load(Ordering::Acquire), STATUS_USED);

        let meta = unsafe { *slot.meta.get() };
        let mem = unsafe { &**self.mem.get() };
        &mem[meta.region.offset..meta.region.offset + meta.data_size]
    }

    /// Marks a message done, releasing it back to the producer's next gc pass.
    #[inline]
    pub fn done(&self, msg: MessageRef) {
        let slot = &self.slots[msg.slot as usize];
        debug_assert_eq!(slot.status.load(Ordering::Relaxed), STATUS_USED);
        slot.status.store(STATUS_DONE, Ordering::Release);
    }

    /// Copies the payload into owned memory and marks the message done, so the producer can
    /// reclaim ring space without waiting on the consumer's processing.
    #[inline]
    pub fn localize(&self, msg: MessageRef) -> Vec<u8> {
        let data = self.payload(msg).to_vec();
        self.done(msg);
        data
    }
}

/// The producer side of a message buffer pair: reserves, commits and garbage collects
/// messages. Exactly one `MessageSet` exists per [`MessageBuffers`].
pub struct MessageSet {
    shared: Arc<MessageBuffers>,
    ring: RingAlloc,
    slot_head: u64,
    slot_tail: u64,
    slot_mask: u64,
}

impl MessageSet {
    pub fn new(num_slots: usize, ring_bytes: usize) -> MessageSet {
        if !num_slots.is_power_of_two() {
            panic!("Message slot count must be a power of two, got {}", num_slots);
        }

        MessageSet {
            shared: Arc::new(MessageBuffers::new(num_slots, ring_bytes)),
            ring: RingAlloc::new(ring_bytes),
            slot_head: 0,
            slot_tail: 0,
            slot_mask: (num_slots - 1) as u64,
        }
    }

    /// The shared buffers, for handing to the consumer side.
    #[inline]
    pub fn buffers(&self) -> Arc<MessageBuffers> {
        self.shared.clone()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        (self.slot_tail - self.slot_head) as usize
    }

    /// Reserves writable space for a message of at most `size` bytes. Runs one gc pass and
    /// retries once when slots or ring space are exhausted before giving up.
    pub fn reserve(&mut self, size: usize) -> Option<Reservation> {
        if self.slot_tail - self.slot_head > self.slot_mask {
            self.gc();
            if self.slot_tail - self.slot_head > self.slot_mask {
                return None;
            }
        }

        let region = match self.ring.alloc(size) {
            Some(region) => region,
            None => {
                self.gc();
                self.ring.alloc(size)?
            }
        };

        Some(Reservation {
            set: self,
            region,
            committed: false,
        })
    }

    /// Walks the oldest messages and reclaims every one already marked done, stopping at the
    /// first message still in use.
    pub fn gc(&mut self) {
        while self.slot_head < self.slot_tail {
            let slot = &self.shared.slots[(self.slot_head & self.slot_mask) as usize];

            if slot.status.load(Ordering::Acquire) != STATUS_DONE {
                break;
            }

            let meta = unsafe { *slot.meta.get() };
            self.ring.free(meta.region.reserved);
            slot.status.store(STATUS_FREE, Ordering::Relaxed);
            self.slot_head += 1;
        }
    }

    #[inline]
    fn mem_mut(&mut self, region: Region) -> &mut [u8] {
        // Producer-exclusive access to a region no consumer can observe yet.
        let mem = unsafe { &mut **self.shared.mem.get() };
        &mut mem[region.offset..region.offset + region.len]
    }
}

/// An uncommitted message reservation. Write the payload through [`Reservation::data`], then
/// `commit` with the encoded size; dropping without committing releases the space.
pub struct Reservation<'a> {
    set: &'a mut MessageSet,
    region: Region,
    committed: bool,
}

impl<'a> Reservation<'a> {
    /// The writable payload area.
    #[inline]
    pub fn data(&mut self) -> &mut [u8] {
        let region = self.region;
        self.set.mem_mut(region)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.len
    }

    /// Publishes the message with its final payload size, trimming the unused remainder of
    /// the reservation back into the ring.
    pub fn commit(mut self, data_size: usize) -> MessageRef {
        debug_assert!(data_size <= self.region.len, "Commit larger than reservation");

        let region = self.set.ring.trim(self.region, data_size);
        let index = (self.set.slot_tail & self.set.slot_mask) as usize;
        let slot = &self.set.shared.slots[index];

        debug_assert_eq!(slot.status.load(Ordering::Relaxed), STATUS_FREE);

        unsafe {
            *slot.meta.get() = SlotMeta { region, data_size };
        }
        slot.status.store(STATUS_USED, Ordering::Release);

        self.set.slot_tail += 1;
        self.committed = true;

        MessageRef { slot: index as u32 }
    }
}

impl<'a> Drop for Reservation<'a> {
    fn drop(&mut self) {
        if !self.committed {
            // Nothing was allocated after this reservation, so trimming to zero hands the
            // whole range (wrap skip included) back to the ring.
            self.set.ring.free_last(self.region);
        }
    }
}
