use crate::event::Waker;
use crate::substrate::queue::AtomicQueue;
use crate::substrate::ring::{Region, RingAlloc};
use byteorder::{BigEndian, ByteOrder};
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::substrate::message::{STATUS_DONE, STATUS_USED};

/// Maximum control frame payload. Anything bigger belongs on a data channel.
pub const FRAME_MAX: usize = 256;

const FRAME_HEADER: usize = 8;
const RING_BYTES: usize = 32 * 1024;
const QUEUE_SLOTS: usize = 1024;

/// A typed control-plane frame. `ChannelOpen` and `ConfigSwap` carry ownership of a heap
/// object as a raw pointer produced by `into_raw`; the receiver reconstitutes it exactly
/// once. Everything else is plain data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Frame {
    DataReady { channel: u64 },
    Sleeping { channel: u64 },
    ChannelOpen { end: u64 },
    ChannelOpenAck { channel: u64 },
    ChannelClose { channel: u64 },
    ChannelCloseAck { channel: u64 },
    ConfigSwap { version: u64 },
    Exit,
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::DataReady { .. } => 1,
            Frame::Sleeping { .. } => 2,
            Frame::ChannelOpen { .. } => 3,
            Frame::ChannelOpenAck { .. } => 4,
            Frame::ChannelClose { .. } => 5,
            Frame::ChannelCloseAck { .. } => 6,
            Frame::ConfigSwap { .. } => 7,
            Frame::Exit => 8,
        }
    }

    fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = self.tag();

        let value = match self {
            Frame::DataReady { channel }
            | Frame::Sleeping { channel }
            | Frame::ChannelOpenAck { channel }
            | Frame::ChannelClose { channel }
            | Frame::ChannelCloseAck { channel } => *channel,
            Frame::ChannelOpen { end } => *end,
            Frame::ConfigSwap { version } => *version,
            Frame::Exit => 0,
        };

        BigEndian::write_u64(&mut buf[1..9], value);
        9
    }

    fn decode(buf: &[u8]) -> Option<Frame> {
        if buf.len() < 9 {
            return None;
        }

        let value = BigEndian::read_u64(&buf[1..9]);

        Some(match buf[0] {
            1 => Frame::DataReady { channel: value },
            2 => Frame::Sleeping { channel: value },
            3 => Frame::ChannelOpen { end: value },
            4 => Frame::ChannelOpenAck { channel: value },
            5 => Frame::ChannelClose { channel: value },
            6 => Frame::ChannelCloseAck { channel: value },
            7 => Frame::ConfigSwap { version: value },
            8 => Frame::Exit,
            _ => return None,
        })
    }
}

struct ControlMem {
    mem: UnsafeCell<Box<[u8]>>,
}

// Frame regions are single-writer under the status protocol shared with the data rings:
// the sender writes a frame only while its slot bytes are unpublished, the receiver reads
// it only between the queue pop (acquire) and its release store of `done`.
unsafe impl Send for ControlMem {}
unsafe impl Sync for ControlMem {}

impl ControlMem {
    #[inline]
    fn base(&self) -> *mut u8 {
        unsafe { (*self.mem.get()).as_mut_ptr() }
    }

    /// The status byte of the frame at `offset`, viewed atomically. Frame regions are
    /// 64-byte aligned so the cast is always valid for a one byte atomic.
    #[inline]
    unsafe fn status(&self, offset: usize) -> &AtomicU8 {
        &*(self.base().add(offset) as *const AtomicU8)
    }
}

/// The receiving half of a control plane: the shared queue, the user-event waker of the
/// owning thread, and the sender rings it must keep alive while frames are in flight.
pub struct ControlPort {
    queue: Arc<AtomicQueue>,
    waker: Waker,
    rings: Mutex<Vec<Arc<ControlMem>>>,
}

impl ControlPort {
    pub fn new(waker: Waker) -> ControlPort {
        ControlPort {
            queue: Arc::new(AtomicQueue::new(QUEUE_SLOTS)),
            waker,
            rings: Mutex::new(Vec::new()),
        }
    }

    /// Creates a sender bound to this port. Each sending thread gets its own sender, and with
    /// it its own frame ring.
    pub fn sender(&self) -> ControlSender {
        let mem = Arc::new(ControlMem {
            mem: UnsafeCell::new(vec![0u8; RING_BYTES].into_boxed_slice()),
        });

        self.rings.lock().expect("Control ring registry poisoned").push(mem.clone());

        ControlSender {
            mem,
            ring: RingAlloc::new(RING_BYTES),
            in_flight: VecDeque::new(),
            queue: self.queue.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Pops the next control frame, if any. Malformed frames are completed and skipped.
    pub fn pop(&self) -> Option<Frame> {
        loop {
            let raw = self.queue.pop()? as *const u8;

            // The pointer was produced by a sender from its Arc-held ring, which this port
            // keeps alive; the queue pop acquires the sender's release publish.
            let frame = unsafe {
                let status = &*(raw as *const AtomicU8);
                debug_assert_eq!(status.load(Ordering::Relaxed), STATUS_USED);

                let len = BigEndian::read_u16(std::slice::from_raw_parts(raw.add(2), 2)) as usize;
                let payload = std::slice::from_raw_parts(raw.add(FRAME_HEADER), len);
                let frame = Frame::decode(payload);

                status.store(STATUS_DONE, Ordering::Release);
                frame
            };

            match frame {
                Some(frame) => return Some(frame),
                None => continue,
            }
        }
    }

    /// Drains every queued frame, re-arms the user event, then drains once more to close the
    /// race against a sender that pushed between the last pop and the re-arm.
    pub fn drain(&self) -> Vec<Frame> {
        let mut frames = Vec::new();

        while let Some(frame) = self.pop() {
            frames.push(frame);
        }

        drop(self.waker.rearm());

        while let Some(frame) = self.pop() {
            frames.push(frame);
        }

        frames
    }
}

/// The sending half of a control plane. Owns a frame ring whose oldest completed frames are
/// lazily reclaimed; pushes frame offsets through the shared queue and triggers the
/// receiver's user event once per send.
pub struct ControlSender {
    mem: Arc<ControlMem>,
    ring: RingAlloc,
    in_flight: VecDeque<Region>,
    queue: Arc<AtomicQueue>,
    waker: Waker,
}

impl ControlSender {
    /// Copies a frame into the ring and queues it without waking the receiver. Returns false
    /// when neither gc nor retry could make room.
    pub fn push(&mut self, frame: Frame) -> bool {
        let mut payload = [0u8; FRAME_MAX];
        let len = frame.encode(&mut payload);

        let region = match self.alloc(FRAME_HEADER + len) {
            Some(region) => region,
            None => return false,
        };

        unsafe {
            let base = self.mem.base().add(region.offset);
            std::ptr::write_bytes(base, 0, FRAME_HEADER);
            BigEndian::write_u16(std::slice::from_raw_parts_mut(base.add(2), 2), len as u16);
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(FRAME_HEADER), len);
            self.mem.status(region.offset).store(STATUS_USED, Ordering::Release);
        }

        let raw = unsafe { self.mem.base().add(region.offset) } as u64;

        if !self.queue.push(raw) {
            // The receiver never saw it; complete it ourselves so gc reclaims the bytes.
            unsafe { self.mem.status(region.offset).store(STATUS_DONE, Ordering::Relaxed) };
            self.in_flight.push_back(region);
            self.gc();
            return false;
        }

        self.in_flight.push_back(region);
        true
    }

    /// Pushes a frame and triggers the receiver's user event.
    pub fn send(&mut self, frame: Frame) -> bool {
        if !self.push(frame) {
            return false;
        }

        drop(self.waker.wake());
        true
    }

    /// Reclaims the oldest completed frames, stopping at the first one still unread.
    pub fn gc(&mut self) {
        while let Some(&region) = self.in_flight.front() {
            let done = unsafe {
                self.mem.status(region.offset).load(Ordering::Acquire) == STATUS_DONE
            };

            if !done {
                break;
            }

            self.ring.free(region.reserved);
            self.in_flight.pop_front();
        }
    }

    fn alloc(&mut self, size: usize) -> Option<Region> {
        match self.ring.alloc(size) {
            Some(region) => Some(region),
            None => {
                self.gc();
                self.ring.alloc(size)
            }
        }
    }
}
