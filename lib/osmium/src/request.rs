use crate::config::ConfigVersion;
use crate::packet::{AttrList, Envelope, PacketCode, Priority};
use crate::policy::interp::InterpStack;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static REQUEST_NUMBER: AtomicU64 = AtomicU64::new(1);

/// Request status flags. `finished` only ever goes false to true; once set, no interpreter
/// step runs for the request again.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestFlags {
    pub finished: bool,
    pub proxied: bool,
    pub delayed_reject: bool,
    pub reprocess: bool,
    pub stop_now: bool,
    /// Internally generated; never enters the tracker and never produces a reply.
    pub fake: bool,
}

/// Typed data attached to a request by modules. Dropped in insertion order when the request
/// is released.
pub trait RequestData: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any + Send> RequestData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Accumulates the CPU time a request actually spends running, as distinct from the wall
/// clock time it exists. `running` only advances between a resume and the matching yield or
/// end, and every advance is mirrored into the worker's aggregate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeTracking {
    pub when: u64,
    pub running: u64,
}

impl TimeTracking {
    #[inline]
    pub fn start(&mut self, now: u64) {
        self.when = now;
    }

    #[inline]
    pub fn resume(&mut self, now: u64) {
        self.when = now;
    }

    #[inline]
    pub fn yield_(&mut self, now: u64, total: &mut u64) {
        let elapsed = now.saturating_sub(self.when);
        self.running += elapsed;
        *total += elapsed;
        self.when = now;
    }

    #[inline]
    pub fn end(&mut self, now: u64, total: &mut u64) {
        self.yield_(now, total);
    }
}

/// A single unit of processing: one decoded packet on its way through policy to a reply.
pub struct Request {
    pub number: u64,
    pub recv_time: u64,
    pub envelope: Envelope,
    pub attrs: AttrList,
    pub reply_code: Option<PacketCode>,
    pub reply_attrs: AttrList,
    pub priority: Priority,
    pub channel: u64,
    pub listener: u32,
    /// The tracker entry's live timestamp; a mismatch against `recv_time` means the client
    /// retransmitted and this request is superseded.
    pub start_time: Arc<AtomicU64>,
    pub config: Arc<ConfigVersion>,
    pub tracking: TimeTracking,
    pub flags: RequestFlags,
    pub(crate) stack: InterpStack,
    data: Vec<(&'static str, Box<dyn RequestData>)>,
}

impl Request {
    pub fn new(
        envelope: Envelope,
        attrs: AttrList,
        recv_time: u64,
        priority: Priority,
        channel: u64,
        listener: u32,
        start_time: Arc<AtomicU64>,
        config: Arc<ConfigVersion>,
    ) -> Request {
        Request {
            number: REQUEST_NUMBER.fetch_add(1, Ordering::Relaxed),
            recv_time,
            envelope,
            attrs,
            reply_code: None,
            reply_attrs: AttrList::new(),
            priority,
            channel,
            listener,
            start_time,
            config,
            tracking: TimeTracking::default(),
            flags: RequestFlags::default(),
            stack: InterpStack::new(),
            data: Vec::new(),
        }
    }

    /// True while the tracker still considers this packet current.
    #[inline]
    pub fn still_current(&self) -> bool {
        self.start_time.load(Ordering::Acquire) == self.recv_time
    }

    /// Attaches a typed datum under a key. Existing data under the same key is replaced in
    /// place, keeping the original drop position.
    pub fn attach<T: RequestData>(&mut self, key: &'static str, value: T) {
        match self.data.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = Box::new(value),
            None => self.data.push((key, Box::new(value))),
        }
    }

    pub fn data_ref<T: RequestData>(&self, key: &str) -> Option<&T> {
        self.data
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, value)| value.as_any().downcast_ref())
    }

    pub fn data_mut<T: RequestData>(&mut self, key: &str) -> Option<&mut T> {
        self.data
            .iter_mut()
            .find(|(k, _)| *k == key)
            .and_then(|(_, value)| value.as_any_mut().downcast_mut())
    }

    /// Detaches and returns a typed datum.
    pub fn take_data<T: RequestData>(&mut self, key: &str) -> Option<Box<T>> {
        let index = self.data.iter().position(|(k, _)| *k == key)?;
        let (_, value) = self.data.remove(index);
        value.into_any().downcast().ok()
    }
}
