use crate::error::{EngineError, EngineResult};
use crate::packet::{Envelope, Priority};
use crate::substrate::control::{ControlSender, Frame};
use crate::substrate::message::{MessageBuffers, MessageRef, MessageSet, Reservation};
use crate::substrate::queue::PtrQueue;
use quartz::logging::{self, Logger};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

pub const STATE_CLOSED: u8 = 0;
pub const STATE_OPENING: u8 = 1;
pub const STATE_OPEN: u8 = 2;
pub const STATE_CLOSING: u8 = 3;

/// Why a worker bounced a request back without processing it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NakReason {
    Aged,
    Decode,
    BufferFull,
    QueueFull,
    Superseded,
}

/// Timing stamps carried on every reply, on the engine's monotonic nanosecond scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyTimes {
    /// Total CPU time the worker has spent running requests.
    pub cpu_time: u64,
    /// CPU time spent on this request alone.
    pub processing_time: u64,
    /// When the original request was received.
    pub request_time: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum DataKind {
    NewRequest,
    Reply(ReplyTimes),
    Nak(NakReason),
    /// Worker asks the network thread to transmit a packet upstream on its behalf.
    ProxyRequest { request_number: u64, upstream: SocketAddr },
    /// Correlated upstream reply delivered back to the yielded request.
    ProxyReply { request_number: u64 },
    /// The upstream retry budget ran out.
    ProxyExpired { request_number: u64 },
}

/// One message riding a channel queue. The payload bytes stay in the sending side's message
/// buffers (or in `localized` once a worker has copied them out); everything else is plain
/// metadata.
pub struct ChannelData {
    pub kind: DataKind,
    pub channel: u64,
    pub listener: u32,
    pub priority: Priority,
    pub when: u64,
    pub envelope: Envelope,
    pub start_time: Arc<AtomicU64>,
    pub msg: Option<MessageRef>,
    pub localized: Option<Vec<u8>>,
}

/// State shared by the two ends of a channel: the queue pair, the sleep flags used for
/// wakeup elision, and the lifecycle state.
pub struct ChannelShared {
    pub id: u64,
    to_worker: PtrQueue<ChannelData>,
    from_worker: PtrQueue<ChannelData>,
    worker_sleeping: AtomicBool,
    network_sleeping: AtomicBool,
    state: AtomicU8,
    pub requests_sent: AtomicU64,
    pub replies_sent: AtomicU64,
}

impl ChannelShared {
    #[inline]
    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.state() == STATE_OPEN
    }

    #[inline]
    pub fn input_empty(&self) -> bool {
        self.to_worker.is_empty()
    }

    #[inline]
    pub fn output_empty(&self) -> bool {
        self.from_worker.is_empty()
    }
}

/// Creates a channel between a network thread and a worker. The returned ends are handed to
/// their owning threads; the worker end travels inside a `ChannelOpen` control frame.
pub struct Channel;

impl Channel {
    pub fn create(
        id: u64,
        to_worker_ctl: ControlSender,
        to_network_ctl: ControlSender,
        message_set_size: usize,
        ring_buffer_size: usize,
        log: &Logger,
    ) -> (NetworkEnd, WorkerEnd) {
        let shared = Arc::new(ChannelShared {
            id,
            to_worker: PtrQueue::new(message_set_size),
            from_worker: PtrQueue::new(message_set_size),
            worker_sleeping: AtomicBool::new(false),
            network_sleeping: AtomicBool::new(false),
            state: AtomicU8::new(STATE_CLOSED),
            requests_sent: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
        });

        let network_ms = MessageSet::new(message_set_size, ring_buffer_size);
        let worker_ms = MessageSet::new(message_set_size, ring_buffer_size);
        let network_bufs = network_ms.buffers();
        let worker_bufs = worker_ms.buffers();

        let network = NetworkEnd {
            shared: shared.clone(),
            ms: network_ms,
            worker_bufs,
            ctl: to_worker_ctl,
            log: log.new(logging::o!("channel" => id)),
        };

        let worker = WorkerEnd {
            shared,
            ms: worker_ms,
            network_bufs,
            ctl: to_network_ctl,
            log: log.new(logging::o!("channel" => id)),
        };

        (network, worker)
    }
}

/// The network thread's end of a channel.
pub struct NetworkEnd {
    shared: Arc<ChannelShared>,
    ms: MessageSet,
    worker_bufs: Arc<MessageBuffers>,
    ctl: ControlSender,
    log: Logger,
}

impl NetworkEnd {
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    /// Sends the worker end to the worker inside a `ChannelOpen` control frame, moving the
    /// channel to `opening` until the worker acks.
    pub fn send_open(&mut self, end: Box<WorkerEnd>) -> Result<(), Box<WorkerEnd>> {
        let raw = Box::into_raw(end) as u64;

        if !self.ctl.send(Frame::ChannelOpen { end: raw }) {
            // Undeliverable; take ownership back.
            return Err(unsafe { unpack_worker_end(raw) });
        }

        self.shared.set_state(STATE_OPENING);
        logging::debug!(self.log, "channel open sent");
        Ok(())
    }

    /// Called when the worker's `ChannelOpenAck` arrives.
    pub fn handle_open_ack(&mut self) {
        self.shared.set_state(STATE_OPEN);
        logging::debug!(self.log, "channel open");
    }

    /// Starts the close handshake.
    pub fn send_close(&mut self) {
        self.shared.set_state(STATE_CLOSING);
        self.ctl.send(Frame::ChannelClose { channel: self.shared.id });
        logging::debug!(self.log, "channel close sent");
    }

    /// Called when the worker's `ChannelCloseAck` arrives; reclaims whatever the worker
    /// completed before shutting down.
    pub fn handle_close_ack(&mut self) {
        self.shared.set_state(STATE_CLOSED);
        self.ms.gc();
        logging::debug!(self.log, "channel closed");
    }

    /// Dispatches a new request to the worker: copies the payload into this end's message
    /// buffers, queues the message, and wakes the worker only if it announced sleep.
    pub fn send_request(
        &mut self,
        envelope: Envelope,
        payload: &[u8],
        priority: Priority,
        when: u64,
        start_time: Arc<AtomicU64>,
        listener: u32,
    ) -> EngineResult<()> {
        let msg = self.write_payload(payload)?;

        let cd = Box::new(ChannelData {
            kind: DataKind::NewRequest,
            channel: self.shared.id,
            listener,
            priority,
            when,
            envelope,
            start_time,
            msg: Some(msg),
            localized: None,
        });

        self.queue_to_worker(cd)
    }

    /// Delivers a correlated upstream reply to the worker that owns the yielded request.
    pub fn send_proxy_reply(
        &mut self,
        kind: DataKind,
        envelope: Envelope,
        payload: &[u8],
        when: u64,
        start_time: Arc<AtomicU64>,
        listener: u32,
    ) -> EngineResult<()> {
        let msg = if payload.is_empty() {
            None
        } else {
            Some(self.write_payload(payload)?)
        };

        let cd = Box::new(ChannelData {
            kind,
            channel: self.shared.id,
            listener,
            priority: Priority::AUTH,
            when,
            envelope,
            start_time,
            msg,
            localized: None,
        });

        self.queue_to_worker(cd)
    }

    /// Pops the next reply, NAK or proxy request from the worker.
    #[inline]
    pub fn recv_reply(&self) -> Option<Box<ChannelData>> {
        self.shared.from_worker.pop()
    }

    /// The payload bytes of a message produced by the worker.
    #[inline]
    pub fn reply_payload<'a>(&'a self, cd: &'a ChannelData) -> &'a [u8] {
        match (&cd.localized, cd.msg) {
            (Some(localized), _) => localized,
            (None, Some(msg)) => self.worker_bufs.payload(msg),
            (None, None) => &[],
        }
    }

    /// Hands a worker message back after the payload has been copied out.
    #[inline]
    pub fn complete_reply(&self, cd: &ChannelData) {
        if let Some(msg) = cd.msg {
            self.worker_bufs.done(msg);
        }
    }

    /// Ships a configuration version swap to the worker behind this channel.
    pub fn send_config(&mut self, version: Arc<crate::config::ConfigVersion>) {
        let raw = crate::config::ConfigVersion::into_frame(version);

        if !self.ctl.send(Frame::ConfigSwap { version: raw }) {
            // Undeliverable; reclaim so the version is not leaked.
            drop(unsafe { crate::config::ConfigVersion::from_frame(raw) });
            logging::warn!(self.log, "config swap frame dropped");
        }
    }

    /// Announces that the network thread is about to block, provided the worker has nothing
    /// queued for it. The worker clears the flag on its next reply push.
    pub fn announce_sleep(&self) {
        if self.shared.from_worker.is_empty() {
            self.shared.network_sleeping.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn gc(&mut self) {
        self.ms.gc();
    }

    fn write_payload(&mut self, payload: &[u8]) -> EngineResult<MessageRef> {
        let mut reservation = self.ms.reserve(payload.len()).ok_or(EngineError::Wait)?;
        reservation.data()[..payload.len()].copy_from_slice(payload);
        Ok(reservation.commit(payload.len()))
    }

    fn queue_to_worker(&mut self, cd: Box<ChannelData>) -> EngineResult<()> {
        match self.shared.to_worker.push(cd) {
            Ok(()) => {}
            Err(cd) => {
                // The queue never saw it; complete our own message and reclaim.
                if let Some(msg) = cd.msg {
                    self.ms.buffers().done(msg);
                }
                self.ms.gc();
                return Err(EngineError::Wait);
            }
        }

        self.shared.requests_sent.fetch_add(1, Ordering::Relaxed);

        // The hot path optimization: only a worker that announced sleep costs a wakeup.
        if self.shared.worker_sleeping.swap(false, Ordering::AcqRel) {
            self.ctl.send(Frame::DataReady { channel: self.shared.id });
        }

        Ok(())
    }
}

/// The worker's end of a channel. Arrives boxed inside a `ChannelOpen` control frame.
pub struct WorkerEnd {
    shared: Arc<ChannelShared>,
    ms: MessageSet,
    network_bufs: Arc<MessageBuffers>,
    ctl: ControlSender,
    log: Logger,
}

impl WorkerEnd {
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[inline]
    pub fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.shared.active()
    }

    /// Acknowledges channel open; the channel is live from here on.
    pub fn ack_open(&mut self) {
        self.shared.set_state(STATE_OPEN);
        self.ctl.send(Frame::ChannelOpenAck { channel: self.shared.id });
        logging::debug!(self.log, "channel acked open");
    }

    /// Acknowledges channel close after the worker has cancelled everything routed through
    /// this channel.
    pub fn ack_close(&mut self) {
        self.shared.set_state(STATE_CLOSED);
        self.ms.gc();
        self.ctl.send(Frame::ChannelCloseAck { channel: self.shared.id });
        logging::debug!(self.log, "channel acked close");
    }

    /// Pops the next inbound message.
    #[inline]
    pub fn recv_request(&self) -> Option<Box<ChannelData>> {
        self.shared.to_worker.pop()
    }

    /// The payload bytes of an inbound message, wherever they currently live.
    #[inline]
    pub fn request_payload<'a>(&'a self, cd: &'a ChannelData) -> &'a [u8] {
        match (&cd.localized, cd.msg) {
            (Some(localized), _) => localized,
            (None, Some(msg)) => self.network_bufs.payload(msg),
            (None, None) => &[],
        }
    }

    /// Copies an inbound payload out of the channel ring so the network side can reclaim the
    /// space, then completes the original message.
    pub fn localize(&self, cd: &mut ChannelData) {
        if let Some(msg) = cd.msg.take() {
            cd.localized = Some(self.network_bufs.localize(msg));
        }
    }

    /// Completes an inbound message without processing it.
    #[inline]
    pub fn complete_request(&self, cd: &mut ChannelData) {
        if let Some(msg) = cd.msg.take() {
            self.network_bufs.done(msg);
        }
    }

    /// Reserves space for an outbound reply payload in this end's message buffers.
    #[inline]
    pub fn reserve_reply(&mut self, size: usize) -> Option<Reservation> {
        self.ms.reserve(size)
    }

    /// Queues an outbound message and wakes the network thread only if it announced sleep.
    pub fn send_reply(&mut self, cd: Box<ChannelData>) -> EngineResult<()> {
        match self.shared.from_worker.push(cd) {
            Ok(()) => {}
            Err(cd) => {
                if let Some(msg) = cd.msg {
                    self.ms.buffers().done(msg);
                }
                self.ms.gc();
                return Err(EngineError::Wait);
            }
        }

        self.shared.replies_sent.fetch_add(1, Ordering::Relaxed);

        if self.shared.network_sleeping.swap(false, Ordering::AcqRel) {
            self.ctl.send(Frame::DataReady { channel: self.shared.id });
        }

        Ok(())
    }

    /// Announces that this worker is going to sleep, provided the input queue is drained.
    /// The producer clears the flag on its next push, eliding the wakeup while we are awake.
    pub fn announce_sleep(&mut self) {
        if !self.shared.to_worker.is_empty() {
            return;
        }

        self.shared.worker_sleeping.store(true, Ordering::Release);
        self.ctl.send(Frame::Sleeping { channel: self.shared.id });
    }

    #[inline]
    pub fn gc(&mut self) {
        self.ms.gc();
    }
}

/// Reconstitutes a worker end from a `ChannelOpen` frame. Must be called exactly once per
/// frame; the pointer was produced by `Box::into_raw` in `send_open`.
pub unsafe fn unpack_worker_end(raw: u64) -> Box<WorkerEnd> {
    Box::from_raw(raw as *mut WorkerEnd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventList;
    use crate::packet::{PacketCode, AUTHENTICATOR_SIZE};
    use crate::substrate::control::ControlPort;

    fn envelope() -> Envelope {
        Envelope {
            code: PacketCode::AccessRequest,
            id: 9,
            authenticator: [7; AUTHENTICATOR_SIZE],
            src: "127.0.0.1:50000".parse().unwrap(),
            dst: "127.0.0.1:1812".parse().unwrap(),
        }
    }

    struct Harness {
        network_el: EventList,
        worker_el: EventList,
        network_port: ControlPort,
        worker_port: ControlPort,
    }

    impl Harness {
        fn new() -> Harness {
            let network_el = EventList::new().unwrap();
            let worker_el = EventList::new().unwrap();
            let network_port = ControlPort::new(network_el.waker());
            let worker_port = ControlPort::new(worker_el.waker());

            Harness {
                network_el,
                worker_el,
                network_port,
                worker_port,
            }
        }

        fn channel(&self, id: u64) -> (NetworkEnd, WorkerEnd) {
            Channel::create(
                id,
                self.worker_port.sender(),
                self.network_port.sender(),
                64,
                1 << 16,
                &logging::discard(),
            )
        }
    }

    #[test]
    fn test_open_handshake() {
        let harness = Harness::new();
        let (mut network, worker) = harness.channel(1);

        network.send_open(Box::new(worker)).ok().unwrap();
        assert_eq!(network.shared().state(), STATE_OPENING);

        // Worker receives the end through its control plane.
        assert!(harness.worker_el.waker().rearm().is_ok());
        let frames = harness.worker_port.drain();
        let mut worker = match frames.as_slice() {
            [Frame::ChannelOpen { end }] => unsafe { unpack_worker_end(*end) },
            other => panic!("Unexpected frames {:?}", other),
        };

        worker.ack_open();
        assert!(worker.active());

        let acks = harness.network_port.drain();
        assert_eq!(acks, vec![Frame::ChannelOpenAck { channel: 1 }]);
        network.handle_open_ack();
        assert!(network.shared().active());
    }

    #[test]
    fn test_request_roundtrip() {
        let harness = Harness::new();
        let (mut network, mut worker) = harness.channel(1);
        worker.ack_open();
        network.handle_open_ack();
        harness.network_port.drain();

        let start = Arc::new(AtomicU64::new(1000));
        network
            .send_request(envelope(), b"request payload", Priority::AUTH, 1000, start, 0)
            .unwrap();

        let mut cd = worker.recv_request().unwrap();
        assert_eq!(worker.request_payload(&cd), b"request payload");
        assert_eq!(cd.when, 1000);

        worker.complete_request(&mut cd);
        network.gc();

        // Reply flows back the other way.
        let mut reservation = worker.reserve_reply(1024).unwrap();
        reservation.data()[..5].copy_from_slice(b"reply");
        let msg = reservation.commit(5);

        let reply = Box::new(ChannelData {
            kind: DataKind::Reply(ReplyTimes::default()),
            channel: 1,
            listener: 0,
            priority: Priority::AUTH,
            when: 2000,
            envelope: envelope(),
            start_time: Arc::new(AtomicU64::new(1000)),
            msg: Some(msg),
            localized: None,
        });

        worker.send_reply(reply).unwrap();

        let cd = network.recv_reply().unwrap();
        assert_eq!(network.reply_payload(&cd), b"reply");
        network.complete_reply(&cd);
        worker.gc();
    }

    #[test]
    fn test_wakeup_elided_while_awake() {
        let harness = Harness::new();
        let (mut network, mut worker) = harness.channel(1);
        worker.ack_open();
        network.handle_open_ack();
        harness.network_port.drain();
        harness.worker_port.drain();

        // The worker never announced sleep, so a burst of pushes produces no control
        // frames and no kernel wakeups.
        for i in 0..50u64 {
            let start = Arc::new(AtomicU64::new(i));
            network
                .send_request(envelope(), b"payload", Priority::AUTH, i, start, 0)
                .unwrap();
        }

        assert!(harness.worker_port.drain().is_empty());

        // Announce sleep with a drained queue only after consuming everything.
        let mut count = 0;
        while let Some(mut cd) = worker.recv_request() {
            worker.complete_request(&mut cd);
            count += 1;
        }
        assert_eq!(count, 50);

        worker.announce_sleep();
        assert!(harness.network_port.drain().contains(&Frame::Sleeping { channel: 1 }));

        // The next push finds the sleeping flag and issues exactly one wakeup.
        let start = Arc::new(AtomicU64::new(99));
        network
            .send_request(envelope(), b"payload", Priority::AUTH, 99, start, 0)
            .unwrap();

        let frames = harness.worker_port.drain();
        assert_eq!(frames, vec![Frame::DataReady { channel: 1 }]);
    }

    #[test]
    fn test_announce_sleep_skipped_when_input_pending() {
        let harness = Harness::new();
        let (mut network, mut worker) = harness.channel(1);
        worker.ack_open();
        network.handle_open_ack();
        harness.network_port.drain();

        let start = Arc::new(AtomicU64::new(5));
        network
            .send_request(envelope(), b"payload", Priority::AUTH, 5, start, 0)
            .unwrap();

        // With input pending the worker must not claim to be asleep.
        worker.announce_sleep();
        assert!(!harness
            .network_port
            .drain()
            .contains(&Frame::Sleeping { channel: 1 }));
    }

    #[test]
    fn test_localize_frees_channel_ring() {
        let harness = Harness::new();
        let (mut network, mut worker) = harness.channel(1);
        worker.ack_open();
        network.handle_open_ack();

        let start = Arc::new(AtomicU64::new(0));
        network
            .send_request(envelope(), b"keep me", Priority::AUTH, 0, start, 0)
            .unwrap();

        let mut cd = worker.recv_request().unwrap();
        worker.localize(&mut cd);

        // The network ring is reclaimable even though the worker still holds the data.
        network.gc();
        assert_eq!(worker.request_payload(&cd), b"keep me");
        assert!(cd.msg.is_none());
    }

    #[test]
    fn test_close_handshake() {
        let harness = Harness::new();
        let (mut network, mut worker) = harness.channel(3);
        worker.ack_open();
        network.handle_open_ack();
        harness.network_port.drain();

        network.send_close();
        assert_eq!(network.shared().state(), STATE_CLOSING);

        let frames = harness.worker_port.drain();
        assert!(frames.contains(&Frame::ChannelClose { channel: 3 }));

        worker.ack_close();
        let frames = harness.network_port.drain();
        assert!(frames.contains(&Frame::ChannelCloseAck { channel: 3 }));

        network.handle_close_ack();
        assert_eq!(network.shared().state(), STATE_CLOSED);
    }
}
