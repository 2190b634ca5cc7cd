use crate::channel::{unpack_worker_end, ChannelData, DataKind, NakReason, ReplyTimes, WorkerEnd};
use crate::config::ConfigVersion;
use crate::event::{Event, EventList, ExitHandle};
use crate::packet::{self, AttrList, Codec, PacketCode, Priority};
use crate::policy::interp::{self, Final, StepAction};
use crate::policy::{JobCtx, PolicySet};
use crate::request::Request;
use crate::substrate::control::{ControlPort, ControlSender, Frame};
use hashbrown::HashMap;
use quartz::logging::{self, Logger};
use quartz::time::{self, NANOS_PER_MSEC, NANOS_PER_SEC};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Timer payload tags. The low 56 bits carry the request number.
pub const TIMER_SWEEP: u8 = 0;
pub const TIMER_RESUME: u8 = 1;
pub const TIMER_REJECT: u8 = 2;

#[inline]
pub fn timer_payload(kind: u8, number: u64) -> u64 {
    ((kind as u64) << 56) | (number & ((1u64 << 56) - 1))
}

#[inline]
pub fn timer_parts(payload: u64) -> (u8, u64) {
    ((payload >> 56) as u8, payload & ((1u64 << 56) - 1))
}

const SWEEP_INTERVAL: u64 = 100 * NANOS_PER_MSEC;
const DECODE_WAIT_MAX: u64 = NANOS_PER_SEC;
const LOCALIZE_AFTER: u64 = 10 * NANOS_PER_MSEC;
const REPLY_RESERVE: usize = 1024;

/// Attached by a proxying module before it yields: the encoded upstream packet the network
/// thread should transmit on the request's behalf.
pub struct ProxySend {
    pub upstream: SocketAddr,
    pub packet: Vec<u8>,
}

pub const PROXY_SEND_KEY: &str = "proxy-send";

/// Attached by the worker when an upstream reply (or its failure) comes back, just before
/// the yielded request resumes.
pub struct ProxyOutcome {
    pub failed: bool,
    pub attrs: Option<AttrList>,
}

pub const PROXY_OUTCOME_KEY: &str = "proxy-outcome";

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub num_requests: u64,
    pub num_decoded: u64,
    pub num_replies: u64,
    pub num_timeouts: u64,
    pub num_naks: u64,
    pub num_localized: u64,
    pub num_discarded: u64,
}

type HeapKey = (Priority, u64, u64);

/// Messages tracked by priority for dispatch and by time for aging, mirroring each other.
struct MessageHeap {
    heap: BTreeMap<HeapKey, Box<ChannelData>>,
    time_order: BTreeMap<(u64, u64), HeapKey>,
    seq: u64,
}

impl MessageHeap {
    fn new() -> MessageHeap {
        MessageHeap {
            heap: BTreeMap::new(),
            time_order: BTreeMap::new(),
            seq: 0,
        }
    }

    fn insert(&mut self, cd: Box<ChannelData>) {
        let key = (cd.priority, cd.when, self.seq);
        self.time_order.insert((cd.when, self.seq), key);
        self.heap.insert(key, cd);
        self.seq += 1;
    }

    fn pop(&mut self) -> Option<Box<ChannelData>> {
        let key = *self.heap.keys().next()?;
        let cd = self.heap.remove(&key).unwrap();
        self.time_order.remove(&(key.1, key.2));
        Some(cd)
    }

    fn oldest_when(&self) -> Option<u64> {
        self.time_order.keys().next().map(|&(when, _)| when)
    }

    fn pop_oldest(&mut self) -> Option<Box<ChannelData>> {
        let (&tkey, &key) = self.time_order.iter().next()?;
        self.time_order.remove(&tkey);
        self.heap.remove(&key)
    }

    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn drain(&mut self) -> Vec<Box<ChannelData>> {
        self.time_order.clear();
        let drained: Vec<_> = std::mem::replace(&mut self.heap, BTreeMap::new())
            .into_iter()
            .map(|(_, cd)| cd)
            .collect();
        drained
    }

    fn drain_channel(&mut self, channel: u64) -> Vec<Box<ChannelData>> {
        let keys: Vec<HeapKey> = self
            .heap
            .iter()
            .filter(|(_, cd)| cd.channel == channel)
            .map(|(&key, _)| key)
            .collect();

        keys.into_iter()
            .map(|key| {
                self.time_order.remove(&(key.1, key.2));
                self.heap.remove(&key).unwrap()
            })
            .collect()
    }
}

/// A worker thread: takes packets from the network threads, runs policy on them with a
/// cooperative interpreter, and sends back replies. Owns its own event loop; all its state
/// is thread local except the channel ends.
pub struct Worker {
    el: EventList,
    port: ControlPort,
    channels: HashMap<u64, WorkerEnd>,
    policies: Arc<PolicySet>,
    codec: Arc<dyn Codec>,
    config: Arc<ConfigVersion>,

    to_decode: MessageHeap,
    localized: MessageHeap,

    requests: HashMap<u64, Request>,
    runnable: BTreeSet<(Priority, u64, u64)>,
    time_order: BTreeSet<(u64, u64)>,
    waiting_to_die: Vec<u64>,

    checked_timeout: u64,
    sweep_timer: Option<u64>,
    total_running: u64,
    stats: WorkerStats,
    log: Logger,
}

impl Worker {
    pub fn new(
        policies: Arc<PolicySet>,
        codec: Arc<dyn Codec>,
        config: Arc<ConfigVersion>,
        log: &Logger,
    ) -> io::Result<Worker> {
        let el = EventList::new()?;
        let port = ControlPort::new(el.waker());

        Ok(Worker {
            el,
            port,
            channels: HashMap::new(),
            policies,
            codec,
            config,
            to_decode: MessageHeap::new(),
            localized: MessageHeap::new(),
            requests: HashMap::new(),
            runnable: BTreeSet::new(),
            time_order: BTreeSet::new(),
            waiting_to_die: Vec::new(),
            checked_timeout: 0,
            sweep_timer: None,
            total_running: 0,
            stats: WorkerStats::default(),
            log: log.new(logging::o!()),
        })
    }

    /// A control sender other threads use to reach this worker.
    pub fn control_sender(&self) -> ControlSender {
        self.port.sender()
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.el.exit_handle()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    #[inline]
    pub fn num_live_requests(&self) -> usize {
        self.requests.len()
    }

    /// The main worker loop. Returns when an `Exit` frame or exit handle fires.
    pub fn run(&mut self) {
        loop {
            let wait = self.runnable.is_empty();

            if wait {
                self.announce_idle();
                self.arm_sweep_timer();
            }

            if !self.tick(wait) {
                break;
            }
        }

        self.destroy();
    }

    /// One loop iteration without blocking; `false` when the worker should shut down.
    /// Exposed for harnesses that drive the worker without a dedicated thread.
    pub fn run_once(&mut self) -> bool {
        if self.runnable.is_empty() {
            self.announce_idle();
            self.arm_sweep_timer();
        }

        self.tick(false)
    }

    fn tick(&mut self, wait: bool) -> bool {
        let fired = match self.el.corral(wait) {
            Some(fired) => fired,
            None => return false,
        };

        if fired > 0 {
            self.service_events();
        }

        let now = time::monotonic();
        if now.saturating_sub(self.checked_timeout) > SWEEP_INTERVAL {
            self.check_timeouts(now);
        }

        let now = time::monotonic();
        if let Some(number) = self.get_runnable(now) {
            self.run_request(number, now);
        }

        true
    }

    fn service_events(&mut self) {
        for event in self.el.service() {
            match event {
                Event::User => self.service_control(),
                Event::Timer(payload) => self.service_timer(payload),
                Event::Readable(token) => {
                    logging::warn!(self.log, "unexpected socket readiness"; "token" => token.0);
                }
            }
        }
    }

    fn service_control(&mut self) {
        for frame in self.port.drain() {
            match frame {
                Frame::ChannelOpen { end } => {
                    // Ownership arrives through the control plane; reconstituted exactly once.
                    let end = unsafe { unpack_worker_end(end) };
                    let id = end.id();

                    logging::debug!(self.log, "channel received"; "channel" => id);
                    self.channels.insert(id, *end);

                    if let Some(end) = self.channels.get_mut(&id) {
                        end.ack_open();
                    }
                    self.drain_input(id);
                }
                Frame::DataReady { channel } => self.drain_input(channel),
                Frame::ChannelClose { channel } => self.close_channel(channel),
                Frame::ConfigSwap { version } => {
                    let config = unsafe { ConfigVersion::from_frame(version) };
                    logging::info!(self.log, "configuration swapped"; "version" => config.version);

                    if let Some(policies) = &config.policies {
                        self.policies = policies.clone();
                    }
                    self.config = config;
                }
                Frame::Exit => self.el.request_exit(),
                other => {
                    logging::warn!(self.log, "unexpected control frame"; "frame" => ?other);
                }
            }
        }
    }

    fn service_timer(&mut self, payload: u64) {
        let (kind, number) = timer_parts(payload);

        match kind {
            TIMER_SWEEP => {
                self.sweep_timer = None;
                let now = time::monotonic();
                self.check_timeouts(now);
            }
            TIMER_RESUME => self.make_runnable(number),
            TIMER_REJECT => self.finish_delayed_reject(number),
            _ => {
                logging::warn!(self.log, "unknown timer payload"; "payload" => payload);
            }
        }
    }

    fn drain_input(&mut self, channel: u64) {
        let mut incoming = Vec::new();

        if let Some(end) = self.channels.get(&channel) {
            while let Some(cd) = end.recv_request() {
                incoming.push(cd);
            }
        }

        for cd in incoming {
            match cd.kind {
                DataKind::NewRequest => {
                    self.stats.num_requests += 1;
                    self.to_decode.insert(cd);
                }
                DataKind::ProxyReply { request_number } => self.route_proxy(cd, request_number, false),
                DataKind::ProxyExpired { request_number } => self.route_proxy(cd, request_number, true),
                _ => {
                    logging::warn!(self.log, "unexpected message kind on input queue"; "channel" => channel);
                    self.complete_message(cd);
                }
            }
        }
    }

    fn route_proxy(&mut self, mut cd: Box<ChannelData>, number: u64, failed: bool) {
        let attrs = if failed {
            None
        } else {
            let payload = match self.channels.get(&cd.channel) {
                Some(end) => end.request_payload(&cd).to_vec(),
                None => Vec::new(),
            };
            self.codec.decode(&payload).ok()
        };

        self.complete_message_inner(&mut cd);

        if let Some(req) = self.requests.get_mut(&number) {
            req.attach(PROXY_OUTCOME_KEY, ProxyOutcome { failed, attrs });
            self.make_runnable(number);
        } else {
            logging::debug!(self.log, "upstream reply for dead request"; "request" => number);
        }
    }

    fn make_runnable(&mut self, number: u64) {
        if let Some(req) = self.requests.get(&number) {
            if !req.flags.finished && !req.flags.delayed_reject {
                self.runnable.insert((req.priority, req.recv_time, number));
            }
        }
    }

    /// Enforces aging on all queues, ten times a second.
    fn check_timeouts(&mut self, now: u64) {
        self.checked_timeout = now;

        // Localized messages past the decode deadline are bounced.
        while let Some(when) = self.localized.oldest_when() {
            if now.saturating_sub(when) < DECODE_WAIT_MAX {
                break;
            }

            let cd = self.localized.pop_oldest().unwrap();
            self.nak_message(cd, NakReason::Aged, now);
        }

        // Fresh messages linger briefly; after that they are localized so the channel ring
        // can be reclaimed, and past the decode deadline they are bounced too.
        while let Some(when) = self.to_decode.oldest_when() {
            let waiting = now.saturating_sub(when);
            if waiting < LOCALIZE_AFTER {
                break;
            }

            let mut cd = self.to_decode.pop_oldest().unwrap();

            if waiting >= DECODE_WAIT_MAX {
                self.nak_message(cd, NakReason::Aged, now);
                continue;
            }

            if let Some(end) = self.channels.get(&cd.channel) {
                end.localize(&mut cd);
                self.stats.num_localized += 1;
                self.localized.insert(cd);
            }
        }

        // Live requests past their wall clock deadline.
        loop {
            let (recv, number) = match self.time_order.iter().next() {
                Some(&(recv, number)) => (recv, number),
                None => break,
            };

            let deadline = match self.requests.get(&number) {
                Some(req) => req.config.config.max_request_time(),
                None => {
                    self.time_order.remove(&(recv, number));
                    continue;
                }
            };

            if now.saturating_sub(recv) < deadline {
                break;
            }

            self.expire_request(number, now);
        }

        // Requests whose modules refused cancellation get re-polled until they let go.
        let dying: Vec<u64> = self.waiting_to_die.clone();
        for number in dying {
            if self.step_request(number, now, StepAction::Done) == Final::Done {
                self.waiting_to_die.retain(|&n| n != number);
                self.nak_request(number, NakReason::Aged, now);
                self.free_request(number);
            }
        }
    }

    fn expire_request(&mut self, number: u64, now: u64) {
        self.stats.num_timeouts += 1;
        logging::debug!(self.log, "request exceeded max_request_time"; "request" => number);

        if let Some(req) = self.requests.get(&number) {
            self.runnable.remove(&(req.priority, req.recv_time, number));
            self.time_order.remove(&(req.recv_time, number));
        }

        match self.step_request(number, now, StepAction::Done) {
            Final::Done => {
                self.nak_request(number, NakReason::Aged, now);
                self.free_request(number);
            }
            _ => self.waiting_to_die.push(number),
        }
    }

    /// Picks the next piece of work: a runnable request, else the best queued message,
    /// decoded into a fresh request.
    fn get_runnable(&mut self, now: u64) -> Option<u64> {
        if let Some(&key) = self.runnable.iter().next() {
            self.runnable.remove(&key);
            let number = key.2;

            if let Some(req) = self.requests.get_mut(&number) {
                req.tracking.resume(now);
                return Some(number);
            }
        }

        loop {
            let cd = match self.localized.pop().or_else(|| self.to_decode.pop()) {
                Some(cd) => cd,
                None => return None,
            };

            self.stats.num_decoded += 1;

            // The client retransmitted while this message sat in the queue; the tracker
            // moved on and this one is silently dropped.
            if cd.when != cd.start_time.load(Ordering::Acquire) {
                self.stats.num_discarded += 1;
                self.complete_message(cd);
                continue;
            }

            let payload = match self.channels.get(&cd.channel) {
                Some(end) => end.request_payload(&cd).to_vec(),
                None => {
                    logging::debug!(self.log, "message for closed channel dropped");
                    continue;
                }
            };

            let attrs = match self.codec.decode(&payload) {
                Ok(attrs) => attrs,
                Err(_) => {
                    logging::debug!(self.log, "decode failed"; "channel" => cd.channel);
                    self.nak_message(cd, NakReason::Decode, now);
                    return None;
                }
            };

            let mut cd = cd;
            self.complete_message_inner(&mut cd);

            let mut req = Request::new(
                cd.envelope,
                attrs,
                cd.when,
                cd.priority,
                cd.channel,
                cd.listener,
                cd.start_time.clone(),
                self.config.clone(),
            );

            req.stack.init(self.policies.root_for(cd.envelope.code));
            req.tracking.start(now);

            let number = req.number;
            self.time_order.insert((req.recv_time, number));
            self.requests.insert(number, req);

            return Some(number);
        }
    }

    /// Runs one request until it yields, completes, or is torn down.
    fn run_request(&mut self, number: u64, now: u64) {
        let active = match self.requests.get(&number) {
            Some(req) => {
                let channel_up = self
                    .channels
                    .get(&req.channel)
                    .map(|end| end.active())
                    .unwrap_or(false);

                req.still_current() && channel_up && !req.flags.stop_now
            }
            None => return,
        };

        if !active {
            match self.step_request(number, now, StepAction::Done) {
                Final::Done => {
                    self.nak_request(number, NakReason::Superseded, now);
                    self.free_request(number);
                }
                _ => {
                    if let Some(req) = self.requests.get(&number) {
                        self.time_order.remove(&(req.recv_time, number));
                    }
                    self.waiting_to_die.push(number);
                }
            }
            return;
        }

        match self.step_request(number, now, StepAction::Run) {
            Final::Yield => {
                let end_time = time::monotonic();
                if let Some(req) = self.requests.get_mut(&number) {
                    req.tracking.yield_(end_time, &mut self.total_running);
                }
                self.flush_proxy_send(number, now);
            }
            Final::Done => {
                // Aborted or fake; no reply unless the abort demands a NAK.
                let stop_now = self
                    .requests
                    .get(&number)
                    .map(|req| req.flags.stop_now && !req.flags.fake)
                    .unwrap_or(false);

                if stop_now {
                    self.nak_request(number, NakReason::Decode, now);
                }
                self.free_request(number);
            }
            Final::Reply(rcode) => self.send_reply(number, rcode.is_good(), now),
        }
    }

    fn step_request(&mut self, number: u64, now: u64, action: StepAction) -> Final {
        let req = match self.requests.get_mut(&number) {
            Some(req) => req,
            None => return Final::Done,
        };

        let mut ctx = JobCtx {
            now,
            el: &mut self.el,
            log: &self.log,
            request_number: number,
        };

        interp::step(req, &mut ctx, action)
    }

    /// Ships a proxying request's upstream packet to the network thread after the module
    /// yielded awaiting the reply.
    fn flush_proxy_send(&mut self, number: u64, now: u64) {
        let send = match self.requests.get_mut(&number) {
            Some(req) => match req.take_data::<ProxySend>(PROXY_SEND_KEY) {
                Some(send) => {
                    req.flags.proxied = true;
                    send
                }
                None => return,
            },
            None => return,
        };

        let (envelope, priority, listener, start_time, channel) = match self.requests.get(&number) {
            Some(req) => (
                req.envelope,
                req.priority,
                req.listener,
                req.start_time.clone(),
                req.channel,
            ),
            None => return,
        };

        let end = match self.channels.get_mut(&channel) {
            Some(end) => end,
            None => return,
        };

        let mut reservation = match end.reserve_reply(send.packet.len()) {
            Some(reservation) => reservation,
            None => {
                logging::warn!(self.log, "no buffer space for upstream packet"; "request" => number);
                return;
            }
        };

        reservation.data()[..send.packet.len()].copy_from_slice(&send.packet);
        let msg = reservation.commit(send.packet.len());

        let cd = Box::new(ChannelData {
            kind: DataKind::ProxyRequest {
                request_number: number,
                upstream: send.upstream,
            },
            channel,
            listener,
            priority,
            when: now,
            envelope,
            start_time,
            msg: Some(msg),
            localized: None,
        });

        if end.send_reply(cd).is_err() {
            logging::warn!(self.log, "upstream packet queue full"; "request" => number);
        }
    }

    /// Encodes and sends the reply for a completed request, honoring the delayed-reject
    /// window for rejects.
    fn send_reply(&mut self, number: u64, accepted: bool, now: u64) {
        let (code, fake) = match self.requests.get(&number) {
            Some(req) => (req.envelope.code.reply_code(accepted), req.flags.fake),
            None => return,
        };

        let code = match (code, fake) {
            (Some(code), false) => code,
            _ => {
                self.free_request(number);
                return;
            }
        };

        let reject_delay = self
            .requests
            .get(&number)
            .map(|req| req.config.config.reject_delay())
            .unwrap_or(0);

        if code == PacketCode::AccessReject && reject_delay > 0 {
            if let Some(req) = self.requests.get_mut(&number) {
                if !req.flags.delayed_reject {
                    req.flags.delayed_reject = true;
                    req.reply_code = Some(code);
                    req.tracking.yield_(now, &mut self.total_running);

                    self.el
                        .timer_insert(now + reject_delay, timer_payload(TIMER_REJECT, number));

                    logging::debug!(self.log, "reject delayed"; "request" => number);
                    return;
                }
            }
        }

        self.transmit_reply(number, code, now);
    }

    fn finish_delayed_reject(&mut self, number: u64) {
        let now = time::monotonic();

        let code = match self.requests.get(&number) {
            Some(req) => match req.reply_code {
                Some(code) => code,
                None => return,
            },
            None => return,
        };

        self.transmit_reply(number, code, now);
    }

    fn transmit_reply(&mut self, number: u64, code: PacketCode, now: u64) {
        let mut req = match self.requests.remove(&number) {
            Some(req) => req,
            None => return,
        };

        self.time_order.remove(&(req.recv_time, number));
        self.runnable.remove(&(req.priority, req.recv_time, number));
        req.tracking.end(now, &mut self.total_running);

        let channel = req.channel;
        let end = match self.channels.get_mut(&channel) {
            Some(end) => end,
            None => return,
        };

        let mut reservation = match end.reserve_reply(REPLY_RESERVE) {
            Some(reservation) => reservation,
            None => {
                logging::error!(self.log, "reply buffer exhausted, dropping reply"; "request" => number);
                return;
            }
        };

        let len = match packet::encode_packet(
            code,
            req.envelope.id,
            &req.envelope.authenticator,
            &req.reply_attrs,
            &*self.codec,
            reservation.data(),
        ) {
            Ok(len) => len,
            Err(_) => {
                logging::error!(self.log, "reply encode failed"; "request" => number);
                return;
            }
        };

        let msg = reservation.commit(len);

        let times = ReplyTimes {
            cpu_time: self.total_running,
            processing_time: req.tracking.running,
            request_time: req.recv_time,
        };

        let mut envelope = req.envelope;
        envelope.code = code;

        let cd = Box::new(ChannelData {
            kind: DataKind::Reply(times),
            channel,
            listener: req.listener,
            priority: req.priority,
            when: now,
            envelope,
            start_time: req.start_time.clone(),
            msg: Some(msg),
            localized: None,
        });

        if end.send_reply(cd).is_err() {
            logging::warn!(self.log, "reply queue full, reply dropped"; "request" => number);
            self.stats.num_naks += 1;
        } else {
            self.stats.num_replies += 1;
        }

        // The request's arena drops here, releasing attachments in insertion order.
        drop(req);

        // Every completed reply is a chance to pick up freshly queued input.
        self.drain_input(channel);
    }

    /// Bounces a message the worker could not process. The network side releases the
    /// tracker entry when it sees the NAK.
    fn nak_message(&mut self, mut cd: Box<ChannelData>, reason: NakReason, now: u64) {
        self.stats.num_naks += 1;
        self.complete_message_inner(&mut cd);

        let end = match self.channels.get_mut(&cd.channel) {
            Some(end) => end,
            None => return,
        };

        let nak = Box::new(ChannelData {
            kind: DataKind::Nak(reason),
            channel: cd.channel,
            listener: cd.listener,
            priority: cd.priority,
            when: now,
            envelope: cd.envelope,
            start_time: cd.start_time.clone(),
            msg: None,
            localized: None,
        });

        if end.send_reply(nak).is_err() {
            logging::warn!(self.log, "nak queue full"; "channel" => cd.channel);
        }
    }

    fn nak_request(&mut self, number: u64, reason: NakReason, now: u64) {
        let (channel, listener, priority, envelope, start_time, fake) = match self.requests.get(&number) {
            Some(req) => (
                req.channel,
                req.listener,
                req.priority,
                req.envelope,
                req.start_time.clone(),
                req.flags.fake,
            ),
            None => return,
        };

        if fake {
            return;
        }

        self.stats.num_naks += 1;

        let end = match self.channels.get_mut(&channel) {
            Some(end) => end,
            None => return,
        };

        let nak = Box::new(ChannelData {
            kind: DataKind::Nak(reason),
            channel,
            listener,
            priority,
            when: now,
            envelope,
            start_time,
            msg: None,
            localized: None,
        });

        drop(end.send_reply(nak));
    }

    fn free_request(&mut self, number: u64) {
        if let Some(req) = self.requests.remove(&number) {
            self.time_order.remove(&(req.recv_time, number));
            self.runnable.remove(&(req.priority, req.recv_time, number));
        }
        self.waiting_to_die.retain(|&n| n != number);
    }

    /// Cancels everything routed through a closing channel, then acknowledges the close.
    fn close_channel(&mut self, channel: u64) {
        let now = time::monotonic();

        let numbers: Vec<u64> = self
            .requests
            .values()
            .filter(|req| req.channel == channel)
            .map(|req| req.number)
            .collect();

        logging::debug!(self.log, "closing channel";
                        "channel" => channel,
                        "live_requests" => numbers.len());

        for number in numbers {
            match self.step_request(number, now, StepAction::Done) {
                Final::Done => self.free_request(number),
                _ => {
                    if let Some(req) = self.requests.get(&number) {
                        self.time_order.remove(&(req.recv_time, number));
                        self.runnable.remove(&(req.priority, req.recv_time, number));
                    }
                    self.waiting_to_die.push(number);
                }
            }
        }

        // Queued but unprocessed messages are completed so the network can reclaim them.
        for mut cd in self.to_decode.drain_channel(channel) {
            self.complete_message_inner(&mut cd);
        }
        for mut cd in self.localized.drain_channel(channel) {
            self.complete_message_inner(&mut cd);
        }

        if let Some(mut end) = self.channels.remove(&channel) {
            end.ack_close();
        }
    }

    /// Announces sleep on every channel with a drained input queue. Runs only when the
    /// worker has no decodable or runnable work at all.
    fn announce_idle(&mut self) {
        if !self.to_decode.is_empty() || !self.localized.is_empty() {
            return;
        }

        for end in self.channels.values_mut() {
            end.announce_sleep();
        }
    }

    /// Keeps a sweep timer armed while any request or queued message could age out, so
    /// deadlines hold even when the loop is otherwise asleep.
    fn arm_sweep_timer(&mut self) {
        let needed = !self.time_order.is_empty()
            || !self.waiting_to_die.is_empty()
            || !self.to_decode.is_empty()
            || !self.localized.is_empty()
            || !self.requests.is_empty();

        if needed && self.sweep_timer.is_none() {
            let when = time::monotonic() + SWEEP_INTERVAL;
            self.sweep_timer = Some(self.el.timer_insert(when, timer_payload(TIMER_SWEEP, 0)));
        }
    }

    fn complete_message(&mut self, mut cd: Box<ChannelData>) {
        self.complete_message_inner(&mut cd);
    }

    fn complete_message_inner(&mut self, cd: &mut ChannelData) {
        if let Some(end) = self.channels.get(&cd.channel) {
            end.complete_request(cd);
        }
    }

    /// Tears the worker down: completes every held message and acknowledges close on every
    /// channel so the network side can reclaim its buffers.
    fn destroy(&mut self) {
        for mut cd in self.to_decode.drain() {
            self.complete_message_inner(&mut cd);
        }
        for mut cd in self.localized.drain() {
            self.complete_message_inner(&mut cd);
        }

        for (_, mut end) in self.channels.drain() {
            end.ack_close();
        }

        // Reclaim any ownership-carrying frames still sitting in the control queue.
        for frame in self.port.drain() {
            match frame {
                Frame::ChannelOpen { end } => {
                    drop(unsafe { unpack_worker_end(end) });
                }
                Frame::ConfigSwap { version } => {
                    drop(unsafe { ConfigVersion::from_frame(version) });
                }
                _ => {}
            }
        }

        logging::info!(self.log, "worker stopped";
                       "requests" => self.stats.num_requests,
                       "decoded" => self.stats.num_decoded,
                       "replies" => self.stats.num_replies,
                       "timeouts" => self.stats.num_timeouts,
                       "naks" => self.stats.num_naks);
    }

    /// Structured dump of the worker's counters and time tracking.
    pub fn debug_dump(&self) {
        logging::info!(self.log, "worker state";
                       "live" => self.requests.len(),
                       "runnable" => self.runnable.len(),
                       "waiting_to_die" => self.waiting_to_die.len(),
                       "requests" => self.stats.num_requests,
                       "decoded" => self.stats.num_decoded,
                       "replies" => self.stats.num_replies,
                       "timeouts" => self.stats.num_timeouts,
                       "naks" => self.stats.num_naks,
                       "localized" => self.stats.num_localized,
                       "discarded" => self.stats.num_discarded,
                       "cpu_time" => self.total_running);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, NetworkEnd};
    use crate::config::EngineConfig;
    use crate::packet::{
        parse_datagram, Envelope, TlvCodec, Value, ATTR_REPLY_MESSAGE, ATTR_USER_NAME,
        AUTHENTICATOR_SIZE,
    };
    use crate::policy::node::{AttrUpdate, ListTarget, Node, NodeKind, Template, UpdateOp};
    use crate::policy::{CancelStatus, ModuleResult, Suspended};
    use crate::substrate::control::ControlPort;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    struct Detain {
        cancels: Arc<AtomicUsize>,
    }

    struct DetainState {
        cancels: Arc<AtomicUsize>,
    }

    impl crate::policy::Module for Detain {
        fn name(&self) -> &str {
            "detain"
        }

        fn call(&self, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
            ModuleResult::Yield(Box::new(DetainState {
                cancels: self.cancels.clone(),
            }))
        }
    }

    impl Suspended for DetainState {
        fn resume(self: Box<Self>, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
            ModuleResult::Code(crate::policy::Rcode::Ok)
        }

        fn cancel(&mut self, _req: &mut Request, _ctx: &mut JobCtx) -> CancelStatus {
            self.cancels.fetch_add(1, Ordering::Relaxed);
            CancelStatus::Done
        }
    }

    struct Nap {
        delay: u64,
    }

    struct NapState;

    impl crate::policy::Module for Nap {
        fn name(&self) -> &str {
            "nap"
        }

        fn call(&self, _req: &mut Request, ctx: &mut JobCtx) -> ModuleResult {
            ctx.schedule_resume(self.delay);
            ModuleResult::Yield(Box::new(NapState))
        }
    }

    impl Suspended for NapState {
        fn resume(self: Box<Self>, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
            ModuleResult::Code(crate::policy::Rcode::Ok)
        }

        fn cancel(&mut self, _req: &mut Request, _ctx: &mut JobCtx) -> CancelStatus {
            CancelStatus::Done
        }
    }

    fn accept_policy() -> Arc<Node> {
        let update = Node::new(
            "ok-reply",
            NodeKind::Update(vec![AttrUpdate {
                list: ListTarget::Reply,
                attr: ATTR_REPLY_MESSAGE,
                op: UpdateOp::Set,
                value: Some(Template::Literal("ok".to_string())),
            }]),
        );
        Node::new("auth", NodeKind::Group(vec![update]))
    }

    fn policy_set(root: Arc<Node>) -> Arc<PolicySet> {
        Arc::new(PolicySet {
            auth: root.clone(),
            acct: root.clone(),
            status: root,
        })
    }

    struct Harness {
        worker: Worker,
        _network_el: EventList,
        network_port: ControlPort,
        network: NetworkEnd,
        codec: TlvCodec,
    }

    impl Harness {
        fn new(root: Arc<Node>, config: EngineConfig) -> Harness {
            let policies = policy_set(root);
            let codec: Arc<dyn Codec> = Arc::new(TlvCodec::new());
            let config = ConfigVersion::new(1, config);
            let log = logging::discard();

            let worker = Worker::new(policies, codec, config, &log).unwrap();

            let network_el = EventList::new().unwrap();
            let network_port = ControlPort::new(network_el.waker());

            let (mut network, worker_end) = Channel::create(
                1,
                worker.control_sender(),
                network_port.sender(),
                64,
                1 << 16,
                &log,
            );

            network.send_open(Box::new(worker_end)).ok().unwrap();

            let mut harness = Harness {
                worker,
                _network_el: network_el,
                network_port,
                network,
                codec: TlvCodec::new(),
            };

            harness.pump(4);

            let frames = harness.network_port.drain();
            assert!(frames.contains(&Frame::ChannelOpenAck { channel: 1 }));
            harness.network.handle_open_ack();

            harness
        }

        fn pump(&mut self, iterations: usize) {
            for _ in 0..iterations {
                assert!(self.worker.run_once());
            }
        }

        fn send(&mut self, id: u8, user: &str) -> Arc<AtomicU64> {
            let envelope = Envelope {
                code: PacketCode::AccessRequest,
                id,
                authenticator: [id; AUTHENTICATOR_SIZE],
                src: "10.1.1.1:40000".parse().unwrap(),
                dst: "10.1.1.2:1812".parse().unwrap(),
            };

            let mut attrs = AttrList::new();
            attrs.push(ATTR_USER_NAME, Value::Text(user.to_string()));

            let mut body = [0u8; 512];
            let len = self.codec.encode(&attrs, &mut body).unwrap();

            let now = time::monotonic();
            let start = Arc::new(AtomicU64::new(now));

            self.network
                .send_request(envelope, &body[..len], Priority::AUTH, now, start.clone(), 0)
                .unwrap();

            start
        }

        fn recv_reply(&mut self, max_iterations: usize) -> Option<Box<ChannelData>> {
            for _ in 0..max_iterations {
                self.pump(1);
                if let Some(cd) = self.network.recv_reply() {
                    return Some(cd);
                }
            }
            None
        }
    }

    #[test]
    fn test_request_to_reply() {
        let mut harness = Harness::new(accept_policy(), EngineConfig::default());

        harness.send(7, "alice");
        let cd = harness.recv_reply(20).expect("no reply produced");

        match cd.kind {
            DataKind::Reply(times) => assert!(times.request_time > 0),
            ref other => panic!("Unexpected message kind {:?}", other),
        }

        let payload = harness.network.reply_payload(&cd).to_vec();
        harness.network.complete_reply(&cd);

        let (envelope, body) = parse_datagram(
            &payload,
            "10.1.1.2:1812".parse().unwrap(),
            "10.1.1.1:40000".parse().unwrap(),
        )
        .unwrap();

        assert_eq!(envelope.code, PacketCode::AccessAccept);
        assert_eq!(envelope.id, 7);

        let attrs = harness.codec.decode(body).unwrap();
        assert_eq!(attrs.first(ATTR_REPLY_MESSAGE).unwrap().as_text(), Some("ok"));

        assert_eq!(harness.worker.stats().num_replies, 1);
        assert_eq!(harness.worker.num_live_requests(), 0);
    }

    #[test]
    fn test_undecodable_packet_naks() {
        let mut harness = Harness::new(accept_policy(), EngineConfig::default());

        let envelope = Envelope {
            code: PacketCode::AccessRequest,
            id: 3,
            authenticator: [3; AUTHENTICATOR_SIZE],
            src: "10.1.1.1:40000".parse().unwrap(),
            dst: "10.1.1.2:1812".parse().unwrap(),
        };

        let now = time::monotonic();
        let start = Arc::new(AtomicU64::new(now));

        // An attribute claiming more bytes than exist.
        harness
            .network
            .send_request(envelope, &[1, 50, 0], Priority::AUTH, now, start, 0)
            .unwrap();

        let cd = harness.recv_reply(20).expect("no nak produced");
        match cd.kind {
            DataKind::Nak(NakReason::Decode) => {}
            ref other => panic!("Unexpected message kind {:?}", other),
        }

        assert_eq!(harness.worker.stats().num_naks, 1);
    }

    #[test]
    fn test_superseded_message_discarded() {
        let mut harness = Harness::new(accept_policy(), EngineConfig::default());

        let start = harness.send(5, "alice");

        // The tracker moved on before the worker got to the message.
        start.store(u64::max_value(), Ordering::Release);

        harness.pump(10);
        assert!(harness.network.recv_reply().is_none());
        assert_eq!(harness.worker.stats().num_discarded, 1);
        assert_eq!(harness.worker.num_live_requests(), 0);
    }

    #[test]
    fn test_yield_and_timer_resume() {
        let module = Node::new(
            "nap",
            NodeKind::ModuleCall(Arc::new(Nap {
                delay: NANOS_PER_MSEC,
            })),
        );
        let root = Node::new("auth", NodeKind::Group(vec![module]));

        let mut harness = Harness::new(root, EngineConfig::default());

        let begun = time::monotonic();
        harness.send(9, "alice");

        let cd = loop {
            harness.pump(1);
            if let Some(cd) = harness.network.recv_reply() {
                break cd;
            }
            if time::monotonic() - begun > NANOS_PER_SEC {
                panic!("request never resumed");
            }
            std::thread::sleep(Duration::from_micros(200));
        };

        let elapsed = time::monotonic() - begun;
        assert!(elapsed >= NANOS_PER_MSEC, "resumed too early: {}ns", elapsed);

        match cd.kind {
            DataKind::Reply(times) => {
                // The request slept through almost all of its wall time.
                assert!(times.processing_time < elapsed);
            }
            ref other => panic!("Unexpected message kind {:?}", other),
        }
    }

    #[test]
    fn test_deadline_naks_and_cancels_once() {
        let cancels = Arc::new(AtomicUsize::new(0));

        let module = Node::new(
            "detain",
            NodeKind::ModuleCall(Arc::new(Detain {
                cancels: cancels.clone(),
            })),
        );
        let root = Node::new("auth", NodeKind::Group(vec![module]));

        let mut config = EngineConfig::default();
        config.max_request_time_ms = 50;

        let mut harness = Harness::new(root, config);

        let begun = time::monotonic();
        harness.send(11, "alice");

        let cd = loop {
            harness.pump(1);
            if let Some(cd) = harness.network.recv_reply() {
                break cd;
            }
            if time::monotonic() - begun > 2 * NANOS_PER_SEC {
                panic!("deadline never enforced");
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        let elapsed = time::monotonic() - begun;

        match cd.kind {
            DataKind::Nak(NakReason::Aged) => {}
            ref other => panic!("Unexpected message kind {:?}", other),
        }

        assert!(elapsed >= 50 * NANOS_PER_MSEC, "expired too early: {}ns", elapsed);
        assert_eq!(cancels.load(Ordering::Relaxed), 1);
        assert_eq!(harness.worker.num_live_requests(), 0);
    }

    #[test]
    fn test_channel_close_cancels_everything() {
        let cancels = Arc::new(AtomicUsize::new(0));

        let module = Node::new(
            "detain",
            NodeKind::ModuleCall(Arc::new(Detain {
                cancels: cancels.clone(),
            })),
        );
        let root = Node::new("auth", NodeKind::Group(vec![module]));

        let mut harness = Harness::new(root, EngineConfig::default());

        for id in 0..20 {
            harness.send(id, "alice");
        }

        // Each tick decodes and yields one request.
        harness.pump(40);
        assert_eq!(harness.worker.num_live_requests(), 20);

        harness.network.send_close();
        harness.pump(4);

        let frames = harness.network_port.drain();
        assert!(frames.contains(&Frame::ChannelCloseAck { channel: 1 }));
        harness.network.handle_close_ack();

        assert_eq!(cancels.load(Ordering::Relaxed), 20);
        assert_eq!(harness.worker.num_live_requests(), 0);
    }
}

