use crate::channel::{ChannelData, DataKind, NetworkEnd};
use crate::config::{ConfigVersion, ListenerRole};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::event::{Event, EventList, ExitHandle};
use crate::packet::{
    parse_datagram, Envelope, PacketCode, Priority, Verifier, AUTHENTICATOR_SIZE, MAX_PACKET_SIZE,
};
use crate::substrate::control::{ControlPort, ControlSender, Frame};
use crate::track::{TrackingKey, TrackingStatus, TrackingTable};
use hashbrown::HashMap;
use indexmap::IndexSet;
use mio::net::UdpSocket;
use mio::Token;
use quartz::logging::{self, Logger};
use quartz::time::{self, NANOS_PER_MSEC};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const HOUSEKEEPING_INTERVAL: u64 = 100 * NANOS_PER_MSEC;
const TIMER_HOUSEKEEPING: u64 = u64::max_value();

/// Flags flipped from signal handlers and observed by the network loop within one
/// housekeeping interval.
pub struct SignalFlags {
    pub reload: AtomicBool,
    pub terminate: AtomicBool,
}

impl SignalFlags {
    pub fn new() -> Arc<SignalFlags> {
        Arc::new(SignalFlags {
            reload: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerStats {
    pub received: u64,
    pub malformed: u64,
    pub unknown_peer: u64,
    pub wrong_role: u64,
    pub dup_drops: u64,
    pub dup_replays: u64,
    pub conflicts: u64,
    pub admitted: u64,
    pub overload_drops: u64,
    pub replies: u64,
    pub naks: u64,
}

struct Listener {
    sock: UdpSocket,
    addr: SocketAddr,
    role: ListenerRole,
    tracker: TrackingTable,
    stats: ListenerStats,
}

struct ClientDef {
    secret: Vec<u8>,
}

struct HomeServer {
    secret: Vec<u8>,
    alive: bool,
    dead_until: u64,
    next_id: u8,
}

/// Correlation state for one packet sent upstream, keyed by `(upstream ip, port, id)`.
struct ProxyPending {
    worker: usize,
    request_number: u64,
    listener: u32,
    envelope: Envelope,
    packet: Vec<u8>,
}

type ProxyKey = (IpAddr, u16, u8);

/// The network thread: owns the listening sockets, performs duplicate detection and
/// admission, dispatches requests to workers, routes replies back to the wire, and manages
/// upstream proxy traffic.
pub struct Network {
    el: EventList,
    port: ControlPort,
    listeners: Vec<Listener>,
    clients: HashMap<IpAddr, ClientDef>,
    home_servers: HashMap<SocketAddr, HomeServer>,
    channels: Vec<NetworkEnd>,
    live: IndexSet<usize>,
    next_worker: usize,
    in_flight: usize,
    proxy_table: TrackingTable,
    proxy_pending: HashMap<ProxyKey, ProxyPending>,
    proxy_listener: Option<usize>,
    verifier: Arc<dyn Verifier>,
    config: Arc<ConfigVersion>,
    terminating: bool,
    housekeeping_armed: bool,
    recv_buf: Box<[u8]>,
    log: Logger,
}

impl Network {
    pub fn new(
        config: Arc<ConfigVersion>,
        verifier: Arc<dyn Verifier>,
        log: &Logger,
    ) -> EngineResult<Network> {
        let el = EventList::new()?;
        let port = ControlPort::new(el.waker());
        let log = log.new(logging::o!());

        let mut listeners = Vec::new();
        let mut proxy_listener = None;

        for (idx, def) in config.config.listeners.iter().enumerate() {
            let addr: SocketAddr = def
                .address
                .parse()
                .map_err(|_| EngineError::Fatal(ErrorKind::Config))?;

            let sock = UdpSocket::bind(&addr)?;
            let addr = sock.local_addr()?;

            el.register(&sock, Token(idx))?;
            logging::info!(log, "listener bound"; "address" => %addr, "role" => ?def.role);

            if def.role == ListenerRole::Proxy && proxy_listener.is_none() {
                proxy_listener = Some(idx);
            }

            listeners.push(Listener {
                sock,
                addr,
                role: def.role,
                tracker: TrackingTable::new(),
                stats: ListenerStats::default(),
            });
        }

        let clients = config
            .config
            .clients
            .iter()
            .filter_map(|def| {
                def.address.parse::<IpAddr>().ok().map(|ip| {
                    (
                        ip,
                        ClientDef {
                            secret: def.secret.as_bytes().to_vec(),
                        },
                    )
                })
            })
            .collect();

        let home_servers = config
            .config
            .home_servers
            .iter()
            .filter_map(|def| {
                def.address.parse::<SocketAddr>().ok().map(|addr| {
                    (
                        addr,
                        HomeServer {
                            secret: def.secret.as_bytes().to_vec(),
                            alive: true,
                            dead_until: 0,
                            next_id: 0,
                        },
                    )
                })
            })
            .collect();

        Ok(Network {
            el,
            port,
            listeners,
            clients,
            home_servers,
            channels: Vec::new(),
            live: IndexSet::new(),
            next_worker: 0,
            in_flight: 0,
            proxy_table: TrackingTable::new(),
            proxy_pending: HashMap::new(),
            proxy_listener,
            verifier,
            config,
            terminating: false,
            housekeeping_armed: false,
            recv_buf: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
            log,
        })
    }

    /// A control sender workers use to reach this thread.
    pub fn control_sender(&self) -> ControlSender {
        self.port.sender()
    }

    pub fn exit_handle(&self) -> ExitHandle {
        self.el.exit_handle()
    }

    /// The bound address of a listener, resolved after binding (useful with port 0).
    pub fn listener_addr(&self, idx: usize) -> SocketAddr {
        self.listeners[idx].addr
    }

    pub fn stats(&self, idx: usize) -> ListenerStats {
        self.listeners[idx].stats
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    pub fn num_live_channels(&self) -> usize {
        self.live.len()
    }

    /// Adopts a channel to a worker and starts the open handshake.
    pub fn add_channel(&mut self, mut end: NetworkEnd, worker_end: Box<crate::channel::WorkerEnd>) {
        if let Err(worker_end) = end.send_open(worker_end) {
            logging::error!(self.log, "channel open undeliverable"; "channel" => end.id());
            drop(worker_end);
            return;
        }

        self.channels.push(end);
    }

    /// Runs the network loop until shutdown completes. `on_reload` produces a fresh
    /// configuration version when a reload signal arrives. Returns the process exit code.
    pub fn run<F>(&mut self, signals: &SignalFlags, mut on_reload: F) -> i32
    where
        F: FnMut() -> Option<Arc<ConfigVersion>>,
    {
        loop {
            if signals.terminate.swap(false, Ordering::AcqRel) {
                self.begin_shutdown();
            }

            if signals.reload.swap(false, Ordering::AcqRel) {
                if let Some(version) = on_reload() {
                    self.apply_config(version);
                }
            }

            if self.terminating && self.live.is_empty() && self.channels.is_empty() {
                break;
            }

            if !self.tick(true) {
                break;
            }
        }

        logging::info!(self.log, "network thread stopped"; "in_flight" => self.in_flight);
        0
    }

    /// One non-blocking loop iteration, for harnesses driving the thread by hand.
    pub fn run_once(&mut self) -> bool {
        self.tick(false)
    }

    fn tick(&mut self, wait: bool) -> bool {
        if wait {
            for &idx in self.live.iter() {
                self.channels[idx].announce_sleep();
            }
            self.arm_housekeeping();
        }

        let fired = match self.el.corral(wait) {
            Some(fired) => fired,
            None => return false,
        };

        if fired > 0 {
            let events = self.el.service();
            for event in events {
                match event {
                    Event::Readable(token) => self.recv_packets(token.0),
                    Event::User => self.service_control(),
                    Event::Timer(TIMER_HOUSEKEEPING) => self.housekeeping_armed = false,
                    Event::Timer(payload) => {
                        logging::warn!(self.log, "unknown timer payload"; "payload" => payload);
                    }
                }
            }
        }

        self.drain_replies();

        let now = time::monotonic();
        self.sweep_proxies(now);

        true
    }

    fn arm_housekeeping(&mut self) {
        if !self.housekeeping_armed {
            let when = time::monotonic() + HOUSEKEEPING_INTERVAL;
            self.el.timer_insert(when, TIMER_HOUSEKEEPING);
            self.housekeeping_armed = true;
        }
    }

    fn service_control(&mut self) {
        for frame in self.port.drain() {
            match frame {
                Frame::ChannelOpenAck { channel } => {
                    if let Some(idx) = self.channel_index(channel) {
                        self.channels[idx].handle_open_ack();
                        self.live.insert(idx);
                    }
                }
                Frame::ChannelCloseAck { channel } => {
                    if let Some(idx) = self.channel_index(channel) {
                        self.channels[idx].handle_close_ack();
                        self.live.shift_remove(&idx);
                    }

                    if self.terminating && self.live.is_empty() {
                        self.channels.clear();
                    }
                }
                Frame::DataReady { .. } => {
                    // Drained unconditionally below.
                }
                Frame::Sleeping { channel } => {
                    logging::trace!(self.log, "worker sleeping"; "channel" => channel);
                }
                other => {
                    logging::warn!(self.log, "unexpected control frame"; "frame" => ?other);
                }
            }
        }
    }

    fn channel_index(&self, id: u64) -> Option<usize> {
        self.channels.iter().position(|end| end.id() == id)
    }

    fn recv_packets(&mut self, listener_idx: usize) {
        if listener_idx >= self.listeners.len() {
            return;
        }

        loop {
            let (len, src) = {
                let listener = &mut self.listeners[listener_idx];
                match listener.sock.recv_from(&mut self.recv_buf) {
                    Ok((len, src)) => (len, src),
                    Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        logging::warn!(self.log, "socket receive error";
                                       "listener" => listener_idx,
                                       "error" => %err);
                        break;
                    }
                }
            };

            self.handle_packet(listener_idx, len, src);
        }
    }

    fn handle_packet(&mut self, listener_idx: usize, len: usize, src: SocketAddr) {
        let now = time::monotonic();
        let dst = self.listeners[listener_idx].addr;
        self.listeners[listener_idx].stats.received += 1;

        let packet = self.recv_buf[..len].to_vec();

        let (envelope, body_range) = match parse_datagram(&packet, src, dst) {
            Ok((envelope, body)) => {
                let range = crate::packet::HEADER_SIZE..crate::packet::HEADER_SIZE + body.len();
                (envelope, range)
            }
            Err(_) => {
                self.listeners[listener_idx].stats.malformed += 1;
                return;
            }
        };

        let role = self.listeners[listener_idx].role;

        if role == ListenerRole::Proxy {
            if envelope.code.is_request() {
                self.listeners[listener_idx].stats.wrong_role += 1;
                return;
            }

            self.handle_proxy_reply(listener_idx, envelope, &packet, &packet[body_range], now);
            return;
        }

        if !self.role_accepts(role, envelope.code) {
            self.listeners[listener_idx].stats.wrong_role += 1;
            return;
        }

        let secret = match self.clients.get(&src.ip()) {
            Some(client) => client.secret.clone(),
            None => {
                self.listeners[listener_idx].stats.unknown_peer += 1;
                logging::debug!(self.log, "packet from unknown client"; "src" => %src);
                return;
            }
        };

        if !self.verifier.verify(&packet, &secret) {
            self.listeners[listener_idx].stats.malformed += 1;
            return;
        }

        let key = TrackingKey::client(&envelope);
        let cleanup_delay = self.config.config.cleanup_delay();

        let status = self.listeners[listener_idx]
            .tracker
            .insert(key, envelope.authenticator, now, cleanup_delay);

        match status {
            TrackingStatus::New => {
                self.admit(listener_idx, key, envelope, &packet[body_range], now);
            }
            TrackingStatus::DifferentWithSameId => {
                self.listeners[listener_idx].stats.conflicts += 1;
                self.admit(listener_idx, key, envelope, &packet[body_range], now);
            }
            TrackingStatus::SameAsLast => {
                self.listeners[listener_idx].stats.dup_replays += 1;

                let listener = &self.listeners[listener_idx];
                if let Some(reply) = listener.tracker.cached_reply(&key) {
                    drop(listener.sock.send_to(reply, &src));
                }
            }
            TrackingStatus::DuplicateInFlight => {
                self.listeners[listener_idx].stats.dup_drops += 1;

                if self.config.config.proxy_synchronous {
                    self.retransmit_for_client(&envelope, now);
                }
            }
        }
    }

    fn role_accepts(&self, role: ListenerRole, code: PacketCode) -> bool {
        let status_ok = self.config.config.status_server && code == PacketCode::StatusServer;

        match role {
            ListenerRole::Auth => code == PacketCode::AccessRequest || status_ok,
            ListenerRole::Acct => code == PacketCode::AccountingRequest || status_ok,
            ListenerRole::Proxy => false,
        }
    }

    /// Admits a new request against the global budget and dispatches it round-robin to a
    /// live worker channel.
    fn admit(&mut self, listener_idx: usize, key: TrackingKey, envelope: Envelope, body: &[u8], now: u64) {
        if self.terminating || self.in_flight >= self.config.config.max_requests {
            self.listeners[listener_idx].stats.overload_drops += 1;
            self.listeners[listener_idx].tracker.delete(&key);
            return;
        }

        if self.live.is_empty() {
            self.listeners[listener_idx].stats.overload_drops += 1;
            self.listeners[listener_idx].tracker.delete(&key);
            logging::warn!(self.log, "no live workers, dropping request");
            return;
        }

        let start_time = match self.listeners[listener_idx].tracker.entry(&key) {
            Some(entry) => entry.start_time.clone(),
            None => Arc::new(AtomicU64::new(now)),
        };

        let priority = Priority::for_code(envelope.code);

        // Round robin across live channels, skipping any whose queue is momentarily full.
        for attempt in 0..self.live.len() {
            let slot = (self.next_worker + attempt) % self.live.len();
            let idx = *self.live.get_index(slot).unwrap();

            let result = self.channels[idx].send_request(
                envelope,
                body,
                priority,
                now,
                start_time.clone(),
                listener_idx as u32,
            );

            if result.is_ok() {
                self.next_worker = (slot + 1) % self.live.len();
                self.listeners[listener_idx].stats.admitted += 1;
                self.in_flight += 1;
                return;
            }
        }

        self.listeners[listener_idx].stats.overload_drops += 1;
        self.listeners[listener_idx].tracker.delete(&key);
        logging::warn!(self.log, "all worker queues full, dropping request");
    }

    /// Pops every worker's outbound queue and handles the messages in priority order.
    fn drain_replies(&mut self) {
        let mut batch: Vec<(usize, Box<ChannelData>)> = Vec::new();

        for &idx in self.live.iter() {
            while let Some(cd) = self.channels[idx].recv_reply() {
                batch.push((idx, cd));
            }
        }

        if batch.is_empty() {
            return;
        }

        batch.sort_by_key(|(_, cd)| cd.priority);

        for (idx, cd) in batch {
            self.handle_worker_message(idx, cd);
        }
    }

    fn handle_worker_message(&mut self, idx: usize, cd: Box<ChannelData>) {
        let now = time::monotonic();

        match cd.kind {
            DataKind::Reply(_) => {
                let payload = self.channels[idx].reply_payload(&cd).to_vec();
                self.channels[idx].complete_reply(&cd);
                self.channels[idx].gc();

                let listener_idx = cd.listener as usize;
                if listener_idx >= self.listeners.len() {
                    return;
                }

                let key = TrackingKey {
                    id: cd.envelope.id,
                    peer: (cd.envelope.src.ip(), cd.envelope.src.port()),
                };

                let listener = &mut self.listeners[listener_idx];
                drop(listener.sock.send_to(&payload, &cd.envelope.src));
                listener.tracker.reply(&key, payload, now);
                listener.stats.replies += 1;

                self.in_flight = self.in_flight.saturating_sub(1);
            }
            DataKind::Nak(reason) => {
                self.channels[idx].complete_reply(&cd);

                let listener_idx = cd.listener as usize;
                if listener_idx < self.listeners.len() {
                    let key = TrackingKey {
                        id: cd.envelope.id,
                        peer: (cd.envelope.src.ip(), cd.envelope.src.port()),
                    };

                    self.listeners[listener_idx].tracker.delete(&key);
                    self.listeners[listener_idx].stats.naks += 1;
                }

                logging::debug!(self.log, "worker nak"; "reason" => ?reason);
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            DataKind::ProxyRequest {
                request_number,
                upstream,
            } => {
                let packet = self.channels[idx].reply_payload(&cd).to_vec();
                self.channels[idx].complete_reply(&cd);
                self.proxy_send(idx, &cd, request_number, upstream, packet, now);
            }
            ref other => {
                logging::warn!(self.log, "unexpected message from worker"; "kind" => ?other);
                self.channels[idx].complete_reply(&cd);
            }
        }
    }

    /// Transmits a worker's upstream packet from the proxy socket and tracks it for
    /// correlation and retransmission.
    fn proxy_send(
        &mut self,
        worker: usize,
        cd: &ChannelData,
        request_number: u64,
        upstream: SocketAddr,
        mut packet: Vec<u8>,
        now: u64,
    ) {
        let proxy_listener = match self.proxy_listener {
            Some(idx) => idx,
            None => {
                self.proxy_fail(worker, cd, request_number, now);
                return;
            }
        };

        let usable = match self.home_servers.get_mut(&upstream) {
            Some(home) => {
                if !home.alive && home.dead_until <= now {
                    // Quarantine expired; try it again.
                    home.alive = true;
                }
                home.alive
            }
            None => false,
        };

        if !usable || packet.len() < crate::packet::HEADER_SIZE {
            self.proxy_fail(worker, cd, request_number, now);
            return;
        }

        let home = self.home_servers.get_mut(&upstream).unwrap();
        let id = home.next_id;
        home.next_id = home.next_id.wrapping_add(1);
        packet[1] = id;

        let mut authenticator = [0u8; AUTHENTICATOR_SIZE];
        authenticator.copy_from_slice(&packet[4..crate::packet::HEADER_SIZE]);

        let key = TrackingKey::proxy(upstream, id);
        let config = &self.config.config;

        self.proxy_table.insert(key, authenticator, now, config.cleanup_delay());
        if let Some(entry) = self.proxy_table.entry_mut(&key) {
            entry.next_try = now + config.proxy_retry_delay();
            entry.retries_left = config.proxy_retry_count;
        }

        self.proxy_pending.insert(
            (upstream.ip(), upstream.port(), id),
            ProxyPending {
                worker,
                request_number,
                listener: cd.listener,
                envelope: cd.envelope,
                packet: packet.clone(),
            },
        );

        drop(self.listeners[proxy_listener].sock.send_to(&packet, &upstream));
        logging::debug!(self.log, "proxied upstream";
                        "request" => request_number,
                        "upstream" => %upstream,
                        "proxy_id" => id);
    }

    fn proxy_fail(&mut self, worker: usize, cd: &ChannelData, request_number: u64, now: u64) {
        logging::debug!(self.log, "proxy unavailable"; "request" => request_number);

        drop(self.channels[worker].send_proxy_reply(
            DataKind::ProxyExpired { request_number },
            cd.envelope,
            &[],
            now,
            Arc::new(AtomicU64::new(now)),
            cd.listener,
        ));
    }

    /// Correlates a reply arriving on a proxy socket and hands it to the owning worker's
    /// yielded request.
    fn handle_proxy_reply(
        &mut self,
        listener_idx: usize,
        envelope: Envelope,
        packet: &[u8],
        body: &[u8],
        now: u64,
    ) {
        let secret = match self.home_servers.get(&envelope.src) {
            Some(home) => home.secret.clone(),
            None => {
                self.listeners[listener_idx].stats.unknown_peer += 1;
                return;
            }
        };

        if !self.verifier.verify(packet, &secret) {
            self.listeners[listener_idx].stats.malformed += 1;
            return;
        }

        let key = (envelope.src.ip(), envelope.src.port(), envelope.id);
        let pending = match self.proxy_pending.remove(&key) {
            Some(pending) => pending,
            None => {
                // Late or duplicated upstream reply.
                self.listeners[listener_idx].stats.dup_drops += 1;
                return;
            }
        };

        if let Some(home) = self.home_servers.get_mut(&envelope.src) {
            home.alive = true;
            home.dead_until = 0;
        }

        self.proxy_table.delete(&TrackingKey::proxy(envelope.src, envelope.id));
        self.listeners[listener_idx].stats.replies += 1;

        drop(self.channels[pending.worker].send_proxy_reply(
            DataKind::ProxyReply {
                request_number: pending.request_number,
            },
            envelope,
            body,
            now,
            Arc::new(AtomicU64::new(now)),
            pending.listener,
        ));
    }

    /// In synchronous proxy mode, a suppressed client duplicate forces an immediate
    /// upstream retransmit once the pending packet's deadline has passed.
    fn retransmit_for_client(&mut self, envelope: &Envelope, now: u64) {
        let found = self.proxy_pending.iter().find(|(_, pending)| {
            pending.envelope.src == envelope.src && pending.envelope.id == envelope.id
        });

        let (key, packet, upstream) = match found {
            Some((&(ip, port, id), pending)) => (
                TrackingKey::proxy(SocketAddr::new(ip, port), id),
                pending.packet.clone(),
                SocketAddr::new(ip, port),
            ),
            None => return,
        };

        let due = self
            .proxy_table
            .entry(&key)
            .map(|entry| entry.next_try <= now)
            .unwrap_or(false);

        if !due {
            return;
        }

        if let Some(proxy_listener) = self.proxy_listener {
            drop(self.listeners[proxy_listener].sock.send_to(&packet, &upstream));
        }

        let retry_delay = self.config.config.proxy_retry_delay();
        if let Some(entry) = self.proxy_table.entry_mut(&key) {
            entry.next_try = now + retry_delay;
        }
    }

    /// Retransmits overdue upstream packets and declares home servers dead when their
    /// retry budget runs out.
    fn sweep_proxies(&mut self, now: u64) {
        let due = self.proxy_table.due_retries(now);
        if due.is_empty() {
            return;
        }

        let retry_delay = self.config.config.proxy_retry_delay();
        let dead_time = self.config.config.proxy_dead_time();

        for key in due {
            let upstream = SocketAddr::new(key.peer.0, key.peer.1);
            let pending_key = (key.peer.0, key.peer.1, key.id);

            let retries_left = match self.proxy_table.entry(&key) {
                Some(entry) => entry.retries_left,
                None => continue,
            };

            if retries_left > 0 {
                if let (Some(proxy_listener), Some(pending)) =
                    (self.proxy_listener, self.proxy_pending.get(&pending_key))
                {
                    drop(self.listeners[proxy_listener].sock.send_to(&pending.packet, &upstream));
                }

                if let Some(entry) = self.proxy_table.entry_mut(&key) {
                    entry.retries_left -= 1;
                    entry.next_try = now + retry_delay;
                }
                continue;
            }

            // Budget exhausted: quarantine the home server and fail the request.
            self.proxy_table.delete(&key);

            if let Some(home) = self.home_servers.get_mut(&upstream) {
                home.alive = false;
                home.dead_until = now + dead_time;
                logging::warn!(self.log, "home server marked dead"; "upstream" => %upstream);
            }

            if self.config.config.wake_all_if_all_dead
                && self.home_servers.values().all(|home| !home.alive)
            {
                logging::warn!(self.log, "all home servers dead, reviving all");
                for home in self.home_servers.values_mut() {
                    home.alive = true;
                    home.dead_until = 0;
                }
            }

            if let Some(pending) = self.proxy_pending.remove(&pending_key) {
                self.proxy_fail_pending(&pending, now);
            }
        }
    }

    fn proxy_fail_pending(&mut self, pending: &ProxyPending, now: u64) {
        drop(self.channels[pending.worker].send_proxy_reply(
            DataKind::ProxyExpired {
                request_number: pending.request_number,
            },
            pending.envelope,
            &[],
            now,
            Arc::new(AtomicU64::new(now)),
            pending.listener,
        ));
    }

    /// Applies a new configuration version locally and ships it to every worker.
    pub fn apply_config(&mut self, version: Arc<ConfigVersion>) {
        logging::info!(self.log, "applying configuration"; "version" => version.version);
        self.config = version.clone();

        for end in self.channels.iter_mut() {
            end.send_config(version.clone());
        }
    }

    /// Stops admitting new requests and starts closing every worker channel.
    pub fn begin_shutdown(&mut self) {
        if self.terminating {
            return;
        }

        logging::info!(self.log, "graceful shutdown started"; "in_flight" => self.in_flight);
        self.terminating = true;

        for &idx in self.live.clone().iter() {
            self.channels[idx].send_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, EngineConfig, ListenerConfig};
    use crate::packet::{encode_packet, AttrList, NullVerifier, TlvCodec, Value, ATTR_USER_NAME};
    use std::net::UdpSocket as StdUdpSocket;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.listeners = vec![ListenerConfig {
            address: "127.0.0.1:0".to_string(),
            role: ListenerRole::Auth,
        }];
        config.clients = vec![ClientConfig {
            address: "127.0.0.1".to_string(),
            secret: "testing123".to_string(),
        }];
        config
    }

    fn network(config: EngineConfig) -> Network {
        Network::new(
            ConfigVersion::new(1, config),
            Arc::new(NullVerifier),
            &logging::discard(),
        )
        .unwrap()
    }

    fn access_request(id: u8, auth: u8, user: &str) -> Vec<u8> {
        let codec = TlvCodec::new();
        let mut attrs = AttrList::new();
        attrs.push(ATTR_USER_NAME, Value::Text(user.to_string()));

        let mut buf = [0u8; 512];
        let len = encode_packet(
            PacketCode::AccessRequest,
            id,
            &[auth; AUTHENTICATOR_SIZE],
            &attrs,
            &codec,
            &mut buf,
        )
        .unwrap();

        buf[..len].to_vec()
    }

    fn pump(network: &mut Network, iterations: usize) {
        for _ in 0..iterations {
            assert!(network.run_once());
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_unknown_peer_dropped() {
        let mut config = test_config();
        config.clients.clear();

        let mut network = network(config);
        let addr = network.listener_addr(0);

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&access_request(1, 1, "alice"), addr).unwrap();

        pump(&mut network, 5);

        assert_eq!(network.stats(0).received, 1);
        assert_eq!(network.stats(0).unknown_peer, 1);
        assert_eq!(network.stats(0).admitted, 0);
    }

    #[test]
    fn test_malformed_dropped() {
        let mut network = network(test_config());
        let addr = network.listener_addr(0);

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&[1, 2, 3], addr).unwrap();

        pump(&mut network, 5);

        assert_eq!(network.stats(0).malformed, 1);
    }

    #[test]
    fn test_wrong_role_dropped() {
        let mut network = network(test_config());
        let addr = network.listener_addr(0);

        let codec = TlvCodec::new();
        let mut buf = [0u8; 64];
        let len = encode_packet(
            PacketCode::AccountingRequest,
            1,
            &[0; AUTHENTICATOR_SIZE],
            &AttrList::new(),
            &codec,
            &mut buf,
        )
        .unwrap();

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&buf[..len], addr).unwrap();

        pump(&mut network, 5);

        assert_eq!(network.stats(0).wrong_role, 1);
    }

    #[test]
    fn test_no_workers_drops_with_overload() {
        let mut network = network(test_config());
        let addr = network.listener_addr(0);

        let client = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&access_request(1, 1, "alice"), addr).unwrap();

        pump(&mut network, 5);

        assert_eq!(network.stats(0).received, 1);
        assert_eq!(network.stats(0).overload_drops, 1);
    }
}
