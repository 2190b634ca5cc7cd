use hashbrown::HashSet;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use quartz::time;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The token carrying control-plane wakeups. A fixed constant shared by every sender; it does
/// not encode which channel triggered it, the receiver drains all of them.
pub const USER_TOKEN: Token = Token(usize::max_value() - 1);

const EVENTS_CAPACITY: usize = 8192;

/// Cloneable handle producers use to trigger the owning thread's user event.
#[derive(Clone)]
pub struct Waker {
    readiness: SetReadiness,
}

impl Waker {
    /// Triggers the user event. One trigger wakes the receiver regardless of how many frames
    /// were pushed before it.
    #[inline]
    pub fn wake(&self) -> io::Result<()> {
        self.readiness.set_readiness(Ready::readable())
    }

    /// Re-arms the user event. Called by the receiver after draining its control queue so the
    /// next trigger produces a fresh edge.
    #[inline]
    pub fn rearm(&self) -> io::Result<()> {
        self.readiness.set_readiness(Ready::empty())
    }
}

/// Cross-thread handle that makes the owning event loop's `corral` return `None`.
#[derive(Clone)]
pub struct ExitHandle {
    flag: Arc<AtomicBool>,
    waker: Waker,
}

impl ExitHandle {
    pub fn exit(&self) {
        self.flag.store(true, Ordering::Release);
        drop(self.waker.wake());
    }
}

/// Something the event loop observed: the user event fired, a socket became readable, or a
/// timed callback came due (carrying its opaque payload).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Event {
    User,
    Readable(Token),
    Timer(u64),
}

#[derive(Eq, PartialEq)]
struct TimerEntry {
    when: u64,
    id: u64,
    payload: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> std::cmp::Ordering {
        (self.when, self.id).cmp(&(other.when, other.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-thread event multiplexer: a kernel poll, one user-event token for control-plane
/// wakeups, registered sockets, and timed callbacks ordered by deadline.
pub struct EventList {
    poll: Poll,
    events: Events,
    _user: Registration,
    waker: Waker,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    pending_timers: HashSet<u64>,
    cancelled_timers: HashSet<u64>,
    next_timer_id: u64,
    exit: Arc<AtomicBool>,
    fired: Vec<Event>,
}

impl EventList {
    pub fn new() -> io::Result<EventList> {
        let poll = Poll::new()?;
        let (registration, readiness) = Registration::new2();

        poll.register(&registration, USER_TOKEN, Ready::readable(), PollOpt::edge())?;

        Ok(EventList {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            _user: registration,
            waker: Waker { readiness },
            timers: BinaryHeap::new(),
            pending_timers: HashSet::new(),
            cancelled_timers: HashSet::new(),
            next_timer_id: 0,
            exit: Arc::new(AtomicBool::new(false)),
            fired: Vec::new(),
        })
    }

    /// The wakeup handle for this loop's user event.
    #[inline]
    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    #[inline]
    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle {
            flag: self.exit.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Requests loop termination from the owning thread.
    #[inline]
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    #[inline]
    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Registers a socket for edge-triggered readable events under the supplied token.
    #[inline]
    pub fn register<E: mio::Evented>(&self, evented: &E, token: Token) -> io::Result<()> {
        self.poll.register(evented, token, Ready::readable(), PollOpt::edge())
    }

    #[inline]
    pub fn deregister<E: mio::Evented>(&self, evented: &E) -> io::Result<()> {
        self.poll.deregister(evented)
    }

    /// Schedules a timed callback at absolute monotonic time `when`, returning an id usable
    /// with [`EventList::timer_delete`]. The payload is returned verbatim when it fires.
    pub fn timer_insert(&mut self, when: u64, payload: u64) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;

        self.timers.push(Reverse(TimerEntry { when, id, payload }));
        self.pending_timers.insert(id);
        id
    }

    /// Cancels a pending timer. Already-fired ids are ignored.
    pub fn timer_delete(&mut self, id: u64) {
        if self.pending_timers.remove(&id) {
            self.cancelled_timers.insert(id);
        }
    }

    fn next_deadline(&mut self) -> Option<u64> {
        loop {
            let (id, when) = match self.timers.peek() {
                Some(Reverse(entry)) => (entry.id, entry.when),
                None => return None,
            };

            if self.cancelled_timers.remove(&id) {
                self.timers.pop();
                continue;
            }

            return Some(when);
        }
    }

    /// Waits for events. With `wait == false` the kernel is only polled; otherwise the call
    /// blocks until the next timer deadline or the first event. Returns the number of
    /// outstanding items to service, or `None` when loop exit has been requested.
    pub fn corral(&mut self, wait: bool) -> Option<usize> {
        if self.exiting() {
            return None;
        }

        let timeout = if !wait {
            Some(Duration::from_millis(0))
        } else {
            let now = time::monotonic();
            self.next_deadline()
                .map(|when| Duration::from_nanos(when.saturating_sub(now)))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return None,
        }

        if self.exiting() {
            return None;
        }

        for i in 0..self.events.len() {
            let event = match self.events.get(i) {
                Some(event) => event,
                None => break,
            };

            match event.token() {
                USER_TOKEN => self.fired.push(Event::User),
                token => self.fired.push(Event::Readable(token)),
            }
        }

        let now = time::monotonic();
        loop {
            let due = match self.timers.peek() {
                Some(Reverse(entry)) => entry.when <= now,
                None => false,
            };
            if !due {
                break;
            }

            let Reverse(entry) = self.timers.pop().unwrap();
            self.pending_timers.remove(&entry.id);

            if !self.cancelled_timers.remove(&entry.id) {
                self.fired.push(Event::Timer(entry.payload));
            }
        }

        Some(self.fired.len())
    }

    /// Drains the events gathered by the last `corral`.
    #[inline]
    pub fn service(&mut self) -> Vec<Event> {
        std::mem::replace(&mut self.fired, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_event_roundtrip() {
        let mut el = EventList::new().unwrap();
        let waker = el.waker();

        waker.wake().unwrap();

        let count = el.corral(true).unwrap();
        assert!(count >= 1);
        assert!(el.service().contains(&Event::User));

        // After re-arming, a new wake produces a new edge.
        waker.rearm().unwrap();
        waker.wake().unwrap();
        let count = el.corral(true).unwrap();
        assert!(count >= 1);
    }

    #[test]
    fn test_timer_fires_in_order() {
        let mut el = EventList::new().unwrap();
        let now = time::monotonic();

        el.timer_insert(now + 2_000_000, 2);
        el.timer_insert(now + 1_000_000, 1);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if el.corral(true).unwrap() > 0 {
                for event in el.service() {
                    if let Event::Timer(payload) = event {
                        seen.push(payload);
                    }
                }
            }
        }

        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_timer_delete() {
        let mut el = EventList::new().unwrap();
        let now = time::monotonic();

        let doomed = el.timer_insert(now + 1_000_000, 7);
        el.timer_insert(now + 2_000_000, 8);
        el.timer_delete(doomed);

        let mut seen = Vec::new();
        while seen.is_empty() {
            if el.corral(true).unwrap() > 0 {
                for event in el.service() {
                    if let Event::Timer(payload) = event {
                        seen.push(payload);
                    }
                }
            }
        }

        assert_eq!(seen, vec![8]);
    }

    #[test]
    fn test_exit_handle() {
        let mut el = EventList::new().unwrap();
        let exit = el.exit_handle();

        exit.exit();
        assert!(el.corral(true).is_none());
    }

    #[test]
    fn test_nonblocking_corral_returns_immediately() {
        let mut el = EventList::new().unwrap();
        assert_eq!(el.corral(false), Some(0));
    }
}
