//! The policy layer: an immutable tree of policy nodes and the cooperative stack machine
//! that executes it, one request at a time, with unlimited concurrent suspensions.

pub mod interp;
pub mod node;

use crate::event::EventList;
use crate::packet::PacketCode;
use crate::request::Request;
use quartz::logging::Logger;
use std::sync::Arc;

use self::node::Node;

/// The result of any policy step.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Rcode {
    Reject,
    Fail,
    Ok,
    Handled,
    Invalid,
    Userlock,
    Notfound,
    Noop,
    Updated,
    Disallow,
}

pub const RCODE_COUNT: usize = 10;

impl Rcode {
    pub const ALL: [Rcode; RCODE_COUNT] = [
        Rcode::Reject,
        Rcode::Fail,
        Rcode::Ok,
        Rcode::Handled,
        Rcode::Invalid,
        Rcode::Userlock,
        Rcode::Notfound,
        Rcode::Noop,
        Rcode::Updated,
        Rcode::Disallow,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Rcode::Reject => 0,
            Rcode::Fail => 1,
            Rcode::Ok => 2,
            Rcode::Handled => 3,
            Rcode::Invalid => 4,
            Rcode::Userlock => 5,
            Rcode::Notfound => 6,
            Rcode::Noop => 7,
            Rcode::Updated => 8,
            Rcode::Disallow => 9,
        }
    }

    /// Result codes that count as success for redundancy decisions and reply codes.
    #[inline]
    pub fn is_good(self) -> bool {
        match self {
            Rcode::Ok | Rcode::Handled | Rcode::Updated | Rcode::Noop => true,
            _ => false,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Rcode::Reject => "reject",
            Rcode::Fail => "fail",
            Rcode::Ok => "ok",
            Rcode::Handled => "handled",
            Rcode::Invalid => "invalid",
            Rcode::Userlock => "userlock",
            Rcode::Notfound => "notfound",
            Rcode::Noop => "noop",
            Rcode::Updated => "updated",
            Rcode::Disallow => "disallow",
        }
    }
}

/// Worker facilities exposed to modules while they run: the clock, the timer wheel and a
/// logger. The payload handed to `schedule_resume` wakes the owning request.
pub struct JobCtx<'a> {
    pub now: u64,
    pub el: &'a mut EventList,
    pub log: &'a Logger,
    pub request_number: u64,
}

impl<'a> JobCtx<'a> {
    /// Schedules the owning request to resume after `delay` nanoseconds.
    pub fn schedule_resume(&mut self, delay: u64) -> u64 {
        let payload = crate::worker::timer_payload(crate::worker::TIMER_RESUME, self.request_number);
        self.el.timer_insert(self.now + delay, payload)
    }
}

/// What a module call (or a resumption) produced: a terminal result code, or a suspension
/// holding the module's continuation.
pub enum ModuleResult {
    Code(Rcode),
    Yield(Box<dyn Suspended>),
}

/// Whether a cancelled module has finished releasing its resources.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CancelStatus {
    Done,
    Pending,
}

/// A suspended module continuation. `resume` is invoked when the awaited event fires and may
/// suspend again; `cancel` is invoked when the request is torn down (deadline or channel
/// close) and is polled on every sweep until it reports `Done`.
pub trait Suspended: Send {
    fn resume(self: Box<Self>, req: &mut Request, ctx: &mut JobCtx) -> ModuleResult;
    fn cancel(&mut self, req: &mut Request, ctx: &mut JobCtx) -> CancelStatus;
}

/// An external policy module. Must not block; long operations yield and resume.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    fn call(&self, req: &mut Request, ctx: &mut JobCtx) -> ModuleResult;
}

/// A list-mapping procedure, the seam behind `map` nodes.
pub trait MapProc: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, req: &mut Request) -> Rcode;
}

/// The compiled policy roots the engine dispatches on, one per code class.
pub struct PolicySet {
    pub auth: Arc<Node>,
    pub acct: Arc<Node>,
    pub status: Arc<Node>,
}

impl PolicySet {
    #[inline]
    pub fn root_for(&self, code: PacketCode) -> Arc<Node> {
        match code {
            PacketCode::AccountingRequest => self.acct.clone(),
            PacketCode::StatusServer => self.status.clone(),
            _ => self.auth.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcode_indexes_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for rcode in Rcode::ALL.iter() {
            assert!(seen.insert(rcode.index()));
            assert!(rcode.index() < RCODE_COUNT);
        }
    }

    #[test]
    fn test_good_codes() {
        assert!(Rcode::Ok.is_good());
        assert!(Rcode::Noop.is_good());
        assert!(!Rcode::Reject.is_good());
        assert!(!Rcode::Fail.is_good());
        assert!(!Rcode::Disallow.is_good());
    }
}
