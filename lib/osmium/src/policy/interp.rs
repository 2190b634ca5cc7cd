use crate::packet::Value;
use crate::policy::node::{Action, AttrUpdate, ListTarget, Node, NodeKind, UpdateOp};
use crate::policy::{CancelStatus, JobCtx, ModuleResult, Rcode, Suspended};
use crate::request::Request;
use quartz::logging;
use std::sync::Arc;

/// Maximum interpreter stack depth. Exceeding it is a fatal per-request error: the request
/// aborts with `stop_now` set, never the process.
pub const STACK_MAX: usize = 64;

/// What the worker asks of the machine: run until it suspends or completes, or tear the
/// request down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepAction {
    Run,
    Done,
}

/// The machine's answer to one step call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Final {
    /// The request suspended; leave it tracked and do not reply.
    Yield,
    /// Policy completed with this result; encode and send a reply.
    Reply(Rcode),
    /// The request is finished without a reply (cancelled, aborted or fake).
    Done,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Unwind {
    Foreach,
    Group,
}

enum FrameState {
    None,
    /// If / elsif / else: whether the body runs.
    Cond { taken: bool },
    Foreach { values: Vec<Value>, idx: usize },
    Redundant { start: usize, tried: usize },
    /// Load-balance and switch after dispatching their single child.
    Chosen,
    /// A yielded module's continuation.
    Resume { suspended: Option<Box<dyn Suspended>> },
}

struct Frame {
    node: Arc<Node>,
    result: Rcode,
    priority: u8,
    was_if: bool,
    if_taken: bool,
    top_frame: bool,
    child_idx: usize,
    state: FrameState,
}

impl Frame {
    fn new(node: Arc<Node>, top_frame: bool) -> Frame {
        Frame {
            node,
            result: Rcode::Noop,
            priority: 0,
            was_if: false,
            if_taken: false,
            top_frame,
            child_idx: 0,
            state: FrameState::None,
        }
    }
}

enum Exec {
    Push(Arc<Node>),
    /// The frame finished. `None` means it was skipped and folds no result.
    Done(Option<Rcode>),
    Yield,
    BreakLoop,
    ReturnUnwind,
}

/// The per-request interpreter stack: a heap allocated call stack distinct from the native
/// one, which is what lets thousands of suspended requests share a thread.
pub struct InterpStack {
    frames: Vec<Frame>,
    unwind: Option<(Unwind, Option<Rcode>)>,
}

impl InterpStack {
    pub fn new() -> InterpStack {
        InterpStack {
            frames: Vec::new(),
            unwind: None,
        }
    }

    /// Seeds the stack with the policy root for the request.
    pub fn init(&mut self, root: Arc<Node>) {
        debug_assert!(self.frames.is_empty());
        self.frames.push(Frame::new(root, true));
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Drives a request's interpreter stack until it yields, completes, or finishes tearing
/// down. The stack is detached from the request for the duration so that modules can borrow
/// the request freely.
pub fn step(req: &mut Request, ctx: &mut JobCtx, action: StepAction) -> Final {
    let mut stack = std::mem::replace(&mut req.stack, InterpStack::new());
    let result = run(&mut stack, req, ctx, action);
    req.stack = stack;
    result
}

fn run(stack: &mut InterpStack, req: &mut Request, ctx: &mut JobCtx, action: StepAction) -> Final {
    if req.flags.finished {
        return Final::Done;
    }

    if let StepAction::Done = action {
        return cancel(stack, req, ctx);
    }

    if stack.frames.is_empty() {
        req.flags.finished = true;
        return Final::Done;
    }

    loop {
        if let Some((target, forced)) = stack.unwind.take() {
            match unwind_to(stack, req, target, forced) {
                Some(result) => return result,
                None => continue,
            }
        }

        match exec_top(stack, req, ctx) {
            Exec::Push(node) => {
                if stack.frames.len() >= STACK_MAX {
                    logging::error!(ctx.log, "stack depth exceeded, aborting request";
                                    "request" => req.number,
                                    "node" => node.name.clone());
                    stack.frames.clear();
                    req.flags.stop_now = true;
                    req.flags.finished = true;
                    return Final::Done;
                }

                stack.frames.push(Frame::new(node, false));
            }
            Exec::Yield => return Final::Yield,
            Exec::Done(result) => {
                if let Some(final_result) = complete_top(stack, req, result) {
                    return final_result;
                }
            }
            Exec::BreakLoop => {
                stack.frames.pop();
                stack.unwind = Some((Unwind::Foreach, None));
            }
            Exec::ReturnUnwind => {
                stack.frames.pop();
                stack.unwind = Some((Unwind::Group, None));
            }
        }
    }
}

/// Tears the stack down, giving every suspended module its cancellation callback. Modules
/// that report `Pending` keep the request alive; the worker re-polls on every sweep until
/// everything reports done.
fn cancel(stack: &mut InterpStack, req: &mut Request, ctx: &mut JobCtx) -> Final {
    let mut pending = false;

    for frame in stack.frames.iter_mut() {
        if let FrameState::Resume { suspended } = &mut frame.state {
            if let Some(live) = suspended.as_mut() {
                match live.cancel(req, ctx) {
                    CancelStatus::Done => *suspended = None,
                    CancelStatus::Pending => pending = true,
                }
            }
        }
    }

    if pending {
        Final::Yield
    } else {
        stack.frames.clear();
        req.flags.finished = true;
        Final::Done
    }
}

/// The current foreach cursor, from the innermost enclosing loop.
fn cursor_value(stack: &InterpStack) -> Option<Value> {
    stack.frames.iter().rev().find_map(|frame| match &frame.state {
        FrameState::Foreach { values, idx } => values.get(*idx).cloned(),
        _ => None,
    })
}

/// Executes one unit of the top frame.
fn exec_top(stack: &mut InterpStack, req: &mut Request, ctx: &mut JobCtx) -> Exec {
    let cursor = cursor_value(stack);

    let depth = stack.frames.len();
    let parent_flags = if depth >= 2 {
        let parent = &stack.frames[depth - 2];
        (parent.was_if, parent.if_taken)
    } else {
        (false, false)
    };

    let frame = stack.frames.last_mut().expect("exec on empty stack");
    let node = frame.node.clone();

    match &node.kind {
        NodeKind::ModuleCall(module) => {
            let result = match &mut frame.state {
                FrameState::Resume { suspended } => {
                    let live = suspended.take().expect("resume frame without continuation");
                    live.resume(req, ctx)
                }
                _ => module.call(req, ctx),
            };

            match result {
                ModuleResult::Code(rcode) => {
                    logging::trace!(ctx.log, "module returned";
                                    "request" => req.number,
                                    "module" => module.name().to_string(),
                                    "rcode" => rcode.name());
                    Exec::Done(Some(rcode))
                }
                ModuleResult::Yield(suspended) => {
                    frame.state = FrameState::Resume {
                        suspended: Some(suspended),
                    };
                    Exec::Yield
                }
            }
        }

        NodeKind::Group(children) | NodeKind::Parallel(children) | NodeKind::Case { children, .. } => {
            group_step(frame, children)
        }

        NodeKind::Policy(child) => {
            if frame.child_idx == 0 {
                Exec::Push(child.clone())
            } else {
                Exec::Done(Some(frame.result))
            }
        }

        NodeKind::If { cond, children } => {
            if let FrameState::None = frame.state {
                let taken = cond.eval(req, cursor.as_ref());
                frame.state = FrameState::Cond { taken };
            }

            cond_step(frame, children)
        }

        NodeKind::Elsif { cond, children } => {
            if let FrameState::None = frame.state {
                let (was_if, if_taken) = parent_flags;
                let taken = if was_if && if_taken {
                    // An earlier branch of the chain already ran.
                    false
                } else {
                    cond.eval(req, cursor.as_ref())
                };
                frame.state = FrameState::Cond { taken };
            }

            cond_step(frame, children)
        }

        NodeKind::Else(children) => {
            if let FrameState::None = frame.state {
                let (was_if, if_taken) = parent_flags;
                frame.state = FrameState::Cond {
                    taken: !(was_if && if_taken),
                };
            }

            cond_step(frame, children)
        }

        NodeKind::Update(updates) => Exec::Done(Some(apply_updates(req, updates, cursor.as_ref()))),

        NodeKind::Switch { tmpl, cases } => match frame.state {
            FrameState::Chosen => Exec::Done(Some(frame.result)),
            _ => {
                let value = tmpl.expand(req, cursor.as_ref());
                let chosen = choose_case(cases, value.as_ref());

                match chosen {
                    Some(case) => {
                        frame.state = FrameState::Chosen;
                        Exec::Push(case)
                    }
                    None => Exec::Done(Some(Rcode::Noop)),
                }
            }
        },

        NodeKind::Foreach { attr, children } => {
            if let FrameState::None = frame.state {
                let values = req.attrs.all(*attr);
                if values.is_empty() || children.is_empty() {
                    return Exec::Done(Some(Rcode::Noop));
                }
                frame.state = FrameState::Foreach { values, idx: 0 };
            }

            let num_children = children.len();
            let (lap_done, loop_done) = match &mut frame.state {
                FrameState::Foreach { values, idx } => {
                    if frame.child_idx >= num_children {
                        *idx += 1;
                        (true, *idx >= values.len())
                    } else {
                        (false, false)
                    }
                }
                _ => unreachable!("foreach frame without cursor state"),
            };

            if lap_done {
                frame.child_idx = 0;
            }

            if loop_done {
                Exec::Done(Some(frame.result))
            } else {
                Exec::Push(children[frame.child_idx].clone())
            }
        }

        NodeKind::Break => Exec::BreakLoop,

        NodeKind::Return => Exec::ReturnUnwind,

        NodeKind::Map(proc) => Exec::Done(Some(proc.apply(req))),

        NodeKind::Xlat(tmpl) => match tmpl.expand(req, cursor.as_ref()) {
            Some(_) => Exec::Done(Some(Rcode::Ok)),
            None => Exec::Done(Some(Rcode::Fail)),
        },

        NodeKind::LoadBalance(children) => match frame.state {
            FrameState::Chosen => Exec::Done(Some(frame.result)),
            _ => {
                if children.is_empty() {
                    return Exec::Done(Some(Rcode::Noop));
                }

                let idx = (req.number as usize) % children.len();
                frame.state = FrameState::Chosen;
                Exec::Push(children[idx].clone())
            }
        },

        NodeKind::RedundantLoadBalance(children) => match frame.state {
            FrameState::Redundant { start, tried } => {
                if tried >= children.len() {
                    Exec::Done(Some(frame.result))
                } else {
                    Exec::Push(children[(start + tried) % children.len()].clone())
                }
            }
            _ => {
                if children.is_empty() {
                    return Exec::Done(Some(Rcode::Noop));
                }

                let start = (req.number as usize) % children.len();
                frame.state = FrameState::Redundant { start, tried: 0 };
                Exec::Push(children[start].clone())
            }
        },
    }
}

/// Sequential child iteration shared by all plain bodies.
fn group_step(frame: &mut Frame, children: &[Arc<Node>]) -> Exec {
    if frame.child_idx < children.len() {
        Exec::Push(children[frame.child_idx].clone())
    } else {
        Exec::Done(Some(frame.result))
    }
}

/// Child iteration for conditional bodies: a branch that was not taken finishes without a
/// result so the surrounding group folds nothing.
fn cond_step(frame: &mut Frame, children: &[Arc<Node>]) -> Exec {
    match frame.state {
        FrameState::Cond { taken: false } => Exec::Done(None),
        _ => group_step(frame, children),
    }
}

fn choose_case(cases: &[Arc<Node>], value: Option<&Value>) -> Option<Arc<Node>> {
    let mut default = None;

    for case in cases {
        if let NodeKind::Case { matches, .. } = &case.kind {
            match (matches, value) {
                (Some(expect), Some(value)) if crate::policy::node::value_eq(expect, value) => {
                    return Some(case.clone());
                }
                (None, _) => default = Some(case.clone()),
                _ => {}
            }
        }
    }

    default
}

fn apply_updates(req: &mut Request, updates: &[AttrUpdate], cursor: Option<&Value>) -> Rcode {
    for update in updates {
        let value = match &update.value {
            Some(tmpl) => match tmpl.expand(req, cursor) {
                Some(value) => Some(value),
                None => return Rcode::Fail,
            },
            None => None,
        };

        let list = match update.list {
            ListTarget::Request => &mut req.attrs,
            ListTarget::Reply => &mut req.reply_attrs,
        };

        match (update.op, value) {
            (UpdateOp::Set, Some(value)) => list.set(update.attr, value),
            (UpdateOp::Add, Some(value)) => list.push(update.attr, value),
            (UpdateOp::Remove, _) => list.remove(update.attr),
            (_, None) => return Rcode::Fail,
        }
    }

    Rcode::Updated
}

/// Completes the top frame, folding its result into the parent and advancing the parent's
/// iteration. Returns the machine's final answer when the top of stack finished.
fn complete_top(stack: &mut InterpStack, req: &mut Request, result: Option<Rcode>) -> Option<Final> {
    let frame = stack.frames.pop().expect("complete on empty stack");

    if frame.top_frame {
        req.flags.finished = true;
        return Some(Final::Reply(result.unwrap_or(frame.result)));
    }

    let cond_taken = match frame.state {
        FrameState::Cond { taken } => Some(taken),
        _ => None,
    };

    let parent = stack.frames.last_mut().expect("child frame without parent");

    // Conditional chain bookkeeping lives on the parent so that a following elsif/else can
    // observe whether an earlier branch ran.
    match &frame.node.kind {
        NodeKind::If { .. } => {
            parent.was_if = true;
            parent.if_taken = cond_taken.unwrap_or(false);
        }
        NodeKind::Elsif { .. } | NodeKind::Else(_) => {
            parent.was_if = true;
            parent.if_taken |= cond_taken.unwrap_or(false);
        }
        _ => {
            parent.was_if = false;
            parent.if_taken = false;
        }
    }

    if let Some(rcode) = result {
        match frame.node.actions.get(rcode) {
            Action::Priority(priority) => {
                let replace = match parent.node.kind {
                    // Fallback sections track the most recent attempt, not the best one.
                    NodeKind::RedundantLoadBalance(_) => true,
                    _ => priority > parent.priority,
                };

                if replace {
                    parent.result = rcode;
                    parent.priority = priority;
                }
            }
            Action::Return => {
                stack.unwind = Some((Unwind::Group, Some(rcode)));
                return None;
            }
            Action::Reject => {
                stack.unwind = Some((Unwind::Group, Some(Rcode::Reject)));
                return None;
            }
        }
    }

    match &parent.node.kind {
        NodeKind::RedundantLoadBalance(children) => {
            let satisfied = result.map(|rcode| rcode.is_good()).unwrap_or(false);
            let len = children.len();

            if let FrameState::Redundant { tried, .. } = &mut parent.state {
                *tried = if satisfied { len } else { *tried + 1 };
            }
        }
        _ => parent.child_idx += 1,
    }

    None
}

/// Pops frames until the unwind target's boundary, then completes the boundary frame with
/// the carried (or its accumulated) result.
fn unwind_to(
    stack: &mut InterpStack,
    req: &mut Request,
    target: Unwind,
    forced: Option<Rcode>,
) -> Option<Final> {
    loop {
        let frame = match stack.frames.last() {
            Some(frame) => frame,
            None => {
                req.flags.finished = true;
                return Some(Final::Done);
            }
        };

        let boundary = frame.top_frame
            || match target {
                Unwind::Foreach => matches!(frame.node.kind, NodeKind::Foreach { .. }),
                Unwind::Group => frame.node.kind.is_group_boundary(),
            };

        if boundary {
            let result = Some(forced.unwrap_or(frame.result));
            return complete_top(stack, req, result);
        }

        stack.frames.pop();
    }
}
