use crate::packet::Value;
use crate::policy::{MapProc, Module, Rcode, RCODE_COUNT};
use crate::request::Request;
use std::sync::Arc;

/// The highest priority an action table may assign to a result code.
pub const PRIORITY_MAX: u8 = 64;

/// What to do with a child's result code: fold it in at a priority, return from the
/// enclosing group with it, or reject outright.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Action {
    Priority(u8),
    Return,
    Reject,
}

/// Per-node mapping from result code to [`Action`].
#[derive(Debug, Clone)]
pub struct ActionTable {
    actions: [Action; RCODE_COUNT],
}

impl ActionTable {
    /// The default table: successes fold in at rising priorities, hard failures return.
    pub fn default_table() -> ActionTable {
        let mut table = ActionTable {
            actions: [Action::Priority(1); RCODE_COUNT],
        };

        table.set(Rcode::Ok, Action::Priority(3));
        table.set(Rcode::Handled, Action::Return);
        table.set(Rcode::Updated, Action::Priority(4));
        table.set(Rcode::Noop, Action::Priority(2));
        table.set(Rcode::Notfound, Action::Priority(1));
        table.set(Rcode::Fail, Action::Priority(1));
        table.set(Rcode::Reject, Action::Return);
        table.set(Rcode::Invalid, Action::Return);
        table.set(Rcode::Userlock, Action::Return);
        table.set(Rcode::Disallow, Action::Return);
        table
    }

    pub fn set(&mut self, rcode: Rcode, action: Action) -> &mut Self {
        if let Action::Priority(priority) = action {
            assert!(priority <= PRIORITY_MAX, "Action priority out of range");
        }
        self.actions[rcode.index()] = action;
        self
    }

    #[inline]
    pub fn get(&self, rcode: Rcode) -> Action {
        self.actions[rcode.index()]
    }
}

/// A value producer: a literal, an attribute reference, or the current cursor of the
/// nearest enclosing foreach. This is the expansion seam; anything richer plugs in behind
/// the same interface.
#[derive(Debug, Clone)]
pub enum Template {
    Literal(String),
    Attr(u8),
    Cursor,
}

impl Template {
    pub fn expand(&self, req: &Request, cursor: Option<&Value>) -> Option<Value> {
        match self {
            Template::Literal(text) => Some(Value::Text(text.clone())),
            Template::Attr(typ) => req.attrs.first(*typ).cloned(),
            Template::Cursor => cursor.cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CondOp {
    Eq,
    Ne,
    Exists,
}

/// A predicate over a request, evaluated by `if`, `elsif` and friends.
#[derive(Debug, Clone)]
pub struct Condition {
    pub lhs: Template,
    pub op: CondOp,
    pub rhs: Option<Template>,
}

impl Condition {
    pub fn eval(&self, req: &Request, cursor: Option<&Value>) -> bool {
        let lhs = self.lhs.expand(req, cursor);

        match self.op {
            CondOp::Exists => lhs.is_some(),
            CondOp::Eq => match (lhs, self.rhs.as_ref().and_then(|rhs| rhs.expand(req, cursor))) {
                (Some(a), Some(b)) => value_eq(&a, &b),
                _ => false,
            },
            CondOp::Ne => match (lhs, self.rhs.as_ref().and_then(|rhs| rhs.expand(req, cursor))) {
                (Some(a), Some(b)) => !value_eq(&a, &b),
                _ => true,
            },
        }
    }
}

/// Values of different representations compare by their canonical bytes, so a literal can
/// match an octets attribute carrying text.
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(x), Value::Text(y)) | (Value::Text(y), Value::Int(x)) => {
            y.parse::<u32>().map(|parsed| parsed == *x).unwrap_or(false)
        }
        (x, y) => value_bytes(x) == value_bytes(y),
    }
}

fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Octets(bytes) => bytes.clone(),
        Value::Text(text) => text.as_bytes().to_vec(),
        Value::Int(int) => int.to_be_bytes().to_vec(),
    }
}

/// Which attribute list an update writes to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ListTarget {
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpdateOp {
    Set,
    Add,
    Remove,
}

/// One entry of an attribute-mutation map.
#[derive(Debug, Clone)]
pub struct AttrUpdate {
    pub list: ListTarget,
    pub attr: u8,
    pub op: UpdateOp,
    pub value: Option<Template>,
}

/// The policy graph. Nodes are immutable after compilation and shared by reference between
/// every worker.
pub struct Node {
    pub name: String,
    pub actions: ActionTable,
    pub kind: NodeKind,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("actions", &self.actions)
            .field("kind", &self.kind)
            .finish()
    }
}

pub enum NodeKind {
    /// Invoke an external method; may yield.
    ModuleCall(Arc<dyn Module>),
    /// Execute children sequentially.
    Group(Vec<Arc<Node>>),
    /// Pick one child by request-number weighting.
    LoadBalance(Vec<Arc<Node>>),
    /// Fall through children until one returns a good result.
    RedundantLoadBalance(Vec<Arc<Node>>),
    /// Run every child and gather the folded result.
    Parallel(Vec<Arc<Node>>),
    If { cond: Condition, children: Vec<Arc<Node>> },
    Elsif { cond: Condition, children: Vec<Arc<Node>> },
    Else(Vec<Arc<Node>>),
    Update(Vec<AttrUpdate>),
    Switch { tmpl: Template, cases: Vec<Arc<Node>> },
    Case { matches: Option<Value>, children: Vec<Arc<Node>> },
    Foreach { attr: u8, children: Vec<Arc<Node>> },
    Break,
    Return,
    Map(Arc<dyn MapProc>),
    /// A named reusable group.
    Policy(Arc<Node>),
    /// A bare expansion evaluated for effect.
    Xlat(Template),
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind_name())
    }
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::ModuleCall(_) => "module-call",
            NodeKind::Group(_) => "group",
            NodeKind::LoadBalance(_) => "load-balance",
            NodeKind::RedundantLoadBalance(_) => "redundant-load-balance",
            NodeKind::Parallel(_) => "parallel",
            NodeKind::If { .. } => "if",
            NodeKind::Elsif { .. } => "elsif",
            NodeKind::Else(_) => "else",
            NodeKind::Update(_) => "update",
            NodeKind::Switch { .. } => "switch",
            NodeKind::Case { .. } => "case",
            NodeKind::Foreach { .. } => "foreach",
            NodeKind::Break => "break",
            NodeKind::Return => "return",
            NodeKind::Map(_) => "map",
            NodeKind::Policy(_) => "policy",
            NodeKind::Xlat(_) => "xlat",
        }
    }

    pub fn has_children(&self) -> bool {
        match self {
            NodeKind::Group(_)
            | NodeKind::LoadBalance(_)
            | NodeKind::RedundantLoadBalance(_)
            | NodeKind::Parallel(_)
            | NodeKind::If { .. }
            | NodeKind::Elsif { .. }
            | NodeKind::Else(_)
            | NodeKind::Switch { .. }
            | NodeKind::Case { .. }
            | NodeKind::Foreach { .. }
            | NodeKind::Policy(_) => true,
            _ => false,
        }
    }

    /// True for kinds that terminate a `return` unwind.
    pub fn is_group_boundary(&self) -> bool {
        match self {
            NodeKind::Group(_)
            | NodeKind::Policy(_)
            | NodeKind::LoadBalance(_)
            | NodeKind::RedundantLoadBalance(_)
            | NodeKind::Parallel(_) => true,
            _ => false,
        }
    }
}

impl Node {
    pub fn new<S: Into<String>>(name: S, kind: NodeKind) -> Arc<Node> {
        Arc::new(Node {
            name: name.into(),
            actions: ActionTable::default_table(),
            kind,
        })
    }

    pub fn with_actions<S: Into<String>>(name: S, kind: NodeKind, actions: ActionTable) -> Arc<Node> {
        Arc::new(Node {
            name: name.into(),
            actions,
            kind,
        })
    }
}
