pub use crate::channel::{Channel, ChannelData, DataKind, NakReason, NetworkEnd, WorkerEnd};
pub use crate::config::{ConfigVersion, EngineConfig, ListenerRole};
pub use crate::error::{EngineError, EngineResult, ErrorKind, ErrorUtils};
pub use crate::event::{Event, EventList, Waker};
pub use crate::network::{Network, SignalFlags};
pub use crate::packet::{AttrList, Codec, Envelope, PacketCode, Priority, TlvCodec, Value};
pub use crate::policy::node::{Action, ActionTable, AttrUpdate, Condition, Node, NodeKind, Template};
pub use crate::policy::{
    CancelStatus, JobCtx, MapProc, Module, ModuleResult, PolicySet, Rcode, Suspended,
};
pub use crate::request::Request;
pub use crate::track::{TrackingKey, TrackingStatus, TrackingTable};
pub use crate::worker::Worker;
