use hashbrown::HashMap;
use osmium::packet::{
    encode_packet, Codec, Value, ATTR_REPLY_MESSAGE, ATTR_USER_NAME, ATTR_USER_PASSWORD,
    MAX_PACKET_SIZE,
};
use osmium::policy::{CancelStatus, JobCtx, Module, ModuleResult, Rcode, Suspended};
use osmium::request::Request;
use osmium::worker::{ProxyOutcome, ProxySend, PROXY_OUTCOME_KEY, PROXY_SEND_KEY};
use quartz::time::NANOS_PER_MSEC;
use std::net::SocketAddr;
use std::sync::Arc;

/// Name-keyed registry of configured module instances, resolved by the policy compiler.
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            modules: HashMap::new(),
        }
    }

    pub fn register<S: Into<String>>(&mut self, name: S, module: Arc<dyn Module>) -> &mut Self {
        self.modules.insert(name.into(), module);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }
}

/// Returns a fixed result code; the building block for policy plumbing and tests.
pub struct Always {
    rcode: Rcode,
}

impl Always {
    pub fn new(rcode: Rcode) -> Always {
        Always { rcode }
    }
}

impl Module for Always {
    fn name(&self) -> &str {
        "always"
    }

    fn call(&self, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        ModuleResult::Code(self.rcode)
    }
}

/// Appends a fixed Reply-Message attribute to the reply.
pub struct ReplyMessage {
    text: String,
}

impl ReplyMessage {
    pub fn new<S: Into<String>>(text: S) -> ReplyMessage {
        ReplyMessage { text: text.into() }
    }
}

impl Module for ReplyMessage {
    fn name(&self) -> &str {
        "reply_message"
    }

    fn call(&self, req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        req.reply_attrs
            .push(ATTR_REPLY_MESSAGE, Value::Text(self.text.clone()));
        ModuleResult::Code(Rcode::Updated)
    }
}

/// Clear-text password check against a configured credential table.
pub struct Pap {
    users: HashMap<String, String>,
}

impl Pap {
    pub fn new(users: HashMap<String, String>) -> Pap {
        Pap { users }
    }
}

impl Module for Pap {
    fn name(&self) -> &str {
        "pap"
    }

    fn call(&self, req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        let user = match req.attrs.first(ATTR_USER_NAME).and_then(|v| v.as_text()) {
            Some(user) => user.to_string(),
            None => return ModuleResult::Code(Rcode::Noop),
        };

        let password = match req.attrs.first(ATTR_USER_PASSWORD).and_then(|v| v.as_text()) {
            Some(password) => password.to_string(),
            None => return ModuleResult::Code(Rcode::Invalid),
        };

        match self.users.get(&user) {
            Some(expected) if *expected == password => ModuleResult::Code(Rcode::Ok),
            Some(_) => ModuleResult::Code(Rcode::Reject),
            None => ModuleResult::Code(Rcode::Notfound),
        }
    }
}

/// Suspends the request and resumes it after a fixed delay. Exercises the yield plumbing
/// and stands in for any module awaiting an external event.
pub struct Sleep {
    delay_ms: u64,
}

impl Sleep {
    pub fn new(delay_ms: u64) -> Sleep {
        Sleep { delay_ms }
    }
}

struct SleepState;

impl Module for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn call(&self, _req: &mut Request, ctx: &mut JobCtx) -> ModuleResult {
        ctx.schedule_resume(self.delay_ms * NANOS_PER_MSEC);
        ModuleResult::Yield(Box::new(SleepState))
    }
}

impl Suspended for SleepState {
    fn resume(self: Box<Self>, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        ModuleResult::Code(Rcode::Ok)
    }

    fn cancel(&mut self, _req: &mut Request, _ctx: &mut JobCtx) -> CancelStatus {
        CancelStatus::Done
    }
}

/// Suspends the request and never resumes it. Used to exercise deadlines and teardown.
pub struct Detain;

struct DetainState;

impl Module for Detain {
    fn name(&self) -> &str {
        "detain"
    }

    fn call(&self, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        ModuleResult::Yield(Box::new(DetainState))
    }
}

impl Suspended for DetainState {
    fn resume(self: Box<Self>, _req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        ModuleResult::Code(Rcode::Ok)
    }

    fn cancel(&mut self, _req: &mut Request, _ctx: &mut JobCtx) -> CancelStatus {
        CancelStatus::Done
    }
}

/// Forwards the request to a home server and suspends until the network thread delivers the
/// correlated upstream reply (or gives up on it).
pub struct Proxy {
    upstream: SocketAddr,
    codec: Arc<dyn Codec>,
}

struct ProxyState;

impl Proxy {
    pub fn new(upstream: SocketAddr, codec: Arc<dyn Codec>) -> Proxy {
        Proxy { upstream, codec }
    }
}

impl Module for Proxy {
    fn name(&self) -> &str {
        "proxy"
    }

    fn call(&self, req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        let mut buf = [0u8; MAX_PACKET_SIZE];

        let len = match encode_packet(
            req.envelope.code,
            0,
            &req.envelope.authenticator,
            &req.attrs,
            &*self.codec,
            &mut buf,
        ) {
            Ok(len) => len,
            Err(_) => return ModuleResult::Code(Rcode::Fail),
        };

        req.attach(
            PROXY_SEND_KEY,
            ProxySend {
                upstream: self.upstream,
                packet: buf[..len].to_vec(),
            },
        );

        ModuleResult::Yield(Box::new(ProxyState))
    }
}

impl Suspended for ProxyState {
    fn resume(self: Box<Self>, req: &mut Request, _ctx: &mut JobCtx) -> ModuleResult {
        let outcome = match req.take_data::<ProxyOutcome>(PROXY_OUTCOME_KEY) {
            Some(outcome) => outcome,
            None => return ModuleResult::Code(Rcode::Fail),
        };

        if outcome.failed {
            return ModuleResult::Code(Rcode::Fail);
        }

        if let Some(attrs) = outcome.attrs {
            for attr in attrs.iter() {
                req.reply_attrs.push(attr.typ, attr.value.clone());
            }
        }

        ModuleResult::Code(Rcode::Ok)
    }

    fn cancel(&mut self, _req: &mut Request, _ctx: &mut JobCtx) -> CancelStatus {
        CancelStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmium::config::{ConfigVersion, EngineConfig};
    use osmium::event::EventList;
    use osmium::packet::{AttrList, Envelope, PacketCode, Priority, AUTHENTICATOR_SIZE};
    use quartz::logging;
    use std::sync::atomic::AtomicU64;

    fn request(user: Option<&str>, password: Option<&str>) -> Request {
        let envelope = Envelope {
            code: PacketCode::AccessRequest,
            id: 1,
            authenticator: [0; AUTHENTICATOR_SIZE],
            src: "127.0.0.1:50000".parse().unwrap(),
            dst: "127.0.0.1:1812".parse().unwrap(),
        };

        let mut attrs = AttrList::new();
        if let Some(user) = user {
            attrs.push(ATTR_USER_NAME, Value::Text(user.to_string()));
        }
        if let Some(password) = password {
            attrs.push(ATTR_USER_PASSWORD, Value::Text(password.to_string()));
        }

        Request::new(
            envelope,
            attrs,
            0,
            Priority::AUTH,
            0,
            0,
            Arc::new(AtomicU64::new(0)),
            ConfigVersion::new(1, EngineConfig::default()),
        )
    }

    fn with_ctx<F: FnOnce(&mut Request, &mut JobCtx) -> ModuleResult>(
        req: &mut Request,
        body: F,
    ) -> ModuleResult {
        let mut el = EventList::new().unwrap();
        let log = logging::discard();
        let mut ctx = JobCtx {
            now: 0,
            el: &mut el,
            log: &log,
            request_number: req.number,
        };
        body(req, &mut ctx)
    }

    fn rcode(result: ModuleResult) -> Rcode {
        match result {
            ModuleResult::Code(rcode) => rcode,
            ModuleResult::Yield(_) => panic!("unexpected yield"),
        }
    }

    #[test]
    fn test_pap_outcomes() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "secret".to_string());
        let pap = Pap::new(users);

        let mut req = request(Some("alice"), Some("secret"));
        assert_eq!(rcode(with_ctx(&mut req, |r, c| pap.call(r, c))), Rcode::Ok);

        let mut req = request(Some("alice"), Some("wrong"));
        assert_eq!(rcode(with_ctx(&mut req, |r, c| pap.call(r, c))), Rcode::Reject);

        let mut req = request(Some("mallory"), Some("secret"));
        assert_eq!(rcode(with_ctx(&mut req, |r, c| pap.call(r, c))), Rcode::Notfound);

        let mut req = request(Some("alice"), None);
        assert_eq!(rcode(with_ctx(&mut req, |r, c| pap.call(r, c))), Rcode::Invalid);

        let mut req = request(None, None);
        assert_eq!(rcode(with_ctx(&mut req, |r, c| pap.call(r, c))), Rcode::Noop);
    }

    #[test]
    fn test_reply_message_appends() {
        let module = ReplyMessage::new("hello");
        let mut req = request(Some("alice"), None);

        assert_eq!(
            rcode(with_ctx(&mut req, |r, c| module.call(r, c))),
            Rcode::Updated
        );
        assert_eq!(
            req.reply_attrs.first(ATTR_REPLY_MESSAGE).unwrap().as_text(),
            Some("hello")
        );
    }

    #[test]
    fn test_sleep_yields_and_arms_timer() {
        let module = Sleep::new(1);
        let mut req = request(Some("alice"), None);

        let result = with_ctx(&mut req, |r, c| module.call(r, c));
        assert!(matches!(result, ModuleResult::Yield(_)));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ModuleRegistry::new();
        registry.register("always-ok", Arc::new(Always::new(Rcode::Ok)));

        assert!(registry.get("always-ok").is_some());
        assert!(registry.get("missing").is_none());
    }
}
