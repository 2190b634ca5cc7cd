use osmium::channel::Channel;
use osmium::config::{ConfigVersion, EngineConfig};
use osmium::error::{EngineError, EngineResult, ErrorKind};
use osmium::event::ExitHandle;
use osmium::network::{Network, SignalFlags};
use osmium::packet::{Codec, NullVerifier, TlvCodec, Verifier};
use osmium::policy::PolicySet;
use osmium::substrate::control::{ControlSender, Frame};
use osmium::worker::Worker;
use quartz::logging::{self, Logger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The assembled server: one network thread (run on the caller's thread), a pool of worker
/// threads, and a channel per worker with the open handshake already in flight.
pub struct Engine {
    network: Network,
    workers: Vec<JoinHandle<()>>,
    worker_senders: Vec<ControlSender>,
    worker_exits: Vec<ExitHandle>,
    signals: Arc<SignalFlags>,
    log: Logger,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        policies: Arc<PolicySet>,
        single_thread: bool,
        log: &Logger,
    ) -> EngineResult<Engine> {
        Self::with_verifier(config, policies, Arc::new(NullVerifier), single_thread, log)
    }

    pub fn with_verifier(
        config: EngineConfig,
        policies: Arc<PolicySet>,
        verifier: Arc<dyn Verifier>,
        single_thread: bool,
        log: &Logger,
    ) -> EngineResult<Engine> {
        config.validate()?;
        quartz::time::init();

        let version = ConfigVersion::new(1, config);
        let codec: Arc<dyn Codec> = Arc::new(TlvCodec::new());

        let mut network = Network::new(version.clone(), verifier, log)?;

        let num_workers = if single_thread { 1 } else { version.config.workers };
        let message_set_size = version.config.message_set_size;
        let ring_buffer_size = version.config.ring_buffer_size;

        let mut workers = Vec::new();
        let mut worker_senders = Vec::new();
        let mut worker_exits = Vec::new();

        for i in 0..num_workers {
            let worker = Worker::new(policies.clone(), codec.clone(), version.clone(), log)
                .map_err(EngineError::from)?;

            worker_senders.push(worker.control_sender());
            worker_exits.push(worker.exit_handle());

            let (network_end, worker_end) = Channel::create(
                i as u64,
                worker.control_sender(),
                network.control_sender(),
                message_set_size,
                ring_buffer_size,
                log,
            );

            network.add_channel(network_end, Box::new(worker_end));

            let handle = std::thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    let mut worker = worker;
                    worker.run();
                })
                .map_err(|_| EngineError::Fatal(ErrorKind::Config))?;

            workers.push(handle);
        }

        logging::info!(log, "engine assembled"; "workers" => num_workers);

        Ok(Engine {
            network,
            workers,
            worker_senders,
            worker_exits,
            signals: SignalFlags::new(),
            log: log.new(logging::o!()),
        })
    }

    /// The signal flags the runner's handlers flip.
    pub fn signals(&self) -> Arc<SignalFlags> {
        self.signals.clone()
    }

    /// The bound address of a listener; with port 0 in the configuration this is the
    /// kernel-assigned port.
    pub fn listener_addr(&self, idx: usize) -> SocketAddr {
        self.network.listener_addr(idx)
    }

    /// Runs the network loop on the calling thread until graceful shutdown, then stops and
    /// joins the worker pool. Returns the process exit code.
    pub fn run<F>(mut self, on_reload: F) -> i32
    where
        F: FnMut() -> Option<Arc<ConfigVersion>>,
    {
        let code = self.network.run(&self.signals, on_reload);

        for sender in self.worker_senders.iter_mut() {
            sender.send(Frame::Exit);
        }
        for exit in self.worker_exits.iter() {
            exit.exit();
        }

        for handle in self.workers.drain(..) {
            drop(handle.join());
        }

        logging::info!(self.log, "engine stopped"; "code" => code);
        code
    }
}
