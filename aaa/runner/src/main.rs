use aaacore::modules::{Always, Detain, ModuleRegistry, Pap, Proxy, ReplyMessage, Sleep};
use aaacore::{compile_set, Engine, PolicyConfig};
use clap::{App, Arg};
use hashbrown::HashMap;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use osmium::config::{ConfigVersion, EngineConfig};
use osmium::network::SignalFlags;
use osmium::packet::{Codec, TlvCodec};
use osmium::policy::{PolicySet, Rcode};
use quartz::logging;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static SIGNAL_FLAGS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_signal(sig: libc::c_int) {
    let raw = SIGNAL_FLAGS.load(Ordering::Acquire);
    if raw == 0 {
        return;
    }

    // The pointer is a leaked Arc installed before the handlers; atomics only in here.
    let flags = unsafe { &*(raw as *const SignalFlags) };

    match sig {
        libc::SIGHUP => flags.reload.store(true, Ordering::Release),
        libc::SIGTERM | libc::SIGINT => flags.terminate.store(true, Ordering::Release),
        _ => unsafe { libc::_exit(2) },
    }
}

fn install_signals(flags: Arc<SignalFlags>, allow_core_dumps: bool) {
    SIGNAL_FLAGS.store(Arc::into_raw(flags) as usize, Ordering::Release);

    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());

    unsafe {
        signal::sigaction(Signal::SIGHUP, &action).expect("Error installing SIGHUP handler");
        signal::sigaction(Signal::SIGTERM, &action).expect("Error installing SIGTERM handler");
        signal::sigaction(Signal::SIGINT, &action).expect("Error installing SIGINT handler");

        // Leave fatal signals at their default disposition when core dumps are wanted.
        if !allow_core_dumps {
            signal::sigaction(Signal::SIGQUIT, &action).expect("Error installing SIGQUIT handler");
        }
    }
}

fn load_config(dir: &Path) -> EngineConfig {
    EngineConfig::load(dir.join("server.toml")).unwrap_or_else(|err| {
        eprintln!("Error loading {}: {:?}", dir.join("server.toml").display(), err);
        process::exit(1);
    })
}

fn load_users(dir: &Path) -> HashMap<String, String> {
    match serdeconv::from_toml_file(dir.join("users.toml")) {
        Ok(users) => users,
        Err(_) => HashMap::new(),
    }
}

fn build_registry(config: &EngineConfig, dir: &Path, codec: Arc<dyn Codec>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();

    registry.register("accept", Arc::new(Always::new(Rcode::Ok)));
    registry.register("reject", Arc::new(Always::new(Rcode::Reject)));
    registry.register("noop", Arc::new(Always::new(Rcode::Noop)));
    registry.register("handled", Arc::new(Always::new(Rcode::Handled)));
    registry.register("reply_message", Arc::new(ReplyMessage::new("Authentication OK")));
    registry.register("pap", Arc::new(Pap::new(load_users(dir))));
    registry.register("sleep", Arc::new(Sleep::new(1)));
    registry.register("detain", Arc::new(Detain));

    if let Some(home) = config.home_servers.first() {
        if let Ok(upstream) = home.address.parse() {
            registry.register("proxy", Arc::new(Proxy::new(upstream, codec)));
        }
    }

    registry
}

fn load_policies(dir: &Path, registry: &ModuleRegistry) -> Arc<PolicySet> {
    let config: PolicyConfig =
        serdeconv::from_toml_file(dir.join("policy.toml")).unwrap_or_else(|err| {
            eprintln!("Error loading {}: {}", dir.join("policy.toml").display(), err);
            process::exit(1);
        });

    match compile_set(&config, registry) {
        Ok(set) => Arc::new(set),
        Err(err) => {
            eprintln!("Error compiling policy: {}", err);
            process::exit(1);
        }
    }
}

pub fn main() {
    let matches = App::new("aaad")
        .version("1.0")
        .author("Osmium Works")
        .about("Runs the AAA server engine.")
        .arg(
            Arg::with_name("config_dir")
                .short("d")
                .long("config-dir")
                .value_name("DIR")
                .help("Directory holding server.toml, policy.toml and users.toml")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log_dir")
                .short("l")
                .long("log-dir")
                .value_name("DIR")
                .help("Directory where log files are written")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("x")
                .multiple(true)
                .help("Increases log verbosity; repeat for trace output"),
        )
        .arg(
            Arg::with_name("foreground")
                .short("f")
                .long("foreground")
                .help("Stays in the foreground and logs to the terminal"),
        )
        .arg(
            Arg::with_name("single")
                .short("s")
                .long("single-thread")
                .help("Runs with a single worker thread"),
        )
        .arg(
            Arg::with_name("status_log")
                .long("status-log")
                .help("Logs engine status information at startup"),
        )
        .get_matches();

    let config_dir = PathBuf::from(matches.value_of("config_dir").unwrap());
    let foreground = matches.is_present("foreground");
    let single_thread = matches.is_present("single");

    let level = match matches.occurrences_of("verbose") {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let log = if foreground {
        logging::terminal(level)
    } else {
        let log_dir = matches
            .value_of("log_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.clone());
        logging::file(log_dir.join("aaad.log"), level)
    };

    let config = load_config(&config_dir);
    let codec: Arc<dyn Codec> = Arc::new(TlvCodec::new());
    let registry = build_registry(&config, &config_dir, codec.clone());
    let policies = load_policies(&config_dir, &registry);

    if matches.is_present("status_log") {
        logging::info!(log, "engine status";
                       "workers" => config.workers,
                       "listeners" => config.listeners.len(),
                       "clients" => config.clients.len(),
                       "home_servers" => config.home_servers.len(),
                       "max_requests" => config.max_requests);
    }

    let allow_core_dumps = config.allow_core_dumps;

    let engine = match Engine::new(config, policies, single_thread, &log) {
        Ok(engine) => engine,
        Err(err) => {
            logging::crit!(log, "engine startup failed"; "error" => ?err);
            process::exit(1);
        }
    };

    install_signals(engine.signals(), allow_core_dumps);

    logging::info!(log, "server running");

    // Reload re-reads the configuration directory and hands the loop a fresh version; the
    // version counter keeps old and new requests distinguishable while the old drains.
    let reload_log = log.new(logging::o!());
    let reload_dir = config_dir.clone();
    let reload_codec = codec;
    let version_counter = AtomicUsize::new(2);

    let code = engine.run(move || {
        let version = version_counter.fetch_add(1, Ordering::Relaxed) as u64;
        logging::info!(reload_log, "reloading configuration"; "version" => version);

        match EngineConfig::load(reload_dir.join("server.toml")) {
            Ok(config) => {
                // Policy recompilation failures leave the old version in place.
                let registry = build_registry(&config, &reload_dir, reload_codec.clone());
                let policy_config: Result<PolicyConfig, _> =
                    serdeconv::from_toml_file(reload_dir.join("policy.toml"));

                match policy_config.map_err(|_| ()).and_then(|pc| {
                    compile_set(&pc, &registry).map_err(|err| {
                        logging::error!(reload_log, "policy recompile failed"; "error" => %err);
                    })
                }) {
                    Ok(set) => Some(ConfigVersion::with_policies(version, config, Arc::new(set))),
                    Err(_) => None,
                }
            }
            Err(err) => {
                logging::error!(reload_log, "config reload failed"; "error" => ?err);
                None
            }
        }
    });

    process::exit(code);
}
