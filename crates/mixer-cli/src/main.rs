//! Binary entry point: parses CLI args, loads and validates configuration,
//! wires up Store / Merkle accumulator / sink Task Queue / Event Poller /
//! Orchestrator, installs a SIGINT handler, and blocks until shutdown
//! completes. No business logic lives here — every call is a public method
//! on a library crate.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mixer_chain::rpc::HttpRpcClient;
use mixer_chain::EventPoller;
use mixer_indexer::Orchestrator;
use mixer_merkle::MerkleTree;
use mixer_queue::TaskQueue;
use mixer_store::Store;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "mixer-indexer", about = "Event indexer and Merkle-state reconstructor")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "mixer-indexer.toml")]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config) {
        error!(target: "mixer_cli", error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

fn run(config: Config) -> mixer_types::Result<()> {
    let store = Arc::new(Store::new("indexer").with_busy_timeout(config.sqlite_busy_timeout));
    if !store.open(&config.store_path) {
        return Err(mixer_types::MixerError::Io(format!(
            "failed to open store at {}",
            config.store_path.display()
        )));
    }

    let tree = Arc::new(MerkleTree::new(config.tree_height));

    let sink = Arc::new(TaskQueue::new("sink"));
    sink.start();

    let client = Arc::new(HttpRpcClient::new(config.rpc_url.clone(), config.rpc_request_timeout)?);
    let poller_config = mixer_chain::PollerConfig {
        poll_interval: config.poll_interval,
        rpc_retry_interval: config.rpc_retry_interval,
        rpc_query_interval: config.rpc_query_interval,
    };
    let poller = Arc::new(EventPoller::new(client, poller_config, sink.clone()));

    let orchestrator = Orchestrator::new(store, tree, poller, sink);
    orchestrator.rehydrate();

    info!(
        target: "mixer_cli",
        contract = %config.contract_address,
        start_block = config.start_block,
        "starting indexer"
    );
    if !orchestrator.start(&config.contract_address, config.start_block) {
        return Err(mixer_types::MixerError::Other("orchestrator failed to start".into()));
    }

    wait_for_shutdown(orchestrator);
    Ok(())
}

/// Install a SIGINT handler firing shutdown exactly once, then block the
/// main thread until it has run.
fn wait_for_shutdown(orchestrator: Arc<Orchestrator>) {
    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let armed = Arc::new(AtomicBool::new(false));

    let handler_pair = pair.clone();
    let handler_orchestrator = orchestrator.clone();
    let handler_armed = armed.clone();
    let result = ctrlc::set_handler(move || {
        if handler_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "mixer_cli", "SIGINT received, shutting down");
        handler_orchestrator.shutdown();
        let (lock, cvar) = &*handler_pair;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    });
    if let Err(e) = result {
        error!(target: "mixer_cli", error = %e, "failed to install SIGINT handler");
    }

    let (lock, cvar) = &*pair;
    let mut done = lock.lock().unwrap();
    while !*done {
        done = cvar.wait_timeout(done, Duration::from_millis(500)).unwrap().0;
    }
}
