//! repnode is a reference node for a synchronously replicated multi-master
//! cluster. It keeps a small in-memory store of fixed-size records,
//! replicates every local mutation as a certified write-set through a
//! replication provider, applies remote write-sets in total order, and
//! transfers state snapshots to joining nodes.

#![warn(clippy::all)]

use repnode::error::Result;
use repnode::provider::{LocalProvider, Provider};
use repnode::{errinput, Node};

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let command = Command::parse();

    // An invariant violation on any worker thread must take the whole node
    // down, not just the thread.
    let panic_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        panic_hook(info);
        std::process::abort();
    }));

    if let Err(error) = run(command) {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run(command: Command) -> Result<()> {
    let loglevel = command.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("repnode");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let provider: Arc<dyn Provider> = match command.provider.as_str() {
        "none" => Arc::new(LocalProvider::new()),
        path => {
            // Provider libraries are linked in, not loaded dynamically.
            return errinput!("unknown provider {path}, only \"none\" is built in");
        }
    };

    let options = command.options();
    log::info!(
        "continuing with the following configuration:\n\
         provider:      {}\n\
         address:       {}\n\
         options:       {}\n\
         name:          {}\n\
         data dir:      {}\n\
         base addr:     {}:{}\n\
         masters:       {}\n\
         slaves:        {}\n\
         writeset size: {} bytes\n\
         records:       {}\n\
         operations:    {}\n\
         commit delay:  {} ms\n\
         stats period:  {} s\n\
         bootstrap:     {}",
        command.provider,
        options.address,
        options.options,
        options.name,
        options.data_dir,
        options.base_host,
        options.base_port,
        options.masters,
        options.slaves,
        options.ws_size,
        options.records,
        options.operations,
        options.delay.as_millis(),
        options.period.as_secs(),
        if options.bootstrap { "yes" } else { "no" },
    );

    // Shut down in order on SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("got signal {signal}, terminating");
            shutdown_tx.send(()).ok();
        }
    });

    Node::new(options, provider)?.run(shutdown_rx)
}

/// Handles command-line parsing.
#[derive(clap::Parser)]
#[command(about = "A replicated multi-master cluster node.", version)]
struct Command {
    /// Path to the provider library, or "none" for the built-in single-node
    /// provider.
    #[arg(short = 'v', long, default_value = "none")]
    provider: String,

    /// Group address to join. If not set, the node assumes it is the first
    /// node of a new cluster.
    #[arg(short, long, default_value = "")]
    address: String,

    /// Provider-specific configuration string.
    #[arg(short, long, default_value = "")]
    options: String,

    /// Human-readable node name.
    #[arg(short, long, default_value = "unnamed")]
    name: String,

    /// Directory for provider working data. Should be private to the node.
    #[arg(short = 'f', long, default_value = ".")]
    data_dir: String,

    /// Address at which other members can connect to this node.
    #[arg(short = 't', long, default_value = "localhost")]
    base_host: String,

    /// Base port to listen on: used for replication, port+2 for state
    /// snapshot transfer.
    #[arg(short = 'p', long, default_value = "4567")]
    base_port: u16,

    /// Number of concurrent master workers.
    #[arg(short, long, default_value = "0")]
    masters: usize,

    /// Number of concurrent slave workers (at least 1).
    #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..))]
    slaves: u64,

    /// Desired write-set size in bytes (lower bound).
    #[arg(short = 'w', long = "size", default_value = "1024")]
    ws_size: usize,

    /// Number of records in the store.
    #[arg(short, long, default_value = "1048576")]
    records: u32,

    /// Operations per transaction.
    #[arg(long, default_value = "1")]
    ops: usize,

    /// Delay in milliseconds between commits, per master worker.
    #[arg(short, long, default_value = "0")]
    delay: u64,

    /// Period in seconds between statistics output.
    #[arg(short = 'i', long, default_value = "10", value_parser = clap::value_parser!(u64).range(1..))]
    period: u64,

    /// Bootstrap the cluster with this node. Defaults to yes if no group
    /// address is given, no otherwise.
    #[arg(short, long)]
    bootstrap: bool,

    /// Log level: error, warn, info, debug, or trace.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Command {
    fn options(&self) -> repnode::node::Options {
        repnode::node::Options {
            address: self.address.clone(),
            options: self.options.clone(),
            name: self.name.clone(),
            data_dir: self.data_dir.clone(),
            base_host: self.base_host.clone(),
            base_port: self.base_port,
            masters: self.masters,
            slaves: self.slaves as usize,
            ws_size: self.ws_size,
            records: self.records,
            operations: self.ops,
            delay: Duration::from_millis(self.delay),
            period: Duration::from_secs(self.period),
            bootstrap: self.bootstrap || self.address.is_empty(),
        }
    }
}
