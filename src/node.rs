//! Node lifecycle orchestration: opens the store, initializes and connects
//! the provider, runs the worker pools and the statistics loop, and shuts
//! everything down in dependency order.

use crate::errdata;
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::repl::Cluster;
use crate::stats;
use crate::store::{self, Store};
use crate::worker::{Context, Pool, Role};

use crossbeam::channel::Receiver;
use log::info;
use std::sync::Arc;
use std::time::Duration;

/// The group name this node joins.
const CLUSTER_NAME: &str = "repnode";

/// Node configuration. See the CLI for the flag-by-flag documentation.
#[derive(Clone, Debug)]
pub struct Options {
    pub address: String,
    pub options: String,
    pub name: String,
    pub data_dir: String,
    pub base_host: String,
    pub base_port: u16,
    pub masters: usize,
    pub slaves: usize,
    pub ws_size: usize,
    pub records: u32,
    pub operations: usize,
    pub delay: Duration,
    pub period: Duration,
    pub bootstrap: bool,
}

pub struct Node {
    options: Options,
    store: Arc<Store>,
    cluster: Arc<Cluster>,
}

impl Node {
    /// Creates a node: opens the store and initializes the provider with
    /// the node's callbacks and its current position.
    pub fn new(options: Options, provider: Arc<dyn Provider>) -> Result<Node> {
        let store = Arc::new(Store::open(&store::Options {
            records: options.records,
            ws_size: options.ws_size,
            operations: options.operations,
        })?);
        let cluster = Cluster::init(
            provider,
            store.clone(),
            &options.name,
            &options.base_host,
            options.base_port,
            &options.data_dir,
            &options.options,
        )?;
        Ok(Node { options, store, cluster })
    }

    /// The node's store, for inspection.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Runs the node until the shutdown channel is signaled or closed,
    /// then shuts down: disconnect from the cluster (which releases the
    /// workers), join master and slave pools, free the provider, and close
    /// the store last.
    pub fn run(self, shutdown: Receiver<()>) -> Result<()> {
        self.cluster.connect(CLUSTER_NAME, &self.options.address, self.options.bootstrap)?;

        let ctx = Arc::new(Context {
            store: self.store.clone(),
            cluster: self.cluster.clone(),
            operations: self.options.operations,
            delay: self.options.delay,
        });

        // Slave workers must be receiving before the node can sync.
        let slaves = Pool::start(ctx.clone(), Role::Slave, self.options.slaves);
        if slaves.size() == 0 {
            return errdata!("failed to start any slave workers");
        }

        if !self.cluster.wait_synced() {
            return Err(Error::Disconnected);
        }
        info!("synced with cluster");

        // The node may now originate transactions.
        let masters = Pool::start(ctx, Role::Master, self.options.masters);
        if masters.size() < self.options.masters {
            return errdata!(
                "only {} of {} master workers started",
                masters.size(),
                self.options.masters
            );
        }

        stats::run(self.cluster.provider().as_ref(), &self.store, self.options.period, &shutdown);

        info!("shutting down");
        self.cluster.disconnect();
        masters.stop();
        slaves.stop();
        self.cluster.close();
        Ok(())
    }
}
