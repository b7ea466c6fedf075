//! The provider adapter: owns the provider handle, the node's cached view
//! of the cluster, and the SYNCED latch, and dispatches the provider's
//! callbacks into the store, the transaction engine, and the SST subsystem.
//!
//! Everything here is an explicit context threaded through the callbacks;
//! the provider's handler registration is the single anchor. The view cache
//! and the SYNCED latch each have their own lock, and neither is ever taken
//! while holding the store lock.

use crate::errdata;
use crate::error::Result;
use crate::gtid::Gtid;
use crate::provider::{
    EventHandler, Flags, InitArgs, Provider, RecvCtx, Status, TrxMeta, View, ViewStatus, WsHandle,
};
use crate::sst;
use crate::store::Store;
use crate::txn;

use itertools::Itertools as _;
use log::{error, info};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// The node's connection to the cluster through the replication provider.
pub struct Cluster {
    provider: Arc<dyn Provider>,
    /// The last view delivered by the provider. The connected callback also
    /// records the group state id here, out of order, before any view.
    view: Mutex<View>,
    synced: Synced,
}

impl Cluster {
    /// Initializes the provider with the node's callbacks and its current
    /// position, and returns the adapter. The node is not yet connected.
    pub fn init(
        provider: Arc<dyn Provider>,
        store: Arc<Store>,
        name: &str,
        base_host: &str,
        base_port: u16,
        data_dir: &str,
        options: &str,
    ) -> Result<Arc<Cluster>> {
        let cluster = Arc::new(Cluster {
            provider: provider.clone(),
            view: Mutex::new(View::default()),
            synced: Synced::new(),
        });
        let handler = Arc::new(Handler {
            store,
            cluster: Arc::downgrade(&cluster),
            sst_host: base_host.to_string(),
            sst_port: base_port + 2,
        });
        let state_id = handler.store.gtid();
        info!("initializing provider at {state_id}");
        let status = provider.init(InitArgs {
            node_name: name.into(),
            node_address: format!("{base_host}:{base_port}"),
            data_dir: data_dir.into(),
            options: options.into(),
            proto_ver: 1,
            state_id,
            handler,
        });
        if status != Status::Ok {
            return errdata!("provider initialization failed: {status}");
        }
        Ok(cluster)
    }

    /// Connects to the cluster, optionally bootstrapping a new primary
    /// component. Replication events start arriving once workers call
    /// recv().
    pub fn connect(&self, cluster_name: &str, address: &str, bootstrap: bool) -> Result<()> {
        let status = self.provider.connect(cluster_name, address, bootstrap);
        if status != Status::Ok {
            return errdata!("connect to {address} failed: {status}");
        }
        Ok(())
    }

    /// Disconnects from the cluster. Flipping the SYNCED latch to -1
    /// releases master workers from their wait; the provider's disconnect
    /// additionally unblocks slave workers from recv().
    pub fn disconnect(&self) {
        self.synced.set(-1);
        let status = self.provider.disconnect();
        if status != Status::Ok {
            // Slave workers would never return from recv().
            panic!("failed to close provider connection: {status}");
        }
    }

    /// Blocks until the node is SYNCED (true) or disconnected (false).
    pub fn wait_synced(&self) -> bool {
        self.synced.wait()
    }

    /// The group state id as last reported by the provider.
    pub fn state_id(&self) -> Gtid {
        self.view.lock().expect("view lock poisoned").state_id
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Frees the provider. Callers must have disconnected and stopped all
    /// workers first.
    pub fn close(&self) {
        self.provider.free();
    }
}

/// The SYNCED latch: 0 = not yet synced, 1 = synced, -1 = disconnected.
struct Synced {
    state: Mutex<i32>,
    cond: Condvar,
}

impl Synced {
    fn new() -> Self {
        Self { state: Mutex::new(0), cond: Condvar::new() }
    }

    fn wait(&self) -> bool {
        let mut state = self.state.lock().expect("synced lock poisoned");
        while *state == 0 {
            state = self.cond.wait(state).expect("synced lock poisoned");
        }
        *state > 0
    }

    fn set(&self, value: i32) {
        *self.state.lock().expect("synced lock poisoned") = value;
        self.cond.notify_all();
    }

    /// Latches 0 -> 1. Synced events after a disconnect are ignored.
    fn synced(&self) {
        let mut state = self.state.lock().expect("synced lock poisoned");
        if *state == 0 {
            info!("became SYNCED");
            *state = 1;
            self.cond.notify_all();
        }
    }
}

/// The callback receiver registered with the provider. Holds the cluster
/// adapter weakly: if the node is shutting down and the adapter is gone,
/// callbacks report failure instead of dereferencing a dead context.
struct Handler {
    store: Arc<Store>,
    cluster: Weak<Cluster>,
    sst_host: String,
    sst_port: u16,
}

impl EventHandler for Handler {
    fn connected(&self, view: &View) -> bool {
        info!(
            "connected at {} to {} group of {} member(s)",
            view.state_id,
            view.status,
            view.members.len()
        );
        let Some(cluster) = self.cluster.upgrade() else { return false };
        cluster.view.lock().expect("view lock poisoned").state_id = view.state_id;
        true
    }

    fn view(&self, view: &View) -> bool {
        if view.status == ViewStatus::Primary {
            // Membership is part of the replicated state; this call is in
            // total order and advances the store GTID.
            self.store.update_membership(view);
        }
        let Some(cluster) = self.cluster.upgrade() else { return false };
        *cluster.view.lock().expect("view lock poisoned") = view.clone();
        log_view(view);
        true
    }

    fn synced(&self) -> bool {
        let Some(cluster) = self.cluster.upgrade() else { return false };
        cluster.synced.synced();
        true
    }

    fn apply(
        &self,
        _ctx: &mut RecvCtx,
        handle: &WsHandle,
        flags: Flags,
        ws: Option<&[u8]>,
        meta: &TrxMeta,
    ) -> bool {
        let Some(cluster) = self.cluster.upgrade() else { return false };
        // Rollback fragments carry a payload that must not be applied, but
        // their seqno is still consumed.
        let ws = if flags.has(Flags::ROLLBACK) { None } else { ws };
        match txn::apply(&self.store, cluster.provider.as_ref(), handle, ws, meta) {
            Ok(()) => true,
            Err(err) => {
                error!("failed to apply write-set {}: {err}", meta.gtid);
                false
            }
        }
    }

    fn sst_request(&self) -> Option<Vec<u8>> {
        let cluster = self.cluster.upgrade()?;
        match sst::request(
            self.store.clone(),
            cluster.provider.clone(),
            &self.sst_host,
            self.sst_port,
        ) {
            Ok(request) => Some(request),
            Err(err) => {
                error!("failed to prepare state transfer request: {err}");
                None
            }
        }
    }

    fn sst_donate(&self, request: &[u8], state_id: &Gtid, bypass: bool) -> bool {
        let Some(cluster) = self.cluster.upgrade() else { return false };
        match sst::donate(self.store.clone(), cluster.provider.clone(), request, *state_id, bypass)
        {
            Ok(()) => true,
            Err(err) => {
                error!("failed to donate state transfer: {err}");
                false
            }
        }
    }
}

/// Logs a freshly delivered view in full.
fn log_view(view: &View) {
    let members = view
        .members
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let marker = if view.my_index == i as i32 { " * " } else { "   " };
            format!("{marker}{i}: {} '{}' incoming:'{}'", m.id, m.name, m.incoming)
        })
        .join("\n");
    info!(
        "new view received:\nstate: {} ({})\ncapabilities: {}\nprotocol version: {}\nmembers({}):\n{members}",
        view.state_id,
        view.status,
        view.capabilities,
        view.proto_ver,
        view.members.len(),
    );
}
