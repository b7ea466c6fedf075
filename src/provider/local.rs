//! The built-in replication provider, used when no provider library is
//! configured (the "none" sentinel). It forms a single-node primary
//! component: write-sets are totally ordered by a local counter,
//! certification always succeeds, and commit order is enforced with a
//! seqno-gated monitor, so a node running it exercises the same
//! write-set lifecycle as a clustered one.
//!
//! The provider doubles as the crate's replication test harness: tests can
//! queue certification verdicts for upcoming write-sets and inject remote
//! write-sets into the receive queue, which drives the slave path,
//! certification failures, and brute-force aborts without a cluster.

use crate::gtid::{Gtid, Seqno};
use crate::provider::{
    Capabilities, DataType, EventHandler, Flags, InitArgs, KeyType, Member, Provider, RecvCtx,
    StatsVar, Status, TrxMeta, View, ViewStatus, WsHandle,
};

use crossbeam::channel::{Receiver, Sender};
use log::{error, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use uuid::Uuid;

/// A totally ordered replication event queued for recv().
struct Event {
    handle: WsHandle,
    flags: Flags,
    ws: Option<Vec<u8>>,
    meta: TrxMeta,
}

/// A test-queued certification verdict. `ordered` controls whether the
/// write-set is assigned a seqno despite the failure, in which case its
/// seqno must still be consumed by the node.
struct Verdict {
    status: Status,
    ordered: bool,
}

/// An SST completion report, recorded for test inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SstReport {
    pub state_id: Gtid,
    pub rc: i32,
    /// True for sst_sent (donor), false for sst_received (joiner).
    pub sent: bool,
}

struct State {
    handler: Option<Arc<dyn EventHandler>>,
    node_name: String,
    /// This node's member id, generated at init.
    member_id: Uuid,
    /// The group position: the last assigned seqno in the current epoch.
    gtid: Gtid,
    /// The last seqno to have left commit order.
    committed: Seqno,
    connected: bool,
    events_tx: Option<Sender<Event>>,
    events_rx: Option<Receiver<Event>>,
    verdicts: VecDeque<Verdict>,
    /// Bytes appended per in-flight write-set, moved to the replicated
    /// counters at certification.
    pending: HashMap<u64, i64>,
    /// Handle ids for injected remote write-sets, counting down to avoid
    /// colliding with the node's own ids.
    next_remote_id: u64,
    sst_reports: Vec<SstReport>,
    replicated: i64,
    replicated_bytes: i64,
    received: i64,
    received_bytes: i64,
    cert_failures: i64,
}

pub struct LocalProvider {
    state: Mutex<State>,
    /// Signaled whenever a write-set leaves commit order or the provider
    /// disconnects.
    order: Condvar,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                handler: None,
                node_name: String::new(),
                member_id: Uuid::nil(),
                gtid: Gtid::UNDEFINED,
                committed: 0,
                connected: false,
                events_tx: None,
                events_rx: None,
                verdicts: VecDeque::new(),
                pending: HashMap::new(),
                next_remote_id: u64::MAX,
                sst_reports: Vec::new(),
                replicated: 0,
                replicated_bytes: 0,
                received: 0,
                received_bytes: 0,
                cert_failures: 0,
            }),
            order: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("provider lock poisoned")
    }

    /// Queues the certification verdict for the next certify() call. The
    /// default verdict, when none is queued, is success.
    pub fn queue_verdict(&self, status: Status, ordered: bool) {
        self.lock().verdicts.push_back(Verdict { status, ordered });
    }

    /// Totally orders a remote write-set and queues it for apply on a recv
    /// worker. Returns the GTID it was ordered at.
    pub fn inject(&self, ws: Vec<u8>) -> Gtid {
        self.inject_event(Flags::trx(), Some(ws))
    }

    /// Totally orders a rollback fragment: the write-set consumed a seqno
    /// but carries nothing to apply.
    pub fn inject_rollback(&self) -> Gtid {
        self.inject_event(Flags(Flags::TRX_START | Flags::TRX_END | Flags::ROLLBACK), None)
    }

    fn inject_event(&self, flags: Flags, ws: Option<Vec<u8>>) -> Gtid {
        let mut state = self.lock();
        assert!(state.connected, "injecting into a disconnected provider");
        state.gtid.seqno += 1;
        let meta = TrxMeta { gtid: state.gtid, depends_on: state.gtid.seqno - 1 };
        let handle = WsHandle::new(state.next_remote_id);
        state.next_remote_id -= 1;
        let tx = state.events_tx.clone().expect("connected without event queue");
        tx.send(Event { handle, flags, ws, meta }).expect("recv queue closed");
        meta.gtid
    }

    /// The SST completions reported so far, for test inspection.
    pub fn sst_reports(&self) -> Vec<SstReport> {
        self.lock().sst_reports.clone()
    }

    /// The view of this single-node group at the given state.
    fn view(&self, state: &State) -> View {
        View {
            state_id: state.gtid,
            status: ViewStatus::Primary,
            capabilities: self.capabilities(),
            proto_ver: 1,
            members: vec![Member {
                id: state.member_id,
                name: state.node_name.clone(),
                incoming: String::new(),
            }],
            my_index: 0,
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for LocalProvider {
    fn init(&self, args: InitArgs) -> Status {
        let mut state = self.lock();
        if state.handler.is_some() {
            return Status::NotAllowed;
        }
        state.handler = Some(args.handler);
        state.node_name = args.node_name;
        state.member_id = Uuid::new_v4();
        state.gtid = args.state_id;
        state.committed = args.state_id.seqno;
        Status::Ok
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities(Capabilities::MULTI_MASTER | Capabilities::CERTIFICATION)
    }

    fn connect(&self, cluster_name: &str, _address: &str, bootstrap: bool) -> Status {
        let (handler, connected_view, view) = {
            let mut state = self.lock();
            let Some(handler) = state.handler.clone() else { return Status::NodeFail };
            if state.connected {
                return Status::NotAllowed;
            }
            if state.gtid.uuid.is_nil() {
                // A fresh epoch. Without a cluster to join, the node always
                // forms its own primary component, bootstrapped or not.
                state.gtid.uuid = Uuid::new_v4();
                if !bootstrap {
                    info!("no cluster to join, forming primary component alone");
                }
            }
            let connected_view = self.view(&state);

            // The membership change is a totally ordered event and consumes
            // a seqno. It never passes through commit order, so mark it
            // committed here.
            state.gtid.seqno += 1;
            state.committed = state.gtid.seqno;
            let view = self.view(&state);

            let (tx, rx) = crossbeam::channel::unbounded();
            state.events_tx = Some(tx);
            state.events_rx = Some(rx);
            state.connected = true;
            (handler, connected_view, view)
        };

        // Callbacks run without the provider lock, as they re-enter the
        // node (store, view cache, SYNCED latch).
        info!("connecting to group {cluster_name} at {}", view.state_id);
        handler.connected(&connected_view);
        handler.view(&view);
        handler.synced();
        Status::Ok
    }

    fn disconnect(&self) -> Status {
        let mut state = self.lock();
        if !state.connected {
            return Status::NotAllowed;
        }
        state.connected = false;
        // Dropping the sender drains the recv loops; waking the monitor
        // releases any write-set waiting on commit order.
        state.events_tx = None;
        state.events_rx = None;
        self.order.notify_all();
        Status::Ok
    }

    fn recv(&self, ctx: &mut RecvCtx) -> Status {
        let (handler, rx) = {
            let state = self.lock();
            let Some(handler) = state.handler.clone() else { return Status::NodeFail };
            let Some(rx) = state.events_rx.clone() else { return Status::ConnFail };
            (handler, rx)
        };

        // Block for replication events until disconnect closes the queue.
        while let Ok(event) = rx.recv() {
            {
                let mut state = self.lock();
                state.received += 1;
                state.received_bytes += event.ws.as_ref().map_or(0, |ws| ws.len() as i64);
            }
            if !handler.apply(ctx, &event.handle, event.flags, event.ws.as_deref(), &event.meta) {
                error!("apply callback failed for write-set {}", event.meta.gtid);
                return Status::NodeFail;
            }
            if ctx.exit {
                return Status::Ok;
            }
        }
        Status::Ok
    }

    fn assign_read_view(&self, _handle: &WsHandle, _gtid: &Gtid) -> Status {
        // This provider does not certify read views (no SNAPSHOT
        // capability); the store verifies them at commit time instead.
        Status::NotImplemented
    }

    fn append_key(&self, _handle: &WsHandle, _key: &[&[u8]], _key_type: KeyType) -> Status {
        if !self.lock().connected {
            return Status::ConnFail;
        }
        Status::Ok
    }

    fn append_data(&self, handle: &WsHandle, data: &[u8], _data_type: DataType) -> Status {
        let mut state = self.lock();
        if !state.connected {
            return Status::ConnFail;
        }
        *state.pending.entry(handle.trx_id).or_insert(0) += data.len() as i64;
        Status::Ok
    }

    fn certify(
        &self,
        _conn_id: u64,
        handle: &WsHandle,
        _flags: Flags,
        meta: &mut TrxMeta,
    ) -> Status {
        let mut state = self.lock();
        if !state.connected {
            return Status::ConnFail;
        }
        let bytes = state.pending.remove(&handle.trx_id).unwrap_or(0);
        let verdict =
            state.verdicts.pop_front().unwrap_or(Verdict { status: Status::Ok, ordered: true });

        if verdict.ordered {
            state.gtid.seqno += 1;
            meta.gtid = state.gtid;
            meta.depends_on = state.gtid.seqno - 1;
        } else {
            *meta = TrxMeta::default();
        }

        match verdict.status {
            Status::Ok => {
                state.replicated += 1;
                state.replicated_bytes += bytes;
                Status::Ok
            }
            status => {
                state.cert_failures += 1;
                status
            }
        }
    }

    fn commit_order_enter(&self, _handle: &WsHandle, meta: &TrxMeta) -> Status {
        let mut state = self.lock();
        while state.connected && state.committed != meta.gtid.seqno - 1 {
            state = self.order.wait(state).expect("provider lock poisoned");
        }
        if !state.connected {
            return Status::ConnFail;
        }
        Status::Ok
    }

    fn commit_order_leave(
        &self,
        _handle: &WsHandle,
        meta: &TrxMeta,
        error: Option<&[u8]>,
    ) -> Status {
        let mut state = self.lock();
        assert_eq!(
            state.committed,
            meta.gtid.seqno - 1,
            "commit order leave out of order at {}",
            meta.gtid
        );
        state.committed = meta.gtid.seqno;
        if let Some(error) = error {
            error!(
                "write-set {} voted as failed: {}",
                meta.gtid,
                String::from_utf8_lossy(error)
            );
        }
        self.order.notify_all();
        Status::Ok
    }

    fn release(&self, handle: &WsHandle) -> Status {
        self.lock().pending.remove(&handle.trx_id);
        Status::Ok
    }

    fn sst_sent(&self, state_id: &Gtid, rc: i32) -> Status {
        self.lock().sst_reports.push(SstReport { state_id: *state_id, rc, sent: true });
        Status::Ok
    }

    fn sst_received(&self, state_id: &Gtid, rc: i32) -> Status {
        self.lock().sst_reports.push(SstReport { state_id: *state_id, rc, sent: false });
        Status::Ok
    }

    fn stats(&self) -> Vec<StatsVar> {
        let state = self.lock();
        [
            ("replicated", state.replicated),
            ("replicated_bytes", state.replicated_bytes),
            ("received", state.received),
            ("received_bytes", state.received_bytes),
            ("local_cert_failures", state.cert_failures),
            ("flow_control_paused_ns", 0),
        ]
        .into_iter()
        .map(|(name, value)| StatsVar { name: name.into(), value })
        .collect()
    }

    fn free(&self) {
        let mut state = self.lock();
        assert!(!state.connected, "freeing a connected provider");
        state.handler = None;
    }
}
