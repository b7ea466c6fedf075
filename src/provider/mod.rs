//! The write-set replication provider contract.
//!
//! The provider is an external component that totally orders write-sets,
//! certifies them against each other, and delivers remote write-sets for
//! in-order application. The node talks to it through the [`Provider`]
//! trait and receives calls back through the [`EventHandler`] trait that it
//! registers at init time. Whoever constructs the node supplies the
//! provider implementation; the built-in [`LocalProvider`] is used when no
//! external provider is configured.

mod local;

pub use local::{LocalProvider, SstReport};

use crate::gtid::{Gtid, Seqno, SEQNO_UNDEFINED};

use itertools::Itertools as _;
use std::sync::Arc;
use uuid::Uuid;

/// Status codes returned by provider operations. The transaction engine is
/// the only component that branches on these; everything else sees the
/// crate's Error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Success.
    Ok,
    /// Minor warning, the error has been logged.
    Warning,
    /// The transaction is not known to the provider.
    TrxMissing,
    /// The transaction aborted (e.g. failed certification); the node can
    /// continue after rolling it back.
    TrxFail,
    /// The transaction was the victim of a brute-force abort and must roll
    /// back immediately to unblock an earlier transaction.
    BfAbort,
    /// The connection to the cluster is in a bad state (e.g. non-primary).
    ConnFail,
    /// The node state is broken; the provider must be reinitialized.
    NodeFail,
    /// Unrecoverable provider error.
    Fatal,
    /// The requested feature is not implemented by this provider.
    NotImplemented,
    /// The operation is not allowed in the current state.
    NotAllowed,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Provider capability bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub const MULTI_MASTER: u32 = 1 << 0;
    pub const CERTIFICATION: u32 = 1 << 1;
    pub const PARALLEL_APPLYING: u32 = 1 << 2;
    pub const REPLAY: u32 = 1 << 3;
    pub const ISOLATION: u32 = 1 << 4;
    pub const PAUSE: u32 = 1 << 5;
    pub const CAUSAL_READS: u32 = 1 << 6;
    pub const CAUSAL_TRX: u32 = 1 << 7;
    pub const INCREMENTAL_WS: u32 = 1 << 8;
    pub const SESSION_LOCKS: u32 = 1 << 9;
    pub const DISTRIBUTED_LOCKS: u32 = 1 << 10;
    pub const CONSISTENCY_CHECK: u32 = 1 << 11;
    pub const UNORDERED: u32 = 1 << 12;
    pub const ANNOTATION: u32 = 1 << 13;
    pub const PREORDERED: u32 = 1 << 14;
    pub const STREAMING: u32 = 1 << 15;
    /// The provider tracks transaction read views and certifies reads, so
    /// the store does not need to verify them at commit time.
    pub const SNAPSHOT: u32 = 1 << 16;
    pub const NBO: u32 = 1 << 17;

    const NAMES: [&'static str; 18] = [
        "MULTI-MASTER",
        "CERTIFICATION",
        "PA",
        "REPLAY",
        "TOI",
        "PAUSE",
        "CAUSAL-READS",
        "CAUSAL-TRX",
        "INCREMENTAL",
        "SESSION-LOCKS",
        "DISTRIBUTED-LOCKS",
        "CONSISTENCY-CHECK",
        "UNORDERED",
        "ANNOTATION",
        "PREORDERED",
        "STREAMING",
        "SNAPSHOT",
        "NBO",
    ];

    pub fn has(&self, cap: u32) -> bool {
        self.0 & cap != 0
    }
}

impl std::fmt::Display for Capabilities {
    /// Formats the set capabilities as "A|B|C", for view logging.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = (0..u32::BITS)
            .filter(|i| self.0 & (1u32 << i) != 0)
            .map(|i| Self::NAMES.get(i as usize).copied().unwrap_or("?"))
            .join("|");
        write!(f, "{names}")
    }
}

/// Write-set flags passed to certify().
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(pub u32);

impl Flags {
    /// First fragment of a transaction.
    pub const TRX_START: u32 = 1 << 0;
    /// Last fragment of a transaction.
    pub const TRX_END: u32 = 1 << 1;
    /// The write-set is a rollback marker; it carries no payload to apply.
    pub const ROLLBACK: u32 = 1 << 2;
    /// The write-set executes in total order isolation.
    pub const ISOLATION: u32 = 1 << 3;

    /// An atomic transaction: both the first and the last fragment.
    pub fn trx() -> Self {
        Flags(Self::TRX_START | Self::TRX_END)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Certification key types, in increasing strength.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyType {
    /// A shared read reference; conflicts only with Exclusive.
    Shared,
    /// A read reference; conflicts with Update and Exclusive writes.
    Reference,
    /// An update of an existing entity.
    Update,
    /// An exclusive write (insert/delete).
    Exclusive,
}

/// Write-set data fragment types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// Applied in total order; the payload of the transaction.
    Ordered,
    /// Delivered best-effort, out of order.
    Unordered,
    /// Free-form annotation, not applied.
    Annotation,
}

/// Write-set metadata assigned by certification: the global transaction id
/// and the seqno of the last write-set this one depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrxMeta {
    pub gtid: Gtid,
    pub depends_on: Seqno,
}

impl Default for TrxMeta {
    fn default() -> Self {
        Self { gtid: Gtid::UNDEFINED, depends_on: SEQNO_UNDEFINED }
    }
}

/// A handle identifying one write-set to the provider. The transaction
/// context itself is owned by whichever worker drives the write-set's
/// lifecycle; the provider only ever sees this id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WsHandle {
    pub trx_id: u64,
}

impl WsHandle {
    pub fn new(trx_id: u64) -> Self {
        Self { trx_id }
    }
}

/// Cluster view status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    /// Primary group configuration (quorum present).
    Primary,
    /// Non-primary group configuration (quorum lost).
    NonPrimary,
    /// Not connected to the group.
    Disconnected,
}

impl std::fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewStatus::Primary => write!(f, "PRIMARY"),
            ViewStatus::NonPrimary => write!(f, "NON-PRIMARY"),
            ViewStatus::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// One cluster member as reported by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: Uuid,
    /// Human-readable node name.
    pub name: String,
    /// Address for incoming client connections, if any.
    pub incoming: String,
}

/// A view on the cluster, delivered by the provider in total order.
#[derive(Clone, Debug)]
pub struct View {
    /// The global state id as of this view.
    pub state_id: Gtid,
    pub status: ViewStatus,
    pub capabilities: Capabilities,
    /// Write-set protocol version negotiated for this view.
    pub proto_ver: i32,
    /// Members in provider order. The order is part of the replicated state.
    pub members: Vec<Member>,
    /// This node's index in members, or -1 if not a member.
    pub my_index: i32,
}

impl Default for View {
    fn default() -> Self {
        Self {
            state_id: Gtid::UNDEFINED,
            status: ViewStatus::Disconnected,
            capabilities: Capabilities::default(),
            proto_ver: -1,
            members: Vec::new(),
            my_index: -1,
        }
    }
}

/// Per-worker context threaded through recv() into the apply callback.
pub struct RecvCtx {
    pub worker_id: usize,
    /// Set by the apply callback to ask this worker to exit its recv loop.
    pub exit: bool,
}

impl RecvCtx {
    pub fn new(worker_id: usize) -> Self {
        Self { worker_id, exit: false }
    }
}

/// A provider statistics counter.
#[derive(Clone, Debug)]
pub struct StatsVar {
    pub name: String,
    pub value: i64,
}

/// Node callbacks invoked by the provider. The view and apply callbacks are
/// called in total order; connected and synced are out of order. Callbacks
/// return false to signal failure, which puts the provider in a bad state.
pub trait EventHandler: Send + Sync {
    /// The node has connected to the group. Out of order, informational;
    /// view.state_id is the group state at the time of joining.
    fn connected(&self, view: &View) -> bool;

    /// A new cluster view, in total order: all preceding replication events
    /// are processed strictly before this call and all subsequent strictly
    /// after.
    fn view(&self, view: &View) -> bool;

    /// The node has caught up with the cluster and may originate
    /// transactions.
    fn synced(&self) -> bool;

    /// Apply one totally ordered write-set. `ws` is None if the write-set
    /// carries nothing to apply (it failed certification or was a rollback
    /// fragment) but its seqno must still be consumed.
    fn apply(
        &self,
        ctx: &mut RecvCtx,
        handle: &WsHandle,
        flags: Flags,
        ws: Option<&[u8]>,
        meta: &TrxMeta,
    ) -> bool;

    /// Produce a state transfer request for the provider to forward to the
    /// donor, or None on failure. By the time this returns, the node must be
    /// prepared to receive the transfer.
    fn sst_request(&self) -> Option<Vec<u8>>;

    /// Donate a state snapshot to the joiner that sent `request`. If
    /// `bypass`, no snapshot is transferred and the joiner catches up from
    /// ordered write-set replay. Must report completion via
    /// Provider::sst_sent exactly once.
    fn sst_donate(&self, request: &[u8], state_id: &Gtid, bypass: bool) -> bool;

    /// Provider log messages, forwarded to the process logger.
    fn log(&self, level: log::Level, msg: &str) {
        log::log!(level, "[provider] {msg}");
    }
}

/// Arguments for Provider::init.
pub struct InitArgs {
    pub node_name: String,
    /// The address other members connect to (base host:port).
    pub node_address: String,
    /// Directory for provider state files.
    pub data_dir: String,
    /// Provider-specific configuration string.
    pub options: String,
    /// Write-set protocol version spoken by the application.
    pub proto_ver: i32,
    /// The node's current position, from the store.
    pub state_id: Gtid,
    pub handler: Arc<dyn EventHandler>,
}

/// The provider operations the node invokes. All of these may block for
/// unbounded time; nothing in the node calls them while holding the store
/// lock.
pub trait Provider: Send + Sync {
    /// Initializes the provider with the node's callbacks and current state.
    fn init(&self, args: InitArgs) -> Status;

    /// The provider's capability bitmask.
    fn capabilities(&self) -> Capabilities;

    /// Connects to the cluster at `address`, optionally bootstrapping a new
    /// primary component.
    fn connect(&self, cluster_name: &str, address: &str, bootstrap: bool) -> Status;

    /// Disconnects from the cluster. Unblocks any workers waiting in recv().
    fn disconnect(&self) -> Status;

    /// Runs the receive loop on the calling thread, dispatching apply and
    /// other total-order callbacks. Returns when the node disconnects or
    /// the callback requests exit.
    fn recv(&self, ctx: &mut RecvCtx) -> Status;

    /// Tells certification the GTID at which this write-set read its
    /// inputs. Only meaningful with the SNAPSHOT capability.
    fn assign_read_view(&self, handle: &WsHandle, gtid: &Gtid) -> Status;

    /// Appends a certification key to the write-set.
    fn append_key(&self, handle: &WsHandle, key: &[&[u8]], key_type: KeyType) -> Status;

    /// Appends a data fragment to the write-set.
    fn append_data(&self, handle: &WsHandle, data: &[u8], data_type: DataType) -> Status;

    /// Replicates and certifies the write-set, filling in `meta`. A
    /// non-success status with meta.gtid.seqno > 0 means the write-set was
    /// totally ordered anyway and its seqno must be consumed.
    fn certify(&self, conn_id: u64, handle: &WsHandle, flags: Flags, meta: &mut TrxMeta)
        -> Status;

    /// Enters the commit-order critical section for this write-set. Blocks
    /// until all preceding write-sets have left it.
    fn commit_order_enter(&self, handle: &WsHandle, meta: &TrxMeta) -> Status;

    /// Leaves the commit-order critical section, optionally reporting an
    /// apply error to be voted on by the cluster.
    fn commit_order_leave(&self, handle: &WsHandle, meta: &TrxMeta, error: Option<&[u8]>)
        -> Status;

    /// Releases provider resources associated with the write-set. Must be
    /// called exactly once per certified write-set.
    fn release(&self, handle: &WsHandle) -> Status;

    /// Signals that the donor finished sending a state snapshot. `rc` is 0
    /// on success or a negative error code.
    fn sst_sent(&self, state_id: &Gtid, rc: i32) -> Status;

    /// Signals that the joiner received and installed a state snapshot.
    /// `rc` is 0 on success or a negative error code.
    fn sst_received(&self, state_id: &Gtid, rc: i32) -> Status;

    /// Returns the provider's statistics counters.
    fn stats(&self) -> Vec<StatsVar>;

    /// Frees the provider. No other operation may be called afterwards.
    fn free(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_display() {
        let caps =
            Capabilities(Capabilities::MULTI_MASTER | Capabilities::CERTIFICATION | Capabilities::SNAPSHOT);
        assert_eq!(caps.to_string(), "MULTI-MASTER|CERTIFICATION|SNAPSHOT");
        assert!(caps.has(Capabilities::SNAPSHOT));
        assert!(!caps.has(Capabilities::STREAMING));
    }

    #[test]
    fn flags() {
        let flags = Flags::trx();
        assert!(flags.has(Flags::TRX_START));
        assert!(flags.has(Flags::TRX_END));
        assert!(!flags.has(Flags::ROLLBACK));
    }
}
