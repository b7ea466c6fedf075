//! The transactional store: a versioned record array, the cluster
//! membership, and the node's GTID, all replicated state under one mutex.
//!
//! The store is the single mutation point for the node. Both master and
//! slave workers mutate it, strictly ordered by the provider-assigned GTID:
//! every commit or GTID update advances the seqno by exactly 1, and any gap,
//! reordering, or epoch mismatch is fatal. Membership changes are part of
//! the replicated state and advance the GTID like any other ordered event.
//!
//! While any number of transactions may be in flight, individual store
//! operations are serialized via the mutex and kept short: nothing that can
//! block on IO or on the provider runs under the lock. Transactions use
//! optimistic read views instead of record locks: a transaction captures the
//! GTID at its first operation, and the store (or the provider, if it
//! advertises snapshot certification) rejects the transaction at commit time
//! if its reads no longer hold.

use crate::encoding;
use crate::errdata;
use crate::error::{Error, Result};
use crate::gtid::{Gtid, Seqno, SEQNO_UNDEFINED};
use crate::provider::{Capabilities, View, ViewStatus};

use log::info;
use rand::Rng as _;
use serde_derive::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct Options {
    /// Number of records in the store.
    pub records: u32,
    /// Desired write-set size in bytes (lower bound, split across
    /// operations as padding).
    pub ws_size: usize,
    /// Operations per transaction.
    pub operations: usize,
}

/// A single store record. Records are addressed by their dense index in
/// [0, N); the index is the record's identity and is what certification
/// keys refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The seqno of the transaction that last committed this record, or
    /// SEQNO_UNDEFINED if it has never been written.
    pub version: Seqno,
    pub value: u32,
}

/// The serialized size of a record in the state snapshot: u64 version plus
/// u32 value, fixed layout, no padding.
const RECORD_WIRE_SIZE: usize = 12;

/// One operation of a transaction: copy the source record's value,
/// incremented by 1, into the destination record. The records observed at
/// execute time are carried along so the reads can be verified at commit
/// time, and the padding brings the serialized operation up to the
/// configured nominal size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub src: u32,
    pub dst: u32,
    /// The source record as observed at execute time.
    pub rec_src: Record,
    /// The destination record as observed at execute time.
    pub rec_dst: Record,
    /// The value to write to the destination.
    pub new_value: u32,
    #[serde(with = "serde_bytes")]
    pub pad: Vec<u8>,
}

/// A transaction context: the read-view GTID captured when the first
/// operation executed, and the ordered operations. Owned exclusively by
/// the worker driving the write-set lifecycle, and released by passing it
/// to commit() or rollback().
#[derive(Debug)]
pub struct Trx {
    read_view: Gtid,
    ops: Vec<Operation>,
}

impl Default for Trx {
    fn default() -> Self {
        Self::new()
    }
}

impl Trx {
    /// Creates an empty transaction context. The read view is captured by
    /// the first execute() call.
    pub fn new() -> Self {
        Self { read_view: Gtid::UNDEFINED, ops: Vec::new() }
    }

    /// The GTID at which this transaction read its inputs.
    pub fn read_view(&self) -> Gtid {
        self.read_view
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The store state, under the store mutex.
struct Inner {
    gtid: Gtid,
    members: Vec<Uuid>,
    records: Vec<Record>,
    /// The acquired state snapshot, pinned until release_state().
    snapshot: Option<Arc<Vec<u8>>>,
    /// Whether the provider certifies read views (SNAPSHOT capability), in
    /// which case the store skips commit-time verification.
    read_view_support: bool,
    /// Transactions rejected because their reads no longer held.
    read_view_failures: u64,
    /// Padding bytes per operation, to reach the nominal operation size.
    pad_len: usize,
}

pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    /// Opens a store with `records` records, each initialized to its own
    /// index with an undefined version. The per-operation nominal size is
    /// ws_size split evenly across the configured operation count, never
    /// below the size of an unpadded operation.
    pub fn open(options: &Options) -> Result<Store> {
        if options.records == 0 {
            return crate::errinput!("store must have at least 1 record");
        }
        if options.operations == 0 {
            return crate::errinput!("transactions must have at least 1 operation");
        }
        let records = (0..options.records)
            .map(|i| Record { version: SEQNO_UNDEFINED, value: i })
            .collect();
        let min_op_size = encoding::serialized_size(&Operation {
            src: 0,
            dst: 0,
            rec_src: Record { version: SEQNO_UNDEFINED, value: 0 },
            rec_dst: Record { version: SEQNO_UNDEFINED, value: 0 },
            new_value: 0,
            pad: Vec::new(),
        })?;
        let op_size = std::cmp::max(min_op_size, options.ws_size / options.operations);
        Ok(Store {
            inner: Mutex::new(Inner {
                gtid: Gtid::UNDEFINED,
                members: Vec::new(),
                records,
                snapshot: None,
                read_view_support: false,
                read_view_failures: 0,
                pad_len: op_size - min_op_size,
            }),
        })
    }

    /// Returns the current GTID.
    pub fn gtid(&self) -> Gtid {
        self.lock().gtid
    }

    /// Returns the current membership.
    pub fn members(&self) -> Vec<Uuid> {
        self.lock().members.clone()
    }

    /// Returns a copy of the current records.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    /// Whether the provider certifies read views for us.
    pub fn read_view_support(&self) -> bool {
        self.lock().read_view_support
    }

    /// The number of transactions rejected because their reads moved.
    pub fn read_view_failures(&self) -> u64 {
        self.lock().read_view_failures
    }

    /// Applies a membership change, in total order. The view either
    /// continues the current epoch (same uuid, seqno advances by 1) or
    /// initializes an undefined store; anything else means this node's
    /// state diverged from the cluster and is fatal.
    pub fn update_membership(&self, view: &View) {
        assert_eq!(view.status, ViewStatus::Primary, "membership update from {} view", view.status);
        assert!(!view.members.is_empty(), "membership update with no members");

        let mut inner = self.lock();
        let continuation = view.state_id.uuid == inner.gtid.uuid
            && view.state_id.seqno == inner.gtid.seqno + 1;
        let initialization = inner.gtid.is_undefined();
        if !(continuation || initialization) {
            panic!(
                "store GTID {} is incompatible with view GTID {}",
                inner.gtid, view.state_id
            );
        }
        inner.members = view.members.iter().map(|m| m.id).collect();
        inner.gtid = view.state_id;
        inner.read_view_support = view.capabilities.has(Capabilities::SNAPSHOT);
    }

    /// Produces a consistent state snapshot and pins it until
    /// release_state(). At most one snapshot may be acquired at a time; the
    /// provider guarantees it never requests two concurrent donations.
    pub fn acquire_state(&self) -> Result<Arc<Vec<u8>>> {
        let mut inner = self.lock();
        if inner.snapshot.is_some() {
            return errdata!("state snapshot already acquired");
        }
        let snapshot = Arc::new(inner.encode_state());
        inner.snapshot = Some(snapshot.clone());
        info!("prepared state snapshot of {} records at {}", inner.records.len(), inner.gtid);
        Ok(snapshot)
    }

    /// Releases the pinned state snapshot.
    pub fn release_state(&self) {
        let mut inner = self.lock();
        assert!(inner.snapshot.is_some(), "releasing state snapshot that was never acquired");
        inner.snapshot = None;
    }

    /// Parses and installs a state snapshot received from a donor,
    /// replacing the store state atomically. Rejects snapshots that are in
    /// the past within the current epoch.
    pub fn init_state(&self, data: &[u8]) -> Result<()> {
        let state = decode_state(data)?;
        let mut inner = self.lock();
        if state.gtid.uuid == inner.gtid.uuid && state.gtid.seqno < inner.gtid.seqno {
            return errdata!(
                "received state snapshot {} in the past of {}",
                state.gtid,
                inner.gtid
            );
        }
        inner.gtid = state.gtid;
        inner.members = state.members;
        inner.records = state.records;
        inner.read_view_support = state.read_view_support;
        info!("installed state snapshot of {} records at {}", inner.records.len(), inner.gtid);
        Ok(())
    }

    /// Executes one operation, extending the transaction. The first
    /// operation captures the current GTID as the transaction's read view.
    /// Picks a random source and destination record and prepares to copy
    /// the source value, incremented by 1, into the destination.
    ///
    /// If either record has already been committed past the read view, the
    /// read view has moved: the failure is counted and the transaction must
    /// be rolled back by the caller. No seqno has been consumed.
    pub fn execute(&self, trx: &mut Trx) -> Result<()> {
        let mut inner = self.lock();
        if trx.read_view.is_undefined() && trx.ops.is_empty() {
            trx.read_view = inner.gtid;
        }
        let mut rng = rand::thread_rng();
        let src = rng.gen_range(0..inner.records.len() as u32);
        let dst = rng.gen_range(0..inner.records.len() as u32);
        let rec_src = inner.records[src as usize];
        let rec_dst = inner.records[dst as usize];
        if rec_src.version > trx.read_view.seqno || rec_dst.version > trx.read_view.seqno {
            inner.read_view_failures += 1;
            return Err(Error::Serialization);
        }
        trx.ops.push(Operation {
            src,
            dst,
            rec_src,
            rec_dst,
            new_value: rec_src.value.wrapping_add(1),
            pad: vec![0; inner.pad_len],
        });
        Ok(())
    }

    /// Deserializes a remote write-set into a fresh transaction context.
    /// Does not touch the records.
    ///
    /// When the provider certifies read views, masters prefix the payload
    /// with the read-view GTID; otherwise it is the bare operation
    /// sequence. Views install the capability flag in total order, so
    /// every write-set is framed the same way on the node that built it
    /// and on every node applying it.
    pub fn apply(&self, ws: &[u8]) -> Result<Trx> {
        let (records_num, read_view_support) = {
            let inner = self.lock();
            (inner.records.len() as u32, inner.read_view_support)
        };
        let mut reader = ws;
        let read_view: Gtid = if read_view_support {
            encoding::deserialize_from(&mut reader)?
        } else {
            Gtid::UNDEFINED
        };
        let mut ops = Vec::new();
        while let Some(op) = encoding::maybe_deserialize_from::<_, Operation>(&mut reader)? {
            if op.src >= records_num || op.dst >= records_num {
                return errdata!(
                    "write-set operation {}->{} outside store of {} records",
                    op.src,
                    op.dst,
                    records_num
                );
            }
            ops.push(op);
        }
        if ops.is_empty() {
            return errdata!("write-set with no operations");
        }
        Ok(Trx { read_view, ops })
    }

    /// Commits a transaction under the write-set's assigned GTID, which
    /// must advance the store seqno by exactly 1.
    ///
    /// If the provider does not certify read views, the store verifies here
    /// that every record the transaction read is unchanged. On a mismatch
    /// nothing is written, the failure is counted, and the seqno is still
    /// consumed (the write-set was totally ordered). If the provider does
    /// certify read views, a mismatch means certification is broken and the
    /// node cannot continue.
    pub fn commit(&self, trx: Trx, ws_gtid: &Gtid) -> Result<()> {
        let mut inner = self.lock();
        if inner.read_view_support {
            debug_assert!(
                inner.verify(&trx),
                "write-set {ws_gtid} failed read-view verification despite provider certification"
            );
        } else if !inner.verify(&trx) {
            inner.read_view_failures += 1;
            inner.advance_gtid(ws_gtid);
            return Err(Error::Serialization);
        }
        inner.advance_gtid(ws_gtid);
        for op in &trx.ops {
            inner.records[op.dst as usize] =
                Record { version: ws_gtid.seqno, value: op.new_value };
        }
        Ok(())
    }

    /// Advances the GTID by 1 without mutating any records, for write-sets
    /// that were totally ordered but failed certification or rolled back.
    pub fn update_gtid(&self, ws_gtid: &Gtid) {
        self.lock().advance_gtid(ws_gtid);
    }

    /// Releases a transaction context without committing. Never advances
    /// the GTID; if the write-set was ordered, the caller separately calls
    /// update_gtid().
    pub fn rollback(&self, trx: Trx) {
        drop(trx);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store lock poisoned")
    }
}

impl Inner {
    /// Advances the GTID by 1 under the store lock, enforcing that the
    /// write-set continues the current epoch at exactly the next seqno.
    /// Emits a state checksum every ~1M seqnos for cross-node divergence
    /// detection.
    fn advance_gtid(&mut self, ws_gtid: &Gtid) {
        assert_eq!(
            self.gtid.uuid, ws_gtid.uuid,
            "write-set epoch {} does not match store epoch {}",
            ws_gtid.uuid, self.gtid.uuid
        );
        self.gtid.seqno += 1;
        if self.gtid.seqno != ws_gtid.seqno {
            panic!("out of order commit: expected {}, got {}", self.gtid.seqno, ws_gtid.seqno);
        }

        const CHECKSUM_PERIOD_MASK: Seqno = 0xfffff;
        if self.gtid.seqno & CHECKSUM_PERIOD_MASK == 0 {
            info!("seqno {}: state hash {:#010x}", self.gtid.seqno, self.checksum());
        }
    }

    /// Verifies that every record the transaction read still matches the
    /// current records.
    fn verify(&self, trx: &Trx) -> bool {
        trx.ops.iter().all(|op| {
            self.records[op.src as usize] == op.rec_src
                && self.records[op.dst as usize] == op.rec_dst
        })
    }

    /// A 32-bit FNV-1a hash over (members, records, gtid). Nodes with
    /// identical state log identical hashes at identical seqnos.
    fn checksum(&self) -> u32 {
        let mut hash = FNV32_SEED;
        for member in &self.members {
            hash = fnv32a(member.as_bytes(), hash);
        }
        for record in &self.records {
            hash = fnv32a(&(record.version as u64).to_be_bytes(), hash);
            hash = fnv32a(&record.value.to_be_bytes(), hash);
        }
        hash = fnv32a(self.gtid.uuid.as_bytes(), hash);
        // Seqno least-significant byte first, to keep the hash independent
        // of the integer's in-memory layout.
        let mut seqno = self.gtid.seqno;
        for _ in 0..std::mem::size_of::<Seqno>() {
            hash = fnv32a(&[(seqno & 0xff) as u8], hash);
            seqno >>= 8;
        }
        hash
    }

    /// Serializes the store state as a self-describing snapshot:
    ///
    /// ```text
    /// <gtid-string>\0              null-terminated ASCII GTID
    /// <u32 members_num>
    /// <members_num x 16-byte uuid>
    /// <u8 read_view_support>       0 or 1
    /// <u32 records_num>
    /// <records_num x record>       u64 version || u32 value
    /// ```
    ///
    /// All integers are in network byte order.
    fn encode_state(&self) -> Vec<u8> {
        let gtid = self.gtid.to_string();
        let mut buf = Vec::with_capacity(
            gtid.len() + 1 + 4 + 16 * self.members.len() + 1 + 4
                + RECORD_WIRE_SIZE * self.records.len(),
        );
        buf.extend(gtid.as_bytes());
        buf.push(0);
        buf.extend((self.members.len() as u32).to_be_bytes());
        for member in &self.members {
            buf.extend(member.as_bytes());
        }
        buf.push(self.read_view_support as u8);
        buf.extend((self.records.len() as u32).to_be_bytes());
        for record in &self.records {
            buf.extend((record.version as u64).to_be_bytes());
            buf.extend(record.value.to_be_bytes());
        }
        buf
    }
}

/// A state snapshot parsed from the wire.
struct State {
    gtid: Gtid,
    members: Vec<Uuid>,
    read_view_support: bool,
    records: Vec<Record>,
}

/// Parses a state snapshot, the inverse of Inner::encode_state(). The
/// entire buffer must be consumed; trailing bytes mean a framing error.
fn decode_state(data: &[u8]) -> Result<State> {
    let Some(nul) = data.iter().position(|&b| b == 0) else {
        return errdata!("no GTID in state snapshot of {} bytes", data.len());
    };
    let gtid: Gtid = std::str::from_utf8(&data[..nul])?.parse()?;
    let mut rest = &data[nul + 1..];

    let members_num = take_u32(&mut rest, "member count")?;
    if members_num == 0 {
        return errdata!("state snapshot has no members");
    }
    let mut members = Vec::with_capacity(members_num as usize);
    for _ in 0..members_num {
        let bytes: [u8; 16] =
            take(&mut rest, 16, "member uuid")?.try_into().expect("sliced 16 bytes");
        members.push(Uuid::from_bytes(bytes));
    }

    let read_view_support = match take(&mut rest, 1, "read view support")?[0] {
        0 => false,
        1 => true,
        b => return errdata!("bad read view support flag {b}"),
    };

    let records_num = take_u32(&mut rest, "record count")?;
    let mut records = Vec::with_capacity(records_num as usize);
    for _ in 0..records_num {
        let version = u64::from_be_bytes(
            take(&mut rest, 8, "record version")?.try_into().expect("sliced 8 bytes"),
        ) as Seqno;
        let value = u32::from_be_bytes(
            take(&mut rest, 4, "record value")?.try_into().expect("sliced 4 bytes"),
        );
        records.push(Record { version, value });
    }

    if !rest.is_empty() {
        return errdata!("{} trailing bytes in state snapshot", rest.len());
    }
    Ok(State { gtid, members, read_view_support, records })
}

/// Takes `len` bytes off the front of `rest`, or fails with the field name.
fn take<'a>(rest: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if rest.len() < len {
        return errdata!("state snapshot truncated at {what}");
    }
    let (taken, remainder) = rest.split_at(len);
    *rest = remainder;
    Ok(taken)
}

fn take_u32(rest: &mut &[u8], what: &str) -> Result<u32> {
    Ok(u32::from_be_bytes(take(rest, 4, what)?.try_into().expect("sliced 4 bytes")))
}

const FNV32_SEED: u32 = 2166136261;

fn fnv32a(bytes: &[u8], mut hash: u32) -> u32 {
    const FNV32_PRIME: u32 = 16777619;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}
