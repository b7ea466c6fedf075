//! Replication scenarios driven end-to-end through the built-in provider:
//! master write-set lifecycles, certification failures, brute-force
//! aborts, and the slave apply path.

use repnode::encoding;
use repnode::error::Error;
use repnode::gtid::SEQNO_UNDEFINED;
use repnode::provider::{LocalProvider, Provider, RecvCtx, Status};
use repnode::repl::Cluster;
use repnode::store::{Options, Store, Trx};
use repnode::txn;

use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    store: Arc<Store>,
    provider: Arc<LocalProvider>,
    cluster: Arc<Cluster>,
    slave: Option<std::thread::JoinHandle<Status>>,
}

/// Bootstraps a single-node primary with one slave worker draining the
/// receive queue.
fn setup(records: u32) -> Harness {
    let store =
        Arc::new(Store::open(&Options { records, ws_size: 256, operations: 1 }).unwrap());
    let provider = Arc::new(LocalProvider::new());
    let cluster = Cluster::init(
        provider.clone() as Arc<dyn Provider>,
        store.clone(),
        "test-node",
        "localhost",
        14567,
        ".",
        "",
    )
    .unwrap();
    cluster.connect("test", "", true).unwrap();
    let slave = {
        let provider = provider.clone();
        std::thread::spawn(move || provider.recv(&mut RecvCtx::new(0)))
    };
    Harness { store, provider, cluster, slave: Some(slave) }
}

impl Harness {
    /// Orderly shutdown, asserting the slave exited cleanly.
    fn shutdown(mut self) {
        self.cluster.disconnect();
        assert_eq!(self.slave.take().unwrap().join().unwrap(), Status::Ok);
        self.cluster.close();
    }
}

fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Encodes a transaction the way the master path puts it on the wire: the
/// bare operation sequence, since the built-in provider does not certify
/// read views.
fn encode_ws(trx: &Trx) -> Vec<u8> {
    let mut ws = Vec::new();
    for op in trx.ops() {
        ws.extend(encoding::serialize(op).unwrap());
    }
    ws
}

#[test]
fn bootstrap_initializes_store() {
    let h = setup(4);
    // The first view advances the store to seqno 0 and installs the
    // single-member membership; the records are untouched.
    let gtid = h.store.gtid();
    assert_eq!(gtid.seqno, 0);
    assert!(!gtid.uuid.is_nil());
    assert_eq!(h.store.members().len(), 1);
    for (i, record) in h.store.records().into_iter().enumerate() {
        assert_eq!(record.version, SEQNO_UNDEFINED);
        assert_eq!(record.value, i as u32);
    }
    h.shutdown();
}

#[test]
fn local_commit() {
    let h = setup(4);
    let before = h.store.gtid();

    txn::execute(&h.store, h.provider.as_ref(), 0, 1).unwrap();

    let after = h.store.gtid();
    assert_eq!(after.uuid, before.uuid);
    assert_eq!(after.seqno, before.seqno + 1);
    // Exactly one record was written, at the new seqno.
    let written: Vec<_> =
        h.store.records().into_iter().filter(|r| r.version == after.seqno).collect();
    assert_eq!(written.len(), 1);

    let replicated =
        h.provider.stats().into_iter().find(|v| v.name == "replicated").unwrap().value;
    assert_eq!(replicated, 1);
    h.shutdown();
}

#[test]
fn certification_failure_consumes_seqno() {
    let h = setup(4);
    let before = h.store.gtid();
    let records = h.store.records();

    // The write-set fails certification but was totally ordered: the
    // transaction rolls back, yet the seqno is consumed.
    h.provider.queue_verdict(Status::TrxFail, true);
    assert_eq!(
        txn::execute(&h.store, h.provider.as_ref(), 0, 1),
        Err(Error::Serialization)
    );

    assert_eq!(h.store.gtid().seqno, before.seqno + 1);
    assert_eq!(h.store.records(), records);
    assert_eq!(h.store.read_view_failures(), 0);

    let failures =
        h.provider.stats().into_iter().find(|v| v.name == "local_cert_failures").unwrap().value;
    assert_eq!(failures, 1);
    h.shutdown();
}

#[test]
fn unordered_failure_leaves_gtid() {
    let h = setup(4);
    let before = h.store.gtid();
    h.provider.queue_verdict(Status::TrxFail, false);
    assert_eq!(
        txn::execute(&h.store, h.provider.as_ref(), 0, 1),
        Err(Error::Serialization)
    );
    assert_eq!(h.store.gtid(), before);
    h.shutdown();
}

#[test]
fn bf_abort_consumes_seqno_when_ordered() {
    let h = setup(4);
    let before = h.store.gtid();
    let records = h.store.records();

    h.provider.queue_verdict(Status::BfAbort, true);
    assert_eq!(
        txn::execute(&h.store, h.provider.as_ref(), 0, 1),
        Err(Error::Serialization)
    );
    assert_eq!(h.store.gtid().seqno, before.seqno + 1);
    assert_eq!(h.store.records(), records);

    // A brute-force abort before total ordering moves nothing.
    h.provider.queue_verdict(Status::BfAbort, false);
    assert_eq!(
        txn::execute(&h.store, h.provider.as_ref(), 0, 1),
        Err(Error::Serialization)
    );
    assert_eq!(h.store.gtid().seqno, before.seqno + 1);
    h.shutdown();
}

#[test]
fn remote_write_set_applies() {
    let h = setup(4);

    // Stage a transaction and hand it to the provider as if it came from a
    // remote master.
    let mut trx = Trx::new();
    h.store.execute(&mut trx).unwrap();
    let op = trx.ops()[0].clone();
    let ordered_at = h.provider.inject(encode_ws(&trx));
    h.store.rollback(trx);

    wait_for("remote write-set", || h.store.gtid() == ordered_at);
    let record = h.store.records()[op.dst as usize];
    assert_eq!(record.version, ordered_at.seqno);
    assert_eq!(record.value, op.new_value);

    let received =
        h.provider.stats().into_iter().find(|v| v.name == "received").unwrap().value;
    assert_eq!(received, 1);
    h.shutdown();
}

#[test]
fn rollback_fragment_consumes_seqno() {
    let h = setup(4);
    let records = h.store.records();
    let ordered_at = h.provider.inject_rollback();
    wait_for("rollback fragment", || h.store.gtid() == ordered_at);
    assert_eq!(h.store.records(), records);
    h.shutdown();
}

#[test]
fn apply_failure_fails_the_worker() {
    let mut h = setup(4);
    let ordered_at = h.provider.inject(b"not a write-set".to_vec());

    // The apply callback reports failure, which ends the receive loop.
    let slave = h.slave.take().unwrap();
    assert_eq!(slave.join().unwrap(), Status::NodeFail);
    // The malformed write-set was ordered; its seqno is still consumed.
    assert_eq!(h.store.gtid(), ordered_at);

    h.cluster.disconnect();
    h.cluster.close();
}

#[test]
fn concurrent_masters_converge() {
    let h = setup(8);
    const MASTERS: usize = 4;
    const COMMITS: usize = 25;

    std::thread::scope(|s| {
        for id in 0..MASTERS {
            let store = &h.store;
            let provider = h.provider.as_ref();
            s.spawn(move || {
                let mut committed = 0;
                while committed < COMMITS {
                    match txn::execute(store, provider, id as u64, 2) {
                        Ok(()) => committed += 1,
                        // Read-view conflicts between masters are expected.
                        Err(Error::Serialization) => continue,
                        Err(err) => panic!("master {id} failed: {err}"),
                    }
                }
            });
        }
    });

    let gtid = h.store.gtid();
    assert!(gtid.seqno >= (MASTERS * COMMITS) as i64);
    // Conservation: no record is from the future.
    for record in h.store.records() {
        assert!(record.version <= gtid.seqno);
    }
    h.shutdown();
}
