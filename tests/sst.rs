//! State snapshot transfer between a donor and a joiner over real sockets:
//! the full path, the bypass path, and the failure paths.

use repnode::gtid::Gtid;
use repnode::provider::{
    Capabilities, LocalProvider, Member, Provider, SstReport, View, ViewStatus,
};
use repnode::sst;
use repnode::store::{Options, Store, Trx};

use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A store bootstrapped into a two-member primary at seqno 0, plus a
/// provider recording SST reports.
fn node(records: u32) -> (Arc<Store>, Arc<LocalProvider>) {
    let store =
        Arc::new(Store::open(&Options { records, ws_size: 256, operations: 1 }).unwrap());
    (store, Arc::new(LocalProvider::new()))
}

fn bootstrap(store: &Store, epoch: Uuid) {
    let members = [Uuid::new_v4(), Uuid::new_v4()]
        .into_iter()
        .map(|id| Member { id, name: "node".into(), incoming: String::new() })
        .collect();
    store.update_membership(&View {
        state_id: Gtid::new(epoch, 0),
        status: ViewStatus::Primary,
        capabilities: Capabilities::default(),
        proto_ver: 1,
        members,
        my_index: 0,
    });
}

fn wait_for_report(provider: &LocalProvider) -> SstReport {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(report) = provider.sst_reports().pop() {
            return report;
        }
        assert!(Instant::now() < deadline, "timed out waiting for SST report");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn full_transfer() {
    let (donor_store, donor_provider) = node(4);
    bootstrap(&donor_store, Uuid::new_v4());
    // Give the donor some committed state.
    let gtid = donor_store.gtid();
    let mut trx = Trx::new();
    donor_store.execute(&mut trx).unwrap();
    donor_store.commit(trx, &Gtid::new(gtid.uuid, gtid.seqno + 1)).unwrap();

    let (joiner_store, joiner_provider) = node(1);

    // Joiner binds its rendezvous socket and hands out its address; the
    // donor connects to it and streams the snapshot.
    let request = sst::request(
        joiner_store.clone(),
        joiner_provider.clone() as Arc<dyn Provider>,
        "127.0.0.1",
        0,
    )
    .unwrap();
    assert!(String::from_utf8(request.clone()).unwrap().starts_with("127.0.0.1:"));

    let state_id = donor_store.gtid();
    sst::donate(
        donor_store.clone(),
        donor_provider.clone() as Arc<dyn Provider>,
        &request,
        state_id,
        false,
    )
    .unwrap();

    assert_eq!(
        wait_for_report(&joiner_provider),
        SstReport { state_id, rc: 0, sent: false }
    );
    assert_eq!(
        wait_for_report(&donor_provider),
        SstReport { state_id, rc: 0, sent: true }
    );

    // The joiner now has a byte-for-byte copy of the donor state.
    assert_eq!(joiner_store.gtid(), donor_store.gtid());
    assert_eq!(joiner_store.members(), donor_store.members());
    assert_eq!(joiner_store.records(), donor_store.records());

    // The donor's snapshot was released.
    donor_store.acquire_state().unwrap();
    donor_store.release_state();
}

#[test]
fn bypass_transfer() {
    // The joiner already has state and only needs the hand-off.
    let epoch = Uuid::new_v4();
    let (joiner_store, joiner_provider) = node(4);
    bootstrap(&joiner_store, epoch);
    let joiner_gtid = joiner_store.gtid();
    let records = joiner_store.records();

    let (donor_store, donor_provider) = node(4);
    bootstrap(&donor_store, epoch);

    let request = sst::request(
        joiner_store.clone(),
        joiner_provider.clone() as Arc<dyn Provider>,
        "127.0.0.1",
        0,
    )
    .unwrap();
    let state_id = donor_store.gtid();
    sst::donate(
        donor_store.clone(),
        donor_provider.clone() as Arc<dyn Provider>,
        &request,
        state_id,
        true,
    )
    .unwrap();

    // The joiner reports its own current GTID and touches nothing.
    assert_eq!(
        wait_for_report(&joiner_provider),
        SstReport { state_id: joiner_gtid, rc: 0, sent: false }
    );
    assert_eq!(
        wait_for_report(&donor_provider),
        SstReport { state_id, rc: 0, sent: true }
    );
    assert_eq!(joiner_store.gtid(), joiner_gtid);
    assert_eq!(joiner_store.records(), records);

    // Bypass never acquires a snapshot, so one can be acquired now.
    donor_store.acquire_state().unwrap();
    donor_store.release_state();
}

#[test]
fn donor_reports_connect_failure() {
    let (donor_store, donor_provider) = node(4);
    bootstrap(&donor_store, Uuid::new_v4());
    let state_id = donor_store.gtid();

    // Nobody is listening at the joiner address.
    sst::donate(
        donor_store.clone(),
        donor_provider.clone() as Arc<dyn Provider>,
        b"127.0.0.1:1",
        state_id,
        false,
    )
    .unwrap();

    let report = wait_for_report(&donor_provider);
    assert!(report.sent);
    assert!(report.rc < 0);
    assert_eq!(report.state_id, state_id);

    // The snapshot was released despite the failure.
    donor_store.acquire_state().unwrap();
    donor_store.release_state();
}

#[test]
fn joiner_rejects_corrupt_snapshot() {
    let (joiner_store, joiner_provider) = node(4);
    bootstrap(&joiner_store, Uuid::new_v4());
    let joiner_gtid = joiner_store.gtid();

    let request = sst::request(
        joiner_store.clone(),
        joiner_provider.clone() as Arc<dyn Provider>,
        "127.0.0.1",
        0,
    )
    .unwrap();
    let address = String::from_utf8(request).unwrap();

    // Hand the joiner a framed payload that is not a snapshot.
    let garbage = b"none of this parses";
    let mut stream = std::net::TcpStream::connect(&address).unwrap();
    stream.write_all(&(garbage.len() as u32).to_be_bytes()).unwrap();
    stream.write_all(garbage).unwrap();
    drop(stream);

    let report = wait_for_report(&joiner_provider);
    assert!(!report.sent);
    assert!(report.rc < 0);
    // The store is untouched.
    assert_eq!(joiner_store.gtid(), joiner_gtid);
}

#[test]
fn joiner_rejects_short_payload() {
    let (joiner_store, joiner_provider) = node(4);
    bootstrap(&joiner_store, Uuid::new_v4());

    let request = sst::request(
        joiner_store.clone(),
        joiner_provider.clone() as Arc<dyn Provider>,
        "127.0.0.1",
        0,
    )
    .unwrap();
    let address = String::from_utf8(request).unwrap();

    // Promise 1000 bytes, deliver 3, hang up: a short read is a hard error.
    let mut stream = std::net::TcpStream::connect(&address).unwrap();
    stream.write_all(&1000u32.to_be_bytes()).unwrap();
    stream.write_all(b"abc").unwrap();
    drop(stream);

    let report = wait_for_report(&joiner_provider);
    assert!(!report.sent);
    assert!(report.rc < 0);
}
