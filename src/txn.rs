//! The write-set lifecycle engine.
//!
//! Drives master-originated and remotely-received write-sets through the
//! provider in the exact order its contract requires, and translates
//! provider status codes into crate errors at this boundary: the store
//! never sees provider codes, and workers never see anything but Error.
//!
//! The key rule on both paths: once a write-set has been totally ordered
//! (meta.gtid.seqno > 0), its seqno must be consumed exactly once, by
//! commit() if it certified and applied cleanly and by update_gtid()
//! otherwise. A write-set that was never ordered must not move the GTID
//! at all.

use crate::encoding;
use crate::errdata;
use crate::error::{Error, Result};
use crate::provider::{DataType, Flags, KeyType, Provider, Status, TrxMeta, WsHandle};
use crate::store::{Store, Trx};

use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates process-unique write-set handle ids.
fn next_trx_id() -> u64 {
    static NEXT_TRX_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_TRX_ID.fetch_add(1, Ordering::Relaxed)
}

/// Produces and replicates one local transaction of `operations`
/// operations.
///
/// Returns Ok on commit, Error::Serialization when the transaction was
/// rolled back but can be retried (read view moved, certification failure,
/// brute-force abort), and Error::Disconnected when the node has lost the
/// primary component and the worker should wait for SYNCED.
pub fn execute(
    store: &Store,
    provider: &dyn Provider,
    conn_id: u64,
    operations: usize,
) -> Result<()> {
    let mut trx = Trx::new();
    for _ in 0..operations {
        // A moved read view surfaces as Error::Serialization: the
        // transaction has not replicated anything yet, so it rolls back
        // locally without consuming a seqno.
        store.execute(&mut trx)?;
    }

    let handle = WsHandle::new(next_trx_id());
    let result = replicate(store, provider, conn_id, &handle, trx);
    provider.release(&handle);
    result
}

/// Replicates an executed transaction: append keys and data, certify, and
/// commit or roll back according to the certification verdict. The
/// provider's write-set resources are released by the caller.
fn replicate(
    store: &Store,
    provider: &dyn Provider,
    conn_id: u64,
    handle: &WsHandle,
    trx: Trx,
) -> Result<()> {
    let mut trx = Some(trx);

    // If the provider certifies read views, tell it ours, and prefix the
    // payload with the read-view GTID as a diagnostic fragment. Without
    // that capability the payload is the bare operation sequence.
    let read_view = trx.as_ref().expect("transaction taken").read_view();
    if store.read_view_support() {
        match provider.assign_read_view(handle, &read_view) {
            Status::Ok => {}
            Status::ConnFail => return Err(Error::Disconnected),
            status => return errdata!("assign_read_view failed: {status}"),
        }
        append(provider, handle, DataType::Ordered, &encoding::serialize(&read_view)?)?;
    }

    // Each operation contributes two certification keys out of band (the
    // source index as a read reference, the destination index as an
    // update) and its serialized form as ordered data.
    for op in trx.as_ref().expect("transaction taken").ops() {
        append_key(provider, handle, KeyType::Reference, &op.src.to_be_bytes())?;
        append_key(provider, handle, KeyType::Update, &op.dst.to_be_bytes())?;
        append(provider, handle, DataType::Ordered, &encoding::serialize(op)?)?;
    }

    let mut meta = TrxMeta::default();
    let cert = provider.certify(conn_id, handle, Flags::trx(), &mut meta);

    if cert == Status::BfAbort {
        // A higher-priority transaction aborted us while we waited: it is
        // ordered before us and cannot enter commit order until we roll
        // back, so roll back immediately.
        store.rollback(trx.take().expect("transaction taken"));
    }

    let mut committed = Ok(());
    if meta.gtid.seqno > 0 {
        // The write-set was totally ordered: its seqno must be consumed
        // whether or not certification succeeded.
        order(provider.commit_order_enter(handle, &meta))?;
        match trx.take() {
            Some(trx) if cert == Status::Ok => committed = store.commit(trx, &meta.gtid),
            rolled_back => {
                store.update_gtid(&meta.gtid);
                if let Some(trx) = rolled_back {
                    store.rollback(trx);
                }
            }
        }
        order(provider.commit_order_leave(handle, &meta, None))?;
    } else {
        debug_assert!(cert != Status::Ok, "successful certification without a seqno");
    }

    if let Some(trx) = trx.take() {
        store.rollback(trx);
    }

    match cert {
        Status::Ok => committed,
        Status::TrxFail | Status::BfAbort => {
            debug!("write-set {} aborted: {cert}", handle.trx_id);
            Err(Error::Serialization)
        }
        Status::ConnFail => Err(Error::Disconnected),
        status => errdata!("certification of write-set {} failed: {status}", handle.trx_id),
    }
}

/// Applies one totally ordered remote write-set. `ws` is None when the
/// write-set carries nothing to apply (it failed certification or was a
/// rollback fragment); its seqno is still consumed.
pub fn apply(
    store: &Store,
    provider: &dyn Provider,
    handle: &WsHandle,
    ws: Option<&[u8]>,
    meta: &TrxMeta,
) -> Result<()> {
    assert!(meta.gtid.seqno > 0, "apply of unordered write-set {}", handle.trx_id);

    let (trx, apply_err) = match ws {
        Some(ws) => match store.apply(ws) {
            Ok(trx) => (Some(trx), None),
            Err(err) => (None, Some(err)),
        },
        None => (None, None),
    };

    if let Err(err) = order(provider.commit_order_enter(handle, meta)) {
        if let Some(trx) = trx {
            store.rollback(trx);
        }
        return Err(err);
    }

    match trx {
        Some(trx) => {
            // A commit-time read-view rejection has already been counted
            // and has consumed the seqno; it is not an apply failure.
            if let Err(Error::Serialization) = store.commit(trx, &meta.gtid) {
                debug!("write-set {} failed read-view verification", meta.gtid);
            }
        }
        None => store.update_gtid(&meta.gtid),
    }

    let error = apply_err.as_ref().map(|err| err.to_string().into_bytes());
    order(provider.commit_order_leave(handle, meta, error.as_deref()))?;

    match apply_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Translates a commit-order primitive status. ConnFail means the node
/// lost the primary component; anything else non-Ok ends the worker.
fn order(status: Status) -> Result<()> {
    match status {
        Status::Ok => Ok(()),
        Status::ConnFail => Err(Error::Disconnected),
        status => errdata!("commit order violation: {status}"),
    }
}

fn append(
    provider: &dyn Provider,
    handle: &WsHandle,
    data_type: DataType,
    data: &[u8],
) -> Result<()> {
    match provider.append_data(handle, data, data_type) {
        Status::Ok => Ok(()),
        Status::ConnFail => Err(Error::Disconnected),
        status => errdata!("append_data failed: {status}"),
    }
}

fn append_key(
    provider: &dyn Provider,
    handle: &WsHandle,
    key_type: KeyType,
    part: &[u8],
) -> Result<()> {
    match provider.append_key(handle, &[part], key_type) {
        Status::Ok => Ok(()),
        Status::ConnFail => Err(Error::Disconnected),
        status => errdata!("append_key failed: {status}"),
    }
}
