//! State Snapshot Transfer: full state copy from a donor to a joiner.
//!
//! The joiner listens on the SST port (base port + 2) and embeds its
//! "host:port" rendezvous address in the state transfer request; the donor
//! connects to that address and streams the snapshot. The wire format is a
//! 4-byte network-order length followed by the snapshot bytes; length 0
//! means bypass: no payload follows and the joiner catches up from ordered
//! write-set replay instead.
//!
//! Both provider callbacks must return quickly while the transfer itself is
//! long-running, so each spawns a worker thread and hands it ownership of
//! its inputs (the listening socket for the joiner; the snapshot, acquired
//! under the store lock, for the donor) through a one-shot channel before
//! returning. The worker runs to completion and reports the outcome to the
//! provider exactly once: sst_received on the joiner, sst_sent on the
//! donor, with a negative code on failure. The provider arbitrates
//! recovery; SST failures never abort the process.

use crate::error::Result;
use crate::gtid::Gtid;
use crate::provider::{Provider, Status};
use crate::store::Store;

use log::{error, info};
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

/// Prepares the node to receive a state transfer: binds the rendezvous
/// listener, starts the joiner worker, and returns the request payload for
/// the provider to forward to the donor. The listener is bound before this
/// returns, so the donor can never connect into the void.
pub fn request(
    store: Arc<Store>,
    provider: Arc<dyn Provider>,
    host: &str,
    port: u16,
) -> Result<Vec<u8>> {
    let listener = TcpListener::bind(format!("{host}:{port}"))?;
    // Embed the bound port, which may have been ephemeral (port 0).
    let address = format!("{host}:{}", listener.local_addr()?.port());
    info!("awaiting state transfer at {address}");

    let (ready_tx, ready_rx) = crossbeam::channel::bounded(0);
    std::thread::Builder::new().name("sst-joiner".into()).spawn(move || {
        // The worker owns the listener and the store/provider handles; the
        // callback may now return to the provider.
        ready_tx.send(()).ok();

        let rc = match receive(&listener, &store) {
            Ok(()) => 0,
            Err(err) => {
                error!("state transfer failed: {err}");
                -1
            }
        };
        // Close all sockets before signaling the provider.
        drop(listener);

        let gtid = store.gtid();
        let status = provider.sst_received(&gtid, rc);
        if status != Status::Ok {
            error!("failed to report state transfer receipt at {gtid}: {status}");
        }
    })?;
    ready_rx.recv()?;

    Ok(address.into_bytes())
}

/// Accepts the donor connection and installs the received snapshot, if any.
fn receive(listener: &TcpListener, store: &Store) -> Result<()> {
    let (mut stream, peer) = listener.accept()?;
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;

    if len == 0 {
        // Bypass: the donor transfers nothing and we catch up by replaying
        // ordered write-sets against our existing state.
        info!("bypassing state transfer, continuing from {}", store.gtid());
        return Ok(());
    }

    info!("receiving {len} byte state snapshot from {peer}");
    let mut snapshot = vec![0; len];
    stream.read_exact(&mut snapshot)?;
    drop(stream);

    store.init_state(&snapshot)
}

/// Donates the node's state to the joiner that sent `request`: acquires a
/// snapshot (unless bypassing), starts the donor worker, and returns once
/// the worker owns the snapshot and the donor context. The snapshot is
/// acquired here, under the total-order isolation the provider guarantees
/// around this callback, and released on every worker path.
pub fn donate(
    store: Arc<Store>,
    provider: Arc<dyn Provider>,
    request: &[u8],
    state_id: Gtid,
    bypass: bool,
) -> Result<()> {
    let address = std::str::from_utf8(request)?.trim_end_matches('\0').to_string();
    let snapshot = if bypass { None } else { Some(store.acquire_state()?) };

    let (ready_tx, ready_rx) = crossbeam::channel::bounded(0);
    std::thread::Builder::new().name("sst-donor".into()).spawn(move || {
        ready_tx.send(()).ok();

        let rc = match send(&address, snapshot.as_deref().map(Vec::as_slice)) {
            Ok(()) => 0,
            Err(err) => {
                error!("state donation to {address} failed: {err}");
                -1
            }
        };
        if snapshot.is_some() {
            store.release_state();
        }

        let status = provider.sst_sent(&state_id, rc);
        if status != Status::Ok {
            error!("failed to report state donation at {state_id}: {status}");
        }
    })?;
    ready_rx.recv()?;

    Ok(())
}

/// Connects to the joiner and sends the length-prefixed snapshot. A None
/// snapshot is a bypass hand-off: length 0, no payload.
fn send(address: &str, snapshot: Option<&[u8]>) -> Result<()> {
    let mut stream = TcpStream::connect(address)?;
    let payload = snapshot.unwrap_or_default();
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    match snapshot {
        Some(payload) => info!("donated {} byte state snapshot to {address}", payload.len()),
        None => info!("bypassed state donation to {address}"),
    }
    Ok(())
}
