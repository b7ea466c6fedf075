//! The statistics loop: samples the provider's counters and the store's
//! read-view failure counter on a fixed period and logs per-period rates.

use crate::provider::Provider;
use crate::store::Store;

use crossbeam::channel::Receiver;
use log::info;
use std::time::{Duration, Instant};

/// The provider counters the node reports, by their provider stat names.
const REPLICATED_BYTES: &str = "replicated_bytes";
const REPLICATED_WS: &str = "replicated";
const RECEIVED_BYTES: &str = "received_bytes";
const RECEIVED_WS: &str = "received";
const CERT_FAILURES: &str = "local_cert_failures";
const FC_PAUSED_NS: &str = "flow_control_paused_ns";

/// One sample of all reported counters.
#[derive(Clone, Copy, Default)]
struct Sample {
    repl_bytes: i64,
    repl_ws: i64,
    recv_bytes: i64,
    recv_ws: i64,
    cert_failures: i64,
    paused_ns: i64,
    read_view_failures: i64,
}

impl Sample {
    fn take(provider: &dyn Provider, store: &Store) -> Self {
        let mut sample = Self::default();
        for var in provider.stats() {
            match var.name.as_str() {
                REPLICATED_BYTES => sample.repl_bytes = var.value,
                REPLICATED_WS => sample.repl_ws = var.value,
                RECEIVED_BYTES => sample.recv_bytes = var.value,
                RECEIVED_WS => sample.recv_ws = var.value,
                CERT_FAILURES => sample.cert_failures = var.value,
                FC_PAUSED_NS => sample.paused_ns = var.value,
                _ => {}
            }
        }
        sample.read_view_failures = store.read_view_failures() as i64;
        sample
    }
}

/// Runs the statistics loop until the shutdown channel is signaled or
/// closed.
pub fn run(provider: &dyn Provider, store: &Store, period: Duration, shutdown: &Receiver<()>) {
    let ticker = crossbeam::channel::tick(period);
    let mut last = Sample::take(provider, store);
    let mut last_at = Instant::now();

    loop {
        crossbeam::select! {
            recv(ticker) -> _ => {}
            recv(shutdown) -> _ => return,
        }
        let sample = Sample::take(provider, store);
        let now = Instant::now();
        print(&last, &sample, now.duration_since(last_at).as_secs_f64());
        last = sample;
        last_at = now;
    }
}

/// Logs the per-period rates between two samples, as a legend line and a
/// value line.
fn print(before: &Sample, after: &Sample, period: f64) {
    let rate = |b: i64, a: i64| ((a - b) as f64 / period) as i64;
    let repl_bytes = rate(before.repl_bytes, after.repl_bytes);
    let repl_ws = rate(before.repl_ws, after.repl_ws);
    let recv_bytes = rate(before.recv_bytes, after.recv_bytes);
    let recv_ws = rate(before.recv_ws, after.recv_ws);
    let cert_failures = rate(before.cert_failures, after.cert_failures);
    let read_view_failures = rate(before.read_view_failures, after.read_view_failures);
    // Nanoseconds paused per second, as a percentage.
    let paused = (after.paused_ns - before.paused_ns) as f64 / period / 1.0e7;

    info!(
        "\n repl(B/s) repl(W/s) recv(B/s) recv(W/s) total(B/s) total(W/s) cert.fail   rv.fail paused(%)\n \
         {:>9} {:>9} {:>9} {:>9} {:>10} {:>10} {:>9} {:>9} {:>9}",
        repl_bytes,
        repl_ws,
        recv_bytes,
        recv_ws,
        repl_bytes + recv_bytes,
        repl_ws + recv_ws,
        cert_failures,
        read_view_failures,
        paused as i64,
    );
}
