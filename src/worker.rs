//! Fixed-size worker pools. Slave workers run the provider's receive loop
//! and apply remote write-sets; master workers generate local transactions
//! once the node is SYNCED.

use crate::error::Error;
use crate::provider::{RecvCtx, Status};
use crate::repl::Cluster;
use crate::store::Store;
use crate::txn;

use log::error;
use std::sync::Arc;
use std::time::Duration;

/// Back-off before retrying a transaction that failed certification or
/// read-view verification.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// The shared context workers run against.
pub struct Context {
    pub store: Arc<Store>,
    pub cluster: Arc<Cluster>,
    /// Operations per master transaction.
    pub operations: usize,
    /// Inter-commit delay per master worker.
    pub delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Slave,
    Master,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Slave => write!(f, "slave"),
            Role::Master => write!(f, "master"),
        }
    }
}

/// A pool of worker threads with a single role.
pub struct Pool {
    role: Role,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Pool {
    /// Spawns `size` workers. If a thread fails to start, the pool is
    /// truncated to the threads started so far.
    pub fn start(ctx: Arc<Context>, role: Role, size: usize) -> Pool {
        let mut threads = Vec::with_capacity(size);
        for id in 0..size {
            let ctx = ctx.clone();
            let name = format!("{role}-{id}");
            let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || match role
            {
                Role::Slave => run_slave(&ctx, id),
                Role::Master => run_master(&ctx, id),
            });
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    error!("failed to start {name}: {err}");
                    break;
                }
            }
        }
        Pool { role, threads }
    }

    /// The number of workers actually started.
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Joins all workers. The caller must have arranged for them to exit:
    /// disconnecting the provider unblocks both roles.
    pub fn stop(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                error!("a {} worker panicked", self.role);
            }
        }
    }
}

/// The slave routine: run the provider's receive loop until disconnect.
/// All the work happens in the apply callback.
fn run_slave(ctx: &Context, id: usize) {
    let mut recv_ctx = RecvCtx::new(id);
    let status = ctx.cluster.provider().recv(&mut recv_ctx);
    if status != Status::Ok {
        error!("slave worker {id} exited: {status}");
    }
}

/// The master routine: wait until the node is SYNCED, then generate and
/// replicate transactions. Certification and read-view failures back off
/// and retry; losing the primary component goes back to waiting for
/// SYNCED; anything else ends the worker.
fn run_master(ctx: &Context, id: usize) {
    while ctx.cluster.wait_synced() {
        loop {
            match txn::execute(&ctx.store, ctx.cluster.provider().as_ref(), id as u64, ctx.operations)
            {
                Ok(()) => {
                    if !ctx.delay.is_zero() {
                        std::thread::sleep(ctx.delay);
                    }
                }
                Err(Error::Serialization) => std::thread::sleep(RETRY_DELAY),
                Err(Error::Disconnected) => break,
                Err(err) => {
                    error!("master worker {id} exited: {err}");
                    return;
                }
            }
        }
    }
}
