//! Coalesced write transactions.
//!
//! Callers hand in a closure that performs one logical change. The first
//! caller to arrive waits up to the batch window for others to join, then
//! runs every queued closure inside a single write transaction and commits
//! once. If one closure fails, it is taken out and its caller re-runs it in
//! a transaction of its own while the rest of the batch is retried, so each
//! call still commits or aborts as a unit. Closures may therefore run more
//! than once and must be idempotent.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::store::write_txn;
use crossbeam_channel::{Sender, bounded};
use parking_lot::{Condvar, Mutex};
use redb::{Database, WriteTransaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vmlet_common::BatchConfig;

/// A single logical change applied inside a shared write transaction
pub(crate) type BatchFn = Arc<dyn Fn(&WriteTransaction) -> MetaStoreResult<()> + Send + Sync>;

enum Outcome {
    Done(MetaStoreResult<()>),
    /// The call has to be repeated in a transaction of its own
    RunAlone,
}

struct Call {
    func: BatchFn,
    reply: Sender<Outcome>,
}

pub(crate) struct Batcher {
    pending: Mutex<Vec<Call>>,
    full: Condvar,
    max_size: usize,
    max_delay: Duration,
}

impl Batcher {
    pub(crate) fn new(config: &BatchConfig) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            full: Condvar::new(),
            max_size: config.max_size.max(1),
            max_delay: config.max_delay(),
        }
    }

    /// Run `func` as part of the next batch and wait for its outcome.
    pub(crate) fn run(&self, db: &Database, func: BatchFn) -> MetaStoreResult<()> {
        let (reply, outcome) = bounded(1);
        let leader = {
            let mut pending = self.pending.lock();
            pending.push(Call {
                func: Arc::clone(&func),
                reply,
            });
            if pending.len() >= self.max_size {
                self.full.notify_one();
            }
            pending.len() == 1
        };

        if leader {
            let calls = self.collect();
            commit_batch(db, calls);
        }

        match outcome.recv() {
            Ok(Outcome::Done(result)) => result,
            Ok(Outcome::RunAlone) => write_txn(db, |txn| func(txn)),
            Err(_) => Err(MetaStoreError::BatchAborted),
        }
    }

    /// Wait for the batch window to close or the batch to fill up.
    fn collect(&self) -> Vec<Call> {
        let deadline = Instant::now() + self.max_delay;
        let mut pending = self.pending.lock();
        while pending.len() < self.max_size {
            if self.full.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut *pending)
    }
}

fn commit_batch(db: &Database, mut calls: Vec<Call>) {
    while !calls.is_empty() {
        let mut failed = None;
        let result = write_txn(db, |txn| {
            for (index, call) in calls.iter().enumerate() {
                if let Err(e) = (call.func)(txn) {
                    failed = Some(index);
                    return Err(e);
                }
            }
            Ok(())
        });

        match (result, failed) {
            (Err(e), Some(index)) if calls.len() == 1 => {
                debug!("Batched write {} failed: {}", index, e);
                let call = calls.remove(index);
                let _ = call.reply.send(Outcome::Done(Err(e)));
            }
            (Err(e), Some(index)) => {
                debug!(
                    "Batched write {} of {} failed, re-running it alone: {}",
                    index,
                    calls.len(),
                    e
                );
                let call = calls.swap_remove(index);
                let _ = call.reply.send(Outcome::RunAlone);
            }
            (Ok(()), _) => {
                debug!("Committed batch of {} writes", calls.len());
                for call in calls.drain(..) {
                    let _ = call.reply.send(Outcome::Done(Ok(())));
                }
            }
            (Err(e), None) => {
                warn!(
                    "Batched commit of {} writes failed, re-running each alone: {}",
                    calls.len(),
                    e
                );
                for call in calls.drain(..) {
                    let _ = call.reply.send(Outcome::RunAlone);
                }
            }
        }
    }
}
