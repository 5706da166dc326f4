//! Background consumer feeding committed entries to the state
//! machine.
//!
//! A single task waits for the committed watermark to pass the
//! applied watermark, takes a weak read lock, and applies the span
//! `(last_applied, last_committed]` in index order, advancing the
//! watermark after every successful apply. A failed apply poisons the
//! log and stops the loop; shutdown is cooperative via the log's
//! cancellation token.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::error::{WalError, WalResult};
use crate::lock::{AcquireOptions, LockMode};
use crate::wal::{Entry, EntryContext, WalInner};

/// Consumer of committed entries.
///
/// `apply` is invoked in strict index order, each committed index
/// exactly once relative to the persisted applied watermark. The
/// future completes when the entry has been absorbed; returning an
/// error poisons the log.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: AppliedEntry) -> BoxFuture<'_, WalResult<()>>;

    /// Highest index covered by a state-machine snapshot; bounds how
    /// far prefix compaction may advance. The default places no bound
    /// of its own.
    fn snapshot_index(&self) -> u64 {
        u64::MAX
    }
}

/// One committed entry on its way into the state machine, paired with
/// the volatile context value its append carried, if any.
pub struct AppliedEntry {
    pub entry: Entry,
    pub context: Option<EntryContext>,
}

pub(crate) async fn run(inner: Arc<WalInner>, machine: Arc<dyn StateMachine>) {
    let shutdown = inner.shutdown_token();
    loop {
        if shutdown.is_cancelled() || inner.is_poisoned() || inner.is_closed() {
            return;
        }
        if inner.last_applied() < inner.last_committed() {
            match apply_ready(&inner, machine.as_ref()).await {
                Ok(applied) => {
                    debug!(applied, watermark = inner.last_applied(), "apply batch done");
                    continue;
                }
                Err(err) if err.is_cancellation() => return,
                Err(err) => {
                    error!(error = %err, "state machine apply failed; poisoning log");
                    inner.poison();
                    return;
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = inner.commit_signal().notified() => {}
        }
        // A wake can carry a poison or close notice rather than new
        // commits; recheck before touching the log again.
        if inner.is_poisoned() || inner.is_closed() {
            return;
        }
    }
}

/// Applies everything committed but not yet applied, holding a weak
/// read lock so the span cannot be truncated underneath the loop.
async fn apply_ready(inner: &Arc<WalInner>, machine: &dyn StateMachine) -> WalResult<u64> {
    let _guard = inner
        .locks()
        .acquire_with(
            LockMode::WeakRead,
            AcquireOptions::cancelled_by(inner.shutdown_token()),
        )
        .await?;

    let from = inner.last_applied() + 1;
    let to = inner.last_committed();
    let mut applied = 0u64;
    for index in from..=to {
        // Anything else (flush worker, a failed commit) may poison
        // the log mid-batch; a poisoned log feeds nothing further to
        // the state machine.
        if inner.is_poisoned() || inner.is_closed() {
            return Err(WalError::Cancelled);
        }
        let entry = inner.entry_for_apply(index)?;
        machine.apply(entry).await?;
        inner.finish_apply(index);
        applied += 1;
    }
    Ok(applied)
}
