//! Multi-mode lock coordinating append, read, commit, compaction and
//! disposal.
//!
//! One mutex-guarded state block carries the held counts and a FIFO
//! queue of `(mode, grant channel)` waiters. A release wakes the
//! longest compatible prefix of the queue, which keeps acquisitions
//! fair and prevents writer starvation. Every suspending acquisition
//! accepts a cancellation token and a bounded timeout; abandoning a
//! wait removes the waiter (or releases a grant that raced in) and
//! leaves the lock state unchanged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{WalError, WalResult};

/// Lock modes, from weakest to strongest.
///
/// Compatibility (rows = held, columns = requested):
///
/// |     | WR  | SR  | W   | Cmp | Ex  |
/// |-----|-----|-----|-----|-----|-----|
/// | WR  | yes | yes | yes | yes | no  |
/// | SR  | yes | yes | no  | no  | no  |
/// | W   | yes | no  | no  | yes | no  |
/// | Cmp | yes | no  | yes | no  | no  |
/// | Ex  | no  | no  | no  | no  | no  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Many readers, compatible with one writer; readers see the
    /// prefix up to `last_entry` at acquisition.
    WeakRead,
    /// Read consistent with commit boundaries; blocks writers.
    StrongRead,
    /// The single appender.
    Write,
    /// Prefix compaction; excludes other compactors and strong
    /// readers but runs alongside the appender.
    Compaction,
    /// Excludes everything; drop and dispose.
    Exclusive,
}

fn admits(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match (held, requested) {
        (WeakRead, Exclusive) => false,
        (WeakRead, _) => true,
        (StrongRead, WeakRead) | (StrongRead, StrongRead) => true,
        (StrongRead, _) => false,
        (Write, WeakRead) | (Write, Compaction) => true,
        (Write, _) => false,
        (Compaction, WeakRead) | (Compaction, Write) => true,
        (Compaction, _) => false,
        (Exclusive, _) => false,
    }
}

#[derive(Default)]
struct Held {
    weak_readers: usize,
    strong_readers: usize,
    writers: usize,
    compactors: usize,
    exclusive: usize,
}

impl Held {
    fn admits(&self, requested: LockMode) -> bool {
        (self.weak_readers == 0 || admits(LockMode::WeakRead, requested))
            && (self.strong_readers == 0 || admits(LockMode::StrongRead, requested))
            && (self.writers == 0 || admits(LockMode::Write, requested))
            && (self.compactors == 0 || admits(LockMode::Compaction, requested))
            && (self.exclusive == 0 || admits(LockMode::Exclusive, requested))
    }

    fn reader_count(&self) -> usize {
        self.weak_readers + self.strong_readers
    }

    fn slot(&mut self, mode: LockMode) -> &mut usize {
        match mode {
            LockMode::WeakRead => &mut self.weak_readers,
            LockMode::StrongRead => &mut self.strong_readers,
            LockMode::Write => &mut self.writers,
            LockMode::Compaction => &mut self.compactors,
            LockMode::Exclusive => &mut self.exclusive,
        }
    }

    fn grant(&mut self, mode: LockMode) {
        *self.slot(mode) += 1;
    }

    fn release(&mut self, mode: LockMode) {
        let slot = self.slot(mode);
        debug_assert!(*slot > 0, "release of unheld {mode:?} lock");
        *slot = slot.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Lock(LockMode),
    /// Pseudo-acquisition that completes once every currently held
    /// read lock has been released; holds nothing afterwards.
    Barrier,
}

struct Waiter {
    ticket: u64,
    request: Request,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct LockState {
    held: Held,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn grantable(&self, request: Request) -> bool {
        match request {
            Request::Lock(mode) => self.held.admits(mode),
            Request::Barrier => self.held.reader_count() == 0,
        }
    }

    /// Grants the longest grantable prefix of the queue.
    fn pump(&mut self) {
        while let Some(front) = self.queue.front() {
            if !self.grantable(front.request) {
                break;
            }
            let waiter = match self.queue.pop_front() {
                Some(waiter) => waiter,
                None => break,
            };
            if let Request::Lock(mode) = waiter.request {
                self.held.grant(mode);
            }
            // A failed send means the receiver was dropped mid-wait;
            // its abandon call observes the waiter gone from the
            // queue and releases this grant, so it stays in place
            // here. Exactly one side undoes it.
            let _ = waiter.tx.send(());
        }
    }
}

enum Acquisition {
    Granted,
    Pending { ticket: u64, rx: oneshot::Receiver<()> },
}

/// Cancellation and timeout controls for a suspending acquisition.
#[derive(Default, Clone)]
pub struct AcquireOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    pub fn cancelled_by(token: &CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(token.clone()),
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }
}

/// FIFO-fair multi-mode lock.
pub struct LockManager {
    shared: Arc<Mutex<LockState>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(LockState::default())),
        }
    }

    /// Acquires `mode`, waiting as long as it takes.
    pub async fn acquire(&self, mode: LockMode) -> WalResult<LockGuard> {
        self.acquire_with(mode, AcquireOptions::default()).await
    }

    /// Acquires `mode` subject to the given timeout and cancellation.
    pub async fn acquire_with(
        &self,
        mode: LockMode,
        options: AcquireOptions,
    ) -> WalResult<LockGuard> {
        match self.enqueue(Request::Lock(mode)) {
            Acquisition::Granted => Ok(self.guard(mode)),
            Acquisition::Pending { ticket, rx } => {
                self.wait(Request::Lock(mode), ticket, rx, options).await?;
                Ok(self.guard(mode))
            }
        }
    }

    /// Completes once all read locks held at the call have been
    /// released and no earlier-queued strong read is still pending.
    pub async fn read_barrier(&self) -> WalResult<()> {
        self.read_barrier_with(AcquireOptions::default()).await
    }

    pub async fn read_barrier_with(&self, options: AcquireOptions) -> WalResult<()> {
        match self.enqueue(Request::Barrier) {
            Acquisition::Granted => Ok(()),
            Acquisition::Pending { ticket, rx } => {
                self.wait(Request::Barrier, ticket, rx, options).await
            }
        }
    }

    fn guard(&self, mode: LockMode) -> LockGuard {
        LockGuard {
            shared: Arc::clone(&self.shared),
            mode,
        }
    }

    fn enqueue(&self, request: Request) -> Acquisition {
        let mut state = self.shared.lock();
        if state.queue.is_empty() && state.grantable(request) {
            if let Request::Lock(mode) = request {
                state.held.grant(mode);
            }
            return Acquisition::Granted;
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        state.queue.push_back(Waiter {
            ticket,
            request,
            tx,
        });
        Acquisition::Pending { ticket, rx }
    }

    async fn wait(
        &self,
        request: Request,
        ticket: u64,
        rx: oneshot::Receiver<()>,
        options: AcquireOptions,
    ) -> WalResult<()> {
        // Abandons the waiter if this future is dropped mid-wait
        // (caller-side select, cancellation, timeout); a grant that
        // raced the abandonment is released again inside `abandon`.
        let mut abort = WaitAbort {
            manager: self,
            request,
            ticket,
            armed: true,
        };

        let cancelled = async {
            match options.cancel.as_ref() {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let timed_out = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            granted = rx => {
                match granted {
                    Ok(()) => {
                        abort.armed = false;
                        Ok(())
                    }
                    Err(_) => {
                        abort.armed = false;
                        Err(WalError::internal("lock grant channel dropped"))
                    }
                }
            }
            _ = cancelled => Err(WalError::Cancelled),
            _ = timed_out => Err(WalError::Timeout("lock acquisition")),
        }
    }

    /// Backs out of a pending wait. When the grant raced the
    /// abandonment, the granted lock is released again so the state
    /// stays balanced.
    fn abandon(&self, request: Request, ticket: u64) {
        let mut state = self.shared.lock();
        if let Some(position) = state.queue.iter().position(|w| w.ticket == ticket) {
            state.queue.remove(position);
            state.pump();
            return;
        }
        if let Request::Lock(mode) = request {
            state.held.release(mode);
            state.pump();
        }
    }

    #[cfg(test)]
    fn held_snapshot(&self) -> (usize, usize, usize, usize, usize) {
        let state = self.shared.lock();
        (
            state.held.weak_readers,
            state.held.strong_readers,
            state.held.writers,
            state.held.compactors,
            state.held.exclusive,
        )
    }
}

struct WaitAbort<'a> {
    manager: &'a LockManager,
    request: Request,
    ticket: u64,
    armed: bool,
}

impl Drop for WaitAbort<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(self.request, self.ticket);
        }
    }
}

/// RAII lock hold; releasing wakes the longest compatible queue
/// prefix.
pub struct LockGuard {
    shared: Arc<Mutex<LockState>>,
    mode: LockMode,
}

impl LockGuard {
    #[inline]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("mode", &self.mode).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.held.release(self.mode);
        state.pump();
    }
}
