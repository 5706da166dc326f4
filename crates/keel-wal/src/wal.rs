use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::addr::AddressSpace;
use crate::apply::{self, AppliedEntry, StateMachine};
use crate::config::{NodeId, PageId, WalConfig};
use crate::error::{WalError, WalResult};
use crate::fs::Layout;
use crate::index::{EntryIndex, FLAG_SNAPSHOT, IndexRecord};
use crate::lock::{AcquireOptions, LockManager, LockMode};
use crate::meta::{MetadataRecord, MetadataStore};
use crate::page::PageStore;

/// Opaque in-memory tag attached to an append and handed back to the
/// state machine at apply time. Never persisted.
pub type EntryContext = Arc<dyn Any + Send + Sync>;

/// One log entry as readers and the apply loop see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: u64,
    pub term: u64,
    /// Wall-clock nanoseconds recorded at append.
    pub timestamp: i64,
    pub payload: Vec<u8>,
    pub is_snapshot: bool,
}

/// Extras for a single append.
#[derive(Default, Clone)]
pub struct AppendOptions {
    pub context: Option<EntryContext>,
    pub snapshot: bool,
}

/// One element of an `append_range` batch.
pub struct AppendEntry {
    pub term: u64,
    pub payload: Vec<u8>,
    pub context: Option<EntryContext>,
    pub snapshot: bool,
}

impl AppendEntry {
    pub fn new(term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            payload: payload.into(),
            context: None,
            snapshot: false,
        }
    }
}

/// Read lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Runs alongside the appender; sees the prefix captured at
    /// acquisition.
    #[default]
    Weak,
    /// Blocks writers; consistent with commit boundaries.
    Strong,
}

/// Result of a range read.
#[derive(Debug, Clone)]
pub struct ReadBatch {
    /// Set when the batch starts at an installed snapshot entry
    /// rather than the requested index.
    pub snapshot_index: Option<u64>,
    pub entries: Vec<Entry>,
}

/// Point-in-time counters from the durability pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalMetricsSnapshot {
    pub appends: u64,
    pub commits: u64,
    pub synchronous_flushes: u64,
    pub interval_flushes: u64,
    pub retry_attempts: u64,
    pub flush_failures: u64,
}

#[derive(Default)]
struct WalMetrics {
    appends: AtomicU64,
    commits: AtomicU64,
    synchronous_flushes: AtomicU64,
    interval_flushes: AtomicU64,
    retry_attempts: AtomicU64,
    flush_failures: AtomicU64,
}

impl WalMetrics {
    fn snapshot(&self) -> WalMetricsSnapshot {
        WalMetricsSnapshot {
            appends: self.appends.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            synchronous_flushes: self.synchronous_flushes.load(Ordering::Relaxed),
            interval_flushes: self.interval_flushes.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
        }
    }
}

/// Watermarks and sizing for introspection.
#[derive(Debug, Clone, Copy)]
pub struct WalStats {
    pub first_index: u64,
    pub last_entry: u64,
    pub last_committed: u64,
    pub last_applied: u64,
    pub tail_address: u64,
    pub durable_address: u64,
    pub resident_pages: usize,
    pub metrics: WalMetricsSnapshot,
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

const FLUSH_RETRY_MAX_ATTEMPTS: u32 = 5;
const FLUSH_RETRY_BASE_DELAY_MS: u64 = 5;
const FLUSH_RETRY_MAX_DELAY_MS: u64 = 250;

fn retry_backoff_delay(retries: u32) -> Duration {
    let shift = retries.saturating_sub(1).min(6);
    let delay = FLUSH_RETRY_BASE_DELAY_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(FLUSH_RETRY_MAX_DELAY_MS))
}

fn is_retryable_io_error(err: &std::io::Error) -> bool {
    if matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ETIMEDOUT)
    )
}

fn is_retryable_error(err: &WalError) -> bool {
    match err {
        WalError::Io(io_err) => is_retryable_io_error(io_err),
        WalError::IoAt { source, .. } => is_retryable_io_error(source),
        _ => false,
    }
}

pub(crate) struct WalInner {
    config: WalConfig,
    layout: Layout,
    space: AddressSpace,
    index: RwLock<EntryIndex>,
    meta: Mutex<MetadataStore>,
    locks: LockManager,
    last_entry: AtomicU64,
    last_committed: AtomicU64,
    last_applied: AtomicU64,
    tail_address: AtomicU64,
    durable_address: AtomicU64,
    contexts: Mutex<HashMap<u64, EntryContext>>,
    /// Serializes the blocking durable work itself; the interval
    /// worker takes this directly, bypassing the async gate.
    durability_serial: Mutex<()>,
    commit_signal: Notify,
    applied_tx: watch::Sender<u64>,
    metrics: WalMetrics,
    poisoned: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
    /// Serializes every durable step: range flushes, metadata
    /// replacement, vote persistence.
    flush_gate: tokio::sync::Mutex<()>,
    #[cfg(test)]
    flush_fail_injections: AtomicU64,
}

impl WalInner {
    #[inline]
    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[inline]
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[inline]
    pub(crate) fn commit_signal(&self) -> &Notify {
        &self.commit_signal
    }

    #[inline]
    pub(crate) fn last_entry(&self) -> u64 {
        self.last_entry.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn last_committed(&self) -> u64 {
        self.last_committed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self) -> WalResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        if self.poisoned.load(Ordering::Acquire) {
            return Err(WalError::Poisoned);
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            warn!("write-ahead log poisoned; only close() is allowed now");
            // Wake apply waiters so they observe the poisoned state.
            self.applied_tx.send_modify(|_| {});
            self.commit_signal.notify_waiters();
        }
    }

    fn out_of_range(&self, index: u64) -> WalError {
        WalError::OutOfRange {
            index,
            first: self.index.read().first_index(),
            last: self.last_entry(),
        }
    }

    /// Payload bytes of entry `index` plus its record.
    fn load_entry(&self, index: u64, record: IndexRecord) -> WalResult<Entry> {
        let payload = self.space.read_vec(record.address, record.length as usize)?;
        Ok(Entry {
            index,
            term: record.term,
            timestamp: record.timestamp,
            payload,
            is_snapshot: record.is_snapshot(),
        })
    }

    pub(crate) fn entry_for_apply(&self, index: u64) -> WalResult<AppliedEntry> {
        let record = self
            .index
            .read()
            .lookup(index)
            .ok_or_else(|| self.out_of_range(index))?;
        let entry = self.load_entry(index, record)?;
        let context = self.contexts.lock().get(&index).cloned();
        Ok(AppliedEntry { entry, context })
    }

    pub(crate) fn finish_apply(&self, index: u64) {
        self.contexts.lock().remove(&index);
        self.last_applied.store(index, Ordering::Release);
        self.applied_tx.send_replace(index);
    }

    /// Appends one entry at the tail. Caller holds the write lock.
    fn do_append(
        &self,
        term: u64,
        payload: &[u8],
        context: Option<EntryContext>,
        snapshot: bool,
    ) -> WalResult<u64> {
        if payload.is_empty() {
            return Err(WalError::invalid_state("entry payload is empty"));
        }
        let address = self.tail_address.load(Ordering::Acquire);
        self.space.write(address, payload)?;
        let record = IndexRecord {
            address,
            length: payload.len() as u32,
            term,
            timestamp: now_nanos(),
            flags: if snapshot { FLAG_SNAPSHOT } else { 0 },
        };
        let index = self.index.write().append(record)?;
        if let Some(context) = context {
            self.contexts.lock().insert(index, context);
        }
        self.tail_address
            .store(record.end_address(), Ordering::Release);
        self.last_entry.store(index, Ordering::Release);
        self.metrics.appends.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Discards every entry at and above `from`. Caller holds the
    /// write or exclusive lock and has drained readers.
    fn truncate_suffix(&self, from: u64) -> WalResult<u64> {
        let new_tail = {
            let index = self.index.read();
            match index.lookup(from) {
                Some(record) => record.address,
                None => return Ok(0),
            }
        };
        let dropped = self.index.write().truncate_suffix(from)?;
        self.last_entry.store(from - 1, Ordering::Release);
        self.tail_address.store(new_tail, Ordering::Release);
        self.durable_address.fetch_min(new_tail, Ordering::AcqRel);
        self.space.reset_tail();
        self.contexts.lock().retain(|index, _| *index < from);
        Ok(dropped)
    }

    /// End address of entry `index`; the flush target for a commit at
    /// that index.
    fn end_address_of(&self, index: u64) -> WalResult<u64> {
        if index == 0 {
            return Ok(0);
        }
        self.index
            .read()
            .lookup(index)
            .map(|record| record.end_address())
            .ok_or_else(|| self.out_of_range(index))
    }

    #[cfg(test)]
    fn take_injected_flush_failure(&self) -> Option<WalError> {
        let mut remaining = self.flush_fail_injections.load(Ordering::Acquire);
        while remaining > 0 {
            match self.flush_fail_injections.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(WalError::Io(std::io::Error::from_raw_os_error(libc::EINTR)));
                }
                Err(current) => remaining = current,
            }
        }
        None
    }

    fn flush_attempt(&self, from: u64, to: u64) -> WalResult<()> {
        #[cfg(test)]
        if let Some(err) = self.take_injected_flush_failure() {
            return Err(err);
        }
        self.space.store().flush_bytes(from, to)?;
        self.index.read().sync()
    }

    /// Makes `[durable_address, target)` durable, retrying transient
    /// errors with bounded backoff. A terminal failure poisons the
    /// log.
    fn blocking_flush_to(&self, target: u64) -> WalResult<()> {
        let durable = self.durable_address.load(Ordering::Acquire);
        if target <= durable {
            return Ok(());
        }
        let mut retries = 0u32;
        loop {
            match self.flush_attempt(durable, target) {
                Ok(()) => {
                    if retries > 0 {
                        debug!(retries, target, "flush succeeded after retries");
                    }
                    self.durable_address.fetch_max(target, Ordering::AcqRel);
                    return Ok(());
                }
                Err(err) if retries < FLUSH_RETRY_MAX_ATTEMPTS && is_retryable_error(&err) => {
                    retries += 1;
                    self.metrics.retry_attempts.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt = retries, error = %err, "retrying flush");
                    thread::sleep(retry_backoff_delay(retries));
                }
                Err(err) => {
                    self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                    error!(retries, error = %err, "flush failed; poisoning log");
                    self.poison();
                    return Err(err);
                }
            }
        }
    }

    /// Rewrites the metadata record with the current watermarks.
    /// Failures poison the log: a lost metadata write invalidates the
    /// committed watermark's durability.
    fn persist_metadata(&self) -> WalResult<()> {
        let mut meta = self.meta.lock();
        let current = meta.record();
        let record = MetadataRecord {
            term: current.term,
            voted_for: current.voted_for,
            last_committed: self.last_committed(),
            last_applied: self.last_applied(),
        };
        if record == current {
            return Ok(());
        }
        meta.store(record).inspect_err(|err| {
            self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "metadata persistence failed; poisoning log");
            self.poison();
        })
    }

    /// The blocking durable step shared by commit, flush and the
    /// interval worker: pages and index first, then metadata.
    fn blocking_durability(&self, target: u64) -> WalResult<()> {
        let _serial = self.durability_serial.lock();
        self.blocking_flush_to(target)?;
        self.persist_metadata()
    }

    /// Commit's durable step: flush the covered range, advance the
    /// watermark, persist it. Returns the previous watermark.
    fn blocking_commit(&self, flush_to: u64, target: u64) -> WalResult<u64> {
        let _serial = self.durability_serial.lock();
        self.blocking_flush_to(flush_to)?;
        let previous = self.last_committed.fetch_max(target, Ordering::AcqRel);
        self.persist_metadata()?;
        Ok(previous)
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

enum WorkerCommand {
    Shutdown,
}

/// Background interval flusher, one dedicated thread per log.
struct FlushWorker {
    tx: Sender<WorkerCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FlushWorker {
    fn spawn(inner: Arc<WalInner>, period: Duration) -> Self {
        let (tx, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("keel-wal-flush".to_string())
            .spawn(move || Self::worker_loop(inner, rx, period))
            .ok();
        Self { tx, handle }
    }

    fn worker_loop(inner: Arc<WalInner>, rx: Receiver<WorkerCommand>, period: Duration) {
        loop {
            match rx.recv_timeout(period) {
                Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if inner.is_closed() || inner.is_poisoned() {
                        continue;
                    }
                    let target = inner.tail_address.load(Ordering::Acquire);
                    if target <= inner.durable_address.load(Ordering::Acquire) {
                        continue;
                    }
                    inner
                        .metrics
                        .interval_flushes
                        .fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = inner.blocking_durability(target) {
                        error!(error = %err, "interval flush failed");
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Durable, crash-safe log of term-stamped entries with a committed
/// watermark, an apply pipeline and prefix compaction.
///
/// A `Wal` is cheap to share (`Arc` inside); one appender at a time
/// extends it while readers run concurrently under the lock manager's
/// discipline.
pub struct Wal {
    inner: Arc<WalInner>,
    flusher: Mutex<Option<FlushWorker>>,
}

impl fmt::Debug for Wal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wal").finish_non_exhaustive()
    }
}

impl Wal {
    /// Opens or recovers the log at `config.root_dir` without an
    /// attached state machine; `wait_for_apply` will only observe
    /// progress persisted by earlier runs.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        Self::open_inner(config, None)
    }

    /// Opens the log and starts the apply loop over `machine`.
    /// Requires an ambient tokio runtime.
    pub fn open_with_state_machine(
        config: WalConfig,
        machine: Arc<dyn StateMachine>,
    ) -> WalResult<Self> {
        Self::open_inner(config, Some(machine))
    }

    fn open_inner(config: WalConfig, machine: Option<Arc<dyn StateMachine>>) -> WalResult<Self> {
        let config = config.normalized();
        let layout = Layout::new(&config);
        layout.ensure()?;

        let meta = MetadataStore::load_or_init(&layout)?;
        let record = meta.record();

        let store = Arc::new(PageStore::open(layout.clone(), &config)?);
        let allocated_end = store
            .highest_page()?
            .map(|page| (page.as_u64() + 1) * config.chunk_size)
            .unwrap_or(0);
        let space = AddressSpace::new(store);

        let (index, report) = EntryIndex::open(&layout, allocated_end)?;
        let last_entry = index.last_index();
        if record.last_committed > last_entry {
            return Err(WalError::integrity(format!(
                "metadata commits up to {} but only {} entries were recovered",
                record.last_committed, last_entry
            )));
        }
        if record.last_applied > record.last_committed {
            return Err(WalError::integrity(format!(
                "metadata applied watermark {} exceeds committed watermark {}",
                record.last_applied, record.last_committed
            )));
        }

        let tail_address = index
            .lookup(last_entry)
            .map(|entry| entry.end_address())
            .unwrap_or(0);

        info!(
            root = %layout.root_dir().display(),
            entries = report.recovered,
            first = index.first_index(),
            last = last_entry,
            committed = record.last_committed,
            applied = record.last_applied,
            truncated_tail = report.truncated,
            "write-ahead log recovered"
        );

        let (applied_tx, _applied_rx) = watch::channel(record.last_applied);
        let inner = Arc::new(WalInner {
            layout,
            space,
            index: RwLock::new(index),
            meta: Mutex::new(meta),
            locks: LockManager::new(),
            last_entry: AtomicU64::new(last_entry),
            last_committed: AtomicU64::new(record.last_committed),
            last_applied: AtomicU64::new(record.last_applied),
            tail_address: AtomicU64::new(tail_address),
            durable_address: AtomicU64::new(tail_address),
            contexts: Mutex::new(HashMap::with_capacity(config.concurrency_level)),
            durability_serial: Mutex::new(()),
            commit_signal: Notify::new(),
            applied_tx,
            metrics: WalMetrics::default(),
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            flush_gate: tokio::sync::Mutex::new(()),
            #[cfg(test)]
            flush_fail_injections: AtomicU64::new(0),
            config,
        });

        let flusher = inner
            .config
            .flush_interval
            .period()
            .map(|period| FlushWorker::spawn(Arc::clone(&inner), period));

        if let Some(machine) = machine {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                WalError::invalid_state("a state machine requires an ambient tokio runtime")
            })?;
            handle.spawn(apply::run(Arc::clone(&inner), machine));
        }

        Ok(Self {
            inner,
            flusher: Mutex::new(flusher),
        })
    }

    pub fn config(&self) -> &WalConfig {
        &self.inner.config
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    #[inline]
    pub fn last_entry(&self) -> u64 {
        self.inner.last_entry()
    }

    #[inline]
    pub fn last_committed(&self) -> u64 {
        self.inner.last_committed()
    }

    #[inline]
    pub fn last_applied(&self) -> u64 {
        self.inner.last_applied()
    }

    #[inline]
    pub fn first_index(&self) -> u64 {
        self.inner.index.read().first_index()
    }

    pub fn term(&self) -> u64 {
        self.inner.meta.lock().record().term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.meta.lock().record().voted_for.as_option()
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.is_poisoned()
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            first_index: self.first_index(),
            last_entry: self.last_entry(),
            last_committed: self.last_committed(),
            last_applied: self.last_applied(),
            tail_address: self.inner.tail_address.load(Ordering::Acquire),
            durable_address: self.inner.durable_address.load(Ordering::Acquire),
            resident_pages: self.inner.space.store().page_count(),
            metrics: self.inner.metrics.snapshot(),
        }
    }

    /// Appends one entry and returns its index.
    pub async fn append(&self, term: u64, payload: &[u8]) -> WalResult<u64> {
        self.append_with(term, payload, AppendOptions::default(), AcquireOptions::default())
            .await
    }

    pub async fn append_with(
        &self,
        term: u64,
        payload: &[u8],
        options: AppendOptions,
        acquire: AcquireOptions,
    ) -> WalResult<u64> {
        let _guard = self
            .inner
            .locks
            .acquire_with(LockMode::Write, acquire)
            .await?;
        self.inner.ensure_live()?;
        self.inner
            .do_append(term, payload, options.context, options.snapshot)
    }

    /// Appends `entries` starting at `start_index`, overwriting any
    /// uncommitted suffix there. Returns the last appended index.
    pub async fn append_range(
        &self,
        entries: Vec<AppendEntry>,
        start_index: u64,
    ) -> WalResult<u64> {
        self.append_range_with(entries, start_index, AcquireOptions::default())
            .await
    }

    pub async fn append_range_with(
        &self,
        entries: Vec<AppendEntry>,
        start_index: u64,
        acquire: AcquireOptions,
    ) -> WalResult<u64> {
        {
            let _guard = self
                .inner
                .locks
                .acquire_with(LockMode::Write, acquire.clone())
                .await?;
            self.inner.ensure_live()?;
            self.validate_start_index(start_index)?;

            if start_index > self.inner.last_entry() {
                // Pure extension; runs alongside weak readers.
                let mut last = start_index - 1;
                for entry in entries {
                    last = self.inner.do_append(
                        entry.term,
                        &entry.payload,
                        entry.context,
                        entry.snapshot,
                    )?;
                }
                return Ok(last);
            }
        }

        // Overwriting an uncommitted suffix rewrites bytes a weak
        // reader could be iterating, so the destructive path upgrades
        // to the exclusive mode and revalidates once it is alone.
        let _guard = self
            .inner
            .locks
            .acquire_with(LockMode::Exclusive, acquire)
            .await?;
        self.inner.ensure_live()?;
        self.validate_start_index(start_index)?;

        if start_index <= self.inner.last_entry() {
            self.inner.truncate_suffix(start_index)?;
        }
        let mut last = start_index - 1;
        for entry in entries {
            last = self
                .inner
                .do_append(entry.term, &entry.payload, entry.context, entry.snapshot)?;
        }
        Ok(last)
    }

    fn validate_start_index(&self, start_index: u64) -> WalResult<()> {
        let last_committed = self.inner.last_committed();
        if start_index == 0 || start_index <= last_committed {
            return Err(WalError::OverwriteCommitted {
                index: start_index,
                last_committed,
            });
        }
        if start_index > self.inner.last_entry() + 1 {
            return Err(self.inner.out_of_range(start_index));
        }
        Ok(())
    }

    /// Reads the contiguous entries in `[from..to]` under a weak read
    /// lock.
    pub async fn read(&self, from: u64, to: u64) -> WalResult<ReadBatch> {
        self.read_with(from, to, ReadMode::Weak, AcquireOptions::default())
            .await
    }

    pub async fn read_with(
        &self,
        from: u64,
        to: u64,
        mode: ReadMode,
        acquire: AcquireOptions,
    ) -> WalResult<ReadBatch> {
        let lock_mode = match mode {
            ReadMode::Weak => LockMode::WeakRead,
            ReadMode::Strong => LockMode::StrongRead,
        };
        let _guard = self.inner.locks.acquire_with(lock_mode, acquire).await?;
        self.inner.ensure_live()?;

        // Bounds captured once; a concurrent append extends the log
        // without disturbing this call.
        let last = self.inner.last_entry();
        if from == 0 || from > last {
            return Err(self.inner.out_of_range(from));
        }

        let index = self.inner.index.read();
        let first = index.first_index();
        let mut snapshot_index = None;
        let start = if from < first {
            match index.lookup(first) {
                Some(record) if record.is_snapshot() => {
                    snapshot_index = Some(first);
                    first
                }
                _ => return Err(WalError::OutOfRange {
                    index: from,
                    first,
                    last,
                }),
            }
        } else {
            from
        };

        let to = to.min(last);
        let mut entries = Vec::with_capacity((to.saturating_sub(start) + 1) as usize);
        for (entry_index, record) in index.range(start, to) {
            entries.push(self.inner.load_entry(entry_index, record)?);
        }
        Ok(ReadBatch {
            snapshot_index,
            entries,
        })
    }

    /// Advances the committed watermark to `min(up_to, last_entry)`
    /// after making the covered entries durable, then persists
    /// metadata. Returns the number of newly committed entries.
    pub async fn commit(&self, up_to: u64) -> WalResult<u64> {
        self.commit_with(up_to, AcquireOptions::default()).await
    }

    pub async fn commit_with(&self, up_to: u64, acquire: AcquireOptions) -> WalResult<u64> {
        // StrongRead keeps writers (and their suffix truncations) out
        // while the commit point is chosen and persisted.
        let _guard = self
            .inner
            .locks
            .acquire_with(LockMode::StrongRead, acquire.clone())
            .await?;
        self.inner.ensure_live()?;

        let target = up_to.min(self.inner.last_entry());
        let current = self.inner.last_committed();
        if target <= current {
            return Ok(0);
        }

        let flush_to = self.inner.end_address_of(target)?;
        let previous = {
            let _gate = self.inner.flush_gate.lock().await;
            if let Some(token) = acquire.cancel.as_ref() {
                if token.is_cancelled() {
                    return Err(WalError::Cancelled);
                }
            }
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.blocking_commit(flush_to, target))
                .await
                .map_err(|err| WalError::internal(format!("commit task failed: {err}")))??
        };

        self.inner.metrics.commits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .synchronous_flushes
            .fetch_add(1, Ordering::Relaxed);
        self.inner.commit_signal.notify_one();
        Ok(target.saturating_sub(previous))
    }

    /// Durably records the voter state. Term regressions are
    /// rejected.
    pub async fn save_vote(&self, term: u64, voted_for: Option<NodeId>) -> WalResult<()> {
        self.inner.ensure_live()?;
        let _gate = self.inner.flush_gate.lock().await;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut meta = inner.meta.lock();
            let current = meta.record();
            if term < current.term {
                return Err(WalError::invalid_state(format!(
                    "term {} regresses below persisted term {}",
                    term, current.term
                )));
            }
            meta.store(MetadataRecord {
                term,
                voted_for: NodeId::from(voted_for),
                ..current
            })
            .inspect_err(|err| {
                error!(error = %err, "vote persistence failed; poisoning log");
                inner.poison();
            })
        })
        .await
        .map_err(|err| WalError::internal(format!("vote task failed: {err}")))?
    }

    /// Completes once `last_applied >= index`.
    pub async fn wait_for_apply(&self, index: u64) -> WalResult<()> {
        self.wait_for_apply_with(index, AcquireOptions::default())
            .await
    }

    pub async fn wait_for_apply_with(
        &self,
        index: u64,
        options: AcquireOptions,
    ) -> WalResult<()> {
        let mut rx = self.inner.applied_tx.subscribe();
        loop {
            if *rx.borrow_and_update() >= index {
                return Ok(());
            }
            self.inner.ensure_live()?;
            let cancelled = async {
                match options.cancel.as_ref() {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| WalError::Closed)?;
                }
                _ = cancelled => return Err(WalError::Cancelled),
            }
        }
    }

    /// Forces page and metadata durability up to the current tail.
    /// Serialized against other flushes; concurrent readers are
    /// unaffected.
    pub async fn flush(&self) -> WalResult<()> {
        self.inner.ensure_live()?;
        let target = self.inner.tail_address.load(Ordering::Acquire);
        let _gate = self.inner.flush_gate.lock().await;
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.blocking_durability(target))
            .await
            .map_err(|err| WalError::internal(format!("flush task failed: {err}")))??;
        self.inner
            .metrics
            .synchronous_flushes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Truncates the uncommitted suffix starting at `from_index`.
    /// With `reuse_space` the freed pages stay allocated for the next
    /// appends; otherwise pages past the new tail are deleted.
    pub async fn drop_from(&self, from_index: u64, reuse_space: bool) -> WalResult<u64> {
        self.drop_from_with(from_index, reuse_space, AcquireOptions::default())
            .await
    }

    pub async fn drop_from_with(
        &self,
        from_index: u64,
        reuse_space: bool,
        acquire: AcquireOptions,
    ) -> WalResult<u64> {
        let _guard = self
            .inner
            .locks
            .acquire_with(LockMode::Exclusive, acquire)
            .await?;
        self.inner.ensure_live()?;

        let last_committed = self.inner.last_committed();
        if from_index == 0 || from_index <= last_committed {
            return Err(WalError::OverwriteCommitted {
                index: from_index,
                last_committed,
            });
        }
        if from_index > self.inner.last_entry() {
            return Ok(0);
        }

        let dropped = self.inner.truncate_suffix(from_index)?;
        if !reuse_space {
            let new_tail = self.inner.tail_address.load(Ordering::Acquire);
            let store = self.inner.space.store();
            let removed = if new_tail == 0 {
                store.delete_pages_below(PageId::new(u32::MAX))?
            } else {
                store.delete_pages_above(self.inner.space.page_of(new_tail - 1))?
            };
            debug!(removed, "suffix drop released pages");
        }
        Ok(dropped)
    }

    /// Compacts the applied prefix: drops index records below the
    /// compaction bound and deletes pages wholly below the first
    /// retained entry. Returns the number of deleted pages.
    pub async fn compact(&self) -> WalResult<u64> {
        self.compact_with(AcquireOptions::default()).await
    }

    pub async fn compact_with(&self, acquire: AcquireOptions) -> WalResult<u64> {
        let _guard = self
            .inner
            .locks
            .acquire_with(LockMode::Compaction, acquire)
            .await?;
        self.inner.ensure_live()?;

        let bound = self.inner.last_applied();
        if bound == 0 {
            return Ok(0);
        }

        // The applied anchor must be durable before the entries below
        // it disappear.
        {
            let _gate = self.inner.flush_gate.lock().await;
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.persist_metadata())
                .await
                .map_err(|err| WalError::internal(format!("compaction task failed: {err}")))??;
        }

        let boundary = {
            let mut index = self.inner.index.write();
            let dropped = index.truncate_prefix(bound)?;
            if dropped == 0 {
                return Ok(0);
            }
            index
                .lookup(bound)
                .map(|record| record.address)
                .unwrap_or_default()
        };

        let removed = self
            .inner
            .space
            .store()
            .delete_pages_below(self.inner.space.page_of(boundary))?;
        info!(bound, removed, "compacted applied prefix");
        Ok(removed as u64)
    }

    /// Stops the apply loop and the interval flusher, drains every
    /// lock holder, makes the tail durable and closes the log. Later
    /// operations fail with `Closed`.
    pub async fn close(&self) -> WalResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.cancel();
        // Drain in-flight readers, then exclude everything for the
        // final durable pass.
        self.inner.locks.read_barrier().await?;
        let _guard = self.inner.locks.acquire(LockMode::Exclusive).await?;

        if let Some(mut worker) = self.flusher.lock().take() {
            worker.shutdown();
        }

        if !self.inner.is_poisoned() {
            let target = self.inner.tail_address.load(Ordering::Acquire);
            let _gate = self.inner.flush_gate.lock().await;
            let inner = Arc::clone(&self.inner);
            tokio::task::spawn_blocking(move || inner.blocking_durability(target))
                .await
                .map_err(|err| WalError::internal(format!("close task failed: {err}")))??;
        }
        // Wake apply waiters so they observe the closed state.
        self.inner.applied_tx.send_modify(|_| {});
        Ok(())
    }

    pub fn metrics(&self) -> WalMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn inject_flush_errors(&self, count: u64) {
        self.inner
            .flush_fail_injections
            .store(count, Ordering::Release);
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if let Some(mut worker) = self.flusher.lock().take() {
            let _ = worker.tx.send(WorkerCommand::Shutdown);
            worker.handle.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryMode;
    use tempfile::TempDir;

    fn config_in(tmp: &TempDir, memory: MemoryMode) -> WalConfig {
        WalConfig {
            root_dir: tmp.path().join("wal"),
            memory,
            ..WalConfig::default()
        }
    }

    #[tokio::test]
    async fn fresh_log_starts_empty() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        assert_eq!(wal.last_entry(), 0);
        assert_eq!(wal.last_committed(), 0);
        assert_eq!(wal.last_applied(), 0);
        assert_eq!(wal.term(), 0);
        assert_eq!(wal.voted_for(), None);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        let index = wal.append(7, b"SET X=0").await.expect("append");
        assert_eq!(index, 1);

        let batch = wal.read(1, 1).await.expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].term, 7);
        assert_eq!(batch.entries[0].payload, b"SET X=0");
        assert!(!batch.entries[0].is_snapshot);
        assert!(batch.snapshot_index.is_none());
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        let err = wal.append(1, b"").await.expect_err("must reject");
        assert!(matches!(err, WalError::InvalidState(_)));
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn read_zero_and_past_tail_are_out_of_range() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        wal.append(1, b"one").await.expect("append");
        assert!(matches!(
            wal.read(0, 1).await.expect_err("entry zero"),
            WalError::OutOfRange { .. }
        ));
        assert!(matches!(
            wal.read(2, 2).await.expect_err("past tail"),
            WalError::OutOfRange { .. }
        ));
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn commit_is_monotonic_and_idempotent() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        for i in 0..5u64 {
            wal.append(1, &i.to_le_bytes()).await.expect("append");
        }
        assert_eq!(wal.commit(3).await.expect("commit"), 3);
        assert_eq!(wal.commit(3).await.expect("idempotent"), 0);
        assert_eq!(wal.commit(2).await.expect("below watermark"), 0);
        assert_eq!(wal.commit(99).await.expect("clamped"), 2);
        assert_eq!(wal.last_committed(), 5);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn overwrite_committed_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        for i in 0..5u64 {
            wal.append(10 + i, b"entry").await.expect("append");
        }
        wal.commit(3).await.expect("commit");

        let err = wal
            .append_range(vec![AppendEntry::new(99, "late")], 2)
            .await
            .expect_err("must reject");
        assert!(matches!(err, WalError::OverwriteCommitted { index: 2, .. }));
        // State unchanged.
        assert_eq!(wal.last_entry(), 5);
        assert_eq!(wal.read(2, 2).await.expect("read").entries[0].term, 11);

        // Exactly one past the watermark is allowed.
        let last = wal
            .append_range(vec![AppendEntry::new(99, "boundary")], 4)
            .await
            .expect("accepted");
        assert_eq!(last, 4);
        assert_eq!(wal.last_entry(), 4);
        assert_eq!(wal.read(4, 4).await.expect("read").entries[0].term, 99);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn append_gap_is_rejected() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        wal.append(1, b"one").await.expect("append");
        let err = wal
            .append_range(vec![AppendEntry::new(1, "gap")], 3)
            .await
            .expect_err("must reject");
        assert!(matches!(err, WalError::OutOfRange { index: 3, .. }));
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn drop_from_one_empties_the_log() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        for _ in 0..4 {
            wal.append(2, b"uncommitted").await.expect("append");
        }
        let dropped = wal.drop_from(1, false).await.expect("drop");
        assert_eq!(dropped, 4);
        assert_eq!(wal.last_entry(), 0);
        let next = wal.append(3, b"fresh").await.expect("append");
        assert_eq!(next, 1);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn flush_failure_poisons_the_log() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::PrivateMemory)).expect("open");
        wal.append(1, b"doomed").await.expect("append");
        // One more injected failure than the retry budget tolerates.
        wal.inject_flush_errors(FLUSH_RETRY_MAX_ATTEMPTS as u64 + 1);
        let err = wal.flush().await.expect_err("flush must fail");
        assert!(matches!(err, WalError::Io(_) | WalError::IoAt { .. }));
        assert!(wal.is_poisoned());
        let err = wal.append(1, b"rejected").await.expect_err("poisoned");
        assert!(matches!(err, WalError::Poisoned));
        wal.close().await.expect("close still allowed");
    }

    #[tokio::test]
    async fn transient_flush_errors_are_retried() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        wal.append(1, b"retry me").await.expect("append");
        wal.inject_flush_errors(2);
        wal.flush().await.expect("flush survives transients");
        assert!(!wal.is_poisoned());
        assert_eq!(wal.metrics().retry_attempts, 2);
        assert_eq!(wal.metrics().flush_failures, 0);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn apply_failure_poisons_the_log() {
        use crate::apply::testing::RecordingMachine;

        let tmp = TempDir::new().expect("tempdir");
        let machine = Arc::new(RecordingMachine {
            fail_at: Some(2),
            ..RecordingMachine::default()
        });
        let wal = Wal::open_with_state_machine(
            config_in(&tmp, MemoryMode::SharedMemory),
            machine.clone(),
        )
        .expect("open");

        wal.append(1, b"ok").await.expect("append");
        wal.append(1, b"fails").await.expect("append");
        wal.commit(2).await.expect("commit");

        let err = wal.wait_for_apply(2).await.expect_err("poisoned");
        assert!(matches!(err, WalError::Poisoned));
        assert_eq!(wal.last_applied(), 1);
        assert_eq!(machine.seen.lock().len(), 1);
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn poisoning_stops_the_apply_loop() {
        use futures::FutureExt;
        use futures::future::BoxFuture;
        use tokio::sync::Semaphore;

        struct GatedMachine {
            gate: Semaphore,
            seen: Mutex<Vec<u64>>,
        }

        impl StateMachine for GatedMachine {
            fn apply(&self, applied: AppliedEntry) -> BoxFuture<'_, WalResult<()>> {
                async move {
                    let permit = self
                        .gate
                        .acquire()
                        .await
                        .map_err(|_| WalError::internal("gate closed"))?;
                    permit.forget();
                    self.seen.lock().push(applied.entry.index);
                    Ok(())
                }
                .boxed()
            }
        }

        let tmp = TempDir::new().expect("tempdir");
        let machine = Arc::new(GatedMachine {
            gate: Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let wal = Wal::open_with_state_machine(
            config_in(&tmp, MemoryMode::SharedMemory),
            machine.clone(),
        )
        .expect("open");

        wal.append(1, b"first").await.expect("append");
        wal.append(1, b"second").await.expect("append");
        wal.commit(2).await.expect("commit");
        // The apply loop is parked on the gate at entry 1.
        tokio::task::yield_now().await;

        // Dirty the tail, then poison the log through a failed flush.
        wal.append(1, b"uncommitted").await.expect("append");
        wal.inject_flush_errors(FLUSH_RETRY_MAX_ATTEMPTS as u64 + 1);
        wal.flush().await.expect_err("flush must fail");
        assert!(wal.is_poisoned());

        // Even with the gate wide open, a poisoned log feeds nothing
        // further to the state machine.
        machine.gate.add_permits(2);
        let err = wal.wait_for_apply(2).await.expect_err("poisoned");
        assert!(matches!(err, WalError::Poisoned));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!machine.seen.lock().contains(&2));
        wal.close().await.expect("close");
    }

    #[tokio::test]
    async fn save_vote_persists_and_rejects_regression() {
        let tmp = TempDir::new().expect("tempdir");
        let config = config_in(&tmp, MemoryMode::SharedMemory);
        let wal = Wal::open(config.clone()).expect("open");
        let node = NodeId::new([3u8; 16]);
        wal.save_vote(8, Some(node)).await.expect("save");
        assert_eq!(wal.term(), 8);
        assert_eq!(wal.voted_for(), Some(node));

        let err = wal.save_vote(7, None).await.expect_err("regression");
        assert!(matches!(err, WalError::InvalidState(_)));
        wal.close().await.expect("close");

        let reopened = Wal::open(config).expect("reopen");
        assert_eq!(reopened.term(), 8);
        assert_eq!(reopened.voted_for(), Some(node));
        reopened.close().await.expect("close");
    }

    #[tokio::test]
    async fn closed_log_rejects_operations() {
        let tmp = TempDir::new().expect("tempdir");
        let wal = Wal::open(config_in(&tmp, MemoryMode::SharedMemory)).expect("open");
        wal.close().await.expect("close");
        assert!(matches!(
            wal.append(1, b"late").await.expect_err("closed"),
            WalError::Closed
        ));
        assert!(matches!(
            wal.read(1, 1).await.expect_err("closed"),
            WalError::Closed
        ));
        // Idempotent close.
        wal.close().await.expect("second close");
    }

    #[tokio::test]
    async fn contexts_are_delivered_then_cleared() {
        use crate::apply::testing::RecordingMachine;

        let tmp = TempDir::new().expect("tempdir");
        let machine = Arc::new(RecordingMachine::default());
        let wal = Wal::open_with_state_machine(
            config_in(&tmp, MemoryMode::SharedMemory),
            machine.clone(),
        )
        .expect("open");

        let tag: EntryContext = Arc::new(41u32);
        wal.append_with(
            1,
            b"ctx",
            AppendOptions {
                context: Some(tag),
                snapshot: false,
            },
            AcquireOptions::default(),
        )
        .await
        .expect("append");
        wal.commit(1).await.expect("commit");
        wal.wait_for_apply(1).await.expect("apply");

        assert_eq!(machine.seen.lock().len(), 1);
        assert!(wal.inner.contexts.lock().is_empty());
        wal.close().await.expect("close");
    }
}
