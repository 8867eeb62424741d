//! Cross-process coordination of cache purges.
//!
//! A [`PurgeContext`] shares a purge file with every other context pointed at
//! the same path, whether in this process or another one. The file holds a
//! global invalidation timestamp on its first line followed by one
//! `<timestamp_ms> <url>` line per purged URL.
//!
//! Writers batch their updates, take a [`NamedLock`] (stealing it if its
//! holder appears to have died), merge their updates into the current file,
//! write it atomically and read it back to verify the write. Readers poll the
//! file and publish each new version as an immutable [`PurgeSet`] snapshot.
//!
//! Failure never escalates: a purge that cannot be written is reported to
//! its requester, and a corrupt file is repaired by the next successful write.
//! A file that cannot be read at all is left alone rather than overwritten.
//!
//! Requesting a purge spawns the flush on the async runtime, so it must be
//! done from within one.

use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use futures::channel::oneshot;
use parking_lot::Mutex;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

mod set;

pub use set::*;

use crate::fs::FileStamp;
use crate::fs::FileSystem;
use crate::lock::FileLockManager;
use crate::lock::NamedLock;
use crate::runtime;
use crate::stats::Variable;
use crate::timer::Timer;

/// The name of the counter of purge requests cancelled before being written.
pub const PURGE_CANCELLATIONS: &str = "purge_cancellations";
/// The name of the counter of lock timeouts and failed write verifications.
pub const PURGE_CONTENTIONS: &str = "purge_contentions";
/// The name of the counter of unparseable purge file lines.
pub const PURGE_FILE_PARSE_FAILURES: &str = "purge_file_parse_failures";
/// The name of the counter of times the purge file was examined.
pub const PURGE_FILE_STATS: &str = "purge_file_stats";
/// The name of the counter of purge requests dropped after repeated failed
/// writes.
pub const PURGE_FILE_WRITE_FAILURES: &str = "purge_file_write_failures";
/// The name of the counter of purge file writes.
pub const PURGE_FILE_WRITES: &str = "purge_file_writes";
/// The name of the counter bumped whenever the purge file changes.
pub const PURGE_INDEX: &str = "purge_index";

/// An error reported to a purge requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PurgeError {
    /// Purging is disabled by configuration.
    #[error("cache purging is disabled")]
    Disabled,
    /// The purge lock could not be acquired in time.
    #[error("timed out waiting for the purge lock")]
    LockTimeout,
    /// The purge file could not be written and verified.
    #[error("failed to write the purge file")]
    WriteFailed,
    /// The context was dropped before the purge was written.
    #[error("the purge request was cancelled")]
    Cancelled,
}

/// The statistics of a set of [`PurgeContext`]s.
///
/// Contexts sharing the same statistics also share the purge index, which
/// lets one context tell the others that the purge file changed.
#[derive(Debug)]
pub struct PurgeStats {
    /// Purge requests cancelled before being written.
    pub cancellations: Variable,
    /// Lock timeouts and failed write verifications.
    pub contentions: Variable,
    /// Unparseable purge file lines.
    pub file_parse_failures: Variable,
    /// Times the purge file was examined.
    pub file_stats: Variable,
    /// Purge requests dropped after repeated failed writes.
    pub file_write_failures: Variable,
    /// Purge file writes.
    pub file_writes: Variable,
    /// Bumped whenever the purge file is known to have changed.
    pub purge_index: Variable,
}

impl Default for PurgeStats {
    fn default() -> Self {
        Self {
            cancellations: Variable::new(PURGE_CANCELLATIONS),
            contentions: Variable::new(PURGE_CONTENTIONS),
            file_parse_failures: Variable::new(PURGE_FILE_PARSE_FAILURES),
            file_stats: Variable::new(PURGE_FILE_STATS),
            file_write_failures: Variable::new(PURGE_FILE_WRITE_FAILURES),
            file_writes: Variable::new(PURGE_FILE_WRITES),
            purge_index: Variable::new(PURGE_INDEX),
        }
    }
}

impl PurgeStats {
    /// Gets the current value of every counter by name.
    pub fn snapshot(&self) -> Vec<(&'static str, i64)> {
        [
            &self.cancellations,
            &self.contentions,
            &self.file_parse_failures,
            &self.file_stats,
            &self.file_write_failures,
            &self.file_writes,
            &self.purge_index,
        ]
        .into_iter()
        .map(Variable::sample)
        .collect()
    }
}

/// The configuration of a [`PurgeContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeOptions {
    /// Whether per-URL purging is enabled.
    ///
    /// When disabled, only the modification time of the purge file matters:
    /// touching the file invalidates everything cached before that moment.
    pub enable_purge: bool,
    /// How long to collect requests before writing them as one batch.
    pub request_batching_delay_ms: i64,
    /// How long to wait for the purge lock.
    pub lock_timeout_ms: i64,
    /// How old a lock must be before it is stolen.
    pub lock_steal_ms: i64,
    /// How many consecutive failed writes are retried before giving up.
    pub max_contention_retries: u32,
    /// How often the purge file is checked for changes by other processes.
    pub check_interval_ms: i64,
    /// The most memory the per-URL purge records may use.
    pub max_purge_set_bytes: usize,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            enable_purge: true,
            request_batching_delay_ms: 0,
            lock_timeout_ms: 3000,
            lock_steal_ms: 2000,
            max_contention_retries: 2,
            check_interval_ms: 5000,
            max_purge_set_bytes: 1024 * 1024,
        }
    }
}

/// The completion of a purge request.
///
/// Resolves once the request has been written to the purge file, or has
/// failed.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct PurgeFuture(oneshot::Receiver<Result<(), PurgeError>>);

impl PurgeFuture {
    /// A purge future that has already failed.
    fn failed(error: PurgeError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self(rx)
    }
}

impl Future for PurgeFuture {
    type Output = Result<(), PurgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.0).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(oneshot::Canceled) => Poll::Ready(Err(PurgeError::Cancelled)),
        }
    }
}

/// A callback receiving each newly published purge set.
type UpdateCallback = Box<dyn Fn(Arc<PurgeSet>) + Send + Sync>;

/// A sender completing a purge request.
type Completion = oneshot::Sender<Result<(), PurgeError>>;

/// Requests waiting to be written.
struct Pending {
    /// The purges requested.
    purges: PurgeSet,
    /// The requesters to notify.
    completions: Vec<Completion>,
    /// Whether a flush task is scheduled or running.
    flush_scheduled: bool,
    /// When the scheduled flush may start.
    flush_at_ms: i64,
    /// How many writes of these requests have failed in a row.
    consecutive_failures: u32,
}

/// The state of file system polling.
#[derive(Default)]
struct PollState {
    /// The purge index as of the last read.
    local_purge_index: i64,
    /// When the file was last polled.
    last_poll_ms: Option<i64>,
    /// The stamp of the file as of the last read.
    last_stamp: Option<FileStamp>,
    /// Whether a poll is in progress.
    polling: bool,
}

/// State shared between a context and its flush task.
struct Inner {
    /// The purge file.
    path: PathBuf,
    /// The file system holding the purge file.
    fs: Arc<dyn FileSystem>,
    /// The source of time.
    timer: Arc<dyn Timer>,
    /// The lock guarding writes to the purge file.
    lock: NamedLock,
    /// The statistics.
    stats: Arc<PurgeStats>,
    /// The configuration.
    options: PurgeOptions,
    /// Requests waiting to be written.
    pending: Mutex<Pending>,
    /// The polling state.
    poll: Mutex<PollState>,
    /// The current snapshot.
    snapshot: RwLock<Arc<PurgeSet>>,
    /// The callback receiving new snapshots.
    update_callback: RwLock<Option<UpdateCallback>>,
    /// Set once the context has been dropped.
    shut_down: AtomicBool,
}

/// Shares cache purges with every context using the same purge file.
pub struct PurgeContext {
    /// The shared state.
    inner: Arc<Inner>,
}

impl PurgeContext {
    /// Creates a context for the purge file at `path`.
    ///
    /// The purge lock is created through `lock_manager` under the name given
    /// by [`PurgeContext::lock_name`].
    pub fn new(
        path: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        timer: Arc<dyn Timer>,
        lock_manager: &FileLockManager,
        stats: Arc<PurgeStats>,
        options: PurgeOptions,
    ) -> Self {
        let path = path.into();
        let lock = lock_manager.create_named_lock(&Self::lock_name(&path));
        let max_bytes = options.max_purge_set_bytes;

        Self {
            inner: Arc::new(Inner {
                path,
                fs,
                timer,
                lock,
                stats,
                options,
                pending: Mutex::new(Pending {
                    purges: PurgeSet::new(max_bytes),
                    completions: Vec::new(),
                    flush_scheduled: false,
                    flush_at_ms: 0,
                    consecutive_failures: 0,
                }),
                poll: Mutex::new(PollState::default()),
                snapshot: RwLock::new(Arc::new(PurgeSet::new(max_bytes))),
                update_callback: RwLock::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Gets the name of the lock guarding a purge file.
    pub fn lock_name(path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{name}-lock")
    }

    /// Gets the path of the purge file.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Gets the statistics.
    pub fn stats(&self) -> &Arc<PurgeStats> {
        &self.inner.stats
    }

    /// Sets the callback that receives every newly published purge set.
    pub fn set_update_callback(&self, callback: impl Fn(Arc<PurgeSet>) + Send + Sync + 'static) {
        *self.inner.update_callback.write() = Some(Box::new(callback));
    }

    /// Gets the most recently published purge set.
    pub fn snapshot(&self) -> Arc<PurgeSet> {
        self.inner.snapshot.read().clone()
    }

    /// Purges a URL: anything cached for it at or before `timestamp_ms`
    /// becomes invalid.
    ///
    /// # Panics
    ///
    /// Panics if called outside an async runtime (with the `tokio` feature,
    /// outside a tokio runtime) unless purging is disabled.
    pub fn add_purge_url(&self, url: &str, timestamp_ms: i64) -> PurgeFuture {
        if !self.inner.options.enable_purge {
            debug!(url, "ignoring purge request: purging is disabled");
            return PurgeFuture::failed(PurgeError::Disabled);
        }

        self.enqueue(|purges| purges.put(url, timestamp_ms))
    }

    /// Purges everything cached at or before `timestamp_ms`.
    ///
    /// # Panics
    ///
    /// Panics if called outside an async runtime (with the `tokio` feature,
    /// outside a tokio runtime).
    pub fn set_cache_purge_global_timestamp_ms(&self, timestamp_ms: i64) -> PurgeFuture {
        self.enqueue(|purges| purges.update_global_invalidation_timestamp_ms(timestamp_ms))
    }

    /// Determines if a URL cached at `timestamp_ms` is still valid.
    ///
    /// The purge file is polled first.
    pub fn is_valid(&self, url: &str, timestamp_ms: i64) -> bool {
        self.poll_file_system();
        self.snapshot().is_valid(url, timestamp_ms)
    }

    /// Picks up changes to the purge file.
    ///
    /// The file is re-read when another context sharing the statistics has
    /// written it, or when the check interval has elapsed and the file's stamp
    /// changed. A changed file is merged into a new snapshot, which is then
    /// published to the update callback.
    pub fn poll_file_system(&self) {
        let inner = &self.inner;
        let now_ms = inner.timer.now_ms();
        let purge_index = inner.stats.purge_index.get();

        let needs_update = {
            let mut poll = inner.poll.lock();
            let needs_update = poll.local_purge_index < purge_index;
            let interval_elapsed = poll
                .last_poll_ms
                .is_none_or(|last| now_ms - last >= inner.options.check_interval_ms);

            if poll.polling || !(needs_update || interval_elapsed) {
                return;
            }

            poll.polling = true;
            poll.last_poll_ms = Some(now_ms);
            poll.local_purge_index = purge_index;
            needs_update
        };

        inner.refresh(needs_update);
        inner.poll.lock().polling = false;
    }

    /// Adds a request to the pending batch, scheduling a flush if needed.
    fn enqueue(&self, update: impl FnOnce(&mut PurgeSet)) -> PurgeFuture {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();

        let schedule = {
            let mut pending = inner.pending.lock();
            update(&mut pending.purges);
            pending.completions.push(tx);
            if pending.flush_scheduled {
                false
            } else {
                pending.flush_scheduled = true;
                pending.flush_at_ms =
                    inner.timer.now_ms() + inner.options.request_batching_delay_ms.max(0);
                true
            }
        };

        if schedule {
            let inner = inner.clone();
            runtime::spawn(async move { inner.flush().await });
        }

        PurgeFuture(rx)
    }
}

impl Drop for PurgeContext {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::Release);

        let completions = {
            let mut pending = inner.pending.lock();
            pending.purges.clear();
            mem::take(&mut pending.completions)
        };

        if !completions.is_empty() {
            debug!(
                count = completions.len(),
                "cancelling purge requests that were never written"
            );
            inner.stats.cancellations.add(completions.len() as i64);
            complete(completions, Err(PurgeError::Cancelled));
        }
    }
}

impl fmt::Debug for PurgeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeContext")
            .field("path", &self.inner.path)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Writes the pending batch once the batching delay has passed.
    async fn flush(self: Arc<Self>) {
        let mut start_ms = self.pending.lock().flush_at_ms;
        self.timer.sleep_until_ms(start_ms).await;

        loop {
            if self.shut_down.load(Ordering::Acquire) {
                return;
            }

            let acquired = self
                .lock
                .lock_timed_wait_steal_old_since(
                    start_ms,
                    self.options.lock_timeout_ms,
                    self.options.lock_steal_ms,
                )
                .await
                .unwrap_or_else(|e| {
                    warn!(
                        path = %self.lock.path().display(),
                        error = format!("{e:?}"),
                        "failed to take the purge lock"
                    );
                    false
                });

            if self.shut_down.load(Ordering::Acquire) {
                if acquired {
                    self.run_blocking(Self::unlock).await;
                }
                return;
            }

            if !acquired {
                self.fail_pending();
                return;
            }

            if !self
                .run_blocking(Self::update_purge_file)
                .await
                .unwrap_or(false)
            {
                return;
            }

            start_ms = self.timer.now_ms();
        }
    }

    /// Runs blocking file work on a blocking task.
    ///
    /// Returns `None` if the task did not complete.
    async fn run_blocking<T>(self: &Arc<Self>, f: fn(&Self) -> T) -> Option<T>
    where
        T: Send + 'static,
    {
        let inner = self.clone();
        runtime::unwrap_task_output(runtime::spawn_blocking(move || f(&inner)).await)
    }

    /// Fails every pending request after a lock timeout.
    fn fail_pending(&self) {
        let completions = {
            let mut pending = self.pending.lock();
            pending.flush_scheduled = false;
            pending.consecutive_failures = 0;
            pending.purges.clear();
            mem::take(&mut pending.completions)
        };

        warn!(
            path = %self.path.display(),
            count = completions.len(),
            "timed out waiting for the purge lock: dropping purge requests"
        );
        self.stats.contentions.increment();
        complete(completions, Err(PurgeError::LockTimeout));
    }

    /// Merges the pending batch into the purge file while holding the lock.
    ///
    /// The lock is released before returning. Returns whether the caller
    /// should take the lock again and retry.
    ///
    /// A purge file that exists but cannot be read is not overwritten: the
    /// attempt fails and is retried like a failed verification.
    fn update_purge_file(&self) -> bool {
        let (purges, completions, failures) = {
            let mut pending = self.pending.lock();
            pending.flush_scheduled = false;
            (
                mem::replace(
                    &mut pending.purges,
                    PurgeSet::new(self.options.max_purge_set_bytes),
                ),
                mem::take(&mut pending.completions),
                mem::take(&mut pending.consecutive_failures),
            )
        };

        let written = match self.read_purge_file() {
            Ok(mut merged) => {
                merged.merge(&purges);
                self.stats.file_writes.increment();
                let written = self.write_and_verify(&serialize_purge_file(&merged));
                if written {
                    info!(
                        path = %self.path.display(),
                        global_invalidation_timestamp_ms =
                            merged.global_invalidation_timestamp_ms(),
                        urls = merged.len(),
                        "rewrote the purge file"
                    );
                }
                written
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = format!("{e:?}"),
                    "failed to read the purge file: leaving it untouched"
                );
                false
            }
        };
        self.unlock();

        if written {
            self.stats.purge_index.increment();
            complete(completions, Ok(()));
            return false;
        }

        self.stats.contentions.increment();
        let failures = failures + 1;
        if failures > self.options.max_contention_retries {
            warn!(
                path = %self.path.display(),
                count = completions.len(),
                "giving up on purge requests after repeated failed writes"
            );
            self.stats
                .file_write_failures
                .add(completions.len() as i64);
            complete(completions, Err(PurgeError::WriteFailed));
            return false;
        }

        debug!(
            path = %self.path.display(),
            failures,
            "failed to update the purge file: retrying"
        );
        let mut pending = self.pending.lock();
        pending.purges.merge(&purges);
        pending.completions.extend(completions);
        pending.consecutive_failures = pending.consecutive_failures.max(failures);

        // A flush scheduled since this one started will pick the requests up
        if pending.flush_scheduled {
            false
        } else {
            pending.flush_scheduled = true;
            true
        }
    }

    /// Writes the purge file and reads it back.
    ///
    /// Returns whether the file holds exactly what was written.
    fn write_and_verify(&self, contents: &[u8]) -> bool {
        if let Err(e) = self.fs.write_file_atomic(&self.path, contents) {
            warn!(
                path = %self.path.display(),
                error = format!("{e:?}"),
                "failed to write the purge file"
            );
            return false;
        }

        match self.fs.read_file(&self.path) {
            Ok(Some(read)) => read == contents,
            Ok(None) => false,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = format!("{e:?}"),
                    "failed to read back the purge file"
                );
                false
            }
        }
    }

    /// Releases the purge lock.
    fn unlock(&self) {
        if let Err(e) = self.lock.unlock() {
            warn!(
                path = %self.lock.path().display(),
                error = format!("{e:?}"),
                "failed to release the purge lock"
            );
        }
    }

    /// Reads the purge file into a new purge set.
    ///
    /// A missing file yields an empty set. Malformed lines are skipped and
    /// counted, but a file that cannot be read at all is an error.
    fn read_purge_file(&self) -> io::Result<PurgeSet> {
        self.stats.file_stats.increment();
        let mut set = PurgeSet::new(self.options.max_purge_set_bytes);

        if !self.options.enable_purge {
            match self.fs.stat(&self.path) {
                Ok(Some(stamp)) => set.update_global_invalidation_timestamp_ms(stamp.modified_ms),
                Ok(None) => {}
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = format!("{e:?}"),
                    "failed to stat the purge file"
                ),
            }
            return Ok(set);
        }

        let Some(contents) = self.fs.read_file(&self.path)? else {
            return Ok(set);
        };

        let failures = parse_purge_file(&contents, self.timer.now_ms(), &mut set);
        if failures > 0 {
            debug!(
                path = %self.path.display(),
                failures,
                "skipped malformed purge file lines"
            );
            self.stats.file_parse_failures.add(failures);
        }
        Ok(set)
    }

    /// Re-reads the purge file if it changed and publishes the result.
    fn refresh(&self, force: bool) {
        let stamp = match self.fs.stat(&self.path) {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = format!("{e:?}"),
                    "failed to stat the purge file"
                );
                return;
            }
        };

        if !force && self.poll.lock().last_stamp == stamp {
            self.stats.file_stats.increment();
            return;
        }

        let read = match self.read_purge_file() {
            Ok(read) => read,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = format!("{e:?}"),
                    "failed to read the purge file"
                );
                return;
            }
        };
        self.poll.lock().last_stamp = stamp;

        // Snapshots only ever grow so that a purge, once observed, stays
        // observed even if the file is later damaged
        let published = {
            let mut snapshot = self.snapshot.write();
            let mut merged = PurgeSet::clone(&snapshot);
            merged.merge(&read);
            if merged == **snapshot {
                None
            } else {
                let merged = Arc::new(merged);
                *snapshot = merged.clone();
                Some(merged)
            }
        };

        let Some(published) = published else {
            return;
        };

        if !force {
            // Let contexts sharing the statistics know without re-reading here
            let index = self.stats.purge_index.add(1);
            self.poll.lock().local_purge_index = index;
        }

        if let Some(callback) = self.update_callback.read().as_ref() {
            callback(published);
        }
    }
}

/// Sends a result to every requester.
fn complete(completions: Vec<Completion>, result: Result<(), PurgeError>) {
    for completion in completions {
        let _ = completion.send(result);
    }
}

/// Serializes a purge set into the purge file format.
fn serialize_purge_file(set: &PurgeSet) -> Vec<u8> {
    let mut contents = format!("{}\n", set.global_invalidation_timestamp_ms());
    for (url, timestamp_ms) in set.iter() {
        contents.push_str(&format!("{timestamp_ms} {url}\n"));
    }
    contents.into_bytes()
}

/// Parses the purge file format into a purge set.
///
/// Lines are decoded one at a time. Malformed lines, including lines that
/// are not UTF-8, are skipped; returns how many there were.
fn parse_purge_file(contents: &[u8], now_ms: i64, set: &mut PurgeSet) -> i64 {
    let mut failures = 0;
    let mut lines = contents
        .split(|&b| b == b'\n')
        .map(|line| std::str::from_utf8(line).map(str::trim));

    match lines
        .next()
        .and_then(|line| line.ok())
        .and_then(|line| line.parse::<i64>().ok())
    {
        Some(timestamp_ms) if is_valid_timestamp_ms(timestamp_ms, now_ms) => {
            set.update_global_invalidation_timestamp_ms(timestamp_ms)
        }
        _ => failures += 1,
    }

    for line in lines {
        let record = match line {
            Ok("") => continue,
            Ok(line) => parse_record(line, now_ms),
            Err(_) => None,
        };

        match record {
            Some((url, timestamp_ms)) => set.put(url, timestamp_ms),
            None => failures += 1,
        }
    }

    failures
}

/// Parses a `<timestamp_ms> <url>` line.
fn parse_record(line: &str, now_ms: i64) -> Option<(&str, i64)> {
    let mut tokens = line.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(timestamp_ms), Some(url), None) => timestamp_ms
            .parse::<i64>()
            .ok()
            .filter(|&ts| is_valid_timestamp_ms(ts, now_ms))
            .map(|ts| (url, ts)),
        _ => None,
    }
}
