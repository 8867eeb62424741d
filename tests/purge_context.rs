//! Tests of `PurgeContext` coordination through a shared purge file.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::ThreadId;

use anyhow::Result;
use pagespeed_cache::FileStamp;
use pagespeed_cache::FileSystem;
use pagespeed_cache::FindOptions;
use pagespeed_cache::FindResult;
use pagespeed_cache::HttpCache;
use pagespeed_cache::MockTimer;
use pagespeed_cache::PurgeContext;
use pagespeed_cache::PurgeError;
use pagespeed_cache::PurgeOptions;
use pagespeed_cache::PurgeStats;
use pagespeed_cache::RequestProperties;
use pagespeed_cache::ResponseHeaders;
use pagespeed_cache::StdFileSystem;
use pagespeed_cache::Timer;
use pagespeed_cache::VaryOption;
use pagespeed_cache::http::HeaderMap;
use pagespeed_cache::http::HeaderValue;
use pagespeed_cache::http::StatusCode;
use pagespeed_cache::http::header;
use pagespeed_cache::lock::FileLockManager;
use pagespeed_cache::storage::MemoryStore;
use parking_lot::Mutex;
use tempfile::TempDir;

const URL_A: &str = "http://www.example.com/a";
const URL_B: &str = "http://www.example.com/b";

/// A purge file and lock directory driven by a mock clock.
struct Fixture {
    /// Holds the purge file and the locks.
    dir: TempDir,
    /// The clock shared by every context.
    timer: MockTimer,
    /// Creates the purge locks.
    locks: FileLockManager,
}

impl Fixture {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let timer = MockTimer::default();
        let locks = FileLockManager::new(dir.path().join("locks"), Arc::new(timer.clone()));
        Ok(Self { dir, timer, locks })
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("cache.flush")
    }

    fn now_ms(&self) -> i64 {
        self.timer.now_ms()
    }

    fn context(&self, stats: &Arc<PurgeStats>, options: PurgeOptions) -> PurgeContext {
        self.context_with_fs(Arc::new(StdFileSystem), stats, options)
    }

    fn context_with_fs(
        &self,
        fs: Arc<dyn FileSystem>,
        stats: &Arc<PurgeStats>,
        options: PurgeOptions,
    ) -> PurgeContext {
        PurgeContext::new(
            self.path(),
            fs,
            Arc::new(self.timer.clone()),
            &self.locks,
            stats.clone(),
            options,
        )
    }

    fn contents(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.path())?)
    }
}

/// A file system on which another writer clobbers the purge file right after
/// each of the first `remaining` writes.
struct ClobberingFileSystem {
    /// Writes still to be clobbered; negative clobbers every write.
    remaining: AtomicI64,
}

impl ClobberingFileSystem {
    fn new(remaining: i64) -> Self {
        Self {
            remaining: remaining.into(),
        }
    }
}

impl FileSystem for ClobberingFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        StdFileSystem.read_file(path)
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        StdFileSystem.write_file_atomic(path, contents)?;
        if self.remaining.fetch_sub(1, Ordering::SeqCst) != 0 {
            StdFileSystem.write_file_atomic(path, b"clobbered\n")?;
        } else {
            self.remaining.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        StdFileSystem.stat(path)
    }
}

/// A file system on which existing files can be seen but not read.
struct UnreadableFileSystem;

impl FileSystem for UnreadableFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("cannot read `{path}`", path = path.display()),
        ))
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        StdFileSystem.write_file_atomic(path, contents)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        StdFileSystem.stat(path)
    }
}

/// A file system recording the threads its writes run on.
#[derive(Default)]
struct ThreadRecordingFileSystem {
    /// The thread of each write.
    writers: Mutex<Vec<ThreadId>>,
}

impl FileSystem for ThreadRecordingFileSystem {
    fn read_file(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        StdFileSystem.read_file(path)
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.writers.lock().push(thread::current().id());
        StdFileSystem.write_file_atomic(path, contents)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<FileStamp>> {
        StdFileSystem.stat(path)
    }
}

#[tokio::test]
async fn purges_propagate_between_contexts_sharing_stats() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let writer = fixture.context(&stats, PurgeOptions::default());
    let reader = fixture.context(&stats, PurgeOptions::default());
    let now = fixture.now_ms();

    assert!(reader.is_valid(URL_A, now));

    writer.add_purge_url(URL_A, now).await?;
    assert_eq!(stats.file_writes.get(), 1);
    assert_eq!(stats.purge_index.get(), 1);
    assert_eq!(fixture.contents()?, format!("-1\n{now} {URL_A}\n"));

    // The shared purge index forces a read before the check interval elapses
    assert!(!reader.is_valid(URL_A, now));
    assert!(reader.is_valid(URL_A, now + 1));
    assert!(reader.is_valid(URL_B, now));
    assert!(!writer.is_valid(URL_A, now));

    writer.set_cache_purge_global_timestamp_ms(now + 10).await?;
    assert!(!reader.is_valid(URL_B, now + 10));
    assert!(reader.is_valid(URL_B, now + 11));
    assert_eq!(reader.snapshot().global_invalidation_timestamp_ms(), now + 10);
    Ok(())
}

#[tokio::test]
async fn independent_contexts_poll_on_an_interval() -> Result<()> {
    let fixture = Fixture::new()?;
    let writer = fixture.context(&Arc::default(), PurgeOptions::default());
    let reader_stats = Arc::new(PurgeStats::default());
    let reader = fixture.context(&reader_stats, PurgeOptions::default());
    let now = fixture.now_ms();

    assert!(reader.is_valid(URL_A, now));
    writer.add_purge_url(URL_A, now).await?;

    // Not yet due to check the file again
    fixture.timer.advance_ms(4999);
    assert!(reader.is_valid(URL_A, now));

    fixture.timer.advance_ms(1);
    assert!(!reader.is_valid(URL_A, now));

    // An unchanged file is not re-read
    let stats_before = reader_stats.file_stats.get();
    fixture.timer.advance_ms(5000);
    assert!(!reader.is_valid(URL_A, now));
    assert_eq!(reader_stats.file_stats.get(), stats_before + 1);
    assert_eq!(reader_stats.file_parse_failures.get(), 0);
    Ok(())
}

#[tokio::test]
async fn requests_are_batched() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(
        &stats,
        PurgeOptions {
            request_batching_delay_ms: 1000,
            ..Default::default()
        },
    );
    let now = fixture.now_ms();

    let first = context.add_purge_url(URL_A, now);
    let second = context.add_purge_url(URL_B, now);
    tokio::task::yield_now().await;
    assert_eq!(stats.file_writes.get(), 0);

    fixture.timer.advance_ms(1000);
    first.await?;
    second.await?;

    assert_eq!(stats.file_writes.get(), 1);
    assert_eq!(stats.purge_index.get(), 1);
    assert_eq!(
        fixture.contents()?,
        format!("-1\n{now} {URL_A}\n{now} {URL_B}\n")
    );
    Ok(())
}

#[tokio::test]
async fn purges_fail_when_the_lock_stays_busy() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(&stats, PurgeOptions::default());
    let holder = fixture
        .locks
        .create_named_lock(&PurgeContext::lock_name(&fixture.path()));
    assert!(holder.try_lock_steal_old(2000)?);

    let purge = context.add_purge_url(URL_A, fixture.now_ms());

    // The holder is still alive and refreshes its claim before it is stolen
    fixture.timer.advance_ms(2000);
    assert!(holder.try_lock_steal_old(2000)?);
    fixture.timer.advance_ms(1000);

    assert_eq!(purge.await, Err(PurgeError::LockTimeout));
    assert_eq!(stats.contentions.get(), 1);
    assert_eq!(stats.file_writes.get(), 0);
    assert!(holder.held()?);
    assert!(!fixture.path().exists());
    Ok(())
}

#[tokio::test]
async fn abandoned_locks_are_stolen() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(&stats, PurgeOptions::default());
    let holder = fixture
        .locks
        .create_named_lock(&PurgeContext::lock_name(&fixture.path()));
    assert!(holder.try_lock_steal_old(2000)?);

    let now = fixture.now_ms();
    let purge = context.add_purge_url(URL_A, now);
    fixture.timer.advance_ms(2000);

    purge.await?;
    assert_eq!(stats.contentions.get(), 0);
    assert!(!holder.held()?);
    assert!(!context.is_valid(URL_A, now));
    Ok(())
}

#[tokio::test]
async fn clobbered_writes_are_retried() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context_with_fs(
        Arc::new(ClobberingFileSystem::new(1)),
        &stats,
        PurgeOptions::default(),
    );
    let now = fixture.now_ms();

    context.add_purge_url(URL_A, now).await?;
    assert_eq!(stats.contentions.get(), 1);
    assert_eq!(stats.file_writes.get(), 2);
    assert_eq!(stats.file_parse_failures.get(), 1);
    assert_eq!(stats.purge_index.get(), 1);
    assert_eq!(fixture.contents()?, format!("-1\n{now} {URL_A}\n"));
    Ok(())
}

#[tokio::test]
async fn purges_fail_after_repeated_clobbering() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context_with_fs(
        Arc::new(ClobberingFileSystem::new(-1)),
        &stats,
        PurgeOptions::default(),
    );

    let result = context.add_purge_url(URL_A, fixture.now_ms()).await;
    assert_eq!(result, Err(PurgeError::WriteFailed));
    assert_eq!(stats.contentions.get(), 3);
    assert_eq!(stats.file_writes.get(), 3);
    assert_eq!(stats.file_write_failures.get(), 1);
    assert_eq!(stats.purge_index.get(), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_lines_are_skipped_and_repaired() -> Result<()> {
    let fixture = Fixture::new()?;
    std::fs::write(
        fixture.path(),
        format!(
            "bogus\n500 {URL_A}\n-2 {URL_B}\n99999999999999 {URL_B}\nnot-a-record\n"
        ),
    )?;

    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(&stats, PurgeOptions::default());
    assert!(!context.is_valid(URL_A, 500));
    assert!(context.is_valid(URL_A, 501));
    assert!(context.is_valid(URL_B, 0));
    assert_eq!(stats.file_parse_failures.get(), 4);

    let now = fixture.now_ms();
    context.add_purge_url(URL_B, now).await?;
    assert_eq!(
        fixture.contents()?,
        format!("-1\n500 {URL_A}\n{now} {URL_B}\n")
    );
    Ok(())
}

#[tokio::test]
async fn lines_that_are_not_utf8_are_skipped_and_repaired() -> Result<()> {
    let fixture = Fixture::new()?;
    std::fs::write(
        fixture.path(),
        [
            format!("-1\n500 {URL_A}\n").as_bytes(),
            b"600 http://www.example.com/\xff\n".as_slice(),
        ]
        .concat(),
    )?;

    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(&stats, PurgeOptions::default());
    assert!(!context.is_valid(URL_A, 500));
    assert!(context.is_valid(URL_A, 501));
    assert_eq!(stats.file_parse_failures.get(), 1);

    let now = fixture.now_ms();
    context.add_purge_url(URL_B, now).await?;
    assert_eq!(
        fixture.contents()?,
        format!("-1\n500 {URL_A}\n{now} {URL_B}\n")
    );
    Ok(())
}

#[tokio::test]
async fn unreadable_purge_files_are_not_overwritten() -> Result<()> {
    let fixture = Fixture::new()?;
    let original = format!("-1\n500 {URL_A}\n");
    std::fs::write(fixture.path(), &original)?;

    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context_with_fs(
        Arc::new(UnreadableFileSystem),
        &stats,
        PurgeOptions::default(),
    );

    let result = context.add_purge_url(URL_B, fixture.now_ms()).await;
    assert_eq!(result, Err(PurgeError::WriteFailed));
    assert_eq!(stats.contentions.get(), 3);
    assert_eq!(stats.file_writes.get(), 0);
    assert_eq!(stats.file_write_failures.get(), 1);
    assert_eq!(fixture.contents()?, original);
    Ok(())
}

#[tokio::test]
async fn file_work_runs_off_the_async_executor() -> Result<()> {
    let fixture = Fixture::new()?;
    let fs = Arc::new(ThreadRecordingFileSystem::default());
    let context = fixture.context_with_fs(fs.clone(), &Arc::default(), PurgeOptions::default());

    context.add_purge_url(URL_A, fixture.now_ms()).await?;

    // A current-thread runtime polls every task on this thread
    let writers = fs.writers.lock().clone();
    assert_eq!(writers.len(), 1);
    assert_ne!(writers[0], thread::current().id());
    Ok(())
}

#[tokio::test]
async fn disabled_purging_follows_the_file_modification_time() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(
        &stats,
        PurgeOptions {
            enable_purge: false,
            ..Default::default()
        },
    );

    assert_eq!(
        context.add_purge_url(URL_A, fixture.now_ms()).await,
        Err(PurgeError::Disabled)
    );
    assert!(context.is_valid(URL_A, fixture.now_ms()));

    std::fs::write(fixture.path(), "")?;
    let modified_ms = StdFileSystem
        .stat(&fixture.path())?
        .map(|stamp| stamp.modified_ms)
        .unwrap_or_default();

    fixture.timer.advance_ms(5000);
    assert!(!context.is_valid(URL_A, modified_ms));
    assert!(context.is_valid(URL_A, modified_ms + 1));
    assert_eq!(stats.file_parse_failures.get(), 0);
    Ok(())
}

#[tokio::test]
async fn dropping_a_context_cancels_pending_purges() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let context = fixture.context(
        &stats,
        PurgeOptions {
            request_batching_delay_ms: 1000,
            ..Default::default()
        },
    );

    let purge = context.add_purge_url(URL_A, fixture.now_ms());
    drop(context);
    fixture.timer.advance_ms(1000);

    assert_eq!(purge.await, Err(PurgeError::Cancelled));
    assert_eq!(stats.cancellations.get(), 1);
    assert_eq!(stats.file_writes.get(), 0);
    Ok(())
}

#[tokio::test]
async fn new_snapshots_reach_the_update_callback() -> Result<()> {
    let fixture = Fixture::new()?;
    let stats = Arc::new(PurgeStats::default());
    let writer = fixture.context(&stats, PurgeOptions::default());
    let reader = fixture.context(&stats, PurgeOptions::default());

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    reader.set_update_callback(move |set| {
        assert!(!set.is_empty());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    writer.add_purge_url(URL_A, fixture.now_ms()).await?;
    reader.poll_file_system();
    reader.poll_file_system();
    assert_eq!(updates.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn snapshots_invalidate_cache_lookups() -> Result<()> {
    let fixture = Fixture::new()?;
    let context = fixture.context(&Arc::default(), PurgeOptions::default());
    let cache = HttpCache::new(MemoryStore::new(1024 * 1024), Arc::new(fixture.timer.clone()));

    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=600"));
    assert!(
        cache
            .put(
                URL_A,
                "",
                &RequestProperties::default(),
                VaryOption::RespectVary,
                ResponseHeaders::new(StatusCode::OK, headers),
                "content",
            )
            .await
    );

    fixture.timer.advance_ms(1000);
    context.add_purge_url(URL_A, fixture.now_ms()).await?;
    context.poll_file_system();

    let options = FindOptions::default().with_purge_set(context.snapshot());
    let found = cache.find(URL_A, "", &options).await;
    assert_eq!(found.result, FindResult::NotFound);
    assert!(found.fallback.is_none());
    Ok(())
}
