//! # External collaborator contracts
//!
//! The pipeline's remote dependencies — object storage, the asynchronous
//! cross-match query service, bulk file retrieval — are consumed through the
//! traits defined here. The network-facing implementations live with the
//! deployment, not in this crate; what ships here is:
//!
//! * [`MemoryCache`] — an in-process [`BlobCache`] for tests and dry runs,
//! * [`FsCache`] — a directory-backed [`BlobCache`] for local work,
//! * [`HttpFetcher`] — a ureq-backed [`BulkFetch`].
//!
//! A **cache miss is not a failure**: [`ParallaxError::CacheMiss`] is the
//! one expected, handled condition, distinct from transport errors, which
//! propagate with their original cause attached.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use ahash::RandomState;
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};

use crate::parallax_errors::ParallaxError;

// -------------------------------------------------------------------------------------------------
// Blob cache
// -------------------------------------------------------------------------------------------------

/// Byte-blob store keyed by hierarchical string paths (`a/b/c`).
pub trait BlobCache {
    fn exists(&self, key: &str) -> Result<bool, ParallaxError>;
    /// Read a key. A missing key is [`ParallaxError::CacheMiss`].
    fn read(&self, key: &str) -> Result<Vec<u8>, ParallaxError>;
    fn write(&self, key: &str, data: &[u8]) -> Result<(), ParallaxError>;
}

/// Memoizing fetch-or-compute: if `key` is absent, run `compute` and store
/// the result; either way, return the cached bytes.
///
/// The read-check-then-write is **not atomic** across concurrent processes;
/// two racers may both compute and one write wins. The computation must
/// therefore be deterministic-enough that either result is acceptable.
pub fn fetch_or_compute<F>(
    cache: &dyn BlobCache,
    key: &str,
    compute: F,
) -> Result<Vec<u8>, ParallaxError>
where
    F: FnOnce() -> Result<Vec<u8>, ParallaxError>,
{
    if !cache.exists(key)? {
        info!("no cached value for {key}, computing it from scratch");
        let data = compute()?;
        cache.write(key, &data)?;
    }
    cache.read(key)
}

/// In-process blob cache backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    blobs: Mutex<HashMap<String, Vec<u8>, RandomState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

impl BlobCache for MemoryCache {
    fn exists(&self, key: &str) -> Result<bool, ParallaxError> {
        Ok(self.blobs.lock().expect("cache lock").contains_key(key))
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, ParallaxError> {
        self.blobs
            .lock()
            .expect("cache lock")
            .get(key)
            .cloned()
            .ok_or_else(|| ParallaxError::CacheMiss(key.to_string()))
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), ParallaxError> {
        self.blobs
            .lock()
            .expect("cache lock")
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// Directory-backed blob cache; keys map directly onto relative paths.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: Utf8PathBuf,
}

impl FsCache {
    pub fn new(root: impl AsRef<Utf8Path>) -> Self {
        FsCache {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> Utf8PathBuf {
        self.root.join(key)
    }
}

impl BlobCache for FsCache {
    fn exists(&self, key: &str) -> Result<bool, ParallaxError> {
        Ok(self.path(key).exists())
    }

    fn read(&self, key: &str) -> Result<Vec<u8>, ParallaxError> {
        let path = self.path(key);
        if !path.exists() {
            return Err(ParallaxError::CacheMiss(key.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<(), ParallaxError> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(path, data)?)
    }
}

// -------------------------------------------------------------------------------------------------
// Asynchronous query service
// -------------------------------------------------------------------------------------------------

/// Lifecycle phase of a submitted cross-match job (TAP-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Queued,
    Executing,
    Completed,
    Error,
    Aborted,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Error | JobPhase::Aborted)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Pending => "PENDING",
            JobPhase::Queued => "QUEUED",
            JobPhase::Executing => "EXECUTING",
            JobPhase::Completed => "COMPLETED",
            JobPhase::Error => "ERROR",
            JobPhase::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Asynchronous cross-match service: submit a query with an uploaded table,
/// poll until a terminal phase, fetch the result table.
pub trait QueryService {
    type Job;

    fn submit(&self, query: &str, upload: &[u8]) -> Result<Self::Job, ParallaxError>;
    fn poll(&self, job: &Self::Job) -> Result<JobPhase, ParallaxError>;
    fn fetch_results(&self, job: &Self::Job) -> Result<Vec<u8>, ParallaxError>;
}

/// Poll `job` at a fixed interval until it reaches a terminal phase, logging
/// each observed phase at INFO.
///
/// Return
/// ----------
/// * The result table on `Completed`, or
///   [`ParallaxError::QueryJobFailed`] for `Error`/`Aborted`.
pub fn await_job<S: QueryService>(
    service: &S,
    job: &S::Job,
    interval: Duration,
) -> Result<Vec<u8>, ParallaxError> {
    loop {
        let phase = service.poll(job)?;
        info!("job is {phase}");
        if phase.is_terminal() {
            return match phase {
                JobPhase::Completed => service.fetch_results(job),
                other => Err(ParallaxError::QueryJobFailed(other.to_string())),
            };
        }
        std::thread::sleep(interval);
    }
}

// -------------------------------------------------------------------------------------------------
// Bulk file retrieval
// -------------------------------------------------------------------------------------------------

/// Fetch one remote file; may fail per item.
pub trait BulkFetch {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ParallaxError>;
}

/// ureq-backed fetcher with a global request timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        HttpFetcher {
            agent: config.into(),
        }
    }
}

impl BulkFetch for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ParallaxError> {
        Ok(self.agent.get(url).call()?.body_mut().read_to_vec()?)
    }
}

/// Fetch a batch of files, skipping failures.
///
/// Each failure is logged with its URL and dropped; the batch never fails as
/// a whole. Missing spectra are handled downstream by the catalog/spectrum
/// alignment, which is why a partial batch is acceptable here.
pub fn fetch_many(fetcher: &dyn BulkFetch, urls: &[String]) -> Vec<(String, Vec<u8>)> {
    let mut fetched = Vec::with_capacity(urls.len());
    for url in urls {
        match fetcher.fetch(url) {
            Ok(data) => fetched.push((url.clone(), data)),
            Err(e) => warn!("failed on {url}: {e}"),
        }
    }
    fetched
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn memory_cache_miss_is_distinct_from_failure() {
        let cache = MemoryCache::new();
        assert!(!cache.exists("a/b").unwrap());
        assert!(matches!(
            cache.read("a/b"),
            Err(ParallaxError::CacheMiss(_))
        ));
        cache.write("a/b", b"xyz").unwrap();
        assert_eq!(cache.read("a/b").unwrap(), b"xyz");
    }

    #[test]
    fn fetch_or_compute_computes_exactly_once() {
        let cache = MemoryCache::new();
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"payload".to_vec())
        };
        assert_eq!(fetch_or_compute(&cache, "k", compute).unwrap(), b"payload");
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"payload".to_vec())
        };
        assert_eq!(fetch_or_compute(&cache, "k", compute).unwrap(), b"payload");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fs_cache_round_trips_nested_keys() {
        let root = std::env::temp_dir().join(format!(
            "parallax-fscache-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let root = Utf8PathBuf::from_path_buf(root).expect("utf8 temp dir");
        let cache = FsCache::new(&root);

        assert!(matches!(
            cache.read("models/v1.json"),
            Err(ParallaxError::CacheMiss(_))
        ));
        cache.write("models/v1.json", b"[1.0]").unwrap();
        assert!(cache.exists("models/v1.json").unwrap());
        assert_eq!(cache.read("models/v1.json").unwrap(), b"[1.0]");

        std::fs::remove_dir_all(root).ok();
    }

    struct ScriptedService {
        phases: Mutex<Vec<JobPhase>>,
        result: Vec<u8>,
    }

    impl QueryService for ScriptedService {
        type Job = ();

        fn submit(&self, _query: &str, _upload: &[u8]) -> Result<(), ParallaxError> {
            Ok(())
        }

        fn poll(&self, _job: &()) -> Result<JobPhase, ParallaxError> {
            let mut phases = self.phases.lock().unwrap();
            Ok(if phases.len() > 1 {
                phases.remove(0)
            } else {
                phases[0]
            })
        }

        fn fetch_results(&self, _job: &()) -> Result<Vec<u8>, ParallaxError> {
            Ok(self.result.clone())
        }
    }

    #[test]
    fn await_job_polls_until_completed() {
        let service = ScriptedService {
            phases: Mutex::new(vec![
                JobPhase::Queued,
                JobPhase::Executing,
                JobPhase::Completed,
            ]),
            result: b"table".to_vec(),
        };
        let job = service.submit("select 1", b"").unwrap();
        let table = await_job(&service, &job, Duration::from_millis(1)).unwrap();
        assert_eq!(table, b"table");
    }

    #[test]
    fn await_job_propagates_failure_phases() {
        let service = ScriptedService {
            phases: Mutex::new(vec![JobPhase::Executing, JobPhase::Error]),
            result: Vec::new(),
        };
        let job = service.submit("select 1", b"").unwrap();
        let result = await_job(&service, &job, Duration::from_millis(1));
        assert!(matches!(result, Err(ParallaxError::QueryJobFailed(p)) if p == "ERROR"));
    }

    struct FlakyFetcher;

    impl BulkFetch for FlakyFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, ParallaxError> {
            if url.contains("bad") {
                Err(ParallaxError::ExternalService("404".to_string()))
            } else {
                Ok(url.as_bytes().to_vec())
            }
        }
    }

    #[test]
    fn fetch_many_skips_failed_items() {
        let urls = vec![
            "https://data/one".to_string(),
            "https://data/bad".to_string(),
            "https://data/two".to_string(),
        ];
        let fetched = fetch_many(&FlakyFetcher, &urls);
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].0, "https://data/one");
        assert_eq!(fetched[1].0, "https://data/two");
    }
}
