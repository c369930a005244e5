//! Per-fingerprint pipeline: cache lookup, single-flight reservation,
//! landmark extraction, captioning and persistence.

use crate::cache::{Lease, Reservation, ResultCache};
use crate::config::Config;
use crate::error::{EngineError, PipelineError};
use captioner_core::{
    CacheEntry, CaptionGenerator, CaptionPolicy, CaptionRecord, Fingerprint, Image,
    LandmarkError, LandmarkExtractor, LandmarkRecord, probe_bounds,
};
use captioner_store::TableStore;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Pipeline state for one fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    Reserved,
    Extracting,
    /// Extraction found no landmarks; captioning proceeds unconditioned.
    CaptionsOnly,
    Captioning,
    Persisting,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Reserved => "reserved",
            Stage::Extracting => "extracting",
            Stage::CaptionsOnly => "captions-only",
            Stage::Captioning => "captioning",
            Stage::Persisting => "persisting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Entries in the result cache.
    pub cached: usize,
    pub in_flight: usize,
    pub cache_hits: u64,
    pub computed: u64,
    pub failed: u64,
}

enum CallFailure {
    TimedOut,
    Panicked,
    ShutDown,
}

struct Inner {
    extractor: Arc<dyn LandmarkExtractor>,
    generator: Arc<dyn CaptionGenerator>,
    cache: Arc<ResultCache>,
    store: TableStore,
    jobs: Arc<Semaphore>,
    max_jobs: u32,
    policy: CaptionPolicy,
    extract_timeout: Duration,
    generate_timeout: Duration,
    cache_hits: AtomicU64,
    computed: AtomicU64,
    failed: AtomicU64,
}

/// Clone-safe handle to the pipeline.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Open (and recover) the tables named by `config`, then build the pipeline.
    pub fn open(
        config: &Config,
        extractor: Arc<dyn LandmarkExtractor>,
        generator: Arc<dyn CaptionGenerator>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (store, report) = TableStore::open(&config.store_config())?;
        if !report.is_clean() {
            tracing::warn!(
                torn_tails = report.torn_tails,
                purged = report.purged_rows(),
                "startup recovery repaired the tables"
            );
        }
        Self::new(config, extractor, generator, store)
    }

    /// Build the pipeline over an already-open store. The cache is seeded
    /// from every entry the store holds.
    pub fn new(
        config: &Config,
        extractor: Arc<dyn LandmarkExtractor>,
        generator: Arc<dyn CaptionGenerator>,
        store: TableStore,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cache = Arc::new(ResultCache::from_entries(store.load()?));
        // validate() rejects counts that do not fit in u32
        let max_jobs = u32::try_from(config.max_concurrent_jobs).unwrap_or(u32::MAX);

        tracing::info!(
            cached = cache.len(),
            max_jobs,
            landmark_schema = %extractor.schema().version,
            generator = generator.version(),
            "orchestrator ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                extractor,
                generator,
                cache,
                store,
                jobs: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
                max_jobs,
                policy: config.caption_policy(),
                extract_timeout: config.extract_timeout(),
                generate_timeout: config.generate_timeout(),
                cache_hits: AtomicU64::new(0),
                computed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    /// Run the pipeline for `bytes`, or return the cached result.
    ///
    /// Concurrent calls for identical bytes share one computation. Dropping
    /// the returned future abandons the wait but not the computation.
    pub async fn process(&self, bytes: Vec<u8>) -> Result<CacheEntry, PipelineError> {
        let image = Image::new(bytes).map_err(|e| PipelineError::InvalidImage(e.to_string()))?;
        let fp = image.fingerprint();
        let inner = &self.inner;

        if let Some(entry) = inner.cache.get(&fp) {
            inner.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fingerprint = %fp, "cache hit");
            return Ok(entry);
        }

        match inner.cache.reserve(fp) {
            Reservation::InFlight(waiter) => {
                tracing::debug!(fingerprint = %fp, "joining in-flight computation");
                waiter.wait().await
            }
            Reservation::Leader(lease) => {
                transition(fp, Stage::New, Stage::Reserved);
                // A previous leader may have finished between get() and reserve()
                if let Some(entry) = inner.cache.get(&fp) {
                    inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                    lease.complete(Ok(entry.clone()));
                    return Ok(entry);
                }

                let worker = Arc::clone(inner);
                let handle = tokio::spawn(async move { worker.run(image, lease).await });
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::error!(fingerprint = %fp, error = %e, "pipeline task failed");
                        Err(PipelineError::Aborted)
                    }
                }
            }
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.inner.cache.get(fingerprint)
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn store(&self) -> &TableStore {
        &self.inner.store
    }

    pub fn stats(&self) -> OrchestratorStats {
        let inner = &self.inner;
        OrchestratorStats {
            cached: inner.cache.len(),
            in_flight: inner.cache.in_flight(),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            computed: inner.computed.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Wait for running model calls, refuse new ones, and flush both tables.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let drained = inner.jobs.acquire_many(inner.max_jobs).await;
        inner.jobs.close();
        drop(drained);
        inner.store.sync()?;
        tracing::info!(cached = inner.cache.len(), "orchestrator shut down");
        Ok(())
    }
}

impl Inner {
    async fn run(self: Arc<Self>, image: Image, lease: Lease) -> Result<CacheEntry, PipelineError> {
        let fp = lease.fingerprint();
        let result = self.compute(&image).await;

        match &result {
            Ok(entry) => {
                self.computed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    fingerprint = %fp,
                    landmarks = entry.has_landmarks(),
                    caption = %entry.caption.text,
                    "image processed"
                );
            }
            Err(PipelineError::CacheConsistency(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(fingerprint = %fp, error = %e, "conflicting result for fingerprint");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(fingerprint = %fp, error = %e, retryable = e.is_retryable(), "pipeline failed");
            }
        }

        lease.complete(result.clone());
        result
    }

    async fn compute(&self, image: &Image) -> Result<CacheEntry, PipelineError> {
        let fp = image.fingerprint();

        transition(fp, Stage::Reserved, Stage::Extracting);
        let landmarks = match self.extract(image).await {
            Ok(landmarks) => landmarks,
            Err(e) => return Err(fail(fp, Stage::Extracting, e)),
        };

        let stage = if landmarks.is_some() {
            Stage::Extracting
        } else {
            transition(fp, Stage::Extracting, Stage::CaptionsOnly);
            Stage::CaptionsOnly
        };
        transition(fp, stage, Stage::Captioning);
        let caption = match self.caption(image, landmarks.clone()).await {
            Ok(caption) => caption,
            Err(e) => return Err(fail(fp, Stage::Captioning, e)),
        };

        transition(fp, Stage::Captioning, Stage::Persisting);
        let entry = CacheEntry::new(caption, landmarks, Utc::now());
        if let Err(e) = self.persist(&entry) {
            return Err(fail(fp, Stage::Persisting, e));
        }

        transition(fp, Stage::Persisting, Stage::Done);
        Ok(entry)
    }

    /// `Ok(None)` when the extractor reports no landmarks.
    async fn extract(&self, image: &Image) -> Result<Option<LandmarkRecord>, PipelineError> {
        let extractor = Arc::clone(&self.extractor);
        let input = image.clone();
        let outcome = self
            .call_model(self.extract_timeout, move || {
                let schema = extractor.schema();
                let record = extractor.extract_landmarks(&input)?;
                record.validate(&schema, probe_bounds(input.bytes()))?;
                Ok::<_, LandmarkError>(record)
            })
            .await;

        match outcome {
            Ok(Ok(record)) if record.fingerprint == image.fingerprint() => Ok(Some(record)),
            Ok(Ok(record)) => Err(PipelineError::Extraction(LandmarkError::Backend(format!(
                "record is for {}",
                record.fingerprint.short()
            )))),
            Ok(Err(LandmarkError::NoLandmarksFound)) => Ok(None),
            Ok(Err(LandmarkError::InvalidImage(msg))) => Err(PipelineError::InvalidImage(msg)),
            Ok(Err(e)) => Err(PipelineError::Extraction(e)),
            Err(CallFailure::TimedOut) => Err(PipelineError::ExtractionTimeout {
                timeout_ms: self.extract_timeout.as_millis() as u64,
            }),
            Err(CallFailure::Panicked) => Err(PipelineError::Extraction(LandmarkError::Backend(
                "extractor panicked".into(),
            ))),
            Err(CallFailure::ShutDown) => Err(PipelineError::Aborted),
        }
    }

    async fn caption(
        &self,
        image: &Image,
        landmarks: Option<LandmarkRecord>,
    ) -> Result<CaptionRecord, PipelineError> {
        let generator = Arc::clone(&self.generator);
        let input = image.clone();
        let outcome = self
            .call_model(self.generate_timeout, move || {
                generator.generate_caption(&input, landmarks.as_ref())
            })
            .await;

        let raw = match outcome {
            Ok(result) => result.map_err(PipelineError::Generation)?,
            Err(CallFailure::TimedOut) => {
                return Err(PipelineError::GenerationTimeout {
                    timeout_ms: self.generate_timeout.as_millis() as u64,
                })
            }
            Err(CallFailure::Panicked) => {
                return Err(PipelineError::Generation(
                    captioner_core::CaptionError::Backend("generator panicked".into()),
                ))
            }
            Err(CallFailure::ShutDown) => return Err(PipelineError::Aborted),
        };

        CaptionRecord::build(image.fingerprint(), &raw, self.generator.version(), &self.policy)
            .map_err(PipelineError::Generation)
    }

    /// Consistency check, then landmarks row, captions row, and finally the
    /// cache. A failed append leaves nothing served that is not on disk.
    fn persist(&self, entry: &CacheEntry) -> Result<(), PipelineError> {
        self.cache.check(entry)?;
        self.store
            .append_entry(entry)
            .map_err(|e| PipelineError::Persist(e.to_string()))?;
        self.cache.put(entry.clone())?;
        Ok(())
    }

    /// Run a blocking model call under the concurrency limit and a deadline.
    ///
    /// On timeout the call keeps running on the blocking pool and keeps its
    /// permit until it returns; its result is discarded.
    async fn call_model<T, F>(&self, deadline: Duration, call: F) -> Result<T, CallFailure>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.jobs)
            .acquire_owned()
            .await
            .map_err(|_| CallFailure::ShutDown)?;
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call()
        });

        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CallFailure::Panicked),
            Err(_) => Err(CallFailure::TimedOut),
        }
    }
}

fn transition(fingerprint: Fingerprint, from: Stage, to: Stage) {
    tracing::debug!(fingerprint = %fingerprint, from = %from, to = %to, "stage transition");
}

fn fail(fingerprint: Fingerprint, from: Stage, error: PipelineError) -> PipelineError {
    transition(fingerprint, from, Stage::Failed);
    error
}
