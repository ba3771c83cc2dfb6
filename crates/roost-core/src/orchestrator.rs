//! Job orchestration.
//!
//! Every registered source gets a lane: a pending set ordered by
//! `(priority, scheduled_for, submission order)`, a table of every job the
//! lane has seen, and a fixed pool of workers. A worker only takes a job
//! when the source is not suspended and the rate limiter admits a request,
//! so running out of budget leaves the job pending without charging an
//! attempt.
//!
//! Job transitions are written through to the [`JobStore`]; when that fails
//! the error is logged and the in-memory lane stays authoritative.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classify::ErrorClassifier;
use crate::clock::{Clock, SystemClock, until};
use crate::config::PipelineConfig;
use crate::error::{AdapterError, AppError, ErrorKind, ScrapeError};
use crate::events::JobEvent;
use crate::health::{HealthMonitor, SourceHealth, SystemHealth};
use crate::job::{JobError, JobStatus, JobTarget, NewScrapeJob, ScrapeJob};
use crate::merge::{self, AddressKey};
use crate::models::{NormalizedProperty, SearchOutcome, Source};
use crate::normalize::Normalizer;
use crate::rate_limit::{RateLimitUsage, RateLimiter};
use crate::registry::AdapterRegistry;
use crate::traits::{JobStore, PropertyStore, ScraperAdapter};

/// Number of async locks merges are striped over, keyed by MLS number and zip.
const MERGE_LOCK_STRIPES: usize = 16;

/// Shortest nap a worker takes between dispatch attempts.
const MIN_NAP: Duration = Duration::from_millis(1);

/// Per-source counters plus the health and rate-limit views.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: Source,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
    pub rate_limit: RateLimitUsage,
    pub health: SourceHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    rank: u8,
    scheduled_for: DateTime<Utc>,
    seq: u64,
    id: Uuid,
}

#[derive(Default)]
struct LaneState {
    pending: BTreeSet<PendingKey>,
    jobs: HashMap<Uuid, ScrapeJob>,
    seq: u64,
}

impl LaneState {
    fn push_pending(&mut self, job: ScrapeJob) {
        self.seq += 1;
        self.pending.insert(PendingKey {
            rank: job.priority.rank(),
            scheduled_for: job.scheduled_for,
            seq: self.seq,
            id: job.id,
        });
        self.jobs.insert(job.id, job);
    }

    fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|j| j.status == status).count()
    }
}

struct Lane {
    source: Source,
    adapter: Arc<dyn ScraperAdapter>,
    workers: usize,
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    /// Acquires the lane lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(source = %self.source, "Recovered from poisoned lane mutex");
            poisoned.into_inner()
        })
    }
}

enum Dispatch {
    Run(ScrapeJob),
    Wait(Duration),
    Idle,
}

enum Failure {
    Adapter(AdapterError),
    Store(AppError),
}

/// One rate-limiter in-flight slot, released exactly once.
struct InFlightSlot<'a> {
    limiter: &'a RateLimiter,
    source: Source,
    released: AtomicBool,
}

impl<'a> InFlightSlot<'a> {
    fn new(limiter: &'a RateLimiter, source: Source) -> Self {
        Self {
            limiter,
            source,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.limiter.release(self.source);
        }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Inner<P, J> {
    lanes: HashMap<Source, Lane>,
    limiter: RateLimiter,
    health: HealthMonitor,
    classifier: ErrorClassifier,
    normalizer: Normalizer,
    properties: P,
    jobs: J,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<JobEvent>,
    config: PipelineConfig,
    merge_locks: Vec<tokio::sync::Mutex<()>>,
}

/// Cloneable handle to the pipeline. Clones share the same lanes.
pub struct Orchestrator<P, J> {
    inner: Arc<Inner<P, J>>,
}

impl<P, J> Clone for Orchestrator<P, J> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, J> Orchestrator<P, J>
where
    P: PropertyStore + 'static,
    J: JobStore + 'static,
{
    pub fn new(registry: AdapterRegistry, properties: P, jobs: J, config: PipelineConfig) -> Self {
        Self::with_clock(registry, properties, jobs, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: AdapterRegistry,
        properties: P,
        jobs: J,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sources = registry.sources();
        let lanes = sources
            .iter()
            .filter_map(|&source| {
                let adapter = registry.get(source)?;
                let lane = Lane {
                    source,
                    adapter,
                    workers: config.source(source).rate_limit.max_concurrent.max(1),
                    state: Mutex::new(LaneState::default()),
                    notify: Notify::new(),
                };
                Some((source, lane))
            })
            .collect();

        let limiter = RateLimiter::new(
            sources
                .iter()
                .map(|&source| (source, config.source(source).rate_limit)),
        );
        let health = HealthMonitor::new(config.health.clone());
        let classifier =
            ErrorClassifier::new(config.backoff.clone(), config.health.blocked_cooldown);
        let normalizer = Normalizer::new(config.normalizer.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let merge_locks = (0..MERGE_LOCK_STRIPES)
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();

        tracing::info!(?sources, "Orchestrator configured");

        Self {
            inner: Arc::new(Inner {
                lanes,
                limiter,
                health,
                classifier,
                normalizer,
                properties,
                jobs,
                clock,
                events,
                config,
                merge_locks,
            }),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    fn lane(&self, source: Source) -> Result<&Lane, AppError> {
        self.inner
            .lanes
            .get(&source)
            .ok_or(AppError::UnknownSource(source))
    }

    /// Sources with a lane, in a stable order.
    pub fn sources(&self) -> Vec<Source> {
        let mut sources: Vec<_> = self.inner.lanes.keys().copied().collect();
        sources.sort();
        sources
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Accept one job. The returned job is the acknowledgement.
    pub async fn add_job(&self, request: NewScrapeJob) -> Result<ScrapeJob, AppError> {
        let job = self.prepare(request, None)?;
        self.enqueue(job.clone()).await?;
        Ok(job)
    }

    /// Accept a group of jobs and follow them through a [`BatchHandle`].
    ///
    /// Every request is validated before any is queued.
    pub async fn add_batch(
        &self,
        requests: Vec<NewScrapeJob>,
    ) -> Result<BatchHandle<P, J>, AppError> {
        let batch_id = Uuid::new_v4();
        let jobs = requests
            .into_iter()
            .map(|request| self.prepare(request, Some(batch_id)))
            .collect::<Result<Vec<_>, _>>()?;

        let events = self.inner.events.subscribe();
        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        for job in jobs {
            self.enqueue(job).await?;
        }
        tracing::info!(%batch_id, jobs = job_ids.len(), "Batch submitted");

        Ok(BatchHandle {
            orchestrator: self.clone(),
            batch_id,
            remaining: job_ids.iter().copied().collect(),
            job_ids,
            events,
        })
    }

    fn prepare(&self, request: NewScrapeJob, batch_id: Option<Uuid>) -> Result<ScrapeJob, AppError> {
        let source = request.source;
        self.lane(source)?;
        request.validate().map_err(AppError::InvalidJob)?;
        let max_attempts = self.inner.config.source(source).max_attempts;
        Ok(request.into_job(self.now(), max_attempts, batch_id))
    }

    async fn enqueue(&self, job: ScrapeJob) -> Result<(), AppError> {
        let lane = self.lane(job.source)?;
        self.inner.jobs.save_job(&job).await?;

        let event = JobEvent::Queued {
            job_id: job.id,
            batch_id: job.batch_id,
            source: job.source,
            priority: job.priority,
        };
        lane.lock().push_pending(job);
        lane.notify.notify_one();
        self.emit(event);
        Ok(())
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel_job(&self, id: Uuid) -> Result<ScrapeJob, AppError> {
        let now = self.now();
        for lane in self.inner.lanes.values() {
            let cancelled = {
                let mut state = lane.lock();
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    return Err(AppError::InvalidJob(format!(
                        "job {id} is {} and cannot be cancelled",
                        job.status
                    )));
                }
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                let job = job.clone();
                state.pending.retain(|k| k.id != id);
                job
            };

            self.persist(&cancelled).await;
            self.emit(JobEvent::Cancelled {
                job_id: cancelled.id,
                batch_id: cancelled.batch_id,
                source: cancelled.source,
            });
            return Ok(cancelled);
        }
        Err(AppError::InvalidJob(format!("unknown job {id}")))
    }

    /// Reload unfinished jobs from the job store after a restart.
    ///
    /// Jobs that were `processing` go back to `pending` and keep the attempt
    /// they already used; one that has no attempts left is dead-lettered.
    /// Returns how many jobs were queued again.
    pub async fn recover(&self) -> Result<usize, AppError> {
        let unfinished = self.inner.jobs.list_unfinished().await?;
        let now = self.now();
        let mut recovered = 0;

        for mut job in unfinished {
            let Some(lane) = self.inner.lanes.get(&job.source) else {
                tracing::warn!(job_id = %job.id, source = %job.source, "Skipping job for unregistered source");
                continue;
            };
            let known = lane.lock().jobs.contains_key(&job.id);
            if known {
                continue;
            }

            let interrupted = job.status == JobStatus::Processing;
            job.status = JobStatus::Pending;
            job.started_at = None;

            if interrupted && !job.can_retry() {
                job.errors.push(JobError {
                    message: "interrupted by shutdown with no attempts left".into(),
                    timestamp: now,
                    kind: ErrorKind::Unknown,
                });
                job.status = JobStatus::DeadLettered;
                job.completed_at = Some(now);
                lane.lock().jobs.insert(job.id, job.clone());
                self.persist(&job).await;
                self.emit(JobEvent::DeadLettered {
                    job_id: job.id,
                    batch_id: job.batch_id,
                    source: job.source,
                    kind: ErrorKind::Unknown,
                    attempts: job.attempts,
                });
                continue;
            }

            if interrupted {
                self.persist(&job).await;
            }
            lane.lock().push_pending(job);
            lane.notify.notify_one();
            recovered += 1;
        }

        tracing::info!(recovered, "Recovered unfinished jobs");
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_job(&self, id: Uuid) -> Option<ScrapeJob> {
        self.inner
            .lanes
            .values()
            .find_map(|lane| lane.lock().jobs.get(&id).cloned())
    }

    /// Jobs filtered by source and status, oldest first.
    pub fn list_jobs(&self, source: Option<Source>, status: Option<JobStatus>) -> Vec<ScrapeJob> {
        let mut jobs: Vec<ScrapeJob> = self
            .inner
            .lanes
            .values()
            .filter(|lane| source.is_none_or(|s| s == lane.source))
            .flat_map(|lane| {
                lane.lock()
                    .jobs
                    .values()
                    .filter(|j| status.is_none_or(|s| s == j.status))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn dead_letters(&self) -> Vec<ScrapeJob> {
        self.list_jobs(None, Some(JobStatus::DeadLettered))
    }

    pub fn health(&self, source: Source) -> SourceHealth {
        self.inner.health.snapshot(source, self.now())
    }

    /// Health aggregated over every source.
    pub fn system_health(&self) -> SystemHealth {
        self.inner.health.system_health(self.now())
    }

    /// Forget a source's health record, lifting any suspension at once.
    pub fn reset_health(&self, source: Source) {
        self.inner.health.reset(source);
        if let Some(lane) = self.inner.lanes.get(&source) {
            lane.notify.notify_waiters();
        }
    }

    /// Drop one URL from a source's blocked list. Returns whether it was there.
    pub fn unblock_url(&self, source: Source, url: &str) -> bool {
        let removed = self.inner.health.unblock_url(source, url);
        if removed {
            tracing::info!(%source, %url, "URL manually unblocked");
        }
        removed
    }

    pub fn clear_blocked(&self, source: Source) {
        self.inner.health.clear_blocked(source);
        tracing::info!(%source, "Blocked URL list cleared");
    }

    pub fn get_stats(&self) -> Vec<SourceStats> {
        let now = self.now();
        self.sources()
            .into_iter()
            .filter_map(|source| {
                let lane = self.inner.lanes.get(&source)?;
                let (pending, processing, completed, dead_lettered, cancelled) = {
                    let state = lane.lock();
                    (
                        state.count(JobStatus::Pending),
                        state.count(JobStatus::Processing),
                        state.count(JobStatus::Completed),
                        state.count(JobStatus::DeadLettered),
                        state.count(JobStatus::Cancelled),
                    )
                };
                Some(SourceStats {
                    source,
                    pending,
                    processing,
                    completed,
                    dead_lettered,
                    cancelled,
                    rate_limit: self.inner.limiter.usage(source, now),
                    health: self.inner.health.snapshot(source, now),
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Workers
    // -----------------------------------------------------------------------

    /// Spawn every lane's worker pool. Cancelling the token stops workers
    /// between jobs; a job already running is finished first.
    pub fn start(&self, cancel_token: CancellationToken) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        for lane in self.inner.lanes.values() {
            for worker in 0..lane.workers {
                let orchestrator = self.clone();
                let cancel_token = cancel_token.clone();
                let source = lane.source;
                workers.spawn(async move {
                    orchestrator.run_worker(source, worker, cancel_token).await;
                });
            }
        }
        workers
    }

    async fn run_worker(&self, source: Source, worker: usize, cancel_token: CancellationToken) {
        let Some(lane) = self.inner.lanes.get(&source) else {
            return;
        };
        let poll_interval = self.inner.config.poll_interval;
        tracing::info!(%source, worker, "Worker started");

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            let nap = match self.next_job(lane) {
                Dispatch::Run(job) => {
                    self.process(lane, job).await;
                    continue;
                }
                Dispatch::Wait(wait) => wait.min(poll_interval).max(MIN_NAP),
                Dispatch::Idle => poll_interval.max(MIN_NAP),
            };

            tokio::select! {
                () = tokio::time::sleep(nap) => {}
                () = lane.notify.notified() => {}
                () = cancel_token.cancelled() => break,
            }
        }

        tracing::info!(%source, worker, "Worker stopped");
    }

    /// Pull the next runnable job off the lane, if the source may be hit now.
    fn next_job(&self, lane: &Lane) -> Dispatch {
        let source = lane.source;
        let now = self.now();
        let mut state = lane.lock();

        let Some(key) = state
            .pending
            .iter()
            .find(|k| k.scheduled_for <= now)
            .copied()
        else {
            return match state.pending.iter().map(|k| k.scheduled_for).min() {
                Some(at) => Dispatch::Wait(until(now, at)),
                None => Dispatch::Idle,
            };
        };

        if let Some(resume_at) = self.inner.health.suspended_until(source, now) {
            return Dispatch::Wait(until(now, resume_at));
        }
        if let Err(wait) = self.inner.limiter.try_acquire(source, now) {
            return Dispatch::Wait(wait);
        }

        state.pending.remove(&key);
        let Some(job) = state.jobs.get_mut(&key.id) else {
            self.inner.limiter.release(source);
            return Dispatch::Wait(Duration::ZERO);
        };
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        Dispatch::Run(job.clone())
    }

    async fn process(&self, lane: &Lane, mut job: ScrapeJob) {
        self.persist(&job).await;
        self.emit(JobEvent::Started {
            job_id: job.id,
            batch_id: job.batch_id,
            source: job.source,
            attempt: job.attempts,
        });

        let slot = InFlightSlot::new(&self.inner.limiter, lane.source);
        let attempt = AssertUnwindSafe(self.attempt(lane, &mut job, &slot))
            .catch_unwind()
            .await;
        slot.release();

        let failure = match attempt {
            Ok(failure) => failure,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(job_id = %job.id, source = %lane.source, panic = %message, "Scrape attempt panicked");
                Some(Failure::Adapter(AdapterError::Other(format!(
                    "scrape attempt panicked: {message}"
                ))))
            }
        };

        let now = self.now();
        let event = match failure {
            None => {
                self.inner.health.record_success(job.source, job.url(), now);
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                JobEvent::Completed {
                    job_id: job.id,
                    batch_id: job.batch_id,
                    source: job.source,
                    properties_found: job.properties_found,
                    properties_processed: job.properties_processed,
                }
            }
            Some(Failure::Adapter(e)) => {
                let error = self.inner.classifier.classify(&e, &job, now);
                self.inner.health.record_failure(&error, now);
                self.fail(&mut job, error, now)
            }
            Some(Failure::Store(e)) => {
                let error = self.inner.classifier.classify_store_error(&e, &job, now);
                self.fail(&mut job, error, now)
            }
        };

        {
            let mut state = lane.lock();
            if job.status == JobStatus::Pending {
                state.push_pending(job.clone());
            } else {
                state.jobs.insert(job.id, job.clone());
            }
        }
        self.persist(&job).await;
        self.emit(event);
    }

    /// Adapter call then ingestion. The limiter slot is freed as soon as the
    /// adapter returns.
    async fn attempt(&self, lane: &Lane, job: &mut ScrapeJob, slot: &InFlightSlot<'_>) -> Option<Failure> {
        let result = self.call_adapter(lane, job).await;
        slot.release();
        match result {
            Ok(outcome) => self.ingest(job, outcome).await.err(),
            Err(e) => Some(Failure::Adapter(e)),
        }
    }

    async fn call_adapter(&self, lane: &Lane, job: &ScrapeJob) -> Result<SearchOutcome, AdapterError> {
        let timeout = self.inner.config.request_timeout;
        let call = async {
            match &job.target {
                JobTarget::Url(url) => {
                    lane.adapter
                        .scrape_listing_url(url)
                        .await
                        .map(|record| SearchOutcome {
                            records: vec![record],
                            total_found: 1,
                            errors: Vec::new(),
                        })
                }
                JobTarget::Search(criteria) => lane.adapter.search_listings(criteria).await,
            }
        };
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(AdapterError::Timeout(timeout)))
    }

    /// Normalize and merge every record of a successful adapter call.
    async fn ingest(&self, job: &mut ScrapeJob, outcome: SearchOutcome) -> Result<(), Failure> {
        let SearchOutcome {
            records,
            total_found,
            errors,
        } = outcome;
        job.properties_found = u32::try_from(total_found.max(records.len())).unwrap_or(u32::MAX);
        job.properties_processed = 0;
        job.partial_errors = errors;

        for raw in &records {
            let property = match self.inner.normalizer.normalize(raw) {
                Ok(property) => property,
                Err(e) => {
                    tracing::debug!(job_id = %job.id, url = %raw.source_url, error = %e, "Listing rejected");
                    job.partial_errors.push(format!("{}: {e}", raw.source_url));
                    continue;
                }
            };
            self.store_property(property, raw.source, raw.scraped_at)
                .await
                .map_err(Failure::Store)?;
            job.properties_processed += 1;
        }

        if !records.is_empty() && job.properties_processed == 0 {
            let reason = job
                .partial_errors
                .last()
                .cloned()
                .unwrap_or_else(|| "no listing passed validation".into());
            return Err(Failure::Adapter(AdapterError::InvalidData(reason)));
        }
        Ok(())
    }

    async fn store_property(
        &self,
        incoming: NormalizedProperty,
        source: Source,
        scraped_at: DateTime<Utc>,
    ) -> Result<NormalizedProperty, AppError> {
        let mut _guards = Vec::with_capacity(2);
        for stripe in merge_stripes(&incoming, self.inner.merge_locks.len()) {
            _guards.push(self.inner.merge_locks[stripe].lock().await);
        }
        let store = &self.inner.properties;

        let by_mls = match &incoming.mls_number {
            Some(mls) => store.find_by_mls(mls).await?,
            None => None,
        };
        let by_address = if by_mls.is_none() {
            store
                .find_by_address(&AddressKey::of(&incoming.address))
                .await?
        } else {
            None
        };

        let existing = merge::resolve(by_mls, by_address, &incoming);
        let merged = merge::merge(existing.as_ref(), &incoming, source, scraped_at);
        store.upsert(&merged).await?;

        tracing::debug!(
            property_id = %merged.id,
            %source,
            merged_into_existing = existing.is_some(),
            "Property stored"
        );
        Ok(merged)
    }

    /// Record the failure on the job and decide between retry and dead letter.
    fn fail(&self, job: &mut ScrapeJob, error: ScrapeError, now: DateTime<Utc>) -> JobEvent {
        job.errors.push(JobError {
            message: error.message.clone(),
            timestamp: now,
            kind: error.kind,
        });

        if error.retryable && job.can_retry() {
            let retry_at = error.retry_after.unwrap_or(now);
            job.status = JobStatus::Pending;
            job.scheduled_for = retry_at;
            job.started_at = None;
            if let Some(priority) = ErrorClassifier::requeue_priority(error.kind) {
                job.priority = priority;
            }
            JobEvent::Retrying {
                job_id: job.id,
                batch_id: job.batch_id,
                source: job.source,
                kind: error.kind,
                attempt: job.attempts,
                retry_at,
            }
        } else {
            job.status = JobStatus::DeadLettered;
            job.completed_at = Some(now);
            JobEvent::DeadLettered {
                job_id: job.id,
                batch_id: job.batch_id,
                source: job.source,
                kind: error.kind,
                attempts: job.attempts,
            }
        }
    }

    async fn persist(&self, job: &ScrapeJob) {
        if let Err(e) = self.inner.jobs.save_job(job).await {
            tracing::error!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist job state");
        }
    }

    fn emit(&self, event: JobEvent) {
        event.log();
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

/// Lock stripes guarding a merge of `incoming`, ascending and distinct.
///
/// Both identity keys are covered: records sharing an MLS number or an
/// address zip always contend on a common stripe. Taking stripes in
/// ascending order keeps two merges from deadlocking.
fn merge_stripes(incoming: &NormalizedProperty, stripes: usize) -> Vec<usize> {
    let stripe = |key: &str| {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % stripes.max(1) as u64) as usize
    };
    let mut indices = vec![stripe(&incoming.address.zip)];
    if let Some(mls) = &incoming.mls_number {
        indices.push(stripe(mls));
    }
    indices.sort_unstable();
    indices.dedup();
    indices
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Event stream for one batch of jobs.
///
/// Yields the batch's events until every job has reached a terminal state.
/// If the subscriber falls behind the broadcast buffer, the handle catches
/// up from the job table instead of waiting forever.
pub struct BatchHandle<P, J> {
    orchestrator: Orchestrator<P, J>,
    batch_id: Uuid,
    job_ids: Vec<Uuid>,
    remaining: HashSet<Uuid>,
    events: broadcast::Receiver<JobEvent>,
}

impl<P, J> BatchHandle<P, J>
where
    P: PropertyStore + 'static,
    J: JobStore + 'static,
{
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn job_ids(&self) -> &[Uuid] {
        &self.job_ids
    }

    pub fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Next event for this batch, or `None` once every job is terminal.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            if self.remaining.is_empty() {
                return None;
            }
            match self.events.recv().await {
                Ok(event) if event.batch_id() == Some(self.batch_id) => {
                    if event.is_terminal() {
                        self.remaining.remove(&event.job_id());
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(batch_id = %self.batch_id, skipped, "Batch event stream lagged");
                    self.resync();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drain the stream and return the final state of every job.
    pub async fn wait(mut self) -> Vec<ScrapeJob> {
        while self.next().await.is_some() {}
        self.job_ids
            .iter()
            .filter_map(|id| self.orchestrator.get_job(*id))
            .collect()
    }

    fn resync(&mut self) {
        let orchestrator = &self.orchestrator;
        self.remaining.retain(|id| {
            orchestrator
                .get_job(*id)
                .is_some_and(|job| !job.status.is_terminal())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BackoffConfig;
    use crate::clock::ManualClock;
    use crate::health::HealthConfig;
    use crate::health::SystemStatus;
    use crate::job::{Priority, SearchCriteria};
    use crate::models::RawListingRecord;
    use crate::rate_limit::RateLimitConfig;
    use crate::store::MemoryStore;
    use crate::testutil::{MockAdapter, make_raw_listing, make_test_job};

    const WAIT: Duration = Duration::from_secs(10);

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_backoff(BackoffConfig::new(Duration::ZERO, Duration::ZERO));
        for source in Source::ALL {
            config = config.with_rate_limit(source, RateLimitConfig::new(1_000, 100_000));
        }
        config
    }

    fn orchestrator(
        adapters: &[MockAdapter],
        config: PipelineConfig,
    ) -> (Orchestrator<MemoryStore, MemoryStore>, MemoryStore) {
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(Arc::new(adapter.clone()));
        }
        let store = MemoryStore::new();
        let orchestrator = Orchestrator::new(registry, store.clone(), store.clone(), config);
        (orchestrator, store)
    }

    /// Panics on any URL containing "boom"; otherwise answers like the mock.
    struct PanickingAdapter {
        inner: MockAdapter,
    }

    #[async_trait::async_trait]
    impl ScraperAdapter for PanickingAdapter {
        fn source(&self) -> Source {
            self.inner.source()
        }

        async fn scrape_listing_url(&self, url: &str) -> Result<RawListingRecord, AdapterError> {
            if url.contains("boom") {
                panic!("layout bug on {url}");
            }
            self.inner.scrape_listing_url(url).await
        }

        async fn search_listings(&self, criteria: &SearchCriteria) -> Result<SearchOutcome, AdapterError> {
            self.inner.search_listings(criteria).await
        }
    }

    fn url(n: usize) -> String {
        format!("https://www.zillow.com/homedetails/{n}_zpid/")
    }

    async fn run_batch(
        orchestrator: &Orchestrator<MemoryStore, MemoryStore>,
        requests: Vec<NewScrapeJob>,
    ) -> Vec<ScrapeJob> {
        let handle = orchestrator.add_batch(requests).await.unwrap();
        tokio::time::timeout(WAIT, handle.wait())
            .await
            .expect("batch finished in time")
    }

    #[tokio::test]
    async fn test_submission_validates_source_and_request() {
        let (orchestrator, _) = orchestrator(&[MockAdapter::new(Source::Zillow)], fast_config());

        let err = orchestrator
            .add_job(NewScrapeJob::url(Source::Redfin, "https://www.redfin.com/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UnknownSource(Source::Redfin)));

        let err = orchestrator
            .add_job(NewScrapeJob::url(Source::Zillow, "not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidJob(_)));

        let job = orchestrator
            .add_job(NewScrapeJob::url(Source::Zillow, url(1)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(orchestrator.get_job(job.id).unwrap().id, job.id);
    }

    #[tokio::test]
    async fn test_priority_orders_dispatch() {
        let adapter = MockAdapter::new(Source::Zillow);
        let (orchestrator, _) = orchestrator(&[adapter.clone()], fast_config());

        let requests = vec![
            NewScrapeJob::url(Source::Zillow, url(1)).with_priority(Priority::Low),
            NewScrapeJob::url(Source::Zillow, url(2)).with_priority(Priority::High),
            NewScrapeJob::url(Source::Zillow, url(3)).with_priority(Priority::Medium),
        ];
        let handle = orchestrator.add_batch(requests).await.unwrap();

        let cancel = CancellationToken::new();
        let mut workers = orchestrator.start(cancel.clone());
        let jobs = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
        cancel.cancel();
        while workers.join_next().await.is_some() {}

        assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
        assert_eq!(adapter.calls(), vec![url(2), url(3), url(1)]);
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_requests() {
        let adapter = MockAdapter::new(Source::Zillow);
        let config = fast_config().with_rate_limit(
            Source::Zillow,
            RateLimitConfig::new(60, 3_600).with_min_delay(Duration::from_secs(1)),
        );
        let (orchestrator, _) = orchestrator(&[adapter.clone()], config);

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let requests = (0..5)
            .map(|n| NewScrapeJob::url(Source::Zillow, url(n)))
            .collect();
        let jobs = run_batch(&orchestrator, requests).await;
        cancel.cancel();

        assert_eq!(jobs.len(), 5);
        assert!(jobs.iter().all(|j| j.attempts == 1));
        let times = adapter.call_times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(900));
        }
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_source_limit() {
        let adapter = MockAdapter::new(Source::HomesCom).with_delay(Duration::from_millis(50));
        let config = fast_config().with_rate_limit(
            Source::HomesCom,
            RateLimitConfig::new(1_000, 100_000).with_max_concurrent(2),
        );
        let (orchestrator, _) = orchestrator(&[adapter.clone()], config);

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let requests = (0..6)
            .map(|n| NewScrapeJob::url(Source::HomesCom, format!("https://www.homes.com/property/{n}/")))
            .collect();
        run_batch(&orchestrator, requests).await;
        cancel.cancel();

        assert_eq!(adapter.call_count(), 6);
        assert!(adapter.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let adapter = MockAdapter::new(Source::Zillow);
        adapter.push_listing(Err(AdapterError::Network("connection reset".into())));
        let (orchestrator, _) = orchestrator(&[adapter.clone()], fast_config());

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(&orchestrator, vec![NewScrapeJob::url(Source::Zillow, url(1))]).await;
        cancel.cancel();

        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].kind, ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let adapter = MockAdapter::new(Source::Zillow);
        for _ in 0..3 {
            adapter.push_listing(Err(AdapterError::Network("down".into())));
        }
        let (orchestrator, _) = orchestrator(&[adapter.clone()], fast_config());

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let mut handle = orchestrator
            .add_batch(vec![NewScrapeJob::url(Source::Zillow, url(1))])
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(WAIT, handle.next()).await.unwrap() {
            events.push(event);
        }
        cancel.cancel();

        let retries = events
            .iter()
            .filter(|e| matches!(e, JobEvent::Retrying { .. }))
            .count();
        assert_eq!(retries, 2);
        assert!(matches!(
            events.last(),
            Some(JobEvent::DeadLettered { attempts: 3, kind: ErrorKind::NetworkError, .. })
        ));

        let dead = orchestrator.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, dead[0].max_attempts);
        assert_eq!(dead[0].errors.len(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_dead_letters_immediately() {
        let adapter = MockAdapter::new(Source::Redfin);
        adapter.push_listing(Err(AdapterError::Other("unexpected layout".into())));
        adapter.push_listing(Err(AdapterError::Other("unexpected layout".into())));
        let (orchestrator, _) = orchestrator(&[adapter.clone()], fast_config());

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(
            &orchestrator,
            vec![NewScrapeJob::url(Source::Redfin, "https://www.redfin.com/AZ/Phoenix/1").with_max_attempts(5)],
        )
        .await;
        cancel.cancel();

        // UNKNOWN gets one retry, the second is terminal.
        assert_eq!(jobs[0].status, JobStatus::DeadLettered);
        assert_eq!(jobs[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let adapter = MockAdapter::new(Source::Zillow).with_delay(Duration::from_millis(500));
        let config = fast_config().with_request_timeout(Duration::from_millis(20));
        let (orchestrator, _) = orchestrator(&[adapter], config);

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(
            &orchestrator,
            vec![NewScrapeJob::url(Source::Zillow, url(1)).with_max_attempts(1)],
        )
        .await;
        cancel.cancel();

        assert_eq!(jobs[0].status, JobStatus::DeadLettered);
        assert_eq!(jobs[0].errors[0].kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_suspended_source_is_not_dispatched() {
        let clock = ManualClock::default();
        let adapter = MockAdapter::new(Source::Zillow);
        for _ in 0..3 {
            adapter.push_listing(Err(AdapterError::Blocked("captcha".into())));
        }
        let config = fast_config().with_health(
            HealthConfig::default()
                .with_suspend_threshold(3)
                .with_suspend_cooldown(Duration::from_secs(15 * 60)),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter.clone()));
        let store = MemoryStore::new();
        let orchestrator =
            Orchestrator::with_clock(registry, store.clone(), store, config, Arc::new(clock.clone()));

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let blocked: Vec<_> = (0..3)
            .map(|n| NewScrapeJob::url(Source::Zillow, url(n)).with_max_attempts(1))
            .collect();
        run_batch(&orchestrator, blocked).await;

        assert!(orchestrator.inner.health.is_suspended(Source::Zillow, clock.now()));
        assert_eq!(orchestrator.health(Source::Zillow).status, crate::health::HealthStatus::Suspended);

        let handle = orchestrator
            .add_batch(vec![NewScrapeJob::url(Source::Zillow, url(9))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(adapter.call_count(), 3);
        let waiting = orchestrator.get_job(handle.job_ids()[0]).unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert_eq!(waiting.attempts, 0);

        clock.advance_std(Duration::from_secs(16 * 60));
        let jobs = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
        cancel.cancel();

        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(adapter.call_count(), 4);
        assert!(!orchestrator.inner.health.is_suspended(Source::Zillow, clock.now()));
    }

    #[tokio::test]
    async fn test_two_sources_merge_into_one_property() {
        let zillow = MockAdapter::new(Source::Zillow);
        let redfin = MockAdapter::new(Source::Redfin);
        let earlier = Utc::now() - chrono::Duration::hours(2);
        let later = earlier + chrono::Duration::hours(1);

        let mut z = make_raw_listing(Source::Zillow, "742 Evergreen Terrace", "85004", 400_000.0);
        z.scraped_at = earlier;
        let mut r = make_raw_listing(Source::Redfin, "742 Evergreen Terrace", "85004", 410_000.0);
        r.scraped_at = later;
        zillow.push_listing(Ok(z.clone()));
        redfin.push_listing(Ok(r.clone()));

        let (orchestrator, store) = orchestrator(&[zillow, redfin], fast_config());
        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        run_batch(
            &orchestrator,
            vec![
                NewScrapeJob::url(Source::Zillow, z.source_url.clone()),
                NewScrapeJob::url(Source::Redfin, r.source_url.clone()),
            ],
        )
        .await;
        cancel.cancel();

        let properties = store.properties();
        assert_eq!(properties.len(), 1);
        let property = &properties[0];
        assert_eq!(property.price, 410_000);
        assert!(property.data_sources.contains(&Source::Zillow));
        assert!(property.data_sources.contains(&Source::Redfin));
        assert_eq!(property.source_history.len(), 2);
    }

    #[tokio::test]
    async fn test_search_records_partial_errors() {
        let adapter = MockAdapter::new(Source::Redfin);
        let mut broken = make_raw_listing(Source::Redfin, "3 Pine Rd", "85004", 1.0);
        broken.price = None;
        adapter.push_search(Ok(SearchOutcome {
            records: vec![
                make_raw_listing(Source::Redfin, "1 Pine Rd", "85004", 300_000.0),
                make_raw_listing(Source::Redfin, "2 Pine Rd", "85004", 310_000.0),
                broken,
            ],
            total_found: 4,
            errors: vec!["card 4: no address".into()],
        }));
        let (orchestrator, store) = orchestrator(&[adapter], fast_config());

        let criteria = SearchCriteria {
            zip_code: Some("85004".into()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(&orchestrator, vec![NewScrapeJob::search(Source::Redfin, criteria)]).await;
        cancel.cancel();

        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.properties_found, 4);
        assert_eq!(job.properties_processed, 2);
        assert_eq!(job.partial_errors.len(), 2);
        assert_eq!(store.property_count(), 2);
    }

    #[tokio::test]
    async fn test_search_with_no_valid_records_is_invalid_data() {
        let adapter = MockAdapter::new(Source::Redfin);
        let mut broken = make_raw_listing(Source::Redfin, "3 Pine Rd", "85004", 1.0);
        broken.zip_code = None;
        adapter.push_search(Ok(SearchOutcome {
            records: vec![broken],
            total_found: 1,
            errors: Vec::new(),
        }));
        let (orchestrator, store) = orchestrator(&[adapter], fast_config());

        let criteria = SearchCriteria {
            city: Some("Phoenix".into()),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(
            &orchestrator,
            vec![NewScrapeJob::search(Source::Redfin, criteria).with_max_attempts(1)],
        )
        .await;
        cancel.cancel();

        assert_eq!(jobs[0].status, JobStatus::DeadLettered);
        assert_eq!(jobs[0].errors[0].kind, ErrorKind::InvalidData);
        assert_eq!(store.property_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_only_pending_jobs() {
        let (orchestrator, store) = orchestrator(&[MockAdapter::new(Source::Zillow)], fast_config());
        let mut events = orchestrator.subscribe();

        let job = orchestrator
            .add_job(NewScrapeJob::url(Source::Zillow, url(1)))
            .await
            .unwrap();
        let cancelled = orchestrator.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(orchestrator.cancel_job(job.id).await.is_err());
        assert!(orchestrator.cancel_job(Uuid::new_v4()).await.is_err());

        assert!(matches!(events.recv().await.unwrap(), JobEvent::Queued { .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Cancelled { .. }));

        let stats = orchestrator.get_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].cancelled, 1);
        assert_eq!(stats[0].pending, 0);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_list_jobs_filters() {
        let (orchestrator, _) = orchestrator(
            &[MockAdapter::new(Source::Zillow), MockAdapter::new(Source::Redfin)],
            fast_config(),
        );
        orchestrator
            .add_job(NewScrapeJob::url(Source::Zillow, url(1)))
            .await
            .unwrap();
        let redfin = orchestrator
            .add_job(NewScrapeJob::url(Source::Redfin, "https://www.redfin.com/1"))
            .await
            .unwrap();
        orchestrator.cancel_job(redfin.id).await.unwrap();

        assert_eq!(orchestrator.list_jobs(None, None).len(), 2);
        assert_eq!(orchestrator.list_jobs(Some(Source::Redfin), None).len(), 1);
        assert_eq!(
            orchestrator
                .list_jobs(None, Some(JobStatus::Pending))
                .len(),
            1
        );
        assert_eq!(orchestrator.sources(), vec![Source::Zillow, Source::Redfin]);
    }

    #[tokio::test]
    async fn test_recover_requeues_unfinished_jobs() {
        let store = MemoryStore::new();

        let pending = make_test_job(Source::Zillow, &url(1));
        let mut interrupted = make_test_job(Source::Zillow, &url(2));
        interrupted.status = JobStatus::Processing;
        interrupted.attempts = 1;
        let mut exhausted = make_test_job(Source::Zillow, &url(3));
        exhausted.status = JobStatus::Processing;
        exhausted.attempts = exhausted.max_attempts;
        let orphan = make_test_job(Source::HomesCom, "https://www.homes.com/property/1/");
        for job in [&pending, &interrupted, &exhausted, &orphan] {
            store.save_job(job).await.unwrap();
        }

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(MockAdapter::new(Source::Zillow)));
        let orchestrator = Orchestrator::new(registry, store.clone(), store.clone(), fast_config());

        assert_eq!(orchestrator.recover().await.unwrap(), 2);

        let job = orchestrator.get_job(interrupted.id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            orchestrator.get_job(exhausted.id).unwrap().status,
            JobStatus::DeadLettered
        );
        assert!(orchestrator.get_job(orphan.id).is_none());

        // A second call does not duplicate anything.
        assert_eq!(orchestrator.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_panicking_attempt_is_contained() {
        let adapter = MockAdapter::new(Source::Zillow);
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(PanickingAdapter {
            inner: adapter.clone(),
        }));
        let store = MemoryStore::new();
        let orchestrator = Orchestrator::new(registry, store.clone(), store, fast_config());

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let jobs = run_batch(
            &orchestrator,
            vec![
                NewScrapeJob::url(Source::Zillow, "https://www.zillow.com/homedetails/boom_zpid/")
                    .with_priority(Priority::High),
                NewScrapeJob::url(Source::Zillow, url(2)).with_priority(Priority::Low),
            ],
        )
        .await;
        cancel.cancel();

        // UNKNOWN gets one retry, then the job is dead-lettered.
        let broken = &jobs[0];
        assert_eq!(broken.status, JobStatus::DeadLettered);
        assert_eq!(broken.attempts, 2);
        assert!(broken.errors.iter().all(|e| e.kind == ErrorKind::Unknown));
        assert!(broken.errors[0].message.contains("panicked"));

        // The single worker survived and moved on to the next job.
        assert_eq!(jobs[1].status, JobStatus::Completed);
        assert_eq!(adapter.calls(), vec![url(2)]);

        let stats = orchestrator.get_stats();
        assert_eq!(stats[0].processing, 0);
        assert_eq!(stats[0].rate_limit.in_flight, 0);
    }

    #[test]
    fn test_merge_stripes_cover_both_identity_keys() {
        let mut a = Normalizer::default()
            .normalize(&make_raw_listing(Source::Zillow, "1 Elm St", "85004", 300_000.0))
            .unwrap();
        a.mls_number = Some("6543210".into());
        let mut b = a.clone();
        b.address.zip = "85251".into();
        let mut c = a.clone();
        c.mls_number = None;

        let (sa, sb, sc) = (
            merge_stripes(&a, MERGE_LOCK_STRIPES),
            merge_stripes(&b, MERGE_LOCK_STRIPES),
            merge_stripes(&c, MERGE_LOCK_STRIPES),
        );
        // Same MLS, different zip.
        assert!(sa.iter().any(|s| sb.contains(s)));
        // Same zip, one side without MLS.
        assert!(sa.iter().any(|s| sc.contains(s)));
        for stripes in [&sa, &sb, &sc] {
            assert!(stripes.windows(2).all(|w| w[0] < w[1]));
            assert!(stripes.iter().all(|s| *s < MERGE_LOCK_STRIPES));
        }
        assert_eq!(sc.len(), 1);
    }

    #[tokio::test]
    async fn test_same_mls_from_two_zips_merges_once() {
        let zillow = MockAdapter::new(Source::Zillow).with_delay(Duration::from_millis(20));
        let redfin = MockAdapter::new(Source::Redfin).with_delay(Duration::from_millis(20));
        let mut z = make_raw_listing(Source::Zillow, "10 Palm Ln", "85004", 500_000.0);
        z.mls_number = Some("MLS# 6543210".into());
        let mut r = make_raw_listing(Source::Redfin, "10 Palm Lane", "85008", 505_000.0);
        r.mls_number = Some("6543210".into());
        zillow.push_listing(Ok(z.clone()));
        redfin.push_listing(Ok(r.clone()));

        let (orchestrator, store) = orchestrator(&[zillow, redfin], fast_config());
        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        run_batch(
            &orchestrator,
            vec![
                NewScrapeJob::url(Source::Zillow, z.source_url.clone()),
                NewScrapeJob::url(Source::Redfin, r.source_url.clone()),
            ],
        )
        .await;
        cancel.cancel();

        let properties = store.properties();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties[0].mls_number.as_deref(), Some("6543210"));
        assert_eq!(properties[0].data_sources.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_health_lifts_suspension() {
        let clock = ManualClock::default();
        let adapter = MockAdapter::new(Source::Zillow);
        for _ in 0..2 {
            adapter.push_listing(Err(AdapterError::Blocked("captcha".into())));
        }
        let config = fast_config().with_health(HealthConfig::default().with_suspend_threshold(2));
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter.clone()));
        let store = MemoryStore::new();
        let orchestrator =
            Orchestrator::with_clock(registry, store.clone(), store, config, Arc::new(clock.clone()));

        let cancel = CancellationToken::new();
        let _workers = orchestrator.start(cancel.clone());
        let blocked: Vec<_> = (0..2)
            .map(|n| NewScrapeJob::url(Source::Zillow, url(n)).with_max_attempts(1))
            .collect();
        run_batch(&orchestrator, blocked).await;

        let health = orchestrator.health(Source::Zillow);
        assert_eq!(health.status, crate::health::HealthStatus::Suspended);
        assert_eq!(health.blocked_count, 2);
        let system = orchestrator.system_health();
        assert_eq!(system.status, SystemStatus::Degraded);
        assert_eq!(system.suspended_sources, vec![Source::Zillow]);

        assert!(orchestrator.unblock_url(Source::Zillow, &url(0)));
        assert!(!orchestrator.unblock_url(Source::Zillow, &url(0)));
        assert_eq!(orchestrator.health(Source::Zillow).blocked_count, 1);
        orchestrator.clear_blocked(Source::Zillow);
        assert_eq!(orchestrator.health(Source::Zillow).blocked_count, 0);

        // Still suspended; only the reset lets the next job through.
        let handle = orchestrator
            .add_batch(vec![NewScrapeJob::url(Source::Zillow, url(5))])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(adapter.call_count(), 2);

        orchestrator.reset_health(Source::Zillow);
        let jobs = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
        cancel.cancel();

        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(orchestrator.health(Source::Zillow).status, crate::health::HealthStatus::Healthy);
        assert_eq!(orchestrator.system_health().status, SystemStatus::Healthy);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_finishes_in_flight_job() {
        let adapter = MockAdapter::new(Source::Zillow).with_delay(Duration::from_millis(100));
        let (orchestrator, _) = orchestrator(&[adapter], fast_config());

        let cancel = CancellationToken::new();
        let mut workers = orchestrator.start(cancel.clone());
        let job = orchestrator
            .add_job(NewScrapeJob::url(Source::Zillow, url(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        while workers.join_next().await.is_some() {}

        assert_eq!(
            orchestrator.get_job(job.id).unwrap().status,
            JobStatus::Completed
        );
    }
}
