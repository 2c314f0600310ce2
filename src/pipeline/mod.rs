//! Enrichment driver: ties provider → retry → store together.
//!
//! ## Phases
//!
//! `Scanning` derives pending identifiers from the file (once per run) and
//! hands them out as a queue. `Fetching` takes the next identifier, or the next
//! batch for batched providers, through the retry policy. `Applying` records
//! the outcomes in the store overlay. `MaybeFlushing` writes a checkpoint when
//! enough successes have accumulated, the queue is empty, or the run is
//! stopping, then sleeps the rate-limit interval. `Idle` ends the run.
//!
//! Strictly sequential: one provider call in flight at a time, with the
//! rate-limit sleep between any two calls, including the single-item
//! follow-ups of a batch. Interrupts abort the in-flight call and any sleep;
//! results fetched earlier in the same step are still applied, and
//! everything applied is flushed before returning.

use crate::config::PipelineConfig;
use crate::models::{Enrichment, VideoStats};
use crate::provider::StatsProvider;
use crate::retry::{Attempt, RetryPolicy};
use crate::store::DatasetStore;
use crate::utils::{fmt_duration, fmt_number, pct};
use anyhow::{Context, Result};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Interrupted,
    Blocked(String),
}

#[derive(Debug)]
pub struct PipelineStats {
    pub total: usize,
    pub processed: usize,
    pub resolved: usize,
    pub failed: usize,
    pub flushes: usize,
    /// Identifiers still pending on disk when the run ended.
    pub remaining: usize,
    pub elapsed: Duration,
    pub stop: StopReason,
}

impl PipelineStats {
    fn new() -> Self {
        Self {
            total: 0,
            processed: 0,
            resolved: 0,
            failed: 0,
            flushes: 0,
            remaining: 0,
            elapsed: Duration::ZERO,
            stop: StopReason::Completed,
        }
    }

    fn stopping(&self) -> bool {
        self.stop != StopReason::Completed
    }
}

/// Outcomes of one fetch step.
#[derive(Debug, Default)]
struct StepOutcome {
    results: Vec<(String, Enrichment)>,
    blocked: Option<String>,
    /// Cancelled part-way; `results` holds what was fetched before that.
    interrupted: bool,
}

enum Phase {
    Scanning,
    Fetching,
    Applying(StepOutcome),
    MaybeFlushing,
    Idle,
}

pub struct Pipeline {
    config: PipelineConfig,
    retry: RetryPolicy,
    provider: Arc<dyn StatsProvider>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, retry: RetryPolicy, provider: Arc<dyn StatsProvider>) -> Self {
        Self { config, retry, provider }
    }

    pub async fn run(
        &self,
        store: &mut DatasetStore,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PipelineStats> {
        let started = Instant::now();
        let batch_size = self.provider.batch_size().max(1);
        let checkpoint_every = self.config.checkpoint_every.max(1);

        let mut stats = PipelineStats::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut scanned = false;
        let mut since_flush = 0usize;
        let mut last_report = 0usize;
        let mut phase = Phase::Scanning;

        loop {
            phase = match phase {
                Phase::Scanning => {
                    if !scanned {
                        scanned = true;
                        queue = store
                            .scan_pending()
                            .context("Failed to scan dataset for pending videos")?
                            .into();
                        stats.total = queue.len();
                        if stats.total > 0 {
                            self.announce(stats.total, batch_size);
                            if self.config.start_delay_secs > 0 {
                                info!("Starting in {} seconds...", self.config.start_delay_secs);
                                let grace = Duration::from_secs(self.config.start_delay_secs);
                                if self.sleep_or_cancel(grace, &mut cancel).await {
                                    stats.stop = StopReason::Interrupted;
                                }
                            }
                        }
                    }

                    // an empty queue still flushes results recovered from a failed run
                    if stats.stopping() || queue.is_empty() {
                        Phase::MaybeFlushing
                    } else if is_cancelled(&cancel) {
                        stats.stop = StopReason::Interrupted;
                        Phase::MaybeFlushing
                    } else {
                        Phase::Fetching
                    }
                }

                Phase::Fetching => {
                    let take = batch_size.min(queue.len());
                    let batch: Vec<String> = queue.drain(..take).collect();

                    Phase::Applying(self.fetch_step(&batch, &mut cancel).await)
                }

                Phase::Applying(step) => {
                    for (id, enrichment) in step.results {
                        match &enrichment {
                            Enrichment::Resolved(_) => {
                                stats.resolved += 1;
                                since_flush += 1;
                            }
                            Enrichment::Unavailable => stats.failed += 1,
                        }
                        stats.processed += 1;
                        store.apply(&id, enrichment);
                    }

                    if let Some(reason) = step.blocked {
                        stats.stop = StopReason::Blocked(reason);
                    } else if step.interrupted {
                        stats.stop = StopReason::Interrupted;
                    }
                    Phase::MaybeFlushing
                }

                Phase::MaybeFlushing => {
                    let exhausted = queue.is_empty();
                    let stopping = stats.stopping();

                    if store.unflushed() > 0
                        && (since_flush >= checkpoint_every || exhausted || stopping)
                    {
                        self.checkpoint(store, &mut stats)?;
                        since_flush = 0;
                    }

                    if stats.processed > 0
                        && (stats.processed - last_report >= self.config.progress_every.max(1)
                            || exhausted)
                        && last_report != stats.processed
                    {
                        self.report_progress(&stats, started.elapsed());
                        last_report = stats.processed;
                    }

                    if stopping || exhausted {
                        Phase::Idle
                    } else if self.sleep_or_cancel(self.next_delay(), &mut cancel).await {
                        stats.stop = StopReason::Interrupted;
                        Phase::MaybeFlushing
                    } else {
                        Phase::Scanning
                    }
                }

                Phase::Idle => break,
            };
        }

        stats.remaining = store
            .scan_pending()
            .context("Failed to rescan dataset")?
            .len();
        stats.elapsed = started.elapsed();
        Ok(stats)
    }

    // ── Fetching ──────────────────────────────────────────────────────────────

    async fn fetch_step(&self, batch: &[String], cancel: &mut watch::Receiver<bool>) -> StepOutcome {
        if batch.is_empty() {
            StepOutcome::default()
        } else if self.provider.batch_size() > 1 {
            self.fetch_batch(batch, cancel).await
        } else {
            self.fetch_each(batch, cancel).await
        }
    }

    /// Single-item fetches, paced by the rate limit, stopping at the first
    /// block or interrupt. An interrupt aborts the in-flight call only.
    async fn fetch_each(&self, ids: &[String], cancel: &mut watch::Receiver<bool>) -> StepOutcome {
        let mut out = StepOutcome::default();
        for (i, id) in ids.iter().enumerate() {
            if i > 0 && self.sleep_or_cancel(self.next_delay(), cancel).await {
                out.interrupted = true;
                break;
            }

            let attempt = tokio::select! {
                biased;
                attempt = self.retry.run(id, || self.provider.fetch(id)) => Some(attempt),
                _ = wait_cancelled(cancel) => None,
            };
            let Some(attempt) = attempt else {
                debug!("Interrupted while fetching {}", id);
                out.interrupted = true;
                break;
            };

            match into_enrichment(id, attempt) {
                Ok(enrichment) => out.results.push((id.clone(), enrichment)),
                Err(reason) => {
                    out.blocked = Some(reason);
                    break;
                }
            }
        }
        out
    }

    /// Single-item follow-ups after a batch request, which counts as the
    /// previous request for pacing.
    async fn follow_up(&self, ids: &[String], cancel: &mut watch::Receiver<bool>) -> StepOutcome {
        if self.sleep_or_cancel(self.next_delay(), cancel).await {
            return StepOutcome { interrupted: true, ..Default::default() };
        }
        self.fetch_each(ids, cancel).await
    }

    async fn fetch_batch(&self, batch: &[String], cancel: &mut watch::Receiver<bool>) -> StepOutcome {
        let label = format!("batch of {} starting {}", batch.len(), batch[0]);
        let attempt = tokio::select! {
            biased;
            attempt = self.retry.run(&label, || self.provider.fetch_many(batch)) => Some(attempt),
            _ = wait_cancelled(cancel) => None,
        };
        let Some(attempt) = attempt else {
            debug!("Interrupted during {}", label);
            return StepOutcome { interrupted: true, ..Default::default() };
        };

        match attempt {
            Attempt::Resolved(mut found) => {
                let mut out = StepOutcome::default();
                let mut absent = Vec::new();
                for id in batch {
                    match found.remove(id) {
                        Some(stats) => out.results.push((id.clone(), Enrichment::Resolved(stats))),
                        None => absent.push(id.clone()),
                    }
                }
                if !absent.is_empty() {
                    debug!("{} ids missing from batch response, confirming individually", absent.len());
                    let confirmed = self.follow_up(&absent, cancel).await;
                    out.results.extend(confirmed.results);
                    out.blocked = confirmed.blocked;
                    out.interrupted = confirmed.interrupted;
                }
                out
            }
            Attempt::Unavailable(reason) => {
                warn!("Batch rejected ({}), falling back to single-item fetches", reason);
                self.follow_up(batch, cancel).await
            }
            Attempt::Exhausted(reason) => {
                warn!("Batch of {} marked unavailable after retries: {}", batch.len(), reason);
                StepOutcome {
                    results: batch
                        .iter()
                        .map(|id| (id.clone(), Enrichment::Unavailable))
                        .collect(),
                    ..Default::default()
                }
            }
            Attempt::Blocked(reason) => {
                error!("[Blocked] {}: {}", label, reason);
                StepOutcome { blocked: Some(reason), ..Default::default() }
            }
        }
    }

    // ── Checkpointing / pacing ────────────────────────────────────────────────

    fn checkpoint(&self, store: &mut DatasetStore, stats: &mut PipelineStats) -> Result<()> {
        match store.flush() {
            Ok(report) => {
                stats.flushes += 1;
                info!(
                    "  ✓ Checkpoint saved: {} videos, {} rows ({} successful so far)",
                    fmt_number(report.identifiers as i64),
                    fmt_number(report.rows_updated as i64),
                    fmt_number(stats.resolved as i64)
                );
                Ok(())
            }
            Err(e) => {
                error!("Checkpoint failed: {:#}", e);
                match store.save_recovery() {
                    Ok(path) => error!(
                        "{} unflushed results kept in {:?}; they are applied on the next run",
                        store.unflushed(),
                        path
                    ),
                    Err(e2) => error!("Could not write recovery file either: {:#}", e2),
                }
                Err(e.context("Checkpoint failed"))
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let (min, max) = (self.config.min_delay_ms, self.config.max_delay_ms);
        let ms = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }

    /// Returns true when the run was cancelled before `delay` elapsed.
    async fn sleep_or_cancel(&self, delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
        if is_cancelled(cancel) {
            return true;
        }
        if delay.is_zero() {
            return false;
        }
        tokio::select! {
            _ = sleep(delay) => false,
            _ = wait_cancelled(cancel) => true,
        }
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    fn announce(&self, total: usize, batch_size: usize) {
        let steps = total.div_ceil(batch_size);
        let avg_delay_ms = (self.config.min_delay_ms + self.config.max_delay_ms) / 2;
        let estimate = Duration::from_millis(avg_delay_ms.saturating_mul(steps as u64));

        info!(
            "Found {} unique videoIDs needing stats ({} via {})",
            fmt_number(total as i64),
            if batch_size > 1 {
                format!("{} requests of {}", fmt_number(steps as i64), batch_size)
            } else {
                "one request each".to_string()
            },
            self.provider.name()
        );
        info!(
            "Rate limit {}-{} ms | checkpoint every {} successes | pacing alone takes ~{}",
            self.config.min_delay_ms,
            self.config.max_delay_ms,
            self.config.checkpoint_every,
            fmt_duration(estimate)
        );
    }

    fn report_progress(&self, stats: &PipelineStats, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { stats.processed as f64 / secs } else { 0.0 };
        let left = stats.total.saturating_sub(stats.processed);
        let eta = if rate > 0.0 {
            fmt_duration(Duration::from_secs_f64(left as f64 / rate))
        } else {
            "?".to_string()
        };

        info!(
            "[{}/{}] {:.1}% | Success: {} | Failed: {} | Rate: {:.0}/hr | ETA: {}",
            fmt_number(stats.processed as i64),
            fmt_number(stats.total as i64),
            pct(stats.processed, stats.total),
            fmt_number(stats.resolved as i64),
            fmt_number(stats.failed as i64),
            rate * 3600.0,
            eta
        );
    }
}

/// Map a single-item attempt to what gets applied, or `Err(reason)` when blocked.
fn into_enrichment(id: &str, attempt: Attempt<VideoStats>) -> std::result::Result<Enrichment, String> {
    match attempt {
        Attempt::Resolved(stats) => Ok(Enrichment::Resolved(stats)),
        Attempt::Unavailable(reason) => {
            info!("[Unavailable] {}: {}", id, truncate(&reason, 100));
            Ok(Enrichment::Unavailable)
        }
        Attempt::Exhausted(_) => Ok(Enrichment::Unavailable),
        Attempt::Blocked(reason) => {
            error!("[Blocked] {}: {}", id, reason);
            Err(reason)
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Scripted = Result<VideoStats, ProviderError>;

    /// Replays a per-id script; ids without a script are unavailable.
    struct ScriptedProvider {
        batch_size: usize,
        script: Mutex<HashMap<String, VecDeque<Scripted>>>,
        calls: Mutex<Vec<String>>,
        batch_calls: Mutex<usize>,
        cancel_after_first: Option<watch::Sender<bool>>,
        /// Single fetches hang this long after signalling cancel.
        stall: Option<Duration>,
        reject_batches: bool,
        call_times: Mutex<Vec<Instant>>,
    }

    impl ScriptedProvider {
        fn new(batch_size: usize, script: Vec<(&str, Vec<Scripted>)>) -> Self {
            Self {
                batch_size,
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|(id, s)| (id.to_string(), s.into_iter().collect()))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                batch_calls: Mutex::new(0),
                cancel_after_first: None,
                stall: None,
                reject_batches: false,
                call_times: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, id: &str) -> Scripted {
            self.script
                .lock()
                .unwrap()
                .get_mut(id)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| Err(ProviderError::Unavailable("not scripted".into())))
        }
    }

    #[async_trait]
    impl StatsProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn batch_size(&self) -> usize {
            self.batch_size
        }

        async fn fetch(&self, video_id: &str) -> Result<VideoStats, ProviderError> {
            self.calls.lock().unwrap().push(video_id.to_string());
            self.call_times.lock().unwrap().push(Instant::now());
            if let Some(tx) = &self.cancel_after_first {
                tx.send(true).ok();
            }
            if let Some(stall) = self.stall {
                sleep(stall).await;
            }
            self.next(video_id)
        }

        async fn fetch_many(
            &self,
            video_ids: &[String],
        ) -> Result<HashMap<String, VideoStats>, ProviderError> {
            *self.batch_calls.lock().unwrap() += 1;
            if self.reject_batches {
                return Err(ProviderError::Unavailable("invalid request".into()));
            }
            let mut script = self.script.lock().unwrap();
            let mut out = HashMap::new();
            for id in video_ids {
                let Some(queue) = script.get_mut(id) else { continue };
                match queue.front() {
                    Some(Ok(_)) => {
                        if let Some(Ok(stats)) = queue.pop_front() {
                            out.insert(id.clone(), stats);
                        }
                    }
                    Some(Err(ProviderError::Transient(_))) | Some(Err(ProviderError::Blocked(_))) => {
                        if let Some(Err(e)) = queue.pop_front() {
                            return Err(e);
                        }
                    }
                    _ => {}
                }
            }
            Ok(out)
        }
    }

    fn stats(channel: &str) -> VideoStats {
        VideoStats {
            channel_id: channel.into(),
            views: 100,
            published: NaiveDate::from_ymd_opt(2023, 6, 1).unwrap(),
            likes: 5,
            comments: 1,
        }
    }

    fn pipeline_config(checkpoint_every: usize) -> PipelineConfig {
        PipelineConfig {
            min_delay_ms: 0,
            max_delay_ms: 0,
            checkpoint_every,
            progress_every: 1,
            start_delay_secs: 0,
        }
    }

    fn instant_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::ZERO, 1.5, Duration::ZERO)
    }

    fn dataset(dir: &TempDir, ids: &[&str]) -> PathBuf {
        let mut body = String::from("videoID,title,channelID,Views,Published,likes,comments\n");
        for (i, id) in ids.iter().enumerate() {
            body.push_str(&format!("{},title {},,,,,\n", id, i));
        }
        let path = dir.path().join("all_in_one.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn enrichment_cells(path: &Path) -> Vec<(String, Vec<String>)> {
        let mut r = csv::Reader::from_path(path).unwrap();
        r.records()
            .map(|rec| {
                let rec = rec.unwrap();
                (rec[0].to_string(), rec.iter().skip(2).map(str::to_string).collect())
            })
            .collect()
    }

    fn never_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_resolves_and_fails_with_broadcast() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["A", "A", "B"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![
                ("A", vec![Ok(stats("UCa"))]),
                ("B", vec![Err(ProviderError::Unavailable("deleted".into()))]),
            ],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.stop, StopReason::Completed);
        assert_eq!((summary.total, summary.resolved, summary.failed), (2, 1, 1));
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.remaining, 0);
        assert_eq!(provider.calls(), vec!["A", "B"]);

        let rows = enrichment_cells(&path);
        let resolved = vec!["UCa", "100", "2023-06-01", "5", "1"];
        assert_eq!(rows[0].1, resolved);
        assert_eq!(rows[1].1, resolved);
        assert_eq!(rows[2].1, vec!["", "-1", "", "-1", "-1"]);
        assert!(store.scan_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_within_bound_resolve() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["C"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![(
                "C",
                vec![
                    Err(ProviderError::Transient("timeout".into())),
                    Err(ProviderError::Transient("connection reset".into())),
                    Ok(stats("UCc")),
                ],
            )],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(enrichment_cells(&path)[0].1[0], "UCc");
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_failed() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["D"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![("D", vec![Err(ProviderError::Transient("timeout".into())); 5])],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(1), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(provider.calls().len(), 2);
        assert_eq!(enrichment_cells(&path)[0].1, vec!["", "-1", "", "-1", "-1"]);
    }

    #[tokio::test]
    async fn test_checkpoint_cadence() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["X", "Y", "Z"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![
                ("X", vec![Ok(stats("UCx"))]),
                ("Y", vec![Ok(stats("UCy"))]),
                ("Z", vec![Ok(stats("UCz"))]),
            ],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(2), instant_retry(3), provider);
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.resolved, 3);
        assert_eq!(summary.flushes, 2);
    }

    #[tokio::test]
    async fn test_blocking_stops_run_and_keeps_earlier_results() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["P", "Q", "R"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![
                ("P", vec![Ok(stats("UCp"))]),
                ("Q", vec![Err(ProviderError::Blocked("captcha".into()))]),
                ("R", vec![Ok(stats("UCr"))]),
            ],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.stop, StopReason::Blocked("captcha".into()));
        assert_eq!(provider.calls(), vec!["P", "Q"]);
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.remaining, 2);
        assert_eq!(store.scan_pending().unwrap(), vec!["Q", "R"]);
    }

    #[tokio::test]
    async fn test_interrupt_flushes_applied_results() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["P", "Q", "R"]);
        let (tx, rx) = watch::channel(false);
        let mut provider = ScriptedProvider::new(
            1,
            vec![("P", vec![Ok(stats("UCp"))]), ("Q", vec![Ok(stats("UCq"))])],
        );
        provider.cancel_after_first = Some(tx);
        let provider = Arc::new(provider);

        let mut config = pipeline_config(500);
        config.min_delay_ms = 10_000;
        config.max_delay_ms = 10_000;

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(config, instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, rx).await.unwrap();

        assert_eq!(summary.stop, StopReason::Interrupted);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.flushes, 1);
        assert_eq!(provider.calls(), vec!["P"]);
        assert_eq!(enrichment_cells(&path)[0].1[0], "UCp");
        assert_eq!(store.scan_pending().unwrap(), vec!["Q", "R"]);
    }

    #[tokio::test]
    async fn test_batched_provider_confirms_absent_ids() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["X", "Y", "Z"]);
        let provider = Arc::new(ScriptedProvider::new(
            2,
            vec![
                ("X", vec![Ok(stats("UCx"))]),
                ("Y", vec![Err(ProviderError::Unavailable("private".into()))]),
                ("Z", vec![Ok(stats("UCz"))]),
            ],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!((summary.resolved, summary.failed), (2, 1));
        assert_eq!(*provider.batch_calls.lock().unwrap(), 2);
        // only the id missing from the batch response is fetched on its own
        assert_eq!(provider.calls(), vec!["Y"]);
        assert_eq!(summary.remaining, 0);
    }

    #[tokio::test]
    async fn test_interrupt_during_confirmation_keeps_batch_results() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["X", "Y", "Z"]);
        let (tx, rx) = watch::channel(false);
        let mut provider = ScriptedProvider::new(
            3,
            vec![
                ("X", vec![Ok(stats("UCx"))]),
                ("Y", vec![Ok(stats("UCy"))]),
                ("Z", vec![Ok(stats("UCz"))]),
            ],
        );
        // Y is absent from the batch response; its confirmation hangs
        provider.script.lock().unwrap().get_mut("Y").unwrap().push_front(
            Err(ProviderError::Unavailable("missing".into())),
        );
        provider.cancel_after_first = Some(tx);
        provider.stall = Some(Duration::from_millis(50));
        let provider = Arc::new(provider);

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, rx).await.unwrap();

        assert_eq!(summary.stop, StopReason::Interrupted);
        assert_eq!(provider.calls(), vec!["Y"]);
        assert_eq!((summary.resolved, summary.failed), (2, 0));
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.remaining, 1);

        let rows = enrichment_cells(&path);
        assert_eq!(rows[0].1[0], "UCx");
        assert_eq!(rows[1].1, vec!["", "", "", "", ""]);
        assert_eq!(rows[2].1[0], "UCz");
        assert_eq!(store.scan_pending().unwrap(), vec!["Y"]);
    }

    #[tokio::test]
    async fn test_batch_fallback_is_rate_limited() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["A", "B", "C"]);
        let mut provider = ScriptedProvider::new(
            3,
            vec![
                ("A", vec![Ok(stats("UCa"))]),
                ("B", vec![Ok(stats("UCb"))]),
                ("C", vec![Ok(stats("UCc"))]),
            ],
        );
        provider.reject_batches = true;
        let provider = Arc::new(provider);

        let mut config = pipeline_config(500);
        config.min_delay_ms = 40;
        config.max_delay_ms = 40;

        let started = Instant::now();
        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(config, instant_retry(3), provider.clone());
        let summary = pipeline.run(&mut store, never_cancel()).await.unwrap();

        assert_eq!(summary.resolved, 3);
        assert_eq!(*provider.batch_calls.lock().unwrap(), 1);
        assert_eq!(provider.calls(), vec!["A", "B", "C"]);

        let times = provider.call_times.lock().unwrap().clone();
        assert!(times[0] - started >= Duration::from_millis(40));
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(40));
        }
    }

    #[tokio::test]
    async fn test_second_run_has_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        let path = dataset(&dir, &["A", "B"]);
        let provider = Arc::new(ScriptedProvider::new(
            1,
            vec![("A", vec![Ok(stats("UCa"))])],
        ));

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let pipeline = Pipeline::new(pipeline_config(500), instant_retry(3), provider.clone());
        pipeline.run(&mut store, never_cancel()).await.unwrap();

        let mut store = DatasetStore::open(&path, 100).unwrap();
        let again = pipeline.run(&mut store, never_cancel()).await.unwrap();
        assert_eq!(again.total, 0);
        assert_eq!(again.flushes, 0);
        assert_eq!(provider.calls().len(), 2);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
