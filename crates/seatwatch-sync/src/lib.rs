//! Ingest orchestration: environment configuration, the time-gated per-minute
//! ingest cycle, branch open/closed bookkeeping, history retention, and the
//! cron wiring that drives all of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use seatwatch_core::{AreaObservation, OpeningHours, TimeWindowPolicy, WeekendRule};
use seatwatch_storage::SeatStore;
use seatwatch_upstream::{normalize, FetchStrategyChain, UpstreamConfig, FALLBACK_PAYLOAD};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "seatwatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_url: String,
    pub site_root: String,
    pub areas_page: String,
    pub open_time: NaiveTime,
    pub close_time: NaiveTime,
    pub weekend_open_time: NaiveTime,
    pub weekend_close_time: NaiveTime,
    pub weekend_days: WeekendRule,
    pub utc_offset: FixedOffset,
    pub closing_window_minutes: i64,
    pub retention_days: u64,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub web_port: u16,
}

fn env_time(key: &str, default: NaiveTime) -> NaiveTime {
    std::env::var(key)
        .ok()
        .and_then(|v| {
            NaiveTime::parse_from_str(v.trim(), "%H:%M")
                .or_else(|_| NaiveTime::parse_from_str(v.trim(), "%H:%M:%S"))
                .ok()
        })
        .unwrap_or(default)
}

/// Parses `+08:00` / `-05:30` style offsets.
fn parse_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    let (sign, rest) = match value.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, value.strip_prefix('+').unwrap_or(value)),
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("SEATWATCH_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://seatwatch.db?mode=rwc".to_string()),
            api_url: std::env::var("SEATWATCH_API_URL")
                .unwrap_or_else(|_| UpstreamConfig::default().api_url),
            site_root: std::env::var("SEATWATCH_SITE_ROOT")
                .unwrap_or_else(|_| UpstreamConfig::default().site_root),
            areas_page: std::env::var("SEATWATCH_AREAS_PAGE")
                .unwrap_or_else(|_| UpstreamConfig::default().areas_page),
            open_time: env_time("SEATWATCH_OPEN_TIME", NaiveTime::from_hms_opt(8, 30, 0).expect("valid constant time")),
            close_time: env_time("SEATWATCH_CLOSE_TIME", NaiveTime::from_hms_opt(21, 0, 0).expect("valid constant time")),
            weekend_open_time: env_time(
                "SEATWATCH_WEEKEND_OPEN_TIME",
                NaiveTime::from_hms_opt(9, 0, 0).expect("valid constant time"),
            ),
            weekend_close_time: env_time(
                "SEATWATCH_WEEKEND_CLOSE_TIME",
                NaiveTime::from_hms_opt(17, 0, 0).expect("valid constant time"),
            ),
            weekend_days: std::env::var("SEATWATCH_WEEKEND_DAYS")
                .ok()
                .and_then(|v| WeekendRule::parse(&v))
                .unwrap_or_else(WeekendRule::saturday_sunday),
            utc_offset: std::env::var("SEATWATCH_UTC_OFFSET")
                .ok()
                .and_then(|v| parse_offset(&v))
                .or_else(|| FixedOffset::east_opt(8 * 3600))
                .unwrap_or_else(|| Utc.fix()),
            closing_window_minutes: std::env::var("SEATWATCH_CLOSING_WINDOW_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            retention_days: std::env::var("SEATWATCH_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_timeout_secs: std::env::var("SEATWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            scheduler_enabled: std::env::var("SEATWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            web_port: std::env::var("SEATWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            api_url: self.api_url.clone(),
            site_root: self.site_root.clone(),
            areas_page: self.areas_page.clone(),
            timeout: StdDuration::from_secs(self.http_timeout_secs),
        }
    }

    pub fn policy(&self) -> TimeWindowPolicy {
        TimeWindowPolicy::new(
            OpeningHours {
                weekday_open: self.open_time,
                weekday_close: self.close_time,
                weekend_open: self.weekend_open_time,
                weekend_close: self.weekend_close_time,
            },
            self.weekend_days.clone(),
            Duration::minutes(self.closing_window_minutes),
        )
    }

    /// Wall-clock time in the library's zone, never the host's.
    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.utc_offset).naive_local()
    }
}

/// Where one cycle's payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Live,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub source: PayloadSource,
    pub records: Vec<AreaObservation>,
}

/// What a scheduled tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Disabled,
    OutsideHours,
    Ingested { source: PayloadSource, records: usize },
}

/// Fetch, normalize, dual-write. One instance is shared by the scheduler
/// jobs and the manual trigger endpoints.
pub struct IngestService {
    chain: FetchStrategyChain,
    store: SeatStore,
    policy: TimeWindowPolicy,
    enabled: Arc<AtomicBool>,
}

impl IngestService {
    pub fn new(
        chain: FetchStrategyChain,
        store: SeatStore,
        policy: TimeWindowPolicy,
        enabled: bool,
    ) -> Self {
        Self {
            chain,
            store,
            policy,
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "ingest scheduler flag changed");
    }

    /// The scheduled entry point: skips silently when the flag is off or the
    /// library is outside its opening window.
    pub async fn tick(&self, now: NaiveDateTime) -> Result<CycleOutcome> {
        if !self.is_enabled() {
            return Ok(CycleOutcome::Disabled);
        }
        if !self.policy.is_open_at(now) {
            return Ok(CycleOutcome::OutsideHours);
        }
        let report = self.ingest_now(now).await?;
        Ok(CycleOutcome::Ingested {
            source: report.source,
            records: report.records.len(),
        })
    }

    /// Runs a cycle unconditionally, stamping records with `observed_at`.
    /// Used by the tick (with the current time), the manual fetch endpoint,
    /// and the closing capture (with the official close time).
    pub async fn ingest_now(&self, observed_at: NaiveDateTime) -> Result<IngestReport> {
        let (source, records) = match self.chain.fetch().await {
            Some(payload) => match normalize(&payload, observed_at) {
                Ok(records) => (PayloadSource::Live, records),
                Err(err) => {
                    warn!(error = %err, "live payload failed to parse; using fallback dataset");
                    (PayloadSource::Fallback, self.fallback_records(observed_at)?)
                }
            },
            None => (PayloadSource::Fallback, self.fallback_records(observed_at)?),
        };

        self.store
            .record_batch(&records)
            .await
            .context("recording ingest batch")?;
        info!(?source, records = records.len(), %observed_at, "ingest cycle complete");
        Ok(IngestReport { source, records })
    }

    /// Scheduled closing-time variant of the cycle: honors the enabled flag
    /// but not the opening-hours gate (the close instant sits at the window
    /// edge by definition). `None` means the flag suppressed the capture.
    pub async fn capture_closing(&self, stamp: NaiveDateTime) -> Result<Option<IngestReport>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        self.ingest_now(stamp).await.map(Some)
    }

    /// Runs the fetch chain without persisting anything, for diagnostics.
    pub async fn probe_upstream(&self) -> Option<String> {
        self.chain.fetch().await
    }

    fn fallback_records(&self, observed_at: NaiveDateTime) -> Result<Vec<AreaObservation>> {
        normalize(FALLBACK_PAYLOAD, observed_at).context("parsing fallback dataset")
    }
}

/// Per-branch open/closed bookkeeping and the once-per-day closing capture
/// latch.
pub struct BranchScheduleGate {
    store: SeatStore,
    closing_window: Duration,
    captured_on: Mutex<HashMap<String, NaiveDate>>,
}

impl BranchScheduleGate {
    pub fn new(store: SeatStore, closing_window: Duration) -> Self {
        Self {
            store,
            closing_window,
            captured_on: Mutex::new(HashMap::new()),
        }
    }

    /// Recomputes each branch's open flag from its own window and persists
    /// only actual transitions. Returns how many branches changed state.
    pub async fn refresh_branch_flags(&self, now: NaiveDateTime) -> Result<usize> {
        let branches = self.store.branches().await.context("loading branches")?;
        let mut changed = 0;
        for branch in &branches {
            let open_now = TimeWindowPolicy::is_branch_open_at(branch, now);
            if self
                .store
                .set_branch_open(&branch.branch_name, open_now)
                .await
                .context("updating branch flag")?
            {
                changed += 1;
                info!(branch = %branch.branch_name, open = open_now, "branch status transition");
            }
        }
        Ok(changed)
    }

    /// Branches inside their closing window that have not yet had today's
    /// end-of-day capture. Each returned entry carries the timestamp the
    /// capture must be stamped with: the branch's official close time, not
    /// the moment the check happened to run.
    ///
    /// Read-only: a branch stays due until [`Self::mark_captured`] confirms
    /// its capture landed, so a failed write is retried on the next minute
    /// inside the window.
    pub async fn closing_captures_due(
        &self,
        now: NaiveDateTime,
    ) -> Result<Vec<(String, NaiveDateTime)>> {
        let branches = self.store.branches().await.context("loading branches")?;
        let captured = self.captured_on.lock().await;
        let today = now.date();

        let mut due = Vec::new();
        for branch in &branches {
            if !TimeWindowPolicy::branch_within_closing_window_at(branch, now, self.closing_window) {
                continue;
            }
            if captured.get(&branch.branch_name) == Some(&today) {
                continue;
            }
            due.push((branch.branch_name.clone(), today.and_time(branch.close_time)));
        }
        Ok(due)
    }

    /// Arms the once-per-day latch after a successful capture.
    pub async fn mark_captured(&self, branch: &str, date: NaiveDate) {
        self.captured_on.lock().await.insert(branch.to_string(), date);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: i64,
    pub deleted: u64,
}

/// Deletes history older than the retention horizon. Counts first so the
/// log always says what a sweep was about to remove.
pub struct RetentionSweeper {
    store: SeatStore,
    retention_days: u64,
}

impl RetentionSweeper {
    pub fn new(store: SeatStore, retention_days: u64) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    pub async fn sweep(&self, now: NaiveDateTime) -> Result<SweepReport> {
        let cutoff = now
            .checked_sub_days(Days::new(self.retention_days))
            .unwrap_or(NaiveDateTime::MIN);
        let candidates = self
            .store
            .count_history_before(cutoff)
            .await
            .context("counting expired history")?;
        info!(%cutoff, candidates, "retention sweep starting");
        let deleted = self
            .store
            .delete_history_before(cutoff)
            .await
            .context("deleting expired history")?;
        info!(deleted, "retention sweep finished");
        Ok(SweepReport { candidates, deleted })
    }
}

/// Owns the long-running pieces and knows how to wire them onto a cron
/// scheduler.
pub struct SyncService {
    pub config: SyncConfig,
    pub store: SeatStore,
    pub ingest: Arc<IngestService>,
    pub gate: Arc<BranchScheduleGate>,
    pub sweeper: Arc<RetentionSweeper>,
}

impl SyncService {
    pub fn new(config: SyncConfig, store: SeatStore) -> Result<Self> {
        let chain = FetchStrategyChain::live(config.upstream())?;
        let ingest = Arc::new(IngestService::new(
            chain,
            store.clone(),
            config.policy(),
            config.scheduler_enabled,
        ));
        let gate = Arc::new(BranchScheduleGate::new(
            store.clone(),
            Duration::minutes(config.closing_window_minutes),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(store.clone(), config.retention_days));
        Ok(Self {
            config,
            store,
            ingest,
            gate,
            sweeper,
        })
    }

    /// Builds the scheduler with all four jobs. Each job holds its own guard
    /// mutex; an overlapping firing is skipped, not queued.
    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;

        let ingest = self.ingest.clone();
        let config = self.config.clone();
        let guard = Arc::new(Mutex::new(()));
        let job = Job::new_async("0 * * * * *", move |_uuid, _lock| {
            let ingest = ingest.clone();
            let config = config.clone();
            let guard = guard.clone();
            Box::pin(async move {
                let Ok(_held) = guard.try_lock() else {
                    warn!("previous ingest cycle still running; skipping this minute");
                    return;
                };
                match ingest.tick(config.local_now()).await {
                    Ok(outcome) => info!(?outcome, "ingest tick"),
                    Err(err) => warn!(error = %err, "ingest tick failed"),
                }
            })
        })
        .context("creating ingest job")?;
        scheduler.add(job).await.context("adding ingest job")?;

        let ingest = self.ingest.clone();
        let gate = self.gate.clone();
        let config = self.config.clone();
        let guard = Arc::new(Mutex::new(()));
        let job = Job::new_async("0 * * * * *", move |_uuid, _lock| {
            let ingest = ingest.clone();
            let gate = gate.clone();
            let config = config.clone();
            let guard = guard.clone();
            Box::pin(async move {
                let Ok(_held) = guard.try_lock() else {
                    return;
                };
                let now = config.local_now();
                let due = match gate.closing_captures_due(now).await {
                    Ok(due) => due,
                    Err(err) => {
                        warn!(error = %err, "closing check failed");
                        return;
                    }
                };
                for (branch, stamp) in due {
                    match ingest.capture_closing(stamp).await {
                        Ok(Some(_)) => {
                            info!(%branch, %stamp, "captured end-of-day state");
                            gate.mark_captured(&branch, now.date()).await;
                        }
                        Ok(None) => {
                            debug!(%branch, "ingestion disabled; skipping closing capture");
                        }
                        Err(err) => {
                            warn!(%branch, error = %err, "closing capture failed");
                        }
                    }
                }
            })
        })
        .context("creating closing capture job")?;
        scheduler.add(job).await.context("adding closing capture job")?;

        let gate = self.gate.clone();
        let config = self.config.clone();
        let guard = Arc::new(Mutex::new(()));
        let job = Job::new_async("0 0 * * * *", move |_uuid, _lock| {
            let gate = gate.clone();
            let config = config.clone();
            let guard = guard.clone();
            Box::pin(async move {
                let Ok(_held) = guard.try_lock() else {
                    return;
                };
                match gate.refresh_branch_flags(config.local_now()).await {
                    Ok(changed) => info!(changed, "branch status refresh"),
                    Err(err) => warn!(error = %err, "branch status refresh failed"),
                }
            })
        })
        .context("creating branch status job")?;
        scheduler.add(job).await.context("adding branch status job")?;

        let sweeper = self.sweeper.clone();
        let config = self.config.clone();
        let guard = Arc::new(Mutex::new(()));
        let job = Job::new_async("0 0 2 * * *", move |_uuid, _lock| {
            let sweeper = sweeper.clone();
            let config = config.clone();
            let guard = guard.clone();
            Box::pin(async move {
                let Ok(_held) = guard.try_lock() else {
                    return;
                };
                if let Err(err) = sweeper.sweep(config.local_now()).await {
                    warn!(error = %err, "retention sweep failed");
                }
            })
        })
        .context("creating retention job")?;
        scheduler.add(job).await.context("adding retention job")?;

        Ok(scheduler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use seatwatch_core::Branch;
    use seatwatch_upstream::FetchStrategy;

    async fn store() -> SeatStore {
        let store = SeatStore::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn policy() -> TimeWindowPolicy {
        TimeWindowPolicy::new(
            OpeningHours {
                weekday_open: NaiveTime::from_hms_opt(8, 30, 0).expect("valid constant time"),
                weekday_close: NaiveTime::from_hms_opt(21, 0, 0).expect("valid constant time"),
                weekend_open: NaiveTime::from_hms_opt(9, 0, 0).expect("valid constant time"),
                weekend_close: NaiveTime::from_hms_opt(17, 0, 0).expect("valid constant time"),
            },
            WeekendRule::saturday_sunday(),
            Duration::minutes(5),
        )
    }

    struct CannedStrategy(Option<&'static str>);

    #[async_trait]
    impl FetchStrategy for CannedStrategy {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn attempt(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn service(store: SeatStore, payload: Option<&'static str>, enabled: bool) -> IngestService {
        let chain = FetchStrategyChain::new(vec![Box::new(CannedStrategy(payload))]);
        IngestService::new(chain, store, policy(), enabled)
    }

    #[test]
    fn offsets_parse_in_both_directions() {
        assert_eq!(parse_offset("+08:00"), FixedOffset::east_opt(8 * 3600));
        assert_eq!(parse_offset("-05:30"), FixedOffset::west_opt(5 * 3600 + 1800));
        assert_eq!(parse_offset("08:00"), FixedOffset::east_opt(8 * 3600));
        assert!(parse_offset("garbage").is_none());
        assert!(parse_offset("+25:00").is_none());
    }

    #[tokio::test]
    async fn disabled_flag_short_circuits_the_tick() {
        let store = store().await;
        let service = service(store.clone(), Some("[]"), false);
        // 2026-03-02 is a Monday, well inside opening hours
        let outcome = service.tick(at("2026-03-02 10:00:00")).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Disabled);
        assert!(store.history_all().await.unwrap().is_empty());

        service.set_enabled(true);
        let outcome = service.tick(at("2026-03-02 10:00:00")).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Ingested { .. }));
    }

    #[tokio::test]
    async fn ticks_outside_opening_hours_do_nothing() {
        let store = store().await;
        let service = service(store.clone(), Some("[]"), true);
        let outcome = service.tick(at("2026-03-02 07:00:00")).await.unwrap();
        assert_eq!(outcome, CycleOutcome::OutsideHours);
        // Saturday before weekend opening
        let outcome = service.tick(at("2026-03-07 08:45:00")).await.unwrap();
        assert_eq!(outcome, CycleOutcome::OutsideHours);
        assert!(store.history_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_falls_back_and_still_writes() {
        let store = store().await;
        let service = service(store.clone(), None, true);
        let report = service.ingest_now(at("2026-03-02 10:00:00")).await.unwrap();
        assert_eq!(report.source, PayloadSource::Fallback);
        assert_eq!(report.records.len(), 6);
        assert_eq!(store.latest_snapshots().await.unwrap().len(), 6);
        assert_eq!(store.history_all().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn unparseable_live_payload_falls_back() {
        let store = store().await;
        // Passes the bracket gate but is not valid JSON.
        let service = service(store.clone(), Some(r#"{"truncated": }"#), true);
        let report = service.ingest_now(at("2026-03-02 10:00:00")).await.unwrap();
        assert_eq!(report.source, PayloadSource::Fallback);
        assert_eq!(report.records.len(), 6);
    }

    #[tokio::test]
    async fn live_empty_array_is_accepted_as_is() {
        let store = store().await;
        let service = service(store.clone(), Some("[]"), true);
        let report = service.ingest_now(at("2026-03-02 10:00:00")).await.unwrap();
        assert_eq!(report.source, PayloadSource::Live);
        assert!(report.records.is_empty());
        assert!(store.latest_snapshots().await.unwrap().is_empty());
    }

    async fn seed_branch(store: &SeatStore, name: &str, open: (u32, u32), close: (u32, u32)) {
        store
            .save_branch(&Branch {
                branch_name: name.to_string(),
                open_time: NaiveTime::from_hms_opt(open.0, open.1, 0).unwrap(),
                close_time: NaiveTime::from_hms_opt(close.0, close.1, 0).unwrap(),
                is_open: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn branch_flags_transition_exactly_once_per_change() {
        let store = store().await;
        seed_branch(&store, "Main", (9, 0), (21, 0)).await;
        let gate = BranchScheduleGate::new(store.clone(), Duration::minutes(5));

        assert_eq!(gate.refresh_branch_flags(at("2026-03-02 10:00:00")).await.unwrap(), 1);
        assert_eq!(gate.refresh_branch_flags(at("2026-03-02 11:00:00")).await.unwrap(), 0);
        // Close is exclusive, so 21:00 flips it back.
        assert_eq!(gate.refresh_branch_flags(at("2026-03-02 21:00:00")).await.unwrap(), 1);
        assert_eq!(gate.refresh_branch_flags(at("2026-03-02 22:00:00")).await.unwrap(), 0);
        assert!(!store.branch("Main").await.unwrap().unwrap().is_open);
    }

    #[tokio::test]
    async fn closing_capture_fires_once_per_branch_per_day() {
        let store = store().await;
        seed_branch(&store, "Main", (9, 0), (21, 0)).await;
        seed_branch(&store, "Annex", (9, 0), (18, 0)).await;
        let gate = BranchScheduleGate::new(store.clone(), Duration::minutes(5));

        // Only Main is inside its closing window at 20:56.
        let due = gate.closing_captures_due(at("2026-03-02 20:56:00")).await.unwrap();
        assert_eq!(due, vec![("Main".to_string(), at("2026-03-02 21:00:00"))]);
        gate.mark_captured("Main", at("2026-03-02 20:56:00").date()).await;

        // Latched: later minutes of the same window yield nothing.
        assert!(gate.closing_captures_due(at("2026-03-02 20:58:00")).await.unwrap().is_empty());

        // A new day re-arms the latch.
        let due = gate.closing_captures_due(at("2026-03-03 20:57:00")).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, at("2026-03-03 21:00:00"));
    }

    #[tokio::test]
    async fn unconfirmed_capture_stays_due_for_retry() {
        let store = store().await;
        seed_branch(&store, "Main", (9, 0), (21, 0)).await;
        let gate = BranchScheduleGate::new(store.clone(), Duration::minutes(5));

        // The due check alone does not consume the branch.
        assert_eq!(gate.closing_captures_due(at("2026-03-02 20:56:00")).await.unwrap().len(), 1);
        assert_eq!(gate.closing_captures_due(at("2026-03-02 20:57:00")).await.unwrap().len(), 1);

        gate.mark_captured("Main", at("2026-03-02 20:57:00").date()).await;
        assert!(gate.closing_captures_due(at("2026-03-02 20:58:00")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_flag_suppresses_closing_capture() {
        let store = store().await;
        let service = service(store.clone(), None, false);

        let report = service.capture_closing(at("2026-03-02 21:00:00")).await.unwrap();
        assert!(report.is_none());
        assert!(store.history_all().await.unwrap().is_empty());

        service.set_enabled(true);
        let report = service.capture_closing(at("2026-03-02 21:00:00")).await.unwrap();
        assert_eq!(report.unwrap().records.len(), 6);
        assert_eq!(store.history_all().await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn capture_stamp_is_the_official_close_time() {
        let store = store().await;
        seed_branch(&store, "Annex", (9, 0), (18, 0)).await;
        let gate = BranchScheduleGate::new(store.clone(), Duration::minutes(5));
        let due = gate.closing_captures_due(at("2026-03-02 17:57:30")).await.unwrap();
        assert_eq!(due[0].1, at("2026-03-02 18:00:00"));

        let service = service(store.clone(), None, true);
        service.capture_closing(due[0].1).await.unwrap();
        let history = store.history_all().await.unwrap();
        assert!(history.iter().all(|r| r.observed_at == at("2026-03-02 18:00:00")));
    }

    #[tokio::test]
    async fn sweep_reports_and_deletes_only_expired_rows() {
        let store = store().await;
        let service = service(store.clone(), None, true);
        service.ingest_now(at("2026-01-01 10:00:00")).await.unwrap();
        service.ingest_now(at("2026-02-25 10:00:00")).await.unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), 30);
        let report = sweeper.sweep(at("2026-03-01 02:00:00")).await.unwrap();
        assert_eq!(report.candidates, 6);
        assert_eq!(report.deleted, 6);

        // Idempotent: a second sweep finds nothing.
        let report = sweeper.sweep(at("2026-03-01 02:00:00")).await.unwrap();
        assert_eq!(report.deleted, 0);
        assert_eq!(store.history_all().await.unwrap().len(), 6);
        // Snapshots are untouched by retention.
        assert_eq!(store.latest_snapshots().await.unwrap().len(), 6);
    }
}
