//! Scrape scheduler: one connect, query, map, update cycle per interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ldap_monitor::{FetchError, MonitorSource};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::mapping::{MappingWarning, MetricMapper};
use crate::registry::{SharedRegistry, StepResult};

/// Phase of the scrape state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapePhase {
    Idle,
    Fetching,
    Mapping,
    Updating,
}

/// Why a cycle was aborted. The registry is left untouched in every case.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("No known metrics in {entries} monitor entries ({warnings} unparseable values)")]
    NoSamples { entries: usize, warnings: usize },
}

impl ScrapeError {
    /// Name of the failing step: "connect", "bind", "query" or "map".
    pub fn step(&self) -> &'static str {
        match self {
            ScrapeError::Fetch(e) => e.step(),
            ScrapeError::NoSamples { .. } => "map",
        }
    }
}

/// Summary of a successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub entries: usize,
    pub samples: usize,
    pub warnings: Vec<MappingWarning>,
    pub duration: Duration,
}

/// Drives scrape cycles against one server and publishes results to the registry.
pub struct ScrapeScheduler<S: MonitorSource> {
    source: S,
    mapper: MetricMapper,
    registry: SharedRegistry,
    interval: Duration,
    phase: parking_lot::Mutex<ScrapePhase>,
}

impl<S: MonitorSource> ScrapeScheduler<S> {
    pub fn new(
        source: S,
        mapper: MetricMapper,
        registry: SharedRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            mapper,
            registry,
            interval,
            phase: parking_lot::Mutex::new(ScrapePhase::Idle),
        }
    }

    /// The registry this scheduler updates.
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Current phase of the cycle state machine.
    pub fn phase(&self) -> ScrapePhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: ScrapePhase) {
        *self.phase.lock() = phase;
    }

    /// Run a single cycle.
    ///
    /// On success the registry holds exactly the mapped snapshot; on failure it
    /// keeps whatever it held before. Statistics are recorded either way.
    pub async fn run_once(&self) -> Result<CycleReport, ScrapeError> {
        let started = Instant::now();
        let result = self.cycle(started).await;
        self.enter(ScrapePhase::Idle);

        let duration = started.elapsed();
        let authenticates = self.source.authenticates();

        self.registry.with_stats(|stats| match &result {
            Ok(report) => {
                stats.record_dial(StepResult::Ok);
                if authenticates {
                    stats.record_bind(StepResult::Ok);
                }
                stats.mapping_warnings += report.warnings.len() as u64;
                stats.record_scrape(StepResult::Ok, duration);
                stats.last_success_unix = Some(unix_now());
            }
            Err(e) => {
                if let ScrapeError::Fetch(fetch) = e {
                    if fetch.dialed() {
                        stats.record_dial(StepResult::Ok);
                        if authenticates {
                            stats.record_bind(if fetch.bound() {
                                StepResult::Ok
                            } else {
                                StepResult::Fail
                            });
                        }
                    } else {
                        stats.record_dial(StepResult::Fail);
                    }
                } else {
                    stats.record_dial(StepResult::Ok);
                    if authenticates {
                        stats.record_bind(StepResult::Ok);
                    }
                }
                stats.record_scrape(StepResult::Fail, duration);
            }
        });

        result
    }

    async fn cycle(&self, started: Instant) -> Result<CycleReport, ScrapeError> {
        self.enter(ScrapePhase::Fetching);
        let entries = self.source.fetch().await?;

        self.enter(ScrapePhase::Mapping);
        let outcome = self.mapper.map(&entries);

        if outcome.snapshot.is_empty() {
            return Err(ScrapeError::NoSamples {
                entries: entries.len(),
                warnings: outcome.warnings.len(),
            });
        }

        self.enter(ScrapePhase::Updating);
        let samples = outcome.snapshot.len();
        self.registry.update(outcome.snapshot);

        Ok(CycleReport {
            entries: entries.len(),
            samples,
            warnings: outcome.warnings,
            duration: started.elapsed(),
        })
    }

    /// Run cycles every interval until the shutdown signal is received.
    ///
    /// Cycles never overlap: ticks missed while a cycle is running are skipped.
    /// A shutdown during a cycle drops it, closing its connection.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let target = self.source.target();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            server = %target,
            interval_secs = self.interval.as_secs_f64(),
            "Starting scrape scheduler"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }

            tokio::select! {
                result = self.run_once() => self.log_cycle(&target, result),
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(server = %target, "Shutdown during scrape, discarding cycle");
                    break;
                }
            }
        }

        info!(server = %target, "Scrape scheduler stopped");
    }

    fn log_cycle(&self, target: &str, result: Result<CycleReport, ScrapeError>) {
        match result {
            Ok(report) => {
                if !report.warnings.is_empty() {
                    warn!(
                        server = %target,
                        warnings = report.warnings.len(),
                        first = %report.warnings[0],
                        "Some monitor values could not be parsed"
                    );
                }
                debug!(
                    server = %target,
                    entries = report.entries,
                    samples = report.samples,
                    duration_ms = report.duration.as_millis() as u64,
                    "Scrape complete"
                );
            }
            Err(e) => {
                warn!(
                    server = %target,
                    step = e.step(),
                    error = %e,
                    "Scrape failed, keeping previous metrics"
                );
            }
        }
    }
}

/// Resolve once the shutdown flag is set or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MetricsRegistry;
    use async_trait::async_trait;
    use ldap_monitor::{ConnectError, MonitoringEntry, QueryError};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Scripted = Result<Vec<MonitoringEntry>, FetchError>;
    type Step = fn() -> Scripted;

    /// Replays scripted results, then repeats the last kind forever.
    struct ScriptedSource {
        script: parking_lot::Mutex<VecDeque<Step>>,
        fallback: Step,
        calls: Arc<AtomicUsize>,
        authenticates: bool,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>, fallback: Step) -> Self {
            Self {
                script: parking_lot::Mutex::new(script.into()),
                fallback,
                calls: Arc::new(AtomicUsize::new(0)),
                authenticates: false,
            }
        }
    }

    #[async_trait]
    impl MonitorSource for ScriptedSource {
        fn target(&self) -> String {
            "ldap://test:389".to_string()
        }

        fn authenticates(&self) -> bool {
            self.authenticates
        }

        async fn fetch(&self) -> Result<Vec<MonitoringEntry>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front().unwrap_or(self.fallback);
            next()
        }
    }

    fn good() -> Scripted {
        Ok(vec![
            MonitoringEntry::new("cn=Total,cn=Connections,cn=Monitor")
                .with_attribute("monitorCounter", ["42"]),
            MonitoringEntry::new("cn=Current,cn=Connections,cn=Monitor")
                .with_attribute("monitorCounter", ["3"]),
        ])
    }

    fn changed() -> Scripted {
        Ok(vec![
            MonitoringEntry::new("cn=Total,cn=Connections,cn=Monitor")
                .with_attribute("monitorCounter", ["50"]),
        ])
    }

    fn timed_out() -> Scripted {
        Err(FetchError::Connect(ConnectError::Timeout {
            target: "ldap://test:389".to_string(),
            after: Duration::from_secs(10),
        }))
    }

    fn query_timed_out() -> Scripted {
        Err(FetchError::Query(QueryError::Timeout {
            base: "cn=Monitor".to_string(),
            after: Duration::from_secs(10),
        }))
    }

    fn nothing_known() -> Scripted {
        Ok(vec![
            MonitoringEntry::new("cn=Monitor").with_attribute("monitoredInfo", ["OpenLDAP"]),
        ])
    }

    fn scheduler(source: ScriptedSource) -> ScrapeScheduler<ScriptedSource> {
        ScrapeScheduler::new(
            source,
            MetricMapper::new("openldap", &BTreeMap::new()),
            Arc::new(MetricsRegistry::new("openldap")),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_successful_cycle_publishes_mapped_snapshot() {
        let scheduler = scheduler(ScriptedSource::new(vec![], good));

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(report.samples, 2);
        assert_eq!(scheduler.phase(), ScrapePhase::Idle);

        let expected = MetricMapper::new("openldap", &BTreeMap::new())
            .map(&good().unwrap())
            .snapshot;
        assert_eq!(*scheduler.registry().snapshot(), expected);

        let stats = scheduler.registry().stats();
        assert_eq!(stats.scrape_ok, 1);
        assert_eq!(stats.dial_ok, 1);
        assert!(stats.last_success_unix.is_some());
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_snapshot() {
        let scheduler = scheduler(ScriptedSource::new(vec![good as Step], timed_out));

        scheduler.run_once().await.unwrap();
        let before = scheduler.registry().snapshot();

        let err = scheduler.run_once().await.unwrap_err();
        assert_eq!(err.step(), "connect");
        assert_eq!(scheduler.phase(), ScrapePhase::Idle);

        let after = scheduler.registry().snapshot();
        assert_eq!(*before, *after);

        let stats = scheduler.registry().stats();
        assert_eq!(stats.scrape_ok, 1);
        assert_eq!(stats.scrape_fail, 1);
        assert_eq!(stats.dial_fail, 1);
    }

    #[tokio::test]
    async fn test_failed_first_cycle_leaves_registry_empty() {
        let scheduler = scheduler(ScriptedSource::new(vec![], query_timed_out));

        let err = scheduler.run_once().await.unwrap_err();
        assert_eq!(err.step(), "query");
        assert!(scheduler.registry().snapshot().is_empty());
        assert!(!scheduler.registry().is_ready());
        assert_eq!(scheduler.registry().stats().dial_ok, 1);
    }

    #[tokio::test]
    async fn test_cycle_without_known_metrics_is_a_failure() {
        let scheduler = scheduler(ScriptedSource::new(vec![good as Step], nothing_known));

        scheduler.run_once().await.unwrap();
        let err = scheduler.run_once().await.unwrap_err();

        assert_eq!(err.step(), "map");
        assert_eq!(scheduler.registry().snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_bind_stats_only_when_authenticating() {
        let mut source = ScriptedSource::new(vec![good as Step], timed_out);
        source.authenticates = true;
        let scheduler = scheduler(source);

        scheduler.run_once().await.unwrap();
        let _ = scheduler.run_once().await;

        let stats = scheduler.registry().stats();
        assert_eq!(stats.bind_ok, 1);
        // A dial failure never reaches the bind step.
        assert_eq!(stats.bind_fail, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_continue_after_failures() {
        let source = ScriptedSource::new(vec![timed_out as Step, timed_out], changed);
        let calls = source.calls.clone();
        let scheduler = scheduler(source);
        let registry = scheduler.registry();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        // Ticks at 0s, 30s and 60s.
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            registry
                .snapshot()
                .find("openldap_connections_total", &[])
                .unwrap()
                .value,
            50.0
        );
        assert_eq!(registry.stats().scrape_fail, 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_scheduler() {
        let scheduler = scheduler(ScriptedSource::new(vec![], good));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }
}
