//! Cron scheduler for hands.
//!
//! Every tick the scheduler:
//! 1. Reloads the registry so CLI edits between ticks are picked up
//! 2. Evaluates each active, scheduled hand's cron in its own timezone
//! 3. Skips hands already fired this minute (dedup key) or still running
//! 4. Starts due hands in the background, bounded by their max duration
//!
//! A bad cron expression or timezone only skips that hand.

use chrono::{DateTime, Utc};
use familiar_common::{Config, EventBus};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cron::{dedup_key, parse_cron, parse_timezone};
use crate::hands::{execute_hand, HandRegistry, HandRunner, RunOptions};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    pub deduplicated: Vec<String>,
    pub invalid: Vec<String>,
}

/// Bounded set of recently fired dedup keys. Oldest keys are evicted first.
#[derive(Debug)]
pub struct DedupCache {
    order: VecDeque<String>,
    keys: HashSet<String>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            keys: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a key. Returns false if it was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

type RunningSet = Arc<Mutex<HashSet<String>>>;

fn lock_set(set: &RunningSet) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a hand from the running set when its task ends, panicking or not.
struct RunningGuard {
    set: RunningSet,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_set(&self.set).remove(&self.name);
    }
}

/// Scheduler for cron-driven hand runs.
pub struct HandsScheduler {
    registry: Arc<HandRegistry>,
    runner: Arc<dyn HandRunner>,
    bus: Arc<EventBus>,
    tick_interval: Duration,
    shutdown_grace: Duration,
    dedup: Mutex<DedupCache>,
    running: RunningSet,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl HandsScheduler {
    pub fn new(registry: Arc<HandRegistry>, runner: Arc<dyn HandRunner>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            runner,
            bus,
            tick_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            dedup: Mutex::new(DedupCache::new(500)),
            running: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Apply `[hands]` settings from the config.
    pub fn with_config(mut self, config: &Config) -> Self {
        self.tick_interval = Duration::from_secs(config.hands.tick_interval_secs.max(1));
        self.shutdown_grace = Duration::from_secs(config.hands.shutdown_grace_secs);
        self.dedup = Mutex::new(DedupCache::new(config.hands.dedup_capacity));
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Hands with a scheduler-started run in flight.
    pub fn running_hands(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_set(&self.running).iter().cloned().collect();
        names.sort();
        names
    }

    /// Evaluate every scheduled hand against `now` and start the due ones.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.registry.load() {
            tracing::warn!(error = %format!("{e:#}"), "Failed to reload hands, using previous state");
        }

        for hand in self.registry.get_scheduled() {
            let expr = match parse_cron(&hand.cron) {
                Ok(expr) => expr,
                Err(e) => {
                    tracing::warn!(hand = %hand.name, cron = %hand.cron, error = %e, "Invalid cron expression, skipping");
                    report.invalid.push(hand.name);
                    continue;
                }
            };
            let Some(tz) = parse_timezone(&hand.timezone) else {
                tracing::warn!(hand = %hand.name, timezone = %hand.timezone, "Unknown timezone, skipping");
                report.invalid.push(hand.name);
                continue;
            };

            let local = now.with_timezone(&tz);
            if !expr.matches(&local) {
                continue;
            }

            let key = dedup_key(&hand.name, &local);
            let fresh = self
                .dedup
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key);
            if !fresh {
                tracing::debug!(hand = %hand.name, "Already triggered this minute");
                report.deduplicated.push(hand.name);
                continue;
            }

            if !lock_set(&self.running).insert(hand.name.clone()) {
                tracing::info!(hand = %hand.name, "Previous run still in progress, skipping");
                report.already_running.push(hand.name);
                continue;
            }

            self.spawn_run(hand.name.clone(), Duration::from_secs(hand.max_duration_secs));
            report.started.push(hand.name);
        }

        report
    }

    fn spawn_run(&self, name: String, max_duration: Duration) {
        let guard = RunningGuard {
            set: Arc::clone(&self.running),
            name: name.clone(),
        };
        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);
        let bus = Arc::clone(&self.bus);

        tracing::info!(hand = %name, max_duration_secs = max_duration.as_secs(), "Starting scheduled hand");
        self.tracker.spawn(async move {
            let _guard = guard;
            let options = RunOptions::default().with_timeout(max_duration);
            if let Err(e) = execute_hand(&registry, runner.as_ref(), &bus, &name, options).await {
                tracing::warn!(hand = %name, error = %e, "Scheduled run did not start");
            }
        });
    }

    /// Tick on the configured interval until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        tracing::info!(interval_secs = self.tick_interval.as_secs(), "Hands scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Hands scheduler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick(Utc::now());
                    if !report.started.is_empty() {
                        tracing::debug!(started = ?report.started, "Tick complete");
                    }
                }
            }
        }
    }

    /// Stop ticking and wait up to the grace period for in-flight runs.
    ///
    /// Returns false if runs were still going when the grace period ran out.
    pub async fn shutdown(&self) -> bool {
        self.cancel.cancel();
        self.tracker.close();
        let drained = tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            tracing::warn!(running = ?self.running_hands(), "Shutdown grace period elapsed with runs in flight");
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::{HandManifest, HandStatus, RunOutcome, MANIFEST_FILE};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
        release: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl HandRunner for CountingRunner {
        async fn run(&self, _hand: &HandManifest, _options: RunOptions) -> RunOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(release) = &self.release {
                release.notified().await;
            }
            RunOutcome::success("ok")
        }
    }

    fn setup(manifests: &[Value]) -> (TempDir, Arc<HandRegistry>) {
        let tmp = TempDir::new().unwrap();
        for m in manifests {
            let dir = tmp.path().join("hands").join(m["name"].as_str().unwrap());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(MANIFEST_FILE), m.to_string()).unwrap();
        }
        let registry = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        registry.load().unwrap();
        registry.activate_all().unwrap();
        (tmp, Arc::new(registry))
    }

    fn scheduled(name: &str, cron: &str) -> Value {
        json!({
            "name": name,
            "schedule": {"cron": cron, "timezone": "UTC"},
            "phases": [{"name": "p", "prompt": "x"}]
        })
    }

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn test_dedup_cache_evicts_oldest() {
        let mut cache = DedupCache::new(2);
        assert!(cache.insert("a".into()));
        assert!(!cache.insert("a".into()));
        assert!(cache.insert("b".into()));
        assert!(cache.insert("c".into()));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(cache.insert("a".into()));
    }

    #[tokio::test]
    async fn test_due_hand_runs_once_per_minute() {
        let (_tmp, registry) = setup(&[scheduled("alpha", "30 9 * * *"), scheduled("beta", "0 12 * * *")]);
        let runner = Arc::new(CountingRunner::default());
        let scheduler = HandsScheduler::new(Arc::clone(&registry), runner.clone(), Arc::new(EventBus::new()));

        let report = scheduler.tick(utc(9, 30, 0));
        assert_eq!(report.started, vec!["alpha"]);

        let report = scheduler.tick(utc(9, 30, 45));
        assert!(report.started.is_empty());
        assert_eq!(report.deduplicated, vec!["alpha"]);

        assert!(scheduler.tick(utc(9, 31, 0)).started.is_empty());

        assert!(scheduler.shutdown().await);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state("alpha").unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn test_running_hand_is_not_started_twice() {
        let (tmp, registry) = setup(&[scheduled("alpha", "* * * * *")]);
        let release = Arc::new(Notify::new());
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
            release: Some(Arc::clone(&release)),
        });
        let scheduler = HandsScheduler::new(Arc::clone(&registry), runner.clone(), Arc::new(EventBus::new()));

        assert_eq!(scheduler.tick(utc(10, 0, 0)).started, vec!["alpha"]);
        tokio::task::yield_now().await;
        assert_eq!(scheduler.running_hands(), vec!["alpha"]);

        // The registry already reports it as running, so it is not scheduled
        let report = scheduler.tick(utc(10, 1, 0));
        assert_eq!(report, TickReport::default());

        // Re-activated from another process mid-run: the running set still guards it
        let cli = HandRegistry::new(registry.hands_dir(), tmp.path().join("state.json"));
        cli.load().unwrap();
        cli.deactivate("alpha").unwrap();
        cli.activate("alpha").unwrap();
        let report = scheduler.tick(utc(10, 2, 0));
        assert_eq!(report.already_running, vec!["alpha"]);

        release.notify_one();
        assert!(scheduler.shutdown().await);
        assert!(scheduler.running_hands().is_empty());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_cron_does_not_block_other_hands() {
        let mut bad_tz = scheduled("gamma", "* * * * *");
        bad_tz["schedule"]["timezone"] = json!("Nowhere/Special");
        let (_tmp, registry) = setup(&[
            scheduled("alpha", "99 * * * *"),
            scheduled("beta", "* * * * *"),
            bad_tz,
        ]);
        let runner = Arc::new(CountingRunner::default());
        let scheduler = HandsScheduler::new(registry, runner.clone(), Arc::new(EventBus::new()));

        let report = scheduler.tick(utc(8, 0, 0));
        assert_eq!(report.started, vec!["beta"]);
        assert_eq!(report.invalid, vec!["alpha", "gamma"]);
        assert!(scheduler.shutdown().await);
    }

    #[tokio::test]
    async fn test_inactive_hands_are_ignored() {
        let (_tmp, registry) = setup(&[scheduled("alpha", "* * * * *")]);
        registry.pause("alpha").unwrap();
        let runner = Arc::new(CountingRunner::default());
        let scheduler = HandsScheduler::new(Arc::clone(&registry), runner, Arc::new(EventBus::new()));

        assert_eq!(scheduler.tick(utc(8, 0, 0)), TickReport::default());
        assert_eq!(registry.status("alpha"), Some(HandStatus::Paused));
    }

    #[tokio::test]
    async fn test_timezone_is_respected() {
        let mut hand = scheduled("alpha", "0 9 * * *");
        hand["schedule"]["timezone"] = json!("America/New_York");
        let (_tmp, registry) = setup(&[hand]);
        let scheduler = HandsScheduler::new(registry, Arc::new(CountingRunner::default()), Arc::new(EventBus::new()));

        assert!(scheduler.tick(utc(9, 0, 0)).started.is_empty());
        // 09:00 EST == 14:00 UTC
        assert_eq!(scheduler.tick(utc(14, 0, 0)).started, vec!["alpha"]);
        assert!(scheduler.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace() {
        let (_tmp, registry) = setup(&[scheduled("alpha", "* * * * *")]);
        let runner = Arc::new(CountingRunner {
            calls: AtomicUsize::new(0),
            release: Some(Arc::new(Notify::new())),
        });
        let scheduler = HandsScheduler::new(registry, runner, Arc::new(EventBus::new()));

        scheduler.tick(utc(8, 0, 0));
        assert!(!scheduler.shutdown().await);
    }
}
