//! Trigger manager.
//!
//! Turns trigger declarations into live resources (a file watcher, a route on
//! the shared webhook server, a poll task, or a bus listener) and routes every
//! fire through [`TriggerManager::fire_hand`], which enforces one cooldown
//! clock per hand across all trigger types.
//!
//! Each hand's trigger set is the manifest's `triggers` plus any registered at
//! runtime. Activating a hand makes that set live; deactivating tears down
//! exactly the resources activation created.

use familiar_common::bus::{EventBus, ListenerId, TRIGGER_FIRED, UNIT_COMPLETE};
use familiar_common::{Config, Error, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

use super::definition::{TriggerDef, TriggerKind};
use super::file_watch::FileWatcher;
use super::threshold::{resolve_metric, ThresholdDetector};
use super::webhook::{FireFn, RouteTable, WebhookRoute, WebhookServer, WebhookState};
use crate::hands::{execute_hand, HandRegistry, HandRunner, HandStatus, RunOptions};

/// Tunables for the trigger manager.
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub cooldown: Duration,
    pub debounce: Duration,
    pub threshold_interval: Duration,
    pub threshold_reset: Duration,
    pub webhook_bind: String,
    pub webhook_port: u16,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            debounce: Duration::from_millis(5000),
            threshold_interval: Duration::from_secs(300),
            threshold_reset: Duration::from_secs(300),
            webhook_bind: "127.0.0.1".to_string(),
            webhook_port: 18795,
        }
    }
}

impl TriggerSettings {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.triggers;
        Self {
            cooldown: Duration::from_secs(t.cooldown_secs),
            debounce: Duration::from_millis(t.debounce_ms),
            threshold_interval: Duration::from_secs(t.threshold_interval_secs.max(1)),
            threshold_reset: Duration::from_secs(t.threshold_reset_secs),
            webhook_bind: t.webhook_bind.clone(),
            webhook_port: t.webhook_port,
        }
    }
}

/// What happened when a trigger tried to start a hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FireResult {
    Fired,
    CoolingDown,
    AlreadyRunning,
    Paused,
    UnknownHand,
}

/// Where a trigger definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Manifest,
    Runtime,
}

/// Aborts a poll task when dropped.
struct PollTask(JoinHandle<()>);

impl Drop for PollTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The resource a live trigger holds.
enum TriggerHandle {
    FileWatch(FileWatcher),
    Webhook(String),
    Threshold(PollTask),
    HandComplete(ListenerId),
    Schedule,
}

struct ActiveTrigger {
    def: TriggerDef,
    source: Source,
    handle: TriggerHandle,
}

/// A live trigger, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerInfo {
    pub hand: String,
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    pub runtime: bool,
}

/// Removes a hand from the running set when its run task ends.
struct RunningGuard {
    running: Arc<Mutex<HashSet<String>>>,
    hand: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.hand);
    }
}

pub struct TriggerManager {
    registry: Arc<HandRegistry>,
    runner: Arc<dyn HandRunner>,
    bus: Arc<EventBus>,
    settings: TriggerSettings,
    this: Weak<TriggerManager>,
    /// Hand -> live triggers. A key is present while the hand is activated.
    active: Mutex<HashMap<String, Vec<ActiveTrigger>>>,
    /// Hand -> triggers registered at runtime.
    runtime: Mutex<HashMap<String, Vec<TriggerDef>>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    running: Arc<Mutex<HashSet<String>>>,
    routes: RouteTable,
    webhook: tokio::sync::Mutex<Option<WebhookServer>>,
    tracker: TaskTracker,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TriggerManager {
    pub fn new(
        registry: Arc<HandRegistry>,
        runner: Arc<dyn HandRunner>,
        bus: Arc<EventBus>,
        settings: TriggerSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            runner,
            bus,
            settings,
            this: this.clone(),
            active: Mutex::new(HashMap::new()),
            runtime: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
            routes: RouteTable::default(),
            webhook: tokio::sync::Mutex::new(None),
            tracker: TaskTracker::new(),
        })
    }

    // ------------------------------------------------------------------
    // Firing
    // ------------------------------------------------------------------

    /// Start a hand on behalf of a trigger.
    ///
    /// Suppressed while the hand is within its cooldown, already running, or
    /// paused. On success emits `trigger.fired` with `{hand, type, ..details}`
    /// and starts the run in the background; the run itself emits
    /// `unit.complete` / `unit.error` when it settles.
    pub fn fire_hand(&self, hand: &str, kind: TriggerKind, details: Value) -> FireResult {
        let Some(status) = self.registry.status(hand) else {
            tracing::warn!(hand = %hand, trigger = %kind, "Trigger fired for unknown hand");
            return FireResult::UnknownHand;
        };
        if status == HandStatus::Paused {
            tracing::debug!(hand = %hand, trigger = %kind, "Hand paused, ignoring trigger");
            return FireResult::Paused;
        }

        let now = Instant::now();
        {
            let cooldowns = lock(&self.cooldowns);
            if let Some(last) = cooldowns.get(hand) {
                if now.duration_since(*last) < self.settings.cooldown {
                    tracing::debug!(hand = %hand, trigger = %kind, "Hand in cooldown, ignoring trigger");
                    return FireResult::CoolingDown;
                }
            }
        }

        {
            let mut running = lock(&self.running);
            if status == HandStatus::Running || !running.insert(hand.to_string()) {
                tracing::info!(hand = %hand, trigger = %kind, "Hand already running, ignoring trigger");
                return FireResult::AlreadyRunning;
            }
        }
        lock(&self.cooldowns).insert(hand.to_string(), now);

        let mut payload = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("details".to_string(), other)]),
        };
        payload.insert("hand".into(), json!(hand));
        payload.insert("type".into(), json!(kind.as_str()));
        let input = payload.get("payload").cloned();

        tracing::info!(hand = %hand, trigger = %kind, "Trigger fired");
        self.bus.emit(TRIGGER_FIRED, &Value::Object(payload));

        let guard = RunningGuard {
            running: Arc::clone(&self.running),
            hand: hand.to_string(),
        };
        let registry = Arc::clone(&self.registry);
        let runner = Arc::clone(&self.runner);
        let bus = Arc::clone(&self.bus);
        let name = hand.to_string();
        let mut options = RunOptions::default();
        if let Some(max) = self
            .registry
            .manifest(hand)
            .and_then(|m| m.schedule)
            .and_then(|s| s.max_duration)
        {
            options.timeout = Some(Duration::from_secs(max));
        }
        options.input = input;

        self.tracker.spawn(async move {
            let _guard = guard;
            if let Err(e) = execute_hand(&registry, runner.as_ref(), &bus, &name, options).await {
                tracing::warn!(hand = %name, error = %e, "Triggered run did not start");
            }
        });

        FireResult::Fired
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Activate triggers for every active hand. Returns how many went live.
    pub async fn start(&self) -> usize {
        let mut total = 0;
        for manifest in self.registry.active() {
            match self.activate_hand(&manifest.name).await {
                Ok(n) => total += n,
                Err(e) => tracing::warn!(hand = %manifest.name, error = %e, "Failed to activate triggers"),
            }
        }
        tracing::info!(triggers = total, "Trigger manager started");
        total
    }

    /// Match live triggers to the registry: activate newly active hands and
    /// deactivate hands that are no longer active.
    pub async fn sync(&self) {
        let wanted: HashSet<String> = self.registry.active().into_iter().map(|m| m.name).collect();
        let live: HashSet<String> = lock(&self.active).keys().cloned().collect();

        for hand in live.difference(&wanted) {
            self.deactivate_hand(hand);
        }
        for hand in wanted.difference(&live) {
            if let Err(e) = self.activate_hand(hand).await {
                tracing::warn!(hand = %hand, error = %e, "Failed to activate triggers");
            }
        }
    }

    /// Deactivate every trigger and stop the webhook server.
    pub async fn stop(&self) {
        let hands: Vec<String> = lock(&self.active).keys().cloned().collect();
        for hand in hands {
            self.deactivate_hand(&hand);
        }
        if let Some(server) = self.webhook.lock().await.take() {
            server.shutdown().await;
        }
        tracing::info!("Trigger manager stopped");
    }

    /// Wait for triggered runs to settle, up to `grace`.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(grace, self.tracker.wait()).await.is_ok()
    }

    /// Make a hand's triggers live. Idempotent: an already active hand is left
    /// as is. Returns how many triggers went live; ones that fail to start are
    /// logged and left inactive.
    pub async fn activate_hand(&self, hand: &str) -> Result<usize> {
        let manifest = self
            .registry
            .manifest(hand)
            .ok_or_else(|| Error::hand_not_found(hand))?;

        {
            let mut active = lock(&self.active);
            if active.contains_key(hand) {
                return Ok(0);
            }
            active.insert(hand.to_string(), Vec::new());
        }

        let runtime = lock(&self.runtime).get(hand).cloned().unwrap_or_default();
        let defs = manifest
            .triggers
            .into_iter()
            .map(|d| (d, Source::Manifest))
            .chain(runtime.into_iter().map(|d| (d, Source::Runtime)));

        let mut count = 0;
        for (def, source) in defs {
            if self.activate_trigger(hand, def, source).await {
                count += 1;
            }
        }
        tracing::debug!(hand = %hand, triggers = count, "Hand triggers activated");
        Ok(count)
    }

    /// Tear down every live trigger of a hand. Idempotent.
    pub fn deactivate_hand(&self, hand: &str) -> usize {
        let Some(triggers) = lock(&self.active).remove(hand) else {
            return 0;
        };
        let count = triggers.len();
        for trigger in triggers {
            self.release(hand, trigger);
        }
        tracing::debug!(hand = %hand, triggers = count, "Hand triggers deactivated");
        count
    }

    /// Add a trigger at runtime. Validated before anything changes; goes live
    /// immediately when the hand's triggers are active.
    pub async fn register_trigger(&self, hand: &str, def: &Value) -> Result<TriggerKind> {
        let def = TriggerDef::parse(def).map_err(|e| Error::Validation(vec![e]))?;
        if self.registry.manifest(hand).is_none() {
            return Err(Error::hand_not_found(hand));
        }
        let kind = def.kind();

        lock(&self.runtime)
            .entry(hand.to_string())
            .or_default()
            .push(def.clone());

        if lock(&self.active).contains_key(hand) {
            self.activate_trigger(hand, def, Source::Runtime).await;
        }
        tracing::info!(hand = %hand, trigger = %kind, "Trigger registered");
        Ok(kind)
    }

    /// Remove a hand's triggers of `kind` (all of them when `None`): runtime
    /// definitions are forgotten and live resources torn down. Manifest
    /// triggers come back the next time the hand is activated.
    pub fn remove_trigger(&self, hand: &str, kind: Option<TriggerKind>) -> usize {
        let matches = |def: &TriggerDef| kind.map_or(true, |k| def.kind() == k);

        if let Some(defs) = lock(&self.runtime).get_mut(hand) {
            defs.retain(|d| !matches(d));
        }

        let removed: Vec<ActiveTrigger> = {
            let mut active = lock(&self.active);
            match active.get_mut(hand) {
                Some(live) => {
                    let (gone, kept): (Vec<_>, Vec<_>) =
                        std::mem::take(live).into_iter().partition(|t| matches(&t.def));
                    *live = kept;
                    gone
                }
                None => Vec::new(),
            }
        };

        let count = removed.len();
        for trigger in removed {
            self.release(hand, trigger);
        }
        count
    }

    /// Live triggers, sorted by hand.
    pub fn active_triggers(&self) -> Vec<TriggerInfo> {
        let active = lock(&self.active);
        let sorted: BTreeMap<_, _> = active.iter().collect();
        sorted
            .into_iter()
            .flat_map(|(hand, triggers)| {
                triggers.iter().map(move |t| TriggerInfo {
                    hand: hand.clone(),
                    kind: t.def.kind(),
                    runtime: t.source == Source::Runtime,
                })
            })
            .collect()
    }

    /// Address of the webhook server, once started.
    pub async fn webhook_addr(&self) -> Option<SocketAddr> {
        self.webhook.lock().await.as_ref().map(WebhookServer::addr)
    }

    // ------------------------------------------------------------------
    // Per-type activation
    // ------------------------------------------------------------------

    async fn activate_trigger(&self, hand: &str, def: TriggerDef, source: Source) -> bool {
        let kind = def.kind();
        let handle = match &def {
            TriggerDef::FileChange { paths, recursive, debounce } => {
                let window = debounce.map_or(self.settings.debounce, Duration::from_millis);
                let this = self.this.clone();
                let name = hand.to_string();
                let started = FileWatcher::start(paths, *recursive, window, move |changed| {
                    if let Some(manager) = this.upgrade() {
                        let changed: Vec<String> =
                            changed.iter().map(|p| p.display().to_string()).collect();
                        manager.fire_hand(&name, TriggerKind::FileChange, json!({"paths": changed}));
                    }
                });
                match started {
                    Ok(watcher) => TriggerHandle::FileWatch(watcher),
                    Err(e) => {
                        tracing::warn!(hand = %hand, paths = ?paths, error = %e, "Cannot watch paths, trigger left inactive");
                        return false;
                    }
                }
            }

            TriggerDef::Webhook { route, secret } => {
                if let Err(e) = self.ensure_webhook_server().await {
                    tracing::warn!(hand = %hand, route = %route, error = %e, "Webhook server unavailable, trigger left inactive");
                    return false;
                }
                let target = WebhookRoute {
                    hand: hand.to_string(),
                    secret: secret.clone(),
                };
                if !self.routes.insert(route, target) {
                    tracing::warn!(hand = %hand, route = %route, "Webhook route already taken, trigger left inactive");
                    return false;
                }
                TriggerHandle::Webhook(route.clone())
            }

            TriggerDef::Threshold { metric, above, below, interval, auto_reset } => {
                let period = interval.map_or(self.settings.threshold_interval, |s| Duration::from_secs(s.max(1)));
                let reset = auto_reset.then_some(self.settings.threshold_reset);
                let mut detector = ThresholdDetector::new(*above, *below, reset);
                let this = self.this.clone();
                let name = hand.to_string();
                let metric = metric.clone();

                let task = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        let Some(manager) = this.upgrade() else { break };
                        let value = resolve_metric(&manager.registry, &name, &metric);
                        if detector.observe(value, Instant::now()) {
                            manager.fire_hand(
                                &name,
                                TriggerKind::Threshold,
                                json!({"metric": metric, "value": value}),
                            );
                        }
                    }
                });
                TriggerHandle::Threshold(PollTask(task))
            }

            TriggerDef::HandComplete { hand: watched, only_on_success } => {
                let this = self.this.clone();
                let name = hand.to_string();
                let watched = watched.clone();
                let only_on_success = *only_on_success;

                let id = self.bus.on(UNIT_COMPLETE, move |payload| {
                    if payload.get("hand").and_then(Value::as_str) != Some(watched.as_str()) {
                        return Ok(());
                    }
                    let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
                    if only_on_success && !ok {
                        tracing::debug!(hand = %name, watched = %watched, "Watched hand failed, not chaining");
                        return Ok(());
                    }
                    if let Some(manager) = this.upgrade() {
                        manager.fire_hand(&name, TriggerKind::HandComplete, json!({"source": watched, "ok": ok}));
                    }
                    Ok(())
                });
                TriggerHandle::HandComplete(id)
            }

            TriggerDef::Schedule { .. } => TriggerHandle::Schedule,
        };

        let mut active = lock(&self.active);
        match active.get_mut(hand) {
            Some(live) => {
                live.push(ActiveTrigger { def, source, handle });
                tracing::debug!(hand = %hand, trigger = %kind, "Trigger activated");
                true
            }
            None => {
                // Hand was deactivated while this trigger was starting
                drop(active);
                self.release(hand, ActiveTrigger { def, source, handle });
                false
            }
        }
    }

    fn release(&self, hand: &str, trigger: ActiveTrigger) {
        match trigger.handle {
            TriggerHandle::FileWatch(watcher) => drop(watcher),
            TriggerHandle::Webhook(route) => {
                self.routes.remove(&route);
            }
            TriggerHandle::Threshold(task) => drop(task),
            TriggerHandle::HandComplete(id) => {
                self.bus.off(UNIT_COMPLETE, id);
            }
            TriggerHandle::Schedule => {}
        }
        tracing::debug!(hand = %hand, trigger = %trigger.def.kind(), "Trigger deactivated");
    }

    async fn ensure_webhook_server(&self) -> std::io::Result<()> {
        let mut server = self.webhook.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let this = self.this.clone();
        let fire: FireFn = Arc::new(move |hand, details| {
            if let Some(manager) = this.upgrade() {
                manager.fire_hand(hand, TriggerKind::Webhook, details);
            }
        });
        let state = WebhookState {
            routes: self.routes.clone(),
            fire,
        };
        *server = Some(
            WebhookServer::start(&self.settings.webhook_bind, self.settings.webhook_port, state).await?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::{HandManifest, RunOutcome, MANIFEST_FILE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HandRunner for CountingRunner {
        async fn run(&self, _hand: &HandManifest, _options: RunOptions) -> RunOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RunOutcome::success("ok")
        }
    }

    fn setup(manifests: &[Value], settings: TriggerSettings) -> (TempDir, Arc<TriggerManager>, Arc<CountingRunner>, Arc<EventBus>) {
        let tmp = TempDir::new().unwrap();
        for m in manifests {
            let dir = tmp.path().join("hands").join(m["name"].as_str().unwrap());
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(MANIFEST_FILE), m.to_string()).unwrap();
        }
        let registry = Arc::new(HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json")));
        registry.load().unwrap();
        registry.activate_all().unwrap();

        let runner = Arc::new(CountingRunner::default());
        let bus = Arc::new(EventBus::new());
        let manager = TriggerManager::new(registry, runner.clone(), Arc::clone(&bus), settings);
        (tmp, manager, runner, bus)
    }

    fn hand(name: &str, triggers: Value) -> Value {
        json!({"name": name, "phases": [{"name": "p", "prompt": "x"}], "triggers": triggers})
    }

    fn count_fired(bus: &EventBus) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&fired);
        bus.on(TRIGGER_FIRED, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        fired
    }

    #[tokio::test]
    async fn test_activate_is_idempotent_and_deactivate_tears_down() {
        let (_tmp, manager, _runner, bus) = setup(
            &[hand("alpha", json!([
                {"type": "hand_complete", "hand": "beta"},
                {"type": "schedule", "cron": "0 * * * *"}
            ]))],
            TriggerSettings::default(),
        );

        assert_eq!(manager.start().await, 2);
        assert_eq!(manager.activate_hand("alpha").await.unwrap(), 0);
        assert_eq!(bus.listener_count(UNIT_COMPLETE), 1);
        assert_eq!(manager.active_triggers().len(), 2);

        assert_eq!(manager.deactivate_hand("alpha"), 2);
        assert_eq!(manager.deactivate_hand("alpha"), 0);
        assert_eq!(bus.listener_count(UNIT_COMPLETE), 0);
        assert!(manager.active_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_is_shared_across_trigger_types() {
        let (_tmp, manager, runner, bus) = setup(&[hand("alpha", json!([]))], TriggerSettings::default());
        let fired = count_fired(&bus);

        assert_eq!(manager.fire_hand("alpha", TriggerKind::FileChange, Value::Null), FireResult::Fired);
        assert!(manager.drain(Duration::from_secs(5)).await);
        assert_eq!(
            manager.fire_hand("alpha", TriggerKind::Webhook, Value::Null),
            FireResult::CoolingDown
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let settings = TriggerSettings {
            cooldown: Duration::from_secs(60),
            ..Default::default()
        };
        let (_tmp, manager, _runner, _bus) = setup(&[hand("alpha", json!([]))], settings);

        assert_eq!(manager.fire_hand("alpha", TriggerKind::Webhook, Value::Null), FireResult::Fired);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.fire_hand("alpha", TriggerKind::Webhook, Value::Null), FireResult::CoolingDown);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.fire_hand("alpha", TriggerKind::Webhook, Value::Null), FireResult::Fired);
    }

    #[tokio::test]
    async fn test_paused_and_unknown_hands_do_not_fire() {
        let (_tmp, manager, runner, _bus) = setup(&[hand("alpha", json!([]))], TriggerSettings::default());
        manager.registry.pause("alpha").unwrap();

        assert_eq!(manager.fire_hand("alpha", TriggerKind::Webhook, Value::Null), FireResult::Paused);
        assert_eq!(manager.fire_hand("ghost", TriggerKind::Webhook, Value::Null), FireResult::UnknownHand);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_register_validates_before_mutating() {
        let (_tmp, manager, _runner, bus) = setup(&[hand("alpha", json!([]))], TriggerSettings::default());
        manager.start().await;

        let err = manager
            .register_trigger("alpha", &json!({"type": "threshold", "metric": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = manager
            .register_trigger("ghost", &json!({"type": "hand_complete", "hand": "alpha"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(manager.active_triggers().is_empty());

        let kind = manager
            .register_trigger("alpha", &json!({"type": "hand_complete", "hand": "beta"}))
            .await
            .unwrap();
        assert_eq!(kind, TriggerKind::HandComplete);
        assert_eq!(bus.listener_count(UNIT_COMPLETE), 1);
        assert!(manager.active_triggers()[0].runtime);
    }

    #[tokio::test]
    async fn test_remove_trigger_by_type_and_all() {
        let (_tmp, manager, _runner, bus) = setup(
            &[hand("alpha", json!([{"type": "hand_complete", "hand": "beta"}]))],
            TriggerSettings::default(),
        );
        manager.start().await;
        manager
            .register_trigger("alpha", &json!({"type": "schedule", "cron": "* * * * *"}))
            .await
            .unwrap();
        manager
            .register_trigger("alpha", &json!({"type": "hand_complete", "hand": "gamma"}))
            .await
            .unwrap();
        assert_eq!(bus.listener_count(UNIT_COMPLETE), 2);

        assert_eq!(manager.remove_trigger("alpha", Some(TriggerKind::Schedule)), 1);
        assert_eq!(manager.remove_trigger("alpha", Some(TriggerKind::Schedule)), 0);
        assert_eq!(manager.remove_trigger("alpha", None), 2);
        assert_eq!(bus.listener_count(UNIT_COMPLETE), 0);

        // Runtime definitions are gone; manifest ones return on reactivation
        manager.deactivate_hand("alpha");
        assert_eq!(manager.activate_hand("alpha").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_webhook_server_starts_lazily_and_routes_are_released() {
        let settings = TriggerSettings {
            webhook_port: 0,
            ..Default::default()
        };
        let (_tmp, manager, _runner, _bus) = setup(
            &[
                hand("alpha", json!([{"type": "webhook", "route": "/hooks/alpha"}])),
                hand("beta", json!([{"type": "webhook", "route": "/hooks/alpha"}])),
                hand("gamma", json!([])),
            ],
            settings,
        );
        assert!(manager.webhook_addr().await.is_none());

        manager.activate_hand("gamma").await.unwrap();
        assert!(manager.webhook_addr().await.is_none());

        assert_eq!(manager.activate_hand("alpha").await.unwrap(), 1);
        assert!(manager.webhook_addr().await.is_some());
        // Route already taken by alpha
        assert_eq!(manager.activate_hand("beta").await.unwrap(), 0);

        manager.deactivate_hand("alpha");
        assert!(manager.routes.get("/hooks/alpha").is_none());
        manager.stop().await;
        assert!(manager.webhook_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_unwatchable_path_leaves_trigger_inactive() {
        let (_tmp, manager, _runner, _bus) = setup(
            &[hand("alpha", json!([{"type": "file_change", "paths": ["/no/such/dir/anywhere"]}]))],
            TriggerSettings::default(),
        );
        assert_eq!(manager.activate_hand("alpha").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_fires_on_crossing() {
        let (_tmp, manager, runner, bus) = setup(
            &[hand("alpha", json!([{"type": "threshold", "metric": "backlog", "above": 10, "interval": 60}]))],
            TriggerSettings { cooldown: Duration::ZERO, ..Default::default() },
        );
        let fired = count_fired(&bus);

        let registry = Arc::clone(&manager.registry);
        registry.mark_running("alpha").unwrap();
        registry
            .record_run(
                "alpha",
                crate::hands::RunRecord {
                    metrics: BTreeMap::from([("backlog".to_string(), 5.0)]),
                    ..Default::default()
                },
            )
            .unwrap();

        manager.activate_hand("alpha").await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        registry.mark_running("alpha").unwrap();
        registry
            .record_run(
                "alpha",
                crate::hands::RunRecord {
                    metrics: BTreeMap::from([("backlog".to_string(), 50.0)]),
                    ..Default::default()
                },
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Still above: no refire until the auto-reset window passes
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        manager.deactivate_hand("alpha");
        assert!(manager.drain(Duration::from_secs(5)).await);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }
}
