//! Hand registry: manifests merged with persisted runtime state.
//!
//! The registry is the single source of truth for lifecycle status and
//! metrics. Every mutation persists the whole state file before returning.
//!
//! Lifecycle:
//!
//! | action       | allowed from              | result    |
//! |--------------|---------------------------|-----------|
//! | `activate`   | inactive, error           | active    |
//! | `pause`      | active, running           | paused    |
//! | `resume`     | paused                    | active    |
//! | `deactivate` | active, paused, running, error | inactive |
//! | `mark_running` | anything but running    | running   |
//! | `record_run` | running (or changed mid-run) | active / error / unchanged |
//! | `recover_interrupted` | running, not started here | error |

use chrono::{DateTime, Utc};
use familiar_common::{Config, Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::manifest::{discover_hands, HandManifest, MetricKind};
use super::state::{HandState, HandStatus, StateStore};
use crate::cron::{parse_cron, parse_timezone};

/// `last_error` of a run that never recorded its end.
pub const INTERRUPTED: &str = "interrupted";

/// A hand due for cron evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledHand {
    pub name: String,
    pub cron: String,
    pub timezone: String,
    pub max_duration_secs: u64,
}

/// Outcome of one run, as recorded on the hand.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub duration_ms: u64,
    pub error: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    pub checkpoint: Option<Value>,
}

/// Summary of a hand for listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub status: HandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Manifest plus current state.
#[derive(Debug, Clone, Serialize)]
pub struct HandEntry {
    pub manifest: HandManifest,
    pub state: HandState,
}

#[derive(Default)]
struct Inner {
    manifests: BTreeMap<String, HandManifest>,
    states: BTreeMap<String, HandState>,
    /// Status each running hand had before `mark_running`.
    pre_run: HashMap<String, HandStatus>,
}

/// Registry of hands.
pub struct HandRegistry {
    hands_dir: PathBuf,
    store: StateStore,
    default_timezone: String,
    default_max_duration_secs: u64,
    inner: RwLock<Inner>,
}

impl HandRegistry {
    /// Create an empty registry. Call [`load`](Self::load) to populate it.
    pub fn new(hands_dir: impl Into<PathBuf>, state_file: impl Into<PathBuf>) -> Self {
        Self {
            hands_dir: hands_dir.into(),
            store: StateStore::new(state_file),
            default_timezone: familiar_common::config::default_timezone(),
            default_max_duration_secs: 3600,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.hands.dir.clone(), config.hands.state_file.clone()).with_defaults(
            config.hands.default_timezone.clone(),
            config.hands.default_max_duration_secs,
        )
    }

    /// Override the timezone and max-duration used when a schedule omits them.
    pub fn with_defaults(mut self, timezone: String, max_duration_secs: u64) -> Self {
        self.default_timezone = timezone;
        self.default_max_duration_secs = max_duration_secs;
        self
    }

    pub fn hands_dir(&self) -> &Path {
        &self.hands_dir
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, states: &BTreeMap<String, HandState>) -> Result<()> {
        self.store
            .save(states)
            .map_err(|e| Error::Internal(format!("{e:#}")))
    }

    /// Re-read manifests and the state file, replacing the in-memory view.
    ///
    /// Safe to call at any time; picks up edits made by other processes.
    pub fn load(&self) -> anyhow::Result<usize> {
        let hands = discover_hands(&self.hands_dir)?;
        let states = self.store.load()?;

        let mut inner = self.write();
        inner.manifests = hands.into_iter().map(|h| (h.name.clone(), h)).collect();
        inner.states = states;
        let count = inner.manifests.len();
        drop(inner);

        tracing::debug!(count, dir = %self.hands_dir.display(), "Hand registry loaded");
        Ok(count)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().manifests.keys().cloned().collect()
    }

    pub fn manifest(&self, name: &str) -> Option<HandManifest> {
        self.read().manifests.get(name).cloned()
    }

    /// Current state; hands that never ran report the default (inactive).
    pub fn state(&self, name: &str) -> Option<HandState> {
        let inner = self.read();
        inner.manifests.get(name)?;
        Some(inner.states.get(name).cloned().unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Option<HandEntry> {
        let inner = self.read();
        let manifest = inner.manifests.get(name)?.clone();
        let state = inner.states.get(name).cloned().unwrap_or_default();
        Some(HandEntry { manifest, state })
    }

    pub fn status(&self, name: &str) -> Option<HandStatus> {
        self.state(name).map(|s| s.status)
    }

    /// Hands whose triggers should be live: active, or active and mid-run.
    pub fn active(&self) -> Vec<HandManifest> {
        let inner = self.read();
        inner
            .manifests
            .values()
            .filter(|m| {
                let status = inner.states.get(&m.name).map(|s| s.status).unwrap_or_default();
                matches!(status, HandStatus::Active | HandStatus::Running)
            })
            .cloned()
            .collect()
    }

    /// Summaries of every hand, sorted by name.
    pub fn list(&self) -> Vec<HandSummary> {
        let now = Utc::now();
        let inner = self.read();
        inner
            .manifests
            .values()
            .map(|m| {
                let state = inner.states.get(&m.name).cloned().unwrap_or_default();
                let timezone = m.schedule.as_ref().map(|s| {
                    s.timezone.clone().unwrap_or_else(|| self.default_timezone.clone())
                });
                let next_run = match (&m.schedule, &timezone) {
                    (Some(schedule), Some(tz)) if state.status == HandStatus::Active => {
                        let expr = parse_cron(&schedule.cron).ok();
                        let tz = parse_timezone(tz);
                        expr.zip(tz).and_then(|(e, tz)| e.next_fire(now, tz))
                    }
                    _ => None,
                };
                HandSummary {
                    name: m.name.clone(),
                    version: m.version.clone(),
                    description: m.description.clone(),
                    status: state.status,
                    schedule: m.cron().map(str::to_string),
                    timezone,
                    next_run,
                    run_count: state.run_count,
                    last_run: state.last_run,
                    last_error: state.last_error,
                }
            })
            .collect()
    }

    /// Active hands that declare a cron schedule, with defaults applied.
    pub fn get_scheduled(&self) -> Vec<ScheduledHand> {
        let inner = self.read();
        inner
            .manifests
            .values()
            .filter(|m| {
                inner.states.get(&m.name).map(|s| s.status) == Some(HandStatus::Active)
            })
            .filter_map(|m| {
                let schedule = m.schedule.as_ref()?;
                Some(ScheduledHand {
                    name: m.name.clone(),
                    cron: schedule.cron.clone(),
                    timezone: schedule
                        .timezone
                        .clone()
                        .unwrap_or_else(|| self.default_timezone.clone()),
                    max_duration_secs: schedule
                        .max_duration
                        .unwrap_or(self.default_max_duration_secs),
                })
            })
            .collect()
    }

    /// Current value of a metric.
    pub fn metric(&self, hand: &str, key: &str) -> Option<f64> {
        self.read().states.get(hand)?.metrics.get(key).copied()
    }

    /// All metrics, keyed by hand.
    pub fn metrics(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        let inner = self.read();
        inner
            .manifests
            .keys()
            .map(|name| {
                let metrics = inner
                    .states
                    .get(name)
                    .map(|s| s.metrics.clone())
                    .unwrap_or_default();
                (name.clone(), metrics)
            })
            .collect()
    }

    fn transition(
        &self,
        name: &str,
        action: &str,
        allowed: &[HandStatus],
        apply: impl FnOnce(&mut HandState),
    ) -> Result<HandState> {
        let mut inner = self.write();
        if !inner.manifests.contains_key(name) {
            return Err(Error::hand_not_found(name));
        }

        let state = inner.states.entry(name.to_string()).or_default();
        if !allowed.contains(&state.status) {
            return Err(Error::InvalidTransition {
                hand: name.to_string(),
                from: state.status.to_string(),
                action: action.to_string(),
            });
        }
        let from = state.status;
        apply(state);
        let snapshot = state.clone();

        self.persist(&inner.states)?;
        tracing::info!(hand = %name, from = %from, to = %snapshot.status, "Hand {action}");
        Ok(snapshot)
    }

    pub fn activate(&self, name: &str) -> Result<HandState> {
        self.transition(name, "activate", &[HandStatus::Inactive, HandStatus::Error], |s| {
            s.status = HandStatus::Active;
            s.activated_at = Some(Utc::now());
        })
    }

    pub fn pause(&self, name: &str) -> Result<HandState> {
        self.transition(name, "pause", &[HandStatus::Active, HandStatus::Running], |s| {
            s.status = HandStatus::Paused;
        })
    }

    pub fn resume(&self, name: &str) -> Result<HandState> {
        self.transition(name, "resume", &[HandStatus::Paused], |s| {
            s.status = HandStatus::Active;
        })
    }

    pub fn deactivate(&self, name: &str) -> Result<HandState> {
        self.transition(
            name,
            "deactivate",
            &[
                HandStatus::Active,
                HandStatus::Paused,
                HandStatus::Running,
                HandStatus::Error,
            ],
            |s| {
                s.status = HandStatus::Inactive;
                s.activated_at = None;
            },
        )
    }

    /// Activate every inactive or errored hand. Returns the names activated.
    pub fn activate_all(&self) -> Result<Vec<String>> {
        let mut activated = Vec::new();
        for name in self.names() {
            match self.status(&name) {
                Some(HandStatus::Inactive | HandStatus::Error) => {
                    self.activate(&name)?;
                    activated.push(name);
                }
                _ => {}
            }
        }
        Ok(activated)
    }

    /// Mark a hand as running. Fails if it is already running.
    pub fn mark_running(&self, name: &str) -> Result<()> {
        let mut inner = self.write();
        if !inner.manifests.contains_key(name) {
            return Err(Error::hand_not_found(name));
        }

        let state = inner.states.entry(name.to_string()).or_default();
        let previous = state.status;
        if previous == HandStatus::Running {
            return Err(Error::InvalidTransition {
                hand: name.to_string(),
                from: previous.to_string(),
                action: "start".to_string(),
            });
        }
        state.status = HandStatus::Running;
        inner.pre_run.insert(name.to_string(), previous);

        self.persist(&inner.states)?;
        tracing::debug!(hand = %name, from = %previous, "Hand running");
        Ok(())
    }

    /// Fail every hand persisted as `running` that this registry did not
    /// start. A process that exits mid-run leaves that status on disk with no
    /// `record_run` to clear it. Returns the names recovered.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut inner = self.write();
        let Inner { states, pre_run, .. } = &mut *inner;

        let mut recovered = Vec::new();
        for (name, state) in states.iter_mut() {
            if state.status == HandStatus::Running && !pre_run.contains_key(name) {
                state.status = HandStatus::Error;
                state.last_error = Some(INTERRUPTED.to_string());
                recovered.push(name.clone());
            }
        }
        if recovered.is_empty() {
            return Ok(recovered);
        }

        self.persist(&inner.states)?;
        for name in &recovered {
            tracing::warn!(hand = %name, "Run interrupted by a previous exit, marked as failed");
        }
        Ok(recovered)
    }

    /// Record the end of a run.
    ///
    /// Failure sets `error`. Success clears the error and returns the hand to
    /// `active`, except that a hand that was inactive before a manual run goes
    /// back to `inactive`. A status changed while the run was in flight
    /// (paused or deactivated) is kept.
    pub fn record_run(&self, name: &str, record: RunRecord) -> Result<HandState> {
        let mut inner = self.write();
        let Some(manifest) = inner.manifests.get(name).cloned() else {
            return Err(Error::hand_not_found(name));
        };
        let previous = inner.pre_run.remove(name);

        let state = inner.states.entry(name.to_string()).or_default();
        state.last_run = Some(Utc::now());
        state.last_duration = Some(record.duration_ms);
        state.run_count += 1;

        match &record.error {
            Some(error) => {
                state.status = HandStatus::Error;
                state.last_error = Some(error.clone());
            }
            None => {
                state.last_error = None;
                if state.status == HandStatus::Running || state.status == HandStatus::Error {
                    state.status = match previous {
                        Some(HandStatus::Inactive) => HandStatus::Inactive,
                        _ => HandStatus::Active,
                    };
                }
            }
        }

        for (key, value) in record.metrics {
            match manifest.metric_kind(&key) {
                Some(MetricKind::Counter) => {
                    *state.metrics.entry(key).or_insert(0.0) += value;
                }
                _ => {
                    state.metrics.insert(key, value);
                }
            }
        }

        if let Some(checkpoint) = record.checkpoint {
            state.checkpoint = Some(checkpoint);
        }

        let snapshot = state.clone();
        self.persist(&inner.states)?;
        tracing::debug!(hand = %name, status = %snapshot.status, runs = snapshot.run_count, "Run recorded");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::manifest::MANIFEST_FILE;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn setup(manifests: &[Value]) -> (TempDir, HandRegistry) {
        let tmp = TempDir::new().unwrap();
        for m in manifests {
            let dir = tmp.path().join("hands").join(m["name"].as_str().unwrap());
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(MANIFEST_FILE), m.to_string()).unwrap();
        }
        let registry = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        registry.load().unwrap();
        (tmp, registry)
    }

    fn hand(name: &str) -> Value {
        json!({
            "name": name,
            "schedule": {"cron": "0 9 * * *"},
            "phases": [{"name": "p1", "prompt": "x"}],
            "metrics": {"runs": {"type": "counter"}, "backlog": {"type": "gauge"}}
        })
    }

    #[test]
    fn test_load_defaults_to_inactive() {
        let (_tmp, registry) = setup(&[hand("alpha"), hand("beta")]);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(registry.status("alpha"), Some(HandStatus::Inactive));
        assert_eq!(registry.status("missing"), None);
        assert!(registry.get_scheduled().is_empty());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (_tmp, registry) = setup(&[hand("alpha")]);

        let err = registry.pause("alpha").unwrap_err();
        assert!(err.is_transition());
        assert_eq!(err.to_string(), "Cannot pause hand 'alpha' while it is inactive");
        assert!(registry.resume("alpha").unwrap_err().is_transition());
        assert!(registry.deactivate("alpha").unwrap_err().is_transition());

        let state = registry.activate("alpha").unwrap();
        assert_eq!(state.status, HandStatus::Active);
        assert!(state.activated_at.is_some());
        assert!(registry.activate("alpha").unwrap_err().is_transition());

        assert_eq!(registry.pause("alpha").unwrap().status, HandStatus::Paused);
        assert!(registry.pause("alpha").unwrap_err().is_transition());
        assert_eq!(registry.resume("alpha").unwrap().status, HandStatus::Active);

        let state = registry.deactivate("alpha").unwrap();
        assert_eq!(state.status, HandStatus::Inactive);
        assert!(state.activated_at.is_none());

        assert!(matches!(registry.activate("ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_transitions_persist_and_reload() {
        let (tmp, registry) = setup(&[hand("alpha")]);
        registry.activate("alpha").unwrap();

        let reopened = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        reopened.load().unwrap();
        assert_eq!(reopened.status("alpha"), Some(HandStatus::Active));
    }

    #[test]
    fn test_load_picks_up_external_edits() {
        let (tmp, registry) = setup(&[hand("alpha")]);
        let other = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        other.load().unwrap();
        other.activate("alpha").unwrap();

        assert_eq!(registry.status("alpha"), Some(HandStatus::Inactive));
        registry.load().unwrap();
        assert_eq!(registry.status("alpha"), Some(HandStatus::Active));
    }

    #[test]
    fn test_run_success_and_failure() {
        let (_tmp, registry) = setup(&[hand("alpha")]);
        registry.activate("alpha").unwrap();

        registry.mark_running("alpha").unwrap();
        assert_eq!(registry.status("alpha"), Some(HandStatus::Running));
        assert!(registry.mark_running("alpha").unwrap_err().is_transition());

        let state = registry
            .record_run("alpha", RunRecord { duration_ms: 10, error: Some("boom".into()), ..Default::default() })
            .unwrap();
        assert_eq!(state.status, HandStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.run_count, 1);

        registry.mark_running("alpha").unwrap();
        let state = registry
            .record_run("alpha", RunRecord { duration_ms: 20, ..Default::default() })
            .unwrap();
        assert_eq!(state.status, HandStatus::Active);
        assert!(state.last_error.is_none());
        assert_eq!(state.last_duration, Some(20));
        assert_eq!(state.run_count, 2);
        assert!(state.last_run.is_some());
    }

    #[test]
    fn test_pause_during_run_is_kept() {
        let (_tmp, registry) = setup(&[hand("alpha")]);
        registry.activate("alpha").unwrap();
        registry.mark_running("alpha").unwrap();
        registry.pause("alpha").unwrap();

        let state = registry.record_run("alpha", RunRecord::default()).unwrap();
        assert_eq!(state.status, HandStatus::Paused);
    }

    #[test]
    fn test_manual_run_of_inactive_hand_stays_inactive() {
        let (_tmp, registry) = setup(&[hand("alpha")]);
        registry.mark_running("alpha").unwrap();
        let state = registry.record_run("alpha", RunRecord::default()).unwrap();
        assert_eq!(state.status, HandStatus::Inactive);
        assert_eq!(state.run_count, 1);
    }

    #[test]
    fn test_metric_accumulation() {
        let (_tmp, registry) = setup(&[hand("alpha")]);
        for (runs, backlog) in [(2.0, 10.0), (3.0, 4.0)] {
            registry.mark_running("alpha").unwrap();
            let metrics = BTreeMap::from([
                ("runs".to_string(), runs),
                ("backlog".to_string(), backlog),
                ("undeclared".to_string(), runs),
            ]);
            registry
                .record_run("alpha", RunRecord { metrics, checkpoint: Some(json!({"page": runs})), ..Default::default() })
                .unwrap();
        }

        assert_eq!(registry.metric("alpha", "runs"), Some(5.0));
        assert_eq!(registry.metric("alpha", "backlog"), Some(4.0));
        assert_eq!(registry.metric("alpha", "undeclared"), Some(3.0));
        assert_eq!(registry.metric("alpha", "nope"), None);
        assert_eq!(registry.state("alpha").unwrap().checkpoint, Some(json!({"page": 3.0})));
    }

    #[test]
    fn test_get_scheduled_applies_defaults() {
        let mut custom = hand("beta");
        custom["schedule"] = json!({"cron": "*/5 * * * *", "timezone": "UTC", "maxDuration": 60});
        let mut unscheduled = hand("gamma");
        unscheduled["schedule"] = Value::Null;

        let (_tmp, registry) = setup(&[hand("alpha"), custom, unscheduled]);
        registry.activate_all().unwrap();
        registry.pause("alpha").unwrap();
        registry.resume("alpha").unwrap();

        let scheduled = registry.get_scheduled();
        assert_eq!(
            scheduled,
            vec![
                ScheduledHand {
                    name: "alpha".into(),
                    cron: "0 9 * * *".into(),
                    timezone: "America/Los_Angeles".into(),
                    max_duration_secs: 3600,
                },
                ScheduledHand {
                    name: "beta".into(),
                    cron: "*/5 * * * *".into(),
                    timezone: "UTC".into(),
                    max_duration_secs: 60,
                },
            ]
        );
    }

    #[test]
    fn test_activate_all_and_list() {
        let (_tmp, registry) = setup(&[hand("alpha"), hand("beta")]);
        registry.activate("beta").unwrap();
        registry.pause("beta").unwrap();

        assert_eq!(registry.activate_all().unwrap(), vec!["alpha"]);

        let list = registry.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "alpha");
        assert_eq!(list[0].status, HandStatus::Active);
        assert!(list[0].next_run.is_some());
        assert_eq!(list[1].status, HandStatus::Paused);
        assert!(list[1].next_run.is_none());
    }

    #[test]
    fn test_recover_run_left_running_by_previous_process() {
        let (tmp, registry) = setup(&[hand("alpha"), hand("beta")]);
        registry.activate_all().unwrap();
        registry.mark_running("alpha").unwrap();
        drop(registry);

        let reopened = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        reopened.load().unwrap();
        assert_eq!(reopened.status("alpha"), Some(HandStatus::Running));

        assert_eq!(reopened.recover_interrupted().unwrap(), vec!["alpha"]);
        let state = reopened.state("alpha").unwrap();
        assert_eq!(state.status, HandStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some(INTERRUPTED));
        assert_eq!(reopened.status("beta"), Some(HandStatus::Active));
        assert!(reopened.recover_interrupted().unwrap().is_empty());

        let third = HandRegistry::new(tmp.path().join("hands"), tmp.path().join("state.json"));
        third.load().unwrap();
        assert_eq!(third.status("alpha"), Some(HandStatus::Error));

        // Recovered hands are usable again
        reopened.activate("alpha").unwrap();
        assert_eq!(reopened.get_scheduled().len(), 2);
        reopened.mark_running("alpha").unwrap();
    }

    #[test]
    fn test_recover_keeps_runs_started_here() {
        let (_tmp, registry) = setup(&[hand("alpha")]);
        registry.activate("alpha").unwrap();
        registry.mark_running("alpha").unwrap();
        registry.load().unwrap();

        assert!(registry.recover_interrupted().unwrap().is_empty());
        assert_eq!(registry.status("alpha"), Some(HandStatus::Running));
        let state = registry.record_run("alpha", RunRecord::default()).unwrap();
        assert_eq!(state.status, HandStatus::Active);
    }
}
