//! Threshold triggers: edge detection over a polled metric.

use std::time::Duration;
use tokio::time::Instant;

use crate::hands::HandRegistry;

/// Fires when a metric moves past a bound, not on every poll while it stays
/// there. With auto-reset, a value still past the bound fires again once
/// `reset_after` has elapsed since the last fire.
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    above: Option<f64>,
    below: Option<f64>,
    auto_reset: Option<Duration>,
    armed: bool,
    last_fire: Option<Instant>,
}

impl ThresholdDetector {
    pub fn new(above: Option<f64>, below: Option<f64>, auto_reset: Option<Duration>) -> Self {
        Self {
            above,
            below,
            auto_reset,
            armed: false,
            last_fire: None,
        }
    }

    pub fn is_past(&self, value: f64) -> bool {
        self.above.is_some_and(|a| value > a) || self.below.is_some_and(|b| value < b)
    }

    /// Feed one observation. Returns true when the trigger should fire.
    pub fn observe(&mut self, value: Option<f64>, now: Instant) -> bool {
        let past = value.is_some_and(|v| self.is_past(v));
        if !past {
            self.armed = false;
            return false;
        }

        if self.armed {
            let reset_due = match (self.auto_reset, self.last_fire) {
                (Some(reset), Some(last)) => now.duration_since(last) >= reset,
                _ => false,
            };
            if !reset_due {
                return false;
            }
        }

        self.armed = true;
        self.last_fire = Some(now);
        true
    }
}

/// Resolve a metric address.
///
/// `other-hand.key` reads another hand's metric when `other-hand` exists;
/// anything else is a key on `own_hand`.
pub fn resolve_metric(registry: &HandRegistry, own_hand: &str, address: &str) -> Option<f64> {
    if let Some((hand, key)) = address.split_once('.') {
        if registry.manifest(hand).is_some() {
            return registry.metric(hand, key);
        }
    }
    registry.metric(own_hand, address)
}
