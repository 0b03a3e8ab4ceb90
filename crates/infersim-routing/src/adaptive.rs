//! Adaptive weighted scoring.
//!
//! Combines three adjustments on top of [`WeightedScoring`](crate::WeightedScoring)'s
//! composite:
//!
//! 1. **Per-class profiles.** Each SLO class may carry its own weight profile;
//!    classes without one use the base profile.
//! 2. **KV pressure switch.** While the configured [`KvPressureTrigger`] fires,
//!    every request is scored with the pressure profile instead.
//! 3. **Epoch feedback.** Every `epoch_size` admission outcomes the rejection
//!    rate is compared to two thresholds and the prefix-affinity and
//!    queue-depth weights are scaled multiplicatively. High rejection moves
//!    weight from affinity to load spreading; low rejection moves it back.
//!
//! The scales are bounded and the affinity:load scale ratio is capped, so a
//! long run of low rejection cannot concentrate all traffic on cache holders.
//! Adaptive state changes only in [`RoutingPolicy::observe`].

use crate::config::{AdaptiveConfig, KvPressureTrigger, RoutingConfig};
use crate::scorers::{ScorerKind, ScorerWeight, WeightProfile};
use crate::traits::*;
use crate::PolicyError;
use std::collections::HashMap;
use tracing::debug;

const MIN_SCALE: f64 = 0.33;
const MAX_SCALE: f64 = 2.5;
const MAX_AFFINITY_TO_LOAD_RATIO: f64 = 1.5;
const MIN_AFFINITY_DECAY: f64 = 0.8;

pub struct AdaptiveWeightedScoring {
    base: WeightProfile,
    class_profiles: HashMap<SloClass, WeightProfile>,
    pressure: WeightProfile,
    trigger: KvPressureTrigger,
    feedback: bool,
    epoch_size: u32,
    high_rejection_rate: f64,
    low_rejection_rate: f64,
    step: f64,

    affinity_scale: f64,
    load_scale: f64,
    epoch_total: u32,
    epoch_rejected: u32,
    epochs_completed: u64,
    pressure_decisions: u64,
}

impl AdaptiveWeightedScoring {
    pub fn new(base: WeightProfile, pressure: WeightProfile, adaptive: &AdaptiveConfig) -> Self {
        Self {
            base,
            class_profiles: HashMap::new(),
            pressure,
            trigger: adaptive.pressure_trigger,
            feedback: adaptive.feedback,
            epoch_size: adaptive.epoch_size.max(1),
            high_rejection_rate: adaptive.high_rejection_rate,
            low_rejection_rate: adaptive.low_rejection_rate,
            step: adaptive.step,
            affinity_scale: 1.0,
            load_scale: 1.0,
            epoch_total: 0,
            epoch_rejected: 0,
            epochs_completed: 0,
            pressure_decisions: 0,
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Result<Self, PolicyError> {
        let adaptive = &config.adaptive;
        if adaptive.epoch_size == 0 {
            return Err(PolicyError::InvalidAdaptive(
                "epoch_size must be > 0".to_string(),
            ));
        }
        if !(adaptive.low_rejection_rate >= 0.0
            && adaptive.low_rejection_rate <= adaptive.high_rejection_rate
            && adaptive.high_rejection_rate <= 1.0)
        {
            return Err(PolicyError::InvalidAdaptive(format!(
                "rejection thresholds must satisfy 0 <= low ({}) <= high ({}) <= 1",
                adaptive.low_rejection_rate, adaptive.high_rejection_rate
            )));
        }
        if !(adaptive.step.is_finite() && adaptive.step > 0.0) {
            return Err(PolicyError::InvalidAdaptive(format!(
                "step must be positive, got {}",
                adaptive.step
            )));
        }
        let threshold = adaptive.pressure_trigger.threshold();
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(PolicyError::InvalidAdaptive(format!(
                "pressure trigger threshold must be non-negative, got {}",
                threshold
            )));
        }

        let base = WeightProfile::parse(&config.scorers)?;
        let pressure = WeightProfile::parse(&adaptive.pressure_profile)?;
        let mut policy = Self::new(base, pressure, adaptive);
        for (class, spec) in &adaptive.class_profiles {
            let class: SloClass = class
                .parse()
                .map_err(|_| PolicyError::UnknownSloClass(class.clone()))?;
            policy.class_profiles.insert(class, WeightProfile::parse(spec)?);
        }
        Ok(policy)
    }

    /// Current `(affinity, load)` weight scales.
    pub fn scales(&self) -> (f64, f64) {
        (self.affinity_scale, self.load_scale)
    }

    /// Whether the pressure trigger fires for this set of snapshots.
    pub fn under_pressure(&self, snapshots: &[RoutingSnapshot]) -> bool {
        match self.trigger {
            KvPressureTrigger::FreeBlockRatio { below } => {
                let total: u64 = snapshots.iter().map(|s| s.total_kv_blocks).sum();
                if total == 0 {
                    return false;
                }
                let free: u64 = snapshots.iter().map(|s| s.free_kv_blocks).sum();
                (free as f64 / total as f64) < below
            }
            KvPressureTrigger::ThrashingRate { above } => snapshots
                .iter()
                .any(|s| s.kv_thrashing_rate > above),
        }
    }

    fn select_profile(&self, class: SloClass, pressure: bool) -> &WeightProfile {
        if pressure {
            &self.pressure
        } else {
            self.class_profiles.get(&class).unwrap_or(&self.base)
        }
    }

    fn scaled(&self, profile: &WeightProfile) -> Option<WeightProfile> {
        if self.affinity_scale == 1.0 && self.load_scale == 1.0 {
            return None;
        }
        let mut updates = Vec::with_capacity(2);
        for (kind, scale) in [
            (ScorerKind::PrefixAffinity, self.affinity_scale),
            (ScorerKind::QueueDepth, self.load_scale),
        ] {
            if profile.contains(kind) {
                updates.push(ScorerWeight {
                    kind,
                    weight: profile.raw_weight(kind) * scale,
                });
            }
        }
        if updates.is_empty() {
            return None;
        }
        profile.with_raw_weights(&updates).ok()
    }

    fn adapt(&mut self) {
        let rate = self.epoch_rejected as f64 / self.epoch_total as f64;
        let alpha = self.step / 10.0;

        if rate > self.high_rejection_rate {
            let excess = rate - self.high_rejection_rate;
            self.load_scale *= 1.0 + alpha * excess * 10.0;
            self.affinity_scale *= (1.0 - alpha * excess * 5.0).max(MIN_AFFINITY_DECAY);
        } else if rate < self.low_rejection_rate {
            self.load_scale *= 1.0 - alpha * 0.5;
            self.affinity_scale *= 1.0 + alpha * 0.5;
        }
        self.load_scale = self.load_scale.clamp(MIN_SCALE, MAX_SCALE);
        self.affinity_scale = self.affinity_scale.clamp(MIN_SCALE, MAX_SCALE);

        // Both scales are already within [MIN_SCALE, MAX_SCALE], so raising the
        // load scale to meet the ratio cap cannot push it past MAX_SCALE.
        if self.affinity_scale / self.load_scale > MAX_AFFINITY_TO_LOAD_RATIO {
            self.load_scale = self.affinity_scale / MAX_AFFINITY_TO_LOAD_RATIO;
        }

        self.epochs_completed += 1;
        debug!(
            epoch = self.epochs_completed,
            rejection_rate = rate,
            affinity_scale = self.affinity_scale,
            load_scale = self.load_scale,
            "adaptive routing weights updated"
        );
        self.epoch_total = 0;
        self.epoch_rejected = 0;
    }
}

impl RoutingPolicy for AdaptiveWeightedScoring {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        if snapshots.is_empty() {
            return None;
        }
        let pressure = self.under_pressure(snapshots);
        if pressure {
            self.pressure_decisions += 1;
        }
        let selected = self.select_profile(request.slo_class, pressure);
        let scores = match self.scaled(selected) {
            Some(p) => p.composite(request, snapshots),
            None => selected.composite(request, snapshots),
        };
        argmax_lowest_index(&scores).map(|i| RoutingDecision::to(snapshots[i].id))
    }

    fn observe(&mut self, feedback: &RoutingFeedback) {
        if !self.feedback {
            return;
        }
        match feedback {
            RoutingFeedback::Routed { .. } => self.epoch_total += 1,
            RoutingFeedback::Rejected { .. } => {
                self.epoch_total += 1;
                self.epoch_rejected += 1;
            }
            RoutingFeedback::Completed { .. } | RoutingFeedback::Preempted { .. } => return,
        }
        if self.epoch_total >= self.epoch_size {
            self.adapt();
        }
    }

    fn name(&self) -> &str {
        "adaptive_weighted_scoring"
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("affinity_scale".to_string(), self.affinity_scale);
        m.insert("load_scale".to_string(), self.load_scale);
        m.insert("epochs".to_string(), self.epochs_completed as f64);
        m.insert(
            "pressure_decisions".to_string(),
            self.pressure_decisions as f64,
        );
        m
    }
}
