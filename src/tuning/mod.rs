//! Dynamic Tuning
//!
//! After each collection the tuner converts measured survival into the
//! next cycle's allocation budgets, decides when a requested collection
//! is elevated to an older generation under memory pressure, tracks
//! provisional mode (heavy gen2 pinning disables background
//! collection), and optionally runs the PID loop driving gen2 toward a
//! configured memory-load set point.

use crate::config::{GcConfig, LohCompactionMode};
use crate::heap::generation::DynamicData;
use crate::heap::MAX_SOH_GENERATION;
use std::sync::Arc;

/// Damped survival-to-growth curve: low survival shrinks the budget
/// toward `limit`×survived, high survival saturates at `max_limit`.
pub fn surv_to_growth(cst: f32, limit: f32, max_limit: f32) -> f32 {
    debug_assert!(limit > 1.0 && max_limit > limit);
    if cst < (max_limit - limit) / (limit * (max_limit - 1.0)) {
        (limit - limit * cst) / (1.0 - cst * limit)
    } else {
        max_limit
    }
}

/// Per-generation growth parameters.
fn growth_params(gen: usize) -> (f32, f32) {
    if gen == 0 {
        (9.0, 20.0)
    } else if gen <= MAX_SOH_GENERATION {
        (2.0, 7.0)
    } else {
        (1.2, 1.8)
    }
}

/// Minimum per-generation budget.
fn min_budget(gen: usize, config: &GcConfig) -> usize {
    if gen == 0 && config.gen0_size != 0 {
        config.gen0_size
    } else {
        256 * 1024
    }
}

/// Maximum per-generation budget from configuration (0 = unlimited).
fn max_budget(gen: usize, config: &GcConfig) -> usize {
    match gen {
        0 => config.gen0_max_budget,
        1 => config.gen1_max_budget,
        _ => 0,
    }
}

/// PID state for the free-list tuning loop.
#[derive(Debug, Default)]
struct FlPid {
    integral: f64,
    prev_error: f64,
}

/// The tuner: one per collector.
pub struct Tuner {
    config: Arc<GcConfig>,
    /// Provisional mode: BGC disabled while pinned gen2 fragmentation
    /// stays high.
    provisional: bool,
    pid: FlPid,
}

impl Tuner {
    pub fn new(config: Arc<GcConfig>) -> Self {
        Self {
            config,
            provisional: false,
            pid: FlPid::default(),
        }
    }

    /// Whether provisional mode is active (disables BGC).
    pub fn provisional_mode(&self) -> bool {
        self.provisional
    }

    /// Pick the generation to condemn.
    ///
    /// Starts from the caller's request, raises it for any generation
    /// whose budget is exhausted, and applies elevation when memory
    /// load crosses the high threshold. Returns `(generation,
    /// elevated)`.
    pub fn condemned_generation(
        &self,
        requested: usize,
        budget_exhausted: &[bool],
        memory_load: u32,
    ) -> (usize, bool) {
        let mut gen = requested.min(MAX_SOH_GENERATION);
        for (g, &exhausted) in budget_exhausted
            .iter()
            .enumerate()
            .take(MAX_SOH_GENERATION + 1)
        {
            if exhausted && g > gen {
                gen = g;
            }
        }
        // In provisional mode only the ephemeral generations run.
        if self.provisional && gen == MAX_SOH_GENERATION {
            return (1, false);
        }
        let mut elevated = false;
        if gen == 1 && memory_load >= self.config.high_mem_percent {
            gen = MAX_SOH_GENERATION;
            elevated = true;
        }
        (gen, elevated)
    }

    /// Whether a blocking collection of `condemned` should compact.
    pub fn should_compact(&self, condemned: usize, fragmentation: usize, heap_size: usize) -> bool {
        if self.config.force_compact {
            return true;
        }
        if condemned == MAX_SOH_GENERATION && self.provisional {
            return true;
        }
        if heap_size == 0 {
            return false;
        }
        // Compact when a quarter of the condemned space is dead.
        fragmentation * 4 >= heap_size
    }

    /// Whether LOH compacts at this full collection. `Once` consumes
    /// itself (the caller resets the stored mode).
    pub fn loh_should_compact(
        &self,
        mode: LohCompactionMode,
        loh_fragmentation: usize,
        loh_size: usize,
    ) -> bool {
        match mode {
            LohCompactionMode::Default => false,
            LohCompactionMode::Once => true,
            LohCompactionMode::Auto => {
                // Twice the SOH compact threshold.
                loh_size != 0 && loh_fragmentation * 2 >= loh_size
            }
        }
    }

    /// Refresh one generation's dynamic data after it was condemned.
    pub fn update_generation(&self, dd: &mut DynamicData, gen: usize) {
        dd.collection_count += 1;
        dd.surv = if dd.begin_data_size == 0 {
            0.0
        } else {
            (dd.survived_size as f32 / dd.begin_data_size as f32).clamp(0.0, 1.0)
        };

        let (limit, max_limit) = growth_params(gen);
        let growth = surv_to_growth(dd.surv, limit, max_limit);
        let mut desired = (dd.survived_size as f32 * growth) as usize;
        desired = desired.max(min_budget(gen, &self.config));
        let cap = max_budget(gen, &self.config);
        if cap != 0 {
            desired = desired.min(cap);
        }
        dd.desired_allocation = desired;
        dd.reset_budget();

        log::debug!(
            "gen{}: surv {:.2} growth {:.2} desired {} frag {}",
            gen,
            dd.surv,
            growth,
            dd.desired_allocation,
            dd.fragmentation
        );
    }

    /// Evaluate provisional mode after a gen2 collection.
    pub fn observe_gen2(&mut self, compacted: bool, dd2: &DynamicData) {
        if compacted && dd2.current_size != 0 {
            let frag_high = dd2.fragmentation * 3 >= dd2.current_size;
            let pinned_heavy = dd2.pinned_survived_size * 10 >= dd2.survived_size.max(1);
            let was = self.provisional;
            self.provisional = frag_high && pinned_heavy;
            if self.provisional != was {
                log::info!(
                    "provisional mode {} (frag {} pinned {} size {})",
                    if self.provisional { "entered" } else { "left" },
                    dd2.fragmentation,
                    dd2.pinned_survived_size,
                    dd2.current_size
                );
            }
        }
    }

    /// PID free-list tuning: nudge the gen2 budget so memory load
    /// converges on `bgc_mem_goal`. Feature-flagged; called after a
    /// background collection's sweep.
    pub fn bgc_fl_tune(&mut self, dd2: &mut DynamicData, memory_load: u32) {
        if !self.config.bgc_fl_tuning_enabled {
            return;
        }
        let error = self.config.bgc_mem_goal as f64 - memory_load as f64;
        self.pid.integral = (self.pid.integral + self.config.bgc_fl_ki * error / 1000.0)
            .clamp(-1e9, 1e9);
        let derivative = error - self.pid.prev_error;
        self.pid.prev_error = error;

        let output = self.config.bgc_fl_kp * error / 1000.0
            + self.pid.integral
            + self.config.bgc_fl_kd * derivative / 1000.0;

        // Positive error (below goal) grows the budget, negative shrinks.
        let adjusted = dd2.desired_allocation as f64 * (1.0 + output / 100.0).clamp(0.5, 2.0);
        dd2.desired_allocation = adjusted as usize;
        dd2.reset_budget();
        log::debug!(
            "fl-tune: load {} error {:.1} output {:.1} gen2 budget {}",
            memory_load,
            error,
            output,
            dd2.desired_allocation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surv_to_growth_shape() {
        // No survival: budget shrinks toward the limit factor.
        assert!((surv_to_growth(0.0, 2.0, 7.0) - 2.0).abs() < f32::EPSILON);
        // Growth is monotone in survival until it saturates.
        let low = surv_to_growth(0.1, 2.0, 7.0);
        let mid = surv_to_growth(0.3, 2.0, 7.0);
        assert!(mid > low);
        assert_eq!(surv_to_growth(0.9, 2.0, 7.0), 7.0);
    }

    #[test]
    fn test_elevation_on_memory_pressure() {
        let tuner = Tuner::new(Arc::new(GcConfig {
            high_mem_percent: 90,
            ..Default::default()
        }));
        let (gen, elevated) = tuner.condemned_generation(1, &[false, false, false], 95);
        assert_eq!(gen, 2);
        assert!(elevated);
        let (gen, elevated) = tuner.condemned_generation(1, &[false, false, false], 50);
        assert_eq!(gen, 1);
        assert!(!elevated);
    }

    #[test]
    fn test_budget_exhaustion_raises_condemned() {
        let tuner = Tuner::new(Arc::new(GcConfig::default()));
        let (gen, _) = tuner.condemned_generation(0, &[true, true, false], 10);
        assert_eq!(gen, 1);
    }

    #[test]
    fn test_update_generation_resets_budget() {
        let tuner = Tuner::new(Arc::new(GcConfig::default()));
        let mut dd = DynamicData::new(1024);
        dd.begin_data_size = 1 << 20;
        dd.survived_size = 1 << 19;
        dd.charge(2048);
        tuner.update_generation(&mut dd, 1);
        assert!((dd.surv - 0.5).abs() < 0.01);
        assert_eq!(dd.new_allocation, dd.desired_allocation as isize);
        assert!(dd.desired_allocation >= 256 * 1024);
    }

    #[test]
    fn test_provisional_mode_entry() {
        let mut tuner = Tuner::new(Arc::new(GcConfig::default()));
        let mut dd = DynamicData::new(1024);
        dd.current_size = 1 << 20;
        dd.fragmentation = 1 << 19; // high post-compaction fragmentation
        dd.survived_size = 1 << 19;
        dd.pinned_survived_size = 1 << 18; // heavily pinned
        tuner.observe_gen2(true, &dd);
        assert!(tuner.provisional_mode());

        // Provisional mode degrades gen2 requests to gen1.
        let (gen, _) = tuner.condemned_generation(2, &[false, false, false], 10);
        assert_eq!(gen, 1);
    }
}
