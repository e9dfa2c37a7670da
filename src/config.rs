//! Configuration Module - GC Tuning Parameters
//!
//! Manages all configuration parameters for RGC. Configuration is consumed
//! once at init time; nothing is persisted.

use crate::error::{GcError, Result};
use crate::util::constants::{
    DEFAULT_LOH_THRESHOLD, DEFAULT_REGIONS_RANGE, DEFAULT_REGION_SIZE, MB,
};
use serde::{Deserialize, Serialize};

/// LOH compaction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LohCompactionMode {
    /// LOH is swept, never compacted
    Default,
    /// Compact LOH at the next full blocking GC, then revert to Default
    Once,
    /// Compact LOH when its fragmentation ratio crosses the auto threshold
    Auto,
}

/// Latency mode requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyMode {
    /// Throughput first; blocking GCs allowed anywhere
    Batch,
    /// Default interactive behavior
    Interactive,
    /// Avoid full blocking GCs where possible
    LowLatency,
    /// Background collection preferred for gen2
    SustainedLowLatency,
    /// Collections deferred inside a no-GC region
    NoGc,
}

/// Heap verification level, applied on entry and exit of collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeapVerifyLevel {
    /// No verification
    None,
    /// Verify reference closure and free lists
    Basic,
    /// Basic plus card coverage, bricks, handle ages and finalization
    Full,
}

/// One "G:L-H" entry of `heap_affinitize_ranges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinitizeRange {
    /// Processor group
    pub group: u16,
    /// First processor in the group (inclusive)
    pub lo: u16,
    /// Last processor in the group (inclusive)
    pub hi: u16,
}

/// Main configuration for the RGC collector.
///
/// Most parameters have sensible defaults; `0` generally means
/// "auto-detect" or "unlimited", matching the host conventions.
///
/// # Examples
///
/// ```rust
/// use rgc::GcConfig;
///
/// // Workstation, concurrent, defaults everywhere
/// let config = GcConfig::default();
///
/// // Parallel server configuration with four heaps
/// let config = GcConfig {
///     server_gc: true,
///     heap_count: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Use the parallel server configuration (one collector thread per heap)
    pub server_gc: bool,

    /// Enable background (concurrent) collection
    pub concurrent_gc: bool,

    /// Keep deleted regions on a standby list instead of releasing them
    pub retain_vm: bool,

    /// Number of heaps in the server configuration; 0 = one per processor
    pub heap_count: usize,

    /// Hard limit for the whole heap in bytes; 0 = none
    pub heap_hard_limit: usize,

    /// Per-object-heap hard limits in bytes; 0 = none
    pub heap_hard_limit_soh: usize,
    pub heap_hard_limit_loh: usize,
    pub heap_hard_limit_poh: usize,

    /// Hard limit as a percent of physical memory; 0 = none
    pub heap_hard_limit_percent: u32,

    /// Size of the virtual-address reservation carved into regions
    pub regions_range: usize,

    /// Basic region size; large regions are a fixed multiple of this
    pub regions_size: usize,

    /// Objects at or above this size allocate on the LOH
    pub loh_threshold: usize,

    /// LOH compaction policy
    pub loh_compaction_mode: LohCompactionMode,

    /// Latency mode
    pub latency_mode: LatencyMode,

    /// Memory load percent at which elevation kicks in; 0 = platform default
    pub high_mem_percent: u32,

    /// Smallest gen0 budget in bytes; 0 = auto
    pub gen0_size: usize,

    /// Largest gen0 budget in bytes; 0 = unlimited
    pub gen0_max_budget: usize,

    /// Largest gen1 budget in bytes; 0 = unlimited
    pub gen1_max_budget: usize,

    /// Do not affinitize server GC threads
    pub no_affinitize: bool,

    /// Processor mask for server GC threads; 0 = none
    pub heap_affinitize_mask: u64,

    /// Processor ranges for server GC threads, parsed from "G:L-H,…"
    pub heap_affinitize_ranges: Vec<AffinitizeRange>,

    /// Physical memory load goal for background collection scheduling
    pub bgc_mem_goal: u32,

    /// Enable the PID free-list tuning loop for gen2
    pub bgc_fl_tuning_enabled: bool,

    /// PID gains for the free-list tuning loop
    pub bgc_fl_kp: f64,
    pub bgc_fl_ki: f64,
    pub bgc_fl_kd: f64,

    /// Heap verification level on entry/exit of each GC
    pub heap_verify_level: HeapVerifyLevel,

    /// Always compact during blocking collections
    pub force_compact: bool,

    /// Verbose phase logging through the `log` facade
    pub verbose: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            server_gc: false,
            concurrent_gc: true,
            retain_vm: false,
            heap_count: 0,
            heap_hard_limit: 0,
            heap_hard_limit_soh: 0,
            heap_hard_limit_loh: 0,
            heap_hard_limit_poh: 0,
            heap_hard_limit_percent: 0,
            regions_range: DEFAULT_REGIONS_RANGE,
            regions_size: DEFAULT_REGION_SIZE,
            loh_threshold: DEFAULT_LOH_THRESHOLD,
            loh_compaction_mode: LohCompactionMode::Default,
            latency_mode: LatencyMode::Interactive,
            high_mem_percent: 90,
            gen0_size: 0,
            gen0_max_budget: 0,
            gen1_max_budget: 0,
            no_affinitize: false,
            heap_affinitize_mask: 0,
            heap_affinitize_ranges: Vec::new(),
            bgc_mem_goal: 75,
            bgc_fl_tuning_enabled: false,
            bgc_fl_kp: 6000.0,
            bgc_fl_ki: 1000.0,
            bgc_fl_kd: 11.0,
            heap_verify_level: HeapVerifyLevel::None,
            force_compact: false,
            verbose: false,
        }
    }
}

impl GcConfig {
    /// Validate the configuration.
    ///
    /// Invalid combinations fail initialization with
    /// [`GcError::Configuration`].
    pub fn validate(&self) -> Result<()> {
        if self.regions_size == 0 || !self.regions_size.is_power_of_two() {
            return Err(GcError::Configuration(
                "regions_size must be a nonzero power of two".to_string(),
            ));
        }

        if self.regions_size < MB {
            return Err(GcError::Configuration(
                "regions_size must be at least 1MiB".to_string(),
            ));
        }

        if self.regions_range < self.regions_size * 8 {
            return Err(GcError::Configuration(
                "regions_range must cover at least 8 basic regions".to_string(),
            ));
        }

        if self.heap_hard_limit_percent > 100 {
            return Err(GcError::Configuration(
                "heap_hard_limit_percent must be <= 100".to_string(),
            ));
        }

        if self.heap_hard_limit != 0 && self.heap_hard_limit_percent != 0 {
            return Err(GcError::Configuration(
                "heap_hard_limit and heap_hard_limit_percent are mutually exclusive".to_string(),
            ));
        }

        let per_oh = self.heap_hard_limit_soh | self.heap_hard_limit_loh | self.heap_hard_limit_poh;
        if per_oh != 0
            && (self.heap_hard_limit_soh == 0
                || self.heap_hard_limit_loh == 0
                || self.heap_hard_limit_poh == 0)
        {
            return Err(GcError::Configuration(
                "per-object-heap hard limits must be specified for SOH, LOH and POH together"
                    .to_string(),
            ));
        }

        if self.gen0_max_budget != 0 && self.gen0_size > self.gen0_max_budget {
            return Err(GcError::Configuration(
                "gen0_size cannot exceed gen0_max_budget".to_string(),
            ));
        }

        if self.loh_threshold < MIN_LOH_THRESHOLD {
            return Err(GcError::Configuration(format!(
                "loh_threshold must be at least {}",
                MIN_LOH_THRESHOLD
            )));
        }

        if self.heap_affinitize_mask != 0 && !self.heap_affinitize_ranges.is_empty() {
            return Err(GcError::Configuration(
                "heap_affinitize_mask and heap_affinitize_ranges are mutually exclusive"
                    .to_string(),
            ));
        }

        for r in &self.heap_affinitize_ranges {
            if r.lo > r.hi {
                return Err(GcError::Configuration(format!(
                    "affinitize range {}:{}-{} is inverted",
                    r.group, r.lo, r.hi
                )));
            }
        }

        if self.bgc_mem_goal == 0 || self.bgc_mem_goal > 100 {
            return Err(GcError::Configuration(
                "bgc_mem_goal must be in 1..=100".to_string(),
            ));
        }

        Ok(())
    }

    /// Effective heap count after auto-detection.
    pub fn effective_heap_count(&self) -> usize {
        if !self.server_gc {
            return 1;
        }
        if self.heap_count != 0 {
            self.heap_count
        } else {
            num_cpus::get().max(1)
        }
    }

    /// Size of a large region in bytes.
    pub fn large_region_size(&self) -> usize {
        self.regions_size * crate::util::constants::LARGE_REGION_FACTOR
    }

    /// Parse a "G:L-H,…" affinitize-ranges string.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let ranges = rgc::GcConfig::parse_affinitize_ranges("0:0-3,1:8-11").unwrap();
    /// assert_eq!(ranges.len(), 2);
    /// assert_eq!(ranges[1].group, 1);
    /// ```
    pub fn parse_affinitize_ranges(spec: &str) -> Result<Vec<AffinitizeRange>> {
        let mut out = Vec::new();
        for part in spec.split(',').filter(|p| !p.is_empty()) {
            let (group_str, range_str) = part.split_once(':').ok_or_else(|| {
                GcError::Configuration(format!("affinitize range '{}' missing group", part))
            })?;
            let group = group_str.parse::<u16>().map_err(|_| {
                GcError::Configuration(format!("bad processor group in '{}'", part))
            })?;
            let (lo, hi) = match range_str.split_once('-') {
                Some((l, h)) => (
                    l.parse::<u16>().map_err(|_| {
                        GcError::Configuration(format!("bad range start in '{}'", part))
                    })?,
                    h.parse::<u16>().map_err(|_| {
                        GcError::Configuration(format!("bad range end in '{}'", part))
                    })?,
                ),
                None => {
                    let p = range_str.parse::<u16>().map_err(|_| {
                        GcError::Configuration(format!("bad processor in '{}'", part))
                    })?;
                    (p, p)
                }
            };
            if lo > hi {
                return Err(GcError::Configuration(format!(
                    "affinitize range '{}' is inverted",
                    part
                )));
            }
            out.push(AffinitizeRange { group, lo, hi });
        }
        Ok(out)
    }

    /// Build configuration from environment variables.
    ///
    /// Overrides defaults with `RGC_`-prefixed variables:
    /// `RGC_SERVER`, `RGC_CONCURRENT`, `RGC_HEAP_COUNT`, `RGC_REGION_SIZE`,
    /// `RGC_HARD_LIMIT`, `RGC_GEN0_SIZE`, `RGC_VERBOSE`,
    /// `RGC_AFFINITIZE_RANGES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("RGC_SERVER") {
            config.server_gc = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("RGC_CONCURRENT") {
            config.concurrent_gc = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("RGC_HEAP_COUNT") {
            if let Ok(n) = val.parse::<usize>() {
                config.heap_count = n;
            }
        }
        if let Ok(val) = std::env::var("RGC_REGION_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.regions_size = size;
            }
        }
        if let Ok(val) = std::env::var("RGC_HARD_LIMIT") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_hard_limit = size;
            }
        }
        if let Ok(val) = std::env::var("RGC_GEN0_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.gen0_size = size;
            }
        }
        if let Ok(val) = std::env::var("RGC_VERBOSE") {
            config.verbose = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("RGC_AFFINITIZE_RANGES") {
            if let Ok(ranges) = Self::parse_affinitize_ranges(&val) {
                config.heap_affinitize_ranges = ranges;
            }
        }

        config
    }
}

/// Smallest permitted LOH threshold; below this the size classes overlap
/// the largest SOH free-list bucket.
const MIN_LOH_THRESHOLD: usize = 16 * 1024;

fn parse_bool(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.concurrent_gc);
        assert_eq!(config.effective_heap_count(), 1);
    }

    #[test]
    fn test_region_size_must_be_power_of_two() {
        let config = GcConfig {
            regions_size: 3 * MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_and_ranges_exclusive() {
        let config = GcConfig {
            heap_affinitize_mask: 0xF,
            heap_affinitize_ranges: vec![AffinitizeRange {
                group: 0,
                lo: 0,
                hi: 3,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_affinitize_ranges() {
        let ranges = GcConfig::parse_affinitize_ranges("0:0-3,1:8-11,2:5").unwrap();
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], AffinitizeRange { group: 0, lo: 0, hi: 3 });
        assert_eq!(ranges[2], AffinitizeRange { group: 2, lo: 5, hi: 5 });
        assert!(GcConfig::parse_affinitize_ranges("0:9-2").is_err());
        assert!(GcConfig::parse_affinitize_ranges("nogroup").is_err());
    }

    #[test]
    fn test_per_oh_limits_all_or_nothing() {
        let config = GcConfig {
            heap_hard_limit_soh: 64 * MB,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
