//! Functions for handling per-tenant configuration options
//!
//! Every tenant runs with the pageserver-wide [`TenantConf`], optionally overridden
//! field by field with a [`TenantConfOpt`].
//!
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod defaults {
    // This parameter actually determines L0 layer file size.
    pub const DEFAULT_CHECKPOINT_DISTANCE: u64 = 256 * 1024 * 1024;

    // Target file size, when creating image and delta layers.
    // This parameter determines L1 layer file size.
    pub const DEFAULT_COMPACTION_TARGET_SIZE: u64 = 128 * 1024 * 1024;

    pub const DEFAULT_COMPACTION_PERIOD: &str = "20 s";
    pub const DEFAULT_COMPACTION_THRESHOLD: usize = 10;

    pub const DEFAULT_GC_HORIZON: u64 = 64 * 1024 * 1024;

    // Large DEFAULT_GC_PERIOD is fine as long as PITR_INTERVAL is larger.
    pub const DEFAULT_GC_PERIOD: &str = "1 hr";
    pub const DEFAULT_IMAGE_CREATION_THRESHOLD: usize = 3;
    pub const DEFAULT_PITR_INTERVAL: &str = "7 days";
    pub const DEFAULT_EVICTION_TIMEOUT: &str = "120 s";
}

/// Per-tenant configuration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConf {
    // Flush out an inmemory layer, if it's holding WAL older than this
    // This puts a backstop on how much WAL needs to be re-digested if the
    // page server crashes.
    // This parameter actually determines L0 layer file size.
    pub checkpoint_distance: u64,
    // Target file size, when creating image and delta layers.
    // This parameter determines L1 layer file size.
    pub compaction_target_size: u64,
    // How often to check if there's compaction work to be done.
    // Duration::ZERO means automatic compaction is disabled.
    #[serde(with = "humantime_serde")]
    pub compaction_period: Duration,
    // Level0 delta layer threshold for compaction.
    pub compaction_threshold: usize,
    // Determines how much history is retained, to allow
    // branching and read replicas at an older point in time.
    // The unit is #of bytes of WAL.
    // Page versions older than this are garbage collected away.
    pub gc_horizon: u64,
    // Interval at which garbage collection is triggered.
    // Duration::ZERO means automatic GC is disabled
    #[serde(with = "humantime_serde")]
    pub gc_period: Duration,
    // Delta layer churn threshold to create L1 image layers.
    pub image_creation_threshold: usize,
    // Determines how much history is retained, to allow
    // branching and read replicas at an older point in time.
    // The unit is time.
    // Page versions older than this are garbage collected away.
    #[serde(with = "humantime_serde")]
    pub pitr_interval: Duration,
    /// How long an eviction waits for readers to unpin the layer.
    #[serde(with = "humantime_serde")]
    pub eviction_timeout: Duration,
}

/// Same as TenantConf, but this struct preserves the information about
/// which parameters are set and which are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TenantConfOpt {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub checkpoint_distance: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub compaction_target_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "humantime_serde")]
    #[serde(default)]
    pub compaction_period: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub compaction_threshold: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub gc_horizon: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "humantime_serde")]
    #[serde(default)]
    pub gc_period: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub image_creation_threshold: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "humantime_serde")]
    #[serde(default)]
    pub pitr_interval: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "humantime_serde")]
    #[serde(default)]
    pub eviction_timeout: Option<Duration>,
}

impl TenantConfOpt {
    pub fn merge(&self, global_conf: TenantConf) -> TenantConf {
        TenantConf {
            checkpoint_distance: self
                .checkpoint_distance
                .unwrap_or(global_conf.checkpoint_distance),
            compaction_target_size: self
                .compaction_target_size
                .unwrap_or(global_conf.compaction_target_size),
            compaction_period: self
                .compaction_period
                .unwrap_or(global_conf.compaction_period),
            compaction_threshold: self
                .compaction_threshold
                .unwrap_or(global_conf.compaction_threshold),
            gc_horizon: self.gc_horizon.unwrap_or(global_conf.gc_horizon),
            gc_period: self.gc_period.unwrap_or(global_conf.gc_period),
            image_creation_threshold: self
                .image_creation_threshold
                .unwrap_or(global_conf.image_creation_threshold),
            pitr_interval: self.pitr_interval.unwrap_or(global_conf.pitr_interval),
            eviction_timeout: self
                .eviction_timeout
                .unwrap_or(global_conf.eviction_timeout),
        }
    }
}

impl TenantConf {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.checkpoint_distance > 0,
            "checkpoint_distance must be positive"
        );
        anyhow::ensure!(
            self.compaction_target_size > 0,
            "compaction_target_size must be positive"
        );
        // Compacting a single L0 layer would rewrite it into itself forever.
        anyhow::ensure!(
            self.compaction_threshold >= 2,
            "compaction_threshold must be at least 2, got {}",
            self.compaction_threshold
        );
        anyhow::ensure!(
            self.image_creation_threshold >= 1,
            "image_creation_threshold must be at least 1"
        );
        Ok(())
    }
}

impl Default for TenantConf {
    fn default() -> Self {
        use defaults::*;
        Self {
            checkpoint_distance: DEFAULT_CHECKPOINT_DISTANCE,
            compaction_target_size: DEFAULT_COMPACTION_TARGET_SIZE,
            compaction_period: humantime::parse_duration(DEFAULT_COMPACTION_PERIOD)
                .expect("cannot parse default compaction period"),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            gc_horizon: DEFAULT_GC_HORIZON,
            gc_period: humantime::parse_duration(DEFAULT_GC_PERIOD)
                .expect("cannot parse default gc period"),
            image_creation_threshold: DEFAULT_IMAGE_CREATION_THRESHOLD,
            pitr_interval: humantime::parse_duration(DEFAULT_PITR_INTERVAL)
                .expect("cannot parse default PITR interval"),
            eviction_timeout: humantime::parse_duration(DEFAULT_EVICTION_TIMEOUT)
                .expect("cannot parse default eviction timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conf = TenantConf::default();
        assert_eq!(conf.compaction_period, Duration::from_secs(20));
        assert_eq!(conf.gc_period, Duration::from_secs(3600));
        assert_eq!(conf.pitr_interval, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(conf.eviction_timeout, Duration::from_secs(120));
        conf.validate().unwrap();
    }

    #[test]
    fn overrides_are_merged_over_defaults() {
        let opt: TenantConfOpt =
            serde_json::from_str(r#"{"gc_horizon": 1024, "pitr_interval": "0s"}"#).unwrap();
        let merged = opt.merge(TenantConf::default());

        assert_eq!(merged.gc_horizon, 1024);
        assert_eq!(merged.pitr_interval, Duration::ZERO);
        assert_eq!(
            merged.compaction_threshold,
            defaults::DEFAULT_COMPACTION_THRESHOLD
        );

        // unset fields are not serialized back
        let json = serde_json::to_string(&opt).unwrap();
        assert!(!json.contains("compaction_threshold"), "{json}");
    }

    #[test]
    fn validation_rejects_degenerate_thresholds() {
        let conf = TenantConfOpt {
            compaction_threshold: Some(1),
            ..Default::default()
        }
        .merge(TenantConf::default());
        assert!(conf.validate().is_err());
    }
}
