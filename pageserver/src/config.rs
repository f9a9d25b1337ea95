//! Functions for handling page server configuration options
//!
//! Configuration options can be set in a JSON document, and most of them have
//! a default that is used when the option is omitted.

use std::num::NonZeroUsize;

use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{RemotePath, RemoteStorageConfig};
use serde::Deserialize;
use utils::{
    id::{TenantId, TimelineId},
    logging::LogFormat,
};

use crate::tenant::config::TenantConfOpt;
use crate::tenant::config::TenantConf;
use crate::tenant::storage_layer::LayerName;

pub mod defaults {
    pub const DEFAULT_MAX_CONCURRENT_LAYER_DOWNLOADS: usize = 100;
    pub const DEFAULT_LOG_FORMAT: &str = "plain";
}

pub const TENANTS_SEGMENT_NAME: &str = "tenants";
pub const TIMELINES_SEGMENT_NAME: &str = "timelines";

#[derive(Debug, Clone)]
pub struct PageServerConf {
    /// Working directory; tenants live under `tenants/` in it.
    pub workdir: Utf8PathBuf,

    pub remote_storage_config: Option<RemoteStorageConfig>,

    /// Tenant settings used when a tenant does not override them.
    pub default_tenant_conf: TenantConf,

    pub log_format: LogFormat,

    /// Upper bound of layer downloads a single bulk download may run at once.
    pub max_concurrent_layer_downloads: NonZeroUsize,

    /// Fail this many first attempts of every remote operation.
    pub test_remote_failures: u64,
}

/// The on-disk form of [`PageServerConf`], every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigJson {
    workdir: Option<Utf8PathBuf>,
    remote_storage: Option<RemoteStorageConfig>,
    #[serde(default)]
    tenant_config: TenantConfOpt,
    log_format: Option<String>,
    max_concurrent_layer_downloads: Option<NonZeroUsize>,
    test_remote_failures: Option<u64>,
}

impl PageServerConf {
    //
    // Repository paths, relative to workdir.
    //

    pub fn tenants_path(&self) -> Utf8PathBuf {
        self.workdir.join(TENANTS_SEGMENT_NAME)
    }

    pub fn tenant_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenants_path().join(tenant_id.to_string())
    }

    pub fn timelines_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(TIMELINES_SEGMENT_NAME)
    }

    pub fn timeline_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timelines_path(tenant_id).join(timeline_id.to_string())
    }

    pub fn layer_path(
        &self,
        tenant_id: &TenantId,
        timeline_id: &TimelineId,
        layer_name: &LayerName,
    ) -> Utf8PathBuf {
        self.timeline_path(tenant_id, timeline_id)
            .join(layer_name.to_string())
    }

    /// Turns storage remote path of a file into its local path.
    pub fn local_path(&self, remote_path: &RemotePath) -> Utf8PathBuf {
        remote_path.with_base(&self.workdir)
    }

    /// Parse a configuration file (JSON) into a PageServerConf struct,
    /// relative paths are resolved against `workdir`.
    pub fn parse_and_validate(json: &str, workdir: &Utf8Path) -> anyhow::Result<Self> {
        let parsed: ConfigJson = serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("failed to parse pageserver configuration: {e}"))?;

        let workdir = match parsed.workdir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => workdir.join(dir),
            None => workdir.to_owned(),
        };

        let log_format = LogFormat::from_config(
            parsed
                .log_format
                .as_deref()
                .unwrap_or(defaults::DEFAULT_LOG_FORMAT),
        )?;

        let default_tenant_conf = parsed.tenant_config.merge(TenantConf::default());
        default_tenant_conf.validate()?;

        Ok(PageServerConf {
            workdir,
            remote_storage_config: parsed.remote_storage,
            default_tenant_conf,
            log_format,
            max_concurrent_layer_downloads: parsed.max_concurrent_layer_downloads.unwrap_or(
                NonZeroUsize::new(defaults::DEFAULT_MAX_CONCURRENT_LAYER_DOWNLOADS)
                    .expect("non-zero constant"),
            ),
            test_remote_failures: parsed.test_remote_failures.unwrap_or(0),
        })
    }

    pub fn dummy_conf(repo_dir: Utf8PathBuf) -> Self {
        PageServerConf {
            workdir: repo_dir,
            remote_storage_config: None,
            default_tenant_conf: TenantConf::default(),
            log_format: LogFormat::Test,
            max_concurrent_layer_downloads: NonZeroUsize::new(
                defaults::DEFAULT_MAX_CONCURRENT_LAYER_DOWNLOADS,
            )
            .expect("non-zero constant"),
            test_remote_failures: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parse_defaults_from_empty_config() -> anyhow::Result<()> {
        let workdir = Utf8PathBuf::from("/tmp/pageserver");
        let conf = PageServerConf::parse_and_validate("{}", &workdir)?;

        assert_eq!(conf.workdir, workdir);
        assert_eq!(conf.log_format, LogFormat::Plain);
        assert_eq!(conf.max_concurrent_layer_downloads.get(), 100);
        assert!(conf.remote_storage_config.is_none());
        assert_eq!(
            conf.default_tenant_conf.gc_horizon,
            TenantConf::default().gc_horizon
        );
        Ok(())
    }

    #[test]
    fn parse_overrides() -> anyhow::Result<()> {
        let workdir = Utf8PathBuf::from("/tmp/pageserver");
        let json = r#"{
            "workdir": "data",
            "log_format": "json",
            "remote_storage": { "local_path": "/tmp/remote" },
            "tenant_config": { "gc_period": "10s", "compaction_threshold": 3 },
            "max_concurrent_layer_downloads": 7
        }"#;
        let conf = PageServerConf::parse_and_validate(json, &workdir)?;

        assert_eq!(conf.workdir, Utf8PathBuf::from("/tmp/pageserver/data"));
        assert_eq!(conf.log_format, LogFormat::Json);
        assert_eq!(conf.max_concurrent_layer_downloads.get(), 7);
        assert_eq!(conf.default_tenant_conf.gc_period, Duration::from_secs(10));
        assert_eq!(conf.default_tenant_conf.compaction_threshold, 3);
        assert!(conf.remote_storage_config.is_some());
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let workdir = Utf8PathBuf::from("/tmp/pageserver");
        let err = PageServerConf::parse_and_validate(r#"{"no_such_option": 1}"#, &workdir)
            .expect_err("unknown option should fail");
        assert!(format!("{err:#}").contains("no_such_option"), "{err:#}");
    }

    #[test]
    fn repo_paths() {
        let conf = PageServerConf::dummy_conf(Utf8PathBuf::from("/repo"));
        let tenant_id = TenantId::from_array([1; 16]);
        let timeline_id = TimelineId::from_array([2; 16]);
        assert_eq!(
            conf.timeline_path(&tenant_id, &timeline_id),
            Utf8PathBuf::from(format!(
                "/repo/tenants/{tenant_id}/timelines/{timeline_id}"
            ))
        );
    }
}
