//! Functions for handling page server configuration options
//!
//! Configuration options can be set in the pageserver.toml configuration
//! file, or on the command line.
//! See also `settings.md` for better description on every parameter.

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use toml_edit::DocumentMut;

use utils::id::{TenantId, TimelineId};
use utils::logging::LogFormat;

use crate::tenant::config::{TenantConf, TenantConfOpt};
use crate::{
    IGNORED_TENANT_FILE_NAME, METADATA_FILE_NAME, TENANT_CONFIG_NAME, TIMELINES_SEGMENT_NAME,
};

pub const CONFIG_FILE_NAME: &str = "pageserver.toml";

pub mod defaults {
    pub const DEFAULT_LOG_FORMAT: &str = "plain";
}

/// The shape of `pageserver.toml`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigToml {
    #[serde(default)]
    pub log_format: Option<String>,
    /// Overrides of the built-in tenant config defaults.
    #[serde(default)]
    pub tenant_config: TenantConfOpt,
    #[serde(default)]
    pub background_jobs_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageServerConf {
    /// Root of the repository: tenant directories live under `workdir/tenants`.
    pub workdir: Utf8PathBuf,

    pub log_format: LogFormat,

    /// Tenant config defaults, used where a tenant does not override them.
    pub default_tenant_conf: TenantConf,

    /// When false, tenants become active but no GC or compaction loops are spawned.
    pub background_jobs_enabled: bool,
}

impl PageServerConf {
    //
    // Repository paths, relative to workdir.
    //

    pub fn tenants_path(&self) -> Utf8PathBuf {
        self.workdir.join("tenants")
    }

    pub fn tenant_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenants_path().join(tenant_id.to_string())
    }

    /// Points to a place in pageserver's local directory,
    /// where certain tenant's tenantconf file should be located.
    pub fn tenant_config_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(TENANT_CONFIG_NAME)
    }

    pub fn tenant_ignore_mark_file_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(IGNORED_TENANT_FILE_NAME)
    }

    pub fn timelines_path(&self, tenant_id: &TenantId) -> Utf8PathBuf {
        self.tenant_path(tenant_id).join(TIMELINES_SEGMENT_NAME)
    }

    pub fn timeline_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timelines_path(tenant_id).join(timeline_id.to_string())
    }

    /// Points to a place in pageserver's local directory,
    /// where certain timeline's metadata file should be located.
    pub fn metadata_path(&self, tenant_id: &TenantId, timeline_id: &TimelineId) -> Utf8PathBuf {
        self.timeline_path(tenant_id, timeline_id)
            .join(METADATA_FILE_NAME)
    }

    /// Parse a configuration file (pageserver.toml) into a PageServerConf struct,
    /// validating the input and failing on errors.
    ///
    /// This leaves any options not present in the file in the built-in defaults.
    pub fn parse_and_validate(config_toml: ConfigToml, workdir: &Utf8Path) -> anyhow::Result<Self> {
        let ConfigToml {
            log_format,
            tenant_config,
            background_jobs_enabled,
        } = config_toml;

        let log_format = LogFormat::from_config(
            log_format
                .as_deref()
                .unwrap_or(defaults::DEFAULT_LOG_FORMAT),
        )?;

        let default_tenant_conf = tenant_config.merge(TenantConf::default());
        if default_tenant_conf.checkpoint_distance == 0 {
            bail!("checkpoint_distance must be positive");
        }
        if default_tenant_conf.compaction_target_size == 0 {
            bail!("compaction_target_size must be positive");
        }

        Ok(PageServerConf {
            workdir: workdir.to_owned(),
            log_format,
            default_tenant_conf,
            background_jobs_enabled: background_jobs_enabled.unwrap_or(true),
        })
    }

    /// Reads `<workdir>/pageserver.toml` if it exists, applies `key=value` overrides on top
    /// and validates the result.
    pub fn load(workdir: &Utf8Path, overrides: &[String]) -> anyhow::Result<Self> {
        let cfg_file_path = workdir.join(CONFIG_FILE_NAME);
        let mut document = if cfg_file_path.is_file() {
            let contents = std::fs::read_to_string(&cfg_file_path)
                .with_context(|| format!("read config file {cfg_file_path}"))?;
            contents
                .parse::<DocumentMut>()
                .with_context(|| format!("parse config file {cfg_file_path}"))?
        } else {
            DocumentMut::new()
        };

        for option_line in overrides {
            let doc = option_line
                .parse::<DocumentMut>()
                .with_context(|| format!("Option '{option_line}' could not be parsed as a toml"))?;
            for (key, item) in doc.iter() {
                document.insert(key, item.clone());
            }
        }

        let config_toml: ConfigToml = toml_edit::de::from_str(&document.to_string())
            .context("deserialize pageserver config")?;
        PageServerConf::parse_and_validate(config_toml, workdir)
    }

    pub fn dummy_conf(repo_dir: Utf8PathBuf) -> Self {
        PageServerConf {
            workdir: repo_dir,
            log_format: LogFormat::Test,
            default_tenant_conf: TenantConf::dummy_conf(),
            background_jobs_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_empty_config_toml_is_valid() {
        let config_toml = toml_edit::de::from_str::<ConfigToml>("").expect("empty config is valid");
        let workdir = Utf8PathBuf::from("/nonexistent");
        let conf = PageServerConf::parse_and_validate(config_toml, &workdir).unwrap();
        assert_eq!(conf.default_tenant_conf, TenantConf::default());
        assert_eq!(conf.log_format, LogFormat::Plain);
        assert!(conf.background_jobs_enabled);
        assert_eq!(
            conf.tenants_path(),
            Utf8PathBuf::from("/nonexistent/tenants")
        );
    }

    #[test]
    fn test_tenant_config_and_overrides() {
        let workdir = camino_tempfile::tempdir().unwrap();
        std::fs::write(
            workdir.path().join(CONFIG_FILE_NAME),
            r#"
log_format = "json"

[tenant_config]
gc_period = "10 s"
compaction_threshold = 2
"#,
        )
        .unwrap();

        let conf = PageServerConf::load(
            workdir.path(),
            &["log_format='plain'".to_string(), "tenant_config={ gc_horizon = 1024 }".to_string()],
        )
        .unwrap();
        assert_eq!(conf.log_format, LogFormat::Plain);
        // the override replaces the whole table
        assert_eq!(conf.default_tenant_conf.gc_horizon, 1024);
        assert_eq!(
            conf.default_tenant_conf.gc_period,
            TenantConf::default().gc_period
        );

        let conf = PageServerConf::load(workdir.path(), &[]).unwrap();
        assert_eq!(conf.log_format, LogFormat::Json);
        assert_eq!(conf.default_tenant_conf.gc_period, Duration::from_secs(10));
        assert_eq!(conf.default_tenant_conf.compaction_threshold, 2);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let workdir = Utf8PathBuf::from("/nonexistent");
        toml_edit::de::from_str::<ConfigToml>("unknown_option = 1").unwrap_err();

        let config_toml =
            toml_edit::de::from_str::<ConfigToml>("log_format = \"xml\"").unwrap();
        PageServerConf::parse_and_validate(config_toml, &workdir).unwrap_err();

        let config_toml =
            toml_edit::de::from_str::<ConfigToml>("[tenant_config]\ncheckpoint_distance = 0")
                .unwrap();
        PageServerConf::parse_and_validate(config_toml, &workdir).unwrap_err();
    }
}
