use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

const LOCAL_ENV: &str = "local";
pub const DEFAULT_MIRROR: &str = "registry.cn-beijing.aliyuncs.com";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker daemon address. Supports `unix://`, `tcp://`, `http://` and
    /// plain socket paths. Uses the platform default when unset.
    #[serde(default)]
    pub address: Option<String>,
}

/// Where runtime images come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Regional registry mirror used when reachable.
    pub mirror: String,
    /// `host:port` probed once per process to decide whether the mirror
    /// is usable. Defaults to the mirror on port 443.
    pub probe_addr: Option<String>,
    pub probe_timeout_secs: u64,
    pub namespace: String,
    /// Version tag shared by all runtime images.
    pub image_version: String,
    /// Extra runtime name to image name mappings, merged over the builtin
    /// table.
    pub extra_runtimes: BTreeMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            mirror: DEFAULT_MIRROR.to_string(),
            probe_addr: None,
            probe_timeout_secs: 3,
            namespace: "aliyunfc".to_string(),
            image_version: "1.5.6".to_string(),
            extra_runtimes: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn probe_addr(&self) -> String {
        self.probe_addr
            .clone()
            .unwrap_or_else(|| format!("{}:443", self.mirror))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Root directory archives are extracted under. Uses the system temp
    /// directory when unset.
    pub tmp_root: Option<PathBuf>,
}

impl StagingConfig {
    pub fn tmp_root(&self) -> PathBuf {
        self.tmp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    /// Seconds added to a function's timeout before an invocation is
    /// reported as timed out.
    pub grace_secs: u64,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self { grace_secs: 2 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Endpoint usage events are posted to. Events are only logged when
    /// unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Environment name. Anything other than "local" logs JSON.
    pub env: String,
    pub listen_addr: String,
    /// Version segment of the emulated HTTP paths.
    pub api_version: String,
    pub docker: DockerConfig,
    pub registry: RegistryConfig,
    pub staging: StagingConfig,
    pub invoke: InvokeConfig,
    pub usage: UsageConfig,
    /// Remove containers left over by a previous run on startup.
    pub cleanup_orphans: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "127.0.0.1:8000".to_string(),
            api_version: "2016-08-15".to_string(),
            docker: DockerConfig::default(),
            registry: RegistryConfig::default(),
            staging: StagingConfig::default(),
            invoke: InvokeConfig::default(),
            usage: UsageConfig::default(),
            cleanup_orphans: true,
        }
    }
}

impl LocalConfig {
    /// Load from an optional YAML file, then `FC_LOCAL_`-prefixed
    /// environment variables (`FC_LOCAL_REGISTRY__MIRROR=...`).
    pub fn load(path: Option<&Path>) -> Result<LocalConfig> {
        let mut figment = Figment::from(Serialized::defaults(
            LocalConfig::default(),
        ));
        if let Some(path) = path {
            let config_str = std::fs::read_to_string(path)?;
            figment = figment.merge(Yaml::string(&config_str));
        }
        let config: LocalConfig = figment
            .merge(Env::prefixed("FC_LOCAL_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<LocalConfig> {
        let config: LocalConfig = Figment::from(Serialized::defaults(
            LocalConfig::default(),
        ))
        .merge(Yaml::string(config_str))
        .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.api_version.is_empty() || self.api_version.contains('/') {
            return Err(anyhow::anyhow!(
                "api_version must be a single path segment, got: {}",
                self.api_version
            ));
        }
        if self.registry.mirror.is_empty() {
            return Err(anyhow::anyhow!("registry.mirror must not be empty"));
        }
        if self.registry.probe_timeout_secs == 0 {
            return Err(anyhow::anyhow!("registry.probe_timeout_secs must be > 0"));
        }
        if let Some(endpoint) = &self.usage.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "usage.endpoint must include a scheme (http:// or https://), got: {}",
                    endpoint
                ));
            }
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.listen_addr.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LocalConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.api_version, "2016-08-15");
        assert_eq!(config.registry.mirror, DEFAULT_MIRROR);
        assert_eq!(
            config.registry.probe_addr(),
            "registry.cn-beijing.aliyuncs.com:443"
        );
        assert_eq!(config.invoke.grace_secs, 2);
        assert!(!config.structured_logging());
    }

    #[test]
    fn test_partial_override() {
        let config = LocalConfig::from_yaml_str(
            r#"
env: prod
listen_addr: 0.0.0.0:9000
registry:
  mirror: mirror.example.com
  extra_runtimes:
    nodejs12: nodejs12
"#,
        )
        .unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.registry.mirror, "mirror.example.com");
        assert_eq!(config.registry.namespace, "aliyunfc");
        assert_eq!(
            config.registry.extra_runtimes.get("nodejs12").map(String::as_str),
            Some("nodejs12")
        );
    }

    #[test]
    fn test_invalid_listen_addr() {
        assert!(LocalConfig::from_yaml_str("listen_addr: not-an-addr").is_err());
    }

    #[test]
    fn test_usage_endpoint_requires_scheme() {
        let err = LocalConfig::from_yaml_str("usage:\n  endpoint: example.com/usage").unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }
}
