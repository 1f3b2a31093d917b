//! Runtime image resolution.
//!
//! Maps a runtime id to its image and decides, once per resolver, whether
//! images come from the regional mirror or the default registry.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{net::TcpStream, sync::OnceCell};
use tracing::{debug, info};

use crate::{
    config::RegistryConfig,
    error::{Error, Result},
    usage::{UsageEvent, UsageReporter},
};

const BUILTIN_RUNTIMES: [(&str, &str); 7] = [
    ("nodejs6", "nodejs6"),
    ("nodejs8", "nodejs8"),
    ("nodejs10", "nodejs10"),
    ("python2.7", "python2.7"),
    ("python3", "python3.6"),
    ("java8", "java8"),
    ("php7.2", "php7.2"),
];

/// What the image is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Invoke,
    Build,
}

/// Where images are pulled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registry {
    Mirror(String),
    Default,
}

impl Registry {
    fn usage_label(&self) -> &'static str {
        match self {
            Registry::Mirror(_) => "MirrorRegistry",
            Registry::Default => "DefaultRegistry",
        }
    }
}

/// Network reachability check used to pick the registry.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> anyhow::Result<bool>;
}

/// Probes by opening a TCP connection with a bounded timeout.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn is_reachable(&self) -> anyhow::Result<bool> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("connect {}", self.addr))),
            Err(_) => Ok(false),
        }
    }
}

pub struct ImageResolver {
    runtimes: BTreeMap<String, String>,
    namespace: String,
    version: String,
    mirror: String,
    probe: Arc<dyn ReachabilityProbe>,
    registry: OnceCell<Registry>,
    usage: Arc<dyn UsageReporter>,
}

impl ImageResolver {
    pub fn new(
        config: &RegistryConfig,
        probe: Arc<dyn ReachabilityProbe>,
        usage: Arc<dyn UsageReporter>,
    ) -> Self {
        let mut runtimes: BTreeMap<String, String> = BUILTIN_RUNTIMES
            .iter()
            .map(|(runtime, image)| (runtime.to_string(), image.to_string()))
            .collect();
        runtimes.extend(config.extra_runtimes.clone());

        Self {
            runtimes,
            namespace: config.namespace.clone(),
            version: config.image_version.clone(),
            mirror: config.mirror.clone(),
            probe,
            registry: OnceCell::new(),
            usage,
        }
    }

    /// Resolver probing the configured address over TCP.
    pub fn from_config(config: &RegistryConfig, usage: Arc<dyn UsageReporter>) -> Self {
        let probe = Arc::new(TcpProbe::new(config.probe_addr(), config.probe_timeout()));
        Self::new(config, probe, usage)
    }

    pub fn supports(&self, runtime: &str) -> bool {
        self.runtimes.contains_key(runtime)
    }

    /// Image reference without registry prefix.
    pub fn image_name(&self, runtime: &str, purpose: Purpose) -> Result<String> {
        let name = self
            .runtimes
            .get(runtime)
            .ok_or_else(|| Error::UnsupportedRuntime {
                runtime: runtime.to_string(),
            })?;
        let tag = match purpose {
            Purpose::Invoke => self.version.clone(),
            Purpose::Build => format!("build-{}", self.version),
        };
        Ok(format!("{}/runtime-{}:{}", self.namespace, name, tag))
    }

    pub async fn resolve_image(&self, runtime: &str, purpose: Purpose) -> Result<String> {
        let image = self.image_name(runtime, purpose)?;
        let registry = self.registry().await;

        self.usage
            .report(UsageEvent::new("imageRepo", "resolve", registry.usage_label()));

        let image = match registry {
            Registry::Mirror(mirror) => format!("{mirror}/{image}"),
            Registry::Default => image,
        };
        debug!(runtime = %runtime, image = %image, "Resolved runtime image");
        Ok(image)
    }

    /// Registry decision, probed on first use only.
    pub async fn registry(&self) -> &Registry {
        self.registry
            .get_or_init(|| async {
                self.usage
                    .report(UsageEvent::new("imageRepo", "resolve", "start"));
                let registry = match self.probe.is_reachable().await {
                    Ok(true) => Registry::Mirror(self.mirror.clone()),
                    Ok(false) => Registry::Default,
                    Err(e) => {
                        debug!(error = %e, "Registry probe failed");
                        Registry::Default
                    }
                };
                info!(registry = ?registry, "Selected image registry");
                registry
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    struct CountingProbe {
        calls: AtomicUsize,
        result: Option<bool>,
    }

    #[async_trait]
    impl ReachabilityProbe for CountingProbe {
        async fn is_reachable(&self) -> anyhow::Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.ok_or_else(|| anyhow::anyhow!("dns failure"))
        }
    }

    #[derive(Default)]
    struct RecordingReporter(Mutex<Vec<String>>);

    impl UsageReporter for RecordingReporter {
        fn report(&self, event: UsageEvent) {
            self.0.lock().unwrap().push(event.to_string());
        }
    }

    fn make_resolver(result: Option<bool>) -> (ImageResolver, Arc<CountingProbe>, Arc<RecordingReporter>) {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            result,
        });
        let usage = Arc::new(RecordingReporter::default());
        let resolver = ImageResolver::new(&RegistryConfig::default(), probe.clone(), usage.clone());
        (resolver, probe, usage)
    }

    #[tokio::test]
    async fn test_reachable_uses_mirror() {
        let (resolver, _, usage) = make_resolver(Some(true));
        let image = resolver.resolve_image("nodejs8", Purpose::Invoke).await.unwrap();
        assert_eq!(
            image,
            "registry.cn-beijing.aliyuncs.com/aliyunfc/runtime-nodejs8:1.5.6"
        );
        assert_eq!(
            *usage.0.lock().unwrap(),
            vec![
                "imageRepo/resolve/start".to_string(),
                "imageRepo/resolve/MirrorRegistry".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_or_error_uses_default() {
        let (resolver, _, _) = make_resolver(Some(false));
        assert_eq!(
            resolver.resolve_image("python3", Purpose::Build).await.unwrap(),
            "aliyunfc/runtime-python3.6:build-1.5.6"
        );

        let (resolver, _, usage) = make_resolver(None);
        assert_eq!(
            resolver.resolve_image("java8", Purpose::Invoke).await.unwrap(),
            "aliyunfc/runtime-java8:1.5.6"
        );
        assert!(usage
            .0
            .lock()
            .unwrap()
            .contains(&"imageRepo/resolve/DefaultRegistry".to_string()));
    }

    #[tokio::test]
    async fn test_probe_runs_once() {
        let (resolver, probe, _) = make_resolver(Some(true));
        let first = resolver.resolve_image("nodejs8", Purpose::Invoke).await.unwrap();
        let second = resolver.resolve_image("nodejs8", Purpose::Invoke).await.unwrap();
        resolver.resolve_image("php7.2", Purpose::Build).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_probe_once() {
        let (resolver, probe, _) = make_resolver(Some(false));
        let resolver = Arc::new(resolver);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve_image("nodejs6", Purpose::Invoke).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "aliyunfc/runtime-nodejs6:1.5.6");
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_runtime() {
        let (resolver, probe, _) = make_resolver(Some(true));
        let err = resolver.resolve_image("cobol85", Purpose::Invoke).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid runtime name cobol85");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_extra_runtimes_from_config() {
        let mut config = RegistryConfig::default();
        config
            .extra_runtimes
            .insert("custom".to_string(), "custom-runtime".to_string());
        let resolver = ImageResolver::new(
            &config,
            Arc::new(CountingProbe {
                calls: AtomicUsize::new(0),
                result: Some(false),
            }),
            Arc::new(RecordingReporter::default()),
        );
        assert!(resolver.supports("custom"));
        assert_eq!(
            resolver.image_name("custom", Purpose::Invoke).unwrap(),
            "aliyunfc/runtime-custom-runtime:1.5.6"
        );
    }
}
