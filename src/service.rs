use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use crate::{
    code_stager::CodeStager,
    config::LocalConfig,
    container_spec::InvokeMode,
    descriptor::{DebugConfig, FunctionKey, HttpMethod, Manifest, TriggerDescriptor},
    driver::{ContainerEngine, MANAGED_LABEL},
    image_resolver::ImageResolver,
    lifecycle::{InvocationLifecycle, InvocationRequest, InvocationResponse, LifecycleContext},
    mounts::MountResolver,
    registry::LifecycleRegistry,
    router::{create_routes, invocation_path, proxy_base_path},
    usage::{reporter_for, UsageReporter},
};

/// Options of `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Initialize every function at startup instead of on first request.
    pub eager: bool,
    pub debug: Option<DebugConfig>,
    /// Function the debugger is attached to, `[service/]function`.
    pub debug_function: Option<String>,
}

/// Build the collaborators shared by all lifecycles.
pub fn build_context(
    config: &LocalConfig,
    manifest: &Manifest,
    engine: Arc<dyn ContainerEngine>,
    images: Arc<ImageResolver>,
) -> Arc<LifecycleContext> {
    Arc::new(LifecycleContext {
        engine,
        images,
        stager: CodeStager::new(config.staging.tmp_root()),
        mounts: MountResolver::new(),
        base_dir: manifest.base_dir.clone(),
        grace: Duration::from_secs(config.invoke.grace_secs),
    })
}

pub fn default_image_resolver(config: &LocalConfig) -> Arc<ImageResolver> {
    let usage: Arc<dyn UsageReporter> = reporter_for(config.usage.endpoint.as_deref());
    Arc::new(ImageResolver::from_config(&config.registry, usage))
}

/// Pick the function a debugger is wired into.
fn debug_target(manifest: &Manifest, options: &StartOptions) -> Result<Option<FunctionKey>> {
    if options.debug.is_none() {
        return Ok(None);
    }
    let descriptor = match &options.debug_function {
        Some(name) => manifest
            .find(name)
            .ok_or_else(|| anyhow::anyhow!("debug function {name} not found in manifest"))?,
        None if manifest.functions.len() == 1 => manifest
            .first()
            .ok_or_else(|| anyhow::anyhow!("manifest declares no functions"))?,
        None => anyhow::bail!(
            "--debug-function is required when the manifest declares more than one function"
        ),
    };
    Ok(Some(descriptor.key()))
}

pub struct Service {
    config: LocalConfig,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<LifecycleRegistry>,
}

impl Service {
    pub fn new(
        config: LocalConfig,
        manifest: Manifest,
        engine: Arc<dyn ContainerEngine>,
        images: Arc<ImageResolver>,
        options: StartOptions,
    ) -> Result<Self> {
        let debug_key = debug_target(&manifest, &options)?;
        let ctx = build_context(&config, &manifest, engine.clone(), images.clone());
        let registry = Arc::new(LifecycleRegistry::new(ctx));

        for descriptor in &manifest.functions {
            if !images.supports(&descriptor.runtime) {
                warn!(
                    function = %descriptor.key(),
                    runtime = %descriptor.runtime,
                    "Runtime has no known image, invocations will fail"
                );
            }
            let debug = options
                .debug
                .filter(|_| debug_key.as_ref() == Some(&descriptor.key()));
            registry.get_or_create(Arc::new(descriptor.clone()), options.eager, debug);
        }

        Ok(Self {
            config,
            engine,
            registry,
        })
    }

    pub fn registry(&self) -> Arc<LifecycleRegistry> {
        self.registry.clone()
    }

    /// Remove containers a previous run left behind.
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let label = format!("{MANAGED_LABEL}=true");
        let orphans = self
            .engine
            .list_containers(&label)
            .await
            .context("Failed to list leftover containers")?;
        for handle in &orphans {
            if let Err(e) = self.engine.remove_container(handle).await {
                warn!(container = %handle.name, error = %e, "Failed to remove leftover container");
            }
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "Removed leftover containers");
        }
        Ok(orphans.len())
    }

    /// Serve until a shutdown signal. Every function is terminated before
    /// this returns, whether serving ended normally or failed.
    pub async fn start(self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let signals = tokio::spawn(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        });

        let served = self.serve(stop_rx).await;
        signals.abort();
        self.registry.terminate_all().await;
        served
    }

    async fn serve(&self, stop_rx: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        if self.config.cleanup_orphans {
            if let Err(e) = self.cleanup_orphans().await {
                warn!(error = %e, "Skipping leftover container cleanup");
            }
        }

        tokio::select! {
            _ = self.registry.init_eager() => {}
            _ = stopped(stop_rx.clone()) => {
                info!("Shutdown requested during startup");
                return Ok(());
            }
        }

        self.log_routes(addr);
        info!("local function server listening on {}", addr);

        let routes = create_routes(self.registry.clone(), &self.config.api_version);
        axum::serve(listener, routes)
            .with_graceful_shutdown(stopped(stop_rx))
            .await
            .context("HTTP server failed")
    }

    fn log_routes(&self, addr: SocketAddr) {
        if self.registry.is_empty() {
            warn!("Manifest declares no functions");
            return;
        }
        let api_version = &self.config.api_version;
        for key in self.registry.keys() {
            let Some(lifecycle) = self.registry.get(&key) else {
                continue;
            };
            let descriptor = lifecycle.descriptor();
            for trigger in &descriptor.triggers {
                match trigger {
                    TriggerDescriptor::Http {
                        name,
                        methods,
                        auth_type,
                    } => {
                        let methods: Vec<&str> = methods.iter().map(HttpMethod::as_str).collect();
                        info!(
                            trigger = %name,
                            methods = %methods.join(","),
                            auth_type = ?auth_type,
                            url = %format!("http://{}{}/", addr, proxy_base_path(api_version, &key)),
                            "HTTP trigger ready"
                        );
                    }
                    TriggerDescriptor::DirectInvoke { .. } => {
                        info!(
                            url = %format!("http://{}{}", addr, invocation_path(api_version, &key)),
                            "Direct invocation ready"
                        );
                    }
                }
            }
        }
        info!(count = self.registry.len(), "Functions registered");
    }
}

async fn stopped(mut stop_rx: watch::Receiver<bool>) {
    // A dropped sender also ends serving.
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

/// Run a single direct invocation in a fresh container and tear it down.
pub async fn invoke_once(
    config: &LocalConfig,
    manifest: &Manifest,
    engine: Arc<dyn ContainerEngine>,
    images: Arc<ImageResolver>,
    invoke_name: &str,
    payload: Bytes,
    debug: Option<DebugConfig>,
) -> crate::error::Result<InvocationResponse> {
    let descriptor = manifest
        .find(invoke_name)
        .ok_or_else(|| crate::error::Error::FunctionNotFound(invoke_name.to_string()))?;
    let ctx = build_context(config, manifest, engine, images);
    let lifecycle = InvocationLifecycle::new(
        Arc::new(descriptor.clone()),
        InvokeMode::Interactive,
        false,
        debug,
        ctx,
    );

    let result = tokio::select! {
        result = lifecycle.invoke(InvocationRequest::Event { payload }) => result,
        _ = shutdown_signal() => Err(crate::error::Error::LifecycleTerminated(descriptor.key().to_string())),
    };
    lifecycle.terminate().await;
    result
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    info!("signal received, shutting down gracefully");
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::descriptor::DebugIde;

    const TWO_FUNCTIONS: &str = r#"
functions:
  - service: demo
    name: a
    runtime: nodejs8
    code_uri: ./a
    handler: index.handler
  - service: demo
    name: b
    runtime: nodejs8
    code_uri: ./b
    handler: index.handler
"#;

    fn debug_options(function: Option<&str>) -> StartOptions {
        StartOptions {
            eager: false,
            debug: Some(DebugConfig {
                port: 9229,
                ide: DebugIde::None,
            }),
            debug_function: function.map(str::to_string),
        }
    }

    #[test]
    fn test_debug_target_selection() {
        let manifest = Manifest::from_yaml_str(TWO_FUNCTIONS, PathBuf::from("/p")).unwrap();
        assert!(debug_target(&manifest, &StartOptions::default())
            .unwrap()
            .is_none());
        assert!(debug_target(&manifest, &debug_options(None)).is_err());
        assert_eq!(
            debug_target(&manifest, &debug_options(Some("demo/b"))).unwrap(),
            Some(FunctionKey::new("demo", "b"))
        );
        assert!(debug_target(&manifest, &debug_options(Some("missing"))).is_err());
    }
}
