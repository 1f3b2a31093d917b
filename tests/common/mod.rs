//! Shared fixtures: an in-memory container engine and a fixed-answer
//! registry probe.

#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use fc_local::{
    code_stager::CodeStager,
    config::RegistryConfig,
    container_spec::ContainerSpec,
    descriptor::Manifest,
    driver::{ContainerEngine, ContainerHandle, EngineFlavor, ExecOutput},
    image_resolver::{ImageResolver, ReachabilityProbe},
    lifecycle::LifecycleContext,
    mounts::MountResolver,
    usage::TracingUsageReporter,
};

/// Records every call and answers with canned outputs.
#[derive(Default)]
pub struct FakeEngine {
    pub flavor: Mutex<EngineFlavor>,
    pub image_present: AtomicBool,
    /// Number of upcoming pulls that fail.
    pub failing_pulls: AtomicUsize,
    pub exec_output: Mutex<ExecOutput>,
    pub run_output: Mutex<ExecOutput>,
    /// Delay applied to exec and attached runs.
    pub delay: Mutex<Option<Duration>>,
    /// Delay applied to starting a container.
    pub start_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub removed: Mutex<Vec<ContainerHandle>>,
    pub stdin_seen: Mutex<Vec<Bytes>>,
    pub leftovers: Mutex<Vec<ContainerHandle>>,
    counter: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let engine = Self::default();
        engine.image_present.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    pub fn with_stdout(stdout: &'static [u8]) -> Arc<Self> {
        let engine = Self::new();
        let output = ExecOutput {
            exit_code: Some(0),
            stdout: Bytes::from_static(stdout),
            stderr: Bytes::new(),
        };
        *engine.exec_output.lock().unwrap() = output.clone();
        *engine.run_output.lock().unwrap() = output;
        engine
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<ContainerHandle> {
        self.removed.lock().unwrap().clone()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_string());
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn maybe_start_delay(&self) {
        let delay = *self.start_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn flavor(&self) -> Result<EngineFlavor> {
        self.record("flavor");
        Ok(*self.flavor.lock().unwrap())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        self.record("image_exists");
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record("pull_image");
        let failing = self.failing_pulls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pulls.store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("pull access denied for {image}");
        }
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        self.record("create_container");
        self.created.lock().unwrap().push(spec.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ContainerHandle {
            id: format!("container-{n}"),
            name: spec.name.clone(),
        })
    }

    async fn start_container(&self, _handle: &ContainerHandle) -> Result<()> {
        self.record("start_container");
        self.maybe_start_delay().await;
        Ok(())
    }

    async fn run_attached(&self, _handle: &ContainerHandle, stdin: Bytes) -> Result<ExecOutput> {
        self.record("run_attached");
        self.stdin_seen.lock().unwrap().push(stdin);
        self.maybe_delay().await;
        Ok(self.run_output.lock().unwrap().clone())
    }

    async fn exec_in_container(
        &self,
        _handle: &ContainerHandle,
        _cmd: Vec<String>,
        _env: Vec<(String, String)>,
        stdin: Bytes,
    ) -> Result<ExecOutput> {
        self.record("exec_in_container");
        self.stdin_seen.lock().unwrap().push(stdin);
        self.maybe_delay().await;
        Ok(self.exec_output.lock().unwrap().clone())
    }

    async fn stop_container(&self, _handle: &ContainerHandle) -> Result<()> {
        self.record("stop_container");
        Ok(())
    }

    async fn remove_container(&self, handle: &ContainerHandle) -> Result<()> {
        self.record("remove_container");
        self.removed.lock().unwrap().push(handle.clone());
        Ok(())
    }

    async fn list_containers(&self, _label: &str) -> Result<Vec<ContainerHandle>> {
        self.record("list_containers");
        Ok(self.leftovers.lock().unwrap().clone())
    }
}

/// Answers every probe the same way and counts calls.
pub struct FixedProbe {
    pub reachable: bool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ReachabilityProbe for FixedProbe {
    async fn is_reachable(&self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable)
    }
}

pub fn image_resolver(reachable: bool) -> Arc<ImageResolver> {
    let probe = Arc::new(FixedProbe {
        reachable,
        calls: AtomicUsize::new(0),
    });
    Arc::new(ImageResolver::new(
        &RegistryConfig::default(),
        probe,
        Arc::new(TracingUsageReporter),
    ))
}

pub fn context(
    engine: Arc<FakeEngine>,
    base_dir: &Path,
    grace: Duration,
) -> Arc<LifecycleContext> {
    Arc::new(LifecycleContext {
        engine,
        images: image_resolver(false),
        stager: CodeStager::new(base_dir.join("staging")),
        mounts: MountResolver::new(),
        base_dir: base_dir.to_path_buf(),
        grace,
    })
}

/// Manifest with `serviceA/funcB` behind an HTTP trigger and
/// `serviceA/worker` reachable by direct invocation only.
pub fn manifest(base_dir: &Path) -> Manifest {
    std::fs::create_dir_all(base_dir.join("code")).unwrap();
    let yaml = r#"
functions:
  - service: serviceA
    name: funcB
    runtime: nodejs8
    code_uri: ./code
    handler: index.handler
    triggers:
      - type: http
        name: web
        methods: [GET, POST]
  - service: serviceA
    name: worker
    runtime: python3
    code_uri: ./code
    handler: main.handler
    timeout: 1
    triggers:
      - type: direct_invoke
"#;
    Manifest::from_yaml_str(yaml, base_dir.to_path_buf()).unwrap()
}
