//! Per-function invocation lifecycle.
//!
//! ```text
//! UNINITIALIZED --init()--> READY
//! READY --invoke()--> INVOKING --(all invocations done)--> READY
//! READY/INVOKING --terminate()--> TERMINATED
//! ```
//!
//! Initialization prepares everything a container needs (staged code,
//! mounts, image, spec) and, for standing runners, starts the container.
//! A failed initialization keeps nothing around; the next request starts
//! over.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
        PoisonError,
        RwLock,
    },
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    code_stager::{CodeStager, StagedCode},
    container_spec::{runner_invoke_command, ContainerSpec, ContainerSpecBuilder, InvokeMode},
    descriptor::{DebugConfig, FunctionDescriptor, FunctionKey},
    driver::{ContainerEngine, ContainerHandle, ExecOutput},
    error::{Error, Result},
    image_resolver::{ImageResolver, Purpose},
    mounts::{MountRequest, MountResolver, MountSpec},
};

const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    Invoking,
    Terminated,
}

/// A simulated request delivered to a function.
#[derive(Debug, Clone)]
pub enum InvocationRequest {
    /// Trigger-style HTTP request.
    Http {
        method: String,
        path: String,
        query: Option<String>,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    /// Direct invocation with a raw event.
    Event { payload: Bytes },
}

impl InvocationRequest {
    fn is_http(&self) -> bool {
        matches!(self, InvocationRequest::Http { .. })
    }

    /// Bytes written to the function's stdin.
    fn into_stdin(self) -> Result<Bytes> {
        match self {
            InvocationRequest::Event { payload } => Ok(payload),
            InvocationRequest::Http {
                method,
                path,
                query,
                headers,
                body,
            } => {
                let envelope = HttpRequestEnvelope {
                    method,
                    path,
                    query: query.unwrap_or_default(),
                    headers: headers.into_iter().collect(),
                    body: BASE64.encode(&body),
                };
                serde_json::to_vec(&envelope)
                    .map(Bytes::from)
                    .map_err(|e| Error::engine("encode request", e.into()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl InvocationResponse {
    pub fn ok(body: Bytes) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpRequestEnvelope {
    method: String,
    path: String,
    query: String,
    headers: BTreeMap<String, String>,
    /// Base64.
    body: String,
}

#[derive(Debug, Deserialize)]
struct HttpReplyEnvelope {
    status: u16,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    /// Base64.
    #[serde(default)]
    body: String,
}

/// Turn runner output into a response. HTTP replies are expected as a JSON
/// envelope; anything else is passed through as a 200 body.
pub fn parse_reply(stdout: Bytes, http: bool) -> InvocationResponse {
    if http {
        if let Ok(envelope) = serde_json::from_slice::<HttpReplyEnvelope>(&stdout) {
            if let Ok(body) = BASE64.decode(envelope.body.as_bytes()) {
                return InvocationResponse {
                    status: envelope.status,
                    headers: envelope.headers.into_iter().collect(),
                    body: Bytes::from(body),
                };
            }
        }
    }
    InvocationResponse::ok(stdout)
}

fn failed_reply(output: ExecOutput) -> InvocationResponse {
    let body = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    InvocationResponse {
        status: 500,
        headers: vec![(
            "x-fc-error-type".to_string(),
            "UnhandledInvocationError".to_string(),
        )],
        body,
    }
}

/// Shared collaborators of every lifecycle.
pub struct LifecycleContext {
    pub engine: Arc<dyn ContainerEngine>,
    pub images: Arc<ImageResolver>,
    pub stager: CodeStager,
    pub mounts: MountResolver,
    /// Project directory storage mirrors are resolved against.
    pub base_dir: PathBuf,
    /// Added to a function's timeout before an invocation times out.
    pub grace: Duration,
}

struct Runner {
    spec: ContainerSpec,
    handle: ContainerHandle,
}

/// Everything `init()` produced.
struct Prepared {
    image: String,
    mounts: Vec<MountSpec>,
    user: Option<String>,
    staged: StagedCode,
    runner: Option<Runner>,
}

type ContainerSet = Arc<Mutex<HashMap<String, ContainerHandle>>>;

pub struct InvocationLifecycle {
    descriptor: Arc<FunctionDescriptor>,
    mode: InvokeMode,
    eager: bool,
    debug: Option<DebugConfig>,
    ctx: Arc<LifecycleContext>,
    init_lock: tokio::sync::Mutex<()>,
    prepared: RwLock<Option<Arc<Prepared>>>,
    terminated: AtomicBool,
    in_flight: AtomicUsize,
    /// Containers `prepared` doesn't own: interactive runs until they exit,
    /// runners until they have started.
    transient: ContainerSet,
    debug_lease: Arc<AtomicBool>,
    state_tx: broadcast::Sender<LifecycleState>,
}

/// Mode a function runs in: anything reachable over HTTP gets a standing
/// runner, direct-invoke-only functions get a container per call.
pub fn mode_for(descriptor: &FunctionDescriptor) -> InvokeMode {
    if descriptor.has_http_trigger() {
        InvokeMode::StandingRunner
    } else {
        InvokeMode::Interactive
    }
}

impl InvocationLifecycle {
    pub fn new(
        descriptor: Arc<FunctionDescriptor>,
        mode: InvokeMode,
        eager: bool,
        debug: Option<DebugConfig>,
        ctx: Arc<LifecycleContext>,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            descriptor,
            mode,
            eager,
            debug,
            ctx,
            init_lock: tokio::sync::Mutex::new(()),
            prepared: RwLock::new(None),
            terminated: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            transient: Arc::new(Mutex::new(HashMap::new())),
            debug_lease: Arc::new(AtomicBool::new(false)),
            state_tx,
        }
    }

    pub fn key(&self) -> FunctionKey {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn mode(&self) -> InvokeMode {
        self.mode
    }

    pub fn is_eager(&self) -> bool {
        self.eager
    }

    pub fn state(&self) -> LifecycleState {
        if self.terminated.load(Ordering::SeqCst) {
            return LifecycleState::Terminated;
        }
        if self.current().is_none() {
            return LifecycleState::Uninitialized;
        }
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            LifecycleState::Invoking
        } else {
            LifecycleState::Ready
        }
    }

    /// Receive every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Container spec of the standing runner, once started.
    pub fn runner_spec(&self) -> Option<ContainerSpec> {
        self.current()
            .and_then(|p| p.runner.as_ref().map(|r| r.spec.clone()))
    }

    /// Directory the code is mounted from, once initialized.
    pub fn code_dir(&self) -> Option<PathBuf> {
        self.current().map(|p| p.staged.path().to_path_buf())
    }

    fn publish(&self, state: LifecycleState) {
        // No receivers is fine.
        let _ = self.state_tx.send(state);
    }

    fn current(&self) -> Option<Arc<Prepared>> {
        self.prepared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn span(&self) -> tracing::Span {
        info_span!(
            "function",
            service = %self.descriptor.service,
            function = %self.descriptor.name
        )
    }

    fn ensure_live(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::LifecycleTerminated(self.key().to_string()));
        }
        Ok(())
    }

    pub async fn init(&self) -> Result<()> {
        self.prepared_or_init().await.map(|_| ())
    }

    async fn prepared_or_init(&self) -> Result<Arc<Prepared>> {
        self.ensure_live()?;
        if let Some(prepared) = self.current() {
            return Ok(prepared);
        }

        let _guard = self.init_lock.lock().await;
        self.ensure_live()?;
        if let Some(prepared) = self.current() {
            return Ok(prepared);
        }

        let prepared = Arc::new(self.prepare().instrument(self.span()).await?);
        *self
            .prepared
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(prepared.clone());
        self.publish(LifecycleState::Ready);
        Ok(prepared)
    }

    async fn prepare(&self) -> Result<Prepared> {
        let descriptor = &self.descriptor;
        info!(mode = ?self.mode, event = "function_init_started", "Initializing function");

        let flavor = self
            .ctx
            .engine
            .flavor()
            .await
            .map_err(|e| Error::engine("detect flavor", e))?;

        let staged = self.ctx.stager.stage(&descriptor.code_uri).await?;

        let resolved = self.ctx.mounts.resolve(&MountRequest {
            code_dir: staged.path(),
            code_read_only: false,
            nas_config: descriptor.nas_config.as_ref(),
            base_dir: &self.ctx.base_dir,
            engine_flavor: flavor,
        })?;

        let image = self
            .ctx
            .images
            .resolve_image(&descriptor.runtime, Purpose::Invoke)
            .await?;
        self.ensure_image(&image).await?;

        let builder = ContainerSpecBuilder::new(descriptor, self.mode, image.clone())
            .mounts(resolved.mounts.clone())
            .user(resolved.user.clone())
            .debug(self.debug);

        let runner = match self.mode {
            InvokeMode::StandingRunner => Some(self.start_runner(builder.build()?).await?),
            InvokeMode::Interactive => {
                // Surface spec errors (unsupported debug runtime) at init.
                builder.build()?;
                None
            }
        };

        info!(image = %image, event = "function_init_completed", "Function ready");
        Ok(Prepared {
            image,
            mounts: resolved.mounts,
            user: resolved.user,
            staged,
            runner,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let exists = self
            .ctx
            .engine
            .image_exists(image)
            .await
            .map_err(|e| Error::engine("inspect image", e))?;
        if exists {
            debug!(image = %image, "Image already exists locally");
            return Ok(());
        }
        self.ctx
            .engine
            .pull_image(image)
            .await
            .map_err(|e| Error::engine("pull image", e))
    }

    async fn start_runner(&self, spec: ContainerSpec) -> Result<Runner> {
        let engine = &self.ctx.engine;
        let handle = engine
            .create_container(&spec)
            .await
            .map_err(|e| Error::engine("create container", e))?;
        // Tracked until started so terminate() finds it even if this init
        // is dropped midway.
        self.track(&handle);
        let started = engine.start_container(&handle).await;
        self.untrack(&handle);
        if let Err(e) = started {
            if let Err(remove_err) = engine.remove_container(&handle).await {
                warn!(container = %handle.name, error = %remove_err, "Failed to remove container after failed start");
            }
            return Err(Error::engine("start container", e));
        }
        info!(container = %handle.name, event = "runner_started", "Standing runner started");
        Ok(Runner { spec, handle })
    }

    fn track(&self, handle: &ContainerHandle) {
        self.transient
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), handle.clone());
    }

    fn untrack(&self, handle: &ContainerHandle) {
        self.transient
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id);
    }

    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        let span = self.span();
        async move {
            let prepared = self.prepared_or_init().await?;
            let _in_flight = InFlight::enter(self);

            let timeout_secs = self.descriptor.timeout;
            let limit = Duration::from_secs(timeout_secs) + self.ctx.grace;
            let invocation = async move {
                match &prepared.runner {
                    Some(runner) => self.invoke_runner(runner, request).await,
                    None => self.invoke_interactive(&prepared, request).await,
                }
            };

            match tokio::time::timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs, event = "invoke_timeout", "Function timed out");
                    Err(Error::InvokeTimeout {
                        function: self.key().to_string(),
                        timeout_secs,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn invoke_runner(
        &self,
        runner: &Runner,
        request: InvocationRequest,
    ) -> Result<InvocationResponse> {
        let http = request.is_http();
        let cmd = runner_invoke_command(&self.descriptor.runtime, &self.descriptor.handler, http);
        let output = self
            .ctx
            .engine
            .exec_in_container(&runner.handle, cmd, Vec::new(), request.into_stdin()?)
            .await
            .map_err(|e| Error::engine("exec", e))?;
        log_function_output(&output);

        if !output.success() {
            return Ok(failed_reply(output));
        }
        Ok(parse_reply(output.stdout, http))
    }

    async fn invoke_interactive(
        &self,
        prepared: &Prepared,
        request: InvocationRequest,
    ) -> Result<InvocationResponse> {
        let http = request.is_http();
        let lease = self.debug.and_then(|debug| match DebugLease::acquire(&self.debug_lease) {
            Some(lease) => Some((debug, lease)),
            None => {
                let port = debug.port;
                warn!(
                    port,
                    "Debug port is held by another invocation, running without debugger"
                );
                None
            }
        });
        let (debug, lease) = lease.unzip();

        let spec = ContainerSpecBuilder::new(&self.descriptor, InvokeMode::Interactive, prepared.image.clone())
            .mounts(prepared.mounts.clone())
            .user(prepared.user.clone())
            .debug(debug)
            .build()?;

        let stdin = request.into_stdin()?;
        let engine = self.ctx.engine.clone();
        let handle = engine
            .create_container(&spec)
            .await
            .map_err(|e| Error::engine("create container", e))?;
        self.track(&handle);

        // Runs detached so a timed out invocation keeps its container
        // tracked until it exits on its own.
        let containers = self.transient.clone();
        let run = tokio::spawn(
            async move {
                let _lease = lease;
                let result = engine.run_attached(&handle, stdin).await;
                containers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&handle.id);
                result
            }
            .in_current_span(),
        );

        let output = run
            .await
            .map_err(|e| Error::engine("run container", e.into()))?
            .map_err(|e| Error::engine("run container", e))?;
        log_function_output(&output);

        if !output.success() {
            return Ok(failed_reply(output));
        }
        Ok(parse_reply(output.stdout, http))
    }

    /// Remove containers and staged code. Safe to call more than once.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let span = self.span();
        async {
            // Wait for an in-progress init so its container is cleaned up too.
            let _guard = self.init_lock.lock().await;
            let prepared = self
                .prepared
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();

            let transient: Vec<ContainerHandle> = self
                .transient
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .map(|(_, handle)| handle)
                .collect();
            for handle in transient {
                self.remove_quietly(&handle).await;
            }

            if let Some(prepared) = prepared {
                if let Some(runner) = &prepared.runner {
                    if let Err(e) = self.ctx.engine.stop_container(&runner.handle).await {
                        debug!(container = %runner.handle.name, error = %e, "Failed to stop runner");
                    }
                    self.remove_quietly(&runner.handle).await;
                }
                if let Err(e) = prepared.staged.cleanup() {
                    warn!(path = %prepared.staged.path().display(), error = %e, "Failed to remove staged code");
                }
            }

            info!(event = "function_terminated", "Function terminated");
        }
        .instrument(span)
        .await;
        self.publish(LifecycleState::Terminated);
    }

    async fn remove_quietly(&self, handle: &ContainerHandle) {
        if let Err(e) = self.ctx.engine.remove_container(handle).await {
            warn!(container = %handle.name, error = %e, "Failed to remove container");
        }
    }
}

fn log_function_output(output: &ExecOutput) {
    if !output.stderr.is_empty() {
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            info!(target: "function", "{line}");
        }
    }
    debug!(exit_code = ?output.exit_code, stdout_len = output.stdout.len(), "Invocation finished");
}

/// Tracks in-flight invocations and publishes Invoking/Ready edges.
struct InFlight<'a> {
    lifecycle: &'a InvocationLifecycle,
}

impl<'a> InFlight<'a> {
    fn enter(lifecycle: &'a InvocationLifecycle) -> Self {
        if lifecycle.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            lifecycle.publish(LifecycleState::Invoking);
        }
        Self { lifecycle }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let previous = self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !self.lifecycle.terminated.load(Ordering::SeqCst) {
            self.lifecycle.publish(LifecycleState::Ready);
        }
    }
}

/// Exclusive use of the debug port.
struct DebugLease(Arc<AtomicBool>);

impl DebugLease {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for DebugLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_envelope() {
        let stdout = serde_json::json!({
            "status": 201,
            "headers": {"content-type": "text/plain"},
            "body": BASE64.encode("created"),
        })
        .to_string();
        let response = parse_reply(Bytes::from(stdout), true);
        assert_eq!(response.status, 201);
        assert_eq!(
            response.headers,
            vec![("content-type".to_string(), "text/plain".to_string())]
        );
        assert_eq!(response.body, Bytes::from_static(b"created"));
    }

    #[test]
    fn test_parse_reply_passthrough() {
        let response = parse_reply(Bytes::from_static(b"hello world"), true);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hello world"));

        // Event replies are never unwrapped.
        let json = Bytes::from(r#"{"status":404,"body":""}"#);
        assert_eq!(parse_reply(json.clone(), false).body, json);
    }

    #[test]
    fn test_http_request_is_encoded_as_envelope() {
        let request = InvocationRequest::Http {
            method: "POST".to_string(),
            path: "/ping".to_string(),
            query: Some("a=1".to_string()),
            headers: vec![("x-test".to_string(), "1".to_string())],
            body: Bytes::from_static(b"hi"),
        };
        let stdin = request.into_stdin().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["path"], "/ping");
        assert_eq!(value["query"], "a=1");
        assert_eq!(value["headers"]["x-test"], "1");
        assert_eq!(value["body"], BASE64.encode("hi"));
    }

    #[test]
    fn test_debug_lease_is_exclusive() {
        let flag = Arc::new(AtomicBool::new(false));
        let lease = DebugLease::acquire(&flag).unwrap();
        assert!(DebugLease::acquire(&flag).is_none());
        drop(lease);
        assert!(DebugLease::acquire(&flag).is_some());
    }

    #[test]
    fn test_failed_reply_prefers_stdout() {
        let reply = failed_reply(ExecOutput {
            exit_code: Some(1),
            stdout: Bytes::new(),
            stderr: Bytes::from_static(b"Traceback"),
        });
        assert_eq!(reply.status, 500);
        assert_eq!(reply.body, Bytes::from_static(b"Traceback"));
    }
}
