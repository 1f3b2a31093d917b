//! Container launch specification.
//!
//! A [`ContainerSpec`] is everything the engine needs to create a function
//! container: image, mounts, environment, entrypoint and command, stdin
//! wiring and debug port. It is immutable once built; a lifecycle that
//! needs different settings builds a new one.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::{
    debug::{debug_options, log_ide_tips, DEBUG_OPTIONS_ENV},
    descriptor::{DebugConfig, FunctionDescriptor},
    driver::{FUNCTION_LABEL, MANAGED_LABEL, SERVICE_LABEL},
    env::build_function_env,
    error::Result,
    mounts::MountSpec,
};

/// How a function container is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvokeMode {
    /// One container per invocation, payload on an attached stdin.
    Interactive,
    /// One long-lived container per function; invocations are exec calls.
    StandingRunner,
}

/// Stdin/stdout attachment flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StdinWiring {
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl StdinWiring {
    pub fn interactive() -> Self {
        Self {
            open_stdin: true,
            stdin_once: true,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Ordered, unique keys.
    pub env: Vec<(String, String)>,
    /// Code mount first.
    pub mounts: Vec<MountSpec>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub mode: InvokeMode,
    pub stdin: StdinWiring,
    pub auto_remove: bool,
    /// Published on the same host port when set.
    pub debug_port: Option<u16>,
    pub user: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Runtime script driving the function inside the image.
pub fn mock_script(runtime: &str) -> String {
    format!("/var/fc/runtime/{runtime}/mock.sh")
}

/// Command run inside a standing runner for one invocation.
pub fn runner_invoke_command(runtime: &str, handler: &str, http: bool) -> Vec<String> {
    let mut cmd = vec![
        mock_script(runtime),
        "-h".to_string(),
        handler.to_string(),
        "--stdin".to_string(),
    ];
    if http {
        cmd.push("--http".to_string());
    }
    cmd
}

/// Name of a fresh interactive container.
pub fn interactive_container_name() -> String {
    format!("fun_local_{}", nanoid::nanoid!(12, &nanoid::alphabet::SAFE[2..]))
}

/// Name of a function's standing runner.
pub fn runner_container_name(descriptor: &FunctionDescriptor) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    };
    format!(
        "fc-local-{}-{}-{}",
        sanitize(&descriptor.service),
        sanitize(&descriptor.name),
        nanoid::nanoid!(6, &nanoid::alphabet::SAFE[2..])
    )
}

pub struct ContainerSpecBuilder<'a> {
    descriptor: &'a FunctionDescriptor,
    mode: InvokeMode,
    image: String,
    mounts: Vec<MountSpec>,
    debug: Option<DebugConfig>,
    name: Option<String>,
    user: Option<String>,
}

impl<'a> ContainerSpecBuilder<'a> {
    pub fn new(descriptor: &'a FunctionDescriptor, mode: InvokeMode, image: String) -> Self {
        Self {
            descriptor,
            mode,
            image,
            mounts: Vec::new(),
            debug: None,
            name: None,
            user: None,
        }
    }

    pub fn mounts(mut self, mounts: Vec<MountSpec>) -> Self {
        self.mounts = mounts;
        self
    }

    pub fn debug(mut self, debug: Option<DebugConfig>) -> Self {
        self.debug = debug;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn build(self) -> Result<ContainerSpec> {
        let descriptor = self.descriptor;
        let mut env = build_function_env(descriptor);

        let mut entrypoint = match self.mode {
            InvokeMode::StandingRunner => Some(vec![mock_script(&descriptor.runtime)]),
            InvokeMode::Interactive => None,
        };

        if let Some(debug) = &self.debug {
            env.set(DEBUG_OPTIONS_ENV, debug_options(&descriptor.runtime, debug.port)?);
            entrypoint = Some(vec![mock_script(&descriptor.runtime)]);
            log_ide_tips(descriptor, debug);
        }

        let (cmd, stdin, auto_remove) = match self.mode {
            InvokeMode::Interactive => (
                vec![
                    "-h".to_string(),
                    descriptor.handler.clone(),
                    "--stdin".to_string(),
                ],
                StdinWiring::interactive(),
                true,
            ),
            InvokeMode::StandingRunner => {
                (vec!["--server".to_string()], StdinWiring::detached(), false)
            }
        };

        let name = match (self.name, self.mode) {
            (Some(name), _) => name,
            (None, InvokeMode::Interactive) => interactive_container_name(),
            (None, InvokeMode::StandingRunner) => runner_container_name(descriptor),
        };

        let labels = BTreeMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (SERVICE_LABEL.to_string(), descriptor.service.clone()),
            (FUNCTION_LABEL.to_string(), descriptor.name.clone()),
        ]);

        let spec = ContainerSpec {
            name,
            image: self.image,
            env: env.into_vec(),
            mounts: self.mounts,
            entrypoint,
            cmd,
            mode: self.mode,
            stdin,
            auto_remove,
            debug_port: self.debug.map(|d| d.port),
            user: self.user,
            labels,
        };
        debug!(
            container = %spec.name,
            image = %spec.image,
            mode = ?spec.mode,
            "Built container spec"
        );
        Ok(spec)
    }
}
