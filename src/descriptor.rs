//! Function and trigger descriptors.
//!
//! These are produced by the template-loading collaborator and handed to
//! the emulator already parsed. The emulator only references them; it
//! never mutates a descriptor once loaded.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Local identity of a function: the `(service, function)` name pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub service: String,
    pub function: String,
}

impl FunctionKey {
    pub fn new(service: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.function)
    }
}

/// A single network storage mount point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    /// Storage server address, `host:/path`.
    pub server_addr: String,
    /// Directory inside the container.
    pub mount_dir: String,
}

/// Network storage configuration of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NasConfig {
    #[serde(default)]
    pub user_id: Option<u32>,
    #[serde(default)]
    pub group_id: Option<u32>,
    #[serde(default)]
    pub mount_points: Vec<MountPoint>,
}

/// Declarative description of one function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub service: String,
    pub name: String,
    pub runtime: String,
    /// Directory or archive holding the function code.
    pub code_uri: PathBuf,
    pub handler: String,
    /// Memory limit in MB. Advisory in local mode.
    #[serde(default = "default_memory_size")]
    pub memory_size: u64,
    /// Invocation timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub initializer: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub nas_config: Option<NasConfig>,
    #[serde(default)]
    pub triggers: Vec<TriggerDescriptor>,
}

fn default_memory_size() -> u64 {
    128
}

fn default_timeout() -> u64 {
    3
}

impl FunctionDescriptor {
    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(&self.service, &self.name)
    }

    pub fn http_triggers(&self) -> impl Iterator<Item = &TriggerDescriptor> {
        self.triggers
            .iter()
            .filter(|t| matches!(t, TriggerDescriptor::Http { .. }))
    }

    pub fn has_http_trigger(&self) -> bool {
        self.http_triggers().next().is_some()
    }

    pub fn has_direct_invoke_trigger(&self) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, TriggerDescriptor::DirectInvoke { .. }))
    }

    /// Union of the methods declared by all HTTP triggers.
    pub fn http_methods(&self) -> BTreeSet<HttpMethod> {
        self.http_triggers()
            .flat_map(|t| match t {
                TriggerDescriptor::Http { methods, .. } => methods.iter().copied().collect(),
                TriggerDescriptor::DirectInvoke { .. } => Vec::new(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Anonymous,
    Function,
}

/// A trigger bound to exactly one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDescriptor {
    Http {
        name: String,
        methods: BTreeSet<HttpMethod>,
        #[serde(default)]
        auth_type: AuthType,
    },
    DirectInvoke {
        #[serde(default)]
        name: Option<String>,
    },
}

/// IDE the debugger should be wired for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DebugIde {
    #[default]
    None,
    Vscode,
    Pycharm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugConfig {
    pub port: u16,
    pub ide: DebugIde,
}

/// Parsed function manifest, the hand-off format of the template loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub functions: Vec<FunctionDescriptor>,
    /// Directory relative code paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Manifest {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml_str(&content, base_dir)
    }

    pub fn from_yaml_str(content: &str, base_dir: PathBuf) -> Result<Self> {
        let mut manifest: Manifest =
            serde_yaml::from_str(content).context("Failed to parse function manifest")?;
        for function in &mut manifest.functions {
            if function.code_uri.is_relative() {
                function.code_uri = base_dir.join(&function.code_uri);
            }
        }
        manifest.base_dir = base_dir;
        Ok(manifest)
    }

    /// Find a function by `service/function` or a bare function name.
    ///
    /// A bare name picks the first service declaring that function.
    pub fn find(&self, invoke_name: &str) -> Option<&FunctionDescriptor> {
        let (service, function) = parse_invoke_name(invoke_name);
        self.functions.iter().find(|f| {
            f.name == function && service.is_none_or(|s| s == f.service)
        })
    }

    pub fn first(&self) -> Option<&FunctionDescriptor> {
        self.functions.first()
    }
}

/// Split `service/function` into its parts. A name without a slash only
/// names the function.
pub fn parse_invoke_name(invoke_name: &str) -> (Option<&str>, &str) {
    match invoke_name.split_once('/') {
        Some((service, function)) => (Some(service), function),
        None => (None, invoke_name),
    }
}
