//! Storage mount resolution.
//!
//! Turns a function's code location and network storage configuration into
//! concrete host/container path pairs. When the container engine runs
//! inside a compatibility VM, host paths are translated to the VM's view of
//! the host filesystem.

use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    descriptor::{MountPoint, NasConfig},
    driver::EngineFlavor,
    error::{Error, Result},
};

/// Container directory the function code is mounted at.
pub const CODE_MOUNT_TARGET: &str = "/code";

/// Local directory (relative to the project) mirroring network storage.
const LOCAL_NAS_DIR: &str = ".fun/nas";

static SERVER_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z0-9][a-z0-9.-]*):(/[^:]*)$").expect("valid regex"));

/// A bind mount handed to the container engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSpec {
    pub host_source: String,
    pub container_target: String,
    pub read_only: bool,
}

/// Parsed network storage address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub path: String,
}

/// Parse a `host:/path` storage address.
pub fn parse_server_addr(addr: &str) -> Result<ServerAddr> {
    let captures = SERVER_ADDR_RE.captures(addr).ok_or_else(|| {
        Error::mount(
            addr,
            "storage server address doesn't match expected format 'host:/path'",
        )
    })?;
    Ok(ServerAddr {
        host: captures[1].to_string(),
        path: captures[2].to_string(),
    })
}

/// Input of a single resolution.
pub struct MountRequest<'a> {
    /// Effective code directory (already staged if it was an archive).
    pub code_dir: &'a Path,
    /// Mount the code read-only.
    pub code_read_only: bool,
    pub nas_config: Option<&'a NasConfig>,
    /// Project directory the local storage mirror lives under.
    pub base_dir: &'a Path,
    pub engine_flavor: EngineFlavor,
}

/// Output of a resolution: the ordered mounts and the container user.
#[derive(Debug, Clone)]
pub struct ResolvedMounts {
    /// Code mount first, then one mount per storage mount point.
    pub mounts: Vec<MountSpec>,
    pub user: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MountResolver;

impl MountResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(&self, request: &MountRequest<'_>) -> Result<ResolvedMounts> {
        let mut mounts = Vec::new();
        mounts.push(MountSpec {
            host_source: existing_host_path(request.code_dir)?,
            container_target: CODE_MOUNT_TARGET.to_string(),
            read_only: request.code_read_only,
        });

        if let Some(nas_config) = request.nas_config {
            for mount_point in &nas_config.mount_points {
                mounts.push(resolve_mount_point(request.base_dir, mount_point)?);
            }
        }

        if request.engine_flavor == EngineFlavor::CompatibilityVm {
            warn!(
                "Detected a VM-hosted container engine (docker toolbox); host paths are \
                 translated for the VM. Consider upgrading to a native engine."
            );
            mounts = mounts
                .into_iter()
                .map(|m| MountSpec {
                    host_source: translate_path_for_vm(&m.host_source),
                    ..m
                })
                .collect();
        }

        debug!(mounts = ?mounts, "Resolved container mounts");

        Ok(ResolvedMounts {
            mounts,
            user: request.nas_config.and_then(resolve_container_user),
        })
    }
}

/// Host directory mirroring a storage mount point locally.
pub fn local_nas_dir(base_dir: &Path, server_addr: &ServerAddr) -> PathBuf {
    base_dir
        .join(LOCAL_NAS_DIR)
        .join(&server_addr.host)
        .join(server_addr.path.trim_start_matches('/'))
}

fn resolve_mount_point(base_dir: &Path, mount_point: &MountPoint) -> Result<MountSpec> {
    let server_addr = parse_server_addr(&mount_point.server_addr)?;
    if !mount_point.mount_dir.starts_with('/') {
        return Err(Error::mount(
            &mount_point.mount_dir,
            "mount directory must be an absolute container path",
        ));
    }
    let local_dir = local_nas_dir(base_dir, &server_addr);
    Ok(MountSpec {
        host_source: existing_host_path(&local_dir)?,
        container_target: mount_point.mount_dir.clone(),
        read_only: false,
    })
}

fn existing_host_path(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(Error::mount(
            path.display().to_string(),
            "host path does not exist",
        ));
    }
    Ok(path.to_string_lossy().into_owned())
}

fn resolve_container_user(nas_config: &NasConfig) -> Option<String> {
    match (nas_config.user_id, nas_config.group_id) {
        (Some(uid), Some(gid)) => Some(format!("{uid}:{gid}")),
        (Some(uid), None) => Some(uid.to_string()),
        _ => None,
    }
}

/// Translate a host path to the compatibility VM's view of the host.
///
/// `C:\Users\dev\code` becomes `/c/Users/dev/code`.
pub fn translate_path_for_vm(source: &str) -> String {
    let without_drive: String = source.split(':').collect();
    let forward = without_drive.replace('\\', "/");
    let trimmed = forward.trim_start_matches('/');
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => format!("/{}{}", first.to_lowercase(), chars.as_str()),
        None => "/".to_string(),
    }
}
