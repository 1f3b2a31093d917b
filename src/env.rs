//! Container environment assembly.
//!
//! Path-like variables are kept as typed segment lists and joined once, so
//! default segments are added in a fixed order without string surgery on
//! caller-supplied values.

use std::collections::BTreeMap;

use crate::descriptor::{FunctionDescriptor, NasConfig};

/// Prefix packages installed into the code directory live under.
const INSTALL_ROOT: &str = "/code/.fun/root";
const PYTHON_USER_BASE: &str = "/code/.fun/python";

const SYSTEM_BIN_DIRS: [&str; 6] = [
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/bin",
    "/usr/sbin",
    "/sbin",
    "/bin",
];

const PYTHON_SITE_PACKAGES: [&str; 2] = [
    "/python/lib/python2.7/site-packages",
    "/python/lib/python3.6/site-packages",
];

/// Ordered list of `:`-separated path segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathList(Vec<String>);

impl PathList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an existing `a:b:c` value. Empty segments are dropped.
    pub fn parse(value: &str) -> Self {
        Self(
            value
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn push(&mut self, segment: impl Into<String>) -> &mut Self {
        self.0.push(segment.into());
        self
    }

    pub fn extend<I, S>(&mut self, segments: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(segments.into_iter().map(Into::into));
        self
    }

    /// Append every segment of `other` after the current ones.
    pub fn append(&mut self, other: PathList) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn join(&self) -> String {
        self.0.join(":")
    }
}

fn default_library_path() -> PathList {
    let mut list = PathList::new();
    list.push(format!("{INSTALL_ROOT}/usr/lib"))
        .push(format!("{INSTALL_ROOT}/usr/lib/x86_64-linux-gnu"))
        .extend(["/code", "/code/lib", "/usr/local/lib"]);
    list
}

fn default_path() -> PathList {
    let mut list = PathList::new();
    list.extend(SYSTEM_BIN_DIRS.iter().map(|dir| format!("{INSTALL_ROOT}{dir}")))
        .push(format!("{PYTHON_USER_BASE}/bin"))
        .extend(SYSTEM_BIN_DIRS);
    list
}

/// Ordered environment with unique keys. Later `set` calls replace the
/// value but keep the original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(Vec<(String, String)>);

impl EnvVars {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn set_if_absent(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }
}

impl From<&BTreeMap<String, String>> for EnvVars {
    fn from(map: &BTreeMap<String, String>) -> Self {
        Self(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

/// Build the container environment for a function.
///
/// Tool defaults come first in `LD_LIBRARY_PATH` and `PATH`, followed by
/// the caller's own segments, followed by storage mount segments.
pub fn build_function_env(descriptor: &FunctionDescriptor) -> EnvVars {
    let mut env = EnvVars::from(&descriptor.environment_variables);

    let mut library_path = default_library_path();
    let mut path = default_path();
    let mut python_path = PathList::new();

    if let Some(existing) = env.get("LD_LIBRARY_PATH") {
        library_path.append(PathList::parse(existing));
    }
    if let Some(existing) = env.get("PATH") {
        path.append(PathList::parse(existing));
    }
    if let Some(existing) = env.get("PYTHONPATH") {
        python_path.append(PathList::parse(existing));
    }

    if let Some(nas_config) = &descriptor.nas_config {
        add_nas_segments(nas_config, &mut path, &mut library_path, &mut python_path);
    }

    env.set("LD_LIBRARY_PATH", library_path.join());
    env.set("PATH", path.join());
    if !python_path.is_empty() {
        env.set("PYTHONPATH", python_path.join());
    }
    env.set_if_absent("PYTHONUSERBASE", PYTHON_USER_BASE);

    env.set("FC_HANDLER", &descriptor.handler);
    env.set("FC_TIMEOUT", descriptor.timeout.to_string());
    env.set("FC_MEMORY_SIZE", descriptor.memory_size.to_string());
    env.set("FC_SERVICE_NAME", &descriptor.service);
    env.set("FC_FUNCTION_NAME", &descriptor.name);
    if let Some(initializer) = &descriptor.initializer {
        env.set("FC_INITIALIZER", initializer);
    }

    env
}

fn add_nas_segments(
    nas_config: &NasConfig,
    path: &mut PathList,
    library_path: &mut PathList,
    python_path: &mut PathList,
) {
    for mount_point in &nas_config.mount_points {
        let prefix = mount_point.mount_dir.trim_end_matches('/');
        path.extend(SYSTEM_BIN_DIRS.iter().map(|dir| format!("{prefix}{dir}")));
        library_path
            .push(format!("{prefix}/usr/lib"))
            .push(format!("{prefix}/usr/lib/x86_64-linux-gnu"));
        python_path.extend(PYTHON_SITE_PACKAGES.iter().map(|p| format!("{prefix}{p}")));
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::descriptor::MountPoint;

    fn descriptor() -> FunctionDescriptor {
        FunctionDescriptor {
            service: "demo".to_string(),
            name: "hello".to_string(),
            runtime: "python3".to_string(),
            code_uri: PathBuf::from("/code"),
            handler: "index.handler".to_string(),
            memory_size: 256,
            timeout: 10,
            initializer: None,
            environment_variables: BTreeMap::new(),
            nas_config: None,
            triggers: Vec::new(),
        }
    }

    #[test]
    fn test_path_list_parse_and_join() {
        let list = PathList::parse("/a::/b:");
        assert_eq!(list.segments(), ["/a", "/b"]);
        assert_eq!(list.join(), "/a:/b");
        assert!(PathList::parse("").is_empty());
    }

    #[test]
    fn test_defaults_without_caller_values() {
        let env = build_function_env(&descriptor());
        assert_eq!(
            env.get("LD_LIBRARY_PATH"),
            Some(
                "/code/.fun/root/usr/lib:/code/.fun/root/usr/lib/x86_64-linux-gnu:/code:/code/lib:/usr/local/lib"
            )
        );
        let path = env.get("PATH").unwrap();
        assert!(path.starts_with("/code/.fun/root/usr/local/bin:"));
        assert!(path.ends_with(":/sbin:/bin"));
        assert_eq!(env.get("PYTHONUSERBASE"), Some("/code/.fun/python"));
        assert!(env.get("PYTHONPATH").is_none());
        assert_eq!(env.get("FC_HANDLER"), Some("index.handler"));
        assert_eq!(env.get("FC_TIMEOUT"), Some("10"));
        assert_eq!(env.get("FC_MEMORY_SIZE"), Some("256"));
        assert!(env.get("FC_INITIALIZER").is_none());
    }

    #[test]
    fn test_caller_values_follow_defaults() {
        let mut d = descriptor();
        d.environment_variables
            .insert("LD_LIBRARY_PATH".to_string(), "/opt/lib".to_string());
        d.environment_variables
            .insert("PYTHONUSERBASE".to_string(), "/custom".to_string());
        d.environment_variables
            .insert("FOO".to_string(), "bar".to_string());
        d.initializer = Some("index.init".to_string());

        let env = build_function_env(&d);
        let lib = env.get("LD_LIBRARY_PATH").unwrap();
        assert!(lib.starts_with("/code/.fun/root/usr/lib:"));
        assert!(lib.ends_with(":/opt/lib"));
        assert_eq!(env.get("PYTHONUSERBASE"), Some("/custom"));
        assert_eq!(env.get("FOO"), Some("bar"));
        assert_eq!(env.get("FC_INITIALIZER"), Some("index.init"));
    }

    #[test]
    fn test_nas_segments_are_appended() {
        let mut d = descriptor();
        d.nas_config = Some(NasConfig {
            user_id: None,
            group_id: None,
            mount_points: vec![MountPoint {
                server_addr: "nas.local:/share".to_string(),
                mount_dir: "/mnt/auto".to_string(),
            }],
        });

        let env = build_function_env(&d);
        assert!(env.get("PATH").unwrap().ends_with(":/mnt/auto/sbin:/mnt/auto/bin"));
        assert!(
            env.get("LD_LIBRARY_PATH")
                .unwrap()
                .ends_with(":/mnt/auto/usr/lib:/mnt/auto/usr/lib/x86_64-linux-gnu")
        );
        assert_eq!(
            env.get("PYTHONPATH"),
            Some(
                "/mnt/auto/python/lib/python2.7/site-packages:/mnt/auto/python/lib/python3.6/site-packages"
            )
        );
    }

    #[test]
    fn test_env_keys_unique() {
        let mut d = descriptor();
        d.environment_variables
            .insert("PATH".to_string(), "/x".to_string());
        let env = build_function_env(&d).into_vec();
        let path_count = env.iter().filter(|(k, _)| k == "PATH").count();
        assert_eq!(path_count, 1);
    }
}
