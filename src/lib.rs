//! Local invocation emulator for function workloads.
//!
//! Functions described by a [`descriptor::Manifest`] are run in containers
//! on the local machine, either by direct invocation or through HTTP
//! trigger routes served by [`service::Service`].

pub mod code_stager;
pub mod config;
pub mod container_spec;
pub mod debug;
pub mod descriptor;
pub mod driver;
pub mod env;
pub mod error;
pub mod image_resolver;
pub mod lifecycle;
pub mod mounts;
pub mod registry;
pub mod router;
pub mod service;
pub mod tracing;
pub mod usage;

pub use error::{Error, Result};
