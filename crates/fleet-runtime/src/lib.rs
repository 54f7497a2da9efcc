//! Runtime backends for Fleet CI.
//!
//! A runtime turns a job template into a backend-specific job definition,
//! submits it and reports completion. Backends follow one of two protocols:
//! submit-and-wait (LAVA, Docker, local shell) or submit-and-forget
//! (pull labs, which report back through a callback).

pub mod docker;
pub mod factory;
pub mod lava;
pub mod params;
pub mod priority;
pub mod pull_labs;
pub mod runtime;
pub mod shell;

pub use docker::DockerRuntime;
pub use factory::RuntimeFactory;
pub use lava::LavaRuntime;
pub use params::JobParams;
pub use priority::resolve_priority;
pub use pull_labs::PullLabsRuntime;
pub use runtime::{
    DefinitionFormat, JobDefinition, JobHandle, Protocol, Runtime, WaitStatus, wait_with_timeout,
};
pub use shell::ShellRuntime;
