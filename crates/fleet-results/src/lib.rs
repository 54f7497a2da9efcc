//! Result hierarchy builders for Fleet CI.
//!
//! Backends report results in their own shapes. The parsers here turn those
//! payloads into a [`ResultHierarchy`], which is aggregated bottom-up before
//! being applied to the node tree.

pub mod aggregate;
pub mod hierarchy;
pub mod lava;
pub mod pull_labs;

pub use aggregate::{aggregate, finalize};
pub use hierarchy::{ResultHierarchy, ResultNode};
pub use lava::{LavaHealth, LavaJobResults};
pub use pull_labs::{CallbackPayload, decode_log};
