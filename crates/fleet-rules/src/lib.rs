//! Admission rules for Fleet CI.
//!
//! Rules decide whether a candidate node should be created at all. They are
//! compiled once from configuration into a small AST ([`Rule`]) and evaluated
//! against anything implementing [`RuleSubject`], with an optional parent
//! subject used as a fallback for fields the candidate does not carry yet.

pub mod engine;
pub mod error;
pub mod rule;
pub mod subject;
pub mod version;

pub use engine::{Admission, Rejection, admit};
pub use error::RuleError;
pub use rule::{AdmissionRules, ComboRule, Rule, TreeBranch, ValueFilter};
pub use subject::{FieldValue, RuleSubject};
pub use version::KernelVersion;
