//! Rule evaluation.

use crate::rule::{AdmissionRules, BRANCH_KEY, ComboRule, Rule, TREE_KEY, ValueFilter};
use crate::subject::{FieldValue, RuleSubject};
use crate::version::KernelVersion;
use std::fmt;
use tracing::trace;

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected(Rejection),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Admission::Allowed => None,
            Admission::Rejected(r) => Some(r),
        }
    }
}

/// Why a candidate was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Rule key that failed.
    pub rule: String,
    pub reason: String,
}

impl Rejection {
    fn new(rule: &str, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rule: {}", self.rule, self.reason)
    }
}

/// Check optional rules; absent rules always admit.
pub fn admit(
    rules: Option<&AdmissionRules>,
    candidate: &dyn RuleSubject,
    parent: Option<&dyn RuleSubject>,
) -> Admission {
    match rules {
        Some(rules) => rules.admit(candidate, parent),
        None => Admission::Allowed,
    }
}

/// Candidate lookup falling back to the parent.
struct Lookup<'a> {
    candidate: &'a dyn RuleSubject,
    parent: Option<&'a dyn RuleSubject>,
}

impl Lookup<'_> {
    fn field(&self, key: &str) -> Option<FieldValue> {
        self.candidate
            .field(key)
            .or_else(|| self.parent.and_then(|p| p.field(key)))
    }

    fn kernel_version(&self) -> Option<KernelVersion> {
        self.candidate
            .kernel_version()
            .or_else(|| self.parent.and_then(|p| p.kernel_version()))
    }
}

impl AdmissionRules {
    /// Evaluate every rule in order; the first failure wins.
    pub fn admit(
        &self,
        candidate: &dyn RuleSubject,
        parent: Option<&dyn RuleSubject>,
    ) -> Admission {
        let lookup = Lookup { candidate, parent };
        for rule in self.rules() {
            if let Err(rejection) = rule.check(&lookup) {
                return Admission::Rejected(rejection);
            }
        }
        Admission::Allowed
    }
}

impl Rule {
    fn check(&self, lookup: &Lookup<'_>) -> Result<(), Rejection> {
        match self {
            Rule::Value { key, filter } => check_value(key, filter, lookup.field(key), false),
            Rule::TreeBranch {
                combos,
                tree,
                branch,
            } => check_tree_branch(combos, tree, branch, lookup),
            Rule::MinVersion(min) => match lookup.kernel_version() {
                Some(v) if v < *min => Err(Rejection::new(
                    self.key(),
                    format!("kernel version {} is older than {}", v, min),
                )),
                _ => Ok(()),
            },
            Rule::MaxVersion(max) => match lookup.kernel_version() {
                Some(v) if v > *max => Err(Rejection::new(
                    self.key(),
                    format!("kernel version {} is newer than {}", v, max),
                )),
                _ => Ok(()),
            },
        }
    }
}

fn check_tree_branch(
    combos: &[ComboRule],
    tree: &ValueFilter,
    branch: &ValueFilter,
    lookup: &Lookup<'_>,
) -> Result<(), Rejection> {
    let tree_value = lookup.field(TREE_KEY);
    let branch_value = lookup.field(BRANCH_KEY);

    if let (Some(t), Some(b)) = (
        tree_value.as_ref().and_then(FieldValue::as_scalar),
        branch_value.as_ref().and_then(FieldValue::as_scalar),
    ) {
        if let Some(denied) = combos.iter().find(|c| c.denied && c.combo.matches(t, b)) {
            return Err(Rejection::new(
                &denied.key,
                format!("{}:{} combination is denied", t, b),
            ));
        }
        if combos.iter().any(|c| !c.denied && c.combo.matches(t, b)) {
            return Ok(());
        }
    }

    let has_allowed_combo = |key: &str| combos.iter().any(|c| !c.denied && c.key == key);
    check_value(TREE_KEY, tree, tree_value, has_allowed_combo(TREE_KEY))?;
    check_value(BRANCH_KEY, branch, branch_value, has_allowed_combo(BRANCH_KEY))
}

/// `combo_required` is set when the key listed allowed combinations, which
/// count as a positive requirement even with no single allowed value.
fn check_value(
    key: &str,
    filter: &ValueFilter,
    value: Option<FieldValue>,
    combo_required: bool,
) -> Result<(), Rejection> {
    let Some(value) = value else {
        trace!(rule = key, "field absent, rule skipped");
        return Ok(());
    };
    let requires_match = !filter.allow.is_empty() || combo_required;

    match value {
        FieldValue::List(items) => {
            if let Some(denied) = items.iter().find(|v| filter.is_denied(v)) {
                return Err(Rejection::new(key, format!("{} is denied", denied)));
            }
            if requires_match && !items.iter().any(|v| filter.is_listed(v)) {
                return Err(Rejection::new(
                    key,
                    format!("none of [{}] is allowed", items.join(", ")),
                ));
            }
        }
        FieldValue::Scalar(v) => {
            if filter.is_denied(&v) {
                return Err(Rejection::new(key, format!("{} is denied", v)));
            }
            if requires_match && !filter.is_listed(&v) {
                return Err(Rejection::new(key, format!("{} is not allowed", v)));
            }
        }
    }
    Ok(())
}
