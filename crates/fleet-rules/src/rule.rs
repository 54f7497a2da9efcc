//! Rule AST compiled from configuration.

use crate::error::RuleError;
use crate::version::KernelVersion;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Prefix marking a denied value.
pub const DENY_PREFIX: char = '!';

/// Separator of a `tree:branch` combination token.
pub const COMBO_SEPARATOR: char = ':';

pub const TREE_KEY: &str = "tree";
pub const BRANCH_KEY: &str = "branch";
pub const MIN_VERSION_KEY: &str = "min_version";
pub const MAX_VERSION_KEY: &str = "max_version";

/// Allow and deny lists for one field.
///
/// An empty allow list places no positive requirement on the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl ValueFilter {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for token in tokens {
            filter.push(token.as_ref());
        }
        filter
    }

    fn push(&mut self, token: &str) {
        match token.strip_prefix(DENY_PREFIX) {
            Some(denied) => self.deny.push(denied.to_string()),
            None => self.allow.push(token.to_string()),
        }
    }

    pub fn is_denied(&self, value: &str) -> bool {
        self.deny.iter().any(|d| d == value)
    }

    pub fn is_listed(&self, value: &str) -> bool {
        self.allow.iter().any(|a| a == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBranch {
    pub tree: String,
    pub branch: String,
}

impl TreeBranch {
    pub fn matches(&self, tree: &str, branch: &str) -> bool {
        self.tree == tree && self.branch == branch
    }
}

/// A tree/branch pair treated as one allow or deny unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComboRule {
    /// Rule key (`tree` or `branch`) that declared the combination.
    pub key: String,
    pub combo: TreeBranch,
    pub denied: bool,
}

impl ComboRule {
    fn parse(key: &str, token: &str) -> Result<Self, RuleError> {
        let (denied, body) = match token.strip_prefix(DENY_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let (tree, branch) = body
            .split_once(COMBO_SEPARATOR)
            .filter(|(t, b)| !t.is_empty() && !b.is_empty() && !b.contains(COMBO_SEPARATOR))
            .ok_or_else(|| RuleError::InvalidCombo(token.to_string()))?;
        Ok(Self {
            key: key.to_string(),
            combo: TreeBranch {
                tree: tree.to_string(),
                branch: branch.to_string(),
            },
            denied,
        })
    }
}

/// A single compiled rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Allow/deny lists for an arbitrary field.
    Value { key: String, filter: ValueFilter },
    /// Joint tree/branch evaluation, combinations first.
    TreeBranch {
        combos: Vec<ComboRule>,
        tree: ValueFilter,
        branch: ValueFilter,
    },
    MinVersion(KernelVersion),
    MaxVersion(KernelVersion),
}

impl Rule {
    pub fn key(&self) -> &str {
        match self {
            Rule::Value { key, .. } => key,
            Rule::TreeBranch { .. } => TREE_KEY,
            Rule::MinVersion(_) => MIN_VERSION_KEY,
            Rule::MaxVersion(_) => MAX_VERSION_KEY,
        }
    }
}

/// Compiled admission rules of a job, platform or scheduler entry.
///
/// Evaluation order is fixed at compile time: tree/branch first, then
/// version bounds, then every other key in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, Value>")]
pub struct AdmissionRules {
    rules: Vec<Rule>,
}

impl AdmissionRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compile a raw rule mapping.
    pub fn compile(raw: &BTreeMap<String, Value>) -> Result<Self, RuleError> {
        let mut rules = Vec::new();

        if raw.contains_key(TREE_KEY) || raw.contains_key(BRANCH_KEY) {
            let mut combos = Vec::new();
            let mut tree = ValueFilter::default();
            let mut branch = ValueFilter::default();
            for (key, filter) in [(TREE_KEY, &mut tree), (BRANCH_KEY, &mut branch)] {
                let Some(value) = raw.get(key) else {
                    continue;
                };
                for token in tokens(key, value)? {
                    if token.contains(COMBO_SEPARATOR) {
                        combos.push(ComboRule::parse(key, &token)?);
                    } else {
                        filter.push(&token);
                    }
                }
            }
            rules.push(Rule::TreeBranch {
                combos,
                tree,
                branch,
            });
        }

        if let Some(value) = raw.get(MIN_VERSION_KEY) {
            rules.push(Rule::MinVersion(KernelVersion::from_json(value)?));
        }
        if let Some(value) = raw.get(MAX_VERSION_KEY) {
            rules.push(Rule::MaxVersion(KernelVersion::from_json(value)?));
        }

        for (key, value) in raw {
            if matches!(
                key.as_str(),
                TREE_KEY | BRANCH_KEY | MIN_VERSION_KEY | MAX_VERSION_KEY
            ) {
                continue;
            }
            rules.push(Rule::Value {
                key: key.clone(),
                filter: ValueFilter::from_tokens(tokens(key, value)?),
            });
        }

        Ok(Self { rules })
    }
}

impl TryFrom<BTreeMap<String, Value>> for AdmissionRules {
    type Error = RuleError;

    fn try_from(raw: BTreeMap<String, Value>) -> Result<Self, Self::Error> {
        Self::compile(&raw)
    }
}

fn tokens(key: &str, value: &Value) -> Result<Vec<String>, RuleError> {
    let token = |v: &Value| match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(RuleError::InvalidValue {
            key: key.to_string(),
            reason: format!("unsupported token {}", other),
        }),
    };
    match value {
        Value::Null => Ok(vec![]),
        Value::Array(items) => items.iter().map(token).collect(),
        other => Ok(vec![token(other)?]),
    }
}
