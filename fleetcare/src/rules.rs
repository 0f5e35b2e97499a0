//! Operation kinds and the rules that govern how they combine.
//!
//! A [`RuleSet`] maps every [`OperationKind`] to an [`OperationRule`]
//! carrying its execution order, the operations it excludes and the ones it
//! requires. [`RuleSet::validate`] turns a user selection into the ordered
//! list of operations to execute.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::error::ValidationError;

/// One of the maintenance actions the tool can perform.
///
/// Declaration order is the enumeration order used to break ties between
/// rules with the same `order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    DownloadLogs,
    CompareFileVersions,
    UpdateFileVersions,
    NvramReset,
    NvramDemoReset,
}

impl OperationKind {
    /// Every kind, in enumeration order.
    pub const ALL: [OperationKind; 5] = [
        OperationKind::DownloadLogs,
        OperationKind::CompareFileVersions,
        OperationKind::UpdateFileVersions,
        OperationKind::NvramReset,
        OperationKind::NvramDemoReset,
    ];

    /// Stable snake_case identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::DownloadLogs => "download_logs",
            OperationKind::CompareFileVersions => "compare_file_versions",
            OperationKind::UpdateFileVersions => "update_file_versions",
            OperationKind::NvramReset => "nvram_reset",
            OperationKind::NvramDemoReset => "nvram_demo_reset",
        }
    }

    /// Human readable title used in prompts and messages.
    pub fn title(&self) -> &'static str {
        match self {
            OperationKind::DownloadLogs => "Download Logs",
            OperationKind::CompareFileVersions => "Compare File Versions",
            OperationKind::UpdateFileVersions => "Update File Versions",
            OperationKind::NvramReset => "NVRAM Reset",
            OperationKind::NvramDemoReset => "NVRAM Demo Reset",
        }
    }

    /// Position in the enumeration.
    fn position(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown operation '{s}'"))
    }
}

/// Ordering and compatibility metadata for one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationRule {
    /// Execution order; lower runs first.
    pub order: u32,

    /// Operations that may not be selected together with this one.
    pub excludes: Vec<OperationKind>,

    /// Operations that must be selected whenever this one is.
    pub requires: Vec<OperationKind>,
}

impl OperationRule {
    /// Create a rule with the given order and no constraints.
    pub fn new(order: u32) -> Self {
        Self {
            order,
            excludes: vec![],
            requires: vec![],
        }
    }

    /// Add an excluded operation.
    ///
    /// Exclusion is not mirrored automatically; add the reverse rule too.
    pub fn excludes(mut self, kind: OperationKind) -> Self {
        self.excludes.push(kind);
        self
    }

    /// Add a required operation.
    pub fn requires(mut self, kind: OperationKind) -> Self {
        self.requires.push(kind);
        self
    }
}

/// The user's selection: operation kind to "selected" flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationRequest {
    selected: IndexMap<OperationKind, bool>,
}

impl OperationRequest {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an operation as selected.
    pub fn select(mut self, kind: OperationKind) -> Self {
        self.selected.insert(kind, true);
        self
    }

    /// Set the selection flag for an operation.
    pub fn set(&mut self, kind: OperationKind, selected: bool) {
        self.selected.insert(kind, selected);
    }

    /// Whether an operation is selected.
    pub fn is_selected(&self, kind: OperationKind) -> bool {
        self.selected.get(&kind).copied().unwrap_or(false)
    }

    /// Selected kinds in enumeration order.
    pub fn selected(&self) -> Vec<OperationKind> {
        OperationKind::ALL
            .into_iter()
            .filter(|k| self.is_selected(*k))
            .collect()
    }
}

impl FromIterator<(OperationKind, bool)> for OperationRequest {
    fn from_iter<I: IntoIterator<Item = (OperationKind, bool)>>(iter: I) -> Self {
        Self {
            selected: iter.into_iter().collect(),
        }
    }
}

/// Rule table for all operation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: HashMap<OperationKind, OperationRule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Add or replace the rule for an operation.
    pub fn with_rule(mut self, kind: OperationKind, rule: OperationRule) -> Self {
        self.rules.insert(kind, rule);
        self
    }

    /// Get the rule for an operation.
    pub fn rule(&self, kind: OperationKind) -> Option<&OperationRule> {
        self.rules.get(&kind)
    }

    /// Check a request against the rules and return the execution order.
    ///
    /// Exclusions are checked before dependencies. Kinds are visited in
    /// enumeration order, so the same request always yields the same error.
    pub fn validate(
        &self,
        request: &OperationRequest,
    ) -> Result<Vec<OperationKind>, ValidationError> {
        let selected = request.selected();
        if selected.is_empty() {
            return Err(ValidationError::NothingSelected);
        }

        let mut rules = Vec::with_capacity(selected.len());
        for kind in &selected {
            let rule = self
                .rule(*kind)
                .ok_or(ValidationError::MissingRule(*kind))?;
            rules.push((*kind, rule));
        }

        for (kind, rule) in &rules {
            let conflicting: Vec<_> = selected
                .iter()
                .copied()
                .filter(|k| rule.excludes.contains(k))
                .collect();
            if !conflicting.is_empty() {
                return Err(ValidationError::MutualExclusion {
                    operation: *kind,
                    conflicting,
                });
            }
        }

        for (kind, rule) in &rules {
            let missing: Vec<_> = rule
                .requires
                .iter()
                .copied()
                .filter(|k| !selected.contains(k))
                .collect();
            if !missing.is_empty() {
                return Err(ValidationError::MissingDependency {
                    operation: *kind,
                    missing,
                });
            }
        }

        rules.sort_by_key(|(kind, rule)| (rule.order, kind.position()));
        Ok(rules.into_iter().map(|(kind, _)| kind).collect())
    }
}

impl Default for RuleSet {
    /// The standard rules: compare, download, update, then one of the two
    /// NVRAM resets.
    fn default() -> Self {
        use OperationKind::*;

        RuleSet::new()
            .with_rule(CompareFileVersions, OperationRule::new(1))
            .with_rule(DownloadLogs, OperationRule::new(2))
            .with_rule(UpdateFileVersions, OperationRule::new(3))
            .with_rule(NvramReset, OperationRule::new(4).excludes(NvramDemoReset))
            .with_rule(NvramDemoReset, OperationRule::new(4).excludes(NvramReset))
    }
}
