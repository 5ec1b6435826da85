//! Schema compatibility checking
//!
//! Decides whether a writer or reader version may join a group given the
//! versions already in use on the other side, the group's evolution history
//! and its compatibility policy. Everything here is pure: no storage access
//! and no side effects.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RegistryError, Result};
use crate::types::{CodecType, SchemaEvolution, VersionInfo};

/// Compatibility policy of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Compatibility {
    AllowAny,
    DenyAll,
    Backward,
    BackwardTill {
        #[serde(default)]
        backward_till: Option<VersionInfo>,
    },
    BackwardTransitive,
    Forward,
    ForwardTill {
        #[serde(default)]
        forward_till: Option<VersionInfo>,
    },
    ForwardTransitive,
    BackwardAndForwardTill {
        #[serde(default)]
        backward_till: Option<VersionInfo>,
        #[serde(default)]
        forward_till: Option<VersionInfo>,
    },
    Full,
    FullTransitive,
}

impl Compatibility {
    /// Build a policy from its name and optional till markers.
    ///
    /// Names are matched case-insensitively and ignore `_` and `-`, so
    /// "backward_till", "BackwardTill" and "backward-till" are equivalent.
    pub fn parse(
        name: &str,
        backward_till: Option<VersionInfo>,
        forward_till: Option<VersionInfo>,
    ) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        let policy = match normalized.as_str() {
            "allowany" => Self::AllowAny,
            "denyall" => Self::DenyAll,
            "backward" => Self::Backward,
            "backwardtill" => Self::BackwardTill { backward_till },
            "backwardtransitive" => Self::BackwardTransitive,
            "forward" => Self::Forward,
            "forwardtill" => Self::ForwardTill { forward_till },
            "forwardtransitive" => Self::ForwardTransitive,
            "backwardandforwardtill" => Self::BackwardAndForwardTill {
                backward_till,
                forward_till,
            },
            "full" => Self::Full,
            "fulltransitive" => Self::FullTransitive,
            _ => return Err(RegistryError::UnknownPolicy(name.to_string())),
        };
        Ok(policy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AllowAny => "allow_any",
            Self::DenyAll => "deny_all",
            Self::Backward => "backward",
            Self::BackwardTill { .. } => "backward_till",
            Self::BackwardTransitive => "backward_transitive",
            Self::Forward => "forward",
            Self::ForwardTill { .. } => "forward_till",
            Self::ForwardTransitive => "forward_transitive",
            Self::BackwardAndForwardTill { .. } => "backward_and_forward_till",
            Self::Full => "full",
            Self::FullTransitive => "full_transitive",
        }
    }

    fn backward_till(&self) -> Option<&VersionInfo> {
        match self {
            Self::BackwardTill { backward_till }
            | Self::BackwardAndForwardTill { backward_till, .. } => backward_till.as_ref(),
            _ => None,
        }
    }

    fn forward_till(&self) -> Option<&VersionInfo> {
        match self {
            Self::ForwardTill { forward_till }
            | Self::BackwardAndForwardTill { forward_till, .. } => forward_till.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Side of the stream a candidate version is joining
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
        }
    }

    fn other(&self) -> &'static str {
        match self {
            Role::Writer => "reader",
            Role::Reader => "writer",
        }
    }
}

/// Result of a compatibility check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub is_compatible: bool,
    /// Every violated condition, in evaluation order
    pub violations: Vec<String>,
    pub summary: String,
}

impl CompatibilityResult {
    fn from_violations(
        candidate: &VersionInfo,
        policy: &Compatibility,
        violations: Vec<String>,
    ) -> Self {
        if violations.is_empty() {
            Self {
                is_compatible: true,
                violations,
                summary: format!("{} is compatible under {}", candidate, policy),
            }
        } else {
            let summary = format!(
                "{} is incompatible under {}: {}",
                candidate,
                policy,
                violations.join("; ")
            );
            Self {
                is_compatible: false,
                violations,
                summary,
            }
        }
    }

    /// Convert a rejection into [`RegistryError::IncompatibleSchema`]
    pub fn into_result(self) -> Result<()> {
        if self.is_compatible {
            Ok(())
        } else {
            Err(RegistryError::IncompatibleSchema(self.summary))
        }
    }
}

/// Version-compatibility checker for one group
pub struct CompatibilityChecker<'a> {
    policy: &'a Compatibility,
    history: &'a [SchemaEvolution],
    validate_by_object_type: bool,
}

impl<'a> CompatibilityChecker<'a> {
    pub fn new(
        policy: &'a Compatibility,
        history: &'a [SchemaEvolution],
        validate_by_object_type: bool,
    ) -> Self {
        Self {
            policy,
            history,
            validate_by_object_type,
        }
    }

    /// Check a writer version against the versions of registered readers
    pub fn check_writer(
        &self,
        candidate: &VersionInfo,
        readers: &[VersionInfo],
    ) -> CompatibilityResult {
        self.check(Role::Writer, candidate, readers)
    }

    /// Check a reader version against the versions of registered writers
    pub fn check_reader(
        &self,
        candidate: &VersionInfo,
        writers: &[VersionInfo],
    ) -> CompatibilityResult {
        self.check(Role::Reader, candidate, writers)
    }

    pub fn check(
        &self,
        role: Role,
        candidate: &VersionInfo,
        others: &[VersionInfo],
    ) -> CompatibilityResult {
        let scoped_others: Vec<i64> = others
            .iter()
            .filter(|v| self.in_scope(&v.schema_name, candidate))
            .map(|v| i64::from(v.version))
            .collect();

        let c = i64::from(candidate.version);
        let latest = self
            .history
            .iter()
            .filter(|e| self.in_scope(&e.version.schema_name, candidate))
            .map(|e| i64::from(e.version.version))
            .max()
            .unwrap_or(c);

        let mut bounds = Bounds {
            role,
            candidate: c,
            max_other: scoped_others.iter().copied().max(),
            min_other: scoped_others.iter().copied().min(),
            violations: Vec::new(),
        };

        let backward_till = self.till_version(self.policy.backward_till(), candidate, latest);
        let forward_till = self.till_version(self.policy.forward_till(), candidate, latest);
        let previous = Some(latest - 1);

        match (role, self.policy) {
            (_, Compatibility::AllowAny) | (_, Compatibility::FullTransitive) => {}
            (_, Compatibility::DenyAll) => bounds.exactly(latest),

            (Role::Writer, Compatibility::ForwardTransitive) => {
                bounds.candidate_at_least(max_bound(Some(0), bounds.max_other));
            }
            (Role::Writer, Compatibility::ForwardTill { .. }) => {
                bounds.candidate_at_least(max_bound(forward_till, bounds.max_other));
                bounds.others_at_least(forward_till);
            }
            (Role::Writer, Compatibility::Forward) => {
                bounds.candidate_at_least(max_bound(previous, bounds.max_other));
                bounds.others_at_least(previous);
            }
            (Role::Writer, Compatibility::Backward) => {
                bounds.candidate_at_least(previous);
                bounds.candidate_at_most(min_bound(bounds.min_other, Some(latest)));
            }
            (Role::Writer, Compatibility::BackwardTill { .. }) => {
                bounds.candidate_at_least(backward_till);
                bounds.candidate_at_most(min_bound(bounds.min_other, Some(latest)));
            }
            (Role::Writer, Compatibility::BackwardTransitive) => {
                bounds.candidate_at_most(min_bound(bounds.min_other, Some(latest)));
            }
            (Role::Writer, Compatibility::BackwardAndForwardTill { .. }) => {
                bounds.candidate_at_least(backward_till);
                bounds.others_at_least(forward_till);
            }
            (Role::Writer, Compatibility::Full) => {
                bounds.candidate_at_least(previous);
                bounds.others_at_least(previous);
            }

            (Role::Reader, Compatibility::ForwardTransitive) => {
                bounds.candidate_at_most(bounds.min_other);
            }
            (Role::Reader, Compatibility::ForwardTill { .. }) => {
                bounds.candidate_at_least(forward_till);
                bounds.candidate_at_most(bounds.min_other);
            }
            (Role::Reader, Compatibility::Forward) => {
                bounds.candidate_at_least(previous);
                bounds.candidate_at_most(bounds.min_other);
            }
            (Role::Reader, Compatibility::Backward) => {
                bounds.candidate_at_least(bounds.max_other);
                bounds.candidate_at_most(Some(latest));
                bounds.others_at_least(previous);
            }
            (Role::Reader, Compatibility::BackwardTill { .. }) => {
                bounds.candidate_at_least(bounds.max_other);
                bounds.candidate_at_most(Some(latest));
                bounds.others_at_least(backward_till);
            }
            (Role::Reader, Compatibility::BackwardTransitive) => {
                bounds.candidate_at_least(bounds.max_other);
                bounds.candidate_at_most(Some(latest));
            }
            (Role::Reader, Compatibility::BackwardAndForwardTill { .. }) => {
                bounds.candidate_at_least(forward_till);
                bounds.others_at_least(backward_till);
            }
            (Role::Reader, Compatibility::Full) => {
                bounds.candidate_at_least(previous);
                bounds.others_at_least(previous);
            }
        }

        CompatibilityResult::from_violations(candidate, self.policy, bounds.violations)
    }

    fn in_scope(&self, name: &str, candidate: &VersionInfo) -> bool {
        !self.validate_by_object_type || name == candidate.schema_name
    }

    /// Resolve a till marker to an ordinal in the candidate's scope.
    ///
    /// `None` means unbounded. When versions are scoped by object type the
    /// marker may name another type, so the first candidate-typed entry at
    /// or after the marker in history order supplies the ordinal. If no such
    /// entry exists the bound lies beyond `latest`.
    fn till_version(
        &self,
        marker: Option<&VersionInfo>,
        candidate: &VersionInfo,
        latest: i64,
    ) -> Option<i64> {
        let marker = marker?;
        if !self.validate_by_object_type {
            return Some(i64::from(marker.version));
        }

        let Some(start) = self.history.iter().position(|e| &e.version == marker) else {
            return Some(i64::from(marker.version));
        };

        let resolved = self.history[start..]
            .iter()
            .find(|e| e.version.schema_name == candidate.schema_name)
            .map(|e| i64::from(e.version.version))
            .unwrap_or(latest + 1);
        Some(resolved)
    }
}

/// Accumulates violated conditions for one candidate
struct Bounds {
    role: Role,
    candidate: i64,
    max_other: Option<i64>,
    min_other: Option<i64>,
    violations: Vec<String>,
}

impl Bounds {
    fn candidate_at_least(&mut self, bound: Option<i64>) {
        if let Some(bound) = bound {
            if self.candidate < bound {
                self.violations.push(format!(
                    "{} version {} must be at least {}",
                    self.role.label(),
                    self.candidate,
                    bound
                ));
            }
        }
    }

    fn candidate_at_most(&mut self, bound: Option<i64>) {
        if let Some(bound) = bound {
            if self.candidate > bound {
                self.violations.push(format!(
                    "{} version {} must be at most {}",
                    self.role.label(),
                    self.candidate,
                    bound
                ));
            }
        }
    }

    fn others_at_least(&mut self, bound: Option<i64>) {
        if let (Some(lowest), Some(bound)) = (self.min_other, bound) {
            if lowest < bound {
                self.violations.push(format!(
                    "registered {} versions must be at least {} but version {} is in use",
                    self.role.other(),
                    bound,
                    lowest
                ));
            }
        }
    }

    fn exactly(&mut self, latest: i64) {
        if self.candidate != latest {
            self.violations.push(format!(
                "{} version {} must be exactly the latest version {}",
                self.role.label(),
                self.candidate,
                latest
            ));
        }
    }
}

/// Larger of two lower bounds, `None` being unbounded
fn max_bound(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Smaller of two upper bounds, `None` being unbounded
fn min_bound(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Admit a writer codec only if every registered reader can decode it
pub fn check_writer_codec(codec: &CodecType, reader_codecs: &[Vec<CodecType>]) -> Result<()> {
    if let Some(reader) = reader_codecs.iter().find(|codecs| !codecs.contains(codec)) {
        let accepted: Vec<&str> = reader.iter().map(|c| c.name.as_str()).collect();
        return Err(RegistryError::CodecMismatch(format!(
            "writer codec {} is not accepted by a registered reader (accepts [{}])",
            codec,
            accepted.join(", ")
        )));
    }
    Ok(())
}

/// Admit a reader only if it can decode the codec of every registered writer
pub fn check_reader_codecs(codecs: &[CodecType], writer_codecs: &[CodecType]) -> Result<()> {
    let missing: Vec<&str> = writer_codecs
        .iter()
        .filter(|c| !codecs.contains(c))
        .map(|c| c.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(RegistryError::CodecMismatch(format!(
            "reader does not accept writer codecs [{}]",
            missing.join(", ")
        )));
    }
    Ok(())
}
