//! Core perception vocabulary: relation states, cover states, and the
//! write instructions that feed them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How an observer currently perceives a target.
///
/// The derived ordering ranks informativeness from the observer's point of
/// view: `Undetected < Hidden < Concealed < Observed`. A greater value means
/// the observer has a clearer picture of the target, so "best perspective"
/// reductions are a plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationState {
    /// The observer has no idea the target exists or where it is.
    Undetected,
    /// The observer knows roughly where the target is but cannot see it.
    Hidden,
    /// The observer can see the target, but indistinctly.
    Concealed,
    /// The observer perceives the target plainly.
    Observed,
}

impl RelationState {
    pub fn name(&self) -> &'static str {
        match self {
            RelationState::Undetected => "undetected",
            RelationState::Hidden => "hidden",
            RelationState::Concealed => "concealed",
            RelationState::Observed => "observed",
        }
    }

    /// Whether the target can currently be targeted by sight.
    pub fn is_visible(&self) -> bool {
        matches!(self, RelationState::Observed | RelationState::Concealed)
    }
}

impl Default for RelationState {
    /// Absent map entries read as `Observed`.
    fn default() -> Self {
        RelationState::Observed
    }
}

impl fmt::Display for RelationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Degree of physical obstruction between an observer and a target.
///
/// Ordered by how much cover the target enjoys: `None < Lesser < Standard <
/// Greater`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverState {
    None,
    Lesser,
    Standard,
    Greater,
}

impl CoverState {
    pub fn name(&self) -> &'static str {
        match self {
            CoverState::None => "none",
            CoverState::Lesser => "lesser",
            CoverState::Standard => "standard",
            CoverState::Greater => "greater",
        }
    }

    /// Standard or greater cover is enough to hide behind.
    pub fn blocks_sight(&self) -> bool {
        *self >= CoverState::Standard
    }
}

impl Default for CoverState {
    fn default() -> Self {
        CoverState::None
    }
}

impl fmt::Display for CoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A write instruction for a relation override.
///
/// `Pinned` fixes the pair to a concrete state until released. `Delegated`
/// releases the pair back to the automatic engine; it is an instruction
/// only and is unrepresentable in the stored maps, so a reader can never
/// see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "state")]
pub enum RelationWrite {
    Pinned(RelationState),
    Delegated,
}

/// Degree-of-success ladder for a stealth roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollOutcome {
    CriticalFailure,
    Failure,
    Success,
    CriticalSuccess,
}

impl RollOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RollOutcome::Failure | RollOutcome::CriticalFailure)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RollOutcome::CriticalFailure => "critical-failure",
            RollOutcome::Failure => "failure",
            RollOutcome::Success => "success",
            RollOutcome::CriticalSuccess => "critical-success",
        }
    }
}

impl fmt::Display for RollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The full outcome that originally qualified a sneak: the roll itself and
/// the relation the actor held against the observer at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub outcome: RollOutcome,
    /// Relation that permitted the sneak. `None` when the originating
    /// context could not determine it; evaluation falls back to `Hidden`.
    pub relation: Option<RelationState>,
}

impl CheckOutcome {
    pub fn new(outcome: RollOutcome, relation: Option<RelationState>) -> Self {
        Self { outcome, relation }
    }

    /// The relation level the end-of-turn qualification rule starts from.
    pub fn start_relation(&self) -> RelationState {
        self.relation.unwrap_or(RelationState::Hidden)
    }
}
