//! Multi-perspective aggregation.
//!
//! A controller may run several observing tokens at once (proxies,
//! familiars, cameras). The reported relation for a target is reduced
//! across all of them through a single configurable ordering; the default
//! takes the most informative perspective, on the rationale that if any one
//! controlled observer perceives the target clearly, the controller
//! effectively does.

use crate::relation::{CoverState, RelationState};
use crate::scene::{Scene, TokenId};
use crate::store::RelationStore;
use serde::{Deserialize, Serialize};

/// How simultaneous perspectives are reduced to one reported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PerspectiveOrdering {
    /// The clearest view wins: best relation, least cover.
    #[default]
    MostInformative,
    /// The murkiest view wins: worst relation, most cover.
    MostConcealed,
}

/// Combines several observers' relations toward one target into the value
/// reported to their shared controller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AggregationPolicy {
    pub ordering: PerspectiveOrdering,
}

impl AggregationPolicy {
    pub fn new(ordering: PerspectiveOrdering) -> Self {
        Self { ordering }
    }

    /// Reduce a set of relation perspectives. Identity for a single
    /// perspective; an empty set reads as the map default.
    pub fn combine_relations(
        &self,
        perspectives: impl IntoIterator<Item = RelationState>,
    ) -> RelationState {
        let reduced = match self.ordering {
            PerspectiveOrdering::MostInformative => perspectives.into_iter().max(),
            PerspectiveOrdering::MostConcealed => perspectives.into_iter().min(),
        };
        reduced.unwrap_or_default()
    }

    /// Reduce a set of cover perspectives. Most-informative means the least
    /// cover any controlled observer has to contend with.
    pub fn combine_cover(
        &self,
        perspectives: impl IntoIterator<Item = CoverState>,
    ) -> CoverState {
        let reduced = match self.ordering {
            PerspectiveOrdering::MostInformative => perspectives.into_iter().min(),
            PerspectiveOrdering::MostConcealed => perspectives.into_iter().max(),
        };
        reduced.unwrap_or_default()
    }

    /// The relation a controller of `observers` effectively has toward
    /// `target`.
    pub fn relation(
        &self,
        store: &RelationStore,
        scene: &Scene,
        observers: &[TokenId],
        target: TokenId,
    ) -> RelationState {
        self.combine_relations(observers.iter().map(|&o| store.relation(scene, o, target)))
    }

    /// The cover a controller of `observers` effectively faces against
    /// `target`.
    pub fn cover(
        &self,
        store: &RelationStore,
        scene: &Scene,
        observers: &[TokenId],
        target: TokenId,
    ) -> CoverState {
        self.combine_cover(observers.iter().map(|&o| store.cover(scene, o, target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_informative_relation() {
        let policy = AggregationPolicy::default();
        assert_eq!(
            policy.combine_relations([RelationState::Hidden, RelationState::Observed]),
            RelationState::Observed
        );
        assert_eq!(
            policy.combine_relations([RelationState::Undetected, RelationState::Hidden]),
            RelationState::Hidden
        );
    }

    #[test]
    fn test_single_perspective_is_identity() {
        let policy = AggregationPolicy::default();
        assert_eq!(
            policy.combine_relations([RelationState::Undetected]),
            RelationState::Undetected
        );
    }

    #[test]
    fn test_empty_perspectives_read_as_default() {
        let policy = AggregationPolicy::default();
        assert_eq!(
            policy.combine_relations(Vec::new()),
            RelationState::Observed
        );
        assert_eq!(policy.combine_cover(Vec::new()), CoverState::None);
    }

    #[test]
    fn test_most_concealed_ordering() {
        let policy = AggregationPolicy::new(PerspectiveOrdering::MostConcealed);
        assert_eq!(
            policy.combine_relations([RelationState::Hidden, RelationState::Observed]),
            RelationState::Hidden
        );
        assert_eq!(
            policy.combine_cover([CoverState::None, CoverState::Greater]),
            CoverState::Greater
        );
    }

    #[test]
    fn test_most_informative_cover_is_least_cover() {
        let policy = AggregationPolicy::default();
        assert_eq!(
            policy.combine_cover([CoverState::Standard, CoverState::Lesser]),
            CoverState::Lesser
        );
    }
}
