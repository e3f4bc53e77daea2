//! Interfaces to the external collaborators.
//!
//! The core never recomputes geometry, renders anything, or talks to
//! storage itself. Those concerns are injected at construction time as
//! trait objects:
//! - [`RelationEngine`]: the automatic geometry/lighting/senses engine.
//! - [`Persister`]: durable upsert of an entity's perception maps.
//! - [`Notifier`]: change broadcast for presentation listeners.
//! - [`DeferredPresenter`]: the turn-end confirmation UI.

use crate::relation::{CoverState, RelationState};
use crate::scene::TokenId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by external collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("token not found: {0}")]
    NotFound(TokenId),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("evaluation failed against observer {observer}: {reason}")]
    Evaluation { observer: TokenId, reason: String },

    #[error("presentation failed: {0}")]
    Presentation(String),
}

/// Which of an entity's perception maps a persistence write covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapKind {
    Relation,
    Cover,
    Overrides,
}

/// A resolved relation write, broadcast to presentation listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChange {
    pub observer: TokenId,
    pub target: TokenId,
    pub state: RelationState,
}

/// A resolved cover write, broadcast to presentation listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverChange {
    pub observer: TokenId,
    pub target: TokenId,
    pub state: CoverState,
}

/// A proposed relation change produced by turn-end sneak resolution.
///
/// Proposals are handed to the [`DeferredPresenter`] for confirmation;
/// nothing is written until the presenter returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub observer: TokenId,
    pub observer_name: String,
    pub previous: RelationState,
    pub proposed: RelationState,
    pub position_qualified: bool,
    /// Only true when `proposed != previous`.
    pub needs_application: bool,
}

/// The automatic geometry/lighting/senses engine.
///
/// Must be idempotent and side-effect free from the core's point of view;
/// it is consulted whenever a pair has no override and a fresh value is
/// needed.
#[async_trait]
pub trait RelationEngine: Send + Sync {
    async fn compute_relation(
        &self,
        observer: TokenId,
        target: TokenId,
    ) -> Result<RelationState, EngineError>;

    async fn compute_cover(
        &self,
        observer: TokenId,
        target: TokenId,
    ) -> Result<CoverState, EngineError>;
}

/// Idempotent upsert of one entity's perception map to durable storage.
///
/// The core treats it as fire-and-forget but awaits completion before
/// releasing the reaction-suspension flag.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(
        &self,
        entity: TokenId,
        kind: MapKind,
        map: serde_json::Value,
    ) -> Result<(), EngineError>;
}

/// Broadcast channel for presentation listeners. At-least-once; no ordering
/// across different pairs.
pub trait Notifier: Send + Sync {
    fn relation_changed(&self, change: &RelationChange);
    fn cover_changed(&self, change: &CoverChange);
}

/// The turn-end confirmation UI: shown the full proposal list, returns the
/// subset the operator confirmed.
#[async_trait]
pub trait DeferredPresenter: Send + Sync {
    async fn present_deferred_results(
        &self,
        actor: TokenId,
        actor_name: &str,
        proposals: Vec<Proposal>,
    ) -> Result<Vec<Proposal>, EngineError>;
}
