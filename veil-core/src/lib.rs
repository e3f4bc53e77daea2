//! Visibility and cover reconciliation core for turn-based tabletop
//! encounters.
//!
//! This crate tracks how every observing token perceives every other token
//! (observed, concealed, hidden, undetected) and what cover each has
//! against the other, and keeps that picture consistent while it is being
//! changed from two directions at once: an automatic geometry/lighting
//! engine and explicit manual pins. It provides:
//! - Per-observer relation and cover stores with defaults, privilege
//!   gating, and change broadcast
//! - Pinned overrides with provenance, precedence over the automatic
//!   engine, and cascading cleanup on token deletion
//! - Multi-perspective aggregation behind a configurable ordering
//! - A turn-scoped tracker that lets a capable actor chain sneak actions
//!   and settle them with one deferred end-of-turn check
//!
//! Geometry, rendering, storage, and transport stay outside: they are
//! injected at construction as the collaborator traits in [`engine`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use veil_core::{PerceptionConfig, PerceptionSession, RelationState, RelationWrite, Token};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut session = PerceptionSession::new(
//!         PerceptionConfig::new(),
//!         my_engine,     // Arc<dyn RelationEngine>
//!         my_persister,  // Arc<dyn Persister>
//!         my_notifier,   // Arc<dyn Notifier>
//!         my_presenter,  // Arc<dyn DeferredPresenter>
//!     );
//!
//!     let watcher = session.add_token(Token::new("Watcher"));
//!     let skulker = session.add_token(Token::new("Skulker").with_chain_sneak());
//!
//!     session
//!         .apply_override(
//!             watcher,
//!             &[skulker],
//!             RelationWrite::Pinned(RelationState::Hidden),
//!             None,
//!         )
//!         .await;
//!     assert_eq!(session.relation(watcher, skulker), RelationState::Hidden);
//! }
//! ```

pub mod aggregate;
pub mod encounter;
pub mod engine;
pub mod overrides;
pub mod relation;
pub mod scene;
pub mod session;
pub mod sneak;
pub mod store;
pub mod testing;

// Primary public API
pub use aggregate::{AggregationPolicy, PerspectiveOrdering};
pub use encounter::{Combatant, CombatantId, EncounterChange, EncounterState};
pub use engine::{
    CoverChange, DeferredPresenter, EngineError, MapKind, Notifier, Persister, Proposal,
    RelationChange, RelationEngine,
};
pub use overrides::{OverrideManager, OverrideRecord, OverrideSource};
pub use relation::{CheckOutcome, CoverState, RelationState, RelationWrite, RollOutcome};
pub use scene::{Position, Scene, Token, TokenId};
pub use session::{PerceptionConfig, PerceptionSession};
pub use sneak::{
    end_position_qualifies, DeferSnapshot, DeferredCheck, SneakAction, SneakError, TurnSneakState,
    TurnSneakTracker,
};
pub use store::{RelationStore, Role};
