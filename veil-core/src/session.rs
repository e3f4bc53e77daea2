//! PerceptionSession - the primary public API for the reconciliation core.
//!
//! The session owns the scene, the optional active encounter, and the
//! components operating on them, and exposes the whole external surface
//! behind one type: relation/cover reads and writes, aggregated reads,
//! override management, sneak tracking, and the encounter lifecycle
//! notifications that drive turn-end resolution.

use crate::aggregate::{AggregationPolicy, PerspectiveOrdering};
use crate::encounter::{Combatant, CombatantId, EncounterChange, EncounterState};
use crate::engine::{DeferredPresenter, Notifier, Persister, Proposal, RelationEngine};
use crate::overrides::{OverrideManager, OverrideRecord, OverrideSource};
use crate::relation::{CheckOutcome, CoverState, RelationState, RelationWrite, RollOutcome};
use crate::scene::{Scene, Token, TokenId};
use crate::sneak::{DeferSnapshot, SneakError, TurnSneakState, TurnSneakTracker};
use crate::store::{RelationStore, Role};
use std::sync::Arc;
use tracing::debug;

/// Configuration for creating a perception session.
#[derive(Debug, Clone)]
pub struct PerceptionConfig {
    /// Privilege level of this process; only the arbiter's writes land.
    pub role: Role,

    /// How multi-observer perspectives are reduced.
    pub ordering: PerspectiveOrdering,
}

impl PerceptionConfig {
    pub fn new() -> Self {
        Self {
            role: Role::Arbiter,
            ordering: PerspectiveOrdering::default(),
        }
    }

    /// Set the caller role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the perspective ordering.
    pub fn with_ordering(mut self, ordering: PerspectiveOrdering) -> Self {
        self.ordering = ordering;
        self
    }
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A perception reconciliation session.
///
/// Collaborators are injected once at construction: the automatic
/// relation/cover engine, the persistence upsert, the change broadcast,
/// and the turn-end confirmation UI.
pub struct PerceptionSession {
    scene: Scene,
    encounter: Option<EncounterState>,
    manager: OverrideManager,
    tracker: TurnSneakTracker,
    aggregation: AggregationPolicy,
    role: Role,
}

impl PerceptionSession {
    pub fn new(
        config: PerceptionConfig,
        engine: Arc<dyn RelationEngine>,
        persister: Arc<dyn Persister>,
        notifier: Arc<dyn Notifier>,
        presenter: Arc<dyn DeferredPresenter>,
    ) -> Self {
        let store = RelationStore::new(notifier, persister);
        let manager = OverrideManager::new(store, engine.clone());
        let tracker = TurnSneakTracker::new(engine, presenter);
        Self {
            scene: Scene::new(),
            encounter: None,
            manager,
            tracker,
            aggregation: AggregationPolicy::new(config.ordering),
            role: config.role,
        }
    }

    // ------------------------------------------------------------------
    // Scene and tokens
    // ------------------------------------------------------------------

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn add_token(&mut self, token: Token) -> TokenId {
        self.scene.add_token(token)
    }

    /// Delete a token with cascading cleanup: its own maps, every other
    /// token's entries for it, and every override record naming it on
    /// either side.
    pub async fn delete_token(&mut self, id: TokenId) -> Option<Token> {
        self.manager.store().purge_token(&mut self.scene, id).await;
        let removed = self.scene.remove_token(id);
        if removed.is_some() {
            debug!(%id, "token deleted");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Relation and cover
    // ------------------------------------------------------------------

    pub fn manager(&self) -> &OverrideManager {
        &self.manager
    }

    pub fn store(&self) -> &RelationStore {
        self.manager.store()
    }

    pub fn aggregation(&self) -> AggregationPolicy {
        self.aggregation
    }

    pub fn relation(&self, observer: TokenId, target: TokenId) -> RelationState {
        self.manager.store().relation(&self.scene, observer, target)
    }

    pub fn cover(&self, observer: TokenId, target: TokenId) -> CoverState {
        self.manager.store().cover(&self.scene, observer, target)
    }

    /// The relation a controller of several observers effectively has.
    pub fn aggregated_relation(&self, observers: &[TokenId], target: TokenId) -> RelationState {
        self.aggregation
            .relation(self.manager.store(), &self.scene, observers, target)
    }

    /// The cover a controller of several observers effectively faces.
    pub fn aggregated_cover(&self, observers: &[TokenId], target: TokenId) -> CoverState {
        self.aggregation
            .cover(self.manager.store(), &self.scene, observers, target)
    }

    /// Write a relation value. The manager holds its reaction-suspension
    /// flag for the duration, like the override path.
    pub async fn set_relation(
        &mut self,
        observer: TokenId,
        target: TokenId,
        state: RelationState,
    ) -> bool {
        self.manager
            .set_relation(&mut self.scene, self.role, observer, target, state)
            .await
    }

    /// Write a cover value, under the same suspension rules as
    /// [`set_relation`](Self::set_relation).
    pub async fn set_cover(
        &mut self,
        observer: TokenId,
        target: TokenId,
        state: CoverState,
    ) -> bool {
        self.manager
            .set_cover(&mut self.scene, self.role, observer, target, state)
            .await
    }

    // ------------------------------------------------------------------
    // Overrides
    // ------------------------------------------------------------------

    /// Pin or release a manual override from one observer against targets.
    pub async fn apply_override(
        &mut self,
        observer: TokenId,
        targets: &[TokenId],
        write: RelationWrite,
        expected_cover: Option<CoverState>,
    ) -> usize {
        self.manager
            .apply_override(
                &mut self.scene,
                self.role,
                observer,
                targets,
                write,
                expected_cover,
                OverrideSource::Manual,
            )
            .await
    }

    pub async fn remove_override(&mut self, observer: TokenId, target: TokenId) -> bool {
        self.manager
            .remove_override(&mut self.scene, observer, target)
            .await
    }

    pub async fn remove_all_overrides_involving(&mut self, id: TokenId) -> usize {
        self.manager
            .remove_all_overrides_involving(&mut self.scene, self.role, id)
            .await
    }

    pub fn override_for(&self, observer: TokenId, target: TokenId) -> Option<OverrideRecord> {
        self.manager.override_for(&self.scene, observer, target)
    }

    /// Entry point for the automatic engine's change detection: recompute
    /// one pair unless it is pinned or a write is in flight.
    pub async fn refresh(&mut self, observer: TokenId, target: TokenId) {
        self.manager
            .refresh(&mut self.scene, self.role, observer, target)
            .await
    }

    // ------------------------------------------------------------------
    // Encounter lifecycle
    // ------------------------------------------------------------------

    pub fn encounter(&self) -> Option<&EncounterState> {
        self.encounter.as_ref()
    }

    /// Begin a turn-structured encounter, replacing any previous one.
    pub fn start_encounter(&mut self) -> &mut EncounterState {
        self.encounter.insert(EncounterState::new())
    }

    pub fn add_combatant(
        &mut self,
        token_id: TokenId,
        name: impl Into<String>,
        initiative: i32,
    ) -> Option<CombatantId> {
        let encounter = self.encounter.as_mut()?;
        Some(encounter.add_combatant(Combatant::new(token_id, name, initiative)))
    }

    /// End the encounter, resolving and destroying every remaining
    /// tracking state.
    pub async fn end_encounter(&mut self) {
        let Some(mut encounter) = self.encounter.take() else {
            return;
        };
        encounter.end();
        self.tracker
            .on_encounter_updated(
                &mut self.scene,
                &encounter,
                &self.manager,
                self.role,
                EncounterChange::default(),
            )
            .await;
    }

    /// Advance the turn cursor, resolving the ending combatant's sneak
    /// state and sweeping up anything a missed signal left behind.
    pub async fn next_turn(&mut self) -> Result<Vec<Proposal>, SneakError> {
        let (ending, change) = match self.encounter.as_mut() {
            Some(encounter) => {
                let ending = encounter.current_combatant().map(|c| c.id);
                let change = encounter.next_turn();
                (ending, change)
            }
            None => return Ok(Vec::new()),
        };

        let mut proposals = Vec::new();
        if let Some(combatant_id) = ending {
            proposals = self.on_turn_ended(combatant_id).await?;
        }
        self.on_encounter_updated(change).await;
        Ok(proposals)
    }

    /// Host notification: a combatant's turn ended.
    pub async fn on_turn_ended(
        &mut self,
        combatant_id: CombatantId,
    ) -> Result<Vec<Proposal>, SneakError> {
        self.tracker
            .on_turn_ended(&mut self.scene, &self.manager, self.role, combatant_id)
            .await
    }

    /// Host notification: the encounter's round or turn moved.
    pub async fn on_encounter_updated(&mut self, change: EncounterChange) {
        if let Some(encounter) = self.encounter.as_ref() {
            self.tracker
                .on_encounter_updated(&mut self.scene, encounter, &self.manager, self.role, change)
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Sneak tracking
    // ------------------------------------------------------------------

    /// Record a qualifying sneak action. Returns false when the caller
    /// should use the ordinary immediate-check path.
    pub fn start_tracking(&mut self, combatant_id: CombatantId) -> bool {
        match self.encounter.as_ref() {
            Some(encounter) => self.tracker.start_tracking(&self.scene, encounter, combatant_id),
            None => false,
        }
    }

    pub fn should_defer(&self, combatant_id: CombatantId) -> bool {
        match self.encounter.as_ref() {
            Some(encounter) => self.tracker.should_defer(encounter, combatant_id),
            None => false,
        }
    }

    pub fn record_deferred_check(
        &mut self,
        combatant_id: CombatantId,
        observer: TokenId,
        snapshot: DeferSnapshot,
        original_outcome: CheckOutcome,
    ) -> bool {
        self.tracker
            .record_deferred_check(combatant_id, observer, snapshot, original_outcome)
    }

    pub fn record_roll_outcome(
        &mut self,
        combatant_id: CombatantId,
        observer: TokenId,
        outcome: RollOutcome,
        proposed: RelationState,
    ) -> bool {
        self.tracker
            .record_roll_outcome(combatant_id, observer, outcome, proposed)
    }

    pub fn turn_state(&self, combatant_id: CombatantId) -> Option<&TurnSneakState> {
        self.tracker.turn_state(combatant_id)
    }
}
