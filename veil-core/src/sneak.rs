//! Turn-scoped deferred sneak validation.
//!
//! An actor with the chained-sneak capability may string several sneak
//! actions together in one turn and settle them all with a single
//! end-of-turn check. The tracker holds one [`TurnSneakState`] per
//! combatant while its turn lasts: the first qualifying action creates it,
//! later actions defer their end-position checks into it, and turn end
//! (or a detected round/turn change) resolves every deferred check against
//! the actor's final position and destroys the state. The state is
//! strictly transient; it never survives the turn, on any path.

use crate::encounter::{CombatantId, EncounterChange, EncounterState};
use crate::engine::{DeferredPresenter, Proposal, RelationEngine};
use crate::overrides::{OverrideManager, OverrideSource};
use crate::relation::{CheckOutcome, CoverState, RelationState, RelationWrite, RollOutcome};
use crate::scene::{Position, Scene, TokenId};
use crate::store::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from turn-end resolution.
#[derive(Debug, Error)]
pub enum SneakError {
    #[error("actor token {0} is missing from the scene")]
    MissingActor(TokenId),
}

/// One qualifying sneak action taken during the tracked turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SneakAction {
    pub at: DateTime<Utc>,
    pub position: Position,
}

/// Snapshot taken when a chained action defers its end-position check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeferSnapshot {
    /// Observer position at the moment of deferral.
    pub position: Position,
    pub relation: RelationState,
    pub cover: CoverState,
}

/// A deferred end-position check against one observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredCheck {
    pub observer: TokenId,
    pub position: Position,
    pub relation_at_defer: RelationState,
    pub cover_at_defer: CoverState,
    /// The outcome that originally qualified the sneak; its relation level
    /// is what the end-of-turn qualification rule starts from.
    pub original_outcome: CheckOutcome,
}

/// The roll history against one observer for the tracked turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RollRecord {
    pub failed: bool,
    pub last_outcome: RollOutcome,
}

/// Per-combatant tracking state for one turn of chained sneaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSneakState {
    pub round: u32,
    pub turn: usize,
    pub combatant_id: CombatantId,
    pub actor: TokenId,
    pub start_position: Position,
    pub sneak_actions: Vec<SneakAction>,
    pub deferred_checks: HashMap<TokenId, DeferredCheck>,
    pub roll_outcomes: HashMap<TokenId, RollRecord>,
    pub observer_states: HashMap<TokenId, RelationState>,
    pub active: bool,
}

impl TurnSneakState {
    fn new(
        combatant_id: CombatantId,
        actor: TokenId,
        round: u32,
        turn: usize,
        position: Position,
    ) -> Self {
        Self {
            round,
            turn,
            combatant_id,
            actor,
            start_position: position,
            sneak_actions: Vec::new(),
            deferred_checks: HashMap::new(),
            roll_outcomes: HashMap::new(),
            observer_states: HashMap::new(),
            active: true,
        }
    }

    /// The relation recorded against an observer so far this turn.
    pub fn observer_state(&self, observer: TokenId) -> Option<RelationState> {
        self.observer_states.get(&observer).copied()
    }

    fn has_failed_against(&self, observer: TokenId) -> bool {
        self.roll_outcomes.get(&observer).is_some_and(|r| r.failed)
    }
}

/// Whether the actor's end position keeps the sneak intact against one
/// observer.
///
/// `start` is the relation that originally permitted the sneak. An actor
/// that began undetected stays qualified while it remains unseen or keeps
/// concealment or solid cover; one that began merely hidden has the same
/// outs. From any other starting point only concealment or solid cover
/// qualifies.
pub fn end_position_qualifies(
    start: RelationState,
    relation: RelationState,
    cover: CoverState,
) -> bool {
    match start {
        RelationState::Undetected => {
            matches!(relation, RelationState::Undetected | RelationState::Hidden)
                || cover.blocks_sight()
                || relation == RelationState::Concealed
        }
        RelationState::Hidden => {
            cover.blocks_sight()
                || matches!(
                    relation,
                    RelationState::Concealed | RelationState::Hidden | RelationState::Undetected
                )
        }
        _ => cover.blocks_sight() || relation == RelationState::Concealed,
    }
}

/// Tracks chained sneak turns and resolves their deferred checks.
pub struct TurnSneakTracker {
    engine: Arc<dyn RelationEngine>,
    presenter: Arc<dyn DeferredPresenter>,
    states: HashMap<CombatantId, TurnSneakState>,
}

impl TurnSneakTracker {
    pub fn new(engine: Arc<dyn RelationEngine>, presenter: Arc<dyn DeferredPresenter>) -> Self {
        Self {
            engine,
            presenter,
            states: HashMap::new(),
        }
    }

    /// The tracking state for a combatant, if its turn is being tracked.
    pub fn turn_state(&self, combatant_id: CombatantId) -> Option<&TurnSneakState> {
        self.states.get(&combatant_id)
    }

    /// Record a qualifying sneak action for `combatant_id`.
    ///
    /// Returns false, meaning the caller should use the ordinary
    /// immediate-check path, unless the actor has the chained-sneak
    /// capability and the encounter is active. The first qualifying action
    /// of the turn creates the state and fixes the start position; every
    /// qualifying action is appended to the action list.
    pub fn start_tracking(
        &mut self,
        scene: &Scene,
        encounter: &EncounterState,
        combatant_id: CombatantId,
    ) -> bool {
        if !encounter.active {
            return false;
        }
        let Some(combatant) = encounter.combatant(combatant_id) else {
            return false;
        };
        let Some(token) = scene.token(combatant.token_id) else {
            return false;
        };
        if !token.chain_sneak {
            return false;
        }

        let position = token.position;
        let current = self
            .states
            .get(&combatant_id)
            .is_some_and(|s| s.active && encounter.is_current(s.round, s.turn));
        if !current {
            if self.states.remove(&combatant_id).is_some() {
                debug!(%combatant_id, "discarding stale sneak state on new tracking");
            }
        }
        let state = self.states.entry(combatant_id).or_insert_with(|| {
            TurnSneakState::new(
                combatant_id,
                combatant.token_id,
                encounter.round,
                encounter.turn_index,
                position,
            )
        });
        state.sneak_actions.push(SneakAction {
            at: Utc::now(),
            position,
        });
        debug!(
            %combatant_id,
            actions = state.sneak_actions.len(),
            "sneak action tracked"
        );
        true
    }

    /// Whether a check against `observer` should defer to turn end.
    ///
    /// Only the second and later qualifying actions of the current turn
    /// defer; the first action's end-position check runs immediately
    /// through the ordinary path.
    pub fn should_defer(&self, encounter: &EncounterState, combatant_id: CombatantId) -> bool {
        self.states.get(&combatant_id).is_some_and(|s| {
            s.active && encounter.is_current(s.round, s.turn) && s.sneak_actions.len() >= 2
        })
    }

    /// Store or replace the deferred snapshot for one observer. Returns
    /// false when the combatant has no active tracking state.
    pub fn record_deferred_check(
        &mut self,
        combatant_id: CombatantId,
        observer: TokenId,
        snapshot: DeferSnapshot,
        original_outcome: CheckOutcome,
    ) -> bool {
        let Some(state) = self.states.get_mut(&combatant_id) else {
            return false;
        };
        state.deferred_checks.insert(
            observer,
            DeferredCheck {
                observer,
                position: snapshot.position,
                relation_at_defer: snapshot.relation,
                cover_at_defer: snapshot.cover,
                original_outcome,
            },
        );
        state
            .observer_states
            .entry(observer)
            .or_insert(snapshot.relation);
        true
    }

    /// Record a roll outcome against one observer.
    ///
    /// Failure is sticky for the remainder of the turn: once an observer is
    /// marked failed, no later outcome for it is honored: the call returns
    /// false and the recorded state stays `Observed` (failed sneak roll).
    pub fn record_roll_outcome(
        &mut self,
        combatant_id: CombatantId,
        observer: TokenId,
        outcome: RollOutcome,
        proposed: RelationState,
    ) -> bool {
        let Some(state) = self.states.get_mut(&combatant_id) else {
            return false;
        };
        if state.has_failed_against(observer) {
            debug!(%combatant_id, %observer, %outcome, "ignoring outcome after failed sneak roll");
            return false;
        }
        let failed = outcome.is_failure();
        state.roll_outcomes.insert(
            observer,
            RollRecord {
                failed,
                last_outcome: outcome,
            },
        );
        let recorded = if failed {
            RelationState::Observed
        } else {
            proposed
        };
        state.observer_states.insert(observer, recorded);
        true
    }

    /// Resolve and destroy a combatant's tracking state at turn end.
    ///
    /// Every deferred check is evaluated against the actor's *current*
    /// position through the engine, each observer isolated so one failure
    /// does not block the rest. The full proposal list goes to the
    /// presenter; only confirmed proposals that need application are
    /// written back, pinned with `OverrideSource::Automatic`. The state is
    /// removed before evaluation begins, so it is gone on every exit path.
    pub async fn on_turn_ended(
        &mut self,
        scene: &mut Scene,
        manager: &OverrideManager,
        role: Role,
        combatant_id: CombatantId,
    ) -> Result<Vec<Proposal>, SneakError> {
        let Some(state) = self.states.remove(&combatant_id) else {
            return Ok(Vec::new());
        };
        debug!(%combatant_id, deferred = state.deferred_checks.len(), "resolving sneak turn");
        if state.deferred_checks.is_empty() {
            return Ok(Vec::new());
        }

        let actor = state.actor;
        let Some(actor_token) = scene.token(actor) else {
            return Err(SneakError::MissingActor(actor));
        };
        let actor_name = actor_token.name.clone();

        let mut proposals = Vec::new();
        for (&observer, check) in &state.deferred_checks {
            let relation = match self.engine.compute_relation(observer, actor).await {
                Ok(r) => r,
                Err(err) => {
                    warn!(%observer, %actor, %err, "deferred relation evaluation failed");
                    continue;
                }
            };
            let cover = match self.engine.compute_cover(observer, actor).await {
                Ok(c) => c,
                Err(err) => {
                    warn!(%observer, %actor, %err, "deferred cover evaluation failed");
                    continue;
                }
            };

            let qualified =
                end_position_qualifies(check.original_outcome.start_relation(), relation, cover);
            let proposed = if state.has_failed_against(observer) {
                // Failed sneak roll: the observer keeps seeing the actor.
                RelationState::Observed
            } else if qualified {
                relation
            } else {
                RelationState::Observed
            };
            let previous = manager.store().relation(scene, observer, actor);
            proposals.push(Proposal {
                observer,
                observer_name: scene.name_of(observer),
                previous,
                proposed,
                position_qualified: qualified,
                needs_application: proposed != previous,
            });
        }

        let confirmed = match self
            .presenter
            .present_deferred_results(actor, &actor_name, proposals.clone())
            .await
        {
            Ok(confirmed) => confirmed,
            Err(err) => {
                warn!(%actor, %err, "deferred result presentation failed; nothing applied");
                return Ok(proposals);
            }
        };

        for proposal in confirmed.iter().filter(|p| p.needs_application) {
            manager
                .apply_override(
                    scene,
                    role,
                    proposal.observer,
                    &[actor],
                    RelationWrite::Pinned(proposal.proposed),
                    None,
                    OverrideSource::Automatic,
                )
                .await;
        }
        Ok(proposals)
    }

    /// Housekeeping sweep: resolve every tracking state whose round/turn no
    /// longer matches the encounter.
    ///
    /// This is the fallback for a missed turn-end signal; a round or turn
    /// change is a hard cancellation for any state it leaves behind.
    /// Per-state failures are logged and the sweep continues.
    pub async fn on_encounter_updated(
        &mut self,
        scene: &mut Scene,
        encounter: &EncounterState,
        manager: &OverrideManager,
        role: Role,
        change: EncounterChange,
    ) {
        if !change.advanced() && encounter.active {
            return;
        }
        let stale: Vec<CombatantId> = self
            .states
            .values()
            .filter(|s| !s.active || !encounter.is_current(s.round, s.turn))
            .map(|s| s.combatant_id)
            .collect();
        for combatant_id in stale {
            if let Err(err) = self.on_turn_ended(scene, manager, role, combatant_id).await {
                warn!(%combatant_id, %err, "sneak sweep resolution failed");
            }
        }
    }
}
