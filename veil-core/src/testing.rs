//! Testing utilities for the perception core.
//!
//! This module provides deterministic stand-ins for every external
//! collaborator, plus a `TestHarness` that wires a small scene and
//! encounter together for scenario tests:
//! - `MockRelationEngine` with scriptable per-pair answers and failures
//! - `MemoryPersister` / `FailingPersister`
//! - `RecordingNotifier`
//! - `ConfirmAllPresenter` / `ConfirmNonePresenter`

use crate::aggregate::AggregationPolicy;
use crate::encounter::{Combatant, CombatantId, EncounterState};
use crate::engine::{
    CoverChange, DeferredPresenter, EngineError, MapKind, Notifier, Persister, Proposal,
    RelationChange, RelationEngine,
};
use crate::overrides::OverrideManager;
use crate::relation::{CoverState, RelationState};
use crate::scene::{Scene, Token, TokenId};
use crate::session::{PerceptionConfig, PerceptionSession};
use crate::store::RelationStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A scripted automatic engine.
///
/// Returns a fixed default answer, with optional per-pair answers and
/// per-observer failures layered on top.
pub struct MockRelationEngine {
    inner: Mutex<MockEngineState>,
}

struct MockEngineState {
    relation: RelationState,
    cover: CoverState,
    pairs: HashMap<(TokenId, TokenId), (RelationState, CoverState)>,
    failing_observers: Vec<TokenId>,
}

impl MockRelationEngine {
    /// Engine that answers every pair with the same values.
    pub fn returning(relation: RelationState, cover: CoverState) -> Self {
        Self {
            inner: Mutex::new(MockEngineState {
                relation,
                cover,
                pairs: HashMap::new(),
                failing_observers: Vec::new(),
            }),
        }
    }

    /// Replace the default answer.
    pub fn set_response(&self, relation: RelationState, cover: CoverState) {
        let mut inner = self.inner.lock().unwrap();
        inner.relation = relation;
        inner.cover = cover;
    }

    /// Script a specific pair.
    pub fn set_pair(
        &self,
        observer: TokenId,
        target: TokenId,
        relation: RelationState,
        cover: CoverState,
    ) {
        self.inner
            .lock()
            .unwrap()
            .pairs
            .insert((observer, target), (relation, cover));
    }

    /// Make every computation for `observer` fail.
    pub fn fail_for_observer(&self, observer: TokenId) {
        self.inner.lock().unwrap().failing_observers.push(observer);
    }

    fn answer(
        &self,
        observer: TokenId,
        target: TokenId,
    ) -> Result<(RelationState, CoverState), EngineError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing_observers.contains(&observer) {
            return Err(EngineError::Evaluation {
                observer,
                reason: "scripted failure".to_string(),
            });
        }
        Ok(inner
            .pairs
            .get(&(observer, target))
            .copied()
            .unwrap_or((inner.relation, inner.cover)))
    }
}

#[async_trait]
impl RelationEngine for MockRelationEngine {
    async fn compute_relation(
        &self,
        observer: TokenId,
        target: TokenId,
    ) -> Result<RelationState, EngineError> {
        self.answer(observer, target).map(|(r, _)| r)
    }

    async fn compute_cover(
        &self,
        observer: TokenId,
        target: TokenId,
    ) -> Result<CoverState, EngineError> {
        self.answer(observer, target).map(|(_, c)| c)
    }
}

/// Persister that keeps the latest snapshot per (entity, kind) in memory.
#[derive(Default)]
pub struct MemoryPersister {
    writes: Mutex<HashMap<(TokenId, MapKind), serde_json::Value>>,
    write_count: Mutex<usize>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        *self.write_count.lock().unwrap()
    }

    pub fn snapshot(&self, entity: TokenId, kind: MapKind) -> Option<serde_json::Value> {
        self.writes.lock().unwrap().get(&(entity, kind)).cloned()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn persist(
        &self,
        entity: TokenId,
        kind: MapKind,
        map: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.writes.lock().unwrap().insert((entity, kind), map);
        *self.write_count.lock().unwrap() += 1;
        Ok(())
    }
}

/// Persister whose every upsert fails.
pub struct FailingPersister;

#[async_trait]
impl Persister for FailingPersister {
    async fn persist(
        &self,
        _entity: TokenId,
        _kind: MapKind,
        _map: serde_json::Value,
    ) -> Result<(), EngineError> {
        Err(EngineError::Persistence("scripted failure".to_string()))
    }
}

/// Notifier that records every broadcast for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    relations: Mutex<Vec<RelationChange>>,
    covers: Mutex<Vec<CoverChange>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation_changes(&self) -> Vec<RelationChange> {
        self.relations.lock().unwrap().clone()
    }

    pub fn cover_changes(&self) -> Vec<CoverChange> {
        self.covers.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn relation_changed(&self, change: &RelationChange) {
        self.relations.lock().unwrap().push(*change);
    }

    fn cover_changed(&self, change: &CoverChange) {
        self.covers.lock().unwrap().push(*change);
    }
}

/// Presenter that confirms every proposal, recording each batch it saw.
#[derive(Default)]
pub struct ConfirmAllPresenter {
    batches: Mutex<Vec<Vec<Proposal>>>,
}

impl ConfirmAllPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The proposal batches shown so far.
    pub fn presented(&self) -> Vec<Vec<Proposal>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeferredPresenter for ConfirmAllPresenter {
    async fn present_deferred_results(
        &self,
        _actor: TokenId,
        _actor_name: &str,
        proposals: Vec<Proposal>,
    ) -> Result<Vec<Proposal>, EngineError> {
        self.batches.lock().unwrap().push(proposals.clone());
        Ok(proposals)
    }
}

/// Presenter that rejects every proposal.
#[derive(Default)]
pub struct ConfirmNonePresenter;

#[async_trait]
impl DeferredPresenter for ConfirmNonePresenter {
    async fn present_deferred_results(
        &self,
        _actor: TokenId,
        _actor_name: &str,
        _proposals: Vec<Proposal>,
    ) -> Result<Vec<Proposal>, EngineError> {
        Ok(Vec::new())
    }
}

/// A wired-up session over mocks, for scenario tests.
pub struct TestHarness {
    pub session: PerceptionSession,
    pub engine: Arc<MockRelationEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub persister: Arc<MemoryPersister>,
    pub presenter: Arc<ConfirmAllPresenter>,
}

impl TestHarness {
    /// Harness whose engine reports everything plainly observed.
    pub fn new() -> Self {
        Self::with_engine(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ))
    }

    pub fn with_engine(engine: MockRelationEngine) -> Self {
        let engine = Arc::new(engine);
        let notifier = Arc::new(RecordingNotifier::new());
        let persister = Arc::new(MemoryPersister::new());
        let presenter = Arc::new(ConfirmAllPresenter::new());
        let session = PerceptionSession::new(
            PerceptionConfig::new(),
            engine.clone(),
            persister.clone(),
            notifier.clone(),
            presenter.clone(),
        );
        Self {
            session,
            engine,
            notifier,
            persister,
            presenter,
        }
    }

    /// Add a token by name and return its id.
    pub fn add_token(&mut self, name: &str) -> TokenId {
        self.session.add_token(Token::new(name))
    }

    /// Add a chained-sneak-capable token by name.
    pub fn add_sneak(&mut self, name: &str) -> TokenId {
        self.session.add_token(Token::new(name).with_chain_sneak())
    }

    /// Start an encounter containing the given tokens, in argument order.
    pub fn start_encounter(&mut self, tokens: &[TokenId]) -> Vec<CombatantId> {
        let names: Vec<String> = tokens
            .iter()
            .map(|&t| self.session.scene().name_of(t))
            .collect();
        let encounter = self.session.start_encounter();
        let mut ids = Vec::new();
        // Descending initiative keeps argument order as turn order.
        let mut initiative = tokens.len() as i32;
        for (token, name) in tokens.iter().zip(names) {
            ids.push(encounter.add_combatant(Combatant::new(*token, name, initiative)));
            initiative -= 1;
        }
        ids
    }

    pub fn store(&self) -> &RelationStore {
        self.session.manager().store()
    }

    pub fn manager(&self) -> &OverrideManager {
        self.session.manager()
    }

    pub fn scene(&self) -> &Scene {
        self.session.scene()
    }

    pub fn encounter(&self) -> Option<&EncounterState> {
        self.session.encounter()
    }

    pub fn aggregation(&self) -> AggregationPolicy {
        self.session.aggregation()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the relation one observer has toward a target.
#[track_caller]
pub fn assert_relation(
    harness: &TestHarness,
    observer: TokenId,
    target: TokenId,
    expected: RelationState,
) {
    let actual = harness.store().relation(harness.scene(), observer, target);
    assert_eq!(
        actual, expected,
        "Expected relation {expected}, got {actual}"
    );
}

/// Assert the cover a target has against an observer.
#[track_caller]
pub fn assert_cover(
    harness: &TestHarness,
    observer: TokenId,
    target: TokenId,
    expected: CoverState,
) {
    let actual = harness.store().cover(harness.scene(), observer, target);
    assert_eq!(actual, expected, "Expected cover {expected}, got {actual}");
}

/// Assert that an override is pinned for the pair.
#[track_caller]
pub fn assert_override_pinned(harness: &TestHarness, observer: TokenId, target: TokenId) {
    assert!(
        harness.manager().has_override(harness.scene(), observer, target),
        "Expected an override pinned for ({observer}, {target})"
    );
}

/// Assert that no override is pinned for the pair.
#[track_caller]
pub fn assert_no_override(harness: &TestHarness, observer: TokenId, target: TokenId) {
    assert!(
        !harness.manager().has_override(harness.scene(), observer, target),
        "Expected no override pinned for ({observer}, {target})"
    );
}
