//! Manual override records and the precedence rules around them.
//!
//! An override pins the relation (and optionally cover) one observer has
//! toward a target, suppressing the automatic engine for that pair until
//! the pin is explicitly removed or replaced with a delegated write.
//! Records live on the *target* token keyed by observer id, so deleting a
//! target makes all of its incoming overrides locally discoverable.

use crate::engine::{MapKind, RelationEngine};
use crate::relation::{CoverState, RelationState, RelationWrite};
use crate::scene::{Scene, TokenId};
use crate::store::{RelationStore, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Who pinned an override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    /// Explicit operator action.
    Manual,
    /// A confirmed result written back by the core itself, e.g. turn-end
    /// sneak resolution.
    Automatic,
}

/// A pinned relation value for one (observer, target) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub observer: TokenId,
    pub target: TokenId,
    pub state: RelationState,
    pub expected_cover: Option<CoverState>,
    pub source: OverrideSource,
    pub applied_at: DateTime<Utc>,
}

/// Releases the reaction-suspension flag when the write that raised it
/// completes, on every exit path.
pub(crate) struct ReactionGuard<'a>(&'a AtomicBool);

impl Drop for ReactionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Creates and removes pinned overrides on top of [`RelationStore`], and
/// owns the refresh path the automatic engine's change detection goes
/// through.
pub struct OverrideManager {
    store: RelationStore,
    engine: Arc<dyn RelationEngine>,
    /// Advisory flag, not a lock: raised while an override write (and its
    /// persistence) is in flight so the engine's change detection does not
    /// immediately recompute and overwrite the just-applied value. At most
    /// one such write is in flight at a time under the single-threaded
    /// cooperative model.
    reactions_suspended: AtomicBool,
}

impl OverrideManager {
    pub fn new(store: RelationStore, engine: Arc<dyn RelationEngine>) -> Self {
        Self {
            store,
            engine,
            reactions_suspended: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &RelationStore {
        &self.store
    }

    /// Whether a write is currently holding the reaction-suspension flag.
    pub fn reactions_suspended(&self) -> bool {
        self.reactions_suspended.load(Ordering::Relaxed)
    }

    pub(crate) fn suspend(&self) -> ReactionGuard<'_> {
        self.reactions_suspended.store(true, Ordering::Relaxed);
        ReactionGuard(&self.reactions_suspended)
    }

    /// Write a relation value directly, holding the reaction-suspension
    /// flag across the store's persistence await so a refresh interleaved
    /// there cannot overwrite the value before it lands.
    pub async fn set_relation(
        &self,
        scene: &mut Scene,
        role: Role,
        observer: TokenId,
        target: TokenId,
        state: RelationState,
    ) -> bool {
        let _guard = self.suspend();
        self.store
            .set_relation(scene, role, observer, target, state)
            .await
    }

    /// Write a cover value directly, under the same suspension rules as
    /// [`set_relation`](Self::set_relation).
    pub async fn set_cover(
        &self,
        scene: &mut Scene,
        role: Role,
        observer: TokenId,
        target: TokenId,
        state: CoverState,
    ) -> bool {
        let _guard = self.suspend();
        self.store
            .set_cover(scene, role, observer, target, state)
            .await
    }

    /// The override pinned for a pair, if any.
    pub fn override_for(
        &self,
        scene: &Scene,
        observer: TokenId,
        target: TokenId,
    ) -> Option<OverrideRecord> {
        scene
            .token(target)
            .and_then(|t| t.incoming_overrides.get(&observer).cloned())
    }

    pub fn has_override(&self, scene: &Scene, observer: TokenId, target: TokenId) -> bool {
        self.override_for(scene, observer, target).is_some()
    }

    /// Apply a write instruction from one observer against each target.
    ///
    /// A `Pinned` write upserts the record on the target and immediately
    /// writes through the store; a `Delegated` write removes the record and
    /// hands the pair back to the automatic engine, which re-establishes a
    /// value on the refresh issued here. Per-target failures are isolated.
    /// Returns the number of targets whose records changed.
    pub async fn apply_override(
        &self,
        scene: &mut Scene,
        role: Role,
        observer: TokenId,
        targets: &[TokenId],
        write: RelationWrite,
        expected_cover: Option<CoverState>,
        source: OverrideSource,
    ) -> usize {
        let mut applied = 0;
        for &target in targets {
            match write {
                RelationWrite::Pinned(state) => {
                    let _guard = self.suspend();
                    let Some(token) = scene.token_mut(target) else {
                        warn!(%observer, %target, "override against missing target");
                        continue;
                    };
                    token.incoming_overrides.insert(
                        observer,
                        OverrideRecord {
                            observer,
                            target,
                            state,
                            expected_cover,
                            source,
                            applied_at: Utc::now(),
                        },
                    );
                    self.store
                        .persist_map(scene, target, MapKind::Overrides)
                        .await;
                    self.store
                        .set_relation(scene, role, observer, target, state)
                        .await;
                    if let Some(cover) = expected_cover {
                        self.store
                            .set_cover(scene, role, observer, target, cover)
                            .await;
                    }
                    debug!(%observer, %target, %state, ?source, "override pinned");
                    applied += 1;
                }
                RelationWrite::Delegated => {
                    if self.remove_override(scene, observer, target).await {
                        applied += 1;
                    }
                    self.refresh(scene, role, observer, target).await;
                }
            }
        }
        applied
    }

    /// Delete the override record for a pair, if present. Does not touch
    /// the stored relation or cover value.
    pub async fn remove_override(
        &self,
        scene: &mut Scene,
        observer: TokenId,
        target: TokenId,
    ) -> bool {
        let Some(token) = scene.token_mut(target) else {
            return false;
        };
        if token.incoming_overrides.remove(&observer).is_none() {
            return false;
        }
        debug!(%observer, %target, "override removed");
        self.store
            .persist_map(scene, target, MapKind::Overrides)
            .await;
        true
    }

    /// Remove every override record naming `id` on either side, then
    /// request a recalculation for every affected pair so the automatic
    /// engine can re-establish a value.
    ///
    /// Tolerates an empty registry; a failure against one pair is logged
    /// and the rest still proceed.
    pub async fn remove_all_overrides_involving(
        &self,
        scene: &mut Scene,
        role: Role,
        id: TokenId,
    ) -> usize {
        let mut affected: Vec<(TokenId, TokenId)> = Vec::new();

        // `id` as target: every record pinned on it.
        if let Some(token) = scene.token_mut(id) {
            for observer in token.incoming_overrides.keys().copied().collect::<Vec<_>>() {
                token.incoming_overrides.remove(&observer);
                affected.push((observer, id));
            }
        }
        // `id` as observer: records it pinned on everyone else.
        for token in scene.tokens_mut() {
            if token.id != id && token.incoming_overrides.remove(&id).is_some() {
                affected.push((id, token.id));
            }
        }

        for &(observer, target) in &affected {
            self.store
                .persist_map(scene, target, MapKind::Overrides)
                .await;
            self.refresh(scene, role, observer, target).await;
        }
        if !affected.is_empty() {
            debug!(%id, count = affected.len(), "removed overrides involving token");
        }
        affected.len()
    }

    /// The automatic engine's entry point for a pair whose geometry or
    /// lighting changed.
    ///
    /// Suppressed while an override record exists for the pair (the
    /// override manager is the sole writer then) and while the
    /// reaction-suspension flag is held. Engine failures are logged and the
    /// stored value is left as is.
    pub async fn refresh(&self, scene: &mut Scene, role: Role, observer: TokenId, target: TokenId) {
        if self.reactions_suspended() {
            debug!(%observer, %target, "refresh skipped: reactions suspended");
            return;
        }
        if self.has_override(scene, observer, target) {
            debug!(%observer, %target, "refresh skipped: override pinned");
            return;
        }
        match self.engine.compute_relation(observer, target).await {
            Ok(state) => {
                self.store
                    .set_relation(scene, role, observer, target, state)
                    .await;
            }
            Err(err) => warn!(%observer, %target, %err, "relation recompute failed"),
        }
        match self.engine.compute_cover(observer, target).await {
            Ok(state) => {
                self.store
                    .set_cover(scene, role, observer, target, state)
                    .await;
            }
            Err(err) => warn!(%observer, %target, %err, "cover recompute failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, Persister};
    use crate::scene::Token;
    use crate::testing::{FailingPersister, MemoryPersister, MockRelationEngine, RecordingNotifier};
    use async_trait::async_trait;
    use std::sync::{Mutex, OnceLock};

    fn manager_with(engine: MockRelationEngine) -> OverrideManager {
        let store = RelationStore::new(
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryPersister::new()),
        );
        OverrideManager::new(store, Arc::new(engine))
    }

    fn two_tokens() -> (Scene, TokenId, TokenId) {
        let mut scene = Scene::new();
        let a = scene.add_token(Token::new("Watcher"));
        let b = scene.add_token(Token::new("Skulker"));
        (scene, a, b)
    }

    #[tokio::test]
    async fn test_pinned_override_writes_through() {
        let (mut scene, a, b) = two_tokens();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ));

        let applied = mgr
            .apply_override(
                &mut scene,
                Role::Arbiter,
                a,
                &[b],
                RelationWrite::Pinned(RelationState::Hidden),
                Some(CoverState::Standard),
                OverrideSource::Manual,
            )
            .await;

        assert_eq!(applied, 1);
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Hidden);
        assert_eq!(mgr.store().cover(&scene, a, b), CoverState::Standard);

        let record = mgr.override_for(&scene, a, b).unwrap();
        assert_eq!(record.state, RelationState::Hidden);
        assert_eq!(record.source, OverrideSource::Manual);
        assert!(!mgr.reactions_suspended());
    }

    #[tokio::test]
    async fn test_delegated_write_hands_back_to_engine() {
        let (mut scene, a, b) = two_tokens();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Concealed,
            CoverState::Lesser,
        ));

        mgr.apply_override(
            &mut scene,
            Role::Arbiter,
            a,
            &[b],
            RelationWrite::Pinned(RelationState::Undetected),
            None,
            OverrideSource::Manual,
        )
        .await;
        assert!(mgr.has_override(&scene, a, b));

        mgr.apply_override(
            &mut scene,
            Role::Arbiter,
            a,
            &[b],
            RelationWrite::Delegated,
            None,
            OverrideSource::Manual,
        )
        .await;

        assert!(!mgr.has_override(&scene, a, b));
        // The engine's value is re-established; the sentinel never appears.
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Concealed);
        assert_eq!(mgr.store().cover(&scene, a, b), CoverState::Lesser);
    }

    #[tokio::test]
    async fn test_refresh_suppressed_by_pin() {
        let (mut scene, a, b) = two_tokens();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ));

        mgr.apply_override(
            &mut scene,
            Role::Arbiter,
            a,
            &[b],
            RelationWrite::Pinned(RelationState::Hidden),
            None,
            OverrideSource::Manual,
        )
        .await;

        mgr.refresh(&mut scene, Role::Arbiter, a, b).await;
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Hidden);
    }

    #[tokio::test]
    async fn test_refresh_suppressed_while_suspended() {
        let (mut scene, a, b) = two_tokens();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Undetected,
            CoverState::None,
        ));

        {
            let _guard = mgr.suspend();
            assert!(mgr.reactions_suspended());
            mgr.refresh(&mut scene, Role::Arbiter, a, b).await;
            assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Observed);
        }

        assert!(!mgr.reactions_suspended());
        mgr.refresh(&mut scene, Role::Arbiter, a, b).await;
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Undetected);
    }

    #[tokio::test]
    async fn test_remove_all_overrides_involving_both_sides() {
        let (mut scene, a, b) = two_tokens();
        let c = scene.add_token(Token::new("Bystander"));
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ));

        // b as target of a, and b as observer of c.
        mgr.apply_override(
            &mut scene,
            Role::Arbiter,
            a,
            &[b],
            RelationWrite::Pinned(RelationState::Hidden),
            None,
            OverrideSource::Manual,
        )
        .await;
        mgr.apply_override(
            &mut scene,
            Role::Arbiter,
            b,
            &[c],
            RelationWrite::Pinned(RelationState::Undetected),
            None,
            OverrideSource::Manual,
        )
        .await;

        let removed = mgr
            .remove_all_overrides_involving(&mut scene, Role::Arbiter, b)
            .await;
        assert_eq!(removed, 2);
        assert!(!mgr.has_override(&scene, a, b));
        assert!(!mgr.has_override(&scene, b, c));

        // The recompute re-established the engine's values.
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Observed);
        assert_eq!(mgr.store().relation(&scene, b, c), RelationState::Observed);
    }

    #[tokio::test]
    async fn test_remove_all_tolerates_empty_scene() {
        let mut scene = Scene::new();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ));
        let removed = mgr
            .remove_all_overrides_involving(&mut scene, Role::Arbiter, TokenId::new())
            .await;
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_flag_released_after_failing_persist() {
        let (mut scene, a, b) = two_tokens();
        let store = RelationStore::new(
            Arc::new(RecordingNotifier::new()),
            Arc::new(FailingPersister),
        );
        let mgr = OverrideManager::new(
            store,
            Arc::new(MockRelationEngine::returning(
                RelationState::Observed,
                CoverState::None,
            )),
        );

        let applied = mgr
            .apply_override(
                &mut scene,
                Role::Arbiter,
                a,
                &[b],
                RelationWrite::Pinned(RelationState::Hidden),
                None,
                OverrideSource::Manual,
            )
            .await;

        // Every upsert failed, yet the guard dropped and the in-memory
        // value stuck.
        assert_eq!(applied, 1);
        assert!(!mgr.reactions_suspended());
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Hidden);
        assert!(mgr.has_override(&scene, a, b));
    }

    /// Records the suspension flag as observed from inside each persistence
    /// upsert.
    #[derive(Default)]
    struct FlagRecordingPersister {
        manager: OnceLock<Arc<OverrideManager>>,
        observed: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Persister for FlagRecordingPersister {
        async fn persist(
            &self,
            _entity: TokenId,
            _kind: MapKind,
            _map: serde_json::Value,
        ) -> Result<(), EngineError> {
            if let Some(mgr) = self.manager.get() {
                self.observed.lock().unwrap().push(mgr.reactions_suspended());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_direct_write_holds_flag_across_persist() {
        let (mut scene, a, b) = two_tokens();
        let persister = Arc::new(FlagRecordingPersister::default());
        let store = RelationStore::new(Arc::new(RecordingNotifier::new()), persister.clone());
        let mgr = Arc::new(OverrideManager::new(
            store,
            Arc::new(MockRelationEngine::returning(
                RelationState::Observed,
                CoverState::None,
            )),
        ));
        let _ = persister.manager.set(mgr.clone());

        let changed = mgr
            .set_relation(&mut scene, Role::Arbiter, a, b, RelationState::Concealed)
            .await;

        assert!(changed);
        assert_eq!(persister.observed.lock().unwrap().as_slice(), &[true]);
        assert!(!mgr.reactions_suspended());
        assert_eq!(mgr.store().relation(&scene, a, b), RelationState::Concealed);
    }

    #[tokio::test]
    async fn test_remove_override_noop_when_absent() {
        let (mut scene, a, b) = two_tokens();
        let mgr = manager_with(MockRelationEngine::returning(
            RelationState::Observed,
            CoverState::None,
        ));
        assert!(!mgr.remove_override(&mut scene, a, b).await);
    }
}
