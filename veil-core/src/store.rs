//! Per-observer relation and cover stores.
//!
//! The store is an engine over borrowed scene state: every token owns its
//! relation/cover maps, and the store applies the write rules (privilege
//! gating, diff checks, persistence, and change broadcast) without holding
//! any map data itself.

use crate::engine::{CoverChange, MapKind, Notifier, Persister, RelationChange};
use crate::relation::{CoverState, RelationState};
use crate::scene::{Scene, TokenId};
use std::sync::Arc;
use tracing::{debug, warn};

/// The privilege level of a caller attempting a perception write.
///
/// Only the session arbiter may mutate any token's maps; writes from other
/// roles are dropped with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Arbiter,
    Player,
}

impl Role {
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Arbiter)
    }
}

/// Read/write access to the per-observer relation and cover maps.
#[derive(Clone)]
pub struct RelationStore {
    notifier: Arc<dyn Notifier>,
    persister: Arc<dyn Persister>,
}

impl RelationStore {
    pub fn new(notifier: Arc<dyn Notifier>, persister: Arc<dyn Persister>) -> Self {
        Self {
            notifier,
            persister,
        }
    }

    /// How `observer` currently perceives `target`. Absent entries (and
    /// absent tokens) read as the default, `Observed`.
    pub fn relation(&self, scene: &Scene, observer: TokenId, target: TokenId) -> RelationState {
        scene
            .token(observer)
            .and_then(|t| t.relations.get(&target).copied())
            .unwrap_or_default()
    }

    /// Cover `target` has against `observer`. Absent entries read as no
    /// cover.
    pub fn cover(&self, scene: &Scene, observer: TokenId, target: TokenId) -> CoverState {
        scene
            .token(observer)
            .and_then(|t| t.cover.get(&target).copied())
            .unwrap_or_default()
    }

    /// Write `observer`'s relation toward `target`.
    ///
    /// No-op when the value is unchanged, so redundant persistence writes
    /// and downstream notifications are skipped. Returns whether the map
    /// changed.
    pub async fn set_relation(
        &self,
        scene: &mut Scene,
        role: Role,
        observer: TokenId,
        target: TokenId,
        state: RelationState,
    ) -> bool {
        if !role.is_privileged() {
            warn!(%observer, %target, %state, "dropping relation write from unprivileged caller");
            return false;
        }
        if self.relation(scene, observer, target) == state {
            return false;
        }
        let Some(token) = scene.token_mut(observer) else {
            warn!(%observer, "relation write against missing observer");
            return false;
        };
        if state == RelationState::default() {
            token.relations.remove(&target);
        } else {
            token.relations.insert(target, state);
        }
        debug!(%observer, %target, %state, "relation updated");

        self.persist_map(scene, observer, MapKind::Relation).await;
        self.notifier.relation_changed(&RelationChange {
            observer,
            target,
            state,
        });
        true
    }

    /// Write `observer`'s cover reading for `target`. Same rules as
    /// [`set_relation`](Self::set_relation).
    pub async fn set_cover(
        &self,
        scene: &mut Scene,
        role: Role,
        observer: TokenId,
        target: TokenId,
        state: CoverState,
    ) -> bool {
        if !role.is_privileged() {
            warn!(%observer, %target, %state, "dropping cover write from unprivileged caller");
            return false;
        }
        if self.cover(scene, observer, target) == state {
            return false;
        }
        let Some(token) = scene.token_mut(observer) else {
            warn!(%observer, "cover write against missing observer");
            return false;
        };
        if state == CoverState::default() {
            token.cover.remove(&target);
        } else {
            token.cover.insert(target, state);
        }
        debug!(%observer, %target, %state, "cover updated");

        self.persist_map(scene, observer, MapKind::Cover).await;
        self.notifier.cover_changed(&CoverChange {
            observer,
            target,
            state,
        });
        true
    }

    /// Remove `id`'s own maps and every other token's entry for `id`,
    /// including override records where `id` is the observer. Surviving
    /// tokens whose maps changed are re-persisted, best effort, so no
    /// durable row keeps an entry for the deleted token. Called exactly
    /// once from the deletion path; records pinned on `id` as target die
    /// with the token itself.
    pub async fn purge_token(&self, scene: &mut Scene, id: TokenId) {
        if let Some(token) = scene.token_mut(id) {
            token.relations.clear();
            token.cover.clear();
            token.incoming_overrides.clear();
        }
        let mut touched: Vec<(TokenId, MapKind)> = Vec::new();
        for token in scene.tokens_mut() {
            if token.id == id {
                continue;
            }
            if token.relations.remove(&id).is_some() {
                touched.push((token.id, MapKind::Relation));
            }
            if token.cover.remove(&id).is_some() {
                touched.push((token.id, MapKind::Cover));
            }
            if token.incoming_overrides.remove(&id).is_some() {
                touched.push((token.id, MapKind::Overrides));
            }
        }
        for (owner, kind) in touched {
            self.persist_map(scene, owner, kind).await;
        }
        debug!(%id, "purged perception state for token");
    }

    /// Snapshot one of `observer`'s maps and hand it to the persister.
    ///
    /// A failed upsert is logged and otherwise ignored: the in-memory value
    /// stays authoritative for the session and the map is written again in
    /// full on the next change.
    pub(crate) async fn persist_map(&self, scene: &Scene, observer: TokenId, kind: MapKind) {
        let Some(token) = scene.token(observer) else {
            return;
        };
        let snapshot = match kind {
            MapKind::Relation => serde_json::to_value(&token.relations),
            MapKind::Cover => serde_json::to_value(&token.cover),
            MapKind::Overrides => serde_json::to_value(&token.incoming_overrides),
        };
        match snapshot {
            Ok(map) => {
                if let Err(err) = self.persister.persist(observer, kind, map).await {
                    warn!(%observer, ?kind, %err, "persistence failed; keeping in-memory value");
                }
            }
            Err(err) => {
                warn!(%observer, ?kind, %err, "could not serialize map for persistence");
            }
        }
    }
}
