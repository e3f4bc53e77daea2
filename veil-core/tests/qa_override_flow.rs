//! QA tests for the override and store flow through the public session API.
//!
//! Run with: `cargo test -p veil-core --test qa_override_flow`

use veil_core::testing::{
    assert_cover, assert_no_override, assert_override_pinned, assert_relation, MockRelationEngine,
    TestHarness,
};
use veil_core::{CoverState, OverrideSource, RelationState, RelationWrite};

// =============================================================================
// TEST 1: Manual pin beats the automatic engine until released
// =============================================================================

#[tokio::test]
async fn test_pin_suppresses_recompute_until_released() {
    let mut harness = TestHarness::with_engine(MockRelationEngine::returning(
        RelationState::Observed,
        CoverState::None,
    ));
    let watcher = harness.add_token("Watcher");
    let skulker = harness.add_token("Skulker");

    harness
        .session
        .apply_override(
            watcher,
            &[skulker],
            RelationWrite::Pinned(RelationState::Undetected),
            Some(CoverState::Greater),
        )
        .await;
    assert_relation(&harness, watcher, skulker, RelationState::Undetected);
    assert_cover(&harness, watcher, skulker, CoverState::Greater);
    assert_override_pinned(&harness, watcher, skulker);

    let record = harness.session.override_for(watcher, skulker).unwrap();
    assert_eq!(record.source, OverrideSource::Manual);

    // Geometry changed; the engine wants Observed back, but the pin holds.
    harness.session.refresh(watcher, skulker).await;
    assert_relation(&harness, watcher, skulker, RelationState::Undetected);

    // Releasing the pair hands it back to the engine.
    harness
        .session
        .apply_override(watcher, &[skulker], RelationWrite::Delegated, None)
        .await;
    assert_no_override(&harness, watcher, skulker);
    assert_relation(&harness, watcher, skulker, RelationState::Observed);
}

// =============================================================================
// TEST 2: A delegated write can never be read back
// =============================================================================

#[tokio::test]
async fn test_delegated_write_reads_as_engine_value() {
    let mut harness = TestHarness::with_engine(MockRelationEngine::returning(
        RelationState::Concealed,
        CoverState::Lesser,
    ));
    let watcher = harness.add_token("Watcher");
    let skulker = harness.add_token("Skulker");

    harness
        .session
        .apply_override(
            watcher,
            &[skulker],
            RelationWrite::Pinned(RelationState::Hidden),
            None,
        )
        .await;
    harness
        .session
        .apply_override(watcher, &[skulker], RelationWrite::Delegated, None)
        .await;

    // The read reflects the engine's answer; there is no sentinel value.
    assert_relation(&harness, watcher, skulker, RelationState::Concealed);
    assert_cover(&harness, watcher, skulker, CoverState::Lesser);
}

// =============================================================================
// TEST 3: Deleting a token cascades through every map and record
// =============================================================================

#[tokio::test]
async fn test_delete_token_purges_everything_referencing_it() {
    let mut harness = TestHarness::new();
    let watcher = harness.add_token("Watcher");
    let skulker = harness.add_token("Skulker");
    let bystander = harness.add_token("Bystander");

    // Skulker appears on both sides: as target of two pins, as observer of
    // one, and in plain relation/cover entries.
    harness
        .session
        .apply_override(
            watcher,
            &[skulker],
            RelationWrite::Pinned(RelationState::Hidden),
            None,
        )
        .await;
    harness
        .session
        .apply_override(
            bystander,
            &[skulker],
            RelationWrite::Pinned(RelationState::Undetected),
            None,
        )
        .await;
    harness
        .session
        .apply_override(
            skulker,
            &[bystander],
            RelationWrite::Pinned(RelationState::Concealed),
            None,
        )
        .await;
    harness
        .session
        .set_cover(watcher, skulker, CoverState::Standard)
        .await;

    harness.session.delete_token(skulker).await;

    assert!(!harness.scene().contains(skulker));
    for token in harness.scene().tokens() {
        assert!(!token.relations.contains_key(&skulker));
        assert!(!token.cover.contains_key(&skulker));
        assert!(!token.incoming_overrides.contains_key(&skulker));
    }
    assert_relation(&harness, watcher, skulker, RelationState::Observed);
    assert_cover(&harness, watcher, skulker, CoverState::None);
}

// =============================================================================
// TEST 4: Bulk removal requests recomputation per affected pair
// =============================================================================

#[tokio::test]
async fn test_remove_all_involving_recomputes_affected_pairs() {
    let engine = MockRelationEngine::returning(RelationState::Observed, CoverState::None);
    let mut harness = TestHarness::with_engine(engine);
    let watcher = harness.add_token("Watcher");
    let skulker = harness.add_token("Skulker");
    let bystander = harness.add_token("Bystander");

    harness
        .engine
        .set_pair(watcher, skulker, RelationState::Concealed, CoverState::Lesser);

    harness
        .session
        .apply_override(
            watcher,
            &[skulker],
            RelationWrite::Pinned(RelationState::Undetected),
            None,
        )
        .await;
    harness
        .session
        .apply_override(
            skulker,
            &[bystander],
            RelationWrite::Pinned(RelationState::Hidden),
            None,
        )
        .await;

    let removed = harness.session.remove_all_overrides_involving(skulker).await;
    assert_eq!(removed, 2);

    // Both pairs were handed back to the engine.
    assert_no_override(&harness, watcher, skulker);
    assert_no_override(&harness, skulker, bystander);
    assert_relation(&harness, watcher, skulker, RelationState::Concealed);
    assert_cover(&harness, watcher, skulker, CoverState::Lesser);
    assert_relation(&harness, skulker, bystander, RelationState::Observed);
}

// =============================================================================
// TEST 5: Unchanged writes emit nothing downstream
// =============================================================================

#[tokio::test]
async fn test_diff_check_skips_redundant_persistence_and_broadcast() {
    let mut harness = TestHarness::new();
    let watcher = harness.add_token("Watcher");
    let skulker = harness.add_token("Skulker");

    harness
        .session
        .set_relation(watcher, skulker, RelationState::Hidden)
        .await;
    let notifications = harness.notifier.relation_changes().len();
    let writes = harness.persister.write_count();

    // Same value again: no new notification, no new upsert.
    harness
        .session
        .set_relation(watcher, skulker, RelationState::Hidden)
        .await;
    assert_eq!(harness.notifier.relation_changes().len(), notifications);
    assert_eq!(harness.persister.write_count(), writes);

    let change = harness.notifier.relation_changes()[0];
    assert_eq!(change.observer, watcher);
    assert_eq!(change.target, skulker);
    assert_eq!(change.state, RelationState::Hidden);
}

// =============================================================================
// TEST 6: Aggregated reads across a controller's observers
// =============================================================================

#[tokio::test]
async fn test_controller_reads_best_perspective() {
    let mut harness = TestHarness::new();
    let eyes = harness.add_token("Eyes");
    let familiar = harness.add_token("Familiar");
    let prey = harness.add_token("Prey");

    harness
        .session
        .set_relation(eyes, prey, RelationState::Undetected)
        .await;
    harness
        .session
        .set_relation(familiar, prey, RelationState::Hidden)
        .await;

    assert_eq!(
        harness.session.aggregated_relation(&[eyes, familiar], prey),
        RelationState::Hidden
    );
    // Identity for a single observer.
    assert_eq!(
        harness.session.aggregated_relation(&[eyes], prey),
        RelationState::Undetected
    );
}
