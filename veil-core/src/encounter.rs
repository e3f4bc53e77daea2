//! Turn-structured encounter state.
//!
//! Adapted combat scheduling: an encounter is a round counter plus an
//! initiative-ordered list of combatants with a turn cursor. The perception
//! core only cares about "whose turn is it, in which round", which is all a
//! turn-scoped tracker needs to know whether its state is still current.

use crate::scene::TokenId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a combatant slot in the encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CombatantId(pub Uuid);

impl CombatantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CombatantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CombatantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One participant slot in the initiative order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combatant {
    pub id: CombatantId,
    pub token_id: TokenId,
    pub name: String,
    pub initiative: i32,
}

impl Combatant {
    pub fn new(token_id: TokenId, name: impl Into<String>, initiative: i32) -> Self {
        Self {
            id: CombatantId::new(),
            token_id,
            name: name.into(),
            initiative,
        }
    }
}

/// Which scheduling fields moved in an encounter update.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EncounterChange {
    pub round_changed: bool,
    pub turn_changed: bool,
}

impl EncounterChange {
    pub fn advanced(&self) -> bool {
        self.round_changed || self.turn_changed
    }
}

/// The round/turn scheduling state of an active encounter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterState {
    pub active: bool,
    pub round: u32,
    pub turn_index: usize,
    pub combatants: Vec<Combatant>,
}

impl EncounterState {
    pub fn new() -> Self {
        Self {
            active: true,
            round: 1,
            turn_index: 0,
            combatants: Vec::new(),
        }
    }

    /// Insert a combatant, keeping the list sorted by initiative.
    pub fn add_combatant(&mut self, combatant: Combatant) -> CombatantId {
        let id = combatant.id;
        self.combatants.push(combatant);
        self.combatants
            .sort_by(|a, b| b.initiative.cmp(&a.initiative));
        id
    }

    pub fn current_combatant(&self) -> Option<&Combatant> {
        self.combatants.get(self.turn_index)
    }

    pub fn combatant(&self, id: CombatantId) -> Option<&Combatant> {
        self.combatants.iter().find(|c| c.id == id)
    }

    /// Advance the turn cursor, wrapping into the next round.
    pub fn next_turn(&mut self) -> EncounterChange {
        self.turn_index += 1;
        let mut change = EncounterChange {
            round_changed: false,
            turn_changed: true,
        };
        if self.turn_index >= self.combatants.len() {
            self.turn_index = 0;
            self.round += 1;
            change.round_changed = true;
        }
        change
    }

    pub fn end(&mut self) {
        self.active = false;
    }

    /// True when (round, turn) still addresses the current slot.
    pub fn is_current(&self, round: u32, turn_index: usize) -> bool {
        self.active && self.round == round && self.turn_index == turn_index
    }

    /// True when it is this combatant's turn right now.
    pub fn is_turn_of(&self, id: CombatantId) -> bool {
        self.active && self.current_combatant().map(|c| c.id) == Some(id)
    }
}

impl Default for EncounterState {
    fn default() -> Self {
        Self::new()
    }
}
