//! Scene and token model.
//!
//! A [`Scene`] owns every token in play. Each token carries, besides its
//! own identity and position, the perception bookkeeping attached to it:
//! the relation and cover maps it owns as an *observer*, and the override
//! records pinned against it as a *target* (a reverse edge, so deleting a
//! token makes all of its incoming overrides locally discoverable).

use crate::overrides::OverrideRecord;
use crate::relation::{CoverState, RelationState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a token in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token's position on the scene, in grid units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An observer or target participant in the encounter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub name: String,
    pub position: Position,

    /// Can chain several sneak actions in one turn behind a single
    /// end-of-turn check.
    pub chain_sneak: bool,

    /// Relation map owned by this token as observer: target id to how this
    /// token perceives it. Absent entry reads as `Observed`.
    pub relations: HashMap<TokenId, RelationState>,

    /// Cover map owned by this token as observer. Absent entry reads as
    /// `CoverState::None`.
    pub cover: HashMap<TokenId, CoverState>,

    /// Overrides pinned against this token as target, keyed by observer id.
    /// At most one record per observer.
    pub incoming_overrides: HashMap<TokenId, OverrideRecord>,
}

impl Token {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TokenId::new(),
            name: name.into(),
            position: Position::default(),
            chain_sneak: false,
            relations: HashMap::new(),
            cover: HashMap::new(),
            incoming_overrides: HashMap::new(),
        }
    }

    /// Set the starting position.
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    /// Grant the chained-sneak capability.
    pub fn with_chain_sneak(mut self) -> Self {
        self.chain_sneak = true;
        self
    }
}

/// The registry of every token in play.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    tokens: HashMap<TokenId, Token>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token and return its id.
    pub fn add_token(&mut self, token: Token) -> TokenId {
        let id = token.id;
        self.tokens.insert(id, token);
        id
    }

    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(&id)
    }

    pub fn token_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.get_mut(&id)
    }

    /// Remove a token outright. Callers that need cascading cleanup of the
    /// perception maps go through `RelationStore::purge_token` instead of
    /// calling this directly.
    pub fn remove_token(&mut self, id: TokenId) -> Option<Token> {
        self.tokens.remove(&id)
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.tokens.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.tokens.keys().copied()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    pub fn tokens_mut(&mut self) -> impl Iterator<Item = &mut Token> {
        self.tokens.values_mut()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Display name for a token, or the id when it is gone.
    pub fn name_of(&self, id: TokenId) -> String {
        self.token(id)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_builder() {
        let token = Token::new("Sable").with_position(3.0, 4.0).with_chain_sneak();
        assert_eq!(token.name, "Sable");
        assert_eq!(token.position, Position::new(3.0, 4.0));
        assert!(token.chain_sneak);
        assert!(token.relations.is_empty());
    }

    #[test]
    fn test_scene_add_remove() {
        let mut scene = Scene::new();
        let id = scene.add_token(Token::new("Guard"));

        assert!(scene.contains(id));
        assert_eq!(scene.len(), 1);
        assert_eq!(scene.name_of(id), "Guard");

        let removed = scene.remove_token(id).unwrap();
        assert_eq!(removed.name, "Guard");
        assert!(scene.is_empty());
        // Unknown ids render as the raw id.
        assert_eq!(scene.name_of(id), id.to_string());
    }
}
