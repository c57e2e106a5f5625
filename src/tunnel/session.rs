//! Descriptor <-> stream identifier bookkeeping

use super::TunnelError;
use mio::Token;
use std::collections::HashMap;

/// Bidirectional map between outside sockets and stream identifiers.
///
/// Both directions are always updated together; a token or identifier
/// appears in at most one entry.
#[derive(Debug, Default)]
pub struct SessionTable {
    by_token: HashMap<Token, u32>,
    by_id: HashMap<u32, Token>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Fails without mutating if either key is already present.
    pub fn insert(&mut self, token: Token, conn_id: u32) -> Result<(), TunnelError> {
        if self.by_token.contains_key(&token) || self.by_id.contains_key(&conn_id) {
            return Err(TunnelError::DuplicateSession {
                token: token.0,
                conn_id,
            });
        }
        self.by_token.insert(token, conn_id);
        self.by_id.insert(conn_id, token);
        debug_assert!(self.is_consistent());
        Ok(())
    }

    pub fn lookup_by_token(&self, token: Token) -> Option<u32> {
        self.by_token.get(&token).copied()
    }

    pub fn lookup_by_id(&self, conn_id: u32) -> Option<Token> {
        self.by_id.get(&conn_id).copied()
    }

    pub fn contains_token(&self, token: Token) -> bool {
        self.by_token.contains_key(&token)
    }

    pub fn contains_id(&self, conn_id: u32) -> bool {
        self.by_id.contains_key(&conn_id)
    }

    /// Remove the entry for `token`, returning its identifier
    pub fn remove_by_token(&mut self, token: Token) -> Option<u32> {
        let conn_id = self.by_token.remove(&token)?;
        self.by_id.remove(&conn_id);
        debug_assert!(self.is_consistent());
        Some(conn_id)
    }

    /// Remove the entry for `conn_id`, returning its token
    pub fn remove_by_id(&mut self, conn_id: u32) -> Option<Token> {
        let token = self.by_id.remove(&conn_id)?;
        self.by_token.remove(&token);
        debug_assert!(self.is_consistent());
        Some(token)
    }

    pub fn clear(&mut self) {
        self.by_token.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Iterate over `(token, conn_id)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (Token, u32)> + '_ {
        self.by_token.iter().map(|(&token, &conn_id)| (token, conn_id))
    }

    /// Check that both directions describe the same set of pairs
    pub fn is_consistent(&self) -> bool {
        self.by_token.len() == self.by_id.len()
            && self
                .by_token
                .iter()
                .all(|(token, conn_id)| self.by_id.get(conn_id) == Some(token))
    }
}
