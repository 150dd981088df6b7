//! In-memory registry of order chains keyed by chain base id.

use super::chain_state::{ChainState, ChainStatus, Direction};
use super::types::{LegType, TradingMode};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain not found")]
    ChainNotFound,
    #[error("chain already exists")]
    ChainAlreadyExists,
    #[error("invalid chain status")]
    InvalidStatus,
    #[error("base ID cannot be empty")]
    EmptyBaseId,
    #[error("symbol cannot be empty")]
    EmptySymbol,
}

/// Thread-safe chain registry. Every query hands out clones; the registry is the only owner
/// of live chain state.
#[derive(Debug, Default)]
pub struct ChainTracker {
    chains: RwLock<HashMap<String, ChainState>>,
}

impl ChainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ChainState>> {
        self.chains.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ChainState>> {
        self.chains.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new chain with its entry leg pending.
    ///
    /// # Errors
    /// `EmptyBaseId`, `EmptySymbol`, or `ChainAlreadyExists`.
    pub fn create_chain(
        &self,
        base_id: &str,
        symbol: &str,
        mode: TradingMode,
        direction: Direction,
    ) -> Result<ChainState, ChainError> {
        if base_id.is_empty() {
            return Err(ChainError::EmptyBaseId);
        }
        if symbol.is_empty() {
            return Err(ChainError::EmptySymbol);
        }

        let mut chains = self.write();
        if chains.contains_key(base_id) {
            return Err(ChainError::ChainAlreadyExists);
        }

        let mut chain = ChainState::new(base_id, symbol, mode, direction);
        chain.mark_leg_pending(LegType::Entry);
        chains.insert(base_id.to_string(), chain.clone());

        debug!(chain = %base_id, symbol = %symbol, mode = %mode, "Chain created");
        Ok(chain)
    }

    fn with_chain_mut<T>(
        &self,
        base_id: &str,
        f: impl FnOnce(&mut ChainState) -> T,
    ) -> Result<T, ChainError> {
        if base_id.is_empty() {
            return Err(ChainError::EmptyBaseId);
        }
        let mut chains = self.write();
        let chain = chains.get_mut(base_id).ok_or(ChainError::ChainNotFound)?;
        Ok(f(chain))
    }

    pub fn update_status(&self, base_id: &str, status: ChainStatus) -> Result<(), ChainError> {
        self.with_chain_mut(base_id, |c| c.set_status(status))
    }

    /// Status update from an untyped source such as a persisted row.
    pub fn update_status_str(&self, base_id: &str, status: &str) -> Result<(), ChainError> {
        let status = ChainStatus::parse(status).ok_or(ChainError::InvalidStatus)?;
        self.update_status(base_id, status)
    }

    pub fn mark_leg_filled(&self, base_id: &str, leg: LegType) -> Result<(), ChainError> {
        self.with_chain_mut(base_id, |c| c.mark_leg_filled(leg))
    }

    pub fn mark_leg_pending(&self, base_id: &str, leg: LegType) -> Result<(), ChainError> {
        self.with_chain_mut(base_id, |c| c.mark_leg_pending(leg))
    }

    pub fn mark_leg_cancelled(&self, base_id: &str, leg: LegType) -> Result<(), ChainError> {
        self.with_chain_mut(base_id, |c| c.mark_leg_cancelled(leg))
    }

    pub fn close_chain(&self, base_id: &str) -> Result<(), ChainError> {
        self.update_status(base_id, ChainStatus::Completed)
    }

    pub fn cancel_chain(&self, base_id: &str) -> Result<(), ChainError> {
        self.update_status(base_id, ChainStatus::Cancelled)
    }

    pub fn get_chain(&self, base_id: &str) -> Result<ChainState, ChainError> {
        if base_id.is_empty() {
            return Err(ChainError::EmptyBaseId);
        }
        self.read()
            .get(base_id)
            .cloned()
            .ok_or(ChainError::ChainNotFound)
    }

    /// Chains that are active or partially closed.
    pub fn get_active_chains(&self) -> Vec<ChainState> {
        self.read()
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    /// First active chain on `symbol`.
    pub fn get_chain_by_symbol(&self, symbol: &str) -> Option<ChainState> {
        self.read()
            .values()
            .find(|c| c.symbol == symbol && c.is_active())
            .cloned()
    }

    pub fn get_all_chains_by_symbol(&self, symbol: &str) -> Vec<ChainState> {
        self.read()
            .values()
            .filter(|c| c.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn remove_chain(&self, base_id: &str) -> Result<(), ChainError> {
        if base_id.is_empty() {
            return Err(ChainError::EmptyBaseId);
        }
        self.write()
            .remove(base_id)
            .map(|_| ())
            .ok_or(ChainError::ChainNotFound)
    }

    pub fn chain_count(&self) -> usize {
        self.read().len()
    }

    pub fn active_chain_count(&self) -> usize {
        self.read().values().filter(|c| c.is_active()).count()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn set_chain_metadata(
        &self,
        base_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), ChainError> {
        self.with_chain_mut(base_id, |c| c.set_metadata(key, value))
    }

    /// `Ok(None)` when the chain exists but the key does not.
    pub fn get_chain_metadata(
        &self,
        base_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, ChainError> {
        if base_id.is_empty() {
            return Err(ChainError::EmptyBaseId);
        }
        let chains = self.read();
        let chain = chains.get(base_id).ok_or(ChainError::ChainNotFound)?;
        Ok(chain.metadata(key).cloned())
    }
}
