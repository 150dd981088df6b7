//! State of one multi-leg order chain.

use super::types::{LegType, TradingMode};
use crate::domain::TimeMs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    Active,
    Partial,
    Completed,
    Cancelled,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Active => "active",
            ChainStatus::Partial => "partial",
            ChainStatus::Completed => "completed",
            ChainStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ChainStatus::Active),
            "partial" => Some(ChainStatus::Partial),
            "completed" => Some(ChainStatus::Completed),
            "cancelled" => Some(ChainStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(Direction::Long),
            "SHORT" => Some(Direction::Short),
            _ => None,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Direction::Long)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainState {
    pub base_id: String,
    pub symbol: String,
    pub mode: TradingMode,
    pub direction: Direction,
    pub status: ChainStatus,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
    pub filled_legs: BTreeSet<LegType>,
    pub pending_legs: BTreeSet<LegType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ChainState {
    pub fn new(
        base_id: impl Into<String>,
        symbol: impl Into<String>,
        mode: TradingMode,
        direction: Direction,
    ) -> Self {
        let now = TimeMs::now();
        Self {
            base_id: base_id.into(),
            symbol: symbol.into(),
            mode,
            direction,
            status: ChainStatus::Active,
            created_at: now,
            updated_at: now,
            filled_legs: BTreeSet::new(),
            pending_legs: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn mark_leg_filled(&mut self, leg: LegType) {
        self.pending_legs.remove(&leg);
        self.filled_legs.insert(leg);
        self.touch();
    }

    pub fn mark_leg_pending(&mut self, leg: LegType) {
        self.pending_legs.insert(leg);
        self.touch();
    }

    pub fn mark_leg_cancelled(&mut self, leg: LegType) {
        self.pending_legs.remove(&leg);
        self.touch();
    }

    pub fn set_status(&mut self, status: ChainStatus) {
        self.status = status;
        self.touch();
    }

    pub fn is_leg_filled(&self, leg: LegType) -> bool {
        self.filled_legs.contains(&leg)
    }

    pub fn is_leg_pending(&self, leg: LegType) -> bool {
        self.pending_legs.contains(&leg)
    }

    pub fn has_entry_filled(&self) -> bool {
        self.is_leg_filled(LegType::Entry)
    }

    /// Active or partially closed.
    pub fn is_active(&self) -> bool {
        matches!(self.status, ChainStatus::Active | ChainStatus::Partial)
    }

    /// Completed or cancelled.
    pub fn is_completed(&self) -> bool {
        matches!(self.status, ChainStatus::Completed | ChainStatus::Cancelled)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_legs.len()
    }

    pub fn filled_count(&self) -> usize {
        self.filled_legs.len()
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.touch();
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    fn touch(&mut self) {
        self.updated_at = TimeMs::now();
    }
}
