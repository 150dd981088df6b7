//! Trading modes and leg types: the closed vocabulary encoded into every client order id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading strategy that placed an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    UltraFast,
    Scalp,
    Swing,
    Position,
}

impl TradingMode {
    pub const ALL: [TradingMode; 4] = [
        TradingMode::UltraFast,
        TradingMode::Scalp,
        TradingMode::Swing,
        TradingMode::Position,
    ];

    /// Three-letter code used in the identifier.
    pub fn code(&self) -> &'static str {
        match self {
            TradingMode::UltraFast => "ULT",
            TradingMode::Scalp => "SCA",
            TradingMode::Swing => "SWI",
            TradingMode::Position => "POS",
        }
    }

    /// Name used in settlement rows.
    pub fn name(&self) -> &'static str {
        match self {
            TradingMode::UltraFast => "ultra_fast",
            TradingMode::Scalp => "scalp",
            TradingMode::Swing => "swing",
            TradingMode::Position => "position",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "ULT" => Some(TradingMode::UltraFast),
            "SCA" => Some(TradingMode::Scalp),
            "SWI" => Some(TradingMode::Swing),
            "POS" => Some(TradingMode::Position),
            _ => None,
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "ultra_fast" => Some(TradingMode::UltraFast),
            "scalp" => Some(TradingMode::Scalp),
            "swing" => Some(TradingMode::Swing),
            "position" => Some(TradingMode::Position),
            _ => None,
        }
    }

    /// Lenient lookup for strategy configuration; unknown names run as scalp.
    pub fn from_name(name: &str) -> Self {
        Self::parse_name(name).unwrap_or(TradingMode::Scalp)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Role of one order within a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LegType {
    /// Initial entry.
    #[serde(rename = "E")]
    Entry,
    #[serde(rename = "TP1")]
    TakeProfit1,
    #[serde(rename = "TP2")]
    TakeProfit2,
    #[serde(rename = "TP3")]
    TakeProfit3,
    #[serde(rename = "RB")]
    Rebuy,
    #[serde(rename = "DCA1")]
    Dca1,
    #[serde(rename = "DCA2")]
    Dca2,
    #[serde(rename = "DCA3")]
    Dca3,
    /// Hedge entry on the opposite side.
    #[serde(rename = "H")]
    Hedge,
    #[serde(rename = "HSL")]
    HedgeStopLoss,
    #[serde(rename = "HTP")]
    HedgeTakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
}

impl LegType {
    pub const ALL: [LegType; 12] = [
        LegType::Entry,
        LegType::TakeProfit1,
        LegType::TakeProfit2,
        LegType::TakeProfit3,
        LegType::Rebuy,
        LegType::Dca1,
        LegType::Dca2,
        LegType::Dca3,
        LegType::Hedge,
        LegType::HedgeStopLoss,
        LegType::HedgeTakeProfit,
        LegType::StopLoss,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            LegType::Entry => "E",
            LegType::TakeProfit1 => "TP1",
            LegType::TakeProfit2 => "TP2",
            LegType::TakeProfit3 => "TP3",
            LegType::Rebuy => "RB",
            LegType::Dca1 => "DCA1",
            LegType::Dca2 => "DCA2",
            LegType::Dca3 => "DCA3",
            LegType::Hedge => "H",
            LegType::HedgeStopLoss => "HSL",
            LegType::HedgeTakeProfit => "HTP",
            LegType::StopLoss => "SL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|leg| leg.code() == code)
    }

    /// Stop-loss legs, whose edits are judged as tighter/wider.
    pub fn is_stop_loss(&self) -> bool {
        matches!(self, LegType::StopLoss | LegType::HedgeStopLoss)
    }

    /// Longest code; bounds the rendered identifier length.
    pub fn max_code_len() -> usize {
        Self::ALL.iter().map(|leg| leg.code().len()).max().unwrap_or(0)
    }
}

impl fmt::Display for LegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
