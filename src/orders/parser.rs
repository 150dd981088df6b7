//! Decoding of client order identifiers.
//!
//! Identifiers come back verbatim in the exchange's order records, so the decoder is the only
//! way downstream consumers (chain tracking, P&L attribution) learn which mode placed a trade.
//! Anything not produced by the generator decodes to `None`; decoding never fails loudly.
//!
//! Accepted forms (case-insensitive):
//! - `MODE-DDMMM-NNNNN-LEG`, e.g. `SCA-06JAN-00001-E`
//! - `MODE-FALLBACK-xxxxxxxx-LEG`, e.g. `SWI-FALLBACK-a1b2c3d4-SL`

use super::types::{LegType, TradingMode};
use serde::{Deserialize, Serialize};

/// Hard cap imposed by the exchange on client order ids.
pub const MAX_CLIENT_ORDER_ID_LENGTH: usize = 36;

/// Marker occupying the date field of fallback identifiers.
pub const FALLBACK_MARKER: &str = "FALLBACK";

pub const MONTH_ABBREVIATIONS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// How the chain base was made unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderIdVariant {
    /// Allocated from the daily counter. `month` is 1-based.
    Normal { day: u8, month: u8, sequence: u32 },
    /// Counter was unavailable; `nonce` is 8 lowercase hex characters.
    Fallback { nonce: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOrderId {
    pub mode: TradingMode,
    pub leg: LegType,
    pub variant: OrderIdVariant,
    /// Identifier without the leg suffix, shared by every leg of the chain.
    pub chain_id: String,
    /// Input exactly as given.
    pub raw: String,
}

impl ParsedOrderId {
    pub fn is_fallback(&self) -> bool {
        matches!(self.variant, OrderIdVariant::Fallback { .. })
    }

    /// `06JAN` for normal ids, `FALLBACK` otherwise.
    pub fn date_str(&self) -> String {
        match &self.variant {
            OrderIdVariant::Normal { day, month, .. } => format!(
                "{:02}{}",
                day,
                MONTH_ABBREVIATIONS[(*month as usize).saturating_sub(1) % 12]
            ),
            OrderIdVariant::Fallback { .. } => FALLBACK_MARKER.to_string(),
        }
    }

    pub fn sequence(&self) -> Option<u32> {
        match self.variant {
            OrderIdVariant::Normal { sequence, .. } => Some(sequence),
            OrderIdVariant::Fallback { .. } => None,
        }
    }
}

/// Decode a client order id. Returns `None` for anything not in one of the two accepted
/// forms: empty input, foreign formats, unknown mode or leg codes, impossible dates, wrong
/// field widths, extra or missing fields.
pub fn parse_client_order_id(client_order_id: &str) -> Option<ParsedOrderId> {
    if client_order_id.is_empty() {
        return None;
    }

    let normalized = client_order_id.to_ascii_uppercase();
    let parts: Vec<&str> = normalized.split('-').collect();
    if parts.len() != 4 {
        return None;
    }

    let mode_code = parts[0];
    let mode = TradingMode::from_code(mode_code)?;
    let leg = LegType::from_code(parts[3])?;

    let (variant, chain_id) = if parts[1] == FALLBACK_MARKER {
        let nonce = parse_nonce(parts[2])?;
        let chain_id = format!("{}-{}-{}", mode_code, FALLBACK_MARKER, nonce);
        (OrderIdVariant::Fallback { nonce }, chain_id)
    } else {
        let (day, month) = parse_date(parts[1])?;
        let sequence = parse_sequence(parts[2])?;
        let chain_id = format!("{}-{}-{}", mode_code, parts[1], parts[2]);
        (
            OrderIdVariant::Normal {
                day,
                month,
                sequence,
            },
            chain_id,
        )
    };

    Some(ParsedOrderId {
        mode,
        leg,
        variant,
        chain_id,
        raw: client_order_id.to_string(),
    })
}

fn parse_nonce(field: &str) -> Option<String> {
    if field.len() != 8 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(field.to_ascii_lowercase())
}

fn parse_date(field: &str) -> Option<(u8, u8)> {
    if field.len() != 5 || !field.is_ascii() {
        return None;
    }
    let (day_str, month_str) = field.split_at(2);
    if !day_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let day: u8 = day_str.parse().ok()?;
    if !(1..=31).contains(&day) {
        return None;
    }
    let month = MONTH_ABBREVIATIONS
        .iter()
        .position(|m| *m == month_str)
        .map(|idx| idx as u8 + 1)?;
    Some((day, month))
}

fn parse_sequence(field: &str) -> Option<u32> {
    if field.len() != 5 || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

pub fn parse_chain_id(client_order_id: &str) -> Option<String> {
    parse_client_order_id(client_order_id).map(|p| p.chain_id)
}

pub fn is_our_format(client_order_id: &str) -> bool {
    parse_client_order_id(client_order_id).is_some()
}

pub fn extract_mode(client_order_id: &str) -> Option<TradingMode> {
    parse_client_order_id(client_order_id).map(|p| p.mode)
}

pub fn extract_leg_type(client_order_id: &str) -> Option<LegType> {
    parse_client_order_id(client_order_id).map(|p| p.leg)
}

/// True only when both ids decode and share a chain base.
pub fn belongs_to_same_chain(a: &str, b: &str) -> bool {
    match (parse_chain_id(a), parse_chain_id(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normal_id() {
        let parsed = parse_client_order_id("SCA-06JAN-00001-E").unwrap();
        assert_eq!(parsed.mode, TradingMode::Scalp);
        assert_eq!(parsed.leg, LegType::Entry);
        assert_eq!(parsed.chain_id, "SCA-06JAN-00001");
        assert_eq!(parsed.date_str(), "06JAN");
        assert_eq!(parsed.sequence(), Some(1));
        assert!(!parsed.is_fallback());
        assert_eq!(
            parsed.variant,
            OrderIdVariant::Normal {
                day: 6,
                month: 1,
                sequence: 1
            }
        );
    }

    #[test]
    fn test_parse_is_case_insensitive_with_canonical_chain() {
        let parsed = parse_client_order_id("swi-31dec-99999-tp3").unwrap();
        assert_eq!(parsed.mode, TradingMode::Swing);
        assert_eq!(parsed.leg, LegType::TakeProfit3);
        assert_eq!(parsed.chain_id, "SWI-31DEC-99999");
        assert_eq!(parsed.raw, "swi-31dec-99999-tp3");
    }

    #[test]
    fn test_parse_fallback_keeps_nonce_lowercase() {
        let parsed = parse_client_order_id("POS-FALLBACK-A1B2C3D4-HSL").unwrap();
        assert!(parsed.is_fallback());
        assert_eq!(parsed.chain_id, "POS-FALLBACK-a1b2c3d4");
        assert_eq!(parsed.date_str(), FALLBACK_MARKER);
        assert_eq!(parsed.sequence(), None);
        assert_eq!(parsed.leg, LegType::HedgeStopLoss);
    }

    #[test]
    fn test_rejects_malformed_ids() {
        let cases = [
            "",
            "random-client-id",
            "XYZ-06JAN-00001-E",
            "SCA-00JAN-00001-E",
            "SCA-32JAN-00001-E",
            "SCA-06ABC-00001-E",
            "SCA-06JAN-0001-E",
            "SCA-06JAN-000001-E",
            "SCA-06JAN-00001-TP4",
            "SCA-06JAN-00001",
            "SCA-06JAN-00001-E-X",
            "SCA-FALLBACK-a1b2c3-E",
            "SCA-FALLBACK-g1b2c3d4-E",
            "SCA-6JAN1-00001-E",
            "web_1234567890",
        ];
        for case in cases {
            assert!(parse_client_order_id(case).is_none(), "accepted {:?}", case);
        }
    }

    #[test]
    fn test_chain_helpers() {
        assert!(belongs_to_same_chain("SCA-06JAN-00001-E", "sca-06jan-00001-SL"));
        assert!(!belongs_to_same_chain("SCA-06JAN-00001-E", "SCA-06JAN-00002-E"));
        assert!(!belongs_to_same_chain("garbage", "garbage"));
        assert_eq!(extract_mode("ULT-01FEB-00010-DCA2"), Some(TradingMode::UltraFast));
        assert_eq!(extract_leg_type("ULT-01FEB-00010-DCA2"), Some(LegType::Dca2));
        assert!(is_our_format("POS-15MAR-00003-RB"));
        assert_eq!(parse_chain_id("nope"), None);
    }
}
