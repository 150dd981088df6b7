//! Domain types shared by the order and settlement layers.
//!
//! This module provides:
//! - Lossless numeric handling via the Decimal wrapper
//! - Domain primitives: TimeMs, UserId, Symbol, Side, PositionSide

pub mod decimal;
pub mod primitives;

pub use decimal::Decimal;
pub use primitives::{PositionSide, Side, Symbol, TimeMs, UserId};
