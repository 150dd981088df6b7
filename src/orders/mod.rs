//! Order identity and lifecycle: identifier codec, chain registry, modification log and
//! position tracking.

pub mod chain_state;
pub mod chain_tracker;
pub mod client_order_id;
pub mod modification_tracker;
pub mod parser;
pub mod position_tracker;
pub mod types;

pub use chain_state::{ChainState, ChainStatus, Direction};
pub use chain_tracker::{ChainError, ChainTracker};
pub use client_order_id::{
    extract_base_id, generate_related, is_fallback_id, validate_client_order_id,
    ClientOrderIdGenerator, CodecError, GeneratedId, DEFAULT_TIMEZONE,
};
pub use modification_tracker::{
    summarize, CancelOrderEvent, FillOrderEvent, ImpactDirection, ModificationError,
    ModificationEvent, ModificationEventType, ModificationSource, ModificationStore,
    ModificationSummary, ModificationTracker, ModifyOrderEvent, PlaceOrderEvent,
};
pub use parser::{
    belongs_to_same_chain, extract_leg_type, extract_mode, is_our_format, parse_chain_id,
    parse_client_order_id, OrderIdVariant, ParsedOrderId, MAX_CLIENT_ORDER_ID_LENGTH,
};
pub use position_tracker::{
    EntryFill, PartialClose, PositionError, PositionState, PositionStatus, PositionStore,
    PositionTracker,
};
pub use types::{LegType, TradingMode};
