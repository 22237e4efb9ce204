//! Deterministic simulation engines for the Chronique narrative system.
//!
//! Two session-scoped state machines mutate game state against the
//! memory core:
//!
//! - [`travel`] -- start/tick/camp/abort/arrive with a weighted random
//!   route event pool ([`travel_events`]), cooldowns, recency
//!   suppression, and resource bookkeeping. Every tick is reproducible
//!   bit-for-bit under a fixed seed.
//! - [`trade`] -- the idle/selecting/confirming/done/aborted negotiation
//!   machine: cart math, quantity arbitration, fingerprint-based
//!   duplicate guarding, reputation-aware pricing, and transactional
//!   inventory/gold mutation with rollback.
//!
//! Both engines return normalized snapshots after every mutation and
//! communicate with orchestrators through patches: closed structs where
//! the shape is fixed (travel deltas, trade contexts) and open JSON
//! where the orchestrator owns the vocabulary (scene flags, combat
//! seeds). Pluggable capabilities -- the intent classifier ([`intent`])
//! and the vendor flair renderer ([`flair`]) -- keep the cores
//! deterministic and testable without network access.

pub mod flair;
pub mod intent;
pub mod trade;
pub mod travel;
pub mod travel_events;

pub use flair::{FlairRequest, FlairResponse, VendorFlair, local_vendor_line, render_vendor_line};
pub use intent::{
    IntentClassifier, KeywordIntentClassifier, SellIntent, extract_qty, is_trade_message,
    match_item_query, normalize_utterance,
};
pub use trade::{
    LineItem, Negotiation, PendingQuestion, QuantityOption, TradeContext, TradeEngine, TradeMode,
    TradeOutcome, TradeSession, TradeStatus, action_fingerprint, unit_price_for,
};
pub use travel::{
    TickContext, TravelAction, TravelEngine, TravelLogEntry, TravelOptions, TravelState,
    TravelStatus,
};
pub use travel_events::{
    Supplies, TravelChoice, TravelEvent, TravelEventType, TravelPatch, build_event, event_weights,
    pick_event_type,
};
