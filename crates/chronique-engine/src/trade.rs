//! Trade negotiation state machine.
//!
//! A session walks idle -> selecting -> confirming -> done (or aborted).
//! The cart records committed line items; unit prices derive from the
//! item catalogue value times the merchant multiplier for the player's
//! `Marchands` reputation, fixed at the moment a line is committed.
//! Quantity questions arbitrate between "sell everything", "one at a
//! time", and an explicit count. A fingerprint guard
//! (`status|normalized utterance|npc`) rejects duplicate actions within
//! a turn without mutating anything.
//!
//! [`TradeEngine::execute_trade`] is atomic on success: sells decrement
//! inventory nearest-last-first across carried then storage and credit
//! gold; buys verify gold, merge into existing stacks up to the item's
//! stack limit before opening empty slots, then debit gold. Any
//! shortfall rolls every partial mutation back and reports
//! `insufficient_funds`, `inventory_full`, or `insufficient_items` with
//! no reputation effects.

use std::collections::BTreeMap;

use chronique_reputation::{TradeReputationContext, merchant_price_multiplier};
use chronique_types::{InventoryGrid, ItemDef, ItemDefs, ItemStack, PlayerState};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::intent::SellIntent;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Trade session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    /// No session.
    #[default]
    Idle,
    /// Gathering items and quantities.
    Selecting,
    /// Offer on the table, awaiting confirmation.
    Confirming,
    /// Executed (or terminally refused); resets on the next non-trade
    /// utterance.
    Done,
    /// Cancelled.
    Aborted,
}

impl TradeStatus {
    /// Parse a wire string, falling back to [`TradeStatus::Idle`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "selecting" => Self::Selecting,
            "confirming" => Self::Confirming,
            "done" => Self::Done,
            "aborted" => Self::Aborted,
            _ => Self::Idle,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::Confirming => "confirming",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// Player sells to the NPC.
    #[default]
    Sell,
    /// Player buys from the NPC.
    Buy,
}

impl TradeMode {
    /// Parse a wire string, falling back to [`TradeMode::Sell`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "buy" => Self::Buy,
            _ => Self::Sell,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
        }
    }
}

/// Quantity arbitration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityOption {
    /// Sell every unit held.
    SellAll,
    /// Sell a single unit.
    SellOne,
    /// Sell an explicit count.
    SetQty,
}

impl QuantityOption {
    /// Parse a wire string, falling back to [`QuantityOption::SetQty`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "sell_all" => Self::SellAll,
            "sell_one" => Self::SellOne,
            _ => Self::SetQty,
        }
    }
}

// ---------------------------------------------------------------------------
// Session shapes
// ---------------------------------------------------------------------------

/// One committed cart line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LineItem {
    /// Item id.
    #[serde(default)]
    pub item_id: String,
    /// Display name.
    #[serde(default)]
    pub item_name: String,
    /// Quantity, at least 1.
    #[serde(default)]
    pub qty: u32,
    /// Committed unit price.
    #[serde(default)]
    pub unit_price: u32,
    /// `qty * unit_price`, maintained by normalization.
    #[serde(default)]
    pub subtotal: u32,
}

/// A quantity question awaiting the player's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PendingQuestion {
    /// Item the question is about.
    #[serde(default)]
    pub item_id: String,
    /// Display name used in the question text.
    #[serde(default)]
    pub item_name: String,
    /// Upper bound the player holds.
    #[serde(default)]
    pub max_qty: u32,
    /// Player-facing question text.
    #[serde(default)]
    pub text: String,
}

/// Vendor disposition toward the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Negotiation {
    /// Mood in `[0, 100]`.
    #[serde(default)]
    pub mood: i32,
    /// Trust in `[0, 100]`.
    #[serde(default)]
    pub trust: i32,
    /// Greed in `[0, 100]`.
    #[serde(default)]
    pub greed: i32,
    /// Reputation bonus folded into trust, in `[-20, 20]`.
    #[serde(default)]
    pub rep_bonus: i32,
}

/// Maximum transcript lines retained.
pub const TRANSCRIPT_LIMIT: usize = 10;

/// Full trade session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TradeSession {
    /// Machine status.
    #[serde(default)]
    pub status: TradeStatus,
    /// Trade direction.
    #[serde(default)]
    pub mode: TradeMode,
    /// Counterpart NPC id.
    #[serde(default)]
    pub npc_id: String,
    /// Committed line items.
    #[serde(default)]
    pub cart: Vec<LineItem>,
    /// Quantity question awaiting an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<PendingQuestion>,
    /// Vendor disposition.
    #[serde(default)]
    pub negotiation: Negotiation,
    /// Caller-visible negotiation terms; never alters committed prices.
    #[serde(default)]
    pub proposed_terms: Value,
    /// Short human-readable trail (ring of 10).
    #[serde(default)]
    pub transcript_short: Vec<String>,
    /// Monotonic action counter.
    #[serde(default)]
    pub turn_id: u64,
    /// Fingerprint of the last state-changing action.
    #[serde(default)]
    pub last_action_fingerprint: String,
    /// Turn id the last flair line was rendered for.
    #[serde(default)]
    pub last_llm_turn_id: u64,
    /// Whether flair rendering is enabled for this session.
    #[serde(default)]
    pub llm_enabled: bool,
    /// Last raw player intent text (truncated).
    #[serde(default)]
    pub last_player_intent: String,
}

impl TradeSession {
    /// Re-establish field bounds and derived values in place.
    pub fn sanitize(&mut self) {
        self.npc_id = self.npc_id.trim().to_owned();
        for line in &mut self.cart {
            line.qty = line.qty.clamp(1, 999);
            line.subtotal = line.qty.saturating_mul(line.unit_price);
            if line.item_name.trim().is_empty() {
                line.item_name = line.item_id.clone();
            }
        }
        self.cart.retain(|line| !line.item_id.trim().is_empty());
        if let Some(question) = self.pending_question.as_ref() {
            if question.item_id.trim().is_empty() || question.max_qty == 0 {
                self.pending_question = None;
            }
        }
        self.negotiation.mood = self.negotiation.mood.clamp(0, 100);
        self.negotiation.trust = self.negotiation.trust.clamp(0, 100);
        self.negotiation.greed = self.negotiation.greed.clamp(0, 100);
        self.negotiation.rep_bonus = self.negotiation.rep_bonus.clamp(-20, 20);
        if self.transcript_short.len() > TRANSCRIPT_LIMIT {
            let drop = self.transcript_short.len().saturating_sub(TRANSCRIPT_LIMIT);
            self.transcript_short.drain(..drop);
        }
        self.last_player_intent = self.last_player_intent.chars().take(220).collect();
        if self.status == TradeStatus::Idle {
            self.cart.clear();
            self.pending_question = None;
        }
    }

    /// Total price across the cart.
    pub fn total_price(&self) -> u32 {
        self.cart
            .iter()
            .map(|line| line.subtotal)
            .fold(0, u32::saturating_add)
    }

    /// Total quantity across the cart.
    pub fn total_qty(&self) -> u32 {
        self.cart
            .iter()
            .map(|line| line.qty)
            .fold(0, u32::saturating_add)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator context
// ---------------------------------------------------------------------------

/// Trade outcome envelope handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TradeContext {
    /// Action wire name (`buy` or `sell`).
    pub action: String,
    /// Trade direction wire name.
    pub mode: String,
    /// Outcome status (`ok`, `insufficient_funds`, `inventory_full`,
    /// `insufficient_items`, `duplicate_ignored`, ...).
    pub status: String,
    /// Counterpart NPC display name.
    pub npc_name: String,
    /// Quantity on the first cart line.
    pub qty_offer: u32,
    /// Quantity actually executed across the cart.
    pub qty_done: u32,
    /// Unit price of the first cart line.
    pub unit_price: u32,
    /// Item id of the first cart line.
    pub item_id: String,
    /// Item name of the first cart line.
    pub item_name: String,
    /// Total price across the cart.
    pub total_price: u32,
    /// Session turn counter at execution time.
    pub trade_turn_id: u64,
    /// Player gold after the action.
    pub gold_after: u32,
    /// Item totals after the action.
    pub inventory_after: BTreeMap<String, u32>,
    /// Scoped NPC key, when the orchestrator tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npc_key: Option<String>,
    /// Set by the orchestrator when the counterpart qualifies for the
    /// hidden charity quest.
    #[serde(default)]
    pub secret_charity_candidate: bool,
}

impl TradeContext {
    /// Slice of this context consumed by the reputation ledger. A
    /// `give` action (set by the orchestrator for charity flows) rides
    /// on the same fields.
    pub fn reputation_context(&self, target_is_beggar: bool) -> TradeReputationContext {
        TradeReputationContext {
            action: self.action.clone(),
            status: self.status.clone(),
            qty_done: self.qty_done,
            target_is_beggar,
        }
    }
}

/// Result of [`TradeEngine::execute_trade`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeOutcome {
    /// Whether the trade executed.
    pub ok: bool,
    /// System lines to surface.
    pub lines: Vec<String>,
    /// Context envelope for reputation and quest hooks.
    pub context: TradeContext,
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Unit price for an item under the player's `Marchands` reputation.
pub fn unit_price_for(item: &ItemDef, marchands_score: i32) -> u32 {
    let raw = f64::from(item.value) * merchant_price_multiplier(marchands_score);
    if raw <= 0.0 {
        0
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            raw.round() as u32
        }
    }
}

/// Build the duplicate-action fingerprint.
pub fn action_fingerprint(status: TradeStatus, plain_text: &str, npc_id: &str) -> String {
    format!("{}|{}|{}", status.as_str(), plain_text, npc_id.to_lowercase())
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Trade engine: owns one [`TradeSession`] for the duration of an
/// interaction.
#[derive(Debug, Clone, Default)]
pub struct TradeEngine {
    session: TradeSession,
}

impl TradeEngine {
    /// Engine over a fresh idle session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the session (normalizing it) and return a snapshot.
    pub fn load_session(&mut self, mut session: TradeSession) -> TradeSession {
        session.sanitize();
        self.session = session;
        self.session.clone()
    }

    /// Normalized snapshot of the current session.
    pub fn export_session(&mut self) -> TradeSession {
        self.session.sanitize();
        self.session.clone()
    }

    /// Reset to an idle session, keeping nothing.
    pub fn reset_to_idle(&mut self) -> TradeSession {
        self.session = TradeSession::default();
        self.session.clone()
    }

    /// Open (or reopen) a session with an NPC.
    ///
    /// Switching NPC mid-session resets to idle first; opening always
    /// clears the cart and any pending question.
    pub fn start_trade(&mut self, npc_id: &str, mode: TradeMode, llm_enabled: bool) -> TradeSession {
        self.session.sanitize();
        let asked = npc_id.trim().to_lowercase();
        let current = self.session.npc_id.trim().to_lowercase();
        if self.session.status != TradeStatus::Idle && !current.is_empty() && current != asked {
            self.reset_to_idle();
        }
        self.session.status = TradeStatus::Selecting;
        self.session.mode = mode;
        self.session.npc_id = npc_id.trim().to_owned();
        self.session.llm_enabled = llm_enabled;
        self.session.cart.clear();
        self.session.pending_question = None;
        self.export_session()
    }

    /// Duplicate-action guard.
    ///
    /// A fingerprint equal to the previous one is a duplicate: nothing
    /// changes and the caller must refuse state-changing effects. A new
    /// fingerprint is recorded and advances the turn counter.
    pub fn run_action_guard(&mut self, fingerprint: &str) -> bool {
        if !self.session.last_action_fingerprint.is_empty()
            && self.session.last_action_fingerprint == fingerprint
        {
            return true;
        }
        self.session.last_action_fingerprint = fingerprint.to_owned();
        self.session.turn_id = self.session.turn_id.saturating_add(1);
        false
    }

    /// Record the vendor disposition from the NPC profile numbers and
    /// the player's `Marchands` score. Updates `proposed_terms`; never
    /// touches committed prices.
    pub fn set_negotiation(&mut self, tension: i32, greed: i32, marchands_score: i32) {
        let rep_bonus = marchands_score.clamp(-20, 20);
        let negotiation = Negotiation {
            mood: (60 - tension / 2).clamp(0, 100),
            trust: (58 - tension / 3 + rep_bonus).clamp(0, 100),
            greed: greed.clamp(0, 100),
            rep_bonus,
        };
        self.session.negotiation = negotiation;
        self.session.proposed_terms = json!({
            "mood": negotiation.mood,
            "trust": negotiation.trust,
            "greed": negotiation.greed,
            "rep_bonus": negotiation.rep_bonus,
        });
    }

    /// Raise a quantity question when the intent leaves several valid
    /// answers (no explicit count, more than one unit held). Returns the
    /// question text when one was raised.
    pub fn propose_bundle_options(&mut self, intent: &SellIntent, item_defs: &ItemDefs) -> Option<String> {
        if intent.ambiguous || intent.item_id.is_empty() {
            return None;
        }
        if intent.qty.is_some() || intent.sell_all || intent.one_by_one || intent.max_qty <= 1 {
            return None;
        }
        let item_name = item_defs
            .get(&intent.item_id)
            .map_or_else(|| intent.item_id.clone(), |def| def.name.clone());
        let text = format!(
            "Tu veux en vendre combien ? {item_name}: 1 a {}, 'tout', ou 'une par une'.",
            intent.max_qty
        );
        self.session.pending_question = Some(PendingQuestion {
            item_id: intent.item_id.clone(),
            item_name,
            max_qty: intent.max_qty,
            text: text.clone(),
        });
        self.session.status = TradeStatus::Selecting;
        Some(text)
    }

    /// Resolve the pending quantity question and move to confirming.
    pub fn apply_quantity_choice(
        &mut self,
        option: QuantityOption,
        quantity: Option<u32>,
        item_defs: &ItemDefs,
        marchands_score: i32,
    ) -> String {
        let Some(question) = self.session.pending_question.clone() else {
            return String::from("Aucune question de quantite en attente.");
        };
        let qty = match option {
            QuantityOption::SellAll => question.max_qty.max(1),
            QuantityOption::SellOne => 1,
            QuantityOption::SetQty => quantity.unwrap_or(1).clamp(1, question.max_qty.max(1)),
        };
        self.add_to_cart(&question.item_id, qty, item_defs, marchands_score);
        self.session.pending_question = None;
        self.confirm_trade();
        format!("Offre mise a jour: {}. Confirme quand tu veux.", self.build_recap_text())
    }

    /// Commit a line to the cart. The unit price is computed once, from
    /// the catalogue value and the merchant multiplier; a line for the
    /// same item accumulates quantity at its original price.
    pub fn add_to_cart(
        &mut self,
        item_id: &str,
        qty: u32,
        item_defs: &ItemDefs,
        marchands_score: i32,
    ) -> TradeSession {
        let clean_id = item_id.trim();
        if clean_id.is_empty() {
            return self.export_session();
        }
        let qty = qty.clamp(1, 999);
        if let Some(line) = self
            .session
            .cart
            .iter_mut()
            .find(|line| line.item_id == clean_id)
        {
            line.qty = line.qty.saturating_add(qty).clamp(1, 999);
            line.subtotal = line.qty.saturating_mul(line.unit_price);
            return self.export_session();
        }
        let (name, price) = item_defs.get(clean_id).map_or_else(
            || (clean_id.to_owned(), 0),
            |def| (def.name.clone(), unit_price_for(def, marchands_score)),
        );
        self.session.cart.push(LineItem {
            item_id: clean_id.to_owned(),
            item_name: name,
            qty,
            unit_price: price,
            subtotal: qty.saturating_mul(price),
        });
        self.export_session()
    }

    /// Move to confirming when the cart is non-empty.
    pub fn confirm_trade(&mut self) -> TradeSession {
        if !self.session.cart.is_empty() {
            self.session.status = TradeStatus::Confirming;
        }
        self.export_session()
    }

    /// Cancel the session.
    pub fn abort_trade(&mut self) -> TradeSession {
        self.session.status = TradeStatus::Aborted;
        self.session.pending_question = None;
        self.push_transcript("Transaction annulee pour cette fois.");
        self.export_session()
    }

    /// Human-readable cart recap.
    pub fn build_recap_text(&self) -> String {
        if self.session.cart.is_empty() {
            return String::from("panier vide");
        }
        self.session
            .cart
            .iter()
            .take(4)
            .map(|line| format!("{} x{} ({}/u)", line.item_name, line.qty, line.unit_price))
            .collect::<Vec<String>>()
            .join(", ")
    }

    /// Item totals across carried and storage.
    pub fn inventory_totals(player: &PlayerState) -> BTreeMap<String, u32> {
        let mut totals: BTreeMap<String, u32> = BTreeMap::new();
        for stack in player.carried.slots.iter().chain(player.storage.slots.iter()).flatten() {
            let entry = totals.entry(stack.item_id.clone()).or_insert(0);
            *entry = entry.saturating_add(stack.qty);
        }
        totals
    }

    /// Execute the confirmed cart against the player state.
    ///
    /// Atomic on success; any shortfall leaves gold and inventory
    /// untouched and reports the failure status in the returned context.
    pub fn execute_trade(&mut self, player: &mut PlayerState, item_defs: &ItemDefs) -> TradeOutcome {
        self.session.sanitize();
        if self.session.cart.is_empty() {
            let context = self.context_with_status("empty_cart", player);
            return TradeOutcome {
                ok: false,
                lines: vec![String::from("Rien a echanger: le panier est vide.")],
                context,
            };
        }

        let total = self.session.total_price();
        let recap = self.build_recap_text();
        match self.session.mode {
            TradeMode::Sell => {
                // Validate availability before any mutation.
                let mut required: BTreeMap<String, u32> = BTreeMap::new();
                for line in &self.session.cart {
                    let entry = required.entry(line.item_id.clone()).or_insert(0);
                    *entry = entry.saturating_add(line.qty);
                }
                for (item_id, qty) in &required {
                    if player.total_item(item_id) < *qty {
                        self.session.status = TradeStatus::Done;
                        let context = self.context_with_status("insufficient_items", player);
                        return TradeOutcome {
                            ok: false,
                            lines: vec![String::from(
                                "Tu n'as plus ces objets en quantite suffisante.",
                            )],
                            context,
                        };
                    }
                }
                for (item_id, qty) in &required {
                    remove_items(player, item_id, *qty);
                }
                player.gold = player.gold.saturating_add(total);
                self.session.status = TradeStatus::Done;
                tracing::debug!(
                    npc = %self.session.npc_id,
                    total,
                    qty = self.session.total_qty(),
                    "sell executed"
                );
                let line = format!("Vente executee: {recap}. Total {total} or.");
                self.push_transcript(&line);
                let context = self.context_with_status("ok", player);
                TradeOutcome {
                    ok: true,
                    lines: vec![line],
                    context,
                }
            }
            TradeMode::Buy => {
                if player.gold < total {
                    self.session.status = TradeStatus::Done;
                    let line = String::from("Or insuffisant pour cette transaction.");
                    self.push_transcript(&line);
                    let context = self.context_with_status("insufficient_funds", player);
                    return TradeOutcome {
                        ok: false,
                        lines: vec![line],
                        context,
                    };
                }
                // Allocate on copies so a slot shortage rolls back clean.
                let mut carried = player.carried.clone();
                let mut storage = player.storage.clone();
                let mut all_placed = true;
                for line in &self.session.cart {
                    let stack_max = item_defs
                        .get(&line.item_id)
                        .map_or(1, ItemDef::stack_limit);
                    let placed =
                        grant_items(&mut carried, &mut storage, &line.item_id, line.qty, stack_max);
                    if placed < line.qty {
                        all_placed = false;
                        break;
                    }
                }
                if !all_placed {
                    self.session.status = TradeStatus::Done;
                    let line = String::from("Inventaire plein: transaction annulee.");
                    self.push_transcript(&line);
                    let context = self.context_with_status("inventory_full", player);
                    return TradeOutcome {
                        ok: false,
                        lines: vec![line],
                        context,
                    };
                }
                player.carried = carried;
                player.storage = storage;
                player.gold = player.gold.saturating_sub(total);
                self.session.status = TradeStatus::Done;
                tracing::debug!(
                    npc = %self.session.npc_id,
                    total,
                    qty = self.session.total_qty(),
                    "buy executed"
                );
                let line = format!("Achat execute: {recap}. Total {total} or.");
                self.push_transcript(&line);
                let context = self.context_with_status("ok", player);
                TradeOutcome {
                    ok: true,
                    lines: vec![line],
                    context,
                }
            }
        }
    }

    fn context_with_status(&self, status: &str, player: &PlayerState) -> TradeContext {
        let first = self.session.cart.first();
        TradeContext {
            action: self.session.mode.as_str().to_owned(),
            mode: self.session.mode.as_str().to_owned(),
            status: status.to_owned(),
            npc_name: self.session.npc_id.clone(),
            qty_offer: first.map_or(0, |line| line.qty),
            qty_done: if status == "ok" { self.session.total_qty() } else { 0 },
            unit_price: first.map_or(0, |line| line.unit_price),
            item_id: first.map_or_else(String::new, |line| line.item_id.clone()),
            item_name: first.map_or_else(String::new, |line| line.item_name.clone()),
            total_price: self.session.total_price(),
            trade_turn_id: self.session.turn_id,
            gold_after: player.gold,
            inventory_after: Self::inventory_totals(player),
            npc_key: None,
            secret_charity_candidate: false,
        }
    }

    fn push_transcript(&mut self, line: &str) {
        let clean = line.trim();
        if clean.is_empty() {
            return;
        }
        self.session.transcript_short.push(clean.to_owned());
        if self.session.transcript_short.len() > TRANSCRIPT_LIMIT {
            let drop = self
                .session
                .transcript_short
                .len()
                .saturating_sub(TRANSCRIPT_LIMIT);
            self.session.transcript_short.drain(..drop);
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory primitives
// ---------------------------------------------------------------------------

/// Remove `qty` of an item, nearest-last-first: carried back to front,
/// then storage back to front. Returns the quantity actually removed.
fn remove_items(player: &mut PlayerState, item_id: &str, qty: u32) -> u32 {
    let mut remaining = qty;
    for grid in [&mut player.carried, &mut player.storage] {
        for slot in grid.slots.iter_mut().rev() {
            if remaining == 0 {
                break;
            }
            let Some(stack) = slot.as_mut() else {
                continue;
            };
            if stack.item_id != item_id {
                continue;
            }
            let take = stack.qty.min(remaining);
            stack.qty = stack.qty.saturating_sub(take);
            remaining = remaining.saturating_sub(take);
            if stack.qty == 0 {
                *slot = None;
            }
        }
        if remaining == 0 {
            break;
        }
    }
    qty.saturating_sub(remaining)
}

/// Place `qty` of an item: merge into existing stacks up to `stack_max`
/// (carried then storage), then fill empty slots. Returns the quantity
/// actually placed.
fn grant_items(
    carried: &mut InventoryGrid,
    storage: &mut InventoryGrid,
    item_id: &str,
    qty: u32,
    stack_max: u32,
) -> u32 {
    let mut remaining = qty;
    for grid in [&mut *carried, &mut *storage] {
        for slot in &mut grid.slots {
            if remaining == 0 {
                break;
            }
            let Some(stack) = slot.as_mut() else {
                continue;
            };
            if stack.item_id != item_id {
                continue;
            }
            let capacity = stack_max.saturating_sub(stack.qty);
            let take = capacity.min(remaining);
            stack.qty = stack.qty.saturating_add(take);
            remaining = remaining.saturating_sub(take);
        }
        if remaining == 0 {
            break;
        }
    }
    while remaining > 0 {
        let target = if carried.first_empty_slot().is_some() {
            &mut *carried
        } else if storage.first_empty_slot().is_some() {
            &mut *storage
        } else {
            break;
        };
        let Some(index) = target.first_empty_slot() else {
            break;
        };
        let take = stack_max.min(remaining);
        target.set(
            index,
            Some(ItemStack {
                item_id: item_id.to_owned(),
                qty: take,
            }),
        );
        remaining = remaining.saturating_sub(take);
    }
    qty.saturating_sub(remaining)
}

// ===========================================================================
// Tests
// ===========================================================================
