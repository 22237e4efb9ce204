//! Reputation rule tables: defaults and JSON overrides.
//!
//! The rule set drives how trades, quests, and dungeon events translate
//! into faction deltas. Defaults are compiled in; an optional JSON
//! document (conventionally `data/world/reputation_rules.json`) can
//! override any subset. Loading never fails: an unreadable or malformed
//! file yields the defaults, and every loaded value passes the same
//! normalization as the defaults (faction names cleaned, deltas clamped
//! to `[-25, 25]`, thresholds at least 1).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::normalize_faction_name;

/// Bound on any single rule delta.
pub const RULE_DELTA_MAX: i32 = 25;

/// Conventional location of the rule override file.
pub const DEFAULT_RULES_PATH: &str = "data/world/reputation_rules.json";

// ---------------------------------------------------------------------------
// Rule tables
// ---------------------------------------------------------------------------

/// Trade-driven reputation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRules {
    /// Faction credited for buy/sell/exchange.
    #[serde(default = "TradeRules::default_merchant_faction")]
    pub merchant_faction: String,
    /// Delta for small transactions.
    #[serde(default = "TradeRules::default_merchant_delta_small")]
    pub merchant_delta_small: i32,
    /// Delta for transactions above the quantity threshold.
    #[serde(default = "TradeRules::default_merchant_delta_large")]
    pub merchant_delta_large: i32,
    /// Quantity threshold separating small from large.
    #[serde(default = "TradeRules::default_merchant_threshold")]
    pub merchant_large_qty_threshold: u32,
    /// Faction credited for charity toward beggars.
    #[serde(default = "TradeRules::default_charity_faction")]
    pub charity_faction: String,
    /// Charity delta for small gifts.
    #[serde(default = "TradeRules::default_charity_delta_small")]
    pub charity_delta_small: i32,
    /// Charity delta above the quantity threshold.
    #[serde(default = "TradeRules::default_charity_delta_large")]
    pub charity_delta_large: i32,
    /// Charity quantity threshold.
    #[serde(default = "TradeRules::default_charity_threshold")]
    pub charity_large_qty_threshold: u32,
    /// Delta for a generic give to a non-beggar.
    #[serde(default = "TradeRules::default_generic_give_delta")]
    pub generic_give_delta: i32,
}

impl Default for TradeRules {
    fn default() -> Self {
        Self {
            merchant_faction: Self::default_merchant_faction(),
            merchant_delta_small: Self::default_merchant_delta_small(),
            merchant_delta_large: Self::default_merchant_delta_large(),
            merchant_large_qty_threshold: Self::default_merchant_threshold(),
            charity_faction: Self::default_charity_faction(),
            charity_delta_small: Self::default_charity_delta_small(),
            charity_delta_large: Self::default_charity_delta_large(),
            charity_large_qty_threshold: Self::default_charity_threshold(),
            generic_give_delta: Self::default_generic_give_delta(),
        }
    }
}

impl TradeRules {
    fn default_merchant_faction() -> String {
        String::from("Marchands")
    }
    const fn default_merchant_delta_small() -> i32 {
        1
    }
    const fn default_merchant_delta_large() -> i32 {
        2
    }
    const fn default_merchant_threshold() -> u32 {
        2
    }
    fn default_charity_faction() -> String {
        String::from("Peuple")
    }
    const fn default_charity_delta_small() -> i32 {
        2
    }
    const fn default_charity_delta_large() -> i32 {
        3
    }
    const fn default_charity_threshold() -> u32 {
        2
    }
    const fn default_generic_give_delta() -> i32 {
        1
    }

    fn normalize(&mut self) {
        self.merchant_faction =
            faction_or(&self.merchant_faction, &Self::default_merchant_faction());
        self.charity_faction = faction_or(&self.charity_faction, &Self::default_charity_faction());
        self.merchant_delta_small = self.merchant_delta_small.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.merchant_delta_large = self.merchant_delta_large.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.charity_delta_small = self.charity_delta_small.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.charity_delta_large = self.charity_delta_large.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.generic_give_delta = self.generic_give_delta.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.merchant_large_qty_threshold = self.merchant_large_qty_threshold.max(1);
        self.charity_large_qty_threshold = self.charity_large_qty_threshold.max(1);
    }
}

/// Quest-completion reputation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestRules {
    /// Faction credited when no objective override applies.
    #[serde(default = "QuestRules::default_faction")]
    pub default_faction: String,
    /// Delta when no objective override applies.
    #[serde(default = "QuestRules::default_delta")]
    pub default_delta: i32,
    /// Per-objective-type delta overrides.
    #[serde(default = "QuestRules::default_objective_deltas")]
    pub objective_deltas: BTreeMap<String, i32>,
    /// Per-objective-type faction overrides.
    #[serde(default = "QuestRules::default_objective_factions")]
    pub objective_factions: BTreeMap<String, String>,
}

impl Default for QuestRules {
    fn default() -> Self {
        Self {
            default_faction: Self::default_faction(),
            default_delta: Self::default_delta(),
            objective_deltas: Self::default_objective_deltas(),
            objective_factions: Self::default_objective_factions(),
        }
    }
}

impl QuestRules {
    fn default_faction() -> String {
        String::from("Habitants")
    }
    const fn default_delta() -> i32 {
        2
    }

    fn default_objective_deltas() -> BTreeMap<String, i32> {
        [
            ("clear_dungeon_floors", 3),
            ("talk_to_npc", 3),
            ("reach_anchor", 3),
            ("explore_locations", 3),
            ("collect_gold", 2),
            ("send_messages", 2),
        ]
        .into_iter()
        .map(|(key, delta)| (key.to_owned(), delta))
        .collect()
    }

    fn default_objective_factions() -> BTreeMap<String, String> {
        [
            ("clear_dungeon_floors", "Aventuriers"),
            ("talk_to_npc", "Aventuriers"),
            ("reach_anchor", "Explorateurs"),
            ("explore_locations", "Explorateurs"),
            ("collect_gold", "Marchands"),
            ("send_messages", "Habitants"),
        ]
        .into_iter()
        .map(|(key, faction)| (key.to_owned(), faction.to_owned()))
        .collect()
    }

    fn normalize(&mut self) {
        self.default_faction = faction_or(&self.default_faction, &Self::default_faction());
        self.default_delta = self.default_delta.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);

        let mut deltas = Self::default_objective_deltas();
        for (key, value) in &self.objective_deltas {
            let objective = key.trim().to_lowercase();
            if objective.is_empty() {
                continue;
            }
            deltas.insert(objective, (*value).clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX));
        }
        self.objective_deltas = deltas;

        let mut factions = Self::default_objective_factions();
        for (key, value) in &self.objective_factions {
            let objective = key.trim().to_lowercase();
            if objective.is_empty() {
                continue;
            }
            let fallback = factions
                .get(&objective)
                .cloned()
                .unwrap_or_else(|| self.default_faction.clone());
            factions.insert(objective, faction_or(value, &fallback));
        }
        self.objective_factions = factions;
    }
}

/// Dungeon-event reputation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DungeonRules {
    /// Faction credited for dungeon milestones.
    #[serde(default = "DungeonRules::default_faction")]
    pub faction: String,
    /// Delta for an ordinary eligible event.
    #[serde(default = "DungeonRules::default_delta")]
    pub default_delta: i32,
    /// Delta on deep floors.
    #[serde(default = "DungeonRules::default_high_floor_delta")]
    pub high_floor_delta: i32,
    /// Floor at which the deep-floor delta applies.
    #[serde(default = "DungeonRules::default_high_floor_threshold")]
    pub high_floor_threshold: u32,
    /// Delta for boss kills.
    #[serde(default = "DungeonRules::default_boss_delta")]
    pub boss_delta: i32,
    /// Event kinds that earn reputation at all.
    #[serde(default = "DungeonRules::default_eligible_events")]
    pub eligible_event_types: Vec<String>,
}

impl Default for DungeonRules {
    fn default() -> Self {
        Self {
            faction: Self::default_faction(),
            default_delta: Self::default_delta(),
            high_floor_delta: Self::default_high_floor_delta(),
            high_floor_threshold: Self::default_high_floor_threshold(),
            boss_delta: Self::default_boss_delta(),
            eligible_event_types: Self::default_eligible_events(),
        }
    }
}

impl DungeonRules {
    fn default_faction() -> String {
        String::from("Aventuriers")
    }
    const fn default_delta() -> i32 {
        1
    }
    const fn default_high_floor_delta() -> i32 {
        2
    }
    const fn default_high_floor_threshold() -> u32 {
        10
    }
    const fn default_boss_delta() -> i32 {
        3
    }

    fn default_eligible_events() -> Vec<String> {
        vec![
            String::from("monster"),
            String::from("mimic"),
            String::from("boss"),
        ]
    }

    fn normalize(&mut self) {
        self.faction = faction_or(&self.faction, &Self::default_faction());
        self.default_delta = self.default_delta.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.high_floor_delta = self.high_floor_delta.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.boss_delta = self.boss_delta.clamp(-RULE_DELTA_MAX, RULE_DELTA_MAX);
        self.high_floor_threshold = self.high_floor_threshold.max(1);
        let events: Vec<String> = self
            .eligible_event_types
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .take(16)
            .collect();
        if events.is_empty() {
            self.eligible_event_types = Self::default_eligible_events();
        } else {
            self.eligible_event_types = events;
        }
    }
}

/// Full rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReputationRules {
    /// Trade rules.
    #[serde(default)]
    pub trade: TradeRules,
    /// Quest rules.
    #[serde(default)]
    pub quest: QuestRules,
    /// Dungeon rules.
    #[serde(default)]
    pub dungeon: DungeonRules,
}

impl ReputationRules {
    /// Re-establish every documented bound in place.
    pub fn normalize(&mut self) {
        self.trade.normalize();
        self.quest.normalize();
        self.dungeon.normalize();
    }
}

fn faction_or(raw: &str, fallback: &str) -> String {
    let name = normalize_faction_name(raw);
    if name.is_empty() {
        fallback.to_owned()
    } else {
        name
    }
}

/// Load a rule override file; defaults on any failure, normalized either
/// way.
pub fn load_reputation_rules(path: &Path) -> ReputationRules {
    let mut rules = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ReputationRules>(&raw).ok())
        .unwrap_or_default();
    rules.normalize();
    rules
}

/// Load the conventional override file ([`DEFAULT_RULES_PATH`]).
pub fn load_default_reputation_rules() -> ReputationRules {
    load_reputation_rules(Path::new(DEFAULT_RULES_PATH))
}

// ===========================================================================
// Tests
// ===========================================================================
