//! Faction reputation ledger for the Chronique narrative engine.
//!
//! Reputation is an ordered map of faction name to score in
//! `[-100, 100]`, backed by an append-only audit log (capped at 200
//! entries). Scores move through [`adjust_reputation`] only, which
//! clamps every delta to `[-25, 25]` and records before/after values.
//!
//! On top of the ledger sit the derived views: tier labels
//! ([`reputation_tier`]), the merchant price multiplier driving trade
//! pricing, token-matched scene gating, and the rule-driven application
//! of trade, quest, and dungeon outcomes. Quest applications are
//! idempotent: a claimed flag inside the quest object guards reruns.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

pub mod rules;

pub use rules::{
    DEFAULT_RULES_PATH, DungeonRules, QuestRules, ReputationRules, TradeRules,
    load_default_reputation_rules, load_reputation_rules,
};

/// Lower bound of any faction score.
pub const REPUTATION_MIN: i32 = -100;

/// Upper bound of any faction score.
pub const REPUTATION_MAX: i32 = 100;

/// Maximum audit log entries retained (newest kept).
pub const REPUTATION_LOG_MAX_ITEMS: usize = 200;

/// Maximum length of a log reason.
pub const REASON_MAX: usize = 140;

/// Maximum length of a log source.
pub const SOURCE_MAX: usize = 64;

/// Tier thresholds, ascending; the highest threshold at or below the
/// score wins.
const REPUTATION_TIERS: [(i32, &str); 6] = [
    (-100, "haine"),
    (-60, "hostile"),
    (-20, "mefiant"),
    (20, "neutre"),
    (50, "respecte"),
    (75, "honore"),
];

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One audit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReputationLogEntry {
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub at: String,
    /// Faction whose score moved.
    #[serde(default)]
    pub faction: String,
    /// Effective delta (`after - before`).
    #[serde(default)]
    pub delta: i32,
    /// Score before.
    #[serde(default)]
    pub before: i32,
    /// Score after.
    #[serde(default)]
    pub after: i32,
    /// Why (at most 140 characters).
    #[serde(default)]
    pub reason: String,
    /// Which subsystem (at most 64 characters).
    #[serde(default)]
    pub source: String,
}

/// Faction scores plus the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReputationState {
    /// Scores keyed by normalized faction name, clamped to
    /// `[-100, 100]`.
    #[serde(default)]
    pub scores: BTreeMap<String, i32>,
    /// Append-only audit log (at most 200 entries, newest kept).
    #[serde(default)]
    pub log: Vec<ReputationLogEntry>,
}

/// Minimal NPC profile slice used for faction inference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NpcProfile {
    /// Role keyword (`marchand`, `garde`, ...).
    #[serde(default)]
    pub role: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
}

/// Trade outcome slice consumed by [`apply_trade_reputation`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TradeReputationContext {
    /// Trade action (`buy`, `sell`, `exchange`, `give`).
    pub action: String,
    /// Outcome status; only `ok` earns reputation.
    pub status: String,
    /// Quantity actually moved.
    pub qty_done: u32,
    /// Whether the counterpart is a beggar (charity path).
    pub target_is_beggar: bool,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a faction name: strip punctuation except `'`, `’`, `-`,
/// `_`, collapse whitespace, cap at 64 characters.
pub fn normalize_faction_name(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len().min(64));
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() || matches!(ch, ' ' | '_' | '\'' | '’' | '-') {
            cleaned.push(ch);
        }
    }
    let mut out = String::with_capacity(cleaned.len());
    let mut last_was_space = true;
    for ch in cleaned.chars() {
        if ch == ' ' {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out.chars().take(64).collect()
}

const fn clamp_reputation(value: i32) -> i32 {
    if value < REPUTATION_MIN {
        REPUTATION_MIN
    } else if value > REPUTATION_MAX {
        REPUTATION_MAX
    } else {
        value
    }
}

/// Normalize scores and log in place. This is a fixed point: a second
/// call on already-normalized state changes nothing.
pub fn ensure_reputation_state(state: &mut ReputationState) {
    let mut cleaned: BTreeMap<String, i32> = BTreeMap::new();
    for (key, value) in &state.scores {
        let faction = normalize_faction_name(key);
        if faction.is_empty() {
            continue;
        }
        cleaned.insert(faction, clamp_reputation(*value));
    }
    state.scores = cleaned;

    let start = state.log.len().saturating_sub(REPUTATION_LOG_MAX_ITEMS);
    let mut sanitized: Vec<ReputationLogEntry> = Vec::new();
    for raw in state.log.iter().skip(start) {
        let faction = normalize_faction_name(&raw.faction);
        if faction.is_empty() {
            continue;
        }
        sanitized.push(ReputationLogEntry {
            at: raw.at.clone(),
            faction,
            delta: raw.delta,
            before: clamp_reputation(raw.before),
            after: clamp_reputation(raw.after),
            reason: raw.reason.chars().take(REASON_MAX).collect(),
            source: raw.source.chars().take(SOURCE_MAX).collect(),
        });
    }
    state.log = sanitized;
}

// ---------------------------------------------------------------------------
// Core mutation
// ---------------------------------------------------------------------------

/// Adjust a faction score.
///
/// The delta is clamped to `[-25, 25]`; a zero delta (or empty faction)
/// is a no-op returning the current score. Every effective change
/// appends a log entry with the clamped before/after values.
pub fn adjust_reputation(
    state: &mut ReputationState,
    faction: &str,
    delta: i32,
    reason: &str,
    source: &str,
) -> i32 {
    ensure_reputation_state(state);
    let faction_name = normalize_faction_name(faction);
    if faction_name.is_empty() {
        return 0;
    }

    let change = delta.clamp(-rules::RULE_DELTA_MAX, rules::RULE_DELTA_MAX);
    if change == 0 {
        return state.scores.get(&faction_name).copied().unwrap_or(0);
    }

    let before = clamp_reputation(state.scores.get(&faction_name).copied().unwrap_or(0));
    let after = clamp_reputation(before.saturating_add(change));
    state.scores.insert(faction_name.clone(), after);
    tracing::debug!(faction = %faction_name, before, after, source, "reputation adjusted");

    state.log.push(ReputationLogEntry {
        at: Utc::now().to_rfc3339(),
        faction: faction_name,
        delta: after.saturating_sub(before),
        before,
        after,
        reason: reason.chars().take(REASON_MAX).collect(),
        source: source.chars().take(SOURCE_MAX).collect(),
    });
    if state.log.len() > REPUTATION_LOG_MAX_ITEMS {
        let drop = state.log.len().saturating_sub(REPUTATION_LOG_MAX_ITEMS);
        state.log.drain(..drop);
    }
    after
}

// ---------------------------------------------------------------------------
// Derived views
// ---------------------------------------------------------------------------

/// Tier label for a score (informative, not authoritative).
pub fn reputation_tier(score: i32) -> &'static str {
    let value = clamp_reputation(score);
    let mut current = "neutre";
    for (threshold, label) in REPUTATION_TIERS {
        if value >= threshold {
            current = label;
        }
    }
    current
}

/// Merchant price multiplier for a `Marchands` score.
pub fn merchant_price_multiplier(score: i32) -> f64 {
    if score <= -60 {
        1.35
    } else if score <= -20 {
        1.15
    } else if score >= 75 {
        0.78
    } else if score >= 50 {
        0.85
    } else if score >= 20 {
        0.93
    } else {
        1.0
    }
}

/// Score for a faction, 0 when unknown.
pub fn faction_score(state: &ReputationState, faction: &str) -> i32 {
    state
        .scores
        .get(&normalize_faction_name(faction))
        .copied()
        .unwrap_or(0)
}

/// Check whether reputation gates entry to a scene.
///
/// Token groups over the merged scene id and title (scene names in this
/// French-language world show up both accented and unaccented, so both
/// spellings gate):
/// - palais / citadelle / tribunal / conseil / caserne require
///   `Autorites >= -10`;
/// - banque / hotel des monnaies / marche (and their accented forms)
///   require `Marchands >= -20`;
/// - academie (or académie) / laboratoire / observatoire / scriptoria
///   require `Arcanistes >= -15`.
///
/// Returns `(allowed, refusal_reason)`; the reason is empty when
/// allowed.
pub fn can_access_scene(
    state: &mut ReputationState,
    scene_id: &str,
    scene_title: &str,
) -> (bool, String) {
    ensure_reputation_state(state);
    let merged = format!(
        "{} {}",
        scene_id.trim().to_lowercase(),
        scene_title.trim().to_lowercase()
    );

    let autorites = faction_score(state, "Autorites");
    let marchands = faction_score(state, "Marchands");
    let arcanistes = faction_score(state, "Arcanistes");

    let has_any = |tokens: &[&str]| tokens.iter().any(|token| merged.contains(token));

    if has_any(&["palais", "citadelle", "tribunal", "conseil", "caserne"]) && autorites < -10 {
        return (
            false,
            String::from("Acces refuse: votre reputation avec les Autorites est trop basse."),
        );
    }
    if has_any(&["banque", "hotel_monnaies", "hôtel_monnaies", "marche", "marché"])
        && marchands < -20
    {
        return (false, String::from("Les Marchands vous ferment leurs portes."));
    }
    if has_any(&["academie", "académie", "laboratoire", "observatoire", "scriptoria"])
        && arcanistes < -15
    {
        return (false, String::from("Les Arcanistes refusent de vous recevoir."));
    }

    (true, String::new())
}

/// Compact display summary: strongest scores first.
pub fn reputation_summary(state: &mut ReputationState, limit: usize) -> String {
    ensure_reputation_state(state);
    let mut rows: Vec<(&String, &i32)> = state.scores.iter().collect();
    rows.sort_by(|a, b| b.1.abs().cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
    if rows.is_empty() {
        return String::from("aucune");
    }
    rows.iter()
        .take(limit.max(1))
        .map(|(faction, score)| {
            let sign = if **score >= 0 { "+" } else { "" };
            format!("{faction}:{sign}{score} ({})", reputation_tier(**score))
        })
        .collect::<Vec<String>>()
        .join(" | ")
}

fn format_delta(delta: i32) -> String {
    if delta >= 0 {
        format!("+{delta}")
    } else {
        delta.to_string()
    }
}

// ---------------------------------------------------------------------------
// Faction inference
// ---------------------------------------------------------------------------

/// Guess the faction an NPC answers to from role, label, and location
/// anchor.
pub fn infer_npc_faction(npc_name: &str, npc_profile: Option<&NpcProfile>, map_anchor: &str) -> String {
    let role = npc_profile.map(|p| p.role.to_lowercase()).unwrap_or_default();
    let label = npc_profile
        .map(|p| p.label.clone())
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| npc_name.to_owned())
        .to_lowercase();
    let combined = format!("{role} {label}");

    let has_any = |tokens: &[&str]| tokens.iter().any(|token| combined.contains(token));

    if has_any(&["marchand", "boutique", "forgeron", "artisan", "banquier"]) {
        return String::from("Marchands");
    }
    if has_any(&["garde", "milice", "officier", "capitaine", "soldat"]) {
        return String::from("Autorites");
    }
    if has_any(&["pretre", "pretresse", "temple", "acolyte", "moine", "sanctuaire"]) {
        return String::from("Ordres Sacres");
    }
    if has_any(&["mendiant", "pauvre", "vagabond", "peuple"]) {
        return String::from("Peuple");
    }
    if has_any(&["mage", "alchim", "sorc", "academie", "arcan"]) {
        return String::from("Arcanistes");
    }
    let anchor = map_anchor.trim();
    if !anchor.is_empty() {
        let short: String = anchor.chars().take(32).collect();
        return format!("Habitants de {short}");
    }
    String::from("Habitants")
}

// ---------------------------------------------------------------------------
// Rule application: trade
// ---------------------------------------------------------------------------

/// Translate a completed trade into faction deltas.
///
/// Only contexts with status `ok` earn anything. Buy/sell/exchange
/// credit the merchant faction (small or large delta on the quantity
/// threshold); gives credit the charity faction when the counterpart is
/// a beggar, else the inferred NPC faction with the generic give delta.
/// Returns display lines of the form `"{faction} {+d} ({score})"`.
pub fn apply_trade_reputation(
    state: &mut ReputationState,
    ctx: &TradeReputationContext,
    npc_name: &str,
    npc_profile: Option<&NpcProfile>,
    map_anchor: &str,
    rules: &ReputationRules,
) -> Vec<String> {
    let action = ctx.action.trim().to_lowercase();
    let status = ctx.status.trim().to_lowercase();
    if status != "ok" {
        return Vec::new();
    }

    let mut lines: Vec<String> = Vec::new();
    let qty = ctx.qty_done.max(1);

    if matches!(action.as_str(), "buy" | "sell" | "exchange") {
        let trade = &rules.trade;
        let delta = if qty > trade.merchant_large_qty_threshold {
            trade.merchant_delta_large
        } else {
            trade.merchant_delta_small
        };
        let score = adjust_reputation(
            state,
            &trade.merchant_faction,
            delta,
            &format!("transaction:{action}"),
            "trade",
        );
        lines.push(format!(
            "{} {} ({score})",
            trade.merchant_faction,
            format_delta(delta)
        ));
    }

    if action == "give" {
        let trade = &rules.trade;
        if ctx.target_is_beggar {
            let delta = if qty > trade.charity_large_qty_threshold {
                trade.charity_delta_large
            } else {
                trade.charity_delta_small
            };
            let score = adjust_reputation(state, &trade.charity_faction, delta, "charite", "trade");
            lines.push(format!(
                "{} {} ({score})",
                trade.charity_faction,
                format_delta(delta)
            ));
        } else {
            let faction = infer_npc_faction(npc_name, npc_profile, map_anchor);
            let delta = trade.generic_give_delta;
            let score = adjust_reputation(state, &faction, delta, "don", "trade");
            lines.push(format!("{faction} {} ({score})", format_delta(delta)));
        }
    }

    lines
}

// ---------------------------------------------------------------------------
// Rule application: quests and dungeon
// ---------------------------------------------------------------------------

/// Quest objective slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuestObjective {
    /// Objective type keyword (`collect_gold`, `talk_to_npc`, ...).
    #[serde(default, rename = "type")]
    pub objective_type: String,
}

/// One branching option with its reputation map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuestBranchOption {
    /// Option id.
    #[serde(default)]
    pub id: String,
    /// Faction deltas granted by this branch.
    #[serde(default)]
    pub reputation: BTreeMap<String, i32>,
}

/// Branch selection recorded on a quest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuestBranching {
    /// Id of the branch the player chose.
    #[serde(default)]
    pub selected_option_id: String,
    /// All offered branches.
    #[serde(default)]
    pub options: Vec<QuestBranchOption>,
}

/// The quest slice the reputation ledger reads and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuestState {
    /// Quest id.
    #[serde(default)]
    pub id: String,
    /// Lifecycle status; only `completed` earns reputation.
    #[serde(default)]
    pub status: String,
    /// Name of the NPC who gave the quest, when any.
    #[serde(default)]
    pub source_npc_name: String,
    /// Objective slice.
    #[serde(default)]
    pub objective: QuestObjective,
    /// Guard: completion reputation already granted.
    #[serde(default)]
    pub reputation_claimed: bool,
    /// Branch selection, when the quest branches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branching: Option<QuestBranching>,
    /// Guard: branch reputation already granted.
    #[serde(default)]
    pub branch_reputation_claimed: bool,
}

/// Grant completion reputation for a quest, exactly once.
///
/// The second invocation returns empty and changes nothing: the
/// `reputation_claimed` flag stored inside the quest guards reruns.
pub fn apply_quest_completion_reputation(
    state: &mut ReputationState,
    quest: &mut QuestState,
    rules: &ReputationRules,
) -> Vec<String> {
    if quest.reputation_claimed || quest.status != "completed" {
        return Vec::new();
    }

    let quest_rules = &rules.quest;
    let objective_type = quest.objective.objective_type.trim().to_lowercase();
    let mut delta = quest_rules.default_delta;
    if let Some(override_delta) = quest_rules.objective_deltas.get(&objective_type) {
        delta = *override_delta;
    }
    let mut faction = quest_rules
        .objective_factions
        .get(&objective_type)
        .cloned()
        .unwrap_or_else(|| quest_rules.default_faction.clone());

    let source_npc = quest.source_npc_name.trim();
    if !source_npc.is_empty() {
        faction = infer_npc_faction(source_npc, None, "");
    }

    let reason_kind = if objective_type.is_empty() {
        String::from("generic")
    } else {
        objective_type
    };
    let score = adjust_reputation(state, &faction, delta, &format!("quest:{reason_kind}"), "quest");
    quest.reputation_claimed = true;
    vec![format!("{faction} {} ({score})", format_delta(delta))]
}

/// Grant branch reputation for a completed quest, exactly once.
pub fn apply_quest_branch_reputation(
    state: &mut ReputationState,
    quest: &mut QuestState,
) -> Vec<String> {
    if quest.status != "completed" || quest.branch_reputation_claimed {
        return Vec::new();
    }

    let Some(branching) = quest.branching.as_ref() else {
        quest.branch_reputation_claimed = true;
        return Vec::new();
    };
    let selected_id = branching.selected_option_id.trim().to_lowercase();
    let Some(selected) = branching
        .options
        .iter()
        .find(|row| row.id.trim().to_lowercase() == selected_id)
    else {
        quest.branch_reputation_claimed = true;
        return Vec::new();
    };
    if selected.reputation.is_empty() {
        quest.branch_reputation_claimed = true;
        return Vec::new();
    }

    let reputation = selected.reputation.clone();
    let quest_id = quest.id.clone();
    let mut lines: Vec<String> = Vec::new();
    for (faction, raw_delta) in reputation {
        let delta = raw_delta.clamp(-rules::RULE_DELTA_MAX, rules::RULE_DELTA_MAX);
        if delta == 0 {
            continue;
        }
        let score = adjust_reputation(
            state,
            &faction,
            delta,
            &format!("quest_branch:{quest_id}"),
            "quest_branch",
        );
        lines.push(format!("{faction} {} ({score})", format_delta(delta)));
    }
    quest.branch_reputation_claimed = true;
    lines
}

/// Grant dungeon-event reputation.
///
/// Only eligible event kinds earn anything; boss kills use the boss
/// delta, deep floors the high-floor delta, everything else the default.
pub fn apply_dungeon_reputation(
    state: &mut ReputationState,
    floor: u32,
    event_type: &str,
    rules: &ReputationRules,
) -> Vec<String> {
    let dungeon = &rules.dungeon;
    let kind = event_type.trim().to_lowercase();
    if !dungeon.eligible_event_types.iter().any(|row| *row == kind) {
        return Vec::new();
    }

    let delta = if kind == "boss" {
        dungeon.boss_delta
    } else if floor >= dungeon.high_floor_threshold {
        dungeon.high_floor_delta
    } else {
        dungeon.default_delta
    };

    let score = adjust_reputation(
        state,
        &dungeon.faction,
        delta,
        &format!("dungeon:{kind}"),
        "dungeon",
    );
    vec![format!("{} {} ({score})", dungeon.faction, format_delta(delta))]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn ensure_state_sanitizes_and_clamps() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from(" Marchands!!! "), 250);
        state.scores.insert(String::new(), 12);
        state.scores.insert(String::from("Peuple"), -999);
        state.log.push(ReputationLogEntry {
            at: String::from("2026-01-01T00:00:00+00:00"),
            faction: String::from("Peuple"),
            delta: 5,
            before: -200,
            after: 120,
            reason: "x".repeat(400),
            source: String::from("trade"),
        });
        state.log.push(ReputationLogEntry::default());

        ensure_reputation_state(&mut state);

        assert_eq!(state.scores.get("Marchands"), Some(&100));
        assert_eq!(state.scores.get("Peuple"), Some(&-100));
        assert_eq!(state.scores.len(), 2);
        assert_eq!(state.log.len(), 1);
        let entry = state.log.first().unwrap();
        assert_eq!(entry.before, -100);
        assert_eq!(entry.after, 100);
        assert!(entry.reason.len() <= REASON_MAX);
    }

    #[test]
    fn ensure_state_is_a_fixed_point() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Marchands!"), 42);
        ensure_reputation_state(&mut state);
        let snapshot = state.clone();
        ensure_reputation_state(&mut state);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn faction_names_keep_apostrophes_and_dashes() {
        assert_eq!(normalize_faction_name("Gardiens de l'Aube"), "Gardiens de l'Aube");
        assert_eq!(normalize_faction_name("Clan Noir-Roc!!"), "Clan Noir-Roc");
    }

    // -----------------------------------------------------------------------
    // Adjust
    // -----------------------------------------------------------------------

    #[test]
    fn adjust_clamps_delta_and_logs() {
        let mut state = ReputationState::default();
        let after = adjust_reputation(&mut state, "Marchands", 99, "gros contrat", "trade");
        assert_eq!(after, 25);
        let entry = state.log.first().unwrap();
        assert_eq!(entry.delta, 25);
        assert_eq!(entry.before, 0);
        assert_eq!(entry.after, 25);
        assert_eq!(entry.source, "trade");
    }

    #[test]
    fn adjust_zero_delta_is_a_noop() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Peuple"), 7);
        let score = adjust_reputation(&mut state, "Peuple", 0, "", "");
        assert_eq!(score, 7);
        assert!(state.log.is_empty());
    }

    #[test]
    fn adjust_saturates_at_bounds() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Autorites"), 95);
        let after = adjust_reputation(&mut state, "Autorites", 25, "", "");
        assert_eq!(after, 100);
        // The logged delta reflects the effective movement.
        assert_eq!(state.log.first().unwrap().delta, 5);
    }

    #[test]
    fn log_is_capped_at_maximum() {
        let mut state = ReputationState::default();
        for i in 0..220 {
            let delta = if i % 2 == 0 { 1 } else { -1 };
            adjust_reputation(&mut state, "Peuple", delta, "tick", "test");
        }
        assert_eq!(state.log.len(), REPUTATION_LOG_MAX_ITEMS);
    }

    // -----------------------------------------------------------------------
    // Tiers and pricing
    // -----------------------------------------------------------------------

    #[test]
    fn tier_steps_match_thresholds() {
        assert_eq!(reputation_tier(-100), "haine");
        assert_eq!(reputation_tier(-60), "hostile");
        assert_eq!(reputation_tier(-21), "mefiant");
        assert_eq!(reputation_tier(0), "mefiant");
        assert_eq!(reputation_tier(20), "neutre");
        assert_eq!(reputation_tier(50), "respecte");
        assert_eq!(reputation_tier(75), "honore");
        assert_eq!(reputation_tier(100), "honore");
    }

    #[test]
    fn merchant_multiplier_bands() {
        assert!((merchant_price_multiplier(-80) - 1.35).abs() < f64::EPSILON);
        assert!((merchant_price_multiplier(-30) - 1.15).abs() < f64::EPSILON);
        assert!((merchant_price_multiplier(0) - 1.0).abs() < f64::EPSILON);
        assert!((merchant_price_multiplier(25) - 0.93).abs() < f64::EPSILON);
        assert!((merchant_price_multiplier(60) - 0.85).abs() < f64::EPSILON);
        assert!((merchant_price_multiplier(90) - 0.78).abs() < f64::EPSILON);
    }

    // -----------------------------------------------------------------------
    // Scene gating
    // -----------------------------------------------------------------------

    #[test]
    fn scene_access_blocks_low_authority() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Autorites"), -30);
        let (allowed, reason) = can_access_scene(&mut state, "palais_royal", "Palais");
        assert!(!allowed);
        assert!(reason.contains("Autorites"));
    }

    #[test]
    fn scene_access_allows_neutral_visitor() {
        let mut state = ReputationState::default();
        let (allowed, reason) = can_access_scene(&mut state, "palais_royal", "Palais");
        assert!(allowed);
        assert!(reason.is_empty());
    }

    #[test]
    fn scene_access_checks_merchant_and_arcanist_gates() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Marchands"), -30);
        let (allowed, _) = can_access_scene(&mut state, "marche_central", "Grand Marche");
        assert!(!allowed);

        let mut state2 = ReputationState::default();
        state2.scores.insert(String::from("Arcanistes"), -20);
        let (allowed2, _) = can_access_scene(&mut state2, "academie_est", "Academie");
        assert!(!allowed2);
    }

    #[test]
    fn scene_access_matches_accented_spellings() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Marchands"), -30);
        let (allowed, _) = can_access_scene(&mut state, "hôtel_monnaies", "Hôtel des Monnaies");
        assert!(!allowed);
        let (allowed_market, _) = can_access_scene(&mut state, "grand_bazar", "Grand Marché");
        assert!(!allowed_market);

        let mut state2 = ReputationState::default();
        state2.scores.insert(String::from("Arcanistes"), -20);
        let (allowed2, _) = can_access_scene(&mut state2, "tour_est", "Académie Arcanique");
        assert!(!allowed2);
    }

    #[test]
    fn ungated_scene_is_always_open() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Autorites"), -100);
        let (allowed, _) = can_access_scene(&mut state, "taverne", "La Taverne du Pont");
        assert!(allowed);
    }

    // -----------------------------------------------------------------------
    // Faction inference
    // -----------------------------------------------------------------------

    #[test]
    fn infer_faction_from_role_keywords() {
        let merchant = NpcProfile {
            role: String::from("marchand"),
            label: String::new(),
        };
        assert_eq!(infer_npc_faction("Brak", Some(&merchant), ""), "Marchands");

        let guard = NpcProfile {
            role: String::from("capitaine de la garde"),
            label: String::new(),
        };
        assert_eq!(infer_npc_faction("Ilda", Some(&guard), ""), "Autorites");

        assert_eq!(infer_npc_faction("Forgeron Brak", None, ""), "Marchands");
        assert_eq!(infer_npc_faction("Inconnu", None, "Lumeria"), "Habitants de Lumeria");
        assert_eq!(infer_npc_faction("Inconnu", None, ""), "Habitants");
    }

    // -----------------------------------------------------------------------
    // Trade application
    // -----------------------------------------------------------------------

    #[test]
    fn charity_give_credits_peuple() {
        let mut state = ReputationState::default();
        let lines = apply_trade_reputation(
            &mut state,
            &TradeReputationContext {
                action: String::from("give"),
                status: String::from("ok"),
                qty_done: 2,
                target_is_beggar: true,
            },
            "Mendiant",
            Some(&NpcProfile {
                role: String::from("mendiant"),
                label: String::new(),
            }),
            "Lumeria",
            &ReputationRules::default(),
        );
        assert_eq!(lines, vec![String::from("Peuple +2 (2)")]);
        assert_eq!(state.scores.get("Peuple"), Some(&2));
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.log.first().unwrap().source, "trade");
    }

    #[test]
    fn large_sale_uses_large_delta() {
        let mut state = ReputationState::default();
        let lines = apply_trade_reputation(
            &mut state,
            &TradeReputationContext {
                action: String::from("sell"),
                status: String::from("ok"),
                qty_done: 5,
                target_is_beggar: false,
            },
            "Marchande",
            None,
            "",
            &ReputationRules::default(),
        );
        assert_eq!(lines, vec![String::from("Marchands +2 (2)")]);
    }

    #[test]
    fn failed_trade_earns_nothing() {
        let mut state = ReputationState::default();
        let lines = apply_trade_reputation(
            &mut state,
            &TradeReputationContext {
                action: String::from("sell"),
                status: String::from("insufficient_funds"),
                qty_done: 1,
                target_is_beggar: false,
            },
            "Marchande",
            None,
            "",
            &ReputationRules::default(),
        );
        assert!(lines.is_empty());
        assert!(state.scores.is_empty());
    }

    #[test]
    fn generic_give_uses_inferred_faction() {
        let mut state = ReputationState::default();
        let lines = apply_trade_reputation(
            &mut state,
            &TradeReputationContext {
                action: String::from("give"),
                status: String::from("ok"),
                qty_done: 1,
                target_is_beggar: false,
            },
            "Forgeron Brak",
            None,
            "",
            &ReputationRules::default(),
        );
        assert_eq!(lines, vec![String::from("Marchands +1 (1)")]);
    }

    // -----------------------------------------------------------------------
    // Quest application
    // -----------------------------------------------------------------------

    #[test]
    fn quest_completion_is_idempotent() {
        let mut state = ReputationState::default();
        let mut quest = QuestState {
            status: String::from("completed"),
            source_npc_name: String::from("Forgeron Brak"),
            objective: QuestObjective {
                objective_type: String::from("send_messages"),
            },
            ..QuestState::default()
        };
        let rules = ReputationRules::default();
        let first = apply_quest_completion_reputation(&mut state, &mut quest, &rules);
        let second = apply_quest_completion_reputation(&mut state, &mut quest, &rules);
        assert_eq!(first, vec![String::from("Marchands +2 (2)")]);
        assert!(second.is_empty());
        assert_eq!(state.scores.get("Marchands"), Some(&2));
    }

    #[test]
    fn quest_objective_routes_faction_without_source_npc() {
        let mut state = ReputationState::default();
        let mut quest = QuestState {
            status: String::from("completed"),
            objective: QuestObjective {
                objective_type: String::from("explore_locations"),
            },
            ..QuestState::default()
        };
        let lines =
            apply_quest_completion_reputation(&mut state, &mut quest, &ReputationRules::default());
        assert_eq!(lines, vec![String::from("Explorateurs +3 (3)")]);
    }

    #[test]
    fn incomplete_quest_earns_nothing() {
        let mut state = ReputationState::default();
        let mut quest = QuestState {
            status: String::from("active"),
            ..QuestState::default()
        };
        let lines =
            apply_quest_completion_reputation(&mut state, &mut quest, &ReputationRules::default());
        assert!(lines.is_empty());
        assert!(!quest.reputation_claimed);
    }

    #[test]
    fn branch_reputation_applies_selected_option_once() {
        let mut state = ReputationState::default();
        let mut quest = QuestState {
            id: String::from("q42"),
            status: String::from("completed"),
            branching: Some(QuestBranching {
                selected_option_id: String::from("mercy"),
                options: vec![
                    QuestBranchOption {
                        id: String::from("mercy"),
                        reputation: [(String::from("Peuple"), 3)].into_iter().collect(),
                    },
                    QuestBranchOption {
                        id: String::from("iron"),
                        reputation: [(String::from("Autorites"), 3)].into_iter().collect(),
                    },
                ],
            }),
            ..QuestState::default()
        };
        let first = apply_quest_branch_reputation(&mut state, &mut quest);
        let second = apply_quest_branch_reputation(&mut state, &mut quest);
        assert_eq!(first, vec![String::from("Peuple +3 (3)")]);
        assert!(second.is_empty());
        assert_eq!(state.scores.get("Autorites"), None);
    }

    #[test]
    fn branchless_quest_claims_silently() {
        let mut state = ReputationState::default();
        let mut quest = QuestState {
            status: String::from("completed"),
            ..QuestState::default()
        };
        let lines = apply_quest_branch_reputation(&mut state, &mut quest);
        assert!(lines.is_empty());
        assert!(quest.branch_reputation_claimed);
    }

    // -----------------------------------------------------------------------
    // Dungeon application
    // -----------------------------------------------------------------------

    #[test]
    fn dungeon_boss_uses_boss_delta() {
        let mut state = ReputationState::default();
        let lines = apply_dungeon_reputation(&mut state, 3, "boss", &ReputationRules::default());
        assert_eq!(lines, vec![String::from("Aventuriers +3 (3)")]);
    }

    #[test]
    fn dungeon_deep_floor_uses_high_delta() {
        let mut state = ReputationState::default();
        let lines = apply_dungeon_reputation(&mut state, 12, "monster", &ReputationRules::default());
        assert_eq!(lines, vec![String::from("Aventuriers +2 (2)")]);
    }

    #[test]
    fn dungeon_ineligible_event_earns_nothing() {
        let mut state = ReputationState::default();
        let lines = apply_dungeon_reputation(&mut state, 12, "chest", &ReputationRules::default());
        assert!(lines.is_empty());
    }

    // -----------------------------------------------------------------------
    // Summary
    // -----------------------------------------------------------------------

    #[test]
    fn summary_orders_by_magnitude() {
        let mut state = ReputationState::default();
        state.scores.insert(String::from("Peuple"), 5);
        state.scores.insert(String::from("Autorites"), -60);
        let summary = reputation_summary(&mut state, 6);
        assert!(summary.starts_with("Autorites:-60 (hostile)"));
        assert!(summary.contains("Peuple:+5"));
    }

    #[test]
    fn empty_summary_reads_none() {
        let mut state = ReputationState::default();
        assert_eq!(reputation_summary(&mut state, 6), "aucune");
    }
}
