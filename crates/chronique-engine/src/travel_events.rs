//! Route event pool: weighted selection and the five event templates.
//!
//! Event selection runs in two stages. First the base weight table
//! (encounter 24, hazard 21, discovery 21, ambush 20, camp 14) is
//! modulated by world tension, instability, time of day, a caller-
//! provided percentage bias (clamped to `[-80, +180]`), and a recency
//! penalty: each of the last two fired types has its weight multiplied
//! by 0.35 (rounded, floor 1). Then a uniform roll over the summed
//! weights picks the type in declaration order.
//!
//! Each template carries three choices; every choice pairs an open
//! `state_patch` for the orchestrator with a closed [`TravelPatch`]
//! applied by the engine itself.

use std::collections::BTreeMap;

use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Event vocabulary
// ---------------------------------------------------------------------------

/// Route event families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TravelEventType {
    /// Someone or something blocks the way.
    #[default]
    Encounter,
    /// A hostile surprise.
    Ambush,
    /// Terrain or weather obstacle.
    Hazard,
    /// Something worth a detour.
    Discovery,
    /// A camp interlude.
    Camp,
}

impl TravelEventType {
    /// All types, in roll order.
    pub const ROLL_ORDER: [Self; 5] = [
        Self::Encounter,
        Self::Hazard,
        Self::Discovery,
        Self::Ambush,
        Self::Camp,
    ];

    /// Parse a wire string, falling back to [`TravelEventType::Encounter`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "ambush" => Self::Ambush,
            "hazard" => Self::Hazard,
            "discovery" => Self::Discovery,
            "camp" => Self::Camp,
            _ => Self::Encounter,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Encounter => "encounter",
            Self::Ambush => "ambush",
            Self::Hazard => "hazard",
            Self::Discovery => "discovery",
            Self::Camp => "camp",
        }
    }
}

// ---------------------------------------------------------------------------
// Patch and event shapes
// ---------------------------------------------------------------------------

/// Supplies consumed by a travel patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Supplies {
    /// Food units.
    #[serde(default)]
    pub food: u32,
    /// Water units.
    #[serde(default)]
    pub water: u32,
    /// Torches.
    #[serde(default)]
    pub torches: u32,
}

/// Closed-shape deltas a choice applies to the travel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TravelPatch {
    /// Progress movement (clamped to the route).
    #[serde(default)]
    pub progress_delta: i32,
    /// Fatigue movement (clamped to `[0, 100]`).
    #[serde(default)]
    pub fatigue_delta: i32,
    /// Danger movement (clamped to `[0, 100]`).
    #[serde(default)]
    pub danger_delta: i32,
    /// Optional status transition (`traveling`, `camping`, `aborted`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Optional supply consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplies: Option<Supplies>,
}

/// One resolvable choice on a route event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TravelChoice {
    /// Choice id (case-insensitive match on resolution).
    #[serde(default)]
    pub id: String,
    /// Player-facing label.
    #[serde(default)]
    pub text: String,
    /// Risk label (`faible`, `moyen`, `eleve`).
    #[serde(default)]
    pub risk_tag: String,
    /// Short hint about the consequences.
    #[serde(default)]
    pub effects_hint: String,
    /// Open patch handed to the orchestrator on resolution.
    #[serde(default)]
    pub state_patch: Value,
    /// Closed patch applied to the travel state on resolution.
    #[serde(default)]
    pub travel_patch: TravelPatch,
}

/// A pending route event awaiting a player choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TravelEvent {
    /// Opaque event id.
    #[serde(default)]
    pub id: String,
    /// Event family.
    #[serde(default, rename = "type")]
    pub event_type: TravelEventType,
    /// One-line description.
    #[serde(default)]
    pub short_text: String,
    /// Whether the event interrupts the journey (combat and hazards).
    #[serde(default)]
    pub interrupt: bool,
    /// Optional combat seed for the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combat_seed: Option<Value>,
    /// Open patch applied when the event fires.
    #[serde(default)]
    pub state_patch: Value,
    /// The (at most three) resolvable choices.
    #[serde(default)]
    pub choices: Vec<TravelChoice>,
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Base weight of each event family.
const BASE_WEIGHTS: [(TravelEventType, u32); 5] = [
    (TravelEventType::Encounter, 24),
    (TravelEventType::Hazard, 21),
    (TravelEventType::Discovery, 21),
    (TravelEventType::Ambush, 20),
    (TravelEventType::Camp, 14),
];

/// Weight multiplier applied to recently fired event types.
const RECENCY_PENALTY: f64 = 0.35;

/// Compute the modulated weight table.
///
/// `bias` entries are percentage modifiers keyed by wire name, clamped
/// to `[-80, +180]`; unknown keys are ignored. The last two entries of
/// `recent` get the recency penalty.
pub fn event_weights(
    world_tension: i32,
    world_instability: i32,
    night: bool,
    bias: &BTreeMap<String, i32>,
    recent: &[TravelEventType],
) -> BTreeMap<TravelEventType, u32> {
    let mut weights: BTreeMap<TravelEventType, u32> = BASE_WEIGHTS.iter().copied().collect();

    if world_tension >= 70 {
        bump(&mut weights, TravelEventType::Ambush, 8);
        bump(&mut weights, TravelEventType::Encounter, 4);
    }
    if world_instability >= 70 {
        bump(&mut weights, TravelEventType::Hazard, 8);
        bump(&mut weights, TravelEventType::Ambush, 5);
        lower(&mut weights, TravelEventType::Discovery, 4);
    }
    if night {
        bump(&mut weights, TravelEventType::Ambush, 6);
        bump(&mut weights, TravelEventType::Camp, 2);
    }

    for (key, raw_delta) in bias {
        let event_type = TravelEventType::parse(key);
        if event_type.as_str() != key.trim().to_lowercase() {
            continue;
        }
        let delta_pct = (*raw_delta).clamp(-80, 180);
        if let Some(weight) = weights.get_mut(&event_type) {
            let base = f64::from((*weight).max(1));
            let scaled = (base * (1.0 + f64::from(delta_pct) / 100.0)).round();
            *weight = scale_to_weight(scaled);
        }
    }

    let penalty_start = recent.len().saturating_sub(2);
    for event_type in recent.iter().skip(penalty_start) {
        if let Some(weight) = weights.get_mut(event_type) {
            let scaled = (f64::from(*weight) * RECENCY_PENALTY).round();
            *weight = scale_to_weight(scaled);
        }
    }

    for weight in weights.values_mut() {
        *weight = (*weight).max(1);
    }
    weights
}

fn bump(weights: &mut BTreeMap<TravelEventType, u32>, event_type: TravelEventType, by: u32) {
    if let Some(weight) = weights.get_mut(&event_type) {
        *weight = weight.saturating_add(by);
    }
}

fn lower(weights: &mut BTreeMap<TravelEventType, u32>, event_type: TravelEventType, by: u32) {
    if let Some(weight) = weights.get_mut(&event_type) {
        *weight = weight.saturating_sub(by).max(1);
    }
}

fn scale_to_weight(scaled: f64) -> u32 {
    if scaled <= 1.0 {
        1
    } else if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            scaled as u32
        }
    }
}

/// Weighted roll over the modulated table, in declaration order.
pub fn pick_event_type(
    rng: &mut SmallRng,
    world_tension: i32,
    world_instability: i32,
    night: bool,
    bias: &BTreeMap<String, i32>,
    recent: &[TravelEventType],
) -> TravelEventType {
    let weights = event_weights(world_tension, world_instability, night, bias, recent);
    let total: u32 = weights.values().copied().fold(0, u32::saturating_add);
    if total == 0 {
        return TravelEventType::Encounter;
    }
    let roll = rng.random_range(0.0..=f64::from(total));
    let mut cursor = 0.0;
    for event_type in TravelEventType::ROLL_ORDER {
        cursor += f64::from(weights.get(&event_type).copied().unwrap_or(1));
        if roll <= cursor {
            return event_type;
        }
    }
    TravelEventType::Camp
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Build the template event for a family.
pub fn build_event(rng: &mut SmallRng, event_type: TravelEventType) -> TravelEvent {
    match event_type {
        TravelEventType::Encounter => event_encounter(rng),
        TravelEventType::Ambush => event_ambush(rng),
        TravelEventType::Hazard => event_hazard(rng),
        TravelEventType::Discovery => event_discovery(rng),
        TravelEventType::Camp => event_camp(rng),
    }
}

fn event_suffix(rng: &mut SmallRng) -> u32 {
    rng.random_range(1000..=9999)
}

fn choice(
    id: &str,
    text: &str,
    risk_tag: &str,
    effects_hint: &str,
    state_patch: Value,
    travel_patch: TravelPatch,
) -> TravelChoice {
    TravelChoice {
        id: id.to_owned(),
        text: text.to_owned(),
        risk_tag: risk_tag.to_owned(),
        effects_hint: effects_hint.to_owned(),
        state_patch,
        travel_patch,
    }
}

fn event_encounter(rng: &mut SmallRng) -> TravelEvent {
    TravelEvent {
        id: format!("enc_{}", event_suffix(rng)),
        event_type: TravelEventType::Encounter,
        short_text: String::from("Une caravane armee bloque une partie du passage."),
        interrupt: false,
        combat_seed: None,
        state_patch: json!({"flags": {"travel_event_encounter": true}}),
        choices: vec![
            choice(
                "negotiate",
                "Negocier le passage",
                "moyen",
                "Moins de danger, possible gain de reputation.",
                json!({"reputation": {"Marchands": 1}, "flags": {"travel_deal": true}}),
                TravelPatch {
                    danger_delta: -5,
                    fatigue_delta: -1,
                    progress_delta: 2,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "rush",
                "Forcer le passage",
                "eleve",
                "Progression rapide mais usante.",
                json!({"player": {"hp_delta": -1}, "flags": {"travel_rush": true}}),
                TravelPatch {
                    danger_delta: 7,
                    fatigue_delta: 5,
                    progress_delta: 5,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "trade",
                "Payer pour passer",
                "faible",
                "Moins de tension, coute de l'or.",
                json!({"player": {"gold_delta": -8}, "flags": {"travel_bribe": true}}),
                TravelPatch {
                    danger_delta: -8,
                    progress_delta: 1,
                    ..TravelPatch::default()
                },
            ),
        ],
    }
}

fn event_ambush(rng: &mut SmallRng) -> TravelEvent {
    let threat: u32 = rng.random_range(1..=4);
    TravelEvent {
        id: format!("amb_{}", event_suffix(rng)),
        event_type: TravelEventType::Ambush,
        short_text: String::from("Des silhouettes surgissent des fourres: embuscade."),
        interrupt: true,
        combat_seed: Some(json!({"kind": "road_ambush", "threat": threat})),
        state_patch: json!({"flags": {"travel_event_ambush": true}}),
        choices: vec![
            choice(
                "fight",
                "Tenir la ligne",
                "eleve",
                "Blessures possibles, gagne du terrain.",
                json!({"player": {"hp_delta": -4}, "reputation": {"Habitants": 1}}),
                TravelPatch {
                    progress_delta: 3,
                    fatigue_delta: 6,
                    danger_delta: 2,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "flee",
                "Fuir vers un detour",
                "moyen",
                "Evite le pire, perd du rythme.",
                json!({"flags": {"travel_escape": true}}),
                TravelPatch {
                    progress_delta: -4,
                    fatigue_delta: 5,
                    danger_delta: -3,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "surrender",
                "Lacher des ressources",
                "faible",
                "Tu passes, mais plus pauvre.",
                json!({"player": {"gold_delta": -10}, "resources": {"food": -1, "water": -1}}),
                TravelPatch {
                    danger_delta: -10,
                    progress_delta: 1,
                    ..TravelPatch::default()
                },
            ),
        ],
    }
}

fn event_hazard(rng: &mut SmallRng) -> TravelEvent {
    TravelEvent {
        id: format!("haz_{}", event_suffix(rng)),
        event_type: TravelEventType::Hazard,
        short_text: String::from("Le chemin se fissure: pont casse et bourbiers."),
        interrupt: true,
        combat_seed: None,
        state_patch: json!({"flags": {"travel_event_hazard": true}}),
        choices: vec![
            choice(
                "cross",
                "Traverser vite",
                "eleve",
                "Gain de temps, risque de blessure.",
                json!({"player": {"hp_delta": -2}}),
                TravelPatch {
                    progress_delta: 4,
                    fatigue_delta: 4,
                    danger_delta: 4,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "detour",
                "Contourner la zone",
                "moyen",
                "Plus lent, plus sur.",
                json!({"flags": {"travel_safe_detour": true}}),
                TravelPatch {
                    progress_delta: -2,
                    fatigue_delta: 2,
                    danger_delta: -8,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "camp",
                "Camper et attendre",
                "faible",
                "Recupere, mais consomme des vivres.",
                json!({"resources": {"food": -1, "water": -1}}),
                TravelPatch {
                    status: Some(String::from("camping")),
                    fatigue_delta: -10,
                    danger_delta: -2,
                    ..TravelPatch::default()
                },
            ),
        ],
    }
}

fn event_discovery(rng: &mut SmallRng) -> TravelEvent {
    TravelEvent {
        id: format!("dis_{}", event_suffix(rng)),
        event_type: TravelEventType::Discovery,
        short_text: String::from("Des ruines discretes apparaissent au bord de la route."),
        interrupt: false,
        combat_seed: None,
        state_patch: json!({"flags": {"travel_event_discovery": true}}),
        choices: vec![
            choice(
                "search",
                "Fouiller rapidement",
                "moyen",
                "Chance de gain, fatigue en hausse.",
                json!({"player": {"gold_delta": 6}, "flags": {"travel_loot_found": true}}),
                TravelPatch {
                    progress_delta: -1,
                    fatigue_delta: 3,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "mark",
                "Noter et repartir",
                "faible",
                "Progression stable.",
                json!({"flags": {"travel_discovery_marked": true}}),
                TravelPatch {
                    progress_delta: 2,
                    danger_delta: -2,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "shortcut",
                "Prendre le raccourci",
                "eleve",
                "Grand gain ou mauvaise surprise.",
                json!({"player": {"hp_delta": -1}, "flags": {"travel_shortcut": true}}),
                TravelPatch {
                    progress_delta: 7,
                    fatigue_delta: 4,
                    danger_delta: 6,
                    ..TravelPatch::default()
                },
            ),
        ],
    }
}

fn event_camp(rng: &mut SmallRng) -> TravelEvent {
    TravelEvent {
        id: format!("cmp_{}", event_suffix(rng)),
        event_type: TravelEventType::Camp,
        short_text: String::from("Le camp est monte, mais la nuit reste nerveuse."),
        interrupt: false,
        combat_seed: None,
        state_patch: json!({"flags": {"travel_event_camp": true}}),
        choices: vec![
            choice(
                "rest",
                "Dormir profondement",
                "moyen",
                "Recupere beaucoup, possible incident.",
                json!({"player": {"hp_delta": 2}}),
                TravelPatch {
                    status: Some(String::from("camping")),
                    fatigue_delta: -14,
                    danger_delta: 2,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "watch",
                "Veiller a tour de role",
                "faible",
                "Moins de repos, plus de securite.",
                json!({"flags": {"travel_guarded_camp": true}}),
                TravelPatch {
                    status: Some(String::from("camping")),
                    fatigue_delta: -8,
                    danger_delta: -6,
                    ..TravelPatch::default()
                },
            ),
            choice(
                "resume",
                "Lever le camp",
                "moyen",
                "Repart vite, fatigue moderee.",
                json!({}),
                TravelPatch {
                    status: Some(String::from("traveling")),
                    progress_delta: 2,
                    fatigue_delta: 2,
                    ..TravelPatch::default()
                },
            ),
        ],
    }
}

// ===========================================================================
// Tests
// ===========================================================================
