//! Travel state machine with probabilistic route events.
//!
//! States: idle, traveling, camping, arrived, aborted. Every tick is
//! deterministic given the engine's seeded generator: speed derives from
//! fatigue and danger penalties plus the chosen action, progress gain is
//! `max(2, speed + U(-1, 2))`, and supplies tick down (torches only at
//! night). A pending route event blocks all progression until the
//! orchestrator resolves it through [`TravelEngine::resolve_travel_choice`].
//!
//! Route events roll only when the cooldown is zero. The trigger chance
//! grows with danger, fatigue, world tension/instability, and nightfall,
//! clamped to `[0.02, 0.72]`; the fired type is drawn from the weighted
//! pool in [`crate::travel_events`] and remembered in a short recency
//! ring so the same family does not dominate consecutive rolls. Camping
//! bypasses the trigger chance and rolls a camp-flavored event directly
//! when off cooldown.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::travel_events::{
    Supplies, TravelEvent, TravelEventType, build_event, pick_event_type,
};

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Travel machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TravelStatus {
    /// No trip in progress.
    #[default]
    Idle,
    /// On the road.
    Traveling,
    /// Resting at a camp.
    Camping,
    /// Destination reached, awaiting [`TravelEngine::arrive`].
    Arrived,
    /// Trip abandoned.
    Aborted,
}

impl TravelStatus {
    /// Parse a wire string, falling back to [`TravelStatus::Idle`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "traveling" => Self::Traveling,
            "camping" => Self::Camping,
            "arrived" => Self::Arrived,
            "aborted" => Self::Aborted,
            _ => Self::Idle,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Traveling => "traveling",
            Self::Camping => "camping",
            Self::Arrived => "arrived",
            Self::Aborted => "aborted",
        }
    }
}

/// Player actions modulating a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TravelAction {
    /// Keep the pace.
    #[default]
    Continue,
    /// Push hard: faster, more fatigue, more danger.
    Accelerate,
    /// Take a safer line: slower, slightly tiring, less danger.
    Detour,
    /// Stop and camp.
    Camp,
}

impl TravelAction {
    /// Parse a wire string; anything unknown maps to
    /// [`TravelAction::Continue`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "accelerate" => Self::Accelerate,
            "detour" => Self::Detour,
            "camp" => Self::Camp,
            _ => Self::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One line of the travel log ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TravelLogEntry {
    /// World time (minutes) when logged.
    #[serde(default)]
    pub at: u64,
    /// Entry kind (`start`, `tick`, `event`, `camp`, ...).
    #[serde(default)]
    pub kind: String,
    /// Entry text.
    #[serde(default)]
    pub text: String,
    /// Progress at the time of the entry.
    #[serde(default)]
    pub progress: i32,
}

/// Maximum entries in the travel log ring.
pub const TRAVEL_LOG_LIMIT: usize = 80;

/// Maximum entries in the recent-event-type ring.
pub const RECENT_EVENT_LIMIT: usize = 4;

/// Full travel machine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelState {
    /// Machine status.
    #[serde(default)]
    pub status: TravelStatus,
    /// Starting location id.
    #[serde(default)]
    pub from_location_id: String,
    /// Destination location id.
    #[serde(default)]
    pub to_location_id: String,
    /// Ordered location ids along the way.
    #[serde(default)]
    pub route: Vec<String>,
    /// Route length in progress units (at least 20 for an active trip).
    #[serde(default)]
    pub total_distance: i32,
    /// Progress in `[0, total_distance]`.
    #[serde(default)]
    pub progress: i32,
    /// World time (minutes) of the last tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick_at: Option<u64>,
    /// Danger in `[0, 100]`.
    #[serde(default = "default_danger")]
    pub danger_level: i32,
    /// Fatigue in `[0, 100]`.
    #[serde(default)]
    pub fatigue: i32,
    /// Cumulative supply consumption for this trip.
    #[serde(default)]
    pub supplies_used: Supplies,
    /// Event awaiting resolution; blocks all progression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_event: Option<TravelEvent>,
    /// Ticks until the next event roll, in `[0, 6]`.
    #[serde(default)]
    pub event_cooldown_ticks: i32,
    /// Recently fired event families (ring of 4, no duplicates).
    #[serde(default)]
    pub recent_event_types: Vec<TravelEventType>,
    /// Log ring (at most 80 entries, newest last).
    #[serde(default)]
    pub log: Vec<TravelLogEntry>,
}

const fn default_danger() -> i32 {
    20
}

impl Default for TravelState {
    fn default() -> Self {
        Self {
            status: TravelStatus::Idle,
            from_location_id: String::new(),
            to_location_id: String::new(),
            route: Vec::new(),
            total_distance: 0,
            progress: 0,
            last_tick_at: None,
            danger_level: default_danger(),
            fatigue: 0,
            supplies_used: Supplies::default(),
            pending_event: None,
            event_cooldown_ticks: 0,
            recent_event_types: Vec::new(),
            log: Vec::new(),
        }
    }
}

fn clean_id(value: &str) -> String {
    let mut out = String::with_capacity(value.len().min(120));
    let mut last_was_space = true;
    for ch in value.trim().chars() {
        if ch.is_whitespace() {
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
    out.chars().take(120).collect()
}

fn clean_short(value: &str, max_len: usize) -> String {
    clean_id(value).chars().take(max_len).collect()
}

fn sanitize_pending_event(event: TravelEvent) -> Option<TravelEvent> {
    let TravelEvent {
        id,
        event_type,
        short_text,
        interrupt,
        combat_seed,
        state_patch,
        choices: raw_choices,
    } = event;
    let id = clean_short(&id, 40);
    let short_text = clean_short(&short_text, 220);
    if id.is_empty() || short_text.is_empty() {
        return None;
    }
    let mut seen: Vec<String> = Vec::new();
    let mut choices = Vec::new();
    for (idx, mut row) in raw_choices.into_iter().take(3).enumerate() {
        let mut choice_id = clean_short(&row.id, 32).to_lowercase();
        if choice_id.is_empty() {
            choice_id = format!("opt_{}", idx.saturating_add(1));
        }
        if seen.contains(&choice_id) {
            continue;
        }
        seen.push(choice_id.clone());
        row.id = choice_id;
        if row.text.trim().is_empty() {
            row.text = format!("Option {}", idx.saturating_add(1));
        } else {
            row.text = clean_short(&row.text, 120);
        }
        row.risk_tag = {
            let tag = clean_short(&row.risk_tag, 24);
            if tag.is_empty() { String::from("moyen") } else { tag }
        };
        row.effects_hint = clean_short(&row.effects_hint, 160);
        choices.push(row);
    }
    Some(TravelEvent {
        id,
        event_type,
        short_text,
        interrupt,
        combat_seed,
        state_patch,
        choices,
    })
}

fn sanitize_recent(recent: &[TravelEventType]) -> Vec<TravelEventType> {
    let start = recent.len().saturating_sub(RECENT_EVENT_LIMIT);
    let mut out: Vec<TravelEventType> = Vec::new();
    for event_type in recent.iter().skip(start) {
        if !out.contains(event_type) {
            out.push(*event_type);
        }
    }
    out
}

impl TravelState {
    /// Re-establish the documented bounds and status-dependent
    /// invariants in place.
    pub fn sanitize(&mut self) {
        self.from_location_id = clean_id(&self.from_location_id);
        self.to_location_id = clean_id(&self.to_location_id);
        self.route = self
            .route
            .iter()
            .map(|id| clean_id(id))
            .filter(|id| !id.is_empty())
            .collect();
        self.total_distance = self.total_distance.max(0);
        self.progress = self.progress.max(0);
        self.danger_level = self.danger_level.clamp(0, 100);
        self.fatigue = self.fatigue.clamp(0, 100);
        self.event_cooldown_ticks = self.event_cooldown_ticks.clamp(0, 6);
        self.recent_event_types = sanitize_recent(&self.recent_event_types);
        self.pending_event = self.pending_event.take().and_then(sanitize_pending_event);

        if self.log.len() > TRAVEL_LOG_LIMIT {
            let drop = self.log.len().saturating_sub(TRAVEL_LOG_LIMIT);
            self.log.drain(..drop);
        }
        for entry in &mut self.log {
            entry.kind = {
                let kind = clean_short(&entry.kind, 40);
                if kind.is_empty() { String::from("info") } else { kind }
            };
            entry.text = clean_short(&entry.text, 220);
            entry.progress = entry.progress.max(0);
        }

        if self.status == TravelStatus::Idle {
            self.from_location_id.clear();
            self.to_location_id.clear();
            self.route.clear();
            self.total_distance = 0;
            self.progress = 0;
            self.pending_event = None;
            self.last_tick_at = None;
            self.fatigue = 0;
            self.event_cooldown_ticks = 0;
            self.recent_event_types.clear();
        }

        if self.total_distance <= 0
            && matches!(
                self.status,
                TravelStatus::Traveling | TravelStatus::Camping | TravelStatus::Arrived
            )
        {
            self.total_distance = if self.route.is_empty() {
                30
            } else {
                let segments = i32::try_from(self.route.len()).unwrap_or(1).saturating_sub(1);
                segments.saturating_mul(30).max(20)
            };
        }

        self.progress = self.progress.clamp(0, self.total_distance.max(0));
        if self.status == TravelStatus::Arrived && self.total_distance > 0 {
            self.progress = self.total_distance;
        }
    }
}

// ---------------------------------------------------------------------------
// Tick context and options
// ---------------------------------------------------------------------------

/// World and player inputs to one tick.
#[derive(Debug, Clone, Default)]
pub struct TickContext {
    /// Global tension in `[0, 100]`.
    pub global_tension: i32,
    /// Instability in `[0, 100]`.
    pub instability_level: i32,
    /// Time-of-day label (`night`/`nightfall` enable torch use).
    pub time_of_day: String,
    /// Player world clock, in minutes.
    pub world_time_minutes: u64,
    /// Percentage bias over the event pool, keyed by event wire name.
    pub travel_event_bias: BTreeMap<String, i32>,
}

impl TickContext {
    fn night(&self) -> bool {
        matches!(
            self.time_of_day.trim().to_lowercase().as_str(),
            "night" | "nightfall"
        )
    }
}

/// Options for starting a trip.
#[derive(Debug, Clone, Default)]
pub struct TravelOptions {
    /// Ordered route of location ids.
    pub route: Vec<String>,
    /// Explicit route length; derived from the route when absent.
    pub total_distance: Option<i32>,
    /// Per-segment distance for derivation (default 30, floor 12).
    pub segment_distance: Option<i32>,
    /// Starting danger (default 25).
    pub danger_level: Option<i32>,
    /// Starting fatigue (default 0).
    pub fatigue: Option<i32>,
    /// Carried-over supply counters.
    pub supplies_used: Option<Supplies>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Travel engine: owns one [`TravelState`] and one seeded generator.
pub struct TravelEngine {
    rng: SmallRng,
    state: TravelState,
}

impl TravelEngine {
    /// Engine with an optional fixed seed (tests pass one; live play
    /// seeds from the OS).
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(SmallRng::from_os_rng, SmallRng::seed_from_u64);
        Self {
            rng,
            state: TravelState::default(),
        }
    }

    /// Replace the engine state (normalizing it) and return a snapshot.
    pub fn load_state(&mut self, mut state: TravelState) -> TravelState {
        state.sanitize();
        self.state = state;
        self.state.clone()
    }

    /// Normalized snapshot of the current state.
    pub fn export_state(&mut self) -> TravelState {
        self.state.sanitize();
        self.state.clone()
    }

    /// Begin a trip.
    ///
    /// Endpoints missing from the arguments are derived from the route;
    /// a missing route is synthesized from the endpoints. The distance
    /// defaults to `max(20, segments * segment_distance)`.
    pub fn start_travel(&mut self, from_id: &str, to_id: &str, options: &TravelOptions) -> TravelState {
        let mut route: Vec<String> = options
            .route
            .iter()
            .map(|id| clean_id(id))
            .filter(|id| !id.is_empty())
            .collect();

        let mut from_location_id = clean_id(from_id);
        let mut to_location_id = clean_id(to_id);
        if from_location_id.is_empty() {
            if let Some(first) = route.first() {
                from_location_id = first.clone();
            }
        }
        if to_location_id.is_empty() {
            if let Some(last) = route.last() {
                to_location_id = last.clone();
            }
        }
        if route.is_empty() {
            if !from_location_id.is_empty()
                && !to_location_id.is_empty()
                && from_location_id != to_location_id
            {
                route = vec![from_location_id.clone(), to_location_id.clone()];
            } else if !from_location_id.is_empty() {
                route = vec![from_location_id.clone()];
            }
        }

        let segment_distance = options.segment_distance.unwrap_or(30).max(12);
        let total_distance = options.total_distance.filter(|d| *d > 0).map_or_else(
            || {
                let segments = i32::try_from(route.len()).unwrap_or(1).saturating_sub(1).max(1);
                segments.saturating_mul(segment_distance).max(20)
            },
            |d| d.max(20),
        );

        self.state = TravelState {
            status: TravelStatus::Traveling,
            from_location_id: from_location_id.clone(),
            to_location_id: to_location_id.clone(),
            route,
            total_distance,
            progress: 0,
            last_tick_at: None,
            danger_level: options.danger_level.unwrap_or(25).clamp(0, 100),
            fatigue: options.fatigue.unwrap_or(0).clamp(0, 100),
            supplies_used: options.supplies_used.unwrap_or_default(),
            pending_event: None,
            event_cooldown_ticks: 0,
            recent_event_types: Vec::new(),
            log: Vec::new(),
        };
        self.state.sanitize();
        tracing::debug!(
            from = %from_location_id,
            to = %to_location_id,
            distance = self.state.total_distance,
            "travel started"
        );
        self.append_log("start", &format!("Depart {from_location_id} -> {to_location_id}"));
        self.export_state()
    }

    /// Advance the trip by one tick.
    ///
    /// Returns the post-tick snapshot and the route event that fired, if
    /// any. A pending event short-circuits: the state is returned
    /// unchanged with the same event.
    pub fn tick_travel(
        &mut self,
        ctx: &TickContext,
        action: TravelAction,
    ) -> (TravelState, Option<TravelEvent>) {
        self.state.sanitize();

        if !matches!(
            self.state.status,
            TravelStatus::Traveling | TravelStatus::Camping
        ) {
            return (self.export_state(), None);
        }
        if let Some(pending) = self.state.pending_event.clone() {
            return (self.export_state(), Some(pending));
        }

        let tension = ctx.global_tension.clamp(0, 100);
        let instability = ctx.instability_level.clamp(0, 100);
        let night = ctx.night();
        let now_minutes = ctx.world_time_minutes;

        if action == TravelAction::Camp {
            self.state.status = TravelStatus::Camping;
            let rest: i32 = self.rng.random_range(12..=22);
            let calm: i32 = self.rng.random_range(2..=8);
            self.state.fatigue = (self.state.fatigue - rest).max(0);
            self.state.danger_level = (self.state.danger_level - calm).max(0);
            self.consume_supplies(1, 1, u32::from(night));
            self.state.last_tick_at = Some(now_minutes);
            self.append_log("camp", "Le groupe campe pour recuperer.");
            if self.state.event_cooldown_ticks > 0 {
                self.state.event_cooldown_ticks = (self.state.event_cooldown_ticks - 1).max(0);
            } else {
                let event = self.roll_event(Some(TravelEventType::Camp), tension, instability, night, ctx);
                if let Some(event) = event {
                    self.arm_event(event.clone());
                    return (self.export_state(), Some(event));
                }
            }
            return (self.export_state(), None);
        }

        if self.state.status == TravelStatus::Camping {
            self.state.status = TravelStatus::Traveling;
        }

        let base_speed = 12;
        let mut speed = base_speed - self.state.fatigue / 25 - self.state.danger_level / 35;
        if night {
            speed -= 2;
        }
        let mut fatigue_gain = 4;
        match action {
            TravelAction::Accelerate => {
                speed += 6;
                fatigue_gain += 6;
                let surge: i32 = self.rng.random_range(4..=8);
                self.state.danger_level = (self.state.danger_level + surge).min(100);
            }
            TravelAction::Detour => {
                speed -= 4;
                fatigue_gain += 2;
                let calm: i32 = self.rng.random_range(5..=10);
                self.state.danger_level = (self.state.danger_level - calm).max(0);
            }
            TravelAction::Continue | TravelAction::Camp => {}
        }

        speed = speed.max(3);
        let jitter: i32 = self.rng.random_range(-1..=2);
        let progress_gain = (speed + jitter).max(2);
        self.state.progress = (self.state.progress + progress_gain).min(self.state.total_distance);
        let weariness: i32 = self.rng.random_range(0..=3);
        self.state.fatigue = (self.state.fatigue + fatigue_gain + weariness).min(100);
        let danger_drift = i32::from(action == TravelAction::Accelerate) + i32::from(instability >= 70);
        self.state.danger_level = (self.state.danger_level + danger_drift).clamp(0, 100);
        self.consume_supplies(1, 1, u32::from(night));
        self.state.last_tick_at = Some(now_minutes);

        self.append_log(
            "tick",
            &format!(
                "Progression +{progress_gain} ({}/{})",
                self.state.progress, self.state.total_distance
            ),
        );

        if self.state.progress >= self.state.total_distance {
            self.state.status = TravelStatus::Arrived;
            self.state.pending_event = None;
            self.append_log("arrive", "Destination atteinte.");
            return (self.export_state(), None);
        }

        if self.state.event_cooldown_ticks > 0 {
            self.state.event_cooldown_ticks = (self.state.event_cooldown_ticks - 1).max(0);
        } else {
            let event = self.roll_event(None, tension, instability, night, ctx);
            if let Some(event) = event {
                self.arm_event(event.clone());
                return (self.export_state(), Some(event));
            }
        }

        (self.export_state(), None)
    }

    /// Resolve the pending event by choice id (case-insensitive).
    ///
    /// Applies the choice's closed travel patch (clamped), clears the
    /// pending event, and returns its open `state_patch` for the
    /// orchestrator. An unknown choice or no pending event returns an
    /// empty object.
    pub fn resolve_travel_choice(&mut self, choice_id: &str) -> Value {
        self.state.sanitize();
        let target = choice_id.trim().to_lowercase();
        if target.is_empty() {
            return json!({});
        }
        let Some(event) = self.state.pending_event.clone() else {
            return json!({});
        };
        let Some(chosen) = event
            .choices
            .iter()
            .find(|row| row.id.trim().to_lowercase() == target)
        else {
            return json!({});
        };

        let patch = &chosen.travel_patch;
        self.state.progress =
            (self.state.progress + patch.progress_delta).clamp(0, self.state.total_distance.max(0));
        self.state.fatigue = (self.state.fatigue + patch.fatigue_delta).clamp(0, 100);
        self.state.danger_level = (self.state.danger_level + patch.danger_delta).clamp(0, 100);
        if let Some(supplies) = patch.supplies {
            self.consume_supplies(supplies.food, supplies.water, supplies.torches);
        }
        if let Some(status) = patch.status.as_deref() {
            let parsed = TravelStatus::parse(status);
            if matches!(
                parsed,
                TravelStatus::Traveling | TravelStatus::Camping | TravelStatus::Aborted
            ) {
                self.state.status = parsed;
            }
        }
        if self.state.total_distance > 0 && self.state.progress >= self.state.total_distance {
            self.state.status = TravelStatus::Arrived;
        }

        let label = if chosen.text.is_empty() { &target } else { &chosen.text };
        let line = format!("Choix route: {label}");
        let state_patch = chosen.state_patch.clone();
        self.append_log("choice", &line);
        self.state.pending_event = None;
        state_patch
    }

    /// Abandon the trip; the log keeps a single summary entry.
    pub fn abort_travel(&mut self) -> TravelState {
        self.state.sanitize();
        if !matches!(
            self.state.status,
            TravelStatus::Traveling | TravelStatus::Camping | TravelStatus::Arrived
        ) {
            return self.export_state();
        }
        let previous = self.state.clone();
        self.append_log("abort", "Trajet abandonne.");
        self.state = TravelState::default();
        let destination = if previous.to_location_id.is_empty() {
            String::from("destination inconnue")
        } else {
            previous.to_location_id
        };
        self.state.log = vec![TravelLogEntry {
            at: previous.last_tick_at.unwrap_or(0),
            kind: String::from("aborted"),
            text: format!("Trajet interrompu vers {destination}."),
            progress: previous.progress.max(0),
        }];
        self.export_state()
    }

    /// Turn back immediately; the log keeps a single summary entry.
    pub fn return_back(&mut self) -> TravelState {
        self.state.sanitize();
        if !matches!(
            self.state.status,
            TravelStatus::Traveling | TravelStatus::Camping
        ) {
            return self.export_state();
        }
        let previous = self.state.clone();
        self.append_log("return", "Demi-tour immediat.");
        self.state = TravelState::default();
        let origin = if previous.from_location_id.is_empty() {
            String::from("inconnu")
        } else {
            previous.from_location_id
        };
        self.state.log = vec![TravelLogEntry {
            at: previous.last_tick_at.unwrap_or(0),
            kind: String::from("return"),
            text: format!("Retour au point de depart ({origin})."),
            progress: previous.progress.max(0),
        }];
        self.export_state()
    }

    /// Complete an arrived trip: produce the orchestrator patch (new
    /// location, flags, supply usage, summary) and reset to idle. Any
    /// other status returns an empty object.
    pub fn arrive(&mut self) -> Value {
        self.state.sanitize();
        if self.state.status != TravelStatus::Arrived {
            return json!({});
        }

        let destination = clean_id(&self.state.to_location_id);
        let route = self.state.route.clone();
        let traveled_distance = self.state.total_distance;
        let fatigue = self.state.fatigue;
        let supplies = self.state.supplies_used;
        self.append_log("arrive", &format!("Arrivee sur {destination}"));

        self.state = TravelState::default();
        self.state.log = vec![TravelLogEntry {
            at: 0,
            kind: String::from("summary"),
            text: format!(
                "Trajet termine ({traveled_distance}u, fatigue {fatigue}, vivres {}/{}).",
                supplies.food, supplies.water
            ),
            progress: traveled_distance,
        }];

        let route_label: Vec<String> = route.into_iter().take(8).collect();
        json!({
            "location_id": destination,
            "flags": {
                "travel_arrived": true,
                "travel_last_distance": traveled_distance,
                "travel_last_route": route_label.join(" -> "),
            },
            "world": {"time_passed": 8},
            "resources": {
                "food_used": supplies.food,
                "water_used": supplies.water,
                "torches_used": supplies.torches,
            },
            "travel_summary": {
                "distance": traveled_distance,
                "fatigue": fatigue,
                "destination": destination,
            },
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn append_log(&mut self, kind: &str, text: &str) {
        self.state.log.push(TravelLogEntry {
            at: self.state.last_tick_at.unwrap_or(0),
            kind: {
                let kind = clean_short(kind, 40);
                if kind.is_empty() { String::from("info") } else { kind }
            },
            text: clean_short(text, 220),
            progress: self.state.progress.max(0),
        });
        if self.state.log.len() > TRAVEL_LOG_LIMIT {
            let drop = self.state.log.len().saturating_sub(TRAVEL_LOG_LIMIT);
            self.state.log.drain(..drop);
        }
    }

    fn consume_supplies(&mut self, food: u32, water: u32, torches: u32) {
        let used = &mut self.state.supplies_used;
        used.food = used.food.saturating_add(food);
        used.water = used.water.saturating_add(water);
        used.torches = used.torches.saturating_add(torches);
    }

    fn arm_event(&mut self, event: TravelEvent) {
        let cooldown = 1 + i32::from(self.state.danger_level >= 70);
        let short_text = event.short_text.clone();
        tracing::debug!(
            event_type = event.event_type.as_str(),
            cooldown,
            "route event armed"
        );
        self.state.pending_event = Some(event);
        self.state.event_cooldown_ticks = cooldown;
        self.append_log("event", &short_text);
    }

    /// Roll for a route event. `force_type` bypasses the trigger chance
    /// (camping rolls a camp event directly).
    fn roll_event(
        &mut self,
        force_type: Option<TravelEventType>,
        tension: i32,
        instability: i32,
        night: bool,
        ctx: &TickContext,
    ) -> Option<TravelEvent> {
        let event_type = if let Some(forced) = force_type {
            forced
        } else {
            let mut chance = 0.07
                + f64::from(self.state.danger_level) / 240.0
                + f64::from(self.state.fatigue) / 420.0;
            if tension >= 70 {
                chance += 0.06;
            }
            if instability >= 70 {
                chance += 0.06;
            }
            if night {
                chance += 0.04;
            }
            let chance = chance.clamp(0.02, 0.72);
            if self.rng.random::<f64>() > chance {
                return None;
            }
            pick_event_type(
                &mut self.rng,
                tension,
                instability,
                night,
                &ctx.travel_event_bias,
                &self.state.recent_event_types,
            )
        };
        let event = build_event(&mut self.rng, event_type);
        self.remember_event_type(event.event_type);
        Some(event)
    }

    fn remember_event_type(&mut self, event_type: TravelEventType) {
        let recent = &mut self.state.recent_event_types;
        if recent.last() == Some(&event_type) {
            let normalized = sanitize_recent(recent);
            *recent = normalized;
            return;
        }
        recent.push(event_type);
        let normalized = sanitize_recent(recent);
        *recent = normalized;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::travel_events::{TravelChoice, TravelPatch};

    fn day_ctx() -> TickContext {
        TickContext {
            global_tension: 10,
            instability_level: 10,
            time_of_day: String::from("afternoon"),
            world_time_minutes: 420,
            travel_event_bias: BTreeMap::new(),
        }
    }

    fn stress_ctx() -> TickContext {
        TickContext {
            global_tension: 80,
            instability_level: 80,
            time_of_day: String::from("night"),
            world_time_minutes: 500,
            travel_event_bias: BTreeMap::new(),
        }
    }

    fn hazard_event() -> TravelEvent {
        TravelEvent {
            id: String::from("evt_test"),
            event_type: TravelEventType::Hazard,
            short_text: String::from("Un obstacle bloque la route."),
            choices: vec![TravelChoice {
                id: String::from("detour"),
                text: String::from("Contourner"),
                risk_tag: String::from("moyen"),
                ..TravelChoice::default()
            }],
            ..TravelEvent::default()
        }
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    #[test]
    fn start_travel_initializes_state() {
        let mut engine = TravelEngine::new(Some(7));
        let state = engine.start_travel(
            "city",
            "temple",
            &TravelOptions {
                route: vec![
                    String::from("Lumeria"),
                    String::from("Dun'Khar"),
                    String::from("Temple Ensable"),
                ],
                total_distance: Some(90),
                danger_level: Some(44),
                ..TravelOptions::default()
            },
        );
        assert_eq!(state.status, TravelStatus::Traveling);
        assert_eq!(state.from_location_id, "city");
        assert_eq!(state.to_location_id, "temple");
        assert_eq!(state.total_distance, 90);
        assert_eq!(state.progress, 0);
        assert_eq!(state.danger_level, 44);
        assert_eq!(state.route.len(), 3);
    }

    #[test]
    fn start_travel_derives_distance_and_endpoints() {
        let mut engine = TravelEngine::new(Some(7));
        let state = engine.start_travel(
            "",
            "",
            &TravelOptions {
                route: vec![String::from("A"), String::from("B"), String::from("C")],
                ..TravelOptions::default()
            },
        );
        assert_eq!(state.from_location_id, "A");
        assert_eq!(state.to_location_id, "C");
        assert_eq!(state.total_distance, 60);
    }

    #[test]
    fn start_travel_floors_distance_at_twenty() {
        let mut engine = TravelEngine::new(Some(7));
        let state = engine.start_travel(
            "a",
            "b",
            &TravelOptions {
                segment_distance: Some(12),
                ..TravelOptions::default()
            },
        );
        assert!(state.total_distance >= 20);
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    #[test]
    fn tick_advances_progress_and_consumes_supplies() {
        let mut engine = TravelEngine::new(Some(11));
        let initial = engine.start_travel(
            "city",
            "temple",
            &TravelOptions {
                route: vec![String::from("Lumeria"), String::from("Dun'Khar")],
                total_distance: Some(60),
                danger_level: Some(18),
                ..TravelOptions::default()
            },
        );
        let (updated, _) = engine.tick_travel(&day_ctx(), TravelAction::Continue);
        assert!(updated.progress > initial.progress);
        assert!(updated.supplies_used.food >= 1);
        assert!(updated.supplies_used.water >= 1);
        assert_eq!(updated.supplies_used.torches, 0);
        assert_eq!(updated.last_tick_at, Some(420));
    }

    #[test]
    fn night_tick_consumes_a_torch() {
        let mut engine = TravelEngine::new(Some(11));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(200),
            ..TravelOptions::default()
        });
        let (updated, _) = engine.tick_travel(&stress_ctx(), TravelAction::Continue);
        assert!(updated.supplies_used.torches >= 1);
    }

    #[test]
    fn pending_event_blocks_progression() {
        let mut engine = TravelEngine::new(Some(13));
        let mut state = engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(50),
            ..TravelOptions::default()
        });
        state.pending_event = Some(hazard_event());
        state.progress = 12;
        engine.load_state(state);

        let (updated, event) = engine.tick_travel(&stress_ctx(), TravelAction::Continue);
        assert_eq!(updated.progress, 12);
        assert_eq!(event.map(|e| e.id), Some(String::from("evt_test")));
    }

    #[test]
    fn tick_on_idle_engine_is_inert() {
        let mut engine = TravelEngine::new(Some(13));
        let (state, event) = engine.tick_travel(&day_ctx(), TravelAction::Continue);
        assert_eq!(state.status, TravelStatus::Idle);
        assert!(event.is_none());
    }

    #[test]
    fn ticks_eventually_arrive() {
        let mut engine = TravelEngine::new(Some(17));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(24),
            danger_level: Some(0),
            ..TravelOptions::default()
        });
        let mut arrived = false;
        for _ in 0..12 {
            let (state, event) = engine.tick_travel(&day_ctx(), TravelAction::Continue);
            if event.is_some() {
                // Clear the event deterministically and keep walking.
                let id = state.pending_event.unwrap().choices.first().unwrap().id.clone();
                engine.resolve_travel_choice(&id);
            }
            if engine.export_state().status == TravelStatus::Arrived {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
    }

    #[test]
    fn fixed_seed_produces_identical_tick_sequences() {
        let run = |seed: u64| -> Vec<(i32, i32, Option<TravelEventType>)> {
            let mut engine = TravelEngine::new(Some(seed));
            engine.start_travel("city", "temple", &TravelOptions {
                total_distance: Some(500),
                danger_level: Some(60),
                fatigue: Some(30),
                ..TravelOptions::default()
            });
            let mut out = Vec::new();
            for _ in 0..10 {
                let before = engine.export_state();
                let (after, event) = engine.tick_travel(&stress_ctx(), TravelAction::Continue);
                out.push((
                    after.progress - before.progress,
                    after.danger_level - before.danger_level,
                    event.map(|e| e.event_type),
                ));
                if after.pending_event.is_some() {
                    engine.resolve_travel_choice("flee");
                    engine.resolve_travel_choice("detour");
                    engine.resolve_travel_choice("search");
                    engine.resolve_travel_choice("negotiate");
                    engine.resolve_travel_choice("rest");
                    // One of the ids above matches; the rest are no-ops.
                }
            }
            out
        };
        assert_eq!(run(31), run(31));
        assert_ne!(run(31), run(32));
    }

    // -----------------------------------------------------------------------
    // Camp and cooldown
    // -----------------------------------------------------------------------

    #[test]
    fn camp_reduces_fatigue_and_rolls_camp_event() {
        let mut engine = TravelEngine::new(Some(19));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(80),
            fatigue: Some(50),
            ..TravelOptions::default()
        });
        let (state, event) = engine.tick_travel(&day_ctx(), TravelAction::Camp);
        assert_eq!(state.status, TravelStatus::Camping);
        assert!(state.fatigue < 50);
        let event = event.unwrap();
        assert_eq!(event.event_type, TravelEventType::Camp);
        assert!(state.event_cooldown_ticks >= 1);
    }

    #[test]
    fn cooldown_blocks_consecutive_events() {
        let mut engine = TravelEngine::new(Some(31));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(120),
            ..TravelOptions::default()
        });
        // First camp tick fires a camp event (forced roll, cooldown 0).
        let (first_state, first_event) = engine.tick_travel(&day_ctx(), TravelAction::Camp);
        assert!(first_event.is_some());
        assert!(first_state.event_cooldown_ticks >= 1);
        // Clear the pending event, then camp again: the cooldown eats
        // the roll and no second event fires.
        let choice = first_state.pending_event.unwrap().choices.first().unwrap().id.clone();
        engine.resolve_travel_choice(&choice);
        let mut state = engine.export_state();
        state.status = TravelStatus::Camping;
        engine.load_state(state);
        let (second_state, second_event) = engine.tick_travel(&day_ctx(), TravelAction::Camp);
        assert!(second_event.is_none());
        assert!(second_state.event_cooldown_ticks >= 0);
    }

    #[test]
    fn recent_ring_tracks_fired_types() {
        let mut engine = TravelEngine::new(Some(23));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(80),
            ..TravelOptions::default()
        });
        let (_state, event) = engine.tick_travel(&day_ctx(), TravelAction::Camp);
        assert!(event.is_some());
        assert_eq!(
            engine.export_state().recent_event_types,
            vec![TravelEventType::Camp]
        );
    }

    // -----------------------------------------------------------------------
    // Resolution and terminal transitions
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_choice_applies_patch_and_clears_event() {
        let mut engine = TravelEngine::new(Some(23));
        let mut state = engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(80),
            ..TravelOptions::default()
        });
        state.pending_event = Some(TravelEvent {
            id: String::from("evt_choice"),
            event_type: TravelEventType::Encounter,
            short_text: String::from("Une caravane bloque la route."),
            choices: vec![TravelChoice {
                id: String::from("trade"),
                text: String::from("Payer"),
                risk_tag: String::from("faible"),
                state_patch: json!({"player": {"gold_delta": -8}}),
                travel_patch: TravelPatch {
                    danger_delta: -5,
                    progress_delta: 2,
                    ..TravelPatch::default()
                },
                ..TravelChoice::default()
            }],
            ..TravelEvent::default()
        });
        engine.load_state(state);

        let patch = engine.resolve_travel_choice("TRADE");
        let updated = engine.export_state();
        assert_eq!(
            patch.pointer("/player/gold_delta").and_then(Value::as_i64),
            Some(-8)
        );
        assert!(updated.pending_event.is_none());
        assert!(updated.progress >= 2);
    }

    #[test]
    fn resolve_unknown_choice_is_a_noop() {
        let mut engine = TravelEngine::new(Some(23));
        let mut state = engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(80),
            ..TravelOptions::default()
        });
        state.pending_event = Some(hazard_event());
        engine.load_state(state);
        let patch = engine.resolve_travel_choice("inexistant");
        assert_eq!(patch, json!({}));
        assert!(engine.export_state().pending_event.is_some());
    }

    #[test]
    fn abort_resets_to_idle_with_summary_log() {
        let mut engine = TravelEngine::new(Some(19));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(40),
            ..TravelOptions::default()
        });
        let aborted = engine.abort_travel();
        assert_eq!(aborted.status, TravelStatus::Idle);
        assert_eq!(aborted.log.len(), 1);
        assert!(aborted.log.first().unwrap().text.contains("temple"));
    }

    #[test]
    fn return_back_resets_to_idle() {
        let mut engine = TravelEngine::new(Some(19));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(40),
            ..TravelOptions::default()
        });
        let state = engine.return_back();
        assert_eq!(state.status, TravelStatus::Idle);
        assert!(state.log.first().unwrap().text.contains("city"));
    }

    #[test]
    fn arrive_produces_patch_and_resets() {
        let mut engine = TravelEngine::new(Some(17));
        let mut state = engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(30),
            ..TravelOptions::default()
        });
        state.progress = 30;
        state.status = TravelStatus::Arrived;
        engine.load_state(state);

        let patch = engine.arrive();
        let after = engine.export_state();
        assert_eq!(
            patch.get("location_id").and_then(Value::as_str),
            Some("temple")
        );
        assert_eq!(
            patch.pointer("/world/time_passed").and_then(Value::as_i64),
            Some(8)
        );
        assert_eq!(after.status, TravelStatus::Idle);
        assert_eq!(after.total_distance, 0);
    }

    #[test]
    fn arrive_before_arrival_is_empty() {
        let mut engine = TravelEngine::new(Some(17));
        engine.start_travel("city", "temple", &TravelOptions {
            total_distance: Some(30),
            ..TravelOptions::default()
        });
        assert_eq!(engine.arrive(), json!({}));
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn sanitize_clears_idle_state() {
        let mut state = TravelState {
            status: TravelStatus::Idle,
            progress: 50,
            total_distance: 80,
            fatigue: 60,
            route: vec![String::from("a")],
            ..TravelState::default()
        };
        state.sanitize();
        assert_eq!(state.progress, 0);
        assert_eq!(state.total_distance, 0);
        assert_eq!(state.fatigue, 0);
        assert!(state.route.is_empty());
    }

    #[test]
    fn sanitize_derives_distance_for_active_trips() {
        let mut state = TravelState {
            status: TravelStatus::Traveling,
            route: vec![String::from("a"), String::from("b"), String::from("c")],
            total_distance: 0,
            ..TravelState::default()
        };
        state.sanitize();
        assert_eq!(state.total_distance, 60);
    }

    #[test]
    fn sanitize_drops_malformed_pending_event() {
        let mut state = TravelState {
            status: TravelStatus::Traveling,
            total_distance: 40,
            pending_event: Some(TravelEvent {
                id: String::new(),
                short_text: String::from("sans id"),
                ..TravelEvent::default()
            }),
            ..TravelState::default()
        };
        state.sanitize();
        assert!(state.pending_event.is_none());
    }

    #[test]
    fn sanitize_pins_arrived_progress_to_total() {
        let mut state = TravelState {
            status: TravelStatus::Arrived,
            total_distance: 50,
            progress: 12,
            ..TravelState::default()
        };
        state.sanitize();
        assert_eq!(state.progress, 50);
    }
}
