//! Closed vocabularies for the memory data model.
//!
//! Every enum serializes to its lowercase wire name and parses leniently:
//! an unknown or missing value falls back to the first declared variant so
//! that a hand-edited or partially corrupted memory document never aborts
//! a load.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dialogue roles
// ---------------------------------------------------------------------------

/// Speaker role attached to a short dialogue turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The player character.
    Player,
    /// A non-player character.
    #[default]
    Npc,
    /// System-originated lines (engine notifications, trade receipts).
    System,
    /// Scene narration.
    Narration,
}

impl Role {
    /// Parse a wire string, falling back to [`Role::Npc`] on anything
    /// unknown.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "player" => Self::Player,
            "system" => Self::System,
            "narration" => Self::Narration,
            _ => Self::Npc,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Npc => "npc",
            Self::System => "system",
            Self::Narration => "narration",
        }
    }
}

// ---------------------------------------------------------------------------
// Event impact
// ---------------------------------------------------------------------------

/// Impact magnitude recorded on a long-memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    /// Background noise: routine exchanges, minor observations.
    #[default]
    Low,
    /// Noteworthy: quests, combat, trade of consequence.
    Med,
    /// Defining: deaths, defeats, betrayals, boss fights.
    High,
}

impl ImpactLevel {
    /// Parse a wire string, falling back to [`ImpactLevel::Low`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "med" | "medium" => Self::Med,
            "high" => Self::High,
            _ => Self::Low,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Med => "med",
            Self::High => "high",
        }
    }
}

// ---------------------------------------------------------------------------
// Promise / debt status
// ---------------------------------------------------------------------------

/// Lifecycle status of a remembered promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromiseStatus {
    /// Not yet honored or broken.
    #[default]
    Open,
    /// Honored.
    Kept,
    /// Broken.
    Broken,
}

impl PromiseStatus {
    /// Parse a wire string, falling back to [`PromiseStatus::Open`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "kept" => Self::Kept,
            "broken" => Self::Broken,
            _ => Self::Open,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Kept => "kept",
            Self::Broken => "broken",
        }
    }
}

/// Lifecycle status of a remembered debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebtStatus {
    /// Still owed.
    #[default]
    Open,
    /// Settled.
    Paid,
}

impl DebtStatus {
    /// Parse a wire string, falling back to [`DebtStatus::Open`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "paid" => Self::Paid,
            _ => Self::Open,
        }
    }

    /// Lowercase wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Paid => "paid",
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
