//! Trade intent contract and the default keyword classifier.
//!
//! The trade engine consumes a [`SellIntent`] produced by an
//! [`IntentClassifier`]. Classification is a pluggable capability -- an
//! LLM-backed classifier can be injected -- but the default is the
//! deterministic [`KeywordIntentClassifier`]: French word families for
//! buy/sell/confirm/cancel detection, accent folding, a quantity
//! extractor (`x3` or a bare number, clamped to `[1, 999]`), and fuzzy
//! item matching by normalized containment with a
//! Ratcliff/Obershelp-style longest-matching-block ratio floored at
//! 0.38. Utterances are reduced to an item query first (verbs, filler
//! words, and bare counts stripped) so grammar does not leak into the
//! ratio.

use std::collections::BTreeMap;

use chronique_types::ItemDefs;

/// Words opening a buy.
pub const BUY_WORDS: &[&str] = &["acheter", "achete", "achetes", "prends", "prendre", "acquerir"];

/// Words opening a sell.
pub const SELL_WORDS: &[&str] = &["vendre", "vends", "vend", "revendre", "revends"];

/// Words confirming a pending offer.
pub const CONFIRM_WORDS: &[&str] = &[
    "oui", "ok", "daccord", "d accord", "valide", "confirme", "j accepte", "je confirme",
];

/// Words cancelling the session.
pub const CANCEL_WORDS: &[&str] = &["non", "annule", "annuler", "stop", "laisse tomber", "abandon"];

/// Filler words stripped from a buy query before item matching.
const QUERY_STOP_WORDS: &[&str] = &[
    "de", "du", "des", "la", "le", "les", "un", "une", "au", "aux", "a", "pour", "je", "j", "vous",
    "tu", "moi", "en", "svp", "stp",
];

/// Minimum fuzzy-match score admitting an item.
pub const ITEM_MATCH_THRESHOLD: f64 = 0.38;

// ---------------------------------------------------------------------------
// Intent shape
// ---------------------------------------------------------------------------

/// Parsed intent behind a sell (or give) utterance.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SellIntent {
    /// Matched item id; empty when ambiguous.
    pub item_id: String,
    /// Explicit quantity, when the player named one.
    pub qty: Option<u32>,
    /// Quantity the player actually holds.
    pub max_qty: u32,
    /// The player asked to sell everything.
    pub sell_all: bool,
    /// The player asked to sell one at a time.
    pub one_by_one: bool,
    /// The utterance was trade-shaped but the item could not be pinned.
    pub ambiguous: bool,
}

/// Injected classification capability.
///
/// `inventory` maps item ids to the quantity held; `item_defs` is the
/// catalogue. `None` means the utterance carries no sell intent at all.
pub trait IntentClassifier: Send + Sync {
    /// Classify a player utterance.
    fn classify(
        &self,
        utterance: &str,
        inventory: &BTreeMap<String, u32>,
        item_defs: &ItemDefs,
    ) -> Option<SellIntent>;
}

// ---------------------------------------------------------------------------
// Text normalization
// ---------------------------------------------------------------------------

/// Fold French accented characters to their bare letter.
fn fold_accent(ch: char) -> char {
    match ch {
        'à' | 'â' | 'ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'î' | 'ï' => 'i',
        'ô' | 'ö' => 'o',
        'ù' | 'û' | 'ü' => 'u',
        'ç' => 'c',
        _ => ch,
    }
}

/// Normalize an utterance: lowercase, fold accents, drop apostrophes and
/// punctuation, collapse whitespace.
pub fn normalize_utterance(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.trim().chars().flat_map(char::to_lowercase) {
        let folded = fold_accent(ch);
        if folded.is_ascii_alphanumeric() {
            out.push(folded);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Check whether a normalized text contains a word (or phrase) on token
/// boundaries.
pub fn contains_word(normalized: &str, word: &str) -> bool {
    if word.contains(' ') {
        return normalized.contains(word);
    }
    normalized.split_whitespace().any(|token| token == word)
}

/// Check a normalized text against a word family.
pub fn matches_family(normalized: &str, family: &[&str]) -> bool {
    family.iter().any(|word| contains_word(normalized, word))
}

/// Extract a quantity (`x3` marker first, bare number second), clamped
/// to `[1, 999]`.
pub fn extract_qty(normalized: &str) -> Option<u32> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    for window in tokens.windows(2) {
        if let [a, b] = window {
            if *a == "x" {
                if let Ok(value) = b.parse::<u32>() {
                    return Some(value.clamp(1, 999));
                }
            }
        }
    }
    for token in &tokens {
        if let Some(rest) = token.strip_prefix('x') {
            if let Ok(value) = rest.parse::<u32>() {
                return Some(value.clamp(1, 999));
            }
        }
    }
    for token in tokens {
        if token.len() <= 3 {
            if let Ok(value) = token.parse::<u32>() {
                return Some(value.clamp(1, 999));
            }
        }
    }
    None
}

/// Whether an utterance is trade-shaped at all (buy/sell words, the
/// `/trade` command, or a sell-everything phrase).
pub fn is_trade_message(text: &str) -> bool {
    let raw = text.trim();
    if raw.is_empty() {
        return false;
    }
    let lowered = raw.to_lowercase();
    if lowered.starts_with("/trade") || lowered.starts_with("/commerce") {
        return true;
    }
    let plain = normalize_utterance(raw);
    if plain.is_empty() {
        return false;
    }
    matches_family(&plain, SELL_WORDS)
        || matches_family(&plain, BUY_WORDS)
        || plain.contains("tout vendre")
}

// ---------------------------------------------------------------------------
// Fuzzy item matching
// ---------------------------------------------------------------------------

/// Longest matching block between two character slices, as
/// `(start_a, start_b, len)`. Ties keep the earliest block.
fn longest_match(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0_usize, 0_usize, 0_usize);
    let mut prev = vec![0_usize; b.len().saturating_add(1)];
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![0_usize; b.len().saturating_add(1)];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let len = prev.get(j).copied().unwrap_or(0).saturating_add(1);
                if let Some(cell) = current.get_mut(j.saturating_add(1)) {
                    *cell = len;
                }
                if len > best.2 {
                    best = (
                        i.saturating_add(1).saturating_sub(len),
                        j.saturating_add(1).saturating_sub(len),
                        len,
                    );
                }
            }
        }
        prev = current;
    }
    best
}

/// Total characters covered by recursively taking the longest matching
/// block and recursing into the unmatched flanks (Ratcliff/Obershelp).
fn matching_total(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let (start_a, start_b, len) = longest_match(a, b);
    if len == 0 {
        return 0;
    }
    let left = matching_total(
        a.get(..start_a).unwrap_or_default(),
        b.get(..start_b).unwrap_or_default(),
    );
    let right = matching_total(
        a.get(start_a.saturating_add(len)..).unwrap_or_default(),
        b.get(start_b.saturating_add(len)..).unwrap_or_default(),
    );
    len.saturating_add(left).saturating_add(right)
}

/// Longest-matching-block similarity ratio of two normalized strings:
/// `2 * M / (len(a) + len(b))`, where `M` is the recursive matched-block
/// character count. Two empty strings rate 1.0.
fn sequence_ratio(a: &str, b: &str) -> f64 {
    let left: Vec<char> = a.chars().collect();
    let right: Vec<char> = b.chars().collect();
    let total = left.len().saturating_add(right.len());
    if total == 0 {
        return 1.0;
    }
    let matches = matching_total(&left, &right);
    #[allow(clippy::cast_precision_loss)]
    {
        (2.0 * matches as f64) / (total as f64)
    }
}

/// Best item for a free-text query: containment scores 1.0, otherwise
/// the longest-matching-block ratio against name and id; matches below
/// [`ITEM_MATCH_THRESHOLD`] are rejected.
pub fn match_item_query<'a>(query: &str, item_defs: &'a ItemDefs) -> Option<(&'a str, f64)> {
    let q = normalize_utterance(query);
    if q.is_empty() {
        return None;
    }
    let mut best_id: Option<&str> = None;
    let mut best_score = 0.0_f64;
    for (item_id, item) in item_defs {
        let name = normalize_utterance(&item.name);
        let id = normalize_utterance(item_id);
        let score = if (!name.is_empty() && (q.contains(&name) || name.contains(&q)))
            || (!id.is_empty() && (q.contains(&id) || id.contains(&q)))
        {
            1.0
        } else {
            sequence_ratio(&q, &name).max(sequence_ratio(&q, &id))
        };
        if score > best_score {
            best_score = score;
            best_id = Some(item_id.as_str());
        }
    }
    match best_id {
        Some(id) if best_score >= ITEM_MATCH_THRESHOLD => Some((id, best_score)),
        _ => None,
    }
}

/// Strip verbs, filler words, bare counts, and the sell-everything
/// marker from an utterance, leaving the item query.
fn reduce_item_query(normalized: &str, verbs: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for token in normalized.split_whitespace() {
        if verbs.contains(&token) || QUERY_STOP_WORDS.contains(&token) || token == "tout" {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) && token.len() <= 3 {
            continue;
        }
        out.push(token);
    }
    let joined = out.join(" ");
    joined.chars().take(120).collect()
}

/// Reduce a buy utterance to its item query.
pub fn buy_item_query(normalized: &str) -> String {
    reduce_item_query(normalized, BUY_WORDS)
}

// ---------------------------------------------------------------------------
// Default classifier
// ---------------------------------------------------------------------------

/// Deterministic rule-based intent classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordIntentClassifier;

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(
        &self,
        utterance: &str,
        inventory: &BTreeMap<String, u32>,
        item_defs: &ItemDefs,
    ) -> Option<SellIntent> {
        let plain = normalize_utterance(utterance);
        if plain.is_empty() {
            return None;
        }
        let sell_shaped = matches_family(&plain, SELL_WORDS) || plain.contains("tout vendre");
        if !sell_shaped {
            return None;
        }

        let sell_all = plain.contains("tout");
        let one_by_one = plain.contains("une par une");
        let qty = extract_qty(&plain);

        // Reduce to the item query before matching.
        let query = reduce_item_query(&plain, SELL_WORDS);

        let matched = match_item_query(&query, item_defs);
        let Some((item_id, _score)) = matched else {
            return Some(SellIntent {
                ambiguous: true,
                sell_all,
                one_by_one,
                qty,
                ..SellIntent::default()
            });
        };
        let held = inventory.get(item_id).copied().unwrap_or(0);
        if held == 0 {
            return Some(SellIntent {
                ambiguous: true,
                sell_all,
                one_by_one,
                qty,
                ..SellIntent::default()
            });
        }
        Some(SellIntent {
            item_id: item_id.to_owned(),
            qty,
            max_qty: held,
            sell_all,
            one_by_one,
            ambiguous: false,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
