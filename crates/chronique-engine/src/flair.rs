//! Vendor flair: the anchored trade line plus an optional rendered
//! embellishment.
//!
//! The engine always produces a deterministic anchor line from the
//! session state (the "core" sentence: recap, total, confirmation
//! question, completion receipt). A [`VendorFlair`] renderer may append
//! a short ambience sentence; the contract forbids it from inventing
//! prices, quantities, items, or transaction state, and the engine
//! enforces the cheap half of that: the flair is cleaned, truncated to
//! 120 characters, and glued after the unchanged anchor. The
//! `last_llm_turn_id` watermark guarantees at most one flair render per
//! session turn.

use serde::{Deserialize, Serialize};

use crate::trade::{TradeSession, TradeStatus};

// ---------------------------------------------------------------------------
// Renderer contract
// ---------------------------------------------------------------------------

/// Request handed to a flair renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlairRequest {
    /// Counterpart NPC display name.
    pub npc_name: String,
    /// One-line profile summary (`role=...; tension=...`).
    pub profile_summary: String,
    /// Session status wire name.
    pub status: String,
    /// Trade direction wire name.
    pub mode: String,
    /// Session turn counter.
    pub turn_id: u64,
    /// Cart recap (`item xN (price/u)`), or `panier vide`.
    pub cart_recap: String,
    /// Pending quantity question text, empty when none.
    pub pending_text: String,
    /// Serialized negotiation terms.
    pub proposed_terms: String,
    /// The anchor sentence the flair must not contradict.
    pub anchor_line: String,
}

/// Response from a flair renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlairResponse {
    /// The ambience sentence (may be empty to decline).
    pub text: String,
}

/// Injected ambience renderer (typically LLM-backed).
pub trait VendorFlair: Send + Sync {
    /// Render one ambience sentence for the request.
    fn flair(&self, request: &FlairRequest) -> anyhow::Result<FlairResponse>;
}

// ---------------------------------------------------------------------------
// Anchor line
// ---------------------------------------------------------------------------

/// Pull the transactional core out of the transcript for done/aborted
/// sessions.
fn core_completion_from_transcript(session: &TradeSession) -> String {
    for raw in session.transcript_short.iter().rev() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        if lowered.starts_with("vente executee:")
            || lowered.starts_with("achat execute:")
            || lowered.starts_with("transaction executee.")
        {
            let core = line
                .split(" On continue le commerce ?")
                .next()
                .unwrap_or(line)
                .trim();
            if !core.is_empty() {
                return core.to_owned();
            }
        }
        if lowered.starts_with("transaction annulee") {
            let core = line
                .split(['.', '!', '?'])
                .next()
                .unwrap_or(line)
                .trim();
            if !core.is_empty() {
                return format!("{core}.");
            }
        }
    }
    String::new()
}

/// Deterministic vendor line for the current session state.
pub fn local_vendor_line(session: &TradeSession) -> String {
    let recap = session
        .cart
        .iter()
        .take(4)
        .map(|row| format!("{} x{}", row.item_name, row.qty))
        .collect::<Vec<String>>()
        .join(", ");
    match session.status {
        TradeStatus::Selecting => {
            if let Some(question) = session.pending_question.as_ref() {
                if question.text.is_empty() {
                    String::from("Je dois connaitre la quantite exacte.")
                } else {
                    question.text.clone()
                }
            } else if recap.is_empty() {
                String::from("Montre-moi ce que tu veux echanger.")
            } else {
                format!("Je prepare le lot: {recap}. Confirme quand tu es pret.")
            }
        }
        TradeStatus::Confirming => {
            let total = session.total_price();
            format!("Recapitulatif: {recap}. Total {total} or. Tu confirmes ?")
        }
        TradeStatus::Done => {
            let core = core_completion_from_transcript(session);
            if core.is_empty() {
                String::from("Transaction bouclee. On continue ?")
            } else {
                format!("{core} On continue le commerce ?")
            }
        }
        TradeStatus::Aborted => {
            let core = core_completion_from_transcript(session);
            if core.is_empty() {
                String::from("Entendu, on annule pour cette fois.")
            } else {
                core
            }
        }
        TradeStatus::Idle => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render the vendor line for the current turn, at most once per turn.
///
/// Returns the line to display, or `None` when the session is idle or
/// this turn was already rendered (the `last_llm_turn_id` watermark).
/// Without a renderer (or with flair disabled) the anchor line is used
/// as-is. The rendered line is appended to the transcript ring unless
/// it duplicates the previous entry.
pub fn render_vendor_line(
    session: &mut TradeSession,
    renderer: Option<&dyn VendorFlair>,
    npc_name: &str,
    profile_summary: &str,
) -> Option<String> {
    let anchor = local_vendor_line(session);
    if session.status == TradeStatus::Idle {
        return None;
    }
    if session.turn_id == 0 {
        return Some(anchor);
    }
    if session.last_llm_turn_id >= session.turn_id {
        return None;
    }

    let flair_text = if session.llm_enabled {
        renderer.and_then(|renderer| {
            let request = FlairRequest {
                npc_name: npc_name.to_owned(),
                profile_summary: profile_summary.to_owned(),
                status: session.status.as_str().to_owned(),
                mode: session.mode.as_str().to_owned(),
                turn_id: session.turn_id,
                cart_recap: session
                    .cart
                    .iter()
                    .take(4)
                    .map(|row| format!("{} x{} ({}/u)", row.item_name, row.qty, row.unit_price))
                    .collect::<Vec<String>>()
                    .join(", "),
                pending_text: session
                    .pending_question
                    .as_ref()
                    .map(|q| q.text.clone())
                    .unwrap_or_default(),
                proposed_terms: session.proposed_terms.to_string(),
                anchor_line: anchor.clone(),
            };
            renderer.flair(&request).ok().map(|response| response.text)
        })
    } else {
        None
    };

    let cleaned_flair = flair_text.map(clean_flair).unwrap_or_default();
    let mut text = if cleaned_flair.is_empty() {
        anchor
    } else {
        format!("{anchor} {cleaned_flair}")
    };
    text = text.chars().take(280).collect();

    session.last_llm_turn_id = session.turn_id;
    if session.transcript_short.last().map(String::as_str) == Some(text.as_str()) {
        return None;
    }
    session.transcript_short.push(text.clone());
    if session.transcript_short.len() > crate::trade::TRANSCRIPT_LIMIT {
        let drop = session
            .transcript_short
            .len()
            .saturating_sub(crate::trade::TRANSCRIPT_LIMIT);
        session.transcript_short.drain(..drop);
    }
    Some(text)
}

/// Clean a rendered flair: collapse whitespace, strip quotes, close the
/// sentence, cap at 120 characters.
fn clean_flair(raw: String) -> String {
    let mut out = String::with_capacity(raw.len().min(120));
    let mut last_was_space = true;
    for ch in raw.trim().trim_matches(['"', '\'']).chars() {
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
    if out.is_empty() {
        return out;
    }
    if !out.ends_with(['.', '!', '?']) {
        out.push('.');
    }
    out.chars().take(120).collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::trade::{TradeEngine, TradeMode};
    use chronique_types::{ItemDef, ItemDefs};

    struct FixedFlair(&'static str);

    impl VendorFlair for FixedFlair {
        fn flair(&self, _request: &FlairRequest) -> anyhow::Result<FlairResponse> {
            Ok(FlairResponse {
                text: self.0.to_owned(),
            })
        }
    }

    struct BrokenFlair;

    impl VendorFlair for BrokenFlair {
        fn flair(&self, _request: &FlairRequest) -> anyhow::Result<FlairResponse> {
            anyhow::bail!("renderer offline")
        }
    }

    fn defs() -> ItemDefs {
        [(
            String::from("potion_soin"),
            ItemDef {
                name: String::from("Potion de soin"),
                value: 12,
                stack_max: 10,
            },
        )]
        .into_iter()
        .collect()
    }

    fn confirming_session() -> TradeSession {
        let mut engine = TradeEngine::new();
        engine.start_trade("Marchande", TradeMode::Sell, true);
        engine.run_action_guard("selecting|je vends|marchande");
        engine.add_to_cart("potion_soin", 2, &defs(), 0);
        engine.confirm_trade();
        engine.export_session()
    }

    // -----------------------------------------------------------------------
    // Anchor line
    // -----------------------------------------------------------------------

    #[test]
    fn anchor_describes_confirming_state() {
        let session = confirming_session();
        let line = local_vendor_line(&session);
        assert!(line.contains("Recapitulatif"));
        assert!(line.contains("Potion de soin x2"));
        assert!(line.contains("24 or"));
    }

    #[test]
    fn anchor_uses_pending_question_text() {
        let mut session = confirming_session();
        session.status = TradeStatus::Selecting;
        session.pending_question = Some(crate::trade::PendingQuestion {
            item_id: String::from("potion_soin"),
            item_name: String::from("Potion de soin"),
            max_qty: 5,
            text: String::from("Combien de potions ?"),
        });
        assert_eq!(local_vendor_line(&session), "Combien de potions ?");
    }

    #[test]
    fn anchor_recovers_completion_core_from_transcript() {
        let mut session = confirming_session();
        session.status = TradeStatus::Done;
        session
            .transcript_short
            .push(String::from("Vente executee: Potion de soin x2 (12/u). Total 24 or."));
        let line = local_vendor_line(&session);
        assert!(line.starts_with("Vente executee:"));
        assert!(line.ends_with("On continue le commerce ?"));
    }

    #[test]
    fn idle_session_has_no_line() {
        let session = TradeSession::default();
        assert_eq!(local_vendor_line(&session), "");
    }

    // -----------------------------------------------------------------------
    // Rendering watermark
    // -----------------------------------------------------------------------

    #[test]
    fn render_appends_flair_once_per_turn() {
        let mut session = confirming_session();
        let renderer = FixedFlair("Ses yeux brillent en comptant les pieces");
        let first = render_vendor_line(&mut session, Some(&renderer), "Marchande", "role=marchande");
        let line = first.unwrap();
        assert!(line.contains("Recapitulatif"));
        assert!(line.ends_with("Ses yeux brillent en comptant les pieces."));
        assert_eq!(session.last_llm_turn_id, session.turn_id);
        // Second render on the same turn is suppressed.
        assert!(render_vendor_line(&mut session, Some(&renderer), "Marchande", "").is_none());
    }

    #[test]
    fn render_without_renderer_uses_anchor() {
        let mut session = confirming_session();
        let line = render_vendor_line(&mut session, None, "Marchande", "").unwrap();
        assert!(line.contains("Recapitulatif"));
        assert_eq!(session.transcript_short.last().unwrap(), &line);
    }

    #[test]
    fn broken_renderer_falls_back_to_anchor() {
        let mut session = confirming_session();
        let line = render_vendor_line(&mut session, Some(&BrokenFlair), "Marchande", "").unwrap();
        assert!(line.contains("Recapitulatif"));
        assert!(!line.contains("offline"));
    }

    #[test]
    fn flair_disabled_session_skips_renderer() {
        let mut session = confirming_session();
        session.llm_enabled = false;
        let renderer = FixedFlair("Jamais rendu");
        let line = render_vendor_line(&mut session, Some(&renderer), "Marchande", "").unwrap();
        assert!(!line.contains("Jamais rendu"));
    }

    #[test]
    fn flair_is_cleaned_and_truncated() {
        let mut session = confirming_session();
        let long = "  \"une   phrase    tres legerement bavarde sans ponctuation finale\"  ";
        let renderer = FixedFlair(Box::leak(long.to_owned().into_boxed_str()));
        let line = render_vendor_line(&mut session, Some(&renderer), "Marchande", "").unwrap();
        assert!(line.contains("une phrase tres legerement bavarde sans ponctuation finale."));
        assert!(line.chars().count() <= 280);
    }

    #[test]
    fn zero_turn_session_returns_anchor_without_watermark() {
        let mut engine = TradeEngine::new();
        engine.start_trade("Marchande", TradeMode::Sell, true);
        let mut session = engine.export_session();
        assert_eq!(session.turn_id, 0);
        let line = render_vendor_line(&mut session, None, "Marchande", "").unwrap();
        assert!(line.contains("Montre-moi"));
        assert_eq!(session.last_llm_turn_id, 0);
    }
}
