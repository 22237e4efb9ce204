//! Text normalization and content hashing.
//!
//! All memory text passes through [`clean_text`] before storage, tags pass
//! through [`clean_tag`], and deduplication compares [`content_hash`]
//! digests of the whitespace-collapsed lowercased form. The three
//! operations are pure and deterministic: two inputs differing only in
//! whitespace runs or letter case hash to the same key.

use sha1::{Digest, Sha1};

/// Collapse whitespace runs to single spaces, trim, and truncate.
///
/// When the collapsed text exceeds `max_len`, it is cut to `max_len - 3`
/// characters (at least one), right-trimmed, and suffixed with `...` so the
/// truncation stays visible in rendered context lines.
pub fn clean_text(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len().min(max_len));
    let mut last_was_space = true;
    for ch in value.chars() {
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
    let char_count = out.chars().count();
    if char_count <= max_len {
        return out;
    }
    let keep = max_len.saturating_sub(3).max(1);
    let mut truncated: String = out.chars().take(keep).collect();
    while truncated.ends_with(' ') {
        truncated.pop();
    }
    truncated.push_str("...");
    truncated
}

/// Normalize a tag into slug form.
///
/// Lowercases the input, replaces every run of characters outside
/// `[a-z0-9:_-]` with a single underscore, strips leading and trailing
/// underscores, and truncates to `max_len`. Returns an empty string when
/// nothing survives.
pub fn clean_tag(value: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(value.len().min(max_len));
    let mut last_was_sep = false;
    for ch in value.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() || ch == ':' || ch == '_' || ch == '-' {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep && !out.is_empty() {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    trimmed.chars().take(max_len).collect()
}

/// Whitespace-collapsed, trimmed, lowercased form used as the hash input.
pub fn normalize_for_hash(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_space = true;
    for ch in value.chars().flat_map(char::to_lowercase) {
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
    out
}

/// Hex digest of the normalized text, used as the deduplication key.
///
/// Two texts differing only in whitespace or case produce the same digest.
pub fn content_hash(value: &str) -> String {
    let normalized = normalize_for_hash(value);
    let mut hasher = Sha1::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len().saturating_mul(2));
    for byte in digest {
        let hi = byte >> 4;
        let lo = byte & 0x0f;
        out.push(hex_char(hi));
        out.push(hex_char(lo));
    }
    out
}

/// Map a nibble to its lowercase hex character.
const fn hex_char(nibble: u8) -> char {
    match nibble {
        0 => '0',
        1 => '1',
        2 => '2',
        3 => '3',
        4 => '4',
        5 => '5',
        6 => '6',
        7 => '7',
        8 => '8',
        9 => '9',
        10 => 'a',
        11 => 'b',
        12 => 'c',
        13 => 'd',
        14 => 'e',
        _ => 'f',
    }
}

// ===========================================================================
// Tests
// ===========================================================================
