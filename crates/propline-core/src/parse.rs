//! Cell text parsing and row identity.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// How many raw values feed the signature when the identity fields are empty.
pub const RAW_SIGNATURE_PREFIX: usize = 4;

/// Stable slug for a category label: lowercase ASCII alphanumerics joined by `_`.
pub fn category_key(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_sep = false;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Tolerant numeric parse. Empty and sign-only input is unknown, never zero.
pub fn parse_number(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter_map(|c| match c {
            '\u{2212}' | '\u{2012}' | '\u{2013}' | '\u{FE63}' | '\u{FF0D}' => Some('-'),
            ',' | '%' => None,
            c if c.is_whitespace() => None,
            c => Some(c),
        })
        .collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    if !cleaned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | 'e' | 'E'))
    {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses a prop line, dropping a leading over/under marker (`O 25.5`, `u7.5`).
pub fn parse_line(text: &str) -> Option<f64> {
    let lower = text.trim().to_ascii_lowercase();
    for marker in ["over", "under", "o", "u"] {
        if let Some(rest) = lower.strip_prefix(marker) {
            let rest = rest.trim_start_matches([' ', ':', '\u{a0}']);
            if rest
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit() || c == '.')
            {
                return parse_number(rest);
            }
        }
    }
    parse_number(&lower)
}

/// American odds. `EVEN`/`EV` is +100.
pub fn parse_odds(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("even") || trimmed.eq_ignore_ascii_case("ev") {
        return Some(100.0);
    }
    parse_number(trimmed)
}

fn identity_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn identity_number(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Identity of one row within a category.
///
/// Built from category, player, team, line and both odds; the raw column
/// values (header-sorted, so column order does not matter) are mixed in only
/// when player, line and odds are all missing.
pub fn row_signature(
    category_key: &str,
    player_name: &str,
    team: Option<&str>,
    line: Option<f64>,
    odds_over: Option<f64>,
    odds_under: Option<f64>,
    raw: &BTreeMap<String, String>,
) -> String {
    let player = identity_text(player_name);
    let mut parts = vec![
        category_key.to_string(),
        player,
        team.map(identity_text).unwrap_or_default(),
        identity_number(line),
        identity_number(odds_over),
        identity_number(odds_under),
    ];
    if parts[1].is_empty() && line.is_none() && odds_over.is_none() && odds_under.is_none() {
        parts.extend(
            raw.values()
                .take(RAW_SIGNATURE_PREFIX)
                .map(|v| identity_text(v)),
        );
    }

    let mut hasher = Sha256::new();
    hasher.update(parts.join("\u{1f}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
