//! Header classification and row mapping.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use propline_core::{parse_line, parse_number, parse_odds, CategoryOption, Row, RowDraft};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Player,
    Team,
    Opponent,
    Line,
    OddsOver,
    OddsUnder,
    Streak,
    Projection,
    Diff,
    RankMetric,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderClass {
    Field(HeaderField),
    HitRate(String),
    Unmapped,
}

static FIELD_PATTERNS: LazyLock<Vec<(HeaderField, Regex)>> = LazyLock::new(|| {
    [
        (HeaderField::Player, r"^(player|players|player name|name|athlete)$"),
        (HeaderField::Team, r"^(team|tm)$"),
        (HeaderField::Opponent, r"^(opp|opponent|vs\.?|matchup|game)$"),
        (HeaderField::Line, r"^(line|prop|prop line|o/u|ou|total)$"),
        (HeaderField::OddsOver, r"^(over|over odds|odds over|o odds|o)$"),
        (HeaderField::OddsUnder, r"^(under|under odds|odds under|u odds|u)$"),
        (HeaderField::Streak, r"\bstreak\b"),
        (HeaderField::Projection, r"^(proj|projection|projected|model)\b"),
        (HeaderField::Diff, r"^(diff|difference|edge|delta|\+/-)$"),
        (HeaderField::RankMetric, r"\b(rank|rk|dvp)\b"),
        (HeaderField::Status, r"^(status|inj|injury|injury status)$"),
    ]
    .into_iter()
    .map(|(field, pattern)| (field, Regex::new(pattern).expect("header pattern")))
    .collect()
});

static SEASON_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:20)?(\d{2})\s*[-/]\s*(?:20)?(\d{2})$").expect("season pair"));
static SINGLE_SEASON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(20\d{2})$").expect("single season"));
static CURRENT_SEASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(season|szn|ssn|this season|current season)$").expect("current season")
});
static PREVIOUS_SEASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(ls|last season|prev season|previous season|prior season)$").expect("previous season")
});
static HEAD_TO_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(h2h|head to head|head-to-head|vs opp)$").expect("h2h"));
static LAST_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^l(?:ast)?\s*(\d{1,2})(?:\s*games?)?$").expect("last n"));
static HIT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(hit\s*rate|hit|hr)$").expect("hit suffix"));

static TEAM_WITH_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]{2,4})\s*\|\s*[A-Z0-9/-]{1,6}$").expect("team position"));
static BARE_TEAM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{2,4}$").expect("bare team"));

const STATUS_CODES: &[&str] = &[
    "OUT", "O", "D", "Q", "P", "GTD", "DTD", "IR", "INJ", "SUS", "SUSP", "NA", "OFS",
    "DOUBTFUL", "QUESTIONABLE", "PROBABLE", "INACTIVE", "DAY-TO-DAY",
];

/// Lowercased header with sort arrows and surrounding noise removed.
fn clean_header(header: &str) -> String {
    header
        .trim()
        .trim_end_matches(['▲', '▼', '↑', '↓', '⇅', '*'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical hit-rate period for a header, if it names one.
pub fn hit_rate_period(header: &str) -> Option<String> {
    let cleaned = clean_header(header).replace('%', "");
    let cleaned = HIT_SUFFIX.replace(cleaned.trim(), "");
    let cleaned = cleaned.trim();

    if let Some(caps) = SEASON_PAIR.captures(cleaned) {
        return Some(format!("20{}-{}", &caps[1], &caps[2]));
    }
    if let Some(caps) = SINGLE_SEASON.captures(cleaned) {
        return Some(caps[1].to_string());
    }
    if CURRENT_SEASON.is_match(cleaned) {
        return Some("season".to_string());
    }
    if PREVIOUS_SEASON.is_match(cleaned) {
        return Some("prev_season".to_string());
    }
    if HEAD_TO_HEAD.is_match(cleaned) {
        return Some("h2h".to_string());
    }
    LAST_N
        .captures(cleaned)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|n| *n > 0)
        .map(|n| format!("l{n}"))
}

pub fn classify_header(header: &str) -> HeaderClass {
    let cleaned = clean_header(header);
    if cleaned.is_empty() {
        return HeaderClass::Unmapped;
    }
    if let Some((field, _)) = FIELD_PATTERNS.iter().find(|(_, re)| re.is_match(&cleaned)) {
        return HeaderClass::Field(*field);
    }
    match hit_rate_period(header) {
        Some(period) => HeaderClass::HitRate(period),
        None => HeaderClass::Unmapped,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerCell {
    pub name: String,
    pub team: Option<String>,
    pub status: Option<String>,
}

/// Splits a composite player cell: name on the first line, then team code
/// and status abbreviation on later lines in any order.
pub fn parse_player_cell(text: &str) -> PlayerCell {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let mut cell = PlayerCell {
        name: lines.next().unwrap_or_default().to_string(),
        ..PlayerCell::default()
    };

    for line in lines {
        let upper = line.to_uppercase();
        if cell.status.is_none() && STATUS_CODES.contains(&upper.as_str()) {
            cell.status = Some(upper);
            continue;
        }
        if cell.team.is_none() {
            if let Some(caps) = TEAM_WITH_POSITION.captures(line) {
                cell.team = Some(caps[1].to_string());
                continue;
            }
            if BARE_TEAM.is_match(line) {
                cell.team = Some(line.to_string());
            }
        }
    }
    cell
}

/// `60%`, `60` and `3/5` all read as 60.
pub fn parse_hit_rate(text: &str) -> Option<f64> {
    if let Some((hits, games)) = text.split_once('/') {
        let hits = parse_number(hits)?;
        let games = parse_number(games)?;
        return (games > 0.0).then(|| (hits / games * 100.0 * 10.0).round() / 10.0);
    }
    parse_number(text)
}

/// Numbers and marker-prefixed lines (`O 25.5`) are never player names.
fn looks_numeric(text: &str) -> bool {
    text.chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | '\u{2212}'))
        || parse_line(text).is_some()
}

/// Category identity every normalized row carries.
#[derive(Debug, Clone, Copy)]
pub struct RowContext<'a> {
    pub option: &'a CategoryOption,
    pub date: NaiveDate,
}

/// Maps one header/cell grid row onto a [`Row`]. `None` when no player can
/// be identified.
pub fn normalize_row(headers: &[String], cells: &[String], ctx: &RowContext<'_>) -> Option<Row> {
    let mut raw = BTreeMap::new();
    let width = headers.len().max(cells.len());
    let mut columns = Vec::with_capacity(width);
    for index in 0..width {
        let header = headers.get(index).map(|h| h.trim()).unwrap_or_default();
        let mut key = if header.is_empty() {
            format!("col_{index}")
        } else {
            header.to_string()
        };
        if raw.contains_key(&key) {
            key = format!("{key}_{index}");
        }
        let text = cells.get(index).map(|c| c.trim()).unwrap_or_default().to_string();
        raw.insert(key, text.clone());
        columns.push((classify_header(header), text));
    }

    let field = |wanted: HeaderField| {
        columns.iter().find_map(|(class, text)| match class {
            HeaderClass::Field(f) if *f == wanted => Some(text.as_str()),
            _ => None,
        })
    };

    let player = field(HeaderField::Player)
        .filter(|t| !t.is_empty())
        .or_else(|| {
            columns
                .iter()
                .map(|(_, text)| text.as_str())
                .find(|t| !t.is_empty() && !looks_numeric(t))
        })
        .map(parse_player_cell)
        .filter(|cell| !cell.name.is_empty())?;

    let non_empty = |t: &str| (!t.is_empty()).then(|| t.to_string());
    let team = field(HeaderField::Team).and_then(non_empty).or(player.team);
    let status = field(HeaderField::Status).and_then(non_empty).or(player.status);

    let mut hit_rates = BTreeMap::new();
    for (class, text) in &columns {
        if let HeaderClass::HitRate(period) = class {
            hit_rates.entry(period.clone()).or_insert_with(|| parse_hit_rate(text));
        }
    }

    let draft = RowDraft {
        category_key: ctx.option.key.clone(),
        category_label: ctx.option.label.clone(),
        date: ctx.date,
        player_name: player.name,
        team,
        status,
        line: field(HeaderField::Line).and_then(parse_line),
        odds_over: field(HeaderField::OddsOver).and_then(parse_odds),
        odds_under: field(HeaderField::OddsUnder).and_then(parse_odds),
        projection: field(HeaderField::Projection).and_then(parse_number),
        diff: field(HeaderField::Diff).and_then(parse_number),
        rank_metric: field(HeaderField::RankMetric).and_then(parse_number),
        hit_rates,
        raw,
    };
    Some(Row::from_draft(draft))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn ctx(option: &CategoryOption) -> RowContext<'_> {
        RowContext {
            option,
            date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        }
    }

    #[test]
    fn composite_player_cells_split_into_name_team_status() {
        assert_eq!(
            parse_player_cell("Jane Doe\nBOS | PG\nOUT"),
            PlayerCell {
                name: "Jane Doe".into(),
                team: Some("BOS".into()),
                status: Some("OUT".into()),
            }
        );
        assert_eq!(
            parse_player_cell("John Smith\nLAL | SF"),
            PlayerCell {
                name: "John Smith".into(),
                team: Some("LAL".into()),
                status: None,
            }
        );
        let cell = parse_player_cell("  Al Roe \n Q \nNYK\nhot streak");
        assert_eq!(cell.name, "Al Roe");
        assert_eq!(cell.team.as_deref(), Some("NYK"));
        assert_eq!(cell.status.as_deref(), Some("Q"));
    }

    #[test]
    fn headers_classify_by_priority() {
        assert_eq!(classify_header("Player"), HeaderClass::Field(HeaderField::Player));
        assert_eq!(classify_header("Opp Rank"), HeaderClass::Field(HeaderField::RankMetric));
        assert_eq!(classify_header("OPP"), HeaderClass::Field(HeaderField::Opponent));
        assert_eq!(classify_header("Proj ▼"), HeaderClass::Field(HeaderField::Projection));
        assert_eq!(classify_header("Streak"), HeaderClass::Field(HeaderField::Streak));
        assert_eq!(classify_header("L10 %"), HeaderClass::HitRate("l10".into()));
        assert_eq!(classify_header("Last 5"), HeaderClass::HitRate("l5".into()));
        assert_eq!(classify_header("2024-25"), HeaderClass::HitRate("2024-25".into()));
        assert_eq!(classify_header("24/25"), HeaderClass::HitRate("2024-25".into()));
        assert_eq!(classify_header("H2H"), HeaderClass::HitRate("h2h".into()));
        assert_eq!(classify_header("Season Hit Rate"), HeaderClass::HitRate("season".into()));
        assert_eq!(classify_header("Last Season"), HeaderClass::HitRate("prev_season".into()));
        assert_eq!(classify_header("Notes"), HeaderClass::Unmapped);
    }

    #[test]
    fn full_row_maps_known_fields_and_keeps_raw() {
        let option = CategoryOption::new("Points");
        let headers = s(&["Player", "Line", "Over", "Under", "Proj", "Diff", "DvP", "L5", "H2H", "Opp", "Streak"]);
        let cells = s(&["Jane Doe\nBOS | PG", "O 25.5", "\u{2212}110", "EVEN", "27.1", "+1.6", "4", "60%", "3/4", "NYK", "W3"]);
        let row = normalize_row(&headers, &cells, &ctx(&option)).expect("row");

        assert_eq!(row.player_name, "Jane Doe");
        assert_eq!(row.team.as_deref(), Some("BOS"));
        assert_eq!(row.line, Some(25.5));
        assert_eq!(row.odds_over, Some(-110.0));
        assert_eq!(row.odds_under, Some(100.0));
        assert_eq!(row.projection, Some(27.1));
        assert_eq!(row.diff, Some(1.6));
        assert_eq!(row.rank_metric, Some(4.0));
        assert_eq!(row.hit_rates.get("l5"), Some(&Some(60.0)));
        assert_eq!(row.hit_rates.get("h2h"), Some(&Some(75.0)));
        assert_eq!(row.hit_rates.len(), 2);
        assert_eq!(row.raw.get("Opp").map(String::as_str), Some("NYK"));
        assert_eq!(row.raw.get("Streak").map(String::as_str), Some("W3"));
        assert_eq!(row.category_key, "points");
        assert!(!row.signature().is_empty());
    }

    #[test]
    fn explicit_team_and_status_columns_win() {
        let option = CategoryOption::new("Assists");
        let headers = s(&["Player", "Team", "Status", "Line"]);
        let cells = s(&["Jane Doe\nBOS | PG\nQ", "MIA", "OUT", "7.5"]);
        let row = normalize_row(&headers, &cells, &ctx(&option)).unwrap();
        assert_eq!(row.team.as_deref(), Some("MIA"));
        assert_eq!(row.status.as_deref(), Some("OUT"));
    }

    #[test]
    fn falls_back_to_first_non_numeric_cell_without_player_header() {
        let option = CategoryOption::new("Points");
        let headers = s(&["#", "", "Line"]);
        let row = normalize_row(&headers, &s(&["12", "Jane Doe", "25.5"]), &ctx(&option)).unwrap();
        assert_eq!(row.player_name, "Jane Doe");
        assert_eq!(row.raw.get("col_1").map(String::as_str), Some("Jane Doe"));

        assert!(normalize_row(&headers, &s(&["12", "", "-3.5"]), &ctx(&option)).is_none());
    }

    #[test]
    fn marker_prefixed_lines_are_not_taken_for_players() {
        let option = CategoryOption::new("Points");
        let headers = s(&["Player", "Line", ""]);
        let row = normalize_row(&headers, &s(&["", "O 25.5", "Jane Doe"]), &ctx(&option)).unwrap();
        assert_eq!(row.player_name, "Jane Doe");
        assert_eq!(row.line, Some(25.5));

        assert!(normalize_row(&headers, &s(&["", "u7.5", "Over 3"]), &ctx(&option)).is_none());
    }

    #[test]
    fn empty_numeric_cells_stay_unknown() {
        let option = CategoryOption::new("Points");
        let headers = s(&["Player", "Line", "Over", "L10"]);
        let row = normalize_row(&headers, &s(&["Jane", "", "-", ""]), &ctx(&option)).unwrap();
        assert_eq!(row.line, None);
        assert_eq!(row.odds_over, None);
        assert_eq!(row.hit_rates.get("l10"), Some(&None));
    }

    #[test]
    fn equal_identity_fields_give_equal_signatures() {
        let option = CategoryOption::new("Points");
        let a = normalize_row(
            &s(&["Player", "Line", "Proj"]),
            &s(&["Jane Doe\nBOS | PG", "25.5", "27"]),
            &ctx(&option),
        )
        .unwrap();
        let b = normalize_row(
            &s(&["Proj", "Line", "Player"]),
            &s(&["31", "25.5", "Jane Doe\nBOS | C"]),
            &ctx(&option),
        )
        .unwrap();
        assert_eq!(a.signature(), b.signature());
    }
}
