/// Row cleaning and filtering
///
/// Every row goes through the same steps, in order:
/// 1. Parse the visitor count (`UnparseableVisitorCount`)
/// 2. Find the reporting year (`YearMismatch`)
/// 3. Apply the visitor threshold (`BelowThreshold`)
/// 4. Normalize the city field
/// 5. Require name and country (`MissingRequiredField`)
///
/// Cleaning is pure: no I/O, no shared state.
use crate::config::CleaningRules;
use crate::models::{canonical_place_name, CandidateRecord, CleanOutcome, DropReason, RawRow};
use regex::Regex;
use std::sync::LazyLock;

static BRACKETED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("valid footnote regex"));
static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([^)]*\)").expect("valid parenthetical regex"));
static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[(]([^\])]*)[\])]").expect("valid annotation regex"));
static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b((?:19|20)[0-9]{2})\b").expect("valid year regex"));
static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9][0-9,.]*)(?:\s*(billion|million|thousand|bn|mn|m|k)\b)?")
        .expect("valid count regex")
});
static DOT_GROUPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,3}(?:\.[0-9]{3})+$").expect("valid grouping regex"));

/// Administrative qualifiers that do not change which metro area is meant.
const ADMIN_QUALIFIERS: &[&str] = &["d.c.", "d. c.", "dc", "district of columbia"];

/// Source columns resolved from a row's headers.
#[derive(Debug, Default, PartialEq, Eq)]
struct Columns<'a> {
    name: Option<&'a str>,
    city: Option<&'a str>,
    country: Option<&'a str>,
    visitors: Option<&'a str>,
    year: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordCleaner {
    rules: CleaningRules,
}

impl RecordCleaner {
    pub fn new(rules: CleaningRules) -> Self {
        Self { rules }
    }

    pub fn clean(&self, row: &RawRow) -> CleanOutcome {
        let columns = self.resolve_columns(row);
        let value = |header: Option<&str>| header.and_then(|h| row.get(h)).unwrap_or("");

        let visitors_cell = value(columns.visitors);
        let Some(visitor_count) = parse_visitor_count(visitors_cell) else {
            tracing::debug!("Unparseable visitor count: '{}'", visitors_cell);
            return CleanOutcome::Dropped(DropReason::UnparseableVisitorCount);
        };

        let year = extract_year(visitors_cell)
            .or_else(|| columns.year.and_then(|h| first_year(value(Some(h)))))
            .or_else(|| columns.visitors.and_then(first_year));
        if year != Some(self.rules.target_year) {
            tracing::debug!(
                "Year mismatch for '{}': {:?} (target {})",
                visitors_cell,
                year,
                self.rules.target_year
            );
            return CleanOutcome::Dropped(DropReason::YearMismatch);
        }

        if visitor_count <= self.rules.min_visitors {
            return CleanOutcome::Dropped(DropReason::BelowThreshold);
        }

        let city = normalize_city(value(columns.city));
        let name = normalize_text(value(columns.name));
        let country = normalize_text(value(columns.country));
        if name.is_empty() || country.is_empty() {
            return CleanOutcome::Dropped(DropReason::MissingRequiredField);
        }

        CleanOutcome::Kept(CandidateRecord {
            name,
            city,
            country,
            visitor_count,
            year: self.rules.target_year,
        })
    }

    fn resolve_columns<'a>(&self, row: &'a RawRow) -> Columns<'a> {
        let headers: Vec<(&'a str, String)> = row
            .headers()
            .map(|h| (h, normalize_header(h)))
            .collect();

        let find = |wanted: &str| {
            headers
                .iter()
                .find(|(_, n)| n == wanted)
                .or_else(|| headers.iter().find(|(_, n)| n.contains(wanted)))
                .map(|(h, _)| *h)
        };

        let target_year = self.rules.target_year.to_string();
        let visitors = headers
            .iter()
            .filter(|(_, n)| n.contains("visitor"))
            .find(|(_, n)| n.contains(&target_year))
            .or_else(|| headers.iter().find(|(_, n)| n.contains("visitor")))
            .map(|(h, _)| *h);

        let year = headers
            .iter()
            .filter(|(h, _)| Some(*h) != visitors)
            .find(|(_, n)| n == "year")
            .or_else(|| {
                headers
                    .iter()
                    .filter(|(h, _)| Some(*h) != visitors)
                    .find(|(_, n)| n.contains("year"))
            })
            .map(|(h, _)| *h);

        Columns {
            name: find("name"),
            city: find("city"),
            country: find("country"),
            visitors,
            year,
        }
    }
}

/// Lowercase, footnote-free, `_`-separated column name ("Visitors in 2024[a]" → "visitors_in_2024").
pub fn normalize_header(header: &str) -> String {
    let without_notes = BRACKETED.replace_all(header, "");
    let mut out = String::with_capacity(without_notes.len());
    for c in without_notes.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Parses a visitor count such as "8,700,000", "6.3 million" or "1,250,000[1]".
///
/// Footnotes and parenthetical annotations are ignored. Scaling by a unit is
/// exact (no float rounding), so "6.3 million" is 6,300,000.
pub fn parse_visitor_count(raw: &str) -> Option<u64> {
    let without_notes = BRACKETED.replace_all(raw, " ");
    let stripped = PARENTHESIZED.replace_all(&without_notes, " ");

    let caps = COUNT.captures(&stripped)?;
    let number = caps.get(1)?.as_str().trim_end_matches([',', '.']);
    let multiplier: u128 = match caps.get(2).map(|m| m.as_str().to_lowercase()).as_deref() {
        Some("billion") | Some("bn") => 1_000_000_000,
        Some("million") | Some("mn") | Some("m") => 1_000_000,
        Some("thousand") | Some("k") => 1_000,
        _ => 1,
    };

    let decimal = if multiplier > 1 && !number.contains('.') && is_decimal_comma(number) {
        number.replace(',', ".")
    } else if multiplier == 1 && DOT_GROUPED.is_match(number) {
        number.replace('.', "")
    } else {
        number.replace(',', "")
    };

    scale_decimal(&decimal, multiplier)
}

/// "2,5" style numbers: one comma followed by one or two digits.
fn is_decimal_comma(number: &str) -> bool {
    let mut parts = number.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(int), Some(frac), None) => {
            !int.is_empty() && (1..=2).contains(&frac.len())
        }
        _ => false,
    }
}

fn scale_decimal(decimal: &str, multiplier: u128) -> Option<u64> {
    let mut parts = decimal.split('.');
    let int_part = parts.next().filter(|s| !s.is_empty())?;
    let frac_part = parts.next().unwrap_or("");
    if parts.next().is_some() || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_value: u128 = int_part.parse().ok()?;
    let scaled_int = int_value.checked_mul(multiplier)?;

    let frac_value = if frac_part.is_empty() {
        0
    } else {
        // Nine digits are more precision than any visitor count carries
        let digits = &frac_part[..frac_part.len().min(9)];
        let numerator: u128 = digits.parse().ok()?;
        let denominator = 10u128.pow(digits.len() as u32);
        (numerator * multiplier + denominator / 2) / denominator
    };

    u64::try_from(scaled_int.checked_add(frac_value)?).ok()
}

/// Year inside a parenthetical or bracketed annotation, e.g. "(2024)" or "[in 2024]".
pub fn extract_year(raw: &str) -> Option<i32> {
    ANNOTATION
        .captures_iter(raw)
        .filter_map(|caps| caps.get(1))
        .find_map(|inner| first_year(inner.as_str()))
}

fn first_year(text: &str) -> Option<i32> {
    YEAR.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Trims, collapses whitespace, drops footnotes and administrative
/// qualifiers ("Washington, D.C." → "Washington"). Genuinely compound
/// fields ("Vatican City, Rome") keep all their places.
pub fn normalize_city(raw: &str) -> String {
    let without_notes = BRACKETED.replace_all(raw, "");
    let parts: Vec<String> = without_notes
        .split(',')
        .map(canonical_place_name)
        .filter(|p| !p.is_empty())
        .collect();

    let places: Vec<&String> = parts
        .iter()
        .filter(|p| !ADMIN_QUALIFIERS.contains(&p.to_lowercase().as_str()))
        .collect();

    if places.is_empty() {
        parts.join(", ")
    } else {
        places
            .into_iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn normalize_text(raw: &str) -> String {
    BRACKETED
        .replace_all(raw, "")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> RecordCleaner {
        RecordCleaner::new(CleaningRules {
            target_year: 2024,
            min_visitors: 1_250_000,
        })
    }

    fn row(name: &str, city: &str, country: &str, visitors: &str) -> RawRow {
        RawRow::from_pairs([
            ("Name", name),
            ("City", city),
            ("Country", country),
            ("Visitors", visitors),
        ])
    }

    #[test]
    fn test_parse_visitor_count_formats() {
        assert_eq!(parse_visitor_count("8,700,000"), Some(8_700_000));
        assert_eq!(parse_visitor_count("6.3 million"), Some(6_300_000));
        assert_eq!(parse_visitor_count("1,250,000[1]"), Some(1_250_000));
        assert_eq!(parse_visitor_count("8,700,000(2024)"), Some(8_700_000));
        assert_eq!(parse_visitor_count("2,5 million [in 2024]"), Some(2_500_000));
        assert_eq!(parse_visitor_count("1.3 Million"), Some(1_300_000));
        assert_eq!(parse_visitor_count("850 thousand"), Some(850_000));
        assert_eq!(parse_visitor_count("(2023) 4,000,000"), Some(4_000_000));
        assert_eq!(parse_visitor_count("5.400.000"), Some(5_400_000));
    }

    #[test]
    fn test_non_ascii_digits_do_not_panic() {
        // Arabic-Indic digits are two bytes each
        assert_eq!(parse_visitor_count("1.٣٣٣٣٣ million"), Some(1));
        assert_eq!(parse_visitor_count("٣٬٥٠٠٬٠٠٠"), None);
        assert_eq!(scale_decimal("1.٣٣٣٣٣", 1_000_000), None);
        assert_eq!(extract_year("(٢٠٢٤)"), None);

        let outcome = cleaner().clean(&row("Museum", "Cairo", "Egypt", "1.٣٣٣٣٣ million (2024)"));
        assert_eq!(outcome, CleanOutcome::Dropped(DropReason::BelowThreshold));
    }

    #[test]
    fn test_parse_visitor_count_rejects_garbage() {
        assert_eq!(parse_visitor_count("Invalid Data"), None);
        assert_eq!(parse_visitor_count(""), None);
        assert_eq!(parse_visitor_count("[1]"), None);
        assert_eq!(parse_visitor_count("1.2.3 million"), None);
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year("8,700,000(2024)"), Some(2024));
        assert_eq!(extract_year("2,5 million [in 2024]"), Some(2024));
        assert_eq!(extract_year("1,250,000[1]"), None);
        assert_eq!(extract_year("2,025,000"), None);
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("Visitors in 2024[a]"), "visitors_in_2024");
        assert_eq!(normalize_header("  City  "), "city");
        assert_eq!(normalize_header("Museum Name"), "museum_name");
    }

    #[test]
    fn test_normalize_city() {
        assert_eq!(normalize_city("Washington, D.C."), "Washington");
        assert_eq!(normalize_city("Paris[1]"), "Paris");
        assert_eq!(normalize_city("  Vatican   City ,Rome "), "Vatican City, Rome");
        assert_eq!(normalize_city("NEW YORK"), "New York");
    }

    #[test]
    fn test_clean_keeps_valid_row() {
        let outcome = cleaner().clean(&row("Louvre", "Paris", "France", "8,700,000(2024)"));
        assert_eq!(
            outcome,
            CleanOutcome::Kept(CandidateRecord {
                name: "Louvre".to_string(),
                city: "Paris".to_string(),
                country: "France".to_string(),
                visitor_count: 8_700_000,
                year: 2024,
            })
        );
    }

    #[test]
    fn test_clean_drop_reasons() {
        let c = cleaner();
        assert_eq!(
            c.clean(&row("Small", "Anytown", "A", "Invalid Data")),
            CleanOutcome::Dropped(DropReason::UnparseableVisitorCount)
        );
        assert_eq!(
            c.clean(&row("Met", "New York", "USA", "2,000,000 (2023)")),
            CleanOutcome::Dropped(DropReason::YearMismatch)
        );
        assert_eq!(
            c.clean(&row("No year", "Lyon", "France", "2,000,000")),
            CleanOutcome::Dropped(DropReason::YearMismatch)
        );
        assert_eq!(
            c.clean(&row("British Museum", "London", "UK", "1,000,000 (2024)")),
            CleanOutcome::Dropped(DropReason::BelowThreshold)
        );
        assert_eq!(
            c.clean(&row("", "Paris", "France", "3,000,000 (2024)")),
            CleanOutcome::Dropped(DropReason::MissingRequiredField)
        );
        assert_eq!(
            c.clean(&row("Orphan", "Paris", " ", "3,000,000 (2024)")),
            CleanOutcome::Dropped(DropReason::MissingRequiredField)
        );
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let c = cleaner();
        assert_eq!(
            c.clean(&row("Edge", "Paris", "France", "1,250,000 (2024)")),
            CleanOutcome::Dropped(DropReason::BelowThreshold)
        );
        assert!(matches!(
            c.clean(&row("Edge", "Paris", "France", "1,250,001 (2024)")),
            CleanOutcome::Kept(_)
        ));
    }

    #[test]
    fn test_year_from_header_or_year_column() {
        let c = cleaner();
        let from_header = RawRow::from_pairs([
            ("Museum Name", "Tokyo Skytree"),
            ("City", "Tokyo"),
            ("Country", "Japan"),
            ("Visitors in 2024", "2,825,000"),
        ]);
        assert!(matches!(c.clean(&from_header), CleanOutcome::Kept(r) if r.name == "Tokyo Skytree"));

        let from_column = RawRow::from_pairs([
            ("Name", "Ghibli Museum"),
            ("City", "Mitaka"),
            ("Country", "Japan"),
            ("Visitors per year", "4,097,000"),
            ("Year reported", "2023"),
        ]);
        assert_eq!(
            c.clean(&from_column),
            CleanOutcome::Dropped(DropReason::YearMismatch)
        );
    }

    #[test]
    fn test_cell_year_wins_over_header_year() {
        let wrong_year = RawRow::from_pairs([
            ("Name", "Old Museum"),
            ("City", "Historic City"),
            ("Country", "CountryB"),
            ("Visitors in 2024", "1,500,000 (2025)"),
        ]);
        assert_eq!(
            cleaner().clean(&wrong_year),
            CleanOutcome::Dropped(DropReason::YearMismatch)
        );
    }

    #[test]
    fn test_missing_visitor_column_is_unparseable() {
        let no_visitors = RawRow::from_pairs([("Name", "Louvre"), ("City", "Paris")]);
        assert_eq!(
            cleaner().clean(&no_visitors),
            CleanOutcome::Dropped(DropReason::UnparseableVisitorCount)
        );
    }
}
