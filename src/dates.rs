//! Parsing of registry dates and the coarse, de-identified forms written to output.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Day-first layouts come before year-first ones; registry exports are day-first.
const DATE_FORMATS: &[&str] = &[
    "%d.%m.%Y", "%d/%m/%Y", "%d-%m-%Y", "%d %m %Y", "%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%Y%m%d",
    "%d.%b.%Y", "%d-%b-%Y", "%d %b %Y", "%d %B %Y", "%B %d %Y", "%b %d %Y",
];

// chrono's `%Y` happily takes two digits.
const MIN_YEAR: i32 = 1000;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Norwegian month names and abbreviations that differ from the English ones chrono knows.
const MONTH_ALIASES: &[(&str, &str)] = &[
    ("januar", "january"),
    ("februar", "february"),
    ("mars", "march"),
    ("mai", "may"),
    ("juni", "june"),
    ("juli", "july"),
    ("oktober", "october"),
    ("okt", "oct"),
    ("desember", "december"),
    ("des", "dec"),
];

/// How a screening date is coarsened before it is written out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CoarseDateFormat {
    /// `3-2014`
    #[default]
    MonthYear,
    /// `3.2014`
    MonthYearDot,
    /// `2014`
    Year,
}

/// Parse a human-entered date, tolerating several separators, field orders and month names.
///
/// Years must be written with four digits; `15.03.14` is rejected rather than read as year 14.
pub fn parse_date(text: &str) -> Result<NaiveDate> {
    let normalized = normalize_text(text);
    if normalized.is_empty() {
        return Err(Error::DateParse { text: text.to_string() });
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok().filter(four_digit_year))
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
                .map(|dt| dt.date())
                .filter(four_digit_year)
        })
        .ok_or_else(|| Error::DateParse { text: text.to_string() })
}

fn four_digit_year(date: &NaiveDate) -> bool {
    date.year() >= MIN_YEAR
}

pub fn normalize_screening_date(date: NaiveDate, format: CoarseDateFormat) -> String {
    match format {
        CoarseDateFormat::MonthYear => format!("{}-{}", date.month(), date.year()),
        CoarseDateFormat::MonthYearDot => format!("{}.{}", date.month(), date.year()),
        CoarseDateFormat::Year => date.year().to_string(),
    }
}

/// Signed number of days from `from` to `to`; negative when `to` comes first.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

fn normalize_text(text: &str) -> String {
    // Lowercase, translate month words, drop "15. mars" style ordinal dots and commas.
    let lowered = text.trim().to_lowercase().replace(". ", " ").replace(',', " ");
    lowered
        .split_whitespace()
        .map(translate_month_words)
        .collect::<Vec<_>>()
        .join(" ")
}

fn translate_month_words(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut current = String::new();
    for c in word.chars() {
        if c.is_alphabetic() {
            current.push(c);
        } else {
            out.push_str(alias_for(&current));
            current.clear();
            out.push(c);
        }
    }
    out.push_str(alias_for(&current));
    out
}

fn alias_for(word: &str) -> &str {
    MONTH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == word)
        .map(|(_, english)| *english)
        .unwrap_or(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn parses_common_registry_layouts() {
        let expected = date(2014, 3, 15);
        for text in [
            "15.03.2014",
            "15.3.2014",
            "15/03/2014",
            "2014-03-15",
            "20140315",
            " 15-03-2014 ",
            "15.mar.2014",
            "15 March 2014",
            "15. mars 2014",
            "March 15, 2014",
            "2014-03-15 08:30:00",
        ] {
            assert_eq!(parse_date(text).expect(text), expected, "{text}");
        }
        assert_eq!(parse_date("01.okt.2013").expect("okt"), date(2013, 10, 1));
        assert_eq!(parse_date("24 des 2012").expect("des"), date(2012, 12, 24));
    }

    #[test]
    fn rejects_garbage_and_impossible_dates() {
        assert!(matches!(parse_date(""), Err(Error::DateParse { .. })));
        assert!(parse_date("not a date").is_err());
        assert!(parse_date("31.02.2014").is_err());
    }

    #[test]
    fn two_digit_years_are_rejected() {
        for text in ["15.03.14", "15/03/14", "14-03-15", "15 mars 14"] {
            let err = parse_date(text).expect_err(text);
            assert!(matches!(err, Error::DateParse { .. }), "{text}");
            assert!(err.is_row_local());
        }
    }

    #[test]
    fn coarse_formats() {
        let d = parse_date("15.03.2014").expect("date");
        assert_eq!(normalize_screening_date(d, CoarseDateFormat::MonthYear), "3-2014");
        assert_eq!(normalize_screening_date(d, CoarseDateFormat::MonthYearDot), "3.2014");
        assert_eq!(normalize_screening_date(d, CoarseDateFormat::Year), "2014");
    }

    #[test]
    fn day_deltas_are_signed() {
        let a = parse_date("15.03.2014").expect("a");
        let b = parse_date("20.03.2014").expect("b");
        assert_eq!(days_between(a, b), 5);
        assert_eq!(days_between(b, a), -5);
        assert_eq!(days_between(a, a), 0);
    }
}
