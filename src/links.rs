//! Patient/invitation -> invitation number lookup, and matching of invitation
//! numbers against the study identifiers found in the image files.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::LinksSchema;
use crate::error::{Error, Result};
use crate::models::LinksEntry;

/// Two-level lookup built once from the links table.
#[derive(Debug, Default)]
pub struct LinksIndex {
    by_patient: HashMap<String, HashMap<String, String>>,
    entries: usize,
    duplicates: usize,
}

impl LinksIndex {
    /// Fold link rows into the lookup. The first invitation number seen for a pair wins.
    pub fn build<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = LinksEntry>,
    {
        let mut links = Self::default();
        for row in rows {
            links.insert(row);
        }
        links
    }

    /// Read a links table shaped `patient_id, ?, invitation_id, invitation_number`.
    pub fn read<R: Read>(reader: R, schema: &LinksSchema) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(schema.skip_header)
            .delimiter(schema.delimiter_byte()?)
            .flexible(true)
            .from_reader(reader);

        let mut links = Self::default();
        for record in reader.records() {
            let record = record?;
            let line = record.position().map_or(0, |p| p.line());
            if record.len() < schema.min_width() {
                warn!(
                    line,
                    expected = schema.min_width(),
                    found = record.len(),
                    "skipping short links row"
                );
                continue;
            }
            let field = |idx: usize| record.get(idx).unwrap_or_default().trim().to_string();
            links.insert(LinksEntry {
                patient_id: field(schema.patient_column),
                invitation_id: field(schema.invitation_column),
                invitation_number: field(schema.invitation_number_column),
            });
        }
        debug!(entries = links.len(), duplicates = links.duplicates, "links table loaded");
        Ok(links)
    }

    pub fn from_path(path: &Path, schema: &LinksSchema) -> Result<Self> {
        Self::read(File::open(path)?, schema)
    }

    pub fn resolve(&self, patient_id: &str, invitation_id: &str) -> Result<&str> {
        self.by_patient
            .get(patient_id)
            .and_then(|invitations| invitations.get(invitation_id))
            .map(String::as_str)
            .ok_or_else(|| Error::LinkNotFound {
                patient_id: patient_id.to_string(),
                invitation_id: invitation_id.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Rows discarded because their pair was already linked.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    fn insert(&mut self, row: LinksEntry) {
        let invitations = self.by_patient.entry(row.patient_id.clone()).or_default();
        match invitations.get(&row.invitation_id) {
            Some(kept) => {
                warn!(
                    patient_id = %row.patient_id,
                    invitation_id = %row.invitation_id,
                    kept = %kept,
                    discarded = %row.invitation_number,
                    "duplicate link, keeping the first invitation number"
                );
                self.duplicates += 1;
            }
            None => {
                invitations.insert(row.invitation_id, row.invitation_number);
                self.entries += 1;
            }
        }
    }
}

/// Split an identifier into letter runs and digit runs; everything else delimits.
///
/// Letters are lowercased and digit runs lose their leading zeros, so `ACC-0042`
/// yields `["acc", "42"]` and `S42` yields `["s", "42"]`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_digit = false;

    for c in text.chars() {
        if !c.is_alphanumeric() {
            flush_token(&mut tokens, &mut current, current_is_digit);
            continue;
        }
        let is_digit = c.is_ascii_digit();
        if !current.is_empty() && is_digit != current_is_digit {
            flush_token(&mut tokens, &mut current, current_is_digit);
        }
        current_is_digit = is_digit;
        current.extend(c.to_lowercase());
    }
    flush_token(&mut tokens, &mut current, current_is_digit);
    tokens
}

fn flush_token(tokens: &mut Vec<String>, current: &mut String, is_digit: bool) {
    if current.is_empty() {
        return;
    }
    let token = std::mem::take(current);
    if is_digit {
        let trimmed = token.trim_start_matches('0');
        tokens.push(if trimmed.is_empty() { "0" } else { trimmed }.to_string());
    } else {
        tokens.push(token);
    }
}

fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Pre-tokenized study identifiers, searched by whole-token runs.
#[derive(Debug, Default)]
pub struct StudyIdMatcher {
    candidates: Vec<(String, Vec<String>)>,
    by_token: HashMap<String, Vec<usize>>,
}

impl StudyIdMatcher {
    pub fn new<'a, I>(study_ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut candidates: Vec<(String, Vec<String>)> = study_ids
            .into_iter()
            .map(|id| (id.to_string(), tokenize(id)))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.dedup_by(|a, b| a.0 == b.0);

        let mut by_token: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, (_, tokens)) in candidates.iter().enumerate() {
            for token in tokens {
                let slots = by_token.entry(token.clone()).or_default();
                if slots.last() != Some(&idx) {
                    slots.push(idx);
                }
            }
        }
        Self { candidates, by_token }
    }

    /// Every study id containing `invitation_number` as a whole-token run, in sorted order.
    pub fn matches(&self, invitation_number: &str) -> Vec<&str> {
        let needle = tokenize(invitation_number);
        let Some(first) = needle.first() else {
            return Vec::new();
        };
        self.by_token
            .get(first)
            .into_iter()
            .flatten()
            .map(|&idx| &self.candidates[idx])
            .filter(|(_, tokens)| contains_run(tokens, &needle))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// The single study id for `invitation_number`. Ambiguous matches resolve to the
    /// lexicographically first id and are logged.
    pub fn find(&self, invitation_number: &str) -> Result<&str> {
        let matches = self.matches(invitation_number);
        match matches.as_slice() {
            [] => Err(Error::StudyIdNotFound {
                invitation_number: invitation_number.to_string(),
            }),
            [only] => Ok(*only),
            [first, ..] => {
                warn!(
                    invitation_number,
                    matches = ?matches,
                    chosen = %first,
                    "invitation number matches several studies"
                );
                Ok(*first)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// One-shot form of [`StudyIdMatcher::find`].
pub fn find_matching_study_id<'a, I>(candidates: I, invitation_number: &str) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    StudyIdMatcher::new(candidates)
        .find(invitation_number)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(p: &str, i: &str, n: &str) -> LinksEntry {
        LinksEntry {
            patient_id: p.into(),
            invitation_id: i.into(),
            invitation_number: n.into(),
        }
    }

    #[test]
    fn resolves_recorded_pairs_only() {
        let links = LinksIndex::build(vec![
            entry("P1", "I1", "S42"),
            entry("P1", "I2", "S43"),
            entry("P2", "I1", "S50"),
        ]);
        assert_eq!(links.resolve("P1", "I1").expect("P1/I1"), "S42");
        assert_eq!(links.resolve("P1", "I2").expect("P1/I2"), "S43");
        assert_eq!(links.resolve("P2", "I1").expect("P2/I1"), "S50");
        assert!(matches!(
            links.resolve("P2", "I2"),
            Err(Error::LinkNotFound { .. })
        ));
        assert!(links.resolve("P3", "I1").is_err());
        assert_eq!(links.len(), 3);
    }

    #[test]
    fn duplicate_pairs_keep_the_first_value() {
        let links = LinksIndex::build(vec![entry("P1", "I1", "S1"), entry("P1", "I1", "S2")]);
        assert_eq!(links.resolve("P1", "I1").expect("pair"), "S1");
        assert_eq!(links.duplicates(), 1);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn reads_delimited_links_table() {
        let table = "pid x invid invnr\n1001 a 5001 ACC0042\n1001 b 5002 ACC0043\nshort row\n";
        let links = LinksIndex::read(table.as_bytes(), &LinksSchema::default()).expect("read");
        assert_eq!(links.len(), 2);
        assert_eq!(links.resolve("1001", "5002").expect("pair"), "ACC0043");

        let schema = LinksSchema {
            delimiter: ';',
            skip_header: false,
            ..LinksSchema::default()
        };
        let links = LinksIndex::read("7;_; 8 ;9\n".as_bytes(), &schema).expect("read");
        assert_eq!(links.resolve("7", "8").expect("trimmed"), "9");
    }

    #[test]
    fn tokenizer_splits_letter_digit_boundaries() {
        assert_eq!(tokenize("S42"), vec!["s", "42"]);
        assert_eq!(tokenize("ACC-0042/b"), vec!["acc", "42", "b"]);
        assert_eq!(tokenize("000"), vec!["0"]);
        assert!(tokenize(" -_ ").is_empty());
    }

    #[test]
    fn whole_token_matching_avoids_prefix_collisions() {
        let found = find_matching_study_id(["S4", "S42"], "4").expect("match");
        assert_eq!(found, "S4");

        let found = find_matching_study_id(["S4299", "S42"], "42").expect("match");
        assert_eq!(found, "S42");

        assert!(matches!(
            find_matching_study_id(["4299"], "42"),
            Err(Error::StudyIdNotFound { .. })
        ));
    }

    #[test]
    fn formatting_differences_still_match() {
        let matcher = StudyIdMatcher::new(["NO-BREAST-000123", "NO-BREAST-000124"]);
        assert_eq!(matcher.find("123").expect("digits"), "NO-BREAST-000123");
        assert_eq!(matcher.find("breast 124").expect("run"), "NO-BREAST-000124");
        assert!(matcher.find("breast-123-x").is_err());
        assert!(matcher.find("").is_err());
    }

    #[test]
    fn ambiguous_matches_pick_the_first_in_sort_order() {
        let matcher = StudyIdMatcher::new(["B-7", "A-7", "C-8"]);
        assert_eq!(matcher.matches("7"), vec!["A-7", "B-7"]);
        assert_eq!(matcher.find("7").expect("ambiguous"), "A-7");
        assert_eq!(matcher.len(), 3);
    }
}
