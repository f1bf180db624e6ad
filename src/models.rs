//
// models.rs
// Dicom-Screening-Anon
//
// Data structures shared by the indexer, the linkage engine, and the orchestrator, plus the run summary.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One study on disk, keyed by the identifier embedded in its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyIndexEntry {
    pub study_id: String,
    pub directory: PathBuf,
    /// De-identified registry variables, present once a registry row was linked to this study.
    pub variables: Option<Vec<String>>,
}

impl StudyIndexEntry {
    pub fn new(study_id: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            study_id: study_id.into(),
            directory: directory.into(),
            variables: None,
        }
    }
}

/// One row of the links table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinksEntry {
    pub patient_id: String,
    pub invitation_id: String,
    pub invitation_number: String,
}

/// One row of the registry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    /// 1-based line in the source file, for operator follow-up.
    pub line: u64,
    pub patient_id: String,
    pub invitation_id: String,
    pub variables: Vec<String>,
}

/// A registry row joined with the directory holding its images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screening {
    pub study_id: String,
    pub directory: PathBuf,
    pub variables: Vec<String>,
}

/// Linked screenings per patient, in first-encounter order of the patients and
/// registry order of each patient's screenings.
#[derive(Debug, Default)]
pub struct PatientScreenings {
    patients: Vec<(String, Vec<Screening>)>,
    positions: HashMap<String, usize>,
}

impl PatientScreenings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, patient_id: &str, screening: Screening) {
        match self.positions.get(patient_id) {
            Some(&idx) => self.patients[idx].1.push(screening),
            None => {
                self.positions
                    .insert(patient_id.to_string(), self.patients.len());
                self.patients.push((patient_id.to_string(), vec![screening]));
            }
        }
    }

    pub fn get(&self, patient_id: &str) -> Option<&[Screening]> {
        self.positions
            .get(patient_id)
            .map(|&idx| self.patients[idx].1.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Screening])> {
        self.patients
            .iter()
            .map(|(id, screenings)| (id.as_str(), screenings.as_slice()))
    }

    pub fn patient_count(&self) -> usize {
        self.patients.len()
    }

    pub fn screening_count(&self) -> usize {
        self.patients.iter().map(|(_, s)| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }
}

/// Where the study index of a run came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexSource {
    #[default]
    Scanned,
    Restored,
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub index_source: IndexSource,
    pub image_files_seen: usize,
    pub unreadable_image_files: usize,
    pub indexed_studies: usize,
    pub widened_studies: usize,
    pub duplicate_links: usize,
    pub registry_rows: usize,
    pub linked_rows: usize,
    /// Skipped registry rows keyed by reason.
    pub skipped_rows: BTreeMap<String, usize>,
    pub patients: usize,
    pub screenings_written: usize,
    pub degenerate_screenings: usize,
    pub files_anonymized: usize,
    pub files_quarantined: usize,
    /// Entries under study directories the anonymizer could not read.
    pub unreadable_study_entries: usize,
}

impl RunSummary {
    pub fn record_skip(&mut self, reason: &str) {
        *self.skipped_rows.entry(reason.to_string()).or_default() += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped_rows.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screening(study: &str) -> Screening {
        Screening {
            study_id: study.into(),
            directory: PathBuf::from(format!("root/{study}")),
            variables: vec![],
        }
    }

    #[test]
    fn screenings_keep_patient_and_row_order() {
        let mut all = PatientScreenings::new();
        all.push("P2", screening("S1"));
        all.push("P1", screening("S2"));
        all.push("P2", screening("S3"));

        let order: Vec<_> = all.iter().map(|(id, s)| (id, s.len())).collect();
        assert_eq!(order, vec![("P2", 2), ("P1", 1)]);
        let p2: Vec<_> = all
            .get("P2")
            .expect("P2")
            .iter()
            .map(|s| s.study_id.as_str())
            .collect();
        assert_eq!(p2, vec!["S1", "S3"]);
        assert_eq!(all.screening_count(), 3);
        assert!(all.get("P3").is_none());
    }

    #[test]
    fn summary_counts_skips_per_reason() {
        let mut summary = RunSummary::default();
        summary.record_skip("link_not_found");
        summary.record_skip("link_not_found");
        summary.record_skip("date_parse");
        assert_eq!(summary.skipped_rows["link_not_found"], 2);
        assert_eq!(summary.skipped_total(), 3);

        let json = serde_json::to_value(&summary).expect("json");
        assert_eq!(json["index_source"], "scanned");
    }
}
