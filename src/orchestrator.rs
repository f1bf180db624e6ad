//
// orchestrator.rs
// Dicom-Screening-Anon
//
// Gives each linked patient a pseudonym, anonymizes every screening into
// <output>/<pseudonym>/<coarse date>, and writes the de-identified metadata rows.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs::{self, File};
use std::io::Write;
use std::iter;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::anonymize::Anonymizer;
use crate::error::{Error, Result};
use crate::models::PatientScreenings;

/// Hands out pseudonymous patient identifiers.
pub trait PseudonymSource {
    fn next_pseudonym(&mut self) -> String;
}

/// 128-bit random identifiers rendered as 32 hex digits. Collisions are not checked.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPseudonyms;

impl PseudonymSource for RandomPseudonyms {
    fn next_pseudonym(&mut self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub patients: usize,
    pub screenings_written: usize,
    pub degenerate_screenings: usize,
    pub files_anonymized: usize,
    pub files_quarantined: usize,
    pub files_unreadable: usize,
}

/// Open the de-identified metadata table for writing.
pub fn metadata_writer(path: &Path, delimiter: u8) -> Result<csv::Writer<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::OutputDirectory {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(csv::WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(path)?)
}

pub struct Orchestrator<'a, A, P> {
    scan_root: &'a Path,
    output_root: &'a Path,
    /// Position of the coarse screening date within a screening's variables.
    screening_variable: usize,
    anonymizer: &'a mut A,
    pseudonyms: P,
    show_progress: bool,
}

impl<'a, A, P> Orchestrator<'a, A, P>
where
    A: Anonymizer,
    P: PseudonymSource,
{
    pub fn new(
        scan_root: &'a Path,
        output_root: &'a Path,
        screening_variable: usize,
        anonymizer: &'a mut A,
        pseudonyms: P,
    ) -> Self {
        Self {
            scan_root,
            output_root,
            screening_variable,
            anonymizer,
            pseudonyms,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Anonymize every linked screening and emit one `[pseudonym] + variables` row per screening.
    pub fn run<W: Write>(
        &mut self,
        screenings: &PatientScreenings,
        table: &mut csv::Writer<W>,
    ) -> Result<OrchestratorStats> {
        let mut stats = OrchestratorStats::default();
        let progress = progress_bar(screenings.patient_count() as u64, self.show_progress);

        for (patient_id, patient_screenings) in screenings.iter() {
            // The patient id is never logged next to its pseudonym.
            let pseudonym = self.pseudonyms.next_pseudonym();
            let patient_dir = self.output_root.join(&pseudonym);
            fs::create_dir_all(&patient_dir).map_err(|source| Error::OutputDirectory {
                path: patient_dir.clone(),
                source,
            })?;
            stats.patients += 1;

            for screening in patient_screenings {
                if screening.directory.as_path() == self.scan_root {
                    warn!(
                        patient_id,
                        study_id = %screening.study_id,
                        "study resolved to the scan root itself, skipping screening"
                    );
                    stats.degenerate_screenings += 1;
                    continue;
                }
                let Some(coarse_date) = screening
                    .variables
                    .get(self.screening_variable)
                    .filter(|d| !d.is_empty())
                else {
                    warn!(
                        patient_id,
                        study_id = %screening.study_id,
                        "screening has no coarse date, skipping screening"
                    );
                    stats.degenerate_screenings += 1;
                    continue;
                };

                let destination = patient_dir.join(coarse_date);
                let report = self
                    .anonymizer
                    .anonymize(&screening.directory, &destination)?;
                stats.files_anonymized += report.written;
                stats.files_quarantined += report.quarantined;
                stats.files_unreadable += report.unreadable;

                table.write_record(
                    iter::once(pseudonym.as_str())
                        .chain(screening.variables.iter().map(String::as_str)),
                )?;
                stats.screenings_written += 1;
                debug!(
                    study_id = %screening.study_id,
                    written = report.written,
                    quarantined = report.quarantined,
                    "screening anonymized"
                );
            }
            progress.inc(1);
        }

        table.flush()?;
        progress.finish_and_clear();
        info!(
            patients = stats.patients,
            screenings = stats.screenings_written,
            degenerate = stats.degenerate_screenings,
            files = stats.files_anonymized,
            quarantined = stats.files_quarantined,
            "anonymization finished"
        );
        Ok(stats)
    }
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} patients ({eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
