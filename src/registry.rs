//
// registry.rs
// Dicom-Screening-Anon
//
// Joins registry rows against the links table and the study index, de-identifying each row's
// variables and collecting the linked screenings per patient.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, info, warn};

use crate::config::RegistrySchema;
use crate::dates::{days_between, normalize_screening_date, parse_date, CoarseDateFormat};
use crate::error::{Error, Result};
use crate::index::StudyIndex;
use crate::links::{LinksIndex, StudyIdMatcher};
use crate::models::{PatientScreenings, RegistryRecord, Screening};

/// Split a raw registry row into ids and variables, checking it against the schema width.
pub fn parse_record(line: u64, fields: &StringRecord, schema: &RegistrySchema) -> Result<RegistryRecord> {
    let expected = schema.min_width();
    if fields.len() < expected {
        return Err(Error::RowWidth {
            line,
            expected,
            found: fields.len(),
        });
    }
    let field = |idx: usize| fields.get(idx).unwrap_or_default().trim().to_string();
    Ok(RegistryRecord {
        line,
        patient_id: field(schema.patient_column),
        invitation_id: field(schema.invitation_column),
        variables: fields
            .iter()
            .skip(schema.first_variable_column)
            .map(|v| v.trim().to_string())
            .collect(),
    })
}

/// Replace the screening date by its coarse form and the diagnosis date by its
/// signed day offset from the screening. An empty diagnosis date stays empty.
pub fn deidentify_variables(
    mut variables: Vec<String>,
    schema: &RegistrySchema,
    format: CoarseDateFormat,
) -> Result<Vec<String>> {
    let screening_idx = schema.screening_variable();
    let diagnosis_idx = schema.diagnosis_variable();
    let (Some(screening_text), Some(diagnosis_text)) =
        (variables.get(screening_idx), variables.get(diagnosis_idx))
    else {
        return Err(Error::RowWidth {
            line: 0,
            expected: schema.min_width(),
            found: variables.len() + schema.first_variable_column,
        });
    };

    let screening = parse_date(screening_text)?;
    let diagnosis_offset = if diagnosis_text.trim().is_empty() {
        String::new()
    } else {
        days_between(screening, parse_date(diagnosis_text)?).to_string()
    };

    variables[screening_idx] = normalize_screening_date(screening, format);
    variables[diagnosis_idx] = diagnosis_offset;
    Ok(variables)
}

/// Row counters of one linkage pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkageStats {
    pub rows: usize,
    pub linked: usize,
    pub skipped: BTreeMap<String, usize>,
}

impl LinkageStats {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

fn skip_reason(error: &Error) -> &'static str {
    match error {
        Error::LinkNotFound { .. } => "link_not_found",
        Error::StudyIdNotFound { .. } => "study_id_not_found",
        Error::DateParse { .. } => "unparseable_date",
        Error::RowWidth { .. } => "short_row",
        _ => "other",
    }
}

/// Joins registry rows to studies. Owns the per-patient accumulator until [`LinkageEngine::finish`].
pub struct LinkageEngine<'a> {
    index: &'a mut StudyIndex,
    links: &'a LinksIndex,
    matcher: StudyIdMatcher,
    schema: &'a RegistrySchema,
    date_format: CoarseDateFormat,
    screenings: PatientScreenings,
    stats: LinkageStats,
}

impl<'a> LinkageEngine<'a> {
    pub fn new(
        index: &'a mut StudyIndex,
        links: &'a LinksIndex,
        schema: &'a RegistrySchema,
        date_format: CoarseDateFormat,
    ) -> Self {
        let matcher = StudyIdMatcher::new(index.study_ids());
        Self {
            index,
            links,
            matcher,
            schema,
            date_format,
            screenings: PatientScreenings::new(),
            stats: LinkageStats::default(),
        }
    }

    /// Link one row. Row-local failures are returned to the caller, who decides to skip.
    pub fn link_record(&mut self, record: RegistryRecord) -> Result<()> {
        let RegistryRecord {
            patient_id,
            invitation_id,
            variables,
            ..
        } = record;

        let variables = deidentify_variables(variables, self.schema, self.date_format)?;
        let invitation_number = self.links.resolve(&patient_id, &invitation_id)?;
        let study_id = self.matcher.find(invitation_number)?.to_string();

        let entry = self
            .index
            .attach_variables(&study_id, variables)
            .ok_or_else(|| Error::StudyIdNotFound {
                invitation_number: invitation_number.to_string(),
            })?;

        debug!(
            patient_id = %patient_id,
            invitation_id = %invitation_id,
            study_id = %study_id,
            directory = %entry.directory.display(),
            "registry row linked"
        );
        let screening = Screening {
            study_id,
            directory: entry.directory.clone(),
            variables: entry.variables.clone().unwrap_or_default(),
        };
        self.screenings.push(&patient_id, screening);
        Ok(())
    }

    /// Stream every row of a registry table through [`LinkageEngine::link_record`],
    /// logging and counting rows that cannot be linked.
    pub fn link_table<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(self.schema.skip_header)
            .delimiter(self.schema.delimiter_byte()?)
            .flexible(true)
            .from_reader(reader);

        for fields in reader.records() {
            let fields = fields?;
            let line = fields.position().map_or(0, |p| p.line());
            self.stats.rows += 1;

            let ids = (
                fields.get(self.schema.patient_column).unwrap_or_default().trim().to_string(),
                fields.get(self.schema.invitation_column).unwrap_or_default().trim().to_string(),
            );
            let outcome = parse_record(line, &fields, self.schema).and_then(|r| self.link_record(r));
            match outcome {
                Ok(()) => self.stats.linked += 1,
                Err(e) if e.is_row_local() => {
                    warn!(
                        line,
                        patient_id = %ids.0,
                        invitation_id = %ids.1,
                        error = %e,
                        "skipping registry row"
                    );
                    *self.stats.skipped.entry(skip_reason(&e).to_string()).or_default() += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn link_path(&mut self, path: &Path) -> Result<()> {
        self.link_table(File::open(path)?)
    }

    pub fn finish(self) -> (PatientScreenings, LinkageStats) {
        info!(
            rows = self.stats.rows,
            linked = self.stats.linked,
            skipped = self.stats.skipped_total(),
            patients = self.screenings.patient_count(),
            "registry linkage finished"
        );
        (self.screenings, self.stats)
    }
}
