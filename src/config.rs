//
// config.rs
// Dicom-Screening-Anon
//
// Run configuration: table layouts, index settings, and anonymizer policy, loadable from JSON.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use dicom::core::Tag;
use serde::{Deserialize, Serialize};

use crate::dates::CoarseDateFormat;
use crate::error::{Error, Result};

/// Everything a run needs besides the input/output paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub registry: RegistrySchema,
    pub links: LinksSchema,
    pub index: IndexSettings,
    pub anonymizer: AnonymizerSettings,
    pub date_format: CoarseDateFormat,
}

impl RunConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.links.validate()?;
        self.index.study_tag()?;
        if self.index.extension.trim().is_empty() {
            return Err(Error::Config("image file extension must not be empty".into()));
        }
        Ok(())
    }
}

/// Column layout of the registry table. Column numbers are zero-based positions in the full row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySchema {
    pub delimiter: char,
    pub skip_header: bool,
    pub patient_column: usize,
    pub invitation_column: usize,
    /// Everything from this column on is carried as a variable.
    pub first_variable_column: usize,
    pub screening_date_column: usize,
    pub diagnosis_date_column: usize,
    pub expected_columns: Option<usize>,
}

impl Default for RegistrySchema {
    fn default() -> Self {
        Self {
            delimiter: ' ',
            skip_header: true,
            patient_column: 0,
            invitation_column: 1,
            first_variable_column: 2,
            screening_date_column: 2,
            diagnosis_date_column: 9,
            expected_columns: None,
        }
    }
}

impl RegistrySchema {
    pub fn validate(&self) -> Result<()> {
        delimiter_byte(self.delimiter)?;
        let first = self.first_variable_column;
        if self.patient_column >= first || self.invitation_column >= first {
            return Err(Error::Config(
                "patient and invitation columns must precede the variable columns".into(),
            ));
        }
        if self.patient_column == self.invitation_column {
            return Err(Error::Config("patient and invitation columns must differ".into()));
        }
        if self.screening_date_column < first || self.diagnosis_date_column < first {
            return Err(Error::Config("date columns must be variable columns".into()));
        }
        if self.screening_date_column == self.diagnosis_date_column {
            return Err(Error::Config(
                "screening and diagnosis dates must be different columns".into(),
            ));
        }
        Ok(())
    }

    /// Smallest row width that satisfies the schema.
    pub fn min_width(&self) -> usize {
        let by_columns = [
            self.patient_column,
            self.invitation_column,
            self.screening_date_column,
            self.diagnosis_date_column,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1;
        by_columns.max(self.expected_columns.unwrap_or(0))
    }

    /// Position of the screening date inside the variable list.
    pub fn screening_variable(&self) -> usize {
        self.screening_date_column - self.first_variable_column
    }

    pub fn diagnosis_variable(&self) -> usize {
        self.diagnosis_date_column - self.first_variable_column
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter)
    }
}

/// Column layout of the links table: `patient_id, ?, invitation_id, invitation_number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinksSchema {
    pub delimiter: char,
    pub skip_header: bool,
    pub patient_column: usize,
    pub invitation_column: usize,
    pub invitation_number_column: usize,
}

impl Default for LinksSchema {
    fn default() -> Self {
        Self {
            delimiter: ' ',
            skip_header: true,
            patient_column: 0,
            invitation_column: 2,
            invitation_number_column: 3,
        }
    }
}

impl LinksSchema {
    pub fn validate(&self) -> Result<()> {
        delimiter_byte(self.delimiter)?;
        let columns = [
            self.patient_column,
            self.invitation_column,
            self.invitation_number_column,
        ];
        if columns[0] == columns[1] || columns[0] == columns[2] || columns[1] == columns[2] {
            return Err(Error::Config("links columns must be distinct".into()));
        }
        Ok(())
    }

    pub fn min_width(&self) -> usize {
        self.patient_column
            .max(self.invitation_column)
            .max(self.invitation_number_column)
            + 1
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        delimiter_byte(self.delimiter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Extension (without dot) of the image files to index.
    pub extension: String,
    /// Tag carrying the invitation number, e.g. `(0008,0050)`.
    pub study_tag: String,
    pub index_log: Option<PathBuf>,
    pub reuse_index: bool,
    pub parallel: bool,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            extension: "dcm".to_string(),
            study_tag: "(0008,0050)".to_string(),
            index_log: None,
            reuse_index: false,
            parallel: true,
        }
    }
}

impl IndexSettings {
    pub fn study_tag(&self) -> Result<Tag> {
        Tag::from_str(self.study_tag.trim())
            .map_err(|_| Error::Config(format!("{} is not a valid tag", self.study_tag)))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Basic Application Level Confidentiality Profile.
    #[default]
    Basic,
    /// Basic profile, but study and series descriptions are kept.
    RetainDescriptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizerSettings {
    pub modalities: Vec<String>,
    pub quarantine: PathBuf,
    pub audit_file: PathBuf,
    pub profile: Profile,
    pub rename_files: bool,
}

impl Default for AnonymizerSettings {
    fn default() -> Self {
        Self {
            modalities: vec!["MG".to_string(), "OT".to_string()],
            quarantine: PathBuf::from("quarantine"),
            audit_file: PathBuf::from("identity_audit.csv"),
            profile: Profile::Basic,
            rename_files: true,
        }
    }
}

fn delimiter_byte(delimiter: char) -> Result<u8> {
    u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| Error::Config(format!("delimiter {delimiter:?} is not a single ASCII character")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_registry_export_layout() {
        let config = RunConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.registry.screening_variable(), 0);
        assert_eq!(config.registry.diagnosis_variable(), 7);
        assert_eq!(config.registry.min_width(), 10);
        assert_eq!(config.links.min_width(), 4);
        assert_eq!(config.index.study_tag().expect("tag"), Tag(0x0008, 0x0050));
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: RunConfig = serde_json::from_str(
            r#"{ "registry": { "delimiter": ";", "diagnosis_date_column": 12 },
                 "date_format": "year" }"#,
        )
        .expect("parse");
        assert_eq!(config.registry.delimiter_byte().expect("delim"), b';');
        assert_eq!(config.registry.diagnosis_variable(), 10);
        assert!(config.registry.skip_header);
        assert_eq!(config.date_format, CoarseDateFormat::Year);
        assert_eq!(config.anonymizer.modalities, vec!["MG", "OT"]);
    }

    #[test]
    fn rejects_overlapping_columns_and_bad_delimiters() {
        let mut registry = RegistrySchema {
            diagnosis_date_column: 2,
            ..RegistrySchema::default()
        };
        assert!(matches!(registry.validate(), Err(Error::Config(_))));

        registry.diagnosis_date_column = 1;
        assert!(registry.validate().is_err());

        let links = LinksSchema {
            delimiter: 'ø',
            ..LinksSchema::default()
        };
        assert!(links.validate().is_err());

        let index = IndexSettings {
            study_tag: "not-a-tag".into(),
            ..IndexSettings::default()
        };
        assert!(index.study_tag().is_err());
    }

    #[test]
    fn expected_columns_widen_the_minimum() {
        let registry = RegistrySchema {
            expected_columns: Some(14),
            ..RegistrySchema::default()
        };
        assert_eq!(registry.min_width(), 14);
    }
}
