//
// error.rs
// Dicom-Screening-Anon
//
// Error taxonomy shared by the indexing, linkage, and anonymization stages.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the library. Row-local variants are skipped and logged by
/// the linkage engine and orchestrator; everything else aborts the run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// One study id was found in two directories whose only shared ancestor is the scan root.
    #[error("study {study_id} is split across {existing} and {incoming} with no common ancestor below the scan root")]
    StudyConflict {
        study_id: String,
        existing: PathBuf,
        incoming: PathBuf,
    },

    #[error("no link for patient {patient_id}, invitation {invitation_id}")]
    LinkNotFound {
        patient_id: String,
        invitation_id: String,
    },

    #[error("no indexed study matches invitation number {invitation_number}")]
    StudyIdNotFound { invitation_number: String },

    #[error("could not interpret '{text}' as a date")]
    DateParse { text: String },

    #[error("failed to read DICOM file {path}: {source}")]
    DicomRead {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to write DICOM file {path}: {source}")]
    DicomWrite {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("DICOM file {path} carries no study identifier")]
    MissingStudyTag { path: PathBuf },

    /// Row narrower than the configured schema.
    #[error("line {line}: expected at least {expected} columns, found {found}")]
    RowWidth {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to create output directory {path}: {source}")]
    OutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    /// True for errors that only invalidate the current row, file, or screening.
    pub fn is_row_local(&self) -> bool {
        matches!(
            self,
            Error::LinkNotFound { .. }
                | Error::StudyIdNotFound { .. }
                | Error::DateParse { .. }
                | Error::DicomRead { .. }
                | Error::MissingStudyTag { .. }
                | Error::RowWidth { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_io_failures_are_fatal() {
        let conflict = Error::StudyConflict {
            study_id: "S1".into(),
            existing: PathBuf::from("root/a"),
            incoming: PathBuf::from("root/b"),
        };
        assert!(!conflict.is_row_local());
        assert!(!Error::Config("bad".into()).is_row_local());

        let missing = Error::LinkNotFound {
            patient_id: "P1".into(),
            invitation_id: "I1".into(),
        };
        assert!(missing.is_row_local());
        assert_eq!(missing.to_string(), "no link for patient P1, invitation I1");
    }
}
