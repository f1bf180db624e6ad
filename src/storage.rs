//
// storage.rs
// Dicom-Screening-Anon
//
// Quarantine store for files the anonymizer refuses: sanitized, hash-suffixed copies grouped by reason.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Why a file was kept out of the anonymized tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineReason {
    NotDicom,
    ModalityNotAllowed(String),
    BurnedInAnnotation,
    PatientProtocol,
}

impl QuarantineReason {
    /// Subdirectory of the quarantine root used for this reason.
    pub fn slug(&self) -> &'static str {
        match self {
            QuarantineReason::NotDicom => "not-dicom",
            QuarantineReason::ModalityNotAllowed(_) => "modality",
            QuarantineReason::BurnedInAnnotation => "burned-in-annotation",
            QuarantineReason::PatientProtocol => "patient-protocol",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::NotDicom => write!(f, "not a readable DICOM file"),
            QuarantineReason::ModalityNotAllowed(m) => write!(f, "modality {m:?} not allowed"),
            QuarantineReason::BurnedInAnnotation => write!(f, "burned-in annotation"),
            QuarantineReason::PatientProtocol => write!(f, "patient protocol series"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuarantineStore {
    root: PathBuf,
}

impl QuarantineStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        // Created eagerly so a bad location fails the run before any study is touched.
        fs::create_dir_all(&root).map_err(|source| Error::OutputDirectory {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source` under `<root>/<reason>/`, named by [`hashed_file_name`].
    pub fn divert(&self, source: &Path, reason: &QuarantineReason) -> Result<PathBuf> {
        let dir = self.root.join(reason.slug());
        fs::create_dir_all(&dir).map_err(|e| Error::OutputDirectory {
            path: dir.clone(),
            source: e,
        })?;

        let path = dir.join(hashed_file_name(source));
        fs::copy(source, &path)?;
        Ok(path)
    }
}

/// `<stem>-<12 hex digits of the source path hash>.dcm`: files with equal names
/// from different directories get different names.
pub fn hashed_file_name(source: &Path) -> String {
    let hash = hex::encode(Sha256::digest(source.to_string_lossy().as_bytes()));
    format!("{}-{}.dcm", safe_stem(source), &hash[..12])
}

const MAX_STEM_LEN: usize = 64;

fn safe_stem(path: &Path) -> String {
    let stem: String = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        .take(MAX_STEM_LEN)
        .collect();
    if stem.is_empty() {
        "file".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stems_keep_only_safe_characters() {
        assert_eq!(safe_stem(Path::new("series 2/IM_0001 (copy).dcm")), "IM_0001copy");
        assert_eq!(safe_stem(Path::new("/study/Ærø.dcm")), "r");
        assert_eq!(safe_stem(Path::new("/study/ÆØÅ.dcm")), "file");
        let long = format!("/study/{}.dcm", "x".repeat(200));
        assert_eq!(safe_stem(Path::new(&long)).len(), MAX_STEM_LEN);
    }

    #[test]
    fn hashed_names_depend_on_the_full_path() {
        let left = hashed_file_name(Path::new("/scan/p1/left/1.dcm"));
        let right = hashed_file_name(Path::new("/scan/p1/right/1.dcm"));
        assert_ne!(left, right);
        assert!(left.starts_with("1-") && left.ends_with(".dcm"));
        assert_eq!(left, hashed_file_name(Path::new("/scan/p1/left/1.dcm")));
    }

    #[test]
    fn divert_groups_by_reason_and_avoids_name_clashes() {
        let root = tempdir().expect("tmpdir");
        let store = QuarantineStore::new(root.path().join("quarantine")).expect("store");

        let a = root.path().join("a");
        let b = root.path().join("b");
        fs::create_dir_all(&a).expect("mkdir a");
        fs::create_dir_all(&b).expect("mkdir b");
        fs::write(a.join("img 1.dcm"), b"first").expect("write a");
        fs::write(b.join("img 1.dcm"), b"second").expect("write b");

        let reason = QuarantineReason::ModalityNotAllowed("CT".into());
        let first = store.divert(&a.join("img 1.dcm"), &reason).expect("divert a");
        let second = store.divert(&b.join("img 1.dcm"), &reason).expect("divert b");

        assert_ne!(first, second);
        assert!(first.starts_with(store.root().join("modality")));
        assert!(first
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("img1-")));
        assert_eq!(fs::read(&second).expect("read"), b"second");
    }
}
