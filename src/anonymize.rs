use std::fs::{self, File};
use std::path::{Path, PathBuf};

use dicom::core::value::{DataSetSequence, PrimitiveValue, Value};
use dicom::core::{DataElement, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::mem::InMemElement;
use dicom::object::{
    open_file, DefaultDicomObject, FileDicomObject, FileMetaTableBuilder, InMemDicomObject,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{AnonymizerSettings, Profile};
use crate::dicom_access::ElementAccess;
use crate::error::{Error, Result};
use crate::storage::{hashed_file_name, QuarantineReason, QuarantineStore};

const MODALITY: Tag = Tag(0x0008, 0x0060);
const BURNED_IN_ANNOTATION: Tag = Tag(0x0028, 0x0301);
const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);

/// Attributes replaced by an empty value when present.
const EMPTIED: &[Tag] = &[
    Tag(0x0010, 0x0010), // PatientName
    Tag(0x0010, 0x0020), // PatientID
    Tag(0x0010, 0x0030), // PatientBirthDate
    Tag(0x0010, 0x0040), // PatientSex
    Tag(0x0008, 0x0050), // AccessionNumber
    Tag(0x0008, 0x0090), // ReferringPhysicianName
    Tag(0x0020, 0x0010), // StudyID
    Tag(0x0008, 0x0020), // StudyDate
    Tag(0x0008, 0x0030), // StudyTime
];

/// Attributes dropped entirely.
const REMOVED: &[Tag] = &[
    Tag(0x0008, 0x0021), // SeriesDate
    Tag(0x0008, 0x0022), // AcquisitionDate
    Tag(0x0008, 0x0023), // ContentDate
    Tag(0x0008, 0x0031), // SeriesTime
    Tag(0x0008, 0x0032), // AcquisitionTime
    Tag(0x0008, 0x0033), // ContentTime
    Tag(0x0008, 0x0080), // InstitutionName
    Tag(0x0008, 0x0081), // InstitutionAddress
    Tag(0x0008, 0x1010), // StationName
    Tag(0x0008, 0x1040), // InstitutionalDepartmentName
    Tag(0x0008, 0x1048), // PhysiciansOfRecord
    Tag(0x0008, 0x1050), // PerformingPhysicianName
    Tag(0x0008, 0x1070), // OperatorsName
    Tag(0x0008, 0x1110), // ReferencedStudySequence
    Tag(0x0008, 0x1111), // ReferencedPerformedProcedureStepSequence
    Tag(0x0008, 0x1120), // ReferencedPatientSequence
    Tag(0x0010, 0x1000), // OtherPatientIDs
    Tag(0x0010, 0x1001), // OtherPatientNames
    Tag(0x0010, 0x1010), // PatientAge
    Tag(0x0010, 0x1040), // PatientAddress
    Tag(0x0010, 0x1060), // PatientMotherBirthName
    Tag(0x0010, 0x2154), // PatientTelephoneNumbers
    Tag(0x0018, 0x1000), // DeviceSerialNumber
    Tag(0x0032, 0x1032), // RequestingPhysician
    Tag(0x0040, 0x0275), // RequestAttributesSequence
];

/// Removed by the basic profile, kept with `retain-descriptions`.
const DESCRIPTIONS: &[Tag] = &[
    Tag(0x0008, 0x1030), // StudyDescription
    SERIES_DESCRIPTION,
];

/// UIDs replaced by salted hashes, consistently within one run.
const UIDS: &[Tag] = &[
    Tag(0x0020, 0x000D), // StudyInstanceUID
    Tag(0x0020, 0x000E), // SeriesInstanceUID
    SOP_INSTANCE_UID,
    Tag(0x0020, 0x0052), // FrameOfReferenceUID
    Tag(0x0008, 0x1155), // ReferencedSOPInstanceUID
];

/// Original and cleaned values of these land in the audit trail.
const AUDITED: &[Tag] = &[
    Tag(0x0010, 0x0010), // PatientName
    Tag(0x0010, 0x0020), // PatientID
    Tag(0x0008, 0x0050), // AccessionNumber
    Tag(0x0008, 0x0020), // StudyDate
    Tag(0x0020, 0x000D), // StudyInstanceUID
    Tag(0x0020, 0x000E), // SeriesInstanceUID
    SOP_INSTANCE_UID,
];

/// De-identifies every image under a source directory into a destination directory.
pub trait Anonymizer {
    fn anonymize(&mut self, source: &Path, destination: &Path) -> Result<AnonymizeReport>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnonymizeReport {
    pub written: usize,
    pub quarantined: usize,
    /// Directory entries the walk could not read.
    pub unreadable: usize,
}

/// One audited attribute of one written file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub tag: Tag,
    pub original: String,
    pub cleaned: String,
}

/// Basic Application Level Confidentiality Profile with modality filtering and quarantine.
pub struct BasicProfileAnonymizer {
    modalities: Vec<String>,
    profile: Profile,
    rename_files: bool,
    quarantine: QuarantineStore,
    audit: csv::Writer<File>,
    uid_salt: String,
}

impl BasicProfileAnonymizer {
    pub fn new(settings: &AnonymizerSettings) -> Result<Self> {
        let quarantine = QuarantineStore::new(&settings.quarantine)?;
        if let Some(parent) = settings.audit_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| Error::OutputDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut audit = csv::Writer::from_path(&settings.audit_file)?;
        audit.write_record(["source", "destination", "tag", "original", "cleaned"])?;

        Ok(Self {
            modalities: settings
                .modalities
                .iter()
                .map(|m| m.trim().to_uppercase())
                .collect(),
            profile: settings.profile,
            rename_files: settings.rename_files,
            quarantine,
            audit,
            uid_salt: uuid::Uuid::new_v4().simple().to_string(),
        })
    }

    /// Fix the UID salt, making replacement UIDs reproducible.
    pub fn with_uid_salt(mut self, salt: impl Into<String>) -> Self {
        self.uid_salt = salt.into();
        self
    }

    /// Flush the audit trail.
    pub fn finish(mut self) -> Result<()> {
        self.audit.flush()?;
        Ok(())
    }

    /// Reason to keep a file out of the anonymized tree, if any.
    pub fn screen(&self, obj: &DefaultDicomObject) -> Option<QuarantineReason> {
        let modality = obj.element_str(MODALITY).unwrap_or_default().to_uppercase();
        if !self.modalities.is_empty() && !self.modalities.contains(&modality) {
            return Some(QuarantineReason::ModalityNotAllowed(modality));
        }
        if obj
            .element_str(BURNED_IN_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("YES"))
        {
            return Some(QuarantineReason::BurnedInAnnotation);
        }
        if obj
            .element_str(SERIES_DESCRIPTION)
            .is_some_and(|v| v.eq_ignore_ascii_case("Patient Protocol"))
        {
            return Some(QuarantineReason::PatientProtocol);
        }
        None
    }

    /// Derive the replacement for `uid`: `2.25.` followed by 128 bits of a salted SHA-256.
    pub fn remap_uid(&self, uid: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.uid_salt.as_bytes());
        hasher.update(uid.trim_end_matches('\0').trim().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0_u8; 16];
        head.copy_from_slice(&digest[..16]);
        format!("2.25.{}", u128::from_be_bytes(head))
    }

    /// Build the de-identified copy of `obj`, returning it with the audit records.
    pub fn clean(&self, obj: &DefaultDicomObject, source: &Path) -> Result<(DefaultDicomObject, Vec<AuditRecord>)> {
        let originals: Vec<(Tag, String)> = AUDITED
            .iter()
            .map(|&tag| (tag, obj.element_str(tag).unwrap_or_default()))
            .collect();

        let original_sop = obj
            .element_str(SOP_INSTANCE_UID)
            .unwrap_or_else(|| obj.meta().media_storage_sop_instance_uid.trim_end_matches('\0').to_string());
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax(obj.meta().transfer_syntax())
            .media_storage_sop_class_uid(obj.meta().media_storage_sop_class_uid.trim_end_matches('\0'))
            .media_storage_sop_instance_uid(self.remap_uid(&original_sop))
            .build()
            .map_err(|e| Error::DicomWrite {
                path: source.to_path_buf(),
                source: Box::new(e),
            })?;

        let mut cleaned = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
        for elem in obj.iter() {
            if let Some(elem) = self.clean_element(elem) {
                cleaned.put(elem);
            }
        }

        cleaned.put(DataElement::new(
            Tag(0x0012, 0x0062), // PatientIdentityRemoved
            VR::CS,
            PrimitiveValue::from("YES"),
        ));
        let method = match self.profile {
            Profile::Basic => "Basic Application Level Confidentiality Profile",
            Profile::RetainDescriptions => {
                "Basic Application Level Confidentiality Profile; Retain Descriptions"
            }
        };
        cleaned.put(DataElement::new(
            Tag(0x0012, 0x0063), // DeidentificationMethod
            VR::LO,
            PrimitiveValue::from(method),
        ));

        let audit = originals
            .into_iter()
            .map(|(tag, original)| AuditRecord {
                tag,
                original,
                cleaned: cleaned.element_str(tag).unwrap_or_default(),
            })
            .collect();
        Ok((cleaned, audit))
    }

    /// The cleaned form of one element, or `None` when the profile drops it.
    /// Sequence items are cleaned with the same rules.
    fn clean_element(&self, elem: &InMemElement) -> Option<InMemElement> {
        let header = elem.header();
        let tag = header.tag;
        // Odd groups are private.
        if tag.group() % 2 == 1 || REMOVED.contains(&tag) {
            return None;
        }
        if self.profile == Profile::Basic && DESCRIPTIONS.contains(&tag) {
            return None;
        }
        if EMPTIED.contains(&tag) {
            return Some(DataElement::new(tag, header.vr, PrimitiveValue::Empty));
        }
        if UIDS.contains(&tag) {
            let uid = elem.to_str().unwrap_or_default();
            return Some(DataElement::new(tag, VR::UI, PrimitiveValue::from(self.remap_uid(&uid))));
        }
        if let Value::Sequence(seq) = elem.value() {
            let items: Vec<InMemDicomObject> =
                seq.items().iter().map(|item| self.clean_item(item)).collect();
            return Some(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
        }
        Some(elem.clone())
    }

    fn clean_item(&self, item: &InMemDicomObject) -> InMemDicomObject {
        let mut cleaned = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
        for elem in item.iter() {
            if let Some(elem) = self.clean_element(elem) {
                cleaned.put(elem);
            }
        }
        cleaned
    }

    /// Where the cleaned copy of `source` goes. Existing files are never overwritten:
    /// a taken kept name falls back to a hashed name, then to the next free number.
    fn output_path(&self, destination: &Path, source: &Path, next_number: &mut usize) -> PathBuf {
        if !self.rename_files {
            if let Some(name) = source.file_name() {
                let kept = destination.join(name);
                if !kept.exists() {
                    return kept;
                }
                let hashed = destination.join(hashed_file_name(source));
                if !hashed.exists() {
                    warn!(
                        source = %source.display(),
                        output = %hashed.display(),
                        "file name already taken in destination, writing under a hashed name"
                    );
                    return hashed;
                }
            }
        }
        loop {
            let numbered = destination.join(format!("{next_number}.dcm"));
            *next_number += 1;
            if !numbered.exists() {
                return numbered;
            }
        }
    }

    fn record_audit(&mut self, source: &Path, destination: &Path, records: &[AuditRecord]) -> Result<()> {
        let source = source.display().to_string();
        let destination = destination.display().to_string();
        for record in records {
            let tag = format!("({:04X},{:04X})", record.tag.group(), record.tag.element());
            self.audit.write_record([
                source.as_str(),
                destination.as_str(),
                tag.as_str(),
                record.original.as_str(),
                record.cleaned.as_str(),
            ])?;
        }
        Ok(())
    }

    fn divert(&self, path: &Path, reason: &QuarantineReason) -> Result<()> {
        let target = self.quarantine.divert(path, reason)?;
        info!(
            path = %path.display(),
            quarantine = %target.display(),
            reason = %reason,
            "file quarantined"
        );
        Ok(())
    }
}

impl Anonymizer for BasicProfileAnonymizer {
    fn anonymize(&mut self, source: &Path, destination: &Path) -> Result<AnonymizeReport> {
        fs::create_dir_all(destination).map_err(|e| Error::OutputDirectory {
            path: destination.to_path_buf(),
            source: e,
        })?;

        let mut report = AnonymizeReport::default();
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(source).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => {
                    warn!(source = %source.display(), error = %e, "unreadable entry in study directory");
                    report.unreadable += 1;
                }
            }
        }

        // Several screenings of one patient may share a coarse date; keep numbering on.
        let mut next_number = existing_dicom_files(destination)? + 1;

        for path in &files {
            let obj = match open_file(path) {
                Ok(obj) => obj,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "not a DICOM file");
                    self.divert(path, &QuarantineReason::NotDicom)?;
                    report.quarantined += 1;
                    continue;
                }
            };
            if let Some(reason) = self.screen(&obj) {
                self.divert(path, &reason)?;
                report.quarantined += 1;
                continue;
            }

            let (cleaned, audit) = self.clean(&obj, path)?;
            let output = self.output_path(destination, path, &mut next_number);
            cleaned.write_to_file(&output).map_err(|e| Error::DicomWrite {
                path: output.clone(),
                source: Box::new(e),
            })?;
            self.record_audit(path, &output, &audit)?;
            report.written += 1;
        }

        if files.is_empty() && report.unreadable == 0 {
            warn!(source = %source.display(), "no files found in study directory");
        }
        debug!(
            source = %source.display(),
            destination = %destination.display(),
            written = report.written,
            quarantined = report.quarantined,
            unreadable = report.unreadable,
            "study anonymized"
        );
        Ok(report)
    }
}

fn existing_dicom_files(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "dcm") {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn anonymizer(root: &Path) -> BasicProfileAnonymizer {
        let settings = AnonymizerSettings {
            quarantine: root.join("quarantine"),
            audit_file: root.join("audit").join("identity.csv"),
            ..AnonymizerSettings::default()
        };
        BasicProfileAnonymizer::new(&settings)
            .expect("anonymizer")
            .with_uid_salt("fixed")
    }

    fn mammogram(sop_uid: &str, extra: Vec<InMemElement>) -> DefaultDicomObject {
        let meta = FileMetaTableBuilder::new()
            .transfer_syntax("1.2.840.10008.1.2.1")
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.1.2")
            .media_storage_sop_instance_uid(sop_uid)
            .build()
            .expect("meta");
        let mut obj = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
        obj.put(DataElement::new(MODALITY, VR::CS, PrimitiveValue::from("MG")));
        obj.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from("Nordmann^Kari"),
        ));
        obj.put(DataElement::new(SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_uid)));
        for elem in extra {
            obj.put(elem);
        }
        obj
    }

    fn write_mammogram(path: &Path, sop_uid: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        mammogram(sop_uid, Vec::new())
            .write_to_file(path)
            .expect("write mammogram");
    }

    fn dcm_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn remapped_uids_are_stable_valid_and_salted() {
        let dir = tempdir().expect("tempdir");
        let anon = anonymizer(dir.path());
        let a = anon.remap_uid("1.2.840.113619.2.1");
        assert_eq!(a, anon.remap_uid("1.2.840.113619.2.1\0"));
        assert_ne!(a, anon.remap_uid("1.2.840.113619.2.2"));
        assert!(a.starts_with("2.25."));
        assert!(a.len() <= 64);
        assert!(a[5..].chars().all(|c| c.is_ascii_digit()));

        let other = anonymizer(dir.path()).with_uid_salt("different");
        assert_ne!(a, other.remap_uid("1.2.840.113619.2.1"));
    }

    #[test]
    fn non_dicom_files_are_quarantined() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("study");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join("readme.dcm"), b"definitely not dicom").expect("write");

        let mut anon = anonymizer(dir.path());
        let report = anon
            .anonymize(&source, &dir.path().join("out").join("3-2014"))
            .expect("anonymize");
        assert_eq!(
            report,
            AnonymizeReport {
                written: 0,
                quarantined: 1,
                unreadable: 0,
            }
        );
        assert!(dir.path().join("quarantine").join("not-dicom").is_dir());
        assert!(dir.path().join("out").join("3-2014").is_dir());
        anon.finish().expect("finish");
        assert!(dir.path().join("audit").join("identity.csv").is_file());
    }

    #[test]
    fn kept_names_never_overwrite_each_other() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("study");
        write_mammogram(&source.join("left").join("1.dcm"), "1.2.3.1");
        write_mammogram(&source.join("right").join("1.dcm"), "1.2.3.2");

        let settings = AnonymizerSettings {
            quarantine: dir.path().join("quarantine"),
            audit_file: dir.path().join("audit.csv"),
            rename_files: false,
            ..AnonymizerSettings::default()
        };
        let mut anon = BasicProfileAnonymizer::new(&settings).expect("anonymizer");
        let destination = dir.path().join("out");
        let report = anon.anonymize(&source, &destination).expect("anonymize");
        assert_eq!(report.written, 2);

        let names = dcm_files(&destination);
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"1.dcm".to_string()));
        assert!(names.iter().any(|n| n.starts_with("1-") && n.ends_with(".dcm")));

        // Same study again: every file still lands under a fresh name.
        let again = anon.anonymize(&source, &destination).expect("anonymize again");
        assert_eq!(again.written, 2);
        assert_eq!(dcm_files(&destination).len(), 4);
    }

    #[test]
    fn numbering_skips_files_already_present() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("study");
        write_mammogram(&source.join("a.dcm"), "1.2.3.1");
        let destination = dir.path().join("out");
        fs::create_dir_all(&destination).expect("mkdir");
        fs::write(destination.join("2.dcm"), b"earlier screening").expect("write");

        let mut anon = anonymizer(dir.path());
        anon.anonymize(&source, &destination).expect("anonymize");
        assert_eq!(dcm_files(&destination), vec!["2.dcm", "3.dcm"]);
        assert_eq!(fs::read(destination.join("2.dcm")).expect("read"), b"earlier screening");
    }

    #[test]
    fn unreadable_study_entries_are_counted() {
        let dir = tempdir().expect("tempdir");
        let mut anon = anonymizer(dir.path());
        let report = anon
            .anonymize(&dir.path().join("missing"), &dir.path().join("out"))
            .expect("anonymize");
        assert_eq!(
            report,
            AnonymizeReport {
                written: 0,
                quarantined: 0,
                unreadable: 1,
            }
        );
    }

    #[test]
    fn sequence_items_are_cleaned_like_the_top_level() {
        let dir = tempdir().expect("tempdir");
        let anon = anonymizer(dir.path());

        let mut item = InMemDicomObject::new_empty_with_dict(StandardDataDictionary);
        item.put(DataElement::new(
            Tag(0x0008, 0x1150),
            VR::UI,
            PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.1.2"),
        ));
        item.put(DataElement::new(
            Tag(0x0008, 0x1155),
            VR::UI,
            PrimitiveValue::from("1.2.3.99"),
        ));
        item.put(DataElement::new(
            Tag(0x0029, 0x0010),
            VR::LO,
            PrimitiveValue::from("VENDOR"),
        ));
        item.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from("Nordmann^Kari"),
        ));
        let source_images = DataElement::new(
            Tag(0x0008, 0x2112), // SourceImageSequence
            VR::SQ,
            DataSetSequence::from(vec![item]),
        );
        let obj = mammogram("1.2.3.1", vec![source_images]);

        let (cleaned, _) = anon.clean(&obj, Path::new("a.dcm")).expect("clean");
        let items = cleaned
            .element(Tag(0x0008, 0x2112))
            .expect("sequence kept")
            .items()
            .expect("items");
        assert_eq!(items.len(), 1);
        let nested = &items[0];
        assert_eq!(
            nested.element_str(Tag(0x0008, 0x1155)),
            Some(anon.remap_uid("1.2.3.99"))
        );
        assert_eq!(
            nested.element_str(Tag(0x0008, 0x1150)).as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.1.2")
        );
        assert!(!nested.has_element(Tag(0x0029, 0x0010)));
        assert_eq!(nested.element_str(Tag(0x0010, 0x0010)).unwrap_or_default(), "");
    }
}
