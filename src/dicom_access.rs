use std::path::Path;

use dicom::core::Tag;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::{DefaultDicomObject, InMemDicomObject, OpenFileOptions};

use crate::error::{Error, Result};

/// Small helper trait to pull trimmed string values from different DICOM object shapes.
pub trait ElementAccess {
    fn element_str(&self, tag: Tag) -> Option<String>;
    fn has_element(&self, tag: Tag) -> bool;
}

impl ElementAccess for DefaultDicomObject {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

impl ElementAccess for InMemDicomObject<StandardDataDictionary> {
    fn element_str(&self, tag: Tag) -> Option<String> {
        self.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(['\0', ' ']).trim().to_string())
    }

    fn has_element(&self, tag: Tag) -> bool {
        self.element(tag).is_ok()
    }
}

/// Reads the identifier that ties an image file to a screening invitation.
pub trait StudyTagReader {
    fn read_study_tag(&self, path: &Path) -> Result<String>;
}

/// Reads one fixed tag from the file header, stopping before the pixel data.
#[derive(Debug, Clone, Copy)]
pub struct DicomStudyTagReader {
    tag: Tag,
}

impl DicomStudyTagReader {
    pub fn new(tag: Tag) -> Self {
        Self { tag }
    }
}

impl StudyTagReader for DicomStudyTagReader {
    fn read_study_tag(&self, path: &Path) -> Result<String> {
        let obj = OpenFileOptions::new()
            .read_until(Tag(0x7fe0, 0x0010))
            .open_file(path)
            .map_err(|e| Error::DicomRead {
                path: path.to_path_buf(),
                source: Box::new(e),
            })?;

        obj.element_str(self.tag)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| Error::MissingStudyTag {
                path: path.to_path_buf(),
            })
    }
}

impl<F> StudyTagReader for F
where
    F: Fn(&Path) -> Result<String>,
{
    fn read_study_tag(&self, path: &Path) -> Result<String> {
        self(path)
    }
}
