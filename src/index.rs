//
// index.rs
// Dicom-Screening-Anon
//
// Walks the image tree, maps every study identifier to the one directory holding its files,
// and persists/restores that mapping as a plain-text log so large trees need not be rescanned.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::IndexSettings;
use crate::dicom_access::StudyTagReader;
use crate::error::{Error, Result};
use crate::models::{IndexSource, StudyIndexEntry};

const LOG_SEPARATOR: &str = " => ";

/// Study id -> directory mapping, kept in indexing order.
#[derive(Debug, Clone)]
pub struct StudyIndex {
    root: PathBuf,
    entries: Vec<StudyIndexEntry>,
    positions: HashMap<String, usize>,
}

/// What a single insertion did to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexUpdate {
    Inserted,
    Unchanged,
    Widened { from: PathBuf, to: PathBuf },
}

impl StudyIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record that `directory` holds files of `study_id`.
    ///
    /// A second directory for a known study widens the entry to the deepest common
    /// ancestor of both. If that ancestor is the scan root itself the two directories
    /// cannot be told apart from unrelated studies and the insertion fails.
    pub fn insert(&mut self, study_id: &str, directory: &Path) -> Result<IndexUpdate> {
        let Some(&idx) = self.positions.get(study_id) else {
            self.push(StudyIndexEntry::new(study_id, directory));
            return Ok(IndexUpdate::Inserted);
        };

        let existing = &self.entries[idx].directory;
        if existing == directory {
            return Ok(IndexUpdate::Unchanged);
        }

        let ancestor = common_ancestor(existing, directory);
        if ancestor == self.root || !ancestor.starts_with(&self.root) {
            return Err(Error::StudyConflict {
                study_id: study_id.to_string(),
                existing: existing.clone(),
                incoming: directory.to_path_buf(),
            });
        }
        if ancestor == *existing {
            return Ok(IndexUpdate::Unchanged);
        }

        let from = std::mem::replace(&mut self.entries[idx].directory, ancestor.clone());
        Ok(IndexUpdate::Widened { from, to: ancestor })
    }

    pub fn get(&self, study_id: &str) -> Option<&StudyIndexEntry> {
        self.positions.get(study_id).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, study_id: &str) -> bool {
        self.positions.contains_key(study_id)
    }

    /// Attach de-identified registry variables to a study. A study linked twice keeps the latest variables.
    pub fn attach_variables(
        &mut self,
        study_id: &str,
        variables: Vec<String>,
    ) -> Option<&StudyIndexEntry> {
        let idx = *self.positions.get(study_id)?;
        let entry = &mut self.entries[idx];
        if entry.variables.is_some() {
            warn!(study_id, "study already linked to an earlier registry row");
        }
        entry.variables = Some(variables);
        Some(entry)
    }

    pub fn study_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.study_id.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StudyIndexEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: StudyIndexEntry) {
        self.positions
            .insert(entry.study_id.clone(), self.entries.len());
        self.entries.push(entry);
    }
}

/// Deepest path shared by both arguments, compared component by component.
pub fn common_ancestor(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect()
}

/// Lazily enumerate image files under `root`. Calling again restarts the walk.
pub fn scan<'a>(root: &'a Path, extension: &'a str) -> impl Iterator<Item = PathBuf> + 'a {
    let extension = extension.trim_start_matches('.');
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(move |entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .map(|entry| entry.into_path())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexOptions {
    /// Read tags on the rayon pool; insertion stays sequential and in walk order.
    pub parallel: bool,
    pub show_progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub files_seen: usize,
    pub unreadable: usize,
    pub widened: usize,
}

/// Read the study tag of every path and fold the results into a [`StudyIndex`].
///
/// Unreadable files are logged and skipped; a [`Error::StudyConflict`] aborts.
pub fn build_index<R, I>(
    root: &Path,
    paths: I,
    reader: &R,
    options: IndexOptions,
) -> Result<(StudyIndex, IndexStats)>
where
    R: StudyTagReader + Sync,
    I: IntoIterator<Item = PathBuf>,
{
    let paths: Vec<PathBuf> = paths.into_iter().collect();
    let progress = progress_bar(paths.len() as u64, options.show_progress);

    let read = |path: &PathBuf| {
        let tag = reader.read_study_tag(path);
        progress.inc(1);
        tag
    };
    let tags: Vec<Result<String>> = if options.parallel {
        paths.par_iter().map(read).collect()
    } else {
        paths.iter().map(read).collect()
    };
    progress.finish_and_clear();

    let mut index = StudyIndex::new(root);
    let mut stats = IndexStats {
        files_seen: paths.len(),
        ..IndexStats::default()
    };

    for (path, tag) in paths.iter().zip(tags) {
        let study_id = match tag {
            Ok(study_id) => study_id,
            Err(e) if e.is_row_local() => {
                warn!(path = %path.display(), error = %e, "skipping image file");
                stats.unreadable += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let directory = path.parent().unwrap_or(root);
        if let IndexUpdate::Widened { from, to } = index.insert(&study_id, directory)? {
            debug!(
                study_id = %study_id,
                from = %from.display(),
                to = %to.display(),
                "study spans several directories, widened to common ancestor"
            );
            stats.widened += 1;
        }
    }

    info!(
        studies = index.len(),
        files = stats.files_seen,
        unreadable = stats.unreadable,
        "study index built"
    );
    Ok((index, stats))
}

/// Write one `<study_id> => <directory>` line per entry, in indexing order.
pub fn persist<W: Write>(index: &StudyIndex, mut writer: W) -> Result<()> {
    for entry in index.iter() {
        writeln!(
            writer,
            "{}{}{}",
            entry.study_id,
            LOG_SEPARATOR,
            entry.directory.display()
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn persist_to_path(index: &StudyIndex, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    persist(index, BufWriter::new(file))
}

/// Outcome of reading a persisted index log.
#[derive(Debug)]
pub enum Restored {
    Complete(StudyIndex),
    /// Parsing stopped at `line` (1-based); `index` holds everything read before it.
    Partial {
        index: StudyIndex,
        line: usize,
        reason: String,
    },
}

impl Restored {
    pub fn is_complete(&self) -> bool {
        matches!(self, Restored::Complete(_))
    }

    pub fn index(&self) -> &StudyIndex {
        match self {
            Restored::Complete(index) | Restored::Partial { index, .. } => index,
        }
    }

    pub fn into_index(self) -> StudyIndex {
        match self {
            Restored::Complete(index) | Restored::Partial { index, .. } => index,
        }
    }
}

/// Parse a log written by [`persist`]. Entries are taken verbatim, without conflict checks.
pub fn restore<R: BufRead>(root: &Path, reader: R) -> Result<Restored> {
    let mut index = StudyIndex::new(root);

    for (idx, line) in reader.lines().enumerate() {
        let partial = |index: StudyIndex, reason: &str| Restored::Partial {
            index,
            line: idx + 1,
            reason: reason.to_string(),
        };
        let line = match line {
            Ok(line) => line,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Ok(partial(index, "invalid UTF-8"));
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some((study_id, directory)) = line.split_once(LOG_SEPARATOR) else {
            return Ok(partial(index, "expected `<study_id> => <directory>`"));
        };
        if study_id.is_empty() || directory.is_empty() {
            return Ok(partial(index, "empty study id or directory"));
        }
        if index.contains(study_id) {
            return Ok(partial(index, "duplicate study id"));
        }
        index.push(StudyIndexEntry::new(study_id, directory));
    }

    Ok(Restored::Complete(index))
}

pub fn restore_from_path(root: &Path, path: &Path) -> Result<Restored> {
    let file = File::open(path)?;
    restore(root, BufReader::new(file))
}

/// How the index of a run was obtained.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexReport {
    pub source: IndexSource,
    pub stats: IndexStats,
}

/// Restore the persisted index when asked to and it is usable, otherwise scan and persist.
pub fn load_or_build<R: StudyTagReader + Sync>(
    root: &Path,
    settings: &IndexSettings,
    reader: &R,
    show_progress: bool,
) -> Result<(StudyIndex, IndexReport)> {
    if let (true, Some(log)) = (settings.reuse_index, settings.index_log.as_deref()) {
        if log.is_file() {
            match restore_from_path(root, log)? {
                Restored::Complete(index) if !index.is_empty() => {
                    info!(path = %log.display(), studies = index.len(), "reusing persisted study index");
                    let report = IndexReport {
                        source: IndexSource::Restored,
                        ..IndexReport::default()
                    };
                    return Ok((index, report));
                }
                Restored::Complete(_) => {
                    warn!(path = %log.display(), "persisted study index is empty, rescanning");
                }
                Restored::Partial { index, line, reason } => {
                    warn!(
                        path = %log.display(),
                        line,
                        reason = %reason,
                        restored = index.len(),
                        "persisted study index is malformed, rescanning"
                    );
                }
            }
        } else {
            warn!(path = %log.display(), "no persisted study index found, scanning");
        }
    }

    info!(root = %root.display(), extension = %settings.extension, "scanning image tree");
    let options = IndexOptions {
        parallel: settings.parallel,
        show_progress,
    };
    let (index, stats) = build_index(root, scan(root, &settings.extension), reader, options)?;

    if let Some(log) = settings.index_log.as_deref() {
        persist_to_path(&index, log)?;
        info!(path = %log.display(), "study index persisted");
    }

    let report = IndexReport {
        source: IndexSource::Scanned,
        stats,
    };
    Ok((index, report))
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} indexing ({eta})",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}
