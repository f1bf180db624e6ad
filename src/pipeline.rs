//! The full run: index the image tree, load the links, link the registry,
//! then anonymize and write the de-identified outputs.

use std::path::PathBuf;

use tracing::{info, info_span};

use crate::anonymize::BasicProfileAnonymizer;
use crate::config::RunConfig;
use crate::dicom_access::DicomStudyTagReader;
use crate::error::Result;
use crate::index::{self, IndexReport, StudyIndex};
use crate::links::LinksIndex;
use crate::models::RunSummary;
use crate::orchestrator::{metadata_writer, Orchestrator, RandomPseudonyms};
use crate::registry::LinkageEngine;

/// Input and output locations of one run.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub registry: PathBuf,
    pub links: PathBuf,
    pub source_root: PathBuf,
    pub output_root: PathBuf,
    pub metadata_out: PathBuf,
}

/// Restore or scan the study index of `source_root` per the index settings.
pub fn prepare_index(
    source_root: &std::path::Path,
    config: &RunConfig,
    show_progress: bool,
) -> Result<(StudyIndex, IndexReport)> {
    config.validate()?;
    let reader = DicomStudyTagReader::new(config.index.study_tag()?);
    index::load_or_build(source_root, &config.index, &reader, show_progress)
}

pub fn run_pipeline(paths: &RunPaths, config: &RunConfig, show_progress: bool) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    let (mut study_index, report) = {
        let _span = info_span!("index").entered();
        prepare_index(&paths.source_root, config, show_progress)?
    };
    summary.index_source = report.source;
    summary.image_files_seen = report.stats.files_seen;
    summary.unreadable_image_files = report.stats.unreadable;
    summary.widened_studies = report.stats.widened;
    summary.indexed_studies = study_index.len();

    let links = LinksIndex::from_path(&paths.links, &config.links)?;
    summary.duplicate_links = links.duplicates();
    info!(links = links.len(), duplicates = links.duplicates(), "links table loaded");

    let (screenings, linkage) = {
        let _span = info_span!("link").entered();
        let mut engine = LinkageEngine::new(
            &mut study_index,
            &links,
            &config.registry,
            config.date_format,
        );
        engine.link_path(&paths.registry)?;
        engine.finish()
    };
    summary.registry_rows = linkage.rows;
    summary.linked_rows = linkage.linked;
    summary.skipped_rows = linkage.skipped;

    let _span = info_span!("anonymize").entered();
    let mut anonymizer = BasicProfileAnonymizer::new(&config.anonymizer)?;
    let mut table = metadata_writer(&paths.metadata_out, config.registry.delimiter_byte()?)?;
    let stats = Orchestrator::new(
        &paths.source_root,
        &paths.output_root,
        config.registry.screening_variable(),
        &mut anonymizer,
        RandomPseudonyms,
    )
    .with_progress(show_progress)
    .run(&screenings, &mut table)?;
    anonymizer.finish()?;

    summary.patients = stats.patients;
    summary.screenings_written = stats.screenings_written;
    summary.degenerate_screenings = stats.degenerate_screenings;
    summary.files_anonymized = stats.files_anonymized;
    summary.files_quarantined = stats.files_quarantined;
    summary.unreadable_study_entries = stats.files_unreadable;
    info!(
        linked = summary.linked_rows,
        skipped = summary.skipped_total(),
        screenings = summary.screenings_written,
        quarantined = summary.files_quarantined,
        "run finished"
    );
    Ok(summary)
}
