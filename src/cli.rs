//
// cli.rs
// Dicom-Screening-Anon
//
// Defines the CLI surface with Clap, assembles the run configuration, and dispatches commands.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::config::{Profile, RunConfig};
use crate::dates::CoarseDateFormat;
use crate::logging::{init_logging, LogConfig, LogFormat};
use crate::models::{IndexSource, RunSummary};
use crate::pipeline::{self, RunPaths};

/// Command-line interface glue code: defines the available verbs and dispatches to modules.
#[derive(Parser)]
#[command(name = "dicom-screening-anon")]
#[command(version, about = "Link registry screenings to DICOM studies and anonymize both", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Compact, global = true)]
    pub log_format: LogFormatArg,

    /// Write logs to a file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Hide progress bars
    #[arg(long, global = true)]
    pub no_progress: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan (or restore) the study index of a DICOM tree and persist it
    Index {
        source_dicom_dir: PathBuf,
        #[command(flatten)]
        options: ConfigArgs,
    },
    /// Link the registry to the DICOM tree and write the anonymized dataset
    Run {
        /// Registry table with one screening per row
        registry_csv: PathBuf,
        /// Where the de-identified variables are written
        destination_variables_csv: PathBuf,
        /// Root of the original DICOM files
        source_dicom_dir: PathBuf,
        /// Root of the anonymized DICOM tree
        destination_dicom_dir: PathBuf,
        /// Links table mapping patient/invitation ids to invitation numbers
        #[arg(short, long, value_name = "LINKS_CSV")]
        links: PathBuf,
        /// Write the run summary as JSON
        #[arg(long, value_name = "PATH")]
        summary: Option<PathBuf>,
        #[command(flatten)]
        options: ConfigArgs,
    },
}

/// Flags overriding the JSON configuration file.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// JSON run configuration; flags below override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Registry (and output table) delimiter
    #[arg(long)]
    pub delimiter: Option<char>,
    #[arg(long)]
    pub links_delimiter: Option<char>,
    /// The registry table has no header line
    #[arg(long)]
    pub no_header: bool,
    /// The links table has no header line
    #[arg(long)]
    pub links_no_header: bool,
    /// Zero-based registry column of the screening date
    #[arg(long)]
    pub screening_date_column: Option<usize>,
    /// Zero-based registry column of the diagnosis date
    #[arg(long)]
    pub diagnosis_date_column: Option<usize>,
    /// Minimum number of columns a registry row must have
    #[arg(long)]
    pub expected_columns: Option<usize>,
    #[arg(long, value_enum)]
    pub date_format: Option<CoarseDateFormat>,
    /// Image file extension to index
    #[arg(long)]
    pub extension: Option<String>,
    /// Tag holding the invitation number, e.g. "(0008,0050)"
    #[arg(long)]
    pub study_tag: Option<String>,
    /// Persisted study index (`<study_id> => <directory>` lines)
    #[arg(long, value_name = "PATH")]
    pub index_log: Option<PathBuf>,
    /// Reuse the persisted study index instead of rescanning
    #[arg(long, requires = "index_log")]
    pub reuse_index: bool,
    /// Read image headers on a single thread
    #[arg(long)]
    pub sequential: bool,
    /// Allowed modalities, comma separated (default: mg,ot)
    #[arg(short, long, value_delimiter = ',')]
    pub modalities: Option<Vec<String>>,
    #[arg(long, value_name = "DIR")]
    pub quarantine: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    pub audit_file: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub profile: Option<Profile>,
    /// Keep original file names instead of numbering them
    #[arg(long)]
    pub keep_file_names: bool,
}

impl ConfigArgs {
    pub fn to_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => RunConfig::default(),
        };

        if let Some(delimiter) = self.delimiter {
            config.registry.delimiter = delimiter;
        }
        if let Some(delimiter) = self.links_delimiter {
            config.links.delimiter = delimiter;
        }
        if self.no_header {
            config.registry.skip_header = false;
        }
        if self.links_no_header {
            config.links.skip_header = false;
        }
        if let Some(column) = self.screening_date_column {
            config.registry.screening_date_column = column;
        }
        if let Some(column) = self.diagnosis_date_column {
            config.registry.diagnosis_date_column = column;
        }
        if self.expected_columns.is_some() {
            config.registry.expected_columns = self.expected_columns;
        }
        if let Some(format) = self.date_format {
            config.date_format = format;
        }
        if let Some(extension) = &self.extension {
            config.index.extension = extension.clone();
        }
        if let Some(tag) = &self.study_tag {
            config.index.study_tag = tag.clone();
        }
        if self.index_log.is_some() {
            config.index.index_log = self.index_log.clone();
        }
        if self.reuse_index {
            config.index.reuse_index = true;
        }
        if self.sequential {
            config.index.parallel = false;
        }
        if let Some(modalities) = &self.modalities {
            config.anonymizer.modalities = modalities.clone();
        }
        if let Some(dir) = &self.quarantine {
            config.anonymizer.quarantine = dir.clone();
        }
        if let Some(path) = &self.audit_file {
            config.anonymizer.audit_file = path.clone();
        }
        if let Some(profile) = self.profile {
            config.anonymizer.profile = profile;
        }
        if self.keep_file_names {
            config.anonymizer.rename_files = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Compact,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    // Parse the raw CLI arguments once and dispatch to a subcommand handler.
    let cli = Cli::parse();

    let log_config = LogConfig {
        format: cli.log_format.into(),
        log_file: cli.log_file.clone(),
        ..LogConfig::from_verbosity(cli.verbose)
    };
    init_logging(&log_config).context("Failed to initialize logging")?;
    let show_progress = !cli.no_progress && cli.verbose == 0 && cli.log_file.is_none();

    match cli.command {
        Commands::Index {
            source_dicom_dir,
            options,
        } => {
            if !source_dicom_dir.is_dir() {
                bail!("Source directory {:?} does not exist", source_dicom_dir);
            }
            let config = options.to_config()?;
            let (index, report) = pipeline::prepare_index(&source_dicom_dir, &config, show_progress)?;
            let source = match report.source {
                IndexSource::Scanned => "scanned",
                IndexSource::Restored => "restored",
            };
            println!("Study index of {:?} ({})", source_dicom_dir, source);
            println!("  Studies:         {}", index.len());
            if report.source == IndexSource::Scanned {
                println!("  Image files:     {}", report.stats.files_seen);
                println!("  Unreadable:      {}", report.stats.unreadable);
                println!("  Widened studies: {}", report.stats.widened);
            }
            if config.index.index_log.is_none() {
                println!("  (not persisted, pass --index-log to keep it)");
            }
        }
        Commands::Run {
            registry_csv,
            destination_variables_csv,
            source_dicom_dir,
            destination_dicom_dir,
            links,
            summary,
            options,
        } => {
            if !source_dicom_dir.is_dir() {
                bail!("Source directory {:?} does not exist", source_dicom_dir);
            }
            let config = options.to_config()?;
            let paths = RunPaths {
                registry: registry_csv,
                links,
                source_root: source_dicom_dir,
                output_root: destination_dicom_dir,
                metadata_out: destination_variables_csv,
            };
            let result = pipeline::run_pipeline(&paths, &config, show_progress)?;
            print_summary(&result);
            if let Some(path) = summary {
                let json = serde_json::to_string_pretty(&result)?;
                fs::write(&path, json)
                    .with_context(|| format!("Failed to write summary {}", path.display()))?;
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("Anonymization has finished.");
    println!("  Indexed studies:     {}", summary.indexed_studies);
    println!("  Registry rows:       {}", summary.registry_rows);
    println!("  Linked rows:         {}", summary.linked_rows);
    for (reason, count) in &summary.skipped_rows {
        println!("  Skipped ({reason}): {count}");
    }
    println!("  Patients:            {}", summary.patients);
    println!("  Screenings written:  {}", summary.screenings_written);
    if summary.degenerate_screenings > 0 {
        println!("  Degenerate:          {}", summary.degenerate_screenings);
    }
    println!("  Files anonymized:    {}", summary.files_anonymized);
    println!("  Files quarantined:   {}", summary.files_quarantined);
    if summary.unreadable_study_entries > 0 {
        println!("  Unreadable entries:  {}", summary.unreadable_study_entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "dicom-screening-anon",
            "run",
            "registry.csv",
            "out.csv",
            "in",
            "out",
            "--links",
            "links.csv",
            "--delimiter",
            ";",
            "--diagnosis-date-column",
            "11",
            "-m",
            "mg,cr",
            "--index-log",
            "index.log",
            "--reuse-index",
            "--date-format",
            "year",
        ])
        .expect("parse");

        let Commands::Run { options, links, .. } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(links, PathBuf::from("links.csv"));
        let config = options.to_config().expect("config");
        assert_eq!(config.registry.delimiter, ';');
        assert_eq!(config.registry.diagnosis_date_column, 11);
        assert_eq!(config.anonymizer.modalities, vec!["mg", "cr"]);
        assert!(config.index.reuse_index);
        assert_eq!(config.date_format, CoarseDateFormat::Year);
    }

    #[test]
    fn reuse_requires_an_index_log() {
        let parsed = Cli::try_parse_from(["dicom-screening-anon", "index", "in", "--reuse-index"]);
        assert!(parsed.is_err());
    }
}
