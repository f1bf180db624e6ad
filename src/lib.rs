//
// lib.rs
// Dicom-Screening-Anon
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Pipeline stages first, then the shared plumbing they run on.
pub mod anonymize;
pub mod index;
pub mod links;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;

pub mod cli;
pub mod config;
pub mod dates;
pub mod dicom_access;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::{Error, Result};
