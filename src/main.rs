//
// main.rs
// Dicom-Screening-Anon
//
// Binary entry point that hands off execution to the CLI layer.
//
// Thales Matheus Mendonça Santos - November 2025

use dicom_screening_anon::cli;

fn main() -> anyhow::Result<()> {
    cli::run()
}
