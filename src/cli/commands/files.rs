//! Ingest, Files, Status, Verify and Delete commands.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use crate::service::IngestService;
use crate::status::{FileStatus, FileStatusView};
use crate::types::FileId;

pub fn parse_file_id(raw: u32) -> Result<FileId> {
    FileId::new(raw).context("file ids start at 1")
}

fn print_view(view: &FileStatusView) {
    print!(
        "{:>5}  {:<10}  {:>9} rows  {}",
        view.id, view.status, view.rows_count, view.filename
    );
    match &view.error {
        Some(error) => println!("  ({error})"),
        None => println!(),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ingest files one after another, waiting for each to finish.
///
/// Returns an error if any file ended `failed`.
pub async fn run_ingest(service: &IngestService, files: &[PathBuf], json: bool) -> Result<()> {
    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let accepted = service
            .submit_path(path)
            .await
            .with_context(|| format!("failed to stage {}", path.display()))?;
        if !json {
            println!("Ingesting {} as file {}...", path.display(), accepted.id);
        }
        results.push(service.wait(accepted.id).await?);
    }

    if json {
        print_json(&results)?;
    } else {
        results.iter().for_each(print_view);
    }

    let failed = results
        .iter()
        .filter(|view| view.status == FileStatus::Failed)
        .count();
    if failed > 0 {
        bail!("{failed} of {} files failed", results.len());
    }
    Ok(())
}

pub fn run_files(service: &IngestService, json: bool) -> Result<()> {
    let files = service.list();
    if json {
        return print_json(&files);
    }
    if files.is_empty() {
        println!("No files ingested yet.");
    }
    files.iter().for_each(print_view);
    Ok(())
}

pub fn run_status(service: &IngestService, id: u32, json: bool) -> Result<()> {
    let id = parse_file_id(id)?;
    let view = service
        .status(id)
        .with_context(|| format!("file {id} not found"))?;
    if json {
        print_json(&view)
    } else {
        print_view(&view);
        Ok(())
    }
}

pub async fn run_verify(service: &IngestService, id: u32) -> Result<()> {
    let report = service.verify(parse_file_id(id)?).await?;
    println!(
        "file {}: {} rows expected, {} documents indexed",
        report.file_id, report.expected, report.indexed
    );
    if !report.is_consistent() {
        bail!("index and file record disagree");
    }
    Ok(())
}

pub async fn run_delete(service: &IngestService, id: u32) -> Result<()> {
    let id = parse_file_id(id)?;
    let removed = service.delete_file(id).await?;
    println!("Deleted file {id} ({removed} documents)");
    Ok(())
}
