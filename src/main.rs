use anyhow::{Result, anyhow};
use clap::Parser;

use sheetdex::cli::commands::{files, init, search};
use sheetdex::cli::{Cli, Commands};
use sheetdex::{IngestService, Settings, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .map_err(|e| anyhow!("Configuration error: {e}"))?;
    logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&settings),
        command => {
            let service = IngestService::open(settings)?;
            match command {
                Commands::Ingest { files: paths, json } => {
                    files::run_ingest(&service, &paths, json).await
                }
                Commands::Files { json } => files::run_files(&service, json),
                Commands::Status { id, json } => files::run_status(&service, id, json),
                Commands::Verify { id } => files::run_verify(&service, id).await,
                Commands::Delete { id } => files::run_delete(&service, id).await,
                Commands::Search {
                    query,
                    mode,
                    file,
                    sheet,
                    offset,
                    limit,
                    json,
                } => {
                    let args = search::SearchArgs {
                        query,
                        mode,
                        file,
                        sheet,
                        offset,
                        limit,
                        json,
                    };
                    search::run_search(&service, args).await
                }
                Commands::Init { .. } | Commands::Config => Ok(()),
            }
        }
    }
}
