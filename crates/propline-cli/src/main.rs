use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use propline_sync::{query_source, RowQuery, RunError, ScrapeConfig, SortBy};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "propline-cli")]
#[command(about = "Player prop line extractor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape against the configured browser, or a saved HTML page.
    Scrape {
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Scrape date (YYYY-MM-DD); defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    Migrate,
    /// Serve the JSON query API.
    Serve,
    /// Run scrapes on PROPLINE_SCRAPE_CRON until interrupted.
    Schedule,
    Dates,
    Categories {
        #[arg(long)]
        date: NaiveDate,
    },
    Rows {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        player: Option<String>,
        #[arg(long, default_value = "player")]
        sort: SortBy,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .try_init();

    let cli = Cli::parse();
    let config = ScrapeConfig::from_env();
    let command = cli.command.unwrap_or(Commands::Scrape {
        fixture: None,
        date: None,
    });

    match run(command, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &ScrapeConfig) -> Result<ExitCode> {
    match command {
        Commands::Scrape { fixture, date } => {
            let report = match propline_sync::run_configured(config, fixture.as_deref(), date).await {
                Ok(report) => report,
                Err(err @ RunError::Lock(_)) if err.is_lock_held() => {
                    eprintln!("another scrape is running: {err}");
                    return Ok(ExitCode::FAILURE);
                }
                Err(err) => return Err(err.into()),
            };
            let summary = report.session.summary;
            println!(
                "scrape complete: run_id={} date={} attempted={} succeeded={} rows={} errors={}",
                report.session.run_id,
                report.session.date,
                summary.attempted,
                summary.succeeded,
                summary.rows_total,
                report.session.errors.len()
            );
            for failure in &report.session.errors {
                println!(
                    "  failed {} after {} attempts: {}",
                    failure.category_label, failure.attempts, failure.error
                );
            }
            if let Some(outcome) = report.persisted {
                println!(
                    "persisted: inserted={} updated={}",
                    outcome.inserted, outcome.updated
                );
            }
            if let Some(message) = &report.persistence_error {
                println!("persistence skipped: {message}");
            }
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Migrate => {
            propline_sync::migrate(config).await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Serve => {
            propline_web::serve(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            propline_sync::run_scheduler(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dates => {
            let dates = query_source(config).await.dates().await?;
            println!("{}", serde_json::to_string_pretty(&dates)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Categories { date } => {
            let categories = query_source(config).await.categories(date).await?;
            println!("{}", serde_json::to_string_pretty(&categories)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rows {
            date,
            category,
            player,
            sort,
            limit,
        } => {
            let query = RowQuery {
                date,
                category,
                player,
                sort,
                limit,
            };
            let rows = query_source(config).await.rows(&query).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
