use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use phasewatch::config::ReportConfig;
use phasewatch::detect::{CategoryOutcome, RunOutcome};
use phasewatch::model::Category;

#[derive(Parser)]
#[command(
    name = "phasewatch",
    about = "Traffic signal performance anomaly detection and alerting",
    version,
    long_about = None
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one day of signal data and report new alerts
    Run {
        /// Directory holding the input CSV tables
        #[arg(long)]
        data_dir: PathBuf,

        /// Evaluation date (YYYY-MM-DD); defaults to the latest day in the data
        #[arg(long)]
        date: Option<NaiveDate>,

        /// State database carrying alert history between runs
        #[arg(long, default_value = "phasewatch.db")]
        db: PathBuf,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// List stored past alerts
    History {
        /// State database
        #[arg(long, default_value = "phasewatch.db")]
        db: PathBuf,

        /// Only this category (max_out, actuations, missing_data, pedestrian, system_outage, phase_skip)
        #[arg(long)]
        category: Option<Category>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(config: &ReportConfig, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            date,
            db,
            config,
            json,
        } => {
            let config = ReportConfig::load_or_default(config.as_deref())?;
            init_tracing(&config, cli.log_json);
            tracing::info!(data_dir = %data_dir.display(), ?date, "Running report");

            let outcome = phasewatch::run_report(&data_dir, date, &db, config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_summary(&outcome);
            }
        }
        Commands::History { db, category, json } => {
            let config = ReportConfig::load_or_default(None)?;
            init_tracing(&config, cli.log_json);

            let pool = phasewatch::storage::open_pool(&db)?;
            let rows = phasewatch::storage::list_history(&pool, category)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No past alerts stored.");
            } else {
                println!("{:<14} | {:<32} | Last Alert", "Category", "Key");
                println!("{:-<14}-|-{:-<32}-|-{:-<10}", "", "", "");
                for row in rows {
                    println!(
                        "{:<14} | {:<32} | {}",
                        row.category,
                        row.key.to_string(),
                        row.last_alert_date
                    );
                }
            }
        }
        Commands::Config { config } => {
            let config = ReportConfig::load_or_default(config.as_deref())?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    println!("\n=== phasewatch report for {} ===", outcome.evaluation_date);
    println!("Run: {}", outcome.run_id);
    println!();
    println!("{:<14} | {:<9} | {:<10} | Status", "Category", "Reported", "Suppressed");
    println!("{:-<14}-|-{:-<9}-|-{:-<10}-|-{:-<20}", "", "", "", "");
    for (category, result) in &outcome.categories {
        match result {
            CategoryOutcome::Completed { alerts, suppressed, .. } => {
                println!("{:<14} | {:<9} | {:<10} | ok", category, alerts.len(), suppressed);
            }
            CategoryOutcome::Failed { error } => {
                println!("{:<14} | {:<9} | {:<10} | FAILED: {}", category, "-", "-", error);
            }
        }
    }
    if outcome.malformed_events > 0 {
        println!("\n{} phase-skip events could not be paired.", outcome.malformed_events);
    }

    for region in outcome.regions() {
        println!("\n--- {} ---", region);
        for alert in outcome.alerts_for_region(region) {
            println!(
                " - [{}] {} ({}) on {}: {:.3}",
                alert.category,
                alert.signal_name.as_deref().unwrap_or("-"),
                alert.key,
                alert.day,
                alert.value
            );
        }
    }

    if outcome.total_alerts() == 0 {
        println!("\nNo new alerts.");
    }
    println!();
}
