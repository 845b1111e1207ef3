use anyhow::Context;
use clap::{Parser, Subcommand};
use gnv_dashboard::config::AppConfig;
use gnv_dashboard::processing::NameTable;
use gnv_dashboard::render::Dashboard;
use gnv_dashboard::{data, server};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the map, bar, scatter and table data to the output directory
    Generate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Serve the dashboard
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print agent counts per department and the departments that did not join
    Check {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
}

fn build_dashboard(app_config: &AppConfig) -> anyhow::Result<Dashboard> {
    let names = NameTable::from_config(&app_config.normalization)
        .context("Invalid department name aliases")?;
    let (agents, polygons) = data::load_all(&app_config.input)?;
    Ok(Dashboard::build(&agents, &polygons, &names))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Generate { config } => {
            info!("Generating dashboard data with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let dashboard = build_dashboard(&app_config)?;
            dashboard.write_to(&app_config.output.dir)?;
            info!("Generation complete!");
        }
        Commands::Serve { config } => {
            info!("Serving dashboard with config: {:?}", config);
            let app_config = AppConfig::load_from_file(config)?;
            let dashboard = build_dashboard(&app_config)?;
            server::start_server(app_config, dashboard).await?;
        }
        Commands::Check { config } => {
            let app_config = AppConfig::load_from_file(config)?;
            let dashboard = build_dashboard(&app_config)?;

            for department in &dashboard.departments {
                println!("{:<32} {:>6}", department.canonical, department.count);
            }
            if !dashboard.unmatched.is_empty() {
                println!("\nAgents in departments missing from the polygon file:");
                for orphan in &dashboard.unmatched {
                    println!("{:<32} {:>6}", orphan.department, orphan.count);
                }
            }
        }
    }

    Ok(())
}
