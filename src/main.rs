use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use measure_map::client::{ApiClient, DrawSession};
use measure_map::config::AppConfig;
use measure_map::geometry::{self, DisplayProjection};
use measure_map::{server, store};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file; PORT, DATABASE_URL and MEASURE_API_URL override it
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the measurement API
    Serve,
    /// Measure drawn shapes from a GeoJSON file and save them through the API
    Submit {
        #[arg(value_name = "GEOJSON")]
        input: PathBuf,
        /// Projection the shapes were drawn in (EPSG:3857 or EPSG:4326)
        #[arg(long, value_parser = parse_projection)]
        projection: Option<DisplayProjection>,
    },
    /// Print every stored measurement, newest first
    List,
    /// Save every stored measurement to a dated JSON file
    Export {
        #[arg(short, long, value_name = "DIR", default_value = ".")]
        out_dir: PathBuf,
    },
    /// Delete the most recently created measurement
    DeleteLatest,
    /// Remove every measurement directly from the store (administrative)
    Clear {
        /// Required to confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

fn parse_projection(s: &str) -> Result<DisplayProjection, String> {
    match s.to_ascii_uppercase().as_str() {
        "EPSG:3857" | "3857" => Ok(DisplayProjection::WebMercator),
        "EPSG:4326" | "4326" => Ok(DisplayProjection::Geographic),
        other => Err(format!("unsupported projection '{other}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let app_config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            let store = store::connect(&app_config.store.url)
                .await
                .with_context(|| format!("Failed to open store {}", app_config.store.url))?;
            server::start_server(app_config, store).await?;
        }
        Commands::Submit { input, projection } => {
            let projection = projection.unwrap_or(app_config.client.display_projection);
            let api = ApiClient::new(&app_config.client.api_base);
            let mut session = DrawSession::new(projection);
            for shape in geometry::load_drawn_shapes(&input)? {
                session.add_shape(shape);
            }
            let outcome = session.save_pending(&api).await;
            println!("{}", session.status());
            for saved in session.saved() {
                println!("  {} {:.2} {}", saved.record.kind, saved.record.value, saved.record.unit);
            }
            if !outcome.succeeded() {
                bail!("{} of {} measurement(s) were not saved", outcome.failed, outcome.submitted);
            }
        }
        Commands::List => {
            let api = ApiClient::new(&app_config.client.api_base);
            let mut session = DrawSession::new(app_config.client.display_projection);
            session.refresh(&api).await?;
            for m in session.records() {
                println!("{}  {:<10} {:>14.2} {}", m.created_at.to_rfc3339(), m.kind.as_str(), m.value, m.unit);
            }
            println!("{}", session.status());
        }
        Commands::Export { out_dir } => {
            let api = ApiClient::new(&app_config.client.api_base);
            let mut session = DrawSession::new(app_config.client.display_projection);
            session.download(&api, &out_dir).await?;
            println!("{}", session.status());
        }
        Commands::DeleteLatest => {
            let api = ApiClient::new(&app_config.client.api_base);
            let mut session = DrawSession::new(app_config.client.display_projection);
            let result = session.delete_latest(&api).await;
            println!("{}", session.status());
            result?;
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear the store without --yes");
            }
            let store = store::connect(&app_config.store.url).await?;
            let removed = store.clear().await?;
            println!("Removed {} measurement(s) from {}", removed, app_config.store.url);
        }
    }

    Ok(())
}
