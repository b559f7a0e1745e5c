use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod atomic;
mod checkpoint;
mod cluster;
mod config;
mod db;
mod error;
mod extractor;
mod gateway;
mod gazetteer;
mod geo;
mod geocoder;
mod ingest;
mod models;
mod orchestrator;
mod report;
mod resolver;
mod retry;
mod store;

use checkpoint::ProcessingCheckpoint;
use config::{PipelineConfig, StoreWriteMode};
use extractor::{ChatExtractor, ExtractionStage};
use gateway::{ApiGateway, CallBudget, CallKind};
use gazetteer::Gazetteer;
use geocoder::{Geocoder, NominatimGeocoder};
use models::Incident;
use orchestrator::{BatchOrchestrator, CancelFlag};
use resolver::LocationResolver;
use store::{IncidentStore, MemoryIncidentStore};

#[derive(Parser)]
#[command(name = "disaster-incident-pipeline")]
#[command(about = "Turns classified disaster posts into deduplicated, geolocated incidents", long_about = None)]
struct Cli {
    /// Postgres connection string for the incident store
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gate, geolocate, and cluster new reports, then persist the incidents
    Run(RunArgs),
    /// Create or upgrade the database schema
    InitDb,
    /// Import known places into the gazetteer from a CSV file
    SeedGazetteer {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, env = "GAZETTEER_PATH")]
        gazetteer: Option<PathBuf>,
    },
    /// Geocode unknown location hints ahead of a run, most frequent first
    EnrichGazetteer {
        #[arg(long, env = "INPUT_PATH")]
        input: Option<PathBuf>,
        #[command(flatten)]
        resolver: ResolverArgs,
    },
    /// Inspect or edit stored incidents
    Incident {
        #[command(subcommand)]
        action: IncidentCommand,
    },
}

#[derive(Subcommand)]
enum IncidentCommand {
    /// Show one incident as JSON
    Get { id: String },
    /// List incidents within a radius of a point
    Near {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long, default_value_t = 50.0)]
        radius_km: f64,
    },
    /// List incidents of one type
    ByType { incident_type: String },
    /// Remove an incident
    Delete { id: String },
}

#[derive(Args)]
struct ResolverArgs {
    /// Gazetteer cache file
    #[arg(long, env = "GAZETTEER_PATH")]
    gazetteer: Option<PathBuf>,
    /// Nominatim-compatible geocoder base URL
    #[arg(long, env = "GEOCODER_URL")]
    geocoder_url: Option<String>,
    /// Comma separated geocoder keys, tried in order
    #[arg(long, env = "GEOCODER_TOKENS", hide_env_values = true)]
    geocoder_tokens: Option<String>,
    /// Never call the geocoder
    #[arg(long)]
    offline: bool,
    #[arg(long, env = "CALL_TIMEOUT_SECS")]
    call_timeout_secs: Option<u64>,
    /// Cap on external calls for the whole run
    #[arg(long, env = "MAX_EXTERNAL_CALLS")]
    max_external_calls: Option<usize>,
}

#[derive(Args)]
struct RunArgs {
    /// JSON lines of classified reports
    #[arg(long, env = "INPUT_PATH")]
    input: Option<PathBuf>,
    /// Incident artifact written after every run
    #[arg(long, env = "OUTPUT_PATH")]
    output: Option<PathBuf>,
    #[arg(long, env = "CHECKPOINT_PATH")]
    checkpoint: Option<PathBuf>,
    /// Also write a markdown summary of the run
    #[arg(long)]
    summary_out: Option<PathBuf>,
    #[command(flatten)]
    resolver: ResolverArgs,
    /// Comma separated extraction tokens, tried in order
    #[arg(long, env = "HF_TOKENS", hide_env_values = true)]
    tokens: Option<String>,
    #[arg(long, env = "EXTRACTION_URL")]
    extraction_url: Option<String>,
    #[arg(long, env = "EXTRACTION_MODEL")]
    extraction_model: Option<String>,
    /// Skip generative extraction for reports that lack it
    #[arg(long)]
    no_extraction: bool,
    #[arg(long, env = "CLUSTER_THRESHOLD_KM")]
    threshold_km: Option<f64>,
    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,
    #[arg(long, env = "BATCH_DELAY_SECS")]
    batch_delay_secs: Option<u64>,
    /// upsert or replace
    #[arg(long, env = "STORE_WRITE_MODE")]
    store_write_mode: Option<StoreWriteMode>,
}

impl ResolverArgs {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(path) = self.gazetteer {
            config.gazetteer = path;
        }
        if self.offline {
            config.geocoder_url = None;
        } else if let Some(url) = self.geocoder_url {
            config.geocoder_url = Some(url);
        }
        if let Some(tokens) = self.geocoder_tokens {
            config.geocoder_tokens = config::parse_tokens(&tokens);
        }
        if let Some(secs) = self.call_timeout_secs {
            config.call_timeout = Duration::from_secs(secs);
        }
        config.max_external_calls = self.max_external_calls.or(config.max_external_calls);
    }
}

impl RunArgs {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        self.resolver.apply(&mut config);

        if let Some(path) = self.input {
            config.input = path;
        }
        if let Some(path) = self.output {
            config.output = path;
        }
        if let Some(path) = self.checkpoint {
            config.checkpoint = path;
        }
        config.summary_out = self.summary_out;
        if let Some(tokens) = self.tokens {
            config.extraction_tokens = config::parse_tokens(&tokens);
        }
        if self.no_extraction {
            config.extraction_url = None;
        } else if let Some(url) = self.extraction_url {
            config.extraction_url = Some(url);
        }
        if let Some(model) = self.extraction_model {
            config.extraction_model = model;
        }
        if let Some(km) = self.threshold_km {
            config.distance_threshold_km = km;
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(secs) = self.batch_delay_secs {
            config.batch_delay = Duration::from_secs(secs);
        }
        if let Some(mode) = self.store_write_mode {
            config.store_write_mode = mode;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("disaster_incident_pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = args.into_config();
            config.validate()?;

            let loaded = ingest::load_reports(&config.input)?;
            let checkpoint = ProcessingCheckpoint::load(&config.checkpoint)?;
            let budget = CallBudget::new(config.max_external_calls);
            let resolver = build_resolver(&config, budget.clone())?;
            let extraction = build_extraction(&config, budget.clone())?;
            let store = connect_store(cli.database_url.as_deref()).await?;

            let cancel = CancelFlag::new();
            cancel.install_ctrl_c();

            let summary_out = config.summary_out.clone();
            let output = config.output.clone();
            let mut orchestrator =
                BatchOrchestrator::new(config, resolver, extraction, store, checkpoint)
                    .with_cancel(cancel);
            let outcome = orchestrator.run(loaded).await?;
            let metadata = &outcome.artifact.metadata;

            if let Some(path) = summary_out {
                let summary = report::build_summary(metadata, &outcome.artifact.incidents);
                std::fs::write(&path, summary)
                    .with_context(|| format!("failed to write summary {}", path.display()))?;
                println!("Summary written to {}.", path.display());
            }
            println!(
                "Run {} {:?}: {} incidents from {} confirmed reports ({} failed). Artifact at {}.",
                metadata.run_id,
                metadata.status,
                metadata.incidents_created,
                metadata.confirmed_reports,
                metadata.failed,
                output.display()
            );
            info!(external_calls = budget.used(), "External call budget spent");
            let checkpoint = orchestrator.checkpoint();
            if let Some(at) = checkpoint.last_run_at() {
                println!(
                    "Checkpoint holds {} report ids as of {}.",
                    checkpoint.len(),
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
        Commands::InitDb => {
            let pool = connect_pool(require_database(cli.database_url.as_deref())?).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::SeedGazetteer { csv, gazetteer } => {
            let path = gazetteer.unwrap_or_else(|| PipelineConfig::default().gazetteer);
            let mut gazetteer = Gazetteer::load(&path)?;
            let imported = gazetteer.import_csv(&csv)?;
            println!(
                "Imported {imported} places from {} ({} entries in {}).",
                csv.display(),
                gazetteer.len(),
                path.display()
            );
        }
        Commands::EnrichGazetteer {
            input,
            resolver: resolver_args,
        } => {
            let mut config = PipelineConfig::default();
            resolver_args.apply(&mut config);
            if let Some(path) = input {
                config.input = path;
            }

            let loaded = ingest::load_reports(&config.input)?;
            let budget = CallBudget::new(config.max_external_calls);
            let mut resolver = build_resolver(&config, budget)?;
            let summary = resolver::enrich_gazetteer(&mut resolver, &loaded.reports).await;

            println!(
                "Added {} of {} unknown places to {} ({} geocoder calls).",
                summary.added,
                summary.candidates,
                config.gazetteer.display(),
                resolver.geocoder_calls()
            );
            for hint in summary.failed.iter().take(20) {
                println!("- unresolved: {hint}");
            }
        }
        Commands::Incident { action } => {
            let pool = connect_pool(require_database(cli.database_url.as_deref())?).await?;
            let store = db::PgIncidentStore::new(pool);
            run_incident_command(&store, action).await?;
        }
    }

    Ok(())
}

async fn run_incident_command(store: &dyn IncidentStore, action: IncidentCommand) -> anyhow::Result<()> {
    match action {
        IncidentCommand::Get { id } => match store.get(&id).await? {
            Some(incident) => println!("{}", serde_json::to_string_pretty(&incident)?),
            None => println!("No incident with id {id}."),
        },
        IncidentCommand::Near { lat, lng, radius_km } => {
            let incidents = store.query_near(lat, lng, radius_km).await?;
            print_incidents(&incidents, &format!("within {radius_km} km of ({lat}, {lng})"));
        }
        IncidentCommand::ByType { incident_type } => {
            let incidents = store.query_by_type(&incident_type).await?;
            print_incidents(&incidents, &format!("of type {incident_type}"));
        }
        IncidentCommand::Delete { id } => {
            if store.delete(&id).await? {
                println!("Deleted incident {id}.");
            } else {
                println!("No incident with id {id}.");
            }
        }
    }
    Ok(())
}

fn print_incidents(incidents: &[Incident], scope: &str) {
    if incidents.is_empty() {
        println!("No incidents {scope}.");
        return;
    }
    println!("{} incidents {scope}:", incidents.len());
    for incident in incidents {
        println!(
            "- {} [{}] {} at {} ({:.4}, {:.4}), {} reports",
            incident.id,
            incident.severity,
            incident.title,
            incident.location,
            incident.centroid.lat,
            incident.centroid.lng,
            incident.member_report_ids.len()
        );
    }
}

fn build_resolver(config: &PipelineConfig, budget: Arc<CallBudget>) -> anyhow::Result<LocationResolver> {
    let gazetteer = Gazetteer::load(&config.gazetteer)?;
    let geocoder = match &config.geocoder_url {
        Some(url) => {
            Some(Box::new(NominatimGeocoder::new(url, config.call_timeout)?) as Box<dyn Geocoder>)
        }
        None => {
            info!("Geocoder disabled, unknown places resolve only from the gazetteer");
            None
        }
    };
    let gateway = ApiGateway::new(
        CallKind::Geocoding,
        config.geocoder_tokens.clone(),
        config.call_retry.clone(),
        budget,
    );
    Ok(LocationResolver::new(gazetteer, geocoder, gateway))
}

fn build_extraction(
    config: &PipelineConfig,
    budget: Arc<CallBudget>,
) -> anyhow::Result<Option<ExtractionStage>> {
    let Some(url) = &config.extraction_url else {
        return Ok(None);
    };
    if config.extraction_tokens.is_empty() {
        warn!("No extraction tokens configured, reports without extraction stay pending");
        return Ok(None);
    }

    let extractor = ChatExtractor::new(url, &config.extraction_model, config.call_timeout)?;
    let gateway = ApiGateway::new(
        CallKind::Extraction,
        config.extraction_tokens.clone(),
        config.call_retry.clone(),
        budget,
    );
    Ok(Some(ExtractionStage::new(Box::new(extractor), gateway)))
}

fn require_database(database_url: Option<&str>) -> anyhow::Result<&str> {
    database_url.context("DATABASE_URL must be set to a production Postgres instance")
}

async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn connect_store(database_url: Option<&str>) -> anyhow::Result<Arc<dyn IncidentStore>> {
    match database_url {
        Some(url) => Ok(Arc::new(db::PgIncidentStore::new(connect_pool(url).await?))),
        None => {
            warn!("DATABASE_URL not set, incidents go to the local artifact only");
            Ok(Arc::new(MemoryIncidentStore::new()))
        }
    }
}
