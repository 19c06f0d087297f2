use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mnema::config::MnemaConfig;
use mnema::event::{Event, EventType};
use mnema::graph::GraphStore;
use mnema::mirror::MirrorClient;
use mnema::oracle::{HttpOracle, Oracle};
use mnema::pipeline::perception::NoopRecognizer;
use mnema::pipeline::Pipeline;
use mnema::query::QueryService;
use mnema::trace::TraceLogger;

#[derive(Parser)]
#[command(name = "mnema", version, about = "Personal memory engine: events in, answers out")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion pipeline until interrupted
    Run,
    /// Inject a single event and wait for it to reach the graph
    Ingest {
        /// Event content (text, or a file path for audio/screenshot)
        content: String,
        /// Event type: text, email, calendar, audio, screenshot, web
        #[arg(long = "type", default_value = "text")]
        event_type: EventType,
        /// Provenance tag
        #[arg(long, default_value = "Manual")]
        source: String,
    },
    /// Ask a question against the knowledge graph
    Query {
        /// Free-form question
        text: String,
    },
    /// Print graph statistics
    Inspect,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MnemaConfig::load()?;

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run => run(config).await,
        Command::Ingest {
            content,
            event_type,
            source,
        } => ingest(config, Event::new(event_type, content, source)).await,
        Command::Query { text } => {
            let graph = Arc::new(RwLock::new(GraphStore::open(config.resolved_graph_path())));
            let oracle: Arc<dyn Oracle> = Arc::new(HttpOracle::new(&config.oracle));
            let service = QueryService::new(graph, oracle, config.query.clone());
            let answer = service.query(&text).await;
            println!("{answer}");
            Ok(())
        }
        Command::Inspect => {
            let graph = GraphStore::open(config.resolved_graph_path());
            let stats = graph.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

/// Composition root: every component is constructed here and injected.
fn build_pipeline(config: &MnemaConfig) -> (Pipeline, Arc<RwLock<GraphStore>>) {
    let graph = Arc::new(RwLock::new(GraphStore::open(config.resolved_graph_path())));
    let oracle: Arc<dyn Oracle> = Arc::new(HttpOracle::new(&config.oracle));
    let trace = Arc::new(TraceLogger::new(config.resolved_trace_path()));
    let mirror = MirrorClient::from_config(&config.mirror).map(Arc::new);

    let pipeline = Pipeline::new(
        config,
        graph.clone(),
        oracle,
        Arc::new(NoopRecognizer),
        trace,
        mirror,
    );
    (pipeline, graph)
}

async fn run(config: MnemaConfig) -> Result<()> {
    let (mut pipeline, _graph) = build_pipeline(&config);
    pipeline.start();
    tracing::info!("pipeline running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    pipeline.stop().await;
    Ok(())
}

async fn ingest(config: MnemaConfig, event: Event) -> Result<()> {
    let (mut pipeline, graph) = build_pipeline(&config);
    let event_id = event.id.clone();
    pipeline.start();
    pipeline.ingest_sender().send(event).await?;

    // Wait for the event to surface in the graph, bounded by the worst
    // case of several Oracle round-trips.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(180);
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let linked = graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&event_id);
        if linked {
            println!("linked event {event_id}");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            println!("event {event_id} not linked within deadline (dropped as noise, or the oracle is slow)");
            break;
        }
    }

    pipeline.stop().await;
    Ok(())
}
