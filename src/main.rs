use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowcast_core::config::AppConfig;
use flowcast_core::event::EventBus;
use flowcast_core::types::{EngineEvent, GraphSnapshot};

use flowcast_engine::{Engine, RunOptions, SqliteProjectStore};
use flowcast_genai::FfmpegStitcher;

#[derive(Parser)]
#[command(name = "flowcast", version, about = "Run AI generation workflows from the command line")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowcast.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution order of a graph
    Order {
        /// Graph file (JSON snapshot)
        graph: PathBuf,
        /// Only the chain leading to this node
        #[arg(long)]
        node: Option<String>,
    },
    /// Show the upstream context a node would be dispatched with
    Inspect {
        graph: PathBuf,
        node: String,
    },
    /// Run one node, dispatching missing ancestors first
    Run {
        graph: PathBuf,
        #[arg(long)]
        node: String,
        /// Run only this node, even if ancestors have no result
        #[arg(long)]
        no_cascade: bool,
        /// Prompt override for this run
        #[arg(long)]
        prompt: Option<String>,
    },
    /// Run every generation node in dependency order
    RunAll {
        graph: PathBuf,
    },
    /// Write the last persisted snapshot of a project to a graph file
    Restore {
        graph: PathBuf,
        /// Project name (defaults to the graph file stem)
        #[arg(long)]
        project: Option<String>,
    },
    /// Show or top up the credit balance of a project
    Credits {
        project: String,
        #[arg(long)]
        top_up: Option<u64>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("flowcast=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Order { graph, node } => {
            let engine = offline_engine(&config, read_graph(&graph)?)?;
            let targets = node.map(|n| vec![n]);
            for (i, id) in engine.order(targets.as_deref()).iter().enumerate() {
                let node_type = engine
                    .node(id)
                    .map(|n| n.node_type.to_string())
                    .unwrap_or_default();
                println!("{:>3}. {} ({})", i + 1, id, node_type);
            }
        }
        Commands::Inspect { graph, node } => {
            let engine = offline_engine(&config, read_graph(&graph)?)?;
            let ctx = engine.context(&node)?;
            println!("Direct inputs: {}", ctx.direct_inputs);
            for (i, image) in ctx.images.iter().enumerate() {
                println!("Image {}: {}", i + 1, image.id);
            }
            for video in &ctx.videos {
                println!("Video: {} ({})", video.id, truncate(&video.image, 80));
            }
            for text in &ctx.texts {
                println!("Text: {}", truncate(text, 120));
            }
            if let Some(ref analysis) = ctx.analysis {
                println!("Analysis: {}", truncate(&analysis.to_string(), 200));
            }
            if !ctx.frames.is_empty() {
                println!("Frames: {}", ctx.frames.len());
            }
            let prompt = engine.node(&node).and_then(|n| n.data.prompt);
            println!("\nPrompt:\n{}", ctx.compose_prompt(prompt.as_deref()));
        }
        Commands::Run {
            graph,
            node,
            no_cascade,
            prompt,
        } => {
            let options = RunOptions {
                cascade: !no_cascade,
                custom_prompt: prompt,
            };
            let session = Session::open(&config, &graph)?;
            let outcome = session.engine.run(&node, options).await;
            session.finish(outcome).await?;
        }
        Commands::RunAll { graph } => {
            let session = Session::open(&config, &graph)?;
            let outcome = session.engine.run_all().await;
            if let Ok(count) = outcome {
                info!(nodes = count, "Graph run finished");
            }
            session.finish(outcome.map(|_| ())).await?;
        }
        Commands::Restore { graph, project } => {
            let project = project.unwrap_or_else(|| project_name(&graph));
            let store = SqliteProjectStore::open(&config.store_path(), &project)?;
            match store.load_latest()? {
                Some(stored) => {
                    write_graph(&graph, &stored.snapshot)?;
                    println!(
                        "Restored {} node(s) saved at {} to {}",
                        stored.snapshot.nodes.len(),
                        stored.saved_at.format("%Y-%m-%d %H:%M:%S"),
                        graph.display()
                    );
                }
                None => println!("No snapshot stored for project '{}'.", project),
            }
        }
        Commands::Credits { project, top_up } => {
            let store = SqliteProjectStore::open(&config.store_path(), &project)?;
            let mut balance = store
                .load_credits()?
                .unwrap_or(config.credits.initial_balance);
            if let Some(amount) = top_up {
                balance = balance.saturating_add(amount);
                store.save_credits(balance)?;
            }
            println!("{}: {} credit(s)", project, balance);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".flowcast").join("config.toml"));
    match home_config {
        Some(ref path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(path)?)
        }
        _ => {
            warn!("No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

/// Engine for read-only commands. No collaborator is ever called.
fn offline_engine(config: &AppConfig, graph: GraphSnapshot) -> anyhow::Result<Engine> {
    let client = flowcast_genai::create_client(config)?;
    let stitcher = Arc::new(FfmpegStitcher::new(client.clone(), config.video.ffmpeg.clone()));
    Ok(Engine::new(config, client, stitcher, Arc::new(EventBus::default())).with_graph(graph))
}

/// A persisting engine bound to one graph file. The project name is the file stem.
struct Session {
    engine: Engine,
    graph_path: PathBuf,
    printer: tokio::task::JoinHandle<()>,
}

impl Session {
    fn open(config: &AppConfig, graph_path: &Path) -> anyhow::Result<Self> {
        let graph = read_graph(graph_path)?;
        let project = project_name(graph_path);
        let store = Arc::new(SqliteProjectStore::open(&config.store_path(), &project)?);

        let client = flowcast_genai::create_client(config)?;
        let stitcher = Arc::new(FfmpegStitcher::new(client.clone(), config.video.ffmpeg.clone()));
        let event_bus = Arc::new(EventBus::default());
        let engine = Engine::new(config, client, stitcher, event_bus.clone())
            .with_graph(graph)
            .with_sink(store.clone());
        if let Some(balance) = store.load_credits()? {
            engine.credits().restore(balance);
        }
        info!(project = %project, balance = engine.credits().balance(), "Project opened");

        let mut rx = event_bus.subscribe();
        let printer = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    EngineEvent::NodeStatus { node_id, status } => {
                        eprintln!("[{}] {}", node_id, status);
                    }
                    EngineEvent::NodeCompleted { node_id, elapsed_ms } => {
                        eprintln!("[{}: ok] {:.1}s", node_id, elapsed_ms as f64 / 1000.0);
                    }
                    EngineEvent::NodeFailed { node_id, error } => {
                        eprintln!("[{}: ERROR] {}", node_id, truncate(&error, 200));
                    }
                    EngineEvent::QuotaCooldown {
                        attempt,
                        max_attempts,
                        cooldown_secs,
                    } => {
                        eprintln!(
                            "[quota] attempt {}/{} failed, waiting {}s",
                            attempt, max_attempts, cooldown_secs
                        );
                    }
                    EngineEvent::BatchStarted {
                        batch,
                        batches,
                        size,
                    } => {
                        eprintln!("[fan-out] batch {}/{} ({} formats)", batch, batches, size);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            engine,
            graph_path: graph_path.to_path_buf(),
            printer,
        })
    }

    /// Write the graph back, flush persistence, and surface the run outcome.
    async fn finish(self, outcome: flowcast_core::error::Result<()>) -> anyhow::Result<()> {
        write_graph(&self.graph_path, &self.engine.snapshot())?;
        self.engine.shutdown().await;
        println!("Credits remaining: {}", self.engine.credits().balance());
        self.printer.abort();
        outcome.map_err(Into::into)
    }
}

fn read_graph(path: &Path) -> anyhow::Result<GraphSnapshot> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read graph {}: {}", path.display(), e))?;
    Ok(serde_json::from_str(&content)?)
}

fn write_graph(path: &Path, snapshot: &GraphSnapshot) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(&snapshot.stripped())?;
    std::fs::write(path, json)?;
    Ok(())
}

fn project_name(graph_path: &Path) -> String {
    graph_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
