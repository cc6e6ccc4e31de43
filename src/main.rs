use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use graphflow_core::config::FlowConfig;
use graphflow_core::error::FlowError;
use graphflow_core::event::EventBus;
use graphflow_core::types::{Diagnostic, FlowEvent};
use graphflow_engine::{scripted_flow, GraphFlow, TerminationPolicy};

#[derive(Parser)]
#[command(name = "graphflow", version, about = "Run graphs of workers wave by wave")]
struct Cli {
    /// Path to flow file
    #[arg(short, long, default_value = "graphflow.toml", env = "GRAPHFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flow on a task and print turns as they happen
    Run {
        /// The task handed to the start nodes
        #[arg(trailing_var_arg = true, required = true)]
        task: Vec<String>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
        /// Stop after this many messages, on top of the configured policy
        #[arg(long)]
        max_messages: Option<usize>,
    },
    /// Check the flow file and report every problem found
    Validate,
    /// Print nodes, edges and activation groups
    Show {
        /// Print a Mermaid flowchart instead
        #[arg(long)]
        mermaid: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("graphflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "graphflow", &mut std::io::stdout());
        }
        Commands::Validate => validate(&cli.config)?,
        Commands::Show { mermaid } => show(&load(&cli.config)?, mermaid),
        Commands::Run {
            task,
            json,
            max_messages,
        } => run(load(&cli.config)?, task.join(" "), json, max_messages).await?,
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<GraphFlow> {
    let config =
        FlowConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(scripted_flow(&config)?)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let config =
        FlowConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    match scripted_flow(&config) {
        Ok(flow) => {
            println!(
                "{}: ok ({} nodes, {} edges)",
                path.display(),
                flow.graph().len(),
                flow.graph().edges().len()
            );
            Ok(())
        }
        Err(FlowError::Graph(e)) if !e.violations().is_empty() => {
            for violation in e.violations() {
                eprintln!("  - {}", violation);
            }
            anyhow::bail!("{}: {} problem(s) found", path.display(), e.violations().len())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(
    flow: GraphFlow,
    task: String,
    json: bool,
    max_messages: Option<usize>,
) -> anyhow::Result<()> {
    let flow = match max_messages {
        Some(n) => {
            let limit = TerminationPolicy::max_messages(n);
            let policy = match flow.termination() {
                Some(existing) => existing.clone().or(limit),
                None => limit,
            };
            flow.with_termination(policy)
        }
        None => flow,
    };

    // Mirror turns into the log so RUST_LOG=graphflow=debug traces a run
    let bus = Arc::new(EventBus::new(flow.engine().event_capacity));
    let mut tap = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match tap.recv().await {
                Ok(FlowEvent::Turn { wave, message }) => debug!(
                    wave,
                    source = %message.source,
                    chars = message.content.len(),
                    "Turn recorded"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let flow = flow.with_event_bus(bus);

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Cancel the run on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel_clone.cancel();
    });

    let mut events = Box::pin(flow.run_stream(task, cancel));
    while let Some(event) = events.next().await {
        let event = event?;
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            FlowEvent::RunStarted { run_id, task } => {
                println!("run {} :: {}", run_id, task);
            }
            FlowEvent::WaveStarted { wave, nodes } => {
                println!("\n-- wave {} [{}]", wave, nodes.join(", "));
            }
            FlowEvent::Turn { message, .. } => {
                println!("{}: {}", message.source, message.content);
            }
            FlowEvent::Diagnostic(diagnostic) => {
                eprintln!("warning: {}", describe(&diagnostic));
            }
            FlowEvent::Finished(result) => {
                println!(
                    "\nstopped: {} ({} waves, {} messages, {} tokens, {:.2?})",
                    result.stop_reason,
                    result.waves,
                    result.messages.len(),
                    result.usage.total(),
                    result.duration
                );
            }
        }
    }
    Ok(())
}

fn show(flow: &GraphFlow, mermaid: bool) {
    let graph = flow.graph();
    if mermaid {
        println!("{}", graph.to_mermaid());
        return;
    }

    let shape = graph.shape();
    println!("Nodes:");
    for node in graph.participants() {
        let start = if shape.start_nodes.contains(&node.name) {
            " (start)"
        } else {
            ""
        };
        let description = node.describe();
        if description.is_empty() {
            println!("  {}{}", node.name, start);
        } else {
            println!("  {}{} - {}", node.name, start, description);
        }
    }
    println!("Edges:");
    for edge in &shape.edges {
        println!(
            "  {} -> {} [{}] group={} ({})",
            edge.from, edge.to, edge.condition, edge.group, edge.activation
        );
    }
    if let Some(policy) = flow.termination() {
        println!("Termination: {:?}", policy);
    }
}

fn describe(diagnostic: &Diagnostic) -> String {
    match diagnostic {
        Diagnostic::ConditionFailed {
            wave,
            source,
            target,
            message,
        } => format!(
            "wave {}: condition on {} -> {} failed: {}",
            wave, source, target, message
        ),
        Diagnostic::NodeSkipped { wave, node, error } => {
            format!("wave {}: skipped {}: {}", wave, node, error)
        }
        Diagnostic::RepeatSuppressed { wave, node } => {
            format!("wave {}: {} may not speak twice in a row", wave, node)
        }
    }
}
