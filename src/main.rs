use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentflow_client::HttpWorkflowApi;
use agentflow_core::config::AppConfig;
use agentflow_core::event::{EventBus, FlowEvent};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::{Execution, RunStatus, Workflow};
use agentflow_editor::{AgentCatalog, EditorSession, ExecutionTracker, NodeDraft, PollEnd, RunSnapshot};

#[derive(Parser)]
#[command(name = "agentflow", version, about = "Build and run AI agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agentflow.toml")]
    config: PathBuf,

    /// Workflow API base URL (overrides config)
    #[arg(long, env = "AGENTFLOW_BASE_URL")]
    base_url: Option<String>,

    /// User id owning workflows and executions (overrides config)
    #[arg(short, long, env = "AGENTFLOW_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available agent types by category
    Agents,
    /// Manage workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Edit the nodes of a workflow
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Edit the edges of a workflow
    Edge {
        #[command(subcommand)]
        action: EdgeAction,
    },
    /// Execute a workflow and follow its progress
    Run {
        /// Workflow id
        workflow: String,
        /// Input payload as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Print the execution id and exit without polling
        #[arg(long)]
        detach: bool,
    },
    /// Show the current state of an execution
    Status {
        /// Execution id
        execution: String,
    },
    /// Ask the engine to stop an execution
    Abort {
        /// Execution id
        execution: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List your workflows
    List,
    /// Create an empty workflow
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Print a workflow's nodes and edges
    Show { workflow: String },
    /// Rename a workflow
    Rename { workflow: String, name: String },
    /// Delete a workflow with its nodes, edges and executions
    Delete {
        workflow: String,
        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Add a node of the given agent type
    Add {
        workflow: String,
        agent_type: String,
        #[arg(long, default_value = "0")]
        x: f64,
        #[arg(long, default_value = "0")]
        y: f64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Node configuration as JSON
        #[arg(long)]
        config: Option<String>,
    },
    /// Move a node on the canvas
    Move {
        workflow: String,
        node: String,
        x: f64,
        y: f64,
    },
    /// Replace a node's configuration
    Config {
        workflow: String,
        node: String,
        /// Configuration as JSON
        config: String,
    },
    /// Delete a node and its edges
    Rm { workflow: String, node: String },
}

#[derive(Subcommand)]
enum EdgeAction {
    /// Connect two nodes
    Add {
        workflow: String,
        source: String,
        target: String,
        /// Edge type: default, success or failure
        #[arg(long = "type")]
        edge_type: Option<String>,
    },
    /// Delete an edge
    Rm { workflow: String, edge: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "agentflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_config(&cli.config)?;
    if let Some(base_url) = cli.base_url {
        config.api.base_url = base_url;
    }
    if let Some(user) = cli.user {
        config.user.id = user;
    }

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Set up components
    let api: Arc<dyn WorkflowApi> = Arc::new(HttpWorkflowApi::new(&config.api)?);
    let event_bus = Arc::new(EventBus::default());
    let catalog = Arc::new(AgentCatalog::new(api.clone()));
    let tracker = Arc::new(ExecutionTracker::new(
        api.clone(),
        event_bus.clone(),
        &config.execution,
    ));
    let session = EditorSession::new(
        api,
        catalog.clone(),
        tracker.clone(),
        event_bus.clone(),
        config.editor.clone(),
        config.user.id.clone(),
    );

    match cli.command {
        Commands::Agents => {
            catalog.load().await?;
            for (category, agents) in catalog.by_category().await {
                println!("{}:", category);
                for (agent_type, descriptor) in agents {
                    println!("  {:<24} {}", agent_type, descriptor.description);
                    if !descriptor.inputs.is_empty() {
                        println!("  {:<24} inputs: {}", "", descriptor.inputs.join(", "));
                    }
                }
            }
        }
        Commands::Workflow { action } => handle_workflow(&session, action).await?,
        Commands::Node { action } => handle_node(&session, action).await?,
        Commands::Edge { action } => handle_edge(&session, action).await?,
        Commands::Run {
            workflow,
            input,
            detach,
        } => {
            let input: serde_json::Value = serde_json::from_str(&input)?;
            let graph = session.open(&workflow).await?;
            let names: HashMap<String, String> = graph
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.name.clone()))
                .collect();

            let execution_id = session.on_run(input).await?;
            println!("Execution {} started", execution_id);
            if detach {
                return Ok(());
            }

            let outcome = follow(&tracker, &event_bus, &execution_id, &names).await;
            tracker.shutdown().await;
            finish(outcome?)?;
        }
        Commands::Status { execution } => {
            tracker.attach(&execution).await;
            tracker.poll(&execution).await?;
            if let Some(RunSnapshot {
                execution: Some(record),
                ..
            }) = tracker.snapshot(&execution).await
            {
                print_execution(&record);
            }
        }
        Commands::Abort { execution } => {
            tracker.abort(&execution).await?;
            println!("Abort requested for {}", execution);
        }
        Commands::Config | Commands::Completions { .. } => unreachable!("handled before setup"),
    }

    Ok(())
}

/// `agentflow.toml`, then `~/.agentflow/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = AppConfig::default_path() {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    info!("No config file found, using defaults");
    Ok(AppConfig::default())
}

async fn handle_workflow(session: &EditorSession, action: WorkflowAction) -> anyhow::Result<()> {
    match action {
        WorkflowAction::List => {
            let workflows = session.list_workflows().await?;
            if workflows.is_empty() {
                println!("No workflows for user {}.", session.user_id());
            }
            for wf in workflows {
                print_workflow_line(&wf);
            }
        }
        WorkflowAction::Create { name, description } => {
            let wf = session.create_workflow(&name, description.as_deref()).await?;
            println!("Created workflow {} ({})", wf.name, wf.id);
        }
        WorkflowAction::Show { workflow } => {
            let graph = session.open(&workflow).await?;
            if let Some(wf) = session.workflow().await {
                print_workflow_line(&wf);
                if let Some(desc) = &wf.description {
                    println!("  {}", desc);
                }
            }
            println!("Nodes ({}):", graph.nodes.len());
            for node in &graph.nodes {
                println!(
                    "  {:<38} {:<22} {:<24} ({:.0}, {:.0})",
                    node.id, node.agent_type, node.name, node.position_x, node.position_y
                );
            }
            println!("Edges ({}):", graph.edges.len());
            for edge in &graph.edges {
                println!(
                    "  {:<38} {} -> {} [{}]",
                    edge.id, edge.source_id, edge.target_id, edge.edge_type
                );
            }
        }
        WorkflowAction::Rename { workflow, name } => {
            let wf = session.rename_workflow(&workflow, &name).await?;
            println!("Renamed workflow {} to {}", wf.id, wf.name);
        }
        WorkflowAction::Delete { workflow, yes } => {
            if !yes {
                let prompt = format!("Delete workflow {} with all its nodes and executions?", workflow);
                let confirmed = tokio::task::spawn_blocking(move || {
                    dialoguer::Confirm::new()
                        .with_prompt(prompt)
                        .default(false)
                        .interact()
                        .unwrap_or(false)
                })
                .await?;
                if !confirmed {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            session.delete_workflow(&workflow).await?;
            println!("Deleted workflow {}", workflow);
        }
    }
    Ok(())
}

async fn handle_node(session: &EditorSession, action: NodeAction) -> anyhow::Result<()> {
    match action {
        NodeAction::Add {
            workflow,
            agent_type,
            x,
            y,
            name,
            description,
            config,
        } => {
            session.open(&workflow).await?;
            let mut draft = NodeDraft::new(agent_type, x, y);
            if let Some(name) = name {
                draft = draft.named(name);
            }
            if let Some(description) = description {
                draft = draft.with_description(description);
            }
            if let Some(config) = config {
                draft = draft.with_config(serde_json::from_str(&config)?);
            }
            let node = session.on_add_node(draft).await?;
            println!("Added node {} ({})", node.name, node.id);
        }
        NodeAction::Move { workflow, node, x, y } => {
            session.open(&workflow).await?;
            let saved = session.on_node_drag_end(&node, x, y).await?;
            // The process exits right after; let the position update land.
            saved.await?;
            println!("Moved node {} to ({}, {})", node, x, y);
        }
        NodeAction::Config {
            workflow,
            node,
            config,
        } => {
            session.open(&workflow).await?;
            let config: serde_json::Value = serde_json::from_str(&config)?;
            let updated = session.on_update_node_config(&node, config).await?;
            println!("{}", serde_json::to_string_pretty(&updated.config)?);
        }
        NodeAction::Rm { workflow, node } => {
            session.open(&workflow).await?;
            session.on_delete_node(&node).await?;
            println!("Deleted node {}", node);
        }
    }
    Ok(())
}

async fn handle_edge(session: &EditorSession, action: EdgeAction) -> anyhow::Result<()> {
    match action {
        EdgeAction::Add {
            workflow,
            source,
            target,
            edge_type,
        } => {
            session.open(&workflow).await?;
            let edge = session
                .on_add_edge(&source, &target, edge_type.as_deref())
                .await?;
            println!(
                "Added edge {}: {} -> {} [{}]",
                edge.id, edge.source_id, edge.target_id, edge.edge_type
            );
        }
        EdgeAction::Rm { workflow, edge } => {
            session.open(&workflow).await?;
            session.on_delete_edge(&edge).await?;
            println!("Deleted edge {}", edge);
        }
    }
    Ok(())
}

/// Print step transitions until the run ends or Ctrl-C is pressed.
async fn follow(
    tracker: &ExecutionTracker,
    event_bus: &EventBus,
    execution_id: &str,
    names: &HashMap<String, String>,
) -> anyhow::Result<RunSnapshot> {
    let mut rx = tracker.subscribe(execution_id).await?;
    let mut events = event_bus.subscribe();
    let mut seen: HashMap<String, RunStatus> = HashMap::new();
    let mut last_status: Option<RunStatus> = None;

    loop {
        let snapshot = rx.borrow_and_update().clone();
        if let Some(record) = &snapshot.execution {
            if last_status.as_ref() != Some(&record.status) {
                println!("status: {}", record.status);
                last_status = Some(record.status.clone());
            }
            for step in &record.steps {
                if seen.get(&step.id) != Some(&step.status) {
                    let name = names.get(&step.node_id).unwrap_or(&step.node_id);
                    println!("  [{}] {}", step.status, name);
                    seen.insert(step.id.clone(), step.status.clone());
                }
            }
        }
        if snapshot.ended.is_some() {
            return Ok(snapshot);
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(rx.borrow().clone());
                }
            }
            Ok(event) = events.recv() => {
                if let FlowEvent::PollFailed { attempt, error, .. } = event {
                    eprintln!("  (poll attempt {} failed: {})", attempt, error);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %execution_id, "Interrupted; the execution keeps running remotely");
                eprintln!("\nStopped following {}. Check it later with `agentflow status {}`.", execution_id, execution_id);
                tracker.cancel(execution_id).await?;
                return Ok(rx.borrow().clone());
            }
        }
    }
}

fn finish(snapshot: RunSnapshot) -> anyhow::Result<()> {
    match (snapshot.ended, snapshot.execution) {
        (Some(PollEnd::Terminal), Some(record)) => {
            if record.status == RunStatus::Completed {
                println!("{}", serde_json::to_string_pretty(&record.output_data)?);
                Ok(())
            } else {
                anyhow::bail!(
                    "Execution {} ended with status {}: {}",
                    record.id,
                    record.status,
                    record.error_message.as_deref().unwrap_or("no error message")
                )
            }
        }
        (Some(PollEnd::GaveUp { failures }), _) => {
            anyhow::bail!("Gave up polling after {} consecutive failures", failures)
        }
        _ => Ok(()),
    }
}

fn print_workflow_line(wf: &Workflow) {
    let updated = wf
        .updated_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{:<38} {:<30} {}", wf.id, wf.name, updated);
}

fn print_execution(record: &Execution) {
    println!("Execution {} ({})", record.id, record.workflow_id);
    println!("  status: {}", record.status);
    if let Some(started) = record.started_at {
        println!("  started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = record.completed_at {
        println!("  completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &record.error_message {
        println!("  error: {}", err);
    }
    for step in &record.steps {
        match &step.error_message {
            Some(err) => println!("  [{}] {}: {}", step.status, step.node_id, err),
            None => println!("  [{}] {}", step.status, step.node_id),
        }
    }
}
