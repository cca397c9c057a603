use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use sift_client::{
    Client, Config, JwtSigner, Node, NoSigner, ProjectScope, ReqwestTransport, RuntimeEnv,
    StaticNodes, TokenSigner,
};
use sift_core::{CountSource, FileMatch, NodeId, SearchMode};
use sift_reconcile::{calculate_actual_state, deployment_from_json, ErrorDetails, TerminationProgress};

#[derive(Parser, Debug)]
#[command(name = "siftctl", version, about = "Sift search and reconcile CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// JSON file listing search nodes: [{"id":1,"index_base_url":...,"search_base_url":...}]
    #[arg(long = "nodes", global = true, env = "SIFT_NODES")]
    nodes: Option<PathBuf>,

    /// Shared secret file for signing request tokens
    #[arg(long = "secret-file", global = true, env = "SIFT_SECRET_FILE")]
    secret_file: Option<PathBuf>,

    /// Basic-auth username file (read fresh per request)
    #[arg(long = "username-file", global = true, env = "SIFT_USERNAME_FILE")]
    username_file: Option<PathBuf>,

    /// Basic-auth password file (read fresh per request)
    #[arg(long = "password-file", global = true, env = "SIFT_PASSWORD_FILE")]
    password_file: Option<PathBuf>,

    /// Runtime environment; payload logging only happens outside production
    #[arg(long = "env", value_enum, global = true, env = "SIFT_ENV", default_value_t = EnvArg::Production)]
    env: EnvArg,

    /// Per-request timeout in seconds
    #[arg(long = "timeout-secs", global = true, default_value_t = 30)]
    timeout_secs: u64,

    /// Recompute file/match counts from the file list instead of trusting
    /// the backend's counters
    #[arg(long = "derived-counts", global = true, action = ArgAction::SetTrue)]
    derived_counts: bool,

    /// Use traversal-scoped search-equivalent fan-out calls
    #[arg(long = "traversal", global = true, action = ArgAction::SetTrue)]
    traversal: bool,

    /// Log request/response payloads at debug level (non-production only)
    #[arg(long = "debug-payloads", global = true, action = ArgAction::SetTrue)]
    debug_payloads: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum EnvArg {
    Development,
    Test,
    Production,
}

impl From<EnvArg> for RuntimeEnv {
    fn from(v: EnvArg) -> Self {
        match v {
            EnvArg::Development => RuntimeEnv::Development,
            EnvArg::Test => RuntimeEnv::Test,
            EnvArg::Production => RuntimeEnv::Production,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query a single node
    Search {
        query: String,
        /// Node id from the registry file
        #[arg(long = "node")]
        node: NodeId,
        /// Project id to scope the search to (repeatable)
        #[arg(long = "project", required = true)]
        projects: Vec<i64>,
        /// Maximum results
        #[arg(long = "num", default_value_t = 20)]
        num: usize,
        /// Query interpretation: regex or exact
        #[arg(long = "mode", default_value = "regex")]
        mode: String,
    },
    /// Fan a query out across nodes and merge results
    Fanout {
        query: String,
        /// Target spec "node=project,project" (repeatable)
        #[arg(long = "target", required = true, value_parser = parse_target)]
        targets: Vec<(NodeId, Vec<i64>)>,
        #[arg(long = "num", default_value_t = 20)]
        num: usize,
        #[arg(long = "mode", default_value = "regex")]
        mode: String,
    },
    /// Classify workspace actual state from a deployment status JSON file
    State {
        /// Path to the deployment descriptor JSON
        file: PathBuf,
        /// Workspace termination is in flight
        #[arg(long = "terminating", action = ArgAction::SetTrue, conflicts_with = "terminated")]
        terminating: bool,
        /// Workspace termination has completed
        #[arg(long = "terminated", action = ArgAction::SetTrue)]
        terminated: bool,
        /// Most recent error kind, if any
        #[arg(long = "error-type")]
        error_type: Option<String>,
        /// Most recent error message, if any
        #[arg(long = "error-message")]
        error_message: Option<String>,
    },
}

fn parse_target(s: &str) -> Result<(NodeId, Vec<i64>), String> {
    let (node, projects) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid target '{s}' (expect node=project,project)"))?;
    let node: NodeId = node.trim().parse().map_err(|_| format!("invalid node id '{node}'"))?;
    let projects = projects
        .split(',')
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.trim().parse().map_err(|_| format!("invalid project id '{p}'")))
        .collect::<Result<Vec<i64>, String>>()?;
    Ok((node, projects))
}

fn init_tracing() {
    let env = std::env::var("SIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SIFT_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_client(cli: &Cli) -> Result<Client> {
    let nodes_path = cli
        .nodes
        .clone()
        .context("--nodes (or SIFT_NODES) is required for search commands")?;
    let raw = std::fs::read_to_string(&nodes_path)
        .with_context(|| format!("reading node registry {}", nodes_path.display()))?;
    let nodes: Vec<Node> = serde_json::from_str(&raw).context("parsing node registry")?;
    info!(nodes = nodes.len(), path = %nodes_path.display(), "node registry loaded");

    let signer: Arc<dyn TokenSigner> = match &cli.secret_file {
        Some(path) => Arc::new(
            JwtSigner::from_secret_file(path, "siftctl", "zoekt-webserver")
                .with_context(|| format!("reading secret file {}", path.display()))?,
        ),
        None => Arc::new(NoSigner),
    };

    let config = Config {
        counts: if cli.derived_counts { CountSource::Derived } else { CountSource::Reported },
        traversal_scoped: cli.traversal,
        log_payloads: cli.debug_payloads,
        env: cli.env.into(),
        request_timeout: Duration::from_secs(cli.timeout_secs),
        username_file: cli.username_file.clone(),
        password_file: cli.password_file.clone(),
    };

    Ok(Client::new(
        Arc::new(StaticNodes::new(nodes)),
        Arc::new(ReqwestTransport::new()),
        signer,
        config,
    ))
}

#[derive(serde::Serialize)]
struct Row<'a> {
    file: &'a str,
    repo: i64,
    score: f64,
}

fn print_files<'a>(
    output: Output,
    files: impl Iterator<Item = &'a FileMatch>,
    file_count: u64,
    match_count: u64,
) -> Result<()> {
    match output {
        Output::Human => {
            println!("SCORE      REPO  FILE");
            for f in files {
                println!("{:>9.2} {:>6}  {}", f.score, f.repository_id, f.file_name);
            }
            println!("({file_count} files, {match_count} matches)");
        }
        Output::Json => {
            let rows: Vec<Row<'_>> = files
                .map(|f| Row { file: &f.file_name, repo: f.repository_id, score: f.score })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Search { query, node, projects, num, mode } => {
            let mode: SearchMode = mode.parse().map_err(anyhow::Error::msg)?;
            let client = build_client(&cli)?;
            let response = client
                .search(query, *num, &ProjectScope::Ids(projects.clone()), *node, mode)
                .await?;
            if !response.is_success() {
                eprintln!("search failed: {}", response.error_message().unwrap_or("unknown"));
                std::process::exit(1);
            }
            print_files(
                cli.output,
                response.files().iter(),
                response.file_count(),
                response.match_count(),
            )?;
        }
        Commands::Fanout { query, targets, num, mode } => {
            let mode: SearchMode = mode.parse().map_err(anyhow::Error::msg)?;
            let client = build_client(&cli)?;
            let aggregate = client.search_proxy(query, *num, targets, mode).await?;
            if !aggregate.is_success() {
                eprintln!(
                    "fan-out degraded: {}",
                    aggregate.error_message().unwrap_or("unknown")
                );
            }
            print_files(
                cli.output,
                aggregate.files(),
                aggregate.file_count(),
                aggregate.match_count(),
            )?;
        }
        Commands::State { file, terminating, terminated, error_type, error_message } => {
            let raw = std::fs::read_to_string(file)
                .with_context(|| format!("reading deployment descriptor {}", file.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("parsing deployment descriptor")?;
            let deployment = deployment_from_json(&value);

            let termination_progress = if *terminating {
                Some(TerminationProgress::Terminating)
            } else if *terminated {
                Some(TerminationProgress::Terminated)
            } else {
                None
            };
            let error_details = (error_type.is_some() || error_message.is_some()).then(|| {
                ErrorDetails {
                    error_type: error_type.clone(),
                    error_message: error_message.clone(),
                }
            });

            let state = calculate_actual_state(
                deployment.as_ref(),
                termination_progress,
                error_details.as_ref(),
            );
            match cli.output {
                Output::Human => println!("{state}"),
                Output::Json => println!("{}", serde_json::to_string(&state)?),
            }
        }
    }

    Ok(())
}
