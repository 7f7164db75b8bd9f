//! degdb node with its HTTP control surface.
//!
//! - `GET  /api/v1/info` — this node's peer descriptor
//! - `GET  /api/v1/myip` — the caller's address as seen by this node
//! - `GET  /api/v1/triples` — every stored triple
//! - `GET  /api/v1/peers` — every known peer
//! - `POST /api/v1/insert` — commit a JSON array of triples, returns the new count
//! - `GET  /api/v1/query?subj=&pred=&obj=` — pattern query, omitted fields match anything
//!
//! Build and run: `cargo run --features server --bin degdb -- --port 7400`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use degdb::config::NodeConfig;
use degdb::identity::PeerInfo;
use degdb::node::Node;
use degdb::peers::Peer;
use degdb::triple::{Triple, TriplePattern};

#[derive(Parser)]
#[command(name = "degdb", version, about = "Peer-to-peer signed triple store")]
struct Cli {
    /// TOML config file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer-to-peer listening port.
    #[arg(long)]
    port: Option<u16>,

    /// HTTP control surface port.
    #[arg(long, default_value = "8080")]
    http_port: u16,

    /// Seed peer to join through (`host:port`), repeatable.
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Directory for key and database files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Declared storage capacity in bytes.
    #[arg(long)]
    disk_allocated: Option<u64>,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        config.seeds.extend(self.seeds.iter().cloned());
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(bytes) = self.disk_allocated {
            config.disk_allocated = bytes;
        }
        Ok(config)
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

async fn info(State(node): State<Arc<Node>>) -> Json<PeerInfo> {
    Json(node.local_peer().clone())
}

async fn my_ip(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> String {
    addr.ip().to_string()
}

async fn triples(State(node): State<Arc<Node>>) -> Json<Vec<Triple>> {
    Json(node.triples())
}

async fn peers(State(node): State<Arc<Node>>) -> Json<Vec<Peer>> {
    Json(node.peers())
}

async fn insert(
    State(node): State<Arc<Node>>,
    Json(triples): Json<Vec<Triple>>,
) -> Result<Json<usize>, ApiError> {
    node.insert_async(triples)
        .await
        .map(|outcome| Json(outcome.count()))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct QueryParams {
    subj: Option<String>,
    pred: Option<String>,
    obj: Option<String>,
}

impl QueryParams {
    fn pattern(self) -> TriplePattern {
        let bound = |v: Option<String>| v.filter(|s| !s.is_empty() && s != "*");
        TriplePattern {
            subject: bound(self.subj),
            predicate: bound(self.pred),
            object: bound(self.obj),
        }
    }
}

async fn query(
    State(node): State<Arc<Node>>,
    Query(params): Query<QueryParams>,
) -> Json<Vec<Triple>> {
    Json(node.query(&params.pattern()))
}

fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/v1/info", get(info))
        .route("/api/v1/myip", get(my_ip))
        .route("/api/v1/triples", get(triples))
        .route("/api/v1/peers", get(peers))
        .route("/api/v1/insert", post(insert))
        .route("/api/v1/query", get(query))
        .layer(CorsLayer::permissive())
        .with_state(node)
}

// ── Main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.node_config()?;
    let node = Arc::new(Node::start(config).await?);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, peer = %node.id(), "control surface listening");

    axum::serve(
        listener,
        router(Arc::clone(&node)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .into_diagnostic()?;

    if let Ok(node) = Arc::try_unwrap(node) {
        node.shutdown().await;
    }
    Ok(())
}
