//! Edge Engine
//!
//! Command line and HTTP surface of the convergence engine. Runs against a
//! real AWS account (`--backend aws`) or a simulated account persisted in a
//! JSON state file.

use anyhow::{bail, Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use edge_engine::edge::aws::{AwsCloud, AwsSettings};
use edge_engine::edge::memory::{InMemoryCloud, ValidationBehavior};
use edge_engine::edge::smoke::{smoke_checks, verify_simulated, SmokeResult, SmokeVerifier};
use edge_engine::edge::{
    CloudBackend, ConvergeReport, ConvergenceEngine, DomainTopology, EngineConfig, TopologyRequest,
};

#[derive(Parser, Debug)]
#[command(name = "edge-engine", author, version, about, long_about = None)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "EDGE_LOG_JSON")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Converge a domain topology
    Converge {
        #[command(flatten)]
        topology: TopologyArgs,

        #[command(flatten)]
        account: AccountArgs,

        /// Register a hosted zone in the simulated account before the run
        #[arg(long)]
        seed_zone: Vec<String>,

        /// Converge against a copy of the account and discard it
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// How the simulated certificate authority answers
        #[arg(long, value_enum, env = "EDGE_SIMULATE_VALIDATION")]
        simulate_validation: Option<ValidationMode>,

        /// Also write the report to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Evaluate the rewrite rule for request paths
    Rewrite {
        /// Request URIs, e.g. /projects
        #[arg(required = true)]
        uris: Vec<String>,

        /// Engine config overrides (JSON)
        #[arg(long = "engine-config", env = "EDGE_CONFIG")]
        engine_config: Option<PathBuf>,
    },

    /// Serve one request through the simulated account
    Simulate {
        /// Absolute URL, e.g. https://example.test/projects/
        url: String,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Verify a converged site
    Smoke {
        #[command(flatten)]
        topology: TopologyArgs,

        #[command(flatten)]
        account: AccountArgs,

        /// Check the simulated account instead of the network
        #[arg(long, default_value = "false")]
        simulated: bool,

        /// Per-request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Run the HTTP API
    Serve {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8080", env = "EDGE_LISTEN")]
        listen: SocketAddr,

        #[command(flatten)]
        account: AccountArgs,

        /// Register a hosted zone in the simulated account at startup
        #[arg(long)]
        seed_zone: Vec<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct TopologyArgs {
    /// Topology file (JSON)
    #[arg(long, env = "EDGE_TOPOLOGY")]
    topology: Option<PathBuf>,

    /// Apex domain, used when no topology file is given
    #[arg(long, env = "EDGE_DOMAIN", conflicts_with = "topology")]
    domain: Option<String>,

    /// Publish and certify the www alias
    #[arg(long, env = "EDGE_ENABLE_WWW", conflicts_with = "topology")]
    www: bool,

    /// Resource tag as key=value (repeatable)
    #[arg(long = "tag", value_parser = parse_tag, conflicts_with = "topology")]
    tags: Vec<(String, String)>,

    /// Built site to publish into the origin store
    #[arg(long, env = "EDGE_SITE_DIR")]
    site_dir: Option<PathBuf>,
}

impl TopologyArgs {
    fn load(&self) -> Result<DomainTopology> {
        let mut topology = match (&self.topology, &self.domain) {
            (Some(path), _) => DomainTopology::from_file(path)?,
            (None, Some(domain)) => {
                let mut topology = DomainTopology::new(domain.as_str()).with_www(self.www);
                for (key, value) in &self.tags {
                    if topology.tags.insert(key.clone(), value.clone()).is_some() {
                        bail!("duplicate tag key '{}'", key);
                    }
                }
                topology
            }
            (None, None) => bail!("either --topology or --domain is required"),
        };

        if let Some(dir) = &self.site_dir {
            topology.site_dir = Some(dir.clone());
        }
        topology.validate()?;
        Ok(topology)
    }
}

#[derive(Args, Debug, Clone)]
struct AccountArgs {
    /// Account the engine converges
    #[arg(long, value_enum, env = "EDGE_BACKEND", default_value = "simulated")]
    backend: Backend,

    /// Simulated account state file
    #[arg(long, env = "EDGE_STATE_FILE", default_value = "edge-account.json")]
    state_file: PathBuf,

    /// Region of the origin store (AWS backend)
    #[arg(long, env = "EDGE_AWS_REGION")]
    aws_region: Option<String>,

    /// Endpoint override for every AWS client, e.g. LocalStack
    #[arg(long, env = "EDGE_AWS_ENDPOINT")]
    aws_endpoint: Option<String>,

    /// Engine config overrides (JSON)
    #[arg(long = "engine-config", env = "EDGE_CONFIG")]
    engine_config: Option<PathBuf>,
}

impl AccountArgs {
    fn engine_config(&self) -> Result<EngineConfig> {
        load_engine_config(self.engine_config.as_ref())
    }

    async fn connect_aws(&self) -> Result<Arc<AwsCloud>> {
        let settings = AwsSettings {
            region: self.aws_region.clone(),
            endpoint: self.aws_endpoint.clone(),
        };
        Ok(Arc::new(AwsCloud::connect(settings).await?))
    }

    fn require_simulated(&self, what: &str) -> Result<()> {
        if self.backend != Backend::Simulated {
            bail!("{} requires the simulated backend", what);
        }
        Ok(())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// Route 53, ACM, S3 and CloudFront in the configured AWS account
    Aws,
    /// In-process account persisted to --state-file
    Simulated,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ValidationMode {
    Auto,
    Reject,
    Never,
}

impl From<ValidationMode> for ValidationBehavior {
    fn from(mode: ValidationMode) -> Self {
        match mode {
            ValidationMode::Auto => ValidationBehavior::AutoValidate { after_polls: 1 },
            ValidationMode::Reject => ValidationBehavior::Reject,
            ValidationMode::Never => ValidationBehavior::Never,
        }
    }
}

fn parse_tag(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("'{}' is not key=value", raw)),
    }
}

fn load_engine_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::default()),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    match cli.command {
        Command::Converge {
            topology,
            account,
            seed_zone,
            dry_run,
            simulate_validation,
            report,
        } => {
            let topology = topology.load()?;
            let config = account.engine_config()?;

            let result = match account.backend {
                Backend::Simulated => {
                    let cloud = InMemoryCloud::load(&account.state_file)?;
                    for zone in &seed_zone {
                        let zone = cloud.add_hosted_zone(zone, false);
                        info!(zone_id = %zone.id, zone = %zone.name, "Seeded hosted zone");
                    }
                    if let Some(mode) = simulate_validation {
                        cloud.set_validation(mode.into());
                    }

                    let cloud = if dry_run {
                        info!("DRY RUN - converging against a copy of the account");
                        Arc::new(cloud.fork())
                    } else {
                        Arc::new(cloud)
                    };

                    let result = ConvergenceEngine::new(cloud.clone(), config)
                        .converge(&topology)
                        .await;
                    if !dry_run {
                        cloud.persist(&account.state_file)?;
                    }
                    result
                }
                Backend::Aws => {
                    if dry_run || !seed_zone.is_empty() || simulate_validation.is_some() {
                        bail!("--dry-run, --seed-zone and --simulate-validation require the simulated backend");
                    }
                    let cloud = account.connect_aws().await?;
                    ConvergenceEngine::new(cloud, config).converge(&topology).await
                }
            };

            let rendered = serde_json::to_string_pretty(&result)?;
            println!("{}", rendered);
            if let Some(path) = report {
                std::fs::write(&path, &rendered)
                    .with_context(|| format!("Failed to write report {:?}", path))?;
            }

            if let Some(err) = &result.error {
                bail!("convergence failed ({}): {}", err.kind, err.message);
            }
        }

        Command::Rewrite { uris, engine_config } => {
            let config = load_engine_config(engine_config.as_ref())?;
            for uri in uris {
                let outcome = config.rewrite.evaluate(uri.split('?').next().unwrap_or(&uri));
                let line = serde_json::json!({
                    "uri": uri,
                    "result": outcome,
                    "cache_key": config.rewrite.cache_key(&uri),
                });
                println!("{}", line);
            }
        }

        Command::Simulate { url, account } => {
            account.require_simulated("simulate")?;
            let cloud = InMemoryCloud::load(&account.state_file)?;
            let response = cloud.simulate_request(&url)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "url": url,
                    "status": response.status,
                    "location": response.location,
                    "content_type": response.content_type,
                    "cache_key": response.cache_key,
                    "body_bytes": response.body.len(),
                }))?
            );
        }

        Command::Smoke {
            topology,
            account,
            simulated,
            timeout,
        } => {
            let topology = topology.load()?;
            let config = account.engine_config()?;
            let checks = smoke_checks(&topology, &config.rewrite);

            let results: Vec<SmokeResult> = if simulated {
                account.require_simulated("--simulated")?;
                let cloud = InMemoryCloud::load(&account.state_file)?;
                verify_simulated(&cloud, &checks)
            } else {
                SmokeVerifier::new(Duration::from_secs(timeout))?
                    .verify(&checks)
                    .await
            };

            println!("{}", serde_json::to_string_pretty(&results)?);
            let failed = results.iter().filter(|r| !r.passed).count();
            if failed > 0 {
                bail!("{} of {} smoke checks failed", failed, results.len());
            }
        }

        Command::Serve {
            listen,
            account,
            seed_zone,
        } => {
            let config = account.engine_config()?;

            match account.backend {
                Backend::Simulated => {
                    let cloud = InMemoryCloud::load(&account.state_file)?;
                    for zone in &seed_zone {
                        cloud.add_hosted_zone(zone, false);
                    }
                    let engine = ConvergenceEngine::new(Arc::new(cloud), config);
                    serve(listen, AppState::new(engine, Some(account.state_file))).await?;
                }
                Backend::Aws => {
                    if !seed_zone.is_empty() {
                        bail!("--seed-zone requires the simulated backend");
                    }
                    let engine = ConvergenceEngine::new(account.connect_aws().await?, config);
                    serve(listen, AppState::new(engine, None)).await?;
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// HTTP API
// ============================================================================

/// An account the HTTP surface can converge
trait Account: CloudBackend + 'static {
    /// Write the account state out after a run
    fn persist(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

impl Account for InMemoryCloud {
    fn persist(&self, path: &Path) -> Result<()> {
        self.save(path).context("Failed to persist account state")
    }
}

/// Every call already lands in the account
impl Account for AwsCloud {}

struct AppState<B: Account> {
    engine: Arc<ConvergenceEngine<B>>,
    last_report: Arc<RwLock<Option<ConvergeReport>>>,
    /// One convergence run at a time
    run_lock: Arc<Mutex<()>>,
    state_file: Option<PathBuf>,
}

impl<B: Account> AppState<B> {
    fn new(engine: ConvergenceEngine<B>, state_file: Option<PathBuf>) -> Self {
        Self {
            engine: Arc::new(engine),
            last_report: Arc::new(RwLock::new(None)),
            run_lock: Arc::new(Mutex::new(())),
            state_file,
        }
    }
}

impl<B: Account> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            last_report: self.last_report.clone(),
            run_lock: self.run_lock.clone(),
            state_file: self.state_file.clone(),
        }
    }
}

async fn serve<B: Account>(listen: SocketAddr, state: AppState<B>) -> Result<()> {
    info!("Edge Engine listening on {}", listen);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn router<B: Account>(state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/converge", post(converge::<B>))
        .route("/api/report", get(last_report::<B>))
        .route("/api/rewrite", get(rewrite::<B>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "edge-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Only the declared topology is accepted; local paths stay on the CLI
async fn converge<B: Account>(
    State(state): State<AppState<B>>,
    Json(request): Json<TopologyRequest>,
) -> (StatusCode, Json<ConvergeReport>) {
    let topology = DomainTopology::from(request);
    let _guard = state.run_lock.lock().await;
    let report = state.engine.converge(&topology).await;

    if let Some(path) = &state.state_file {
        if let Err(e) = state.engine.backend().persist(path) {
            error!(error = %e, "Failed to persist account state");
        }
    }

    *state.last_report.write().await = Some(report.clone());

    let status = if report.success {
        StatusCode::OK
    } else {
        warn!(domain = %report.domain, "Convergence request failed");
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(report))
}

async fn last_report<B: Account>(State(state): State<AppState<B>>) -> (StatusCode, Json<serde_json::Value>) {
    match state.last_report.read().await.as_ref() {
        Some(report) => (StatusCode::OK, Json(serde_json::json!(report))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "message": "no convergence run yet"
            })),
        ),
    }
}

#[derive(serde::Deserialize)]
struct RewriteQuery {
    uri: String,
}

async fn rewrite<B: Account>(
    State(state): State<AppState<B>>,
    Query(query): Query<RewriteQuery>,
) -> Json<serde_json::Value> {
    let rule = &state.engine.config().rewrite;
    let path = query.uri.split('?').next().unwrap_or(&query.uri);
    Json(serde_json::json!({
        "uri": query.uri,
        "result": rule.evaluate(path),
        "cache_key": rule.cache_key(&query.uri),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> AppState<InMemoryCloud> {
        let cloud = InMemoryCloud::new();
        cloud.add_hosted_zone("example.test", false);
        AppState::new(
            ConvergenceEngine::new(Arc::new(cloud), EngineConfig::default()),
            None,
        )
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("env=prod"), Ok(("env".to_string(), "prod".to_string())));
        assert_eq!(parse_tag("note=a=b"), Ok(("note".to_string(), "a=b".to_string())));
        assert!(parse_tag("=x").is_err());
        assert!(parse_tag("novalue").is_err());
    }

    #[test]
    fn test_backend_flag() {
        let cli = Cli::try_parse_from(["edge-engine", "converge", "--domain", "example.test"]).unwrap();
        let Command::Converge { account, .. } = cli.command else {
            panic!("expected converge");
        };
        assert_eq!(account.backend, Backend::Simulated);

        let cli = Cli::try_parse_from([
            "edge-engine",
            "serve",
            "--backend",
            "aws",
            "--aws-region",
            "eu-west-1",
        ])
        .unwrap();
        let Command::Serve { account, .. } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(account.backend, Backend::Aws);
        assert_eq!(account.aws_region.as_deref(), Some("eu-west-1"));
        assert!(account.require_simulated("simulate").is_err());

        assert!(Cli::try_parse_from(["edge-engine", "serve", "--backend", "gcp"]).is_err());
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["service"], "edge-engine");
    }

    #[tokio::test]
    async fn test_rewrite_endpoint() {
        let response = router(state())
            .oneshot(
                Request::get("/api/rewrite?uri=/projects")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["result"]["outcome"], "redirect");
        assert_eq!(body["result"]["location"], "/projects/");
        assert!(body["cache_key"].is_null());
    }

    #[tokio::test(start_paused = true)]
    async fn test_converge_then_report() {
        let app = router(state());

        let missing = app
            .clone()
            .oneshot(Request::get("/api/report").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/converge")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"domain": "example.test", "enable_www": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);

        let report = app
            .oneshot(Request::get("/api/report").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(report.status(), StatusCode::OK);
        assert_eq!(json_body(report).await["domain"], "example.test");
    }

    #[tokio::test]
    async fn test_converge_rejects_local_paths() {
        let state = state();
        let app = router(state.clone());

        for body in [
            r#"{"domain": "example.test", "site_dir": "/etc"}"#,
            r#"{"domain": "example.test", "store_name": "someone-elses-bucket"}"#,
        ] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/api/converge")
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", body);
        }

        // Rejected before the engine ran: nothing touched the account
        assert!(state.engine.backend().journal().is_empty());
        assert!(state.last_report.read().await.is_none());
    }
}
