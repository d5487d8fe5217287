//! HTTP trigger for the daily cost report.
//!
//! A scheduler calls `/` once a day. The response carries the outcome
//! of the run as plain text with status 200 or 500.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use daily_cost_reporter::api::build_http_client;
use daily_cost_reporter::billing::BigQueryClient;
use daily_cost_reporter::config::{DEFAULT_BILLING_TABLE, DEFAULT_METRIC_TYPE, DEFAULT_SERVICE_DESCRIPTION};
use daily_cost_reporter::monitoring::MonitoringClient;
use daily_cost_reporter::{CostReporter, MetadataServer, ReporterConfig, StaticToken, TokenSource};

type SharedReporter = Arc<CostReporter<BigQueryClient, MonitoringClient>>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project owning the metric descriptor and receiving the time series
    #[arg(long, env = "MONITORING_PROJECT_ID")]
    monitoring_project_id: Option<String>,

    /// Fully-qualified billing export table, `project.dataset.table`
    #[arg(long, env = "BILLING_TABLE", default_value = DEFAULT_BILLING_TABLE)]
    billing_table: String,

    /// Service whose cost is reported, as in `service.description`
    #[arg(long, env = "SERVICE_DESCRIPTION", default_value = DEFAULT_SERVICE_DESCRIPTION)]
    service_description: String,

    /// Custom metric type the cost is written to
    #[arg(long, env = "METRIC_TYPE", default_value = DEFAULT_METRIC_TYPE)]
    metric_type: String,

    /// Project running the query job, defaults to the monitoring project
    #[arg(long, env = "QUERY_PROJECT_ID")]
    query_project_id: Option<String>,

    /// Port the trigger listens on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Static OAuth access token. The metadata server is used otherwise
    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Timeout of every outbound request, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Args {
    fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            billing_table: self.billing_table.clone(),
            service_description: self.service_description.clone(),
            metric_type: self.metric_type.clone(),
            monitoring_project_id: self.monitoring_project_id.clone(),
            query_project_id: self.query_project_id.clone(),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn trigger(State(reporter): State<SharedReporter>) -> (StatusCode, String) {
    // The clients block, keep them off the async workers.
    let run = tokio::task::spawn_blocking(move || reporter.run(Utc::now())).await;
    match run {
        Ok(response) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            response.message,
        ),
        Err(err) => {
            error!("Daily cost report did not complete: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", err))
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal");
}

async fn serve(port: u16, reporter: SharedReporter) -> Result<()> {
    let app = Router::new()
        .route("/", any(trigger))
        .route("/healthz", get(healthz))
        .with_state(reporter);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening for triggers on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    // Blocking clients own a runtime of their own and must be built
    // outside of the server's runtime.
    let http = build_http_client(Duration::from_secs(args.request_timeout_secs))
        .context("failed to build HTTP client")?;
    let tokens: Arc<dyn TokenSource + Send + Sync> = match &args.access_token {
        Some(token) => Arc::new(StaticToken::new(token.as_str())),
        None => Arc::new(MetadataServer::new(http.clone())),
    };
    let reporter: SharedReporter = Arc::new(CostReporter::new(args.reporter_config(), http, tokens));
    info!(
        "Reporting {} cost from {} as {}",
        reporter.config().service_description,
        reporter.config().billing_table,
        reporter.config().metric_type
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cost-reporter")
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(serve(args.port, Arc::clone(&reporter)))
}
