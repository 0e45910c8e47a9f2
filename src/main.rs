mod cli;

use crate::cli::{AnomaliesArgs, Cli, Commands, IngestArgs, TrendArgs};
use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use trend_sidecar::clock::{Clock, SystemClock};
use trend_sidecar::config::Config;
use trend_sidecar::job::JobStore;
use trend_sidecar::orchestrator::{JobReport, Orchestrator};
use trend_sidecar::query::{QueryService, TimeRange};
use trend_sidecar::sink::{MemorySink, PgSink, ResultSink};
use trend_sidecar::stats::PipelineStats;
use trend_sidecar::upload::decode_csv;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,trend_sidecar=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "trend-sidecar"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn connect_pg(config: &Config) -> Result<PgSink> {
    let database_url = config
        .database_url
        .as_deref()
        .context("TREND_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
    PgSink::connect(database_url, config.db_pool_size).await
}

async fn open_sink(config: &Config, memory: bool) -> Result<Arc<dyn ResultSink>> {
    if memory {
        tracing::info!("using in-memory result sink");
        return Ok(Arc::new(MemorySink::new()));
    }
    let sink = connect_pg(config).await?;
    sink.migrate().await?;
    Ok(Arc::new(sink))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn ingest_file(
    orchestrator: &Orchestrator,
    config: &Config,
    path: &Path,
    batch_ref: Option<&str>,
) -> Result<JobReport> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let batch = decode_csv(&name, &bytes, config.max_upload_bytes)
        .with_context(|| format!("rejected upload {}", path.display()))?;

    let job = orchestrator.submit(batch_ref.unwrap_or(&name)).await;
    match orchestrator.run(&job.job_id, &batch).await {
        Ok(report) => Ok(report),
        Err(err) => {
            tracing::error!(job_id = %job.job_id, error = %err, "ingest job did not complete");
            Ok(orchestrator.report(&job.job_id).await?)
        }
    }
}

async fn run_ingest(config: &Config, args: IngestArgs) -> Result<()> {
    let sink = open_sink(config, args.memory).await?;
    let jobs = Arc::new(JobStore::new());
    let orchestrator = Orchestrator::new(
        config.pipeline(),
        config.schema.clone(),
        sink,
        jobs.clone(),
        Arc::new(SystemClock),
    )?;

    let signal_jobs = jobs.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; cancelling jobs at the next stage boundary");
            signal_jobs.shutdown();
        }
    });

    let reports = futures::future::join_all(
        args.files
            .iter()
            .map(|path| ingest_file(&orchestrator, config, path, args.batch_ref.as_deref())),
    )
    .await;
    signal_handle.abort();

    let mut failed = 0usize;
    for (path, report) in args.files.iter().zip(reports) {
        match report {
            Ok(report) => {
                if report.stage != trend_sidecar::job::JobStage::Done {
                    failed += 1;
                }
                print_json(&report)?;
            }
            Err(err) => {
                failed += 1;
                tracing::error!(path = %path.display(), error = %err, "upload skipped");
            }
        }
    }
    tracing::info!(stats = ?orchestrator.stats().snapshot(), "ingest finished");
    if failed > 0 {
        bail!("{failed} of {} uploads did not complete", args.files.len());
    }
    Ok(())
}

async fn query_service(config: &Config) -> Result<QueryService> {
    let sink = connect_pg(config).await?;
    Ok(QueryService::new(
        Arc::new(sink),
        Arc::new(SystemClock),
        config.pipeline().retry,
        Arc::new(PipelineStats::new()),
    ))
}

async fn run_anomalies(config: &Config, args: AnomaliesArgs) -> Result<()> {
    let service = query_service(config).await?;
    let since = SystemClock.now() - ChronoDuration::hours(args.since_hours);
    let anomalies = service.recent_anomalies(Some(since), args.min_severity).await?;
    tracing::debug!(stats = ?service.stats().snapshot(), "anomaly query finished");
    print_json(&anomalies)
}

async fn run_trend(config: &Config, args: TrendArgs) -> Result<()> {
    let service = query_service(config).await?;
    let range = TimeRange::last(ChronoDuration::hours(args.hours), SystemClock.now());
    let points = service.trend_points(&args.metric, range).await?;
    tracing::debug!(stats = ?service.stats().snapshot(), "trend query finished");
    print_json(&points)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    match cli.command {
        Commands::Ingest(args) => run_ingest(&config, args).await,
        Commands::Anomalies(args) => run_anomalies(&config, args).await,
        Commands::Trend(args) => run_trend(&config, args).await,
        Commands::Migrate => {
            let sink = connect_pg(&config).await?;
            sink.migrate().await?;
            tracing::info!("result tables ready");
            Ok(())
        }
    }
}
