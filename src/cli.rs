use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use trend_sidecar::model::Severity;

#[derive(Parser)]
#[command(
    name = "trend-sidecar",
    version,
    about = "Healthcare upload ETL and trend anomaly detection"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run each CSV upload through the pipeline as its own job.
    Ingest(IngestArgs),
    /// List recent anomalies.
    Anomalies(AnomaliesArgs),
    /// Print the bucketed trend of one metric.
    Trend(TrendArgs),
    /// Create the result tables.
    Migrate,
}

#[derive(Args)]
pub struct IngestArgs {
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
    /// Batch reference recorded on the job; defaults to the file name.
    #[arg(long)]
    pub batch_ref: Option<String>,
    /// Keep results in memory instead of Postgres.
    #[arg(long, default_value_t = false)]
    pub memory: bool,
}

#[derive(Args)]
pub struct AnomaliesArgs {
    #[arg(long, default_value_t = 168)]
    pub since_hours: i64,
    #[arg(long, default_value = "low")]
    pub min_severity: Severity,
}

#[derive(Args)]
pub struct TrendArgs {
    pub metric: String,
    #[arg(long, default_value_t = 24)]
    pub hours: i64,
}
