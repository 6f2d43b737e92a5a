//! tabular-loader: stream a JSONL, CSV or spreadsheet file into PostgreSQL tables.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use tabular_loader::ingestion::{
    notify_best_effort, run_import, CompositeNotifier, FileNotifier, ImportFormat, ImportNotifier, ImportOptions,
    ImportRequest, LogNotifier, Notification, WebhookNotifier,
};
use tabular_loader::ingestion::unified::parse_timezone;
use tabular_loader::load::{PgTableStore, DEFAULT_INSERT_BATCH_SIZE};
use tabular_loader::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use tabular_loader::table_config::TableConfigOverrides;
use tabular_loader::{IngestionError, IngestionResult};

#[derive(Parser, Debug)]
#[command(name = "tabular-loader")]
#[command(author, version, about = "Load JSONL, CSV and spreadsheet files into PostgreSQL tables")]
struct Cli {
    /// File to import (.jsonl, .ndjson, .csv, .xlsx, .xls, .xlsm, .xlsb, .ods)
    #[arg(short, long)]
    input_file: PathBuf,

    /// Base table name, optionally schema-qualified (e.g. public.sales)
    #[arg(short, long)]
    table: String,

    /// JSON document with per-field column overrides
    #[arg(short = 'c', long)]
    table_config: Option<PathBuf>,

    /// IANA time zone used to interpret timestamp values
    #[arg(long)]
    timezone: String,

    /// Rows per insert batch
    #[arg(short, long, default_value_t = DEFAULT_INSERT_BATCH_SIZE)]
    batch_size: usize,

    /// Replace existing tables instead of merging into them
    #[arg(long)]
    truncate: bool,

    /// Slack-compatible incoming webhook for import notifications
    #[arg(long, env = "SLACK_NOTIFY_URL", hide_env_values = true)]
    slack_notify_url: Option<String>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    /// Input format; inferred from the file extension when omitted
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// Append notifications as JSON lines to this file
    #[arg(long)]
    notify_log_file: Option<PathBuf>,

    /// Maximum database connections
    #[arg(long, default_value_t = 4)]
    max_connections: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log line format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Jsonl,
    Csv,
    Excel,
}

impl From<FormatArg> for ImportFormat {
    fn from(f: FormatArg) -> Self {
        match f {
            FormatArg::Jsonl => ImportFormat::Jsonl,
            FormatArg::Csv => ImportFormat::Csv,
            FormatArg::Excel => ImportFormat::Excel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: if cli.verbose { LogLevel::Debug } else { LogLevel::Info },
        format: cli.log_format,
        ..LogConfig::default()
    };
    init_logging(&log_config.merge_env()?)?;

    let notifier = build_notifier(&cli);
    let request = match build_request(&cli) {
        Ok(request) => request,
        Err(e) => return Ok(fail(&cli, notifier.as_ref(), &e).await),
    };

    info!(max_connections = cli.max_connections, "initializing database connection");
    let store = match PgTableStore::connect(&cli.database_url, cli.max_connections).await {
        Ok(store) => store,
        Err(e) => return Ok(fail(&cli, notifier.as_ref(), &e).await),
    };

    let outcome = run_import(&request, store.clone(), notifier).await;
    store.close().await;

    match outcome {
        Ok(report) => {
            info!(
                tables = report.load.tables.len(),
                rows = report.load.valid_rows(),
                skipped_rows = report.run.skipped_rows,
                "done"
            );
            Ok(ExitCode::SUCCESS)
        }
        // run_import already logged and notified
        Err(_) => Ok(ExitCode::FAILURE),
    }
}

fn build_notifier(cli: &Cli) -> Arc<dyn ImportNotifier> {
    let mut composite = CompositeNotifier::default();
    composite.push(Arc::new(LogNotifier));
    let webhook = WebhookNotifier::new(cli.slack_notify_url.clone());
    if webhook.is_enabled() {
        composite.push(Arc::new(webhook));
    }
    if let Some(path) = &cli.notify_log_file {
        composite.push(Arc::new(FileNotifier::new(path)));
    }
    Arc::new(composite)
}

fn build_request(cli: &Cli) -> IngestionResult<ImportRequest> {
    if !cli.input_file.is_file() {
        return Err(IngestionError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("input file not found: {}", cli.input_file.display()),
        )));
    }
    let format = match cli.format {
        Some(f) => ImportFormat::from(f),
        None => ImportFormat::from_path(&cli.input_file)?,
    };
    let timezone = parse_timezone(&cli.timezone)?;
    let overrides = TableConfigOverrides::load(cli.table_config.as_deref())?;

    info!(%timezone, batch_size = cli.batch_size, overrides = overrides.len(), "loaded configuration");
    Ok(ImportRequest::new(
        cli.input_file.clone(),
        cli.table.clone(),
        ImportOptions {
            format: Some(format),
            timezone,
            overrides: Arc::new(overrides),
            insert_batch_size: cli.batch_size,
            truncate: cli.truncate,
            ..ImportOptions::default()
        },
    ))
}

async fn fail(cli: &Cli, notifier: &dyn ImportNotifier, err: &IngestionError) -> ExitCode {
    error!(error = %err, "import failed");
    let input_file = cli
        .input_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    notify_best_effort(notifier, &Notification::failure(&input_file, err)).await;
    ExitCode::FAILURE
}
