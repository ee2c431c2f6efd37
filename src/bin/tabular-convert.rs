//! Command-line front end: loads configuration once, initializes logging and runs one request.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use tabular_convert::PipelineError;
use tabular_convert::config::ServiceConfig;
use tabular_convert::connectors::{ConnectorType, JsonFileResolver, PartitionSpec};
use tabular_convert::ingestion::SourceFormat;
use tabular_convert::output::Compression;
use tabular_convert::processing::TransformOptions;
use tabular_convert::service::{
    ConnectionTestRequest, Converter, DatabaseConversionRequest, ErrorResponse, FileConversionRequest,
    FileReadOptions, SchemaInferRequest,
};
use tabular_convert::types::DataType;
use tabular_convert::versioning::{MetadataStore, Source, SourceKind, StoreError};

#[derive(Parser, Debug)]
#[command(name = "tabular-convert", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; `TABULAR_*` environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite file holding source and version records.
    #[arg(long, default_value = "tabular-metadata.db")]
    metadata_db: PathBuf,

    /// Directory of `<credential_ref>.json` files.
    #[arg(long, default_value = "credentials")]
    credentials_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an uploaded file source to a new Parquet version.
    ConvertFile {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        format: Option<SourceFormat>,
        #[command(flatten)]
        read: ReadArgs,
        #[command(flatten)]
        transform: TransformArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Extract a database table or query to a new Parquet version.
    ConvertDb {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        connector: ConnectorType,
        #[arg(long)]
        credential_ref: String,
        #[arg(long, conflicts_with = "table")]
        query: Option<String>,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        row_limit: Option<usize>,
        /// Integer column to split the extraction on.
        #[arg(long, requires = "partitions")]
        partition_column: Option<String>,
        #[arg(long, requires = "partition_column")]
        partitions: Option<usize>,
        #[command(flatten)]
        transform: TransformArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Infer the schema of a file source.
    Infer {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        format: Option<SourceFormat>,
        #[arg(long)]
        sample_size: Option<usize>,
        #[command(flatten)]
        read: ReadArgs,
    },
    /// Check connectivity to a database.
    TestConnection {
        #[arg(long)]
        connector: ConnectorType,
        #[arg(long)]
        credential_ref: String,
    },
    /// Print supported formats, connectors and limits.
    Capabilities,
}

#[derive(Args, Debug)]
struct SourceArgs {
    #[arg(long)]
    source_id: String,
    /// Owning organization; used when the source is registered on first use.
    #[arg(long)]
    org: String,
}

#[derive(Args, Debug)]
struct ReadArgs {
    #[arg(long)]
    encoding: Option<String>,
    #[arg(long)]
    delimiter: Option<String>,
    #[arg(long)]
    sheet_name: Option<String>,
    #[arg(long)]
    sheet_index: Option<usize>,
}

impl From<ReadArgs> for FileReadOptions {
    fn from(a: ReadArgs) -> Self {
        FileReadOptions {
            encoding: a.encoding,
            delimiter: a.delimiter,
            sheet_name: a.sheet_name,
            sheet_index: a.sheet_index,
        }
    }
}

#[derive(Args, Debug)]
struct TransformArgs {
    /// `old=new`, repeatable.
    #[arg(long = "rename", value_parser = parse_pair)]
    renames: Vec<(String, String)>,
    /// `column=type`, repeatable.
    #[arg(long = "cast", value_parser = parse_pair)]
    casts: Vec<(String, String)>,
    /// Zero-based input row index to drop, repeatable.
    #[arg(long = "skip-row")]
    skip_rows: Vec<usize>,
}

impl TransformArgs {
    fn into_options(self) -> Result<TransformOptions, PipelineError> {
        let type_overrides = self
            .casts
            .into_iter()
            .map(|(col, ty)| {
                ty.parse::<DataType>()
                    .map(|t| (col, t))
                    .map_err(|e| PipelineError::Input(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(TransformOptions {
            column_mapping: self.renames.into_iter().collect(),
            type_overrides,
            skip_rows: self.skip_rows.into_iter().collect::<BTreeSet<_>>(),
        })
    }
}

#[derive(Args, Debug)]
struct OutputArgs {
    #[arg(long)]
    compression: Option<Compression>,
    #[arg(long)]
    row_group_size: Option<usize>,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn init_logging(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to render output: {e}"),
    }
}

#[cfg(feature = "sqlite")]
type Store = tabular_convert::versioning::SqliteStore;

#[cfg(feature = "sqlite")]
fn open_store(path: &std::path::Path) -> Result<Store, PipelineError> {
    Ok(Store::open(path)?)
}

#[cfg(not(feature = "sqlite"))]
type Store = tabular_convert::versioning::InMemoryStore;

#[cfg(not(feature = "sqlite"))]
fn open_store(_path: &std::path::Path) -> Result<Store, PipelineError> {
    tracing::warn!("built without the sqlite feature; version records are not persisted");
    Ok(Store::new())
}

/// Register the source on first use so the command line can drive fresh sources.
async fn ensure_source(store: &Store, source: &SourceArgs, kind: SourceKind, source_type: &str) -> Result<(), PipelineError> {
    match store.get_source(&source.source_id).await {
        Ok(_) => Ok(()),
        Err(StoreError::SourceNotFound(_)) => {
            let record = Source::new(&source.source_id, &source.org, kind, source_type);
            register(store, record).await
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(feature = "sqlite")]
async fn register(store: &Store, source: Source) -> Result<(), PipelineError> {
    Ok(store.register_source(&source).await?)
}

#[cfg(not(feature = "sqlite"))]
async fn register(store: &Store, source: Source) -> Result<(), PipelineError> {
    store.register_source(source);
    Ok(())
}

async fn run(cli: Cli, config: ServiceConfig) -> Result<(), PipelineError> {
    let store = Arc::new(open_store(&cli.metadata_db)?);
    let converter = Converter::builder(config)
        .store(store.clone())
        .credential_resolver(Arc::new(JsonFileResolver::new(cli.credentials_dir)))
        .build()?;

    match cli.command {
        Command::ConvertFile {
            source,
            format,
            read,
            transform,
            output,
        } => {
            let source_type = format.map(SourceFormat::as_str).unwrap_or("csv");
            ensure_source(&store, &source, SourceKind::File, source_type).await?;
            let response = converter
                .convert_file(FileConversionRequest {
                    source_id: source.source_id,
                    format,
                    file_name: None,
                    read: read.into(),
                    transform: transform.into_options()?,
                    compression: output.compression,
                    row_group_size: output.row_group_size,
                })
                .await?;
            print_json(&response);
        }
        Command::ConvertDb {
            source,
            connector,
            credential_ref,
            query,
            table,
            row_limit,
            partition_column,
            partitions,
            transform,
            output,
        } => {
            ensure_source(&store, &source, SourceKind::Database, connector.as_str()).await?;
            let partition = partition_column
                .zip(partitions)
                .map(|(column, count)| PartitionSpec { column, count });
            let response = converter
                .convert_database(DatabaseConversionRequest {
                    source_id: source.source_id,
                    credential_ref,
                    query,
                    table_name: table,
                    row_limit,
                    partition,
                    transform: transform.into_options()?,
                    compression: output.compression,
                    row_group_size: output.row_group_size,
                })
                .await?;
            print_json(&response);
        }
        Command::Infer {
            source,
            format,
            sample_size,
            read,
        } => {
            let source_type = format.map(SourceFormat::as_str).unwrap_or("csv");
            ensure_source(&store, &source, SourceKind::File, source_type).await?;
            let response = converter
                .infer_schema(SchemaInferRequest {
                    source_id: source.source_id,
                    format,
                    file_name: None,
                    sample_size,
                    read: read.into(),
                    non_nullable: Vec::new(),
                })
                .await?;
            print_json(&response);
        }
        Command::TestConnection {
            connector,
            credential_ref,
        } => {
            let outcome = converter
                .test_connection(ConnectionTestRequest {
                    connector_type: Some(connector),
                    credentials: None,
                    credential_ref: Some(credential_ref),
                })
                .await?;
            print_json(&outcome);
        }
        Command::Capabilities => print_json(&converter.capabilities()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match ServiceConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    init_logging(&config);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(code = e.error_code(), error = %e, "request failed");
            print_json(&ErrorResponse::from(&e));
            ExitCode::FAILURE
        }
    }
}
