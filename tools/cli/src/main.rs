//! hybridsync CLI - operate a local-first store mirrored to the cloud.
//!
//! Local rows, the outbox journal and shop overrides live in one SQLite
//! database under the data directory. Without `--cloud-url` writes drain
//! into an in-memory replica, which makes every command a dry run.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hybridsync_common::{Record, RecordFilter, ShopId, TableName};
use hybridsync_storage::{
    CloudAdapter, LocalStore, MemoryCloudAdapter, RestCloudAdapter, SqliteLocalStore,
};
use hybridsync_sync::{
    ApiResponse, Caller, Outbox, OutboxConfig, PolicyStore, Role, ShopOverride, SqliteJournal,
    SqlitePolicyStore, SyncAdmin, SyncPolicy, SyncPolicyProvider, WriteOptions, WriteOrchestrator,
};

const DB_FILE: &str = "hybridsync.db";

#[derive(Parser)]
#[command(name = "hybridsync")]
#[command(about = "hybridsync - local-first writes with background cloud sync")]
#[command(version)]
struct Cli {
    /// Directory holding the local database.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Base URL of the cloud replica (PostgREST style).
    #[arg(long, global = true)]
    cloud_url: Option<String>,

    /// API key for the cloud replica.
    #[arg(long, global = true)]
    cloud_key: Option<String>,

    /// Shop the command acts for.
    #[arg(long, global = true, default_value = ShopId::DEFAULT)]
    shop: String,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert a record.
    Create {
        #[arg(short, long)]
        table: String,

        /// Record as a JSON object.
        #[arg(short, long)]
        data: String,

        /// Write locally without queueing for the cloud.
        #[arg(long)]
        local_only: bool,
    },

    /// Update matching records.
    Update {
        #[arg(short, long)]
        table: String,

        /// Equality filter as a JSON object.
        #[arg(short, long)]
        filter: String,

        /// Changed fields as a JSON object.
        #[arg(short, long)]
        changes: String,

        #[arg(long)]
        local_only: bool,
    },

    /// Delete matching records.
    Delete {
        #[arg(short, long)]
        table: String,

        #[arg(short, long)]
        filter: String,

        #[arg(long)]
        local_only: bool,
    },

    /// Insert many records from a JSON array file.
    BulkCreate {
        #[arg(short, long)]
        table: String,

        /// File containing a JSON array of objects.
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long)]
        local_only: bool,
    },

    /// Show engine status.
    Status,

    /// List queued operations.
    Queue,

    /// Show recent sync outcomes.
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Drain the queue once.
    Trigger,

    /// Drop every queued operation.
    Clear,

    /// Turn cloud sync on after checking credentials.
    Enable,

    /// Turn cloud sync off. Queued operations are kept.
    Disable,

    /// Check the cloud replica connection.
    TestConnection,

    /// Push one local record to the cloud immediately.
    ForceSync {
        #[arg(short, long)]
        table: String,

        #[arg(short, long)]
        filter: String,
    },

    /// Run the background processor until interrupted.
    Run,

    /// Read or change the shop's sync settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings.
    Get,

    /// Set one field, e.g. `batchSize 20` or `features cloud-backup,file-storage`.
    Set { key: String, value: String },

    /// Print the monthly cost of the enabled features.
    Cost,
}

/// Wired-up engine for one invocation.
struct Engine {
    orchestrator: Arc<WriteOrchestrator>,
    admin: SyncAdmin,
    caller: Caller,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose)?;

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let shop = ShopId::new(cli.shop.as_str()).context("Invalid shop id")?;
    let engine = open_engine(
        &data_dir,
        cli.cloud_url.as_deref(),
        cli.cloud_key.as_deref(),
        shop,
    )?;

    match cli.command {
        Commands::Create {
            table,
            data,
            local_only,
        } => cmd_create(&engine, &table, &data, local_only).await,

        Commands::Update {
            table,
            filter,
            changes,
            local_only,
        } => cmd_update(&engine, &table, &filter, &changes, local_only).await,

        Commands::Delete {
            table,
            filter,
            local_only,
        } => cmd_delete(&engine, &table, &filter, local_only).await,

        Commands::BulkCreate {
            table,
            file,
            local_only,
        } => cmd_bulk_create(&engine, &table, &file, local_only).await,

        Commands::Status => print_response(engine.admin.status(&engine.caller).await),
        Commands::Queue => print_response(engine.admin.queue(&engine.caller)),
        Commands::History { limit } => print_response(engine.admin.history(&engine.caller, limit)),
        Commands::Trigger => print_response(engine.admin.trigger(&engine.caller).await),
        Commands::Clear => print_response(engine.admin.clear(&engine.caller)),
        Commands::Enable => cmd_set_enabled(&engine, true).await,
        Commands::Disable => cmd_set_enabled(&engine, false).await,
        Commands::TestConnection => {
            print_response(engine.admin.test_connection(&engine.caller).await)
        }

        Commands::ForceSync { table, filter } => {
            let table = parse_table(&table)?;
            let filter = parse_filter(&filter)?;
            print_response(
                engine
                    .admin
                    .force_sync_record(&engine.caller, &table, &filter)
                    .await,
            )
        }

        Commands::Run => cmd_run(&engine).await,

        Commands::Config { action } => match action {
            ConfigAction::Get => print_response(engine.admin.get_config(&engine.caller)),
            ConfigAction::Set { key, value } => {
                let mut updates = ShopOverride::default();
                updates
                    .set_field(&key, &value)
                    .with_context(|| format!("Invalid value for {}", key))?;
                print_response(engine.admin.put_config(&engine.caller, &updates))
            }
            ConfigAction::Cost => print_response(engine.admin.cost_breakdown(&engine.caller, None)),
        },
    }
}

/// Install the global subscriber; `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool) -> Result<()> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }

    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("Could not determine a data directory")?;
    Ok(base.join("hybridsync"))
}

/// Open the database and wire stores, policy, outbox and orchestrator.
///
/// Global settings come from `SYNC_*` variables, overlaid with what
/// `enable`/`disable`/`config set` stored for the default shop.
fn open_engine(
    data_dir: &Path,
    cloud_url: Option<&str>,
    cloud_key: Option<&str>,
    shop: ShopId,
) -> Result<Engine> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join(DB_FILE);

    let local: Arc<dyn LocalStore> =
        Arc::new(SqliteLocalStore::open(&db_path).context("Failed to open local store")?);
    let journal = Arc::new(SqliteJournal::open(&db_path).context("Failed to open outbox journal")?);
    let policy_store: Arc<dyn PolicyStore> =
        Arc::new(SqlitePolicyStore::open(&db_path).context("Failed to open policy store")?);

    let cloud: Arc<dyn CloudAdapter> = match cloud_url {
        Some(url) => {
            let key = cloud_key.context("--cloud-key is required with --cloud-url")?;
            Arc::new(RestCloudAdapter::new(url, key).context("Invalid cloud URL")?)
        }
        None => {
            warn!("No --cloud-url given, syncing into an in-memory replica (dry run)");
            Arc::new(MemoryCloudAdapter::new())
        }
    };

    let env_policy = SyncPolicy::from_env().context("Invalid SYNC_* configuration")?;
    let global = match policy_store
        .load(&ShopId::default_shop())
        .context("Failed to read stored settings")?
    {
        Some(stored) => env_policy.merged(&stored),
        None => env_policy,
    };
    global.validate().context("Invalid stored settings")?;

    let outbox = Arc::new(
        Outbox::open(cloud.clone(), OutboxConfig::from_policy(&global), journal)
            .context("Failed to restore outbox")?,
    );
    let policy = Arc::new(SyncPolicyProvider::new(global, policy_store, cloud.clone()));
    let orchestrator = Arc::new(WriteOrchestrator::new(local, cloud, outbox, policy));

    info!("Using database {}", db_path.display());
    Ok(Engine {
        admin: SyncAdmin::new(orchestrator.clone()),
        orchestrator,
        caller: Caller::new("cli", Role::Owner, shop),
    })
}

fn write_options(engine: &Engine, local_only: bool) -> WriteOptions {
    WriteOptions {
        shop_id: Some(engine.caller.shop_id.clone()),
        skip_sync: local_only,
    }
}

async fn cmd_create(engine: &Engine, table: &str, data: &str, local_only: bool) -> Result<()> {
    let table = parse_table(table)?;
    let record = parse_record(data)?;
    let stored = engine
        .orchestrator
        .create(&table, record, write_options(engine, local_only))
        .await
        .context("Create failed")?;
    print_json(&stored)
}

async fn cmd_update(
    engine: &Engine,
    table: &str,
    filter: &str,
    changes: &str,
    local_only: bool,
) -> Result<()> {
    let table = parse_table(table)?;
    let filter = parse_filter(filter)?;
    let changes = parse_record(changes)?;
    let updated = engine
        .orchestrator
        .update(&table, changes, filter, write_options(engine, local_only))
        .await
        .context("Update failed")?;
    print_json(&updated)
}

async fn cmd_delete(engine: &Engine, table: &str, filter: &str, local_only: bool) -> Result<()> {
    let table = parse_table(table)?;
    let filter = parse_filter(filter)?;
    let deleted = engine
        .orchestrator
        .delete(&table, filter, write_options(engine, local_only))
        .await
        .context("Delete failed")?;
    print_json(&deleted)
}

async fn cmd_bulk_create(
    engine: &Engine,
    table: &str,
    file: &Path,
    local_only: bool,
) -> Result<()> {
    let table = parse_table(table)?;
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let value: Value = serde_json::from_str(&content).context("Input is not valid JSON")?;
    let Value::Array(items) = value else {
        bail!("Input must be a JSON array of objects");
    };
    let records = items
        .into_iter()
        .map(|item| match item {
            Value::Object(record) => Ok(record),
            _ => bail!("Every array element must be a JSON object"),
        })
        .collect::<Result<Vec<Record>>>()?;

    let stored = engine
        .orchestrator
        .bulk_create(&table, records, write_options(engine, local_only))
        .await
        .context("Bulk create failed")?;
    println!("Created {} records", stored.len());
    Ok(())
}

/// Toggle sync now and remember the choice for later invocations.
async fn cmd_set_enabled(engine: &Engine, enabled: bool) -> Result<()> {
    let response = engine.admin.set_enabled(&engine.caller, enabled).await;
    if response.success {
        engine
            .orchestrator
            .policy()
            .update_shop_config(&ShopId::default_shop(), &ShopOverride::enabled(enabled))
            .context("Failed to store sync setting")?;
    }
    let result = print_response(response);
    engine.orchestrator.shutdown().await;
    result
}

async fn cmd_run(engine: &Engine) -> Result<()> {
    engine
        .orchestrator
        .initialize()
        .await
        .context("Failed to start sync engine")?;
    println!(
        "Processing {} queued operations, press Ctrl+C to stop",
        engine.orchestrator.outbox().pending_count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    engine.orchestrator.shutdown().await;
    let stats = engine.orchestrator.outbox().stats();
    println!(
        "Stopped: {} synced, {} failed, {} still queued",
        stats.total_processed, stats.total_failed, stats.queue_size
    );
    Ok(())
}

fn parse_table(name: &str) -> Result<TableName> {
    TableName::new(name).with_context(|| format!("Invalid table name: {}", name))
}

fn parse_record(json: &str) -> Result<Record> {
    match serde_json::from_str::<Value>(json).context("Record is not valid JSON")? {
        Value::Object(record) => Ok(record),
        _ => bail!("Record must be a JSON object"),
    }
}

fn parse_filter(json: &str) -> Result<RecordFilter> {
    let value: Value = serde_json::from_str(json).context("Filter is not valid JSON")?;
    RecordFilter::from_json(value).context("Invalid filter")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the envelope and turn a failed call into a non-zero exit.
fn print_response<T: Serialize>(response: ApiResponse<T>) -> Result<()> {
    if !response.success {
        bail!(response
            .error
            .unwrap_or_else(|| "request failed".to_string()));
    }
    if let Some(message) = &response.message {
        info!("{}", message);
    }
    match &response.data {
        Some(data) => print_json(data),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hybridsync",
            "create",
            "--table",
            "customers",
            "--data",
            r#"{"name":"Ada"}"#,
            "--shop",
            "s1",
            "--data-dir",
            "/tmp/hs",
        ])
        .unwrap();

        assert_eq!(cli.shop, "s1");
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/hs")));
        assert!(matches!(cli.command, Commands::Create { local_only: false, .. }));
    }

    #[test]
    fn test_config_set_parses() {
        let cli = Cli::try_parse_from(["hybridsync", "config", "set", "batchSize", "20"]).unwrap();
        match cli.command {
            Commands::Config {
                action: ConfigAction::Set { key, value },
            } => {
                assert_eq!(key, "batchSize");
                assert_eq!(value, "20");
            }
            _ => panic!("expected config set"),
        }
    }

    #[test]
    fn test_parse_record_and_filter() {
        let record = parse_record(r#"{"id":"c1","name":"Ada"}"#).unwrap();
        assert_eq!(record["name"], "Ada");
        assert!(parse_record("[1,2]").is_err());

        let filter = parse_filter(r#"{"id":"c1"}"#).unwrap();
        assert!(filter.matches(&record));
        assert!(parse_table("bad name!").is_err());
    }

    #[tokio::test]
    async fn test_engine_round_trip_on_disk() {
        let temp = tempfile::TempDir::new().unwrap();
        let shop = ShopId::new("s1").unwrap();

        {
            let engine = open_engine(temp.path(), None, None, shop.clone()).unwrap();
            engine
                .orchestrator
                .policy()
                .update_shop_config(&ShopId::default_shop(), &ShopOverride::enabled(true))
                .unwrap();
        }

        let engine = open_engine(temp.path(), None, None, shop.clone()).unwrap();
        assert!(engine.orchestrator.is_enabled());
        cmd_create(&engine, "customers", r#"{"id":"c1"}"#, false)
            .await
            .unwrap();
        assert_eq!(engine.orchestrator.outbox().pending_count(), 1);
        drop(engine);

        let engine = open_engine(temp.path(), None, None, shop).unwrap();
        assert_eq!(engine.orchestrator.outbox().pending_count(), 1);
        let report = engine.admin.trigger(&engine.caller).await.data.unwrap();
        assert_eq!(report.processed, 1);
    }
}
