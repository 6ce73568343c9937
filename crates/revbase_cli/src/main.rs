//! Inspection and maintenance binary.
//!
//! # Responsibility
//! - Open a revbase database from a SQLite file or a JSON config file.
//! - Print revisions, catalog entries and collection rows as JSON lines.
//! - Run rollbacks of versioned collections.

use clap::{Parser, Subcommand};
use log::error;
use revbase_core::{
    AnyBackend, CatalogEntry, Collection, CollectionOptions, CoreError, CoreResult, Database,
    DatabaseConfig, Query, Record, RevisionSequencer, RollbackRequest, StoreUrl, Value,
    VersionedCollection,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "revbase", version, about = "Inspect and maintain revbase databases")]
struct Cli {
    /// SQLite database file.
    #[arg(long, short, conflicts_with = "config")]
    database: Option<PathBuf>,

    /// JSON file holding a database configuration.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the latest committed revision.
    Revision,
    /// List registered collections.
    Collections,
    /// Print the current rows of a collection.
    Current {
        collection: String,
        /// Print the rows valid at this revision instead.
        #[arg(long)]
        as_of: Option<i64>,
    },
    /// Print every stored interval of a versioned collection, newest first.
    History { collection: String },
    /// Print the audit trail of a collection.
    Audit { collection: String },
    /// Restore a versioned collection to its state at `revision`.
    Rollback { collection: String, revision: i64 },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_command module=cli status=error error_code={}", err.code());
            eprintln!("error [{}]: {err}", err.code());
            ExitCode::FAILURE
        }
    }
}

fn open(cli: &Cli) -> CoreResult<Database> {
    match (&cli.database, &cli.config) {
        (Some(path), _) => Database::open(&StoreUrl::SqliteFile(path.clone())),
        (None, Some(path)) => {
            let json = std::fs::read_to_string(path).map_err(|err| {
                CoreError::InvalidData(format!("cannot read `{}`: {err}", path.display()))
            })?;
            Database::from_config(&DatabaseConfig::from_json(&json)?)
        }
        (None, None) => Err(CoreError::InvalidUrl(
            "A database connection URL must be provided.".to_string(),
        )),
    }
}

fn run(cli: &Cli) -> CoreResult<()> {
    let database = open(cli)?;
    match &cli.command {
        Command::Revision => print_line(&Value::from(database.current_revision()?)),
        Command::Collections => {
            for entry in database.collections()? {
                print_line(&serde_json::json!({
                    "name": entry.schema.name(),
                    "versioned": entry.versioned,
                    "audited": entry.audited,
                    "fields": entry.schema.fields(),
                }))?;
            }
            Ok(())
        }
        Command::Current { collection, as_of } => {
            let rows = match as_of {
                Some(revision) => {
                    versioned(&database, collection)?.get_as_of(*revision, &Query::all())?
                }
                None if catalog_entry(&database, collection)?.versioned => {
                    versioned(&database, collection)?.get(&Query::all())?
                }
                None => plain(&database, collection)?.get(&Query::all())?,
            };
            print_rows(rows)
        }
        Command::History { collection } => {
            print_rows(versioned(&database, collection)?.get_history(&Query::all())?)
        }
        Command::Audit { collection } => {
            let entries = if catalog_entry(&database, collection)?.versioned {
                versioned(&database, collection)?.get_audit(&Query::all())?
            } else {
                plain(&database, collection)?.get_audit(&Query::all())?
            };
            print_rows(entries.iter().map(|entry| entry.to_record()).collect())
        }
        Command::Rollback {
            collection,
            revision,
        } => {
            let changed =
                versioned(&database, collection)?.rollback(&RollbackRequest::new(*revision))?;
            print_line(&serde_json::json!({ "collection": collection, "changed": changed }))
        }
    }
}

fn catalog_entry(database: &Database, name: &str) -> CoreResult<CatalogEntry> {
    database
        .collections()?
        .into_iter()
        .find(|entry| entry.schema.name() == name)
        .ok_or_else(|| CoreError::Schema(format!("unknown collection `{name}`")))
}

fn options(entry: &CatalogEntry) -> CollectionOptions {
    if entry.audited {
        CollectionOptions::audited()
    } else {
        CollectionOptions::default()
    }
}

fn versioned(database: &Database, name: &str) -> CoreResult<VersionedCollection<AnyBackend>> {
    let entry = catalog_entry(database, name)?;
    if !entry.versioned {
        return Err(CoreError::Schema(format!("collection `{name}` is not versioned")));
    }
    let options = options(&entry);
    database.versioned(entry.schema, options)
}

fn plain(database: &Database, name: &str) -> CoreResult<Collection<AnyBackend>> {
    let entry = catalog_entry(database, name)?;
    let options = options(&entry);
    database.collection(entry.schema, options)
}

fn print_rows(rows: Vec<Record>) -> CoreResult<()> {
    for row in rows {
        print_line(&Value::Object(row))?;
    }
    Ok(())
}

fn print_line(value: &Value) -> CoreResult<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
