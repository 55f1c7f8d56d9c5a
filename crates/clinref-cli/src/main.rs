use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clinref_api::ReferenceApi;
use clinref_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::json;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "clinref")]
#[command(about = "Citation reference resolution CLI")]
struct Cli {
    #[arg(long, default_value = "./clinref.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Reference {
        #[command(subcommand)]
        command: ReferenceCommand,
    },
    Rewrite(RewriteArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum ReferenceCommand {
    Resolve(ResolveArgs),
    BatchResolve(BatchResolveArgs),
    ByMessage(ByMessageArgs),
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    doctor: String,
}

#[derive(Debug, Args)]
struct BatchResolveArgs {
    /// Comma-separated reference ids.
    #[arg(long)]
    ids: String,
    #[arg(long)]
    doctor: String,
}

#[derive(Debug, Args)]
struct ByMessageArgs {
    #[arg(long)]
    message: String,
}

#[derive(Debug, Args)]
struct RewriteArgs {
    /// Raw search-provider text carrying numeric citations.
    #[arg(long)]
    text: String,
    /// Structured citation URLs; overrides the footer parse when given.
    #[arg(long = "citation")]
    citations: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Db { command } => run_db_command(&cli.db, &command),
        Command::Reference { command } => run_reference_command(&cli.db, &command),
        Command::Rewrite(args) => run_rewrite(&cli.db, &args),
    }
}

fn run_db_command(db: &Path, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqliteStore::open(db)?;
            print_output(&store.schema_status()?)
        }
        DbCommand::Migrate(args) => {
            let mut store = SqliteStore::open(db)?;
            let before = store.schema_status()?;
            if args.dry_run {
                return print_output(&json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions,
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            print_output(&json!({
                "dry_run": false,
                "current_version": before.current_version,
                "target_version": before.target_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty(),
            }))
        }
    }
}

fn run_reference_command(db: &Path, command: &ReferenceCommand) -> Result<()> {
    let api = ReferenceApi::new(db.to_path_buf());
    match command {
        ReferenceCommand::Resolve(args) => {
            let resolved = api.resolve(&args.id, &args.doctor)?;
            print_output(&resolved)
        }
        ReferenceCommand::BatchResolve(args) => {
            let reference_ids: Vec<String> =
                args.ids.split(',').map(str::to_string).collect();
            let batch = api.resolve_batch(&reference_ids, &args.doctor)?;
            print_output(&batch)
        }
        ReferenceCommand::ByMessage(args) => {
            let message_references = api.references_for_message(&args.message)?;
            print_output(&message_references)
        }
    }
}

fn run_rewrite(db: &Path, args: &RewriteArgs) -> Result<()> {
    let api = ReferenceApi::new(db.to_path_buf());
    let structured = if args.citations.is_empty() { None } else { Some(args.citations.as_slice()) };
    let (rewritten, reference_ids) = api.rewrite_search_response(&args.text, structured)?;
    print_output(&json!({
        "rewritten": rewritten,
        "reference_ids": reference_ids,
    }))
}

fn print_output<T: Serialize>(data: &T) -> Result<()> {
    let envelope = json!({
        "cli_contract_version": CLI_CONTRACT_VERSION,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
