//! `devstate`: command-line front end for the DevState engine.
//!
//! Configuration comes from the environment (`HMAC_SECRET`,
//! `DEVSTATE_SCHEMA`, `DEVSTATE_DB`, ...). Every command prints one JSON
//! document to stdout. Failures print `{"error": kind, "message": ...}` to
//! stderr and exit non-zero. Logs go to stderr, filtered by `RUST_LOG`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use devstate_engine::core::{now_millis, Action, EntryDraft, LockId, SigningSecret};
use devstate_engine::store::DEFAULT_SEARCH_LIMIT;
use devstate_engine::{Engine, EngineConfig, EngineError, EntryFilter, ErrorKind};

#[derive(Parser, Debug)]
#[command(name = "devstate")]
#[command(about = "Shared state document and tamper-evident ledger", long_about = None)]
#[command(version)]
struct Cli {
    /// Actor recorded on ledger entries
    #[arg(long, global = true, env = "DEVSTATE_ACTOR", default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the state document
    GetState,

    /// Provision the state document (once)
    Seed {
        /// Initial document, as a JSON object
        json: String,
    },

    /// Patch the state document by top-level key replacement
    Update {
        /// Patch, as a JSON object
        patch: String,
    },

    /// Append an entry to the ledger
    Append {
        /// Action name
        action: String,

        /// Checkpoint the change starts from
        #[arg(long)]
        cp_from: Option<String>,

        /// Checkpoint the change ends at
        #[arg(long)]
        cp_to: Option<String>,

        /// Extra metadata, as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Mark a ledger entry as deleted
    Tombstone {
        /// Id of the entry to tombstone
        id: u64,
    },

    /// Print one ledger entry
    GetEntry {
        id: u64,
    },

    /// Search the ledger, newest first
    Search {
        /// Only entries by this actor
        #[arg(long = "by")]
        by: Option<String>,

        #[arg(long)]
        action: Option<String>,

        /// Earliest timestamp, Unix milliseconds
        #[arg(long)]
        since: Option<i64>,

        /// Latest timestamp, Unix milliseconds
        #[arg(long)]
        until: Option<i64>,

        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,

        /// Leave out tombstoned entries
        #[arg(long)]
        hide_tombstoned: bool,
    },

    /// Verify the ledger chain
    Verify {
        /// Only check the last N entries (0 checks everything)
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Verify the archived segment and its link to the live ledger
    VerifyArchive,

    /// Write state.json and history.json under the export root
    Export,

    /// Replace state and ledger from exported artifacts
    Import {
        /// Directory holding the artifacts (defaults to the export root)
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Take an advisory lease
    Lock {
        /// Scope the lease covers
        scope: String,

        /// Lease lifetime in seconds
        #[arg(long, default_value_t = 300)]
        ttl: u64,
    },

    /// Release a lease
    Unlock {
        lock_id: String,
    },

    /// List unexpired leases
    Locks {
        #[arg(long)]
        scope: Option<String>,
    },

    /// Delete expired leases
    CleanupLocks,

    /// Make a new signing key active
    RotateKey {
        /// Id of the new key
        #[arg(long)]
        id: String,

        /// Secret of the new key
        #[arg(long, env = "DEVSTATE_NEW_SECRET", hide_env_values = true)]
        secret: String,
    },

    /// Move old ledger entries to cold storage
    Archive {
        /// Archive entries older than this Unix millisecond timestamp
        #[arg(long, conflicts_with = "older_than_days")]
        before: Option<i64>,

        /// Archive entries older than this many days
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// List signing keys (ids and fingerprints only)
    Keys,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => report(&e.into()),
        },
        Err(e) => report(&e),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Print `{error, message}` to stderr.
fn report(err: &anyhow::Error) -> ExitCode {
    let kind = err
        .downcast_ref::<EngineError>()
        .map(EngineError::kind)
        .unwrap_or(ErrorKind::Storage);
    let body = json!({
        "error": kind,
        "message": format!("{:#}", err),
    });
    eprintln!("{}", body);
    ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<Value> {
    let config = EngineConfig::from_env()?;
    debug!(db = %config.db_path.display(), key_id = %config.key_id, "opening engine");
    let engine = Engine::from_config(&config).await?;
    let actor = cli.actor.as_str();

    match cli.command {
        Command::GetState => to_json(engine.get().await?),
        Command::Seed { json } => to_json(engine.seed(parse_json(&json)?, actor).await?),
        Command::Update { patch } => to_json(engine.update(parse_json(&patch)?, actor).await?),
        Command::Append {
            action,
            cp_from,
            cp_to,
            metadata,
        } => {
            let mut draft = EntryDraft::new(actor, action).checkpoints(cp_from, cp_to);
            if let Some(metadata) = metadata {
                draft = draft.metadata(parse_object(&metadata)?);
            }
            to_json(engine.append(draft).await?)
        }
        Command::Tombstone { id } => to_json(engine.tombstone(id, actor).await?),
        Command::GetEntry { id } => to_json(engine.get_entry(id).await?),
        Command::Search {
            by,
            action,
            since,
            until,
            limit,
            hide_tombstoned,
        } => {
            let filter = EntryFilter {
                actor: by,
                action: action.map(Action::from),
                since,
                until,
                limit,
                hide_tombstoned,
            };
            to_json(engine.search(&filter).await?)
        }
        Command::Verify { limit } => to_json(engine.verify(limit).await?),
        Command::VerifyArchive => to_json(engine.verify_archive().await?),
        Command::Export => to_json(engine.export_files().await?),
        Command::Import { from } => match from {
            Some(root) => to_json(engine.import_from(&root).await?),
            None => to_json(engine.import_files().await?),
        },
        Command::Lock { scope, ttl } => {
            to_json(engine.acquire(&scope, Duration::from_secs(ttl), actor).await?)
        }
        Command::Unlock { lock_id } => {
            let lock_id = LockId::from(lock_id);
            engine.release(&lock_id).await?;
            Ok(json!({ "released": lock_id }))
        }
        Command::Locks { scope } => to_json(engine.locks(scope.as_deref()).await?),
        Command::CleanupLocks => Ok(json!({ "removed": engine.cleanup().await? })),
        Command::RotateKey { id, secret } => {
            let secret: SigningSecret = secret
                .parse()
                .map_err(|e| EngineError::validation(format!("new secret: {}", e)))?;
            to_json(engine.rotate_key(&id, secret, actor).await?)
        }
        Command::Archive {
            before,
            older_than_days,
        } => {
            let cutoff = archive_cutoff(before, older_than_days)?;
            to_json(engine.archive(cutoff, actor).await?)
        }
        Command::Keys => to_json(engine.keys()),
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Parse a JSON argument. Malformed input is a validation error.
fn parse_json(text: &str) -> Result<Value, EngineError> {
    serde_json::from_str(text).map_err(|e| EngineError::validation(format!("invalid JSON: {}", e)))
}

fn parse_object(text: &str) -> Result<Map<String, Value>, EngineError> {
    match parse_json(text)? {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::validation("metadata must be a JSON object")),
    }
}

fn archive_cutoff(before: Option<i64>, older_than_days: Option<u32>) -> Result<i64, EngineError> {
    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    match (before, older_than_days) {
        (Some(cutoff), _) => Ok(cutoff),
        (None, Some(days)) => Ok(now_millis().saturating_sub(i64::from(days) * DAY_MS)),
        (None, None) => Err(EngineError::validation(
            "archive needs --before or --older-than-days",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["devstate", "verify", "--limit", "10"]).unwrap();
        assert!(matches!(cli.command, Command::Verify { limit: 10 }));

        let cli = Cli::try_parse_from(["devstate", "--actor", "ops", "tombstone", "5"]).unwrap();
        assert_eq!(cli.actor, "ops");
        assert!(matches!(cli.command, Command::Tombstone { id: 5 }));

        let cli = Cli::try_parse_from(["devstate", "lock", "deploy", "--ttl", "60"]).unwrap();
        assert!(matches!(cli.command, Command::Lock { ref scope, ttl: 60 } if scope == "deploy"));

        let cli = Cli::try_parse_from(["devstate", "search", "--by", "bot", "--hide-tombstoned"]).unwrap();
        assert!(matches!(cli.command, Command::Search { by: Some(_), hide_tombstoned: true, .. }));
    }

    #[test]
    fn test_parse_json_arguments() {
        assert_eq!(parse_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
        assert_eq!(parse_json("{").unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(parse_object("[1]").unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_archive_cutoff() {
        assert_eq!(archive_cutoff(Some(42), None).unwrap(), 42);
        assert!(archive_cutoff(None, Some(1)).unwrap() < now_millis());
        assert_eq!(archive_cutoff(None, None).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_error_report_kind() {
        let err: anyhow::Error = EngineError::NotFound("state document".into()).into();
        assert_eq!(
            err.downcast_ref::<EngineError>().map(EngineError::kind),
            Some(ErrorKind::NotFound)
        );
    }
}
