//! twophase maintenance host
//!
//! - `inspect --log-dir DIR` prints the entries of one transaction log folder
//! - `demo` wires a coordinator over two in-memory participants, commits a sample
//!   transaction and keeps recovering and sweeping until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{error, info};
use serde_json::json;

use twophase::types::from_epoch_millis;
use twophase::{
    Coordinator, FileTransactionLog, MemoryStore, Participant, SessionTokenProvider,
    TransactionConfig, TransactionLogStore, TransactionParticipant, TransactionSession,
};

/// Every non-empty token is a valid session; "system" acts as admin
struct DemoSessions;

impl SessionTokenProvider for DemoSessions {
    fn is_valid(&self, session_token: &str) -> bool {
        !session_token.is_empty()
    }

    fn is_admin_or_system(&self, session_token: &str) -> bool {
        session_token == "system"
    }
}

type MemoryParticipant = Participant<MemoryStore, MemoryStore>;

fn print_help() {
    println!("twophase - two-phase commit coordinator and participants");
    println!();
    println!("Usage: twophase <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  inspect               List the entries of a transaction log folder");
    println!("  demo                  Run a coordinator over two in-memory participants");
    println!();
    println!("Options:");
    println!("  -l, --log-dir DIR     Transaction log folder (default: ./transaction-logs)");
    println!("  -c, --config FILE     JSON configuration file (demo)");
    println!("  -i, --interval SECS   Seconds between recovery and sweep runs (demo, default: 5)");
    println!("  -h, --help            Show this help");
}

fn inspect(log_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let folder = log_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or("Log directory must name a folder")?
        .to_string();
    let root = log_dir
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let log = FileTransactionLog::open(&root, &folder)?;
    let entries = log.list_all()?;
    println!("{} entries in {}", entries.len(), log.folder().display());
    for entry in entries {
        let participants = entry
            .participant_ids
            .map(|ids| ids.into_iter().collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        let idle = SystemTime::now()
            .duration_since(from_epoch_millis(entry.last_accessed))
            .unwrap_or_default();
        println!(
            "{}  {:<18} two_phase={:<5} idle={}s {}",
            entry.transaction_id,
            entry.transaction_status,
            entry.two_phase_transaction,
            idle.as_secs(),
            participants
        );
    }
    Ok(())
}

fn memory_participant(
    participant_id: &str,
    config: &TransactionConfig,
) -> twophase::Result<Arc<MemoryParticipant>> {
    let store = Arc::new(MemoryStore::new());
    let participant = Participant::with_file_log(
        participant_id,
        config.clone(),
        Arc::new(DemoSessions),
        Arc::clone(&store),
        store,
    )?;
    Ok(Arc::new(participant))
}

/// One recovery and sweep pass over every node
fn maintain(coordinator: &Coordinator, participants: &[Arc<MemoryParticipant>]) {
    for participant in participants {
        if let Err(e) = participant.recover() {
            error!("Recovery of participant '{}' failed: {}", participant.participant_id(), e);
        }
        participant.sweep();
    }
    if let Err(e) = coordinator.recover() {
        error!("Recovery of coordinator failed: {}", e);
    }
    coordinator.sweep();
}

async fn demo(config: TransactionConfig, interval: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let orders = memory_participant("orders", &config)?;
    let stock = memory_participant("stock", &config)?;
    let participants = vec![Arc::clone(&orders), Arc::clone(&stock)];

    let coordinator = Arc::new(Coordinator::with_file_log(
        config.clone(),
        Arc::new(DemoSessions),
        participants
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn TransactionParticipant>)
            .collect(),
    )?);

    maintain(&coordinator, &participants);

    let session = TransactionSession::new(
        Arc::clone(&coordinator) as Arc<dyn twophase::TransactionCoordinator>,
        "demo-user",
        config.interactive_session_key.clone(),
    );
    let transaction_id = session.begin()?;
    info!("Demo transaction '{}' started", transaction_id);
    session.execute("orders", "put", &[json!("order-1"), json!({"item": "widget", "qty": 2})])?;
    session.execute("stock", "put", &[json!("widget"), json!(98)])?;
    session.commit()?;

    info!("orders: {}", serde_json::to_string(&orders.resource().snapshot())?);
    info!("stock: {}", serde_json::to_string(&stock.resource().snapshot())?);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let coordinator = Arc::clone(&coordinator);
                let participants = participants.clone();
                // Recovery waits on transaction gates; keep it off the async workers
                tokio::task::spawn_blocking(move || maintain(&coordinator, &participants)).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut command = None;
    let mut log_dir = PathBuf::from("transaction-logs");
    let mut config_file = None;
    let mut interval = Duration::from_secs(5);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--log-dir" | "-l" => {
                if i + 1 < args.len() {
                    log_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--interval" | "-i" => {
                if i + 1 < args.len() {
                    interval = Duration::from_secs(args[i + 1].parse::<u64>()?.max(1));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if command.is_none() => command = Some(other.to_string()),
            other => {
                eprintln!("Unexpected argument '{}'", other);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    match command.as_deref() {
        Some("inspect") => inspect(log_dir),
        Some("demo") => {
            let config = match config_file {
                Some(path) => TransactionConfig::from_file(path)?,
                None => TransactionConfig {
                    log_folder: log_dir,
                    ..TransactionConfig::short_lived("demo-coordinator-key", "demo-interactive-key")
                },
            };
            info!("Starting twophase demo, logs in {}", config.log_folder.display());
            demo(config, interval).await
        }
        _ => {
            print_help();
            Ok(())
        }
    }
}
