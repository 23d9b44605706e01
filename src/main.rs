use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use tundradb::common::types::{LockMode, PageId};
use tundradb::transaction::wal::{LogManager, LogManagerConfig};
use tundradb::{Engine, EngineConfig, IsolationLevel, MemoryTable, PageType};

#[derive(Parser)]
#[command(name = "tundradb", about = "Page cache and MVCC transaction engine")]
struct Cli {
    /// JSON engine configuration; missing fields take defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a small concurrent workload and print cache and transaction statistics
    Demo {
        /// Directory for the log and the tablespace
        #[arg(long, default_value = "tundra-demo")]
        dir: PathBuf,

        #[arg(long, default_value_t = 4)]
        sessions: u32,

        /// Transactions per session
        #[arg(long, default_value_t = 50)]
        transactions: u32,
    },
    /// List prepared transactions that have no outcome in a log directory
    InDoubt {
        /// Directory holding the log file
        #[arg(long)]
        log_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Demo {
            dir,
            sessions,
            transactions,
        } => run_demo(config, dir, sessions, transactions),
        Command::InDoubt { log_dir } => list_in_doubt(log_dir),
    }
}

fn run_demo(config: EngineConfig, dir: PathBuf, sessions: u32, transactions: u32) -> Result<()> {
    let engine = Engine::open(config, &dir)?;
    engine.add_tablespace(1, dir.join("demo.tbs"))?;
    let table = Arc::new(MemoryTable::new(1));
    let started = Instant::now();

    let outcomes = crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = (0..sessions)
            .map(|session| {
                let engine = &engine;
                let table = &table;
                scope.spawn(move |_| run_session(engine, table, session, transactions))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|_| Err(anyhow!("a demo session panicked"))))
            .collect::<Vec<_>>()
    })
    .map_err(|_| anyhow!("a demo session panicked"))?;
    for outcome in outcomes {
        outcome?;
    }

    let checkpoint = engine.checkpoint()?;
    println!("workload finished in {:?}, checkpoint at lsn {}", started.elapsed(), checkpoint);
    println!("cache: {}", serde_json::to_string_pretty(&engine.cache().stats())?);
    println!("transactions: {}", serde_json::to_string_pretty(&engine.transactions().summary())?);
    println!("table cardinality: {}", table.cardinality());
    engine.shutdown()?;
    Ok(())
}

/// Each transaction writes two pages, the second ordered before the first,
/// and one row version
fn run_session(engine: &Engine, table: &Arc<MemoryTable>, session: u32, transactions: u32) -> Result<()> {
    for i in 0..transactions {
        let mut txn = engine.transactions().begin(IsolationLevel::RepeatableRead)?;
        let base = (session * transactions + i) * 2;
        let follow = PageId::new(1, base + 1);
        {
            let mut guard = engine.cache().allocate_fresh(follow, PageType::Data, txn.id())?;
            guard.body_mut()?[..4].copy_from_slice(&i.to_le_bytes());
        }
        {
            let mut guard = engine.cache().allocate_fresh(PageId::new(1, base), PageType::Data, txn.id())?;
            guard.body_mut()?[..4].copy_from_slice(&session.to_le_bytes());
            engine.cache().add_precedence(&guard, follow.page_number)?;
        }

        let record_number = session * 1_000 + i % 10;
        table.store(&mut txn, record_number, format!("session {} txn {}", session, i).into_bytes())?;
        txn.commit()?;

        if let Some(guard) = engine.cache().probe(follow, LockMode::Shared)? {
            log::debug!("page {} is still cached, dirty: {}", guard.page_id(), guard.is_dirty());
        }
    }
    Ok(())
}

fn list_in_doubt(log_dir: PathBuf) -> Result<()> {
    let log = LogManager::new(LogManagerConfig::in_dir(log_dir))?;
    let in_doubt = log.in_doubt_transactions()?;
    if in_doubt.is_empty() {
        println!("no prepared transactions without an outcome");
    }
    for txn in in_doubt {
        println!("txn {:>8}  xid {}  prepared at lsn {}", txn.txn_id, hex::encode(&txn.xid), txn.prepare_lsn);
    }
    Ok(())
}
