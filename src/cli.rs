//! Command-line surface: open, inspect, and drive a bus from a terminal.
//!
//! Grounded on `original_source/CCshm/CCshm.cxx` (`--init`, `--dump`,
//! `--init-locks`, `--post`, `--many` flag handling and the producer/consumer
//! loop it drives), matching the shape of a single binary playing both roles
//! depending on flags.

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::Parser;

use crate::bus::EventBus;
use crate::error::Result;
use crate::shm::{self, SharedMem};

/// Open, post to, or inspect a shared-memory event bus.
#[derive(Parser, Debug)]
#[command(name = "shm-eventbus", version, about)]
pub struct Cli {
    /// Path used to derive the bus's IPC keys (via ftok); need not exist as
    /// a bus, but must exist as a file.
    #[arg(long)]
    pub path: PathBuf,

    /// Number of fixed-width slots. 0 selects variable-width mode.
    #[arg(long, default_value_t = 0)]
    pub items: u64,

    /// Per-slot payload size (fixed-width mode) or total ring size
    /// (variable-width mode). Required the first time a bus is created.
    #[arg(long, default_value_t = 0)]
    pub size: u64,

    /// Force re-creation of the segment and its lock semaphores even if the
    /// bus already exists. Destructive: any unread data is lost.
    #[arg(long)]
    pub init: bool,

    /// Reinitialize only the RW-lock semaphores, then dump and exit.
    #[arg(long)]
    pub init_locks: bool,

    /// Print semaphore state and exit without posting or consuming.
    #[arg(long)]
    pub dump: bool,

    /// Remove the bus's kernel objects (shared memory + semaphores) and
    /// exit. Refuses to run alongside any other flag.
    #[arg(long, conflicts_with_all = ["items", "size", "init", "init_locks", "dump", "post", "many"])]
    pub rm: bool,

    /// Post lines read from stdin instead of the canned demo payloads.
    #[arg(long)]
    pub post: bool,

    /// Batch posts through `post_many` instead of one `post` per line.
    #[arg(long)]
    pub many: bool,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.rm {
        return run_rm(&cli);
    }

    let bus = Arc::new(if cli.init {
        EventBus::reinit_path(&cli.path, cli.items, cli.size)?
    } else {
        EventBus::open_path(&cli.path, cli.items, cli.size)?
    });

    if cli.init_locks {
        bus.init_locks()?;
    }

    if cli.init_locks || cli.dump {
        bus.dump();
        // No receiver thread has been spawned yet, so this handle is still
        // the only owner: release it explicitly instead of leaving it to
        // the process's exit.
        if let Ok(owned) = Arc::try_unwrap(bus) {
            owned.close();
        }
        return Ok(());
    }

    let reader = Arc::clone(&bus);
    let many = cli.many;
    let receiver = thread::spawn(move || run_receiver(&reader, many));

    if cli.post {
        post_demo_payloads(&bus);
    } else {
        post_from_stdin(&bus)?;
    }

    // The receiver thread blocks forever on `get`/`get_many`; for a CLI
    // invocation there is no clean way to unblock it from here, so we let
    // the process exit underneath it once the writer side is done.
    drop(receiver);
    Ok(())
}

fn run_rm(cli: &Cli) -> Result<()> {
    let (sem_key, shm_key) = shm::derive_keys(&cli.path)?;
    SharedMem::destroy(shm_key)?;
    remove_semaphore_group(sem_key)?;
    println!("removed bus resources derived from {}", cli.path.display());
    Ok(())
}

fn remove_semaphore_group(key: libc::key_t) -> Result<()> {
    let id = unsafe { libc::semget(key, 0, 0) };
    if id < 0 {
        return Err(crate::error::BusError::Io(io::Error::last_os_error()));
    }
    if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } != 0 {
        return Err(crate::error::BusError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn run_receiver(bus: &Arc<EventBus>, many: bool) {
    let stdout = io::stdout();
    loop {
        if many {
            for msg in bus.get_many() {
                let mut out = stdout.lock();
                let _ = out.write_all(&msg);
            }
        } else {
            let msg = bus.get();
            let mut out = stdout.lock();
            let _ = out.write_all(&msg);
        }
    }
}

fn post_demo_payloads(bus: &Arc<EventBus>) {
    let pid = std::process::id();
    for i in 0..100 {
        let payload = format!("{pid}: demo message {i}\n");
        if !bus.post(payload.as_bytes()) {
            tracing::warn!(i, "demo post rejected");
        }
    }

    println!("posting-many");
    let batch: Vec<String> = (0..100).map(|i| format!("{pid}: demo message {i} | many\n")).collect();
    let refs: Vec<&[u8]> = batch.iter().map(String::as_bytes).collect();
    if !bus.post_many(&refs) {
        tracing::warn!("demo batch was rejected");
    }
}

fn post_from_stdin(bus: &Arc<EventBus>) -> Result<()> {
    let pid = std::process::id();
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.map_err(crate::error::BusError::Io)?;
        let payload = format!("{pid}: {line}\n");
        if !bus.post(payload.as_bytes()) {
            tracing::warn!(%line, "post rejected");
        }
    }
    Ok(())
}
