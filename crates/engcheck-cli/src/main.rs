// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `engcheck` command line.
//!
//! ```text
//! engcheck monitor        [--socket PATH] [--category NAME]...
//! engcheck replay         FILE [--query TEXT] [--interval SECS] [--json]
//! engcheck checklist      --project NAME [--standards FILE] [--json]
//! engcheck check-document --project NAME [--standards FILE] DOCUMENT [--json]
//! ```
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

// The CLI is expected to print to stdout/stderr.
#![allow(clippy::print_stdout, clippy::print_stderr)]

mod output;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use engcheck_app_core::config::{ConfigService, Setting};
use engcheck_app_core::settings::MonitorSettings;
use engcheck_client::{BackoffPolicy, ConnectionManager, ManagerConfig, UnixTransport};
use engcheck_config_fs::FsConfigStore;
use engcheck_core::standards::{check_document, findings_to_events, generate_checklist, load_standards, EventStamp};
use engcheck_core::{Reconciler, ReconcilerConfig};
use engcheck_proto::{default_socket_path, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use output::Format;

#[derive(Parser, Debug)]
#[command(name = "engcheck", version, about = "Live compliance-event reconciliation")]
struct Cli {
    /// Directory holding `monitor.json` (defaults to the platform config dir)
    #[arg(long, global = true, env = "ENGCHECK_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live stream until interrupted, then print the store
    Monitor {
        /// Producer socket (overrides the saved setting)
        #[arg(long, env = "ENGCHECK_SOCKET")]
        socket: Option<PathBuf>,
        /// Category filter (repeatable; overrides the saved setting)
        #[arg(long = "category")]
        categories: Vec<String>,
    },
    /// Feed a JSON-lines event log through the reconciler
    Replay {
        /// One event object per line
        file: PathBuf,
        /// Fuzzy query to run against the final store
        #[arg(long)]
        query: Option<String>,
        /// Print a status series with this interval (seconds)
        #[arg(long)]
        interval: Option<i64>,
        /// Emit JSON instead of tables
        #[arg(long)]
        json: bool,
    },
    /// List the standards that apply to a project type
    #[command(alias = "generate-checklist")]
    Checklist {
        /// Project type (e.g. electrical)
        #[arg(long)]
        project: String,
        /// Standards catalogue (JSON array)
        #[arg(long, env = "ENGCHECK_STANDARDS", default_value = "standards/standards.json")]
        standards: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check a plain-text document against a project's checklist
    CheckDocument {
        /// Project type (e.g. electrical)
        #[arg(long)]
        project: String,
        /// Standards catalogue (JSON array)
        #[arg(long, env = "ENGCHECK_STANDARDS", default_value = "standards/standards.json")]
        standards: PathBuf,
        /// Document to check
        document: PathBuf,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Monitor { socket, categories } => {
            let settings = load_settings(cli.config_dir.as_deref(), socket, categories)?;
            monitor(settings).await
        }
        Command::Replay {
            file,
            query,
            interval,
            json,
        } => replay(&file, query.as_deref(), interval, Format::from_flag(json)),
        Command::Checklist {
            project,
            standards,
            json,
        } => {
            let standards = load_standards(&standards)?;
            let checklist = generate_checklist(&standards, &project);
            output::checklist(&project, &checklist, Format::from_flag(json))
        }
        Command::CheckDocument {
            project,
            standards,
            document,
            json,
        } => check(&project, &standards, &document, Format::from_flag(json)),
    }
}

/// Saved settings, defaults persisted on first run, then flag overrides.
fn load_settings(
    config_dir: Option<&Path>,
    socket: Option<PathBuf>,
    categories: Vec<String>,
) -> Result<MonitorSettings> {
    let store = match config_dir {
        Some(dir) => FsConfigStore::at(dir),
        None => FsConfigStore::new(),
    }
    .context("open config store")?;
    let service = ConfigService::new(store);
    let mut settings: MonitorSettings = service
        .load_or_init()
        .with_context(|| format!("load settings from {}", service.store().base().display()))?;
    if socket.is_some() {
        settings.socket_path = socket;
    }
    if !categories.is_empty() {
        settings.categories = categories;
    }
    Ok(settings.checked()?)
}

fn reconciler_config(settings: &MonitorSettings) -> ReconcilerConfig {
    let p = &settings.projections;
    ReconcilerConfig {
        history_len: p.history_len,
        max_typos: p.max_typos,
        bucket_width: chrono::Duration::seconds(p.bucket_secs),
        lateness: chrono::Duration::seconds(p.lateness_secs),
    }
}

fn manager_config(settings: &MonitorSettings) -> ManagerConfig {
    let c = &settings.connection;
    ManagerConfig {
        categories: settings.categories.clone(),
        handshake_timeout: c.handshake_timeout(),
        resync_timeout: c.resync_timeout(),
        backoff: BackoffPolicy {
            base: c.backoff_base(),
            max: c.backoff_max(),
            multiplier: 2.0,
            jitter: c.jitter,
        },
        max_retries: c.max_retries,
        buffer_capacity: c.buffer_capacity,
        agent_id: Some(format!("engcheck-cli/{}", env!("CARGO_PKG_VERSION"))),
    }
}

async fn monitor(settings: MonitorSettings) -> Result<()> {
    let socket = settings.socket_path.clone().unwrap_or_else(default_socket_path);
    info!(socket = %socket.display(), categories = ?settings.categories, "starting monitor");

    let reconciler = Reconciler::new(reconciler_config(&settings));
    let manager = ConnectionManager::new(UnixTransport::new(socket), reconciler, manager_config(&settings));
    let mut status = manager.status();
    let mut notes = manager.notifications();
    let shutdown = manager.shutdown_handle();
    let task = tokio::spawn(manager.run());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut notice_shown = false;
    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(err) = res {
                    warn!(%err, "ctrl-c handler failed");
                }
                info!("interrupted; closing link");
                shutdown.shutdown();
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let s = status.borrow_and_update().clone();
                eprintln!(
                    "link: {} (last sequence {}, buffered {}, evicted {})",
                    s.state,
                    s.last_sequence.map_or_else(|| "-".to_string(), |seq| seq.to_string()),
                    s.buffered,
                    s.evicted,
                );
                match (&s.notice, notice_shown) {
                    (Some(notice), false) => {
                        eprintln!("notice: {notice}");
                        notice_shown = true;
                    }
                    (None, true) => notice_shown = false,
                    _ => {}
                }
            }
            note = notes.recv() => match note {
                Ok(note) => eprintln!("{:?}: {}", note.kind, note.title),
                Err(RecvError::Lagged(missed)) => warn!(missed, "notifications dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let reconciler = task.await.context("connection manager task")?;
    output::store(&reconciler.view(), Format::Table)
}

fn replay(file: &Path, query: Option<&str>, interval: Option<i64>, format: Format) -> Result<()> {
    let log = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let mut reconciler = Reconciler::default();
    for (n, line) in log.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Unparseable lines still go through the normalizer so they are counted.
        let raw = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(json) => Value::serialized(&json).with_context(|| format!("line {}: convert to frame", n + 1))?,
            Err(_) => Value::Text(line.to_string()),
        };
        if let Err(err) = reconciler.ingest_raw(&raw) {
            warn!(line = n + 1, %err, "event skipped");
        }
    }
    let view = reconciler.view();
    output::replay(&view, query, interval, format)
}

fn check(project: &str, standards: &Path, document: &Path, format: Format) -> Result<()> {
    let standards = load_standards(standards)?;
    let checklist = generate_checklist(&standards, project);
    let text = fs::read_to_string(document).with_context(|| format!("read {}", document.display()))?;
    let findings = check_document(&text, &checklist);

    let digest = blake3::hash(text.as_bytes()).to_hex();
    let stamp = EventStamp {
        category: project.to_string(),
        timestamp: Utc::now(),
        first_sequence: 1,
        revision: digest.as_str().get(..16).unwrap_or_default().to_string(),
    };
    let mut reconciler = Reconciler::default();
    reconciler.apply_batch(&findings_to_events(&checklist, &findings, &stamp));
    output::findings(&reconciler.view(), &findings, checklist.len(), format)
}
