//! ChatReflex console host.
//!
//! Reads `author: message` lines from stdin, prints replies, alerts and
//! scheduled broadcasts to stdout, and exposes admin subcommands for the
//! persistent store.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chatreflex::storage::{open_store, PersistentStores};
use chatreflex::{
    AlertHandler, AlertMapping, AlertPayload, DeliveryError, LivenessProbe, MatchEngine, NewTrigger, ReflexConfig,
    ReplySink, ScheduleId, ScheduleStore, Scheduler, StorageError, StreamState, TelemetryBatcher, TelemetryEvent,
    TelemetrySink, TriggerCache, TriggerId, TriggerStore,
};

#[derive(Parser)]
#[command(name = "chatreflex")]
#[command(version, about = "Chat auto-responder with scheduled broadcasts")]
struct Cli {
    /// Data directory for the persistent store
    #[arg(short, long, env = "CHATREFLEX_DATA_DIR", default_value = "./chatreflex-data")]
    data_dir: PathBuf,

    /// Append telemetry rows as JSON lines to this file
    #[arg(long, value_name = "PATH")]
    telemetry_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Read chat from stdin and respond (default)
    Run,
    /// Add a trigger
    AddTrigger {
        /// Regular expression searched anywhere in the message
        #[arg(short, long)]
        pattern: String,

        /// Reply text
        #[arg(short, long, conflicts_with = "alert", required_unless_present = "alert")]
        reply: Option<String>,

        /// Alert argument as NAME=FIELD (repeatable)
        #[arg(short, long, value_name = "NAME=FIELD")]
        alert: Vec<String>,

        /// Cooldown in minutes
        #[arg(short, long, default_value_t = 0)]
        cooldown: u32,
    },
    /// Remove a trigger
    RemoveTrigger {
        #[arg(value_name = "ID")]
        id: TriggerId,
    },
    /// List triggers
    ListTriggers,
    /// Add a scheduled broadcast
    AddSchedule {
        /// Message to send
        #[arg(short, long)]
        message: String,

        /// Interval in minutes
        #[arg(short, long, allow_negative_numbers = true)]
        interval: i64,

        /// Store the schedule disabled
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a scheduled broadcast
    RemoveSchedule {
        #[arg(value_name = "ID")]
        id: ScheduleId,
    },
    /// Enable or disable a scheduled broadcast
    SetSchedule {
        #[arg(value_name = "ID")]
        id: ScheduleId,

        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// List scheduled broadcasts
    ListSchedules,
}

/// Telemetry sink appending one JSON object per line.
struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl TelemetrySink for JsonLinesSink {
    fn insert_batch(&self, rows: &[TelemetryEvent]) -> Result<(), StorageError> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| StorageError::BackendError("telemetry writer poisoned".to_string()))?;
        for row in rows {
            let line = serde_json::to_string(row).map_err(|e| StorageError::SerializationError(e.to_string()))?;
            writeln!(out, "{line}").map_err(|e| StorageError::BackendError(e.to_string()))?;
        }
        out.flush().map_err(|e| StorageError::BackendError(e.to_string()))
    }
}

fn parse_mapping(args: &[String]) -> Result<AlertMapping, String> {
    let mut mapping = AlertMapping::new();
    for arg in args {
        let (name, field) = arg
            .split_once('=')
            .ok_or_else(|| format!("alert argument '{arg}' must look like NAME=FIELD"))?;
        mapping.insert(name.trim().to_string(), field.trim().to_string());
    }
    Ok(mapping)
}

fn stdout_sink(prefix: &'static str) -> Arc<dyn ReplySink> {
    Arc::new(move |text: &str| -> Result<(), DeliveryError> {
        let mut out = io::stdout().lock();
        writeln!(out, "[{prefix}] {text}").map_err(|e| DeliveryError::new(e.to_string()))
    })
}

fn run(config: ReflexConfig, stores: Arc<PersistentStores>, telemetry_log: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let channel = if config.matching.channel.is_empty() {
        "console".to_string()
    } else {
        config.matching.channel.clone()
    };
    let stream = Arc::new(StreamState::new());
    stream.set_online(&channel, true);
    let live: Arc<dyn LivenessProbe> = stream.probe(channel.clone());

    let sink: Option<Arc<dyn TelemetrySink>> = match telemetry_log {
        Some(path) => Some(Arc::new(JsonLinesSink::open(path)?)),
        None => None,
    };
    let telemetry = Arc::new(TelemetryBatcher::new(sink, config.telemetry.clone(), Some(Arc::clone(&live)))?);

    let cache = Arc::new(TriggerCache::with_config(stores.clone(), config.cache.clone()));
    cache.refresh();
    cache.start_auto_refresh(Some(Arc::clone(&live)), config.cache.refresh_interval)?;

    let alerts = AlertHandler::blocking(|payload: &AlertPayload| {
        let json = serde_json::to_string(payload).map_err(|e| DeliveryError::new(e.to_string()))?;
        let mut out = io::stdout().lock();
        writeln!(out, "[alert] {json}").map_err(|e| DeliveryError::new(e.to_string()))
    });
    let mut matching = config.matching.clone();
    matching.channel = channel.clone();
    let engine = MatchEngine::builder(Arc::clone(&cache))
        .config(matching)
        .alert_handler(alerts)
        .telemetry(Arc::clone(&telemetry))
        .build()?;

    let scheduler = Scheduler::with_config(stores, stdout_sink("schedule"), config.scheduler.clone())?;
    let started = scheduler.start()?;
    info!(triggers = engine.trigger_count(), schedules = started, channel = %channel, "chatreflex running; reading stdin");

    let reply = stdout_sink("reply");
    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        match line {
            "" => continue,
            "/refresh" => {
                cache.notify_change();
                continue;
            }
            "/online" | "/offline" => {
                stream.set_online(&channel, line == "/online");
                continue;
            }
            _ => {}
        }

        let (author, message) = line.split_once(':').unwrap_or(("anonymous", line));
        if let Err(e) = engine.handle_message(author.trim(), message.trim(), Arc::clone(&reply)) {
            warn!(error = %e, "message dropped");
        }
    }

    scheduler.stop();
    cache.stop_auto_refresh();
    drop(engine);
    telemetry.close();
    info!("chatreflex stopped");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatreflex=info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ReflexConfig::from_env()?;
    config.data_dir = Some(cli.data_dir.clone());

    let stores = Arc::new(open_store(&cli.data_dir, None)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, stores, cli.telemetry_log.as_deref())?,
        Commands::AddTrigger {
            pattern,
            reply,
            alert,
            cooldown,
        } => {
            let trigger = match reply {
                Some(text) => NewTrigger::reply(pattern, text),
                None => NewTrigger::alert(pattern, parse_mapping(&alert)?),
            }
            .with_cooldown(cooldown);
            trigger.validate()?;
            let id = stores.insert_trigger(trigger.into_row(TriggerId::new()))?;
            println!("{id}");
        }
        Commands::RemoveTrigger { id } => {
            let removed = stores.delete_trigger(id)?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        Commands::ListTriggers => {
            for row in stores.list_triggers()? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        Commands::AddSchedule {
            message,
            interval,
            disabled,
        } => {
            let scheduler = Scheduler::new(stores, stdout_sink("schedule"));
            let id = scheduler.add(message, interval, !disabled)?;
            println!("{id}");
        }
        Commands::RemoveSchedule { id } => {
            let removed = stores.delete_schedule(id)?;
            println!("{}", if removed { "removed" } else { "not found" });
        }
        Commands::SetSchedule { id, enabled } => {
            let found = stores.set_schedule_enabled(id, enabled)?;
            println!("{}", if found { "updated" } else { "not found" });
        }
        Commands::ListSchedules => {
            for record in stores.list_schedules()? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
    }

    Ok(())
}
