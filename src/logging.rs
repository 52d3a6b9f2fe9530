//! Structured logging for the dashboard and the simulator.
//!
//! Every record is a single JSON line carrying a run id, a sequence number,
//! a level, a domain and free-form data fields. Records are written to a
//! per-run directory:
//!
//! ```text
//! $LOG_DIR/<run_id>/manifest.json
//! $LOG_DIR/<run_id>/events.jsonl   info and above
//! $LOG_DIR/<run_id>/trace.jsonl    trace and debug
//! ```
//!
//! The terminal UI owns stdout, so console echo goes to stderr and only when
//! `LOG_STDERR=1`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("LOG_LEVEL").as_deref().unwrap_or("info"))
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "trace" => Level::Trace,
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Feed,    // Socket lifecycle, inbound frames
    Store,   // Reducer anomalies
    Command, // Outbound operator commands
    Ui,      // Terminal setup, input handling
    Sim,     // Bundled simulator
    System,  // Startup, shutdown
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Feed => "feed",
            Domain::Store => "store",
            Domain::Command => "command",
            Domain::Ui => "ui",
            Domain::Sim => "sim",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Sinks
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// File sinks for one run.
#[derive(Debug)]
pub struct LogSink {
    run_id: String,
    dir: PathBuf,
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

impl LogSink {
    pub fn open(base: &Path, run_id: &str) -> std::io::Result<Self> {
        let dir = base.join(run_id);
        create_dir_all(&dir)?;
        std::fs::write(
            dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": dir.to_string_lossy(),
            })
            .to_string(),
        )?;
        let events = File::create(dir.join("events.jsonl"))?;
        let trace = File::create(dir.join("trace.jsonl"))?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir,
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, level: Level, line: &str) {
        let writer = match level {
            Level::Trace | Level::Debug => &self.trace,
            _ => &self.events,
        };
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            if level >= Level::Warn {
                let _ = w.flush();
            }
        }
    }

    pub fn flush(&self) {
        for writer in [&self.events, &self.trace] {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    sink: Option<LogSink>,
    echo_stderr: bool,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let echo_stderr = matches!(std::env::var("LOG_STDERR").as_deref(), Ok("1" | "true" | "yes"));
        let sink = match LogSink::open(Path::new(&base), &run_id) {
            Ok(sink) => Some(sink),
            Err(err) => {
                eprintln!("[log] failed to open run dir under {}: {}", base, err);
                None
            }
        };
        RunContext {
            run_id,
            sink,
            echo_stderr,
        }
    })
}

/// Where this run's log files live, if the sink opened.
pub fn run_dir() -> Option<PathBuf> {
    ensure_run_context().sink.as_ref().map(|s| s.dir().to_path_buf())
}

/// Flush buffered records. Call before exit.
pub fn flush() {
    if let Some(sink) = &ensure_run_context().sink {
        sink.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let ctx = ensure_run_context();
    let line = format_record(&ctx.run_id, next_seq(), level, domain, event, fields);
    if let Some(sink) = &ctx.sink {
        sink.write(level, &line);
    }
    if ctx.echo_stderr {
        eprintln!("{}", line);
    }
}

/// Build one JSON line. `msg` is lifted out of the data fields.
pub fn format_record(
    run_id: &str,
    seq: u64,
    level: Level,
    domain: Domain,
    event: &str,
    mut fields: Map<String, Value>,
) -> String {
    let msg = fields.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id));
    entry.insert("seq".to_string(), json!(seq));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    entry.insert("data".to_string(), Value::Object(fields));
    Value::Object(entry).to_string()
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_connected(url: &str, attempt: u32) {
    log(
        Level::Info,
        Domain::Feed,
        "connected",
        obj(&[("url", v_str(url)), ("attempt", json!(attempt))]),
    );
}

pub fn log_disconnected(url: &str, reason: &str, retry_in_ms: u64) {
    log(
        Level::Warn,
        Domain::Feed,
        "disconnected",
        obj(&[
            ("url", v_str(url)),
            ("reason", v_str(reason)),
            ("retry_in_ms", json!(retry_in_ms)),
        ]),
    );
}

pub fn log_bad_frame(err: &str, len: usize) {
    log(
        Level::Warn,
        Domain::Feed,
        "bad_frame",
        obj(&[("error", v_str(err)), ("len", json!(len))]),
    );
}

pub fn log_command(name: &str, payload: &str) {
    log(
        Level::Info,
        Domain::Command,
        "send",
        obj(&[("command", v_str(name)), ("payload", v_str(payload))]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// NaN is not representable in JSON; it becomes null.
pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================
