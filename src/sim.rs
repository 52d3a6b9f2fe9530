//! Development stand-in for the ADR server.
//!
//! `AdrSim` is a plain state machine: commands and clock steps go in, JSON
//! frames come out tagged with who should receive them. `serve` wraps it in
//! a websocket listener that speaks the dashboard protocol.
//!
//! The cryostat model is deliberately crude. Stages relax exponentially
//! toward targets set by the compressor and heat switch, and the salt pills
//! scale with magnet current the way an ideal paramagnet would.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::protocol::{Command, InstrumentFlags, LogRecord, Reading, TempBatch};
use crate::store::state::{COMPRESSOR, DEFAULT_INSTRUMENTS, HEAT_SWITCH};

// =============================================================================
// Model constants
// =============================================================================

pub const CURRENT_LIMIT_A: f64 = 9.0;
pub const VOLTAGE_LIMIT_V: f64 = 2.28;
pub const MAGUP_DV: f64 = 0.004;
pub const REGULATE_DV: f64 = 0.002;
pub const MAGNET_MAX_TEMP_K: f64 = 5.0;
const MAGNET_RESISTANCE_OHM: f64 = 0.25;
const MAGNET_INDUCTANCE_H: f64 = 15.0;
const CURRENT_TAU_S: f64 = 20.0;
const SALT_FLOOR_K: f64 = 0.03;
const NOISE: f64 = 0.002;

/// Log entries sent to a client when it connects.
pub const SNAPSHOT_LOG_ENTRIES: usize = 30;
const LOG_RETAIN: usize = 2_000;
const HISTORY_RETAIN: usize = 86_400;

const POWER_SUPPLY: &str = "Power Supply";
const MAGNET_VOLTAGE_MONITOR: &str = "Magnet Voltage Monitor";
const PUMP_CART: &str = "Pump Cart Pressure";

pub fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// A frame and its audience.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Every connected client.
    All(Value),
    /// Only the client whose command produced it.
    Sender(Value),
}

impl Outbound {
    pub fn value(&self) -> &Value {
        match self {
            Outbound::All(v) | Outbound::Sender(v) => v,
        }
    }
}

// =============================================================================
// State machine
// =============================================================================

#[derive(Debug, Clone)]
pub struct AdrSim {
    last_step: f64,
    pub t60k: f64,
    pub t03k: f64,
    pub tggg: f64,
    pub tfaa: f64,
    pub pressure: f64,
    pub ps_voltage: f64,
    pub ps_current: f64,
    pub back_emf: f64,
    pub compressor_on: bool,
    pub heat_switch_closed: bool,
    pub magging_up: bool,
    pub regulating: bool,
    pub regulation_temp: f64,
    instruments: Vec<(String, InstrumentFlags)>,
    history: TempBatch,
    log: Vec<LogRecord>,
}

impl AdrSim {
    /// A cold, idle cryostat with every instrument up except the pump cart.
    pub fn new(now: f64) -> Self {
        let instruments = DEFAULT_INSTRUMENTS
            .iter()
            .map(|name| {
                let flags = InstrumentFlags {
                    server: true,
                    connected: *name != PUMP_CART,
                };
                (name.to_string(), flags)
            })
            .collect();
        Self {
            last_step: now,
            t60k: 52.0,
            t03k: 3.1,
            tggg: 3.2,
            tfaa: 3.2,
            pressure: 2.0e-6,
            ps_voltage: 0.0,
            ps_current: 0.0,
            back_emf: 0.0,
            compressor_on: true,
            heat_switch_closed: true,
            magging_up: false,
            regulating: false,
            regulation_temp: 0.1,
            instruments,
            history: TempBatch::default(),
            log: Vec::new(),
        }
    }

    pub fn instrument(&self, name: &str) -> Option<InstrumentFlags> {
        self.instruments.iter().find(|(n, _)| n == name).map(|(_, f)| *f)
    }

    pub fn set_instrument(&mut self, name: &str, flags: InstrumentFlags) {
        match self.instruments.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = flags,
            None => self.instruments.push((name.to_string(), flags)),
        }
    }

    pub fn log_entries(&self) -> &[LogRecord] {
        &self.log
    }

    pub fn history_len(&self) -> usize {
        self.history.timestamps.len()
    }

    fn connected(&self, name: &str) -> bool {
        self.instrument(name).map(|f| f.connected).unwrap_or(false)
    }

    fn instruments_value(&self) -> Value {
        let map: Map<String, Value> = self
            .instruments
            .iter()
            .map(|(name, flags)| (name.clone(), json!(flags)))
            .collect();
        Value::Object(map)
    }

    fn scalars(&self) -> Map<String, Value> {
        obj(&[
            ("compressorOn", json!(self.compressor_on)),
            ("pressure", v_num(self.pressure)),
            ("isMaggingUp", json!(self.magging_up)),
            ("isRegulating", json!(self.regulating)),
            ("backEMF", v_num(self.back_emf)),
            ("PSCurrent", v_num(self.ps_current)),
            ("PSVoltage", v_num(self.ps_voltage)),
        ])
    }

    fn latest_row(&self, now: f64) -> TempBatch {
        let mut batch = TempBatch::default();
        match self.history.timestamps.last() {
            Some(&ts) => {
                let i = self.history.timestamps.len() - 1;
                batch.push_row(
                    ts,
                    [
                        self.history.t60k[i].clone(),
                        self.history.t03k[i].clone(),
                        self.history.tggg[i].clone(),
                        self.history.tfaa[i].clone(),
                    ],
                );
            }
            None => batch.push_row(
                now,
                [self.t60k.into(), self.t03k.into(), self.tggg.into(), self.tfaa.into()],
            ),
        }
        batch
    }

    /// Full state for a newly connected client.
    pub fn snapshot(&self, now: f64) -> Value {
        let mut frame = self.scalars();
        frame.insert("temps".into(), json!(self.latest_row(now)));
        frame.insert("instruments".into(), self.instruments_value());
        let start = self.log.len().saturating_sub(SNAPSHOT_LOG_ENTRIES);
        frame.insert("log".into(), json!(&self.log[start..]));
        Value::Object(frame)
    }

    fn log_message(&mut self, message: impl Into<String>, alert: bool, now: f64) -> Outbound {
        let record = LogRecord {
            datetime: now,
            message: message.into(),
            alert,
        };
        log(
            if alert { Level::Warn } else { Level::Info },
            Domain::Sim,
            "log_message",
            obj(&[("message", v_str(&record.message)), ("alert", json!(alert))]),
        );
        let frame = json!({ "log": [&record] });
        self.log.push(record);
        if self.log.len() > LOG_RETAIN {
            let excess = self.log.len() - LOG_RETAIN;
            self.log.drain(..excess);
        }
        Outbound::All(frame)
    }

    fn flag_frame(key: &str, value: bool) -> Outbound {
        let mut m = Map::new();
        m.insert(key.to_string(), json!(value));
        Outbound::All(Value::Object(m))
    }

    /// Decode a client text frame and apply it. Regulate requests whose
    /// temperature is not a number are answered with an alert.
    pub fn handle_text(&mut self, text: &str, now: f64) -> Vec<Outbound> {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Sim,
                    "bad_command",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                return Vec::new();
            }
        };
        if value.get("command").and_then(Value::as_str) == Some("Regulate") {
            let temp = match value.get("temp") {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            return self.handle(Command::Regulate { temp: temp.unwrap_or(f64::NAN) }, now);
        }
        match serde_json::from_value::<Command>(value) {
            Ok(cmd) => self.handle(cmd, now),
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Sim,
                    "unknown_command",
                    obj(&[("error", v_str(&err.to_string()))]),
                );
                Vec::new()
            }
        }
    }

    pub fn handle(&mut self, cmd: Command, now: f64) -> Vec<Outbound> {
        log(Level::Debug, Domain::Sim, "command", obj(&[("command", v_str(cmd.name()))]));
        match cmd {
            Command::OpenHeatSwitch | Command::CloseHeatSwitch => {
                if !self.connected(HEAT_SWITCH) {
                    return vec![self.log_message(
                        "Cannot move heat switch: Heat Switch is not connected.",
                        true,
                        now,
                    )];
                }
                let close = cmd == Command::CloseHeatSwitch;
                self.heat_switch_closed = close;
                let msg = if close { "Heat switch closed." } else { "Heat switch opened." };
                vec![self.log_message(msg, false, now)]
            }
            Command::MagUp => self.start_mag_up(now),
            Command::StopMaggingUp => {
                self.magging_up = false;
                let msg = format!("Magging up stopped at a current of {:.3} A.", self.ps_current);
                vec![
                    Self::flag_frame("isMaggingUp", false),
                    self.log_message(msg, false, now),
                ]
            }
            Command::Regulate { temp } => self.start_regulation(temp, now),
            Command::StopRegulating => {
                self.regulating = false;
                let msg = format!("PID Control stopped at a current of {:.3} A.", self.ps_current);
                vec![
                    Self::flag_frame("isRegulating", false),
                    self.log_message(msg, false, now),
                ]
            }
            Command::SetCompressorState { on } => {
                if !self.connected(COMPRESSOR) {
                    return vec![self.log_message(
                        "Cannot change compressor state: Compressor is not connected.",
                        true,
                        now,
                    )];
                }
                self.compressor_on = on;
                let msg = if on { "Compressor started." } else { "Compressor stopped." };
                vec![
                    Self::flag_frame("compressorOn", on),
                    self.log_message(msg, false, now),
                ]
            }
            Command::RefreshInstruments => {
                let mut out = vec![self.log_message("Refreshing devices...", false, now)];
                for (_, flags) in self.instruments.iter_mut() {
                    *flags = InstrumentFlags {
                        server: true,
                        connected: true,
                    };
                }
                out.push(Outbound::All(json!({ "instruments": self.instruments_value() })));
                out
            }
            Command::AddToLog { text } => vec![self.log_message(text, false, now)],
            Command::GetTemperatureData { minutes } => {
                vec![Outbound::Sender(json!({ "temps": self.history_since(now, minutes) }))]
            }
        }
    }

    fn start_mag_up(&mut self, now: f64) -> Vec<Outbound> {
        if self.magging_up {
            return vec![self.log_message("Already magging up.", false, now)];
        }
        if self.regulating {
            return vec![self.log_message(
                "Currently in PID control loop regulation. Please wait until finished.",
                false,
                now,
            )];
        }
        if self.t03k > MAGNET_MAX_TEMP_K {
            return vec![self.log_message("Temperature too high to mag up.", false, now)];
        }
        let missing = missing_devices(self, &[POWER_SUPPLY, MAGNET_VOLTAGE_MONITOR]);
        if !missing.is_empty() {
            let msg = format!(
                "Cannot mag up: At least one of the essential devices is not connected: {}.",
                missing.join(", ")
            );
            return vec![self.log_message(msg, true, now)];
        }
        self.magging_up = true;
        let msg = format!("Beginning to mag up to {} A.", CURRENT_LIMIT_A);
        vec![
            Self::flag_frame("isMaggingUp", true),
            self.log_message(msg, false, now),
        ]
    }

    fn start_regulation(&mut self, temp: f64, now: f64) -> Vec<Outbound> {
        if !temp.is_finite() || temp <= 0.0 {
            return vec![self.log_message("Could not convert input to temperature.", true, now)];
        }
        let mut out = vec![self.log_message(
            format!("Setting regulation temperature to {:.6} K.", temp),
            false,
            now,
        )];
        self.regulation_temp = temp;
        if self.magging_up {
            out.push(self.log_message(
                "Currently magging up. Please wait until finished.",
                false,
                now,
            ));
            return out;
        }
        let missing = missing_devices(
            self,
            &[
                POWER_SUPPLY,
                "Diode Temperature Monitor",
                "Ruox Temperature Monitor",
                MAGNET_VOLTAGE_MONITOR,
            ],
        );
        if !missing.is_empty() {
            let msg = format!(
                "Cannot regulate: At least one of the essential devices is not connected: {}.",
                missing.join(", ")
            );
            out.push(self.log_message(msg, true, now));
            return out;
        }
        self.regulating = true;
        out.push(Self::flag_frame("isRegulating", true));
        let msg = format!("Starting regulation to {} K from {:.3} A.", temp, self.ps_current);
        out.push(self.log_message(msg, false, now));
        out
    }

    /// Rows newer than `minutes` ago, framed by NaN rows so a plot does not
    /// join them to whatever the client already has.
    pub fn history_since(&self, now: f64, minutes: u32) -> TempBatch {
        let cutoff = now - f64::from(minutes) * 60.0;
        let start = self.history.timestamps.partition_point(|ts| *ts <= cutoff);
        let gap = || [Reading::Missing, Reading::Missing, Reading::Missing, Reading::Missing];

        let mut batch = TempBatch::default();
        let first = self.history.timestamps.get(start).copied().unwrap_or(now);
        batch.push_row(first - 1e-3, gap());
        for i in start..self.history.timestamps.len() {
            batch.push_row(
                self.history.timestamps[i],
                [
                    self.history.t60k[i].clone(),
                    self.history.t03k[i].clone(),
                    self.history.tggg[i].clone(),
                    self.history.tfaa[i].clone(),
                ],
            );
        }
        let last = self.history.timestamps.last().copied().unwrap_or(now);
        batch.push_row(now.max(last + 1e-3), gap());
        batch
    }

    /// Advance the model to `now` and return what to broadcast.
    pub fn step<R: Rng>(&mut self, now: f64, rng: &mut R) -> Vec<Outbound> {
        let dt = (now - self.last_step).max(0.0);
        self.last_step = now;
        let relax = |tau: f64| 1.0 - (-dt / tau).exp();
        let mut out = Vec::new();

        // Pulse tube stages and pump cart.
        let (t60_target, t3_target, p_target) = if self.compressor_on {
            (48.0, 2.9, 2.0e-6)
        } else {
            (295.0, 295.0, 1.0e-3)
        };
        self.t60k += (t60_target - self.t60k) * relax(600.0);
        self.t03k += (t3_target - self.t03k) * relax(900.0);
        self.pressure += (p_target - self.pressure) * relax(300.0);

        // Magnet supply.
        if self.magging_up {
            self.ps_voltage = (self.ps_voltage + MAGUP_DV).min(VOLTAGE_LIMIT_V);
        } else if self.regulating && self.tfaa > self.regulation_temp {
            self.ps_voltage = (self.ps_voltage - REGULATE_DV).max(0.0);
        }
        let prev_current = self.ps_current;
        let target_current = self.ps_voltage / MAGNET_RESISTANCE_OHM;
        self.ps_current += (target_current - self.ps_current) * relax(CURRENT_TAU_S);
        self.back_emf = if dt > 0.0 {
            MAGNET_INDUCTANCE_H * (self.ps_current - prev_current) / dt
        } else {
            0.0
        };

        // Salt pills: heat leak to the 3K stage, adiabatic scaling with field.
        let leak_tau = if self.heat_switch_closed { 60.0 } else { 3_600.0 };
        self.tggg += (self.t03k - self.tggg) * relax(leak_tau);
        self.tfaa += (self.t03k - self.tfaa) * relax(leak_tau);
        if !self.heat_switch_closed && prev_current > 0.05 && self.ps_current > 0.0 {
            let ratio = self.ps_current / prev_current;
            self.tfaa = (self.tfaa * ratio).max(SALT_FLOOR_K);
            self.tggg = (self.tggg * ratio.sqrt()).max(SALT_FLOOR_K);
        }

        if self.magging_up && self.ps_current >= CURRENT_LIMIT_A - 0.01 {
            self.magging_up = false;
            let msg = format!("Finished magging up. {:.3} A reached.", self.ps_current);
            out.push(self.log_message(msg, false, now));
        }
        if self.regulating && self.ps_voltage <= 0.0 && self.ps_current < 0.01 {
            self.regulating = false;
            out.push(self.log_message("Regulation has completed. Mag up and try again.", false, now));
        }

        let row = [
            Reading::from(jitter(rng, self.t60k)),
            Reading::from(jitter(rng, self.t03k)),
            Reading::from(jitter(rng, self.tggg)),
            Reading::from(jitter(rng, self.tfaa)),
        ];
        let mut temps = TempBatch::default();
        temps.push_row(now, row.clone());
        self.history.push_row(now, row);
        if self.history.timestamps.len() > HISTORY_RETAIN {
            let excess = self.history.timestamps.len() - HISTORY_RETAIN;
            self.history.timestamps.drain(..excess);
            self.history.t60k.drain(..excess);
            self.history.t03k.drain(..excess);
            self.history.tggg.drain(..excess);
            self.history.tfaa.drain(..excess);
        }

        let mut frame = self.scalars();
        frame.insert("temps".into(), json!(temps));
        frame.insert("instruments".into(), self.instruments_value());
        out.push(Outbound::All(Value::Object(frame)));
        out
    }
}

fn missing_devices(sim: &AdrSim, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .filter(|name| !sim.connected(name))
        .map(|name| name.to_string())
        .collect()
}

fn jitter<R: Rng>(rng: &mut R, v: f64) -> f64 {
    v * (1.0 + rng.gen_range(-NOISE..=NOISE))
}

// =============================================================================
// Websocket server
// =============================================================================

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub addr: String,
    pub step: Duration,
}

impl SimConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            addr: cfg.sim_addr.clone(),
            step: Duration::from_millis(cfg.sim_step_ms.max(10)),
        }
    }
}

type Shared = Arc<Mutex<AdrSim>>;

fn with_sim<T>(sim: &Shared, f: impl FnOnce(&mut AdrSim) -> T) -> T {
    let mut guard = sim.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Accept clients on `listener` and step the model until the task is dropped.
pub async fn serve(listener: TcpListener, cfg: SimConfig) -> Result<()> {
    let sim: Shared = Arc::new(Mutex::new(AdrSim::new(now_secs())));
    let (tx, _) = broadcast::channel::<String>(1024);

    log(
        Level::Info,
        Domain::Sim,
        "listening",
        obj(&[
            ("addr", v_str(&listener.local_addr()?.to_string())),
            ("step_ms", json!(cfg.step.as_millis() as u64)),
        ]),
    );

    tokio::spawn(step_loop(sim.clone(), tx.clone(), cfg.step));

    loop {
        let (stream, peer) = listener.accept().await?;
        let sim = sim.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(err) = client(stream, sim, tx).await {
                log(
                    Level::Warn,
                    Domain::Sim,
                    "client_error",
                    obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&err.to_string()))]),
                );
            }
        });
    }
}

async fn step_loop(sim: Shared, tx: broadcast::Sender<String>, step: Duration) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(step);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let frames = with_sim(&sim, |s| s.step(now_secs(), &mut rng));
        for frame in frames {
            // No subscribers is fine.
            let _ = tx.send(frame.value().to_string());
        }
    }
}

async fn client(stream: TcpStream, sim: Shared, tx: broadcast::Sender<String>) -> Result<()> {
    let peer = stream.peer_addr()?.to_string();
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut updates = tx.subscribe();
    log(Level::Info, Domain::Sim, "client_connected", obj(&[("peer", v_str(&peer))]));

    let snapshot = with_sim(&sim, |s| s.snapshot(now_secs()));
    write.send(Message::Text(snapshot.to_string())).await?;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(text) => write.send(Message::Text(text)).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => log(
                    Level::Warn,
                    Domain::Sim,
                    "client_lagged",
                    obj(&[("peer", v_str(&peer)), ("skipped", json!(n))]),
                ),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let replies = with_sim(&sim, |s| s.handle_text(&text, now_secs()));
                    for reply in replies {
                        match reply {
                            Outbound::All(v) => {
                                let _ = tx.send(v.to_string());
                            }
                            Outbound::Sender(v) => write.send(Message::Text(v.to_string())).await?,
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            },
        }
    }

    log(Level::Info, Domain::Sim, "client_disconnected", obj(&[("peer", v_str(&peer))]));
    Ok(())
}
