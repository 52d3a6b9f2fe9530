//! View projections: what each panel shows, derived from a state slice.
//!
//! Nothing here draws. The terminal layer turns these into widgets, and the
//! app layer uses the control projections to decide which commands a key
//! press may send.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike};

use crate::protocol::{Command, InstrumentFlags, LogRecord, Reading};
use crate::store::state::{DashboardState, Sensor, COMPRESSOR, HEAT_SWITCH};

// =============================================================================
// Number formatting
// =============================================================================

/// `digits` significant digits, switching to exponent form for very large or
/// very small magnitudes (`1.235e+4`, `5.000e-7`).
pub fn to_precision(x: f64, digits: usize) -> String {
    let digits = digits.max(1);
    if x.is_nan() {
        return "NaN".to_string();
    }
    if x.is_infinite() {
        return if x > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if x == 0.0 {
        return format!("{:.*}", digits - 1, 0.0);
    }

    let mut exp = x.abs().log10().floor() as i32;
    let scale = 10f64.powi(exp - (digits as i32 - 1));
    if (x.abs() / scale).round() >= 10f64.powi(digits as i32) {
        exp += 1;
    }

    if exp < -6 || exp >= digits as i32 {
        let mantissa = format!("{:.*}", digits - 1, x / 10f64.powi(exp));
        let sign = if exp >= 0 { '+' } else { '-' };
        format!("{}e{}{}", mantissa, sign, exp.abs())
    } else {
        let decimals = (digits as i32 - 1 - exp).max(0) as usize;
        format!("{:.*}", decimals, x)
    }
}

/// Gauge text for one reading. Non-numeric input falls back to the raw text.
pub fn format_reading(reading: Option<&Reading>) -> String {
    match reading {
        Some(Reading::Value(v)) => to_precision(*v, 4),
        Some(Reading::Raw(raw)) => raw.clone(),
        Some(Reading::Missing) | None => "NaN".to_string(),
    }
}

pub fn format_fixed(value: f64, decimals: usize) -> String {
    format!("{:.*}", decimals, value)
}

// =============================================================================
// Temperature gauges
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TempGauge {
    pub sensor: Sensor,
    /// Latest value, e.g. `3.142K`.
    pub value_text: String,
    /// K/sec between the last two samples.
    pub rate: f64,
    /// e.g. `[⇩ 0.012K/sec]`.
    pub rate_text: String,
}

pub fn temp_gauges(state: &DashboardState) -> Vec<TempGauge> {
    Sensor::ALL
        .iter()
        .map(|sensor| {
            let rate = state.temps.rate(*sensor);
            TempGauge {
                sensor: *sensor,
                value_text: format!("{}K", format_reading(state.temps.latest(*sensor))),
                rate,
                rate_text: format!("[{}K/sec]", rate_text(rate)),
            }
        })
        .collect()
}

fn rate_text(rate: f64) -> String {
    if !rate.is_finite() {
        return " NaN".to_string();
    }
    let arrow = if rate < 0.0 { '\u{21E9}' } else { '\u{21E7}' };
    format!("{} {:.3}", arrow, rate.abs())
}

// =============================================================================
// Status readouts
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReadout {
    pub label: &'static str,
    pub value_text: String,
    pub units: &'static str,
}

pub fn status_readouts(state: &DashboardState) -> Vec<StatusReadout> {
    [
        ("PS Voltage", state.ps_voltage, "V"),
        ("PS Current", state.ps_current, "A"),
        ("Back EMF", state.back_emf, "V"),
        ("Pressure", state.pressure, "Torr"),
    ]
    .into_iter()
    .map(|(label, value, units)| StatusReadout {
        label,
        value_text: format_fixed(value, 3),
        units,
    })
    .collect()
}

// =============================================================================
// Instrument lights
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Light {
    /// No server process.
    Offline,
    /// Server up, device not connected.
    ServerOnly,
    Connected,
}

impl Light {
    pub fn of(flags: InstrumentFlags) -> Self {
        match (flags.server, flags.connected) {
            (true, true) => Light::Connected,
            (true, false) => Light::ServerOnly,
            _ => Light::Offline,
        }
    }

    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Light::Offline => (0xd6, 0x27, 0x28),
            Light::ServerOnly => (0xff, 0x7f, 0x0e),
            Light::Connected => (0x2c, 0xa0, 0x2c),
        }
    }
}

pub fn instrument_lights(state: &DashboardState) -> Vec<(String, Light)> {
    state
        .instruments
        .iter()
        .map(|(name, flags)| (name.to_string(), Light::of(flags)))
        .collect()
}

// =============================================================================
// Controls
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlId {
    OpenHeatSwitch,
    CloseHeatSwitch,
    MagUp,
    Regulate,
    Compressor,
    RefreshInstruments,
}

/// A button: enabled exactly when it carries a command.
///
/// `prompt` marks a button that sends nothing yet but opens an input prompt
/// when pressed, so it is still drawn as live.
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub id: ControlId,
    pub label: &'static str,
    pub command: Option<Command>,
    pub prompt: bool,
}

impl Control {
    fn new(id: ControlId, label: &'static str, command: Option<Command>) -> Self {
        Control {
            id,
            label,
            command,
            prompt: false,
        }
    }

    pub fn enabled(&self) -> bool {
        self.command.is_some()
    }

    /// Pressing it does something: sends a command or opens a prompt.
    pub fn is_active(&self) -> bool {
        self.enabled() || self.prompt
    }
}

fn heat_switch_up(state: &DashboardState) -> bool {
    state.instruments.get(HEAT_SWITCH).map(|f| f.server).unwrap_or(false)
}

pub fn open_heat_switch(state: &DashboardState) -> Control {
    Control::new(
        ControlId::OpenHeatSwitch,
        "Open Heat Switch",
        heat_switch_up(state).then_some(Command::OpenHeatSwitch),
    )
}

pub fn close_heat_switch(state: &DashboardState) -> Control {
    Control::new(
        ControlId::CloseHeatSwitch,
        "Close Heat Switch",
        heat_switch_up(state).then_some(Command::CloseHeatSwitch),
    )
}

pub fn mag_up(state: &DashboardState) -> Control {
    let (label, command) = if state.is_magging_up {
        ("Stop Magging Up", Some(Command::StopMaggingUp))
    } else if state.is_regulating {
        ("Mag Up", None)
    } else {
        ("Mag Up", Some(Command::MagUp))
    };
    Control::new(ControlId::MagUp, label, command)
}

/// `input` is the operator's typed target temperature in kelvin. While idle
/// with no valid input the button prompts for one.
pub fn regulate(state: &DashboardState, input: &str) -> Control {
    if state.is_regulating {
        let stop = Some(Command::StopRegulating);
        return Control::new(ControlId::Regulate, "Stop Regulating", stop);
    }
    if state.is_magging_up {
        return Control::new(ControlId::Regulate, "Regulate", None);
    }
    match parse_regulation_temp(input) {
        Ok(temp) => {
            Control::new(ControlId::Regulate, "Regulate", Some(Command::Regulate { temp }))
        }
        Err(_) => Control {
            prompt: true,
            ..Control::new(ControlId::Regulate, "Regulate", None)
        },
    }
}

pub fn compressor(state: &DashboardState) -> Control {
    let connected = state.instruments.get(COMPRESSOR).map(|f| f.connected).unwrap_or(false);
    match state.compressor_on {
        Some(on) if connected => Control::new(
            ControlId::Compressor,
            if on { "Stop Compressor" } else { "Start Compressor" },
            Some(Command::SetCompressorState { on: !on }),
        ),
        // Device down, or its state is unknown.
        _ => Control::new(ControlId::Compressor, "Start/Stop Compressor", None),
    }
}

pub fn refresh_instruments() -> Control {
    Control::new(
        ControlId::RefreshInstruments,
        "Refresh Instruments",
        Some(Command::RefreshInstruments),
    )
}

pub fn controls(state: &DashboardState, regulate_input: &str) -> Vec<Control> {
    vec![
        open_heat_switch(state),
        close_heat_switch(state),
        mag_up(state),
        regulate(state, regulate_input),
        compressor(state),
        refresh_instruments(),
    ]
}

pub fn parse_regulation_temp(input: &str) -> Result<f64> {
    let trimmed = input.trim().trim_end_matches(['K', 'k']).trim();
    let temp: f64 = match trimmed.parse() {
        Ok(t) => t,
        Err(_) => bail!("not a temperature: {:?}", input),
    };
    if !temp.is_finite() || temp <= 0.0 {
        bail!("regulation temperature must be positive, got {}", temp);
    }
    Ok(temp)
}

/// `Add To Log` for non-blank text.
pub fn add_to_log(text: &str) -> Option<Command> {
    let text = text.trim();
    (!text.is_empty()).then(|| Command::AddToLog {
        text: text.to_string(),
    })
}

// =============================================================================
// Log view
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub alert: bool,
}

/// `[M/D/YYYY HH:MM:SS] message`, rendered in `tz`.
pub fn log_line<Tz: TimeZone>(entry: &LogRecord, tz: &Tz) -> LogLine {
    let stamp = DateTime::from_timestamp(entry.datetime.floor() as i64, 0)
        .map(|utc| {
            let d = utc.with_timezone(tz);
            format!(
                "{}/{}/{} {:02}:{:02}:{:02}",
                d.month(),
                d.day(),
                d.year(),
                d.hour(),
                d.minute(),
                d.second()
            )
        })
        .unwrap_or_else(|| "?".to_string());
    LogLine {
        text: format!("[{}] {}", stamp, entry.message),
        alert: entry.alert,
    }
}

pub fn log_lines<Tz: TimeZone>(state: &DashboardState, tz: &Tz) -> Vec<LogLine> {
    state.log.iter().map(|entry| log_line(entry, tz)).collect()
}
