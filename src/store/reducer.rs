//! Pure reducer: (State, Action) -> State
//!
//! The only path by which dashboard state changes. A decoded frame becomes
//! a fixed sequence of actions (temps, instruments, log, scalars) and each
//! action replaces or extends one slice of state.

use serde_json::{Map, Value};

use super::state::{AppendStats, DashboardState};
use crate::protocol::{InboundFrame, InstrumentFlags, LogRecord, TempBatch};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    UpdateTemps(TempBatch),
    UpdateInstruments(Vec<(String, InstrumentFlags)>),
    UpdateLog(Vec<LogRecord>),
    UpdateState(Map<String, Value>),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::UpdateTemps(_) => "update_temps",
            Action::UpdateInstruments(_) => "update_instruments",
            Action::UpdateLog(_) => "update_log",
            Action::UpdateState(_) => "update_state",
        }
    }
}

/// Retention limits applied by the reducer.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub temp_capacity: usize,
    pub log_capacity: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            temp_capacity: 86_400,
            log_capacity: 500,
        }
    }
}

/// Anything unusual the reducer had to smooth over.
#[derive(Debug, Clone, PartialEq)]
pub enum Note {
    RaggedTemps { kept: usize, dropped: usize },
    TempsResorted,
    TempsEvicted(usize),
    LogEvicted(usize),
    BadScalar { key: String, value: Value },
}

#[derive(Debug, Default)]
pub struct ReducerOutput {
    pub notes: Vec<Note>,
}

/// Split a frame into actions, in dispatch order.
pub fn actions_from_frame(frame: InboundFrame) -> Vec<Action> {
    let mut actions = Vec::with_capacity(4);
    if let Some(temps) = frame.temps {
        actions.push(Action::UpdateTemps(temps));
    }
    if let Some(instruments) = frame.instruments {
        actions.push(Action::UpdateInstruments(instruments));
    }
    if let Some(log) = frame.log {
        actions.push(Action::UpdateLog(log));
    }
    if !frame.scalars.is_empty() {
        actions.push(Action::UpdateState(frame.scalars));
    }
    actions
}

pub fn reduce(state: &mut DashboardState, action: Action, limits: &Limits) -> ReducerOutput {
    let mut out = ReducerOutput::default();
    match action {
        Action::UpdateTemps(batch) => {
            let stats = state.temps.append(batch, limits.temp_capacity);
            temps_notes(stats, &mut out.notes);
        }
        Action::UpdateInstruments(instruments) => {
            for (name, flags) in instruments {
                state.instruments.upsert(name, flags);
            }
        }
        Action::UpdateLog(entries) => {
            state.log.extend(entries);
            // Newest first; ties keep arrival order.
            state.log.sort_by(|a, b| b.datetime.total_cmp(&a.datetime));
            if state.log.len() > limits.log_capacity {
                let excess = state.log.len() - limits.log_capacity;
                state.log.truncate(limits.log_capacity);
                out.notes.push(Note::LogEvicted(excess));
            }
        }
        Action::UpdateState(scalars) => {
            for (key, value) in scalars {
                apply_scalar(state, key, value, &mut out.notes);
            }
        }
    }
    out
}

fn temps_notes(stats: AppendStats, notes: &mut Vec<Note>) {
    if stats.ragged_dropped > 0 {
        notes.push(Note::RaggedTemps {
            kept: stats.appended,
            dropped: stats.ragged_dropped,
        });
    }
    if stats.resorted {
        notes.push(Note::TempsResorted);
    }
    if stats.evicted > 0 {
        notes.push(Note::TempsEvicted(stats.evicted));
    }
}

fn apply_scalar(state: &mut DashboardState, key: String, value: Value, notes: &mut Vec<Note>) {
    let slot = match key.as_str() {
        "isMaggingUp" => Some(Slot::Flag(&mut state.is_magging_up)),
        "isRegulating" => Some(Slot::Flag(&mut state.is_regulating)),
        "compressorOn" => Some(Slot::Tristate(&mut state.compressor_on)),
        "pressure" => Some(Slot::Number(&mut state.pressure)),
        "PSVoltage" => Some(Slot::Number(&mut state.ps_voltage)),
        "PSCurrent" => Some(Slot::Number(&mut state.ps_current)),
        "backEMF" => Some(Slot::Number(&mut state.back_emf)),
        _ => None,
    };
    let accepted = match slot {
        Some(Slot::Flag(flag)) => match value {
            Value::Bool(b) => {
                *flag = b;
                true
            }
            _ => false,
        },
        Some(Slot::Tristate(flag)) => match value {
            Value::Bool(b) => {
                *flag = Some(b);
                true
            }
            Value::Null => {
                *flag = None;
                true
            }
            _ => false,
        },
        Some(Slot::Number(num)) => match number_of(&value) {
            Some(v) => {
                *num = v;
                true
            }
            None => false,
        },
        None => {
            state.extra.insert(key, value);
            return;
        }
    };
    if !accepted {
        notes.push(Note::BadScalar { key, value });
    }
}

enum Slot<'a> {
    Flag(&'a mut bool),
    Tristate(&'a mut Option<bool>),
    Number(&'a mut f64),
}

/// Null is NaN on the wire.
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(f64::NAN),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_frame;
    use serde_json::json;

    fn log_entry(ts: f64, msg: &str) -> LogRecord {
        LogRecord {
            datetime: ts,
            message: msg.to_string(),
            alert: false,
        }
    }

    #[test]
    fn test_frame_actions_in_fixed_order() {
        let frame = parse_frame(
            r#"{"isRegulating": false, "log": [], "instruments": {},
                "temps": {"timeStamps": [], "t60K": [], "t03K": [], "tGGG": [], "tFAA": []}}"#,
        )
        .unwrap();
        let names: Vec<&str> = actions_from_frame(frame).iter().map(|a| a.name()).collect();
        assert_eq!(
            names,
            vec!["update_temps", "update_instruments", "update_log", "update_state"]
        );
    }

    #[test]
    fn test_log_sorted_newest_first() {
        let mut state = DashboardState::new();
        let limits = Limits::default();
        reduce(
            &mut state,
            Action::UpdateLog(vec![log_entry(10.0, "a"), log_entry(30.0, "c")]),
            &limits,
        );
        reduce(&mut state, Action::UpdateLog(vec![log_entry(20.0, "b")]), &limits);
        let msgs: Vec<&str> = state.log.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(msgs, vec!["c", "b", "a"]);
        assert!(state.log_is_sorted());
    }

    #[test]
    fn test_log_capacity_drops_oldest() {
        let mut state = DashboardState::new();
        let limits = Limits {
            temp_capacity: 10,
            log_capacity: 2,
        };
        let out = reduce(
            &mut state,
            Action::UpdateLog(vec![log_entry(1.0, "old"), log_entry(2.0, "mid"), log_entry(3.0, "new")]),
            &limits,
        );
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].message, "mid");
        assert_eq!(out.notes, vec![Note::LogEvicted(1)]);
    }

    #[test]
    fn test_scalars_merge() {
        let mut state = DashboardState::new();
        let scalars = json!({
            "isMaggingUp": false,
            "compressorOn": null,
            "pressure": 0.012,
            "PSCurrent": null,
            "cycle": 42
        });
        let Value::Object(map) = scalars else { unreachable!() };
        let out = reduce(&mut state, Action::UpdateState(map), &Limits::default());
        assert!(out.notes.is_empty());
        assert!(!state.is_magging_up);
        assert!(state.is_regulating);
        assert_eq!(state.compressor_on, None);
        assert_eq!(state.pressure, 0.012);
        assert!(state.ps_current.is_nan());
        assert_eq!(state.extra.get("cycle"), Some(&json!(42)));
    }

    #[test]
    fn test_bad_scalar_keeps_previous_value() {
        let mut state = DashboardState::new();
        let mut map = Map::new();
        map.insert("isRegulating".into(), json!("yes"));
        let out = reduce(&mut state, Action::UpdateState(map), &Limits::default());
        assert!(state.is_regulating);
        assert!(matches!(out.notes[0], Note::BadScalar { .. }));
    }

    #[test]
    fn test_instruments_replace_wholesale() {
        let mut state = DashboardState::new();
        let limits = Limits::default();
        let on = InstrumentFlags {
            server: true,
            connected: true,
        };
        reduce(
            &mut state,
            Action::UpdateInstruments(vec![("Compressor".into(), on)]),
            &limits,
        );
        reduce(
            &mut state,
            Action::UpdateInstruments(vec![("Compressor".into(), InstrumentFlags::default())]),
            &limits,
        );
        assert_eq!(state.instruments.get("Compressor"), Some(InstrumentFlags::default()));
    }
}
