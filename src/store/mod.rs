//! Client-side state container.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Socket Feed │────►│   Reducer    │────►│    State     │
//! │   (frames)   │     │  (pure fn)   │     │ (revisioned) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!                                                  │
//!                                                  ▼
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │   Commands   │◄────│    Views     │
//!                      │  (socket)    │     │ (projections)│
//!                      └──────────────┘     └──────────────┘
//! ```

pub mod reducer;
pub mod state;

use serde_json::json;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::protocol::InboundFrame;
use reducer::{actions_from_frame, reduce, Action, Limits, Note};
use state::DashboardState;

/// Owns the dashboard state. Views poll `revision` to know when to redraw.
#[derive(Debug, Default)]
pub struct Store {
    state: DashboardState,
    limits: Limits,
    revision: u64,
}

impl Store {
    pub fn new(limits: Limits) -> Self {
        Self {
            state: DashboardState::new(),
            limits,
            revision: 0,
        }
    }

    pub fn state(&self) -> &DashboardState {
        &self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn dispatch(&mut self, action: Action) -> Vec<Note> {
        let name = action.name();
        let out = reduce(&mut self.state, action, &self.limits);
        self.revision += 1;
        for note in &out.notes {
            log_note(name, note);
        }
        out.notes
    }

    /// Dispatch every action carried by one inbound frame.
    pub fn apply_frame(&mut self, frame: InboundFrame) -> Vec<Note> {
        actions_from_frame(frame)
            .into_iter()
            .flat_map(|action| self.dispatch(action))
            .collect()
    }
}

fn log_note(action: &str, note: &Note) {
    let (level, fields) = match note {
        Note::RaggedTemps { kept, dropped } => (
            Level::Warn,
            obj(&[("note", v_str("ragged_temps")), ("kept", json!(kept)), ("dropped", json!(dropped))]),
        ),
        Note::TempsResorted => (Level::Debug, obj(&[("note", v_str("temps_resorted"))])),
        Note::TempsEvicted(n) => (Level::Trace, obj(&[("note", v_str("temps_evicted")), ("count", json!(n))])),
        Note::LogEvicted(n) => (Level::Trace, obj(&[("note", v_str("log_evicted")), ("count", json!(n))])),
        Note::BadScalar { key, value } => (
            Level::Warn,
            obj(&[("note", v_str("bad_scalar")), ("key", v_str(key)), ("value", value.clone())]),
        ),
    };
    log(level, Domain::Store, action, fields);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_frame;

    #[test]
    fn test_revision_counts_dispatches() {
        let mut store = Store::new(Limits::default());
        assert_eq!(store.revision(), 0);
        let frame = parse_frame(
            r#"{"log": [{"datetime": 1.0, "message": "hi", "alert": false}], "pressure": 0.5}"#,
        )
        .unwrap();
        store.apply_frame(frame);
        assert_eq!(store.revision(), 2);
        assert_eq!(store.state().pressure, 0.5);
        assert_eq!(store.state().log.len(), 1);
    }

    #[test]
    fn test_empty_frame_changes_nothing() {
        let mut store = Store::new(Limits::default());
        store.apply_frame(parse_frame("{}").unwrap());
        assert_eq!(store.revision(), 0);
        assert!(store.state().temps.is_empty());
        assert!(store.state().log.is_empty());
        assert!(store.state().is_magging_up);
    }
}
