//! Operator interaction: key presses become commands through the control
//! projections, so a disabled control never reaches the socket.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::time::Duration;

use crate::chart::ChartWindow;
use crate::config::Config;
use crate::feed::FeedEvent;
use crate::protocol::Command;
use crate::store::reducer::Limits;
use crate::store::Store;
use crate::views::{self, Control};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// Typing a log message.
    LogEntry,
    /// Typing a regulation temperature.
    RegulateEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Connection {
    Connecting,
    Connected { url: String },
    Offline { reason: String, retry_in: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppAction {
    None,
    Send(Command),
    Quit,
}

pub struct App {
    pub store: Store,
    pub mode: Mode,
    pub log_input: String,
    pub regulate_input: String,
    pub chart_window: ChartWindow,
    pub connection: Connection,
    /// One-line feedback shown under the controls.
    pub notice: Option<String>,
    /// History requested for the `all` window: what the series can hold at 1 Hz.
    all_minutes: u32,
}

impl App {
    pub fn new(cfg: &Config) -> Self {
        Self {
            store: Store::new(Limits {
                temp_capacity: cfg.temp_capacity,
                log_capacity: cfg.log_capacity,
            }),
            mode: Mode::Normal,
            log_input: String::new(),
            regulate_input: String::new(),
            chart_window: cfg.chart_window,
            connection: Connection::Connecting,
            notice: None,
            all_minutes: u32::try_from(cfg.temp_capacity / 60)
                .unwrap_or(u32::MAX)
                .max(cfg.history_minutes),
        }
    }

    pub fn on_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected { url } => {
                self.connection = Connection::Connected { url };
            }
            FeedEvent::Frame(frame) => {
                self.store.apply_frame(frame);
            }
            FeedEvent::Disconnected { reason, retry_in } => {
                self.connection = Connection::Offline { reason, retry_in };
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, Connection::Connected { .. })
    }

    pub fn controls(&self) -> Vec<Control> {
        views::controls(self.store.state(), &self.regulate_input)
    }

    pub fn on_key(&mut self, key: KeyEvent) -> AppAction {
        if key.kind != KeyEventKind::Press {
            return AppAction::None;
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return AppAction::Quit;
        }
        match self.mode {
            Mode::Normal => self.on_normal_key(key.code),
            Mode::LogEntry => self.on_log_key(key.code),
            Mode::RegulateEntry => self.on_regulate_key(key.code),
        }
    }

    fn on_normal_key(&mut self, code: KeyCode) -> AppAction {
        let state = self.store.state();
        let control = match code {
            KeyCode::Char('q') | KeyCode::Esc => return AppAction::Quit,
            KeyCode::Char('o') => views::open_heat_switch(state),
            KeyCode::Char('c') => views::close_heat_switch(state),
            KeyCode::Char('m') => views::mag_up(state),
            KeyCode::Char('p') => views::compressor(state),
            KeyCode::Char('f') => views::refresh_instruments(),
            KeyCode::Char('r') => {
                let control = views::regulate(state, "");
                if control.prompt {
                    self.mode = Mode::RegulateEntry;
                    self.notice = Some("Regulation temperature [K], Enter to send".to_string());
                    return AppAction::None;
                }
                control
            }
            KeyCode::Char('l') => {
                self.mode = Mode::LogEntry;
                self.notice = Some("Log a message, Enter to send".to_string());
                return AppAction::None;
            }
            KeyCode::Char('w') => {
                self.chart_window = self.chart_window.next();
                self.notice = Some(format!("Chart window: {}", self.chart_window.label()));
                return AppAction::Send(Command::GetTemperatureData {
                    minutes: self.chart_window.minutes().unwrap_or(self.all_minutes),
                });
            }
            _ => return AppAction::None,
        };
        self.trigger(control)
    }

    fn on_log_key(&mut self, code: KeyCode) -> AppAction {
        match code {
            KeyCode::Esc => {
                self.mode = Mode::Normal;
                self.notice = None;
                AppAction::None
            }
            KeyCode::Enter => {
                self.mode = Mode::Normal;
                let text = std::mem::take(&mut self.log_input);
                match views::add_to_log(&text) {
                    Some(cmd) => {
                        self.notice = None;
                        AppAction::Send(cmd)
                    }
                    None => {
                        self.notice = Some("Nothing to log".to_string());
                        AppAction::None
                    }
                }
            }
            KeyCode::Backspace => {
                self.log_input.pop();
                AppAction::None
            }
            KeyCode::Char(ch) => {
                self.log_input.push(ch);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn on_regulate_key(&mut self, code: KeyCode) -> AppAction {
        match code {
            KeyCode::Esc => {
                self.mode = Mode::Normal;
                self.notice = None;
                AppAction::None
            }
            KeyCode::Enter => {
                self.mode = Mode::Normal;
                let control = views::regulate(self.store.state(), &self.regulate_input);
                if !control.enabled() {
                    if let Err(err) = views::parse_regulation_temp(&self.regulate_input) {
                        self.notice = Some(err.to_string());
                        return AppAction::None;
                    }
                }
                self.trigger(control)
            }
            KeyCode::Backspace => {
                self.regulate_input.pop();
                AppAction::None
            }
            KeyCode::Char(ch) if ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '-' | '+') => {
                self.regulate_input.push(ch);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn trigger(&mut self, control: Control) -> AppAction {
        match control.command {
            Some(cmd) => {
                self.notice = Some(format!("Sent: {}", cmd.name()));
                AppAction::Send(cmd)
            }
            None => {
                self.notice = Some(format!("{} is not available", control.label));
                AppAction::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart;
    use crate::protocol::{parse_frame, InstrumentFlags, Reading, TempBatch};
    use crate::store::reducer::Action;
    use chrono::Utc;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn type_text(app: &mut App, text: &str) {
        for ch in text.chars() {
            assert_eq!(app.on_key(key(KeyCode::Char(ch))), AppAction::None);
        }
    }

    fn idle_app() -> App {
        let mut app = App::new(&Config::default());
        app.on_feed(FeedEvent::Frame(
            parse_frame(r#"{"isMaggingUp": false, "isRegulating": false}"#).unwrap(),
        ));
        app
    }

    #[test]
    fn test_quit_keys() {
        let mut app = App::new(&Config::default());
        assert_eq!(app.on_key(key(KeyCode::Char('q'))), AppAction::Quit);
        assert_eq!(
            app.on_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            AppAction::Quit
        );
    }

    #[test]
    fn test_disabled_control_sends_nothing() {
        let mut app = App::new(&Config::default());
        assert_eq!(app.on_key(key(KeyCode::Char('o'))), AppAction::None);
        assert_eq!(app.notice.as_deref(), Some("Open Heat Switch is not available"));
    }

    #[test]
    fn test_heat_switch_after_server_up() {
        let mut app = App::new(&Config::default());
        app.on_feed(FeedEvent::Frame(
            parse_frame(r#"{"instruments": {"Heat Switch": {"server": true, "connected": true}}}"#)
                .unwrap(),
        ));
        assert_eq!(app.on_key(key(KeyCode::Char('c'))), AppAction::Send(Command::CloseHeatSwitch));
    }

    #[test]
    fn test_regulate_prompt_flow() {
        let mut app = idle_app();
        assert_eq!(app.on_key(key(KeyCode::Char('r'))), AppAction::None);
        assert_eq!(app.mode, Mode::RegulateEntry);
        type_text(&mut app, "0.1x");
        assert_eq!(app.regulate_input, "0.1");
        assert_eq!(
            app.on_key(key(KeyCode::Enter)),
            AppAction::Send(Command::Regulate { temp: 0.1 })
        );
        assert_eq!(app.mode, Mode::Normal);
    }

    #[test]
    fn test_regulate_rejects_bad_temperature() {
        let mut app = idle_app();
        app.on_key(key(KeyCode::Char('r')));
        type_text(&mut app, "-");
        assert_eq!(app.on_key(key(KeyCode::Enter)), AppAction::None);
        assert!(app.notice.unwrap().contains("not a temperature"));
    }

    #[test]
    fn test_stop_regulating_without_prompt() {
        let mut app = App::new(&Config::default());
        assert_eq!(app.on_key(key(KeyCode::Char('r'))), AppAction::Send(Command::StopRegulating));
        assert_eq!(app.mode, Mode::Normal);
    }

    #[test]
    fn test_log_entry_flow() {
        let mut app = App::new(&Config::default());
        app.on_key(key(KeyCode::Char('l')));
        type_text(&mut app, "fill LN2q");
        app.on_key(key(KeyCode::Backspace));
        assert_eq!(
            app.on_key(key(KeyCode::Enter)),
            AppAction::Send(Command::AddToLog {
                text: "fill LN2".into()
            })
        );
        assert!(app.log_input.is_empty());
    }

    #[test]
    fn test_window_cycle_requests_history() {
        let mut app = App::new(&Config::default());
        assert_eq!(
            app.on_key(key(KeyCode::Char('w'))),
            AppAction::Send(Command::GetTemperatureData { minutes: 360 })
        );
        assert_eq!(app.chart_window, ChartWindow::SixHours);
    }

    #[test]
    fn test_all_window_requests_full_retention() {
        let cfg = Config::from_lookup(|k| (k == "CHART_WINDOW").then(|| "24h".to_string()));
        let mut app = App::new(&cfg);
        assert_eq!(
            app.on_key(key(KeyCode::Char('w'))),
            AppAction::Send(Command::GetTemperatureData { minutes: 1440 })
        );
        assert_eq!(app.chart_window, ChartWindow::All);
    }

    #[test]
    fn test_default_capacity_fills_six_hour_window() {
        let mut app = App::new(&Config::default());
        let t0 = 1_700_000_000.0;
        let mut batch = TempBatch::default();
        for i in 0..=21_600 {
            let v = Reading::Value(4.0);
            batch.push_row(t0 + i as f64, [v.clone(), v.clone(), v.clone(), v]);
        }
        app.store.dispatch(Action::UpdateTemps(batch));
        assert_eq!(app.store.state().temps.len(), 21_601);

        let data = chart::project(app.store.state(), ChartWindow::SixHours, 500, &Utc).unwrap();
        assert_eq!(data.x_bounds, [t0, t0 + 21_600.0]);
        assert_eq!(data.traces[0].points().next().map(|p| p.0), Some(t0));
    }

    #[test]
    fn test_compressor_toggle_from_state() {
        let mut app = idle_app();
        app.store.dispatch(Action::UpdateInstruments(vec![(
            "Compressor".into(),
            InstrumentFlags {
                server: true,
                connected: true,
            },
        )]));
        assert_eq!(
            app.on_key(key(KeyCode::Char('p'))),
            AppAction::Send(Command::SetCompressorState { on: true })
        );
    }

    #[test]
    fn test_connection_tracking() {
        let mut app = App::new(&Config::default());
        assert!(!app.is_connected());
        app.on_feed(FeedEvent::Connected { url: "ws://x/ws".into() });
        assert!(app.is_connected());
        app.on_feed(FeedEvent::Disconnected {
            reason: "reset".into(),
            retry_in: Duration::from_millis(500),
        });
        assert!(!app.is_connected());
    }
}
