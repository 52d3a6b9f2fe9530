use std::io;

use anyhow::Result;
use crossterm::event::{Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use futures_util::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use serde_json::json;
use tokio::time::{interval, Duration, MissedTickBehavior};

use adrmon::app::{App, AppAction};
use adrmon::config::Config;
use adrmon::feed::{self, FeedConfig};
use adrmon::logging::{self, log, obj, v_str, Domain, Level};
use adrmon::ui;

type Term = Terminal<CrosstermBackend<io::Stdout>>;

fn setup_terminal() -> Result<Term> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    // Restore the terminal before the panic message prints
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(info);
    }));
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Term) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    cfg.validate()?;

    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("ws_url", v_str(&cfg.ws_url)),
            ("history_minutes", json!(cfg.history_minutes)),
            ("temp_capacity", json!(cfg.temp_capacity)),
            ("log_capacity", json!(cfg.log_capacity)),
            ("chart_window", v_str(cfg.chart_window.label())),
        ]),
    );

    let mut terminal = setup_terminal()?;
    let result = run(&mut terminal, &cfg).await;
    restore_terminal(&mut terminal)?;

    match &result {
        Ok(()) => log(Level::Info, Domain::System, "shutdown", obj(&[])),
        Err(err) => log(
            Level::Error,
            Domain::System,
            "fatal",
            obj(&[("error", v_str(&err.to_string()))]),
        ),
    }
    logging::flush();
    if let Some(dir) = logging::run_dir() {
        eprintln!("[adrmon] logs in {}", dir.display());
    }
    result
}

async fn run(terminal: &mut Term, cfg: &Config) -> Result<()> {
    let mut app = App::new(cfg);
    let (cmd_tx, mut events, feed_task) = feed::spawn(FeedConfig::from_config(cfg));
    let mut keys = EventStream::new();
    let mut tick = interval(Duration::from_millis(cfg.tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut feed_alive = true;
    let mut drawn_revision = None;
    let mut dirty = true;

    loop {
        if dirty || drawn_revision != Some(app.store.revision()) {
            terminal.draw(|f| ui::draw(f, &app))?;
            drawn_revision = Some(app.store.revision());
            dirty = false;
        }

        tokio::select! {
            evt = events.recv(), if feed_alive => match evt {
                Some(evt) => app.on_feed(evt),
                None => {
                    feed_alive = false;
                    app.notice = Some("Feed stopped".to_string());
                    log(Level::Error, Domain::Feed, "feed_stopped", obj(&[]));
                    dirty = true;
                }
            },
            term = keys.next() => match term {
                Some(Ok(Event::Key(key))) => {
                    dirty = true;
                    match app.on_key(key) {
                        AppAction::None => {}
                        AppAction::Quit => break,
                        AppAction::Send(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                app.notice = Some("Feed stopped, command not sent".to_string());
                            }
                        }
                    }
                }
                Some(Ok(Event::Resize(_, _))) => dirty = true,
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => break,
            },
            _ = tick.tick() => dirty = true,
        }
    }

    // Closing the command channel ends the feed session.
    drop(cmd_tx);
    drop(events);
    match tokio::time::timeout(Duration::from_secs(2), feed_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => log(
            Level::Warn,
            Domain::Feed,
            "feed_error",
            obj(&[("error", v_str(&err.to_string()))]),
        ),
        Ok(Err(err)) => log(
            Level::Warn,
            Domain::Feed,
            "feed_join_error",
            obj(&[("error", v_str(&err.to_string()))]),
        ),
        Err(_) => log(Level::Warn, Domain::Feed, "feed_shutdown_timeout", obj(&[])),
    }
    Ok(())
}
