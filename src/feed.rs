//! Persistent websocket session to the ADR server.
//!
//! The feed task owns the socket. It forwards decoded frames to the UI in
//! arrival order and writes operator commands as they come in. When the
//! socket drops it backs off and reconnects until either channel closes.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::logging::{
    log, log_bad_frame, log_command, log_connected, log_disconnected, obj, v_str, Domain, Level,
};
use crate::protocol::{parse_frame, Command, InboundFrame};
use crate::retry::{Backoff, RetryConfig};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected { url: String },
    Frame(InboundFrame),
    Disconnected { reason: String, retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    /// Minutes of temperature history requested after each connect.
    pub history_minutes: u32,
    pub retry: RetryConfig,
    /// Limit on one connect attempt, handshake included.
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
}

impl FeedConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            url: cfg.ws_url.clone(),
            history_minutes: cfg.history_minutes,
            retry: RetryConfig::from_config(cfg),
            connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
            channel_capacity: 256,
        }
    }
}

enum Connect {
    Open(Socket),
    Failed(String),
    Shutdown,
}

enum SessionEnd {
    /// The UI went away; stop for good.
    Shutdown,
    Dropped(String),
}

/// Start the feed task. Returns the command sender and event receiver.
pub fn spawn(
    cfg: FeedConfig,
) -> (mpsc::Sender<Command>, mpsc::Receiver<FeedEvent>, JoinHandle<Result<()>>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(cfg.channel_capacity);
    let (evt_tx, evt_rx) = mpsc::channel(cfg.channel_capacity);
    let handle = tokio::spawn(run(cfg, cmd_rx, evt_tx));
    (cmd_tx, evt_rx, handle)
}

pub async fn run(
    cfg: FeedConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<FeedEvent>,
) -> Result<()> {
    let mut backoff = Backoff::new(cfg.retry.clone());
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let reason = match connect(&cfg, &mut commands).await {
            Connect::Shutdown => return Ok(()),
            Connect::Failed(reason) => reason,
            Connect::Open(ws) => {
                backoff.reset();
                log_connected(&cfg.url, attempt);
                if events
                    .send(FeedEvent::Connected {
                        url: cfg.url.clone(),
                    })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                match session(ws, &cfg, &mut commands, &events).await {
                    SessionEnd::Shutdown => return Ok(()),
                    SessionEnd::Dropped(reason) => reason,
                }
            }
        };

        let retry_in = backoff.next_delay();
        log_disconnected(&cfg.url, &reason, retry_in.as_millis() as u64);
        if events
            .send(FeedEvent::Disconnected { reason, retry_in })
            .await
            .is_err()
        {
            return Ok(());
        }
        if !wait_offline(retry_in, &mut commands).await {
            return Ok(());
        }
    }
}

/// One bounded connect attempt. Commands that arrive before the socket is
/// open are dropped like any other offline command.
async fn connect(cfg: &FeedConfig, commands: &mut mpsc::Receiver<Command>) -> Connect {
    let attempt = timeout(cfg.connect_timeout, connect_async(cfg.url.as_str()));
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            res = &mut attempt => return match res {
                Ok(Ok((ws, _))) => Connect::Open(ws),
                Ok(Err(err)) => Connect::Failed(err.to_string()),
                Err(_) => Connect::Failed(format!(
                    "connect timed out after {} ms",
                    cfg.connect_timeout.as_millis()
                )),
            },
            cmd = commands.recv() => match cmd {
                Some(cmd) => drop_offline(&cmd),
                None => return Connect::Shutdown,
            },
        }
    }
}

/// Sleep out the backoff. Commands issued while offline are discarded rather
/// than replayed against a server state the operator has not seen.
/// Returns false when the command channel closed.
async fn wait_offline(delay: Duration, commands: &mut mpsc::Receiver<Command>) -> bool {
    let timer = sleep(delay);
    tokio::pin!(timer);
    loop {
        tokio::select! {
            _ = &mut timer => return true,
            cmd = commands.recv() => match cmd {
                Some(cmd) => drop_offline(&cmd),
                None => return false,
            },
        }
    }
}

fn drop_offline(cmd: &Command) {
    log(
        Level::Warn,
        Domain::Command,
        "dropped_offline",
        obj(&[("command", v_str(cmd.name()))]),
    );
}

async fn session(
    ws: Socket,
    cfg: &FeedConfig,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<FeedEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    let history = Command::GetTemperatureData {
        minutes: cfg.history_minutes,
    };
    if let Err(err) = send_command(&mut write, &history).await {
        return SessionEnd::Dropped(err.to_string());
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(frame) => {
                        if events.send(FeedEvent::Frame(frame)).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(err) => log_bad_frame(&err.to_string(), text.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by server: {}", f.reason))
                        .unwrap_or_else(|| "closed by server".to_string());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(other)) => log(
                    Level::Trace,
                    Domain::Feed,
                    "ignored_message",
                    obj(&[("len", json!(other.len()))]),
                ),
                Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
            cmd = commands.recv() => match cmd {
                Some(cmd) => {
                    if let Err(err) = send_command(&mut write, &cmd).await {
                        return SessionEnd::Dropped(err.to_string());
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
        }
    }
}

async fn send_command<S>(write: &mut S, cmd: &Command) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let payload = cmd.to_json()?;
    log_command(cmd.name(), &payload);
    write.send(Message::Text(payload)).await?;
    Ok(())
}
