//! End-to-end flow: frames through the store into views, and a live socket
//! session against the bundled simulator.

use chrono::Utc;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

use adrmon::app::App;
use adrmon::config::Config;
use adrmon::feed::{self, FeedConfig, FeedEvent};
use adrmon::protocol::{parse_frame, Command, Reading};
use adrmon::retry::RetryConfig;
use adrmon::sim::{self, SimConfig};
use adrmon::store::reducer::Limits;
use adrmon::store::state::Sensor;
use adrmon::store::Store;
use adrmon::views::{self, Light};

fn feed_config(url: String) -> FeedConfig {
    FeedConfig {
        url,
        history_minutes: 5,
        retry: RetryConfig {
            base_delay_ms: 50,
            max_delay_ms: 200,
            jitter_factor: 0.0,
        },
        connect_timeout: Duration::from_secs(2),
        channel_capacity: 64,
    }
}

// ---------------------------------------------------------------------------
// Store and views
// ---------------------------------------------------------------------------

#[test]
fn snapshot_then_updates_drive_views() {
    let mut store = Store::new(Limits::default());
    store.apply_frame(
        parse_frame(
            r#"{
            "temps": {"timeStamps": [100.0], "t60K": [55.0], "t03K": [3.2], "tGGG": [1.0], "tFAA": [0.5]},
            "instruments": {"Heat Switch": {"server": true, "connected": true},
                            "Compressor": {"server": true, "connected": false}},
            "log": [{"datetime": 90.0, "message": "older", "alert": false},
                    {"datetime": 95.0, "message": "newer", "alert": true}],
            "compressorOn": true, "isMaggingUp": false, "isRegulating": false,
            "PSCurrent": 0.0, "pressure": null
        }"#,
        )
        .unwrap(),
    );
    store.apply_frame(
        parse_frame(
            r#"{"temps": {"timeStamps": [102.0], "t60K": [54.0], "t03K": [3.2], "tGGG": [1.0], "tFAA": [0.5]}}"#,
        )
        .unwrap(),
    );
    let state = store.state();

    let gauges = views::temp_gauges(state);
    let g60 = gauges.iter().find(|g| g.sensor == Sensor::T60K).unwrap();
    assert!((g60.rate - (-0.5)).abs() < 1e-12);
    assert!(g60.rate_text.contains("0.500"));

    let lines = views::log_lines(state, &Utc);
    assert!(lines[0].text.ends_with("newer"));
    assert!(lines[0].alert);
    assert!(lines[1].text.ends_with("older"));

    let lights = views::instrument_lights(state);
    let compressor = lights.iter().find(|(n, _)| n == "Compressor").unwrap();
    assert_eq!(compressor.1, Light::ServerOnly);

    // Heat switch server is up, compressor device is not.
    assert!(views::open_heat_switch(state).enabled());
    assert!(!views::compressor(state).enabled());
    assert_eq!(views::mag_up(state).command, Some(Command::MagUp));
    assert!(state.pressure.is_nan());
}

#[test]
fn history_reply_merges_with_live_rows() {
    let mut store = Store::new(Limits::default());
    for ts in [200.0, 201.0, 202.0] {
        let text = format!(
            r#"{{"temps": {{"timeStamps": [{ts}], "t60K": [50.0], "t03K": [3.0], "tGGG": [1.0], "tFAA": [0.1]}}}}"#
        );
        store.apply_frame(parse_frame(&text).unwrap());
    }
    // Older rows, one overlapping timestamp, framed by gap rows.
    store.apply_frame(
        parse_frame(
            r#"{"temps": {"timeStamps": [149.999, 150.0, 151.0, 201.0, 202.5],
                          "t60K": [null, 60.0, 59.0, 99.0, null],
                          "t03K": [null, 4.0, 4.0, 4.0, null],
                          "tGGG": [null, 2.0, 2.0, 2.0, null],
                          "tFAA": [null, 1.0, 1.0, 1.0, null]}}"#,
        )
        .unwrap(),
    );
    let temps = &store.state().temps;
    assert!(temps.is_aligned());
    assert!(temps.timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(temps.timestamps, vec![149.999, 150.0, 151.0, 200.0, 201.0, 202.0, 202.5]);
    // The live sample at 201 wins over the replayed one.
    assert_eq!(temps.t60k[4], Reading::Value(50.0));
    assert_eq!(temps.latest(Sensor::T60K), Some(&Reading::Missing));
}

// ---------------------------------------------------------------------------
// Socket round trip
// ---------------------------------------------------------------------------

async fn next_event(events: &mut tokio::sync::mpsc::Receiver<FeedEvent>) -> FeedEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for feed event")
        .expect("feed closed")
}

#[tokio::test]
async fn feed_round_trip_against_simulator() {
    let listener = sim::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(sim::serve(
        listener,
        SimConfig {
            addr: addr.to_string(),
            step: Duration::from_millis(50),
        },
    ));

    let mut app = App::new(&Config::default());
    let (cmd_tx, mut events, feed_task) = feed::spawn(feed_config(format!("ws://{}/ws", addr)));

    let first = next_event(&mut events).await;
    assert!(matches!(first, FeedEvent::Connected { .. }));
    app.on_feed(first);
    assert!(app.is_connected());

    // The snapshot arrives before anything else and carries every instrument.
    let snapshot = next_event(&mut events).await;
    match &snapshot {
        FeedEvent::Frame(frame) => {
            assert!(frame.temps.is_some());
            assert_eq!(frame.instruments.as_ref().map(|i| i.len()), Some(7));
            assert!(frame.log.is_some());
        }
        other => panic!("expected snapshot frame, got {:?}", other),
    }
    app.on_feed(snapshot);

    cmd_tx
        .send(Command::AddToLog {
            text: "round trip".into(),
        })
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "log echo never arrived");
        let evt = next_event(&mut events).await;
        app.on_feed(evt);
        if app.store.state().log.iter().any(|r| r.message == "round trip") {
            break;
        }
    }
    assert!(!app.store.state().temps.is_empty());
    assert!(app.store.state().log_is_sorted());

    drop(cmd_tx);
    drop(events);
    let stopped = timeout(Duration::from_secs(5), feed_task).await.unwrap().unwrap();
    assert!(stopped.is_ok());
    server.abort();
}

#[tokio::test]
async fn feed_reconnects_after_refused_connection() {
    // Reserve a port, then free it so the first attempt is refused.
    let reserved = sim::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let (cmd_tx, mut events, _feed_task) = feed::spawn(feed_config(format!("ws://{}/ws", addr)));
    match next_event(&mut events).await {
        FeedEvent::Disconnected { retry_in, .. } => assert!(retry_in <= Duration::from_millis(200)),
        other => panic!("expected disconnect, got {:?}", other),
    }

    let listener = sim::bind(&addr.to_string()).await.unwrap();
    let server = tokio::spawn(sim::serve(
        listener,
        SimConfig {
            addr: addr.to_string(),
            step: Duration::from_millis(50),
        },
    ));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        assert!(Instant::now() < deadline, "never reconnected");
        if let FeedEvent::Connected { url } = next_event(&mut events).await {
            assert!(url.ends_with("/ws"));
            break;
        }
    }
    drop(cmd_tx);
    server.abort();
}

#[tokio::test]
async fn commands_sent_during_handshake_are_dropped() {
    // Accept the TCP connection but hold off the websocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        sleep(Duration::from_millis(800)).await;
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut seen = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                let name = v["command"].as_str().unwrap_or_default().to_string();
                let done = name == "Add To Log";
                seen.push(name);
                if done {
                    break;
                }
            }
        }
        seen
    });

    let (cmd_tx, mut events, _feed_task) = feed::spawn(feed_config(format!("ws://{}/ws", addr)));
    sleep(Duration::from_millis(200)).await;
    cmd_tx.send(Command::MagUp).await.unwrap();

    assert!(matches!(next_event(&mut events).await, FeedEvent::Connected { .. }));
    cmd_tx
        .send(Command::AddToLog {
            text: "after connect".into(),
        })
        .await
        .unwrap();

    let seen = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(seen, vec!["Get Temperature Data", "Add To Log"]);
    drop(cmd_tx);
}

#[tokio::test]
async fn stalled_handshake_times_out() {
    // Accept connections and never answer the upgrade request.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut cfg = feed_config(format!("ws://{}/ws", addr));
    cfg.connect_timeout = Duration::from_millis(200);
    let (cmd_tx, mut events, _feed_task) = feed::spawn(cfg);
    match next_event(&mut events).await {
        FeedEvent::Disconnected { reason, .. } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected disconnect, got {:?}", other),
    }
    drop(cmd_tx);
    holder.abort();
}
