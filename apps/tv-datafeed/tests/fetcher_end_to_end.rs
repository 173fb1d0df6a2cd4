//! Symbol Fetcher End-to-End Tests
//!
//! Drives `SymbolFetcher` through a scripted in-process transport: the
//! handshake, heartbeats, terminal markers, attempt retries and connection
//! lifecycle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tv_datafeed::infrastructure::tradingview::codec::frame;
use tv_datafeed::{
    Attempt, AuthToken, BatchRetryCoordinator, BatchSettings, Connection, ConnectionManager,
    ConnectionSettings, Connector, Endpoint, FetchOutcome, FetchRequest, FetcherSettings,
    HistoryFetcher, Interval, RetryPolicy, SymbolFetcher, TransportError, encode_message,
};

// =============================================================================
// Scripted transport
// =============================================================================

/// What the server does on the next receive.
#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Hang,
}

/// Builds the replies for one connection from everything sent on it so far.
type Script = Arc<dyn Fn(&str) -> Vec<Reply> + Send + Sync>;

#[derive(Default)]
struct Recorder {
    connects: AtomicU32,
    closes: AtomicU32,
    sent: Mutex<Vec<String>>,
}

struct ScriptedConnector {
    script: Script,
    refuse: bool,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            recorder: Arc::clone(&self.recorder),
            handshake: String::new(),
            replies: None,
        }))
    }
}

struct ScriptedConnection {
    script: Script,
    recorder: Arc<Recorder>,
    handshake: String,
    replies: Option<VecDeque<Reply>>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.handshake.push_str(&text);
        self.recorder.sent.lock().push(text);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        let replies = self
            .replies
            .get_or_insert_with(|| (self.script)(&self.handshake).into());
        match replies.pop_front() {
            Some(Reply::Text(text)) => Ok(Some(text)),
            Some(Reply::Hang) => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn chart_data(bars: &[[f64; 6]]) -> Reply {
    let records: Vec<_> = bars
        .iter()
        .enumerate()
        .map(|(i, v)| json!({ "i": i, "v": v }))
        .collect();
    Reply::Text(
        encode_message(
            "timescale_update",
            &[json!("cs_test"), json!({ "s1": { "s": records } })],
        )
        .unwrap(),
    )
}

fn completed() -> Reply {
    Reply::Text(encode_message("series_completed", &[json!("cs_test"), json!("s1")]).unwrap())
}

fn series_error() -> Reply {
    Reply::Text(
        encode_message(
            "series_error",
            &[json!("cs_test"), json!("s1"), json!("invalid symbol")],
        )
        .unwrap(),
    )
}

fn five_bars() -> Vec<[f64; 6]> {
    (0..5)
        .map(|i| {
            let base = 100.0 + f64::from(i);
            [
                1_704_067_200.0 + f64::from(i) * 86_400.0,
                base,
                base + 2.0,
                base - 1.0,
                base + 1.0,
                1000.0 * f64::from(i + 1),
            ]
        })
        .collect()
}

struct Harness {
    fetcher: SymbolFetcher,
    recorder: Arc<Recorder>,
}

fn harness(script: Script, refuse: bool, connect_attempts: u32) -> Harness {
    harness_with(script, refuse, connect_attempts, FetcherSettings {
        max_messages: 100,
        attempt_deadline: Duration::from_secs(60),
        retry: RetryPolicy::new(3, Duration::from_secs(3)),
    })
}

fn harness_with(
    script: Script,
    refuse: bool,
    connect_attempts: u32,
    settings: FetcherSettings,
) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let connector = ScriptedConnector {
        script,
        refuse,
        recorder: Arc::clone(&recorder),
    };
    let connections = ConnectionManager::new(
        Arc::new(connector),
        ConnectionSettings {
            endpoint: Endpoint::new("ws://stub.invalid/socket"),
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            connect_retry: RetryPolicy::new(connect_attempts, Duration::from_secs(1)),
        },
    );
    let fetcher = SymbolFetcher::new(connections, AuthToken::anonymous(), settings)
        .with_rng(StdRng::seed_from_u64(11));
    Harness { fetcher, recorder }
}

fn script(f: impl Fn(&str) -> Vec<Reply> + Send + Sync + 'static) -> Script {
    Arc::new(f)
}

fn request(symbol: &str) -> FetchRequest {
    FetchRequest::new(symbol, "NSE", Interval::Daily, 5).unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn fetches_bars_in_stream_order() {
    let h = harness(script(|_| vec![chart_data(&five_bars()), completed()]), false, 1);

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert!(outcome.is_success());
    let series = outcome.into_series();
    assert_eq!(series.symbol, "RELIANCE");
    assert_eq!(series.len(), 5);
    assert_eq!(series.bars[0].open, 100.0);
    assert_eq!(series.bars[4].close, 105.0);
    assert_eq!(series.bars[4].volume, 5000.0);
    assert!(series.bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    assert_eq!(h.recorder.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn sends_nine_call_handshake_in_order() {
    let h = harness(script(|_| vec![chart_data(&five_bars()), completed()]), false, 1);

    h.fetcher.fetch(&request("RELIANCE")).await;

    let sent = h.recorder.sent.lock().clone();
    let methods: Vec<&str> = sent
        .iter()
        .map(|m| {
            let start = m.find(r#""m":""#).unwrap() + 5;
            let end = start + m[start..].find('"').unwrap();
            &m[start..end]
        })
        .collect();
    assert_eq!(
        methods,
        vec![
            "set_auth_token",
            "chart_create_session",
            "quote_create_session",
            "quote_set_fields",
            "quote_add_symbols",
            "quote_fast_symbols",
            "resolve_symbol",
            "create_series",
            "switch_timezone",
        ]
    );
    assert!(sent[0].contains("unauthorized_user_token"));
    assert!(sent[7].contains(r#""1D",5]"#));
}

#[tokio::test(start_paused = true)]
async fn exchange_prefix_is_sent_but_stripped_from_tag() {
    let h = harness(
        script(|handshake| {
            if handshake.contains(r#"\"symbol\":\"NSE:TCS\""#) {
                vec![chart_data(&five_bars()), completed()]
            } else {
                vec![series_error()]
            }
        }),
        false,
        1,
    );

    let outcome = h.fetcher.fetch(&request("NSE:TCS")).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.series().symbol, "TCS");
}

#[tokio::test(start_paused = true)]
async fn series_error_fails_after_max_retries() {
    let h = harness(script(|_| vec![series_error()]), false, 1);

    let outcome = h.fetcher.fetch(&request("BADSYM")).await;

    assert!(!outcome.is_success());
    assert!(outcome.series().is_empty());
    assert_eq!(outcome.failed_attempts(), 3);
    let FetchOutcome::Failed { errors, .. } = outcome else {
        unreachable!()
    };
    assert!(errors.iter().all(|e| e.contains("series_error")));

    assert_eq!(h.recorder.connects.load(Ordering::SeqCst), 3);
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn refused_connections_are_retried_per_attempt() {
    let h = harness(script(|_| Vec::new()), true, 1);

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert!(outcome.series().is_empty());
    assert_eq!(outcome.failed_attempts(), 3);
    assert_eq!(h.recorder.connects.load(Ordering::SeqCst), 3);
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_retries_nest_inside_attempts() {
    let h = harness(script(|_| Vec::new()), true, 2);

    h.fetcher.fetch(&request("RELIANCE")).await;

    assert_eq!(h.recorder.connects.load(Ordering::SeqCst), 6);
}

#[tokio::test(start_paused = true)]
async fn attempt_deadline_covers_connection_retries() {
    let start = tokio::time::Instant::now();
    let h = harness_with(
        script(|_| Vec::new()),
        true,
        10,
        FetcherSettings {
            max_messages: 100,
            attempt_deadline: Duration::from_secs(5),
            retry: RetryPolicy::once(),
        },
    );

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    let FetchOutcome::Failed { errors, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(errors, vec!["attempt exceeded deadline of 5s".to_string()]);
    // Nine 1s connect delays would run past the deadline.
    assert_eq!(start.elapsed(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn failed_attempts_are_reported_as_they_happen() {
    let start = tokio::time::Instant::now();
    let h = harness(script(|_| vec![series_error()]), false, 1);

    let mut reported = Vec::new();
    let outcome = h
        .fetcher
        .fetch_reporting(&request("BADSYM"), &mut |attempt: Attempt, error: &str| {
            reported.push((attempt.to_string(), start.elapsed(), error.to_string()));
        })
        .await;

    assert_eq!(outcome.failed_attempts(), 3);
    let timeline: Vec<_> = reported
        .iter()
        .map(|(attempt, at, _)| (attempt.as_str(), at.as_secs()))
        .collect();
    // Each report precedes the 3s retry delay.
    assert_eq!(timeline, vec![("1/3", 0), ("2/3", 3), ("3/3", 6)]);
    assert!(reported.iter().all(|(_, _, e)| e.contains("series_error")));
}

#[tokio::test(start_paused = true)]
async fn every_opened_connection_is_closed() {
    let h = harness(
        script(|_| vec![Reply::Text(frame(r#"{"session_id":"x"}"#))]),
        false,
        1,
    );

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert_eq!(outcome.failed_attempts(), 3);
    assert_eq!(
        h.recorder.connects.load(Ordering::SeqCst),
        h.recorder.closes.load(Ordering::SeqCst)
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeats_are_echoed() {
    let h = harness(
        script(|_| {
            vec![
                Reply::Text(frame("~h~1")),
                chart_data(&five_bars()),
                Reply::Text(frame("~h~2")),
                completed(),
            ]
        }),
        false,
        1,
    );

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert!(outcome.is_success());
    let sent = h.recorder.sent.lock().clone();
    assert_eq!(sent.len(), 11);
    assert_eq!(sent[9], "~m~4~m~~h~1");
    assert_eq!(sent[10], "~m~4~m~~h~2");
}

#[tokio::test(start_paused = true)]
async fn silent_server_times_out_each_attempt() {
    let start = tokio::time::Instant::now();
    let h = harness(script(|_| vec![Reply::Hang]), false, 1);

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert_eq!(outcome.failed_attempts(), 3);
    // Three 10s receive timeouts plus two 3s retry delays.
    assert_eq!(start.elapsed(), Duration::from_secs(36));
    assert_eq!(h.recorder.closes.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn message_bound_ends_attempt_without_terminal_marker() {
    let noise = Reply::Text(
        encode_message("quote_completed", &[json!("qs_test"), json!("RELIANCE")]).unwrap(),
    );
    let h = harness_with(
        script(move |_| vec![noise.clone(); 10]),
        false,
        1,
        FetcherSettings {
            max_messages: 4,
            attempt_deadline: Duration::from_secs(60),
            retry: RetryPolicy::once(),
        },
    );

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    let FetchOutcome::Failed { errors, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(errors, vec!["no terminal marker within 4 messages".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn completed_without_bars_is_a_failure() {
    let h = harness(script(|_| vec![completed()]), false, 1);

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    let FetchOutcome::Failed { errors, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0], "series completed without bars");
}

#[tokio::test(start_paused = true)]
async fn recovers_on_a_later_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let h = harness(
        script(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![series_error()]
            } else {
                vec![chart_data(&five_bars()), completed()]
            }
        }),
        false,
        1,
    );

    let outcome = h.fetcher.fetch(&request("RELIANCE")).await;

    assert!(outcome.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn batch_over_scripted_transport() {
    let h = harness(
        script(|handshake| {
            if handshake.contains("BROKEN") {
                vec![series_error()]
            } else {
                vec![chart_data(&five_bars()), completed()]
            }
        }),
        false,
        1,
    );
    let fetcher: Arc<dyn HistoryFetcher> = Arc::new(h.fetcher);
    let coordinator = BatchRetryCoordinator::new(
        fetcher,
        BatchSettings {
            symbol_delay: Duration::from_millis(100),
            rounds: RetryPolicy::new(1, Duration::from_secs(1)),
        },
        CancellationToken::new(),
    );
    let requests = vec![request("RELIANCE"), request("BROKEN"), request("TCS")];

    let report = coordinator.fetch_many(&requests, |_| {}, |_| {}).await;

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results["TCS"].len(), 5);
    assert_eq!(report.failures, vec!["BROKEN".to_string()]);
    assert!(!report.cancelled);
    // BROKEN: three attempts in pass 1 and three in the single round.
    assert_eq!(h.recorder.connects.load(Ordering::SeqCst), 8);
}
