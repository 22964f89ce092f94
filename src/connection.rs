// =============================================================================
// Connection Manager — supervised streaming subscription
// =============================================================================
//
// Owns the lifecycle of one trade-feed subscription: connect, send the
// subscribe control message once the transport is open, dispatch decoded
// ticks to the aggregator, and reconnect with exponential backoff when the
// transport fails. The authoritative connection state is published through a
// tokio watch channel, so callers wait on state transitions instead of
// spinning on a flag.
//
// The feed supports no replay, so ticks generated during an outage are lost;
// the aggregator keeps whatever it had and continues from the first tick of
// the new session.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::CandleAggregator;
use crate::types::Tick;
use crate::wire;

// =============================================================================
// Connection state
// =============================================================================

/// Lifecycle state of the streaming connection. Single authoritative value,
/// owned by the manager and published via a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Backoff policy
// =============================================================================

/// Exponential reconnect backoff: `initial * 2^(failures-1)`, capped at
/// `max_delay`. Exceeding `max_failures` consecutive failures surfaces a
/// fatal connectivity error to the owner.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_failures: u32,
}

impl BackoffPolicy {
    /// Delay to wait before reconnect attempt number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// How a receive session ended.
enum SessionEnd {
    /// `close()` was called locally; reconnect is suppressed.
    LocalClose,
    /// The remote end closed or the stream terminated.
    RemoteClose,
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Supervises one streaming subscription and feeds the aggregator.
pub struct ConnectionManager {
    endpoint: String,
    symbol: String,
    backoff: BackoffPolicy,
    aggregator: Arc<CandleAggregator>,

    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,

    /// Instant of the last received message, for liveness monitoring.
    last_message: RwLock<Option<Instant>>,

    consecutive_failures: AtomicU32,
    total_reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        endpoint: impl Into<String>,
        symbol: impl Into<String>,
        backoff: BackoffPolicy,
        aggregator: Arc<CandleAggregator>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            endpoint: endpoint.into(),
            symbol: symbol.into(),
            backoff,
            aggregator,
            state_tx,
            shutdown_tx,
            last_message: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            total_reconnects: AtomicU64::new(0),
        }
    }

    // ── Observers ───────────────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Age of the last received message, if any message has arrived.
    pub fn last_message_age(&self) -> Option<Duration> {
        self.last_message.read().map(|t| t.elapsed())
    }

    /// Total number of reconnect attempts since startup.
    pub fn total_reconnects(&self) -> u64 {
        self.total_reconnects.load(Ordering::Relaxed)
    }

    /// Consecutive failures since the last healthy session.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    // ── Control ─────────────────────────────────────────────────────────

    /// Block (cooperatively) until the connection reaches `Open`, bounded by
    /// `timeout` and interruptible by `close()`. Never a busy spin.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Subscribing marks the current shutdown value as seen, so a close()
        // issued before this call would never fire `changed()`. Check the
        // flag up front so the wait fails promptly from any state.
        if *shutdown_rx.borrow_and_update() {
            bail!("connection closed while waiting for Open");
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Open {
                return Ok(());
            }
            tokio::select! {
                _ = &mut deadline => {
                    bail!("connection did not reach Open within {timeout:?}");
                }
                changed = state_rx.changed() => {
                    changed.context("connection manager dropped while waiting for Open")?;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        bail!("connection closed while waiting for Open");
                    }
                }
            }
        }
    }

    /// Close the connection. Effective from any state: suppresses automatic
    /// reconnect, terminates the receive loop, and unblocks any pending
    /// `wait_until_open`.
    pub fn close(&self) {
        if self.state() != ConnectionState::Closed {
            self.set_state(ConnectionState::Closing);
        }
        self.shutdown_tx.send_replace(true);
    }

    // ── Supervision loop ────────────────────────────────────────────────

    /// Run the connect / subscribe / dispatch / reconnect loop until either
    /// `close()` is called (Ok) or the consecutive-failure budget is
    /// exhausted (Err). Intended to be spawned as a background task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                self.set_state(ConnectionState::Closed);
                info!(symbol = %self.symbol, "connection manager stopped");
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            match self.run_session(&mut shutdown_rx).await {
                Ok(SessionEnd::LocalClose) => {
                    self.set_state(ConnectionState::Closed);
                    info!(symbol = %self.symbol, "connection closed locally");
                    return Ok(());
                }
                Ok(SessionEnd::RemoteClose) => {
                    warn!(symbol = %self.symbol, "stream ended by remote");
                }
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "transport error");
                }
            }

            self.set_state(ConnectionState::Closed);

            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            self.total_reconnects.fetch_add(1, Ordering::Relaxed);

            if failures >= self.backoff.max_failures {
                bail!(
                    "giving up after {failures} consecutive connection failures to {}",
                    self.endpoint
                );
            }

            let delay = self.backoff.delay_for(failures);
            warn!(
                symbol = %self.symbol,
                failures,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// One connect-subscribe-receive session. Returns how it ended; any
    /// transport error propagates as Err for the supervisor to count.
    async fn run_session(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        info!(endpoint = %self.endpoint, symbol = %self.symbol, "connecting to trade feed");

        let connect = connect_async(self.endpoint.as_str());
        let (ws_stream, _response) = tokio::select! {
            res = connect => res.context("websocket handshake failed")?,
            _ = shutdown_rx.changed() => return Ok(SessionEnd::LocalClose),
        };

        let (mut write, mut read) = ws_stream.split();

        // Subscribe only once the transport is Open.
        self.set_state(ConnectionState::Open);
        write
            .send(Message::Text(wire::subscribe_message(&self.symbol)))
            .await
            .context("failed to send subscribe message")?;
        info!(symbol = %self.symbol, "subscribed to trade channel");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = write.close().await;
                        return Ok(SessionEnd::LocalClose);
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        warn!(symbol = %self.symbol, frame = ?frame, "close frame received");
                        return Ok(SessionEnd::RemoteClose);
                    }
                    // Ping/Pong/Binary are ignored; tungstenite answers pings.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("websocket read error"),
                    None => return Ok(SessionEnd::RemoteClose),
                }
            }
        }
    }

    /// Decode one text message and hand the tick to the aggregator.
    /// Malformed messages and rejected ticks are reported and dropped; they
    /// never tear the session down.
    fn dispatch(&self, text: &str) {
        *self.last_message.write() = Some(Instant::now());
        // A flowing feed proves the session is healthy again.
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let msg = match wire::decode_trade(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed trade message dropped");
                return;
            }
        };

        // The feed carries no timestamp; stamp at decode.
        let tick = Tick {
            time: Utc::now(),
            symbol: msg.symbol,
            price: msg.price,
            volume: msg.volume,
            side: msg.side,
        };

        match self.aggregator.ingest(&tick) {
            Ok(()) => {
                debug!(price = tick.price, volume = tick.volume, side = %tick.side, "tick ingested");
            }
            Err(e) => {
                warn!(error = %e, raw = %text, "tick rejected by aggregator");
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = *self.state_tx.borrow();
        if prev != next {
            debug!(from = %prev, to = %next, "connection state transition");
        }
        self.state_tx.send_replace(next);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_clock::FrameSpec;
    use crate::market_data::DEFAULT_MAX_HISTORY;

    fn test_backoff() -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_failures: 5,
        }
    }

    fn test_manager(endpoint: &str, backoff: BackoffPolicy) -> Arc<ConnectionManager> {
        let aggregator = Arc::new(
            CandleAggregator::new(FrameSpec::Minutes(1), DEFAULT_MAX_HISTORY, None).unwrap(),
        );
        Arc::new(ConnectionManager::new(
            endpoint, "BTC-USD", backoff, aggregator,
        ))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = test_backoff();
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(3), Duration::from_millis(400));
        assert_eq!(b.delay_for(4), Duration::from_millis(800));
        assert_eq!(b.delay_for(5), Duration::from_millis(1000));
        assert_eq!(b.delay_for(30), Duration::from_millis(1000));
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Open.to_string(), "Open");
        assert_eq!(ConnectionState::Closing.to_string(), "Closing");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }

    #[tokio::test]
    async fn close_before_run_settles_closed_without_reconnect() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        mgr.close();
        // With shutdown already requested, run() must not attempt to connect.
        mgr.clone().run().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert_eq!(mgr.total_reconnects(), 0);
    }

    #[tokio::test]
    async fn wait_until_open_times_out() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        let res = mgr.wait_until_open(Duration::from_millis(20)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn wait_until_open_after_close_fails_promptly() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        mgr.close();

        // A wait started after close() must fail immediately, not sit out
        // the full timeout.
        let started = Instant::now();
        let res = mgr.wait_until_open(Duration::from_secs(5)).await;
        assert!(res.is_err());
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "wait_until_open blocked for {:?} despite prior close()",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn wait_until_open_is_interrupted_by_close() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        let waiter = mgr.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_until_open(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.close();
        let res = handle.await.unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn wait_until_open_returns_once_open() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        let waiter = mgr.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_until_open(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.set_state(ConnectionState::Open);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnect_exhaustion_surfaces_fatal_error() {
        // Port 1 refuses immediately; two attempts then give up.
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_failures: 2,
        };
        let mgr = test_manager("ws://127.0.0.1:1", backoff);
        let res = mgr.clone().run().await;
        assert!(res.is_err());
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert_eq!(mgr.consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn reconnect_after_transport_error_preserves_sealed_history() {
        use crate::types::{Tick, TradeSide};
        use chrono::TimeZone;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Local feed: the first session is dropped right after the subscribe
        // message arrives; the second handshakes slowly (so the Connecting
        // state is observable) and then stays up until the client closes.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await; // subscribe control message
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(200),
            max_failures: 10,
        };
        let mgr = test_manager(&format!("ws://{addr}"), backoff);

        // Seed one sealed candle before the transport ever fails.
        for (minute, second, price) in [(0, 10, 100.0), (1, 5, 101.0)] {
            mgr.aggregator
                .ingest(&Tick {
                    time: Utc.with_ymd_and_hms(2024, 3, 7, 10, minute, second).unwrap(),
                    symbol: "BTC-USD".into(),
                    price,
                    volume: 1.0,
                    side: TradeSide::Buy,
                })
                .unwrap();
        }
        assert_eq!(mgr.aggregator.history_len(), 1);

        let mut state_rx = mgr.watch_state();
        let run = tokio::spawn(mgr.clone().run());

        mgr.wait_until_open(Duration::from_secs(5)).await.unwrap();

        // Transport drops while Open: expect Closed, then Connecting, then
        // Open again once the second session handshakes.
        let mut saw_closed = false;
        let mut saw_connecting = false;
        loop {
            tokio::time::timeout(Duration::from_secs(5), state_rx.changed())
                .await
                .expect("state transition timed out")
                .unwrap();
            match *state_rx.borrow_and_update() {
                ConnectionState::Closed => saw_closed = true,
                ConnectionState::Connecting if saw_closed => saw_connecting = true,
                ConnectionState::Open if saw_closed => break,
                _ => {}
            }
        }
        assert!(saw_closed);
        assert!(saw_connecting);
        assert_eq!(mgr.state(), ConnectionState::Open);

        // The already-sealed candle survived the outage.
        assert_eq!(mgr.aggregator.history_len(), 1);

        mgr.close();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatch_feeds_aggregator_and_tracks_liveness() {
        let mgr = test_manager("ws://127.0.0.1:1", test_backoff());
        assert!(mgr.last_message_age().is_none());

        mgr.dispatch("1,BTC-USD,100.5,2.0,buy");
        mgr.dispatch("2,BTC-USD,101.0,1.0,sell");
        mgr.dispatch("garbage message");

        assert!(mgr.last_message_age().is_some());
        let snap = mgr.aggregator.snapshot();
        let current = snap.current.unwrap();
        assert!((current.open - 100.5).abs() < f64::EPSILON);
        assert!((current.close - 101.0).abs() < f64::EPSILON);
        assert!((current.volume - 3.0).abs() < f64::EPSILON);
        assert_eq!(current.trades_count, 2);
    }
}
