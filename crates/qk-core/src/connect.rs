//! Dual-channel connection to the QUIK terminal.
//!
//! [`QuikConnect`] owns the request (MN) and event (CB) sockets and runs one
//! background tokio task that:
//! 1. Tears both channels down when either error flag is set, and clears the
//!    flags once the error has aged past the error timeout — errors are
//!    coupled and only heal by timeout.
//! 2. Sleeps an error-sleep between iterations while the error state holds.
//! 3. Opens both channels when closed, emitting [`QuikEvent::Opened`]; a
//!    failure on either flags both.
//! 4. Sends a bare `ping` on each healthy channel once per ping interval.
//! 5. Drains available lines: `pong` is consumed, `id` frames complete their
//!    pending request, `callback` frames from CB become events, malformed
//!    lines are reported and dropped.
//! 6. Purges the pending table (deadline expiry fails the reply as a timeout).
//! 7. Sleeps an idle-sleep when nothing arrived this iteration.
//!
//! Any number of tasks may issue requests concurrently; each write happens
//! under the per-channel lock and returns a [`PendingReply`] immediately.
//! Completion always comes from the loop task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectConfig;
use crate::error::QuikError;
use crate::listener::{QuikEvent, QuikEventReceiver, QuikEventSender};
use crate::pending::{PendingReply, PendingTable};
use crate::protocol::{self, Channel, Incoming, PING, RequestBody};
use crate::time_util::now_ms;
use crate::transport::LineTransport;

/// Snapshot of the connection's link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Channels closed, no error pending; the loop will try to open.
    Closed,
    /// Both channels open.
    Open,
    /// Coupled error state; reopening is blocked until the error ages out.
    Erroring {
        /// Epoch milliseconds of the most recent error.
        since_ms: u64,
    },
}

struct ChannelShared {
    transport: Mutex<Option<LineTransport>>,
    error: AtomicBool,
}

impl ChannelShared {
    fn new() -> Self {
        Self { transport: Mutex::new(None), error: AtomicBool::new(false) }
    }
}

struct Shared {
    mn: ChannelShared,
    cb: ChannelShared,
    open: AtomicBool,
    err_since_ms: AtomicU64,
    pending: PendingTable,
}

impl Shared {
    fn channel(&self, channel: Channel) -> &ChannelShared {
        match channel {
            Channel::Mn => &self.mn,
            Channel::Cb => &self.cb,
        }
    }

    fn any_error(&self) -> bool {
        self.mn.error.load(Ordering::Acquire) || self.cb.error.load(Ordering::Acquire)
    }

    fn mark_error(&self, channel: Channel) {
        self.channel(channel).error.store(true, Ordering::Release);
        self.err_since_ms.store(now_ms(), Ordering::Release);
    }

    fn set_both_errors(&self) {
        self.mn.error.store(true, Ordering::Release);
        self.cb.error.store(true, Ordering::Release);
        self.err_since_ms.store(now_ms(), Ordering::Release);
    }

    fn clear_errors(&self) {
        self.mn.error.store(false, Ordering::Release);
        self.cb.error.store(false, Ordering::Release);
        self.err_since_ms.store(0, Ordering::Release);
    }

    fn state(&self) -> LinkState {
        if self.any_error() {
            LinkState::Erroring { since_ms: self.err_since_ms.load(Ordering::Acquire) }
        } else if self.open.load(Ordering::Acquire) {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }
}

/// The dual-channel terminal connection.
pub struct QuikConnect {
    config: ConnectConfig,
    shared: Arc<Shared>,
    events: QuikEventSender,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QuikConnect {
    /// Creates the connection and the event queue its listeners will consume.
    pub fn new(config: ConnectConfig) -> (Self, QuikEventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            mn: ChannelShared::new(),
            cb: ChannelShared::new(),
            open: AtomicBool::new(false),
            err_since_ms: AtomicU64::new(0),
            pending: PendingTable::new(),
        });
        let connect = Self {
            config,
            shared,
            events: events_tx,
            shutdown_tx,
            task: Mutex::new(None),
        };
        (connect, events_rx)
    }

    /// Launches the background loop. A second call is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("[{}] already started", self.config.client_id);
            return;
        }
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let events = self.events.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(run_loop(shared, config, events, shutdown_rx)));
        info!("[{}] connection loop started", self.config.client_id);
    }

    /// Signals the loop to stop and waits until both channels are closed.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Link-state snapshot.
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Whether the request channel is flagged errored.
    pub fn has_error_mn(&self) -> bool {
        self.shared.mn.error.load(Ordering::Acquire)
    }

    /// Whether the event channel is flagged errored.
    pub fn has_error_cb(&self) -> bool {
        self.shared.cb.error.load(Ordering::Acquire)
    }

    /// The client identifier carried in every envelope.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Evaluates a raw script chunk on the request channel.
    pub async fn eval_mn(
        &self,
        chunk: &str,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        self.send_request(Channel::Mn, RequestBody::Chunk(chunk), timeout).await
    }

    /// Evaluates a raw script chunk on the event channel.
    pub async fn eval_cb(
        &self,
        chunk: &str,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        self.send_request(Channel::Cb, RequestBody::Chunk(chunk), timeout).await
    }

    /// Calls a named function with a JSON-array argument list on the request channel.
    pub async fn call_mn(
        &self,
        fname: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        self.send_request(Channel::Mn, RequestBody::Function { fname, args: &args }, timeout)
            .await
    }

    /// Calls a named function with a JSON-array argument list on the event channel.
    pub async fn call_cb(
        &self,
        fname: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        self.send_request(Channel::Cb, RequestBody::Function { fname, args: &args }, timeout)
            .await
    }

    /// Registers interest in a pushed event; event-channel only.
    pub async fn subscribe(
        &self,
        callback: &str,
        filter: &str,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        self.send_request(Channel::Cb, RequestBody::Callback { callback, filter }, timeout)
            .await
    }

    /// Allocates an ID, registers the reply slot, and writes the envelope.
    ///
    /// Registration happens before the write so a reply cannot race the
    /// table insert; a failed write discards the slot and flags the channel.
    async fn send_request(
        &self,
        channel: Channel,
        body: RequestBody<'_>,
        timeout: Duration,
    ) -> Result<PendingReply, QuikError> {
        let shared = &self.shared;
        if shared.channel(channel).error.load(Ordering::Acquire) {
            return Err(QuikError::ChannelDown(channel));
        }
        let id = shared.pending.next_id();
        let line = protocol::encode_request(id, &self.config.client_id, &body);
        let reply = shared.pending.register(id, timeout).await;

        let mut slot = shared.channel(channel).transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            drop(slot);
            shared.pending.discard(id).await;
            return Err(QuikError::ChannelDown(channel));
        };
        if let Err(e) = transport.send(&line).await {
            drop(slot);
            shared.pending.discard(id).await;
            shared.mark_error(channel);
            warn!("[{}] send failed on {channel}: {e}", self.config.client_id);
            return Err(QuikError::Io { channel, source: e });
        }
        Ok(reply)
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    config: ConnectConfig,
    events: QuikEventSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let label = config.client_id.clone();
    let mut last_ping: Option<Instant> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // Steps 1-2: coupled error handling and self-heal by timeout.
        if shared.any_error() {
            if shared.open.load(Ordering::Acquire) {
                warn!("[{label}] channel error, closing both channels");
                close_both(&shared, &events, &label).await;
            }
            let since_ms = shared.err_since_ms.load(Ordering::Acquire);
            let error_age_ms = config.error_timeout().as_millis() as u64;
            if since_ms != 0 && now_ms() >= since_ms + error_age_ms {
                info!("[{label}] error timeout elapsed, retrying");
                shared.clear_errors();
            }
            if shared.any_error() {
                shared.pending.purge().await;
                sleep_or_shutdown(config.error_sleep(), &mut shutdown_rx).await;
                continue;
            }
        }

        // Step 3: open both channels.
        if !shared.open.load(Ordering::Acquire) {
            tokio::select! {
                opened = open_both(&shared, &config) => match opened {
                    Ok(()) => {
                        shared.open.store(true, Ordering::Release);
                        info!("[{label}] MN and CB channels open");
                        let _ = events.send(QuikEvent::Opened);
                    }
                    Err((channel, e)) => {
                        warn!("[{label}] open failed on {channel}: {e}");
                        shared.set_both_errors();
                        let _ = events.send(QuikEvent::ChannelError {
                            channel,
                            message: e.to_string(),
                        });
                        // Drop a half-opened transport without a Closed event.
                        close_both(&shared, &events, &label).await;
                        shared.pending.purge().await;
                        continue;
                    }
                },
                _ = shutdown_rx.changed() => continue,
            }
        }

        // Step 4: keepalive pings on healthy channels.
        if last_ping.map_or(true, |at| at.elapsed() >= config.ping_interval()) {
            ping_channel(&shared, Channel::Mn, &label).await;
            ping_channel(&shared, Channel::Cb, &label).await;
            last_ping = Some(Instant::now());
        }

        // Step 5: drain whatever has arrived.
        let mut processed = 0;
        processed += drain_channel(&shared, Channel::Mn, &events, &label).await;
        processed += drain_channel(&shared, Channel::Cb, &events, &label).await;

        // Step 6: expire deadlines, forget abandoned replies.
        shared.pending.purge().await;

        // Step 7: idle pacing.
        if processed == 0 {
            sleep_or_shutdown(config.idle_sleep(), &mut shutdown_rx).await;
        }
    }

    // Shutdown: final drain so late replies still complete, then close and
    // fail whatever is left so holders never hang.
    if shared.open.load(Ordering::Acquire) {
        drain_channel(&shared, Channel::Mn, &events, &label).await;
        drain_channel(&shared, Channel::Cb, &events, &label).await;
    }
    close_both(&shared, &events, &label).await;
    shared.pending.purge().await;
    let dropped = shared.pending.close_all().await;
    if dropped > 0 {
        info!("[{label}] dropped {dropped} in-flight requests at shutdown");
    }
    info!("[{label}] connection loop stopped");
}

/// Opens MN then CB, parking each in its slot as it comes up.
async fn open_both(
    shared: &Shared,
    config: &ConnectConfig,
) -> Result<(), (Channel, std::io::Error)> {
    let mn = LineTransport::open(&config.host, config.port_mn)
        .await
        .map_err(|e| (Channel::Mn, e))?;
    *shared.mn.transport.lock().await = Some(mn);
    let cb = LineTransport::open(&config.host, config.port_cb)
        .await
        .map_err(|e| (Channel::Cb, e))?;
    *shared.cb.transport.lock().await = Some(cb);
    Ok(())
}

/// Closes whatever is open; emits `Closed` only if the pair had fully opened.
async fn close_both(shared: &Shared, events: &QuikEventSender, label: &str) {
    let was_open = shared.open.swap(false, Ordering::AcqRel);
    let mn = shared.mn.transport.lock().await.take();
    if let Some(transport) = mn {
        transport.close().await;
    }
    let cb = shared.cb.transport.lock().await.take();
    if let Some(transport) = cb {
        transport.close().await;
    }
    if was_open {
        info!("[{label}] channels closed");
        let _ = events.send(QuikEvent::Closed);
    }
}

/// Sends one `ping`; a failure flags the channel, teardown follows next iteration.
async fn ping_channel(shared: &Shared, channel: Channel, label: &str) {
    if shared.channel(channel).error.load(Ordering::Acquire) {
        return;
    }
    let mut slot = shared.channel(channel).transport.lock().await;
    if let Some(transport) = slot.as_mut() {
        if let Err(e) = transport.send(PING).await {
            warn!("[{label}] ping failed on {channel}: {e}");
            shared.mark_error(channel);
        }
    }
}

/// Reads every line currently available on one channel. Returns the count.
async fn drain_channel(
    shared: &Shared,
    channel: Channel,
    events: &QuikEventSender,
    label: &str,
) -> usize {
    let mut processed = 0;
    loop {
        if shared.channel(channel).error.load(Ordering::Acquire) {
            break;
        }
        let received = {
            let mut slot = shared.channel(channel).transport.lock().await;
            match slot.as_mut() {
                Some(transport) => transport.receive(),
                None => break,
            }
        };
        match received {
            Ok(Some(line)) => {
                processed += 1;
                handle_line(shared, channel, &line, events, label).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("[{label}] receive failed on {channel}: {e}");
                shared.mark_error(channel);
                let _ = events.send(QuikEvent::ChannelError {
                    channel,
                    message: e.to_string(),
                });
                break;
            }
        }
    }
    processed
}

async fn handle_line(
    shared: &Shared,
    channel: Channel,
    line: &str,
    events: &QuikEventSender,
    label: &str,
) {
    match protocol::decode_line(line) {
        Ok(Incoming::Pong) => {}
        Ok(Incoming::Reply { id, frame }) => {
            if !shared.pending.complete(id, frame).await {
                debug!("[{label}] unmatched reply id {id} on {channel}");
            }
        }
        Ok(Incoming::Callback(frame)) => {
            if channel == Channel::Cb {
                let _ = events.send(QuikEvent::Callback(frame));
            } else {
                warn!("[{label}] callback frame on MN dropped: {frame}");
            }
        }
        Err(e) => {
            warn!("[{label}] bad frame on {channel}: {e}");
            let _ = events.send(QuikEvent::ChannelError { channel, message: e.to_string() });
        }
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown_rx.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder;
    use crate::testing::{ScriptedPeer, test_config, wait_for};
    use serde_json::json;

    fn drain_events(rx: &mut QuikEventReceiver) -> Vec<QuikEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    async fn connected_pair() -> (ScriptedPeer, Arc<QuikConnect>, QuikEventReceiver) {
        let peer = ScriptedPeer::start().await;
        let (connect, events) = QuikConnect::new(peer.config());
        let connect = Arc::new(connect);
        connect.start().await;
        {
            let connect = Arc::clone(&connect);
            wait_for("channels to open", Duration::from_secs(5), move || {
                connect.state() == LinkState::Open
            })
            .await;
        }
        (peer, connect, events)
    }

    #[tokio::test]
    async fn hundred_concurrent_requests_resolve_without_cross_wiring() {
        let (_peer, connect, _events) = connected_pair().await;
        let mut tasks = Vec::new();
        for i in 0..100 {
            let connect = Arc::clone(&connect);
            tasks.push(tokio::spawn(async move {
                let chunk = format!("return {i}");
                let reply = connect.eval_mn(&chunk, Duration::from_secs(5)).await?;
                let frame = reply.recv().await?;
                let result = decoder::result(&frame)?.clone();
                Ok::<(String, Value), QuikError>((chunk, result))
            }));
        }
        for task in tasks {
            let (chunk, result) = task.await.unwrap().unwrap();
            assert_eq!(result, json!(chunk));
        }
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn function_call_round_trip() {
        let (_peer, connect, _events) = connected_pair().await;
        let reply = connect
            .call_mn("math.max", json!([1, 3, 5, 7]), Duration::from_secs(5))
            .await
            .unwrap();
        let frame = reply.recv().await.unwrap();
        assert_eq!(decoder::result(&frame).unwrap(), &json!(7));
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn subscription_round_trip_on_cb() {
        let (_peer, connect, _events) = connected_pair().await;
        let reply = connect
            .subscribe("OnDisconnected", "*", Duration::from_secs(5))
            .await
            .unwrap();
        let frame = reply.recv().await.unwrap();
        assert!(decoder::status(&frame));
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn silent_peer_yields_timeout() {
        let (_peer, connect, _events) = connected_pair().await;
        let reply = connect.eval_mn("hang", Duration::from_millis(100)).await.unwrap();
        match reply.recv().await {
            Err(QuikError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 100),
            other => panic!("expected Timeout, got {other:?}"),
        }
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn ids_increase_across_channels() {
        let (_peer, connect, _events) = connected_pair().await;
        let a = connect.eval_mn("x", Duration::from_secs(5)).await.unwrap();
        let b = connect.eval_cb("y", Duration::from_secs(5)).await.unwrap();
        let c = connect.eval_mn("z", Duration::from_secs(5)).await.unwrap();
        assert!(a.id() < b.id() && b.id() < c.id());
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn refused_connection_sets_coupled_errors_then_recovers() {
        let (port_mn, port_cb) = ScriptedPeer::reserve_ports().await;
        let (connect, mut events) = QuikConnect::new(test_config(port_mn, port_cb));
        let connect = Arc::new(connect);
        connect.start().await;

        {
            let connect = Arc::clone(&connect);
            wait_for("coupled error flags", Duration::from_secs(5), move || {
                connect.has_error_mn() && connect.has_error_cb()
            })
            .await;
        }
        let early = drain_events(&mut events);
        assert!(
            early.iter().all(|e| matches!(e, QuikEvent::ChannelError { .. })),
            "expected only channel errors before the peer exists: {early:?}"
        );

        // Requests fail fast in the error state.
        match connect.eval_mn("x", Duration::from_secs(1)).await {
            Err(QuikError::ChannelDown(_)) => {}
            other => panic!("expected ChannelDown, got {other:?}"),
        }

        // Bring the peer up; the loop reopens once the error ages out.
        let _peer = ScriptedPeer::start_on(port_mn, port_cb).await;
        {
            let connect = Arc::clone(&connect);
            wait_for("reopen after error timeout", Duration::from_secs(5), move || {
                connect.state() == LinkState::Open
            })
            .await;
        }
        let later = drain_events(&mut events);
        assert!(
            later.iter().any(|e| matches!(e, QuikEvent::Opened)),
            "no Opened after recovery: {later:?}"
        );
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn callback_frames_become_events() {
        let (peer, connect, mut events) = connected_pair().await;
        peer.push_cb(r#"{"callback": "OnTrade", "arg1": {"price": 10}}"#);
        let mut callback = None;
        for _ in 0..400 {
            if let Some(QuikEvent::Callback(frame)) = drain_events(&mut events)
                .into_iter()
                .find(|e| matches!(e, QuikEvent::Callback(_)))
            {
                callback = Some(frame);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frame = callback.expect("callback never delivered");
        assert_eq!(frame["callback"], "OnTrade");
        assert_eq!(frame["arg1"]["price"], 10);
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_frame_reports_but_does_not_tear_down() {
        let (peer, connect, mut events) = connected_pair().await;
        peer.push_cb("{broken");
        let mut reported = false;
        for _ in 0..400 {
            if drain_events(&mut events).iter().any(
                |e| matches!(e, QuikEvent::ChannelError { channel: Channel::Cb, .. }),
            ) {
                reported = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reported, "decode error never reported");
        assert!(!connect.has_error_cb(), "decode error must not flag the channel");
        assert_eq!(connect.state(), LinkState::Open);

        // The channel still works afterwards.
        let reply = connect.eval_cb("still alive", Duration::from_secs(5)).await.unwrap();
        let frame = reply.recv().await.unwrap();
        assert_eq!(decoder::result(&frame).unwrap(), &json!("still alive"));
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_inflight_with_connection_closed() {
        let (_peer, connect, mut events) = connected_pair().await;
        let reply = connect.eval_mn("hang", Duration::from_secs(30)).await.unwrap();
        connect.shutdown().await;
        match reply.recv().await {
            Err(QuikError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
        assert_eq!(connect.state(), LinkState::Closed);
        let seen = drain_events(&mut events);
        assert!(
            matches!(seen.last(), Some(QuikEvent::Closed)),
            "expected a final Closed event: {seen:?}"
        );
    }

    #[tokio::test]
    async fn keepalive_traffic_stays_silent() {
        let (_peer, connect, mut events) = connected_pair().await;
        // A few ping periods pass; pongs must not surface as events or errors.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(connect.state(), LinkState::Open);
        let seen = drain_events(&mut events);
        assert!(
            seen.iter().all(|e| matches!(e, QuikEvent::Opened)),
            "unexpected events during keepalive: {seen:?}"
        );
        connect.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (_peer, connect, _events) = connected_pair().await;
        connect.start().await;
        assert_eq!(connect.state(), LinkState::Open);
        connect.shutdown().await;
    }
}
