//! Scripted fake terminal for integration tests.
//!
//! Listens on two localhost TCP ports (MN and CB) and speaks just enough of
//! the wire protocol to exercise the connection and the readiness machine:
//! `ping` gets `pong`, chunk requests are echoed back as their own result,
//! `math.max` is actually computed, `isConnected` answers from a shared
//! toggle, and callback subscriptions succeed or fail from another toggle.
//! A chunk of exactly `"hang"` is read and never answered. Unsolicited lines
//! can be pushed to the live CB socket at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::config::ConnectConfig;

pub(crate) struct ScriptedPeer {
    pub(crate) port_mn: u16,
    pub(crate) port_cb: u16,
    connected: Arc<AtomicBool>,
    subscribe_ok: Arc<AtomicBool>,
    push_tx: mpsc::UnboundedSender<String>,
}

impl ScriptedPeer {
    /// Binds both listeners on ephemeral ports and starts serving.
    pub(crate) async fn start() -> Self {
        let mn = TcpListener::bind("127.0.0.1:0").await.expect("bind MN");
        let cb = TcpListener::bind("127.0.0.1:0").await.expect("bind CB");
        Self::serve(mn, cb)
    }

    /// Binds the given ports, retrying briefly while they are released.
    pub(crate) async fn start_on(port_mn: u16, port_cb: u16) -> Self {
        let mn = Self::bind_retry(port_mn).await;
        let cb = Self::bind_retry(port_cb).await;
        Self::serve(mn, cb)
    }

    /// Reserves two ephemeral ports and releases them again, so a test can
    /// point a connection at ports that refuse until `start_on` is called.
    pub(crate) async fn reserve_ports() -> (u16, u16) {
        let a = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let b = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let ports = (
            a.local_addr().expect("addr").port(),
            b.local_addr().expect("addr").port(),
        );
        drop(a);
        drop(b);
        ports
    }

    async fn bind_retry(port: u16) -> TcpListener {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return listener,
                Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("could not rebind port {port}: {e}"),
            }
        }
    }

    fn serve(mn: TcpListener, cb: TcpListener) -> Self {
        let port_mn = mn.local_addr().expect("addr").port();
        let port_cb = cb.local_addr().expect("addr").port();
        let connected = Arc::new(AtomicBool::new(true));
        let subscribe_ok = Arc::new(AtomicBool::new(true));
        let (push_tx, push_rx) = mpsc::unbounded_channel::<String>();

        {
            let connected = Arc::clone(&connected);
            let subscribe_ok = Arc::clone(&subscribe_ok);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = mn.accept().await else { return };
                    serve_plain(stream, &connected, &subscribe_ok).await;
                }
            });
        }
        {
            let connected = Arc::clone(&connected);
            let subscribe_ok = Arc::clone(&subscribe_ok);
            tokio::spawn(async move {
                let mut push_rx = push_rx;
                loop {
                    let Ok((stream, _)) = cb.accept().await else { return };
                    serve_with_pushes(stream, &connected, &subscribe_ok, &mut push_rx).await;
                }
            });
        }

        Self { port_mn, port_cb, connected, subscribe_ok, push_tx }
    }

    /// Flips what `isConnected` answers.
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Flips whether callback subscriptions succeed.
    pub(crate) fn set_subscribe_ok(&self, ok: bool) {
        self.subscribe_ok.store(ok, Ordering::Release);
    }

    /// Queues one raw line for the CB socket (delivered once it is open).
    pub(crate) fn push_cb(&self, line: &str) {
        let _ = self.push_tx.send(line.to_string());
    }

    /// A connection config pointing at this peer, with short test timings.
    pub(crate) fn config(&self) -> ConnectConfig {
        test_config(self.port_mn, self.port_cb)
    }
}

pub(crate) fn test_config(port_mn: u16, port_cb: u16) -> ConnectConfig {
    ConnectConfig {
        host: "127.0.0.1".to_string(),
        port_mn,
        port_cb,
        client_id: "test".to_string(),
        error_timeout_ms: Some(300),
        ping_interval_ms: Some(100),
        idle_sleep_ms: Some(2),
        error_sleep_ms: Some(20),
    }
}

/// Polls `cond` every few milliseconds until it holds, panicking past `deadline`.
pub(crate) async fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, cond: F) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn serve_plain(stream: TcpStream, connected: &AtomicBool, subscribe_ok: &AtomicBool) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(reply) = answer(&line, connected, subscribe_ok) {
            if write_line(&mut write_half, &reply).await.is_err() {
                return;
            }
        }
    }
}

async fn serve_with_pushes(
    stream: TcpStream,
    connected: &AtomicBool,
    subscribe_ok: &AtomicBool,
    push_rx: &mut mpsc::UnboundedReceiver<String>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(reply) = answer(&line, connected, subscribe_ok) {
                        if write_line(&mut write_half, &reply).await.is_err() {
                            return;
                        }
                    }
                }
                _ => return,
            },
            pushed = push_rx.recv() => match pushed {
                Some(line) => {
                    if write_line(&mut write_half, &line).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }
}

async fn write_line(write_half: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    write_half.write_all(format!("{line}\n").as_bytes()).await
}

fn answer(line: &str, connected: &AtomicBool, subscribe_ok: &AtomicBool) -> Option<String> {
    if line == "ping" {
        return Some("pong".to_string());
    }
    if line == "quit" {
        return None;
    }
    let request: Value = serde_json::from_str(line).ok()?;
    let id = request.get("id")?.as_u64()?;

    if request.get("callback").is_some() {
        let reply = if subscribe_ok.load(Ordering::Acquire) {
            json!({"id": id, "status": true})
        } else {
            json!({"id": id, "status": false, "err": "subscription refused"})
        };
        return Some(reply.to_string());
    }
    if let Some(fname) = request.get("fname").and_then(Value::as_str) {
        let reply = match fname {
            "isConnected" => {
                let result = i32::from(connected.load(Ordering::Acquire));
                json!({"id": id, "status": true, "result": result})
            }
            "math.max" => {
                let max = request
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| args.iter().filter_map(Value::as_i64).max().unwrap_or(0))
                    .unwrap_or(0);
                json!({"id": id, "status": true, "result": max})
            }
            _ => json!({"id": id, "status": true, "result": request.get("args")}),
        };
        return Some(reply.to_string());
    }
    if let Some(chunk) = request.get("chunk").and_then(Value::as_str) {
        if chunk == "hang" {
            return None;
        }
        return Some(json!({"id": id, "status": true, "result": chunk}).to_string());
    }
    Some(json!({"id": id, "status": false, "err": "unrecognized request"}).to_string())
}
