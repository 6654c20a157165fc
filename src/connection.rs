//! One persistent control session per device.
//!
//! A supervisor task owns the TCP stream for the whole life of a
//! [`Connection`]. It connects, splits the stream, hands the read half to a
//! reader task and keeps the write half itself, so the socket has exactly
//! one reader and one writer. Callers never touch the socket: [`Connection::send`]
//! registers a pending command and queues its encoded line for the
//! supervisor to write.
//!
//! When the session drops, every outstanding command fails with
//! [`Error::ConnectionLost`] and the supervisor reconnects with exponential
//! backoff. After the retry ceiling the device is marked offline and stays
//! that way until [`Connection::retry`] or a new address arrives.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt, select};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::Display;

use crate::codec::{self, Command, LineBuffer, Message, Response};
use crate::config::{ConnectionConfig, OfflinePolicy};
use crate::errors::{DeviceId, Error};
use crate::events::{DeviceEvent, EventBus};
use crate::history::{HistorySummary, MessageHistory, MessageType};
use crate::lock;
use crate::pending::PendingTable;
use crate::reconciler::Reconciler;
use crate::runtime::{self, AsyncStreamRead, AsyncStreamWrite, AsyncTcpStream, Instant, TcpStream};
use crate::types::Method;

type Result<T> = std::result::Result<T, Error>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Gave up after the retry ceiling; waiting for a manual retry.
    Offline,
    /// Removed by its owner. Terminal.
    Closed,
}

/// Point-in-time view of a connection for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDiagnostics {
    pub device: DeviceId,
    pub address: SocketAddr,
    pub status: ConnectionStatus,
    pub outstanding: usize,
    pub oldest_outstanding_secs: Option<f64>,
    pub queued: usize,
    pub failed_attempts: u32,
    pub history: HistorySummary,
}

/// A command handed to the supervisor while disconnected.
struct Queued {
    command: Command,
    handoff: oneshot::Sender<Result<Dispatched>>,
}

/// A command that has been written, or is about to be.
struct Dispatched {
    id: u32,
    rx: oneshot::Receiver<Result<Response>>,
}

enum Admitted {
    Dispatched(Dispatched),
    Queued(oneshot::Receiver<Result<Dispatched>>),
}

enum Control {
    Retry,
    Readdress(SocketAddr),
    ProbeFailed,
    Shutdown,
}

enum SessionEnd {
    Lost(String),
    Readdressed,
    Shutdown,
}

struct Session {
    status: ConnectionStatus,
    address: SocketAddr,
    /// Lines for the writer. Present only while connected.
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: PendingTable,
    queue: VecDeque<Queued>,
    failed_attempts: u32,
    last_exchange: Instant,
    probing: bool,
    history: MessageHistory,
}

impl Session {
    fn dispatch(&mut self, command: Command) -> Result<Dispatched> {
        let outbound = self.outbound.clone().ok_or(Error::ConnectionLost)?;
        let method = command.method().to_string();
        let mut message = serde_json::to_value(&command).map_err(Error::JsonDump)?;
        let (id, line, rx) = self.pending.register(command)?;
        debug!("-> {}", line.trim_end());
        if outbound.unbounded_send(line).is_err() {
            self.pending.cancel(id);
            return Err(Error::ConnectionLost);
        }
        message["id"] = json!(id);
        self.history.record(MessageType::Send, &method, message);
        Ok(Dispatched { id, rx })
    }

    /// Record a status change. Closed is terminal.
    fn transition(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status || self.status == ConnectionStatus::Closed {
            return false;
        }
        self.status = status;
        true
    }

    fn fail_queue(&mut self, error: impl Fn() -> Error) {
        for queued in self.queue.drain(..) {
            let _ = queued.handoff.send(Err(error()));
        }
    }
}

struct Inner {
    device: DeviceId,
    config: ConnectionConfig,
    session: Mutex<Session>,
    reconciler: Reconciler,
    events: EventBus,
    control: mpsc::UnboundedSender<Control>,
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut session = lock(&self.session);
            if !session.transition(status) {
                return;
            }
        }
        self.announce(status);
    }

    /// Publish a transition already recorded in the session.
    fn announce(&self, status: ConnectionStatus) {
        info!("Device {} is {status}", self.device);
        self.events.publish(DeviceEvent::ConnectionChanged {
            id: self.device.clone(),
            status,
        });
        match status {
            ConnectionStatus::Connected => {
                self.reconciler.set_online(&self.device, true);
            }
            ConnectionStatus::Offline | ConnectionStatus::Closed => {
                self.reconciler.set_online(&self.device, false);
            }
            _ => {}
        }
    }

    fn address(&self) -> SocketAddr {
        lock(&self.session).address
    }

    /// Route one inbound line.
    fn handle_line(&self, line: &str) {
        debug!("<- {line}");
        match codec::decode(line) {
            Message::Response(response) => {
                let pending = {
                    let mut session = lock(&self.session);
                    session.last_exchange = Instant::now();
                    let pending = session.pending.take(response.id);
                    let method = pending.as_ref().map_or("unknown", |p| p.command.method());
                    let message = serde_json::from_str(line).unwrap_or(Value::Null);
                    session.history.record(MessageType::Receive, method, message);
                    pending
                };
                let Some(pending) = pending else {
                    debug!("Response {} of {} has no waiter", response.id, self.device);
                    return;
                };
                self.reconciler
                    .apply_response(&self.device, &pending.command, &response);
                let _ = pending.tx.send(Ok(response));
            }
            Message::Notification(notification) => {
                {
                    let mut session = lock(&self.session);
                    session.last_exchange = Instant::now();
                    session.history.record(
                        MessageType::Notification,
                        "props",
                        Value::Object(notification.params.clone()),
                    );
                }
                self.reconciler
                    .apply_notification(&self.device, &notification);
            }
            Message::Malformed { line, reason } => {
                warn!("Malformed line from {}: {reason}: {line}", self.device);
                lock(&self.session)
                    .history
                    .record_error(&format!("malformed line: {reason}"));
            }
        }
    }

    /// Tear down after a session ended.
    fn drop_session(&self, reason: &str) {
        let failed = {
            let mut session = lock(&self.session);
            session.outbound = None;
            session.probing = false;
            session.history.record_error(reason);
            session.pending.fail_all(|| Error::ConnectionLost)
        };
        if failed > 0 {
            info!("Failed {failed} outstanding command(s) of {}", self.device);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Install the writer channel, flush the offline queue in order and
    /// mark the session connected, all under one lock. A send either lands
    /// in the queue before the flush or sees `Connected` after it.
    fn go_online(&self, outbound: mpsc::UnboundedSender<String>) {
        {
            let mut session = lock(&self.session);
            if !session.transition(ConnectionStatus::Connected) {
                return;
            }
            session.outbound = Some(outbound);
            session.failed_attempts = 0;
            session.last_exchange = Instant::now();
            let queued: Vec<Queued> = session.queue.drain(..).collect();
            if !queued.is_empty() {
                info!("Replaying {} queued command(s) to {}", queued.len(), self.device);
            }
            for q in queued {
                let _ = q.handoff.send(session.dispatch(q.command));
            }
        }
        self.announce(ConnectionStatus::Connected);
    }

    async fn supervise(self: Arc<Self>, mut control: mpsc::UnboundedReceiver<Control>) {
        let backoff = self.config.backoff.clone();
        let mut failures: u32 = 0;
        let mut wait = false;

        'outer: loop {
            if backoff.retry_ceiling > 0 && failures >= backoff.retry_ceiling {
                warn!("Giving up on {} after {failures} attempts", self.device);
                self.set_status(ConnectionStatus::Offline);
                lock(&self.session).fail_queue(|| Error::NotConnected(self.device.clone()));
                loop {
                    match control.next().await {
                        Some(Control::Retry) => break,
                        Some(Control::Readdress(address)) => {
                            lock(&self.session).address = address;
                            break;
                        }
                        Some(Control::ProbeFailed) => {}
                        Some(Control::Shutdown) | None => break 'outer,
                    }
                }
                failures = 0;
                wait = false;
                lock(&self.session).failed_attempts = 0;
            }

            if wait {
                let delay = backoff.delay(failures.max(1));
                debug!("Reconnecting to {} in {delay:?}", self.device);
                select! {
                    _ = runtime::sleep(delay).fuse() => {}
                    ctrl = control.next() => match ctrl {
                        Some(Control::Readdress(address)) => {
                            lock(&self.session).address = address;
                        }
                        Some(Control::Retry) | Some(Control::ProbeFailed) => {}
                        Some(Control::Shutdown) | None => break 'outer,
                    },
                }
            }

            self.set_status(ConnectionStatus::Connecting);
            let address = self.address();
            let connected = select! {
                r = runtime::timeout(self.config.connect_timeout, TcpStream::connect(address)).fuse() => r,
                ctrl = control.next() => match ctrl {
                    Some(Control::Readdress(address)) => {
                        lock(&self.session).address = address;
                        wait = false;
                        continue;
                    }
                    Some(Control::Retry) | Some(Control::ProbeFailed) => {
                        wait = false;
                        continue;
                    }
                    Some(Control::Shutdown) | None => break 'outer,
                },
            };

            match connected {
                Ok(Ok(stream)) => {
                    info!("Connected to {} at {address}", self.device);
                    failures = 0;
                    match Arc::clone(&self).serve(stream, address, &mut control).await {
                        SessionEnd::Lost(reason) => {
                            warn!("Lost connection to {}: {reason}", self.device);
                            self.drop_session(&reason);
                            wait = true;
                        }
                        SessionEnd::Readdressed => {
                            self.drop_session("moved to a new address");
                            wait = false;
                        }
                        SessionEnd::Shutdown => {
                            self.drop_session("closed");
                            break 'outer;
                        }
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    debug!("Connecting to {} at {address} failed: {e}", self.device);
                    self.connect_failed(failures, &e.to_string());
                    wait = true;
                }
                Err(_) => {
                    failures += 1;
                    debug!("Connecting to {} at {address} timed out", self.device);
                    self.connect_failed(failures, "connect timed out");
                    wait = true;
                }
            }
        }

        self.close_now();
        debug!("Supervisor of {} stopped", self.device);
    }

    fn connect_failed(&self, failures: u32, reason: &str) {
        {
            let mut session = lock(&self.session);
            session.failed_attempts = failures;
            session.history.record_error(reason);
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Run one connected session until it ends.
    async fn serve(
        self: Arc<Self>,
        stream: TcpStream,
        address: SocketAddr,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> SessionEnd {
        let (read, mut write) = stream.into_split();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut reader = runtime::spawn(Arc::clone(&self).read_loop(read, stop_rx)).fuse();

        let (out_tx, mut out_rx) = mpsc::unbounded::<String>();
        self.go_online(out_tx);

        let end = loop {
            select! {
                reason = reader => break SessionEnd::Lost(reason),
                ctrl = control.next() => match ctrl {
                    Some(Control::Readdress(new)) => {
                        lock(&self.session).address = new;
                        if new != address {
                            info!("Device {} moved from {address} to {new}", self.device);
                            let _ = runtime::timeout(Duration::from_secs(1), write.shutdown()).await;
                            break SessionEnd::Readdressed;
                        }
                    }
                    Some(Control::ProbeFailed) => break SessionEnd::Lost("keep-alive probe failed".into()),
                    Some(Control::Retry) => {}
                    Some(Control::Shutdown) | None => {
                        let _ = runtime::timeout(Duration::from_secs(1), write.shutdown()).await;
                        break SessionEnd::Shutdown;
                    }
                },
                line = out_rx.next() => {
                    let Some(line) = line else {
                        break SessionEnd::Lost("writer channel closed".into());
                    };
                    if let Err(e) = write.write_all(line.as_bytes()).await {
                        break SessionEnd::Lost(format!("write failed: {e}"));
                    }
                },
                _ = idle_timer(self.config.keepalive).fuse() => self.probe_if_idle(),
            }
        };

        let _ = stop_tx.send(());
        end
    }

    async fn read_loop<R: AsyncStreamRead>(
        self: Arc<Self>,
        mut read: R,
        mut stop: oneshot::Receiver<()>,
    ) -> String {
        let mut lines = LineBuffer::new();
        let mut chunk = [0u8; 4096];
        loop {
            let received = select! {
                r = read.read(&mut chunk).fuse() => r,
                _ = stop => return "stopped".to_string(),
            };
            match received {
                Ok(0) => return "closed by peer".to_string(),
                Ok(n) => {
                    lines.extend(&chunk[..n]);
                    while let Some(line) = lines.next_line() {
                        self.handle_line(&line);
                    }
                }
                Err(e) => return format!("read failed: {e}"),
            }
        }
    }

    /// Check the session with a `get_prop` if it has been quiet too long.
    fn probe_if_idle(self: &Arc<Self>) {
        let Some(keepalive) = self.config.keepalive else {
            return;
        };
        {
            let mut session = lock(&self.session);
            if session.probing || session.last_exchange.elapsed() < keepalive {
                return;
            }
            session.probing = true;
        }

        debug!("Probing idle connection to {}", self.device);
        let connection = Connection {
            inner: Arc::clone(self),
        };
        runtime::spawn(async move {
            let result = connection
                .send(Command::new(Method::GetProp, vec![json!("power")]))
                .await;
            lock(&connection.inner.session).probing = false;
            if let Err(e @ (Error::Timeout | Error::ConnectionLost)) = result {
                debug!("Probe of {} failed: {e}", connection.inner.device);
                let _ = connection.inner.control.unbounded_send(Control::ProbeFailed);
            }
        });
    }

    fn close_now(&self) {
        {
            let mut session = lock(&self.session);
            session.outbound = None;
            session.pending.fail_all(|| Error::Closed);
            session.fail_queue(|| Error::Closed);
        }
        self.set_status(ConnectionStatus::Closed);
    }
}

async fn idle_timer(keepalive: Option<Duration>) {
    match keepalive {
        Some(interval) => runtime::sleep(interval).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Handle to a device's control session. Cheap to clone.
///
/// The session keeps running until [`Connection::close`] is called;
/// dropping handles does not stop it.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.inner.device)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    /// Start a session to `address`. Must be called within a runtime.
    pub fn open(
        device: &str,
        address: SocketAddr,
        config: ConnectionConfig,
        reconciler: Reconciler,
        events: EventBus,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded();
        let history = MessageHistory::with_max_entries(config.history_size);
        reconciler.track(device);
        let inner = Arc::new(Inner {
            device: device.to_string(),
            config,
            session: Mutex::new(Session {
                status: ConnectionStatus::Disconnected,
                address,
                outbound: None,
                pending: PendingTable::default(),
                queue: VecDeque::new(),
                failed_attempts: 0,
                last_exchange: Instant::now(),
                probing: false,
                history,
            }),
            reconciler,
            events,
            control,
        });
        runtime::spawn(Arc::clone(&inner).supervise(control_rx));
        Connection { inner }
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address()
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.session).status
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Send a command and wait for its response.
    ///
    /// While connected the command is written immediately and any number
    /// of commands may be outstanding at once. While disconnected it is
    /// queued or refused according to the [`OfflinePolicy`]. The deadline
    /// starts when the command is written.
    ///
    /// An error response from the device becomes [`Error::Protocol`].
    pub async fn send(&self, command: Command) -> Result<Response> {
        let inner = &self.inner;
        let admitted = {
            let mut session = lock(&inner.session);
            match session.status {
                ConnectionStatus::Closed => return Err(Error::Closed),
                ConnectionStatus::Offline => return Err(Error::NotConnected(inner.device.clone())),
                ConnectionStatus::Connected => Admitted::Dispatched(session.dispatch(command)?),
                ConnectionStatus::Disconnected | ConnectionStatus::Connecting => {
                    match inner.config.offline_policy {
                        OfflinePolicy::FailFast => {
                            return Err(Error::NotConnected(inner.device.clone()));
                        }
                        OfflinePolicy::Queue { depth } if session.queue.len() >= depth => {
                            return Err(Error::QueueFull(inner.device.clone()));
                        }
                        OfflinePolicy::Queue { .. } => {
                            debug!("Queueing {} for {}", command.method(), inner.device);
                            let (handoff, rx) = oneshot::channel();
                            session.queue.push_back(Queued { command, handoff });
                            Admitted::Queued(rx)
                        }
                    }
                }
            }
        };

        let dispatched = match admitted {
            Admitted::Dispatched(dispatched) => dispatched,
            Admitted::Queued(handoff) => handoff.await.map_err(|_| Error::Closed)??,
        };

        match runtime::timeout(inner.config.command_timeout, dispatched.rx).await {
            Ok(Ok(result)) => {
                let response = result?;
                match response.outcome {
                    Ok(_) => Ok(response),
                    Err(e) => Err(Error::protocol(e.code, &e.message)),
                }
            }
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                lock(&inner.session).pending.cancel(dispatched.id);
                warn!("Command {} to {} timed out", dispatched.id, inner.device);
                Err(Error::Timeout)
            }
        }
    }

    /// Point the session at a new address. Reconnects if the address changed.
    pub fn readdress(&self, address: SocketAddr) {
        if self.address() == address {
            return;
        }
        let _ = self.inner.control.unbounded_send(Control::Readdress(address));
    }

    /// Restart the reconnect cycle of an offline device.
    pub fn retry(&self) {
        let _ = self.inner.control.unbounded_send(Control::Retry);
    }

    /// Close the session for good. Outstanding and queued commands fail
    /// with [`Error::Closed`].
    pub fn close(&self) {
        let _ = self.inner.control.unbounded_send(Control::Shutdown);
        self.inner.close_now();
    }

    pub fn history(&self) -> MessageHistory {
        lock(&self.inner.session).history.clone()
    }

    pub fn diagnostics(&self) -> ConnectionDiagnostics {
        let session = lock(&self.inner.session);
        ConnectionDiagnostics {
            device: self.inner.device.clone(),
            address: session.address,
            status: session.status,
            outstanding: session.pending.len(),
            oldest_outstanding_secs: session.pending.oldest_age(),
            queued: session.queue.len(),
            failed_attempts: session.failed_attempts,
            history: session.history.summary(),
        }
    }
}

#[cfg(all(test, feature = "runtime-tokio"))]
pub(crate) mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::types::PowerMode;
    use futures::StreamExt;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::net::tcp::OwnedWriteHalf;

    /// A fake device: yields each request line and lets the test answer.
    pub(crate) struct FakeDevice {
        listener: TcpListener,
    }

    pub(crate) struct FakeSession {
        lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl FakeDevice {
        pub(crate) async fn bind() -> Self {
            FakeDevice {
                listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        pub(crate) fn address(&self) -> SocketAddr {
            self.listener.local_addr().unwrap()
        }

        pub(crate) async fn accept(&self) -> FakeSession {
            let (stream, _) = self.listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            FakeSession {
                lines: BufReader::new(read).lines(),
                write,
            }
        }
    }

    impl FakeSession {
        pub(crate) async fn request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        pub(crate) async fn reply(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push_str("\r\n");
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        pub(crate) async fn answer_ok(&mut self) -> Value {
            let request = self.request().await;
            self.reply(json!({"id": request["id"], "result": ["ok"]})).await;
            request
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_command_timeout(Duration::from_millis(300))
            .with_keepalive(None)
            .with_backoff(BackoffPolicy {
                initial: Duration::from_millis(50),
                jitter: 0.0,
                retry_ceiling: 2,
                ..Default::default()
            })
    }

    fn open(device: &FakeDevice, config: ConnectionConfig) -> (Connection, Reconciler) {
        let reconciler = Reconciler::default();
        let conn = Connection::open(
            "0x1",
            device.address(),
            config,
            reconciler.clone(),
            EventBus::new(),
        );
        (conn, reconciler)
    }

    async fn wait_for(conn: &Connection, status: ConnectionStatus) {
        for _ in 0..200 {
            if conn.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection never became {status}, is {}", conn.status());
    }

    fn set_power_on() -> Command {
        Command::new(Method::SetPower, vec![json!("on"), json!("smooth"), json!(500)])
    }

    #[tokio::test]
    async fn test_set_power_updates_power_only() {
        let device = FakeDevice::bind().await;
        let (conn, reconciler) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        session
            .reply(json!({"method": "props", "params": {"bright": "40"}}))
            .await;
        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(set_power_on()).await }
        });
        let request = session.answer_ok().await;
        assert_eq!(request["method"], "set_power");
        assert_eq!(request["params"], json!(["on", "smooth", 500]));

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.result(), Some(&[json!("ok")][..]));
        assert_eq!(
            conn.history().latest(MessageType::Send, "set_power"),
            Some(&request)
        );
        let state = reconciler.snapshot("0x1").unwrap();
        assert_eq!(state.power(), Some(PowerMode::On));
        assert_eq!(state.brightness().map(|b| b.value()), Some(40));
        conn.close();
    }

    #[tokio::test]
    async fn test_pipelined_responses_out_of_order() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("get_prop", vec![json!("power")])).await }
        });
        let a = session.request().await;
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("get_prop", vec![json!("bright")])).await }
        });
        let b = session.request().await;
        assert_ne!(a["id"], b["id"]);

        session.reply(json!({"id": b["id"], "result": ["55"]})).await;
        session.reply(json!({"id": a["id"], "result": ["on"]})).await;

        assert_eq!(first.await.unwrap().unwrap().result(), Some(&[json!("on")][..]));
        assert_eq!(second.await.unwrap().unwrap().result(), Some(&[json!("55")][..]));
        conn.close();
    }

    #[tokio::test]
    async fn test_concurrent_sends_resolve_exactly_once() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        let calls: Vec<_> = (0..12)
            .map(|i| {
                let conn = conn.clone();
                let call = tokio::spawn(async move {
                    conn.send(Command::raw("set_name", vec![json!(i)])).await
                });
                (i, call)
            })
            .collect();

        let mut requests = Vec::new();
        for _ in 0..12 {
            requests.push(session.request().await);
        }
        for request in &requests {
            match request["params"][0].as_u64().unwrap() % 3 {
                0 => {
                    // A duplicate answer must not resolve anything twice.
                    for _ in 0..2 {
                        session
                            .reply(json!({"id": request["id"], "result": ["ok"]}))
                            .await;
                    }
                }
                1 => {
                    session
                        .reply(json!({"id": request["id"], "error": {"code": -1, "message": "busy"}}))
                        .await;
                }
                _ => {}
            }
        }

        for (i, call) in calls {
            let result = call.await.unwrap();
            match i % 3 {
                0 => assert!(result.is_ok()),
                1 => assert_eq!(result, Err(Error::protocol(-1, "busy"))),
                _ => assert_eq!(result, Err(Error::Timeout)),
            }
        }
        assert_eq!(conn.diagnostics().outstanding, 0);
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        conn.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sends_racing_the_connect_all_resolve() {
        for _ in 0..20 {
            let device = FakeDevice::bind().await;
            let (conn, _) = open(&device, config().with_command_timeout(Duration::from_secs(2)));
            let calls: Vec<_> = (0..16)
                .map(|i| {
                    let conn = conn.clone();
                    tokio::spawn(async move {
                        conn.send(Command::raw("set_name", vec![json!(i)])).await
                    })
                })
                .collect();

            let mut session = device.accept().await;
            tokio::time::timeout(Duration::from_secs(3), async {
                for _ in 0..16 {
                    session.answer_ok().await;
                }
            })
            .await
            .expect("a command was stranded in the offline queue");
            for call in calls {
                assert!(call.await.unwrap().is_ok());
            }
            assert_eq!(conn.diagnostics().queued, 0);
            conn.close();
        }
    }

    #[tokio::test]
    async fn test_error_response_is_protocol_error() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("set_bright", vec![json!(500)])).await }
        });
        let request = session.request().await;
        session
            .reply(json!({"id": request["id"], "error": {"code": -1, "message": "invalid params"}}))
            .await;
        assert_eq!(
            call.await.unwrap(),
            Err(Error::protocol(-1, "invalid params"))
        );
        conn.close();
    }

    #[tokio::test]
    async fn test_drop_fails_all_outstanding_and_reconnects() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        let calls: Vec<_> = (0..3)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.send(Command::raw("toggle", vec![])).await })
            })
            .collect();
        for _ in 0..3 {
            session.request().await;
        }
        let dropped = std::time::Instant::now();
        drop(session);

        for call in calls {
            assert_eq!(call.await.unwrap(), Err(Error::ConnectionLost));
        }

        // The supervisor comes back after the initial backoff.
        let mut session = device.accept().await;
        assert!(dropped.elapsed() >= Duration::from_millis(50));
        wait_for(&conn, ConnectionStatus::Connected).await;
        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("toggle", vec![])).await }
        });
        session.answer_ok().await;
        assert!(call.await.unwrap().is_ok());
        conn.close();
    }

    #[tokio::test]
    async fn test_timeout_frees_request_id() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        let result = tokio::join!(conn.send(Command::raw("toggle", vec![])), session.request());
        assert_eq!(result.0, Err(Error::Timeout));
        assert_eq!(conn.diagnostics().outstanding, 0);

        // A late answer for the expired ID is dropped quietly.
        session.reply(json!({"id": result.1["id"], "result": ["ok"]})).await;
        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("toggle", vec![])).await }
        });
        session.answer_ok().await;
        assert!(call.await.unwrap().is_ok());
        conn.close();
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let device = FakeDevice::bind().await;
        let (conn, reconciler) = open(&device, config());
        let mut session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        session.write.write_all(b"this is not json\r\n{\"id\":\r\n").await.unwrap();
        session
            .reply(json!({"method": "props", "params": {"bright": "30", "unknown": 1}}))
            .await;

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("toggle", vec![])).await }
        });
        session.answer_ok().await;
        assert!(call.await.unwrap().is_ok());
        assert_eq!(
            reconciler.snapshot("0x1").unwrap().brightness().map(|b| b.value()),
            Some(30)
        );
        assert!(conn.history().last_error().is_some());
        conn.close();
    }

    #[tokio::test]
    async fn test_queued_commands_replay_in_order() {
        let device = FakeDevice::bind().await;
        let address = device.address();
        drop(device);

        let (conn, _) = {
            let reconciler = Reconciler::default();
            let conn = Connection::open(
                "0x1",
                address,
                config().with_backoff(BackoffPolicy {
                    initial: Duration::from_millis(50),
                    jitter: 0.0,
                    retry_ceiling: 0,
                    ..Default::default()
                }),
                reconciler.clone(),
                EventBus::new(),
            );
            (conn, reconciler)
        };

        let mut calls = Vec::new();
        for name in ["first", "second", "third"] {
            let conn = conn.clone();
            calls.push(tokio::spawn(async move {
                conn.send(Command::raw("set_name", vec![json!(name)])).await
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(conn.diagnostics().queued, 3);

        let device = FakeDevice {
            listener: TcpListener::bind(address).await.unwrap(),
        };
        let mut session = device.accept().await;
        for expected in ["first", "second", "third"] {
            let request = session.answer_ok().await;
            assert_eq!(request["params"][0], expected);
        }
        for call in calls {
            assert!(call.await.unwrap().is_ok());
        }
        conn.close();
    }

    #[tokio::test]
    async fn test_fail_fast_and_queue_limit() {
        let device = FakeDevice::bind().await;
        let address = device.address();
        drop(device);

        let fail_fast = Connection::open(
            "0x1",
            address,
            config().with_offline_policy(OfflinePolicy::FailFast),
            Reconciler::default(),
            EventBus::new(),
        );
        assert_eq!(
            fail_fast.send(Command::raw("toggle", vec![])).await,
            Err(Error::NotConnected("0x1".into()))
        );
        fail_fast.close();

        let queued = Connection::open(
            "0x2",
            address,
            config().with_offline_policy(OfflinePolicy::Queue { depth: 1 }),
            Reconciler::default(),
            EventBus::new(),
        );
        let first = tokio::spawn({
            let conn = queued.clone();
            async move { conn.send(Command::raw("toggle", vec![])).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            queued.send(Command::raw("toggle", vec![])).await,
            Err(Error::QueueFull("0x2".into()))
        );
        queued.close();
        assert_eq!(first.await.unwrap(), Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_offline_after_retry_ceiling_then_retry() {
        let device = FakeDevice::bind().await;
        let address = device.address();
        drop(device);

        let events = EventBus::new();
        let mut sub = events.subscribe();
        let conn = Connection::open("0x1", address, config(), Reconciler::default(), events);
        wait_for(&conn, ConnectionStatus::Offline).await;
        assert_eq!(
            conn.send(Command::raw("toggle", vec![])).await,
            Err(Error::NotConnected("0x1".into()))
        );

        let statuses: Vec<ConnectionStatus> = sub
            .by_ref()
            .filter_map(|e| async move {
                match e {
                    DeviceEvent::ConnectionChanged { status, .. } => Some(status),
                    _ => None,
                }
            })
            .take_while(|s| futures::future::ready(*s != ConnectionStatus::Offline))
            .collect()
            .await;
        assert_eq!(statuses.first(), Some(&ConnectionStatus::Connecting));

        let device = FakeDevice {
            listener: TcpListener::bind(address).await.unwrap(),
        };
        conn.retry();
        let _session = device.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;
        conn.close();
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert_eq!(conn.send(Command::raw("toggle", vec![])).await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn test_readdress_moves_session() {
        let old = FakeDevice::bind().await;
        let new = FakeDevice::bind().await;
        let (conn, _) = open(&old, config());
        let _old_session = old.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;

        conn.readdress(new.address());
        let mut session = new.accept().await;
        wait_for(&conn, ConnectionStatus::Connected).await;
        assert_eq!(conn.address(), new.address());

        let call = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send(Command::raw("toggle", vec![])).await }
        });
        session.answer_ok().await;
        assert!(call.await.unwrap().is_ok());
        conn.close();
    }

    #[tokio::test]
    async fn test_keepalive_probe() {
        let device = FakeDevice::bind().await;
        let (conn, _) = open(
            &device,
            config().with_keepalive(Some(Duration::from_millis(100))),
        );
        let mut session = device.accept().await;
        let probe = session.request().await;
        assert_eq!(probe["method"], "get_prop");
        assert_eq!(probe["params"], json!(["power"]));
        conn.close();
    }
}
