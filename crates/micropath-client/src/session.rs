//! Realtime analysis session.
//!
//! One session owns one logical connection to the backend analysis socket.
//! All state transitions happen inside a single actor task that consumes
//! commands, transport events, and timers through one `select!` loop, so
//! transitions are serialized by construction. Commands never block the
//! caller; results surface through the snapshot channel.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, Interval, Sleep};
use tracing::{debug, trace, warn};

use micropath_core::config::Endpoint;
use micropath_core::events::{AnalysisRequest, AnalysisResult, ClientEvent, ServerEvent};
use micropath_core::ids::{ConnectionId, JobId};

use crate::transport::{
    Connection, Transport, TransportEvent, WsTransport, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};

/// Connection lifecycle. `Disconnected` is re-enterable; there is no
/// terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Observable session state, published after every transition.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub connection_id: Option<ConnectionId>,
    pub analyzing: bool,
    pub job_id: Option<JobId>,
    pub progress: f32,
    pub current_step: String,
    pub streamed_content: String,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            connection_id: None,
            analyzing: false,
            job_id: None,
            progress: 0.0,
            current_step: String::new(),
            streamed_content: String::new(),
            result: None,
            error: None,
        }
    }
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

/// Lifecycle notification callbacks.
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

#[derive(Clone)]
pub struct SessionOptions {
    pub auto_connect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub hooks: SessionHooks,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            auto_connect: false,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(3),
            ping_interval: Duration::from_secs(30),
            hooks: SessionHooks::default(),
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    StartAnalysis(AnalysisRequest),
    CancelAnalysis,
    Reset,
}

/// Handle to a running session actor. Cheap to clone; dropping the last
/// handle shuts the actor down.
#[derive(Clone)]
pub struct RealtimeSession {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl RealtimeSession {
    /// Spawn a session actor over the given transport. Must be called from
    /// within a tokio runtime.
    pub fn spawn<T: Transport>(transport: T, url: impl Into<String>, options: SessionOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let actor = SessionActor {
            transport,
            url: url.into(),
            options,
            commands: cmd_rx,
            state_tx,
            snap: SessionSnapshot::default(),
            conn: None,
            transport_events: None,
            keepalive: None,
            reconnect_timer: None,
            reconnect_attempts: 0,
        };
        tokio::spawn(actor.run());

        Self {
            commands: cmd_tx,
            state: state_rx,
        }
    }

    /// Spawn a session over a real WebSocket to the endpoint's analysis
    /// socket.
    pub fn open(endpoint: &Endpoint, options: SessionOptions) -> Self {
        Self::spawn(WsTransport::new(), endpoint.ws_url(), options)
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    pub fn start_analysis(&self, request: AnalysisRequest) {
        let _ = self.commands.send(Command::StartAnalysis(request));
    }

    pub fn cancel_analysis(&self) {
        let _ = self.commands.send(Command::CancelAnalysis);
    }

    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }
}

struct SessionActor<T: Transport> {
    transport: T,
    url: String,
    options: SessionOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SessionSnapshot>,
    snap: SessionSnapshot,
    conn: Option<Connection>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    keepalive: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    reconnect_attempts: u32,
}

impl<T: Transport> SessionActor<T> {
    async fn run(mut self) {
        if self.options.auto_connect {
            self.open_transport().await;
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped; tear down.
                    None => break,
                },
                ev = recv_event(&mut self.transport_events), if self.transport_events.is_some() => {
                    match ev {
                        Some(ev) => self.handle_transport_event(ev),
                        // Transport tasks went away without a close frame.
                        None => self.handle_close(ABNORMAL_CLOSURE),
                    }
                },
                _ = next_tick(&mut self.keepalive), if self.keepalive.is_some() => {
                    self.send_event(&ClientEvent::Ping);
                },
                _ = fired(&mut self.reconnect_timer), if self.reconnect_timer.is_some() => {
                    self.reconnect_timer = None;
                    self.open_transport().await;
                },
            }
        }

        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.open_transport().await,
            Command::Disconnect => self.disconnect(),
            Command::StartAnalysis(request) => self.start_analysis(request),
            Command::CancelAnalysis => self.cancel_analysis(),
            Command::Reset => {
                self.reset_job_state();
                self.publish();
            }
        }
    }

    /// Open the transport unless a connection is already up. The state
    /// becomes Connected only once the server greeting arrives.
    async fn open_transport(&mut self) {
        if self.conn.is_some() {
            debug!("connect ignored, transport already open");
            return;
        }

        self.snap.connection = ConnectionState::Connecting;
        self.snap.error = None;
        self.publish();

        let (events_tx, events_rx) = mpsc::channel(64);
        match self.transport.open(&self.url, events_tx).await {
            Ok(conn) => {
                debug!(url = %self.url, "transport open");
                self.reconnect_attempts = 0;
                self.conn = Some(conn);
                self.transport_events = Some(events_rx);
                if let Some(cb) = &self.options.hooks.on_connect {
                    cb();
                }
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "transport open failed");
                self.snap.connection = ConnectionState::Error;
                self.snap.error = Some(message.clone());
                self.publish();
                if let Some(cb) = &self.options.hooks.on_error {
                    cb(&message);
                }
            }
        }
    }

    fn disconnect(&mut self) {
        self.keepalive = None;
        self.reconnect_timer = None;
        self.transport_events = None;
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
        self.snap.connection = ConnectionState::Disconnected;
        self.snap.connection_id = None;
        self.publish();
        if let Some(cb) = &self.options.hooks.on_disconnect {
            cb();
        }
    }

    fn start_analysis(&mut self, request: AnalysisRequest) {
        if self.conn.is_none() {
            // Fail fast without raising; the caller observes the error in
            // the snapshot.
            self.snap.error = Some("WebSocket not connected".into());
            self.publish();
            return;
        }

        self.reset_job_state();
        self.snap.analyzing = true;
        self.send_event(&ClientEvent::analyze(request));
        self.publish();
    }

    /// Fire-and-forget: the backend is asked to cancel, but a `complete`
    /// arriving afterwards is still applied (there is no sequence number to
    /// detect staleness).
    fn cancel_analysis(&mut self) {
        if self.conn.is_some() {
            if let Some(job_id) = self.snap.job_id.clone() {
                self.send_event(&ClientEvent::Cancel { job_id });
            }
        }
        self.snap.analyzing = false;
        self.publish();
    }

    fn reset_job_state(&mut self) {
        self.snap.analyzing = false;
        self.snap.job_id = None;
        self.snap.progress = 0.0;
        self.snap.current_step.clear();
        self.snap.streamed_content.clear();
        self.snap.result = None;
        self.snap.error = None;
    }

    fn handle_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Message(text) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => self.apply_server_event(event),
                Err(e) => warn!(error = %e, "dropping malformed server message"),
            },
            TransportEvent::Error(message) => {
                warn!(error = %message, "transport error");
                self.snap.connection = ConnectionState::Error;
                self.snap.error = Some(message.clone());
                self.publish();
                if let Some(cb) = &self.options.hooks.on_error {
                    cb(&message);
                }
            }
            TransportEvent::Closed { code } => self.handle_close(code),
        }
    }

    fn handle_close(&mut self, code: u16) {
        debug!(code, "transport closed");
        self.keepalive = None;
        self.conn = None;
        self.transport_events = None;
        self.snap.connection = ConnectionState::Disconnected;
        self.snap.connection_id = None;
        if let Some(cb) = &self.options.hooks.on_disconnect {
            cb();
        }

        if code != NORMAL_CLOSURE {
            if self.reconnect_attempts < self.options.reconnect_attempts {
                self.reconnect_attempts += 1;
                self.snap.connection = ConnectionState::Reconnecting;
                self.reconnect_timer =
                    Some(Box::pin(tokio::time::sleep(self.options.reconnect_interval)));
                debug!(
                    attempt = self.reconnect_attempts,
                    max = self.options.reconnect_attempts,
                    "scheduling reconnect"
                );
            } else {
                // Matches the original client: exhaustion surfaces no
                // terminal error, only this log line.
                warn!(
                    attempts = self.reconnect_attempts,
                    "reconnect attempts exhausted, giving up"
                );
            }
        }
        self.publish();
    }

    fn apply_server_event(&mut self, event: ServerEvent) {
        trace!(event_type = event.event_type(), "server event");
        match event {
            ServerEvent::Connected { connection_id } => {
                self.snap.connection = ConnectionState::Connected;
                self.snap.connection_id = Some(connection_id);
                self.start_keepalive();
            }
            ServerEvent::Progress { job_id, progress, step, .. } => {
                self.note_job(job_id);
                self.snap.progress = progress;
                self.snap.current_step = step;
            }
            ServerEvent::Thinking { job_id, message } => {
                self.note_job(job_id);
                self.snap.current_step = message;
            }
            ServerEvent::Chunk { job_id, content, .. } => {
                self.note_job(job_id);
                // Append-only; chunks never replace earlier content.
                self.snap.streamed_content.push_str(&content);
            }
            ServerEvent::Complete { job_id, result } => {
                self.note_job(job_id);
                self.snap.analyzing = false;
                self.snap.progress = 100.0;
                self.snap.result = Some(result);
            }
            ServerEvent::Error { job_id, error } => {
                self.note_job(job_id);
                self.snap.analyzing = false;
                self.snap.error = Some(error);
            }
            ServerEvent::Pong => trace!("keepalive pong"),
            ServerEvent::Unknown => debug!("ignoring unknown server event"),
        }
        self.publish();
    }

    /// Capture the server-issued job id from the first event carrying one.
    fn note_job(&mut self, job_id: Option<JobId>) {
        if self.snap.job_id.is_none() {
            self.snap.job_id = job_id;
        }
    }

    fn start_keepalive(&mut self) {
        let period = self.options.ping_interval;
        self.keepalive = Some(interval_at(Instant::now() + period, period));
    }

    fn send_event(&mut self, event: &ClientEvent) {
        let Some(conn) = &self.conn else { return };
        match serde_json::to_string(event) {
            Ok(text) => conn.send_text(text),
            Err(e) => warn!(error = %e, "failed to serialize client event"),
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snap.clone());
    }
}

async fn recv_event(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn fired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use micropath_core::events::AnalysisMode;

    use crate::mock::{MockConnection, MockRemote, MockTransport};
    use crate::transport::OutboundFrame;

    fn session_with(options: SessionOptions) -> (RealtimeSession, MockRemote) {
        let (transport, remote) = MockTransport::new();
        let session = RealtimeSession::spawn(transport, "mock://analysis", options);
        (session, remote)
    }

    fn quick_options() -> SessionOptions {
        SessionOptions {
            reconnect_interval: Duration::from_millis(50),
            ping_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SessionSnapshot>,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snap = rx.borrow_and_update();
                    if predicate(&snap) {
                        return snap.clone();
                    }
                }
                rx.changed().await.expect("session actor gone");
            }
        })
        .await
        .expect("condition not reached")
    }

    /// Connect and complete the greeting handshake.
    async fn connect_and_greet(
        session: &RealtimeSession,
        remote: &mut MockRemote,
        connection_id: &str,
    ) -> MockConnection {
        let mut rx = session.subscribe();
        session.connect();
        let conn = remote.next_open().await;
        conn.greet(connection_id).await;
        wait_for(&mut rx, |s| s.is_connected()).await;
        conn
    }

    #[tokio::test]
    async fn greeting_completes_connect() {
        let (session, mut remote) = session_with(quick_options());
        let _conn = connect_and_greet(&session, &mut remote, "abc").await;

        let snap = session.snapshot();
        assert_eq!(snap.connection, ConnectionState::Connected);
        assert_eq!(snap.connection_id, Some(ConnectionId::from_raw("abc")));
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let (session, mut remote) = session_with(quick_options());
        let _conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        rx.borrow_and_update();
        session.connect();
        session.connect();
        // Commands are processed in order, so the reset publish proves the
        // extra connects have been handled.
        session.reset();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("reset not observed")
            .unwrap();

        assert!(remote.try_next_open().is_none(), "transport opened twice");
    }

    #[tokio::test]
    async fn auto_connect_opens_without_command() {
        let options = SessionOptions {
            auto_connect: true,
            ..quick_options()
        };
        let (_session, mut remote) = session_with(options);
        // The open happens during actor startup.
        remote.next_open().await;
    }

    #[tokio::test]
    async fn open_failure_surfaces_error_state() {
        let (session, remote) = session_with(quick_options());
        remote.fail_next_opens(1);

        let mut rx = session.subscribe();
        session.connect();
        let snap = wait_for(&mut rx, |s| s.connection == ConnectionState::Error).await;
        assert!(snap.error.as_deref().unwrap().contains("mock open refused"));
    }

    #[tokio::test]
    async fn start_analysis_when_disconnected_fails_fast() {
        let (session, mut remote) = session_with(quick_options());

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Chat));
        let snap = wait_for(&mut rx, |s| s.error.is_some()).await;

        assert!(!snap.analyzing);
        assert!(remote.try_next_open().is_none());
    }

    #[tokio::test]
    async fn start_analysis_sends_analyze_event() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Chat));
        wait_for(&mut rx, |s| s.analyzing).await;

        let frame = conn.next_text().await.unwrap();
        assert!(frame.contains(r#""type":"analyze""#));
        assert!(frame.contains(r#""mode":"chat""#));
        assert!(frame.contains(r#""question":"q""#));
    }

    #[tokio::test]
    async fn chunks_accumulate_in_order() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.send_json(json!({"type": "chunk", "job_id": "j1", "content": "a", "is_final": false}))
            .await;
        conn.send_json(json!({"type": "chunk", "job_id": "j1", "content": "b", "is_final": true}))
            .await;

        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| s.streamed_content == "ab").await;
        assert_eq!(snap.job_id, Some(JobId::from_raw("j1")));
    }

    #[tokio::test]
    async fn complete_forces_progress_to_100() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Auto));
        wait_for(&mut rx, |s| s.analyzing).await;
        conn.next_text().await.unwrap();

        conn.send_json(json!({"type": "progress", "job_id": "j1", "progress": 40, "step": "thinking", "message": ""}))
            .await;
        wait_for(&mut rx, |s| s.progress == 40.0).await;

        conn.send_json(json!({
            "type": "complete",
            "job_id": "j1",
            "result": {
                "prediction": "answer",
                "execution_time": 1.2,
                "tools_used": [],
                "rounds": 1,
                "termination": "done"
            }
        }))
        .await;

        let snap = wait_for(&mut rx, |s| s.result.is_some()).await;
        assert!(!snap.analyzing);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.result.unwrap().prediction, "answer");
    }

    #[tokio::test]
    async fn thinking_updates_step_only() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.send_json(json!({"type": "thinking", "job_id": "j1", "message": "searching literature"}))
            .await;

        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| !s.current_step.is_empty()).await;
        assert_eq!(snap.current_step, "searching literature");
        assert_eq!(snap.progress, 0.0);
        assert!(snap.streamed_content.is_empty());
    }

    #[tokio::test]
    async fn server_error_stops_analysis() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Auto));
        wait_for(&mut rx, |s| s.analyzing).await;
        conn.next_text().await.unwrap();

        conn.send_json(json!({"type": "error", "job_id": "j1", "error": "model overloaded"}))
            .await;
        let snap = wait_for(&mut rx, |s| s.error.is_some()).await;
        assert!(!snap.analyzing);
        assert_eq!(snap.error.as_deref(), Some("model overloaded"));
        // The connection itself stays up.
        assert!(snap.is_connected());
    }

    #[tokio::test]
    async fn cancel_sends_cancel_with_captured_job_id() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Auto));
        wait_for(&mut rx, |s| s.analyzing).await;
        conn.next_text().await.unwrap();

        conn.send_json(json!({"type": "progress", "job_id": "j-9", "progress": 10, "step": "", "message": ""}))
            .await;
        wait_for(&mut rx, |s| s.job_id.is_some()).await;

        session.cancel_analysis();
        let snap = wait_for(&mut rx, |s| !s.analyzing).await;
        assert!(snap.job_id.is_some());

        let frame = conn.next_text().await.unwrap();
        assert!(frame.contains(r#""type":"cancel""#));
        assert!(frame.contains(r#""job_id":"j-9""#));
    }

    #[tokio::test]
    async fn cancel_without_job_id_sends_nothing() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Auto));
        wait_for(&mut rx, |s| s.analyzing).await;
        conn.next_text().await.unwrap();

        session.cancel_analysis();
        wait_for(&mut rx, |s| !s.analyzing).await;
        assert!(conn.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn complete_after_cancel_is_still_applied() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Auto));
        wait_for(&mut rx, |s| s.analyzing).await;
        conn.next_text().await.unwrap();

        session.cancel_analysis();
        wait_for(&mut rx, |s| !s.analyzing).await;

        // The backend did not honor the cancel in time; last message wins.
        conn.send_json(json!({
            "type": "complete",
            "job_id": "j1",
            "result": {
                "prediction": "late answer",
                "execution_time": 3.0,
                "tools_used": ["blast"],
                "rounds": 2,
                "termination": "done"
            }
        }))
        .await;

        let snap = wait_for(&mut rx, |s| s.result.is_some()).await;
        assert_eq!(snap.result.unwrap().prediction, "late answer");
        assert_eq!(snap.progress, 100.0);
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.send_text("{not json").await;
        conn.send_json(json!({"type": "chunk", "content": "still alive"})).await;

        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| !s.streamed_content.is_empty()).await;
        assert!(snap.is_connected());
        assert_eq!(snap.streamed_content, "still alive");
    }

    #[tokio::test]
    async fn unknown_event_kind_is_ignored() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.send_json(json!({"type": "tool_call", "tool": "blast"})).await;
        conn.send_json(json!({"type": "chunk", "content": "x"})).await;

        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| !s.streamed_content.is_empty()).await;
        assert!(snap.is_connected());
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn transport_error_sets_error_state_without_closing() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let options = SessionOptions {
            hooks: SessionHooks {
                on_error: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..quick_options()
        };
        let (session, mut remote) = session_with(options);
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.error("tls handshake reset").await;

        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| s.connection == ConnectionState::Error).await;
        assert_eq!(snap.error.as_deref(), Some("tls handshake reset"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Events still flow; the error state did not tear down the socket.
        conn.send_json(json!({"type": "chunk", "content": "x"})).await;
        wait_for(&mut rx, |s| s.streamed_content == "x").await;
    }

    #[tokio::test]
    async fn reset_clears_job_state_only() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.send_json(json!({"type": "chunk", "job_id": "j1", "content": "partial"}))
            .await;
        let mut rx = session.subscribe();
        wait_for(&mut rx, |s| !s.streamed_content.is_empty()).await;

        session.reset();
        let snap = wait_for(&mut rx, |s| s.streamed_content.is_empty()).await;
        assert!(snap.job_id.is_none());
        assert_eq!(snap.progress, 0.0);
        // Connection state untouched.
        assert!(snap.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_while_connected() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        tokio::time::advance(Duration::from_secs(31)).await;
        let frame = conn.next_text().await.unwrap();
        assert_eq!(frame, r#"{"type":"ping"}"#);

        tokio::time::advance(Duration::from_secs(30)).await;
        let frame = conn.next_text().await.unwrap();
        assert_eq!(frame, r#"{"type":"ping"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn no_pings_after_disconnect() {
        let (session, mut remote) = session_with(quick_options());
        let mut conn = connect_and_greet(&session, &mut remote, "abc").await;

        let mut rx = session.subscribe();
        session.disconnect();
        wait_for(&mut rx, |s| s.connection == ConnectionState::Disconnected).await;
        assert_eq!(conn.next_frame().await, Some(OutboundFrame::Close));

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(conn.try_next_frame().is_none(), "ping sent after disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_close_schedules_one_reconnect() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.close(1006).await;
        let mut rx = session.subscribe();
        let snap = wait_for(&mut rx, |s| s.connection == ConnectionState::Reconnecting).await;
        assert!(snap.connection_id.is_none());
        assert!(remote.try_next_open().is_none(), "reconnected before delay");

        tokio::time::advance(Duration::from_millis(60)).await;
        let conn2 = remote.next_open().await;
        conn2.greet("def").await;
        let snap = wait_for(&mut rx, |s| s.is_connected()).await;
        assert_eq!(snap.connection_id, Some(ConnectionId::from_raw("def")));
        assert!(remote.try_next_open().is_none(), "more than one reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn normal_close_never_reconnects() {
        let (session, mut remote) = session_with(quick_options());
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.close(NORMAL_CLOSURE).await;
        let mut rx = session.subscribe();
        wait_for(&mut rx, |s| s.connection == ConnectionState::Disconnected).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(remote.try_next_open().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_at_attempt_limit_schedules_none() {
        let options = SessionOptions {
            reconnect_attempts: 0,
            ..quick_options()
        };
        let (session, mut remote) = session_with(options);
        let conn = connect_and_greet(&session, &mut remote, "abc").await;

        conn.close(1006).await;
        let mut rx = session.subscribe();
        wait_for(&mut rx, |s| s.connection == ConnectionState::Disconnected).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(remote.try_next_open().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_attempt_counter() {
        let options = SessionOptions {
            reconnect_attempts: 1,
            ..quick_options()
        };
        let (session, mut remote) = session_with(options);
        let conn = connect_and_greet(&session, &mut remote, "a").await;

        // First drop eats the single allowed attempt.
        conn.close(1006).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        let conn2 = remote.next_open().await;
        conn2.greet("b").await;
        let mut rx = session.subscribe();
        wait_for(&mut rx, |s| s.is_connected()).await;

        // The successful open reset the counter, so a second drop retries
        // again.
        conn2.close(1006).await;
        wait_for(&mut rx, |s| s.connection == ConnectionState::Reconnecting).await;
        tokio::time::advance(Duration::from_millis(60)).await;
        remote.next_open().await;
    }

    #[tokio::test]
    async fn lifecycle_hooks_fire() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connects);
        let d = Arc::clone(&disconnects);
        let options = SessionOptions {
            hooks: SessionHooks {
                on_connect: Some(Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
                on_disconnect: Some(Arc::new(move || {
                    d.fetch_add(1, Ordering::SeqCst);
                })),
                on_error: None,
            },
            ..quick_options()
        };
        let (session, mut remote) = session_with(options);
        let _conn = connect_and_greet(&session, &mut remote, "abc").await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        let mut rx = session.subscribe();
        session.disconnect();
        wait_for(&mut rx, |s| s.connection == ConnectionState::Disconnected).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    /// End-to-end flow from the design notes: connect, analyze, progress,
    /// complete.
    #[tokio::test]
    async fn full_analysis_round_trip() {
        let (session, mut remote) = session_with(quick_options());

        let mut rx = session.subscribe();
        session.connect();
        let mut conn = remote.next_open().await;
        conn.greet("abc").await;
        let snap = wait_for(&mut rx, |s| s.is_connected()).await;
        assert_eq!(snap.connection_id, Some(ConnectionId::from_raw("abc")));

        session.start_analysis(AnalysisRequest::new("q", AnalysisMode::Chat));
        wait_for(&mut rx, |s| s.analyzing).await;
        let frame = conn.next_text().await.unwrap();
        assert!(frame.contains(r#""mode":"chat""#));

        conn.send_json(json!({"type": "progress", "job_id": "j1", "progress": 40, "step": "thinking", "message": ""}))
            .await;
        let snap = wait_for(&mut rx, |s| s.progress == 40.0).await;
        assert_eq!(snap.current_step, "thinking");

        conn.send_json(json!({
            "type": "complete",
            "job_id": "j1",
            "result": {
                "prediction": "answer",
                "execution_time": 1.2,
                "tools_used": [],
                "rounds": 1,
                "termination": "done"
            }
        }))
        .await;
        let snap = wait_for(&mut rx, |s| s.result.is_some()).await;
        assert!(!snap.analyzing);
        assert_eq!(snap.progress, 100.0);
        assert_eq!(snap.result.unwrap().prediction, "answer");
    }
}
