//! Core server: accepts viewer connections and wires each one to the
//! process manager through an [`Attachment`].
//!
//! Owns the process manager and the broadcast channels used for resume
//! tokens and shutdown. Every connection runs in its own task.

use crate::attach::{Attachment, ViewerEvent, ViewerSink};
use crate::config::ServerConfig;
use crate::session::{ProcessManager, SessionInfo, SpawnConfig};
use crate::transport::websocket::{ViewerListener, ViewerSocket};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use termhub_core::messages::error_code;
use termhub_core::{
    ClientMessage, HubError, HubResult, ServerMessage, SessionSummary, SpawnRequest,
    PROTOCOL_VERSION,
};
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

/// Outbound half of one connection, fed by session pump threads.
///
/// Never blocks: events go onto an unbounded channel drained by the
/// connection task. Once more than `max_pending_bytes` of output is waiting
/// the viewer is marked lagged, every later event is refused and the
/// connection is closed. The viewer recovers by reconnecting and replaying.
struct ConnectionSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
    pending_bytes: Arc<AtomicUsize>,
    max_pending_bytes: usize,
    lagged: AtomicBool,
    lag_notify: Arc<Notify>,
}

impl ViewerSink for ConnectionSink {
    fn send(&self, event: ViewerEvent) -> HubResult<()> {
        if self.lagged.load(Ordering::Acquire) {
            return Err(HubError::Transport("viewer lagged".into()));
        }

        let message = match event {
            ViewerEvent::Output { session_id, data } => {
                let pending = self.pending_bytes.fetch_add(data.len(), Ordering::AcqRel) + data.len();
                if pending > self.max_pending_bytes {
                    self.pending_bytes.fetch_sub(data.len(), Ordering::AcqRel);
                    self.lagged.store(true, Ordering::Release);
                    self.lag_notify.notify_one();
                    return Err(HubError::Transport(format!(
                        "viewer lagged: {pending} bytes pending"
                    )));
                }
                ServerMessage::Output {
                    session_id,
                    data: data.to_vec(),
                }
            }
            ViewerEvent::ReplayComplete { session_id } => {
                ServerMessage::ReplayComplete { session_id }
            }
            ViewerEvent::Exited { session_id } => ServerMessage::Exited { session_id },
        };

        self.tx
            .send(message)
            .map_err(|_| HubError::Transport("connection closed".into()))
    }
}

/// The termhub server instance.
pub struct HubServer {
    config: ServerConfig,
    manager: Arc<ProcessManager>,
    /// Messages for every connected viewer (resume tokens).
    events_tx: broadcast::Sender<ServerMessage>,
    shutdown_tx: broadcast::Sender<()>,
}

impl HubServer {
    pub fn new(config: ServerConfig) -> Self {
        let events_tx = broadcast::channel(64).0;

        let token_tx = events_tx.clone();
        let manager = ProcessManager::new(config.buffer_capacity).with_resume_handler(Arc::new(
            move |session_id: &str, token: &str| {
                // No receivers just means no viewer is connected.
                let _ = token_tx.send(ServerMessage::ResumeToken {
                    session_id: session_id.to_string(),
                    token: token.to_string(),
                });
            },
        ));

        Self {
            config,
            manager: Arc::new(manager),
            events_tx,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Bind the viewer listener.
    pub async fn listen(&self) -> HubResult<ViewerListener> {
        ViewerListener::bind(SocketAddr::new(self.config.bind, self.config.port)).await
    }

    /// Bind and serve forever.
    pub async fn run(self: Arc<Self>) -> HubResult<()> {
        let listener = self.listen().await?;
        info!(addr = %listener.local_addr(), "termhub-server ready");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept viewers from `listener`, each in its own task.
    pub async fn serve(self: Arc<Self>, listener: ViewerListener) {
        loop {
            let (stream, remote) = listener.next().await;
            let srv = Arc::clone(&self);
            tokio::spawn(async move {
                let socket = match ViewerSocket::handshake(stream, remote).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        warn!(remote = %remote, error = %e, "rejected connection");
                        return;
                    }
                };
                if let Err(e) = srv.handle_viewer(socket).await {
                    warn!(remote = %remote, error = %e, "viewer connection error");
                }
            });
        }
    }

    /// Tell every viewer the server is going away, then kill all sessions.
    pub fn shutdown(&self) {
        info!("broadcasting shutdown to connected viewers");
        let _ = self.shutdown_tx.send(());
        self.manager.destroy_all();
    }

    async fn handle_viewer(&self, mut socket: ViewerSocket) -> HubResult<()> {
        let remote = socket.remote_addr();
        info!(remote = %remote, "viewer connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        let lag_notify = Arc::new(Notify::new());
        let sink = Arc::new(ConnectionSink {
            tx: out_tx,
            pending_bytes: Arc::clone(&pending_bytes),
            max_pending_bytes: self.config.max_pending_bytes,
            lagged: AtomicBool::new(false),
            lag_notify: Arc::clone(&lag_notify),
        });
        // Dropped (and so detached) on every exit path below.
        let attachment = Attachment::new(Arc::clone(&self.manager), sink);

        let mut events_rx = self.events_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        socket
            .send(&ServerMessage::Hello {
                version: PROTOCOL_VERSION.to_string(),
            })
            .await?;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(remote = %remote, "shutdown signal received, notifying viewer");
                    let shutdown = ServerMessage::Shutdown { reason: "server shutdown".into() };
                    let _ = socket.send(&shutdown).await;
                    socket.close().await;
                    break;
                }

                _ = lag_notify.notified() => {
                    warn!(remote = %remote, "viewer fell too far behind, disconnecting");
                    let error = ServerMessage::Error {
                        code: error_code::LAGGED,
                        message: "output backlog exceeded; reconnect to replay".into(),
                    };
                    let _ = socket.send(&error).await;
                    socket.close().await;
                    break;
                }

                Some(message) = out_rx.recv() => {
                    if let ServerMessage::Output { data, .. } = &message {
                        pending_bytes.fetch_sub(data.len(), Ordering::AcqRel);
                    }
                    socket.send(&message).await?;
                }

                event = events_rx.recv() => {
                    match event {
                        Ok(message) => socket.send(&message).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(remote = %remote, skipped, "broadcast receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                received = socket.recv() => {
                    match received {
                        Ok(Some(messages)) => {
                            for message in messages {
                                if let Some(reply) = self.dispatch(message, &attachment).await {
                                    socket.send(&reply).await?;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(remote = %remote, "WebSocket closed by peer");
                            break;
                        }
                        Err(HubError::Transport(e)) => {
                            debug!(remote = %remote, error = %e, "WebSocket session ended");
                            break;
                        }
                        Err(e) => {
                            warn!(remote = %remote, error = %e, "undecodable frame, closing");
                            let error = ServerMessage::Error {
                                code: error_code::BAD_MESSAGE,
                                message: e.to_string(),
                            };
                            let _ = socket.send(&error).await;
                            socket.close().await;
                            break;
                        }
                    }
                }
            }
        }

        attachment.detach();
        info!(remote = %remote, "viewer disconnected");
        Ok(())
    }

    /// Apply one client message. Returns the direct reply, if any.
    async fn dispatch(
        &self,
        message: ClientMessage,
        attachment: &Attachment,
    ) -> Option<ServerMessage> {
        match message {
            ClientMessage::Attach {
                session_id,
                cols,
                rows,
            } => {
                info!(session_id = %session_id, ?cols, ?rows, "attach");
                attachment.attach(&session_id, cols, rows);
                None
            }
            ClientMessage::Detach => {
                attachment.detach();
                None
            }
            ClientMessage::Input { data } => {
                attachment.input(&data);
                None
            }
            ClientMessage::Resize { cols, rows } => {
                attachment.resize(cols, rows);
                None
            }
            ClientMessage::Spawn(request) => Some(self.spawn(request).await),
            ClientMessage::Kill { session_id } => {
                info!(session_id = %session_id, "kill requested");
                self.manager.kill(&session_id);
                None
            }
            ClientMessage::Remove { session_id } => {
                self.manager.remove(&session_id);
                None
            }
            ClientMessage::List => Some(ServerMessage::Sessions {
                sessions: self.manager.list_info().iter().map(summary).collect(),
            }),
            ClientMessage::Ping { id } => Some(ServerMessage::Pong { id }),
        }
    }

    async fn spawn(&self, request: SpawnRequest) -> ServerMessage {
        let session_id = request.session_id.clone();
        let config = self.spawn_config(request);

        // Opening the PTY and forking block.
        let manager = Arc::clone(&self.manager);
        let id = session_id.clone();
        let result = tokio::task::spawn_blocking(move || manager.spawn(&id, config))
            .await
            .unwrap_or_else(|e| Err(HubError::Other(format!("spawn task failed: {e}"))));

        match result {
            Ok(()) => ServerMessage::Spawned { session_id },
            Err(HubError::DuplicateSession(_)) => ServerMessage::Error {
                code: error_code::DUPLICATE_SESSION,
                message: format!("session already running: {session_id}"),
            },
            Err(e) => ServerMessage::SpawnFailed {
                session_id,
                reason: e.to_string(),
            },
        }
    }

    fn spawn_config(&self, request: SpawnRequest) -> SpawnConfig {
        SpawnConfig {
            cwd: request.cwd.map(PathBuf::from),
            command: request.command.or_else(|| self.config.shell.clone()),
            args: request.args,
            resume_token: request.resume_token,
            resume_flag: self.config.resume_flag.clone(),
            env: HashMap::new(),
            cols: request.cols.unwrap_or(self.config.default_cols),
            rows: request.rows.unwrap_or(self.config.default_rows),
        }
    }
}

fn summary(info: &SessionInfo) -> SessionSummary {
    SessionSummary {
        session_id: info.id.clone(),
        alive: info.alive,
        pid: info.pid,
        exit_code: info.exit_code,
        resume_token: info.resume_token.clone(),
        buffered_bytes: info.buffered_bytes as u64,
        listeners: u32::try_from(info.listeners).unwrap_or(u32::MAX),
        age_secs: info.age_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ResumeTokenScanner;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use termhub_core::{encode_frame, FrameDecoder};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerConfig::default()
        }
    }

    struct NullSink;

    impl ViewerSink for NullSink {
        fn send(&self, _: ViewerEvent) -> HubResult<()> {
            Ok(())
        }
    }

    fn sink_with_budget(
        max_pending_bytes: usize,
    ) -> (ConnectionSink, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = ConnectionSink {
            tx,
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            max_pending_bytes,
            lagged: AtomicBool::new(false),
            lag_notify: Arc::new(Notify::new()),
        };
        (sink, rx)
    }

    #[test]
    fn sink_refuses_everything_once_lagged() {
        let (sink, mut rx) = sink_with_budget(4);
        let output = |data: &'static [u8]| ViewerEvent::Output {
            session_id: "s".into(),
            data: Bytes::from_static(data),
        };

        assert!(sink.send(output(b"abc")).is_ok());
        assert!(sink.send(output(b"def")).is_err());
        // Small enough to fit, but the viewer already missed output.
        assert!(sink.send(output(b"g")).is_err());
        assert!(sink
            .send(ViewerEvent::ReplayComplete { session_id: "s".into() })
            .is_err());

        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Output { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_buffer_replays_within_send_budget() {
        let config = ServerConfig {
            buffer_capacity: 4096,
            max_pending_bytes: 4096,
            ..test_config()
        };
        let server = HubServer::new(config.clone());
        let process = server.manager().insert_without_pty("full");
        let mut scanner = ResumeTokenScanner::new();
        for _ in 0..100 {
            process.inject(&[b'x'; 100], &mut scanner);
        }
        assert_eq!(process.buffered_bytes(), 4000);

        let (sink, mut rx) = sink_with_budget(config.max_pending_bytes);
        let attachment = Attachment::new(Arc::clone(server.manager()), Arc::new(sink));
        attachment.attach("full", None, None);

        let mut replayed = 0;
        let mut completed = false;
        while let Ok(message) = rx.try_recv() {
            match message {
                ServerMessage::Output { data, .. } => replayed += data.len(),
                ServerMessage::ReplayComplete { .. } => completed = true,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(completed);
        assert_eq!(replayed, process.buffered_bytes());
    }

    #[tokio::test]
    async fn dispatch_control_messages() {
        let server = HubServer::new(test_config());
        let attachment = Attachment::new(Arc::clone(server.manager()), Arc::new(NullSink));
        server.manager().insert_without_pty("existing");

        assert_eq!(
            server.dispatch(ClientMessage::Ping { id: 9 }, &attachment).await,
            Some(ServerMessage::Pong { id: 9 })
        );

        let Some(ServerMessage::Sessions { sessions }) =
            server.dispatch(ClientMessage::List, &attachment).await
        else {
            panic!("expected a session listing");
        };
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "existing");
        assert!(sessions[0].alive);

        let duplicate = ClientMessage::Spawn(SpawnRequest {
            session_id: "existing".into(),
            cwd: None,
            command: Some("/bin/true".into()),
            args: Vec::new(),
            resume_token: None,
            cols: None,
            rows: None,
        });
        assert!(matches!(
            server.dispatch(duplicate, &attachment).await,
            Some(ServerMessage::Error { code: error_code::DUPLICATE_SESSION, .. })
        ));

        let bad_cwd = ClientMessage::Spawn(SpawnRequest {
            session_id: "nowhere".into(),
            cwd: Some("/definitely/not/here".into()),
            command: Some("/bin/true".into()),
            args: Vec::new(),
            resume_token: None,
            cols: None,
            rows: None,
        });
        assert!(matches!(
            server.dispatch(bad_cwd, &attachment).await,
            Some(ServerMessage::SpawnFailed { .. })
        ));

        assert_eq!(
            server.dispatch(
                ClientMessage::Attach {
                    session_id: "missing".into(),
                    cols: None,
                    rows: None,
                },
                &attachment,
            )
            .await,
            None
        );
        assert_eq!(attachment.attached_session(), None);
    }

    #[test]
    fn spawn_config_falls_back_to_configured_defaults() {
        let server = HubServer::new(ServerConfig {
            shell: Some("/bin/zsh".into()),
            default_cols: 132,
            resume_flag: "--continue".into(),
            ..test_config()
        });
        let config = server.spawn_config(SpawnRequest {
            session_id: "x".into(),
            cwd: Some("/tmp".into()),
            command: None,
            args: vec!["-l".into()],
            resume_token: Some("tok".into()),
            cols: None,
            rows: Some(50),
        });
        assert_eq!(config.argv(), vec!["/bin/zsh", "-l", "--continue", "tok"]);
        assert_eq!((config.cols, config.rows), (132, 50));
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
    }

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn send(client: &mut Client, message: &ClientMessage) {
        let frame = encode_frame(message).unwrap();
        client.send(Message::Binary(frame.into())).await.unwrap();
    }

    /// Read messages into `seen` until `done` holds for the whole history.
    async fn read_until(
        client: &mut Client,
        decoder: &mut FrameDecoder,
        seen: &mut Vec<ServerMessage>,
        done: impl Fn(&[ServerMessage]) -> bool,
    ) {
        let wait = async {
            while !done(seen.as_slice()) {
                match client.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let messages: Vec<ServerMessage> = decoder.feed(&data).unwrap();
                        seen.extend(messages);
                    }
                    Some(Ok(_)) => {}
                    other => panic!("connection ended early: {other:?}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("timed out waiting for server messages");
    }

    fn output_text(seen: &[ServerMessage]) -> String {
        let bytes: Vec<u8> = seen
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Output { data, .. } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_session_round_trip() {
        const TOKEN: &str = "0f0e0d0c-0b0a-4908-8706-050403020100";

        let server = Arc::new(HubServer::new(test_config()));
        let listener = server.listen().await.unwrap();
        let addr = listener.local_addr();
        tokio::spawn(Arc::clone(&server).serve(listener));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();

        read_until(&mut client, &mut decoder, &mut seen, |s| !s.is_empty()).await;
        assert_eq!(
            seen[0],
            ServerMessage::Hello {
                version: PROTOCOL_VERSION.into()
            }
        );

        send(
            &mut client,
            &ClientMessage::Spawn(SpawnRequest {
                session_id: "demo".into(),
                cwd: None,
                command: Some("/bin/sh".into()),
                args: vec![
                    "-c".into(),
                    format!("echo ready-1234; echo session {TOKEN}; sleep 30"),
                ],
                resume_token: None,
                cols: None,
                rows: None,
            }),
        )
        .await;
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| matches!(m, ServerMessage::Spawned { .. }))
        })
        .await;

        send(
            &mut client,
            &ClientMessage::Attach {
                session_id: "demo".into(),
                cols: Some(100),
                rows: Some(30),
            },
        )
        .await;
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| matches!(m, ServerMessage::ReplayComplete { .. }))
                && output_text(s).contains("ready-1234")
                && s.iter().any(|m| matches!(m, ServerMessage::ResumeToken { .. }))
        })
        .await;
        assert!(seen.contains(&ServerMessage::ResumeToken {
            session_id: "demo".into(),
            token: TOKEN.into(),
        }));
        assert_eq!(output_text(&seen).matches("ready-1234").count(), 1);

        send(&mut client, &ClientMessage::List).await;
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| matches!(m, ServerMessage::Sessions { .. }))
        })
        .await;
        let listing = seen.iter().find_map(|m| match m {
            ServerMessage::Sessions { sessions } => Some(sessions.clone()),
            _ => None,
        });
        let listing = listing.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].alive);
        assert_eq!(listing[0].listeners, 1);
        assert_eq!(listing[0].resume_token.as_deref(), Some(TOKEN));

        send(&mut client, &ClientMessage::Kill { session_id: "demo".into() }).await;
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| matches!(m, ServerMessage::Exited { .. }))
        })
        .await;
        assert!(!server.manager().is_alive("demo"));

        send(&mut client, &ClientMessage::Ping { id: 42 }).await;
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.contains(&ServerMessage::Pong { id: 42 })
        })
        .await;

        server.shutdown();
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| matches!(m, ServerMessage::Shutdown { .. }))
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_may_be_packed_or_split_across_messages() {
        let server = Arc::new(HubServer::new(test_config()));
        let listener = server.listen().await.unwrap();
        let addr = listener.local_addr();
        tokio::spawn(Arc::clone(&server).serve(listener));

        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let mut decoder = FrameDecoder::new();
        let mut seen = Vec::new();
        read_until(&mut client, &mut decoder, &mut seen, |s| !s.is_empty()).await;

        // Two frames in one message.
        let mut packed = encode_frame(&ClientMessage::Ping { id: 1 }).unwrap();
        packed.extend(encode_frame(&ClientMessage::List).unwrap());
        client.send(Message::Binary(packed.into())).await.unwrap();
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.contains(&ServerMessage::Pong { id: 1 })
                && s.iter().any(|m| matches!(m, ServerMessage::Sessions { .. }))
        })
        .await;

        // One frame over two messages.
        let split = encode_frame(&ClientMessage::Ping { id: 2 }).unwrap();
        let (head, tail) = split.split_at(3);
        client.send(Message::Binary(head.to_vec().into())).await.unwrap();
        client.send(Message::Binary(tail.to_vec().into())).await.unwrap();
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.contains(&ServerMessage::Pong { id: 2 })
        })
        .await;

        // Bad input is answered, not silently dropped.
        client
            .send(Message::Binary(vec![0xff, 0xff, 0xff, 0xff].into()))
            .await
            .unwrap();
        read_until(&mut client, &mut decoder, &mut seen, |s| {
            s.iter().any(|m| {
                matches!(m, ServerMessage::Error { code: error_code::BAD_MESSAGE, .. })
            })
        })
        .await;
    }
}
