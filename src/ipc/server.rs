//! Unix socket IPC server: accept loop, per-client reader/writer tasks, and
//! best-effort broadcast fan-out.
//!
//! Lifecycle: `Uninitialized -> Initialized -> Running -> Stopped`, driven by
//! `initialize` / `start` / `stop` (the latter two idempotent). Each accepted
//! connection gets a monotonic client id, starts subscribed, and owns one
//! reader task and one writer task; all writes to a client go through its
//! writer so per-client ordering matches production order.
//!
//! Broadcasts serialize the message once, snapshot the send handles under a
//! short lock, then send without holding it. A send that would block is
//! dropped for that client and counted; connection teardown is driven by the
//! reader noticing EOF or a framing error.

use crate::defaults;
use crate::error::{Result, RtSttError};
use crate::ipc::framing;
use crate::ipc::protocol::{CommandData, Envelope, MessageType, TranscriptionResult};
use crate::metrics::Metrics;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Frames buffered per client before sends start dropping.
const CLIENT_SEND_BUFFER: usize = 64;

/// Handler for COMMAND messages.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Dispatch one action. `Ok` becomes an ACKNOWLEDGMENT, `Err` an ERROR.
    async fn handle(&self, action: &str, params: Value) -> Result<Value>;
}

struct ClientEntry {
    subscribed: bool,
    tx: mpsc::Sender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// IPC server handle. Cheap to clone via the inner Arc.
#[derive(Clone)]
pub struct IpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket_path: Mutex<Option<PathBuf>>,
    listener: Mutex<Option<std::os::unix::net::UnixListener>>,
    clients: Mutex<HashMap<u64, ClientEntry>>,
    next_client_id: AtomicU64,
    next_message_id: AtomicU64,
    client_count: Arc<AtomicUsize>,
    running: AtomicBool,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    status_events: mpsc::UnboundedSender<()>,
    metrics: Arc<Metrics>,
}

impl IpcServer {
    /// Create a server. Returns the handle and a receiver that fires on
    /// every subscription change (the coordinator broadcasts a fresh STATUS
    /// on it).
    pub fn new(
        metrics: Arc<Metrics>,
        client_count: Arc<AtomicUsize>,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                socket_path: Mutex::new(None),
                listener: Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                next_client_id: AtomicU64::new(1),
                next_message_id: AtomicU64::new(1),
                client_count,
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                accept_task: Mutex::new(None),
                status_events: status_tx,
                metrics,
            }),
        };
        (server, status_rx)
    }

    /// Bind the socket: unlink any stale file, bind with a listen backlog
    /// of 10, restrict the mode to the owning user.
    pub fn initialize(&self, socket_path: &Path) -> Result<()> {
        if self.inner.listener.lock().unwrap().is_some() {
            return Err(RtSttError::IpcSocket {
                message: "server already initialized".to_string(),
            });
        }

        if socket_path.exists() {
            std::fs::remove_file(socket_path).map_err(|e| RtSttError::IpcSocket {
                message: format!("failed to remove stale socket: {}", e),
            })?;
        }

        let listener = crate::sys::bind_unix_listener(socket_path, defaults::LISTEN_BACKLOG)
            .map_err(|e| RtSttError::IpcSocket {
                message: format!("failed to bind {}: {}", socket_path.display(), e),
            })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| RtSttError::IpcSocket {
                message: format!("failed to set nonblocking: {}", e),
            })?;

        // The socket is private to the owning user.
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).map_err(
            |e| RtSttError::IpcSocket {
                message: format!("failed to set socket permissions: {}", e),
            },
        )?;

        *self.inner.socket_path.lock().unwrap() = Some(socket_path.to_path_buf());
        *self.inner.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    /// Spawn the accept task. Idempotent; fails if `initialize` has not run.
    pub fn start(&self, handler: Arc<dyn CommandHandler>) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listener = self
            .inner
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RtSttError::IpcSocket {
                message: "server not initialized".to_string(),
            })?;
        let listener = UnixListener::from_std(listener).map_err(|e| RtSttError::IpcSocket {
            message: format!("failed to register listener: {}", e),
        })?;
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown_notify.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            ServerInner::register_client(&inner, stream, Arc::clone(&handler));
                        }
                        Err(e) => {
                            if inner.shutdown.load(Ordering::SeqCst) {
                                break;
                            }
                            // Transient accept failures are logged; accept
                            // is retried.
                            eprintln!("rt-stt: accept failed: {}", e);
                        }
                    }
                }
            }
        });
        *self.inner.accept_task.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Stop the server: wake the accept task, close every client, join all
    /// tasks, remove the socket file. Idempotent.
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();

        // The notify wakes tasks parked in select; abort is the backstop for
        // tasks that re-entered a blocking read between the flag and the
        // notification. Awaiting an aborted task still joins it.
        let accept_task = self.inner.accept_task.lock().unwrap().take();
        if let Some(task) = accept_task {
            task.abort();
            let _ = task.await;
        }

        let entries: Vec<ClientEntry> = {
            let mut clients = self.inner.clients.lock().unwrap();
            clients.drain().map(|(_, entry)| entry).collect()
        };
        self.inner.client_count.store(0, Ordering::SeqCst);
        for mut entry in entries {
            drop(entry.tx);
            if let Some(reader) = entry.reader.take() {
                reader.abort();
                let _ = reader.await;
            }
            if let Some(writer) = entry.writer.take() {
                writer.abort();
                let _ = writer.await;
            }
        }

        let path = self.inner.socket_path.lock().unwrap().take();
        if let Some(path) = path
            && path.exists()
        {
            let _ = std::fs::remove_file(&path);
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.inner.client_count.load(Ordering::SeqCst)
    }

    /// Broadcast a transcription to every subscribed client.
    ///
    /// Serializes once; failed or would-block sends drop the message for
    /// that client only. Never blocks, so the pipeline thread may call it
    /// directly.
    pub fn broadcast_transcription(&self, result: &TranscriptionResult) -> Result<()> {
        let data = serde_json::to_value(result).map_err(|e| RtSttError::IpcProtocol {
            message: format!("failed to serialize transcription: {}", e),
        })?;
        self.inner
            .broadcast(MessageType::Transcription, data, true)
    }

    /// Broadcast a STATUS message to every subscribed client.
    pub fn broadcast_status(&self, status: Value) -> Result<()> {
        self.inner.broadcast(MessageType::Status, status, true)
    }
}

impl ServerInner {
    fn register_client(inner: &Arc<Self>, stream: UnixStream, handler: Arc<dyn CommandHandler>) {
        let client_id = inner.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(CLIENT_SEND_BUFFER);

        // Insert before spawning the reader so responses to a client's very
        // first message always find its send handle.
        {
            let mut clients = inner.clients.lock().unwrap();
            clients.insert(
                client_id,
                ClientEntry {
                    subscribed: true,
                    tx,
                    reader: None,
                    writer: None,
                },
            );
            inner.client_count.store(clients.len(), Ordering::SeqCst);
        }

        let writer = tokio::spawn(Self::write_loop(rx, write_half));
        let reader = {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                inner.read_loop(client_id, read_half, handler).await;
                inner.remove_client(client_id);
            })
        };

        let mut clients = inner.clients.lock().unwrap();
        if let Some(entry) = clients.get_mut(&client_id) {
            entry.reader = Some(reader);
            entry.writer = Some(writer);
        }
    }

    async fn write_loop(mut rx: mpsc::Receiver<Vec<u8>>, mut write_half: OwnedWriteHalf) {
        while let Some(frame) = rx.recv().await {
            if framing::write_frame(&mut write_half, &frame).await.is_err() {
                break;
            }
        }
    }

    async fn read_loop(
        &self,
        client_id: u64,
        mut read_half: tokio::net::unix::OwnedReadHalf,
        handler: Arc<dyn CommandHandler>,
    ) {
        loop {
            let payload = tokio::select! {
                _ = self.shutdown_notify.notified() => break,
                frame = framing::read_frame(&mut read_half) => match frame {
                    Ok(payload) => payload,
                    // EOF, framing error, or oversized frame: this client is
                    // done; nobody else is affected.
                    Err(_) => break,
                }
            };

            // A JSON parse error is fatal for the connection.
            let Ok(envelope) = Envelope::from_slice(&payload) else {
                break;
            };

            match envelope.message_type() {
                Some(MessageType::Command) => {
                    self.dispatch_command(client_id, &envelope, &handler).await;
                }
                Some(MessageType::Subscribe) => {
                    self.set_subscribed(client_id, true, &envelope.id);
                }
                Some(MessageType::Unsubscribe) => {
                    self.set_subscribed(client_id, false, &envelope.id);
                }
                _ => {
                    self.send_error(client_id, &envelope.id, "unsupported message type");
                }
            }
        }
    }

    async fn dispatch_command(
        &self,
        client_id: u64,
        envelope: &Envelope,
        handler: &Arc<dyn CommandHandler>,
    ) {
        let command: CommandData = match serde_json::from_value(envelope.data.clone()) {
            Ok(command) => command,
            Err(e) => {
                self.send_error(client_id, &envelope.id, &format!("malformed command: {}", e));
                return;
            }
        };

        match handler.handle(&command.action, command.params).await {
            Ok(result) => {
                let ack = Envelope::new(
                    MessageType::Acknowledgment,
                    envelope.id.clone(),
                    json!({ "success": true, "result": result }),
                );
                self.send_envelope(client_id, &ack);
            }
            Err(e) => {
                self.send_error(client_id, &envelope.id, &e.to_string());
            }
        }
    }

    fn set_subscribed(&self, client_id: u64, subscribed: bool, id: &str) {
        {
            let mut clients = self.clients.lock().unwrap();
            if let Some(entry) = clients.get_mut(&client_id) {
                entry.subscribed = subscribed;
            }
        }
        let ack = Envelope::new(
            MessageType::Acknowledgment,
            id,
            json!({ "subscribed": subscribed }),
        );
        self.send_envelope(client_id, &ack);
        // The coordinator broadcasts a fresh STATUS on subscription changes.
        let _ = self.status_events.send(());
    }

    fn send_error(&self, client_id: u64, id: &str, message: &str) {
        let error = Envelope::new(MessageType::Error, id, json!({ "message": message }));
        self.send_envelope(client_id, &error);
    }

    fn send_envelope(&self, client_id: u64, envelope: &Envelope) {
        let Ok(bytes) = envelope.to_bytes() else {
            return;
        };
        let tx = {
            let clients = self.clients.lock().unwrap();
            match clients.get(&client_id) {
                Some(entry) => entry.tx.clone(),
                None => return,
            }
        };
        if tx.try_send(bytes).is_err() {
            self.metrics.incr_dropped_sends();
        }
    }

    fn broadcast(&self, msg_type: MessageType, data: Value, only_subscribed: bool) -> Result<()> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope::new(msg_type, id.to_string(), data);
        let bytes = envelope.to_bytes()?;

        // Snapshot send handles under the lock, send outside it.
        let targets: Vec<(u64, mpsc::Sender<Vec<u8>>)> = {
            let clients = self.clients.lock().unwrap();
            clients
                .iter()
                .filter(|(_, entry)| !only_subscribed || entry.subscribed)
                .map(|(&id, entry)| (id, entry.tx.clone()))
                .collect()
        };

        for (client_id, tx) in targets {
            if tx.try_send(bytes.clone()).is_err() {
                self.metrics.incr_dropped_sends();
                eprintln!(
                    "rt-stt: dropped message for client {} (send buffer full or gone)",
                    client_id
                );
            }
        }
        Ok(())
    }

    fn remove_client(&self, client_id: u64) {
        let mut clients = self.clients.lock().unwrap();
        clients.remove(&client_id);
        self.client_count.store(clients.len(), Ordering::SeqCst);
    }
}

/// Default socket path honoring the standard location.
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(defaults::SOCKET_PATH)
}
