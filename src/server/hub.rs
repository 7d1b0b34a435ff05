//! Fan-out / fan-in router between realtime clients, the workspace and the
//! shared terminal
//!
//! Outbound: every registered client has its own FIFO queue; events are
//! pushed to all queues in the order the relay receives them.
//! Inbound: file edits go to the file store, keystrokes to the terminal. A
//! client's own edit reaches it again only through the watcher.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pty::{TerminalEvent, TerminalSession};
use crate::server::file_store::FileStore;
use crate::server::protocol::{ClientEvent, ServerEvent};
use crate::server::watcher::ChangeEvent;

pub type ClientId = u64;

pub type SharedHub = Arc<BroadcastHub>;

/// A registered connection's end of the hub
pub struct ClientHandle {
    pub id: ClientId,
    /// Yields `None` once the hub dropped the client
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct BroadcastHub {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<ServerEvent>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    store: FileStore,
    terminal: Arc<TerminalSession>,
}

impl BroadcastHub {
    pub fn new(store: FileStore, terminal: Arc<TerminalSession>, queue_capacity: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            store,
            terminal,
        }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn terminal(&self) -> &Arc<TerminalSession> {
        &self.terminal
    }

    /// Add a connection. Its first event is always `file:refresh`.
    pub async fn register(&self) -> ClientHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        // Fresh queue with capacity >= 1, cannot be full.
        let _ = tx.try_send(ServerEvent::FileRefresh);

        let mut clients = self.clients.write().await;
        clients.insert(id, tx);
        info!(client_id = id, clients = clients.len(), "Client registered");

        ClientHandle { id, events: rx }
    }

    pub async fn unregister(&self, id: ClientId) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(&id).is_some();
        if removed {
            info!(client_id = id, clients = clients.len(), "Client unregistered");
        }
        removed
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Queue `event` for every registered client without waiting on any of
    /// them. A client whose queue is full is dropped rather than skipped, so
    /// nobody silently misses a frame.
    pub async fn broadcast(&self, event: ServerEvent) {
        let mut dropped = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, tx) in clients.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(client_id = id, event = event.name(), "Client lagging, disconnecting");
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(*id);
                    }
                }
            }
        }

        if !dropped.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dropped {
                clients.remove(&id);
            }
        }
    }

    /// Route an inbound client event. Failures are logged, never answered.
    pub async fn handle_client_event(&self, client_id: ClientId, event: ClientEvent) {
        match event {
            ClientEvent::FileChange { path, content } => {
                match self.store.write(&path, &content).await {
                    Ok(size) => {
                        debug!(client_id, path = %path, size, "File updated");
                    }
                    Err(e) => {
                        warn!(client_id, path = %path, error = %e, "Dropping file change");
                    }
                }
            }
            ClientEvent::TerminalWrite(data) => {
                debug!(client_id, bytes = data.len(), "Terminal input");
                if let Err(e) = self.terminal.write(Bytes::from(data)) {
                    debug!(client_id, error = %e, "Dropping terminal input");
                }
            }
        }
    }

    /// Forward watcher and terminal events to all clients until both sources
    /// are closed. Terminal output stops for good once the shell exits.
    pub async fn relay(
        self: Arc<Self>,
        mut changes: mpsc::Receiver<ChangeEvent>,
        mut terminal: mpsc::Receiver<TerminalEvent>,
    ) {
        let mut terminal_open = true;
        loop {
            tokio::select! {
                Some(change) = changes.recv() => {
                    self.broadcast(change.into()).await;
                }
                event = terminal.recv(), if terminal_open => match event {
                    Some(TerminalEvent::Output(frame)) => {
                        self.broadcast(ServerEvent::terminal_data(&frame)).await;
                    }
                    Some(TerminalEvent::Exited { reason }) => {
                        error!(
                            session_id = %self.terminal.session_id(),
                            reason = %reason,
                            exit_code = ?self.terminal.exit_code(),
                            "Shell session ended, terminal relay stopped"
                        );
                        terminal_open = false;
                    }
                    None => {
                        terminal_open = false;
                    }
                },
                else => break,
            }
        }
        debug!("Hub relay finished");
    }

    pub fn spawn_relay(
        self: &Arc<Self>,
        changes: mpsc::Receiver<ChangeEvent>,
        terminal: mpsc::Receiver<TerminalEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.clone().relay(changes, terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::watcher::ChangeKind;
    use std::io::{self, Read, Write};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Shell stand-in: output blocks until the test drops `_hold`
    struct IdleOutput(std::sync::mpsc::Receiver<()>);

    impl Read for IdleOutput {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[derive(Clone, Default)]
    struct CapturedInput(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedInput {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _temp: TempDir,
        _hold: std::sync::mpsc::Sender<()>,
        hub: SharedHub,
        input: CapturedInput,
    }

    fn fixture(queue_capacity: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap().join("user");
        std::fs::create_dir(&root).unwrap();
        let (hold, idle) = std::sync::mpsc::channel();
        let input = CapturedInput::default();
        let (sink, _events) = mpsc::channel(16);
        let terminal =
            TerminalSession::from_io(Box::new(IdleOutput(idle)), Box::new(input.clone()), sink);
        let hub = Arc::new(BroadcastHub::new(
            FileStore::new(root),
            Arc::new(terminal),
            queue_capacity,
        ));
        Fixture {
            _temp: temp,
            _hold: hold,
            hub,
            input,
        }
    }

    async fn recv(handle: &mut ClientHandle) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
            .await
            .expect("timed out")
            .expect("client dropped")
    }

    #[tokio::test]
    async fn test_register_sends_refresh_without_backlog() {
        let f = fixture(16);
        let mut first = f.hub.register().await;
        assert_eq!(recv(&mut first).await, ServerEvent::FileRefresh);

        f.hub.broadcast(ServerEvent::FileAdded("a.txt".into())).await;
        assert_eq!(recv(&mut first).await, ServerEvent::FileAdded("a.txt".into()));

        let mut second = f.hub.register().await;
        assert_eq!(recv(&mut second).await, ServerEvent::FileRefresh);
        assert!(second.events.try_recv().is_err());
        assert_eq!(f.hub.client_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_clients_only() {
        let f = fixture(16);
        let mut a = f.hub.register().await;
        let mut b = f.hub.register().await;
        recv(&mut a).await;
        recv(&mut b).await;

        assert!(f.hub.unregister(b.id).await);
        assert!(!f.hub.unregister(b.id).await);
        assert_eq!(f.hub.client_count().await, 1);

        f.hub.broadcast(ServerEvent::FileChanged("x".into())).await;
        assert_eq!(recv(&mut a).await, ServerEvent::FileChanged("x".into()));
        // Unregistered: sender gone, queue drained.
        assert!(b.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_client_is_dropped() {
        let f = fixture(2);
        let mut slow = f.hub.register().await;
        let mut fast = f.hub.register().await;
        recv(&mut fast).await;

        // slow still holds the refresh; the second event overflows it.
        f.hub.broadcast(ServerEvent::FileAdded("1".into())).await;
        f.hub.broadcast(ServerEvent::FileAdded("2".into())).await;

        assert_eq!(f.hub.client_count().await, 1);
        assert_eq!(recv(&mut fast).await, ServerEvent::FileAdded("1".into()));
        assert_eq!(recv(&mut fast).await, ServerEvent::FileAdded("2".into()));

        assert_eq!(recv(&mut slow).await, ServerEvent::FileRefresh);
        assert_eq!(recv(&mut slow).await, ServerEvent::FileAdded("1".into()));
        assert!(slow.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_file_change_writes_without_reply() {
        let f = fixture(16);
        let mut client = f.hub.register().await;
        recv(&mut client).await;

        f.hub
            .handle_client_event(
                client.id,
                ClientEvent::FileChange {
                    path: "a.txt".into(),
                    content: "bye".into(),
                },
            )
            .await;
        assert_eq!(f.hub.store().read("a.txt").await.unwrap(), "bye");

        // Escape attempt: silently dropped, nothing written.
        f.hub
            .handle_client_event(
                client.id,
                ClientEvent::FileChange {
                    path: "../evil.txt".into(),
                    content: "x".into(),
                },
            )
            .await;
        assert!(!f.hub.store().root().parent().unwrap().join("evil.txt").exists());

        assert!(client.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_write_is_forwarded_in_order() {
        let f = fixture(16);
        for part in ["ec", "ho ", "hi\n"] {
            f.hub
                .handle_client_event(7, ClientEvent::TerminalWrite(part.into()))
                .await;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.input.0.lock().unwrap().len() < "echo hi\n".len() {
            assert!(tokio::time::Instant::now() < deadline, "input never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.input.0.lock().unwrap().as_slice(), b"echo hi\n");
    }

    #[tokio::test]
    async fn test_relay_fans_out_changes_and_output() {
        let f = fixture(64);
        let mut a = f.hub.register().await;
        let mut b = f.hub.register().await;
        recv(&mut a).await;
        recv(&mut b).await;

        let (change_tx, change_rx) = mpsc::channel(16);
        let (term_tx, term_rx) = mpsc::channel(16);
        let relay = f.hub.spawn_relay(change_rx, term_rx);

        change_tx
            .send(ChangeEvent {
                kind: ChangeKind::Changed,
                path: "a.txt".into(),
            })
            .await
            .unwrap();
        for client in [&mut a, &mut b] {
            assert_eq!(recv(client).await, ServerEvent::FileChanged("a.txt".into()));
        }

        for chunk in ["$ ", "ls\r\n", "a.txt\r\n"] {
            term_tx
                .send(TerminalEvent::Output(Bytes::from(chunk)))
                .await
                .unwrap();
        }
        for client in [&mut a, &mut b] {
            for chunk in ["$ ", "ls\r\n", "a.txt\r\n"] {
                assert_eq!(recv(client).await, ServerEvent::TerminalData(chunk.into()));
            }
        }

        // After the shell dies nothing more is relayed from the terminal.
        term_tx
            .send(TerminalEvent::Exited {
                reason: "test".into(),
            })
            .await
            .unwrap();
        let _ = term_tx
            .send(TerminalEvent::Output(Bytes::from_static(b"ghost")))
            .await;
        change_tx
            .send(ChangeEvent {
                kind: ChangeKind::Deleted,
                path: "a.txt".into(),
            })
            .await
            .unwrap();
        assert_eq!(recv(&mut a).await, ServerEvent::FileDeleted("a.txt".into()));

        drop(change_tx);
        drop(term_tx);
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay did not stop")
            .unwrap();
        assert!(a.events.try_recv().is_err());
    }
}
