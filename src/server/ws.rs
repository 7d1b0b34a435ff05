use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::pty::{ShellOptions, TerminalEvent, TerminalSession};
use crate::server::context::AppContext;
use crate::server::file_store::FileStore;
use crate::server::hub::{BroadcastHub, ClientId, SharedHub};
use crate::server::protocol::ClientEvent;
use crate::server::rest;
use crate::server::watcher::{DirectoryWatcher, WatchError, WatchOptions};

/// Buffered shell output chunks between the reader thread and the relay
pub const TERMINAL_CHANNEL_CAPACITY: usize = 256;
/// Buffered change events between the watcher thread and the relay
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Create the workspace root if needed and return its canonical form
pub fn prepare_workspace(root: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(root)?;
    root.canonicalize()
}

/// The long-lived parts of a running server: hub, watcher, relay task
pub struct Runtime {
    ctx: AppContext,
    watcher: DirectoryWatcher,
    relay: JoinHandle<()>,
}

impl Runtime {
    /// Wire the hub to the terminal and a fresh watcher on `root`.
    /// `root` must come from [`prepare_workspace`].
    pub fn start(
        root: PathBuf,
        terminal: TerminalSession,
        terminal_rx: mpsc::Receiver<TerminalEvent>,
        config: &ServerConfig,
    ) -> Result<Self, WatchError> {
        let (watch_tx, watch_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let watcher =
            DirectoryWatcher::start(root.clone(), WatchOptions::from(&config.watch), watch_tx)?;

        let hub: SharedHub = Arc::new(BroadcastHub::new(
            FileStore::new(root),
            Arc::new(terminal),
            config.hub.client_queue,
        ));
        let relay = hub.spawn_relay(watch_rx, terminal_rx);

        Ok(Self {
            ctx: AppContext::new(hub),
            watcher,
            relay,
        })
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn hub(&self) -> &SharedHub {
        &self.ctx.hub
    }

    pub fn root(&self) -> &Path {
        self.watcher.root()
    }

    pub fn router(&self) -> Router {
        router(self.ctx.clone())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        info!("Shutting down workspace runtime");
        self.relay.abort();
        self.ctx.hub.terminal().kill();
    }
}

/// REST routes and the realtime endpoint, with permissive CORS
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/files", get(rest::get_tree).delete(rest::delete_file))
        .route("/files/content", get(rest::get_content))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Run the server until Ctrl-C / SIGTERM
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let root = prepare_workspace(&config.root)?;
    info!(root = %root.display(), "Workspace ready");

    let mut shell = ShellOptions::new(root.clone());
    shell.program = config.shell.clone();
    let (terminal_tx, terminal_rx) = mpsc::channel(TERMINAL_CHANNEL_CAPACITY);
    let terminal = TerminalSession::spawn(&shell, terminal_tx)?;

    let runtime = Runtime::start(root, terminal, terminal_rx, &config)?;

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{} (realtime on ws://{}/ws)", addr, addr);

    serve(listener, runtime.router(), shutdown_signal()).await?;

    drop(runtime);
    info!("Server stopped");
    Ok(())
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<AppContext>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx.hub))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, hub: SharedHub) {
    let mut client = hub.register().await;
    let client_id = client.id;
    info!(client_id, "New WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&hub, client_id, text.as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    dispatch(&hub, client_id, &data).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(client_id, "WebSocket connection closed by client");
                    break;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Handled automatically by axum
                }
                Some(Err(e)) => {
                    warn!(client_id, "WebSocket error: {}", e);
                    break;
                }
            },

            event = client.events.recv() => match event {
                Some(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(client_id, event = event.name(), "Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        debug!(client_id, "Failed to send event: {}", e);
                        break;
                    }
                }
                None => {
                    warn!(client_id, "Dropped by hub, closing connection");
                    break;
                }
            },
        }
    }

    hub.unregister(client_id).await;
    info!(client_id, "WebSocket connection handler finished");
}

/// Decode one inbound frame; unknown or malformed events are ignored
async fn dispatch(hub: &BroadcastHub, client_id: ClientId, data: &[u8]) {
    match ClientEvent::from_slice(data) {
        Ok(event) => hub.handle_client_event(client_id, event).await,
        Err(e) => debug!(client_id, "Ignoring client frame: {}", e),
    }
}
