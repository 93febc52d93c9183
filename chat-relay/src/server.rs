use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::{ServerConfig, PASSWORD_HEADER},
    connection::WsConnection,
    hub::{self, HubHandle},
    session::Session,
};

/// Accepts websocket clients and hands each one to its own [`Session`].
pub struct Server {
    listener: TcpListener,
    state: AppState,
    hub_task: JoinHandle<()>,
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the listening socket and starts the hub. Failing to bind is the
    /// only fatal error the relay has.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let (hub, hub_task) = hub::spawn(config.hub.clone());

        Ok(Self {
            listener,
            state: AppState {
                hub,
                config: Arc::new(config),
            },
            hub_task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.state.hub.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            state,
            hub_task,
        } = self;
        let hub = state.hub.clone();

        // Stopping the hub closes every session, which lets the graceful
        // shutdown finish once the upgraded connections are gone.
        let signal = async move {
            shutdown.await;
            info!("relay shutting down");
            if hub.shutdown().await.is_err() {
                debug!("hub already stopped");
            }
        };

        let app = router(state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .context("relay server failed")?;

        if let Err(err) = hub_task.await {
            warn!(error = ?err, "hub task ended abnormally");
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_upgrade(
    upgrade: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let presented = headers
        .get(PASSWORD_HEADER)
        .and_then(|value| value.to_str().ok());
    if !state.config.admits(presented) {
        warn!(%peer, "rejecting connection with a bad password");
        return (StatusCode::UNAUTHORIZED, "invalid password").into_response();
    }

    upgrade
        .on_upgrade(move |socket| spawn_session(WsConnection::new(socket), peer, state))
        .into_response()
}

async fn spawn_session(connection: WsConnection, peer: SocketAddr, state: AppState) {
    let id = state.hub.next_session_id(Some(peer));
    debug!(session = %id, "connection accepted");

    let session = Session::new(id, state.hub.clone(), state.config.session.clone());
    if let Err(err) = session.run(connection).await {
        warn!(session = %id, error = %err, "client connection closed with error");
    }
}
