use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    sync::watch,
    task::{JoinError, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthGateway,
    config::RelayConfig,
    dispatcher,
    registry::{ConnectionId, ConnectionRegistry},
    router::Router,
};

/// Where the relay is in its life. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Accepting connections.
    Listening,
    /// Listener released; waiting for sessions to wind down.
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The idle timeout expired with nobody online.
    Idle,
    /// The operator (or the caller's shutdown future) asked to stop.
    Interrupted,
}

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
    lifecycle: watch::Sender<Lifecycle>,
}

/// Everything a session needs, shared between all of them.
pub(crate) struct RelayState {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) router: Router,
    pub(crate) gateway: Arc<dyn AuthGateway>,
    pub(crate) config: RelayConfig,
    next_id: AtomicU64,
}

impl RelayState {
    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Relay {
    /// Binds the listening socket. Must be called from within a Tokio runtime.
    pub fn bind(config: RelayConfig, gateway: Arc<dyn AuthGateway>) -> Result<Self> {
        let socket = match config.listen {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .context("failed to create listening socket")?;
        socket.set_reuseaddr(true)?;
        socket
            .bind(config.listen)
            .with_context(|| format!("failed to bind {}", config.listen))?;
        let listener = socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {}", config.listen))?;

        let registry = Arc::new(ConnectionRegistry::new());
        let state = Arc::new(RelayState {
            router: Router::new(Arc::clone(&registry)),
            registry,
            gateway,
            config,
            next_id: AtomicU64::new(1),
        });
        let (lifecycle, _) = watch::channel(Lifecycle::Listening);

        Ok(Self {
            listener,
            state,
            lifecycle,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The live registry, for inspection.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Accepts connections until the relay goes idle or `shutdown` resolves.
    ///
    /// After the listener is released every session is told to stop and given
    /// the configured drain timeout before it is aborted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownReason>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            state,
            lifecycle,
        } = self;
        tokio::pin!(shutdown);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        let mut idle = state.config.initial_idle_timeout;

        let reason = loop {
            select! {
                _ = &mut shutdown => {
                    info!("interrupt received, closing listener");
                    break ShutdownReason::Interrupted;
                }
                accepted = timeout(idle, listener.accept()) => match accepted {
                    Ok(Ok((stream, peer))) => {
                        spawn_session(&mut sessions, stream, peer, &state, &stop_rx);
                        reap_finished(&mut sessions);
                    }
                    Ok(Err(err)) => {
                        warn!(error = ?err, "failed to accept connection");
                        sleep(Duration::from_millis(10)).await;
                    }
                    Err(_) => {
                        if state.registry.is_empty().await {
                            info!(idle_secs = idle.as_secs_f64(), "no clients online, shutting down");
                            break ShutdownReason::Idle;
                        }
                        idle = state.config.idle_timeout;
                        let online = state.registry.len().await;
                        debug!(online, "idle timeout with clients online, still listening");
                    }
                },
            }
        };

        drop(listener);
        lifecycle.send_replace(Lifecycle::Draining);
        info!(?reason, sessions = sessions.len(), "listener closed");

        let _ = stop_tx.send(true);
        drain_sessions(&mut sessions, state.config.drain_timeout).await;

        lifecycle.send_replace(Lifecycle::Closed);
        info!("relay closed");
        Ok(reason)
    }

    pub async fn run_until_ctrl_c(self) -> Result<ShutdownReason> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn spawn_session(
    sessions: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<RelayState>,
    stop: &watch::Receiver<bool>,
) {
    let state = Arc::clone(state);
    let stop = stop.clone();
    sessions.spawn(async move {
        if let Err(err) = dispatcher::serve_connection(stream, peer, state, stop).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

fn reap_finished(sessions: &mut JoinSet<()>) {
    while let Some(result) = sessions.try_join_next() {
        log_join(result);
    }
}

async fn drain_sessions(sessions: &mut JoinSet<()>, grace: Duration) {
    if sessions.is_empty() {
        return;
    }

    let drained = timeout(grace, async {
        while let Some(result) = sessions.join_next().await {
            log_join(result);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = sessions.len(),
            "sessions did not stop in time, aborting"
        );
        sessions.shutdown().await;
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            warn!(error = ?err, "session task panicked");
        }
    }
}
