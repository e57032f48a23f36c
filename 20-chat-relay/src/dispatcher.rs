//! One session per accepted connection.
//!
//! A session reads frames off its socket, decodes them into requests and acts
//! on them: logging in against the [`AuthGateway`](crate::auth::AuthGateway),
//! answering `get`, handing chat messages to the [`Router`](crate::router::Router)
//! and finally deregistering on `exit` or disconnect. The same loop drains the
//! connection's mailbox, so the socket's write half has exactly one owner.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use futures_util::SinkExt;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::watch,
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::{FrameReader, FrameWriter, frame_reader, frame_writer, next_frame},
    envelope::{Envelope, Inbound, Request},
    error::FrameError,
    registry::{ConnectionHandle, Identity, Mailbox},
    relay::RelayState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (handle, mut mailbox) = ConnectionHandle::new(
        state.next_connection_id(),
        peer,
        state.config.outbound_queue,
    );
    let mut frames = frame_reader(reader, state.config.max_frame_len);

    info!(peer = %peer, connection = handle.id(), "client connected");

    let mut session = Session {
        state: &state,
        handle,
        identity: None,
        writer: frame_writer(writer),
    };
    let outcome = session.run(&mut frames, &mut mailbox, &mut stop).await;
    session.finish().await;

    outcome
}

struct Session<'a> {
    state: &'a RelayState,
    handle: ConnectionHandle,
    identity: Option<Identity>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl Session<'_> {
    async fn run(
        &mut self,
        frames: &mut FrameReader<OwnedReadHalf>,
        mailbox: &mut Mailbox,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let peer = self.handle.peer();

        loop {
            select! {
                frame = next_frame(frames) => match frame {
                    Ok(Some(frame)) => {
                        if self.handle_frame(&frame).await? == Flow::Exit {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!(peer = %peer, "connection closed by client");
                        break;
                    }
                    Err(FrameError::Protocol(err)) => {
                        warn!(peer = %peer, error = %err, "dropping unreadable frame");
                    }
                    Err(FrameError::ConnectionLost(err)) => {
                        info!(peer = %peer, error = %err, "connection lost");
                        break;
                    }
                },
                outbound = mailbox.frames.recv() => match outbound {
                    Some(frame) => self.writer.send(frame).await?,
                    None => break,
                },
                _ = mailbox.close.notified() => {
                    info!(peer = %peer, nickname = ?self.identity, "connection evicted by a newer login");
                    self.identity = None;
                    break;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        debug!(peer = %peer, "relay shutting down, closing session");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_frame(&mut self, frame: &str) -> Result<Flow> {
        let peer = self.handle.peer();
        let inbound = match Inbound::decode(frame) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(peer = %peer, error = %err, "dropping undecodable envelope");
                return Ok(Flow::Continue);
            }
        };

        match inbound.request {
            Request::Login { name, password } => self.login(name, password).await?,
            Request::Exit => {
                info!(peer = %peer, nickname = ?self.identity, "client requested exit");
                return Ok(Flow::Exit);
            }
            Request::Get => {
                if let Some(identity) = self.sender(inbound.source.as_deref()) {
                    self.send_online(&identity).await?;
                }
            }
            Request::Public { text } => {
                if let Some(identity) = self.sender(inbound.source.as_deref()) {
                    self.state.router.broadcast(&identity, &text).await;
                }
            }
            Request::Private { to, text } => {
                if let Some(identity) = self.sender(inbound.source.as_deref()) {
                    if let Err(err) = self.state.router.direct(&identity, &to, &text).await {
                        warn!(nickname = %identity, error = %err, "private message dropped");
                    }
                }
            }
        }

        Ok(Flow::Continue)
    }

    async fn login(&mut self, name: String, password: String) -> Result<()> {
        let peer = self.handle.peer();
        let gateway = Arc::clone(&self.state.gateway);
        let nickname = name.clone();
        let verdict =
            tokio::task::spawn_blocking(move || gateway.verify(&nickname, &password)).await;

        let status = match verdict {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                error!(peer = %peer, nickname = %name, error = %err, "account lookup failed");
                return Ok(());
            }
            Err(err) => {
                error!(peer = %peer, nickname = %name, error = ?err, "account lookup panicked");
                return Ok(());
            }
        };

        if status.admits() {
            self.bind(name).await;
        } else {
            info!(peer = %peer, nickname = %name, "login rejected: bad password");
        }

        self.writer.send(status.code().to_string()).await?;
        Ok(())
    }

    async fn bind(&mut self, name: Identity) {
        let registry = &self.state.registry;
        let id = self.handle.id();

        if let Some(previous) = self.identity.take() {
            if previous != name {
                registry.remove_connection(&previous, id).await;
            }
        }

        if let Some(displaced) = registry.put(name.clone(), self.handle.clone()).await {
            if displaced.id() != id {
                info!(
                    nickname = %name,
                    displaced_peer = %displaced.peer(),
                    "nickname taken over, evicting previous connection"
                );
                displaced.close();
            }
        }

        info!(peer = %self.handle.peer(), nickname = %name, "client logged in");
        self.identity = Some(name);
    }

    // The identity requests are attributed to. Clients are trusted to be who
    // they logged in as, not who their envelope says they are.
    fn sender(&self, claimed: Option<&str>) -> Option<Identity> {
        let peer = self.handle.peer();
        let Some(identity) = self.identity.clone() else {
            warn!(peer = %peer, "request before login ignored");
            return None;
        };
        if let Some(claimed) = claimed {
            if claimed != identity {
                warn!(
                    peer = %peer,
                    nickname = %identity,
                    claimed,
                    "envelope source does not match login, using login"
                );
            }
        }
        Some(identity)
    }

    async fn send_online(&mut self, identity: &str) -> Result<()> {
        let others = self.state.registry.identities_except(identity).await;
        debug!(nickname = identity, online = others.len(), "sending online list");
        self.writer
            .send(Envelope::online(identity, &others).encode())
            .await?;
        Ok(())
    }

    async fn finish(mut self) {
        if let Some(identity) = self.identity.take() {
            if self
                .state
                .registry
                .remove_connection(&identity, self.handle.id())
                .await
            {
                info!(nickname = %identity, "client left");
            }
        }

        if let Err(err) = SinkExt::<String>::close(&mut self.writer).await {
            debug!(peer = %self.handle.peer(), error = ?err, "failed to shut down writer cleanly");
        }
        debug!(peer = %self.handle.peer(), "session finished");
    }
}
