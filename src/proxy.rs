use crate::codec::{self, HANDSHAKE_PACKET_ID, PING_PACKET_ID};
use crate::config::Config;
use crate::error::{CodecError, ProxyError};
use crate::handshake::{Handshake, NextState};
use crate::lifecycle::{BackendManager, Lifecycle, StartOutcome};
use crate::relay::{backend_io, dial_backend, relay};
use crate::status::StatusResponder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Encode a login-phase disconnect packet carrying `message` as a JSON string
pub fn kick_packet(message: &str) -> Result<Vec<u8>, CodecError> {
    let chat = serde_json::Value::String(message.to_string()).to_string();
    codec::encode_frame(HANDSHAKE_PACKET_ID, &codec::encode_string(&chat))
}

/// State shared by every connection handler
struct ProxyContext {
    config: Arc<Config>,
    manager: Arc<BackendManager>,
    status: StatusResponder,
}

/// Accepts game clients and dispatches them by handshake intent
pub struct ProxyServer {
    listen_addr: String,
    ctx: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        config: Arc<Config>,
        manager: Arc<BackendManager>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let status = StatusResponder::new(&config.status, &config.lifecycle);
        Self {
            listen_addr: config.server.listen.clone(),
            ctx: Arc::new(ProxyContext {
                config,
                manager,
                status,
            }),
            shutdown_rx,
        }
    }

    /// Bind the configured listen address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve clients from an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, backend = %self.ctx.manager.backend_addr(), "Proxy listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, ctx).await {
                                    debug!(addr = %addr, kind = e.kind().as_str(), error = %e, "Connection closed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Bound a client read by the handshake timeout
async fn client_read<T, F>(ctx: &ProxyContext, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, CodecError>>,
{
    tokio::time::timeout(ctx.config.server.handshake_timeout(), fut)
        .await
        .map_err(|_| ProxyError::HandshakeTimeout)?
        .map_err(ProxyError::from)
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ProxyContext>,
) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);
    // Bytes the client pipelines behind the handshake stay in this buffer
    // and reach the backend through the relay
    let mut client = BufReader::new(stream);

    let first = client_read(&ctx, codec::read_frame(&mut client)).await?;
    if first.legacy {
        return Err(ProxyError::LegacyPacket);
    }
    if first.id != HANDSHAKE_PACKET_ID {
        return Err(ProxyError::UnexpectedPacket {
            expected: HANDSHAKE_PACKET_ID,
            got: first.id,
        });
    }

    let handshake = Handshake::parse(&first.payload)?;
    debug!(
        addr = %addr,
        protocol = handshake.protocol_version,
        next_state = ?handshake.next_state,
        "Handshake received"
    );

    match handshake.next_state {
        NextState::Status => handle_status(&mut client, &handshake, &first.raw, &ctx).await,
        NextState::Login => handle_login(client, addr, &first.raw, &ctx).await,
    }
}

async fn handle_status(
    client: &mut BufReader<TcpStream>,
    handshake: &Handshake,
    handshake_raw: &[u8],
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let request = client_read(ctx, codec::read_frame(&mut *client)).await?;
    if request.is(HANDSHAKE_PACKET_ID) && request.payload.is_empty() {
        let response = ctx
            .status
            .respond(&ctx.manager, handshake, handshake_raw, &request.raw)
            .await?;
        client.write_all(&response).await?;
    } else {
        debug!(id = request.id, "Expected status request, not responding");
    }

    let ping = client_read(ctx, codec::read_frame(&mut *client)).await?;
    if ping.is(PING_PACKET_ID) {
        client.write_all(&ping.raw).await?;
    }
    client.flush().await?;
    Ok(())
}

async fn kick<W>(client: &mut W, addr: SocketAddr, message: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    debug!(addr = %addr, message, "Kicking client");
    client.write_all(&kick_packet(message)?).await?;
    client.flush().await?;
    Ok(())
}

async fn handle_login(
    mut client: BufReader<TcpStream>,
    addr: SocketAddr,
    handshake_raw: &[u8],
    ctx: &ProxyContext,
) -> Result<(), ProxyError> {
    let messages = &ctx.config.messages;
    let manager = &ctx.manager;

    if manager.is_degraded() {
        return kick(&mut client, addr, &messages.unavailable).await;
    }

    let mut lifecycle = manager.lifecycle();
    if lifecycle == Lifecycle::Offline {
        match manager.request_start() {
            StartOutcome::Started => {
                info!(addr = %addr, "Login triggered backend start");
                return kick(&mut client, addr, &messages.starting).await;
            }
            StartOutcome::AlreadyStarting => lifecycle = Lifecycle::Starting,
            StartOutcome::AlreadyOnline => lifecycle = Lifecycle::Online,
            StartOutcome::Unavailable => {
                return kick(&mut client, addr, &messages.unavailable).await;
            }
        }
    }

    if lifecycle == Lifecycle::Starting {
        if !ctx.config.login.wait_for_start {
            return kick(&mut client, addr, &messages.still_starting).await;
        }
        debug!(addr = %addr, "Holding login until the backend is online");
        if !manager
            .wait_until_online(ctx.config.login.start_wait_timeout())
            .await
        {
            let message = if manager.is_degraded() {
                &messages.unavailable
            } else {
                &messages.still_starting
            };
            return kick(&mut client, addr, message).await;
        }
    }

    let connect_timeout = ctx.config.lifecycle.connect_timeout();
    let mut backend = match dial_backend(manager.backend_addr(), connect_timeout).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Failed to reach backend for login");
            manager.mark_unreachable();
            kick(&mut client, addr, &messages.unreachable).await?;
            return Err(e);
        }
    };

    let io_timeout = ctx.config.lifecycle.io_timeout();
    let forwarded = backend_io(
        manager.backend_addr(),
        io_timeout,
        backend.write_all(handshake_raw),
    )
    .await;
    if let Err(e) = forwarded {
        warn!(addr = %addr, error = %e, "Failed to forward handshake to backend");
        manager.mark_unreachable();
        kick(&mut client, addr, &messages.unreachable).await?;
        return Err(e);
    }

    let Some(session) = manager.open_session() else {
        return kick(&mut client, addr, &messages.retry).await;
    };

    info!(addr = %addr, session_id = %session.id(), "Relaying login to backend");
    relay(&mut client, &mut backend, session).await?;
    Ok(())
}
