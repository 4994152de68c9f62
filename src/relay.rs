//! Backend dialing and the protocol-blind byte relay

use crate::error::ProxyError;
use crate::lifecycle::SessionGuard;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes copied in each direction during a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Connect to the backend, failing after `timeout`
pub async fn dial_backend(addr: &str, timeout: Duration) -> Result<TcpStream, ProxyError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProxyError::backend_unavailable(addr, e)),
        Err(_) => {
            return Err(ProxyError::backend_unavailable(
                addr,
                format!("connect timed out after {}ms", timeout.as_millis()),
            ))
        }
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Run backend I/O with `timeout`, mapping every failure to `BackendUnavailable`
pub async fn backend_io<T, E, F>(addr: &str, timeout: Duration, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ProxyError::backend_unavailable(addr, e)),
        Err(_) => Err(ProxyError::backend_unavailable(
            addr,
            format!("no response within {}ms", timeout.as_millis()),
        )),
    }
}

/// Copy bytes between client and backend until both directions finish.
///
/// When one side closes, the write half of the other is shut down and the
/// remaining direction drains. An error on either side ends both. The
/// session is released once, after everything has stopped.
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    session: SessionGuard,
) -> Result<RelayStats, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = session.id();
    let result = tokio::io::copy_bidirectional(client, backend).await;
    drop(session);

    match result {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                %session_id,
                client_to_backend,
                backend_to_client,
                "Session closed normally"
            );
            Ok(RelayStats {
                client_to_backend,
                backend_to_client,
            })
        }
        Err(e) => {
            debug!(%session_id, error = %e, "Session closed with error");
            Err(ProxyError::Relay(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NoopController;
    use crate::lifecycle::{BackendManager, Lifecycle};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn online_manager() -> Arc<BackendManager> {
        let manager = BackendManager::new(
            "127.0.0.1:1".to_string(),
            Arc::new(NoopController),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        manager.force_lifecycle(Lifecycle::Online);
        manager
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Grab a free port, then close it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial_backend(&addr, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_backend_io_times_out() {
        let stalled = std::future::pending::<Result<(), std::io::Error>>();
        let err = backend_io("127.0.0.1:25567", Duration::from_millis(50), stalled)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BackendUnavailable { .. }));
        assert_eq!(
            err.to_string(),
            "backend 127.0.0.1:25567 unavailable: no response within 50ms"
        );

        let refused = async { Err::<(), _>(std::io::Error::other("reset by peer")) };
        let err = backend_io("127.0.0.1:25567", Duration::from_secs(1), refused)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend 127.0.0.1:25567 unavailable: reset by peer");
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let manager = online_manager();
        let (mut client_side, mut proxy_client) = tokio::io::duplex(1024);
        let (mut proxy_backend, mut backend_side) = tokio::io::duplex(1024);

        let session = manager.open_session().unwrap();
        assert_eq!(manager.connected_sessions(), 1);

        let relay_task = tokio::spawn(async move {
            relay(&mut proxy_client, &mut proxy_backend, session).await
        });

        client_side.write_all(b"login start").await.unwrap();
        let mut buf = [0u8; 11];
        backend_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"login start");

        backend_side.write_all(b"world data").await.unwrap();
        let mut buf = [0u8; 10];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world data");

        drop(client_side);
        drop(backend_side);

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 11);
        assert_eq!(stats.backend_to_client, 10);
        assert_eq!(manager.connected_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_relay_releases_session_once() {
        let manager = online_manager();
        let other = manager.open_session().unwrap();

        let (_client_side, mut proxy_client) = tokio::io::duplex(1024);
        let (mut proxy_backend, _backend_side) = tokio::io::duplex(1024);
        let session = manager.open_session().unwrap();
        assert_eq!(manager.connected_sessions(), 2);

        // Neither side ever sends or closes
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            relay(&mut proxy_client, &mut proxy_backend, session),
        )
        .await;
        assert!(result.is_err());

        assert_eq!(manager.connected_sessions(), 1);
        drop(other);
        assert_eq!(manager.connected_sessions(), 0);
    }

    #[tokio::test]
    async fn test_relay_reports_io_error() {
        let manager = online_manager();
        let (client_side, mut proxy_client) = tokio::io::duplex(1024);
        let (mut proxy_backend, backend_side) = tokio::io::duplex(1024);
        drop(backend_side);

        // Client keeps sending into a backend that is gone
        let writer = tokio::spawn(async move {
            let mut client_side = client_side;
            let _ = client_side.write_all(&[7u8; 4096]).await;
            client_side
        });

        let session = manager.open_session().unwrap();
        let err = relay(&mut proxy_client, &mut proxy_backend, session)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Relay(_)));
        assert_eq!(manager.connected_sessions(), 0);
        drop(writer);
    }
}
