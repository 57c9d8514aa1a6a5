//! Broker socket: one JSON request per length-delimited frame

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kw_broker::Broker;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Serve the broker on a Unix domain socket until `shutdown` resolves.
pub async fn serve(
    socket_path: &Path,
    broker: Arc<Broker>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    // Remove stale socket if it exists
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path).await?;
    }
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    restrict_to_owner(socket_path)?;
    info!(socket = %socket_path.display(), "broker listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let broker = broker.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, broker).await {
                            debug!("connection closed: {e:#}");
                        }
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    let _ = tokio::fs::remove_file(socket_path).await;
    Ok(())
}

async fn handle_connection(stream: UnixStream, broker: Arc<Broker>) -> Result<()> {
    let conn = Uuid::new_v4();
    debug!(%conn, "client connected");
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    while let Some(frame) = framed.next().await {
        let frame = frame.context("reading frame")?;
        let reply = broker.handle_frame(&frame).await;
        framed
            .send(Bytes::from(reply))
            .await
            .context("writing frame")?;
    }
    debug!(%conn, "client disconnected");
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("restricting {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kw_broker::{Consent, Response};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{oneshot, RwLock};

    async fn connect(path: &Path) -> Framed<UnixStream, LengthDelimitedCodec> {
        for _ in 0..100 {
            if let Ok(stream) = UnixStream::connect(path).await {
                return Framed::new(stream, LengthDelimitedCodec::new());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("socket never came up");
    }

    #[tokio::test]
    async fn test_frames_round_trip_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("run/broker.sock");
        let broker = Arc::new(Broker::new(
            Arc::new(RwLock::new(None)),
            Default::default(),
            Consent::unavailable(),
        ));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn({
            let socket = socket.clone();
            async move {
                serve(&socket, broker, async {
                    let _ = stop_rx.await;
                })
                .await
            }
        });

        let mut client = connect(&socket).await;
        let mode = std::fs::metadata(&socket).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(mode.permissions().mode() & 0o777, 0o600);
        }

        client.send(Bytes::from_static(b"not json")).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&reply).unwrap();
        assert!(!response.success);

        let request = br#"{"action":"test-associate","client_id":"x","nonce":"AAAA","message":"AAAA"}"#;
        client.send(Bytes::from_static(request)).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        let response: Response = serde_json::from_slice(&reply).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("no database"));

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("broker.sock");
        let broker = Arc::new(Broker::new(
            Arc::new(RwLock::new(None)),
            Default::default(),
            Consent::unavailable(),
        ));
        let path = socket.clone();
        tokio::spawn(async move { serve(&path, broker, std::future::pending()).await });

        let mut client = connect(&socket).await;
        let big = Bytes::from(vec![b'x'; MAX_FRAME_LEN + 1]);
        let _ = client.send(big).await;
        assert!(matches!(client.next().await, None | Some(Err(_))));
    }
}
