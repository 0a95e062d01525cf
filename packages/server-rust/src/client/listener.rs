//! Local client endpoints.
//!
//! Two unix-stream sockets: the client endpoint (0660) for ordinary
//! applications and the admin endpoint (0600) for privileged tooling.
//! Every accepted stream gets a reader task (framing requests into the
//! core's input channel) and a writer task (draining the connection's
//! outbound queue).

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::codec::ClientCodec;
use super::connection::{ConnectionRegistry, EndpointKind, OutboundMessage};
use crate::core::ClientInput;

/// Where the endpoints live and how deep each reply queue is.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub client_path: PathBuf,
    pub admin_path: PathBuf,
    pub outbound_queue: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            client_path: PathBuf::from("/var/run/memberd_client"),
            admin_path: PathBuf::from("/var/run/memberd_admin"),
            outbound_queue: 64,
        }
    }
}

fn open_endpoint(path: &Path, mode: u32) -> io::Result<UnixListener> {
    // A stale socket from a previous run would block the bind.
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(listener)
}

/// Binds both endpoints and serves connections until shutdown.
///
/// # Errors
///
/// Propagates socket creation failures; accept errors are logged and the
/// listener keeps going.
pub async fn serve(
    config: EndpointConfig,
    connections: Arc<ConnectionRegistry>,
    input_tx: mpsc::Sender<ClientInput>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> io::Result<()> {
    let client = open_endpoint(&config.client_path, 0o660)?;
    let admin = open_endpoint(&config.admin_path, 0o600)?;
    info!(
        client = %config.client_path.display(),
        admin = %config.admin_path.display(),
        "client endpoints open"
    );

    loop {
        tokio::select! {
            accepted = client.accept() => match accepted {
                Ok((stream, _)) => spawn_connection(
                    stream,
                    EndpointKind::Client,
                    &connections,
                    &input_tx,
                    config.outbound_queue,
                ),
                Err(e) => warn!(error = %e, "client accept failed"),
            },
            accepted = admin.accept() => match accepted {
                Ok((stream, _)) => spawn_connection(
                    stream,
                    EndpointKind::Admin,
                    &connections,
                    &input_tx,
                    config.outbound_queue,
                ),
                Err(e) => warn!(error = %e, "admin accept failed"),
            },
            _ = shutdown_rx.changed() => break,
        }
    }

    let _ = std::fs::remove_file(&config.client_path);
    let _ = std::fs::remove_file(&config.admin_path);
    Ok(())
}

fn spawn_connection(
    stream: UnixStream,
    kind: EndpointKind,
    connections: &Arc<ConnectionRegistry>,
    input_tx: &mpsc::Sender<ClientInput>,
    queue: usize,
) {
    let (handle, mut outbound_rx) = connections.register(kind, queue);
    let conn_id = handle.id;
    debug!(conn = conn_id.0, ?kind, "client connected");

    let (mut sink, mut frames) = Framed::new(stream, ClientCodec).split();

    // Reader: frames in, requests to the core.
    let reader_tx = input_tx.clone();
    tokio::spawn(async move {
        while let Some(next) = frames.next().await {
            match next {
                Ok(frame) => {
                    if reader_tx
                        .send(ClientInput::Frame(conn_id, frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn = conn_id.0, error = %e, "client stream error");
                    break;
                }
            }
        }
        let _ = reader_tx.send(ClientInput::Closed(conn_id)).await;
    });

    // Writer: queued replies and events out.
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message {
                OutboundMessage::Frame(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                OutboundMessage::Close => break,
            }
        }
        let _ = sink.close().await;
    });
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};
    use memberd_core::client::{cmd, ClientHeader, CLIENT_HEADER_SIZE};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::client::codec::ClientFrame;

    fn test_config(dir: &tempfile::TempDir) -> EndpointConfig {
        EndpointConfig {
            client_path: dir.path().join("client"),
            admin_path: dir.path().join("admin"),
            outbound_queue: 8,
        }
    }

    fn request(command: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ClientHeader::new(command, 0).encode(&mut buf);
        buf.to_vec()
    }

    #[tokio::test]
    async fn frames_flow_from_socket_to_core() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let connections = Arc::new(ConnectionRegistry::new());
        let (input_tx, mut input_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(serve(
            config.clone(),
            Arc::clone(&connections),
            input_tx,
            shutdown_rx,
        ));

        // Give the listener a beat to bind.
        tokio::task::yield_now().await;
        let mut stream = UnixStream::connect(&config.client_path).await.unwrap();
        stream.write_all(&request(cmd::IS_QUORATE)).await.unwrap();

        let input = tokio::time::timeout(std::time::Duration::from_secs(5), input_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match input {
            ClientInput::Frame(conn_id, ClientFrame { header, .. }) => {
                assert_eq!(header.command, cmd::IS_QUORATE);
                assert!(connections.get(conn_id).is_some());
                assert_eq!(
                    connections.get(conn_id).unwrap().kind,
                    EndpointKind::Client
                );
            }
            other => panic!("unexpected input: {other:?}"),
        }

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn admin_endpoint_marks_connections_privileged() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let connections = Arc::new(ConnectionRegistry::new());
        let (input_tx, mut input_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _server = tokio::spawn(serve(
            config.clone(),
            Arc::clone(&connections),
            input_tx,
            shutdown_rx,
        ));

        tokio::task::yield_now().await;
        let mut stream = UnixStream::connect(&config.admin_path).await.unwrap();
        stream.write_all(&request(cmd::IS_ACTIVE)).await.unwrap();

        let input = tokio::time::timeout(std::time::Duration::from_secs(5), input_rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let ClientInput::Frame(conn_id, _) = input {
            assert_eq!(connections.get(conn_id).unwrap().kind, EndpointKind::Admin);
        } else {
            panic!("expected a frame");
        }
    }

    #[tokio::test]
    async fn outbound_queue_reaches_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let connections = Arc::new(ConnectionRegistry::new());
        let (input_tx, mut input_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _server = tokio::spawn(serve(
            config.clone(),
            Arc::clone(&connections),
            input_tx,
            shutdown_rx,
        ));

        tokio::task::yield_now().await;
        let mut stream = UnixStream::connect(&config.client_path).await.unwrap();
        stream.write_all(&request(cmd::IS_QUORATE)).await.unwrap();

        let conn_id = match tokio::time::timeout(
            std::time::Duration::from_secs(5),
            input_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap()
        {
            ClientInput::Frame(id, _) => id,
            other => panic!("unexpected input: {other:?}"),
        };

        let reply = memberd_core::client::encode_status_reply(cmd::IS_QUORATE, 1).freeze();
        assert!(connections.get(conn_id).unwrap().try_send(reply));

        let mut raw = vec![0u8; CLIENT_HEADER_SIZE + 4];
        stream.read_exact(&mut raw).await.unwrap();
        let mut buf = &raw[..];
        let header = ClientHeader::decode(&mut buf).unwrap();
        assert_eq!(header.command & 0xFFFF, cmd::IS_QUORATE);
        assert_eq!(buf.get_i32_le(), 1);
    }

    #[tokio::test]
    async fn disconnect_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let connections = Arc::new(ConnectionRegistry::new());
        let (input_tx, mut input_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _server = tokio::spawn(serve(
            config.clone(),
            Arc::clone(&connections),
            input_tx,
            shutdown_rx,
        ));

        tokio::task::yield_now().await;
        let mut stream = UnixStream::connect(&config.client_path).await.unwrap();
        stream.write_all(&request(cmd::IS_QUORATE)).await.unwrap();

        // Consume the frame, then drop the stream.
        let _ = input_rx.recv().await.unwrap();
        drop(stream);

        let input = tokio::time::timeout(std::time::Duration::from_secs(5), input_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(input, ClientInput::Closed(_)));
    }
}
