//! Serve an [`Engine`] over the control protocol.
//!
//! Each TCP connection runs on its own task; requests from all connections
//! are serialized through one shared engine.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::rpc::{self, EngineMessage, ErrorResponse, MessagePayload};
use super::wire::EngineCodec;
use super::{Engine, EngineError};

pub struct EngineServer<E> {
    engine: Arc<Mutex<E>>,
}

impl<E> EngineServer<E>
where
    E: Engine + Sync + 'static,
{
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self, listener: TcpListener) -> Result<(), EngineError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "engine server listening");
        }
        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "failed to accept TCP connection");
                    continue;
                }
            };
            debug!(%peer_addr, "accepted TCP connection");

            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(tcp_stream, peer_addr, engine).await {
                    warn!(%peer_addr, error = %e, "engine connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection<E>(
    tcp_stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<Mutex<E>>,
) -> Result<(), EngineError>
where
    E: Engine + Sync + 'static,
{
    tcp_stream.set_nodelay(true)?;
    let mut framed = Framed::new(tcp_stream, EngineCodec::new());

    // Hello must come first.
    let hello = framed.next().await.ok_or(EngineError::Closed)??;
    let reply = match hello.payload {
        MessagePayload::Hello { version } => {
            debug!(%peer_addr, client_version = %version, "hello received");
            let port_count = engine.lock().await.port_configs().await?.len();
            MessagePayload::ServerHello {
                version: rpc::PROTOCOL_VERSION.to_string(),
                port_count,
            }
        }
        other => {
            let reply = error_reply(&EngineError::UnexpectedResponse {
                expected: "hello",
                got: other.kind().to_string(),
            });
            framed
                .send(EngineMessage {
                    request_id: hello.request_id,
                    payload: reply,
                })
                .await?;
            return Ok(());
        }
    };
    framed
        .send(EngineMessage {
            request_id: hello.request_id,
            payload: reply,
        })
        .await?;

    while let Some(frame) = framed.next().await {
        let msg = frame?;
        let closing = matches!(msg.payload, MessagePayload::Bye);
        let payload = if closing {
            MessagePayload::Ok
        } else {
            let mut engine = engine.lock().await;
            dispatch(&mut *engine, msg.payload).await
        };
        send_reply(&mut framed, msg.request_id, payload).await?;
        if closing {
            info!(%peer_addr, "client said bye");
            break;
        }
    }
    Ok(())
}

/// Send a reply, substituting an error reply when it does not fit in a frame.
async fn send_reply(
    framed: &mut Framed<TcpStream, EngineCodec>,
    request_id: String,
    payload: MessagePayload,
) -> Result<(), EngineError> {
    let kind = payload.kind();
    match framed
        .send(EngineMessage {
            request_id: request_id.clone(),
            payload,
        })
        .await
    {
        Err(e @ EngineError::FrameTooLarge { .. }) => {
            warn!(kind, error = %e, "reply too large for one frame");
            framed
                .send(EngineMessage {
                    request_id,
                    payload: error_reply(&e),
                })
                .await
        }
        other => other,
    }
}

fn error_reply(e: &EngineError) -> MessagePayload {
    MessagePayload::Error(ErrorResponse {
        code: e.code(),
        message: e.to_string(),
    })
}

fn done(result: Result<(), EngineError>) -> MessagePayload {
    match result {
        Ok(()) => MessagePayload::Ok,
        Err(e) => error_reply(&e),
    }
}

/// Execute one request against `engine` and build its reply.
pub async fn dispatch<E: Engine + ?Sized>(engine: &mut E, payload: MessagePayload) -> MessagePayload {
    debug!(kind = payload.kind(), "dispatching engine request");
    match payload {
        MessagePayload::GetPortConfig => match engine.port_configs().await {
            Ok(ports) => MessagePayload::PortConfigs { ports },
            Err(e) => error_reply(&e),
        },
        MessagePayload::SetStreamTracking { port, enabled } => {
            done(engine.set_stream_tracking(port, enabled).await)
        }
        MessagePayload::AddStreams { port, ids } => done(engine.add_streams(port, &ids).await),
        MessagePayload::DeleteStreams { port, ids } => done(engine.delete_streams(port, &ids).await),
        MessagePayload::ModifyStreams { port, streams } => {
            done(engine.modify_streams(port, &streams).await)
        }
        MessagePayload::StartCapture { ports } => done(engine.start_capture(&ports).await),
        MessagePayload::StopCapture { ports } => done(engine.stop_capture(&ports).await),
        MessagePayload::StartTransmit { ports } => done(engine.start_transmit(&ports).await),
        MessagePayload::StopTransmit { ports } => done(engine.stop_transmit(&ports).await),
        MessagePayload::ClearStats { ports } => done(engine.clear_stats(&ports).await),
        MessagePayload::ClearStreamStats { ports } => done(engine.clear_stream_stats(&ports).await),
        MessagePayload::GetStats { ports } => match engine.port_stats(&ports).await {
            Ok(stats) => MessagePayload::Stats { stats },
            Err(e) => error_reply(&e),
        },
        MessagePayload::GetStreamStats { ports } => match engine.stream_stats(&ports).await {
            Ok(stats) => MessagePayload::StreamStats { stats },
            Err(e) => error_reply(&e),
        },
        MessagePayload::GetCaptureBuffer { port } => match engine.capture_buffer(port).await {
            Ok(data) => MessagePayload::CaptureBuffer { data },
            Err(e) => error_reply(&e),
        },
        other => error_reply(&EngineError::UnexpectedResponse {
            expected: "request",
            got: other.kind().to_string(),
        }),
    }
}
