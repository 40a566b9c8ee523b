use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use super::rpc::{self, EngineMessage, MessagePayload};
use super::wire::EngineCodec;
use super::{Engine, EngineError, PortConfig, PortId, PortStats, StreamConfig, StreamId, StreamStats};

/// A client for a remote packet-generation engine.
pub struct DroneClient {
    framed: Framed<TcpStream, EngineCodec>,
    request_counter: u64,
}

impl DroneClient {
    /// Connect to an engine at `addr` and perform the Hello exchange.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, EngineError> {
        let tcp_stream = TcpStream::connect(addr).await?;
        if let Ok(peer) = tcp_stream.peer_addr() {
            info!(address = %peer, "connected to engine");
        }
        tcp_stream.set_nodelay(true)?;
        let mut framed = Framed::new(tcp_stream, EngineCodec::new());

        let hello = EngineMessage {
            request_id: "init-0".to_string(),
            payload: MessagePayload::Hello {
                version: rpc::PROTOCOL_VERSION.to_string(),
            },
        };
        framed.send(hello).await?;

        let response = framed.next().await.ok_or(EngineError::Closed)??;
        match response.payload {
            MessagePayload::ServerHello { version, port_count } => {
                info!(server_version = %version, port_count, "engine handshake complete");
            }
            MessagePayload::Error(e) => {
                return Err(EngineError::Remote {
                    code: e.code,
                    message: e.message,
                })
            }
            other => {
                return Err(EngineError::UnexpectedResponse {
                    expected: "server_hello",
                    got: other.kind().to_string(),
                })
            }
        }

        Ok(Self {
            framed,
            request_counter: 1,
        })
    }

    fn next_id(&mut self) -> String {
        let id = format!("req-{}", self.request_counter);
        self.request_counter += 1;
        id
    }

    /// Send one request and wait for the response carrying its id.
    async fn request(&mut self, payload: MessagePayload) -> Result<MessagePayload, EngineError> {
        let request_id = self.next_id();
        debug!(request_id = %request_id, kind = payload.kind(), "engine request");
        self.framed
            .send(EngineMessage {
                request_id: request_id.clone(),
                payload,
            })
            .await?;

        loop {
            let frame = self.framed.next().await.ok_or(EngineError::Closed)??;
            if frame.request_id == request_id {
                return match frame.payload {
                    MessagePayload::Error(e) => Err(EngineError::Remote {
                        code: e.code,
                        message: e.message,
                    }),
                    other => Ok(other),
                };
            }
            debug!("ignoring message with id {} (waiting for {})", frame.request_id, request_id);
        }
    }

    async fn request_ok(&mut self, payload: MessagePayload) -> Result<(), EngineError> {
        match self.request(payload).await? {
            MessagePayload::Ok => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }
}

fn unexpected(expected: &'static str, got: &MessagePayload) -> EngineError {
    EngineError::UnexpectedResponse {
        expected,
        got: got.kind().to_string(),
    }
}

#[async_trait::async_trait]
impl Engine for DroneClient {
    async fn port_configs(&mut self) -> Result<Vec<PortConfig>, EngineError> {
        match self.request(MessagePayload::GetPortConfig).await? {
            MessagePayload::PortConfigs { ports } => Ok(ports),
            other => Err(unexpected("port_configs", &other)),
        }
    }

    async fn set_stream_tracking(&mut self, port: PortId, enabled: bool) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::SetStreamTracking { port, enabled })
            .await
    }

    async fn add_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::AddStreams {
            port,
            ids: ids.to_vec(),
        })
        .await
    }

    async fn delete_streams(&mut self, port: PortId, ids: &[StreamId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::DeleteStreams {
            port,
            ids: ids.to_vec(),
        })
        .await
    }

    async fn modify_streams(&mut self, port: PortId, streams: &[StreamConfig]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::ModifyStreams {
            port,
            streams: streams.to_vec(),
        })
        .await
    }

    async fn start_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::StartCapture {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn stop_capture(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::StopCapture {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn start_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::StartTransmit {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn stop_transmit(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::StopTransmit {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn clear_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::ClearStats {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn clear_stream_stats(&mut self, ports: &[PortId]) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::ClearStreamStats {
            ports: ports.to_vec(),
        })
        .await
    }

    async fn port_stats(&mut self, ports: &[PortId]) -> Result<Vec<PortStats>, EngineError> {
        match self
            .request(MessagePayload::GetStats {
                ports: ports.to_vec(),
            })
            .await?
        {
            MessagePayload::Stats { stats } => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    async fn stream_stats(&mut self, ports: &[PortId]) -> Result<Vec<StreamStats>, EngineError> {
        match self
            .request(MessagePayload::GetStreamStats {
                ports: ports.to_vec(),
            })
            .await?
        {
            MessagePayload::StreamStats { stats } => Ok(stats),
            other => Err(unexpected("stream_stats", &other)),
        }
    }

    async fn capture_buffer(&mut self, port: PortId) -> Result<Vec<u8>, EngineError> {
        match self.request(MessagePayload::GetCaptureBuffer { port }).await? {
            MessagePayload::CaptureBuffer { data } => Ok(data),
            other => Err(unexpected("capture_buffer", &other)),
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.request_ok(MessagePayload::Bye).await?;
        self.framed.close().await?;
        info!("engine connection closed");
        Ok(())
    }
}
