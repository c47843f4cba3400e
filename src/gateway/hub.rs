//! WebSocket 中枢：接受连接，每个连接一个读循环 + 一个写任务

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::fsm::TransitionEngine;
use crate::gateway::connection::ConnectionHandler;
use crate::gateway::GatewayError;
use crate::orchestration::OrchestrationRegistry;
use crate::protocol::{codec, Dispatcher, ErrorPayload, Payload, ProtocolEnvelope};

pub struct Hub {
    config: GatewayConfig,
    agent_name: String,
    registry: Arc<OrchestrationRegistry>,
    engine: Arc<TransitionEngine>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(
        config: GatewayConfig,
        agent_name: impl Into<String>,
        registry: Arc<OrchestrationRegistry>,
        engine: Arc<TransitionEngine>,
    ) -> Self {
        Self {
            config,
            agent_name: agent_name.into(),
            registry,
            engine,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| {
                GatewayError::InvalidAddress(format!("{}: {}", self.config.bind_addr, e))
            })?;
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Gateway listening on ws://{}", addr);
        Ok(listener)
    }

    /// 接受连接直到 [`Hub::stop`]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream, addr).await {
                                tracing::error!("Connection error from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
        tracing::info!("Gateway stopped accepting connections");
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ProtocolEnvelope>();

        let client_id = format!("ws_{}_{}", addr, uuid::Uuid::new_v4());
        tracing::info!(client_id = %client_id, "New WebSocket connection from {}", addr);

        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let agent_name = self.agent_name.clone();
        let heartbeat_to = client_id.clone();
        let writer = tokio::spawn(async move {
            let mut timer = tokio::time::interval(heartbeat);
            timer.tick().await;
            loop {
                let envelope = tokio::select! {
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = timer.tick() => {
                        ProtocolEnvelope::heartbeat(agent_name.clone(), heartbeat_to.clone())
                    }
                };
                if ws_tx.send(WsMessage::Text(codec::encode(&envelope))).await.is_err() {
                    break;
                }
            }
        });

        let dispatcher = Dispatcher::new(ConnectionHandler::new(
            client_id.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            tx.clone(),
        ));

        while let Some(msg) = ws_rx.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(client_id = %client_id, "WebSocket receive error: {}", e);
                    break;
                }
            };

            match msg {
                WsMessage::Text(text) => {
                    let replies = match dispatcher.handle_json(&text).await {
                        Ok(replies) => replies,
                        Err(e) => vec![ProtocolEnvelope::new(
                            self.agent_name.clone(),
                            client_id.clone(),
                            Payload::Error(ErrorPayload::from(&e)),
                        )],
                    };
                    for reply in replies {
                        if tx.send(reply).is_err() {
                            break;
                        }
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        dispatcher.handler().unbind().await;
        drop(dispatcher);
        drop(tx);
        let _ = writer.await;

        tracing::info!(client_id = %client_id, "WebSocket connection closed: {}", addr);
        Ok(())
    }
}
