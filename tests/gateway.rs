//! 网关连接处理集成测试（不经过 socket，直接驱动分发器）

#![cfg(feature = "gateway")]

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use agentflow::fsm::{
        DefinitionBuilder, MemoryDefinitionStore, MemorySessionStore, RecordingSideEffects,
        TransitionEngine,
    };
    use agentflow::gateway::ConnectionHandler;
    use agentflow::orchestration::{rule_based_actors, OrchestrationRegistry, OrchestratorOptions};
    use agentflow::protocol::{
        ChunkPayload, CommandPayload, Dispatcher, HandshakePayload, HeartbeatPayload,
        MessagePayload, MessageRole, Payload, ProtocolEnvelope, PROTOCOL_VERSION,
    };

    struct Client {
        dispatcher: Dispatcher<ConnectionHandler>,
        outbound: mpsc::UnboundedReceiver<ProtocolEnvelope>,
    }

    impl Client {
        async fn send(&self, payload: Payload) -> Vec<ProtocolEnvelope> {
            self.dispatcher
                .handle(ProtocolEnvelope::new("client-1", "agentflow", payload))
                .await
                .unwrap()
        }

        async fn next_outbound(&mut self) -> ProtocolEnvelope {
            tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for outbound envelope")
                .expect("outbound closed")
        }
    }

    async fn client() -> Client {
        let definition = DefinitionBuilder::new("task")
            .id("fsm_task")
            .initial("idle")
            .terminal("done")
            .transition("idle", "start", "working")
            .transition("working", "complete", "done")
            .build()
            .unwrap();
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(
                MemoryDefinitionStore::with_definitions([definition])
                    .await
                    .unwrap(),
            ),
            Arc::new(RecordingSideEffects::new()),
        ));
        let registry = Arc::new(OrchestrationRegistry::new(
            rule_based_actors(),
            OrchestratorOptions::default(),
            Duration::from_secs(60),
            8,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        Client {
            dispatcher: Dispatcher::new(ConnectionHandler::new("client-1", registry, engine, tx)),
            outbound: rx,
        }
    }

    fn handshake(conversation_id: &str) -> Payload {
        Payload::Handshake(HandshakePayload {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: Vec::new(),
            conversation_id: Some(conversation_id.into()),
        })
    }

    fn user_message(text: &str) -> Payload {
        Payload::Message(MessagePayload {
            role: MessageRole::User,
            content: text.into(),
            history: Vec::new(),
        })
    }

    fn command(name: &str, session_id: Option<&str>, arguments: serde_json::Value) -> Payload {
        Payload::Command(CommandPayload {
            name: name.into(),
            session_id: session_id.map(str::to_string),
            arguments,
        })
    }

    #[tokio::test]
    async fn test_message_requires_handshake() {
        let c = client().await;
        let err = c
            .dispatcher
            .handle(ProtocolEnvelope::new("client-1", "agentflow", user_message("hi")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "handshake_required");
    }

    #[tokio::test]
    async fn test_handshake_then_message_streams_reply() {
        let mut c = client().await;

        let replies = c.send(handshake("conv-7")).await;
        assert_eq!(replies.len(), 2);
        assert!(matches!(
            &replies[0].payload,
            Payload::Handshake(h) if h.conversation_id.as_deref() == Some("conv-7")
        ));
        assert!(matches!(replies[1].payload, Payload::Status(_)));
        assert_eq!(replies[0].to, "client-1");
        assert_eq!(c.dispatcher.handler().conversation_id().await.as_deref(), Some("conv-7"));

        assert!(c.send(user_message("hello")).await.is_empty());

        let mut text = String::new();
        loop {
            let envelope = c.next_outbound().await;
            if let Payload::Chunk(chunk) = envelope.payload {
                text.push_str(&chunk.content);
                if chunk.last {
                    break;
                }
            }
        }
        assert_eq!(text, "Hello! How can I help you today?");

        assert!(c.send(command("finish_stream", None, json!(null))).await.is_empty());
        assert!(c.send(command("stop", None, json!(null))).await.is_empty());
    }

    #[tokio::test]
    async fn test_engine_commands_reply_with_status() {
        let c = client().await;

        let replies = c
            .send(command(
                "create_session",
                None,
                json!({"agent_id": "agent-1", "fsm_id": "fsm_task"}),
            ))
            .await;
        let session_id = match &replies[0].payload {
            Payload::Status(s) => {
                assert_eq!(s.state, "idle");
                s.detail.clone().unwrap()
            }
            other => panic!("expected status, got {:?}", other),
        };

        let replies = c.send(command("start", Some(session_id.as_str()), json!(null))).await;
        assert!(matches!(
            &replies[0].payload,
            Payload::Status(s) if s.state == "working" && !s.terminal
        ));

        // 非法转移以 error 信封回复，而不是中断连接
        let replies = c.send(command("start", Some(session_id.as_str()), json!(null))).await;
        assert!(matches!(
            &replies[0].payload,
            Payload::Error(e) if e.code == "invalid_transition"
        ));

        let replies = c.send(command("complete", Some(session_id.as_str()), json!(null))).await;
        assert!(matches!(
            &replies[0].payload,
            Payload::Status(s) if s.state == "done" && s.terminal
        ));

        let replies = c
            .send(command(
                "create_session",
                None,
                json!({"agent_id": "agent-1", "fsm_id": "fsm_missing"}),
            ))
            .await;
        assert!(matches!(
            &replies[0].payload,
            Payload::Error(e) if e.code == "definition_not_found"
        ));
    }

    #[tokio::test]
    async fn test_rejections() {
        let c = client().await;

        let err = c
            .dispatcher
            .handle(ProtocolEnvelope::new(
                "client-1",
                "agentflow",
                command("rewind", None, json!(null)),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unknown_command");

        let err = c
            .dispatcher
            .handle(ProtocolEnvelope::new(
                "client-1",
                "agentflow",
                Payload::Chunk(ChunkPayload {
                    content: "spoofed".into(),
                    sequence: 0,
                    last: true,
                }),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unexpected_kind");

        let replies = c
            .send(Payload::Heartbeat(HeartbeatPayload { timestamp: 42 }))
            .await;
        assert_eq!(
            replies[0].payload,
            Payload::Heartbeat(HeartbeatPayload { timestamp: 42 })
        );
    }

    #[tokio::test]
    async fn test_bound_conversation_survives_idle_sweep_while_active() {
        let definitions = Arc::new(MemoryDefinitionStore::new());
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(MemorySessionStore::new()),
            definitions,
            Arc::new(RecordingSideEffects::new()),
        ));
        let registry = Arc::new(OrchestrationRegistry::new(
            rule_based_actors(),
            OrchestratorOptions::default(),
            Duration::from_millis(100),
            8,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher =
            Dispatcher::new(ConnectionHandler::new("client-2", registry.clone(), engine, tx));
        let envelope = |payload| ProtocolEnvelope::new("client-2", "agentflow", payload);

        dispatcher.handle(envelope(handshake("conv-live"))).await.unwrap();
        for i in 0..6 {
            let payload = if i % 2 == 0 {
                user_message("hello")
            } else {
                Payload::Heartbeat(HeartbeatPayload { timestamp: i })
            };
            dispatcher.handle(envelope(payload)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert_eq!(registry.cleanup_expired().await, 0);
        assert!(registry.get("conv-live").await.is_some());
    }
}
