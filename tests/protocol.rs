//! 协议信封分发集成测试

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;

    use agentflow::protocol::{
        decode, encode, to_sse_frame, ChunkPayload, CommandPayload, ConversationMessage,
        Dispatcher, EnvelopeHandler, EnvelopeKind, EnvelopeMeta, ErrorPayload, HandlerResult,
        HandshakePayload, HeartbeatPayload, MessagePayload, MessageRole, Payload,
        ProtocolEnvelope, ReasoningPayload, StatusPayload, ToolPayload, ToolStatus, UsagePayload,
    };
    use agentflow::ProtocolError;

    /// 把收到的载荷按原样记录下来
    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(EnvelopeKind, Payload)>>,
    }

    impl Recorder {
        async fn push(&self, meta: &EnvelopeMeta, payload: Payload) -> HandlerResult {
            self.received.lock().await.push((meta.kind, payload));
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn on_handshake(&self, m: &EnvelopeMeta, p: HandshakePayload) -> HandlerResult {
            self.push(m, Payload::Handshake(p)).await
        }
        async fn on_message(&self, m: &EnvelopeMeta, p: MessagePayload) -> HandlerResult {
            self.push(m, Payload::Message(p)).await
        }
        async fn on_chunk(&self, m: &EnvelopeMeta, p: ChunkPayload) -> HandlerResult {
            self.push(m, Payload::Chunk(p)).await
        }
        async fn on_reasoning(&self, m: &EnvelopeMeta, p: ReasoningPayload) -> HandlerResult {
            self.push(m, Payload::Reasoning(p)).await
        }
        async fn on_tool(&self, m: &EnvelopeMeta, p: ToolPayload) -> HandlerResult {
            self.push(m, Payload::Tool(p)).await
        }
        async fn on_status(&self, m: &EnvelopeMeta, p: StatusPayload) -> HandlerResult {
            self.push(m, Payload::Status(p)).await
        }
        async fn on_heartbeat(&self, m: &EnvelopeMeta, p: HeartbeatPayload) -> HandlerResult {
            self.push(m, Payload::Heartbeat(p)).await
        }
        async fn on_command(&self, m: &EnvelopeMeta, p: CommandPayload) -> HandlerResult {
            self.push(m, Payload::Command(p)).await
        }
        async fn on_error(&self, m: &EnvelopeMeta, p: ErrorPayload) -> HandlerResult {
            self.push(m, Payload::Error(p)).await
        }
        async fn on_usage(&self, m: &EnvelopeMeta, p: UsagePayload) -> HandlerResult {
            self.push(m, Payload::Usage(p)).await
        }
    }

    fn one_of_each() -> Vec<Payload> {
        vec![
            Payload::Handshake(HandshakePayload {
                protocol_version: "1".into(),
                capabilities: vec!["stream".into()],
                conversation_id: Some("conv-1".into()),
            }),
            Payload::Message(MessagePayload {
                role: MessageRole::User,
                content: "hello".into(),
                history: vec![ConversationMessage::assistant("welcome")],
            }),
            Payload::Chunk(ChunkPayload {
                content: "Hel".into(),
                sequence: 3,
                last: false,
            }),
            Payload::Reasoning(ReasoningPayload {
                content: "user greets".into(),
            }),
            Payload::Tool(ToolPayload {
                call_id: "call-1".into(),
                name: "read_table".into(),
                arguments: json!({"table": "orders"}),
                status: ToolStatus::Completed,
                output: Some(json!({"rows": 3})),
            }),
            Payload::Status(StatusPayload {
                state: "running.streaming".into(),
                terminal: false,
                detail: None,
            }),
            Payload::Heartbeat(HeartbeatPayload {
                timestamp: 1_700_000_000_000,
            }),
            Payload::Command(CommandPayload {
                name: "start".into(),
                session_id: Some("session_1".into()),
                arguments: json!(null),
            }),
            Payload::Error(ErrorPayload {
                code: "client_crash".into(),
                message: "renderer died".into(),
                details: None,
            }),
            Payload::Usage(UsagePayload {
                prompt_tokens: 12,
                completion_tokens: 30,
                total_tokens: 42,
            }),
        ]
    }

    #[tokio::test]
    async fn test_each_kind_reaches_its_handler_once() {
        let dispatcher = Dispatcher::new(Recorder::default());
        let payloads = one_of_each();

        for payload in payloads.clone() {
            let envelope = ProtocolEnvelope::new("client", "agent", payload);
            // 经过线上编码后再分发
            dispatcher.handle_json(&encode(&envelope)).await.unwrap();
        }

        let received = dispatcher.handler().received.lock().await.clone();
        assert_eq!(received.len(), EnvelopeKind::ALL.len());
        for ((kind, got), (expected_kind, expected)) in received
            .iter()
            .zip(EnvelopeKind::ALL.iter().zip(payloads.iter()))
        {
            assert_eq!(kind, expected_kind);
            assert_eq!(got, expected);
            assert_eq!(got.kind(), *kind);
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_invokes_no_handler() {
        let dispatcher = Dispatcher::new(Recorder::default());

        for raw in [
            r#"{"id":"1","kind":"telemetry","payload":{},"from":"c","to":"a"}"#,
            r#"{"id":"2","kind":null,"payload":{},"from":"c","to":"a"}"#,
            r#"{"id":"3","payload":{"content":"x"},"from":"c","to":"a"}"#,
        ] {
            let err = dispatcher.handle_json(raw).await.unwrap_err();
            assert!(
                matches!(err, ProtocolError::UnknownEnvelopeKind { .. }),
                "unexpected error for {}: {:?}",
                raw,
                err
            );
        }
        assert!(dispatcher.handler().received.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_carries_offending_kind() {
        let dispatcher = Dispatcher::new(Recorder::default());
        let err = dispatcher
            .handle_json(r#"{"id":"1","kind":"telemetry","payload":{},"from":"c","to":"a"}"#)
            .await
            .unwrap_err();

        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.code, "unknown_envelope_kind");
        assert_eq!(payload.details, Some(json!({"kind": "telemetry"})));
    }

    #[tokio::test]
    async fn test_mismatched_payload_invokes_no_handler() {
        let dispatcher = Dispatcher::new(Recorder::default());
        let err = dispatcher
            .handle_json(
                r#"{"id":"1","kind":"tool","payload":{"content":"hi"},"from":"c","to":"a"}"#,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), "invalid_payload");
        assert!(dispatcher.handler().received.lock().await.is_empty());
    }

    #[test]
    fn test_wire_shape_is_flat_json() {
        let envelope = ProtocolEnvelope::new(
            "agentflow",
            "conv-1",
            Payload::Usage(UsagePayload {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            }),
        );
        let value: serde_json::Value = serde_json::from_str(&encode(&envelope)).unwrap();
        assert_eq!(
            value,
            json!({
                "id": envelope.id,
                "kind": "usage",
                "payload": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3},
                "from": "agentflow",
                "to": "conv-1",
            })
        );

        let frame = to_sse_frame(&envelope);
        assert!(frame.starts_with("event: usage\n"));
        let data = frame
            .strip_prefix("event: usage\ndata: ")
            .and_then(|rest| rest.strip_suffix("\n\n"))
            .unwrap();
        assert_eq!(decode(data).unwrap(), envelope);
    }
}
