//! Inference Executor — calls the provider for a prepared context and
//! tracks the tool calls the model asks for.
//!
//! Consumes `inference.request` and `tool.result`. A request produces one
//! persisted assistant message (id derived from the triggering message, so
//! a redelivered request finds it instead of calling the provider again),
//! one `tool.execute` per valid tool call, and an `inference.response`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use turnflow_core::bus::{EventBus, EventBusExt};
use turnflow_core::error::Result;
use turnflow_core::event::{
    InferenceEnvelope, InferenceResponse, ToolExecute, ToolResultEvent, topics,
};
use turnflow_core::message::{ConversationId, Message, derive_id};
use turnflow_core::provider::{FinishReason, Provider, ProviderRequest, ToolDefinition, Usage};
use turnflow_core::store::{InsertOutcome, Store};
use turnflow_core::tool::{ToolCall, ToolCatalog};
use turnflow_tools::validate_call;

use crate::worker::{Stage, decode};

/// Id of the assistant message answering `trigger`.
pub fn assistant_message_id(trigger: &str) -> String {
    derive_id(&format!("assistant:{trigger}"))
}

/// What applying a `tool.result` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolResultOutcome {
    /// The call moved from pending to its terminal state.
    Applied,
    /// The call was already terminal; nothing changed.
    AlreadyTerminal,
    /// No call with that id exists.
    UnknownCall,
}

pub struct InferenceExecutor {
    store: Arc<dyn Store>,
    bus: Arc<dyn EventBus>,
    provider: Arc<dyn Provider>,
    catalog: Arc<dyn ToolCatalog>,
}

impl InferenceExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn EventBus>,
        provider: Arc<dyn Provider>,
        catalog: Arc<dyn ToolCatalog>,
    ) -> Self {
        Self {
            store,
            bus,
            provider,
            catalog,
        }
    }

    /// Run inference for one envelope, persist the assistant message and
    /// dispatch its pending tool calls.
    pub async fn execute(&self, envelope: &InferenceEnvelope) -> Result<InferenceResponse> {
        let context = &envelope.context;
        let assistant_id = assistant_message_id(&context.message_id);

        if let Some(existing) = self.store.get_message(&assistant_id).await? {
            return self.replay(envelope, existing).await;
        }

        let tools = if envelope.tools_enabled {
            self.available_tools(&context.conversation_id).await
        } else {
            Vec::new()
        };

        let request = ProviderRequest {
            model: envelope.model.clone(),
            system_prompt: context.system_prompt.clone(),
            messages: context.messages.clone(),
            temperature: envelope.temperature,
            max_tokens: envelope.max_tokens,
            tools: tools.clone(),
        };

        debug!(
            conversation_id = %context.conversation_id,
            provider = self.provider.name(),
            model = %envelope.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling provider"
        );
        let response = self.provider.complete(request).await?;

        let mut message = Message::assistant(&context.conversation_id, response.content);
        message.id = assistant_id;
        message.token_count = response.usage.completion_tokens;
        message.model = Some(if response.model.is_empty() {
            envelope.model.clone()
        } else {
            response.model
        });

        for (index, requested) in response.tool_calls.into_iter().enumerate() {
            let mut call = ToolCall::pending(&message.id, index, requested.name, requested.arguments);
            if let Err(e) = validate_call(&tools, &call.name, &call.arguments) {
                warn!(
                    conversation_id = %context.conversation_id,
                    tool = %call.name,
                    error = %e,
                    "Rejecting tool call"
                );
                call.fail(e.to_string())?;
            }
            message.tool_calls.push(call);
        }

        // Persist before dispatch so a fast tool.result always finds its call.
        // An overlapping delivery of the same request may have stored its
        // own reply first; that one is the turn's answer.
        if let InsertOutcome::Existing(stored) = self.store.insert_message_if_absent(&message).await? {
            debug!(
                conversation_id = %context.conversation_id,
                message_id = %stored.id,
                "Concurrent delivery stored the reply first"
            );
            return self.replay(envelope, stored).await;
        }
        self.dispatch_pending(&message).await?;

        let finish_reason = if message.tool_calls.is_empty() {
            response.finish_reason
        } else {
            FinishReason::ToolCalls
        };

        Ok(InferenceResponse {
            conversation_id: context.conversation_id.clone(),
            message_id: context.message_id.clone(),
            tool_calls: message.tool_calls.clone(),
            message,
            finish_reason,
            usage: response.usage,
            requested_at: context.requested_at,
        })
    }

    /// A redelivered request: the provider already answered, so re-dispatch
    /// whatever is still pending and answer from the stored message.
    ///
    /// The provider's finish reason and usage are not stored with the
    /// message. A replay reports `ToolCalls` or `Stop` with zero usage, so a
    /// reply that first ended on `Length` is re-announced as `Stop`.
    async fn replay(&self, envelope: &InferenceEnvelope, message: Message) -> Result<InferenceResponse> {
        let context = &envelope.context;
        info!(
            conversation_id = %context.conversation_id,
            message_id = %message.id,
            "Assistant message already stored, skipping provider call"
        );
        self.dispatch_pending(&message).await?;

        let finish_reason = if message.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        Ok(InferenceResponse {
            conversation_id: context.conversation_id.clone(),
            message_id: context.message_id.clone(),
            tool_calls: message.tool_calls.clone(),
            message,
            finish_reason,
            usage: Usage::default(),
            requested_at: context.requested_at,
        })
    }

    /// The catalog is optional: when it is down the turn runs without tools.
    async fn available_tools(&self, conversation_id: &ConversationId) -> Vec<ToolDefinition> {
        match self.catalog.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(%conversation_id, error = %e, "Tool catalog unavailable, continuing without tools");
                Vec::new()
            }
        }
    }

    async fn dispatch_pending(&self, message: &Message) -> Result<()> {
        for call in message.tool_calls.iter().filter(|c| c.is_pending()) {
            self.bus
                .emit(&ToolExecute::for_call(call, &message.conversation_id))
                .await?;
            debug!(tool = %call.name, tool_call_id = %call.id, "Tool call dispatched");
        }
        Ok(())
    }

    /// Move a pending call to the terminal state a `tool.result` reports.
    /// Results for calls that are already terminal are ignored.
    pub async fn apply_tool_result(&self, result: &ToolResultEvent) -> Result<ToolResultOutcome> {
        let Some(mut call) = self.store.get_tool_call(&result.tool_call_id).await? else {
            return Ok(ToolResultOutcome::UnknownCall);
        };

        if call.resolve(result.status()).is_err() {
            return Ok(ToolResultOutcome::AlreadyTerminal);
        }

        if self.store.complete_tool_call(&call).await? {
            Ok(ToolResultOutcome::Applied)
        } else {
            Ok(ToolResultOutcome::AlreadyTerminal)
        }
    }
}

#[async_trait]
impl Stage for InferenceExecutor {
    fn name(&self) -> &'static str {
        "inference-executor"
    }

    fn subjects(&self) -> &'static [&'static str] {
        &[topics::INFERENCE_REQUEST, topics::TOOL_RESULT]
    }

    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<()> {
        if subject == topics::TOOL_RESULT {
            let result: ToolResultEvent = decode(subject, payload)?;
            match self.apply_tool_result(&result).await? {
                ToolResultOutcome::Applied => info!(
                    tool_call_id = %result.tool_call_id,
                    success = result.success,
                    "Tool call completed"
                ),
                ToolResultOutcome::AlreadyTerminal => debug!(
                    tool_call_id = %result.tool_call_id,
                    "Duplicate tool result ignored"
                ),
                ToolResultOutcome::UnknownCall => warn!(
                    tool_call_id = %result.tool_call_id,
                    "Result for unknown tool call"
                ),
            }
            return Ok(());
        }

        let envelope: InferenceEnvelope = decode(subject, payload)?;
        let response = self.execute(&envelope).await?;
        self.bus.emit(&response).await?;
        info!(
            conversation_id = %response.conversation_id,
            message_id = %response.message.id,
            finish_reason = ?response.finish_reason,
            tool_calls = response.tool_calls.len(),
            completion_tokens = response.usage.completion_tokens,
            "Inference complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use turnflow_core::bus::InProcessBus;
    use std::time::Duration;
    use turnflow_core::error::{ErrorKind, ProviderError};
    use turnflow_core::tool::ToolCallStatus;
    use turnflow_store::InMemoryStore;

    struct Fixture {
        store: Arc<InMemoryStore>,
        bus: Arc<InProcessBus>,
        provider: Arc<SequentialMockProvider>,
        executor: InferenceExecutor,
    }

    fn fixture(provider: SequentialMockProvider, catalog: Arc<dyn ToolCatalog>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let bus = Arc::new(InProcessBus::default());
        let provider = Arc::new(provider);
        let executor = InferenceExecutor::new(store.clone(), bus.clone(), provider.clone(), catalog);
        Fixture {
            store,
            bus,
            provider,
            executor,
        }
    }

    fn user_turn() -> (ConversationId, Message) {
        let conv = ConversationId::from("conv-1");
        let msg = Message::user(&conv, "What's the weather?").with_tokens(5);
        (conv, msg)
    }

    #[tokio::test]
    async fn text_reply_is_persisted() {
        let f = fixture(SequentialMockProvider::single_text("Sunny."), Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();

        let response = f.executor.execute(&envelope(&conv, &trigger, true)).await.unwrap();
        assert_eq!(response.message.content, "Sunny.");
        assert_eq!(response.message.id, assistant_message_id(&trigger.id));
        assert_eq!(response.message_id, trigger.id);
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.message.model.as_deref(), Some("mock-model"));
        assert_eq!(response.message.token_count, 5);

        let stored = f.store.get_message(&response.message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, "Sunny.");

        let request = f.provider.last_request().unwrap();
        assert_eq!(request.model, "gpt-test");
        assert_eq!(request.max_tokens, 512);
        assert_eq!(request.system_prompt, "You are helpful.");
        assert_eq!(request.tools, vec![lookup_definition()]);
    }

    #[tokio::test]
    async fn only_valid_tool_calls_are_dispatched() {
        let provider = SequentialMockProvider::new(vec![Ok(make_tool_call_response(&[
            ("lookup", json!({"query": "weather"})),
            ("lookup", json!({"query": 42})),
            ("teleport", json!({})),
        ]))]);
        let f = fixture(provider, Arc::new(StaticCatalog));
        let executes = f.bus.subscribe(topics::TOOL_EXECUTE).await.unwrap();
        let (conv, trigger) = user_turn();

        let response = f.executor.execute(&envelope(&conv, &trigger, true)).await.unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.tool_calls.len(), 3);
        assert!(response.tool_calls[0].is_pending());
        assert!(matches!(response.tool_calls[1].status, ToolCallStatus::Error { .. }));
        assert!(matches!(response.tool_calls[2].status, ToolCallStatus::Error { .. }));

        let delivery = executes.next().await.unwrap();
        let execute: ToolExecute = delivery.decode().unwrap();
        delivery.ack();
        assert_eq!(execute.tool_call_id, response.tool_calls[0].id);
        assert_eq!(execute.arguments, json!({"query": "weather"}));
        assert_eq!(execute.conversation_id, conv);

        // Stored calls match what was returned
        for call in &response.tool_calls {
            let stored = f.store.get_tool_call(&call.id).await.unwrap().unwrap();
            assert_eq!(stored.status, call.status);
        }

        // Nothing else was dispatched
        let extra = tokio::time::timeout(std::time::Duration::from_millis(50), executes.next()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn replayed_request_does_not_call_provider_again() {
        let provider = SequentialMockProvider::new(vec![Ok(make_tool_call_response(&[(
            "lookup",
            json!({"query": "x"}),
        )]))]);
        let f = fixture(provider, Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();
        let env = envelope(&conv, &trigger, true);

        let first = f.executor.execute(&env).await.unwrap();
        let second = f.executor.execute(&env).await.unwrap();

        assert_eq!(f.provider.call_count(), 1);
        assert_eq!(first.message.id, second.message.id);
        assert_eq!(first.tool_calls[0].id, second.tool_calls[0].id);
        assert_eq!(second.finish_reason, FinishReason::ToolCalls);
    }

    #[tokio::test]
    async fn overlapping_deliveries_announce_one_reply() {
        let provider = SequentialMockProvider::new(vec![
            Ok(make_text_response("answer 0")),
            Ok(make_text_response("answer 1")),
        ])
        .with_delay(Duration::from_millis(50));
        let f = fixture(provider, Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();
        let env = envelope(&conv, &trigger, true);

        let (a, b) = tokio::join!(f.executor.execute(&env), f.executor.execute(&env));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.message.id, b.message.id);
        assert_eq!(a.message.content, b.message.content);
        let stored = f.store.get_message(&a.message.id).await.unwrap().unwrap();
        assert_eq!(stored.content, a.message.content);
    }

    #[tokio::test]
    async fn overlapping_deliveries_dispatch_the_stored_arguments() {
        let provider = SequentialMockProvider::new(vec![
            Ok(make_tool_call_response(&[("lookup", json!({"query": "a"}))])),
            Ok(make_tool_call_response(&[("lookup", json!({"query": "b"}))])),
        ])
        .with_delay(Duration::from_millis(50));
        let f = fixture(provider, Arc::new(StaticCatalog));
        let executes = f.bus.subscribe(topics::TOOL_EXECUTE).await.unwrap();
        let (conv, trigger) = user_turn();
        let env = envelope(&conv, &trigger, true);

        let (a, b) = tokio::join!(f.executor.execute(&env), f.executor.execute(&env));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.tool_calls, b.tool_calls);

        let stored = f.store.get_tool_call(&a.tool_calls[0].id).await.unwrap().unwrap();
        assert_eq!(stored.arguments, a.tool_calls[0].arguments);

        // Both deliveries may dispatch, but only ever the stored arguments
        while let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(50), executes.next()).await
        {
            let execute: ToolExecute = delivery.decode().unwrap();
            delivery.ack();
            assert_eq!(execute.arguments, stored.arguments);
        }
    }

    #[tokio::test]
    async fn replay_reports_stop_without_usage() {
        let mut truncated = make_text_response("cut off mid");
        truncated.finish_reason = FinishReason::Length;
        let f = fixture(SequentialMockProvider::new(vec![Ok(truncated)]), Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();
        let env = envelope(&conv, &trigger, true);

        let first = f.executor.execute(&env).await.unwrap();
        assert_eq!(first.finish_reason, FinishReason::Length);

        let replayed = f.executor.execute(&env).await.unwrap();
        assert_eq!(replayed.message.content, "cut off mid");
        assert_eq!(replayed.finish_reason, FinishReason::Stop);
        assert_eq!(replayed.usage, Usage::default());
    }

    #[tokio::test]
    async fn catalog_outage_runs_without_tools() {
        let f = fixture(SequentialMockProvider::single_text("ok"), Arc::new(FailingCatalog));
        let (conv, trigger) = user_turn();

        let response = f.executor.execute(&envelope(&conv, &trigger, true)).await.unwrap();
        assert_eq!(response.message.content, "ok");
        assert!(f.provider.last_request().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn tools_disabled_sends_no_tools() {
        let f = fixture(SequentialMockProvider::single_text("ok"), Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();

        f.executor.execute(&envelope(&conv, &trigger, false)).await.unwrap();
        assert!(f.provider.last_request().unwrap().tools.is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_upstream_and_nothing_is_stored() {
        let provider = SequentialMockProvider::new(vec![Err(ProviderError::Network("reset".into()))]);
        let f = fixture(provider, Arc::new(StaticCatalog));
        let (conv, trigger) = user_turn();

        let err = f.executor.execute(&envelope(&conv, &trigger, true)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        let stored = f.store.get_message(&assistant_message_id(&trigger.id)).await.unwrap();
        assert!(stored.is_none());
    }

    async fn pending_call(f: &Fixture) -> ToolCall {
        let (conv, trigger) = user_turn();
        let response = f.executor.execute(&envelope(&conv, &trigger, true)).await.unwrap();
        response.tool_calls[0].clone()
    }

    fn request_for(call: &ToolCall) -> ToolExecute {
        ToolExecute::for_call(call, &ConversationId::from("conv-1"))
    }

    fn one_call_provider() -> SequentialMockProvider {
        SequentialMockProvider::new(vec![Ok(make_tool_call_response(&[(
            "lookup",
            json!({"query": "x"}),
        )]))])
    }

    #[tokio::test]
    async fn success_result_is_applied_once() {
        let f = fixture(one_call_provider(), Arc::new(StaticCatalog));
        let call = pending_call(&f).await;

        let ok = ToolResultEvent::success(&request_for(&call), json!({"answer": 42}));
        assert_eq!(f.executor.apply_tool_result(&ok).await.unwrap(), ToolResultOutcome::Applied);

        let late = ToolResultEvent::failure(&request_for(&call), "too late");
        assert_eq!(
            f.executor.apply_tool_result(&late).await.unwrap(),
            ToolResultOutcome::AlreadyTerminal
        );

        let stored = f.store.get_tool_call(&call.id).await.unwrap().unwrap();
        assert_eq!(
            stored.status,
            ToolCallStatus::Success {
                result: json!({"answer": 42})
            }
        );
    }

    #[tokio::test]
    async fn failure_result_is_recorded() {
        let f = fixture(one_call_provider(), Arc::new(StaticCatalog));
        let call = pending_call(&f).await;

        let bad = ToolResultEvent::failure(&request_for(&call), "no network");
        assert_eq!(f.executor.apply_tool_result(&bad).await.unwrap(), ToolResultOutcome::Applied);
        let stored = f.store.get_tool_call(&call.id).await.unwrap().unwrap();
        assert_eq!(
            stored.status,
            ToolCallStatus::Error {
                message: "no network".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_call_is_reported() {
        let f = fixture(SequentialMockProvider::new(vec![]), Arc::new(StaticCatalog));
        let ghost = ToolCall::pending("m-ghost", 0, "lookup", json!({}));
        let result = ToolResultEvent::success(&request_for(&ghost), json!(null));
        assert_eq!(
            f.executor.apply_tool_result(&result).await.unwrap(),
            ToolResultOutcome::UnknownCall
        );
    }

    #[tokio::test]
    async fn handle_publishes_inference_response() {
        let f = fixture(SequentialMockProvider::single_text("Hello!"), Arc::new(StaticCatalog));
        let responses = f.bus.subscribe(topics::INFERENCE_RESPONSE).await.unwrap();
        let (conv, trigger) = user_turn();
        let payload = serde_json::to_vec(&envelope(&conv, &trigger, true)).unwrap();

        f.executor.handle(topics::INFERENCE_REQUEST, &payload).await.unwrap();

        let delivery = responses.next().await.unwrap();
        let response: InferenceResponse = delivery.decode().unwrap();
        delivery.ack();
        assert_eq!(response.message.content, "Hello!");
        assert_eq!(response.conversation_id, conv);
    }

    #[tokio::test]
    async fn malformed_tool_result_is_validation() {
        let f = fixture(SequentialMockProvider::new(vec![]), Arc::new(StaticCatalog));
        let err = f.executor.handle(topics::TOOL_RESULT, b"{not json").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
