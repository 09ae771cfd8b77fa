//! `turnflow chat` — run the pipeline in-process and chat through it.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use turnflow_config::AppConfig;
use turnflow_core::bus::{EventBus, InProcessBus, Subscription};
use turnflow_core::event::{CompletionNotification, SystemErrorEvent, topics};
use turnflow_core::message::{Conversation, ConversationId, SystemPrompt};
use turnflow_core::store::Store;
use turnflow_core::token::CharHeuristic;
use turnflow_core::tool::{ToolCall, ToolCallStatus};
use turnflow_pipeline::{Collaborators, Pipeline, assistant_message_id, submit_user_message};
use turnflow_providers::OpenAiCompatProvider;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

pub async fn run(
    message: Option<String>,
    conversation: Option<String>,
    system: Option<String>,
) -> CliResult<()> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    // Fail early with setup instructions
    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    TURNFLOW_API_KEY = 'sk-...'");
        eprintln!("    OPENAI_API_KEY   = 'sk-...'");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let store = super::open_store(&config).await?;
    let bus = Arc::new(InProcessBus::new(config.bus.capacity, config.bus.max_deliver));
    let provider = Arc::new(OpenAiCompatProvider::from_config(&config.provider)?);

    if conversation.is_some() && system.is_some() {
        eprintln!("  Note: --system only applies to new conversations; ignoring it.");
    }
    let conversation = open_conversation(store.as_ref(), conversation, system).await?;

    let session = ChatSession {
        store: store.clone(),
        bus: bus.clone(),
        replies: bus
            .subscribe(&topics::conversation_message_new(&conversation.id))
            .await?,
        errors: bus.subscribe(topics::SYSTEM_ERROR).await?,
        conversation_id: conversation.id.clone(),
        reply_timeout: config.deadlines.context_builder()
            + config.deadlines.flow_orchestrator() * 2
            + config.deadlines.inference_executor(),
        tool_timeout: config.deadlines.tool_runner() + Duration::from_secs(1),
    };

    let pipeline = Pipeline::start(
        &config,
        Collaborators {
            store,
            bus: bus.clone(),
            provider,
            counter: Arc::new(CharHeuristic),
            registry: turnflow_tools::default_registry(),
        },
    )
    .await?;

    let outcome = match message {
        Some(msg) => {
            eprint!("  Thinking...");
            let result = session.turn(&msg).await;
            eprint!("\r              \r");
            result.map(|reply| print_reply(&reply, false))
        }
        None => interactive(&session, &config).await,
    };

    pipeline.shutdown().await;
    bus.close().await;
    outcome
}

async fn interactive(session: &ChatSession, config: &AppConfig) -> CliResult<()> {
    println!();
    println!("  Turnflow — Interactive Mode");
    println!();
    println!("  Conversation: {}", session.conversation_id);
    println!("  Model:        {}", config.default_model);
    println!("  Storage:      {}", config.storage.backend);
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+D to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }

        eprint!("  ...");
        match session.turn(line).await {
            Ok(reply) => {
                eprint!("\r     \r");
                println!();
                print_reply(&reply, true);
                println!();
            }
            Err(e) => {
                eprint!("\r     \r");
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }

    println!();
    println!("  Conversation saved as {}", session.conversation_id);
    println!();
    Ok(())
}

async fn open_conversation(
    store: &dyn Store,
    id: Option<String>,
    system: Option<String>,
) -> CliResult<Conversation> {
    if let Some(id) = id {
        let id = ConversationId(id);
        return store
            .get_conversation(&id)
            .await?
            .ok_or_else(|| format!("Conversation {id} not found").into());
    }

    let prompt = SystemPrompt::new(
        "cli",
        system.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    );
    store.save_system_prompt(&prompt).await?;
    let conversation = Conversation::new(&prompt.id);
    store.save_conversation(&conversation).await?;
    Ok(conversation)
}

/// A completed turn as the user sees it.
struct Reply {
    notification: CompletionNotification,
    /// Tool calls with whatever status they reached while we waited
    tool_calls: Vec<ToolCall>,
}

struct ChatSession {
    store: Arc<dyn Store>,
    bus: Arc<InProcessBus>,
    replies: Subscription,
    errors: Subscription,
    conversation_id: ConversationId,
    reply_timeout: Duration,
    tool_timeout: Duration,
}

impl ChatSession {
    /// Submit one user message and wait for the turn to finish or fail.
    async fn turn(&self, content: &str) -> CliResult<Reply> {
        let store = self.store.as_ref();
        let bus: &dyn EventBus = self.bus.as_ref();
        let submitted = submit_user_message(store, bus, &self.conversation_id, content).await?;
        let expected = assistant_message_id(&submitted.id);

        let deadline = tokio::time::sleep(self.reply_timeout);
        tokio::pin!(deadline);

        let notification = loop {
            tokio::select! {
                next = self.replies.next() => {
                    let delivery = next.ok_or("Event bus closed")?;
                    let notification: CompletionNotification = delivery.decode()?;
                    delivery.ack();
                    if notification.message.id == expected {
                        break notification;
                    }
                    tracing::debug!(message_id = %notification.message.id, "Skipping reply to an earlier turn");
                }
                next = self.errors.next() => {
                    let delivery = next.ok_or("Event bus closed")?;
                    let event: SystemErrorEvent = delivery.decode()?;
                    delivery.ack();
                    if concerns_turn(&event, &self.conversation_id, &submitted.id, &expected) {
                        return Err(format!("{} failed: {}", event.stage, event.error).into());
                    }
                }
                _ = &mut deadline => {
                    return Err(format!("No reply within {}s", self.reply_timeout.as_secs()).into());
                }
            }
        };

        let tool_calls = self.settle(&notification.message.tool_calls).await?;
        Ok(Reply {
            notification,
            tool_calls,
        })
    }

    /// Wait for dispatched tool calls to reach a terminal state.
    async fn settle(&self, calls: &[ToolCall]) -> CliResult<Vec<ToolCall>> {
        let started = tokio::time::Instant::now();
        let mut settled = calls.to_vec();
        while settled.iter().any(|c| c.is_pending()) && started.elapsed() < self.tool_timeout {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for call in settled.iter_mut().filter(|c| c.is_pending()) {
                if let Some(stored) = self.store.get_tool_call(&call.id).await? {
                    *call = stored;
                }
            }
        }
        Ok(settled)
    }
}

/// Whether a `system.error` belongs to the turn started by `submitted_id`.
/// Errors without a message id are attributed to the current turn.
fn concerns_turn(
    event: &SystemErrorEvent,
    conversation_id: &ConversationId,
    submitted_id: &str,
    reply_id: &str,
) -> bool {
    event.conversation_id.as_ref() == Some(conversation_id)
        && event
            .message_id
            .as_deref()
            .is_none_or(|id| id == submitted_id || id == reply_id)
}

fn print_reply(reply: &Reply, prefixed: bool) {
    for call in &reply.tool_calls {
        let outcome = match &call.status {
            ToolCallStatus::Pending => "pending".to_string(),
            ToolCallStatus::Success { result } => result.to_string(),
            ToolCallStatus::Error { message } => format!("error: {message}"),
        };
        eprintln!("  [tool] {}({}) → {outcome}", call.name, call.arguments);
    }

    let content = &reply.notification.message.content;
    if prefixed {
        for line in content.lines() {
            println!("  Assistant > {line}");
        }
    } else if !content.is_empty() {
        println!("{content}");
    }

    tracing::debug!(
        duration_ms = reply.notification.duration_ms,
        total_tokens = reply.notification.usage.total_tokens,
        finish_reason = ?reply.notification.finish_reason,
        "Turn finished"
    );
}
