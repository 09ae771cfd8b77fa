//! Tool runner stage — executes `tool.execute` and reports `tool.result`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use turnflow_core::bus::{EventBus, EventBusExt};
use turnflow_core::error::Result;
use turnflow_core::event::{ToolExecute, topics};
use turnflow_tools::ToolRunner;

use crate::worker::{Stage, decode};

pub struct ToolRunnerStage {
    runner: ToolRunner,
    bus: Arc<dyn EventBus>,
}

impl ToolRunnerStage {
    pub fn new(runner: ToolRunner, bus: Arc<dyn EventBus>) -> Self {
        Self { runner, bus }
    }
}

#[async_trait]
impl Stage for ToolRunnerStage {
    fn name(&self) -> &'static str {
        "tool-runner"
    }

    fn subjects(&self) -> &'static [&'static str] {
        &[topics::TOOL_EXECUTE]
    }

    async fn handle(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let request: ToolExecute = decode(subject, payload)?;
        let result = self.runner.run(&request).await;
        self.bus.emit(&result).await?;
        info!(
            conversation_id = %request.conversation_id,
            tool = %request.name,
            tool_call_id = %request.tool_call_id,
            success = result.success,
            "Tool result published"
        );
        Ok(())
    }
}
