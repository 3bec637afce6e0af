//! Bounded "LLM -> tool call -> tool result -> LLM" harness used by the
//! Architect's REQUEST state and the Coder's PLANNING/CODING states: the
//! same call-inspect-execute-reinject cycle, built around a tool registry
//! and an explicit ordered list of terminal tool names rather than an
//! implicit termination heuristic.

use crate::capabilities::{ChatMessage, CompletionRequest, LlmClient, StopReason, ToolCall};
pub use crate::error::ToolLoopError;
use crate::limiter::Limiter;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A callable the LLM may invoke mid-loop. Tools that do not end the loop
/// (e.g. `read_file`, `run_tests`) return a result that gets reinjected as a
/// `tool` message; terminal tools never execute here; their arguments are
/// handed back to the caller as `ToolLoopOutcome::Terminal`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn execute(&self, arguments: Value) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }
}

pub struct ToolLoopOutcome {
    pub terminal_tool: String,
    pub arguments: Value,
    pub iterations_used: u32,
}

/// Runs the call/execute cycle until a tool call whose name appears in
/// `terminal_tools` (checked in order; first match wins when a response
/// names more than one) is produced, or `max_iterations` LLM calls have been
/// made without one, which is `ToolLoopError::BudgetExceeded`.
pub struct ToolLoopHarness {
    llm: Arc<dyn LlmClient>,
    limiter: Arc<Limiter>,
    registry: ToolRegistry,
    terminal_tools: Vec<String>,
    max_iterations: u32,
    tokens_per_call: u32,
}

impl ToolLoopHarness {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        limiter: Arc<Limiter>,
        registry: ToolRegistry,
        terminal_tools: Vec<String>,
        max_iterations: u32,
        tokens_per_call: u32,
    ) -> Self {
        Self { llm, limiter, registry, terminal_tools, max_iterations, tokens_per_call }
    }

    pub async fn run(
        &self,
        model: &str,
        tool_specs: Vec<Value>,
        mut messages: Vec<ChatMessage>,
    ) -> Result<ToolLoopOutcome, ToolLoopError> {
        for iteration in 1..=self.max_iterations {
            self.limiter
                .reserve(model, self.tokens_per_call)
                .await
                .map_err(|e| ToolLoopError::InvalidResult(e.to_string()))?;

            let response = self
                .llm
                .complete(CompletionRequest { model: model.to_string(), messages: messages.clone(), tool_specs: tool_specs.clone() })
                .await
                .map_err(|e| ToolLoopError::InvalidResult(e.to_string()))?;

            if let Some(terminal) = self.find_terminal(&response.tool_calls) {
                debug!(iteration, tool = %terminal.name, "tool loop reached terminal call");
                return Ok(ToolLoopOutcome {
                    terminal_tool: terminal.name.clone(),
                    arguments: terminal.arguments.clone(),
                    iterations_used: iteration,
                });
            }

            if response.tool_calls.is_empty() {
                if response.stop_reason == StopReason::Stop {
                    return Err(ToolLoopError::NoTerminalTool);
                }
                messages.push(ChatMessage::assistant(response.content));
                continue;
            }

            messages.push(ChatMessage::assistant(response.content));
            for call in &response.tool_calls {
                let result = self.execute_non_terminal(call).await;
                messages.push(ChatMessage::tool_result(call.id.clone(), result));
            }
        }

        Err(ToolLoopError::BudgetExceeded)
    }

    fn find_terminal<'a>(&self, calls: &'a [ToolCall]) -> Option<&'a ToolCall> {
        self.terminal_tools.iter().find_map(|name| calls.iter().find(|c| &c.name == name))
    }

    async fn execute_non_terminal(&self, call: &ToolCall) -> String {
        match self.registry.get(&call.name) {
            Some(tool) => match tool.execute(call.arguments.clone()).await {
                Ok(value) => value.to_string(),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "tool execution failed");
                    format!("error: {e}")
                }
            },
            None => format!("error: unknown tool {}", call.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ChatMessage, CompletionChunk, CompletionResponse};
    use crate::config::ModelLimits;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct ScriptedLlm {
        calls: AtomicU32,
        responses: Vec<CompletionResponse>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.responses[i.min(self.responses.len() - 1)].clone())
        }
        async fn stream(&self, _req: CompletionRequest) -> anyhow::Result<mpsc::Receiver<CompletionChunk>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn limiter() -> Arc<Limiter> {
        let mut configs = HashMap::new();
        configs.insert("scripted".to_string(), ModelLimits { max_tpm: 10_000, daily_budget_usd: 100.0, max_connections: 5, cpm_usd: 0.01 });
        Arc::new(Limiter::new(configs))
    }

    fn tool_call(name: &str) -> ToolCall {
        ToolCall { id: "1".to_string(), name: name.to_string(), arguments: serde_json::json!({}) }
    }

    #[tokio::test]
    async fn stops_at_terminal_tool() {
        let llm = Arc::new(ScriptedLlm {
            calls: AtomicU32::new(0),
            responses: vec![CompletionResponse {
                content: "done".to_string(),
                tool_calls: vec![tool_call("submit_plan")],
                stop_reason: StopReason::ToolUse,
            }],
        });
        let harness = ToolLoopHarness::new(llm, limiter(), ToolRegistry::new(), vec!["submit_plan".to_string()], 4, 10);
        let outcome = harness.run("scripted", vec![], vec![ChatMessage::user("go")]).await.unwrap();
        assert_eq!(outcome.terminal_tool, "submit_plan");
        assert_eq!(outcome.iterations_used, 1);
    }

    #[tokio::test]
    async fn exhausts_budget_after_exactly_max_iterations() {
        let llm = Arc::new(ScriptedLlm {
            calls: AtomicU32::new(0),
            responses: vec![CompletionResponse {
                content: "thinking".to_string(),
                tool_calls: vec![tool_call("read_file")],
                stop_reason: StopReason::ToolUse,
            }],
        });
        let harness = ToolLoopHarness::new(llm.clone(), limiter(), ToolRegistry::new(), vec!["submit_plan".to_string()], 4, 10);
        let err = harness.run("scripted", vec![], vec![ChatMessage::user("go")]).await.unwrap_err();
        assert_eq!(err, ToolLoopError::BudgetExceeded);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn plain_stop_without_terminal_tool_is_an_error() {
        let llm = Arc::new(ScriptedLlm {
            calls: AtomicU32::new(0),
            responses: vec![CompletionResponse { content: "ok".to_string(), tool_calls: vec![], stop_reason: StopReason::Stop }],
        });
        let harness = ToolLoopHarness::new(llm, limiter(), ToolRegistry::new(), vec!["submit_plan".to_string()], 4, 10);
        let err = harness.run("scripted", vec![], vec![ChatMessage::user("go")]).await.unwrap_err();
        assert_eq!(err, ToolLoopError::NoTerminalTool);
    }
}
