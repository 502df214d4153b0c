use std::sync::Arc;

use sa_domain::config::Config;
use sa_providers::LlmProvider;

use crate::runtime::cancel::CancelMap;

/// Shared application state passed to the turn engine and CLI front ends.
///
/// Fields are grouped by concern:
/// - **Core services** — config, the single LLM completion endpoint
/// - **Persistence** — the SQLite-backed store, the event bus that mirrors
///   writes to it across processes
/// - **Tool orchestration** — the destructive-gated registry, its MCP-backed
///   remote provider, the human-approval broker
/// - **Turn control** — per-conversation cancellation
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,

    // ── Persistence ───────────────────────────────────────────────────
    pub store: Arc<sa_store::Store>,
    pub event_bus: Arc<sa_eventbus::EventBus>,

    // ── Tool orchestration ────────────────────────────────────────────
    pub tools: Arc<sa_tools::ToolRegistry>,
    pub mcp: Arc<sa_mcp_client::McpManager>,
    pub approval: Arc<sa_approval::ApprovalBroker>,

    // ── Turn control ──────────────────────────────────────────────────
    pub cancel_map: Arc<CancelMap>,
}
