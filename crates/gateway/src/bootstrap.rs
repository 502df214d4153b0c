//! `AppState` construction, shared by every CLI entry point so `run` and
//! `chat` boot the same runtime.

use std::sync::Arc;

use sa_domain::config::{Config, ConfigSeverity};
use sa_mcp_client::McpManager;
use sa_providers::OpenAiCompatProvider;
use sa_tools::builtin::{ReadFileTool, ShellTool, WriteFileTool};
use sa_tools::ToolRegistry;

use crate::runtime::approval::ApprovalConfirm;
use crate::runtime::cancel::CancelMap;
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`]. Shared boot path for `run` and `chat`.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    std::fs::create_dir_all(&config.store.data_root)?;
    let db_path = config
        .store
        .data_root
        .join(format!("{}.sqlite3", config.store.database_name));
    let store = Arc::new(sa_store::Store::open(&db_path)?);
    tracing::info!(path = %db_path.display(), "store ready");

    let event_bus = Arc::new(sa_eventbus::EventBus::with_intervals(
        config.store.database_name.clone(),
        config.event_bus.subscriber_capacity,
        std::time::Duration::from_millis(config.event_bus.poll_interval_ms),
        config.event_bus.retention_secs as i64,
    ));
    event_bus.register_database(config.store.database_name.clone(), store.clone());

    let approval = Arc::new(sa_approval::ApprovalBroker::new(std::time::Duration::from_secs(
        config.approval.wait_timeout_secs,
    )));

    let tools = Arc::new(ToolRegistry::new());
    if config.tools.builtin_enabled {
        tools.register(Arc::new(ShellTool::new()));
        tools.register(Arc::new(ReadFileTool));
        tools.register(Arc::new(WriteFileTool));
    }
    tools.set_confirm_callback(Arc::new(ApprovalConfirm {
        approval: approval.clone(),
        owner: "turn-engine".to_string(),
        timeout: std::time::Duration::from_secs(config.approval.wait_timeout_secs),
    }));

    let mcp = Arc::new(McpManager::from_config(&config.mcp).await);
    tools.set_remote_provider(mcp.clone());

    let llm: Arc<dyn sa_providers::LlmProvider> = Arc::new(OpenAiCompatProvider::from_config(&config.llm)?);

    Ok(AppState {
        config,
        llm,
        store,
        event_bus,
        tools,
        mcp,
        approval,
        cancel_map: Arc::new(CancelMap::new()),
    })
}

/// Spawn background tasks that run for the lifetime of the process
/// (event bus polling, approval sweep). Safe to call once per process.
pub fn spawn_background_tasks(state: &AppState) {
    state.event_bus.start_polling();
    state
        .approval
        .start_sweep(std::time::Duration::from_secs(30));
}
