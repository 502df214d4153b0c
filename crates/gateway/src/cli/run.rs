//! `serialagent run` — one-shot execution command.
//!
//! Sends a single message to the agent, streams the response to stdout,
//! and exits. Useful for scripting, piping, and quick CLI interactions.

use std::io::Write;
use std::sync::Arc;

use sa_domain::config::Config;

use crate::bootstrap;
use crate::runtime::{run_turn, TurnEvent, TurnInput};

/// Execute a single agent turn and print the response.
///
/// This is the entry point for `serialagent run "message"`.
pub async fn run(config: Arc<Config>, message: String, conversation: Option<String>, json_output: bool) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config).await?;

    let conversation_id = match conversation {
        Some(id) => id,
        None => state.store.create_conversation("New conversation")?.id,
    };

    let input = TurnInput {
        conversation_id,
        user_message: message,
        follow_ups: None,
    };

    let mut rx = run_turn(state, input);

    let mut exit_code: i32 = 0;
    let mut collected_events: Vec<TurnEvent> = Vec::new();

    while let Some(event) = rx.recv().await {
        if json_output {
            collected_events.push(event);
            continue;
        }
        match &event {
            TurnEvent::Token { text } => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            TurnEvent::ToolCallStart { name, .. } => {
                eprintln!("\x1b[2m[tool: {name}]\x1b[0m");
            }
            TurnEvent::AssistantMessage { .. } => {
                println!();
            }
            TurnEvent::Error { message } => {
                eprintln!("error: {message}");
                exit_code = 1;
            }
            _ => {}
        }
    }

    if json_output {
        let json = serde_json::to_string_pretty(&collected_events).map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
