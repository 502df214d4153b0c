//! `serialagent chat` — interactive REPL command.
//!
//! Opens a readline-based loop that sends each line to the agent and
//! streams the response back. Supports a handful of slash-commands for
//! session management.

use std::io::Write;
use std::sync::Arc;

use sa_domain::config::Config;

use crate::bootstrap;
use crate::runtime::{run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

/// Run the interactive chat REPL.
///
/// Boots the full runtime (including background tasks), then enters a
/// readline loop that accepts user input and streams agent responses to
/// stdout.
pub async fn chat(config: Arc<Config>, conversation: Option<String>) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config).await?;
    bootstrap::spawn_background_tasks(&state);

    let mut conversation_id = match conversation {
        Some(id) => id,
        None => state.store.create_conversation("New conversation")?.id,
    };

    let history_path = state.config.store.data_root.join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    eprintln!("SerialAgent interactive chat");
    eprintln!("Conversation: {conversation_id}  |  Type /help for commands, Ctrl+D to exit");
    eprintln!();

    loop {
        let readline = rl.readline("you> ");

        match readline {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                rl.add_history_entry(&line).ok();

                if trimmed.starts_with('/') {
                    if handle_slash_command(&state, trimmed, &mut conversation_id)? {
                        break;
                    }
                    continue;
                }

                if let Err(e) = send_message(&state, &conversation_id, trimmed).await {
                    eprintln!("\x1B[31merror: {e}\x1B[0m");
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Use Ctrl+D or /exit to quit)");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("\x1B[31mreadline error: {e}\x1B[0m");
                break;
            }
        }
    }

    rl.save_history(&history_path).ok();
    eprintln!("Goodbye!");
    Ok(())
}

/// Process a slash command. Returns `Ok(true)` if the REPL should exit.
fn handle_slash_command(state: &AppState, input: &str, conversation_id: &mut String) -> anyhow::Result<bool> {
    let parts: Vec<&str> = input.splitn(2, ' ').collect();
    let cmd = parts[0];
    let arg = parts.get(1).map(|s| s.trim());

    match cmd {
        "/exit" | "/quit" => return Ok(true),

        "/new" => {
            *conversation_id = state.store.create_conversation("New conversation")?.id;
            eprintln!("Started new conversation: {conversation_id}");
        }

        "/conversation" => {
            if let Some(id) = arg.filter(|s| !s.is_empty()) {
                if state.store.get_conversation(id)?.is_none() {
                    eprintln!("No such conversation: {id}");
                } else {
                    *conversation_id = id.to_string();
                    eprintln!("Switched to conversation: {conversation_id}");
                }
            } else {
                eprintln!("Current conversation: {conversation_id}");
                eprintln!("Usage: /conversation <id>");
            }
        }

        "/clear" => {
            eprint!("\x1B[2J\x1B[1;1H");
        }

        "/help" => {
            eprintln!("Commands:");
            eprintln!("  /new                 Start a fresh conversation");
            eprintln!("  /conversation <id>   Switch to an existing conversation");
            eprintln!("  /clear               Clear the screen");
            eprintln!("  /exit, /quit         Exit the chat");
            eprintln!("  /help                Show this help");
        }

        other => {
            eprintln!("Unknown command: {other}  (type /help for a list)");
        }
    }

    Ok(false)
}

/// Build a [`TurnInput`], call [`run_turn`], and stream events to stdout/stderr.
async fn send_message(state: &AppState, conversation_id: &str, user_message: &str) -> anyhow::Result<()> {
    let input = TurnInput {
        conversation_id: conversation_id.to_string(),
        user_message: user_message.to_string(),
        follow_ups: None,
    };

    let mut rx = run_turn(state.clone(), input);

    while let Some(event) = rx.recv().await {
        match &event {
            TurnEvent::Token { text } => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            TurnEvent::ToolCallStart { name, .. } => {
                eprintln!("\x1B[2m[tool: {name}]\x1B[0m");
            }
            TurnEvent::AssistantMessage { .. } => {
                println!();
                println!();
            }
            TurnEvent::Error { message } => {
                eprintln!("\x1B[31merror: {message}\x1B[0m");
            }
            _ => {}
        }
    }

    Ok(())
}
