//! Line-oriented terminal front end over a `ChatSession`.

use crate::config::ThinkSetting;
use crate::models::{ChatMessage, Role};
use crate::session::ChatSession;
use crate::state::{ChatEvent, StreamOutcome};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use uuid::Uuid;

const HELP: &str = "\
Commands:
  <text>           send a message
  /retry           regenerate the last reply (or resend the last message)
  /edit <text>     resend the last user message with new text
  /prev, /next     browse earlier versions of the last reply
  /stop            stop the current reply (Ctrl-C also works)
  /new             start a new chat
  /models          list installed models
  /model <name>    switch model
  /think on|off|auto
  /quit";

// How much of each streaming message has been written to stdout already.
#[derive(Default)]
struct Printed {
    thinking: HashMap<Uuid, usize>,
    content: HashMap<Uuid, usize>,
}

pub async fn run(session: ChatSession) -> Result<()> {
    let renderer = tokio::spawn(render_events(session.subscribe()));
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if session.cancel().await.is_none() {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    session.cancel().await;
    renderer.abort();
    Ok(())
}

// Returns false when the user asked to quit.
async fn handle_line(session: &ChatSession, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let result = match command {
        "/quit" | "/exit" => return false,
        "/help" => {
            println!("{}", HELP);
            Ok(())
        }
        "/stop" => {
            session.cancel().await;
            Ok(())
        }
        "/new" => {
            session.clear_conversation().await;
            Ok(())
        }
        "/retry" => match last_message_id(session, None).await {
            Some(id) => session.retry(id).await.map(|_| ()),
            None => Ok(()),
        },
        "/edit" => match last_message_id(session, Some(Role::User)).await {
            Some(id) => session.retry_with_edit(id, argument).await.map(|_| ()),
            None => Ok(()),
        },
        "/prev" | "/next" => match last_message_id(session, Some(Role::Assistant)).await {
            Some(id) if command == "/prev" => session.previous_revision(id).await,
            Some(id) => session.next_revision(id).await,
            None => Ok(()),
        },
        "/models" => match session.provider().list_models().await {
            Ok(models) => {
                for model in models {
                    println!("  {} ({:.1} GB)", model.name, model.size as f64 / 1e9);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
        "/model" => {
            let model = argument.to_string();
            session.update_settings(|s| s.model = model).await;
            if let Err(e) = session.refresh_model_details().await {
                log::warn!("Could not read model details: {}", e);
            }
            Ok(())
        }
        "/think" => {
            let setting = match argument {
                "on" => Some(ThinkSetting::On),
                "off" => Some(ThinkSetting::Off),
                "auto" => Some(ThinkSetting::Auto),
                _ => None,
            };
            match setting {
                Some(setting) => session.update_settings(|s| s.think = setting).await,
                None => eprintln!("usage: /think on|off|auto"),
            }
            Ok(())
        }
        _ if command.starts_with('/') => {
            eprintln!("unknown command {}, try /help", command);
            Ok(())
        }
        _ => session.send_message(line).await.map(|_| ()),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
    }
    true
}

async fn last_message_id(session: &ChatSession, role: Option<Role>) -> Option<Uuid> {
    session
        .messages()
        .await
        .iter()
        .rev()
        .find(|m| role.map_or(true, |r| m.role == r))
        .map(|m| m.id)
}

async fn render_events(mut events: broadcast::Receiver<ChatEvent>) {
    let mut printed = Printed::default();
    loop {
        match events.recv().await {
            Ok(event) => render(&mut printed, event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Renderer skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(printed: &mut Printed, event: ChatEvent) {
    match event {
        ChatEvent::MessageAdded(message) if message.role == Role::Assistant => {
            println!("\n[{}]", message.role.as_str());
        }
        ChatEvent::MessageUpdated(message) if message.role == Role::Assistant => {
            if message.is_streaming {
                print_new_text(printed, &message);
            } else if !printed.content.contains_key(&message.id) {
                // Finished outside a live stream, e.g. browsing revisions.
                println!(
                    "\n[version {}/{}]\n{}",
                    message.current_revision_index + 1,
                    message.version_count(),
                    message.content
                );
            } else {
                print_new_text(printed, &message);
            }
        }
        ChatEvent::StreamFinished { message_id, outcome } => {
            printed.thinking.remove(&message_id);
            printed.content.remove(&message_id);
            match outcome {
                StreamOutcome::Completed => println!(),
                StreamOutcome::Stopped => println!("\n[stopped]"),
                StreamOutcome::Failed => println!("\n[failed]"),
            }
        }
        ChatEvent::Error { message, .. } => eprintln!("error: {}", message),
        ChatEvent::ConversationCleared => println!("[new chat]"),
        _ => {}
    }
    let _ = std::io::stdout().flush();
}

fn print_new_text(printed: &mut Printed, message: &ChatMessage) {
    let thinking = message.display_thinking();
    if let Some(thinking) = &thinking {
        let done = printed.thinking.entry(message.id).or_insert(0);
        if let Some(new) = thinking.get(*done..).filter(|s| !s.is_empty()) {
            print!("{}", new);
            *done = thinking.len();
        }
    }

    let content = message.display_content();
    let done = printed.content.entry(message.id).or_insert(0);
    if let Some(new) = content.get(*done..).filter(|s| !s.is_empty()) {
        if *done == 0 && thinking.is_some() {
            println!("\n---");
        }
        print!("{}", new);
        *done = content.len();
    }

    if !message.is_streaming {
        if let Some(tps) = message.tokens_per_second() {
            print!("\n({} tokens, {:.1} tokens/s)", message.eval_count.unwrap_or(0), tps);
        }
    }
}
