//! Command execution.

use crate::Commands;
use colored::Colorize;
use rosbridge_client::{ActionGoal, CancelOptions, Client};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Publish { topic, message } => {
            let msg = parse_json_arg(&message)?;
            client.publish(&topic, msg).await?;
            Ok(format!("{} {}", "Published to".green(), topic.cyan()))
        }

        Commands::Echo {
            topic,
            msg_type,
            compression,
            count,
        } => {
            let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
            let callback = Arc::new(move |msg: &Value| {
                let _ = tx.send(msg.clone());
            });
            match compression {
                Some(compression) => {
                    client
                        .subscribe_with_compression(&topic, &msg_type, &compression, callback)
                        .await?
                }
                None => client.subscribe(&topic, &msg_type, callback).await?,
            }

            for _ in 0..count {
                match rx.recv().await {
                    Some(msg) => println!("{}", format_json(&msg)),
                    None => break,
                }
            }
            client.unsubscribe(&topic).await?;
            Ok(String::new())
        }

        Commands::Call {
            service,
            srv_type,
            args,
        } => {
            let args = parse_json_arg(&args)?;
            let values = client.call_service(&service, &srv_type, args).await?;
            Ok(format_json(&values))
        }

        Commands::Action {
            action,
            action_type,
            goal,
            session,
        } => {
            let goal_msg = parse_json_arg(&goal)?;
            let mut goal = ActionGoal::new(&action, &action_type, goal_msg).on_feedback(|feedback| {
                println!("{} {}", "feedback".yellow(), feedback);
            });
            if let Some(session) = session {
                goal = goal.with_session_id(session);
            }

            let handle = client.send_action_goal(goal).await?;
            println!("{} {}", "Goal sent:".green(), handle.id.cyan());
            let result = handle.completion().await?;
            Ok(format!("{}\n{}", "Result:".green(), format_json(&result)))
        }

        Commands::Cancel {
            action,
            action_type,
            session,
        } => {
            let mut options = CancelOptions::new();
            if let Some(session) = session {
                options = options.with_session_id(session);
            }
            let result = client.cancel_action_goal(&action, &action_type, options).await?;
            Ok(format!("{}\n{}", "Cancelled:".green(), format_json(&result)))
        }

        Commands::Exec { command } => {
            let output = client.run_cli_command(&command).await?;
            Ok(format_json(&output))
        }
    }
}

/// Parses a JSON argument, reading from a file when prefixed with `@`.
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
