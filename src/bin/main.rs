//! Interactive terminal session with the agent router

use financial_agent_router::{agent::Orchestrator, models::TurnOutcome};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const HELP: &str = "Commands: /agent <name> pin an agent, /auto route automatically, \
/reset clear the conversation, /agents list agents, /quit exit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = Orchestrator::from_env()?;
    let session_id = format!("cli-{}", Uuid::new_v4());
    info!(session_id = %session_id, "Interactive session started");

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let mut pinned: Option<String> = None;
    let mut awaiting_answer = false;

    stdout
        .write_all(format!("Financial agent router. {}\n", HELP).as_bytes())
        .await?;

    loop {
        let prompt = match (&pinned, awaiting_answer) {
            (_, true) => "answer> ".to_string(),
            (Some(agent), false) => format!("[{}]> ", agent),
            (None, false) => "> ".to_string(),
        };
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let mut parts = input.splitn(2, ' ');
        match parts.next().unwrap_or_default() {
            "/quit" | "/exit" => break,
            "/help" => {
                stdout.write_all(format!("{}\n", HELP).as_bytes()).await?;
                continue;
            }
            "/agents" => {
                let mut listing = String::new();
                for agent in orchestrator.agents().iter() {
                    listing.push_str(&format!("  {:<18} {}\n", agent.name, agent.description));
                }
                stdout.write_all(listing.as_bytes()).await?;
                continue;
            }
            "/agent" => {
                let name = parts.next().unwrap_or_default().trim();
                if orchestrator.agents().contains(name) {
                    pinned = Some(name.to_string());
                    stdout
                        .write_all(format!("Pinned to {}\n", name).as_bytes())
                        .await?;
                } else {
                    stdout
                        .write_all(format!("Unknown agent '{}'. Try /agents\n", name).as_bytes())
                        .await?;
                }
                continue;
            }
            "/auto" => {
                pinned = None;
                stdout.write_all(b"Automatic routing\n").await?;
                continue;
            }
            "/reset" => {
                orchestrator.reset(&session_id).await?;
                awaiting_answer = false;
                stdout.write_all(b"Conversation cleared\n").await?;
                continue;
            }
            _ => {}
        }

        // a pending prompt takes the line as its answer; a late answer is a new request
        let result = orchestrator
            .submit(&session_id, input, pinned.as_deref(), false)
            .await;

        let output = match result {
            Ok(TurnOutcome::FinalAnswer { agent, answer }) => {
                awaiting_answer = false;
                format!("\n[{}]\n{}\n\n", agent, answer)
            }
            Ok(TurnOutcome::Elicitation { agent, prompt }) => {
                awaiting_answer = true;
                format!("\n[{} needs input] {}\n", agent, prompt)
            }
            Err(e) => {
                awaiting_answer = false;
                format!("Error ({}): {}\n", e.kind(), e)
            }
        };
        stdout.write_all(output.as_bytes()).await?;
    }

    Ok(())
}
