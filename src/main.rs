//! Agent Playbook - Entry Point
//!
//! Inspection CLI over the SQLite playbook store:
//! - show / prompt / history / stats: read-only views of one agent
//! - reflect: run one recorded trace through the learning loop

use agent_playbook::playbook::{self, format_for_prompt, ExecutionTrace, PlaybookState};
use agent_playbook::Config;
use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn print_help() {
    println!("Agent Playbook v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: agent-playbook <COMMAND> <agent_id> [ARGS]");
    println!();
    println!("Commands:");
    println!("  show <agent_id>                Entries with counts and confidence");
    println!("  prompt <agent_id>              Block injected into the system prompt");
    println!("  history <agent_id>             Stored versions");
    println!("  stats <agent_id>               Summary numbers (JSON)");
    println!("  reflect <agent_id> <trace>     Learn from a trace JSON file");
    println!();
    println!("Options:");
    println!("  --help, -h         Show this help");
    println!();
    println!("Environment variables:");
    println!("  PLAYBOOK_DB_PATH             SQLite database path");
    println!("  PLAYBOOK_NAMESPACE           Store namespace (default: playbooks)");
    println!("  PLAYBOOK_CONFIG_FILE         Per-agent settings (TOML)");
    println!("  PLAYBOOK_MODEL_TIMEOUT_SECS  Model call deadline (default: 5)");
    println!("  PLAYBOOK_QUEUE_CAPACITY      Pending traces per agent (default: 64)");
    println!("  PLAYBOOK_LOG_JSON            Log JSON lines to stderr when 1");
    println!("  OLLAMA_URL                   Ollama API URL");
    println!("  LLAMA_MODEL                  Reflection model");
    println!("  EMBEDDING_MODEL              Embedding model");
}

/// Filter from RUST_LOG directives (e.g. "agent_playbook=debug"); warn when
/// unset or unparsable
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn init_logging() -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").ok();
    let filter = || log_filter(directives.as_deref());

    let json = std::env::var("PLAYBOOK_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn print_entries(state: &PlaybookState) {
    println!(
        "{} v{} ({} entries, {} executions)",
        state.agent_id,
        state.version,
        state.entries.len(),
        state.total_executions
    );
    for entry in &state.entries {
        println!(
            "  {:<8} {:>4.0}%  +{:<3} -{:<3} {}",
            entry.category.as_str(),
            entry.confidence_score * 100.0,
            entry.helpful_count,
            entry.harmful_count,
            entry.content
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    init_logging()?;
    let config = Config::from_env()?;

    let command = args[0].as_str();
    let agent_id = args
        .get(1)
        .map(String::as_str)
        .with_context(|| format!("Missing <agent_id> for '{}'", command))?;

    match command {
        "show" => {
            let store = playbook::open_store(&config)?;
            print_entries(&store.get(agent_id).await?);
        }
        "prompt" => {
            let store = playbook::open_store(&config)?;
            let state = store.get(agent_id).await?;
            let limit = store.configs().for_agent(agent_id).max_playbook_entries_in_prompt;
            let block = format_for_prompt(&state.entries, limit);
            if block.is_empty() {
                println!("(no helpful or harmful entries for {})", agent_id);
            } else {
                println!("{}", block);
            }
        }
        "history" => {
            let store = playbook::open_store(&config)?;
            for version in store.history(agent_id).await? {
                if let Some(state) = store.get_version(agent_id, version).await? {
                    println!(
                        "v{:<5} {}  {} entries",
                        version,
                        state.updated_at.format("%Y-%m-%d %H:%M:%S"),
                        state.entries.len()
                    );
                }
            }
        }
        "stats" => {
            let store = playbook::open_store(&config)?;
            let stats = store.stats(agent_id).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "reflect" => {
            let path = args.get(2).context("Missing <trace> file for 'reflect'")?;
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read trace {}", path))?;
            let mut trace: ExecutionTrace =
                serde_json::from_str(&raw).with_context(|| format!("Invalid trace {}", path))?;
            trace.agent_id = agent_id.to_string();

            let middleware = playbook::middleware_from_config(&config).await?;
            info!("Reflecting on trace {} for {}", trace.trace_id, agent_id);
            let outcome = middleware.queue().pipeline().process(&trace).await;
            println!("{:?}", outcome);
        }
        other => bail!("Unknown command '{}'. Try --help", other),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_from_directives() {
        assert_eq!(log_filter(None).to_string(), "warn");
        assert_eq!(log_filter(Some("debug")).to_string(), "debug");
        assert_eq!(
            log_filter(Some("agent_playbook=debug")).to_string(),
            "agent_playbook=debug"
        );
        assert_eq!(log_filter(Some("agent_playbook=loud")).to_string(), "warn");
    }
}
