use anyhow::{Context, Result};
use clap::Parser;
use halo_chat::ChatOrchestrator;
use halo_common::{ModelDescriptor, ModelFormat, Role, StopReason};
use halo_config::ConfigLoader;
use halo_runtime::native::{self, NativeEngine};
use halo_runtime::{AccelerationProbe, FixedAcceleration, GgufRuntime, ModelManager, NativeBackend};
use halo_store::{ChatStore, MemoryStore, ModelStore};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
Commands:
  /new                 start a new chat
  /sessions            list chats
  /switch <id>         switch to a chat
  /delete <id>         delete a chat
  /system <text>       set the system prompt
  /temp <value>        set the temperature
  /max <tokens>        set max tokens per reply
  /threads <n>         change thread count (needs /confirm)
  /ctx <tokens>        change context length (needs /confirm)
  /reset               restore default settings (needs /confirm)
  /auto                derive settings from the model (needs /confirm)
  /confirm             apply the pending change and reload
  /cancel              discard the pending change
  /stats               show generation statistics
  /quit                exit
Ctrl-C stops a reply in progress.";

/// Terminal chat over a local model
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model file to load; defaults to models.default_model
    model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = ConfigLoader::load(args.config.as_ref())?;

    let acceleration: Arc<dyn AccelerationProbe> = Arc::new(FixedAcceleration::from_config(
        config.runtime.acceleration.as_deref(),
    ));

    let mut manager = ModelManager::new();
    match native::default_backend() {
        Some(backend) => {
            info!(backend = backend.name(), "Using native backend");
            let engine = Arc::new(NativeEngine::new(backend));
            manager = manager.register(
                ModelFormat::NativeQuantized,
                Arc::new(GgufRuntime::new(engine, acceleration.clone())),
            );
        }
        None => warn!("No native backend compiled in; rebuild with --features llama"),
    }
    let manager = Arc::new(manager);

    let store = Arc::new(MemoryStore::new());
    let orchestrator = ChatOrchestrator::new(
        manager,
        store.clone(),
        store.clone(),
        config.generation.clone(),
        config.chat.clone(),
    );

    let model_path = args
        .model
        .or_else(|| config.models.default_model.clone())
        .map(|path| config.model_path(&path.to_string_lossy()))
        .context("No model given and models.default_model is not configured")?;
    let model = ModelDescriptor::from_local_file(model_path);
    info!(model = %model.name, format = %model.format, "Registered model");
    store.insert_model(model).await?;
    orchestrator.select_default_model().await?;

    orchestrator.create_session().await?;
    println!("halo-chat: type a message, /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            match run_command(&orchestrator, store.as_ref(), command).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    println!("error: {}", e);
                    continue;
                }
            }
        }

        match orchestrator.send(line).await {
            Ok(true) => print_reply(&orchestrator).await?,
            Ok(false) => {}
            Err(e) => println!("error: {}", e),
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

/// Returns false when the REPL should exit
async fn run_command(orchestrator: &ChatOrchestrator, store: &MemoryStore, command: &str) -> Result<bool> {
    let (name, arg) = command
        .split_once(' ')
        .map(|(name, arg)| (name, arg.trim()))
        .unwrap_or((command, ""));

    match name {
        "quit" | "exit" => return Ok(false),
        "help" => println!("{}", HELP),
        "new" => println!("chat {}", orchestrator.create_session().await?),
        "sessions" => {
            let current = orchestrator.current_session();
            for session in store.sessions().await? {
                let marker = if session.session_id == current { "*" } else { " " };
                println!("{} {}  {}", marker, session.session_id, session.title);
            }
        }
        "switch" => orchestrator.switch_session(arg),
        "delete" => orchestrator.delete_session(arg).await?,
        "system" => orchestrator.set_system_prompt(arg),
        "temp" => orchestrator.set_temperature(arg.parse()?)?,
        "max" => orchestrator.set_max_tokens(arg.parse()?)?,
        "threads" => {
            orchestrator.update_threads(arg.parse()?);
            println!("thread change pending, /confirm to reload the model");
        }
        "ctx" => {
            orchestrator.update_context_length(arg.parse()?);
            println!("context change pending, /confirm to reload the model");
        }
        "reset" => {
            orchestrator.reset_settings();
            println!("reset pending, /confirm to reload the model");
        }
        "auto" => {
            let model = orchestrator.selected_model().context("no model selected")?;
            if orchestrator.auto_configure(&model).await? {
                println!("settings derived from the model, /confirm to reload");
            } else {
                println!("this model cannot be probed");
            }
        }
        "confirm" => {
            if orchestrator.confirm_reload().await? {
                let settings = orchestrator.settings();
                println!(
                    "applied: threads={} context={} max_tokens={}",
                    settings.threads, settings.context_length, settings.max_tokens
                );
            } else {
                println!("nothing pending");
            }
        }
        "cancel" => orchestrator.cancel_reload(),
        "stats" => {
            let snapshot = orchestrator.telemetry().snapshot().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        other => println!("unknown command /{}, try /help", other),
    }
    Ok(true)
}

/// Echo the reply as it streams, then the stored turn's stats
async fn print_reply(orchestrator: &ChatOrchestrator) -> Result<()> {
    let mut streamed = orchestrator.streamed_response();
    let mut printed = 0;
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = orchestrator.wait_for_generation() => break,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.stop_generation().await;
                interrupted = true;
                break;
            }
            changed = streamed.changed() => {
                if changed.is_err() {
                    break;
                }
                let text = streamed.borrow_and_update().clone();
                if text.len() > printed && text.is_char_boundary(printed) {
                    print!("{}", &text[printed..]);
                    std::io::stdout().flush()?;
                    printed = text.len();
                }
            }
        }
    }

    if interrupted {
        println!("\n[stopped]");
        return Ok(());
    }

    let messages = orchestrator.messages().await?;
    let Some(turn) = messages.last().filter(|turn| turn.role == Role::Assistant) else {
        println!();
        return Ok(());
    };

    match &turn.stats {
        Some(stats) if stats.stop_reason == StopReason::Error => println!("{}", turn.content),
        Some(stats) => {
            if turn.content.len() > printed && turn.content.is_char_boundary(printed) {
                print!("{}", &turn.content[printed..]);
            }
            println!(
                "\n[{} | {} tokens | {:.1}s | {:.1} tok/s]",
                stats.stop_reason.as_str(),
                stats.token_count,
                stats.response_time_ms as f32 / 1000.0,
                stats.tokens_per_second
            );
        }
        None => println!(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_accept_config_and_model() {
        let args = Args::try_parse_from(["halo-chat", "-c", "halo.json", "model.gguf"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("halo.json")));
        assert_eq!(args.model, Some(PathBuf::from("model.gguf")));

        let args = Args::try_parse_from(["halo-chat", "--config", "other.json"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("other.json")));
        assert!(args.model.is_none());
    }

    #[test]
    fn test_args_reject_unknown_options() {
        assert!(Args::try_parse_from(["halo-chat", "--verbose"]).is_err());
        assert!(Args::try_parse_from(["halo-chat", "--config"]).is_err());
    }
}
