use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clawline::args::CommonArgs;
use clawline::host::{RecordingHost, TelegramHost};
use clawline::manager::{CallMode, CallOptions};
use clawline::runtime::VoiceRuntime;
use clawline::{logging, manager};
use std::sync::Arc;

// ── Top-level CLI ───────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "clawline",
    version,
    about = "clawline — telephony voice-call bridge",
    long_about = "clawline — originate and receive phone calls through a carrier, bridge the\n\
                  audio to a realtime speech model, and deliver structured call outcomes.\n\n\
                  Every subcommand prints a JSON document to stdout and exits non-zero on error."
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Serve,

    /// Place an outbound call
    Call(CallArgs),

    /// Speak a follow-up message into a call and return the transcript
    #[command(name = "continue")]
    Continue(ContinueArgs),

    /// Speak text into a call
    Speak(ContinueArgs),

    /// Hang up a call
    End(EndArgs),

    /// Show live calls and recent history
    Status(StatusArgs),

    /// Print recent call records from the history log
    Tail(StatusArgs),

    /// Resolve and print the public URL
    Expose,
}

#[derive(Debug, Args)]
struct CallArgs {
    /// E.164 destination number
    to: String,
    /// Natural-language task for the call
    #[arg(long)]
    prompt: String,
    /// Originating chat-session key (enables outcome delivery)
    #[arg(long)]
    session_key: Option<String>,
    /// notify | conversation
    #[arg(long, default_value = "notify")]
    mode: String,
    #[arg(long)]
    objective: Option<String>,
    #[arg(long)]
    context: Option<String>,
    #[arg(long)]
    language: Option<String>,
    /// Delivery target override, e.g. telegram:12345
    #[arg(long)]
    message_to: Option<String>,
    /// Stay up until the call reaches a terminal state
    #[arg(long)]
    wait: bool,
}

#[derive(Debug, Args)]
struct ContinueArgs {
    call_id: String,
    message: String,
}

#[derive(Debug, Args)]
struct EndArgs {
    call_id: String,
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Max records to print
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn host_runtime() -> Arc<dyn clawline::host::HostRuntime> {
    match std::env::var("TELEGRAM_BOT_TOKEN") {
        Ok(token) if !token.trim().is_empty() => {
            let enqueue_url = std::env::var("CLAWLINE_ENQUEUE_URL").ok();
            Arc::new(TelegramHost::new(token, enqueue_url))
        }
        _ => Arc::new(RecordingHost::new()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("serialization error: {}", e),
    }
}

fn exit_err(message: impl std::fmt::Display) -> ! {
    print_json(&serde_json::json!({ "success": false, "error": message.to_string() }));
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();
    let cli = Cli::parse();

    let config = match cli.common.load_config() {
        Ok(config) => config,
        Err(e) => exit_err(e),
    };

    match cli.command {
        Commands::Tail(args) => {
            // History is read straight off the log; no runtime needed.
            let mut records = manager::read_history(&config.history_path);
            records.sort_by_key(|r| std::cmp::Reverse(r.ended_at.unwrap_or(r.started_at)));
            records.truncate(args.limit);
            print_json(&records);
            return Ok(());
        }
        command => {
            let runtime = match VoiceRuntime::start(config, host_runtime(), None).await {
                Ok(runtime) => runtime,
                Err(e) => exit_err(e),
            };
            let failed = run_command(&runtime, command).await;
            runtime.stop().await;
            if failed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Execute one verb against the runtime. Returns true when the command
/// failed and the process should exit non-zero.
async fn run_command(runtime: &VoiceRuntime, command: Commands) -> bool {
    let manager = runtime.manager();
    match command {
        Commands::Serve => {
            print_json(&serde_json::json!({
                "success": true,
                "publicUrl": runtime.public_url(),
                "webhookPath": runtime.config().serve.path,
                "streamPath": runtime.config().streaming.stream_path,
            }));
            let _ = tokio::signal::ctrl_c().await;
            false
        }
        Commands::Call(args) => {
            let mode = match args.mode.as_str() {
                "conversation" => CallMode::Conversation,
                _ => CallMode::Notify,
            };
            let outcome = manager
                .initiate_call(
                    &args.to,
                    args.session_key.as_deref(),
                    CallOptions {
                        prompt: args.prompt,
                        objective: args.objective,
                        context: args.context,
                        language: args.language,
                        mode,
                        message_to: args.message_to,
                    },
                )
                .await;
            let failed = !outcome.success;
            if args.wait {
                if let Some(call_id) = &outcome.call_id {
                    let record = wait_for_terminal(&manager, call_id).await;
                    print_json(&record);
                    return failed;
                }
            }
            print_json(&outcome);
            failed
        }
        Commands::Continue(args) => {
            let outcome = manager.continue_call(&args.call_id, &args.message).await;
            let failed = !outcome.success;
            print_json(&outcome);
            failed
        }
        Commands::Speak(args) => {
            let outcome = manager.speak(&args.call_id, &args.message).await;
            let failed = !outcome.success;
            print_json(&outcome);
            failed
        }
        Commands::End(args) => {
            let outcome = manager.end_call(&args.call_id).await;
            let failed = !outcome.success;
            print_json(&outcome);
            failed
        }
        Commands::Status(args) => {
            let records = manager.get_call_history(args.limit);
            print_json(&serde_json::json!({
                "success": true,
                "provider": runtime.adapter().name(),
                "publicUrl": runtime.public_url(),
                "calls": records,
            }));
            false
        }
        Commands::Expose => {
            print_json(&serde_json::json!({
                "success": true,
                "publicUrl": runtime.public_url(),
            }));
            false
        }
        Commands::Tail(_) => unreachable!("tail handled before runtime start"),
    }
}

async fn wait_for_terminal(
    manager: &Arc<clawline::CallManager>,
    call_id: &str,
) -> Option<clawline::CallRecord> {
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        match manager.get_call(call_id) {
            Some(record) if record.state.is_terminal() => return Some(record),
            Some(_) => continue,
            None => {
                // Already swept into history by the outcome pipeline.
                return manager
                    .get_call_history(50)
                    .into_iter()
                    .find(|r| r.call_id == call_id);
            }
        }
    }
}
