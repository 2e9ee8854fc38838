use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use lib::coordination::ClaimRecord;
use lib::notify::{CloseReason, ConsoleSink, RowId, RowOutcome};
use lib::stream::{ContextStats, PlanStep};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, coordination directory).
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Interactive console for one conversation. Streams rounds, tool rows,
    /// and results as the backend pushes them.
    Chat {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Conversation id to join (default: a fresh one).
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,

        /// Model to request (default from config).
        #[arg(long, value_name = "NAME")]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            conversation,
            model,
        }) => {
            if let Err(e) = run_chat(config, conversation, model).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent()
            .unwrap_or(std::path::Path::new("."))
            .display()
    );
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    conversation: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, path) = lib::config::load_config(config_path)?;
    let backend = lib::backend::BackendClient::new(lib::config::resolve_backend_url(&config));
    let store = Arc::new(lib::coordination::FileStore::new(
        lib::config::resolve_coordination_dir(&config, &path),
    ));
    let conversation_id =
        conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let model = model.or(config.backend.default_model);

    log::info!(
        "conversation {} via {}",
        conversation_id,
        backend.base_url()
    );

    let sink: Arc<dyn ConsoleSink> = Arc::new(TerminalSink::default());
    let session = Arc::new(lib::console::ConsoleSession::new(
        backend,
        store,
        conversation_id,
        sink,
    ));

    // Ctrl-C ends the turn and gives the send claim back before exiting.
    let on_signal = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.stop().await;
            std::process::exit(130);
        }
    });

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        // Claims released by another process are only seen on re-check; the
        // file store's change events do not cross process boundaries.
        session.refresh_block().await;
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/stop") {
            session.stop().await;
            continue;
        }

        let request_id = format!("req-{}", uuid::Uuid::new_v4());
        match session.send(input, model.as_deref(), &request_id).await {
            Ok(()) => {
                // Let the turn's output finish before the next prompt.
                while session.is_active().await {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
            Err(e) => {
                log::debug!("send rejected: {}", e);
            }
        }
    }

    session.stop().await;
    Ok(())
}

/// Renders console notifications as plain terminal lines. Round headings are
/// printed lazily on first content, so empty rounds never show up.
#[derive(Default)]
struct TerminalSink {
    current_round: Mutex<Option<u64>>,
    midline: AtomicBool,
}

impl TerminalSink {
    fn heading(&self, round: u64) {
        let mut current = self.current_round.lock().unwrap();
        if *current != Some(round) {
            *current = Some(round);
            self.end_line();
            println!("--- Round {} ---", round);
        }
    }

    /// Terminate a pending delta line before printing a full line.
    fn end_line(&self) {
        if self.midline.swap(false, Ordering::SeqCst) {
            println!();
        }
    }
}

impl ConsoleSink for TerminalSink {
    fn round_closed(&self, round: u64, ok: bool) {
        if !ok {
            self.end_line();
            println!("  (round {} failed)", round);
        }
    }

    fn thinking(&self, round: u64, content: &str) {
        self.heading(round);
        self.end_line();
        println!("  ~ {}", content);
    }

    fn note_delta(&self, round: u64, delta: &str) {
        use std::io::Write;
        self.heading(round);
        print!("{}", delta);
        let _ = std::io::stdout().flush();
        self.midline.store(true, Ordering::SeqCst);
    }

    fn row_started(&self, _row: RowId, round: u64, tool: &str, args: Option<&str>) {
        self.heading(round);
        self.end_line();
        match args {
            Some(args) => println!("  > {} ({})", tool, args),
            None => println!("  > {}", tool),
        }
    }

    fn row_elapsed(&self, _row: RowId, _round: u64, tool: &str, seconds: f64) {
        log::debug!("{} running for {:.1}s", tool, seconds);
    }

    fn row_finished(&self, _row: RowId, round: u64, tool: &str, outcome: RowOutcome) {
        self.heading(round);
        self.end_line();
        match outcome {
            RowOutcome::Succeeded => println!("  > {} done", tool),
            RowOutcome::Failed => println!("  > {} failed", tool),
        }
    }

    fn round_info(&self, round: u64, message: &str) {
        self.heading(round);
        self.end_line();
        println!("  * {}", message);
    }

    fn artifacts_listed(&self, round: u64, files: &[String]) {
        self.heading(round);
        self.end_line();
        println!("  + files: {}", files.join(", "));
    }

    fn progress(&self, round: u64, message: &str, status: Option<&str>) {
        self.heading(round);
        self.end_line();
        println!("  [{}] {}", status.unwrap_or(".."), message);
    }

    fn plan_updated(&self, steps: &[PlanStep], summary: Option<&str>) {
        self.end_line();
        match summary {
            Some(summary) => println!("plan: {}", summary),
            None => println!("plan:"),
        }
        for step in steps {
            let marker = match step.status.as_deref() {
                Some("completed") | Some("done") => "x",
                Some("in_progress") => ">",
                _ => " ",
            };
            println!("  [{}] {}", marker, step.step);
        }
    }

    fn context_stats(&self, stats: &ContextStats) {
        self.end_line();
        match (stats.used_tokens, stats.max_tokens) {
            (Some(used), Some(max)) => println!("context: {}/{} tokens", used, max),
            (Some(used), None) => println!("context: {} tokens", used),
            _ => {}
        }
    }

    fn compression_started(&self, message: &str) {
        self.end_line();
        println!("* {}", message);
    }

    fn compression_finished(&self, message: &str) {
        self.end_line();
        println!("* {}", message);
    }

    fn final_result(&self, result: &str) {
        self.end_line();
        println!("< {}", result.trim());
    }

    fn stream_closed(&self, reason: &CloseReason) {
        self.end_line();
        *self.current_round.lock().unwrap() = None;
        match reason {
            CloseReason::Finished => {}
            CloseReason::Stopped => println!("(stopped)"),
            CloseReason::Transport(err) => println!("stream error: {}", err),
        }
    }

    fn send_blocked(&self, claim: &ClaimRecord) {
        self.end_line();
        let since = claim
            .issued_at()
            .map(|t| {
                format!(
                    ", since {}",
                    t.with_timezone(&chrono::Local).format("%H:%M:%S")
                )
            })
            .unwrap_or_default();
        println!(
            "input disabled: another console is sending ({}{})",
            claim.tab_id, since
        );
    }

    fn send_unblocked(&self) {
        self.end_line();
        println!("input re-enabled: the conversation is free again");
    }
}
