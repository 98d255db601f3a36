use anyhow::Result;
use charla::{
    config::{ConfigManager, EnvConfigManager},
    flow::{
        ConversationState, EngineMessages, FlowManager, InMemoryStateStore, InputKind, StateStore,
        catalog::{MENU_FLOW, STORES_SOURCE, StoreDirectory, register_builtin_flows},
        loader::{FlowLoader, watch_flow_dir},
    },
    flow_commands::{deploy_flow_file, validate_flow_file},
    logger::{FileTelemetry, init_tracing},
    message::MessageContent,
    schema::write_schema,
};
use clap::{Args, Parser, Subcommand};
use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
    process,
    sync::Arc,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

const DEFAULT_SESSION_TTL_SECS: u64 = 1800;

/// Conversation id used for the local console session. A channel adapter
/// would use the sender's phone number here.
const CONSOLE_USER: &str = "console";

#[derive(Parser, Debug)]
#[command(
    name = "charla",
    about = "Conversation flow engine for a WhatsApp support line",
    version = "0.3.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine with a console conversation
    Run(RunArgs),

    /// Emit JSON Schemas into `<root>/schemas`
    Schema,

    /// Initialize a fresh layout
    Init,

    /// Manage flow definitions
    Flow(FlowArgs),

    /// Read and edit engine configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct FlowArgs {
    #[command(subcommand)]
    command: FlowCommands,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Seconds of inactivity before a conversation is dropped from memory.
    /// Falls back to CHARLA_SESSION_TTL, then 1800.
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum FlowCommands {
    /// Check that a definition file builds into a runnable flow
    Validate { file: PathBuf },
    /// Validate a definition and copy it into `<root>/flows`
    Deploy { file: PathBuf },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print one value
    Get { key: String },
    /// Store a value in `<root>/config/.env`
    Set { key: String, value: String },
    /// Remove a value
    Delete { key: String },
    /// List the engine's own entries
    List,
}

/// Resolve the charla root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("CHARLA_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./charla")
    }
}

/// The loader every entry point shares, with the lookups dynamic steps can
/// reference from their definitions.
fn engine_loader() -> FlowLoader {
    FlowLoader::new().with_source(STORES_SOURCE, StoreDirectory::sample())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        session_timeout: None,
        log_level: "info".to_string(),
    })) {
        Commands::Run(args) => {
            let root = resolve_root_dir();
            run(root, args.session_timeout, args.log_level).await
        }
        Commands::Schema => {
            let root = resolve_root_dir();
            let out_dir = root.join("schemas");
            write_schema(out_dir.clone())?;
            println!("Schemas written to {}", out_dir.display());
            Ok(())
        }
        Commands::Init => {
            let root = resolve_root_dir();
            init_layout(&root)?;
            println!("Initialized charla layout at {}", root.display());
            Ok(())
        }
        Commands::Flow(flow_args) => {
            let loader = engine_loader();
            match flow_args.command {
                FlowCommands::Validate { file } => validate_flow_file(file, &loader),
                FlowCommands::Deploy { file } => {
                    deploy_flow_file(file, resolve_root_dir(), &loader)
                }
            }
        }
        Commands::Config(config_args) => {
            let config = open_config(&resolve_root_dir());
            run_config_command(config_args.command, &config).await
        }
    }
}

/// Configuration store shared by `run` and the `config` subcommands.
fn open_config(root: &Path) -> ConfigManager {
    ConfigManager(EnvConfigManager::new(root.join("config").join(".env")))
}

/// Keys the engine owns. `config list` hides the rest of the process
/// environment behind this prefix.
const CONFIG_PREFIX: &str = "CHARLA_";

async fn run_config_command(command: ConfigCommands, config: &ConfigManager) -> Result<()> {
    match command {
        ConfigCommands::Get { key } => {
            match config.get(&key).await {
                Some(value) => println!("{value}"),
                None => eprintln!("❌ {key} is not set."),
            }
            Ok(())
        }
        ConfigCommands::Set { key, value } => {
            match config.0.set(&key, &value).await {
                Ok(_) => println!("✅ {key} set."),
                Err(e) => eprintln!("❌ Could not store {key}: {e}"),
            }
            Ok(())
        }
        ConfigCommands::Delete { key } => {
            config.0.del(&key).await;
            println!("✅ {key} removed.");
            Ok(())
        }
        ConfigCommands::List => {
            let mut entries: Vec<(String, String)> = config
                .0
                .as_vec()
                .await
                .into_iter()
                .filter(|(key, _)| key.starts_with(CONFIG_PREFIX))
                .collect();
            entries.sort();
            for (key, value) in entries {
                println!("{key}={value}");
            }
            Ok(())
        }
    }
}

/// Create the on-disk layout: config, flow definitions, logs and schemas.
/// Drops in a starter stores flow so the dynamic loader has something to
/// serve on first run.
fn init_layout(root: &Path) -> Result<()> {
    for sub in ["config", "flows", "logs", "schemas"] {
        fs::create_dir_all(root.join(sub))?;
    }

    let env_file = root.join("config").join(".env");
    if !env_file.exists() {
        fs::write(
            &env_file,
            "# charla engine configuration\nCHARLA_SESSION_TTL=1800\n\n# Engine text overrides, read on the next run\n# CHARLA_MSG_COMPLETION=¡Gracias por escribirnos!\n# CHARLA_MSG_HANDOFF=Un agente te escribe en breve.\n",
        )?;
    }

    let stores = root.join("flows").join("stores.yaml");
    if !stores.exists() {
        fs::write(&stores, include_str!("../flows/stores.yaml"))?;
    }

    Ok(())
}

/// Session TTL precedence: CLI flag, then CHARLA_SESSION_TTL, then the
/// built-in default.
async fn resolve_session_ttl(config: &ConfigManager, flag: Option<u64>) -> u64 {
    match flag {
        Some(secs) => secs,
        None => config
            .get("CHARLA_SESSION_TTL")
            .await
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_SESSION_TTL_SECS),
    }
}

/// Engine fallback texts, with per-deployment overrides taken from
/// configuration.
async fn engine_messages(config: &ConfigManager) -> EngineMessages {
    let mut messages = EngineMessages::default();
    if let Some(text) = config.get("CHARLA_MSG_COMPLETION").await {
        messages.completion = text;
    }
    if let Some(text) = config.get("CHARLA_MSG_HANDOFF").await {
        messages.handoff = text;
    }
    if let Some(text) = config.get("CHARLA_MSG_CANCELLED").await {
        messages.cancelled = text;
    }
    if let Some(text) = config.get("CHARLA_MSG_INVALID").await {
        messages.invalid_input = text;
    }
    messages
}

async fn run(root: PathBuf, session_timeout: Option<u64>, log_level: String) -> Result<()> {
    let flows_dir = root.join("flows");
    let log_file = "logs/charla.log".to_string();
    let event_file = "logs/charla-events.json".to_string();

    let telemetry = init_tracing(root.clone(), log_file, event_file, log_level)?;

    info!("Charla engine starting up");

    let config = open_config(&root);
    let session_ttl = resolve_session_ttl(&config, session_timeout).await;

    let manager = FlowManager::with_messages(engine_messages(&config).await);
    register_builtin_flows(&manager)?;

    let loader = Arc::new(engine_loader());
    let watcher = watch_flow_dir(loader, manager.clone(), flows_dir.clone()).await?;
    if fs::read_dir(&flows_dir)?.next().is_none() {
        info!(
            "no flow definitions under {}; run `charla init` for the starter pack",
            flows_dir.display()
        );
    }

    let store: StateStore = InMemoryStateStore::new(session_ttl);

    println!("\ncharla {} listo.", env!("CARGO_PKG_VERSION"));
    println!("Escribí *menú* para volver al inicio. Ctrl-C para salir.");
    info!("Charla engine running; press Ctrl-C to exit");

    converse(&telemetry, &manager, &store, CONSOLE_USER).await?;

    println!("\nCerrando...");
    info!("Charla engine shutting down");
    watcher.shutdown();

    process::exit(0);
}

/// Console conversation loop. Stands in for a channel adapter: it owns the
/// transport (stdin/stdout), keeps per-conversation state in the store and
/// maps typed input onto the reply kinds a chat channel would deliver.
async fn converse(
    telemetry: &FileTelemetry,
    manager: &Arc<FlowManager>,
    store: &StateStore,
    recipient: &str,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_content = greet(manager, store, recipient).await?;

    loop {
        prompt();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }

                let state = store
                    .load(recipient)
                    .await
                    .unwrap_or_else(ConversationState::inactive);

                if FlowManager::is_cancel_command(input) && state.is_in_flow() {
                    let cancelled = manager.cancel_flow(recipient);
                    print_message(cancelled.content());
                    store.clear(recipient).await;
                    last_content = greet(manager, store, recipient).await?;
                    continue;
                }

                if !manager.has_active_flow(&state) {
                    store.clear(recipient).await;
                    last_content = greet(manager, store, recipient).await?;
                    continue;
                }

                let (kind, reply) = classify_reply(input, last_content.as_ref());
                let turn = telemetry
                    .instrument_turn("process_input", || {
                        manager.process_input(&state, &reply, kind, recipient)
                    })
                    .await;
                match turn {
                    Ok(Some(turn)) => {
                        print_message(turn.message.content());
                        if turn.transfer_to_agent {
                            info!("conversation handed off to an agent");
                        }
                        if turn.completed {
                            store.clear(recipient).await;
                            last_content = None;
                        } else {
                            store.save(recipient, turn.state).await;
                            last_content = Some(turn.message.into_content());
                        }
                    }
                    Ok(None) => {
                        // Broken or outdated state. Start over from the menu.
                        store.clear(recipient).await;
                        last_content = greet(manager, store, recipient).await?;
                    }
                    Err(err) => {
                        error!("turn failed: {:#}", err);
                        println!("\nTuvimos un problema técnico. Probá de nuevo en un rato.");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Start (or restart) the entry menu and remember what was shown.
async fn greet(
    manager: &Arc<FlowManager>,
    store: &StateStore,
    recipient: &str,
) -> Result<Option<MessageContent>> {
    let Some(turn) = manager.start_flow(MENU_FLOW, recipient).await? else {
        return Ok(None);
    };
    print_message(turn.message.content());
    store.save(recipient, turn.state).await;
    Ok(Some(turn.message.into_content()))
}

/// Map console text onto the reply kinds a chat channel would send. Typing
/// the number, id, or title of a visible button or row counts as tapping it.
fn classify_reply(input: &str, last: Option<&MessageContent>) -> (InputKind, String) {
    match last {
        Some(MessageContent::Buttons(content)) => {
            let options = content
                .buttons
                .iter()
                .map(|button| (button.id.as_str(), button.title.as_str()));
            match match_option(input, options) {
                Some(id) => (InputKind::ButtonReply, id),
                None => (InputKind::Text, input.to_string()),
            }
        }
        Some(MessageContent::List(content)) => {
            let rows = content
                .sections
                .iter()
                .flat_map(|section| section.rows.iter())
                .map(|row| (row.id.as_str(), row.title.as_str()));
            match match_option(input, rows) {
                Some(id) => (InputKind::ListReply, id),
                None => (InputKind::Text, input.to_string()),
            }
        }
        _ => (InputKind::Text, input.to_string()),
    }
}

fn match_option<'a>(
    input: &str,
    options: impl Iterator<Item = (&'a str, &'a str)>,
) -> Option<String> {
    let wanted = input.trim();
    let position: Option<usize> = wanted.parse().ok();
    for (index, (id, title)) in options.enumerate() {
        if position == Some(index + 1)
            || wanted.eq_ignore_ascii_case(id)
            || wanted.eq_ignore_ascii_case(title)
        {
            return Some(id.to_string());
        }
    }
    None
}

fn print_message(content: &MessageContent) {
    println!();
    match content {
        MessageContent::Text(body) => println!("{body}"),
        MessageContent::Buttons(buttons) => {
            if let Some(header) = &buttons.header {
                println!("{header}");
            }
            println!("{}", buttons.body);
            for (index, button) in buttons.buttons.iter().enumerate() {
                println!("  {}. {}", index + 1, button.title);
            }
            if let Some(footer) = &buttons.footer {
                println!("{footer}");
            }
        }
        MessageContent::List(list) => {
            if let Some(header) = &list.header {
                println!("{header}");
            }
            println!("{}", list.body);
            let mut position = 0;
            for section in &list.sections {
                println!("[{}]", section.title);
                for row in &section.rows {
                    position += 1;
                    match &row.description {
                        Some(description) => {
                            println!("  {}. {} ({})", position, row.title, description)
                        }
                        None => println!("  {}. {}", position, row.title),
                    }
                }
            }
            if let Some(footer) = &list.footer {
                println!("{footer}");
            }
        }
    }
}

fn prompt() {
    print!("\n> ");
    let _ = std::io::stdout().flush();
}
