use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use elevenbot::config::Config;
use elevenbot::detector::TemplateLibrary;
use elevenbot::farmer::{FarmMode, Farmer};
use elevenbot::hotkeys::{self, HotkeyEvent};
use elevenbot::input::EnigoDriver;
use elevenbot::launcher::Launcher;
use elevenbot::screen::PrimaryMonitor;
use elevenbot::session::Session;
use elevenbot::state::{self, BotPhase, BotState};
use elevenbot::{api, logging};

/// Top Eleven ad farming bot for BlueStacks
#[derive(Parser, Debug)]
#[command(name = "elevenbot", version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.json", env = "ELEVENBOT_CONFIG")]
    config: PathBuf,

    /// Template library directory (overrides config)
    #[arg(long)]
    detection_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the emulator and open the game
    Launch,

    /// Farm greens by watching ads
    Farm {
        /// Watch ads from the player screen instead of the token pack
        #[arg(long)]
        player: bool,
        /// Number of farming rounds (overrides config)
        #[arg(long)]
        rounds: Option<u32>,
    },

    /// Launch the game, then farm
    Run {
        #[arg(long)]
        player: bool,
        #[arg(long)]
        rounds: Option<u32>,
    },

    /// Serve the HTTP control API
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Save a screenshot of the primary monitor
    Screenshot {
        /// File name without extension
        #[arg(long)]
        name: Option<String>,
    },

    /// Run detection on the current screen
    Detect {
        /// Only look for this class (repeatable)
        #[arg(long = "class")]
        classes: Vec<String>,
        /// Detection threshold (defaults to the configured confidence)
        #[arg(long)]
        threshold: Option<f32>,
        /// Save a screenshot with the detections boxed
        #[arg(long)]
        annotate: bool,
    },

    /// View or edit the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the configuration for invalid values
    Validate,
    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Set one key; the value is parsed as JSON, falling back to a string
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Config { action } = &cli.command {
        logging::init_console();
        return run_config_action(&cli.config, action);
    }

    let config = Config::from_file_and_env(&cli.config).context("failed to load configuration")?;
    logging::init(&config.log_dir).context("failed to initialise logging")?;

    tracing::info!("elevenbot starting, {config}");

    if matches!(cli.command, Command::Launch | Command::Farm { .. } | Command::Run { .. }) {
        config.validate().context("invalid configuration")?;
    } else if let Err(e) = config.validate() {
        tracing::warn!("{e}");
    }

    let library = load_library(&config, cli.detection_dir.as_deref());
    let input = EnigoDriver::new().context("failed to initialise input simulation")?;
    let session = Arc::new(Session::new(
        config.clone(),
        Arc::new(PrimaryMonitor),
        Arc::new(input),
        library,
    ));
    let state = state::new_state();

    if matches!(cli.command, Command::Farm { .. } | Command::Run { .. }) {
        session.require_detection()?;
    }

    match cli.command {
        Command::Launch => {
            start(&state, BotPhase::Launching, config.hotkeys_enabled).await?;
            let result = Launcher::new(session, state.clone()).launch_game().await;
            state::finish_task(&state, None).await;
            result.context("failed to launch the game")?;
        }
        Command::Farm { player, rounds } => {
            start(&state, BotPhase::Farming, config.hotkeys_enabled).await?;
            let rounds = rounds.unwrap_or(config.farming.rounds);
            let greens = Farmer::new(session, state.clone()).farm(mode(player), rounds).await;
            println!("collected {greens} green(s)");
            state::finish_task(&state, None).await;
        }
        Command::Run { player, rounds } => {
            start(&state, BotPhase::Launching, config.hotkeys_enabled).await?;
            Launcher::new(session.clone(), state.clone())
                .launch_game()
                .await
                .context("failed to launch the game")?;

            {
                let mut s = state.lock().await;
                match s.phase {
                    BotPhase::Launching => s.phase = BotPhase::Farming,
                    BotPhase::Paused => s.resume_phase = BotPhase::Farming,
                    _ => {
                        tracing::info!("stopped after launch");
                        return Ok(());
                    }
                }
            }

            let rounds = rounds.unwrap_or(config.farming.rounds);
            let greens = Farmer::new(session, state.clone()).farm(mode(player), rounds).await;
            println!("collected {greens} green(s)");
            state::finish_task(&state, None).await;
        }
        Command::Serve { listen } => {
            let listen_addr = listen.unwrap_or_else(|| config.listen_addr.clone());
            if config.hotkeys_enabled {
                spawn_hotkeys(state.clone());
            }

            let app = api::router(state, session).layer(TraceLayer::new_for_http());

            let listener = TcpListener::bind(&listen_addr)
                .await
                .context(format!("failed to bind to {listen_addr}"))?;

            tracing::info!("listening on {listen_addr}");

            axum::serve(listener, app).await.context("server error")?;
        }
        Command::Screenshot { name } => {
            let path = session.save_screenshot(name.as_deref()).await?;
            println!("{}", path.display());
        }
        Command::Detect {
            classes,
            threshold,
            annotate,
        } => {
            session.require_detection()?;
            let classes: Vec<&str> = classes.iter().map(String::as_str).collect();
            let detections = if annotate {
                let (path, detections) = session.save_annotated(None, &classes, threshold).await?;
                println!("annotated screenshot: {}", path.display());
                detections
            } else {
                session.detect(&classes, threshold).await?
            };

            if detections.is_empty() {
                println!("no detections");
            }
            for d in detections {
                let c = d.center();
                println!("{:<20} {:.3} center=({}, {})", d.class_name, d.confidence, c.x, c.y);
            }
        }
        Command::Config { .. } => {}
    }

    Ok(())
}

fn mode(player: bool) -> FarmMode {
    if player { FarmMode::Player } else { FarmMode::Tokens }
}

async fn start(state: &BotState, phase: BotPhase, hotkeys_enabled: bool) -> Result<()> {
    if !state::begin(state, phase).await {
        bail!("another task is already running");
    }
    if hotkeys_enabled {
        spawn_hotkeys(state.clone());
    }
    Ok(())
}

/// Forward F2/F3 to the bot state.
fn spawn_hotkeys(state: BotState) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    hotkeys::spawn_listener(tx);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                HotkeyEvent::TogglePause => {
                    if state::toggle_pause(&state).await.is_none() {
                        tracing::info!("nothing to pause");
                    }
                }
                HotkeyEvent::Shutdown => {
                    tracing::info!("shutdown requested");
                    state::request_stop(&state).await;
                }
            }
        }
    });
}

fn load_library(config: &Config, cli_override: Option<&Path>) -> Option<TemplateLibrary> {
    let dir = config.resolve_detection_dir(cli_override)?;
    match TemplateLibrary::load(&dir, config.scale_down) {
        Ok(library) => Some(library),
        Err(e) => {
            tracing::error!("failed to load template library: {e}");
            None
        }
    }
}

fn run_config_action(path: &Path, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::from_file_and_env(path)?;
            println!("{config}");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Validate => {
            let config = Config::from_file_and_env(path)?;
            config.validate()?;
            println!("configuration is valid");
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            Config::default().save(path)?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(path)?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            let mut updates = serde_json::Map::new();
            updates.insert(key.clone(), value);

            let unknown = config.apply_updates(&updates)?;
            if !unknown.is_empty() {
                bail!("unknown configuration key: {}", unknown.join(", "));
            }
            config.save(path)?;
            println!("{key} updated");
        }
    }
    Ok(())
}
