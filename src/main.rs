use std::{fs, path::PathBuf, process, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use delivery_plugin::{ConfigCategory, DeliveryPlugin, LogLevel};
use script_delivery::{
    config::{ConfigManager, EnvConfigManager, Settings},
    interpreter::InterpreterSession,
    logger::init_tracing,
    plugin::{ScriptDeliveryPlugin, plugin_info},
    schema::write_schema,
    watcher::{DirectoryWatcher, ScriptWatcher, WatchedType},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "script_delivery",
    about = "Deliver notifications through Rhai scripts",
    version
)]
struct Cli {
    /// `.env` file with SCRIPT_DELIVERY_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Log level override (trace, debug, info, warn, error, critical)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Write rolling log files here instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the plugin information as JSON
    Info,

    /// Emit JSON‐Schema for configuration categories
    Schema(SchemaArgs),

    /// Deliver a single notification and exit
    Deliver(DeliverArgs),

    /// Deliver every line read from stdin, reloading the script on change
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Output directory, defaults to `<data dir>/schemas`
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PluginArgs {
    /// Configuration category JSON file (item name → item)
    #[arg(long)]
    config: PathBuf,

    /// Category name reported in logs
    #[arg(long, default_value = "rhai")]
    name: String,
}

#[derive(Args, Debug)]
struct DeliverArgs {
    #[command(flatten)]
    plugin: PluginArgs,

    #[arg(long, default_value = "cli")]
    delivery: String,

    #[arg(long, default_value = "manual")]
    notification: String,

    #[arg(long, default_value = "triggered")]
    reason: String,

    /// The message handed to the script
    message: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    plugin: PluginArgs,

    /// Do not watch the scripts directory
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_mgr = ConfigManager(EnvConfigManager::new(cli.env_file.clone()));
    let mut settings = Settings::load(&config_mgr).await;
    if let Some(level) = cli.log_level {
        settings.log.log_level = level;
    }
    if let Some(dir) = cli.log_dir {
        settings.log.log_dir = Some(dir);
    }

    match cli.command {
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&plugin_info())?);
            Ok(())
        }
        Commands::Schema(args) => {
            let out_dir = args.out.unwrap_or_else(|| settings.data_dir.join("schemas"));
            let written = write_schema(&out_dir)?;
            println!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
        Commands::Deliver(args) => {
            let telemetry = init_tracing(&settings.log)?;
            let plugin = start_plugin(&args.plugin, &settings)?;
            let delivered = plugin.deliver(&args.delivery, &args.notification, &args.reason, &args.message);
            plugin.shutdown();
            if let Some(telemetry) = telemetry {
                telemetry.shutdown();
            }
            if !delivered {
                error!(notification = %args.notification, "delivery failed");
                process::exit(1);
            }
            println!("delivered");
            Ok(())
        }
        Commands::Run(args) => {
            let telemetry = init_tracing(&settings.log)?;
            let result = run(args, &settings).await;
            if let Some(telemetry) = telemetry {
                telemetry.shutdown();
            }
            result
        }
    }
}

fn start_plugin(args: &PluginArgs, settings: &Settings) -> anyhow::Result<ScriptDeliveryPlugin> {
    let json = fs::read_to_string(&args.config)
        .with_context(|| format!("reading configuration {}", args.config.display()))?;
    let category = ConfigCategory::from_json(&args.name, &json)?;
    let session = InterpreterSession::ensure_started(&args.name);
    Ok(ScriptDeliveryPlugin::with_session(&category, session, settings.scripts_dir())?)
}

async fn run(args: RunArgs, settings: &Settings) -> anyhow::Result<()> {
    let scripts_dir = settings.scripts_dir();
    if !scripts_dir.is_dir() {
        bail!(
            "scripts directory `{}` does not exist, set SCRIPT_DELIVERY_DATA or SCRIPT_DELIVERY_ROOT",
            scripts_dir.display()
        );
    }

    let plugin = Arc::new(start_plugin(&args.plugin, settings)?);
    let watcher = if args.no_watch {
        None
    } else {
        let watched: Arc<dyn WatchedType> = Arc::new(ScriptWatcher::new(Arc::clone(&plugin)));
        Some(DirectoryWatcher::new(scripts_dir, watched, false, false).await?)
    };

    info!(plugin = %plugin.name(), "reading notifications from stdin; Ctrl‐C to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(message) = line? else { break };
                if message.trim().is_empty() {
                    continue;
                }
                let worker = Arc::clone(&plugin);
                let delivered = tokio::task::spawn_blocking(move || {
                    worker.deliver("stdin", "stdin", "triggered", &message)
                })
                .await?;
                println!("{}", if delivered { "delivered" } else { "failed" });
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    plugin.shutdown();
    Ok(())
}
