//! Config command - configuration management.

use anyhow::Result;
use clap::{Args, Subcommand};

use super::{Context, format_duration};

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration
    Show,

    /// Show which config files are loaded and their precedence
    Which,

    /// Initialize a config file with defaults
    Init {
        /// Create project-local config (./tether.toml) instead of user config
        #[arg(long)]
        local: bool,
    },

    /// Show configuration file path
    Path,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Which => cmd_which(),
        ConfigCommand::Init { local } => cmd_init(local),
        ConfigCommand::Path => cmd_path(),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    if ctx.json_output {
        let value = serde_json::json!({
            "toml": ctx.config.to_toml()?,
            "api_base": ctx.api_base.clone().unwrap_or_else(|| ctx.config.api().effective_base_url()),
            "store": ctx.config.storage().effective_dir().display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let settings = tether_session::SessionSettings::from(&ctx.config);
    let api = ctx.config.api();

    println!("# Tether Configuration\n");
    println!("[api]");
    println!(
        "  base_url         = {}",
        ctx.api_base.as_deref().unwrap_or(&settings.api_base)
    );
    if let Some(url) = &api.runtime_config_url {
        println!("  runtime_config   = {}", url);
    }
    println!("  login            = {}", settings.login_endpoint);
    println!("  refresh          = {}", settings.refresh_endpoint);
    println!("  logout           = {}", settings.logout_endpoint);
    println!("  timeout          = {}", format_duration(settings.request_timeout));
    println!();
    println!("[session]");
    println!("  idle_timeout     = {}", format_duration(settings.idle_timeout));
    println!("  default_session  = {}", format_duration(settings.default_session));
    println!("  refresh_before   = {}", format_duration(settings.refresh_lookahead));
    println!("  refresh_retry    = {}", format_duration(settings.refresh_retry));
    println!();
    println!("[retry]");
    println!("  max_retries      = {}", settings.retry.max_retries);
    println!("  base_delay       = {:?}", settings.retry.base_delay);
    println!("  max_delay        = {:?}", settings.retry.max_delay);
    println!();
    println!("[cache]");
    println!("  enabled          = {}", settings.cache_enabled);
    println!("  ttl              = {}", format_duration(settings.cache_ttl));
    println!();
    println!("[storage]");
    println!(
        "  dir              = {}",
        ctx.config.storage().effective_dir().display()
    );
    println!("  watch            = {}", ctx.config.storage().watch);
    Ok(())
}

fn cmd_which() -> Result<()> {
    let loaded = tether_config::load_config();

    println!("Config file search order (later overrides earlier):\n");
    for source in &loaded.sources {
        let status = if source.loaded {
            "✓ loaded"
        } else {
            "· not found"
        };
        println!("  {} {}", status, source.path.display());
    }

    println!();
    let loaded_count = loaded.loaded_from().len();
    if loaded_count == 0 {
        println!("No config files found. Run 'tether config init' to create one.");
    } else {
        println!("{} config file(s) loaded.", loaded_count);
    }
    Ok(())
}

fn cmd_init(local: bool) -> Result<()> {
    let path = if local {
        std::path::PathBuf::from("tether.toml")
    } else {
        tether_config::user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
    };

    if path.exists() {
        println!("Config file already exists: {}", path.display());
        return Ok(());
    }

    tether_config::save_config(&tether_config::TetherConfig::default_template(), &path)?;
    println!("Created {}", path.display());
    Ok(())
}

fn cmd_path() -> Result<()> {
    if let Some(path) = tether_config::user_config_path() {
        println!("{}", path.display());
    } else {
        eprintln!("Could not determine config directory");
    }
    Ok(())
}
