//! Auth command - session management.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use super::{Context, describe_error, format_duration};

/// Arguments for the auth command.
#[derive(Args, Debug)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub command: AuthCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Log in and store the session
    Login {
        /// Account name
        #[arg(short, long)]
        username: Option<String>,

        /// Password (prompted when omitted)
        #[arg(long, env = "TETHER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Show the stored session
    Status,

    /// Rotate the stored token now
    Refresh,

    /// End the session here and in every other process sharing the store
    Logout,
}

/// Run the auth command.
pub async fn run(args: AuthArgs, ctx: &Context) -> Result<()> {
    match args.command {
        AuthCommand::Login { username, password } => cmd_login(username, password, ctx).await,
        AuthCommand::Status => cmd_status(ctx).await,
        AuthCommand::Refresh => cmd_refresh(ctx).await,
        AuthCommand::Logout => cmd_logout(ctx).await,
    }
}

async fn cmd_login(
    username: Option<String>,
    password: Option<String>,
    ctx: &Context,
) -> Result<()> {
    let username = match username {
        Some(u) => u,
        None => prompt("username> ")?,
    };
    if username.is_empty() {
        println!("No username provided, aborting.");
        return Ok(());
    }
    let password = match password {
        Some(p) => p,
        None => rpassword::prompt_password("password> ")?,
    };

    let session = ctx.open_session().await?;
    let credentials = json!({ "username": username, "password": password });
    let auth = session
        .facade
        .login(&credentials)
        .await
        .map_err(|e| anyhow::anyhow!("Login failed: {}", describe_error(&e)))?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&auth.user)?);
        return Ok(());
    }

    println!("Logged in as {}", auth.user.display_name());
    println!(
        "Session expires in {}",
        format_duration(session.facade.remaining_session_time())
    );
    Ok(())
}

async fn cmd_status(ctx: &Context) -> Result<()> {
    let session = ctx.open_session().await?;
    let facade = &session.facade;
    let stored = facade.session();
    let authenticated = facade.is_authenticated();
    let idle = facade.remaining_idle_time();

    if ctx.json_output {
        let status = json!({
            "authenticated": authenticated,
            "user": stored.as_ref().map(|s| &s.user),
            "expires_at": stored.as_ref().map(|s| s.expires_at.to_rfc3339()),
            "remaining_secs": facade.remaining_session_time().as_secs(),
            "idle_remaining_secs": idle.map(|d| d.as_secs()),
            "api_base": facade.settings().api_base,
            "store": session.storage.dir().display().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Session Status");
    println!("--------------");
    match stored {
        Some(s) if authenticated => {
            println!("Logged in: {}", s.user.display_name());
            if let Some(role) = &s.user.role {
                println!("  Role: {}", role);
            }
            println!(
                "  Expires: {} (in {})",
                s.expires_at.to_rfc3339(),
                format_duration(facade.remaining_session_time())
            );
            match idle {
                Some(left) => println!("  Idle timeout in: {}", format_duration(left)),
                None => println!("  Idle timeout in: (no activity recorded)"),
            }
        }
        Some(s) => {
            println!("Session for {} has expired.", s.user.display_name());
            println!("Run 'tether auth login' to sign in again.");
        }
        None => {
            println!("Not logged in.");
            println!("Run 'tether auth login' to sign in.");
        }
    }
    println!("API: {}", facade.settings().api_base);
    println!("Store: {}", session.storage.dir().display());
    Ok(())
}

async fn cmd_refresh(ctx: &Context) -> Result<()> {
    let session = ctx.open_session().await?;
    if session.facade.session().is_none() {
        anyhow::bail!("Not logged in. Run 'tether auth login' first.");
    }

    session
        .facade
        .refresh_now()
        .await
        .map_err(|e| anyhow::anyhow!("Refresh failed: {}", describe_error(&e)))?;
    println!(
        "Token refreshed (expires in {})",
        format_duration(session.facade.remaining_session_time())
    );
    Ok(())
}

async fn cmd_logout(ctx: &Context) -> Result<()> {
    let session = ctx.open_session().await?;
    if session.facade.session().is_none() {
        println!("Not logged in.");
        return Ok(());
    }
    session.facade.logout().await;
    println!("Logged out.");
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
