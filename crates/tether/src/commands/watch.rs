//! Watch command - keep the session alive in the foreground.

use anyhow::Result;
use clap::Args;
use tether_session::ScheduleDecision;

use super::{Context, format_duration};

/// Arguments for the watch command.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Do not follow logins and logouts made by other processes
    #[arg(long)]
    pub no_follow: bool,
}

/// Run the watch command.
///
/// Proactively refreshes the token, runs the activity heartbeat, and reports
/// every validity change until Ctrl-C.
pub async fn run(args: WatchArgs, ctx: &Context) -> Result<()> {
    let session = ctx.open_session().await?;
    let facade = &session.facade;

    if !args.no_follow && ctx.config.storage().watch {
        facade.watch_storage(&session.storage, ctx.watch_debounce())?;
        if let Some(dir) = facade.watched_dir() {
            println!("Following session changes in {}", dir.display());
        }
    }

    match facade.start_proactive_refresh() {
        Some(ScheduleDecision::Armed { fire_at }) => {
            println!("Next token refresh at {}", fire_at.to_rfc3339())
        }
        Some(ScheduleDecision::RefreshNow) => println!("Token is close to expiry; refreshing now"),
        Some(ScheduleDecision::Expired) => println!("Stored session has expired"),
        None => println!("Not logged in; waiting for a login from another process"),
    }

    let mut validity = facade.watch_validity();
    loop {
        tokio::select! {
            changed = validity.changed() => {
                if changed.is_err() {
                    break;
                }
                let valid = *validity.borrow_and_update();
                if valid {
                    let user = facade
                        .current_user()
                        .map(|u| u.display_name())
                        .unwrap_or_else(|| "unknown".to_string());
                    println!(
                        "Session active for {} (expires in {})",
                        user,
                        format_duration(facade.remaining_session_time())
                    );
                } else {
                    println!("Session ended");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    facade.stop_proactive_refresh();
    Ok(())
}
