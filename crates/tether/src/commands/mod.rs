//! CLI command handlers.

pub mod auth;
pub mod call;
pub mod config;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tether_config::TetherConfig;
use tether_session::{
    FileStorage, LogoutReason, Navigator, ReqwestTransport, SessionFacade, SessionSettings,
    resolve_api_base,
};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: TetherConfig,
    /// API base from the command line, if given.
    pub api_base: Option<String>,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// An open session over the on-disk store.
pub struct OpenSession {
    pub facade: SessionFacade,
    pub storage: FileStorage,
}

impl Context {
    /// Open the durable session store and build a facade over it.
    ///
    /// The API base comes from `--api-base`, then the runtime config
    /// document, then the configured base URL.
    pub async fn open_session(&self) -> Result<OpenSession> {
        let dir = self.config.storage().effective_dir();
        let storage = FileStorage::open(&dir)
            .with_context(|| format!("Failed to open session store at {}", dir.display()))?;

        let mut settings = SessionSettings::from(&self.config);
        let transport = Arc::new(ReqwestTransport::new(settings.request_timeout)?);

        settings.api_base = match &self.api_base {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => {
                let api = self.config.api();
                resolve_api_base(
                    transport.as_ref(),
                    api.runtime_config_url.as_deref(),
                    &settings.api_base,
                )
                .await
            }
        };
        tracing::debug!(api_base = %settings.api_base, store = %dir.display(), "Opening session");
        if self.verbose {
            eprintln!("API base: {}", settings.api_base);
            eprintln!("Session store: {}", dir.display());
        }

        let facade = SessionFacade::builder()
            .settings(settings)
            .storage(Arc::new(storage.clone()))
            .transport(transport)
            .navigator(Arc::new(TerminalNavigator))
            .build()?;

        Ok(OpenSession { facade, storage })
    }

    /// Debounce for storage notifications.
    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.config.storage().debounce_ms)
    }
}

/// Tells the user on stderr that they need to log in again.
pub struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn redirect_to_login(&self, reason: LogoutReason) {
        if reason == LogoutReason::UserInitiated {
            return;
        }
        eprintln!("Session ended ({}). Run 'tether auth login' to sign in again.", reason);
    }
}

/// Render a duration as `1h 02m 03s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Print a user-facing error for a failed session operation.
pub fn describe_error(err: &tether_session::Error) -> String {
    let mut out = err.to_string();
    for (field, messages) in err.field_errors() {
        out.push_str(&format!("\n  {}: {}", field, messages.join(", ")));
    }
    if err.is_retryable() {
        out.push_str("\n(the server may be temporarily unavailable; try again shortly)");
    }
    out
}
