//! Info command - create a session and show what the server granted

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use pushwire_client::{FieldValue, SessionListener, SessionManager};

use crate::config::MergedConfig;
use crate::output::OutputContext;

/// Listener for a session that is closed right after creation
struct Silent;

impl SessionListener for Silent {
    fn on_row_update(&self, _item: &str, _fields: &[FieldValue]) {}
    fn on_session_error(&self, _code: i32, _message: &str) {}
    fn on_stream_closed(&self) {}
    fn on_rebind_succeeded(&self) {}
}

pub async fn info(
    manager: &SessionManager,
    config: &MergedConfig,
    ctx: &OutputContext,
) -> Result<()> {
    let spinner = connecting_spinner(ctx, &config.client.endpoint.to_string());
    let created = manager
        .create(config.credentials.clone(), Arc::new(Silent))
        .await;
    spinner.finish_and_clear();
    let session = created.context("Failed to create session")?;

    let keepalive = session
        .keepalive
        .map(|d| format!("{} ms", d.as_millis()))
        .unwrap_or_else(|| "-".to_string());
    ctx.print_kv(&[
        ("Session", session.session_id.clone()),
        ("Server", config.client.endpoint.to_string()),
        ("Adapter set", session.adapter_set.clone()),
        ("Keepalive", keepalive),
        ("Content length", optional(session.content_length)),
        (
            "Control address",
            session.control_address.clone().unwrap_or_else(|| "-".into()),
        ),
        ("Request limit", optional(session.request_limit)),
    ]);

    manager.disconnect().await;
    Ok(())
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Spinner shown while the create request is pending
pub(crate) fn connecting_spinner(ctx: &OutputContext, server: &str) -> ProgressBar {
    if ctx.quiet {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Connecting to {}...", server));
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
