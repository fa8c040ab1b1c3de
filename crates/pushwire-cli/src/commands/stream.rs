//! Stream command - subscribe and print live updates

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pushwire_client::{
    FieldValue, MaxFrequency, RowUpdate, SessionError, SessionListener, SessionManager, Snapshot,
    Subscription, SubscriptionMode,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::info::connecting_spinner;
use crate::config::MergedConfig;
use crate::output::{ItemSummary, OutputContext, OutputFormat, UpdateLine};

/// What to subscribe to
#[derive(Debug, Clone)]
pub struct StreamArgs {
    pub items: Vec<String>,
    pub fields: Vec<String>,
    pub mode: SubscriptionMode,
    pub snapshot: bool,
    pub max_frequency: Option<f64>,
    /// Stop after this long instead of waiting for Ctrl+C
    pub duration: Option<Duration>,
}

/// Session events, moved off the worker task so printing never slows it
#[derive(Debug)]
enum Event {
    Row(RowUpdate),
    ServerError(i32, String),
    Rebound,
    Closed,
    Failed(SessionError),
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionListener for ChannelListener {
    fn on_row_update(&self, item: &str, fields: &[FieldValue]) {
        let _ = self.tx.send(Event::Row(RowUpdate::new(item, fields.to_vec())));
    }

    fn on_session_error(&self, code: i32, message: &str) {
        let _ = self.tx.send(Event::ServerError(code, message.to_string()));
    }

    fn on_stream_closed(&self) {
        let _ = self.tx.send(Event::Closed);
    }

    fn on_rebind_succeeded(&self) {
        let _ = self.tx.send(Event::Rebound);
    }

    fn on_session_failed(&self, error: &SessionError) {
        let _ = self.tx.send(Event::Failed(error.clone()));
    }
}

/// Last known values and update count of each item
#[derive(Default)]
struct ItemStates {
    items: BTreeMap<String, (u64, Vec<Option<String>>)>,
}

impl ItemStates {
    /// Merge `row` and return the item's current values
    fn apply(&mut self, row: &RowUpdate) -> &[Option<String>] {
        let (count, values) = self.items.entry(row.item.clone()).or_default();
        *count += 1;
        row.apply_to(values);
        values
    }

    fn summary(&self) -> Vec<ItemSummary> {
        self.items
            .iter()
            .map(|(item, (updates, values))| ItemSummary {
                item: item.clone(),
                updates: *updates,
                last: values
                    .iter()
                    .map(|v| v.as_deref().unwrap_or("-"))
                    .collect::<Vec<_>>()
                    .join(" | "),
            })
            .collect()
    }
}

/// Subscribe and print updates until Ctrl+C, the duration elapses or the
/// session ends
pub async fn stream(
    manager: &SessionManager,
    config: &MergedConfig,
    args: StreamArgs,
    ctx: &OutputContext,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let spinner = connecting_spinner(ctx, &config.client.endpoint.to_string());
    let created = manager
        .create(config.credentials.clone(), Arc::new(ChannelListener { tx }))
        .await;
    spinner.finish_and_clear();
    let session = created.context("Failed to create session")?;
    ctx.success(&format!("Session {} created", session.session_id));

    let mut subscription = Subscription::new(args.mode, args.items.clone(), args.fields.clone());
    if args.snapshot {
        subscription = subscription.with_snapshot(Snapshot::Full);
    }
    if let Some(rate) = args.max_frequency {
        subscription = subscription.with_max_frequency(MaxFrequency::Limited(rate));
    }
    let table = match manager.subscribe(subscription).await {
        Ok(table) => table,
        Err(e) => {
            manager.disconnect().await;
            return Err(e).context("Subscription failed");
        }
    };
    debug!(%table, "Subscribed");
    ctx.info("Press Ctrl+C to stop");

    if ctx.format == OutputFormat::Csv {
        let headers: Vec<&str> = ["timestamp", "item"]
            .into_iter()
            .chain(args.fields.iter().map(String::as_str))
            .collect();
        println!("{}", headers.join(","));
    }

    let deadline = async {
        match args.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut states = ItemStates::default();
    let mut outcome = Ok(());
    let mut session_over = false;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(Event::Row(row)) => {
                    let values = states.apply(&row);
                    ctx.print_update(&UpdateLine {
                        timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
                        item: row.item.clone(),
                        fields: args
                            .fields
                            .iter()
                            .cloned()
                            .zip(values.iter().cloned().chain(std::iter::repeat(None)))
                            .collect(),
                    });
                }
                Some(Event::ServerError(code, message)) => {
                    ctx.warn(&format!("Server error {}: {}", code, message));
                }
                Some(Event::Rebound) => ctx.info("Connection re-established"),
                Some(Event::Closed) | None => {
                    ctx.info("Session closed");
                    session_over = true;
                    break;
                }
                Some(Event::Failed(error)) => {
                    session_over = true;
                    outcome = Err(anyhow::Error::new(error).context("Session failed"));
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                ctx.info("\nStopping...");
                break;
            }
            _ = &mut deadline => break,
        }
    }

    if !session_over {
        manager.disconnect().await;
        ctx.success("Session closed");
    }

    if ctx.format == OutputFormat::Table && !ctx.quiet {
        ctx.print(&states.summary());
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_item_states_merge_unchanged_fields() {
        let mut states = ItemStates::default();
        states.apply(&RowUpdate::new("1", vec!["10".into(), "a".into()]));
        let values = states
            .apply(&RowUpdate::new("1", vec![FieldValue::Unchanged, FieldValue::Absent]))
            .to_vec();
        assert_eq!(values, vec![Some("10".to_string()), None]);

        let summary = states.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].updates, 2);
        assert_eq!(summary[0].last, "10 | -");
    }
}
