//! Subscription descriptions
//!
//! A subscription asks the server to push a group of items with a given
//! field schema. Each one lives in a numbered table of the session.

use std::fmt;

/// Number of a subscription table within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the server processes updates of the subscribed items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionMode {
    /// Each update merges into the current item state
    #[default]
    Merge,
    /// Every update is a distinct event
    Distinct,
    /// Updates are forwarded unfiltered
    Raw,
    /// Items are keyed tables with add/update/delete commands
    Command,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Distinct => "DISTINCT",
            Self::Raw => "RAW",
            Self::Command => "COMMAND",
        }
    }
}

impl fmt::Display for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the server sends the current item state first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Snapshot {
    #[default]
    None,
    Full,
    /// Up to this many past events (DISTINCT mode)
    Length(u32),
}

/// Update rate limit requested for a table
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxFrequency {
    Unlimited,
    /// Updates per second
    Limited(f64),
}

impl fmt::Display for MaxFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::Limited(rate) => write!(f, "{}", rate),
        }
    }
}

/// A subscription request
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub mode: SubscriptionMode,
    /// Item names
    pub items: Vec<String>,
    /// Field names; row updates carry fields in this order
    pub fields: Vec<String>,
    pub snapshot: Snapshot,
    pub max_frequency: Option<MaxFrequency>,
}

impl Subscription {
    pub fn new<I, F>(mode: SubscriptionMode, items: I, fields: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self {
            mode,
            items: items.into_iter().map(Into::into).collect(),
            fields: fields.into_iter().map(Into::into).collect(),
            snapshot: Snapshot::None,
            max_frequency: None,
        }
    }

    /// MERGE subscription, the common case for quotes
    pub fn merge<I, F>(items: I, fields: F) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        Self::new(SubscriptionMode::Merge, items, fields)
    }

    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_max_frequency(mut self, frequency: MaxFrequency) -> Self {
        self.max_frequency = Some(frequency);
        self
    }

    /// Item group as sent on the wire (space separated)
    pub fn group(&self) -> String {
        self.items.join(" ")
    }

    /// Field schema as sent on the wire (space separated)
    pub fn schema(&self) -> String {
        self.fields.join(" ")
    }

    /// Position of a field in row updates of this subscription
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}
