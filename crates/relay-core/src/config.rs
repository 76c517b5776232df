// Actor runtime configuration
//
// ActorConfig carries the tunables shared by every actor a runtime creates.
// It can be:
// - Created directly (`ActorConfig::default()` plus `with_*` setters)
// - Read from the process environment via `from_env`

use serde::{Deserialize, Serialize};

/// Environment variable for `default_recent_messages`
pub const ENV_DEFAULT_RECENT_MESSAGES: &str = "RELAY_DEFAULT_RECENT_MESSAGES";
/// Environment variable for `event_buffer`
pub const ENV_EVENT_BUFFER: &str = "RELAY_EVENT_BUFFER";
/// Environment variable for `archive_on_close`
pub const ENV_ARCHIVE_ON_CLOSE: &str = "RELAY_ARCHIVE_ON_CLOSE";

/// Configuration shared by actors created through one runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Memory window used when a definition declares no `$mem` layer
    #[serde(default = "default_recent_messages")]
    pub default_recent_messages: usize,

    /// Capacity of a routing round's event queue (minimum 1)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Archive flag passed to `destroy_state` when an actor closes
    #[serde(default = "default_true")]
    pub archive_on_close: bool,

    /// Append extracted rule arguments to a delegate's first input
    #[serde(default = "default_true")]
    pub annotate_delegate_args: bool,
}

fn default_recent_messages() -> usize {
    100
}

fn default_event_buffer() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            default_recent_messages: default_recent_messages(),
            event_buffer: default_event_buffer(),
            archive_on_close: true,
            annotate_delegate_args: true,
        }
    }
}

impl ActorConfig {
    /// Build a configuration from environment variables, falling back to defaults
    /// for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(n) = lookup(ENV_DEFAULT_RECENT_MESSAGES).and_then(|v| v.parse().ok()) {
            config.default_recent_messages = n;
        }
        if let Some(n) = lookup(ENV_EVENT_BUFFER).and_then(|v| v.parse().ok()) {
            config.event_buffer = n;
        }
        if let Some(v) = lookup(ENV_ARCHIVE_ON_CLOSE) {
            config.archive_on_close = !matches!(v.to_lowercase().as_str(), "0" | "false" | "no");
        }
        config
    }

    /// Set the default memory window
    pub fn with_default_recent_messages(mut self, n: usize) -> Self {
        self.default_recent_messages = n;
        self
    }

    /// Set the routing event queue capacity
    pub fn with_event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n;
        self
    }

    /// Set whether closing an actor archives its state
    pub fn with_archive_on_close(mut self, archive: bool) -> Self {
        self.archive_on_close = archive;
        self
    }

    /// Set whether delegate inputs carry extracted arguments
    pub fn with_annotate_delegate_args(mut self, annotate: bool) -> Self {
        self.annotate_delegate_args = annotate;
        self
    }

    /// Queue capacity clamped to what `tokio::sync::mpsc::channel` accepts
    pub(crate) fn channel_capacity(&self) -> usize {
        self.event_buffer.max(1)
    }
}
