//! Liveness predicates.
//!
//! A liveness probe answers "is the monitored session active right now".
//! The cache auto-refresh only reloads while live; the telemetry batcher
//! extends its shutdown while not live. No probe means "always live".

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Zero-argument liveness query supplied by the host.
pub trait LivenessProbe: Send + Sync {
    /// Whether the session is currently active.
    fn is_live(&self) -> bool;
}

impl<F> LivenessProbe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_live(&self) -> bool {
        self()
    }
}

/// Probe that always reports live.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLive;

impl LivenessProbe for AlwaysLive {
    fn is_live(&self) -> bool {
        true
    }
}

/// Per-channel online/offline tracker.
///
/// Channels never reported are offline.
#[derive(Debug, Default)]
pub struct StreamState {
    online: RwLock<HashMap<String, bool>>,
}

impl StreamState {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `channel` online or offline.
    pub fn set_online(&self, channel: &str, online: bool) {
        if let Ok(mut map) = self.online.write() {
            map.insert(channel.to_string(), online);
        }
    }

    /// Whether `channel` is online.
    #[must_use]
    pub fn is_online(&self, channel: &str) -> bool {
        self.online
            .read()
            .map(|map| map.get(channel).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// A probe bound to one channel.
    #[must_use]
    pub fn probe(self: &Arc<Self>, channel: impl Into<String>) -> Arc<dyn LivenessProbe> {
        Arc::new(ChannelProbe {
            state: Arc::clone(self),
            channel: channel.into(),
        })
    }
}

struct ChannelProbe {
    state: Arc<StreamState>,
    channel: String,
}

impl LivenessProbe for ChannelProbe {
    fn is_live(&self) -> bool {
        self.state.is_online(&self.channel)
    }
}
