//! Runtime settings consumed by the elector and the scheduler

use chrono::{FixedOffset, Offset, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default time a leader may stay silent before another process takes over
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5 * 60);

/// Longest `max_wait` the elector honors; larger values are clamped
pub const MAX_WAIT_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default delay between start and the first leadership decision
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Length of generated server ids
pub const SERVER_ID_LEN: usize = 17;

/// Heartbeat period as a fraction of `max_wait`
const HEARTBEAT_RATIO: f64 = 0.8;

/// Where this process gets its server id from
#[derive(Clone, Default)]
pub enum ServerIdSource {
    /// A fixed id, stable across restarts
    Literal(String),
    /// Called once at start; `None` or an empty id falls back to a random id
    Generator(Arc<dyn Fn() -> Option<String> + Send + Sync>),
    /// A fresh random id per start
    #[default]
    Random,
}

impl ServerIdSource {
    /// Generator source from a closure
    pub fn generator(f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self::Generator(Arc::new(f))
    }

    /// Resolve the server id for this start
    pub fn resolve(&self) -> String {
        let chosen = match self {
            Self::Literal(id) => Some(id.clone()),
            Self::Generator(f) => f(),
            Self::Random => None,
        };
        match chosen {
            Some(id) if !id.trim().is_empty() => id,
            _ => random_server_id(),
        }
    }
}

impl fmt::Debug for ServerIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(id) => f.debug_tuple("Literal").field(id).finish(),
            Self::Generator(_) => f.write_str("Generator(<fn>)"),
            Self::Random => f.write_str("Random"),
        }
    }
}

/// Random alphanumeric server id
pub fn random_server_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SERVER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Settings for one scheduler node
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// How long a leader may stay silent before another process takes over
    pub max_wait: Duration,

    /// Delay between start and the first leadership decision
    pub startup_delay: Duration,

    /// Server id source
    pub server_id: ServerIdSource,

    /// Time zone used for calendar field arithmetic in due dates
    pub utc_offset: FixedOffset,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            startup_delay: DEFAULT_STARTUP_DELAY,
            server_id: ServerIdSource::Random,
            utc_offset: Utc.fix(),
        }
    }
}

impl SchedulerSettings {
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }

    pub fn with_server_id(mut self, server_id: ServerIdSource) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_utc_offset(mut self, utc_offset: FixedOffset) -> Self {
        self.utc_offset = utc_offset;
        self
    }

    /// `max_wait`, clamped to [`MAX_WAIT_LIMIT`]
    pub fn effective_max_wait(&self) -> Duration {
        self.max_wait.min(MAX_WAIT_LIMIT)
    }

    /// Interval between heartbeats while leading
    pub fn heartbeat_interval(&self) -> Duration {
        self.effective_max_wait().mul_f64(HEARTBEAT_RATIO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.max_wait, Duration::from_secs(300));
        assert_eq!(settings.startup_delay, Duration::from_secs(1));
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(240));
        assert_eq!(settings.utc_offset.local_minus_utc(), 0);
    }

    #[test]
    fn test_oversized_max_wait_is_clamped() {
        let settings = SchedulerSettings::default().with_max_wait(Duration::MAX);
        assert_eq!(settings.effective_max_wait(), MAX_WAIT_LIMIT);
        assert!(settings.heartbeat_interval() < MAX_WAIT_LIMIT);
    }

    #[test]
    fn test_server_id_sources() {
        assert_eq!(ServerIdSource::Literal("node-a".into()).resolve(), "node-a");
        assert_eq!(
            ServerIdSource::generator(|| Some("gen".into())).resolve(),
            "gen"
        );

        let random = ServerIdSource::Random.resolve();
        assert_eq!(random.len(), SERVER_ID_LEN);
        assert!(random.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_empty_server_id_falls_back_to_random() {
        assert_eq!(ServerIdSource::Literal(String::new()).resolve().len(), SERVER_ID_LEN);
        assert_eq!(ServerIdSource::generator(|| None).resolve().len(), SERVER_ID_LEN);
    }
}
