//! Configuration resolution for the connection layer.
//!
//! Every value follows the same three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HOSTMUX_CONNECT_TIMEOUT_MS` | 10000 | Handshake timeout in milliseconds |
//! | `HOSTMUX_WATCH_INTERVAL_MS` | 4000 | Connection watcher poll interval |
//! | `HOSTMUX_MAX_CHANNELS` | 10 | Sub-channel cap per host |
//! | `HOSTMUX_CHANNEL_WAIT_MS` | 60000 | Wait for a free channel at cap (0 = forever) |
//! | `HOSTMUX_UPLOAD_RETRIES` | 1 | Upload retries after the first attempt |
//! | `HOSTMUX_STAT_ATTEMPTS` | 2 | Total stat/list attempts |
//! | `HOSTMUX_KEEP_PASSWORD` | false | Keep passwords in memory between connects |
//! | `HOSTMUX_TEST_MODE` | false | Retry auth failures while connecting |
//! | `HOSTMUX_COMPRESSION` | true | Enable zlib compression |

use std::env;
use std::time::Duration;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_WATCH_INTERVAL_MS: u64 = 4_000;
pub(crate) const DEFAULT_MAX_CHANNELS: usize = 10;
pub(crate) const DEFAULT_CHANNEL_WAIT_MS: u64 = 60_000;
pub(crate) const DEFAULT_UPLOAD_RETRIES: u32 = 1;
pub(crate) const DEFAULT_STAT_ATTEMPTS: u32 = 2;

/// Number of connect attempts in test mode when authentication fails.
pub(crate) const TEST_MODE_AUTH_ATTEMPTS: usize = 10;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "HOSTMUX_CONNECT_TIMEOUT_MS";
pub(crate) const WATCH_INTERVAL_ENV_VAR: &str = "HOSTMUX_WATCH_INTERVAL_MS";
pub(crate) const MAX_CHANNELS_ENV_VAR: &str = "HOSTMUX_MAX_CHANNELS";
pub(crate) const CHANNEL_WAIT_ENV_VAR: &str = "HOSTMUX_CHANNEL_WAIT_MS";
pub(crate) const UPLOAD_RETRIES_ENV_VAR: &str = "HOSTMUX_UPLOAD_RETRIES";
pub(crate) const STAT_ATTEMPTS_ENV_VAR: &str = "HOSTMUX_STAT_ATTEMPTS";
pub(crate) const KEEP_PASSWORD_ENV_VAR: &str = "HOSTMUX_KEEP_PASSWORD";
pub(crate) const TEST_MODE_ENV_VAR: &str = "HOSTMUX_TEST_MODE";
pub(crate) const COMPRESSION_ENV_VAR: &str = "HOSTMUX_COMPRESSION";

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

/// Resolve the handshake timeout: parameter -> env var -> default.
pub(crate) fn resolve_connect_timeout(param: Option<Duration>) -> Duration {
    if let Some(timeout) = param {
        return timeout;
    }
    Duration::from_millis(
        env_parsed(CONNECT_TIMEOUT_ENV_VAR).unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
    )
}

/// Resolve the watcher poll interval. Zero is rejected in favour of the default.
pub(crate) fn resolve_watch_interval(param: Option<Duration>) -> Duration {
    if let Some(interval) = param
        && !interval.is_zero()
    {
        return interval;
    }
    match env_parsed::<u64>(WATCH_INTERVAL_ENV_VAR) {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS),
    }
}

/// Resolve the per-host channel cap. The cap is never below one.
pub(crate) fn resolve_max_channels(param: Option<usize>) -> usize {
    param
        .or_else(|| env_parsed(MAX_CHANNELS_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_CHANNELS)
        .max(1)
}

/// Resolve the bounded wait for a free channel; `None` waits forever.
pub(crate) fn resolve_channel_wait(param: Option<Option<Duration>>) -> Option<Duration> {
    if let Some(wait) = param {
        return wait;
    }
    let ms = env_parsed(CHANNEL_WAIT_ENV_VAR).unwrap_or(DEFAULT_CHANNEL_WAIT_MS);
    (ms > 0).then(|| Duration::from_millis(ms))
}

pub(crate) fn resolve_upload_retries(param: Option<u32>) -> u32 {
    param
        .or_else(|| env_parsed(UPLOAD_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_UPLOAD_RETRIES)
}

/// Resolve the total number of stat/list attempts. At least one attempt is made.
pub(crate) fn resolve_stat_attempts(param: Option<u32>) -> u32 {
    param
        .or_else(|| env_parsed(STAT_ATTEMPTS_ENV_VAR))
        .unwrap_or(DEFAULT_STAT_ATTEMPTS)
        .max(1)
}

pub(crate) fn resolve_keep_password(param: Option<bool>) -> bool {
    param.or_else(|| env_flag(KEEP_PASSWORD_ENV_VAR)).unwrap_or(false)
}

pub(crate) fn resolve_test_mode(param: Option<bool>) -> bool {
    param.or_else(|| env_flag(TEST_MODE_ENV_VAR)).unwrap_or(false)
}

pub(crate) fn resolve_compression(param: Option<bool>) -> bool {
    param.or_else(|| env_flag(COMPRESSION_ENV_VAR)).unwrap_or(true)
}

/// Resolved settings shared by the manager, pools, watcher and transfer tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxConfig {
    pub connect_timeout: Duration,
    pub watch_interval: Duration,
    pub max_channels: usize,
    /// `None` means acquire waits until a channel is released.
    pub channel_wait: Option<Duration>,
    pub upload_retries: u32,
    pub stat_attempts: u32,
    pub keep_password: bool,
    pub test_mode: bool,
    pub compression: bool,
}

impl MuxConfig {
    /// Build a configuration from environment variables and defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            watch_interval: resolve_watch_interval(None),
            max_channels: resolve_max_channels(None),
            channel_wait: resolve_channel_wait(None),
            upload_retries: resolve_upload_retries(None),
            stat_attempts: resolve_stat_attempts(None),
            keep_password: resolve_keep_password(None),
            test_mode: resolve_test_mode(None),
            compression: resolve_compression(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = resolve_connect_timeout(Some(timeout));
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = resolve_watch_interval(Some(interval));
        self
    }

    pub fn with_max_channels(mut self, max: usize) -> Self {
        self.max_channels = resolve_max_channels(Some(max));
        self
    }

    pub fn with_channel_wait(mut self, wait: Option<Duration>) -> Self {
        self.channel_wait = resolve_channel_wait(Some(wait));
        self
    }

    pub fn with_upload_retries(mut self, retries: u32) -> Self {
        self.upload_retries = resolve_upload_retries(Some(retries));
        self
    }

    pub fn with_stat_attempts(mut self, attempts: u32) -> Self {
        self.stat_attempts = resolve_stat_attempts(Some(attempts));
        self
    }

    pub fn with_keep_password(mut self, keep: bool) -> Self {
        self.keep_password = keep;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }
}

impl Default for MuxConfig {
    /// Built-in defaults, ignoring the environment.
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            watch_interval: Duration::from_millis(DEFAULT_WATCH_INTERVAL_MS),
            max_channels: DEFAULT_MAX_CHANNELS,
            channel_wait: Some(Duration::from_millis(DEFAULT_CHANNEL_WAIT_MS)),
            upload_retries: DEFAULT_UPLOAD_RETRIES,
            stat_attempts: DEFAULT_STAT_ATTEMPTS,
            keep_password: false,
            test_mode: false,
            compression: true,
        }
    }
}
