//! # Global daemon configuration.
//!
//! [`Config`] defines the daemon's behavior: listen address, display kill
//! grace period, trim ages, and handshake validation.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use spieven::Config;
//!
//! let mut cfg = Config::default();
//! cfg.display_kill_grace = Duration::from_millis(500);
//! cfg.allow_remote = false;
//!
//! assert!(!cfg.frequent_trim);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 7738;

/// Global configuration for the daemon.
///
/// Controls the listen address, the display-death grace period, trim cadence,
/// and connection policy.
#[derive(Clone, Debug)]
pub struct Config {
    /// Accept connections from non-loopback addresses.
    pub allow_remote: bool,
    /// Trim every 500 ms instead of the derived interval. Test mode.
    pub frequent_trim: bool,
    /// How long tasks bound to a dead display get before they are stopped.
    pub display_kill_grace: Duration,
    /// Messages older than this are dropped by the periodic trimmer.
    pub message_max_age: Duration,
    /// Lower bound used when deriving the trim interval for tasks.
    pub task_max_age: Duration,
    /// Require clients to present the daemon's executable hash before
    /// any other frame.
    pub validate_handshake: bool,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `allow_remote = false` (loopback only)
    /// - `frequent_trim = false`
    /// - `display_kill_grace = 1s`
    /// - `message_max_age = 1h`
    /// - `task_max_age = 60s`
    /// - `validate_handshake = true`
    fn default() -> Self {
        Self {
            allow_remote: false,
            frequent_trim: false,
            display_kill_grace: Duration::from_millis(1000),
            message_max_age: Duration::from_secs(3600),
            task_max_age: Duration::from_secs(60),
            validate_handshake: true,
        }
    }
}

impl Config {
    /// The address the TCP listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = if self.allow_remote {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        SocketAddr::new(ip, DEFAULT_PORT)
    }

    /// Interval between trimmer passes.
    ///
    /// Half the smallest max-age, so an expired entry survives at most half
    /// its age limit past expiry. 500 ms in frequent-trim mode.
    pub fn trim_interval(&self) -> Duration {
        if self.frequent_trim {
            Duration::from_millis(500)
        } else {
            self.message_max_age.min(self.task_max_age) / 2
        }
    }
}
