//! metacache-health — liveness probing of serving nodes.
//!
//! When a server's registration disappears, the fail-server coordinator
//! asks a [`LivenessProbe`] whether the process behind it still answers
//! before declaring it failed.
//!
//! # Architecture
//!
//! ```text
//! LivenessProbe (trait)
//!   └── HttpLivenessProbe
//!         └── ping(rpc_addr, path, timeout) → status | PingError
//! ```
//!
//! Any HTTP answer, even an error status, counts as alive. Connection
//! failures and timeouts count as dead.

pub mod ping;
pub mod probe;

pub use ping::{PingError, parse_duration, ping};
pub use probe::{HttpLivenessProbe, LivenessProbe};
