//! Wire message used by `probe` and `echo`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Heartbeat,
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    /// Sender's wall clock, milliseconds since the Unix epoch.
    pub sent_at_ms: u64,
    pub body: Body,
}

impl Envelope {
    pub fn heartbeat(seq: u64) -> Self {
        Self {
            seq,
            sent_at_ms: now_ms(),
            body: Body::Heartbeat,
        }
    }

    /// Milliseconds since `sent_at_ms`, zero if the clock went backwards.
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.sent_at_ms)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
