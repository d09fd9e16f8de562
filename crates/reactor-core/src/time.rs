use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock instant threaded through `Channel::handle_event` and `onMessage`
/// callbacks. Formatting is an external collaborator's job, not this crate's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    micros_since_epoch: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            micros_since_epoch: d.as_micros() as u64,
        }
    }

    pub fn micros_since_epoch(&self) -> u64 {
        self.micros_since_epoch
    }
}
