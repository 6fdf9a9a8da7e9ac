use std::time::Duration;

/// Per-hub runtime tunables.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Expected period between client heartbeat pulses; also the watchdog
    /// tick period.
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before a silent connection is reaped.
    pub heartbeat_tolerance: u32,
    /// Per-connection outbound queue depth; frames beyond it are dropped.
    pub max_send_queue: usize,
    /// Largest inbound message accepted, in bytes.
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_tolerance: 3,
            max_send_queue: 256,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl HubConfig {
    /// Silence longer than this gets the connection reaped.
    pub fn liveness_deadline(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_tolerance
    }
}
