use std::time::{Duration, Instant};

use super::types::{SessionStats, SessionStatus};

const MAX_ERROR_TEXT_BYTES: usize = 1024;

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Counters for one session, owned by the session actor without interior mutability.
#[derive(Debug, Default)]
pub struct SessionHealth {
    connection_started: Option<Instant>,
    opens: u64,
    frames_in: u64,
    malformed_dropped: u64,
    outbound_dropped: u64,
    last_error: Option<String>,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_open(&mut self) {
        self.connection_started = Some(Instant::now());
        self.opens = self.opens.saturating_add(1);
    }

    pub fn record_disconnect(&mut self) {
        self.connection_started = None;
    }

    pub fn record_inbound(&mut self) {
        self.frames_in = self.frames_in.saturating_add(1);
    }

    pub fn record_malformed(&mut self, error: &str) {
        self.malformed_dropped = self.malformed_dropped.saturating_add(1);
        self.last_error = Some(truncate_string(error));
    }

    pub fn record_outbound_dropped(&mut self) {
        self.outbound_dropped = self.outbound_dropped.saturating_add(1);
    }

    pub fn record_error(&mut self, error: &str) {
        self.last_error = Some(truncate_string(error));
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.connection_started.map(|started| started.elapsed())
    }

    pub fn opens(&self) -> u64 {
        self.opens
    }

    /// `frames_out` is left at zero for the owner of the writer counters to fill.
    pub fn snapshot(
        &self,
        session_id: &str,
        status: SessionStatus,
        reconnect_attempts: u32,
        reconnect_exhausted: bool,
        heartbeats_sent: u64,
    ) -> SessionStats {
        SessionStats {
            session_id: session_id.to_string(),
            status,
            reconnect_attempts,
            reconnect_exhausted,
            opens: self.opens,
            frames_in: self.frames_in,
            frames_out: 0,
            heartbeats_sent,
            last_heartbeat: None,
            malformed_dropped: self.malformed_dropped,
            outbound_dropped: self.outbound_dropped,
            connection_uptime: self.uptime(),
            last_error: self.last_error.clone(),
        }
    }
}
