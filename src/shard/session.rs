//! Per-shard session state

use std::fmt;

/// Connection state machine
///
/// `Disconnected → Connecting → Identifying → Connected`, with `Resuming`
/// replacing `Identifying` when a session can be resumed. Every state may
/// fall back to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Connected,
    Resuming,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Connected => "connected",
            ConnectionState::Resuming => "resuming",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session owned by one shard's event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSession {
    pub shard_id: u32,
    pub shard_count: u32,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    /// Gateway URL the service asked resumes to use
    pub resume_url: Option<String>,
    pub state: ConnectionState,
}

impl ShardSession {
    pub fn new(shard_id: u32, shard_count: u32) -> Self {
        Self {
            shard_id,
            shard_count,
            sequence: None,
            session_id: None,
            resume_url: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Record a dispatch sequence; never moves backwards
    pub fn observe_sequence(&mut self, sequence: u64) {
        self.sequence = Some(self.sequence.map_or(sequence, |current| current.max(sequence)));
    }

    pub fn establish(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
    }

    /// A resume needs both a session id and a sequence to replay from
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget the session; the next connect identifies from scratch
    pub fn invalidate(&mut self) {
        self.sequence = None;
        self.session_id = None;
        self.resume_url = None;
    }
}
