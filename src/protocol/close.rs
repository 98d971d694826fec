//! Close code classification
//!
//! Which close codes permit a resume is policy data, not branching inside the
//! shard state machine.

use std::collections::HashSet;

/// What a shard does after the socket closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the existing session
    Resume,
    /// Discard the session and identify from scratch
    Reidentify,
    /// Credential rejected; stop the shard
    FatalAuth,
    /// Configuration rejected by the service; stop the shard
    Fatal,
}

/// Close code policy consulted by every shard
#[derive(Debug, Clone)]
pub struct ClosePolicy {
    pub reidentify: HashSet<u16>,
    pub fatal_auth: HashSet<u16>,
    pub fatal: HashSet<u16>,
    /// Action for codes not listed above, and for closes without a code
    pub default_action: CloseAction,
}

impl Default for ClosePolicy {
    fn default() -> Self {
        Self {
            // 1000/1001: closed normally, the server drops the session with it
            // 4007: invalid seq, 4009: session timed out
            reidentify: [1000, 1001, 4007, 4009].into_iter().collect(),
            // 4004: authentication failed
            fatal_auth: [4004].into_iter().collect(),
            // 4010: invalid shard, 4011: sharding required, 4012: invalid API
            // version, 4013: invalid intents, 4014: disallowed intents
            fatal: [4010, 4011, 4012, 4013, 4014].into_iter().collect(),
            default_action: CloseAction::Resume,
        }
    }
}

impl ClosePolicy {
    pub fn classify(&self, code: Option<u16>) -> CloseAction {
        let Some(code) = code else {
            return self.default_action;
        };

        if self.fatal_auth.contains(&code) {
            CloseAction::FatalAuth
        } else if self.fatal.contains(&code) {
            CloseAction::Fatal
        } else if self.reidentify.contains(&code) {
            CloseAction::Reidentify
        } else {
            self.default_action
        }
    }

    pub fn is_resumable(&self, code: Option<u16>) -> bool {
        self.classify(code) == CloseAction::Resume
    }
}
