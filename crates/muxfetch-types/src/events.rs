use serde::{Deserialize, Serialize};

/// Events pushed FROM server TO client over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlEvent {
    /// Sent once on connect; the id must accompany every fetch request
    UserId { id: String },

    /// Unified progress of the active request, 0 to 100
    Progress { percentage: f64 },
}

/// Commands sent FROM client TO server over the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    /// Abort the active request and tear the session down
    Cancel,
}
