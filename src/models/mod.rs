use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::entities::upload_sessions;

/// Lifecycle state of an upload session.
///
/// `Open -> Completing -> Committed` is the happy path. `Completing` may fall
/// back to `Open` when assembly fails. `Committed`, `Aborted` and `Expired`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Completing,
    Committed,
    Aborted,
    Expired,
}

impl SessionStatus {
    pub const TERMINAL: [SessionStatus; 3] = [Self::Committed, Self::Aborted, Self::Expired];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Whether the state machine has an edge from `self` to `to`.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Open, Completing)
                | (Completing, Open)
                | (Completing, Committed)
                | (Open, Aborted)
                | (Completing, Aborted)
                | (Open, Expired)
                | (Completing, Expired)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "completing" => Ok(Self::Completing),
            "committed" => Ok(Self::Committed),
            "aborted" => Ok(Self::Aborted),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Stored,
    Rejected,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session metadata as the rest of the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct UploadSession {
    pub session_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub content_hash: String,
    pub status: SessionStatus,
    pub final_key: Option<String>,
    /// Fencing token of the assembly attempt that owns the "completing" state.
    #[serde(skip_serializing)]
    pub assembly_id: Option<String>,
    #[schema(value_type = String)]
    pub created_at: DateTime<FixedOffset>,
    #[schema(value_type = String)]
    pub last_activity_at: DateTime<FixedOffset>,
    #[schema(value_type = String)]
    pub expires_at: DateTime<FixedOffset>,
    #[schema(value_type = String)]
    pub updated_at: DateTime<FixedOffset>,
}

impl UploadSession {
    /// Byte length every chunk at `index` must have. The last chunk carries
    /// the remainder of the file.
    pub fn expected_chunk_size(&self, index: u32) -> u64 {
        if index + 1 == self.total_chunks {
            self.total_size - self.chunk_size * u64::from(self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }
}

impl TryFrom<upload_sessions::Model> for UploadSession {
    type Error = String;

    fn try_from(m: upload_sessions::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            status: m.status.parse()?,
            total_size: u64::try_from(m.total_size).map_err(|e| e.to_string())?,
            chunk_size: u64::try_from(m.chunk_size).map_err(|e| e.to_string())?,
            total_chunks: u32::try_from(m.total_chunks).map_err(|e| e.to_string())?,
            session_id: m.id,
            file_name: m.file_name,
            content_hash: m.content_hash,
            final_key: m.final_key,
            assembly_id: m.assembly_id,
            created_at: m.created_at,
            last_activity_at: m.last_activity_at,
            expires_at: m.expires_at,
            updated_at: m.updated_at,
        })
    }
}

/// Returned to the caller for every accepted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub chunk_index: u32,
    pub size: u64,
    pub chunk_hash: String,
}

/// Reference to a committed, verified object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FinalObjectRef {
    pub session_id: String,
    pub key: String,
    pub size: u64,
    pub content_hash: String,
}

/// Progress snapshot for `GET /uploads/{id}/status`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SessionStatusReport {
    pub session_id: String,
    pub file_name: String,
    pub status: SessionStatus,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub received_chunks: Vec<u32>,
    pub rejected_chunks: Vec<u32>,
    pub missing_chunks: Vec<u32>,
    pub bytes_received: u64,
    #[schema(value_type = String)]
    pub expires_at: DateTime<FixedOffset>,
    pub final_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(total_size: u64, chunk_size: u64, total_chunks: u32) -> UploadSession {
        let now = Utc::now().fixed_offset();
        UploadSession {
            session_id: "s".to_string(),
            file_name: "f.bin".to_string(),
            total_size,
            chunk_size,
            total_chunks,
            content_hash: String::new(),
            status: SessionStatus::Open,
            final_key: None,
            assembly_id: None,
            created_at: now,
            last_activity_at: now,
            expires_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SessionStatus::Open,
            SessionStatus::Completing,
            SessionStatus::Committed,
            SessionStatus::Aborted,
            SessionStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("pending".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use SessionStatus::*;
        for from in SessionStatus::TERMINAL {
            assert!(from.is_terminal());
            for to in [Open, Completing, Committed, Aborted, Expired] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(Open.can_transition_to(Completing));
        assert!(Completing.can_transition_to(Open));
        assert!(!Open.can_transition_to(Committed));
        assert!(!Open.is_terminal());
        assert!(!Completing.is_terminal());
    }

    #[test]
    fn test_expected_chunk_size_for_partial_last_chunk() {
        let s = session(2_500_000, 1_000_000, 3);
        assert_eq!(s.expected_chunk_size(0), 1_000_000);
        assert_eq!(s.expected_chunk_size(1), 1_000_000);
        assert_eq!(s.expected_chunk_size(2), 500_000);
    }

    #[test]
    fn test_expected_chunk_size_for_exact_multiple() {
        let s = session(3_000_000, 1_000_000, 3);
        assert_eq!(s.expected_chunk_size(2), 1_000_000);
    }
}
