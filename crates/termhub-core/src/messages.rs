//! Messages exchanged between a viewer connection and the server.
//!
//! Both directions are internally tagged on `type` so a browser client can
//! decode them with any CBOR library. Terminal bytes travel as CBOR byte
//! strings, not integer arrays.

use serde::{Deserialize, Serialize};

/// Protocol version advertised by the server.
pub const PROTOCOL_VERSION: &str = "termhub-v1";

/// Viewer → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach this connection to a session, replaying its scrollback.
    Attach {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Detach,
    /// Keystrokes for the attached session.
    Input {
        #[serde(with = "byte_string")]
        data: Vec<u8>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Spawn(SpawnRequest),
    Kill {
        session_id: String,
    },
    /// Discard an exited session's record and scrollback.
    Remove {
        session_id: String,
    },
    List,
    Ping {
        id: u64,
    },
}

/// Launch parameters carried by [`ClientMessage::Spawn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Program to run; the server's default shell when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

/// Server → viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        version: String,
    },
    /// One chunk of session output, replayed or live.
    Output {
        session_id: String,
        #[serde(with = "byte_string")]
        data: Vec<u8>,
    },
    /// Everything buffered before the attach has been sent.
    ReplayComplete {
        session_id: String,
    },
    Exited {
        session_id: String,
    },
    Spawned {
        session_id: String,
    },
    SpawnFailed {
        session_id: String,
        reason: String,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    /// A resume token was discovered in a session's output.
    ResumeToken {
        session_id: String,
        token: String,
    },
    Error {
        code: u16,
        message: String,
    },
    Pong {
        id: u64,
    },
    Shutdown {
        reason: String,
    },
}

/// One row of a [`ServerMessage::Sessions`] listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub buffered_bytes: u64,
    pub listeners: u32,
    pub age_secs: u64,
}

/// Error codes used in [`ServerMessage::Error`].
pub mod error_code {
    pub const BAD_MESSAGE: u16 = 1;
    pub const DUPLICATE_SESSION: u16 = 2;
    /// The viewer fell too far behind and is being disconnected.
    pub const LAGGED: u16 = 4;
}

mod byte_string {
    use serde::de::{SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteStringVisitor;

        impl<'de> Visitor<'de> for ByteStringVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte string")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(v)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(v.as_bytes().to_vec())
            }

            // Clients that encode a plain array instead of a Uint8Array.
            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(bytes)
            }
        }

        deserializer.deserialize_any(ByteStringVisitor)
    }
}
