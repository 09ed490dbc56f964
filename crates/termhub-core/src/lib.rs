//! termhub-core: wire types shared by the termhub server and its viewers.
//!
//! Provides the error taxonomy, CBOR message types and length-prefixed
//! framing codec.

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{decode_payload, encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use error::{HubError, HubResult};
pub use messages::{ClientMessage, ServerMessage, SessionSummary, SpawnRequest, PROTOCOL_VERSION};
