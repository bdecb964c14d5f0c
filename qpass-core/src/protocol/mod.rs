//! Application protocol: envelopes and the bodies they carry.

pub mod data;
pub mod payload;

pub use data::{AuthData, CodecError, NewUserData, SyncData, CODEC_VERSION};
pub use payload::{
    read_payload, write_payload, FrameError, Payload, PayloadType, MAX_PAYLOAD_SIZE,
};
