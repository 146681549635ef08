//! Protocol-level primitives: device identity, vector clocks, the XDR
//! message schema, and the frame codec built on top of it. Nothing in this
//! module touches I/O; see `networking` for the session layer that drives it.

pub mod codec;
pub mod flags;
pub mod identity;
pub mod message;
pub mod vector_clock;
pub mod xdr;

pub use codec::{decode_frame, encode_frame, peek_header, CompressionPolicy, FrameError, FrameHeader};
pub use identity::{device_id_from_cert, format_device_id, parse_device_id, DeviceId, IdentityError};
pub use message::{
    BlockInfo, ClusterConfig, Close, Device, FileInfo, Folder, IndexPayload, Message, MessageKind,
    Options, Request, Response, ResponseCode,
};
pub use vector_clock::VectorClock;
