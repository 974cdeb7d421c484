//! vrtlib-packet: VITA-49.0 packets and VRL frames.
//!
//! Everything in this crate is pure: byte slices in, parsed structures out
//! (and the reverse). No I/O happens here, so the receive and send paths
//! in `vrtlib-io` can be tested byte-for-byte without sockets.
//!
//! - [`vita49`] -- packet header model, [`Packet`] and [`PacketBuilder`]
//! - [`context`] -- context indicator fields and association lists
//! - [`payload`] -- data payload format and sample unpacking
//! - [`vrl`] -- VRL frame parse/encode and CRC
//! - [`codec`] -- datagram and byte-stream decoding, frame packing
//! - [`sequence`] -- frame/packet count gap detection

pub mod codec;
pub mod context;
pub mod payload;
pub mod sequence;
pub mod vita49;
pub mod vrl;

pub use codec::{StreamDecoder, Unit, decode_datagram, encode_frames, is_frame_start, plan_frames};
pub use context::{ContextAssociationLists, ContextBuilder, ContextFields};
pub use payload::{PayloadFormat, unpack_samples};
pub use sequence::{Gap, GapKind, PacketCounter, SequenceTracker};
pub use vita49::{ClassId, Packet, PacketBuilder, PacketType, StreamCode, Timestamp, Tsf, Tsi};
pub use vrl::VrlFrame;
