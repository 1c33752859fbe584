use crate::error::ProtocolError;
use crate::packet::Frame;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// How the receiver is supposed to treat a route frame. `Async` carries no
/// correlation; a `Request` asks for exactly one `Response` or `RespErr`
/// with the same ask id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MsgKind {
    Async = 0,
    Request = 1,
    Response = 2,
    RespErr = 3,
}

/// The fixed-width head of a route frame, little-endian on the wire:
///
/// ```ascii
/// 0:  target uid (u32) - 0 addresses the router itself
/// 4:  source uid (u32) - rewritten by the router on forward
/// 8:  ask id (u32)     - request/response correlation, 0 = none
/// 12: msg id (u32)     - names the payload schema
/// 16: msg kind (u8)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteHead {
    pub target_uid: u32,
    pub source_uid: u32,
    pub ask_id: u32,
    pub msg_id: u32,
    pub msg_kind: MsgKind,
}

impl RouteHead {
    pub const SERIALIZED_LEN: usize = 17;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.target_uid);
        buf.put_u32_le(self.source_uid);
        buf.put_u32_le(self.ask_id);
        buf.put_u32_le(self.msg_id);
        buf.put_u8(self.msg_kind.into());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RouteHead> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(ProtocolError::BadRouteHead(buf.remaining()).into());
        }
        let target_uid = buf.get_u32_le();
        let source_uid = buf.get_u32_le();
        let ask_id = buf.get_u32_le();
        let msg_id = buf.get_u32_le();
        let kind_raw = buf.get_u8();
        let msg_kind = MsgKind::try_from(kind_raw)
            .map_err(|_| anyhow::anyhow!("unknown msg kind {}", kind_raw))?;

        Ok(RouteHead { target_uid, source_uid, ask_id, msg_id, msg_kind })
    }

    /// The head of a route frame must be exactly 17 bytes; anything else was
    /// not produced by a conforming peer.
    pub fn from_frame(frame: &Frame) -> anyhow::Result<RouteHead> {
        if frame.head().len() != Self::SERIALIZED_LEN {
            return Err(ProtocolError::BadRouteHead(frame.head().len()).into());
        }
        Self::deser(&mut frame.head())
    }
}
