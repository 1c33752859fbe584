use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// A message that can travel as the body of a route frame. `MSG_ID` names
/// the schema; a request and its response share the same id, so a reply can
/// be validated against the type the caller expects.
pub trait WireMsg: Sized + Send + 'static {
    const MSG_ID: u32;

    fn ser(&self, buf: &mut BytesMut);
    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self>;

    fn to_body(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    fn from_body(mut body: &[u8]) -> anyhow::Result<Self> {
        Self::deser(&mut body)
    }
}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_varint(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let bytes = get_bytes(buf)?;
    Ok(String::from_utf8(bytes)?)
}

pub(crate) fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_varint(b.len() as u32);
    buf.put_slice(b);
}

pub(crate) fn get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_u32_varint()? as usize;
    if buf.remaining() < len {
        bail!("truncated field: {} of {} bytes", buf.remaining(), len);
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Body of a `RespErr` reply. Carried with the failing request's msg id in
/// the route head, so this type itself is never dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrMsg {
    pub code: i32,
    pub detail: String,
}

impl WireMsg for ErrMsg {
    const MSG_ID: u32 = 0;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_varint(self.code);
        put_string(buf, &self.detail);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let code = buf.try_get_i32_varint()?;
        let detail = get_string(buf)?;
        Ok(ErrMsg { code, detail })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoRequest {
    pub msg: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoResponse {
    pub msg: String,
}

impl WireMsg for EchoRequest {
    const MSG_ID: u32 = 101;

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.msg);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(EchoRequest { msg: get_string(buf)? })
    }
}

impl WireMsg for EchoResponse {
    const MSG_ID: u32 = 101;

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.msg);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(EchoResponse { msg: get_string(buf)? })
    }
}

/// Fan a payload out to every member of a named group except the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupBroadcastRequest {
    pub group: String,
    pub msg_id: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupBroadcastResponse {
    pub recv_count: u32,
}

impl WireMsg for GroupBroadcastRequest {
    const MSG_ID: u32 = 102;

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.group);
        buf.put_u32_varint(self.msg_id);
        put_bytes(buf, &self.data);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let group = get_string(buf)?;
        let msg_id = buf.try_get_u32_varint()?;
        let data = get_bytes(buf)?;
        Ok(GroupBroadcastRequest { group, msg_id, data })
    }
}

impl WireMsg for GroupBroadcastResponse {
    const MSG_ID: u32 = 102;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.recv_count);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(GroupBroadcastResponse { recv_count: buf.try_get_u32_varint()? })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListGroupsRequest {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListGroupsResponse {
    pub groups: Vec<String>,
}

impl WireMsg for ListGroupsRequest {
    const MSG_ID: u32 = 103;

    fn ser(&self, _buf: &mut BytesMut) {}

    fn deser(_buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(ListGroupsRequest {})
    }
}

impl WireMsg for ListGroupsResponse {
    const MSG_ID: u32 = 103;

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.groups.len() as u32);
        for g in &self.groups {
            put_string(buf, g);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        let n = buf.try_get_u32_varint()? as usize;
        let mut groups = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            groups.push(get_string(buf)?);
        }
        Ok(ListGroupsResponse { groups })
    }
}
