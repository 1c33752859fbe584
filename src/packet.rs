use crate::error::ProtocolError;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire layout of one frame:
///
/// ```ascii
/// |----------------Meta------------------|-----------------|
/// |-<FrameType>-|-<HeadLen>-|-<BodyLen>--|-<Head>-|-<Body>-|
/// |-1-----------|-2 (LE)----|-3 (LE u24)-|-N------|-N------|
/// ```
///
/// Head and body are both optional. The meta is fixed at six bytes; all
/// multi-byte integers are little-endian.
pub const META_LEN: usize = 6;

/// 65535 - the largest head the two-byte length field can carry.
pub const MAX_HEAD_SIZE: usize = 0xFFFF;
/// 8388607 - one below 2^23. The u24 length field could encode more, but
/// anything above this limit is treated as a compromised stream.
pub const MAX_BODY_SIZE: usize = 0x7F_FFFF;

/// Frame type constants. The block 0xE0..=0xE7 is reserved for control
/// frames; everything else is an application payload type, of which this
/// system uses exactly one, [`frame_type::ROUTE`].
pub mod frame_type {
    pub const INNER_START: u8 = 0xE0;
    pub const HAND_SHAKE: u8 = 0xE1;
    pub const ACTION_REQUIRE: u8 = 0xE2;
    pub const DO_ACTION: u8 = 0xE3;
    pub const ACK_RESULT: u8 = 0xE4;
    pub const HEARTBEAT: u8 = 0xE5;
    pub const ECHO: u8 = 0xE6;
    pub const INNER_END: u8 = 0xE7;

    pub const ROUTE: u8 = 0x10;

    pub fn is_control(t: u8) -> bool {
        (INNER_START..=INNER_END).contains(&t)
    }
}

fn get_u24_le(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16
}

fn put_u24_le(b: &mut [u8], v: u32) {
    b[0] = v as u8;
    b[1] = (v >> 8) as u8;
    b[2] = (v >> 16) as u8;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    frame_type: u8,
    head: Vec<u8>,
    body: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u8) -> Frame {
        Frame {
            frame_type,
            head: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_head(mut self, head: Vec<u8>) -> Frame {
        self.set_head(head);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Frame {
        self.set_body(body);
        self
    }

    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Frames are built by this process, so an oversized head is a
    /// programming error rather than input to be validated.
    pub fn set_head(&mut self, head: Vec<u8>) {
        assert!(head.len() <= MAX_HEAD_SIZE, "frame head exceeds {} bytes", MAX_HEAD_SIZE);
        self.head = head;
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        assert!(body.len() <= MAX_BODY_SIZE, "frame body exceeds {} bytes", MAX_BODY_SIZE);
        self.body = body;
    }

    fn ser_meta(&self, meta: &mut [u8; META_LEN]) {
        meta[0] = self.frame_type;
        meta[1..3].copy_from_slice(&(self.head.len() as u16).to_le_bytes());
        put_u24_le(&mut meta[3..6], self.body.len() as u32);
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let mut meta = [0u8; META_LEN];
        self.ser_meta(&mut meta);
        buf.put_slice(&meta);
        buf.put_slice(&self.head);
        buf.put_slice(&self.body);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        if buf.remaining() < META_LEN {
            bail!("truncated frame meta: {} bytes", buf.remaining());
        }
        let mut meta = [0u8; META_LEN];
        buf.copy_to_slice(&mut meta);

        let frame_type = meta[0];
        let head_len = u16::from_le_bytes([meta[1], meta[2]]) as usize;
        let body_len = get_u24_le(&meta[3..6]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge(body_len).into());
        }
        if buf.remaining() < head_len + body_len {
            bail!("truncated frame payload: {} of {} bytes", buf.remaining(), head_len + body_len);
        }

        let mut head = vec![0u8; head_len];
        buf.copy_to_slice(&mut head);
        let mut body = vec![0u8; body_len];
        buf.copy_to_slice(&mut body);

        Ok(Frame { frame_type, head, body })
    }

    /// Reads one frame. Each frame allocates its own head and body; nothing
    /// is carried across frames. EOF or a length outside the limits is an
    /// error, and the caller is expected to close the connection on it.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Frame> {
        let mut meta = [0u8; META_LEN];
        reader.read_exact(&mut meta).await?;

        let frame_type = meta[0];
        let head_len = u16::from_le_bytes([meta[1], meta[2]]) as usize;
        let body_len = get_u24_le(&meta[3..6]) as usize;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::BodyTooLarge(body_len).into());
        }

        let mut head = vec![0u8; head_len];
        if head_len > 0 {
            reader.read_exact(&mut head).await?;
        }
        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            reader.read_exact(&mut body).await?;
        }

        Ok(Frame { frame_type, head, body })
    }

    /// Writes meta, head and body as one coalesced write.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(META_LEN + self.head.len() + self.body.len());
        self.ser(&mut buf);
        writer.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(Frame::new(frame_type::HEARTBEAT))]
    #[case::head_only(Frame::new(frame_type::ACTION_REQUIRE).with_head(b"auth".to_vec()))]
    #[case::body_only(Frame::new(frame_type::DO_ACTION).with_body(vec![1, 2, 3]))]
    #[case::head_and_body(Frame::new(frame_type::ROUTE).with_head(vec![0u8; 17]).with_body(b"payload".to_vec()))]
    #[case::max_head(Frame::new(frame_type::ROUTE).with_head(vec![0xAB; MAX_HEAD_SIZE]))]
    fn test_ser_deser_round_trip(#[case] original: Frame) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = Frame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_max_body_is_legal() {
        let original = Frame::new(frame_type::ROUTE).with_body(vec![7u8; MAX_BODY_SIZE]);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = Frame::deser(&mut b).unwrap();
        assert_eq!(deser.body().len(), MAX_BODY_SIZE);
    }

    #[test]
    fn test_body_len_above_limit_is_rejected() {
        // craft a meta claiming 2^23 body bytes
        let mut raw = vec![frame_type::ROUTE, 0, 0];
        raw.extend_from_slice(&[0x00, 0x00, 0x80]);
        let mut b: &[u8] = &raw;
        let err = Frame::deser(&mut b).unwrap_err();
        assert!(err.downcast_ref::<ProtocolError>().is_some());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let original = Frame::new(frame_type::ROUTE).with_body(vec![1, 2, 3, 4]);
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf[..buf.len() - 1];
        assert!(Frame::deser(&mut b).is_err());
    }

    #[rstest]
    #[case(frame_type::INNER_START, true)]
    #[case(frame_type::HAND_SHAKE, true)]
    #[case(frame_type::INNER_END, true)]
    #[case(frame_type::ROUTE, false)]
    #[case(0xE8, false)]
    fn test_is_control(#[case] t: u8, #[case] expected: bool) {
        assert_eq!(frame_type::is_control(t), expected);
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let original = Frame::new(frame_type::ROUTE)
            .with_head(vec![9u8; 17])
            .with_body(b"hello".to_vec());

        let (mut a, mut b) = tokio::io::duplex(1024);
        original.write_to(&mut a).await.unwrap();
        let read = Frame::read_from(&mut b).await.unwrap();
        assert_eq!(read, original);
    }
}
