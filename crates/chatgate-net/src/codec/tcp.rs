//! Binary TCP framing: `len:u32le | envelope`.

use bytes::Bytes;
use tokio::io::AsyncRead;

use chatgate_core::wire::{
    envelope_limit, WireError, Writer, MIN_TCP_FRAME_LEN, TCP_LENGTH_PREFIX_LEN,
};

use crate::error::SessionError;
use crate::reader::Reader;

pub(super) fn frame(envelope: &[u8]) -> Result<Bytes, SessionError> {
    let len = u32::try_from(envelope.len())
        .map_err(|_| WireError::FrameLength(envelope.len() as u64))?;
    let mut w = Writer::with_capacity(TCP_LENGTH_PREFIX_LEN + envelope.len());
    w.write_u32_le(len);
    w.write_bytes(envelope);
    Ok(w.into_bytes())
}

pub(super) async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    max_msg_size: u64,
) -> Result<Bytes, SessionError> {
    let len = reader.read_u32_le().await?;
    if len <= MIN_TCP_FRAME_LEN || len as u64 > envelope_limit(max_msg_size) {
        return Err(SessionError::FrameLength(len));
    }
    Ok(reader.read_n(len as usize).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::wire::MAX_ENVELOPE_LEN;

    fn reader(bytes: Vec<u8>) -> Reader<std::io::Cursor<Vec<u8>>> {
        Reader::new(std::io::Cursor::new(bytes))
    }

    fn frame_with_len(len: u32, body: usize) -> Vec<u8> {
        let mut out = len.to_le_bytes().to_vec();
        out.resize(4 + body, 0);
        out
    }

    #[tokio::test]
    async fn length_is_prefixed_little_endian() {
        let framed = frame(&[7u8; 32]).unwrap();
        assert_eq!(&framed[..4], &[32, 0, 0, 0]);
        assert_eq!(framed.len(), 36);
    }

    #[tokio::test]
    async fn short_lengths_are_rejected() {
        for len in 0..=MIN_TCP_FRAME_LEN {
            let mut r = reader(frame_with_len(len, len as usize));
            let err = read_envelope(&mut r, 0).await.unwrap_err();
            assert!(matches!(err, SessionError::FrameLength(l) if l == len));
        }
    }

    #[tokio::test]
    async fn smallest_valid_frame() {
        let mut r = reader(frame_with_len(29, 29));
        assert_eq!(read_envelope(&mut r, 0).await.unwrap().len(), 29);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut r = reader(frame_with_len(4097, 0));
        let err = read_envelope(&mut r, 4096).await.unwrap_err();
        assert!(matches!(err, SessionError::FrameLength(4097)));

        // zero falls back to the built-in ceiling
        let mut r = reader(frame_with_len(4097, 4097));
        assert!(read_envelope(&mut r, 0).await.is_ok());
    }

    #[tokio::test]
    async fn unconfigured_limit_still_caps_the_prefix() {
        let mut r = reader(frame_with_len(u32::MAX, 0));
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::FrameLength(u32::MAX)));

        let over = MAX_ENVELOPE_LEN as u32 + 1;
        let mut r = reader(frame_with_len(over, 0));
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::FrameLength(n) if n == over));
    }

    #[tokio::test]
    async fn truncated_body_is_an_io_error() {
        let mut r = reader(frame_with_len(64, 10));
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }
}
