//! HTTP framing: envelope in a request body in, envelope in a 200 response
//! body out. Keep-alive; one request per message.

use bytes::Bytes;
use tokio::io::AsyncRead;

use chatgate_core::http::ok_response_head;
use chatgate_core::wire::{envelope_limit, Writer, ENVELOPE_HEADER_LEN};

use crate::error::{HttpError, SessionError};
use crate::reader::Reader;
use crate::sniff::peek_request_head;

pub(super) fn frame(envelope: &[u8]) -> Bytes {
    let head = ok_response_head(envelope.len());
    let mut w = Writer::with_capacity(head.len() + envelope.len());
    w.write_str(&head);
    w.write_bytes(envelope);
    w.into_bytes()
}

pub(super) async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut Reader<R>,
    max_msg_size: u64,
) -> Result<Bytes, SessionError> {
    let head = peek_request_head(reader).await?;
    reader.consume(head.head_len);

    if head.is_chunked() {
        return Err(HttpError::Chunked.into());
    }
    let len = head
        .content_length()?
        .ok_or(HttpError::MissingContentLength)?;
    let max = envelope_limit(max_msg_size);
    if len > max {
        return Err(HttpError::BodyTooLarge { len, max }.into());
    }
    if len < ENVELOPE_HEADER_LEN as u64 {
        return Err(HttpError::BodyTooShort(len).into());
    }
    Ok(reader.read_n(len as usize).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgate_core::wire::MAX_ENVELOPE_LEN;

    fn request(body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "POST /api HTTP/1.1\r\nHost: gw\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn reader(bytes: Vec<u8>) -> Reader<std::io::Cursor<Vec<u8>>> {
        Reader::new(std::io::Cursor::new(bytes))
    }

    #[tokio::test]
    async fn reads_body_as_envelope() {
        let body = [5u8; 30];
        let mut r = reader(request(&body));
        let envelope = read_envelope(&mut r, 0).await.unwrap();
        assert_eq!(&envelope[..], &body);
        assert!(r.buffered().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_reads_back_to_back_requests() {
        let mut wire = request(&[1u8; 24]);
        wire.extend(request(&[2u8; 26]));
        let mut r = reader(wire);
        assert_eq!(read_envelope(&mut r, 0).await.unwrap().len(), 24);
        assert_eq!(read_envelope(&mut r, 0).await.unwrap().len(), 26);
    }

    #[tokio::test]
    async fn body_shorter_than_header_is_rejected() {
        let mut r = reader(request(&[0u8; 23]));
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::Http(HttpError::BodyTooShort(23))));
    }

    #[tokio::test]
    async fn missing_content_length_is_rejected() {
        let mut r = reader(b"POST / HTTP/1.1\r\nHost: gw\r\n\r\n".to_vec());
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::Http(HttpError::MissingContentLength)));
    }

    #[tokio::test]
    async fn chunked_body_is_rejected() {
        let mut r = reader(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n".to_vec());
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(err, SessionError::Http(HttpError::Chunked)));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut r = reader(request(&[0u8; 100]));
        let err = read_envelope(&mut r, 64).await.unwrap_err();
        assert!(matches!(err, SessionError::Http(HttpError::BodyTooLarge { len: 100, max: 64 })));
    }

    #[tokio::test]
    async fn huge_content_length_is_rejected_without_a_limit() {
        let mut r = reader(b"POST / HTTP/1.1\r\nContent-Length: 4294967295\r\n\r\n".to_vec());
        let err = read_envelope(&mut r, 0).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Http(HttpError::BodyTooLarge { len: 4294967295, max: MAX_ENVELOPE_LEN })
        ));
    }

    #[test]
    fn response_carries_envelope() {
        let resp = frame(&[9u8; 28]);
        let text = String::from_utf8_lossy(&resp);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 28\r\n"));
        assert_eq!(&resp[resp.len() - 28..], &[9u8; 28]);
    }
}
