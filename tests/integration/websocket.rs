use crate::*;

const OP_CONTINUATION: u8 = 0x0;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;

#[tokio::test]
async fn websocket_handshake() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    let head = ws_handshake(&mut stream).await?;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(header_value(&head, "upgrade"), Some("websocket"));
    assert_eq!(header_value(&head, "connection"), Some("Upgrade"));
    assert_eq!(
        header_value(&head, "sec-websocket-accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert!(header_value(&head, "date").is_some());

    gw.shutdown().await
}

#[tokio::test]
async fn websocket_fragmented_echo() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;
    ws_handshake(&mut stream).await?;

    let envelope = plain_envelope(&[0x61; 300]);
    let (a, rest) = envelope.split_at(100);
    let (b, c) = rest.split_at(150);
    stream.write_all(&ws_client_frame(false, OP_BINARY, a)).await?;
    stream.write_all(&ws_client_frame(false, OP_CONTINUATION, b)).await?;
    stream.write_all(&ws_client_frame(true, OP_CONTINUATION, c)).await?;

    let (b0, payload) = read_ws_frame(&mut stream).await?;
    assert_eq!(b0, 0x82);
    assert_eq!(payload, envelope);

    gw.shutdown().await
}

#[tokio::test]
async fn websocket_ping_gets_pong() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;
    ws_handshake(&mut stream).await?;

    stream.write_all(&ws_client_frame(true, OP_PING, b"tick")).await?;
    stream
        .write_all(&ws_client_frame(true, OP_BINARY, &plain_envelope(b"data")))
        .await?;

    let (b0, payload) = read_ws_frame(&mut stream).await?;
    assert_eq!(b0, 0x8a);
    assert_eq!(payload, b"tick");
    let (b0, payload) = read_ws_frame(&mut stream).await?;
    assert_eq!(b0, 0x82);
    assert_eq!(&payload[24..], b"data");

    gw.shutdown().await
}

#[tokio::test]
async fn websocket_oversized_message_closes_with_1009() -> Result<()> {
    let gw = Gateway::start_with(|c| c.session.max_msg_size = 256).await?;
    let mut stream = gw.connect().await?;
    ws_handshake(&mut stream).await?;

    // header and mask key only; the size check happens before any payload
    let frame = ws_client_frame(true, OP_BINARY, &plain_envelope(&[0u8; 1000]));
    stream.write_all(&frame[..8]).await?;

    let (b0, payload) = read_ws_frame(&mut stream).await?;
    assert_eq!(b0, 0x88);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1009);
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}

#[tokio::test]
async fn websocket_close_handshake() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;
    ws_handshake(&mut stream).await?;

    let mut close = 1000u16.to_be_bytes().to_vec();
    close.extend_from_slice(b"done");
    stream.write_all(&ws_client_frame(true, OP_CLOSE, &close)).await?;

    let (b0, payload) = read_ws_frame(&mut stream).await?;
    assert_eq!(b0, 0x88);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}

#[tokio::test]
async fn websocket_bad_upgrade_gets_400() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    stream
        .write_all(
            b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: abc\r\nSec-WebSocket-Version: 7\r\n\r\n",
        )
        .await?;
    let head = read_http_head(&mut stream).await?;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}
