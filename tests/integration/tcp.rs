use crate::*;

use chatgate_net::KeyState;

/// A plaintext frame of length 32 carrying "hello" plus padding comes back
/// unchanged.
#[tokio::test]
async fn tcp_plaintext_echo() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    let envelope = plain_envelope(b"hello\0\0\0");
    let frame = tcp_frame(&envelope);
    assert_eq!(&frame[..4], &32u32.to_le_bytes());
    stream.write_all(&frame).await?;

    let reply = read_tcp_envelope(&mut stream).await?;
    assert_eq!(reply, envelope);

    gw.shutdown().await
}

#[tokio::test]
async fn tcp_messages_keep_their_order() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    for i in 0..20u8 {
        stream.write_all(&tcp_frame(&plain_envelope(&[i; 8]))).await?;
    }
    for i in 0..20u8 {
        let reply = read_tcp_envelope(&mut stream).await?;
        assert_eq!(&reply[24..], &[i; 8]);
    }

    gw.shutdown().await
}

#[tokio::test]
async fn tcp_encrypted_after_key_negotiation() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    let key_id = [0x5e; 8];
    let secret: [u8; 32] = rand::random();
    let mut client = KeyState::default();

    // negotiation message travels in the clear
    let mut negotiate = KEY_PREFIX.to_vec();
    negotiate.extend_from_slice(&key_id);
    negotiate.extend_from_slice(&secret);
    stream.write_all(&tcp_frame(&client.seal(&negotiate))).await?;

    client.set_share_key(key_id, ShareKey::new(secret))?;
    let ok = read_tcp_envelope(&mut stream).await?;
    assert_eq!(&ok[..8], &key_id);
    assert!(ok[8..24].iter().any(|b| *b != 0), "reply should be encrypted");
    assert_eq!(&client.open(Bytes::from(ok))?[..], b"OK");

    let message = b"an encrypted message of some length";
    stream.write_all(&tcp_frame(&client.seal(message))).await?;
    let reply = read_tcp_envelope(&mut stream).await?;
    assert_ne!(&reply[24..], message.as_slice());
    assert_eq!(&client.open(Bytes::from(reply))?[..], message);

    gw.shutdown().await
}

#[tokio::test]
async fn tcp_short_frame_drops_connection() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    stream.write_all(&tcp_frame(&[0u8; 28])).await?;
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}

#[tokio::test]
async fn tcp_oversized_frame_drops_connection() -> Result<()> {
    let gw = Gateway::start_with(|c| c.session.max_msg_size = 128).await?;
    let mut stream = gw.connect().await?;

    stream.write_all(&tcp_frame(&plain_envelope(&[1u8; 200]))).await?;
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}

#[tokio::test]
async fn tcp_encrypted_without_key_drops_connection() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    let mut sender = KeyState::default();
    sender.set_share_key([1; 8], ShareKey::new([2; 32]))?;
    stream.write_all(&tcp_frame(&sender.seal(b"nobody can read this"))).await?;
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}
