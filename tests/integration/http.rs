use crate::*;

fn post(envelope: &[u8]) -> Vec<u8> {
    let mut req = format!(
        "POST /gateway HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Length: {}\r\n\r\n",
        envelope.len()
    )
    .into_bytes();
    req.extend_from_slice(envelope);
    req
}

async fn read_response(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let head = read_http_head(stream).await?;
    let len: usize = header_value(&head, "content-length")
        .context("no content-length")?
        .parse()?;
    let mut body = vec![0u8; len];
    within(stream.read_exact(&mut body)).await??;
    Ok((head, body))
}

#[tokio::test]
async fn http_post_echo() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    let envelope = plain_envelope(b"via http");
    stream.write_all(&post(&envelope)).await?;

    let (head, body) = read_response(&mut stream).await?;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(header_value(&head, "content-type"), Some("application/octet-stream"));
    assert_eq!(header_value(&head, "connection"), Some("Keep-Alive"));
    assert!(header_value(&head, "date").is_some_and(|d| d.ends_with("GMT")));
    assert_eq!(body, envelope);

    gw.shutdown().await
}

#[tokio::test]
async fn http_keep_alive_serves_several_requests() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    for i in 0..3u8 {
        let envelope = plain_envelope(&[i; 12]);
        stream.write_all(&post(&envelope)).await?;
        let (_, body) = read_response(&mut stream).await?;
        assert_eq!(body, envelope);
    }

    gw.shutdown().await
}

#[tokio::test]
async fn http_body_without_envelope_drops_connection() -> Result<()> {
    let gw = Gateway::start().await?;
    let mut stream = gw.connect().await?;

    stream.write_all(&post(b"too short")).await?;
    assert!(reaches_eof(&mut stream).await?);

    gw.shutdown().await
}
