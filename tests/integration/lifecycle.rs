use crate::*;

#[tokio::test]
async fn stop_closes_open_connections() -> Result<()> {
    let gw = Gateway::start().await?;

    let mut streams = Vec::new();
    for _ in 0..16 {
        let mut stream = gw.connect().await?;
        // make sure each connection is past sniffing
        let envelope = plain_envelope(b"ping");
        stream.write_all(&tcp_frame(&envelope)).await?;
        assert_eq!(read_tcp_envelope(&mut stream).await?, envelope);
        streams.push(stream);
    }
    let manager = gw.server.manager().clone();
    assert_eq!(manager.live_count(), 16);

    gw.shutdown().await?;

    assert_eq!(manager.live_count(), 0);
    assert!(manager.is_empty());
    for stream in &mut streams {
        assert!(reaches_eof(stream).await?);
    }
    Ok(())
}

#[tokio::test]
async fn idle_connection_is_counted_until_it_leaves() -> Result<()> {
    let gw = Gateway::start().await?;
    let manager = gw.server.manager().clone();

    let stream = gw.connect().await?;
    within(async {
        while manager.live_count() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    drop(stream);
    within(async {
        while manager.live_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    gw.shutdown().await
}

#[tokio::test]
async fn connections_after_stop_are_refused() -> Result<()> {
    let gw = Gateway::start().await?;
    let addr = gw.server.local_addr();
    gw.shutdown().await?;

    // the listener is gone once the server is dropped; at the latest the
    // accepted socket is closed immediately
    match TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(mut stream) => {
            let _ = stream.write_all(&tcp_frame(&plain_envelope(b"late"))).await;
            assert!(reaches_eof(&mut stream).await?);
        }
    }
    Ok(())
}
