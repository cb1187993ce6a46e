use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::*;

fn adjust(m: &Message) -> (u32, u32) {
    let mut r = m.reader();
    (r.read_u32().unwrap(), r.read_u32().unwrap())
}

fn payload(m: &Message) -> (u32, Vec<u8>) {
    let mut r = m.reader();
    (r.read_u32().unwrap(), r.read_bytes().unwrap())
}

#[tokio::test]
async fn half_window_is_acknowledged_once() {
    let mut h = Harness::with_config(Config {
        window_size: 1000,
        maximum_packet_size: 400,
        ..Default::default()
    });
    let s = h.open_session(ChannelIo::empty(), 3, 1000, 100).await;

    for _ in 0..3 {
        h.feed(data(s.id(), &[0; 125])).await;
        assert!(h.try_next().is_none());
    }
    h.feed(data(s.id(), &[0; 125])).await;
    let m = h.expect(msg::CHANNEL_WINDOW_ADJUST).await;
    assert_eq!(adjust(&m), (3, 500));
    assert_eq!(s.info().receive_window, 1000);

    h.feed(data(s.id(), &[0; 125])).await;
    assert!(h.try_next().is_none());
}

#[tokio::test]
async fn three_packets_are_acknowledged() {
    let mut h = Harness::with_config(Config {
        window_size: 10000,
        maximum_packet_size: 100,
        ..Default::default()
    });
    let s = h.open_session(ChannelIo::empty(), 3, 1000, 100).await;

    h.feed(data(s.id(), &[0; 100])).await;
    h.feed(data(s.id(), &[0; 100])).await;
    assert!(h.try_next().is_none());
    h.feed(data(s.id(), &[0; 100])).await;
    let m = h.expect(msg::CHANNEL_WINDOW_ADJUST).await;
    assert_eq!(adjust(&m), (3, 300));
}

#[tokio::test]
async fn overflowing_the_window_disconnects() {
    let mut h = Harness::with_config(Config {
        window_size: 1000,
        maximum_packet_size: 2000,
        ..Default::default()
    });
    let s = h.open_session(ChannelIo::empty(), 3, 1000, 100).await;

    let err = h
        .conn
        .handle_message(data(s.id(), &[0; 1001]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WindowExceeded { excess: 1, .. }));
    let m = h.expect(msg::DISCONNECT).await;
    assert_eq!(recipient(&m), Disconnect::ProtocolError as u32);
    assert!(s.is_closed());
    assert_eq!(h.handler.count(|e| *e == Event::Fatal), 1);
}

#[tokio::test]
async fn transmit_waits_for_window() {
    let mut h = Harness::new();
    let (mut local, remote) = tokio::io::duplex(64);
    local.write_all(&[7; 16]).await.unwrap();
    let s = h
        .open_session(ChannelIo::from_stream(remote), 5, 10, 4)
        .await;

    let mut sent = 0;
    while sent < 10 {
        let (to, bytes) = payload(&h.expect(msg::CHANNEL_DATA).await);
        assert_eq!(to, 5);
        assert!(bytes.len() <= 4);
        sent += bytes.len();
    }
    assert_eq!(sent, 10);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.try_next().is_none());
    assert_eq!(s.info().transmit_window, 0);

    let mut m = to_channel(msg::CHANNEL_WINDOW_ADJUST, s.id());
    m.write_u32(100).unwrap();
    h.feed(m).await;
    while sent < 16 {
        let (_, bytes) = payload(&h.expect(msg::CHANNEL_DATA).await);
        sent += bytes.len();
    }
    assert_eq!(sent, 16);

    drop(local);
    h.expect(msg::CHANNEL_EOF).await;
    assert_eq!(s.info().bytes_sent, 16);
}

#[tokio::test]
async fn close_wakes_blocked_transmit() {
    let mut h = Harness::new();
    let (mut local, remote) = tokio::io::duplex(64);
    local.write_all(b"pending").await.unwrap();
    let s = h
        .open_session(ChannelIo::from_stream(remote), 5, 0, 100)
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.try_next().is_none());

    s.close().await;
    h.expect(msg::CHANNEL_CLOSE).await;
    h.feed(to_channel(msg::CHANNEL_CLOSE, s.id())).await;
    assert!(s.is_closed());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.try_next().is_none());
}

#[tokio::test]
async fn received_data_reaches_the_output() {
    let mut h = Harness::new();
    let (mut local, remote) = tokio::io::duplex(64);
    let io = ChannelIo {
        input: None,
        output: Some(Box::new(remote)),
        stderr: None,
    };
    let s = h.open_session(io, 5, 1000, 100).await;

    h.feed(data(s.id(), b"abc")).await;
    let mut buf = [0; 3];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abc");

    h.feed(to_channel(msg::CHANNEL_EOF, s.id())).await;
    let mut rest = Vec::new();
    local.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn queued_delivery() {
    let mut h = Harness::with_config(Config {
        queued_delivery: true,
        queue_depth: 2,
        ..Default::default()
    });
    assert!(!h.conn.config().rekey);
    let (mut local, remote) = tokio::io::duplex(64);
    let io = ChannelIo {
        input: None,
        output: Some(Box::new(remote)),
        stderr: None,
    };
    let s = h.open_session(io, 5, 1000, 100).await;

    for chunk in [&b"one "[..], b"two ", b"three"] {
        h.feed(data(s.id(), chunk)).await;
    }
    h.feed(to_channel(msg::CHANNEL_EOF, s.id())).await;
    let mut received = String::new();
    local.read_to_string(&mut received).await.unwrap();
    assert_eq!(received, "one two three");
}

struct StripCr;

impl StreamFilter for StripCr {
    fn outbound(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>, Error> {
        data.retain(|b| *b != b'\r');
        Ok(data)
    }
}

#[tokio::test]
async fn sent_bytes_are_counted_after_filtering() {
    let mut h = Harness::new();
    let (mut local, remote) = tokio::io::duplex(64);
    let s = h
        .open_session(ChannelIo::from_stream(remote), 5, 1000, 100)
        .await;
    s.set_filter(Box::new(StripCr));

    local.write_all(b"a\r\nb\r\n").await.unwrap();
    let mut sent = Vec::new();
    while sent.len() < 4 {
        let (_, bytes) = payload(&h.expect(msg::CHANNEL_DATA).await);
        sent.extend(bytes);
    }
    assert_eq!(sent, b"a\nb\n");

    drop(local);
    h.expect(msg::CHANNEL_EOF).await;
    assert_eq!(s.info().bytes_sent, 4);
}
