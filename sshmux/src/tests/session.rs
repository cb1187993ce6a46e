use std::time::Duration;

use tokio::io::AsyncReadExt;

use super::*;
use crate::channels::EXIT_STATUS_CLOSED;

fn request(id: ChannelId, typ: &str, want_reply: bool) -> Message {
    let mut m = to_channel(msg::CHANNEL_REQUEST, id);
    m.write_string(typ).unwrap().write_bool(want_reply);
    m
}

#[tokio::test]
async fn exec_round_trip() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let exec = tokio::spawn({
        let s = s.clone();
        async move { s.do_single_command("echo hi").await.unwrap() }
    });
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    assert_eq!(r.read_u32().unwrap(), 4);
    assert_eq!(r.read_string().unwrap(), "exec");
    assert!(r.read_bool().unwrap());
    assert_eq!(r.read_string().unwrap(), "echo hi");
    assert!(r.is_finished());

    h.feed(to_channel(msg::CHANNEL_SUCCESS, s.id())).await;
    assert!(exec.await.unwrap());
    assert!(!s.is_finished());

    let mut exit = request(s.id(), "exit-status", false);
    exit.write_u32(0).unwrap();
    h.feed(exit).await;
    assert_eq!(s.wait_for_exit(Duration::from_secs(5)).await, 0);
    assert!(s.is_finished());
    assert!(h.try_next().is_none());
}

#[tokio::test]
async fn one_request_at_a_time() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let shell = tokio::spawn({
        let s = s.clone();
        async move { s.do_shell().await.unwrap() }
    });
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    assert_eq!(m.reader().remaining().get(4..), Some(&b"\0\0\0\x05shell\x01"[..]));

    let env = tokio::spawn({
        let s = s.clone();
        async move { s.set_environment("LANG", "C").await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.try_next().is_none());

    h.feed(to_channel(msg::CHANNEL_SUCCESS, s.id())).await;
    assert!(shell.await.unwrap());
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    r.read_u32().unwrap();
    assert_eq!(r.read_string().unwrap(), "env");
    h.feed(to_channel(msg::CHANNEL_FAILURE, s.id())).await;
    assert!(!env.await.unwrap());
}

#[tokio::test]
async fn close_releases_pending_request() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let shell = tokio::spawn({
        let s = s.clone();
        async move { s.do_shell().await.unwrap() }
    });
    h.expect(msg::CHANNEL_REQUEST).await;
    h.feed(to_channel(msg::CHANNEL_CLOSE, s.id())).await;
    assert!(!shell.await.unwrap());
    assert_eq!(
        s.wait_for_exit(Duration::from_secs(5)).await,
        EXIT_STATUS_CLOSED
    );
    // A reply arriving now has nothing to complete.
    h.feed(to_channel(msg::CHANNEL_SUCCESS, s.id())).await;
}

#[tokio::test]
async fn non_blocking_requests() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;
    s.set_blocking(false).unwrap();

    assert!(s.do_subsystem("sftp").await.unwrap());
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    r.read_u32().unwrap();
    assert_eq!(r.read_string().unwrap(), "subsystem");
    assert!(!r.read_bool().unwrap());
    assert_eq!(r.read_string().unwrap(), "sftp");
}

#[tokio::test]
async fn pty_and_signals() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let pty = tokio::spawn({
        let s = s.clone();
        async move {
            s.request_pty("xterm", 80, 24, 0, 0, &[(53, 1)])
                .await
                .unwrap()
        }
    });
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    r.read_u32().unwrap();
    assert_eq!(r.read_string().unwrap(), "pty-req");
    assert!(r.read_bool().unwrap());
    assert_eq!(r.read_string().unwrap(), "xterm");
    for expected in [80, 24, 0, 0] {
        assert_eq!(r.read_u32().unwrap(), expected);
    }
    assert_eq!(r.read_bytes().unwrap(), vec![53, 0, 0, 0, 1, 0]);
    h.feed(to_channel(msg::CHANNEL_SUCCESS, s.id())).await;
    assert!(pty.await.unwrap());

    assert!(s.send_window_change(100, 40, 0, 0).await.unwrap());
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    r.read_u32().unwrap();
    assert_eq!(r.read_string().unwrap(), "window-change");
    assert!(!r.read_bool().unwrap());

    assert!(s.send_signal(Sig::TERM).await.unwrap());
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    r.read_u32().unwrap();
    assert_eq!(r.read_string().unwrap(), "signal");
    assert!(!r.read_bool().unwrap());
    assert_eq!(r.read_string().unwrap(), "TERM");
}

#[tokio::test]
async fn exit_signal() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let mut m = request(s.id(), "exit-signal", false);
    m.write_string("KILL")
        .unwrap()
        .write_bool(true)
        .write_string("killed")
        .unwrap()
        .write_string("en")
        .unwrap();
    h.feed(m).await;
    let exit = s.exit_status().unwrap();
    assert_eq!(exit.status, 137);
    assert_eq!(exit.signal, Some(Sig::KILL));
    assert!(exit.core_dumped);
    assert_eq!(exit.message, "killed");

    // Only the first exit counts.
    let mut m = request(s.id(), "exit-status", false);
    m.write_u32(3).unwrap();
    h.feed(m).await;
    assert_eq!(s.wait_for_exit(Duration::from_secs(1)).await, 137);
}

#[tokio::test]
async fn peer_requests_are_answered() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    h.feed(request(s.id(), "keepalive@openssh.com", true)).await;
    let m = h.expect(msg::CHANNEL_SUCCESS).await;
    assert_eq!(recipient(&m), 4);

    h.feed(request(s.id(), "shell", true)).await;
    let m = h.expect(msg::CHANNEL_FAILURE).await;
    assert_eq!(recipient(&m), 4);

    let mut m = request(s.id(), "xon-xoff", false);
    m.write_bool(true);
    h.feed(m).await;
    assert!(s.xon_xoff());
    assert!(h.try_next().is_none());

    // Malformed: only logged.
    h.feed(request(s.id(), "exit-status", true)).await;
    h.expect(msg::CHANNEL_FAILURE).await;
    assert!(!s.is_finished());
}

#[tokio::test]
async fn stderr_is_demultiplexed() {
    let mut h = Harness::new();
    let (mut out, out_remote) = tokio::io::duplex(64);
    let (mut err, err_remote) = tokio::io::duplex(64);
    let io = ChannelIo {
        input: None,
        output: Some(Box::new(out_remote)),
        stderr: Some(Box::new(err_remote)),
    };
    let s = h.open_session(io, 4, 1000, 100).await;

    let mut m = to_channel(msg::CHANNEL_EXTENDED_DATA, s.id());
    m.write_u32(1).unwrap().write_bytes(b"oops").unwrap();
    h.feed(m).await;
    // Unknown types are dropped.
    let mut m = to_channel(msg::CHANNEL_EXTENDED_DATA, s.id());
    m.write_u32(9).unwrap().write_bytes(b"???").unwrap();
    h.feed(m).await;
    h.feed(data(s.id(), b"fine")).await;

    let mut buf = [0; 4];
    err.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"oops");
    out.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"fine");
    assert_eq!(s.info().bytes_received, 11);
    assert_eq!(s.status(), OpenStatus::Open);
}

#[tokio::test]
async fn break_request() {
    let mut h = Harness::new();
    let s = h.open_session(ChannelIo::empty(), 4, 1000, 100).await;

    let brk = tokio::spawn({
        let s = s.clone();
        async move { s.do_break(500).await.unwrap() }
    });
    let m = h.expect(msg::CHANNEL_REQUEST).await;
    let mut r = m.reader();
    assert_eq!(r.read_u32().unwrap(), 4);
    assert_eq!(r.read_string().unwrap(), "break");
    assert!(r.read_bool().unwrap());
    assert_eq!(r.read_u32().unwrap(), 500);
    h.feed(to_channel(msg::CHANNEL_FAILURE, s.id())).await;
    assert!(!brk.await.unwrap());
}
