// SPDX-License-Identifier: (MIT OR Apache-2.0)
mod common;

use std::fs::File;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

use common::run_task;
use spindle_rt::net::{
    resolve_address, socket, socketpair, Address, ControlMessage, Family, SockType, Socket,
};
use spindle_rt::{sleep, spawn, Cx, Error, Result, Task};

async fn resolve(cx: &Cx, address: Address, local: bool) -> Result<SocketAddr> {
    let addr = resolve_address(cx, Family::INET, SockType::STREAM, 0, false, &address, local).await?;
    addr.as_socket_addr()
        .ok_or_else(|| Error::InvalidAddress("not an inet address".to_string()))
}

#[test]
fn resolves_special_hosts() {
    let (numeric, wildcard, broadcast) = run_task(Task::new(|cx| async move {
        let numeric = resolve(&cx, Address::inet("127.0.0.1", 8080), false).await?;
        let wildcard = resolve(&cx, Address::inet("", 9000), true).await?;
        let broadcast = resolve(&cx, Address::inet("<broadcast>", 53), false).await?;
        Ok((numeric, wildcard, broadcast))
    }))
    .unwrap();
    assert_eq!(numeric, SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)));
    assert_eq!(wildcard, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)));
    assert_eq!(broadcast, SocketAddr::from((Ipv4Addr::BROADCAST, 53)));
}

#[test]
fn rejects_mismatched_address_shapes() {
    let err = run_task(Task::new(|cx| async move {
        resolve(&cx, Address::unix("/tmp/nope.sock"), false).await
    }))
    .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));

    let err = run_task(Task::new(|cx| async move {
        resolve(&cx, Address::inet("local\0host", 1), false).await
    }))
    .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}

async fn listener(cx: &Cx) -> Result<(Socket, SocketAddr)> {
    let sock = socket(cx, Family::INET, SockType::STREAM, 0)?;
    sock.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
    sock.bind(cx, &Address::inet("127.0.0.1", 0)).await?;
    sock.listen(None)?;
    let local = sock
        .getsockname()?
        .as_socket_addr()
        .ok_or_else(|| Error::InvalidAddress("listener has no inet name".to_string()))?;
    Ok((sock, local))
}

#[test]
fn tcp_echo_round_trip() {
    let echoed = run_task(Task::new(|cx| async move {
        let (server, local) = listener(&cx).await?;
        assert_ne!(local.port(), 0);

        let echo = Task::new(move |cx| async move {
            let (conn, peer) = server.accept(&cx).await?;
            assert!(peer.as_socket_addr().is_some());
            loop {
                let chunk = conn.recv(&cx, 64, 0).await?;
                if chunk.is_empty() {
                    return Ok(Vec::new());
                }
                conn.send(&cx, &chunk, 0).await?;
            }
        });

        let client = Task::new(move |cx| async move {
            let sock = socket(&cx, Family::INET, SockType::STREAM, 0)?;
            sock.connect(&cx, &Address::from(local)).await?;
            let peer = sock.getpeername()?.as_socket_addr();
            assert_eq!(peer, Some(local));

            let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
            for piece in payload.chunks(1000) {
                sock.send(&cx, piece, 0).await?;
                sleep(&cx, Duration::from_millis(1)).await?;
            }
            sock.shutdown(Shutdown::Write)?;

            let mut back = Vec::new();
            loop {
                let chunk = sock.recv(&cx, 4096, 0).await?;
                if chunk.is_empty() {
                    break;
                }
                back.extend_from_slice(&chunk);
            }
            assert_eq!(back, payload);
            Ok(back)
        });

        let mut results = spawn(&cx, [echo, client]).values(&cx).await?;
        Ok(results.remove(1).len())
    }))
    .unwrap();
    assert_eq!(echoed, 10_000);
}

#[test]
fn udp_sendto_recvfrom_skips_empty_payload() {
    let (data, from) = run_task(Task::new(|cx| async move {
        let a = socket(&cx, Family::INET, SockType::DGRAM, 0)?;
        let b = socket(&cx, Family::INET, SockType::DGRAM, 0)?;
        a.bind(&cx, &Address::inet("127.0.0.1", 0)).await?;
        b.bind(&cx, &Address::inet("127.0.0.1", 0)).await?;
        let a_addr = a.getsockname()?.as_socket_addr();
        let b_addr = b.getsockname()?.as_socket_addr();

        let target = Address::from(b_addr.ok_or_else(|| Error::InvalidAddress("unbound".to_string()))?);
        assert_eq!(a.sendto(&cx, b"", &target, 0).await?, 0);
        a.sendto(&cx, b"ping", &target, 0).await?;
        let (data, from) = b.recvfrom(&cx, 64, 0).await?;
        let from = from.and_then(|addr| addr.as_socket_addr());
        assert_eq!(from, a_addr);
        Ok((data, from.is_some()))
    }))
    .unwrap();
    assert_eq!(data, b"ping");
    assert!(from);
}

#[test]
fn socketpair_passes_descriptors() {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_end, write_end) = (fds[0], fds[1]);

    let received = run_task(Task::new(move |cx| async move {
        let (left, right) = socketpair(&cx, Family::UNIX, SockType::STREAM, 0)?;
        let sent = left
            .sendmsg(&cx, &[&b"fd"[..], &b"!"[..]], &[ControlMessage::rights(&[write_end])], 0, None)
            .await?;
        assert_eq!(sent, 3);

        let msg = right.recvmsg(&cx, 16, 64, 0).await?;
        assert_eq!(msg.data, b"fd!");
        let fds = msg
            .ancillary
            .iter()
            .find_map(ControlMessage::fds)
            .unwrap_or_default();
        Ok(fds)
    }))
    .unwrap();

    assert_eq!(received.len(), 1);
    assert_ne!(received[0], write_end);
    let mut passed = unsafe { File::from_raw_fd(received[0]) };
    let original = unsafe { File::from_raw_fd(write_end) };
    let mut reader = unsafe { File::from_raw_fd(read_end) };
    passed.write_all(b"hello").unwrap();
    drop(passed);
    drop(original);

    let mut out = String::new();
    reader.read_to_string(&mut out).unwrap();
    assert_eq!(out, "hello");
}

#[test]
fn closed_socket_reports_bad_descriptor() {
    let (fileno, err) = run_task(Task::new(|cx| async move {
        let (mut sock, _) = listener(&cx).await?;
        assert!(sock.fileno() >= 0);
        sock.close();
        sock.close();
        let err = sock.getsockname().unwrap_err();
        Ok((sock.fileno(), err))
    }))
    .unwrap();
    assert_eq!(fileno, -1);
    match err {
        Error::Io(io) => assert_eq!(io.raw_os_error(), Some(libc::EBADF)),
        other => panic!("unexpected error: {other}"),
    }
}
