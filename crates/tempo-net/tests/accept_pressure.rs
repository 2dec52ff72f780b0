//! Accept burst under descriptor pressure: when the process fd limit is
//! exhausted, the acceptor must record `net.accept_error.emfile`, abort
//! the burst, and keep already-accepted channels serviceable.
//!
//! This file holds a single test: it manipulates `RLIMIT_NOFILE` for the
//! whole process.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::time::{Duration, Instant};

use tempo_core::metrics::{self, StCounterKey};
use tempo_net::socket::{bind_listener, local_port};
use tempo_net::{Echo, Reactor};

fn highest_open_fd() -> libc::rlim_t {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(|e| e.ok()?.file_name().into_string().ok()?.parse::<libc::rlim_t>().ok())
        .max()
        .unwrap_or(64)
}

fn roundtrip(c: &mut TcpStream, msg: &[u8]) {
    c.write_all(msg).unwrap();
    let mut buf = vec![0u8; msg.len()];
    c.read_exact(&mut buf).unwrap();
    assert_eq!(buf, msg);
}

#[test]
fn emfile_aborts_burst_and_spares_live_channels() {
    metrics::global_reset();

    let listener = bind_listener(Ipv4Addr::LOCALHOST, 0, 128).unwrap();
    let port = local_port(listener).unwrap();
    let mut reactor: Reactor<Echo> = Reactor::new();
    reactor.add_listener(listener).unwrap();
    let handle = reactor.handle();
    let join = std::thread::spawn(move || reactor.run());

    // One healthy channel established before the squeeze.
    let mut keeper = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    keeper.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    roundtrip(&mut keeper, b"before");

    // Pre-allocate client sockets while descriptors are still available;
    // connect(2) itself does not allocate an fd.
    let raw_clients: Vec<i32> = (0..4)
        .map(|_| {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            assert!(fd >= 0);
            fd
        })
        .collect();

    // Clamp the soft limit to the highest live descriptor: any further
    // allocation, including the reactor's accept4, fails with EMFILE.
    let ceiling = highest_open_fd() + 1;
    let mut old: libc::rlimit = unsafe { std::mem::zeroed() };
    unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut old) };
    let squeezed = libc::rlimit {
        rlim_cur: ceiling,
        rlim_max: old.rlim_max,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &squeezed) };
    assert_eq!(rc, 0);

    // Drive connections at the listener.
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
    sa.sin_port = port.to_be();
    for &fd in &raw_clients {
        let rc = unsafe {
            libc::connect(
                fd,
                &sa as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "connect into the backlog should succeed");
    }

    // The acceptor hits the wall and records it.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if metrics::get_counter(StCounterKey::AcceptErrorMfile) > 0 {
            break;
        }
        assert!(Instant::now() < deadline, "emfile counter never moved");
        std::thread::sleep(Duration::from_millis(20));
    }

    unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &old) };

    // The pre-existing channel kept working through the pressure.
    roundtrip(&mut keeper, b"after");

    for fd in raw_clients {
        unsafe { libc::close(fd) };
    }
    drop(keeper);
    handle.request_shutdown();
    join.join().unwrap();
}
