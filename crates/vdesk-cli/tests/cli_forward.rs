//! Process-level tests for `vdesk forward`.
// Test module - relaxed lint rules
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn vdesk_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_vdesk"))
}

/// Kills the forwarder when the test ends, pass or fail.
struct Forwarder(Child);

impl Drop for Forwarder {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn echo_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            thread::spawn(move || {
                let mut reader = stream.try_clone().unwrap();
                let _ = std::io::copy(&mut reader, &mut stream);
            });
        }
    });
    port
}

fn connect_with_retry(port: u16) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(err) => panic!("forwarder never came up: {err}"),
        }
    }
}

#[test]
fn forward_relays_bytes_both_ways() {
    let upstream = echo_upstream();
    let local = free_port();
    let _child = Forwarder(
        vdesk_bin()
            .args([
                "forward",
                &local.to_string(),
                "127.0.0.1",
                &upstream.to_string(),
                "--bind",
                "127.0.0.1",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn"),
    );

    let mut client = connect_with_retry(local);
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello through the relay").unwrap();
    let mut reply = [0u8; 23];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello through the relay");
}

#[test]
fn forward_fails_when_port_is_taken() {
    let taken = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let output = vdesk_bin()
        .args(["--color=never", "forward", &port.to_string(), "127.0.0.1", "1"])
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bind"), "stderr: {stderr}");
}

#[test]
fn forward_rejects_non_numeric_ports() {
    let output = vdesk_bin()
        .args(["forward", "ssh", "127.0.0.1", "22"])
        .output()
        .expect("failed to execute");

    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn forward_rejects_zero_connect_timeout() {
    let output = vdesk_bin()
        .args(["forward", "9000", "127.0.0.1", "22", "--connect-timeout", "0"])
        .output()
        .expect("failed to execute");

    assert!(!output.status.success());
}

#[test]
fn forward_rejects_malformed_extra_rule() {
    let output = vdesk_bin()
        .args(["forward", "9000", "127.0.0.1", "22", "--also", "9001-host-22"])
        .output()
        .expect("failed to execute");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("9001-host-22"));
}
