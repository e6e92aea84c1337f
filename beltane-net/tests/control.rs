//! Control-plane handshake and heartbeat over localhost TCP.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use beltane_net::{ControlClient, ControlServer};

#[test]
fn handshake_then_ping_both_directions() {
    let server = ControlServer::bind(0).unwrap();
    let addr = format!("127.0.0.1:{}", server.local_port());

    let client = ControlClient::connect(&addr).unwrap();
    assert_eq!(server.wait_for_connections(1, Duration::from_secs(2)), 1);

    let replied = server.ping(Duration::from_secs(1));
    assert_eq!(replied.len(), 1);

    assert!(client.ping(Duration::from_secs(1)));

    client.disconnect().unwrap();
}

#[test]
fn version_mismatch_is_refused() {
    let server = ControlServer::bind(0).unwrap();
    let addr = format!("127.0.0.1:{}", server.local_port());

    // Handshake with a protocol version the server does not speak.
    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream.write_all(&[1, 99, 0, 0, 0]).unwrap();

    // The server drops the connection without acking.
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) => {}
        other => panic!("expected server to close the connection, got {:?}", other),
    }
    assert_eq!(server.connected_count(), 0);
}

#[test]
fn shutdown_closes_parked_peer_connections() {
    let server = ControlServer::bind(0).unwrap();
    let addr = format!("127.0.0.1:{}", server.local_port());

    // A handshaken peer that sends nothing, so the server-side reader is
    // parked in a read when shutdown runs.
    let mut peer = TcpStream::connect(&addr).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    peer.write_all(&[1, 1, 0, 0, 0]).unwrap();
    let mut ack = [0u8; 5];
    peer.read_exact(&mut ack).unwrap();
    assert_eq!(ack[0], 2);

    // Drop shuts the server down, which must join the parked reader
    // rather than leave it waiting on the remote.
    drop(server);

    // The peer sees Goodbye and then a closed connection.
    let mut byte = [0u8; 1];
    assert_eq!(peer.read(&mut byte).unwrap(), 1);
    assert_eq!(byte[0], 5);
    assert_eq!(peer.read(&mut byte).unwrap(), 0);
}

#[test]
fn ping_reports_partial_results_for_silent_peers() {
    let server = ControlServer::bind(0).unwrap();
    let addr = format!("127.0.0.1:{}", server.local_port());

    let client = ControlClient::connect(&addr).unwrap();

    // A raw connection that handshakes correctly but never answers pings.
    let mut silent = TcpStream::connect(&addr).unwrap();
    silent.write_all(&[1, 1, 0, 0, 0]).unwrap();
    silent
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut ack = [0u8; 5];
    silent.read_exact(&mut ack).unwrap();
    assert_eq!(ack[0], 2);

    assert_eq!(server.wait_for_connections(2, Duration::from_secs(2)), 2);

    let replied = server.ping(Duration::from_millis(300));
    assert_eq!(replied.len(), 1);

    client.disconnect().unwrap();
}
