//! Two-controller handshake over an in-memory loopback socket pair —
//! scenario 1 and 2 from the testable-properties list: happy-path
//! establishment within 1s at `peer_version == PROTOCOL_VERSION`, and
//! idempotent handling of an `INIT` retransmit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use vocalink::config::JsonServerConfig;
use vocalink::controller::Controller;
use vocalink::testutil::LoopbackSocket;
use vocalink::types::ControllerState;

fn shared_key() -> [u8; 256] {
    [0x42u8; 256]
}

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn two_controllers_establish_within_one_second() {
    let (sock_a, sock_b) = LoopbackSocket::pair(40000, 40001);
    let a = Controller::new(Arc::new(sock_a), Arc::new(JsonServerConfig::new()), true);
    let b = Controller::new(Arc::new(sock_b), Arc::new(JsonServerConfig::new()), false);

    a.set_encryption_key(shared_key()).unwrap();
    b.set_encryption_key(shared_key()).unwrap();

    let relay_a = vocalink::endpoint::Endpoint::new(
        1,
        vocalink::types::EndpointKind::UdpRelay,
        Some(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        None,
        40001,
        [9u8; 16],
    );
    let relay_b = vocalink::endpoint::Endpoint::new(
        1,
        vocalink::types::EndpointKind::UdpRelay,
        Some(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        None,
        40000,
        [9u8; 16],
    );
    a.set_remote_endpoints(vec![relay_a], false);
    b.set_remote_endpoints(vec![relay_b], false);

    a.start().unwrap();
    b.start().unwrap();
    a.connect();
    b.connect();

    assert!(wait_until(|| a.state() == ControllerState::Established && b.state() == ControllerState::Established, Duration::from_secs(1)));

    a.stop();
    b.stop();
}

#[test]
fn init_retransmit_is_handled_idempotently() {
    let (sock_a, sock_b) = LoopbackSocket::pair(40010, 40011);
    let a = Controller::new(Arc::new(sock_a), Arc::new(JsonServerConfig::new()), true);
    let b = Controller::new(Arc::new(sock_b), Arc::new(JsonServerConfig::new()), false);

    a.set_encryption_key(shared_key()).unwrap();
    b.set_encryption_key(shared_key()).unwrap();

    let relay_a = vocalink::endpoint::Endpoint::new(1, vocalink::types::EndpointKind::UdpRelay, Some(std::net::Ipv4Addr::new(127, 0, 0, 1)), None, 40011, [9u8; 16]);
    let relay_b = vocalink::endpoint::Endpoint::new(1, vocalink::types::EndpointKind::UdpRelay, Some(std::net::Ipv4Addr::new(127, 0, 0, 1)), None, 40010, [9u8; 16]);
    a.set_remote_endpoints(vec![relay_a], false);
    b.set_remote_endpoints(vec![relay_b], false);

    a.start().unwrap();
    b.start().unwrap();
    // Only `a` initiates; per the handshake table, `b` replies to an
    // `INIT` with a single `INIT_ACK` without entering `WaitInitAck`
    // itself ("any / recv PKT_INIT / unchanged"), so `a` alone is
    // expected to reach `Established`.
    a.connect();

    assert!(wait_until(|| a.state() == ControllerState::Established, Duration::from_secs(1)));
    // Give `a`'s 0.5s retransmit timer a chance to have fired at least
    // once before settling; a retransmitted `INIT` must be idempotent
    // on `b`'s side and must not knock `a` out of `Established`.
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(a.state(), ControllerState::Established);
    assert_eq!(b.state(), ControllerState::WaitInit, "b never called Connect(), so its own state is untouched by replying to INIT");

    a.stop();
    b.stop();
}
