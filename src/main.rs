//! Minimal two-process-in-one-binary demo: binds two real UDP sockets on
//! loopback, runs a call end to end through `Controller`, and prints the
//! state transitions and stats once established.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use vocalink::collaborators::Socket;
use vocalink::config::JsonServerConfig;
use vocalink::controller::Controller;
use vocalink::endpoint::Endpoint;
use vocalink::socket::UdpTransport;
use vocalink::types::{ControllerState, EndpointKind};

fn main() -> Result<()> {
    let key = [0x7au8; 256];

    let sock_a = Arc::new(UdpTransport::bind(0)?);
    let sock_b = Arc::new(UdpTransport::bind(0)?);
    let port_a = sock_a.local_port();
    let port_b = sock_b.local_port();

    let a = Controller::new(sock_a, Arc::new(JsonServerConfig::new()), true);
    let b = Controller::new(sock_b, Arc::new(JsonServerConfig::new()), false);
    a.set_encryption_key(key)?;
    b.set_encryption_key(key)?;

    let relay_tag = [0x11u8; 16];
    a.set_remote_endpoints(vec![Endpoint::new(1, EndpointKind::UdpRelay, Some(Ipv4Addr::LOCALHOST), None, port_b, relay_tag)], false);
    b.set_remote_endpoints(vec![Endpoint::new(1, EndpointKind::UdpRelay, Some(Ipv4Addr::LOCALHOST), None, port_a, relay_tag)], false);

    a.start()?;
    b.start()?;
    a.connect();
    b.connect();

    for _ in 0..50 {
        if a.state() == ControllerState::Established && b.state() == ControllerState::Established {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    println!("a: {:?}, b: {:?}", a.state(), b.state());
    println!("a stats: {:?}", a.get_stats());
    println!("a rtt: {:.3}s", a.get_average_rtt());

    a.stop();
    b.stop();
    Ok(())
}
