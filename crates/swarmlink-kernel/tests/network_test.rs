//! Host election over the network transport on loopback.

use std::net::TcpListener;
use std::time::Duration;
use swarmlink_kernel::Coordinator;
use swarmlink_types::{CoordinatorConfig, TransportKind};

/// A loopback port nobody is listening on right now.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config(port: u16, instance: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        transport: TransportKind::Network,
        channel: "NetworkTest".to_string(),
        host_address: Some(format!("127.0.0.1:{port}")),
        instance: Some(instance.to_string()),
        sync_interval_ms: 50,
        host_port_check_interval_ms: 100,
        client_list_update_interval_ms: 50,
        callback_timeout_ms: 1_000,
        ..Default::default()
    }
}

async fn drive(peers: &[&Coordinator], done: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        for peer in peers {
            peer.sync().await;
        }
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn roster_address(peer: &Coordinator, of: &Coordinator) -> Option<String> {
    let identity = of.client_identity();
    peer.roster()
        .into_iter()
        .find(|r| r.identity() == &identity)
        .and_then(|r| r.identity().address().map(str::to_string))
}

#[tokio::test]
async fn test_tcp_election_and_takeover() {
    let port = free_port();
    let p1 = Coordinator::new(config(port, "p1")).unwrap();
    let p2 = Coordinator::new(config(port, "p2")).unwrap();

    // Clients bind an ephemeral port, so their address appears on start.
    assert!(p1.client_address().is_none());
    assert_eq!(
        p1.host_address().as_deref(),
        Some(format!("tcp://127.0.0.1:{port}/NetworkTest/HostNetworkTest").as_str())
    );

    assert!(p1.start().await);
    assert!(p1.status().is_host);
    assert!(p2.start().await);
    assert!(!p2.status().is_host);

    let p2_address = p2.client_address().expect("client bound without an address");
    assert!(p2_address.starts_with("tcp://127.0.0.1:"));
    assert!(!p2_address.starts_with(&format!("tcp://127.0.0.1:{port}/")));
    assert_eq!(p2.client_identity().address(), Some(p2_address.as_str()));

    let converged = drive(&[&p1, &p2], || p1.roster().len() == 2 && p2.roster().len() == 2).await;
    assert!(converged, "rosters did not converge over TCP");
    assert_eq!(roster_address(&p1, &p2), Some(p2_address));
    assert_eq!(roster_address(&p2, &p1), p1.client_address());

    p1.shutdown().await;
    assert!(drive(&[&p2], || p2.status().is_host).await, "p2 never took over");
    p2.shutdown().await;
}
