//! Multi-member scenarios over real loopback sockets.

use gossipmesh::{
    ChannelEventDelegate, MemberEventKind, Membership, MembershipConfig, MessageKind,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config(name: &str) -> MembershipConfig {
    let mut config = MembershipConfig::new(name, "127.0.0.1:0".parse().unwrap());
    config.probe_interval = Duration::from_millis(60);
    config.probe_timeout = Duration::from_millis(20);
    config.gossip_interval = Duration::from_millis(20);
    config.gossip_nodes = 3;
    config.push_pull_interval = Duration::from_millis(150);
    config.suspicion_mult = 3;
    config
}

async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn three_members_converge() {
    let a = Membership::create(fast_config("node-a")).await.unwrap();
    let b = Membership::create(fast_config("node-b")).await.unwrap();
    let c = Membership::create(fast_config("node-c")).await.unwrap();

    assert_eq!(b.join(&[a.advertise_addr()]).await.unwrap(), 1);
    assert_eq!(c.join(&[b.advertise_addr()]).await.unwrap(), 1);

    let converged = wait_for(Duration::from_secs(10), || {
        a.num_members() == 3 && b.num_members() == 3 && c.num_members() == 3
    })
    .await;
    assert!(
        converged,
        "views: a={} b={} c={}",
        a.num_members(),
        b.num_members(),
        c.num_members()
    );

    let names: HashSet<String> = a.members().into_iter().map(|n| n.name).collect();
    assert_eq!(
        names,
        ["node-a", "node-b", "node-c"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    );

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn silent_member_is_detected_and_removed() {
    let (events, mut event_rx) = ChannelEventDelegate::new();
    let a = Membership::create_with(fast_config("node-a"), Some(Arc::new(events)), None)
        .await
        .unwrap();
    let b = Membership::create(fast_config("node-b")).await.unwrap();
    let c = Membership::create(fast_config("node-c")).await.unwrap();
    let d = Membership::create(fast_config("node-d")).await.unwrap();

    b.join(&[a.advertise_addr()]).await.unwrap();
    c.join(&[a.advertise_addr()]).await.unwrap();
    d.join(&[a.advertise_addr()]).await.unwrap();

    let converged = wait_for(Duration::from_secs(10), || {
        [&a, &b, &c, &d].iter().all(|m| m.num_members() == 4)
    })
    .await;
    assert!(converged, "cluster must converge before the failure");

    // Kill node-d's protocol without closing its sockets: the member goes
    // silent, exactly like a crashed process behind a live NIC.
    d.shutdown();

    let detected = wait_for(Duration::from_secs(15), || {
        [&a, &b, &c].iter().all(|m| m.num_members() == 3)
    })
    .await;
    assert!(
        detected,
        "views after failure: a={} b={} c={}",
        a.num_members(),
        b.num_members(),
        c.num_members()
    );

    // node-a observed the join and the eventual leave of node-d.
    let mut saw_join = false;
    let mut saw_leave = false;
    while let Ok(event) = event_rx.try_recv() {
        if event.node.name == "node-d" {
            match event.kind {
                MemberEventKind::Join => saw_join = true,
                MemberEventKind::Leave => saw_leave = true,
            }
        }
    }
    assert!(saw_join && saw_leave);

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn graceful_leave_propagates() {
    let a = Membership::create(fast_config("node-a")).await.unwrap();
    let b = Membership::create(fast_config("node-b")).await.unwrap();

    b.join(&[a.advertise_addr()]).await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || a.num_members() == 2).await);

    b.leave(Duration::from_secs(5)).await.unwrap();

    let removed = wait_for(Duration::from_secs(10), || a.num_members() == 1).await;
    assert!(removed, "node-a still sees {} members", a.num_members());

    b.shutdown();
    a.shutdown();
}

#[tokio::test]
async fn false_suspicion_is_refuted() {
    let a = Membership::create(fast_config("node-a")).await.unwrap();
    let b = Membership::create(fast_config("node-b")).await.unwrap();

    b.join(&[a.advertise_addr()]).await.unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        a.num_members() == 2 && b.num_members() == 2
    })
    .await);

    // Inject a false rumour straight at node-b: it must refute it with a
    // higher incarnation instead of sulking out of the cluster.
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rumour = gossipmesh::message::encode(
        MessageKind::Suspect,
        &gossipmesh::message::Suspect {
            incarnation: 7,
            node: "node-b".to_string(),
        },
    )
    .unwrap();
    socket.send_to(&rumour, b.advertise_addr()).await.unwrap();

    // Outlast the suspicion window; both views must keep both members.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(a.num_members(), 2);
    assert_eq!(b.num_members(), 2);
    assert!(b
        .members()
        .iter()
        .any(|node| node.name == "node-b"));

    a.shutdown();
    b.shutdown();
}
