//! End-to-end splice: two nodes, one shared loop
//!
//! Drives the control-plane exchange by hand (the way the dispatch task
//! would) while the media plane runs for real: DTLS handshake with cookie
//! exchange over UDP, SRTP in both directions and SSRC rewriting between
//! the two sites' loops.

mod common;

use common::{addr, build_node, connection, free_udp_port, recv_envelope, TestNode};
use interconnect_engine::messages::{self, DEFAULT_CODEC};
use interconnect_engine::session::SessionEvent;
use std::time::Duration;
use tokio::net::UdpSocket;

async fn wait_srtp_ready(site: &mut TestNode) -> SessionEvent {
    let event = tokio::time::timeout(Duration::from_secs(20), site.events.recv())
        .await
        .expect("timed out waiting for SRTP")
        .expect("session event channel closed");
    assert!(
        matches!(event, SessionEvent::SrtpReady { .. }),
        "expected SrtpReady, got {event:?}"
    );
    event
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_media_crosses_sites_with_rewritten_ssrc() {
    // stands in for site2's multicast group
    let group_rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let group_addr = group_rx.local_addr().unwrap();

    let mut site1 = build_node("site1", true, &[("alpha", "127.0.0.1", free_udp_port().await)]).await;
    let mut site2 = build_node(
        "site2",
        false,
        &[("alpha", "127.0.0.1", group_addr.port())],
    )
    .await;

    site1.node.spawn_media_tasks();
    site2.node.spawn_media_tasks();

    // signaling tuples as each side would observe them
    let site1_seen_by_site2 = addr(52001);
    let site2_seen_by_site1 = addr(52002);

    // -- control plane, driven by hand -------------------------------

    let register = messages::register("site1", "shared-secret");
    let reply = site2.node.on_register_request(site1_seen_by_site2, &register);
    assert_eq!(reply.error_code(), 0);

    let invite = messages::connect_media(
        "site1",
        DEFAULT_CODEC,
        "127.0.0.1",
        site1.node.media_local_addr().unwrap().port(),
    );
    let answer = site2
        .node
        .on_connect_media_request(site1_seen_by_site2, &invite)
        .unwrap();
    assert_eq!(answer.error_code(), 0);

    // site1 learns site2's media endpoint and fingerprint, and the DTLS
    // handshake starts against site2's media socket
    site1
        .node
        .on_connect_media_response(site2_seen_by_site1, answer);

    let ready1 = wait_srtp_ready(&mut site1).await;
    wait_srtp_ready(&mut site2).await;

    // -- loop exchange -----------------------------------------------

    let (handle, mut rx) = connection(site2_seen_by_site1);
    site1.node.handle_signaling_connected(handle);
    // the client sends register on connect; not needed here
    let _register = recv_envelope(&mut rx).await;

    site1.node.handle_session_event(ready1).await;
    let loops_request = recv_envelope(&mut rx).await;
    assert_eq!(loops_request.event, "connect_loops");

    let loops_reply = site2
        .node
        .on_connect_loops_request(site1_seen_by_site2, &loops_request);
    assert_eq!(loops_reply.error_code(), 0);
    site1
        .node
        .on_connect_loops_response(site2_seen_by_site1, loops_reply);

    let session1 = site1.node.session_by_signaling(&site2_seen_by_site1).unwrap();
    assert!(session1.loops_added());

    // -- media plane --------------------------------------------------

    let l1 = site1.node.media_loop("alpha").unwrap().ssrc();
    let l2 = site2.node.media_loop("alpha").unwrap().ssrc();
    let loop1_rx_addr = site1.node.media_loop("alpha").unwrap().local_addr();

    // mixer-style RTP: V=2, PT=100, seq 7, some payload, SSRC = L1
    let mut rtp = vec![0u8; 172];
    rtp[0] = 0x80;
    rtp[1] = 100;
    rtp[2..4].copy_from_slice(&7u16.to_be_bytes());
    rtp[4..8].copy_from_slice(&960u32.to_be_bytes());
    rtp[8..12].copy_from_slice(&l1.to_be_bytes());
    for (i, byte) in rtp.iter_mut().enumerate().skip(12) {
        *byte = (i % 251) as u8;
    }

    let injector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut received = vec![0u8; 2048];

    // inject until the packet shows up at site2's group; SRTP replay
    // protection wants a fresh sequence number per attempt
    let mut delivered = None;
    for attempt in 0u16..50 {
        rtp[2..4].copy_from_slice(&(7 + attempt).to_be_bytes());
        injector.send_to(&rtp, loop1_rx_addr).await.unwrap();

        match tokio::time::timeout(Duration::from_millis(200), group_rx.recv_from(&mut received))
            .await
        {
            Ok(Ok((len, _))) => {
                delivered = Some(len);
                break;
            }
            _ => continue,
        }
    }

    let len = delivered.expect("no RTP arrived at site2's multicast group");
    // the SRTP trailer is gone again after unprotect
    assert_eq!(len, rtp.len());

    let out = &received[..len];
    // SSRC was rewritten from L1 to site2's loop SSRC
    let out_ssrc = u32::from_be_bytes([out[8], out[9], out[10], out[11]]);
    assert_eq!(out_ssrc, l2);
    // everything else of the packet survives untouched
    assert_eq!(out[0], 0x80);
    assert_eq!(out[1], 100);
    assert_eq!(&out[4..8], &960u32.to_be_bytes());
    assert_eq!(&out[12..], &rtp[12..]);
}
