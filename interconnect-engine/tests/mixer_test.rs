//! Integration tests for the mixer acquisition protocol

mod common;

use common::{addr, build_node, connection, recv_envelope};
use interconnect_engine::loops::LOOP_PAYLOAD_TYPE;
use interconnect_engine::mixer::MixerForward;

#[tokio::test]
async fn test_mixer_register_configures_and_acquires() {
    let site = build_node(
        "site1",
        false,
        &[("alpha", "224.0.0.7", 5000), ("beta", "224.0.0.8", 5002)],
    )
    .await;
    let mixer = addr(53001);

    let (handle, mut rx) = connection(mixer);
    site.node.handle_mixer_connected(handle);
    site.node.on_mixer_register(mixer);

    // the node answers a register with its mixer configuration
    let configure = recv_envelope(&mut rx).await;
    assert_eq!(configure.event, "configure");

    // every loop without a mixer gets an acquire
    let mut users = Vec::new();
    for _ in 0..2 {
        let acquire = recv_envelope(&mut rx).await;
        assert_eq!(acquire.event, "acquire");

        let user = acquire.parameter_str("user").unwrap().to_string();
        let forward: MixerForward = serde_json::from_value(
            acquire.parameter.as_ref().unwrap()["forward"].clone(),
        )
        .unwrap();

        let media_loop = site.node.media_loop(&user).unwrap();
        assert_eq!(forward.ssrc, media_loop.ssrc());
        assert_eq!(forward.payload_type, LOOP_PAYLOAD_TYPE);
        assert_eq!(forward.socket.port, media_loop.local_addr().port());
        users.push(user);
    }
    users.sort();
    assert_eq!(users, vec!["alpha".to_string(), "beta".to_string()]);

    assert!(site.node.media_loop("alpha").unwrap().has_mixer());
    assert!(site.node.media_loop("beta").unwrap().has_mixer());
}

#[tokio::test]
async fn test_acquire_success_triggers_join() {
    let site = build_node("site1", false, &[("alpha", "224.0.0.7", 5000)]).await;
    let mixer = addr(53001);

    let (handle, mut rx) = connection(mixer);
    site.node.handle_mixer_connected(handle);
    site.node.on_mixer_register(mixer);

    let _configure = recv_envelope(&mut rx).await;
    let acquire = recv_envelope(&mut rx).await;

    // mixer acknowledges, node follows up with join
    site.node
        .handle_mixer_message(mixer, acquire.success_response());

    let join = recv_envelope(&mut rx).await;
    assert_eq!(join.event, "join");
    let data = &join.parameter.as_ref().unwrap()["loop"];
    assert_eq!(data["name"], "alpha");
    assert_eq!(data["socket"]["host"], "224.0.0.7");
    assert_eq!(data["socket"]["port"], 5000);
    // 50% on the 3-bit scale
    assert_eq!(data["volume"], 4);
}

#[tokio::test]
async fn test_acquire_failure_frees_the_slot() {
    let site = build_node("site1", false, &[("alpha", "224.0.0.7", 5000)]).await;
    let mixer = addr(53001);

    let (handle, mut rx) = connection(mixer);
    site.node.handle_mixer_connected(handle);
    site.node.on_mixer_register(mixer);

    let _configure = recv_envelope(&mut rx).await;
    let acquire = recv_envelope(&mut rx).await;

    use loopgrid_types::ErrorCode;
    site.node
        .handle_mixer_message(mixer, acquire.error_response(ErrorCode::ProcessingError));

    // the loop is free to retry on the next register
    assert!(!site.node.media_loop("alpha").unwrap().has_mixer());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_mixer_close_releases_loops_and_next_mixer_takes_over() {
    let site = build_node("site1", false, &[("alpha", "224.0.0.7", 5000)]).await;
    let first = addr(53001);

    let (handle, mut rx) = connection(first);
    site.node.handle_mixer_connected(handle);
    site.node.on_mixer_register(first);
    let _configure = recv_envelope(&mut rx).await;
    let _acquire = recv_envelope(&mut rx).await;
    assert!(site.node.media_loop("alpha").unwrap().has_mixer());

    site.node.handle_mixer_closed(first);
    assert!(!site.node.media_loop("alpha").unwrap().has_mixer());

    // a second mixer registers and the loop is assigned again
    let second = addr(53002);
    let (handle2, mut rx2) = connection(second);
    site.node.handle_mixer_connected(handle2);
    site.node.on_mixer_register(second);

    let _configure = recv_envelope(&mut rx2).await;
    let acquire = recv_envelope(&mut rx2).await;
    assert_eq!(acquire.event, "acquire");
    assert_eq!(acquire.parameter_str("user"), Some("alpha"));
    assert!(site.node.media_loop("alpha").unwrap().has_mixer());
}
