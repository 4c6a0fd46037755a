use crate::*;

use murmur_services::{ConnectionState, Route};

fn chunk(tag: &str, n: u64) -> Bytes {
    Bytes::from(format!("{tag}-{n}"))
}

async fn wait_online(uplink: &Uplink) {
    let manager = uplink.manager.clone();
    eventually("uplink online and drained", move || {
        manager.state() == ConnectionState::Online
    })
    .await;
}

#[tokio::test]
async fn live_packets_reach_collector_in_order() {
    let collector = start_collector().await;
    let dir = temp_spool_dir("live");
    let switch = Switch::new(true);
    let uplink = start_uplink(&collector, "secret-001", &dir, &switch);
    wait_online(&uplink).await;

    for n in 1..=5 {
        let out = uplink.manager.handle_chunk(chunk("live", n)).await;
        assert_eq!(out.route, Route::Live);
        assert_eq!(out.sequence_id, n);
    }

    let recorder = collector.recorder.clone();
    eventually("5 packets", move || recorder.len() == 5).await;
    assert_eq!(collector.recorder.ids(), vec![1, 2, 3, 4, 5]);
    assert_eq!(collector.recorder.payloads()[0], chunk("live", 1));

    let status = collector.state.stats.get("device-001").unwrap();
    assert_eq!(status.packets, 5);
    assert!(status.connected);

    uplink.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn offline_chunks_are_replayed_before_live_traffic() {
    let collector = start_collector().await;
    let dir = temp_spool_dir("offline");
    let switch = Switch::new(false);
    let uplink = start_uplink(&collector, "secret-001", &dir, &switch);

    for n in 1..=3 {
        let out = uplink.manager.handle_chunk(chunk("offline", n)).await;
        assert_eq!(out.route, Route::Spooled);
    }
    assert_eq!(uplink.manager.pending().await, 3);

    switch.set(true);
    wait_online(&uplink).await;
    assert_eq!(uplink.manager.pending().await, 0);

    let out = uplink.manager.handle_chunk(chunk("online", 4)).await;
    assert_eq!(out.route, Route::Live);

    let recorder = collector.recorder.clone();
    eventually("4 packets", move || recorder.len() == 4).await;
    assert_eq!(collector.recorder.ids(), vec![1, 2, 3, 4]);

    uplink.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn flapping_link_loses_nothing_and_keeps_order() {
    let collector = start_collector().await;
    let dir = temp_spool_dir("flap");
    let switch = Switch::new(true);
    let uplink = start_uplink(&collector, "secret-001", &dir, &switch);

    let mut next = 1;
    for _ in 0..3 {
        wait_online(&uplink).await;
        for _ in 0..4 {
            uplink.manager.handle_chunk(chunk("flap", next)).await;
            next += 1;
        }

        switch.set(false);
        let manager = uplink.manager.clone();
        eventually("link down", move || {
            !matches!(
                manager.state(),
                ConnectionState::Online | ConnectionState::Draining
            )
        })
        .await;
        for _ in 0..3 {
            let out = uplink.manager.handle_chunk(chunk("flap", next)).await;
            assert_eq!(out.route, Route::Spooled);
            next += 1;
        }
        switch.set(true);
    }
    wait_online(&uplink).await;

    let total = (next - 1) as usize;
    let recorder = collector.recorder.clone();
    eventually("every packet", move || recorder.len() == total).await;
    assert_eq!(
        collector.recorder.ids(),
        (1..next).collect::<Vec<_>>()
    );
    assert_eq!(uplink.manager.stats().lost, 0);

    uplink.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn bad_credentials_never_go_online() {
    let collector = start_collector().await;
    let dir = temp_spool_dir("badcreds");
    let switch = Switch::new(true);
    let uplink = start_uplink(&collector, "wrong-secret", &dir, &switch);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!matches!(
        uplink.manager.state(),
        ConnectionState::Online | ConnectionState::Draining
    ));
    let out = uplink.manager.handle_chunk(chunk("x", 1)).await;
    assert_eq!(out.route, Route::Spooled);
    assert_eq!(collector.recorder.len(), 0);
    assert!(collector.state.tokens.is_empty());

    uplink.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn handshake_with_unknown_token_is_rejected() {
    let collector = start_collector().await;
    let connector = WebSocketConnector::new(collector.ws_url.clone());
    assert!(matches!(
        connector.connect("not-a-token").await,
        Err(TransportError::Rejected(401))
    ));
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_survives() {
    let collector = start_collector().await;
    let token = collector
        .state
        .tokens
        .login("device-001", "secret-001")
        .unwrap();
    let mut transport = WebSocketConnector::new(collector.ws_url.clone())
        .connect(&token)
        .await
        .unwrap();

    transport.send(Bytes::from_static(&[0xff, 0xff])).await.unwrap();
    let good = murmur_core::encode(&Packet::new(1, Bytes::from_static(b"ok"), 0));
    transport.send(good).await.unwrap();

    let recorder = collector.recorder.clone();
    eventually("valid packet after malformed one", move || recorder.len() == 1).await;
    let state = collector.state.clone();
    eventually("malformed counted", move || {
        state
            .stats
            .get("device-001")
            .is_some_and(|s| s.malformed == 1)
    })
    .await;
    transport.close().await;
}

#[tokio::test]
async fn restart_replays_previous_session_first() {
    let collector = start_collector().await;
    let dir = temp_spool_dir("restart");

    // first run never reaches the collector
    let switch = Switch::new(false);
    let first = start_uplink(&collector, "secret-001", &dir, &switch);
    for n in 1..=3 {
        first.manager.handle_chunk(chunk("old", n)).await;
    }
    first.stop().await;

    let second = start_uplink(&collector, "secret-001", &dir, &switch);
    let out = second.manager.handle_chunk(chunk("new", 1)).await;
    assert_eq!(out.sequence_id, 1);
    assert_eq!(second.manager.pending().await, 4);

    switch.set(true);
    wait_online(&second).await;
    let recorder = collector.recorder.clone();
    eventually("4 packets", move || recorder.len() == 4).await;
    assert_eq!(
        collector.recorder.payloads(),
        vec![
            chunk("old", 1),
            chunk("old", 2),
            chunk("old", 3),
            chunk("new", 1)
        ]
    );

    second.stop().await;
    let _ = std::fs::remove_dir_all(&dir);
}
