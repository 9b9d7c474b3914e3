//! Membership tests: join, update and leave

mod common;

use serde_json::{json, Value};

use shoal_worker::peer::{ConnectorSetting, PROSPECTIVE_WORKER_ID};
use shoal_worker::Worker;

use common::{
    authenticity_data, connect_settings, eventually, prospective, prospective_with_token, Shoal,
    MEM,
};

fn joiner_connectors() -> Vec<ConnectorSetting> {
    vec![ConnectorSetting {
        interface: MEM.to_string(),
        settings: json!({ "address": "joiner" }),
    }]
}

async fn join(shoal: &Shoal) -> Worker {
    let joiner = prospective(&shoal.network, "joiner").await;
    joiner
        .join_me(
            MEM,
            &connect_settings(1),
            joiner_connectors(),
            json!({ "role": "storage" }),
        )
        .await
        .unwrap();
    joiner
}

// ─────────────────────────────────────────────────────────────────
// Join
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_assigns_next_free_id() {
    let shoal = Shoal::start(&[1, 2]).await;
    let joiner = prospective(&shoal.network, "joiner").await;
    assert_eq!(joiner.my_worker_id(), PROSPECTIVE_WORKER_ID);

    let assigned = joiner
        .join_me(MEM, &connect_settings(1), joiner_connectors(), Value::Null)
        .await
        .unwrap();
    assert_eq!(assigned, 3);
    assert_eq!(joiner.my_worker_id(), 3);
    assert_eq!(joiner.directory().worker_ids(), vec![1, 2]);
}

#[tokio::test]
async fn test_join_is_announced_to_other_members() {
    let shoal = Shoal::start(&[1, 2]).await;
    join(&shoal).await;

    let admitting = shoal.worker(1).directory();
    assert_eq!(
        admitting.get(3).unwrap().detail,
        json!({ "role": "storage" })
    );

    let other = shoal.worker(2).directory();
    assert!(eventually(|| other.get(3).is_some()).await);
    assert_eq!(other.get(3).unwrap().connectors, joiner_connectors());
}

#[tokio::test]
async fn test_joined_worker_can_open_sockets_and_channels() {
    let shoal = Shoal::start(&[1, 2]).await;
    let joiner = join(&shoal).await;
    let other = shoal.worker(2).directory();
    assert!(eventually(|| other.get(3).is_some()).await);

    // The secret handed out by worker 1 is the one worker 2 now checks
    let channel = shoal
        .worker(2)
        .groups()
        .create_channel("after-join", &[3])
        .unwrap();
    let outcome = channel.broadcast(json!("welcome")).await;
    assert_eq!(outcome.finished, vec![3]);

    let channel = joiner
        .groups()
        .create_channel("from-joiner", &[1, 2])
        .unwrap();
    assert!(channel.broadcast(json!("hi")).await.all_finished());
}

#[tokio::test]
async fn test_join_twice_rejected() {
    let shoal = Shoal::start(&[1, 2]).await;
    let joiner = join(&shoal).await;
    let err = joiner
        .join_me(MEM, &connect_settings(2), joiner_connectors(), Value::Null)
        .await;
    assert!(err.is_err());
    assert_eq!(joiner.my_worker_id(), 3);
}

#[tokio::test]
async fn test_join_through_unreachable_member() {
    let shoal = Shoal::start(&[1]).await;
    let joiner = prospective(&shoal.network, "joiner").await;
    let result = joiner
        .join_me(MEM, &connect_settings(8), joiner_connectors(), Value::Null)
        .await;
    assert!(result.is_err());
    assert_eq!(joiner.my_worker_id(), PROSPECTIVE_WORKER_ID);
}

#[tokio::test]
async fn test_join_without_token_refused() {
    let shoal = Shoal::start(&[1, 2]).await;

    for (address, token) in [("stranger-1", None), ("stranger-2", Some("guessed"))] {
        let stranger = prospective_with_token(&shoal.network, address, token).await;
        let result = stranger
            .join_me(MEM, &connect_settings(1), joiner_connectors(), Value::Null)
            .await;
        assert!(result.is_err());
        assert_eq!(stranger.my_worker_id(), PROSPECTIVE_WORKER_ID);
        assert_eq!(stranger.directory().peer_count(), 0);
    }
    assert_eq!(shoal.worker(1).directory().worker_ids(), vec![2]);
}

#[tokio::test]
async fn test_member_without_token_admits_nobody() {
    let shoal = Shoal::start(&[1]).await;
    shoal.worker(1).import_join_token(None);

    let joiner = prospective(&shoal.network, "joiner").await;
    let result = joiner
        .join_me(MEM, &connect_settings(1), joiner_connectors(), Value::Null)
        .await;
    assert!(result.is_err());
    assert_eq!(joiner.my_worker_id(), PROSPECTIVE_WORKER_ID);
}

#[tokio::test]
async fn test_joiner_holds_no_member_secrets() {
    let shoal = Shoal::start(&[1, 2]).await;
    let joiner = join(&shoal).await;
    let other = shoal.worker(2).directory();
    assert!(eventually(|| other.get(3).is_some()).await);

    let member_secrets = [authenticity_data(1), authenticity_data(2)];
    for id in [1, 2] {
        let entry = joiner.directory().get(id).unwrap();
        assert!(entry.authenticity_data.is_empty());
        assert!(!entry.pairwise_key.is_empty());
        assert!(!member_secrets.contains(&entry.pairwise_key));
    }
    let own = joiner.directory().my_identity().unwrap();
    assert!(!member_secrets.contains(&own.authenticity_data));

    // Each member knows only the key it shares with the joiner
    let at_one = shoal.worker(1).directory().get(3).unwrap();
    let at_two = other.get(3).unwrap();
    assert!(at_one.authenticity_data.is_empty());
    assert_eq!(at_one.pairwise_key, joiner.directory().get(1).unwrap().pairwise_key);
    assert_eq!(at_two.pairwise_key, joiner.directory().get(2).unwrap().pairwise_key);
    assert_ne!(at_one.pairwise_key, at_two.pairwise_key);

    // Members still prove themselves to each other with their own secrets
    assert_eq!(
        shoal.worker(1).directory().get(2).unwrap().authenticity_data,
        authenticity_data(2)
    );
}

#[tokio::test]
async fn test_second_joiner_reaches_first_joiner() {
    let shoal = Shoal::start(&[1, 2]).await;
    let first = join(&shoal).await;
    assert!(eventually(|| shoal.worker(2).directory().get(3).is_some()).await);

    let second = prospective(&shoal.network, "second").await;
    let assigned = second
        .join_me(MEM, &connect_settings(2), Vec::new(), Value::Null)
        .await
        .unwrap();
    assert_eq!(assigned, 4);
    assert!(eventually(|| first.directory().get(4).is_some()).await);

    // Both sides of the 3-4 link derived their key from worker 4's secret
    assert_eq!(
        first.directory().get(4).unwrap().pairwise_key,
        second.directory().get(3).unwrap().pairwise_key
    );
}

// ─────────────────────────────────────────────────────────────────
// Update And Leave
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_reaches_every_peer() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let outcome = shoal
        .worker(3)
        .update_me(Vec::new(), json!({ "zone": "east" }))
        .await
        .unwrap();
    assert_eq!(outcome.finished, vec![1, 2]);

    for id in [1, 2] {
        let peer = shoal.worker(id).directory().get(3).unwrap();
        assert_eq!(peer.detail, json!({ "zone": "east" }));
        assert!(peer.connectors.is_empty());
    }
}

#[tokio::test]
async fn test_update_reports_unreachable_peer() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    shoal.stop(2);
    let outcome = shoal
        .worker(1)
        .update_me(Vec::new(), json!("v2"))
        .await
        .unwrap();
    assert_eq!(outcome.finished, vec![3]);
    assert!(outcome.failed.contains_key(&2));
}

#[tokio::test]
async fn test_leave_forgets_the_shoal() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let outcome = shoal.worker(3).leave_me().await.unwrap();
    assert_eq!(outcome.finished, vec![1, 2]);

    assert_eq!(shoal.worker(3).my_worker_id(), PROSPECTIVE_WORKER_ID);
    assert_eq!(shoal.worker(3).directory().peer_count(), 0);
    for id in [1, 2] {
        assert!(shoal.worker(id).directory().get(3).is_none());
    }
}

#[tokio::test]
async fn test_update_without_identity() {
    let shoal = Shoal::start(&[1]).await;
    let joiner = prospective(&shoal.network, "joiner").await;
    assert!(joiner.update_me(Vec::new(), Value::Null).await.is_err());
    assert!(joiner.leave_me().await.is_err());
}
