//! Absence tolerance record commission tests

mod common;

use serde_json::{json, Value};

use shoal_worker::commission::{Commission, CommissionConfig, COMMISSION_PURPOSE};
use shoal_worker::config::CommissionSettings;
use shoal_worker::error::Error;
use shoal_worker::peer::WorkerId;

use common::{eventually, Shoal};

const LEDGER: &str = "ledger";

fn ledger_config(peers: &[WorkerId], min_rate: u8) -> CommissionConfig {
    let settings = CommissionSettings {
        update_rate_ms: 200,
        min_successful_update_rate: min_rate,
    };
    CommissionConfig::from_settings(&settings, peers.to_vec()).with_record("balance", json!(0))
}

/// Start the ledger commission on every listed worker
fn start_ledger(shoal: &Shoal, peers: &[WorkerId], min_rate: u8) -> Vec<Commission> {
    peers
        .iter()
        .map(|&id| {
            shoal
                .worker(id)
                .commissions()
                .create(LEDGER, ledger_config(peers, min_rate))
                .unwrap()
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────
// Creation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_requires_membership() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let err = shoal
        .worker(1)
        .commissions()
        .create(LEDGER, ledger_config(&[2, 3], 60))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCommission { .. }));
}

#[tokio::test]
async fn test_create_twice_rejected() {
    let shoal = Shoal::start(&[1, 2]).await;
    start_ledger(&shoal, &[1, 2], 60);
    let err = shoal
        .worker(1)
        .commissions()
        .create(LEDGER, ledger_config(&[1, 2], 60))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidCommission { .. }));
}

#[tokio::test]
async fn test_initial_records() {
    let shoal = Shoal::start(&[1, 2]).await;
    let commissions = start_ledger(&shoal, &[1, 2], 60);
    let record = commissions[0].get("balance").unwrap();
    assert_eq!(record.value, json!(0));
    assert_eq!(record.update_iterations, 0);
    assert!(commissions[0].get("missing").is_none());
}

#[tokio::test]
async fn test_outsider_cannot_open_commission_socket() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    start_ledger(&shoal, &[1, 2], 60);
    let result = shoal
        .worker(3)
        .sockets()
        .open(1, COMMISSION_PURPOSE, json!({ "commission": LEDGER }))
        .await;
    assert!(result.is_err());
}

// ─────────────────────────────────────────────────────────────────
// Duty
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_members_agree_on_duty() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let commissions = start_ledger(&shoal, &[1, 2, 3], 60);
    let expected = commissions[0].on_duty("balance").unwrap();
    for commission in &commissions {
        assert_eq!(commission.on_duty("balance").unwrap(), expected);
        assert_eq!(commission.alive_peers(), vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn test_absent_peer_drops_out_of_alive_set() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let commissions = start_ledger(&shoal, &[1, 2, 3], 60);
    shoal.stop(3);

    let one = commissions[0].clone();
    assert!(eventually(|| one.alive_peers() == vec![1, 2]).await);
    assert_ne!(one.on_duty("balance").unwrap(), 3);
}

// ─────────────────────────────────────────────────────────────────
// Updates
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_replicates_to_every_peer() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let commissions = start_ledger(&shoal, &[1, 2, 3], 60);

    let record = commissions[0]
        .update_record_value("balance", json!(42))
        .await
        .unwrap();
    assert_eq!(record.value, json!(42));
    assert_eq!(record.update_iterations, 1);
    assert_eq!(record.on_duty, commissions[0].on_duty("balance").unwrap());

    for commission in &commissions {
        let commission = commission.clone();
        assert!(
            eventually(|| commission.get("balance").map(|r| r.value) == Some(json!(42))).await
        );
        assert_eq!(commission.get("balance").unwrap().update_iterations, 1);
    }
}

#[tokio::test]
async fn test_update_tolerates_one_absent_peer_then_fails_quorum() {
    let shoal = Shoal::start(&[1, 2, 3]).await;
    let commissions = start_ledger(&shoal, &[1, 2, 3], 60);

    // 2 of 3 acknowledge: 67% >= 60%
    shoal.stop(3);
    let record = commissions[0]
        .update_record_value("balance", json!(100))
        .await
        .unwrap();
    assert_eq!(record.update_iterations, 1);
    assert_eq!(commissions[0].get("balance").unwrap().value, json!(100));
    assert_eq!(commissions[1].get("balance").unwrap().value, json!(100));

    // 1 of 3 acknowledges: 33% < 60%
    shoal.stop(2);
    let err = commissions[0]
        .update_record_value("balance", json!(200))
        .await
        .unwrap_err();
    match err {
        Error::QuorumFailure {
            acknowledged,
            total,
            required_percent,
            ..
        } => {
            assert_eq!(acknowledged, 1);
            assert_eq!(total, 3);
            assert_eq!(required_percent, 60);
        }
        other => panic!("expected QuorumFailure, got {:?}", other),
    }

    let kept = commissions[0].get("balance").unwrap();
    assert_eq!(kept.value, json!(100));
    assert_eq!(kept.update_iterations, 1);

    // The replica that acknowledged the first update never saw the second
    let replica = commissions[1].get("balance").unwrap();
    assert_eq!(replica.value, json!(100));
    assert_eq!(replica.update_iterations, 1);
}

#[tokio::test]
async fn test_update_unknown_record() {
    let shoal = Shoal::start(&[1, 2]).await;
    let commissions = start_ledger(&shoal, &[1, 2], 60);
    let err = commissions[0]
        .update_record_value("missing", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
}

#[tokio::test]
async fn test_successive_updates_increment_iterations() {
    let shoal = Shoal::start(&[1, 2]).await;
    let commissions = start_ledger(&shoal, &[1, 2], 100);

    for (i, value) in [json!("a"), json!("b"), json!("c")].into_iter().enumerate() {
        let from = &commissions[i % 2];
        let record = from.update_record_value("balance", value.clone()).await.unwrap();
        assert_eq!(record.update_iterations, i as u64 + 1);
        assert_eq!(record.value, value);
    }
    assert_eq!(commissions[1].get("balance").unwrap().value, json!("c"));
}

#[tokio::test]
async fn test_removed_commission_stops_serving() {
    let shoal = Shoal::start(&[1, 2]).await;
    let commissions = start_ledger(&shoal, &[1, 2], 100);

    assert!(shoal.worker(2).commissions().remove(LEDGER).is_some());
    assert!(shoal.worker(2).commissions().get(LEDGER).is_none());

    let result = commissions[0]
        .update_record_value("balance", json!(1))
        .await;
    assert!(result.is_err());
    assert_eq!(commissions[0].get("balance").unwrap().update_iterations, 0);
}
