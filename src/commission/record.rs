//! Commission configuration and replicated records

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CommissionSettings;
use crate::error::{Error, Result};
use crate::peer::WorkerId;
use crate::seed::GlobalSeed;

/// Initial state of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordInit {
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub update_iterations: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommissionConfig {
    pub commission_peers: Vec<WorkerId>,
    /// Replication interval; an update must gather its quorum within one
    pub update_rate: Duration,
    /// Percentage of the commission that must acknowledge an update
    pub min_successful_update_rate: u8,
    pub records: BTreeMap<String, RecordInit>,
}

impl CommissionConfig {
    /// Config with the rate and threshold from `[commission]`
    pub fn from_settings(settings: &CommissionSettings, commission_peers: Vec<WorkerId>) -> Self {
        Self {
            commission_peers,
            update_rate: Duration::from_millis(settings.update_rate_ms),
            min_successful_update_rate: settings.min_successful_update_rate,
            records: BTreeMap::new(),
        }
    }

    pub fn with_record(mut self, key: &str, value: Value) -> Self {
        self.records.insert(
            key.to_string(),
            RecordInit {
                value,
                update_iterations: 0,
            },
        );
        self
    }

    /// Sort and dedup the peers, then check the config can ever reach quorum
    pub(crate) fn normalize(mut self, purpose: &str, me: WorkerId) -> Result<Self> {
        let invalid = |message: String| Error::InvalidCommission {
            purpose: purpose.to_string(),
            message,
        };
        self.commission_peers.sort_unstable();
        self.commission_peers.dedup();
        if self.commission_peers.binary_search(&me).is_err() {
            return Err(invalid(format!("worker {} is not a commission peer", me)));
        }
        if self.update_rate.is_zero() {
            return Err(invalid("update rate must be positive".to_string()));
        }
        if self.min_successful_update_rate > 100 {
            return Err(invalid(format!(
                "min_successful_update_rate {} exceeds 100",
                self.min_successful_update_rate
            )));
        }
        Ok(self)
    }
}

/// One replicated record as held locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: Value,
    pub update_iterations: u64,
    /// Peer that committed this iteration
    pub on_duty: WorkerId,
}

impl Record {
    /// Whether `self` is a later commit than `other`
    pub fn supersedes(&self, other: &Record) -> bool {
        (self.update_iterations, self.on_duty) > (other.update_iterations, other.on_duty)
    }
}

/// `acknowledged` out of `total` meets a `percent` threshold
pub fn quorum_met(acknowledged: usize, total: usize, percent: u8) -> bool {
    total > 0 && acknowledged * 100 >= total * usize::from(percent)
}

/// Order in which commission peers take duty for `key`.
///
/// Every peer derives the same order from the shared seed, so the on-duty
/// peer is the first one in it that is believed alive.
pub fn duty_order(
    seed: &GlobalSeed,
    purpose: &str,
    key: &str,
    peers: &[WorkerId],
) -> Result<Vec<WorkerId>> {
    let mut order = peers.to_vec();
    order.sort_unstable();
    seed.stream(&format!("commission:{}:{}", purpose, key))?
        .shuffle(&mut order);
    Ok(order)
}
