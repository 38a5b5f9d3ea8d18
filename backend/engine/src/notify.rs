//! Outbound notification port.
//!
//! Lifecycle events are posted to an optional webhook as fire-and-forget
//! JSON. Delivery runs on a detached task: a slow or failing receiver can
//! never block or fail the operation that produced the event. Failures are
//! logged and dropped.

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::Verdict;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    DonationReceived {
        campaign_id: i64,
        backer: String,
        amount: i64,
    },
    CampaignFunded {
        campaign_id: i64,
        funds_raised: i64,
    },
    VotingOpened {
        campaign_id: i64,
        milestone_seq: i64,
    },
    ProofRejected {
        campaign_id: i64,
        milestone_seq: i64,
        verdict: Verdict,
    },
    MilestoneDisputed {
        campaign_id: i64,
        milestone_seq: i64,
    },
    MilestoneReleased {
        campaign_id: i64,
        milestone_seq: i64,
        payout: i64,
        fee: i64,
    },
    VotingExpired {
        campaign_id: i64,
        milestone_seq: i64,
    },
    CampaignFailed {
        campaign_id: i64,
    },
    CampaignCompleted {
        campaign_id: i64,
    },
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Notifier {
            client,
            webhook_url,
        })
    }

    /// Dispatch an event without waiting for delivery.
    pub fn send(&self, notification: Notification) {
        let Some(url) = self.webhook_url.clone() else {
            debug!("notification dropped (no webhook configured): {notification:?}");
            return;
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .json(&notification)
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                warn!("notification delivery failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(Notification::MilestoneReleased {
            campaign_id: 7,
            milestone_seq: 1,
            payout: 146,
            fee: 4,
        })
        .unwrap();
        assert_eq!(json["event"], "milestone_released");
        assert_eq!(json["payout"], 146);
    }

    #[tokio::test]
    async fn sending_without_a_webhook_is_a_no_op() {
        let notifier = Notifier::new(None).unwrap();
        notifier.send(Notification::CampaignFailed { campaign_id: 1 });
    }
}
