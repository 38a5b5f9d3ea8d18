//! Long-running background task that applies time-based policy: campaigns
//! that miss their funding deadline fail, and voting windows that expire
//! without approval reject their milestone.
//!
//! Each pass works through the same CAS transitions as request handlers, so
//! a sweep racing a live request is harmless — one of them wins the write.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::notify::Notification;
use crate::types::{CampaignStatus, MilestoneStatus};

/// Run the sweep loop until the token is cancelled.
pub async fn run(engine: Engine, shutdown: CancellationToken) {
    let interval = Duration::from_secs(engine.cfg.sweep_interval_secs);
    info!("sweeper starting (interval {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("sweeper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = sweep_once(&engine, now).await {
            error!("sweep error: {e}");
        }
    }
}

/// Perform a single policy pass at the given instant.
pub async fn sweep_once(engine: &Engine, now: i64) -> Result<()> {
    for campaign in db::expired_active_campaigns(&engine.pool, now).await? {
        match db::transition_campaign(
            &engine.pool,
            campaign.id,
            CampaignStatus::Active,
            CampaignStatus::Failed,
            now,
        )
        .await
        {
            Ok(_) => {
                info!(
                    "campaign {} failed: deadline passed with {}/{} raised",
                    campaign.id, campaign.funds_raised, campaign.total_goal
                );
                engine.notifier.send(Notification::CampaignFailed {
                    campaign_id: campaign.id,
                });
            }
            // A contribution raced the sweep and changed the status.
            Err(EngineError::IllegalTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    let window = engine.cfg.voting_window_secs;
    for milestone in db::expired_voting_milestones(&engine.pool, now, window).await? {
        match db::transition_milestone(
            &engine.pool,
            milestone.id,
            MilestoneStatus::VotingOpen,
            MilestoneStatus::Rejected,
        )
        .await
        {
            Ok(_) => {
                info!(
                    "campaign {} milestone {}: voting window expired without approval",
                    milestone.campaign_id, milestone.seq
                );
                engine.notifier.send(Notification::VotingExpired {
                    campaign_id: milestone.campaign_id,
                    milestone_seq: milestone.seq,
                });
            }
            Err(EngineError::IllegalTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::test_engine;
    use crate::types::{CampaignSpec, MilestoneSpec};

    fn short_spec() -> CampaignSpec {
        CampaignSpec {
            creator: "GCREATOR".into(),
            title: "Beekeeping co-op".into(),
            description: String::new(),
            metadata_ref: String::new(),
            total_goal: 500,
            milestones: vec![MilestoneSpec {
                title: "Hives".into(),
                description: String::new(),
                amount: 500,
            }],
            duration_secs: Some(3_600),
        }
    }

    #[tokio::test]
    async fn underfunded_campaign_fails_after_deadline() {
        let (engine, _) = test_engine().await;
        let (campaign, _) = engine.create_campaign(&short_spec()).await.unwrap();
        engine.fund(campaign.id, "GBACKER1", 100).await.unwrap();

        // Before the deadline nothing happens.
        sweep_once(&engine, campaign.deadline - 10).await.unwrap();
        let c = db::get_campaign(&engine.pool, campaign.id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Active);

        sweep_once(&engine, campaign.deadline + 10).await.unwrap();
        let c = db::get_campaign(&engine.pool, campaign.id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Failed);
        assert!(c.closed_at.is_some());
    }

    #[tokio::test]
    async fn funded_campaign_survives_its_deadline() {
        let (engine, _) = test_engine().await;
        let (campaign, _) = engine.create_campaign(&short_spec()).await.unwrap();
        engine.fund(campaign.id, "GBACKER1", 500).await.unwrap();

        sweep_once(&engine, campaign.deadline + 10).await.unwrap();
        let c = db::get_campaign(&engine.pool, campaign.id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Funded);
    }

    #[tokio::test]
    async fn expired_voting_window_rejects_the_milestone() {
        let (engine, _) = test_engine().await;
        let (campaign, _) = engine.scenario_campaign().await;
        engine.open_voting(campaign.id, 0).await;

        let ms = db::get_milestone(&engine.pool, campaign.id, 0).await.unwrap();
        let opened_at = ms.voting_opened_at.unwrap();
        let window = engine.cfg.voting_window_secs;

        // Inside the window the milestone stays open.
        sweep_once(&engine, opened_at + window - 1).await.unwrap();
        let ms = db::get_milestone(&engine.pool, campaign.id, 0).await.unwrap();
        assert_eq!(ms.status, MilestoneStatus::VotingOpen);

        sweep_once(&engine, opened_at + window + 1).await.unwrap();
        let ms = db::get_milestone(&engine.pool, campaign.id, 0).await.unwrap();
        assert_eq!(ms.status, MilestoneStatus::Rejected);

        // Rejection by expiry permits a fresh proof submission.
        let resubmitted = engine
            .submit_proof(campaign.id, 0, "GCREATOR", "QmSecondProofAttempt")
            .await
            .unwrap();
        assert_eq!(resubmitted.status, MilestoneStatus::ProofSubmitted);
    }
}
