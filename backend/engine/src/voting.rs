//! Quadratic voting engine.
//!
//! Voting power grows with the square root of the contribution, so large
//! backers keep more say without buying the outcome outright. Weights are
//! recomputed from the backer's cumulative contribution at cast time and the
//! ledger's uniqueness constraint is the sole double-vote authority — this
//! module never re-checks it racily.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::types::MilestoneStatus;

/// Quadratic voting power: integer floor of the square root of the
/// contribution. Newton's method; exact for all non-negative inputs.
pub fn voting_power(amount: i64) -> i64 {
    if amount <= 0 {
        return 0;
    }
    let n = amount as u64;
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x as i64
}

/// Approval rule: strictly more weight in favor than against, with at least
/// `min_voters` distinct voters. A tie never approves.
pub fn approvable(votes_for: i64, votes_against: i64, voter_count: i64, min_voters: i64) -> bool {
    votes_for > votes_against && voter_count >= min_voters
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TallySnapshot {
    pub votes_for: i64,
    pub votes_against: i64,
    pub voter_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    /// Weight applied to the tally for this vote.
    pub weight: i64,
    pub tally: TallySnapshot,
    /// The vote pushed the milestone over the approval rule.
    pub approved: bool,
}

/// Read-only tally for a milestone.
pub async fn tally(pool: &SqlitePool, campaign_id: i64, seq: i64) -> Result<TallySnapshot> {
    let ms = db::get_milestone(pool, campaign_id, seq).await?;
    Ok(TallySnapshot {
        votes_for: ms.votes_for,
        votes_against: ms.votes_against,
        voter_count: ms.voter_count,
    })
}

/// Cast a vote on a milestone.
///
/// Fails with `NotABacker` when the voter never contributed to the owning
/// campaign, `MilestoneNotVotable` outside `VotingOpen`, and `AlreadyVoted`
/// when the ledger's insert loses to an earlier vote from the same backer.
/// When the resulting tally satisfies the approval rule the milestone is
/// CAS-advanced to `Approved`; a concurrent vote racing on that transition
/// is harmless — one of them wins it.
pub async fn cast_vote(
    engine: &Engine,
    campaign_id: i64,
    seq: i64,
    voter: &str,
    approve: bool,
) -> Result<VoteOutcome> {
    let milestone = db::get_milestone(&engine.pool, campaign_id, seq).await?;

    let backer = db::get_backer(&engine.pool, campaign_id, voter).await?;
    let contribution = match backer {
        Some(b) if b.amount > 0 => b.amount,
        _ => return Err(EngineError::NotABacker),
    };

    if milestone.status != MilestoneStatus::VotingOpen {
        return Err(EngineError::MilestoneNotVotable);
    }

    let weight = voting_power(contribution);
    let now = chrono::Utc::now().timestamp();
    let updated = db::insert_vote(&engine.pool, milestone.id, voter, approve, weight, now).await?;

    let approved = approvable(
        updated.votes_for,
        updated.votes_against,
        updated.voter_count,
        engine.cfg.min_voters,
    );
    if approved {
        match db::transition_milestone(
            &engine.pool,
            milestone.id,
            MilestoneStatus::VotingOpen,
            MilestoneStatus::Approved,
        )
        .await
        {
            Ok(_) => {}
            // A concurrent vote already won the CAS; nothing to do.
            Err(EngineError::IllegalTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(VoteOutcome {
        weight,
        tally: TallySnapshot {
            votes_for: updated.votes_for,
            votes_against: updated.votes_against,
            voter_count: updated.voter_count,
        },
        approved,
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::test_engine;
    use crate::types::{MilestoneStatus, Verdict};

    #[test]
    fn voting_power_is_the_integer_sqrt_floor() {
        assert_eq!(voting_power(0), 0);
        assert_eq!(voting_power(1), 1);
        assert_eq!(voting_power(4), 2);
        assert_eq!(voting_power(9), 3);
        assert_eq!(voting_power(15), 3);
        assert_eq!(voting_power(16), 4);
        assert_eq!(voting_power(100), 10);
        assert_eq!(voting_power(1000), 31);
        assert_eq!(voting_power(10_000), 100);
        assert_eq!(voting_power(-7), 0);
    }

    #[test]
    fn voting_power_is_monotonic() {
        let mut last = 0;
        for a in 0..5_000 {
            let p = voting_power(a);
            assert!(p >= last, "power decreased at {a}");
            let exact = (a as f64).sqrt().floor() as i64;
            assert_eq!(p, exact, "mismatch at {a}");
            last = p;
        }
    }

    #[test]
    fn ties_never_approve() {
        assert!(approvable(11, 10, 2, 1));
        assert!(!approvable(10, 10, 2, 1));
        assert!(!approvable(9, 10, 2, 1));
        // Quorum not met.
        assert!(!approvable(30, 0, 2, 3));
        assert!(approvable(30, 0, 3, 3));
    }

    #[tokio::test]
    async fn non_backer_cannot_vote() {
        let (engine, _) = test_engine().await;
        let (campaign, _) = engine.scenario_campaign().await;
        engine.open_voting(campaign.id, 0).await;

        let err = cast_vote(&engine, campaign.id, 0, "GSTRANGER", true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotABacker));
    }

    #[tokio::test]
    async fn voting_is_rejected_in_every_non_open_status() {
        let (engine, _) = test_engine().await;
        let (campaign, milestones) = engine.scenario_campaign().await;
        let ms_id = milestones[0].id;

        use MilestoneStatus::*;
        for status in [
            Pending,
            InProgress,
            ProofSubmitted,
            AIVerified,
            Approved,
            Released,
            Disputed,
            Rejected,
        ] {
            sqlx::query("UPDATE milestones SET status = ?1 WHERE id = ?2")
                .bind(status)
                .bind(ms_id)
                .execute(&engine.pool)
                .await
                .unwrap();

            let err = cast_vote(&engine, campaign.id, 0, "GBACKER1", true)
                .await
                .unwrap_err();
            assert!(
                matches!(err, EngineError::MilestoneNotVotable),
                "status {status:?} should not be votable"
            );
        }
    }

    #[tokio::test]
    async fn tally_equals_sum_of_distinct_voter_weights() {
        let (engine, _) = test_engine().await;
        let (campaign, milestones) = engine.scenario_campaign().await;
        engine.open_voting(campaign.id, 0).await;

        // 100 -> 10, 400 -> 20 (scenario contributions).
        cast_vote(&engine, campaign.id, 0, "GBACKER1", true)
            .await
            .unwrap();
        cast_vote(&engine, campaign.id, 0, "GBACKER2", false)
            .await
            .unwrap();

        // A second vote from the same backer must not touch the tally.
        let err = cast_vote(&engine, campaign.id, 0, "GBACKER1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyVoted));

        let t = tally(&engine.pool, campaign.id, 0).await.unwrap();
        assert_eq!(t.votes_for, 10);
        assert_eq!(t.votes_against, 20);
        assert_eq!(t.voter_count, 2);

        let weights: (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(weight), 0) FROM votes WHERE milestone_id = ?1")
                .bind(milestones[0].id)
                .fetch_one(&engine.pool)
                .await
                .unwrap();
        assert_eq!(weights.0, t.votes_for + t.votes_against);
    }

    #[tokio::test]
    async fn crossing_the_rule_advances_to_approved() {
        let (engine, _) = test_engine().await;
        let (campaign, _) = engine.scenario_campaign().await;
        engine.open_voting(campaign.id, 0).await;

        let outcome = cast_vote(&engine, campaign.id, 0, "GBACKER1", true)
            .await
            .unwrap();
        assert!(outcome.approved);

        let ms = db::get_milestone(&engine.pool, campaign.id, 0).await.unwrap();
        assert_eq!(ms.status, MilestoneStatus::Approved);
        assert_eq!(ms.verdict, Verdict::Completed);
    }
}
