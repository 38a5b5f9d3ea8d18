//! Ledger layer — migrations, queries, and compare-and-swap transitions.
//!
//! This module is the single source of truth for campaigns, milestones,
//! backers, and votes. Every status mutation is a CAS write
//! (`UPDATE … WHERE id = ? AND status = ?`) so concurrent requests can never
//! lose updates: the second writer observes zero affected rows and receives
//! a typed failure instead of clobbering state.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::types::{
    Backer, Campaign, CampaignSpec, CampaignStatus, Milestone, MilestoneStatus, Verdict, Vote,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

/// Insert a new campaign and its milestones in one transaction.
///
/// The campaign starts `Active` with its first milestone `InProgress` and
/// the rest `Pending`. Fails with a validation error when milestone amounts
/// don't sum to the goal or required fields are missing.
pub async fn create_campaign(
    pool: &SqlitePool,
    spec: &CampaignSpec,
    deadline: i64,
    now: i64,
) -> Result<(Campaign, Vec<Milestone>)> {
    spec.validate()?;

    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        INSERT INTO campaigns
            (creator, title, description, metadata_ref, total_goal, status, deadline, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&spec.creator)
    .bind(&spec.title)
    .bind(&spec.description)
    .bind(&spec.metadata_ref)
    .bind(spec.total_goal)
    .bind(CampaignStatus::Active)
    .bind(deadline)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let campaign_id = result.last_insert_rowid();

    for (idx, ms) in spec.milestones.iter().enumerate() {
        let status = if idx == 0 {
            MilestoneStatus::InProgress
        } else {
            MilestoneStatus::Pending
        };
        sqlx::query(
            r#"
            INSERT INTO milestones
                (campaign_id, seq, title, description, amount, status, verdict)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(campaign_id)
        .bind(idx as i64)
        .bind(&ms.title)
        .bind(&ms.description)
        .bind(ms.amount)
        .bind(status)
        .bind(Verdict::NotSubmitted)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    let campaign = get_campaign(pool, campaign_id).await?;
    let milestones = get_campaign_milestones(pool, campaign_id).await?;
    Ok((campaign, milestones))
}

pub async fn get_campaign(pool: &SqlitePool, id: i64) -> Result<Campaign> {
    sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("campaign {id}")))
}

/// All milestones of a campaign, ordered by position.
pub async fn get_campaign_milestones(
    pool: &SqlitePool,
    campaign_id: i64,
) -> Result<Vec<Milestone>> {
    let rows = sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 ORDER BY seq ASC",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_milestone(pool: &SqlitePool, campaign_id: i64, seq: i64) -> Result<Milestone> {
    sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 AND seq = ?2",
    )
    .bind(campaign_id)
    .bind(seq)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| EngineError::NotFound(format!("milestone {seq} of campaign {campaign_id}")))
}

/// CAS status transition for a campaign.
///
/// The write succeeds only if the row still holds `from`; otherwise the
/// caller gets `IllegalTransition` carrying the observed status. Terminal
/// statuses also stamp `closed_at`.
pub async fn transition_campaign(
    pool: &SqlitePool,
    id: i64,
    from: CampaignStatus,
    to: CampaignStatus,
    now: i64,
) -> Result<Campaign> {
    if !from.can_transition_to(to) {
        return Err(illegal_campaign_transition(id, from, to));
    }

    let ends = matches!(
        to,
        CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
    );
    let query = if ends {
        "UPDATE campaigns SET status = ?1, closed_at = ?4 WHERE id = ?2 AND status = ?3"
    } else {
        "UPDATE campaigns SET status = ?1 WHERE id = ?2 AND status = ?3"
    };

    let affected = sqlx::query(query)
        .bind(to)
        .bind(id)
        .bind(from)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();

    if affected == 0 {
        let current = get_campaign(pool, id).await?;
        return Err(illegal_campaign_transition(id, current.status, to));
    }
    get_campaign(pool, id).await
}

fn illegal_campaign_transition(
    id: i64,
    from: CampaignStatus,
    to: CampaignStatus,
) -> EngineError {
    EngineError::IllegalTransition {
        entity: format!("campaign {id}"),
        from: format!("{from:?}"),
        to: format!("{to:?}"),
    }
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

/// Upsert a backer's cumulative contribution and move escrow counters, all
/// in one transaction. Flips the campaign to `Funded` when the goal is met.
pub async fn record_contribution(
    pool: &SqlitePool,
    campaign_id: i64,
    address: &str,
    amount: i64,
    now: i64,
) -> Result<(Campaign, Backer)> {
    if amount <= 0 {
        return Err(EngineError::Validation(
            "contribution amount must be positive".into(),
        ));
    }
    if address.trim().is_empty() {
        return Err(EngineError::Validation("backer address is required".into()));
    }

    let mut tx = pool.begin().await?;

    let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("campaign {campaign_id}")))?;

    if !campaign.status.accepts_contributions() {
        return Err(EngineError::Validation(format!(
            "campaign {campaign_id} is not accepting contributions (status {:?})",
            campaign.status
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO backers (campaign_id, address, amount, first_funded_at, last_funded_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ON CONFLICT (campaign_id, address)
        DO UPDATE SET amount = amount + excluded.amount, last_funded_at = excluded.last_funded_at
        "#,
    )
    .bind(campaign_id)
    .bind(address)
    .bind(amount)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE campaigns SET funds_raised = funds_raised + ?1, funds_locked = funds_locked + ?1 WHERE id = ?2",
    )
    .bind(amount)
    .bind(campaign_id)
    .execute(&mut *tx)
    .await?;

    // Goal reached: Active -> Funded. CAS on status keeps this race-free.
    sqlx::query(
        r#"
        UPDATE campaigns SET status = ?1, funded_at = ?2
        WHERE id = ?3 AND status = ?4 AND funds_raised >= total_goal
        "#,
    )
    .bind(CampaignStatus::Funded)
    .bind(now)
    .bind(campaign_id)
    .bind(CampaignStatus::Active)
    .execute(&mut *tx)
    .await?;

    let campaign = sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?1")
        .bind(campaign_id)
        .fetch_one(&mut *tx)
        .await?;
    let backer = sqlx::query_as::<_, Backer>(
        "SELECT * FROM backers WHERE campaign_id = ?1 AND address = ?2",
    )
    .bind(campaign_id)
    .bind(address)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok((campaign, backer))
}

pub async fn get_backer(
    pool: &SqlitePool,
    campaign_id: i64,
    address: &str,
) -> Result<Option<Backer>> {
    let row = sqlx::query_as::<_, Backer>(
        "SELECT * FROM backers WHERE campaign_id = ?1 AND address = ?2",
    )
    .bind(campaign_id)
    .bind(address)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_unrefunded_backers(
    pool: &SqlitePool,
    campaign_id: i64,
) -> Result<Vec<Backer>> {
    let rows = sqlx::query_as::<_, Backer>(
        r#"
        SELECT * FROM backers
        WHERE  campaign_id = ?1 AND refunded = 0 AND amount > 0
        ORDER  BY address ASC
        "#,
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_backer_refunded(
    pool: &SqlitePool,
    campaign_id: i64,
    address: &str,
) -> Result<()> {
    sqlx::query("UPDATE backers SET refunded = 1 WHERE campaign_id = ?1 AND address = ?2")
        .bind(campaign_id)
        .bind(address)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Milestone transitions
// ─────────────────────────────────────────────────────────

/// CAS status transition for a milestone. Same discipline as
/// [`transition_campaign`].
pub async fn transition_milestone(
    pool: &SqlitePool,
    milestone_id: i64,
    from: MilestoneStatus,
    to: MilestoneStatus,
) -> Result<Milestone> {
    if !from.can_transition_to(to) {
        return Err(illegal_milestone_transition(milestone_id, from, to));
    }

    let affected =
        sqlx::query("UPDATE milestones SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(to)
            .bind(milestone_id)
            .bind(from)
            .execute(pool)
            .await?
            .rows_affected();

    if affected == 0 {
        let current = get_milestone_by_id(pool, milestone_id).await?;
        return Err(illegal_milestone_transition(milestone_id, current.status, to));
    }
    get_milestone_by_id(pool, milestone_id).await
}

fn illegal_milestone_transition(
    id: i64,
    from: MilestoneStatus,
    to: MilestoneStatus,
) -> EngineError {
    EngineError::IllegalTransition {
        entity: format!("milestone {id}"),
        from: format!("{from:?}"),
        to: format!("{to:?}"),
    }
}

async fn get_milestone_by_id(pool: &SqlitePool, id: i64) -> Result<Milestone> {
    sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("milestone {id}")))
}

/// Same lookup through an open transaction, for failure paths that must not
/// acquire a second connection while the transaction holds one.
async fn milestone_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
) -> Result<Milestone> {
    sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("milestone {id}")))
}

/// Store a proof reference and open a fresh verification cycle.
///
/// Legal from `InProgress` (first submission) and `Rejected`
/// (re-submission). A new cycle resets the verdict to `Pending` and wipes
/// the previous cycle's votes and tallies.
pub async fn store_proof(
    pool: &SqlitePool,
    milestone_id: i64,
    proof_ref: &str,
    now: i64,
) -> Result<Milestone> {
    let mut tx = pool.begin().await?;

    let affected = sqlx::query(
        r#"
        UPDATE milestones SET
            status = ?1, proof_ref = ?2, verdict = ?3, confidence = 0,
            oracle_id = NULL, verdict_notes = NULL,
            votes_for = 0, votes_against = 0, voter_count = 0,
            proof_submitted_at = ?4, verified_at = NULL, voting_opened_at = NULL
        WHERE id = ?5 AND status IN (?6, ?7)
        "#,
    )
    .bind(MilestoneStatus::ProofSubmitted)
    .bind(proof_ref)
    .bind(Verdict::Pending)
    .bind(now)
    .bind(milestone_id)
    .bind(MilestoneStatus::InProgress)
    .bind(MilestoneStatus::Rejected)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        let current = milestone_in_tx(&mut tx, milestone_id).await?;
        return Err(EngineError::WrongState(format!(
            "proof can only be submitted while the milestone is InProgress or Rejected (currently {:?})",
            current.status
        )));
    }

    sqlx::query("DELETE FROM votes WHERE milestone_id = ?1")
        .bind(milestone_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    get_milestone_by_id(pool, milestone_id).await
}

/// Record a verdict and route the milestone accordingly, atomically.
///
/// `route` is the destination decided by the state machine: `VotingOpen`
/// (via an intermediate `AIVerified` step so the audit trail keeps both),
/// `Disputed`, or `Rejected`. Legal only from `ProofSubmitted`.
pub async fn apply_verdict(
    pool: &SqlitePool,
    milestone_id: i64,
    verdict: Verdict,
    confidence: i64,
    oracle_id: &str,
    notes: Option<&str>,
    route: MilestoneStatus,
    now: i64,
) -> Result<Milestone> {
    let first_step = if route == MilestoneStatus::VotingOpen {
        MilestoneStatus::AIVerified
    } else {
        route
    };

    let mut tx = pool.begin().await?;

    let affected = sqlx::query(
        r#"
        UPDATE milestones SET
            verdict = ?1, confidence = ?2, oracle_id = ?3, verdict_notes = ?4,
            verified_at = ?5, status = ?6
        WHERE id = ?7 AND status = ?8
        "#,
    )
    .bind(verdict)
    .bind(confidence)
    .bind(oracle_id)
    .bind(notes)
    .bind(now)
    .bind(first_step)
    .bind(milestone_id)
    .bind(MilestoneStatus::ProofSubmitted)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        let current = milestone_in_tx(&mut tx, milestone_id).await?;
        return Err(EngineError::WrongState(format!(
            "a verdict can only be recorded while the milestone is ProofSubmitted (currently {:?})",
            current.status
        )));
    }

    if route == MilestoneStatus::VotingOpen {
        sqlx::query(
            r#"
            UPDATE milestones SET
                status = ?1, voting_opened_at = ?2,
                votes_for = 0, votes_against = 0, voter_count = 0
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(MilestoneStatus::VotingOpen)
        .bind(now)
        .bind(milestone_id)
        .bind(MilestoneStatus::AIVerified)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    get_milestone_by_id(pool, milestone_id).await
}

// ─────────────────────────────────────────────────────────
// Votes
// ─────────────────────────────────────────────────────────

/// Insert a vote and bump the milestone tally as a single transaction.
///
/// The `(milestone_id, voter)` primary key is the double-vote guard: when
/// two votes from the same backer race, exactly one insert wins and the
/// loser gets `AlreadyVoted`. The tally update is guarded on `VotingOpen`
/// so a vote can never land on a milestone that closed mid-flight.
pub async fn insert_vote(
    pool: &SqlitePool,
    milestone_id: i64,
    voter: &str,
    approve: bool,
    weight: i64,
    now: i64,
) -> Result<Milestone> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO votes (milestone_id, voter, approve, weight, cast_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(milestone_id)
    .bind(voter)
    .bind(approve)
    .bind(weight)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => EngineError::AlreadyVoted,
        _ => EngineError::Database(e),
    })?;

    let tally_update = if approve {
        "UPDATE milestones SET votes_for = votes_for + ?1, voter_count = voter_count + 1
         WHERE id = ?2 AND status = ?3"
    } else {
        "UPDATE milestones SET votes_against = votes_against + ?1, voter_count = voter_count + 1
         WHERE id = ?2 AND status = ?3"
    };
    let affected = sqlx::query(tally_update)
        .bind(weight)
        .bind(milestone_id)
        .bind(MilestoneStatus::VotingOpen)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    if affected == 0 {
        // Voting closed between the caller's check and this write; the
        // dropped transaction rolls the insert back.
        return Err(EngineError::MilestoneNotVotable);
    }

    let milestone = sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(milestone_id)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(milestone)
}

/// All votes recorded for a milestone's current cycle.
pub async fn get_votes(pool: &SqlitePool, milestone_id: i64) -> Result<Vec<Vote>> {
    let rows = sqlx::query_as::<_, Vote>(
        "SELECT * FROM votes WHERE milestone_id = ?1 ORDER BY cast_at ASC, voter ASC",
    )
    .bind(milestone_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Release bookkeeping
// ─────────────────────────────────────────────────────────

/// Persist the idempotency key for a release attempt, keeping whatever key
/// was stored first. Returns the key that must be used for the invocation.
pub async fn claim_release_key(
    pool: &SqlitePool,
    milestone_id: i64,
    key: &str,
) -> Result<String> {
    sqlx::query(
        "UPDATE milestones SET release_key = COALESCE(release_key, ?1) WHERE id = ?2",
    )
    .bind(key)
    .bind(milestone_id)
    .execute(pool)
    .await?;

    let milestone = get_milestone_by_id(pool, milestone_id).await?;
    milestone
        .release_key
        .ok_or_else(|| EngineError::NotFound(format!("milestone {milestone_id}")))
}

/// Outcome of [`finalize_release`].
#[derive(Debug)]
pub struct ReleaseFinalize {
    pub milestone: Milestone,
    pub next: Option<Milestone>,
    pub all_released: bool,
}

/// Record a confirmed fund transfer: CAS the milestone to `Released`, move
/// escrow counters exactly once, and activate the next pending milestone.
///
/// Runs after the gateway confirms the transfer, as its own fast atomic
/// step — no ledger lock is ever held across the external call. A
/// concurrent caller that lost the race observes `AlreadyReleased`.
pub async fn finalize_release(
    pool: &SqlitePool,
    campaign_id: i64,
    milestone_id: i64,
    now: i64,
) -> Result<ReleaseFinalize> {
    let mut tx = pool.begin().await?;

    let affected = sqlx::query(
        "UPDATE milestones SET status = ?1, released_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(MilestoneStatus::Released)
    .bind(now)
    .bind(milestone_id)
    .bind(MilestoneStatus::Approved)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        let current = milestone_in_tx(&mut tx, milestone_id).await?;
        return Err(match current.status {
            MilestoneStatus::Released => EngineError::AlreadyReleased,
            _ => EngineError::NotApproved,
        });
    }

    let milestone = sqlx::query_as::<_, Milestone>("SELECT * FROM milestones WHERE id = ?1")
        .bind(milestone_id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE campaigns SET funds_released = funds_released + ?1, funds_locked = funds_locked - ?1
        WHERE id = ?2
        "#,
    )
    .bind(milestone.amount)
    .bind(campaign_id)
    .execute(&mut *tx)
    .await?;

    // Strictly sequential progression: the release unlocks the next
    // pending milestone, if any.
    sqlx::query(
        r#"
        UPDATE milestones SET status = ?1
        WHERE campaign_id = ?2 AND seq = ?3 AND status = ?4
        "#,
    )
    .bind(MilestoneStatus::InProgress)
    .bind(campaign_id)
    .bind(milestone.seq + 1)
    .bind(MilestoneStatus::Pending)
    .execute(&mut *tx)
    .await?;

    let next = sqlx::query_as::<_, Milestone>(
        "SELECT * FROM milestones WHERE campaign_id = ?1 AND seq = ?2",
    )
    .bind(campaign_id)
    .bind(milestone.seq + 1)
    .fetch_optional(&mut *tx)
    .await?;

    let remaining: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM milestones WHERE campaign_id = ?1 AND status != ?2",
    )
    .bind(campaign_id)
    .bind(MilestoneStatus::Released)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ReleaseFinalize {
        milestone,
        next,
        all_released: remaining.0 == 0,
    })
}

// ─────────────────────────────────────────────────────────
// Sweeper queries
// ─────────────────────────────────────────────────────────

/// Active campaigns whose funding deadline passed without reaching the goal.
pub async fn expired_active_campaigns(pool: &SqlitePool, now: i64) -> Result<Vec<Campaign>> {
    let rows = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT * FROM campaigns
        WHERE  status = ?1 AND deadline < ?2 AND funds_raised < total_goal
        "#,
    )
    .bind(CampaignStatus::Active)
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Milestones whose voting window has expired without approval.
pub async fn expired_voting_milestones(
    pool: &SqlitePool,
    now: i64,
    window_secs: i64,
) -> Result<Vec<Milestone>> {
    let rows = sqlx::query_as::<_, Milestone>(
        r#"
        SELECT * FROM milestones
        WHERE  status = ?1 AND voting_opened_at IS NOT NULL AND voting_opened_at + ?2 < ?3
        "#,
    )
    .bind(MilestoneStatus::VotingOpen)
    .bind(window_secs)
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MilestoneSpec;

    fn two_phase_spec() -> CampaignSpec {
        CampaignSpec {
            creator: "GCREATOR".into(),
            title: "Solar microgrid".into(),
            description: "Village installation".into(),
            metadata_ref: "QmMeta".into(),
            total_goal: 300,
            milestones: vec![
                MilestoneSpec {
                    title: "Panels".into(),
                    description: "Buy and mount panels".into(),
                    amount: 150,
                },
                MilestoneSpec {
                    title: "Grid".into(),
                    description: "Wire the village".into(),
                    amount: 150,
                },
            ],
            duration_secs: None,
        }
    }

    #[tokio::test]
    async fn create_then_get_preserves_milestone_sum() {
        let pool = test_pool().await;
        let (campaign, milestones) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();

        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].status, MilestoneStatus::InProgress);
        assert_eq!(milestones[1].status, MilestoneStatus::Pending);

        let fetched = get_campaign(&pool, campaign.id).await.unwrap();
        let sum: i64 = get_campaign_milestones(&pool, campaign.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.amount)
            .sum();
        assert_eq!(sum, fetched.total_goal);
    }

    #[tokio::test]
    async fn mismatched_milestone_sum_is_rejected() {
        let pool = test_pool().await;
        let mut spec = two_phase_spec();
        spec.milestones[1].amount = 100;
        let err = create_campaign(&pool, &spec, 9_999, 1_000).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn contribution_moves_escrow_and_flips_to_funded() {
        let pool = test_pool().await;
        let (campaign, _) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();

        let (after_first, backer) =
            record_contribution(&pool, campaign.id, "GBACKER1", 100, 1_001)
                .await
                .unwrap();
        assert_eq!(after_first.status, CampaignStatus::Active);
        assert_eq!(after_first.funds_raised, 100);
        assert_eq!(after_first.funds_locked, 100);
        assert_eq!(backer.amount, 100);

        let (after_second, _) =
            record_contribution(&pool, campaign.id, "GBACKER2", 400, 1_002)
                .await
                .unwrap();
        assert_eq!(after_second.status, CampaignStatus::Funded);
        assert_eq!(after_second.funds_raised, 500);
        assert_eq!(after_second.funded_at, Some(1_002));

        // Repeat donor accumulates into one record.
        let (_, backer) = record_contribution(&pool, campaign.id, "GBACKER1", 50, 1_003)
            .await
            .unwrap();
        assert_eq!(backer.amount, 150);
        assert_eq!(backer.first_funded_at, 1_001);
        assert_eq!(backer.last_funded_at, 1_003);
    }

    #[tokio::test]
    async fn non_positive_contribution_is_rejected() {
        let pool = test_pool().await;
        let (campaign, _) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();
        for bad in [0, -5] {
            let err = record_contribution(&pool, campaign.id, "GBACKER1", bad, 1_001)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn cas_transition_rejects_stale_from_status() {
        let pool = test_pool().await;
        let (campaign, milestones) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();
        let first = &milestones[0];

        // Legal CAS succeeds.
        let updated = transition_milestone(
            &pool,
            first.id,
            MilestoneStatus::InProgress,
            MilestoneStatus::ProofSubmitted,
        )
        .await
        .unwrap();
        assert_eq!(updated.status, MilestoneStatus::ProofSubmitted);

        // Same CAS again observes the new status and fails.
        let err = transition_milestone(
            &pool,
            first.id,
            MilestoneStatus::InProgress,
            MilestoneStatus::ProofSubmitted,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));

        // Backward transitions are rejected before touching the store.
        let err = transition_campaign(
            &pool,
            campaign.id,
            CampaignStatus::Funded,
            CampaignStatus::Active,
            1_001,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn double_vote_loses_at_the_store_layer() {
        let pool = test_pool().await;
        let (campaign, milestones) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();
        let ms = &milestones[0];

        // Walk the milestone to VotingOpen.
        store_proof(&pool, ms.id, "QmProof", 1_001).await.unwrap();
        apply_verdict(
            &pool,
            ms.id,
            Verdict::Completed,
            90,
            "oracle",
            None,
            MilestoneStatus::VotingOpen,
            1_002,
        )
        .await
        .unwrap();

        insert_vote(&pool, ms.id, "GBACKER1", true, 10, 1_003)
            .await
            .unwrap();
        let err = insert_vote(&pool, ms.id, "GBACKER1", false, 10, 1_004)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyVoted));

        // The losing vote left the tally untouched.
        let current = get_milestone(&pool, campaign.id, 0).await.unwrap();
        assert_eq!(current.votes_for, 10);
        assert_eq!(current.votes_against, 0);
        assert_eq!(current.voter_count, 1);
    }

    #[tokio::test]
    async fn resubmission_wipes_the_previous_cycle() {
        let pool = test_pool().await;
        let (_, milestones) = create_campaign(&pool, &two_phase_spec(), 9_999, 1_000)
            .await
            .unwrap();
        let ms = &milestones[0];

        store_proof(&pool, ms.id, "QmProofV1", 1_001).await.unwrap();
        apply_verdict(
            &pool,
            ms.id,
            Verdict::Rejected,
            20,
            "oracle",
            Some("blurry"),
            MilestoneStatus::Rejected,
            1_002,
        )
        .await
        .unwrap();

        let resubmitted = store_proof(&pool, ms.id, "QmProofV2", 1_003).await.unwrap();
        assert_eq!(resubmitted.status, MilestoneStatus::ProofSubmitted);
        assert_eq!(resubmitted.verdict, Verdict::Pending);
        assert_eq!(resubmitted.confidence, 0);
        assert_eq!(resubmitted.proof_ref.as_deref(), Some("QmProofV2"));
        assert!(resubmitted.verdict_notes.is_none());
        assert_eq!(resubmitted.votes_for, 0);
        assert!(get_votes(&pool, ms.id).await.unwrap().is_empty());
    }
}
