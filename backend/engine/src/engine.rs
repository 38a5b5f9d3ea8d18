//! Campaign state machine — the authoritative lifecycle for campaigns and
//! milestones, and the only component that moves money through the gateway.
//!
//! Every operation validates against the ledger at call time; nothing here
//! trusts a previously computed decision. Money movement follows a strict
//! fail-closed protocol: preconditions are re-verified, the gateway call
//! runs without holding any ledger transaction, and only a confirmed
//! transfer is recorded — via a CAS write that a concurrent caller loses
//! cleanly.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::gateway::{arg_pairs, ContractGateway, GatewayResponse};
use crate::notify::{Notification, Notifier};
use crate::oracle::{ProofContext, ProofOracle};
use crate::types::{
    Backer, Campaign, CampaignSpec, CampaignStatus, Milestone, MilestoneStatus, SbtRole, Verdict,
};
use crate::voting;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Outcome of a successful fund release.
#[derive(Debug, Serialize)]
pub struct ReleaseResult {
    pub milestone: Milestone,
    pub next_milestone: Option<Milestone>,
    /// Amount transferred to the creator (milestone amount minus fee).
    pub payout: i64,
    /// Platform fee retained from the milestone amount.
    pub fee: i64,
    /// Every milestone of the campaign is now released.
    pub all_released: bool,
}

/// Outcome of a refund pass over a failed campaign's backers.
#[derive(Debug, Serialize)]
pub struct RefundResult {
    pub refunded: Vec<String>,
    /// Backers whose refund call failed; they stay marked for retry.
    pub pending: Vec<String>,
    pub campaign_cancelled: bool,
}

#[derive(Clone)]
pub struct Engine {
    pub pool: SqlitePool,
    pub cfg: Arc<Config>,
    pub gateway: Arc<dyn ContractGateway>,
    pub oracle: Arc<dyn ProofOracle>,
    pub notifier: Notifier,
}

impl Engine {
    // ─────────────────────────────────────────────────────
    // Campaign registry
    // ─────────────────────────────────────────────────────

    /// Create a campaign. It starts `Active` with its first milestone
    /// `InProgress`, ready to receive funding.
    pub async fn create_campaign(
        &self,
        spec: &CampaignSpec,
    ) -> Result<(Campaign, Vec<Milestone>)> {
        let created_at = now();
        let duration = spec
            .duration_secs
            .unwrap_or(self.cfg.campaign_duration_secs);
        let deadline = created_at + duration;

        let (campaign, milestones) =
            db::create_campaign(&self.pool, spec, deadline, created_at).await?;
        info!(
            "campaign {} created by {} (goal {}, {} milestones)",
            campaign.id,
            campaign.creator,
            campaign.total_goal,
            milestones.len()
        );
        Ok((campaign, milestones))
    }

    /// Record a contribution. Funds are locked in escrow; the backer's
    /// voting power follows from the cumulative amount.
    pub async fn fund(
        &self,
        campaign_id: i64,
        backer: &str,
        amount: i64,
    ) -> Result<(Campaign, Backer)> {
        let (campaign, record) =
            db::record_contribution(&self.pool, campaign_id, backer, amount, now()).await?;

        info!(
            "campaign {campaign_id}: {backer} contributed {amount} (raised {}/{})",
            campaign.funds_raised, campaign.total_goal
        );
        self.notifier.send(Notification::DonationReceived {
            campaign_id,
            backer: backer.to_string(),
            amount,
        });

        // This contribution pushed the campaign over its goal.
        if campaign.status == CampaignStatus::Funded
            && campaign.funds_raised - amount < campaign.total_goal
        {
            info!("campaign {campaign_id} reached its funding goal");
            self.notifier.send(Notification::CampaignFunded {
                campaign_id,
                funds_raised: campaign.funds_raised,
            });
        }

        Ok((campaign, record))
    }

    // ─────────────────────────────────────────────────────
    // Proof and verification
    // ─────────────────────────────────────────────────────

    /// Submit proof of milestone completion. Legal while the milestone is
    /// `InProgress`, or `Rejected` for a re-submission. When automatic
    /// verification is enabled the oracle is dispatched on a detached task;
    /// the caller gets the `ProofSubmitted` milestone immediately.
    pub async fn submit_proof(
        &self,
        campaign_id: i64,
        seq: i64,
        creator: &str,
        proof_ref: &str,
    ) -> Result<Milestone> {
        if proof_ref.trim().is_empty() {
            return Err(EngineError::Validation("proof reference is required".into()));
        }

        let campaign = db::get_campaign(&self.pool, campaign_id).await?;
        if campaign.creator != creator {
            return Err(EngineError::NotCreator);
        }

        let milestone = db::get_milestone(&self.pool, campaign_id, seq).await?;
        let updated = db::store_proof(&self.pool, milestone.id, proof_ref, now()).await?;
        info!("campaign {campaign_id} milestone {seq}: proof submitted ({proof_ref})");

        if self.cfg.auto_verify {
            self.spawn_evaluation(campaign_id, seq, &updated, proof_ref.to_string());
        }
        Ok(updated)
    }

    /// Evaluate the proof off the request path and record the verdict.
    /// Timeouts and failures leave the milestone in `ProofSubmitted` so the
    /// submission can be retried manually.
    fn spawn_evaluation(
        &self,
        campaign_id: i64,
        seq: i64,
        milestone: &Milestone,
        proof_ref: String,
    ) {
        let engine = self.clone();
        let ctx = ProofContext {
            campaign_id,
            milestone_seq: seq,
            milestone_title: milestone.title.clone(),
        };
        tokio::spawn(async move {
            let result = crate::oracle::evaluate_with_timeout(
                engine.oracle.as_ref(),
                engine.cfg.oracle_timeout_secs,
                &proof_ref,
                &ctx,
            )
            .await;
            match result {
                Err(e) => warn!(
                    "campaign {campaign_id} milestone {seq}: oracle evaluation failed ({e}), milestone left in ProofSubmitted"
                ),
                Ok(v) => {
                    let oracle_id = engine.cfg.oracle_id.clone();
                    if let Err(e) = engine
                        .record_verdict(
                            campaign_id,
                            seq,
                            v.verdict,
                            v.confidence,
                            &oracle_id,
                            v.notes.as_deref(),
                        )
                        .await
                    {
                        warn!(
                            "campaign {campaign_id} milestone {seq}: recording oracle verdict failed: {e}"
                        );
                    }
                }
            }
        });
    }

    /// Record a verification verdict and route the milestone:
    /// `Completed`/`Partial` open community voting, `Suspicious` disputes
    /// the milestone, `Rejected` allows re-submission.
    pub async fn record_verdict(
        &self,
        campaign_id: i64,
        seq: i64,
        verdict: Verdict,
        confidence: i64,
        oracle_id: &str,
        notes: Option<&str>,
    ) -> Result<Milestone> {
        if !verdict.is_submittable() {
            return Err(EngineError::Validation(format!(
                "verdict {verdict:?} cannot be submitted"
            )));
        }
        if !(0..=100).contains(&confidence) {
            return Err(EngineError::Validation(
                "confidence must be between 0 and 100".into(),
            ));
        }
        if oracle_id != self.cfg.oracle_id && oracle_id != self.cfg.admin_key {
            return Err(EngineError::UnauthorizedOracle);
        }

        let milestone = db::get_milestone(&self.pool, campaign_id, seq).await?;
        let route = match verdict {
            Verdict::Completed | Verdict::Partial => MilestoneStatus::VotingOpen,
            Verdict::Suspicious => MilestoneStatus::Disputed,
            _ => MilestoneStatus::Rejected,
        };

        let updated = db::apply_verdict(
            &self.pool,
            milestone.id,
            verdict,
            confidence,
            oracle_id,
            notes,
            route,
            now(),
        )
        .await?;

        info!(
            "campaign {campaign_id} milestone {seq}: verdict {verdict:?} ({confidence}%) -> {:?}",
            updated.status
        );
        match route {
            MilestoneStatus::VotingOpen => self.notifier.send(Notification::VotingOpened {
                campaign_id,
                milestone_seq: seq,
            }),
            MilestoneStatus::Disputed => self.notifier.send(Notification::MilestoneDisputed {
                campaign_id,
                milestone_seq: seq,
            }),
            _ => self.notifier.send(Notification::ProofRejected {
                campaign_id,
                milestone_seq: seq,
                verdict,
            }),
        }
        Ok(updated)
    }

    // ─────────────────────────────────────────────────────
    // Escrow release
    // ─────────────────────────────────────────────────────

    /// Release an approved milestone's funds to the creator.
    ///
    /// All preconditions are re-verified against the ledger here, at call
    /// time. The transfer is invoked with a persisted idempotency key, so a
    /// retry after a gateway failure can never double-spend, and the
    /// `Released` transition happens only after confirmation.
    pub async fn release_funds(&self, campaign_id: i64, seq: i64) -> Result<ReleaseResult> {
        let campaign = db::get_campaign(&self.pool, campaign_id).await?;
        let milestone = db::get_milestone(&self.pool, campaign_id, seq).await?;

        match milestone.status {
            MilestoneStatus::Released => return Err(EngineError::AlreadyReleased),
            MilestoneStatus::Approved => {}
            _ => return Err(EngineError::NotApproved),
        }
        if !voting::approvable(
            milestone.votes_for,
            milestone.votes_against,
            milestone.voter_count,
            self.cfg.min_voters,
        ) {
            return Err(EngineError::NotApproved);
        }
        if campaign.funds_locked < milestone.amount {
            // Ledger and chain have drifted; surface loudly, never coerce.
            return Err(EngineError::InsufficientEscrow(format!(
                "campaign {campaign_id} holds {} in escrow, milestone {seq} needs {}",
                campaign.funds_locked, milestone.amount
            )));
        }

        let fee = milestone.amount * self.cfg.platform_fee_bps / 10_000;
        let payout = milestone.amount - fee;

        // The first attempt persists the key; every retry reuses it verbatim.
        let key = db::claim_release_key(
            &self.pool,
            milestone.id,
            &format!("release-c{campaign_id}-m{seq}"),
        )
        .await?;

        let core = self.core_contract()?;
        let args = arg_pairs(&[
            ("campaign_id", campaign_id.to_string()),
            ("milestone_id", seq.to_string()),
        ]);
        let response = self.gateway.invoke(core, "release_funds", &args, &key).await?;
        if response.duplicate {
            info!("campaign {campaign_id} milestone {seq}: transfer was already applied on-chain");
        }

        let fin = db::finalize_release(&self.pool, campaign_id, milestone.id, now()).await?;
        info!(
            "campaign {campaign_id} milestone {seq}: released {payout} to creator, fee {fee}"
        );
        self.notifier.send(Notification::MilestoneReleased {
            campaign_id,
            milestone_seq: seq,
            payout,
            fee,
        });

        Ok(ReleaseResult {
            milestone: fin.milestone,
            next_milestone: fin.next,
            payout,
            fee,
            all_released: fin.all_released,
        })
    }

    /// Return every backer's contribution for a failed campaign. Each
    /// refund is its own gateway call with a per-backer idempotency key;
    /// failures leave that backer marked for retry. Once every backer is
    /// refunded the campaign moves to its terminal `Cancelled` state.
    pub async fn refund_backers(&self, campaign_id: i64) -> Result<RefundResult> {
        let campaign = db::get_campaign(&self.pool, campaign_id).await?;
        if campaign.status != CampaignStatus::Failed {
            return Err(EngineError::WrongState(format!(
                "refunds require a Failed campaign (currently {:?})",
                campaign.status
            )));
        }

        let core = self.core_contract()?;
        let mut refunded = Vec::new();
        let mut pending = Vec::new();

        for backer in db::list_unrefunded_backers(&self.pool, campaign_id).await? {
            let key = format!("refund-c{campaign_id}-{}", backer.address);
            let args = arg_pairs(&[
                ("campaign_id", campaign_id.to_string()),
                ("backer", backer.address.clone()),
                ("amount", backer.amount.to_string()),
            ]);
            match self.gateway.invoke(core, "refund_backer", &args, &key).await {
                Ok(_) => {
                    db::mark_backer_refunded(&self.pool, campaign_id, &backer.address).await?;
                    refunded.push(backer.address);
                }
                Err(e) => {
                    warn!(
                        "campaign {campaign_id}: refund for {} failed ({e}), left for retry",
                        backer.address
                    );
                    pending.push(backer.address);
                }
            }
        }

        let mut campaign_cancelled = false;
        if pending.is_empty() {
            match db::transition_campaign(
                &self.pool,
                campaign_id,
                CampaignStatus::Failed,
                CampaignStatus::Cancelled,
                now(),
            )
            .await
            {
                Ok(_) => campaign_cancelled = true,
                // A previous refund pass already closed it.
                Err(EngineError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            "campaign {campaign_id}: refunded {} backers, {} pending",
            refunded.len(),
            pending.len()
        );
        Ok(RefundResult {
            refunded,
            pending,
            campaign_cancelled,
        })
    }

    // ─────────────────────────────────────────────────────
    // Campaign closing
    // ─────────────────────────────────────────────────────

    /// Close a campaign once every milestone has been released. Creator or
    /// admin only. Awards the creator a reputation token off the request
    /// path.
    pub async fn close_campaign(&self, campaign_id: i64, caller: &str) -> Result<Campaign> {
        let campaign = db::get_campaign(&self.pool, campaign_id).await?;
        if caller != campaign.creator && caller != self.cfg.admin_key {
            return Err(EngineError::Unauthorized);
        }

        let milestones = db::get_campaign_milestones(&self.pool, campaign_id).await?;
        if !milestones
            .iter()
            .all(|m| m.status == MilestoneStatus::Released)
        {
            return Err(EngineError::WrongState(
                "campaign cannot close until every milestone is released".into(),
            ));
        }

        let updated = db::transition_campaign(
            &self.pool,
            campaign_id,
            campaign.status,
            CampaignStatus::Completed,
            now(),
        )
        .await?;

        info!("campaign {campaign_id} completed");
        self.notifier
            .send(Notification::CampaignCompleted { campaign_id });
        self.spawn_sbt_award(campaign_id, updated.creator.clone(), SbtRole::Creator);
        Ok(updated)
    }

    /// Cancel a campaign before any funds have moved. Creator or admin
    /// only; refused once a milestone has been released. The row is kept
    /// for audit.
    pub async fn cancel_campaign(&self, campaign_id: i64, caller: &str) -> Result<Campaign> {
        let campaign = db::get_campaign(&self.pool, campaign_id).await?;
        if caller != campaign.creator && caller != self.cfg.admin_key {
            return Err(EngineError::Unauthorized);
        }
        if campaign.status.is_terminal() {
            return Err(EngineError::WrongState(format!(
                "campaign is already closed ({:?})",
                campaign.status
            )));
        }

        let milestones = db::get_campaign_milestones(&self.pool, campaign_id).await?;
        if milestones.iter().any(|m| m.status.is_terminal()) {
            return Err(EngineError::WrongState(
                "campaign cannot be cancelled after a release".into(),
            ));
        }

        db::transition_campaign(
            &self.pool,
            campaign_id,
            campaign.status,
            CampaignStatus::Cancelled,
            now(),
        )
        .await
    }

    // ─────────────────────────────────────────────────────
    // Reputation tokens
    // ─────────────────────────────────────────────────────

    /// Mint a non-transferable reputation token through the SBT contract.
    pub async fn mint_sbt(
        &self,
        recipient: &str,
        role: SbtRole,
        campaign_id: i64,
        metadata_uri: &str,
    ) -> Result<GatewayResponse> {
        if recipient.trim().is_empty() {
            return Err(EngineError::Validation("recipient is required".into()));
        }
        let sbt = self.sbt_contract()?;
        let args = arg_pairs(&[
            ("caller", self.cfg.admin_key.clone()),
            ("recipient", recipient.to_string()),
            ("role", role.code().to_string()),
            ("campaign_id", campaign_id.to_string()),
            ("metadata_uri", metadata_uri.to_string()),
        ]);
        let key = format!("sbt-{recipient}-{}-c{campaign_id}", role.code());
        self.gateway.invoke(sbt, "mint", &args, &key).await
    }

    /// Read a user's reputation profile from the SBT contract.
    pub async fn sbt_profile(&self, address: &str) -> Result<GatewayResponse> {
        let sbt = self.sbt_contract()?;
        let args = arg_pairs(&[("user", address.to_string())]);
        self.gateway.query(sbt, "get_profile", &args).await
    }

    fn spawn_sbt_award(&self, campaign_id: i64, recipient: String, role: SbtRole) {
        if self.cfg.sbt_contract_id.is_none() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.mint_sbt(&recipient, role, campaign_id, "").await {
                warn!("campaign {campaign_id}: reputation award for {recipient} failed: {e}");
            }
        });
    }

    // ─────────────────────────────────────────────────────
    // Contract address lookup
    // ─────────────────────────────────────────────────────

    fn core_contract(&self) -> Result<&str> {
        self.cfg.core_contract_id.as_deref().ok_or_else(|| {
            EngineError::Gateway("core contract is not deployed; set CORE_CONTRACT_ID".into())
        })
    }

    fn sbt_contract(&self) -> Result<&str> {
        self.cfg.sbt_contract_id.as_deref().ok_or_else(|| {
            EngineError::Gateway("SBT contract is not deployed; set SBT_CONTRACT_ID".into())
        })
    }
}

// ─────────────────────────────────────────────────────────
// Test harness
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::gateway::testing::MockGateway;
    use crate::oracle::HeuristicOracle;
    use crate::types::MilestoneSpec;

    pub async fn test_engine() -> (Engine, Arc<MockGateway>) {
        test_engine_with(Config::for_tests()).await
    }

    pub async fn test_engine_with(cfg: Config) -> (Engine, Arc<MockGateway>) {
        let pool = db::test_pool().await;
        let gateway = Arc::new(MockGateway::default());
        let gateway_dyn: Arc<dyn ContractGateway> = gateway.clone();
        let engine = Engine {
            pool,
            cfg: Arc::new(cfg),
            gateway: gateway_dyn,
            oracle: Arc::new(HeuristicOracle),
            notifier: Notifier::new(None).unwrap(),
        };
        (engine, gateway)
    }

    impl Engine {
        /// Goal 300 across two milestones of 150; backers contribute 100
        /// and 400 (voting powers 10 and 20).
        pub async fn scenario_campaign(&self) -> (Campaign, Vec<Milestone>) {
            let spec = CampaignSpec {
                creator: "GCREATOR".into(),
                title: "Reef restoration".into(),
                description: "Replant 2km of coral".into(),
                metadata_ref: "QmMeta".into(),
                total_goal: 300,
                milestones: vec![
                    MilestoneSpec {
                        title: "Nursery".into(),
                        description: "Grow coral fragments".into(),
                        amount: 150,
                    },
                    MilestoneSpec {
                        title: "Outplanting".into(),
                        description: "Transplant to the reef".into(),
                        amount: 150,
                    },
                ],
                duration_secs: None,
            };
            let (campaign, _) = self.create_campaign(&spec).await.unwrap();
            self.fund(campaign.id, "GBACKER1", 100).await.unwrap();
            let (campaign, _) = self.fund(campaign.id, "GBACKER2", 400).await.unwrap();
            let milestones = db::get_campaign_milestones(&self.pool, campaign.id)
                .await
                .unwrap();
            (campaign, milestones)
        }

        /// Walk a milestone through proof submission and a passing verdict
        /// so it sits in `VotingOpen`.
        pub async fn open_voting(&self, campaign_id: i64, seq: i64) {
            self.submit_proof(
                campaign_id,
                seq,
                "GCREATOR",
                &format!("QmProofForMilestone{seq:04}"),
            )
            .await
            .unwrap();
            self.record_verdict(campaign_id, seq, Verdict::Completed, 90, "oracle", None)
                .await
                .unwrap();
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
