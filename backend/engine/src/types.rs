//! Canonical entity types shared across the engine.
//!
//! ## Status as a Finite-State Machine
//!
//! [`CampaignStatus`] and [`MilestoneStatus`] enforce strict forward-only
//! lifecycles:
//!
//! ```text
//! Campaign:  Draft ──► Active ──► Funded ──► Completed
//!                        │           │
//!                        └──► Failed ◄┘        (deadline without goal)
//!            any non-terminal ──► Cancelled    (no milestone Released)
//!
//! Milestone: Pending ──► InProgress ──► ProofSubmitted ──► AIVerified ──► VotingOpen
//!                             ▲               │  │                            │
//!                             │               │  └──► Disputed                ├──► Approved ──► Released
//!                             │               └─────► Rejected ──┐           └──► Rejected
//!                             └──────────────────────────────────┘ (re-submission)
//! ```
//!
//! Backward transitions and transitions out of terminal states are rejected
//! by the compare-and-swap writes in the ledger layer.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};

// ─────────────────────────────────────────────────────────
// Status enums
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum CampaignStatus {
    Draft,
    Active,
    Funded,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    /// Forward-only transition table. Anything not listed is illegal.
    pub fn can_transition_to(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Active)
                | (Active, Funded)
                | (Funded, Completed)
                | (Active, Failed)
                | (Funded, Failed)
                | (Draft, Cancelled)
                | (Active, Cancelled)
                | (Funded, Cancelled)
                | (Failed, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses in which contributions are accepted.
    pub fn accepts_contributions(self) -> bool {
        matches!(self, Self::Active | Self::Funded)
    }
}

/// Lifecycle status of a single milestone within a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    ProofSubmitted,
    AIVerified,
    VotingOpen,
    Approved,
    Released,
    Disputed,
    Rejected,
}

impl MilestoneStatus {
    /// Forward-only transition table; `Rejected -> ProofSubmitted` is the
    /// one intentional loop (proof re-submission starts a fresh cycle).
    pub fn can_transition_to(self, to: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (InProgress, ProofSubmitted)
                | (ProofSubmitted, AIVerified)
                | (ProofSubmitted, Disputed)
                | (ProofSubmitted, Rejected)
                | (AIVerified, VotingOpen)
                | (VotingOpen, Approved)
                | (VotingOpen, Rejected)
                | (Approved, Released)
                | (Rejected, ProofSubmitted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released)
    }
}

/// Outcome of a proof evaluation, recorded once per submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Verdict {
    NotSubmitted,
    Pending,
    Completed,
    Partial,
    Suspicious,
    Rejected,
}

impl Verdict {
    /// Only these four may arrive from an oracle; `NotSubmitted` and
    /// `Pending` are internal bookkeeping states.
    pub fn is_submittable(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Suspicious | Self::Rejected
        )
    }
}

/// Non-transferable reputation token roles, minted through the SBT contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SbtRole {
    Creator,
    Backer,
    SuperBacker,
    Developer,
    Designer,
    Tester,
    Mentor,
    Validator,
    Ambassador,
    Pioneer,
}

impl SbtRole {
    /// Numeric role code expected by the SBT contract's `mint` entry point.
    pub fn code(self) -> &'static str {
        match self {
            Self::Creator => "0",
            Self::Backer => "1",
            Self::SuperBacker => "2",
            Self::Developer => "3",
            Self::Designer => "4",
            Self::Tester => "5",
            Self::Mentor => "6",
            Self::Validator => "7",
            Self::Ambassador => "8",
            Self::Pioneer => "9",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Stored records
// ─────────────────────────────────────────────────────────

/// A campaign row. Amounts are in stroops (smallest currency unit).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: i64,
    pub creator: String,
    pub title: String,
    pub description: String,
    pub metadata_ref: String,
    pub total_goal: i64,
    pub funds_raised: i64,
    pub funds_released: i64,
    pub funds_locked: i64,
    pub status: CampaignStatus,
    pub deadline: i64,
    pub created_at: i64,
    pub funded_at: Option<i64>,
    pub closed_at: Option<i64>,
}

/// A milestone row. `seq` is the zero-based position within its campaign;
/// the API addresses milestones by `(campaign_id, seq)`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Milestone {
    pub id: i64,
    pub campaign_id: i64,
    pub seq: i64,
    pub title: String,
    pub description: String,
    pub amount: i64,
    pub status: MilestoneStatus,
    pub proof_ref: Option<String>,
    pub verdict: Verdict,
    pub confidence: i64,
    pub oracle_id: Option<String>,
    pub verdict_notes: Option<String>,
    pub votes_for: i64,
    pub votes_against: i64,
    pub voter_count: i64,
    pub proof_submitted_at: Option<i64>,
    pub verified_at: Option<i64>,
    pub voting_opened_at: Option<i64>,
    pub released_at: Option<i64>,
    pub release_key: Option<String>,
}

/// Cumulative contribution record for one backer on one campaign.
///
/// Voting power is always recomputed from `amount` at the point of use,
/// never stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Backer {
    pub campaign_id: i64,
    pub address: String,
    pub amount: i64,
    pub first_funded_at: i64,
    pub last_funded_at: i64,
    pub refunded: bool,
}

/// A single cast vote. `weight` is the voter's quadratic power at cast time.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Vote {
    pub milestone_id: i64,
    pub voter: String,
    pub approve: bool,
    pub weight: i64,
    pub cast_at: i64,
}

// ─────────────────────────────────────────────────────────
// Creation inputs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneSpec {
    pub title: String,
    pub description: String,
    /// Amount in stroops; must be positive.
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignSpec {
    pub creator: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub metadata_ref: String,
    /// Total funding goal in stroops.
    pub total_goal: i64,
    pub milestones: Vec<MilestoneSpec>,
    /// Funding window in seconds; falls back to the configured default.
    pub duration_secs: Option<i64>,
}

impl CampaignSpec {
    /// Boundary validation: runs once where external input is parsed, so the
    /// rest of the engine can rely on well-formed values.
    pub fn validate(&self) -> Result<()> {
        if self.creator.trim().is_empty() {
            return Err(EngineError::Validation("creator is required".into()));
        }
        if self.title.trim().is_empty() {
            return Err(EngineError::Validation("title is required".into()));
        }
        if self.total_goal <= 0 {
            return Err(EngineError::Validation(
                "total goal must be positive".into(),
            ));
        }
        if self.milestones.is_empty() {
            return Err(EngineError::Validation(
                "at least one milestone is required".into(),
            ));
        }
        if let Some(d) = self.duration_secs {
            if d <= 0 {
                return Err(EngineError::Validation(
                    "duration must be positive".into(),
                ));
            }
        }
        for ms in &self.milestones {
            if ms.amount <= 0 {
                return Err(EngineError::Validation(format!(
                    "milestone '{}' has a non-positive amount",
                    ms.title
                )));
            }
        }
        let sum: i64 = self.milestones.iter().map(|m| m.amount).sum();
        if sum != self.total_goal {
            return Err(EngineError::Validation(format!(
                "milestone amounts ({sum}) must equal total goal ({})",
                self.total_goal
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(goal: i64, amounts: &[i64]) -> CampaignSpec {
        CampaignSpec {
            creator: "GCREATOR".into(),
            title: "Reef restoration".into(),
            description: "Replant 2km of coral".into(),
            metadata_ref: String::new(),
            total_goal: goal,
            milestones: amounts
                .iter()
                .enumerate()
                .map(|(i, &a)| MilestoneSpec {
                    title: format!("Phase {}", i + 1),
                    description: String::new(),
                    amount: a,
                })
                .collect(),
            duration_secs: None,
        }
    }

    #[test]
    fn campaign_transitions_are_forward_only() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Funded));
        assert!(Funded.can_transition_to(Completed));
        assert!(Active.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Cancelled));

        assert!(!Funded.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));
    }

    #[test]
    fn milestone_transitions_follow_the_lifecycle() {
        use MilestoneStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(ProofSubmitted));
        assert!(ProofSubmitted.can_transition_to(AIVerified));
        assert!(AIVerified.can_transition_to(VotingOpen));
        assert!(VotingOpen.can_transition_to(Approved));
        assert!(VotingOpen.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Released));
        // Re-submission loop after a rejected verdict.
        assert!(Rejected.can_transition_to(ProofSubmitted));

        assert!(!Released.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(VotingOpen));
        assert!(!Disputed.can_transition_to(VotingOpen));
    }

    #[test]
    fn only_final_verdicts_are_submittable() {
        assert!(Verdict::Completed.is_submittable());
        assert!(Verdict::Partial.is_submittable());
        assert!(Verdict::Suspicious.is_submittable());
        assert!(Verdict::Rejected.is_submittable());
        assert!(!Verdict::NotSubmitted.is_submittable());
        assert!(!Verdict::Pending.is_submittable());
    }

    #[test]
    fn spec_milestones_must_sum_to_goal() {
        assert!(spec(300, &[150, 150]).validate().is_ok());
        assert!(spec(300, &[100, 150]).validate().is_err());
        assert!(spec(0, &[]).validate().is_err());
        assert!(spec(300, &[300, 0]).validate().is_err());
    }
}
