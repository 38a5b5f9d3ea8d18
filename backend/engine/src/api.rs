//! Axum REST API handlers.
//!
//! Each route maps 1:1 onto an engine or voting operation; handlers parse
//! input, delegate, and serialize the result. Error mapping to HTTP status
//! codes lives on the error type itself.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db;
use crate::engine::{Engine, RefundResult, ReleaseResult};
use crate::errors::EngineError;
use crate::gateway::GatewayResponse;
use crate::types::{Backer, Campaign, CampaignSpec, Milestone, SbtRole, Verdict, Vote};
use crate::voting::{self, voting_power, TallySnapshot, VoteOutcome};

/// Build the full route table around a shared engine.
pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/fund", post(fund_campaign))
        .route("/campaigns/:id/close", post(close_campaign))
        .route("/campaigns/:id/cancel", post(cancel_campaign))
        .route("/campaigns/:id/backers/:address", get(get_backer))
        .route("/campaigns/:id/milestones/:seq", get(get_milestone))
        .route("/campaigns/:id/milestones/:seq/proof", post(submit_proof))
        .route(
            "/campaigns/:id/milestones/:seq/ai-verdict",
            post(submit_verdict),
        )
        .route("/campaigns/:id/milestones/:seq/vote", post(cast_vote))
        .route("/campaigns/:id/milestones/:seq/votes", get(vote_status))
        .route("/campaigns/:id/milestones/:seq/release", post(release_funds))
        .route("/sbt/mint", post(mint_sbt))
        .route("/sbt/profile/:address", get(sbt_profile))
        .route("/admin/refund/:id", post(refund_backers))
        .with_state(engine)
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FundRequest {
    pub backer_address: String,
    pub amount: i64,
}

#[derive(Deserialize)]
pub struct ProofRequest {
    pub creator_address: String,
    pub proof_ref: String,
}

#[derive(Deserialize)]
pub struct VerdictRequest {
    pub status: Verdict,
    pub confidence: i64,
    pub oracle_id: String,
    pub analysis_notes: Option<String>,
}

#[derive(Deserialize)]
pub struct VoteRequest {
    pub voter_address: String,
    pub approve: bool,
}

#[derive(Deserialize)]
pub struct CallerRequest {
    pub caller_address: String,
}

#[derive(Deserialize)]
pub struct MintSbtRequest {
    pub recipient_address: String,
    pub role: SbtRole,
    #[serde(default)]
    pub campaign_id: i64,
    #[serde(default)]
    pub metadata_uri: String,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CampaignResponse {
    pub campaign: Campaign,
    pub milestones: Vec<Milestone>,
}

#[derive(Serialize)]
pub struct FundResponse {
    pub campaign: Campaign,
    pub backer: BackerResponse,
}

#[derive(Serialize)]
pub struct BackerResponse {
    pub campaign_id: i64,
    pub address: String,
    pub amount: i64,
    /// Quadratic voting power derived from the cumulative amount.
    pub voting_power: i64,
    pub refunded: bool,
}

impl From<Backer> for BackerResponse {
    fn from(b: Backer) -> Self {
        BackerResponse {
            campaign_id: b.campaign_id,
            address: b.address,
            amount: b.amount,
            voting_power: voting_power(b.amount),
            refunded: b.refunded,
        }
    }
}

#[derive(Serialize)]
pub struct VotesResponse {
    pub campaign_id: i64,
    pub milestone_seq: i64,
    #[serde(flatten)]
    pub tally: TallySnapshot,
    pub votes: Vec<Vote>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /status`
///
/// Deployment status and contract configuration; use it to verify the
/// contracts are reachable before making calls.
pub async fn status(State(engine): State<Engine>) -> impl IntoResponse {
    let cfg = &engine.cfg;
    Json(json!({
        "network": cfg.network,
        "rpc_url": cfg.rpc_url,
        "contracts": {
            "core": {
                "id": cfg.core_contract_id,
                "deployed": cfg.core_contract_id.is_some(),
                "description": "Campaign registry, escrow, voting, and release logic",
            },
            "sbt": {
                "id": cfg.sbt_contract_id,
                "deployed": cfg.sbt_contract_id.is_some(),
                "description": "SoulBound Token contract for reputation",
            },
        },
        "ready": cfg.core_contract_id.is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(engine): State<Engine>,
    Json(spec): Json<CampaignSpec>,
) -> Result<impl IntoResponse, EngineError> {
    let (campaign, milestones) = engine.create_campaign(&spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(CampaignResponse {
            campaign,
            milestones,
        }),
    ))
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
) -> Result<Json<CampaignResponse>, EngineError> {
    let campaign = db::get_campaign(&engine.pool, id).await?;
    let milestones = db::get_campaign_milestones(&engine.pool, id).await?;
    Ok(Json(CampaignResponse {
        campaign,
        milestones,
    }))
}

/// `POST /campaigns/:id/fund`
///
/// Funds are locked in escrow and released per approved milestone; the
/// backer's quadratic voting power follows from the cumulative amount.
pub async fn fund_campaign(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
    Json(req): Json<FundRequest>,
) -> Result<Json<FundResponse>, EngineError> {
    let (campaign, backer) = engine.fund(id, &req.backer_address, req.amount).await?;
    Ok(Json(FundResponse {
        campaign,
        backer: backer.into(),
    }))
}

/// `POST /campaigns/:id/close`
pub async fn close_campaign(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
    Json(req): Json<CallerRequest>,
) -> Result<Json<Campaign>, EngineError> {
    let campaign = engine.close_campaign(id, &req.caller_address).await?;
    Ok(Json(campaign))
}

/// `POST /campaigns/:id/cancel`
pub async fn cancel_campaign(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
    Json(req): Json<CallerRequest>,
) -> Result<Json<Campaign>, EngineError> {
    let campaign = engine.cancel_campaign(id, &req.caller_address).await?;
    Ok(Json(campaign))
}

/// `GET /campaigns/:id/backers/:address`
pub async fn get_backer(
    State(engine): State<Engine>,
    Path((id, address)): Path<(i64, String)>,
) -> Result<Json<BackerResponse>, EngineError> {
    let backer = db::get_backer(&engine.pool, id, &address)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("backer {address} on campaign {id}")))?;
    Ok(Json(backer.into()))
}

/// `GET /campaigns/:id/milestones/:seq`
pub async fn get_milestone(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
) -> Result<Json<Milestone>, EngineError> {
    let milestone = db::get_milestone(&engine.pool, id, seq).await?;
    Ok(Json(milestone))
}

/// `POST /campaigns/:id/milestones/:seq/proof`
pub async fn submit_proof(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
    Json(req): Json<ProofRequest>,
) -> Result<Json<Milestone>, EngineError> {
    let milestone = engine
        .submit_proof(id, seq, &req.creator_address, &req.proof_ref)
        .await?;
    Ok(Json(milestone))
}

/// `POST /campaigns/:id/milestones/:seq/ai-verdict`
///
/// Authorized oracle only. `Completed`/`Partial` open community voting,
/// `Suspicious` disputes the milestone, `Rejected` permits re-submission.
pub async fn submit_verdict(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
    Json(req): Json<VerdictRequest>,
) -> Result<Json<Milestone>, EngineError> {
    let milestone = engine
        .record_verdict(
            id,
            seq,
            req.status,
            req.confidence,
            &req.oracle_id,
            req.analysis_notes.as_deref(),
        )
        .await?;
    Ok(Json(milestone))
}

/// `POST /campaigns/:id/milestones/:seq/vote`
pub async fn cast_vote(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteOutcome>, EngineError> {
    let outcome = voting::cast_vote(&engine, id, seq, &req.voter_address, req.approve).await?;
    Ok(Json(outcome))
}

/// `GET /campaigns/:id/milestones/:seq/votes`
pub async fn vote_status(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
) -> Result<Json<VotesResponse>, EngineError> {
    let milestone = db::get_milestone(&engine.pool, id, seq).await?;
    let tally = voting::tally(&engine.pool, id, seq).await?;
    let votes = db::get_votes(&engine.pool, milestone.id).await?;
    Ok(Json(VotesResponse {
        campaign_id: id,
        milestone_seq: seq,
        tally,
        votes,
    }))
}

/// `POST /campaigns/:id/milestones/:seq/release`
pub async fn release_funds(
    State(engine): State<Engine>,
    Path((id, seq)): Path<(i64, i64)>,
) -> Result<Json<ReleaseResult>, EngineError> {
    let result = engine.release_funds(id, seq).await?;
    Ok(Json(result))
}

/// `POST /sbt/mint`
pub async fn mint_sbt(
    State(engine): State<Engine>,
    Json(req): Json<MintSbtRequest>,
) -> Result<Json<GatewayResponse>, EngineError> {
    let response = engine
        .mint_sbt(
            &req.recipient_address,
            req.role,
            req.campaign_id,
            &req.metadata_uri,
        )
        .await?;
    Ok(Json(response))
}

/// `GET /sbt/profile/:address`
pub async fn sbt_profile(
    State(engine): State<Engine>,
    Path(address): Path<String>,
) -> Result<Json<GatewayResponse>, EngineError> {
    let response = engine.sbt_profile(&address).await?;
    Ok(Json(response))
}

/// `POST /admin/refund/:id`
///
/// Admin only: return every backer's contribution for a failed campaign.
/// Backers whose refund call fails stay marked for a later retry.
pub async fn refund_backers(
    State(engine): State<Engine>,
    Path(id): Path<i64>,
    Json(req): Json<CallerRequest>,
) -> Result<Json<RefundResult>, EngineError> {
    if req.caller_address != engine.cfg.admin_key {
        return Err(EngineError::Unauthorized);
    }
    let result = engine.refund_backers(id).await?;
    Ok(Json(result))
}
