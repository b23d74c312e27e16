//! Feature flag management: CRUD, activation toggles, and cached
//! evaluation over the document store.

use crate::evaluator::{self, FlagEvaluation};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use stagepass_cache::TtlCache;
use stagepass_core::config::CacheConfig;
use stagepass_core::events::{EngineEvent, EngineEventType, EventSink};
use stagepass_core::types::*;
use stagepass_core::{EngineError, EngineResult};
use stagepass_store::FlagStore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlagRequest {
    pub owner_id: Uuid,
    pub key: String,
    pub name: String,
    pub flag_type: FlagType,
    pub default_value: serde_json::Value,
    #[serde(default)]
    pub targeting: FlagTargeting,
    #[serde(default)]
    pub variants: Vec<FlagVariant>,
    pub schedule: Option<Schedule>,
}

pub struct FlagService {
    store: Arc<dyn FlagStore>,
    events: Arc<dyn EventSink>,
    cache: TtlCache<(Uuid, String), FeatureFlag>,
}

impl FlagService {
    pub fn new(store: Arc<dyn FlagStore>, events: Arc<dyn EventSink>) -> Self {
        Self::with_config(store, events, &CacheConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn FlagStore>,
        events: Arc<dyn EventSink>,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            store,
            events,
            cache: TtlCache::new(cache.flag_ttl_secs, cache.max_entries),
        }
    }

    // ─── CRUD ───────────────────────────────────────────────────────────

    pub async fn create_flag(&self, req: CreateFlagRequest) -> EngineResult<FeatureFlag> {
        if req.key.is_empty() || req.key.contains(char::is_whitespace) {
            return Err(EngineError::Validation(format!(
                "flag key must be a non-empty token, got {:?}",
                req.key
            )));
        }
        if self.store.find_flag(req.owner_id, &req.key).await?.is_some() {
            return Err(EngineError::Validation(format!(
                "flag key {} already exists for this owner",
                req.key
            )));
        }
        validate_targeting(&req.targeting, &req.variants)?;

        let now = Utc::now();
        let flag = FeatureFlag {
            id: Uuid::new_v4(),
            owner_id: req.owner_id,
            key: req.key,
            name: req.name,
            flag_type: req.flag_type,
            default_value: req.default_value,
            status: FlagStatus::Inactive,
            targeting: req.targeting,
            variants: req.variants,
            schedule: req.schedule,
            created_at: now,
            updated_at: now,
        };
        self.store.put_flag(&flag).await?;

        info!(flag_key = %flag.key, owner_id = %flag.owner_id, "Feature flag created");
        metrics::counter!("flags.created").increment(1);
        self.events.emit(
            EngineEvent::new(EngineEventType::FlagCreated)
                .owner(flag.owner_id)
                .flag(flag.key.clone()),
        );
        Ok(flag)
    }

    pub async fn get_flag(&self, id: Uuid) -> EngineResult<FeatureFlag> {
        self.store
            .get_flag(id)
            .await?
            .ok_or_else(|| EngineError::FlagNotFound(id.to_string()))
    }

    pub async fn list_flags(&self, owner_id: Uuid) -> EngineResult<Vec<FeatureFlag>> {
        self.store.list_flags(owner_id).await
    }

    pub async fn toggle_flag(&self, id: Uuid, active: bool) -> EngineResult<FeatureFlag> {
        let mut flag = self.get_flag(id).await?;
        flag.status = if active {
            FlagStatus::Active
        } else {
            FlagStatus::Inactive
        };
        flag.updated_at = Utc::now();
        self.store.put_flag(&flag).await?;
        self.cache.invalidate(&(flag.owner_id, flag.key.clone()));

        info!(flag_key = %flag.key, active = active, "Feature flag toggled");
        self.events.emit(
            EngineEvent::new(EngineEventType::FlagToggled)
                .owner(flag.owner_id)
                .flag(flag.key.clone())
                .detail(serde_json::json!({ "active": active })),
        );
        Ok(flag)
    }

    pub async fn update_targeting(
        &self,
        id: Uuid,
        targeting: FlagTargeting,
    ) -> EngineResult<FeatureFlag> {
        let mut flag = self.get_flag(id).await?;
        validate_targeting(&targeting, &flag.variants)?;
        flag.targeting = targeting;
        flag.updated_at = Utc::now();
        self.store.put_flag(&flag).await?;
        self.cache.invalidate(&(flag.owner_id, flag.key.clone()));
        info!(flag_key = %flag.key, "Feature flag targeting updated");
        Ok(flag)
    }

    pub async fn delete_flag(&self, id: Uuid) -> EngineResult<bool> {
        let Some(flag) = self.store.get_flag(id).await? else {
            return Ok(false);
        };
        let removed = self.store.delete_flag(id).await?;
        if removed {
            self.cache.invalidate(&(flag.owner_id, flag.key.clone()));
            info!(flag_key = %flag.key, "Feature flag deleted");
        }
        Ok(removed)
    }

    // ─── Evaluation ─────────────────────────────────────────────────────

    /// Evaluate a flag for a visitor. `None` means "no active flag" — the
    /// caller falls back to its own compiled-in default. Store failures
    /// degrade the same way; a broken flag read must not break traffic.
    pub async fn evaluate(
        &self,
        owner_id: Uuid,
        key: &str,
        ctx: &EvalContext,
    ) -> EngineResult<Option<FlagEvaluation>> {
        let flag = match self.lookup(owner_id, key).await {
            Ok(Some(flag)) => flag,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(flag_key = key, error = %err, "Flag lookup failed; serving caller default");
                return Ok(None);
            }
        };
        if flag.status != FlagStatus::Active {
            return Ok(None);
        }

        let evaluation = evaluator::evaluate(&flag, ctx, Utc::now());
        debug!(
            flag_key = key,
            visitor_id = %ctx.visitor_id,
            reason = %evaluation.reason,
            "Flag evaluated"
        );
        metrics::counter!("flags.evaluations").increment(1);
        self.events.emit(
            EngineEvent::new(EngineEventType::FlagEvaluated)
                .owner(owner_id)
                .flag(key)
                .visitor(ctx.visitor_id.clone())
                .detail(serde_json::json!({ "reason": evaluation.reason })),
        );
        Ok(Some(evaluation))
    }

    async fn lookup(&self, owner_id: Uuid, key: &str) -> EngineResult<Option<FeatureFlag>> {
        let cache_key = (owner_id, key.to_string());
        if let Some(flag) = self.cache.get(&cache_key) {
            metrics::counter!("flags.cache.hit").increment(1);
            return Ok(Some(flag));
        }
        metrics::counter!("flags.cache.miss").increment(1);
        let flag = self.store.find_flag(owner_id, key).await?;
        if let Some(flag) = &flag {
            self.cache.put(cache_key, flag.clone());
        }
        Ok(flag)
    }
}

fn validate_targeting(targeting: &FlagTargeting, variants: &[FlagVariant]) -> EngineResult<()> {
    let known = |id: Uuid| variants.iter().any(|v| v.id == id);

    if let Some(pct) = targeting.percentage {
        if !(0.0..=100.0).contains(&pct) {
            return Err(EngineError::Validation(format!(
                "rollout percentage must be within [0, 100], got {pct}"
            )));
        }
    }
    if let Some(default_variant) = targeting.default_variant {
        if !known(default_variant) {
            return Err(EngineError::Validation(format!(
                "default variant {default_variant} is not declared on the flag"
            )));
        }
    }
    for rule in &targeting.rules {
        if let Some(pct) = rule.percentage {
            if !(0.0..=100.0).contains(&pct) {
                return Err(EngineError::Validation(format!(
                    "rule percentage must be within [0, 100], got {pct}"
                )));
            }
        }
        if let Some(variant) = rule.variant {
            if !known(variant) {
                return Err(EngineError::Validation(format!(
                    "rule variant {variant} is not declared on the flag"
                )));
            }
        }
    }
    Ok(())
}
