//! Settings storage and the hierarchical config resolver.
//!
//! A setting is (env, key) -> {value, declared type, constraints}. Typed
//! getters coerce on read and reject constraint violations; a missing or
//! malformed setting falls back to the canonical default where one exists
//! and otherwise fails the enclosing operation at the point of resolution.
//!
//! JSON-typed thresholds may carry a hierarchical shape
//! `{"global": V, "overrides": [{"scope": {...}, "value": V}]}` resolved by
//! most-specific match: triples beat pairs beat singletons beat global,
//! first declaration wins ties.

use millrace_db::{DbError, MillraceDb};
use millrace_protocol::{defaults, settings as keys, EnvId};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::models::Setting;
use crate::now_rfc3339;

/// Settings errors. Config errors fail the operation that resolved them.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("setting '{key}': expected {expected}, stored type is {actual}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: String,
    },

    #[error("setting '{key}': cannot parse '{value}' as {expected}")]
    Parse {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("setting '{key}': value {value} violates constraint {constraint}")]
    Constraint {
        key: String,
        value: String,
        constraint: String,
    },
}

impl From<sqlx::Error> for SettingsError {
    fn from(e: sqlx::Error) -> Self {
        Self::Db(DbError::Sqlx(e))
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Declared value type of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
}

impl SettingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingType::String => "string",
            SettingType::Integer => "integer",
            SettingType::Float => "float",
            SettingType::Boolean => "boolean",
            SettingType::Json => "json",
        }
    }
}

impl fmt::Display for SettingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" => Ok(SettingType::String),
            "integer" => Ok(SettingType::Integer),
            "float" => Ok(SettingType::Float),
            "boolean" => Ok(SettingType::Boolean),
            "json" => Ok(SettingType::Json),
            _ => Err(format!("invalid setting type: '{s}'")),
        }
    }
}

/// Range / enum constraints carried by a setting row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Constraints {
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    allowed: Option<Vec<String>>,
}

/// Concrete scope a threshold is being resolved for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_type: Option<String>,
}

impl ThresholdScope {
    pub fn facility(facility: impl Into<String>) -> Self {
        Self {
            facility: Some(facility.into()),
            ..Default::default()
        }
    }

    /// Number of populated facets - the specificity rank.
    fn specificity(&self) -> u32 {
        [self.facility.is_some(), self.warehouse.is_some(), self.order_type.is_some()]
            .iter()
            .filter(|b| **b)
            .count() as u32
    }

    /// An override scope matches when every facet it pins equals ours.
    fn matches(&self, target: &ThresholdScope) -> bool {
        fn facet(ours: &Option<String>, theirs: &Option<String>) -> bool {
            match ours {
                Some(v) => theirs.as_deref() == Some(v.as_str()),
                None => true,
            }
        }
        facet(&self.facility, &target.facility)
            && facet(&self.warehouse, &target.warehouse)
            && facet(&self.order_type, &target.order_type)
    }
}

/// Hierarchical threshold payload of a JSON setting.
#[derive(Debug, Clone, Deserialize)]
struct HierarchicalThreshold {
    global: serde_json::Value,
    #[serde(default)]
    overrides: Vec<ThresholdOverride>,
}

#[derive(Debug, Clone, Deserialize)]
struct ThresholdOverride {
    scope: ThresholdScope,
    value: serde_json::Value,
}

/// Raw (env, key) setting persistence.
#[derive(Clone)]
pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    pub fn new(db: &MillraceDb) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    pub async fn upsert(
        &self,
        env: &EnvId,
        key: &str,
        value: &str,
        value_type: SettingType,
        constraints: Option<&serde_json::Value>,
        category: Option<&str>,
        updated_by: Option<&str>,
    ) -> Result<()> {
        let constraints_text = constraints.map(|c| c.to_string());
        sqlx::query(
            r#"
            INSERT INTO mr_settings (env, key, value, value_type, constraints, category, updated_by, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (env, key) DO UPDATE SET
                value = excluded.value,
                value_type = excluded.value_type,
                constraints = excluded.constraints,
                category = excluded.category,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(env.as_str())
        .bind(key)
        .bind(value)
        .bind(value_type.as_str())
        .bind(constraints_text)
        .bind(category)
        .bind(updated_by)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, env: &EnvId, key: &str) -> Result<Option<Setting>> {
        Ok(
            sqlx::query_as::<_, Setting>("SELECT * FROM mr_settings WHERE env = ? AND key = ?")
                .bind(env.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    fn check_numeric_constraints(setting: &Setting, value: f64) -> Result<()> {
        let Some(raw) = setting.constraints.as_deref() else {
            return Ok(());
        };
        let constraints: Constraints = serde_json::from_str(raw).unwrap_or_default();
        if let Some(min) = constraints.min {
            if value < min {
                return Err(SettingsError::Constraint {
                    key: setting.key.clone(),
                    value: value.to_string(),
                    constraint: format!("min={min}"),
                });
            }
        }
        if let Some(max) = constraints.max {
            if value > max {
                return Err(SettingsError::Constraint {
                    key: setting.key.clone(),
                    value: value.to_string(),
                    constraint: format!("max={max}"),
                });
            }
        }
        Ok(())
    }

    fn check_enum_constraint(setting: &Setting) -> Result<()> {
        let Some(raw) = setting.constraints.as_deref() else {
            return Ok(());
        };
        let constraints: Constraints = serde_json::from_str(raw).unwrap_or_default();
        if let Some(allowed) = constraints.allowed {
            if !allowed.iter().any(|a| a == &setting.value) {
                return Err(SettingsError::Constraint {
                    key: setting.key.clone(),
                    value: setting.value.clone(),
                    constraint: format!("allowed={allowed:?}"),
                });
            }
        }
        Ok(())
    }

    /// Integer setting, coerced and constraint-checked.
    pub async fn get_i64(&self, env: &EnvId, key: &str) -> Result<Option<i64>> {
        let Some(setting) = self.get(env, key).await? else {
            return Ok(None);
        };
        let declared: SettingType = setting.value_type.parse().map_err(|_| {
            SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "integer",
                actual: setting.value_type.clone(),
            }
        })?;
        if !matches!(declared, SettingType::Integer) {
            return Err(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "integer",
                actual: setting.value_type.clone(),
            });
        }
        let value = setting
            .value
            .trim()
            .parse::<i64>()
            .map_err(|_| SettingsError::Parse {
                key: key.to_string(),
                value: setting.value.clone(),
                expected: "integer",
            })?;
        Self::check_numeric_constraints(&setting, value as f64)?;
        Ok(Some(value))
    }

    /// Float setting, coerced and constraint-checked. Integer-typed values
    /// widen silently.
    pub async fn get_f64(&self, env: &EnvId, key: &str) -> Result<Option<f64>> {
        let Some(setting) = self.get(env, key).await? else {
            return Ok(None);
        };
        let declared: SettingType =
            setting
                .value_type
                .parse()
                .map_err(|_| SettingsError::TypeMismatch {
                    key: key.to_string(),
                    expected: "float",
                    actual: setting.value_type.clone(),
                })?;
        if !matches!(declared, SettingType::Float | SettingType::Integer) {
            return Err(SettingsError::TypeMismatch {
                key: key.to_string(),
                expected: "float",
                actual: setting.value_type.clone(),
            });
        }
        let value = setting
            .value
            .trim()
            .parse::<f64>()
            .map_err(|_| SettingsError::Parse {
                key: key.to_string(),
                value: setting.value.clone(),
                expected: "float",
            })?;
        Self::check_numeric_constraints(&setting, value)?;
        Ok(Some(value))
    }

    /// Boolean setting: accepts true/false/1/0/yes/no.
    pub async fn get_bool(&self, env: &EnvId, key: &str) -> Result<Option<bool>> {
        let Some(setting) = self.get(env, key).await? else {
            return Ok(None);
        };
        match setting.value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(SettingsError::Parse {
                key: key.to_string(),
                value: setting.value.clone(),
                expected: "boolean",
            }),
        }
    }

    pub async fn get_string(&self, env: &EnvId, key: &str) -> Result<Option<String>> {
        let Some(setting) = self.get(env, key).await? else {
            return Ok(None);
        };
        Self::check_enum_constraint(&setting)?;
        Ok(Some(setting.value))
    }

    /// JSON setting parsed to a value tree.
    pub async fn get_json(&self, env: &EnvId, key: &str) -> Result<Option<serde_json::Value>> {
        let Some(setting) = self.get(env, key).await? else {
            return Ok(None);
        };
        let parsed =
            serde_json::from_str(&setting.value).map_err(|_| SettingsError::Parse {
                key: key.to_string(),
                value: setting.value.clone(),
                expected: "json",
            })?;
        Ok(Some(parsed))
    }
}

/// Typed, defaulted view over settings used by the engine and detectors.
///
/// Reads are uncached: the detector runner takes its consistent snapshot by
/// resolving everything it needs up front, before executing a detector.
#[derive(Clone)]
pub struct ConfigResolver {
    store: SettingsStore,
}

impl ConfigResolver {
    pub fn new(store: SettingsStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Target rows per batch for the planner.
    pub async fn batch_size(&self, env: &EnvId) -> Result<u64> {
        Ok(self
            .store
            .get_i64(env, keys::COMPASS_BATCH_SIZE)
            .await?
            .map(|v| v.max(1) as u64)
            .unwrap_or(defaults::DEFAULT_BATCH_SIZE))
    }

    /// Rows per upstream result page, capped at the upstream limit.
    pub async fn page_size(&self, env: &EnvId) -> Result<u32> {
        let size = self
            .store
            .get_i64(env, keys::COMPASS_PAGE_SIZE)
            .await?
            .map(|v| v.max(1) as u32)
            .unwrap_or(defaults::DEFAULT_PAGE_SIZE);
        Ok(size.min(defaults::MAX_PAGE_SIZE))
    }

    /// Token-bucket parameters (requests per second, burst size).
    pub async fn throttle(&self, env: &EnvId) -> Result<(f64, u32)> {
        let rps = self
            .store
            .get_f64(env, keys::API_THROTTLE_REQUESTS_PER_SECOND)
            .await?
            .unwrap_or(defaults::DEFAULT_THROTTLE_RPS);
        let burst = self
            .store
            .get_i64(env, keys::API_THROTTLE_BURST_SIZE)
            .await?
            .map(|v| v.max(1) as u32)
            .unwrap_or(defaults::DEFAULT_THROTTLE_BURST);
        Ok((rps.max(0.1), burst))
    }

    pub async fn detector_parallelism(&self, env: &EnvId) -> Result<u32> {
        Ok(self
            .store
            .get_i64(env, keys::DETECTOR_PARALLELISM)
            .await?
            .map(|v| v.clamp(1, 64) as u32)
            .unwrap_or(defaults::DEFAULT_DETECTOR_PARALLELISM))
    }

    /// Per-detector enable toggle; detectors default on.
    pub async fn is_detector_enabled(&self, env: &EnvId, detector: &str) -> Result<bool> {
        Ok(self
            .store
            .get_bool(env, &keys::detector_enabled_key(detector))
            .await?
            .unwrap_or(true))
    }

    /// Resolve a hierarchical JSON threshold for a concrete scope.
    ///
    /// Returns the most-specific matching override value, the global value
    /// when nothing matches, or None when the setting is absent. A
    /// plain (non-hierarchical) JSON value resolves to itself.
    pub async fn resolve_hierarchical(
        &self,
        env: &EnvId,
        key: &str,
        scope: &ThresholdScope,
    ) -> Result<Option<serde_json::Value>> {
        let Some(raw) = self.store.get_json(env, key).await? else {
            return Ok(None);
        };

        let threshold: HierarchicalThreshold = match serde_json::from_value(raw.clone()) {
            Ok(t) => t,
            // Not shaped hierarchically - treat the whole value as global
            Err(_) => return Ok(Some(raw)),
        };

        let mut best: Option<(u32, &ThresholdOverride)> = None;
        for override_ in &threshold.overrides {
            if !override_.scope.matches(scope) {
                continue;
            }
            let specificity = override_.scope.specificity();
            // Strictly-greater keeps the first declaration on ties
            if best.map(|(s, _)| specificity > s).unwrap_or(true) {
                best = Some((specificity, override_));
            }
        }

        Ok(Some(match best {
            Some((_, o)) => o.value.clone(),
            None => threshold.global,
        }))
    }

    /// Numeric convenience over [`Self::resolve_hierarchical`].
    pub async fn resolve_hierarchical_f64(
        &self,
        env: &EnvId,
        key: &str,
        scope: &ThresholdScope,
        default: f64,
    ) -> Result<f64> {
        match self.resolve_hierarchical(env, key, scope).await {
            Ok(Some(value)) => Ok(value.as_f64().unwrap_or(default)),
            Ok(None) => Ok(default),
            Err(e) => {
                // Threshold resolution must not silently change detector
                // semantics; surface the config error.
                warn!(key, error = %e, "hierarchical threshold resolution failed");
                Err(e)
            }
        }
    }
}
