use crate::errors::{AppError, AppResult};
use serde_json::{Map, Value};
use std::path::PathBuf;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DB_FILE: &str = "tracker.db";
const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Process-level settings resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub admin_username: String,
    pub admin_password: Option<String>,
}

impl BootstrapConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = non_empty(lookup("AGENCY_TRACKER_DATA_DIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let db_path = non_empty(lookup("AGENCY_TRACKER_DB"))
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join(DEFAULT_DB_FILE));

        Self {
            data_dir,
            db_path,
            admin_username: non_empty(lookup("ADMIN_USERNAME"))
                .unwrap_or_else(|| DEFAULT_ADMIN_USERNAME.to_string()),
            admin_password: non_empty(lookup("ADMIN_PASSWORD")),
        }
    }
}

#[derive(Clone, Copy)]
enum OverrideKind {
    Integer,
    Float,
}

const SETTING_OVERRIDES: [(&str, &str, OverrideKind); 11] = [
    ("MAX_FAILED_ATTEMPTS", "maxFailedAttempts", OverrideKind::Integer),
    ("LOCKOUT_DURATION_MINUTES", "lockoutDurationMinutes", OverrideKind::Integer),
    ("REQUIRED_SECURITY_COUNTRIES", "requiredSecurityCountries", OverrideKind::Integer),
    (
        "MIN_CORRECT_COUNTRIES_FOR_RECOVERY",
        "minCorrectCountriesForRecovery",
        OverrideKind::Integer,
    ),
    ("THRESHOLD_GREEN", "thresholdGreen", OverrideKind::Float),
    ("THRESHOLD_YELLOW", "thresholdYellow", OverrideKind::Float),
    ("SESSION_TTL_MINUTES", "sessionTtlMinutes", OverrideKind::Integer),
    ("RECOVERY_GRANT_TTL_MINUTES", "recoveryGrantTtlMinutes", OverrideKind::Integer),
    ("MIN_PASSWORD_LENGTH", "minPasswordLength", OverrideKind::Integer),
    ("SETUP_CANDIDATE_COUNT", "setupCandidateCount", OverrideKind::Integer),
    ("RECOVERY_CANDIDATE_COUNT", "recoveryCandidateCount", OverrideKind::Integer),
];

/// Builds a settings patch from environment-style variables. Unset variables are left out so stored
/// values survive.
pub fn settings_overrides(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Value> {
    let mut patch = Map::new();
    for (variable, key, kind) in SETTING_OVERRIDES {
        let Some(raw) = non_empty(lookup(variable)) else {
            continue;
        };
        let value = match kind {
            OverrideKind::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid_override(variable, &raw))?,
            OverrideKind::Float => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Value::from)
                .ok_or_else(|| invalid_override(variable, &raw))?,
        };
        patch.insert(key.to_string(), value);
    }
    Ok(Value::Object(patch))
}

fn invalid_override(variable: &str, raw: &str) -> AppError {
    AppError::Validation(format!("{} has invalid value '{}'", variable, raw))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
