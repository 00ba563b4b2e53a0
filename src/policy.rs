use crate::errors::{AppError, AppResult};
use crate::models::{Period, Role, TrackerSettings, UserRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const MIN_YEAR: i32 = 2020;
const MAX_YEAR: i32 = 2100;
const MAX_ACTION_TITLE_LEN: usize = 500;
const MAX_AGENCY_NAME_LEN: usize = 200;
/// One year.
const MAX_DURATION_MINUTES: i64 = 525_600;

static USERNAME_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{3,100}$").ok());

/// Input and permission checks shared by every tracker operation.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn require_admin(&self, user: &UserRecord) -> AppResult<()> {
        match user.role {
            Role::Admin => Ok(()),
            Role::Normal => Err(AppError::AccessDenied("Admin role required".to_string())),
        }
    }

    pub fn require_active(&self, user: &UserRecord) -> AppResult<()> {
        if user.active {
            Ok(())
        } else {
            Err(AppError::AccessDenied("User is inactive".to_string()))
        }
    }

    pub fn validate_period(&self, year: i32, month: u32) -> AppResult<Period> {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(AppError::Validation(format!(
                "Year {} is out of allowed range ({}..={})",
                year, MIN_YEAR, MAX_YEAR
            )));
        }
        if !(1..=12).contains(&month) {
            return Err(AppError::Validation(format!(
                "Month {} is out of allowed range (1..=12)",
                month
            )));
        }
        Ok(Period { year, month })
    }

    pub fn validate_username(&self, username: &str) -> AppResult<()> {
        let matches = USERNAME_PATTERN
            .as_ref()
            .map(|pattern| pattern.is_match(username))
            .unwrap_or(false);
        if !matches {
            return Err(AppError::Validation(
                "Username must be 3-100 characters of letters, digits, '.', '_' or '-'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_password(&self, password: &str, settings: &TrackerSettings) -> AppResult<()> {
        if password.chars().count() < settings.min_password_length {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters",
                settings.min_password_length
            )));
        }
        Ok(())
    }

    pub fn validate_agency_name(&self, name: &str) -> AppResult<String> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Agency name cannot be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_AGENCY_NAME_LEN {
            return Err(AppError::Validation(format!(
                "Agency name exceeds {} characters",
                MAX_AGENCY_NAME_LEN
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn validate_manager_name(&self, full_name: &str) -> AppResult<String> {
        let trimmed = full_name.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Manager name cannot be empty".to_string()));
        }
        Ok(trimmed.to_string())
    }

    pub fn validate_action_title(&self, title: &str) -> AppResult<String> {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Action title cannot be empty".to_string()));
        }
        if trimmed.chars().count() > MAX_ACTION_TITLE_LEN {
            return Err(AppError::Validation(format!(
                "Action title exceeds {} characters",
                MAX_ACTION_TITLE_LEN
            )));
        }
        Ok(trimmed.to_string())
    }

    pub fn validate_kpi_values(&self, values: &BTreeMap<i64, f64>) -> AppResult<()> {
        for (kpi_id, value) in values {
            if !value.is_finite() {
                return Err(AppError::Validation(format!(
                    "Value for KPI {} must be a finite number",
                    kpi_id
                )));
            }
        }
        Ok(())
    }

    pub fn validate_settings(&self, settings: &TrackerSettings) -> AppResult<()> {
        if settings.threshold_yellow > settings.threshold_green {
            return Err(AppError::Validation(format!(
                "thresholdYellow {} cannot exceed thresholdGreen {}",
                settings.threshold_yellow, settings.threshold_green
            )));
        }
        if settings.required_security_countries == 0 {
            return Err(AppError::Validation(
                "requiredSecurityCountries must be at least 1".to_string(),
            ));
        }
        if settings.min_correct_countries_for_recovery == 0
            || settings.min_correct_countries_for_recovery > settings.required_security_countries
        {
            return Err(AppError::Validation(format!(
                "minCorrectCountriesForRecovery must be between 1 and {}",
                settings.required_security_countries
            )));
        }
        if settings.recovery_candidate_count < settings.required_security_countries {
            return Err(AppError::Validation(
                "recoveryCandidateCount must cover every configured country".to_string(),
            ));
        }
        if settings.setup_candidate_count < settings.required_security_countries {
            return Err(AppError::Validation(
                "setupCandidateCount must be at least requiredSecurityCountries".to_string(),
            ));
        }
        if settings.max_failed_attempts == 0 {
            return Err(AppError::Validation("maxFailedAttempts must be at least 1".to_string()));
        }
        let durations = [
            ("lockoutDurationMinutes", settings.lockout_duration_minutes),
            ("sessionTtlMinutes", settings.session_ttl_minutes),
            ("recoveryGrantTtlMinutes", settings.recovery_grant_ttl_minutes),
        ];
        for (name, minutes) in durations {
            if !(1..=MAX_DURATION_MINUTES).contains(&minutes) {
                return Err(AppError::Validation(format!(
                    "{} must be between 1 and {} minutes",
                    name, MAX_DURATION_MINUTES
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::PolicyEngine;
    use crate::errors::AppError;
    use crate::models::{Role, TrackerSettings, UserRecord};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn user(role: Role, active: bool) -> UserRecord {
        UserRecord {
            id: 1,
            username: "ana".to_string(),
            password_hash: String::new(),
            role,
            active,
            created_at: Utc::now(),
            failed_attempts: 0,
            locked_until: None,
            onboarding_completed: false,
            last_login_at: None,
        }
    }

    #[test]
    fn only_admins_pass_the_admin_gate() {
        let engine = PolicyEngine::new();
        assert!(engine.require_admin(&user(Role::Admin, true)).is_ok());
        assert!(matches!(
            engine.require_admin(&user(Role::Normal, true)),
            Err(AppError::AccessDenied(_))
        ));
        assert!(engine.require_active(&user(Role::Admin, false)).is_err());
    }

    #[test]
    fn period_bounds_are_enforced() {
        let engine = PolicyEngine::new();
        assert!(engine.validate_period(2026, 1).is_ok());
        assert!(engine.validate_period(2100, 12).is_ok());
        assert!(engine.validate_period(2019, 6).is_err());
        assert!(engine.validate_period(2101, 6).is_err());
        assert!(engine.validate_period(2026, 0).is_err());
        assert!(engine.validate_period(2026, 13).is_err());
    }

    #[test]
    fn usernames_and_titles_are_checked() {
        let engine = PolicyEngine::new();
        assert!(engine.validate_username("maria.lopez").is_ok());
        assert!(engine.validate_username("ab").is_err());
        assert!(engine.validate_username("bad name").is_err());

        assert_eq!(
            engine.validate_action_title("  Call the bank  ").expect("title"),
            "Call the bank"
        );
        assert!(engine.validate_action_title("   ").is_err());
    }

    #[test]
    fn passwords_respect_configured_minimum() {
        let engine = PolicyEngine::new();
        let settings = TrackerSettings::default();
        assert!(engine.validate_password("abcd", &settings).is_ok());
        assert!(engine.validate_password("abc", &settings).is_err());
    }

    #[test]
    fn non_finite_kpi_values_are_rejected() {
        let engine = PolicyEngine::new();
        let mut values = BTreeMap::new();
        values.insert(1, 10.0);
        assert!(engine.validate_kpi_values(&values).is_ok());
        values.insert(2, f64::NAN);
        assert!(engine.validate_kpi_values(&values).is_err());
    }

    #[test]
    fn inconsistent_settings_are_rejected() {
        let engine = PolicyEngine::new();
        assert!(engine.validate_settings(&TrackerSettings::default()).is_ok());

        let inverted = TrackerSettings {
            threshold_yellow: 110.0,
            ..TrackerSettings::default()
        };
        assert!(engine.validate_settings(&inverted).is_err());

        let impossible_recovery = TrackerSettings {
            min_correct_countries_for_recovery: 6,
            ..TrackerSettings::default()
        };
        assert!(engine.validate_settings(&impossible_recovery).is_err());
    }

    #[test]
    fn durations_are_bounded_to_a_year() {
        let engine = PolicyEngine::new();
        let year = TrackerSettings {
            lockout_duration_minutes: 525_600,
            ..TrackerSettings::default()
        };
        assert!(engine.validate_settings(&year).is_ok());

        let oversized = [
            TrackerSettings {
                lockout_duration_minutes: 10_000_000_000_000,
                ..TrackerSettings::default()
            },
            TrackerSettings {
                session_ttl_minutes: 525_601,
                ..TrackerSettings::default()
            },
            TrackerSettings {
                recovery_grant_ttl_minutes: i64::MAX,
                ..TrackerSettings::default()
            },
            TrackerSettings {
                session_ttl_minutes: 0,
                ..TrackerSettings::default()
            },
        ];
        for settings in oversized {
            assert!(matches!(
                engine.validate_settings(&settings),
                Err(AppError::Validation(_))
            ));
        }
    }
}
