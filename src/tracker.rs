use crate::credentials::{hash_password, verify_password};
use crate::dashboard::DashboardBuilder;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::kpi_status::StatusThresholds;
use crate::lockout::{minutes_setting, Clock, LockoutPolicy, SystemClock};
use crate::models::{
    ActionItem, AdminDashboard, AgencyDashboard, AgencyDetail, AgencyListItem, AgencyManager, AgencyRecord,
    Country, CreateActionItemPayload, CreateAgencyPayload, CreateUserPayload, CurrentUser, Kpi, KpiSummaryRow,
    LoginResponse, ManagerPayload, MonthlyResult, MonthlyReview, NormalDashboard, OnboardingChecklist, Period,
    RecoveryGrant, ReviewCompleteness, Role, SaveResultsPayload, SaveReviewPayload, SaveTargetsPayload,
    SummaryDashboard, TrackerSettings, UpdateUserPayload, UserRecord, UserSummary,
};
use crate::policy::PolicyEngine;
use crate::security_countries::{
    build_recovery_challenge, partition_by_region, select_setup_candidates, validate_selection, verify_selection,
    SetupState,
};
use crate::session::{SessionKind, SessionManager};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DB_FILE_NAME: &str = "tracker.db";

/// Entry point for every tracker operation. Authenticated calls take the session token explicitly.
pub struct TrackerCore {
    db: Arc<Database>,
    policy: PolicyEngine,
    sessions: SessionManager,
    clock: Arc<dyn Clock>,
}

impl TrackerCore {
    pub fn new(data_dir: PathBuf) -> AppResult<Arc<Self>> {
        Self::open(&data_dir.join(DB_FILE_NAME), Arc::new(SystemClock))
    }

    pub fn open(db_path: &Path, clock: Arc<dyn Clock>) -> AppResult<Arc<Self>> {
        let db = Arc::new(Database::new(db_path)?);
        tracing::info!(path = %db.path().display(), "tracker database ready");
        Ok(Arc::new(Self {
            db,
            policy: PolicyEngine::new(),
            sessions: SessionManager::new(),
            clock,
        }))
    }

    fn settings(&self) -> AppResult<TrackerSettings> {
        self.db.get_settings()
    }

    /// Creates the configured admin account when it does not exist yet.
    pub fn ensure_admin(&self, username: &str, password: Option<&str>) -> AppResult<Option<UserRecord>> {
        if self.db.get_user_by_username(username)?.is_some() {
            return Ok(None);
        }
        let Some(password) = password else {
            tracing::warn!(username = %username, "admin account missing and no ADMIN_PASSWORD configured; skipping");
            return Ok(None);
        };

        let settings = self.settings()?;
        self.policy.validate_username(username)?;
        self.policy.validate_password(password, &settings)?;
        let user = self.db.insert_user(username, &hash_password(password)?, Role::Admin)?;
        tracing::info!(user_id = user.id, username = %username, "created bootstrap admin");
        Ok(Some(user))
    }

    /// Startup-time settings patch, e.g. from environment overrides. Validated like any update.
    pub fn apply_settings_patch(&self, patch: serde_json::Value) -> AppResult<TrackerSettings> {
        let settings = self.db.merged_settings(patch)?;
        self.policy.validate_settings(&settings)?;
        self.db.save_settings(&settings)?;
        Ok(settings)
    }

    pub async fn get_settings(&self, token: &str) -> AppResult<TrackerSettings> {
        self.authorize_admin(token).await?;
        self.settings()
    }

    pub async fn update_settings(&self, token: &str, patch: serde_json::Value) -> AppResult<TrackerSettings> {
        let admin = self.authorize_admin(token).await?;
        let settings = self.apply_settings_patch(patch)?;
        tracing::info!(user_id = admin.id, "tracker settings updated");
        Ok(settings)
    }

    pub async fn login(&self, username: &str, password: &str) -> AppResult<LoginResponse> {
        let now = self.clock.now();
        let settings = self.settings()?;
        let lockout = LockoutPolicy::from_settings(&settings)?;

        let Some(user) = self.db.get_user_by_username(username)? else {
            tracing::info!(username = %username, "login for unknown user");
            return Err(AppError::Unauthorized("Invalid username or password".to_string()));
        };
        if !user.active {
            return Err(AppError::AccessDenied("Account is deactivated".to_string()));
        }
        lockout.ensure_unlocked(user.locked_until, now)?;

        if !verify_password(password, &user.password_hash)? {
            return Err(self.register_failure(&user, &lockout, "Invalid username or password")?);
        }

        self.db.record_login_success(user.id, now)?;
        let session = self
            .sessions
            .open_session(
                user.id,
                SessionKind::Access,
                minutes_setting(settings.session_ttl_minutes, "sessionTtlMinutes")?,
                now,
            )
            .await?;
        tracing::info!(user_id = user.id, "login succeeded");

        Ok(LoginResponse {
            token: session.token,
            expires_at: session.expires_at,
            user: self.describe_user(&user, &settings)?,
        })
    }

    pub async fn logout(&self, token: &str) {
        self.sessions.close_session(token).await;
    }

    pub async fn current_user(&self, token: &str) -> AppResult<CurrentUser> {
        let user = self.authenticate(token).await?;
        self.describe_user(&user, &self.settings()?)
    }

    pub async fn user_can_access_agency(&self, token: &str, agency_id: i64) -> AppResult<bool> {
        let user = self.authenticate(token).await?;
        self.can_access(&user, agency_id)
    }

    pub async fn security_setup_candidates(&self, token: &str) -> AppResult<Vec<Country>> {
        self.authenticate(token).await?;
        let settings = self.settings()?;
        let (africa, latam) = partition_by_region(self.db.list_active_countries()?);
        Ok(select_setup_candidates(
            africa,
            latam,
            settings.setup_candidate_count,
            &mut rand::rng(),
        ))
    }

    pub async fn assign_security_countries(&self, token: &str, country_ids: &[i64]) -> AppResult<()> {
        let user = self.authenticate(token).await?;
        let settings = self.settings()?;
        validate_selection(country_ids, settings.required_security_countries)?;
        self.db.replace_security_countries(user.id, country_ids)?;
        tracing::info!(user_id = user.id, "security countries configured");
        Ok(())
    }

    /// Every correct country mixed with decoys. Fails for locked accounts and unconfigured users.
    pub async fn recovery_challenge(&self, username: &str) -> AppResult<Vec<Country>> {
        let settings = self.settings()?;
        let user = self.recoverable_user(username, &settings)?;
        let correct = self.db.security_country_ids(user.id)?;
        Ok(build_recovery_challenge(
            self.db.list_active_countries()?,
            &correct,
            settings.recovery_candidate_count,
            &mut rand::rng(),
        ))
    }

    /// Checks a recovery selection. Failures count toward the same lockout as login.
    pub async fn verify_recovery(&self, username: &str, selected: &[i64]) -> AppResult<RecoveryGrant> {
        let now = self.clock.now();
        let settings = self.settings()?;
        let lockout = LockoutPolicy::from_settings(&settings)?;
        let user = self.recoverable_user(username, &settings)?;

        let correct = self.db.security_country_ids(user.id)?;
        if !verify_selection(&correct, selected, settings.min_correct_countries_for_recovery) {
            return Err(self.register_failure(&user, &lockout, "Security countries do not match")?);
        }

        self.db.reset_lockout(user.id)?;
        let grant = self
            .sessions
            .open_session(
                user.id,
                SessionKind::Recovery,
                minutes_setting(settings.recovery_grant_ttl_minutes, "recoveryGrantTtlMinutes")?,
                now,
            )
            .await?;
        tracing::info!(user_id = user.id, "recovery verification succeeded");

        Ok(RecoveryGrant {
            token: grant.token,
            expires_at: grant.expires_at,
        })
    }

    /// Consumes a recovery grant. Existing sessions of the user are dropped.
    pub async fn reset_password(&self, grant_token: &str, new_password: &str) -> AppResult<()> {
        let settings = self.settings()?;
        self.policy.validate_password(new_password, &settings)?;

        let grant = self
            .sessions
            .take(grant_token, SessionKind::Recovery, self.clock.now())
            .await?;
        self.db.update_password(grant.user_id, &hash_password(new_password)?)?;
        self.sessions.close_user_sessions(grant.user_id).await;
        tracing::info!(user_id = grant.user_id, "password reset through recovery");
        Ok(())
    }

    pub async fn create_user(&self, token: &str, payload: CreateUserPayload) -> AppResult<UserSummary> {
        let admin = self.authorize_admin(token).await?;
        let settings = self.settings()?;
        let username = payload.username.trim();
        self.policy.validate_username(username)?;
        self.policy.validate_password(&payload.password, &settings)?;

        let user = self
            .db
            .insert_user(username, &hash_password(&payload.password)?, payload.role)?;
        tracing::info!(user_id = user.id, created_by = admin.id, role = user.role.as_str(), "user created");
        self.summarize_user(user, &settings)
    }

    pub async fn list_users(&self, token: &str) -> AppResult<Vec<UserSummary>> {
        self.authorize_admin(token).await?;
        let settings = self.settings()?;
        self.db
            .list_users()?
            .into_iter()
            .map(|user| self.summarize_user(user, &settings))
            .collect()
    }

    pub async fn update_user(&self, token: &str, user_id: i64, payload: UpdateUserPayload) -> AppResult<UserSummary> {
        self.authorize_admin(token).await?;
        self.require_user(user_id)?;

        if let Some(role) = payload.role {
            self.db.set_user_role(user_id, role)?;
        }
        if let Some(active) = payload.active {
            self.db.set_user_active(user_id, active)?;
            if !active {
                self.sessions.close_user_sessions(user_id).await;
            }
        }

        self.summarize_user(self.require_user(user_id)?, &self.settings()?)
    }

    pub async fn set_user_agencies(&self, token: &str, user_id: i64, agency_ids: &[i64]) -> AppResult<Vec<i64>> {
        self.authorize_admin(token).await?;
        self.require_user(user_id)?;
        self.db.set_user_agencies(user_id, agency_ids)?;
        self.db.assigned_agency_ids(user_id)
    }

    pub async fn user_agencies(&self, token: &str, user_id: i64) -> AppResult<Vec<i64>> {
        self.authorize_admin(token).await?;
        self.require_user(user_id)?;
        self.db.assigned_agency_ids(user_id)
    }

    pub async fn unlock_user(&self, token: &str, user_id: i64) -> AppResult<()> {
        let admin = self.authorize_admin(token).await?;
        self.db.reset_lockout(user_id)?;
        tracing::info!(user_id, unlocked_by = admin.id, "account unlocked");
        Ok(())
    }

    /// Drops a user's security countries so they configure a fresh set at next login.
    pub async fn clear_security_countries(&self, token: &str, user_id: i64) -> AppResult<()> {
        let admin = self.authorize_admin(token).await?;
        self.require_user(user_id)?;
        let removed = self.db.clear_security_countries(user_id)?;
        tracing::info!(user_id, cleared_by = admin.id, removed, "security countries cleared");
        Ok(())
    }

    pub async fn create_agency(&self, token: &str, payload: CreateAgencyPayload) -> AppResult<AgencyDetail> {
        let admin = self.authorize_admin(token).await?;
        let name = self.policy.validate_agency_name(&payload.name)?;
        let manager = ManagerPayload {
            full_name: self.policy.validate_manager_name(&payload.manager.full_name)?,
            ..payload.manager
        };
        self.ensure_known_kpis(&payload.kpi_ids)?;

        let city = payload.city.as_deref().map(str::trim).filter(|city| !city.is_empty());
        let agency = self
            .db
            .insert_agency(&name, city, &manager, &payload.kpi_ids, self.today())?;
        tracing::info!(agency_id = agency.id, created_by = admin.id, "agency created");
        self.detail_of(agency)
    }

    pub async fn list_agencies(&self, token: &str, active_only: bool) -> AppResult<Vec<AgencyListItem>> {
        let user = self.authenticate(token).await?;
        let visible: Option<BTreeSet<i64>> = match user.role {
            Role::Admin => None,
            Role::Normal => Some(self.db.assigned_agency_ids(user.id)?.into_iter().collect()),
        };

        let mut result = Vec::new();
        for agency in self.db.list_agencies(active_only)? {
            if visible.as_ref().is_some_and(|ids| !ids.contains(&agency.id)) {
                continue;
            }
            result.push(AgencyListItem {
                manager: self.db.active_manager(agency.id)?,
                kpis: self.db.agency_kpis(agency.id)?,
                agency,
            });
        }
        Ok(result)
    }

    pub async fn agency_detail(&self, token: &str, agency_id: i64) -> AppResult<AgencyDetail> {
        let user = self.authenticate(token).await?;
        let agency = self.ensure_agency_access(&user, agency_id)?;
        self.detail_of(agency)
    }

    pub async fn set_agency_active(&self, token: &str, agency_id: i64, active: bool) -> AppResult<()> {
        let admin = self.authorize_admin(token).await?;
        self.db.set_agency_active(agency_id, active)?;
        tracing::info!(agency_id, active, changed_by = admin.id, "agency status changed");
        Ok(())
    }

    pub async fn update_agency_kpis(&self, token: &str, agency_id: i64, kpi_ids: &[i64]) -> AppResult<Vec<Kpi>> {
        self.authorize_admin(token).await?;
        self.require_agency(agency_id)?;
        self.ensure_known_kpis(kpi_ids)?;
        self.db.update_agency_kpis(agency_id, kpi_ids)?;
        self.db.agency_kpis(agency_id)
    }

    pub async fn agency_kpis(&self, token: &str, agency_id: i64) -> AppResult<Vec<Kpi>> {
        let user = self.authenticate(token).await?;
        self.ensure_agency_access(&user, agency_id)?;
        self.db.agency_kpis(agency_id)
    }

    pub async fn replace_manager(
        &self,
        token: &str,
        agency_id: i64,
        manager: ManagerPayload,
    ) -> AppResult<AgencyManager> {
        let admin = self.authorize_admin(token).await?;
        self.require_agency(agency_id)?;
        let manager = ManagerPayload {
            full_name: self.policy.validate_manager_name(&manager.full_name)?,
            ..manager
        };
        let created = self.db.replace_manager(agency_id, &manager, self.today())?;
        tracing::info!(agency_id, manager_id = created.id, changed_by = admin.id, "agency manager replaced");
        Ok(created)
    }

    pub async fn list_kpis(&self, token: &str, active_only: bool) -> AppResult<Vec<Kpi>> {
        self.authenticate(token).await?;
        self.db.list_kpis(active_only)
    }

    pub async fn list_countries(&self, token: &str) -> AppResult<Vec<Country>> {
        self.authenticate(token).await?;
        self.db.list_active_countries()
    }

    /// Inactive countries are left out of setup pools and recovery challenges.
    pub async fn set_country_active(&self, token: &str, country_id: i64, active: bool) -> AppResult<()> {
        let admin = self.authorize_admin(token).await?;
        self.db.set_country_active(country_id, active)?;
        tracing::info!(country_id, active, changed_by = admin.id, "country status changed");
        Ok(())
    }

    pub async fn save_targets(&self, token: &str, payload: SaveTargetsPayload) -> AppResult<BTreeMap<i64, f64>> {
        let (_, period) = self.tracking_scope(token, payload.agency_id, payload.year, payload.month).await?;
        self.policy.validate_kpi_values(&payload.targets)?;
        self.ensure_known_kpis(&payload.targets.keys().copied().collect::<Vec<_>>())?;
        self.db.upsert_targets(payload.agency_id, period, &payload.targets)?;
        self.db.monthly_targets(payload.agency_id, period)
    }

    pub async fn get_targets(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<BTreeMap<i64, f64>> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.db.monthly_targets(agency_id, period)
    }

    pub async fn copy_targets_to_all_months(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<usize> {
        let (user, period) = self.tracking_scope(token, agency_id, year, month).await?;
        let months = self.db.copy_targets_to_all_months(agency_id, period.year, period.month)?;
        tracing::info!(agency_id, year, source_month = month, months, user_id = user.id, "targets copied to year");
        Ok(months)
    }

    pub async fn copy_targets_to_next_month(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<Period> {
        let (user, period) = self.tracking_scope(token, agency_id, year, month).await?;
        let destination = self.db.copy_targets_to_next_month(agency_id, period)?;
        tracing::info!(
            agency_id,
            year = destination.year,
            month = destination.month,
            user_id = user.id,
            "targets copied to next month"
        );
        Ok(destination)
    }

    pub async fn save_results(&self, token: &str, payload: SaveResultsPayload) -> AppResult<Vec<MonthlyResult>> {
        let (user, period) = self.tracking_scope(token, payload.agency_id, payload.year, payload.month).await?;
        self.policy.validate_kpi_values(&payload.results)?;
        self.ensure_known_kpis(&payload.results.keys().copied().collect::<Vec<_>>())?;
        self.db
            .upsert_results(payload.agency_id, period, &payload.results, &user.username)?;
        self.db.result_entries(payload.agency_id, period)
    }

    pub async fn get_results(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<Vec<MonthlyResult>> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.db.result_entries(agency_id, period)
    }

    pub async fn monthly_summary(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<Vec<KpiSummaryRow>> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.dashboards()?.monthly_summary(agency_id, period)
    }

    pub async fn save_review(&self, token: &str, payload: SaveReviewPayload) -> AppResult<MonthlyReview> {
        let (_, period) = self.tracking_scope(token, payload.agency_id, payload.year, payload.month).await?;
        self.db.upsert_review(
            payload.agency_id,
            period,
            payload.review_date,
            payload.what_happened.as_deref(),
            payload.improvement_plan.as_deref(),
            self.today(),
        )
    }

    pub async fn get_review(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<Option<MonthlyReview>> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.db.monthly_review(agency_id, period)
    }

    pub async fn add_action_item(&self, token: &str, payload: CreateActionItemPayload) -> AppResult<ActionItem> {
        let (_, period) = self.tracking_scope(token, payload.agency_id, payload.year, payload.month).await?;
        let title = self.policy.validate_action_title(&payload.title)?;
        self.db.insert_action_item(payload.agency_id, period, &title)
    }

    pub async fn list_action_items(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<Vec<ActionItem>> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.db.action_items(agency_id, period)
    }

    pub async fn set_action_item_done(&self, token: &str, item_id: i64, done: bool) -> AppResult<ActionItem> {
        let user = self.authenticate(token).await?;
        let item = self.require_action_item(item_id)?;
        self.ensure_agency_access(&user, item.agency_id)?;
        self.db.set_action_item_done(item_id, done, self.clock.now())
    }

    pub async fn delete_action_item(&self, token: &str, item_id: i64) -> AppResult<()> {
        let user = self.authenticate(token).await?;
        let item = self.require_action_item(item_id)?;
        self.ensure_agency_access(&user, item.agency_id)?;
        self.db.delete_action_item(item_id)
    }

    pub async fn agency_dashboard(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<AgencyDashboard> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.dashboards()?.agency_dashboard(agency_id, period)
    }

    pub async fn admin_dashboard(&self, token: &str, year: i32, month: u32) -> AppResult<AdminDashboard> {
        self.authorize_admin(token).await?;
        let period = self.policy.validate_period(year, month)?;
        self.dashboards()?.admin_dashboard(period)
    }

    pub async fn summary_dashboard(&self, token: &str, year: i32, month: u32) -> AppResult<SummaryDashboard> {
        let user = self.authenticate(token).await?;
        let period = self.policy.validate_period(year, month)?;
        let agencies = self.db.accessible_agencies(&user)?;
        self.dashboards()?.summary_dashboard(period, &agencies)
    }

    pub async fn normal_dashboard(
        &self,
        token: &str,
        year: i32,
        month: u32,
        agency_id: Option<i64>,
    ) -> AppResult<NormalDashboard> {
        let user = self.authenticate(token).await?;
        let period = self.policy.validate_period(year, month)?;
        self.dashboards()?.normal_dashboard(&user, period, agency_id)
    }

    pub async fn review_completeness(
        &self,
        token: &str,
        agency_id: i64,
        year: i32,
        month: u32,
    ) -> AppResult<ReviewCompleteness> {
        let (_, period) = self.tracking_scope(token, agency_id, year, month).await?;
        self.dashboards()?.review_completeness(agency_id, period)
    }

    pub async fn onboarding_checklist(&self, token: &str, year: i32, month: u32) -> AppResult<OnboardingChecklist> {
        let user = self.authenticate(token).await?;
        let period = self.policy.validate_period(year, month)?;
        let agencies = self.db.accessible_agencies(&user)?;
        self.dashboards()?.onboarding_checklist(agencies.first(), period)
    }

    pub async fn complete_onboarding(&self, token: &str) -> AppResult<()> {
        let user = self.authenticate(token).await?;
        self.db.set_onboarding_completed(user.id)
    }

    async fn authenticate(&self, token: &str) -> AppResult<UserRecord> {
        let session = self
            .sessions
            .resolve(token, SessionKind::Access, self.clock.now())
            .await?;
        let Some(user) = self.db.get_user(session.user_id)? else {
            self.sessions.close_session(token).await;
            return Err(AppError::Unauthorized("User not found".to_string()));
        };
        if let Err(error) = self.policy.require_active(&user) {
            self.sessions.close_user_sessions(user.id).await;
            return Err(error);
        }
        Ok(user)
    }

    async fn authorize_admin(&self, token: &str) -> AppResult<UserRecord> {
        let user = self.authenticate(token).await?;
        self.policy.require_admin(&user)?;
        Ok(user)
    }

    async fn tracking_scope(&self, token: &str, agency_id: i64, year: i32, month: u32) -> AppResult<(UserRecord, Period)> {
        let user = self.authenticate(token).await?;
        self.ensure_agency_access(&user, agency_id)?;
        let period = self.policy.validate_period(year, month)?;
        Ok((user, period))
    }

    fn can_access(&self, user: &UserRecord, agency_id: i64) -> AppResult<bool> {
        match user.role {
            Role::Admin => Ok(true),
            Role::Normal => self.db.has_agency_assignment(user.id, agency_id),
        }
    }

    /// Assignment is checked before existence so unassigned users learn nothing about other agencies.
    fn ensure_agency_access(&self, user: &UserRecord, agency_id: i64) -> AppResult<AgencyRecord> {
        if !self.can_access(user, agency_id)? {
            return Err(AppError::AccessDenied(format!("No access to agency {}", agency_id)));
        }
        self.require_agency(agency_id)
    }

    fn require_agency(&self, agency_id: i64) -> AppResult<AgencyRecord> {
        self.db
            .get_agency(agency_id)?
            .ok_or_else(|| AppError::NotFound(format!("Agency {} not found", agency_id)))
    }

    fn require_user(&self, user_id: i64) -> AppResult<UserRecord> {
        self.db
            .get_user(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    fn require_action_item(&self, item_id: i64) -> AppResult<ActionItem> {
        self.db
            .get_action_item(item_id)?
            .ok_or_else(|| AppError::NotFound(format!("Action item {} not found", item_id)))
    }

    fn ensure_known_kpis(&self, kpi_ids: &[i64]) -> AppResult<()> {
        let missing = self.db.missing_kpi_ids(kpi_ids)?;
        if !missing.is_empty() {
            return Err(AppError::Validation(format!("Unknown KPI ids: {:?}", missing)));
        }
        Ok(())
    }

    /// Identify step of recovery: the account must exist, be active, be unlocked and have a full set.
    fn recoverable_user(&self, username: &str, settings: &TrackerSettings) -> AppResult<UserRecord> {
        let user = self
            .db
            .get_user_by_username(username)?
            .filter(|user| user.active)
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
        LockoutPolicy::from_settings(settings)?.ensure_unlocked(user.locked_until, self.clock.now())?;

        let configured = self.db.security_country_count(user.id)?;
        match SetupState::from_count(configured, settings.required_security_countries) {
            SetupState::Configured => Ok(user),
            SetupState::Unconfigured => Err(AppError::Validation(
                "Security countries are not configured for this user".to_string(),
            )),
        }
    }

    /// Records a failed credential check and returns the error the caller should see.
    fn register_failure(&self, user: &UserRecord, lockout: &LockoutPolicy, message: &str) -> AppResult<AppError> {
        let failed_attempts = self.db.increment_failed_attempts(user.id)?;
        let outcome = lockout.evaluate_failure(failed_attempts, self.clock.now())?;

        if let Some(until) = outcome.locked_until {
            self.db.lock_user_until(user.id, until)?;
            tracing::warn!(user_id = user.id, failed_attempts = outcome.failed_attempts, "account locked");
            return Ok(lockout.lockout_error());
        }
        tracing::info!(user_id = user.id, failed_attempts = outcome.failed_attempts, "credential check failed");
        Ok(AppError::Unauthorized(message.to_string()))
    }

    fn describe_user(&self, user: &UserRecord, settings: &TrackerSettings) -> AppResult<CurrentUser> {
        let configured = self.db.security_country_count(user.id)?;
        Ok(CurrentUser {
            id: user.id,
            username: user.username.clone(),
            role: user.role,
            needs_security_setup: SetupState::from_count(configured, settings.required_security_countries)
                == SetupState::Unconfigured,
            onboarding_completed: user.onboarding_completed,
        })
    }

    fn summarize_user(&self, user: UserRecord, settings: &TrackerSettings) -> AppResult<UserSummary> {
        let configured = self.db.security_country_count(user.id)?;
        Ok(UserSummary {
            has_security: SetupState::from_count(configured, settings.required_security_countries)
                == SetupState::Configured,
            assigned_agency_ids: self.db.assigned_agency_ids(user.id)?,
            id: user.id,
            username: user.username,
            role: user.role,
            active: user.active,
            created_at: user.created_at,
            locked_until: user.locked_until,
        })
    }

    fn detail_of(&self, agency: AgencyRecord) -> AppResult<AgencyDetail> {
        let manager_history = self.db.manager_history(agency.id)?;
        let active_manager = manager_history.iter().find(|manager| manager.active).cloned();
        Ok(AgencyDetail {
            kpis: self.db.agency_kpis(agency.id)?,
            agency,
            active_manager,
            manager_history,
        })
    }

    fn dashboards(&self) -> AppResult<DashboardBuilder<'_>> {
        let settings = self.settings()?;
        Ok(DashboardBuilder::new(&self.db, StatusThresholds::from_settings(&settings)))
    }

    fn today(&self) -> chrono::NaiveDate {
        self.clock.now().date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::TrackerCore;
    use crate::errors::AppError;
    use crate::lockout::ManualClock;
    use crate::models::{CreateUserPayload, Role, TrackerSettings, UpdateUserPayload};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn core() -> (tempfile::TempDir, Arc<TrackerCore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let start = Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).single().expect("time");
        let core = TrackerCore::open(&dir.path().join("tracker.db"), Arc::new(ManualClock::new(start)))
            .expect("core");
        core.ensure_admin("admin", Some("admin-pass")).expect("admin");
        (dir, core)
    }

    #[tokio::test]
    async fn admin_bootstrap_is_idempotent_and_needs_a_password() {
        let (_dir, core) = core();
        assert!(core.ensure_admin("admin", Some("other")).expect("again").is_none());
        assert!(core.ensure_admin("second", None).expect("no password").is_none());
        assert!(matches!(
            core.login("second", "anything").await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn fresh_user_needs_security_setup() {
        let (_dir, core) = core();
        let login = core.login("admin", "admin-pass").await.expect("login");
        assert_eq!(login.user.role, Role::Admin);
        assert!(login.user.needs_security_setup);

        let me = core.current_user(&login.token).await.expect("me");
        assert_eq!(me.username, "admin");
    }

    #[tokio::test]
    async fn logout_invalidates_the_token() {
        let (_dir, core) = core();
        let login = core.login("admin", "admin-pass").await.expect("login");
        core.logout(&login.token).await;
        assert!(matches!(
            core.current_user(&login.token).await,
            Err(AppError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_user_is_rejected_everywhere() {
        let (_dir, core) = core();
        let admin = core.login("admin", "admin-pass").await.expect("login").token;
        let created = core
            .create_user(
                &admin,
                CreateUserPayload {
                    username: "clerk".to_string(),
                    password: "clerk-pass".to_string(),
                    role: Role::Normal,
                },
            )
            .await
            .expect("create");
        let clerk = core.login("clerk", "clerk-pass").await.expect("clerk login").token;

        core.update_user(
            &admin,
            created.id,
            UpdateUserPayload {
                role: None,
                active: Some(false),
            },
        )
        .await
        .expect("deactivate");

        assert!(core.current_user(&clerk).await.is_err());
        assert!(matches!(
            core.login("clerk", "clerk-pass").await,
            Err(AppError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn normal_users_cannot_reach_admin_operations() {
        let (_dir, core) = core();
        let admin = core.login("admin", "admin-pass").await.expect("login").token;
        core.create_user(
            &admin,
            CreateUserPayload {
                username: "clerk".to_string(),
                password: "clerk-pass".to_string(),
                role: Role::Normal,
            },
        )
        .await
        .expect("create");
        let clerk = core.login("clerk", "clerk-pass").await.expect("clerk login").token;

        assert!(matches!(core.list_users(&clerk).await, Err(AppError::AccessDenied(_))));
        assert!(matches!(
            core.admin_dashboard(&clerk, 2026, 3).await,
            Err(AppError::AccessDenied(_))
        ));
        assert!(matches!(
            core.update_settings(&clerk, serde_json::json!({ "thresholdGreen": 50.0 })).await,
            Err(AppError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn deactivated_countries_leave_the_catalog() {
        let (_dir, core) = core();
        let admin = core.login("admin", "admin-pass").await.expect("login").token;
        let countries = core.list_countries(&admin).await.expect("countries");
        assert_eq!(countries.len(), 30);

        core.set_country_active(&admin, countries[0].id, false)
            .await
            .expect("deactivate");
        let remaining = core.list_countries(&admin).await.expect("countries");
        assert_eq!(remaining.len(), 29);
        assert!(remaining.iter().all(|country| country.id != countries[0].id));
        assert!(matches!(
            core.set_country_active(&admin, 9_999, false).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn settings_updates_are_validated() {
        let (_dir, core) = core();
        let admin = core.login("admin", "admin-pass").await.expect("login").token;
        let updated = core
            .update_settings(&admin, serde_json::json!({ "thresholdYellow": 80.0 }))
            .await
            .expect("update");
        assert_eq!(updated.threshold_yellow, 80.0);

        assert!(matches!(
            core.update_settings(&admin, serde_json::json!({ "thresholdYellow": 120.0 })).await,
            Err(AppError::Validation(_))
        ));
        assert_eq!(core.get_settings(&admin).await.expect("settings").threshold_yellow, 80.0);
    }

    #[tokio::test]
    async fn oversized_durations_are_rejected_and_lockout_still_works() {
        let (_dir, core) = core();
        let admin = core.login("admin", "admin-pass").await.expect("login").token;
        for patch in [
            serde_json::json!({ "lockoutDurationMinutes": 10_000_000_000_000_i64 }),
            serde_json::json!({ "sessionTtlMinutes": 525_601 }),
            serde_json::json!({ "recoveryGrantTtlMinutes": i64::MAX }),
        ] {
            assert!(matches!(
                core.update_settings(&admin, patch).await,
                Err(AppError::Validation(_))
            ));
        }
        let settings = core.get_settings(&admin).await.expect("settings");
        assert_eq!(settings.lockout_duration_minutes, TrackerSettings::default().lockout_duration_minutes);

        for _ in 0..settings.max_failed_attempts - 1 {
            assert!(matches!(
                core.login("admin", "wrong").await,
                Err(AppError::Unauthorized(_))
            ));
        }
        assert!(matches!(
            core.login("admin", "wrong").await,
            Err(AppError::Locked { .. })
        ));
    }
}
