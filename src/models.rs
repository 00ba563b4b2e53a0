use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Normal,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::Normal => "NORMAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Region {
    Africa,
    Latam,
}

impl Region {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Africa => "AFRICA",
            Self::Latam => "LATAM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KpiStatus {
    Green,
    Yellow,
    Red,
}

/// Worst status present among an agency's KPIs for a month, or `None` when nothing was evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Green,
    Yellow,
    Red,
    None,
}

const MONTH_NAMES: [&str; 12] = [
    "Enero",
    "Febrero",
    "Marzo",
    "Abril",
    "Mayo",
    "Junio",
    "Julio",
    "Agosto",
    "Septiembre",
    "Octubre",
    "Noviembre",
    "Diciembre",
];

/// A tracking month. Construct through `PolicyEngine::validate_period` so the range is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn next(self) -> Self {
        if self.month >= 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(self) -> Self {
        if self.month <= 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn month_name(self) -> &'static str {
        self.month
            .checked_sub(1)
            .and_then(|index| MONTH_NAMES.get(index as usize))
            .copied()
            .unwrap_or("Invalid")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub onboarding_completed: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub has_security: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub assigned_agency_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub needs_security_setup: bool,
    pub onboarding_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: CurrentUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserPayload {
    pub username: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserPayload {
    pub role: Option<Role>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpi {
    pub id: i64,
    pub code: String,
    pub label: Option<String>,
    pub unit: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Country {
    pub id: i64,
    pub name: String,
    pub region: Region,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyRecord {
    pub id: i64,
    pub name: String,
    pub city: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyRef {
    pub id: i64,
    pub name: String,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyManager {
    pub id: i64,
    pub agency_id: i64,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyListItem {
    #[serde(flatten)]
    pub agency: AgencyRecord,
    pub manager: Option<AgencyManager>,
    pub kpis: Vec<Kpi>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyDetail {
    #[serde(flatten)]
    pub agency: AgencyRecord,
    pub active_manager: Option<AgencyManager>,
    pub manager_history: Vec<AgencyManager>,
    pub kpis: Vec<Kpi>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgencyPayload {
    pub name: String,
    pub city: Option<String>,
    pub manager: ManagerPayload,
    #[serde(default)]
    pub kpi_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerPayload {
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveTargetsPayload {
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub targets: BTreeMap<i64, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResultsPayload {
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub results: BTreeMap<i64, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyResult {
    pub kpi_id: i64,
    pub actual_value: f64,
    pub recorded_by: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReview {
    pub id: i64,
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub review_date: Option<NaiveDate>,
    pub what_happened: Option<String>,
    pub improvement_plan: Option<String>,
}

impl MonthlyReview {
    pub fn has_what_happened(&self) -> bool {
        self.what_happened
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn has_improvement_plan(&self) -> bool {
        self.improvement_plan
            .as_deref()
            .map(|text| !text.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn has_content(&self) -> bool {
        self.has_what_happened() || self.has_improvement_plan()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReviewPayload {
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub review_date: Option<NaiveDate>,
    pub what_happened: Option<String>,
    pub improvement_plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionItem {
    pub id: i64,
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub title: String,
    pub done: bool,
    pub done_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionItemPayload {
    pub agency_id: i64,
    pub year: i32,
    pub month: u32,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiSummaryRow {
    pub kpi_id: i64,
    pub kpi_code: String,
    pub kpi_label: Option<String>,
    pub kpi_unit: Option<String>,
    pub target: f64,
    pub actual: f64,
    pub diff: f64,
    pub pct: f64,
    pub status: KpiStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub green: u32,
    pub yellow: u32,
    pub red: u32,
}

impl StatusCounts {
    pub fn total(&self) -> u32 {
        self.green + self.yellow + self.red
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencySummary {
    pub agency_id: i64,
    pub agency_name: String,
    pub city: Option<String>,
    pub manager_name: Option<String>,
    pub avg_pct: f64,
    pub red_count: u32,
    pub yellow_count: u32,
    pub green_count: u32,
    pub kpi_details: Vec<KpiSummaryRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryDashboard {
    pub year: i32,
    pub month: u32,
    pub agencies: Vec<AgencySummary>,
    pub total_agencies: usize,
    pub avg_performance: f64,
    pub alerts_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyHeader {
    pub id: i64,
    pub name: String,
    pub city: Option<String>,
    pub manager: Option<AgencyManager>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgencyDashboard {
    pub agency: AgencyHeader,
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub kpis: Vec<KpiSummaryRow>,
    pub overall_status: OverallStatus,
    pub green_count: u32,
    pub yellow_count: u32,
    pub red_count: u32,
    pub review: Option<MonthlyReview>,
    pub actions: Vec<ActionItem>,
    pub pending_actions: Vec<ActionItem>,
    pub completed_actions: Vec<ActionItem>,
    pub has_results: bool,
    pub has_review: bool,
    pub review_pending: bool,
}

impl AgencyDashboard {
    pub fn counts(&self) -> StatusCounts {
        StatusCounts {
            green: self.green_count,
            yellow: self.yellow_count,
            red: self.red_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReview {
    pub agency_id: i64,
    pub agency_name: String,
    pub manager_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminDashboard {
    pub year: i32,
    pub month: u32,
    pub month_name: String,
    pub total_agencies: usize,
    pub total_green: u32,
    pub total_yellow: u32,
    pub total_red: u32,
    pub health_pct: f64,
    pub agencies: Vec<AgencyDashboard>,
    pub at_risk: Vec<AgencyDashboard>,
    pub pending_reviews: Vec<PendingReview>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingChecklist {
    pub has_agency: bool,
    pub viewed_targets: bool,
    pub reviewed_previous: bool,
    pub completed_review: bool,
    pub defined_actions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalDashboard {
    pub year: i32,
    pub month: u32,
    pub has_agencies: bool,
    pub agencies: Vec<AgencyRef>,
    pub selected_agency: Option<AgencyRef>,
    pub dashboard: Option<AgencyDashboard>,
    pub onboarding_completed: bool,
    pub checklist: OnboardingChecklist,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCompleteness {
    pub has_targets: bool,
    pub has_results: bool,
    pub has_what_happened: bool,
    pub has_improvement_plan: bool,
    pub has_actions: bool,
    pub is_complete: bool,
}

/// Business-rule tunables, persisted in the `settings` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerSettings {
    pub max_failed_attempts: u32,
    pub lockout_duration_minutes: i64,
    pub required_security_countries: usize,
    pub min_correct_countries_for_recovery: usize,
    pub threshold_green: f64,
    pub threshold_yellow: f64,
    pub session_ttl_minutes: i64,
    pub recovery_grant_ttl_minutes: i64,
    pub min_password_length: usize,
    pub setup_candidate_count: usize,
    pub recovery_candidate_count: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            lockout_duration_minutes: 15,
            required_security_countries: 5,
            min_correct_countries_for_recovery: 3,
            threshold_green: 100.0,
            threshold_yellow: 90.0,
            session_ttl_minutes: 30,
            recovery_grant_ttl_minutes: 10,
            min_password_length: 4,
            setup_candidate_count: 15,
            recovery_candidate_count: 10,
        }
    }
}
