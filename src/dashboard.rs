use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::kpi_status::{
    average_pct, compute_status, count_statuses, health_pct, overall_status, rank_by_performance, round1,
    sort_worst_first, StatusThresholds,
};
use crate::models::{
    AdminDashboard, AgencyDashboard, AgencyHeader, AgencyRef, AgencySummary, KpiSummaryRow, NormalDashboard,
    OnboardingChecklist, PendingReview, Period, ReviewCompleteness, StatusCounts, SummaryDashboard, UserRecord,
};

/// Read-side views assembled from stored targets, results, reviews and action items.
pub struct DashboardBuilder<'a> {
    db: &'a Database,
    thresholds: StatusThresholds,
}

impl<'a> DashboardBuilder<'a> {
    pub fn new(db: &'a Database, thresholds: StatusThresholds) -> Self {
        Self { db, thresholds }
    }

    /// One row per active KPI assignment. A missing target or result counts as zero.
    pub fn monthly_summary(&self, agency_id: i64, period: Period) -> AppResult<Vec<KpiSummaryRow>> {
        let kpis = self.db.agency_kpis(agency_id)?;
        let targets = self.db.monthly_targets(agency_id, period)?;
        let results = self.db.monthly_results(agency_id, period)?;

        Ok(kpis
            .into_iter()
            .map(|kpi| {
                let target = targets.get(&kpi.id).copied().unwrap_or(0.0);
                let actual = results.get(&kpi.id).copied().unwrap_or(0.0);
                let evaluation = compute_status(target, actual, &self.thresholds);
                KpiSummaryRow {
                    kpi_id: kpi.id,
                    kpi_code: kpi.code,
                    kpi_label: kpi.label,
                    kpi_unit: kpi.unit,
                    target,
                    actual,
                    diff: evaluation.diff,
                    pct: evaluation.pct,
                    status: evaluation.status,
                }
            })
            .collect())
    }

    pub fn agency_dashboard(&self, agency_id: i64, period: Period) -> AppResult<AgencyDashboard> {
        let agency = self
            .db
            .get_agency(agency_id)?
            .ok_or_else(|| AppError::NotFound(format!("Agency {} not found", agency_id)))?;
        let manager = self.db.active_manager(agency_id)?;

        let kpis = self.monthly_summary(agency_id, period)?;
        let counts = count_statuses(&kpis);
        let review = self.db.monthly_review(agency_id, period)?;
        let actions = self.db.action_items(agency_id, period)?;
        let (completed_actions, pending_actions): (Vec<_>, Vec<_>) =
            actions.iter().cloned().partition(|item| item.done);

        let has_results = kpis.iter().any(|row| row.actual > 0.0);
        let has_review = review.as_ref().map(|review| review.has_content()).unwrap_or(false);

        Ok(AgencyDashboard {
            agency: AgencyHeader {
                id: agency.id,
                name: agency.name,
                city: agency.city,
                manager,
            },
            year: period.year,
            month: period.month,
            month_name: period.month_name().to_string(),
            overall_status: overall_status(counts),
            green_count: counts.green,
            yellow_count: counts.yellow,
            red_count: counts.red,
            kpis,
            review,
            actions,
            pending_actions,
            completed_actions,
            has_results,
            has_review,
            review_pending: has_results && !has_review,
        })
    }

    /// Every active agency, worst first, with fleet-wide totals.
    pub fn admin_dashboard(&self, period: Period) -> AppResult<AdminDashboard> {
        let mut agencies = Vec::new();
        let mut pending_reviews = Vec::new();
        let mut totals = StatusCounts::default();

        for agency in self.db.list_agencies(true)? {
            let dashboard = self.agency_dashboard(agency.id, period)?;
            totals.green += dashboard.green_count;
            totals.yellow += dashboard.yellow_count;
            totals.red += dashboard.red_count;
            if dashboard.review_pending {
                pending_reviews.push(PendingReview {
                    agency_id: agency.id,
                    agency_name: agency.name.clone(),
                    manager_name: dashboard.agency.manager.as_ref().map(|m| m.full_name.clone()),
                });
            }
            agencies.push(dashboard);
        }

        sort_worst_first(&mut agencies, AgencyDashboard::counts);
        let at_risk = agencies
            .iter()
            .filter(|dashboard| dashboard.red_count > 0)
            .cloned()
            .collect();

        Ok(AdminDashboard {
            year: period.year,
            month: period.month,
            month_name: period.month_name().to_string(),
            total_agencies: agencies.len(),
            total_green: totals.green,
            total_yellow: totals.yellow,
            total_red: totals.red,
            health_pct: health_pct(totals),
            agencies,
            at_risk,
            pending_reviews,
        })
    }

    /// Ranks the given agencies by average attainment, best first.
    pub fn summary_dashboard(&self, period: Period, agencies: &[AgencyRef]) -> AppResult<SummaryDashboard> {
        let mut summaries = Vec::with_capacity(agencies.len());
        for agency in agencies {
            let rows = self.monthly_summary(agency.id, period)?;
            let counts = count_statuses(&rows);
            summaries.push(AgencySummary {
                agency_id: agency.id,
                agency_name: agency.name.clone(),
                city: agency.city.clone(),
                manager_name: self.db.active_manager(agency.id)?.map(|m| m.full_name),
                avg_pct: average_pct(&rows),
                red_count: counts.red,
                yellow_count: counts.yellow,
                green_count: counts.green,
                kpi_details: rows,
            });
        }
        rank_by_performance(&mut summaries);

        let avg_performance = if summaries.is_empty() {
            0.0
        } else {
            round1(summaries.iter().map(|s| s.avg_pct).sum::<f64>() / summaries.len() as f64)
        };
        let alerts_count = summaries.iter().map(|s| s.red_count).sum();

        Ok(SummaryDashboard {
            year: period.year,
            month: period.month,
            total_agencies: summaries.len(),
            agencies: summaries,
            avg_performance,
            alerts_count,
        })
    }

    /// The user's agencies, the selected one's dashboard and onboarding progress.
    pub fn normal_dashboard(
        &self,
        user: &UserRecord,
        period: Period,
        requested_agency: Option<i64>,
    ) -> AppResult<NormalDashboard> {
        let agencies = self.db.accessible_agencies(user)?;
        let checklist = self.onboarding_checklist(agencies.first(), period)?;

        let selected_agency = requested_agency
            .and_then(|id| agencies.iter().find(|agency| agency.id == id))
            .or_else(|| agencies.first())
            .cloned();
        let dashboard = match &selected_agency {
            Some(agency) => Some(self.agency_dashboard(agency.id, period)?),
            None => None,
        };

        Ok(NormalDashboard {
            year: period.year,
            month: period.month,
            has_agencies: !agencies.is_empty(),
            agencies,
            selected_agency,
            dashboard,
            onboarding_completed: user.onboarding_completed,
            checklist,
        })
    }

    pub fn review_completeness(&self, agency_id: i64, period: Period) -> AppResult<ReviewCompleteness> {
        let rows = self.monthly_summary(agency_id, period)?;
        let review = self.db.monthly_review(agency_id, period)?;
        let has_actions = !self.db.action_items(agency_id, period)?.is_empty();

        let has_targets = rows.iter().any(|row| row.target > 0.0);
        let has_results = rows.iter().any(|row| row.actual > 0.0);
        let has_what_happened = review.as_ref().map(|r| r.has_what_happened()).unwrap_or(false);
        let has_improvement_plan = review.as_ref().map(|r| r.has_improvement_plan()).unwrap_or(false);

        Ok(ReviewCompleteness {
            has_targets,
            has_results,
            has_what_happened,
            has_improvement_plan,
            has_actions,
            is_complete: has_results && has_what_happened && has_improvement_plan && has_actions,
        })
    }

    /// Progress on the primary agency. January has no previous month to review.
    pub fn onboarding_checklist(&self, primary: Option<&AgencyRef>, period: Period) -> AppResult<OnboardingChecklist> {
        let Some(agency) = primary else {
            return Ok(OnboardingChecklist::default());
        };

        let viewed_targets = !self.db.monthly_targets(agency.id, period)?.is_empty();
        let previous_reviewed = self
            .db
            .monthly_review(agency.id, period.previous())?
            .map(|review| review.has_content())
            .unwrap_or(false);
        let completed_review = self
            .db
            .monthly_review(agency.id, period)?
            .map(|review| review.has_content())
            .unwrap_or(false);
        let defined_actions = !self.db.action_items(agency.id, period)?.is_empty();

        Ok(OnboardingChecklist {
            has_agency: true,
            viewed_targets,
            reviewed_previous: previous_reviewed || period.month == 1,
            completed_review,
            defined_actions,
        })
    }
}
