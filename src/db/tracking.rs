use super::{ensure_changed, parse_time, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{ActionItem, MonthlyResult, MonthlyReview, Period};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;

const ACTION_COLUMNS: &str = "id, agency_id, year, month, title, done, done_at";

impl Database {
    pub fn upsert_targets(&self, agency_id: i64, period: Period, targets: &BTreeMap<i64, f64>) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for (kpi_id, value) in targets {
            upsert_target(&tx, agency_id, period, *kpi_id, *value, &now)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn monthly_targets(&self, agency_id: i64, period: Period) -> AppResult<BTreeMap<i64, f64>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        targets_in(&conn, agency_id, period)
    }

    /// Copies the source month's targets over the other eleven months of the same year.
    pub fn copy_targets_to_all_months(&self, agency_id: i64, year: i32, source_month: u32) -> AppResult<usize> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let source = Period {
            year,
            month: source_month,
        };
        let targets = targets_in(&tx, agency_id, source)?;
        if targets.is_empty() {
            return Err(no_targets(source_month));
        }

        let mut months_updated = 0usize;
        for month in (1..=12u32).filter(|month| *month != source_month) {
            let destination = Period { year, month };
            for (kpi_id, value) in &targets {
                upsert_target(&tx, agency_id, destination, *kpi_id, *value, &now)?;
            }
            months_updated += 1;
        }
        tx.commit()?;
        Ok(months_updated)
    }

    /// Copies the source month's targets into the following month, rolling December into January.
    pub fn copy_targets_to_next_month(&self, agency_id: i64, source: Period) -> AppResult<Period> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let targets = targets_in(&tx, agency_id, source)?;
        if targets.is_empty() {
            return Err(no_targets(source.month));
        }

        let destination = source.next();
        for (kpi_id, value) in &targets {
            upsert_target(&tx, agency_id, destination, *kpi_id, *value, &now)?;
        }
        tx.commit()?;
        Ok(destination)
    }

    pub fn upsert_results(
        &self,
        agency_id: i64,
        period: Period,
        results: &BTreeMap<i64, f64>,
        recorded_by: &str,
    ) -> AppResult<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for (kpi_id, value) in results {
            tx.execute(
                "INSERT INTO monthly_results (agency_id, year, month, kpi_id, actual_value, recorded_at, recorded_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(agency_id, year, month, kpi_id) DO UPDATE SET
                   actual_value = excluded.actual_value,
                   recorded_at = excluded.recorded_at,
                   recorded_by = excluded.recorded_by",
                params![agency_id, period.year, period.month, kpi_id, value, now, recorded_by],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn monthly_results(&self, agency_id: i64, period: Period) -> AppResult<BTreeMap<i64, f64>> {
        Ok(self
            .result_entries(agency_id, period)?
            .into_iter()
            .map(|entry| (entry.kpi_id, entry.actual_value))
            .collect())
    }

    pub fn result_entries(&self, agency_id: i64, period: Period) -> AppResult<Vec<MonthlyResult>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT kpi_id, actual_value, recorded_by, recorded_at FROM monthly_results
             WHERE agency_id = ?1 AND year = ?2 AND month = ?3
             ORDER BY kpi_id ASC",
        )?;
        let rows = stmt.query_map(params![agency_id, period.year, period.month], |row| {
            Ok(MonthlyResult {
                kpi_id: row.get(0)?,
                actual_value: row.get(1)?,
                recorded_by: row.get(2)?,
                recorded_at: parse_time(&row.get::<_, String>(3)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Absent fields keep their stored value. A first save fills the gaps with today's date and empty text.
    pub fn upsert_review(
        &self,
        agency_id: i64,
        period: Period,
        review_date: Option<NaiveDate>,
        what_happened: Option<&str>,
        improvement_plan: Option<&str>,
        today: NaiveDate,
    ) -> AppResult<MonthlyReview> {
        {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            conn.execute(
                "INSERT INTO monthly_reviews (agency_id, year, month, review_date, what_happened, improvement_plan)
                 VALUES (?1, ?2, ?3, COALESCE(?4, ?7), COALESCE(?5, ''), COALESCE(?6, ''))
                 ON CONFLICT(agency_id, year, month) DO UPDATE SET
                   review_date = COALESCE(?4, review_date),
                   what_happened = COALESCE(?5, what_happened),
                   improvement_plan = COALESCE(?6, improvement_plan)",
                params![
                    agency_id,
                    period.year,
                    period.month,
                    review_date,
                    what_happened,
                    improvement_plan,
                    today
                ],
            )?;
        }

        self.monthly_review(agency_id, period)?
            .ok_or_else(|| AppError::Internal("review vanished after upsert".to_string()))
    }

    pub fn monthly_review(&self, agency_id: i64, period: Period) -> AppResult<Option<MonthlyReview>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let review = conn
            .query_row(
                "SELECT id, agency_id, year, month, review_date, what_happened, improvement_plan
                 FROM monthly_reviews
                 WHERE agency_id = ?1 AND year = ?2 AND month = ?3",
                params![agency_id, period.year, period.month],
                |row| {
                    Ok(MonthlyReview {
                        id: row.get(0)?,
                        agency_id: row.get(1)?,
                        year: row.get(2)?,
                        month: row.get(3)?,
                        review_date: row.get::<_, Option<NaiveDate>>(4)?,
                        what_happened: row.get(5)?,
                        improvement_plan: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(review)
    }

    pub fn insert_action_item(&self, agency_id: i64, period: Period, title: &str) -> AppResult<ActionItem> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO action_items (agency_id, year, month, title, done) VALUES (?1, ?2, ?3, ?4, 0)",
            params![agency_id, period.year, period.month, title],
        )?;
        Ok(ActionItem {
            id: conn.last_insert_rowid(),
            agency_id,
            year: period.year,
            month: period.month,
            title: title.to_string(),
            done: false,
            done_at: None,
        })
    }

    pub fn get_action_item(&self, item_id: i64) -> AppResult<Option<ActionItem>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let item = conn
            .query_row(
                &format!("SELECT {} FROM action_items WHERE id = ?1", ACTION_COLUMNS),
                [item_id],
                parse_action_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Marking done stamps `done_at`; reopening clears it.
    pub fn set_action_item_done(&self, item_id: i64, done: bool, now: DateTime<Utc>) -> AppResult<ActionItem> {
        {
            let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
            let done_at = done.then(|| now.to_rfc3339());
            let changed = conn.execute(
                "UPDATE action_items SET done = ?1, done_at = ?2 WHERE id = ?3",
                params![done as i32, done_at, item_id],
            )?;
            ensure_changed(changed, "Action item", item_id)?;
        }
        self.get_action_item(item_id)?
            .ok_or_else(|| AppError::NotFound(format!("Action item {} not found", item_id)))
    }

    pub fn delete_action_item(&self, item_id: i64) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM action_items WHERE id = ?1", [item_id])?;
        ensure_changed(changed, "Action item", item_id)
    }

    pub fn action_items(&self, agency_id: i64, period: Period) -> AppResult<Vec<ActionItem>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM action_items
             WHERE agency_id = ?1 AND year = ?2 AND month = ?3
             ORDER BY id ASC",
            ACTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agency_id, period.year, period.month], parse_action_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn targets_in(conn: &Connection, agency_id: i64, period: Period) -> AppResult<BTreeMap<i64, f64>> {
    let mut stmt = conn.prepare(
        "SELECT kpi_id, target_value FROM monthly_targets
         WHERE agency_id = ?1 AND year = ?2 AND month = ?3",
    )?;
    let rows = stmt.query_map(params![agency_id, period.year, period.month], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut result = BTreeMap::new();
    for row in rows {
        let (kpi_id, value) = row?;
        result.insert(kpi_id, value);
    }
    Ok(result)
}

fn upsert_target(
    tx: &Transaction<'_>,
    agency_id: i64,
    period: Period,
    kpi_id: i64,
    value: f64,
    now: &str,
) -> AppResult<()> {
    tx.execute(
        "INSERT INTO monthly_targets (agency_id, year, month, kpi_id, target_value, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(agency_id, year, month, kpi_id) DO UPDATE SET target_value = excluded.target_value",
        params![agency_id, period.year, period.month, kpi_id, value, now],
    )?;
    Ok(())
}

fn no_targets(month: u32) -> AppError {
    AppError::Validation(format!("No targets defined for month {}", month))
}

fn parse_action_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActionItem> {
    Ok(ActionItem {
        id: row.get(0)?,
        agency_id: row.get(1)?,
        year: row.get(2)?,
        month: row.get(3)?,
        title: row.get(4)?,
        done: row.get::<_, i32>(5)? != 0,
        done_at: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}
