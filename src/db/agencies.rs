use super::{ensure_changed, parse_kpi_row, parse_time, sql_placeholders, Database};
use crate::errors::{AppError, AppResult};
use crate::models::{AgencyManager, AgencyRecord, AgencyRef, Kpi, ManagerPayload, Role, UserRecord};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::BTreeSet;

const MANAGER_COLUMNS: &str = "id, agency_id, full_name, email, phone, start_date, end_date, active";

impl Database {
    /// Creates the agency, its first manager and its KPI assignments together.
    pub fn insert_agency(
        &self,
        name: &str,
        city: Option<&str>,
        manager: &ManagerPayload,
        kpi_ids: &[i64],
        today: NaiveDate,
    ) -> AppResult<AgencyRecord> {
        let now = Utc::now();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let taken: bool = tx.query_row(
            "SELECT COUNT(1) > 0 FROM agencies WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(AppError::Conflict(format!("Agency with name '{}' already exists", name)));
        }

        tx.execute(
            "INSERT INTO agencies (name, city, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![name, city, now.to_rfc3339()],
        )?;
        let agency_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO agency_managers (agency_id, full_name, email, phone, start_date, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![agency_id, manager.full_name, manager.email, manager.phone, today],
        )?;

        let unique_kpis = kpi_ids.iter().copied().collect::<BTreeSet<_>>();
        for kpi_id in unique_kpis {
            tx.execute(
                "INSERT INTO agency_kpis (agency_id, kpi_id, active) VALUES (?1, ?2, 1)",
                params![agency_id, kpi_id],
            )?;
        }
        tx.commit()?;

        Ok(AgencyRecord {
            id: agency_id,
            name: name.to_string(),
            city: city.map(ToString::to_string),
            active: true,
            created_at: now,
        })
    }

    pub fn get_agency(&self, agency_id: i64) -> AppResult<Option<AgencyRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let agency = conn
            .query_row(
                "SELECT id, name, city, active, created_at FROM agencies WHERE id = ?1",
                [agency_id],
                parse_agency_row,
            )
            .optional()?;
        Ok(agency)
    }

    pub fn list_agencies(&self, active_only: bool) -> AppResult<Vec<AgencyRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, name, city, active, created_at FROM agencies
             WHERE (?1 = 0 OR active = 1)
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([active_only as i32], parse_agency_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn set_agency_active(&self, agency_id: i64, active: bool) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE agencies SET active = ?1 WHERE id = ?2",
            params![active as i32, agency_id],
        )?;
        ensure_changed(changed, "Agency", agency_id)
    }

    pub fn active_manager(&self, agency_id: i64) -> AppResult<Option<AgencyManager>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let manager = conn
            .query_row(
                &format!(
                    "SELECT {} FROM agency_managers WHERE agency_id = ?1 AND active = 1
                     ORDER BY id DESC LIMIT 1",
                    MANAGER_COLUMNS
                ),
                [agency_id],
                parse_manager_row,
            )
            .optional()?;
        Ok(manager)
    }

    /// Newest first.
    pub fn manager_history(&self, agency_id: i64) -> AppResult<Vec<AgencyManager>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agency_managers WHERE agency_id = ?1
             ORDER BY start_date DESC, id DESC",
            MANAGER_COLUMNS
        ))?;
        let rows = stmt.query_map([agency_id], parse_manager_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Closes every open manager record for the agency and opens a new one.
    pub fn replace_manager(
        &self,
        agency_id: i64,
        manager: &ManagerPayload,
        today: NaiveDate,
    ) -> AppResult<AgencyManager> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE agency_managers SET active = 0, end_date = ?1 WHERE agency_id = ?2 AND active = 1",
            params![today, agency_id],
        )?;
        tx.execute(
            "INSERT INTO agency_managers (agency_id, full_name, email, phone, start_date, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![agency_id, manager.full_name, manager.email, manager.phone, today],
        )?;
        let manager_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(AgencyManager {
            id: manager_id,
            agency_id,
            full_name: manager.full_name.clone(),
            email: manager.email.clone(),
            phone: manager.phone.clone(),
            start_date: Some(today),
            end_date: None,
            active: true,
        })
    }

    /// Active assignments only, ordered by code.
    pub fn agency_kpis(&self, agency_id: i64) -> AppResult<Vec<Kpi>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT k.id, k.code, k.label, k.unit, k.active
             FROM kpis k
             JOIN agency_kpis ak ON ak.kpi_id = k.id
             WHERE ak.agency_id = ?1 AND ak.active = 1
             ORDER BY k.code ASC",
        )?;
        let rows = stmt.query_map([agency_id], parse_kpi_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Assignments are soft-toggled: removed ids are deactivated, listed ids reactivated or inserted.
    pub fn update_agency_kpis(&self, agency_id: i64, kpi_ids: &[i64]) -> AppResult<()> {
        let wanted = kpi_ids.iter().copied().collect::<BTreeSet<_>>();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let existing = {
            let mut stmt = tx.prepare("SELECT kpi_id FROM agency_kpis WHERE agency_id = ?1")?;
            let rows = stmt.query_map([agency_id], |row| row.get::<_, i64>(0))?;
            let mut existing = BTreeSet::new();
            for row in rows {
                existing.insert(row?);
            }
            existing
        };

        for kpi_id in &existing {
            tx.execute(
                "UPDATE agency_kpis SET active = ?1 WHERE agency_id = ?2 AND kpi_id = ?3",
                params![wanted.contains(kpi_id) as i32, agency_id, kpi_id],
            )?;
        }
        for kpi_id in wanted.difference(&existing) {
            tx.execute(
                "INSERT INTO agency_kpis (agency_id, kpi_id, active) VALUES (?1, ?2, 1)",
                params![agency_id, kpi_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces a user's agency assignments. Unknown agency ids are rejected before anything changes.
    pub fn set_user_agencies(&self, user_id: i64, agency_ids: &[i64]) -> AppResult<()> {
        let wanted = agency_ids.iter().copied().collect::<BTreeSet<_>>();
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        if !wanted.is_empty() {
            let known: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(1) FROM agencies WHERE id IN ({})",
                    sql_placeholders(wanted.len())
                ),
                params_from_iter(wanted.iter()),
                |row| row.get(0),
            )?;
            if known as usize != wanted.len() {
                return Err(AppError::Validation("Some selected agencies do not exist".to_string()));
            }
        }

        tx.execute("DELETE FROM user_agencies WHERE user_id = ?1", [user_id])?;
        for agency_id in &wanted {
            tx.execute(
                "INSERT INTO user_agencies (user_id, agency_id) VALUES (?1, ?2)",
                params![user_id, agency_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn assigned_agency_ids(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare("SELECT agency_id FROM user_agencies WHERE user_id = ?1 ORDER BY agency_id")?;
        let rows = stmt.query_map([user_id], |row| row.get::<_, i64>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn has_agency_assignment(&self, user_id: i64, agency_id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let assigned = conn.query_row(
            "SELECT COUNT(1) > 0 FROM user_agencies WHERE user_id = ?1 AND agency_id = ?2",
            params![user_id, agency_id],
            |row| row.get(0),
        )?;
        Ok(assigned)
    }

    /// Active agencies the user may see, by name. Admins see all of them.
    pub fn accessible_agencies(&self, user: &UserRecord) -> AppResult<Vec<AgencyRef>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let sees_everything = match user.role {
            Role::Admin => true,
            Role::Normal => false,
        };
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.city FROM agencies a
             WHERE a.active = 1
               AND (?2 = 1 OR EXISTS (
                 SELECT 1 FROM user_agencies ua WHERE ua.user_id = ?1 AND ua.agency_id = a.id
               ))
             ORDER BY a.name ASC",
        )?;
        let rows = stmt.query_map(params![user.id, sees_everything as i32], |row| {
            Ok(AgencyRef {
                id: row.get(0)?,
                name: row.get(1)?,
                city: row.get(2)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn parse_agency_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgencyRecord> {
    Ok(AgencyRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        city: row.get(2)?,
        active: row.get::<_, i32>(3)? != 0,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_manager_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgencyManager> {
    Ok(AgencyManager {
        id: row.get(0)?,
        agency_id: row.get(1)?,
        full_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        start_date: row.get::<_, Option<NaiveDate>>(5)?,
        end_date: row.get::<_, Option<NaiveDate>>(6)?,
        active: row.get::<_, i32>(7)? != 0,
    })
}
