mod agencies;
mod tracking;

use crate::errors::{AppError, AppResult};
use crate::models::{Country, Kpi, Region, Role, TrackerSettings, UserRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const SETTINGS_KEY: &str = "tracker";

const DEFAULT_KPIS: [(&str, &str, &str); 4] = [
    ("CS", "Capital Services", "trx"),
    ("RIA", "RIA (Remesas Internacionales)", "units"),
    ("MG", "MoneyGram", "units"),
    ("CORNERS", "Corners (Puntos de Venta)", "units"),
];

const DEFAULT_COUNTRIES: [(&str, Region); 30] = [
    ("Senegal", Region::Africa),
    ("Mali", Region::Africa),
    ("Costa de Marfil", Region::Africa),
    ("Camerún", Region::Africa),
    ("Ghana", Region::Africa),
    ("Nigeria", Region::Africa),
    ("Kenia", Region::Africa),
    ("Marruecos", Region::Africa),
    ("Túnez", Region::Africa),
    ("Etiopía", Region::Africa),
    ("Tanzania", Region::Africa),
    ("Uganda", Region::Africa),
    ("Congo", Region::Africa),
    ("Burkina Faso", Region::Africa),
    ("Gambia", Region::Africa),
    ("México", Region::Latam),
    ("Guatemala", Region::Latam),
    ("Honduras", Region::Latam),
    ("El Salvador", Region::Latam),
    ("Nicaragua", Region::Latam),
    ("Colombia", Region::Latam),
    ("Ecuador", Region::Latam),
    ("Perú", Region::Latam),
    ("Bolivia", Region::Latam),
    ("Paraguay", Region::Latam),
    ("República Dominicana", Region::Latam),
    ("Cuba", Region::Latam),
    ("Haití", Region::Latam),
    ("Brasil", Region::Latam),
    ("Argentina", Region::Latam),
];

const USER_COLUMNS: &str = "id, username, password_hash, role, active, created_at, failed_attempts, locked_until,
     onboarding_completed, last_login_at";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.seed_default_kpis()?;
        db.seed_default_countries()?;
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_settings(&self) -> AppResult<TrackerSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<TrackerSettings>(&raw).unwrap_or_default()),
            None => Ok(TrackerSettings::default()),
        }
    }

    /// Applies a JSON patch over the stored settings without persisting the result.
    pub fn merged_settings(&self, update: serde_json::Value) -> AppResult<TrackerSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        serde_json::from_value(merged).map_err(|err| AppError::Validation(format!("invalid settings: {}", err)))
    }

    pub fn save_settings(&self, settings: &TrackerSettings) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, serde_json::to_string(settings)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_user(&self, username: &str, password_hash: &str, role: Role) -> AppResult<UserRecord> {
        let now = Utc::now();
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let taken: bool = conn.query_row(
            "SELECT COUNT(1) > 0 FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        if taken {
            return Err(AppError::Conflict(format!("Username '{}' already exists", username)));
        }

        conn.execute(
            "INSERT INTO users (username, password_hash, role, active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![username, password_hash, role.as_str(), now.to_rfc3339()],
        )?;

        Ok(UserRecord {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            role,
            active: true,
            created_at: now,
            failed_attempts: 0,
            locked_until: None,
            onboarding_completed: false,
            last_login_at: None,
        })
    }

    pub fn get_user(&self, user_id: i64) -> AppResult<Option<UserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                [user_id],
                parse_user_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_username(&self, username: &str) -> AppResult<Option<UserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE username = ?1", USER_COLUMNS),
                [username],
                parse_user_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> AppResult<Vec<UserRecord>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM users ORDER BY username ASC", USER_COLUMNS))?;
        let rows = stmt.query_map([], parse_user_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Increments in SQL so concurrent failures are all counted. Returns the new count.
    pub fn increment_failed_attempts(&self, user_id: i64) -> AppResult<u32> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.query_row(
            "UPDATE users SET failed_attempts = failed_attempts + 1 WHERE id = ?1 RETURNING failed_attempts",
            [user_id],
            |row| row.get::<_, u32>(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))
    }

    pub fn lock_user_until(&self, user_id: i64, locked_until: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET locked_until = ?1 WHERE id = ?2",
            params![locked_until.to_rfc3339(), user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn record_login_success(&self, user_id: i64, now: DateTime<Utc>) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET failed_attempts = 0, locked_until = NULL, last_login_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn reset_lockout(&self, user_id: i64) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET failed_attempts = 0, locked_until = NULL WHERE id = ?1",
            [user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    /// Stores a new hash and clears any lockout in the same statement.
    pub fn update_password(&self, user_id: i64, password_hash: &str) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET password_hash = ?1, failed_attempts = 0, locked_until = NULL WHERE id = ?2",
            params![password_hash, user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn set_user_role(&self, user_id: i64, role: Role) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role.as_str(), user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn set_user_active(&self, user_id: i64, active: bool) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET active = ?1 WHERE id = ?2",
            params![active as i32, user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn set_onboarding_completed(&self, user_id: i64) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE users SET onboarding_completed = 1 WHERE id = ?1",
            [user_id],
        )?;
        ensure_changed(changed, "User", user_id)
    }

    pub fn security_country_count(&self, user_id: i64) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM user_security_countries WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn security_country_ids(&self, user_id: i64) -> AppResult<BTreeSet<i64>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare("SELECT country_id FROM user_security_countries WHERE user_id = ?1")?;
        let rows = stmt.query_map([user_id], |row| row.get::<_, i64>(0))?;
        let mut result = BTreeSet::new();
        for row in rows {
            result.insert(row?);
        }
        Ok(result)
    }

    /// Swaps the whole set at once. Every id must name an active country.
    pub fn replace_security_countries(&self, user_id: i64, country_ids: &[i64]) -> AppResult<()> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;

        let placeholders = sql_placeholders(country_ids.len());
        let valid: i64 = tx.query_row(
            &format!(
                "SELECT COUNT(DISTINCT id) FROM countries WHERE active = 1 AND id IN ({})",
                placeholders
            ),
            params_from_iter(country_ids.iter()),
            |row| row.get(0),
        )?;
        if valid as usize != country_ids.len() {
            return Err(AppError::Validation("Some selected countries are invalid".to_string()));
        }

        tx.execute("DELETE FROM user_security_countries WHERE user_id = ?1", [user_id])?;
        for country_id in country_ids {
            tx.execute(
                "INSERT INTO user_security_countries (user_id, country_id) VALUES (?1, ?2)",
                params![user_id, country_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn clear_security_countries(&self, user_id: i64) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let removed = conn.execute("DELETE FROM user_security_countries WHERE user_id = ?1", [user_id])?;
        Ok(removed)
    }

    pub fn list_active_countries(&self) -> AppResult<Vec<Country>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare("SELECT id, name, region FROM countries WHERE active = 1 ORDER BY name ASC")?;
        let rows = stmt.query_map([], parse_country_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn set_country_active(&self, country_id: i64, active: bool) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE countries SET active = ?1 WHERE id = ?2",
            params![active as i32, country_id],
        )?;
        ensure_changed(changed, "Country", country_id)
    }

    pub fn list_kpis(&self, active_only: bool) -> AppResult<Vec<Kpi>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT id, code, label, unit, active FROM kpis
             WHERE (?1 = 0 OR active = 1)
             ORDER BY code ASC",
        )?;
        let rows = stmt.query_map([active_only as i32], parse_kpi_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Ids from `kpi_ids` that have no catalog entry.
    pub fn missing_kpi_ids(&self, kpi_ids: &[i64]) -> AppResult<Vec<i64>> {
        let known = self
            .list_kpis(false)?
            .into_iter()
            .map(|kpi| kpi.id)
            .collect::<BTreeSet<_>>();
        Ok(kpi_ids
            .iter()
            .copied()
            .filter(|kpi_id| !known.contains(kpi_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SETTINGS_KEY,
                    serde_json::to_string(&TrackerSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    fn seed_default_kpis(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut created = 0usize;
        for (code, label, unit) in DEFAULT_KPIS {
            created += conn.execute(
                "INSERT INTO kpis (code, label, unit, active) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(code) DO NOTHING",
                params![code, label, unit],
            )?;
        }
        if created > 0 {
            tracing::info!(created, "seeded default kpis");
        }
        Ok(())
    }

    fn seed_default_countries(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut created = 0usize;
        for (name, region) in DEFAULT_COUNTRIES {
            created += conn.execute(
                "INSERT INTO countries (name, region, active) VALUES (?1, ?2, 1)
                 ON CONFLICT(name) DO NOTHING",
                params![name, region.as_str()],
            )?;
        }
        if created > 0 {
            tracing::info!(created, "seeded default countries");
        }
        Ok(())
    }
}

fn ensure_changed(changed: usize, entity: &str, id: i64) -> AppResult<()> {
    if changed == 0 {
        return Err(AppError::NotFound(format!("{} {} not found", entity, id)));
    }
    Ok(())
}

fn sql_placeholders(count: usize) -> String {
    if count == 0 {
        return "NULL".to_string();
    }
    vec!["?"; count].join(", ")
}

fn parse_user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        role: parse_role(&row.get::<_, String>(3)?)?,
        active: row.get::<_, i32>(4)? != 0,
        created_at: parse_time(&row.get::<_, String>(5)?)?,
        failed_attempts: row.get::<_, i64>(6)?.max(0) as u32,
        locked_until: row
            .get::<_, Option<String>>(7)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        onboarding_completed: row.get::<_, i32>(8)? != 0,
        last_login_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_country_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Country> {
    Ok(Country {
        id: row.get(0)?,
        name: row.get(1)?,
        region: parse_region(&row.get::<_, String>(2)?)?,
    })
}

fn parse_kpi_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Kpi> {
    Ok(Kpi {
        id: row.get(0)?,
        code: row.get(1)?,
        label: row.get(2)?,
        unit: row.get(3)?,
        active: row.get::<_, i32>(4)? != 0,
    })
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    match raw {
        "ADMIN" => Ok(Role::Admin),
        "NORMAL" => Ok(Role::Normal),
        other => Err(invalid_text(format!("Unknown role '{}'", other))),
    }
}

fn parse_region(raw: &str) -> rusqlite::Result<Region> {
    match raw {
        "AFRICA" => Ok(Region::Africa),
        "LATAM" => Ok(Region::Latam),
        other => Err(invalid_text(format!("Unknown region '{}'", other))),
    }
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_text(error.to_string()))
}

fn invalid_text(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
