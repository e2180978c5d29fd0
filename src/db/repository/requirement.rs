use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::*;

const REQUIREMENT_COLUMNS: &str =
    "id, project_id, code, description, category, priority, status, created_at, updated_at";

pub fn insert_requirement(conn: &Connection, req: &Requirement) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO requirements (id, project_id, code, description, category, priority, status,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            req.id.to_string(),
            req.project_id,
            req.code,
            req.description,
            req.category,
            req.priority.as_str(),
            req.status.as_str(),
            req.created_at,
            req.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_requirement(conn: &Connection, id: &Uuid) -> Result<Option<Requirement>, DatabaseError> {
    let sql = format!("SELECT {REQUIREMENT_COLUMNS} FROM requirements WHERE id = ?1");
    let result = conn.query_row(&sql, params![id.to_string()], read_requirement_row);

    match result {
        Ok(row) => Ok(Some(requirement_from_row(row)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_requirements_by_project(
    conn: &Connection,
    project_id: &str,
) -> Result<Vec<Requirement>, DatabaseError> {
    let sql = format!(
        "SELECT {REQUIREMENT_COLUMNS} FROM requirements WHERE project_id = ?1 ORDER BY code ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id], read_requirement_row)?;

    let mut reqs = Vec::new();
    for row in rows {
        reqs.push(requirement_from_row(row?)?);
    }
    Ok(reqs)
}

pub fn update_requirement_status(
    conn: &Connection,
    id: &Uuid,
    status: RequirementStatus,
) -> Result<(), DatabaseError> {
    let rows = conn.execute(
        "UPDATE requirements SET status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), status.as_str(), Utc::now()],
    )?;
    if rows == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Requirement".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Hard delete. The requirement's matrix entries go with it.
pub fn delete_requirement(conn: &Connection, id: &Uuid) -> Result<(), DatabaseError> {
    let deleted = conn.execute("DELETE FROM requirements WHERE id = ?1", params![id.to_string()])?;
    if deleted == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "Requirement".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

struct RequirementRow {
    id: String,
    project_id: String,
    code: String,
    description: String,
    category: Option<String>,
    priority: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn read_requirement_row(row: &Row<'_>) -> rusqlite::Result<RequirementRow> {
    Ok(RequirementRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        code: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        priority: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn requirement_from_row(row: RequirementRow) -> Result<Requirement, DatabaseError> {
    Ok(Requirement {
        id: parse_uuid(&row.id)?,
        project_id: row.project_id,
        code: row.code,
        description: row.description,
        category: row.category,
        priority: Priority::from_str(&row.priority)?,
        status: RequirementStatus::from_str(&row.status)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}
