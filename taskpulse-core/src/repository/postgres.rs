use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use uuid::Uuid;

use super::{AccessRepository, MutationStore};
use crate::{
    models::{EntityId, EntityKind, MutationFields, UserId},
    Error, Result,
};

/// Members of the task's user group, users attached to the task directly,
/// and the assignee.
const TASK_ACCESS_SQL: &str = "
    SELECT ugu.user_id FROM user_group_users ugu
    INNER JOIN tasks t ON ugu.user_group_id = t.user_group
    WHERE t.id = $1
    UNION
    SELECT tu.user_id FROM task_users tu WHERE tu.task_id = $1
    UNION
    SELECT t.assigned_to FROM tasks t WHERE t.id = $1 AND t.assigned_to IS NOT NULL";

const COMMENT_ACCESS_SQL: &str = "
    SELECT ugu.user_id FROM user_group_users ugu
    INNER JOIN tasks t ON ugu.user_group_id = t.user_group
    INNER JOIN comments c ON c.task_id = t.id
    WHERE c.id = $1
    UNION
    SELECT tu.user_id FROM task_users tu
    INNER JOIN comments c ON c.task_id = tu.task_id
    WHERE c.id = $1
    UNION
    SELECT t.assigned_to FROM tasks t
    INNER JOIN comments c ON c.task_id = t.id
    WHERE c.id = $1 AND t.assigned_to IS NOT NULL";

const PROJECT_ACCESS_SQL: &str = "
    SELECT pu.user_id FROM project_users pu WHERE pu.project_id = $1";

const SECTION_ACCESS_SQL: &str = "
    SELECT ugu.user_id FROM user_group_users ugu
    INNER JOIN sections s ON ugu.user_group_id = s.user_group
    WHERE s.id = $1
    UNION
    SELECT pu.user_id FROM project_users pu
    INNER JOIN sections s ON pu.project_id = s.project_id
    WHERE s.id = $1";

const GROUP_ACCESS_SQL: &str = "
    SELECT ugu.user_id FROM user_group_users ugu WHERE ugu.user_group_id = $1
    UNION
    SELECT ug.owner_id FROM user_groups ug WHERE ug.id = $1";

const fn access_query(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => TASK_ACCESS_SQL,
        EntityKind::Comment => COMMENT_ACCESS_SQL,
        EntityKind::Project => PROJECT_ACCESS_SQL,
        EntityKind::Section => SECTION_ACCESS_SQL,
        EntityKind::Group => GROUP_ACCESS_SQL,
    }
}

/// Entitlement lookups against the task-management schema
#[derive(Clone)]
pub struct PgAccessRepository {
    pool: PgPool,
}

impl PgAccessRepository {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccessRepository for PgAccessRepository {
    async fn lookup_entity_access_list(
        &self,
        kind: EntityKind,
        id: &EntityId,
    ) -> Result<HashSet<UserId>> {
        let rows = sqlx::query(access_query(kind))
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<UserId> {
                let user_id: Uuid = row.try_get(0)?;
                Ok(UserId::from_uuid(user_id))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Text,
    Integer,
    Uuid,
    Timestamp,
}

/// Columns a realtime mutation may touch, per entity kind
fn writable_columns(kind: EntityKind) -> (&'static str, &'static [(&'static str, ColumnType)]) {
    use ColumnType::{Integer, Text, Timestamp, Uuid};

    match kind {
        EntityKind::Task => (
            "tasks",
            &[
                ("title", Text),
                ("description", Text),
                ("status", Text),
                ("priority", Text),
                ("due_date", Timestamp),
                ("assigned_to", Uuid),
                ("section_id", Uuid),
                ("estimated_time", Integer),
                ("spent_time", Integer),
            ],
        ),
        EntityKind::Comment => ("comments", &[("body", Text)]),
        EntityKind::Project => ("projects", &[("title", Text)]),
        EntityKind::Section => ("sections", &[("title", Text), ("order", Integer)]),
        EntityKind::Group => ("user_groups", &[("team_title", Text)]),
    }
}

/// A bound parameter for the dynamic UPDATE
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Text(Option<String>),
    Integer(Option<i64>),
    Uuid(Option<Uuid>),
    Timestamp(Option<chrono::DateTime<chrono::Utc>>),
}

fn convert(column: &str, column_type: ColumnType, value: &Value) -> Result<BindValue> {
    let invalid = || Error::InvalidInput(format!("Invalid value for column {column}: {value}"));

    Ok(match (column_type, value) {
        (ColumnType::Text, Value::Null) => BindValue::Text(None),
        (ColumnType::Text, Value::String(s)) => BindValue::Text(Some(s.clone())),
        (ColumnType::Integer, Value::Null) => BindValue::Integer(None),
        (ColumnType::Integer, Value::Number(n)) => {
            BindValue::Integer(Some(n.as_i64().ok_or_else(invalid)?))
        }
        (ColumnType::Uuid, Value::Null) => BindValue::Uuid(None),
        (ColumnType::Uuid, Value::String(s)) => {
            BindValue::Uuid(Some(Uuid::parse_str(s).map_err(|_| invalid())?))
        }
        (ColumnType::Timestamp, Value::Null) => BindValue::Timestamp(None),
        (ColumnType::Timestamp, Value::String(s)) => BindValue::Timestamp(Some(
            chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|_| invalid())?
                .with_timezone(&chrono::Utc),
        )),
        _ => return Err(invalid()),
    })
}

/// Build `UPDATE <table> SET ... WHERE id = $1` from a field set.
///
/// The `id` field is ignored; any other column not in the whitelist is
/// rejected so client payloads never reach the SQL text.
fn build_update(kind: EntityKind, fields: &MutationFields) -> Result<(String, Vec<BindValue>)> {
    let (table, columns) = writable_columns(kind);

    let mut assignments = Vec::new();
    let mut binds = Vec::new();
    let mut param_idx = 2u32;

    for (name, value) in fields {
        if name == "id" {
            continue;
        }
        let (column, column_type) = columns
            .iter()
            .find(|(column, _)| column == name)
            .ok_or_else(|| Error::InvalidInput(format!("Column {name} is not writable on {kind}")))?;

        binds.push(convert(column, *column_type, value)?);
        assignments.push(format!("\"{column}\" = ${param_idx}"));
        param_idx += 1;
    }

    if assignments.is_empty() {
        return Err(Error::InvalidInput(format!("No writable fields for {kind}")));
    }

    assignments.push("updated_at = now()".to_string());
    let sql = format!("UPDATE {table} SET {} WHERE id = $1", assignments.join(", "));

    Ok((sql, binds))
}

/// Applies coalesced mutations to entity rows
#[derive(Clone)]
pub struct PgMutationStore {
    pool: PgPool,
}

impl PgMutationStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MutationStore for PgMutationStore {
    async fn persist_mutation(
        &self,
        kind: EntityKind,
        id: &EntityId,
        fields: &MutationFields,
    ) -> Result<()> {
        let (sql, binds) = build_update(kind, fields)?;

        let mut query = sqlx::query(&sql).bind(id.as_uuid());
        for bind in binds {
            query = match bind {
                BindValue::Text(v) => query.bind(v),
                BindValue::Integer(v) => query.bind(v),
                BindValue::Uuid(v) => query.bind(v),
                BindValue::Timestamp(v) => query.bind(v),
            };
        }

        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("{kind} {id}")));
        }

        Ok(())
    }
}
