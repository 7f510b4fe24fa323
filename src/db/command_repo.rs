use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{Command, CommandKind, CommandStatus, CommandTarget, TargetResult};

/// Database row for the commands table.
#[derive(Debug, FromRow)]
struct CommandRow {
    id: Uuid,
    kind: Json<CommandKind>,
    selector: String,
    targets: Json<Vec<CommandTarget>>,
    status: String,
    created_at: DateTime<Utc>,
    scheduled_for: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    results: Json<Vec<TargetResult>>,
}

impl CommandRow {
    fn into_command(self) -> anyhow::Result<Command> {
        let status: CommandStatus = serde_json::from_value(serde_json::Value::String(self.status))?;
        Ok(Command {
            id: self.id,
            kind: self.kind.0,
            selector: self.selector.parse()?,
            targets: self.targets.0,
            status,
            created_at: self.created_at,
            scheduled_for: self.scheduled_for,
            executed_at: self.executed_at,
            completed_at: self.completed_at,
            results: self.results.0,
        })
    }
}

/// Insert a command or overwrite its mutable columns.
pub async fn upsert_command(pool: &PgPool, command: &Command) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commands
            (id, command, kind, selector, targets, status, created_at, scheduled_for,
             executed_at, completed_at, results)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE
            SET status = $6, executed_at = $9, completed_at = $10, results = $11
        "#,
    )
    .bind(command.id)
    .bind(command.kind.name())
    .bind(Json(&command.kind))
    .bind(command.selector.to_string())
    .bind(Json(&command.targets))
    .bind(command.status.as_str())
    .bind(command.created_at)
    .bind(command.scheduled_for)
    .bind(command.executed_at)
    .bind(command.completed_at)
    .bind(Json(&command.results))
    .execute(pool)
    .await?;

    Ok(())
}

/// Pending commands in creation order.
pub async fn load_pending(pool: &PgPool) -> anyhow::Result<Vec<Command>> {
    let rows = sqlx::query_as::<_, CommandRow>(
        r#"
        SELECT id, kind, selector, targets, status, created_at, scheduled_for,
               executed_at, completed_at, results
        FROM commands
        WHERE status = 'pending'
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(CommandRow::into_command).collect()
}

/// Commands left `executing` by a previous process cannot be resumed safely.
pub async fn fail_interrupted(pool: &PgPool) -> anyhow::Result<u64> {
    let result = sqlx::query(
        "UPDATE commands SET status = 'failed', completed_at = $1 WHERE status = 'executing'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_command(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Command>> {
    let row = sqlx::query_as::<_, CommandRow>(
        r#"
        SELECT id, kind, selector, targets, status, created_at, scheduled_for,
               executed_at, completed_at, results
        FROM commands
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(CommandRow::into_command).transpose()
}
