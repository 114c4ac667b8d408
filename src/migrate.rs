use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index the pipeline needs. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Documents are content addressed: one row per hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            hash TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            filename TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            date INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Metadata and tags keep insertion order and allow duplicates.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_metadata (
            document_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            key_id INTEGER NOT NULL,
            value_id INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_tags (
            document_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            tag_id INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS process_queue (
            document_id INTEGER NOT NULL,
            step TEXT NOT NULL,
            step_order INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            running INTEGER NOT NULL DEFAULT 0,
            requeued INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, step),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before re-queues were tracked lack the flag.
    let has_requeued: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('process_queue') WHERE name = 'requeued'",
    )
    .fetch_one(pool)
    .await?;
    if has_requeued == 0 {
        sqlx::query("ALTER TABLE process_queue ADD COLUMN requeued INTEGER NOT NULL DEFAULT 0")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            stopped_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            rule_order INTEGER NOT NULL,
            kind TEXT NOT NULL,
            filter TEXT NOT NULL,
            action TEXT NOT NULL,
            metadata_key_id INTEGER,
            metadata_value_id INTEGER,
            date_format TEXT,
            tag_id INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_metadata_doc ON document_metadata(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_metadata_pair ON document_metadata(key_id, value_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_document_tags_doc ON document_tags(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_document ON jobs(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_user ON rules(user_id, rule_order)")
        .execute(pool)
        .await?;

    Ok(())
}
