//! Interactive sync client demo: add notes from a terminal, have them
//! pushed to a Syncular server and pulled back down. Mirrors the shape of
//! the teacher's `interactive_client.rs` (CLI flags, a local SQLite file
//! under `databases/`, a loop reading commands from stdin) adapted to the
//! commit/push/pull protocol instead of whole-document patches.

use std::io::{self, BufRead, Write as _};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use syncular::{ChangeApplier, EngineConfig, SyncEngine};
use syncular_client::ClientDatabase;
use syncular_core::models::{Op, PendingOperation};
use syncular_core::protocol::ChangeWire;
use syncular_core::SyncResult;

#[derive(Parser)]
#[command(name = "syncular-demo")]
#[command(about = "Add notes locally and watch them sync", long_about = None)]
struct Cli {
    /// Database file name (created under databases/ if missing).
    #[arg(short, long, default_value = "alice")]
    database: String,

    /// Server HTTP base URL.
    #[arg(long, default_value = "http://localhost:4000")]
    server: String,

    /// Server websocket URL; omit to run in polling mode.
    #[arg(long)]
    ws: Option<String>,

    /// API key/secret pair issued by the server.
    #[arg(long, default_value = "demo_key")]
    api_key: String,
    #[arg(long, default_value = "demo_secret")]
    api_secret: String,
}

struct NotesApplier;

#[async_trait]
impl ChangeApplier for NotesApplier {
    async fn apply_change(&self, conn: &mut SqliteConnection, change: &ChangeWire) -> SyncResult<()> {
        match change.op {
            Op::Upsert => {
                let body = change
                    .row_json
                    .as_ref()
                    .and_then(|v| v.get("body"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                sqlx::query("INSERT INTO notes (id, body) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET body = excluded.body")
                    .bind(&change.row_id)
                    .bind(body)
                    .execute(conn)
                    .await?;
            }
            Op::Delete => {
                sqlx::query("DELETE FROM notes WHERE id = ?1")
                    .bind(&change.row_id)
                    .execute(conn)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_snapshot_row(
        &self,
        conn: &mut SqliteConnection,
        table: &str,
        row: &serde_json::Value,
    ) -> SyncResult<()> {
        if table != "notes" {
            return Ok(());
        }
        let id = row.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        let body = row.get("body").and_then(|v| v.as_str()).unwrap_or_default();
        sqlx::query("INSERT INTO notes (id, body) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET body = excluded.body")
            .bind(id)
            .bind(body)
            .execute(conn)
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let cli = Cli::parse();

    std::fs::create_dir_all("databases")?;
    let db_file = format!("databases/{}.sqlite3", cli.database);
    let db_url = format!("sqlite:{}?mode=rwc", db_file);

    println!("syncular demo -- database: {}", db_file);

    let db = ClientDatabase::new(&db_url).await?;
    db.run_migrations().await?;
    sqlx::query("CREATE TABLE IF NOT EXISTS notes (id TEXT PRIMARY KEY, body TEXT NOT NULL)")
        .execute(&db.pool)
        .await?;

    let config = EngineConfig {
        database_url: db_url,
        http_url: cli.server,
        ws_url: cli.ws,
        api_key: cli.api_key,
        api_secret: cli.api_secret,
        schema_version: 1,
        subscriptions: vec![],
        poll_interval_secs: Some(10),
    };

    let engine = SyncEngine::new(config, Arc::new(NotesApplier)).await?;
    engine.start()?;

    println!("commands: add <text> | list | sync | state | quit");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.splitn(2, ' ');
        match parts.next().unwrap_or("").trim() {
            "add" => {
                let body = parts.next().unwrap_or("").to_string();
                engine
                    .apply_local_mutation(vec![PendingOperation {
                        table: "notes".into(),
                        row_id: Uuid::new_v4().to_string(),
                        op: Op::Upsert,
                        payload: Some(serde_json::json!({ "body": body })),
                        base_version: None,
                    }])
                    .await?;
                println!("queued");
            }
            "list" => {
                let rows = sqlx::query("SELECT id, body FROM notes ORDER BY rowid")
                    .fetch_all(&db.pool)
                    .await?;
                for row in rows {
                    let id: String = row.try_get("id")?;
                    let body: String = row.try_get("body")?;
                    println!("{id}: {body}");
                }
            }
            "sync" => {
                engine.sync().await?;
                println!("synced");
            }
            "state" => {
                println!("{:?}", engine.state().await);
            }
            "quit" => break,
            "" => {}
            other => println!("unknown command: {other}"),
        }
        print!("> ");
        io::stdout().flush()?;
    }

    engine.destroy();
    Ok(())
}
