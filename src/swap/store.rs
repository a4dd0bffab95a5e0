use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, params};

use super::{SwapArtifacts, SwapEvent, SwapHash, SwapRecord, SwapState, UnchargeContract};

/// Durable swap persistence. Each running swap only writes its own record.
pub trait SwapStore: Send + Sync {
    fn create_swap(&self, record: &SwapRecord) -> Result<()>;

    /// Stores the record's state and artifacts and appends the events not yet
    /// persisted, in one transaction.
    fn save_swap(&self, record: &SwapRecord) -> Result<()>;

    fn get_swap(&self, hash: &SwapHash) -> Result<Option<SwapRecord>>;

    fn fetch_swaps(&self) -> Result<Vec<SwapRecord>>;

    fn fetch_pending_swaps(&self) -> Result<Vec<SwapRecord>>;
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_swaps(conn: &Connection, filter: Filter<'_>) -> Result<Vec<SwapRecord>> {
    let (sql, args): (&str, Vec<String>) = match filter {
        Filter::All => (
            "SELECT hash, contract_json, artifacts_json FROM swaps ORDER BY created_seq",
            vec![],
        ),
        Filter::Pending => (
            "SELECT hash, contract_json, artifacts_json FROM swaps \
             WHERE state IN (?1, ?2, ?3, ?4) ORDER BY created_seq",
            SwapState::PENDING
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
        ),
        Filter::Hash(hash) => (
            "SELECT hash, contract_json, artifacts_json FROM swaps WHERE hash = ?1",
            vec![hash.to_hex()],
        ),
    };

    let mut stmt = conn.prepare(sql).context("prepare load swaps")?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .context("query swaps")?;

    let mut out = Vec::new();
    for row in rows {
        let (hash, contract_json, artifacts_json) = row.context("read swap row")?;
        let hash: SwapHash = hash.parse().context("parse swap hash column")?;
        let contract: UnchargeContract = serde_json::from_str(&contract_json)
            .with_context(|| format!("decode contract of swap {hash}"))?;
        let artifacts: SwapArtifacts = serde_json::from_str(&artifacts_json)
            .with_context(|| format!("decode artifacts of swap {hash}"))?;
        let events = load_events(conn, &hash)?;
        out.push(SwapRecord {
            hash,
            contract,
            artifacts,
            events,
        });
    }
    Ok(out)
}

enum Filter<'a> {
    All,
    Pending,
    Hash(&'a SwapHash),
}

impl SwapStore for SqliteStore {
    fn create_swap(&self, record: &SwapRecord) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("begin create swap")?;
        tx.execute(
            r#"
INSERT INTO swaps (hash, state, contract_json, artifacts_json)
VALUES (?1, ?2, ?3, ?4)
"#,
            params![
                record.hash.to_hex(),
                record.state().as_str(),
                serde_json::to_string(&record.contract).context("encode contract")?,
                serde_json::to_string(&record.artifacts).context("encode artifacts")?,
            ],
        )
        .with_context(|| format!("insert swap {}", record.hash))?;
        insert_events(&tx, &record.hash, &record.events, 0)?;
        tx.commit()
            .with_context(|| format!("commit swap {}", record.hash))?;
        Ok(())
    }

    fn save_swap(&self, record: &SwapRecord) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("begin save swap")?;
        let rows = tx
            .execute(
                "UPDATE swaps SET state = ?2, artifacts_json = ?3 WHERE hash = ?1",
                params![
                    record.hash.to_hex(),
                    record.state().as_str(),
                    serde_json::to_string(&record.artifacts).context("encode artifacts")?,
                ],
            )
            .with_context(|| format!("update swap {}", record.hash))?;
        anyhow::ensure!(rows == 1, "swap not found: {}", record.hash);

        let stored: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM swap_events WHERE hash = ?1",
                params![record.hash.to_hex()],
                |row| row.get(0),
            )
            .with_context(|| format!("count events of swap {}", record.hash))?;
        let stored = usize::try_from(stored).context("negative event count")?;
        anyhow::ensure!(
            stored <= record.events.len(),
            "swap {} has {stored} stored events but only {} in memory",
            record.hash,
            record.events.len()
        );
        insert_events(&tx, &record.hash, &record.events[stored..], stored)?;

        tx.commit()
            .with_context(|| format!("commit swap {}", record.hash))?;
        Ok(())
    }

    fn get_swap(&self, hash: &SwapHash) -> Result<Option<SwapRecord>> {
        let conn = self.conn();
        let mut swaps =
            load_swaps(&conn, Filter::Hash(hash)).with_context(|| format!("get swap {hash}"))?;
        Ok(swaps.pop())
    }

    fn fetch_swaps(&self) -> Result<Vec<SwapRecord>> {
        let conn = self.conn();
        load_swaps(&conn, Filter::All)
    }

    fn fetch_pending_swaps(&self) -> Result<Vec<SwapRecord>> {
        let conn = self.conn();
        load_swaps(&conn, Filter::Pending)
    }
}

fn insert_events(
    conn: &Connection,
    hash: &SwapHash,
    events: &[SwapEvent],
    first_seq: usize,
) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO swap_events (hash, seq, state, height, time) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .context("prepare insert event")?;
    for (i, event) in events.iter().enumerate() {
        let seq = i64::try_from(first_seq + i).context("event seq overflow")?;
        let time = i64::try_from(event.time).context("event time overflow")?;
        stmt.execute(params![
            hash.to_hex(),
            seq,
            event.state.as_str(),
            event.height,
            time
        ])
        .with_context(|| format!("insert event {seq} of swap {hash}"))?;
    }
    Ok(())
}

fn load_events(conn: &Connection, hash: &SwapHash) -> Result<Vec<SwapEvent>> {
    let mut stmt = conn
        .prepare("SELECT state, height, time FROM swap_events WHERE hash = ?1 ORDER BY seq")
        .context("prepare load events")?;
    let rows = stmt
        .query_map(params![hash.to_hex()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .with_context(|| format!("query events of swap {hash}"))?;

    let mut out = Vec::new();
    for row in rows {
        let (state, height, time) = row.context("read event row")?;
        out.push(SwapEvent {
            state: state.parse()?,
            height: u32::try_from(height)
                .map_err(|_| anyhow::anyhow!("invalid event height {height}"))?,
            time: u64::try_from(time).map_err(|_| anyhow::anyhow!("invalid event time {time}"))?,
        });
    }
    Ok(out)
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  created_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL UNIQUE,
  state TEXT NOT NULL,
  contract_json TEXT NOT NULL,
  artifacts_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_state_idx ON swaps(state);
CREATE TABLE IF NOT EXISTS swap_events (
  hash TEXT NOT NULL REFERENCES swaps(hash),
  seq INTEGER NOT NULL,
  state TEXT NOT NULL,
  height INTEGER NOT NULL,
  time INTEGER NOT NULL,
  PRIMARY KEY (hash, seq)
);
"#,
    )
    .context("create tables")?;
    Ok(())
}
