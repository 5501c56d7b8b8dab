//! SQLite-backed local store

use super::{LocalStore, SEARCH_LIMIT};
use crate::comparison::{ChartStyle, Comparison, Instrument, TechnicalSet};
use crate::error::{ChartError, Result};
use crate::types::{date_to_int, int_to_date, Bar, ComparisonId, StockId};
use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> ChartError {
    move |e| ChartError::Store(format!("{}: {}", context, e))
}

fn date_from_column(value: i64) -> NaiveDate {
    int_to_date(value).unwrap_or(NaiveDate::MIN)
}

/// Local store with SQLite backend
///
/// The connection is shared behind a mutex and every query runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open database at path
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(db_err("Failed to open database"))?;
        Self::from_connection(conn)
    }

    /// Create in-memory database (for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(db_err("Failed to create in-memory database"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ChartError::Store("Connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ChartError::Store(format!("Store task failed: {}", e)))?
    }

    /// Number of cached bars for a stock
    pub async fn bar_count(&self, stock_id: StockId) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM history WHERE stock_id = ?1",
                params![stock_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count as usize)
            .map_err(db_err("Failed to count bars"))
        })
        .await
    }
}

/// Create database tables
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stock (
            stock_id INTEGER PRIMARY KEY,
            ticker TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            start_date INTEGER NOT NULL,
            has_fundamentals INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS history (
            stock_id INTEGER NOT NULL,
            date INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            adj_close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (stock_id, date)
        );
        CREATE TABLE IF NOT EXISTS comparison (
            comparison_id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS comparison_stock (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            comparison_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            stock_id INTEGER NOT NULL,
            ticker TEXT NOT NULL,
            name TEXT NOT NULL,
            start_date INTEGER NOT NULL,
            has_fundamentals INTEGER NOT NULL,
            chart_style INTEGER NOT NULL,
            up_color TEXT NOT NULL,
            down_color TEXT NOT NULL,
            technicals TEXT NOT NULL,
            fundamentals TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_comparison_stock ON comparison_stock(comparison_id);",
    )
    .map_err(db_err("Failed to create tables"))
}

fn listing_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instrument> {
    let stock_id: i64 = row.get(0)?;
    let ticker: String = row.get(1)?;
    let name: String = row.get(2)?;
    let start_date = date_from_column(row.get(3)?);
    let has_fundamentals: bool = row.get(4)?;

    let listing = Instrument::new(stock_id, &ticker, &name, start_date);
    Ok(if has_fundamentals {
        listing
    } else {
        listing.without_fundamentals()
    })
}

fn instrument_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ComparisonId, Instrument)> {
    let comparison_id: i64 = row.get(0)?;
    let instrument = Instrument {
        id: Some(row.get(1)?),
        stock_id: row.get(2)?,
        ticker: row.get(3)?,
        name: row.get(4)?,
        start_date: date_from_column(row.get(5)?),
        has_fundamentals: row.get(6)?,
        style: ChartStyle::from_code(row.get(7)?),
        up_color: row.get(8)?,
        down_color: row.get(9)?,
        technicals: TechnicalSet::from_list(&row.get::<_, String>(10)?),
        fundamental_keys: Instrument::parse_fundamental_list(&row.get::<_, String>(11)?),
    };
    Ok((comparison_id, instrument))
}

fn delete_comparison_rows(conn: &Connection, id: ComparisonId) -> Result<()> {
    conn.execute(
        "DELETE FROM comparison_stock WHERE comparison_id = ?1",
        params![id],
    )
    .map_err(db_err("Failed to delete comparison stocks"))?;
    conn.execute(
        "DELETE FROM comparison WHERE comparison_id = ?1",
        params![id],
    )
    .map_err(db_err("Failed to delete comparison"))?;
    Ok(())
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn load_bars(&self, stock_id: StockId, since: NaiveDate) -> Result<Vec<Bar>> {
        let since = date_to_int(since);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT date, open, high, low, close, adj_close, volume
                     FROM history WHERE stock_id = ?1 AND date >= ?2
                     ORDER BY date DESC",
                )
                .map_err(db_err("Failed to prepare bar query"))?;

            let rows = stmt
                .query_map(params![stock_id, since], |row| {
                    let date: i64 = row.get(0)?;
                    let mut bar = Bar::new(
                        date_from_column(date),
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(6)?,
                    );
                    bar.adj_close = row.get(5)?;
                    Ok(bar)
                })
                .map_err(db_err("Failed to query bars"))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Failed to read bar row"))
        })
        .await
    }

    async fn save_bars(&self, stock_id: StockId, bars: &[Bar]) -> Result<()> {
        let bars = bars.to_vec();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(db_err("Failed to begin transaction"))?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR REPLACE INTO history
                         (stock_id, date, open, high, low, close, adj_close, volume)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    )
                    .map_err(db_err("Failed to prepare bar insert"))?;
                for bar in &bars {
                    stmt.execute(params![
                        stock_id,
                        bar.date_int(),
                        bar.open,
                        bar.high,
                        bar.low,
                        bar.close,
                        bar.adj_close,
                        bar.volume,
                    ])
                    .map_err(db_err("Failed to insert bar"))?;
                }
            }
            tx.commit().map_err(db_err("Failed to commit bars"))
        })
        .await
    }

    async fn save_listing(&self, listing: &Instrument) -> Result<StockId> {
        let listing = listing.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO stock (ticker, name, start_date, has_fundamentals)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ticker) DO UPDATE SET
                    name = excluded.name,
                    start_date = excluded.start_date,
                    has_fundamentals = excluded.has_fundamentals",
                params![
                    listing.ticker,
                    listing.name,
                    date_to_int(listing.start_date),
                    listing.has_fundamentals,
                ],
            )
            .map_err(db_err("Failed to save listing"))?;

            conn.query_row(
                "SELECT stock_id FROM stock WHERE ticker = ?1",
                params![listing.ticker],
                |row| row.get(0),
            )
            .map_err(db_err("Failed to read listing id"))
        })
        .await
    }

    async fn search_instruments(&self, text: &str) -> Result<Vec<Instrument>> {
        let text = text.trim().to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT stock_id, ticker, name, start_date, has_fundamentals FROM stock
                     WHERE ticker LIKE ?1 || '%' OR name LIKE '%' || ?2 || '%'
                     ORDER BY (ticker = ?1) DESC, ticker
                     LIMIT ?3",
                )
                .map_err(db_err("Failed to prepare search"))?;

            let rows = stmt
                .query_map(
                    params![text.to_uppercase(), text, SEARCH_LIMIT as i64],
                    listing_from_row,
                )
                .map_err(db_err("Failed to search instruments"))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err("Failed to read listing row"))
        })
        .await
    }

    async fn load_comparisons(&self) -> Result<Vec<Comparison>> {
        self.with_conn(|conn| {
            let mut comparisons: Vec<Comparison> = {
                let mut stmt = conn
                    .prepare("SELECT comparison_id, title FROM comparison ORDER BY comparison_id")
                    .map_err(db_err("Failed to prepare comparison query"))?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Comparison {
                            id: Some(row.get(0)?),
                            title: row.get(1)?,
                            ..Comparison::default()
                        })
                    })
                    .map_err(db_err("Failed to query comparisons"))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err("Failed to read comparison row"))?
            };

            let mut stmt = conn
                .prepare(
                    "SELECT comparison_id, id, stock_id, ticker, name, start_date,
                            has_fundamentals, chart_style, up_color, down_color,
                            technicals, fundamentals
                     FROM comparison_stock ORDER BY comparison_id, position",
                )
                .map_err(db_err("Failed to prepare comparison stock query"))?;
            let rows = stmt
                .query_map([], instrument_from_row)
                .map_err(db_err("Failed to query comparison stocks"))?;

            for row in rows {
                let (comparison_id, instrument) =
                    row.map_err(db_err("Failed to read comparison stock row"))?;
                match comparisons.iter_mut().find(|c| c.id == Some(comparison_id)) {
                    Some(comparison) => comparison.instruments.push(instrument),
                    None => log::warn!(
                        "Comparison stock {} references missing comparison {}",
                        instrument.ticker,
                        comparison_id
                    ),
                }
            }
            Ok(comparisons)
        })
        .await
    }

    async fn save_comparison(&self, comparison: &Comparison) -> Result<Comparison> {
        let mut saved = comparison.clone();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(db_err("Failed to begin transaction"))?;

            if saved.instruments.is_empty() {
                if let Some(id) = saved.id.take() {
                    delete_comparison_rows(&tx, id)?;
                }
                tx.commit().map_err(db_err("Failed to commit comparison"))?;
                return Ok(saved);
            }

            saved.refresh_title();
            let comparison_id = match saved.id {
                Some(id) => {
                    tx.execute(
                        "UPDATE comparison SET title = ?1 WHERE comparison_id = ?2",
                        params![saved.title, id],
                    )
                    .map_err(db_err("Failed to update comparison"))?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO comparison (title) VALUES (?1)",
                        params![saved.title],
                    )
                    .map_err(db_err("Failed to insert comparison"))?;
                    tx.last_insert_rowid()
                }
            };
            saved.id = Some(comparison_id);

            tx.execute(
                "DELETE FROM comparison_stock WHERE comparison_id = ?1",
                params![comparison_id],
            )
            .map_err(db_err("Failed to clear comparison stocks"))?;

            for (position, instrument) in saved.instruments.iter_mut().enumerate() {
                tx.execute(
                    "INSERT INTO comparison_stock
                     (id, comparison_id, position, stock_id, ticker, name, start_date,
                      has_fundamentals, chart_style, up_color, down_color, technicals, fundamentals)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        instrument.id,
                        comparison_id,
                        position as i64,
                        instrument.stock_id,
                        instrument.ticker,
                        instrument.name,
                        date_to_int(instrument.start_date),
                        instrument.has_fundamentals,
                        instrument.style.code(),
                        instrument.up_color,
                        instrument.down_color,
                        instrument.technicals.to_list(),
                        instrument.fundamental_list(),
                    ],
                )
                .map_err(db_err("Failed to insert comparison stock"))?;
                if instrument.id.is_none() {
                    instrument.id = Some(tx.last_insert_rowid());
                }
            }

            tx.commit().map_err(db_err("Failed to commit comparison"))?;
            Ok(saved)
        })
        .await
    }

    async fn delete_comparison(&self, id: ComparisonId) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(db_err("Failed to begin transaction"))?;
            delete_comparison_rows(&tx, id)?;
            tx.commit().map_err(db_err("Failed to commit delete"))
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bars(newest: NaiveDate, count: i64) -> Vec<Bar> {
        (0..count)
            .map(|i| Bar::new(newest - Duration::days(i), 10.0, 11.0, 9.0, 10.5, 1000.0))
            .collect()
    }

    #[tokio::test]
    async fn test_save_and_load_bars() {
        let store = SqliteStore::new_in_memory().unwrap();
        store.save_bars(7, &bars(date(2024, 3, 10), 10)).await.unwrap();

        let loaded = store.load_bars(7, date(2024, 3, 5)).await.unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded[0].date, date(2024, 3, 10));
        assert_eq!(loaded[5].date, date(2024, 3, 5));
        assert!(store.load_bars(8, date(2000, 1, 1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_bars_is_idempotent() {
        let store = SqliteStore::new_in_memory().unwrap();
        let batch = bars(date(2024, 3, 10), 5);
        store.save_bars(1, &batch).await.unwrap();
        store.save_bars(1, &batch).await.unwrap();
        assert_eq!(store.bar_count(1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_search_instruments() {
        let store = SqliteStore::new_in_memory().unwrap();
        let aapl = Instrument::new(0, "AAPL", "Apple Inc.", date(1980, 12, 12));
        let aal = Instrument::new(0, "AAL", "American Airlines", date(2013, 12, 9));
        let spy = Instrument::new(0, "SPY", "SPDR S&P 500 ETF", date(1993, 1, 29)).without_fundamentals();
        for listing in [&aapl, &aal, &spy] {
            store.save_listing(listing).await.unwrap();
        }

        let found = store.search_instruments("aa").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].ticker, "AAL");

        let by_name = store.search_instruments("Airlines").await.unwrap();
        assert_eq!(by_name.len(), 1);

        let spy_found = store.search_instruments("SPY").await.unwrap();
        assert!(!spy_found[0].has_fundamentals);
        assert!(spy_found[0].fundamental_keys.is_empty());
    }

    #[tokio::test]
    async fn test_comparison_lifecycle() {
        let store = SqliteStore::new_in_memory().unwrap();
        let mut comparison = Comparison::new();
        comparison.add(Instrument::new(1, "AAPL", "Apple Inc.", date(1980, 12, 12)));
        comparison.add(
            Instrument::new(2, "MSFT", "Microsoft", date(1986, 3, 13)).with_style(ChartStyle::Candle),
        );

        let saved = store.save_comparison(&comparison).await.unwrap();
        let id = saved.id.expect("comparison id");
        assert!(saved.instruments.iter().all(|i| i.id.is_some()));

        let loaded = store.load_comparisons().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title, "AAPL MSFT");
        assert_eq!(loaded[0].instruments[1].style, ChartStyle::Candle);
        assert_eq!(loaded[0].instruments, saved.instruments);

        // Removing an instrument keeps the other's id stable
        let mut edited = saved.clone();
        edited.remove("AAPL");
        let resaved = store.save_comparison(&edited).await.unwrap();
        assert_eq!(resaved.id, Some(id));
        assert_eq!(resaved.instruments[0].id, saved.instruments[1].id);

        // Last instrument removed deletes the comparison
        edited.remove("MSFT");
        let emptied = store.save_comparison(&edited).await.unwrap();
        assert!(emptied.id.is_none());
        assert!(store.load_comparisons().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("charts.db");
        {
            let store = SqliteStore::new(&path).unwrap();
            store.save_bars(3, &bars(date(2024, 1, 5), 3)).await.unwrap();
        }
        let reopened = SqliteStore::new(&path).unwrap();
        assert_eq!(reopened.bar_count(3).await.unwrap(), 3);

        reopened.delete_comparison(99).await.unwrap();
    }
}
