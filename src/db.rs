use std::path::Path;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::PersistenceError;
use crate::model::{CategoryNode, Detection, Product, Review};

pub type DbResult<T> = std::result::Result<T, PersistenceError>;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> DbResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id            TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            url           TEXT NOT NULL,
            parent_id     TEXT REFERENCES categories(id),
            depth         INTEGER NOT NULL,
            first_seen_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id);

        CREATE TABLE IF NOT EXISTS products (
            id               TEXT PRIMARY KEY,
            url              TEXT NOT NULL,
            category_id      TEXT NOT NULL REFERENCES categories(id),
            title            TEXT NOT NULL,
            description      TEXT,
            brand            TEXT,
            price            TEXT NOT NULL,
            currency_code    TEXT NOT NULL,
            discount_percent INTEGER CHECK(discount_percent BETWEEN 0 AND 100),
            rating           REAL,
            review_count     INTEGER,
            answer_count     INTEGER,
            scraped_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_products_category ON products(category_id);

        -- One row per product visit; products keeps only the latest values
        CREATE TABLE IF NOT EXISTS price_history (
            id               INTEGER PRIMARY KEY,
            product_id       TEXT NOT NULL REFERENCES products(id),
            price            TEXT NOT NULL,
            currency_code    TEXT NOT NULL,
            discount_percent INTEGER,
            scraped_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_price_history_product ON price_history(product_id);

        CREATE TABLE IF NOT EXISTS reviews (
            id                   TEXT PRIMARY KEY,
            product_id           TEXT NOT NULL REFERENCES products(id),
            author               TEXT,
            rating               INTEGER CHECK(rating BETWEEN 1 AND 5),
            title                TEXT,
            attributes           TEXT,
            text                 TEXT NOT NULL,
            posted_at            TEXT,
            language_code        TEXT,
            detection_confidence REAL,
            scraped_at           TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_reviews_product ON reviews(product_id);
        CREATE INDEX IF NOT EXISTS idx_reviews_unenriched ON reviews(language_code) WHERE language_code IS NULL;

        CREATE TABLE IF NOT EXISTS runs (
            id          INTEGER PRIMARY KEY,
            command     TEXT NOT NULL,
            started_at  TEXT NOT NULL DEFAULT (datetime('now')),
            finished_at TEXT,
            categories  INTEGER,
            products    INTEGER,
            reviews     INTEGER,
            enriched    INTEGER,
            skipped     INTEGER
        );

        CREATE TABLE IF NOT EXISTS skipped_records (
            id          INTEGER PRIMARY KEY,
            run_id      INTEGER REFERENCES runs(id),
            kind        TEXT NOT NULL CHECK(kind IN ('category','product','reviews','enrichment')),
            key         TEXT NOT NULL,
            reason      TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;
    Ok(())
}

// ── Catalog ──

/// Insert a category. An existing row keeps its parent; only name and url follow the latest visit.
pub fn upsert_category(conn: &Connection, node: &CategoryNode) -> DbResult<()> {
    conn.execute(
        "INSERT INTO categories (id, name, url, parent_id, depth)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, url = excluded.url",
        params![node.id, node.name, node.url, node.parent_id, node.depth],
    )?;
    Ok(())
}

/// Last write wins on the product row; every visit adds a price point.
pub fn upsert_product(conn: &Connection, p: &Product) -> DbResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO products
         (id, url, category_id, title, description, brand, price, currency_code,
          discount_percent, rating, review_count, answer_count, scraped_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
         ON CONFLICT(id) DO UPDATE SET
            url = excluded.url,
            category_id = excluded.category_id,
            title = excluded.title,
            description = excluded.description,
            brand = excluded.brand,
            price = excluded.price,
            currency_code = excluded.currency_code,
            discount_percent = excluded.discount_percent,
            rating = excluded.rating,
            review_count = excluded.review_count,
            answer_count = excluded.answer_count,
            scraped_at = excluded.scraped_at",
        params![
            p.id, p.url, p.category_id, p.title, p.description, p.brand,
            p.price.to_string(), p.currency_code, p.discount_percent, p.rating,
            p.review_count, p.answer_count, p.scraped_at,
        ],
    )?;
    tx.execute(
        "INSERT INTO price_history (product_id, price, currency_code, discount_percent, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![p.id, p.price.to_string(), p.currency_code, p.discount_percent, p.scraped_at],
    )?;
    tx.commit()?;
    Ok(())
}

// ── Reviews ──

/// Upsert a review. A stored language is kept when the new copy is not enriched.
pub fn upsert_review(conn: &Connection, r: &Review) -> DbResult<()> {
    conn.execute(
        "INSERT INTO reviews
         (id, product_id, author, rating, title, attributes, text, posted_at,
          language_code, detection_confidence)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
         ON CONFLICT(id) DO UPDATE SET
            author = excluded.author,
            rating = excluded.rating,
            title = excluded.title,
            attributes = excluded.attributes,
            text = excluded.text,
            posted_at = excluded.posted_at,
            language_code = COALESCE(excluded.language_code, reviews.language_code),
            detection_confidence = COALESCE(excluded.detection_confidence, reviews.detection_confidence)",
        params![
            r.id, r.product_id, r.author, r.rating, r.title, r.attributes, r.text,
            r.posted_at, r.language_code, r.detection_confidence,
        ],
    )?;
    Ok(())
}

/// Newest stored review date for a product, the cutoff for incremental review crawls.
pub fn latest_review_at(conn: &Connection, product_id: &str) -> DbResult<Option<NaiveDateTime>> {
    let latest = conn.query_row(
        "SELECT MAX(posted_at) FROM reviews WHERE product_id = ?1",
        params![product_id],
        |row| row.get::<_, Option<NaiveDateTime>>(0),
    )?;
    Ok(latest)
}

pub struct UnenrichedReview {
    pub id: String,
    pub text: String,
}

pub fn fetch_unenriched(conn: &Connection, limit: usize) -> DbResult<Vec<UnenrichedReview>> {
    let mut stmt = conn.prepare(
        "SELECT id, text FROM reviews
         WHERE language_code IS NULL AND length(trim(text)) > 0
         ORDER BY rowid
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(UnenrichedReview {
                id: row.get(0)?,
                text: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_review_language(conn: &Connection, review_id: &str, d: &Detection) -> DbResult<()> {
    conn.execute(
        "UPDATE reviews SET language_code = ?2, detection_confidence = ?3 WHERE id = ?1",
        params![review_id, d.language_code, d.confidence],
    )?;
    Ok(())
}

// ── Runs ──

pub struct RunTotals {
    pub categories: usize,
    pub products: usize,
    pub reviews: usize,
    pub enriched: usize,
    pub skipped: usize,
}

pub fn start_run(conn: &Connection, command: &str) -> DbResult<i64> {
    conn.execute("INSERT INTO runs (command) VALUES (?1)", params![command])?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, run_id: i64, t: &RunTotals) -> DbResult<()> {
    conn.execute(
        "UPDATE runs SET finished_at = ?2, categories = ?3, products = ?4, reviews = ?5,
                enriched = ?6, skipped = ?7
         WHERE id = ?1",
        params![
            run_id,
            Utc::now(),
            t.categories as i64,
            t.products as i64,
            t.reviews as i64,
            t.enriched as i64,
            t.skipped as i64,
        ],
    )?;
    Ok(())
}

pub fn record_skip(conn: &Connection, run_id: Option<i64>, kind: &str, key: &str, reason: &str) -> DbResult<()> {
    conn.execute(
        "INSERT INTO skipped_records (run_id, kind, key, reason) VALUES (?1, ?2, ?3, ?4)",
        params![run_id, kind, key, reason],
    )?;
    Ok(())
}

// ── Stats ──

pub struct Stats {
    pub categories: usize,
    pub products: usize,
    pub price_points: usize,
    pub reviews: usize,
    pub enriched: usize,
    pub skipped: usize,
    pub last_run: Option<String>,
}

pub fn get_stats(conn: &Connection) -> DbResult<Stats> {
    let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, usize>(0));
    let categories = count("SELECT COUNT(*) FROM categories")?;
    let products = count("SELECT COUNT(*) FROM products")?;
    let price_points = count("SELECT COUNT(*) FROM price_history")?;
    let reviews = count("SELECT COUNT(*) FROM reviews")?;
    let enriched = count("SELECT COUNT(*) FROM reviews WHERE language_code IS NOT NULL")?;
    let skipped = count("SELECT COUNT(*) FROM skipped_records")?;
    let last_run = conn
        .query_row(
            "SELECT command || ' at ' || started_at FROM runs ORDER BY id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    Ok(Stats {
        categories,
        products,
        price_points,
        reviews,
        enriched,
        skipped,
        last_run,
    })
}

#[cfg(test)]
pub fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    init_schema(&conn).unwrap();
    conn
}
