//! SQLite-backed Entity Store: procurement tables, upsert-or-skip writes,
//! and the row-fetch queries the analytics engine reads.

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::debug;

use gosradar_core::{Announcement, Contract, ContractUnit, Lot, PlanPoint, RefEntry, Subject};

pub const CRATE_NAME: &str = "gosradar-store";

const DT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("date/time parse error: {0}")]
    DateParse(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
///
/// The `REFERENCES` clauses document intent only: `foreign_keys` is switched
/// off explicitly (some drivers enable it on fresh connections) so the repair
/// sweep can observe contracts whose `trd_buy_id` has no announcement row
/// yet. Loaders maintain the invariants; the PRIMARY KEY columns are the
/// schema-level backstop against double inserts.
const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = OFF;

CREATE TABLE IF NOT EXISTS subjects (
    bin         TEXT PRIMARY KEY,
    name_ru     TEXT,
    name_kz     TEXT,
    is_customer INTEGER NOT NULL DEFAULT 0,
    is_supplier INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS plans (
    id              INTEGER PRIMARY KEY,
    subject_biin    TEXT,
    ref_enstru_code TEXT,
    ref_units_code  TEXT,
    price           REAL,
    count           REAL,
    amount          REAL,
    date_approved   TEXT,
    kato_code       TEXT
);

CREATE TABLE IF NOT EXISTS announcements (
    id                INTEGER PRIMARY KEY,
    number_anno       TEXT,
    name_ru           TEXT,
    org_bin           TEXT,
    total_sum         REAL,
    publish_date      TEXT,
    start_date        TEXT,
    end_date          TEXT,
    ref_buy_status_id INTEGER
);

CREATE TABLE IF NOT EXISTS lots (
    id                INTEGER PRIMARY KEY,
    trd_buy_id        INTEGER REFERENCES announcements(id),
    lot_number        TEXT,
    name_ru           TEXT,
    amount            REAL,
    count             REAL,
    customer_bin      TEXT,
    ref_lot_status_id INTEGER
);

CREATE TABLE IF NOT EXISTS contracts (
    id                     INTEGER PRIMARY KEY,
    contract_number        TEXT,
    trd_buy_id             INTEGER REFERENCES announcements(id),
    crdate                 TEXT,
    contract_sum           REAL,
    supplier_biin          TEXT,
    customer_bin           TEXT,
    ref_contract_status_id INTEGER
);

CREATE TABLE IF NOT EXISTS contract_units (
    id           INTEGER PRIMARY KEY,
    contract_id  INTEGER NOT NULL REFERENCES contracts(id),
    pln_point_id INTEGER REFERENCES plans(id),
    item_price   REAL,
    quantity     REAL,
    total_sum    REAL
);

CREATE TABLE IF NOT EXISTS ref_units (
    code    TEXT PRIMARY KEY,
    name_ru TEXT,
    name_kz TEXT
);

CREATE TABLE IF NOT EXISTS ref_kato (
    code    TEXT PRIMARY KEY,
    name_ru TEXT,
    name_kz TEXT
);

CREATE TABLE IF NOT EXISTS ref_enstru (
    code    TEXT PRIMARY KEY,
    name_ru TEXT,
    name_kz TEXT
);

CREATE INDEX IF NOT EXISTS plans_subject_idx       ON plans(subject_biin);
CREATE INDEX IF NOT EXISTS plans_enstru_idx        ON plans(ref_enstru_code);
CREATE INDEX IF NOT EXISTS lots_trd_buy_idx        ON lots(trd_buy_id);
CREATE INDEX IF NOT EXISTS contracts_customer_idx  ON contracts(customer_bin);
CREATE INDEX IF NOT EXISTS contracts_trd_buy_idx   ON contracts(trd_buy_id);
CREATE INDEX IF NOT EXISTS units_contract_idx      ON contract_units(contract_id);
CREATE INDEX IF NOT EXISTS units_plan_idx          ON contract_units(pln_point_id);

PRAGMA user_version = 1;
";

fn encode_dt(dt: &NaiveDateTime) -> String {
    dt.format(DT_FORMAT).to_string()
}

fn encode_dt_opt(dt: &Option<NaiveDateTime>) -> Option<String> {
    dt.as_ref().map(encode_dt)
}

fn decode_dt_opt(raw: Option<String>) -> Result<Option<NaiveDateTime>> {
    raw.map(|s| {
        NaiveDateTime::parse_from_str(&s, DT_FORMAT).map_err(|e| Error::DateParse(e.to_string()))
    })
    .transpose()
}

/// The three code→bilingual-name dictionaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dictionary {
    Units,
    Kato,
    Enstru,
}

impl Dictionary {
    fn table(self) -> &'static str {
        match self {
            Dictionary::Units => "ref_units",
            Dictionary::Kato => "ref_kato",
            Dictionary::Enstru => "ref_enstru",
        }
    }
}

// ─── Analytics row types ─────────────────────────────────────────────────────

/// ContractUnit↔PlanPoint join row for the weighted-average computation.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPriceRow {
    pub item_price: f64,
    pub quantity: f64,
    pub contract_id: i64,
}

/// Join row for the IQR fair-price bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub item_price: f64,
    pub contract_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YearlyVolumeRow {
    pub year: i32,
    pub total_quantity: f64,
    pub sample_contract_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyPriceRow {
    pub year: i32,
    pub month: u32,
    pub average_price: f64,
    pub purchase_count: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractRow {
    pub id: i64,
    pub contract_number: Option<String>,
    pub crdate: Option<NaiveDateTime>,
    pub contract_sum: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub subjects: usize,
    pub plans: usize,
    pub announcements: usize,
    pub lots: usize,
    pub contracts: usize,
    pub contract_units: usize,
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// The procurement store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted. All writes
/// are upsert-or-skip keyed by the upstream ids, so re-running any loader
/// over already-seen data neither duplicates nor errors.
#[derive(Clone)]
pub struct ProcurementStore {
    conn: tokio_rusqlite::Connection,
}

impl ProcurementStore {
    /// Open (or create) a store at `path` and run schema initialisation.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory store — useful for testing.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // ── Subjects ──────────────────────────────────────────────────────────────

    /// Create-or-enrich a subject row. Existing non-null names are never
    /// overwritten; the customer/supplier flags only ever turn on.
    pub async fn upsert_subject(&self, subject: Subject) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subjects (bin, name_ru, name_kz, is_customer, is_supplier)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(bin) DO UPDATE SET
                       name_ru     = COALESCE(subjects.name_ru, excluded.name_ru),
                       name_kz     = COALESCE(subjects.name_kz, excluded.name_kz),
                       is_customer = MAX(subjects.is_customer, excluded.is_customer),
                       is_supplier = MAX(subjects.is_supplier, excluded.is_supplier)",
                    rusqlite::params![
                        subject.bin,
                        subject.name_ru,
                        subject.name_kz,
                        subject.is_customer as i64,
                        subject.is_supplier as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_subject(&self, bin: &str) -> Result<Option<Subject>> {
        let bin = bin.to_owned();
        let subject = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                Ok(conn
                    .query_row(
                        "SELECT bin, name_ru, name_kz, is_customer, is_supplier
                         FROM subjects WHERE bin = ?1",
                        rusqlite::params![bin],
                        |row| {
                            Ok(Subject {
                                bin: row.get(0)?,
                                name_ru: row.get(1)?,
                                name_kz: row.get(2)?,
                                is_customer: row.get::<_, i64>(3)? != 0,
                                is_supplier: row.get::<_, i64>(4)? != 0,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?;
        Ok(subject)
    }

    /// BINs of subjects with no Russian display name yet, for the
    /// name-enrichment pass.
    pub async fn subjects_missing_names(&self) -> Result<Vec<String>> {
        let bins = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT bin FROM subjects WHERE name_ru IS NULL ORDER BY bin")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(bins)
    }

    // ── Plans ─────────────────────────────────────────────────────────────────

    /// Insert a batch of plan points in one transaction, skipping ids that
    /// already exist. Returns how many rows were actually added.
    pub async fn upsert_plans(&self, plans: Vec<PlanPoint>) -> Result<usize> {
        if plans.is_empty() {
            return Ok(0);
        }
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut added = 0usize;
                for plan in &plans {
                    added += tx.execute(
                        "INSERT INTO plans
                           (id, subject_biin, ref_enstru_code, ref_units_code,
                            price, count, amount, date_approved, kato_code)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(id) DO NOTHING",
                        rusqlite::params![
                            plan.id,
                            plan.subject_biin,
                            plan.ref_enstru_code,
                            plan.ref_units_code,
                            plan.price,
                            plan.count,
                            plan.amount,
                            encode_dt_opt(&plan.date_approved),
                            plan.kato_code,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(added)
            })
            .await?;
        debug!(added, "plan batch upserted");
        Ok(added)
    }

    pub async fn plan_ids_for_subject(&self, bin: &str) -> Result<HashSet<i64>> {
        let bin = bin.to_owned();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id FROM plans WHERE subject_biin = ?1")?;
                let rows = stmt
                    .query_map(rusqlite::params![bin], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<i64>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    /// The full valid-plan-id set used to null out dangling `pln_point_id`s.
    pub async fn all_plan_ids(&self) -> Result<HashSet<i64>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM plans")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<i64>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    /// Distinct KTRU codes with no `ref_enstru` description yet, each with a
    /// sample plan id whose detail endpoint can resolve the name.
    pub async fn enstru_codes_missing_descriptions(&self) -> Result<Vec<(String, i64)>> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT ref_enstru_code, MAX(id)
                     FROM plans
                     WHERE ref_enstru_code IS NOT NULL
                       AND ref_enstru_code NOT IN (SELECT code FROM ref_enstru)
                     GROUP BY ref_enstru_code
                     ORDER BY ref_enstru_code",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    // ── Announcements + lots ──────────────────────────────────────────────────

    pub async fn announcement_exists(&self, id: i64) -> Result<bool> {
        let exists = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension as _;
                Ok(conn
                    .query_row(
                        "SELECT 1 FROM announcements WHERE id = ?1",
                        rusqlite::params![id],
                        |_| Ok(true),
                    )
                    .optional()?
                    .unwrap_or(false))
            })
            .await?;
        Ok(exists)
    }

    /// Write an announcement, its lots, and the subjects they reference in a
    /// single transaction, so a failed backfill leaves nothing behind.
    pub async fn upsert_announcement_with_lots(
        &self,
        announcement: Announcement,
        lots: Vec<Lot>,
        subjects: Vec<Subject>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for subject in &subjects {
                    tx.execute(
                        "INSERT INTO subjects (bin, name_ru, name_kz, is_customer, is_supplier)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(bin) DO UPDATE SET
                           name_ru     = COALESCE(subjects.name_ru, excluded.name_ru),
                           name_kz     = COALESCE(subjects.name_kz, excluded.name_kz),
                           is_customer = MAX(subjects.is_customer, excluded.is_customer),
                           is_supplier = MAX(subjects.is_supplier, excluded.is_supplier)",
                        rusqlite::params![
                            subject.bin,
                            subject.name_ru,
                            subject.name_kz,
                            subject.is_customer as i64,
                            subject.is_supplier as i64,
                        ],
                    )?;
                }
                tx.execute(
                    "INSERT INTO announcements
                       (id, number_anno, name_ru, org_bin, total_sum,
                        publish_date, start_date, end_date, ref_buy_status_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO NOTHING",
                    rusqlite::params![
                        announcement.id,
                        announcement.number_anno,
                        announcement.name_ru,
                        announcement.org_bin,
                        announcement.total_sum,
                        encode_dt_opt(&announcement.publish_date),
                        encode_dt_opt(&announcement.start_date),
                        encode_dt_opt(&announcement.end_date),
                        announcement.ref_buy_status_id,
                    ],
                )?;
                for lot in &lots {
                    tx.execute(
                        "INSERT INTO lots
                           (id, trd_buy_id, lot_number, name_ru, amount, count,
                            customer_bin, ref_lot_status_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT(id) DO NOTHING",
                        rusqlite::params![
                            lot.id,
                            lot.trd_buy_id,
                            lot.lot_number,
                            lot.name_ru,
                            lot.amount,
                            lot.count,
                            lot.customer_bin,
                            lot.ref_lot_status_id,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Contract `trd_buy_id` values with no matching announcement row — the
    /// SQL set difference the repair sweep feeds from.
    pub async fn missing_announcement_ids(&self) -> Result<Vec<i64>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT trd_buy_id
                     FROM contracts
                     WHERE trd_buy_id IS NOT NULL
                       AND trd_buy_id NOT IN (SELECT id FROM announcements)
                     ORDER BY trd_buy_id",
                )?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<i64>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    // ── Contracts + units ─────────────────────────────────────────────────────

    /// Insert-or-skip a contract. Returns whether a row was added.
    pub async fn upsert_contract(&self, contract: Contract) -> Result<bool> {
        let added = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO contracts
                       (id, contract_number, trd_buy_id, crdate, contract_sum,
                        supplier_biin, customer_bin, ref_contract_status_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(id) DO NOTHING",
                    rusqlite::params![
                        contract.id,
                        contract.contract_number,
                        contract.trd_buy_id,
                        encode_dt_opt(&contract.crdate),
                        contract.contract_sum,
                        contract.supplier_biin,
                        contract.customer_bin,
                        contract.ref_contract_status_id,
                    ],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(added)
    }

    pub async fn contract_ids_for_customer(&self, bin: &str) -> Result<HashSet<i64>> {
        let bin = bin.to_owned();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id FROM contracts WHERE customer_bin = ?1")?;
                let rows = stmt
                    .query_map(rusqlite::params![bin], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<i64>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    pub async fn contract_unit_ids(&self) -> Result<HashSet<i64>> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM contract_units")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<i64>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(ids)
    }

    /// Insert a batch of contract units in one transaction, skipping ids
    /// that already exist.
    pub async fn upsert_contract_units(&self, units: Vec<ContractUnit>) -> Result<usize> {
        if units.is_empty() {
            return Ok(0);
        }
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut added = 0usize;
                for unit in &units {
                    added += tx.execute(
                        "INSERT INTO contract_units
                           (id, contract_id, pln_point_id, item_price, quantity, total_sum)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(id) DO NOTHING",
                        rusqlite::params![
                            unit.id,
                            unit.contract_id,
                            unit.pln_point_id,
                            unit.item_price,
                            unit.quantity,
                            unit.total_sum,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(added)
            })
            .await?;
        Ok(added)
    }

    // ── Reference dictionaries ────────────────────────────────────────────────

    pub async fn ref_codes(&self, dictionary: Dictionary) -> Result<HashSet<String>> {
        let table = dictionary.table();
        let codes = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT code FROM {table}"))?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<HashSet<String>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(codes)
    }

    /// Insert a dictionary row if its code is unseen. Returns whether a row
    /// was added; existing rows are left untouched so placeholder names can
    /// be replaced only by an explicit enrichment pass.
    pub async fn insert_ref_if_absent(
        &self,
        dictionary: Dictionary,
        entry: RefEntry,
    ) -> Result<bool> {
        let table = dictionary.table();
        let added = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    &format!(
                        "INSERT INTO {table} (code, name_ru, name_kz) VALUES (?1, ?2, ?3)
                         ON CONFLICT(code) DO NOTHING"
                    ),
                    rusqlite::params![entry.code, entry.name_ru, entry.name_kz],
                )?;
                Ok(changed > 0)
            })
            .await?;
        Ok(added)
    }

    // ── Analytics reads ───────────────────────────────────────────────────────

    /// ContractUnit↔PlanPoint join on the item code; price and quantity both
    /// required. Ordered by unit id for deterministic tie-breaking.
    pub async fn unit_price_rows(&self, enstru_code: &str) -> Result<Vec<UnitPriceRow>> {
        let code = enstru_code.to_owned();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cu.item_price, cu.quantity, cu.contract_id
                     FROM contract_units cu
                     JOIN plans p ON cu.pln_point_id = p.id
                     WHERE p.ref_enstru_code = ?1
                       AND cu.item_price IS NOT NULL
                       AND cu.quantity IS NOT NULL
                     ORDER BY cu.id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![code], |row| {
                        Ok(UnitPriceRow {
                            item_price: row.get(0)?,
                            quantity: row.get(1)?,
                            contract_id: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Same join with optional region and contract-year filters.
    pub async fn price_rows(
        &self,
        enstru_code: &str,
        kato_code: Option<&str>,
        year: Option<i32>,
    ) -> Result<Vec<PriceRow>> {
        let code = enstru_code.to_owned();
        let kato = kato_code.map(str::to_owned);
        let rows = self
            .conn
            .call(move |conn| {
                let mut sql = String::from(
                    "SELECT cu.item_price, cu.contract_id
                     FROM contract_units cu
                     JOIN plans p ON cu.pln_point_id = p.id
                     JOIN contracts c ON cu.contract_id = c.id
                     WHERE p.ref_enstru_code = ?
                       AND cu.item_price IS NOT NULL",
                );
                // Bind positionally, growing the parameter list in step with
                // the SQL text.
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&code];
                if let Some(kato) = kato.as_ref() {
                    sql.push_str(" AND p.kato_code = ?");
                    params.push(kato);
                }
                if let Some(year) = year.as_ref() {
                    sql.push_str(" AND CAST(strftime('%Y', c.crdate) AS INTEGER) = ?");
                    params.push(year);
                }
                sql.push_str(" ORDER BY cu.id");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params.as_slice(), |row| {
                        Ok(PriceRow {
                            item_price: row.get(0)?,
                            contract_id: row.get(1)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Yearly quantity totals for one customer and item code, oldest first,
    /// each with a sample contract id for linking.
    pub async fn yearly_volume_rows(
        &self,
        customer_bin: &str,
        enstru_code: &str,
    ) -> Result<Vec<YearlyVolumeRow>> {
        let bin = customer_bin.to_owned();
        let code = enstru_code.to_owned();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT CAST(strftime('%Y', c.crdate) AS INTEGER) AS year,
                            SUM(cu.quantity),
                            MAX(c.id)
                     FROM contracts c
                     JOIN contract_units cu ON c.id = cu.contract_id
                     JOIN plans p ON cu.pln_point_id = p.id
                     WHERE c.customer_bin = ?1
                       AND p.ref_enstru_code = ?2
                       AND c.crdate IS NOT NULL
                       AND cu.quantity IS NOT NULL
                     GROUP BY year
                     ORDER BY year",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![bin, code], |row| {
                        Ok(YearlyVolumeRow {
                            year: row.get(0)?,
                            total_quantity: row.get(1)?,
                            sample_contract_id: row.get(2)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Average paid price and purchase count per contract month for one item
    /// code; rows with unknown dates or non-positive prices are excluded.
    pub async fn monthly_price_rows(&self, enstru_code: &str) -> Result<Vec<MonthlyPriceRow>> {
        let code = enstru_code.to_owned();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT CAST(strftime('%Y', c.crdate) AS INTEGER) AS year,
                            CAST(strftime('%m', c.crdate) AS INTEGER) AS month,
                            AVG(cu.item_price),
                            COUNT(*)
                     FROM contract_units cu
                     JOIN plans p ON cu.pln_point_id = p.id
                     JOIN contracts c ON cu.contract_id = c.id
                     WHERE p.ref_enstru_code = ?1
                       AND cu.item_price > 0
                       AND c.crdate IS NOT NULL
                     GROUP BY year, month
                     ORDER BY year, month",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![code], |row| {
                        Ok(MonthlyPriceRow {
                            year: row.get(0)?,
                            month: row.get(1)?,
                            average_price: row.get(2)?,
                            purchase_count: row.get(3)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Highest-value contracts for a customer, positive sums only.
    pub async fn top_contract_rows(
        &self,
        customer_bin: &str,
        limit: usize,
    ) -> Result<Vec<ContractRow>> {
        let bin = customer_bin.to_owned();
        let raws = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, contract_number, crdate, contract_sum
                     FROM contracts
                     WHERE customer_bin = ?1 AND contract_sum > 0
                     ORDER BY contract_sum DESC, id
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![bin, limit as i64], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, f64>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        raws.into_iter()
            .map(|(id, contract_number, crdate, contract_sum)| {
                Ok(ContractRow {
                    id,
                    contract_number,
                    crdate: decode_dt_opt(crdate)?,
                    contract_sum,
                })
            })
            .collect()
    }

    /// Row counts per table, used by sync summaries and idempotence checks.
    pub async fn counts(&self) -> Result<StoreCounts> {
        let counts = self
            .conn
            .call(|conn| {
                let count = |table: &str| -> rusqlite::Result<usize> {
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get::<_, i64>(0).map(|n| n as usize)
                    })
                };
                Ok(StoreCounts {
                    subjects: count("subjects")?,
                    plans: count("plans")?,
                    announcements: count("announcements")?,
                    lots: count("lots")?,
                    contracts: count("contracts")?,
                    contract_units: count("contract_units")?,
                })
            })
            .await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn store() -> ProcurementStore {
        ProcurementStore::open_in_memory()
            .await
            .expect("in-memory store")
    }

    fn dt(y: i32, mo: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn plan(id: i64, bin: &str, code: &str) -> PlanPoint {
        PlanPoint {
            id,
            subject_biin: Some(bin.to_owned()),
            ref_enstru_code: Some(code.to_owned()),
            ref_units_code: None,
            price: Some(100.0),
            count: Some(1.0),
            amount: Some(100.0),
            date_approved: Some(dt(2024, 1, 15)),
            kato_code: Some("750000000".to_owned()),
        }
    }

    fn contract(id: i64, bin: &str, trd_buy_id: Option<i64>, sum: f64) -> Contract {
        Contract {
            id,
            contract_number: Some(format!("C-{id}")),
            trd_buy_id,
            crdate: Some(dt(2024, 3, 1)),
            contract_sum: Some(sum),
            supplier_biin: None,
            customer_bin: Some(bin.to_owned()),
            ref_contract_status_id: None,
        }
    }

    fn unit(id: i64, contract_id: i64, plan_id: Option<i64>, price: f64, qty: f64) -> ContractUnit {
        ContractUnit {
            id,
            contract_id,
            pln_point_id: plan_id,
            item_price: Some(price),
            quantity: Some(qty),
            total_sum: Some(price * qty),
        }
    }

    #[tokio::test]
    async fn plan_upsert_is_idempotent() {
        let s = store().await;
        let batch = vec![plan(1, "123", "A"), plan(2, "123", "A")];

        assert_eq!(s.upsert_plans(batch.clone()).await.unwrap(), 2);
        assert_eq!(s.upsert_plans(batch).await.unwrap(), 0);
        assert_eq!(s.counts().await.unwrap().plans, 2);
    }

    #[tokio::test]
    async fn subject_enrichment_never_clears_names() {
        let s = store().await;
        s.upsert_subject(Subject {
            name_ru: Some("ТОО Пример".to_owned()),
            is_customer: true,
            ..Subject::bare("111")
        })
        .await
        .unwrap();

        // A later bare upsert must not erase the name or the flag.
        s.upsert_subject(Subject {
            is_supplier: true,
            ..Subject::bare("111")
        })
        .await
        .unwrap();

        let subject = s.get_subject("111").await.unwrap().unwrap();
        assert_eq!(subject.name_ru.as_deref(), Some("ТОО Пример"));
        assert!(subject.is_customer);
        assert!(subject.is_supplier);
    }

    #[tokio::test]
    async fn missing_announcement_ids_is_a_set_difference() {
        let s = store().await;
        s.upsert_announcement_with_lots(
            Announcement {
                id: 500,
                number_anno: None,
                name_ru: None,
                org_bin: Some("111".to_owned()),
                total_sum: None,
                publish_date: None,
                start_date: None,
                end_date: None,
                ref_buy_status_id: None,
            },
            vec![],
            vec![Subject::bare("111")],
        )
        .await
        .unwrap();

        s.upsert_contract(contract(1, "111", Some(500), 10.0))
            .await
            .unwrap();
        s.upsert_contract(contract(2, "111", Some(501), 10.0))
            .await
            .unwrap();
        s.upsert_contract(contract(3, "111", None, 10.0))
            .await
            .unwrap();

        assert_eq!(s.missing_announcement_ids().await.unwrap(), vec![501]);
    }

    #[tokio::test]
    async fn dangling_contract_references_are_persistable() {
        // The repair sweep feeds on contracts whose trd_buy_id has no
        // announcement row; enforcement must stay off on the connection.
        let s = store().await;
        let enforced: i64 = s
            .conn
            .call(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(enforced, 0);

        s.upsert_contract(contract(9, "111", Some(12345), 10.0))
            .await
            .unwrap();
        assert_eq!(s.missing_announcement_ids().await.unwrap(), vec![12345]);
    }

    #[tokio::test]
    async fn unit_price_rows_join_on_item_code() {
        let s = store().await;
        s.upsert_plans(vec![plan(1, "111", "A"), plan(2, "111", "B")])
            .await
            .unwrap();
        s.upsert_contract(contract(10, "111", None, 100.0))
            .await
            .unwrap();
        s.upsert_contract_units(vec![
            unit(100, 10, Some(1), 10.0, 2.0),
            unit(101, 10, Some(2), 99.0, 1.0),
            unit(102, 10, None, 50.0, 1.0),
        ])
        .await
        .unwrap();

        let rows = s.unit_price_rows("A").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_price, 10.0);
        assert_eq!(rows[0].contract_id, 10);
    }

    #[tokio::test]
    async fn price_rows_apply_region_and_year_filters() {
        let s = store().await;
        let mut other_region = plan(2, "111", "A");
        other_region.kato_code = Some("110000000".to_owned());
        s.upsert_plans(vec![plan(1, "111", "A"), other_region])
            .await
            .unwrap();

        let mut old = contract(11, "111", None, 10.0);
        old.crdate = Some(dt(2022, 6, 1));
        s.upsert_contract(contract(10, "111", None, 10.0))
            .await
            .unwrap();
        s.upsert_contract(old).await.unwrap();
        s.upsert_contract_units(vec![
            unit(100, 10, Some(1), 10.0, 1.0),
            unit(101, 11, Some(2), 20.0, 1.0),
        ])
        .await
        .unwrap();

        let all = s.price_rows("A", None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let regional = s.price_rows("A", Some("750000000"), None).await.unwrap();
        assert_eq!(regional.len(), 1);
        assert_eq!(regional[0].item_price, 10.0);

        let yearly = s.price_rows("A", None, Some(2022)).await.unwrap();
        assert_eq!(yearly.len(), 1);
        assert_eq!(yearly[0].item_price, 20.0);
    }

    #[tokio::test]
    async fn yearly_volumes_group_by_contract_year() {
        let s = store().await;
        s.upsert_plans(vec![plan(1, "111", "A")]).await.unwrap();

        for (contract_id, year, qty) in [(10, 2021, 100.0), (11, 2022, 110.0), (12, 2022, 40.0)] {
            let mut c = contract(contract_id, "111", None, 10.0);
            c.crdate = Some(dt(year, 2, 1));
            s.upsert_contract(c).await.unwrap();
            s.upsert_contract_units(vec![unit(contract_id * 10, contract_id, Some(1), 5.0, qty)])
                .await
                .unwrap();
        }

        let rows = s.yearly_volume_rows("111", "A").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].year, 2021);
        assert_eq!(rows[0].total_quantity, 100.0);
        assert_eq!(rows[1].year, 2022);
        assert_eq!(rows[1].total_quantity, 150.0);
        assert_eq!(rows[1].sample_contract_id, 12);
    }

    #[tokio::test]
    async fn top_contracts_order_by_sum_descending() {
        let s = store().await;
        for (id, sum) in [(1, 50.0), (2, 500.0), (3, 5.0), (4, 0.0)] {
            s.upsert_contract(contract(id, "111", None, sum)).await.unwrap();
        }

        let rows = s.top_contract_rows("111", 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 2);
        assert_eq!(rows[1].id, 1);

        // Zero-sum contracts are never reported.
        let all = s.top_contract_rows("111", 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn ref_dictionary_insert_if_absent() {
        let s = store().await;
        let entry = RefEntry {
            code: "796".to_owned(),
            name_ru: Some("Штука".to_owned()),
            name_kz: Some("Дана".to_owned()),
        };

        assert!(s
            .insert_ref_if_absent(Dictionary::Units, entry.clone())
            .await
            .unwrap());
        assert!(!s.insert_ref_if_absent(Dictionary::Units, entry).await.unwrap());
        assert!(s
            .ref_codes(Dictionary::Units)
            .await
            .unwrap()
            .contains("796"));
    }
}
