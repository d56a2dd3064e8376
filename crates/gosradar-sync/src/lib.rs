//! Sync pipeline orchestration: incremental daily runs, historical loads,
//! announcement backfill, and dictionary/name enrichment.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use gosradar_client::{
    ClientConfig, GoszakupClient, HttpTransport, RetryPolicy, Transport, DEFAULT_BASE_URL,
};
use gosradar_core::{
    AnnouncementRecord, ContractRecord, ContractUnitRecord, LotRecord, PlanRecord, RefEntry,
    RefRecord, Subject, SubjectRecord, UNKNOWN_NAME_KZ, UNKNOWN_NAME_RU,
};
use gosradar_store::{Dictionary, ProcurementStore};

pub const CRATE_NAME: &str = "gosradar-sync";

pub const DEFAULT_SYNC_WINDOW_DAYS: i64 = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_token: Option<String>,
    pub db_path: PathBuf,
    pub target_bins: Vec<String>,
    /// Look-back window for the incremental cutoff, in days.
    pub sync_window_days: i64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub http_timeout_secs: u64,
    pub base_url: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            api_token: std::env::var("GOSZAKUP_API_TOKEN").ok().filter(|t| !t.is_empty()),
            db_path: std::env::var("GOSRADAR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./gosradar.db")),
            target_bins: std::env::var("GOSRADAR_TARGET_BINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            sync_window_days: std::env::var("GOSRADAR_SYNC_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SYNC_WINDOW_DAYS),
            scheduler_enabled: std::env::var("GOSRADAR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("GOSRADAR_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 5 * * *".to_string()),
            http_timeout_secs: std::env::var("GOSRADAR_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            base_url: std::env::var("GOSRADAR_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            token: self.api_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            retry: RetryPolicy::default(),
            ..ClientConfig::default()
        }
    }

    /// Rows stamped before this instant are assumed already synced.
    pub fn cutoff(&self) -> NaiveDateTime {
        (Utc::now() - ChronoDuration::days(self.sync_window_days)).naive_utc()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bins_processed: usize,
    pub plans_added: usize,
    pub contracts_added: usize,
    pub contracts_skipped: usize,
    pub contract_units_added: usize,
    pub announcements_backfilled: usize,
    pub refs_added: usize,
}

impl SyncRunSummary {
    fn started_now() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            bins_processed: 0,
            plans_added: 0,
            contracts_added: 0,
            contracts_skipped: 0,
            contract_units_added: 0,
            announcements_backfilled: 0,
            refs_added: 0,
        }
    }
}

/// One ETL pass: the client walks the upstream API, the store keeps the
/// local mirror append-only and referentially whole.
pub struct SyncPipeline<T> {
    client: GoszakupClient<T>,
    store: ProcurementStore,
}

impl<T: Transport> SyncPipeline<T> {
    pub fn new(client: GoszakupClient<T>, store: ProcurementStore) -> Self {
        Self { client, store }
    }

    pub fn store(&self) -> &ProcurementStore {
        &self.store
    }

    /// Incremental run over the target customers. A failing BIN is logged
    /// and skipped so the rest of the run still lands.
    pub async fn run_daily(
        &self,
        bins: &[String],
        cutoff: NaiveDateTime,
    ) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::started_now();
        info!(bins = bins.len(), %cutoff, "starting incremental sync");

        for bin in bins {
            self.store.upsert_subject(Subject::customer(bin.clone())).await?;

            match self.sync_plans(bin, Some(cutoff)).await {
                Ok(added) => summary.plans_added += added,
                Err(err) => warn!(%bin, error = %err, "plan sync failed for customer"),
            }
            if let Err(err) = self.sync_contracts(bin, Some(cutoff), &mut summary).await {
                warn!(%bin, error = %err, "contract sync failed for customer");
            }
            summary.bins_processed += 1;
        }

        summary.finished_at = Utc::now();
        info!(
            plans = summary.plans_added,
            contracts = summary.contracts_added,
            skipped = summary.contracts_skipped,
            units = summary.contract_units_added,
            "incremental sync finished"
        );
        Ok(summary)
    }

    /// Full first-time load: dictionaries, then every plan, announcement,
    /// and contract the API still serves for each customer.
    pub async fn load_historical(&self, bins: &[String]) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::started_now();
        info!(bins = bins.len(), "starting historical load");

        summary.refs_added += self.load_ref_dictionary(Dictionary::Units, "/v3/refs/ref_units").await?;
        summary.refs_added += self.load_ref_dictionary(Dictionary::Kato, "/v3/refs/ref_kato").await?;

        for bin in bins {
            self.store.upsert_subject(Subject::customer(bin.clone())).await?;

            match self.sync_plans(bin, None).await {
                Ok(added) => summary.plans_added += added,
                Err(err) => warn!(%bin, error = %err, "historical plan load failed"),
            }
            if let Err(err) = self.load_announcements(bin).await {
                warn!(%bin, error = %err, "historical announcement load failed");
            }
            if let Err(err) = self.sync_contracts(bin, None, &mut summary).await {
                warn!(%bin, error = %err, "historical contract load failed");
            }
            summary.bins_processed += 1;
        }

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Plans pass. The feed comes newest-first, so the first record stamped
    /// before the cutoff ends the walk for this customer.
    async fn sync_plans(&self, bin: &str, cutoff: Option<NaiveDateTime>) -> Result<usize> {
        let known = self.store.plan_ids_for_subject(bin).await?;
        let known_units = self.store.ref_codes(Dictionary::Units).await?;
        let mut pages = self.client.paginate(&format!("/v3/plans/{bin}"), &[]);

        let mut added = 0usize;
        let mut placeholder_units: HashSet<String> = HashSet::new();
        'pages: while let Some(items) = pages.next_page().await? {
            let mut batch = Vec::new();
            for item in items {
                let record: PlanRecord = match serde_json::from_value(item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%bin, error = %err, "skipping malformed plan record");
                        continue;
                    }
                };
                if let (Some(cutoff), Some(stamp)) = (cutoff, record.last_update()) {
                    if stamp < cutoff {
                        debug!(%bin, plan_id = record.id, %stamp, "cutoff reached, stopping plan walk");
                        added += self.store.upsert_plans(batch).await?;
                        break 'pages;
                    }
                }
                if known.contains(&record.id) {
                    continue;
                }
                if let Some(code) = &record.ref_units_code {
                    if !known_units.contains(code) {
                        placeholder_units.insert(code.clone());
                    }
                }
                batch.push(record.into_plan_point(bin));
            }
            added += self.store.upsert_plans(batch).await?;
        }

        // Unit codes the dictionary endpoint never listed still need a row
        // for joins; names stay the placeholder until a later refs load.
        for code in placeholder_units {
            self.store
                .insert_ref_if_absent(
                    Dictionary::Units,
                    RefEntry {
                        code,
                        name_ru: Some(UNKNOWN_NAME_RU.to_owned()),
                        name_kz: Some(UNKNOWN_NAME_KZ.to_owned()),
                    },
                )
                .await?;
        }
        Ok(added)
    }

    /// Contracts pass with the same cutoff-break walk, plus announcement
    /// backfill and per-contract unit loading.
    async fn sync_contracts(
        &self,
        bin: &str,
        cutoff: Option<NaiveDateTime>,
        summary: &mut SyncRunSummary,
    ) -> Result<()> {
        let known = self.store.contract_ids_for_customer(bin).await?;
        let known_unit_ids = self.store.contract_unit_ids().await?;
        let valid_plan_ids = self.store.all_plan_ids().await?;
        let mut pages = self
            .client
            .paginate(&format!("/v3/contract/customer/{bin}"), &[]);

        'pages: while let Some(items) = pages.next_page().await? {
            for item in items {
                let record: ContractRecord = match serde_json::from_value(item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%bin, error = %err, "skipping malformed contract record");
                        continue;
                    }
                };
                if let (Some(cutoff), Some(stamp)) = (cutoff, record.last_update()) {
                    if stamp < cutoff {
                        debug!(%bin, contract_id = record.id, %stamp, "cutoff reached, stopping contract walk");
                        break 'pages;
                    }
                }
                if known.contains(&record.id) {
                    continue;
                }

                // A contract may only reference an announcement row that
                // exists locally. A failed backfill fetch skips the whole
                // contract; an announcement the API no longer serves nulls
                // the reference instead.
                let trd_buy_id = match record.trd_buy_id {
                    Some(id) => match self.ensure_announcement(id).await {
                        Ok(true) => Some(id),
                        Ok(false) => {
                            debug!(contract_id = record.id, trd_buy_id = id, "announcement gone upstream, nulling reference");
                            None
                        }
                        Err(err) => {
                            warn!(contract_id = record.id, trd_buy_id = id, error = %err, "announcement backfill failed, skipping contract");
                            summary.contracts_skipped += 1;
                            continue;
                        }
                    },
                    None => None,
                };

                if let Some(supplier) = record.supplier_bin() {
                    self.store.upsert_subject(Subject::supplier(supplier)).await?;
                }
                let contract_id = record.id;
                if self
                    .store
                    .upsert_contract(record.into_contract(bin, trd_buy_id))
                    .await?
                {
                    summary.contracts_added += 1;
                }

                match self
                    .load_contract_units(contract_id, &known_unit_ids, &valid_plan_ids)
                    .await
                {
                    Ok(added) => summary.contract_units_added += added,
                    Err(err) => {
                        warn!(contract_id, error = %err, "contract unit fetch failed, continuing")
                    }
                }
            }
        }
        Ok(())
    }

    async fn load_contract_units(
        &self,
        contract_id: i64,
        known_unit_ids: &HashSet<i64>,
        valid_plan_ids: &HashSet<i64>,
    ) -> Result<usize> {
        let mut pages = self
            .client
            .paginate(&format!("/v3/contract/{contract_id}/units"), &[]);

        let mut batch = Vec::new();
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let record: ContractUnitRecord = match serde_json::from_value(item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(contract_id, error = %err, "skipping malformed contract unit");
                        continue;
                    }
                };
                if known_unit_ids.contains(&record.id) {
                    continue;
                }
                // Plan references outside the local mirror become null.
                let plan_id = record.pln_point_id.filter(|id| valid_plan_ids.contains(id));
                batch.push(record.into_contract_unit(contract_id, plan_id));
            }
        }
        Ok(self.store.upsert_contract_units(batch).await?)
    }

    /// Make sure the announcement row for `trd_buy_id` exists locally,
    /// fetching it together with its lots when it does not. Returns whether
    /// the row exists after the call.
    pub async fn ensure_announcement(&self, trd_buy_id: i64) -> Result<bool> {
        if self.store.announcement_exists(trd_buy_id).await? {
            return Ok(true);
        }

        let Some(detail) = self
            .client
            .get_single(&format!("/v3/trd-buy/{trd_buy_id}"))
            .await?
        else {
            return Ok(false);
        };
        let record: AnnouncementRecord =
            serde_json::from_value(detail).context("decoding announcement detail")?;

        let mut lots = Vec::new();
        let mut subjects = Vec::new();
        if let Some(bin) = gosradar_core::normalize_bin(record.org_bin.as_deref()) {
            subjects.push(Subject::bare(bin));
        }
        let mut pages = self
            .client
            .paginate(&format!("/v3/lots/trd-buy/{trd_buy_id}"), &[]);
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let lot: LotRecord = match serde_json::from_value(item) {
                    Ok(lot) => lot,
                    Err(err) => {
                        warn!(trd_buy_id, error = %err, "skipping malformed lot record");
                        continue;
                    }
                };
                if let Some(bin) = lot.customer_bin() {
                    subjects.push(Subject::customer(bin));
                }
                lots.push(lot.into_lot(trd_buy_id));
            }
        }

        self.store
            .upsert_announcement_with_lots(record.into_announcement(None), lots, subjects)
            .await?;
        Ok(true)
    }

    /// Repair sweep: fetch announcements for every dangling `trd_buy_id`
    /// already persisted on a contract. Fetch failures leave the id for the
    /// next sweep.
    pub async fn backfill_missing_announcements(&self) -> Result<usize> {
        let ids = self.store.missing_announcement_ids().await?;
        info!(missing = ids.len(), "starting announcement repair sweep");

        let mut repaired = 0usize;
        for id in ids {
            match self.ensure_announcement(id).await {
                Ok(true) => repaired += 1,
                Ok(false) => debug!(trd_buy_id = id, "announcement not served upstream"),
                Err(err) => warn!(trd_buy_id = id, error = %err, "backfill fetch failed"),
            }
        }
        Ok(repaired)
    }

    /// Announcements pass for the historical load, keyed by customer.
    async fn load_announcements(&self, bin: &str) -> Result<usize> {
        let params = vec![("customer_bin".to_string(), bin.to_string())];
        let mut pages = self.client.paginate("/v3/trd-buy", &params);

        let mut added = 0usize;
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let record: AnnouncementRecord = match serde_json::from_value(item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(%bin, error = %err, "skipping malformed announcement record");
                        continue;
                    }
                };
                if self.store.announcement_exists(record.id).await? {
                    continue;
                }
                if self.ensure_announcement(record.id).await? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Fill in names for subjects discovered as bare BINs.
    pub async fn enrich_subjects(&self) -> Result<usize> {
        let bins = self.store.subjects_missing_names().await?;
        let mut enriched = 0usize;
        for bin in bins {
            let detail = match self.client.get_single(&format!("/v3/subject/biin/{bin}")).await {
                Ok(Some(detail)) => detail,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%bin, error = %err, "subject lookup failed");
                    continue;
                }
            };
            let record: SubjectRecord = match serde_json::from_value(detail) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%bin, error = %err, "skipping malformed subject record");
                    continue;
                }
            };
            if record.name_ru.is_none() && record.name_kz.is_none() {
                continue;
            }
            self.store
                .upsert_subject(Subject {
                    bin,
                    name_ru: record.name_ru,
                    name_kz: record.name_kz,
                    is_customer: false,
                    is_supplier: false,
                })
                .await?;
            enriched += 1;
        }
        Ok(enriched)
    }

    /// Backfill item-code names from plan detail lookups. Codes the API
    /// answers with blank names get the placeholder so they are not
    /// re-fetched forever.
    pub async fn enrich_enstru_descriptions(&self) -> Result<usize> {
        let pending = self.store.enstru_codes_missing_descriptions().await?;
        let mut enriched = 0usize;
        for (code, plan_id) in pending {
            let detail = match self
                .client
                .get_single(&format!("/v3/plans/view/{plan_id}"))
                .await
            {
                Ok(Some(detail)) => detail,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%code, plan_id, error = %err, "plan detail lookup failed");
                    continue;
                }
            };
            let record: PlanRecord = match serde_json::from_value(detail) {
                Ok(record) => record,
                Err(err) => {
                    warn!(%code, plan_id, error = %err, "skipping malformed plan detail");
                    continue;
                }
            };
            let entry = RefEntry {
                code: code.clone(),
                name_ru: record
                    .name_ru
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| Some(UNKNOWN_NAME_RU.to_owned())),
                name_kz: record
                    .name_kz
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| Some(UNKNOWN_NAME_KZ.to_owned())),
            };
            if self.store.insert_ref_if_absent(Dictionary::Enstru, entry).await? {
                enriched += 1;
            }
        }
        Ok(enriched)
    }

    /// Paginated load of one `/v3/refs/*` dictionary.
    pub async fn load_ref_dictionary(&self, dictionary: Dictionary, path: &str) -> Result<usize> {
        let known = self.store.ref_codes(dictionary).await?;
        let mut pages = self.client.paginate(path, &[]);

        let mut added = 0usize;
        while let Some(items) = pages.next_page().await? {
            for item in items {
                let record: RefRecord = match serde_json::from_value(item) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(path, error = %err, "skipping malformed dictionary record");
                        continue;
                    }
                };
                let Some(code) = record.code.clone().filter(|c| !c.trim().is_empty()) else {
                    continue;
                };
                if known.contains(&code) {
                    continue;
                }
                let entry = RefEntry {
                    code,
                    name_ru: record.display_name_ru(),
                    name_kz: record.display_name_kz(),
                };
                if self.store.insert_ref_if_absent(dictionary, entry).await? {
                    added += 1;
                }
            }
        }
        Ok(added)
    }
}

/// Build the production pipeline from environment configuration.
pub async fn pipeline_from_env(config: &SyncConfig) -> Result<SyncPipeline<HttpTransport>> {
    let transport = HttpTransport::new(config.client_config())?;
    let store = ProcurementStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store at {}", config.db_path.display()))?;
    Ok(SyncPipeline::new(GoszakupClient::new(transport), store))
}

/// One incremental run straight from the environment.
pub async fn run_daily_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = pipeline_from_env(&config).await?;
    let summary = pipeline.run_daily(&config.target_bins, config.cutoff()).await?;
    let repaired = pipeline.backfill_missing_announcements().await?;
    info!(repaired, "post-run repair sweep finished");
    Ok(summary)
}

/// Cron scheduler wrapping `run_daily_from_env`, when enabled.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), |_uuid, _l| {
        Box::pin(async move {
            match run_daily_from_env().await {
                Ok(summary) => info!(
                    plans = summary.plans_added,
                    contracts = summary.contracts_added,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gosradar_client::FetchError;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type CallCounts = Arc<Mutex<HashMap<String, usize>>>;

    /// Responses keyed by path; each request pops the next response, and the
    /// last scripted response repeats. Unscripted paths answer 404.
    struct ScriptedTransport {
        routes: Mutex<HashMap<String, Vec<Value>>>,
        calls: CallCounts,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                routes: Mutex::new(HashMap::new()),
                calls: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        fn script(self, path: &str, responses: Vec<Value>) -> Self {
            self.routes
                .lock()
                .unwrap()
                .insert(path.to_string(), responses);
            self
        }

        /// Handle for asserting call counts after the transport moves into
        /// the pipeline.
        fn counter(&self) -> CallCounts {
            Arc::clone(&self.calls)
        }
    }

    fn calls_to(counter: &CallCounts, path: &str) -> usize {
        *counter.lock().unwrap().get(path).unwrap_or(&0)
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get_json(
            &self,
            path: &str,
            _params: &[(String, String)],
        ) -> Result<Value, FetchError> {
            *self.calls.lock().unwrap().entry(path.to_string()).or_default() += 1;
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(path) {
                Some(responses) if responses.len() > 1 => Ok(responses.remove(0)),
                Some(responses) if responses.len() == 1 => Ok(responses[0].clone()),
                _ => Err(FetchError::HttpStatus {
                    status: 404,
                    url: path.to_string(),
                }),
            }
        }
    }

    fn plan(id: i64, stamp: &str) -> Value {
        json!({
            "id": id,
            "ref_enstru_code": "123456.000.000000",
            "ref_units_code": "796",
            "price": 100.0,
            "count": 2.0,
            "amount": 200.0,
            "index_date": stamp,
        })
    }

    fn contract(id: i64, trd_buy_id: Option<i64>, stamp: &str) -> Value {
        json!({
            "id": id,
            "contract_number": format!("C-{id}"),
            "trd_buy_id": trd_buy_id,
            "crdate": stamp,
            "contract_sum": 500.0,
            "supplier_biin": "999888777666",
            "index_date": stamp,
        })
    }

    fn announcement(id: i64) -> Value {
        json!({
            "id": id,
            "number_anno": format!("A-{id}"),
            "name_ru": "Закупка",
            "org_bin": "111222333444",
            "total_sum": 500.0,
            "publish_date": "2026-01-10 09:00:00",
        })
    }

    fn pipeline(transport: ScriptedTransport, store: ProcurementStore) -> SyncPipeline<ScriptedTransport> {
        SyncPipeline::new(GoszakupClient::new(transport), store)
    }

    async fn store() -> ProcurementStore {
        ProcurementStore::open_in_memory().await.expect("in-memory store")
    }

    fn cutoff(date: &str) -> NaiveDateTime {
        gosradar_core::parse_api_date(date).expect("valid cutoff")
    }

    #[tokio::test]
    async fn daily_sync_is_idempotent() {
        let bin = "111222333444".to_string();
        let transport = ScriptedTransport::new()
            .script("/v3/plans/111222333444", vec![json!([plan(1, "2026-02-01 10:00:00")])])
            .script(
                "/v3/contract/customer/111222333444",
                vec![json!([contract(10, Some(100), "2026-02-01 11:00:00")])],
            )
            .script("/v3/trd-buy/100", vec![announcement(100)])
            .script(
                "/v3/lots/trd-buy/100",
                vec![json!([{"id": 1000, "lot_number": "1", "amount": 500.0, "customer_bin": "111222333444"}])],
            )
            .script(
                "/v3/contract/10/units",
                vec![json!([{"id": 7000, "pln_point_id": 1, "item_price": 100.0, "quantity": 5.0, "total_sum": 500.0}])],
            );

        let p = pipeline(transport, store().await);
        let cut = cutoff("2026-01-01 00:00:00");

        let first = p.run_daily(&[bin.clone()], cut).await.unwrap();
        assert_eq!(first.plans_added, 1);
        assert_eq!(first.contracts_added, 1);
        assert_eq!(first.contract_units_added, 1);

        let second = p.run_daily(&[bin], cut).await.unwrap();
        assert_eq!(second.plans_added, 0);
        assert_eq!(second.contracts_added, 0);
        assert_eq!(second.contract_units_added, 0);

        let counts = p.store().counts().await.unwrap();
        assert_eq!(counts.plans, 1);
        assert_eq!(counts.contracts, 1);
        assert_eq!(counts.announcements, 1);
        assert_eq!(counts.lots, 1);
        assert_eq!(counts.contract_units, 1);
    }

    #[tokio::test]
    async fn cutoff_stops_the_plan_walk() {
        let bin = "111222333444".to_string();
        // Page one ends with a pre-cutoff record; page two must never be
        // requested.
        let transport = ScriptedTransport::new()
            .script(
                "/v3/plans/111222333444",
                vec![
                    json!({
                        "items": [plan(1, "2026-02-01 10:00:00"), plan(2, "2025-12-01 10:00:00")],
                        "next_page": "abc",
                    }),
                    json!({"items": [plan(3, "2025-11-01 10:00:00")], "next_page": null}),
                ],
            )
            .script("/v3/contract/customer/111222333444", vec![json!([])]);
        let counter = transport.counter();

        let p = pipeline(transport, store().await);
        let summary = p
            .run_daily(&[bin], cutoff("2026-01-01 00:00:00"))
            .await
            .unwrap();

        assert_eq!(summary.plans_added, 1);
        assert_eq!(calls_to(&counter, "/v3/plans/111222333444"), 1);
        let plan_ids = p.store().all_plan_ids().await.unwrap();
        assert!(plan_ids.contains(&1));
        assert!(!plan_ids.contains(&2));
        assert!(!plan_ids.contains(&3));
    }

    #[tokio::test]
    async fn failed_backfill_skips_the_contract() {
        let bin = "111222333444".to_string();
        // trd-buy/100 is unscripted, so its backfill fetch fails with an
        // HTTP error.
        let transport = ScriptedTransport::new()
            .script("/v3/plans/111222333444", vec![json!([])])
            .script(
                "/v3/contract/customer/111222333444",
                vec![json!([
                    contract(10, Some(100), "2026-02-01 11:00:00"),
                    contract(11, None, "2026-02-01 10:00:00"),
                ])],
            )
            .script("/v3/contract/11/units", vec![json!([])]);

        let p = pipeline(transport, store().await);
        let summary = p
            .run_daily(&[bin.clone()], cutoff("2026-01-01 00:00:00"))
            .await
            .unwrap();

        assert_eq!(summary.contracts_skipped, 1);
        assert_eq!(summary.contracts_added, 1);
        let ids = p.store().contract_ids_for_customer(&bin).await.unwrap();
        assert!(!ids.contains(&10));
        assert!(ids.contains(&11));
        // Nothing referential dangles after the failure.
        assert!(p.store().missing_announcement_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn vanished_announcement_nulls_the_reference() {
        let bin = "111222333444".to_string();
        let transport = ScriptedTransport::new()
            .script("/v3/plans/111222333444", vec![json!([])])
            .script(
                "/v3/contract/customer/111222333444",
                vec![json!([contract(10, Some(100), "2026-02-01 11:00:00")])],
            )
            // Upstream answers an empty list: the announcement is gone.
            .script("/v3/trd-buy/100", vec![json!([])])
            .script("/v3/contract/10/units", vec![json!([])]);

        let p = pipeline(transport, store().await);
        let summary = p
            .run_daily(&[bin.clone()], cutoff("2026-01-01 00:00:00"))
            .await
            .unwrap();

        assert_eq!(summary.contracts_added, 1);
        assert_eq!(summary.contracts_skipped, 0);
        let ids = p.store().contract_ids_for_customer(&bin).await.unwrap();
        assert!(ids.contains(&10));
        assert!(p.store().missing_announcement_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repair_sweep_backfills_dangling_references() {
        use gosradar_core::Contract;

        let s = store().await;
        s.upsert_contract(Contract {
            id: 10,
            contract_number: Some("C-10".into()),
            trd_buy_id: Some(100),
            crdate: None,
            contract_sum: Some(500.0),
            supplier_biin: None,
            customer_bin: Some("111222333444".into()),
            ref_contract_status_id: None,
        })
        .await
        .unwrap();
        assert_eq!(s.missing_announcement_ids().await.unwrap(), vec![100]);

        let transport = ScriptedTransport::new()
            .script("/v3/trd-buy/100", vec![announcement(100)])
            .script("/v3/lots/trd-buy/100", vec![json!([])]);

        let p = pipeline(transport, s);
        let repaired = p.backfill_missing_announcements().await.unwrap();
        assert_eq!(repaired, 1);
        assert!(p.store().announcement_exists(100).await.unwrap());
        assert!(p.store().missing_announcement_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unit_plan_references_outside_the_mirror_become_null() {
        let bin = "111222333444".to_string();
        let transport = ScriptedTransport::new()
            .script("/v3/plans/111222333444", vec![json!([plan(1, "2026-02-01 10:00:00")])])
            .script(
                "/v3/contract/customer/111222333444",
                vec![json!([contract(10, None, "2026-02-01 11:00:00")])],
            )
            .script(
                "/v3/contract/10/units",
                vec![json!([
                    {"id": 7000, "pln_point_id": 1, "item_price": 10.0, "quantity": 1.0},
                    {"id": 7001, "pln_point_id": 999, "item_price": 20.0, "quantity": 1.0},
                ])],
            );

        let p = pipeline(transport, store().await);
        let summary = p
            .run_daily(&[bin], cutoff("2026-01-01 00:00:00"))
            .await
            .unwrap();

        assert_eq!(summary.contract_units_added, 2);
        // The valid reference survives the join; the dangling one does not.
        let rows = p.store().unit_price_rows("123456.000.000000").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].item_price, 10.0);
    }

    #[tokio::test]
    async fn ref_dictionary_load_is_incremental() {
        let transport = ScriptedTransport::new().script(
            "/v3/refs/ref_units",
            vec![json!([
                {"code": "796", "name_ru": "Штука", "name_kz": "Дана"},
                {"code": "166", "name_ru": "Килограмм"},
                {"name_ru": "без кода"},
            ])],
        );

        let p = pipeline(transport, store().await);
        let added = p
            .load_ref_dictionary(Dictionary::Units, "/v3/refs/ref_units")
            .await
            .unwrap();
        assert_eq!(added, 2);

        let again = p
            .load_ref_dictionary(Dictionary::Units, "/v3/refs/ref_units")
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn subject_enrichment_fills_missing_names() {
        let s = store().await;
        s.upsert_subject(Subject::bare("111222333444")).await.unwrap();

        let transport = ScriptedTransport::new().script(
            "/v3/subject/biin/111222333444",
            vec![json!({"name_ru": "ТОО Ромашка", "name_kz": "Ромашка ЖШС"})],
        );

        let p = pipeline(transport, s);
        assert_eq!(p.enrich_subjects().await.unwrap(), 1);

        let subject = p.store().get_subject("111222333444").await.unwrap().unwrap();
        assert_eq!(subject.name_ru.as_deref(), Some("ТОО Ромашка"));
        assert!(p.store().subjects_missing_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn historical_load_walks_announcements_for_the_customer() {
        let bin = "111222333444".to_string();
        let transport = ScriptedTransport::new()
            .script("/v3/refs/ref_units", vec![json!([])])
            .script("/v3/refs/ref_kato", vec![json!([])])
            .script("/v3/plans/111222333444", vec![json!([])])
            .script("/v3/trd-buy", vec![json!([announcement(100)])])
            .script("/v3/trd-buy/100", vec![announcement(100)])
            .script("/v3/lots/trd-buy/100", vec![json!([])])
            .script("/v3/contract/customer/111222333444", vec![json!([])]);

        let p = pipeline(transport, store().await);
        let summary = p.load_historical(&[bin]).await.unwrap();
        assert_eq!(summary.bins_processed, 1);
        assert!(p.store().announcement_exists(100).await.unwrap());
    }

    #[test]
    fn env_config_defaults_are_sane() {
        // No GOSRADAR_* vars are set in the test environment.
        let config = SyncConfig::from_env();
        assert_eq!(config.sync_window_days, DEFAULT_SYNC_WINDOW_DAYS);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.target_bins.is_empty());
    }

    #[tokio::test]
    async fn plan_walk_stops_after_scripted_pages() {
        // Guard against the scripted seam itself looping: a bare-list page
        // with repeating content terminates through the paginator's
        // duplicate-id check.
        let bin = "111222333444".to_string();
        let transport = ScriptedTransport::new()
            .script(
                "/v3/plans/111222333444",
                vec![json!({
                    "items": [plan(1, "2026-02-01 10:00:00")],
                    "next_page": "abc",
                })],
            )
            .script("/v3/contract/customer/111222333444", vec![json!([])]);
        let counter = transport.counter();

        let p = pipeline(transport, store().await);
        let summary = p
            .run_daily(&[bin], cutoff("2026-01-01 00:00:00"))
            .await
            .unwrap();
        assert_eq!(summary.plans_added, 1);
        assert!(calls_to(&counter, "/v3/plans/111222333444") <= 2);
    }
}
