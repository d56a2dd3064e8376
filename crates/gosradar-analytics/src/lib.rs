//! Read-side analytics over the Entity Store: price deviation, fair-price
//! bounds, volume anomaly, price dynamics, top contracts.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

use gosradar_core::contract_link;
use gosradar_store::{ProcurementStore, UnitPriceRow};

pub const CRATE_NAME: &str = "gosradar-analytics";

/// Deviation beyond ±30% of the weighted historical average is anomalous.
pub const DEVIATION_THRESHOLD_PCT: f64 = 30.0;
/// Latest-year volume above 2× the historical mean is anomalous.
pub const VOLUME_ANOMALY_FACTOR: f64 = 2.0;
/// Tukey fence multiplier on the interquartile range.
pub const IQR_FENCE_FACTOR: f64 = 1.5;
/// Sample size at which fair-price confidence switches from Medium to High.
pub const HIGH_CONFIDENCE_SAMPLE: usize = 30;
/// Example contract links attached to each report.
pub const TOP_K_LINKS: usize = 3;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("store error: {0}")]
    Store(#[from] gosradar_store::Error),
}

/// "No data" is a defined result, never an error: a caller rendering these
/// reports must be able to tell an empty match set from a zero-valued one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome<T> {
    Data(T),
    NoData { error: String },
}

impl<T> Outcome<T> {
    fn no_data(reason: impl Into<String>) -> Self {
        Outcome::NoData {
            error: reason.into(),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Outcome::NoData { .. })
    }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDeviationReport {
    pub enstru_code: String,
    pub weighted_average_price: f64,
    pub target_price: f64,
    pub deviation_percentage: f64,
    pub is_anomalous: bool,
    pub sample_size_units: usize,
    pub top_k_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FairPriceReport {
    pub enstru_code: String,
    pub kato_code: Option<String>,
    pub time_period: String,
    pub sample_size: usize,
    pub median_price: f64,
    pub fair_min: f64,
    pub fair_max: f64,
    pub confidence: String,
    pub top_k_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeAnomalyReport {
    pub customer_bin: String,
    pub enstru_code: String,
    pub yearly_volumes: BTreeMap<i32, f64>,
    pub is_anomalous: bool,
    pub description: String,
    pub top_k_links: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyPricePoint {
    pub average_price: f64,
    pub purchase_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDynamicsReport {
    pub enstru_code: String,
    /// year → month → averages, oldest first.
    pub timeline: BTreeMap<i32, BTreeMap<u32, MonthlyPricePoint>>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractBrief {
    pub contract_id: i64,
    pub contract_number: Option<String>,
    pub crdate: Option<NaiveDateTime>,
    pub contract_sum: f64,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopContractsReport {
    pub customer_bin: String,
    pub contracts: Vec<ContractBrief>,
    pub total_sum: f64,
}

// ─── Statistics helpers ──────────────────────────────────────────────────────

/// Quantity-weighted mean price: Σ(price·qty) / Σ(qty). `None` when the
/// total quantity is zero.
pub fn weighted_average(rows: &[UnitPriceRow]) -> Option<f64> {
    let total_value: f64 = rows.iter().map(|r| r.item_price * r.quantity).sum();
    let total_quantity: f64 = rows.iter().map(|r| r.quantity).sum();
    if total_quantity == 0.0 {
        None
    } else {
        Some(total_value / total_quantity)
    }
}

/// Linear-interpolated quantile over an ascending-sorted, non-empty slice.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q * (n - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

pub fn median(sorted: &[f64]) -> f64 {
    quantile(sorted, 0.5)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Portal links for the first `k` distinct contract ids, preserving order.
fn dedup_links(ids: impl IntoIterator<Item = i64>, k: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for id in ids {
        if seen.insert(id) {
            links.push(contract_link(id));
            if links.len() == k {
                break;
            }
        }
    }
    links
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Pure read side: none of these mutate the store, and all are safe to call
/// concurrently against the same store.
pub struct AnalyticsEngine<'a> {
    store: &'a ProcurementStore,
}

impl<'a> AnalyticsEngine<'a> {
    pub fn new(store: &'a ProcurementStore) -> Self {
        Self { store }
    }

    /// How far `target_price` sits from the quantity-weighted historical
    /// average for an item code, flagged anomalous beyond ±30%.
    pub async fn check_price_deviation(
        &self,
        enstru_code: &str,
        target_price: f64,
    ) -> Result<Outcome<PriceDeviationReport>, AnalyticsError> {
        let rows = self.store.unit_price_rows(enstru_code).await?;
        if rows.is_empty() {
            return Ok(Outcome::no_data("no contract data found for this item code"));
        }
        let Some(weighted_avg) = weighted_average(&rows) else {
            return Ok(Outcome::no_data("total purchased quantity is zero"));
        };

        let deviation = (target_price - weighted_avg) / weighted_avg * 100.0;

        // Most expensive purchases as evidence links; stable sort keeps the
        // natural row order on ties.
        let mut by_price = rows.clone();
        by_price.sort_by(|a, b| b.item_price.total_cmp(&a.item_price));
        let top_k_links = dedup_links(by_price.iter().map(|r| r.contract_id), TOP_K_LINKS);

        Ok(Outcome::Data(PriceDeviationReport {
            enstru_code: enstru_code.to_owned(),
            weighted_average_price: weighted_avg,
            target_price,
            deviation_percentage: deviation,
            is_anomalous: deviation.abs() > DEVIATION_THRESHOLD_PCT,
            sample_size_units: rows.len(),
            top_k_links,
        }))
    }

    /// Tukey-fence fair-price interval for an item code, optionally filtered
    /// by region and contract year. Needs at least 3 samples.
    pub async fn get_fair_price_bounds(
        &self,
        enstru_code: &str,
        kato_code: Option<&str>,
        year: Option<i32>,
    ) -> Result<Outcome<FairPriceReport>, AnalyticsError> {
        let rows = self.store.price_rows(enstru_code, kato_code, year).await?;
        if rows.len() < 3 {
            return Ok(Outcome::no_data(
                "insufficient data to calculate a fair price range",
            ));
        }

        let mut sorted: Vec<f64> = rows.iter().map(|r| r.item_price).collect();
        sorted.sort_by(f64::total_cmp);

        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        let median_price = median(&sorted);
        // Prices cannot be negative; the lower fence clamps at zero.
        let fair_min = (q1 - IQR_FENCE_FACTOR * iqr).max(0.0);
        let fair_max = q3 + IQR_FENCE_FACTOR * iqr;

        // Example purchases closest to the median.
        let mut by_median_distance = rows.clone();
        by_median_distance.sort_by(|a, b| {
            (a.item_price - median_price)
                .abs()
                .total_cmp(&(b.item_price - median_price).abs())
        });
        let top_k_links =
            dedup_links(by_median_distance.iter().map(|r| r.contract_id), TOP_K_LINKS);

        let confidence = if rows.len() >= HIGH_CONFIDENCE_SAMPLE {
            "High"
        } else {
            "Medium"
        };

        Ok(Outcome::Data(FairPriceReport {
            enstru_code: enstru_code.to_owned(),
            kato_code: kato_code.map(str::to_owned),
            time_period: year.map_or_else(|| "All Time".to_owned(), |y| y.to_string()),
            sample_size: rows.len(),
            median_price,
            fair_min,
            fair_max,
            confidence: confidence.to_owned(),
            top_k_links,
        }))
    }

    /// Compares the latest year's purchased quantity against the mean of all
    /// prior years; above 2× the historical mean is anomalous.
    pub async fn detect_volume_anomaly(
        &self,
        customer_bin: &str,
        enstru_code: &str,
    ) -> Result<Outcome<VolumeAnomalyReport>, AnalyticsError> {
        let rows = self
            .store
            .yearly_volume_rows(customer_bin, enstru_code)
            .await?;
        if rows.is_empty() {
            return Ok(Outcome::no_data("no historical volume data found"));
        }

        let yearly_volumes: BTreeMap<i32, f64> =
            rows.iter().map(|r| (r.year, r.total_quantity)).collect();

        let mut is_anomalous = false;
        let mut description = "Normal volume trends.".to_owned();

        // BTreeMap iterates years ascending; the last entry is the latest.
        if let Some((&latest_year, &latest_volume)) =
            yearly_volumes.iter().next_back().filter(|_| yearly_volumes.len() >= 2)
        {
            let prior: Vec<f64> = yearly_volumes
                .iter()
                .filter(|(&year, _)| year != latest_year)
                .map(|(_, &v)| v)
                .collect();
            let historical_mean = prior.iter().sum::<f64>() / prior.len() as f64;

            if historical_mean > 0.0 && latest_volume > historical_mean * VOLUME_ANOMALY_FACTOR {
                is_anomalous = true;
                description = format!(
                    "Volume in {latest_year} ({latest_volume}) is significantly higher than \
                     the historical average ({historical_mean:.2})."
                );
            }
        }

        // Sample contracts from the most recent years.
        let recent_ids = rows
            .iter()
            .rev()
            .take(TOP_K_LINKS)
            .map(|r| r.sample_contract_id);
        let top_k_links = dedup_links(recent_ids, TOP_K_LINKS);

        Ok(Outcome::Data(VolumeAnomalyReport {
            customer_bin: customer_bin.to_owned(),
            enstru_code: enstru_code.to_owned(),
            yearly_volumes,
            is_anomalous,
            description,
            top_k_links,
        }))
    }

    /// Monthly average-price timeline for an item code. Trend and
    /// seasonality are deliberately left to the consumer.
    pub async fn analyze_price_dynamics(
        &self,
        enstru_code: &str,
    ) -> Result<Outcome<PriceDynamicsReport>, AnalyticsError> {
        let rows = self.store.monthly_price_rows(enstru_code).await?;
        if rows.is_empty() {
            return Ok(Outcome::no_data("no priced purchases found for this item code"));
        }

        let mut timeline: BTreeMap<i32, BTreeMap<u32, MonthlyPricePoint>> = BTreeMap::new();
        for row in rows {
            timeline.entry(row.year).or_default().insert(
                row.month,
                MonthlyPricePoint {
                    average_price: round2(row.average_price),
                    purchase_count: row.purchase_count,
                },
            );
        }

        Ok(Outcome::Data(PriceDynamicsReport {
            enstru_code: enstru_code.to_owned(),
            timeline,
            note: "Raw month-by-month averages; compute inflation and seasonal \
                   patterns from this timeline downstream."
                .to_owned(),
        }))
    }

    /// The `limit` highest-value contracts for a customer, with the sum of
    /// the returned set.
    pub async fn get_top_contracts(
        &self,
        customer_bin: &str,
        limit: usize,
    ) -> Result<Outcome<TopContractsReport>, AnalyticsError> {
        let rows = self.store.top_contract_rows(customer_bin, limit).await?;
        if rows.is_empty() {
            return Ok(Outcome::no_data("no contracts found for this customer"));
        }

        let total_sum = rows.iter().map(|r| r.contract_sum).sum();
        let contracts = rows
            .into_iter()
            .map(|r| ContractBrief {
                link: contract_link(r.id),
                contract_id: r.id,
                contract_number: r.contract_number,
                crdate: r.crdate,
                contract_sum: r.contract_sum,
            })
            .collect();

        Ok(Outcome::Data(TopContractsReport {
            customer_bin: customer_bin.to_owned(),
            contracts,
            total_sum,
        }))
    }
}
