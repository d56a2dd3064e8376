//! Core domain model and upstream wire records for gosradar.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "gosradar-core";

/// Public procurement portal base used for human-facing contract links.
pub const PORTAL_BASE: &str = "https://goszakup.gov.kz/ru";

/// Direct portal link for a contract, the shape downstream consumers render.
pub fn contract_link(contract_id: i64) -> String {
    format!("{PORTAL_BASE}/contract/show/{contract_id}")
}

/// Placeholder names inserted when a reference code is first seen from a
/// line item before its dictionary entry is known.
pub const UNKNOWN_CODE_RU: &str = "Неизвестный код";
pub const UNKNOWN_CODE_KZ: &str = "Белгісіз код";
pub const UNKNOWN_NAME_RU: &str = "Неизвестное наименование";
pub const UNKNOWN_NAME_KZ: &str = "Белгісіз атау";

// ─── Entities ────────────────────────────────────────────────────────────────

/// A legal entity keyed by its national BIN/BIIN. Created lazily the first
/// time any record references the BIN, enriched with names later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub bin: String,
    pub name_ru: Option<String>,
    pub name_kz: Option<String>,
    pub is_customer: bool,
    pub is_supplier: bool,
}

impl Subject {
    pub fn bare(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            name_ru: None,
            name_kz: None,
            is_customer: false,
            is_supplier: false,
        }
    }

    pub fn customer(bin: impl Into<String>) -> Self {
        Self {
            is_customer: true,
            ..Self::bare(bin)
        }
    }

    pub fn supplier(bin: impl Into<String>) -> Self {
        Self {
            is_supplier: true,
            ..Self::bare(bin)
        }
    }
}

/// One annual-procurement-plan line. Holds the KTRU item code and the
/// regional KATO code, which the analytics joins hang off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPoint {
    pub id: i64,
    pub subject_biin: Option<String>,
    pub ref_enstru_code: Option<String>,
    pub ref_units_code: Option<String>,
    pub price: Option<f64>,
    pub count: Option<f64>,
    pub amount: Option<f64>,
    pub date_approved: Option<NaiveDateTime>,
    pub kato_code: Option<String>,
}

/// A procurement announcement ("trd-buy") owning a set of lots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub number_anno: Option<String>,
    pub name_ru: Option<String>,
    pub org_bin: Option<String>,
    pub total_sum: Option<f64>,
    pub publish_date: Option<NaiveDateTime>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
    pub ref_buy_status_id: Option<i64>,
}

/// One lot within an announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lot {
    pub id: i64,
    pub trd_buy_id: Option<i64>,
    pub lot_number: Option<String>,
    pub name_ru: Option<String>,
    pub amount: Option<f64>,
    pub count: Option<f64>,
    pub customer_bin: Option<String>,
    pub ref_lot_status_id: Option<i64>,
}

/// A signed contract, optionally linked back to the announcement that
/// produced it. `trd_buy_id` is nulled when the announcement cannot be
/// validated or backfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: i64,
    pub contract_number: Option<String>,
    pub trd_buy_id: Option<i64>,
    pub crdate: Option<NaiveDateTime>,
    pub contract_sum: Option<f64>,
    pub supplier_biin: Option<String>,
    pub customer_bin: Option<String>,
    pub ref_contract_status_id: Option<i64>,
}

/// One priced line item inside a contract. `pln_point_id` is nulled when the
/// referenced plan id is not locally known, never left dangling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractUnit {
    pub id: i64,
    pub contract_id: i64,
    pub pln_point_id: Option<i64>,
    pub item_price: Option<f64>,
    pub quantity: Option<f64>,
    pub total_sum: Option<f64>,
}

/// One code→bilingual-name row of a reference dictionary (units of measure,
/// KATO regions, KTRU descriptions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    pub code: String,
    pub name_ru: Option<String>,
    pub name_kz: Option<String>,
}

// ─── Upstream date handling ──────────────────────────────────────────────────

/// Parse the date shapes the upstream mixes freely: `2024-05-01 10:20:30`,
/// ISO timestamps with `T`/fractional seconds/zone suffix, and bare dates.
/// Unparseable input is `None`; the caller decides the absence policy.
pub fn parse_api_date(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let spaced = trimmed.replace('T', " ");
    let no_zone = spaced.trim_end_matches('Z');
    let no_zone = match no_zone.find('+') {
        Some(idx) => &no_zone[..idx],
        None => no_zone,
    };
    let cleaned = no_zone.split('.').next().unwrap_or(no_zone).trim();

    NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(cleaned, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn parse_opt_date(raw: Option<&str>) -> Option<NaiveDateTime> {
    raw.and_then(parse_api_date)
}

/// Trim a BIN-ish field and drop empty strings, which the upstream emits
/// instead of nulls for absent counterparties.
pub fn normalize_bin(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

// ─── Wire records ────────────────────────────────────────────────────────────
//
// One typed record per upstream endpoint, parsed once at the ingestion
// boundary. Numeric fields tolerate the API's habit of quoting numbers.

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn coerce_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', ".").parse().ok(),
            _ => None,
        }
    }

    pub fn coerce_i64(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(coerce_f64))
    }

    pub fn i64_opt<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(coerce_i64))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanKatoEntry {
    #[serde(default)]
    pub ref_kato_code: Option<String>,
}

/// `/v3/plans/{bin}` list item and `/v3/plans/view/{id}` detail.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanRecord {
    pub id: i64,
    #[serde(default)]
    pub ref_enstru_code: Option<String>,
    #[serde(default)]
    pub ref_units_code: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub count: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub amount: Option<f64>,
    #[serde(default)]
    pub date_approved: Option<String>,
    #[serde(default)]
    pub index_date: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub kato: Vec<PlanKatoEntry>,
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default)]
    pub name_kz: Option<String>,
}

impl PlanRecord {
    /// Index timestamp with the approval-domain fallback, the ordering key
    /// the incremental cutoff relies on.
    pub fn last_update(&self) -> Option<NaiveDateTime> {
        parse_opt_date(self.index_date.as_deref())
            .or_else(|| parse_opt_date(self.timestamp.as_deref()))
    }

    /// Regional code: first element of the nested `kato` list, absent when
    /// the list is empty.
    pub fn kato_code(&self) -> Option<String> {
        self.kato.first().and_then(|k| k.ref_kato_code.clone())
    }

    pub fn into_plan_point(self, subject_biin: &str) -> PlanPoint {
        let kato_code = self.kato_code();
        PlanPoint {
            id: self.id,
            subject_biin: Some(subject_biin.to_owned()),
            ref_enstru_code: self.ref_enstru_code,
            ref_units_code: self.ref_units_code,
            price: self.price,
            count: self.count,
            amount: self.amount,
            date_approved: parse_opt_date(self.date_approved.as_deref()),
            kato_code,
        }
    }
}

/// `/v3/trd-buy` list item and `/v3/trd-buy/{id}` detail.
#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncementRecord {
    pub id: i64,
    #[serde(default)]
    pub number_anno: Option<String>,
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default)]
    pub org_bin: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub total_sum: Option<f64>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default, deserialize_with = "lenient::i64_opt")]
    pub ref_buy_status_id: Option<i64>,
}

impl AnnouncementRecord {
    pub fn publish_date(&self) -> Option<NaiveDateTime> {
        parse_opt_date(self.publish_date.as_deref())
    }

    pub fn into_announcement(self, org_bin: Option<String>) -> Announcement {
        let org_bin = org_bin.or_else(|| normalize_bin(self.org_bin.as_deref()));
        Announcement {
            id: self.id,
            number_anno: self.number_anno,
            name_ru: self.name_ru,
            org_bin,
            total_sum: self.total_sum,
            publish_date: parse_opt_date(self.publish_date.as_deref()),
            start_date: parse_opt_date(self.start_date.as_deref()),
            end_date: parse_opt_date(self.end_date.as_deref()),
            ref_buy_status_id: self.ref_buy_status_id,
        }
    }
}

/// `/v3/lots/trd-buy/{announcement_id}` item.
#[derive(Debug, Clone, Deserialize)]
pub struct LotRecord {
    pub id: i64,
    #[serde(default)]
    pub lot_number: Option<String>,
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub amount: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub count: Option<f64>,
    #[serde(default)]
    pub customer_bin: Option<String>,
    #[serde(default, deserialize_with = "lenient::i64_opt")]
    pub ref_lot_status_id: Option<i64>,
}

impl LotRecord {
    pub fn customer_bin(&self) -> Option<String> {
        normalize_bin(self.customer_bin.as_deref())
    }

    pub fn into_lot(self, trd_buy_id: i64) -> Lot {
        let customer_bin = self.customer_bin();
        Lot {
            id: self.id,
            trd_buy_id: Some(trd_buy_id),
            lot_number: self.lot_number,
            name_ru: self.name_ru,
            amount: self.amount,
            count: self.count,
            customer_bin,
            ref_lot_status_id: self.ref_lot_status_id,
        }
    }
}

/// `/v3/contract/customer/{bin}` list item.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractRecord {
    pub id: i64,
    #[serde(default)]
    pub contract_number: Option<String>,
    #[serde(default, deserialize_with = "lenient::i64_opt")]
    pub trd_buy_id: Option<i64>,
    #[serde(default)]
    pub crdate: Option<String>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub contract_sum: Option<f64>,
    #[serde(default)]
    pub supplier_biin: Option<String>,
    #[serde(default, deserialize_with = "lenient::i64_opt")]
    pub ref_contract_status_id: Option<i64>,
    #[serde(default)]
    pub index_date: Option<String>,
}

impl ContractRecord {
    pub fn last_update(&self) -> Option<NaiveDateTime> {
        parse_opt_date(self.index_date.as_deref())
            .or_else(|| parse_opt_date(self.crdate.as_deref()))
    }

    pub fn supplier_bin(&self) -> Option<String> {
        normalize_bin(self.supplier_biin.as_deref())
    }

    /// `trd_buy_id` is resolved by the caller: kept only once the
    /// announcement is known to exist locally.
    pub fn into_contract(self, customer_bin: &str, trd_buy_id: Option<i64>) -> Contract {
        let supplier_biin = self.supplier_bin();
        Contract {
            id: self.id,
            contract_number: self.contract_number,
            trd_buy_id,
            crdate: parse_opt_date(self.crdate.as_deref()),
            contract_sum: self.contract_sum,
            supplier_biin,
            customer_bin: Some(customer_bin.to_owned()),
            ref_contract_status_id: self.ref_contract_status_id,
        }
    }
}

/// `/v3/contract/{id}/units` item.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractUnitRecord {
    pub id: i64,
    #[serde(default, deserialize_with = "lenient::i64_opt")]
    pub pln_point_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub item_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub quantity: Option<f64>,
    #[serde(default, deserialize_with = "lenient::f64_opt")]
    pub total_sum: Option<f64>,
}

impl ContractUnitRecord {
    /// `pln_point_id` is validated against the locally known plan-id set
    /// before persisting; unknown ids become null.
    pub fn into_contract_unit(self, contract_id: i64, plan_id: Option<i64>) -> ContractUnit {
        ContractUnit {
            id: self.id,
            contract_id,
            pln_point_id: plan_id,
            item_price: self.item_price,
            quantity: self.quantity,
            total_sum: self.total_sum,
        }
    }
}

/// `/v3/subject/biin/{bin}` profile, used by the name-enrichment pass.
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectRecord {
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default)]
    pub name_kz: Option<String>,
}

/// `/v3/refs/*` dictionary item. KATO rows carry the long-form names.
#[derive(Debug, Clone, Deserialize)]
pub struct RefRecord {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name_ru: Option<String>,
    #[serde(default)]
    pub name_kz: Option<String>,
    #[serde(default)]
    pub full_name_ru: Option<String>,
    #[serde(default)]
    pub full_name_kz: Option<String>,
}

impl RefRecord {
    pub fn display_name_ru(&self) -> Option<String> {
        self.full_name_ru.clone().or_else(|| self.name_ru.clone())
    }

    pub fn display_name_kz(&self) -> Option<String> {
        self.full_name_kz.clone().or_else(|| self.name_kz.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn parses_plain_and_iso_dates() {
        assert_eq!(
            parse_api_date("2024-05-01 10:20:30"),
            Some(dt(2024, 5, 1, 10, 20, 30))
        );
        assert_eq!(
            parse_api_date("2024-05-01T10:20:30.123456Z"),
            Some(dt(2024, 5, 1, 10, 20, 30))
        );
        assert_eq!(
            parse_api_date("2024-05-01T10:20:30+06:00"),
            Some(dt(2024, 5, 1, 10, 20, 30))
        );
        assert_eq!(parse_api_date("2024-05-01"), Some(dt(2024, 5, 1, 0, 0, 0)));
        assert_eq!(parse_api_date(""), None);
        assert_eq!(parse_api_date("not a date"), None);
    }

    #[test]
    fn plan_record_extracts_first_kato_entry_only() {
        let record: PlanRecord = serde_json::from_value(json!({
            "id": 11,
            "ref_enstru_code": "324012.300.000000",
            "kato": [
                {"ref_kato_code": "750000000"},
                {"ref_kato_code": "110000000"}
            ]
        }))
        .unwrap();
        assert_eq!(record.kato_code().as_deref(), Some("750000000"));

        let empty: PlanRecord = serde_json::from_value(json!({"id": 12, "kato": []})).unwrap();
        assert_eq!(empty.kato_code(), None);
    }

    #[test]
    fn numeric_fields_tolerate_quoted_numbers() {
        let record: PlanRecord = serde_json::from_value(json!({
            "id": 7,
            "price": "1500.50",
            "count": 3,
            "amount": null
        }))
        .unwrap();
        assert_eq!(record.price, Some(1500.50));
        assert_eq!(record.count, Some(3.0));
        assert_eq!(record.amount, None);
    }

    #[test]
    fn contract_last_update_prefers_index_date() {
        let record: ContractRecord = serde_json::from_value(json!({
            "id": 1,
            "index_date": "2024-06-01 09:00:00",
            "crdate": "2024-05-20 00:00:00"
        }))
        .unwrap();
        assert_eq!(record.last_update(), Some(dt(2024, 6, 1, 9, 0, 0)));

        let fallback: ContractRecord =
            serde_json::from_value(json!({"id": 2, "crdate": "2024-05-20 00:00:00"})).unwrap();
        assert_eq!(fallback.last_update(), Some(dt(2024, 5, 20, 0, 0, 0)));
    }

    #[test]
    fn blank_supplier_bin_becomes_none() {
        let record: ContractRecord =
            serde_json::from_value(json!({"id": 3, "supplier_biin": "   "})).unwrap();
        assert_eq!(record.supplier_bin(), None);

        let record: ContractRecord =
            serde_json::from_value(json!({"id": 4, "supplier_biin": " 123456789012 "})).unwrap();
        assert_eq!(record.supplier_bin().as_deref(), Some("123456789012"));
    }

    #[test]
    fn contract_link_uses_portal_pattern() {
        assert_eq!(
            contract_link(42),
            "https://goszakup.gov.kz/ru/contract/show/42"
        );
    }
}
