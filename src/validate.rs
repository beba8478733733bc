//! Referential and date-coverage checks for the fact table
//!
//! Fact rows must point at existing product, customer and date keys. A
//! non-null categoryid must exist in dim_category. A datekey outside the
//! generated calendar is reported as a coverage gap, not a referential
//! violation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

use crate::dataset::{Dataset, Value};
use crate::error::{EtlError, EtlResult};
use crate::schema::{DIM_CATEGORY, DIM_CUSTOMER, DIM_DATE, DIM_PRODUCT};
use crate::store::Store;

/// Number of offending key values kept per gap
pub const SAMPLE_LIMIT: usize = 5;

/// What to do with fact rows whose keys are missing from a dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Abort the run
    #[default]
    Fail,
    /// Remove the offending rows and continue
    Drop,
}

/// Key sets of the dimensions a fact row can reference
#[derive(Debug, Clone, Default)]
pub struct DimensionKeys {
    pub product: HashSet<i64>,
    pub customer: HashSet<i64>,
    pub category: HashSet<i64>,
    pub date: HashSet<i64>,
}

impl DimensionKeys {
    /// Collect keys from built dimension datasets
    pub fn from_datasets(
        product: &Dataset,
        customer: &Dataset,
        category: &Dataset,
        date: &Dataset,
    ) -> EtlResult<Self> {
        Ok(Self {
            product: product.distinct_ints("productid")?,
            customer: customer.distinct_ints("customerid")?,
            category: category.distinct_ints("categoryid")?,
            date: date.distinct_ints("datekey")?,
        })
    }

    /// Read keys from the dimension tables of a store
    pub async fn read(store: &dyn Store) -> EtlResult<Self> {
        Self::from_datasets(
            &store.read_table(DIM_PRODUCT).await?,
            &store.read_table(DIM_CUSTOMER).await?,
            &store.read_table(DIM_CATEGORY).await?,
            &store.read_table(DIM_DATE).await?,
        )
    }
}

/// Fact rows referencing keys absent from one dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyGap {
    pub dimension: String,
    pub column: String,
    pub missing_rows: usize,
    /// Smallest offending values, NULL keys excluded
    pub sample: Vec<i64>,
}

/// Fact datekeys against the generated calendar
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DateCoverage {
    pub fact_min: Option<i64>,
    pub fact_max: Option<i64>,
    pub calendar_min: Option<i64>,
    pub calendar_max: Option<i64>,
    pub missing_rows: usize,
    pub sample: Vec<i64>,
}

/// Result of checking a fact dataset against its dimensions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub fact_rows: usize,
    pub key_gaps: Vec<KeyGap>,
    pub date_coverage: DateCoverage,
    /// Rows removed under [`OrphanPolicy::Drop`]
    pub dropped_rows: usize,
}

/// One foreign-key style check
struct KeyCheck<'a> {
    dimension: &'static str,
    column: &'static str,
    keys: &'a HashSet<i64>,
    null_allowed: bool,
}

impl KeyCheck<'_> {
    fn accepts(&self, value: &Value) -> bool {
        match value.as_i64() {
            Some(key) => self.keys.contains(&key),
            None => value.is_null() && self.null_allowed,
        }
    }
}

fn key_checks(keys: &DimensionKeys) -> [KeyCheck<'_>; 3] {
    [
        KeyCheck {
            dimension: DIM_PRODUCT,
            column: "productid",
            keys: &keys.product,
            null_allowed: false,
        },
        KeyCheck {
            dimension: DIM_CUSTOMER,
            column: "customerid",
            keys: &keys.customer,
            null_allowed: false,
        },
        KeyCheck {
            dimension: DIM_CATEGORY,
            column: "categoryid",
            keys: &keys.category,
            null_allowed: true,
        },
    ]
}

fn date_check(keys: &DimensionKeys) -> KeyCheck<'_> {
    KeyCheck {
        dimension: DIM_DATE,
        column: "datekey",
        keys: &keys.date,
        null_allowed: false,
    }
}

impl IntegrityReport {
    /// Check every fact row against the dimension keys
    ///
    /// # Returns
    /// The report; use [`IntegrityReport::into_result`] to turn gaps into errors
    pub fn check(fact: &Dataset, keys: &DimensionKeys) -> EtlResult<Self> {
        let mut key_gaps = Vec::new();
        for check in key_checks(keys) {
            let idx = fact.require_column(check.column)?;
            let (missing_rows, sample) = scan(fact, idx, &check);
            if missing_rows > 0 {
                key_gaps.push(KeyGap {
                    dimension: check.dimension.to_string(),
                    column: check.column.to_string(),
                    missing_rows,
                    sample,
                });
            }
        }

        let date = date_check(keys);
        let idx = fact.require_column(date.column)?;
        let (missing_rows, sample) = scan(fact, idx, &date);
        let fact_keys = fact.distinct_ints(date.column)?;
        let date_coverage = DateCoverage {
            fact_min: fact_keys.iter().min().copied(),
            fact_max: fact_keys.iter().max().copied(),
            calendar_min: keys.date.iter().min().copied(),
            calendar_max: keys.date.iter().max().copied(),
            missing_rows,
            sample,
        };

        Ok(Self {
            fact_rows: fact.row_count(),
            key_gaps,
            date_coverage,
            dropped_rows: 0,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.key_gaps.is_empty() && self.date_coverage.missing_rows == 0
    }

    /// Map the first gap found to its error
    pub fn into_result(self) -> EtlResult<Self> {
        if let Some(gap) = self.key_gaps.first() {
            return Err(EtlError::ReferentialViolation {
                dimension: gap.dimension.clone(),
                column: gap.column.clone(),
                missing: gap.missing_rows,
                sample: gap.sample.clone(),
            });
        }
        if self.date_coverage.missing_rows > 0 {
            return Err(EtlError::RangeCoverageGap {
                missing: self.date_coverage.missing_rows,
                sample: self.date_coverage.sample.clone(),
            });
        }
        Ok(self)
    }
}

/// Count rows failing a check and collect the smallest offending keys
fn scan(fact: &Dataset, idx: usize, check: &KeyCheck<'_>) -> (usize, Vec<i64>) {
    let mut missing = 0;
    let mut offending = BTreeSet::new();
    for row in fact.rows() {
        if !check.accepts(&row[idx]) {
            missing += 1;
            if let Some(key) = row[idx].as_i64() {
                offending.insert(key);
            }
        }
    }
    (missing, offending.into_iter().take(SAMPLE_LIMIT).collect())
}

/// Check a fact dataset and apply the orphan policy
///
/// Under [`OrphanPolicy::Drop`] offending rows are removed from `fact` and
/// counted in the returned report. Under [`OrphanPolicy::Fail`] any gap is
/// an error and `fact` is left untouched.
pub fn enforce(
    fact: &mut Dataset,
    keys: &DimensionKeys,
    policy: OrphanPolicy,
) -> EtlResult<IntegrityReport> {
    let mut report = IntegrityReport::check(fact, keys)?;
    if report.is_clean() {
        info!(rows = report.fact_rows, "Fact rows pass integrity checks");
        return Ok(report);
    }

    match policy {
        OrphanPolicy::Fail => report.into_result(),
        OrphanPolicy::Drop => {
            let mut checks: Vec<(usize, KeyCheck<'_>)> = Vec::new();
            for check in key_checks(keys).into_iter().chain([date_check(keys)]) {
                checks.push((fact.require_column(check.column)?, check));
            }
            let dropped =
                fact.retain_rows(|row| checks.iter().all(|(idx, check)| check.accepts(&row[*idx])));

            for gap in &report.key_gaps {
                warn!(
                    dimension = %gap.dimension,
                    rows = gap.missing_rows,
                    sample = ?gap.sample,
                    "Fact rows reference missing dimension keys"
                );
            }
            if report.date_coverage.missing_rows > 0 {
                warn!(
                    rows = report.date_coverage.missing_rows,
                    sample = ?report.date_coverage.sample,
                    "Fact datekeys fall outside dim_date"
                );
            }
            warn!(dropped, remaining = fact.row_count(), "Dropped orphaned fact rows");

            report.dropped_rows = dropped;
            Ok(report)
        }
    }
}
