//! Pipeline orchestration
//!
//! Runs reset, raw staging, dimension build, fact build, validation and
//! publish in that order, or any one of them on its own. Every run holds the
//! staging store's run lock for its whole duration.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::dataset::{Dataset, Value};
use crate::dimension::{DimensionBuild, DimensionBuilder, JoinGap};
use crate::engine::QueryEngine;
use crate::error::{EtlError, EtlResult};
use crate::fact::{CategoryMapping, FactBuilder};
use crate::load::{LoadReport, StagingLoader, WarehouseLoader};
use crate::schema::{FACT_SALES, SchemaManager, StarSchema};
use crate::stage::{DEFAULT_SOURCE_TABLES, SourceStager};
use crate::store::Store;
use crate::validate::{DimensionKeys, IntegrityReport, OrphanPolicy, enforce};

/// Knobs for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// First day of dim_date
    pub date_start: NaiveDate,
    /// Last day of dim_date, inclusive
    pub date_end: NaiveDate,
    pub orphan_policy: OrphanPolicy,
    pub category_mapping: CategoryMapping,
    /// Fail when an inner join drops rows
    pub strict_joins: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            date_start: NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or_default(),
            date_end: NaiveDate::from_ymd_opt(2014, 12, 31).unwrap_or_default(),
            orphan_policy: OrphanPolicy::default(),
            category_mapping: CategoryMapping::default(),
            strict_joins: false,
        }
    }
}

/// One step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    ResetSchema,
    StageRaw,
    Dimensions,
    Facts,
    Validate,
    Publish,
}

impl Stage {
    /// Every stage in run order
    pub const ALL: [Stage; 6] = [
        Stage::ResetSchema,
        Stage::StageRaw,
        Stage::Dimensions,
        Stage::Facts,
        Stage::Validate,
        Stage::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResetSchema => "reset-schema",
            Stage::StageRaw => "stage-raw",
            Stage::Dimensions => "dimensions",
            Stage::Facts => "facts",
            Stage::Validate => "validate",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Stage::ALL.iter().map(Stage::as_str).collect();
                EtlError::Config(format!(
                    "Unknown stage '{}', expected one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}

/// What one stage did
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Tables created or written
    pub tables: Vec<LoadReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub join_gaps: Vec<JoinGap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
    pub duration_ms: u64,
}

impl StageReport {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            tables: Vec::new(),
            join_gaps: Vec::new(),
            integrity: None,
            duration_ms: 0,
        }
    }
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
    /// Star table -> fingerprint of its published contents
    pub fingerprints: BTreeMap<String, String>,
    /// Sum of fact_penjualan.totalpenjualan in the warehouse
    pub fact_total: Option<Decimal>,
    pub duration_ms: u64,
}

/// Drives the ETL across the three stores
pub struct Pipeline {
    source: Arc<dyn Store>,
    staging: Arc<dyn Store>,
    warehouse: Arc<dyn Store>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn Store>,
        staging: Arc<dyn Store>,
        warehouse: Arc<dyn Store>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            staging,
            warehouse,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run every stage in order
    ///
    /// Stops at the first failing stage. Whatever earlier stages wrote is
    /// left in place.
    pub async fn run(&self) -> EtlResult<RunSummary> {
        self.locked(&Stage::ALL).await
    }

    /// Run a single stage against whatever the stores currently hold
    pub async fn run_stage(&self, stage: Stage) -> EtlResult<RunSummary> {
        self.locked(&[stage]).await
    }

    async fn locked(&self, stages: &[Stage]) -> EtlResult<RunSummary> {
        if !self.staging.try_lock_run().await? {
            return Err(EtlError::RunLocked(self.staging.role().to_string()));
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline", run_id = %run_id);
        let result = self.execute(run_id, stages).instrument(span).await;

        if let Err(e) = self.staging.unlock_run().await {
            warn!(run_id = %run_id, error = %e, "Failed to release run lock");
        }
        result
    }

    async fn execute(&self, run_id: Uuid, stages: &[Stage]) -> EtlResult<RunSummary> {
        let started = Instant::now();
        let mut summary = RunSummary {
            run_id,
            started_at: Utc::now(),
            stages: Vec::with_capacity(stages.len()),
            fingerprints: BTreeMap::new(),
            fact_total: None,
            duration_ms: 0,
        };
        info!(
            stages = stages.len(),
            source = self.source.backend_type(),
            staging = self.staging.backend_type(),
            warehouse = self.warehouse.backend_type(),
            "Pipeline run started"
        );

        for stage in stages {
            let stage_started = Instant::now();
            info!(stage = %stage, "Stage started");

            let mut report = match stage {
                Stage::ResetSchema => self.reset_schema().await,
                Stage::StageRaw => self.stage_raw().await,
                Stage::Dimensions => self.build_dimensions().await,
                Stage::Facts => self.build_facts().await,
                Stage::Validate => self.validate().await,
                Stage::Publish => self.publish(&mut summary).await,
            }
            .inspect_err(|e| warn!(stage = %stage, error = %e, "Stage failed"))?;

            report.duration_ms = stage_started.elapsed().as_millis() as u64;
            info!(stage = %stage, duration_ms = report.duration_ms, "Stage finished");
            summary.stages.push(report);
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(duration_ms = summary.duration_ms, "Pipeline run finished");
        Ok(summary)
    }

    async fn reset_schema(&self) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::ResetSchema);
        let created = SchemaManager::new(self.staging.clone()).reset_schema().await?;
        report.tables = created
            .into_iter()
            .map(|table| LoadReport { table, rows: 0 })
            .collect();
        Ok(report)
    }

    async fn stage_raw(&self) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::StageRaw);
        report.tables = SourceStager::new(self.source.clone(), self.staging.clone())
            .stage_raw_tables(&DEFAULT_SOURCE_TABLES)
            .await?;
        Ok(report)
    }

    async fn build_dimensions(&self) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::Dimensions);
        let builder =
            DimensionBuilder::new(self.staging.clone()).strict_joins(self.options.strict_joins);
        let loader = StagingLoader::new(self.staging.clone());

        let builds: Vec<DimensionBuild> = vec![
            builder.build_product().await?,
            builder.build_customer().await?,
            builder.build_category().await?,
            DimensionBuilder::build_date(self.options.date_start, self.options.date_end)?,
        ];
        for build in builds {
            report.tables.push(loader.load(&build.dataset).await?);
            report.join_gaps.extend(build.join_gap);
        }
        Ok(report)
    }

    async fn build_facts(&self) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::Facts);
        let build = FactBuilder::new(self.staging.clone())
            .strict_joins(self.options.strict_joins)
            .category_mapping(self.options.category_mapping)
            .build_sales_fact()
            .await?;
        let mut fact = build.dataset;

        let keys = DimensionKeys::read(self.staging.as_ref()).await?;
        let integrity = enforce(&mut fact, &keys, self.options.orphan_policy)?;

        report
            .tables
            .push(StagingLoader::new(self.staging.clone()).load(&fact).await?);
        report.join_gaps.push(build.join_gap);
        report.integrity = Some(integrity);
        Ok(report)
    }

    /// Re-check the staged fact against the staged dimensions
    async fn check_staged(&self) -> EtlResult<IntegrityReport> {
        let fact = self.staging.read_table(FACT_SALES).await?;
        let keys = DimensionKeys::read(self.staging.as_ref()).await?;
        IntegrityReport::check(&fact, &keys)?.into_result()
    }

    async fn validate(&self) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::Validate);
        report.integrity = Some(self.check_staged().await?);
        Ok(report)
    }

    async fn publish(&self, summary: &mut RunSummary) -> EtlResult<StageReport> {
        let mut report = StageReport::new(Stage::Publish);
        report.integrity = Some(self.check_staged().await?);
        report.tables = WarehouseLoader::new(self.staging.clone(), self.warehouse.clone())
            .publish()
            .await?;

        for def in StarSchema::tables() {
            let staged = self.staging.read_table(&def.name).await?.fingerprint();
            let published = self.warehouse.read_table(&def.name).await?;
            let fingerprint = published.fingerprint();
            if fingerprint != staged {
                warn!(table = %def.name, "Published table differs from its staged copy");
            }
            if def.name == FACT_SALES {
                summary.fact_total = Some(fact_total(&published).await?);
            }
            summary.fingerprints.insert(def.name, fingerprint);
        }
        Ok(report)
    }
}

/// Sum of totalpenjualan over the published fact, zero when it is empty
async fn fact_total(fact: &Dataset) -> EtlResult<Decimal> {
    let engine = QueryEngine::new();
    engine.register(FACT_SALES, fact, &["totalpenjualan"])?;
    let totals = engine
        .query(
            "fact_total",
            &format!("SELECT SUM(totalpenjualan) AS total FROM {FACT_SALES}"),
        )
        .await?;
    Ok(totals
        .value(0, 0)
        .and_then(Value::as_decimal)
        .unwrap_or_default())
}
