//! Per-run report files: JSON summaries, the outcome triage table and the parquet export.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use lmig_core::{OutcomeStatus, RecordOutcome};
use lmig_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::driver::RunReport;

const TRIAGE_ROW_LIMIT: usize = 200;

/// Append-only JSONL of every outcome for one entity type within one run.
#[derive(Debug, Clone)]
pub struct OutcomeLog {
    path: PathBuf,
}

impl OutcomeLog {
    pub fn new(run_dir: &Path, entity_type: &str) -> Self {
        Self {
            path: run_dir.join("outcomes").join(format!("{entity_type}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns once the lines are on disk.
    pub async fn append(&self, outcomes: &[RecordOutcome]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut buf = Vec::new();
        for outcome in outcomes {
            serde_json::to_writer(&mut buf, outcome).context("serializing record outcome")?;
            buf.push(b'\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(&buf)
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.sync_data()
            .await
            .with_context(|| format!("syncing {}", self.path.display()))?;
        Ok(())
    }

    pub async fn read_all(&self) -> Result<Vec<RecordOutcome>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking {}", self.path.display()))?
        {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing {} line {}", self.path.display(), idx + 1))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub reports_dir: PathBuf,
    pub summary: PathBuf,
    pub brief: PathBuf,
    pub parquet_manifest: PathBuf,
}

pub async fn write_run_reports(run_dir: &Path, report: &RunReport) -> Result<ReportPaths> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let summary = run_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(&summary, bytes)
        .await
        .context("writing summary.json")?;

    let brief = run_dir.join("migration_brief.md");
    fs::write(&brief, render_brief(report))
        .await
        .context("writing migration_brief.md")?;

    let mut outcomes = Vec::new();
    for entity in &report.entities {
        outcomes.extend(OutcomeLog::new(run_dir, &entity.entity_type).read_all().await?);
    }
    let parquet_manifest = export_parquet(run_dir, &outcomes).await?;

    Ok(ReportPaths {
        reports_dir: run_dir.to_path_buf(),
        summary,
        brief,
        parquet_manifest,
    })
}

pub fn render_brief(report: &RunReport) -> String {
    let totals = report.totals();
    let mut lines = vec![
        "# Legacy Migration Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", report.run_id),
        format!("- Started: {}", report.started_at),
        format!("- Finished: {}", report.finished_at),
        format!("- Entity types: {}", report.entities.len()),
        format!(
            "- Records: {} migrated, {} skipped, {} quarantined",
            totals.migrated, totals.skipped, totals.quarantined
        ),
        String::new(),
        "## Entity Types".to_string(),
        String::new(),
        "| entity type | migrated | skipped | quarantined | batches | status |".to_string(),
        "|---|---:|---:|---:|---:|---|".to_string(),
    ];
    for entity in &report.entities {
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} |",
            entity.entity_type,
            entity.migrated,
            entity.skipped,
            entity.quarantined,
            entity.batches.len(),
            entity.status()
        ));
    }

    let quarantined = report
        .entities
        .iter()
        .flat_map(|e| e.batches.iter())
        .flat_map(|b| b.quarantined_records.iter())
        .collect::<Vec<_>>();
    lines.push(String::new());
    lines.push("## Quarantine Triage".to_string());
    lines.push(String::new());
    if quarantined.is_empty() {
        lines.push("No records were quarantined.".to_string());
    } else {
        lines.push("| entity type | legacy id | class | stage | code | attempts |".to_string());
        lines.push("|---|---|---|---|---|---:|".to_string());
        for outcome in quarantined.iter().take(TRIAGE_ROW_LIMIT) {
            lines.push(format!(
                "| {} | {} | {} | {} | {} | {} |",
                outcome.entity_type,
                outcome.legacy_id,
                outcome.error_class.map(|c| c.as_str()).unwrap_or("-"),
                outcome.failure_stage.map(|s| s.as_str()).unwrap_or("-"),
                outcome.error_code.as_deref().unwrap_or("-").replace('|', "/"),
                outcome.attempts
            ));
        }
        if quarantined.len() > TRIAGE_ROW_LIMIT {
            lines.push(String::new());
            lines.push(format!(
                "{} more quarantined records in `exports/quarantine.parquet`.",
                quarantined.len() - TRIAGE_ROW_LIMIT
            ));
        }
    }

    lines.push(String::new());
    lines.push("## Stage Latency".to_string());
    lines.push(String::new());
    lines.push("| label | count | p50 ms | p95 ms |".to_string());
    lines.push("|---|---:|---:|---:|".to_string());
    for (label, stats) in &report.perf {
        lines.push(format!(
            "| {} | {} | {:.2} | {:.2} |",
            label, stats.count, stats.p50, stats.p95
        ));
    }
    if !report.budget_violations.is_empty() {
        lines.push(String::new());
        lines.push("## Perf Budget Violations".to_string());
        lines.push(String::new());
        for v in &report.budget_violations {
            lines.push(format!(
                "- {}: p95 {:.2}ms exceeds {:.2}ms",
                v.label, v.p95_ms, v.budget_ms
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet(run_dir: &Path, outcomes: &[RecordOutcome]) -> Result<PathBuf> {
    let exports_dir = run_dir.join("exports");
    fs::create_dir_all(&exports_dir)
        .await
        .with_context(|| format!("creating {}", exports_dir.display()))?;

    let outcomes_path = exports_dir.join("outcomes.parquet");
    let quarantine_path = exports_dir.join("quarantine.parquet");
    let quarantined = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Quarantined)
        .cloned()
        .collect::<Vec<_>>();

    write_outcomes_parquet(&outcomes_path, outcomes)?;
    write_quarantine_parquet(&quarantine_path, &quarantined)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("outcomes", run_dir, &outcomes_path, outcomes.len())?,
            manifest_entry("quarantine", run_dir, &quarantine_path, quarantined.len())?,
        ],
    };
    let manifest_path = exports_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> StringArray {
    StringArray::from(values.collect::<Vec<_>>())
}

fn write_outcomes_parquet(path: &Path, outcomes: &[RecordOutcome]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_type", DataType::Utf8, false),
        ArrowField::new("legacy_id", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("target_id", DataType::Utf8, true),
        ArrowField::new("resolution", DataType::Utf8, true),
        ArrowField::new("error_class", DataType::Utf8, true),
        ArrowField::new("error_code", DataType::Utf8, true),
        ArrowField::new("failure_stage", DataType::Utf8, true),
        ArrowField::new("attempts", DataType::UInt32, false),
    ]));

    let target_ids = StringArray::from(
        outcomes
            .iter()
            .map(|o| o.target_id.map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(outcomes.iter().map(|o| Some(o.entity_type.as_str())))),
            Arc::new(strings(outcomes.iter().map(|o| Some(o.legacy_id.as_str())))),
            Arc::new(strings(outcomes.iter().map(|o| Some(o.status.as_str())))),
            Arc::new(target_ids),
            Arc::new(strings(outcomes.iter().map(|o| o.resolution.map(|r| r.as_str())))),
            Arc::new(strings(outcomes.iter().map(|o| o.error_class.map(|c| c.as_str())))),
            Arc::new(strings(outcomes.iter().map(|o| o.error_code.as_deref()))),
            Arc::new(strings(outcomes.iter().map(|o| o.failure_stage.map(|s| s.as_str())))),
            Arc::new(UInt32Array::from(
                outcomes.iter().map(|o| o.attempts).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building outcomes record batch")?;
    write_parquet(path, batch)
}

fn write_quarantine_parquet(path: &Path, quarantined: &[RecordOutcome]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_type", DataType::Utf8, false),
        ArrowField::new("legacy_id", DataType::Utf8, false),
        ArrowField::new("error_class", DataType::Utf8, true),
        ArrowField::new("failure_stage", DataType::Utf8, true),
        ArrowField::new("error_code", DataType::Utf8, true),
        ArrowField::new("error_message", DataType::Utf8, true),
        ArrowField::new("attempts", DataType::UInt32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(quarantined.iter().map(|o| Some(o.entity_type.as_str())))),
            Arc::new(strings(quarantined.iter().map(|o| Some(o.legacy_id.as_str())))),
            Arc::new(strings(quarantined.iter().map(|o| o.error_class.map(|c| c.as_str())))),
            Arc::new(strings(quarantined.iter().map(|o| o.failure_stage.map(|s| s.as_str())))),
            Arc::new(strings(quarantined.iter().map(|o| o.error_code.as_deref()))),
            Arc::new(strings(quarantined.iter().map(|o| o.error_message.as_deref()))),
            Arc::new(UInt32Array::from(
                quarantined.iter().map(|o| o.attempts).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building quarantine record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
        rows,
    })
}
