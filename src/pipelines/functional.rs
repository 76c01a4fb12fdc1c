use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use log::{info, warn};
use tokio::task;

use crate::config::defs::{
    GENEFAMILIES_SUFFIX, GENEFAMILIES_TABLE, PATHABUNDANCE_SUFFIX, PATHABUNDANCE_TABLE,
    PATHCOVERAGE_SUFFIX, PATHCOVERAGE_TABLE, PipelineError, RunConfig,
};
use crate::pipelines::aggregate::{required_path, resolve_store_path};
use crate::utils::file::scan_by_suffix;
use crate::utils::records::{FunctionalRecord, parse_functional_file};
use crate::utils::store::Store;

const VIEWS: &[(&str, &str)] = &[
    (GENEFAMILIES_SUFFIX, GENEFAMILIES_TABLE),
    (PATHABUNDANCE_SUFFIX, PATHABUNDANCE_TABLE),
    (PATHCOVERAGE_SUFFIX, PATHCOVERAGE_TABLE),
];

/// Side aggregation for functional-profiling outputs: concatenates the three
/// fixed view kinds across samples and appends them to an already-finalized
/// store as a second, independent writer session.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let stage_start = Instant::now();

    let input_dir = required_path(&config, &config.args.input_dir, "--input")?;
    let store_path = resolve_store_path(&config);
    if !store_path.exists() {
        return Err(PipelineError::InvalidConfig(format!(
            "store {} not found; run the aggregate module first",
            store_path.display()
        )));
    }

    let mut views: Vec<(&'static str, Vec<FunctionalRecord>)> = Vec::new();
    let mut total_files = 0usize;
    for (suffix, table) in VIEWS.iter().copied() {
        let files = scan_by_suffix(&input_dir, suffix)?;
        if files.is_empty() {
            warn!("No '{}' files found; skipping {}", suffix, table);
            continue;
        }
        total_files += files.len();

        let mut tasks = Vec::new();
        for (sample, path) in files {
            tasks.push(task::spawn_blocking(
                move || -> Result<Vec<FunctionalRecord>, PipelineError> {
                    parse_functional_file(&path, &sample)
                },
            ));
        }
        let mut records: Vec<FunctionalRecord> = Vec::new();
        for set in try_join_all(tasks)
            .await
            .map_err(|e| PipelineError::TaskFailure(e.to_string()))?
        {
            records.extend(set?);
        }
        info!("View '{}': {} rows", table, records.len());
        views.push((table, records));
    }

    if total_files == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "no functional-profiling files found in {}",
            input_dir.display()
        )));
    }

    // Second single-writer session against the finalized store; existing
    // tables are never replaced.
    let export_dir = config.out_dir.clone();
    let run_prefix = config.args.prefix.clone();
    task::spawn_blocking(move || -> Result<(), PipelineError> {
        let store = Store::append(&store_path, &export_dir, &run_prefix)?;
        for (table, records) in &views {
            store.write_table(table, records)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::TaskFailure(e.to_string()))??;

    info!(
        "Functional summary appended in {} ms",
        stage_start.elapsed().as_millis()
    );
    Ok(())
}
