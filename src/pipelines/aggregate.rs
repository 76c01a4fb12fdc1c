use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use log::{debug, info};
use tokio::task;

use crate::config::defs::{
    ABUND_NAMESPACE, ALLELES_TABLE, ORTHOLOG_TABLE, PipelineError, READCOUNTS_TABLE, RunConfig,
    TAXONOMIC_TABLE,
};
use crate::utils::abundance::{
    GroupAbundance, check_taxo_rank_totals, normalize_alleles, reconcile_read_counts,
    rollup_group, rollup_ortholog,
};
use crate::utils::file::scan_by_suffix;
use crate::utils::records::{
    AlleleRecord, TaxonRecord, parse_manifest, parse_quant_file, parse_read_counts,
    parse_taxo_file,
};
use crate::utils::reference::{HierarchyKind, ReferenceStore};
use crate::utils::store::Store;

/// Primary aggregation pass: parse per-sample outputs, normalize, roll up
/// through every discovered hierarchy, reconcile read counts, and assemble
/// the store plus flat exports.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let stage_start = Instant::now();

    let input_dir = required_path(&config, &config.args.input_dir, "--input")?;
    let ref_path = required_path(&config, &config.args.ref_store, "--ref-store")?;
    let counts_path = required_path(&config, &config.args.read_counts, "--read-counts")?;
    let manifest_path = required_path(&config, &config.args.manifest, "--manifest")?;

    // Per-sample output discovery; the external scheduler has already
    // guaranteed completion, so a missing expected file is a parse failure.
    let quant_files = scan_by_suffix(&input_dir, &config.args.quant_suffix)?;
    if quant_files.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "no '{}' quantification files found in {}",
            config.args.quant_suffix,
            input_dir.display()
        )));
    }
    let taxo_files = scan_by_suffix(&input_dir, &config.args.taxo_suffix)?;
    check_sample_sets(&quant_files, &taxo_files, &config.args.taxo_suffix)?;
    info!("Found {} samples in {}", quant_files.len(), input_dir.display());

    // Parsing and normalization are independent per sample and fan out
    let mut quant_tasks = Vec::new();
    for (sample, path) in quant_files {
        quant_tasks.push(task::spawn_blocking(
            move || -> Result<Vec<AlleleRecord>, PipelineError> {
                let mut records = parse_quant_file(&path, &sample)?;
                normalize_alleles(&mut records, &sample)?;
                Ok(records)
            },
        ));
    }
    let mut alleles: Vec<AlleleRecord> = Vec::new();
    for set in try_join_all(quant_tasks)
        .await
        .map_err(|e| PipelineError::TaskFailure(e.to_string()))?
    {
        alleles.extend(set?);
    }
    info!("Parsed and normalized {} allele rows", alleles.len());

    let mut taxo_tasks = Vec::new();
    for (sample, path) in taxo_files {
        taxo_tasks.push(task::spawn_blocking(
            move || -> Result<Vec<TaxonRecord>, PipelineError> { parse_taxo_file(&path, &sample) },
        ));
    }
    let mut taxa: Vec<TaxonRecord> = Vec::new();
    for set in try_join_all(taxo_tasks)
        .await
        .map_err(|e| PipelineError::TaskFailure(e.to_string()))?
    {
        taxa.extend(set?);
    }
    check_taxo_rank_totals(&taxa)?;
    info!("Parsed {} taxonomic profile rows", taxa.len());

    // Reference hierarchies, discovered once from the listing
    let reference = ReferenceStore::open(&ref_path)?;
    let listings = reference.list_hierarchies()?;
    debug!(
        "Reference store lists {} hierarchies: {:?}",
        listings.len(),
        listings.iter().map(|l| l.name.as_str()).collect::<Vec<_>>()
    );

    let mut rollups: Vec<(String, Vec<GroupAbundance>)> = Vec::new();
    for listing in listings.iter().filter(|l| l.kind == HierarchyKind::Generic) {
        let mapping = reference.load_group_mapping(&listing.name)?;
        let table = rollup_group(&alleles, &mapping);
        info!(
            "Hierarchy '{}': rolled up {} group rows",
            listing.name,
            table.len()
        );
        rollups.push((format!("{}/{}", ABUND_NAMESPACE, listing.name), table));
    }

    let ortholog_mapping = reference.load_ortholog_mapping()?;
    let orthologs = rollup_ortholog(&alleles, &ortholog_mapping);
    info!("Ortholog rollup: {} rows", orthologs.len());

    let mut read_counts = parse_read_counts(&counts_path)?;
    reconcile_read_counts(&mut read_counts, &alleles)?;
    info!("Reconciled read counts for {} samples", read_counts.len());

    let manifest = parse_manifest(&manifest_path)?;

    // Single writer session; staged and renamed into place on success
    let store_path = resolve_store_path(&config);
    let export_dir = config.out_dir.clone();
    let run_prefix = config.args.prefix.clone();
    task::spawn_blocking(move || -> Result<(), PipelineError> {
        let store = Store::stage(&store_path, &export_dir, &run_prefix)?;
        store.write_metadata(&manifest)?;
        store.write_table(ALLELES_TABLE, &alleles)?;
        store.write_table(TAXONOMIC_TABLE, &taxa)?;
        for (name, table) in &rollups {
            store.write_table(name, table)?;
        }
        store.write_table(ORTHOLOG_TABLE, &orthologs)?;
        store.write_table(READCOUNTS_TABLE, &read_counts)?;
        let final_path = store.finalize()?;
        info!("Finalized store at {}", final_path.display());
        Ok(())
    })
    .await
    .map_err(|e| PipelineError::TaskFailure(e.to_string()))??;

    info!(
        "Aggregation complete in {} ms",
        stage_start.elapsed().as_millis()
    );
    Ok(())
}

pub(crate) fn required_path(
    config: &RunConfig,
    value: &Option<String>,
    flag: &str,
) -> Result<PathBuf, PipelineError> {
    let value = value
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidConfig(format!("{} is required", flag)))?;
    let path = PathBuf::from(value);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(config.cwd.join(path))
    }
}

pub(crate) fn resolve_store_path(config: &RunConfig) -> PathBuf {
    let path = PathBuf::from(&config.args.store);
    if path.is_absolute() {
        path
    } else {
        config.out_dir.join(path)
    }
}

fn check_sample_sets(
    quant_files: &[(String, PathBuf)],
    taxo_files: &[(String, PathBuf)],
    taxo_suffix: &str,
) -> Result<(), PipelineError> {
    let quant: BTreeSet<&str> = quant_files.iter().map(|(s, _)| s.as_str()).collect();
    let taxo: BTreeSet<&str> = taxo_files.iter().map(|(s, _)| s.as_str()).collect();
    if quant != taxo {
        let missing: Vec<&str> = quant.symmetric_difference(&taxo).copied().collect();
        return Err(PipelineError::Parse {
            path: format!("*{}", taxo_suffix),
            error: format!(
                "quantification and taxonomic profiles cover different samples: {:?}",
                missing
            ),
        });
    }
    Ok(())
}
