use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, warn};

use crate::config::defs::PipelineError;
use crate::utils::records::{AlleleRecord, ReadCountRecord, TaxonRecord};
use crate::utils::reference::GroupMapping;

/// One row of a group-level rollup table.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAbundance {
    pub sample: String,
    pub group: String,
    pub proportion: f64,
}

/// One row of the reserved ortholog rollup table.
#[derive(Debug, Clone, PartialEq)]
pub struct OrthologAbundance {
    pub sample: String,
    pub ortholog: String,
    pub proportion: f64,
    pub nreads: u64,
}

/// Computes within-sample proportional abundance for one sample's allele
/// records: depth divided by the sample's total depth.
///
/// A sample with zero total depth cannot have meaningful rollups and fails
/// the whole aggregation rather than emitting NaNs.
pub fn normalize_alleles(records: &mut [AlleleRecord], sample: &str) -> Result<(), PipelineError> {
    let total: f64 = records.iter().map(|r| r.depth).sum();
    if total <= 0.0 {
        return Err(PipelineError::Normalization(format!(
            "sample '{}' has zero total depth",
            sample
        )));
    }
    for record in records.iter_mut() {
        record.proportion = record.depth / total;
    }
    Ok(())
}

/// Rolls the cross-sample allele table up through one generic allele→gene→group
/// hierarchy.
///
/// Gene level: proportions of all alleles encoding a gene are summed per
/// sample (multiple alleles can encode the same gene). Group level: the gene
/// sums belonging to a group are arithmetic-mean averaged per sample. The
/// sum-then-mean order is deliberate and not interchangeable with a direct
/// sum over alleles.
///
/// Alleles absent from the mapping are dropped from this rollup; a sample
/// contributing no mapped alleles simply produces no rows.
pub fn rollup_group(alleles: &[AlleleRecord], mapping: &GroupMapping) -> Vec<GroupAbundance> {
    // allele → member genes, gene → member groups
    let mut allele_genes: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut gene_groups: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for row in &mapping.rows {
        allele_genes.entry(&row.allele).or_default().push(&row.gene);
        gene_groups.entry(&row.gene).or_default().insert(&row.group);
    }

    let mut gene_sums: BTreeMap<(String, String), f64> = BTreeMap::new();
    let mut unmapped: usize = 0;
    for record in alleles {
        match allele_genes.get(record.allele.as_str()) {
            Some(genes) => {
                for gene in genes {
                    *gene_sums
                        .entry((record.sample.clone(), gene.to_string()))
                        .or_insert(0.0) += record.proportion;
                }
            }
            None => unmapped += 1,
        }
    }
    if unmapped > 0 {
        warn!(
            "{} allele rows had no entry in hierarchy '{}' and were dropped from this rollup",
            unmapped, mapping.name
        );
    }

    let mut group_values: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for ((sample, gene), value) in &gene_sums {
        if let Some(groups) = gene_groups.get(gene.as_str()) {
            for group in groups {
                group_values
                    .entry((sample.clone(), group.to_string()))
                    .or_default()
                    .push(*value);
            }
        }
    }

    let rollup: Vec<GroupAbundance> = group_values
        .into_iter()
        .map(|((sample, group), values)| GroupAbundance {
            sample,
            group,
            proportion: values.iter().sum::<f64>() / values.len() as f64,
        })
        .collect();
    debug!("Hierarchy '{}': {} group rows", mapping.name, rollup.len());
    rollup
}

/// Rolls the allele table up through the reserved many-to-many
/// allele→ortholog mapping. Single level: proportion and read count are both
/// summed per (sample, ortholog), with no averaging stage.
pub fn rollup_ortholog(
    alleles: &[AlleleRecord],
    mapping: &[(String, String)],
) -> Vec<OrthologAbundance> {
    let mut allele_orthologs: HashMap<&str, Vec<&str>> = HashMap::new();
    for (allele, ortholog) in mapping {
        allele_orthologs.entry(allele).or_default().push(ortholog);
    }

    let mut sums: BTreeMap<(String, String), (f64, u64)> = BTreeMap::new();
    for record in alleles {
        if let Some(orthologs) = allele_orthologs.get(record.allele.as_str()) {
            for ortholog in orthologs {
                let entry = sums
                    .entry((record.sample.clone(), ortholog.to_string()))
                    .or_insert((0.0, 0));
                entry.0 += record.proportion;
                entry.1 += record.nreads;
            }
        }
    }

    sums.into_iter()
        .map(|((sample, ortholog), (proportion, nreads))| OrthologAbundance {
            sample,
            ortholog,
            proportion,
            nreads,
        })
        .collect()
}

/// Cross-checks the externally supplied raw read counts against the allele
/// table: aligned_reads per sample is the sum of nreads over that sample's
/// allele rows. Every sample in the raw-count input must appear in the allele
/// table; missing ones are reported together and fail the aggregation.
pub fn reconcile_read_counts(
    counts: &mut [ReadCountRecord],
    alleles: &[AlleleRecord],
) -> Result<(), PipelineError> {
    let mut aligned: HashMap<&str, u64> = HashMap::new();
    for record in alleles {
        *aligned.entry(record.sample.as_str()).or_insert(0) += record.nreads;
    }

    let mut missing = Vec::new();
    for count in counts.iter_mut() {
        match aligned.get(count.sample.as_str()) {
            Some(total) => count.aligned_reads = Some(*total),
            None => missing.push(count.sample.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(PipelineError::Reconciliation(missing));
    }
    Ok(())
}

/// Checks that per-sample taxonomic proportions at any single rank do not
/// exceed 1.0 (within floating-point tolerance). Profilers report nested
/// lineages, so totals per rank are bounded by the whole sample.
pub fn check_taxo_rank_totals(taxa: &[TaxonRecord]) -> Result<(), PipelineError> {
    let mut totals: HashMap<(&str, &str), f64> = HashMap::new();
    for record in taxa {
        *totals
            .entry((record.sample.as_str(), record.rank.as_str()))
            .or_insert(0.0) += record.proportion;
    }
    for ((sample, rank), total) in totals {
        if total > 1.0 + 1e-6 {
            return Err(PipelineError::Normalization(format!(
                "{}: {} abundances total {:.4} > 1",
                sample, rank, total
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::reference::GroupMappingRow;

    const TOLERANCE: f64 = 1e-6;

    fn allele(sample: &str, allele: &str, depth: f64, nreads: u64) -> AlleleRecord {
        AlleleRecord {
            sample: sample.to_string(),
            allele: allele.to_string(),
            depth,
            nreads,
            proportion: 0.0,
        }
    }

    fn mapping(rows: &[(&str, &str, &str)]) -> GroupMapping {
        GroupMapping {
            name: "cags".to_string(),
            rows: rows
                .iter()
                .map(|(a, ge, gr)| GroupMappingRow {
                    allele: a.to_string(),
                    gene: ge.to_string(),
                    group: gr.to_string(),
                })
                .collect(),
        }
    }

    /// Two samples against mapping {x→G1→H, y→G2→H}; worked end-to-end
    /// through normalization, gene sums, and group means.
    #[test]
    fn test_two_sample_rollup() {
        let mut sample_a = vec![allele("A", "x", 10.0, 40), allele("A", "y", 30.0, 120)];
        let mut sample_b = vec![allele("B", "x", 5.0, 20)];
        normalize_alleles(&mut sample_a, "A").unwrap();
        normalize_alleles(&mut sample_b, "B").unwrap();

        assert!((sample_a[0].proportion - 0.25).abs() < TOLERANCE);
        assert!((sample_a[1].proportion - 0.75).abs() < TOLERANCE);
        assert!((sample_b[0].proportion - 1.0).abs() < TOLERANCE);

        let mut alleles = sample_a;
        alleles.extend(sample_b);

        let rollup = rollup_group(&alleles, &mapping(&[("x", "G1", "H"), ("y", "G2", "H")]));
        assert_eq!(rollup.len(), 2);
        assert_eq!(rollup[0].sample, "A");
        assert_eq!(rollup[0].group, "H");
        assert!((rollup[0].proportion - 0.5).abs() < TOLERANCE); // mean(0.25, 0.75)
        assert_eq!(rollup[1].sample, "B");
        assert!((rollup[1].proportion - 1.0).abs() < TOLERANCE); // mean(1.0)
    }

    #[test]
    fn test_group_value_is_mean_not_sum() {
        let mut records = vec![
            allele("A", "x", 20.0, 10),
            allele("A", "y", 20.0, 10),
            allele("A", "z", 60.0, 30),
        ];
        normalize_alleles(&mut records, "A").unwrap();

        // x and y encode the same gene: their proportions add at the gene
        // level, then the two gene values are averaged at the group level.
        let rollup = rollup_group(
            &records,
            &mapping(&[("x", "G1", "H"), ("y", "G1", "H"), ("z", "G2", "H")]),
        );
        assert_eq!(rollup.len(), 1);
        let gene_sum_g1 = 0.2 + 0.2;
        let gene_sum_g2 = 0.6;
        let expected = (gene_sum_g1 + gene_sum_g2) / 2.0;
        assert!((rollup[0].proportion - expected).abs() < TOLERANCE);
        assert!((rollup[0].proportion - (gene_sum_g1 + gene_sum_g2)).abs() > TOLERANCE);
    }

    #[test]
    fn test_normalized_proportions_sum_to_one() {
        let mut records = vec![
            allele("A", "x", 3.5, 1),
            allele("A", "y", 9.25, 2),
            allele("A", "z", 0.75, 3),
        ];
        normalize_alleles(&mut records, "A").unwrap();
        let total: f64 = records.iter().map(|r| r.proportion).sum();
        assert!((total - 1.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_zero_depth_sample_is_error() {
        let mut records = vec![allele("A", "x", 0.0, 0)];
        assert!(matches!(
            normalize_alleles(&mut records, "A"),
            Err(PipelineError::Normalization(_))
        ));
    }

    #[test]
    fn test_unmapped_allele_dropped_without_error() {
        let mut records = vec![allele("A", "x", 10.0, 5), allele("A", "q", 10.0, 5)];
        normalize_alleles(&mut records, "A").unwrap();

        let rollup = rollup_group(&records, &mapping(&[("x", "G1", "H")]));
        assert_eq!(rollup.len(), 1);
        assert!((rollup[0].proportion - 0.5).abs() < TOLERANCE);
    }

    #[test]
    fn test_ortholog_rollup_many_to_many_sums() {
        let mut records = vec![allele("A", "x", 10.0, 40), allele("A", "y", 30.0, 120)];
        normalize_alleles(&mut records, "A").unwrap();

        let mapping = vec![
            ("x".to_string(), "K1".to_string()),
            ("x".to_string(), "K2".to_string()),
            ("y".to_string(), "K1".to_string()),
        ];
        let rollup = rollup_ortholog(&records, &mapping);
        assert_eq!(rollup.len(), 2);

        // K1 collects both alleles: sum of proportions and of read counts
        assert_eq!(rollup[0].ortholog, "K1");
        assert!((rollup[0].proportion - 1.0).abs() < TOLERANCE);
        assert_eq!(rollup[0].nreads, 160);
        // K2 sees only x
        assert_eq!(rollup[1].ortholog, "K2");
        assert!((rollup[1].proportion - 0.25).abs() < TOLERANCE);
        assert_eq!(rollup[1].nreads, 40);
    }

    #[test]
    fn test_reconcile_attaches_aligned_counts() {
        let alleles = vec![allele("A", "x", 1.0, 40), allele("A", "y", 1.0, 120)];
        let mut counts = vec![ReadCountRecord {
            sample: "A".to_string(),
            n_reads: 1000,
            aligned_reads: None,
        }];
        reconcile_read_counts(&mut counts, &alleles).unwrap();
        assert_eq!(counts[0].aligned_reads, Some(160));
    }

    #[test]
    fn test_reconcile_missing_sample_is_fatal() {
        let alleles = vec![allele("A", "x", 1.0, 40)];
        let mut counts = vec![
            ReadCountRecord {
                sample: "A".to_string(),
                n_reads: 1000,
                aligned_reads: None,
            },
            ReadCountRecord {
                sample: "C".to_string(),
                n_reads: 500,
                aligned_reads: None,
            },
        ];
        match reconcile_read_counts(&mut counts, &alleles) {
            Err(PipelineError::Reconciliation(missing)) => {
                assert_eq!(missing, vec!["C".to_string()]);
            }
            other => panic!("expected ReconciliationError, got {:?}", other),
        }
    }

    #[test]
    fn test_taxo_rank_totals() {
        let taxa = vec![
            TaxonRecord {
                sample: "A".to_string(),
                rank: "phylum".to_string(),
                organism: "Firmicutes".to_string(),
                proportion: 0.6,
            },
            TaxonRecord {
                sample: "A".to_string(),
                rank: "phylum".to_string(),
                organism: "Bacteroidetes".to_string(),
                proportion: 0.4,
            },
        ];
        check_taxo_rank_totals(&taxa).unwrap();

        let mut over = taxa.clone();
        over[1].proportion = 0.7;
        assert!(check_taxo_rank_totals(&over).is_err());
    }
}
