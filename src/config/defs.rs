use std::collections::HashMap;
use std::path::PathBuf;
use lazy_static::lazy_static;
use log::LevelFilter;
use thiserror::Error;
use crate::cli::Arguments;

// Per-sample file suffix conventions. The quantification and taxonomic
// suffixes can be overridden on the command line; the functional-profiling
// view suffixes are fixed.
pub const GENEFAMILIES_SUFFIX: &str = "_genefamilies.tsv";
pub const PATHABUNDANCE_SUFFIX: &str = "_pathabundance.tsv";
pub const PATHCOVERAGE_SUFFIX: &str = "_pathcoverage.tsv";

// Reference store layout
pub const GROUPS_NAMESPACE: &str = "groups";
pub const ORTHOLOG_MAPPING: &str = "ortholog";
pub const TAXONOMY_MAPPING: &str = "taxonomy";

// Output store table names
pub const METADATA_TABLE: &str = "metadata";
pub const READCOUNTS_TABLE: &str = "readcounts";
pub const ABUND_NAMESPACE: &str = "abund";
pub const ALLELES_TABLE: &str = "abund/alleles";
pub const TAXONOMIC_TABLE: &str = "abund/taxonomic-profile";
pub const ORTHOLOG_TABLE: &str = "abund/ortholog";
pub const GENEFAMILIES_TABLE: &str = "abund/functional-genefamilies";
pub const PATHABUNDANCE_TABLE: &str = "abund/functional-pathabundance";
pub const PATHCOVERAGE_TABLE: &str = "abund/functional-pathcoverage";

// Width of the rank prefix on a lineage leaf token, e.g. "s__" in
// "s__Escherichia_coli".
pub const RANK_PREFIX_LEN: usize = 3;

lazy_static! {
    pub static ref RANK_NAMES: HashMap<char, &'static str> = {
        let mut m = HashMap::new();
        m.insert('k', "kingdom");
        m.insert('p', "phylum");
        m.insert('c', "class");
        m.insert('o', "order");
        m.insert('f', "family");
        m.insert('g', "genus");
        m.insert('s', "species");
        m.insert('t', "strain");

        m
    };
}

pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub log_level: LevelFilter,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to parse {path}: {error}")]
    Parse { path: String, error: String },

    #[error("normalization failed: {0}")]
    Normalization(String),

    #[error("read-count reconciliation failed; samples absent from allele table: {0:?}")]
    Reconciliation(Vec<String>),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("reference store error: {0}")]
    Reference(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("task failed: {0}")]
    TaskFailure(String),
}
