use std::fs;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use hdf5_metno::types::VarLenUnicode;
use hdf5_metno::{Extent, File, Group, H5Type};
use log::{debug, info};

use crate::config::defs::{METADATA_TABLE, PipelineError};
use crate::utils::abundance::{GroupAbundance, OrthologAbundance};
use crate::utils::records::{AlleleRecord, FunctionalRecord, ReadCountRecord, TaxonRecord};

const CHUNK_SIZE: usize = 1000;

fn to_unicode(s: &str) -> anyhow::Result<VarLenUnicode> {
    s.parse::<VarLenUnicode>()
        .map_err(|e| anyhow!("invalid string '{}': {}", s, e))
}

/// A record kind that can live in the store: it has a compound HDF5 row
/// representation and a flat CSV representation with identical schema.
pub trait TableRow: Sized + Clone {
    type H5Row: H5Type + Clone + 'static;

    const CSV_HEADER: &'static [&'static str];

    fn to_h5(&self) -> anyhow::Result<Self::H5Row>;
    fn from_h5(row: &Self::H5Row) -> Self;
    fn csv_record(&self) -> Vec<String>;
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct AlleleRowH5 {
    sample: VarLenUnicode,
    allele: VarLenUnicode,
    depth: f64,
    nreads: u64,
    proportion: f64,
}

impl TableRow for AlleleRecord {
    type H5Row = AlleleRowH5;

    const CSV_HEADER: &'static [&'static str] =
        &["sample", "allele", "depth", "nreads", "proportion"];

    fn to_h5(&self) -> anyhow::Result<AlleleRowH5> {
        Ok(AlleleRowH5 {
            sample: to_unicode(&self.sample)?,
            allele: to_unicode(&self.allele)?,
            depth: self.depth,
            nreads: self.nreads,
            proportion: self.proportion,
        })
    }

    fn from_h5(row: &AlleleRowH5) -> Self {
        AlleleRecord {
            sample: row.sample.as_str().to_string(),
            allele: row.allele.as_str().to_string(),
            depth: row.depth,
            nreads: row.nreads,
            proportion: row.proportion,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.allele.clone(),
            self.depth.to_string(),
            self.nreads.to_string(),
            self.proportion.to_string(),
        ]
    }
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct TaxonRowH5 {
    sample: VarLenUnicode,
    rank: VarLenUnicode,
    organism: VarLenUnicode,
    proportion: f64,
}

impl TableRow for TaxonRecord {
    type H5Row = TaxonRowH5;

    const CSV_HEADER: &'static [&'static str] = &["sample", "rank", "organism", "proportion"];

    fn to_h5(&self) -> anyhow::Result<TaxonRowH5> {
        Ok(TaxonRowH5 {
            sample: to_unicode(&self.sample)?,
            rank: to_unicode(&self.rank)?,
            organism: to_unicode(&self.organism)?,
            proportion: self.proportion,
        })
    }

    fn from_h5(row: &TaxonRowH5) -> Self {
        TaxonRecord {
            sample: row.sample.as_str().to_string(),
            rank: row.rank.as_str().to_string(),
            organism: row.organism.as_str().to_string(),
            proportion: row.proportion,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.rank.clone(),
            self.organism.clone(),
            self.proportion.to_string(),
        ]
    }
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct GroupRowH5 {
    sample: VarLenUnicode,
    group: VarLenUnicode,
    proportion: f64,
}

impl TableRow for GroupAbundance {
    type H5Row = GroupRowH5;

    const CSV_HEADER: &'static [&'static str] = &["sample", "group", "proportion"];

    fn to_h5(&self) -> anyhow::Result<GroupRowH5> {
        Ok(GroupRowH5 {
            sample: to_unicode(&self.sample)?,
            group: to_unicode(&self.group)?,
            proportion: self.proportion,
        })
    }

    fn from_h5(row: &GroupRowH5) -> Self {
        GroupAbundance {
            sample: row.sample.as_str().to_string(),
            group: row.group.as_str().to_string(),
            proportion: row.proportion,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.group.clone(),
            self.proportion.to_string(),
        ]
    }
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct OrthologRowH5 {
    sample: VarLenUnicode,
    ortholog: VarLenUnicode,
    proportion: f64,
    nreads: u64,
}

impl TableRow for OrthologAbundance {
    type H5Row = OrthologRowH5;

    const CSV_HEADER: &'static [&'static str] = &["sample", "ortholog", "proportion", "nreads"];

    fn to_h5(&self) -> anyhow::Result<OrthologRowH5> {
        Ok(OrthologRowH5 {
            sample: to_unicode(&self.sample)?,
            ortholog: to_unicode(&self.ortholog)?,
            proportion: self.proportion,
            nreads: self.nreads,
        })
    }

    fn from_h5(row: &OrthologRowH5) -> Self {
        OrthologAbundance {
            sample: row.sample.as_str().to_string(),
            ortholog: row.ortholog.as_str().to_string(),
            proportion: row.proportion,
            nreads: row.nreads,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.ortholog.clone(),
            self.proportion.to_string(),
            self.nreads.to_string(),
        ]
    }
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct ReadCountRowH5 {
    sample: VarLenUnicode,
    n_reads: u64,
    aligned_reads: u64,
}

impl TableRow for ReadCountRecord {
    type H5Row = ReadCountRowH5;

    const CSV_HEADER: &'static [&'static str] = &["sample", "n_reads", "aligned_reads"];

    fn to_h5(&self) -> anyhow::Result<ReadCountRowH5> {
        // Reconciliation guarantees every sample has an aligned total before
        // the table reaches the store.
        let aligned = self
            .aligned_reads
            .ok_or_else(|| anyhow!("sample '{}' was not reconciled", self.sample))?;
        Ok(ReadCountRowH5 {
            sample: to_unicode(&self.sample)?,
            n_reads: self.n_reads,
            aligned_reads: aligned,
        })
    }

    fn from_h5(row: &ReadCountRowH5) -> Self {
        ReadCountRecord {
            sample: row.sample.as_str().to_string(),
            n_reads: row.n_reads,
            aligned_reads: Some(row.aligned_reads),
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.n_reads.to_string(),
            self.aligned_reads.map(|n| n.to_string()).unwrap_or_default(),
        ]
    }
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
pub struct FunctionalRowH5 {
    sample: VarLenUnicode,
    feature: VarLenUnicode,
    value: f64,
}

impl TableRow for FunctionalRecord {
    type H5Row = FunctionalRowH5;

    const CSV_HEADER: &'static [&'static str] = &["sample", "feature", "value"];

    fn to_h5(&self) -> anyhow::Result<FunctionalRowH5> {
        Ok(FunctionalRowH5 {
            sample: to_unicode(&self.sample)?,
            feature: to_unicode(&self.feature)?,
            value: self.value,
        })
    }

    fn from_h5(row: &FunctionalRowH5) -> Self {
        FunctionalRecord {
            sample: row.sample.as_str().to_string(),
            feature: row.feature.as_str().to_string(),
            value: row.value,
        }
    }

    fn csv_record(&self) -> Vec<String> {
        vec![
            self.sample.clone(),
            self.feature.clone(),
            self.value.to_string(),
        ]
    }
}

/// The single persisted multi-table output container.
///
/// A primary run stages a fresh HDF5 at `<path>.partial` and renames it into
/// place only on full success, so a failed aggregation never leaves a
/// half-populated store behind. A later session reopens the finalized file in
/// append mode; table writes are append-only and refuse to clobber an
/// existing table.
pub struct Store {
    file: File,
    staged: Option<(PathBuf, PathBuf)>, // (partial path, final path)
    export_dir: PathBuf,
    run_prefix: String,
}

impl Store {
    /// Creates a staged store; call `finalize` after all tables are written.
    pub fn stage(path: &Path, export_dir: &Path, run_prefix: &str) -> Result<Self, PipelineError> {
        let partial = PathBuf::from(format!("{}.partial", path.display()));
        let file = File::create(&partial).map_err(|e| {
            PipelineError::StoreWrite(format!("cannot create {}: {}", partial.display(), e))
        })?;
        Ok(Self {
            file,
            staged: Some((partial, path.to_path_buf())),
            export_dir: export_dir.to_path_buf(),
            run_prefix: run_prefix.to_string(),
        })
    }

    /// Reopens a finalized store for a later append-only writer session.
    pub fn append(path: &Path, export_dir: &Path, run_prefix: &str) -> Result<Self, PipelineError> {
        let file = File::open_rw(path).map_err(|e| {
            PipelineError::StoreWrite(format!("cannot reopen {}: {}", path.display(), e))
        })?;
        Ok(Self {
            file,
            staged: None,
            export_dir: export_dir.to_path_buf(),
            run_prefix: run_prefix.to_string(),
        })
    }

    /// Opens a finalized store read-only.
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| {
            PipelineError::StoreWrite(format!("cannot open {}: {}", path.display(), e))
        })?;
        Ok(Self {
            file,
            staged: None,
            export_dir: PathBuf::new(),
            run_prefix: String::new(),
        })
    }

    /// Writes the run manifest verbatim as the metadata table, plus its flat
    /// export.
    pub fn write_metadata(&self, lines: &[String]) -> Result<(), PipelineError> {
        let root = self.root()?;
        if root.link_exists(METADATA_TABLE) {
            return Err(PipelineError::StoreWrite(
                "metadata table already exists".to_string(),
            ));
        }
        let rows: Vec<VarLenUnicode> = lines
            .iter()
            .map(|l| to_unicode(l))
            .collect::<anyhow::Result<_>>()
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        write_rows(&root, METADATA_TABLE, &rows)?;

        let export = self.export_path(METADATA_TABLE);
        fs::write(&export, format!("{}\n", lines.join("\n")))
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        debug!("Wrote metadata table ({} lines)", lines.len());
        Ok(())
    }

    pub fn read_metadata(&self) -> Result<Vec<String>, PipelineError> {
        let dataset = self
            .file
            .dataset(METADATA_TABLE)
            .map_err(|e| PipelineError::StoreWrite(format!("missing metadata table: {}", e)))?;
        let rows = dataset
            .read_raw::<VarLenUnicode>()
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        Ok(rows.iter().map(|r| r.as_str().to_string()).collect())
    }

    /// Writes one abundance table under its stable name (slashes denote
    /// store groups) and emits the matching flat export. Refuses to replace
    /// a table that already exists.
    pub fn write_table<R: TableRow>(&self, name: &str, rows: &[R]) -> Result<(), PipelineError> {
        let (parent, dset) = self.resolve_parent(name)?;
        if parent.link_exists(&dset) {
            return Err(PipelineError::StoreWrite(format!(
                "table '{}' already exists; store tables are append-only",
                name
            )));
        }

        let h5_rows: Vec<R::H5Row> = rows
            .iter()
            .map(|r| r.to_h5())
            .collect::<anyhow::Result<_>>()
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        write_rows(&parent, &dset, &h5_rows)?;

        self.export_csv(name, rows)?;
        info!("Wrote table '{}' ({} rows)", name, rows.len());
        Ok(())
    }

    pub fn read_table<R: TableRow>(&self, name: &str) -> Result<Vec<R>, PipelineError> {
        let dataset = self
            .file
            .dataset(name)
            .map_err(|e| PipelineError::StoreWrite(format!("missing table '{}': {}", name, e)))?;
        let h5_rows = dataset
            .read_raw::<R::H5Row>()
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        Ok(h5_rows.iter().map(R::from_h5).collect())
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.file.dataset(name).is_ok()
    }

    /// Renames the staged file into its final place. Only staged stores can
    /// be finalized; append sessions write directly into the existing file.
    pub fn finalize(self) -> Result<PathBuf, PipelineError> {
        let Store { file, staged, .. } = self;
        let (partial, final_path) = staged.ok_or_else(|| {
            PipelineError::StoreWrite("store was not opened as a staged write".to_string())
        })?;
        drop(file);
        fs::rename(&partial, &final_path).map_err(|e| {
            PipelineError::StoreWrite(format!(
                "cannot finalize {}: {}",
                final_path.display(),
                e
            ))
        })?;
        Ok(final_path)
    }

    fn root(&self) -> Result<Group, PipelineError> {
        self.file
            .group("/")
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))
    }

    fn resolve_parent(&self, name: &str) -> Result<(Group, String), PipelineError> {
        let mut parts: Vec<&str> = name.split('/').collect();
        let dset = parts
            .pop()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PipelineError::StoreWrite(format!("invalid table name '{}'", name)))?;

        let mut current = self.root()?;
        for part in parts {
            current = if current.link_exists(part) {
                current
                    .group(part)
                    .map_err(|e| PipelineError::StoreWrite(e.to_string()))?
            } else {
                current
                    .create_group(part)
                    .map_err(|e| PipelineError::StoreWrite(e.to_string()))?
            };
        }
        Ok((current, dset.to_string()))
    }

    fn export_path(&self, name: &str) -> PathBuf {
        self.export_dir
            .join(format!("{}.{}.csv", self.run_prefix, name.replace('/', "-")))
    }

    fn export_csv<R: TableRow>(&self, name: &str, rows: &[R]) -> Result<(), PipelineError> {
        let path = self.export_path(name);
        let mut writer = csv::Writer::from_path(&path).map_err(|e| {
            PipelineError::StoreWrite(format!("cannot create {}: {}", path.display(), e))
        })?;
        writer
            .write_record(R::CSV_HEADER)
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        for row in rows {
            writer
                .write_record(row.csv_record())
                .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        }
        writer
            .flush()
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        Ok(())
    }
}

fn write_rows<R: H5Type + Clone>(
    parent: &Group,
    name: &str,
    rows: &[R],
) -> Result<(), PipelineError> {
    let dataset = parent
        .new_dataset::<R>()
        .shape([Extent::resizable(0)])
        .chunk([CHUNK_SIZE])
        .shuffle()
        .deflate(6)
        .create(name)
        .map_err(|e| PipelineError::StoreWrite(format!("cannot create '{}': {}", name, e)))?;
    if !rows.is_empty() {
        dataset
            .resize([rows.len()])
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
        dataset
            .write_slice(rows, 0..rows.len())
            .map_err(|e| PipelineError::StoreWrite(e.to_string()))?;
    }
    Ok(())
}
