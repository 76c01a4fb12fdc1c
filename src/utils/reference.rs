use std::path::Path;

use hdf5_metno::types::VarLenUnicode;
use hdf5_metno::{Extent, File, H5Type};
use log::debug;

use crate::config::defs::{GROUPS_NAMESPACE, ORTHOLOG_MAPPING, PipelineError, TAXONOMY_MAPPING};

const CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HierarchyKind {
    Generic,
    Reserved,
}

/// One entry of the reference store's hierarchy listing, produced once at
/// start-up. Reserved hierarchies (ortholog, taxonomy) are handled by
/// dedicated rollup logic and excluded from the generic loop.
#[derive(Debug, Clone)]
pub struct HierarchyListing {
    pub name: String,
    pub kind: HierarchyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMappingRow {
    pub allele: String,
    pub gene: String,
    pub group: String,
}

/// A three-level allele→gene→group reference table, immutable for the run.
#[derive(Debug, Clone)]
pub struct GroupMapping {
    pub name: String,
    pub rows: Vec<GroupMappingRow>,
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
struct GroupRowH5 {
    allele: VarLenUnicode,
    gene: VarLenUnicode,
    group: VarLenUnicode,
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
struct OrthologRowH5 {
    allele: VarLenUnicode,
    ortholog: VarLenUnicode,
}

#[derive(H5Type, Clone, PartialEq)]
#[repr(C)]
struct TaxonomyRowH5 {
    allele: VarLenUnicode,
    taxid: u64,
}

fn to_unicode(s: &str) -> Result<VarLenUnicode, PipelineError> {
    s.parse::<VarLenUnicode>()
        .map_err(|e| PipelineError::Reference(format!("invalid string '{}': {}", s, e)))
}

/// Read-only handle on the reference store holding the group-mapping tables
/// under the `groups` namespace.
pub struct ReferenceStore {
    file: File,
}

impl ReferenceStore {
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| {
            PipelineError::Reference(format!("cannot open {}: {}", path.display(), e))
        })?;
        Ok(Self { file })
    }

    /// Lists the hierarchies present in the store, classified as reserved or
    /// generic. This is the single discovery point; rollup code never infers
    /// hierarchy names from key patterns.
    pub fn list_hierarchies(&self) -> Result<Vec<HierarchyListing>, PipelineError> {
        let group = self
            .file
            .group(GROUPS_NAMESPACE)
            .map_err(|e| PipelineError::Reference(format!("missing '{}' namespace: {}", GROUPS_NAMESPACE, e)))?;
        let mut names = group
            .member_names()
            .map_err(|e| PipelineError::Reference(e.to_string()))?;
        names.sort();

        let listings = names
            .into_iter()
            .map(|name| {
                let kind = if name == ORTHOLOG_MAPPING || name == TAXONOMY_MAPPING {
                    HierarchyKind::Reserved
                } else {
                    HierarchyKind::Generic
                };
                HierarchyListing { name, kind }
            })
            .collect();
        Ok(listings)
    }

    pub fn load_group_mapping(&self, name: &str) -> Result<GroupMapping, PipelineError> {
        let rows: Vec<GroupRowH5> = self.read_mapping(name)?;
        debug!("Loaded {} rows for hierarchy '{}'", rows.len(), name);
        Ok(GroupMapping {
            name: name.to_string(),
            rows: rows
                .iter()
                .map(|r| GroupMappingRow {
                    allele: r.allele.as_str().to_string(),
                    gene: r.gene.as_str().to_string(),
                    group: r.group.as_str().to_string(),
                })
                .collect(),
        })
    }

    /// Loads the reserved many-to-many allele→ortholog mapping.
    pub fn load_ortholog_mapping(&self) -> Result<Vec<(String, String)>, PipelineError> {
        let rows: Vec<OrthologRowH5> = self.read_mapping(ORTHOLOG_MAPPING)?;
        debug!("Loaded {} ortholog mapping rows", rows.len());
        Ok(rows
            .iter()
            .map(|r| (r.allele.as_str().to_string(), r.ortholog.as_str().to_string()))
            .collect())
    }

    /// Loads the reserved allele→taxon mapping.
    pub fn load_taxonomy_mapping(&self) -> Result<Vec<(String, u64)>, PipelineError> {
        let rows: Vec<TaxonomyRowH5> = self.read_mapping(TAXONOMY_MAPPING)?;
        debug!("Loaded {} taxonomy mapping rows", rows.len());
        Ok(rows
            .iter()
            .map(|r| (r.allele.as_str().to_string(), r.taxid))
            .collect())
    }

    fn read_mapping<R: H5Type>(&self, name: &str) -> Result<Vec<R>, PipelineError> {
        let dataset = self
            .file
            .dataset(&format!("{}/{}", GROUPS_NAMESPACE, name))
            .map_err(|e| PipelineError::Reference(format!("missing mapping '{}': {}", name, e)))?;
        dataset
            .read_raw::<R>()
            .map_err(|e| PipelineError::Reference(format!("cannot read mapping '{}': {}", name, e)))
    }
}

/// Write-side companion for building reference stores, used by tests and by
/// catalog preparation tooling.
pub struct ReferenceStoreBuilder {
    file: File,
}

impl ReferenceStoreBuilder {
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        let file = File::create(path).map_err(|e| {
            PipelineError::Reference(format!("cannot create {}: {}", path.display(), e))
        })?;
        file.create_group(GROUPS_NAMESPACE)
            .map_err(|e| PipelineError::Reference(e.to_string()))?;
        Ok(Self { file })
    }

    pub fn write_group_mapping(&self, mapping: &GroupMapping) -> Result<(), PipelineError> {
        let rows: Vec<GroupRowH5> = mapping
            .rows
            .iter()
            .map(|r| {
                Ok(GroupRowH5 {
                    allele: to_unicode(&r.allele)?,
                    gene: to_unicode(&r.gene)?,
                    group: to_unicode(&r.group)?,
                })
            })
            .collect::<Result<_, PipelineError>>()?;
        self.write_mapping(&mapping.name, &rows)
    }

    pub fn write_ortholog_mapping(&self, rows: &[(String, String)]) -> Result<(), PipelineError> {
        let rows: Vec<OrthologRowH5> = rows
            .iter()
            .map(|(allele, ortholog)| {
                Ok(OrthologRowH5 {
                    allele: to_unicode(allele)?,
                    ortholog: to_unicode(ortholog)?,
                })
            })
            .collect::<Result<_, PipelineError>>()?;
        self.write_mapping(ORTHOLOG_MAPPING, &rows)
    }

    pub fn write_taxonomy_mapping(&self, rows: &[(String, u64)]) -> Result<(), PipelineError> {
        let rows: Vec<TaxonomyRowH5> = rows
            .iter()
            .map(|(allele, taxid)| {
                Ok(TaxonomyRowH5 {
                    allele: to_unicode(allele)?,
                    taxid: *taxid,
                })
            })
            .collect::<Result<_, PipelineError>>()?;
        self.write_mapping(TAXONOMY_MAPPING, &rows)
    }

    fn write_mapping<R: H5Type + Clone>(&self, name: &str, rows: &[R]) -> Result<(), PipelineError> {
        let group = self
            .file
            .group(GROUPS_NAMESPACE)
            .map_err(|e| PipelineError::Reference(e.to_string()))?;
        let dataset = group
            .new_dataset::<R>()
            .shape([Extent::resizable(0)])
            .chunk([CHUNK_SIZE])
            .shuffle()
            .deflate(6)
            .create(name)
            .map_err(|e| PipelineError::Reference(e.to_string()))?;
        if !rows.is_empty() {
            dataset
                .resize([rows.len()])
                .map_err(|e| PipelineError::Reference(e.to_string()))?;
            dataset
                .write_slice(rows, 0..rows.len())
                .map_err(|e| PipelineError::Reference(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("ref.h5");
        let builder = ReferenceStoreBuilder::create(&path).unwrap();
        builder
            .write_group_mapping(&GroupMapping {
                name: "cags".to_string(),
                rows: vec![
                    GroupMappingRow {
                        allele: "x".to_string(),
                        gene: "G1".to_string(),
                        group: "H".to_string(),
                    },
                    GroupMappingRow {
                        allele: "y".to_string(),
                        gene: "G2".to_string(),
                        group: "H".to_string(),
                    },
                ],
            })
            .unwrap();
        builder
            .write_ortholog_mapping(&[
                ("x".to_string(), "K00001".to_string()),
                ("x".to_string(), "K00002".to_string()),
            ])
            .unwrap();
        builder
            .write_taxonomy_mapping(&[("x".to_string(), 562)])
            .unwrap();
        path
    }

    #[test]
    fn test_listing_classifies_reserved() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let store = ReferenceStore::open(&path).unwrap();
        let listings = store.list_hierarchies().unwrap();
        let names: Vec<(&str, HierarchyKind)> = listings
            .iter()
            .map(|l| (l.name.as_str(), l.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("cags", HierarchyKind::Generic),
                ("ortholog", HierarchyKind::Reserved),
                ("taxonomy", HierarchyKind::Reserved),
            ]
        );
    }

    #[test]
    fn test_mapping_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let store = ReferenceStore::open(&path).unwrap();
        let mapping = store.load_group_mapping("cags").unwrap();
        assert_eq!(mapping.rows.len(), 2);
        assert_eq!(mapping.rows[0].allele, "x");
        assert_eq!(mapping.rows[1].group, "H");

        let orthologs = store.load_ortholog_mapping().unwrap();
        assert_eq!(orthologs.len(), 2);
        assert_eq!(orthologs[1], ("x".to_string(), "K00002".to_string()));

        let taxonomy = store.load_taxonomy_mapping().unwrap();
        assert_eq!(taxonomy, vec![("x".to_string(), 562)]);
    }

    #[test]
    fn test_missing_mapping_is_error() {
        let dir = TempDir::new().unwrap();
        let path = fixture(&dir);

        let store = ReferenceStore::open(&path).unwrap();
        assert!(matches!(
            store.load_group_mapping("absent"),
            Err(PipelineError::Reference(_))
        ));
    }
}
