use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;

use crate::config::defs::{PipelineError, RANK_NAMES, RANK_PREFIX_LEN};
use crate::utils::file::is_gzipped;

/// One allele quantification row, long-form across samples. `proportion` is
/// filled in by the normalizer; parsers leave it at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct AlleleRecord {
    pub sample: String,
    pub allele: String,
    pub depth: f64,
    pub nreads: u64,
    pub proportion: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaxonRecord {
    pub sample: String,
    pub rank: String,
    pub organism: String,
    pub proportion: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadCountRecord {
    pub sample: String,
    pub n_reads: u64,
    pub aligned_reads: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionalRecord {
    pub sample: String,
    pub feature: String,
    pub value: f64,
}

// Minimal schema for one upstream quantification entry; extra fields in the
// payload are ignored, missing ones reject the file.
#[derive(Debug, Deserialize)]
struct QuantEntry {
    id: String,
    depth: f64,
    nreads: u64,
}

fn parse_error(path: &Path, error: impl ToString) -> PipelineError {
    PipelineError::Parse {
        path: path.display().to_string(),
        error: error.to_string(),
    }
}

/// Decodes one per-sample allele-quantification file (JSON array of
/// `{id, depth, nreads}` entries, optionally gzipped) and tags each record
/// with the sample id.
pub fn parse_quant_file(path: &Path, sample: &str) -> Result<Vec<AlleleRecord>, PipelineError> {
    let gzipped = is_gzipped(path).map_err(|e| parse_error(path, e))?;
    let file = File::open(path).map_err(|e| parse_error(path, e))?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let entries: Vec<QuantEntry> =
        serde_json::from_reader(BufReader::new(reader)).map_err(|e| parse_error(path, e))?;

    Ok(entries
        .into_iter()
        .map(|entry| AlleleRecord {
            sample: sample.to_string(),
            allele: entry.id,
            depth: entry.depth,
            nreads: entry.nreads,
            proportion: 0.0,
        })
        .collect())
}

/// Decodes one per-sample taxonomic-profile file: tab-delimited lines of a
/// pipe-delimited lineage string and a percentage. Only the leaf lineage
/// token is consumed per line; its single-letter rank code is mapped to a
/// canonical rank name and its `x__` prefix stripped to obtain the organism.
///
/// # Arguments
///
/// * `path` - Path to the profile file.
/// * `sample` - Sample id recovered from the filename.
///
/// # Returns
/// Records in file order; percentages are converted to 0-1 proportions.
pub fn parse_taxo_file(path: &Path, sample: &str) -> Result<Vec<TaxonRecord>, PipelineError> {
    let file = File::open(path).map_err(|e| parse_error(path, e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| parse_error(path, e))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t');
        let lineage = fields
            .next()
            .ok_or_else(|| parse_error(path, format!("line {}: empty row", lineno + 1)))?;
        let percent: f64 = fields
            .next()
            .ok_or_else(|| {
                parse_error(path, format!("line {}: missing abundance column", lineno + 1))
            })?
            .parse()
            .map_err(|e| parse_error(path, format!("line {}: bad abundance: {}", lineno + 1, e)))?;

        let leaf = lineage
            .rsplit('|')
            .next()
            .expect("rsplit yields at least one token");
        // Byte-wise prefix check; a passing check implies the leading rank
        // code is a single ASCII byte, so the slice below stays on a char
        // boundary.
        let bytes = leaf.as_bytes();
        if bytes.len() < RANK_PREFIX_LEN || bytes[1] != b'_' || bytes[2] != b'_' {
            return Err(parse_error(
                path,
                format!("line {}: malformed lineage token '{}'", lineno + 1, leaf),
            ));
        }
        let code = bytes[0] as char;
        let rank = RANK_NAMES.get(&code).ok_or_else(|| {
            parse_error(path, format!("line {}: unknown rank code '{}'", lineno + 1, code))
        })?;

        records.push(TaxonRecord {
            sample: sample.to_string(),
            rank: rank.to_string(),
            organism: leaf[RANK_PREFIX_LEN..].to_string(),
            proportion: percent / 100.0,
        });
    }

    Ok(records)
}

#[derive(Debug, Deserialize)]
struct RawReadCountRow {
    name: String,
    n_reads: u64,
}

/// Reads the externally supplied raw per-sample read-count table
/// (columns: name, n_reads). `aligned_reads` is left unset for the
/// reconciler to fill in.
pub fn parse_read_counts(path: &Path) -> Result<Vec<ReadCountRecord>, PipelineError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| parse_error(path, e))?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let row: RawReadCountRow = row.map_err(|e| parse_error(path, e))?;
        records.push(ReadCountRecord {
            sample: row.name,
            n_reads: row.n_reads,
            aligned_reads: None,
        });
    }
    records.sort_by(|a, b| a.sample.cmp(&b.sample));
    Ok(records)
}

/// Reads the run manifest verbatim, one line per record, for the store's
/// metadata table.
pub fn parse_manifest(path: &Path) -> Result<Vec<String>, PipelineError> {
    let contents = std::fs::read_to_string(path).map_err(|e| parse_error(path, e))?;
    if contents.trim().is_empty() {
        return Err(parse_error(path, "manifest is empty"));
    }
    Ok(contents.lines().map(|l| l.to_string()).collect())
}

/// Decodes one per-sample functional-profiling output file: tab-delimited
/// feature/value rows, comment lines skipped.
pub fn parse_functional_file(
    path: &Path,
    sample: &str,
) -> Result<Vec<FunctionalRecord>, PipelineError> {
    let file = File::open(path).map_err(|e| parse_error(path, e))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| parse_error(path, e))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let feature = fields
            .next()
            .ok_or_else(|| parse_error(path, format!("line {}: empty row", lineno + 1)))?;
        let value: f64 = fields
            .next()
            .ok_or_else(|| parse_error(path, format!("line {}: missing value column", lineno + 1)))?
            .parse()
            .map_err(|e| parse_error(path, format!("line {}: bad value: {}", lineno + 1, e)))?;

        records.push(FunctionalRecord {
            sample: sample.to_string(),
            feature: feature.to_string(),
            value,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    #[test]
    fn test_parse_quant_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampleA.json");
        std::fs::write(
            &path,
            r#"[{"id": "alleleX", "depth": 10.0, "nreads": 40, "length": 900},
               {"id": "alleleY", "depth": 30.0, "nreads": 120}]"#,
        )
        .unwrap();

        let records = parse_quant_file(&path, "sampleA").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sample, "sampleA");
        assert_eq!(records[0].allele, "alleleX");
        assert_eq!(records[0].depth, 10.0);
        assert_eq!(records[1].nreads, 120);
        assert_eq!(records[1].proportion, 0.0);
    }

    #[test]
    fn test_parse_quant_file_gzipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampleA.json.gz");
        let file = File::create(&path).unwrap();
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(br#"[{"id": "alleleX", "depth": 5.0, "nreads": 20}]"#)
            .unwrap();
        enc.finish().unwrap();

        let records = parse_quant_file(&path, "sampleA").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].depth, 5.0);
    }

    #[test]
    fn test_parse_quant_file_missing_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"id": "alleleX", "depth": 10.0}]"#).unwrap();

        match parse_quant_file(&path, "bad") {
            Err(PipelineError::Parse { .. }) => {}
            other => panic!("expected ParseError, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_parse_quant_file_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.json");
        assert!(matches!(
            parse_quant_file(&path, "absent"),
            Err(PipelineError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_taxo_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampleA.metaphlan");
        std::fs::write(
            &path,
            "#mpa_v30\nk__Bacteria\t100.0\nk__Bacteria|p__Firmicutes\t60.0\nk__Bacteria|p__Firmicutes|g__Blautia|s__Blautia_producta\t12.5\n",
        )
        .unwrap();

        let records = parse_taxo_file(&path, "sampleA").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].rank, "kingdom");
        assert_eq!(records[0].organism, "Bacteria");
        assert_eq!(records[0].proportion, 1.0);
        assert_eq!(records[1].rank, "phylum");
        assert_eq!(records[2].rank, "species");
        assert_eq!(records[2].organism, "Blautia_producta");
        assert!((records[2].proportion - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_parse_taxo_unknown_rank_code() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampleA.metaphlan");
        std::fs::write(&path, "k__Bacteria|x__Mystery\t10.0\n").unwrap();

        assert!(matches!(
            parse_taxo_file(&path, "sampleA"),
            Err(PipelineError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_taxo_missing_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sampleA.metaphlan");
        std::fs::write(&path, "k__Bacteria\n").unwrap();

        assert!(matches!(
            parse_taxo_file(&path, "sampleA"),
            Err(PipelineError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_read_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readcounts.csv");
        std::fs::write(&path, "name,n_reads\nB,2000\nA,1000\n").unwrap();

        let records = parse_read_counts(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sample, "A");
        assert_eq!(records[0].n_reads, 1000);
        assert_eq!(records[0].aligned_reads, None);
        assert_eq!(records[1].sample, "B");
    }

    #[test]
    fn test_parse_functional_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A_genefamilies.tsv");
        std::fs::write(
            &path,
            "# Gene Family\tA_Abundance-RPKs\nUNMAPPED\t120.5\nUniRef90_A0A024\t33.25\n",
        )
        .unwrap();

        let records = parse_functional_file(&path, "A").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].feature, "UNMAPPED");
        assert_eq!(records[1].value, 33.25);
        assert_eq!(records[1].sample, "A");
    }
}
