use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::config::defs::PipelineError;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    file.read_exact(&mut buffer)?;
    Ok(buffer == [0x1F, 0x8B]) // Gzip magic bytes
}

/// Scans a directory for per-sample files following the `<sample><suffix>`
/// naming convention.
///
/// # Arguments
///
/// * `dir` - Directory holding per-sample output files.
/// * `suffix` - Filename suffix identifying one view kind.
///
/// # Returns
/// Sorted (sample, path) pairs; files not ending in `suffix` are ignored.
pub fn scan_by_suffix(dir: &Path, suffix: &str) -> Result<Vec<(String, PathBuf)>, PipelineError> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::IOError(format!(
        "cannot read input directory {}: {}",
        dir.display(),
        e
    )))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::IOError(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if let Some(sample) = name.strip_suffix(suffix) {
            if !sample.is_empty() {
                found.push((sample.to_string(), path));
            }
        }
    }

    // Sort for deterministic downstream table and export ordering
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_scan_by_suffix_sorted() {
        let dir = TempDir::new().unwrap();
        for name in ["b.json", "a.json", "a.metaphlan", "notes.txt"] {
            let mut f = File::create(dir.path().join(name)).unwrap();
            writeln!(f, "x").unwrap();
        }

        let found = scan_by_suffix(dir.path(), ".json").unwrap();
        let samples: Vec<&str> = found.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(samples, vec!["a", "b"]);
    }

    #[test]
    fn test_scan_missing_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan_by_suffix(&missing, ".json").is_err());
    }

    #[test]
    fn test_is_gzipped() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("plain.json");
        fs::write(&plain, b"[]").unwrap();
        assert!(!is_gzipped(&plain).unwrap());

        let gz = dir.path().join("c.json.gz");
        fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00]).unwrap();
        assert!(is_gzipped(&gz).unwrap());
    }
}
