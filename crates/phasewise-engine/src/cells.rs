//! Unit-cell readers for models, reflection files and maps.
//!
//! Supported sources:
//! - PDB `CRYST1` records and mmCIF `_cell.*` items (models)
//! - MTZ header `CELL` / `DCELL` records (reflection data)
//! - CCP4/MRC 1024-byte headers, words 11-16 (maps)
//!
//! Every failure is a [`CellReadError`]. Callers in the placement detector
//! treat any error as "cannot compare".

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use phasewise_types::{CellReadError, UnitCell};

/// Source of unit cells. The filesystem implementation is [`FileCellReader`].
pub trait CellReader: Send + Sync {
    fn model_cell(&self, path: &Path) -> Result<UnitCell, CellReadError>;
    fn reflection_cell(&self, path: &Path) -> Result<UnitCell, CellReadError>;
    fn map_cell(&self, path: &Path) -> Result<UnitCell, CellReadError>;
}

/// Reads cells straight from files on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileCellReader;

impl CellReader for FileCellReader {
    fn model_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
        match extension(path).as_str() {
            "pdb" | "ent" => read_pdb_cell(path),
            "cif" | "mmcif" => read_cif_cell(path),
            _ => Err(CellReadError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn reflection_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
        match extension(path).as_str() {
            "mtz" => read_mtz_cell(path),
            _ => Err(CellReadError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    fn map_cell(&self, path: &Path) -> Result<UnitCell, CellReadError> {
        match extension(path).as_str() {
            "map" | "mrc" | "ccp4" => read_ccp4_cell(path),
            _ => Err(CellReadError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

fn io_error(path: &Path, source: std::io::Error) -> CellReadError {
    CellReadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn malformed(path: &Path, message: impl Into<String>) -> CellReadError {
    CellReadError::Malformed {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn cell_from_values(path: &Path, values: &[f64]) -> Result<UnitCell, CellReadError> {
    if values.len() < 6 {
        return Err(malformed(path, format!("expected 6 parameters, found {}", values.len())));
    }
    let cell = UnitCell::new(values[0], values[1], values[2], values[3], values[4], values[5]);
    if cell.is_placeholder() {
        return Err(malformed(path, format!("placeholder cell {cell}")));
    }
    Ok(cell)
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

fn read_pdb_cell(path: &Path) -> Result<UnitCell, CellReadError> {
    let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let line = text
        .lines()
        .find(|l| l.starts_with("CRYST1"))
        .ok_or_else(|| CellReadError::MissingCell(path.to_path_buf()))?;
    parse_cryst1(line).ok_or_else(|| malformed(path, format!("unparseable record '{line}'")))
        .and_then(|values| cell_from_values(path, &values))
}

/// Fixed columns first (numbers may run together), whitespace split as fallback.
fn parse_cryst1(line: &str) -> Option<Vec<f64>> {
    const COLUMNS: [(usize, usize); 6] = [(6, 15), (15, 24), (24, 33), (33, 40), (40, 47), (47, 54)];
    let fixed: Option<Vec<f64>> = COLUMNS
        .iter()
        .map(|&(start, end)| line.get(start..end).and_then(|s| s.trim().parse().ok()))
        .collect();
    fixed.or_else(|| {
        let values: Vec<f64> = line
            .split_whitespace()
            .skip(1)
            .take(6)
            .filter_map(|t| t.parse().ok())
            .collect();
        (values.len() == 6).then_some(values)
    })
}

fn read_cif_cell(path: &Path) -> Result<UnitCell, CellReadError> {
    const ITEMS: [&str; 6] = [
        "_cell.length_a",
        "_cell.length_b",
        "_cell.length_c",
        "_cell.angle_alpha",
        "_cell.angle_beta",
        "_cell.angle_gamma",
    ];
    let text = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let mut values = [None; 6];
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(key) = tokens.next() else { continue };
        if let Some(idx) = ITEMS.iter().position(|item| *item == key) {
            // Strip standard uncertainties such as "78.12(3)".
            values[idx] = tokens
                .next()
                .map(|v| v.split('(').next().unwrap_or(v))
                .and_then(|v| v.parse::<f64>().ok());
        }
    }
    if values.iter().all(Option::is_none) {
        return Err(CellReadError::MissingCell(path.to_path_buf()));
    }
    let values: Option<Vec<f64>> = values.into_iter().collect();
    let values = values.ok_or_else(|| malformed(path, "incomplete _cell category"))?;
    cell_from_values(path, &values)
}

// ---------------------------------------------------------------------------
// Reflection data
// ---------------------------------------------------------------------------

const MTZ_RECORD_LEN: usize = 80;

fn read_mtz_cell(path: &Path) -> Result<UnitCell, CellReadError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut preamble = [0u8; 12];
    file.read_exact(&mut preamble).map_err(|e| io_error(path, e))?;
    if &preamble[0..4] != b"MTZ " {
        return Err(malformed(path, "missing MTZ magic"));
    }
    let big_endian = preamble[8] >> 4 == 1;
    let word: [u8; 4] = [preamble[4], preamble[5], preamble[6], preamble[7]];
    let header_word = if big_endian {
        i32::from_be_bytes(word)
    } else {
        i32::from_le_bytes(word)
    };
    if header_word < 1 {
        return Err(malformed(path, format!("bad header location {header_word}")));
    }
    let offset = (header_word as u64 - 1) * 4;
    file.seek(SeekFrom::Start(offset)).map_err(|e| io_error(path, e))?;
    let mut header = Vec::new();
    file.read_to_end(&mut header).map_err(|e| io_error(path, e))?;

    let mut dataset_cell = None;
    for record in header.chunks(MTZ_RECORD_LEN) {
        let text = String::from_utf8_lossy(record);
        let text = text.trim();
        if text == "END" || text.starts_with("END ") {
            break;
        }
        if let Some(rest) = text.strip_prefix("CELL ") {
            return cell_from_values(path, &parse_floats(rest));
        }
        if dataset_cell.is_none() {
            if let Some(rest) = text.strip_prefix("DCELL ") {
                // DCELL <dataset id> a b c alpha beta gamma
                dataset_cell = Some(parse_floats(rest).into_iter().skip(1).collect::<Vec<_>>());
            }
        }
    }
    match dataset_cell {
        Some(values) => cell_from_values(path, &values),
        None => Err(CellReadError::MissingCell(path.to_path_buf())),
    }
}

fn parse_floats(text: &str) -> Vec<f64> {
    text.split_whitespace().filter_map(|t| t.parse().ok()).collect()
}

// ---------------------------------------------------------------------------
// Maps
// ---------------------------------------------------------------------------

const CCP4_HEADER_LEN: usize = 1024;

fn read_ccp4_cell(path: &Path) -> Result<UnitCell, CellReadError> {
    let mut file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut header = [0u8; CCP4_HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| io_error(path, e))?;
    let big_endian = header[212] >> 4 == 1;
    let values: Vec<f64> = (0..6)
        .map(|i| {
            let start = 40 + i * 4;
            let word = [header[start], header[start + 1], header[start + 2], header[start + 3]];
            let value = if big_endian {
                f32::from_be_bytes(word)
            } else {
                f32::from_le_bytes(word)
            };
            f64::from(value)
        })
        .collect();
    cell_from_values(path, &values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn mtz_bytes(records: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MTZ ");
        // Header starts at byte 80 = word 21.
        bytes.extend_from_slice(&21i32.to_le_bytes());
        bytes.extend_from_slice(&[0x44, 0x41, 0, 0]);
        bytes.resize(80, 0);
        for record in records {
            let mut padded = record.as_bytes().to_vec();
            padded.resize(MTZ_RECORD_LEN, b' ');
            bytes.extend_from_slice(&padded);
        }
        bytes
    }

    fn ccp4_bytes(cell: [f32; 6]) -> Vec<u8> {
        let mut bytes = vec![0u8; CCP4_HEADER_LEN];
        for (i, value) in cell.iter().enumerate() {
            bytes[40 + i * 4..44 + i * 4].copy_from_slice(&value.to_le_bytes());
        }
        bytes[208..212].copy_from_slice(b"MAP ");
        bytes[212..216].copy_from_slice(&[0x44, 0x41, 0, 0]);
        bytes
    }

    #[test]
    fn reads_pdb_cryst1() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "model.pdb",
            b"REMARK test\nCRYST1   50.000   60.000   70.000  90.00  95.00  90.00 P 1 21 1     2\nATOM      1  N   ALA A   1\n",
        );
        let cell = FileCellReader.model_cell(&path).unwrap();
        assert_eq!(cell, UnitCell::new(50.0, 60.0, 70.0, 90.0, 95.0, 90.0));
    }

    #[test]
    fn pdb_placeholder_cell_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "predicted.pdb",
            b"CRYST1    1.000    1.000    1.000  90.00  90.00  90.00 P 1           1\n",
        );
        let err = FileCellReader.model_cell(&path).unwrap_err();
        assert!(matches!(err, CellReadError::Malformed { .. }));
    }

    #[test]
    fn pdb_without_cryst1_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bare.pdb", b"ATOM      1  N   ALA A   1\n");
        assert!(matches!(
            FileCellReader.model_cell(&path),
            Err(CellReadError::MissingCell(_))
        ));
    }

    #[test]
    fn reads_mmcif_cell_with_uncertainties() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "model.cif",
            b"data_x\n_cell.length_a 78.12(3)\n_cell.length_b 78.12\n_cell.length_c 37.5\n_cell.angle_alpha 90\n_cell.angle_beta 90\n_cell.angle_gamma 90\n",
        );
        let cell = FileCellReader.model_cell(&path).unwrap();
        assert_eq!(cell.a, 78.12);
        assert_eq!(cell.c, 37.5);
    }

    #[test]
    fn reads_mtz_cell_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "data.mtz",
            &mtz_bytes(&["VERS MTZ:V1.1", "CELL    50.0000   60.0000   70.0000   90.0000   90.0000   90.0000", "END"]),
        );
        let cell = FileCellReader.reflection_cell(&path).unwrap();
        assert_eq!(cell, UnitCell::new(50.0, 60.0, 70.0, 90.0, 90.0, 90.0));
    }

    #[test]
    fn mtz_falls_back_to_dataset_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "data.mtz",
            &mtz_bytes(&["VERS MTZ:V1.1", "DCELL      1   45.0  45.0  90.0  90.0  90.0 120.0", "END"]),
        );
        let cell = FileCellReader.reflection_cell(&path).unwrap();
        assert_eq!(cell.gamma, 120.0);
    }

    #[test]
    fn truncated_mtz_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "short.mtz", b"MTZ ");
        assert!(matches!(
            FileCellReader.reflection_cell(&path),
            Err(CellReadError::Io { .. })
        ));
    }

    #[test]
    fn reads_ccp4_map_cell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "map.mrc", &ccp4_bytes([120.0, 120.0, 150.0, 90.0, 90.0, 90.0]));
        let cell = FileCellReader.map_cell(&path).unwrap();
        assert_eq!(cell, UnitCell::new(120.0, 120.0, 150.0, 90.0, 90.0, 90.0));
    }

    #[test]
    fn unsupported_extension() {
        let path = Path::new("model.pdb.gz");
        assert!(matches!(
            FileCellReader.model_cell(path),
            Err(CellReadError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            FileCellReader.map_cell(Path::new("/nonexistent/map.ccp4")),
            Err(CellReadError::Io { .. })
        ));
    }
}
