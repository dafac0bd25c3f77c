//! Pre-upload validation of exam CSV files.
//!
//! Only a fixed-size sample (512 KB) is read, so very large files are cheap
//! to check. The validator catches what the backend would otherwise reject
//! after a full upload:
//! - wrong extension or oversized files
//! - UTF-8 encoding errors
//! - missing headers and inconsistent column counts
//! - missing exam columns (warning only)

use std::fmt;
use std::io::Cursor;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the sample buffer for validation (512 KB).
pub const VALIDATION_SAMPLE_SIZE: usize = 512 * 1024;

/// Records shown in the preview.
pub const PREVIEW_ROWS: usize = 5;

/// Maximum number of records to validate in the sample.
const MAX_RECORDS_TO_VALIDATE: usize = 1000;

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Columns the grading model reads, matched case-insensitively.
const EXAM_COLUMNS: &[&str] = &["ID экзамена", "ID вопроса", "Транскрибация ответа"];

// ─────────────────────────────────────────────────────────────────────────────
// Public Types
// ─────────────────────────────────────────────────────────────────────────────

/// Result of CSV validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvValidationResult {
    /// Whether the file passed validation (no errors).
    pub ok: bool,
    pub errors: Vec<CsvValidationError>,
    pub warnings: Vec<CsvValidationWarning>,
    pub stats: CsvValidationStats,
}

/// What the validator learned about the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CsvValidationStats {
    pub file_size_bytes: u64,
    /// Bytes actually inspected (sample size or file size if smaller).
    pub sample_bytes: u64,
    /// `;` when the header line contains one, `,` otherwise.
    pub delimiter: char,
    pub headers: Vec<String>,
    /// Data records parsed from the sample.
    pub validated_rows: u64,
    /// First records of the file, header excluded.
    pub preview: Vec<Vec<String>>,
}

/// Problems that block the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsvValidationError {
    /// File name does not end in `.csv`.
    NotCsv,
    /// File exceeds the configured size limit.
    TooLarge { size_bytes: u64, limit_bytes: u64 },
    /// File is empty (0 bytes).
    EmptyFile,
    /// File is not valid UTF-8.
    NotUtf8,
    /// No headers found in the CSV.
    NoHeaders,
    /// Row has a different number of columns than the header.
    InconsistentColumns {
        expected: usize,
        found: usize,
        /// 1-based record number, header included.
        row: u64,
    },
    CsvParseError { message: String },
}

impl fmt::Display for CsvValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvValidationError::NotCsv => f.write_str("Only .csv files can be uploaded"),
            CsvValidationError::TooLarge {
                size_bytes,
                limit_bytes,
            } => write!(
                f,
                "File is {} bytes; the limit is {} bytes",
                size_bytes, limit_bytes
            ),
            CsvValidationError::EmptyFile => f.write_str("File is empty"),
            CsvValidationError::NotUtf8 => f.write_str("File is not UTF-8 encoded"),
            CsvValidationError::NoHeaders => f.write_str("File has no header row"),
            CsvValidationError::InconsistentColumns {
                expected,
                found,
                row,
            } => write!(
                f,
                "Row {} has {} columns, expected {}",
                row, found, expected
            ),
            CsvValidationError::CsvParseError { message } => {
                write!(f, "CSV parse error: {}", message)
            }
        }
    }
}

/// Issues worth showing that do not block the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CsvValidationWarning {
    /// File starts with a UTF-8 BOM.
    HasBom,
    /// Expected exam columns not present in the header.
    MissingExamColumns { missing: Vec<String> },
    /// Only a sample of the file was validated.
    SampleOnlyValidation { validated_rows: u64 },
}

impl fmt::Display for CsvValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvValidationWarning::HasBom => f.write_str("File starts with a byte order mark"),
            CsvValidationWarning::MissingExamColumns { missing } => {
                write!(f, "Expected columns not found: {}", missing.join(", "))
            }
            CsvValidationWarning::SampleOnlyValidation { validated_rows } => write!(
                f,
                "Only the first {} rows were checked",
                validated_rows
            ),
        }
    }
}

impl CsvValidationResult {
    fn rejected(
        errors: Vec<CsvValidationError>,
        warnings: Vec<CsvValidationWarning>,
        stats: CsvValidationStats,
    ) -> Self {
        Self {
            ok: false,
            errors,
            warnings,
            stats,
        }
    }

    /// Converts blocking errors into `AppError::InvalidFile`.
    pub fn into_result(self) -> Result<Self, AppError> {
        if self.ok {
            return Ok(self);
        }
        let message = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(AppError::InvalidFile(message))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Validates an exam CSV before upload.
///
/// # Arguments
///
/// * `path` - File to check
/// * `max_size_bytes` - Upper bound on the file size
///
/// # Errors
///
/// Returns `AppError` only when the file cannot be read. Validation problems
/// are reported in `CsvValidationResult.errors`.
pub async fn validate(path: &Path, max_size_bytes: u64) -> Result<CsvValidationResult, AppError> {
    let mut warnings = Vec::new();

    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return Ok(CsvValidationResult::rejected(
            vec![CsvValidationError::NotCsv],
            warnings,
            CsvValidationStats {
                delimiter: ',',
                ..Default::default()
            },
        ));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read file metadata: {}", e)))?;
    let file_size_bytes = metadata.len();

    let mut stats = CsvValidationStats {
        file_size_bytes,
        delimiter: ',',
        ..Default::default()
    };

    if file_size_bytes == 0 {
        return Ok(CsvValidationResult::rejected(
            vec![CsvValidationError::EmptyFile],
            warnings,
            stats,
        ));
    }
    if file_size_bytes > max_size_bytes {
        return Ok(CsvValidationResult::rejected(
            vec![CsvValidationError::TooLarge {
                size_bytes: file_size_bytes,
                limit_bytes: max_size_bytes,
            }],
            warnings,
            stats,
        ));
    }

    // Read sample
    let sample_size = (file_size_bytes as usize).min(VALIDATION_SAMPLE_SIZE);
    let mut buffer = vec![0u8; sample_size];
    let mut file = File::open(path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to open file: {}", e)))?;
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to read file: {}", e)))?;
    drop(file);

    stats.sample_bytes = sample_size as u64;
    let is_sample_only = file_size_bytes > stats.sample_bytes;

    let data = match buffer.strip_prefix(UTF8_BOM) {
        Some(rest) => {
            warnings.push(CsvValidationWarning::HasBom);
            rest
        }
        None => &buffer[..],
    };

    if let Err(e) = std::str::from_utf8(data) {
        // A multi-byte char split by the sample boundary is not an encoding error.
        let cut_at_boundary = is_sample_only && e.error_len().is_none();
        if !cut_at_boundary {
            return Ok(CsvValidationResult::rejected(
                vec![CsvValidationError::NotUtf8],
                warnings,
                stats,
            ));
        }
    }

    stats.delimiter = detect_delimiter(data);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(stats.delimiter as u8)
        .flexible(true)
        .from_reader(Cursor::new(data));

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|s| s.trim().to_string()).collect(),
        Err(e) => {
            return Ok(CsvValidationResult::rejected(
                vec![CsvValidationError::CsvParseError {
                    message: e.to_string(),
                }],
                warnings,
                stats,
            ));
        }
    };

    if headers.iter().all(|h| h.is_empty()) {
        return Ok(CsvValidationResult::rejected(
            vec![CsvValidationError::NoHeaders],
            warnings,
            stats,
        ));
    }

    let missing = missing_exam_columns(&headers);
    if !missing.is_empty() {
        warnings.push(CsvValidationWarning::MissingExamColumns { missing });
    }

    let expected = headers.len();
    stats.headers = headers;

    let mut errors = Vec::new();
    let mut records = reader.records().take(MAX_RECORDS_TO_VALIDATE).peekable();
    while let Some(result) = records.next() {
        let is_last = records.peek().is_none();
        match result {
            Ok(record) => {
                // The sample may end mid-row; the last partial row is not checked.
                if is_sample_only && is_last {
                    break;
                }
                stats.validated_rows += 1;
                if record.len() != expected {
                    errors.push(CsvValidationError::InconsistentColumns {
                        expected,
                        found: record.len(),
                        row: stats.validated_rows + 1,
                    });
                    continue;
                }
                if stats.preview.len() < PREVIEW_ROWS {
                    stats.preview.push(record.iter().map(String::from).collect());
                }
            }
            Err(e) => {
                if is_sample_only && is_likely_truncation_error(&e) {
                    break;
                }
                errors.push(CsvValidationError::CsvParseError {
                    message: e.to_string(),
                });
                break;
            }
        }
    }

    if is_sample_only {
        warnings.push(CsvValidationWarning::SampleOnlyValidation {
            validated_rows: stats.validated_rows,
        });
    }

    for w in &warnings {
        warn!("[VALIDATE] {}", w);
    }
    debug!(
        "[VALIDATE] {} columns, {} rows checked, {} errors",
        expected,
        stats.validated_rows,
        errors.len()
    );

    Ok(CsvValidationResult {
        ok: errors.is_empty(),
        errors,
        warnings,
        stats,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// `;` if the header line contains one, `,` otherwise.
fn detect_delimiter(data: &[u8]) -> char {
    let header_line = data.split(|&b| b == b'\n').next().unwrap_or_default();
    if header_line.contains(&b';') {
        ';'
    } else {
        ','
    }
}

fn missing_exam_columns(headers: &[String]) -> Vec<String> {
    let present: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();
    EXAM_COLUMNS
        .iter()
        .filter(|col| !present.contains(&col.to_lowercase()))
        .map(|col| col.to_string())
        .collect()
}

/// Checks if the error is likely due to the sample cutting a record short.
fn is_likely_truncation_error(err: &csv::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unexpected eof") || msg.contains("premature eof") || msg.contains("utf-8")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
