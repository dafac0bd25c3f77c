//! Sample-based validation of exam CSV files before upload.
//!
//! Reads a fixed-size prefix of the file, so the check stays fast no matter
//! how large the file is.

pub mod csv_validator;

pub use csv_validator::{
    validate, CsvValidationError, CsvValidationResult, CsvValidationStats, CsvValidationWarning,
    PREVIEW_ROWS, VALIDATION_SAMPLE_SIZE,
};
