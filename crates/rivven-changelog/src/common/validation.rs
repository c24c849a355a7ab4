//! Input validation for names interpolated into SQL
//!
//! Change-table functions are addressed by name
//! (`cdc.fn_cdc_get_all_changes_<capture_instance>`), so capture instance
//! names cannot be bound as parameters. They are validated before use.
//! Table names go through bracket quoting and only need to be printable.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::LazyLock;

/// SQL Server limits capture instance names to 100 characters
const MAX_CAPTURE_INSTANCE_LENGTH: usize = 100;

/// `sysname` length
const MAX_QUOTED_IDENTIFIER_LENGTH: usize = 128;

/// Largest redo statement accepted by the parser (32 MB)
pub const MAX_STATEMENT_SIZE: usize = 32 * 1024 * 1024;

static CAPTURE_INSTANCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());

/// Validator for names and sizes
pub struct Validator;

impl Validator {
    /// Validate a capture instance name before it is spliced into a function name.
    ///
    /// # Security
    ///
    /// Rejects anything other than ASCII letters, digits and underscores so
    /// that no quoting or statement terminator can reach the query text.
    pub fn validate_capture_instance(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(anyhow!("Capture instance cannot be empty"));
        }

        if name.len() > MAX_CAPTURE_INSTANCE_LENGTH {
            return Err(anyhow!(
                "Capture instance too long: {} chars (max: {})",
                name.len(),
                MAX_CAPTURE_INSTANCE_LENGTH
            ));
        }

        if !CAPTURE_INSTANCE_REGEX.is_match(name) {
            return Err(anyhow!(
                "Invalid capture instance '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
                name
            ));
        }

        Ok(())
    }

    /// Validate a schema/table/column name that will be bracket-quoted.
    pub fn validate_quoted_identifier(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(anyhow!("Identifier cannot be empty"));
        }

        if name.chars().count() > MAX_QUOTED_IDENTIFIER_LENGTH {
            return Err(anyhow!(
                "Identifier too long: {} chars (max: {})",
                name.chars().count(),
                MAX_QUOTED_IDENTIFIER_LENGTH
            ));
        }

        if let Some(c) = name.chars().find(|c| c.is_control()) {
            return Err(anyhow!(
                "Invalid identifier '{}': contains control character {:?}",
                name.escape_debug(),
                c
            ));
        }

        Ok(())
    }

    /// Validate redo statement size
    pub fn validate_statement_size(size: usize) -> Result<()> {
        if size > MAX_STATEMENT_SIZE {
            return Err(anyhow!(
                "Statement size {} bytes exceeds maximum {}",
                size,
                MAX_STATEMENT_SIZE
            ));
        }
        Ok(())
    }
}
