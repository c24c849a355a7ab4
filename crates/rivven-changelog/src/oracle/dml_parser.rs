//! LogMiner `SQL_REDO` parser
//!
//! Reconstructs column values from the INSERT, UPDATE and DELETE statements
//! LogMiner writes into `V$LOGMNR_CONTENTS.SQL_REDO`:
//!
//! ```text
//! insert into "S"."T"("A","B") values ('1',TO_DATE('2020-01-01', 'YYYY-MM-DD'));
//! update "S"."T" set "B" = NULL where "A" = '1' and "C" IS NULL;
//! delete from "S"."T" where "A" = '1';
//! ```
//!
//! Values come out as [`RawValue::Literal`](crate::common::RawValue::Literal)
//! (quotes stripped, `''` preserved) or
//! [`RawValue::Expression`](crate::common::RawValue::Expression) (verbatim).
//! `NULL`, `Unsupported Type` and columns the statement does not mention are
//! all `None`: LogMiner does not distinguish an omitted column from a NULL one.

use super::scanner::{Scanner, ValueContext, ValueToken};
use crate::common::{CdcError, CdcOp, RawValue, Result, TableSchema, Validator};
use tracing::trace;

/// Statement kind, with LogMiner's `OPERATION_CODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlOperation {
    Insert,
    Delete,
    Update,
}

impl DmlOperation {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Insert),
            2 => Some(Self::Delete),
            3 => Some(Self::Update),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Insert => 1,
            Self::Delete => 2,
            Self::Update => 3,
        }
    }

    pub fn op(&self) -> CdcOp {
        match self {
            Self::Insert => CdcOp::Insert,
            Self::Delete => CdcOp::Delete,
            Self::Update => CdcOp::Update,
        }
    }
}

/// VALUES / SET side of a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignments {
    /// `"col" = value` pairs, or an INSERT column list zipped with its values
    Named(Vec<(String, ValueToken)>),
    /// INSERT without a column list; aligned to the table's column order
    Positional(Vec<ValueToken>),
}

/// A statement as written, before alignment to a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub operation: DmlOperation,
    pub schema: String,
    pub table: String,
    /// Empty for DELETE
    pub assignments: Assignments,
    /// WHERE predicates; `None` when the statement has no WHERE clause
    pub predicates: Option<Vec<(String, ValueToken)>>,
}

/// Values of one statement aligned to the table's columns
#[derive(Debug, Clone, PartialEq)]
pub struct DmlEntry {
    pub operation: DmlOperation,
    /// Before image; empty for INSERT
    pub old: Vec<Option<RawValue>>,
    /// After image; empty for DELETE
    pub new: Vec<Option<RawValue>>,
}

/// Parser for LogMiner's DML dialect
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMinerDmlParser;

impl LogMinerDmlParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse `sql` into its operation, target and value tokens
    pub fn parse_statement(&self, sql: &str) -> Result<ParsedStatement> {
        Validator::validate_statement_size(sql.len())
            .map_err(|e| CdcError::unparsable(e.to_string(), preview(sql)))?;

        let mut scanner = Scanner::new(sql);
        let statement = if scanner.eat_keyword("insert") {
            scanner.skip_whitespace();
            scanner.expect_keyword("into")?;
            parse_insert(&mut scanner)?
        } else if scanner.eat_keyword("update") {
            parse_update(&mut scanner)?
        } else if scanner.eat_keyword("delete") {
            scanner.skip_whitespace();
            scanner.expect_keyword("from")?;
            parse_delete(&mut scanner)?
        } else {
            return Err(scanner.error("not an INSERT, UPDATE or DELETE"));
        };
        scanner.finish()?;
        Ok(statement)
    }

    /// Parse `sql` and align its values to `table`'s columns
    pub fn parse(&self, sql: &str, table: &TableSchema) -> Result<DmlEntry> {
        let statement = self.parse_statement(sql)?;
        if statement.schema != table.id.schema || statement.table != table.id.table {
            return Err(CdcError::schema_mismatch(format!(
                "Statement targets \"{}\".\"{}\" but the schema is for {}",
                statement.schema, statement.table, table.id
            )));
        }
        trace!("Parsed {:?} on {}", statement.operation, table.id);

        let width = table.len();
        let mut old = vec![None; width];
        if let Some(predicates) = statement.predicates {
            apply(&mut old, predicates, table)?;
        }

        let entry = match statement.operation {
            DmlOperation::Insert => {
                let mut new = vec![None; width];
                match statement.assignments {
                    Assignments::Named(pairs) => apply(&mut new, pairs, table)?,
                    Assignments::Positional(values) => {
                        if values.len() != width {
                            return Err(CdcError::schema_mismatch(format!(
                                "INSERT has {} values but {} has {} columns",
                                values.len(),
                                table.id,
                                width
                            )));
                        }
                        for (slot, value) in new.iter_mut().zip(values) {
                            *slot = value.into_raw();
                        }
                    }
                }
                DmlEntry {
                    operation: DmlOperation::Insert,
                    old: Vec::new(),
                    new,
                }
            }
            DmlOperation::Update => {
                let mut new = old.clone();
                if let Assignments::Named(pairs) = statement.assignments {
                    apply(&mut new, pairs, table)?;
                }
                DmlEntry {
                    operation: DmlOperation::Update,
                    old,
                    new,
                }
            }
            DmlOperation::Delete => DmlEntry {
                operation: DmlOperation::Delete,
                old,
                new: Vec::new(),
            },
        };
        Ok(entry)
    }
}

fn apply(
    row: &mut [Option<RawValue>],
    pairs: Vec<(String, ValueToken)>,
    table: &TableSchema,
) -> Result<()> {
    for (column, value) in pairs {
        let index = table.column_index(&column).ok_or_else(|| {
            CdcError::schema_mismatch(format!("Column '{}' is not in {}", column, table.id))
        })?;
        row[index] = value.into_raw();
    }
    Ok(())
}

fn preview(sql: &str) -> String {
    sql.chars().take(256).collect()
}

fn parse_target(scanner: &mut Scanner<'_>) -> Result<(String, String)> {
    scanner.skip_whitespace();
    let schema = scanner.quoted_identifier()?;
    scanner.expect(b'.')?;
    let table = scanner.quoted_identifier()?;
    Ok((schema, table))
}

fn parse_insert(scanner: &mut Scanner<'_>) -> Result<ParsedStatement> {
    let (schema, table) = parse_target(scanner)?;
    scanner.skip_whitespace();

    let columns = if scanner.eat(b'(') {
        let mut columns = Vec::new();
        loop {
            scanner.skip_whitespace();
            columns.push(scanner.quoted_identifier()?);
            scanner.skip_whitespace();
            if scanner.eat(b')') {
                break;
            }
            scanner.expect(b',')?;
        }
        scanner.skip_whitespace();
        Some(columns)
    } else {
        None
    };

    scanner.expect_keyword("values")?;
    scanner.skip_whitespace();
    scanner.expect(b'(')?;
    let mut values = Vec::new();
    loop {
        values.push(scanner.value(ValueContext::Tuple)?);
        if scanner.eat(b')') {
            break;
        }
        scanner.expect(b',')?;
    }

    let assignments = match columns {
        Some(columns) => {
            if columns.len() != values.len() {
                return Err(scanner.error(format!(
                    "{} columns but {} values",
                    columns.len(),
                    values.len()
                )));
            }
            Assignments::Named(columns.into_iter().zip(values).collect())
        }
        None => Assignments::Positional(values),
    };

    Ok(ParsedStatement {
        operation: DmlOperation::Insert,
        schema,
        table,
        assignments,
        predicates: None,
    })
}

fn parse_update(scanner: &mut Scanner<'_>) -> Result<ParsedStatement> {
    let (schema, table) = parse_target(scanner)?;
    scanner.skip_whitespace();
    scanner.expect_keyword("set")?;

    let mut pairs = Vec::new();
    loop {
        scanner.skip_whitespace();
        let column = scanner.quoted_identifier()?;
        scanner.skip_whitespace();
        scanner.expect(b'=')?;
        scanner.skip_whitespace();
        pairs.push((column, scanner.value(ValueContext::SetClause)?));
        if !scanner.eat(b',') {
            break;
        }
    }

    Ok(ParsedStatement {
        operation: DmlOperation::Update,
        schema,
        table,
        assignments: Assignments::Named(pairs),
        predicates: parse_where(scanner)?,
    })
}

fn parse_delete(scanner: &mut Scanner<'_>) -> Result<ParsedStatement> {
    let (schema, table) = parse_target(scanner)?;
    Ok(ParsedStatement {
        operation: DmlOperation::Delete,
        schema,
        table,
        assignments: Assignments::Named(Vec::new()),
        predicates: parse_where(scanner)?,
    })
}

fn parse_where(scanner: &mut Scanner<'_>) -> Result<Option<Vec<(String, ValueToken)>>> {
    scanner.skip_whitespace();
    if !scanner.eat_keyword("where") {
        return Ok(None);
    }

    let mut predicates = Vec::new();
    loop {
        scanner.skip_whitespace();
        let column = scanner.quoted_identifier()?;
        scanner.skip_whitespace();
        let value = if scanner.eat_keyword("is") {
            scanner.skip_whitespace();
            scanner.expect_keyword("null")?;
            ValueToken::Null
        } else {
            scanner.expect(b'=')?;
            scanner.skip_whitespace();
            scanner.value(ValueContext::WhereClause)?
        };
        predicates.push((column, value));

        scanner.skip_whitespace();
        if !scanner.eat_keyword("and") {
            break;
        }
    }
    Ok(Some(predicates))
}
