use std::collections::HashSet;
use std::io::Read;

use csv::{ReaderBuilder, Trim};
use rusqlite::types::Value;

use sluice_core::error::{Result, SluiceError};
use sluice_core::types::{LoadOptions, SchemaMode};

/// Storage type chosen for a loaded column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Boolean => "BOOLEAN",
            Self::Text => "TEXT",
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            Self::Integer => value.parse::<i64>().is_ok(),
            Self::Real => value.parse::<f64>().is_ok(),
            Self::Boolean => parse_bool(value).is_some(),
            Self::Text => true,
        }
    }

    /// Convert a field into a SQLite value. Fields that no longer fit the
    /// inferred type are kept as text.
    pub fn to_value(&self, field: Option<&str>) -> Value {
        let Some(s) = field else {
            return Value::Null;
        };
        let parsed = match self {
            Self::Integer => s.parse().ok().map(Value::Integer),
            Self::Real => s.parse().ok().map(Value::Real),
            Self::Boolean => parse_bool(s).map(|b| Value::Integer(i64::from(b))),
            Self::Text => None,
        };
        parsed.unwrap_or_else(|| Value::Text(s.to_string()))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// A CSV source after header handling, row repair and type inference.
#[derive(Debug, Clone)]
pub struct ParsedCsv {
    pub columns: Vec<Column>,
    /// Rows normalized to `columns.len()` fields; `None` is NULL.
    pub rows: Vec<Vec<Option<String>>>,
    /// Malformed rows dropped within the bad-record budget.
    pub bad_records: usize,
}

/// Parse CSV input per the load options.
///
/// The first skipped row, if any, names the columns; otherwise columns are
/// `column_1..n` sized by the first data row. Short rows are padded with
/// NULLs when jagged rows are allowed, long rows truncated when unknown values
/// are ignored; any other width mismatch counts against `max_bad_records`.
pub fn parse_csv<R: Read>(input: R, options: &LoadOptions) -> Result<ParsedCsv> {
    let delimiter = u8::try_from(options.delimiter).map_err(|_| {
        SluiceError::Load(format!("delimiter {:?} is not a single byte", options.delimiter))
    })?;

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(input);

    let mut header: Option<Vec<String>> = None;
    let mut width: Option<usize> = None;
    let mut rows = Vec::new();
    let mut bad_records = 0usize;
    let tolerance = &options.error_tolerance;

    for (idx, record) in reader.records().enumerate() {
        let record = record
            .map_err(|e| SluiceError::Load(format!("malformed csv at record {}: {}", idx, e)))?;
        if idx < options.skip_header_rows {
            if idx == 0 {
                width = Some(record.len());
                header = Some(record.iter().map(str::to_string).collect());
            }
            continue;
        }

        let expected = *width.get_or_insert(record.len());
        let mut fields: Vec<Option<String>> = record
            .iter()
            .map(|f| if f.is_empty() { None } else { Some(f.to_string()) })
            .collect();

        if fields.len() < expected && tolerance.allow_jagged_rows {
            fields.resize(expected, None);
        } else if fields.len() > expected && tolerance.ignore_unknown_values {
            fields.truncate(expected);
        }

        if fields.len() != expected {
            bad_records += 1;
            if bad_records > tolerance.max_bad_records {
                return Err(SluiceError::Load(format!(
                    "record {} has {} fields, expected {} (bad records exceed limit of {})",
                    idx,
                    record.len(),
                    expected,
                    tolerance.max_bad_records
                )));
            }
            continue;
        }
        rows.push(fields);
    }

    let width = width.unwrap_or(0);
    let names = column_names(header.as_deref(), width);
    let columns = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| Column {
            name,
            ty: match options.schema_mode {
                SchemaMode::AllText => ColumnType::Text,
                SchemaMode::Autodetect => infer_type(rows.iter().filter_map(|r| r[i].as_deref())),
            },
        })
        .collect();

    Ok(ParsedCsv {
        columns,
        rows,
        bad_records,
    })
}

/// Narrowest type every non-null value fits.
fn infer_type<'a>(values: impl Iterator<Item = &'a str> + Clone) -> ColumnType {
    if values.clone().next().is_none() {
        return ColumnType::Text;
    }
    [ColumnType::Integer, ColumnType::Real, ColumnType::Boolean]
        .into_iter()
        .find(|ty| values.clone().all(|v| ty.accepts(v)))
        .unwrap_or(ColumnType::Text)
}

/// Unique, non-empty column names.
fn column_names(header: Option<&[String]>, width: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    (0..width)
        .map(|i| {
            let base = header
                .and_then(|h| h.get(i))
                .filter(|n| !n.is_empty())
                .cloned()
                .unwrap_or_else(|| format!("column_{}", i + 1));
            let mut name = base.clone();
            let mut n = 2;
            while !seen.insert(name.to_ascii_lowercase()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            name
        })
        .collect()
}
