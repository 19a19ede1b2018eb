//! Sales aggregation: header probe, count cleaning, and the streaming
//! group-by that turns an input CSV into per-department totals.
//!
//! Input is read one record at a time into a fixed-size [`ColumnBatch`],
//! which is folded into the running totals whenever it fills up. Memory use
//! is bounded by the batch size plus the number of distinct departments,
//! independent of the input size.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Writer};
use regex::Regex;

use crate::error::PipelineError;
use crate::models::build_output_path;

pub const DEPARTMENT_COLUMN: &str = "Department Name";
pub const DATE_COLUMN: &str = "Date";
pub const SALES_COLUMN: &str = "Number of Sales";
pub const TOTAL_COLUMN: &str = "Total Number of Sales";

pub const DEFAULT_BATCH_ROWS: usize = 64 * 1024;

pub fn default_required_columns() -> Vec<String> {
    [DEPARTMENT_COLUMN, DATE_COLUMN, SALES_COLUMN]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn normalize_header(name: &str) -> &str {
    name.trim_start_matches('\u{feff}').trim()
}

fn header_index(headers: &StringRecord, column: &str) -> Option<usize> {
    headers
        .iter()
        .position(|name| normalize_header(name) == column)
}

/// Reads only the header row of `path` and checks that every required column
/// is present. An empty file has no header and is missing everything.
pub fn validate_schema(path: &Path, required: &[String]) -> Result<(), PipelineError> {
    let file = File::open(path).map_err(|e| PipelineError::Unreadable(e.to_string()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Unreadable(e.to_string()))?;

    let missing: Vec<String> = required
        .iter()
        .filter(|column| header_index(headers, column).is_none())
        .cloned()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::SchemaValidation { missing })
    }
}

fn non_digits() -> &'static Regex {
    static NON_DIGITS: OnceLock<Regex> = OnceLock::new();
    NON_DIGITS.get_or_init(|| Regex::new(r"[^0-9]+").expect("pattern is valid"))
}

/// Turns a raw "Number of Sales" cell into a count. Empty cells count as 0;
/// anything else non-numeric keeps only its digits, and what still fails to
/// parse counts as 0.
pub fn clean_sales_count(raw: &str) -> u64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0;
    }

    if let Ok(value) = trimmed.parse::<u64>() {
        return value;
    }

    let digits = non_digits().replace_all(trimmed, "");
    if digits.is_empty() {
        return 0;
    }

    digits.parse::<u64>().unwrap_or(0)
}

/// Column-oriented buffer holding the two columns the aggregation needs.
#[derive(Debug)]
pub struct ColumnBatch {
    departments: Vec<String>,
    sales: Vec<u64>,
    capacity: usize,
}

impl ColumnBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            departments: Vec::with_capacity(capacity),
            sales: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, department: &str, sales: u64) {
        self.departments.push(department.to_owned());
        self.sales.push(sales);
    }

    pub fn len(&self) -> usize {
        self.sales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sales.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Adds every buffered row to `totals` and empties the batch.
    pub fn drain_into(&mut self, totals: &mut DepartmentTotals) {
        for (department, sales) in self.departments.drain(..).zip(self.sales.drain(..)) {
            totals.add(department, sales);
        }
    }
}

/// Running sums per department, kept in first-seen order.
#[derive(Debug, Default)]
pub struct DepartmentTotals {
    index: HashMap<String, usize>,
    rows: Vec<(String, u64)>,
}

impl DepartmentTotals {
    pub fn add(&mut self, department: String, sales: u64) {
        match self.index.get(&department) {
            Some(&i) => {
                let total = &mut self.rows[i].1;
                *total = total.saturating_add(sales);
            }
            None => {
                self.index.insert(department.clone(), self.rows.len());
                self.rows.push((department, sales));
            }
        }
    }

    pub fn get(&self, department: &str) -> Option<u64> {
        self.index.get(department).map(|&i| self.rows[i].1)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.rows.iter().map(|(name, total)| (name.as_str(), *total))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSummary {
    pub path: PathBuf,
    pub rows: u64,
    pub departments: usize,
}

/// The convert and aggregate step run by workers. Implementations are
/// blocking and are called from a blocking thread.
pub trait Aggregator: Send + Sync + 'static {
    fn aggregate(&self, input: &Path, output_dir: &Path) -> Result<AggregateSummary, PipelineError>;
}

#[derive(Debug, Clone)]
pub struct CsvAggregator {
    batch_rows: usize,
}

impl CsvAggregator {
    pub fn new(batch_rows: usize) -> Self {
        Self {
            batch_rows: batch_rows.max(1),
        }
    }
}

impl Default for CsvAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_ROWS)
    }
}

impl Aggregator for CsvAggregator {
    fn aggregate(&self, input: &Path, output_dir: &Path) -> Result<AggregateSummary, PipelineError> {
        let (totals, rows) = sum_by_department(input, self.batch_rows)?;
        let path = build_output_path(output_dir, Utc::now());
        write_totals(&path, &totals)?;

        Ok(AggregateSummary {
            path,
            rows,
            departments: totals.len(),
        })
    }
}

/// Streams `input` and sums sales per department. Cells are read as raw
/// bytes; only the department and sales cells are decoded, lossily, so bad
/// bytes in a cell never fail the job.
pub fn sum_by_department(
    input: &Path,
    batch_rows: usize,
) -> Result<(DepartmentTotals, u64), PipelineError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(input)?;

    let headers = reader.headers()?.clone();
    let (department_idx, sales_idx) =
        match (header_index(&headers, DEPARTMENT_COLUMN), header_index(&headers, SALES_COLUMN)) {
            (Some(d), Some(s)) => (d, s),
            (d, s) => {
                let mut missing = vec![];
                if d.is_none() {
                    missing.push(DEPARTMENT_COLUMN.to_owned());
                }
                if s.is_none() {
                    missing.push(SALES_COLUMN.to_owned());
                }
                return Err(PipelineError::SchemaValidation { missing });
            }
        };

    let mut totals = DepartmentTotals::default();
    let mut batch = ColumnBatch::with_capacity(batch_rows);
    let mut record = ByteRecord::new();
    let mut rows = 0u64;

    while reader.read_byte_record(&mut record)? {
        let department = record
            .get(department_idx)
            .map(String::from_utf8_lossy)
            .unwrap_or_default();
        let sales = record
            .get(sales_idx)
            .map(|cell| clean_sales_count(&String::from_utf8_lossy(cell)))
            .unwrap_or(0);
        batch.push(&department, sales);
        rows += 1;

        if batch.is_full() {
            batch.drain_into(&mut totals);
        }
    }
    batch.drain_into(&mut totals);

    Ok((totals, rows))
}

/// Writes beside the final path first and renames into place, so the
/// recorded result path never points at a half-written file.
pub fn write_totals(path: &Path, totals: &DepartmentTotals) -> Result<(), PipelineError> {
    let partial = path.with_extension("csv.partial");

    let written = (|| -> Result<(), PipelineError> {
        let mut writer = Writer::from_path(&partial)?;
        writer.write_record([DEPARTMENT_COLUMN, TOTAL_COLUMN])?;
        for (department, total) in totals.iter() {
            writer.write_record([department, total.to_string().as_str()])?;
        }
        writer.flush()?;
        Ok(())
    })();

    if let Err(err) = written {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }

    fs::rename(&partial, path)?;
    Ok(())
}
