//! In-memory CSV table.
//!
//! Every pipeline stage reads a header-first CSV, adds or rewrites a few
//! columns and writes the whole thing back. `Table` keeps cells as strings so
//! columns a stage does not know about pass through untouched.

use crate::error::{PipelineError, Result};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self { headers, rows: Vec::new() }
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse CSV from any reader. Short rows are padded, long rows truncated.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();
        let width = headers.len();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().take(width).map(|c| c.to_string()).collect();
            row.resize(width, String::new());
            rows.push(row);
        }
        Ok(Self { headers, rows })
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        self.to_writer(file)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column(name).ok_or_else(|| PipelineError::MissingColumn(name.to_string()))
    }

    /// Cell value, or "" when the column is absent
    pub fn cell<'a>(&'a self, row: usize, name: &str) -> &'a str {
        self.column(name)
            .and_then(|c| self.rows.get(row).and_then(|r| r.get(c)))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    /// All values of a column (missing column yields empty strings)
    pub fn column_values(&self, name: &str) -> Vec<String> {
        match self.column(name) {
            Some(c) => self.rows.iter().map(|r| r[c].clone()).collect(),
            None => vec![String::new(); self.rows.len()],
        }
    }

    /// Add the column, or overwrite it when it already exists.
    /// `values` must have one entry per row.
    pub fn set_column(&mut self, name: &str, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column(name) {
            Some(c) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[c] = value;
                }
            }
            None => {
                self.headers.push(name.to_string());
                let mut values = values.into_iter();
                for row in &mut self.rows {
                    row.push(values.next().unwrap_or_default());
                }
            }
        }
    }

    /// Apply `f` to every cell of a column in place
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str) -> String,
    {
        let c = self.require_column(name)?;
        for row in &mut self.rows {
            row[c] = f(&row[c]);
        }
        Ok(())
    }

    /// Rename headers through `(from, to)` pairs.
    ///
    /// When two source columns map to the same target, the first one present
    /// keeps the name and later ones are left as they were.
    pub fn rename_columns(&mut self, renames: &[(&str, &str)]) {
        for (from, to) in renames {
            if self.column(to).is_some() {
                continue;
            }
            if let Some(c) = self.column(from) {
                self.headers[c] = to.to_string();
            }
        }
    }

    /// Keep exactly `columns`, in that order; absent ones become empty cells
    pub fn select_columns(&self, columns: &[&str]) -> Table {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| self.column(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|i| i.map(|i| row[i].clone()).unwrap_or_default())
                    .collect()
            })
            .collect();
        Table { headers: columns.iter().map(|c| c.to_string()).collect(), rows }
    }

    /// Append another table's rows, aligning by header name
    pub fn append(&mut self, other: &Table) {
        for header in &other.headers {
            if self.column(header).is_none() {
                self.headers.push(header.clone());
                for row in &mut self.rows {
                    row.push(String::new());
                }
            }
        }
        let indices: Vec<Option<usize>> = self.headers.iter().map(|h| other.column(h)).collect();
        for row in &other.rows {
            self.rows.push(
                indices
                    .iter()
                    .map(|i| i.map(|i| row[i].clone()).unwrap_or_default())
                    .collect(),
            );
        }
    }

    /// Drop rows whose every cell is blank
    pub fn drop_empty_rows(&mut self) {
        self.rows.retain(|row| row.iter().any(|c| !c.trim().is_empty()));
    }

    /// Remove exact duplicate rows, keeping the first occurrence.
    /// Returns how many were removed.
    pub fn dedup_rows(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        self.rows.retain(|row| seen.insert(row.clone()));
        before - self.rows.len()
    }
}
