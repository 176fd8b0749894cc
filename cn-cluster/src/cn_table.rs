//! Long-format copy-number table
//!
//! One row per (chr, start, end, cell_id) with a `copy` value. Columns
//! beyond the five required ones are carried through as text and written
//! back in their original positions.

use crate::common::*;
use anyhow::Context;
use matrix_util::common_io::{mkdir, open_buf_reader, open_buf_writer};
use std::io::{Read, Write};

pub const REQUIRED_COLUMNS: [&str; 5] = ["chr", "start", "end", "cell_id", "copy"];

#[derive(Debug, Clone, PartialEq)]
pub struct CnRecord {
    pub chr: Box<str>,
    pub start: u64,
    pub end: u64,
    pub cell_id: Box<str>,
    pub copy: Option<f32>,
    /// values of the carried columns, in `CnTable::extra_names` order
    pub extra: Vec<Box<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Chr,
    Start,
    End,
    CellId,
    Copy,
    Extra(usize),
}

#[derive(Debug, Clone)]
pub struct CnTable {
    columns: Vec<Column>,
    extra_names: Vec<Box<str>>,
    pub rows: Vec<CnRecord>,
}

impl CnTable {
    /// A table with the required columns first, then `extra_names`
    pub fn new(extra_names: Vec<Box<str>>, rows: Vec<CnRecord>) -> anyhow::Result<Self> {
        for (i, r) in rows.iter().enumerate() {
            anyhow::ensure!(
                r.extra.len() == extra_names.len(),
                "row {} has {} extra values, expected {}",
                i,
                r.extra.len(),
                extra_names.len()
            );
        }
        let mut columns = vec![
            Column::Chr,
            Column::Start,
            Column::End,
            Column::CellId,
            Column::Copy,
        ];
        columns.extend((0..extra_names.len()).map(Column::Extra));
        Ok(Self {
            columns,
            extra_names,
            rows,
        })
    }

    /// Read a header-ful CSV file, gzipped or not
    pub fn from_csv(path: &str) -> anyhow::Result<Self> {
        let reader = open_buf_reader(path)?;
        Self::from_reader(reader).with_context(|| format!("failed to read CN table {}", path))
    }

    pub fn from_reader<R: Read>(reader: R) -> anyhow::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(reader);

        let header = rdr.headers()?.clone();

        let mut extra_names = vec![];
        let mut columns = Vec::with_capacity(header.len());
        for name in header.iter() {
            let col = match name.trim() {
                "chr" => Column::Chr,
                "start" => Column::Start,
                "end" => Column::End,
                "cell_id" => Column::CellId,
                "copy" => Column::Copy,
                _ => {
                    extra_names.push(name.to_string().into_boxed_str());
                    Column::Extra(extra_names.len() - 1)
                }
            };
            if !matches!(col, Column::Extra(_)) && columns.contains(&col) {
                anyhow::bail!("duplicate column: {}", name);
            }
            columns.push(col);
        }

        let required = [
            Column::Chr,
            Column::Start,
            Column::End,
            Column::CellId,
            Column::Copy,
        ];
        for (col, name) in required.iter().zip(REQUIRED_COLUMNS) {
            if !columns.contains(col) {
                anyhow::bail!("missing required column: {}", name);
            }
        }

        let mut rows = vec![];
        for (i, rec) in rdr.records().enumerate() {
            // header is line 1
            let line = i + 2;
            let rec = rec.with_context(|| format!("line {}", line))?;

            let mut chr: Box<str> = "".into();
            let mut start = 0;
            let mut end = 0;
            let mut cell_id: Box<str> = "".into();
            let mut copy = None;
            let mut extra: Vec<Box<str>> = vec!["".into(); extra_names.len()];

            for (col, field) in columns.iter().zip(rec.iter()) {
                match col {
                    Column::Chr => chr = field.into(),
                    Column::Start => {
                        start = parse_coordinate(field)
                            .with_context(|| format!("line {}: bad start", line))?
                    }
                    Column::End => {
                        end = parse_coordinate(field)
                            .with_context(|| format!("line {}: bad end", line))?
                    }
                    Column::CellId => cell_id = field.into(),
                    Column::Copy => {
                        copy = parse_copy(field)
                            .with_context(|| format!("line {}: bad copy", line))?
                    }
                    Column::Extra(k) => extra[*k] = field.into(),
                }
            }

            rows.push(CnRecord {
                chr,
                start,
                end,
                cell_id,
                copy,
                extra,
            });
        }

        Ok(Self {
            columns,
            extra_names,
            rows,
        })
    }

    /// Write all rows with the original column order
    pub fn to_csv(&self, path: &str) -> anyhow::Result<()> {
        mkdir(path)?;
        let writer = open_buf_writer(path)?;
        self.to_writer(writer)
            .with_context(|| format!("failed to write CN table {}", path))
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);

        wtr.write_record(self.column_names())?;

        let mut fields: Vec<String> = Vec::with_capacity(self.columns.len());
        for r in self.rows.iter() {
            fields.clear();
            for col in self.columns.iter() {
                fields.push(match col {
                    Column::Chr => r.chr.to_string(),
                    Column::Start => r.start.to_string(),
                    Column::End => r.end.to_string(),
                    Column::CellId => r.cell_id.to_string(),
                    Column::Copy => r.copy.map(|x| x.to_string()).unwrap_or_default(),
                    Column::Extra(k) => r.extra[*k].to_string(),
                });
            }
            wtr.write_record(&fields)?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn column_name(&self, col: Column) -> &str {
        match col {
            Column::Chr => "chr",
            Column::Start => "start",
            Column::End => "end",
            Column::CellId => "cell_id",
            Column::Copy => "copy",
            Column::Extra(k) => &self.extra_names[k],
        }
    }

    /// Column names in file order
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| self.column_name(*c)).collect()
    }

    pub fn extra_names(&self) -> &[Box<str>] {
        &self.extra_names
    }

    /// Index of a carried column in `CnRecord::extra`
    pub fn extra_column(&self, name: &str) -> Option<usize> {
        self.extra_names.iter().position(|x| &**x == name)
    }

    /// Add a carried column, or overwrite it if it exists
    ///
    /// * `name` - column name
    /// * `value_fn` - value of each row
    pub fn set_extra_column<F>(&mut self, name: &str, mut value_fn: F) -> usize
    where
        F: FnMut(&CnRecord) -> Box<str>,
    {
        let k = match self.extra_column(name) {
            Some(k) => k,
            None => {
                self.extra_names.push(name.into());
                let k = self.extra_names.len() - 1;
                self.columns.push(Column::Extra(k));
                for r in self.rows.iter_mut() {
                    r.extra.push("".into());
                }
                k
            }
        };
        for r in self.rows.iter_mut() {
            let v = value_fn(&*r);
            r.extra[k] = v;
        }
        k
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Distinct cell ids, sorted
    pub fn cell_ids(&self) -> Vec<Box<str>> {
        let mut ret: Vec<Box<str>> = self
            .rows
            .iter()
            .map(|r| r.cell_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ret.sort();
        ret
    }

    /// Distinct bin end coordinates, ascending
    pub fn ends(&self) -> Vec<u64> {
        let mut ret: Vec<u64> = self.rows.iter().map(|r| r.end).collect();
        ret.sort_unstable();
        ret.dedup();
        ret
    }

    /// Keep the rows satisfying `pred`, preserving order
    pub fn retain<F>(&mut self, pred: F)
    where
        F: FnMut(&CnRecord) -> bool,
    {
        self.rows.retain(pred);
    }
}

/// Bin coordinates are integers; tolerate a float rendering such as
/// `1000000.0`
fn parse_coordinate(field: &str) -> anyhow::Result<u64> {
    let field = field.trim();
    if let Ok(x) = field.parse::<u64>() {
        return Ok(x);
    }
    let x: f64 = field
        .parse()
        .map_err(|_| anyhow::anyhow!("not a coordinate: {:?}", field))?;
    if x >= 0.0 && x.fract() == 0.0 && x <= u64::MAX as f64 {
        Ok(x as u64)
    } else {
        anyhow::bail!("not a coordinate: {:?}", field)
    }
}

fn parse_copy(field: &str) -> anyhow::Result<Option<f32>> {
    let field = field.trim();
    if field.is_empty()
        || field.eq_ignore_ascii_case("na")
        || field.eq_ignore_ascii_case("nan")
    {
        return Ok(None);
    }
    let x: f32 = field
        .parse()
        .map_err(|_| anyhow::anyhow!("not a number: {:?}", field))?;
    Ok(Some(x))
}
