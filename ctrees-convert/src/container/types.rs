//! Value types exchanged with storage backends.
//!
//! All on-disk encodings are little-endian. Compound rows are packed: each
//! field follows the previous one with no alignment padding, so a row of
//! `id: i64, mvir: f64, num_prog: i32` is 20 bytes.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};

/// Element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I32,
    I64,
    F64,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::I32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F64 => "f64",
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub dtype: DType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Owned values of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F64(Vec<f64>),
}

impl ColumnData {
    pub fn with_capacity(dtype: DType, capacity: usize) -> Self {
        match dtype {
            DType::I32 => ColumnData::I32(Vec::with_capacity(capacity)),
            DType::I64 => ColumnData::I64(Vec::with_capacity(capacity)),
            DType::F64 => ColumnData::F64(Vec::with_capacity(capacity)),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::I32(_) => DType::I32,
            ColumnData::I64(_) => DType::I64,
            ColumnData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::I32(v) => v.len(),
            ColumnData::I64(v) => v.len(),
            ColumnData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            ColumnData::I32(v) => v.clear(),
            ColumnData::I64(v) => v.clear(),
            ColumnData::F64(v) => v.clear(),
        }
    }

    /// Integer view of the column, widening `i32`.
    pub fn as_i64(&self) -> Option<Vec<i64>> {
        match self {
            ColumnData::I32(v) => Some(v.iter().map(|&x| x as i64).collect()),
            ColumnData::I64(v) => Some(v.clone()),
            ColumnData::F64(_) => None,
        }
    }

    pub fn write_le(&self, index: usize, out: &mut Vec<u8>) {
        match self {
            ColumnData::I32(v) => out.extend_from_slice(&v[index].to_le_bytes()),
            ColumnData::I64(v) => out.extend_from_slice(&v[index].to_le_bytes()),
            ColumnData::F64(v) => out.extend_from_slice(&v[index].to_le_bytes()),
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.dtype().size());
        for i in 0..self.len() {
            self.write_le(i, &mut out);
        }
        out
    }

    /// Decode a packed little-endian buffer of `dtype` elements.
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Self {
        match dtype {
            DType::I32 => ColumnData::I32(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::I64 => ColumnData::I64(bytes.chunks_exact(8).map(read_i64).collect()),
            DType::F64 => ColumnData::F64(bytes.chunks_exact(8).map(read_f64).collect()),
        }
    }

    fn push_le(&mut self, bytes: &[u8]) {
        match self {
            ColumnData::I32(v) => v.push(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            ColumnData::I64(v) => v.push(read_i64(bytes)),
            ColumnData::F64(v) => v.push(read_f64(bytes)),
        }
    }
}

fn read_i64(c: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&c[..8]);
    i64::from_le_bytes(buf)
}

fn read_f64(c: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&c[..8]);
    f64::from_le_bytes(buf)
}

/// Scalar attribute attached to a group, dataset, or the container root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// Packed compound rows sharing one column layout.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBlock {
    columns: Vec<ColumnSpec>,
    row_size: usize,
    bytes: Vec<u8>,
}

impl RowBlock {
    pub fn row_size_of(columns: &[ColumnSpec]) -> usize {
        columns.iter().map(|c| c.dtype.size()).sum()
    }

    /// Interleave equal-length columns into packed rows.
    pub fn from_columns(columns: &[ColumnSpec], data: &[ColumnData]) -> Result<Self> {
        if columns.len() != data.len() {
            return Err(ConvertError::container(
                "rows",
                format!("{} column specs for {} columns", columns.len(), data.len()),
            ));
        }
        let nrows = data.first().map(|d| d.len()).unwrap_or(0);
        for (spec, col) in columns.iter().zip(data) {
            if col.dtype() != spec.dtype || col.len() != nrows {
                return Err(ConvertError::container(
                    &spec.name,
                    format!(
                        "column holds {} {} values, expected {} {}",
                        col.len(),
                        col.dtype().as_str(),
                        nrows,
                        spec.dtype.as_str()
                    ),
                ));
            }
        }
        let row_size = Self::row_size_of(columns);
        let mut bytes = Vec::with_capacity(row_size * nrows);
        for row in 0..nrows {
            for col in data {
                col.write_le(row, &mut bytes);
            }
        }
        Ok(Self {
            columns: columns.to_vec(),
            row_size,
            bytes,
        })
    }

    /// Wrap already-packed bytes read back from storage.
    pub fn from_bytes(columns: &[ColumnSpec], bytes: Vec<u8>) -> Result<Self> {
        let row_size = Self::row_size_of(columns);
        if row_size == 0 || bytes.len() % row_size != 0 {
            return Err(ConvertError::container(
                "rows",
                format!("{} bytes is not a whole number of {}-byte rows", bytes.len(), row_size),
            ));
        }
        Ok(Self {
            columns: columns.to_vec(),
            row_size,
            bytes,
        })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn len(&self) -> usize {
        if self.row_size == 0 {
            0
        } else {
            self.bytes.len() / self.row_size
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Split the rows back into one [`ColumnData`] per field.
    pub fn to_columns(&self) -> Vec<ColumnData> {
        let nrows = self.len();
        let mut out: Vec<ColumnData> = self
            .columns
            .iter()
            .map(|c| ColumnData::with_capacity(c.dtype, nrows))
            .collect();
        if self.row_size == 0 {
            return out;
        }
        for row in self.bytes.chunks_exact(self.row_size) {
            let mut pos = 0;
            for (spec, col) in self.columns.iter().zip(out.iter_mut()) {
                let size = spec.dtype.size();
                col.push_le(&row[pos..pos + size]);
                pos += size;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("id", DType::I64),
            ColumnSpec::new("mvir", DType::F64),
            ColumnSpec::new("num_prog", DType::I32),
        ]
    }

    #[test]
    fn packed_row_size() {
        assert_eq!(RowBlock::row_size_of(&specs()), 20);
    }

    #[test]
    fn rows_interleave_and_split() {
        let data = vec![
            ColumnData::I64(vec![10, -1]),
            ColumnData::F64(vec![1.5e12, 2.25e11]),
            ColumnData::I32(vec![2, 0]),
        ];
        let block = RowBlock::from_columns(&specs(), &data).unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(block.as_bytes().len(), 40);
        assert_eq!(&block.as_bytes()[0..8], &10i64.to_le_bytes());
        assert_eq!(&block.as_bytes()[16..20], &2i32.to_le_bytes());
        assert_eq!(block.to_columns(), data);
    }

    #[test]
    fn ragged_columns_rejected() {
        let data = vec![
            ColumnData::I64(vec![10, 11]),
            ColumnData::F64(vec![1.0]),
            ColumnData::I32(vec![2, 0]),
        ];
        assert!(RowBlock::from_columns(&specs(), &data).is_err());
    }

    #[test]
    fn from_bytes_rejects_partial_row() {
        assert!(RowBlock::from_bytes(&specs(), vec![0u8; 30]).is_err());
        assert_eq!(RowBlock::from_bytes(&specs(), vec![0u8; 40]).unwrap().len(), 2);
    }

    #[test]
    fn column_bytes_decode() {
        let col = ColumnData::F64(vec![0.25, -3.0]);
        assert_eq!(ColumnData::from_le_bytes(DType::F64, &col.to_le_bytes()), col);
    }

    #[test]
    fn attr_accessors() {
        assert_eq!(AttrValue::from(3i64).as_int(), Some(3));
        assert_eq!(AttrValue::from(3i64).as_float(), Some(3.0));
        assert_eq!(AttrValue::from("finalized").as_text(), Some("finalized"));
        assert_eq!(AttrValue::from(0.5).as_int(), None);
    }
}
