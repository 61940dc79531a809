use crate::container::{ColumnData, ColumnSpec, DType, RowBlock};
use crate::error::{ConvertError, Result};
use crate::parse::{FieldValue, HaloRecord, HaloSchema};

/// Column-major staging buffer for one forest (or one halo-catalog chunk).
///
/// Records are accumulated here and reach the container only as a whole,
/// so an interrupted forest never leaves half its halos on disk.
#[derive(Debug, Clone)]
pub struct ForestBatch {
    columns: Vec<ColumnSpec>,
    data: Vec<ColumnData>,
}

impl ForestBatch {
    pub fn new(schema: &HaloSchema) -> Self {
        Self::with_columns(schema.stored_columns())
    }

    pub fn with_columns(columns: Vec<ColumnSpec>) -> Self {
        let data = columns
            .iter()
            .map(|c| ColumnData::with_capacity(c.dtype, 0))
            .collect();
        Self { columns, data }
    }

    pub fn push(&mut self, record: &HaloRecord) -> Result<()> {
        if record.len() != self.columns.len() {
            return Err(ConvertError::container(
                "batch",
                format!("record has {} fields, batch has {} columns", record.len(), self.columns.len()),
            ));
        }
        // Check every field before touching any column.
        for (spec, value) in self.columns.iter().zip(record.values()) {
            match (spec.dtype, *value) {
                (DType::F64, _) | (DType::I64, FieldValue::Int(_)) => {}
                (DType::I32, FieldValue::Int(x)) if i32::try_from(x).is_ok() => {}
                (DType::I32, FieldValue::Int(x)) => {
                    return Err(ConvertError::container(&spec.name, format!("{} exceeds i32", x)));
                }
                (_, FieldValue::Real(_)) => {
                    return Err(ConvertError::container(&spec.name, "real value for integer column"));
                }
            }
        }
        for (col, value) in self.data.iter_mut().zip(record.values()) {
            match (col, *value) {
                (ColumnData::F64(v), value) => v.push(value.as_f64()),
                (ColumnData::I64(v), FieldValue::Int(x)) => v.push(x),
                (ColumnData::I32(v), FieldValue::Int(x)) => v.push(x as i32),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn extend<'r>(&mut self, records: impl IntoIterator<Item = &'r HaloRecord>) -> Result<()> {
        for record in records {
            self.push(record)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.first().map(ColumnData::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(ColumnData::clear);
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn data(&self) -> &[ColumnData] {
        &self.data
    }

    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns.iter().position(|c| c.name == name).map(|i| &self.data[i])
    }

    pub fn to_rows(&self) -> Result<RowBlock> {
        RowBlock::from_columns(&self.columns, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn schema() -> HaloSchema {
        HaloSchema::from_header_line(Path::new("t"), "#scale id num_prog mvir").unwrap()
    }

    #[test]
    fn stages_records_by_column() {
        let schema = schema();
        let mut batch = ForestBatch::new(&schema);
        for line in ["1.0 5 1 2e12", "0.9 6 0 1e12"] {
            batch.push(&HaloRecord::parse_line(&schema, line).unwrap()).unwrap();
        }
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.column("id"), Some(&ColumnData::I64(vec![5, 6])));
        assert_eq!(batch.column("num_prog"), Some(&ColumnData::I32(vec![1, 0])));
        assert_eq!(batch.column("scale"), Some(&ColumnData::F64(vec![1.0, 0.9])));
        assert_eq!(batch.to_rows().unwrap().len(), 2);
        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn rejects_wrong_width_record() {
        let mut batch = ForestBatch::new(&schema());
        let short = HaloRecord::from_values(vec![FieldValue::Real(1.0)]);
        assert!(batch.push(&short).is_err());
        let wrong_kind = HaloRecord::from_values(vec![
            FieldValue::Real(1.0),
            FieldValue::Real(5.0),
            FieldValue::Int(1),
            FieldValue::Real(2.0),
        ]);
        assert!(batch.push(&wrong_kind).is_err());
    }
}
