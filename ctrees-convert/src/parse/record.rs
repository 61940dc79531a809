use super::schema::HaloSchema;
use crate::container::DType;

/// One parsed field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Real(f64),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Real(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Int(v) => *v as f64,
            FieldValue::Real(v) => *v,
        }
    }
}

/// One halo at one snapshot: the stored fields of a data line, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct HaloRecord {
    values: Vec<FieldValue>,
}

impl HaloRecord {
    pub fn from_values(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    /// Parse a whitespace-separated data line against `schema`.
    ///
    /// The field count is checked against the full header; only stored
    /// columns are converted. Errors are returned as a reason string for
    /// the caller to locate.
    pub fn parse_line(schema: &HaloSchema, line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != schema.ncolumns() {
            return Err(format!(
                "expected {} fields, got {}",
                schema.ncolumns(),
                fields.len()
            ));
        }

        let columns = schema.columns();
        let mut values = Vec::with_capacity(schema.stored_indices().len());
        for &i in schema.stored_indices() {
            let (spec, raw) = (&columns[i], fields[i]);
            let value = match spec.dtype {
                DType::F64 => raw
                    .parse::<f64>()
                    .map(FieldValue::Real)
                    .map_err(|_| format!("field '{}' is not a number: '{}'", spec.name, raw))?,
                DType::I64 => raw
                    .parse::<i64>()
                    .map(FieldValue::Int)
                    .map_err(|_| format!("field '{}' is not an integer: '{}'", spec.name, raw))?,
                DType::I32 => {
                    let v = raw
                        .parse::<i64>()
                        .map_err(|_| format!("field '{}' is not an integer: '{}'", spec.name, raw))?;
                    if i32::try_from(v).is_err() {
                        return Err(format!("field '{}' value {} exceeds 32-bit range", spec.name, v));
                    }
                    FieldValue::Int(v)
                }
            };
            values.push(value);
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<FieldValue> {
        self.values.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldSelection;
    use std::path::Path;

    fn schema() -> HaloSchema {
        HaloSchema::from_header_line(
            Path::new("tree_0_0_0.dat"),
            "#scale(0) id(1) desc_id(2) num_prog(3) pid(4) mvir(5)",
        )
        .unwrap()
    }

    #[test]
    fn parses_typed_fields() {
        let rec = HaloRecord::parse_line(&schema(), "0.5 1001 -1 2 -1 1.5e12").unwrap();
        assert_eq!(
            rec.values(),
            &[
                FieldValue::Real(0.5),
                FieldValue::Int(1001),
                FieldValue::Int(-1),
                FieldValue::Int(2),
                FieldValue::Int(-1),
                FieldValue::Real(1.5e12),
            ]
        );
    }

    #[test]
    fn short_line_rejected() {
        let err = HaloRecord::parse_line(&schema(), "0.5 1001 -1 2 -1").unwrap_err();
        assert_eq!(err, "expected 6 fields, got 5");
    }

    #[test]
    fn non_numeric_rejected() {
        let err = HaloRecord::parse_line(&schema(), "0.5 abc -1 2 -1 1.0").unwrap_err();
        assert!(err.contains("'id'"), "unexpected: {}", err);
    }

    #[test]
    fn small_int_range_checked() {
        let err = HaloRecord::parse_line(&schema(), "0.5 1 -1 4294967296 -1 1.0").unwrap_err();
        assert!(err.contains("32-bit"), "unexpected: {}", err);
    }

    #[test]
    fn only_stored_fields_kept() {
        let selected = schema()
            .select(&FieldSelection {
                fields: Some(vec!["id".into(), "mvir".into()]),
                drop_fields: vec![],
            })
            .unwrap();
        let rec = HaloRecord::parse_line(&selected, "0.5 1001 -1 2 -1 1.5e12").unwrap();
        assert_eq!(rec.values(), &[FieldValue::Int(1001), FieldValue::Real(1.5e12)]);
        assert!(HaloRecord::parse_line(&selected, "1001 1.5e12").is_err());
    }
}
