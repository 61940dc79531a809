use crate::error::{ConvertError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A whitespace-separated text table with a `#`-prefixed column-name line.
///
/// Columns are found by name. Later `#` lines and blank lines are ignored.
#[derive(Debug)]
pub(crate) struct TextTable {
    path: PathBuf,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TextTable {
    pub fn read(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(ConvertError::InputNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate();
        let header = lines
            .next()
            .map(|(_, l)| l.trim())
            .and_then(|l| l.strip_prefix('#'))
            .ok_or_else(|| ConvertError::index(path, "first line must be a '#' column header"))?;
        let columns: Vec<String> = header.split_whitespace().map(str::to_string).collect();
        if columns.is_empty() {
            return Err(ConvertError::index(path, "header names no columns"));
        }

        let mut rows = Vec::new();
        for (lineno, line) in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if fields.len() != columns.len() {
                return Err(ConvertError::index(
                    path,
                    format!(
                        "line {} has {} fields, header has {}",
                        lineno + 1,
                        fields.len(),
                        columns.len()
                    ),
                ));
            }
            rows.push(fields);
        }

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns.iter().position(|c| c == name).ok_or_else(|| {
            ConvertError::index(
                &self.path,
                format!("missing column '{}' (found: {})", name, self.columns.join(" ")),
            )
        })
    }

    pub fn i64_column(&self, name: &str) -> Result<Vec<i64>> {
        let col = self.column_index(name)?;
        self.rows
            .iter()
            .map(|row| {
                row[col].parse::<i64>().map_err(|_| {
                    ConvertError::index(
                        &self.path,
                        format!("'{}' in column {} is not an integer", row[col], name),
                    )
                })
            })
            .collect()
    }

    pub fn str_column(&self, name: &str) -> Result<Vec<&str>> {
        let col = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row[col].as_str()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_by_name() {
        let table = TextTable::parse(
            Path::new("locations.dat"),
            "#TreeRootID FileID Offset Filename\n\
             10 0 120 tree_0_0_0.dat\n\
             \n\
             # trailing comment\n\
             20 0 980 tree_0_0_0.dat\n",
        )
        .unwrap();
        assert!(table.has_column("Offset"));
        assert!(!table.has_column("ForestID"));
        assert_eq!(table.i64_column("Offset").unwrap(), vec![120, 980]);
        assert_eq!(table.str_column("Filename").unwrap(), vec!["tree_0_0_0.dat"; 2]);
    }

    #[test]
    fn ragged_row_rejected() {
        let err = TextTable::parse(Path::new("forests.list"), "#TreeRootID ForestID\n1 2\n3\n").unwrap_err();
        assert!(err.to_string().contains("line 3"), "unexpected: {}", err);
    }

    #[test]
    fn missing_header_rejected() {
        assert!(TextTable::parse(Path::new("forests.list"), "1 2\n").is_err());
        assert!(TextTable::parse(Path::new("forests.list"), "").is_err());
    }

    #[test]
    fn non_integer_rejected() {
        let table = TextTable::parse(Path::new("forests.list"), "#TreeRootID ForestID\n1 x\n").unwrap();
        assert!(matches!(
            table.i64_column("ForestID"),
            Err(ConvertError::IndexFormat { .. })
        ));
        assert!(table.i64_column("FileID").is_err());
    }
}
