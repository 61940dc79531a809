//! Streaming record parser.
//!
//! [`RecordParser`] walks any `BufRead` line by line, skipping `#` and blank
//! lines, and yields one `Result<HaloRecord>` per data line. A malformed line
//! yields an error carrying its byte offset in the source file; iteration
//! then continues with the following line, so callers decide whether to stop.

use super::record::HaloRecord;
use super::schema::HaloSchema;
use crate::error::{ConvertError, Result};
use crate::index::TreeLocation;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};

pub struct RecordParser<'s, R: BufRead> {
    reader: R,
    schema: &'s HaloSchema,
    path: PathBuf,
    offset: u64,
    line_buf: Vec<u8>,
    done: bool,
}

impl<'s, R: BufRead> RecordParser<'s, R> {
    /// `start_offset` is the byte position of `reader` within `path`.
    pub fn new(reader: R, schema: &'s HaloSchema, path: &Path, start_offset: u64) -> Self {
        Self {
            reader,
            schema,
            path: path.to_path_buf(),
            offset: start_offset,
            line_buf: Vec::with_capacity(1024),
            done: false,
        }
    }

    /// Byte offset of the next unread line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn malformed(&self, offset: u64, reason: String) -> ConvertError {
        ConvertError::MalformedRecord {
            path: self.path.clone(),
            offset,
            reason,
        }
    }
}

impl<R: BufRead> Iterator for RecordParser<'_, R> {
    type Item = Result<HaloRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.line_buf.clear();
            let n = match self.reader.read_until(b'\n', &mut self.line_buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let line_offset = self.offset;
            self.offset += n as u64;

            let line = match std::str::from_utf8(&self.line_buf) {
                Ok(s) => s.trim(),
                Err(_) => {
                    return Some(Err(self.malformed(line_offset, "line is not valid UTF-8".to_string())));
                }
            };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some(
                HaloRecord::parse_line(self.schema, line).map_err(|reason| self.malformed(line_offset, reason)),
            );
        }
    }
}

/// Random access to trees by location, keeping each tree file open once.
#[derive(Default)]
pub struct TreeReader {
    files: HashMap<PathBuf, File>,
}

impl TreeReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream exactly the byte range of one tree.
    ///
    /// Calling this again with the same location replays the same records.
    pub fn records<'a, 's>(
        &'a mut self,
        schema: &'s HaloSchema,
        location: &TreeLocation,
    ) -> Result<RecordParser<'s, BufReader<Take<&'a File>>>> {
        if !self.files.contains_key(&location.file) {
            if !location.file.is_file() {
                return Err(ConvertError::InputNotFound {
                    path: location.file.clone(),
                });
            }
            let file = File::open(&location.file)?;
            self.files.insert(location.file.clone(), file);
        }
        let file = self
            .files
            .get(&location.file)
            .ok_or_else(|| ConvertError::InputNotFound {
                path: location.file.clone(),
            })?;
        let mut handle = file;
        handle.seek(SeekFrom::Start(location.offset))?;
        let reader = BufReader::new(handle.take(location.length));
        Ok(RecordParser::new(reader, schema, &location.file, location.offset))
    }

    /// Parse one tree fully, in file order.
    pub fn read_tree(&mut self, schema: &HaloSchema, location: &TreeLocation) -> Result<Vec<HaloRecord>> {
        self.records(schema, location)?.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::FieldValue;
    use std::io::Cursor;

    const TREE_FILE: &str = "#scale(0) id(1) desc_id(2) num_prog(3) pid(4) mvir(5)\n\
                             #Omega_M = 0.3\n\
                             2\n\
                             #tree 10\n\
                             1.0 10 -1 1 -1 1e12\n\
                             0.9 11 10 0 -1 9e11\n\
                             #tree 20\n\
                             1.0 20 -1 0 -1 5e11\n";

    fn schema() -> HaloSchema {
        HaloSchema::from_header_line(Path::new("t.dat"), TREE_FILE.lines().next().unwrap()).unwrap()
    }

    #[test]
    fn skips_comments_and_counts() {
        let schema = schema();
        let body = "#tree 10\n\n1.0 10 -1 1 -1 1e12\n";
        let records: Vec<_> = RecordParser::new(Cursor::new(body), &schema, Path::new("t.dat"), 0)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get(1), Some(FieldValue::Int(10)));
    }

    #[test]
    fn malformed_line_reports_offset_and_continues() {
        let schema = schema();
        let body = "1.0 10 -1 1 -1 1e12\n1.0 11 -1 1 -1\n0.9 12 10 0 -1 9e11\n";
        let results: Vec<_> = RecordParser::new(Cursor::new(body), &schema, Path::new("t.dat"), 100).collect();
        assert_eq!(results.len(), 3);
        match &results[1] {
            Err(ConvertError::MalformedRecord { offset, reason, .. }) => {
                assert_eq!(*offset, 120);
                assert_eq!(reason, "expected 6 fields, got 5");
            }
            other => panic!("expected MalformedRecord, got {:?}", other),
        }
        assert!(results[2].is_ok());
    }

    #[test]
    fn reads_exact_tree_range_repeatably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree_0_0_0.dat");
        std::fs::write(&path, TREE_FILE).unwrap();

        let start = TREE_FILE.find("1.0 10").unwrap() as u64;
        let next_tree = TREE_FILE.find("1.0 20").unwrap() as u64;
        let location = TreeLocation {
            file: path.clone(),
            offset: start,
            length: next_tree - "#tree 20\n".len() as u64 - start,
        };

        let mut reader = TreeReader::new();
        let first = reader.read_tree(&schema(), &location).unwrap();
        let again = reader.read_tree(&schema(), &location).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, again);
        assert_eq!(first[1].get(1), Some(FieldValue::Int(11)));
    }

    #[test]
    fn missing_tree_file() {
        let location = TreeLocation {
            file: PathBuf::from("/nonexistent/tree.dat"),
            offset: 0,
            length: 10,
        };
        let err = TreeReader::new().read_tree(&schema(), &location).unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));
    }
}
