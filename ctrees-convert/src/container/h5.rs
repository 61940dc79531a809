//! HDF5 container backend (feature `hdf5`).
//!
//! Column datasets are chunked, resizable 1-D datasets of the native element
//! type. Compound datasets use a packed compound datatype built from the
//! column list at run time; since no Rust type describes that row, their
//! bytes go through `H5Dwrite` / `H5Dread` with an explicit memory type.

use super::types::{AttrValue, ColumnData, ColumnSpec, DType, RowBlock};
use super::Container;
use crate::config::WriteOptions;
use crate::error::{ConvertError, Result};
use hdf5::types::{
    CompoundField, CompoundType, FloatSize, IntSize, TypeDescriptor, VarLenUnicode,
};
use hdf5::{Dataset, Dataspace, Datatype, File, Location};
use hdf5_sys::h5d::{H5Dread, H5Dwrite};
use hdf5_sys::h5p::H5P_DEFAULT;
use ndarray::{s, ArrayView1};
use std::ffi::c_void;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub struct Hdf5Container {
    path: PathBuf,
    file: File,
    options: WriteOptions,
}

impl Hdf5Container {
    pub fn create(path: impl AsRef<Path>, options: &WriteOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| h5err("/", e))?;
        Ok(Self {
            path,
            file,
            options: *options,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open_rw(&path).map_err(|e| h5err("/", e))?;
        Ok(Self {
            path,
            file,
            options: WriteOptions::default(),
        })
    }

    fn dataset(&self, name: &str) -> Result<Dataset> {
        self.file.dataset(name).map_err(|e| h5err(name, e))
    }

    /// Create every missing group on the way to `path` (exclusive).
    fn ensure_parent(&self, path: &str) -> Result<()> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        let mut prefix = String::new();
        for part in &parts[..parts.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(part);
            if !self.file.link_exists(&prefix) {
                self.file.create_group(&prefix).map_err(|e| h5err(&prefix, e))?;
            }
        }
        Ok(())
    }

    fn with_location<T>(&self, target: &str, f: impl FnOnce(&Location) -> hdf5::Result<T>) -> Result<T> {
        let name = target.trim_matches('/');
        if name.is_empty() {
            return f(&self.file).map_err(|e| h5err(target, e));
        }
        if let Ok(dataset) = self.file.dataset(name) {
            return f(&dataset).map_err(|e| h5err(target, e));
        }
        if !self.file.link_exists(name) {
            self.ensure_parent(&format!("{}/_", name))?;
        }
        let group = self.file.group(name).map_err(|e| h5err(target, e))?;
        f(&group).map_err(|e| h5err(target, e))
    }

    fn resize_for(&self, dataset: &Dataset, name: &str, added: usize) -> Result<(usize, usize)> {
        let start = dataset.shape().first().copied().unwrap_or(0);
        let end = start + added;
        dataset.resize((end,)).map_err(|e| h5err(name, e))?;
        Ok((start, end))
    }
}

fn h5err(dataset: &str, err: impl std::fmt::Display) -> ConvertError {
    ConvertError::container(dataset, err)
}

fn descriptor(dtype: DType) -> TypeDescriptor {
    match dtype {
        DType::I32 => TypeDescriptor::Integer(IntSize::U4),
        DType::I64 => TypeDescriptor::Integer(IntSize::U8),
        DType::F64 => TypeDescriptor::Float(FloatSize::U8),
    }
}

fn compound_descriptor(columns: &[ColumnSpec]) -> TypeDescriptor {
    let mut offset = 0;
    let fields = columns
        .iter()
        .enumerate()
        .map(|(index, c)| {
            let field = CompoundField::new(&c.name, descriptor(c.dtype), offset, index);
            offset += c.dtype.size();
            field
        })
        .collect();
    TypeDescriptor::Compound(CompoundType {
        fields,
        size: RowBlock::row_size_of(columns),
    })
}

fn dtype_of(desc: &TypeDescriptor) -> Option<DType> {
    match desc {
        TypeDescriptor::Integer(IntSize::U4) => Some(DType::I32),
        TypeDescriptor::Integer(IntSize::U8) => Some(DType::I64),
        TypeDescriptor::Float(FloatSize::U8) => Some(DType::F64),
        _ => None,
    }
}

impl Container for Hdf5Container {
    fn path(&self) -> &Path {
        &self.path
    }

    fn create_column(&mut self, dataset: &str, dtype: DType) -> Result<()> {
        self.ensure_parent(dataset)?;
        let mut builder = self
            .file
            .new_dataset_builder()
            .empty_as(&descriptor(dtype))
            .shape((0..,))
            .chunk((self.options.chunk_rows,));
        if let Some(level) = self.options.compression {
            builder = builder.deflate(level);
        }
        if self.options.shuffle {
            builder = builder.shuffle();
        }
        builder.create(dataset).map_err(|e| h5err(dataset, e))?;
        Ok(())
    }

    fn create_table(&mut self, dataset: &str, columns: &[ColumnSpec]) -> Result<()> {
        self.ensure_parent(dataset)?;
        let mut builder = self
            .file
            .new_dataset_builder()
            .empty_as(&compound_descriptor(columns))
            .shape((0..,))
            .chunk((self.options.chunk_rows,));
        if let Some(level) = self.options.compression {
            builder = builder.deflate(level);
        }
        builder.create(dataset).map_err(|e| h5err(dataset, e))?;
        Ok(())
    }

    fn append_column(&mut self, dataset: &str, data: &ColumnData) -> Result<u64> {
        let ds = self.dataset(dataset)?;
        let (start, end) = self.resize_for(&ds, dataset, data.len())?;
        if data.is_empty() {
            return Ok(start as u64);
        }
        let written = match data {
            ColumnData::I32(v) => ds.write_slice(ArrayView1::from(v.as_slice()), s![start..end]),
            ColumnData::I64(v) => ds.write_slice(ArrayView1::from(v.as_slice()), s![start..end]),
            ColumnData::F64(v) => ds.write_slice(ArrayView1::from(v.as_slice()), s![start..end]),
        };
        written.map_err(|e| h5err(dataset, e))?;
        Ok(start as u64)
    }

    fn append_rows(&mut self, dataset: &str, rows: &RowBlock) -> Result<u64> {
        let ds = self.dataset(dataset)?;
        let (start, end) = self.resize_for(&ds, dataset, rows.len())?;
        if rows.is_empty() {
            return Ok(start as u64);
        }
        let mem_type = Datatype::from_descriptor(&compound_descriptor(rows.columns()))
            .map_err(|e| h5err(dataset, e))?;
        let mem_space = Dataspace::try_new(rows.len()).map_err(|e| h5err(dataset, e))?;
        let file_space = ds
            .space()
            .and_then(|space| space.select(s![start..end]))
            .map_err(|e| h5err(dataset, e))?;
        let status = unsafe {
            H5Dwrite(
                ds.id(),
                mem_type.id(),
                mem_space.id(),
                file_space.id(),
                H5P_DEFAULT,
                rows.as_bytes().as_ptr() as *const c_void,
            )
        };
        if status < 0 {
            return Err(h5err(dataset, "H5Dwrite failed for compound rows"));
        }
        Ok(start as u64)
    }

    fn contains(&self, dataset: &str) -> bool {
        self.file.link_exists(dataset.trim_matches('/')) && self.file.dataset(dataset).is_ok()
    }

    fn row_count(&self, dataset: &str) -> Result<u64> {
        Ok(self.dataset(dataset)?.shape().first().copied().unwrap_or(0) as u64)
    }

    fn read_column(&self, dataset: &str, range: Range<u64>) -> Result<ColumnData> {
        let ds = self.dataset(dataset)?;
        let desc = ds
            .dtype()
            .and_then(|t| t.to_descriptor())
            .map_err(|e| h5err(dataset, e))?;
        let dtype = dtype_of(&desc)
            .ok_or_else(|| ConvertError::container(dataset, "not a 1-D column dataset"))?;
        let (a, b) = (range.start as usize, range.end as usize);
        if a >= b {
            return Ok(ColumnData::with_capacity(dtype, 0));
        }
        let data = match dtype {
            DType::I32 => ds.read_slice_1d::<i32, _>(s![a..b]).map(|v| ColumnData::I32(v.to_vec())),
            DType::I64 => ds.read_slice_1d::<i64, _>(s![a..b]).map(|v| ColumnData::I64(v.to_vec())),
            DType::F64 => ds.read_slice_1d::<f64, _>(s![a..b]).map(|v| ColumnData::F64(v.to_vec())),
        };
        data.map_err(|e| h5err(dataset, e))
    }

    fn read_rows(&self, dataset: &str, range: Range<u64>) -> Result<RowBlock> {
        let columns = self.table_columns(dataset)?;
        let ds = self.dataset(dataset)?;
        let n = (range.end - range.start) as usize;
        let mut bytes = vec![0u8; n * RowBlock::row_size_of(&columns)];
        if n > 0 {
            let mem_type = Datatype::from_descriptor(&compound_descriptor(&columns))
                .map_err(|e| h5err(dataset, e))?;
            let mem_space = Dataspace::try_new(n).map_err(|e| h5err(dataset, e))?;
            let (a, b) = (range.start as usize, range.end as usize);
            let file_space = ds
                .space()
                .and_then(|space| space.select(s![a..b]))
                .map_err(|e| h5err(dataset, e))?;
            let status = unsafe {
                H5Dread(
                    ds.id(),
                    mem_type.id(),
                    mem_space.id(),
                    file_space.id(),
                    H5P_DEFAULT,
                    bytes.as_mut_ptr() as *mut c_void,
                )
            };
            if status < 0 {
                return Err(h5err(dataset, "H5Dread failed for compound rows"));
            }
        }
        RowBlock::from_bytes(&columns, bytes)
    }

    fn table_columns(&self, dataset: &str) -> Result<Vec<ColumnSpec>> {
        let desc = self
            .dataset(dataset)?
            .dtype()
            .and_then(|t| t.to_descriptor())
            .map_err(|e| h5err(dataset, e))?;
        let TypeDescriptor::Compound(compound) = desc else {
            return Err(ConvertError::container(dataset, "not a compound dataset"));
        };
        compound
            .fields
            .iter()
            .map(|f| {
                dtype_of(&f.ty)
                    .map(|dtype| ColumnSpec::new(f.name.clone(), dtype))
                    .ok_or_else(|| {
                        ConvertError::container(dataset, format!("unsupported field type for '{}'", f.name))
                    })
            })
            .collect()
    }

    fn set_attr(&mut self, target: &str, name: &str, value: AttrValue) -> Result<()> {
        self.with_location(target, |loc| {
            if loc.attr_names()?.iter().any(|n| n == name) {
                loc.delete_attr(name)?;
            }
            match &value {
                AttrValue::Int(v) => loc.new_attr::<i64>().create(name)?.write_scalar(v),
                AttrValue::Float(v) => loc.new_attr::<f64>().create(name)?.write_scalar(v),
                AttrValue::Text(s) => {
                    let text = VarLenUnicode::from_str(s)
                        .map_err(|e| hdf5::Error::from(format!("invalid attribute text: {}", e)))?;
                    loc.new_attr::<VarLenUnicode>().create(name)?.write_scalar(&text)
                }
            }
        })
    }

    fn attr(&self, target: &str, name: &str) -> Result<Option<AttrValue>> {
        let trimmed = target.trim_matches('/');
        if !trimmed.is_empty() && !self.file.link_exists(trimmed) {
            return Ok(None);
        }
        self.with_location(target, |loc| {
            let Ok(attr) = loc.attr(name) else {
                return Ok(None);
            };
            let value = match attr.dtype()?.to_descriptor()? {
                TypeDescriptor::Integer(_) => AttrValue::Int(attr.read_scalar::<i64>()?),
                TypeDescriptor::Float(_) => AttrValue::Float(attr.read_scalar::<f64>()?),
                _ => {
                    let text: VarLenUnicode = attr.read_scalar()?;
                    AttrValue::Text(text.to_string())
                }
            };
            Ok(Some(value))
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush().map_err(|e| h5err("/", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_and_attrs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest_0.h5");
        let mut c = Hdf5Container::create(&path, &WriteOptions::default()).unwrap();
        c.create_column("Forests/id", DType::I64).unwrap();
        assert_eq!(c.append_column("Forests/id", &ColumnData::I64(vec![4, 5])).unwrap(), 0);
        assert_eq!(c.append_column("Forests/id", &ColumnData::I64(vec![6])).unwrap(), 2);
        c.set_attr("/", "ConversionState", "converting".into()).unwrap();
        c.set_attr("/", "ConversionState", "finalized".into()).unwrap();
        c.set_attr("Forests", "Nhalos", 3i64.into()).unwrap();
        c.flush().unwrap();
        drop(c);

        let c = Hdf5Container::open(&path).unwrap();
        assert_eq!(c.read_all("Forests/id").unwrap(), ColumnData::I64(vec![4, 5, 6]));
        assert_eq!(
            c.attr("/", "ConversionState").unwrap(),
            Some(AttrValue::Text("finalized".to_string()))
        );
        assert_eq!(c.attr("Forests", "Nhalos").unwrap(), Some(AttrValue::Int(3)));
        assert_eq!(c.read_column("Forests/id", 1..1).unwrap(), ColumnData::I64(vec![]));
    }

    #[test]
    fn compound_rows_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Hdf5Container::create(dir.path().join("halos.h5"), &WriteOptions::default()).unwrap();
        let specs = vec![
            ColumnSpec::new("id", DType::I64),
            ColumnSpec::new("mvir", DType::F64),
            ColumnSpec::new("num_prog", DType::I32),
        ];
        c.create_table("Forests/halos", &specs).unwrap();
        let block = RowBlock::from_columns(
            &specs,
            &[
                ColumnData::I64(vec![1, 2]),
                ColumnData::F64(vec![1e12, 2e11]),
                ColumnData::I32(vec![1, 0]),
            ],
        )
        .unwrap();
        c.append_rows("Forests/halos", &block).unwrap();
        assert_eq!(c.table_columns("Forests/halos").unwrap(), specs);
        assert_eq!(c.read_rows("Forests/halos", 0..2).unwrap(), block);
    }
}
