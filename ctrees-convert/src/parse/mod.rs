//! ASCII catalog parsing: column headers, halo records, and the streaming
//! line parser used for both merger trees and halo catalogs.

mod parser;
mod record;
mod schema;

pub use parser::{RecordParser, TreeReader};
pub use record::{FieldValue, HaloRecord};
pub use schema::{open_text, storage_kind, CatalogHeader, CatalogKind, HaloSchema};
