//! Redb table definitions for persistent metadata storage.
//!
//! Each record is spread over one entry per field, keyed by
//! `(record id, field name)`. All fields of a record are therefore
//! contiguous in key order and can be read with a single range scan.

use redb::TableDefinition;

/// Key of a single record field: `(record id, field name)`
pub type FieldKey = (&'static str, &'static str);

/// Raw encoded field value
pub type FieldValue = &'static [u8];

/// Definition type shared by every record table
pub type RecordTable = TableDefinition<'static, FieldKey, FieldValue>;

// Pod sandboxes, written by the sandbox allocator
pub const SANDBOX: RecordTable = TableDefinition::new("sandbox");

// VM-backed containers
pub const VIRTUALIZATION: RecordTable = TableDefinition::new("virtualization");
