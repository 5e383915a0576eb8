/// Backend identifiers are opaque strings (UUIDs in practice).
pub type EntityId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
