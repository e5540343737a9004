//! Declared store layouts, oldest first

use super::SchemaVersion;
use crate::migration::mappings;

pub fn builtin_versions() -> Vec<SchemaVersion> {
    vec![
        SchemaVersion {
            number: 8,
            ddl: include_str!("sql/v08.sql"),
            mapping_to_next: Some(mappings::v8_to_v9),
        },
        SchemaVersion {
            number: 9,
            ddl: include_str!("sql/v09.sql"),
            mapping_to_next: Some(mappings::v9_to_v10),
        },
        SchemaVersion {
            number: 10,
            ddl: include_str!("sql/v10.sql"),
            mapping_to_next: Some(mappings::v10_to_v11),
        },
        SchemaVersion {
            number: 11,
            ddl: include_str!("sql/v11.sql"),
            mapping_to_next: Some(mappings::v11_to_v12),
        },
        SchemaVersion {
            number: 12,
            ddl: include_str!("sql/v12.sql"),
            mapping_to_next: Some(mappings::v12_to_v13),
        },
        SchemaVersion {
            number: 13,
            ddl: include_str!("sql/v13.sql"),
            mapping_to_next: None,
        },
    ]
}
