//! redb table definitions. `&str` keys, JSON `&[u8]` values.

use redb::TableDefinition;

/// Finished pipeline runs keyed by `{family}:{started_at_ms:020}:{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// In-flight run leases keyed by `{family}/{environment}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
