//! SQL statements for the cluster version store.
//!
//! Everything is idempotent where it runs at startup, and the write-marker
//! release is fenced on the owner token so a retried or superseded release
//! can never clobber another writer's row.

pub(crate) const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS repository_versions (
    repository_id BIGINT NOT NULL,
    device_id TEXT NOT NULL,
    version BIGINT NOT NULL,
    is_writing BOOLEAN NOT NULL DEFAULT false,
    write_properties JSONB,
    write_owner TEXT,
    PRIMARY KEY (repository_id, device_id)
);
"#;

pub(crate) const LOAD_VERSIONS: &str = r#"
SELECT device_id, version, is_writing, write_properties, write_owner
FROM repository_versions
WHERE repository_id = $1
"#;

pub(crate) const UPDATE_VERSION: &str = r#"
INSERT INTO repository_versions
    (repository_id, device_id, version, is_writing, write_properties, write_owner)
VALUES ($1, $2, $3, false, NULL, NULL)
ON CONFLICT (repository_id, device_id) DO UPDATE
    SET version = excluded.version,
        is_writing = false,
        write_properties = NULL,
        write_owner = NULL
"#;

/// Plants the durable write marker. The version column is left untouched for
/// an existing row; a brand-new row starts at version 0.
pub(crate) const WILL_WRITE: &str = r#"
INSERT INTO repository_versions
    (repository_id, device_id, version, is_writing, write_properties, write_owner)
VALUES ($1, $2, 0, true, $3, $4)
ON CONFLICT (repository_id, device_id) DO UPDATE
    SET is_writing = true,
        write_properties = excluded.write_properties,
        write_owner = excluded.write_owner
"#;

/// Owner-fenced marker release: a row whose `write_owner` no longer matches
/// is left untouched.
pub(crate) const DID_WRITE: &str = r#"
UPDATE repository_versions
    SET version = $3,
        is_writing = false,
        write_properties = NULL,
        write_owner = NULL
WHERE repository_id = $1 AND device_id = $2 AND write_owner = $4
"#;

pub(crate) const ADVISORY_LOCK: &str = "SELECT pg_advisory_lock($1)";

pub(crate) const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";

pub(crate) const CLEAR_STATEMENT_TIMEOUT: &str = "SET statement_timeout = 0";

pub(crate) fn set_statement_timeout(timeout_ms: u128) -> String {
    format!("SET statement_timeout = {timeout_ms}")
}
