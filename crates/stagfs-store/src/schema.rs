//! SQL schema for the `SQLite` tag store.
//!
//! The forest is one flat relation with a nullable self-reference. Column
//! names follow the on-disk layout used by existing StagFS databases. Tags
//! are stored with an empty `source`; only references belong to a manifest.

/// Table and index definitions.
pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS stagfs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    datatype TEXT NOT NULL,
    parent INTEGER REFERENCES stagfs(id),
    part TEXT NOT NULL DEFAULT '',
    realfile TEXT DEFAULT NULL,
    source TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS stagfs_lookup ON stagfs(datatype, parent, part);
CREATE INDEX IF NOT EXISTS stagfs_source ON stagfs(source);
";

pub const FIND_TAG: &str = "
SELECT id FROM stagfs
WHERE datatype = ?1 AND parent IS ?2 AND part = ?3
  AND (realfile IS NULL OR realfile = '')
ORDER BY id LIMIT 1";

pub const FIND_REFERENCE: &str = "
SELECT id FROM stagfs
WHERE datatype = ?1 AND parent IS ?2
  AND realfile IS NOT NULL AND realfile != ''
  AND (realfile = ?3 OR part = ?4)
ORDER BY id LIMIT 1";

pub const INSERT_NODE: &str = "
INSERT INTO stagfs (datatype, parent, part, realfile, source)
VALUES (?1, ?2, ?3, ?4, ?5)";

pub const CHILDREN: &str = "
SELECT part, realfile FROM stagfs
WHERE datatype = ?1 AND parent IS ?2
ORDER BY id";

pub const LOOKUP_CHILD: &str = "
SELECT id, realfile FROM stagfs
WHERE datatype = ?1 AND parent IS ?2 AND part = ?3
ORDER BY id LIMIT 1";

pub const LIST_DATATYPES: &str =
    "SELECT DISTINCT datatype FROM stagfs WHERE parent IS NULL ORDER BY datatype";

pub const DELETE_BY_ORIGIN: &str = "DELETE FROM stagfs WHERE source = ?1";

pub const LIST_ORIGINS: &str = "SELECT DISTINCT source FROM stagfs WHERE source != '' ORDER BY source";

pub const CLEAR: &str = "DELETE FROM stagfs";

pub const STATS: &str = "
SELECT
    COUNT(*),
    COALESCE(SUM(CASE WHEN realfile IS NULL OR realfile = '' THEN 1 ELSE 0 END), 0),
    COUNT(DISTINCT CASE WHEN parent IS NULL THEN datatype END),
    COUNT(DISTINCT NULLIF(source, ''))
FROM stagfs";
