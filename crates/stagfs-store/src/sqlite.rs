//! `SQLite` tag store.
//!
//! Persists the forest in a single table (see [`crate::schema`]). Each
//! manifest entry is applied inside one transaction, so a failed entry leaves
//! previously committed entries untouched.
//!
//! Statements run on the blocking pool; the connection sits behind a
//! `std::sync::Mutex` that is only taken there.

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use stagfs_core::{
    ApplyStats, ChildEntry, ChildRef, Mutation, NodeId, StoreError, StoreStats, TagStore,
    reference_name,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, trace};

use crate::schema;

/// Tag store backed by an `SQLite` database file.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Init(format!("creating {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Init(format!("opening {}: {e}", path.display())))?;

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| StoreError::Init(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StoreError::Init(e.to_string()))?;
        debug!("Opened {} (journal_mode={})", path.display(), mode);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create a store that lives only as long as this value.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Init(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Query(format!("store task failed: {e}")))?
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn backing_from(realfile: Option<String>) -> Option<PathBuf> {
    realfile.filter(|s| !s.is_empty()).map(PathBuf::from)
}

/// Tags are shared between manifests and are stored with an empty source.
fn tag_in(
    conn: &Connection,
    datatype: &str,
    parent: Option<NodeId>,
    name: &str,
) -> Result<NodeId, StoreError> {
    let existing = conn
        .query_row(schema::FIND_TAG, params![datatype, parent, name], |row| {
            row.get::<_, NodeId>(0)
        })
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        schema::INSERT_NODE,
        params![datatype, parent, name, Option::<String>::None, ""],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

fn reference_in(
    conn: &Connection,
    datatype: &str,
    parent: Option<NodeId>,
    backing_path: &Path,
    origin: &Path,
) -> Result<NodeId, StoreError> {
    let name = reference_name(backing_path);
    let backing = path_text(backing_path);

    let existing = conn
        .query_row(
            schema::FIND_REFERENCE,
            params![datatype, parent, backing, name],
            |row| row.get::<_, NodeId>(0),
        )
        .optional()
        .map_err(|e| StoreError::Query(e.to_string()))?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        schema::INSERT_NODE,
        params![datatype, parent, name, backing, path_text(origin)],
    )
    .map_err(|e| StoreError::Insert(e.to_string()))?;
    Ok(conn.last_insert_rowid())
}

#[async_trait]
impl TagStore for SqliteStore {
    async fn init(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(schema::SCHEMA_SQL)
                .map_err(|e| StoreError::Init(e.to_string()))
        })
        .await?;
        info!(
            "SqliteStore initialized at {}",
            self.path
                .as_deref()
                .map_or_else(|| ":memory:".to_string(), |p| p.display().to_string())
        );
        Ok(())
    }

    async fn get_or_create_tag(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
        origin: &Path,
    ) -> Result<NodeId, StoreError> {
        trace!("Tag {}/{} asserted by {:?}", datatype, name, origin);
        let (datatype, name) = (datatype.to_string(), name.to_string());
        self.with_conn(move |conn| tag_in(conn, &datatype, parent, &name))
            .await
    }

    async fn get_or_create_reference(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        backing_path: &Path,
        origin: &Path,
    ) -> Result<NodeId, StoreError> {
        let datatype = datatype.to_string();
        let (backing_path, origin) = (backing_path.to_path_buf(), origin.to_path_buf());
        self.with_conn(move |conn| reference_in(conn, &datatype, parent, &backing_path, &origin))
            .await
    }

    async fn children(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
    ) -> Result<Vec<ChildEntry>, StoreError> {
        let datatype = datatype.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached(schema::CHILDREN)
                .map_err(|e| StoreError::Query(e.to_string()))?;

            let rows = stmt
                .query_map(params![datatype, parent], |row| {
                    Ok(ChildEntry {
                        name: row.get(0)?,
                        backing_path: backing_from(row.get(1)?),
                    })
                })
                .map_err(|e| StoreError::Query(e.to_string()))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
    }

    async fn lookup_child(
        &self,
        datatype: &str,
        parent: Option<NodeId>,
        name: &str,
    ) -> Result<ChildRef, StoreError> {
        let (datatype, name) = (datatype.to_string(), name.to_string());
        self.with_conn(move |conn| {
            let child = conn
                .query_row(schema::LOOKUP_CHILD, params![datatype, parent, name], |row| {
                    Ok(ChildRef {
                        id: row.get(0)?,
                        backing_path: backing_from(row.get(1)?),
                    })
                })
                .optional()
                .map_err(|e| StoreError::Query(e.to_string()))?;
            child.ok_or(StoreError::NotFound(name))
        })
        .await
    }

    async fn list_datatypes(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(schema::LIST_DATATYPES)
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Query(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
    }

    async fn delete_by_origin(&self, origin: &Path) -> Result<u64, StoreError> {
        let source = path_text(origin);
        let deleted = self
            .with_conn(move |conn| {
                conn.execute(schema::DELETE_BY_ORIGIN, params![source])
                    .map_err(|e| StoreError::Delete(e.to_string()))
            })
            .await?;
        debug!("Deleted {} nodes from {:?}", deleted, origin);
        Ok(deleted as u64)
    }

    async fn list_origins(&self) -> Result<Vec<PathBuf>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(schema::LIST_ORIGINS)
                .map_err(|e| StoreError::Query(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Query(e.to_string()))?;
            rows.map(|r| r.map(PathBuf::from))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(schema::CLEAR, [])
                .map_err(|e| StoreError::Delete(e.to_string()))
        })
        .await?;
        debug!("Cleared tag store");
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(schema::STATS, [], |row| {
                let total: i64 = row.get(0)?;
                let directories: i64 = row.get(1)?;
                let datatypes: i64 = row.get(2)?;
                let origins: i64 = row.get(3)?;
                Ok(StoreStats {
                    total_nodes: total as u64,
                    directories: directories as u64,
                    references: (total - directories) as u64,
                    datatypes: datatypes as u64,
                    origins: origins as u64,
                })
            })
            .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
    }

    async fn apply(
        &self,
        datatype: &str,
        origin: &Path,
        mutations: &[Mutation],
    ) -> Result<ApplyStats, StoreError> {
        let datatype = datatype.to_string();
        let origin = origin.to_path_buf();
        let mutations = mutations.to_vec();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::Insert(e.to_string()))?;

            let mut resolved: HashMap<&[String], NodeId> = HashMap::new();
            let mut stats = ApplyStats::default();

            for mutation in &mutations {
                let path = mutation.path();
                let mut parent = None;
                for depth in 1..=path.len() {
                    let id = match resolved.get(&path[..depth]) {
                        Some(id) => *id,
                        None => {
                            let id = tag_in(&tx, &datatype, parent, &path[depth - 1])?;
                            resolved.insert(&path[..depth], id);
                            id
                        }
                    };
                    parent = Some(id);
                }

                match mutation {
                    Mutation::Tag { .. } => stats.tags += 1,
                    Mutation::Reference { target, .. } => {
                        reference_in(&tx, &datatype, parent, target, &origin)?;
                        stats.references += 1;
                    }
                }
            }

            tx.commit()
                .map_err(|e| StoreError::Insert(e.to_string()))?;
            Ok(stats)
        })
        .await
    }
}
