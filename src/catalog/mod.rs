use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId};
use crate::error::{VellumError, VellumResult};

pub type TableOid = u32;
pub type IndexOid = u32;

/// Table registration: the name, its process-local oid, and the first page
/// of its heap.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub oid: TableOid,
    pub name: String,
    pub first_page_id: PageId,
}

/// Index registration. The key layout is summarized by its fixed width and
/// the indexed columns; the tree itself is opened by the storage layer from
/// the index name.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub oid: IndexOid,
    pub name: String,
    pub table_name: String,
    pub key_columns: Vec<String>,
    pub key_width: usize,
}

#[derive(Debug, Default)]
struct CatalogInner {
    tables: HashMap<TableOid, TableInfo>,
    table_names: HashMap<String, TableOid>,
    indexes: HashMap<IndexOid, IndexInfo>,
    // (table name, index name) -> oid
    index_names: HashMap<(String, String), IndexOid>,
    next_table_oid: TableOid,
    next_index_oid: IndexOid,
}

/// Thin name → metadata registry for tables and indexes. Oids are
/// process-local and monotonic; nothing here persists beyond the index
/// roots, which live on the header page.
#[derive(Debug)]
pub struct Catalog {
    buffer_pool: Arc<BufferPoolManager>,
    inner: Mutex<CatalogInner>,
}

impl Catalog {
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            inner: Mutex::new(CatalogInner::default()),
        }
    }

    /// Register a table, allocating its first heap page.
    pub fn create_table(&self, table_name: impl Into<String>) -> VellumResult<TableInfo> {
        let table_name = table_name.into();
        let mut inner = self.inner.lock();
        if inner.table_names.contains_key(&table_name) {
            return Err(VellumError::Internal(format!(
                "table {:?} already exists",
                table_name
            )));
        }
        let first_page = self.buffer_pool.new_page()?.ok_or_else(|| {
            VellumError::OutOfMemory("no free frame for a new table page".to_string())
        })?;
        let first_page_id = first_page.page_id();
        drop(first_page);

        let oid = inner.next_table_oid;
        inner.next_table_oid += 1;
        let info = TableInfo {
            oid,
            name: table_name.clone(),
            first_page_id,
        };
        inner.tables.insert(oid, info.clone());
        inner.table_names.insert(table_name, oid);
        debug!("create table {:?} (oid {})", info.name, oid);
        Ok(info)
    }

    pub fn get_table_by_name(&self, table_name: &str) -> Option<TableInfo> {
        let inner = self.inner.lock();
        inner
            .table_names
            .get(table_name)
            .and_then(|oid| inner.tables.get(oid))
            .cloned()
    }

    pub fn get_table_by_oid(&self, oid: TableOid) -> Option<TableInfo> {
        self.inner.lock().tables.get(&oid).cloned()
    }

    /// Register an index over `key_columns` of an existing table.
    pub fn create_index(
        &self,
        index_name: impl Into<String>,
        table_name: &str,
        key_columns: Vec<String>,
        key_width: usize,
    ) -> VellumResult<IndexInfo> {
        let index_name = index_name.into();
        let mut inner = self.inner.lock();
        if !inner.table_names.contains_key(table_name) {
            return Err(VellumError::Internal(format!(
                "table {:?} does not exist",
                table_name
            )));
        }
        let key = (table_name.to_string(), index_name.clone());
        if inner.index_names.contains_key(&key) {
            return Err(VellumError::Internal(format!(
                "index {:?} already exists on table {:?}",
                index_name, table_name
            )));
        }
        let oid = inner.next_index_oid;
        inner.next_index_oid += 1;
        let info = IndexInfo {
            oid,
            name: index_name,
            table_name: table_name.to_string(),
            key_columns,
            key_width,
        };
        inner.indexes.insert(oid, info.clone());
        inner.index_names.insert(key, oid);
        debug!("create index {:?} (oid {})", info.name, oid);
        Ok(info)
    }

    pub fn get_index(&self, table_name: &str, index_name: &str) -> Option<IndexInfo> {
        let inner = self.inner.lock();
        inner
            .index_names
            .get(&(table_name.to_string(), index_name.to_string()))
            .and_then(|oid| inner.indexes.get(oid))
            .cloned()
    }

    pub fn get_index_by_oid(&self, oid: IndexOid) -> Option<IndexInfo> {
        self.inner.lock().indexes.get(&oid).cloned()
    }

    pub fn table_indexes(&self, table_name: &str) -> Vec<IndexInfo> {
        let inner = self.inner.lock();
        inner
            .indexes
            .values()
            .filter(|info| info.table_name == table_name)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Catalog) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let pool = Arc::new(BufferPoolManager::new(8, disk_manager));
        (temp_dir, Catalog::new(pool))
    }

    #[test]
    fn create_and_look_up_table() {
        let (_dir, catalog) = setup();
        let info = catalog.create_table("accounts").unwrap();
        assert_eq!(catalog.get_table_by_name("accounts").unwrap().oid, info.oid);
        assert_eq!(
            catalog.get_table_by_oid(info.oid).unwrap().name,
            "accounts"
        );
        assert!(catalog.get_table_by_name("missing").is_none());
        assert!(catalog.create_table("accounts").is_err());
    }

    #[test]
    fn oids_are_monotonic() {
        let (_dir, catalog) = setup();
        let a = catalog.create_table("a").unwrap();
        let b = catalog.create_table("b").unwrap();
        assert!(b.oid > a.oid);
    }

    #[test]
    fn create_and_look_up_index() {
        let (_dir, catalog) = setup();
        catalog.create_table("accounts").unwrap();
        let info = catalog
            .create_index("accounts_pk", "accounts", vec!["id".to_string()], 8)
            .unwrap();
        assert_eq!(
            catalog.get_index("accounts", "accounts_pk").unwrap().oid,
            info.oid
        );
        assert_eq!(catalog.table_indexes("accounts").len(), 1);
        assert!(catalog.get_index("accounts", "missing").is_none());

        assert!(catalog
            .create_index("accounts_pk", "accounts", vec![], 8)
            .is_err());
        assert!(catalog
            .create_index("idx", "missing_table", vec![], 8)
            .is_err());
    }
}
