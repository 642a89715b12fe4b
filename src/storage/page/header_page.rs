use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, HEADER_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::CommonCodec;

pub const HEADER_NAME_MAX_LEN: usize = 32;

// name_len (4) | name slot (32) | root_page_id (4)
const RECORD_SIZE: usize = 4 + HEADER_NAME_MAX_LEN + 4;
const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/**
 * The header page (page id 0) persists one record per index:
 *  -------------------------------------------------------------
 * | RecordCount (4) | Record(1) | Record(2) | ...               |
 *  -------------------------------------------------------------
 * Record: | NameLen (4) | Name (32, zero padded) | RootPageId (4) |
 *
 * A freshly created database file reads back as all zeroes, which decodes
 * as an empty record list.
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPage {
    pub records: Vec<(String, PageId)>,
}

impl HeaderPage {
    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, root)| *root)
    }

    /// Insert a new record; false if the name exists, is too long, or the
    /// page is full.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() > HEADER_NAME_MAX_LEN
            || self.records.len() >= MAX_RECORDS
            || self.get_record(name).is_some()
        {
            return false;
        }
        self.records.push((name.to_string(), root_page_id));
        true
    }

    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.records.iter_mut().find(|(n, _)| n == name) {
            Some((_, root)) => {
                *root = root_page_id;
                true
            }
            None => false,
        }
    }

    pub fn delete_record(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|(n, _)| n != name);
        self.records.len() != before
    }

    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.records.len() <= MAX_RECORDS);
        let mut bytes = vec![0u8; PAGE_SIZE];
        CommonCodec::encode_u32(self.records.len() as u32, &mut bytes[RECORD_COUNT_OFFSET..]);
        let mut offset = RECORDS_OFFSET;
        for (name, root) in &self.records {
            CommonCodec::encode_u32(name.len() as u32, &mut bytes[offset..]);
            bytes[offset + 4..offset + 4 + name.len()].copy_from_slice(name.as_bytes());
            CommonCodec::encode_u32(*root, &mut bytes[offset + 4 + HEADER_NAME_MAX_LEN..]);
            offset += RECORD_SIZE;
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<Self> {
        let (count, _) = CommonCodec::decode_u32(&bytes[RECORD_COUNT_OFFSET..])?;
        if count as usize > MAX_RECORDS {
            return Err(VellumError::InvalidPage(format!(
                "header page claims {} records, capacity is {}",
                count, MAX_RECORDS
            )));
        }
        let mut records = Vec::with_capacity(count as usize);
        let mut offset = RECORDS_OFFSET;
        for _ in 0..count {
            let (name_len, _) = CommonCodec::decode_u32(&bytes[offset..])?;
            if name_len as usize > HEADER_NAME_MAX_LEN {
                return Err(VellumError::InvalidPage(format!(
                    "header record name length {} exceeds {}",
                    name_len, HEADER_NAME_MAX_LEN
                )));
            }
            let name_bytes = &bytes[offset + 4..offset + 4 + name_len as usize];
            let name = String::from_utf8(name_bytes.to_vec())
                .map_err(|e| VellumError::InvalidPage(format!("header record name: {}", e)))?;
            let (root, _) =
                CommonCodec::decode_u32(&bytes[offset + 4 + HEADER_NAME_MAX_LEN..])?;
            records.push((name, root));
            offset += RECORD_SIZE;
        }
        Ok(Self { records })
    }
}

/// Where an index persists its name → root-page-id mapping. The tree only
/// sees this trait, so the header-page-zero convention stays in one place.
pub trait CatalogPersistence: Send + Sync {
    /// Insert or update the record for `name`.
    fn save_root(&self, name: &str, root_page_id: PageId) -> VellumResult<()>;
    fn load_root(&self, name: &str) -> VellumResult<Option<PageId>>;
}

/// `CatalogPersistence` backed by the conventional header page.
#[derive(Debug)]
pub struct HeaderPageStore {
    buffer_pool: Arc<BufferPoolManager>,
}

impl HeaderPageStore {
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self { buffer_pool }
    }
}

impl CatalogPersistence for HeaderPageStore {
    fn save_root(&self, name: &str, root_page_id: PageId) -> VellumResult<()> {
        let mut guard = self
            .buffer_pool
            .fetch_page_write(HEADER_PAGE_ID)?
            .ok_or_else(|| {
                VellumError::Storage("no free frame for the header page".to_string())
            })?;
        let mut header = HeaderPage::decode(guard.data())?;
        if !header.update_record(name, root_page_id) && !header.insert_record(name, root_page_id)
        {
            return Err(VellumError::Storage(format!(
                "header page cannot record index {:?}",
                name
            )));
        }
        guard.overwrite(&header.encode());
        Ok(())
    }

    fn load_root(&self, name: &str) -> VellumResult<Option<PageId>> {
        let guard = self
            .buffer_pool
            .fetch_page_read(HEADER_PAGE_ID)?
            .ok_or_else(|| {
                VellumError::Storage("no free frame for the header page".to_string())
            })?;
        let header = HeaderPage::decode(guard.data())?;
        Ok(header.get_record(name))
    }
}
