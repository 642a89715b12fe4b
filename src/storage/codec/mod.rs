use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::storage::index::IndexKey;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage, BPlusTreePageType, RecordId,
};

/// Decoded value plus the number of bytes consumed.
pub type DecodedData<T> = (T, usize);

pub const LEAF_PAGE_HEADER_SIZE: usize = 28;
pub const INTERNAL_PAGE_HEADER_SIZE: usize = 24;

const LEAF_PAGE_TYPE_TAG: u32 = 1;
const INTERNAL_PAGE_TYPE_TAG: u32 = 2;

const LSN_OFFSET: usize = 4;
const CURRENT_SIZE_OFFSET: usize = 8;
const MAX_SIZE_OFFSET: usize = 12;
const PARENT_PAGE_ID_OFFSET: usize = 16;
const PAGE_ID_OFFSET: usize = 20;
const NEXT_PAGE_ID_OFFSET: usize = 24;

/// Little-endian scalar helpers with explicit bounds checks; every page
/// decoder goes through these.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u32(data: u32, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&data.to_le_bytes());
    }

    pub fn decode_u32(bytes: &[u8]) -> VellumResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_le_bytes(data), 4))
    }
}

/// Header fields needed for latch-crabbing safety checks, decoded without
/// touching the entry array.
#[derive(Debug, Clone, Copy)]
pub struct PageProbe {
    pub page_type: BPlusTreePageType,
    pub current_size: u32,
    pub max_size: u32,
}

impl PageProbe {
    pub fn min_size(&self) -> u32 {
        self.max_size.div_ceil(2)
    }
}

fn decode_page_type(bytes: &[u8]) -> VellumResult<BPlusTreePageType> {
    let (tag, _) = CommonCodec::decode_u32(bytes)?;
    match tag {
        LEAF_PAGE_TYPE_TAG => Ok(BPlusTreePageType::LeafPage),
        INTERNAL_PAGE_TYPE_TAG => Ok(BPlusTreePageType::InternalPage),
        other => Err(VellumError::InvalidPage(format!(
            "unknown b+tree page type tag {}",
            other
        ))),
    }
}

fn encode_page_type(page_type: BPlusTreePageType) -> u32 {
    match page_type {
        BPlusTreePageType::LeafPage => LEAF_PAGE_TYPE_TAG,
        BPlusTreePageType::InternalPage => INTERNAL_PAGE_TYPE_TAG,
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn decode<K: IndexKey>(bytes: &[u8]) -> VellumResult<BPlusTreePage<K>> {
        match decode_page_type(bytes)? {
            BPlusTreePageType::LeafPage => {
                Ok(BPlusTreePage::Leaf(BPlusTreeLeafPageCodec::decode(bytes)?))
            }
            BPlusTreePageType::InternalPage => Ok(BPlusTreePage::Internal(
                BPlusTreeInternalPageCodec::decode(bytes)?,
            )),
        }
    }

    pub fn encode<K: IndexKey>(page: &BPlusTreePage<K>) -> VellumResult<Vec<u8>> {
        match page {
            BPlusTreePage::Leaf(leaf) => BPlusTreeLeafPageCodec::encode(leaf),
            BPlusTreePage::Internal(internal) => BPlusTreeInternalPageCodec::encode(internal),
        }
    }

    /// Type and occupancy only; used by descent safety checks so ancestors
    /// can be released without decoding whole pages.
    pub fn probe(bytes: &[u8]) -> VellumResult<PageProbe> {
        let page_type = decode_page_type(bytes)?;
        let (current_size, _) = CommonCodec::decode_u32(&bytes[CURRENT_SIZE_OFFSET..])?;
        let (max_size, _) = CommonCodec::decode_u32(&bytes[MAX_SIZE_OFFSET..])?;
        Ok(PageProbe {
            page_type,
            current_size,
            max_size,
        })
    }

    /// Patch the parent pointer in place (used when splits and merges
    /// re-parent children). The page must already carry a valid tag.
    pub fn write_parent_page_id(bytes: &mut [u8], parent_page_id: PageId) -> VellumResult<()> {
        decode_page_type(bytes)?;
        CommonCodec::encode_u32(parent_page_id, &mut bytes[PARENT_PAGE_ID_OFFSET..]);
        Ok(())
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeLeafPage<K>) -> VellumResult<Vec<u8>> {
        let stride = K::WIDTH + 8;
        let end = LEAF_PAGE_HEADER_SIZE + page.array.len() * stride;
        if end > PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "leaf page {} overflows the page: {} entries of stride {}",
                page.header.page_id,
                page.array.len(),
                stride
            )));
        }
        debug_assert_eq!(page.header.current_size as usize, page.array.len());

        let mut bytes = vec![0u8; PAGE_SIZE];
        let header = &page.header;
        CommonCodec::encode_u32(encode_page_type(header.page_type), &mut bytes);
        CommonCodec::encode_u32(header.lsn, &mut bytes[LSN_OFFSET..]);
        CommonCodec::encode_u32(header.current_size, &mut bytes[CURRENT_SIZE_OFFSET..]);
        CommonCodec::encode_u32(header.max_size, &mut bytes[MAX_SIZE_OFFSET..]);
        CommonCodec::encode_u32(header.parent_page_id, &mut bytes[PARENT_PAGE_ID_OFFSET..]);
        CommonCodec::encode_u32(header.page_id, &mut bytes[PAGE_ID_OFFSET..]);
        CommonCodec::encode_u32(header.next_page_id, &mut bytes[NEXT_PAGE_ID_OFFSET..]);

        let mut offset = LEAF_PAGE_HEADER_SIZE;
        for (key, rid) in &page.array {
            key.encode_into(&mut bytes[offset..offset + K::WIDTH]);
            CommonCodec::encode_u32(rid.page_id, &mut bytes[offset + K::WIDTH..]);
            CommonCodec::encode_u32(rid.slot_num, &mut bytes[offset + K::WIDTH + 4..]);
            offset += stride;
        }
        Ok(bytes)
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> VellumResult<BPlusTreeLeafPage<K>> {
        if decode_page_type(bytes)? != BPlusTreePageType::LeafPage {
            return Err(VellumError::InvalidPage(
                "expected a leaf page".to_string(),
            ));
        }
        let (lsn, _) = CommonCodec::decode_u32(&bytes[LSN_OFFSET..])?;
        let (current_size, _) = CommonCodec::decode_u32(&bytes[CURRENT_SIZE_OFFSET..])?;
        let (max_size, _) = CommonCodec::decode_u32(&bytes[MAX_SIZE_OFFSET..])?;
        let (parent_page_id, _) = CommonCodec::decode_u32(&bytes[PARENT_PAGE_ID_OFFSET..])?;
        let (page_id, _) = CommonCodec::decode_u32(&bytes[PAGE_ID_OFFSET..])?;
        let (next_page_id, _) = CommonCodec::decode_u32(&bytes[NEXT_PAGE_ID_OFFSET..])?;

        let stride = K::WIDTH + 8;
        let end = LEAF_PAGE_HEADER_SIZE + current_size as usize * stride;
        if end > bytes.len() {
            return Err(VellumError::InvalidPage(format!(
                "leaf page {} claims {} entries beyond the page end",
                page_id, current_size
            )));
        }

        let mut array = Vec::with_capacity(current_size as usize);
        let mut offset = LEAF_PAGE_HEADER_SIZE;
        for _ in 0..current_size {
            let key = K::decode_from(&bytes[offset..offset + K::WIDTH]);
            let (rid_page_id, _) = CommonCodec::decode_u32(&bytes[offset + K::WIDTH..])?;
            let (rid_slot, _) = CommonCodec::decode_u32(&bytes[offset + K::WIDTH + 4..])?;
            array.push((key, RecordId::new(rid_page_id, rid_slot)));
            offset += stride;
        }

        Ok(BPlusTreeLeafPage {
            header: BPlusTreeLeafPageHeader {
                page_type: BPlusTreePageType::LeafPage,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
                next_page_id,
            },
            array,
        })
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeInternalPage<K>) -> VellumResult<Vec<u8>> {
        let stride = K::WIDTH + 4;
        let end = INTERNAL_PAGE_HEADER_SIZE + page.array.len() * stride;
        if end > PAGE_SIZE {
            return Err(VellumError::Internal(format!(
                "internal page {} overflows the page: {} entries of stride {}",
                page.header.page_id,
                page.array.len(),
                stride
            )));
        }
        debug_assert_eq!(page.header.current_size as usize, page.array.len());

        let mut bytes = vec![0u8; PAGE_SIZE];
        let header = &page.header;
        CommonCodec::encode_u32(encode_page_type(header.page_type), &mut bytes);
        CommonCodec::encode_u32(header.lsn, &mut bytes[LSN_OFFSET..]);
        CommonCodec::encode_u32(header.current_size, &mut bytes[CURRENT_SIZE_OFFSET..]);
        CommonCodec::encode_u32(header.max_size, &mut bytes[MAX_SIZE_OFFSET..]);
        CommonCodec::encode_u32(header.parent_page_id, &mut bytes[PARENT_PAGE_ID_OFFSET..]);
        CommonCodec::encode_u32(header.page_id, &mut bytes[PAGE_ID_OFFSET..]);

        let mut offset = INTERNAL_PAGE_HEADER_SIZE;
        for (key, child) in &page.array {
            key.encode_into(&mut bytes[offset..offset + K::WIDTH]);
            CommonCodec::encode_u32(*child, &mut bytes[offset + K::WIDTH..]);
            offset += stride;
        }
        Ok(bytes)
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> VellumResult<BPlusTreeInternalPage<K>> {
        if decode_page_type(bytes)? != BPlusTreePageType::InternalPage {
            return Err(VellumError::InvalidPage(
                "expected an internal page".to_string(),
            ));
        }
        let (lsn, _) = CommonCodec::decode_u32(&bytes[LSN_OFFSET..])?;
        let (current_size, _) = CommonCodec::decode_u32(&bytes[CURRENT_SIZE_OFFSET..])?;
        let (max_size, _) = CommonCodec::decode_u32(&bytes[MAX_SIZE_OFFSET..])?;
        let (parent_page_id, _) = CommonCodec::decode_u32(&bytes[PARENT_PAGE_ID_OFFSET..])?;
        let (page_id, _) = CommonCodec::decode_u32(&bytes[PAGE_ID_OFFSET..])?;

        let stride = K::WIDTH + 4;
        let end = INTERNAL_PAGE_HEADER_SIZE + current_size as usize * stride;
        if end > bytes.len() {
            return Err(VellumError::InvalidPage(format!(
                "internal page {} claims {} entries beyond the page end",
                page_id, current_size
            )));
        }

        let mut array = Vec::with_capacity(current_size as usize);
        let mut offset = INTERNAL_PAGE_HEADER_SIZE;
        for _ in 0..current_size {
            let key = K::decode_from(&bytes[offset..offset + K::WIDTH]);
            let (child, _) = CommonCodec::decode_u32(&bytes[offset + K::WIDTH..])?;
            array.push((key, child));
            offset += stride;
        }

        Ok(BPlusTreeInternalPage {
            header: BPlusTreeInternalPageHeader {
                page_type: BPlusTreePageType::InternalPage,
                lsn,
                current_size,
                max_size,
                parent_page_id,
                page_id,
            },
            array,
        })
    }
}
