mod btree_index;
mod btree_iterator;
mod key;

pub use btree_index::BPlusTree;
pub use btree_iterator::TreeIndexIterator;
pub use key::{FixedKey, IndexKey};
