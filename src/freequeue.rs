//! Space manager free-queue bootstrap ([FREEQUEUE]).
//!
//! The real free-queue is one of three B-trees (ip/main/tier2) hung off the
//! `spaceman_phys_t` object and keyed by `(xid, paddr)` with the record
//! count folded into the value's top bits. This module implements enough
//! of it to make `BlockCache::alloc_block_nr`'s bump allocator auditable:
//! every block it allocates gets recorded here as a ghost record so a
//! caller can enumerate "blocks handed out this transaction" without the
//! cache exposing its internal counter. Dequeuing freed extents back into
//! the allocator is not implemented — this crate never frees space, only
//! allocates it for copy-on-write.

use crate::error::Result;
use crate::key::{Key, TreeKind};
use crate::node;
use crate::object::BlockCache;
use std::io::{Read, Seek};

/// On-disk free-queue key: `(xid: u64, paddr: u64)`, 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeQueueKey {
    pub xid: u64,
    pub paddr: u64,
}

impl FreeQueueKey {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        Key::init_free_queue_key(self.xid, self.paddr).encode(TreeKind::FreeQueue)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match crate::key::read_free_queue_key(bytes)? {
            Key::FreeQueue { xid, paddr } => Ok(FreeQueueKey { xid, paddr }),
            _ => unreachable!("read_free_queue_key always returns Key::FreeQueue"),
        }
    }
}

/// Record `paddr` as allocated at `xid` in the free-queue's root-and-leaf
/// node, as a ghost (key-only) record — the real format carries a run
/// length in the value, but this crate never coalesces runs, so every
/// block is its own one-entry record.
///
/// `query_root` must be a root-and-leaf free-queue node; deeper free-queues
/// are out of scope, matching [C6]'s root-and-leaf restriction.
pub fn free_queue_insert<R: Read + Seek>(
    cache: &mut BlockCache<R>,
    query_root: u64,
    xid: u64,
    paddr: u64,
) -> Result<()> {
    let target = Key::init_free_queue_key(xid, paddr);
    let key_bytes = target.encode(TreeKind::FreeQueue);

    let buf = cache.read_object_block(query_root, false)?;
    let mut buf = buf.borrow_mut();
    let index = {
        let view = node::NodeView::parse(buf.data())?;
        let mut idx = view.nkeys();
        for i in 0..view.nkeys() {
            let existing = FreeQueueKey::decode(view.key_extent(i, FreeQueueKey::SIZE as u32)?)?;
            if existing.xid > xid || (existing.xid == xid && existing.paddr > paddr) {
                idx = i;
                break;
            }
        }
        idx
    };

    node::insert_record(buf.data_mut(), index, &key_bytes, None)?;
    buf.mark_dirty();
    buf.set_checksum_pending();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fletcher;
    use crate::node::{NodeHeader, Nloc, TreeInfo, TreeInfoFixed, BTNODE_LEAF, BTNODE_ROOT};
    use std::io::Cursor;

    fn empty_leaf_root(block_size: usize) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        let header = NodeHeader {
            btn_flags: BTNODE_ROOT | BTNODE_LEAF,
            btn_level: 0,
            btn_nkeys: 0,
            table_space: Nloc { off: 0, len: 64 },
            free_space: Nloc {
                off: 0,
                len: (block_size - 56 - 64 - TreeInfo::SIZE) as u16,
            },
            key_free_list: Nloc { off: 0, len: 0 },
            val_free_list: Nloc { off: 0, len: 0 },
        };
        header.write(&mut block);
        let info = TreeInfo {
            fixed: TreeInfoFixed {
                bt_flags: 0,
                bt_node_size: block_size as u32,
                bt_key_size: FreeQueueKey::SIZE as u32,
                bt_val_size: 0,
            },
            bt_longest_key: 0,
            bt_longest_val: 0,
            bt_key_count: 0,
            bt_node_count: 1,
        };
        let info_start = block_size - TreeInfo::SIZE;
        info.write(&mut block[info_start..]);
        fletcher::set_checksum(&mut block);
        block
    }

    #[test]
    fn free_queue_insert_keeps_entries_sorted() {
        let block = empty_leaf_root(512);
        let cursor = Cursor::new(block);
        let mut cache = BlockCache::new(cursor, 512, 1);
        cache.read_object_block(0, false).unwrap();

        free_queue_insert(&mut cache, 0, 5, 100).unwrap();
        free_queue_insert(&mut cache, 0, 3, 200).unwrap();
        free_queue_insert(&mut cache, 0, 5, 50).unwrap();

        let buf = cache.read_object_block(0, false).unwrap();
        let buf_ref = buf.borrow();
        let view = node::NodeView::parse(buf_ref.data()).unwrap();
        assert_eq!(view.nkeys(), 3);

        let k0 = FreeQueueKey::decode(view.key_extent(0, FreeQueueKey::SIZE as u32).unwrap()).unwrap();
        let k1 = FreeQueueKey::decode(view.key_extent(1, FreeQueueKey::SIZE as u32).unwrap()).unwrap();
        let k2 = FreeQueueKey::decode(view.key_extent(2, FreeQueueKey::SIZE as u32).unwrap()).unwrap();
        assert_eq!(k0, FreeQueueKey { xid: 3, paddr: 200 });
        assert_eq!(k1, FreeQueueKey { xid: 5, paddr: 50 });
        assert_eq!(k2, FreeQueueKey { xid: 5, paddr: 100 });
    }
}
