//! B-tree node layout (C1) and the raw-byte mutation primitives that C6
//! builds on.
//!
//! A node is the object header (32 bytes), this module's node header (24
//! bytes), a table of contents, a key region that grows upward from the end
//! of the toc, a value region that grows downward from the end of the node
//! (or from just above the trailing [`TreeInfo`] on a root node), and the
//! free space in between the two.
//!
//! The teacher's original `BTreeNodeHeader::parse` read five `nloc_t` pairs
//! while declaring a 24-byte header — only four pairs fit in 24 bytes. The
//! real on-disk header has exactly four: `table_space`, `free_space`,
//! `key_free_list`, `val_free_list`. The bug was silent for the teacher's
//! read-only lookups (the stray field was never consulted), but insertion
//! and removal need every offset to be right, so this module parses the
//! corrected four-pair layout.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::{ApfsError, Result};
use crate::object::ObjectHeader;

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

/// A `nloc_t`: a relative offset and a length, both in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nloc {
    pub off: u16,
    pub len: u16,
}

impl Nloc {
    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Nloc {
            off: cursor.read_u16::<LittleEndian>()?,
            len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.write_u16::<LittleEndian>(self.off).unwrap();
        out.write_u16::<LittleEndian>(self.len).unwrap();
    }
}

/// The node header proper: 24 bytes immediately after the object header.
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub btn_flags: u16,
    pub btn_level: u16,
    pub btn_nkeys: u32,
    pub table_space: Nloc,
    pub free_space: Nloc,
    pub key_free_list: Nloc,
    pub val_free_list: Nloc,
}

impl NodeHeader {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("node header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let btn_flags = cursor.read_u16::<LittleEndian>()?;
        let btn_level = cursor.read_u16::<LittleEndian>()?;
        let btn_nkeys = cursor.read_u32::<LittleEndian>()?;
        let table_space = Nloc::parse(&mut cursor)?;
        let free_space = Nloc::parse(&mut cursor)?;
        let key_free_list = Nloc::parse(&mut cursor)?;
        let val_free_list = Nloc::parse(&mut cursor)?;
        Ok(NodeHeader {
            btn_flags,
            btn_level,
            btn_nkeys,
            table_space,
            free_space,
            key_free_list,
            val_free_list,
        })
    }

    /// Serialize back to the header's 24-byte on-disk form.
    pub fn write(&self, block: &mut [u8]) {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.write_u16::<LittleEndian>(self.btn_flags).unwrap();
        out.write_u16::<LittleEndian>(self.btn_level).unwrap();
        out.write_u32::<LittleEndian>(self.btn_nkeys).unwrap();
        self.table_space.write(&mut out);
        self.free_space.write(&mut out);
        self.key_free_list.write(&mut out);
        self.val_free_list.write(&mut out);
        block[ObjectHeader::SIZE..ObjectHeader::SIZE + Self::SIZE].copy_from_slice(&out);
    }

    pub fn is_leaf(&self) -> bool {
        self.btn_flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.btn_flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.btn_flags & BTNODE_FIXED_KV_SIZE != 0
    }

    fn slot_size(&self) -> u16 {
        if self.is_fixed_kv() {
            4
        } else {
            8
        }
    }
}

/// `btree_info_t` — 40 bytes trailing a root node, after the value region.
#[derive(Debug, Clone, Copy)]
pub struct TreeInfoFixed {
    pub bt_flags: u32,
    pub bt_node_size: u32,
    pub bt_key_size: u32,
    pub bt_val_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct TreeInfo {
    pub fixed: TreeInfoFixed,
    pub bt_longest_key: u32,
    pub bt_longest_val: u32,
    pub bt_key_count: u64,
    pub bt_node_count: u64,
}

impl TreeInfo {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("btree info too short".into()));
        }
        let mut cursor = Cursor::new(data);
        let fixed = TreeInfoFixed {
            bt_flags: cursor.read_u32::<LittleEndian>()?,
            bt_node_size: cursor.read_u32::<LittleEndian>()?,
            bt_key_size: cursor.read_u32::<LittleEndian>()?,
            bt_val_size: cursor.read_u32::<LittleEndian>()?,
        };
        Ok(TreeInfo {
            fixed,
            bt_longest_key: cursor.read_u32::<LittleEndian>()?,
            bt_longest_val: cursor.read_u32::<LittleEndian>()?,
            bt_key_count: cursor.read_u64::<LittleEndian>()?,
            bt_node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.fixed.bt_flags).unwrap();
        buf.write_u32::<LittleEndian>(self.fixed.bt_node_size).unwrap();
        buf.write_u32::<LittleEndian>(self.fixed.bt_key_size).unwrap();
        buf.write_u32::<LittleEndian>(self.fixed.bt_val_size).unwrap();
        buf.write_u32::<LittleEndian>(self.bt_longest_key).unwrap();
        buf.write_u32::<LittleEndian>(self.bt_longest_val).unwrap();
        buf.write_u64::<LittleEndian>(self.bt_key_count).unwrap();
        buf.write_u64::<LittleEndian>(self.bt_node_count).unwrap();
        out.copy_from_slice(&buf);
    }
}

/// One table-of-contents slot, in its on-disk shape (`kvloc_t` or `kvoff_t`).
#[derive(Debug, Clone, Copy)]
pub enum TocEntry {
    Fixed { key_off: u16, val_off: u16 },
    Variable {
        key_off: u16,
        key_len: u16,
        val_off: u16,
        val_len: u16,
    },
}

impl TocEntry {
    pub fn key_off(&self) -> u16 {
        match self {
            TocEntry::Fixed { key_off, .. } => *key_off,
            TocEntry::Variable { key_off, .. } => *key_off,
        }
    }

    pub fn val_off(&self) -> u16 {
        match self {
            TocEntry::Fixed { val_off, .. } => *val_off,
            TocEntry::Variable { val_off, .. } => *val_off,
        }
    }

    pub fn key_len(&self) -> Option<u16> {
        match self {
            TocEntry::Fixed { .. } => None,
            TocEntry::Variable { key_len, .. } => Some(*key_len),
        }
    }

    pub fn val_len(&self) -> Option<u16> {
        match self {
            TocEntry::Fixed { .. } => None,
            TocEntry::Variable { val_len, .. } => Some(*val_len),
        }
    }
}

/// Sentinel `val_off` marking a ghost (key-only) record in a variable-kv node.
pub const GHOST_VAL_OFF: u16 = 0xFFFF;

/// Read-only view over a parsed node: the pieces `query.rs` needs to
/// evaluate C3 without re-deriving layout offsets on every call.
pub struct NodeView<'a> {
    pub header: ObjectHeader,
    pub node_header: NodeHeader,
    pub toc: Vec<TocEntry>,
    pub info: Option<TreeInfo>,
    pub block: &'a [u8],
    pub key_base: usize,
    pub val_area_end: usize,
}

impl<'a> NodeView<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        let node_header = NodeHeader::parse(&block[ObjectHeader::SIZE..])?;

        let toc_start = ObjectHeader::SIZE + NodeHeader::SIZE + node_header.table_space.off as usize;
        let key_base = toc_start + node_header.table_space.len as usize;

        let info = if node_header.is_root() {
            if block.len() < TreeInfo::SIZE {
                return Err(ApfsError::InvalidBTree("block too short for btree info".into()));
            }
            Some(TreeInfo::parse(&block[block.len() - TreeInfo::SIZE..])?)
        } else {
            None
        };

        let val_area_end = if node_header.is_root() {
            block.len() - TreeInfo::SIZE
        } else {
            block.len()
        };

        let mut toc = Vec::with_capacity(node_header.btn_nkeys as usize);
        let mut cursor = Cursor::new(&block[toc_start..]);
        for _ in 0..node_header.btn_nkeys {
            if node_header.is_fixed_kv() {
                toc.push(TocEntry::Fixed {
                    key_off: cursor.read_u16::<LittleEndian>()?,
                    val_off: cursor.read_u16::<LittleEndian>()?,
                });
            } else {
                toc.push(TocEntry::Variable {
                    key_off: cursor.read_u16::<LittleEndian>()?,
                    key_len: cursor.read_u16::<LittleEndian>()?,
                    val_off: cursor.read_u16::<LittleEndian>()?,
                    val_len: cursor.read_u16::<LittleEndian>()?,
                });
            }
        }

        Ok(NodeView {
            header,
            node_header,
            toc,
            info,
            block,
            key_base,
            val_area_end,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.node_header.is_leaf()
    }

    pub fn is_root(&self) -> bool {
        self.node_header.is_root()
    }

    pub fn nkeys(&self) -> usize {
        self.node_header.btn_nkeys as usize
    }

    fn fixed_sizes(&self, fallback_key: u32, fallback_val: u32) -> (u32, u32) {
        match &self.info {
            Some(info) => (
                if info.fixed.bt_key_size > 0 {
                    info.fixed.bt_key_size
                } else {
                    fallback_key
                },
                if info.fixed.bt_val_size > 0 {
                    info.fixed.bt_val_size
                } else {
                    fallback_val
                },
            ),
            None => (fallback_key, fallback_val),
        }
    }

    pub fn key_extent(&self, index: usize, fallback_key_size: u32) -> Result<&'a [u8]> {
        let (fks, _) = self.fixed_sizes(fallback_key_size, 0);
        let entry = &self.toc[index];
        let start = self.key_base + entry.key_off() as usize;
        let len = entry.key_len().unwrap_or(fks as u16) as usize;
        let end = start + len;
        if end > self.block.len() {
            return Err(ApfsError::InvalidBTree(format!(
                "key out of bounds: start={start}, len={len}, block_size={}",
                self.block.len()
            )));
        }
        Ok(&self.block[start..end])
    }

    /// Returns `None` for a ghost (key-only) record.
    pub fn val_extent(
        &self,
        index: usize,
        fallback_key_size: u32,
        fallback_val_size: u32,
    ) -> Result<Option<&'a [u8]>> {
        let (_, fvs) = self.fixed_sizes(fallback_key_size, fallback_val_size);
        let entry = &self.toc[index];
        let val_off = entry.val_off();

        if !self.is_leaf() {
            // internal node values are always an 8-byte oid, never ghosts
            if let Some(declared) = entry.val_len() {
                if declared != 8 {
                    return Err(ApfsError::corrupted(
                        self.header.oid,
                        format!("non-leaf record value is {declared} bytes, expected 8"),
                    ));
                }
            }
            let start = self.val_area_end - val_off as usize;
            let end = start + 8;
            if end > self.block.len() || start < self.key_base {
                return Err(ApfsError::InvalidBTree("child pointer out of bounds".into()));
            }
            return Ok(Some(&self.block[start..end]));
        }

        if !self.node_header.is_fixed_kv() && val_off == GHOST_VAL_OFF {
            return Ok(None);
        }

        let len = entry.val_len().unwrap_or(fvs as u16) as usize;
        let start = self.val_area_end - val_off as usize;
        let end = start + len;
        if end > self.block.len() || start < self.key_base {
            return Err(ApfsError::InvalidBTree(format!(
                "value out of bounds: start={start}, len={len}, val_area_end={}",
                self.val_area_end
            )));
        }
        Ok(Some(&self.block[start..end]))
    }

    pub fn child_oid(&self, index: usize) -> Result<u64> {
        let val = self
            .val_extent(index, 8, 8)?
            .ok_or_else(|| ApfsError::InvalidBTree("internal node record has no child".into()))?;
        if val.len() < 8 {
            return Err(ApfsError::InvalidBTree("child oid too short".into()));
        }
        Ok(u64::from_le_bytes(val[..8].try_into().unwrap()))
    }
}

/// Free space (in bytes) still available for key+value payload, the sum the
/// no-space check in `insert_record` is measured against.
pub fn free_bytes(node_header: &NodeHeader) -> usize {
    node_header.free_space.len as usize
}

/// Insert a record into a root-and-leaf node at sorted position `index`.
///
/// Mutation is restricted to root-and-leaf nodes, matching the original
/// driver's B-tree writer: anything deeper needs a node split, which this
/// engine does not implement (documented as out of scope).
///
/// `val` is `None` for a ghost (key-only) record. Grows the table of
/// contents by `8 * slot_size` entries whenever the existing toc has no
/// room for one more slot, exactly as the kernel's `apfs_btree_insert`
/// does. Updates the trailing `TreeInfo`'s `bt_key_count`, `bt_longest_key`
/// and `bt_longest_val` to match. Leaves the block's checksum stale; callers
/// recompute it via `BlockCache::flush_checksums` before the buffer is
/// considered clean.
pub fn insert_record(
    block: &mut [u8],
    index: usize,
    key: &[u8],
    val: Option<&[u8]>,
) -> Result<()> {
    let mut header = NodeHeader::parse(&block[ObjectHeader::SIZE..])?;
    if !header.is_root() || !header.is_leaf() {
        return Err(ApfsError::InvalidBTree(
            "insert_record only supports root-and-leaf nodes".into(),
        ));
    }
    let fixed_kv = header.is_fixed_kv();
    let val_len = val.map(|v| v.len()).unwrap_or(0);

    if key.len() + val_len > free_bytes(&header) {
        return Err(ApfsError::NoSpace {
            key_len: key.len(),
            val_len,
        });
    }

    let slot_size = header.slot_size() as usize;
    let toc_start = ObjectHeader::SIZE + NodeHeader::SIZE + header.table_space.off as usize;
    let nkeys = header.btn_nkeys as usize;
    let needed = (nkeys + 1) * slot_size;

    if needed > header.table_space.len as usize {
        let inc = 8 * slot_size as u16;
        if inc as usize > free_bytes(&header) {
            return Err(ApfsError::NoSpace {
                key_len: key.len(),
                val_len,
            });
        }
        let old_key_base = toc_start + header.table_space.len as usize;
        let key_region_len = header.free_space.off as usize;
        block.copy_within(
            old_key_base..old_key_base + key_region_len,
            old_key_base + inc as usize,
        );
        header.table_space.len += inc;
        header.free_space.len -= inc;

        // The toc's growth ate into the same free span the new record needs;
        // recheck now that free_space.len has shrunk.
        if key.len() + val_len > free_bytes(&header) {
            return Err(ApfsError::NoSpace {
                key_len: key.len(),
                val_len,
            });
        }
    }

    let key_base = toc_start + header.table_space.len as usize;

    // Shift toc entries [index, nkeys) down by one slot to open a hole.
    if index < nkeys {
        let src = toc_start + index * slot_size;
        let len = (nkeys - index) * slot_size;
        block.copy_within(src..src + len, src + slot_size);
    }

    let val_area_end = if header.is_root() {
        block.len() - TreeInfo::SIZE
    } else {
        block.len()
    };

    let key_write_off = header.free_space.off as usize;
    let key_start = key_base + key_write_off;
    block[key_start..key_start + key.len()].copy_from_slice(key);

    let val_off_field: u16 = match val {
        Some(bytes) => {
            let region_top = key_base + header.free_space.off as usize + header.free_space.len as usize;
            let val_start = region_top - bytes.len();
            block[val_start..val_start + bytes.len()].copy_from_slice(bytes);
            (val_area_end - val_start) as u16
        }
        None => GHOST_VAL_OFF,
    };

    header.free_space.off += key.len() as u16;
    header.free_space.len -= key.len() as u16;
    if val.is_some() {
        header.free_space.len -= val_len as u16;
    }
    header.btn_nkeys += 1;

    // header.is_root() is guaranteed by the check at the top of this function.
    let info_start = block.len() - TreeInfo::SIZE;
    let mut info = TreeInfo::parse(&block[info_start..])?;
    info.bt_key_count += 1;
    info.bt_longest_key = info.bt_longest_key.max(key.len() as u32);
    info.bt_longest_val = info.bt_longest_val.max(val_len as u32);
    info.write(&mut block[info_start..]);

    let entry_bytes: Vec<u8> = if fixed_kv {
        let mut out = Vec::with_capacity(4);
        out.write_u16::<LittleEndian>(key_write_off as u16).unwrap();
        out.write_u16::<LittleEndian>(val_off_field).unwrap();
        out
    } else {
        let mut out = Vec::with_capacity(8);
        out.write_u16::<LittleEndian>(key_write_off as u16).unwrap();
        out.write_u16::<LittleEndian>(key.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(val_off_field).unwrap();
        out.write_u16::<LittleEndian>(val.map(|v| v.len()).unwrap_or(0) as u16)
            .unwrap();
        out
    };
    let toc_entry_start = toc_start + index * slot_size;
    block[toc_entry_start..toc_entry_start + slot_size].copy_from_slice(&entry_bytes);

    header.write(block);
    Ok(())
}

/// Remove the record at sorted position `index` from a root-and-leaf node.
///
/// Matches the original driver's remove path: the toc shrinks by one slot
/// and `btn_nkeys`, `bt_key_count` decrement, and the removed record's key
/// and value lengths are folded into `key_free_list.len`/`val_free_list.len`
/// — but the vacated bytes themselves are not reclaimed into `free_space`.
/// Repeated removals without an intervening rebuild waste space; a real
/// container periodically repacks nodes (out of scope here, same as in the
/// teacher).
pub fn remove_record(block: &mut [u8], index: usize) -> Result<()> {
    let mut header = NodeHeader::parse(&block[ObjectHeader::SIZE..])?;
    if !header.is_root() || !header.is_leaf() {
        return Err(ApfsError::InvalidBTree(
            "remove_record only supports root-and-leaf nodes".into(),
        ));
    }
    let nkeys = header.btn_nkeys as usize;
    if index >= nkeys {
        return Err(ApfsError::InvalidBTree("remove index out of range".into()));
    }

    // Capture the removed record's key/val lengths before the toc shift
    // below drops its slot, mirroring apfs_btree_remove's free-list
    // bookkeeping (it runs before the toc is compacted too).
    let (removed_key_len, removed_val_len) = {
        let view = NodeView::parse(block)?;
        let entry = view.toc[index];
        let (fks, fvs) = view.fixed_sizes(0, 0);
        let key_len = entry.key_len().unwrap_or(fks as u16);
        let val_len = if entry.val_off() == GHOST_VAL_OFF && !view.node_header.is_fixed_kv() {
            0
        } else {
            entry.val_len().unwrap_or(fvs as u16)
        };
        (key_len, val_len)
    };

    let slot_size = header.slot_size() as usize;
    let toc_start = ObjectHeader::SIZE + NodeHeader::SIZE + header.table_space.off as usize;

    if index + 1 < nkeys {
        let src = toc_start + (index + 1) * slot_size;
        let len = (nkeys - index - 1) * slot_size;
        block.copy_within(src..src + len, src - slot_size);
    }

    header.btn_nkeys -= 1;
    header.key_free_list.len += removed_key_len;
    header.val_free_list.len += removed_val_len;
    header.write(block);

    // header.is_root() is guaranteed by the check at the top of this function.
    let info_start = block.len() - TreeInfo::SIZE;
    let mut info = TreeInfo::parse(&block[info_start..])?;
    info.bt_key_count = info.bt_key_count.saturating_sub(1);
    info.write(&mut block[info_start..]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fletcher;

    /// Build a minimal empty root-and-leaf variable-kv node, large enough
    /// for a handful of small records, with a correctly sized `TreeInfo`
    /// trailer and no keys yet.
    fn empty_leaf_root(block_size: usize, table_space_len: u16, free_space_len: u16) -> Vec<u8> {
        let mut block = vec![0u8; block_size];
        let node_header = NodeHeader {
            btn_flags: BTNODE_ROOT | BTNODE_LEAF,
            btn_level: 0,
            btn_nkeys: 0,
            table_space: Nloc {
                off: 0,
                len: table_space_len,
            },
            free_space: Nloc {
                off: 0,
                len: free_space_len,
            },
            key_free_list: Nloc { off: 0, len: 0 },
            val_free_list: Nloc { off: 0, len: 0 },
        };
        node_header.write(&mut block);

        let info = TreeInfo {
            fixed: TreeInfoFixed {
                bt_flags: 0,
                bt_node_size: block_size as u32,
                bt_key_size: 0,
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
    fn insert_single_record_round_trips() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"key-a", Some(b"value-a")).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert_eq!(view.nkeys(), 1);
        assert_eq!(view.key_extent(0, 0).unwrap(), b"key-a");
        assert_eq!(view.val_extent(0, 0, 0).unwrap().unwrap(), b"value-a");
    }

    #[test]
    fn insert_ghost_record_has_no_value() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"ghost-key", None).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert!(view.val_extent(0, 0, 0).unwrap().is_none());
    }

    #[test]
    fn insert_maintains_sorted_order_via_index() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"bbb", Some(b"2")).unwrap();
        insert_record(&mut block, 0, b"aaa", Some(b"1")).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert_eq!(view.key_extent(0, 0).unwrap(), b"aaa");
        assert_eq!(view.key_extent(1, 0).unwrap(), b"bbb");
    }

    #[test]
    fn toc_grows_when_out_of_slots() {
        // table_space only holds 1 variable-kv slot (8 bytes); the second
        // insert must trigger toc growth.
        let mut block = empty_leaf_root(1024, 8, 1024 - 56 - 8 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"k1", Some(b"v1")).unwrap();
        insert_record(&mut block, 1, b"k2", Some(b"v2")).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert_eq!(view.nkeys(), 2);
        assert!(view.node_header.table_space.len as usize >= 2 * 8);
        assert_eq!(view.key_extent(0, 0).unwrap(), b"k1");
        assert_eq!(view.key_extent(1, 0).unwrap(), b"k2");
    }

    #[test]
    fn remove_shifts_remaining_entries() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"aaa", Some(b"1")).unwrap();
        insert_record(&mut block, 1, b"bbb", Some(b"2")).unwrap();
        insert_record(&mut block, 2, b"ccc", Some(b"3")).unwrap();

        remove_record(&mut block, 1).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert_eq!(view.nkeys(), 2);
        assert_eq!(view.key_extent(0, 0).unwrap(), b"aaa");
        assert_eq!(view.key_extent(1, 0).unwrap(), b"ccc");
    }

    #[test]
    fn insert_fails_when_no_space_left() {
        let mut block = empty_leaf_root(128, 16, 8);
        let err = insert_record(&mut block, 0, b"too-long-a-key", Some(b"too-long-a-value"));
        assert!(matches!(err, Err(ApfsError::NoSpace { .. })));
    }

    #[test]
    fn insert_updates_tree_info_counters() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"aaa", Some(b"1")).unwrap();
        insert_record(&mut block, 1, b"bbbbb", Some(b"22")).unwrap();

        let view = NodeView::parse(&block).unwrap();
        let info = view.info.unwrap();
        assert_eq!(info.bt_key_count, 2);
        assert_eq!(info.bt_longest_key, 5);
        assert_eq!(info.bt_longest_val, 2);
    }

    #[test]
    fn remove_updates_tree_info_and_free_lists() {
        let mut block = empty_leaf_root(512, 64, 512 - 56 - 64 - TreeInfo::SIZE as u16);
        insert_record(&mut block, 0, b"aaa", Some(b"1")).unwrap();
        insert_record(&mut block, 1, b"bbb", Some(b"22")).unwrap();

        remove_record(&mut block, 0).unwrap();

        let view = NodeView::parse(&block).unwrap();
        assert_eq!(view.info.unwrap().bt_key_count, 1);
        assert_eq!(view.node_header.key_free_list.len, 3);
        assert_eq!(view.node_header.val_free_list.len, 1);
    }

    /// A non-leaf node whose toc declares a 7-byte value must surface
    /// `corrupted` rather than silently returning an 8-byte slice.
    #[test]
    fn val_extent_rejects_short_non_leaf_value() {
        let block_size = 512usize;
        let mut block = vec![0u8; block_size];
        let node_header = NodeHeader {
            btn_flags: 0, // non-root, non-leaf
            btn_level: 1,
            btn_nkeys: 1,
            table_space: Nloc { off: 0, len: 8 },
            free_space: Nloc { off: 0, len: 32 },
            key_free_list: Nloc { off: 0, len: 0 },
            val_free_list: Nloc { off: 0, len: 0 },
        };
        node_header.write(&mut block);

        let toc_start = ObjectHeader::SIZE + NodeHeader::SIZE;
        let key_base = toc_start + 8;
        // kvloc_t: key_off=0, key_len=8, val_off=7, val_len=7 (short by one byte)
        block[toc_start..toc_start + 2].copy_from_slice(&0u16.to_le_bytes());
        block[toc_start + 2..toc_start + 4].copy_from_slice(&8u16.to_le_bytes());
        block[toc_start + 4..toc_start + 6].copy_from_slice(&7u16.to_le_bytes());
        block[toc_start + 6..toc_start + 8].copy_from_slice(&7u16.to_le_bytes());
        block[key_base..key_base + 8].copy_from_slice(&1234u64.to_le_bytes());
        fletcher::set_checksum(&mut block);

        let view = NodeView::parse(&block).unwrap();
        let err = view.val_extent(0, 8, 8);
        assert!(matches!(err, Err(ApfsError::CorruptedBTree { .. })));
    }
}
