use byteorder::{LittleEndian, ReadBytesExt};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::rc::Rc;

use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x05;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0C;
pub const OBJECT_TYPE_FS: u32 = 0x0D;

// Object flag masks (upper 16 bits of type_and_flags)
pub const OBJ_PHYSICAL: u32 = 0x00000000;
pub const OBJ_VIRTUAL: u32 = 0x80000000;
pub const OBJ_EPHEMERAL: u32 = 0x40000000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC0000000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000FFFF;

/// 32-byte header present on every APFS on-disk object. All fields are little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,       // 0x00
    pub oid: u64,            // 0x08
    pub xid: u64,            // 0x10
    pub type_and_flags: u32, // 0x18
    pub subtype: u32,        // 0x1C
}

impl ObjectHeader {
    /// Size of the on-disk header in bytes
    pub const SIZE: usize = 32;

    /// Parse an object header from the first 32 bytes of a block
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::CorruptedData(
                format!("object header too short: {} bytes", data.len()),
            ));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Get the object type (lower 16 bits, no flags)
    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    /// Get the storage type flags (upper 2 bits)
    pub fn storage_type(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }

    /// Whether this is a physical object (address = block number)
    pub fn is_physical(&self) -> bool {
        self.storage_type() == OBJ_PHYSICAL
    }
}

/// Read a full block at the given block number, verify its checksum, and parse the header.
pub fn read_object<R: Read + Seek>(
    reader: &mut R,
    block_number: u64,
    block_size: u32,
) -> Result<(ObjectHeader, Vec<u8>)> {
    let offset = block_number * block_size as u64;
    reader.seek(SeekFrom::Start(offset))?;

    let mut block = vec![0u8; block_size as usize];
    reader.read_exact(&mut block)?;

    if !fletcher::verify_object(&block) {
        return Err(ApfsError::InvalidChecksum);
    }

    let header = ObjectHeader::parse(&block)?;
    Ok((header, block))
}

/// Read a block at the given block number without checksum verification.
pub fn read_block<R: Read + Seek>(
    reader: &mut R,
    block_number: u64,
    block_size: u32,
) -> Result<Vec<u8>> {
    let offset = block_number * block_size as u64;
    reader.seek(SeekFrom::Start(offset))?;

    let mut block = vec![0u8; block_size as usize];
    reader.read_exact(&mut block)?;
    Ok(block)
}

/// An in-memory, refcounted view of one on-disk block.
///
/// Mirrors the block layer's buffer_head: callers read fields through
/// `data()`, mutate through `data_mut()`, then mark the result dirty and
/// checksum-pending so the writeback path knows to recompute and flush it.
#[derive(Debug)]
pub struct Buffer {
    block_nr: u64,
    data: Vec<u8>,
    dirty: bool,
    checksum_pending: bool,
}

impl Buffer {
    fn new(block_nr: u64, data: Vec<u8>) -> Self {
        Buffer {
            block_nr,
            data,
            dirty: false,
            checksum_pending: false,
        }
    }

    pub fn block_nr(&self) -> u64 {
        self.block_nr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag that this buffer's stored Fletcher-64 checksum no longer matches
    /// its contents. Cleared by `BlockCache::flush_checksums`, which is the
    /// only place allowed to call `fletcher::set_checksum` on a live buffer.
    pub fn set_checksum_pending(&mut self) {
        self.checksum_pending = true;
    }

    pub fn checksum_pending(&self) -> bool {
        self.checksum_pending
    }
}

/// Shared handle to a cached block. Cloned freely by queries and by the
/// cache itself; mutation goes through `RefCell::borrow_mut`.
pub type BufferRef = Rc<RefCell<Buffer>>;

/// The block layer the B-tree engine is consumed against.
///
/// Caches every block it has handed out so repeated lookups of the same
/// node return the same `BufferRef` (and therefore see each other's
/// uncommitted writes), and stands in for the space manager with a simple
/// bump allocator when a caller requests copy-on-write.
pub struct BlockCache<R> {
    reader: R,
    block_size: u32,
    buffers: HashMap<u64, BufferRef>,
    next_free_block: u64,
}

impl<R: Read + Seek> BlockCache<R> {
    pub fn new(reader: R, block_size: u32, next_free_block: u64) -> Self {
        BlockCache {
            reader,
            block_size,
            buffers: HashMap::new(),
            next_free_block,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Fetch (and cache) the raw, unverified bytes of `block_nr` from the
    /// underlying reader. Used both for cache misses and as the copy source
    /// for copy-on-write.
    fn fetch(&mut self, block_nr: u64) -> Result<Vec<u8>> {
        read_block(&mut self.reader, block_nr, self.block_size)
    }

    /// Read the object at `block_nr` through the cache.
    ///
    /// `want_write == false` returns the cached (or freshly read) buffer for
    /// `block_nr` itself. `want_write == true` performs copy-on-write: the
    /// current contents of `block_nr` are copied into a newly allocated
    /// block, which is cached and returned in `block_nr`'s place. The caller
    /// is responsible for rewriting whatever points at the old block number
    /// (an omap leaf record, a parent node's child pointer) to reference the
    /// new one, exactly as the space manager's copy-on-write contract
    /// requires of every write to a physical object.
    pub fn read_object_block(&mut self, block_nr: u64, want_write: bool) -> Result<BufferRef> {
        if !want_write {
            if let Some(buf) = self.buffers.get(&block_nr) {
                return Ok(Rc::clone(buf));
            }
            let data = self.fetch(block_nr)?;
            let buf = Rc::new(RefCell::new(Buffer::new(block_nr, data)));
            self.buffers.insert(block_nr, Rc::clone(&buf));
            return Ok(buf);
        }

        let data = match self.buffers.get(&block_nr) {
            Some(buf) => buf.borrow().data().to_vec(),
            None => self.fetch(block_nr)?,
        };

        let new_block_nr = self.alloc_block_nr();
        let mut new_buf = Buffer::new(new_block_nr, data);
        new_buf.mark_dirty();
        new_buf.set_checksum_pending();
        let new_buf = Rc::new(RefCell::new(new_buf));
        self.buffers.insert(new_block_nr, Rc::clone(&new_buf));
        Ok(new_buf)
    }

    /// Allocate a fresh physical block number for a copy-on-write rewrite.
    ///
    /// A real container consults the space manager's free-queue B-tree
    /// ([FREEQUEUE]); this cache has no on-disk allocator to consult, so it
    /// hands out the next block past the highest one it has seen, which is
    /// sufficient for the in-memory fixtures this crate is tested against.
    fn alloc_block_nr(&mut self) -> u64 {
        let block_nr = self.next_free_block;
        self.next_free_block += 1;
        block_nr
    }

    /// Recompute and store the Fletcher-64 checksum of every buffer still
    /// marked `checksum_pending`, clearing the flag. Call before a buffer is
    /// written back or handed to a checksum-verifying reader.
    pub fn flush_checksums(&mut self) {
        for buf in self.buffers.values() {
            let mut buf = buf.borrow_mut();
            if buf.checksum_pending() {
                fletcher::set_checksum(buf.data_mut());
                buf.checksum_pending = false;
            }
        }
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use std::io::Cursor;

    fn block(block_nr: u64, block_size: u32) -> Vec<u8> {
        let mut data = vec![0u8; block_size as usize];
        data[8..16].copy_from_slice(&block_nr.to_le_bytes());
        data
    }

    fn fixture(block_size: u32, count: u64) -> Cursor<Vec<u8>> {
        let mut buf = Vec::with_capacity(block_size as usize * count as usize);
        for i in 0..count {
            buf.extend_from_slice(&block(i, block_size));
        }
        Cursor::new(buf)
    }

    #[test]
    fn read_only_fetch_is_cached() {
        let mut cache = BlockCache::new(fixture(64, 4), 64, 4);
        let a = cache.read_object_block(2, false).unwrap();
        let b = cache.read_object_block(2, false).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn want_write_allocates_new_block() {
        let mut cache = BlockCache::new(fixture(64, 4), 64, 4);
        let original = cache.read_object_block(1, false).unwrap();
        let rewritten = cache.read_object_block(1, true).unwrap();

        assert_ne!(original.borrow().block_nr(), rewritten.borrow().block_nr());
        assert_eq!(rewritten.borrow().block_nr(), 4);
        assert!(rewritten.borrow().is_dirty());
        assert!(rewritten.borrow().checksum_pending());
        assert_eq!(rewritten.borrow().data()[8..16], 1u64.to_le_bytes());
    }

    #[test]
    fn flush_checksums_clears_pending_flag() {
        let mut cache = BlockCache::new(fixture(64, 2), 64, 2);
        let rewritten = cache.read_object_block(0, true).unwrap();
        cache.flush_checksums();
        assert!(!rewritten.borrow().checksum_pending());
        assert!(fletcher::verify_object(rewritten.borrow().data()));
    }
}
