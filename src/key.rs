//! Key construction and comparison (C2).
//!
//! Every B-tree in an APFS container sorts its records by a comparator that
//! depends only on which tree it is: the object map compares `(oid, xid)`
//! pairs, the free-queue compares `(xid, paddr)` pairs, and the catalog
//! compares `(object id, record type, type-specific key material)` — with
//! directory-record names folded for case/normalization when the owning
//! volume says to. This module gives each of those comparators a single,
//! named entry point so the query engine in `query.rs` never has to know
//! the on-disk key layout of the tree it is walking.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::Cursor;

use crate::catalog::{
    J_TYPE_DIR_REC, J_TYPE_EXTENT, J_TYPE_FILE_EXTENT, J_TYPE_INODE, J_TYPE_XATTR,
};
use crate::error::{ApfsError, Result};

/// Which comparator a query should use, selected by which tree it walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Object map: physical, fixed `(oid: u64, xid: u64)` keys.
    Omap,
    /// Space manager free-queue: physical, fixed `(xid: u64, paddr: u64)` keys.
    FreeQueue,
    /// Volume catalog: virtual, variable `(oid/parent, type, ...)` keys.
    Catalog { case_insensitive: bool },
}

/// A decoded search key, tree-kind-tagged so `keycmp` never has to guess
/// which fields are meaningful.
#[derive(Debug, Clone)]
pub enum Key {
    Omap { oid: u64, xid: u64 },
    FreeQueue { xid: u64, paddr: u64 },
    Catalog(CatalogKey),
}

/// The catalog's key shapes. `number` holds whichever type-specific integer
/// the record type carries (the hashed hint for a dir record, the logical
/// offset for a file extent, the xattr name hash where applicable).
#[derive(Debug, Clone)]
pub struct CatalogKey {
    pub oid: u64,
    pub kind: u8,
    pub number: u64,
    pub name: Option<String>,
}

impl Key {
    pub fn init_omap_key(oid: u64, xid: u64) -> Key {
        Key::Omap { oid, xid }
    }

    pub fn init_free_queue_key(xid: u64, paddr: u64) -> Key {
        Key::FreeQueue { xid, paddr }
    }

    pub fn init_inode_key(oid: u64) -> Key {
        Key::Catalog(CatalogKey {
            oid,
            kind: J_TYPE_INODE,
            number: 0,
            name: None,
        })
    }

    pub fn init_xattr_key(oid: u64, name: impl Into<String>) -> Key {
        Key::Catalog(CatalogKey {
            oid,
            kind: J_TYPE_XATTR,
            number: 0,
            name: Some(name.into()),
        })
    }

    pub fn init_file_extent_key(oid: u64, logical_addr: u64) -> Key {
        Key::Catalog(CatalogKey {
            oid,
            kind: J_TYPE_FILE_EXTENT,
            number: logical_addr,
            name: None,
        })
    }

    pub fn init_extent_key(oid: u64) -> Key {
        Key::Catalog(CatalogKey {
            oid,
            kind: J_TYPE_EXTENT,
            number: 0,
            name: None,
        })
    }

    pub fn init_drec_key(parent_oid: u64, name: impl Into<String>) -> Key {
        Key::Catalog(CatalogKey {
            oid: parent_oid,
            kind: J_TYPE_DIR_REC,
            number: 0,
            name: Some(name.into()),
        })
    }

    /// Encode this key as on-disk bytes for the given tree kind, suitable
    /// for passing straight to `node::insert_record`.
    pub fn encode(&self, tree_kind: TreeKind) -> Vec<u8> {
        match (self, tree_kind) {
            (Key::Omap { oid, xid }, TreeKind::Omap) => {
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&oid.to_le_bytes());
                out.extend_from_slice(&xid.to_le_bytes());
                out
            }
            (Key::FreeQueue { xid, paddr }, TreeKind::FreeQueue) => {
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&xid.to_le_bytes());
                out.extend_from_slice(&paddr.to_le_bytes());
                out
            }
            (Key::Catalog(ck), TreeKind::Catalog { .. }) => encode_cat_key(ck),
            _ => panic!("key variant does not match tree kind"),
        }
    }
}

fn obj_id_and_type(oid: u64, kind: u8) -> u64 {
    (oid & 0x0FFF_FFFF_FFFF_FFFF) | ((kind as u64) << 60)
}

fn encode_cat_key(ck: &CatalogKey) -> Vec<u8> {
    let header = obj_id_and_type(ck.oid, ck.kind);
    let mut out = Vec::new();
    out.extend_from_slice(&header.to_le_bytes());

    match (ck.kind, &ck.name) {
        (J_TYPE_DIR_REC, Some(name)) => {
            let hash = name_hash(name, false);
            let name_len = (name.len() + 1).min(0x3FF) as u32; // + NUL terminator
            let name_len_and_hash = (name_len & 0x3FF) | (hash << 10);
            out.extend_from_slice(&name_len_and_hash.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        (J_TYPE_XATTR, Some(name)) => {
            let name_len = (name.len() + 1).min(u16::MAX as usize) as u16;
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        (J_TYPE_FILE_EXTENT, None) => {
            out.extend_from_slice(&ck.number.to_le_bytes());
        }
        _ => {}
    }
    out
}

/// Hash used by `j_drec_hashed_key_t` name lookups (upper 22 bits of
/// `name_len_and_hash`). Not a real APFS name hash (that's a variant of
/// CRC-32C over the folded name) — a placeholder hash stable enough for
/// round-tripping keys this crate itself constructed. Lookups driven by an
/// on-disk key never consult this function: they compare string bytes.
fn name_hash(name: &str, case_insensitive: bool) -> u32 {
    let folded = if case_insensitive {
        name.to_lowercase()
    } else {
        name.to_string()
    };
    let mut h: u32 = 0;
    for b in folded.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as u32);
    }
    h & 0x3FFFFF
}

/// Decode an on-disk omap key.
pub fn read_omap_key(bytes: &[u8]) -> Result<Key> {
    if bytes.len() < 16 {
        return Err(ApfsError::InvalidBTree("omap key too short".into()));
    }
    let mut cursor = Cursor::new(bytes);
    let oid = cursor.read_u64::<LittleEndian>()?;
    let xid = cursor.read_u64::<LittleEndian>()?;
    Ok(Key::Omap { oid, xid })
}

/// Decode an on-disk free-queue key.
pub fn read_free_queue_key(bytes: &[u8]) -> Result<Key> {
    if bytes.len() < 16 {
        return Err(ApfsError::InvalidBTree("free-queue key too short".into()));
    }
    let mut cursor = Cursor::new(bytes);
    let xid = cursor.read_u64::<LittleEndian>()?;
    let paddr = cursor.read_u64::<LittleEndian>()?;
    Ok(Key::FreeQueue { xid, paddr })
}

/// Decode an on-disk catalog key (inode, xattr, dir record, file extent, ...).
pub fn read_cat_key(bytes: &[u8]) -> Result<Key> {
    if bytes.len() < 8 {
        return Err(ApfsError::InvalidBTree("catalog key too short".into()));
    }
    let obj_id_and_type = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let oid = obj_id_and_type & 0x0FFF_FFFF_FFFF_FFFF;
    let kind = ((obj_id_and_type >> 60) & 0xF) as u8;

    let (number, name) = match kind {
        J_TYPE_DIR_REC => {
            if bytes.len() < 12 {
                return Err(ApfsError::InvalidBTree("drec key too short".into()));
            }
            let name_len_and_hash = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
            let name_len = (name_len_and_hash & 0x3FF) as usize;
            let name_start = 12;
            let name_end = name_start + name_len;
            if name_end > bytes.len() || name_len == 0 {
                return Err(ApfsError::InvalidBTree("drec name out of bounds".into()));
            }
            let raw = &bytes[name_start..name_end];
            let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            (0, Some(String::from_utf8_lossy(&raw[..nul]).to_string()))
        }
        J_TYPE_XATTR => {
            if bytes.len() < 10 {
                return Err(ApfsError::InvalidBTree("xattr key too short".into()));
            }
            let name_len = u16::from_le_bytes(bytes[8..10].try_into().unwrap()) as usize;
            let name_start = 10;
            let name_end = name_start + name_len;
            if name_end > bytes.len() || name_len == 0 {
                return Err(ApfsError::InvalidBTree("xattr name out of bounds".into()));
            }
            let raw = &bytes[name_start..name_end];
            let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            (0, Some(String::from_utf8_lossy(&raw[..nul]).to_string()))
        }
        J_TYPE_FILE_EXTENT => {
            if bytes.len() < 16 {
                return Err(ApfsError::InvalidBTree("file extent key too short".into()));
            }
            let logical_addr = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
            (logical_addr, None)
        }
        _ => (0, None),
    };

    Ok(Key::Catalog(CatalogKey {
        oid,
        kind,
        number,
        name,
    }))
}

/// Compare a decoded node key against the query's target key.
///
/// Mirrors the per-tree-kind comparators used by the original driver:
/// omap and free-queue trees compare two plain integer tuples; the catalog
/// compares `(oid, type)` first and only consults type-specific fields
/// (a dir-entry name, a file-extent's logical offset) when both match.
pub fn keycmp(tree_kind: TreeKind, node_key: &Key, target: &Key) -> Result<Ordering> {
    match (node_key, target) {
        (Key::Omap { oid: o1, xid: x1 }, Key::Omap { oid: o2, xid: x2 }) => {
            Ok(o1.cmp(o2).then(x1.cmp(x2)))
        }
        (Key::FreeQueue { xid: x1, paddr: p1 }, Key::FreeQueue { xid: x2, paddr: p2 }) => {
            Ok(x1.cmp(x2).then(p1.cmp(p2)))
        }
        (Key::Catalog(a), Key::Catalog(b)) => {
            let case_insensitive = matches!(
                tree_kind,
                TreeKind::Catalog {
                    case_insensitive: true
                }
            );
            Ok(a.oid.cmp(&b.oid).then(a.kind.cmp(&b.kind)).then_with(|| {
                match (&a.name, &b.name) {
                    (Some(n1), Some(n2)) => filename_cmp(n1, n2, case_insensitive),
                    _ => a.number.cmp(&b.number),
                }
            }))
        }
        _ => Err(ApfsError::InvalidBTree(
            "key variant mismatch in comparator".into(),
        )),
    }
}

/// Compare directory-entry / xattr names the way the owning volume asks:
/// byte-exact when case-sensitive, ASCII-folded otherwise. Real APFS
/// normalization-insensitivity additionally NFD-folds Unicode; that is out
/// of scope here, matching the teacher's own `decode_drec_name`, which
/// never attempted Unicode normalization either.
pub fn filename_cmp(a: &str, b: &str, case_insensitive: bool) -> Ordering {
    if case_insensitive {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omap_key_orders_ascending_xid_within_oid() {
        let a = Key::Omap { oid: 5, xid: 10 };
        let b = Key::Omap { oid: 5, xid: 20 };
        assert_eq!(
            keycmp(TreeKind::Omap, &a, &b).unwrap(),
            Ordering::Less,
            "xid sorts ascending so a right-to-left scan against (oid, MAX) lands on the newest snapshot"
        );
    }

    #[test]
    fn catalog_key_orders_by_oid_then_type() {
        let inode = Key::Catalog(CatalogKey {
            oid: 7,
            kind: J_TYPE_INODE,
            number: 0,
            name: None,
        });
        let xattr = Key::Catalog(CatalogKey {
            oid: 7,
            kind: J_TYPE_XATTR,
            number: 0,
            name: Some("com.apple.test".into()),
        });
        assert_eq!(
            keycmp(TreeKind::Catalog { case_insensitive: false }, &inode, &xattr).unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn drec_roundtrips_through_encode_and_decode() {
        let key = Key::init_drec_key(42, "hello.txt");
        let encoded = key.encode(TreeKind::Catalog {
            case_insensitive: false,
        });
        let decoded = read_cat_key(&encoded).unwrap();
        match decoded {
            Key::Catalog(ck) => {
                assert_eq!(ck.oid, 42);
                assert_eq!(ck.kind, J_TYPE_DIR_REC);
                assert_eq!(ck.name.as_deref(), Some("hello.txt"));
            }
            _ => panic!("expected catalog key"),
        }
    }

    #[test]
    fn case_insensitive_filename_cmp_folds_case() {
        assert_eq!(filename_cmp("Foo", "foo", true), Ordering::Equal);
        assert_ne!(filename_cmp("Foo", "foo", false), Ordering::Equal);
    }
}
