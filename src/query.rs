//! Node query (C3) and B-tree query (C4): the descent machinery C5 and C6
//! are both built on.
//!
//! A [`Query`] is a singly-linked chain of positions, leaf at the head and
//! root at the tail, mirroring the original driver's parent-pointer query
//! structure closely enough that backtracking is just "replace the current
//! query with its parent and keep going" — no separate stack needed.

use std::cmp::Ordering;
use std::io::{Read, Seek};

use crate::error::{ApfsError, Result};
use crate::key::{self, Key, TreeKind};
use crate::node::NodeView;
use crate::object::BlockCache;

/// Maximum descent depth before a malformed tree is declared corrupted.
/// Real APFS trees are far shallower; this is a defense against adversarial
/// or corrupted media producing a cycle of child pointers.
pub const MAX_DEPTH: u32 = 12;

/// What C3 found (or didn't) in a single node.
pub enum NodePosition {
    /// `index` is the greatest record whose key is `<= target`.
    Found(usize),
    /// This subtree cannot contain the key; the caller should retry at the
    /// parent, resuming one slot earlier there.
    Backtrack,
    /// The node is an empty root: there is nothing to find anywhere.
    NotFound,
}

/// One level of an in-progress descent. The head of the chain (held by the
/// caller) is the most recently visited node; `parent` links toward the
/// root.
/// Sentinel for `Query::index` meaning "this node has not been positioned
/// yet" — C3 should scan its full range rather than resume from a slot.
pub const UNVISITED: usize = usize::MAX;

pub struct Query {
    pub block_nr: u64,
    pub index: usize,
    pub depth: u32,
    pub multi: bool,
    pub parent: Option<Box<Query>>,
}

impl Query {
    pub fn alloc_root(block_nr: u64, multi: bool) -> Query {
        Query {
            block_nr,
            index: UNVISITED,
            depth: 0,
            multi,
            parent: None,
        }
    }

    /// Drop the leaf-side cursor and continue from the parent's slot,
    /// already pointing one earlier than the child traversal that failed.
    fn backtrack(self) -> Option<Query> {
        self.parent.map(|boxed| *boxed)
    }
}

/// The position a completed B-tree query is pinned at: a leaf node and the
/// slot within it. Callers read key/value bytes out of the node directly.
pub struct QueryResult {
    pub block_nr: u64,
    pub index: usize,
}

/// C3. Given a parsed node and a target key, find the record with the
/// greatest key `<= target`, scanning right to left as the sort order and
/// the "on entry index = N" contract require.
///
/// `start_before` bounds the scan to `[0, start_before)`: a fresh visit to a
/// node passes `view.nkeys()` to scan the whole thing, while a resumed scan
/// after backtracking from a child passes the parent's last position, since
/// that slot's subtree has already been ruled out.
pub fn node_query(
    view: &NodeView,
    tree_kind: TreeKind,
    target: &Key,
    start_before: usize,
    decode: impl Fn(&[u8]) -> Result<Key>,
) -> Result<NodePosition> {
    let n = view.nkeys();
    if n == 0 {
        return Ok(if view.is_root() {
            NodePosition::NotFound
        } else {
            NodePosition::Backtrack
        });
    }

    let upper = start_before.min(n);
    for i in (0..upper).rev() {
        let key_bytes = view.key_extent(i, 0)?;
        let node_key = decode(key_bytes)?;
        let ord = key::keycmp(tree_kind, &node_key, target)?;
        if ord != Ordering::Greater {
            return Ok(NodePosition::Found(i));
        }
    }

    // Leftmost key in range is already greater than target.
    Ok(NodePosition::Backtrack)
}

fn decoder_for(tree_kind: TreeKind) -> fn(&[u8]) -> Result<Key> {
    match tree_kind {
        TreeKind::Omap => key::read_omap_key,
        TreeKind::FreeQueue => key::read_free_queue_key,
        TreeKind::Catalog { .. } => key::read_cat_key,
    }
}

/// C4. Descend from `root_block` to the leaf that would hold `target`,
/// following child ids and backtracking to parents when a subtree cannot
/// contain the key.
///
/// `omap_mode` is true exactly when the tree being queried is itself the
/// object map (physical child ids); otherwise non-leaf child ids are
/// virtual object ids resolved through `resolve_child` (C5).
pub fn btree_query<R, F>(
    cache: &mut BlockCache<R>,
    root_block: u64,
    tree_kind: TreeKind,
    target: &Key,
    omap_mode: bool,
    mut resolve_child: F,
) -> Result<QueryResult>
where
    R: Read + Seek,
    F: FnMut(&mut BlockCache<R>, u64) -> Result<u64>,
{
    let decode = decoder_for(tree_kind);
    let mut query = Query::alloc_root(root_block, false);

    loop {
        if query.depth >= MAX_DEPTH {
            return Err(ApfsError::corrupted(
                query.block_nr,
                "b-tree descent exceeded maximum depth",
            ));
        }

        let buf = cache.read_object_block(query.block_nr, false)?;
        let position = {
            let buf_ref = buf.borrow();
            let view = NodeView::parse(buf_ref.data())?;
            let start_before = if query.index == UNVISITED {
                view.nkeys()
            } else {
                query.index
            };
            node_query(&view, tree_kind, target, start_before, decode)?
        };

        match position {
            NodePosition::NotFound => return Err(ApfsError::NotFound),
            NodePosition::Backtrack => {
                query = match query.backtrack() {
                    Some(parent) => parent,
                    None => return Err(ApfsError::NotFound),
                };
                continue;
            }
            NodePosition::Found(index) => {
                let buf_ref = buf.borrow();
                let view = NodeView::parse(buf_ref.data())?;

                if view.is_leaf() {
                    return Ok(QueryResult {
                        block_nr: query.block_nr,
                        index,
                    });
                }

                let child_id = view.child_oid(index)?;
                drop(buf_ref);

                let child_block = if omap_mode {
                    child_id
                } else {
                    resolve_child(cache, child_id)?
                };

                {
                    let child_buf = cache.read_object_block(child_block, false)?;
                    let child_view = NodeView::parse(child_buf.borrow().data())?;
                    if child_view.header.oid != child_id {
                        log::warn!(
                            "child node at block {child_block} has oid {} but parent referenced {child_id}",
                            child_view.header.oid
                        );
                    }
                }

                let parent = Query {
                    block_nr: query.block_nr,
                    index,
                    depth: query.depth,
                    multi: query.multi,
                    parent: query.parent.take(),
                };
                query = Query {
                    block_nr: child_block,
                    index: UNVISITED,
                    depth: parent.depth + 1,
                    multi: parent.multi,
                    parent: Some(Box::new(parent)),
                };
            }
        }
    }
}
