//! # bytescan-rs
//!
//! An in-memory occurrence index over fixed-length byte keys.
//!
//! Feed it every length-L window of a byte stream and it records, per
//! distinct key, how often the key occurred and at which byte offsets. The
//! dictionary is a binary search tree balanced by exact subtree node counts
//! rather than heights: each node tracks how many nodes live below it on
//! either side, and whenever the two counts drift further apart than a
//! configured threshold, the heavy side's extremal node is promoted to
//! re-root that subtree.
//!
//! ## Example
//!
//! ```rust
//! use bytescan_rs::ScanTree;
//!
//! let mut tree = ScanTree::new(2);
//! tree.upsert(b"AB", 0).unwrap();
//! tree.upsert(b"CD", 2).unwrap();
//! tree.upsert(b"AB", 4).unwrap();
//!
//! let entry = tree.find(b"AB").unwrap();
//! assert_eq!(entry.count, 2);
//! assert_eq!(entry.positions, &[0, 4]);
//! ```

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Write};

use smallvec::SmallVec;

// =============================================================================
// Configuration
// =============================================================================

/// Balance threshold used by [`ScanTree::new`].
///
/// A node is rebalanced when `|lefters - righters|` exceeds the threshold;
/// 0 enforces strict size balance, larger values trade rotations for skew.
pub const DEFAULT_BALANCE_THRESHOLD: u32 = 1;

/// Keys up to this many bytes are stored inline in the node, longer keys
/// spill to the heap.
const KEY_INLINE_BYTES: usize = 16;

type KeyBuf = SmallVec<[u8; KEY_INLINE_BYTES]>;

// =============================================================================
// Errors
// =============================================================================

/// Error returned by the mutating entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Backing storage for a node, key, or occurrence record could not be
    /// grown. The dictionary is left exactly as it was before the call.
    AllocationFailed,
    /// The key's length does not match the length this dictionary was
    /// created with.
    KeyLength {
        /// Key length the dictionary was configured with.
        expected: usize,
        /// Length of the rejected key.
        got: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailed => write!(f, "allocation failed"),
            Error::KeyLength { expected, got } => {
                write!(f, "key length {got} does not match configured length {expected}")
            }
        }
    }
}

impl std::error::Error for Error {}

// =============================================================================
// Key ordering
// =============================================================================

/// Byte-lexicographic comparison of two equal-length keys.
///
/// Only defined for keys of the same length; a single dictionary instance is
/// defined over one fixed key length, so a mismatch here is a logic defect.
#[inline]
fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len(), "keys of one dictionary have one length");
    a.cmp(b)
}

// =============================================================================
// Items and occurrence storage
// =============================================================================

/// A key together with its accumulated statistics: the occurrence count and
/// the byte offsets of every sighting, in insertion order.
#[derive(Clone, Debug)]
struct Item {
    key: KeyBuf,
    count: u64,
    positions: Vec<u64>,
}

impl Item {
    fn new(key: KeyBuf, position: u64) -> Result<Self, Error> {
        let mut positions = Vec::new();
        positions.try_reserve(1).map_err(|_| Error::AllocationFailed)?;
        positions.push(position);
        Ok(Self { key, count: 1, positions })
    }

    /// Record one more sighting. Reserves space before touching anything, so
    /// a failed append leaves the item untouched.
    fn record(&mut self, position: u64) -> Result<u64, Error> {
        self.positions.try_reserve(1).map_err(|_| Error::AllocationFailed)?;
        self.positions.push(position);
        self.count += 1;
        debug_assert_eq!(self.count as usize, self.positions.len());
        Ok(self.count)
    }
}

// =============================================================================
// Node arena
// =============================================================================

/// Arena index of a node. Parent links use the same ids, so upward
/// navigation never forms an ownership cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct NodeId(u32);

impl NodeId {
    const NULL: NodeId = NodeId(u32::MAX);

    #[inline]
    fn is_null(self) -> bool {
        self == Self::NULL
    }

    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// A tree node: one item plus its relational links and the exact node counts
/// of its left and right subtrees. A leaf has `lefters == righters == 0`.
#[derive(Clone, Debug)]
struct Node {
    item: Item,
    parent: NodeId,
    left: NodeId,
    right: NodeId,
    lefters: u32,
    righters: u32,
}

// =============================================================================
// Balancer
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Balance {
    Balanced,
    LeftHeavy,
    RightHeavy,
}

// =============================================================================
// ScanTree
// =============================================================================

/// One key's statistics, borrowed from the dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Entry<'a> {
    /// The key bytes.
    pub key: &'a [u8],
    /// How many times the key was observed.
    pub count: u64,
    /// Byte offset of every observation, in insertion order.
    pub positions: &'a [u64],
}

/// An occurrence-indexing dictionary over fixed-length byte keys.
///
/// Nodes live in a flat arena and reference each other by index; the tree
/// itself is the sole owner of every key and occurrence list. There is no
/// deletion, so the arena never fragments and dropping the dictionary frees
/// everything without walking the tree.
#[derive(Clone)]
pub struct ScanTree {
    nodes: Vec<Node>,
    root: NodeId,
    key_len: usize,
    threshold: u32,
    /// Total occurrences recorded across all keys.
    total: u64,
}

impl ScanTree {
    /// Create an empty dictionary over keys of `key_len` bytes, using
    /// [`DEFAULT_BALANCE_THRESHOLD`].
    ///
    /// # Panics
    ///
    /// Panics if `key_len` is 0.
    pub fn new(key_len: usize) -> Self {
        Self::with_threshold(key_len, DEFAULT_BALANCE_THRESHOLD)
    }

    /// Create an empty dictionary with an explicit balance threshold.
    ///
    /// # Panics
    ///
    /// Panics if `key_len` is 0.
    pub fn with_threshold(key_len: usize, threshold: u32) -> Self {
        assert!(key_len > 0, "key length must be at least 1");
        Self {
            nodes: Vec::new(),
            root: NodeId::NULL,
            key_len,
            threshold,
            total: 0,
        }
    }

    /// Number of distinct keys in the dictionary.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Key length this dictionary was created with.
    #[inline]
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Balance threshold this dictionary was created with.
    #[inline]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Total occurrences recorded, summed over all keys.
    #[inline]
    pub fn total_occurrences(&self) -> u64 {
        self.total
    }

    /// Look up a key. A key whose length differs from the configured length
    /// can never be present, so it is reported as a plain miss.
    pub fn find(&self, key: &[u8]) -> Option<Entry<'_>> {
        if key.len() != self.key_len {
            return None;
        }
        let mut cur = self.root;
        while !cur.is_null() {
            let node = &self.nodes[cur.idx()];
            match compare_keys(key, node.item.key.as_slice()) {
                Ordering::Equal => {
                    return Some(Entry {
                        key: node.item.key.as_slice(),
                        count: node.item.count,
                        positions: &node.item.positions,
                    })
                }
                Ordering::Less => cur = node.left,
                Ordering::Greater => cur = node.right,
            }
        }
        None
    }

    /// Record one occurrence of `key` at byte offset `position`.
    ///
    /// Returns the key's accumulated count and whether this sighting created
    /// the key. On error the dictionary is unchanged: all fallible
    /// allocation happens before any structural linking.
    pub fn upsert(&mut self, key: &[u8], position: u64) -> Result<(u64, bool), Error> {
        if key.len() != self.key_len {
            return Err(Error::KeyLength {
                expected: self.key_len,
                got: key.len(),
            });
        }

        // Descend, remembering where the search bottomed out.
        let mut cur = self.root;
        let mut parent = NodeId::NULL;
        let mut went_left = false;
        while !cur.is_null() {
            match compare_keys(key, self.nodes[cur.idx()].item.key.as_slice()) {
                Ordering::Equal => {
                    // No structural change: counters are unaffected and no
                    // rebalancing can be needed.
                    let count = self.nodes[cur.idx()].item.record(position)?;
                    self.total += 1;
                    return Ok((count, false));
                }
                Ordering::Less => {
                    parent = cur;
                    went_left = true;
                    cur = self.nodes[cur.idx()].left;
                }
                Ordering::Greater => {
                    parent = cur;
                    went_left = false;
                    cur = self.nodes[cur.idx()].right;
                }
            }
        }

        let id = self.alloc_node(key, position)?;

        if parent.is_null() {
            self.root = id;
        } else {
            self.nodes[id.idx()].parent = parent;
            if went_left {
                self.nodes[parent.idx()].left = id;
            } else {
                self.nodes[parent.idx()].right = id;
            }

            // The new node joined the subtree of every ancestor on the
            // insertion path; bump the counter for the side it came up from.
            let mut child = id;
            let mut anc = parent;
            while !anc.is_null() {
                let n = &mut self.nodes[anc.idx()];
                if n.left == child {
                    n.lefters += 1;
                } else {
                    n.righters += 1;
                }
                child = anc;
                anc = n.parent;
            }

            self.rebalance_from(parent);
        }

        self.total += 1;
        Ok((1, true))
    }

    /// Upsert every length-L window of `data`, with `base` as the absolute
    /// offset of `data[0]`. Inputs shorter than the key length contribute
    /// nothing. Returns how many windows introduced a new key.
    pub fn scan(&mut self, data: &[u8], base: u64) -> Result<usize, Error> {
        let mut new_keys = 0;
        for (i, window) in data.windows(self.key_len).enumerate() {
            let (_, was_new) = self.upsert(window, base + i as u64)?;
            if was_new {
                new_keys += 1;
            }
        }
        Ok(new_keys)
    }

    /// In-order traversal over all keys, in strictly ascending byte order.
    /// The iterator is lazy and can be restarted by calling `iter` again.
    pub fn iter(&self) -> Iter<'_> {
        let mut iter = Iter {
            tree: self,
            stack: Vec::new(),
        };
        iter.push_left_spine(self.root);
        iter
    }

    /// Empty the dictionary in place, keeping its configuration.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NodeId::NULL;
        self.total = 0;
    }

    /// Heap bytes held by the dictionary.
    pub fn memory_usage(&self) -> usize {
        let mut bytes = self.nodes.capacity() * std::mem::size_of::<Node>();
        for node in &self.nodes {
            if node.item.key.spilled() {
                bytes += node.item.key.capacity();
            }
            bytes += node.item.positions.capacity() * std::mem::size_of::<u64>();
        }
        bytes
    }

    pub fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        for node in &mut self.nodes {
            node.item.key.shrink_to_fit();
            node.item.positions.shrink_to_fit();
        }
    }

    // =========================================================================
    // Internals: allocation
    // =========================================================================

    /// Create the item and node for a first sighting. Everything fallible
    /// happens here, before the node is reachable from the root.
    fn alloc_node(&mut self, key: &[u8], position: u64) -> Result<NodeId, Error> {
        let mut buf = KeyBuf::new();
        buf.try_reserve(key.len()).map_err(|_| Error::AllocationFailed)?;
        buf.extend_from_slice(key);
        let item = Item::new(buf, position)?;

        if self.nodes.len() >= NodeId::NULL.idx() {
            return Err(Error::AllocationFailed);
        }
        self.nodes.try_reserve(1).map_err(|_| Error::AllocationFailed)?;

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            item,
            parent: NodeId::NULL,
            left: NodeId::NULL,
            right: NodeId::NULL,
            lefters: 0,
            righters: 0,
        });
        Ok(id)
    }

    // =========================================================================
    // Internals: balancer
    // =========================================================================

    /// Walk from `start` up to the root, rotating at most once per node.
    ///
    /// One insertion raises each ancestor's skew by at most 1 and a rotation
    /// lowers the rotated node's skew by exactly 2, so a single upward pass
    /// restores every node on the path to within the tolerance.
    fn rebalance_from(&mut self, start: NodeId) {
        let mut cur = start;
        while !cur.is_null() {
            // The promoted node takes `cur`'s place under the same parent,
            // so the continuation point is unaffected by the rotation.
            let next = self.nodes[cur.idx()].parent;
            match self.check_balance(cur) {
                Balance::LeftHeavy => self.rotate_left_right(cur),
                Balance::RightHeavy => self.rotate_right_left(cur),
                Balance::Balanced => {}
            }
            cur = next;
        }
    }

    /// Cardinality balance check: reports which side holds more nodes once
    /// the difference exceeds the threshold. Not a height measure.
    fn check_balance(&self, id: NodeId) -> Balance {
        let node = &self.nodes[id.idx()];
        if node.lefters.abs_diff(node.righters) <= self.threshold {
            Balance::Balanced
        } else if node.lefters > node.righters {
            Balance::LeftHeavy
        } else {
            Balance::RightHeavy
        }
    }

    /// Re-root the subtree at `r` at the maximum-keyed node of its left
    /// subtree. The old root is demoted to the new root's right child,
    /// keeping its right subtree; what remains of the left subtree moves
    /// wholesale under the new root. Allocation-free; counters outside the
    /// subtree are untouched, and the skew at the rotated position drops
    /// by 2.
    fn rotate_left_right(&mut self, r: NodeId) {
        let l = self.nodes[r.idx()].left;
        debug_assert!(!l.is_null(), "left-heavy node must have a left child");

        // Walk to the maximum of the left subtree. It is about to leave the
        // subtree of every node on the way down.
        let mut n_star = l;
        while !self.nodes[n_star.idx()].right.is_null() {
            self.nodes[n_star.idx()].righters -= 1;
            n_star = self.nodes[n_star.idx()].right;
        }
        debug_assert_eq!(self.nodes[n_star.idx()].righters, 0);

        let grand = self.nodes[r.idx()].parent;
        let old_lefters = self.nodes[r.idx()].lefters;
        let old_righters = self.nodes[r.idx()].righters;

        if n_star != l {
            // Splice the maximum out: its left child takes its place as its
            // parent's right child, and the left subtree root moves under it.
            let p = self.nodes[n_star.idx()].parent;
            let orphan = self.nodes[n_star.idx()].left;
            self.nodes[p.idx()].right = orphan;
            if !orphan.is_null() {
                self.nodes[orphan.idx()].parent = p;
            }
            self.nodes[n_star.idx()].left = l;
            self.nodes[l.idx()].parent = n_star;
        }
        // If n_star == l, the remaining left subtree is n_star's own left
        // child, which is already in place.

        let demoted = &mut self.nodes[r.idx()];
        demoted.left = NodeId::NULL;
        demoted.lefters = 0;
        demoted.parent = n_star;

        let promoted = &mut self.nodes[n_star.idx()];
        promoted.right = r;
        promoted.lefters = old_lefters - 1;
        promoted.righters = old_righters + 1;
        promoted.parent = grand;

        self.replace_child(grand, r, n_star);
    }

    /// Mirror of [`Self::rotate_left_right`]: promotes the minimum-keyed
    /// node of the right subtree.
    fn rotate_right_left(&mut self, r: NodeId) {
        let rt = self.nodes[r.idx()].right;
        debug_assert!(!rt.is_null(), "right-heavy node must have a right child");

        let mut n_star = rt;
        while !self.nodes[n_star.idx()].left.is_null() {
            self.nodes[n_star.idx()].lefters -= 1;
            n_star = self.nodes[n_star.idx()].left;
        }
        debug_assert_eq!(self.nodes[n_star.idx()].lefters, 0);

        let grand = self.nodes[r.idx()].parent;
        let old_lefters = self.nodes[r.idx()].lefters;
        let old_righters = self.nodes[r.idx()].righters;

        if n_star != rt {
            let p = self.nodes[n_star.idx()].parent;
            let orphan = self.nodes[n_star.idx()].right;
            self.nodes[p.idx()].left = orphan;
            if !orphan.is_null() {
                self.nodes[orphan.idx()].parent = p;
            }
            self.nodes[n_star.idx()].right = rt;
            self.nodes[rt.idx()].parent = n_star;
        }

        let demoted = &mut self.nodes[r.idx()];
        demoted.right = NodeId::NULL;
        demoted.righters = 0;
        demoted.parent = n_star;

        let promoted = &mut self.nodes[n_star.idx()];
        promoted.left = r;
        promoted.lefters = old_lefters + 1;
        promoted.righters = old_righters - 1;
        promoted.parent = grand;

        self.replace_child(grand, r, n_star);
    }

    /// Point the grandparent slot previously holding `old` at `new`, or
    /// re-root the tree if there is no grandparent.
    fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        if parent.is_null() {
            self.root = new;
        } else if self.nodes[parent.idx()].left == old {
            self.nodes[parent.idx()].left = new;
        } else {
            debug_assert_eq!(self.nodes[parent.idx()].right, old);
            self.nodes[parent.idx()].right = new;
        }
    }
}

impl fmt::Debug for ScanTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|e| (e.key.to_vec(), e.count)))
            .finish()
    }
}

// =============================================================================
// Iteration
// =============================================================================

/// Lazy in-order iterator over a [`ScanTree`].
pub struct Iter<'a> {
    tree: &'a ScanTree,
    stack: Vec<NodeId>,
}

impl<'a> Iter<'a> {
    fn push_left_spine(&mut self, mut id: NodeId) {
        while !id.is_null() {
            self.stack.push(id);
            id = self.tree.nodes[id.idx()].left;
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Entry<'a>> {
        let id = self.stack.pop()?;
        let right = self.tree.nodes[id.idx()].right;
        self.push_left_spine(right);

        let node: &'a Node = &self.tree.nodes[id.idx()];
        Some(Entry {
            key: node.item.key.as_slice(),
            count: node.item.count,
            positions: &node.item.positions,
        })
    }
}

// =============================================================================
// XML report rendering
// =============================================================================

impl ScanTree {
    /// Render the dictionary in key order as an XML report:
    ///
    /// ```text
    /// <tree>
    /// <node>AB<info>
    /// 2
    /// 0 4
    /// </info></node>
    /// </tree>
    /// ```
    ///
    /// Each `<info>` block holds the occurrence count and the
    /// space-separated position list. Printable ASCII key bytes pass
    /// through with the XML specials escaped; every other byte becomes a
    /// numeric character reference.
    pub fn write_xml<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(b"<tree>\n")?;
        for entry in self.iter() {
            out.write_all(b"<node>")?;
            write_escaped(out, entry.key)?;
            out.write_all(b"<info>\n")?;
            writeln!(out, "{}", entry.count)?;
            for (i, pos) in entry.positions.iter().enumerate() {
                if i > 0 {
                    out.write_all(b" ")?;
                }
                write!(out, "{pos}")?;
            }
            out.write_all(b"\n</info></node>\n")?;
        }
        out.write_all(b"</tree>\n")
    }
}

fn write_escaped<W: Write>(out: &mut W, bytes: &[u8]) -> io::Result<()> {
    for &b in bytes {
        match b {
            b'&' => out.write_all(b"&amp;")?,
            b'<' => out.write_all(b"&lt;")?,
            b'>' => out.write_all(b"&gt;")?,
            b'"' => out.write_all(b"&quot;")?,
            b'\'' => out.write_all(b"&apos;")?,
            0x20..=0x7e => out.write_all(&[b])?,
            _ => write!(out, "&#x{b:02X};")?,
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod proptests;
