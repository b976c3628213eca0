//! Index-linked free lists over a fixed frame-number space.
//!
//! Every managed frame owns one [`FrameNode`] in a flat arena. A free
//! block is linked into the list of its order through the node of its
//! first frame, so bookkeeping never allocates per block.
//!
//! ```text
//!  lists[k].head ──► node[i] ◄──► node[j] ◄──► node[m] ◄── lists[k].tail
//!                   (prev/next are arena indices, NIL terminates)
//! ```

use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_info::memory::MAX_ORDER;

/// Terminates a list.
pub const NIL: u32 = u32::MAX;

/// What a frame's node currently stands for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum NodeState {
    /// Not handed to the allocator (firmware, kernel image, holes).
    Reserved = 0,
    /// First frame of a free block, linked into `lists[order]`.
    Free = 1,
    /// First frame of an allocated block of `order`.
    Allocated = 2,
    /// Any other frame of a block.
    Tail = 3,
}

impl NodeState {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value {
            0 => Self::Reserved,
            1 => Self::Free,
            2 => Self::Allocated,
            _ => Self::Tail,
        }
    }
}

/// Packed state and order of one frame.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct NodeTag {
    /// Block order; meaningful for `Free` and `Allocated` heads.
    #[bits(4)]
    pub order: u8,
    #[bits(2)]
    pub state: NodeState,
    #[bits(2)]
    __: u8,
}

impl NodeTag {
    #[allow(clippy::cast_possible_truncation)]
    pub const fn head(state: NodeState, order: usize) -> Self {
        Self::new().with_state(state).with_order(order as u8)
    }

    pub const fn tail() -> Self {
        Self::new().with_state(NodeState::Tail)
    }

    pub const fn order_usize(self) -> usize {
        self.order() as usize
    }

    /// Whether this is the head of a block in `state` at exactly `order`.
    pub fn is(self, state: NodeState, order: usize) -> bool {
        self.state() == state && self.order_usize() == order
    }
}

#[derive(Copy, Clone, Debug)]
struct FrameNode {
    prev: u32,
    next: u32,
    tag: NodeTag,
}

impl FrameNode {
    const RESERVED: Self = Self {
        prev: NIL,
        next: NIL,
        tag: NodeTag::new(),
    };
}

#[derive(Copy, Clone, Debug)]
struct FreeList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeList {
    const EMPTY: Self = Self {
        head: NIL,
        tail: NIL,
        len: 0,
    };
}

/// Where a block enters its list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// Most recently freed blocks are handed out first.
    Head,
    /// Boot seeding keeps ascending address order.
    Tail,
}

/// The node arena plus one list per order.
pub struct FreeAreas {
    nodes: Vec<FrameNode>,
    lists: [FreeList; MAX_ORDER + 1],
}

#[inline]
const fn at(index: u32) -> usize {
    index as usize
}

impl FreeAreas {
    /// `frames` nodes, all reserved, and empty lists.
    pub fn new(frames: u32) -> Self {
        Self {
            nodes: alloc::vec![FrameNode::RESERVED; at(frames)],
            lists: [FreeList::EMPTY; MAX_ORDER + 1],
        }
    }

    #[inline]
    pub fn tag(&self, index: u32) -> NodeTag {
        self.nodes[at(index)].tag
    }

    #[inline]
    pub fn set_tag(&mut self, index: u32, tag: NodeTag) {
        self.nodes[at(index)].tag = tag;
    }

    #[inline]
    pub fn len(&self, order: usize) -> usize {
        self.lists[order].len
    }

    /// Link `index` into `lists[order]` and tag it as a free head.
    pub fn insert(&mut self, order: usize, index: u32, placement: Placement) {
        let list = &mut self.lists[order];
        let node = &mut self.nodes[at(index)];
        node.tag = NodeTag::head(NodeState::Free, order);
        match placement {
            Placement::Head => {
                node.prev = NIL;
                node.next = list.head;
                if list.head == NIL {
                    list.tail = index;
                } else {
                    self.nodes[at(list.head)].prev = index;
                }
                list.head = index;
            }
            Placement::Tail => {
                node.next = NIL;
                node.prev = list.tail;
                if list.tail == NIL {
                    list.head = index;
                } else {
                    self.nodes[at(list.tail)].next = index;
                }
                list.tail = index;
            }
        }
        list.len += 1;
    }

    /// Unlink the first block of `lists[order]`. The tag is left to the caller.
    pub fn pop(&mut self, order: usize) -> Option<u32> {
        let head = self.lists[order].head;
        if head == NIL {
            return None;
        }
        self.remove(order, head);
        Some(head)
    }

    /// Unlink `index` from `lists[order]`. The tag is left to the caller.
    pub fn remove(&mut self, order: usize, index: u32) {
        let FrameNode { prev, next, .. } = self.nodes[at(index)];
        let list = &mut self.lists[order];
        debug_assert!(list.len > 0);

        if prev == NIL {
            list.head = next;
        } else {
            self.nodes[at(prev)].next = next;
        }
        if next == NIL {
            list.tail = prev;
        } else {
            self.nodes[at(next)].prev = prev;
        }
        list.len -= 1;

        let node = &mut self.nodes[at(index)];
        node.prev = NIL;
        node.next = NIL;
    }

    /// Indices on `lists[order]`, head first.
    pub fn iter(&self, order: usize) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = self.lists[order].head;
        core::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let current = cursor;
            cursor = self.nodes[at(current)].next;
            Some(current)
        })
    }
}
