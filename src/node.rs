//! Views over an in-memory tree-block buffer: the header plus either a
//! leaf's sorted items or an internal node's key pointers.
//!
//! Shared by the raw Scanner (reading directly off a device) and the
//! tree walker used once the surrounding trees are reopened, so there is
//! one implementation of "how to index into a tree block" rather than two.

use crate::structures::{BtrfsDiskKey, BtrfsHeader, BtrfsItem, BtrfsKeyPtr};

fn header_of(block: &[u8]) -> &BtrfsHeader {
    assert!(block.len() >= std::mem::size_of::<BtrfsHeader>());
    unsafe { &*(block.as_ptr() as *const BtrfsHeader) }
}

pub struct LeafView<'a> {
    block: &'a [u8],
}

impl<'a> LeafView<'a> {
    pub fn new(block: &'a [u8]) -> LeafView<'a> {
        LeafView { block }
    }

    pub fn header(&self) -> &'a BtrfsHeader {
        header_of(self.block)
    }

    pub fn nritems(&self) -> u32 {
        self.header().nritems
    }

    /// returns the item descriptor and its data slice for `slot`.
    pub fn item(&self, slot: u32) -> (&'a BtrfsItem, &'a [u8]) {
        assert!(slot < self.nritems());
        let item_off =
            std::mem::size_of::<BtrfsHeader>() + slot as usize * std::mem::size_of::<BtrfsItem>();
        let item = unsafe { &*(self.block.as_ptr().add(item_off) as *const BtrfsItem) };
        let data_off = std::mem::size_of::<BtrfsHeader>() + item.offset as usize;
        let data = &self.block[data_off..data_off + item.size as usize];
        (item, data)
    }

    pub fn items(&self) -> impl Iterator<Item = (&'a BtrfsItem, &'a [u8])> + 'a {
        let block = self.block;
        (0..header_of(block).nritems).map(move |i| LeafView::new(block).item(i))
    }

    /// binary search for the slot whose key equals `key`, relying on the
    /// leaf's items being stored in ascending key order.
    pub fn find(&self, key: &BtrfsDiskKey) -> Option<(&'a BtrfsItem, &'a [u8])> {
        let n = self.nritems();
        if n == 0 {
            return None;
        }
        let mut lo = 0u32;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (item, _) = self.item(mid);
            match item.key.cmp(key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.item(mid)),
            }
        }
        None
    }
}

pub struct InternalView<'a> {
    block: &'a [u8],
}

impl<'a> InternalView<'a> {
    pub fn new(block: &'a [u8]) -> InternalView<'a> {
        InternalView { block }
    }

    pub fn header(&self) -> &'a BtrfsHeader {
        header_of(self.block)
    }

    pub fn key_ptr(&self, slot: u32) -> &'a BtrfsKeyPtr {
        assert!(slot < self.header().nritems);
        let off = std::mem::size_of::<BtrfsHeader>()
            + slot as usize * std::mem::size_of::<BtrfsKeyPtr>();
        unsafe { &*(self.block.as_ptr().add(off) as *const BtrfsKeyPtr) }
    }

    /// returns the slot of the last key-pointer whose key is <= `key` —
    /// that subtree is the one that may contain `key` (the standard
    /// btrfs descent rule, by binary search over the sorted key-pointer
    /// array).
    pub fn descend_slot(&self, key: &BtrfsDiskKey) -> u32 {
        let n = self.header().nritems;
        let mut lo = 0u32;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key_ptr(mid).key <= *key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.saturating_sub(1).min(n.saturating_sub(1))
    }
}
