use std::sync::Arc;

use crate::buffer::{BufferPoolManager, ReadPageGuard};
use crate::common::{RecordId, Result};

use super::btree_page::LeafView;

/// Forward cursor over the leaf chain. Holds a read guard on exactly one
/// leaf plus an index into it; stepping past the leaf's last entry releases
/// that guard before latching the successor.
///
/// The iterator is a snapshot of a position, not of values: it does not
/// shield against concurrent structural changes and must not be used across
/// concurrent writers.
pub struct BPlusTreeIterator<const K: usize> {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<ReadPageGuard>,
    index: usize,
}

impl<const K: usize> BPlusTreeIterator<K> {
    pub(crate) fn new(bpm: Arc<BufferPoolManager>, leaf: ReadPageGuard, index: usize) -> Self {
        Self {
            bpm,
            leaf: Some(leaf),
            index,
        }
    }

    /// The iterator of an empty tree.
    pub(crate) fn at_end(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            leaf: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(guard) => {
                let leaf = LeafView::<K>::new(guard.data());
                self.index >= leaf.size() && leaf.next_page_id().is_none()
            }
        }
    }

    /// The entry under the cursor; the key reference stays valid until the
    /// iterator is advanced or dropped.
    pub fn entry(&self) -> Option<(&[u8], RecordId)> {
        let guard = self.leaf.as_ref()?;
        let leaf = LeafView::<K>::new(guard.data());
        if self.index < leaf.size() {
            Some((leaf.key_at(self.index), leaf.value_at(self.index)))
        } else {
            None
        }
    }

    /// Moves the cursor one entry forward, hopping to the next leaf when
    /// the current one is exhausted.
    pub fn advance(&mut self) -> Result<()> {
        let Some(guard) = self.leaf.as_ref() else {
            return Ok(());
        };

        let (size, next) = {
            let leaf = LeafView::<K>::new(guard.data());
            (leaf.size(), leaf.next_page_id())
        };

        if self.index < size {
            self.index += 1;
        }
        if self.index >= size {
            if let Some(next_page_id) = next {
                // Release the current leaf before latching its successor.
                self.leaf = None;
                self.leaf = Some(self.bpm.checked_read_page(next_page_id)?);
                self.index = 0;
            }
        }
        Ok(())
    }
}

impl<const K: usize> Iterator for BPlusTreeIterator<K> {
    type Item = Result<([u8; K], RecordId)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = {
            let (key, value) = self.entry()?;
            let key: [u8; K] = key.try_into().unwrap();
            (key, value)
        };
        match self.advance() {
            Ok(()) => Some(Ok((key, value))),
            Err(e) => Some(Err(e)),
        }
    }
}
