use std::collections::BTreeMap;

const HEAP_BASE: u64 = 0x1000;
const HEAP_ALIGN: u64 = 256;

pub(crate) struct Block<E> {
    pub bytes: u64,
    pub entry: E,
}

/// Device address space. Addresses are never reused, so a freed address
/// stays unresolvable.
pub(crate) struct DeviceHeap<E> {
    next: u64,
    blocks: BTreeMap<u64, Block<E>>,
}

impl<E> DeviceHeap<E> {
    pub fn new() -> Self {
        Self {
            next: HEAP_BASE,
            blocks: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, bytes: u64, entry: E) -> u64 {
        let base = self.next;
        let end = base + bytes.max(1);
        self.next = (end + HEAP_ALIGN - 1) / HEAP_ALIGN * HEAP_ALIGN;
        self.blocks.insert(base, Block { bytes, entry });
        base
    }

    /// Frees the block starting exactly at `base`.
    pub fn remove(&mut self, base: u64) -> Option<E> {
        self.blocks.remove(&base).map(|b| b.entry)
    }

    /// Block containing `addr`, with its base address.
    pub fn resolve(&self, addr: u64) -> Option<(u64, &Block<E>)> {
        let (base, block) = self.blocks.range(..=addr).next_back()?;
        (addr < base + block.bytes).then_some((*base, block))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}
