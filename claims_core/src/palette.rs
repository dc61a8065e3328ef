//! Palette-compressed claim grid for one 32x32-chunk region.
//!
//! Each of the 1024 cells stores a small index into an ordered palette of
//! distinct [`ChunkClaim`] values. Slot 0 of the palette is reserved for
//! "unclaimed" and is always `None`. Indices are bit-packed into `u64`
//! words, `64 / bits` values per word, never spanning a word boundary.

use crate::claim::ChunkClaim;

pub const REGION_SIDE: usize = 32;
pub const REGION_CELLS: usize = REGION_SIDE * REGION_SIDE;
pub const MAX_BITS: u8 = 11;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PaletteError {
    #[error("palette must contain at least the reserved unclaimed slot")]
    EmptyPalette,
    #[error("palette slot 0 is reserved for unclaimed cells")]
    ReservedSlotOccupied,
    #[error("unsupported storage width {0} bits")]
    UnsupportedBits(u8),
    #[error("storage holds {actual} words, expected {expected} for {bits} bits")]
    WordCount {
        bits: u8,
        expected: usize,
        actual: usize,
    },
}

/// Fixed-width packed array of 1024 palette indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedCells {
    bits: u8,
    words: Vec<u64>,
}

impl PackedCells {
    pub fn new(bits: u8) -> Self {
        Self {
            bits,
            words: vec![0; Self::word_count(bits)],
        }
    }

    pub fn from_words(bits: u8, words: Vec<u64>) -> Result<Self, PaletteError> {
        if bits == 0 || bits > MAX_BITS {
            return Err(PaletteError::UnsupportedBits(bits));
        }
        let expected = Self::word_count(bits);
        if words.len() != expected {
            return Err(PaletteError::WordCount {
                bits,
                expected,
                actual: words.len(),
            });
        }
        Ok(Self { bits, words })
    }

    pub fn word_count(bits: u8) -> usize {
        let per_word = 64 / bits as usize;
        REGION_CELLS.div_ceil(per_word)
    }

    /// Number of cells the words can address.
    pub fn capacity(&self) -> usize {
        self.words.len() * (64 / self.bits as usize)
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    fn mask(&self) -> u64 {
        (1u64 << self.bits) - 1
    }

    fn locate(&self, cell: usize) -> (usize, u32) {
        let per_word = 64 / self.bits as usize;
        (cell / per_word, ((cell % per_word) * self.bits as usize) as u32)
    }

    pub fn get(&self, cell: usize) -> usize {
        let (word, shift) = self.locate(cell);
        ((self.words[word] >> shift) & self.mask()) as usize
    }

    pub fn set(&mut self, cell: usize, value: usize) {
        let (word, shift) = self.locate(cell);
        let mask = self.mask();
        let slot = &mut self.words[word];
        *slot = (*slot & !(mask << shift)) | ((value as u64 & mask) << shift);
    }

    fn repacked(&self, bits: u8) -> Self {
        let mut next = PackedCells::new(bits);
        for cell in 0..REGION_CELLS {
            let value = self.get(cell);
            if value != 0 {
                next.set(cell, value);
            }
        }
        next
    }
}

/// Whether palette reference counts can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderState {
    Consistent,
    /// Counts are unknown; every mutating call rebuilds them first.
    NeedsRebuild,
}

#[derive(Debug, Clone, Copy)]
struct PaletteEntry {
    claim: ChunkClaim,
    holders: u16,
}

/// Palette slots that entered or left the store during one `set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaletteChange {
    pub added: Option<ChunkClaim>,
    pub removed: Option<ChunkClaim>,
}

/// Bits needed to address `palette_len` slots, rounded to 1 or an even
/// width, capped at [`MAX_BITS`].
pub fn required_bits(palette_len: usize) -> u8 {
    let needed = if palette_len <= 1 {
        0
    } else {
        (usize::BITS - (palette_len - 1).leading_zeros()) as u8
    };
    if needed <= 1 {
        1
    } else if needed < MAX_BITS {
        needed + (needed & 1)
    } else {
        MAX_BITS
    }
}

#[derive(Debug, Clone)]
pub struct PaletteRegionStore {
    palette: Vec<Option<PaletteEntry>>,
    cells: PackedCells,
    holders: HolderState,
}

impl Default for PaletteRegionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PaletteRegionStore {
    pub fn new() -> Self {
        Self {
            palette: vec![None],
            cells: PackedCells::new(1),
            holders: HolderState::Consistent,
        }
    }

    /// Builds a store from raw parts. Reference counts are rebuilt before
    /// the first mutation.
    ///
    /// # Panics
    /// If the palette is empty, slot 0 is occupied or the cells cannot
    /// address a full region.
    pub fn from_parts(palette: Vec<Option<ChunkClaim>>, cells: PackedCells) -> Self {
        assert!(!palette.is_empty(), "region palette cannot be empty");
        assert!(palette[0].is_none(), "region palette slot 0 must be unclaimed");
        assert!(
            cells.capacity() >= REGION_CELLS,
            "region storage must hold {REGION_CELLS} cells"
        );
        Self {
            palette: palette
                .into_iter()
                .map(|slot| slot.map(|claim| PaletteEntry { claim, holders: 0 }))
                .collect(),
            cells,
            holders: HolderState::NeedsRebuild,
        }
    }

    /// Validating counterpart of [`from_parts`](Self::from_parts) for data
    /// received over the network.
    pub fn try_from_bulk(
        palette: Vec<Option<ChunkClaim>>,
        bits: u8,
        words: Vec<u64>,
    ) -> Result<Self, PaletteError> {
        if palette.is_empty() {
            return Err(PaletteError::EmptyPalette);
        }
        if palette[0].is_some() {
            return Err(PaletteError::ReservedSlotOccupied);
        }
        let cells = PackedCells::from_words(bits, words)?;
        Ok(Self::from_parts(palette, cells))
    }

    pub fn cell_index(x: usize, z: usize) -> usize {
        debug_assert!(x < REGION_SIDE && z < REGION_SIDE);
        (x << 5) | z
    }

    pub fn holder_state(&self) -> HolderState {
        self.holders
    }

    pub fn bits(&self) -> u8 {
        self.cells.bits()
    }

    pub fn palette_len(&self) -> usize {
        self.palette.len()
    }

    fn claim_at(&self, cell: usize) -> Option<ChunkClaim> {
        let index = self.cells.get(cell);
        self.palette
            .get(index)
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.claim)
    }

    pub fn get(&self, x: usize, z: usize) -> Option<ChunkClaim> {
        self.claim_at(Self::cell_index(x, z))
    }

    pub fn is_empty(&self) -> bool {
        match self.holders {
            HolderState::Consistent => self.palette.len() <= 1,
            HolderState::NeedsRebuild => (0..REGION_CELLS).all(|cell| self.claim_at(cell).is_none()),
        }
    }

    /// Number of cells holding `claim`.
    pub fn count_of(&self, claim: &ChunkClaim) -> usize {
        (0..REGION_CELLS)
            .filter(|&cell| self.claim_at(cell).as_ref() == Some(claim))
            .count()
    }

    /// Distinct claims present in the palette.
    pub fn claims(&self) -> impl Iterator<Item = ChunkClaim> + '_ {
        self.palette
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| entry.claim))
    }

    pub fn for_each_claimed(&self, mut visit: impl FnMut(usize, usize, ChunkClaim)) {
        for x in 0..REGION_SIDE {
            for z in 0..REGION_SIDE {
                if let Some(claim) = self.get(x, z) {
                    visit(x, z, claim);
                }
            }
        }
    }

    /// Sync indices per palette slot, `None` for the reserved and vacated slots.
    pub fn palette_sync_indices(&self) -> Vec<Option<u32>> {
        self.palette
            .iter()
            .map(|slot| slot.as_ref().map(|entry| entry.claim.sync_index))
            .collect()
    }

    pub fn words(&self) -> &[u64] {
        self.cells.words()
    }

    /// Copy restricted to cells whose claim passes `keep`.
    pub fn filtered(&self, mut keep: impl FnMut(&ChunkClaim) -> bool) -> PaletteRegionStore {
        let mut copy = PaletteRegionStore::new();
        self.for_each_claimed(|x, z, claim| {
            if keep(&claim) {
                copy.set(x, z, Some(claim));
            }
        });
        copy
    }

    pub fn set(&mut self, x: usize, z: usize, value: Option<ChunkClaim>) -> PaletteChange {
        self.ensure_consistent();
        let cell = Self::cell_index(x, z);
        let current = self.cells.get(cell);
        let mut change = PaletteChange::default();

        let next = match value {
            None => 0,
            Some(claim) => match self.find(&claim) {
                Some(index) => index,
                None => {
                    change.added = Some(claim);
                    self.allocate(claim)
                }
            },
        };
        if next == current {
            return change;
        }

        self.cells.set(cell, next);
        if next != 0 {
            if let Some(entry) = self.palette[next].as_mut() {
                entry.holders += 1;
            }
        }
        if current != 0 {
            change.removed = self.release(current);
        }
        change
    }

    fn find(&self, claim: &ChunkClaim) -> Option<usize> {
        self.palette
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.as_ref().map(|entry| &entry.claim) == Some(claim))
            .map(|(index, _)| index)
    }

    fn allocate(&mut self, claim: ChunkClaim) -> usize {
        let entry = Some(PaletteEntry { claim, holders: 0 });
        let vacated = self
            .palette
            .iter()
            .skip(1)
            .position(|slot| slot.is_none())
            .map(|offset| offset + 1);
        match vacated {
            Some(index) => {
                self.palette[index] = entry;
                index
            }
            None => {
                self.palette.push(entry);
                self.fit_width();
                self.palette.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> Option<ChunkClaim> {
        let entry = self.palette[index].as_mut()?;
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders > 0 {
            return None;
        }
        let removed = entry.claim;
        self.palette[index] = None;
        while self.palette.len() > 1 && self.palette.last().is_some_and(|slot| slot.is_none()) {
            self.palette.pop();
        }
        self.fit_width();
        Some(removed)
    }

    fn fit_width(&mut self) {
        let required = required_bits(self.palette.len());
        let current = self.cells.bits();
        if current < required || current >= required * 2 {
            self.cells = self.cells.repacked(required);
        }
    }

    fn ensure_consistent(&mut self) {
        if self.holders == HolderState::Consistent {
            return;
        }
        for slot in self.palette.iter_mut().flatten() {
            slot.holders = 0;
        }
        for cell in 0..REGION_CELLS {
            let index = self.cells.get(cell);
            if index == 0 {
                continue;
            }
            match self.palette.get_mut(index).and_then(|slot| slot.as_mut()) {
                Some(entry) => entry.holders += 1,
                // unresolved or out-of-range index
                None => self.cells.set(cell, 0),
            }
        }
        for slot in self.palette.iter_mut().skip(1) {
            if slot.is_some_and(|entry| entry.holders == 0) {
                *slot = None;
            }
        }
        while self.palette.len() > 1 && self.palette.last().is_some_and(|slot| slot.is_none()) {
            self.palette.pop();
        }
        self.holders = HolderState::Consistent;
        self.fit_width();
    }
}
