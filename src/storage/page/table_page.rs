use crate::common::{PageId, Result, SlotId, StratumError, INVALID_PAGE_ID, PAGE_SIZE};

/// Slotted tuple page:
///
/// +------------------+
/// | Header (8 B)     |  next_page_id (4), num_slots (2), free_space_end (2)
/// +------------------+
/// | Slot Array       |  grows downward, 6 B per slot
/// +------------------+
/// | Free Space       |
/// +------------------+
/// | Tuple Data       |  grows upward from the page end
/// +------------------+
///
/// Each slot holds (offset u16, length u16, meta u16). The meta word keeps
/// the tuple's deletion flag so transaction aborts can flip it in place.
const NEXT_PAGE_ID_OFFSET: usize = 0;
const NUM_SLOTS_OFFSET: usize = 4;
const FREE_SPACE_END_OFFSET: usize = 6;
const HEADER_SIZE: usize = 8;

const SLOT_SIZE: usize = 6;
const META_DELETED_BIT: u16 = 1;

/// Per-tuple metadata kept in the slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleMeta {
    pub is_deleted: bool,
}

impl TupleMeta {
    fn to_word(self) -> u16 {
        if self.is_deleted {
            META_DELETED_BIT
        } else {
            0
        }
    }

    fn from_word(word: u16) -> Self {
        Self {
            is_deleted: word & META_DELETED_BIT != 0,
        }
    }
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn write_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn slot_offset(slot: usize) -> usize {
    HEADER_SIZE + slot * SLOT_SIZE
}

/// Read-only view over a table page.
pub struct TablePageRef<'a> {
    data: &'a [u8],
}

impl<'a> TablePageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn next_page_id(&self) -> PageId {
        PageId::new(u32::from_le_bytes(
            self.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4]
                .try_into()
                .unwrap(),
        ))
    }

    pub fn tuple_count(&self) -> usize {
        read_u16(self.data, NUM_SLOTS_OFFSET) as usize
    }

    fn free_space_end(&self) -> usize {
        read_u16(self.data, FREE_SPACE_END_OFFSET) as usize
    }

    pub fn free_space(&self) -> usize {
        self.free_space_end()
            .saturating_sub(slot_offset(self.tuple_count()))
    }

    pub fn tuple_meta(&self, slot_id: SlotId) -> Option<TupleMeta> {
        if slot_id.as_usize() >= self.tuple_count() {
            return None;
        }
        Some(TupleMeta::from_word(read_u16(
            self.data,
            slot_offset(slot_id.as_usize()) + 4,
        )))
    }

    pub fn tuple(&self, slot_id: SlotId) -> Option<&'a [u8]> {
        if slot_id.as_usize() >= self.tuple_count() {
            return None;
        }
        let base = slot_offset(slot_id.as_usize());
        let offset = read_u16(self.data, base) as usize;
        let length = read_u16(self.data, base + 2) as usize;
        Some(&self.data[offset..offset + length])
    }
}

/// Mutable view over a table page.
pub struct TablePage<'a> {
    data: &'a mut [u8],
}

impl<'a> TablePage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn as_ref(&self) -> TablePageRef<'_> {
        TablePageRef { data: self.data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
        self.set_next_page_id(INVALID_PAGE_ID);
        write_u16(self.data, NUM_SLOTS_OFFSET, 0);
        write_u16(self.data, FREE_SPACE_END_OFFSET, PAGE_SIZE as u16);
    }

    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.data[NEXT_PAGE_ID_OFFSET..NEXT_PAGE_ID_OFFSET + 4]
            .copy_from_slice(&page_id.as_u32().to_le_bytes());
    }

    /// Appends a tuple, returning its slot. None when the page cannot fit
    /// the tuple plus its slot entry.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Option<SlotId> {
        let view = self.as_ref();
        let count = view.tuple_count();
        let free_end = view.free_space_end();

        if tuple.len() + SLOT_SIZE > free_end.saturating_sub(slot_offset(count)) {
            return None;
        }

        let new_end = free_end - tuple.len();
        self.data[new_end..free_end].copy_from_slice(tuple);

        let base = slot_offset(count);
        write_u16(self.data, base, new_end as u16);
        write_u16(self.data, base + 2, tuple.len() as u16);
        write_u16(self.data, base + 4, TupleMeta { is_deleted: false }.to_word());

        write_u16(self.data, NUM_SLOTS_OFFSET, (count + 1) as u16);
        write_u16(self.data, FREE_SPACE_END_OFFSET, new_end as u16);

        Some(SlotId::new(count as u16))
    }

    pub fn set_tuple_meta(&mut self, slot_id: SlotId, meta: TupleMeta) -> Result<()> {
        if slot_id.as_usize() >= self.as_ref().tuple_count() {
            return Err(StratumError::TupleNotFound(crate::common::RecordId::new(
                INVALID_PAGE_ID,
                slot_id,
            )));
        }
        write_u16(
            self.data,
            slot_offset(slot_id.as_usize()) + 4,
            meta.to_word(),
        );
        Ok(())
    }
}
