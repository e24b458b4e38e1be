/// Handle to one registered metric.
///
/// `index` is the slot in the store; `generation` is the slot's reuse count
/// at the time the handle was issued. A handle whose generation no longer
/// matches its slot is stale and every store rejects it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    pub index: u32,
    pub generation: u32,
}

impl EntryHandle {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        EntryHandle { index, generation }
    }
}
