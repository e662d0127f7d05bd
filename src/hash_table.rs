//! A swiss-table hash engine scanned a SIMD register at a time.
//!
//! The table is open-addressed: a single allocation holds the entry array
//! followed by one control byte per bucket. A control byte is `Empty`,
//! `Deleted` (a tombstone), or `Full` carrying the low 7 bits of the entry's
//! hash. Lookups hash the key once, take the starting bucket from the hash
//! masked by the (power-of-two) bucket count, and compare the 7-bit tag
//! against a whole group of control bytes with one vector operation. Lanes
//! whose tag matches are confirmed with the caller's equality predicate; the
//! probe ends at the first group containing an `Empty` byte. Groups advance
//! quadratically, with a stride that grows by the group width each step,
//! which visits every window exactly once per cycle on a power-of-two table.
//!
//! ## Design
//!
//! All data lives in one contiguous allocation:
//! `[ Entries | Control bytes | Mirror ]`
//!
//! The control array carries `Group::WIDTH` trailing bytes that mirror its
//! first `Group::WIDTH` bytes, so a vector load at *any* starting position
//! in `0..buckets` stays in bounds and observes wrapped metadata. Every
//! control write goes through `set_ctrl`, which updates both the byte and
//! its mirror; nothing else writes control bytes, which is what keeps the
//! mirror trustworthy.
//!
//! Tags are the low 7 bits of the hash, while the starting bucket comes from
//! the full hash masked down. The high bit of a control byte is reserved:
//! clear means occupied, set means `Empty` (`0xff`) or `Deleted` (`0x80`).
//! This makes "find a reusable slot" a single sign-bit mask and guarantees a
//! tag compare can never match a special byte.
//!
//! Removal only leaves a tombstone when a probe chain might actually pass
//! through the slot: if the group before the slot and the group starting at
//! it both contain an `Empty` byte close enough together, no full window
//! ever covered the slot and it returns to `Empty` directly, giving the
//! insert budget back. Tables that accumulate tombstones are rebuilt in
//! place, without allocating, whenever the live entries would fit in half
//! the current buckets: every `Full` byte is flipped to `Deleted`, every
//! special byte to `Empty`, and each flagged entry is then re-placed by its
//! hash, moving or swapping only when its probe window changed.
//!
//! Growth targets a 7/8 load factor. `growth_left` tracks how many more
//! inserts the table absorbs before the next resize or rehash; writing over
//! a tombstone does not consume it, because the tombstone already paid for
//! its slot. An unallocated table points its control pointer at a shared
//! static run of `Empty` bytes, so probing a fresh table terminates without
//! touching the allocator; the static run is never written because any
//! mutation allocates first.
//!
//! [`HashTable<V>`] stores values of type `V` and requires the caller to
//! provide the hash value and predicates for each operation. Prefer the
//! [`HashMap<K, V>`] or [`HashSet<V>`] wrappers unless you are building your
//! own map or set structure on top.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Occupancy**: `entries[i]` is initialized exactly when `ctrl[i]` has
//!    its high bit clear. `items` equals the number of such buckets.
//! 2. **Mirror**: after every operation a group load at any position in
//!    `0..buckets` observes the same bytes it would if the control array
//!    wrapped around, because `set_ctrl` maintains the trailing mirror.
//! 3. **Findability**: every full bucket is reachable from its hash's
//!    starting position before the probe sees an `Empty` byte.
//! 4. **Budget**: `items + growth_left` never exceeds the capacity of the
//!    current bucket count, which keeps at least one `Empty` byte per probe
//!    cycle and guarantees probes terminate.
//!
//! [`HashMap<K, V>`]: crate::hash_map::HashMap
//! [`HashSet<V>`]: crate::hash_set::HashSet

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use core::ptr::NonNull;

use crate::error::Error;
use crate::error::Result;
use crate::group::is_full;
use crate::group::is_special;
use crate::group::special_is_empty;
use crate::group::tag;
use crate::group::Group;
use crate::group::DELETED;
use crate::group::EMPTY;

/// Number of buckets required to hold `cap` entries at the 7/8 target load.
#[inline]
fn capacity_to_buckets(cap: usize) -> Result<usize> {
    if cap < 8 {
        // Tables this small keep one slot free instead of applying the load
        // factor.
        return Ok(if cap < 4 { 4 } else { 8 });
    }

    let adjusted = cap.checked_mul(8).ok_or(Error::CapacityOverflow)? / 7;
    adjusted
        .checked_next_power_of_two()
        .ok_or(Error::CapacityOverflow)
}

/// Number of entries a table with the given mask can hold while always
/// keeping at least one `Empty` byte per probe cycle.
#[inline]
fn bucket_mask_to_capacity(bucket_mask: usize) -> usize {
    if bucket_mask < 8 {
        bucket_mask
    } else {
        ((bucket_mask + 1) / 8) * 7
    }
}

/// Growth policy: half again the current capacity, or exactly enough for the
/// requested count, whichever is larger.
#[inline]
fn grow_capacity(count: usize, capacity: usize) -> usize {
    usize::max(capacity.saturating_add(capacity / 2), count)
}

/// Shrink policy: shrink to fit the live count, with hysteresis so a trim
/// only pays for a resize once occupancy has fallen to 5/8 of capacity.
#[inline]
fn shrink_capacity(count: usize, capacity: usize) -> usize {
    if count > capacity.saturating_mul(5) / 8 {
        capacity
    } else {
        count
    }
}

/// Quadratic prober over group windows.
///
/// Yields the starting position, then advances by a stride that grows by the
/// group width each step. On a power-of-two table every window is visited
/// exactly once before `next` returns `None`.
struct Probe {
    position: usize,
    stride: usize,
}

impl Probe {
    #[inline(always)]
    fn new(position: usize) -> Self {
        Probe {
            position,
            stride: 0,
        }
    }

    #[inline(always)]
    fn next(&mut self, mask: usize) -> Option<usize> {
        if self.stride > mask {
            return None;
        }

        let position = self.position;
        self.stride += Group::WIDTH;
        self.position = (self.position + self.stride) & mask;
        Some(position)
    }
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    ctrl_offset: usize,
}

impl DataLayout {
    const EMPTY: DataLayout = DataLayout {
        layout: Layout::new::<()>(),
        ctrl_offset: 0,
    };

    /// Computes the single-allocation layout for `buckets` buckets: entries
    /// at offset zero, control bytes (plus the trailing mirror) after them,
    /// rounded up so the control array is group-aligned.
    fn new<V>(buckets: usize) -> Result<Self> {
        debug_assert!(buckets.is_power_of_two());

        let align = usize::max(mem::align_of::<V>(), Group::WIDTH);
        let ctrl_offset = mem::size_of::<V>()
            .checked_mul(buckets)
            .and_then(|bytes| bytes.checked_add(align - 1))
            .ok_or(Error::CapacityOverflow)?
            & !(align - 1);
        let len = ctrl_offset
            .checked_add(buckets + Group::WIDTH)
            .ok_or(Error::CapacityOverflow)?;
        if len > isize::MAX as usize - (align - 1) {
            return Err(Error::CapacityOverflow);
        }

        // SAFETY: `len` is non-zero, rounds up to `align` without exceeding
        // `isize::MAX`, and `align` is a power of two.
        let layout = unsafe { Layout::from_size_align_unchecked(len, align) };
        Ok(DataLayout {
            layout,
            ctrl_offset,
        })
    }
}

/// A swiss-table hash engine storing values of type `V`.
///
/// `HashTable<V>` provides fast insertion, lookup, and removal. Unlike
/// standard hash maps, this implementation requires you to provide the hash
/// value and an equality predicate for each operation; mutating operations
/// that may relocate entries additionally take a `rehash` closure that
/// recomputes the hash of a stored value.
///
/// Operations that may allocate return a [`Result`] and leave the table
/// unchanged when allocation fails.
///
/// ## Performance Characteristics
///
/// - **Memory**: 1 byte per bucket overhead, plus the size of `V`, at a 7/8
///   maximum load factor.
pub struct HashTable<V> {
    /// Number of buckets; either zero (unallocated) or a power of two.
    buckets: usize,
    layout: DataLayout,
    /// Base of the allocation; entries live at offset zero. Dangling while
    /// `buckets == 0`.
    alloc: NonNull<u8>,
    /// Start of the control array. Aliases the shared static `Empty` run
    /// while `buckets == 0`; zero-bucket tables never write control bytes.
    ctrl: NonNull<u8>,
    /// Inserts tolerated before the next resize or in-place rehash.
    growth_left: usize,
    items: usize,
    _marker: PhantomData<V>,
}

// SAFETY: The table owns its allocation and its values, and only hands out
// references through `&self`/`&mut self` methods, so it is Send/Sync exactly
// when the stored values are.
unsafe impl<V> Send for HashTable<V> where V: Send {}
unsafe impl<V> Sync for HashTable<V> where V: Sync {}

impl<V> HashTable<V> {
    /// Creates a new table without allocating.
    ///
    /// The first insert allocates; until then probes read a shared static
    /// run of `Empty` control bytes and terminate immediately.
    pub fn new() -> Self {
        Self {
            buckets: 0,
            layout: DataLayout::EMPTY,
            alloc: NonNull::dangling(),
            // SAFETY: The static run is read-only for every zero-bucket
            // table; any mutation allocates first, replacing this pointer.
            ctrl: unsafe { NonNull::new_unchecked(Group::static_empty().as_ptr() as *mut u8) },
            growth_left: 0,
            items: 0,
            _marker: PhantomData,
        }
    }

    /// Creates a new hash table with room for at least `capacity` entries.
    ///
    /// The actual capacity may be larger than requested due to the
    /// power-of-two bucket organization.
    ///
    /// # Panics
    ///
    /// Panics on capacity overflow and aborts via `handle_alloc_error` if
    /// the allocator fails; use [`try_with_capacity`] to handle both.
    ///
    /// [`try_with_capacity`]: HashTable::try_with_capacity
    pub fn with_capacity(capacity: usize) -> Self {
        match Self::try_with_capacity(capacity) {
            Ok(table) => table,
            Err(Error::AllocationFailure { layout }) => handle_alloc_error(layout),
            Err(Error::CapacityOverflow) => panic!("capacity overflow"),
        }
    }

    /// Fallible version of [`with_capacity`].
    ///
    /// # Errors
    ///
    /// Returns an error on capacity overflow or allocation failure.
    ///
    /// [`with_capacity`]: HashTable::with_capacity
    pub fn try_with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Ok(Self::new());
        }
        Self::new_uninitialized(capacity_to_buckets(capacity)?)
    }

    /// Allocates a table with the exact bucket count, all control bytes
    /// `Empty` and no entries.
    fn new_uninitialized(buckets: usize) -> Result<Self> {
        debug_assert!(buckets.is_power_of_two());

        let layout = DataLayout::new::<V>(buckets)?;
        // SAFETY: The layout has non-zero size because it covers at least
        // `buckets + Group::WIDTH` control bytes.
        let base = unsafe { alloc::alloc::alloc(layout.layout) };
        let Some(base) = NonNull::new(base) else {
            return Err(Error::AllocationFailure {
                layout: layout.layout,
            });
        };
        // SAFETY: The control array spans `buckets + Group::WIDTH` bytes
        // starting at `ctrl_offset`, all inside the fresh allocation.
        let ctrl = unsafe {
            let ctrl = base.as_ptr().add(layout.ctrl_offset);
            ptr::write_bytes(ctrl, EMPTY, buckets + Group::WIDTH);
            NonNull::new_unchecked(ctrl)
        };

        Ok(Self {
            buckets,
            layout,
            alloc: base,
            ctrl,
            growth_left: bucket_mask_to_capacity(buckets - 1),
            items: 0,
            _marker: PhantomData,
        })
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.items
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    /// Returns how many more entries the table can hold before its next
    /// resize or in-place rehash, plus the current element count.
    ///
    /// Tombstones consume budget silently, so this can sit below the
    /// table's nominal 7/8 load limit until a rehash reclaims them.
    pub fn capacity(&self) -> usize {
        self.items + self.growth_left
    }

    /// Returns the current bucket count: zero for an unallocated table,
    /// otherwise a power of two.
    pub fn num_buckets(&self) -> usize {
        self.buckets
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.buckets.saturating_sub(1)
    }

    #[inline(always)]
    fn num_ctrl_bytes(&self) -> usize {
        self.buckets + Group::WIDTH
    }

    /// Returns a pointer to the control byte at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be less than `self.num_ctrl_bytes()`. On an unallocated
    /// table the result is valid for reads only.
    #[inline(always)]
    unsafe fn ctrl_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.num_ctrl_bytes());
        // SAFETY: Caller ensures `index` is within the control array.
        unsafe { self.ctrl.as_ptr().add(index) }
    }

    /// Returns a pointer to the entry at `index`.
    ///
    /// # Safety
    ///
    /// The table must be allocated and `index` must be less than
    /// `self.buckets`. The pointee is initialized only while `ctrl[index]`
    /// is full.
    #[inline(always)]
    unsafe fn entry_ptr(&self, index: usize) -> *mut V {
        debug_assert!(index < self.buckets);
        // SAFETY: Entries start at offset zero of the allocation; caller
        // ensures `index` is a valid bucket of an allocated table.
        unsafe { self.alloc.as_ptr().cast::<V>().add(index) }
    }

    /// Writes a control byte together with its mirror so that group loads
    /// at any position in `0..buckets` observe the same value.
    ///
    /// # Safety
    ///
    /// The table must be allocated and `index` must be less than
    /// `self.buckets`.
    #[inline]
    unsafe fn set_ctrl(&mut self, index: usize, ctrl: u8) {
        debug_assert!(index < self.buckets);

        let mirror = (index.wrapping_sub(Group::WIDTH) & self.mask()) + Group::WIDTH;
        // SAFETY: `index < buckets` and `mirror < buckets + Group::WIDTH`,
        // so both writes land inside the control array. For indices past the
        // first group the mirror collapses onto the index itself.
        unsafe {
            *self.ctrl_ptr(index) = ctrl;
            *self.ctrl_ptr(mirror) = ctrl;
        }
    }

    #[inline(always)]
    fn probe(&self, hash: u64) -> Probe {
        Probe::new((hash as usize) & self.mask())
    }

    /// Walks the probe sequence for `hash`, confirming tag-matching lanes
    /// with `eq`. Aborts at the first group containing an `Empty` byte.
    #[inline]
    fn find_inner(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        let tag = tag(hash);
        let mut probe = self.probe(hash);

        while let Some(position) = probe.next(self.mask()) {
            // SAFETY: `position` is masked into `0..buckets` (or zero on an
            // unallocated table, whose static control run is a full group),
            // and the control array always extends `Group::WIDTH` bytes past
            // any valid position.
            let group = unsafe { Group::load(self.ctrl_ptr(position)) };

            for bit in group.match_tag(tag) {
                let index = (position + bit) & self.mask();
                // SAFETY: A tag match means `ctrl[index]` is full, so the
                // entry at `index` is initialized.
                if eq(unsafe { &*self.entry_ptr(index) }) {
                    return Some(index);
                }
            }

            if group.match_empty().any_bit_set() {
                return None;
            }
        }

        None
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// Returns a reference to the value if found, or `None` if no matching
    /// value exists.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value to search for
    /// * `eq` - A predicate function that returns `true` for the desired
    ///   value
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        if self.items == 0 {
            return None;
        }

        let index = self.find_inner(hash, &eq)?;
        // SAFETY: `find_inner` only returns indices of full buckets.
        Some(unsafe { &*self.entry_ptr(index) })
    }

    /// Finds a value in the table by hash and equality predicate, returning
    /// a mutable reference.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        if self.items == 0 {
            return None;
        }

        let index = self.find_inner(hash, &eq)?;
        // SAFETY: `find_inner` only returns indices of full buckets.
        Some(unsafe { &mut *self.entry_ptr(index) })
    }

    /// Returns the bucket index of the matching value, if present.
    ///
    /// The index is only meaningful until the next mutation of the table;
    /// resizes and rehashes relocate entries.
    #[inline]
    pub fn find_index(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        if self.items == 0 {
            return None;
        }
        self.find_inner(hash, &eq)
    }

    /// Returns `true` if the table contains a matching value.
    #[inline]
    pub fn contains(&self, hash: u64, eq: impl Fn(&V) -> bool) -> bool {
        self.find_index(hash, eq).is_some()
    }

    /// Probes for the first `Empty` or `Deleted` slot reachable from the
    /// hash's starting position.
    ///
    /// Returns `None` only if the probe exhausts every window without
    /// seeing a special byte, which cannot happen while the growth budget
    /// holds.
    #[inline]
    fn find_insert_slot(&self, hash: u64) -> Option<usize> {
        let mut probe = self.probe(hash);

        while let Some(position) = probe.next(self.mask()) {
            // SAFETY: Same bounds argument as in `find_inner`.
            let group = unsafe { Group::load(self.ctrl_ptr(position)) };

            if let Some(bit) = group.match_empty_or_deleted().lowest_set_bit() {
                let mut index = (position + bit) & self.mask();

                // In tables smaller than a group, the bytes between the
                // mirror and the end of the window are Empty but wrap onto
                // buckets that may be full once masked. Re-scan the aligned
                // group at position zero, where every real slot of such a
                // table is visible.
                // SAFETY: `index` was masked into the control array.
                if unsafe { is_full(*self.ctrl_ptr(index)) } {
                    debug_assert!(self.buckets < Group::WIDTH);
                    // SAFETY: Position zero is valid and the control array
                    // is group-aligned; a table this small always keeps at
                    // least one Empty slot, so the mask is non-zero.
                    let fallback =
                        unsafe { Group::load_aligned(self.ctrl_ptr(0)) }.match_empty_or_deleted();
                    debug_assert!(fallback.any_bit_set());
                    index = fallback.trailing_zeros();
                }

                return Some(index);
            }
        }

        None
    }

    /// Locates a slot for a new entry with the given hash, growing or
    /// rehashing first when the insert budget is exhausted.
    ///
    /// The returned slot is `Empty` or `Deleted`; the caller fills it with
    /// `record_insert`.
    fn prepare_insert_slot(&mut self, hash: u64, rehash: &dyn Fn(&V) -> u64) -> Result<usize> {
        if let Some(index) = self.find_insert_slot(hash) {
            // Writing over a tombstone keeps probe chains intact, so it
            // does not consume the insert budget; only an Empty target
            // forces growth.
            // SAFETY: `find_insert_slot` yields in-bounds indices.
            if self.growth_left != 0 || !unsafe { special_is_empty(*self.ctrl_ptr(index)) } {
                return Ok(index);
            }
        }

        self.grow_or_rehash(1, rehash)?;

        match self.find_insert_slot(hash) {
            Some(index) => Ok(index),
            // A freshly grown or rehashed table has Empty slots on every
            // probe path.
            None => unreachable!("no free slot after growing"),
        }
    }

    /// Fills a reserved slot with `value`.
    ///
    /// # Safety
    ///
    /// The table must be allocated, `index` must come from
    /// `prepare_insert_slot` with no intervening mutation, and the slot's
    /// control byte must still be `Empty` or `Deleted`.
    unsafe fn record_insert(&mut self, index: usize, hash: u64, value: V) {
        // SAFETY: Caller guarantees `index` is a reserved in-bounds slot.
        unsafe {
            let old_ctrl = *self.ctrl_ptr(index);
            debug_assert!(is_special(old_ctrl));
            debug_assert!(self.growth_left > 0 || !special_is_empty(old_ctrl));

            self.growth_left -= special_is_empty(old_ctrl) as usize;
            self.set_ctrl(index, tag(hash));
            self.entry_ptr(index).write(value);
        }
        self.items += 1;
    }

    /// Inserts a value into the table.
    ///
    /// Returns `true` if the value was inserted, or `false` if an equal
    /// value was already present, in which case the table is unchanged and
    /// `value` is dropped.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value of `value`
    /// * `eq` - A predicate returning `true` for values equal to `value`
    /// * `rehash` - Recomputes the hash of a stored value; used when the
    ///   insert forces a resize or rehash
    ///
    /// # Errors
    ///
    /// Returns an error if the insert forces a resize and allocation fails;
    /// the table is unchanged in that case.
    pub fn insert(
        &mut self,
        hash: u64,
        value: V,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<bool> {
        if self.find_inner(hash, &eq).is_some() {
            return Ok(false);
        }

        let index = self.prepare_insert_slot(hash, &rehash)?;
        // SAFETY: `prepare_insert_slot` reserved this slot.
        unsafe { self.record_insert(index, hash, value) };
        Ok(true)
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// The returned [`Entry`] allows insertion or in-place modification
    /// without a second lookup. Any growth a subsequent insertion would
    /// need happens *before* the entry is returned, so
    /// [`VacantEntry::insert`] cannot fail and references derived from the
    /// entry stay valid until the next mutation of the table.
    ///
    /// # Errors
    ///
    /// Returns an error if reserving room for a potential insert fails; the
    /// table is unchanged in that case.
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<Entry<'_, V>> {
        if let Some(index) = self.find_inner(hash, &eq) {
            return Ok(Entry::Occupied(OccupiedEntry { table: self, index }));
        }

        let index = self.prepare_insert_slot(hash, &rehash)?;
        Ok(Entry::Vacant(VacantEntry {
            table: self,
            hash,
            index,
        }))
    }

    /// Removes and returns a value from the table.
    ///
    /// Returns `None` if no matching value exists; removing an absent value
    /// is not an error.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value of the entry to remove
    /// * `eq` - A predicate function that returns `true` for the value to
    ///   remove
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        if self.items == 0 {
            return None;
        }

        let index = self.find_inner(hash, &eq)?;
        // SAFETY: `find_inner` only returns indices of full buckets.
        Some(unsafe { self.remove_at(index) })
    }

    /// Removes the entry at `index` and returns its value.
    ///
    /// # Safety
    ///
    /// The table must be allocated and `ctrl[index]` must be full.
    unsafe fn remove_at(&mut self, index: usize) -> V {
        // SAFETY: Caller guarantees a full in-bounds slot, so the entry is
        // initialized and reading it out transfers ownership.
        unsafe {
            debug_assert!(is_full(*self.ctrl_ptr(index)));
            let value = self.entry_ptr(index).read();
            self.erase_ctrl(index);
            self.items -= 1;
            value
        }
    }

    /// Marks a removed slot `Empty` when no probe chain can pass through
    /// it, `Deleted` otherwise.
    ///
    /// # Safety
    ///
    /// The table must be allocated and `index` must be less than
    /// `self.buckets`.
    unsafe fn erase_ctrl(&mut self, index: usize) {
        // Only if a whole group's worth of bytes around the slot is free of
        // Empty bytes could some probe window covering it have been full,
        // which forces a tombstone; otherwise every covering window already
        // contained an Empty byte and the slot can return to Empty.
        // SAFETY: `index_before` is masked into `0..buckets` and both loads
        // stay within the mirrored control array.
        unsafe {
            let index_before = index.wrapping_sub(Group::WIDTH) & self.mask();
            let empty_before = Group::load(self.ctrl_ptr(index_before)).match_empty();
            let empty_after = Group::load(self.ctrl_ptr(index)).match_empty();

            if empty_before.leading_zeros() + empty_after.trailing_zeros() >= Group::WIDTH {
                self.set_ctrl(index, DELETED);
            } else {
                self.growth_left += 1;
                self.set_ctrl(index, EMPTY);
            }
        }
    }

    /// Removes a value, then shrinks the table one policy step.
    ///
    /// The shrink runs first so that an allocation failure leaves the table
    /// completely unchanged, matching entry included.
    ///
    /// # Errors
    ///
    /// Returns an error if the shrink has to reallocate and allocation
    /// fails; nothing is removed in that case.
    pub fn remove_and_shrink(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<Option<V>> {
        if self.items == 0 || self.find_inner(hash, &eq).is_none() {
            return Ok(None);
        }

        self.trim(&rehash)?;
        Ok(self.remove(hash, &eq))
    }

    /// Reserves capacity for at least `additional` more entries.
    ///
    /// May rehash in place instead of reallocating when reclaiming
    /// tombstones is enough. Does nothing if the budget already suffices.
    ///
    /// # Errors
    ///
    /// Returns an error on allocation failure or capacity overflow; the
    /// table is unchanged in that case.
    pub fn reserve(&mut self, additional: usize, rehash: impl Fn(&V) -> u64) -> Result<()> {
        if additional <= self.growth_left {
            return Ok(());
        }
        self.grow_or_rehash(additional, &rehash)
    }

    /// Shrinks the table to fit the live count, provided occupancy has
    /// fallen to at most 5/8 of the current capacity.
    ///
    /// An empty table is deallocated back to the zero-bucket state. This is
    /// the only operation that decreases the bucket count.
    ///
    /// # Errors
    ///
    /// Returns an error if the smaller table cannot be allocated; the table
    /// is unchanged in that case.
    pub fn trim(&mut self, rehash: impl Fn(&V) -> u64) -> Result<()> {
        if self.items == 0 {
            *self = Self::new();
            return Ok(());
        }

        let full_capacity = bucket_mask_to_capacity(self.mask());
        let new_capacity = shrink_capacity(self.items, full_capacity);
        if capacity_to_buckets(new_capacity)? < self.buckets {
            self.resize(new_capacity, &rehash)?;
        }
        Ok(())
    }

    /// Makes room for at least `additional` more entries: rehashes in place
    /// when the live entries would fit in half the current buckets, resizes
    /// otherwise.
    fn grow_or_rehash(&mut self, additional: usize, rehash: &dyn Fn(&V) -> u64) -> Result<()> {
        let desired = self
            .items
            .checked_add(additional)
            .ok_or(Error::CapacityOverflow)?;

        if self.buckets > 0 && capacity_to_buckets(desired)? <= self.buckets / 2 {
            // Tombstones are eating the budget; reclaim them without
            // allocating.
            self.rehash_in_place(rehash);
            return Ok(());
        }

        let full_capacity = bucket_mask_to_capacity(self.mask());
        let new_capacity = grow_capacity(desired, full_capacity);
        if capacity_to_buckets(new_capacity)? != self.buckets {
            self.resize(new_capacity, rehash)
        } else {
            self.rehash_in_place(rehash);
            Ok(())
        }
    }

    /// Whether `index` and `new_index` fall in the same probe window for
    /// `hash`. The subtraction wraps through the mask so positions on
    /// either side of the table boundary compare correctly.
    #[inline]
    fn same_probe_group(&self, hash: u64, index: usize, new_index: usize) -> bool {
        let start = (hash as usize) & self.mask();
        let probe_index =
            |position: usize| (position.wrapping_sub(start) & self.mask()) / Group::WIDTH;
        probe_index(index) == probe_index(new_index)
    }

    /// Reclaims tombstones without allocating.
    ///
    /// Every full byte becomes `Deleted` and every special byte `Empty`;
    /// each flagged entry is then re-placed by its hash. Entries whose
    /// target falls in the probe window they already occupy stay put, a
    /// move into an `Empty` target frees the source, and a move onto
    /// another flagged entry swaps so the displaced entry is re-placed in
    /// turn.
    #[cold]
    fn rehash_in_place(&mut self, rehash: &dyn Fn(&V) -> u64) {
        debug_assert!(self.buckets > 0);

        // SAFETY: The table is allocated; all group loads and stores stay
        // inside the control array, and entries are only read through
        // control bytes that mark them live (full before the conversion,
        // Deleted after it).
        unsafe {
            for position in (0..self.buckets).step_by(Group::WIDTH) {
                let group = Group::load_aligned(self.ctrl_ptr(position));
                group
                    .convert_special_to_empty_and_full_to_deleted()
                    .store_aligned(self.ctrl_ptr(position));
            }

            // Rebuild the mirror to match the rewritten front.
            if self.buckets < Group::WIDTH {
                ptr::copy_nonoverlapping(
                    self.ctrl_ptr(0),
                    self.ctrl_ptr(Group::WIDTH),
                    self.buckets,
                );
            } else {
                ptr::copy_nonoverlapping(
                    self.ctrl_ptr(0),
                    self.ctrl_ptr(self.buckets),
                    Group::WIDTH,
                );
            }

            'outer: for index in 0..self.buckets {
                if *self.ctrl_ptr(index) != DELETED {
                    continue;
                }

                let entry = self.entry_ptr(index);

                'inner: loop {
                    let hash = rehash(&*entry);

                    let new_index = match self.find_insert_slot(hash) {
                        Some(new_index) => new_index,
                        // The load factor keeps an Empty byte on every
                        // probe path even mid-rehash.
                        None => unreachable!("in-place rehash found no slot"),
                    };

                    if self.same_probe_group(hash, index, new_index) {
                        self.set_ctrl(index, tag(hash));
                        continue 'outer;
                    }

                    let new_entry = self.entry_ptr(new_index);
                    let old_ctrl = *self.ctrl_ptr(new_index);
                    self.set_ctrl(new_index, tag(hash));

                    if old_ctrl == EMPTY {
                        ptr::copy_nonoverlapping(entry, new_entry, 1);
                        self.set_ctrl(index, EMPTY);
                        continue 'outer;
                    }

                    // The target still holds a displaced entry; swap and
                    // re-place it from this slot.
                    debug_assert_eq!(old_ctrl, DELETED);
                    ptr::swap(entry, new_entry);
                    continue 'inner;
                }
            }

            self.growth_left = bucket_mask_to_capacity(self.mask()) - self.items;
        }
    }

    /// Moves every live entry into a freshly allocated table with room for
    /// `capacity` entries, then frees the old allocation.
    #[cold]
    fn resize(&mut self, capacity: usize, rehash: &dyn Fn(&V) -> u64) -> Result<()> {
        debug_assert!(capacity >= self.items);

        let mut new_table = Self::try_with_capacity(capacity)?;

        // SAFETY: Every full slot of the old table holds an initialized
        // entry, each is moved exactly once, and the fresh table has no
        // tombstones and enough Empty slots for all of them. The old
        // allocation is freed without dropping moved-out values because
        // `items` is zeroed before the old table is dropped.
        unsafe {
            for index in 0..self.buckets {
                if !is_full(*self.ctrl_ptr(index)) {
                    continue;
                }

                let entry = self.entry_ptr(index);
                let hash = rehash(&*entry);
                let new_index = match new_table.find_insert_slot(hash) {
                    Some(new_index) => new_index,
                    None => unreachable!("resized table has no free slot"),
                };

                new_table.set_ctrl(new_index, tag(hash));
                ptr::copy_nonoverlapping(entry, new_table.entry_ptr(new_index), 1);
            }

            new_table.growth_left -= self.items;
            new_table.items = self.items;
        }

        let mut old = mem::replace(self, new_table);
        // The old table's entries were moved out above; dropping it must
        // only free the allocation.
        old.items = 0;
        Ok(())
    }

    /// Removes all elements from the table, keeping the allocated capacity.
    ///
    /// All values are dropped and every control byte returns to `Empty`.
    pub fn clear(&mut self) {
        if self.buckets == 0 {
            return;
        }

        // SAFETY: Full control bytes mark initialized entries; after the
        // drops the whole control array (mirror included) is reset so no
        // value can be observed or dropped twice.
        unsafe {
            if mem::needs_drop::<V>() && self.items > 0 {
                for index in 0..self.buckets {
                    if is_full(*self.ctrl_ptr(index)) {
                        ptr::drop_in_place(self.entry_ptr(index));
                    }
                }
            }
            ptr::write_bytes(self.ctrl.as_ptr(), EMPTY, self.num_ctrl_bytes());
        }

        self.items = 0;
        self.growth_left = bucket_mask_to_capacity(self.mask());
    }

    /// Returns an iterator over all values in the table.
    ///
    /// The iterator yields `&V` references in an arbitrary order.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            index: 0,
        }
    }

    /// Returns an iterator that removes and yields all values from the
    /// table.
    ///
    /// After calling `drain()` the table is empty but keeps its capacity.
    /// Dropping the iterator drops any unyielded values; leaking it with
    /// `mem::forget` leaks them instead.
    pub fn drain(&mut self) -> Drain<'_, V> {
        if self.buckets == 0 {
            return Drain {
                ctrl: alloc::vec::Vec::new().into_boxed_slice(),
                table: self,
                index: 0,
            };
        }

        // Snapshot the control bytes and reset the table first, so a leaked
        // iterator cannot make the table double-drop values it no longer
        // owns.
        // SAFETY: The control array is valid for `buckets` reads, and after
        // the reset the table is consistent with `items == 0`.
        let ctrl: Box<[u8]> = unsafe {
            let snapshot = core::slice::from_raw_parts(self.ctrl.as_ptr(), self.buckets);
            let snapshot = Box::from(snapshot);
            ptr::write_bytes(self.ctrl.as_ptr(), EMPTY, self.num_ctrl_bytes());
            snapshot
        };

        self.items = 0;
        self.growth_left = bucket_mask_to_capacity(self.mask());

        Drain {
            ctrl,
            table: self,
            index: 0,
        }
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::String;
        use alloc::string::ToString;
        use alloc::vec::Vec;

        if self.buckets == 0 {
            return f
                .debug_struct("HashTable")
                .field("ctrl", &"unallocated")
                .field("items", &self.items)
                .field("capacity", &self.capacity())
                .finish();
        }

        // SAFETY: The table is allocated, so the control array is valid for
        // `buckets` reads.
        let ctrl = unsafe { core::slice::from_raw_parts(self.ctrl.as_ptr(), self.buckets) };
        let groups = ctrl
            .chunks(Group::WIDTH)
            .map(|window| {
                window
                    .iter()
                    .map(|&byte| match byte {
                        EMPTY => "..".to_string(),
                        DELETED => "xx".to_string(),
                        byte => format!("{byte:02x}"),
                    })
                    .collect::<Vec<String>>()
                    .join(" ")
            })
            .collect::<Vec<String>>();

        f.debug_struct("HashTable")
            .field("ctrl", &groups)
            .field("items", &self.items)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        if self.buckets == 0 {
            return Self::new();
        }

        let mut new_table = match Self::new_uninitialized(self.buckets) {
            Ok(table) => table,
            Err(Error::AllocationFailure { layout }) => handle_alloc_error(layout),
            Err(Error::CapacityOverflow) => unreachable!("layout was valid for the source"),
        };

        // Clone the values while the new control bytes are still all Empty:
        // a panicking clone then leaks the finished copies instead of
        // letting the new table drop uninitialized slots.
        // SAFETY: Full slots of the source are initialized; destination
        // slots occupy the same positions of an equal-sized table.
        unsafe {
            for index in 0..self.buckets {
                if is_full(*self.ctrl_ptr(index)) {
                    new_table
                        .entry_ptr(index)
                        .write((*self.entry_ptr(index)).clone());
                }
            }

            // Copy the control bytes wholesale, tombstones included, so
            // every probe chain in the clone matches the source.
            ptr::copy_nonoverlapping(
                self.ctrl.as_ptr(),
                new_table.ctrl.as_ptr(),
                self.num_ctrl_bytes(),
            );
        }

        new_table.items = self.items;
        new_table.growth_left = self.growth_left;
        new_table
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: Full control bytes mark initialized entries, and the
        // allocation matches the stored layout. A table whose entries were
        // moved out (resize, drain) has `items == 0` and skips the drops.
        unsafe {
            if mem::needs_drop::<V>() && self.items > 0 {
                for index in 0..self.buckets {
                    if is_full(*self.ctrl_ptr(index)) {
                        ptr::drop_in_place(self.entry_ptr(index));
                    }
                }
            }

            if self.buckets != 0 {
                alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
            }
        }
    }
}

/// A view into a single entry in the table, which may be vacant or
/// occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, V> {
    /// A vacant entry - no matching value is present in the table
    Vacant(VacantEntry<'a, V>),
    /// An occupied entry - a matching value is present in the table
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts a value if the entry is vacant and returns a mutable
    /// reference to the entry's value either way.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts a value computed from a closure if the entry is vacant and
    /// returns a mutable reference to the entry's value either way.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry.
    ///
    /// Returns `None` without inserting anything if the entry is vacant.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Inserts `V::default()` if the entry is vacant and returns a mutable
    /// reference to the entry's value either way.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the table.
///
/// The slot was reserved when the entry was created, so inserting through
/// it never allocates and never fails.
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u64,
    index: usize,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the reserved slot and returns a mutable
    /// reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        // SAFETY: The slot was reserved by `entry` after any growth, and
        // the exclusive borrow rules out intervening mutation, so it is
        // still Empty or Deleted and in bounds.
        unsafe {
            self.table.record_insert(self.index, self.hash, value);
            &mut *self.table.entry_ptr(self.index)
        }
    }
}

// Safety invariant for OccupiedEntry methods:
// An `OccupiedEntry` is only created from an index returned by
// `find_inner`, and the exclusive borrow of the table rules out intervening
// mutation. This guarantees that:
// 1. `index` is within the bounds of the entry array.
// 2. `ctrl[index]` is full, so the slot holds an initialized value.
// Therefore dereferencing `entry_ptr(index)` is safe in the methods below.
/// A view into an occupied entry in the table.
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    index: usize,
}

impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: See safety invariant comment above the impl block.
        unsafe { &*self.table.entry_ptr(self.index) }
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: See safety invariant comment above the impl block.
        unsafe { &mut *self.table.entry_ptr(self.index) }
    }

    /// Converts the entry into a mutable reference to the value with the
    /// lifetime of the table borrow.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: See safety invariant comment above the impl block.
        unsafe { &mut *self.table.entry_ptr(self.index) }
    }

    /// Removes the entry from the table and returns the value.
    pub fn remove(self) -> V {
        // SAFETY: See safety invariant comment above the impl block.
        unsafe { self.table.remove_at(self.index) }
    }
}

/// An iterator over the values in a [`HashTable`].
///
/// This struct is created by the [`iter`] method on [`HashTable`]. It
/// yields `&V` references in an arbitrary order.
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    index: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `index` stays below `buckets` and full control bytes mark
        // initialized entries.
        unsafe {
            while self.index < self.table.buckets {
                let index = self.index;
                self.index += 1;

                if is_full(*self.table.ctrl_ptr(index)) {
                    return Some(&*self.table.entry_ptr(index));
                }
            }
        }

        None
    }
}

/// A draining iterator over the values in a [`HashTable`].
///
/// This struct is created by the [`drain`] method on [`HashTable`]. It
/// yields owned values and empties the table as it goes; dropping it drops
/// any values not yet yielded.
///
/// [`drain`]: HashTable::drain
pub struct Drain<'a, V> {
    /// Snapshot of the control bytes taken before the table was reset; the
    /// table itself no longer claims ownership of the entries.
    ctrl: Box<[u8]>,
    table: &'a mut HashTable<V>,
    index: usize,
}

impl<V> Iterator for Drain<'_, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: The snapshot length equals the bucket count of the still
        // allocated table, each full slot is read out exactly once, and the
        // table's own control bytes were reset before the snapshot was
        // handed out.
        unsafe {
            while self.index < self.ctrl.len() {
                let index = self.index;
                self.index += 1;

                if is_full(self.ctrl[index]) {
                    return Some(self.table.entry_ptr(index).read());
                }
            }
        }

        None
    }
}

impl<V> Drop for Drain<'_, V> {
    fn drop(&mut self) {
        for _ in &mut *self {}
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::hash::Hasher;

    use rand::rngs::OsRng;
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;
    use rand::TryRngCore;
    use siphasher::sip::SipHasher;

    use super::*;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn random() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn fixed() -> Self {
            Self {
                k0: 0x0123_4567_89ab_cdef,
                k1: 0xfedc_ba98_7654_3210,
            }
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i32,
    }

    fn hash_key(state: &HashState, key: u64) -> u64 {
        let mut h = SipHasher::new_with_keys(state.k0, state.k1);
        h.write_u64(key);
        h.finish()
    }

    /// Checks the structural invariants: the live count matches the full
    /// control bytes, the mirror agrees with the front of the array, the
    /// growth budget respects the capacity, and every stored key is
    /// reachable from its own hash.
    fn assert_invariants(table: &HashTable<Item>, state: &HashState) {
        let buckets = table.num_buckets();
        if buckets == 0 {
            assert_eq!(table.len(), 0);
            assert_eq!(table.capacity(), 0);
            return;
        }

        let ctrl =
            unsafe { core::slice::from_raw_parts(table.ctrl.as_ptr(), buckets + Group::WIDTH) };

        let full = ctrl[..buckets].iter().filter(|&&byte| is_full(byte)).count();
        assert_eq!(full, table.len(), "{table:#?}");

        if buckets >= Group::WIDTH {
            for offset in 0..Group::WIDTH {
                assert_eq!(ctrl[buckets + offset], ctrl[offset], "mirror at {offset}");
            }
        } else {
            for offset in 0..buckets {
                assert_eq!(
                    ctrl[Group::WIDTH + offset],
                    ctrl[offset],
                    "mirror at {offset}"
                );
            }
            for offset in buckets..Group::WIDTH {
                assert_eq!(ctrl[offset], EMPTY, "pad byte at {offset}");
            }
        }

        assert!(table.len() + table.growth_left <= bucket_mask_to_capacity(buckets - 1));

        for index in 0..buckets {
            if is_full(ctrl[index]) {
                let item = unsafe { &*table.entry_ptr(index) };
                let hash = hash_key(state, item.key);
                assert_eq!(tag(hash), ctrl[index], "tag of key {}", item.key);
                assert_eq!(
                    table.find_index(hash, |v| v.key == item.key),
                    Some(index),
                    "key {} not findable: {table:#?}",
                    item.key
                );
            }
        }
    }

    #[test]
    fn contains_on_unallocated_table() {
        let state = HashState::random();
        let table: HashTable<Item> = HashTable::new();

        assert_eq!(table.num_buckets(), 0);
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), 0);

        let hash = hash_key(&state, 42);
        assert!(!table.contains(hash, |v| v.key == 42));
        assert!(table.find(hash, |v| v.key == 42).is_none());
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..32u64 {
            let hash = hash_key(&state, k);
            let inserted = table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: (k as i32) * 2,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
            assert!(inserted, "{table:#?}");
        }

        assert_eq!(table.len(), 32);
        assert_invariants(&table, &state);

        for k in 0..32u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: (k as i32) * 2
                }),
                "{table:#?}"
            );
        }

        let miss_hash = hash_key(&state, 999);
        assert!(table.find(miss_hash, |v| v.key == 999).is_none());
    }

    #[test]
    fn duplicate_insert_returns_false() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();
        let k = 42u64;
        let hash = hash_key(&state, k);

        let first = table
            .insert(hash, Item { key: k, value: 7 }, |v| v.key == k, |v| {
                hash_key(&state, v.key)
            })
            .unwrap();
        assert!(first);

        let second = table
            .insert(hash, Item { key: k, value: 11 }, |v| v.key == k, |v| {
                hash_key(&state, v.key)
            })
            .unwrap();
        assert!(!second);

        assert_eq!(table.len(), 1);
        // The original value survives a duplicate insert.
        assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 7);
    }

    #[test]
    fn find_mut_and_modify() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            table
                .insert(hash, Item { key: k, value: 1 }, |v| v.key == k, |v| {
                    hash_key(&state, v.key)
                })
                .unwrap();
        }

        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            if let Some(v) = table.find_mut(hash, |v| v.key == k) {
                v.value += 9;
            }
        }

        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 10);
        }
    }

    #[test]
    fn remove_items() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..8u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        assert_eq!(table.len(), 8);

        for k in [0u64, 3, 7] {
            let hash = hash_key(&state, k);
            let removed = table.remove(hash, |v| v.key == k).expect("should remove");
            assert_eq!(removed.key, k);
            // A second removal of the same key is a miss, not an error.
            assert!(table.remove(hash, |v| v.key == k).is_none());
        }

        assert_eq!(table.len(), 5);
        assert_invariants(&table, &state);

        let hash = hash_key(&state, 1000);
        assert!(table.remove(hash, |v| v.key == 1000).is_none());
    }

    #[test]
    fn add_remove_round_trip_restores_len() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..20u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }

        let len_before = table.len();
        let hash = hash_key(&state, 555);
        assert!(table
            .insert(
                hash,
                Item {
                    key: 555,
                    value: 0
                },
                |v| v.key == 555,
                |v| hash_key(&state, v.key)
            )
            .unwrap());
        assert!(table.remove(hash, |v| v.key == 555).is_some());

        assert_eq!(table.len(), len_before);
        assert!(!table.contains(hash, |v| v.key == 555));
        assert_invariants(&table, &state);
    }

    #[test]
    fn same_hash_collisions_stay_findable() {
        let mut table: HashTable<Item> = HashTable::new();
        let hash = 0u64;

        for k in 0..40u64 {
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |_| hash,
                )
                .unwrap();
        }

        assert_eq!(table.len(), 40);
        for k in 0..40u64 {
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i32
                }),
                "{table:#?}"
            );
        }

        for k in (0..40u64).step_by(2) {
            assert!(table.remove(hash, |v| v.key == k).is_some());
        }
        for k in 0..40u64 {
            assert_eq!(table.contains(hash, |v| v.key == k), k % 2 == 1);
        }
    }

    #[test]
    fn growth_happens_on_the_insert_after_the_budget_is_spent() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        let hash = hash_key(&state, 0);
        table
            .insert(
                hash,
                Item { key: 0, value: 0 },
                |v| v.key == 0,
                |v| hash_key(&state, v.key),
            )
            .unwrap();

        let buckets = table.num_buckets();
        let capacity = table.capacity();
        assert!(capacity >= 1);

        // Fill the remaining budget; the bucket count must not move.
        for k in 1..capacity as u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
            assert_eq!(table.num_buckets(), buckets, "early resize at {k}");
        }

        // The next insert crosses the budget and grows the table.
        let k = capacity as u64;
        let hash = hash_key(&state, k);
        table
            .insert(
                hash,
                Item {
                    key: k,
                    value: k as i32,
                },
                |v| v.key == k,
                |v| hash_key(&state, v.key),
            )
            .unwrap();
        assert!(table.num_buckets() > buckets);
        assert_invariants(&table, &state);
    }

    #[test]
    fn tombstone_churn_rehashes_in_place() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::with_capacity(512);
        let buckets = table.num_buckets();

        let mut next_key = 0u64;
        for _ in 0..500 {
            let k = next_key;
            next_key += 1;
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        for k in 0..450u64 {
            let hash = hash_key(&state, k);
            assert!(table.remove(hash, |v| v.key == k).is_some());
        }
        assert_eq!(table.len(), 50);

        // Keep the live count stable while cycling keys; reclaiming the
        // tombstones must never need a bigger table.
        for _ in 0..2000 {
            let fresh = next_key;
            next_key += 1;
            let hash = hash_key(&state, fresh);
            table
                .insert(
                    hash,
                    Item {
                        key: fresh,
                        value: 0,
                    },
                    |v| v.key == fresh,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();

            let stale = fresh - 50;
            let hash = hash_key(&state, stale);
            assert!(table.remove(hash, |v| v.key == stale).is_some());

            assert_eq!(table.num_buckets(), buckets, "resized instead of rehashing");
        }

        assert_eq!(table.len(), 50);
        assert_invariants(&table, &state);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..100_000u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }

        assert_eq!(table.len(), 100_000);
        for k in 0..100_000u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: k as i32
                })
            );
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn randomized_churn_matches_reference_set() {
        let state = HashState::fixed();
        let mut rng = StdRng::seed_from_u64(0x5EED);
        let mut table: HashTable<Item> = HashTable::new();
        let mut reference = std::collections::HashSet::new();

        let mut inserted: Vec<u64> = Vec::new();
        const N: usize = 1 << 20;

        for round in 0..N {
            let key = u64::from(rng.random::<u32>());
            let hash = hash_key(&state, key);
            let fresh = table
                .insert(
                    hash,
                    Item {
                        key,
                        value: round as i32,
                    },
                    |v| v.key == key,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
            assert_eq!(fresh, reference.insert(key));
            if fresh {
                inserted.push(key);
            }

            // Periodically remove every third element inserted in the last
            // stretch.
            if round % 4096 == 4095 {
                let start = inserted.len().saturating_sub(4096);
                let victims: Vec<u64> =
                    inserted[start..].iter().copied().step_by(3).collect();
                for key in victims {
                    let hash = hash_key(&state, key);
                    let removed = table.remove(hash, |v| v.key == key).is_some();
                    assert_eq!(removed, reference.remove(&key));
                }
            }
        }

        assert_eq!(table.len(), reference.len());
        for &key in &reference {
            let hash = hash_key(&state, key);
            assert!(table.contains(hash, |v| v.key == key), "lost key {key}");
        }
        for &key in inserted.iter() {
            let hash = hash_key(&state, key);
            assert_eq!(
                table.contains(hash, |v| v.key == key),
                reference.contains(&key)
            );
        }
    }

    #[test]
    fn entry_api() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();
        let k = 9u64;
        let hash = hash_key(&state, k);

        match table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
        {
            Entry::Vacant(entry) => {
                entry.insert(Item { key: k, value: 1 });
            }
            Entry::Occupied(_) => panic!("should be vacant first time"),
        }

        match table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
        {
            Entry::Occupied(mut entry) => {
                assert_eq!(entry.get().value, 1);
                entry.get_mut().value = 2;
            }
            Entry::Vacant(_) => panic!("should be occupied: {table:#?}"),
        }
        assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 2);

        let value = table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
            .or_insert(Item { key: k, value: 99 });
        assert_eq!(value.value, 2);

        match table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
        {
            Entry::Occupied(entry) => {
                let removed = entry.remove();
                assert_eq!(removed.key, k);
            }
            Entry::Vacant(_) => panic!("should be occupied"),
        }
        assert_eq!(table.len(), 0);
        assert!(!table.contains(hash, |v| v.key == k));
    }

    #[test]
    fn entry_or_insert_with_and_modify() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();
        let k = 3u64;
        let hash = hash_key(&state, k);

        let missing = table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
            .and_modify(|v| v.value += 1);
        assert!(missing.is_none());

        table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
            .or_insert_with(|| Item { key: k, value: 41 });

        let modified = table
            .entry(hash, |v| v.key == k, |v| hash_key(&state, v.key))
            .unwrap()
            .and_modify(|v| v.value += 1);
        assert_eq!(modified.unwrap().value, 42);
    }

    #[test]
    fn trim_preserves_contents() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::with_capacity(10_000);

        for k in 0..100u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }

        let mut buckets = table.num_buckets();
        // The shrink policy steps down; iterate it to a fixed point.
        loop {
            table.trim(|v| hash_key(&state, v.key)).unwrap();
            assert!(table.num_buckets() <= buckets);
            if table.num_buckets() == buckets {
                break;
            }
            buckets = table.num_buckets();
        }

        assert_eq!(table.len(), 100);
        assert!(table.capacity() >= 100);
        assert_invariants(&table, &state);

        for k in 0..100u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, k as i32);
        }
    }

    #[test]
    fn trim_on_empty_table_deallocates() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::with_capacity(100);
        assert!(table.num_buckets() > 0);

        table.trim(|v| hash_key(&state, v.key)).unwrap();
        assert_eq!(table.num_buckets(), 0);
        assert_eq!(table.capacity(), 0);

        // The table is still usable after being deallocated.
        let hash = hash_key(&state, 1);
        table
            .insert(hash, Item { key: 1, value: 1 }, |v| v.key == 1, |v| {
                hash_key(&state, v.key)
            })
            .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_and_shrink() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::with_capacity(1000);

        for k in 0..20u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        let buckets_before = table.num_buckets();

        let miss = hash_key(&state, 777);
        assert!(table
            .remove_and_shrink(miss, |v| v.key == 777, |v| hash_key(&state, v.key))
            .unwrap()
            .is_none());
        // A miss must not shrink anything.
        assert_eq!(table.num_buckets(), buckets_before);

        for k in 0..20u64 {
            let hash = hash_key(&state, k);
            let removed = table
                .remove_and_shrink(hash, |v| v.key == k, |v| hash_key(&state, v.key))
                .unwrap();
            assert_eq!(removed.map(|v| v.key), Some(k));
        }

        assert_eq!(table.len(), 0);
        assert!(table.num_buckets() < buckets_before);
        assert_invariants(&table, &state);
    }

    #[test]
    fn reserve_avoids_later_resizes() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        table.reserve(500, |v| hash_key(&state, v.key)).unwrap();
        let buckets = table.num_buckets();
        assert!(table.capacity() >= 500);

        for k in 0..500u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        assert_eq!(table.num_buckets(), buckets);
    }

    #[test]
    fn try_with_capacity_overflow() {
        assert_eq!(
            HashTable::<Item>::try_with_capacity(usize::MAX).unwrap_err(),
            Error::CapacityOverflow
        );
    }

    #[test]
    fn clear_keeps_capacity() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..50u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        let buckets = table.num_buckets();

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.num_buckets(), buckets);
        assert_invariants(&table, &state);

        for k in 0..50u64 {
            let hash = hash_key(&state, k);
            assert!(!table.contains(hash, |v| v.key == k));
        }
    }

    #[test]
    fn iter_and_drain() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 10..20u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: (k as i32) + 1,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }

        let collected: Vec<u64> = table.iter().map(|v| v.key).collect();
        assert_eq!(collected.len(), 10, "{table:#?}");
        for k in 10..20u64 {
            assert!(collected.contains(&k));
        }

        let drained: Vec<Item> = table.drain().collect();
        assert_eq!(drained.len(), 10);
        assert_eq!(table.len(), 0);

        for k in 10..20u64 {
            let hash = hash_key(&state, k);
            assert!(table.find(hash, |v| v.key == k).is_none());
        }
    }

    #[test]
    fn drain_drop_releases_unyielded_values() {
        let state = HashState::random();
        let alive = Rc::new(());
        let mut table: HashTable<(u64, Rc<()>)> = HashTable::new();

        for k in 0..16u64 {
            let hash = hash_key(&state, k);
            table
                .insert(hash, (k, Rc::clone(&alive)), |v| v.0 == k, |v| {
                    hash_key(&state, v.0)
                })
                .unwrap();
        }
        assert_eq!(Rc::strong_count(&alive), 17);

        let mut drain = table.drain();
        let _first = drain.next().unwrap();
        drop(drain);
        drop(_first);

        assert_eq!(Rc::strong_count(&alive), 1);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn drop_releases_values() {
        let state = HashState::random();
        let alive = Rc::new(());
        {
            let mut table: HashTable<(u64, Rc<()>)> = HashTable::new();
            for k in 0..64u64 {
                let hash = hash_key(&state, k);
                table
                    .insert(hash, (k, Rc::clone(&alive)), |v| v.0 == k, |v| {
                        hash_key(&state, v.0)
                    })
                    .unwrap();
            }
            for k in 0..32u64 {
                let hash = hash_key(&state, k);
                assert!(table.remove(hash, |v| v.0 == k).is_some());
            }
            assert_eq!(Rc::strong_count(&alive), 33);
        }
        assert_eq!(Rc::strong_count(&alive), 1);
    }

    #[test]
    fn clone_preserves_entries_and_tombstones() {
        let state = HashState::random();
        let mut table: HashTable<Item> = HashTable::new();

        for k in 0..200u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Item {
                        key: k,
                        value: k as i32,
                    },
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }
        for k in (0..200u64).step_by(3) {
            let hash = hash_key(&state, k);
            table.remove(hash, |v| v.key == k);
        }

        let cloned = table.clone();
        assert_eq!(cloned.len(), table.len());
        assert_eq!(cloned.num_buckets(), table.num_buckets());
        assert_invariants(&cloned, &state);

        for k in 0..200u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                cloned.find(hash, |v| v.key == k),
                table.find(hash, |v| v.key == k)
            );
        }
    }

    #[test]
    fn clone_is_independent() {
        let state = HashState::random();
        let mut original: HashTable<Item> = HashTable::new();
        let hash = hash_key(&state, 1);
        original
            .insert(hash, Item { key: 1, value: 1 }, |v| v.key == 1, |v| {
                hash_key(&state, v.key)
            })
            .unwrap();

        let cloned = original.clone();
        original.find_mut(hash, |v| v.key == 1).unwrap().value = 999;

        assert_eq!(original.find(hash, |v| v.key == 1).unwrap().value, 999);
        assert_eq!(cloned.find(hash, |v| v.key == 1).unwrap().value, 1);
    }

    #[test]
    fn boxed_values_survive_growth() {
        let state = HashState::random();
        let mut table: HashTable<Box<Item>> = HashTable::new();

        for k in 0..300u64 {
            let hash = hash_key(&state, k);
            table
                .insert(
                    hash,
                    Box::new(Item {
                        key: k,
                        value: k as i32,
                    }),
                    |v| v.key == k,
                    |v| hash_key(&state, v.key),
                )
                .unwrap();
        }

        for k in 0..300u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k).map(|v| v.value),
                Some(k as i32)
            );
        }
    }

    #[test]
    fn capacity_functions_are_consistent() {
        for cap in 1..2048usize {
            let buckets = capacity_to_buckets(cap).unwrap();
            assert!(buckets.is_power_of_two());
            assert!(
                bucket_mask_to_capacity(buckets - 1) >= cap,
                "cap {cap} -> buckets {buckets}"
            );
        }
    }

    #[test]
    fn probe_visits_every_window_once() {
        for buckets in [16usize, 64, 256, 1024] {
            let mask = buckets - 1;
            for start in [0usize, 1, Group::WIDTH - 1, mask] {
                let mut probe = Probe::new(start & mask);
                let mut seen = Vec::new();
                while let Some(position) = probe.next(mask) {
                    seen.push(position);
                }

                assert_eq!(seen.len(), usize::max(buckets / Group::WIDTH, 1));
                // Consecutive windows tile the whole table: every bucket is
                // covered by at least one yielded window.
                let mut covered = alloc::vec![false; buckets];
                for &position in &seen {
                    for offset in 0..Group::WIDTH {
                        covered[(position + offset) & mask] = true;
                    }
                }
                assert!(covered.iter().all(|&c| c));
            }
        }
    }
}
