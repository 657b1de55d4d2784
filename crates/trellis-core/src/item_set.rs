//! Filterable, groupable item collections.
//!
//! An [`ItemSet`] stores items by index. Items can be hidden by filters and
//! partitioned into groups. Reads default to the filtered view, which is
//! rebuilt lazily on the first read after a mutation. Pass
//! [`IndexSpace::Unfiltered`] to address the raw slots instead.
//!
//! Slots may be empty. [`ItemSet::set_count`] reserves placeholder slots for
//! virtualized lists, and those placeholders pass every filter except the ones
//! that look at the item itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::contract::{ContractViolation, Contracts};
use crate::event::{EventArgs, EventBus, events};
use crate::logging::{span_names, targets};
use crate::object::ObjectId;
use crate::runtime::Runtime;
use crate::throttle::Throttle;
use crate::value::Observable;

/// Id of the built-in filter that drops items reporting themselves invisible.
pub const HIDDEN_ITEMS_FILTER: &str = "hiddenItems";

/// An item that can be held by an [`ItemSet`].
pub trait SetItem: Send + Sync + 'static {
    /// The item's key. Keyed items can be looked up and located by key.
    fn key(&self) -> Option<&str> {
        None
    }

    /// `Some(false)` hides the item from the filtered view.
    fn is_visible(&self) -> Option<bool> {
        None
    }

    /// The id the item raises `change`, `removeItem` and `dispose` under.
    fn object_id(&self) -> Option<ObjectId> {
        None
    }

    /// Called when a slot starts holding the item.
    fn add_ref(&self) {}

    /// Called when a slot stops holding the item.
    fn remove_ref(&self) {}
}

/// Which indices an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexSpace {
    /// Indices into the filtered view.
    #[default]
    Filtered,
    /// Raw slot indices.
    Unfiltered,
}

/// A contiguous span of items sharing a group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemGroup {
    /// Identifier of the group.
    pub grouping_id: String,
    /// Display name.
    pub name: Option<String>,
    /// First index of the span.
    pub start_index: usize,
    /// Number of items in the span.
    pub count: usize,
}

impl ItemGroup {
    /// Create a group.
    pub fn new(grouping_id: impl Into<String>, start_index: usize, count: usize) -> Self {
        Self {
            grouping_id: grouping_id.into(),
            name: None,
            start_index,
            count,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Last index of the span, or `None` for an empty group.
    pub fn end_index(&self) -> Option<usize> {
        (self.count > 0).then(|| self.start_index + self.count - 1)
    }

    fn last(&self) -> isize {
        (self.start_index + self.count) as isize - 1
    }

    fn opening(real: Option<&ItemGroup>, start_index: usize) -> Self {
        Self {
            grouping_id: real.map_or_else(|| "other".to_string(), |g| g.grouping_id.clone()),
            name: real.and_then(|g| g.name.clone()),
            start_index,
            count: 0,
        }
    }
}

/// One way of partitioning the set into groups.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupCollection {
    /// Name of the partitioning.
    pub name: String,
    /// Spans, in index order.
    pub item_groups: Vec<ItemGroup>,
}

impl GroupCollection {
    /// Create a partitioning.
    pub fn new(name: impl Into<String>, item_groups: Vec<ItemGroup>) -> Self {
        Self {
            name: name.into(),
            item_groups,
        }
    }
}

/// A filter predicate. Empty slots are passed as `None`.
pub type ItemFilter<T> = Arc<dyn Fn(Option<&T>) -> bool + Send + Sync>;

enum RefOp<T> {
    Acquire(Arc<T>),
    Release(Arc<T>),
}

fn settle<T: SetItem>(ops: Vec<RefOp<T>>) {
    // Acquire first so an item that moves never drops to zero.
    for op in &ops {
        if let RefOp::Acquire(item) = op {
            item.add_ref();
        }
    }
    for op in &ops {
        if let RefOp::Release(item) = op {
            item.remove_ref();
        }
    }
}

#[derive(Default)]
struct FilteredView {
    to_actual: Vec<usize>,
    key_to_index: HashMap<String, usize>,
    groups: Vec<GroupCollection>,
}

struct SetState<T> {
    slots: Vec<Option<Arc<T>>>,
    key_to_index: HashMap<String, usize>,
    materialized: usize,
    filters: Vec<(String, ItemFilter<T>)>,
    groupings: Option<Vec<GroupCollection>>,
    observed: HashMap<ObjectId, usize>,
    view: FilteredView,
    requires_filter: bool,
}

impl<T: SetItem> SetState<T> {
    fn new() -> Self {
        let hidden: ItemFilter<T> = Arc::new(|item: Option<&T>| item.is_none_or(|item| item.is_visible() != Some(false)));
        Self {
            slots: Vec::new(),
            key_to_index: HashMap::new(),
            materialized: 0,
            filters: vec![(HIDDEN_ITEMS_FILTER.to_string(), hidden)],
            groupings: None,
            observed: HashMap::new(),
            view: FilteredView::default(),
            requires_filter: false,
        }
    }

    fn resolve(&mut self, index: usize, space: IndexSpace) -> Option<usize> {
        match space {
            IndexSpace::Unfiltered => (index < self.slots.len()).then_some(index),
            IndexSpace::Filtered => {
                self.refresh();
                self.view.to_actual.get(index).copied()
            }
        }
    }

    fn reindex_from(&mut self, start: usize) {
        for (index, slot) in self.slots.iter().enumerate().skip(start) {
            if let Some(key) = slot.as_deref().and_then(SetItem::key) {
                self.key_to_index.insert(key.to_string(), index);
            }
        }
    }

    fn locate(&self, item: &Arc<T>) -> Option<usize> {
        match item.key() {
            Some(key) => self.key_to_index.get(key).copied(),
            None => self
                .slots
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, item))),
        }
    }

    /// Rebuild the filtered view if a mutation invalidated it.
    fn refresh(&mut self) {
        if !self.requires_filter {
            return;
        }
        let _span = tracing::trace_span!(target: targets::ITEM_SET, span_names::FILTER).entered();

        struct Cursor<'a> {
            groups: &'a [ItemGroup],
            next: usize,
            real: Option<&'a ItemGroup>,
            filtered: ItemGroup,
            out: usize,
        }

        let child_count = self.slots.len();
        let mut view = FilteredView::default();
        let mut cursors = Vec::new();

        for collection in self.groupings.iter().flatten() {
            let Some(first) = collection.item_groups.first() else {
                continue;
            };
            // A leading empty group is carried over as is.
            let (initial, next) = if first.count == 0 && collection.item_groups.len() > 1 {
                (vec![first.clone()], 1)
            } else {
                (Vec::new(), 0)
            };
            let real = collection.item_groups.get(next);
            cursors.push(Cursor {
                groups: &collection.item_groups,
                next,
                real,
                filtered: ItemGroup::opening(real, 0),
                out: view.groups.len(),
            });
            view.groups.push(GroupCollection {
                name: collection.name.clone(),
                item_groups: initial,
            });
        }

        // An empty set still closes its groups once.
        let mut actual = 0;
        while actual < child_count || (child_count == 0 && actual == 0) {
            let item = self.slots.get(actual).and_then(|slot| slot.as_deref());
            let visible = child_count > 0 && self.filters.iter().all(|(_, filter)| filter(item));

            if visible {
                let filtered_index = view.to_actual.len();
                view.to_actual.push(actual);
                if let Some(key) = item.and_then(SetItem::key) {
                    view.key_to_index.insert(key.to_string(), filtered_index);
                }
                for cursor in &mut cursors {
                    cursor.filtered.count += 1;
                }
            }

            for cursor in &mut cursors {
                let at_end = cursor.real.is_some_and(|g| g.last() == actual as isize);
                if at_end || child_count == 0 {
                    let closed = std::mem::take(&mut cursor.filtered);
                    if closed.count > 0 || child_count == 0 {
                        view.groups[cursor.out].item_groups.push(closed);
                    }
                    cursor.next += 1;
                    cursor.real = cursor.groups.get(cursor.next);
                    cursor.filtered = ItemGroup::opening(cursor.real, view.to_actual.len());
                }
            }
            actual += 1;
        }

        tracing::trace!(
            target: targets::ITEM_SET,
            total = child_count,
            visible = view.to_actual.len(),
            "filtered view rebuilt"
        );
        self.view = view;
        self.requires_filter = false;
    }
}

/// Widen the groups around an insertion at `index`.
///
/// With `prefer_after`, an item inserted on a boundary joins the group that
/// starts there; otherwise it joins the group that ends there, except at
/// index 0.
fn grow_groups(groupings: &mut [GroupCollection], index: usize, child_count: usize, prefer_after: bool) {
    for group in groupings.iter_mut().flat_map(|c| c.item_groups.iter_mut()) {
        let end = group.start_index + group.count;
        if prefer_after {
            if end > index {
                if group.start_index > index {
                    group.start_index += 1;
                }
                if group.start_index <= index {
                    group.count += 1;
                }
            } else if index == child_count && end == child_count {
                group.count += 1;
            }
        } else if end >= index {
            if (group.start_index == index && group.start_index != 0) || group.start_index > index {
                group.start_index += 1;
            }
            if group.start_index <= index {
                group.count += 1;
            }
        }
    }
}

/// Narrow the groups around a removal at `index`, dropping emptied groups.
fn shrink_groups(groupings: &mut [GroupCollection], index: usize) {
    for collection in groupings.iter_mut() {
        collection.item_groups.retain_mut(|group| {
            if group.start_index + group.count > index {
                if group.start_index <= index {
                    group.count -= 1;
                    return group.count > 0;
                }
                group.start_index -= 1;
            }
            true
        });
    }
}

/// An indexed, filterable, groupable collection.
///
/// Filters run while the set is locked and must not call back into it.
pub struct ItemSet<T: SetItem> {
    self_ref: Weak<ItemSet<T>>,
    id: ObjectId,
    bus: Arc<EventBus>,
    contracts: Contracts,
    default_group_name: String,
    throttle: Arc<Throttle>,
    disposed: AtomicBool,
    state: Mutex<SetState<T>>,
}

impl<T: SetItem> ItemSet<T> {
    /// Create an empty set.
    pub fn new(runtime: &Runtime) -> Arc<Self> {
        let config = runtime.config();
        let bus = runtime.bus().clone();
        let id = bus.register_object::<Self>("ItemSet");
        Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let weak = self_ref.clone();
            let throttle = Throttle::new(
                runtime.tasks().clone(),
                config.invalidate_delay,
                config.invalidate_max_delay,
                move || {
                    if let Some(set) = weak.upgrade()
                        && !set.is_disposed()
                    {
                        set.bus.change(set.id);
                    }
                },
            );
            Self {
                self_ref: self_ref.clone(),
                id,
                bus,
                contracts: runtime.contracts(),
                default_group_name: config.default_group_name.clone(),
                throttle,
                disposed: AtomicBool::new(false),
                state: Mutex::new(SetState::new()),
            }
        })
    }

    /// The id the set raises `change` under.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of items in the filtered view.
    pub fn count(&self) -> usize {
        self.count_in(IndexSpace::Filtered)
    }

    /// Number of items in `space`.
    pub fn count_in(&self, space: IndexSpace) -> usize {
        let mut state = self.state.lock();
        match space {
            IndexSpace::Unfiltered => state.slots.len(),
            IndexSpace::Filtered => {
                state.refresh();
                state.view.to_actual.len()
            }
        }
    }

    /// Number of non-empty slots.
    pub fn materialized_count(&self) -> usize {
        self.state.lock().materialized
    }

    /// The item at filtered `index`.
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.get_in(index, IndexSpace::Filtered)
    }

    /// The item at `index` in `space`.
    pub fn get_in(&self, index: usize, space: IndexSpace) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        let actual = state.resolve(index, space)?;
        state.slots.get(actual).cloned().flatten()
    }

    /// Read an item without requesting it. Same as [`get_in`](Self::get_in).
    pub fn peek(&self, index: usize, space: IndexSpace) -> Option<Arc<T>> {
        self.get_in(index, space)
    }

    /// The item with `key`, if it is visible in `space`.
    pub fn get_by_key(&self, key: &str, space: IndexSpace) -> Option<Arc<T>> {
        let mut state = self.state.lock();
        let actual = match space {
            IndexSpace::Unfiltered => state.key_to_index.get(key).copied(),
            IndexSpace::Filtered => {
                state.refresh();
                state
                    .view
                    .key_to_index
                    .get(key)
                    .and_then(|&filtered| state.view.to_actual.get(filtered).copied())
            }
        }?;
        state.slots.get(actual).cloned().flatten()
    }

    /// The index of `item` in `space`.
    ///
    /// The item must be keyed.
    pub fn index_of(&self, item: &T, space: IndexSpace) -> Result<Option<usize>, ContractViolation> {
        let Some(key) = item.key() else {
            return self.contracts.report(ContractViolation::MissingKey).map(|()| None);
        };
        let mut state = self.state.lock();
        Ok(match space {
            IndexSpace::Unfiltered => state.key_to_index.get(key).copied(),
            IndexSpace::Filtered => {
                state.refresh();
                state.view.key_to_index.get(key).copied()
            }
        })
    }

    /// The filtered view, placeholders included as `None`.
    pub fn to_vec(&self) -> Vec<Option<Arc<T>>> {
        let mut state = self.state.lock();
        state.refresh();
        state
            .view
            .to_actual
            .iter()
            .map(|&actual| state.slots.get(actual).cloned().flatten())
            .collect()
    }

    /// Replace the item in raw slot `index`.
    ///
    /// Returns whether the slot's occupant changed.
    pub fn set(&self, index: usize, item: Option<Arc<T>>) -> bool {
        let mut ops = Vec::new();
        let changed = {
            let mut state = self.state.lock();
            self.put(&mut state, index, item, &mut ops)
        };
        settle(ops);
        changed
    }

    /// Insert `item` at filtered `index`, joining the group that starts there.
    pub fn insert(&self, index: usize, item: Arc<T>) {
        self.insert_with_group_hint(index, item, true, IndexSpace::Filtered);
    }

    /// Insert `item` at `index`, shifting later items up.
    ///
    /// An index past the end appends. `prefer_after` picks which group
    /// absorbs an item inserted on a group boundary.
    pub fn insert_with_group_hint(&self, index: usize, item: Arc<T>, prefer_after: bool, space: IndexSpace) {
        let mut ops = Vec::new();
        {
            let mut state = self.state.lock();
            let child_count = state.slots.len();
            let actual = match space {
                IndexSpace::Unfiltered => index.min(child_count),
                IndexSpace::Filtered => {
                    state.refresh();
                    state.view.to_actual.get(index).copied().unwrap_or(child_count)
                }
            };
            self.insert_locked(&mut state, actual, item, prefer_after, &mut ops);
        }
        settle(ops);
    }

    /// Append `item`.
    pub fn add(&self, item: Arc<T>) {
        self.insert_with_group_hint(usize::MAX, item, true, IndexSpace::Unfiltered);
    }

    /// Remove the slot at `index` in `space`, shifting later items down.
    ///
    /// Returns the removed item, if the slot held one.
    pub fn remove_at(&self, index: usize, space: IndexSpace) -> Result<Option<Arc<T>>, ContractViolation> {
        let mut ops = Vec::new();
        let outcome = {
            let mut state = self.state.lock();
            match state.resolve(index, space) {
                Some(actual) => Ok(self.remove_locked(&mut state, actual, &mut ops)),
                None => Err(ContractViolation::IndexOutOfRange {
                    index,
                    len: state.slots.len(),
                }),
            }
        };
        settle(ops);
        match outcome {
            Ok(removed) => Ok(removed),
            Err(violation) => self.contracts.report(violation).map(|()| None),
        }
    }

    /// Remove `item` wherever it is. Returns whether it was found.
    pub fn remove(&self, item: &Arc<T>) -> bool {
        let mut ops = Vec::new();
        let found = {
            let mut state = self.state.lock();
            match state.locate(item) {
                Some(actual) => {
                    self.remove_locked(&mut state, actual, &mut ops);
                    true
                }
                None => false,
            }
        };
        settle(ops);
        found
    }

    /// Move `item` to raw index `new_index`.
    ///
    /// The target is compensated for the removal when moving more than one
    /// slot towards the end. Returns the item's previous index, or `None`
    /// if it is not in the set.
    pub fn move_item(&self, item: &Arc<T>, new_index: usize, prefer_after: bool) -> Result<Option<usize>, ContractViolation> {
        let Some(index) = self.index_of(item, IndexSpace::Unfiltered)? else {
            return Ok(None);
        };
        if index != new_index {
            let mut ops = Vec::new();
            {
                let mut state = self.state.lock();
                self.remove_locked(&mut state, index, &mut ops);
                let target = if new_index > index + 1 { new_index - 1 } else { new_index };
                let target = target.min(state.slots.len());
                self.insert_locked(&mut state, target, item.clone(), prefer_after, &mut ops);
            }
            settle(ops);
        }
        Ok(Some(index))
    }

    /// Drop every item and slot.
    pub fn clear(&self) -> Result<(), ContractViolation> {
        let mut ops = Vec::new();
        let remaining = {
            let mut state = self.state.lock();
            self.clear_locked(&mut state, &mut ops)
        };
        settle(ops);
        self.contracts
            .check(remaining == 0, || ContractViolation::MaterializedCountMismatch { count: remaining })
    }

    /// Reserve `count` empty slots, dropping the current contents.
    ///
    /// Does nothing if the set already has `count` slots.
    pub fn set_count(&self, count: usize) -> Result<(), ContractViolation> {
        if self.count_in(IndexSpace::Unfiltered) == count {
            return Ok(());
        }
        self.clear()?;
        let mut state = self.state.lock();
        state.slots = vec![None; count];
        state.requires_filter = true;
        Ok(())
    }

    /// Load `items` starting at raw index `start`.
    ///
    /// The set is first sized to `total`, or to the number of items.
    pub fn load<I>(&self, items: I, start: usize, total: Option<usize>) -> Result<(), ContractViolation>
    where
        I: IntoIterator<Item = Arc<T>>,
    {
        let items: Vec<Arc<T>> = items.into_iter().collect();
        self.set_count(total.unwrap_or(items.len()))?;
        for (offset, item) in items.into_iter().enumerate() {
            self.set(start + offset, Some(item));
        }
        Ok(())
    }

    /// Install or remove the filter `id`.
    ///
    /// Filters run in installation order and an item must pass all of them.
    pub fn set_filter(&self, id: &str, filter: Option<ItemFilter<T>>) {
        let mut state = self.state.lock();
        let existing = state.filters.iter().position(|(filter_id, _)| filter_id == id);
        match (filter, existing) {
            (Some(filter), Some(pos)) => state.filters[pos].1 = filter,
            (Some(filter), None) => state.filters.push((id.to_string(), filter)),
            (None, Some(pos)) => {
                state.filters.remove(pos);
            }
            (None, None) => {}
        }
        state.requires_filter = true;
    }

    /// Replace the group partitionings.
    pub fn set_groupings(&self, groupings: Option<Vec<GroupCollection>>) {
        let mut state = self.state.lock();
        state.groupings = groupings;
        state.requires_filter = true;
    }

    /// The group partitionings in `space`.
    ///
    /// Without groupings or materialized items, a single default group
    /// spanning the whole set is reported.
    pub fn groupings(&self, space: IndexSpace) -> Vec<GroupCollection> {
        let mut state = self.state.lock();
        let unfiltered = space == IndexSpace::Unfiltered;

        if state.groupings.is_none() || state.materialized == 0 {
            let count = if unfiltered {
                state.slots.len()
            } else {
                state.refresh();
                state.view.to_actual.len()
            };
            if count > 0 || unfiltered {
                return vec![GroupCollection::new(
                    self.default_group_name.clone(),
                    vec![ItemGroup::new("other", 0, count)],
                )];
            }
            return state.view.groups.clone();
        }

        if unfiltered {
            state.groupings.clone().unwrap_or_default()
        } else {
            state.refresh();
            state.view.groups.clone()
        }
    }

    /// Mark the filtered view stale and schedule a coalesced `change`.
    pub fn invalidate(&self) {
        self.state.lock().requires_filter = true;
        self.throttle.trigger();
    }

    /// Clear the set and its filters. Later invalidations are dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(violation) = self.clear() {
            tracing::warn!(target: targets::ITEM_SET, %violation, "dispose left items behind");
        }
        self.state.lock().filters.clear();
        self.throttle.cancel();
        self.bus.dispose(self.id);
    }

    fn put(&self, state: &mut SetState<T>, index: usize, item: Option<Arc<T>>, ops: &mut Vec<RefOp<T>>) -> bool {
        let current = state.slots.get(index).cloned().flatten();
        let same = match (&current, &item) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        if same {
            return false;
        }

        if let Some(old) = &current {
            if let Some(key) = old.key()
                && state.key_to_index.get(key) == Some(&index)
            {
                state.key_to_index.remove(key);
            }
            self.unobserve(state, old, ops);
            state.materialized -= 1;
        }

        if let Some(new) = &item {
            if index >= state.slots.len() {
                state.slots.resize(index + 1, None);
            }
            if let Some(key) = new.key() {
                state.key_to_index.insert(key.to_string(), index);
            }
            self.observe(state, new, ops);
            state.materialized += 1;
        }
        if let Some(slot) = state.slots.get_mut(index) {
            *slot = item;
        }

        state.requires_filter = true;
        true
    }

    fn insert_locked(&self, state: &mut SetState<T>, index: usize, item: Arc<T>, prefer_after: bool, ops: &mut Vec<RefOp<T>>) {
        let child_count = state.slots.len();
        if let Some(groupings) = state.groupings.as_mut() {
            grow_groups(groupings, index, child_count, prefer_after);
        }
        state.slots.insert(index, None);
        state.reindex_from(index + 1);
        self.put(state, index, Some(item), ops);
        state.requires_filter = true;
    }

    fn remove_locked(&self, state: &mut SetState<T>, index: usize, ops: &mut Vec<RefOp<T>>) -> Option<Arc<T>> {
        let removed = state.slots.remove(index);
        if let Some(item) = &removed {
            if let Some(key) = item.key() {
                state.key_to_index.remove(key);
            }
            self.unobserve(state, item, ops);
            state.materialized -= 1;
        }
        if let Some(groupings) = state.groupings.as_mut() {
            shrink_groups(groupings, index);
        }
        state.reindex_from(index);
        state.requires_filter = true;
        removed
    }

    fn clear_locked(&self, state: &mut SetState<T>, ops: &mut Vec<RefOp<T>>) -> usize {
        for index in 0..state.slots.len() {
            self.put(state, index, None, ops);
        }
        let remaining = state.materialized;
        state.slots.clear();
        state.key_to_index.clear();
        state.view = FilteredView::default();
        state.requires_filter = false;
        remaining
    }

    fn observe(&self, state: &mut SetState<T>, item: &Arc<T>, ops: &mut Vec<RefOp<T>>) {
        ops.push(RefOp::Acquire(item.clone()));
        let Some(source) = item.object_id() else {
            return;
        };
        let holders = state.observed.entry(source).or_insert(0);
        *holders += 1;
        if *holders > 1 {
            return;
        }

        let set = self.self_ref.clone();
        self.bus.on(self.id, source, events::CHANGE, move |_: &EventArgs| {
            if let Some(set) = set.upgrade() {
                set.invalidate();
            }
        });

        let set = self.self_ref.clone();
        let held = Arc::downgrade(item);
        self.bus.on(self.id, source, events::REMOVE_ITEM, move |_: &EventArgs| {
            if let (Some(set), Some(item)) = (set.upgrade(), held.upgrade()) {
                set.remove(&item);
            }
        });

        let set = self.self_ref.clone();
        let held = Arc::downgrade(item);
        self.bus.on(self.id, source, events::DISPOSE, move |_: &EventArgs| {
            if let (Some(set), Some(item)) = (set.upgrade(), held.upgrade()) {
                let index = set.state.lock().locate(&item);
                if let Some(index) = index {
                    set.set(index, None);
                }
            }
        });
    }

    fn unobserve(&self, state: &mut SetState<T>, item: &Arc<T>, ops: &mut Vec<RefOp<T>>) {
        ops.push(RefOp::Release(item.clone()));
        let Some(source) = item.object_id() else {
            return;
        };
        if let Some(holders) = state.observed.get_mut(&source) {
            *holders -= 1;
            if *holders == 0 {
                state.observed.remove(&source);
                self.bus.off(self.id, source, None);
            }
        }
    }
}

impl<T: SetItem> Observable for ItemSet<T> {
    fn object_id(&self) -> ObjectId {
        self.id
    }
}

impl<T: SetItem> Drop for ItemSet<T> {
    fn drop(&mut self) {
        self.throttle.cancel();
        self.bus.unregister_object(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeConfig;
    use std::sync::atomic::AtomicUsize;

    struct Entry {
        key: Option<String>,
        visible: Option<bool>,
        id: Option<ObjectId>,
        refs: AtomicUsize,
    }

    impl Entry {
        fn keyed(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: Some(key.to_string()),
                visible: None,
                id: None,
                refs: AtomicUsize::new(0),
            })
        }

        fn observed(runtime: &Runtime, key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: Some(key.to_string()),
                visible: None,
                id: Some(runtime.bus().register_object::<Entry>(key)),
                refs: AtomicUsize::new(0),
            })
        }
    }

    impl SetItem for Entry {
        fn key(&self) -> Option<&str> {
            self.key.as_deref()
        }
        fn is_visible(&self) -> Option<bool> {
            self.visible
        }
        fn object_id(&self) -> Option<ObjectId> {
            self.id
        }
        fn add_ref(&self) {
            self.refs.fetch_add(1, Ordering::SeqCst);
        }
        fn remove_ref(&self) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn keys(set: &ItemSet<Entry>) -> Vec<String> {
        set.to_vec()
            .into_iter()
            .map(|item| item.and_then(|i| i.key.clone()).unwrap_or_else(|| "-".into()))
            .collect()
    }

    fn filled(runtime: &Runtime, names: &[&str]) -> Arc<ItemSet<Entry>> {
        let set = ItemSet::new(runtime);
        for name in names {
            set.add(Entry::keyed(name));
        }
        set
    }

    #[test]
    fn test_insert_at_front() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b"]);
        let item = Entry::keyed("z");
        set.insert(0, item.clone());

        assert_eq!(set.count(), 3);
        assert!(Arc::ptr_eq(&set.get_in(0, IndexSpace::Unfiltered).unwrap(), &item));
        assert_eq!(keys(&set), vec!["z", "a", "b"]);
        assert_eq!(set.index_of(&Entry::keyed("b"), IndexSpace::Unfiltered), Ok(Some(2)));
        assert_eq!(item.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_at_shifts_down() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c"]);
        let removed = set.remove_at(1, IndexSpace::Filtered).unwrap().unwrap();

        assert_eq!(removed.key(), Some("b"));
        assert_eq!(removed.refs.load(Ordering::SeqCst), 0);
        assert_eq!(set.count(), 2);
        assert_eq!(set.get(1).unwrap().key(), Some("c"));
        assert_eq!(set.get_by_key("c", IndexSpace::Unfiltered).unwrap().key(), Some("c"));
        assert!(set.get_by_key("b", IndexSpace::Filtered).is_none());
    }

    #[test]
    fn test_remove_at_out_of_range_is_reported() {
        let runtime = Runtime::with_config(RuntimeConfig::lenient());
        let set = filled(&runtime, &["a"]);
        assert!(matches!(
            set.remove_at(4, IndexSpace::Unfiltered),
            Err(ContractViolation::IndexOutOfRange { index: 4, len: 1 })
        ));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_filter_rejecting_all() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c"]);
        set.set_filter("none", Some(Arc::new(|_: Option<&Entry>| false)));

        assert_eq!(set.count(), 0);
        assert_eq!(set.count_in(IndexSpace::Unfiltered), 3);
        assert!(set.get(0).is_none());

        set.set_filter("none", None);
        assert_eq!(set.count(), 3);
    }

    #[test]
    fn test_filtered_indices_skip_hidden_items() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "c"]);
        set.insert_with_group_hint(
            1,
            Arc::new(Entry {
                key: Some("hidden".into()),
                visible: Some(false),
                id: None,
                refs: AtomicUsize::new(0),
            }),
            true,
            IndexSpace::Unfiltered,
        );

        assert_eq!(keys(&set), vec!["a", "c"]);
        assert_eq!(set.count_in(IndexSpace::Unfiltered), 3);
        assert_eq!(set.index_of(&Entry::keyed("c"), IndexSpace::Filtered), Ok(Some(1)));
        assert_eq!(set.index_of(&Entry::keyed("c"), IndexSpace::Unfiltered), Ok(Some(2)));
    }

    #[test]
    fn test_move_to_same_position_is_identity() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c"]);
        let b = set.get(1).unwrap();
        assert_eq!(set.move_item(&b, 1, true), Ok(Some(1)));
        assert_eq!(keys(&set), vec!["a", "b", "c"]);
        assert_eq!(b.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_move_compensates_for_removal() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c", "d"]);
        let a = set.get(0).unwrap();
        assert_eq!(set.move_item(&a, 3, true), Ok(Some(0)));
        assert_eq!(keys(&set), vec!["b", "c", "a", "d"]);

        let d = set.get(3).unwrap();
        assert_eq!(set.move_item(&d, 0, true), Ok(Some(3)));
        assert_eq!(keys(&set), vec!["d", "b", "c", "a"]);
        assert_eq!(a.refs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_index_of_unkeyed_item_is_a_contract_violation() {
        let runtime = Runtime::with_config(RuntimeConfig::lenient());
        let set: Arc<ItemSet<Entry>> = ItemSet::new(&runtime);
        let unkeyed = Entry {
            key: None,
            visible: None,
            id: None,
            refs: AtomicUsize::new(0),
        };
        assert_eq!(set.index_of(&unkeyed, IndexSpace::Filtered), Err(ContractViolation::MissingKey));
    }

    fn two_groups() -> Vec<GroupCollection> {
        vec![GroupCollection::new(
            "letters",
            vec![ItemGroup::new("first", 0, 2), ItemGroup::new("second", 2, 2)],
        )]
    }

    fn spans(set: &ItemSet<Entry>, space: IndexSpace) -> Vec<(String, usize, usize)> {
        set.groupings(space)[0]
            .item_groups
            .iter()
            .map(|g| (g.grouping_id.clone(), g.start_index, g.count))
            .collect()
    }

    #[test]
    fn test_insert_on_boundary_prefers_following_group() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c", "d"]);
        set.set_groupings(Some(two_groups()));

        set.insert_with_group_hint(2, Entry::keyed("x"), true, IndexSpace::Unfiltered);
        assert_eq!(
            spans(&set, IndexSpace::Unfiltered),
            vec![("first".into(), 0, 2), ("second".into(), 2, 3)]
        );
    }

    #[test]
    fn test_insert_on_boundary_prefers_preceding_group() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c", "d"]);
        set.set_groupings(Some(two_groups()));

        set.insert_with_group_hint(2, Entry::keyed("x"), false, IndexSpace::Unfiltered);
        assert_eq!(
            spans(&set, IndexSpace::Unfiltered),
            vec![("first".into(), 0, 3), ("second".into(), 3, 2)]
        );

        // Index 0 always joins the first group.
        set.insert_with_group_hint(0, Entry::keyed("y"), false, IndexSpace::Unfiltered);
        assert_eq!(
            spans(&set, IndexSpace::Unfiltered),
            vec![("first".into(), 0, 4), ("second".into(), 4, 2)]
        );
    }

    #[test]
    fn test_append_grows_last_group() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c", "d"]);
        set.set_groupings(Some(two_groups()));
        set.add(Entry::keyed("e"));
        assert_eq!(
            spans(&set, IndexSpace::Unfiltered),
            vec![("first".into(), 0, 2), ("second".into(), 2, 3)]
        );
    }

    #[test]
    fn test_remove_drops_emptied_group() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c"]);
        set.set_groupings(Some(vec![GroupCollection::new(
            "letters",
            vec![
                ItemGroup::new("first", 0, 1),
                ItemGroup::new("second", 1, 2),
            ],
        )]));

        set.remove_at(0, IndexSpace::Unfiltered).unwrap();
        assert_eq!(spans(&set, IndexSpace::Unfiltered), vec![("second".into(), 0, 2)]);
    }

    #[test]
    fn test_filtered_groups_track_visible_items() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b", "c", "d"]);
        set.set_groupings(Some(two_groups()));
        set.set_filter(
            "no-a-or-b",
            Some(Arc::new(|item: Option<&Entry>| {
                !matches!(item.and_then(SetItem::key), Some("a" | "b"))
            })),
        );

        // The first group has no visible items and is dropped from the view.
        assert_eq!(spans(&set, IndexSpace::Filtered), vec![("second".into(), 0, 2)]);
    }

    #[test]
    fn test_default_grouping() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b"]);
        let groups = set.groupings(IndexSpace::Filtered);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "Default");
        assert_eq!(groups[0].item_groups[0], ItemGroup::new("other", 0, 2));
        assert_eq!(groups[0].item_groups[0].end_index(), Some(1));
    }

    #[test]
    fn test_set_count_and_load() {
        let runtime = Runtime::new();
        let set: Arc<ItemSet<Entry>> = ItemSet::new(&runtime);
        set.set_count(5).unwrap();
        assert_eq!(set.count(), 5);
        assert_eq!(set.materialized_count(), 0);

        set.load([Entry::keyed("b"), Entry::keyed("c")], 1, Some(5)).unwrap();
        assert_eq!(set.materialized_count(), 2);
        assert_eq!(keys(&set), vec!["-", "b", "c", "-", "-"]);
    }

    #[test]
    fn test_clear_releases_everything() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a", "b"]);
        let a = set.get(0).unwrap();
        set.clear().unwrap();
        assert_eq!(set.count(), 0);
        assert_eq!(set.materialized_count(), 0);
        assert_eq!(a.refs.load(Ordering::SeqCst), 0);
    }

    fn change_counter(runtime: &Runtime, set: &ItemSet<Entry>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let observer = runtime.bus().register_object::<()>("observer");
        runtime.bus().on(observer, set.id(), events::CHANGE, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_invalidate_coalesces() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a"]);
        let changes = change_counter(&runtime, &set);

        for _ in 0..20 {
            set.invalidate();
        }
        runtime.run_until_idle();
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_item_events_drive_the_set() {
        let runtime = Runtime::new();
        let set: Arc<ItemSet<Entry>> = ItemSet::new(&runtime);
        let a = Entry::observed(&runtime, "a");
        let b = Entry::observed(&runtime, "b");
        let c = Entry::observed(&runtime, "c");
        for item in [&a, &b, &c] {
            set.add(item.clone());
        }
        let changes = change_counter(&runtime, &set);
        let bus = runtime.bus();

        bus.change(a.id.unwrap());
        runtime.run_until_idle();
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        bus.raise(b.id.unwrap(), events::REMOVE_ITEM, &EventArgs::none(), false);
        assert_eq!(keys(&set), vec!["a", "c"]);
        assert_eq!(b.refs.load(Ordering::SeqCst), 0);

        bus.raise(c.id.unwrap(), events::DISPOSE, &EventArgs::none(), false);
        assert_eq!(keys(&set), vec!["a", "-"]);
        assert_eq!(set.materialized_count(), 1);

        // Released items are no longer observed.
        bus.change(b.id.unwrap());
        assert!(!bus.has_observers(b.id.unwrap(), events::CHANGE));
    }

    #[test]
    fn test_dispose_drops_pending_invalidation() {
        let runtime = Runtime::new();
        let set = filled(&runtime, &["a"]);
        let changes = change_counter(&runtime, &set);
        set.invalidate();
        set.dispose();
        set.dispose();
        runtime.run_until_idle();
        assert_eq!(changes.load(Ordering::SeqCst), 0);
        assert_eq!(set.count_in(IndexSpace::Unfiltered), 0);
    }
}
