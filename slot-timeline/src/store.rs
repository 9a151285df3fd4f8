//! Persistence collaborators and their in-memory implementations.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    association::{AnalysisStatus, Association, AssociationId},
    error::StoreError,
    range::{Bound, Timestamp, UtcRange},
    reconcile::SlotChanges,
    slot::{OwnerKey, Slot, SlotId, SlotKind},
};

/// Exclusive claim on one owner's timelines for the duration of a step.
///
/// Unrelated owners never contend; a second writer for the same owner waits (or gives up with
/// [`OwnerLocks::try_lock`]) until the guard drops.
#[derive(Debug, Default)]
pub struct OwnerLocks {
    held: Mutex<HashSet<OwnerKey>>,
    released: Condvar,
}

impl OwnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, owner: &OwnerKey) -> OwnerGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(owner) {
            self.released.wait(&mut held);
        }
        held.insert(owner.clone());
        OwnerGuard {
            locks: self,
            owner: owner.clone(),
        }
    }

    pub fn try_lock(&self, owner: &OwnerKey) -> Option<OwnerGuard<'_>> {
        let mut held = self.held.lock();
        if !held.insert(owner.clone()) {
            return None;
        }
        Some(OwnerGuard {
            locks: self,
            owner: owner.clone(),
        })
    }

    pub fn is_locked(&self, owner: &OwnerKey) -> bool {
        self.held.lock().contains(owner)
    }
}

#[derive(Debug)]
pub struct OwnerGuard<'a> {
    locks: &'a OwnerLocks,
    owner: OwnerKey,
}

impl OwnerGuard<'_> {
    pub fn owner(&self) -> &OwnerKey {
        &self.owner
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.owner);
        self.locks.released.notify_all();
    }
}

pub trait SlotStore<D>: Send + Sync {
    /// Slots of one owner timeline overlapping `range`, ascending.
    fn find_overlapping(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        range: &UtcRange,
    ) -> Result<Vec<Slot<D>>, StoreError>;

    fn find_ending_at(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        at: Timestamp,
    ) -> Result<Option<Slot<D>>, StoreError>;

    fn find_starting_at(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        at: Timestamp,
    ) -> Result<Option<Slot<D>>, StoreError>;

    /// Applies every change or none. Returns the ids given to the inserted slots, in order.
    fn save(&self, changes: &SlotChanges<D>) -> Result<Vec<SlotId>, StoreError>;

    fn lock(&self, owner: &OwnerKey) -> OwnerGuard<'_>;

    fn try_lock(&self, owner: &OwnerKey) -> Option<OwnerGuard<'_>>;
}

type Timeline<D> = BTreeMap<Bound<Timestamp>, Slot<D>>;
type TimelineKey = (OwnerKey, SlotKind);

/// Ordered slots per owner and kind.
pub struct MemorySlotStore<D> {
    timelines: RwLock<HashMap<TimelineKey, Timeline<D>>>,
    next_id: AtomicU64,
    locks: OwnerLocks,
}

impl<D> Default for MemorySlotStore<D> {
    fn default() -> Self {
        Self {
            timelines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            locks: OwnerLocks::new(),
        }
    }
}

impl<D: Clone> MemorySlotStore<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full timeline, ascending.
    pub fn timeline(&self, owner: &OwnerKey, kind: SlotKind) -> Vec<Slot<D>> {
        self.timelines
            .read()
            .get(&(owner.clone(), kind))
            .map(|timeline| timeline.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn slot_count(&self) -> usize {
        self.timelines.read().values().map(BTreeMap::len).sum()
    }
}

fn take_existing<D>(
    timeline: &mut Timeline<D>,
    slot: &Slot<D>,
) -> Result<Slot<D>, StoreError> {
    let Some(id) = slot.id else {
        return Err(StoreError::Missing { entity: "slot", id: 0 });
    };
    let key = timeline
        .iter()
        .find(|(_, stored)| stored.id == Some(id))
        .map(|(key, _)| *key)
        .ok_or(StoreError::Missing { entity: "slot", id })?;
    let stored = timeline
        .remove(&key)
        .ok_or(StoreError::Missing { entity: "slot", id })?;
    if stored.version != slot.version {
        return Err(StoreError::VersionConflict {
            entity: "slot",
            id,
            expected: slot.version,
            actual: stored.version,
        });
    }
    Ok(stored)
}

fn place<D: Clone>(timeline: &mut Timeline<D>, slot: Slot<D>) -> Result<(), StoreError> {
    let key = slot.range.lower();
    if let Some(existing) = timeline.get(&key) {
        return Err(StoreError::Overlap {
            owner: slot.owner.clone(),
            kind: slot.kind,
            left: existing.range.to_string(),
            right: slot.range.to_string(),
        });
    }
    timeline.insert(key, slot);
    Ok(())
}

fn check_partition<D>(timeline: &Timeline<D>) -> Result<(), StoreError> {
    let mut iter = timeline.values();
    let Some(mut prev) = iter.next() else {
        return Ok(());
    };
    for next in iter {
        if prev.range.overlaps(&next.range) {
            return Err(StoreError::Overlap {
                owner: next.owner.clone(),
                kind: next.kind,
                left: prev.range.to_string(),
                right: next.range.to_string(),
            });
        }
        prev = next;
    }
    Ok(())
}

impl<D: Clone + Send + Sync> SlotStore<D> for MemorySlotStore<D> {
    fn find_overlapping(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        range: &UtcRange,
    ) -> Result<Vec<Slot<D>>, StoreError> {
        let timelines = self.timelines.read();
        Ok(timelines
            .get(&(owner.clone(), kind))
            .map(|timeline| {
                timeline
                    .values()
                    .filter(|slot| slot.range.overlaps(range))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn find_ending_at(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        at: Timestamp,
    ) -> Result<Option<Slot<D>>, StoreError> {
        let timelines = self.timelines.read();
        Ok(timelines.get(&(owner.clone(), kind)).and_then(|timeline| {
            timeline
                .range(..Bound::lower(Some(at)))
                .next_back()
                .map(|(_, slot)| slot)
                .filter(|slot| slot.range.upper_value() == Some(at))
                .cloned()
        }))
    }

    fn find_starting_at(
        &self,
        owner: &OwnerKey,
        kind: SlotKind,
        at: Timestamp,
    ) -> Result<Option<Slot<D>>, StoreError> {
        let timelines = self.timelines.read();
        Ok(timelines
            .get(&(owner.clone(), kind))
            .and_then(|timeline| timeline.get(&Bound::lower(Some(at))))
            .cloned())
    }

    fn save(&self, changes: &SlotChanges<D>) -> Result<Vec<SlotId>, StoreError> {
        let mut timelines = self.timelines.write();
        let mut work: HashMap<TimelineKey, Timeline<D>> = HashMap::new();
        let all = changes
            .deletes
            .iter()
            .chain(&changes.updates)
            .chain(&changes.inserts);
        for slot in all {
            let key = (slot.owner.clone(), slot.kind);
            if !work.contains_key(&key) {
                let current = timelines.get(&key).cloned().unwrap_or_default();
                work.insert(key, current);
            }
        }
        let timeline_of = |work: &mut HashMap<TimelineKey, Timeline<D>>, slot: &Slot<D>| {
            work.remove(&(slot.owner.clone(), slot.kind)).unwrap_or_default()
        };

        for slot in &changes.deletes {
            let mut timeline = timeline_of(&mut work, slot);
            take_existing(&mut timeline, slot)?;
            work.insert((slot.owner.clone(), slot.kind), timeline);
        }
        for slot in &changes.updates {
            let mut timeline = timeline_of(&mut work, slot);
            take_existing(&mut timeline, slot)?;
            work.insert((slot.owner.clone(), slot.kind), timeline);
        }
        for slot in &changes.updates {
            let mut timeline = timeline_of(&mut work, slot);
            let mut stored = slot.clone();
            stored.version += 1;
            place(&mut timeline, stored)?;
            work.insert((slot.owner.clone(), slot.kind), timeline);
        }
        let mut ids = Vec::with_capacity(changes.inserts.len());
        for slot in &changes.inserts {
            let mut timeline = timeline_of(&mut work, slot);
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut stored = slot.clone();
            stored.id = Some(id);
            stored.version = 0;
            place(&mut timeline, stored)?;
            work.insert((slot.owner.clone(), slot.kind), timeline);
            ids.push(id);
        }

        for timeline in work.values() {
            check_partition(timeline)?;
        }
        timelines.extend(work);
        Ok(ids)
    }

    fn lock(&self, owner: &OwnerKey) -> OwnerGuard<'_> {
        self.locks.lock(owner)
    }

    fn try_lock(&self, owner: &OwnerKey) -> Option<OwnerGuard<'_>> {
        self.locks.try_lock(owner)
    }
}

pub trait AssociationStore<D>: Send + Sync {
    /// Stores a new association and returns its id.
    fn insert(&self, association: Association<D>) -> Result<AssociationId, StoreError>;

    fn load(&self, id: AssociationId) -> Result<Association<D>, StoreError>;

    /// Optimistic write: fails when the stored version moved since `association` was loaded.
    /// Bumps `association.version` on success.
    fn save(&self, association: &mut Association<D>) -> Result<(), StoreError>;

    fn children(&self, parent: AssociationId) -> Result<Vec<Association<D>>, StoreError>;

    /// Next association to process per owner, keeping each owner's priority/id order, ready at
    /// `now`; across owners by status priority.
    fn eligible(&self, now: Timestamp) -> Result<Vec<Association<D>>, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct AssociationSnapshot<D> {
    next_id: AssociationId,
    associations: Vec<Association<D>>,
}

pub struct MemoryAssociationStore<D> {
    associations: RwLock<BTreeMap<AssociationId, Association<D>>>,
    next_id: AtomicU64,
}

impl<D> Default for MemoryAssociationStore<D> {
    fn default() -> Self {
        Self {
            associations: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<D: Clone> MemoryAssociationStore<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.associations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.read().is_empty()
    }

    pub fn with_status(&self, status: AnalysisStatus) -> Vec<Association<D>> {
        self.associations
            .read()
            .values()
            .filter(|a| a.status() == status)
            .cloned()
            .collect()
    }

    /// Associations waiting for operator intervention.
    pub fn failed(&self) -> Vec<Association<D>> {
        self.with_status(AnalysisStatus::Error)
    }

    pub fn pending_count(&self) -> usize {
        self.associations
            .read()
            .values()
            .filter(|a| !a.status().is_terminal())
            .count()
    }
}

impl<D: Clone + Serialize + DeserializeOwned> MemoryAssociationStore<D> {
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let snapshot = AssociationSnapshot {
            next_id: self.next_id.load(Ordering::Relaxed),
            associations: self.associations.read().values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Restores a snapshot written by [`persist`](Self::persist); a missing file yields an
    /// empty store.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let snapshot: AssociationSnapshot<D> = serde_json::from_slice(&bytes)?;
        let associations = snapshot
            .associations
            .into_iter()
            .map(|a| (a.id, a))
            .collect();
        Ok(Self {
            associations: RwLock::new(associations),
            next_id: AtomicU64::new(snapshot.next_id),
        })
    }
}

impl<D: Clone + Send + Sync> AssociationStore<D> for MemoryAssociationStore<D> {
    fn insert(&self, mut association: Association<D>) -> Result<AssociationId, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        association.id = id;
        association.version = 0;
        self.associations.write().insert(id, association);
        Ok(id)
    }

    fn load(&self, id: AssociationId) -> Result<Association<D>, StoreError> {
        self.associations
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::Missing {
                entity: "association",
                id,
            })
    }

    fn save(&self, association: &mut Association<D>) -> Result<(), StoreError> {
        let mut associations = self.associations.write();
        let stored = associations
            .get_mut(&association.id)
            .ok_or(StoreError::Missing {
                entity: "association",
                id: association.id,
            })?;
        if stored.version != association.version {
            return Err(StoreError::VersionConflict {
                entity: "association",
                id: association.id,
                expected: association.version,
                actual: stored.version,
            });
        }
        association.version += 1;
        *stored = association.clone();
        Ok(())
    }

    fn children(&self, parent: AssociationId) -> Result<Vec<Association<D>>, StoreError> {
        Ok(self
            .associations
            .read()
            .values()
            .filter(|a| a.parent == Some(parent))
            .cloned()
            .collect())
    }

    fn eligible(&self, now: Timestamp) -> Result<Vec<Association<D>>, StoreError> {
        let associations = self.associations.read();
        let mut heads: HashMap<&OwnerKey, &Association<D>> = HashMap::new();
        for association in associations.values() {
            let status = association.status();
            if status.is_terminal() || status == AnalysisStatus::PendingSubModifications {
                continue;
            }
            let order = |a: &Association<D>| (Reverse(a.priority), a.id);
            heads
                .entry(&association.owner)
                .and_modify(|head| {
                    if order(association) < order(head) {
                        *head = association;
                    }
                })
                .or_insert(association);
        }
        let mut ready: Vec<Association<D>> = heads
            .into_values()
            .filter(|a| a.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by_key(|a| (Reverse(a.status_priority()), a.id));
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::DEFAULT_PRIORITY;
    use chrono::{TimeZone, Utc};
    use core_types::config::PriorityConfig;
    use std::{sync::Arc, thread, time::Duration};

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    fn slot(from: u32, to: u32, data: &'static str) -> Slot<&'static str> {
        Slot::new(OwnerKey::from("M1"), SlotKind::Operation, UtcRange::between(at(from), at(to)), data)
    }

    fn inserts(slots: Vec<Slot<&'static str>>) -> SlotChanges<&'static str> {
        SlotChanges {
            inserts: slots,
            ..SlotChanges::default()
        }
    }

    #[test]
    fn save_is_all_or_nothing() {
        let store = MemorySlotStore::new();
        store.save(&inserts(vec![slot(1, 5, "A")])).unwrap();
        let err = store
            .save(&inserts(vec![slot(6, 8, "B"), slot(4, 7, "C")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Overlap { .. }));
        assert_eq!(store.slot_count(), 1);
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let store = MemorySlotStore::new();
        store.save(&inserts(vec![slot(1, 5, "A")])).unwrap();
        let mut first = store.timeline(&OwnerKey::from("M1"), SlotKind::Operation)[0].clone();
        let stale = first.clone();
        first.data = "B";
        store
            .save(&SlotChanges {
                updates: vec![first],
                ..SlotChanges::default()
            })
            .unwrap();
        let err = store
            .save(&SlotChanges {
                deletes: vec![stale],
                ..SlotChanges::default()
            })
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn neighbor_lookups() {
        let store = MemorySlotStore::new();
        store
            .save(&inserts(vec![slot(1, 3, "A"), slot(3, 5, "B"), slot(7, 9, "C")]))
            .unwrap();
        let owner = OwnerKey::from("M1");
        let kind = SlotKind::Operation;
        assert_eq!(store.find_ending_at(&owner, kind, at(3)).unwrap().unwrap().data, "A");
        assert!(store.find_ending_at(&owner, kind, at(6)).unwrap().is_none());
        assert_eq!(store.find_starting_at(&owner, kind, at(7)).unwrap().unwrap().data, "C");
        let hits = store
            .find_overlapping(&owner, kind, &UtcRange::between(at(2), at(8)))
            .unwrap();
        assert_eq!(hits.iter().map(|s| s.data).collect::<Vec<_>>(), vec!["A", "B", "C"]);
    }

    #[test]
    fn owner_lock_excludes_second_writer() {
        let locks = Arc::new(OwnerLocks::new());
        let m1 = OwnerKey::from("M1");
        let guard = locks.lock(&m1);
        assert!(locks.try_lock(&m1).is_none());
        assert!(locks.try_lock(&OwnerKey::from("M2")).is_some());

        let waiter = {
            let locks = Arc::clone(&locks);
            let m1 = m1.clone();
            thread::spawn(move || {
                let _guard = locks.lock(&m1);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
        assert!(!locks.is_locked(&m1));
    }

    fn association(owner: &str, priority: i32) -> Association<u32> {
        Association::new(
            OwnerKey::from(owner),
            SlotKind::Operation,
            UtcRange::between(at(1), at(2)),
            7,
            at(1),
        )
        .with_priority(priority)
    }

    #[test]
    fn eligible_keeps_owner_order() {
        let store = MemoryAssociationStore::new();
        let first = store.insert(association("M1", DEFAULT_PRIORITY)).unwrap();
        store.insert(association("M1", DEFAULT_PRIORITY)).unwrap();
        let urgent = store.insert(association("M2", DEFAULT_PRIORITY + 10)).unwrap();

        let ids: Vec<_> = store.eligible(at(1)).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![urgent, first]);

        // A head waiting for its resume time blocks the owner rather than being overtaken.
        let mut head = store.load(first).unwrap();
        head.mark_pending(at(5), &PriorityConfig::default()).unwrap();
        store.save(&mut head).unwrap();
        let ids: Vec<_> = store.eligible(at(2)).unwrap().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![urgent]);
    }

    #[test]
    fn optimistic_save_detects_concurrent_write() {
        let store = MemoryAssociationStore::new();
        let id = store.insert(association("M1", DEFAULT_PRIORITY)).unwrap();
        let mut a = store.load(id).unwrap();
        let mut b = store.load(id).unwrap();
        store.save(&mut a).unwrap();
        assert_eq!(a.version, 1);
        assert!(store.save(&mut b).unwrap_err().is_conflict());
    }

    #[test]
    fn snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("associations.json");
        let store = MemoryAssociationStore::new();
        let id = store.insert(association("M1", DEFAULT_PRIORITY)).unwrap();
        let mut a = store.load(id).unwrap();
        a.mark_in_progress(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(), &PriorityConfig::default())
            .unwrap();
        store.save(&mut a).unwrap();
        store.persist(&path).unwrap();

        let restored: MemoryAssociationStore<u32> = MemoryAssociationStore::load_or_init(&path).unwrap();
        let loaded = restored.load(id).unwrap();
        assert_eq!(loaded, a);
        assert_eq!(loaded.status(), AnalysisStatus::InProgress);
        let next = restored.insert(association("M1", DEFAULT_PRIORITY)).unwrap();
        assert!(next > id);

        let empty: MemoryAssociationStore<u32> =
            MemoryAssociationStore::load_or_init(dir.path().join("missing.json")).unwrap();
        assert!(empty.is_empty());
    }
}
