use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Identity
///
/// The stable numeric key a registry assigns to an entity. Unique within one registry and never
/// reused while that registry is alive.
pub type Identity = u64;

/// Entity
///
/// Capability shared by every object that can live inside an `IdentityRegistry`.
/// The identity slot is owned by the registry: application code reads it, only `put` writes it.
pub trait Entity: Send + Sync + 'static {
    fn identity(&self) -> Identity;
    fn set_identity(&mut self, id: Identity);
}

/// Record
///
/// Shared handle to a registered entity. Equality and hashing follow the handle's pointer identity,
/// not the entity's contents, so an entity can be mutated (password change, moderation) without
/// invalidating the reverse map.
pub struct Record<E>(Arc<RwLock<E>>);

impl<E> Record<E> {
    pub fn new(entity: E) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.0.write()
    }
}

impl<E: Entity> Record<E> {
    /// Identity currently stored in the entity's slot.
    pub fn id(&self) -> Identity {
        self.0.read().identity()
    }
}

impl<E> Clone for Record<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E> PartialEq for Record<E> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> Eq for Record<E> {}

impl<E> Hash for Record<E> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for Record<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Record").field(&*self.0.read()).finish()
    }
}

/// RegistryError
///
/// Raised when hydrating a registry from untrusted data, when the identity space runs out, or
/// when a conditional insert finds a conflicting entity. `add`, `put` and `remove` still report
/// "already present" and "absent" as plain booleans.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("identity {0} appears more than once in the snapshot")]
    DuplicateIdentity(Identity),
    #[error("no identities left to allocate")]
    Exhausted,
    #[error("a conflicting entity is already registered")]
    Conflict,
}

struct Maps<E> {
    forward: HashMap<Identity, Record<E>>,
    reverse: HashMap<Record<E>, Identity>,
    allocation: Identity,
}

impl<E: Entity> Maps<E> {
    fn put(&mut self, id: Identity, record: &Record<E>) -> bool {
        if self.forward.contains_key(&id) || self.reverse.contains_key(record) {
            return false;
        }
        record.write().set_identity(id);
        self.allocation = self.allocation.max(id);
        self.forward.insert(id, record.clone());
        self.reverse.insert(record.clone(), id);
        true
    }

    /// First free identity at or above the allocation counter. `None` once `Identity::MAX` is
    /// taken, since the counter cannot move past it.
    fn next_free(&self) -> Option<Identity> {
        let mut id = self.allocation;
        while self.forward.contains_key(&id) {
            id = id.checked_add(1)?;
        }
        Some(id)
    }

    fn assign(&mut self, record: &Record<E>) -> Result<Identity, RegistryError> {
        let id = self.next_free().ok_or(RegistryError::Exhausted)?;
        let allocation = id.checked_add(1).ok_or(RegistryError::Exhausted)?;
        self.put(id, record);
        self.allocation = allocation;
        Ok(id)
    }

    fn unlink(&mut self, id: Identity) -> bool {
        match self.forward.remove(&id) {
            Some(record) => {
                self.reverse.remove(&record);
                true
            }
            None => false,
        }
    }
}

/// IdentityRegistry
///
/// A bijective store between `Identity` values and entity records for one entity type.
///
/// Both directions and the allocation counter sit behind a single lock, so a concurrent reader
/// never observes `forward` and `reverse` disagreeing. `allocation` only ever grows.
pub struct IdentityRegistry<E> {
    maps: RwLock<Maps<E>>,
}

impl<E: Entity> Default for IdentityRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> IdentityRegistry<E> {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps {
                forward: HashMap::new(),
                reverse: HashMap::new(),
                allocation: 0,
            }),
        }
    }

    /// restore
    ///
    /// Rebuilds a registry from a persisted allocation counter and entity set. Each entity keeps
    /// the identity stored in its own slot. Two entities claiming the same identity are rejected
    /// rather than silently dropped.
    pub fn restore(
        allocation: Identity,
        values: impl IntoIterator<Item = E>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        {
            let mut maps = registry.maps.write();
            maps.allocation = allocation;
            for entity in values {
                let id = entity.identity();
                if !maps.put(id, &Record::new(entity)) {
                    return Err(RegistryError::DuplicateIdentity(id));
                }
            }
        }
        Ok(registry)
    }

    /// add
    ///
    /// Assigns the next identity from the allocation counter. Slots already claimed by an explicit
    /// `put` are skipped. Fails without mutation if the record is already registered or no
    /// identity is left.
    pub fn add(&self, record: &Record<E>) -> bool {
        let mut maps = self.maps.write();
        !maps.reverse.contains_key(record) && maps.assign(record).is_ok()
    }

    /// Wraps `entity` in a fresh record and adds it.
    pub fn insert(&self, entity: E) -> Result<Record<E>, RegistryError> {
        let record = Record::new(entity);
        self.maps.write().assign(&record)?;
        Ok(record)
    }

    /// insert_unique
    ///
    /// Adds `entity` unless a registered entity `conflicts` with it. The scan and the insert run
    /// under one write lock, so two concurrent callers cannot both pass the check.
    pub fn insert_unique(
        &self,
        entity: E,
        mut conflicts: impl FnMut(&E, &E) -> bool,
    ) -> Result<Record<E>, RegistryError> {
        let mut maps = self.maps.write();
        if maps
            .forward
            .values()
            .any(|existing| conflicts(&*existing.read(), &entity))
        {
            return Err(RegistryError::Conflict);
        }
        let record = Record::new(entity);
        maps.assign(&record)?;
        Ok(record)
    }

    /// put
    ///
    /// Registers `record` under an explicit identity. Fails if `id` is occupied or the record is
    /// already present; on success the allocation counter is raised to at least `id`.
    pub fn put(&self, id: Identity, record: &Record<E>) -> bool {
        self.maps.write().put(id, record)
    }

    pub fn remove(&self, id: Identity) -> bool {
        self.maps.write().unlink(id)
    }

    pub fn remove_record(&self, record: &Record<E>) -> bool {
        let mut maps = self.maps.write();
        match maps.reverse.get(record).copied() {
            Some(id) => maps.unlink(id),
            None => false,
        }
    }

    pub fn lookup(&self, id: Identity) -> Option<Record<E>> {
        self.maps.read().forward.get(&id).cloned()
    }

    pub fn identity_of(&self, record: &Record<E>) -> Option<Identity> {
        self.maps.read().reverse.get(record).copied()
    }

    pub fn contains(&self, id: Identity) -> bool {
        self.maps.read().forward.contains_key(&id)
    }

    pub fn contains_record(&self, record: &Record<E>) -> bool {
        self.maps.read().reverse.contains_key(record)
    }

    pub fn len(&self) -> usize {
        self.maps.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().forward.is_empty()
    }

    /// Highest identity ever assigned or supplied. Never decreases.
    pub fn allocation(&self) -> Identity {
        self.maps.read().allocation
    }

    /// Point-in-time copy of every record. Order is unspecified.
    pub fn records(&self) -> Vec<Record<E>> {
        self.maps.read().forward.values().cloned().collect()
    }

    /// Allocation counter and records captured under one read lock.
    pub fn snapshot(&self) -> (Identity, Vec<Record<E>>) {
        let maps = self.maps.read();
        (maps.allocation, maps.forward.values().cloned().collect())
    }

    /// First record matching `predicate`, scanning in unspecified order.
    pub fn find(&self, mut predicate: impl FnMut(&E) -> bool) -> Option<Record<E>> {
        self.records()
            .into_iter()
            .find(|record| predicate(&*record.read()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Note {
        id: Identity,
        text: String,
    }

    impl Entity for Note {
        fn identity(&self) -> Identity {
            self.id
        }
        fn set_identity(&mut self, id: Identity) {
            self.id = id;
        }
    }

    fn note(text: &str) -> Note {
        Note {
            id: 0,
            text: text.to_string(),
        }
    }

    fn assert_bijection(registry: &IdentityRegistry<Note>) {
        for record in registry.records() {
            let id = registry.identity_of(&record).expect("record must be indexed");
            assert_eq!(registry.lookup(id), Some(record.clone()));
            assert_eq!(record.id(), id);
        }
        let mut ids: Vec<_> = registry.records().iter().map(Record::id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), registry.len());
    }

    #[test]
    fn add_assigns_sequential_identities() {
        let registry = IdentityRegistry::new();
        let first = registry.insert(note("a")).unwrap();
        let second = registry.insert(note("b")).unwrap();

        assert_eq!(first.id(), 0);
        assert_eq!(second.id(), 1);
        assert_eq!(registry.allocation(), 2);
        assert_bijection(&registry);
    }

    #[test]
    fn adding_the_same_record_twice_fails_without_mutation() {
        let registry = IdentityRegistry::new();
        let record = registry.insert(note("a")).unwrap();

        assert!(!registry.add(&record));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.allocation(), 1);
    }

    #[test]
    fn equal_contents_are_still_distinct_records() {
        let registry = IdentityRegistry::new();
        let a = registry.insert(note("same")).unwrap();
        let b = registry.insert(note("same")).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn put_rejects_occupied_identity_and_present_record() {
        let registry = IdentityRegistry::new();
        let a = Record::new(note("a"));
        let b = Record::new(note("b"));

        assert!(registry.put(7, &a));
        assert!(!registry.put(7, &b));
        assert!(!registry.put(8, &a));
        assert_eq!(registry.allocation(), 7);
        assert_eq!(a.id(), 7);
        assert_bijection(&registry);
    }

    #[test]
    fn add_skips_slots_claimed_by_put() {
        let registry = IdentityRegistry::new();
        assert!(registry.put(0, &Record::new(note("explicit"))));
        let auto = registry.insert(note("auto")).unwrap();

        assert_eq!(auto.id(), 1);
        assert_bijection(&registry);
    }

    #[test]
    fn remove_unlinks_both_directions_and_keeps_allocation() {
        let registry = IdentityRegistry::new();
        let a = registry.insert(note("a")).unwrap();
        let b = registry.insert(note("b")).unwrap();

        assert!(registry.remove(a.id()));
        assert!(!registry.remove(a.id()));
        assert!(registry.remove_record(&b));
        assert!(!registry.remove_record(&b));

        assert!(registry.is_empty());
        assert_eq!(registry.identity_of(&a), None);
        assert_eq!(registry.allocation(), 2);

        let c = registry.insert(note("c")).unwrap();
        assert_eq!(c.id(), 2);
    }

    #[test]
    fn allocation_never_decreases_across_mixed_operations() {
        let registry = IdentityRegistry::new();
        let mut last = registry.allocation();
        let mut live = Vec::new();

        for step in 0..40u64 {
            match step % 4 {
                0 | 1 => live.push(registry.insert(note("n")).unwrap()),
                2 => {
                    let record = Record::new(note("p"));
                    if registry.put(step * 3, &record) {
                        live.push(record);
                    }
                }
                _ => {
                    if let Some(record) = live.pop() {
                        assert!(registry.remove_record(&record));
                    }
                }
            }
            assert!(registry.allocation() >= last);
            last = registry.allocation();
            assert_bijection(&registry);
        }
    }

    #[test]
    fn restore_keeps_identities_and_allocation() {
        let values = vec![
            Note { id: 2, text: "x".into() },
            Note { id: 5, text: "y".into() },
        ];
        let registry = IdentityRegistry::restore(10, values).unwrap();

        assert_eq!(registry.allocation(), 10);
        assert_eq!(registry.lookup(5).unwrap().read().text, "y");
        assert_bijection(&registry);
    }

    #[test]
    fn restore_rejects_duplicate_identities() {
        let values = vec![
            Note { id: 3, text: "x".into() },
            Note { id: 3, text: "y".into() },
        ];
        assert_eq!(
            IdentityRegistry::restore(4, values).err(),
            Some(RegistryError::DuplicateIdentity(3))
        );
    }

    #[test]
    fn find_scans_entity_contents() {
        let registry = IdentityRegistry::new();
        registry.insert(note("a")).unwrap();
        let target = registry.insert(note("b")).unwrap();

        assert_eq!(registry.find(|n| n.text == "b"), Some(target));
        assert!(registry.find(|n| n.text == "zzz").is_none());
    }

    #[test]
    fn add_fails_once_the_identity_space_is_exhausted() {
        let registry = IdentityRegistry::new();
        assert!(registry.put(Identity::MAX, &Record::new(note("last"))));

        let record = Record::new(note("overflow"));
        assert!(!registry.add(&record));
        assert_eq!(registry.insert(note("overflow")).err(), Some(RegistryError::Exhausted));
        assert_eq!(registry.identity_of(&record), None);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.allocation(), Identity::MAX);
        assert_bijection(&registry);
    }

    #[test]
    fn restored_max_allocation_rejects_add_without_linking() {
        let registry = IdentityRegistry::<Note>::restore(Identity::MAX, []).unwrap();
        let record = Record::new(note("late"));

        assert!(!registry.add(&record));
        assert!(!registry.contains_record(&record));
        assert!(registry.is_empty());
        assert_eq!(registry.allocation(), Identity::MAX);
    }

    #[test]
    fn insert_unique_rejects_conflicts() {
        let registry = IdentityRegistry::new();
        let same_text = |a: &Note, b: &Note| a.text == b.text;

        let first = registry.insert_unique(note("a"), same_text).unwrap();
        assert_eq!(
            registry.insert_unique(note("a"), same_text).err(),
            Some(RegistryError::Conflict)
        );
        assert!(registry.insert_unique(note("b"), same_text).is_ok());
        assert_eq!(first.id(), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.allocation(), 2);
    }

    #[test]
    fn concurrent_insert_unique_admits_exactly_one() {
        let registry = IdentityRegistry::new();
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        registry
                            .insert_unique(note("ada@example.com"), |a, b| a.text == b.text)
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap() as usize)
                .sum()
        });

        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_mutation_keeps_the_bijection() {
        const WRITERS: u64 = 8;
        const PER_WRITER: u64 = 200;

        let registry = IdentityRegistry::new();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut last = 0;
                while !done.load(std::sync::atomic::Ordering::Acquire) {
                    let allocation = registry.allocation();
                    assert!(allocation >= last);
                    last = allocation;
                    let (_, records) = registry.snapshot();
                    for record in records {
                        let id = record.id();
                        if let Some(found) = registry.lookup(id) {
                            assert_eq!(found, record);
                        }
                    }
                }
            });

            let writers: Vec<_> = (0..WRITERS)
                .map(|_| {
                    scope.spawn(|| {
                        for i in 0..PER_WRITER {
                            let record = registry.insert(note("n")).unwrap();
                            if i % 2 == 0 {
                                assert!(registry.remove_record(&record));
                            }
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            done.store(true, std::sync::atomic::Ordering::Release);
            reader.join().unwrap();
        });

        assert_eq!(registry.len() as u64, WRITERS * PER_WRITER / 2);
        assert_eq!(registry.allocation(), WRITERS * PER_WRITER);
        assert_bijection(&registry);
    }
}
