//! Candidate events and the global next-event queue.
//!
//! Each particle owns a list of candidate events (one per kind under the
//! recalculation algorithms, one per kind and target under first-reaction).
//! The queue is a binary heap over copies of those events, ordered by
//! (execution time, particle id, kind ordinal, target); entries are
//! invalidated wholesale by bumping the owning particle's epoch and are
//! discarded lazily on pop.

use crate::lattice::SiteId;
use crate::particle::ParticleId;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Every event family the scheduler can execute.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    /// Exciton Förster/Dexter hop to an empty site.
    ExcitonHop,
    /// Radiative/non-radiative return to the ground state.
    ExcitonRelax,
    /// Charge-transfer split into a geminate polaron pair.
    ExcitonDissociate,
    /// Singlet→triplet spin flip.
    IntersystemCrossing,
    /// Triplet→singlet spin flip, thermally gated.
    ReverseIntersystemCrossing,
    /// Long-range annihilation with another exciton.
    ExcitonExcitonAnnihilation,
    /// Long-range annihilation with a polaron.
    ExcitonPolaronAnnihilation,
    /// Polaron hop to an empty site.
    PolaronHop,
    /// Polaron hop onto an oppositely charged site.
    PolaronRecombination,
    /// Hop out of the film through an electrode face.
    PolaronExtraction,
}

impl EventKind {
    /// Stable ordinal used as the final event ordering key.
    #[must_use]
    pub fn ordinal(self) -> u8 {
        match self {
            Self::ExcitonHop => 0,
            Self::ExcitonRelax => 1,
            Self::ExcitonDissociate => 2,
            Self::IntersystemCrossing => 3,
            Self::ReverseIntersystemCrossing => 4,
            Self::ExcitonExcitonAnnihilation => 5,
            Self::ExcitonPolaronAnnihilation => 6,
            Self::PolaronHop => 7,
            Self::PolaronRecombination => 8,
            Self::PolaronExtraction => 9,
        }
    }
}

/// A scheduled candidate event.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    /// What happens.
    pub kind: EventKind,
    /// The particle it happens to.
    pub particle: ParticleId,
    /// Destination or interaction partner site, when the kind has one.
    pub target: Option<SiteId>,
    /// Absolute execution time in s.
    pub time: f64,
}

#[derive(Clone, Copy, Debug)]
struct HeapEntry {
    event: Event,
    epoch: u64,
}

impl HeapEntry {
    fn key(&self) -> (u32, u8, u32) {
        (
            self.event.particle.index(),
            self.event.kind.ordinal(),
            self.event.target.map_or(u32::MAX, |t| u32::try_from(t.index()).unwrap()),
        )
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // inverted so the BinaryHeap max is the earliest event; ties broken
        // by (particle, kind, target) for reproducible runs
        other
            .event
            .time
            .total_cmp(&self.event.time)
            .then_with(|| other.key().cmp(&self.key()))
    }
}

#[derive(Clone, Debug)]
struct ParticleEvents {
    epoch: u64,
    events: Vec<Event>,
}

/// Per-particle candidate stores plus the global selection heap.
#[derive(Clone, Debug)]
pub struct EventStore {
    keep_all: bool,
    next_epoch: u64,
    lists: FxHashMap<ParticleId, ParticleEvents>,
    heap: BinaryHeap<HeapEntry>,
}

impl EventStore {
    /// Creates a store. With `keep_all` (first-reaction method) every
    /// candidate is retained; otherwise only the earliest candidate per
    /// kind survives.
    #[must_use]
    pub fn new(keep_all: bool) -> Self {
        Self {
            keep_all,
            next_epoch: 0,
            lists: FxHashMap::default(),
            heap: BinaryHeap::new(),
        }
    }

    /// Replaces the candidate list of `particle`, invalidating all of its
    /// previously scheduled events.
    pub fn replace(&mut self, particle: ParticleId, mut candidates: Vec<Event>) {
        if !self.keep_all {
            candidates = reduce_to_min_per_kind(candidates);
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        for &event in &candidates {
            self.heap.push(HeapEntry { event, epoch });
        }
        self.lists.insert(
            particle,
            ParticleEvents {
                epoch,
                events: candidates,
            },
        );
    }

    /// Drops every event owned by `particle`.
    pub fn remove(&mut self, particle: ParticleId) {
        self.lists.remove(&particle);
    }

    /// Number of particles with candidate lists.
    #[must_use]
    pub fn tracked_particles(&self) -> usize {
        self.lists.len()
    }

    /// Candidate events of one particle, for inspection.
    #[must_use]
    pub fn events_for(&self, particle: ParticleId) -> &[Event] {
        self.lists.get(&particle).map_or(&[], |pe| &pe.events)
    }

    fn is_current(&self, entry: &HeapEntry) -> bool {
        self.lists
            .get(&entry.event.particle)
            .is_some_and(|pe| pe.epoch == entry.epoch)
    }

    /// Earliest valid event without removing it.
    pub fn peek(&mut self) -> Option<Event> {
        while let Some(entry) = self.heap.peek() {
            if self.is_current(entry) {
                return Some(entry.event);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns the earliest valid event.
    pub fn pop(&mut self) -> Option<Event> {
        let next = self.peek()?;
        self.heap.pop();
        Some(next)
    }
}

fn reduce_to_min_per_kind(candidates: Vec<Event>) -> Vec<Event> {
    let mut min: FxHashMap<EventKind, Event> = FxHashMap::default();
    for event in candidates {
        match min.get(&event.kind) {
            Some(held) if held.time <= event.time => {}
            _ => {
                min.insert(event.kind, event);
            }
        }
    }
    let mut reduced: Vec<Event> = min.into_values().collect();
    reduced.sort_by_key(|e| e.kind.ordinal());
    reduced
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::particle::{Exciton, Particle, Registry, Spin};

    fn particle_ids(n: usize) -> Vec<ParticleId> {
        let mut registry = Registry::new();
        (0..n)
            .map(|i| {
                registry.insert(Particle::Exciton(Exciton {
                    spin: Spin::Singlet,
                    created_at: 0.0,
                    site: SiteId::from_index(u32::try_from(i).unwrap()),
                    displacement: [0.0; 3],
                    path_length: 0.0,
                }))
            })
            .collect()
    }

    fn hop(particle: ParticleId, target: u32, time: f64) -> Event {
        Event {
            kind: EventKind::ExcitonHop,
            particle,
            target: Some(SiteId::from_index(target)),
            time,
        }
    }

    #[test]
    fn pop_returns_events_in_time_order() {
        let ids = particle_ids(3);
        let mut store = EventStore::new(true);
        store.replace(ids[0], vec![hop(ids[0], 9, 3.0e-9)]);
        store.replace(ids[1], vec![hop(ids[1], 9, 1.0e-9)]);
        store.replace(ids[2], vec![hop(ids[2], 9, 2.0e-9)]);
        let order: Vec<_> = std::iter::from_fn(|| store.pop()).map(|e| e.particle).collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[test]
    fn equal_times_break_ties_by_particle_then_kind() {
        let ids = particle_ids(2);
        let mut store = EventStore::new(true);
        let relax = Event {
            kind: EventKind::ExcitonRelax,
            particle: ids[0],
            target: None,
            time: 1.0e-9,
        };
        store.replace(ids[1], vec![hop(ids[1], 4, 1.0e-9)]);
        store.replace(ids[0], vec![relax, hop(ids[0], 4, 1.0e-9)]);
        let order: Vec<_> = std::iter::from_fn(|| store.pop())
            .map(|e| (e.particle, e.kind.ordinal()))
            .collect();
        assert_eq!(
            order,
            vec![
                (ids[0], EventKind::ExcitonHop.ordinal()),
                (ids[0], EventKind::ExcitonRelax.ordinal()),
                (ids[1], EventKind::ExcitonHop.ordinal()),
            ]
        );
    }

    #[test]
    fn replace_invalidates_older_entries() {
        let ids = particle_ids(1);
        let mut store = EventStore::new(true);
        store.replace(ids[0], vec![hop(ids[0], 1, 1.0e-9)]);
        store.replace(ids[0], vec![hop(ids[0], 2, 5.0e-9)]);
        let event = store.pop().unwrap();
        assert_eq!(event.target, Some(SiteId::from_index(2)));
        assert!(store.pop().is_none());
    }

    #[test]
    fn removed_particles_leave_only_stale_entries() {
        let ids = particle_ids(2);
        let mut store = EventStore::new(true);
        store.replace(ids[0], vec![hop(ids[0], 1, 1.0e-9)]);
        store.replace(ids[1], vec![hop(ids[1], 1, 2.0e-9)]);
        store.remove(ids[0]);
        assert_eq!(store.pop().unwrap().particle, ids[1]);
        assert!(store.pop().is_none());
    }

    #[test]
    fn min_per_kind_keeps_the_earliest_target() {
        let ids = particle_ids(1);
        let mut store = EventStore::new(false);
        store.replace(
            ids[0],
            vec![
                hop(ids[0], 1, 4.0e-9),
                hop(ids[0], 2, 2.0e-9),
                hop(ids[0], 3, 3.0e-9),
                Event {
                    kind: EventKind::ExcitonRelax,
                    particle: ids[0],
                    target: None,
                    time: 9.0e-9,
                },
            ],
        );
        assert_eq!(store.events_for(ids[0]).len(), 2);
        let first = store.pop().unwrap();
        assert_eq!(first.target, Some(SiteId::from_index(2)));
    }

    #[test]
    fn first_reaction_keeps_every_target() {
        let ids = particle_ids(1);
        let mut store = EventStore::new(true);
        store.replace(
            ids[0],
            vec![hop(ids[0], 1, 4.0e-9), hop(ids[0], 2, 2.0e-9), hop(ids[0], 3, 3.0e-9)],
        );
        assert_eq!(store.events_for(ids[0]).len(), 3);
    }
}
