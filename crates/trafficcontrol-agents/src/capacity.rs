//! Per-model capacity tracking and the admission predicate.
//!
//! The tracker owns one set of active session ids per model. Counts are
//! always derived from the sets, never stored separately. Transition events
//! (`capacity:exhausted` on filling the last slot, `capacity:available` on
//! freeing the first) are emitted on the bus after the lock is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use trafficcontrol_bus::{EventBus, EventPayload};
use trafficcontrol_types::{CapacityLimits, Model, SessionId};

/// Errors raised by capacity operations.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// Reservation attempted against a model at its limit.
    #[error("capacity exhausted for {model}: {limit} sessions active")]
    Exhausted {
        /// The saturated model.
        model: Model,
        /// Its configured limit.
        limit: usize,
    },
}

/// Tracks in-flight sessions per model and answers the admission predicate.
///
/// The tracker is the only component allowed to mutate the per-model active
/// sets; everyone else asks it.
pub struct CapacityTracker {
    limits: CapacityLimits,
    active: Mutex<HashMap<Model, HashSet<SessionId>>>,
    bus: Arc<EventBus>,
}

impl CapacityTracker {
    /// Create a tracker with the given limits, emitting transitions on `bus`.
    pub fn new(limits: CapacityLimits, bus: Arc<EventBus>) -> Self {
        let mut active = HashMap::new();
        for model in Model::all() {
            active.insert(model, HashSet::new());
        }
        Self {
            limits,
            active: Mutex::new(active),
            bus,
        }
    }

    /// Configured limit for `model`.
    pub fn limit(&self, model: Model) -> usize {
        self.limits.limit(model)
    }

    /// Remaining slots for `model`.
    pub fn available(&self, model: Model) -> usize {
        let active = self.lock();
        self.limits.limit(model).saturating_sub(active_count(&active, model))
    }

    /// Remaining slots across all models.
    pub fn total_available(&self) -> usize {
        let active = self.lock();
        Model::all()
            .iter()
            .map(|m| self.limits.limit(*m).saturating_sub(active_count(&active, *m)))
            .sum()
    }

    /// Whether at least one model has a free slot.
    pub fn any_available(&self) -> bool {
        self.total_available() > 0
    }

    /// Reserve a slot on `model` for `session`.
    ///
    /// Fails with [`CapacityError::Exhausted`] when the model is at its
    /// limit. Reserving the last slot emits `capacity:exhausted`.
    pub fn reserve(&self, model: Model, session: SessionId) -> Result<(), CapacityError> {
        let exhausted = {
            let mut active = self.lock();
            let limit = self.limits.limit(model);
            let set = active.entry(model).or_default();
            if set.len() >= limit {
                return Err(CapacityError::Exhausted { model, limit });
            }
            set.insert(session);
            set.len() == limit
        };
        debug!(%model, %session, "capacity reserved");
        if exhausted {
            self.bus.emit(EventPayload::CapacityExhausted { model });
        }
        Ok(())
    }

    /// Release the slot held by `session` on `model`.
    ///
    /// Idempotent: releasing an id that holds no slot is logged, not an
    /// error. Freeing a slot on a previously full model emits
    /// `capacity:available`.
    pub fn release(&self, model: Model, session: SessionId) {
        let became_available = {
            let mut active = self.lock();
            let limit = self.limits.limit(model);
            let set = active.entry(model).or_default();
            let was_full = set.len() >= limit && limit > 0;
            if !set.remove(&session) {
                warn!(%model, %session, "release of unknown session id ignored");
                return;
            }
            was_full
        };
        debug!(%model, %session, "capacity released");
        if became_available {
            self.bus.emit(EventPayload::CapacityAvailable { model });
        }
    }

    /// Replace the active sets from the ground-truth live session list.
    ///
    /// Called on startup and whenever the session manager's view is taken as
    /// authoritative. Fullness transitions caused by the replacement are
    /// emitted like any other.
    pub fn sync(&self, live: &[(SessionId, Model)]) {
        let mut transitions = Vec::new();
        {
            let mut active = self.lock();
            let mut next: HashMap<Model, HashSet<SessionId>> = HashMap::new();
            for model in Model::all() {
                next.insert(model, HashSet::new());
            }
            for (session, model) in live {
                next.entry(*model).or_default().insert(*session);
            }
            for model in Model::all() {
                let limit = self.limits.limit(model);
                let before_full = active_count(&active, model) >= limit && limit > 0;
                let after_full = next.get(&model).map_or(0, HashSet::len) >= limit && limit > 0;
                if before_full != after_full {
                    transitions.push((model, after_full));
                }
            }
            *active = next;
        }
        for (model, full) in transitions {
            if full {
                self.bus.emit(EventPayload::CapacityExhausted { model });
            } else {
                self.bus.emit(EventPayload::CapacityAvailable { model });
            }
        }
    }

    /// Active session count per model.
    pub fn counts(&self) -> HashMap<Model, usize> {
        let active = self.lock();
        Model::all()
            .iter()
            .map(|m| (*m, active_count(&active, *m)))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Model, HashSet<SessionId>>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn active_count(active: &HashMap<Model, HashSet<SessionId>>, model: Model) -> usize {
    active.get(&model).map_or(0, HashSet::len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trafficcontrol_bus::EventKind;

    fn tracker(opus: usize, sonnet: usize, haiku: usize) -> (CapacityTracker, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let limits = CapacityLimits { opus, sonnet, haiku };
        (CapacityTracker::new(limits, bus.clone()), bus)
    }

    #[test]
    fn reserve_and_release_walkthrough() {
        let (tracker, _bus) = tracker(1, 2, 0);
        let (a, b, c, d, e) = (
            SessionId::new(),
            SessionId::new(),
            SessionId::new(),
            SessionId::new(),
            SessionId::new(),
        );

        assert!(tracker.reserve(Model::Opus, a).is_ok());
        assert!(matches!(
            tracker.reserve(Model::Opus, b),
            Err(CapacityError::Exhausted { model: Model::Opus, limit: 1 })
        ));
        assert!(tracker.reserve(Model::Sonnet, c).is_ok());
        assert!(tracker.reserve(Model::Sonnet, d).is_ok());
        assert!(tracker.reserve(Model::Sonnet, e).is_err());

        tracker.release(Model::Opus, a);
        assert!(tracker.reserve(Model::Opus, b).is_ok());
    }

    #[test]
    fn release_of_unknown_id_is_noop() {
        let (tracker, _bus) = tracker(1, 1, 1);
        tracker.release(Model::Haiku, SessionId::new());
        assert_eq!(tracker.available(Model::Haiku), 1);
    }

    #[test]
    fn transition_events_fire_on_edges_only() {
        let (tracker, bus) = tracker(2, 0, 0);
        let (a, b) = (SessionId::new(), SessionId::new());

        tracker.reserve(Model::Opus, a).unwrap();
        assert!(bus.history(Some(EventKind::CapacityExhausted)).is_empty());

        tracker.reserve(Model::Opus, b).unwrap();
        assert_eq!(bus.history(Some(EventKind::CapacityExhausted)).len(), 1);

        tracker.release(Model::Opus, a);
        assert_eq!(bus.history(Some(EventKind::CapacityAvailable)).len(), 1);

        // Already below the limit; no second available edge.
        tracker.release(Model::Opus, b);
        assert_eq!(bus.history(Some(EventKind::CapacityAvailable)).len(), 1);
    }

    #[test]
    fn sync_replaces_ground_truth() {
        let (tracker, _bus) = tracker(1, 2, 1);
        tracker.reserve(Model::Sonnet, SessionId::new()).unwrap();

        let live = vec![(SessionId::new(), Model::Opus)];
        tracker.sync(&live);

        assert_eq!(tracker.available(Model::Opus), 0);
        assert_eq!(tracker.available(Model::Sonnet), 2);
    }

    #[test]
    fn counts_are_derived() {
        let (tracker, _bus) = tracker(2, 2, 2);
        tracker.reserve(Model::Opus, SessionId::new()).unwrap();
        tracker.reserve(Model::Haiku, SessionId::new()).unwrap();
        let counts = tracker.counts();
        assert_eq!(counts[&Model::Opus], 1);
        assert_eq!(counts[&Model::Sonnet], 0);
        assert_eq!(counts[&Model::Haiku], 1);
        assert_eq!(tracker.total_available(), 4);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Active counts never exceed limits under arbitrary interleavings
            /// of reserve and release.
            #[test]
            fn active_never_exceeds_limit(ops in proptest::collection::vec(0u8..4, 1..200)) {
                let (tracker, _bus) = tracker(1, 2, 3);
                let mut issued: Vec<(Model, SessionId)> = Vec::new();
                for op in ops {
                    match op {
                        0..=2 => {
                            let model = [Model::Opus, Model::Sonnet, Model::Haiku][op as usize];
                            let id = SessionId::new();
                            if tracker.reserve(model, id).is_ok() {
                                issued.push((model, id));
                            }
                        }
                        _ => {
                            if let Some((model, id)) = issued.pop() {
                                tracker.release(model, id);
                            }
                        }
                    }
                    let counts = tracker.counts();
                    prop_assert!(counts[&Model::Opus] <= 1);
                    prop_assert!(counts[&Model::Sonnet] <= 2);
                    prop_assert!(counts[&Model::Haiku] <= 3);
                }
            }
        }
    }
}
