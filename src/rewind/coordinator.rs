use std::{cell::RefCell, rc::Rc};

use log::{debug, error, info, warn};

use crate::{
    rewind::{
        error::RewindError,
        journal::RewindJournal,
        record::{RecordKind, RewindRecord},
        rewindable::{Rewindable, RewinderId, Simulator},
    },
    types::Tick,
};

/// Tuning knobs for the coordinator.
#[derive(Clone, Debug)]
pub struct RewindConfig {
    /// Capture a state record from every rewindable each `state_frequency`
    /// ticks.
    pub state_frequency: Tick,
    /// Disabled entirely for local-only races to avoid the overhead;
    /// events are then applied immediately and nothing is recorded.
    pub enabled: bool,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            state_frequency: 6,
            enabled: true,
        }
    }
}

/// Orchestrates periodic state capture, rewind-to-tick and
/// replay-to-present. Holds no simulation logic itself; it drives the
/// registered [`Rewindable`] objects through their
/// capture/restore/undo/replay contract and asks the external
/// [`Simulator`] for the deterministic forward steps.
///
/// Owned exclusively by the main simulation thread; records arriving from
/// the network thread are handed over through the transport's event queue
/// and fed in via [`add_network_record`](Self::add_network_record).
pub struct RewindCoordinator {
    journal: RewindJournal,
    rewinders: Vec<Rc<RefCell<dyn Rewindable>>>,
    /// Network-sourced records staged until the next tick merges them.
    pending: Vec<RewindRecord>,
    config: RewindConfig,
    last_saved_state: Option<Tick>,
    /// True while a rewind is in flight, so a replayed event does not
    /// record itself again as a seemingly new event.
    is_rewinding: bool,
    overall_state_size: usize,
}

impl RewindCoordinator {
    pub fn new(config: RewindConfig) -> Self {
        Self {
            journal: RewindJournal::new(),
            rewinders: Vec::new(),
            pending: Vec::new(),
            config,
            last_saved_state: None,
            is_rewinding: false,
            overall_state_size: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_rewinding(&self) -> bool {
        self.is_rewinding
    }

    pub fn journal(&self) -> &RewindJournal {
        &self.journal
    }

    /// Total bytes captured into state records so far.
    pub fn overall_state_size(&self) -> usize {
        self.overall_state_size
    }

    /// Adds an object to the tracked set and captures an immediate
    /// confirmed baseline state at `current_tick`, so that every later
    /// rewind is guaranteed a restorable tick. Returns whether rewinding
    /// is enabled at all.
    pub fn register(
        &mut self,
        rewindable: Rc<RefCell<dyn Rewindable>>,
        current_tick: Tick,
    ) -> bool {
        if !self.config.enabled {
            self.rewinders.push(rewindable);
            return false;
        }
        let id = RewinderId(self.rewinders.len());
        let baseline = rewindable.borrow().capture();
        self.overall_state_size += baseline.len();
        self.rewinders.push(rewindable);
        // Registration happens before any rewind can involve the object,
        // so the baseline insert cannot be behind the boundary.
        if let Err(err) = self
            .journal
            .insert(RewindRecord::state(current_tick, id, baseline, true))
        {
            error!("failed to record baseline for {}: {}", id, err);
        }
        debug!("registered {} with baseline at tick {}", id, current_tick);
        true
    }

    pub fn rewinder_count(&self) -> usize {
        self.rewinders.len()
    }

    /// Captures a state record from every registered rewindable if the
    /// save cadence is due at `tick`. `confirmed` is true only when the
    /// states derive from server-authoritative data (on the server
    /// itself, or the initial client baseline).
    pub fn save_states(&mut self, tick: Tick, confirmed: bool) {
        if !self.config.enabled || self.is_rewinding {
            return;
        }
        if let Some(last) = self.last_saved_state {
            if tick.saturating_sub(last) < self.config.state_frequency {
                return;
            }
        }
        self.force_save_states(tick, confirmed);
    }

    /// Captures a state record from every rewindable regardless of
    /// cadence.
    pub fn force_save_states(&mut self, tick: Tick, confirmed: bool) {
        for (index, rewindable) in self.rewinders.iter().enumerate() {
            let buffer = rewindable.borrow().capture();
            self.overall_state_size += buffer.len();
            let record = RewindRecord::state(tick, RewinderId(index), buffer, confirmed);
            if let Err(err) = self.journal.insert(record) {
                error!("dropping state capture at tick {}: {}", tick, err);
            }
        }
        self.last_saved_state = Some(tick);
    }

    /// Appends an event record issued locally at `tick` (defaults to the
    /// caller's current tick). Events are atomic and never silently
    /// dropped: with rewinding disabled the event is applied immediately
    /// instead of recorded. Adding an event while a rewind is running is
    /// an error (it would re-record a replayed event) and is dropped with
    /// a diagnostic.
    pub fn add_event(&mut self, rewinder: RewinderId, buffer: Vec<u8>, confirmed: bool, tick: Tick) {
        if self.is_rewinding {
            error!("discarding event for {} added during a rewind", rewinder);
            return;
        }
        if !self.config.enabled {
            match self.rewinders.get(rewinder.0) {
                Some(rewindable) => rewindable.borrow_mut().replay(&buffer),
                None => error!("event for unregistered {}", rewinder),
            }
            return;
        }
        if let Err(err) = self
            .journal
            .insert(RewindRecord::event(tick, rewinder, buffer, confirmed))
        {
            error!("dropping local event at tick {}: {}", tick, err);
        }
    }

    /// Stages a record received from the network. Thread handoff happens
    /// in the transport layer; this runs on the main thread once per tick.
    /// Stale records are dropped with a warning rather than treated as
    /// programmer errors: behind the consumed boundary they were already
    /// rewound past, and behind the restorable floor garbage collection
    /// has freed the states a rewind to them would need.
    pub fn add_network_record(&mut self, record: RewindRecord) {
        let floor = self
            .journal
            .boundary()
            .max(self.journal.restorable_floor());
        if record.tick < floor {
            warn!(
                "dropping stale network record at tick {} (floor {})",
                record.tick, floor
            );
            return;
        }
        self.pending.push(record);
    }

    /// Merges staged network records into the journal and returns the
    /// oldest tick whose outcome they change, i.e. the rewind target.
    /// Past-tick events and confirmed states invalidate predicted state;
    /// an unconfirmed state is only a restore candidate and the replay
    /// ignores it, so it never triggers a rewind on its own.
    fn merge_pending(&mut self, now: Tick) -> Option<Tick> {
        let mut needs_rewind_to: Option<Tick> = None;
        for record in std::mem::take(&mut self.pending) {
            if record.tick < now && (record.is_event() || record.confirmed) {
                needs_rewind_to = Some(match needs_rewind_to {
                    Some(tick) => tick.min(record.tick),
                    None => record.tick,
                });
            }
            if let Err(err) = self.journal.insert(record) {
                error!("dropping merged network record: {}", err);
            }
        }
        needs_rewind_to
    }

    /// Per-tick entry point, called after the world has simulated
    /// through `now` and before it steps to `now + 1`. Merges network
    /// data, rewinds and replays if any merged record invalidates
    /// predicted state, then applies the records at `now` itself so
    /// they take effect exactly once before the next step. Events
    /// recorded at tick `t` therefore act on the state the step into
    /// `t` produced, both live and during a replay.
    pub fn play_events_till(
        &mut self,
        now: Tick,
        sim: &mut dyn Simulator,
    ) -> Result<(), RewindError> {
        if !self.config.enabled {
            return Ok(());
        }
        if let Some(target) = self.merge_pending(now) {
            self.try_rewind_to(target, now, sim)?;
        }

        // Replay the events that fall on the current tick; guard against
        // the replay re-recording them.
        self.is_rewinding = true;
        self.apply_records_at(now);
        self.is_rewinding = false;
        Ok(())
    }

    /// The central rollback algorithm. Rewinds to the deepest restorable
    /// tick at or before `target`, then replays forward to `now`:
    ///
    /// 1. find the rewind point `t_min`;
    /// 2. undo every record in `(t_min, now]` in reverse order;
    /// 3. restore every rewindable from its state at `t_min`;
    /// 4. walk forward one tick at a time, applying confirmed states,
    ///    ignoring stale predictions, replaying events, then running one
    ///    deterministic simulation step.
    ///
    /// On success the observable state is bit-identical to a simulation
    /// that never mis-predicted. Returns the exact tick rewound to.
    pub fn try_rewind_to(
        &mut self,
        target: Tick,
        now: Tick,
        sim: &mut dyn Simulator,
    ) -> Result<Tick, RewindError> {
        assert!(!self.is_rewinding, "rewind is not reentrant");
        let t_min = match self.journal.rewind_point(target, self.rewinders.len()) {
            Some(tick) => tick,
            None => {
                // No restorable tick: full replay from the oldest record.
                let oldest = self.journal.oldest_tick().unwrap_or(target);
                info!("no common state before {}, replaying from {}", target, oldest);
                oldest
            }
        };
        debug!("rewinding from {} to {} (target {})", now, t_min, target);
        self.is_rewinding = true;
        let result = self.run_rewind(t_min, now, sim);
        self.is_rewinding = false;
        let exact = result?;
        self.journal.mark_consumed(exact);
        Ok(exact)
    }

    /// Panicking wrapper: a failed restore indicates a determinism or
    /// protocol bug and a partial rewind is worse than a crash.
    ///
    /// # Panics
    /// Panics if a rewindable cannot be restored from its state buffer.
    pub fn rewind_to(&mut self, target: Tick, now: Tick, sim: &mut dyn Simulator) -> Tick {
        self.try_rewind_to(target, now, sim)
            .unwrap_or_else(|err| panic!("rewind aborted: {}", err))
    }

    fn run_rewind(
        &mut self,
        t_min: Tick,
        now: Tick,
        sim: &mut dyn Simulator,
    ) -> Result<Tick, RewindError> {
        // Undo pass, newest first. Unconfirmed states have nothing to
        // undo; events run their reversal logic.
        for record in self.journal.iter_range(t_min, now).rev() {
            if let RecordKind::Event { rewinder, buffer } = &record.kind {
                match self.rewinders.get(rewinder.0) {
                    Some(rewindable) => rewindable.borrow_mut().undo(buffer),
                    None => return Err(RewindError::UnknownRewinder { rewinder: *rewinder }),
                }
            }
        }

        // Restore every rewindable at the rewind point.
        for (index, rewindable) in self.rewinders.iter().enumerate() {
            let id = RewinderId(index);
            let record = self
                .journal
                .state_at_or_before(id, t_min)
                .ok_or(RewindError::MissingState {
                    rewinder: id,
                    tick: t_min,
                })?;
            if let Err(err) = rewindable.borrow_mut().restore(record.buffer()) {
                error!("restore failed for {} at tick {}: {}", id, record.tick, err);
                return Err(RewindError::RestoreFailed {
                    rewinder: id,
                    tick: record.tick,
                });
            }
        }

        // Forward pass: events at the rewind point itself were already in
        // effect when the restored states were captured, so replay starts
        // with the following tick.
        let mut current = t_min;
        while current < now {
            current += 1;
            if current < now {
                self.apply_records_at(current);
            }
            sim.simulate(1);
        }
        // Records at `now` are applied by the caller (play_events_till)
        // before the next regular step.
        Ok(t_min)
    }

    /// Applies all records at exactly `tick`: confirmed states overwrite
    /// predicted state, stale unconfirmed states are ignored, events are
    /// re-applied exactly once.
    fn apply_records_at(&self, tick: Tick) {
        for record in self.journal.records_at(tick) {
            match &record.kind {
                RecordKind::State { rewinder, buffer } => {
                    if !record.confirmed {
                        continue;
                    }
                    if let Some(rewindable) = self.rewinders.get(rewinder.0) {
                        if let Err(err) = rewindable.borrow_mut().restore(buffer) {
                            error!(
                                "ignoring unrestorable confirmed state for {} at {}: {}",
                                rewinder, tick, err
                            );
                        }
                    }
                }
                RecordKind::Event { rewinder, buffer } => {
                    match self.rewinders.get(rewinder.0) {
                        Some(rewindable) => rewindable.borrow_mut().replay(buffer),
                        None => error!("event for unregistered {} at {}", rewinder, tick),
                    }
                }
            }
        }
    }

    /// Frees obsolete records; see [`RewindJournal::garbage_collect`].
    pub fn garbage_collect(&mut self, horizon: Tick) {
        let count = self.rewinders.len();
        self.journal.garbage_collect(horizon, count);
    }

    /// Frees all saved information between races.
    pub fn reset(&mut self) {
        self.journal.reset();
        self.pending.clear();
        self.last_saved_state = None;
        self.is_rewinding = false;
        self.overall_state_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A kart reduced to one speed value: deterministic, byte-serializable
    /// and shared between the world and the coordinator.
    struct TestKart {
        speed: u32,
        replayed: Vec<u32>,
    }

    impl TestKart {
        fn shared(speed: u32) -> Rc<RefCell<TestKart>> {
            Rc::new(RefCell::new(TestKart {
                speed,
                replayed: Vec::new(),
            }))
        }
    }

    impl Rewindable for TestKart {
        fn capture(&self) -> Vec<u8> {
            self.speed.to_be_bytes().to_vec()
        }

        fn restore(&mut self, state: &[u8]) -> Result<(), RewindError> {
            let bytes: [u8; 4] =
                state
                    .try_into()
                    .map_err(|_| RewindError::CorruptState {
                        rewinder: RewinderId(0),
                        detail: "state is not 4 bytes",
                    })?;
            self.speed = u32::from_be_bytes(bytes);
            Ok(())
        }

        fn undo(&mut self, event: &[u8]) {
            self.speed -= u32::from(event[0]);
        }

        fn replay(&mut self, event: &[u8]) {
            self.speed += u32::from(event[0]);
            self.replayed.push(u32::from(event[0]));
        }
    }

    /// World step: every tick adds 1 to every kart's speed.
    struct TestWorld {
        karts: Vec<Rc<RefCell<TestKart>>>,
        tick: Tick,
    }

    impl Simulator for TestWorld {
        fn simulate(&mut self, ticks: u32) {
            for _ in 0..ticks {
                for kart in &self.karts {
                    kart.borrow_mut().speed += 1;
                }
                self.tick += 1;
            }
        }
    }

    fn setup(speed: u32) -> (RewindCoordinator, Rc<RefCell<TestKart>>, TestWorld) {
        let kart = TestKart::shared(speed);
        let mut coordinator = RewindCoordinator::new(RewindConfig {
            state_frequency: 1,
            enabled: true,
        });
        assert!(coordinator.register(kart.clone(), 0));
        let world = TestWorld {
            karts: vec![kart.clone()],
            tick: 0,
        };
        (coordinator, kart, world)
    }

    #[test]
    fn register_disabled_applies_nothing() {
        let kart = TestKart::shared(5);
        let mut coordinator = RewindCoordinator::new(RewindConfig {
            state_frequency: 1,
            enabled: false,
        });
        assert!(!coordinator.register(kart.clone(), 0));
        // With rewinding disabled the event applies immediately.
        coordinator.add_event(RewinderId(0), vec![3], false, 0);
        assert_eq!(kart.borrow().speed, 8);
        assert!(coordinator.journal().is_empty());
    }

    #[test]
    fn rewind_to_now_is_identity() {
        let (mut coordinator, kart, mut world) = setup(10);
        world.simulate(5);
        coordinator.force_save_states(5, false);
        let before = kart.borrow().speed;
        coordinator.try_rewind_to(5, 5, &mut world).unwrap();
        assert_eq!(kart.borrow().speed, before);
    }

    #[test]
    fn confirmed_state_triggers_correction() {
        let (mut coordinator, kart, mut world) = setup(0);
        // Simulate 10 ticks of pure prediction, saving each tick.
        for tick in 1..=10 {
            world.simulate(1);
            coordinator.save_states(tick, false);
        }
        assert_eq!(kart.borrow().speed, 10);

        // Server says speed was 100 at tick 8.
        coordinator.add_network_record(RewindRecord::state(
            8,
            RewinderId(0),
            100u32.to_be_bytes().to_vec(),
            true,
        ));
        coordinator.play_events_till(10, &mut world).unwrap();

        // Restored 100 at tick 8, simulated 2 steps forward.
        assert_eq!(kart.borrow().speed, 102);
    }

    #[test]
    fn events_replay_exactly_once_in_order() {
        let (mut coordinator, kart, mut world) = setup(0);
        for tick in 1..=6 {
            world.simulate(1);
            coordinator.save_states(tick, false);
            if tick == 2 || tick == 4 {
                coordinator.add_event(RewinderId(0), vec![tick as u8], false, tick);
                kart.borrow_mut().speed += u32::from(tick as u8);
            }
        }
        kart.borrow_mut().replayed.clear();

        // A confirmed state at tick 1 forces a full replay of both events.
        coordinator.add_network_record(RewindRecord::state(
            1,
            RewinderId(0),
            1u32.to_be_bytes().to_vec(),
            true,
        ));
        coordinator.play_events_till(6, &mut world).unwrap();

        assert_eq!(kart.borrow().replayed, vec![2, 4]);
        // 1 (confirmed at tick 1) + 5 simulation steps + events 2 and 4.
        assert_eq!(kart.borrow().speed, 1 + 5 + 2 + 4);
    }

    #[test]
    fn matching_confirmation_changes_nothing() {
        let (mut coordinator, kart, mut world) = setup(0);
        for tick in 1..=6 {
            world.simulate(1);
            coordinator.save_states(tick, false);
        }
        assert_eq!(kart.borrow().speed, 6);

        // The server agrees with the prediction at tick 3; the replay
        // must land exactly where the prediction already was.
        coordinator.add_network_record(RewindRecord::state(
            3,
            RewinderId(0),
            3u32.to_be_bytes().to_vec(),
            true,
        ));
        coordinator.play_events_till(6, &mut world).unwrap();
        assert_eq!(kart.borrow().speed, 6);
    }

    #[test]
    fn unconfirmed_network_state_does_not_trigger_a_rewind() {
        let (mut coordinator, kart, mut world) = setup(0);
        for tick in 1..=6 {
            world.simulate(1);
            coordinator.save_states(tick, false);
            if tick == 2 {
                coordinator.add_event(RewinderId(0), vec![4], false, tick);
                kart.borrow_mut().speed += 4;
            }
        }
        kart.borrow_mut().replayed.clear();

        // A remote prediction is only a restore candidate; no rewind,
        // so the local event is not replayed again.
        coordinator.add_network_record(RewindRecord::state(
            3,
            RewinderId(0),
            50u32.to_be_bytes().to_vec(),
            false,
        ));
        coordinator.play_events_till(6, &mut world).unwrap();

        assert!(kart.borrow().replayed.is_empty());
        assert_eq!(kart.borrow().speed, 10);
    }

    #[test]
    fn late_records_below_the_gc_floor_are_dropped() {
        let (mut coordinator, kart, mut world) = setup(0);
        for tick in 1..=20 {
            world.simulate(1);
            coordinator.save_states(tick, false);
        }
        coordinator.force_save_states(20, true);
        coordinator.garbage_collect(15);

        // Garbage collection freed every state before tick 15, so a
        // rewind for this event could no longer restore anything; it
        // must be discarded instead of aborting the next replay.
        coordinator.add_network_record(RewindRecord::event(
            10,
            RewinderId(0),
            vec![5],
            true,
        ));
        coordinator.play_events_till(21, &mut world).unwrap();

        assert!(kart.borrow().replayed.is_empty());
        assert_eq!(kart.borrow().speed, 20);
    }

    #[test]
    fn corrupt_state_aborts_the_rewind() {
        let (mut coordinator, _kart, mut world) = setup(0);
        world.simulate(3);
        coordinator.add_network_record(RewindRecord::state(
            2,
            RewinderId(0),
            vec![0xff],
            true,
        ));
        let err = coordinator.play_events_till(3, &mut world).unwrap_err();
        assert!(matches!(err, RewindError::RestoreFailed { .. }));
    }

    #[test]
    fn server_scenario_rewind_to_latest_confirmed() {
        // Client predicted ticks 101..=110; server confirms tick 108.
        let (mut coordinator, kart, mut world) = setup(0);
        coordinator.force_save_states(100, true);
        for tick in 101..=110 {
            world.simulate(1);
            coordinator.save_states(tick, false);
            if tick == 105 {
                coordinator.add_event(RewinderId(0), vec![7], false, tick);
                kart.borrow_mut().speed += 7;
            }
        }
        assert_eq!(kart.borrow().speed, 17);

        // Confirmed S108 disagrees with the prediction.
        coordinator.add_network_record(RewindRecord::state(
            108,
            RewinderId(0),
            50u32.to_be_bytes().to_vec(),
            true,
        ));
        coordinator.play_events_till(110, &mut world).unwrap();

        // Rewind point is 108 (latest tick with states for everyone);
        // no events after 108, so the result is S108 plus two steps.
        assert_eq!(kart.borrow().speed, 52);
    }
}
