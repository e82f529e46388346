//! The race phase state machine.
//!
//! [`PhaseController`] owns the single show instance behind one lock. A
//! transition mutates the show under that lock and collects its side
//! effects; events are published and the fleet broadcast is spawned only
//! after the lock is released, so command execution never holds the show
//! lock.
//!
//! Auto-progression runs two loops sharing one cancellation token: the
//! phase timer and the odds drift. The timer cancels the token itself when
//! the terminal phase is reached.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::entity;
use super::entity::Entity;
use super::phase::Phase;
use super::phase::PhaseProfile;
use super::state;
use super::state::Bet;
use super::state::BetBook;
use super::state::OddsUpdate;
use super::state::RaceResults;
use super::state::RunStatus;
use super::state::Show;
use super::state::StateSnapshot;
use crate::config::ShowConfig;
use crate::error::Error;
use crate::error::Result;
use crate::event::Event;
use crate::event::EventBus;
use crate::fleet::command::Color;
use crate::fleet::command::Command;
use crate::fleet::command::CommandKind;
use crate::fleet::command::CommandOutcome;
use crate::fleet::dispatcher::Dispatcher;

/// Where phase commands go
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Wrap `kind` with the sink's default timeout, retries and priority
    fn command(&self, kind: CommandKind) -> Command;

    async fn broadcast(&self, command: Command) -> Vec<CommandOutcome>;
}

#[async_trait]
impl CommandSink for Dispatcher {
    fn command(&self, kind: CommandKind) -> Command {
        Dispatcher::command(self, kind)
    }

    async fn broadcast(&self, command: Command) -> Vec<CommandOutcome> {
        Dispatcher::broadcast(self, command, |_| true).await
    }
}

/// Side effects of one transition, applied after the show lock is dropped
#[must_use]
#[derive(Debug, Default)]
struct Effects {
    events: Vec<Event>,
    command: Option<CommandKind>,
}

enum Step {
    Wait(Duration),
    Advanced(Effects),
    Done,
}

struct Inner {
    config: ShowConfig,
    profile: PhaseProfile,
    show: Mutex<Show>,
    fleet: Option<Arc<dyn CommandSink>>,
    events: Arc<EventBus>,
    loops: Mutex<Option<CancellationToken>>,
}

/// Cheap to clone; clones drive the same show
#[derive(Clone)]
pub struct PhaseController {
    inner: Arc<Inner>,
}

impl PhaseController {
    /// Build a controller with a fresh show in the profile's initial phase.
    ///
    /// `fleet` of `None` runs the state machine without any boards.
    pub fn new(
        config: ShowConfig,
        fleet: Option<Arc<dyn CommandSink>>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::validation("show", e.to_string()))?;
        let overrides = config
            .duration_overrides()
            .map_err(|e| Error::validation("durations", e.to_string()))?;
        let profile =
            PhaseProfile::from_kind(config.profile, config.betting).with_durations(&overrides)?;
        let show = fresh_show(&config, &profile, None)?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                profile,
                show: Mutex::new(show),
                fleet,
                events,
                loops: Mutex::new(None),
            }),
        })
    }

    pub fn profile(&self) -> &PhaseProfile {
        &self.inner.profile
    }

    fn show(&self) -> MutexGuard<'_, Show> {
        self.inner
            .show
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the show with a new instance, generating entities when
    /// simulated
    pub fn create(&self) -> Result<StateSnapshot> {
        self.replace(None)
    }

    /// Replace the show with a new instance over caller-supplied entries
    pub fn create_with_entities(&self, entities: Vec<Entity>) -> Result<StateSnapshot> {
        self.replace(Some(entities))
    }

    fn replace(&self, entities: Option<Vec<Entity>>) -> Result<StateSnapshot> {
        let show = fresh_show(&self.inner.config, &self.inner.profile, entities)?;
        let mut guard = self.show();
        self.cancel_loops();
        *guard = show;
        info!(
            "Created show '{}' with {} entities",
            guard.name,
            guard.entities.len()
        );
        Ok(guard.snapshot(Instant::now()))
    }

    pub fn state(&self) -> StateSnapshot {
        self.show().snapshot(Instant::now())
    }

    /// Move to the next phase
    pub fn advance(&self) -> Result<StateSnapshot> {
        let (snapshot, effects) = {
            let mut show = self.show();
            let next = self
                .inner
                .profile
                .next(show.phase)
                .ok_or_else(|| {
                    Error::precondition(format!("{} is the final phase", show.phase))
                })?;
            let now = Instant::now();
            let effects = self.transition(&mut show, next, now);
            (show.snapshot(now), effects)
        };
        self.apply(effects);
        Ok(snapshot)
    }

    /// Jump straight to `phase`, bypassing the ordering
    pub fn set_state(&self, phase: Phase) -> Result<StateSnapshot> {
        if !self.inner.profile.contains(phase) {
            return Err(Error::validation(
                "state",
                format!("{} is not part of this show's profile", phase),
            ));
        }
        let (snapshot, effects) = {
            let mut show = self.show();
            let now = Instant::now();
            let effects = self.transition(&mut show, phase, now);
            (show.snapshot(now), effects)
        };
        self.apply(effects);
        Ok(snapshot)
    }

    /// `set_state` by canonical name or alias
    pub fn set_state_by_name(&self, name: &str) -> Result<StateSnapshot> {
        self.set_state(Phase::resolve(name)?)
    }

    /// Start auto-progression from the current phase
    pub fn start(&self) -> Result<StateSnapshot> {
        let handle = Handle::try_current()
            .map_err(|_| Error::precondition("auto-progression needs a running tokio runtime"))?;
        let mut show = self.show();
        match show.run {
            RunStatus::Running => {
                warn!("Auto-progression already running");
                return Ok(show.snapshot(Instant::now()));
            }
            RunStatus::Paused => {
                return Err(Error::precondition("show is paused; resume it instead"))
            }
            RunStatus::Stopped | RunStatus::Completed => {}
        }
        if show.is_terminal() {
            return Err(Error::precondition(format!(
                "show already reached {}; reset first",
                show.phase
            )));
        }

        self.cancel_loops();
        let token = CancellationToken::new();
        *self
            .inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        show.run = RunStatus::Running;
        handle.spawn(self.clone().timer_loop(token.clone()));
        handle.spawn(self.clone().drift_loop(token));
        info!("Auto-progression started in {}", show.phase);
        Ok(show.snapshot(Instant::now()))
    }

    /// Stop auto-progression. The phase is left where it is.
    pub fn stop(&self) -> StateSnapshot {
        let mut show = self.show();
        let now = Instant::now();
        self.cancel_loops();
        if matches!(show.run, RunStatus::Running | RunStatus::Paused) {
            show.unpause(now);
            show.run = RunStatus::Stopped;
            info!("Auto-progression stopped in {}", show.phase);
        }
        show.snapshot(now)
    }

    /// Freeze the phase clock
    pub fn pause(&self) -> Result<StateSnapshot> {
        let mut show = self.show();
        if show.run != RunStatus::Running {
            return Err(Error::precondition(format!(
                "cannot pause a show that is {}",
                show.run
            )));
        }
        let now = Instant::now();
        show.pause(now);
        show.run = RunStatus::Paused;
        info!("Paused in {}", show.phase);
        Ok(show.snapshot(now))
    }

    pub fn resume(&self) -> Result<StateSnapshot> {
        let mut show = self.show();
        if show.run != RunStatus::Paused {
            return Err(Error::precondition(format!(
                "cannot resume a show that is {}",
                show.run
            )));
        }
        let now = Instant::now();
        show.unpause(now);
        show.run = RunStatus::Running;
        info!("Resumed in {}", show.phase);
        Ok(show.snapshot(now))
    }

    /// Stop, clear results and bets, return to the initial phase and
    /// regenerate simulated entities
    pub fn reset(&self) -> StateSnapshot {
        let (snapshot, effects) = {
            let mut show = self.show();
            self.cancel_loops();
            let now = Instant::now();
            let config = &self.inner.config;
            let entities = if show.simulated {
                Some(entity::generate(
                    config.entity_count,
                    config.randomness,
                    &mut show.rng,
                ))
            } else {
                None
            };
            let old = show.reset(entities, now);
            let effects = Effects {
                events: vec![Event::StateChange(show.state_change(old, now))],
                command: self.entry_command(&show),
            };
            info!("Show reset to {}", show.phase);
            (show.snapshot(now), effects)
        };
        self.apply(effects);
        snapshot
    }

    pub fn set_results(&self, win: u32, place: u32, show: u32) -> Result<RaceResults> {
        let results = self.show().set_results(win, place, show)?;
        info!(
            "Results: {} / {} / {}",
            results.win.name, results.place.name, results.show.name
        );
        self.inner.events.publish(Event::Results(results.clone()));
        Ok(results)
    }

    /// `None` until results have been set since the last reset
    pub fn get_results(&self) -> Option<RaceResults> {
        self.show().results()
    }

    pub fn clear_results(&self) {
        self.show().clear_results();
    }

    pub fn entities(&self) -> Vec<Entity> {
        self.show().entities.clone()
    }

    pub fn entity(&self, id: u32) -> Result<Entity> {
        self.show()
            .entity(id)
            .cloned()
            .ok_or_else(|| Error::not_found("entity", id.to_string()))
    }

    pub fn place_bet(&self, guest_name: &str, horse_id: u32, amount: f64) -> Result<Bet> {
        let bet = self.show().place_bet(guest_name, horse_id, amount)?;
        debug!(
            "{} bet {:.2} on #{}",
            bet.guest_name, bet.amount, bet.horse_id
        );
        Ok(bet)
    }

    pub fn bets(&self) -> BetBook {
        self.show().bet_book()
    }

    /// Enter `to`. The caller holds the show lock.
    fn transition(&self, show: &mut Show, to: Phase, now: Instant) -> Effects {
        let old = show.enter(to, now);
        let mut events = Vec::new();

        let settles = self
            .inner
            .profile
            .spec(to)
            .is_some_and(|spec| spec.settles);
        if settles && show.simulated && self.inner.config.auto_results && show.placings().is_none()
        {
            if let Some(results) = show.settle_from_progress() {
                info!("Settled from race progress: {} wins", results.win.name);
                events.push(Event::Results(results));
            }
        }

        if show.is_terminal() && matches!(show.run, RunStatus::Running | RunStatus::Paused) {
            show.unpause(now);
            show.run = RunStatus::Completed;
        }

        info!("Phase {} -> {}", old, to);
        events.insert(0, Event::StateChange(show.state_change(old, now)));
        Effects {
            events,
            command: self.entry_command(show),
        }
    }

    /// The command broadcast on entering the show's current phase
    fn entry_command(&self, show: &Show) -> Option<CommandKind> {
        let spec = self.inner.profile.spec(show.phase)?;
        match show.results() {
            Some(results) if spec.spotlight => Some(CommandKind::WinnerSpotlight {
                entity_id: results.win.id,
                color: Color::parse(&results.win.color).ok(),
            }),
            _ => spec.command.clone(),
        }
    }

    fn apply(&self, effects: Effects) {
        for event in effects.events {
            self.inner.events.publish(event);
        }
        let (Some(kind), Some(fleet)) = (effects.command, self.inner.fleet.clone()) else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            warn!("No runtime; {} not broadcast", kind.verb());
            return;
        };
        handle.spawn(async move {
            let command = fleet.command(kind);
            let verb = command.verb();
            let results = fleet.broadcast(command).await;
            let acknowledged = results.iter().filter(|o| o.is_success()).count();
            info!(
                "{} acknowledged by {}/{} devices",
                verb,
                acknowledged,
                results.len()
            );
        });
    }

    fn cancel_loops(&self) {
        if let Some(token) = self
            .inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    /// Decide what the timer does next, advancing under the lock when the
    /// current phase has expired
    fn poll(&self, cancel: &CancellationToken) -> Step {
        let mut show = self.show();
        if cancel.is_cancelled() || show.is_terminal() {
            return Step::Done;
        }
        let tick = self.inner.config.tick();
        match show.run {
            RunStatus::Running => {}
            RunStatus::Paused => return Step::Wait(tick),
            RunStatus::Stopped | RunStatus::Completed => return Step::Done,
        }
        let now = Instant::now();
        match show.remaining(now) {
            Some(remaining) if remaining.is_zero() => {
                let Some(next) = self.inner.profile.next(show.phase) else {
                    return Step::Done;
                };
                Step::Advanced(self.transition(&mut show, next, now))
            }
            Some(remaining) => Step::Wait(remaining.min(tick)),
            None => Step::Done,
        }
    }

    /// Advance simulated progress by `step` of the current racing phase
    fn simulate(&self, step: Duration) {
        let mut show = self.show();
        if show.is_paused() || !show.simulated {
            return;
        }
        let racing = self
            .inner
            .profile
            .spec(show.phase)
            .is_some_and(|spec| spec.racing);
        match show.duration() {
            Some(duration) if racing && !duration.is_zero() => {
                show.run_entities(step.as_secs_f64() / duration.as_secs_f64());
            }
            _ => {}
        }
    }

    async fn timer_loop(self, cancel: CancellationToken) {
        debug!("Phase timer started");
        loop {
            match self.poll(&cancel) {
                Step::Done => break,
                Step::Advanced(effects) => self.apply(effects),
                Step::Wait(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => self.simulate(wait),
                    }
                }
            }
        }
        cancel.cancel();
        debug!("Phase timer stopped");
    }

    async fn drift_loop(self, cancel: CancellationToken) {
        let drift = self.inner.config.odds_drift.clone();
        loop {
            let wait = {
                let mut show = self.show();
                Duration::from_millis(
                    show.rng
                        .random_range(drift.min_interval_ms..=drift.max_interval_ms),
                )
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let update = {
                let mut show = self.show();
                if show.is_paused() || !show.phase.drifts_odds() {
                    continue;
                }
                show.drift_odds(drift.percent, drift.floor);
                OddsUpdate {
                    horses: show.entities.clone(),
                }
            };
            self.inner.events.publish(Event::OddsUpdate(update));
        }
        debug!("Odds drift stopped");
    }
}

fn fresh_show(
    config: &ShowConfig,
    profile: &PhaseProfile,
    entities: Option<Vec<Entity>>,
) -> Result<Show> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let simulated = config.simulated && entities.is_none();
    let entities = match entities {
        Some(entities) => {
            state::validate_entities(&entities)?;
            entities
        }
        None if config.simulated => {
            entity::generate(config.entity_count, config.randomness, &mut rng)
        }
        None => Vec::new(),
    };
    Ok(Show::new(
        config.name.clone(),
        profile.clone(),
        entities,
        simulated,
        rng,
        Instant::now(),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::collections::HashSet;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<CommandKind>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<CommandKind> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandSink for RecordingSink {
        fn command(&self, kind: CommandKind) -> Command {
            Command::new(kind)
        }

        async fn broadcast(&self, command: Command) -> Vec<CommandOutcome> {
            self.sent.lock().unwrap().push(command.kind);
            Vec::new()
        }
    }

    fn config() -> ShowConfig {
        ShowConfig {
            seed: Some(11),
            ..ShowConfig::default()
        }
    }

    fn controller(config: ShowConfig) -> (PhaseController, Arc<RecordingSink>, Arc<EventBus>) {
        let sink = Arc::new(RecordingSink::default());
        let events = Arc::new(EventBus::new());
        let controller = PhaseController::new(config, Some(sink.clone()), events.clone()).unwrap();
        (controller, sink, events)
    }

    fn record_events(events: &EventBus) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_progression_reaches_official_and_stays() {
        let (controller, sink, _) = controller(config());
        controller.set_state(Phase::Dormant).unwrap();
        controller.start().unwrap();

        let total = controller.profile().remaining_total(Phase::Dormant);
        assert_eq!(total, Duration::from_secs(150));
        tokio::time::sleep(total + Duration::from_secs(2)).await;

        let state = controller.state();
        assert_eq!(state.state, Phase::Official);
        assert_eq!(state.run_status, RunStatus::Completed);
        assert_eq!(state.remaining_seconds, None);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(controller.state().state, Phase::Official);

        // settled from simulated progress, then spotlighted
        let results = controller.get_results().unwrap();
        assert_eq!(state.win, Some(results.win.id));
        match sink.sent().last() {
            Some(CommandKind::WinnerSpotlight { entity_id, color }) => {
                assert_eq!(*entity_id, results.win.id);
                assert_eq!(color.as_ref().map(Color::as_str), Some(results.win.color.as_str()));
            }
            other => panic!("expected spotlight, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_commands_follow_entries() {
        let (controller, sink, _) = controller(config());
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;
        controller.stop();

        let animations: Vec<String> = sink
            .sent()
            .into_iter()
            .filter_map(|kind| match kind {
                CommandKind::Animation { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(animations, vec!["welcome", "betting_60", "final_call"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_advancement() {
        let (controller, _, _) = controller(config());
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(controller.state().state, Phase::BettingOpen);

        let stopped = controller.stop();
        assert_eq!(stopped.run_status, RunStatus::Stopped);
        tokio::time::sleep(Duration::from_secs(600)).await;

        let state = controller.state();
        assert_eq!(state.state, Phase::BettingOpen);
        assert_eq!(state.remaining_seconds, Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_the_clock() {
        let (controller, _, _) = controller(config());
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.state().state, Phase::EntriesLoaded);

        let paused = controller.pause().unwrap();
        assert_eq!(paused.remaining_seconds, Some(20.0));
        tokio::time::sleep(Duration::from_secs(100)).await;
        let state = controller.state();
        assert_eq!(state.state, Phase::EntriesLoaded);
        assert_eq!(state.remaining_seconds, Some(20.0));
        assert!(controller.pause().is_err());

        controller.resume().unwrap();
        assert!(controller.resume().is_err());
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(controller.state().state, Phase::BettingOpen);
        controller.stop();
    }

    #[tokio::test]
    async fn test_advance_and_set_state() {
        let (controller, _, events) = controller(config());
        let seen = record_events(&events);

        assert_eq!(controller.advance().unwrap().state, Phase::Dormant);
        assert_eq!(
            controller.set_state_by_name("post").unwrap().state,
            Phase::AtThePost
        );
        assert_eq!(
            controller.set_state_by_name("official").unwrap().state,
            Phase::Official
        );
        assert_eq!(controller.advance().unwrap_err().code(), "precondition");
        assert_eq!(
            controller.set_state(Phase::DuringRace).unwrap_err().code(),
            "validation"
        );
        assert!(controller.start().is_err());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        match &seen[1] {
            Event::StateChange(change) => {
                assert_eq!(change.old_state, Phase::Dormant);
                assert_eq!(change.new_state, Phase::AtThePost);
                assert_eq!(change.horses.len(), 8);
                assert_eq!(change.state_info.state, Phase::AtThePost);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_results_publish_and_reject_duplicates() {
        let (controller, _, events) = controller(config());
        let seen = record_events(&events);
        assert!(controller.get_results().is_none());

        let results = controller.set_results(3, 1, 6).unwrap();
        assert_eq!(results.win.id, 3);
        assert!(controller.set_results(5, 5, 7).is_err());
        assert_eq!(controller.get_results().unwrap().place.id, 1);
        assert_eq!(controller.state().show, Some(6));
        assert_eq!(seen.lock().unwrap().len(), 1);

        controller.clear_results();
        assert!(controller.get_results().is_none());
        assert!(controller.entities().iter().all(|e| e.rank.is_none()));
    }

    #[tokio::test]
    async fn test_reset_clears_and_regenerates() {
        let (controller, _, _) = controller(ShowConfig {
            entity_count: 12,
            ..config()
        });
        controller.set_state(Phase::BettingOpen).unwrap();
        controller.place_bet("Ana", 4, 20.0).unwrap();
        controller.set_results(1, 2, 3).unwrap();

        let state = controller.reset();
        assert_eq!(state.state, Phase::Idle);
        assert_eq!(state.win, None);
        assert!(controller.bets().bets.is_empty());
        assert!(controller.get_results().is_none());

        let entities = controller.entities();
        assert_eq!(entities.len(), 12);
        let ids: HashSet<u32> = entities.iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 12);
        assert!(entities.iter().all(|e| e.rank.is_none()));
    }

    #[tokio::test]
    async fn test_betting_window() {
        let (controller, _, _) = controller(config());
        assert!(controller.place_bet("Ana", 1, 5.0).is_err());
        controller.set_state_by_name("betting").unwrap();
        controller.place_bet("Ana", 1, 5.0).unwrap();
        controller.place_bet("Bo", 1, 7.5).unwrap();
        let book = controller.bets();
        assert_eq!(book.totals[&1].bet_count, 2);
        assert_eq!(book.totals[&1].total_amount, 12.5);
        assert_eq!(controller.entity(99).unwrap_err().code(), "not_found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_odds_drift_only_while_betting() {
        let (controller, _, events) = controller(config());
        let seen = record_events(&events);
        controller.set_state(Phase::BettingOpen).unwrap();
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(50)).await;
        controller.stop();

        let updates: Vec<OddsUpdate> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::OddsUpdate(update) => Some(update.clone()),
                _ => None,
            })
            .collect();
        assert!(updates.len() >= 8, "only {} updates", updates.len());
        assert!(updates
            .iter()
            .flat_map(|u| u.horses.iter())
            .all(|h| h.odds >= 1.1));

        controller.set_state(Phase::AtThePost).unwrap();
        controller.start().unwrap();
        let before = seen.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(12)).await;
        controller.stop();
        let later = seen.lock().unwrap();
        assert!(later[before..]
            .iter()
            .all(|e| !matches!(e, Event::OddsUpdate(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simple_profile_from_configuration() {
        let (controller, sink, _) = controller(ShowConfig {
            profile: crate::show::phase::ProfileKind::Simple,
            durations: HashMap::from([("pre_race".to_string(), 5)]),
            ..config()
        });
        assert_eq!(controller.state().state, Phase::PreRace);
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(51)).await;

        let state = controller.state();
        assert_eq!(state.state, Phase::AfterRace);
        assert_eq!(state.run_status, RunStatus::Completed);
        assert!(state.win.is_some());
        assert!(matches!(
            sink.sent().last(),
            Some(CommandKind::WinnerSpotlight { .. })
        ));
    }

    #[tokio::test]
    async fn test_supplied_entities() {
        let (controller, _, _) = controller(config());
        let entries = vec![Entity::new(1, "A"), Entity::new(2, "B"), Entity::new(3, "C")];
        controller.create_with_entities(entries).unwrap();
        assert_eq!(controller.entities().len(), 3);
        assert_eq!(controller.entity(2).unwrap().name, "B");

        let dup = vec![Entity::new(1, "A"), Entity::new(1, "B")];
        assert!(controller.create_with_entities(dup).is_err());
        assert_eq!(controller.entities().len(), 3);

        // reset keeps supplied entries
        controller.reset();
        assert_eq!(controller.entities().len(), 3);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut inverted = config();
        inverted.odds_drift.min_interval_ms = 9_000;
        inverted.odds_drift.max_interval_ms = 1_000;
        let Err(err) = PhaseController::new(inverted, None, Arc::new(EventBus::new())) else {
            panic!("inverted drift interval accepted");
        };
        assert_eq!(err.code(), "validation");
        assert!(err.to_string().contains("odds_drift"));

        let empty = ShowConfig {
            entity_count: 0,
            ..config()
        };
        assert!(PhaseController::new(empty, None, Arc::new(EventBus::new())).is_err());
    }
}
