//! Show instance state and its wire snapshots.
//!
//! [`Show`] is plain data guarded by the controller's lock; every method
//! here is synchronous and takes the current instant explicitly.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::entity;
use super::entity::Entity;
use super::phase::Phase;
use super::phase::PhaseProfile;
use crate::error::Error;
use crate::error::Result;

/// Whether the auto-progression timer is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
    Paused,
    Completed,
}

/// Post positions finishing first, second and third
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placings {
    pub win: u32,
    pub place: u32,
    pub show: u32,
}

/// `get_state` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub name: String,
    pub state: Phase,
    pub run_status: RunStatus,
    pub elapsed_seconds: f64,
    /// `None` in the terminal phase
    pub duration_seconds: Option<f64>,
    pub remaining_seconds: Option<f64>,
    /// Fraction of the current phase elapsed, 0-1
    pub progress: Option<f64>,
    pub win: Option<u32>,
    pub place: Option<u32>,
    pub show: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub old_state: Phase,
    pub new_state: Phase,
    pub timestamp: DateTime<Utc>,
    pub state_info: StateSnapshot,
    pub horses: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsUpdate {
    pub horses: Vec<Entity>,
}

/// Finishing entities, in rank order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceResults {
    pub win: Entity,
    pub place: Entity,
    pub show: Entity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: Uuid,
    pub guest_name: String,
    pub horse_id: u32,
    pub amount: f64,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BetTotal {
    pub total_amount: f64,
    pub bet_count: u32,
}

/// Every bet plus per-entity totals
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BetBook {
    pub bets: Vec<Bet>,
    pub totals: BTreeMap<u32, BetTotal>,
}

/// The single active show instance
#[derive(Debug)]
pub struct Show {
    pub name: String,
    pub profile: PhaseProfile,
    pub phase: Phase,
    pub run: RunStatus,
    pub entities: Vec<Entity>,
    pub simulated: bool,
    entered_at: Instant,
    paused_at: Option<Instant>,
    paused_for: Duration,
    bets: Vec<Bet>,
    results: Option<Placings>,
    pub(crate) rng: StdRng,
}

impl Show {
    pub fn new(
        name: impl Into<String>,
        profile: PhaseProfile,
        entities: Vec<Entity>,
        simulated: bool,
        rng: StdRng,
        now: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            phase: profile.initial(),
            profile,
            run: RunStatus::Stopped,
            entities,
            simulated,
            entered_at: now,
            paused_at: None,
            paused_for: Duration::ZERO,
            bets: Vec::new(),
            results: None,
            rng,
        }
    }

    /// Time in the current phase, excluding paused intervals
    pub fn elapsed(&self, now: Instant) -> Duration {
        let until = self.paused_at.unwrap_or(now);
        until
            .saturating_duration_since(self.entered_at)
            .saturating_sub(self.paused_for)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.profile.duration(self.phase)
    }

    /// `max(0, duration - elapsed)`, `None` in the terminal phase
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.duration()
            .map(|d| d.saturating_sub(self.elapsed(now)))
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == self.profile.terminal()
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Enter `phase` at `now`. A paused show stays paused.
    pub fn enter(&mut self, phase: Phase, now: Instant) -> Phase {
        let old = self.phase;
        self.phase = phase;
        self.entered_at = now;
        self.paused_for = Duration::ZERO;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
        old
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn unpause(&mut self, now: Instant) {
        if let Some(at) = self.paused_at.take() {
            self.paused_for += now.saturating_duration_since(at);
        }
    }

    pub fn snapshot(&self, now: Instant) -> StateSnapshot {
        let elapsed = self.elapsed(now);
        let duration = self.duration();
        let progress = duration.map(|d| {
            if d.is_zero() {
                1.0
            } else {
                (elapsed.as_secs_f64() / d.as_secs_f64()).min(1.0)
            }
        });
        StateSnapshot {
            name: self.name.clone(),
            state: self.phase,
            run_status: self.run,
            elapsed_seconds: round1(elapsed.as_secs_f64()),
            duration_seconds: duration.map(|d| d.as_secs_f64()),
            remaining_seconds: self.remaining(now).map(|d| round1(d.as_secs_f64())),
            progress,
            win: self.results.map(|r| r.win),
            place: self.results.map(|r| r.place),
            show: self.results.map(|r| r.show),
        }
    }

    pub fn state_change(&self, old: Phase, now: Instant) -> StateChange {
        StateChange {
            old_state: old,
            new_state: self.phase,
            timestamp: Utc::now(),
            state_info: self.snapshot(now),
            horses: self.entities.clone(),
        }
    }

    pub fn entity(&self, id: u32) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Validate and record the finishing order. Nothing changes on error.
    pub fn set_results(&mut self, win: u32, place: u32, show: u32) -> Result<RaceResults> {
        if place == win {
            return Err(Error::validation(
                "place",
                format!("{} already holds win", place),
            ));
        }
        if show == win || show == place {
            return Err(Error::validation(
                "show",
                format!("{} already holds a higher position", show),
            ));
        }
        for (field, id) in [("win", win), ("place", place), ("show", show)] {
            if self.entity(id).is_none() {
                return Err(Error::validation(field, format!("no entity {}", id)));
            }
        }

        for entity in &mut self.entities {
            entity.rank = match entity.id {
                id if id == win => Some(1),
                id if id == place => Some(2),
                id if id == show => Some(3),
                _ => None,
            };
        }
        self.results = Some(Placings { win, place, show });
        self.results()
            .ok_or_else(|| Error::precondition("results vanished"))
    }

    pub fn placings(&self) -> Option<Placings> {
        self.results
    }

    pub fn results(&self) -> Option<RaceResults> {
        let p = self.results?;
        Some(RaceResults {
            win: self.entity(p.win)?.clone(),
            place: self.entity(p.place)?.clone(),
            show: self.entity(p.show)?.clone(),
        })
    }

    pub fn clear_results(&mut self) {
        self.results = None;
        for entity in &mut self.entities {
            entity.rank = None;
        }
    }

    /// Settle results from simulated progress (furthest first, then
    /// fastest). Needs at least three entities.
    pub fn settle_from_progress(&mut self) -> Option<RaceResults> {
        if self.entities.len() < 3 {
            return None;
        }
        let mut order: Vec<&Entity> = self.entities.iter().collect();
        order.sort_by(|a, b| {
            b.progress
                .total_cmp(&a.progress)
                .then(b.speed.total_cmp(&a.speed))
                .then(a.id.cmp(&b.id))
        });
        let (win, place, show) = (order[0].id, order[1].id, order[2].id);
        self.set_results(win, place, show).ok()
    }

    /// Advance every entity's progress by `fraction` of the race
    pub fn run_entities(&mut self, fraction: f64) {
        for entity in &mut self.entities {
            let jitter = 0.8 + 0.4 * self.rng.random::<f64>();
            entity.run(fraction, jitter);
        }
    }

    /// Drift every entity's odds by a uniform factor in `±percent`,
    /// never below `floor`
    pub fn drift_odds(&mut self, percent: f64, floor: f64) {
        for entity in &mut self.entities {
            let drift = self.rng.random_range(-percent..=percent);
            entity.odds = entity::round2((entity.odds * (1.0 + drift)).max(floor));
        }
    }

    pub fn place_bet(&mut self, guest_name: &str, horse_id: u32, amount: f64) -> Result<Bet> {
        if !self.phase.accepts_bets() {
            return Err(Error::precondition(format!(
                "betting is closed (state {})",
                self.phase
            )));
        }
        let guest_name = guest_name.trim();
        if guest_name.is_empty() {
            return Err(Error::validation("guest_name", "must not be empty"));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::validation("amount", "must be a positive number"));
        }
        if self.entity(horse_id).is_none() {
            return Err(Error::not_found("entity", horse_id.to_string()));
        }
        let bet = Bet {
            id: Uuid::new_v4(),
            guest_name: guest_name.to_string(),
            horse_id,
            amount,
            placed_at: Utc::now(),
        };
        self.bets.push(bet.clone());
        Ok(bet)
    }

    pub fn bet_book(&self) -> BetBook {
        let mut totals: BTreeMap<u32, BetTotal> = BTreeMap::new();
        for bet in &self.bets {
            let total = totals.entry(bet.horse_id).or_default();
            total.total_amount += bet.amount;
            total.bet_count += 1;
        }
        BetBook {
            bets: self.bets.clone(),
            totals,
        }
    }

    /// Back to the initial phase with no results, bets or progress
    pub fn reset(&mut self, entities: Option<Vec<Entity>>, now: Instant) -> Phase {
        self.clear_results();
        self.bets.clear();
        if let Some(entities) = entities {
            self.entities = entities;
        }
        for entity in &mut self.entities {
            entity.progress = 0.0;
        }
        self.paused_at = None;
        self.run = RunStatus::Stopped;
        self.enter(self.profile.initial(), now)
    }
}

/// Post positions must be unique
pub fn validate_entities(entities: &[Entity]) -> Result<()> {
    let mut seen = HashSet::new();
    for entity in entities {
        if !seen.insert(entity.id) {
            return Err(Error::validation(
                "entities",
                format!("duplicate post position {}", entity.id),
            ));
        }
    }
    Ok(())
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
