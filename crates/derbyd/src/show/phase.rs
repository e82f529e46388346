//! Show phases and the profiles that order them.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::fleet::command::CommandKind;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Dormant,
    EntriesLoaded,
    BettingOpen,
    BettingClosing,
    AtThePost,
    Running,
    Finished,
    Official,
    PreRace,
    DuringRace,
    AfterRace,
}

impl Phase {
    /// Resolve a canonical name or alias, case-insensitively
    pub fn resolve(name: &str) -> Result<Phase> {
        let key = name.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        let phase = match key.as_str() {
            "idle" => Phase::Idle,
            "dormant" => Phase::Dormant,
            "entries" | "entries_loaded" => Phase::EntriesLoaded,
            "betting" | "betting_open" => Phase::BettingOpen,
            "closing" | "betting_closing" => Phase::BettingClosing,
            "post" | "at_the_post" => Phase::AtThePost,
            "race" | "running" => Phase::Running,
            "finish" | "finished" => Phase::Finished,
            "official" => Phase::Official,
            "pre_race" | "prerace" => Phase::PreRace,
            "during_race" | "duringrace" => Phase::DuringRace,
            "after_race" | "afterrace" => Phase::AfterRace,
            _ => {
                return Err(Error::validation(
                    "state",
                    format!("unknown phase '{}'", name),
                ))
            }
        };
        Ok(phase)
    }

    /// Bets are accepted only in this phase
    pub fn accepts_bets(self) -> bool {
        self == Phase::BettingOpen
    }

    /// Odds drift only in these phases
    pub fn drifts_odds(self) -> bool {
        matches!(self, Phase::BettingOpen | Phase::BettingClosing)
    }
}

/// Which built-in phase ordering a show uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    #[default]
    Full,
    Simple,
}

/// One phase within a profile
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    pub phase: Phase,
    /// `None` only for the terminal phase
    pub duration: Option<Duration>,
    /// Broadcast to the fleet on entry
    pub command: Option<CommandKind>,
    /// On entry, spotlight the winner instead of `command` when results exist
    pub spotlight: bool,
    /// Entity progress is simulated while in this phase
    pub racing: bool,
    /// On entry, a simulated show settles its results from race progress
    pub settles: bool,
}

impl PhaseSpec {
    fn new(phase: Phase, secs: u64, command: Option<CommandKind>) -> Self {
        Self {
            phase,
            duration: Some(Duration::from_secs(secs)),
            command,
            spotlight: false,
            racing: false,
            settles: false,
        }
    }

    fn terminal(mut self) -> Self {
        self.duration = None;
        self
    }
}

fn animation(name: &str, speed: Option<f32>) -> Option<CommandKind> {
    Some(CommandKind::Animation {
        name: name.to_string(),
        speed,
    })
}

/// An ordered list of phases. The first is the initial phase and the last
/// is terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseProfile {
    phases: Vec<PhaseSpec>,
}

impl PhaseProfile {
    /// `Idle → Dormant → EntriesLoaded → … → Official`
    pub fn full() -> Self {
        let mut running = PhaseSpec::new(Phase::Running, 10, animation("race_start", None));
        running.racing = true;
        let mut finished = PhaseSpec::new(Phase::Finished, 5, animation("finish", None));
        finished.settles = true;
        let mut official = PhaseSpec::new(Phase::Official, 0, None).terminal();
        official.spotlight = true;

        Self {
            phases: vec![
                PhaseSpec::new(Phase::Idle, 0, None),
                PhaseSpec::new(Phase::Dormant, 0, None),
                PhaseSpec::new(Phase::EntriesLoaded, 30, animation("welcome", None)),
                PhaseSpec::new(Phase::BettingOpen, 60, animation("betting_60", None)),
                PhaseSpec::new(Phase::BettingClosing, 30, animation("final_call", None)),
                PhaseSpec::new(Phase::AtThePost, 15, animation("idle", None)),
                running,
                finished,
                official,
            ],
        }
    }

    /// `PreRace → [BettingOpen →] DuringRace → AfterRace`
    pub fn simple(betting: bool) -> Self {
        let mut phases = vec![PhaseSpec::new(
            Phase::PreRace,
            30,
            animation("buildup", Some(1.0)),
        )];
        if betting {
            phases.push(PhaseSpec::new(
                Phase::BettingOpen,
                60,
                animation("betting_60", None),
            ));
        }
        let mut during = PhaseSpec::new(Phase::DuringRace, 45, animation("race", Some(2.0)));
        during.racing = true;
        let mut after =
            PhaseSpec::new(Phase::AfterRace, 0, animation("celebration", Some(1.5))).terminal();
        after.settles = true;
        after.spotlight = true;
        phases.push(during);
        phases.push(after);
        Self { phases }
    }

    pub fn from_kind(kind: ProfileKind, betting: bool) -> Self {
        match kind {
            ProfileKind::Full => Self::full(),
            ProfileKind::Simple => Self::simple(betting),
        }
    }

    /// Replace durations. Overrides for phases outside the profile, or for
    /// the terminal phase, are rejected.
    pub fn with_durations(mut self, overrides: &HashMap<Phase, Duration>) -> Result<Self> {
        let terminal = self.terminal();
        for (phase, duration) in overrides {
            if *phase == terminal {
                return Err(Error::validation(
                    "durations",
                    format!("{} is terminal and has no duration", phase),
                ));
            }
            let spec = self
                .phases
                .iter_mut()
                .find(|s| s.phase == *phase)
                .ok_or_else(|| {
                    Error::validation("durations", format!("{} is not in this profile", phase))
                })?;
            spec.duration = Some(*duration);
        }
        Ok(self)
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn initial(&self) -> Phase {
        self.phases[0].phase
    }

    pub fn terminal(&self) -> Phase {
        self.phases[self.phases.len() - 1].phase
    }

    pub fn spec(&self, phase: Phase) -> Option<&PhaseSpec> {
        self.phases.iter().find(|s| s.phase == phase)
    }

    pub fn contains(&self, phase: Phase) -> bool {
        self.spec(phase).is_some()
    }

    pub fn duration(&self, phase: Phase) -> Option<Duration> {
        self.spec(phase).and_then(|s| s.duration)
    }

    /// The phase after `phase`, or `None` at the terminal phase
    pub fn next(&self, phase: Phase) -> Option<Phase> {
        let idx = self.phases.iter().position(|s| s.phase == phase)?;
        self.phases.get(idx + 1).map(|s| s.phase)
    }

    /// Sum of all timed phases from `from` onwards
    pub fn remaining_total(&self, from: Phase) -> Duration {
        let start = self
            .phases
            .iter()
            .position(|s| s.phase == from)
            .unwrap_or(self.phases.len());
        self.phases[start..]
            .iter()
            .filter_map(|s| s.duration)
            .sum()
    }
}

impl Default for PhaseProfile {
    fn default() -> Self {
        Self::full()
    }
}
