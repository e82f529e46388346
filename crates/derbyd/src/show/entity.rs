//! Simulated race entries.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

/// Saddle-cloth colors by post position (1-based)
pub const SADDLE_CLOTH_COLORS: [&str; 20] = [
    "#E31837", "#FFFFFF", "#0033A0", "#FFCD00", "#00843D", "#000000", "#FF6600", "#FF69B4",
    "#40E0D0", "#663399", "#808080", "#32CD32", "#8B4513", "#800000", "#C4B7A6", "#87CEEB",
    "#000080", "#228B22", "#00008B", "#FF00FF",
];

/// Color for post positions past the end of the palette
pub const FALLBACK_COLOR: &str = "#808080";

const HORSE_NAMES: [&str; 20] = [
    "Sovereignty",
    "Journalism",
    "Midnight Thunder",
    "Golden Conquest",
    "Silver Lining",
    "Desert Storm",
    "Iron Will",
    "Wildfire",
    "Noble Quest",
    "Dark Horizon",
    "Blazing Trail",
    "Crown Royal",
    "Phantom Rider",
    "Lucky Strike",
    "Bold Venture",
    "Storm Chaser",
    "Diamond Edge",
    "Crimson Tide",
    "Celtic Pride",
    "Maverick Run",
];

const JOCKEYS: [&str; 20] = [
    "J. Velazquez",
    "I. Ortiz Jr.",
    "F. Prat",
    "J. Rosario",
    "L. Saez",
    "T. Gaffalione",
    "J. Castellano",
    "M. Smith",
    "R. Santana Jr.",
    "J. Leparoux",
    "C. Landeros",
    "D. Davis",
    "K. Carmouche",
    "A. Cedillo",
    "B. Hernandez Jr.",
    "E. Cancel",
    "J. Lezcano",
    "P. Lopez",
    "S. Bridgmohan",
    "R. Bejarano",
];

const TRAINERS: [&str; 20] = [
    "B. Baffert",
    "T. Pletcher",
    "C. Brown",
    "S. Asmussen",
    "B. Cox",
    "M. Maker",
    "W. Mott",
    "D. O'Neill",
    "K. McPeek",
    "J. Sadler",
    "D. Romans",
    "M. Casse",
    "H. Motion",
    "R. Mandella",
    "J. Sharp",
    "I. Wilkes",
    "M. Stidham",
    "D. Stewart",
    "G. Weaver",
    "P. Gallagher",
];

const MORNING_LINES: [&str; 20] = [
    "3/1", "5/2", "4/1", "6/1", "8/1", "10/1", "12/1", "15/1", "20/1", "7/2", "9/2", "5/1",
    "7/1", "30/1", "50/1", "2/1", "3/2", "6/5", "8/5", "9/1",
];

/// Odds used when a morning line cannot be parsed
const DEFAULT_ODDS: f64 = 3.0;

/// A participant in a show
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Post position, unique within a show
    pub id: u32,
    pub name: String,
    pub jockey: String,
    pub trainer: String,
    /// Fractional, e.g. `5/2`
    pub morning_line: String,
    /// Decimal, drifts during betting
    pub odds: f64,
    pub color: String,
    pub speed: f64,
    pub stamina: f64,
    /// 0.0 at the gate, 1.0 at the wire
    pub progress: f64,
    /// 1 = win, 2 = place, 3 = show
    pub rank: Option<u8>,
}

impl Entity {
    /// An entity with no simulated profile, for shows fed real entries
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            jockey: String::new(),
            trainer: String::new(),
            morning_line: "3/1".to_string(),
            odds: DEFAULT_ODDS,
            color: color_for(id).to_string(),
            speed: 1.0,
            stamina: 1.0,
            progress: 0.0,
            rank: None,
        }
    }

    /// Move toward the finish by `fraction` of the race, scaled by speed
    /// and fading with stamina over the second half.
    pub fn run(&mut self, fraction: f64, jitter: f64) {
        if self.progress >= 1.0 {
            return;
        }
        let fade = if self.progress > 0.5 {
            1.0 - (1.0 - self.stamina) * (self.progress - 0.5)
        } else {
            1.0
        };
        self.progress = (self.progress + fraction * self.speed * fade * jitter).clamp(0.0, 1.0);
    }
}

pub fn color_for(post_position: u32) -> &'static str {
    post_position
        .checked_sub(1)
        .and_then(|i| SADDLE_CLOTH_COLORS.get(i as usize))
        .copied()
        .unwrap_or(FALLBACK_COLOR)
}

/// `5/2` → 2.5, rounded to two places
pub fn fraction_to_decimal(fraction: &str) -> f64 {
    let parsed = fraction.split_once('/').and_then(|(num, den)| {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        (den != 0.0).then(|| num / den)
    });
    match parsed {
        Some(odds) if odds.is_finite() => round2(odds),
        _ => DEFAULT_ODDS,
    }
}

pub(crate) fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Generate `count` entities with post positions `1..=count`.
///
/// `randomness` (0-1) spreads speed and stamina around a baseline that
/// favors short odds.
pub fn generate(count: usize, randomness: f64, rng: &mut impl Rng) -> Vec<Entity> {
    let mut names = HORSE_NAMES.to_vec();
    let mut jockeys = JOCKEYS.to_vec();
    let mut trainers = TRAINERS.to_vec();
    let mut lines = MORNING_LINES.to_vec();
    names.shuffle(rng);
    jockeys.shuffle(rng);
    trainers.shuffle(rng);
    lines.shuffle(rng);

    (0..count)
        .map(|i| {
            let id = i as u32 + 1;
            let name = match names.get(i) {
                Some(name) => name.to_string(),
                None => format!("Entry {}", id),
            };
            let morning_line = lines[i % lines.len()].to_string();
            let odds = fraction_to_decimal(&morning_line);
            let baseline = 1.0 + 0.5 / odds.max(1.0);
            Entity {
                id,
                name,
                jockey: jockeys[i % jockeys.len()].to_string(),
                trainer: trainers[i % trainers.len()].to_string(),
                morning_line,
                odds,
                color: color_for(id).to_string(),
                speed: round2(baseline * spread(randomness, rng)),
                stamina: round2(spread(randomness, rng).clamp(0.0, 1.0)),
                progress: 0.0,
                rank: None,
            }
        })
        .collect()
}

fn spread(randomness: f64, rng: &mut impl Rng) -> f64 {
    1.0 + randomness * (rng.random::<f64>() - 0.5)
}
