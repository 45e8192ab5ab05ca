//! Room and epoch naming.
//!
//! A base room plus an epoch and a mode give the effective room used on the
//! wire. Epoch 0 in production keeps the bare base room so existing shared
//! links keep working; every other combination appends a mode-specific
//! separator and the epoch number:
//!
//! ```text
//! sunny-teal-otter                     production, epoch 0
//! sunny-teal-otter__epoch__2           production, epoch 2
//! sunny-teal-otter__test-epoch__0      test, epoch 0
//! ```

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const PRODUCTION_SEPARATOR: &str = "__epoch__";
pub const TEST_SEPARATOR: &str = "__test-epoch__";
/// Marker used by old builds to flag a test room.
const LEGACY_TEST_MARKER: &str = "__test__";

const PRODUCTION_PERSISTENCE_NAME: &str = "adameter";
const TEST_PERSISTENCE_NAME: &str = "adameter-test";

/// Synchronization namespace. Each mode has its own epoch counter and its
/// own local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Production,
    Test,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Production => "production",
            Mode::Test => "test",
        }
    }

    fn separator(&self) -> &'static str {
        match self {
            Mode::Production => PRODUCTION_SEPARATOR,
            Mode::Test => TEST_SEPARATOR,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Mode::Production),
            "test" => Ok(Mode::Test),
            _ => Err(format!("Invalid mode: {}. Valid values: production, test", s)),
        }
    }
}

/// Builds the room string peers use to find each other.
pub fn effective_room(base: &str, epoch: u32, mode: Mode) -> String {
    if mode == Mode::Production && epoch == 0 {
        return base.to_string();
    }
    format!("{}{}{}", base, mode.separator(), epoch)
}

/// Splits `room` at its epoch suffix.
///
/// The later of the two separators wins, and only an all-digit suffix
/// counts as an epoch.
fn split_epoch(room: &str) -> Option<(&str, u32)> {
    let production = room.rfind(PRODUCTION_SEPARATOR);
    let test = room.rfind(TEST_SEPARATOR);

    let (index, separator) = match (production, test) {
        (None, None) => return None,
        (Some(p), Some(t)) if t > p => (t, TEST_SEPARATOR),
        (Some(p), _) => (p, PRODUCTION_SEPARATOR),
        (None, Some(t)) => (t, TEST_SEPARATOR),
    };

    let suffix = &room[index + separator.len()..];
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    // An all-digit suffix that overflows u32 is not a usable epoch.
    let epoch = suffix.parse().ok()?;
    Some((&room[..index], epoch))
}

/// Strips a valid epoch suffix, returning the base room.
pub fn base_room(room: &str) -> String {
    match split_epoch(room) {
        Some((base, _)) => base.to_string(),
        None => room.to_string(),
    }
}

/// Epoch encoded in `room`, if it carries a valid suffix.
pub fn epoch_of(room: &str) -> Option<u32> {
    split_epoch(room).map(|(_, epoch)| epoch)
}

/// Infers the mode a room string was built for.
pub fn mode_of(room: &str) -> Mode {
    if has_digit_suffix(room, TEST_SEPARATOR) {
        return Mode::Test;
    }
    if has_digit_suffix(room, PRODUCTION_SEPARATOR) {
        return Mode::Production;
    }
    if room.contains(LEGACY_TEST_MARKER) {
        return Mode::Test;
    }
    Mode::Production
}

fn has_digit_suffix(room: &str, separator: &str) -> bool {
    room.rfind(separator)
        .map(|index| &room[index + separator.len()..])
        .is_some_and(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
}

/// Name of the on-device store holding the replica for (epoch, mode).
pub fn persistence_name(epoch: u32, mode: Mode) -> String {
    match (mode, epoch) {
        (Mode::Production, 0) => PRODUCTION_PERSISTENCE_NAME.to_string(),
        (Mode::Test, 0) => TEST_PERSISTENCE_NAME.to_string(),
        (Mode::Production, n) => format!("{}-epoch-{}", PRODUCTION_PERSISTENCE_NAME, n),
        (Mode::Test, n) => format!("{}-epoch-{}", TEST_PERSISTENCE_NAME, n),
    }
}

const ADJECTIVES: &[&str] = &[
    "happy", "sunny", "brave", "calm", "clever", "gentle", "jolly", "kind", "lucky", "merry",
    "proud", "quick", "quiet", "swift", "witty", "bright", "cosy", "eager", "fuzzy", "tiny",
];

const COLORS: &[&str] = &[
    "red", "blue", "green", "yellow", "purple", "orange", "pink", "teal", "amber", "coral",
    "indigo", "lime", "mint", "olive", "silver", "golden",
];

const ANIMALS: &[&str] = &[
    "panda", "otter", "fox", "koala", "owl", "whale", "tiger", "bunny", "duck", "hedgehog",
    "lamb", "penguin", "seal", "turtle", "zebra", "dolphin", "kitten", "puppy", "squirrel", "robin",
];

/// Generates a friendly random room name such as `sunny-teal-otter`.
pub fn generate_room_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("happy");
    let color = COLORS.choose(&mut rng).copied().unwrap_or("blue");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("panda");
    format!("{}-{}-{}", adjective, color, animal)
}
