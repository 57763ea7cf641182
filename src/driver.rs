use anyhow::{Result, bail};
use std::fmt;
use std::str::FromStr;

use crate::Features;
use crate::car::Steer;
use crate::dqn::DqnAgent;
use crate::track::CarColor;

// =============================================================================
// Action Space
// =============================================================================

/// Nine throttle/steering chords shared by humans and learned policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Idle = 0,
    Forward = 1,
    Reverse = 2,
    Left = 3,
    Right = 4,
    ForwardLeft = 5,
    ForwardRight = 6,
    ReverseLeft = 7,
    ReverseRight = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Coast,
    Forward,
    Reverse,
}

impl Action {
    pub const COUNT: usize = 9;

    pub const ALL: [Action; Action::COUNT] = [
        Action::Idle,
        Action::Forward,
        Action::Reverse,
        Action::Left,
        Action::Right,
        Action::ForwardLeft,
        Action::ForwardRight,
        Action::ReverseLeft,
        Action::ReverseRight,
    ];

    pub fn from_index(i: usize) -> Self {
        assert!(i < Self::COUNT, "action index {i} out of range");
        Self::ALL[i]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn throttle(self) -> Throttle {
        match self {
            Action::Forward | Action::ForwardLeft | Action::ForwardRight => Throttle::Forward,
            Action::Reverse | Action::ReverseLeft | Action::ReverseRight => Throttle::Reverse,
            Action::Idle | Action::Left | Action::Right => Throttle::Coast,
        }
    }

    pub fn steer(self) -> Option<Steer> {
        match self {
            Action::Left | Action::ForwardLeft | Action::ReverseLeft => Some(Steer::Left),
            Action::Right | Action::ForwardRight | Action::ReverseRight => Some(Steer::Right),
            Action::Idle | Action::Forward | Action::Reverse => None,
        }
    }

    /// Combine held controls. Forward beats reverse and left beats right when
    /// both of a pair are held.
    pub fn from_chord(forward: bool, reverse: bool, left: bool, right: bool) -> Self {
        let throttle = if forward {
            Throttle::Forward
        } else if reverse {
            Throttle::Reverse
        } else {
            Throttle::Coast
        };
        let steer = if left {
            Some(Steer::Left)
        } else if right {
            Some(Steer::Right)
        } else {
            None
        };
        match (throttle, steer) {
            (Throttle::Coast, None) => Action::Idle,
            (Throttle::Forward, None) => Action::Forward,
            (Throttle::Reverse, None) => Action::Reverse,
            (Throttle::Coast, Some(Steer::Left)) => Action::Left,
            (Throttle::Coast, Some(Steer::Right)) => Action::Right,
            (Throttle::Forward, Some(Steer::Left)) => Action::ForwardLeft,
            (Throttle::Forward, Some(Steer::Right)) => Action::ForwardRight,
            (Throttle::Reverse, Some(Steer::Left)) => Action::ReverseLeft,
            (Throttle::Reverse, Some(Steer::Right)) => Action::ReverseRight,
        }
    }
}

// =============================================================================
// Keyboard State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Key {
    W,
    A,
    S,
    D,
    Up,
    Down,
    Left,
    Right,
    Space,
    Escape,
    Enter,
    P,
    R,
    Num1,
    Num2,
    Num3,
}

/// Set of keys, one bit per `Key`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldKeys(u32);

impl HeldKeys {
    pub fn with(mut self, key: Key) -> Self {
        self.insert(key);
        self
    }

    pub fn insert(&mut self, key: Key) {
        self.0 |= 1 << key as u32;
    }

    pub fn contains(&self, key: Key) -> bool {
        self.0 & (1 << key as u32) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Key> for HeldKeys {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        iter.into_iter().fold(HeldKeys::default(), HeldKeys::with)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keymap {
    Wasd,
    Arrows,
}

impl Keymap {
    /// forward, reverse, left, right
    pub fn keys(self) -> [Key; 4] {
        match self {
            Keymap::Wasd => [Key::W, Key::S, Key::A, Key::D],
            Keymap::Arrows => [Key::Up, Key::Down, Key::Left, Key::Right],
        }
    }

    pub fn action(self, held: HeldKeys) -> Action {
        let [fwd, rev, left, right] = self.keys();
        Action::from_chord(
            held.contains(fwd),
            held.contains(rev),
            held.contains(left),
            held.contains(right),
        )
    }
}

// =============================================================================
// Drivers
// =============================================================================

/// Anything that can drive a car. The race asks every driver the same way.
pub trait Driver {
    fn name(&self) -> &str;

    /// Latest keyboard state, delivered once per frame before `action`.
    fn observe_keys(&mut self, _held: HeldKeys) {}

    /// `None` means no observation is available; drivers answer `Idle` or
    /// whatever their input implies.
    fn action(&mut self, observation: Option<&Features>) -> Result<Action>;
}

pub struct KeyboardDriver {
    keymap: Keymap,
    held: HeldKeys,
}

impl KeyboardDriver {
    pub fn new(keymap: Keymap) -> Self {
        Self {
            keymap,
            held: HeldKeys::default(),
        }
    }
}

impl Driver for KeyboardDriver {
    fn name(&self) -> &str {
        match self.keymap {
            Keymap::Wasd => "keyboard-wasd",
            Keymap::Arrows => "keyboard-arrows",
        }
    }

    fn observe_keys(&mut self, held: HeldKeys) {
        self.held = held;
    }

    fn action(&mut self, _observation: Option<&Features>) -> Result<Action> {
        Ok(self.keymap.action(self.held))
    }
}

/// Greedy driver backed by a trained agent.
pub struct PolicyDriver {
    agent: DqnAgent,
}

impl PolicyDriver {
    pub fn new(mut agent: DqnAgent) -> Self {
        agent.set_inference_mode();
        Self { agent }
    }

    pub fn agent(&self) -> &DqnAgent {
        &self.agent
    }
}

impl Driver for PolicyDriver {
    fn name(&self) -> &str {
        "dqn"
    }

    fn action(&mut self, observation: Option<&Features>) -> Result<Action> {
        self.agent.get_action(observation, false)
    }
}

/// Driver that never touches the controls.
pub struct IdleDriver;

impl Driver for IdleDriver {
    fn name(&self) -> &str {
        "idle"
    }

    fn action(&mut self, _observation: Option<&Features>) -> Result<Action> {
        Ok(Action::Idle)
    }
}

// =============================================================================
// Race Lineup
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Human,
    Learned,
    None,
}

impl FromStr for PlayerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(PlayerKind::Human),
            "learned" | "ai" | "dqn" => Ok(PlayerKind::Learned),
            "none" | "off" => Ok(PlayerKind::None),
            _ => Err(format!("unknown player kind '{s}' (expected human, learned or none)")),
        }
    }
}

impl fmt::Display for PlayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerKind::Human => "human",
            PlayerKind::Learned => "learned",
            PlayerKind::None => "none",
        };
        f.write_str(name)
    }
}

/// Who races and in which colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineup {
    pub player1: PlayerKind,
    pub player2: PlayerKind,
    pub color1: CarColor,
    pub color2: CarColor,
}

impl Default for Lineup {
    fn default() -> Self {
        Self {
            player1: PlayerKind::Human,
            player2: PlayerKind::None,
            color1: CarColor::Red,
            color2: CarColor::Green,
        }
    }
}

impl Lineup {
    pub fn validate(&self) -> Result<()> {
        if self.player1 == PlayerKind::None && self.player2 == PlayerKind::None {
            bail!("At least one player must be present");
        }
        Ok(())
    }

    /// Present players in slot order with their colors and keymaps. A lone
    /// second player keeps the arrow keys.
    pub fn seats(&self) -> Vec<(PlayerKind, CarColor, Keymap)> {
        [
            (self.player1, self.color1, Keymap::Wasd),
            (self.player2, self.color2, Keymap::Arrows),
        ]
        .into_iter()
        .filter(|(kind, _, _)| *kind != PlayerKind::None)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_matches_index() {
        for (i, action) in Action::ALL.iter().enumerate() {
            assert_eq!(action.index(), i);
            assert_eq!(Action::from_index(i), *action);
        }
    }

    #[test]
    fn chords_map_to_combined_actions() {
        assert_eq!(Action::from_chord(false, false, false, false), Action::Idle);
        assert_eq!(Action::from_chord(true, false, true, false), Action::ForwardLeft);
        assert_eq!(Action::from_chord(false, true, false, true), Action::ReverseRight);
        assert_eq!(Action::from_chord(true, true, true, true), Action::ForwardLeft);
        assert_eq!(Action::from_chord(false, false, false, true), Action::Right);
    }

    #[test]
    fn keymaps_read_their_own_keys() {
        let held: HeldKeys = [Key::W, Key::D, Key::Up].into_iter().collect();
        assert_eq!(Keymap::Wasd.action(held), Action::ForwardRight);
        assert_eq!(Keymap::Arrows.action(held), Action::Forward);

        let mut p1 = KeyboardDriver::new(Keymap::Wasd);
        p1.observe_keys(held);
        assert_eq!(p1.action(None).unwrap(), Action::ForwardRight);
    }

    #[test]
    fn lineup_requires_a_player() {
        let empty = Lineup {
            player1: PlayerKind::None,
            player2: PlayerKind::None,
            ..Lineup::default()
        };
        assert!(empty.validate().is_err());

        let solo_p2 = Lineup {
            player1: PlayerKind::None,
            player2: PlayerKind::Learned,
            ..Lineup::default()
        };
        assert!(solo_p2.validate().is_ok());
        let seats = solo_p2.seats();
        assert_eq!(seats.len(), 1);
        assert_eq!(seats[0].1, CarColor::Green);
    }

    #[test]
    fn player_kind_parses() {
        assert_eq!("Human".parse::<PlayerKind>().unwrap(), PlayerKind::Human);
        assert_eq!("dqn".parse::<PlayerKind>().unwrap(), PlayerKind::Learned);
        assert!("robot".parse::<PlayerKind>().is_err());
    }
}
