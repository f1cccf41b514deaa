//! Per-session metadata about the hosted game and the players in it.
//!
//! A [`GameSetup`] is mutated by lobby negotiation before the race and
//! treated as immutable once the race starts. The transport host reads
//! it when answering LAN discovery probes.

use crate::types::HostId;

/// Server-wide difficulty, advertised in discovery responses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum Difficulty {
    #[default]
    Novice = 0,
    Intermediate = 1,
    Expert = 2,
    SuperTux = 3,
}

impl Difficulty {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Novice),
            1 => Some(Self::Intermediate),
            2 => Some(Self::Expert),
            3 => Some(Self::SuperTux),
            _ => None,
        }
    }
}

/// Race mode the server runs, advertised in discovery responses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum GameMode {
    #[default]
    NormalRace = 0,
    TimeTrial = 1,
    FreeForAll = 2,
    CaptureTheFlag = 3,
    Soccer = 4,
}

impl GameMode {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::NormalRace),
            1 => Some(Self::TimeTrial),
            2 => Some(Self::FreeForAll),
            3 => Some(Self::CaptureTheFlag),
            4 => Some(Self::Soccer),
            _ => None,
        }
    }
}

/// One player as negotiated in the lobby. A peer may carry several
/// profiles when splitscreen players share a connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlayerProfile {
    pub name: String,
    /// Unique per-race id assigned by the server. Not the index of the
    /// player in any peer list.
    pub player_id: u8,
    pub kart_name: String,
    /// Per-player handicap on top of the server difficulty.
    pub handicap: bool,
}

impl PlayerProfile {
    pub fn new(name: impl Into<String>, player_id: u8) -> Self {
        Self {
            name: name.into(),
            player_id,
            kart_name: String::new(),
            handicap: false,
        }
    }
}

/// Everything the server knows about the game it is hosting.
#[derive(Clone, Debug)]
pub struct GameSetup {
    pub server_name: String,
    pub max_players: u8,
    pub difficulty: Difficulty,
    pub game_mode: GameMode,
    pub password_protected: bool,
    players: Vec<(HostId, PlayerProfile)>,
}

impl GameSetup {
    pub fn new(server_name: impl Into<String>, max_players: u8) -> Self {
        Self {
            server_name: server_name.into(),
            max_players,
            difficulty: Difficulty::default(),
            game_mode: GameMode::default(),
            password_protected: false,
            players: Vec::new(),
        }
    }

    pub fn add_player(&mut self, host_id: HostId, profile: PlayerProfile) {
        self.players.push((host_id, profile));
    }

    /// Drops every profile belonging to a disconnected host.
    pub fn remove_host(&mut self, host_id: HostId) {
        self.players.retain(|(id, _)| *id != host_id);
    }

    pub fn player_count(&self) -> u8 {
        self.players.len().min(u8::MAX as usize) as u8
    }

    pub fn players(&self) -> impl Iterator<Item = &PlayerProfile> {
        self.players.iter().map(|(_, profile)| profile)
    }

    pub fn reset(&mut self) {
        self.players.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_round_trips_through_bytes() {
        for byte in 0..4 {
            assert_eq!(Difficulty::from_byte(byte).unwrap().to_byte(), byte);
        }
        assert_eq!(Difficulty::from_byte(9), None);
    }

    #[test]
    fn removing_a_host_drops_all_its_players() {
        let mut setup = GameSetup::new("lan party", 8);
        setup.add_player(1, PlayerProfile::new("alva", 0));
        setup.add_player(2, PlayerProfile::new("beto", 1));
        setup.add_player(2, PlayerProfile::new("beto jr", 2));
        assert_eq!(setup.player_count(), 3);
        setup.remove_host(2);
        assert_eq!(setup.player_count(), 1);
        assert_eq!(setup.players().next().unwrap().name, "alva");
    }
}
