//! LAN discovery over a direct raw socket, outside the reliable layer.
//!
//! Clients broadcast a short text command and every listening server
//! answers with a one-datagram summary of itself. A second command asks
//! a known server for its game port only.

use log::warn;

use crate::{
    game_setup::{Difficulty, GameMode, GameSetup},
    packet::buffer::{ByteReader, ByteWriter, PacketError},
};

/// Broadcast command asking servers to describe themselves.
pub const DISCOVERY_COMMAND: &str = "stk-server";
/// Command asking a specific server which port it plays on.
pub const PORT_COMMAND: &str = "stk-server-port";

/// Wire version of the discovery response format.
pub const DISCOVERY_VERSION: u8 = 1;

/// Reads the length-prefixed command string off a direct-socket datagram.
pub fn read_command(data: &[u8]) -> Result<String, PacketError> {
    ByteReader::new(data).read_string()
}

pub fn encode_command(command: &str) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_string(command);
    writer.into_bytes()
}

/// A server's answer to [`DISCOVERY_COMMAND`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub version: u8,
    pub name: String,
    pub max_players: u8,
    pub current_players: u8,
    pub port: u16,
    pub difficulty: Difficulty,
    pub game_mode: GameMode,
    pub password_protected: bool,
}

impl DiscoveryResponse {
    pub fn from_setup(setup: &GameSetup, port: u16) -> Self {
        Self {
            version: DISCOVERY_VERSION,
            name: setup.server_name.clone(),
            max_players: setup.max_players,
            current_players: setup.player_count(),
            port,
            difficulty: setup.difficulty,
            game_mode: setup.game_mode,
            password_protected: setup.password_protected,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u8(self.version);
        writer.write_string(&self.name);
        writer.write_u8(self.max_players);
        writer.write_u8(self.current_players);
        writer.write_u16(self.port);
        writer.write_u8(self.difficulty.to_byte());
        writer.write_u8(self.game_mode.to_byte());
        writer.write_u8(u8::from(self.password_protected));
        writer.into_bytes()
    }

    /// Unknown difficulty or mode bytes come from newer servers and
    /// decode to the default rather than failing the whole response.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let mut reader = ByteReader::new(data);
        let version = reader.read_u8()?;
        let name = reader.read_string()?;
        let max_players = reader.read_u8()?;
        let current_players = reader.read_u8()?;
        let port = reader.read_u16()?;
        let difficulty_byte = reader.read_u8()?;
        let mode_byte = reader.read_u8()?;
        let password_protected = reader.read_u8()? != 0;

        let difficulty = Difficulty::from_byte(difficulty_byte).unwrap_or_else(|| {
            warn!("unknown difficulty byte {} in discovery response", difficulty_byte);
            Difficulty::default()
        });
        let game_mode = GameMode::from_byte(mode_byte).unwrap_or_else(|| {
            warn!("unknown game mode byte {} in discovery response", mode_byte);
            GameMode::default()
        });

        Ok(Self {
            version,
            name,
            max_players,
            current_players,
            port,
            difficulty,
            game_mode,
            password_protected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_fields_come_in_wire_order() {
        let mut setup = GameSetup::new("tux arena", 8);
        setup.difficulty = Difficulty::Expert;
        setup.game_mode = GameMode::TimeTrial;
        for id in 0..3 {
            setup.add_player(
                id as u32 + 1,
                crate::game_setup::PlayerProfile::new(format!("p{}", id), id),
            );
        }

        let encoded = DiscoveryResponse::from_setup(&setup, 2759).encode();
        assert_eq!(encoded[0], DISCOVERY_VERSION);
        assert_eq!(encoded[1] as usize, "tux arena".len());
        assert_eq!(&encoded[2..11], b"tux arena");
        assert_eq!(encoded[11], 8); // max players
        assert_eq!(encoded[12], 3); // current players
        assert_eq!(&encoded[13..15], &2759u16.to_be_bytes());
        assert_eq!(encoded[15], Difficulty::Expert.to_byte());
        assert_eq!(encoded[16], GameMode::TimeTrial.to_byte());
        assert_eq!(encoded[17], 0); // no password
        assert_eq!(encoded.len(), 18);
    }

    #[test]
    fn decode_inverts_encode() {
        let response = DiscoveryResponse {
            version: DISCOVERY_VERSION,
            name: "corner case café".to_string(),
            max_players: 10,
            current_players: 10,
            port: 2757,
            difficulty: Difficulty::SuperTux,
            game_mode: GameMode::Soccer,
            password_protected: true,
        };
        assert_eq!(DiscoveryResponse::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn truncated_response_reports_where_it_ended() {
        let response = DiscoveryResponse::from_setup(&GameSetup::new("x", 4), 2757);
        let encoded = response.encode();
        let err = DiscoveryResponse::decode(&encoded[..encoded.len() - 3]).unwrap_err();
        assert!(matches!(err, PacketError::UnexpectedEnd { .. }));
    }

    #[test]
    fn commands_round_trip() {
        let datagram = encode_command(DISCOVERY_COMMAND);
        assert_eq!(read_command(&datagram).unwrap(), DISCOVERY_COMMAND);
        assert_eq!(
            read_command(&encode_command(PORT_COMMAND)).unwrap(),
            PORT_COMMAND
        );
    }
}
