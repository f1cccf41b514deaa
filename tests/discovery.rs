//! LAN discovery: wire format of the response and the direct-socket
//! request/response path of a running server.

use std::{net::UdpSocket, time::Duration};

use raceline::{
    encode_command, Difficulty, DiscoveryResponse, GameMode, GameSetup, HostConfig, PlayerProfile,
    TransportHost, DISCOVERY_COMMAND, DISCOVERY_VERSION, PORT_COMMAND,
};

fn setup_with_players(max: u8, current: u8) -> GameSetup {
    let mut setup = GameSetup::new("tux arena", max);
    setup.difficulty = Difficulty::Intermediate;
    setup.game_mode = GameMode::NormalRace;
    for id in 0..current {
        setup.add_player(u32::from(id) + 1, PlayerProfile::new(format!("player {}", id), id));
    }
    setup
}

#[test]
fn response_for_a_busy_server_decodes_in_exact_wire_order() {
    let setup = setup_with_players(8, 3);
    let encoded = DiscoveryResponse::from_setup(&setup, 2759).encode();

    // [version][name length-prefixed][max][current][port][difficulty]
    // [mode][password], in that exact order.
    let mut offset = 0;
    assert_eq!(encoded[offset], DISCOVERY_VERSION);
    offset += 1;
    let name_len = encoded[offset] as usize;
    offset += 1;
    assert_eq!(&encoded[offset..offset + name_len], b"tux arena");
    offset += name_len;
    assert_eq!(encoded[offset], 8);
    assert_eq!(encoded[offset + 1], 3);
    assert_eq!(
        u16::from_be_bytes([encoded[offset + 2], encoded[offset + 3]]),
        2759
    );
    assert_eq!(encoded[offset + 4], Difficulty::Intermediate.to_byte());
    assert_eq!(encoded[offset + 5], GameMode::NormalRace.to_byte());
    assert_eq!(encoded[offset + 6], 0);
    assert_eq!(encoded.len(), offset + 7);

    let decoded = DiscoveryResponse::decode(&encoded).unwrap();
    assert_eq!(decoded.max_players, 8);
    assert_eq!(decoded.current_players, 3);
    assert_eq!(decoded.port, 2759);
}

fn free_udp_port() -> u16 {
    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

#[test]
fn running_server_answers_discovery_probes() {
    let discovery_port = free_udp_port();
    let mut config = HostConfig::server("127.0.0.1:0".parse().unwrap(), 8);
    config.discovery_port = Some(discovery_port);
    let server = TransportHost::new(config, setup_with_players(8, 3)).unwrap();
    let game_port = server.local_addr().port();

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let target = format!("127.0.0.1:{}", discovery_port);

    probe
        .send_to(&encode_command(DISCOVERY_COMMAND), &target)
        .unwrap();
    let mut buffer = [0u8; 2048];
    let (len, _) = probe.recv_from(&mut buffer).unwrap();
    let response = DiscoveryResponse::decode(&buffer[..len]).unwrap();
    assert_eq!(response.name, "tux arena");
    assert_eq!(response.max_players, 8);
    assert_eq!(response.current_players, 3);
    assert_eq!(response.port, game_port);

    probe
        .send_to(&encode_command(PORT_COMMAND), &target)
        .unwrap();
    let (len, _) = probe.recv_from(&mut buffer).unwrap();
    assert_eq!(len, 2);
    assert_eq!(u16::from_be_bytes([buffer[0], buffer[1]]), game_port);

    server.shutdown();
}

#[test]
fn malformed_probes_are_ignored() {
    let discovery_port = free_udp_port();
    let mut config = HostConfig::server("127.0.0.1:0".parse().unwrap(), 8);
    config.discovery_port = Some(discovery_port);
    let server = TransportHost::new(config, setup_with_players(8, 0)).unwrap();

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let target = format!("127.0.0.1:{}", discovery_port);

    // Garbage, then an unknown command: neither gets an answer.
    probe.send_to(&[0xff, 0xff, 0xff], &target).unwrap();
    probe
        .send_to(&encode_command("who-is-there"), &target)
        .unwrap();
    let mut buffer = [0u8; 64];
    assert!(probe.recv_from(&mut buffer).is_err());

    // The server still answers a valid probe afterwards.
    probe
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    probe
        .send_to(&encode_command(DISCOVERY_COMMAND), &target)
        .unwrap();
    let (len, _) = probe.recv_from(&mut buffer).unwrap();
    assert!(DiscoveryResponse::decode(&buffer[..len]).is_ok());

    server.shutdown();
}
