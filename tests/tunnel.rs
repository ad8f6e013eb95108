use std::net::Ipv4Addr;

use dgramtun::daemon::{
    channel::memory_channel::{memory_interface, MemoryNetwork},
    link::{LinkPump, LinkSettings},
    protocol::Strategy,
    switch::{AddressTable, Destination},
};

const ALPHA: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);
const BETA: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 2);

fn ipv4_packet(source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    let total = (20 + payload.len()) as u16;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[12..16].copy_from_slice(&source.octets());
    packet[16..20].copy_from_slice(&destination.octets());
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test(start_paused = true)]
async fn two_links_tunnel_packets_back_to_back() {
    let network = MemoryNetwork::new();
    let (alpha_interface, mut alpha_host) = memory_interface();
    let (beta_interface, mut beta_host) = memory_interface();

    let settings = LinkSettings {
        mtu: 1400,
        strategy: Strategy::Clumping,
        ..LinkSettings::default()
    };
    let alpha_table: AddressTable = [(BETA, Destination::from("beta"))].into_iter().collect();
    let beta_table: AddressTable = [(ALPHA, Destination::from("alpha"))].into_iter().collect();
    let (alpha, alpha_handle) = LinkPump::new(
        alpha_interface,
        network.endpoint("alpha"),
        alpha_table,
        settings.clone(),
    );
    let (beta, beta_handle) =
        LinkPump::new(beta_interface, network.endpoint("beta"), beta_table, settings);

    let requests: Vec<Vec<u8>> = (0..3u8)
        .map(|i| ipv4_packet(ALPHA, BETA, &[i; 32]))
        .collect();
    let response = ipv4_packet(BETA, ALPHA, b"pong");

    let driver = async {
        for request in &requests {
            alpha_host.inject.send(request.clone()).unwrap();
        }
        for request in &requests {
            assert_eq!(beta_host.written.recv().await.as_ref(), Some(request));
        }

        beta_host.inject.send(response.clone()).unwrap();
        assert_eq!(alpha_host.written.recv().await, Some(response.clone()));

        let status = alpha_handle.status().await.unwrap();
        assert_eq!(status.read_queue, 0);
        assert_eq!(status.routes, 1);

        assert!(alpha_handle.shutdown().await);
        assert!(beta_handle.shutdown().await);
    };

    let (alpha_result, beta_result, ()) = tokio::join!(alpha.run(), beta.run(), driver);
    alpha_result.unwrap();
    beta_result.unwrap();

    assert_eq!(alpha_handle.status().await, None);
}

#[tokio::test(start_paused = true)]
async fn reloaded_routes_take_effect_on_a_running_link() {
    let network = MemoryNetwork::new();
    let (interface, mut host) = memory_interface();
    let mut old_peer = network.endpoint("old-peer");
    let mut new_peer = network.endpoint("new-peer");

    let table: AddressTable = [(BETA, Destination::from("old-peer"))].into_iter().collect();
    let (link, handle) = LinkPump::new(
        interface,
        network.endpoint("alpha"),
        table,
        LinkSettings::default(),
    );

    let driver = async {
        use dgramtun::daemon::channel::DatagramTransport;

        let mut buffer = vec![0u8; 8192];
        host.inject.send(ipv4_packet(ALPHA, BETA, b"first")).unwrap();
        let (_, source) = old_peer.recv_from(&mut buffer).await.unwrap();
        assert_eq!(source, Destination::from("alpha"));

        assert!(
            handle
                .reload([(BETA, Destination::from("new-peer"))].into_iter().collect())
                .await
        );
        host.inject.send(ipv4_packet(ALPHA, BETA, b"second")).unwrap();
        let (size, _) = new_peer.recv_from(&mut buffer).await.unwrap();
        // Numbering carries on from the replaced table.
        assert_eq!(&buffer[4..12], &2u64.to_be_bytes());
        assert!(size > 12);
        assert!(old_peer.try_recv().is_none());

        handle.shutdown().await;
    };

    let (result, ()) = tokio::join!(link.run(), driver);
    result.unwrap();
}
