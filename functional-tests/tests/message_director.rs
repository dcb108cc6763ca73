/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez <me@maxrdz.com>

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Functional test for the Message Director's pub/sub routing, driven
//! entirely in-process (no Meson, no spawned `donetd` binary): starts
//! a real [`MessageDirector`] service bound to loopback, then speaks
//! its length-prefixed wire protocol directly over a raw [`TcpStream`]
//! the way a real subscriber would.

use donet_core::datagram::datagram::Datagram;
use donet_core::globals::Channel;
use donet_core::Protocol;
use donet_daemon::config;
use donet_daemon::service::DonetService;
use donet_message_director::MessageDirector;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};

const BIND_ADDR: &str = "127.0.0.1:57123";
const SETTLE_TIME: Duration = Duration::from_millis(100);

fn daemon_config() -> config::DonetConfig {
    config::DonetConfig {
        daemon: config::Daemon {
            name: "md-functional-test".to_string(),
            id: None,
            log_level: None,
        },
        global: config::Global {
            eventlogger: None,
            dc_files: vec![],
        },
        services: config::Services {
            message_director: Some(config::MessageDirector {
                bind: BIND_ADDR.to_string(),
                upstream: None,
            }),
            client_agent: None,
            state_server: None,
            database_server: None,
            dbss: None,
            event_logger: None,
            metrics: None,
            web_panel: None,
        },
    }
}

async fn send_framed(sock: &mut TcpStream, dg: &Datagram) -> std::io::Result<()> {
    let payload = dg.get_data();
    sock.write_all(&(payload.len() as u16).to_le_bytes()).await?;
    sock.write_all(&payload).await
}

async fn recv_framed(sock: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut size_buf = [0u8; 2];
    sock.read_exact(&mut size_buf).await?;
    let size = u16::from_le_bytes(size_buf) as usize;
    let mut payload = vec![0u8; size];
    sock.read_exact(&mut payload).await?;
    Ok(payload)
}

fn add_channel_dg(channel: Channel) -> Datagram {
    let mut dg = Datagram::default();
    dg.add_control_header(Protocol::MDAddChannel.into()).unwrap();
    dg.add_channel(channel).unwrap();
    dg
}

/// A subscriber that opens a channel should receive any message routed
/// to that channel, including one it sent to itself.
#[tokio::test]
async fn subscriber_receives_message_on_its_own_channel() {
    let conf = daemon_config();
    let _handle = MessageDirector::start(conf, None)
        .await
        .expect("Message Director failed to start");

    sleep(SETTLE_TIME).await;

    let mut sock = TcpStream::connect(BIND_ADDR).await.expect("failed to connect to MD");

    send_framed(&mut sock, &add_channel_dg(401_000_000)).await.unwrap();
    sleep(SETTLE_TIME).await;

    let mut routed = Datagram::default();
    routed
        .add_server_header(vec![401_000_000], 1337, Protocol::CAAddInterest.into())
        .unwrap();
    routed.add_u16(42).unwrap();

    send_framed(&mut sock, &routed).await.unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(1), recv_framed(&mut sock))
        .await
        .expect("timed out waiting for the MD to route the message back")
        .expect("connection closed unexpectedly");

    assert_eq!(echoed, routed.get_data(), "MD did not replicate the datagram verbatim");
}

/// A subscriber that never opened the target channel must not receive
/// traffic addressed to it.
#[tokio::test]
async fn non_subscriber_does_not_receive_unrelated_channel_traffic() {
    let conf = daemon_config();
    let _handle = MessageDirector::start(conf, None)
        .await
        .expect("Message Director failed to start");

    sleep(SETTLE_TIME).await;

    let mut subscriber = TcpStream::connect(BIND_ADDR).await.unwrap();
    send_framed(&mut subscriber, &add_channel_dg(500_000_001)).await.unwrap();
    sleep(SETTLE_TIME).await;

    let mut bystander = TcpStream::connect(BIND_ADDR).await.unwrap();

    let mut routed = Datagram::default();
    routed
        .add_server_header(vec![500_000_001], 1338, Protocol::CAAddInterest.into())
        .unwrap();
    routed.add_u16(7).unwrap();

    send_framed(&mut subscriber, &routed).await.unwrap();

    // the real subscriber should get it...
    let echoed = tokio::time::timeout(Duration::from_secs(1), recv_framed(&mut subscriber))
        .await
        .expect("timed out waiting for the subscribed channel's message")
        .unwrap();
    assert_eq!(echoed, routed.get_data());

    // ...but the bystander, who never subscribed to 500_000_001, should not.
    let bystander_result = tokio::time::timeout(Duration::from_millis(300), recv_framed(&mut bystander)).await;
    assert!(bystander_result.is_err(), "non-subscriber unexpectedly received routed traffic");
}
