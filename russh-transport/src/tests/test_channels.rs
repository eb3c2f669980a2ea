use std::time::Duration;

use ssh_encoding::{Decode, Encode};

use super::server::{connected, connected_with, payload, Event, FakeServer};
use super::test_init;
use crate::client::{Config, State};
use crate::{msg, ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, Error};

const SERVER_CHANNEL: u32 = 7;

/// Read a CHANNEL_OPEN, returning the type and the client's channel
/// number. `rest` gets the type-specific data.
async fn recv_open(server: &mut FakeServer) -> (String, u32, Vec<u8>) {
    let p = server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_OPEN);
    let mut r = &p[1..];
    let typ = String::decode(&mut r).unwrap();
    let sender = u32::decode(&mut r).unwrap();
    let _window = u32::decode(&mut r).unwrap();
    let _max_packet = u32::decode(&mut r).unwrap();
    (typ, sender, r.to_vec())
}

async fn confirm(server: &mut FakeServer, client_channel: u32, window: u32, max_packet: u32) {
    server
        .send(&payload(|w| {
            msg::CHANNEL_OPEN_CONFIRMATION.encode(w)?;
            client_channel.encode(w)?;
            SERVER_CHANNEL.encode(w)?;
            window.encode(w)?;
            max_packet.encode(w)
        }))
        .await;
}

#[tokio::test]
async fn session_channel_lifecycle() {
    test_init();
    let mut pair = connected(true).await;

    let (channel, client_channel) = tokio::join!(pair.handle.channel_open_session(), async {
        let (typ, sender, _) = recv_open(&mut pair.server).await;
        assert_eq!(typ, "session");
        confirm(&mut pair.server, sender, 1000, 100).await;
        sender
    });
    let mut channel = channel.unwrap();
    assert_eq!(u32::from(channel.id()), client_channel);
    assert_eq!(channel.max_packet_size(), 100);
    assert_eq!(channel.window_size().await, 1000);

    channel.exec(true, "ls").await.unwrap();
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_REQUEST);
    let mut r = &p[1..];
    assert_eq!(u32::decode(&mut r).unwrap(), SERVER_CHANNEL);
    assert_eq!(String::decode(&mut r).unwrap(), "exec");
    assert_eq!(u8::decode(&mut r).unwrap(), 1);
    assert_eq!(String::decode(&mut r).unwrap(), "ls");

    for p in [
        payload(|w| {
            msg::CHANNEL_SUCCESS.encode(w)?;
            client_channel.encode(w)
        }),
        payload(|w| {
            msg::CHANNEL_DATA.encode(w)?;
            client_channel.encode(w)?;
            "hello".encode(w)
        }),
        payload(|w| {
            msg::CHANNEL_EXTENDED_DATA.encode(w)?;
            client_channel.encode(w)?;
            1u32.encode(w)?;
            "oops".encode(w)
        }),
        payload(|w| {
            msg::CHANNEL_REQUEST.encode(w)?;
            client_channel.encode(w)?;
            "exit-status".encode(w)?;
            0u8.encode(w)?;
            3u32.encode(w)
        }),
        payload(|w| {
            msg::CHANNEL_EOF.encode(w)?;
            client_channel.encode(w)
        }),
        payload(|w| {
            msg::CHANNEL_CLOSE.encode(w)?;
            client_channel.encode(w)
        }),
    ] {
        pair.server.send(&p).await;
    }

    assert!(matches!(channel.wait().await, Some(ChannelMsg::Success)));
    match channel.wait().await {
        Some(ChannelMsg::Data { data }) => assert_eq!(&data[..], b"hello"),
        m => panic!("unexpected {m:?}"),
    }
    match channel.wait().await {
        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => assert_eq!(&data[..], b"oops"),
        m => panic!("unexpected {m:?}"),
    }
    assert!(matches!(
        channel.wait().await,
        Some(ChannelMsg::ExitStatus { exit_status: 3 })
    ));
    assert!(matches!(channel.wait().await, Some(ChannelMsg::Eof)));
    assert!(matches!(channel.wait().await, Some(ChannelMsg::Close)));
    assert!(channel.wait().await.is_none());

    // Our answer to the server's close.
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_CLOSE);
    assert_eq!(&p[1..5], &SERVER_CHANNEL.to_be_bytes());

    // Closing again is not sent.
    channel.close().await.unwrap();
    pair.handle.request_service("x").await.unwrap();
    assert_eq!(pair.server.recv_msg().await[0], msg::SERVICE_REQUEST);
}

async fn recv_data(server: &mut FakeServer) -> Vec<u8> {
    let p = server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_DATA);
    let mut r = &p[5..];
    let data = Vec::<u8>::decode(&mut r).unwrap();
    assert!(data.len() <= 4);
    data
}

#[tokio::test]
async fn data_waits_for_window() {
    test_init();
    let mut pair = connected(true).await;
    let (channel, client_channel) = tokio::join!(pair.handle.channel_open_session(), async {
        let (_, sender, _) = recv_open(&mut pair.server).await;
        confirm(&mut pair.server, sender, 8, 4).await;
        sender
    });
    let channel = channel.unwrap();
    let writer = tokio::spawn(async move {
        channel.data(&b"0123456789abcdef"[..]).await.unwrap();
        channel
    });

    let mut received = Vec::new();
    while received.len() < 8 {
        received.extend(recv_data(&mut pair.server).await);
    }
    // The window is spent: nothing more comes.
    assert!(
        tokio::time::timeout(Duration::from_millis(50), pair.server.recv())
            .await
            .is_err()
    );

    pair.server
        .send(&payload(|w| {
            msg::CHANNEL_WINDOW_ADJUST.encode(w)?;
            client_channel.encode(w)?;
            100u32.encode(w)
        }))
        .await;
    while received.len() < 16 {
        received.extend(recv_data(&mut pair.server).await);
    }
    assert_eq!(&received[..], b"0123456789abcdef");

    let mut channel = writer.await.unwrap();
    assert_eq!(channel.window_size().await, 92);
    match channel.wait().await {
        Some(ChannelMsg::WindowAdjusted { new_size }) => assert_eq!(new_size, 100),
        m => panic!("unexpected {m:?}"),
    }
}

#[tokio::test]
async fn channel_sizes_can_be_chosen_per_channel() {
    test_init();
    let mut pair = connected(true).await;
    let (channel, client_channel) = tokio::join!(
        pair.handle
            .channel_open_with(crate::ChannelKind::Session, 1000, 500),
        async {
            let p = pair.server.recv_msg().await;
            assert_eq!(p[0], msg::CHANNEL_OPEN);
            let mut r = &p[1..];
            assert_eq!(String::decode(&mut r).unwrap(), "session");
            let sender = u32::decode(&mut r).unwrap();
            assert_eq!(u32::decode(&mut r).unwrap(), 1000);
            assert_eq!(u32::decode(&mut r).unwrap(), 500);
            confirm(&mut pair.server, sender, 64, 64).await;
            sender
        }
    );
    let mut channel = channel.unwrap();

    for len in [400usize, 200] {
        pair.server
            .send(&payload(|w| {
                msg::CHANNEL_DATA.encode(w)?;
                client_channel.encode(w)?;
                vec![b'x'; len].encode(w)
            }))
            .await;
    }
    // Refilled to this channel's window, not the configured one.
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_WINDOW_ADJUST);
    assert_eq!(&p[1..5], &SERVER_CHANNEL.to_be_bytes());
    assert_eq!(&p[5..9], &600u32.to_be_bytes());
    for len in [400, 200] {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => assert_eq!(data.len(), len),
            m => panic!("unexpected {m:?}"),
        }
    }

    let err = pair
        .handle
        .channel_open_with(crate::ChannelKind::Session, 1000, 0)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");
}

#[tokio::test]
async fn open_failure_is_reported() {
    test_init();
    let mut pair = connected(true).await;
    let (channel, ()) = tokio::join!(
        pair.handle
            .channel_open_direct_tcpip("db.internal", 5432, "127.0.0.1", 40000),
        async {
            let (typ, sender, rest) = recv_open(&mut pair.server).await;
            assert_eq!(typ, "direct-tcpip");
            let mut r = &rest[..];
            assert_eq!(String::decode(&mut r).unwrap(), "db.internal");
            assert_eq!(u32::decode(&mut r).unwrap(), 5432);
            pair.server
                .send(&payload(|w| {
                    msg::CHANNEL_OPEN_FAILURE.encode(w)?;
                    sender.encode(w)?;
                    2u32.encode(w)?;
                    "connect failed".encode(w)?;
                    "".encode(w)
                }))
                .await;
        }
    );
    match channel {
        Err(Error::ChannelOpenFailure {
            reason,
            description,
        }) => {
            assert_eq!(reason, ChannelOpenFailure::ConnectFailed);
            assert_eq!(description, "connect failed");
        }
        r => panic!("unexpected {:?}", r.err()),
    }
}

#[tokio::test]
async fn abandoned_open_is_closed_on_confirmation() {
    test_init();
    let mut pair = connected(true).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(20), pair.handle.channel_open_session())
            .await
            .is_err()
    );
    let (_, sender, _) = recv_open(&mut pair.server).await;
    confirm(&mut pair.server, sender, 1000, 100).await;

    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_CLOSE);
    assert_eq!(&p[1..5], &SERVER_CHANNEL.to_be_bytes());
}

#[tokio::test]
async fn unknown_channels_reach_the_handler() {
    test_init();
    let mut pair = connected(true).await;
    pair.server
        .send(&payload(|w| {
            msg::CHANNEL_DATA.encode(w)?;
            42u32.encode(w)?;
            "stray".encode(w)
        }))
        .await;
    match pair.events.recv().await {
        Some(Event::UnknownChannel(id, msg::CHANNEL_DATA)) => assert_eq!(id, ChannelId(42)),
        e => panic!("unexpected event {e:?}"),
    }
    // The session goes on.
    pair.handle.request_service("x").await.unwrap();
    assert_eq!(pair.server.recv_msg().await[0], msg::SERVICE_REQUEST);
}

fn forwarded_open(sender: u32) -> crate::CryptoVec {
    payload(|w| {
        msg::CHANNEL_OPEN.encode(w)?;
        "forwarded-tcpip".encode(w)?;
        sender.encode(w)?;
        64u32.encode(w)?;
        32u32.encode(w)?;
        "0.0.0.0".encode(w)?;
        8080u32.encode(w)?;
        "10.1.1.1".encode(w)?;
        50000u32.encode(w)
    })
}

#[tokio::test]
async fn server_channels_are_refused_by_default() {
    test_init();
    let mut pair = connected(true).await;
    pair.server.send(&forwarded_open(5)).await;
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_OPEN_FAILURE);
    let mut r = &p[1..];
    assert_eq!(u32::decode(&mut r).unwrap(), 5);
    assert_eq!(
        u32::decode(&mut r).unwrap(),
        ChannelOpenFailure::AdministrativelyProhibited.as_u32()
    );

    // So are unknown channel types.
    pair.server
        .send(&payload(|w| {
            msg::CHANNEL_OPEN.encode(w)?;
            "weird@example.com".encode(w)?;
            6u32.encode(w)?;
            64u32.encode(w)?;
            32u32.encode(w)
        }))
        .await;
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_OPEN_FAILURE);
    assert_eq!(
        &p[5..9],
        &ChannelOpenFailure::UnknownChannelType.as_u32().to_be_bytes()
    );
}

#[tokio::test]
async fn accepted_server_channels_carry_data() {
    test_init();
    let mut pair = connected_with(Config::default(), true, true).await;
    pair.server.send(&forwarded_open(5)).await;

    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_OPEN_CONFIRMATION);
    let mut r = &p[1..];
    assert_eq!(u32::decode(&mut r).unwrap(), 5);
    let client_channel = u32::decode(&mut r).unwrap();

    let mut channel = match pair.events.recv().await {
        Some(Event::ServerChannel(channel, crate::ChannelKind::ForwardedTcpip {
            connected_port, ..
        })) => {
            assert_eq!(connected_port, 8080);
            channel
        }
        e => panic!("unexpected event {e:?}"),
    };
    assert_eq!(u32::from(channel.id()), client_channel);
    assert_eq!(channel.max_packet_size(), 32);

    pair.server
        .send(&payload(|w| {
            msg::CHANNEL_DATA.encode(w)?;
            client_channel.encode(w)?;
            "GET /".encode(w)
        }))
        .await;
    match channel.wait().await {
        Some(ChannelMsg::Data { data }) => assert_eq!(&data[..], b"GET /"),
        m => panic!("unexpected {m:?}"),
    }

    channel.data(&b"200"[..]).await.unwrap();
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::CHANNEL_DATA);
    assert_eq!(&p[1..5], &5u32.to_be_bytes());
}

#[tokio::test]
async fn global_requests() {
    test_init();
    let mut pair = connected(true).await;

    // Server requests are refused.
    pair.server
        .send(&payload(|w| {
            msg::GLOBAL_REQUEST.encode(w)?;
            "hostkeys-00@openssh.com".encode(w)?;
            1u8.encode(w)
        }))
        .await;
    assert_eq!(pair.server.recv_msg().await, [msg::REQUEST_FAILURE]);

    let (port, ()) = tokio::join!(pair.handle.tcpip_forward("127.0.0.1", 0), async {
        let p = pair.server.recv_msg().await;
        assert_eq!(p[0], msg::GLOBAL_REQUEST);
        let mut r = &p[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "tcpip-forward");
        pair.server
            .send(&payload(|w| {
                msg::REQUEST_SUCCESS.encode(w)?;
                2222u32.encode(w)
            }))
            .await;
    });
    assert_eq!(port.unwrap(), 2222);

    let (cancelled, ()) = tokio::join!(pair.handle.cancel_tcpip_forward("127.0.0.1", 2222), async {
        pair.server.recv_msg().await;
        pair.server.send(&[msg::REQUEST_FAILURE]).await;
    });
    assert!(matches!(cancelled, Err(Error::RequestDenied)));
}

#[tokio::test]
async fn unanswered_keepalives_end_the_session() {
    test_init();
    let config = Config {
        keepalive_interval: Some(Duration::from_millis(20)),
        keepalive_max: 2,
        ..Default::default()
    };
    let mut pair = connected_with(config, true, false).await;
    for _ in 0..2 {
        let p = pair.server.recv_msg().await;
        assert_eq!(p[0], msg::GLOBAL_REQUEST);
        let mut r = &p[1..];
        assert_eq!(String::decode(&mut r).unwrap(), "keepalive@openssh.com");
    }
    let err = pair.handle.await.err().unwrap();
    assert!(matches!(err, Error::KeepaliveTimeout), "{err:?}");
}

#[tokio::test]
async fn application_messages() {
    test_init();
    let mut pair = connected(true).await;
    for forbidden in [msg::KEXINIT, msg::DISCONNECT, msg::CHANNEL_DATA] {
        assert!(matches!(
            pair.handle.send_message(vec![forbidden, 0]).await,
            Err(Error::ForbiddenMessage(t)) if t == forbidden
        ));
    }
    // A user authentication request goes through untouched.
    pair.handle.send_message(vec![50, 1, 2, 3]).await.unwrap();
    assert_eq!(pair.server.recv_msg().await, [50, 1, 2, 3]);
}

#[tokio::test]
async fn local_disconnect() {
    test_init();
    let mut pair = connected(true).await;
    pair.handle
        .disconnect(Disconnect::ByApplication, "bye", "en")
        .await;
    let p = pair.server.recv_msg().await;
    assert_eq!(p[0], msg::DISCONNECT);
    assert_eq!(&p[1..5], &11u32.to_be_bytes());

    assert!((&mut pair.handle).await.is_ok());
    assert_eq!(pair.handle.state(), State::Closed);
    assert!(pair.handle.is_closed());
}

#[tokio::test]
async fn remote_disconnect_ends_the_session() {
    test_init();
    let mut pair = connected(true).await;
    pair.server
        .send(&payload(|w| {
            msg::DISCONNECT.encode(w)?;
            11u32.encode(w)?;
            "bye".encode(w)?;
            "".encode(w)
        }))
        .await;
    assert!(pair.handle.await.is_ok());
}
