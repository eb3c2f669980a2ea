use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh_transport::client::{self, Config};
use russh_transport::{Disconnect, Error, ServerId};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;

struct Client {
    ids: UnboundedSender<String>,
}

#[async_trait]
impl client::Handler for Client {
    type Error = Error;

    async fn server_identification(&mut self, id: &ServerId) -> Result<(), Self::Error> {
        let _ = self.ids.send(id.software_version().to_string());
        Ok(())
    }
}

fn client() -> Client {
    let (ids, _) = unbounded_channel();
    Client { ids }
}

/// An unencrypted binary packet.
fn cleartext_packet(payload: &[u8]) -> Vec<u8> {
    let mut padding = 8 - (5 + payload.len()) % 8;
    if padding < 4 {
        padding += 8;
    }
    let len = 1 + payload.len() + padding;
    let mut packet = Vec::with_capacity(4 + len);
    packet.extend_from_slice(&(len as u32).to_be_bytes());
    packet.push(padding as u8);
    packet.extend_from_slice(payload);
    packet.extend(std::iter::repeat(0).take(padding));
    packet
}

async fn read_client_id(stream: &mut BufReader<DuplexStream>) -> String {
    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    line
}

#[tokio::test]
async fn silent_server_times_out() {
    let _ = env_logger::try_init();
    let (stream, server) = tokio::io::duplex(4096);
    let config = Config {
        connection_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let result = client::connect_stream(Arc::new(config), stream, client()).await;
    assert!(matches!(result, Err(Error::ConnectionTimeout)));
    drop(server);
}

#[tokio::test]
async fn cancelled_before_connecting() {
    let _ = env_logger::try_init();
    let (stream, _server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = client::connect_stream_with_cancellation(
        Arc::new(Config::default()),
        stream,
        client(),
        cancel,
    )
    .await;
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn cancelled_during_key_exchange() {
    let _ = env_logger::try_init();
    let (stream, server) = tokio::io::duplex(4096);
    let cancel = CancellationToken::new();
    let connect = tokio::spawn(client::connect_stream_with_cancellation(
        Arc::new(Config::default()),
        stream,
        client(),
        cancel.clone(),
    ));
    let mut server = BufReader::new(server);
    assert!(read_client_id(&mut server).await.starts_with("SSH-2.0-"));
    cancel.cancel();
    assert!(matches!(connect.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn disconnect_during_key_exchange() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let (stream, server) = tokio::io::duplex(4096);
    let connect = tokio::spawn(client::connect_stream(
        Arc::new(Config::default()),
        stream,
        client(),
    ));

    let mut server = BufReader::new(server);
    server
        .get_mut()
        .write_all(b"SSH-2.0-Busy_1.0\r\n")
        .await?;
    read_client_id(&mut server).await;

    let mut payload = vec![1u8]; // DISCONNECT
    payload.extend_from_slice(&12u32.to_be_bytes());
    payload.extend_from_slice(&(b"too many".len() as u32).to_be_bytes());
    payload.extend_from_slice(b"too many");
    payload.extend_from_slice(&0u32.to_be_bytes());
    server
        .get_mut()
        .write_all(&cleartext_packet(&payload))
        .await?;

    match connect.await? {
        Err(Error::RemoteDisconnect(info)) => {
            assert_eq!(info.reason_code, 12);
            assert_eq!(info.reason(), Some(Disconnect::TooManyConnections));
            assert_eq!(info.message, "too many");
        }
        r => panic!("unexpected {:?}", r.err()),
    }
    Ok(())
}

#[tokio::test]
async fn banner_lines_are_skipped() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let (stream, server) = tokio::io::duplex(4096);
    let (ids, mut received) = unbounded_channel();
    let connect = tokio::spawn(client::connect_stream(
        Arc::new(Config::default()),
        stream,
        Client { ids },
    ));

    let mut server = BufReader::new(server);
    server
        .get_mut()
        .write_all(b"Welcome.\r\nAuthorized use only\r\nSSH-2.0-Banner_2.1 comment\r\n")
        .await?;
    read_client_id(&mut server).await;
    assert_eq!(received.recv().await.as_deref(), Some("Banner_2.1"));

    // Take the client's KEXINIT, then hang up.
    let mut len = [0; 4];
    server.read_exact(&mut len).await?;
    let mut packet = vec![0; u32::from_be_bytes(len) as usize];
    server.read_exact(&mut packet).await?;
    assert_eq!(packet[1], 20);
    drop(server);
    assert!(matches!(connect.await?, Err(Error::HUP)));
    Ok(())
}

#[tokio::test]
async fn ssh1_servers_are_refused() {
    let _ = env_logger::try_init();
    let (stream, mut server) = tokio::io::duplex(4096);
    server.write_all(b"SSH-1.5-Ancient\r\n").await.unwrap();
    let result = client::connect_stream(Arc::new(Config::default()), stream, client()).await;
    assert!(matches!(result, Err(Error::Version)));
}

#[tokio::test]
async fn connect_over_tcp() -> Result<(), anyhow::Error> {
    let _ = env_logger::try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        let mut socket = BufReader::new(socket);
        socket.get_mut().write_all(b"SSH-2.0-Tcp_1.0\r\n").await?;
        let mut line = String::new();
        socket.read_line(&mut line).await?;

        let mut payload = vec![1u8];
        payload.extend_from_slice(&11u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        socket.get_mut().write_all(&cleartext_packet(&payload)).await?;
        // Until the client hangs up.
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await?;
        Ok::<_, std::io::Error>(line)
    });

    let result = client::connect(Arc::new(Config::default()), addr, client()).await;
    match result {
        Err(Error::RemoteDisconnect(info)) => {
            assert_eq!(info.reason(), Some(Disconnect::ByApplication));
        }
        r => panic!("unexpected {:?}", r.err()),
    }
    assert!(server.await??.starts_with("SSH-2.0-"));
    Ok(())
}
