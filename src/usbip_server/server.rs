use std::{net::SocketAddr, sync::Arc};

use crate::{
    UsbIpServer,
    error::{FaultKind, Result, UsbIpError},
    session::{EventReceiver, Session, SessionEvent},
    usbip_protocol::{UsbIpCommand, UsbIpResponse},
};
use log::*;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::Notify,
};

/// Serve one USB/IP connection until the client leaves or the session ends
///
/// PDUs are read and handled in order; replies, including completions
/// raised by the host at any time, are written from the session's queue.
pub async fn handler<T: AsyncReadExt + AsyncWriteExt + Unpin>(
    socket: &mut T,
    server: Arc<UsbIpServer>,
) -> Result<()> {
    let limit = server.config().max_transfer_length;
    let (mut session, mut events) = Session::new(server);
    let id = session.id();
    debug!("Session {id} started");

    let (mut reader, mut writer) = tokio::io::split(socket);
    let reader_done = Notify::new();
    let writer_done = Notify::new();

    let reading = async {
        let res = tokio::select! {
            res = read_commands(&mut reader, &mut session, limit) => res,
            _ = writer_done.notified() => Ok(()),
        };
        reader_done.notify_one();
        res
    };
    let writing = async {
        let res = write_events(&mut writer, &mut events, &reader_done).await;
        writer_done.notify_one();
        res
    };
    let (read_res, write_res) = tokio::join!(reading, writing);

    if let Ok(Some(bus_id)) = &write_res {
        session.device_gone(bus_id);
    }
    session.teardown();

    let res = match (read_res, write_res) {
        (Err(err), _) | (Ok(()), Err(err)) => Err(err),
        (Ok(()), Ok(Some(bus_id))) => Err(UsbIpError::DeviceGone(bus_id)),
        (Ok(()), Ok(None)) => Ok(()),
    };
    match res {
        Err(err) if err.is_eof() => {
            info!("Remote closed the connection");
            Ok(())
        }
        Err(err) => {
            match err.kind() {
                FaultKind::Device => info!("Session {id} ended: {err}"),
                FaultKind::Network => warn!("Session {id} lost its connection: {err}"),
                _ => warn!("Session {id} closed: {err}"),
            }
            Err(err)
        }
        Ok(()) => {
            debug!("Session {id} ended");
            Ok(())
        }
    }
}

async fn read_commands<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    session: &mut Session,
    limit: usize,
) -> Result<()> {
    loop {
        let command = UsbIpCommand::read_from_socket_with_limit(reader, limit).await?;
        session.handle(command)?;
    }
}

/// Write queued replies until the imported device goes away or the reader stops
///
/// Returns the bus id of a detached device.
async fn write_events<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    events: &mut EventReceiver,
    reader_done: &Notify,
) -> Result<Option<String>> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = reader_done.notified() => return flush_queued(writer, events).await,
        };
        match event {
            Some(SessionEvent::Reply(response)) => send(writer, &response).await?,
            Some(SessionEvent::DeviceGone(bus_id)) => return Ok(Some(bus_id)),
            None => return Ok(None),
        }
    }
}

/// Send what the session queued before it stopped reading
async fn flush_queued<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    events: &mut EventReceiver,
) -> Result<Option<String>> {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Reply(response) => send(writer, &response).await?,
            SessionEvent::DeviceGone(bus_id) => return Ok(Some(bus_id)),
        }
    }
    Ok(None)
}

async fn send<W: AsyncWriteExt + Unpin>(writer: &mut W, response: &UsbIpResponse) -> Result<()> {
    response.write_to_socket(writer).await?;
    writer.flush().await?;
    trace!("Sent {}", response.name());
    Ok(())
}

/// Spawn a USB/IP server at `addr` using [TcpListener]
pub async fn server(addr: SocketAddr, server: Arc<UsbIpServer>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((mut socket, peer)) => {
                info!("Got connection from {peer}");
                if let Err(err) = socket.set_nodelay(true) {
                    debug!("Could not disable Nagle for {peer}: {err}");
                }
                let new_server = server.clone();
                tokio::spawn(async move {
                    let res = handler(&mut socket, new_server).await;
                    info!("Handler ended with {res:?}");
                });
            }
            Err(err) => {
                warn!("Got error {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usbip_protocol::ImportRequest;
    use crate::util::tests::setup_test_logger;
    use crate::{DeviceDescriptor, ST_OK, USBIP_VERSION};

    #[tokio::test]
    async fn detached_device_ends_the_session() {
        setup_test_logger();
        let (server, _host) = UsbIpServer::new_simulated(vec![DeviceDescriptor::new(1, 1)]);
        let server = Arc::new(server);
        let (mut client, mut remote) = tokio::io::duplex(4096);
        let session = tokio::spawn({
            let server = server.clone();
            async move { handler(&mut remote, server).await }
        });

        let import = UsbIpCommand::OpReqImport {
            version: USBIP_VERSION,
            status: 0,
            busid: ImportRequest::new("1-1").busid,
        };
        client.write_all(&import.to_bytes()).await.unwrap();
        let mut reply = vec![0; 8 + 312];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[4..8], ST_OK.to_be_bytes());

        server.remove_device("1-1").unwrap();
        let res = session.await.unwrap();
        assert!(matches!(&res, Err(UsbIpError::DeviceGone(bus_id)) if bus_id == "1-1"));
        assert_eq!(res.unwrap_err().kind(), FaultKind::Device);
    }
}
