use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, BrokerError};
use crate::protocol::{ErrorFrame, Frame, HelloFrame, SimulatorAddress, read_frame, send_frame};

use super::{Broker, PeerLink};

pub(super) type FrameReader = BufReader<OwnedReadHalf>;

/// Which side of this broker a connection leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PeerSide {
    Parent,
    Child,
}

async fn read_hello(reader: &mut FrameReader, hello_timeout: Duration) -> AppResult<HelloFrame> {
    match timeout(hello_timeout, read_frame(reader)).await {
        Ok(result) => match result? {
            Frame::Hello(hello) => Ok(hello),
            Frame::Error(error) => Err(AppError::broker(BrokerError::Rejected {
                message: error.message,
            })),
            Frame::Request(_) | Frame::Response(_) => {
                Err(AppError::broker(BrokerError::ExpectedHello))
            }
        },
        Err(_elapsed) => Err(AppError::broker(BrokerError::HelloTimeout)),
    }
}

async fn reject(writer: &mut OwnedWriteHalf, err: AppError) -> AppError {
    let frame = Frame::Error(ErrorFrame {
        message: err.to_string(),
    });
    if let Err(send_err) = send_frame(writer, &frame).await {
        debug!("Failed to send rejection: {}", send_err);
    }
    err
}

/// Runs the child side of the handshake on an accepted connection and
/// registers the child.
pub(super) async fn accept_child(broker: &Broker, stream: TcpStream) -> AppResult<SimulatorAddress> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let hello = match read_hello(&mut reader, broker.inner.options.hello_timeout).await {
        Ok(hello) => hello,
        Err(err) => return Err(reject(&mut write_half, err).await),
    };

    let local = broker.address();
    let child = hello.address;
    if child.is_wildcard() || child.parent() != Some(local) {
        let err = AppError::broker(BrokerError::NotAChild {
            child: child.to_string(),
            parent: local.to_string(),
        });
        return Err(reject(&mut write_half, err).await);
    }
    let (link, outbound) = peer_link(child);
    if !broker.try_register_child(&link) {
        let err = AppError::broker(BrokerError::DuplicateChild {
            address: child.to_string(),
        });
        return Err(reject(&mut write_half, err).await);
    }

    if let Err(err) = send_frame(
        &mut write_half,
        &Frame::Hello(HelloFrame { address: local }),
    )
    .await
    {
        broker.unregister_child(&link);
        return Err(err);
    }
    spawn_peer(broker, link, PeerSide::Child, reader, write_half, outbound);
    info!("Registered child {} from {}", child, peer);
    Ok(child)
}

/// Connects to the parent broker and waits for its acknowledgement.
pub(super) async fn connect_parent(broker: &Broker, addr: &str) -> AppResult<SimulatorAddress> {
    let stream = TcpStream::connect(addr).await.map_err(|err| {
        AppError::broker(BrokerError::Connection {
            addr: addr.to_owned(),
            source: err,
        })
    })?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let local = broker.address();
    send_frame(
        &mut write_half,
        &Frame::Hello(HelloFrame { address: local }),
    )
    .await?;
    let ack = read_hello(&mut reader, broker.inner.options.hello_timeout).await?;
    if local.parent() != Some(ack.address) {
        return Err(AppError::broker(BrokerError::NotAChild {
            child: local.to_string(),
            parent: ack.address.to_string(),
        }));
    }
    info!("Connected {} to parent {} at {}", local, ack.address, addr);
    let (link, outbound) = peer_link(ack.address);
    broker.set_parent(link.clone());
    spawn_peer(broker, link, PeerSide::Parent, reader, write_half, outbound);
    Ok(ack.address)
}

fn peer_link(address: SimulatorAddress) -> (PeerLink, mpsc::UnboundedReceiver<Frame>) {
    let (sender, outbound) = mpsc::unbounded_channel::<Frame>();
    (PeerLink { address, sender }, outbound)
}

/// Starts the writer and reader tasks of a registered link.
fn spawn_peer(
    broker: &Broker,
    link: PeerLink,
    side: PeerSide,
    mut reader: FrameReader,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    let address = link.address;
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(err) = send_frame(&mut writer, &frame).await {
                debug!("Write to {} failed: {}", address, err);
                break;
            }
        }
    });

    let reader_broker = broker.clone();
    let reader_link = link;
    let reader_task = tokio::spawn(async move {
        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(Frame::Request(request)) => {
                    reader_broker.spawn_inbound(reader_link.clone(), side, request);
                }
                Ok(Frame::Response(response)) => {
                    reader_broker.complete_pending(&address, response.message_id, response.response);
                }
                Ok(Frame::Hello(hello)) => {
                    warn!("Ignoring repeated hello from {} ({})", address, hello.address);
                }
                Ok(Frame::Error(error)) => {
                    warn!("{} reported: {}", address, error.message);
                }
                Err(err) => break err.to_string(),
            }
        };
        reader_broker.peer_lost(&reader_link, side, &reason).await;
    });

    broker.track_task(writer_task);
    broker.track_task(reader_task);
}
