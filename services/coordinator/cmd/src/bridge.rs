//! TCP link to the radio bridge.
//!
//! Coordinator to bridge: `len: u16 BE` followed by the MAC frame.
//! Bridge to coordinator, each message starts with a tag byte:
//! - `0x01` received frame: `len: u16 BE`, `rssi: i8`, MAC frame
//! - `0x02` transmit status for the oldest unconfirmed frame: `0` ok,
//!   `1` no acknowledgment, `2` channel access failure

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use zb_stack::{FrameTransport, InboundFrame, TransportError};

const TAG_FRAME: u8 = 0x01;
const TAG_STATUS: u8 = 0x02;

const STATUS_OK: u8 = 0;
const STATUS_NO_ACK: u8 = 1;
const STATUS_CHANNEL_ACCESS_FAILURE: u8 = 2;

/// How long a transmission may stay unconfirmed before the link is considered broken
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of the bridge link
pub struct BridgeTransport {
    writer: OwnedWriteHalf,
    status: mpsc::Receiver<u8>,
}

/// Receiving half of the bridge link, started once the engine exists
pub struct BridgeReader {
    reader: OwnedReadHalf,
    status: mpsc::Sender<u8>,
}

/// Connect to the bridge at `addr`
pub async fn connect(addr: &str) -> std::io::Result<(BridgeTransport, BridgeReader)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    crate::component_info!("bridge", "Connected to radio bridge at {}", addr);
    Ok(split(stream))
}

fn split(stream: TcpStream) -> (BridgeTransport, BridgeReader) {
    let (reader, writer) = stream.into_split();
    let (status_tx, status_rx) = mpsc::channel(16);
    (
        BridgeTransport {
            writer,
            status: status_rx,
        },
        BridgeReader {
            reader,
            status: status_tx,
        },
    )
}

#[async_trait]
impl FrameTransport for BridgeTransport {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let len = u16::try_from(frame.len())
            .map_err(|_| TransportError::Io(format!("Frame of {} bytes too long", frame.len())))?;

        let mut buf = BytesMut::with_capacity(2 + frame.len());
        buf.put_u16(len);
        buf.put_slice(&frame);
        self.writer
            .write_all(&buf)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let status = tokio::time::timeout(STATUS_TIMEOUT, self.status.recv())
            .await
            .map_err(|_| TransportError::Io("Bridge did not confirm transmission".to_string()))?
            .ok_or_else(|| TransportError::Io("Bridge connection closed".to_string()))?;

        match status {
            STATUS_OK => Ok(()),
            STATUS_NO_ACK => Err(TransportError::NoAck),
            STATUS_CHANNEL_ACCESS_FAILURE => Err(TransportError::ChannelAccessFailure),
            other => Err(TransportError::Io(format!(
                "Unknown transmit status 0x{:02x}",
                other
            ))),
        }
    }
}

impl BridgeReader {
    /// Forward received frames to `inbound` until the link or the engine goes away
    pub fn spawn(self, inbound: mpsc::Sender<InboundFrame>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.run(inbound).await {
                Ok(()) => info!("Radio bridge reader stopped"),
                Err(e) => crate::component_warn!("bridge", "Radio bridge link lost: {}", e),
            }
        })
    }

    async fn run(self, inbound: mpsc::Sender<InboundFrame>) -> std::io::Result<()> {
        let mut reader = BufReader::new(self.reader);
        loop {
            let tag = match reader.read_u8().await {
                Ok(tag) => tag,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("Radio bridge closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match tag {
                TAG_FRAME => {
                    let len = reader.read_u16().await? as usize;
                    let rssi = reader.read_i8().await?;
                    let mut data = vec![0u8; len];
                    reader.read_exact(&mut data).await?;
                    crate::component_debug!("bridge", "Received {} byte frame at {} dBm", len, rssi);

                    let frame = InboundFrame {
                        data: Bytes::from(data),
                        rssi,
                    };
                    if inbound.send(frame).await.is_err() {
                        return Ok(());
                    }
                }
                TAG_STATUS => {
                    let status = reader.read_u8().await?;
                    if self.status.send(status).await.is_err() {
                        return Ok(());
                    }
                }
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Unknown bridge message tag 0x{:02x}", other),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn bridge_pair() -> (BridgeTransport, BridgeReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (connected, accepted) = tokio::join!(connect(&addr), listener.accept());
        let (transport, reader) = connected.unwrap();
        (transport, reader, accepted.unwrap().0)
    }

    async fn read_sent(bridge: &mut TcpStream) -> Vec<u8> {
        let len = bridge.read_u16().await.unwrap() as usize;
        let mut frame = vec![0u8; len];
        bridge.read_exact(&mut frame).await.unwrap();
        frame
    }

    #[tokio::test]
    async fn test_send_reports_status() {
        let (mut transport, reader, mut bridge) = bridge_pair().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(4);
        let _task = reader.spawn(inbound_tx);

        let bridge_side = tokio::spawn(async move {
            for status in [STATUS_OK, STATUS_NO_ACK, STATUS_CHANNEL_ACCESS_FAILURE] {
                let frame = read_sent(&mut bridge).await;
                assert_eq!(frame, vec![0x41, 0x88, status]);
                bridge.write_all(&[TAG_STATUS, status]).await.unwrap();
            }
            bridge
        });

        assert_eq!(
            transport
                .send_frame(Bytes::from_static(&[0x41, 0x88, STATUS_OK]))
                .await,
            Ok(())
        );
        assert_eq!(
            transport
                .send_frame(Bytes::from_static(&[0x41, 0x88, STATUS_NO_ACK]))
                .await,
            Err(TransportError::NoAck)
        );
        assert_eq!(
            transport
                .send_frame(Bytes::from_static(&[
                    0x41,
                    0x88,
                    STATUS_CHANNEL_ACCESS_FAILURE
                ]))
                .await,
            Err(TransportError::ChannelAccessFailure)
        );
        bridge_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_received_frames_forwarded() {
        let (_transport, reader, mut bridge) = bridge_pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let _task = reader.spawn(inbound_tx);

        bridge
            .write_all(&[TAG_FRAME, 0x00, 0x03, 0xc4, 0x03, 0x08, 0x01])
            .await
            .unwrap();

        let frame = inbound_rx.recv().await.unwrap();
        assert_eq!(frame.rssi, -60);
        assert_eq!(frame.data, Bytes::from_static(&[0x03, 0x08, 0x01]));
    }

    #[tokio::test]
    async fn test_closed_bridge_fails_sends() {
        let (mut transport, reader, bridge) = bridge_pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let task = reader.spawn(inbound_tx);

        drop(bridge);
        task.await.unwrap();
        assert!(inbound_rx.recv().await.is_none());

        let result = transport.send_frame(Bytes::from_static(&[0x03])).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_stops_reader() {
        let (_transport, reader, mut bridge) = bridge_pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);
        let task = reader.spawn(inbound_tx);

        bridge.write_all(&[0x7f]).await.unwrap();
        task.await.unwrap();
        assert!(inbound_rx.recv().await.is_none());
    }
}
