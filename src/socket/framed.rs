//! Length-prefixed framing over WebSocket.
//! Each WebSocket binary message = one frame: 3-byte BE length + payload.

use crate::error::{BinaryError, ConnectionError, Error};
use crate::Result;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use super::{read_frame_len, write_frame_len, MAX_FRAME_SIZE};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Send half of a framed WebSocket.
pub struct FramedSend {
    writer: Mutex<futures::stream::SplitSink<WsStream, Message>>,
}

impl FramedSend {
    pub(crate) fn new(writer: futures::stream::SplitSink<WsStream, Message>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write one frame as a single WebSocket binary message: 3-byte length + body.
    pub async fn send_frame(&self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(Error::Binary(BinaryError::FrameTooLarge(data.len())));
        }
        let mut msg = Vec::with_capacity(3 + data.len());
        msg.resize(3, 0);
        write_frame_len(&mut msg, data.len());
        msg.extend_from_slice(data);
        let mut w = self.writer.lock().await;
        w.send(Message::Binary(msg))
            .await
            .map_err(|e| Error::Connection(ConnectionError::WebSocket(e.to_string())))?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.close()
            .await
            .map_err(|e| Error::Connection(ConnectionError::WebSocket(e.to_string())))?;
        Ok(())
    }
}

/// Receive half: each WebSocket binary message is one frame (3-byte len + body).
pub struct FramedRecv {
    reader: Mutex<futures::stream::SplitStream<WsStream>>,
}

impl FramedRecv {
    pub(crate) fn new(reader: futures::stream::SplitStream<WsStream>) -> Self {
        Self {
            reader: Mutex::new(reader),
        }
    }

    /// Read the next frame. Returns the payload with the length prefix stripped.
    pub async fn next_frame(&self) -> Result<Vec<u8>> {
        let mut r = self.reader.lock().await;
        let msg = r
            .next()
            .await
            .ok_or(Error::Connection(ConnectionError::Closed))?
            .map_err(|e| Error::Connection(ConnectionError::WebSocket(e.to_string())))?;
        let data = match msg {
            Message::Binary(d) => d,
            Message::Close(_) => return Err(Error::Connection(ConnectionError::Closed)),
            _ => {
                return Err(Error::Connection(ConnectionError::WebSocket(
                    "expected binary frame".into(),
                )))
            }
        };
        if data.len() < 3 {
            return Err(Error::Binary(BinaryError::MalformedFrame(
                "frame too short".into(),
            )));
        }
        let len = read_frame_len(&data[..3]);
        if data.len() != 3 + len {
            return Err(Error::Binary(BinaryError::MalformedFrame(
                "frame length mismatch".into(),
            )));
        }
        Ok(data[3..].to_vec())
    }
}
