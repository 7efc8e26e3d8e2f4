//! Push-channel transport.
//!
//! The receiver only needs "connect" and "read the next frame", so the socket sits behind two small
//! traits. Production uses a blocking WebSocket; tests script frames in memory.

use http::HeaderValue;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

/// How long a blocking read waits before reporting `Frame::Idle`.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum ChannelError {
    Request(String),
    Connect(String),
    Transport(String),
}

impl core::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ChannelError::Request(s) => write!(f, "invalid push channel request: {}", s),
            ChannelError::Connect(s) => write!(f, "push channel connect failed: {}", s),
            ChannelError::Transport(s) => write!(f, "push channel transport error: {}", s),
        }
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    /// A frame arrived but could not be turned into text. Carries the reason.
    Undecodable(String),
    /// Nothing arrived within the read interval; the connection is still up.
    Idle,
    /// The peer closed the connection.
    Closed,
}

pub trait PushConnection {
    fn read_frame(&mut self) -> Result<Frame, ChannelError>;
    /// Best-effort close handshake. Never fails.
    fn close(&mut self);
}

pub trait PushConnector: Send + Sync + 'static {
    type Connection: PushConnection;

    fn connect(&self) -> Result<Self::Connection, ChannelError>;
}

pub struct WsConnector {
    url: String,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        WsConnector {
            url: url.into(),
            token,
        }
    }
}

pub struct WsConnection {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl PushConnector for WsConnector {
    type Connection = WsConnection;

    fn connect(&self) -> Result<WsConnection, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Request(e.to_string()))?;
        if let Some(token) = self.token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChannelError::Request(e.to_string()))?;
            request.headers_mut().insert(http::header::AUTHORIZATION, value);
        }

        let (mut socket, _response) = tungstenite::connect(request).map_err(|e| ChannelError::Connect(e.to_string()))?;
        set_read_timeout(&mut socket, READ_POLL_INTERVAL)?;
        Ok(WsConnection { socket })
    }
}

fn set_read_timeout(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Duration) -> Result<(), ChannelError> {
    let result = match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(timeout)),
        MaybeTlsStream::Rustls(stream) => stream.sock.set_read_timeout(Some(timeout)),
        _ => Ok(()),
    };
    result.map_err(|e| ChannelError::Connect(format!("set_read_timeout: {}", e)))
}

fn binary_frame(bytes: Vec<u8>) -> Frame {
    match String::from_utf8(bytes) {
        Ok(text) => Frame::Text(text),
        Err(e) => Frame::Undecodable(format!("binary frame is not valid UTF-8: {}", e.utf8_error())),
    }
}

impl PushConnection for WsConnection {
    fn read_frame(&mut self) -> Result<Frame, ChannelError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Frame::Text(text)),
            Ok(Message::Binary(bytes)) => Ok(binary_frame(bytes)),
            Ok(Message::Close(_)) => Ok(Frame::Closed),
            // ping/pong replies are queued by tungstenite itself
            Ok(_) => Ok(Frame::Idle),
            Err(tungstenite::Error::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(Frame::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(Frame::Closed),
            Err(e) => Err(ChannelError::Transport(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_are_text_or_undecodable() {
        assert_eq!(binary_frame(b"{\"type\":\"update\"}".to_vec()), Frame::Text(r#"{"type":"update"}"#.into()));
        match binary_frame(vec![0xff, 0xfe, 0x00]) {
            Frame::Undecodable(reason) => assert!(reason.contains("UTF-8")),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
