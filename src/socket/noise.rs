//! Noise protocol handshake and transport (XX_25519_AESGCM_SHA256).
//!
//! After the handshake completes, every frame in each direction is
//! AEAD-encrypted under snow's transport state; the frame counters here
//! mirror snow's internal nonces and increase strictly by one per frame.
//! Any decrypt failure is fatal: the connection transitions to
//! `Closing` and the error surfaces as `DecryptFailure`.

use crate::binary::{Node, NOISE_START_PATTERN, WA_CONN_HEADER};
use crate::error::{ConnectionError, Error};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::framed::{FramedRecv, FramedSend};
use super::ConnectionState;

/// Noise pattern used by the multidevice service.
const NOISE_PATTERN: &str = "Noise_XX_25519_AESGCM_SHA256";

/// Largest plaintext a single Noise message can carry (65535 - 16 tag).
const MAX_NOISE_PAYLOAD: usize = 65535 - 16;

fn handshake_err(stage: &str, e: impl std::fmt::Display) -> Error {
    Error::Connection(ConnectionError::HandshakeFailure(format!("{stage}: {e}")))
}

/// Prologue hashed into the handshake: WA header + pattern string.
fn prologue() -> Vec<u8> {
    let mut p = Vec::with_capacity(WA_CONN_HEADER.len() + NOISE_START_PATTERN.len());
    p.extend_from_slice(&WA_CONN_HEADER);
    p.extend_from_slice(NOISE_START_PATTERN);
    p
}

/// Post-handshake cipher shared by both halves: snow's transport state
/// plus per-direction frame counters.
pub(crate) struct FrameCipher {
    state: Mutex<snow::TransportState>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl FrameCipher {
    pub(crate) fn new(state: snow::TransportState) -> Self {
        Self {
            state: Mutex::new(state),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_NOISE_PAYLOAD {
            return Err(Error::Binary(crate::error::BinaryError::FrameTooLarge(
                plaintext.len(),
            )));
        }
        let mut ciphertext = vec![0u8; plaintext.len() + 16];
        let len = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.write_message(plaintext, &mut ciphertext)
                .map_err(|_| Error::Connection(ConnectionError::DecryptFailure))?
        };
        ciphertext.truncate(len);
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut plaintext = vec![0u8; ciphertext.len()];
        let len = {
            let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
            st.read_message(ciphertext, &mut plaintext)
                .map_err(|_| Error::Connection(ConnectionError::DecryptFailure))?
        };
        plaintext.truncate(len);
        self.received.fetch_add(1, Ordering::SeqCst);
        Ok(plaintext)
    }

    /// (frames sent, frames received) since the handshake.
    pub(crate) fn counters(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::SeqCst),
            self.received.load(Ordering::SeqCst),
        )
    }
}

type SharedState = Arc<Mutex<ConnectionState>>;

fn set_state(state: &SharedState, next: ConnectionState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = next;
}

fn get_state(state: &SharedState) -> ConnectionState {
    *state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run the Noise XX handshake as initiator over the framed WebSocket.
///
/// The first client frame is: routing info (verbatim, when present in
/// creds) + WA header + first handshake message. Consumes the framed
/// halves and returns the encrypted transport and receive halves.
pub async fn run_client_handshake(
    send: FramedSend,
    recv: FramedRecv,
    static_key: &[u8; 32],
    routing_info: Option<&[u8]>,
    login_payload: &[u8],
) -> Result<(NoiseTransport, NoiseRecv)> {
    let state: SharedState = Arc::new(Mutex::new(ConnectionState::Handshaking));
    let prologue = prologue();
    let params = NOISE_PATTERN
        .parse()
        .map_err(|e: snow::Error| handshake_err("params", e))?;
    let mut handshake = snow::Builder::new(params)
        .prologue(&prologue[..])
        .map_err(|e| handshake_err("prologue", e))?
        .local_private_key(static_key)
        .map_err(|e| handshake_err("static key", e))?
        .build_initiator()
        .map_err(|e| handshake_err("build", e))?;

    // XX: -> e
    let mut msg_buf = [0u8; 65535];
    let len = handshake
        .write_message(&[], &mut msg_buf)
        .map_err(|e| handshake_err("client hello", e))?;
    let mut first_frame = Vec::new();
    if let Some(routing) = routing_info {
        first_frame.extend_from_slice(routing);
    }
    first_frame.extend_from_slice(&WA_CONN_HEADER);
    first_frame.extend_from_slice(&msg_buf[..len]);
    send.send_frame(&first_frame).await?;

    // XX: <- e, ee, s, es
    let frame2 = recv.next_frame().await?;
    let mut payload_buf = [0u8; 65535];
    handshake
        .read_message(&frame2, &mut payload_buf)
        .map_err(|e| handshake_err("server hello", e))?;

    // XX: -> s, se (carrying the login payload)
    let len2 = handshake
        .write_message(login_payload, &mut msg_buf)
        .map_err(|e| handshake_err("client finish", e))?;
    send.send_frame(&msg_buf[..len2]).await?;

    if !handshake.is_handshake_finished() {
        return Err(handshake_err("finish", "pattern not complete"));
    }
    let transport_state = handshake
        .into_transport_mode()
        .map_err(|e| handshake_err("transport", e))?;

    set_state(&state, ConnectionState::Open);
    tracing::debug!("noise handshake complete");

    let cipher = Arc::new(FrameCipher::new(transport_state));
    Ok((
        NoiseTransport {
            framed: send,
            cipher: Arc::clone(&cipher),
            state: Arc::clone(&state),
        },
        NoiseRecv {
            framed: recv,
            cipher,
            state,
        },
    ))
}

/// Connect to the given WebSocket URL and complete the Noise handshake.
pub async fn connect_noise(
    url: &str,
    static_key: &[u8; 32],
    routing_info: Option<&[u8]>,
    login_payload: &[u8],
) -> Result<(NoiseTransport, NoiseRecv)> {
    let (send, recv) = super::ws::connect(url).await?;
    run_client_handshake(send, recv, static_key, routing_info, login_payload).await
}

/// Send half: encrypts stanza bytes with Noise before framing.
pub struct NoiseTransport {
    framed: FramedSend,
    cipher: Arc<FrameCipher>,
    state: SharedState,
}

impl NoiseTransport {
    /// Encrypt and send one frame. Only legal in the `Open` state.
    pub async fn send_encrypted(&self, plaintext: &[u8]) -> Result<()> {
        let current = get_state(&self.state);
        if current != ConnectionState::Open {
            return Err(Error::Connection(ConnectionError::NotOpen(current)));
        }
        let ciphertext = self.cipher.encrypt(plaintext)?;
        self.framed.send_frame(&ciphertext).await
    }

    /// Graceful close: the `<close/>` stanza, then the WebSocket close
    /// frame.
    pub async fn close_graceful(&self) -> Result<()> {
        set_state(&self.state, ConnectionState::Closing);
        let close = Node::new("close").marshal()?;
        if let Ok(ciphertext) = self.cipher.encrypt(&close) {
            let _ = self.framed.send_frame(&ciphertext).await;
        }
        let result = self.framed.close().await;
        set_state(&self.state, ConnectionState::Closed);
        result
    }

    pub fn state(&self) -> ConnectionState {
        get_state(&self.state)
    }

    /// (frames sent, frames received) since the handshake.
    pub fn frame_counters(&self) -> (u64, u64) {
        self.cipher.counters()
    }
}

#[async_trait]
impl crate::transport::Transport for NoiseTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_encrypted(data).await
    }

    async fn close(&self) -> Result<()> {
        self.close_graceful().await
    }
}

/// Receive half: reads one frame and decrypts it.
pub struct NoiseRecv {
    framed: FramedRecv,
    cipher: Arc<FrameCipher>,
    state: SharedState,
}

impl NoiseRecv {
    /// Read the next frame and decrypt. A decrypt failure is fatal: the
    /// connection moves to `Closing` and no further reads will succeed.
    pub async fn next_decrypted_frame(&self) -> Result<Vec<u8>> {
        if get_state(&self.state) != ConnectionState::Open {
            return Err(Error::Connection(ConnectionError::Closed));
        }
        let ciphertext = self.framed.next_frame().await?;
        match self.cipher.decrypt(&ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => {
                tracing::error!("frame decrypt failed, closing connection");
                set_state(&self.state, ConnectionState::Closing);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        get_state(&self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory XX handshake between an initiator and responder,
    /// returning both transport states.
    fn handshake_pair() -> (snow::TransportState, snow::TransportState) {
        let prologue = prologue();
        let params: snow::params::NoiseParams = NOISE_PATTERN.parse().unwrap();
        let init_static = snow::Builder::new(params.clone()).generate_keypair().unwrap();
        let resp_static = snow::Builder::new(params.clone()).generate_keypair().unwrap();
        let mut initiator = snow::Builder::new(params.clone())
            .prologue(&prologue)
            .unwrap()
            .local_private_key(&init_static.private)
            .unwrap()
            .build_initiator()
            .unwrap();
        let mut responder = snow::Builder::new(params)
            .prologue(&prologue)
            .unwrap()
            .local_private_key(&resp_static.private)
            .unwrap()
            .build_responder()
            .unwrap();

        let mut buf_a = [0u8; 1024];
        let mut buf_b = [0u8; 1024];
        let len = initiator.write_message(&[], &mut buf_a).unwrap();
        responder.read_message(&buf_a[..len], &mut buf_b).unwrap();
        let len = responder.write_message(&[], &mut buf_a).unwrap();
        initiator.read_message(&buf_a[..len], &mut buf_b).unwrap();
        let len = initiator.write_message(&[], &mut buf_a).unwrap();
        responder.read_message(&buf_a[..len], &mut buf_b).unwrap();

        (
            initiator.into_transport_mode().unwrap(),
            responder.into_transport_mode().unwrap(),
        )
    }

    #[test]
    fn frame_cipher_roundtrip_with_strict_counters() {
        let (init, resp) = handshake_pair();
        let a = FrameCipher::new(init);
        let b = FrameCipher::new(resp);
        for i in 1..=5u64 {
            let msg = format!("frame {i}");
            let ct = a.encrypt(msg.as_bytes()).unwrap();
            assert_eq!(b.decrypt(&ct).unwrap(), msg.as_bytes());
            assert_eq!(a.counters().0, i);
            assert_eq!(b.counters().1, i);
        }
    }

    #[test]
    fn frame_cipher_rejects_tampered_frames() {
        let (init, resp) = handshake_pair();
        let a = FrameCipher::new(init);
        let b = FrameCipher::new(resp);
        let mut ct = a.encrypt(b"payload").unwrap();
        ct[0] ^= 1;
        let err = b.decrypt(&ct).unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::DecryptFailure)
        ));
    }

    #[test]
    fn both_directions_are_independent() {
        let (init, resp) = handshake_pair();
        let a = FrameCipher::new(init);
        let b = FrameCipher::new(resp);
        let ct_ab = a.encrypt(b"a to b").unwrap();
        let ct_ba = b.encrypt(b"b to a").unwrap();
        assert_eq!(b.decrypt(&ct_ab).unwrap(), b"a to b");
        assert_eq!(a.decrypt(&ct_ba).unwrap(), b"b to a");
        assert_eq!(a.counters(), (1, 1));
        assert_eq!(b.counters(), (1, 1));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (init, _) = handshake_pair();
        let a = FrameCipher::new(init);
        let big = vec![0u8; MAX_NOISE_PAYLOAD + 1];
        assert!(a.encrypt(&big).is_err());
    }
}
