//! Shared WebSocket framing glue for the two frame kinds the tunnel protocol
//! ever puts on the wire: a text metadata frame followed by a binary body
//! frame. Server-side connections speak `axum::extract::ws::Message`
//! (accepted upgrades); client-side connections dial out with
//! `tokio_tungstenite` and speak `tungstenite::Message`. This crate gives
//! each side the same small vocabulary for building and classifying frames
//! so the Connection state machines in `tunnelcrab-server` and
//! `tunnelcrab-client` read the same way.

use axum::extract::ws::Message as AxumMessage;
use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// What a received frame turned out to be, once control frames have been
/// filtered out. The reader loop only ever hands `Data` frames into the
/// request/response rendezvous; everything else is drained inline.
#[derive(Debug)]
pub enum Classified {
    /// A Text or Binary application frame.
    Data(Bytes),
    /// Ping/Pong, already handled by the underlying library; nothing to do.
    Control,
    /// The peer is closing the connection.
    Close,
}

pub fn classify_axum(msg: AxumMessage) -> Classified {
    match msg {
        AxumMessage::Text(t) => Classified::Data(Bytes::from(t.to_string())),
        AxumMessage::Binary(b) => Classified::Data(b),
        AxumMessage::Ping(_) | AxumMessage::Pong(_) => Classified::Control,
        AxumMessage::Close(_) => Classified::Close,
    }
}

pub fn classify_tungstenite(msg: TungsteniteMessage) -> Classified {
    match msg {
        TungsteniteMessage::Text(t) => Classified::Data(Bytes::from(t.to_string())),
        TungsteniteMessage::Binary(b) => Classified::Data(b),
        TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => Classified::Control,
        TungsteniteMessage::Close(_) => Classified::Close,
        TungsteniteMessage::Frame(_) => Classified::Control,
    }
}

pub fn axum_text(s: String) -> AxumMessage {
    AxumMessage::Text(s.into())
}

pub fn axum_binary(b: Vec<u8>) -> AxumMessage {
    AxumMessage::Binary(Bytes::from(b))
}

pub fn tungstenite_text(s: String) -> TungsteniteMessage {
    TungsteniteMessage::Text(s.into())
}

pub fn tungstenite_binary(b: Vec<u8>) -> TungsteniteMessage {
    TungsteniteMessage::Binary(Bytes::from(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_axum_data_frames() {
        match classify_axum(axum_text("hi".into())) {
            Classified::Data(b) => assert_eq!(&b[..], b"hi"),
            _ => panic!("expected data"),
        }
    }

    #[test]
    fn classifies_axum_control_frames() {
        assert!(matches!(
            classify_axum(AxumMessage::Ping(Bytes::new())),
            Classified::Control
        ));
        assert!(matches!(
            classify_axum(AxumMessage::Close(None)),
            Classified::Close
        ));
    }

    #[test]
    fn classifies_tungstenite_data_frames() {
        match classify_tungstenite(tungstenite_binary(vec![1, 2, 3])) {
            Classified::Data(b) => assert_eq!(&b[..], &[1, 2, 3]),
            _ => panic!("expected data"),
        }
    }
}
