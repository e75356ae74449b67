//! Pure routing of rumqttc events and classification of connection errors

use crate::transport::diagnostics::codes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{ConnectionError, Event, StateError};
use std::io::ErrorKind;

/// Pure routing decisions for rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT v5 event to what the session should do with it
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Map a rumqttc error to a diagnostic code and message
    pub fn classify_connection_error(error: &ConnectionError) -> (i32, String) {
        let code = match error {
            ConnectionError::ConnectionRefused(_) => codes::CONNACK_RETURNCODE,
            ConnectionError::MqttState(StateError::AwaitPingResp) => codes::PING_TIMEOUT,
            ConnectionError::Io(e) => match e.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::UnexpectedEof => codes::SOCKET_CLOSE,
                ErrorKind::TimedOut => codes::CONNECT_TIMEOUT,
                _ => codes::SOCKET_ERROR,
            },
            _ => codes::SOCKET_ERROR,
        };
        (code, error.to_string())
    }

    /// Decode a payload as UTF-8, falling back to a lossy conversion
    ///
    /// The flag is false when bytes had to be replaced.
    pub fn decode_payload(payload: Vec<u8>) -> (String, bool) {
        match String::from_utf8(payload) {
            Ok(text) => (text, true),
            Err(e) => (String::from_utf8_lossy(e.as_bytes()).into_owned(), false),
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// Handshake accepted by the broker
    ConnectionAcknowledged,
    /// Inbound publish
    MessageReceived { topic: String, payload: Vec<u8> },
    /// Broker closed the session
    Disconnected,
    /// Acks and pings handled by rumqttc
    InfrastructureEvent(String),
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, PingResp, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;
    use std::io;

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        );
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Bytes::from("psu/drone"),
            pkid: 0,
            payload: Bytes::from("{\"message\":\"hi\"}"),
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "psu/drone".to_string(),
                payload: b"{\"message\":\"hi\"}".to_vec(),
            }
        );
    }

    #[test]
    fn test_route_infrastructure() {
        let ping = Event::Incoming(Packet::PingResp(PingResp));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&ping),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_classify_io_errors() {
        let reset = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(
            MessageHandler::classify_connection_error(&reset).0,
            codes::SOCKET_CLOSE
        );

        let refused =
            ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let (code, message) = MessageHandler::classify_connection_error(&refused);
        assert_eq!(code, codes::SOCKET_ERROR);
        assert!(message.contains("refused"));
    }

    #[test]
    fn test_classify_broker_refusal() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(
            MessageHandler::classify_connection_error(&refused).0,
            codes::CONNACK_RETURNCODE
        );
    }

    #[test]
    fn test_classify_ping_timeout() {
        let ping = ConnectionError::MqttState(StateError::AwaitPingResp);
        assert_eq!(
            MessageHandler::classify_connection_error(&ping).0,
            codes::PING_TIMEOUT
        );
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(
            MessageHandler::decode_payload(b"hello".to_vec()),
            ("hello".to_string(), true)
        );
        let (text, clean) = MessageHandler::decode_payload(vec![0x68, 0xff, 0x69]);
        assert!(!clean);
        assert_eq!(text, "h\u{fffd}i");
    }
}
