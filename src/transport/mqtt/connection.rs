//! Pure option building for rumqttc sessions
//!
//! Turns a [`SessionTarget`] and [`ConnectOptions`] into the broker URL and
//! `MqttOptions` a WebSocket session needs. Nothing here performs I/O.

use crate::transport::{ConnectOptions, SessionTarget, TransportError};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build the `ws://` or `wss://` endpoint for a session
pub fn build_broker_url(target: &SessionTarget, use_tls: bool) -> Result<Url, TransportError> {
    let scheme = if use_tls { "wss" } else { "ws" };
    let mut url = Url::parse(&format!("{scheme}://{}:{}", target.host, target.port))
        .map_err(|e| TransportError::MalformedTarget(format!("{}: {e}", target.host)))?;

    if url.host_str().is_none() {
        return Err(TransportError::MalformedTarget(format!(
            "no host in {}",
            target.host
        )));
    }

    let path = target.path.trim();
    if path.is_empty() {
        url.set_path("/");
    } else if path.starts_with('/') {
        url.set_path(path);
    } else {
        url.set_path(&format!("/{path}"));
    }
    Ok(url)
}

/// Configure rumqttc for one WebSocket session
pub fn configure_mqtt_options(
    target: &SessionTarget,
    options: &ConnectOptions,
) -> Result<MqttOptions, TransportError> {
    if target.client_id.is_empty() || target.client_id.starts_with(char::is_whitespace) {
        return Err(TransportError::InvalidOptions(
            "client identifier must not be empty or start with whitespace".to_string(),
        ));
    }
    if !options.keep_alive.is_zero() && options.keep_alive < Duration::from_secs(1) {
        return Err(TransportError::InvalidOptions(
            "keep-alive must be zero or at least one second".to_string(),
        ));
    }
    if options.keep_alive > Duration::from_secs(u64::from(u16::MAX)) {
        return Err(TransportError::InvalidOptions(format!(
            "keep-alive must not exceed {}s",
            u16::MAX
        )));
    }

    // Over WebSocket rumqttc takes the full URL as the broker address
    let url = build_broker_url(target, options.use_tls)?;
    let mut mqtt_options = MqttOptions::new(target.client_id.clone(), url.as_str(), target.port);

    let transport = if options.use_tls {
        RumqttcTransport::wss_with_default_config()
    } else {
        RumqttcTransport::Ws
    };
    mqtt_options.set_transport(transport);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(path: &str) -> SessionTarget {
        SessionTarget {
            host: "broker.hivemq.com".to_string(),
            port: 8000,
            path: path.to_string(),
            client_id: "client-1".to_string(),
        }
    }

    fn options(use_tls: bool) -> ConnectOptions {
        ConnectOptions {
            use_tls,
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_plain_websocket_url() {
        let url = build_broker_url(&target("/mqtt"), false).unwrap();
        assert_eq!(url.as_str(), "ws://broker.hivemq.com:8000/mqtt");
    }

    #[test]
    fn test_secure_websocket_url() {
        let mut secure = target("/mqtt");
        secure.port = 8884;
        let url = build_broker_url(&secure, true).unwrap();
        assert_eq!(url.as_str(), "wss://broker.hivemq.com:8884/mqtt");
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(
            build_broker_url(&target(""), false).unwrap().path(),
            "/"
        );
        assert_eq!(
            build_broker_url(&target("mqtt"), false).unwrap().path(),
            "/mqtt"
        );
    }

    #[test]
    fn test_malformed_host_rejected() {
        let mut bad = target("/mqtt");
        bad.host = "bad host name".to_string();
        assert!(matches!(
            build_broker_url(&bad, false),
            Err(TransportError::MalformedTarget(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mqtt_options = configure_mqtt_options(&target("/mqtt"), &options(false)).unwrap();
        let (address, port) = mqtt_options.broker_address();
        assert_eq!(address, "ws://broker.hivemq.com:8000/mqtt");
        assert_eq!(port, 8000);
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(60));
        assert_eq!(mqtt_options.client_id(), "client-1");
    }

    #[test]
    fn test_sub_second_keep_alive_rejected() {
        let mut opts = options(false);
        opts.keep_alive = Duration::from_millis(500);
        assert!(matches!(
            configure_mqtt_options(&target("/mqtt"), &opts),
            Err(TransportError::InvalidOptions(_))
        ));

        opts.keep_alive = Duration::ZERO;
        assert!(configure_mqtt_options(&target("/mqtt"), &opts).is_ok());
    }

    #[test]
    fn test_keep_alive_beyond_u16_rejected() {
        let mut opts = options(false);
        opts.keep_alive = Duration::from_secs(65_536);
        assert!(matches!(
            configure_mqtt_options(&target("/mqtt"), &opts),
            Err(TransportError::InvalidOptions(_))
        ));

        opts.keep_alive = Duration::from_secs(65_535);
        let mqtt_options = configure_mqtt_options(&target("/mqtt"), &opts).unwrap();
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(65_535));
    }

    #[test]
    fn test_blank_client_id_rejected() {
        let mut blank = target("/mqtt");
        blank.client_id = " padded".to_string();
        assert!(configure_mqtt_options(&blank, &options(false)).is_err());
    }
}
