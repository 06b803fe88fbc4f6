//! Handshake JSON bodies.
//!
//! The first operation a server emits is `INFO {json}`; the client answers
//! with `CONNECT {json}`. Both bodies are plain JSON objects; unknown fields
//! are ignored for forward compatibility.

use serde::{Deserialize, Serialize};

/// Default maximum payload advertised when the server omits the field.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Server `INFO` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique server identifier.
    pub server_id: String,

    /// Server version string.
    pub version: String,

    /// Host the server considers itself reachable at.
    pub host: String,

    /// Port the server is listening on.
    pub port: u16,

    /// Whether the server requires authentication.
    pub auth_required: bool,

    /// Whether the server requires a secured transport.
    pub tls_required: bool,

    /// Maximum payload size the server accepts, in bytes.
    pub max_payload: usize,

    /// Additional cluster endpoints the client may connect to.
    pub connect_urls: Vec<String>,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            version: String::new(),
            host: String::new(),
            port: 0,
            auth_required: false,
            tls_required: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
            connect_urls: Vec::new(),
        }
    }
}

/// Client `CONNECT` body sent during the handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Server echoes `+OK` for every command when set.
    pub verbose: bool,

    /// Server performs strict subject checking when set.
    pub pedantic: bool,

    /// Client implementation language.
    pub lang: String,

    /// Client library version.
    pub version: String,

    /// Protocol version the client speaks.
    pub protocol: u8,

    /// Client name reported to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Username credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,

    /// Token credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Whether the client connected over a secured transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_required: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_ignores_unknown_fields() {
        let json = r#"{"server_id":"s1","version":"0.9.2","max_payload":2048,"git_commit":"abcdef"}"#;
        let info: ServerInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.server_id, "s1");
        assert_eq!(info.version, "0.9.2");
        assert_eq!(info.max_payload, 2048);
        assert!(!info.auth_required);
    }

    #[test]
    fn test_server_info_defaults() {
        let info: ServerInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(info.max_payload, DEFAULT_MAX_PAYLOAD);
        assert!(info.connect_urls.is_empty());
    }

    #[test]
    fn test_connect_info_omits_absent_credentials() {
        let connect = ConnectInfo {
            verbose: false,
            pedantic: false,
            lang: "rust".to_string(),
            version: "0.1.0".to_string(),
            protocol: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&connect).unwrap();
        assert!(!json.contains("user"));
        assert!(!json.contains("auth_token"));
        assert!(json.contains("\"verbose\":false"));
    }

    #[test]
    fn test_connect_info_includes_credentials() {
        let connect = ConnectInfo {
            user: Some("svc".to_string()),
            pass: Some("secret".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&connect).unwrap();
        assert!(json.contains("\"user\":\"svc\""));
        assert!(json.contains("\"pass\":\"secret\""));
    }
}
