//! Session Broker
//!
//! The cloud service that authorizes sessions to an instance. The bridge only
//! asks it for session descriptors and hands those to the relay helper; it
//! never interprets the token or stream URL itself.

mod ssm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ssh::BridgeError;

pub use ssm::SsmBroker;

/// Document for port forwarding to a host reachable from the instance
pub const PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Document for running a command with an interactive stream
pub const INTERACTIVE_COMMAND_DOCUMENT: &str = "AWS-StartInteractiveCommand";

/// Shell started for exec requests; the actual command is fed in afterwards
pub const EXEC_WRAPPER_SHELL: &str = "sh --noprofile --norc -to pipefail";

/// Parameters of a session start, also passed verbatim to the relay helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRequest {
    /// Instance the session lands on
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_name: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Vec<String>>,
}

impl SessionRequest {
    /// Plain interactive shell session
    pub fn interactive(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            document_name: None,
            parameters: BTreeMap::new(),
        }
    }

    /// Port forward from `local_port` on this machine to `host:remote_port`
    /// as seen from the instance
    pub fn port_forward(
        target: impl Into<String>,
        host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
    ) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("host".to_string(), vec![host.into()]);
        parameters.insert("portNumber".to_string(), vec![remote_port.to_string()]);
        parameters.insert("localPortNumber".to_string(), vec![local_port.to_string()]);
        Self {
            target: target.into(),
            document_name: Some(PORT_FORWARD_DOCUMENT.to_string()),
            parameters,
        }
    }

    /// Interactive stream running the exec wrapper shell
    pub fn interactive_command(target: impl Into<String>) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("command".to_string(), vec![EXEC_WRAPPER_SHELL.to_string()]);
        Self {
            target: target.into(),
            document_name: Some(INTERACTIVE_COMMAND_DOCUMENT.to_string()),
            parameters,
        }
    }
}

/// What the broker returns for a started session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub token_value: String,
    pub stream_url: String,
}

/// Where and as whom sessions are started; needed by the relay helper too
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerContext {
    pub region: String,
    pub profile: String,
}

impl BrokerContext {
    /// Regional service endpoint handed to the relay helper
    pub fn endpoint(&self) -> String {
        format!("https://ssm.{}.amazonaws.com", self.region)
    }
}

/// Starts broker sessions
#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Region and profile the sessions belong to
    fn context(&self) -> &BrokerContext;

    /// Start a session and return its descriptor
    async fn start_session(&self, request: &SessionRequest)
        -> Result<SessionDescriptor, BridgeError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interactive_request_json() {
        let request = SessionRequest::interactive("i-0abc");
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"Target":"i-0abc"}"#
        );
    }

    #[test]
    fn test_port_forward_request_json() {
        let request = SessionRequest::port_forward("i-0abc", "db.internal", 5432, 8432);
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["DocumentName"], PORT_FORWARD_DOCUMENT);
        assert_eq!(json["Parameters"]["host"][0], "db.internal");
        assert_eq!(json["Parameters"]["portNumber"][0], "5432");
        assert_eq!(json["Parameters"]["localPortNumber"][0], "8432");
    }

    #[test]
    fn test_interactive_command_wraps_shell() {
        let request = SessionRequest::interactive_command("i-0abc");
        assert_eq!(
            request.document_name.as_deref(),
            Some(INTERACTIVE_COMMAND_DOCUMENT)
        );
        assert_eq!(request.parameters["command"], vec![EXEC_WRAPPER_SHELL]);
    }

    #[test]
    fn test_descriptor_json_field_names() {
        let descriptor = SessionDescriptor {
            session_id: "s-1".into(),
            token_value: "tok".into(),
            stream_url: "wss://example".into(),
        };
        assert_eq!(
            serde_json::to_string(&descriptor).unwrap(),
            r#"{"SessionId":"s-1","TokenValue":"tok","StreamUrl":"wss://example"}"#
        );
    }

    #[test]
    fn test_endpoint() {
        let ctx = BrokerContext {
            region: "eu-west-2".into(),
            profile: "default".into(),
        };
        assert_eq!(ctx.endpoint(), "https://ssm.eu-west-2.amazonaws.com");
    }
}
