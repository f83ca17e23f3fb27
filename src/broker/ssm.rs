//! SSM-backed session broker

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ssm::error::DisplayErrorContext;
use tracing::info;

use super::{BrokerContext, SessionBroker, SessionDescriptor, SessionRequest};
use crate::ssh::BridgeError;

/// Profile name reported to the relay helper when none was configured
const DEFAULT_PROFILE: &str = "default";

/// Starts sessions through the SSM `StartSession` API
pub struct SsmBroker {
    client: aws_sdk_ssm::Client,
    context: BrokerContext,
}

impl SsmBroker {
    /// Resolve credentials and region the way the AWS CLI does, with
    /// optional explicit overrides
    pub async fn connect(
        profile: Option<String>,
        region: Option<String>,
    ) -> Result<Self, BridgeError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &profile {
            loader = loader.profile_name(profile);
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        let region = sdk_config
            .region()
            .map(|r| r.to_string())
            .ok_or_else(|| BridgeError::Broker("no AWS region configured".into()))?;

        Ok(Self {
            client: aws_sdk_ssm::Client::new(&sdk_config),
            context: BrokerContext {
                region,
                profile: profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
            },
        })
    }
}

#[async_trait]
impl SessionBroker for SsmBroker {
    fn context(&self) -> &BrokerContext {
        &self.context
    }

    async fn start_session(
        &self,
        request: &SessionRequest,
    ) -> Result<SessionDescriptor, BridgeError> {
        info!("Calling ssm:StartSession for {}", request.target);

        let parameters: Option<HashMap<String, Vec<String>>> = if request.parameters.is_empty() {
            None
        } else {
            Some(
                request
                    .parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        };

        let output = self
            .client
            .start_session()
            .target(&request.target)
            .set_document_name(request.document_name.clone())
            .set_parameters(parameters)
            .send()
            .await
            .map_err(|e| BridgeError::Broker(DisplayErrorContext(&e).to_string()))?;

        let missing = |field: &str| BridgeError::Broker(format!("StartSession returned no {}", field));
        let descriptor = SessionDescriptor {
            session_id: output.session_id().ok_or_else(|| missing("SessionId"))?.to_string(),
            token_value: output.token_value().ok_or_else(|| missing("TokenValue"))?.to_string(),
            stream_url: output.stream_url().ok_or_else(|| missing("StreamUrl"))?.to_string(),
        };

        info!("Started session {}", descriptor.session_id);
        Ok(descriptor)
    }
}
