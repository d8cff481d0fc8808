//! # Call Control
//!
//! The telephony provider's call-control API, seen through a small trait so
//! the bridge can be driven by a fake in tests.
//!
//! ## Operations:
//! - **place_call**: dial out to the operator; the provider answers back on
//!   the status callback URL when the call is picked up
//! - **terminate**: hang up a call by its provider call id
//!
//! `TwilioCallControl` talks to the Twilio REST API with HTTP basic auth.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::TelephonyConfig;
use crate::error::CallControlError;

/// Parameters for an outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    pub to: String,
    pub from: String,
    /// TwiML document the provider executes once the call connects
    pub twiml: String,
    /// Webhook receiving the `answered` status event
    pub status_callback: String,
}

#[async_trait]
pub trait CallControl: Send + Sync {
    /// Dial out and return the provider's call id.
    async fn place_call(&self, call: OutboundCall) -> Result<String, CallControlError>;

    /// Hang up `call_id`.
    async fn terminate(&self, call_id: &str) -> Result<(), CallControlError>;
}

pub struct TwilioCallControl {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    #[serde(default)]
    status: Option<String>,
}

impl TwilioCallControl {
    pub fn new(config: &TelephonyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    fn calls_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        )
    }

    fn call_url(&self, call_id: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.api_base, self.account_sid, call_id
        )
    }

    async fn post_form(&self, url: String, form: &[(&str, &str)]) -> Result<CallResource, CallControlError> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallControlError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<CallResource>()
            .await
            .map_err(|e| CallControlError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl CallControl for TwilioCallControl {
    async fn place_call(&self, call: OutboundCall) -> Result<String, CallControlError> {
        let form = [
            ("To", call.to.as_str()),
            ("From", call.from.as_str()),
            ("Twiml", call.twiml.as_str()),
            ("StatusCallback", call.status_callback.as_str()),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackMethod", "POST"),
        ];
        let resource = self.post_form(self.calls_url(), &form).await?;
        info!(call_id = %resource.sid, to = %call.to, "outbound call placed");
        Ok(resource.sid)
    }

    async fn terminate(&self, call_id: &str) -> Result<(), CallControlError> {
        let resource = self
            .post_form(self.call_url(call_id), &[("Status", "completed")])
            .await?;
        debug!(call_id = %resource.sid, status = ?resource.status, "call terminated");
        Ok(())
    }
}
