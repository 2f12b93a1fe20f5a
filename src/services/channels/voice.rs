use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::sender::Sender;
use crate::services::channels::{
    classify_http_status, ChannelAdapter, DispatchOutcome, DispatchStatus, OutboundMessage,
};

const SUBMIT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    to: &'a str,
    from: Option<&'a str>,
    script: &'a str,
}

#[derive(Debug, Deserialize)]
struct CallResponse {
    #[serde(alias = "id")]
    call_id: Option<String>,
}

/// Submits call requests to the voice provider. The submission is the
/// terminal event here; the call's real outcome arrives later on the
/// voice webhook keyed by the returned call id.
pub struct VoiceAdapter {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl VoiceAdapter {
    pub fn new(api_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(SUBMIT_DEADLINE)
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_url,
            api_key,
        }
    }
}

#[async_trait]
impl ChannelAdapter for VoiceAdapter {
    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchOutcome {
        let OutboundMessage::Call { to_phone, script } = message else {
            return DispatchOutcome::permanent("voice adapter received a non-call payload");
        };

        let request = CallRequest {
            to: to_phone,
            from: sender.phone.as_deref(),
            script,
        };

        let mut builder = self.client.post(&self.api_url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DispatchOutcome::transient("call submission timed out")
            }
            Err(e) => return DispatchOutcome::transient(format!("call submission failed: {}", e)),
        };

        let status = response.status().as_u16();
        match classify_http_status(status) {
            DispatchStatus::Sent => {
                // Empty or non-JSON accept bodies still count as queued.
                let external_ref = response
                    .json::<CallResponse>()
                    .await
                    .ok()
                    .and_then(|r| r.call_id);
                DispatchOutcome::sent(external_ref)
            }
            DispatchStatus::TransientFailure => {
                DispatchOutcome::transient(format!("voice provider returned {}", status))
            }
            DispatchStatus::PermanentFailure => {
                DispatchOutcome::permanent(format!("voice provider returned {}", status))
            }
        }
    }
}
