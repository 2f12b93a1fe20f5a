use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::sender::Sender;
use crate::services::channels::{
    classify_http_status, ChannelAdapter, DispatchOutcome, DispatchStatus, OutboundMessage,
};

const ACTION_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct BridgeAction<'a> {
    account: &'a str,
    profile_url: &'a str,
    message: &'a str,
}

/// One account's browser session state. Actions on an account are
/// strictly serial; the mutex around this struct is the queue.
struct AccountSession {
    last_action_at: Option<Instant>,
    actions_today: i64,
    date: NaiveDate,
}

/// Drives connect / message actions through the headless-browser bridge.
/// Each account gets a pooled session with a jittered minimum interval
/// between actions and a hard daily action cap that is checked before
/// the Rate Governor ever sees the step.
pub struct NetworkAdapter {
    client: Client,
    bridge_url: String,
    sessions: Mutex<HashMap<String, Arc<Mutex<AccountSession>>>>,
    min_interval: Duration,
    max_interval: Duration,
    daily_cap: i64,
}

impl NetworkAdapter {
    pub fn new(
        bridge_url: String,
        min_interval: Duration,
        max_interval: Duration,
        daily_cap: i64,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(ACTION_DEADLINE)
                .build()
                .unwrap_or_else(|_| Client::new()),
            bridge_url,
            sessions: Mutex::new(HashMap::new()),
            min_interval,
            max_interval,
            daily_cap,
        }
    }

    async fn session(&self, account: &str) -> Arc<Mutex<AccountSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(account.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountSession {
                    last_action_at: None,
                    actions_today: 0,
                    date: Utc::now().date_naive(),
                }))
            })
            .clone()
    }

    /// Whether the account has exhausted today's hard action cap. The
    /// executor checks this before it asks the Rate Governor for a slot.
    pub async fn at_daily_cap(&self, account: &str) -> bool {
        let session = self.session(account).await;
        let session = session.lock().await;
        session.date == Utc::now().date_naive() && session.actions_today >= self.daily_cap
    }

    fn jittered_interval(&self) -> Duration {
        if self.max_interval <= self.min_interval {
            return self.min_interval;
        }
        let spread = (self.max_interval - self.min_interval).as_secs();
        let extra = rand::thread_rng().gen_range(0..=spread);
        self.min_interval + Duration::from_secs(extra)
    }

    async fn perform(&self, endpoint: &str, action: BridgeAction<'_>) -> DispatchOutcome {
        let url = format!("{}/{}", self.bridge_url.trim_end_matches('/'), endpoint);
        let response = match self.client.post(&url).json(&action).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DispatchOutcome::transient("browser action timed out")
            }
            Err(e) => return DispatchOutcome::transient(format!("browser bridge error: {}", e)),
        };

        let status = response.status().as_u16();
        match classify_http_status(status) {
            DispatchStatus::Sent => DispatchOutcome::sent(None),
            DispatchStatus::TransientFailure => {
                DispatchOutcome::transient(format!("browser bridge returned {}", status))
            }
            DispatchStatus::PermanentFailure => {
                DispatchOutcome::permanent(format!("browser bridge returned {}", status))
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for NetworkAdapter {
    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchOutcome {
        let (endpoint, profile_url, body) = match message {
            OutboundMessage::NetworkConnect {
                profile_url,
                message,
            } => ("connect", profile_url, message),
            OutboundMessage::NetworkMessage {
                profile_url,
                message,
            } => ("message", profile_url, message),
            _ => {
                return DispatchOutcome::permanent(
                    "network adapter received a non-network payload",
                )
            }
        };

        let session = self.session(&sender.email).await;
        let mut session = session.lock().await;

        let today = Utc::now().date_naive();
        if session.date != today {
            session.date = today;
            session.actions_today = 0;
        }
        if session.actions_today >= self.daily_cap {
            return DispatchOutcome::transient("account daily action cap reached");
        }

        // Pace actions on this account; the session lock is held across
        // the pause so nothing else can slip in between.
        if let Some(last) = session.last_action_at {
            let interval = self.jittered_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }

        let outcome = self
            .perform(
                endpoint,
                BridgeAction {
                    account: &sender.email,
                    profile_url,
                    message: body,
                },
            )
            .await;

        session.last_action_at = Some(Instant::now());
        if outcome.status == DispatchStatus::Sent {
            session.actions_today += 1;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jittered_interval_bounds() {
        let adapter = NetworkAdapter::new(
            "http://localhost:4444".to_string(),
            Duration::from_secs(120),
            Duration::from_secs(300),
            40,
        );
        for _ in 0..50 {
            let interval = adapter.jittered_interval();
            assert!(interval >= Duration::from_secs(120));
            assert!(interval <= Duration::from_secs(300));
        }
    }

    #[test]
    fn test_degenerate_interval_range() {
        let adapter = NetworkAdapter::new(
            "http://localhost:4444".to_string(),
            Duration::from_secs(60),
            Duration::from_secs(60),
            40,
        );
        assert_eq!(adapter.jittered_interval(), Duration::from_secs(60));
    }
}
