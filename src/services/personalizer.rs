use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

use crate::models::recipient::Recipient;
use crate::models::sequence::PersonalizationMode;

/// Derived variables merged into the template bag before rendering, plus
/// an optional replacement body (fully-personalized mode only).
#[derive(Debug)]
pub struct Personalization {
    pub vars: HashMap<String, String>,
    pub replacement_body: Option<String>,
    /// True when an AI call failed and the generated variables degraded
    /// to empty strings. The executor tags the log entry accordingly.
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
}

#[derive(Debug, Serialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    text: String,
}

const OPENER_PROMPT: &str = r#"Write a 1-2 sentence cold email opener for this prospect. Reference what their company is doing; do not mention that you researched them. No greeting, no sign-off.

Name: {name}
Title: {title}
Company: {company}
Industry: {industry}
Signals: {signals}

Return ONLY the opener sentences."#;

const FULL_EMAIL_PROMPT: &str = r#"Write a short cold outreach email body (under 120 words) for this prospect. Plain paragraphs only, no subject line, no signature, no placeholders.

Name: {name}
Title: {title}
Company: {company}
Industry: {industry}
Signals: {signals}

Return ONLY the email body."#;

pub struct AiClient {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl AiClient {
    pub fn from_env() -> Self {
        Self {
            client: Client::new(),
            api_key: env::var("ANTHROPIC_API_KEY")
                .or_else(|_| env::var("CLAUDE_API_KEY"))
                .ok(),
            model: env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-haiku-20240307".to_string()),
        }
    }

    async fn generate(&self, prompt: String, max_tokens: u32) -> Result<String, String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or("ANTHROPIC_API_KEY or CLAUDE_API_KEY not set")?;

        let request = ClaudeRequest {
            model: self.model.clone(),
            max_tokens,
            messages: vec![ClaudeMessage {
                role: "user".to_string(),
                content: prompt,
            }],
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| format!("Failed to call Claude API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(format!("Claude API error {}: {}", status, error_text));
        }

        let claude_response: ClaudeResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Claude response: {}", e))?;

        claude_response
            .content
            .first()
            .map(|c| c.text.trim().to_string())
            .ok_or_else(|| "Empty Claude response".to_string())
    }

    fn fill_prompt(template: &str, recipient: &Recipient) -> String {
        let name = format!(
            "{} {}",
            recipient.first_name.as_deref().unwrap_or(""),
            recipient.last_name.as_deref().unwrap_or("")
        )
        .trim()
        .to_string();
        template
            .replace("{name}", &name)
            .replace("{title}", recipient.title.as_deref().unwrap_or("unknown"))
            .replace(
                "{company}",
                recipient.company_name.as_deref().unwrap_or("their company"),
            )
            .replace("{industry}", recipient.industry.as_deref().unwrap_or("unknown"))
            .replace("{signals}", &signal_summary(recipient))
    }

    pub async fn generate_opener(&self, recipient: &Recipient) -> Result<String, String> {
        self.generate(Self::fill_prompt(OPENER_PROMPT, recipient), 200).await
    }

    pub async fn generate_full_email(&self, recipient: &Recipient) -> Result<String, String> {
        self.generate(Self::fill_prompt(FULL_EMAIL_PROMPT, recipient), 800).await
    }
}

/// Produce the derived variables for a recipient in the given mode.
/// AI failures never abort the step: the generated variables degrade to
/// empty strings and `degraded` is set.
pub async fn personalize(
    recipient: &Recipient,
    mode: PersonalizationMode,
    ai: &AiClient,
) -> Personalization {
    match mode {
        PersonalizationMode::SignalBased => Personalization {
            vars: signal_based_vars(recipient),
            replacement_body: None,
            degraded: false,
        },
        PersonalizationMode::OpenerOnly => match ai.generate_opener(recipient).await {
            Ok(opener) => {
                let mut vars = signal_based_vars(recipient);
                vars.insert("personalization_sentence".to_string(), opener);
                Personalization {
                    vars,
                    replacement_body: None,
                    degraded: false,
                }
            }
            Err(e) => {
                tracing::warn!("opener generation failed, sending non-personalized: {}", e);
                degraded_fallback()
            }
        },
        PersonalizationMode::FullyPersonalized => match ai.generate_full_email(recipient).await {
            Ok(body) => Personalization {
                vars: signal_based_vars(recipient),
                replacement_body: Some(body),
                degraded: false,
            },
            Err(e) => {
                tracing::warn!("full personalization failed, sending non-personalized: {}", e);
                degraded_fallback()
            }
        },
    }
}

fn degraded_fallback() -> Personalization {
    let mut vars = HashMap::new();
    vars.insert("personalization_sentence".to_string(), String::new());
    vars.insert("pain_statement".to_string(), String::new());
    vars.insert("credibility_anchor".to_string(), String::new());
    Personalization {
        vars,
        replacement_body: None,
        degraded: true,
    }
}

/// Signal keys in descending strength. The first one present and
/// non-empty on the recipient wins.
const SIGNAL_PRIORITY: &[&str] = &["job_postings_count", "intent_score", "equipment_signals"];

fn strongest_signal(recipient: &Recipient) -> Option<&'static str> {
    SIGNAL_PRIORITY.iter().copied().find(|key| {
        recipient
            .attributes
            .get(key)
            .map(|v| match v {
                serde_json::Value::String(s) => !s.is_empty() && s != "0",
                serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0) > 0.0,
                _ => false,
            })
            .unwrap_or(false)
    })
}

fn signal_summary(recipient: &Recipient) -> String {
    let mut parts = Vec::new();
    for key in SIGNAL_PRIORITY {
        if let Some(value) = recipient.attributes.get(*key) {
            parts.push(format!("{}={}", key, value));
        }
    }
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

/// Deterministic library keyed by (industry, strongest signal).
/// No external calls; the same recipient always yields the same lines.
/// Also the variable source for previews, which never call out to AI.
pub fn signal_based_vars(recipient: &Recipient) -> HashMap<String, String> {
    let company = recipient.company_name.as_deref().unwrap_or("your company");
    let industry = recipient
        .industry
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();
    let signal = strongest_signal(recipient);

    let sentence = match (industry.as_str(), signal) {
        (_, Some("job_postings_count")) => format!(
            "I saw {} is hiring, which usually means the team is stretched thin.",
            company
        ),
        (_, Some("intent_score")) => format!(
            "It looks like {} has been evaluating tooling in our space recently.",
            company
        ),
        (_, Some("equipment_signals")) => format!(
            "I noticed {} recently invested in new equipment.",
            company
        ),
        ("logistics", None) => format!(
            "Keeping freight moving at {} can't leave much slack in the day.",
            company
        ),
        ("manufacturing", None) => format!(
            "Line uptime tends to dominate everything else at companies like {}.",
            company
        ),
        _ => format!("I've been following what {} is building.", company),
    };

    let pain = match industry.as_str() {
        "logistics" => "Most ops teams we talk to are stitching together spreadsheets to track carrier performance.",
        "manufacturing" => "Most plant managers we talk to lose hours each week to manual downtime reporting.",
        "software" => "Most engineering leaders we talk to struggle to see where cycle time actually goes.",
        _ => "Most teams we talk to are losing time to manual busywork that never shows up on a roadmap.",
    }
    .to_string();

    let anchor = match industry.as_str() {
        "logistics" => "We helped a 40-truck fleet cut empty miles by 18% in one quarter.",
        "manufacturing" => "We helped a mid-size plant recover 11 hours of line time per month.",
        "software" => "Teams using us ship roughly 20% more merged work per sprint.",
        _ => "Teams that adopt us typically see measurable gains within the first month.",
    }
    .to_string();

    let mut vars = HashMap::new();
    vars.insert("personalization_sentence".to_string(), sentence);
    vars.insert("pain_statement".to_string(), pain);
    vars.insert("credibility_anchor".to_string(), anchor);
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn recipient(industry: &str, attrs: serde_json::Value) -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            email: "mia@acme.io".to_string(),
            first_name: Some("Mia".to_string()),
            last_name: None,
            title: Some("VP Ops".to_string()),
            phone: None,
            linkedin_url: None,
            company_name: Some("Acme".to_string()),
            industry: Some(industry.to_string()),
            attributes: attrs,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_signal_priority() {
        let r = recipient(
            "logistics",
            serde_json::json!({"intent_score": 0.9, "job_postings_count": 4}),
        );
        assert_eq!(strongest_signal(&r), Some("job_postings_count"));

        let r = recipient("logistics", serde_json::json!({"intent_score": 0.9}));
        assert_eq!(strongest_signal(&r), Some("intent_score"));

        let r = recipient("logistics", serde_json::json!({"job_postings_count": 0}));
        assert_eq!(strongest_signal(&r), None);
    }

    #[test]
    fn test_signal_based_deterministic() {
        let r = recipient("manufacturing", serde_json::json!({"job_postings_count": 2}));
        let a = signal_based_vars(&r);
        let b = signal_based_vars(&r);
        assert_eq!(a, b);
        assert!(a.get("personalization_sentence").unwrap().contains("hiring"));
        assert!(a.get("pain_statement").unwrap().contains("plant managers"));
    }

    #[tokio::test]
    async fn test_missing_api_key_degrades() {
        let ai = AiClient {
            client: Client::new(),
            api_key: None,
            model: "claude-3-haiku-20240307".to_string(),
        };
        let r = recipient("software", serde_json::json!({}));
        let p = personalize(&r, PersonalizationMode::OpenerOnly, &ai).await;
        assert!(p.degraded);
        assert_eq!(p.vars.get("personalization_sentence").unwrap(), "");
        assert!(p.replacement_body.is_none());
    }

    #[tokio::test]
    async fn test_signal_based_never_degrades() {
        let ai = AiClient {
            client: Client::new(),
            api_key: None,
            model: "claude-3-haiku-20240307".to_string(),
        };
        let r = recipient("logistics", serde_json::json!({}));
        let p = personalize(&r, PersonalizationMode::SignalBased, &ai).await;
        assert!(!p.degraded);
        assert!(!p.vars.get("personalization_sentence").unwrap().is_empty());
    }
}
