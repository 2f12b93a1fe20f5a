use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// Sending identity: signature, warmup state, send window, SMTP account.
/// Day numbers in `send_days` run 0 = Monday .. 6 = Sunday.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sender {
    pub email: String,
    pub name: String,
    pub title: Option<String>,
    pub phone: Option<String>,
    pub signature_rich: String,
    pub signature_plain: String,
    pub warmup_enabled: bool,
    pub warmup_start_date: Option<NaiveDate>,
    pub ramp_key: String,
    pub daily_cap: i32,
    pub on_hold: bool,
    pub send_days: Vec<i32>,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub timezone: String,
    #[serde(skip_serializing)]
    pub smtp_host: String,
    #[serde(skip_serializing)]
    pub smtp_port: i32,
    #[serde(skip_serializing)]
    pub smtp_username: String,
    #[serde(skip_serializing)]
    pub smtp_password_encrypted: Option<Vec<u8>>,
    #[serde(skip_serializing)]
    pub encryption_key_id: Option<String>,
}

impl Sender {
    /// Sender-side template variables.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("sender_name".to_string(), self.name.clone());
        vars.insert("sender_email".to_string(), self.email.clone());
        if let Some(title) = &self.title {
            vars.insert("sender_title".to_string(), title.clone());
        }
        if let Some(phone) = &self.phone {
            vars.insert("sender_phone".to_string(), phone.clone());
        }
        vars.insert("signature".to_string(), self.signature_rich.clone());
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables() {
        let sender = Sender {
            email: "jo@vendor.com".to_string(),
            name: "Jo Smith".to_string(),
            title: Some("AE".to_string()),
            phone: None,
            signature_rich: "<p>Jo</p>".to_string(),
            signature_plain: "Jo".to_string(),
            warmup_enabled: false,
            warmup_start_date: None,
            ramp_key: "standard".to_string(),
            daily_cap: 50,
            on_hold: false,
            send_days: vec![0, 1, 2, 3, 4],
            window_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
            smtp_host: "smtp.vendor.com".to_string(),
            smtp_port: 587,
            smtp_username: "jo@vendor.com".to_string(),
            smtp_password_encrypted: None,
            encryption_key_id: None,
        };
        let vars = sender.variables();
        assert_eq!(vars.get("sender_name").unwrap(), "Jo Smith");
        assert_eq!(vars.get("sender_email").unwrap(), "jo@vendor.com");
        assert!(!vars.contains_key("sender_phone"));
    }
}
