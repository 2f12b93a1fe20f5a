use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use uuid::Uuid;

/// Contact record. The core treats recipients as read-only; the
/// `attributes` bag carries whatever enrichment the importer attached
/// (industry, employee_count, signals, ...).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recipient {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub title: Option<String>,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Recipient {
    /// Flatten the record into the template variable namespace.
    /// Column fields win over same-named enrichment attributes.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();

        if let Some(obj) = self.attributes.as_object() {
            for (key, value) in obj {
                match value {
                    serde_json::Value::String(s) => {
                        vars.insert(key.clone(), s.clone());
                    }
                    serde_json::Value::Number(n) => {
                        vars.insert(key.clone(), n.to_string());
                    }
                    serde_json::Value::Bool(b) => {
                        vars.insert(key.clone(), b.to_string());
                    }
                    _ => {}
                }
            }
        }

        vars.insert("email".to_string(), self.email.clone());
        insert_opt(&mut vars, "first_name", &self.first_name);
        insert_opt(&mut vars, "last_name", &self.last_name);
        insert_opt(&mut vars, "title", &self.title);
        insert_opt(&mut vars, "phone", &self.phone);
        insert_opt(&mut vars, "linkedin_url", &self.linkedin_url);
        insert_opt(&mut vars, "company_name", &self.company_name);
        insert_opt(&mut vars, "industry", &self.industry);

        vars
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

fn insert_opt(vars: &mut HashMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        vars.insert(key.to_string(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> Recipient {
        Recipient {
            id: Uuid::new_v4(),
            email: "mia@acme.io".to_string(),
            first_name: Some("Mia".to_string()),
            last_name: None,
            title: Some("VP Ops".to_string()),
            phone: None,
            linkedin_url: None,
            company_name: Some("Acme".to_string()),
            industry: Some("logistics".to_string()),
            attributes: serde_json::json!({
                "employee_count": 120,
                "intent_score": "0.8",
                "industry": "shadowed-by-column"
            }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_variables_flatten() {
        let vars = recipient().variables();
        assert_eq!(vars.get("first_name").unwrap(), "Mia");
        assert_eq!(vars.get("employee_count").unwrap(), "120");
        assert_eq!(vars.get("intent_score").unwrap(), "0.8");
        assert!(!vars.contains_key("last_name"));
    }

    #[test]
    fn test_columns_win_over_attributes() {
        let vars = recipient().variables();
        assert_eq!(vars.get("industry").unwrap(), "logistics");
    }
}
