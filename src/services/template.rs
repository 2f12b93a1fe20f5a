use std::collections::HashMap;

use crate::error::EngineError;

/// Substitute `{{name}}` tokens against a flat variable bag.
///
/// A token name is a non-empty run of letters, digits, or underscores.
/// Unknown names render as the empty string. A `{{...}}` span whose
/// inner text is not a valid name is emitted verbatim. An opening `{{`
/// with no `}}` later on the same line is a syntax error. No
/// conditionals, no nesting, no expressions.
pub fn render(text: &str, vars: &HashMap<String, String>) -> Result<String, EngineError> {
    let mut out = String::with_capacity(text.len());
    let mut first = true;
    for (line_no, line) in text.split('\n').enumerate() {
        if !first {
            out.push('\n');
        }
        first = false;
        render_line(line, line_no + 1, vars, &mut out)?;
    }
    Ok(out)
}

fn render_line(
    line: &str,
    line_no: usize,
    vars: &HashMap<String, String>,
    out: &mut String,
) -> Result<(), EngineError> {
    let mut i = 0;
    while i < line.len() {
        let Some(open) = line[i..].find("{{") else {
            out.push_str(&line[i..]);
            break;
        };
        out.push_str(&line[i..i + open]);
        let start = i + open;
        let Some(close) = line[start + 2..].find("}}") else {
            return Err(EngineError::TemplateSyntax(format!("line {}", line_no)));
        };
        let inner = &line[start + 2..start + 2 + close];
        let end = start + 2 + close + 2;
        if is_var_name(inner) {
            if let Some(value) = vars.get(inner) {
                out.push_str(value);
            }
        } else {
            out.push_str(&line[start..end]);
        }
        i = end;
    }
    Ok(())
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Names referenced by `text` that the bag does not cover. The preview
/// endpoint surfaces these so the operator sees which tokens will render
/// empty. Malformed or unclosed tokens are skipped here; `render` is the
/// authority on those.
pub fn scan_unknown(text: &str, vars: &HashMap<String, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for line in text.split('\n') {
        let mut i = 0;
        while i < line.len() {
            let Some(open) = line[i..].find("{{") else { break };
            let start = i + open;
            let Some(close) = line[start + 2..].find("}}") else { break };
            let inner = &line[start + 2..start + 2 + close];
            if is_var_name(inner) && !vars.contains_key(inner) && !unknown.iter().any(|u| u == inner)
            {
                unknown.push(inner.to_string());
            }
            i = start + 2 + close + 2;
        }
    }
    unknown
}

#[derive(Debug, Clone)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

/// Built-in template library for steps that reference a `template_key`
/// instead of carrying an inline body.
pub fn library(key: &str) -> Option<EmailTemplate> {
    match key {
        "cold_outreach" => Some(EmailTemplate {
            subject: "Quick question about {{company_name}}".to_string(),
            body: "<p>Hi {{first_name}},</p>\
                   <p>{{personalization_sentence}}</p>\
                   <p>{{pain_statement}}</p>\
                   <p>{{credibility_anchor}}</p>\
                   <p>Would you be open to a quick 15-minute call this week?</p>"
                .to_string(),
        }),
        "follow_up" => Some(EmailTemplate {
            subject: "Re: Quick question about {{company_name}}".to_string(),
            body: "<p>Hi {{first_name}},</p>\
                   <p>Just wanted to follow up on my previous note. I think this \
                   could be valuable for {{company_name}}.</p>\
                   <p>Let me know if you'd like to chat.</p>"
                .to_string(),
        }),
        "breakup" => Some(EmailTemplate {
            subject: "Closing the loop".to_string(),
            body: "<p>Hi {{first_name}},</p>\
                   <p>I haven't heard back, so I'll assume the timing isn't right \
                   and close the loop on my end.</p>\
                   <p>If anything changes at {{company_name}}, my door is open.</p>"
                .to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_basic_substitution() {
        let v = vars(&[("first_name", "Mia")]);
        assert_eq!(render("Hi {{first_name}}!", &v).unwrap(), "Hi Mia!");
    }

    #[test]
    fn test_unknown_renders_empty() {
        let v = vars(&[]);
        assert_eq!(render("Hi {{first_name}}!", &v).unwrap(), "Hi !");
    }

    #[test]
    fn test_malformed_token_verbatim() {
        let v = vars(&[("first name", "x"), ("a", "1")]);
        assert_eq!(render("{{first name}}", &v).unwrap(), "{{first name}}");
        assert_eq!(render("{{}}", &v).unwrap(), "{{}}");
        assert_eq!(render("a {{a-b}} b", &v).unwrap(), "a {{a-b}} b");
    }

    #[test]
    fn test_unclosed_brace_errors() {
        let v = vars(&[]);
        assert!(matches!(
            render("Hello {{first_name", &v),
            Err(EngineError::TemplateSyntax(_))
        ));
        // Closing on a later line does not rescue it.
        assert!(render("Hello {{first_name\n}}", &v).is_err());
    }

    #[test]
    fn test_lone_closing_braces_are_literal() {
        let v = vars(&[]);
        assert_eq!(render("a }} b", &v).unwrap(), "a }} b");
    }

    #[test]
    fn test_multiline_preserved() {
        let v = vars(&[("a", "1"), ("b", "2")]);
        assert_eq!(render("{{a}}\n\n{{b}}\n", &v).unwrap(), "1\n\n2\n");
    }

    #[test]
    fn test_deterministic() {
        let v = vars(&[("x", "42")]);
        let t = "{{x}} and {{y}} and {{not a name}}";
        assert_eq!(render(t, &v).unwrap(), render(t, &v).unwrap());
    }

    #[test]
    fn test_merge_law_for_covered_names() {
        // render(t, a ∪ b) == render(render(t, a), b) when t's names are
        // covered by `a` and the maps do not collide.
        let a = vars(&[("p", "one"), ("q", "two")]);
        let b = vars(&[("r", "three")]);
        let mut merged = a.clone();
        merged.extend(b.clone());
        let t = "{{p}}-{{q}}";
        assert_eq!(
            render(t, &merged).unwrap(),
            render(&render(t, &a).unwrap(), &b).unwrap()
        );
    }

    #[test]
    fn test_scan_unknown() {
        let v = vars(&[("first_name", "Mia")]);
        let unknown = scan_unknown("{{first_name}} {{pain_statement}} {{pain_statement}} {{bad token}}", &v);
        assert_eq!(unknown, vec!["pain_statement".to_string()]);
    }

    #[test]
    fn test_library_lookup() {
        assert!(library("cold_outreach").is_some());
        assert!(library("no_such_template").is_none());
    }
}
