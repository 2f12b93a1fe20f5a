use regex::Regex;

use crate::models::sender::Sender;

/// Append the sender's stored signature to a rendered email body.
/// Returns (final_rich, final_plain). The subject is not touched.
pub fn attach_signature(sender: &Sender, rich_body: &str, plain_body: &str) -> (String, String) {
    let rich = if sender.signature_rich.is_empty() {
        rich_body.to_string()
    } else {
        format!("{}<br/><br/>{}", rich_body, sender.signature_rich)
    };
    let plain = if sender.signature_plain.is_empty() {
        plain_body.to_string()
    } else {
        format!("{}\n\n{}", plain_body, sender.signature_plain)
    };
    (rich, plain)
}

/// Conservative rich-to-plain conversion: line breaks and paragraph ends
/// become newlines, remaining markup is dropped, common entities are
/// decoded, whitespace runs collapse, and paragraphs stay separated by
/// one blank line. Round-tripping is not a goal.
pub fn html_to_plain(html: &str) -> String {
    let br = Regex::new(r"(?i)<br\s*/?>").unwrap();
    let block_end = Regex::new(r"(?i)</(p|div|h[1-6]|li|tr)\s*>").unwrap();
    let tag = Regex::new(r"<[^>]*>").unwrap();

    let text = br.replace_all(html, "\n");
    let text = block_end.replace_all(&text, "\n\n");
    let text = tag.replace_all(&text, "");
    let text = decode_entities(&text);
    normalize_whitespace(&text)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn normalize_whitespace(text: &str) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    for block in text.split("\n\n") {
        let lines: Vec<String> = block
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect();
        if !lines.is_empty() {
            paragraphs.push(lines.join("\n"));
        }
    }
    paragraphs.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn sender(rich: &str, plain: &str) -> Sender {
        Sender {
            email: "jo@vendor.com".to_string(),
            name: "Jo".to_string(),
            title: None,
            phone: None,
            signature_rich: rich.to_string(),
            signature_plain: plain.to_string(),
            warmup_enabled: false,
            warmup_start_date: None,
            ramp_key: "standard".to_string(),
            daily_cap: 50,
            on_hold: false,
            send_days: vec![0, 1, 2, 3, 4],
            window_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password_encrypted: None,
            encryption_key_id: None,
        }
    }

    #[test]
    fn test_attach_signature() {
        let s = sender("<p>Jo<br/>AE</p>", "Jo\nAE");
        let (rich, plain) = attach_signature(&s, "<p>Body</p>", "Body");
        assert!(rich.ends_with("<p>Jo<br/>AE</p>"));
        assert_eq!(plain, "Body\n\nJo\nAE");
    }

    #[test]
    fn test_empty_signature_leaves_body() {
        let s = sender("", "");
        let (rich, plain) = attach_signature(&s, "<p>Body</p>", "Body");
        assert_eq!(rich, "<p>Body</p>");
        assert_eq!(plain, "Body");
    }

    #[test]
    fn test_html_to_plain_paragraphs() {
        let html = "<p>Hi Mia,</p><p>Two   spaces\tcollapse.</p>";
        assert_eq!(html_to_plain(html), "Hi Mia,\n\nTwo spaces collapse.");
    }

    #[test]
    fn test_html_to_plain_breaks_and_entities() {
        let html = "<div>Fish &amp; chips<br/>line two</div>";
        assert_eq!(html_to_plain(html), "Fish & chips\nline two");
    }

    #[test]
    fn test_html_to_plain_strips_style_tags() {
        let html = "<p style=\"color: red\">Red</p><span>tail</span>";
        assert_eq!(html_to_plain(html), "Red\n\ntail");
    }
}
