use std::path::PathBuf;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use parley_core::ports::Mailer;
use parley_types::mail::{DigestPayload, MailTemplate};

/// Writes outbound mail to a pickup directory for an external MTA.
///
/// Templates are `{templates_dir}/{id}.txt`: the first line is the subject,
/// the rest is the body. `{{user}}`, `{{items}}` and `{{payload}}` (the digest
/// as JSON) are substituted in both.
pub struct PickupDirMailer {
    templates_dir: PathBuf,
    outbox_dir: PathBuf,
}

impl PickupDirMailer {
    pub async fn new(templates_dir: PathBuf, outbox_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&outbox_dir).await?;
        info!(
            "Mail templates: {}, outbox: {}",
            templates_dir.display(),
            outbox_dir.display()
        );
        Ok(Self {
            templates_dir,
            outbox_dir,
        })
    }
}

#[async_trait]
impl Mailer for PickupDirMailer {
    async fn resolve_template(&self, template_id: Uuid) -> Result<Option<MailTemplate>> {
        let path = self.templates_dir.join(format!("{template_id}.txt"));
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(parse_template(template_id, &raw)))
    }

    async fn send(&self, template: &MailTemplate, payload: &DigestPayload, address: &str) -> Result<()> {
        let message = render_message(template, payload, address)?;
        let path = self.outbox_dir.join(format!("{}.eml", Uuid::new_v4()));
        fs::write(&path, message).await?;
        debug!(
            "Queued digest of {} items for {} at {}",
            payload.items.len(),
            address,
            path.display()
        );
        Ok(())
    }
}

fn parse_template(id: Uuid, raw: &str) -> MailTemplate {
    let (subject, body) = raw.split_once('\n').unwrap_or((raw, ""));
    MailTemplate {
        id,
        subject: subject.trim().to_string(),
        body: body.to_string(),
    }
}

fn render_message(template: &MailTemplate, payload: &DigestPayload, address: &str) -> Result<String> {
    if address.chars().any(char::is_control) {
        bail!("refusing mail address with control characters: {:?}", address);
    }
    let items = payload
        .items
        .iter()
        .map(|item| {
            format!(
                "- [{} / {}] {}\n  {}",
                item.group_name, item.forum_name, item.subject, item.excerpt
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let json = serde_json::to_string_pretty(payload)?;

    let render = |text: &str| {
        text.replace("{{user}}", &payload.display_name)
            .replace("{{items}}", &items)
            .replace("{{payload}}", &json)
    };

    // Header values are single-line.
    let subject: String = render(&template.subject)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    Ok(format!(
        "To: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        address,
        subject.trim(),
        render(&template.body)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::mail::DigestItem;

    fn payload() -> DigestPayload {
        DigestPayload {
            user_id: Uuid::new_v4(),
            display_name: "Ada".into(),
            items: vec![DigestItem {
                module_id: Uuid::new_v4(),
                group_name: "General".into(),
                forum_id: Uuid::new_v4(),
                forum_name: "Help".into(),
                post_id: Uuid::new_v4(),
                subject: "Printer on fire".into(),
                reply_id: None,
                excerpt: "It started this morning".into(),
                author_id: Uuid::new_v4(),
                created_at: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn test_missing_template_resolves_to_none() {
        let templates = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let mailer = PickupDirMailer::new(templates.path().into(), outbox.path().into())
            .await
            .unwrap();

        assert!(mailer.resolve_template(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_renders_into_outbox() {
        let templates = tempfile::tempdir().unwrap();
        let outbox = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        std::fs::write(
            templates.path().join(format!("{id}.txt")),
            "New posts for {{user}}\nHello {{user}},\n\n{{items}}\n",
        )
        .unwrap();
        let mailer = PickupDirMailer::new(templates.path().into(), outbox.path().into())
            .await
            .unwrap();

        let template = mailer.resolve_template(id).await.unwrap().unwrap();
        assert_eq!(template.subject, "New posts for {{user}}");
        mailer.send(&template, &payload(), "ada@example.com").await.unwrap();

        let written: Vec<_> = std::fs::read_dir(outbox.path()).unwrap().collect();
        assert_eq!(written.len(), 1);
        let message = std::fs::read_to_string(written[0].as_ref().unwrap().path()).unwrap();
        assert!(message.starts_with("To: ada@example.com\r\nSubject: New posts for Ada\r\n"));
        assert!(message.contains("Hello Ada,"));
        assert!(message.contains("- [General / Help] Printer on fire"));
    }

    #[test]
    fn test_display_name_cannot_add_headers() {
        let template = parse_template(Uuid::new_v4(), "Hi {{user}}\nBody for {{user}}");
        let mut payload = payload();
        payload.display_name = "Ada\r\nBcc: victim@evil.example".into();

        let message = render_message(&template, &payload, "ada@example.com").unwrap();
        let (headers, _) = message.split_once("\r\n\r\n").unwrap();
        let lines: Vec<&str> = headers.split("\r\n").collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("Subject: Hi Ada"));
        assert!(!headers.lines().any(|l| l.starts_with("Bcc:")));
    }

    #[test]
    fn test_address_with_line_break_is_refused() {
        let template = parse_template(Uuid::new_v4(), "Hi\nBody");
        let err = render_message(&template, &payload(), "ada@example.com\r\nCc: x@evil.example");
        assert!(err.is_err());
    }

    #[test]
    fn test_single_line_template_has_empty_body() {
        let template = parse_template(Uuid::new_v4(), "Subject only");
        assert_eq!(template.subject, "Subject only");
        assert!(template.body.is_empty());
    }
}
