use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, instrument};

use crate::environment::Config;
use crate::models::DigestDetail;
use crate::usage::BudgetAlert;
use crate::TARGET_WEB_REQUEST;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const RESEND_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_FROM_NAME: &str = "Sifto";

/// Outbound email. `enabled` is fixed at startup from configuration.
#[async_trait]
pub trait Mailer: Send + Sync {
    fn enabled(&self) -> bool;

    async fn send_digest(
        &self,
        to: &str,
        digest: &DigestDetail,
        copy: Option<(&str, &str)>,
    ) -> Result<()>;

    async fn send_budget_alert(&self, to: &str, month_label: &str, alert: &BudgetAlert)
        -> Result<()>;
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: Option<String>,
    from: Option<String>,
}

impl ResendMailer {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RESEND_TIMEOUT)
            .build()
            .context("failed to build Resend HTTP client")?;
        let from = config
            .resend_from_email
            .as_deref()
            .map(|addr| formatted_from(addr, &config.resend_from_name));
        Ok(Self {
            client,
            api_key: config.resend_api_key.clone(),
            from,
        })
    }

    async fn post(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let (Some(api_key), Some(from)) = (self.api_key.as_deref(), self.from.as_deref()) else {
            info!(target: TARGET_WEB_REQUEST, "Resend disabled, skipping email to {}", to);
            return Ok(());
        };
        let response = self
            .client
            .post(RESEND_ENDPOINT)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&ResendEmail {
                from,
                to: [to],
                subject,
                html,
            })
            .send()
            .await
            .context("resend: request failed")?;
        let status = response.status().as_u16();
        if status >= 400 {
            anyhow::bail!("resend: status {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    fn enabled(&self) -> bool {
        self.api_key.is_some() && self.from.is_some()
    }

    #[instrument(target = "web_request", level = "info", skip(self, digest, copy), fields(digest_id = %digest.digest.id))]
    async fn send_digest(
        &self,
        to: &str,
        digest: &DigestDetail,
        copy: Option<(&str, &str)>,
    ) -> Result<()> {
        let subject = digest_subject(&digest.digest.digest_date, copy.map(|(s, _)| s));
        let html = build_digest_html(digest, copy.map(|(_, b)| b));
        self.post(to, &subject, &html).await
    }

    #[instrument(target = "web_request", level = "info", skip(self, alert))]
    async fn send_budget_alert(
        &self,
        to: &str,
        month_label: &str,
        alert: &BudgetAlert,
    ) -> Result<()> {
        let subject = format!(
            "Sifto: monthly LLM budget remaining fell below {}%",
            alert.threshold_pct
        );
        let html = build_budget_alert_html(month_label, alert);
        self.post(to, &subject, &html).await
    }
}

/// `Name <addr>` unless the address already carries a display name.
pub fn formatted_from(addr: &str, name: &str) -> String {
    let addr = addr.trim();
    if addr.contains('<') && addr.contains('>') {
        return addr.to_string();
    }
    let name = match name.trim() {
        "" => DEFAULT_FROM_NAME,
        n => n,
    };
    format!("{} <{}>", name, addr)
}

pub fn digest_subject(digest_date: &str, composed: Option<&str>) -> String {
    match composed.map(str::trim) {
        Some(subject) if !subject.is_empty() => subject.to_string(),
        _ => format!("Sifto Digest - {}", digest_date),
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Composed body as paragraphs, followed by one card per digest item.
pub fn build_digest_html(digest: &DigestDetail, body: Option<&str>) -> String {
    let mut html = String::from(
        r#"<!DOCTYPE html><html><body style="font-family:sans-serif;max-width:640px;margin:0 auto;padding:20px">"#,
    );
    let _ = write!(
        html,
        r#"<h1 style="font-size:24px;border-bottom:2px solid #eee;padding-bottom:8px">Sifto Digest - {}</h1>"#,
        escape_html(&digest.digest.digest_date)
    );

    if let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) {
        for para in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            let lines: Vec<&str> = para.lines().collect();
            if lines.len() > 1 {
                html.push_str(r#"<div style="margin:12px 0 18px;color:#333;line-height:1.6">"#);
                for line in lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
                    let _ = write!(html, r#"<p style="margin:0 0 6px">{}</p>"#, escape_html(line));
                }
                html.push_str("</div>");
            } else {
                let _ = write!(
                    html,
                    r#"<p style="margin:12px 0 18px;color:#333;line-height:1.7">{}</p>"#,
                    escape_html(para)
                );
            }
        }
    }

    for detail in &digest.items {
        let title = detail.item.title.as_deref().unwrap_or("(untitled)");
        let topics = escape_html(&detail.summary.topics.join(" · "));
        let _ = write!(
            html,
            r#"
<div style="margin-bottom:24px;padding:16px;border:1px solid #eee;border-radius:8px">
  <p style="margin:0 0 4px;font-size:12px;color:#888">#{} &nbsp;·&nbsp; {}</p>
  <h2 style="margin:0 0 8px;font-size:18px">
    <a href="{}" style="color:#1a1a1a;text-decoration:none">{}</a>
  </h2>
  <p style="margin:0 0 8px;color:#444;line-height:1.6">{}</p>
</div>"#,
            detail.rank,
            topics,
            escape_html(&detail.item.url),
            escape_html(title),
            escape_html(&detail.summary.summary)
        );
    }

    html.push_str("</body></html>");
    html
}

pub fn build_budget_alert_html(month_label: &str, alert: &BudgetAlert) -> String {
    let mut html = String::from(
        r#"<!DOCTYPE html><html><body style="font-family:sans-serif;max-width:640px;margin:0 auto;padding:20px">"#,
    );
    html.push_str(r#"<h1 style="font-size:22px;margin:0 0 12px">Sifto budget alert</h1>"#);
    let _ = write!(
        html,
        r#"<p style="line-height:1.7;color:#333">Your remaining LLM budget for {} fell below <strong>{}%</strong>.</p>"#,
        escape_html(month_label),
        alert.threshold_pct
    );
    html.push_str(
        r#"<div style="border:1px solid #e4e4e7;border-radius:10px;padding:14px 16px;background:#fafafa">"#,
    );
    let _ = write!(
        html,
        r#"<p style="margin:0 0 6px;color:#444">Monthly budget: <strong>${:.4}</strong></p>"#,
        alert.monthly_budget_usd
    );
    let _ = write!(
        html,
        r#"<p style="margin:0 0 6px;color:#444">Used (estimated): <strong>${:.4}</strong></p>"#,
        alert.used_cost_usd
    );
    let _ = write!(
        html,
        r#"<p style="margin:0 0 6px;color:#444">Remaining (estimated): <strong>${:.4}</strong></p>"#,
        alert.remaining_budget_usd
    );
    let _ = write!(
        html,
        r#"<p style="margin:0;color:#444">Remaining ratio: <strong>{:.1}%</strong></p>"#,
        alert.remaining_pct()
    );
    html.push_str("</div></body></html>");
    html
}
