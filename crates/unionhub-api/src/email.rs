use anyhow::{Result, anyhow};
use serde_json::json;
use tracing::{info, warn};

/// Seam between the reminder scheduler and the mail transport, so the
/// dispatcher can run against a recording mailer in tests.
pub trait BroadcastMailer: Send + Sync {
    fn send_broadcast(
        &self,
        bcc: &[String],
        subject: &str,
        html: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

/// HTTP mail relay client. When unconfigured it logs the intended message and
/// reports success — deliberate mock mode for local development, not a bug.
pub struct Mailer {
    client: reqwest::Client,
    config: Option<MailConfig>,
}

impl Mailer {
    pub fn new(config: Option<MailConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        let api_url = std::env::var("UNIONHUB_MAIL_API_URL").unwrap_or_default();
        let api_key = std::env::var("UNIONHUB_MAIL_API_KEY").unwrap_or_default();
        let from = std::env::var("UNIONHUB_MAIL_FROM")
            .unwrap_or_else(|_| "Union Hub <no-reply@unionhub.local>".into());

        let config = if api_url.is_empty() || api_key.is_empty() {
            warn!("Mail relay not configured; emails will be logged, not sent");
            None
        } else {
            Some(MailConfig {
                api_url,
                api_key,
                from,
            })
        };
        Self::new(config)
    }

    pub async fn send_otp(&self, to: &str, otp: &str) -> Result<()> {
        let Some(config) = &self.config else {
            info!("[MOCK EMAIL] To: {}, OTP: {}", to, otp);
            return Ok(());
        };

        self.post(
            config,
            json!({
                "from": config.from,
                "to": [to],
                "subject": "Password Reset OTP - Union Hub",
                "text": format!("Your OTP for password reset is: {otp}. It expires in 10 minutes."),
                "html": format!(
                    "<p>Your OTP for password reset is: <strong>{otp}</strong></p>\
                     <p>It expires in 10 minutes.</p>"
                ),
            }),
        )
        .await
    }

    async fn post(&self, config: &MailConfig, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&config.api_url)
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Mail relay returned {}", response.status()));
        }
        Ok(())
    }
}

impl BroadcastMailer for Mailer {
    /// BCC so recipients stay hidden from each other.
    async fn send_broadcast(&self, bcc: &[String], subject: &str, html: &str) -> Result<()> {
        let Some(config) = &self.config else {
            info!(
                "[MOCK EMAIL] Bcc: {} recipients, Subject: {}",
                bcc.len(),
                subject
            );
            return Ok(());
        };

        self.post(
            config,
            json!({
                "from": config.from,
                "to": [config.from],
                "bcc": bcc,
                "subject": subject,
                "html": html,
            }),
        )
        .await
    }
}
