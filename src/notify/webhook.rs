//! Delivery of notifications to a Discord compatible webhook.

use std::thread;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Utc};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{Notifier, NotifyError};
use crate::config::NotificationConfig;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Posts every message as a single embed to a webhook.
///
/// The HTTP client is built once and reused for all messages of a run.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    config: NotificationConfig,
    backoff: Duration,
}

impl WebhookNotifier {
    pub fn new(url: String, config: NotificationConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(NotifyError::Client)?;

        Ok(Self {
            client,
            url,
            config,
            backoff: RETRY_BACKOFF,
        })
    }

    /// Webhook body of `message` sent at `now`.
    fn payload(&self, message: &str, now: DateTime<Utc>) -> Value {
        let NotificationConfig {
            title,
            thumbnail_url,
            banner_url,
            footer,
            color,
            ..
        } = &self.config;

        let mut embed = json!({
            "title": title,
            "description": message,
            "timestamp": now.to_rfc3339(),
        });
        if let Some(color) = color {
            embed["color"] = json!(color);
        }
        if let Some(url) = thumbnail_url {
            embed["thumbnail"] = json!({ "url": url });
        }
        if let Some(url) = banner_url {
            embed["image"] = json!({ "url": url });
        }
        if let Some(footer) = footer {
            let year = now.with_timezone(&Local).year();
            embed["footer"] = json!({ "text": footer.replace("{year}", &year.to_string()) });
        }

        json!({ "embeds": [embed] })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str) -> Result<(), NotifyError> {
        let payload = self.payload(message, Utc::now());
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.client.post(&self.url).json(&payload).send() {
                Ok(res) if res.status().is_success() => {
                    log::trace!(target: "notify::webhook", "Delivered notification on attempt {attempt}");
                    return Ok(());
                }
                Ok(res) if is_permanent(res.status()) => {
                    return Err(NotifyError::Rejected {
                        attempts: attempt,
                        status: res.status(),
                    });
                }
                Ok(res) => NotifyError::Rejected {
                    attempts: attempt,
                    status: res.status(),
                },
                Err(source) => NotifyError::Transport {
                    attempts: attempt,
                    source,
                },
            };

            if attempt >= max_attempts {
                return Err(error);
            }
            log::debug!(target: "notify::webhook", "Notification attempt {attempt}/{max_attempts} failed: {error}");
            thread::sleep(self.backoff * attempt);
        }
    }
}

/// Client errors other than rate limiting won't go away on retry.
fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;

    /// Answers every request with `status` and counts the requests.
    fn serve(status: &'static str) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/webhook", listener.local_addr().unwrap());
        let requests = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        if name.eq_ignore_ascii_case("content-length") {
                            content_length = value.trim().parse().unwrap_or(0);
                        }
                    }
                }
                let mut body = vec![0; content_length];
                let _ = reader.read_exact(&mut body);

                counter.fetch_add(1, Ordering::SeqCst);
                let _ = write!(
                    stream,
                    "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
            }
        });

        (url, requests)
    }

    fn notifier_at(url: String, max_attempts: u32) -> WebhookNotifier {
        let mut notifier = WebhookNotifier::new(
            url,
            NotificationConfig {
                max_attempts,
                timeout_secs: 5,
                ..Default::default()
            },
        )
        .unwrap();
        notifier.backoff = Duration::ZERO;
        notifier
    }

    fn notifier(config: NotificationConfig) -> WebhookNotifier {
        WebhookNotifier::new("http://127.0.0.1:9/webhook".into(), config).unwrap()
    }

    #[test]
    fn payload_contains_branding() {
        let notifier = notifier(NotificationConfig {
            title: "Backup".into(),
            thumbnail_url: Some("https://example.org/logo.png".into()),
            banner_url: Some("https://example.org/banner.png".into()),
            footer: Some("Example © 2022 - {year}".into()),
            color: Some(0xFF5733),
            ..Default::default()
        });
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();

        let payload = notifier.payload("Daily backup finished", now);
        let embed = &payload["embeds"][0];

        assert_eq!(embed["title"], "Backup");
        assert_eq!(embed["description"], "Daily backup finished");
        assert_eq!(embed["timestamp"], "2025-06-15T12:00:00+00:00");
        assert_eq!(embed["color"], 0xFF5733);
        assert_eq!(embed["thumbnail"]["url"], "https://example.org/logo.png");
        assert_eq!(embed["image"]["url"], "https://example.org/banner.png");
        assert_eq!(embed["footer"]["text"], "Example © 2022 - 2025");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let notifier = notifier(NotificationConfig::default());
        let payload = notifier.payload("hello", Utc::now());
        let embed = payload["embeds"][0].as_object().unwrap();

        assert!(!embed.contains_key("color"));
        assert!(!embed.contains_key("thumbnail"));
        assert!(!embed.contains_key("image"));
        assert!(!embed.contains_key("footer"));
    }

    #[test]
    fn delivered_message_is_sent_once() {
        let (url, requests) = serve("204 No Content");

        notifier_at(url, 3).notify("hello").unwrap();
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let (url, requests) = serve("404 Not Found");

        match notifier_at(url, 3).notify("hello") {
            Err(NotifyError::Rejected { attempts, status }) => {
                assert_eq!(attempts, 1);
                assert_eq!(status, StatusCode::NOT_FOUND);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_errors_and_rate_limits_are_retried() {
        for status in ["503 Service Unavailable", "429 Too Many Requests"] {
            let (url, requests) = serve(status);

            match notifier_at(url, 3).notify("hello") {
                Err(NotifyError::Rejected { attempts, .. }) => assert_eq!(attempts, 3),
                other => panic!("expected rejection, got {other:?}"),
            }
            assert_eq!(requests.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn unreachable_endpoint_gives_up_after_max_attempts() {
        let mut notifier = notifier(NotificationConfig {
            max_attempts: 2,
            timeout_secs: 2,
            ..Default::default()
        });
        notifier.backoff = Duration::ZERO;

        match notifier.notify("hello") {
            Err(NotifyError::Transport { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected transport failure, got {other:?}"),
        }
    }
}
