//! Status messages sent to an external channel.
//!
//! Delivery is best-effort: callers log a failed [Notifier::notify] and carry on.

use derive_more::{Display, Error};

mod webhook;

pub use webhook::WebhookNotifier;

/// Errors on delivering a notification.
#[derive(Debug, Display, Error)]
pub enum NotifyError {
    /// The HTTP client couldn't be built.
    #[display("Building the HTTP client failed: {_0}")]
    Client(reqwest::Error),
    /// Every delivery attempt failed to reach the endpoint.
    #[display("Delivery failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        source: reqwest::Error,
    },
    /// The endpoint answered every attempt with an error status.
    #[display("Endpoint rejected the message after {attempts} attempt(s) with {status}")]
    Rejected {
        attempts: u32,
        status: reqwest::StatusCode,
    },
}

/// Channel receiving status messages.
pub trait Notifier {
    /// Delivers `message`, blocking until it is sent or delivery gave up.
    fn notify(&self, message: &str) -> Result<(), NotifyError>;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn notify(&self, message: &str) -> Result<(), NotifyError> {
        (**self).notify(message)
    }
}

/// Notifier used when notifications are turned off. Messages only end up in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

impl Notifier for DisabledNotifier {
    fn notify(&self, message: &str) -> Result<(), NotifyError> {
        log::debug!(target: "notify", "Notification (disabled): {message}");
        Ok(())
    }
}
