//! Turn recipients into rendered outgoing messages.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::delivery::{dedup_key, OutgoingMessage};
use crate::recipients::{is_valid_email, Recipient};
use crate::template::{TemplateError, TemplateRenderer};

/// Why a recipient produced no message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeFailureReason {
    /// The address is not syntactically valid.
    #[error("invalid email address")]
    InvalidAddress,

    /// The address already appeared earlier in the list.
    #[error("duplicate recipient")]
    Duplicate,

    /// Rendering failed for this recipient's context.
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// A recipient that was dropped during composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeFailure {
    /// Recipient address as given.
    pub email: String,
    /// What went wrong.
    pub reason: ComposeFailureReason,
}

/// Messages ready to send plus the recipients that were dropped.
#[derive(Debug, Clone, Default)]
pub struct Composition {
    /// Rendered messages, in recipient order.
    pub messages: Vec<OutgoingMessage>,
    /// Recipients that produced no message.
    pub failures: Vec<ComposeFailure>,
}

/// Render `template_id` for every recipient of `campaign_id`.
///
/// Failures are collected per recipient instead of aborting, so one bad
/// row never blocks the rest of the list. Addresses that differ only in
/// case are duplicates.
pub fn compose_messages(
    campaign_id: &str,
    recipients: &[Recipient],
    renderer: &dyn TemplateRenderer,
    template_id: &str,
) -> Composition {
    let mut composition = Composition::default();
    let mut seen = HashSet::with_capacity(recipients.len());

    for recipient in recipients {
        let fail = |reason: ComposeFailureReason| ComposeFailure {
            email: recipient.email.clone(),
            reason,
        };
        if !is_valid_email(&recipient.email) {
            composition.failures.push(fail(ComposeFailureReason::InvalidAddress));
            continue;
        }
        if !seen.insert(dedup_key(campaign_id, &recipient.email)) {
            composition.failures.push(fail(ComposeFailureReason::Duplicate));
            continue;
        }
        match renderer.render(template_id, &recipient.context()) {
            Ok(content) => {
                let mut message = OutgoingMessage::new(
                    campaign_id,
                    recipient.email.as_str(),
                    content.subject,
                    content.html_body,
                    content.text_body,
                );
                if let Some(name) = &recipient.name {
                    message = message.with_recipient_name(name.as_str());
                }
                composition.messages.push(message);
            }
            Err(err) => composition.failures.push(fail(err.into())),
        }
    }

    if !composition.failures.is_empty() {
        warn!(
            campaign_id,
            dropped = composition.failures.len(),
            "some recipients could not be composed"
        );
    }
    debug!(campaign_id, messages = composition.messages.len(), "messages composed");
    composition
}
