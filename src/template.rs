//! Template rendering for campaign content.
//!
//! Templates use `{{ variable }}` placeholders. Values interpolated into the
//! HTML body are HTML-escaped; subject and text bodies receive them verbatim.
//! A template without a text body gets one derived from the rendered HTML.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use regex::Regex;

/// Rendered subject and bodies for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    /// Subject line.
    pub subject: String,
    /// HTML body.
    pub html_body: String,
    /// Plain-text body.
    pub text_body: String,
}

/// Rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// No template registered under the id.
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// A placeholder names a variable the context lacks.
    #[error("missing template variable: {0}")]
    MissingVariable(String),

    /// Placeholder syntax is broken (e.g. unclosed `{{`).
    #[error("malformed template: {0}")]
    Malformed(String),
}

/// Renders a template for one recipient context.
pub trait TemplateRenderer: Send + Sync {
    /// Render `template_id` with `context`.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] on unknown templates, missing variables, or
    /// malformed placeholders.
    fn render(
        &self,
        template_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<RenderedContent, TemplateError>;
}

/// Source text of one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    /// Subject template.
    pub subject: String,
    /// HTML body template.
    pub html: String,
    /// Text body template; derived from the HTML when absent.
    pub text: Option<String>,
}

impl MessageTemplate {
    /// Template with an HTML body only.
    pub fn from_html(subject: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            html: html.into(),
            text: None,
        }
    }

    /// Read an HTML body template from disk.
    pub fn load(subject: impl Into<String>, html_path: &Path) -> anyhow::Result<Self> {
        let html = std::fs::read_to_string(html_path)
            .with_context(|| format!("failed to read template {}", html_path.display()))?;
        Ok(Self::from_html(subject, html))
    }

    /// Attach an explicit text body template.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// `{{ placeholder }}` renderer over a set of registered templates.
#[derive(Debug, Clone)]
pub struct PlaceholderRenderer {
    templates: HashMap<String, MessageTemplate>,
    tag_pattern: Option<Regex>,
}

impl Default for PlaceholderRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderRenderer {
    /// Create a renderer with no templates.
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
            tag_pattern: Regex::new(r"(?s)<[^>]*>").ok(),
        }
    }

    /// Register `template` under `id`, replacing any previous one.
    pub fn register(&mut self, id: impl Into<String>, template: MessageTemplate) {
        self.templates.insert(id.into(), template);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_template(mut self, id: impl Into<String>, template: MessageTemplate) -> Self {
        self.register(id, template);
        self
    }

    fn html_to_text(&self, html: &str) -> String {
        let stripped = match &self.tag_pattern {
            Some(pattern) => pattern.replace_all(html, "\n").into_owned(),
            None => html.to_owned(),
        };
        let text = unescape_html(&stripped);
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl TemplateRenderer for PlaceholderRenderer {
    fn render(
        &self,
        template_id: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<RenderedContent, TemplateError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| TemplateError::UnknownTemplate(template_id.to_owned()))?;

        let subject = substitute(&template.subject, context, false)?;
        let html_body = substitute(&template.html, context, true)?;
        let text_body = match &template.text {
            Some(text) => substitute(text, context, false)?,
            None => self.html_to_text(&html_body),
        };
        Ok(RenderedContent {
            subject: subject.trim().to_owned(),
            html_body,
            text_body,
        })
    }
}

/// Replace every `{{ name }}` in `source` with its context value.
fn substitute(
    source: &str,
    context: &BTreeMap<String, String>,
    escape: bool,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open.saturating_add(2)..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| TemplateError::Malformed("unclosed '{{'".to_owned()))?;
        let name = after_open[..close].trim();
        if name.is_empty() || name.contains("{{") {
            return Err(TemplateError::Malformed(format!(
                "invalid placeholder '{{{{{}}}}}'",
                &after_open[..close]
            )));
        }
        let value = context
            .get(name)
            .ok_or_else(|| TemplateError::MissingVariable(name.to_owned()))?;
        if escape {
            out.push_str(&escape_html(value));
        } else {
            out.push_str(value);
        }
        rest = &after_open[close.saturating_add(2)..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Escape the five HTML-significant characters.
pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_html(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}
