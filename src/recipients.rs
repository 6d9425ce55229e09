//! Recipient records and the file sources that produce them.
//!
//! Three file shapes are accepted, chosen by extension:
//! - `.csv` / `.tsv`: a header row, delimiter sniffed from it. The email
//!   column is `email` (any case), `e-mail`, or failing that any column whose
//!   name contains "email".
//! - `.jsonl` / `.ndjson`: one JSON object per line.
//! - anything else: a JSON array of objects with an `email` key.
//!
//! In every shape an optional `name` becomes the display name and every
//! other field is kept as a template attribute.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

static EMAIL_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$").ok()
});

/// One addressee of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Email address, trimmed.
    pub email: String,
    /// Display name, if provided.
    #[serde(default)]
    pub name: Option<String>,
    /// Extra values available to templates.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Recipient {
    /// Create a recipient with no name or attributes.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into().trim().to_owned(),
            name: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add one template attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Template context: every attribute plus `email` and `name`.
    pub fn context(&self) -> BTreeMap<String, String> {
        let mut context = self.attributes.clone();
        context.insert("email".to_owned(), self.email.clone());
        context.insert("name".to_owned(), self.name.clone().unwrap_or_default());
        context
    }
}

/// Errors raised while reading a recipient file.
#[derive(Debug, thiserror::Error)]
pub enum RecipientError {
    /// The file could not be read.
    #[error("failed to read recipients from {path}: {source}")]
    Io {
        /// Offending file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The content is not valid JSON.
    #[error("invalid recipient JSON at line {line}: {message}")]
    Json {
        /// 1-based line of the failure (JSON lines) or parser line.
        line: usize,
        /// Parser message.
        message: String,
    },

    /// The document is JSON but not a list of objects.
    #[error("recipient file must contain a JSON array of objects")]
    NotAList,

    /// A CSV record could not be read.
    #[error("invalid recipient CSV at line {line}: {message}")]
    Csv {
        /// 1-based line of the failure, 0 when unknown.
        line: u64,
        /// Parser message.
        message: String,
    },

    /// The CSV header has no column that could hold addresses.
    #[error("recipient CSV has no email column")]
    NoEmailColumn,
}

/// Whether `address` is syntactically a deliverable email address.
pub fn is_valid_email(address: &str) -> bool {
    let address = address.trim();
    if address.len() > 254 {
        return false;
    }
    EMAIL_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(address))
}

/// Load recipients from a CSV, JSON or JSON-lines file.
///
/// Records without a usable email are skipped with a warning; address
/// syntax is checked later, when messages are composed.
///
/// # Errors
///
/// Returns [`RecipientError`] when the file cannot be read or parsed.
pub fn load_recipients(path: &Path) -> Result<Vec<Recipient>, RecipientError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RecipientError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let recipients = match extension.as_str() {
        "csv" | "tsv" => parse_csv(&contents)?,
        "jsonl" | "ndjson" => parse_json_lines(&contents)?,
        _ => parse_json_array(&contents)?,
    };
    debug!(path = %path.display(), count = recipients.len(), "loaded recipients");
    Ok(recipients)
}

/// Parse a JSON array of recipient objects.
///
/// # Errors
///
/// Returns [`RecipientError::Json`] on malformed JSON and
/// [`RecipientError::NotAList`] when the root is not an array.
pub fn parse_json_array(contents: &str) -> Result<Vec<Recipient>, RecipientError> {
    let value: Value = serde_json::from_str(contents).map_err(|e| RecipientError::Json {
        line: e.line(),
        message: e.to_string(),
    })?;
    let Value::Array(items) = value else {
        return Err(RecipientError::NotAList);
    };
    Ok(items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| record_from_value(item, index.saturating_add(1)))
        .collect())
}

/// Parse newline-delimited JSON objects. Blank lines are ignored.
///
/// # Errors
///
/// Returns [`RecipientError::Json`] naming the first malformed line.
pub fn parse_json_lines(contents: &str) -> Result<Vec<Recipient>, RecipientError> {
    let mut recipients = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line_no = index.saturating_add(1);
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| RecipientError::Json {
            line: line_no,
            message: e.to_string(),
        })?;
        if let Some(recipient) = record_from_value(&value, line_no) {
            recipients.push(recipient);
        }
    }
    Ok(recipients)
}

/// Delimiters tried when sniffing a CSV header, in order of preference.
const CSV_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Parse CSV with a header row.
///
/// # Errors
///
/// Returns [`RecipientError::NoEmailColumn`] when no header looks like an
/// address column and [`RecipientError::Csv`] on malformed records.
pub fn parse_csv(contents: &str) -> Result<Vec<Recipient>, RecipientError> {
    let contents = contents.trim_start_matches('\u{feff}');
    let delimiter = sniff_delimiter(contents.lines().next().unwrap_or_default());
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let headers = reader.headers().map_err(csv_error)?.clone();
    let email_columns = email_columns(&headers);
    if email_columns.is_empty() {
        return Err(RecipientError::NoEmailColumn);
    }

    let mut recipients = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map_or(0, csv::Position::line);
        let email_column = email_columns
            .iter()
            .copied()
            .find(|&column| record.get(column).is_some_and(|value| !value.is_empty()));
        let Some(email_column) = email_column else {
            warn!(line, "skipping recipient row without email");
            continue;
        };

        let mut recipient = Recipient::new(record.get(email_column).unwrap_or_default());
        for (column, (header, value)) in headers.iter().zip(record.iter()).enumerate() {
            if column == email_column || header.eq_ignore_ascii_case("email") {
                continue;
            }
            if header.eq_ignore_ascii_case("name") {
                recipient.name = Some(value.to_owned()).filter(|name| !name.is_empty());
            } else {
                recipient
                    .attributes
                    .insert(header.to_owned(), value.to_owned());
            }
        }
        recipients.push(recipient);
    }
    Ok(recipients)
}

/// Pick the candidate delimiter that splits the header into the most fields.
fn sniff_delimiter(header: &str) -> u8 {
    CSV_DELIMITERS
        .iter()
        .copied()
        .max_by_key(|&delimiter| {
            let count = header.bytes().filter(|&byte| byte == delimiter).count();
            // Ties go to the earlier delimiter.
            (count, std::cmp::Reverse(CSV_DELIMITERS.iter().position(|&d| d == delimiter)))
        })
        .unwrap_or(b',')
}

/// Address columns in lookup order: exact names first, then any header
/// mentioning "email".
fn email_columns(headers: &csv::StringRecord) -> Vec<usize> {
    let is_exact = |header: &str| {
        header.eq_ignore_ascii_case("email") || header.eq_ignore_ascii_case("e-mail")
    };
    let exact = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| is_exact(header))
        .map(|(column, _)| column);
    let loose = headers
        .iter()
        .enumerate()
        .filter(|(_, header)| !is_exact(header) && header.to_ascii_lowercase().contains("email"))
        .map(|(column, _)| column);
    exact.chain(loose).collect()
}

fn csv_error(err: csv::Error) -> RecipientError {
    RecipientError::Csv {
        line: err.position().map_or(0, csv::Position::line),
        message: err.to_string(),
    }
}

fn record_from_value(value: &Value, position: usize) -> Option<Recipient> {
    let Value::Object(fields) = value else {
        warn!(position, "skipping recipient entry that is not an object");
        return None;
    };
    let email = fields
        .get("email")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|email| !email.is_empty());
    let Some(email) = email else {
        warn!(position, "skipping recipient entry without email");
        return None;
    };

    let mut recipient = Recipient::new(email);
    for (key, value) in fields {
        match key.as_str() {
            "email" => {}
            "name" => {
                recipient.name = Some(scalar_to_string(value)).filter(|name| !name.is_empty());
            }
            _ => {
                recipient
                    .attributes
                    .insert(key.clone(), scalar_to_string(value));
            }
        }
    }
    Some(recipient)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
