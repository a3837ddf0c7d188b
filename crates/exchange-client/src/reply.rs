//! Reply payload decoding.
//!
//! The exchange answers each request with a standard return document:
//!
//! ```text
//! <StandardRetur>
//!   <StatusKode>20</StatusKode>
//!   <FejlbeskedTekst>optional free text</FejlbeskedTekst>
//! </StandardRetur>
//! ```
//!
//! Elements are matched by local name at any depth.

use exchange_types::ReplyStatus;
use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use thiserror::Error;

/// Reply payload could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyDecodeError {
    #[error("Reply is not well-formed XML: {0}")]
    Xml(String),

    #[error("Reply has no StatusKode")]
    MissingStatus,

    #[error("Invalid StatusKode: {0}")]
    InvalidStatus(String),
}

/// Decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub status: ReplyStatus,
    /// `FejlbeskedTekst`, empty when absent
    pub message: String,
}

/// Decode a reply payload.
pub fn decode(body: &[u8]) -> Result<ReplyOutcome, ReplyDecodeError> {
    let text = std::str::from_utf8(body).map_err(|e| ReplyDecodeError::Xml(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut current: Option<String> = None;
    let mut status: Option<String> = None;
    let mut message = String::new();

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(element)) => {
                current = Some(String::from_utf8_lossy(element.local_name().as_ref()).into_owned());
            }
            Ok(XmlEvent::Text(value)) => {
                let value = value
                    .unescape()
                    .map_err(|e| ReplyDecodeError::Xml(e.to_string()))?;
                match current.as_deref() {
                    Some("StatusKode") => status = Some(value.trim().to_string()),
                    Some("FejlbeskedTekst") => message = value.trim().to_string(),
                    _ => {}
                }
            }
            Ok(XmlEvent::End(_)) => current = None,
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ReplyDecodeError::Xml(e.to_string())),
        }
    }

    let raw = status.ok_or(ReplyDecodeError::MissingStatus)?;
    let code: i64 = raw
        .parse()
        .map_err(|_| ReplyDecodeError::InvalidStatus(raw.clone()))?;

    Ok(ReplyOutcome {
        status: ReplyStatus::from(code),
        message,
    })
}

/// Render a reply document. Used by responders and tests.
pub fn render(status: i64, message: Option<&str>) -> Vec<u8> {
    let mut xml = format!("<StandardRetur><StatusKode>{}</StatusKode>", status);
    if let Some(text) = message {
        xml.push_str("<FejlbeskedTekst>");
        xml.push_str(&escape(text));
        xml.push_str("</FejlbeskedTekst>");
    }
    xml.push_str("</StandardRetur>");
    xml.into_bytes()
}
