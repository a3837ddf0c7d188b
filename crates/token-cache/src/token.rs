//! # Bearer Tokens
//!
//! A token travels base64-encoded. Decoding yields a SAML-style assertion
//! from which the principal, the resource, the validity window and the
//! privileges attribute are extracted by path:
//!
//! ```text
//! Assertion/Subject/NameID                              -> principal
//! Assertion/Conditions@NotBefore, @NotOnOrAfter         -> validity window
//! Assertion/Conditions/AudienceRestriction/Audience     -> resource
//! Assertion/AttributeStatement/Attribute[@Name=PRIV]/AttributeValue
//!                                                       -> privileges (base64)
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;
use std::fmt;
use thiserror::Error;

/// Name of the attribute carrying the base64-encoded privilege list.
pub const PRIVILEGES_ATTRIBUTE: &str = "dk:gov:saml:attribute:Privileges_intermediate";

/// Errors decoding a token into its assertion.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenDecodeError {
    /// The transport encoding is not valid base64.
    #[error("Token is not valid base64: {0}")]
    Base64(String),

    /// The decoded bytes are not UTF-8 text.
    #[error("Decoded token is not UTF-8")]
    NotUtf8,

    /// The decoded text is not well-formed XML.
    #[error("Malformed assertion XML: {0}")]
    Xml(String),

    /// A validity timestamp could not be parsed.
    #[error("Invalid {field} timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    /// The assertion has no NotOnOrAfter condition.
    #[error("Assertion has no validity window")]
    MissingValidity,

    /// The assertion has no privileges attribute.
    #[error("Assertion has no privileges attribute")]
    MissingPrivileges,
}

/// Opaque signed credential in its base64 transport encoding.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Wrap an encoded token as returned by the issuer.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode an assertion document into a token.
    pub fn from_assertion_xml(xml: &str) -> Self {
        Self(STANDARD.encode(xml.as_bytes()))
    }

    /// The base64 transport form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The decoded assertion text, as presented to the broker.
    pub fn decoded(&self) -> Result<String, TokenDecodeError> {
        let bytes = STANDARD
            .decode(self.0.trim())
            .map_err(|e| TokenDecodeError::Base64(e.to_string()))?;
        String::from_utf8(bytes).map_err(|_| TokenDecodeError::NotUtf8)
    }

    /// Decode and parse the assertion.
    pub fn assertion(&self) -> Result<Assertion, TokenDecodeError> {
        Assertion::parse(&self.decoded()?)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are credentials; never print them.
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

/// Fields extracted from a decoded assertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assertion {
    /// Subject name id.
    pub principal: Option<String>,
    /// Audience the token is scoped to.
    pub resource: Option<String>,
    /// Start of the validity window.
    pub not_before: Option<DateTime<Utc>>,
    /// End of the validity window (exclusive).
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// Raw base64 value of the privileges attribute.
    pub privileges: Option<String>,
}

impl Assertion {
    /// Parse an assertion document.
    ///
    /// Namespace prefixes are ignored; elements are matched by local name.
    pub fn parse(xml: &str) -> Result<Self, TokenDecodeError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut assertion = Assertion::default();
        let mut path: Vec<String> = Vec::new();
        let mut in_privileges = false;

        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(element)) => {
                    let name = local_name(&element);
                    assertion.visit_element(&name, &element, &mut in_privileges)?;
                    path.push(name);
                }
                Ok(XmlEvent::Empty(element)) => {
                    let name = local_name(&element);
                    let mut ignored = false;
                    assertion.visit_element(&name, &element, &mut ignored)?;
                }
                Ok(XmlEvent::Text(text)) => {
                    let value = text
                        .unescape()
                        .map_err(|e| TokenDecodeError::Xml(e.to_string()))?
                        .into_owned();
                    assertion.visit_text(&path, value, in_privileges);
                }
                Ok(XmlEvent::End(_)) => {
                    if path.pop().as_deref() == Some("Attribute") {
                        in_privileges = false;
                    }
                }
                Ok(XmlEvent::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(TokenDecodeError::Xml(e.to_string())),
            }
        }

        Ok(assertion)
    }

    fn visit_element(
        &mut self,
        name: &str,
        element: &BytesStart<'_>,
        in_privileges: &mut bool,
    ) -> Result<(), TokenDecodeError> {
        match name {
            "Conditions" => {
                if let Some(raw) = attribute(element, "NotBefore")? {
                    self.not_before = Some(parse_instant("NotBefore", &raw)?);
                }
                if let Some(raw) = attribute(element, "NotOnOrAfter")? {
                    self.not_on_or_after = Some(parse_instant("NotOnOrAfter", &raw)?);
                }
            }
            "Attribute" => {
                *in_privileges =
                    attribute(element, "Name")?.as_deref() == Some(PRIVILEGES_ATTRIBUTE);
            }
            _ => {}
        }
        Ok(())
    }

    fn visit_text(&mut self, path: &[String], value: String, in_privileges: bool) {
        let parent = path.len().checked_sub(2).and_then(|i| path.get(i));
        match path.last().map(String::as_str) {
            Some("NameID") if parent.map(String::as_str) == Some("Subject") => {
                self.principal = Some(value);
            }
            Some("Audience") => self.resource = Some(value),
            Some("AttributeValue") if in_privileges => self.privileges = Some(value),
            _ => {}
        }
    }
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn attribute(element: &BytesStart<'_>, wanted: &str) -> Result<Option<String>, TokenDecodeError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| TokenDecodeError::Xml(e.to_string()))?;
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| TokenDecodeError::Xml(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn parse_instant(field: &'static str, raw: &str) -> Result<DateTime<Utc>, TokenDecodeError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| TokenDecodeError::InvalidTimestamp {
            field,
            value: raw.to_string(),
        })
}

/// Whether `token` is expired at `now`.
///
/// Expired means `now >= NotOnOrAfter`. A token without a NotOnOrAfter
/// condition cannot be judged and yields `MissingValidity`.
pub fn is_expired(token: &Token, now: DateTime<Utc>) -> Result<bool, TokenDecodeError> {
    let expires_at = token
        .assertion()?
        .not_on_or_after
        .ok_or(TokenDecodeError::MissingValidity)?;
    Ok(now >= expires_at)
}

/// Decoded privilege list carried by `token`.
pub fn privileges(token: &Token) -> Result<String, TokenDecodeError> {
    let encoded = token
        .assertion()?
        .privileges
        .ok_or(TokenDecodeError::MissingPrivileges)?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| TokenDecodeError::Base64(e.to_string()))?;
    String::from_utf8(bytes).map_err(|_| TokenDecodeError::NotUtf8)
}

/// Build a minimal assertion document.
///
/// Used by issuers that mint tokens locally and by tests.
pub fn assertion_xml(
    principal: &str,
    resource: &str,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    privileges_xml: &str,
) -> String {
    format!(
        concat!(
            r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">"#,
            r#"<saml:Subject><saml:NameID>{principal}</saml:NameID></saml:Subject>"#,
            r#"<saml:Conditions NotBefore="{nb}" NotOnOrAfter="{na}">"#,
            r#"<saml:AudienceRestriction><saml:Audience>{resource}</saml:Audience></saml:AudienceRestriction>"#,
            r#"</saml:Conditions>"#,
            r#"<saml:AttributeStatement><saml:Attribute Name="{attr}">"#,
            r#"<saml:AttributeValue>{privileges}</saml:AttributeValue>"#,
            r#"</saml:Attribute></saml:AttributeStatement>"#,
            r#"</saml:Assertion>"#
        ),
        principal = principal,
        resource = resource,
        nb = not_before.to_rfc3339(),
        na = not_on_or_after.to_rfc3339(),
        attr = PRIVILEGES_ATTRIBUTE,
        privileges = STANDARD.encode(privileges_xml.as_bytes()),
    )
}
