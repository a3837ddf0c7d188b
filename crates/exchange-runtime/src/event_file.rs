//! Event documents read from disk.
//!
//! The business message id is taken from `BeskedId/UUIDIdentifikator`.
//! Namespace prefixes are ignored.

use exchange_types::Event;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventFileError {
    #[error("Cannot read event file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Event file {path} is not well formed: {reason}")]
    Xml { path: PathBuf, reason: String },

    #[error("Event file {0} carries no BeskedId")]
    MissingMessageId(PathBuf),
}

/// Load the event at `path`.
pub async fn load_event(path: &Path) -> Result<Event, EventFileError> {
    let payload = tokio::fs::read(path)
        .await
        .map_err(|source| EventFileError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let message_id = message_id(&payload)
        .map_err(|reason| EventFileError::Xml {
            path: path.to_path_buf(),
            reason,
        })?
        .ok_or_else(|| EventFileError::MissingMessageId(path.to_path_buf()))?;

    Ok(Event::new(message_id, payload))
}

/// First `UUIDIdentifikator` directly under a `BeskedId` element.
pub fn message_id(payload: &[u8]) -> Result<Option<String>, String> {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().trim_text(true);

    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(element)) => path.push(element.local_name().as_ref().to_vec()),
            Ok(XmlEvent::End(_)) => {
                path.pop();
            }
            Ok(XmlEvent::Text(text)) => {
                let in_id = path.len() >= 2
                    && path[path.len() - 1] == b"UUIDIdentifikator"
                    && path[path.len() - 2] == b"BeskedId";
                if in_id {
                    let id = text.unescape().map_err(|e| e.to_string())?;
                    let id = id.trim();
                    if !id.is_empty() {
                        return Ok(Some(id.to_string()));
                    }
                }
            }
            Ok(XmlEvent::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
        buf.clear();
    }
}
