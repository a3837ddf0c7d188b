//! # Token Issuer
//!
//! Outbound port to the security token service, and the REST adapter that
//! speaks its WS-Trust issue endpoint.

use crate::token::Token;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// WS-Trust request type for issuing a token.
pub const WS_TRUST_ISSUE: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/Issue";

/// Key type binding the token to the presented public key.
pub const PUBLIC_KEY_TYPE: &str = "http://docs.oasis-open.org/ws-sx/ws-trust/200512/PublicKey";

/// Requested token type.
pub const SAML_TOKEN_V20: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-saml-token-profile-1.1#SAMLV2.0";

/// Path of the issue endpoint relative to the service base URL.
pub const ISSUE_PATH: &str = "/api/rest/wstrust/v1/issue";

/// Errors acquiring a token from the issuer.
///
/// Cloneable so that every caller waiting on one shared fetch receives it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenAcquisitionError {
    /// The issuer could not be reached.
    #[error("Token service unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// The issuer refused the request.
    #[error("Token service rejected request (status {status}): {detail}")]
    Rejected { status: u16, detail: String },

    /// The issuer answered with something that is not a token.
    #[error("Invalid token service response: {0}")]
    InvalidResponse(String),
}

/// Proof-of-possession material presented to the issuer.
///
/// Holds the base64 X.509 certificate matching the client's TLS key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(certificate: impl Into<String>) -> Self {
        Self(certificate.into())
    }

    pub fn certificate(&self) -> &str {
        &self.0
    }
}

/// One issue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// Requester's business identifier.
    pub principal: String,
    /// Certificate the token is bound to.
    pub credential: Credential,
    /// Entity id of the target service.
    pub resource: String,
}

/// Port: issue bearer tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for the request. Never retried by the caller.
    async fn issue(&self, request: TokenRequest) -> Result<Token, TokenAcquisitionError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RequestSecurityToken<'a> {
    request_type: &'a str,
    applies_to: AppliesTo<'a>,
    token_type: &'a str,
    key_type: &'a str,
    anvenderkontekst: Anvenderkontekst<'a>,
    use_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AppliesTo<'a> {
    endpoint_reference: EndpointReference<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointReference<'a> {
    address: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Anvenderkontekst<'a> {
    cvr: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestSecurityTokenResponse {
    requested_security_token: RequestedSecurityToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RequestedSecurityToken {
    assertion: String,
}

/// Token issuer backed by the token service's REST API.
pub struct RestTokenIssuer {
    client: Client,
    base_url: String,
}

impl RestTokenIssuer {
    /// Create an issuer for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TokenAcquisitionError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| TokenAcquisitionError::Unreachable {
                endpoint: base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self::with_client(client, base_url))
    }

    /// Create an issuer using a preconfigured client (client TLS identity etc.).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Full URL of the issue endpoint.
    pub fn issue_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), ISSUE_PATH)
    }
}

#[async_trait]
impl TokenIssuer for RestTokenIssuer {
    async fn issue(&self, request: TokenRequest) -> Result<Token, TokenAcquisitionError> {
        let url = self.issue_url();
        info!(endpoint = %url, principal = %request.principal, resource = %request.resource, "Requesting token");

        let body = RequestSecurityToken {
            request_type: WS_TRUST_ISSUE,
            applies_to: AppliesTo {
                endpoint_reference: EndpointReference {
                    address: &request.resource,
                },
            },
            token_type: SAML_TOKEN_V20,
            key_type: PUBLIC_KEY_TYPE,
            anvenderkontekst: Anvenderkontekst {
                cvr: &request.principal,
            },
            use_key: request.credential.certificate(),
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TokenAcquisitionError::Unreachable {
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TokenAcquisitionError::Rejected {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed: RequestSecurityTokenResponse = response
            .json()
            .await
            .map_err(|e| TokenAcquisitionError::InvalidResponse(e.to_string()))?;

        let assertion = parsed.requested_security_token.assertion;
        if assertion.trim().is_empty() {
            return Err(TokenAcquisitionError::InvalidResponse(
                "empty assertion".to_string(),
            ));
        }

        debug!(principal = %request.principal, "Token received");
        Ok(Token::new(assertion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_request_wire_shape() {
        let body = RequestSecurityToken {
            request_type: WS_TRUST_ISSUE,
            applies_to: AppliesTo {
                endpoint_reference: EndpointReference {
                    address: "http://service/entity",
                },
            },
            token_type: SAML_TOKEN_V20,
            key_type: PUBLIC_KEY_TYPE,
            anvenderkontekst: Anvenderkontekst { cvr: "29189846" },
            use_key: "MIIC...",
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["RequestType"], WS_TRUST_ISSUE);
        assert_eq!(
            json["AppliesTo"]["EndpointReference"]["Address"],
            "http://service/entity"
        );
        assert_eq!(json["Anvenderkontekst"]["Cvr"], "29189846");
        assert_eq!(json["UseKey"], "MIIC...");
    }

    #[test]
    fn test_issue_response_parses() {
        let raw = r#"{"RequestedSecurityToken":{"Assertion":"PEFzc2VydGlvbi8+"}}"#;
        let parsed: RequestSecurityTokenResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.requested_security_token.assertion, "PEFzc2VydGlvbi8+");
    }

    #[test]
    fn test_issue_url_joins_base() {
        let issuer = RestTokenIssuer::with_client(Client::new(), "https://sts.example/");
        assert_eq!(
            issuer.issue_url(),
            "https://sts.example/api/rest/wstrust/v1/issue"
        );
    }
}
