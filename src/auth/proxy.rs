//! Signed proxy auth context.
//!
//! A trusted gateway terminates public auth and injects a signed context:
//! `X-BH-Auth: v2:{project_id}:{ptype}:{principal_id}:{actor_id}:{hex_hmac}`
//! plus mirror headers. The mirror headers are untrusted input; only a
//! context whose HMAC verifies is honoured.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, Result};

pub const INTERNAL_AUTH_HEADER: &str = "x-bh-auth";
pub const INTERNAL_PROJECT_HEADER: &str = "x-project-id";
pub const INTERNAL_USER_HEADER: &str = "x-user-id";
pub const INTERNAL_API_KEY_HEADER: &str = "x-api-key";
pub const INTERNAL_ACTOR_HEADER: &str = "x-aweb-actor-id";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalType {
    User,
    ApiKey,
    PublicReader,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "u",
            PrincipalType::ApiKey => "k",
            PrincipalType::PublicReader => "p",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub project_id: String,
    pub principal_type: PrincipalType,
    pub principal_id: String,
    pub actor_id: String,
}

pub fn sign_context(
    secret: &str,
    project_id: &str,
    principal_type: PrincipalType,
    principal_id: &str,
    actor_id: &str,
) -> String {
    let msg = format!(
        "v2:{project_id}:{}:{principal_id}:{actor_id}",
        principal_type.as_str()
    );
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(msg.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut sig = String::with_capacity(digest.len() * 2);
    for byte in digest {
        sig.push_str(&format!("{byte:02x}"));
    }
    format!("{msg}:{sig}")
}

fn valid_uuid(raw: &str) -> Result<String> {
    Uuid::parse_str(raw.trim())
        .map(|u| u.to_string())
        .map_err(|_| Error::Unauthenticated)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse and verify the proxy-injected auth context.
///
/// Returns `Ok(None)` when the header is absent, or when it is present but
/// no secret is configured (standalone deployments ignore client-supplied
/// internal headers instead of failing). Any malformed or unverifiable
/// context is `unauthenticated`.
pub fn parse_proxy_context(
    headers: &HeaderMap,
    secret: Option<&str>,
) -> Result<Option<ProxyContext>> {
    let Some(signed) = header(headers, INTERNAL_AUTH_HEADER) else {
        return Ok(None);
    };
    let Some(secret) = secret else {
        tracing::warn!("Ignoring {INTERNAL_AUTH_HEADER} header: no internal auth secret configured");
        return Ok(None);
    };

    let project_id = header(headers, INTERNAL_PROJECT_HEADER)
        .ok_or(Error::Unauthenticated)
        .and_then(valid_uuid)?;

    let (principal_type, principal_id) =
        if let Some(user_id) = header(headers, INTERNAL_USER_HEADER) {
            (PrincipalType::User, valid_uuid(user_id)?)
        } else if let Some(api_key_id) = header(headers, INTERNAL_API_KEY_HEADER) {
            (PrincipalType::ApiKey, valid_uuid(api_key_id)?)
        } else {
            // Public readers carry no principal header; the signed string
            // itself names the "p" principal.
            (PrincipalType::PublicReader, String::new())
        };

    let actor_id = header(headers, INTERNAL_ACTOR_HEADER)
        .ok_or(Error::Unauthenticated)
        .and_then(valid_uuid)?;

    // Public-reader contexts sign with the actor id as principal id.
    let (principal_type, principal_id) = match principal_type {
        PrincipalType::PublicReader => (PrincipalType::PublicReader, actor_id.clone()),
        other => (other, principal_id),
    };

    let expected = sign_context(secret, &project_id, principal_type, &principal_id, &actor_id);
    if !constant_time_eq(signed.as_bytes(), expected.as_bytes()) {
        return Err(Error::Unauthenticated);
    }

    Ok(Some(ProxyContext {
        project_id,
        principal_type,
        principal_id,
        actor_id,
    }))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_for(secret: &str, ptype: PrincipalType) -> (HeaderMap, ProxyContext) {
        let project_id = Uuid::new_v4().to_string();
        let principal_id = Uuid::new_v4().to_string();
        let actor_id = Uuid::new_v4().to_string();
        let effective_principal = match ptype {
            PrincipalType::PublicReader => actor_id.clone(),
            _ => principal_id.clone(),
        };
        let signed = sign_context(secret, &project_id, ptype, &effective_principal, &actor_id);

        let mut headers = HeaderMap::new();
        headers.insert(INTERNAL_AUTH_HEADER, HeaderValue::from_str(&signed).unwrap());
        headers.insert(
            INTERNAL_PROJECT_HEADER,
            HeaderValue::from_str(&project_id).unwrap(),
        );
        match ptype {
            PrincipalType::User => {
                headers.insert(
                    INTERNAL_USER_HEADER,
                    HeaderValue::from_str(&principal_id).unwrap(),
                );
            }
            PrincipalType::ApiKey => {
                headers.insert(
                    INTERNAL_API_KEY_HEADER,
                    HeaderValue::from_str(&principal_id).unwrap(),
                );
            }
            PrincipalType::PublicReader => {}
        }
        headers.insert(
            INTERNAL_ACTOR_HEADER,
            HeaderValue::from_str(&actor_id).unwrap(),
        );

        (
            headers,
            ProxyContext {
                project_id,
                principal_type: ptype,
                principal_id: effective_principal,
                actor_id,
            },
        )
    }

    #[test]
    fn valid_context_verifies() {
        let (headers, expected) = headers_for("shh", PrincipalType::ApiKey);
        let ctx = parse_proxy_context(&headers, Some("shh")).unwrap().unwrap();
        assert_eq!(ctx.project_id, expected.project_id);
        assert_eq!(ctx.principal_type, PrincipalType::ApiKey);
        assert_eq!(ctx.actor_id, expected.actor_id);
    }

    #[test]
    fn public_reader_context_verifies() {
        let (headers, _) = headers_for("shh", PrincipalType::PublicReader);
        let ctx = parse_proxy_context(&headers, Some("shh")).unwrap().unwrap();
        assert_eq!(ctx.principal_type, PrincipalType::PublicReader);
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let (mut headers, _) = headers_for("shh", PrincipalType::User);
        headers.insert(
            INTERNAL_PROJECT_HEADER,
            HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
        );
        assert!(matches!(
            parse_proxy_context(&headers, Some("shh")),
            Err(Error::Unauthenticated)
        ));
    }

    #[test]
    fn ignored_without_secret() {
        let (headers, _) = headers_for("shh", PrincipalType::User);
        assert!(parse_proxy_context(&headers, None).unwrap().is_none());
    }

    #[test]
    fn absent_header_is_none() {
        let headers = HeaderMap::new();
        assert!(parse_proxy_context(&headers, Some("shh")).unwrap().is_none());
    }
}
