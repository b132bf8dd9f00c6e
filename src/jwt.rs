//! Compact JWT decoding
//!
//! Decodes the header and claims of a JWS (or unsecured JWT) in compact
//! serialization. Signatures are **not** verified: the third segment is kept
//! as-is so the caller can check it against the provider's keys.

use crate::error::{OAuthError, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A normalized JSON claim value
///
/// `null` has no representation: null members and array elements are dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Claim {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Claim>),
    Object(BTreeMap<String, Claim>),
}

impl Claim {
    fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Integer(i)),
                None => n.as_f64().map(Self::Float),
            },
            Value::String(s) => Some(Self::String(s)),
            Value::Array(items) => Some(Self::Array(
                items.into_iter().filter_map(Self::from_json).collect(),
            )),
            Value::Object(map) => Some(Self::Object(
                map.into_iter()
                    .filter_map(|(k, v)| Self::from_json(v).map(|claim| (k, claim)))
                    .collect(),
            )),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer value; floats are truncated
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// A string or a list of strings, normalized to a list
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Self::String(s) => Some(vec![s.clone()]),
            Self::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

pub type ClaimMap = BTreeMap<String, Claim>;

/// JOSE header
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JwtHeader {
    pub alg: String,
    pub kid: Option<String>,
    pub typ: Option<String>,
    pub additional: ClaimMap,
}

/// OpenID Connect ID token claims
///
/// Registered claims are lifted into typed fields; a registered claim with an
/// unexpected type stays in `additional_claims` untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IdToken {
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub aud: Option<Vec<String>>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
    pub nonce: Option<String>,
    pub acr: Option<String>,
    pub amr: Option<Vec<String>>,
    pub azp: Option<String>,
    pub additional_claims: ClaimMap,
}

impl IdToken {
    fn from_claims(mut claims: ClaimMap) -> Self {
        Self {
            iss: take(&mut claims, "iss", Claim::as_str_owned),
            sub: take(&mut claims, "sub", Claim::as_str_owned),
            aud: take(&mut claims, "aud", Claim::as_string_list),
            exp: take(&mut claims, "exp", Claim::as_i64),
            iat: take(&mut claims, "iat", Claim::as_i64),
            nonce: take(&mut claims, "nonce", Claim::as_str_owned),
            acr: take(&mut claims, "acr", Claim::as_str_owned),
            amr: take(&mut claims, "amr", Claim::as_string_list),
            azp: take(&mut claims, "azp", Claim::as_str_owned),
            additional_claims: claims,
        }
    }

    /// True when `exp` is set and lies at or before `now` (seconds since epoch)
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }

    /// Look up a non-registered claim
    pub fn claim(&self, name: &str) -> Option<&Claim> {
        self.additional_claims.get(name)
    }
}

impl Claim {
    fn as_str_owned(&self) -> Option<String> {
        self.as_str().map(str::to_string)
    }
}

fn take<T>(claims: &mut ClaimMap, name: &str, convert: impl Fn(&Claim) -> Option<T>) -> Option<T> {
    let value = claims.get(name).and_then(convert);
    if value.is_some() {
        claims.remove(name);
    }
    value
}

/// A decoded, unverified compact JWT
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Jwt {
    pub header: JwtHeader,
    pub payload: IdToken,
    /// Third segment, verbatim; `None` for unsecured tokens
    pub signature: Option<String>,
}

impl Jwt {
    /// Decode a token in compact serialization
    ///
    /// Two segments (unsecured) and three segments (JWS) are accepted. Any
    /// other count, such as the five segments of a JWE, fails with
    /// `UnsupportedFormat`. Decoding failures are reported as
    /// `TechnicalFailure` with the underlying cause attached.
    ///
    /// # Examples
    ///
    /// ```
    /// use einlass::jwt::Jwt;
    ///
    /// let jwt = Jwt::parse("eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiJhYmMifQ.").unwrap();
    /// assert_eq!(jwt.header.alg, "HS256");
    /// assert_eq!(jwt.payload.sub.as_deref(), Some("abc"));
    /// ```
    pub fn parse(token: &str) -> Result<Self> {
        let segments: Vec<&str> = token.split('.').collect();
        if !(2..=3).contains(&segments.len()) {
            return Err(OAuthError::UnsupportedFormat(format!(
                "expected 2 or 3 JWT segments, found {}",
                segments.len()
            )));
        }

        let mut header = decode_segment(segments[0], "header")?;
        let payload = decode_segment(segments[1], "payload")?;

        let alg = take(&mut header, "alg", Claim::as_str_owned).ok_or_else(|| {
            OAuthError::UnsupportedFormat("JWT header has no alg".to_string())
        })?;
        let header = JwtHeader {
            alg,
            kid: take(&mut header, "kid", Claim::as_str_owned),
            typ: take(&mut header, "typ", Claim::as_str_owned),
            additional: header,
        };

        let signature = segments
            .get(2)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        Ok(Self {
            header,
            payload: IdToken::from_claims(payload),
            signature,
        })
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<ClaimMap> {
    let engine = GeneralPurpose::new(
        &alphabet::URL_SAFE,
        NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    let bytes = engine
        .decode(segment)
        .map_err(|e| OAuthError::technical(format!("JWT {} is not base64url", name), e))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| OAuthError::technical(format!("JWT {} is not UTF-8", name), e))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| OAuthError::technical(format!("JWT {} is not JSON", name), e))?;

    match Claim::from_json(value) {
        Some(Claim::Object(map)) => Ok(map),
        _ => Err(OAuthError::UnsupportedFormat(format!(
            "JWT {} is not a JSON object",
            name
        ))),
    }
}
