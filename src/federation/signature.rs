//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outgoing requests always sign `(request-target) date host content-type`,
//! plus `digest` when a body is present. Missing headers are synthesized
//! before signing so the signed set is complete. Verification rebuilds the
//! signing string from the headers actually received and fails closed.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http::HeaderMap;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use super::actor::authority;
use super::media_type::ACTIVITY_JSON;
use crate::context::OpContext;
use crate::error::AppError;
use crate::metrics::SIGNATURE_VERIFICATIONS_TOTAL;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Signature algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    #[default]
    RsaSha256,
    RsaSha512,
}

impl SignatureAlgorithm {
    /// Parse an `algorithm` parameter
    ///
    /// `hs2019` leaves the choice to the key; RSA keys are verified as SHA-256.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rsa-sha256" | "hs2019" => Some(Self::RsaSha256),
            "rsa-sha512" => Some(Self::RsaSha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RsaSha256 => "rsa-sha256",
            Self::RsaSha512 => "rsa-sha512",
        }
    }
}

/// Signing parameters
#[derive(Debug, Clone, Copy)]
pub struct SignOptions {
    pub algorithm: SignatureAlgorithm,
    /// Advertised lifetime of the signature
    pub expiry: Duration,
}

impl Default for SignOptions {
    fn default() -> Self {
        Self {
            algorithm: SignatureAlgorithm::RsaSha256,
            expiry: Duration::from_secs(3600),
        }
    }
}

/// Verification window
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Maximum age of a signature, measured from its `Date` header
    pub max_age: Duration,
    /// Tolerated drift for dates in the future
    pub clock_skew: Duration,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            clock_skew: Duration::from_secs(300),
        }
    }
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Date header value (RFC 2616)
    pub date: String,
    /// Host header value
    pub host: String,
    /// Content-Type header value
    pub content_type: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
    /// Signature header value
    pub signature: String,
}

impl SignatureHeaders {
    /// Same value as `signature`, for servers that read `Authorization`
    pub fn authorization(&self) -> String {
        format!("Signature {}", self.signature)
    }

    /// Attach every signed header to an outgoing request
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header(http::header::DATE, &self.date)
            .header(http::header::HOST, &self.host)
            .header(http::header::CONTENT_TYPE, &self.content_type)
            .header("signature", &self.signature)
            .header(http::header::AUTHORIZATION, self.authorization());

        match &self.digest {
            Some(digest) => request.header("digest", digest),
            None => request,
        }
    }
}

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `preset` - Headers already set on the request; `date`, `host` and
///   `content-type` found here are signed as-is instead of synthesized
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     &HeaderMap::new(),
///     Some(&body),
///     &private_key,
///     "https://my.server/users/me#main-key",
///     &SignOptions::default(),
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    preset: &HeaderMap,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    options: &SignOptions,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(
        method,
        url,
        preset,
        body,
        private_key_pem,
        key_id,
        options,
        Utc::now(),
    )
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn sign_request_at(
    method: &str,
    url: &str,
    preset: &HeaderMap,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
    options: &SignOptions,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    // 2. Fill in the headers that were not preset
    let host = match preset_value(preset, "host") {
        Some(host) => host,
        None => authority(&parsed_url)
            .map_err(|_| AppError::Validation("Missing host in URL".to_string()))?,
    };
    let date = preset_value(preset, "date")
        .unwrap_or_else(|| now.format(HTTP_DATE_FORMAT).to_string());
    let content_type =
        preset_value(preset, "content-type").unwrap_or_else(|| ACTIVITY_JSON.to_string());
    let digest = body.map(generate_digest);

    // 3. Build signing string
    let mut signing_parts = vec![
        format!(
            "(request-target): {} {}",
            method.to_lowercase(),
            path_and_query
        ),
        format!("date: {}", date),
        format!("host: {}", host),
        format!("content-type: {}", content_type),
    ];
    let mut headers_list = vec!["(request-target)", "date", "host", "content-type"];

    if let Some(ref digest_value) = digest {
        signing_parts.push(format!("digest: {}", digest_value));
        headers_list.push("digest");
    }

    let signing_string = signing_parts.join("\n");

    // 4. Sign
    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;

    let signature_bytes = match options.algorithm {
        SignatureAlgorithm::RsaSha256 => SigningKey::<Sha256>::new(private_key)
            .try_sign(signing_string.as_bytes())
            .map(|s| s.to_vec()),
        SignatureAlgorithm::RsaSha512 => SigningKey::<Sha512>::new(private_key)
            .try_sign(signing_string.as_bytes())
            .map(|s| s.to_vec()),
    }
    .map_err(|e| AppError::Internal(anyhow::anyhow!("Signing failed: {}", e)))?;

    // 5. Build Signature header
    let expires = now.timestamp() + options.expiry.as_secs() as i64;
    let signature = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\",expires={}",
        key_id,
        options.algorithm.as_str(),
        headers_list.join(" "),
        BASE64.encode(signature_bytes),
        expires
    );

    Ok(SignatureHeaders {
        date,
        host,
        content_type,
        digest,
        signature,
    })
}

fn preset_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
    /// Unix time after which the signature is no longer valid
    pub expires: Option<i64>,
    /// Unix time the signature was created
    pub created: Option<i64>,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="...",expires=...
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;
    let mut expires = None;
    let mut created = None;

    // Split by comma and parse key=value pairs
    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            // Remove quotes from value
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                "expires" => expires = Some(parse_unix_param("expires", value)?),
                "created" => created = Some(parse_unix_param("created", value)?),
                _ => {} // Ignore unknown fields
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Verification("Missing keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Verification("Missing signature".to_string()))?,
        expires,
        created,
    })
}

fn parse_unix_param(name: &str, value: &str) -> Result<i64, AppError> {
    // Some implementations send fractional seconds
    let whole = value.split('.').next().unwrap_or(value);
    whole
        .parse()
        .map_err(|_| AppError::Verification(format!("Invalid {} parameter", name)))
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}

/// Check a `Digest` header against the body
///
/// The header may list several digests; the first SHA-256 or SHA-512 entry
/// decides.
fn digest_matches(header: &str, body: &[u8]) -> Result<bool, AppError> {
    for entry in header.split(',') {
        let Some((algorithm, value)) = entry.trim().split_once('=') else {
            continue;
        };
        let expected = match algorithm.to_ascii_uppercase().as_str() {
            "SHA-256" => BASE64.encode(Sha256::digest(body)),
            "SHA-512" => BASE64.encode(Sha512::digest(body)),
            _ => continue,
        };
        return Ok(value.trim() == expected);
    }

    Err(AppError::Verification(
        "Digest header carries no supported algorithm".to_string(),
    ))
}

/// Read the signature from `Signature`, falling back to `Authorization: Signature ...`
pub fn extract_signature(headers: &HeaderMap) -> Result<ParsedSignature, AppError> {
    if let Some(value) = headers.get("signature") {
        let value = value
            .to_str()
            .map_err(|_| AppError::Verification("Invalid Signature header".to_string()))?;
        return parse_signature_header(value);
    }

    let authorization = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Signature "))
        .ok_or_else(|| AppError::Verification("Missing Signature header".to_string()))?;
    parse_signature_header(authorization)
}

/// Verify a parsed signature against the received request
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path and query, as received
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format (SPKI or PKCS#1)
///
/// # Errors
/// `AppError::Verification` on any missing, stale or mismatched component
#[allow(clippy::too_many_arguments)]
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    parsed: &ParsedSignature,
    public_key_pem: &str,
    options: &VerifyOptions,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    check_signature_shape(headers, body, parsed, options, now)?;

    // Reconstruct signing string from the received headers
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "(created)" => parsed
                .created
                .ok_or_else(|| AppError::Verification("Missing created parameter".to_string()))?
                .to_string(),
            "(expires)" => parsed
                .expires
                .ok_or_else(|| AppError::Verification("Missing expires parameter".to_string()))?
                .to_string(),
            name => received_header(headers, name)?,
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let algorithm = SignatureAlgorithm::parse(&parsed.algorithm).ok_or_else(|| {
        AppError::Verification(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        ))
    })?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Verification("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Verification(format!("Invalid signature format: {}", e)))?;

    let public_key = parse_public_key(public_key_pem)?;
    let verified = match algorithm {
        SignatureAlgorithm::RsaSha256 => {
            VerifyingKey::<Sha256>::new(public_key).verify(signing_string.as_bytes(), &signature)
        }
        SignatureAlgorithm::RsaSha512 => {
            VerifyingKey::<Sha512>::new(public_key).verify(signing_string.as_bytes(), &signature)
        }
    };

    verified.map_err(|_| AppError::Verification("Signature verification failed".to_string()))
}

/// Header-level checks that need no key material
fn check_signature_shape(
    headers: &HeaderMap,
    body: Option<&[u8]>,
    parsed: &ParsedSignature,
    options: &VerifyOptions,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let signed = |name: &str| parsed.headers.iter().any(|h| h == name);

    for required in ["(request-target)", "date"] {
        if !signed(required) {
            return Err(AppError::Verification(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    // Time window
    let now_ts = now.timestamp();
    let skew = options.clock_skew.as_secs() as i64;
    let max_age = options.max_age.as_secs() as i64;

    if let Some(expires) = parsed.expires {
        if expires < now_ts {
            return Err(AppError::Verification("Signature expired".to_string()));
        }
    }
    if let Some(created) = parsed.created {
        if created > now_ts + skew {
            return Err(AppError::Verification(
                "Signature created in the future".to_string(),
            ));
        }
    }

    let date_str = headers
        .get(http::header::DATE)
        .ok_or_else(|| AppError::Verification("Missing Date header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Verification("Invalid Date header".to_string()))?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Verification("Invalid Date format".to_string()))?;
    let age = now_ts - date.timestamp();
    if age > max_age {
        return Err(AppError::Verification("Signature expired".to_string()));
    }
    if -age > skew {
        return Err(AppError::Verification(
            "Date header is in the future".to_string(),
        ));
    }

    // Body integrity
    if let Some(body_data) = body {
        if !signed("digest") {
            return Err(AppError::Verification(
                "Signed headers must include: digest".to_string(),
            ));
        }
        let digest_header = headers
            .get("digest")
            .ok_or_else(|| AppError::Verification("Missing Digest header".to_string()))?
            .to_str()
            .map_err(|_| AppError::Verification("Invalid Digest header".to_string()))?;
        if !digest_matches(digest_header, body_data)? {
            return Err(AppError::Verification("Digest mismatch".to_string()));
        }
    }

    Ok(())
}

fn received_header(headers: &HeaderMap, name: &str) -> Result<String, AppError> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::Verification(format!("Invalid {} header", name)))
        })
        .collect::<Result<_, _>>()?;

    if values.is_empty() {
        return Err(AppError::Verification(format!("Missing {} header", name)));
    }
    Ok(values.join(", "))
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::Verification(format!("Invalid public key: {}", e)))
}

// =============================================================================
// Request verification with key resolution
// =============================================================================

/// Public key and the actor owning it
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    /// Local row id of the owning actor
    pub actor_id: String,
    /// ActivityPub id of the owning actor
    pub actor_uri: String,
    pub public_key_pem: String,
}

/// Resolves a `keyId` to the actor owning it
///
/// Implementations may fetch remote documents and must honor `ctx`.
pub trait PublicKeyResolver: Send + Sync {
    fn resolve_public_key<'a>(
        &'a self,
        key_id: &'a str,
        ctx: &'a OpContext,
    ) -> BoxFuture<'a, Result<ResolvedKey, AppError>>;
}

/// Authenticated sender of a verified request
#[derive(Debug, Clone)]
pub struct VerifiedSigner {
    pub key_id: String,
    pub actor_id: String,
    pub actor_uri: String,
}

/// Verify an inbound request end to end
///
/// Parses the signature, resolves the signing key (possibly over the
/// network), and checks the signature against the received headers. The
/// returned signer is the authenticated sender of the request body.
pub async fn verify_request<R>(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
    resolver: &R,
    options: &VerifyOptions,
    ctx: &OpContext,
) -> Result<VerifiedSigner, AppError>
where
    R: PublicKeyResolver + ?Sized,
{
    let result: Result<VerifiedSigner, AppError> = async {
        let parsed = extract_signature(headers)?;

        // Reject stale or malformed requests before any key fetch
        check_signature_shape(headers, body, &parsed, options, Utc::now())?;

        let key = resolver
            .resolve_public_key(&parsed.key_id, ctx)
            .await
            .map_err(|e| match e {
                AppError::Timeout(_) | AppError::Cancelled(_) => e,
                other => AppError::Verification(format!(
                    "Could not resolve key {}: {}",
                    parsed.key_id, other
                )),
            })?;

        verify_signature(
            method,
            path,
            headers,
            body,
            &parsed,
            &key.public_key_pem,
            options,
            Utc::now(),
        )?;

        Ok(VerifiedSigner {
            key_id: parsed.key_id,
            actor_id: key.actor_id,
            actor_uri: key.actor_uri,
        })
    }
    .await;

    match &result {
        Ok(signer) => {
            SIGNATURE_VERIFICATIONS_TOTAL
                .with_label_values(&["success"])
                .inc();
            tracing::debug!(key_id = %signer.key_id, actor = %signer.actor_uri, "Signature verified");
        }
        Err(error) => {
            SIGNATURE_VERIFICATIONS_TOTAL
                .with_label_values(&["failure"])
                .inc();
            tracing::debug!(%error, "Signature verification failed");
        }
    }

    result
}
