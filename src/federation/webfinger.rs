//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from addresses, and to answer
//! discovery queries for local actors.

use serde::{Deserialize, Serialize};

use super::fetch::RemoteFetcher;
use super::media_type::{ACTIVITY_JSON, is_activity_media_type};
use crate::context::OpContext;
use crate::error::AppError;

const JRD_ACCEPT: &str = "application/jrd+json, application/json";

/// WebFinger result
#[derive(Debug, Clone)]
pub struct WebFingerResult {
    /// Subject (acct:user@domain)
    pub subject: String,
    /// ActivityPub actor URI
    pub actor_uri: String,
}

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Pick the actor URI out of a JRD document
///
/// Only a `rel=self` link with an ActivityPub media type and an http(s)
/// `href` qualifies.
pub fn select_self_link(response: &WebFingerResponse) -> Option<&str> {
    response
        .links
        .iter()
        .filter(|link| link.rel == "self")
        .filter(|link| {
            link.link_type
                .as_deref()
                .is_some_and(is_activity_media_type)
        })
        .filter_map(|link| link.href.as_deref())
        .find(|href| {
            url::Url::parse(href)
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false)
        })
}

/// Resolve an address to ActivityPub actor
///
/// # Arguments
/// * `username`, `domain` - Account address parts
/// * `scheme` - "https" in production
/// * `local_domain` - This server's domain; looking it up is an error
///
/// # Example
/// ```ignore
/// let result = resolve_webfinger(&fetcher, "https", "user", "mastodon.social", "my.host", &ctx).await?;
/// println!("Actor: {}", result.actor_uri);
/// ```
pub async fn resolve_webfinger(
    fetcher: &RemoteFetcher,
    scheme: &str,
    username: &str,
    domain: &str,
    local_domain: &str,
    ctx: &OpContext,
) -> Result<WebFingerResult, AppError> {
    if domain.eq_ignore_ascii_case(local_domain) {
        return Err(AppError::Validation(format!(
            "{} is this server; not looking it up remotely",
            domain
        )));
    }

    let resource = format!("acct:{}@{}", username, domain);
    let url = format!(
        "{}://{}/.well-known/webfinger?resource={}",
        scheme,
        domain,
        urlencoding::encode(&resource)
    );

    let fetched = fetcher
        .get_json::<WebFingerResponse>(&url, JRD_ACCEPT, None, ctx)
        .await?;

    let actor_uri = select_self_link(&fetched.document)
        .ok_or_else(|| {
            AppError::Resolution(format!("WebFinger for {} has no usable self link", resource))
        })?
        .to_string();

    tracing::debug!(%resource, %actor_uri, "WebFinger resolved");

    Ok(WebFingerResult {
        subject: fetched.document.subject,
        actor_uri,
    })
}

/// Split an `acct:` resource (or bare `user@domain`) into its parts
pub fn parse_acct(resource: &str) -> Result<(&str, &str), AppError> {
    let acct = resource.strip_prefix("acct:").unwrap_or(resource);
    let acct = acct.strip_prefix('@').unwrap_or(acct);

    match acct.split_once('@') {
        Some((username, domain))
            if !username.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok((username, domain))
        }
        _ => Err(AppError::Validation(format!(
            "Invalid account address: {}",
            resource
        ))),
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - URI of the local actor
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url.to_string()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url.to_string()),
            },
        ],
    }
}
