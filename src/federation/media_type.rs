//! ActivityPub media types and content negotiation

use http::HeaderMap;
use http::header::{ACCEPT, CONTENT_TYPE};

/// Media type used for every document this server emits
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// JSON-LD media type with the ActivityStreams profile
pub const LD_JSON_ACTIVITYSTREAMS: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// `Accept` value sent when fetching remote documents
pub const ACCEPT_ACTIVITY: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACTIVITYSTREAMS_PROFILE: &str = "https://www.w3.org/ns/activitystreams";

/// Whether a single media range names an ActivityPub document type
///
/// Parameters other than `profile` (e.g. `charset`, `q`) are ignored.
pub fn is_activity_media_type(value: &str) -> bool {
    let mut parts = value.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default().to_ascii_lowercase();

    match essence.as_str() {
        "application/activity+json" => true,
        "application/ld+json" => parts.any(|param| {
            param
                .split_once('=')
                .is_some_and(|(name, value)| {
                    name.trim().eq_ignore_ascii_case("profile")
                        && value
                            .trim()
                            .trim_matches('"')
                            .split_whitespace()
                            .any(|profile| profile == ACTIVITYSTREAMS_PROFILE)
                })
        }),
        _ => false,
    }
}

/// Whether the `Accept` header asks for an ActivityPub document
pub fn accepts_activity_json(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(split_media_ranges)
        .any(|range| is_activity_media_type(&range))
}

/// Whether the request body is declared as an ActivityPub document
pub fn is_activity_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_activity_media_type)
}

/// Split an `Accept` header on commas that are not inside a quoted string
fn split_media_ranges(header: &str) -> Vec<String> {
    let mut ranges = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in header.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                ranges.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    ranges.push(current);

    ranges
        .into_iter()
        .map(|range| range.trim().to_string())
        .filter(|range| !range.is_empty())
        .collect()
}
