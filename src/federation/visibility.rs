//! Visibility engine
//!
//! Maps a note's visibility onto `to`/`cc` addressee lists for outbound
//! documents, and infers visibility back from the lists on received ones.
//! The two directions are inverses of each other for all four levels.

use super::activity::PUBLIC_ADDRESS;
use crate::data::Visibility;

/// Whether `address` names the Public collection in any of its spellings
pub fn is_public_address(address: &str) -> bool {
    matches!(address, PUBLIC_ADDRESS | "Public" | "as:Public")
}

/// Compute `(to, cc)` for an outbound note
///
/// `mentions` are the URIs of explicitly addressed actors (mentions and the
/// author of the note being replied to). They are the whole audience of a
/// private note and are added to `to` for every other level.
pub fn addressees(
    visibility: Visibility,
    followers_url: &str,
    mentions: &[String],
) -> (Vec<String>, Vec<String>) {
    let (mut to, cc) = match visibility {
        Visibility::Public => (
            vec![PUBLIC_ADDRESS.to_string()],
            vec![followers_url.to_string()],
        ),
        Visibility::Unlisted => (
            vec![followers_url.to_string()],
            vec![PUBLIC_ADDRESS.to_string()],
        ),
        Visibility::Follower => (vec![followers_url.to_string()], Vec::new()),
        Visibility::Private => (Vec::new(), Vec::new()),
    };

    for mention in mentions {
        if !to.contains(mention) {
            to.push(mention.clone());
        }
    }

    (to, cc)
}

/// Infer visibility from the addressee lists of a received document
pub fn infer_visibility(to: &[String], cc: &[String]) -> Visibility {
    if to.iter().any(|a| is_public_address(a)) {
        Visibility::Public
    } else if cc.iter().any(|a| is_public_address(a)) {
        Visibility::Unlisted
    } else if to.iter().any(|a| a.ends_with("/followers")) {
        Visibility::Follower
    } else {
        Visibility::Private
    }
}
