// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Canonical, order-independent sets of service tags.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// A canonicalized list of tags, used to group instances that carry the same
/// tags regardless of the order in which the directory reported them.
///
/// The tags are held sorted (byte-wise), so two `TagSet`s built from
/// permutations of the same multiset of tags compare and hash equal.
/// Duplicate tags are preserved; tags are otherwise opaque.
#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagSet {
    tags: Vec<String>,
}

impl TagSet {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        tags.sort_unstable();
        Self { tags }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn into_tags(self) -> Vec<String> {
        self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for TagSet {
    fn from(tags: Vec<String>) -> Self {
        TagSet::new(tags)
    }
}

impl From<TagSet> for Vec<String> {
    fn from(set: TagSet) -> Self {
        set.tags
    }
}

impl<'a> FromIterator<&'a str> for TagSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        TagSet::new(iter)
    }
}

impl FromIterator<String> for TagSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        TagSet::new(iter)
    }
}

// For log output only; tags may themselves contain '|'.
impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tags.join("|"))
    }
}
