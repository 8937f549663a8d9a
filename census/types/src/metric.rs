// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metric points emitted to a metrics sink.

use serde::Deserialize;
use serde::Serialize;

/// A single timestamped, tagged observation.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    /// Wall-clock time of emission, in seconds since the Unix epoch.
    pub timestamp: i64,
    pub value: f64,
    pub tags: Vec<String>,
}

impl MetricPoint {
    pub fn new(
        name: impl Into<String>,
        timestamp: i64,
        value: f64,
        tags: Vec<String>,
    ) -> Self {
        Self { name: name.into(), timestamp, value, tags }
    }

    /// Return true if this point carries exactly `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Return true if this point carries every tag in `tags`.
    pub fn has_all_tags<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        tags.into_iter().all(|tag| self.has_tag(tag))
    }

    /// Return the value of the first `key:value` tag with the given key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|tag| {
            tag.split_once(':').and_then(|(k, v)| (k == key).then_some(v))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MetricPoint;

    #[test]
    fn test_tag_lookup() {
        let point = MetricPoint::new(
            "consul.service.count",
            1,
            2.0,
            vec![
                "environment:production".to_string(),
                "status:passing".to_string(),
                "service:web".to_string(),
            ],
        );
        assert!(point.has_tag("service:web"));
        assert!(!point.has_tag("service"));
        assert!(point.has_all_tags(["status:passing", "service:web"]));
        assert!(!point.has_all_tags(["status:passing", "service:db"]));
        assert_eq!(point.tag_value("status"), Some("passing"));
        assert_eq!(point.tag_value("environment"), Some("production"));
        assert_eq!(point.tag_value("datacenter"), None);
    }
}
