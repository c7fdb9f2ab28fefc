//! Rules deciding whether a closed way is a polygon or a linestring.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use serde_json::Value;

use crate::error::{Error, Result};

/// Config determining which closed way features are polygons.
///
/// A closed way is a polygon when it is not tagged `area=no` and at least
/// one of the following holds on its raw tags: `area=yes`, any key of
/// `all` is present, some `allowlist` key has one of the listed values, or
/// some `denylist` key has a value outside the listed ones.
///
/// Compiled from the same two sources as OGR and iD:
/// <https://github.com/tyrasd/osm-polygon-features> and
/// <https://github.com/ideditor/id-area-keys>.
#[derive(Debug, Clone, PartialEq)]
pub struct WayPolygonConfig {
    pub all: BTreeSet<String>,
    pub allowlist: BTreeMap<String, BTreeSet<String>>,
    pub denylist: BTreeMap<String, BTreeSet<String>>,
}

impl WayPolygonConfig {
    /// Parse a config from its JSON shape, validating all three keys.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            Error::PolygonFeaturesConfigInvalid("config must be a JSON object".into())
        })?;

        let all = string_set(object.get("all"), "all")?;
        let allowlist = string_set_map(object.get("allowlist"), "allowlist")?;
        let denylist = string_set_map(object.get("denylist"), "denylist")?;

        Ok(Self { all, allowlist, denylist })
    }

    /// The bundled default ruleset, parsed once per process.
    pub fn bundled() -> &'static Self {
        static CONFIG: OnceLock<WayPolygonConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            let raw: Value = serde_json::from_str(include_str!("osm_way_polygon_features.json"))
                .expect("bundled polygon features config is valid JSON");
            Self::from_json(&raw).expect("bundled polygon features config is well-formed")
        })
    }

    /// Apply the ruleset to a closed way's raw (pre-normalization) tags.
    pub fn is_polygon(&self, closed: bool, raw_tags: &BTreeMap<String, String>) -> bool {
        if !closed || raw_tags.is_empty() {
            return false;
        }
        if raw_tags.get("area").map(String::as_str) == Some("no") {
            return false;
        }
        if raw_tags.get("area").map(String::as_str) == Some("yes") {
            return true;
        }
        if self.all.iter().any(|key| raw_tags.contains_key(key)) {
            return true;
        }
        if self
            .allowlist
            .iter()
            .any(|(key, values)| raw_tags.get(key).is_some_and(|v| values.contains(v)))
        {
            return true;
        }
        self.denylist
            .iter()
            .any(|(key, values)| raw_tags.get(key).is_some_and(|v| !values.contains(v)))
    }
}

fn string_set(value: Option<&Value>, key: &str) -> Result<BTreeSet<String>> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| Error::PolygonFeaturesConfigInvalid(format!("missing list key: {key}")))?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                Error::PolygonFeaturesConfigInvalid(format!("non-string entry under key: {key}"))
            })
        })
        .collect()
}

fn string_set_map(value: Option<&Value>, key: &str) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let object = value
        .and_then(Value::as_object)
        .ok_or_else(|| Error::PolygonFeaturesConfigInvalid(format!("missing mapping key: {key}")))?;
    object
        .iter()
        .map(|(tag, values)| Ok((tag.clone(), string_set(Some(values), tag)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn bundled_config_parses() {
        let config = WayPolygonConfig::bundled();
        assert!(config.all.contains("building"));
        assert!(config.allowlist.contains_key("barrier"));
        assert!(config.denylist.contains_key("natural"));
    }

    #[test]
    fn open_ways_are_never_polygons() {
        let config = WayPolygonConfig::bundled();
        assert!(!config.is_polygon(false, &tags(&[("building", "yes")])));
    }

    #[test]
    fn area_no_forces_linestring() {
        let config = WayPolygonConfig::bundled();
        assert!(!config.is_polygon(true, &tags(&[("building", "yes"), ("area", "no")])));
    }

    #[test]
    fn area_yes_forces_polygon() {
        let config = WayPolygonConfig::bundled();
        assert!(config.is_polygon(true, &tags(&[("highway", "pedestrian"), ("area", "yes")])));
    }

    #[test]
    fn allowlist_checks_values() {
        let config = WayPolygonConfig::bundled();
        assert!(config.is_polygon(true, &tags(&[("barrier", "city_wall")])));
        assert!(!config.is_polygon(true, &tags(&[("barrier", "fence")])));
    }

    #[test]
    fn denylist_accepts_unlisted_values() {
        let config = WayPolygonConfig::bundled();
        assert!(config.is_polygon(true, &tags(&[("natural", "water")])));
        assert!(!config.is_polygon(true, &tags(&[("natural", "coastline")])));
    }

    #[test]
    fn untagged_closed_ways_stay_linestrings() {
        let config = WayPolygonConfig::bundled();
        assert!(!config.is_polygon(true, &tags(&[])));
        assert!(!config.is_polygon(true, &tags(&[("highway", "primary")])));
    }

    #[test]
    fn rejects_malformed_config() {
        let raw = serde_json::json!({"all": ["building"], "allowlist": {}});
        assert!(matches!(
            WayPolygonConfig::from_json(&raw),
            Err(Error::PolygonFeaturesConfigInvalid(_))
        ));
        let raw = serde_json::json!({"all": [1], "allowlist": {}, "denylist": {}});
        assert!(matches!(
            WayPolygonConfig::from_json(&raw),
            Err(Error::PolygonFeaturesConfigInvalid(_))
        ));
    }
}
