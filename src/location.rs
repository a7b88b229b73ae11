//! City field → population lookup keys.
//!
//! Resolution is two-tier: the alias table is consulted first and, when a
//! rule matches, yields exactly one key. Otherwise the field is split on
//! commas and each fragment becomes a key against the record's country.
//! The pipeline later keeps the *largest* population among the fragments.
//! That max rule is an approximation for co-located metropolitan fragments
//! and is knowingly wrong for rows that list unrelated branch cities.

use crate::models::LocationKey;
use serde::{Deserialize, Serialize};

/// A rule mapping a known ambiguous city field to one lookup key.
///
/// Matching is case-insensitive substring matching: every entry of
/// `city_contains` must occur in the city field and, if set,
/// `country_contains` must occur in the country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityAlias {
    pub city_contains: Vec<String>,
    #[serde(default)]
    pub country_contains: Option<String>,
    pub city: String,
    pub country: String,
}

impl CityAlias {
    pub fn new(city_contains: &[&str], country_contains: Option<&str>, city: &str, country: &str) -> Self {
        Self {
            city_contains: city_contains.iter().map(|s| s.to_string()).collect(),
            country_contains: country_contains.map(str::to_string),
            city: city.to_string(),
            country: country.to_string(),
        }
    }

    fn matches(&self, city_lower: &str, country_lower: &str) -> bool {
        if self.city_contains.is_empty() {
            return false;
        }
        let city_ok = self
            .city_contains
            .iter()
            .all(|needle| city_lower.contains(&needle.to_lowercase()));
        let country_ok = self
            .country_contains
            .as_ref()
            .map(|needle| country_lower.contains(&needle.to_lowercase()))
            .unwrap_or(true);
        city_ok && country_ok
    }

    pub fn key(&self) -> LocationKey {
        LocationKey::new(&self.city, &self.country)
    }
}

/// Aliases for entities the population provider cannot place on its own.
pub fn default_city_aliases() -> Vec<CityAlias> {
    vec![
        // The Holy See has no meaningful population of its own.
        CityAlias::new(&["vatican"], Some("vatican"), "Rome", "Italy"),
        CityAlias::new(&["south kensington", "london"], None, "London", "United Kingdom"),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct LocationResolver {
    aliases: Vec<CityAlias>,
}

impl LocationResolver {
    pub fn new(aliases: Vec<CityAlias>) -> Self {
        Self { aliases }
    }

    /// Lookup keys for a city field, in field order and without duplicates.
    ///
    /// Empty only when the field holds no place name at all.
    pub fn resolve(&self, raw_city: &str, country: &str) -> Vec<LocationKey> {
        let city_lower = raw_city.to_lowercase();
        let country_lower = country.to_lowercase();

        if let Some(alias) = self
            .aliases
            .iter()
            .find(|alias| alias.matches(&city_lower, &country_lower))
        {
            tracing::debug!(
                "Alias applied: '{}, {}' -> '{}, {}'",
                raw_city,
                country,
                alias.city,
                alias.country
            );
            return vec![alias.key()];
        }

        let mut keys: Vec<LocationKey> = Vec::new();
        for fragment in raw_city.split(',') {
            if fragment.trim().is_empty() {
                continue;
            }
            let key = LocationKey::new(fragment, country);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        if keys.len() > 1 {
            tracing::debug!("Compound city '{}' split into {} keys", raw_city, keys.len());
        }

        keys
    }
}
