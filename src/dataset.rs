use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::ingestion::RawRow;

/// Source keys never offered as filter keys.
const RESERVED_FILTER_KEYS: &[&str] = &["address", "id", "latitude", "longitude"];

/// A row that geocoded successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub id: String,
    /// Provider-formatted address; authoritative display text.
    pub address: String,
    /// Text that was sent to the provider.
    pub query: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub row_index: usize,
    pub source_row: RawRow,
}

impl ResolvedAddress {
    pub fn position(&self) -> LatLng {
        LatLng {
            lat: self.latitude,
            lng: self.longitude,
        }
    }

    fn matches_search(&self, needle: &str) -> bool {
        if self.address.to_lowercase().contains(needle) {
            return true;
        }
        self.source_row.iter().any(|(_, value)| match value {
            Value::String(text) => text.to_lowercase().contains(needle),
            _ => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategorySelection {
    #[default]
    All,
    Key(String),
}

impl CategorySelection {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("all") {
            CategorySelection::All
        } else {
            CategorySelection::Key(trimmed.to_string())
        }
    }
}

impl fmt::Display for CategorySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategorySelection::All => f.write_str("all"),
            CategorySelection::Key(key) => f.write_str(key),
        }
    }
}

impl Serialize for CategorySelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A view over the dataset; applying it never mutates the records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterCriteria {
    pub search_term: String,
    pub category: CategorySelection,
}

impl FilterCriteria {
    pub fn new(search_term: impl Into<String>, category: &str) -> Self {
        Self {
            search_term: search_term.into(),
            category: CategorySelection::parse(category),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.search_term.is_empty() && self.category == CategorySelection::All
    }

    pub fn matches(&self, record: &ResolvedAddress) -> bool {
        let search_ok = self.search_term.is_empty()
            || record.matches_search(&self.search_term.to_lowercase());
        // Selection filters on key presence in the source row, not on the key's value.
        let category_ok = match &self.category {
            CategorySelection::All => true,
            CategorySelection::Key(key) => record.source_row.is_present(key),
        };
        search_ok && category_ok
    }
}

/// Resolved records in resolution order. Replaced wholesale on every upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AddressDataset {
    records: Vec<ResolvedAddress>,
}

impl AddressDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: ResolvedAddress) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResolvedAddress] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedAddress> {
        self.records.iter()
    }

    pub fn get(&self, id: &str) -> Option<&ResolvedAddress> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn filter(&self, criteria: &FilterCriteria) -> Vec<&ResolvedAddress> {
        self.records
            .iter()
            .filter(|record| criteria.matches(record))
            .collect()
    }

    /// Keys of the first record's source row that can be offered as filters.
    pub fn filter_keys(&self) -> Vec<String> {
        let Some(first) = self.records.first() else {
            return Vec::new();
        };
        first
            .source_row
            .keys()
            .filter(|key| {
                !RESERVED_FILTER_KEYS
                    .iter()
                    .any(|reserved| key.eq_ignore_ascii_case(reserved))
            })
            .map(str::to_string)
            .collect()
    }

    /// Distinct category values in first-seen order.
    pub fn category_values(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter_map(|record| record.category.as_deref())
            .filter(|category| seen.insert(*category))
            .map(str::to_string)
            .collect()
    }
}

impl FromIterator<ResolvedAddress> for AddressDataset {
    fn from_iter<I: IntoIterator<Item = ResolvedAddress>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapMarker {
    pub id: String,
    pub position: LatLng,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub metadata: RawRow,
}

/// What the map widget needs to draw a set of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub center: Option<LatLng>,
    pub bounds: Option<MapBounds>,
    pub markers: Vec<MapMarker>,
}

pub fn map_view<'a, I>(records: I) -> MapView
where
    I: IntoIterator<Item = &'a ResolvedAddress>,
{
    let markers: Vec<MapMarker> = records
        .into_iter()
        .map(|record| MapMarker {
            id: record.id.clone(),
            position: record.position(),
            title: record.address.clone(),
            category: record.category.clone(),
            metadata: record.source_row.clone(),
        })
        .collect();

    if markers.is_empty() {
        return MapView {
            center: None,
            bounds: None,
            markers,
        };
    }

    let count = markers.len() as f64;
    let (lat_sum, lng_sum) = markers.iter().fold((0.0, 0.0), |(lat, lng), marker| {
        (lat + marker.position.lat, lng + marker.position.lng)
    });
    let bounds = markers.iter().fold(
        MapBounds {
            north: f64::MIN,
            south: f64::MAX,
            east: f64::MIN,
            west: f64::MAX,
        },
        |acc, marker| MapBounds {
            north: acc.north.max(marker.position.lat),
            south: acc.south.min(marker.position.lat),
            east: acc.east.max(marker.position.lng),
            west: acc.west.min(marker.position.lng),
        },
    );

    MapView {
        center: Some(LatLng {
            lat: lat_sum / count,
            lng: lng_sum / count,
        }),
        bounds: Some(bounds),
        markers,
    }
}
