//! Map collaborator
//!
//! Rendering is someone else's job; the service only hands over the winning
//! coordinate and a label and gets a marker description back.

use serde::{Deserialize, Serialize};

/// Label attached to the predicted location
pub const GUESS_LABEL: &str = "AI Guess";

/// Default zoom: roughly country scale
pub const DEFAULT_ZOOM: u8 = 4;

/// A marker for the map renderer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMarker {
    pub latitude: f64,
    pub longitude: f64,
    pub label: String,
    pub caption: String,
    pub zoom: u8,
    pub url: String,
}

/// Receives the final coordinate and produces a visual marker
pub trait MapCollaborator: Send + Sync {
    fn place_marker(&self, latitude: f64, longitude: f64, label: &str) -> MapMarker;
}

/// Builds OpenStreetMap links for a marker
#[derive(Debug, Clone)]
pub struct OsmMarkerBuilder {
    zoom: u8,
}

impl OsmMarkerBuilder {
    pub fn new(zoom: u8) -> Self {
        Self { zoom }
    }
}

impl Default for OsmMarkerBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_ZOOM)
    }
}

impl MapCollaborator for OsmMarkerBuilder {
    fn place_marker(&self, latitude: f64, longitude: f64, label: &str) -> MapMarker {
        MapMarker {
            latitude,
            longitude,
            label: label.to_string(),
            caption: format!("{}: {:.2}, {:.2}", label, latitude, longitude),
            zoom: self.zoom,
            url: format!(
                "https://www.openstreetmap.org/?mlat={lat:.5}&mlon={lon:.5}#map={zoom}/{lat:.5}/{lon:.5}",
                lat = latitude,
                lon = longitude,
                zoom = self.zoom
            ),
        }
    }
}
