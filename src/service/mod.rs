//! Service layer module

pub mod locate_service;
pub mod map;
pub mod types;

pub use locate_service::LocateService;
pub use map::{MapCollaborator, MapMarker, OsmMarkerBuilder};
pub use types::*;
