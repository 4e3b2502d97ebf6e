//! Test fixtures

pub mod tracker_mesh;

pub use tracker_mesh::{TrackerMesh, TrackerNode};
