//! stitcher-kg: Entity resolution and stitching.
//!
//! `Stitcher` looks entities up by identity key and creates typed edges
//! between them. `DeferredLinks` queues relationships whose targets may not
//! be registered yet and replays them once the whole batch is in.

pub mod stitcher;
pub mod deferred;

pub use deferred::{DeferredLink, DeferredLinks, ResolutionReport};
pub use stitcher::{find_in, stitch_in, StitchOutcome, Stitcher};
