//! # Terraflow Routing
//!
//! Hydrological routing over tiled DEMs too large for memory:
//! - Fill pits: raise undrained depressions to their pour points
//! - Flow direction: D8 single direction and MFD weight distributions,
//!   with shortest-drain plateau resolution
//! - Flow accumulation: weighted upstream totals for both conventions
//! - Distance to channel: downstream path length to a channel mask
//! - Watershed delineation: fragment polygons from outflow points
//!
//! Every entry point is a pure function on file paths; raster arguments
//! are `(path, band)` pairs with 1-based bands. All traversal state lives
//! in explicit queues, heaps and frame stacks, so working memory is
//! bounded by the block caches rather than raster size.

mod distance_to_channel;
mod distance_to_channel_mfd;
mod fill_pits;
mod flow_accumulation;
mod flow_accumulation_mfd;
mod flow_direction;
mod flow_direction_mfd;
mod support;
mod watershed;

#[cfg(test)]
pub(crate) mod test_util;

pub use distance_to_channel::distance_to_channel_d8;
pub use distance_to_channel_mfd::distance_to_channel_mfd;
pub use fill_pits::fill_pits;
pub use flow_accumulation::flow_accumulation_d8;
pub use flow_accumulation_mfd::flow_accumulation_mfd;
pub use flow_direction::flow_dir_d8;
pub use flow_direction_mfd::flow_dir_mfd;
pub use watershed::delineate_watersheds;
