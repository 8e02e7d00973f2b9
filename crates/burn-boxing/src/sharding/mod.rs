//! Distribution descriptors, device meshes and the shard layouts they imply.

pub mod layout;

mod mesh;
mod spec;

pub use mesh::*;
pub use spec::*;
