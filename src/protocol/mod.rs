// Licensed under the Apache-2.0 license

pub mod algorithms;
pub mod capabilities;
pub(crate) mod common;
pub mod version;

pub use algorithms::*;
pub use capabilities::*;
pub(crate) use common::*;
pub use version::*;
