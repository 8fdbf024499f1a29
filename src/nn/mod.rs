//! Module tree
//!
//! Models are trees of named modules. The tree is what the block extractor
//! walks, what block paths resolve against, and what capture passes tap
//! into.

mod linear;
mod module;
mod sequential;

pub use linear::QuantLinear;
pub use module::{module_at, BlockPath, Module};
pub use sequential::Sequential;
