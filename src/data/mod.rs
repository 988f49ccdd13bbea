//! The rendering context: a generic value tree and its JSON reader.

pub mod json;
mod value;

pub use json::{ParseError, parse};
pub use value::{DataTree, Map, Number, format_float};
