//! Runtime core for placing tensor data in memory pools and moving it between them.
//!
//! Everything lives under [`loom`]; the most common entry points are re-exported here.

pub mod loom;

pub use loom::{
    context::{Context, ContextBuilder, ContextConfig},
    error::{Error, ErrorKind},
};
