#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod error;
mod exec;
mod function;
mod graph;
mod market_data;
mod resolve;
mod value;
mod view;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use exec::*;
pub use function::*;
pub use graph::*;
pub use market_data::*;
pub use resolve::*;
pub use value::*;
pub use view::*;
