pub mod config;
pub mod error;
pub mod rule;
pub mod set;
pub mod status;

pub use config::*;
pub use error::*;
pub use rule::*;
pub use set::*;
pub use status::*;
