pub mod change;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod informer;
pub mod resource;
pub mod watches;

pub use change::*;
pub use dispatch::*;
pub use engine::*;
pub use error::*;
pub use informer::*;
pub use resource::*;
pub use watches::*;
