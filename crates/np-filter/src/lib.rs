pub mod backend;
pub mod base;
pub mod bootstrap;
pub mod iptables;
pub mod memory;
pub mod probe;
pub mod reconcile;
pub mod status;

pub use backend::*;
pub use base::*;
pub use bootstrap::*;
pub use iptables::*;
pub use memory::*;
pub use probe::*;
pub use reconcile::*;
pub use status::*;
