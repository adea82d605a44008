pub mod bus;
pub mod types;

pub use bus::*;
pub use types::*;
