pub mod access;
pub mod cache;
pub mod codec;
pub mod distributed;
pub mod key;
pub mod local;

pub use access::*;
pub use cache::*;
pub use codec::*;
pub use distributed::*;
pub use key::*;
pub use local::*;
