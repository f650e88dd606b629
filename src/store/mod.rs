pub mod http;
pub mod memory;
pub mod traits;
pub mod typed_read_cache;

pub use http::*;
pub use memory::*;
pub use traits::*;
pub use typed_read_cache::*;
