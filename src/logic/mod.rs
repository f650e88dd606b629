pub mod command_log;
pub mod notify;
pub mod snapshot;

pub use command_log::*;
pub use notify::*;
pub use snapshot::*;
