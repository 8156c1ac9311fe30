//! Runtime harness to execute pipeline components against a message broker

mod collect;
mod dispatch;
mod flow;
mod heart;
mod machine;
mod module;
mod session;

pub use collect::*;
pub use dispatch::*;
pub use flow::*;
pub use heart::*;
pub use machine::*;
pub use module::*;
pub use session::*;
