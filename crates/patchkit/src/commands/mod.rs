mod apply;
mod info;
mod install;
mod list;
mod pack;

pub use apply::*;
pub use info::*;
pub use install::*;
pub use list::*;
pub use pack::*;
