mod autoformat;
mod blocks;
mod comments;
mod config;
mod core;
mod drag;
mod editing;
mod html;
mod markers;
mod marks;
mod ops;
mod plugin;
mod selection;
mod session;
mod slash;
mod sync;
mod title;
mod toolbar;

pub use crate::comments::*;
pub use crate::config::*;
pub use crate::core::*;
pub use crate::drag::*;
pub use crate::html::*;
pub use crate::markers::*;
pub use crate::marks::active_marks;
pub use crate::ops::*;
pub use crate::plugin::*;
pub use crate::selection::*;
pub use crate::session::*;
pub use crate::slash::*;
pub use crate::sync::*;
pub use crate::title::*;
pub use crate::toolbar::*;
