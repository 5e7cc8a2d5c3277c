mod config_schema;
mod event;
mod frame;
mod ids;
mod plugin_meta;

pub use config_schema::*;
pub use event::*;
pub use frame::*;
pub use ids::*;
pub use plugin_meta::*;
