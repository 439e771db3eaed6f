mod local;
pub mod synthetic;

pub use local::LocalMedia;
