pub mod audio;
pub mod config;
pub mod error;
pub mod guard;
pub mod model;
pub mod paths;
pub mod segmentation;
pub mod separation;
pub mod server;

pub use config::AppConfig;
pub use error::{LoadError, ServiceError};
pub use guard::ResourceGuard;
pub use model::{LoaderSet, ModelRegistry};
pub use server::build_router;
