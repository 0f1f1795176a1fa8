pub mod loader;
pub mod model;
pub mod source;

pub use loader::ConfigLoader;
pub use model::{AppConfig, DatabaseConfig, MigrationsConfig, ReapplyPolicy, RunnerConfig};
pub use source::DirectorySource;
