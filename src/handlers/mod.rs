pub mod cache;
pub mod config;
pub mod languages;
pub mod models;
pub mod summarize;
pub mod translate;

pub use cache::cache_stats;
pub use config::{get_config, update_config};
pub use languages::list_languages;
pub use models::{list_models, load_model};
pub use summarize::summarize_text;
pub use translate::translate_text;
