//! Configuration module for Malady-Crawl
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, and resolving per-run connector options across their layers.
//!
//! # Example
//!
//! ```no_run
//! use malady_crawl::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Progress is flushed every {} items", config.crawler.progress_flush_every);
//! ```

mod parser;
mod resolver;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, DiseaseEntry, SourceEntry, StorageConfig, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{config_hash, load_config, load_config_with_hash, parse_config};

pub use resolver::{resolve, ConfigResolver, Options};
