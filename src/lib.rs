pub mod build;
pub mod context;
pub mod exec;
pub mod hashes;
pub mod paths;
pub mod record;
pub mod script;
pub mod trace;
