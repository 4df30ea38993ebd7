pub mod events;
pub mod experiment;
pub mod models;
pub mod parsing;
pub mod runs;
pub mod template;
