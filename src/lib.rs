pub mod error;
pub mod eval;
pub mod global;
pub mod heredoc;
pub mod job;
pub mod parser;
pub mod pipes;
pub mod plan;
pub mod search;
pub mod spawn;
pub mod types;
