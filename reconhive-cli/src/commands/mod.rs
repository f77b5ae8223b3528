//! Command handlers -- one module per subcommand

pub mod deps;
pub mod modules;
pub mod scan;
