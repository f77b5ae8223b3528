#![doc = include_str!("../README.md")]

pub mod smuggler;

use reconhive_core::config::ModuleEntry;
use reconhive_core::error::PresetError;
use reconhive_core::module::{DynModule, ModuleCatalog};

// --- re-exports ---
pub use smuggler::Smuggler;

/// Names of every built-in module.
pub const BUILTIN: &[&str] = &[smuggler::NAME];

/// Registers the built-in modules under their canonical names.
///
/// # Errors
///
/// [`PresetError::DuplicateModule`] if `catalog` already holds one of them.
pub fn register_builtin(catalog: &mut ModuleCatalog) -> Result<(), PresetError> {
    catalog.register(smuggler::NAME, |entry: &ModuleEntry| {
        Smuggler::from_entry(entry).map(|m| Box::new(m) as Box<dyn DynModule>)
    })?;
    Ok(())
}

/// A catalog holding only the built-in modules.
pub fn builtin_catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    // empty catalog, names cannot collide
    if let Err(e) = register_builtin(&mut catalog) {
        tracing::error!(error = %e, "built-in module registration failed");
    }
    catalog
}
