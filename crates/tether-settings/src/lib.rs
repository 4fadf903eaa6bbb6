//! # tether-settings
//!
//! Layered configuration for a tether session.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **User file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! The resolved value is returned to the caller and passed down explicitly.
//! There is no process-wide settings instance, so two sessions in one
//! process can run with different settings.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
    tether_home, validate,
};
pub use types::*;
