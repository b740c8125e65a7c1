//! # relay-settings
//!
//! Configuration management with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **User file**: `~/.relay/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RELAY_*` overrides (highest priority)
//!
//! The merged result is validated before it is handed out.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RelaySettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = RelaySettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.emitter.max_events_per_user, 1000);
        assert_eq!(settings.emitter.delivery_retries, 3);
        assert_eq!(settings.emitter.max_field_chars, 200);
        assert_eq!(settings.recovery.circuit_breaker_threshold, 5);
        assert!(settings.recovery.enable_graceful_degradation);
        assert!(settings.auth.tokens.is_empty());
    }
}
