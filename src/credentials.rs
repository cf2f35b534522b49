//! Account credentials kept in the OS keychain.
//!
//! Entries are stored under the name of the environment variable they
//! stand in for, so `XAPI_LOGIN` in the keychain fills `XAPI_LOGIN` in the
//! environment when the variable is unset.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{Result, XapiError};

const SERVICE: &str = "slotrader";

/// Environment variables that may be backed by the keychain.
pub const ACCOUNT_VARS: [&str; 2] = ["XAPI_LOGIN", "XAPI_PASSWORD"];

fn entry(var: &str) -> Result<keyring::Entry> {
    keyring::Entry::new(SERVICE, var)
        .map_err(|e| XapiError::Config(format!("keychain entry {var}: {e}")))
}

/// Stores `value` in the keychain under `var`.
///
/// # Errors
///
/// Returns [`XapiError::Config`] if the keychain rejects the entry.
pub fn store(var: &str, value: &str) -> Result<()> {
    entry(var)?
        .set_password(value)
        .map_err(|e| XapiError::Config(format!("failed to store {var} in keychain: {e}")))
}

/// Sets every unset account variable from the keychain.
///
/// Must run before any task reads the environment.
pub fn load_into_env() {
    for var in ACCOUNT_VARS {
        if std::env::var_os(var).is_some() {
            continue;
        }
        let value = match entry(var).map(|stored| stored.get_password()) {
            Ok(Ok(value)) => Zeroizing::new(value),
            Ok(Err(keyring::Error::NoEntry)) => continue,
            Ok(Err(e)) => {
                warn!(var, error = %e, "Failed to read keychain entry");
                continue;
            }
            Err(e) => {
                warn!(var, error = %e, "Keychain unavailable");
                continue;
            }
        };
        debug!(var, "Loaded credential from keychain");
        // SAFETY: runs at startup before any task reads the environment.
        unsafe {
            std::env::set_var(var, value.as_str());
        }
    }
}
