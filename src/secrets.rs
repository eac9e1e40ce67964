#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

/// Keyring account holding the geocoding API key.
pub const GEOCODE_KEY_ALIAS: &str = "google-maps-api-key";

#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    #[cfg(test)]
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        let secret = self.try_get(account)?;
        if secret.is_some() {
            debug!(
                target: "secret_vault",
                service = %self.service_name,
                account,
                "loaded secret from secure backend"
            );
        }
        Ok(secret)
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        if secret.expose_secret().trim().is_empty() {
            return Err(AppError::Config("refusing to store an empty secret".into()));
        }
        self.store(account, secret)?;
        info!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored secret in secure backend"
        );
        Ok(())
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.try_get(account).map(|secret| secret.is_some())
    }

    fn try_get(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) if value.trim().is_empty() => Ok(None),
                    Ok(value) => Ok(Some(SecretString::new(value.into()))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    fn store(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            #[cfg(test)]
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }
}
