use secrecy::{ExposeSecret, SecretString};

use crate::db::{credential_repo, Database};
use crate::error::CredentialError;

/// Supplies the deployment's extraction API key.
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> Result<SecretString, CredentialError>;
}

/// Reads the key from the `api_keys` table on every call, so a key stored
/// while the engine runs is picked up by the next extraction.
#[derive(Clone)]
pub struct DatabaseCredentials {
    db: Database,
}

impl DatabaseCredentials {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CredentialProvider for DatabaseCredentials {
    fn api_key(&self) -> Result<SecretString, CredentialError> {
        credential_repo::get_api_key(&self.db)?
            .map(SecretString::from)
            .ok_or(CredentialError::Missing)
    }
}

/// A fixed key, typically resolved from configuration.
pub struct StaticCredentials {
    key: SecretString,
}

impl StaticCredentials {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Result<SecretString, CredentialError> {
        Ok(self.key.clone())
    }
}

/// Stores `key` unless the database already holds one. Returns whether a
/// key was written.
pub fn seed_api_key(db: &Database, key: &SecretString) -> Result<bool, CredentialError> {
    if credential_repo::get_api_key(db)?.is_some() {
        return Ok(false);
    }
    credential_repo::set_api_key(db, key.expose_secret())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_credentials_missing() {
        let db = Database::open_in_memory().unwrap();
        let provider = DatabaseCredentials::new(db);
        assert!(matches!(provider.api_key(), Err(CredentialError::Missing)));
    }

    #[test]
    fn test_database_credentials_reads_latest_key() {
        let db = Database::open_in_memory().unwrap();
        let provider = DatabaseCredentials::new(db.clone());

        credential_repo::set_api_key(&db, "pk-one").unwrap();
        assert_eq!(provider.api_key().unwrap().expose_secret(), "pk-one");

        credential_repo::set_api_key(&db, "pk-two").unwrap();
        assert_eq!(provider.api_key().unwrap().expose_secret(), "pk-two");
    }

    #[test]
    fn test_static_credentials() {
        let provider = StaticCredentials::new(SecretString::from("pk-static"));
        assert_eq!(provider.api_key().unwrap().expose_secret(), "pk-static");
    }

    #[test]
    fn test_seed_keeps_existing_key() {
        let db = Database::open_in_memory().unwrap();

        assert!(seed_api_key(&db, &SecretString::from("pk-config")).unwrap());
        assert!(!seed_api_key(&db, &SecretString::from("pk-other")).unwrap());
        assert_eq!(
            credential_repo::get_api_key(&db).unwrap().as_deref(),
            Some("pk-config")
        );
    }
}
