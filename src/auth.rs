//! Local, device-only accounts.
//!
//! Accounts live under one storage key as a list of users with their Argon2
//! password hashes. The signed-in user is persisted separately so a session
//! survives restarts.

use crate::{
    config::storage_keys,
    crypto,
    error::AuthError,
    models::{User, UserPatch},
    store::{get_json, now, set_json, KeyValueStore, Lookup},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MIN_NAME_LEN: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredAccount {
    user: User,
    /// Argon2 PHC string.
    password_hash: String,
}

pub struct LocalAuth {
    store: Arc<dyn KeyValueStore>,
    write_guard: Mutex<()>,
}

impl LocalAuth {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_guard: Mutex::new(()),
        }
    }

    pub async fn current_user(&self) -> Option<User> {
        get_json::<User>(self.store.as_ref(), storage_keys::USER_SESSION)
            .await
            .into_option()
    }

    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<User, AuthError> {
        let email = normalize_email(email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword(MIN_PASSWORD_LEN));
        }
        let name = name.trim();
        if name.chars().count() < MIN_NAME_LEN {
            return Err(AuthError::InvalidName(MIN_NAME_LEN));
        }

        let _guard = self.write_guard.lock().await;
        let mut accounts = self.accounts().await?;
        if accounts.iter().any(|account| account.user.email == email) {
            return Err(AuthError::AlreadyRegistered);
        }

        let password_hash = hash_off_thread(password.to_string()).await?;
        let timestamp = now();
        let user = User {
            id: format!("user_{}", Uuid::new_v4().simple()),
            email,
            name: name.to_string(),
            created_at: timestamp.clone(),
            last_login_at: timestamp,
        };
        accounts.push(StoredAccount {
            user: user.clone(),
            password_hash,
        });
        set_json(self.store.as_ref(), storage_keys::USER_ACCOUNTS, &accounts).await?;
        set_json(self.store.as_ref(), storage_keys::USER_SESSION, &user).await?;
        log::info!("[auth] Registered {}", user.id);
        Ok(user)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;

        let _guard = self.write_guard.lock().await;
        let mut accounts = self.accounts().await?;
        let Some(index) = accounts
            .iter()
            .position(|account| account.user.email == email)
        else {
            return Err(AuthError::InvalidCredentials);
        };

        let account = &accounts[index];
        let verified =
            verify_off_thread(password.to_string(), account.password_hash.clone()).await?;
        if !verified {
            log::warn!("[auth] Rejected sign-in for {}", account.user.id);
            return Err(AuthError::InvalidCredentials);
        }

        accounts[index].user.last_login_at = now();
        let user = accounts[index].user.clone();
        set_json(self.store.as_ref(), storage_keys::USER_ACCOUNTS, &accounts).await?;
        set_json(self.store.as_ref(), storage_keys::USER_SESSION, &user).await?;
        log::info!("[auth] Signed in {}", user.id);
        Ok(user)
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        self.store.remove(storage_keys::USER_SESSION).await?;
        Ok(())
    }

    /// Applies `patch` to the signed-in user. Id and creation time never change.
    pub async fn update_profile(&self, patch: &UserPatch) -> Result<User, AuthError> {
        let _guard = self.write_guard.lock().await;
        let mut user = self.current_user().await.ok_or(AuthError::NotSignedIn)?;
        let mut accounts = self.accounts().await?;

        if let Some(name) = patch.name.as_deref() {
            let name = name.trim();
            if name.chars().count() < MIN_NAME_LEN {
                return Err(AuthError::InvalidName(MIN_NAME_LEN));
            }
            user.name = name.to_string();
        }
        if let Some(email) = patch.email.as_deref() {
            let email = normalize_email(email)?;
            let taken = accounts
                .iter()
                .any(|account| account.user.email == email && account.user.id != user.id);
            if taken {
                return Err(AuthError::AlreadyRegistered);
            }
            user.email = email;
        }

        if let Some(account) = accounts
            .iter_mut()
            .find(|account| account.user.id == user.id)
        {
            account.user = user.clone();
            set_json(self.store.as_ref(), storage_keys::USER_ACCOUNTS, &accounts).await?;
        }
        set_json(self.store.as_ref(), storage_keys::USER_SESSION, &user).await?;
        Ok(user)
    }

    /// Erases every stored key, not only the account records.
    pub async fn delete_account(&self) -> Result<(), AuthError> {
        let _guard = self.write_guard.lock().await;
        self.store.clear().await?;
        log::info!("[auth] Local data wiped");
        Ok(())
    }

    /// Every caller writes the list back, so an unusable list is an error
    /// rather than an empty one.
    async fn accounts(&self) -> Result<Vec<StoredAccount>, AuthError> {
        match get_json::<Vec<StoredAccount>>(self.store.as_ref(), storage_keys::USER_ACCOUNTS).await
        {
            Lookup::Found(accounts) => Ok(accounts),
            Lookup::Absent => Ok(Vec::new()),
            Lookup::Corrupt(reason) | Lookup::Unreadable(reason) => {
                log::error!("[auth] Account list unusable: {}", reason);
                Err(AuthError::AccountsUnreadable(reason))
            }
        }
    }
}

fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(AuthError::InvalidEmail);
    }
    Ok(email)
}

async fn hash_off_thread(password: String) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || crypto::hash_password(&password))
        .await
        .map_err(|error| AuthError::Crypto(error.to_string()))?
        .map_err(|error| AuthError::Crypto(error.to_string()))
}

async fn verify_off_thread(password: String, password_hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || crypto::verify_password(&password, &password_hash))
        .await
        .map_err(|error| AuthError::Crypto(error.to_string()))?
        .map_err(|error| AuthError::Crypto(error.to_string()))
}
