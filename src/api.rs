use async_trait::async_trait;
use derive_more::Display;
use rootcause::Report;
use secrecy::SecretString;

use crate::role::Role;

#[cfg(test)]
pub mod fake;
pub mod http;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct AccountId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct ApiKeyId(pub i64);

/// The far side of an association: an account a user belongs to, or a zone
/// an API key is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{name} ({id})")]
pub struct Member {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub description: String,
    pub contact: String,
    pub mail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub name: String,
    pub description: String,
    pub contact: String,
    pub mail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountChanges {
    pub description: String,
    pub contact: String,
    pub mail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub role: Role,
    pub accounts: Vec<Member>,
}

/// How a new user authenticates.
#[derive(Debug, Clone)]
pub enum Credential {
    Password(SecretString),
    /// Authenticated by an external directory; the server stores a placeholder.
    External,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub role: Role,
    pub credential: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserChanges {
    pub firstname: String,
    pub lastname: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub description: String,
    pub role: Role,
    pub domains: Vec<Member>,
    pub hashed_key: Option<String>,
}

/// Body of both API key creation and update; the server replaces the domain
/// list wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeySettings {
    pub description: String,
    pub role: Role,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub key: ApiKey,
    pub plain_key: SecretString,
}

/// Typed operations of the PowerDNS-Admin REST API.
///
/// Lookups return `Ok(None)` when the server reports the object as missing.
#[async_trait]
pub trait PowerDnsAdmin {
    async fn list_accounts(&self) -> Result<Vec<Account>, Report>;
    async fn get_account(&self, name: &str) -> Result<Option<Account>, Report>;
    async fn create_account(&self, account: &NewAccount) -> Result<Account, Report>;
    async fn update_account(&self, id: AccountId, changes: &AccountChanges)
    -> Result<(), Report>;
    async fn delete_account(&self, id: AccountId) -> Result<(), Report>;
    async fn add_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report>;
    async fn remove_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report>;

    async fn get_user(&self, username: &str) -> Result<Option<User>, Report>;
    async fn create_user(&self, user: &NewUser) -> Result<User, Report>;
    async fn update_user(&self, id: UserId, changes: &UserChanges) -> Result<(), Report>;
    async fn delete_user(&self, id: UserId) -> Result<(), Report>;

    async fn list_zones(&self) -> Result<Vec<Member>, Report>;
    async fn get_apikey(&self, id: ApiKeyId) -> Result<Option<ApiKey>, Report>;
    async fn create_apikey(&self, settings: &ApiKeySettings) -> Result<CreatedApiKey, Report>;
    async fn update_apikey(&self, id: ApiKeyId, settings: &ApiKeySettings)
    -> Result<(), Report>;
    /// Replaces only the domain list, leaving description and role untouched.
    async fn set_apikey_domains(&self, id: ApiKeyId, domains: &[String]) -> Result<(), Report>;
    async fn delete_apikey(&self, id: ApiKeyId) -> Result<(), Report>;
}

pub type DynApi = dyn PowerDnsAdmin + Send + Sync;
