//! In-memory PowerDNS-Admin used by lifecycle and apply tests.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;
use rootcause::{Report, bail};
use secrecy::SecretString;

use super::{
    Account, AccountChanges, AccountId, ApiKey, ApiKeyId, ApiKeySettings, CreatedApiKey, Member,
    NewAccount, NewUser, PowerDnsAdmin, User, UserChanges, UserId,
};

#[derive(Default)]
pub struct FakeServer {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    accounts: Vec<Account>,
    users: Vec<User>,
    /// (account id, user id)
    links: BTreeSet<(i64, i64)>,
    zones: Vec<Member>,
    apikeys: Vec<ApiKey>,
    calls: Vec<String>,
}

impl Inner {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn zone_members(&self, names: &[String]) -> Result<Vec<Member>, Report> {
        names
            .iter()
            .map(|name| match self.zones.iter().find(|z| &z.name == name) {
                Some(zone) => Ok(zone.clone()),
                None => bail!("zone '{name}' does not exist"),
            })
            .collect()
    }

    fn user_with_accounts(&self, user: &User) -> User {
        let mut user = user.clone();
        user.accounts = self
            .accounts
            .iter()
            .filter(|a| self.links.contains(&(a.id.0, user.id.0)))
            .map(|a| Member {
                id: a.id.0,
                name: a.name.clone(),
            })
            .collect();
        user
    }
}

impl FakeServer {
    pub fn with_zones(names: &[&str]) -> Self {
        let server = Self::default();
        {
            let mut inner = server.lock();
            for name in names {
                let id = inner.id();
                inner.zones.push(Member {
                    id,
                    name: name.to_string(),
                });
            }
        }
        server
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    /// Every mutating call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn account_names(&self) -> Vec<String> {
        self.lock().accounts.iter().map(|a| a.name.clone()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    pub fn apikey_count(&self) -> usize {
        self.lock().apikeys.len()
    }
}

#[async_trait]
impl PowerDnsAdmin for FakeServer {
    async fn list_accounts(&self) -> Result<Vec<Account>, Report> {
        Ok(self.lock().accounts.clone())
    }

    async fn get_account(&self, name: &str) -> Result<Option<Account>, Report> {
        Ok(self.lock().accounts.iter().find(|a| a.name == name).cloned())
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, Report> {
        self.record(format!("create_account {}", account.name));
        let mut inner = self.lock();
        if inner.accounts.iter().any(|a| a.name == account.name) {
            bail!("account '{}' already exists", account.name);
        }
        let created = Account {
            id: AccountId(inner.id()),
            name: account.name.clone(),
            description: account.description.clone(),
            contact: account.contact.clone(),
            mail: account.mail.clone(),
        };
        inner.accounts.push(created.clone());
        Ok(created)
    }

    async fn update_account(&self, id: AccountId, changes: &AccountChanges) -> Result<(), Report> {
        self.record(format!("update_account {id}"));
        let mut inner = self.lock();
        let Some(account) = inner.accounts.iter_mut().find(|a| a.id == id) else {
            bail!("account {id} does not exist");
        };
        account.description = changes.description.clone();
        account.contact = changes.contact.clone();
        account.mail = changes.mail.clone();
        Ok(())
    }

    async fn delete_account(&self, id: AccountId) -> Result<(), Report> {
        self.record(format!("delete_account {id}"));
        let mut inner = self.lock();
        inner.accounts.retain(|a| a.id != id);
        inner.links.retain(|(account, _)| *account != id.0);
        Ok(())
    }

    async fn add_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report> {
        self.record(format!("add_account_user {account} {user}"));
        self.lock().links.insert((account.0, user.0));
        Ok(())
    }

    async fn remove_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report> {
        self.record(format!("remove_account_user {account} {user}"));
        self.lock().links.remove(&(account.0, user.0));
        Ok(())
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, Report> {
        let inner = self.lock();
        Ok(inner
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| inner.user_with_accounts(u)))
    }

    async fn create_user(&self, user: &NewUser) -> Result<User, Report> {
        self.record(format!("create_user {}", user.username));
        let mut inner = self.lock();
        if inner.users.iter().any(|u| u.username == user.username) {
            bail!("user '{}' already exists", user.username);
        }
        let created = User {
            id: UserId(inner.id()),
            username: user.username.clone(),
            firstname: user.firstname.clone(),
            lastname: user.lastname.clone(),
            email: user.email.clone(),
            role: user.role,
            accounts: Vec::new(),
        };
        inner.users.push(created.clone());
        Ok(created)
    }

    async fn update_user(&self, id: UserId, changes: &UserChanges) -> Result<(), Report> {
        self.record(format!("update_user {id}"));
        let mut inner = self.lock();
        let Some(user) = inner.users.iter_mut().find(|u| u.id == id) else {
            bail!("user {id} does not exist");
        };
        user.firstname = changes.firstname.clone();
        user.lastname = changes.lastname.clone();
        user.email = changes.email.clone();
        user.role = changes.role;
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<(), Report> {
        self.record(format!("delete_user {id}"));
        let mut inner = self.lock();
        inner.users.retain(|u| u.id != id);
        inner.links.retain(|(_, user)| *user != id.0);
        Ok(())
    }

    async fn list_zones(&self) -> Result<Vec<Member>, Report> {
        Ok(self.lock().zones.clone())
    }

    async fn get_apikey(&self, id: ApiKeyId) -> Result<Option<ApiKey>, Report> {
        Ok(self.lock().apikeys.iter().find(|k| k.id == id).cloned())
    }

    async fn create_apikey(&self, settings: &ApiKeySettings) -> Result<CreatedApiKey, Report> {
        self.record(format!("create_apikey {}", settings.description));
        let mut inner = self.lock();
        let domains = inner.zone_members(&settings.domains)?;
        let id = inner.id();
        let key = ApiKey {
            id: ApiKeyId(id),
            description: settings.description.clone(),
            role: settings.role,
            domains,
            hashed_key: Some(format!("hash-{id}")),
        };
        inner.apikeys.push(key.clone());
        Ok(CreatedApiKey {
            key,
            plain_key: SecretString::from(format!("plain-{id}")),
        })
    }

    async fn update_apikey(&self, id: ApiKeyId, settings: &ApiKeySettings) -> Result<(), Report> {
        self.record(format!("update_apikey {id}"));
        let mut inner = self.lock();
        let domains = inner.zone_members(&settings.domains)?;
        let Some(key) = inner.apikeys.iter_mut().find(|k| k.id == id) else {
            bail!("apikey {id} does not exist");
        };
        key.description = settings.description.clone();
        key.role = settings.role;
        key.domains = domains;
        Ok(())
    }

    async fn set_apikey_domains(&self, id: ApiKeyId, domains: &[String]) -> Result<(), Report> {
        self.record(format!("set_apikey_domains {id} [{}]", domains.join(",")));
        let mut inner = self.lock();
        let domains = inner.zone_members(domains)?;
        let Some(key) = inner.apikeys.iter_mut().find(|k| k.id == id) else {
            bail!("apikey {id} does not exist");
        };
        key.domains = domains;
        Ok(())
    }

    async fn delete_apikey(&self, id: ApiKeyId) -> Result<(), Report> {
        self.record(format!("delete_apikey {id}"));
        self.lock().apikeys.retain(|k| k.id != id);
        Ok(())
    }
}
