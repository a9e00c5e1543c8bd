use std::collections::BTreeSet;

use async_trait::async_trait;
use rootcause::prelude::ResultExt;
use rootcause::{Report, bail};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Applied, Kind, vanished};
use crate::api::{AccountId, Credential, DynApi, Member, NewUser, User, UserChanges, UserId};
use crate::reconcile::{self, Membership, match_candidates};
use crate::role::Role;
use crate::schema::{
    Fallback, Field, FieldKind, Record, Schema, canonical_role, email, equal_ignoring_case, role,
    starts_lowercase_alphanumeric,
};

pub static SCHEMA: Schema = Schema {
    kind: "user",
    fields: &[
        Field::required("username", FieldKind::String)
            .force_new()
            .validated_by(starts_lowercase_alphanumeric)
            .diff_suppressed_by(equal_ignoring_case),
        Field::optional("password", FieldKind::String),
        Field::optional("firstname", FieldKind::String),
        Field::optional("lastname", FieldKind::String),
        Field::optional("role", FieldKind::String)
            .with_fallback(Fallback::Str("User"))
            .validated_by(role)
            .normalized_by(canonical_role),
        Field::required("email", FieldKind::String).validated_by(email),
        Field::optional("accounts", FieldKind::StringSet),
        Field::optional("external", FieldKind::Bool).with_fallback(Fallback::Bool(false)),
        Field::computed("userid", FieldKind::Int),
    ],
};

const PROFILE_FIELDS: [&str; 4] = ["firstname", "lastname", "email", "role"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAttributes {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    pub role: String,
    pub email: String,
    #[serde(default)]
    pub accounts: BTreeSet<String>,
    #[serde(default)]
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userid: Option<i64>,
}

impl UserAttributes {
    fn role(&self) -> Result<Role, Report> {
        let role = self
            .role
            .parse::<Role>()
            .context("Invalid user role")
            .attach(format!("username: '{}'", self.username))?;
        Ok(role)
    }

    fn credential(&self) -> Result<Credential, Report> {
        if self.external {
            return Ok(Credential::External);
        }
        match &self.password {
            Some(password) if !password.is_empty() => {
                Ok(Credential::Password(SecretString::from(password.clone())))
            }
            _ => bail!(
                "User '{}' must have a password unless it is external",
                self.username
            ),
        }
    }
}

/// Account memberships of one user.
pub struct UserAccounts<'a> {
    api: &'a DynApi,
    username: &'a str,
    user_id: UserId,
}

impl<'a> UserAccounts<'a> {
    pub fn new(api: &'a DynApi, username: &'a str, user_id: UserId) -> Self {
        Self {
            api,
            username,
            user_id,
        }
    }
}

#[async_trait]
impl Membership for UserAccounts<'_> {
    fn owner(&self) -> &str {
        self.username
    }

    async fn candidates(&self) -> Result<Vec<Member>, Report> {
        account_members(self.api).await
    }

    async fn observed(&self) -> Result<Vec<Member>, Report> {
        match self.api.get_user(self.username).await? {
            Some(user) => Ok(user.accounts),
            None => bail!("User '{}' no longer exists", self.username),
        }
    }

    async fn add(&mut self, member: &Member) -> Result<(), Report> {
        self.api
            .add_account_user(AccountId(member.id), self.user_id)
            .await
    }

    async fn remove(&mut self, member: &Member) -> Result<(), Report> {
        self.api
            .remove_account_user(AccountId(member.id), self.user_id)
            .await
    }
}

pub async fn create(api: &DynApi, desired: &Record) -> Result<Applied, Report> {
    let attributes: UserAttributes = SCHEMA.decode(desired)?;
    let new_user = NewUser {
        username: attributes.username.clone(),
        firstname: attributes.firstname.clone(),
        lastname: attributes.lastname.clone(),
        email: attributes.email.clone(),
        role: attributes.role()?,
        credential: attributes.credential()?,
    };
    // Unknown account names must fail before the user exists.
    let accounts = resolve_accounts(api, &attributes).await?;
    info!(username = %attributes.username, "creating user");

    let created = api
        .create_user(&new_user)
        .await
        .context("Couldn't create user")
        .attach(format!("username: '{}'", attributes.username))?;

    let mut memberships = UserAccounts::new(api, &created.username, created.id);
    for account in &accounts {
        memberships
            .add(account)
            .await
            .context("Couldn't link user to its accounts")
            .attach(format!("username: '{}'", created.username))
            .attach(format!("account: '{account}'"))?;
    }

    let attributes = read(api, &created.username, desired)
        .await?
        .ok_or_else(|| vanished(Kind::User, &created.username))?;

    Ok(Applied {
        id: created.username,
        attributes,
    })
}

pub async fn read(api: &DynApi, username: &str, prior: &Record) -> Result<Option<Record>, Report> {
    let Some(user) = fetch(api, username).await? else {
        return Ok(None);
    };
    let prior: Option<UserAttributes> = SCHEMA.decode(prior).ok();
    SCHEMA.encode(&attributes_of(user, prior.as_ref())).map(Some)
}

pub async fn update(
    api: &DynApi,
    username: &str,
    prior: &Record,
    desired: &Record,
) -> Result<Record, Report> {
    let attributes: UserAttributes = SCHEMA.decode(desired)?;
    let changed = SCHEMA.changed_fields(prior, desired);

    if changed.iter().any(|f| PROFILE_FIELDS.contains(f)) {
        let user = fetch(api, username)
            .await?
            .ok_or_else(|| vanished(Kind::User, username))?;
        info!(username = %username, changed = ?changed, "updating user");

        api.update_user(
            user.id,
            &UserChanges {
                firstname: attributes.firstname.clone(),
                lastname: attributes.lastname.clone(),
                email: attributes.email.clone(),
                role: attributes.role()?,
            },
        )
        .await
        .context("Couldn't update user")
        .attach(format!("username: '{username}'"))?;
    }

    if changed.contains(&"accounts") {
        let user = fetch(api, username)
            .await?
            .ok_or_else(|| vanished(Kind::User, username))?;
        let mut memberships = UserAccounts::new(api, username, user.id);
        reconcile::reconcile(&mut memberships, &attributes.accounts, &user.accounts)
            .await
            .context("Couldn't update user account links")?;
    }

    read(api, username, desired)
        .await?
        .ok_or_else(|| vanished(Kind::User, username))
}

pub async fn delete(api: &DynApi, username: &str) -> Result<(), Report> {
    let Some(user) = fetch(api, username).await? else {
        warn!(username = %username, "user already gone");
        return Ok(());
    };

    info!(username = %username, id = %user.id, "deleting user");
    api.delete_user(user.id)
        .await
        .context("Couldn't delete user")
        .attach(format!("username: '{username}'"))?;
    Ok(())
}

async fn account_members(api: &DynApi) -> Result<Vec<Member>, Report> {
    let accounts = api.list_accounts().await?;
    Ok(accounts
        .into_iter()
        .map(|a| Member {
            id: a.id.0,
            name: a.name,
        })
        .collect())
}

async fn resolve_accounts(api: &DynApi, attributes: &UserAttributes) -> Result<Vec<Member>, Report> {
    if attributes.accounts.is_empty() {
        return Ok(Vec::new());
    }
    let candidates = account_members(api)
        .await
        .context("Couldn't list accounts")?;
    let names: Vec<String> = attributes.accounts.iter().cloned().collect();
    let resolved = match_candidates(candidates, &names)
        .context("Cannot resolve user accounts")
        .attach(format!("username: '{}'", attributes.username))?;
    Ok(resolved)
}

async fn fetch(api: &DynApi, username: &str) -> Result<Option<User>, Report> {
    let user = api
        .get_user(username)
        .await
        .context("Couldn't fetch user")
        .attach(format!("username: '{username}'"))?;
    Ok(user)
}

/// The server never returns passwords; those and `external` carry over from
/// `prior`.
fn attributes_of(user: User, prior: Option<&UserAttributes>) -> UserAttributes {
    UserAttributes {
        username: user.username,
        password: prior.and_then(|p| p.password.clone()),
        firstname: user.firstname,
        lastname: user.lastname,
        role: user.role.to_string(),
        email: user.email,
        accounts: user.accounts.into_iter().map(|a| a.name).collect(),
        external: prior.is_some_and(|p| p.external),
        userid: Some(user.id.0),
    }
}
