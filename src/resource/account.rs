use rootcause::Report;
use rootcause::prelude::ResultExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Applied, Kind, vanished};
use crate::api::{Account, AccountChanges, DynApi, NewAccount};
use crate::schema::{
    Field, FieldKind, Record, Schema, email, equal_ignoring_case, starts_lowercase_alphanumeric,
};

pub static SCHEMA: Schema = Schema {
    kind: "account",
    fields: &[
        Field::required("name", FieldKind::String)
            .force_new()
            .validated_by(starts_lowercase_alphanumeric)
            .diff_suppressed_by(equal_ignoring_case),
        Field::optional("description", FieldKind::String),
        Field::optional("contact_name", FieldKind::String),
        Field::optional("contact_email", FieldKind::String).validated_by(email),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAttributes {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contact_name: String,
    #[serde(default)]
    pub contact_email: String,
}

impl From<Account> for AccountAttributes {
    fn from(account: Account) -> Self {
        Self {
            name: account.name,
            description: account.description,
            contact_name: account.contact,
            contact_email: account.mail,
        }
    }
}

pub async fn create(api: &DynApi, desired: &Record) -> Result<Applied, Report> {
    let attributes: AccountAttributes = SCHEMA.decode(desired)?;
    info!(account = %attributes.name, "creating account");

    let created = api
        .create_account(&NewAccount {
            name: attributes.name.clone(),
            description: attributes.description,
            contact: attributes.contact_name,
            mail: attributes.contact_email,
        })
        .await
        .context("Couldn't create account")
        .attach(format!("account: '{}'", attributes.name))?;

    let attributes = read(api, &created.name)
        .await?
        .ok_or_else(|| vanished(Kind::Account, &created.name))?;

    Ok(Applied {
        id: created.name,
        attributes,
    })
}

pub async fn read(api: &DynApi, name: &str) -> Result<Option<Record>, Report> {
    let Some(account) = api
        .get_account(name)
        .await
        .context("Couldn't fetch account")
        .attach(format!("account: '{name}'"))?
    else {
        return Ok(None);
    };
    SCHEMA.encode(&AccountAttributes::from(account)).map(Some)
}

pub async fn update(
    api: &DynApi,
    name: &str,
    prior: &Record,
    desired: &Record,
) -> Result<Record, Report> {
    let changed = SCHEMA.changed_fields(prior, desired);
    if changed
        .iter()
        .any(|f| matches!(*f, "description" | "contact_name" | "contact_email"))
    {
        let attributes: AccountAttributes = SCHEMA.decode(desired)?;
        let account = lookup(api, name).await?;
        info!(account = %name, changed = ?changed, "updating account");

        api.update_account(
            account.id,
            &AccountChanges {
                description: attributes.description,
                contact: attributes.contact_name,
                mail: attributes.contact_email,
            },
        )
        .await
        .context("Couldn't update account")
        .attach(format!("account: '{name}'"))?;
    }

    read(api, name)
        .await?
        .ok_or_else(|| vanished(Kind::Account, name))
}

pub async fn delete(api: &DynApi, name: &str) -> Result<(), Report> {
    let Some(account) = api
        .get_account(name)
        .await
        .context("Couldn't fetch account")
        .attach(format!("account: '{name}'"))?
    else {
        warn!(account = %name, "account already gone");
        return Ok(());
    };

    info!(account = %name, id = %account.id, "deleting account");
    api.delete_account(account.id)
        .await
        .context("Couldn't delete account")
        .attach(format!("account: '{name}'"))?;
    Ok(())
}

/// The API addresses accounts by numeric id for writes but by name for reads.
async fn lookup(api: &DynApi, name: &str) -> Result<Account, Report> {
    api.get_account(name)
        .await
        .context("Couldn't fetch account")
        .attach(format!("account: '{name}'"))?
        .ok_or_else(|| vanished(Kind::Account, name))
}
