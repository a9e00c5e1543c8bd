use std::collections::BTreeSet;

use async_trait::async_trait;
use rootcause::Report;
use rootcause::prelude::ResultExt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Applied, Kind, vanished};
use crate::api::{ApiKey, ApiKeyId, ApiKeySettings, DynApi, Member};
use crate::reconcile::{self, Membership, constrain_to_role, match_candidates};
use crate::role::Role;
use crate::schema::{Field, FieldKind, Record, Schema, canonical_role, role};

pub static SCHEMA: Schema = Schema {
    kind: "apikey",
    fields: &[
        Field::optional("description", FieldKind::String),
        Field::required("role", FieldKind::String)
            .validated_by(role)
            .normalized_by(canonical_role),
        Field::optional("domains", FieldKind::StringSet),
        Field::computed("plain_text_key", FieldKind::String),
        Field::computed("hashed_key", FieldKind::String),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyAttributes {
    #[serde(default)]
    pub description: String,
    pub role: String,
    #[serde(default)]
    pub domains: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_text_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_key: Option<String>,
}

impl ApiKeyAttributes {
    fn role(&self) -> Result<Role, Report> {
        let role = self.role.parse::<Role>().context("Invalid API key role")?;
        Ok(role)
    }

    /// Role and the domain set it allows, checked before any remote call.
    fn constrained(&self) -> Result<(Role, BTreeSet<String>), Report> {
        let role = self.role()?;
        let domains = constrain_to_role(role, self.domains.clone())
            .context("Invalid API key domains")?;
        Ok((role, domains))
    }
}

/// Domains an API key is scoped to.
///
/// The server only accepts the complete domain list, so every association
/// change writes the working list with that one domain added or removed.
pub struct ApiKeyDomains<'a> {
    api: &'a DynApi,
    id: ApiKeyId,
    label: String,
    current: Vec<String>,
}

impl<'a> ApiKeyDomains<'a> {
    pub fn new(api: &'a DynApi, key: &ApiKey) -> Self {
        Self {
            api,
            id: key.id,
            label: key.id.to_string(),
            current: key.domains.iter().map(|d| d.name.clone()).collect(),
        }
    }

    async fn write(&mut self, domains: Vec<String>) -> Result<(), Report> {
        self.api.set_apikey_domains(self.id, &domains).await?;
        self.current = domains;
        Ok(())
    }
}

#[async_trait]
impl Membership for ApiKeyDomains<'_> {
    fn owner(&self) -> &str {
        &self.label
    }

    async fn candidates(&self) -> Result<Vec<Member>, Report> {
        self.api.list_zones().await
    }

    async fn observed(&self) -> Result<Vec<Member>, Report> {
        let key = self
            .api
            .get_apikey(self.id)
            .await?
            .ok_or_else(|| vanished(Kind::Apikey, &self.label))?;
        Ok(key.domains)
    }

    async fn add(&mut self, member: &Member) -> Result<(), Report> {
        let mut domains = self.current.clone();
        domains.push(member.name.clone());
        self.write(domains).await
    }

    async fn remove(&mut self, member: &Member) -> Result<(), Report> {
        let domains = self
            .current
            .iter()
            .filter(|d| **d != member.name)
            .cloned()
            .collect();
        self.write(domains).await
    }
}

pub async fn create(api: &DynApi, desired: &Record) -> Result<Applied, Report> {
    let attributes: ApiKeyAttributes = SCHEMA.decode(desired)?;
    let (role, domains) = attributes.constrained()?;
    let domains = resolve_domains(api, &domains).await?;
    info!(%role, domains = ?domains, "creating API key");

    let created = api
        .create_apikey(&ApiKeySettings {
            description: attributes.description.clone(),
            role,
            domains,
        })
        .await
        .context("Couldn't create API key")?;

    let id = created.key.id.to_string();
    let mut prior = desired.clone();
    prior.insert(
        "plain_text_key".to_string(),
        created.plain_key.expose_secret().into(),
    );

    let attributes = read(api, &id, &prior)
        .await?
        .ok_or_else(|| vanished(Kind::Apikey, &id))?;

    Ok(Applied { id, attributes })
}

pub async fn read(api: &DynApi, id: &str, prior: &Record) -> Result<Option<Record>, Report> {
    let Some(key) = fetch(api, id).await? else {
        return Ok(None);
    };
    let prior: Option<ApiKeyAttributes> = SCHEMA.decode(prior).ok();

    // Domains only matter for domain-scoped keys; other roles keep what was
    // configured so the ignored setting does not show up as drift.
    let domains = match key.role {
        Role::User => key.domains.into_iter().map(|d| d.name).collect(),
        Role::Administrator | Role::Operator => {
            prior.as_ref().map(|p| p.domains.clone()).unwrap_or_default()
        }
    };

    SCHEMA
        .encode(&ApiKeyAttributes {
            description: key.description,
            role: key.role.to_string(),
            domains,
            plain_text_key: prior.and_then(|p| p.plain_text_key),
            hashed_key: key.hashed_key,
        })
        .map(Some)
}

pub async fn update(
    api: &DynApi,
    id: &str,
    prior: &Record,
    desired: &Record,
) -> Result<Record, Report> {
    let attributes: ApiKeyAttributes = SCHEMA.decode(desired)?;
    let (role, domains) = attributes.constrained()?;
    let changed = SCHEMA.changed_fields(prior, desired);

    if changed.iter().any(|f| matches!(*f, "description" | "role")) {
        let key_id = parse_id(id)?;
        let domains = resolve_domains(api, &domains).await?;
        info!(apikey = %id, changed = ?changed, "updating API key");

        api.update_apikey(
            key_id,
            &ApiKeySettings {
                description: attributes.description.clone(),
                role,
                domains,
            },
        )
        .await
        .context("Couldn't update API key")
        .attach(format!("apikey: '{id}'"))?;
    } else if changed.contains(&"domains") {
        let key = fetch(api, id)
            .await?
            .ok_or_else(|| vanished(Kind::Apikey, id))?;
        let mut scoped = ApiKeyDomains::new(api, &key);
        reconcile::converge_for_role(&mut scoped, role, attributes.domains.clone())
            .await
            .context("Couldn't update API key domains")?;
    }

    // Carry the one-time plain key over from the previous state.
    let mut carried = desired.clone();
    if let Some(plain) = prior.get("plain_text_key") {
        carried.insert("plain_text_key".to_string(), plain.clone());
    }
    read(api, id, &carried)
        .await?
        .ok_or_else(|| vanished(Kind::Apikey, id))
}

pub async fn delete(api: &DynApi, id: &str) -> Result<(), Report> {
    let key_id = parse_id(id)?;
    if fetch(api, id).await?.is_none() {
        warn!(apikey = %id, "API key already gone");
        return Ok(());
    }

    info!(apikey = %id, "deleting API key");
    api.delete_apikey(key_id)
        .await
        .context("Couldn't delete API key")
        .attach(format!("apikey: '{id}'"))?;
    Ok(())
}

fn parse_id(id: &str) -> Result<ApiKeyId, Report> {
    let id = id
        .parse::<i64>()
        .context("API key id is not numeric")
        .attach(format!("apikey: '{id}'"))?;
    Ok(ApiKeyId(id))
}

async fn fetch(api: &DynApi, id: &str) -> Result<Option<ApiKey>, Report> {
    let key = api
        .get_apikey(parse_id(id)?)
        .await
        .context("Couldn't fetch API key")
        .attach(format!("apikey: '{id}'"))?;
    Ok(key)
}

/// Checks every domain against the zone listing; unknown names fail the call.
async fn resolve_domains(api: &DynApi, domains: &BTreeSet<String>) -> Result<Vec<String>, Report> {
    if domains.is_empty() {
        return Ok(Vec::new());
    }
    let zones = api.list_zones().await.context("Couldn't list zones")?;
    let names: Vec<String> = domains.iter().cloned().collect();
    let resolved = match_candidates(zones, &names).context("Cannot resolve API key domains")?;
    Ok(resolved.into_iter().map(|zone| zone.name).collect())
}
