use std::str::FromStr;

use derive_more::Display;
use rootcause::{Report, bail, report};
use serde::{Deserialize, Serialize};

use crate::api::DynApi;
use crate::schema::{Record, Schema};

pub mod account;
pub mod apikey;
pub mod user;

/// Resource kinds, in the order they depend on each other.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[display("account")]
    Account,
    #[display("user")]
    User,
    #[display("apikey")]
    Apikey,
}

impl FromStr for Kind {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(Self::Account),
            "user" => Ok(Self::User),
            "apikey" => Ok(Self::Apikey),
            _ => bail!("'{s}' is not a resource kind, expected 'account', 'user' or 'apikey'"),
        }
    }
}

/// Server id and attributes of a resource after a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub id: String,
    pub attributes: Record,
}

impl Kind {
    pub fn schema(self) -> &'static Schema {
        match self {
            Self::Account => &account::SCHEMA,
            Self::User => &user::SCHEMA,
            Self::Apikey => &apikey::SCHEMA,
        }
    }

    pub async fn create(self, api: &DynApi, desired: &Record) -> Result<Applied, Report> {
        match self {
            Self::Account => account::create(api, desired).await,
            Self::User => user::create(api, desired).await,
            Self::Apikey => apikey::create(api, desired).await,
        }
    }

    /// Current attributes, or `None` when the resource no longer exists.
    ///
    /// `prior` supplies attributes the server never returns.
    pub async fn read(self, api: &DynApi, id: &str, prior: &Record) -> Result<Option<Record>, Report> {
        match self {
            Self::Account => account::read(api, id).await,
            Self::User => user::read(api, id, prior).await,
            Self::Apikey => apikey::read(api, id, prior).await,
        }
    }

    pub async fn update(
        self,
        api: &DynApi,
        id: &str,
        prior: &Record,
        desired: &Record,
    ) -> Result<Record, Report> {
        match self {
            Self::Account => account::update(api, id, prior, desired).await,
            Self::User => user::update(api, id, prior, desired).await,
            Self::Apikey => apikey::update(api, id, prior, desired).await,
        }
    }

    pub async fn delete(self, api: &DynApi, id: &str) -> Result<(), Report> {
        match self {
            Self::Account => account::delete(api, id).await,
            Self::User => user::delete(api, id).await,
            Self::Apikey => apikey::delete(api, id).await,
        }
    }
}

/// Error for a resource that vanished right after being written.
fn vanished(kind: Kind, id: &str) -> Report {
    report!("The {kind} disappeared right after being written").attach(format!("id: '{id}'"))
}
