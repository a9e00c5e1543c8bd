use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use rootcause::prelude::ResultExt;
use rootcause::{Report, report};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    Account, AccountChanges, AccountId, ApiKey, ApiKeyId, ApiKeySettings, CreatedApiKey,
    Credential, Member, NewAccount, NewUser, PowerDnsAdmin, User, UserChanges, UserId,
};
use crate::config::{Config, Scheme};
use crate::role::Role;

/// Placeholder password the server expects for externally authenticated users.
const EXTERNAL_PASSWORD: &str = "*";

pub struct HttpClient {
    base_url: Url,
    user: String,
    password: SecretString,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, Report> {
        let base_url = Url::parse(&config.base_url())
            .context("Invalid PowerDNS-Admin address")
            .attach(format!("host: '{}'", config.host))?;
        if base_url.cannot_be_a_base() {
            return Err(report!("PowerDNS-Admin address cannot carry a path")
                .attach(format!("host: '{}'", config.host)));
        }

        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if config.scheme == Scheme::Https {
            if let Some(pem) = config.ca_certificate_pem()? {
                let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                    .context("Parsing CA certificate")?;
                builder = builder.add_root_certificate(certificate);
            }
            builder = builder.danger_accept_invalid_certs(config.insecure_https);
        }

        let client = builder.build().context("Building HTTP client")?;

        info!(host = %config.host, "PowerDNS-Admin client configured");

        Ok(Self {
            base_url,
            user: config.user.clone(),
            password: config.password.clone(),
            client,
        })
    }

    /// `segments` are percent-encoded one by one, so names may contain `/`
    /// or `?`.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("pdnsadmin").extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!(%method, %url, "PowerDNS-Admin request");
        self.client
            .request(method, url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
    }

    async fn dispatch(&self, request: RequestBuilder, path: &str) -> Result<Response, Report> {
        let response = request
            .send()
            .await
            .context("Sending request to PowerDNS-Admin")
            .attach(format!("path: '{path}'"))?;
        Ok(response)
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> Result<Response, Report> {
        let response = self.dispatch(request, path).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(rejected(response, path).await)
    }

    async fn fetch<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, Report> {
        let path = segments.join("/");
        let body = self
            .send(self.request(Method::GET, segments), &path)
            .await?
            .json::<T>()
            .await
            .context("Parsing PowerDNS-Admin response")
            .attach(format!("path: '{path}'"))?;
        Ok(body)
    }

    /// Fetches a single object, mapping 404 to `None`.
    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<Option<T>, Report> {
        let path = segments.join("/");
        let response = self
            .dispatch(self.request(Method::GET, segments), &path)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, "object not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(rejected(response, &path).await);
        }

        let body = response
            .json::<OneOrMany<T>>()
            .await
            .context("Parsing PowerDNS-Admin response")
            .attach(format!("path: '{path}'"))?;
        Ok(body.into_first())
    }

    async fn submit<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: &B,
    ) -> Result<T, Report> {
        let path = segments.join("/");
        let body = self
            .send(self.request(method, segments).json(body), &path)
            .await?
            .json::<OneOrMany<T>>()
            .await
            .context("Parsing PowerDNS-Admin response")
            .attach(format!("path: '{path}'"))?;

        body.into_first()
            .ok_or_else(|| report!("PowerDNS-Admin returned an empty response"))
            .attach(format!("path: '{path}'"))
    }

    async fn submit_empty<B: Serialize + Sync>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<(), Report> {
        let path = segments.join("/");
        let mut request = self.request(method, segments);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request, &path).await?;
        Ok(())
    }
}

/// Error for a non-2xx answer, carrying the status and the response body.
async fn rejected(response: Response, path: &str) -> Report {
    report!("PowerDNS-Admin rejected the request")
        .attach(format!("path: '{path}'"))
        .attach(format!("status: {}", response.status()))
        .attach(format!(
            "response: {:?}",
            response
                .text()
                .await
                .unwrap_or("<Response reading failed>".to_string())
        ))
}

#[async_trait]
impl PowerDnsAdmin for HttpClient {
    async fn list_accounts(&self) -> Result<Vec<Account>, Report> {
        let accounts = self.fetch::<Vec<AccountWire>>(&["accounts"]).await?;
        Ok(accounts.into_iter().map(Account::from).collect())
    }

    async fn get_account(&self, name: &str) -> Result<Option<Account>, Report> {
        let account = self
            .fetch_optional::<AccountWire>(&["accounts", name])
            .await?;
        Ok(account.map(Account::from))
    }

    async fn create_account(&self, account: &NewAccount) -> Result<Account, Report> {
        let body = AccountBody {
            name: Some(&account.name),
            description: &account.description,
            contact: &account.contact,
            mail: &account.mail,
        };
        let created = self
            .submit::<_, AccountWire>(Method::POST, &["accounts"], &body)
            .await
            .attach(format!("account: '{}'", account.name))?;
        Ok(created.into())
    }

    async fn update_account(&self, id: AccountId, changes: &AccountChanges) -> Result<(), Report> {
        let body = AccountBody {
            name: None,
            description: &changes.description,
            contact: &changes.contact,
            mail: &changes.mail,
        };
        self.submit_empty(Method::PUT, &["accounts", &id.to_string()], Some(&body))
            .await
    }

    async fn delete_account(&self, id: AccountId) -> Result<(), Report> {
        self.submit_empty::<()>(Method::DELETE, &["accounts", &id.to_string()], None)
            .await
    }

    async fn add_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report> {
        self.submit_empty::<()>(
            Method::PUT,
            &["accounts", "users", &account.to_string(), &user.to_string()],
            None,
        )
        .await
    }

    async fn remove_account_user(&self, account: AccountId, user: UserId) -> Result<(), Report> {
        self.submit_empty::<()>(
            Method::DELETE,
            &["accounts", "users", &account.to_string(), &user.to_string()],
            None,
        )
        .await
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>, Report> {
        self.fetch_optional::<UserWire>(&["users", username])
            .await?
            .map(User::try_from)
            .transpose()
    }

    async fn create_user(&self, user: &NewUser) -> Result<User, Report> {
        let (password, plain_text_password) = match &user.credential {
            Credential::External => (Some(EXTERNAL_PASSWORD), None),
            Credential::Password(secret) => (None, Some(secret.expose_secret())),
        };
        let body = UserBody {
            username: Some(&user.username),
            password,
            plain_text_password,
            firstname: &user.firstname,
            lastname: &user.lastname,
            email: &user.email,
            role_name: user.role.as_str(),
        };
        let created = self
            .submit::<_, UserWire>(Method::POST, &["users"], &body)
            .await
            .attach(format!("username: '{}'", user.username))?;
        created.try_into()
    }

    async fn update_user(&self, id: UserId, changes: &UserChanges) -> Result<(), Report> {
        let body = UserBody {
            username: None,
            password: None,
            plain_text_password: None,
            firstname: &changes.firstname,
            lastname: &changes.lastname,
            email: &changes.email,
            role_name: changes.role.as_str(),
        };
        self.submit_empty(Method::PUT, &["users", &id.to_string()], Some(&body))
            .await
    }

    async fn delete_user(&self, id: UserId) -> Result<(), Report> {
        self.submit_empty::<()>(Method::DELETE, &["users", &id.to_string()], None)
            .await
    }

    async fn list_zones(&self) -> Result<Vec<Member>, Report> {
        let zones = self.fetch::<Vec<MemberWire>>(&["zones"]).await?;
        Ok(zones.into_iter().map(Member::from).collect())
    }

    async fn get_apikey(&self, id: ApiKeyId) -> Result<Option<ApiKey>, Report> {
        self.fetch_optional::<ApiKeyWire>(&["apikeys", &id.to_string()])
            .await?
            .map(ApiKey::try_from)
            .transpose()
    }

    async fn create_apikey(&self, settings: &ApiKeySettings) -> Result<CreatedApiKey, Report> {
        let created = self
            .submit::<_, ApiKeyWire>(Method::POST, &["apikeys"], &ApiKeyBody::from(settings))
            .await?;
        let Some(plain_key) = created.plain_key.clone() else {
            return Err(report!("PowerDNS-Admin did not return the generated key")
                .attach(format!("apikey: '{}'", created.id)));
        };
        Ok(CreatedApiKey {
            key: created.try_into()?,
            plain_key: SecretString::from(plain_key),
        })
    }

    async fn update_apikey(&self, id: ApiKeyId, settings: &ApiKeySettings) -> Result<(), Report> {
        self.submit_empty(
            Method::PUT,
            &["apikeys", &id.to_string()],
            Some(&ApiKeyBody::from(settings)),
        )
        .await
    }

    async fn set_apikey_domains(&self, id: ApiKeyId, domains: &[String]) -> Result<(), Report> {
        let body = DomainsBody {
            domains: domains.iter().map(|name| NameRef { name }).collect(),
        };
        self.submit_empty(Method::PUT, &["apikeys", &id.to_string()], Some(&body))
            .await
    }

    async fn delete_apikey(&self, id: ApiKeyId) -> Result<(), Report> {
        self.submit_empty::<()>(Method::DELETE, &["apikeys", &id.to_string()], None)
            .await
    }
}

/// Lookups and creations answer with either a bare object or a one-element list.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Self::Many(items) => items.into_iter().next(),
            Self::One(item) => Some(item),
        }
    }
}

#[derive(Deserialize, Clone)]
struct MemberWire {
    id: i64,
    name: String,
}

impl From<MemberWire> for Member {
    fn from(wire: MemberWire) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
        }
    }
}

#[derive(Deserialize, Clone)]
struct RoleWire {
    name: String,
}

impl TryFrom<RoleWire> for Role {
    type Error = Report;

    fn try_from(wire: RoleWire) -> Result<Self, Self::Error> {
        let role = wire
            .name
            .parse::<Self>()
            .context("PowerDNS-Admin returned an unknown role")?;
        Ok(role)
    }
}

#[derive(Deserialize, Clone)]
struct AccountWire {
    id: i64,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    contact: Option<String>,
    #[serde(default)]
    mail: Option<String>,
}

impl From<AccountWire> for Account {
    fn from(wire: AccountWire) -> Self {
        Self {
            id: AccountId(wire.id),
            name: wire.name,
            description: wire.description.unwrap_or_default(),
            contact: wire.contact.unwrap_or_default(),
            mail: wire.mail.unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
struct AccountBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    description: &'a str,
    contact: &'a str,
    mail: &'a str,
}

#[derive(Deserialize, Clone)]
struct UserWire {
    id: i64,
    username: String,
    #[serde(default)]
    firstname: Option<String>,
    #[serde(default)]
    lastname: Option<String>,
    #[serde(default)]
    email: Option<String>,
    role: RoleWire,
    #[serde(default)]
    accounts: Vec<MemberWire>,
}

impl TryFrom<UserWire> for User {
    type Error = Report;

    fn try_from(wire: UserWire) -> Result<Self, Self::Error> {
        let role = Role::try_from(wire.role).attach(format!("username: '{}'", wire.username))?;
        Ok(Self {
            id: UserId(wire.id),
            username: wire.username,
            firstname: wire.firstname.unwrap_or_default(),
            lastname: wire.lastname.unwrap_or_default(),
            email: wire.email.unwrap_or_default(),
            role,
            accounts: wire.accounts.into_iter().map(Member::from).collect(),
        })
    }
}

#[derive(Serialize)]
struct UserBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plain_text_password: Option<&'a str>,
    firstname: &'a str,
    lastname: &'a str,
    email: &'a str,
    role_name: &'a str,
}

#[derive(Deserialize, Clone)]
struct ApiKeyWire {
    id: i64,
    #[serde(default)]
    description: Option<String>,
    role: RoleWire,
    #[serde(default)]
    domains: Vec<MemberWire>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    plain_key: Option<String>,
}

impl TryFrom<ApiKeyWire> for ApiKey {
    type Error = Report;

    fn try_from(wire: ApiKeyWire) -> Result<Self, Self::Error> {
        let role = Role::try_from(wire.role).attach(format!("apikey: '{}'", wire.id))?;
        Ok(Self {
            id: ApiKeyId(wire.id),
            description: wire.description.unwrap_or_default(),
            role,
            domains: wire.domains.into_iter().map(Member::from).collect(),
            hashed_key: wire.key,
        })
    }
}

#[derive(Serialize)]
struct NameRef<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct ApiKeyBody<'a> {
    description: &'a str,
    role: NameRef<'static>,
    domains: Vec<NameRef<'a>>,
}

#[derive(Serialize)]
struct DomainsBody<'a> {
    domains: Vec<NameRef<'a>>,
}

impl<'a> From<&'a ApiKeySettings> for ApiKeyBody<'a> {
    fn from(settings: &'a ApiKeySettings) -> Self {
        Self {
            description: &settings.description,
            role: NameRef {
                name: settings.role.as_str(),
            },
            domains: settings
                .domains
                .iter()
                .map(|name| NameRef { name })
                .collect(),
        }
    }
}
