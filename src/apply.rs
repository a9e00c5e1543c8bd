//! Drives the resource lifecycles from a manifest: refresh what the state
//! file knows, decide an action per address, then execute the actions in
//! dependency order, saving the state after every successful step.

use std::collections::BTreeMap;
use std::path::Path;

use derive_more::Display;
use rootcause::prelude::ResultExt;
use rootcause::{Report, bail};
use serde_json::Value;
use tracing::{info, warn};

use crate::api::DynApi;
use crate::resource::Kind;
use crate::schema::Record;
use crate::state::{Address, State};

/// Prepared desired attributes, keyed by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub resources: BTreeMap<Address, Record>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, Report> {
        let raw = std::fs::read_to_string(path)
            .context("Couldn't read manifest")
            .attach(format!("path: '{}'", path.display()))?;
        let manifest = Self::parse(&raw).attach(format!("path: '{}'", path.display()))?;
        Ok(manifest)
    }

    /// Parses `{ "<kind>": { "<label>": { attributes } } }` and runs every
    /// record through its kind's schema.
    pub fn parse(raw: &str) -> Result<Self, Report> {
        let document: BTreeMap<Kind, BTreeMap<String, Value>> =
            serde_json::from_str(raw).context("Manifest is not valid")?;

        let mut resources = BTreeMap::new();
        for (kind, labelled) in document {
            for (label, value) in labelled {
                let address = Address::new(kind, label);
                if address.label.is_empty() {
                    bail!("Resource labels must not be empty ({kind})");
                }
                let Value::Object(raw) = value else {
                    bail!("Resource '{address}' must be a JSON object");
                };
                let prepared = kind
                    .schema()
                    .prepare(&raw)
                    .attach(format!("resource: '{address}'"))?;
                resources.insert(address, prepared);
            }
        }

        Ok(Self { resources })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Action {
    #[display("create")]
    Create,
    /// Fields that changed.
    #[display("update ({})", _0.join(", "))]
    Update(Vec<&'static str>),
    #[display("replace")]
    Replace,
    #[display("delete")]
    Delete,
    #[display("no changes")]
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{address}: {action}")]
pub struct Step {
    pub address: Address,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[display("{created} created, {updated} updated, {replaced} replaced, {deleted} deleted, {unchanged} unchanged")]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Action that takes `current` to `desired`; `None` means absent on that side.
pub fn decide(kind: Kind, desired: Option<&Record>, current: Option<&Record>) -> Action {
    match (desired, current) {
        (Some(_), None) => Action::Create,
        (None, Some(_)) => Action::Delete,
        (None, None) => Action::NoOp,
        (Some(desired), Some(current)) => {
            let schema = kind.schema();
            if schema.requires_replacement(current, desired) {
                return Action::Replace;
            }
            let changed = schema.changed_fields(current, desired);
            if changed.is_empty() {
                Action::NoOp
            } else {
                Action::Update(changed)
            }
        }
    }
}

/// Re-reads every resource in `state`, dropping those deleted out of band.
pub async fn refresh(api: &DynApi, state: &mut State) -> Result<(), Report> {
    let addresses: Vec<Address> = state.resources.keys().cloned().collect();
    for address in addresses {
        let Some(known) = state.get(&address) else {
            continue;
        };
        let id = known.id.clone();
        let current = address
            .kind
            .read(api, &id, &known.attributes)
            .await
            .context("Couldn't refresh resource")
            .attach(format!("resource: '{address}'"))?;

        match current {
            Some(attributes) => state.put(address, id, attributes),
            None => {
                warn!(resource = %address, id = %id, "resource is gone from the server");
                state.forget(&address);
            }
        }
    }
    Ok(())
}

/// Refreshes `state` in memory and lists the steps needed to reach
/// `manifest`: creates and updates in dependency order, then deletes in
/// reverse order.
pub async fn plan(api: &DynApi, manifest: &Manifest, state: &mut State) -> Result<Vec<Step>, Report> {
    refresh(api, state).await?;

    let mut steps: Vec<Step> = manifest
        .resources
        .iter()
        .map(|(address, desired)| Step {
            address: address.clone(),
            action: decide(
                address.kind,
                Some(desired),
                state.get(address).map(|known| &known.attributes),
            ),
        })
        .collect();

    let deletes = state
        .resources
        .keys()
        .rev()
        .filter(|address| !manifest.resources.contains_key(*address))
        .map(|address| Step {
            address: address.clone(),
            action: Action::Delete,
        });
    steps.extend(deletes);

    Ok(steps)
}

/// Converges the server onto `manifest`, stopping at the first failure.
///
/// The state file is written after every step that changed something, so a
/// failed run leaves behind exactly what was done.
pub async fn apply(api: &DynApi, manifest: &Manifest, state_path: &Path) -> Result<Summary, Report> {
    let mut state = State::load(state_path)?;
    let steps = plan(api, manifest, &mut state).await?;
    state.save(state_path)?;

    let mut summary = Summary::default();
    for step in steps {
        if step.action == Action::NoOp {
            summary.unchanged += 1;
            continue;
        }

        info!(resource = %step.address, action = %step.action, "applying");
        execute(api, manifest, &mut state, state_path, &step)
            .await
            .context("Apply stopped")
            .attach(format!("resource: '{}'", step.address))
            .attach(format!("action: {}", step.action))?;

        match step.action {
            Action::Create => summary.created += 1,
            Action::Update(_) => summary.updated += 1,
            Action::Replace => summary.replaced += 1,
            Action::Delete => summary.deleted += 1,
            Action::NoOp => {}
        }
    }

    info!(%summary, "apply finished");
    Ok(summary)
}

async fn execute(
    api: &DynApi,
    manifest: &Manifest,
    state: &mut State,
    state_path: &Path,
    step: &Step,
) -> Result<(), Report> {
    let address = &step.address;
    let kind = address.kind;

    match &step.action {
        Action::NoOp => {}
        Action::Create => {
            let desired = desired_record(manifest, address)?;
            let applied = kind.create(api, desired).await?;
            state.put(address.clone(), applied.id, applied.attributes);
            state.save(state_path)?;
        }
        Action::Update(_) => {
            let desired = desired_record(manifest, address)?;
            let Some(known) = state.get(address) else {
                bail!("No state for '{address}'");
            };
            let id = known.id.clone();
            let attributes = kind.update(api, &id, &known.attributes, desired).await?;
            state.put(address.clone(), id, attributes);
            state.save(state_path)?;
        }
        Action::Replace => {
            let desired = desired_record(manifest, address)?;
            if let Some(known) = state.get(address) {
                kind.delete(api, &known.id).await?;
                state.forget(address);
                state.save(state_path)?;
            }
            let applied = kind.create(api, desired).await?;
            state.put(address.clone(), applied.id, applied.attributes);
            state.save(state_path)?;
        }
        Action::Delete => {
            if let Some(known) = state.get(address) {
                kind.delete(api, &known.id).await?;
                state.forget(address);
                state.save(state_path)?;
            }
        }
    }

    Ok(())
}

fn desired_record<'a>(manifest: &'a Manifest, address: &Address) -> Result<&'a Record, Report> {
    match manifest.resources.get(address) {
        Some(record) => Ok(record),
        None => bail!("'{address}' is not in the manifest"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::api::fake::FakeServer;

    fn manifest(value: Value) -> Manifest {
        Manifest::parse(&value.to_string()).unwrap()
    }

    fn full_manifest() -> Manifest {
        manifest(json!({
            "apikey": {
                "ci": { "description": "ci", "role": "User", "domains": ["example.org"] }
            },
            "user": {
                "alice": {
                    "username": "alice",
                    "external": true,
                    "email": "alice@example.com",
                    "accounts": ["ops"]
                }
            },
            "account": {
                "ops": { "name": "ops" }
            }
        }))
    }

    fn record(kind: Kind, value: Value) -> Record {
        kind.schema().prepare(value.as_object().unwrap()).unwrap()
    }

    #[test]
    fn parse_rejects_invalid_records() {
        let err = Manifest::parse(&json!({ "account": { "ops": { "name": "Ops" } } }).to_string())
            .unwrap_err();
        assert!(format!("{err:?}").contains("account.ops"));

        assert!(Manifest::parse(r#"{ "zone": {} }"#).is_err());
        assert!(Manifest::parse(r#"{ "account": { "ops": [] } }"#).is_err());
    }

    #[test]
    fn decide_covers_every_action() {
        let old = record(Kind::Account, json!({ "name": "ops" }));
        let renamed = record(Kind::Account, json!({ "name": "dev" }));
        let described = record(Kind::Account, json!({ "name": "ops", "description": "x" }));

        assert_eq!(decide(Kind::Account, Some(&old), None), Action::Create);
        assert_eq!(decide(Kind::Account, None, Some(&old)), Action::Delete);
        assert_eq!(decide(Kind::Account, Some(&old), Some(&old)), Action::NoOp);
        assert_eq!(decide(Kind::Account, Some(&renamed), Some(&old)), Action::Replace);
        assert_eq!(
            decide(Kind::Account, Some(&described), Some(&old)),
            Action::Update(vec!["description"])
        );
    }

    #[test]
    fn actions_render_for_plan_output() {
        let step = Step {
            address: Address::new(Kind::User, "alice"),
            action: Action::Update(vec!["email", "accounts"]),
        };

        assert_eq!(step.to_string(), "user.alice: update (email, accounts)");
        assert_eq!(Action::NoOp.to_string(), "no changes");
        assert_eq!(Action::Replace.to_string(), "replace");
    }

    #[tokio::test]
    async fn apply_creates_in_dependency_order_then_settles() {
        let server = FakeServer::with_zones(&["example.org"]);
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let summary = apply(&server, &full_manifest(), &state_path).await.unwrap();

        assert_eq!(summary.created, 3);
        assert_eq!(
            server.calls(),
            vec![
                "create_account ops".to_string(),
                "create_user alice".to_string(),
                "add_account_user 2 3".to_string(),
                "create_apikey ci".to_string(),
            ]
        );
        let state = State::load(&state_path).unwrap();
        assert_eq!(state.resources.len(), 3);
        assert_eq!(state.get(&"apikey.ci".parse().unwrap()).unwrap().id, "4");

        server.clear_calls();
        let summary = apply(&server, &full_manifest(), &state_path).await.unwrap();

        assert_eq!(summary.unchanged, 3);
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn removed_resources_are_deleted_in_reverse_order() {
        let server = FakeServer::with_zones(&["example.org"]);
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        apply(&server, &full_manifest(), &state_path).await.unwrap();
        server.clear_calls();

        let summary = apply(&server, &Manifest::default(), &state_path)
            .await
            .unwrap();

        assert_eq!(summary.deleted, 3);
        assert_eq!(
            server.calls(),
            vec![
                "delete_apikey 4".to_string(),
                "delete_user 3".to_string(),
                "delete_account 2".to_string(),
            ]
        );
        assert!(State::load(&state_path).unwrap().resources.is_empty());
    }

    #[tokio::test]
    async fn resource_deleted_out_of_band_is_recreated() {
        let server = FakeServer::default();
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let desired = manifest(json!({ "account": { "ops": { "name": "ops" } } }));
        apply(&server, &desired, &state_path).await.unwrap();
        Kind::Account.delete(&server, "ops").await.unwrap();
        server.clear_calls();

        let summary = apply(&server, &desired, &state_path).await.unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(server.calls(), vec!["create_account ops".to_string()]);
    }

    #[tokio::test]
    async fn failure_stops_and_keeps_completed_steps() {
        let server = FakeServer::default();
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");

        let err = apply(&server, &full_manifest(), &state_path)
            .await
            .unwrap_err();

        assert!(format!("{err:?}").contains("example.org"));
        let state = State::load(&state_path).unwrap();
        let addresses: Vec<String> = state.resources.keys().map(ToString::to_string).collect();
        assert_eq!(addresses, vec!["account.ops", "user.alice"]);
        assert_eq!(server.apikey_count(), 0);
    }

    #[tokio::test]
    async fn unknown_account_leaves_nothing_behind_and_next_run_converges() {
        let server = FakeServer::default();
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let user = |accounts: Value| {
            manifest(json!({
                "account": { "ops": { "name": "ops" } },
                "user": {
                    "alice": {
                        "username": "alice",
                        "external": true,
                        "email": "alice@example.com",
                        "accounts": accounts
                    }
                }
            }))
        };

        let err = apply(&server, &user(json!(["ops", "ghost"])), &state_path)
            .await
            .unwrap_err();

        assert!(format!("{err:?}").contains("ghost"));
        assert_eq!(server.user_count(), 0);
        let addresses: Vec<String> = State::load(&state_path)
            .unwrap()
            .resources
            .keys()
            .map(ToString::to_string)
            .collect();
        assert_eq!(addresses, vec!["account.ops"]);

        server.clear_calls();
        let summary = apply(&server, &user(json!(["ops"])), &state_path)
            .await
            .unwrap();

        assert_eq!(summary.created, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(
            server.calls(),
            vec!["create_user alice".to_string(), "add_account_user 1 2".to_string()]
        );
        assert_eq!(server.user_count(), 1);
    }

    #[tokio::test]
    async fn plan_does_not_mutate() {
        let server = FakeServer::with_zones(&["example.org"]);
        let mut state = State::default();

        let steps = plan(&server, &full_manifest(), &mut state).await.unwrap();

        let rendered: Vec<String> = steps.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec!["account.ops: create", "user.alice: create", "apikey.ci: create"]
        );
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn changed_field_becomes_update() {
        let server = FakeServer::default();
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        apply(
            &server,
            &manifest(json!({ "account": { "ops": { "name": "ops" } } })),
            &state_path,
        )
        .await
        .unwrap();
        server.clear_calls();

        let summary = apply(
            &server,
            &manifest(json!({ "account": { "ops": { "name": "ops", "description": "Ops" } } })),
            &state_path,
        )
        .await
        .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(server.calls(), vec!["update_account 1".to_string()]);
    }
}
