//! Set-difference reconciliation of owner → member associations.
//!
//! An owner (a user, an API key) holds a set of members (accounts, zones).
//! Given the complete desired set of member names and the observed
//! membership, [`reconcile`] removes what is no longer wanted and then adds
//! what is missing, one remote call per association.
//!
//! Every desired name is resolved against a single candidate listing before
//! anything is mutated; an unknown name aborts the run with no remote change.
//! Once mutation has started the first failing call aborts the rest and
//! nothing is rolled back.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use derive_more::{Display, Error};
use rootcause::Report;
use rootcause::prelude::ResultExt;
use tracing::{debug, info};

use crate::api::Member;
use crate::role::{DomainScope, Role};

/// Remote operations on the memberships of one owner.
#[async_trait]
pub trait Membership {
    /// Owner label for logs and error context.
    fn owner(&self) -> &str;

    /// Everything that could be a member, used to resolve names to ids.
    async fn candidates(&self) -> Result<Vec<Member>, Report>;

    /// Current membership as the server sees it.
    async fn observed(&self) -> Result<Vec<Member>, Report>;

    async fn add(&mut self, member: &Member) -> Result<(), Report>;

    async fn remove(&mut self, member: &Member) -> Result<(), Report>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipPlan {
    /// Observed members to drop, keyed by their server id.
    pub to_remove: Vec<Member>,
    /// Desired names not yet observed.
    pub to_add: Vec<String>,
}

impl MembershipPlan {
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// A role rules out the requested membership.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum MembershipViolation {
    #[display("an API key with the {role} role must have at least one domain")]
    MembersRequired {
        #[error(not(source))]
        role: Role,
    },
}

/// Desired names missing from the candidate listing.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("not found on the server: {}", names.join(", "))]
pub struct UnknownMembers {
    #[error(not(source))]
    pub names: Vec<String>,
}

pub fn plan(desired: &BTreeSet<String>, observed: &[Member]) -> MembershipPlan {
    let observed_names: BTreeSet<&str> = observed.iter().map(|m| m.name.as_str()).collect();

    MembershipPlan {
        to_remove: observed
            .iter()
            .filter(|m| !desired.contains(&m.name))
            .cloned()
            .collect(),
        to_add: desired
            .iter()
            .filter(|name| !observed_names.contains(name.as_str()))
            .cloned()
            .collect(),
    }
}

/// Applies the role rule to a desired domain set: forbidden roles always get
/// an empty set, required roles must name at least one domain.
pub fn constrain_to_role(
    role: Role,
    desired: BTreeSet<String>,
) -> Result<BTreeSet<String>, MembershipViolation> {
    match role.domain_scope() {
        DomainScope::Forbidden => {
            if !desired.is_empty() {
                debug!(%role, ignored = ?desired, "role cannot be scoped to domains");
            }
            Ok(BTreeSet::new())
        }
        DomainScope::Required if desired.is_empty() => {
            Err(MembershipViolation::MembersRequired { role })
        }
        DomainScope::Required => Ok(desired),
    }
}

/// Converges the owner's membership from `observed` to `desired`.
///
/// `observed` must have been fetched right before the call.
pub async fn reconcile<M>(
    backend: &mut M,
    desired: &BTreeSet<String>,
    observed: &[Member],
) -> Result<ReconcileOutcome, Report>
where
    M: Membership + Send + Sync,
{
    let plan = plan(desired, observed);
    if plan.is_empty() {
        debug!(owner = %backend.owner(), "membership already converged");
        return Ok(ReconcileOutcome::default());
    }

    let additions = resolve(&*backend, &plan.to_add).await?;
    let mut outcome = ReconcileOutcome::default();

    for member in &plan.to_remove {
        backend
            .remove(member)
            .await
            .context("Failed to remove membership")
            .attach(format!("owner: '{}'", backend.owner()))
            .attach(format!("member: '{member}'"))?;
        outcome.removed.push(member.name.clone());
    }

    for member in &additions {
        backend
            .add(member)
            .await
            .context("Failed to add membership")
            .attach(format!("owner: '{}'", backend.owner()))
            .attach(format!("member: '{member}'"))?;
        outcome.added.push(member.name.clone());
    }

    info!(
        owner = %backend.owner(),
        removed = ?outcome.removed,
        added = ?outcome.added,
        "membership reconciled"
    );

    Ok(outcome)
}

/// Fetches the observed membership and reconciles against it.
pub async fn converge<M>(backend: &mut M, desired: &BTreeSet<String>) -> Result<ReconcileOutcome, Report>
where
    M: Membership + Send + Sync,
{
    let observed = backend
        .observed()
        .await
        .context("Failed to read current membership")
        .attach(format!("owner: '{}'", backend.owner()))?;
    reconcile(backend, desired, &observed).await
}

/// Like [`converge`], after checking `desired` against the owner's role.
///
/// A violation is reported before any remote call is made.
pub async fn converge_for_role<M>(
    backend: &mut M,
    role: Role,
    desired: BTreeSet<String>,
) -> Result<ReconcileOutcome, Report>
where
    M: Membership + Send + Sync,
{
    let desired = constrain_to_role(role, desired)
        .context("Invalid membership for role")
        .attach(format!("owner: '{}'", backend.owner()))?;
    converge(backend, &desired).await
}

async fn resolve<M>(backend: &M, names: &[String]) -> Result<Vec<Member>, Report>
where
    M: Membership + Sync,
{
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let candidates = backend
        .candidates()
        .await
        .context("Failed to list candidate members")
        .attach(format!("owner: '{}'", backend.owner()))?;

    let resolved = match_candidates(candidates, names)
        .context("Cannot resolve desired members")
        .attach(format!("owner: '{}'", backend.owner()))?;
    Ok(resolved)
}

/// Picks the candidate for every name, failing with all names that have none.
pub fn match_candidates(
    candidates: Vec<Member>,
    names: &[String],
) -> Result<Vec<Member>, UnknownMembers> {
    let by_name: BTreeMap<String, Member> = candidates
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();

    let mut resolved = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in names {
        match by_name.get(name) {
            Some(member) => resolved.push(member.clone()),
            None => missing.push(name.clone()),
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(UnknownMembers { names: missing })
    }
}
