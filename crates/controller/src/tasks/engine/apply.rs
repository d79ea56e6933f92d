//! Upsert and prune of owned sub-resources

use super::diff::is_subset;
use crate::tasks::cluster::{Cluster, OwnedKind, OwnedObject, OwnerKey};
use crate::tasks::labels::owner_selector;
use crate::tasks::types::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Applies the desired sub-resources of one owner and remembers what it
/// touched so leftovers can be pruned afterwards.
pub struct Applier<'a> {
    ctx: &'a Context,
    owner: &'a OwnerKey,
    desired: BTreeSet<(OwnedKind, String)>,
    writes: usize,
}

impl<'a> Applier<'a> {
    #[must_use]
    pub fn new(ctx: &'a Context, owner: &'a OwnerKey) -> Self {
        Self {
            ctx,
            owner,
            desired: BTreeSet::new(),
            writes: 0,
        }
    }

    fn cluster(&self) -> &dyn Cluster {
        self.ctx.cluster.as_ref()
    }

    /// Current state of an object in the owner's namespace
    pub async fn observe(&self, kind: OwnedKind, name: &str) -> Result<Option<OwnedObject>> {
        self.cluster().get(&self.owner.namespace, kind, name).await
    }

    /// Write `desired` unless the observed object already contains it.
    ///
    /// Returns the object as observed before any write.
    pub async fn ensure(&mut self, desired: &OwnedObject) -> Result<Option<OwnedObject>> {
        let kind = desired.kind();
        let name = desired.name();
        self.desired.insert((kind, name.clone()));

        let observed = self.observe(kind, &name).await?;
        let converged = match &observed {
            Some(current) => is_subset(&desired.to_json()?, &current.to_json()?),
            None => false,
        };

        if converged {
            debug!(kind = %kind, name = %name, "Already converged");
        } else {
            info!(
                kind = %kind,
                name = %name,
                owner = %self.owner,
                created = observed.is_none(),
                "Applying sub-resource"
            );
            self.cluster().apply(&self.owner.namespace, desired).await?;
            self.ctx.metrics.write();
            self.writes += 1;
        }
        Ok(observed)
    }

    /// Delete objects of `kinds` owned by this owner that were not ensured.
    ///
    /// Label values are truncated, so owners whose names share a long prefix
    /// match the same selector; only objects whose owner reference carries
    /// this owner's UID are candidates.
    pub async fn prune(&self, kinds: &[OwnedKind]) -> Result<usize> {
        let selector = owner_selector(self.owner);
        let mut removed = 0;
        for kind in kinds {
            let listed = self
                .cluster()
                .list_metadata(&self.owner.namespace, *kind, &selector)
                .await?;
            for meta in listed {
                let Some(name) = meta.name.clone() else {
                    continue;
                };
                if self.desired.contains(&(*kind, name.clone())) {
                    continue;
                }
                if !self.owns(&meta) {
                    debug!(kind = %kind, name = %name, "Skipping object of another owner");
                    continue;
                }
                if self
                    .cluster()
                    .delete(&self.owner.namespace, *kind, &name)
                    .await?
                {
                    info!(kind = %kind, name = %name, owner = %self.owner, "Pruned sub-resource");
                    self.ctx.metrics.delete();
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn owns(&self, meta: &ObjectMeta) -> bool {
        meta.owner_references
            .iter()
            .flatten()
            .any(|r| r.uid == self.owner.uid)
    }

    /// Number of writes issued so far
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes
    }
}
