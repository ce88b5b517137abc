//! Catalog synchronization.
//!
//! The daemon subscribes to the catalog topic of the shared state service.
//! Deltas are applied to the local catalog cache through the Frontend; the
//! committed `{catalog_version, topic_version, service_id}` triple is
//! published on a watch channel, which doubles as the condition variable
//! DDL originators block on until their update is visible locally (and,
//! with SYNC_DDL, fleet-wide). Within one catalog service incarnation the
//! observed catalog version is monotone; a service id change invalidates
//! that assumption and wakes every waiter.

use serde_json::from_slice;
use tracing::{debug, error, info};

use stratus_common::wire::{
    CatalogCacheUpdate, CatalogObject, CatalogObjectKind, CatalogServiceId, CatalogUpdateResult,
    TopicDelta, CATALOG_TOPIC,
};
use stratus_common::{ControlError, QueryStatus};

use crate::metrics;
use crate::server::ControlServer;

/// The committed catalog view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogState {
    pub catalog_version: i64,
    pub catalog_topic_version: i64,
    pub catalog_service_id: CatalogServiceId,
    /// Minimum catalog-topic version observed across all subscribers.
    pub min_subscriber_topic_version: i64,
}

impl Default for CatalogState {
    fn default() -> Self {
        CatalogState {
            catalog_version: 0,
            catalog_topic_version: 0,
            catalog_service_id: uuid::Uuid::nil(),
            min_subscriber_topic_version: 0,
        }
    }
}

impl ControlServer {
    /// The current committed catalog view.
    pub fn catalog_state(&self) -> CatalogState {
        self.catalog_tx.borrow().clone()
    }

    /// Apply one catalog topic delta. Returns subscriber-originated topic
    /// updates (a resend request after a failed application).
    pub async fn catalog_update_callback(&self, delta: &TopicDelta) -> Vec<TopicDelta> {
        let mut subscriber_updates = Vec::new();
        if delta.topic_name != CATALOG_TOPIC {
            return subscriber_updates;
        }

        if !delta.topic_entries.is_empty() || !delta.topic_deletions.is_empty() {
            let mut update_req = CatalogCacheUpdate {
                is_delta: delta.is_delta,
                ..Default::default()
            };

            // Determine what the new catalog version will be while
            // collecting updated objects.
            let mut new_catalog_version = self.catalog_state().catalog_version;
            for item in &delta.topic_entries {
                let catalog_object: CatalogObject = match from_slice(&item.value) {
                    Ok(obj) => obj,
                    Err(e) => {
                        error!(key = %item.key, "Error deserializing catalog topic item: {}", e);
                        continue;
                    }
                };
                if catalog_object.object_type == CatalogObjectKind::Catalog {
                    update_req.catalog_service_id = catalog_object.catalog_service_id;
                    new_catalog_version = catalog_object.catalog_version;
                }
                // Added or altered functions and data sources invalidate
                // their cached native libraries.
                if matches!(
                    catalog_object.object_type,
                    CatalogObjectKind::Function | CatalogObjectKind::DataSource
                ) {
                    if let Some(path) = &catalog_object.library_path {
                        self.env.lib_cache.set_needs_refresh(path);
                    }
                }
                update_req.updated_objects.push(catalog_object);
            }

            // Deletions arrive as keys only. For functions and data
            // sources, ask the frontend for the cached object *before*
            // applying the update, because afterwards the metadata locating the
            // library file is gone. Their library-cache removal is
            // deferred until the update has succeeded.
            let mut dropped_objects = Vec::new();
            for key in &delta.topic_deletions {
                info!(key = %key, "Catalog topic entry deletion");
                let catalog_object = match CatalogObject::from_entry_key(key) {
                    Ok(obj) => obj,
                    Err(e) => {
                        error!("Error parsing catalog topic entry deletion key: {}", e);
                        continue;
                    }
                };
                let is_library_object = matches!(
                    catalog_object.object_type,
                    CatalogObjectKind::Function | CatalogObjectKind::DataSource
                );
                if is_library_object {
                    if let Ok(dropped) = self.env.frontend.get_catalog_object(&catalog_object).await
                    {
                        // The object may have been dropped and re-created;
                        // only forget the library when the cached object
                        // predates this update.
                        if dropped.catalog_version <= new_catalog_version {
                            dropped_objects.push(dropped);
                        }
                    }
                    // Nothing to do in the error case.
                }
                update_req.removed_objects.push(catalog_object);
            }

            match self.env.frontend.update_catalog_cache(&update_req).await {
                Err(e) => {
                    error!(
                        "Error processing catalog update. Requesting a full topic update to \
                         recover: {}",
                        e.message()
                    );
                    subscriber_updates.push(TopicDelta::resend_request(CATALOG_TOPIC, 0));
                    metrics::CATALOG_READY.set(0);
                    // Behave as if every function and data source were
                    // dropped.
                    self.env.lib_cache.drop_cache();
                }
                Ok(resp) => {
                    self.catalog_tx.send_modify(|state| {
                        state.catalog_version = new_catalog_version;
                        state.catalog_topic_version = delta.to_version;
                        state.catalog_service_id = resp.catalog_service_id;
                    });
                    metrics::CATALOG_READY.set(if new_catalog_version > 0 { 1 } else { 0 });
                    metrics::CATALOG_VERSION.set(new_catalog_version);
                    if let Err(e) = self.update_catalog_metrics().await {
                        debug!("Couldn't update catalog metrics: {}", e.message());
                    }
                    for object in &dropped_objects {
                        if let Some(path) = &object.library_path {
                            self.env.lib_cache.remove_entry(path);
                        }
                    }
                }
            }
        }

        // Always publish the fleet-wide minimum subscriber version; every
        // send wakes the waiters.
        self.catalog_tx.send_modify(|state| {
            state.min_subscriber_topic_version = delta.min_subscriber_topic_version;
        });
        subscriber_updates
    }

    /// Make the result of a catalog-service operation visible. The fast
    /// path applies a single-object result directly to the local cache;
    /// otherwise wait until the catalog topic has delivered the version
    /// and, when `wait_for_all_subscribers`, until every subscriber has
    /// seen it. A catalog service restart (service id change) unblocks
    /// both waits.
    pub async fn process_catalog_update_result(
        &self,
        result: &CatalogUpdateResult,
        wait_for_all_subscribers: bool,
    ) -> Result<(), ControlError> {
        let has_direct_object =
            result.updated_catalog_object.is_some() || result.removed_catalog_object.is_some();
        if has_direct_object && !wait_for_all_subscribers {
            let update_req = CatalogCacheUpdate {
                is_delta: true,
                catalog_service_id: Some(result.catalog_service_id),
                updated_objects: result.updated_catalog_object.clone().into_iter().collect(),
                removed_objects: result.removed_catalog_object.clone().into_iter().collect(),
            };
            return match self.env.frontend.update_catalog_cache(&update_req).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    error!("{}", e.message());
                    Err(ControlError::Internal(e.message()))
                }
            };
        }

        let mut rx = self.catalog_tx.subscribe();
        let min_req_catalog_version = result.version;
        let catalog_service_id = result.catalog_service_id;

        debug!(
            waiting_for = min_req_catalog_version,
            current = self.catalog_state().catalog_version,
            "Waiting for catalog version"
        );
        let state = rx
            .wait_for(|state| {
                state.catalog_version >= min_req_catalog_version
                    || state.catalog_service_id != catalog_service_id
            })
            .await
            .map_err(ControlError::internal)?
            .clone();

        if !wait_for_all_subscribers {
            return Ok(());
        }

        // The first wait established the topic version carrying this
        // update; now wait for every subscriber to reach it.
        let min_req_subscriber_topic_version = state.catalog_topic_version;
        debug!(
            waiting_for = min_req_subscriber_topic_version,
            "Waiting for minimum subscriber topic version"
        );
        rx.wait_for(|state| {
            state.min_subscriber_topic_version >= min_req_subscriber_topic_version
                || state.catalog_service_id != catalog_service_id
        })
        .await
        .map_err(ControlError::internal)?;
        Ok(())
    }

    /// Refresh the database/table gauges from the local catalog replica.
    pub(crate) async fn update_catalog_metrics(&self) -> Result<(), QueryStatus> {
        let dbs = self.env.frontend.get_db_names().await?;
        metrics::CATALOG_NUM_DBS.set(dbs.len() as i64);
        let mut num_tables = 0i64;
        for db in &dbs {
            num_tables += self.env.frontend.get_table_names(db).await?.len() as i64;
        }
        metrics::CATALOG_NUM_TABLES.set(num_tables);
        Ok(())
    }
}
