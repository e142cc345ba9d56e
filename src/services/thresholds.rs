use sqlx::{FromRow, PgPool};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::services::evaluator::Thresholds;

#[derive(FromRow)]
struct ThresholdRow {
    max_distance: Option<f64>,
    max_gas: Option<f64>,
    min_flow: Option<f64>,
    min_battery: Option<f64>,
}

/// Per-device threshold snapshots with an in-memory cache. Lookup never
/// touches storage on the caller's path: a cache miss answers with the
/// system defaults and kicks off a background refresh, so evaluation never
/// waits on a pool acquire.
pub struct ThresholdCatalog {
    pool: PgPool,
    cache: Mutex<HashMap<String, Thresholds>>,
    refreshing: Mutex<HashSet<String>>,
}

impl ThresholdCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    /// Bounds in effect for the device right now. Unknown devices and
    /// devices whose refresh has not landed yet evaluate with defaults.
    pub fn effective(self: &Arc<Self>, device_id: &str) -> Thresholds {
        {
            let cache = self.cache.lock().expect("threshold cache lock poisoned");
            if let Some(thresholds) = cache.get(device_id) {
                return *thresholds;
            }
        }
        self.spawn_refresh(device_id);
        Thresholds::default()
    }

    /// Installs a snapshot directly, used by the threshold update route so
    /// the next evaluation sees the new bounds without a storage round trip.
    pub fn store(&self, device_id: &str, thresholds: Thresholds) {
        let mut cache = self.cache.lock().expect("threshold cache lock poisoned");
        cache.insert(device_id.to_string(), thresholds);
    }

    fn spawn_refresh(self: &Arc<Self>, device_id: &str) {
        {
            let mut refreshing = self
                .refreshing
                .lock()
                .expect("threshold refresh set lock poisoned");
            if !refreshing.insert(device_id.to_string()) {
                return;
            }
        }

        let catalog = Arc::clone(self);
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            catalog.refresh(&device_id).await;
            let mut refreshing = catalog
                .refreshing
                .lock()
                .expect("threshold refresh set lock poisoned");
            refreshing.remove(&device_id);
        });
    }

    async fn refresh(&self, device_id: &str) {
        let row: Result<Option<ThresholdRow>, sqlx::Error> = sqlx::query_as(
            "SELECT max_distance, max_gas, min_flow, min_battery FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(row)) => {
                let thresholds = Thresholds::from_partial(
                    row.max_distance,
                    row.max_gas,
                    row.min_flow,
                    row.min_battery,
                );
                let mut cache = self.cache.lock().expect("threshold cache lock poisoned");
                cache.insert(device_id.to_string(), thresholds);
            }
            // Unregistered device: stays uncached so a later registration
            // is picked up by the next refresh.
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(device = %device_id, error = %err, "threshold refresh failed; defaults stay in effect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    fn catalog() -> Arc<ThresholdCatalog> {
        // Lazy pool; nothing is listening, so the background refresh fails
        // without affecting the caller's path.
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgresql://postgres@127.0.0.1:9/none")
            .expect("lazy pool");
        Arc::new(ThresholdCatalog::new(pool))
    }

    #[tokio::test]
    async fn unknown_device_evaluates_with_defaults_immediately() {
        let catalog = catalog();
        assert_eq!(catalog.effective("MH001"), Thresholds::default());
    }

    #[tokio::test]
    async fn stored_snapshot_takes_effect_for_the_next_lookup() {
        let catalog = catalog();
        let custom = Thresholds {
            max_distance: 120.0,
            max_gas: 800.0,
            min_flow: 2.0,
            min_battery: 50.0,
        };
        catalog.store("MH001", custom);
        assert_eq!(catalog.effective("MH001"), custom);
        assert_eq!(catalog.effective("MH002"), Thresholds::default());
    }
}
