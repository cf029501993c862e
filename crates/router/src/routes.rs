use crate::Error;
use models::Route;
use std::time::Duration;

/// How long a resolved route *name* stays cached per inbound provider.
/// The live row is always re-read so the capacity check never trusts a
/// cached `current_calls`.
const ROUTE_TTL: Duration = Duration::from_secs(60);

/// Finds the applicable route for an inbound provider: the highest
/// priority enabled route naming the provider directly, or naming a group
/// whose materialized membership contains it.
pub struct RouteResolver {
    pool: sqlx::PgPool,
    cache: std::sync::Arc<cache::Cache>,
}

impl RouteResolver {
    pub fn new(pool: sqlx::PgPool, cache: std::sync::Arc<cache::Cache>) -> Self {
        Self { pool, cache }
    }

    #[tracing::instrument(level = "debug", err(level = "warn"), skip(self))]
    pub async fn route_for(&self, provider_name: &str) -> Result<Route, Error> {
        let cache_key = format!("route.inbound.{provider_name}");

        if let Some(name) = self.cache.get(&cache_key).await {
            if let Some(route) = tandem_sql::routes::fetch_route(&self.pool, &name).await? {
                if route.enabled {
                    return admit(route);
                }
            }
            // The cached name went stale; fall through to a full lookup.
            self.cache.delete(&[cache_key.as_str()]).await;
        }

        let candidates = tandem_sql::routes::routes_for_inbound(&self.pool, provider_name).await?;
        let Some(route) = candidates.into_iter().next() else {
            return Err(Error::RouteNotFound(provider_name.to_string()));
        };

        self.cache.set(&cache_key, &route.name, ROUTE_TTL).await;
        admit(route)
    }
}

fn admit(route: Route) -> Result<Route, Error> {
    if !route.has_capacity() {
        return Err(Error::QuotaExceeded(route.name));
    }
    Ok(route)
}
