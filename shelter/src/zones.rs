use crate::flags::CacheBehaviour;
use crate::placeholders::Rewriter;
use crate::proxy::{InboundRequest, Proxy, RemoteRequest};
use rand::Rng;
use shelter_cache::Zone;
use shelter_http::HttpResponse;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cache type tag for zone content.
pub const ZONE_CACHE_TYPE: &str = "zone";

/// Rendered content of one zone permutation.
#[derive(Debug, Clone)]
pub struct ZoneContent {
    pub zone_id: u32,
    pub permutation: u32,
    pub response: HttpResponse,
    /// Served from a timed-out cache copy; the caller should schedule a
    /// background refresh.
    pub needs_refresh: bool,
}

impl ZoneContent {
    pub fn body(&self) -> &[u8] {
        self.response.body()
    }
}

/// Serves ad zones through the proxy. Each zone is cached as `copies`
/// independent permutations so rotating content can still be served from
/// cache.
pub struct ZoneFeed {
    proxy: Arc<Proxy>,
    rewriter: Arc<Rewriter>,
    cache_timeout_secs: u64,
    copies: u32,
}

impl ZoneFeed {
    pub fn new(
        proxy: Arc<Proxy>,
        rewriter: Arc<Rewriter>,
        cache_timeout_secs: u64,
        copies: u32,
    ) -> Self {
        Self {
            proxy,
            rewriter,
            cache_timeout_secs,
            copies: copies.max(1),
        }
    }

    pub fn copies(&self) -> u32 {
        self.copies
    }

    pub fn zone_path(zone_id: u32) -> String {
        Proxy::action_url(&format!("adserver/zone?zoneId={zone_id}"))
    }

    pub fn cache_prefix(zone_id: u32, permutation: u32) -> String {
        format!("zone-{zone_id}-{permutation}://")
    }

    /// Zones known to the embedding site.
    pub async fn zones(&self) -> Vec<Zone> {
        match self.proxy.cache().store().all_zones().await {
            Ok(zones) => zones,
            Err(e) => {
                warn!(error = %e, "zone list lookup failed");
                Vec::new()
            }
        }
    }

    fn request(&self, zone_id: u32, permutation: u32, user_sensitive: bool) -> RemoteRequest {
        // User-facing requests never wait on the origin.
        let behaviour = if user_sensitive {
            CacheBehaviour::DO_NOT_MAKE_REQUEST_TO_SERVER | CacheBehaviour::IGNORE_CACHE_TIMEOUT
        } else {
            CacheBehaviour::USE_TIMED_OUT_CACHE_AS_FALLBACK
        };
        RemoteRequest {
            forward_post_data: false,
            forward_standard_headers: false,
            cache_seconds: Some(self.cache_timeout_secs),
            behaviour,
            cache_prefix: Some(Self::cache_prefix(zone_id, permutation)),
            cache_type: Some(ZONE_CACHE_TYPE.to_string()),
            ..RemoteRequest::get(Self::zone_path(zone_id))
        }
    }

    /// Content for `zone_id`, with placeholders rewritten.
    ///
    /// `permutation` defaults to a random copy. `None` means nothing usable
    /// was available; for user-sensitive calls that includes a cold cache.
    pub async fn content(
        &self,
        zone_id: u32,
        permutation: Option<u32>,
        user_sensitive: bool,
        inbound: &InboundRequest,
    ) -> Option<ZoneContent> {
        let permutation = permutation
            .filter(|p| (1..=self.copies).contains(p))
            .unwrap_or_else(|| rand::rng().random_range(1..=self.copies));
        let request = self.request(zone_id, permutation, user_sensitive);

        let mut response = self.proxy.get_remote_content(&request, inbound).await?;
        if response.status() != 200 {
            debug!(zone_id, status = response.status(), "zone content unavailable");
            return None;
        }

        self.rewriter.link_content_to_cache(&mut response).await;
        self.rewriter.replace_all(&mut response, None, inbound).await;

        let needs_refresh = response.cache.from_cache && response.cache.timed_out;
        Some(ZoneContent {
            zone_id,
            permutation,
            response,
            needs_refresh,
        })
    }

    /// Refetch every permutation of `zone_id` from the origin. Returns how
    /// many permutations now have content.
    pub async fn refresh(&self, zone_id: u32, inbound: &InboundRequest) -> u32 {
        let mut refreshed = 0;
        for permutation in 1..=self.copies {
            let request = self.request(zone_id, permutation, false);
            match self.proxy.get_remote_content(&request, inbound).await {
                Some(response) if response.status() == 200 => refreshed += 1,
                _ => debug!(zone_id, permutation, "zone permutation not refreshed"),
            }
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_naming() {
        assert_eq!(ZoneFeed::zone_path(12), "/plugin/adserver/zone?zoneId=12");
        assert_eq!(ZoneFeed::cache_prefix(12, 3), "zone-12-3://");
    }
}
