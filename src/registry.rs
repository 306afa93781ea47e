//! Tunnel registry — creation, ownership, activity tracking, deactivation.
//!
//! A tunnel maps a public-facing id to a caller-controlled loopback target.
//! Authenticated owners are identified by an opaque principal; tunnels
//! registered without one instead carry a random capability token that must
//! accompany every subsequent control call. Authorization failures are
//! reported as [`RelayError::NotFound`] so callers cannot distinguish
//! "doesn't exist" from "not yours".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::auth::{constant_time_eq, Identity};
use crate::error::RelayError;
use crate::util::unix_ms;

/// A registered tunnel.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub id: String,
    /// Owning principal; `None` for unauthenticated tunnels.
    pub owner_id: Option<String>,
    /// Capability token, minted only when `owner_id` is `None`.
    pub secret_token: Option<String>,
    /// Loopback base URL the agent forwards requests to.
    pub target_url: String,
    pub active: bool,
    pub created_at_ms: u64,
    /// Updated on every successful poll; drives the idle reaper.
    pub last_seen_at_ms: u64,
}

/// Registry of live tunnels keyed by id.
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, Tunnel>>>,
    max_per_owner: usize,
    max_anonymous: usize,
}

/// Returns `true` if `target` parses as an http(s) URL whose host resolves
/// to a loopback address. Hostnames other than `localhost` are rejected
/// outright rather than resolved — the relay never dials the target itself,
/// so DNS-based validation would be both slow and spoofable.
pub fn is_loopback_url(target: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(target) else {
        return false;
    };
    if url.scheme() != "http" && url.scheme() != "https" {
        return false;
    }
    match url.host_str() {
        Some(host) if host.eq_ignore_ascii_case("localhost") => true,
        Some(host) => {
            // IPv6 hosts come back bracketed
            let host = host.trim_start_matches('[').trim_end_matches(']');
            host.parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
        }
        None => false,
    }
}

impl TunnelRegistry {
    pub fn new(max_per_owner: usize, max_anonymous: usize) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            max_per_owner,
            max_anonymous,
        }
    }

    /// Register a tunnel for `target_url`.
    ///
    /// Fails with [`RelayError::NotFound`] if the target isn't loopback and
    /// [`RelayError::QuotaExceeded`] if the owner (or the anonymous slot) is
    /// at capacity. Unauthenticated registrations mint a capability token.
    pub async fn register(
        &self,
        target_url: &str,
        owner_id: Option<String>,
    ) -> Result<Tunnel, RelayError> {
        if !is_loopback_url(target_url) {
            // Registration of a non-loopback target is treated the same as
            // addressing a tunnel that doesn't exist.
            return Err(RelayError::NotFound);
        }

        let mut tunnels = self.tunnels.write().await;

        let active = tunnels
            .values()
            .filter(|t| t.active && t.owner_id == owner_id)
            .count();
        let cap = if owner_id.is_some() {
            self.max_per_owner
        } else {
            self.max_anonymous
        };
        if active >= cap {
            return Err(RelayError::QuotaExceeded);
        }

        let secret_token = if owner_id.is_none() {
            // 256 random bits, hex. uuid v4 carries 122 random bits each.
            Some(format!(
                "{}{}",
                Uuid::new_v4().simple(),
                Uuid::new_v4().simple()
            ))
        } else {
            None
        };

        let now = unix_ms();
        let tunnel = Tunnel {
            id: Uuid::new_v4().to_string(),
            owner_id,
            secret_token,
            target_url: target_url.to_string(),
            active: true,
            created_at_ms: now,
            last_seen_at_ms: now,
        };
        info!(tunnel_id = %tunnel.id, target = %tunnel.target_url, "Tunnel registered");
        tunnels.insert(tunnel.id.clone(), tunnel.clone());
        Ok(tunnel)
    }

    /// Resolve a tunnel the caller is authorized for.
    ///
    /// Owned tunnels require a matching principal; unauthenticated tunnels
    /// require the exact capability token. Any mismatch is `NotFound`.
    pub async fn authorized(&self, id: &str, identity: &Identity) -> Result<Tunnel, RelayError> {
        let tunnels = self.tunnels.read().await;
        let tunnel = tunnels.get(id).ok_or(RelayError::NotFound)?;
        let ok = match (&tunnel.owner_id, &tunnel.secret_token) {
            (Some(owner), _) => identity.owner_id.as_deref() == Some(owner.as_str()),
            (None, Some(secret)) => identity
                .token
                .as_deref()
                .is_some_and(|t| constant_time_eq(secret.as_bytes(), t.as_bytes())),
            (None, None) => false,
        };
        if ok {
            Ok(tunnel.clone())
        } else {
            Err(RelayError::NotFound)
        }
    }

    /// Resolve a tunnel for the public gateway — no authorization, but the
    /// tunnel must exist and be active.
    pub async fn resolve_public(&self, id: &str) -> Result<Tunnel, RelayError> {
        let tunnels = self.tunnels.read().await;
        let tunnel = tunnels.get(id).ok_or(RelayError::NotFound)?;
        if !tunnel.active {
            return Err(RelayError::Gone);
        }
        Ok(tunnel.clone())
    }

    /// Update `last_seen_at` — called on every successful poll.
    pub async fn touch(&self, id: &str) {
        if let Some(tunnel) = self.tunnels.write().await.get_mut(id) {
            tunnel.last_seen_at_ms = unix_ms();
        }
    }

    /// Deactivate a tunnel. Subsequent polls fail with `Gone`. Idempotent.
    pub async fn deactivate(&self, id: &str, identity: &Identity) -> Result<(), RelayError> {
        self.authorized(id, identity).await?;
        if let Some(tunnel) = self.tunnels.write().await.get_mut(id) {
            tunnel.active = false;
            info!(tunnel_id = %id, "Tunnel deactivated");
        }
        Ok(())
    }

    /// Active tunnels belonging to `owner_id`, newest first, capped at 20.
    pub async fn list_active(&self, owner_id: &str) -> Vec<Tunnel> {
        let tunnels = self.tunnels.read().await;
        let mut list: Vec<Tunnel> = tunnels
            .values()
            .filter(|t| t.active && t.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        list.truncate(20);
        list
    }

    pub async fn active_count(&self) -> usize {
        self.tunnels.read().await.values().filter(|t| t.active).count()
    }

    /// Deactivate tunnels whose last poll is older than `idle_secs`.
    /// Returns the number deactivated.
    pub async fn sweep_idle(&self, idle_secs: u64) -> usize {
        let cutoff = unix_ms().saturating_sub(idle_secs * 1000);
        let mut tunnels = self.tunnels.write().await;
        let mut swept = 0;
        for tunnel in tunnels.values_mut() {
            if tunnel.active && tunnel.last_seen_at_ms < cutoff {
                tunnel.active = false;
                swept += 1;
                info!(tunnel_id = %tunnel.id, "Deactivated idle tunnel");
            }
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> Identity {
        Identity {
            owner_id: Some(id.to_string()),
            token: None,
        }
    }

    fn anon(token: Option<&str>) -> Identity {
        Identity {
            owner_id: None,
            token: token.map(ToString::to_string),
        }
    }

    #[test]
    fn test_loopback_validation() {
        assert!(is_loopback_url("http://localhost:4000"));
        assert!(is_loopback_url("http://127.0.0.1:3000/api"));
        assert!(is_loopback_url("http://[::1]:8080"));
        assert!(!is_loopback_url("http://example.com"));
        assert!(!is_loopback_url("http://10.0.0.5:3000"));
        assert!(!is_loopback_url("ftp://localhost"));
        assert!(!is_loopback_url("not a url"));
    }

    #[tokio::test]
    async fn test_register_rejects_non_loopback() {
        let registry = TunnelRegistry::new(5, 1);
        let err = registry
            .register("http://example.com", None)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::NotFound);
    }

    #[tokio::test]
    async fn test_anonymous_tunnel_gets_token_and_singleton_slot() {
        let registry = TunnelRegistry::new(5, 1);
        let t = registry
            .register("http://localhost:4000", None)
            .await
            .unwrap();
        let token = t.secret_token.clone().unwrap();
        assert_eq!(token.len(), 64);

        // Slot is full now
        let err = registry
            .register("http://localhost:4001", None)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::QuotaExceeded);

        // Token authorizes, wrong token doesn't
        assert!(registry
            .authorized(&t.id, &anon(Some(&token)))
            .await
            .is_ok());
        assert_eq!(
            registry
                .authorized(&t.id, &anon(Some("wrong")))
                .await
                .unwrap_err(),
            RelayError::NotFound
        );
        assert_eq!(
            registry.authorized(&t.id, &anon(None)).await.unwrap_err(),
            RelayError::NotFound
        );
    }

    #[tokio::test]
    async fn test_owner_quota_and_authorization() {
        let registry = TunnelRegistry::new(2, 1);
        let a = owner("org-a");
        registry
            .register("http://localhost:4000", a.owner_id.clone())
            .await
            .unwrap();
        let t2 = registry
            .register("http://localhost:4001", a.owner_id.clone())
            .await
            .unwrap();
        assert!(t2.secret_token.is_none());

        let err = registry
            .register("http://localhost:4002", a.owner_id.clone())
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::QuotaExceeded);

        // Another owner's principal must not see it
        assert_eq!(
            registry
                .authorized(&t2.id, &owner("org-b"))
                .await
                .unwrap_err(),
            RelayError::NotFound
        );

        // Deactivating frees the slot
        registry.deactivate(&t2.id, &a).await.unwrap();
        registry
            .register("http://localhost:4002", a.owner_id.clone())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deactivated_tunnel_is_gone_to_the_public() {
        let registry = TunnelRegistry::new(5, 1);
        let a = owner("org-a");
        let t = registry
            .register("http://localhost:4000", a.owner_id.clone())
            .await
            .unwrap();
        assert!(registry.resolve_public(&t.id).await.is_ok());
        registry.deactivate(&t.id, &a).await.unwrap();
        assert_eq!(
            registry.resolve_public(&t.id).await.unwrap_err(),
            RelayError::Gone
        );
        assert_eq!(
            registry.resolve_public("missing").await.unwrap_err(),
            RelayError::NotFound
        );
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let registry = TunnelRegistry::new(5, 1);
        let t = registry
            .register("http://localhost:4000", Some("org-a".into()))
            .await
            .unwrap();
        // Nothing is idle yet
        assert_eq!(registry.sweep_idle(3600).await, 0);
        // With a zero-second idle budget everything not touched "now" is stale
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(registry.sweep_idle(0).await, 1);
        assert_eq!(
            registry.resolve_public(&t.id).await.unwrap_err(),
            RelayError::Gone
        );
    }
}
