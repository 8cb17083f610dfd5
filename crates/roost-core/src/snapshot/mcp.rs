//! MCP server status derived from bundle configuration and the clock.

use chrono::{DateTime, Utc};

use crate::bundle::McpServerConfig;

/// Read-only view of one MCP server, recomputed on every clock or
/// configuration change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerStatus {
    pub name: String,
    pub loaded: bool,
    pub authenticated: bool,
    pub expired: bool,
}

/// Derive statuses for `configs` as of `now`.
///
/// A credential with `expires_at <= now` is expired; a server is
/// authenticated when it needs no auth or holds an unexpired credential.
pub fn derive_statuses(configs: &[McpServerConfig], now: DateTime<Utc>) -> Vec<McpServerStatus> {
    configs
        .iter()
        .map(|cfg| {
            let expired = cfg
                .credential
                .as_ref()
                .and_then(|c| c.expires_at)
                .is_some_and(|at| at <= now);
            let authenticated = !cfg.requires_auth || (cfg.credential.is_some() && !expired);
            McpServerStatus {
                name: cfg.name.clone(),
                loaded: cfg.loaded,
                authenticated,
                expired,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::McpCredential;
    use chrono::{Duration, TimeZone};

    fn server(name: &str, requires_auth: bool, expires_at: Option<Option<DateTime<Utc>>>) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            loaded: true,
            requires_auth,
            credential: expires_at.map(|expires_at| McpCredential { expires_at }),
        }
    }

    #[test]
    fn credential_expiry_is_inclusive() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let configs = vec![
            server("past", true, Some(Some(now - Duration::seconds(1)))),
            server("exact", true, Some(Some(now))),
            server("future", true, Some(Some(now + Duration::hours(1)))),
            server("forever", true, Some(None)),
        ];

        let statuses = derive_statuses(&configs, now);
        let flags: Vec<_> = statuses
            .iter()
            .map(|s| (s.name.as_str(), s.authenticated, s.expired))
            .collect();
        assert_eq!(
            flags,
            vec![
                ("past", false, true),
                ("exact", false, true),
                ("future", true, false),
                ("forever", true, false),
            ]
        );
    }

    #[test]
    fn missing_credential_is_unauthenticated_but_not_expired() {
        let now = Utc::now();
        let statuses = derive_statuses(&[server("gh", true, None)], now);
        assert!(!statuses[0].authenticated);
        assert!(!statuses[0].expired);
    }

    #[test]
    fn server_without_auth_counts_as_authenticated() {
        let now = Utc::now();
        let statuses = derive_statuses(&[server("fs", false, None)], now);
        assert!(statuses[0].authenticated);
    }

    #[test]
    fn status_flips_when_clock_passes_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let configs = vec![server("gh", true, Some(Some(now + Duration::seconds(30))))];
        assert!(derive_statuses(&configs, now)[0].authenticated);
        assert!(!derive_statuses(&configs, now + Duration::seconds(30))[0].authenticated);
    }
}
