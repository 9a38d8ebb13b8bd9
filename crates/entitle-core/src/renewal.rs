//! ---
//! ent_section: "01-core-functionality"
//! ent_subsection: "module"
//! ent_type: "source"
//! ent_scope: "code"
//! ent_description: "Entitlement manager and license server integration."
//! ent_version: "v0.0.0-prealpha"
//! ent_owner: "tbd"
//! ---
use std::sync::Weak;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::{EntitlementManager, RefreshOutcome};

/// Timing of the background renewal loop.
#[derive(Debug, Clone, Copy)]
pub struct RenewalPolicy {
    /// How long before expiry a renewal is attempted.
    pub offset: Duration,
    /// Wait after a failed or fruitless attempt, or while no certificate is loaded.
    pub retry_interval: Duration,
}

/// Time left until a certificate expiring at `expires_at` is due for renewal.
pub fn renewal_delay(expires_at: DateTime<Utc>, offset: Duration, now: DateTime<Utc>) -> Duration {
    let offset = chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());
    (expires_at - offset - now).to_std().unwrap_or(Duration::ZERO)
}

/// Spawn the renewal loop. The task holds only a weak reference, so it ends
/// on its own once the manager is dropped.
pub(crate) fn spawn(
    manager: Weak<EntitlementManager>,
    policy: RenewalPolicy,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // an overdue certificate right after an attempt waits for the retry interval
        let mut attempted = false;
        loop {
            let delay = {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match manager.current_expiry() {
                    None => policy.retry_interval,
                    Some(expires_at) => {
                        let due = renewal_delay(expires_at, policy.offset, Utc::now());
                        if due.is_zero() && attempted {
                            policy.retry_interval
                        } else {
                            due
                        }
                    }
                }
            };
            debug!(delay_secs = delay.as_secs(), "next license renewal scheduled");

            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("renewal scheduler cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(manager) = manager.upgrade() else {
                break;
            };
            if manager.current_expiry().is_none() {
                attempted = false;
                continue;
            }
            attempted = true;
            match manager.renew_in_background().await {
                Ok(RefreshOutcome::Changed) => {
                    info!("scheduled license renewal applied a new certificate");
                }
                Ok(outcome) => {
                    debug!(?outcome, "scheduled license renewal left the certificate unchanged");
                }
                Err(err) => {
                    warn!(error = %err, retry_secs = policy.retry_interval.as_secs(), "scheduled license renewal failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_counts_back_from_expiry() {
        let now = Utc::now();
        let expires = now + chrono::Duration::hours(10);
        let delay = renewal_delay(expires, Duration::from_secs(3600), now);
        assert_eq!(delay, Duration::from_secs(9 * 3600));
    }

    #[test]
    fn overdue_renewal_is_immediate() {
        let now = Utc::now();
        let expires = now + chrono::Duration::hours(1);
        assert_eq!(
            renewal_delay(expires, Duration::from_secs(72 * 3600), now),
            Duration::ZERO
        );
    }
}
