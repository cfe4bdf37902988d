use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::crd::{ClusterCondition, ManagedCluster, ManagedClusterStatus};
use crate::error::Error;
use crate::kube_api::KubeApi;

/* ============================= CONDITIONS ============================= */

pub const CONDITION_CONTROL_PLANE_READY: &str = "ControlPlaneReady";
pub const CONDITION_PAUSED: &str = "Paused";
pub const CONDITION_SPEC_VALID: &str = "SpecValid";
pub const CONDITION_TALOS_CREDENTIALS: &str = "TalosCredentialsMissing";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Upserts a condition; the transition timestamp only moves when the
/// condition's status flips.
pub fn set_condition(
    status: &mut ManagedClusterStatus,
    type_: &str,
    condition_status: &str,
    reason: &str,
    message: &str,
) {
    let now = Time(Utc::now());
    if let Some(existing) = status.conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != condition_status {
            existing.last_transition_time = Some(now);
        }
        existing.status = condition_status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }
    status.conditions.push(ClusterCondition {
        type_: type_.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Some(now),
    });
}

pub fn clear_condition(status: &mut ManagedClusterStatus, type_: &str) {
    status.conditions.retain(|c| c.type_ != type_);
}

pub fn condition<'a>(
    status: &'a ManagedClusterStatus,
    type_: &str,
) -> Option<&'a ClusterCondition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/* ============================= PERSIST ============================= */

fn is_conflict(err: &Error) -> bool {
    matches!(
        err,
        Error::Kube { source: kube::Error::Api(response) } if response.code == 409
    )
}

/// Writes the status subresource with optimistic-concurrency retries.
///
/// On a version conflict the latest object is re-fetched, its metadata
/// adopted and the in-flight status restored onto it; a previously
/// persisted `status.addons` survives the merge when the in-flight copy
/// lacks one. Retries are bounded; any non-conflict error is immediately
/// fatal.
pub async fn persist(
    kube: &dyn KubeApi,
    cluster: &mut ManagedCluster,
    cfg: &OperatorConfig,
) -> Result<(), Error> {
    let name = cluster.name_any();
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();

    for attempt in 0..=cfg.status_update_retries {
        match kube.replace_cluster_status(cluster).await {
            Ok(updated) => {
                *cluster = updated;
                return Ok(());
            }
            Err(err) if is_conflict(&err) => {
                debug!(cluster = %name, attempt, "status_write_conflict_refetching");
                let Some(latest) = kube.get_cluster(&namespace, &name).await? else {
                    debug!(cluster = %name, "cluster_gone_during_status_write");
                    return Ok(());
                };

                let mut in_flight = cluster.status.take().unwrap_or_default();
                if in_flight.addons.is_none() {
                    in_flight.addons =
                        latest.status.as_ref().and_then(|s| s.addons.clone());
                }
                cluster.metadata = latest.metadata;
                cluster.status = Some(in_flight);

                tokio::time::sleep(cfg.status_retry_interval).await;
            }
            Err(Error::Kube { source }) => {
                warn!(cluster = %name, error = %source, "status_write_fatal");
                return Err(Error::StatusWriteFatal { source });
            }
            Err(other) => return Err(other),
        }
    }

    Err(Error::StatusWriteExhausted { attempts: cfg.status_update_retries })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Conditions ──

    #[test]
    fn test_set_condition_inserts() {
        let mut status = ManagedClusterStatus::default();
        set_condition(
            &mut status,
            CONDITION_CONTROL_PLANE_READY,
            CONDITION_FALSE,
            "QuorumLost",
            "1 of 3 control planes ready",
        );

        let cond = condition(&status, CONDITION_CONTROL_PLANE_READY).unwrap();
        assert_eq!(cond.status, CONDITION_FALSE);
        assert_eq!(cond.reason, "QuorumLost");
        assert!(cond.last_transition_time.is_some());
    }

    #[test]
    fn test_set_condition_flip_bumps_transition_time() {
        let mut status = ManagedClusterStatus::default();
        set_condition(&mut status, CONDITION_PAUSED, CONDITION_TRUE, "Paused", "spec.paused");
        let first = condition(&status, CONDITION_PAUSED)
            .unwrap()
            .last_transition_time
            .clone();

        set_condition(&mut status, CONDITION_PAUSED, CONDITION_TRUE, "Paused", "still paused");
        assert_eq!(
            condition(&status, CONDITION_PAUSED).unwrap().last_transition_time,
            first
        );

        set_condition(&mut status, CONDITION_PAUSED, CONDITION_FALSE, "Resumed", "");
        let flipped = condition(&status, CONDITION_PAUSED)
            .unwrap()
            .last_transition_time
            .clone();
        assert!(flipped.unwrap().0 >= first.unwrap().0);
    }

    #[test]
    fn test_clear_condition() {
        let mut status = ManagedClusterStatus::default();
        set_condition(&mut status, CONDITION_PAUSED, CONDITION_TRUE, "Paused", "");
        clear_condition(&mut status, CONDITION_PAUSED);
        assert!(condition(&status, CONDITION_PAUSED).is_none());
    }

    // ── Conflict detection ──

    fn kube_api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "conflict".to_string(),
                reason: "Conflict".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn test_conflict_detection() {
        assert!(is_conflict(&kube_api_error(409)));
        assert!(!is_conflict(&kube_api_error(500)));
        assert!(!is_conflict(&Error::SpecInvalid("x".to_string())));
    }
}
