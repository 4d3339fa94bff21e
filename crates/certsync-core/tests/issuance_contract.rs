//! Contract Test: All-or-Nothing DNS-01 Issuance
//!
//! Constraints verified:
//! - One order covers the domain plus SANs, deduplicated, order kept
//! - One `_acme-challenge` TXT record per authorization, in the domain's zone
//! - Challenge records are always removed, whatever the outcome
//! - Cleanup failures never downgrade a successful issuance
//! - A failed attempt never writes certificate material
//! - fingerprint == sha256(fullchain)
//! - Every CA request is bounded by the challenge timeout

mod common;

use certsync_core::challenge::dns01_digest;
use certsync_core::config::ChallengeConfig;
use certsync_core::error::Error;
use certsync_core::material::fingerprint;
use certsync_core::model::{CertificateStatus, ChallengeType, TaskStatus};
use certsync_core::scheduler::AttemptOutcome;
use certsync_core::traits::LifecycleStore;
use chrono::{Duration, Utc};
use common::*;

#[tokio::test]
async fn end_to_end_issuance_produces_active_certificate() {
    let h = Harness::new(CaBehavior::Issue).await;
    let cert = h.add_certificate("example.com", &["www.example.com"]).await;

    let outcome = h.scheduler.issue(&cert.id).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Issued { .. }));

    let stored = h.reload(&cert.id).await;
    assert_eq!(stored.status, CertificateStatus::Active);
    assert_eq!(stored.fail_count, 0);
    assert!(stored.next_retry_at.is_none());
    assert!(stored.last_renew_attempt.is_some());
    assert_eq!(stored.fingerprint, fingerprint(stored.fullchain_pem.as_bytes()));
    assert!(stored.key_pem.contains("PRIVATE KEY"));
    assert!(stored.fullchain_pem.starts_with(stored.cert_pem.trim_end()));
    assert!(!stored.ca_pem.is_empty());

    let expires_at = stored.expires_at.unwrap();
    let expected = Utc::now() + Duration::days(90);
    assert!((expires_at - expected).num_minutes().abs() < 5);

    assert_eq!(
        h.acme.ordered_identifiers(),
        vec![vec!["example.com".to_string(), "www.example.com".to_string()]]
    );

    let created = h.dns.created();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|r| r.zone == "example.com"));
    assert_eq!(created[0].name, "_acme-challenge.example.com");
    assert_eq!(created[1].name, "_acme-challenge.www.example.com");
    assert_eq!(created[0].value, dns01_digest("token-0.thumbprint"));
    assert_eq!(h.dns.removed(), created);

    assert_eq!(h.notifier.sent().len(), 1);
    let tasks = h.store.tasks_for_certificate(&cert.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert!(!h.store.task_logs(&tasks[0].task_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn wildcard_identifiers_share_the_base_record_name() {
    let h = Harness::new(CaBehavior::Issue).await;
    let cert = h.add_certificate("*.example.com", &["example.com"]).await;

    h.scheduler.issue(&cert.id).await.unwrap();

    let created = h.dns.created();
    assert_eq!(created.len(), 2);
    for record in &created {
        assert_eq!(record.zone, "example.com");
        assert_eq!(record.name, "_acme-challenge.example.com");
    }
    assert_ne!(created[0].value, created[1].value);
}

#[tokio::test]
async fn duplicate_sans_are_ordered_once() {
    let h = Harness::new(CaBehavior::Issue).await;
    let cert = h
        .add_certificate("example.com", &["www.example.com", "example.com"])
        .await;

    h.coordinator.issue(&cert.id).await.unwrap();

    assert_eq!(
        h.acme.ordered_identifiers()[0],
        vec!["example.com".to_string(), "www.example.com".to_string()]
    );
}

#[tokio::test]
async fn rejected_order_cleans_up_and_persists_no_material() {
    let h = Harness::new(CaBehavior::Reject("Incorrect TXT record".to_string())).await;
    let cert = h.add_certificate("example.com", &["www.example.com"]).await;

    let err = h.coordinator.issue(&cert.id).await.err().unwrap();
    assert!(matches!(err, Error::ValidationRejected { .. }));
    assert!(err.to_string().contains("Incorrect TXT record"));
    assert_eq!(h.acme.finalize_calls(), 0);

    assert_eq!(h.dns.removed(), h.dns.created());

    let stored = h.reload(&cert.id).await;
    assert!(stored.fingerprint.is_empty());
    assert!(stored.key_pem.is_empty());
}

#[tokio::test]
async fn propagation_timeout_aborts_before_validation() {
    let h = Harness::with_propagation(CaBehavior::Issue, FixedPropagation::never()).await;
    let cert = h.add_certificate("example.com", &[]).await;

    let err = h.coordinator.issue(&cert.id).await.err().unwrap();
    match err {
        Error::PropagationTimeout { record, .. } => {
            assert_eq!(record, "_acme-challenge.example.com")
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(h.propagation.checks() >= 1);
    assert_eq!(h.acme.ready_calls(), 0);
    assert_eq!(h.dns.removed().len(), 1);
}

#[tokio::test]
async fn provider_failure_is_fatal_to_the_attempt() {
    let h = Harness::new(CaBehavior::Issue).await;
    h.dns.set_fail_create(true);
    let cert = h.add_certificate("example.com", &[]).await;

    let err = h.coordinator.issue(&cert.id).await.err().unwrap();
    assert!(matches!(err, Error::Provider { .. }));
    assert_eq!(h.acme.ready_calls(), 0);
    assert!(h.dns.removed().is_empty());
}

#[tokio::test]
async fn cleanup_failure_does_not_downgrade_success() {
    let h = Harness::new(CaBehavior::Issue).await;
    h.dns.set_fail_remove(true);
    let cert = h.add_certificate("example.com", &[]).await;

    let outcome = h.scheduler.issue(&cert.id).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Issued { .. }));
    assert_eq!(h.dns.removed().len(), 1);
    assert_eq!(h.reload(&cert.id).await.status, CertificateStatus::Active);
}

#[tokio::test]
async fn http01_is_refused_without_contacting_the_ca() {
    let h = Harness::new(CaBehavior::Issue).await;
    let mut cert = h.add_certificate("example.com", &[]).await;
    cert.challenge_type = ChallengeType::Http01;
    h.store.update_certificate(&cert).await.unwrap();

    let err = h.coordinator.issue(&cert.id).await.err().unwrap();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(h.acme.new_order_calls(), 0);
}

#[tokio::test]
async fn renewal_changes_the_fingerprint() {
    let h = Harness::new(CaBehavior::Issue).await;
    let cert = h.add_certificate("example.com", &[]).await;

    h.scheduler.issue(&cert.id).await.unwrap();
    let first = h.reload(&cert.id).await.fingerprint;

    let renewed = h.coordinator.renew(&cert.id).await.unwrap();
    assert_ne!(renewed.fingerprint, first);
    assert_eq!(renewed.fingerprint, fingerprint(renewed.fullchain_pem.as_bytes()));
}

fn one_second_challenge_config() -> ChallengeConfig {
    ChallengeConfig {
        challenge_timeout_secs: 1,
        ..fast_challenge_config()
    }
}

#[tokio::test]
async fn unresponsive_ca_on_new_order_is_bounded() {
    let h =
        Harness::with_challenge_config(CaBehavior::StallOrders, one_second_challenge_config()).await;
    let cert = h.add_certificate("example.com", &[]).await;

    let started = std::time::Instant::now();
    let err = h.coordinator.issue(&cert.id).await.err().unwrap();
    assert!(matches!(err, Error::Acme(_)));
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(h.dns.created().is_empty());
}

#[tokio::test]
async fn unresponsive_ca_after_publishing_still_cleans_up() {
    let h = Harness::with_challenge_config(
        CaBehavior::StallChallenges,
        one_second_challenge_config(),
    )
    .await;
    let cert = h.add_certificate("example.com", &["www.example.com"]).await;

    let outcome = h.scheduler.issue(&cert.id).await.unwrap();
    assert!(matches!(outcome, AttemptOutcome::Failed { fail_count: 1, .. }));
    assert_eq!(h.acme.ready_calls(), 1);
    assert_eq!(h.acme.finalize_calls(), 0);
    assert_eq!(h.dns.removed(), h.dns.created());
    assert_eq!(h.notifier.sent().len(), 1);
}
