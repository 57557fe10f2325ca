use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use admin_requests::{
    RequestError, RequestService,
    config::ServiceConfig,
    directory::{DirectoryError, InMemoryDirectory, User, UserDirectory},
    error::{ERR_LIMIT_REACHED, Entity, QuotaKind},
    notify::{Dispatcher, EmailClient, Notification, NotificationClient, NotificationError},
    types::ListFilter,
};
use anyhow::Context;
use serde_json::{Value, json};
use sled::open;
use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

// Sled uses file-based locking to prevent concurrent access, so every test
// opens its own database under a temp dir. The dir must outlive the service.
fn service_with(
    name: &str,
    config: ServiceConfig,
) -> anyhow::Result<(TempDir, RequestService, Arc<InMemoryDirectory>)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join(name))?);
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_user("ipcdev", Some("ipcdev@example.org"))?;
    directory.add_user("admin", Some("admin@example.org"))?;

    let service = RequestService::new(db, config, directory.clone())?;
    Ok((temp_dir, service, directory))
}

fn service(name: &str) -> anyhow::Result<(TempDir, RequestService, Arc<InMemoryDirectory>)> {
    service_with(name, ServiceConfig::default())
}

#[derive(Default)]
struct RecordingNotifications {
    sent: Mutex<Vec<Notification>>,
    fail: bool,
}

impl NotificationClient for RecordingNotifications {
    fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.fail {
            return Err(NotificationError::Notification {
                user: notification.user.clone(),
                reason: "agent unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingEmail {
    sent: Mutex<Vec<(String, String, String, Value)>>,
}

impl EmailClient for RecordingEmail {
    fn send(
        &self,
        to: &str,
        template: &str,
        subject: &str,
        payload: &Value,
    ) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push((
            to.to_string(),
            template.to_string(),
            subject.to_string(),
            payload.clone(),
        ));
        Ok(())
    }
}

struct SlowNotifications {
    delay: Duration,
}

impl NotificationClient for SlowNotifications {
    fn send(&self, _notification: &Notification) -> Result<(), NotificationError> {
        thread::sleep(self.delay);
        Ok(())
    }
}

// Fails lookups of one user while `down` is set.
struct FlakyDirectory {
    inner: InMemoryDirectory,
    flaky_user: String,
    down: AtomicBool,
}

impl UserDirectory for FlakyDirectory {
    fn find_user(&self, username: &str) -> Result<Option<User>, DirectoryError> {
        if self.down.load(Ordering::SeqCst) && username == self.flaky_user {
            return Err(DirectoryError {
                username: username.to_string(),
                reason: "directory unavailable".into(),
            });
        }
        self.inner.find_user(username)
    }
}

#[test]
fn total_quota_stops_third_nomination() -> anyhow::Result<()> {
    let (_dir, service, _) = service("total_quota.db")?;
    service
        .registry()
        .register_type("vice-chair-nomination", Some(2), None)?;

    for nominee in ["alice", "bob"] {
        service
            .submit("ipcdev", "vice-chair-nomination", json!({ "nominee": nominee }))
            .context("nomination within quota was refused")?;
    }

    let err = service
        .submit("ipcdev", "vice-chair-nomination", json!({ "nominee": "carol" }))
        .unwrap_err();
    let RequestError::QuotaExceeded(violation) = &err else {
        panic!("expected a quota rejection, got {err:?}");
    };
    assert_eq!(violation.kind, QuotaKind::Total);
    assert_eq!(err.status_code(), 400);
    assert_eq!(err.error_code(), Some(ERR_LIMIT_REACHED));
    assert_eq!(
        err.details(),
        Some(json!({
            "requestType": "vice-chair-nomination",
            "maximumRequests": 2,
            "submittedRequests": 2,
        }))
    );

    // the total quota counts completed requests too
    let first = service.list(&ListFilter::new())?[0].id.clone();
    service.update_status(&first, "approved", "admin", "Accepted.")?;
    assert!(matches!(
        service.submit("ipcdev", "vice-chair-nomination", json!({ "nominee": "dave" })),
        Err(RequestError::QuotaExceeded(_))
    ));

    // quotas are per user
    service.submit("admin", "vice-chair-nomination", json!({ "nominee": "erin" }))?;
    Ok(())
}

#[test]
fn completing_a_request_frees_a_concurrent_slot() -> anyhow::Result<()> {
    let (_dir, service, _) = service("concurrent_slot.db")?;
    service.registry().register_type("access", None, Some(1))?;

    let first = service.submit("ipcdev", "access", json!({ "system": "hpc" }))?;

    let err = service
        .submit("ipcdev", "access", json!({ "system": "storage" }))
        .unwrap_err();
    assert_eq!(
        err.details(),
        Some(json!({
            "requestType": "access",
            "maximumActiveRequests": 1,
            "activeSubmittedRequests": 1,
        }))
    );

    // moving to a non-terminal status keeps the slot taken
    service.update_status(&first.id, "in-progress", "admin", "Working on it.")?;
    assert!(
        service
            .submit("ipcdev", "access", json!({ "system": "storage" }))
            .is_err()
    );

    service.update_status(&first.id, "approved", "admin", "Granted.")?;
    let second = service.submit("ipcdev", "access", json!({ "system": "storage" }))?;
    assert_eq!(second.status, "submitted");
    Ok(())
}

#[test]
fn submit_then_get_details() -> anyhow::Result<()> {
    let (_dir, service, _) = service("details.db")?;
    service.registry().register_type("access", None, None)?;

    let details = json!({ "reason": "research", "systems": ["hpc", "storage"] });
    let summary = service.submit("ipcdev", "access", details.clone())?;

    assert!(summary.id.starts_with("req_1"));
    assert_eq!(summary.requesting_user, "ipcdev");
    assert_eq!(summary.request_type, "access");
    assert_eq!(summary.status, "submitted");
    assert_eq!(summary.details, details);

    let found = service
        .get_details(&summary.id)?
        .context("submitted request is missing")?;
    assert_eq!(found.details, details);
    assert_eq!(found.updated_date, summary.updated_date);
    assert_eq!(found.updates.len(), 1);
    assert_eq!(found.updates[0].status, "submitted");
    assert_eq!(found.updates[0].updating_user, "ipcdev");
    assert_eq!(found.updates[0].message, "Request submitted.");

    let event = service.update_status(&summary.id, "in-progress", "admin", "Looking into it.")?;
    let found = service.get_details(&summary.id)?.context("request vanished")?;
    assert_eq!(found.status, "in-progress");
    assert_eq!(found.updated_date, event.created_date);
    assert_eq!(found.updates.len(), 2);
    assert_eq!(found.updates[1].updating_user, "admin");
    assert!(found.updates[0].created_date <= found.updates[1].created_date);

    assert!(service.get_details("req_missing")?.is_none());
    Ok(())
}

#[test]
fn rejected_requests_drop_out_of_default_listing() -> anyhow::Result<()> {
    let (_dir, service, _) = service("reject_list.db")?;
    service.registry().register_type("access", None, None)?;

    let kept = service.submit("ipcdev", "access", json!({ "n": 1 }))?;
    let rejected = service.submit("ipcdev", "access", json!({ "n": 2 }))?;
    service.update_status(&rejected.id, "rejected", "admin", "Not eligible.")?;

    let active: Vec<_> = service
        .list(&ListFilter::new())?
        .into_iter()
        .map(|summary| summary.id)
        .collect();
    assert_eq!(active, vec![kept.id.clone()]);

    let everything = service.list(&ListFilter::new().include_completed(true))?;
    assert_eq!(everything.len(), 2);
    // the rejection is the most recent status change, so it sorts last
    assert_eq!(everything[1].id, rejected.id);
    assert_eq!(everything[1].status, "rejected");
    Ok(())
}

#[test]
fn listing_filters_by_type_and_user() -> anyhow::Result<()> {
    let (_dir, service, _) = service("list_filters.db")?;
    service.registry().register_type("access", None, None)?;
    service.registry().register_type("quota-increase", None, None)?;

    service.submit("ipcdev", "access", json!({}))?;
    service.submit("ipcdev", "quota-increase", json!({ "gb": 100 }))?;
    service.submit("admin", "access", json!({}))?;

    let access = service.list(&ListFilter::new().request_type("access"))?;
    assert_eq!(access.len(), 2);
    assert!(access.iter().all(|summary| summary.request_type == "access"));

    let mine = service.list(&ListFilter::new().requesting_user("ipcdev"))?;
    assert_eq!(mine.len(), 2);

    let both = service.list(
        &ListFilter::new()
            .request_type("quota-increase")
            .requesting_user("ipcdev"),
    )?;
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].details, json!({ "gb": 100 }));

    let listing = service.list(&ListFilter::new())?;
    assert!(
        listing
            .windows(2)
            .all(|pair| pair[0].updated_date <= pair[1].updated_date)
    );
    for summary in &listing {
        let current = service
            .ledger()
            .project_current(&summary.id)?
            .context("listed request has no ledger")?;
        assert_eq!(current.status, summary.status);
        assert_eq!(current.timestamp, summary.updated_date);
    }
    Ok(())
}

#[test]
fn racing_submissions_never_exceed_quota() -> anyhow::Result<()> {
    let (_dir, service, _) = service("racing.db")?;
    service.registry().register_type("access", Some(3), None)?;

    let outcomes: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let service = &service;
                scope.spawn(move || service.submit("ipcdev", "access", json!({ "n": n })))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("submission thread panicked"))
            .collect()
    });

    let admitted = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(admitted, 3);
    assert!(
        outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .all(|err| matches!(err, RequestError::QuotaExceeded(_)))
    );
    assert_eq!(service.list(&ListFilter::new())?.len(), 3);
    Ok(())
}

#[test]
fn status_updates_reject_unknown_references() -> anyhow::Result<()> {
    let (_dir, service, _) = service("unknown_refs.db")?;
    service.registry().register_type("access", None, None)?;
    let summary = service.submit("ipcdev", "access", json!({}))?;

    assert!(matches!(
        service.update_status("req_missing", "approved", "admin", ""),
        Err(RequestError::NotFound {
            entity: Entity::Request,
            ..
        })
    ));
    assert!(matches!(
        service.update_status(&summary.id, "complete", "admin", ""),
        Err(RequestError::NotFound {
            entity: Entity::StatusCode,
            ..
        })
    ));

    let err = service
        .update_status(&summary.id, "approved", "nobody", "")
        .unwrap_err();
    assert!(matches!(
        err,
        RequestError::NotFound {
            entity: Entity::User,
            ..
        }
    ));
    assert_eq!(err.status_code(), 400);

    assert!(matches!(
        service.update_status(&summary.id, "approved", "", ""),
        Err(RequestError::InvalidArgument(_))
    ));

    // none of the failures touched the ledger
    assert_eq!(service.ledger().list_events(&summary.id)?.len(), 1);
    Ok(())
}

#[test]
fn submissions_validate_type_and_details() -> anyhow::Result<()> {
    let (_dir, service, _) = service("validation.db")?;

    let err = service.submit("ipcdev", "missing", json!({})).unwrap_err();
    assert_eq!(err.to_string(), "request type not found: missing");
    assert_eq!(err.status_code(), 400);

    service.registry().register_type("access", None, None)?;
    assert!(matches!(
        service.submit("ipcdev", "access", Value::Null),
        Err(RequestError::InvalidArgument(_))
    ));
    assert!(matches!(
        service.submit("stranger", "access", json!({})),
        Err(RequestError::NotFound {
            entity: Entity::User,
            ..
        })
    ));
    assert!(service.list(&ListFilter::new().include_completed(true))?.is_empty());
    Ok(())
}

#[test]
fn notifications_follow_commits() -> anyhow::Result<()> {
    let (_dir, service, _) = service("notify.db")?;
    let notifications = Arc::new(RecordingNotifications::default());
    let email = Arc::new(RecordingEmail::default());
    let service = service.with_dispatcher(
        Dispatcher::new(email.clone(), notifications.clone())
            .with_admin_email(Some("support@example.org".into())),
    );
    service.registry().register_type("access", None, None)?;

    let summary = service.submit("ipcdev", "access", json!({ "reason": "research" }))?;
    service.update_status(&summary.id, "approved", "admin", "Granted.")?;

    let sent = notifications.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].kind, "requests");
    assert_eq!(sent[0].user, "ipcdev");
    assert_eq!(sent[0].email_template, "request_submitted");
    assert_eq!(sent[0].payload["reason"], "research");
    assert_eq!(sent[1].email_template, "request_approved");
    assert_eq!(sent[1].payload["message"], "Granted.");
    assert_eq!(sent[1].payload["email_address"], "ipcdev@example.org");

    let emails = email.sent.lock().unwrap();
    assert_eq!(emails.len(), 1);
    let (to, template, subject, payload) = &emails[0];
    assert_eq!(to, "support@example.org");
    assert_eq!(template, "request_submitted");
    assert_eq!(subject, "New Administrative Request");
    assert_eq!(payload["request_id"], summary.id.as_str());
    Ok(())
}

#[test]
fn failed_notification_keeps_the_request() -> anyhow::Result<()> {
    let (_dir, service, _) = service("notify_fail.db")?;
    let notifications = Arc::new(RecordingNotifications {
        fail: true,
        ..Default::default()
    });
    let service = service.with_dispatcher(Dispatcher::new(
        Arc::new(RecordingEmail::default()),
        notifications,
    ));
    service.registry().register_type("access", None, None)?;

    let err = service
        .submit("ipcdev", "access", json!({}))
        .unwrap_err();
    let RequestError::NotificationFailed { request_id, .. } = &err else {
        panic!("expected a notification failure, got {err:?}");
    };
    assert_eq!(err.status_code(), 500);

    let listed = service.list(&ListFilter::new())?;
    assert_eq!(listed.len(), 1);
    assert_eq!(&listed[0].id, request_id);
    Ok(())
}

#[test]
fn usernames_are_qualified_with_the_domain() -> anyhow::Result<()> {
    let config = ServiceConfig {
        user_domain: Some("iplantcollaborative.org".into()),
        ..Default::default()
    };
    let (_dir, service, directory) = service_with("domain.db", config)?;
    directory.add_user("sciuser@iplantcollaborative.org", None)?;
    service.registry().register_type("access", None, None)?;

    let summary = service.submit("sciuser", "access", json!({}))?;
    assert_eq!(summary.requesting_user, "sciuser");

    // the unqualified directory entries are unreachable once a domain is set
    assert!(service.submit("ipcdev", "access", json!({})).is_err());
    Ok(())
}

#[test]
fn requests_survive_reopening() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db_path = temp_dir.path().join("reopen.db");
    let directory = Arc::new(InMemoryDirectory::new());
    directory.add_user("ipcdev", None)?;

    let id = {
        let db = Arc::new(open(&db_path)?);
        let service = RequestService::new(db, ServiceConfig::default(), directory.clone())?;
        service.registry().register_type("access", Some(1), None)?;
        service.submit("ipcdev", "access", json!({ "n": 1 }))?.id
    };

    let db = Arc::new(open(&db_path)?);
    let service = RequestService::new(db, ServiceConfig::default(), directory)?;
    let found = service.get_details(&id)?.context("request lost on reopen")?;
    assert_eq!(found.status, "submitted");
    assert!(matches!(
        service.submit("ipcdev", "access", json!({ "n": 2 })),
        Err(RequestError::QuotaExceeded(_))
    ));
    Ok(())
}

#[test]
fn lifecycle_completes_within_timeout() -> anyhow::Result<()> {
    let (temp_dir, service, _) = service("lifecycle_timeout.db")?;
    service.registry().register_type("access", None, None)?;

    let (done, finished) = mpsc::channel();
    thread::spawn(move || {
        let _temp_dir = temp_dir;
        let outcome = service
            .submit("ipcdev", "access", json!({ "reason": "research" }))
            .and_then(|summary| service.update_status(&summary.id, "approved", "admin", "Granted."))
            .map(|event| event.status);
        let _ = done.send(outcome);
    });

    let status = finished
        .recv_timeout(Duration::from_secs(10))
        .context("submit and update_status did not finish")??;
    assert_eq!(status, "approved");
    Ok(())
}

#[test]
fn slow_notifications_do_not_block_the_next_submission() -> anyhow::Result<()> {
    let mut config = ServiceConfig::default();
    config.admission.lock_timeout_ms = 100;
    let (_dir, service, _) = service_with("slow_notify.db", config)?;
    let service = service.with_dispatcher(Dispatcher::new(
        Arc::new(RecordingEmail::default()),
        Arc::new(SlowNotifications {
            delay: Duration::from_millis(600),
        }),
    ));
    service.registry().register_type("access", None, None)?;

    let (first, second) = thread::scope(|scope| {
        let first = scope.spawn(|| service.submit("ipcdev", "access", json!({ "n": 1 })));
        // the first submission is committed and sitting in its notification by now
        thread::sleep(Duration::from_millis(200));
        let second = service.submit("ipcdev", "access", json!({ "n": 2 }));
        (first.join().expect("submission thread panicked"), second)
    });

    first?;
    second?;
    assert_eq!(service.list(&ListFilter::new())?.len(), 2);
    Ok(())
}

#[test]
fn configured_admin_email_receives_submissions() -> anyhow::Result<()> {
    let config = ServiceConfig::from_toml(
        r#"
            admin_email = "support@example.org"
        "#,
    )?;
    let (_dir, service, _) = service_with("admin_email.db", config)?;
    let email = Arc::new(RecordingEmail::default());
    let service = service.with_dispatcher(Dispatcher::new(
        email.clone(),
        Arc::new(RecordingNotifications::default()),
    ));
    service.registry().register_type("access", None, None)?;

    service.submit("ipcdev", "access", json!({}))?;

    let emails = email.sent.lock().unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].0, "support@example.org");
    assert_eq!(emails[0].2, "New Administrative Request");
    Ok(())
}

#[test]
fn reopened_request_counts_as_active_again() -> anyhow::Result<()> {
    let (_dir, service, _) = service("reopen_active.db")?;
    service.registry().register_type("access", None, Some(1))?;

    let first = service.submit("ipcdev", "access", json!({ "n": 1 }))?;
    service.update_status(&first.id, "approved", "admin", "Granted.")?;
    assert!(service.list(&ListFilter::new())?.is_empty());

    service.update_status(&first.id, "in-progress", "admin", "Reopened.")?;

    let active = service.list(&ListFilter::new())?;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, first.id);
    assert_eq!(active[0].status, "in-progress");

    let err = service
        .submit("ipcdev", "access", json!({ "n": 2 }))
        .unwrap_err();
    let RequestError::QuotaExceeded(violation) = &err else {
        panic!("expected a quota rejection, got {err:?}");
    };
    assert_eq!(violation.kind, QuotaKind::Concurrent);
    assert_eq!(violation.current, 1);
    Ok(())
}

#[test]
fn expired_admission_wait_is_a_conflict() -> anyhow::Result<()> {
    let mut config = ServiceConfig::default();
    config.admission.lock_timeout_ms = 50;
    let (_dir, service, directory) = service_with("conflict.db", config)?;
    service.registry().register_type("access", None, None)?;
    let ipcdev = directory.find_user("ipcdev")?.context("ipcdev is missing")?;

    let held = service.admission_locks().acquire(&ipcdev.id, "access")?;
    let err = service.submit("ipcdev", "access", json!({})).unwrap_err();
    assert!(matches!(err, RequestError::Conflict { .. }));
    assert_eq!(err.status_code(), 503);
    assert!(
        service
            .list(&ListFilter::new().include_completed(true))?
            .is_empty()
    );

    // other users and other types are unaffected
    service.submit("admin", "access", json!({}))?;

    drop(held);
    service.submit("ipcdev", "access", json!({}))?;
    assert_eq!(
        service
            .list(&ListFilter::new().requesting_user("ipcdev"))?
            .len(),
        1
    );
    Ok(())
}

#[test]
fn update_notifies_even_when_requester_lookup_fails() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = Arc::new(open(temp_dir.path().join("flaky_directory.db"))?);
    let inner = InMemoryDirectory::new();
    inner.add_user("ipcdev", Some("ipcdev@example.org"))?;
    inner.add_user("admin", None)?;
    let directory = Arc::new(FlakyDirectory {
        inner,
        flaky_user: "ipcdev".into(),
        down: AtomicBool::new(false),
    });

    let notifications = Arc::new(RecordingNotifications::default());
    let service = RequestService::new(db, ServiceConfig::default(), directory.clone())?
        .with_dispatcher(Dispatcher::new(
            Arc::new(RecordingEmail::default()),
            notifications.clone(),
        ));
    service.registry().register_type("access", None, None)?;

    let summary = service.submit("ipcdev", "access", json!({}))?;
    directory.down.store(true, Ordering::SeqCst);
    let event = service.update_status(&summary.id, "approved", "admin", "Granted.")?;
    assert_eq!(event.status, "approved");

    let sent = notifications.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].payload["username"], "ipcdev");
    assert!(sent[1].payload.get("email_address").is_none());
    Ok(())
}
