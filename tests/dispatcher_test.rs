//! Dispatcher behaviour end to end over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use flowgate::auth::{IdentityResolver, JwtIdentityResolver};
use flowgate::config::{Policy, RateLimitPolicy};
use flowgate::dispatch::{Backends, Connection, Dispatcher, Envelope, OffloadClient, OffloadWorker};
use flowgate::model::{Identity, collections};
use flowgate::store::{DocumentStore, Filter, Query};
use secrecy::SecretString;
use serde_json::json;

struct Setup {
    backends: Backends,
    resolver: Arc<JwtIdentityResolver>,
}

fn setup() -> Setup {
    let backends = Backends::in_memory();
    let resolver = Arc::new(JwtIdentityResolver::new(
        &SecretString::from("dispatcher-test-key"),
        backends.store.clone(),
        2,
    ));
    Setup { backends, resolver }
}

impl Setup {
    fn dispatcher(&self, policy: Policy) -> Dispatcher {
        Dispatcher::build(&self.backends, self.resolver.clone(), policy)
    }

    fn token(&self) -> String {
        let ann = Identity::new("5f0c1d2e3a4b5c6d7e8f9a0b", "Ann", "ann");
        self.resolver.issue(&ann, Duration::from_secs(600)).unwrap()
    }
}

#[tokio::test]
async fn unknown_commands_get_an_error_reply() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let mut conn = Connection::unlimited();

    let request = Envelope::request("frobnicate", json!({}));
    let reply = dispatcher.process(&mut conn, request.clone()).await.unwrap();
    assert_eq!(reply.replyto.as_deref(), Some(request.id.as_str()));
    assert_eq!(reply.error_message(), Some("Unknown command frobnicate"));
}

#[tokio::test]
async fn ping_needs_no_identity() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let reply = dispatcher
        .process(&mut Connection::unlimited(), Envelope::request("ping", json!({})))
        .await
        .unwrap();
    assert_eq!(reply.command, "ping");
    assert_eq!(reply.data["result"], json!("pong"));
}

#[tokio::test]
async fn commands_without_credentials_are_refused() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let reply = dispatcher
        .process(
            &mut Connection::unlimited(),
            Envelope::request("popworkitem", json!({"wiq": "any"})),
        )
        .await
        .unwrap();
    assert_eq!(reply.error_message(), Some("Not signed in, and missing jwt"));

    let reply = dispatcher
        .process(
            &mut Connection::unlimited(),
            Envelope::request("popworkitem", json!({"wiq": "any"})).with_jwt("not-a-token"),
        )
        .await
        .unwrap();
    assert_eq!(reply.error_message(), Some("Failed resolving token"));
}

#[tokio::test]
async fn signin_binds_the_identity_to_the_connection() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let mut conn = Connection::unlimited();

    let reply = dispatcher
        .process(&mut conn, Envelope::request("signin", json!({"jwt": s.token()})))
        .await
        .unwrap();
    assert_eq!(reply.error_message(), None);
    assert_eq!(reply.data["result"]["user"]["username"], json!("ann"));
    assert!(reply.data.get("jwt").is_none(), "credentials are stripped from replies");
    assert_eq!(conn.identity().map(|i| i.username.as_str()), Some("ann"));

    // Later requests ride on the connection's identity.
    let reply = dispatcher
        .process(
            &mut conn,
            Envelope::request(
                "addworkitemqueue",
                json!({"name": "inbox", "maxretries": 3, "retrydelay": 0, "initialdelay": 0}),
            ),
        )
        .await
        .unwrap();
    assert_eq!(reply.error_message(), None);
    assert_eq!(reply.data["result"]["name"], json!("inbox"));
}

#[tokio::test]
async fn guests_are_minted_when_enabled() {
    let s = setup();
    let policy = Policy {
        enable_guest: true,
        ..Policy::default()
    };
    let dispatcher = s.dispatcher(policy);
    let mut conn = Connection::unlimited();

    let reply = dispatcher
        .process(&mut conn, Envelope::request("count", json!({"collectionname": "users"})))
        .await
        .unwrap();
    assert_eq!(reply.error_message(), None);
    assert!(conn.identity().is_some_and(Identity::is_guest));
    assert!(conn.credential().is_some());
}

#[tokio::test]
async fn handler_errors_become_error_replies() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let reply = dispatcher
        .process(
            &mut Connection::unlimited(),
            Envelope::request("updateworkitem", json!({"state": "successful"})).with_jwt(s.token()),
        )
        .await
        .unwrap();
    assert_eq!(reply.command, "error");
    assert_eq!(reply.error_message(), Some("_id is mandatory"));
}

#[tokio::test]
async fn bursts_beyond_the_quota_are_limited() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let mut conn = Connection::new(&RateLimitPolicy {
        enabled: true,
        points: 2,
        duration_secs: 60,
        disconnect_points: 100,
    });

    for _ in 0..2 {
        let reply = dispatcher
            .process(&mut conn, Envelope::request("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(reply.error_message(), None);
    }
    let reply = dispatcher
        .process(&mut conn, Envelope::request("ping", json!({})))
        .await
        .unwrap();
    assert_eq!(reply.error_message(), Some("Rate limit exceeded"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn floods_close_the_connection() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let mut conn = Connection::new(&RateLimitPolicy {
        enabled: true,
        points: 1,
        duration_secs: 60,
        disconnect_points: 3,
    });
    for _ in 0..4 {
        dispatcher
            .process(&mut conn, Envelope::request("ping", json!({})))
            .await;
    }
    assert!(conn.is_closed());
}

#[tokio::test]
async fn replies_resolve_pending_requests() {
    let s = setup();
    let dispatcher = s.dispatcher(Policy::default());
    let mut conn = Connection::unlimited();

    let outbound = Envelope::request("queuemessage", json!({"data": 1}));
    let pending = conn.pending().register(outbound.id.clone()).unwrap();
    let reply = outbound.reply(json!({"ok": true}));

    assert!(dispatcher.process(&mut conn, reply).await.is_none());
    let answered = pending.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(answered.data["ok"], json!(true));
    assert!(conn.pending().is_empty());
}

#[tokio::test]
async fn offloaded_commands_round_trip_through_a_worker() {
    let s = setup();
    let mut policy = Policy::default();
    policy.offload.enabled = true;
    policy.offload.queue = "offload-test".into();

    let client = OffloadClient::start(s.backends.bus.clone(), &policy.offload)
        .await
        .unwrap();
    let dispatcher = Arc::new(s.dispatcher(policy.clone()).with_offload(client.clone()));
    let worker = OffloadWorker::new(dispatcher.clone(), s.backends.bus.clone(), &policy.offload);
    let running = worker.clone();
    let handle = tokio::spawn(async move { running.run().await });

    let mut request = Envelope::request(
        "addworkitemqueue",
        json!({"name": "remote", "maxretries": 3, "retrydelay": 0, "initialdelay": 0}),
    )
    .with_jwt(s.token());
    request.correlation_id = Some("corr-42".into());

    let reply = dispatcher
        .process(&mut Connection::unlimited(), request.clone())
        .await
        .unwrap();
    assert_eq!(reply.error_message(), None);
    assert_eq!(reply.replyto.as_deref(), Some(request.id.as_str()));
    assert_eq!(reply.correlation_id.as_deref(), Some("corr-42"));
    assert_eq!(reply.data["result"]["name"], json!("remote"));

    let stored = s
        .backends
        .store
        .query(
            collections::MQ,
            &Query::new(Filter::eq("name", "remote")),
            &Identity::root(),
        )
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);

    worker.shutdown();
    client.shutdown();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn shared_correlation_ids_reach_their_own_callers() {
    let s = setup();
    let mut policy = Policy::default();
    policy.offload.enabled = true;
    policy.offload.queue = "offload-shared".into();

    let client = OffloadClient::start(s.backends.bus.clone(), &policy.offload)
        .await
        .unwrap();
    let dispatcher = Arc::new(s.dispatcher(policy.clone()).with_offload(client.clone()));
    let worker = OffloadWorker::new(dispatcher.clone(), s.backends.bus.clone(), &policy.offload);
    let running = worker.clone();
    let handle = tokio::spawn(async move { running.run().await });

    let bob = Identity::new("5f0c1d2e3a4b5c6d7e8f9a0c", "Bob", "bob");
    let bob_token = s.resolver.issue(&bob, Duration::from_secs(600)).unwrap();
    let request = |name: &str, jwt: String| {
        let mut env = Envelope::request(
            "addworkitemqueue",
            json!({"name": name, "maxretries": 3, "retrydelay": 0, "initialdelay": 0}),
        )
        .with_jwt(jwt);
        env.correlation_id = Some("1".into());
        env
    };

    let mut ann_conn = Connection::unlimited();
    let mut bob_conn = Connection::unlimited();
    let (ann_reply, bob_reply) = tokio::join!(
        dispatcher.process(&mut ann_conn, request("ann-q", s.token())),
        dispatcher.process(&mut bob_conn, request("bob-q", bob_token)),
    );
    let ann_reply = ann_reply.unwrap();
    let bob_reply = bob_reply.unwrap();

    assert_eq!(ann_reply.error_message(), None);
    assert_eq!(bob_reply.error_message(), None);
    assert_eq!(ann_reply.data["result"]["name"], json!("ann-q"));
    assert_eq!(bob_reply.data["result"]["name"], json!("bob-q"));
    assert_eq!(ann_reply.correlation_id.as_deref(), Some("1"));
    assert_eq!(bob_reply.correlation_id.as_deref(), Some("1"));

    worker.shutdown();
    client.shutdown();
    handle.await.unwrap().unwrap();
}
