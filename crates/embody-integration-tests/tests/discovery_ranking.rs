//! Discovery answers over the wire: capability matching, filters and the
//! latency and load terms of the ranking.

mod common;

use std::time::Duration;

use common::{BODY_ID, Federation};
use embody_core::{AgentRole, TrustLevel};
use embody_discovery::{DiscoveredBody, DiscoveryQuery};
use embody_protocol::Message;
use embody_test::{MockToolBackend, TestAgent, dev_box};
use serde_json::json;

async fn discover(fed: &Federation, query: DiscoveryQuery) -> Vec<DiscoveredBody> {
    match fed
        .send(&fed.guest, &Message::DiscoverBodies(query))
        .await
        .unwrap()
    {
        Message::BodiesDiscovered(found) => found.bodies,
        other => panic!("expected bodiesDiscovered, got {other:?}"),
    }
}

fn ids(bodies: &[DiscoveredBody]) -> Vec<&str> {
    bodies.iter().map(|b| b.body_id.as_str()).collect()
}

#[tokio::test]
async fn test_faster_body_ranks_first() {
    let fed = Federation::new().await;

    // A second, slow host registered later; on equal scores the newer body
    // would win, so only latency can put the dev box ahead.
    let slow_host = TestAgent::new("host-slow");
    let slow_body = dev_box("slow-box", &slow_host.id);
    MockToolBackend::new()
        .with_delay(Duration::from_millis(80))
        .install(fed.broker.tools(), &slow_body);
    fed.send(
        &slow_host,
        &slow_host.registration(AgentRole::Host, vec![slow_body]),
    )
    .await
    .unwrap();

    let fast = fed.grant().await.session_token;
    let other = fed.extra_guest("guest-2");
    let Message::EmbodimentGranted(slow) = fed
        .send(&other, &other.request("slow-box", None))
        .await
        .unwrap()
    else {
        panic!("expected a grant");
    };

    fed.call(&fast, "file.read", json!({"path": "/workspace/a"}))
        .await
        .unwrap();
    fed.send(
        &other,
        &other.tool_call(&slow.session_token, "file.read", json!({"path": "/workspace/a"})),
    )
    .await
    .unwrap();

    let ranked = discover(&fed, DiscoveryQuery::for_capabilities(["file.read"])).await;
    assert_eq!(ids(&ranked), vec![BODY_ID, "slow-box"]);
    assert!(ranked[0].score > ranked[1].score);
    let slow_latency = ranked[1].avg_latency_ms.unwrap();
    assert!(slow_latency >= 80.0);
}

#[tokio::test]
async fn test_load_lowers_rank() {
    let fed = Federation::new().await;
    fed.add_host("host-2", "dev-box-2", TrustLevel::Untrusted).await;

    // Fill half of the dev box's capacity.
    fed.grant().await;

    let ranked = discover(&fed, DiscoveryQuery::for_capabilities(["shell.exec"])).await;
    assert_eq!(ids(&ranked), vec!["dev-box-2", BODY_ID]);
    assert_eq!(ranked[1].active_sessions, 1);
    assert_eq!(ranked[0].active_sessions, 0);
}

#[tokio::test]
async fn test_prefix_and_overlap() {
    let fed = Federation::new().await;

    let ranked = discover(&fed, DiscoveryQuery::for_capabilities(["file.*"])).await;
    assert_eq!(ids(&ranked), vec![BODY_ID]);

    let ranked = discover(
        &fed,
        DiscoveryQuery::for_capabilities(["file.read", "gpu.train"]),
    )
    .await;
    assert_eq!(ranked.len(), 1);
    // Half the wanted capabilities are offered.
    assert!(ranked[0].score < 0.8);

    let ranked = discover(&fed, DiscoveryQuery::for_capabilities(["gpu.*"])).await;
    assert!(ranked.is_empty());
}

#[tokio::test]
async fn test_filters_and_limit() {
    let fed = Federation::new().await;
    fed.add_host("host-2", "dev-box-2", TrustLevel::Untrusted).await;
    fed.add_host("host-3", "dev-box-3", TrustLevel::Untrusted).await;
    fed.broker
        .identities()
        .set_trust(&fed.host.id, TrustLevel::Trusted)
        .unwrap();

    let all = discover(&fed, DiscoveryQuery::default()).await;
    assert_eq!(all.len(), 3);

    let limited = discover(
        &fed,
        DiscoveryQuery {
            max_results: Some(2),
            ..DiscoveryQuery::default()
        },
    )
    .await;
    assert_eq!(limited.len(), 2);

    let wrong_env = discover(
        &fed,
        DiscoveryQuery {
            environment_type: Some("gpu-vm".into()),
            ..DiscoveryQuery::default()
        },
    )
    .await;
    assert!(wrong_env.is_empty());

    // Host trust is captured when the body is published.
    let trusted = discover(
        &fed,
        DiscoveryQuery {
            min_trust_level: Some(TrustLevel::Basic),
            ..DiscoveryQuery::default()
        },
    )
    .await;
    assert!(trusted.is_empty());
}

#[tokio::test]
async fn test_body_without_handlers_is_refused() {
    let fed = Federation::new().await;
    let host = TestAgent::new("host-lazy");
    let body = dev_box("lazy-box", &host.id);

    let err = fed
        .send(&host, &host.registration(AgentRole::Host, vec![body]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MISSING_HANDLER");

    let ranked = discover(&fed, DiscoveryQuery::default()).await;
    assert_eq!(ids(&ranked), vec![BODY_ID]);
}

#[tokio::test]
async fn test_guest_cannot_publish_bodies() {
    let fed = Federation::new().await;
    let sneaky = TestAgent::new("sneaky");
    let body = dev_box("sneaky-box", &sneaky.id);
    fed.backend.install(fed.broker.tools(), &body);

    let err = fed
        .send(&sneaky, &sneaky.registration(AgentRole::Guest, vec![body]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
}

#[tokio::test]
async fn test_host_cannot_publish_for_another() {
    let fed = Federation::new().await;
    let host = TestAgent::new("host-2");
    let body = dev_box("hijack", &fed.host.id);
    fed.backend.install(fed.broker.tools(), &body);

    let err = fed
        .send(&host, &host.registration(AgentRole::Host, vec![body]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN");
    assert!(fed.broker.index().get(&embody_core::BodyId::new("hijack")).unwrap().is_none());
}
