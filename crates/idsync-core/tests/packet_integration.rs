//! Packet Integration Tests
//!
//! Requests and responses exchanged with a real [`HostEndpoint`] over the
//! loopback transport, without the synchronizer in between.
//!
//! ## Test Scenarios
//!
//! 1. Keyed request round trip with an audit
//! 2. Plaintext host key bootstrap
//! 3. Replayed and stale frames are refused
//! 4. Unsigned or tampered requests are refused
//! 5. Service moved: the client follows the host redirect

mod common;

use std::sync::Arc;

use tempfile::TempDir;

use common::{test_config, Harness, MockHost};
use idsync_core::host::ServiceStatus;
use idsync_core::packet::{Codec, Method, MethodKind, RequestAudit, Sealing, Unsigned};
use idsync_core::{
    ActionRecord, AttributeCache, HostEndpoint, HostKeypair, HostPublicKeys, ManualClock,
    PacketErrorKind, PairKey, ReplayGuard, Request, Response, SetAttribute, StaticResolver,
    Storage, Subject, SyncError, SystemClock,
};
use idsync_core::types::{ActionId, HostId};

fn set_method(pair: &PairKey, value: &str) -> Method {
    let action = SetAttribute::new(pair.clone(), "names", "display", value);
    let record = ActionRecord::capture(ActionId::new(), &action).unwrap();
    record.method(&action).unwrap()
}

fn action_request(h: &Harness, pair: &PairKey, value: &str) -> Request {
    Request::new(
        vec![set_method(pair, value)],
        h.host_id.clone(),
        Subject::Entity(pair.identity.clone()),
        Some(RequestAudit { since: 0 }),
    )
    .unwrap()
}

/// Decode a response the host sent in the clear, checking its signature.
fn decode_plain(h: &Harness, bytes: &[u8], request: &Request, codec: &Codec) -> Response {
    Response::decode(bytes, request, None, codec, Some(&h.host_keys), true).unwrap()
}

#[test]
fn test_request_roundtrip_with_audit() {
    let h = Harness::new(Arc::new(SystemClock));
    h.trust_host_keys();
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);
    let ctx = h.context(test_config());

    let request = action_request(&h, &pair, "Alice");
    let response = request.send(&ctx, true).unwrap();

    assert_eq!(response.len(), 1);
    // Attribute edits accept a null reply
    assert_eq!(response.check_reply(0).unwrap(), None);
    let audit = response.audit().expect("audit requested");
    assert!(audit.entries.is_empty());
    assert!(!audit.state_mutated);
    assert_eq!(h.host.accepted_values(&pair), vec!["Alice"]);
}

#[test]
fn test_host_key_bootstrap() {
    let h = Harness::new(Arc::new(SystemClock));
    let ctx = h.context(test_config());

    let response = Request::host_keys_query(h.host_id.clone())
        .send(&ctx, true)
        .unwrap();
    let reply = response.check_reply(0).unwrap().unwrap();
    assert_eq!(reply.kind, MethodKind::AttributeQuery);
    let keys: HostPublicKeys = postcard::from_bytes(&reply.payload).unwrap();
    assert_eq!(keys, h.host_keys);

    assert_eq!(ctx.host_keys(&h.host_id).unwrap(), h.host_keys);
    assert_eq!(h.cache.host_keys(&h.host_id).unwrap(), h.host_keys);
}

#[test]
fn test_replayed_frame_is_refused() {
    let h = Harness::new(Arc::new(SystemClock));
    h.trust_host_keys();
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);
    let ctx = h.context(test_config());

    let request = action_request(&h, &pair, "Alice");
    request.send(&ctx, true).unwrap();
    let frame = h.transport.frames().pop().unwrap();

    let replayed = h.endpoint.handle(&frame).unwrap();
    let response = decode_plain(&h, &replayed, &request, &ctx.codec);
    let error = response.check_reply(0).unwrap_err();
    assert_eq!(error.kind, PacketErrorKind::Replay);
    assert_eq!(h.host.accepted_values(&pair), vec!["Alice"]);
}

#[test]
fn test_stale_frame_is_refused() {
    let clock = Arc::new(ManualClock::starting_now());
    let h = Harness::new(clock.clone());
    h.trust_host_keys();
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);
    let config = test_config();
    let window = config.replay_window_ms;
    let ctx = h.context(config);

    let request = action_request(&h, &pair, "Alice");
    request.send(&ctx, true).unwrap();
    let frame = h.transport.frames().pop().unwrap();

    clock.advance(window + 1_000);
    let replayed = h.endpoint.handle(&frame).unwrap();
    let response = decode_plain(&h, &replayed, &request, &ctx.codec);
    assert_eq!(
        response.check_reply(0).unwrap_err().kind,
        PacketErrorKind::Encryption
    );
}

#[test]
fn test_unsigned_action_is_refused() {
    let h = Harness::new(Arc::new(SystemClock));
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);
    let ctx = h.context(test_config());

    let request = action_request(&h, &pair, "Alice");
    let frame = request
        .encode(&ctx.codec, &Unsigned, Sealing::Plain)
        .unwrap();
    let bytes = h.endpoint.handle(&frame).unwrap();
    let response = decode_plain(&h, &bytes, &request, &ctx.codec);

    assert_eq!(response.check_reply(0).unwrap_err().kind, PacketErrorKind::Method);
    assert!(h.host.accepted_values(&pair).is_empty());
}

#[test]
fn test_tampered_frame_is_refused() {
    let h = Harness::new(Arc::new(SystemClock));
    h.trust_host_keys();
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);
    let ctx = h.context(test_config());

    let request = action_request(&h, &pair, "Alice");
    request.send(&ctx, true).unwrap();
    let mut frame = h.transport.frames().pop().unwrap();
    let last = frame.len() - 1;
    frame[last] ^= 0xff;

    let bytes = h.endpoint.handle(&frame).unwrap();
    let response = decode_plain(&h, &bytes, &request, &ctx.codec);
    assert!(response.check_reply(0).is_err());
    assert_eq!(h.host.accepted_values(&pair), vec!["Alice"]);
}

#[test]
fn test_moved_service_redirects_to_new_host() {
    let h = Harness::new(Arc::new(SystemClock));
    h.trust_host_keys();
    let pair = PairKey::new("alice@example.org", "profile");
    h.serve(&pair);

    // Second host that now serves the pair; its keys are learned on first use
    let dir = TempDir::new().unwrap();
    let other = HostId::new("id2.example.org");
    let other_storage = Storage::new(dir.path().join("other.redb")).unwrap();
    let other_host = Arc::new(MockHost::new(other_storage.clone(), h.clock.clone()));
    let other_resolver = Arc::new(StaticResolver::new());
    other_resolver.serve(&pair.identity, &["profile"]);
    let config = test_config();
    let replay = Arc::new(ReplayGuard::new(other_storage, h.clock.clone(), &config));
    let endpoint = Arc::new(HostEndpoint::new(
        other.clone(),
        Arc::new(HostKeypair::generate().unwrap()),
        Codec::new(replay, &config),
        &config,
        other_resolver,
        other_host.clone(),
    ));
    h.transport.inner.register(other.clone(), endpoint);

    h.resolver.set_service(
        pair.identity.clone(),
        pair.service.clone(),
        ServiceStatus::Moved(other.clone()),
    );
    let ctx = h.context(config);

    let request = action_request(&h, &pair, "Alice");
    let response = request.send(&ctx, true).unwrap();

    assert!(response.check_reply(0).is_ok());
    assert!(h.host.accepted_values(&pair).is_empty());
    assert_eq!(other_host.accepted_values(&pair), vec!["Alice"]);
    assert_eq!(h.cache.service_host(&pair).unwrap(), other);
}

#[test]
fn test_dissimilar_methods_cannot_share_a_request() {
    let pair = PairKey::new("alice@example.org", "profile");
    let query = Method::new(MethodKind::StateQuery, pair.service.clone(), Vec::new());
    let result = Request::new(
        vec![set_method(&pair, "Alice"), query],
        HostId::new("id.example.org"),
        Subject::Entity(pair.identity.clone()),
        None,
    );
    assert_eq!(result.unwrap_err().kind, PacketErrorKind::Method);

    let empty = Request::new(
        Vec::new(),
        HostId::new("id.example.org"),
        Subject::Entity(pair.identity),
        None,
    );
    assert_eq!(empty.unwrap_err().kind, PacketErrorKind::Elements);
}

#[test]
fn test_request_to_unknown_host_is_transient() {
    let h = Harness::new(Arc::new(SystemClock));
    let ctx = h.context(test_config());
    let result = Request::host_keys_query(HostId::new("nowhere.example.org")).send(&ctx, true);
    let err = result.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    assert!(err.is_transient());
}
