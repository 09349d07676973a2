//! Integration tests driving the full service stack in-process: codec,
//! session tracking, registry, and member dispatch over the simulated
//! native library.

use std::sync::Arc;

use tonic::{Code, Request};

use tagger_rpc::codec;
use tagger_rpc::native::sim::SimLibrary;
use tagger_rpc::proto;
use tagger_rpc::proto::tagger_rpc_server::TaggerRpc;
use tagger_rpc::registry::Registry;
use tagger_rpc::server::TaggerRpcService;
use tagger_rpc::value::{ObjectRef, Value};

fn service() -> (Arc<Registry>, TaggerRpcService) {
    TaggerRpcService::bootstrap(Arc::new(SimLibrary::new())).unwrap()
}

async fn open(service: &TaggerRpcService) -> (String, String) {
    let reply = service
        .open_session(Request::new(proto::OpenSessionRequest {}))
        .await
        .unwrap()
        .into_inner();
    (reply.session_id, reply.root_id)
}

async fn call(
    service: &TaggerRpcService,
    session: &str,
    object: &str,
    member: &str,
    args: &[Value],
) -> Result<Value, tonic::Status> {
    let reply = service
        .call_member(Request::new(proto::CallMemberRequest {
            session_id: session.to_string(),
            object_id: object.to_string(),
            member: member.to_string(),
            args_json: codec::encode_args(args),
        }))
        .await?
        .into_inner();
    Ok(codec::decode_result(&reply.result_json).unwrap())
}

async fn create(
    service: &TaggerRpcService,
    session: &str,
    root: &str,
    member: &str,
    args: &[Value],
) -> ObjectRef {
    call(service, session, root, member, args)
        .await
        .unwrap()
        .as_object_ref()
        .cloned()
        .unwrap()
}

#[tokio::test]
async fn test_open_session_and_describe() {
    let (_registry, service) = service();
    let (_session, root) = open(&service).await;
    assert_eq!(root, "TimeTagger");

    let describe = service
        .describe(Request::new(proto::DescribeRequest {}))
        .await
        .unwrap()
        .into_inner();

    let names: Vec<&str> = describe
        .constructors
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert!(names.contains(&"createTimeTagger"));
    assert!(names.contains(&"Countrate"));
    assert!(names.contains(&"SynchronizedMeasurements"));
    assert!(describe.functions.contains(&"getVersion".to_string()));
    // Denylisted and bridge-reserved functions never appear.
    assert!(!describe.functions.contains(&"setLogger".to_string()));
    assert!(!describe.functions.contains(&"freeTimeTagger".to_string()));
}

#[tokio::test]
async fn test_measurement_workflow_with_array_payload() {
    let (_registry, service) = service();
    let (session, root) = open(&service).await;

    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;
    assert_eq!(tagger.kind, "Tagger");

    let serial = call(&service, &session, &tagger.id, "getSerial", &[])
        .await
        .unwrap();
    assert!(serial.as_str().unwrap().starts_with("SIM-"));

    call(
        &service,
        &session,
        &tagger.id,
        "setTestSignal",
        &[Value::Int(1), Value::Bool(true)],
    )
    .await
    .unwrap();

    let countrate = create(
        &service,
        &session,
        &root,
        "Countrate",
        &[Value::Ref(tagger.clone()), Value::Int(1)],
    )
    .await;
    call(&service, &session, &countrate.id, "start", &[])
        .await
        .unwrap();

    // getData travels as an NPY payload and decodes back into an array.
    let data = call(&service, &session, &countrate.id, "getData", &[])
        .await
        .unwrap();
    let rates = data.as_array().unwrap().to_f64_vec().unwrap();
    assert_eq!(rates.len(), 1);
    assert!(rates[0] > 0.0, "live test signal must count: {:?}", rates);
}

#[tokio::test]
async fn test_release_object_idempotent_and_close_makes_reference_stale() {
    let (_registry, service) = service();
    let (session, root) = open(&service).await;
    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;

    let release = |id: String| {
        let service = &service;
        let session = session.clone();
        async move {
            service
                .release_object(Request::new(proto::ReleaseObjectRequest {
                    session_id: session,
                    object_id: id,
                }))
                .await
                .map(|r| r.into_inner().was_open)
        }
    };

    assert!(release(tagger.id.clone()).await.unwrap());
    // Releasing again is a no-op, not an error.
    assert!(!release(tagger.id.clone()).await.unwrap());

    // Any member access through the retired identity is NOT_FOUND.
    let err = call(&service, &session, &tagger.id, "getSerial", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_session_teardown_releases_everything() {
    let (registry, service) = service();
    let (session, root) = open(&service).await;

    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;
    create(
        &service,
        &session,
        &root,
        "Countrate",
        &[Value::Ref(tagger.clone()), Value::Int(1)],
    )
    .await;
    assert_eq!(registry.object_count(), 2);

    let closed = service
        .close_session(Request::new(proto::CloseSessionRequest {
            session_id: session.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(closed.released, 2);
    assert_eq!(registry.object_count(), 0);

    // The torn-down session can no longer issue calls.
    let err = call(&service, &session, &root, "getVersion", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Its references are stale for everyone.
    let (other, _) = open(&service).await;
    let err = call(&service, &other, &tagger.id, "getSerial", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_session_teardown_sweeps_group_and_members() {
    let (registry, service) = service();
    let (session, root) = open(&service).await;

    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;
    let countrate = create(
        &service,
        &session,
        &root,
        "Countrate",
        &[Value::Ref(tagger.clone()), Value::Int(1)],
    )
    .await;
    let group = create(
        &service,
        &session,
        &root,
        "SynchronizedMeasurements",
        &[Value::Ref(tagger.clone())],
    )
    .await;
    call(
        &service,
        &session,
        &group.id,
        "registerMeasurement",
        &[Value::Ref(countrate.clone())],
    )
    .await
    .unwrap();

    // Explicitly close the measurement first; teardown must stay clean even
    // when part of the set was already released.
    service
        .release_object(Request::new(proto::ReleaseObjectRequest {
            session_id: session.clone(),
            object_id: countrate.id.clone(),
        }))
        .await
        .unwrap();

    let closed = service
        .close_session(Request::new(proto::CloseSessionRequest {
            session_id: session.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(closed.released, 2, "tagger and group remained to sweep");
    assert_eq!(registry.object_count(), 0);

    let (other, _) = open(&service).await;
    for id in [&tagger.id, &countrate.id, &group.id] {
        let err = call(&service, &other, id, "isRunning", &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }
}

#[tokio::test]
async fn test_status_code_mapping() {
    let (_registry, service) = service();
    let (session, root) = open(&service).await;

    // Unknown session.
    let err = call(&service, "session-bogus", &root, "getVersion", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Fabricated object id.
    let err = call(&service, &session, "TimeTagger-bogus", "getSerial", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    // Unknown member on the root.
    let err = call(&service, &session, &root, "noSuchThing", &[])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    // Malformed argument payload.
    let err = service
        .call_member(Request::new(proto::CallMemberRequest {
            session_id: session.clone(),
            object_id: root.clone(),
            member: "getVersion".to_string(),
            args_json: "{not json".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Native failure forwards the message.
    let err = call(
        &service,
        &session,
        &root,
        "createTimeTagger",
        &[Value::Str("SIM-NO-SUCH-SERIAL".into())],
    )
    .await
    .err();
    if let Some(status) = err {
        assert_eq!(status.code(), Code::Internal);
    }
}

#[tokio::test]
async fn test_enum_definitions_are_idempotent() {
    let (_registry, service) = service();

    let first = service
        .enum_definitions(Request::new(proto::EnumDefinitionsRequest {}))
        .await
        .unwrap()
        .into_inner();
    let second = service
        .enum_definitions(Request::new(proto::EnumDefinitionsRequest {}))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(first, second);

    let edge = first
        .enums
        .iter()
        .find(|e| e.name == "ChannelEdge")
        .expect("ChannelEdge must be exported");
    assert_eq!(edge.representation, "IntEnum");
    assert!(edge.variants.iter().any(|v| v.label == "Rising"));
    // Legacy attribute-style enums are synthesized too.
    assert!(first.enums.iter().any(|e| e.name == "Resolution"));
}

#[tokio::test]
async fn test_group_tagger_identity_is_stable() {
    let (_registry, service) = service();
    let (session, root) = open(&service).await;
    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;
    let group = create(
        &service,
        &session,
        &root,
        "SynchronizedMeasurements",
        &[Value::Ref(tagger)],
    )
    .await;

    let first = call(&service, &session, &group.id, "getTagger", &[])
        .await
        .unwrap();
    let second = call(&service, &session, &group.id, "getTagger", &[])
        .await
        .unwrap();
    assert_eq!(
        first.as_object_ref().unwrap().id,
        second.as_object_ref().unwrap().id
    );
}

#[tokio::test]
async fn test_property_rpcs() {
    let (_registry, service) = service();
    let (session, root) = open(&service).await;
    let tagger = create(&service, &session, &root, "createTimeTagger", &[]).await;

    let reply = service
        .get_property(Request::new(proto::PropertyRequest {
            session_id: session.clone(),
            object_id: tagger.id.clone(),
            name: "model".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    let model = codec::decode_result(&reply.result_json).unwrap();
    assert_eq!(model.as_str(), Some("Time Tagger Ultra (simulated)"));

    // The root object has no properties.
    let err = service
        .get_property(Request::new(proto::PropertyRequest {
            session_id: session.clone(),
            object_id: root.clone(),
            name: "model".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}
