use std::sync::Arc;

use serde_json::json;

use parley_core::blob::{BlobStore, StoredBlob};
use parley_core::engine::EngineSession;
use parley_core::errors::EngineError;
use parley_core::{AttachmentKind, Role};
use parley_store::{ChatStore, Database, SqliteBlobStore, SqliteChatStore, TurnState};
use parley_telemetry::{init_telemetry, TelemetryConfig};
use parley_sync::mock::{MockEngine, MockResponse};
use parley_sync::{AttachmentNormalizer, AttachmentSource, ChatSync, SyncError};

type Harness = ChatSync<SqliteChatStore, MockEngine, SqliteBlobStore>;

fn setup(responses: Vec<MockResponse>) -> (Harness, MockEngine) {
    let _ = init_telemetry(TelemetryConfig {
        log_level: tracing::Level::WARN,
        json: false,
        ..TelemetryConfig::default()
    });
    let db = Database::in_memory().unwrap();
    let engine = MockEngine::new(responses).with_tool_output("calculator", "4");
    let sync = ChatSync::new(SqliteChatStore::new(db.clone()), engine.clone(), SqliteBlobStore::new(db));
    (sync, engine)
}

#[tokio::test]
async fn turns_come_back_in_creation_order() {
    let (sync, _) = setup(vec![MockResponse::text("one"), MockResponse::text("two")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();
    let _ = sync.ask(&mut bound, "first", None).await.unwrap();
    let _ = sync.ask(&mut bound, "second", None).await.unwrap();

    let turns = sync.turns(&conv.id).unwrap();
    let contents: Vec<_> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, ["first", "one", "second", "two"]);
    for pair in turns.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
}

#[tokio::test]
async fn binding_replays_every_turn_in_order() {
    let (sync, engine) = setup(vec![MockResponse::text("hi"), MockResponse::text("again")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();
    let _ = sync.ask(&mut bound, "hello", None).await.unwrap();
    let _ = sync.ask(&mut bound, "more", None).await.unwrap();

    let rebound = sync.bind(&conv.id).unwrap();
    let session = rebound.session();
    assert_eq!(session.added(), 4);
    let replayed: Vec<_> = session.messages().iter().map(|m| (m.role, m.content.text.as_str())).collect();
    assert_eq!(
        replayed,
        [
            (Role::User, "hello"),
            (Role::Assistant, "hi"),
            (Role::User, "more"),
            (Role::Assistant, "again"),
        ]
    );
    assert_eq!(engine.sessions_created(), 2);
}

#[tokio::test]
async fn ask_without_tools_adds_exactly_two_turns() {
    let (sync, _) = setup(vec![MockResponse::text("hello yourself")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let reply = sync.ask(&mut bound, "hello", None).await.unwrap();
    let turns = sync.turns(&conv.id).unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].id, reply.id);
    assert_eq!(reply.input_tokens, Some(10));
    assert_eq!(reply.output_tokens, Some(20));
}

#[tokio::test]
async fn engine_failure_leaves_only_the_user_turn() {
    for failure in [
        MockResponse::FailAfterStart(EngineError::ServerError {
            status: 503,
            body: "overloaded".into(),
        }),
        MockResponse::FailBeforeStart(EngineError::AuthenticationFailed("bad key".into())),
    ] {
        let (sync, _) = setup(vec![MockResponse::text("earlier"), failure]);
        let conv = sync.create_conversation("m").unwrap();
        let mut bound = sync.bind(&conv.id).unwrap();
        let _ = sync.ask(&mut bound, "before", None).await.unwrap();
        let before: Vec<_> = sync.turns(&conv.id).unwrap().into_iter().map(|t| t.id).collect();

        let err = sync.ask(&mut bound, "hello", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Engine(_)), "{err:?}");

        let after = sync.turns(&conv.id).unwrap();
        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(after.iter().take(before.len()).map(|t| t.id.clone()).collect::<Vec<_>>(), before);
        let last = after.last().unwrap();
        assert_eq!((last.role, last.content.as_str()), (Role::User, "hello"));
        assert!(after.iter().all(|t| t.state == TurnState::Complete));
    }
}

#[tokio::test]
async fn tool_results_link_to_their_invocation() {
    let (sync, _) = setup(vec![
        MockResponse::tool_call("t1", "calculator", json!({"expression": "2 + 2"})),
        MockResponse::text("2 + 2 = 4"),
    ]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let reply = sync.ask(&mut bound, "what is 2 + 2?", None).await.unwrap();
    assert_eq!(reply.content, "2 + 2 = 4");

    let turns = sync.turns(&conv.id).unwrap();
    let roles: Vec<_> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, [Role::User, Role::Assistant, Role::Tool, Role::Assistant]);

    let invocations = sync.store().tool_invocations(&turns[1].id).unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].correlation_id, "t1");
    assert_eq!(invocations[0].name, "calculator");
    assert_eq!(invocations[0].arguments["expression"], "2 + 2");
    assert_eq!(turns[2].tool_invocation_id, Some(invocations[0].id.clone()));
    assert_eq!(turns[2].content, "4");

    let replayed = sync.bind(&conv.id).unwrap();
    let messages = replayed.session().messages();
    assert_eq!(messages[1].tool_calls["t1"].name, "calculator");
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn unmatched_tool_result_stays_unlinked() {
    let (sync, _) = setup(Vec::new());
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let mut orphan = parley_core::EngineTurn::tool_result("t1", "4");
    orphan.model_id = Some("m".into());
    sync.engine().push(MockResponse::Reply(orphan));

    let turn = sync.complete(&mut bound).await.unwrap();
    assert_eq!(turn.role, Role::Tool);
    assert_eq!(turn.tool_invocation_id, None);
}

#[tokio::test]
async fn keyed_attachments_flatten_and_persist() {
    let (sync, _) = setup(vec![MockResponse::text("nice pictures")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let source: AttachmentSource = [
        ("a", AttachmentSource::bytes(b"x".to_vec(), "fileX.png")),
        (
            "b",
            AttachmentSource::from(vec![
                AttachmentSource::bytes(b"y".to_vec(), "fileY.pdf"),
                AttachmentSource::bytes(b"z".to_vec(), "fileZ.txt"),
            ]),
        ),
    ]
    .into_iter()
    .collect();

    let names: Vec<_> = AttachmentNormalizer::default()
        .normalize(&source)
        .into_iter()
        .map(|d| d.filename)
        .collect();
    assert_eq!(names, ["fileX.png", "fileY.pdf", "fileZ.txt"]);

    let _ = sync.ask(&mut bound, "look", Some(&source)).await.unwrap();
    let user_turn = sync.turns(&conv.id).unwrap().remove(0);
    let stored = sync.blobs().attachments(&user_turn.id).unwrap();
    let stored_names: Vec<_> = stored.iter().map(|b| b.filename().to_string()).collect();
    assert_eq!(stored_names, names);

    let replayed = sync.bind(&conv.id).unwrap();
    let attachments = &replayed.session().messages()[0].content.attachments;
    assert_eq!(attachments.len(), 3);
    assert_eq!(attachments[0].kind, AttachmentKind::Image);
    assert_eq!(&attachments[1].bytes[..], b"y");
}

#[tokio::test]
async fn stored_blobs_can_be_reattached() {
    let (sync, _) = setup(vec![MockResponse::text("ok"), MockResponse::text("again")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();
    let first = AttachmentSource::bytes(b"report".to_vec(), "report.md");
    let _ = sync.ask(&mut bound, "read this", Some(&first)).await.unwrap();

    let user_turn = sync.turns(&conv.id).unwrap().remove(0);
    let stored: Vec<Arc<dyn StoredBlob>> = sync
        .blobs()
        .attachments(&user_turn.id)
        .unwrap()
        .into_iter()
        .map(|b| Arc::new(b) as Arc<dyn StoredBlob>)
        .collect();
    let _ = sync
        .ask(&mut bound, "and again", Some(&AttachmentSource::Attached(stored)))
        .await
        .unwrap();

    let second_user = sync.turns(&conv.id).unwrap().remove(2);
    let again = sync.blobs().attachments(&second_user.id).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].filename(), "report.md");
}

#[tokio::test]
async fn deleting_a_conversation_removes_turns_and_invocations() {
    let (sync, _) = setup(vec![
        MockResponse::tool_call("t1", "calculator", json!({"expression": "2 + 2"})),
        MockResponse::text("4"),
    ]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();
    let _ = sync.ask(&mut bound, "2 + 2?", None).await.unwrap();
    let caller = sync.turns(&conv.id).unwrap().remove(1);
    assert_eq!(sync.store().tool_invocations(&caller.id).unwrap().len(), 1);

    assert!(sync.delete_conversation(&conv.id).unwrap());
    assert!(sync.turns(&conv.id).unwrap().is_empty());
    assert!(sync.store().tool_invocations(&caller.id).unwrap().is_empty());
    assert!(matches!(sync.conversation(&conv.id), Err(SyncError::Store(_))));
}

#[tokio::test]
async fn deleting_the_calling_turn_nullifies_the_result_link() {
    let (sync, _) = setup(vec![
        MockResponse::tool_call("t1", "calculator", json!({"expression": "2 + 2"})),
        MockResponse::text("4"),
    ]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();
    let _ = sync.ask(&mut bound, "2 + 2?", None).await.unwrap();

    let turns = sync.turns(&conv.id).unwrap();
    let (caller, result) = (&turns[1], &turns[2]);
    assert!(result.tool_invocation_id.is_some());

    assert!(sync.delete_turn(&caller.id).unwrap());
    let remaining = sync.turns(&conv.id).unwrap();
    assert_eq!(remaining.len(), 3);
    let result = remaining.iter().find(|t| t.id == result.id).unwrap();
    assert_eq!(result.tool_invocation_id, None);
    assert_eq!(result.content, "4");
}

#[tokio::test]
async fn instructions_replace_system_turns() {
    let (sync, _) = setup(Vec::new());
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let _ = sync.with_instructions(&mut bound, "be brief", false).unwrap();
    let _ = sync.with_instructions(&mut bound, "be kind", false).unwrap();
    let _ = sync.with_instructions(&mut bound, "be terse", true).unwrap();

    let system: Vec<_> = sync
        .turns(&conv.id)
        .unwrap()
        .into_iter()
        .filter(|t| t.role == Role::System)
        .map(|t| t.content)
        .collect();
    assert_eq!(system, ["be terse"]);
    assert_eq!(bound.session().instructions(), ["be terse"]);
}

#[tokio::test]
async fn explicit_user_turn_then_complete() {
    let (sync, engine) = setup(vec![MockResponse::text("answer")]);
    let conv = sync.create_conversation("m").unwrap();
    let mut bound = sync.bind(&conv.id).unwrap();

    let user = sync.create_user_turn(&mut bound, "question", None).unwrap();
    assert_eq!(user.role, Role::User);
    assert_eq!(engine.completions(), 0);

    let reply = sync.complete(&mut bound).await.unwrap();
    assert_eq!(reply.content, "answer");
    assert_eq!(sync.turns(&conv.id).unwrap().len(), 2);
}
