//! Whole-engine runs: bootstrap, agent loop, real built-in tools and a
//! tool server written in `sh`.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use na_domain::config::{McpServerConfig, McpTransportKind};
use na_domain::tool::Turn;
use na_domain::ErrorKind;
use na_engine::bootstrap::build_engine_with_router;
use na_engine::runtime::mcp::disconnect_server;
use na_engine::runtime::tools::ToolOrigin;
use na_engine::runtime::{handle_inbound, InboundMessage, LoopOutcome};

use common::*;

/// `crash` takes the whole server down. `note` declares a nested schema.
const SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh","version":"0"}}}\n' "$id" ;;
    *'"method":"notifications/'*) ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}},{"name":"crash"},{"name":"note","inputSchema":{"type":"object","properties":{"title":{"type":"string","minLength":1},"level":{"type":"string","enum":["low","high"]},"meta":{"type":"object","properties":{"tags":{"type":"array","items":{"type":"string"}}},"required":["tags"]}},"required":["title","meta"],"additionalProperties":false}}]}}\n' "$id" ;;
    *'"name":"crash"'*)
      exit 1 ;;
    *'"name":"note"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"noted"}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      text=$(printf '%s' "$line" | sed -n 's/.*"text":"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echo: %s"}]}}\n' "$id" "$text" ;;
  esac
done
"#;

fn sh_server(dir: &std::path::Path, name: &str) -> McpServerConfig {
    let script = dir.join(format!("{name}.sh"));
    std::fs::write(&script, SERVER).unwrap();
    McpServerConfig {
        name: name.into(),
        transport: McpTransportKind::Stdio,
        command: "sh".into(),
        args: vec![script.to_string_lossy().into_owned()],
        env: HashMap::new(),
        url: None,
        headers: HashMap::new(),
        tool_timeout_secs: None,
    }
}

#[tokio::test]
async fn file_tools_write_then_read_through_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[(
                "w1",
                "write_file",
                json!({ "path": "notes/todo.txt", "content": "buy milk" }),
            )]),
            call_tools(&[("r1", "read_file", json!({ "path": "notes/todo.txt" }))]),
            answer("You need to buy milk."),
        ],
        false,
    );
    let ctx = build_engine_with_router(&config(dir.path()), router(provider.clone()), None)
        .await
        .unwrap();

    let reply = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "remember milk"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, LoopOutcome::Done);
    assert_eq!(reply.text, "You need to buy milk.");

    let on_disk = std::fs::read_to_string(workspace(dir.path()).join("notes/todo.txt")).unwrap();
    assert_eq!(on_disk, "buy milk");

    let results = provider.tool_results(2);
    assert_eq!(results.len(), 2);
    assert!(results[1].1.to_string().contains("buy milk"));
}

#[tokio::test]
async fn unknown_tool_and_escaping_path_are_reported_to_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[
                ("a", "teleport", json!({})),
                ("b", "read_file", json!({ "path": "../../etc/passwd" })),
                ("c", "read_file", json!({ "offset": 3 })),
            ]),
            answer("I cannot do that."),
        ],
        true,
    );
    let ctx = build_engine_with_router(&config(dir.path()), router(provider.clone()), None)
        .await
        .unwrap();

    let reply = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "go"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, LoopOutcome::Done);

    let results = provider.tool_results(1);
    let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    assert_eq!(results[0].1["error_kind"], "tool-not-found");
    assert!(results[0].1["message"].as_str().unwrap().contains("read_file"));
    assert_eq!(results[1].1["error_kind"], "sandbox-violation");
    assert_eq!(results[2].1["error_kind"], "tool-validation");
}

#[cfg(unix)]
#[tokio::test]
async fn shell_timeout_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.tools.exec.timeout_secs = 1;
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[(
                "s1",
                "exec",
                json!({ "command": "sleep 30 & echo $! > child.pid; wait" }),
            )]),
            answer("That took too long."),
        ],
        false,
    );
    let ctx = build_engine_with_router(&cfg, router(provider.clone()), None)
        .await
        .unwrap();

    let started = std::time::Instant::now();
    handle_inbound(&ctx, InboundMessage::new("cli", "alice", "wait"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let results = provider.tool_results(1);
    assert_eq!(results[0].1["error_kind"], "tool-timeout");

    let pid = std::fs::read_to_string(workspace(dir.path()).join("child.pid")).unwrap();
    let pid = pid.trim();
    let mut alive = true;
    for _ in 0..20 {
        let status = std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();
        if !status.success() {
            alive = false;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!alive, "background child {pid} survived the timeout");
}

#[tokio::test]
async fn crashed_tool_server_leaves_builtins_working() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.mcp.allowed_commands = vec!["sh".into()];
    cfg.mcp.reconnect_cooldown_secs = 300;
    cfg.mcp.servers = vec![sh_server(dir.path(), "notes")];
    std::fs::create_dir_all(workspace(dir.path())).unwrap();
    std::fs::write(workspace(dir.path()).join("hello.txt"), "hi from disk").unwrap();

    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[("e1", "mcp_notes_echo", json!({ "text": "ping" }))]),
            call_tools(&[("x1", "mcp_notes_crash", json!({}))]),
            call_tools(&[
                ("e2", "mcp_notes_echo", json!({ "text": "again" })),
                ("r1", "read_file", json!({ "path": "hello.txt" })),
            ]),
            answer("done"),
        ],
        false,
    );
    let ctx = build_engine_with_router(&cfg, router(provider.clone()), None)
        .await
        .unwrap();

    let origins: Vec<ToolOrigin> = ctx.tools.descriptors().into_iter().map(|d| d.origin).collect();
    assert!(origins.contains(&ToolOrigin::Server("notes".into())));

    let reply = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "use the server"))
        .await
        .unwrap();
    assert_eq!(reply.outcome, LoopOutcome::Done);

    let results = provider.tool_results(3);
    let by_id: HashMap<&str, &serde_json::Value> =
        results.iter().map(|(id, v)| (id.as_str(), v)).collect();
    assert_eq!(by_id["e1"], &json!("echo: ping"));
    assert_eq!(by_id["x1"]["error_kind"], "tool-server-unavailable");
    assert_eq!(by_id["e2"]["error_kind"], "tool-server-unavailable");
    assert!(by_id["r1"].to_string().contains("hi from disk"));

    ctx.shutdown().await;
}

#[tokio::test]
async fn unreachable_tool_server_does_not_block_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.mcp.servers = vec![McpServerConfig {
        name: "ghost".into(),
        command: "definitely-not-installed".into(),
        ..sh_server(dir.path(), "ghost")
    }];
    let provider = ScriptedProvider::new(vec![answer("still here")], false);
    let ctx = build_engine_with_router(&cfg, router(provider), None)
        .await
        .unwrap();

    assert!(ctx
        .tools
        .descriptors()
        .iter()
        .all(|d| d.origin == ToolOrigin::Builtin));
    let reply = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "hi"))
        .await
        .unwrap();
    assert_eq!(reply.text, "still here");
}

#[tokio::test]
async fn concurrent_messages_to_one_session_do_not_interleave() {
    let dir = tempfile::tempdir().unwrap();
    // Each run makes one tool call and then answers.
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[("t1", "list_dir", json!({ "path": "." }))]),
            answer("first"),
            call_tools(&[("t2", "list_dir", json!({ "path": "." }))]),
            answer("second"),
        ],
        false,
    );
    let ctx = build_engine_with_router(&config(dir.path()), router(provider.clone()), None)
        .await
        .unwrap();

    let a = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "one"));
    let b = handle_inbound(&ctx, InboundMessage::new("cli", "alice", "two"));
    let (ra, rb) = tokio::join!(a, b);
    let mut texts = vec![ra.unwrap().text, rb.unwrap().text];
    texts.sort();
    assert_eq!(texts, ["first", "second"]);

    let key = InboundMessage::new("cli", "alice", "").session_key();
    let history = ctx.sessions.history(&key, 100).await.unwrap();
    let kinds: Vec<&str> = history.iter().map(Turn::kind_str).collect();
    assert_eq!(
        kinds,
        [
            "user", "assistant", "tool_result", "assistant",
            "user", "assistant", "tool_result", "assistant",
        ]
    );
}

#[tokio::test]
async fn failed_run_is_recorded_and_next_message_sees_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.agent.max_iterations = 2;
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[("l1", "list_dir", json!({ "path": "." }))]),
            call_tools(&[("l2", "list_dir", json!({ "path": "." }))]),
            answer("recovered"),
        ],
        false,
    );
    let ctx = build_engine_with_router(&cfg, router(provider.clone()), None)
        .await
        .unwrap();

    let first = handle_inbound(&ctx, InboundMessage::new("telegram", "42", "look around"))
        .await
        .unwrap();
    assert_eq!(
        first.outcome,
        LoopOutcome::Failed {
            error_kind: ErrorKind::IterationCapExceeded
        }
    );

    let second = handle_inbound(&ctx, InboundMessage::new("telegram", "42", "and now?"))
        .await
        .unwrap();
    assert_eq!(second.text, "recovered");

    // Both partial tool results and the cap reply reached the third call.
    let seen = provider.seen.lock();
    let third = &seen[2].turns;
    assert_eq!(
        third.iter().filter(|t| matches!(t, Turn::ToolResult(_))).count(),
        2
    );
    assert_eq!(third.last().and_then(|t| t.text()), Some("and now?"));
}

#[tokio::test]
async fn disconnected_server_tools_become_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.mcp.allowed_commands = vec!["sh".into()];
    cfg.mcp.servers = vec![sh_server(dir.path(), "notes")];
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[("e1", "mcp_notes_echo", json!({ "text": "hi" }))]),
            answer("gone"),
        ],
        false,
    );
    let ctx = build_engine_with_router(&cfg, router(provider.clone()), None)
        .await
        .unwrap();
    let before = ctx.tools.len();

    let manager = ctx.mcp.clone().unwrap();
    assert!(disconnect_server(&ctx.tools, &manager, "notes").await);
    assert_eq!(ctx.tools.len(), before - 3);
    assert!(!manager.is_up("notes"));

    handle_inbound(&ctx, InboundMessage::new("cli", "alice", "echo"))
        .await
        .unwrap();
    let results = provider.tool_results(1);
    assert_eq!(results[0].1["error_kind"], "tool-not-found");
}

#[tokio::test]
async fn busy_session_queue_does_not_hold_worker_slots() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.agent.max_concurrent_turns = 2;
    let latency = Duration::from_millis(400);
    let provider = ScriptedProvider::with_latency(
        (0..4).map(|_| answer("ok")).collect(),
        false,
        latency,
    );
    let ctx = build_engine_with_router(&cfg, router(provider), None)
        .await
        .unwrap();

    let mut queued = Vec::new();
    for i in 0..3 {
        let ctx = ctx.clone();
        queued.push(tokio::spawn(async move {
            handle_inbound(&ctx, InboundMessage::new("cli", "a", format!("m{i}"))).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    handle_inbound(&ctx, InboundMessage::new("cli", "b", "hello"))
        .await
        .unwrap();
    let waited = started.elapsed();
    assert!(
        waited < latency + Duration::from_millis(250),
        "session b waited {waited:?}"
    );

    for q in queued {
        q.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn server_schema_is_enforced_the_same_way_every_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.mcp.allowed_commands = vec!["sh".into()];
    cfg.mcp.servers = vec![sh_server(dir.path(), "notes")];

    let bad = json!({ "title": "x", "level": "urgent", "meta": { "tags": [1] } });
    let missing = json!({ "title": "x" });
    let good = json!({ "title": "x", "level": "high", "meta": { "tags": ["a"] } });
    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[
                ("b1", "mcp_notes_note", bad.clone()),
                ("b2", "mcp_notes_note", bad),
                ("m1", "mcp_notes_note", missing),
                ("g1", "mcp_notes_note", good.clone()),
                ("g2", "mcp_notes_note", good),
            ]),
            answer("done"),
        ],
        false,
    );
    let ctx = build_engine_with_router(&cfg, router(provider.clone()), None)
        .await
        .unwrap();
    let note = ctx.tools.get("mcp_notes_note").unwrap();
    assert_eq!(note.definition.parameters["properties"]["meta"]["required"], json!(["tags"]));

    handle_inbound(&ctx, InboundMessage::new("cli", "alice", "take notes"))
        .await
        .unwrap();

    let results = provider.tool_results(1);
    let by_id: HashMap<&str, &serde_json::Value> =
        results.iter().map(|(id, v)| (id.as_str(), v)).collect();
    assert_eq!(by_id["b1"]["error_kind"], "tool-validation");
    assert_eq!(by_id["b1"], by_id["b2"]);
    let message = by_id["b1"]["message"].as_str().unwrap();
    assert!(message.contains("level"), "{message}");
    assert!(message.contains("meta.tags[0]"), "{message}");
    assert_eq!(by_id["m1"]["error_kind"], "tool-validation");
    assert!(by_id["m1"]["message"].as_str().unwrap().contains("meta"));
    assert_eq!(by_id["g1"], &json!("noted"));
    assert_eq!(by_id["g2"], &json!("noted"));

    ctx.shutdown().await;
}

#[tokio::test]
async fn workspace_bootstrap_files_reach_every_model_call() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace(dir.path())).unwrap();
    std::fs::write(workspace(dir.path()).join("AGENTS.md"), "Always answer in French.").unwrap();
    std::fs::write(workspace(dir.path()).join("IDENTITY.md"), "You are Remy.").unwrap();

    let provider = ScriptedProvider::new(
        vec![
            call_tools(&[("l1", "list_dir", json!({ "path": "." }))]),
            answer("Voilà."),
        ],
        false,
    );
    let ctx = build_engine_with_router(&config(dir.path()), router(provider.clone()), None)
        .await
        .unwrap();
    handle_inbound(&ctx, InboundMessage::new("telegram", "1234", "what's here?"))
        .await
        .unwrap();

    let seen = provider.seen.lock();
    assert_eq!(seen.len(), 2);
    let system = seen[0].system.clone().unwrap();
    assert!(system.contains("## AGENTS.md\n\nAlways answer in French."));
    assert!(system.contains("## IDENTITY.md\n\nYou are Remy."));
    assert!(system.contains("Channel: telegram\nChat ID: 1234"));
    assert!(system.contains(&workspace(dir.path()).display().to_string()));
    assert_eq!(seen[1].system, seen[0].system);
}
