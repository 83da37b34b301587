#![allow(missing_docs)]

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tempfile::TempDir;

use relay::acp::adapter::AcpAdapter;
use relay::acp::models::{AdapterConfig, StopReason};
use relay::config::RelayConfig;
use relay::log::jsonl::JsonlLogger;
use relay::orchestrator::{self, RunOutcome};

const HANDSHAKE: &str = r#"IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-01"}}\n'
IFS= read -r line
printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"sess-e2e"}}\n'"#;

fn scripted_adapter(script: &str) -> AcpAdapter {
    AcpAdapter::new(AdapterConfig {
        agent_command: "sh".to_string(),
        agent_args: vec!["-c".to_string(), script.to_string()],
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap()
}

/// Integration test: full turn over a live subprocess.
///
/// The scripted agent performs the handshake, streams three message chunks
/// and one tool call during the prompt turn, then finishes with end_turn.
#[tokio::test]
async fn test_streamed_turn_end_to_end() {
    let script = format!(
        r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"The answer "}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"tool_call","toolCallId":"tc-1","kind":"read","status":"pending"}}}}}}\n'
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"tool_call_update","toolCallId":"tc-1","status":"completed"}}}}}}\n'
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"is "}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"42"}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}\n'
sleep 1"#
    );
    let adapter = scripted_adapter(&script);

    let result = adapter.run_turn("what is the answer?").await;

    assert!(result.success, "turn failed: {:?}", result.error);
    assert_eq!(result.output, "The answer is 42");
    assert_eq!(result.metadata.session_id, "sess-e2e");
    assert_eq!(result.metadata.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(result.metadata.tool_call_count, 1);
    adapter.shutdown().await;
}

/// Integration test: the agent reads and writes host files mid-turn.
///
/// The scripted agent asks the host to read a file, echoes its content back
/// as output, then writes a second file before ending the turn.
#[tokio::test]
async fn test_agent_file_access_round_trip() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.txt");
    let output = dir.path().join("output.txt");
    std::fs::write(&input, "seed-content").unwrap();

    let script = format!(
        r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","id":"fs-1","method":"fs/read_text_file","params":{{"sessionId":"sess-e2e","path":"{input}"}}}}\n'
IFS= read -r reply
case "$reply" in
  *seed-content*)
    printf '{{"jsonrpc":"2.0","id":"fs-2","method":"fs/write_text_file","params":{{"sessionId":"sess-e2e","path":"{output}","content":"agent-wrote-this"}}}}\n'
    IFS= read -r reply2
    printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"copied"}}}}}}}}\n'
    printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}\n'
    ;;
  *)
    printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"refusal"}}}}\n'
    ;;
esac
sleep 1"#,
        input = input.display(),
        output = output.display(),
    );
    let adapter = scripted_adapter(&script);

    let result = adapter.run_turn("copy the file").await;

    assert!(result.success, "turn failed: {:?}", result.error);
    assert_eq!(result.output, "copied");
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "agent-wrote-this"
    );
    adapter.shutdown().await;
}

/// Integration test: the agent runs a command through the terminal
/// capability and reads its output back.
#[tokio::test]
async fn test_agent_terminal_round_trip() {
    let script = format!(
        r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","id":"t-1","method":"terminal/create","params":{{"sessionId":"sess-e2e","command":["sh","-c","printf terminal-says-hi"]}}}}\n'
IFS= read -r created
tid=${{created#*\"terminalId\":\"}}
tid=${{tid%%\"*}}
printf '{{"jsonrpc":"2.0","id":"t-2","method":"terminal/wait_for_exit","params":{{"sessionId":"sess-e2e","terminalId":"%s"}}}}\n' "$tid"
IFS= read -r waited
printf '{{"jsonrpc":"2.0","id":"t-3","method":"terminal/output","params":{{"sessionId":"sess-e2e","terminalId":"%s"}}}}\n' "$tid"
IFS= read -r got
case "$got" in
  *terminal-says-hi*) printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}\n' ;;
  *) printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"refusal"}}}}\n' ;;
esac
sleep 1"#
    );
    let adapter = scripted_adapter(&script);

    let result = adapter.run_turn("run a command").await;

    assert!(result.success, "turn failed: {:?}", result.error);
    adapter.shutdown().await;
}

/// Integration test: config → adapter → loop → JSONL log, the whole stack.
#[tokio::test]
async fn test_loop_from_config_to_log() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("PROMPT.md"), "finish the job\n").unwrap();

    let script = format!(
        r#"{HANDSHAKE}
IFS= read -r line
printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"sess-e2e","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"ALL_DONE"}}}}}}}}\n'
printf '{{"jsonrpc":"2.0","id":3,"result":{{"stopReason":"end_turn"}}}}\n'
sleep 1"#
    );

    let config = RelayConfig::parse(&format!(
        r#"
[agent]
command = "sh"
args = ["-c", {script:?}]
timeout_secs = 5

[loop]
prompt_file = "{prompt}"
max_iterations = 3
completion_marker = "ALL_DONE"
"#,
        prompt = dir.path().join("PROMPT.md").display(),
    ))
    .unwrap();

    let adapter = AcpAdapter::new(config.adapter_config()).unwrap();
    let logger = JsonlLogger::new(dir.path().join(".relay")).unwrap();
    let stop = AtomicBool::new(false);

    let outcome = orchestrator::run(&adapter, &config.run, &logger, &stop)
        .await
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed { iterations: 1 });
    let records = logger.read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].session_id, "sess-e2e");
    adapter.shutdown().await;
}
