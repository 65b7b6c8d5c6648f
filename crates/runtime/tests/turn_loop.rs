//! Full-pipeline test: model stream → parser → dispatcher → tool
//! server subprocess → result folded into the turn outcome.

use tether_domain::config::ToolServerConfig;
use tether_domain::stream::BoxStream;
use tether_runtime::{run_turn, Dispatcher, LocalToolset};
use tether_toolserver::Supervisor;

/// Scripted tool server exposing one `lookup` tool.
const MOCK_SERVER: &str = r#"
while IFS= read -r line; do
  id=${line#*'"id":"'}
  id=${id%%'"'*}
  case $line in
    *'"method":"listTools"'*)
      printf '{"protocolVersion":"2.0","id":"%s","result":{"tools":[{"name":"lookup","description":"Look a term up"}]}}\n' "$id" ;;
    *'"method":"callTool"'*)
      printf '{"protocolVersion":"2.0","id":"%s","result":"definition: a rope or chain"}\n' "$id" ;;
    *)
      printf '{"protocolVersion":"2.0","id":"%s","result":{}}\n' "$id" ;;
  esac
done
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn stream_of(fragments: &[&str]) -> BoxStream<'static, tether_domain::error::Result<String>> {
    let items: Vec<tether_domain::error::Result<String>> =
        fragments.iter().map(|f| Ok(f.to_string())).collect();
    Box::pin(futures_util::stream::iter(items))
}

#[tokio::test]
async fn a_streamed_turn_reaches_a_real_tool_server() {
    init_tracing();
    let supervisor = Supervisor::new();
    let mut config = ToolServerConfig::command("sh", &["-c", MOCK_SERVER]);
    config.timeout_secs = Some(10);
    supervisor.start("dict", &config).await.unwrap();

    let dispatcher = Dispatcher::new(supervisor.clone(), LocalToolset::new());

    // The invocation arrives in awkward fragments, like real deltas do.
    let outcome = run_turn(
        &dispatcher,
        stream_of(&[
            "Let me look that up.\n<use_",
            "tool>\n<server_name>dict</server_name>\n<tool_name>look",
            "up</tool_name>\n<arguments>{\"term\": \"tether\"}</arguments>\n</use_tool>\n",
        ]),
    )
    .await;

    assert_eq!(outcome.text(), "Let me look that up.");
    let result = outcome.executed_tool().expect("tool should have run");
    assert_eq!(result.tool_name, "use_tool");
    assert_eq!(result.content, "definition: a rope or chain");

    supervisor.stop("dict").await;
}

#[tokio::test]
async fn a_failing_server_surfaces_in_band_and_spares_the_turn() {
    init_tracing();
    let supervisor = Supervisor::new();
    // Nothing is started, so "dict" is unknown.
    let dispatcher = Dispatcher::new(supervisor, LocalToolset::new());

    let outcome = run_turn(
        &dispatcher,
        stream_of(&[
            "<use_tool>\n<server_name>dict</server_name>\n<tool_name>lookup</tool_name>\n</use_tool>\nStill here.\n",
        ]),
    )
    .await;

    let result = outcome.executed_tool().unwrap();
    assert!(result.content.contains("not found"));
    // The dispatch failure did not abort the turn.
    assert_eq!(outcome.text(), "Still here.");
    assert!(outcome.stream_error.is_none());
}

#[tokio::test]
async fn local_and_remote_invocations_share_the_turn_discipline() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "from disk").unwrap();

    let supervisor = Supervisor::new();
    let dispatcher = Dispatcher::new(supervisor, LocalToolset::with_builtins(dir.path()));

    let outcome = run_turn(
        &dispatcher,
        stream_of(&[
            "<read_file>\n<path>hello.txt</path>\n</read_file>\n",
            "<run_command>\n<command>echo ignored</command>\n</run_command>\n",
        ]),
    )
    .await;

    assert_eq!(outcome.tool_results.len(), 2);
    assert_eq!(outcome.tool_results[0].content, "from disk");
    assert!(!outcome.tool_results[0].rejected);
    // The second invocation in the same turn is refused, not run.
    assert!(outcome.tool_results[1].rejected);
    assert!(outcome.tool_results[1].content.contains("one tool"));
}
