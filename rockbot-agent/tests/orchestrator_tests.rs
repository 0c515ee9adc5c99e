mod common;

use std::time::Duration;

use common::{Scripted, TestAgent};
use rockbot_agent::memory::{ConversationMemory, TurnRole};
use rockbot_agent::TurnOrchestratorConfig;

#[tokio::test]
async fn test_plain_text_turn_publishes_single_final_reply() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::Text("hello"));

    agent.send_user("s1", "hi").await;
    let replies = agent.replies_until_final().await;

    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.content, "hello");
    assert_eq!(reply.session_id, "s1");
    assert_eq!(reply.agent_name, "rock");
    assert!(reply.is_final);

    // Conversation memory now holds exactly [user, assistant].
    let turns = agent.conversation.turns("s1").await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, TurnRole::User);
    assert_eq!(turns[0].content, "hi");
    assert_eq!(turns[1].role, TurnRole::Assistant);
    assert_eq!(turns[1].content, "hello");
}

#[tokio::test]
async fn test_tool_turn_acks_then_finishes() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::ToolCall("noop_tool", "{}"));
    agent.chat.push(Scripted::Text("all done"));

    agent.send_user("s1", "do the thing").await;
    let replies = agent.replies_until_final().await;

    // A non-final ack precedes the final reply.
    assert!(replies.len() >= 2);
    assert!(!replies[0].is_final);
    let last = replies.last().unwrap();
    assert_eq!(last.content, "all done");
    assert!(last.is_final);

    // Two model calls: the initial one and the post-tool one.
    assert_eq!(agent.chat.call_count(), 2);
}

#[tokio::test]
async fn test_new_message_cancels_running_background_loop() {
    let mut agent = TestAgent::start().await;
    // First message gets a hanging tool; second resolves with text.
    agent.chat.push(Scripted::ToolCall("slow_tool", "{}"));
    agent.chat.push(Scripted::Text("second answer"));

    agent.send_user("s2", "first").await;
    // Let the background loop reach the slow tool.
    tokio::time::sleep(Duration::from_millis(150)).await;
    agent.send_user("s2", "second").await;

    let replies = agent.replies_until_final().await;
    let finals: Vec<_> = replies.iter().filter(|r| r.is_final).collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].content, "second answer");

    // The first loop died silently: no second model call for it, no tool
    // result appended, no further replies.
    assert_eq!(agent.chat.call_count(), 2);
    agent.assert_quiet(Duration::from_millis(300)).await;

    let turns = agent.conversation.turns("s2").await.unwrap();
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "second answer"]);
}

#[tokio::test]
async fn test_iteration_cap_forces_text_completion() {
    let mut agent = TestAgent::start().await;
    // The model asks for tools forever; the cap must force an end.
    for _ in 0..5 {
        agent.chat.push(Scripted::ToolCall("noop_tool", "{}"));
    }
    agent.chat.push(Scripted::Text("wrapping up"));

    agent.send_user("s3", "loop forever").await;
    let replies = agent.replies_until_final().await;

    assert_eq!(replies.last().unwrap().content, "wrapping up");
    // Initial call + 5 loop iterations.
    assert_eq!(agent.chat.call_count(), 6);
    // Every call but the last offered tools; the last was tool-free to
    // force a text completion.
    assert!(agent.chat.tools_offered(0) > 0);
    assert!(agent.chat.tools_offered(4) > 0);
    assert_eq!(agent.chat.tools_offered(5), 0);
}

#[tokio::test]
async fn test_llm_error_produces_final_apology_and_records_turn() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::Error("throttled"));

    agent.send_user("s4", "hi").await;
    let replies = agent.replies_until_final().await;

    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert!(reply.is_final);
    assert!(reply.content.starts_with("Sorry, I encountered an error:"));
    assert!(reply.content.contains("throttled"));

    // The apology was recorded before publication, so history stays
    // consistent for the next turn.
    let turns = agent.conversation.turns("s4").await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].role, TurnRole::Assistant);
    assert_eq!(turns[1].content, reply.content);
}

#[tokio::test]
async fn test_text_parsed_tool_call_runs_like_native() {
    let mut agent = TestAgent::start().await;
    agent
        .chat
        .push(Scripted::Text("tool_call_name: noop_tool\ntool_call_arguments: {}"));
    agent.chat.push(Scripted::Text("done after text call"));

    agent.send_user("s5", "use the tool").await;
    let replies = agent.replies_until_final().await;

    assert_eq!(replies.last().unwrap().content, "done after text call");
    assert_eq!(agent.chat.call_count(), 2);
}

#[tokio::test]
async fn test_negative_feedback_triggers_reevaluation() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::Text("it is at noon"));
    agent.send_user("s6", "when is the meeting?").await;
    let _ = agent.replies_until_final().await;

    agent.chat.push(Scripted::Text("Checking again: the meeting is Tuesday at noon."));
    agent.send_feedback("s6", false).await;

    let replies = agent.replies_until_final().await;
    let last = replies.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.content, "Checking again: the meeting is Tuesday at noon.");

    // The unsolicited reply is recorded as an assistant turn.
    let turns = agent.conversation.turns("s6").await.unwrap();
    assert_eq!(
        turns.last().unwrap().content,
        "Checking again: the meeting is Tuesday at noon."
    );
}

#[tokio::test]
async fn test_positive_feedback_is_quiet() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::Text("hello"));
    agent.send_user("s7", "hi").await;
    let _ = agent.replies_until_final().await;

    agent.send_feedback("s7", true).await;
    agent.assert_quiet(Duration::from_millis(300)).await;
    assert_eq!(agent.chat.call_count(), 1);
}

#[tokio::test]
async fn test_tool_timeout_reports_and_recovers() {
    let config = TurnOrchestratorConfig {
        tool_timeout: Duration::from_millis(200),
        progress_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let mut agent = TestAgent::start_with_config(config).await;
    agent.chat.push(Scripted::ToolCall("slow_tool", "{}"));
    agent.chat.push(Scripted::Text("managed without it"));

    agent.send_user("s8", "try the slow one").await;
    let replies = agent.replies_until_final().await;

    // A non-final reply explains the timeout; the loop continues and
    // finishes normally.
    assert!(replies
        .iter()
        .any(|r| !r.is_final && r.content.contains("did not answer")));
    assert_eq!(replies.last().unwrap().content, "managed without it");
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let mut agent = TestAgent::start().await;
    agent.chat.push(Scripted::Text("answer a"));
    agent.send_user("a", "question a").await;
    let _ = agent.replies_until_final().await;

    agent.chat.push(Scripted::Text("answer b"));
    agent.send_user("b", "question b").await;
    let _ = agent.replies_until_final().await;

    assert_eq!(agent.conversation.turns("a").await.unwrap().len(), 2);
    assert_eq!(agent.conversation.turns("b").await.unwrap().len(), 2);
}
