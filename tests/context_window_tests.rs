//! Context-window and summarization behavior across whole turns.

mod common;

use common::*;

use std::time::Duration;

use axum::http::StatusCode;

use llm_council::council::store::ConversationStore;

async fn send(app: &axum::Router, id: &str, content: &str) {
    let (status, _) = request_json(
        app,
        "POST",
        &format!("/api/conversations/{}/message", id),
        Some(serde_json::json!({ "content": content })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

/// Poll the store until the conversation holds `count` summary messages.
async fn wait_for_summaries(harness: &TestApp, id: &str, count: usize) -> Vec<serde_json::Value> {
    for _ in 0..100 {
        let convo = harness.state.store.get(id).await.unwrap();
        let summaries: Vec<_> = convo
            .messages
            .iter()
            .filter(|m| m.is_summary())
            .cloned()
            .collect();
        if summaries.len() >= count {
            return summaries
                .into_iter()
                .map(|m| serde_json::to_value(&m).unwrap())
                .collect();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("background summary never appeared for {}", id);
}

#[tokio::test]
async fn test_summary_appears_after_fourth_turn() {
    let r = ranking_text('A', 'B');
    let provider = ScriptedProvider::new(vec![
        ("m1", r.as_str()),
        ("m2", r.as_str()),
        ("m3", r.as_str()),
        ("google/gemini-2.5-flash", "Long Chat"),
    ]);
    let harness = test_app(provider, council_config(&["m1", "m2", "m3"], "m3")).await;
    let app = &harness.app;

    let (_, created) = request_json(app, "POST", "/api/conversations", None).await;
    let id = created["id"].as_str().unwrap().to_string();

    // Three turns stay within the retention window: no summaries.
    for turn in 0..3 {
        send(app, &id, &format!("question {}", turn)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let convo = harness.state.store.get(&id).await.unwrap();
    assert!(!convo.messages.iter().any(|m| m.is_summary()));

    // The fourth turn overflows retention; the background pass folds the
    // oldest final into one summary.
    send(app, &id, "question 3").await;
    let summaries = wait_for_summaries(&harness, &id, 1).await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(
        summaries[0]["stage3"]["metadata"]["summarized_count"],
        1
    );
    assert_eq!(summaries[0]["stage3"]["model"], "m3");

    // The list view still reports 8 countable messages: 4 user turns plus 4
    // real assistant turns; the summary is invisible to the tally.
    let (_, list) = request_json(app, "GET", "/api/conversations", None).await;
    assert_eq!(list[0]["message_count"], 8);
}

#[tokio::test]
async fn test_fifth_turn_uses_summary_in_prior_context() {
    let r = ranking_text('A', 'A');
    let provider = ScriptedProvider::new(vec![
        ("m1", r.as_str()),
        ("google/gemini-2.5-flash", "Chat"),
    ]);
    let harness = test_app(provider, council_config(&["m1"], "m1")).await;
    let app = &harness.app;

    let (_, created) = request_json(app, "POST", "/api/conversations", None).await;
    let id = created["id"].as_str().unwrap().to_string();

    for turn in 0..4 {
        send(app, &id, &format!("question {}", turn)).await;
    }
    wait_for_summaries(&harness, &id, 1).await;

    // The next turn sees five finals (4 turns + 1 summary) and therefore
    // summarizes synchronously before running: afterwards the conversation
    // carries a second summary covering two finals.
    send(app, &id, "question 4").await;
    let convo = harness.state.store.get(&id).await.unwrap();
    let summary_counts: Vec<usize> = convo
        .messages
        .iter()
        .filter(|m| m.is_summary())
        .filter_map(|m| match m {
            llm_council::council::model::StoredMessage::Assistant { stage3, .. } => stage3
                .metadata
                .as_ref()
                .and_then(|meta| meta.summarized_count),
            _ => None,
        })
        .collect();
    assert!(summary_counts.contains(&2), "counts: {:?}", summary_counts);
}
