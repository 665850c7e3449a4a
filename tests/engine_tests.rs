//! End-to-end generation scenarios: router → engine → mock upstream →
//! store and disk.
//!
//! Each test starts its own [`MockUpstream`] and app, so they run in
//! parallel. Single-mode tests poll `GET /tasks/:id`; batch tests collect
//! the whole SSE body, which ends once the `complete` frame is sent.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::mock_upstream::{MockUpstream, Reply, FAKE_PNG};
use common::{
    build_test_app, build_test_app_with, configure_token, sse_events, wait_for_task, Form,
};
use http_body_util::BodyExt;
use sigma::config::FILTERED_MESSAGE;
use sigma::db::{HistoryQuery, NewTask, PageParams};
use sigma::engine::ALL_FAILED_MESSAGE;
use sigma::providers::Platform;
use std::collections::HashSet;
use tower::ServiceExt;

const TOKEN: &str = "sk-test-token-0123456789";

async fn task_rows(app: &common::TestApp) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM generation_tasks")
        .fetch_one(app.state.db.pool())
        .await
        .unwrap()
}

async fn history_rows(app: &common::TestApp) -> Vec<sigma::db::HistoryRow> {
    app.state
        .db
        .query_history(&HistoryQuery {
            kind: None,
            day: None,
            page: PageParams::new(1, 100),
        })
        .await
        .unwrap()
}

async fn generate_single(app: &common::TestApp, form: Form) -> serde_json::Value {
    let response = app.app().oneshot(form.request()).await.unwrap();
    let (status, body) = common::read_json(response).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    body
}

async fn generate_batch(app: &common::TestApp, form: Form) -> Vec<serde_json::Value> {
    let response = app.app().oneshot(form.request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{}", content_type);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    sse_events(&body)
}

#[tokio::test]
async fn generate_without_credential_is_rejected_before_any_task() {
    let app = build_test_app(None).await;
    let response = app
        .app()
        .oneshot(Form::new().text("prompt", "cat").request())
        .await
        .unwrap();
    let (status, body) = common::read_json(response).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, serde_json::json!({"error": "请先配置 API Key"}));
    assert_eq!(task_rows(&app).await, 0);
}

#[tokio::test]
async fn single_inline_image_completes_task_and_records_history() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Inline]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new().text("prompt", "a red cat")).await;
    assert_eq!(accepted["status"], "processing");
    assert_eq!(accepted["ref_images"], serde_json::json!([]));
    let task_id = accepted["task_id"].as_str().unwrap().to_string();
    assert!(uuid::Uuid::parse_str(&task_id).is_ok());

    let task = wait_for_task(&app, &task_id).await;
    assert_eq!(task["status"], "completed");
    assert_eq!(task["error_msg"], "");
    let url = task["image_url"].as_str().unwrap();
    let pattern = regex::Regex::new(r"^http://localhost:8080/images/gen_\d+\.png$").unwrap();
    assert!(pattern.is_match(url), "{}", url);

    let history = history_rows(&app).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].prompt, "a red cat");
    assert_eq!(history[0].kind, "create");
    assert!(history[0].batch_id.is_none());
    assert_eq!(app.state.db.total_count().await.unwrap(), 1);

    let saved = app.dir.path().join("output").join(&history[0].image_url);
    assert_eq!(std::fs::read(saved).unwrap(), FAKE_PNG);

    let calls = mock.generates();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].platform, "ve");
    assert_eq!(calls[0].auth.as_deref(), Some(format!("Bearer {}", TOKEN).as_str()));
    assert_eq!(calls[0].body["contents"][0]["parts"][0]["text"], "a red cat");
    assert_eq!(
        calls[0].body["generationConfig"]["imageConfig"]["aspectRatio"],
        "1:1"
    );
}

#[tokio::test]
async fn batch_with_two_quota_failures_is_partial() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Inline, Reply::Inline, Reply::quota(), Reply::quota()]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let events = generate_batch(
        &app,
        Form::new().text("prompt", "shoes").text("count", "4"),
    )
    .await;
    assert_eq!(events.len(), 6, "{:?}", events);

    let start = &events[0];
    assert_eq!(start["type"], "start");
    assert_eq!(start["count"], 4);
    let batch_id = start["batch_id"].as_str().unwrap().to_string();
    let task_id = start["task_id"].as_str().unwrap().to_string();

    let images = &events[1..5];
    let mut indices = HashSet::new();
    for (n, frame) in images.iter().enumerate() {
        assert_eq!(frame["type"], "image");
        assert_eq!(frame["batch_id"], batch_id.as_str());
        assert_eq!(frame["completed"], n + 1);
        assert_eq!(frame["total"], 4);
        indices.insert(frame["index"].as_u64().unwrap());
        if let Some(err) = frame.get("error") {
            assert!(err.as_str().unwrap().contains("quota"), "{}", err);
        }
    }
    assert_eq!(indices, (0..4).collect::<HashSet<u64>>());

    let complete = &events[5];
    assert_eq!(complete["type"], "complete");
    assert_eq!(complete["status"], "partial");
    assert_eq!(complete["success_count"], 2);
    assert_eq!(complete["total_count"], 4);
    assert_eq!(complete["images"].as_array().unwrap().len(), 4);

    let rows = app.state.db.histories_by_batch(&batch_id).await.unwrap();
    assert_eq!(rows.len(), 2);
    let slot_indices: HashSet<i64> = rows.iter().filter_map(|r| r.batch_index).collect();
    assert_eq!(slot_indices.len(), 2);
    assert!(rows.iter().all(|r| r.batch_total == Some(4)));
    assert_eq!(app.state.db.total_count().await.unwrap(), 2);

    let task = app.state.db.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, "completed");
    assert!(task.image_url.starts_with("images/gen_"));
}

#[tokio::test]
async fn batch_persists_after_client_disconnect() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    let slow = || Reply::Delayed(std::time::Duration::from_millis(300), Box::new(Reply::Inline));
    mock.script([slow(), slow(), slow()]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let response = app
        .app()
        .oneshot(Form::new().text("prompt", "boots").text("count", "3").request())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let first = body.frame().await.unwrap().unwrap().into_data().unwrap();
    let start = sse_events(&first).remove(0);
    assert_eq!(start["type"], "start");
    drop(body);

    let batch_id = start["batch_id"].as_str().unwrap().to_string();
    let task_id = start["task_id"].as_str().unwrap().to_string();
    let mut task = app.state.db.get_task(&task_id).await.unwrap().unwrap();
    for _ in 0..200 {
        if task.status != "processing" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        task = app.state.db.get_task(&task_id).await.unwrap().unwrap();
    }
    assert_eq!(task.status, "completed");
    assert_eq!(app.state.db.histories_by_batch(&batch_id).await.unwrap().len(), 3);
    assert_eq!(app.state.db.total_count().await.unwrap(), 3);
}

#[tokio::test]
async fn batch_with_no_successes_fails_the_task() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.set_fallback(Reply::NoCandidates);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let events = generate_batch(&app, Form::new().text("count", "2")).await;
    let complete = events.last().unwrap();
    assert_eq!(complete["status"], "failed");
    assert_eq!(complete["success_count"], 0);
    for slot in complete["images"].as_array().unwrap() {
        assert_eq!(slot["error"], "模型未返回内容");
    }

    let task_id = complete["task_id"].as_str().unwrap();
    let task = app.state.db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, "failed");
    assert_eq!(task.error_msg, ALL_FAILED_MESSAGE);
    assert!(history_rows(&app).await.is_empty());
    assert_eq!(app.state.db.total_count().await.unwrap(), 0);
}

#[tokio::test]
async fn batch_4k_counts_double_per_success() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let events = generate_batch(
        &app,
        Form::new()
            .text("count", "9")
            .text("imageSize", "4K")
            .text("type", "product_scene"),
    )
    .await;
    let complete = events.last().unwrap();
    assert_eq!(complete["status"], "success");
    assert_eq!(complete["total_count"], 4);
    assert_eq!(app.state.db.total_count().await.unwrap(), 8);
    assert!(history_rows(&app)
        .await
        .iter()
        .all(|r| r.kind == "product_scene" && r.image_size == "4K"));
}

#[tokio::test]
async fn markdown_data_url_is_saved_with_its_extension() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::markdown_data_url("jpeg")]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new().text("prompt", "x")).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "completed");
    let url = task["image_url"].as_str().unwrap();
    assert!(url.ends_with(".jpg"), "{}", url);

    let relative = sigma::urls::to_relative(url);
    assert!(app.dir.path().join("output").join(relative).exists());
}

#[tokio::test]
async fn markdown_http_url_is_downloaded() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Text(format!("![img]({}/files/out.webp)", mock.url()))]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "completed");
    assert!(task["image_url"].as_str().unwrap().ends_with(".webp"));
}

#[tokio::test]
async fn failed_download_reports_probe_failure() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Text(format!("![img]({}/files/missing.png)", mock.url()))]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failed");
    let msg = task["error_msg"].as_str().unwrap();
    assert!(msg.starts_with("请求成功但图片处理失败"), "{}", msg);
    assert!(history_rows(&app).await.is_empty());
    assert_eq!(app.state.db.total_count().await.unwrap(), 0);
}

#[tokio::test]
async fn oversized_download_is_refused() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Text(format!("![img]({}/files/big.webp)", mock.url()))]);
    let app = build_test_app_with(Some(&mock), &["--max-download-bytes", "8"]).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failed");
    let msg = task["error_msg"].as_str().unwrap();
    assert!(msg.starts_with("请求成功但图片处理失败"), "{}", msg);
    assert!(msg.contains("超过上限"), "{}", msg);

    let images = app.dir.path().join("output").join("images");
    let found = std::fs::read_dir(&images).map(|d| d.count()).unwrap_or(0);
    assert_eq!(found, 0);
}

#[tokio::test]
async fn upstream_errors_naming_the_model_are_scrubbed() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Error(500, "models/gemini-2.5 is overloaded".into())]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "failed");
    assert_eq!(task["error_msg"], FILTERED_MESSAGE);
}

#[tokio::test]
async fn text_only_answer_asks_for_a_new_prompt() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    mock.script([Reply::Text("I cannot draw that.".into())]);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["error_msg"], "请求成功但未返回图片，请修改提示词后重试");
}

#[tokio::test]
async fn reference_images_are_inlined_and_stored() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(
        &app,
        Form::new()
            .text("prompt", "swap the shirt")
            .text("type", "clothing_change")
            .file("images", "Model.PNG", b"ref-one")
            .file("images[]", "garment.jpg", b"ref-two"),
    )
    .await;
    let refs = accepted["ref_images"].as_array().unwrap();
    assert_eq!(refs.len(), 2);
    assert!(refs[0]
        .as_str()
        .unwrap()
        .starts_with("http://localhost:8080/uploads/ref_"));
    assert!(refs[0].as_str().unwrap().ends_with("_Model.PNG"));

    let task = wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    assert_eq!(task["status"], "completed");
    assert_eq!(task["type"], "clothing_change");

    let parts = &mock.generates()[0].body["contents"][0]["parts"];
    assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
    assert_eq!(parts[2]["inlineData"]["mimeType"], "image/jpeg");

    let stored = app.dir.path().join("uploads").join("uploads");
    let mut found = 0;
    for _ in 0..50 {
        found = std::fs::read_dir(&stored).map(|d| d.count()).unwrap_or(0);
        if found == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(found, 2);
}

#[tokio::test]
async fn reference_files_are_not_written_when_task_creation_fails() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ve", TOKEN);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;
    app.state.db.pool().close().await;

    let response = app
        .app()
        .oneshot(
            Form::new()
                .text("prompt", "x")
                .file("images", "ref.png", b"ref-bytes")
                .request(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let stored = app.dir.path().join("uploads").join("uploads");
    let found = std::fs::read_dir(&stored).map(|d| d.count()).unwrap_or(0);
    assert_eq!(found, 0);
    assert!(mock.generates().is_empty());
}

#[tokio::test]
async fn reaper_fails_only_stale_processing_tasks() {
    let app = build_test_app(None).await;
    let db = &app.state.db;
    for id in ["old", "recent"] {
        db.create_task(&NewTask {
            task_id: id,
            kind: "create",
            prompt: "p",
            ref_images: "[]",
            image_count: 1,
        })
        .await
        .unwrap();
    }
    db.backdate_task("old", Utc::now() - chrono::Duration::minutes(20))
        .await
        .unwrap();
    db.backdate_task("recent", Utc::now() - chrono::Duration::minutes(2))
        .await
        .unwrap();

    let reaped = sigma::reaper::reap_once(db, &app.state.prom_metrics)
        .await
        .unwrap();
    assert_eq!(reaped, 1);

    let (_, old) = common::get(app.app(), "/tasks/old").await;
    assert_eq!(old["status"], "failed");
    assert_eq!(old["error_msg"], "任务超时");
    let (_, recent) = common::get(app.app(), "/tasks/recent").await;
    assert_eq!(recent["status"], "processing");
}

#[tokio::test]
async fn token_known_only_to_second_platform_binds_there() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ai", TOKEN);
    let app = build_test_app(Some(&mock)).await;
    configure_token(&app, TOKEN).await;
    assert_eq!(
        app.state.credentials.snapshot().await.platform,
        Platform::Aiaimi
    );

    let accepted = generate_single(&app, Form::new()).await;
    wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    let calls = mock.generates();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].platform, "ai");
}

#[tokio::test]
async fn startup_detection_rebinds_a_default_tagged_token() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ai", TOKEN);
    let app = build_test_app(Some(&mock)).await;
    app.state
        .credentials
        .set_token(TOKEN, Platform::VectorEngine)
        .await
        .unwrap();

    app.state.credentials.auto_detect(&app.state.providers).await;
    assert_eq!(
        app.state.credentials.snapshot().await.platform,
        Platform::Aiaimi
    );
    assert_eq!(
        app.state
            .db
            .get_setting(sigma::db::KEY_PLATFORM)
            .await
            .unwrap()
            .as_deref(),
        Some("aiaimi")
    );
}

#[tokio::test]
async fn service_url_override_wins_over_platform_binding() {
    let mock = MockUpstream::start().await;
    mock.accept_token("/ai", TOKEN);
    let override_url = format!("{}/ve/v1beta/models/custom:generateContent", mock.url());
    let app = common::build_test_app_with(Some(&mock), &["--ai-service-url", &override_url]).await;
    configure_token(&app, TOKEN).await;

    let accepted = generate_single(&app, Form::new()).await;
    wait_for_task(&app, accepted["task_id"].as_str().unwrap()).await;
    let calls = mock.generates();
    assert_eq!(calls[0].platform, "ve");
    assert_eq!(calls[0].model, "custom:generateContent");
}
