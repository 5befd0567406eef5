mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;

use comfy_sdl::error::ErrorKind;
use comfy_sdl::prompt::injector::InjectionError;
use comfy_sdl::service::Session;
use comfy_sdl::AppError;

use common::{
    service_with, standard_workflows, workflow_dir, Script, ScriptedBackend, ServiceOptions, IMAGE_BYTES, TXT2IMG,
};

#[tokio::test]
async fn image_to_image_on_text_only_workflow_never_submits() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 0 });
    let service = service_with(backend.clone(), standard_workflows(), ServiceOptions::default()).await;
    let session = Session::new(1);

    let err = service
        .generate_from_image(&session, "make it snowy", vec![1, 2, 3], &CancellationToken::new())
        .await
        .unwrap_err();

    assert_matches!(err, AppError::Injection(InjectionError::UnsupportedMode { .. }));
    assert_eq!(err.kind().code(), "UNSUPPORTED_MODE");
    assert_eq!(backend.submit_count(), 0);
    assert!(backend.uploads.lock().unwrap().is_empty());
    assert_eq!(service.gate().in_flight(), 0);
}

#[tokio::test]
async fn image_to_image_uploads_then_generates() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 1 });
    let service = service_with(backend.clone(), standard_workflows(), ServiceOptions::default()).await;
    let mut session = service.new_session();
    service.select_workflow(&mut session, 3).await.unwrap();

    let result = service
        .generate_from_image(&session, "make it snowy", vec![7; 16], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.image, IMAGE_BYTES);
    assert_eq!(result.workflow, "03_img2img");
    assert_eq!(backend.uploads.lock().unwrap().len(), 1);
    let submitted = backend.last_graph();
    assert!(submitted["10"]["inputs"]["image"].as_str().unwrap().starts_with("stored_i2i_"));
}

#[tokio::test]
async fn seed_reaches_every_sampler_of_a_refiner_graph() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 1, running: 1 });
    let service = service_with(backend.clone(), standard_workflows(), ServiceOptions::default()).await;
    let mut session = service.new_session();
    service.select_workflow(&mut session, 2).await.unwrap();

    let result = service
        .generate(&session, "a lighthouse at dusk", Some(123456789), &CancellationToken::new())
        .await
        .unwrap();

    let submitted = backend.last_graph();
    assert_eq!(submitted["10"]["inputs"]["noise_seed"], 123456789);
    assert_eq!(submitted["11"]["inputs"]["noise_seed"], 123456789);
    assert_eq!(submitted["6"]["inputs"]["text"], "a lighthouse at dusk");
    assert_eq!(result.seed, Some(123456789));
    assert_eq!(result.prompt_id, "job-1");
    assert_eq!(result.positive_prompt, "a lighthouse at dusk");
}

#[tokio::test]
async fn reload_with_a_malformed_file_keeps_the_valid_one() {
    let dir = workflow_dir(&[("a_broken.json", "{\"1\": {\"inputs\": {}}}"), ("b_good.json", TXT2IMG)]);
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 0 });
    let service = service_with(backend.clone(), dir, ServiceOptions::default()).await;

    let report = service.reload_workflows().await.unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].file, "a_broken.json");
    assert!(report.failed[0].error.contains("class_type"));

    let listed = service.list_workflows().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].index, 2);
    assert!(!listed[0].has_image_input);

    let mut session = service.new_session();
    assert_matches!(
        service.select_workflow(&mut session, 1).await,
        Err(AppError::WorkflowNotFound(1))
    );
    service.select_workflow(&mut session, 2).await.unwrap();
    let result = service
        .generate(&session, "a cat", None, &CancellationToken::new())
        .await
        .unwrap();
    // no seed requested: the graph's own literal is reported
    assert_eq!(result.seed, Some(8));
    assert_eq!(backend.last_graph()["3"]["inputs"]["seed"], 8);
}

#[tokio::test]
async fn selection_is_per_session() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 0 });
    let service = service_with(backend, standard_workflows(), ServiceOptions::default()).await;
    let mut alice = service.new_session();
    let bob = service.new_session();

    let summary = service.select_workflow(&mut alice, 3).await.unwrap();
    assert!(summary.has_image_input);
    assert_eq!(alice.workflow_index(), 3);
    assert_eq!(bob.workflow_index(), 1);

    assert_matches!(
        service.select_workflow(&mut alice, 42).await,
        Err(AppError::WorkflowNotFound(42))
    );
    assert_eq!(alice.workflow_index(), 3);
}

#[tokio::test]
async fn timeout_releases_the_ticket() {
    let backend = ScriptedBackend::new(Script::Stall);
    let options = ServiceOptions {
        max_concurrent: 1,
        request_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let service = service_with(backend.clone(), standard_workflows(), options).await;
    let session = service.new_session();

    let err = service
        .generate(&session, "x", None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(err.kind().is_retryable());
    assert_eq!(service.gate().in_flight(), 0);
    assert_eq!(backend.cancelled(), vec!["job-1".to_string()]);
}

#[tokio::test]
async fn backend_failures_keep_their_kind() {
    let failing = ScriptedBackend::new(Script::Fail("bad node"));
    let service = service_with(failing, standard_workflows(), ServiceOptions::default()).await;
    let err = service
        .generate(&service.new_session(), "x", None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::JobFailed);
    assert!(err.to_string().contains("bad node"));

    let down = ScriptedBackend::new(Script::Unreachable);
    let service = service_with(down, standard_workflows(), ServiceOptions::default()).await;
    let err = service
        .generate(&service.new_session(), "x", None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendUnreachable);
}

#[tokio::test]
async fn health_reports_backend_queue_and_gate() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 0 });
    let service = service_with(backend, standard_workflows(), ServiceOptions::default()).await;
    let health = service.check_backend_health().await;
    assert!(health.reachable);
    assert!(health.system.is_some());
    assert_eq!(health.gate.max_in_flight, 2);
    assert_eq!(health.gate.in_flight, 0);

    let down = ScriptedBackend::new(Script::Unreachable);
    let service = service_with(down, standard_workflows(), ServiceOptions::default()).await;
    let health = service.check_backend_health().await;
    assert!(!health.reachable);
    assert!(health.detail.contains("connection refused"));
}

#[tokio::test]
async fn describe_reports_inferred_roles() {
    let backend = ScriptedBackend::new(Script::Complete { pending: 0, running: 0 });
    let service = service_with(backend, standard_workflows(), ServiceOptions::default()).await;

    let details = service.describe_workflow(2).await.unwrap();
    assert_eq!(details.samplers, vec!["11".to_string(), "10".to_string()]);
    assert_eq!(details.positive_node, "6");
    assert_eq!(details.negative_node.as_deref(), Some("7"));
    assert_eq!(details.summary.description, "model: sdxl_base.safetensors");

    assert_matches!(service.describe_workflow(9).await, Err(AppError::WorkflowNotFound(9)));
}
