use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use platelet_worker::application::render::{
    CapabilityLoader, CapabilityState, LoadError, RenderCapability, RenderFailure, RenderWorker,
    SpawnedWorker,
};
use platelet_worker::{READY_RESULT, RenderRequest, RenderResponse};
use serde_json::{Value, json};

/// Looks the root up in the files map and echoes its content, with the
/// context appended when one is given.
struct TableRenderer;

#[async_trait]
impl RenderCapability for TableRenderer {
    async fn render(&self, root: &str, files: &str, json: &Value) -> Result<String, RenderFailure> {
        let files: BTreeMap<String, String> =
            serde_json::from_str(files).map_err(|err| RenderFailure::new(err.to_string()))?;
        let template = files
            .get(root)
            .ok_or_else(|| RenderFailure::new(format!("template `{root}` not found")))?;
        match json {
            Value::Null => Ok(template.clone()),
            other => Ok(format!("{template}<!-- {other} -->")),
        }
    }
}

#[derive(Default)]
struct CountingLoader {
    loads: AtomicUsize,
}

#[async_trait]
impl CapabilityLoader for CountingLoader {
    async fn load(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TableRenderer))
    }
}

struct BrokenLoader;

#[async_trait]
impl CapabilityLoader for BrokenLoader {
    async fn load(&self) -> Result<Arc<dyn RenderCapability>, LoadError> {
        Err(LoadError::other("renderer module missing"))
    }
}

fn worker() -> (RenderWorker, Arc<CountingLoader>) {
    let loader = Arc::new(CountingLoader::default());
    (RenderWorker::new(loader.clone()), loader)
}

#[tokio::test]
async fn index_request_renders_template() {
    let (worker, _) = worker();
    let request = RenderRequest::new("index")
        .with_file("index", "<h1>Hi</h1>")
        .with_json(json!("{}"));

    let response = worker.handle(request).await;

    assert_eq!(
        response,
        RenderResponse::success("<h1>Hi</h1><!-- \"{}\" -->")
    );
}

#[tokio::test]
async fn missing_root_yields_non_empty_error() {
    let (worker, _) = worker();
    let request = RenderRequest::new("missing").with_json(json!("{}"));

    let response = worker.handle(request).await;

    assert!(!response.is_ok());
    let error = response.error().expect("failure carries an error");
    assert!(!error.is_empty());
    assert!(error.contains("missing"), "{error}");
}

#[tokio::test]
async fn result_is_passed_through_unmodified() {
    let (worker, _) = worker();
    let body = "  <p>\n  untouched whitespace\n</p>\n\n";
    let request = RenderRequest::new("page.html").with_file("page.html", body);

    let response = worker.handle(request).await;

    assert_eq!(response.result(), Some(body));
}

#[tokio::test]
async fn identical_requests_yield_identical_responses() {
    let (worker, _) = worker();
    let request = RenderRequest::new("index")
        .with_file("index", "<h1>Hi</h1>")
        .with_json(json!({ "title": "Hi" }));

    let first = worker.handle(request.clone()).await;
    let second = worker.handle(request).await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn capability_is_loaded_once_across_requests() {
    let (worker, loader) = worker();
    assert_eq!(worker.capability_state(), CapabilityState::Uninitialized);

    for _ in 0..3 {
        let request = RenderRequest::new("index").with_file("index", "x");
        assert!(worker.handle(request).await.is_ok());
    }

    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(worker.capability_state(), CapabilityState::Ready);
}

#[tokio::test]
async fn load_failure_becomes_failure_response() {
    let worker = RenderWorker::new(Arc::new(BrokenLoader));

    let response = worker
        .handle(RenderRequest::new("index").with_file("index", "x"))
        .await;

    assert!(
        response
            .error()
            .is_some_and(|error| error.contains("renderer module missing")),
        "{response:?}"
    );
    assert_eq!(worker.capability_state(), CapabilityState::Uninitialized);
}

#[tokio::test]
async fn readiness_is_sent_before_any_request_and_without_loading() {
    let (worker, loader) = worker();
    let SpawnedWorker {
        handle,
        mut responses,
        join,
    } = worker.spawn(4);

    let ready = responses.recv().await.expect("readiness message");
    assert_eq!(ready.result(), Some(READY_RESULT));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 0);

    drop(handle);
    assert_eq!(responses.recv().await, None);
    join.await.expect("worker task");
}

#[tokio::test]
async fn responses_follow_request_order() {
    let (worker, _) = worker();
    let SpawnedWorker {
        handle,
        mut responses,
        join,
    } = worker.spawn(8);

    let roots = ["a", "missing", "b", "c"];
    for root in roots {
        let request = RenderRequest::new(root)
            .with_file("a", "A")
            .with_file("b", "B")
            .with_file("c", "C");
        handle.post(request).await.expect("worker accepts request");
    }
    drop(handle);

    let mut received = Vec::new();
    while let Some(response) = responses.recv().await {
        received.push(response);
    }
    join.await.expect("worker task");

    assert_eq!(received.len(), roots.len() + 1);
    assert_eq!(received[0], RenderResponse::ready());
    assert_eq!(received[1], RenderResponse::success("A"));
    assert!(!received[2].is_ok());
    assert_eq!(received[3], RenderResponse::success("B"));
    assert_eq!(received[4], RenderResponse::success("C"));
}

#[tokio::test]
async fn worker_keeps_serving_after_failure() {
    let (worker, _) = worker();
    let SpawnedWorker {
        handle,
        mut responses,
        join,
    } = worker.spawn(2);

    handle
        .post_raw(r#"{"root":"missing","files":{}}"#)
        .await
        .expect("post");
    handle
        .post_raw(r#"{"root":"index","files":{"index":"ok"},"json":null}"#)
        .await
        .expect("post");
    drop(handle);

    assert_eq!(responses.recv().await, Some(RenderResponse::ready()));
    assert!(!responses.recv().await.expect("failure").is_ok());
    assert_eq!(
        responses.recv().await,
        Some(RenderResponse::success("ok"))
    );
    join.await.expect("worker task");
}
