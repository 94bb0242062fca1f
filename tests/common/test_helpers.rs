use bucketgate::{
    AdmissionConfig, AdmissionControl, AdmissionTasks, InMemoryConfigSource, MemorySink, UserInfo,
};
use http::{Method, Request};
use std::sync::Arc;
use std::time::Duration;

pub type TestControl = AdmissionControl<InMemoryConfigSource, MemorySink>;

/// Build a controller over `source`, sync it once and start its tasks.
pub async fn start(
    source: &Arc<InMemoryConfigSource>,
    config: AdmissionConfig,
) -> (TestControl, MemorySink, AdmissionTasks) {
    let sink = MemorySink::new();
    let control =
        AdmissionControl::builder(source.clone()).config(config).sink(sink.clone()).build();
    control.watcher().ensure_synced().await.expect("initial sync");
    let tasks = control.spawn();
    (control, sink, tasks)
}

pub fn request(method: Method, path: &str, user: &str, groups: &[&str]) -> Request<String> {
    let mut req = Request::builder()
        .method(method)
        .uri(path)
        .body(String::new())
        .expect("valid request");
    req.extensions_mut().insert(UserInfo::new(user, groups.iter().copied()));
    req
}

/// Poll `cond` until it holds, letting background tasks run in between.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
