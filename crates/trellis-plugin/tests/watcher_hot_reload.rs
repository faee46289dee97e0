//! Debounced hot reload end to end: artifact writes load and replace live
//! plugins, removals unregister them, and failures never spread.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{test_host, test_manager, wat_fixture};
use serde_json::Value;
use trellis_plugin::loader::{LoaderOptions, PluginLoader};
use trellis_plugin::manager::PluginManager;
use trellis_plugin::watcher::HotReloadWatcher;
use trellis_plugin_api::host::CallContext;

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trellis-watch-{tag}-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Poll until the condition holds or a few seconds pass.
async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn call_ping(manager: &Arc<PluginManager>, name: &str) -> Option<String> {
    manager
        .call(&CallContext::root(), name, "ping", Value::Null)
        .await
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
}

#[tokio::test(flavor = "multi_thread")]
async fn wasm_artifact_lifecycle_via_the_watcher() {
    common::init_tracing();
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("wasm-lifecycle");

    let loader =
        PluginLoader::new(Arc::clone(&manager), LoaderOptions::new(root.clone())).unwrap();
    let watcher =
        HotReloadWatcher::start_with_debounce(Arc::clone(&loader), Duration::from_millis(100))
            .unwrap();

    // Create: a new artifact is loaded shortly after the burst settles.
    let artifact = root.join("hotty.wasm");
    std::fs::write(&artifact, wat_fixture("hotty", "v1")).unwrap();
    wait_for("initial load", || manager.contains("hotty")).await;
    assert_eq!(call_ping(&manager, "hotty").await.as_deref(), Some("v1"));

    // Write: the artifact is atomically replaced; no call ever finds the
    // name missing.
    std::fs::write(&artifact, wat_fixture("hotty", "v2")).unwrap();
    let mut observed = None;
    for _ in 0..100 {
        // Throughout the swap the name resolves; the reply flips to v2.
        let reply = call_ping(&manager, "hotty").await;
        assert!(reply.is_some(), "no call may find 'hotty' missing");
        if reply.as_deref() == Some("v2") {
            observed = reply;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(observed.as_deref(), Some("v2"), "replacement never observed");

    // A broken write is logged, not propagated; the old instance stays.
    std::fs::write(&artifact, b"garbage").unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(call_ping(&manager, "hotty").await.as_deref(), Some("v2"));

    // Remove: the plugin is unregistered and the discovery forgotten.
    std::fs::remove_file(&artifact).unwrap();
    wait_for("unregister", || !manager.contains("hotty")).await;
    assert!(loader.discovery("hotty").is_none());

    watcher.stop();
    manager.shutdown_all().await.ok();
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn descriptor_lifecycle_via_the_watcher() {
    common::init_tracing();
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("descr-lifecycle");

    let loader =
        PluginLoader::new(Arc::clone(&manager), LoaderOptions::new(root.clone())).unwrap();
    let _watcher =
        HotReloadWatcher::start_with_debounce(Arc::clone(&loader), Duration::from_millis(100))
            .unwrap();

    // A descriptor appears for a binary that does not exist: the discovery
    // is recorded, the load failure is logged, nothing else breaks.
    let tool_dir = root.join("tool");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("plugin.yaml"), "runtime: grpc\n").unwrap();

    wait_for("discovery recorded", || loader.discovery("tool").is_some()).await;
    assert!(!manager.contains("tool"));

    // Removing the descriptor forgets the discovery.
    std::fs::remove_file(tool_dir.join("plugin.yaml")).unwrap();
    wait_for("discovery forgotten", || loader.discovery("tool").is_none()).await;

    std::fs::remove_dir_all(&root).ok();
}
