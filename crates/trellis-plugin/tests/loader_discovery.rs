//! Discovery, eager and lazy loading, signature enforcement, and atomic
//! reload against a real plugin root on disk.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{test_host, test_manager, wat_fixture};
use serde_json::Value;
use trellis_plugin::loader::{DiscoveryKind, LoaderOptions, PluginLoader};
use trellis_plugin::manager::PluginManager;
use trellis_plugin_api::host::CallContext;

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("trellis-load-{tag}-{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn loader_at(manager: &Arc<PluginManager>, root: PathBuf) -> Arc<PluginLoader> {
    PluginLoader::new(Arc::clone(manager), LoaderOptions::new(root)).unwrap()
}

#[tokio::test]
async fn empty_root_is_created_and_yields_nothing() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("empty");
    assert!(!root.exists());

    let loader = loader_at(&manager, root.clone());
    assert!(root.is_dir(), "missing root must be created");

    let discovered = loader.discover_all().unwrap();
    assert!(discovered.is_empty());

    let report = loader.load_all(false).await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(report.loaded, 0);
    assert!(report.failures.is_empty());

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn wasm_files_and_grpc_descriptors_are_discovered() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("discover");
    std::fs::create_dir_all(&root).unwrap();

    std::fs::write(root.join("pingy.wasm"), wat_fixture("pingy", "v1")).unwrap();

    let tool_dir = root.join("tool");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("plugin.yaml"), "runtime: grpc\n").unwrap();

    // A template-only package and a junk descriptor are both skipped.
    let theme_dir = root.join("theme");
    std::fs::create_dir_all(&theme_dir).unwrap();
    std::fs::write(theme_dir.join("plugin.yaml"), "name: theme\n").unwrap();
    let junk_dir = root.join("junk");
    std::fs::create_dir_all(&junk_dir).unwrap();
    std::fs::write(junk_dir.join("plugin.yaml"), ":\n - definitely :: not yaml\n:").unwrap();

    let loader = loader_at(&manager, root.clone());
    let discovered = loader.discover_all().unwrap();
    let names: Vec<&str> = discovered.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["pingy", "tool"]);
    assert_eq!(discovered[0].kind, DiscoveryKind::Wasm);
    assert_eq!(discovered[1].kind, DiscoveryKind::Rpc);

    // Discovery is idempotent on an unchanged tree.
    let again = loader.discover_all().unwrap();
    assert_eq!(again.len(), discovered.len());

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn eager_load_collects_failures_without_aborting() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("eager");
    std::fs::create_dir_all(&root).unwrap();

    std::fs::write(root.join("good.wasm"), wat_fixture("good", "v1")).unwrap();
    std::fs::write(root.join("broken.wasm"), b"\0asm not really").unwrap();
    // A grpc discovery whose binary does not exist.
    let tool_dir = root.join("tool");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("plugin.yaml"), "runtime: grpc\n").unwrap();

    let loader = loader_at(&manager, root.clone());
    let report = loader.load_all(false).await.unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.loaded, 1);
    assert_eq!(report.failures.len(), 2);
    assert!(manager.contains("good"));
    assert!(!manager.contains("broken"));
    assert!(!manager.contains("tool"));

    let pong = manager
        .call(&CallContext::root(), "good", "ping", Value::Null)
        .await
        .unwrap();
    assert_eq!(pong, Value::String("v1".to_string()));

    manager.shutdown_all().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn lazy_mode_materializes_on_first_dispatch() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("lazy");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("sleepy.wasm"), wat_fixture("sleepy", "v1")).unwrap();

    let loader = loader_at(&manager, root.clone());
    let report = loader.load_all(true).await.unwrap();
    assert_eq!(report.discovered, 1);
    assert_eq!(report.loaded, 0);
    assert!(!manager.contains("sleepy"));

    manager.set_lazy_loader(Arc::clone(&loader) as Arc<dyn trellis_plugin::LazyLoader>);

    let pong = manager
        .call(&CallContext::root(), "sleepy", "ping", Value::Null)
        .await
        .unwrap();
    assert_eq!(pong, Value::String("v1".to_string()));
    assert!(manager.contains("sleepy"));

    manager.shutdown_all().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn signature_enforcement_gates_loading() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("sigs");
    std::fs::create_dir_all(&root).unwrap();

    let artifact = root.join("signed.wasm");
    std::fs::write(&artifact, wat_fixture("signed", "v1")).unwrap();

    let keypair = trellis_signer::SigningKeyPair::generate();
    let mut options = LoaderOptions::new(root.clone());
    options.verify_signatures = true;
    options.trusted_keys = vec![keypair.public_key()];
    let loader = PluginLoader::new(Arc::clone(&manager), options).unwrap();
    loader.discover_all().unwrap();

    // No signature file at all.
    assert!(loader.materialize("signed").await.is_err());

    // Zero-length signature file.
    std::fs::write(root.join("signed.wasm.sig"), "").unwrap();
    assert!(loader.materialize("signed").await.is_err());

    // Non-hex signature file.
    std::fs::write(root.join("signed.wasm.sig"), "zz-not-hex").unwrap();
    assert!(loader.materialize("signed").await.is_err());

    // A signature from an untrusted key.
    let stranger = trellis_signer::SigningKeyPair::generate();
    stranger.sign_file(&artifact).unwrap();
    assert!(loader.materialize("signed").await.is_err());
    assert!(!manager.contains("signed"));

    // The real signature loads.
    keypair.sign_file(&artifact).unwrap();
    loader.materialize("signed").await.unwrap();
    assert!(manager.contains("signed"));

    manager.shutdown_all().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}

#[cfg(unix)]
#[tokio::test]
async fn rpc_binary_must_be_executable() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("execbit");
    let tool_dir = root.join("tool");
    std::fs::create_dir_all(&tool_dir).unwrap();
    std::fs::write(tool_dir.join("plugin.yaml"), "runtime: grpc\n").unwrap();
    std::fs::write(tool_dir.join("tool"), b"#!/bin/sh\nexit 0\n").unwrap();

    let loader = loader_at(&manager, root.clone());
    loader.discover_all().unwrap();

    let err = loader.materialize("tool").await.unwrap_err();
    assert!(err.to_string().contains("not executable"), "{err}");

    std::fs::remove_dir_all(&root).ok();
}

#[tokio::test]
async fn reload_swaps_atomically_and_keeps_the_old_on_failure() {
    let host = test_host();
    let manager = test_manager(&host);
    let root = scratch("reload");
    std::fs::create_dir_all(&root).unwrap();
    let artifact = root.join("pingy.wasm");
    std::fs::write(&artifact, wat_fixture("pingy", "v1")).unwrap();

    let loader = loader_at(&manager, root.clone());
    loader.load_all(false).await.unwrap();

    let ctx = CallContext::root();
    let v1 = manager.call(&ctx, "pingy", "ping", Value::Null).await.unwrap();
    assert_eq!(v1, Value::String("v1".to_string()));

    // Replace the artifact and reload: later calls see the new instance.
    std::fs::write(&artifact, wat_fixture("pingy", "v2")).unwrap();
    loader.reload("pingy").await.unwrap();
    let v2 = manager.call(&ctx, "pingy", "ping", Value::Null).await.unwrap();
    assert_eq!(v2, Value::String("v2".to_string()));

    // A broken replacement leaves the live instance untouched.
    std::fs::write(&artifact, b"garbage").unwrap();
    assert!(loader.reload("pingy").await.is_err());
    let still_v2 = manager.call(&ctx, "pingy", "ping", Value::Null).await.unwrap();
    assert_eq!(still_v2, Value::String("v2".to_string()));

    manager.shutdown_all().await.unwrap();
    std::fs::remove_dir_all(&root).ok();
}
