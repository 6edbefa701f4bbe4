//! End-to-end tests driving real guest modules through the manager.
//!
//! Guests are written in WAT and composed from shared fragments: a bump
//! allocator plus the metadata exports every analyzer must carry.

use std::sync::Arc;

use modhost::{
    AnalysisInput, AnalysisResult, AnalyzerRegistry, CapturingSink, InMemoryRegistry, LogLevel,
    ManagerConfig, ModuleManager, Report, ScanResult, SharedSink,
};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Exported linear memory, a bump allocator, and the packing helper.
/// The heap starts at the second page; data segments stay below 2048.
const ALLOC: &str = r#"
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 65536))
  (func $pack (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
  (func (export "malloc") (param i64) (result i64)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.wrap_i64 (local.get 0))))
    (i64.extend_i32_u (local.get $ptr)))
  (func (export "free") (param i64))
"#;

/// WAT literal for `["\.txt$"]` (11 bytes on the wire).
const TXT_REQUIRED: (&str, u32) = (r#""[\"\\\\.txt$\"]""#, 11);
/// WAT literal for `[]`.
const NO_REQUIRED: (&str, u32) = (r#""[]""#, 2);
/// WAT literal for `["["]`, an invalid pattern.
const BAD_REQUIRED: (&str, u32) = (r#""[\"[\"]""#, 5);

/// `analyze` returning a packed pointer to `{}`.
const ANALYZE_EMPTY: &str = r#"
  (data (i32.const 1200) "{}")
  (func (export "analyze") (param i64 i64) (result i64)
    (call $pack (i32.const 1200) (i32.const 2)))
"#;

/// `analyze` returning `{"os":null,"packages":[]}` (25 bytes).
const ANALYZE_NULL_RESULT: &str = r#"
  (data (i32.const 1200) "{\"os\":null,\"packages\":[]}")
  (func (export "analyze") (param i64 i64) (result i64)
    (call $pack (i32.const 1200) (i32.const 25)))
"#;

/// `post_scan` echoing its input region back to the host.
const POST_SCAN_ECHO: &str = r#"
  (func (export "post_scan") (param i64 i64) (result i64)
    (i64.or (i64.shl (local.get 0) (i64.const 32)) (local.get 1)))
"#;

fn meta(name: &str, version: i64, required: (&str, u32)) -> String {
    format!(
        r#"
  (data (i32.const 1024) "{name}")
  (data (i32.const 1100) {json})
  (func (export "name") (result i64) (call $pack (i32.const 1024) (i32.const {name_len})))
  (func (export "version") (result i64) (i64.const {version}))
  (func (export "required") (result i64) (call $pack (i32.const 1100) (i32.const {json_len})))
"#,
        json = required.0,
        name_len = name.len(),
        json_len = required.1,
    )
}

fn guest(parts: &[&str]) -> String {
    format!("(module\n{}\n)", parts.join("\n"))
}

fn echo_guest() -> String {
    guest(&[
        ALLOC,
        &meta("echo", 1, TXT_REQUIRED),
        ANALYZE_NULL_RESULT,
        POST_SCAN_ECHO,
    ])
}

async fn build_manager(
    sink: SharedSink,
    guests: &[(&str, &str)],
) -> (TempDir, modhost::ModuleResult<ModuleManager>) {
    let dir = TempDir::new().expect("temp dir");
    for (file_name, wat) in guests {
        std::fs::write(dir.path().join(file_name), wat).expect("write guest");
    }
    let config = ManagerConfig::new().with_module_dir(dir.path());
    let manager = ModuleManager::with_sink(config, sink).await;
    (dir, manager)
}

fn capturing() -> (Arc<CapturingSink>, SharedSink) {
    let sink = Arc::new(CapturingSink::new());
    let shared: SharedSink = sink.clone();
    (sink, shared)
}

#[tokio::test]
async fn empty_directory_is_a_working_manager() {
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[]).await;
    let mut manager = manager.expect("construction");
    assert!(manager.modules().is_empty());

    let cancel = CancellationToken::new();
    let mut report = Report::default();
    manager.post_scan(&cancel, &mut report).await.expect("no-op post scan");
    manager.close().await.expect("close");
}

#[tokio::test]
async fn echo_module_end_to_end() {
    let (_, shared) = capturing();
    let wat = echo_guest();
    let (_dir, manager) = build_manager(shared, &[("echo.wasm", &wat)]).await;
    let mut manager = manager.expect("construction");
    assert_eq!(manager.modules().len(), 1);

    let module = &manager.modules()[0];
    assert_eq!(module.name(), "echo");
    assert_eq!(module.version(), 1);
    assert!(module.required("/a.txt"));
    assert!(!module.required("/a.md"));

    let cancel = CancellationToken::new();
    let result = module
        .analyze(&cancel, AnalysisInput::new("a.txt", Vec::new()))
        .await
        .expect("analyze");
    assert_eq!(result, AnalysisResult::default());

    // post_scan through an identity guest leaves every field alone.
    let mut report = Report {
        results: vec![
            ScanResult {
                target: "a.txt".to_string(),
                class: "lang-pkgs".to_string(),
                kind: "gobinary".to_string(),
                extra: serde_json::from_value(json!({
                    "Vulnerabilities": [{"VulnerabilityID": "CVE-2024-0001"}]
                }))
                .expect("extra map"),
            },
            ScanResult {
                target: "b.txt".to_string(),
                ..ScanResult::default()
            },
        ],
        ..Report::default()
    };
    let before = report.clone();
    manager.post_scan(&cancel, &mut report).await.expect("post scan");
    assert_eq!(report, before);

    // Every allocation the host issued was released.
    let metrics = module.metrics();
    assert!(metrics.malloc_calls > 0);
    assert_eq!(metrics.malloc_calls, metrics.free_calls);

    manager.close().await.expect("close");
}

#[tokio::test]
async fn guest_logs_are_forwarded_byte_for_byte() {
    let logger = guest(&[
        r#"(import "env" "info" (func $info (param i32 i32)))"#,
        ALLOC,
        &meta("logger", 1, NO_REQUIRED),
        r#"
  (data (i32.const 1300) "hello")
  (data (i32.const 1200) "{}")
  (func (export "analyze") (param i64 i64) (result i64)
    (call $info (i32.const 1300) (i32.const 5))
    (call $pack (i32.const 1200) (i32.const 2)))
"#,
        POST_SCAN_ECHO,
    ]);

    let (sink, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("logger.wasm", &logger)]).await;
    let manager = manager.expect("construction");

    let cancel = CancellationToken::new();
    manager.modules()[0]
        .analyze(&cancel, AnalysisInput::new("x.txt", Vec::new()))
        .await
        .expect("analyze");

    assert_eq!(sink.messages_at(LogLevel::Info), vec![b"hello".to_vec()]);
}

#[tokio::test]
async fn version_is_wired_through_to_the_registry() {
    let wat = guest(&[
        ALLOC,
        &meta("vmod", 7, NO_REQUIRED),
        ANALYZE_EMPTY,
        POST_SCAN_ECHO,
    ]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("vmod.wasm", &wat)]).await;
    let manager = manager.expect("construction");
    assert_eq!(manager.modules()[0].version(), 7);

    let registry = InMemoryRegistry::new();
    manager.register(&registry);
    let listed = registry.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].kind(), "vmod");
    assert_eq!(listed[0].version(), 7);
    assert!(!listed[0].required("/anything"));
}

#[tokio::test]
async fn two_value_analyze_is_rejected_at_load() {
    let wat = guest(&[
        ALLOC,
        &meta("arity", 1, NO_REQUIRED),
        r#"
  (func (export "analyze") (param i64 i64) (result i64 i64)
    (i64.const 0) (i64.const 0))
"#,
        POST_SCAN_ECHO,
    ]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("arity.wasm", &wat)]).await;
    let err = manager.err().expect("load must fail");
    let text = err.to_string();
    assert!(text.contains("invalid signature: analyze"), "{text}");
    assert!(text.contains("arity.wasm"), "{text}");
}

#[tokio::test]
async fn out_of_range_result_pointer_is_contained() {
    let wat = guest(&[
        ALLOC,
        &meta("badptr", 1, NO_REQUIRED),
        r#"
  (func (export "analyze") (param i64 i64) (result i64)
    (i64.const 0x7FFFFFFF00000010))
"#,
        POST_SCAN_ECHO,
    ]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("badptr.wasm", &wat)]).await;
    let manager = manager.expect("construction");
    let module = &manager.modules()[0];

    let cancel = CancellationToken::new();
    let err = module
        .analyze(&cancel, AnalysisInput::new("x.txt", Vec::new()))
        .await
        .err()
        .expect("analyze must fail");
    let text = err.to_string();
    assert!(text.contains("unable to read memory"), "{text}");
    assert!(text.contains("badptr"), "{text}");

    let metrics = module.metrics();
    assert_eq!(metrics.malloc_calls, metrics.free_calls);
}

#[tokio::test]
async fn a_trap_does_not_poison_the_instance() {
    // Traps on any path longer than "/a.txt".
    let wat = guest(&[
        ALLOC,
        &meta("trap", 1, NO_REQUIRED),
        r#"
  (data (i32.const 1200) "{}")
  (func (export "analyze") (param i64 i64) (result i64)
    (if (i64.gt_u (local.get 1) (i64.const 6)) (then unreachable))
    (call $pack (i32.const 1200) (i32.const 2)))
"#,
        POST_SCAN_ECHO,
    ]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("trap.wasm", &wat)]).await;
    let manager = manager.expect("construction");
    let module = &manager.modules()[0];

    let cancel = CancellationToken::new();
    let err = module
        .analyze(&cancel, AnalysisInput::new("longer.txt", Vec::new()))
        .await
        .err()
        .expect("trap surfaces as an error");
    assert!(err.to_string().contains("trap"), "{err}");

    let ok = module
        .analyze(&cancel, AnalysisInput::new("a.txt", Vec::new()))
        .await
        .expect("instance survives a trap");
    assert_eq!(ok, AnalysisResult::default());
}

#[tokio::test]
async fn invalid_required_pattern_rejects_the_module() {
    let wat = guest(&[
        ALLOC,
        &meta("badre", 1, BAD_REQUIRED),
        ANALYZE_EMPTY,
        POST_SCAN_ECHO,
    ]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("badre.wasm", &wat)]).await;
    let err = manager.err().expect("load must fail");
    assert!(err.to_string().contains("regexp compile error"), "{err}");
}

#[tokio::test]
async fn missing_mandatory_export_rejects_the_module() {
    let wat = guest(&[ALLOC, &meta("partial", 1, NO_REQUIRED), ANALYZE_EMPTY]);
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("partial.wasm", &wat)]).await;
    let err = manager.err().expect("load must fail");
    assert!(
        err.to_string().contains("post_scan() must be exported"),
        "{err}"
    );
}

#[tokio::test]
async fn guest_observes_exactly_the_presented_file() {
    // Opens the path it was handed, checks the file is empty, and traps on
    // any deviation, so a plain Ok proves what the guest saw.
    let probe = guest(&[
        r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_filestat_get"
    (func $filestat (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close"
    (func $fd_close (param i32) (result i32)))
"#,
        ALLOC,
        &meta("probe", 1, NO_REQUIRED),
        r#"
  (data (i32.const 1200) "{}")
  (func (export "analyze") (param $ptr i64) (param $len i64) (result i64)
    (local $fd i32)
    (if (i32.ne
          (call $path_open (i32.const 3) (i32.const 0)
            (i32.wrap_i64 (local.get $ptr)) (i32.wrap_i64 (local.get $len))
            (i32.const 0) (i64.const -1) (i64.const 0) (i32.const 0) (i32.const 512))
          (i32.const 0))
      (then unreachable))
    (local.set $fd (i32.load (i32.const 512)))
    (if (i32.ne (call $filestat (local.get $fd) (i32.const 528)) (i32.const 0))
      (then unreachable))
    (if (i64.ne (i64.load (i32.const 560)) (i64.const 0))
      (then unreachable))
    (i32.store (i32.const 600) (i32.const 640))
    (i32.store (i32.const 604) (i32.const 32))
    (if (i32.ne (call $fd_read (local.get $fd) (i32.const 600) (i32.const 1) (i32.const 608))
          (i32.const 0))
      (then unreachable))
    (if (i32.ne (i32.load (i32.const 608)) (i32.const 0))
      (then unreachable))
    (drop (call $fd_close (local.get $fd)))
    (call $pack (i32.const 1200) (i32.const 2)))
"#,
        POST_SCAN_ECHO,
    ]);

    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("probe.wasm", &probe)]).await;
    let manager = manager.expect("construction");
    let module = &manager.modules()[0];
    let cancel = CancellationToken::new();

    // Empty file at a plain path.
    module
        .analyze(&cancel, AnalysisInput::new("empty.txt", Vec::new()))
        .await
        .expect("empty file is visible");

    // Backslashes are presented forward-slashed and rooted at /.
    module
        .analyze(&cancel, AnalysisInput::new("dir\\empty.txt", Vec::new()))
        .await
        .expect("backslash path is normalized");
}

#[tokio::test]
async fn guest_reads_lazy_content_through_wasi() {
    let reader = guest(&[
        r#"
  (import "wasi_snapshot_preview1" "path_open"
    (func $path_open (param i32 i32 i32 i32 i32 i64 i64 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_read"
    (func $fd_read (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_close"
    (func $fd_close (param i32) (result i32)))
  (import "env" "info" (func $info (param i32 i32)))
"#,
        ALLOC,
        &meta("reader", 1, NO_REQUIRED),
        r#"
  (data (i32.const 1200) "{}")
  (func (export "analyze") (param $ptr i64) (param $len i64) (result i64)
    (local $fd i32)
    (if (i32.ne
          (call $path_open (i32.const 3) (i32.const 0)
            (i32.wrap_i64 (local.get $ptr)) (i32.wrap_i64 (local.get $len))
            (i32.const 0) (i64.const -1) (i64.const 0) (i32.const 0) (i32.const 512))
          (i32.const 0))
      (then unreachable))
    (local.set $fd (i32.load (i32.const 512)))
    (i32.store (i32.const 600) (i32.const 640))
    (i32.store (i32.const 604) (i32.const 64))
    (if (i32.ne (call $fd_read (local.get $fd) (i32.const 600) (i32.const 1) (i32.const 608))
          (i32.const 0))
      (then unreachable))
    (call $info (i32.const 640) (i32.load (i32.const 608)))
    (drop (call $fd_close (local.get $fd)))
    (call $pack (i32.const 1200) (i32.const 2)))
"#,
        POST_SCAN_ECHO,
    ]);

    let (sink, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("reader.wasm", &reader)]).await;
    let manager = manager.expect("construction");
    let cancel = CancellationToken::new();

    manager.modules()[0]
        .analyze(
            &cancel,
            AnalysisInput::lazy("data.txt", Box::new(|| Ok(b"content!".to_vec()))),
        )
        .await
        .expect("analyze");

    assert_eq!(sink.messages_at(LogLevel::Info), vec![b"content!".to_vec()]);
}

#[tokio::test]
async fn guest_may_import_the_host_memory() {
    let wat = guest(&[
        r#"(import "env" "mem" (memory 1 1))"#,
        r#"
  (global $heap (mut i32) (i32.const 4096))
  (func $pack (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
  (func (export "malloc") (param i64) (result i64)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (i32.wrap_i64 (local.get 0))))
    (i64.extend_i32_u (local.get $ptr)))
  (func (export "free") (param i64))
"#,
        &meta("immem", 1, NO_REQUIRED),
        ANALYZE_EMPTY,
        POST_SCAN_ECHO,
    ]);

    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("immem.wasm", &wat)]).await;
    let manager = manager.expect("construction");
    let module = &manager.modules()[0];
    assert_eq!(module.name(), "immem");

    let cancel = CancellationToken::new();
    let result = module
        .analyze(&cancel, AnalysisInput::new("x.txt", Vec::new()))
        .await
        .expect("analyze through imported memory");
    assert_eq!(result, AnalysisResult::default());
}

#[tokio::test]
async fn load_order_follows_file_names_and_skips_other_extensions() {
    let alpha = guest(&[
        ALLOC,
        &meta("alpha", 1, NO_REQUIRED),
        ANALYZE_EMPTY,
        POST_SCAN_ECHO,
    ]);
    let beta = guest(&[
        ALLOC,
        &meta("beta", 2, NO_REQUIRED),
        ANALYZE_EMPTY,
        POST_SCAN_ECHO,
    ]);

    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(
        shared,
        &[
            ("b_second.wasm", &beta),
            ("a_first.wasm", &alpha),
            ("notes.txt", "not a module"),
        ],
    )
    .await;
    let manager = manager.expect("construction");

    let names: Vec<&str> = manager.modules().iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn close_retires_every_module() {
    let wat = echo_guest();
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(
        shared,
        &[("one.wasm", &wat), ("two.wasm", &wat)],
    )
    .await;
    let mut manager = manager.expect("construction");
    assert_eq!(manager.modules().len(), 2);

    manager.close().await.expect("close");

    let cancel = CancellationToken::new();
    for module in manager.modules() {
        let err = module
            .analyze(&cancel, AnalysisInput::new("a.txt", Vec::new()))
            .await
            .err()
            .expect("closed module refuses calls");
        assert!(err.to_string().contains("closed"), "{err}");
    }
}

#[tokio::test]
async fn cancellation_is_observed_before_guest_calls() {
    let wat = echo_guest();
    let (_, shared) = capturing();
    let (_dir, manager) = build_manager(shared, &[("echo.wasm", &wat)]).await;
    let manager = manager.expect("construction");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut report = Report::default();
    report.results.push(ScanResult::default());
    let err = manager
        .post_scan(&cancel, &mut report)
        .await
        .err()
        .expect("cancelled");
    assert!(err.to_string().contains("cancelled"), "{err}");
}
