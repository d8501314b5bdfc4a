use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn skyq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("skyq");
    path
}

struct Env {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

fn setup_test_env() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let catalog_dir = root.join("catalogs");
    fs::create_dir_all(&catalog_dir).unwrap();
    fs::write(
        catalog_dir.join("sources.jsonl"),
        concat!(
            r#"{"_id": "ZTF1", "mag": 17.2, "coordinates": {"radec_geojson": {"type": "Point", "coordinates": [-170.0, 20.0]}}}"#,
            "\n",
            r#"{"_id": "ZTF2", "mag": 19.4, "coordinates": {"radec_geojson": {"type": "Point", "coordinates": [-169.9, 20.05]}}}"#,
            "\n",
            r#"{"_id": "ZTF3", "mag": 16.0, "coordinates": {"radec_geojson": {"type": "Point", "coordinates": [100.0, -45.0]}}}"#,
            "\n",
        ),
    )
    .unwrap();
    fs::write(
        catalog_dir.join("users.json"),
        r#"[{"_id": "admin", "password": "secret"}]"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/skyquery.sqlite"

[storage]
queries_path = "{root}/data/queries"

[retention]
query_expiration_days = 30

[policy]
admin_username = "admin"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("skyquery.toml");
    fs::write(&config_path, config_content).unwrap();

    Env {
        _tmp: tmp,
        root,
        config_path,
    }
}

fn run_skyq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = skyq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run skyq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

/// Initialized database with the test catalogs loaded.
fn loaded_env() -> Env {
    let env = setup_test_env();
    let (_, stderr, ok) = run_skyq(&env.config_path, &["init"]);
    assert!(ok, "init failed: {stderr}");
    for (collection, file) in [("sources", "sources.jsonl"), ("users", "users.json")] {
        let path = env.root.join("catalogs").join(file);
        let (stdout, stderr, ok) =
            run_skyq(&env.config_path, &["load", collection, path.to_str().unwrap()]);
        assert!(ok, "load {collection} failed: stdout={stdout}, stderr={stderr}");
    }
    env
}

fn write_request(env: &Env, name: &str, request: Value) -> PathBuf {
    let path = env.root.join(name);
    fs::write(&path, serde_json::to_string(&request).unwrap()).unwrap();
    path
}

fn query(env: &Env, user: &str, request: &Path) -> (String, String, bool) {
    run_skyq(
        &env.config_path,
        &["query", "--user", user, request.to_str().unwrap()],
    )
}

fn parse(stdout: &str) -> Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("bad JSON output {stdout:?}: {e}"))
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env();
    let (stdout, stderr, success) = run_skyq(&env.config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.root.join("data").join("skyquery.sqlite").is_file());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env();
    let (_, _, first) = run_skyq(&env.config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_skyq(&env.config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_load_reports_counts_and_upserts() {
    let env = setup_test_env();
    run_skyq(&env.config_path, &["init"]);
    let file = env.root.join("catalogs").join("sources.jsonl");
    let (stdout, _, ok) = run_skyq(&env.config_path, &["load", "sources", file.to_str().unwrap()]);
    assert!(ok);
    assert!(stdout.contains("upserted documents: 3"));
    assert!(stdout.contains("ok"));

    run_skyq(&env.config_path, &["load", "sources", file.to_str().unwrap()]);
    let request = write_request(
        &env,
        "count.json",
        json!({"query_type": "general_search", "query": "db['sources'].count_documents({})"}),
    );
    let (stdout, _, ok) = query(&env, "alice", &request);
    assert!(ok);
    assert_eq!(parse(&stdout)["result_data"], json!({"query_result": 3}));
}

#[test]
fn test_general_search_inline() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "find.json",
        json!({
            "query_type": "general_search",
            "query": "db['sources'].find({'mag': {'$lt': 18}}, {'_id': 1}).sort('mag', -1)"
        }),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(ok, "query failed: {stderr}");
    let result = parse(&stdout);
    assert_eq!(result["status"], "done");
    assert_eq!(result["user"], "alice");
    assert!(result.get("task_id").is_none());
    assert_eq!(
        result["result_data"],
        json!({"query_result": [{"_id": "ZTF1"}, {"_id": "ZTF3"}]})
    );
}

#[test]
fn test_privileged_collection_rejected() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "users.json",
        json!({"query_type": "general_search", "query": "db['users'].find({})"}),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(!ok, "users read should be rejected: {stdout}");
    assert!(stdout.is_empty());
    assert!(stderr.contains("query rejected"), "stderr: {stderr}");
    assert!(stderr.contains("users"));

    let (stdout, stderr, ok) = query(&env, "admin", &request);
    assert!(ok, "admin read failed: {stderr}");
    assert_eq!(parse(&stdout)["result_data"]["query_result"][0]["_id"], "admin");
}

#[test]
fn test_denied_token_rejected() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "drop.json",
        json!({"query_type": "general_search", "query": "db['sources'].drop()"}),
    );
    let (_, stderr, ok) = query(&env, "alice", &request);
    assert!(!ok);
    assert!(stderr.contains("query rejected"), "stderr: {stderr}");
}

#[test]
fn test_cone_search() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "cone.json",
        json!({
            "query_type": "cone_search",
            "object_coordinates": {
                "radec": "[(10.0, 20.0)]",
                "cone_search_radius": "3600",
                "cone_search_unit": "arcsec"
            },
            "catalogs": {"sources": {"filter": "{}", "projection": "{'_id': 1}"}}
        }),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(ok, "cone search failed: {stderr}");
    assert_eq!(
        parse(&stdout)["result_data"],
        json!({"sources": {"(10_0, 20_0)": [{"_id": "ZTF1"}, {"_id": "ZTF2"}]}})
    );
}

#[test]
fn test_saved_query_show_and_delete() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "saved.json",
        json!({
            "query_type": "general_search",
            "query": "db['sources'].distinct('_id')",
            "kwargs": {"save": true}
        }),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(ok, "saved query failed: {stderr}");
    let result = parse(&stdout);
    let task_id = result["task_id"].as_str().unwrap().to_string();
    assert_eq!(task_id.len(), 64);
    assert_eq!(result["status"], "done");

    let user_dir = env.root.join("data").join("queries").join("alice");
    let result_file = user_dir.join(format!("{task_id}.result.json"));
    assert!(user_dir.join(format!("{task_id}.task.json")).is_file());
    assert!(result_file.is_file());
    assert_eq!(result["result"], result_file.display().to_string());

    // resubmission returns the same task
    let (stdout, _, ok) = query(&env, "alice", &request);
    assert!(ok);
    assert_eq!(parse(&stdout)["task_id"], task_id.as_str());

    let (_, stderr, ok) =
        run_skyq(&env.config_path, &["task", "show", &task_id, "--user", "bob"]);
    assert!(!ok);
    assert!(stderr.contains("another user"), "stderr: {stderr}");

    let (stdout, stderr, ok) =
        run_skyq(&env.config_path, &["task", "show", &task_id, "--user", "alice"]);
    assert!(ok, "task show failed: {stderr}");
    let shown = parse(&stdout);
    assert_eq!(shown["task"]["status"], "done");
    assert_eq!(
        shown["result"],
        json!({"query_result": ["ZTF1", "ZTF2", "ZTF3"]})
    );

    let (stdout, stderr, ok) =
        run_skyq(&env.config_path, &["task", "delete", &task_id, "--user", "alice"]);
    assert!(ok, "task delete failed: {stderr}");
    assert!(stdout.contains("deleted"));
    assert!(!result_file.exists());

    let (_, stderr, ok) =
        run_skyq(&env.config_path, &["task", "show", &task_id, "--user", "alice"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "stderr: {stderr}");
}

#[test]
fn test_enqueue_only_then_run() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "enqueue.json",
        json!({
            "query_type": "general_search",
            "query": "db['sources'].aggregate([{'$match': {'mag': {'$gt': 17}}}, {'$count': 'n'}])",
            "kwargs": {"enqueue_only": true, "query_expiration_interval": 2}
        }),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(ok, "enqueue failed: {stderr}");
    let submitted = parse(&stdout);
    assert_eq!(submitted["status"], "enqueued");
    assert_eq!(submitted["result"], Value::Null);
    let task_id = submitted["task_id"].as_str().unwrap().to_string();

    let (stdout, stderr, ok) =
        run_skyq(&env.config_path, &["task", "run", &task_id, "--user", "alice"]);
    assert!(ok, "task run failed: {stderr}");
    assert_eq!(parse(&stdout)["status"], "done");

    let (stdout, _, _) =
        run_skyq(&env.config_path, &["task", "show", &task_id, "--user", "alice"]);
    assert_eq!(parse(&stdout)["result"], json!({"query_result": [{"n": 2}]}));

    let (_, stderr, ok) =
        run_skyq(&env.config_path, &["task", "run", &task_id, "--user", "alice"]);
    assert!(!ok);
    assert!(stderr.contains("not enqueued"), "stderr: {stderr}");
}

#[test]
fn test_failed_query_hides_detail() {
    let env = loaded_env();
    let request = write_request(
        &env,
        "near.json",
        json!({
            "query_type": "general_search",
            "query": "db['sources'].find({'mag': {'$near': 1}})",
            "kwargs": {"save": true}
        }),
    );
    let (stdout, stderr, ok) = query(&env, "alice", &request);
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Error: query failed"), "stderr: {stderr}");

    let user_dir = env.root.join("data").join("queries").join("alice");
    let failure = fs::read_dir(&user_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.to_string_lossy().ends_with(".result.json"))
        .expect("failure payload written");
    let payload: Value = serde_json::from_str(&fs::read_to_string(failure).unwrap()).unwrap();
    assert!(payload["msg"].as_str().unwrap().contains("$near"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_skyq(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"), "stderr: {stderr}");
}
