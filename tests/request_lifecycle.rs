use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_evald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn evald");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn seed_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "seed-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-2",
        "schema.save",
        json!({
            "school": "SCOPE",
            "department": "BTech",
            "reviews": [
                {
                    "reviewName": "review1",
                    "displayName": "Review 1",
                    "facultyType": "panel",
                    "deadline": { "from": "2026-03-01", "to": "2026-03-15" },
                    "components": [ { "name": "demo", "weight": 100 } ]
                }
            ]
        }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-3",
        "students.upsert",
        json!({ "students": [{
            "regNo": "21BCE030",
            "name": "Student 21BCE030",
            "school": "SCOPE",
            "department": "BTech"
        }] }),
    );
}

#[test]
fn approve_overrides_deadline_and_resolution_is_exactly_once() {
    let workspace = temp_dir("evald-requests-approve");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "requests.create",
        json!({
            "regNo": "21BCE030",
            "reviewType": "review1",
            "facultyType": "panel",
            "comments": "hospitalized during the review window"
        }),
    );
    let request_id = created
        .get("requestId")
        .and_then(|v| v.as_str())
        .expect("requestId")
        .to_string();
    assert_eq!(created.get("status").and_then(|v| v.as_str()), Some("pending"));

    // Only one unresolved request per (student, reviewType, facultyType).
    let dup = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "requests.create",
        json!({
            "regNo": "21BCE030",
            "reviewType": "review1",
            "facultyType": "panel"
        }),
    );
    assert_eq!(dup.get("code").and_then(|v| v.as_str()), Some("conflict"));

    // The same key under the other faculty type is a distinct request.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "requests.create",
        json!({
            "regNo": "21BCE030",
            "reviewType": "review1",
            "facultyType": "guide"
        }),
    );

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "requests.resolve",
        json!({
            "requestId": request_id,
            "status": "approved",
            "newDeadline": { "from": "2026-03-20", "to": "2026-03-27" }
        }),
    );
    assert_eq!(resolved.get("status").and_then(|v| v.as_str()), Some("approved"));
    let resolved_at = resolved
        .get("resolvedAt")
        .and_then(|v| v.as_str())
        .expect("resolvedAt")
        .to_string();

    // The student's effective deadline now comes from the override.
    let record = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.get",
        json!({ "regNo": "21BCE030" }),
    );
    let deadline = record
        .get("reviews")
        .and_then(|v| v.as_array())
        .and_then(|rs| rs.first())
        .and_then(|r| r.get("deadline"))
        .cloned()
        .expect("deadline");
    assert_eq!(deadline.get("overridden").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(deadline.get("from").and_then(|v| v.as_str()), Some("2026-03-20"));
    assert_eq!(deadline.get("to").and_then(|v| v.as_str()), Some("2026-03-27"));

    // A second resolve must fail and leave the record unchanged.
    let conflict = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "requests.resolve",
        json!({
            "requestId": request_id,
            "status": "rejected"
        }),
    );
    assert_eq!(conflict.get("code").and_then(|v| v.as_str()), Some("conflict"));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "requests.list",
        json!({ "regNo": "21BCE030", "status": "approved" }),
    );
    let rows = listed.get("requests").and_then(|v| v.as_array()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("resolvedAt").and_then(|v| v.as_str()),
        Some(resolved_at.as_str())
    );
    assert_eq!(
        rows[0]
            .get("newDeadline")
            .and_then(|d| d.get("to"))
            .and_then(|v| v.as_str()),
        Some("2026-03-27")
    );
}

#[test]
fn rejected_resolution_carries_no_deadline() {
    let workspace = temp_dir("evald-requests-reject");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "requests.create",
        json!({
            "regNo": "21BCE030",
            "reviewType": "review1",
            "facultyType": "panel"
        }),
    );
    let request_id = created
        .get("requestId")
        .and_then(|v| v.as_str())
        .expect("requestId")
        .to_string();

    // approved requires a deadline; rejected must not carry one.
    let missing = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "requests.resolve",
        json!({ "requestId": request_id, "status": "approved" }),
    );
    assert_eq!(missing.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let extra = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "requests.resolve",
        json!({
            "requestId": request_id,
            "status": "rejected",
            "newDeadline": { "from": "2026-04-01", "to": "2026-04-08" }
        }),
    );
    assert_eq!(extra.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "requests.resolve",
        json!({ "requestId": request_id, "status": "rejected" }),
    );
    assert_eq!(resolved.get("status").and_then(|v| v.as_str()), Some("rejected"));

    // No override was written; the schema window still applies.
    let record = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.get",
        json!({ "regNo": "21BCE030" }),
    );
    let deadline = record
        .get("reviews")
        .and_then(|v| v.as_array())
        .and_then(|rs| rs.first())
        .and_then(|r| r.get("deadline"))
        .cloned()
        .expect("deadline");
    assert_eq!(deadline.get("overridden").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(deadline.get("from").and_then(|v| v.as_str()), Some("2026-03-01"));

    // A rejected request no longer blocks a fresh one.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "requests.create",
        json!({
            "regNo": "21BCE030",
            "reviewType": "review1",
            "facultyType": "panel"
        }),
    );
}

#[test]
fn unknown_request_is_not_found() {
    let workspace = temp_dir("evald-requests-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed_workspace(&mut stdin, &mut reader, &workspace);

    let error = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "requests.resolve",
        json!({
            "requestId": "does-not-exist",
            "status": "rejected"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));
}
