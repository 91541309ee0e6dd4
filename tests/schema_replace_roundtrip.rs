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

#[test]
fn save_replaces_whole_document_with_no_residue() {
    let workspace = temp_dir("evald-replace");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schema.save",
        json!({
            "school": "SCOPE",
            "department": "BTech",
            "reviews": [
                {
                    "reviewName": "draftReview",
                    "displayName": "Draft Review",
                    "facultyType": "guide",
                    "deadline": { "from": "2026-01-05", "to": "2026-01-20" },
                    "components": [
                        { "name": "title", "weight": 40 },
                        { "name": "content", "weight": 60 }
                    ]
                }
            ]
        }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schema.get",
        json!({ "school": "SCOPE", "department": "BTech" }),
    );
    let first_reviews = first.get("reviews").and_then(|v| v.as_array()).unwrap();
    assert_eq!(first_reviews.len(), 1);
    assert_eq!(
        first_reviews[0].get("reviewName").and_then(|v| v.as_str()),
        Some("draftReview")
    );
    assert_eq!(
        first_reviews[0]
            .get("deadline")
            .and_then(|d| d.get("from"))
            .and_then(|v| v.as_str()),
        Some("2026-01-05")
    );

    // Full replace: the second document has a different review set and the
    // first leaves no residue behind.
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schema.save",
        json!({
            "school": "SCOPE",
            "department": "BTech",
            "reviews": [
                {
                    "reviewName": "review1",
                    "displayName": "Review 1",
                    "facultyType": "panel",
                    "deadline": { "from": "2026-02-01", "to": "2026-02-14" },
                    "components": [
                        { "name": "demo", "weight": 70 },
                        { "name": "viva", "weight": 30 }
                    ]
                }
            ]
        }),
    );
    assert_eq!(saved.get("replaced").and_then(|v| v.as_bool()), Some(true));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schema.get",
        json!({ "school": "SCOPE", "department": "BTech" }),
    );
    let reviews = second.get("reviews").and_then(|v| v.as_array()).unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(
        reviews[0].get("reviewName").and_then(|v| v.as_str()),
        Some("review1")
    );
    let components = reviews[0]
        .get("components")
        .and_then(|v| v.as_array())
        .unwrap();
    let names: Vec<&str> = components
        .iter()
        .filter_map(|c| c.get("name").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(names, vec!["demo", "viva"]);

    // Distinct owner keys are independent documents.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "schema.save",
        json!({
            "school": "SENSE",
            "department": "MTech",
            "reviews": [
                {
                    "reviewName": "finalReview",
                    "displayName": "Final Review",
                    "facultyType": "panel",
                    "components": [ { "name": "thesis", "weight": 100 } ]
                }
            ]
        }),
    );
    let scope_again = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "schema.get",
        json!({ "school": "SCOPE", "department": "BTech" }),
    );
    let reviews = scope_again.get("reviews").and_then(|v| v.as_array()).unwrap();
    assert_eq!(
        reviews[0].get("reviewName").and_then(|v| v.as_str()),
        Some("review1")
    );
}
