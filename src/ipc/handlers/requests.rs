use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use super::records::load_student;

fn handle_requests_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = match req.params.get("regNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing regNo", None),
    };
    let review_type = match req.params.get("reviewType").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing reviewType", None),
    };
    let faculty_type = match req.params.get("facultyType").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_lowercase(),
        None => return err(&req.id, "bad_params", "missing facultyType", None),
    };
    if faculty_type != "guide" && faculty_type != "panel" {
        return err(
            &req.id,
            "bad_params",
            "facultyType must be guide or panel",
            Some(json!({ "facultyType": faculty_type })),
        );
    }
    let comments = req
        .params
        .get("comments")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    match load_student(conn, &reg_no) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "regNo": reg_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // One unresolved request per (student, reviewType, facultyType).
    let pending: Option<String> = match conn
        .query_row(
            "SELECT id FROM deadline_requests
             WHERE reg_no = ? AND review_type = ? AND faculty_type = ? AND status = 'pending'",
            (&reg_no, &review_type, &faculty_type),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(existing) = pending {
        return err(
            &req.id,
            "conflict",
            "an unresolved request already exists for this review",
            Some(json!({ "requestId": existing })),
        );
    }

    let request_id = Uuid::new_v4().to_string();
    let requested_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO deadline_requests(
            id, reg_no, review_type, faculty_type, comments, status, requested_at)
         VALUES(?, ?, ?, ?, ?, 'pending', ?)",
        (
            &request_id,
            &reg_no,
            &review_type,
            &faculty_type,
            &comments,
            &requested_at,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "deadline_requests" })),
        );
    }

    ok(
        &req.id,
        json!({ "requestId": request_id, "status": "pending", "requestedAt": requested_at }),
    )
}

fn handle_requests_resolve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let request_id = match req.params.get("requestId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing requestId", None),
    };
    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_ascii_lowercase(),
        None => return err(&req.id, "bad_params", "missing status", None),
    };
    if status != "approved" && status != "rejected" {
        return err(
            &req.id,
            "bad_params",
            "status must be approved or rejected",
            Some(json!({ "status": status })),
        );
    }

    let new_deadline = req.params.get("newDeadline").and_then(|v| v.as_object());
    let (deadline_from, deadline_to) = match (&status[..], new_deadline) {
        ("approved", Some(d)) => (
            d.get("from").and_then(|v| v.as_str()).map(str::to_string),
            d.get("to").and_then(|v| v.as_str()).map(str::to_string),
        ),
        ("approved", None) => {
            return err(
                &req.id,
                "bad_params",
                "approved resolution requires newDeadline",
                None,
            )
        }
        ("rejected", Some(_)) => {
            return err(
                &req.id,
                "bad_params",
                "rejected resolution must not carry newDeadline",
                None,
            )
        }
        _ => (None, None),
    };

    let target: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT reg_no, review_type, status FROM deadline_requests WHERE id = ?",
            [&request_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((reg_no, review_type, current_status)) = target else {
        return err(
            &req.id,
            "not_found",
            "request not found",
            Some(json!({ "requestId": request_id })),
        );
    };

    let resolved_at = Utc::now().to_rfc3339();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    // Compare-and-set on pending status: resolution is exactly-once, a lost
    // race changes nothing.
    let changed = match tx.execute(
        "UPDATE deadline_requests
         SET status = ?, resolved_at = ?, new_deadline_from = ?, new_deadline_to = ?
         WHERE id = ? AND status = 'pending'",
        (
            &status,
            &resolved_at,
            &deadline_from,
            &deadline_to,
            &request_id,
        ),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(
            &req.id,
            "conflict",
            format!("request already resolved as {}", current_status),
            Some(json!({ "requestId": request_id, "status": current_status })),
        );
    }

    if status == "approved" {
        if let Err(e) = tx.execute(
            "INSERT INTO deadline_overrides(reg_no, review_type, deadline_from, deadline_to)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(reg_no, review_type) DO UPDATE SET
               deadline_from = excluded.deadline_from,
               deadline_to = excluded.deadline_to",
            (&reg_no, &review_type, &deadline_from, &deadline_to),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "deadline_overrides" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "requestId": request_id,
            "status": status,
            "resolvedAt": resolved_at
        }),
    )
}

fn handle_requests_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = req
        .params
        .get("regNo")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let status = req
        .params
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_ascii_lowercase());
    if let Some(s) = &status {
        if s != "pending" && s != "approved" && s != "rejected" {
            return err(
                &req.id,
                "bad_params",
                "status must be pending, approved or rejected",
                Some(json!({ "status": s })),
            );
        }
    }

    let mut sql = "SELECT id, reg_no, review_type, faculty_type, comments, status,
                requested_at, resolved_at, new_deadline_from, new_deadline_to
         FROM deadline_requests"
        .to_string();
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(r) = &reg_no {
        clauses.push("reg_no = ?");
        binds.push(r.clone());
    }
    if let Some(s) = &status {
        clauses.push("status = ?");
        binds.push(s.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY requested_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let new_from: Option<String> = r.get(8)?;
            let new_to: Option<String> = r.get(9)?;
            Ok(json!({
                "requestId": r.get::<_, String>(0)?,
                "regNo": r.get::<_, String>(1)?,
                "reviewType": r.get::<_, String>(2)?,
                "facultyType": r.get::<_, String>(3)?,
                "comments": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "requestedAt": r.get::<_, String>(6)?,
                "resolvedAt": r.get::<_, Option<String>>(7)?,
                "newDeadline": if new_from.is_some() || new_to.is_some() {
                    json!({ "from": new_from, "to": new_to })
                } else {
                    serde_json::Value::Null
                }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(requests) => ok(&req.id, json!({ "requests": requests })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "requests.create" => Some(handle_requests_create(state, req)),
        "requests.resolve" => Some(handle_requests_resolve(state, req)),
        "requests.list" => Some(handle_requests_list(state, req)),
        _ => None,
    }
}
