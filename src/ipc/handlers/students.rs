use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_students_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(items) = req.params.get("students").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing students[]", None);
    };

    let now = Utc::now().to_rfc3339();
    let mut upserted: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "student must be an object"
            }));
            continue;
        };
        let reg_no = obj
            .get("regNo")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let school = obj
            .get("school")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let department = obj
            .get("department")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if reg_no.is_empty() || name.is_empty() || school.is_empty() || department.is_empty() {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": "regNo, name, school and department are required"
            }));
            continue;
        }

        let res = conn.execute(
            "INSERT INTO students(reg_no, name, school, department, updated_at)
             VALUES(?, ?, ?, ?, ?)
             ON CONFLICT(reg_no) DO UPDATE SET
               name = excluded.name,
               school = excluded.school,
               department = excluded.department,
               updated_at = excluded.updated_at",
            (&reg_no, &name, &school, &department, &now),
        );
        match res {
            Ok(_) => upserted += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": "db_insert_failed",
                "message": e.to_string()
            })),
        }
    }

    let mut result = json!({ "upserted": upserted });
    if !errors.is_empty() {
        result
            .as_object_mut()
            .expect("result should be object")
            .insert("errors".into(), json!(errors));
    }
    ok(&req.id, result)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school = req
        .params
        .get("school")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let department = req
        .params
        .get("department")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let mut sql = "SELECT reg_no, name, school, department, pat, ppt_approved, ppt_locked
         FROM students"
        .to_string();
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<String> = Vec::new();
    if let Some(s) = &school {
        clauses.push("school = ?");
        binds.push(s.clone());
    }
    if let Some(d) = &department {
        clauses.push("department = ?");
        binds.push(d.clone());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY reg_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            let reg_no: String = r.get(0)?;
            let name: String = r.get(1)?;
            let school: String = r.get(2)?;
            let department: String = r.get(3)?;
            let pat: i64 = r.get(4)?;
            let ppt_approved: i64 = r.get(5)?;
            let ppt_locked: i64 = r.get(6)?;
            Ok(json!({
                "regNo": reg_no,
                "name": name,
                "school": school,
                "department": department,
                "pat": pat != 0,
                "pptApproved": { "approved": ppt_approved != 0, "locked": ppt_locked != 0 }
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_set_pat(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = match req.params.get("regNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing regNo", None),
    };
    let pat = match req.params.get("pat").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid pat", None),
    };

    let changed = match conn.execute(
        "UPDATE students SET pat = ?, updated_at = ? WHERE reg_no = ?",
        (pat as i64, Utc::now().to_rfc3339(), &reg_no),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(
            &req.id,
            "not_found",
            "student not found",
            Some(json!({ "regNo": reg_no })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_set_ppt_approved(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = match req.params.get("regNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing regNo", None),
    };
    let approved = match req.params.get("approved").and_then(|v| v.as_bool()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid approved", None),
    };
    let locked = req.params.get("locked").and_then(|v| v.as_bool());
    let unlock = req
        .params
        .get("unlock")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let current: Option<i64> = match conn
        .query_row(
            "SELECT ppt_locked FROM students WHERE reg_no = ?",
            [&reg_no],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current_locked) = current else {
        return err(
            &req.id,
            "not_found",
            "student not found",
            Some(json!({ "regNo": reg_no })),
        );
    };
    if current_locked != 0 && !unlock {
        return err(
            &req.id,
            "conflict",
            "ppt approval is locked",
            Some(json!({ "regNo": reg_no })),
        );
    }

    let new_locked = locked.unwrap_or(current_locked != 0 && !unlock);
    if let Err(e) = conn.execute(
        "UPDATE students SET ppt_approved = ?, ppt_locked = ?, updated_at = ? WHERE reg_no = ?",
        (
            approved as i64,
            new_locked as i64,
            Utc::now().to_rfc3339(),
            &reg_no,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.upsert" => Some(handle_students_upsert(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.setPat" => Some(handle_students_set_pat(state, req)),
        "students.setPptApproved" => Some(handle_students_set_ppt_approved(state, req)),
        _ => None,
    }
}
