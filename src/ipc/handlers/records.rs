use crate::calc::{self, Mark, ReviewEntry};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

pub struct StudentRow {
    pub reg_no: String,
    pub name: String,
    pub school: String,
    pub department: String,
    pub pat: bool,
    pub ppt_approved: bool,
    pub ppt_locked: bool,
}

pub fn load_student(
    conn: &Connection,
    reg_no: &str,
) -> Result<Option<StudentRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT reg_no, name, school, department, pat, ppt_approved, ppt_locked
         FROM students WHERE reg_no = ?",
        [reg_no],
        |r| {
            Ok(StudentRow {
                reg_no: r.get(0)?,
                name: r.get(1)?,
                school: r.get(2)?,
                department: r.get(3)?,
                pat: r.get::<_, i64>(4)? != 0,
                ppt_approved: r.get::<_, i64>(5)? != 0,
                ppt_locked: r.get::<_, i64>(6)? != 0,
            })
        },
    )
    .optional()
}

/// All of a student's review entries, marks hydrated into `Mark` variants.
pub fn load_student_entries(
    conn: &Connection,
    reg_no: &str,
) -> Result<BTreeMap<String, ReviewEntry>, rusqlite::Error> {
    let mut entry_stmt = conn.prepare(
        "SELECT id, review_name, comments, attendance_value, attendance_locked, locked
         FROM review_entries WHERE reg_no = ?",
    )?;
    let entry_rows: Vec<(String, String, String, bool, bool, bool)> = entry_stmt
        .query_map([reg_no], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get::<_, i64>(3)? != 0,
                r.get::<_, i64>(4)? != 0,
                r.get::<_, i64>(5)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut mark_stmt = conn.prepare(
        "SELECT component_name, kind, value FROM entry_marks WHERE entry_id = ?",
    )?;

    let mut entries = BTreeMap::new();
    for (entry_id, review_name, comments, attendance_value, attendance_locked, locked) in entry_rows
    {
        let mut marks = BTreeMap::new();
        let rows: Vec<(String, String, Option<f64>)> = mark_stmt
            .query_map([&entry_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (component, kind, value) in rows {
            let mark = match kind.as_str() {
                "pat" => Mark::PatOverride,
                _ => Mark::Numeric(value.unwrap_or(0.0)),
            };
            marks.insert(component, mark);
        }
        entries.insert(
            review_name,
            ReviewEntry {
                marks,
                comments,
                attendance_value,
                attendance_locked,
                locked,
            },
        );
    }
    Ok(entries)
}

struct DeclaredReview {
    display_name: String,
    faculty_type: String,
    deadline_from: Option<String>,
    deadline_to: Option<String>,
    components: Vec<String>,
}

fn load_declared_reviews(
    conn: &Connection,
    school: &str,
    department: &str,
) -> Result<Option<BTreeMap<String, DeclaredReview>>, rusqlite::Error> {
    let schema_id: Option<String> = conn
        .query_row(
            "SELECT id FROM marking_schemas WHERE school = ? AND department = ?",
            (school, department),
            |r| r.get(0),
        )
        .optional()?;
    let Some(schema_id) = schema_id else {
        return Ok(None);
    };

    let mut review_stmt = conn.prepare(
        "SELECT id, review_name, display_name, faculty_type, deadline_from, deadline_to
         FROM schema_reviews WHERE schema_id = ? ORDER BY sort_order",
    )?;
    let rows: Vec<(String, String, String, String, Option<String>, Option<String>)> = review_stmt
        .query_map([&schema_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut comp_stmt = conn.prepare(
        "SELECT name FROM schema_components WHERE review_id = ? ORDER BY sort_order",
    )?;

    let mut reviews = BTreeMap::new();
    for (review_id, review_name, display_name, faculty_type, from, to) in rows {
        let components: Vec<String> = comp_stmt
            .query_map([&review_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        reviews.insert(
            review_name,
            DeclaredReview {
                display_name,
                faculty_type,
                deadline_from: from,
                deadline_to: to,
                components,
            },
        );
    }
    Ok(Some(reviews))
}

/// Per-student override beats the schema-level window.
fn effective_deadline(
    conn: &Connection,
    reg_no: &str,
    review_name: &str,
    schema_from: Option<&str>,
    schema_to: Option<&str>,
) -> Result<serde_json::Value, rusqlite::Error> {
    let override_row: Option<(Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT deadline_from, deadline_to FROM deadline_overrides
             WHERE reg_no = ? AND review_type = ?",
            (reg_no, review_name),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    Ok(match override_row {
        Some((from, to)) => json!({ "from": from, "to": to, "overridden": true }),
        None => json!({ "from": schema_from, "to": schema_to, "overridden": false }),
    })
}

fn entry_payload(
    conn: &Connection,
    reg_no: &str,
    review_name: &str,
    declared: Option<&DeclaredReview>,
    entry: Option<&ReviewEntry>,
) -> Result<serde_json::Value, rusqlite::Error> {
    let deadline = effective_deadline(
        conn,
        reg_no,
        review_name,
        declared.and_then(|d| d.deadline_from.as_deref()),
        declared.and_then(|d| d.deadline_to.as_deref()),
    )?;

    Ok(match entry {
        Some(e) => {
            let marks: serde_json::Map<String, serde_json::Value> = e
                .marks
                .iter()
                .map(|(k, m)| (k.clone(), m.to_wire()))
                .collect();
            json!({
                "reviewName": review_name,
                "displayName": declared.map(|d| d.display_name.clone()).unwrap_or_else(|| review_name.to_string()),
                "facultyType": declared.map(|d| d.faculty_type.clone()),
                "marks": marks,
                "comments": e.comments,
                "attendance": { "value": e.attendance_value, "locked": e.attendance_locked },
                "locked": e.locked,
                "status": calc::derive_status(e).as_str(),
                "totalMarks": calc::compute_total(e),
                "patAdjustedMarks": calc::pat_adjusted_total(e),
                "containsPat": calc::contains_pat(e),
                "deadline": deadline
            })
        }
        None => json!({
            "reviewName": review_name,
            "displayName": declared.map(|d| d.display_name.clone()).unwrap_or_else(|| review_name.to_string()),
            "facultyType": declared.map(|d| d.faculty_type.clone()),
            "status": calc::ReviewStatus::None.as_str(),
            "deadline": deadline
        }),
    })
}

fn handle_records_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = match req.params.get("regNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing regNo", None),
    };

    let student = match load_student(conn, &reg_no) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "regNo": reg_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let entries = match load_student_entries(conn, &reg_no) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // Missing schema degrades to entry-only output on this read path.
    let declared = match load_declared_reviews(conn, &student.school, &student.department) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut review_names: Vec<String> = Vec::new();
    if let Some(declared) = &declared {
        review_names.extend(declared.keys().cloned());
    }
    for name in entries.keys() {
        if !review_names.iter().any(|n| n == name) {
            review_names.push(name.clone());
        }
    }

    let mut reviews = Vec::with_capacity(review_names.len());
    for name in &review_names {
        let payload = match entry_payload(
            conn,
            &reg_no,
            name,
            declared.as_ref().and_then(|d| d.get(name)),
            entries.get(name),
        ) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        reviews.push(payload);
    }

    ok(
        &req.id,
        json!({
            "regNo": student.reg_no,
            "name": student.name,
            "school": student.school,
            "department": student.department,
            "pat": student.pat,
            "pptApproved": { "approved": student.ppt_approved, "locked": student.ppt_locked },
            "schemaFound": declared.is_some(),
            "reviews": reviews
        }),
    )
}

fn handle_records_save_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let reg_no = match req.params.get("regNo").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing regNo", None),
    };
    let review_name = match req.params.get("reviewName").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing reviewName", None),
    };
    let unlock = req
        .params
        .get("unlock")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let student = match load_student(conn, &reg_no) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "regNo": reg_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Write path is strict: no schema, no marks.
    let declared = match load_declared_reviews(conn, &student.school, &student.department) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "no marking schema for school/department",
                Some(json!({ "school": student.school, "department": student.department })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(review_def) = declared.get(&review_name) else {
        return err(
            &req.id,
            "not_found",
            format!("schema does not declare review {}", review_name),
            Some(json!({ "reviewName": review_name })),
        );
    };

    if let Some(faculty_type) = req.params.get("facultyType").and_then(|v| v.as_str()) {
        let faculty_type = faculty_type.trim().to_ascii_lowercase();
        if faculty_type != review_def.faculty_type {
            return err(
                &req.id,
                "conflict",
                format!(
                    "review {} is graded by {} faculty",
                    review_name, review_def.faculty_type
                ),
                Some(json!({ "facultyType": faculty_type })),
            );
        }
    }

    // Unknown component keys are rejected, not silently stored.
    let mut parsed_marks: Vec<(String, Mark)> = Vec::new();
    if let Some(raw_marks) = req.params.get("marks") {
        let Some(obj) = raw_marks.as_object() else {
            return err(&req.id, "bad_params", "marks must be an object", None);
        };
        for (component, value) in obj {
            if !review_def.components.iter().any(|c| c == component) {
                return err(
                    &req.id,
                    "validation_failed",
                    format!(
                        "component {} is not declared by review {}",
                        component, review_name
                    ),
                    Some(json!({
                        "componentName": component,
                        "reviewName": review_name
                    })),
                );
            }
            let Some(mark) = Mark::from_wire(value) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!(
                        "mark for {} must be a non-negative number, -1 or \"PAT\"",
                        component
                    ),
                    Some(json!({ "componentName": component, "value": value })),
                );
            };
            parsed_marks.push((component.clone(), mark));
        }
    }

    let comments = req
        .params
        .get("comments")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let attendance = req.params.get("attendance").and_then(|v| v.as_object());
    let attendance_value = attendance.and_then(|a| a.get("value")).and_then(|v| v.as_bool());
    let attendance_locked = attendance
        .and_then(|a| a.get("locked"))
        .and_then(|v| v.as_bool());
    let locked = req.params.get("locked").and_then(|v| v.as_bool());
    let pat_flag = req.params.get("pat").and_then(|v| v.as_bool());

    let existing: Option<(String, bool)> = match conn
        .query_row(
            "SELECT id, locked FROM review_entries WHERE reg_no = ? AND review_name = ?",
            (&reg_no, &review_name),
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some((_, true)) = existing {
        if !unlock {
            return err(
                &req.id,
                "conflict",
                "review entry is locked; pass unlock to edit",
                Some(json!({ "regNo": reg_no, "reviewName": review_name })),
            );
        }
    }

    let now = Utc::now().to_rfc3339();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    let entry_id = match &existing {
        Some((id, _)) => id.clone(),
        None => {
            // Created lazily on first write.
            let id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO review_entries(id, reg_no, review_name, updated_at)
                 VALUES(?, ?, ?, ?)",
                (&id, &reg_no, &review_name, &now),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "review_entries" })),
                );
            }
            id
        }
    };

    let mut set_parts: Vec<&str> = vec!["updated_at = ?"];
    let mut binds: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(now.clone())];
    if let Some(c) = &comments {
        set_parts.push("comments = ?");
        binds.push(rusqlite::types::Value::Text(c.clone()));
    }
    if let Some(v) = attendance_value {
        set_parts.push("attendance_value = ?");
        binds.push(rusqlite::types::Value::Integer(v as i64));
    }
    if let Some(v) = attendance_locked {
        set_parts.push("attendance_locked = ?");
        binds.push(rusqlite::types::Value::Integer(v as i64));
    }
    if let Some(v) = locked {
        set_parts.push("locked = ?");
        binds.push(rusqlite::types::Value::Integer(v as i64));
    } else if unlock {
        set_parts.push("locked = 0");
    }
    let sql = format!(
        "UPDATE review_entries SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(rusqlite::types::Value::Text(entry_id.clone()));
    if let Err(e) = tx.execute(&sql, rusqlite::params_from_iter(binds)) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    for (component, mark) in &parsed_marks {
        let (kind, value): (&str, Option<f64>) = match mark {
            Mark::Numeric(v) => ("numeric", Some(*v)),
            Mark::PatOverride => ("pat", None),
        };
        if let Err(e) = tx.execute(
            "INSERT INTO entry_marks(entry_id, component_name, kind, value)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(entry_id, component_name) DO UPDATE SET
               kind = excluded.kind,
               value = excluded.value",
            (&entry_id, component, kind, value),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "entry_marks" })),
            );
        }
    }

    if let Some(pat) = pat_flag {
        if let Err(e) = tx.execute(
            "UPDATE students SET pat = ?, updated_at = ? WHERE reg_no = ?",
            (pat as i64, &now, &reg_no),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let conn = state.db.as_ref().expect("db still open");
    let entries = match load_student_entries(conn, &reg_no) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let entry = entries.get(&review_name);
    let payload = match entry_payload(conn, &reg_no, &review_name, Some(review_def), entry) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "entryId": entry_id, "review": payload }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "records.get" => Some(handle_records_get(state, req)),
        "records.saveEntry" => Some(handle_records_save_entry(state, req)),
        _ => None,
    }
}
