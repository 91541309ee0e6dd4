use crate::export::{self, ExportMode, ReviewDef, StudentRecord};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use super::records::load_student_entries;

/// Declared reviews for one owner group, in declaration order, or `None` when
/// the group has no stored schema.
fn load_group_schema(
    conn: &Connection,
    school: &str,
    department: &str,
) -> Result<Option<Vec<ReviewDef>>, rusqlite::Error> {
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
        "SELECT id, review_name, display_name
         FROM schema_reviews WHERE schema_id = ? ORDER BY sort_order",
    )?;
    let rows: Vec<(String, String, String)> = review_stmt
        .query_map([&schema_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut comp_stmt = conn.prepare(
        "SELECT name FROM schema_components WHERE review_id = ? ORDER BY sort_order",
    )?;

    let mut defs = Vec::with_capacity(rows.len());
    for (review_id, review_name, display_name) in rows {
        let components: Vec<String> = comp_stmt
            .query_map([&review_id], |r| r.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        defs.push(ReviewDef {
            review_name,
            display_name,
            components,
        });
    }
    Ok(Some(defs))
}

fn load_working_set(
    conn: &Connection,
    reg_nos: Option<&Vec<String>>,
) -> Result<Vec<StudentRecord>, rusqlite::Error> {
    let base = "SELECT reg_no, name, school, department FROM students";
    let rows: Vec<(String, String, String, String)> = match reg_nos {
        None => {
            let mut stmt = conn.prepare(&format!("{} ORDER BY reg_no", base))?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        Some(ids) => {
            let placeholders = std::iter::repeat("?")
                .take(ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!("{} WHERE reg_no IN ({}) ORDER BY reg_no", base, placeholders);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(ids.iter()), |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    let mut students = Vec::with_capacity(rows.len());
    for (reg_no, name, school, department) in rows {
        let entries = load_student_entries(conn, &reg_no)?;
        students.push(StudentRecord {
            reg_no,
            name,
            school,
            department,
            entries,
        });
    }
    Ok(students)
}

fn handle_export_build(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mode = match req.params.get("mode").and_then(|v| v.as_str()) {
        Some(raw) => match ExportMode::parse(raw) {
            Some(m) => m,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "mode must be flattened or split",
                    Some(json!({ "mode": raw })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing mode", None),
    };

    let reg_nos: Option<Vec<String>> = match req.params.get("regNos") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_array() {
            Some(arr) => {
                let mut out = Vec::with_capacity(arr.len());
                for item in arr {
                    match item.as_str() {
                        Some(s) => out.push(s.trim().to_string()),
                        None => {
                            return err(&req.id, "bad_params", "regNos must be strings", None)
                        }
                    }
                }
                Some(out)
            }
            None => return err(&req.id, "bad_params", "regNos must be an array", None),
        },
    };

    let students = match load_working_set(conn, reg_nos.as_ref()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let groups = export::group_by_owner(students);
    let raw_names: Vec<String> = groups
        .iter()
        .map(|((school, department), _)| format!("{}-{}", school, department))
        .collect();
    let sheet_names = export::uniquify_sheet_names(&raw_names);

    // One group's failure is reported alongside the others' output, never
    // propagated as a whole-batch error.
    let mut sheets: Vec<export::GroupSheet> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();
    for (((school, department), members), sheet_name) in
        groups.into_iter().zip(sheet_names.into_iter())
    {
        let schema = match load_group_schema(conn, &school, &department) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(%school, %department, error = %e, "export group failed");
                errors.push(json!({
                    "school": school,
                    "department": department,
                    "code": "db_query_failed",
                    "message": e.to_string()
                }));
                continue;
            }
        };
        if schema.is_none() {
            tracing::warn!(%school, %department, "no schema for group; using raw record keys");
        }

        let (columns, rows) = export::build_group_rows(mode, schema.as_deref(), &members);
        sheets.push(export::GroupSheet {
            school,
            department,
            sheet_name,
            schema_found: schema.is_some(),
            columns,
            rows,
        });
    }

    let mode_str = match mode {
        ExportMode::Flattened => "flattened",
        ExportMode::Split => "split",
    };
    ok(
        &req.id,
        json!({
            "mode": mode_str,
            "groups": sheets,
            "errors": errors
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "export.build" => Some(handle_export_build(state, req)),
        _ => None,
    }
}
