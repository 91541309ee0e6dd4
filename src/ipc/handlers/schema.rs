use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

pub const REQUIRED_TOTAL_WEIGHT: i64 = 100;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct ComponentInput {
    name: String,
    weight: i64,
}

struct ReviewInput {
    review_name: String,
    display_name: String,
    faculty_type: String,
    deadline_from: Option<String>,
    deadline_to: Option<String>,
    components: Vec<ComponentInput>,
}

fn bad_params(message: impl Into<String>, details: Option<serde_json::Value>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details,
    }
}

fn validation_failed(message: impl Into<String>, details: Option<serde_json::Value>) -> HandlerErr {
    HandlerErr {
        code: "validation_failed",
        message: message.into(),
        details,
    }
}

fn parse_reviews(raw: &serde_json::Value) -> Result<Vec<ReviewInput>, HandlerErr> {
    let Some(arr) = raw.as_array() else {
        return Err(bad_params("reviews must be an array", None));
    };

    let mut reviews = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return Err(bad_params(
                format!("reviews[{}] must be an object", i),
                None,
            ));
        };

        let review_name = obj
            .get("reviewName")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let display_name = obj
            .get("displayName")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| review_name.clone());
        let faculty_type = obj
            .get("facultyType")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let (deadline_from, deadline_to) = match obj.get("deadline") {
            None => (None, None),
            Some(v) if v.is_null() => (None, None),
            Some(v) => {
                let Some(d) = v.as_object() else {
                    return Err(bad_params(
                        format!("reviews[{}].deadline must be an object", i),
                        None,
                    ));
                };
                (
                    d.get("from").and_then(|v| v.as_str()).map(str::to_string),
                    d.get("to").and_then(|v| v.as_str()).map(str::to_string),
                )
            }
        };

        let mut components = Vec::new();
        if let Some(comps) = obj.get("components").and_then(|v| v.as_array()) {
            for (j, comp) in comps.iter().enumerate() {
                let Some(cobj) = comp.as_object() else {
                    return Err(bad_params(
                        format!("reviews[{}].components[{}] must be an object", i, j),
                        None,
                    ));
                };
                let name = cobj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                let weight = match cobj.get("weight") {
                    Some(v) if v.is_i64() || v.is_u64() => v.as_i64().unwrap_or(0),
                    Some(v) if v.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false) => {
                        v.as_f64().map(|f| f as i64).unwrap_or(0)
                    }
                    _ => {
                        return Err(bad_params(
                            format!("reviews[{}].components[{}].weight must be an integer", i, j),
                            None,
                        ))
                    }
                };
                components.push(ComponentInput { name, weight });
            }
        }

        reviews.push(ReviewInput {
            review_name,
            display_name,
            faculty_type,
            deadline_from,
            deadline_to,
            components,
        });
    }
    Ok(reviews)
}

/// All invariants are checked before any row is touched; a save either
/// replaces the whole document or leaves the store as it was.
fn validate_reviews(reviews: &[ReviewInput]) -> Result<(), HandlerErr> {
    if reviews.is_empty() {
        return Err(validation_failed("schema must declare at least one review", None));
    }

    let mut seen_reviews: HashSet<String> = HashSet::new();
    let mut total_weight: i64 = 0;

    for review in reviews {
        if review.review_name.is_empty() {
            return Err(validation_failed("review name must not be empty", None));
        }
        if !seen_reviews.insert(review.review_name.clone()) {
            return Err(validation_failed(
                format!("duplicate review name: {}", review.review_name),
                Some(json!({ "reviewName": review.review_name })),
            ));
        }
        if review.faculty_type != "guide" && review.faculty_type != "panel" {
            return Err(validation_failed(
                format!(
                    "review {} facultyType must be guide or panel",
                    review.review_name
                ),
                Some(json!({ "facultyType": review.faculty_type })),
            ));
        }
        if review.components.is_empty() {
            return Err(validation_failed(
                format!("review {} must have at least one component", review.review_name),
                Some(json!({ "reviewName": review.review_name })),
            ));
        }

        let mut seen_components: HashSet<String> = HashSet::new();
        for component in &review.components {
            if component.name.is_empty() {
                return Err(validation_failed(
                    format!("review {} has a component with an empty name", review.review_name),
                    Some(json!({ "reviewName": review.review_name })),
                ));
            }
            if !seen_components.insert(component.name.clone()) {
                return Err(validation_failed(
                    format!(
                        "duplicate component name {} in review {}",
                        component.name, review.review_name
                    ),
                    Some(json!({
                        "reviewName": review.review_name,
                        "componentName": component.name
                    })),
                ));
            }
            if component.weight < 0 || component.weight > 100 {
                return Err(validation_failed(
                    format!(
                        "component {} weight must be between 0 and 100",
                        component.name
                    ),
                    Some(json!({
                        "componentName": component.name,
                        "weight": component.weight
                    })),
                ));
            }
            total_weight += component.weight;
        }
    }

    if total_weight != REQUIRED_TOTAL_WEIGHT {
        return Err(validation_failed(
            format!(
                "total weight {}, required {}",
                total_weight, REQUIRED_TOTAL_WEIGHT
            ),
            Some(json!({
                "totalWeight": total_weight,
                "requiredWeight": REQUIRED_TOTAL_WEIGHT
            })),
        ));
    }

    Ok(())
}

fn delete_schema_rows(tx: &Transaction<'_>, schema_id: &str) -> Result<(), rusqlite::Error> {
    tx.execute(
        "DELETE FROM schema_components WHERE review_id IN
           (SELECT id FROM schema_reviews WHERE schema_id = ?)",
        [schema_id],
    )?;
    tx.execute("DELETE FROM schema_reviews WHERE schema_id = ?", [schema_id])?;
    tx.execute("DELETE FROM marking_schemas WHERE id = ?", [schema_id])?;
    Ok(())
}

fn handle_schema_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_mut() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school = match req.params.get("school").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing school", None),
    };
    let department = match req.params.get("department").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing department", None),
    };
    let requires_contribution = req
        .params
        .get("requiresContribution")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let Some(raw_reviews) = req.params.get("reviews") else {
        return err(&req.id, "bad_params", "missing reviews[]", None);
    };

    let reviews = match parse_reviews(raw_reviews) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = validate_reviews(&reviews) {
        return e.response(&req.id);
    }

    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };

    let existing_id: Option<String> = match tx
        .query_row(
            "SELECT id FROM marking_schemas WHERE school = ? AND department = ?",
            (&school, &department),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let replaced = existing_id.is_some();
    if let Some(old_id) = &existing_id {
        if let Err(e) = delete_schema_rows(&tx, old_id) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    let schema_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO marking_schemas(id, school, department, requires_contribution, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &schema_id,
            &school,
            &department,
            requires_contribution as i64,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "marking_schemas" })),
        );
    }

    for (i, review) in reviews.iter().enumerate() {
        let review_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO schema_reviews(
                id, schema_id, review_name, display_name, faculty_type,
                deadline_from, deadline_to, sort_order)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &review_id,
                &schema_id,
                &review.review_name,
                &review.display_name,
                &review.faculty_type,
                &review.deadline_from,
                &review.deadline_to,
                i as i64,
            ),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "schema_reviews" })),
            );
        }

        for (j, component) in review.components.iter().enumerate() {
            if let Err(e) = tx.execute(
                "INSERT INTO schema_components(id, review_id, name, weight, sort_order)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &review_id,
                    &component.name,
                    component.weight,
                    j as i64,
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "schema_components" })),
                );
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "schemaId": schema_id, "replaced": replaced }),
    )
}

/// The stored document for (school, department), fully hydrated, or `None`.
pub fn load_schema_document(
    conn: &Connection,
    school: &str,
    department: &str,
) -> Result<Option<serde_json::Value>, rusqlite::Error> {
    let header: Option<(String, bool, Option<String>)> = conn
        .query_row(
            "SELECT id, requires_contribution, updated_at
             FROM marking_schemas WHERE school = ? AND department = ?",
            (school, department),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)? != 0,
                    r.get(2)?,
                ))
            },
        )
        .optional()?;
    let Some((schema_id, requires_contribution, updated_at)) = header else {
        return Ok(None);
    };

    let mut review_stmt = conn.prepare(
        "SELECT id, review_name, display_name, faculty_type, deadline_from, deadline_to
         FROM schema_reviews WHERE schema_id = ? ORDER BY sort_order",
    )?;
    let review_rows: Vec<(String, String, String, String, Option<String>, Option<String>)> =
        review_stmt
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
        "SELECT name, weight FROM schema_components WHERE review_id = ? ORDER BY sort_order",
    )?;

    let mut reviews = Vec::with_capacity(review_rows.len());
    for (review_id, review_name, display_name, faculty_type, from, to) in review_rows {
        let components: Vec<serde_json::Value> = comp_stmt
            .query_map([&review_id], |r| {
                let name: String = r.get(0)?;
                let weight: i64 = r.get(1)?;
                Ok(json!({ "name": name, "weight": weight }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        reviews.push(json!({
            "reviewName": review_name,
            "displayName": display_name,
            "facultyType": faculty_type,
            "deadline": { "from": from, "to": to },
            "components": components
        }));
    }

    Ok(Some(json!({
        "schemaId": schema_id,
        "school": school,
        "department": department,
        "requiresContribution": requires_contribution,
        "updatedAt": updated_at,
        "reviews": reviews
    })))
}

fn handle_schema_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let school = match req.params.get("school").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing school", None),
    };
    let department = match req.params.get("department").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing department", None),
    };

    match load_schema_document(conn, &school, &department) {
        Ok(Some(doc)) => ok(&req.id, doc),
        Ok(None) => err(
            &req.id,
            "not_found",
            "no marking schema for school/department",
            Some(json!({ "school": school, "department": department })),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schema.save" => Some(handle_schema_save(state, req)),
        "schema.get" => Some(handle_schema_get(state, req)),
        _ => None,
    }
}
