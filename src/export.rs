use crate::calc::{self, Mark, ReviewEntry, ReviewStatus};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Hard limit imposed by spreadsheet sheet names.
pub const SHEET_NAME_MAX: usize = 31;

const WIDTH_MIN: usize = 10;
const WIDTH_MAX: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Flattened,
    Split,
}

impl ExportMode {
    pub fn parse(s: &str) -> Option<ExportMode> {
        match s.to_ascii_lowercase().as_str() {
            "flattened" => Some(ExportMode::Flattened),
            "split" => Some(ExportMode::Split),
            _ => None,
        }
    }
}

/// One review as the owning schema declares it, in declaration order.
#[derive(Debug, Clone)]
pub struct ReviewDef {
    pub review_name: String,
    pub display_name: String,
    pub components: Vec<String>,
}

/// A student's exportable state within one owner group.
#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub reg_no: String,
    pub name: String,
    pub school: String,
    pub department: String,
    pub entries: BTreeMap<String, ReviewEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub key: String,
    pub title: String,
    pub width: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSheet {
    pub school: String,
    pub department: String,
    pub sheet_name: String,
    pub schema_found: bool,
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

/// Partition the working set by (school, department), preserving a stable
/// order of groups and of students within each group.
pub fn group_by_owner(students: Vec<StudentRecord>) -> Vec<((String, String), Vec<StudentRecord>)> {
    let mut groups: BTreeMap<(String, String), Vec<StudentRecord>> = BTreeMap::new();
    for s in students {
        groups
            .entry((s.school.clone(), s.department.clone()))
            .or_default()
            .push(s);
    }
    groups.into_iter().collect()
}

/// Clamp each name to the sheet-name limit while keeping the set distinct:
/// on collision a " (n)" counter is appended before truncation so the suffix
/// always survives.
pub fn uniquify_sheet_names(raw_names: &[String]) -> Vec<String> {
    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut out = Vec::with_capacity(raw_names.len());
    for raw in raw_names {
        let base = truncate_chars(raw, SHEET_NAME_MAX);
        let mut candidate = base.clone();
        let mut counter = 1usize;
        while taken.contains(&candidate) {
            counter += 1;
            let suffix = format!(" ({})", counter);
            let keep = SHEET_NAME_MAX.saturating_sub(suffix.chars().count());
            candidate = format!("{}{}", truncate_chars(raw, keep), suffix);
        }
        taken.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn display_len(v: &serde_json::Value) -> usize {
    match v {
        serde_json::Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

fn summary_titles(prefix: &str) -> [(String, String); 6] {
    [
        (
            format!("{}_Total_Marks", prefix),
            format!("{} Total Marks", prefix),
        ),
        (
            format!("{}_PAT_Adjusted_Marks", prefix),
            format!("{} PAT Adjusted Marks", prefix),
        ),
        (
            format!("{}_Contains_PAT", prefix),
            format!("{} Contains PAT", prefix),
        ),
        (format!("{}_Status", prefix), format!("{} Status", prefix)),
        (
            format!("{}_Attendance", prefix),
            format!("{} Attendance", prefix),
        ),
        (
            format!("{}_Comments", prefix),
            format!("{} Comments", prefix),
        ),
    ]
}

fn summary_cells(entry: Option<&ReviewEntry>) -> [serde_json::Value; 6] {
    match entry {
        Some(e) => [
            json!(calc::compute_total(e)),
            json!(calc::pat_adjusted_total(e)),
            json!(if calc::contains_pat(e) { "Yes" } else { "No" }),
            json!(calc::derive_status(e).as_str()),
            json!(if e.attendance_value {
                "Present"
            } else {
                "Absent"
            }),
            json!(e.comments.clone()),
        ],
        None => [
            json!("N/A"),
            json!("N/A"),
            json!("No"),
            json!(ReviewStatus::None.as_str()),
            json!("N/A"),
            json!(""),
        ],
    }
}

fn mark_cell(entry: Option<&ReviewEntry>, component: &str) -> serde_json::Value {
    match entry.and_then(|e| e.marks.get(component)) {
        None => json!("N/A"),
        Some(Mark::PatOverride) => json!("PAT"),
        Some(Mark::Numeric(v)) => json!(v),
    }
}

/// Review keys for flattened mode: the union of what the group's student
/// records actually contain, schema declaration order first, leftovers by
/// name. Split mode instead iterates the schema's declared reviews; the two
/// traversals differ on purpose when records and schema drift apart.
fn flattened_review_keys(schema: Option<&[ReviewDef]>, students: &[StudentRecord]) -> Vec<String> {
    let mut present: BTreeSet<&str> = BTreeSet::new();
    for s in students {
        for key in s.entries.keys() {
            present.insert(key.as_str());
        }
    }

    let mut ordered: Vec<String> = Vec::new();
    if let Some(defs) = schema {
        for def in defs {
            if present.remove(def.review_name.as_str()) {
                ordered.push(def.review_name.clone());
            }
        }
    }
    ordered.extend(present.into_iter().map(|s| s.to_string()));
    ordered
}

/// Fallback definitions when the owner group has no stored schema: raw review
/// keys with the union of each review's mark component keys.
fn fallback_defs(students: &[StudentRecord]) -> Vec<ReviewDef> {
    let mut components: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for s in students {
        for (review, entry) in &s.entries {
            let set = components.entry(review.clone()).or_default();
            for name in entry.marks.keys() {
                set.insert(name.clone());
            }
        }
    }
    components
        .into_iter()
        .map(|(review_name, comps)| ReviewDef {
            display_name: review_name.clone(),
            review_name,
            components: comps.into_iter().collect(),
        })
        .collect()
}

fn display_prefix<'a>(schema: Option<&'a [ReviewDef]>, review_name: &'a str) -> &'a str {
    schema
        .and_then(|defs| defs.iter().find(|d| d.review_name == review_name))
        .map(|d| d.display_name.as_str())
        .unwrap_or(review_name)
}

/// Build the column set and rows for one owner group. `schema` is `None` when
/// the group has no stored schema; the rows are then shaped from the raw keys
/// on the student records.
pub fn build_group_rows(
    mode: ExportMode,
    schema: Option<&[ReviewDef]>,
    students: &[StudentRecord],
) -> (Vec<ColumnSpec>, Vec<serde_json::Map<String, serde_json::Value>>) {
    let mut columns: Vec<(String, String)> = vec![
        ("Registration_No".to_string(), "Registration No".to_string()),
        ("Student_Name".to_string(), "Student Name".to_string()),
    ];

    let fallback;
    let effective_defs: Option<&[ReviewDef]> = match schema {
        Some(defs) => Some(defs),
        None => {
            fallback = fallback_defs(students);
            Some(fallback.as_slice())
        }
    };

    enum Block {
        Marks { review: String, component: String },
        Summary { review: String, cell: usize },
    }
    let mut cell_plan: Vec<Block> = Vec::new();

    match mode {
        ExportMode::Flattened => {
            for review in flattened_review_keys(schema, students) {
                let prefix = display_prefix(schema, &review).to_string();
                for (i, (key, title)) in summary_titles(&prefix).into_iter().enumerate() {
                    columns.push((key, title));
                    cell_plan.push(Block::Summary {
                        review: review.clone(),
                        cell: i,
                    });
                }
            }
        }
        ExportMode::Split => {
            for def in effective_defs.unwrap_or(&[]) {
                let prefix = def.display_name.as_str();
                for component in &def.components {
                    columns.push((
                        format!("{}_{}", prefix, component),
                        format!("{} {}", prefix, component),
                    ));
                    cell_plan.push(Block::Marks {
                        review: def.review_name.clone(),
                        component: component.clone(),
                    });
                }
                for (i, (key, title)) in summary_titles(prefix).into_iter().enumerate() {
                    columns.push((key, title));
                    cell_plan.push(Block::Summary {
                        review: def.review_name.clone(),
                        cell: i,
                    });
                }
            }
        }
    }

    let mut rows: Vec<serde_json::Map<String, serde_json::Value>> = Vec::new();
    for s in students {
        let mut row = serde_json::Map::new();
        row.insert("Registration_No".to_string(), json!(s.reg_no));
        row.insert("Student_Name".to_string(), json!(s.name));

        let mut summary_cache: BTreeMap<&str, [serde_json::Value; 6]> = BTreeMap::new();
        for (block, (key, _)) in cell_plan.iter().zip(columns.iter().skip(2)) {
            let value = match block {
                Block::Marks { review, component } => {
                    mark_cell(s.entries.get(review.as_str()), component)
                }
                Block::Summary { review, cell } => summary_cache
                    .entry(review.as_str())
                    .or_insert_with(|| summary_cells(s.entries.get(review.as_str())))[*cell]
                    .clone(),
            };
            row.insert(key.clone(), value);
        }
        rows.push(row);
    }

    let specs = columns
        .into_iter()
        .map(|(key, title)| {
            let mut width = title.chars().count();
            for row in &rows {
                if let Some(v) = row.get(&key) {
                    width = width.max(display_len(v));
                }
            }
            ColumnSpec {
                key,
                title,
                width: width.clamp(WIDTH_MIN, WIDTH_MAX),
            }
        })
        .collect();

    (specs, rows)
}
