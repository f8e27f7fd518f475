//! Deterministic fix rule catalog and plan builder.
//!
//! Rules form a closed set: each one has a predicate over diagnosed error
//! lines and an idempotent text transform. Names and modules are checked
//! against fixed tables so nothing is invented from arbitrary log text.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::diagnose::Diagnosis;
use crate::runner::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    EnsureImport,
    EnsureCorsMiddleware,
    EnsureRouterRegistered,
    EnsureDependencies,
}

impl RuleId {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleId::EnsureImport => "ensure_import",
            RuleId::EnsureCorsMiddleware => "ensure_cors_middleware",
            RuleId::EnsureRouterRegistered => "ensure_router_registered",
            RuleId::EnsureDependencies => "ensure_dependencies",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub rule: RuleId,
    /// Fixed target file, when the rule pins one; otherwise the target is
    /// resolved from `files_hint` at apply time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub reason: String,
    pub names: Vec<String>,
    pub files_hint: Vec<String>,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixPlan {
    pub iteration: usize,
    pub scope: Scope,
    pub project_dir: String,
    pub timestamp: String,
    pub key_errors: Vec<String>,
    pub files_hint: Vec<String>,
    pub actions: Vec<Action>,
    pub commands_to_verify: Vec<String>,
}

/// Names importable from the `fastapi` package root.
const FASTAPI_IMPORTABLE: [&str; 6] =
    ["Body", "Depends", "HTTPException", "Path", "Query", "status"];

/// Python module to pip package name, for modules this tool knows about.
const MODULE_TO_PACKAGE: [(&str, &str); 9] = [
    ("fastapi", "fastapi"),
    ("uvicorn", "uvicorn"),
    ("pydantic", "pydantic"),
    ("httpx", "httpx"),
    ("pytest", "pytest"),
    ("requests", "requests"),
    ("sqlalchemy", "SQLAlchemy"),
    ("yaml", "PyYAML"),
    ("dotenv", "python-dotenv"),
];

pub const CORS_ORIGIN_REGEX: &str =
    r"https?://(localhost|127\.0\.0\.1|192\.168\..*|10\..*|172\.(1[6-9]|2\d|3[0-1])\..*)";

fn undefined_fastapi_names(key_errors: &[String]) -> Vec<String> {
    let Ok(re) = Regex::new(r"NameError: name '([A-Za-z_][A-Za-z0-9_]*)' is not defined") else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    for line in key_errors {
        if let Some(caps) = re.captures(line) {
            let name = caps[1].to_string();
            if FASTAPI_IMPORTABLE.contains(&name.as_str()) && !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names.sort();
    names
}

fn missing_packages(key_errors: &[String]) -> Vec<String> {
    let Ok(re) = Regex::new(r"ModuleNotFoundError: No module named '([A-Za-z0-9_\.]+)'") else {
        return Vec::new();
    };
    let mut packages: Vec<String> = Vec::new();
    for line in key_errors {
        if let Some(caps) = re.captures(line) {
            let module = caps[1].split('.').next().unwrap_or("").to_string();
            if let Some((_, package)) =
                MODULE_TO_PACKAGE.iter().find(|(m, _)| *m == module.as_str())
            {
                let package = package.to_string();
                if !packages.contains(&package) {
                    packages.push(package);
                }
            }
        }
    }
    packages.sort();
    packages
}

fn route_segment_from_404(key_errors: &[String]) -> Option<String> {
    let re = Regex::new(r"/([a-z_][a-z0-9_]*)").ok()?;
    for line in key_errors {
        if !line.contains("404") {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Build a plan from a diagnosis. Rules are evaluated in catalog order and
/// each contributes at most one action.
pub fn build_plan(
    root: &Path,
    diagnosis: &Diagnosis,
    scope: Scope,
    iteration: usize,
    commands_to_verify: Vec<String>,
) -> FixPlan {
    let mut actions: Vec<Action> = Vec::new();

    let names = undefined_fastapi_names(&diagnosis.key_errors);
    if !names.is_empty() {
        actions.push(Action {
            rule: RuleId::EnsureImport,
            path: None,
            reason: format!("NameError for fastapi names: {}", names.join(", ")),
            names,
            files_hint: diagnosis.files_hint.clone(),
            applied: false,
        });
    }

    if diagnosis.key_errors.iter().any(|l| l.contains("CORS")) {
        let entry = if !root.join("app/main.py").is_file() && root.join("main.py").is_file() {
            "main.py"
        } else {
            "app/main.py"
        };
        actions.push(Action {
            rule: RuleId::EnsureCorsMiddleware,
            path: Some(entry.to_string()),
            reason: "CORS error reported against the API".to_string(),
            names: Vec::new(),
            files_hint: diagnosis.files_hint.clone(),
            applied: false,
        });
    }

    if let Some(segment) = route_segment_from_404(&diagnosis.key_errors) {
        let module_rel = format!("app/api/routers/{}.py", segment);
        if root.join(&module_rel).is_file() {
            actions.push(Action {
                rule: RuleId::EnsureRouterRegistered,
                path: Some("app/api/router.py".to_string()),
                reason: format!("404 on /{} with an unregistered router module", segment),
                names: vec![segment],
                files_hint: diagnosis.files_hint.clone(),
                applied: false,
            });
        }
    }

    let packages = missing_packages(&diagnosis.key_errors);
    if !packages.is_empty() {
        actions.push(Action {
            rule: RuleId::EnsureDependencies,
            path: Some("requirements.txt".to_string()),
            reason: format!("ModuleNotFoundError for: {}", packages.join(", ")),
            names: packages,
            files_hint: diagnosis.files_hint.clone(),
            applied: false,
        });
    }

    FixPlan {
        iteration,
        scope,
        project_dir: root.display().to_string(),
        timestamp: crate::util::timestamp(),
        key_errors: diagnosis.key_errors.clone(),
        files_hint: diagnosis.files_hint.clone(),
        actions,
        commands_to_verify,
    }
}

pub fn plan_to_markdown(plan: &FixPlan) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Fix plan (iteration {})\n\n", plan.iteration));
    out.push_str(&format!("- project: {}\n", plan.project_dir));
    out.push_str(&format!("- scope: {}\n", plan.scope.as_str()));
    out.push_str(&format!("- timestamp: {}\n\n", plan.timestamp));

    out.push_str("## Detected errors\n\n");
    if plan.key_errors.is_empty() {
        out.push_str("- none\n");
    }
    for line in &plan.key_errors {
        out.push_str(&format!("- `{}`\n", line));
    }
    out.push('\n');

    out.push_str("## Actions\n\n");
    if plan.actions.is_empty() {
        out.push_str("- no applicable rules\n");
    }
    for action in &plan.actions {
        out.push_str(&format!("- **{}**: {}", action.rule.as_str(), action.reason));
        if let Some(path) = &action.path {
            out.push_str(&format!(" (target: `{}`)", path));
        }
        out.push('\n');
    }
    out.push('\n');

    out.push_str("## Verification\n\n");
    if plan.commands_to_verify.is_empty() {
        out.push_str("- re-run the failing profile\n");
    }
    for cmd in &plan.commands_to_verify {
        out.push_str(&format!("- `{}`\n", cmd));
    }
    out
}

/// Index of the first line where imports may be inserted, past a shebang,
/// module docstring, and `from __future__` imports.
fn insertion_index(lines: &[&str]) -> usize {
    let mut idx = 0;
    if lines.first().map(|l| l.starts_with("#!")).unwrap_or(false) {
        idx = 1;
    }
    if let Some(first) = lines.get(idx) {
        let trimmed = first.trim_start();
        for delim in ["\"\"\"", "'''"] {
            if let Some(rest) = trimmed.strip_prefix(delim) {
                if rest.contains(delim) {
                    idx += 1;
                } else {
                    let mut end = idx + 1;
                    while end < lines.len() && !lines[end].contains(delim) {
                        end += 1;
                    }
                    idx = (end + 1).min(lines.len());
                }
                break;
            }
        }
    }
    while lines
        .get(idx)
        .map(|l| l.trim_start().starts_with("from __future__"))
        .unwrap_or(false)
    {
        idx += 1;
    }
    idx
}

/// Merge `names` into the module's `from fastapi import` line, creating one
/// when absent. Fails when the module does not reference any of the names.
pub fn ensure_fastapi_imports(content: &str, names: &[String]) -> Result<String, String> {
    if names.is_empty() {
        return Ok(content.to_string());
    }
    let referenced = names.iter().any(|name| {
        Regex::new(&format!(r"\b{}\b", regex::escape(name)))
            .map(|re| re.is_match(content))
            .unwrap_or(false)
    });
    if !referenced {
        return Err("module does not reference any of the undefined names".to_string());
    }

    let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();
    for line in lines.iter_mut() {
        let trimmed = line.trim_start();
        if let Some(existing) = trimmed.strip_prefix("from fastapi import ") {
            let mut merged: Vec<String> = existing
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            for name in names {
                if !merged.contains(name) {
                    merged.push(name.clone());
                }
            }
            merged.sort();
            *line = format!("from fastapi import {}", merged.join(", "));
            let mut out = lines.join("\n");
            out.push('\n');
            return Ok(out);
        }
    }

    let borrowed: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let idx = insertion_index(&borrowed);
    let mut sorted = names.to_vec();
    sorted.sort();
    lines.insert(idx, format!("from fastapi import {}", sorted.join(", ")));
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// Insert a permissive CORS middleware block after the FastAPI app is
/// created. Checks both the middleware class and the origin regex so a
/// partially configured block still gets completed exactly once.
pub fn ensure_cors_middleware(content: &str) -> Result<String, String> {
    if content.contains("CORSMiddleware") && content.contains("allow_origin_regex") {
        return Ok(content.to_string());
    }

    let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();

    if !content.contains("from fastapi.middleware.cors import CORSMiddleware") {
        let borrowed: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let idx = insertion_index(&borrowed);
        lines.insert(
            idx,
            "from fastapi.middleware.cors import CORSMiddleware".to_string(),
        );
    }

    let app_line = lines
        .iter()
        .position(|l| {
            let t = l.trim_start();
            t.starts_with("app = FastAPI") || t.starts_with("app=FastAPI")
        })
        .ok_or_else(|| "no FastAPI app instantiation found".to_string())?;

    // Skip past a multi-line constructor call.
    let mut insert_at = app_line + 1;
    if lines[app_line].matches('(').count() > lines[app_line].matches(')').count() {
        let mut depth: i32 = 0;
        for (i, line) in lines.iter().enumerate().skip(app_line) {
            depth += line.matches('(').count() as i32;
            depth -= line.matches(')').count() as i32;
            if depth <= 0 {
                insert_at = i + 1;
                break;
            }
        }
    }

    let block = vec![
        "app.add_middleware(".to_string(),
        "    CORSMiddleware,".to_string(),
        "    allow_origins=[\"*\"],".to_string(),
        format!("    allow_origin_regex=r\"{}\",", CORS_ORIGIN_REGEX),
        "    allow_credentials=True,".to_string(),
        "    allow_methods=[\"*\"],".to_string(),
        "    allow_headers=[\"*\"],".to_string(),
        ")".to_string(),
    ];
    let mut insertion: Vec<String> = Vec::with_capacity(block.len() + 1);
    insertion.push(String::new());
    insertion.extend(block);
    for (offset, line) in insertion.into_iter().enumerate() {
        lines.insert(insert_at + offset, line);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

/// Ensure `router.py` imports the router module and includes it.
pub fn ensure_router_registered(content: &str, segment: &str) -> Result<String, String> {
    let import_line = format!("from app.api.routers import {}", segment);
    let include_line = format!("api_router.include_router({}.router)", segment);
    if content.contains(&import_line) && content.contains(&include_line) {
        return Ok(content.to_string());
    }
    if !content.contains("api_router") {
        return Err("router module does not define api_router".to_string());
    }

    let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();
    if !content.contains(&import_line) {
        let borrowed: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let idx = insertion_index(&borrowed);
        lines.insert(idx, import_line);
    }
    if !content.contains(&include_line) {
        lines.push(include_line);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    Ok(out)
}

fn requirement_name(line: &str) -> String {
    let trimmed = line.trim();
    let end = trimmed
        .find(|c: char| ['=', '<', '>', '!', '~', '[', ';', ' '].contains(&c))
        .unwrap_or(trimmed.len());
    trimmed[..end].to_lowercase()
}

/// Append missing packages to requirements content, comparing names
/// case-insensitively and ignoring version pins.
pub fn ensure_requirements(content: &str, packages: &[String]) -> String {
    let mut lines: Vec<String> = content.lines().map(|s| s.to_string()).collect();
    let existing: Vec<String> = lines
        .iter()
        .map(|l| requirement_name(l))
        .filter(|n| !n.is_empty())
        .collect();
    for package in packages {
        if !existing.contains(&package.to_lowercase()) {
            lines.push(package.clone());
        }
    }
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn errs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_undefined_names_filtered_to_table() {
        let names = undefined_fastapi_names(&errs(&[
            "NameError: name 'Query' is not defined",
            "NameError: name 'my_helper' is not defined",
            "NameError: name 'Depends' is not defined",
        ]));
        assert_eq!(names, vec!["Depends", "Query"]);
    }

    #[test]
    fn test_missing_packages_mapped_and_filtered() {
        let packages = missing_packages(&errs(&[
            "ModuleNotFoundError: No module named 'yaml'",
            "ModuleNotFoundError: No module named 'sqlalchemy.orm'",
            "ModuleNotFoundError: No module named 'companyinternal'",
        ]));
        assert_eq!(packages, vec!["PyYAML", "SQLAlchemy"]);
    }

    #[test]
    fn test_route_segment_extraction() {
        let segment = route_segment_from_404(&errs(&[
            "some noise",
            "assert 404 == 200 for GET /defects response",
        ]));
        assert_eq!(segment.as_deref(), Some("defects"));
        assert!(route_segment_from_404(&errs(&["404 without a path"])).is_none());
    }

    #[test]
    fn test_build_plan_router_rule_needs_existing_module() {
        let tmp = tempfile::tempdir().unwrap();
        let diag = Diagnosis {
            key_errors: errs(&["FAILED: 404 on /defects"]),
            files_hint: Vec::new(),
        };
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, Vec::new());
        assert!(plan.actions.is_empty());

        fs::create_dir_all(tmp.path().join("app/api/routers")).unwrap();
        fs::write(tmp.path().join("app/api/routers/defects.py"), "router = 1\n").unwrap();
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, Vec::new());
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].rule, RuleId::EnsureRouterRegistered);
        assert_eq!(plan.actions[0].names, vec!["defects"]);
    }

    #[test]
    fn test_build_plan_orders_rules() {
        let tmp = tempfile::tempdir().unwrap();
        let diag = Diagnosis {
            key_errors: errs(&[
                "ModuleNotFoundError: No module named 'httpx'",
                "NameError: name 'Query' is not defined",
                "Cross-Origin Request Blocked: CORS header missing",
            ]),
            files_hint: vec!["app/main.py".to_string()],
        };
        let plan = build_plan(tmp.path(), &diag, Scope::Backend, 2, vec!["pytest".to_string()]);
        let rules: Vec<RuleId> = plan.actions.iter().map(|a| a.rule).collect();
        assert_eq!(
            rules,
            vec![
                RuleId::EnsureImport,
                RuleId::EnsureCorsMiddleware,
                RuleId::EnsureDependencies
            ]
        );
        assert_eq!(plan.iteration, 2);
    }

    #[test]
    fn test_cors_rule_falls_back_to_root_main() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("main.py"), "app = FastAPI()\n").unwrap();
        let diag = Diagnosis {
            key_errors: errs(&["blocked by CORS policy"]),
            files_hint: Vec::new(),
        };
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, Vec::new());
        assert_eq!(plan.actions[0].path.as_deref(), Some("main.py"));

        fs::create_dir_all(tmp.path().join("app")).unwrap();
        fs::write(tmp.path().join("app/main.py"), "app = FastAPI()\n").unwrap();
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, Vec::new());
        assert_eq!(plan.actions[0].path.as_deref(), Some("app/main.py"));
    }

    #[test]
    fn test_plan_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let diag = Diagnosis {
            key_errors: errs(&["NameError: name 'Query' is not defined"]),
            files_hint: vec!["app/x.py".to_string()],
        };
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, Vec::new());
        let json = serde_json::to_string(&plan).unwrap();
        let back: FixPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.actions.len(), plan.actions.len());
        assert_eq!(back.actions[0].rule, RuleId::EnsureImport);
    }

    #[test]
    fn test_insertion_index_skips_preamble() {
        let lines = vec![
            "#!/usr/bin/env python",
            "\"\"\"Module docstring",
            "spanning lines.",
            "\"\"\"",
            "from __future__ import annotations",
            "import os",
        ];
        assert_eq!(insertion_index(&lines), 5);
        assert_eq!(insertion_index(&["import os"]), 0);
        assert_eq!(insertion_index(&["\"\"\"one-liner\"\"\"", "import os"]), 1);
    }

    #[test]
    fn test_ensure_fastapi_imports_merges_existing_line() {
        let content = "from fastapi import FastAPI\n\napp = FastAPI()\n\ndef get(q=Query(None)):\n    pass\n";
        let names = vec!["Query".to_string()];
        let updated = ensure_fastapi_imports(content, &names).unwrap();
        assert!(updated.contains("from fastapi import FastAPI, Query"));
        // Idempotent on a second pass.
        assert_eq!(ensure_fastapi_imports(&updated, &names).unwrap(), updated);
    }

    #[test]
    fn test_ensure_fastapi_imports_creates_line() {
        let content = "\"\"\"Doc.\"\"\"\nimport os\n\nvalue = Depends\n";
        let updated =
            ensure_fastapi_imports(content, &[String::from("Depends")]).unwrap();
        let lines: Vec<&str> = updated.lines().collect();
        assert_eq!(lines[1], "from fastapi import Depends");
    }

    #[test]
    fn test_ensure_fastapi_imports_requires_reference() {
        let content = "import os\n";
        let err = ensure_fastapi_imports(content, &[String::from("Query")]).unwrap_err();
        assert!(err.contains("does not reference"));
    }

    #[test]
    fn test_ensure_cors_middleware_inserts_once() {
        let content = "from fastapi import FastAPI\n\napp = FastAPI()\n\n@app.get(\"/\")\ndef root():\n    return {}\n";
        let updated = ensure_cors_middleware(content).unwrap();
        assert!(updated.contains("from fastapi.middleware.cors import CORSMiddleware"));
        assert!(updated.contains("allow_origin_regex"));
        let again = ensure_cors_middleware(&updated).unwrap();
        assert_eq!(again, updated);
        // Block sits after app creation, before the route.
        let block_pos = updated.find("app.add_middleware").unwrap();
        let app_pos = updated.find("app = FastAPI").unwrap();
        let route_pos = updated.find("@app.get").unwrap();
        assert!(app_pos < block_pos && block_pos < route_pos);
    }

    #[test]
    fn test_ensure_cors_middleware_multiline_constructor() {
        let content = "from fastapi import FastAPI\n\napp = FastAPI(\n    title=\"x\",\n)\n";
        let updated = ensure_cors_middleware(content).unwrap();
        let close_pos = updated.find(")\n").unwrap();
        let block_pos = updated.find("app.add_middleware").unwrap();
        assert!(block_pos > close_pos);
    }

    #[test]
    fn test_ensure_cors_middleware_needs_app() {
        let err = ensure_cors_middleware("import os\n").unwrap_err();
        assert!(err.contains("FastAPI app"));
    }

    #[test]
    fn test_ensure_router_registered() {
        let content = "from fastapi import APIRouter\n\napi_router = APIRouter()\n";
        let updated = ensure_router_registered(content, "defects").unwrap();
        assert!(updated.contains("from app.api.routers import defects"));
        assert!(updated.contains("api_router.include_router(defects.router)"));
        assert_eq!(ensure_router_registered(&updated, "defects").unwrap(), updated);
    }

    #[test]
    fn test_ensure_requirements_ignores_pins_and_case() {
        let content = "fastapi==0.110.0\npyyaml\n";
        let updated = ensure_requirements(
            content,
            &["fastapi".to_string(), "PyYAML".to_string(), "httpx".to_string()],
        );
        assert_eq!(updated, "fastapi==0.110.0\npyyaml\nhttpx\n");
        assert_eq!(
            ensure_requirements(&updated, &["httpx".to_string()]),
            updated
        );
    }

    #[test]
    fn test_ensure_requirements_from_empty() {
        let updated = ensure_requirements("", &["uvicorn".to_string()]);
        assert_eq!(updated, "uvicorn\n");
    }

    #[test]
    fn test_plan_markdown_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let diag = Diagnosis {
            key_errors: errs(&["NameError: name 'Query' is not defined"]),
            files_hint: Vec::new(),
        };
        let plan = build_plan(tmp.path(), &diag, Scope::All, 1, vec!["pytest -q".to_string()]);
        let md = plan_to_markdown(&plan);
        assert!(md.contains("# Fix plan (iteration 1)"));
        assert!(md.contains("## Detected errors"));
        assert!(md.contains("ensure_import"));
        assert!(md.contains("`pytest -q`"));
    }
}
