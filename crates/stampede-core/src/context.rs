//! Per-virtual-user mutable state threaded through templates, hooks, and
//! step execution. A context is owned by exactly one VU; nothing here is
//! shared across users.

use std::collections::HashMap;

use serde_json::Value;

/// Mutable state carried by a single virtual user.
#[derive(Debug, Clone)]
pub struct VuContext {
    /// 1-based virtual user id.
    pub vu_id: u32,
    /// 0-based iteration within the current scenario loop.
    pub iteration: u64,
    /// Name of the scenario currently executing (empty between scenarios).
    pub scenario_name: String,
    /// Declared + hook-merged variables.
    pub variables: HashMap<String, Value>,
    /// Values captured by step extractions.
    pub extracted_data: HashMap<String, Value>,
    /// Scenario-local data row, refreshed per the scenario's binding mode.
    pub csv_row: Option<HashMap<String, String>>,
    /// Plan-wide data row, loaded once per execution pass.
    pub global_row: Option<HashMap<String, String>>,
}

impl VuContext {
    pub fn new(vu_id: u32) -> Self {
        Self {
            vu_id,
            iteration: 0,
            scenario_name: String::new(),
            variables: HashMap::new(),
            extracted_data: HashMap::new(),
            csv_row: None,
            global_row: None,
        }
    }

    /// Merge a data row into `variables`; cells become string values.
    pub fn merge_row(&mut self, row: &HashMap<String, String>) {
        for (column, cell) in row {
            self.variables
                .insert(column.clone(), Value::String(cell.clone()));
        }
    }

    /// Merge a variable map, overwriting existing entries.
    pub fn merge_variables(&mut self, vars: &HashMap<String, Value>) {
        for (name, value) in vars {
            self.variables.insert(name.clone(), value.clone());
        }
    }

    /// Dotted-path lookup across `variables`, then `extracted_data`, then
    /// context intrinsics (`vu_id`, `iteration`, `scenario_name`).
    ///
    /// `"user.address.city"` navigates into nested objects; a missing segment
    /// yields `None`. Any segment, including the first, may index into an
    /// array: `"items[1]"`, `"user.tags[0]"`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;

        // Split the head's bare name from its index suffix before resolving.
        let bracket = head.find('[');
        let head_key = match bracket {
            Some(pos) => &head[..pos],
            None => head,
        };

        let root = self
            .variables
            .get(head_key)
            .or_else(|| self.extracted_data.get(head_key))
            .cloned()
            .or_else(|| self.intrinsic(head_key));

        let mut current = root?;
        if let Some(pos) = bracket {
            current = apply_indexes(&current, &head[pos..])?;
        }
        for segment in segments {
            current = navigate(&current, segment)?;
        }
        Some(current)
    }

    /// Render a looked-up value as a plain string (strings unquoted, other
    /// types in their JSON form).
    pub fn lookup_string(&self, path: &str) -> Option<String> {
        self.lookup(path).map(|v| value_to_string(&v))
    }

    fn intrinsic(&self, name: &str) -> Option<Value> {
        match name {
            "vu_id" => Some(Value::from(self.vu_id)),
            "iteration" => Some(Value::from(self.iteration)),
            "scenario_name" => Some(Value::String(self.scenario_name.clone())),
            _ => None,
        }
    }
}

fn navigate(value: &Value, segment: &str) -> Option<Value> {
    // Array index notation: "items[0]"
    if let Some(bracket_pos) = segment.find('[') {
        let key = &segment[..bracket_pos];
        let base = if key.is_empty() {
            value.clone()
        } else {
            value.get(key)?.clone()
        };
        return apply_indexes(&base, &segment[bracket_pos..]);
    }
    value.get(segment).cloned()
}

/// Apply one or more `[idx]` groups to a value: `"[1]"`, `"[0][2]"`.
fn apply_indexes(value: &Value, suffix: &str) -> Option<Value> {
    let mut current = value.clone();
    let mut rest = suffix;
    while let Some(open) = rest.find('[') {
        let close = rest[open..].find(']')? + open;
        let idx: usize = rest[open + 1..close].parse().ok()?;
        current = current.get(idx)?.clone();
        rest = &rest[close + 1..];
    }
    Some(current)
}

/// Convert a JSON value to a plain string for interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_ctx() -> VuContext {
        let mut ctx = VuContext::new(7);
        ctx.iteration = 3;
        ctx.scenario_name = "checkout".to_string();
        ctx.variables
            .insert("host".to_string(), json!("example.com"));
        ctx.variables.insert(
            "user".to_string(),
            json!({"name": "alice", "address": {"city": "Berlin"}}),
        );
        ctx.extracted_data
            .insert("token".to_string(), json!("abc-123"));
        ctx
    }

    #[test]
    fn lookup_simple_variable() {
        let ctx = make_ctx();
        assert_eq!(ctx.lookup("host"), Some(json!("example.com")));
    }

    #[test]
    fn lookup_nested_path() {
        let ctx = make_ctx();
        assert_eq!(ctx.lookup("user.address.city"), Some(json!("Berlin")));
    }

    #[test]
    fn lookup_array_index() {
        let mut ctx = make_ctx();
        ctx.variables
            .insert("items".to_string(), json!(["a", "b", "c"]));
        assert_eq!(ctx.lookup("items[1]"), Some(json!("b")));
    }

    #[test]
    fn lookup_head_index_then_nested_path() {
        let mut ctx = make_ctx();
        ctx.variables.insert(
            "users".to_string(),
            json!([{"name": "alice"}, {"name": "bob"}]),
        );
        assert_eq!(ctx.lookup("users[1].name"), Some(json!("bob")));
    }

    #[test]
    fn lookup_chained_indexes() {
        let mut ctx = make_ctx();
        ctx.variables
            .insert("matrix".to_string(), json!([["a", "b"], ["c", "d"]]));
        assert_eq!(ctx.lookup("matrix[1][0]"), Some(json!("c")));
        assert!(ctx.lookup("matrix[9][0]").is_none());
    }

    #[test]
    fn lookup_falls_through_to_extracted_data() {
        let ctx = make_ctx();
        assert_eq!(ctx.lookup("token"), Some(json!("abc-123")));
    }

    #[test]
    fn variables_shadow_extracted_data() {
        let mut ctx = make_ctx();
        ctx.variables.insert("token".to_string(), json!("shadow"));
        assert_eq!(ctx.lookup("token"), Some(json!("shadow")));
    }

    #[test]
    fn lookup_intrinsics() {
        let ctx = make_ctx();
        assert_eq!(ctx.lookup("vu_id"), Some(json!(7)));
        assert_eq!(ctx.lookup("iteration"), Some(json!(3)));
        assert_eq!(ctx.lookup("scenario_name"), Some(json!("checkout")));
    }

    #[test]
    fn lookup_missing_returns_none() {
        let ctx = make_ctx();
        assert!(ctx.lookup("nope").is_none());
        assert!(ctx.lookup("user.missing.deep").is_none());
    }

    #[test]
    fn lookup_string_renders_without_quotes() {
        let ctx = make_ctx();
        assert_eq!(ctx.lookup_string("host").as_deref(), Some("example.com"));
        assert_eq!(ctx.lookup_string("vu_id").as_deref(), Some("7"));
    }

    #[test]
    fn merge_row_inserts_string_values() {
        let mut ctx = make_ctx();
        let mut row = HashMap::new();
        row.insert("email".to_string(), "a@b.c".to_string());
        ctx.merge_row(&row);
        assert_eq!(ctx.lookup("email"), Some(json!("a@b.c")));
    }

    #[test]
    fn merge_variables_overwrites() {
        let mut ctx = make_ctx();
        let mut vars = HashMap::new();
        vars.insert("host".to_string(), json!("other.org"));
        ctx.merge_variables(&vars);
        assert_eq!(ctx.lookup("host"), Some(json!("other.org")));
    }

    #[test]
    fn value_to_string_forms() {
        assert_eq!(value_to_string(&json!("s")), "s");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!({"a":1})), "{\"a\":1}");
    }
}
