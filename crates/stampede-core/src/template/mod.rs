//! Template engine: resolves `{{...}}` placeholders against a per-VU context.
//!
//! Placeholder classes are resolved in a fixed order so earlier expansions
//! can produce tokens for later passes: environment variables, csv rows,
//! file templates, faker paths, helpers, then plain variables and the
//! `__VU`/`__ITER` specials. Unknown tokens are left literal with a warning;
//! only malformed helper syntax is an error.

pub mod faker;

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::context::{value_to_string, VuContext};
use crate::data::{DataRegistry, RowOutcome};
use crate::error::EngineError;
use crate::plan::model::{DataBinding, DataMode, FakerConfig};
use faker::Faker;

/// Rows pinned for the duration of one step render, so `unique` and `random`
/// placeholders referring to the same file resolve consistently within it.
pub type RowCache = HashMap<String, HashMap<String, String>>;

pub struct TemplateEngine {
    data: Arc<DataRegistry>,
    faker: Faker,
    env_re: Regex,
    csv_re: Regex,
    file_re: Regex,
    faker_re: Regex,
    helper_re: Regex,
    unterminated_helper_re: Regex,
    var_re: Regex,
}

impl TemplateEngine {
    pub fn new(config: FakerConfig, data: Arc<DataRegistry>) -> Self {
        Self {
            data,
            faker: Faker::new(config),
            env_re: Regex::new(r"\{\{env\.([A-Za-z0-9_]+)\}\}").expect("env regex"),
            csv_re: Regex::new(r"\{\{csv:([^}|]+?)(?:\|([^}]*))?\}\}").expect("csv regex"),
            file_re: Regex::new(r"\{\{template:([^}|]+?)(?:\|([^}]*))?\}\}")
                .expect("template regex"),
            faker_re: Regex::new(r"\{\{faker\.([A-Za-z0-9_.]+)\}\}").expect("faker regex"),
            helper_re: Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\(([^)}]*)\)\}\}")
                .expect("helper regex"),
            unterminated_helper_re: Regex::new(r"\{\{[A-Za-z_][A-Za-z0-9_]*\([^)}]*\}\}")
                .expect("unterminated helper regex"),
            var_re: Regex::new(
                r"\{\{\s*(__VU|__ITER|[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+|\[[0-9]+\])*)\s*\}\}",
            )
            .expect("var regex"),
        }
    }

    /// Render one string with a private row cache.
    pub fn render(&self, input: &str, ctx: &VuContext) -> Result<String, EngineError> {
        let mut cache = RowCache::new();
        self.render_with_cache(input, ctx, &mut cache)
    }

    /// Render one string, pinning `unique`/`random` csv rows in `cache` so
    /// multiple fields of the same step see the same row.
    pub fn render_with_cache(
        &self,
        input: &str,
        ctx: &VuContext,
        cache: &mut RowCache,
    ) -> Result<String, EngineError> {
        if !input.contains("{{") {
            return Ok(input.to_string());
        }
        let s = self.pass_env(input);
        let s = self.pass_csv(&s, ctx, cache);
        let s = self.pass_template_file(&s, ctx);
        let s = self.pass_faker(&s, ctx);
        let s = self.pass_helpers(&s)?;
        Ok(self.pass_variables(&s, ctx))
    }

    /// Like [`render_with_cache`], but a template error is logged and the
    /// input returned unchanged; rendering never aborts a step by itself.
    pub fn render_lenient(&self, input: &str, ctx: &VuContext, cache: &mut RowCache) -> String {
        match self.render_with_cache(input, ctx, cache) {
            Ok(rendered) => rendered,
            Err(e) => {
                tracing::warn!(vu_id = ctx.vu_id, error = %e, "template left unrendered");
                input.to_string()
            }
        }
    }

    /// Deep-walk a JSON value, rendering every string leaf with a shared row
    /// cache. Used to render whole step payloads.
    pub fn render_json(&self, value: &Value, ctx: &VuContext) -> Value {
        let mut cache = RowCache::new();
        self.render_json_cached(value, ctx, &mut cache)
    }

    fn render_json_cached(&self, value: &Value, ctx: &VuContext, cache: &mut RowCache) -> Value {
        match value {
            Value::String(s) => Value::String(self.render_lenient(s, ctx, cache)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_json_cached(v, ctx, cache))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_json_cached(v, ctx, cache)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Pass 1: environment
    // -----------------------------------------------------------------------

    fn pass_env(&self, input: &str) -> String {
        self.env_re
            .replace_all(input, |caps: &Captures| {
                std::env::var(&caps[1]).unwrap_or_default()
            })
            .into_owned()
    }

    // -----------------------------------------------------------------------
    // Pass 2: csv rows
    // -----------------------------------------------------------------------

    fn pass_csv(&self, input: &str, ctx: &VuContext, cache: &mut RowCache) -> String {
        // replace_all cannot thread `&mut cache` through its closure, so
        // matches are rewritten manually.
        let mut result = String::with_capacity(input.len());
        let mut last = 0;
        for caps in self.csv_re.captures_iter(input) {
            let whole = caps.get(0).expect("match");
            result.push_str(&input[last..whole.start()]);
            last = whole.end();

            let file = caps[1].trim().to_string();
            let opts = CsvOptions::parse(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
            match self.resolve_csv(&file, &opts, ctx, cache) {
                Some(text) => result.push_str(&text),
                None => result.push_str(whole.as_str()),
            }
        }
        result.push_str(&input[last..]);
        result
    }

    fn resolve_csv(
        &self,
        file: &str,
        opts: &CsvOptions,
        ctx: &VuContext,
        cache: &mut RowCache,
    ) -> Option<String> {
        let binding = DataBinding {
            file: PathBuf::from(file),
            mode: opts.mode,
            delimiter: opts.delimiter,
            cycle_on_exhaustion: true,
            variables: HashMap::new(),
        };
        let provider = match self.data.get_or_load(&binding) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(file, error = %e, "csv placeholder left literal");
                return None;
            }
        };

        let row: HashMap<String, String> = if let Some((col, val)) = &opts.filter {
            match provider.filtered_row(col, val, opts.randomize) {
                Some(row) => row,
                None => {
                    tracing::warn!(file, filter = %format!("{col}={val}"), "no row matches filter");
                    return None;
                }
            }
        } else {
            let mode = if opts.randomize { DataMode::Random } else { opts.mode };
            match mode {
                // `next` advances per placeholder occurrence.
                DataMode::Next => match provider.next_row(ctx.vu_id) {
                    RowOutcome::Row(row) => row,
                    RowOutcome::Exhausted => {
                        tracing::warn!(file, "csv placeholder exhausted");
                        return None;
                    }
                },
                // `unique`/`random` stay stable within one step render.
                DataMode::Unique | DataMode::Random => {
                    if let Some(cached) = cache.get(file) {
                        cached.clone()
                    } else {
                        match provider.fetch(mode, ctx.vu_id) {
                            RowOutcome::Row(row) => {
                                cache.insert(file.to_string(), row.clone());
                                row
                            }
                            RowOutcome::Exhausted => {
                                tracing::warn!(file, "csv placeholder exhausted");
                                return None;
                            }
                        }
                    }
                }
            }
        };

        match &opts.column {
            Some(column) => match row.get(column) {
                Some(cell) => Some(cell.clone()),
                None => {
                    tracing::warn!(file, %column, "csv column not found");
                    None
                }
            },
            // No column selects the whole row, rendered as single-line JSON.
            None => serde_json::to_string(&row).ok(),
        }
    }

    // -----------------------------------------------------------------------
    // Pass 3: file templates
    // -----------------------------------------------------------------------

    fn pass_template_file(&self, input: &str, ctx: &VuContext) -> String {
        self.file_re
            .replace_all(input, |caps: &Captures| {
                let path = caps[1].trim();
                let inline = parse_kv_pairs(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
                match self.resolve_template_file(path, &inline, ctx) {
                    Some(text) => text,
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn resolve_template_file(
        &self,
        path: &str,
        inline: &HashMap<String, String>,
        ctx: &VuContext,
    ) -> Option<String> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path, error = %e, "template file left literal");
                return None;
            }
        };

        // Merged lookup: inline pairs win over extracted data over variables.
        let mut merged: HashMap<String, String> = HashMap::new();
        for (name, value) in &ctx.variables {
            merged.insert(name.clone(), value_to_string(value));
        }
        for (name, value) in &ctx.extracted_data {
            merged.insert(name.clone(), value_to_string(value));
        }
        for (name, value) in inline {
            merged.insert(name.clone(), value.clone());
        }
        merged.insert("vu_id".to_string(), ctx.vu_id.to_string());
        merged.insert("iteration".to_string(), ctx.iteration.to_string());
        merged.insert(
            "timestamp".to_string(),
            chrono::Utc::now().timestamp().to_string(),
        );

        let rendered = self
            .var_re
            .replace_all(&content, |caps: &Captures| {
                let name = &caps[1];
                merged
                    .get(name)
                    .cloned()
                    .or_else(|| ctx.lookup_string(name))
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned();

        // Normalize syntactically valid JSON to a single line.
        if let Ok(json) = serde_json::from_str::<Value>(rendered.trim()) {
            return serde_json::to_string(&json).ok();
        }
        Some(rendered)
    }

    // -----------------------------------------------------------------------
    // Pass 4: faker
    // -----------------------------------------------------------------------

    fn pass_faker(&self, input: &str, ctx: &VuContext) -> String {
        self.faker_re
            .replace_all(input, |caps: &Captures| {
                match self.faker.generate(&caps[1], ctx.vu_id, ctx.iteration) {
                    Some(value) => value,
                    None => {
                        tracing::warn!(path = &caps[1], "unknown faker path left literal");
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    }

    // -----------------------------------------------------------------------
    // Pass 5: helpers
    // -----------------------------------------------------------------------

    fn pass_helpers(&self, input: &str) -> Result<String, EngineError> {
        let error: RefCell<Option<EngineError>> = RefCell::new(None);
        let result = self
            .helper_re
            .replace_all(input, |caps: &Captures| {
                match eval_helper(&caps[1], &caps[2]) {
                    Ok(Some(value)) => value,
                    // Unknown helper name: leave literal.
                    Ok(None) => {
                        tracing::warn!(helper = &caps[1], "unknown helper left literal");
                        caps[0].to_string()
                    }
                    Err(e) => {
                        error.borrow_mut().get_or_insert(e);
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();

        if let Some(e) = error.into_inner() {
            return Err(e);
        }
        // A helper-looking token without a closing paren is malformed syntax.
        if let Some(m) = self.unterminated_helper_re.find(&result) {
            return Err(EngineError::Template(format!(
                "malformed helper syntax: {}",
                m.as_str()
            )));
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Pass 6: variables and specials
    // -----------------------------------------------------------------------

    fn pass_variables(&self, input: &str, ctx: &VuContext) -> String {
        self.var_re
            .replace_all(input, |caps: &Captures| {
                let name = &caps[1];
                match name {
                    "__VU" => ctx.vu_id.to_string(),
                    "__ITER" => ctx.iteration.to_string(),
                    _ => match ctx.lookup_string(name) {
                        Some(value) => value,
                        None => {
                            tracing::warn!(
                                vu_id = ctx.vu_id,
                                variable = name,
                                "unknown placeholder left literal"
                            );
                            caps[0].to_string()
                        }
                    },
                }
            })
            .into_owned()
    }
}

// ---------------------------------------------------------------------------
// Helper evaluation
// ---------------------------------------------------------------------------

/// Evaluate a built-in helper. `Ok(None)` means the helper name is unknown;
/// argument errors are [`EngineError::Template`].
fn eval_helper(name: &str, raw_args: &str) -> Result<Option<String>, EngineError> {
    let args: Vec<&str> = if raw_args.trim().is_empty() {
        Vec::new()
    } else {
        raw_args.split(',').map(str::trim).collect()
    };

    let bad = |detail: &str| {
        EngineError::Template(format!("malformed helper syntax: {name}({raw_args}): {detail}"))
    };

    let value = match name {
        "randomInt" => {
            if args.len() != 2 {
                return Err(bad("expected (min, max)"));
            }
            let min: i64 = args[0].parse().map_err(|_| bad("min must be an integer"))?;
            let max: i64 = args[1].parse().map_err(|_| bad("max must be an integer"))?;
            if min > max {
                return Err(bad("min must not exceed max"));
            }
            rand::thread_rng().gen_range(min..=max).to_string()
        }
        "randomFloat" => {
            if args.len() != 3 {
                return Err(bad("expected (min, max, fractionDigits)"));
            }
            let min: f64 = args[0].parse().map_err(|_| bad("min must be a number"))?;
            let max: f64 = args[1].parse().map_err(|_| bad("max must be a number"))?;
            let frac: usize = args[2]
                .parse()
                .map_err(|_| bad("fractionDigits must be an integer"))?;
            if min > max {
                return Err(bad("min must not exceed max"));
            }
            format!("{:.frac$}", rand::thread_rng().gen_range(min..=max))
        }
        "randomChoice" => {
            if args.is_empty() {
                return Err(bad("expected at least one option"));
            }
            args[rand::thread_rng().gen_range(0..args.len())].to_string()
        }
        "uuid" => {
            if !args.is_empty() {
                return Err(bad("expected no arguments"));
            }
            uuid::Uuid::new_v4().to_string()
        }
        "isoDate" => {
            let offset: i64 = match args.first() {
                Some(arg) if !arg.is_empty() => {
                    arg.parse().map_err(|_| bad("daysOffset must be an integer"))?
                }
                _ => 0,
            };
            (chrono::Utc::now() + chrono::Duration::days(offset))
                .format("%Y-%m-%d")
                .to_string()
        }
        "timestamp" => {
            let format = args.first().copied().unwrap_or("unix");
            format_timestamp(format).ok_or_else(|| bad("format must be unix|iso|readable|file"))?
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Format the current time in one of the recognized styles.
pub fn format_timestamp(format: &str) -> Option<String> {
    let now = chrono::Utc::now();
    let value = match format {
        "unix" | "" => now.timestamp().to_string(),
        "iso" => now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        "readable" => now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "file" => now.format("%Y%m%d_%H%M%S").to_string(),
        _ => return None,
    };
    Some(value)
}

// ---------------------------------------------------------------------------
// Option parsing
// ---------------------------------------------------------------------------

struct CsvOptions {
    mode: DataMode,
    column: Option<String>,
    delimiter: Option<char>,
    filter: Option<(String, String)>,
    randomize: bool,
}

impl CsvOptions {
    fn parse(raw: &str) -> Self {
        let mut opts = CsvOptions {
            mode: DataMode::Next,
            column: None,
            delimiter: None,
            filter: None,
            randomize: false,
        };
        for pair in raw.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key.trim() {
                "mode" => {
                    opts.mode = match value.trim() {
                        "unique" => DataMode::Unique,
                        "random" => DataMode::Random,
                        _ => DataMode::Next,
                    }
                }
                "column" => opts.column = Some(value.trim().to_string()),
                "delimiter" => opts.delimiter = value.trim().chars().next(),
                "filter" => {
                    if let Some((col, val)) = value.split_once('=') {
                        opts.filter = Some((col.trim().to_string(), val.trim().to_string()));
                    }
                }
                "randomize" => opts.randomize = value.trim() == "true",
                _ => {}
            }
        }
        opts
    }
}

fn parse_kv_pairs(raw: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for pair in raw.split(',') {
        if let Some((key, value)) = pair.split_once('=') {
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    pairs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
