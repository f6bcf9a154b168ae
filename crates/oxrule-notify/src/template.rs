//! Rendering of rule label and annotation templates.
//!
//! Templates use Go `text/template` syntax, executed by [`gtmpl`]. Every
//! text is prefixed with declarations of `$labels`, `$value`, `$expr`,
//! `$activeAt`, `$alertID`, `$groupID`, `$for` and `$externalLabels`; the
//! same data is reachable as fields of dot (`.Labels`, `.Value`, ...).
//!
//! Rendering runs on a blocking thread. The `query` function forwards its
//! expression to the async caller, which resolves it through a
//! [`TemplateQuery`] and hands the result back.

use crate::{NotifyError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use gtmpl::{Context, Func, FuncError, Template, Value};
use oxrule_common::Metric;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};

/// Data exposed to templates while rendering one alert.
#[derive(Debug, Clone)]
pub struct AlertTplData {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub expr: String,
    pub alert_id: u64,
    pub group_id: u64,
    pub active_at: DateTime<Utc>,
    pub for_duration: Duration,
    pub external_labels: BTreeMap<String, String>,
}

impl Default for AlertTplData {
    fn default() -> Self {
        Self {
            labels: BTreeMap::new(),
            value: 0.0,
            expr: String::new(),
            alert_id: 0,
            group_id: 0,
            active_at: DateTime::<Utc>::UNIX_EPOCH,
            for_duration: Duration::zero(),
            external_labels: BTreeMap::new(),
        }
    }
}

impl AlertTplData {
    fn to_value(&self) -> Value {
        let mut dot = HashMap::new();
        dot.insert("Labels".to_string(), labels_value(&self.labels));
        dot.insert("Value".to_string(), Value::from(self.value));
        dot.insert("Expr".to_string(), Value::String(self.expr.clone()));
        dot.insert(
            "ActiveAt".to_string(),
            Value::String(self.active_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        dot.insert("AlertID".to_string(), Value::String(self.alert_id.to_string()));
        dot.insert("GroupID".to_string(), Value::String(self.group_id.to_string()));
        dot.insert(
            "For".to_string(),
            Value::String(
                humantime::format_duration(self.for_duration.to_std().unwrap_or_default())
                    .to_string(),
            ),
        );
        dot.insert(
            "ExternalLabels".to_string(),
            labels_value(&self.external_labels),
        );
        Value::Object(dot)
    }
}

/// Why a template `query` call produced no data.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The evaluation that issued the query was cancelled.
    #[error("evaluation cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// Datasource access for the `query` template function.
///
/// Passed explicitly to every render call; implementations carry the
/// querier and evaluation timestamp they need.
#[async_trait]
pub trait TemplateQuery: Send + Sync {
    async fn query(&self, expr: &str) -> std::result::Result<Vec<Metric>, QueryError>;
}

/// A [`TemplateQuery`] that rejects every call with a fixed message.
pub struct NoQuery(pub &'static str);

#[async_trait]
impl TemplateQuery for NoQuery {
    async fn query(&self, _expr: &str) -> std::result::Result<Vec<Metric>, QueryError> {
        Err(QueryError::Failed(self.0.to_string()))
    }
}

/// Declares the lower-case variables; assignments print nothing.
const HEADER: &str = "{{ $labels := .Labels }}{{ $value := .Value }}{{ $expr := .Expr }}\
{{ $activeAt := .ActiveAt }}{{ $alertID := .AlertID }}{{ $groupID := .GroupID }}\
{{ $for := .For }}{{ $externalLabels := .ExternalLabels }}";

/// What the engine prints for a missing map key.
const NO_VALUE: &str = "<no value>";

const FUNCS: &[(&str, Func)] = &[
    ("query", query as Func),
    ("first", first as Func),
    ("value", value as Func),
    ("label", label as Func),
    ("strvalue", strvalue as Func),
    ("humanize", humanize_fn as Func),
    ("humanizePercentage", humanize_percentage_fn as Func),
    ("humanizeDuration", humanize_duration_fn as Func),
    ("toUpper", to_upper as Func),
    ("toLower", to_lower as Func),
    ("quotesEscape", quotes_escape as Func),
];

/// Renders every template in `templates`, keyed like the input.
///
/// # Errors
///
/// Fails on the first template that cannot be parsed or executed, naming
/// its key. Returns [`NotifyError::Cancelled`] when a `query` call was
/// cancelled, whatever the template made of the failure.
pub async fn render_map(
    templates: &BTreeMap<String, String>,
    data: &AlertTplData,
    query: &dyn TemplateQuery,
) -> Result<BTreeMap<String, String>> {
    run(templates.clone(), data, query).await?.map_err(|(key, msg)| {
        NotifyError::TemplateError(format!("error evaluating template for {key:?}: {msg}"))
    })
}

/// Renders a single template text.
pub async fn render(text: &str, data: &AlertTplData, query: &dyn TemplateQuery) -> Result<String> {
    let mut templates = BTreeMap::new();
    templates.insert(String::new(), text.to_string());
    let mut out = run(templates, data, query)
        .await?
        .map_err(|(_, msg)| NotifyError::TemplateError(msg))?;
    Ok(out.remove("").unwrap_or_default())
}

type Rendered = std::result::Result<BTreeMap<String, String>, (String, String)>;

/// Executes `templates` on a blocking thread while serving its queries.
async fn run(
    templates: BTreeMap<String, String>,
    data: &AlertTplData,
    query: &dyn TemplateQuery,
) -> Result<Rendered> {
    if templates.values().all(|t| !t.contains("{{")) {
        return Ok(Ok(templates));
    }

    let (tx, mut calls) = mpsc::unbounded_channel();
    let dot = data.to_value();
    let mut job = tokio::task::spawn_blocking(move || {
        let _bridge = QueryBridge::install(tx);
        execute_all(&templates, dot)
    });

    let mut cancelled = false;
    let rendered = loop {
        tokio::select! {
            Some(call) = calls.recv() => {
                let res = query.query(&call.expr).await;
                cancelled |= matches!(res, Err(QueryError::Cancelled));
                // the renderer only stops listening once it has failed
                call.reply.send(res).ok();
            }
            res = &mut job => break res,
        }
    };
    if cancelled {
        return Err(NotifyError::Cancelled);
    }
    rendered.map_err(|e| NotifyError::TemplateError(format!("renderer failed: {e}")))
}

fn execute_all(templates: &BTreeMap<String, String>, dot: Value) -> Rendered {
    let ctx = Context::from(dot);
    let mut out = BTreeMap::new();
    for (key, text) in templates {
        let rendered = if text.contains("{{") {
            execute(text, &ctx).map_err(|msg| (key.clone(), msg))?
        } else {
            text.clone()
        };
        out.insert(key.clone(), rendered);
    }
    Ok(out)
}

fn execute(text: &str, ctx: &Context) -> std::result::Result<String, String> {
    let mut tmpl = Template::default();
    for (name, func) in FUNCS {
        tmpl.add_func(name, *func);
    }
    tmpl.parse(format!("{HEADER}{text}")).map_err(|e| e.to_string())?;
    let out = tmpl.render(ctx).map_err(|e| e.to_string())?;
    // missing labels render empty, like Go's zero value for map[string]string
    Ok(out.replace(NO_VALUE, ""))
}

struct QueryCall {
    expr: String,
    reply: oneshot::Sender<std::result::Result<Vec<Metric>, QueryError>>,
}

thread_local! {
    static QUERY_CALLS: RefCell<Option<mpsc::UnboundedSender<QueryCall>>> =
        const { RefCell::new(None) };
}

/// Routes `query` calls made on this thread to the rendering caller.
struct QueryBridge;

impl QueryBridge {
    fn install(tx: mpsc::UnboundedSender<QueryCall>) -> Self {
        QUERY_CALLS.with(|calls| *calls.borrow_mut() = Some(tx));
        Self
    }
}

impl Drop for QueryBridge {
    fn drop(&mut self) {
        QUERY_CALLS.with(|calls| *calls.borrow_mut() = None);
    }
}

fn labels_value(labels: &BTreeMap<String, String>) -> Value {
    Value::Map(
        labels
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// A query result row: `.Labels`, `.Value` and `.Timestamp` (seconds).
fn metric_value(m: &Metric) -> Value {
    let mut obj = HashMap::new();
    obj.insert("Labels".to_string(), labels_value(&m.label_map()));
    obj.insert("Value".to_string(), Value::from(m.first_value()));
    obj.insert(
        "Timestamp".to_string(),
        Value::from(m.timestamps.first().copied().unwrap_or_default()),
    );
    Value::Object(obj)
}

type FuncResult = std::result::Result<Value, FuncError>;

fn func_err(msg: impl Into<String>) -> FuncError {
    FuncError::Generic(msg.into())
}

fn arity(name: &str, args: &[Value], want: usize) -> FuncError {
    func_err(format!(
        "wrong number of args for {name}: want {want} got {}",
        args.len()
    ))
}

fn one_arg<'a>(name: &str, args: &'a [Value]) -> std::result::Result<&'a Value, FuncError> {
    match args {
        [v] => Ok(v),
        _ => Err(arity(name, args, 1)),
    }
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_num(v: &Value) -> std::result::Result<f64, FuncError> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| func_err("can't convert number to float")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| func_err(format!("can't convert {s:?} to float"))),
        Value::Object(_) => as_num(metric_field(v, "Value")?),
        other => Err(func_err(format!("expected number, got {other}"))),
    }
}

fn metric_field<'a>(v: &'a Value, field: &str) -> std::result::Result<&'a Value, FuncError> {
    match v {
        Value::Object(obj) => obj
            .get(field)
            .ok_or_else(|| func_err(format!("expected sample, got object without {field}"))),
        other => Err(func_err(format!("expected sample, got {other}"))),
    }
}

fn query(args: &[Value]) -> FuncResult {
    let expr = as_string(one_arg("query", args)?);
    let (reply, rx) = oneshot::channel();
    let sent = QUERY_CALLS.with(|calls| {
        calls
            .borrow()
            .as_ref()
            .is_some_and(|tx| tx.send(QueryCall { expr, reply }).is_ok())
    });
    if !sent {
        return Err(func_err("query is not available outside rendering"));
    }
    let metrics = rx
        .blocking_recv()
        .map_err(|_| func_err("query was abandoned"))?
        .map_err(|e| func_err(format!("error calling query: {e}")))?;
    Ok(Value::Array(metrics.iter().map(metric_value).collect()))
}

fn first(args: &[Value]) -> FuncResult {
    match one_arg("first", args)? {
        Value::Array(items) => items
            .first()
            .cloned()
            .ok_or_else(|| func_err("first() called on vector with no elements")),
        other => Err(func_err(format!("first() called on {other}"))),
    }
}

fn value(args: &[Value]) -> FuncResult {
    Ok(metric_field(one_arg("value", args)?, "Value")?.clone())
}

fn label(args: &[Value]) -> FuncResult {
    let [name, m] = args else {
        return Err(arity("label", args, 2));
    };
    let name = as_string(name);
    match metric_field(m, "Labels")? {
        Value::Map(labels) => Ok(labels
            .get(&name)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()))),
        other => Err(func_err(format!("expected labels, got {other}"))),
    }
}

fn strvalue(args: &[Value]) -> FuncResult {
    let m = one_arg("strvalue", args)?;
    label(&[Value::String("__value__".to_string()), m.clone()])
}

fn humanize_fn(args: &[Value]) -> FuncResult {
    Ok(Value::String(humanize(as_num(one_arg("humanize", args)?)?)))
}

fn humanize_percentage_fn(args: &[Value]) -> FuncResult {
    let v = as_num(one_arg("humanizePercentage", args)?)?;
    Ok(Value::String(format!("{}%", format_g(v * 100.0, 4))))
}

fn humanize_duration_fn(args: &[Value]) -> FuncResult {
    Ok(Value::String(humanize_duration(as_num(one_arg(
        "humanizeDuration",
        args,
    )?)?)))
}

fn to_upper(args: &[Value]) -> FuncResult {
    Ok(Value::String(as_string(one_arg("toUpper", args)?).to_uppercase()))
}

fn to_lower(args: &[Value]) -> FuncResult {
    Ok(Value::String(as_string(one_arg("toLower", args)?).to_lowercase()))
}

fn quotes_escape(args: &[Value]) -> FuncResult {
    Ok(Value::String(
        as_string(one_arg("quotesEscape", args)?).replace('"', "\\\""),
    ))
}

fn format_number(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

/// `%.<precision>g` formatting.
fn format_g(v: f64, precision: usize) -> String {
    if !v.is_finite() {
        return format_number(v);
    }
    if v == 0.0 {
        return "0".to_string();
    }
    let sci = format!("{:.*e}", precision - 1, v);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= precision as i32 {
        let mantissa = trim_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    let decimals = (precision as i32 - 1 - exp).max(0) as usize;
    trim_zeros(&format!("{v:.decimals$}")).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn humanize(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format_g(v, 4);
    }
    if v.abs() >= 1.0 {
        let mut prefix = "";
        let mut v = v;
        for p in ["k", "M", "G", "T", "P", "E", "Z", "Y"] {
            if v.abs() < 1000.0 {
                break;
            }
            prefix = p;
            v /= 1000.0;
        }
        return format!("{}{prefix}", format_g(v, 4));
    }
    let mut prefix = "";
    let mut v = v;
    for p in ["m", "u", "n", "p", "f", "a", "z", "y"] {
        if v.abs() >= 1.0 {
            break;
        }
        prefix = p;
        v *= 1000.0;
    }
    format!("{}{prefix}", format_g(v, 4))
}

fn humanize_duration(v: f64) -> String {
    if !v.is_finite() {
        return format_g(v, 4);
    }
    if v.abs() >= 1.0 {
        let sign = if v < 0.0 { "-" } else { "" };
        let total = v.abs() as i64;
        let (days, hours, minutes, seconds) =
            (total / 86400, total / 3600 % 24, total / 60 % 60, total % 60);
        return if days != 0 {
            format!("{sign}{days}d {hours}h {minutes}m {seconds}s")
        } else if hours != 0 {
            format!("{sign}{hours}h {minutes}m {seconds}s")
        } else if minutes != 0 {
            format!("{sign}{minutes}m {seconds}s")
        } else {
            format!("{}s", format_g(v, 4))
        };
    }
    let mut prefix = "";
    let mut v = v;
    for p in ["m", "u", "n", "p", "f", "a", "z", "y"] {
        if v == 0.0 || v.abs() >= 1.0 {
            break;
        }
        prefix = p;
        v *= 1000.0;
    }
    format!("{}{prefix}s", format_g(v, 4))
}
