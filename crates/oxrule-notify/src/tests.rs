use crate::fake::FakeNotifier;
use crate::template::{render, render_map, AlertTplData, NoQuery, QueryError, TemplateQuery};
use crate::NotifyError;
use crate::Notifier;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use oxrule_common::{Alert, Metric};
use std::collections::BTreeMap;

struct StaticQuery(Vec<Metric>);

#[async_trait]
impl TemplateQuery for StaticQuery {
    async fn query(&self, _expr: &str) -> Result<Vec<Metric>, QueryError> {
        Ok(self.0.clone())
    }
}

struct CancelledQuery;

#[async_trait]
impl TemplateQuery for CancelledQuery {
    async fn query(&self, _expr: &str) -> Result<Vec<Metric>, QueryError> {
        Err(QueryError::Cancelled)
    }
}

fn tpl_data() -> AlertTplData {
    let mut labels = BTreeMap::new();
    labels.insert("job".to_string(), "node".to_string());
    labels.insert("instance".to_string(), "host:9100".to_string());
    AlertTplData {
        labels,
        value: 0.75,
        expr: "up == 0".to_string(),
        alert_id: 42,
        active_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ..Default::default()
    }
}

#[tokio::test]
async fn renders_labels_value_and_expr() {
    let out = render(
        "{{ $labels.job }} on {{ .Labels.instance }} is {{ $value }} ({{ $expr }})",
        &tpl_data(),
        &NoQuery("disabled"),
    )
    .await
    .unwrap();
    assert_eq!(out, "node on host:9100 is 0.75 (up == 0)");
}

#[tokio::test]
async fn plain_text_passes_through() {
    let out = render("no actions here", &tpl_data(), &NoQuery("disabled"))
        .await
        .unwrap();
    assert_eq!(out, "no actions here");
}

#[tokio::test]
async fn missing_label_renders_empty() {
    let out = render("[{{ $labels.missing }}]", &tpl_data(), &NoQuery("disabled"))
        .await
        .unwrap();
    assert_eq!(out, "[]");
}

#[tokio::test]
async fn pipelines_and_trim_markers() {
    let out = render(
        "value:  {{- $value | humanizePercentage -}}  !{{ \"abc\" | toUpper }}",
        &tpl_data(),
        &NoQuery("disabled"),
    )
    .await
    .unwrap();
    assert_eq!(out, "value:75%!ABC");
}

#[tokio::test]
async fn variable_assignment_is_silent() {
    let out = render(
        "{{ $j := $labels.job }}job={{ $j }}",
        &tpl_data(),
        &NoQuery("disabled"),
    )
    .await
    .unwrap();
    assert_eq!(out, "job=node");
}

#[tokio::test]
async fn query_function_uses_callback() {
    let q = StaticQuery(vec![Metric::instant(&[("instance", "db-1")], 0, 12346.0)]);
    let out = render(
        "{{ query \"up\" | first | value | humanize }} on {{ query \"up\" | first | label \"instance\" }}",
        &tpl_data(),
        &q,
    )
    .await
    .unwrap();
    assert_eq!(out, "12.35k on db-1");
}

#[tokio::test]
async fn query_errors_propagate() {
    let err = render("{{ query \"up\" }}", &tpl_data(), &NoQuery("not allowed here"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not allowed here"));
}

#[tokio::test]
async fn conditionals_compare_the_value() {
    let tpl = "{{ if gt $value 0.5 }}high{{ else }}low{{ end }}";
    let out = render(tpl, &tpl_data(), &NoQuery("disabled")).await.unwrap();
    assert_eq!(out, "high");

    let data = AlertTplData {
        value: 0.25,
        ..tpl_data()
    };
    let out = render(tpl, &data, &NoQuery("disabled")).await.unwrap();
    assert_eq!(out, "low");
}

#[tokio::test]
async fn range_walks_every_label() {
    let out = render(
        "{{ range $k, $v := $labels }}{{ $k }}={{ $v }};{{ end }}",
        &tpl_data(),
        &NoQuery("disabled"),
    )
    .await
    .unwrap();
    let mut pairs: Vec<&str> = out.split(';').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec!["instance=host:9100", "job=node"]);
}

#[tokio::test]
async fn printf_and_with_are_available() {
    let out = render(
        "{{ printf \"%.2f\" $value }} {{ printf \"%.3f\" .Value }}{{ with $labels.job }} on {{ . }}{{ end }}",
        &tpl_data(),
        &NoQuery("disabled"),
    )
    .await
    .unwrap();
    assert_eq!(out, "0.75 0.750 on node");
}

#[tokio::test]
async fn range_over_query_results() {
    let q = StaticQuery(vec![
        Metric::instant(&[("instance", "db-1")], 0, 1.0),
        Metric::instant(&[("instance", "db-2")], 0, 2.0),
    ]);
    let out = render(
        "{{ range query \"up\" }}{{ .Labels.instance }}:{{ .Value }} {{ end }}",
        &tpl_data(),
        &q,
    )
    .await
    .unwrap();
    assert_eq!(out, "db-1:1 db-2:2 ");
}

#[tokio::test]
async fn cancelled_query_is_not_a_template_error() {
    let mut templates = BTreeMap::new();
    templates.insert(
        "total".to_string(),
        "{{ query \"up\" | first | value }}".to_string(),
    );
    let err = render_map(&templates, &tpl_data(), &CancelledQuery)
        .await
        .unwrap_err();
    assert!(matches!(err, NotifyError::Cancelled));
}

#[tokio::test]
async fn unclosed_action_fails() {
    assert!(render("{{ $value", &tpl_data(), &NoQuery("disabled"))
        .await
        .is_err());
}

#[tokio::test]
async fn render_map_names_failing_key() {
    let mut templates = BTreeMap::new();
    templates.insert("summary".to_string(), "{{ $labels.job }}".to_string());
    templates.insert("broken".to_string(), "{{ nope }}".to_string());
    let err = render_map(&templates, &tpl_data(), &NoQuery("disabled"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("\"broken\""));
    let msg = err.to_string();
    assert_eq!(msg.matches("template rendering error").count(), 1, "{msg}");

    templates.remove("broken");
    let out = render_map(&templates, &tpl_data(), &NoQuery("disabled"))
        .await
        .unwrap();
    assert_eq!(out["summary"], "node");
}

#[tokio::test]
async fn fake_notifier_records_batches() {
    let nt = FakeNotifier::new();
    let alert = Alert::new("A", Utc::now());
    let mut headers = BTreeMap::new();
    headers.insert("X-Tenant".to_string(), "1".to_string());

    nt.send(&[alert.clone()], &headers).await.unwrap();
    assert_eq!(nt.batches(), 1);
    assert_eq!(nt.alerts()[0].name, "A");
    assert_eq!(nt.headers()["X-Tenant"], "1");

    nt.set_err("receiver down");
    assert!(nt.send(&[alert], &headers).await.is_err());
    assert_eq!(nt.batches(), 1);
}
