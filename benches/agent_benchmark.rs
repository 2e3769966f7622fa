use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::{Map, Value};
use sluice::agent::Agent;
use sluice::compat;
use sluice::config::Settings;
use sluice::metrics::MetricsCollector;
use sluice::pipeline::config::PipelineDefinition;
use sluice::pipeline::event::Event;
use sluice::plugins::{Filter, MutateFilter, PluginRegistry};
use sluice::source::template::substitute;

const PIPELINE: &str = r#"
input {
  generator { message => "GET /index.html 200" count => 0 }
  stdin {}
}
filter {
  grep { pattern => "^GET" mode => "include" case_sensitive => false }
  mutate { add_field => { "service" => "web" "tier" => 1 } uppercase => true }
}
output {
  stdout { codec => "json" }
  null {}
}
"#;

/// Benchmark agent construction
fn bench_agent_initialization(c: &mut Criterion) {
    c.bench_function("agent_initialization", |b| {
        b.iter(|| {
            let settings = Settings::default().with_node_name("bench");
            let _agent = Agent::new(black_box(settings));
        });
    });
}

/// Benchmark pipeline configuration parsing
fn bench_config_parsing(c: &mut Criterion) {
    c.bench_function("parse_pipeline_definition", |b| {
        b.iter(|| {
            black_box(PipelineDefinition::parse(black_box(PIPELINE)).ok());
        });
    });
}

/// Benchmark variable substitution
fn bench_template_substitution(c: &mut Criterion) {
    let text = PIPELINE.replace("web", "${SERVICE}").replace("GET", "${METHOD:GET}");

    c.bench_function("substitute_variables", |b| {
        b.iter(|| {
            let rendered = substitute(black_box(&text), |name| {
                (name == "SERVICE").then(|| "web".to_string())
            });
            black_box(rendered.ok());
        });
    });
}

/// Benchmark the reload compatibility check
fn bench_compatibility_check(c: &mut Criterion) {
    let plugins = PluginRegistry::with_builtins();
    let current = PipelineDefinition::parse(PIPELINE).unwrap();
    let candidate = PipelineDefinition::parse(&PIPELINE.replace("tier", "zone")).unwrap();

    c.bench_function("compatibility_check", |b| {
        b.iter(|| {
            black_box(compat::check(&current, &candidate, &plugins));
        });
    });
}

/// Benchmark filtering and metrics recording
fn bench_event_processing(c: &mut Criterion) {
    let mut add_field = Map::new();
    add_field.insert("service".to_string(), Value::from("web"));
    let filter = MutateFilter::new(add_field, true, false).unwrap();

    c.bench_function("mutate_filter", |b| {
        b.iter(|| {
            let mut event = Event::new("GET /index.html 200");
            black_box(filter.filter(&mut event).ok());
        });
    });

    let metrics = MetricsCollector::new().unwrap();
    let pipeline = metrics.pipeline("main");
    c.bench_function("record_pipeline_metrics", |b| {
        b.iter(|| {
            pipeline.record_in(black_box(125));
            pipeline.record_filtered(black_box(120));
            pipeline.record_out(black_box(120));
        });
    });

    c.bench_function("metrics_snapshot", |b| {
        b.iter(|| {
            black_box(metrics.snapshot());
        });
    });
}

criterion_group!(
    benches,
    bench_agent_initialization,
    bench_config_parsing,
    bench_template_substitution,
    bench_compatibility_check,
    bench_event_processing
);
criterion_main!(benches);
