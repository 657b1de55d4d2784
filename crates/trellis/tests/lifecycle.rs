//! End-to-end tests for the control lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use trellis::prelude::*;
use trellis::{ContractViolation, ObjectId, RetriablePromise, RetryPolicy, TrellisError};

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mount(control: &Arc<Control>, document: &Arc<Document>) {
    let markup = control.render_html().unwrap();
    document.append_html(document.body(), &markup).unwrap();
}

#[test]
fn test_bound_attribute_updates_on_next_frame() {
    setup();
    let (runtime, host) = Runtime::manual(RuntimeConfig::strict());
    let document = Document::new();
    let template = Template::new(vec![Annotation::new(0).attr("title", "title")]);
    let control = Control::new(&runtime, document.clone(), ControlOptions::default().with_template(template));

    let markup = control.render_html().unwrap();
    assert!(markup.contains(r#"id="Control-0""#));
    assert!(markup.starts_with("<div"));
    document.append_html(document.body(), &markup).unwrap();

    control.activate().unwrap();
    let element = control.element().unwrap();
    assert_eq!(Some(element), document.element_by_id("Control-0"));

    let context = DataContext::new(runtime.bus());
    control.set_data_context(context.clone()).unwrap();
    let changes = Arc::new(AtomicUsize::new(0));
    let group = ListenerGroup::new(runtime.bus(), "observer");
    let c = changes.clone();
    group.on(context.id(), events::CHANGE, move |_: &EventArgs| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    context.set_data([("title", "Inbox")]);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    assert_eq!(document.attribute(element, "title"), None);

    host.fire();
    assert_eq!(document.attribute(element, "title").as_deref(), Some("Inbox"));

    context.set_data([("title", "Archive")]);
    context.set_data([("title", "Sent")]);
    host.fire();
    assert_eq!(document.attribute(element, "title").as_deref(), Some("Sent"));
}

#[test]
fn test_rerender_while_active_is_a_contract_violation() {
    setup();
    let runtime = Runtime::with_config(RuntimeConfig::lenient());
    let document = Document::new();
    let control = Control::new(&runtime, document.clone(), ControlOptions::default());
    mount(&control, &document);
    control.activate().unwrap();

    let err = control.render_html().unwrap_err();
    assert!(matches!(
        err,
        TrellisError::Contract(ContractViolation::RenderWhileActive { .. })
    ));

    control.deactivate();
    assert!(control.render_html().is_ok());
}

#[test]
fn test_dispose_is_terminal_and_idempotent() {
    setup();
    let runtime = Runtime::with_config(RuntimeConfig::lenient());
    let document = Document::new();
    let control = Control::new(&runtime, document.clone(), ControlOptions::default());
    let disposals = Arc::new(AtomicUsize::new(0));
    let group = ListenerGroup::new(runtime.bus(), "observer");
    let d = disposals.clone();
    group.on(control.object_id(), events::DISPOSE, move |_: &EventArgs| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    mount(&control, &document);
    control.activate().unwrap();
    control.dispose();
    control.dispose();
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
    assert_eq!(control.state(), ControlState::Disposed);

    assert!(control.activate().is_err());
    control.deactivate();
    control.initialize();
    assert_eq!(control.state(), ControlState::Disposed);
}

#[test]
fn test_events_bubble_through_the_control_tree() {
    setup();
    let runtime = Runtime::new();
    let document = Document::new();
    let root = Control::new(&runtime, document.clone(), ControlOptions::new("Root"));
    let leaf = root.create_child(ControlOptions::new("Leaf"), trellis::DefaultBehavior);

    let seen = Arc::new(Mutex::new(Vec::<ObjectId>::new()));
    let group = ListenerGroup::new(runtime.bus(), "observer");
    let s = seen.clone();
    let root_id = root.object_id();
    group.on(root_id, "select", move |_: &EventArgs| s.lock().push(root_id));

    runtime.bus().raise(leaf.object_id(), "select", &EventArgs::none(), true);
    assert_eq!(*seen.lock(), vec![root_id]);

    root.remove_child(&leaf, None);
    runtime.bus().raise(leaf.object_id(), "select", &EventArgs::none(), true);
    assert_eq!(seen.lock().len(), 1);
}

struct Row {
    key: String,
    id: ObjectId,
}

impl SetItem for Row {
    fn key(&self) -> Option<&str> {
        Some(&self.key)
    }

    fn object_id(&self) -> Option<ObjectId> {
        Some(self.id)
    }
}

struct ListView {
    rows: Arc<ItemSet<Row>>,
}

impl ControlBehavior for ListView {
    fn binding_value(&self, control: &Control, source: &str) -> Value {
        match source {
            "count" => Value::from(self.rows.count()),
            other => control.data_context().map_or(Value::Null, |c| c.get(other)),
        }
    }
}

#[test]
fn test_item_set_changes_reach_the_view() {
    setup();
    let (runtime, host) = Runtime::manual(RuntimeConfig::strict());
    let document = Document::new();
    let rows: Arc<ItemSet<Row>> = ItemSet::new(&runtime);
    let template = Template::new(vec![Annotation::new(0).attr("data-count", "count")]);
    let control = Control::with_behavior(
        &runtime,
        document.clone(),
        ControlOptions::new("List").with_template(template),
        ListView { rows: rows.clone() },
    );
    mount(&control, &document);
    control.activate().unwrap();
    control
        .set_data_context(ContextSource::data([("rows", Value::observable(rows.clone()))]))
        .unwrap();
    host.fire();
    let element = control.element().unwrap();
    assert_eq!(document.attribute(element, "data-count").as_deref(), Some("0"));

    for key in ["a", "b", "c"] {
        rows.add(Arc::new(Row {
            key: key.to_string(),
            id: runtime.bus().register_object::<Row>(key),
        }));
    }
    rows.invalidate();
    rows.invalidate();
    runtime.run_until_idle();
    host.fire();
    assert_eq!(document.attribute(element, "data-count").as_deref(), Some("3"));
}

#[test]
fn test_state_snapshot_reads_bound_sources() {
    setup();
    let runtime = Runtime::new();
    let document = Document::new();
    let template = Template::new(vec![
        Annotation::new(0).attr("title", "title").css("display", "isVisible"),
    ]);
    let control = Control::new(&runtime, document.clone(), ControlOptions::default().with_template(template));
    control
        .set_data_context(ContextSource::data([("title", Value::from("t")), ("isVisible", Value::from(false))]))
        .unwrap();

    let snapshot = control.state_snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["title"], Value::from("t"));
    assert_eq!(snapshot["isVisible"], Value::from(false));
}

#[derive(Debug)]
struct Unavailable;

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("service unavailable")
    }
}

impl std::error::Error for Unavailable {}

#[tokio::test]
async fn test_retriable_load_succeeds_after_two_retries() {
    setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let policy = RetryPolicy::new(2).with_durations([Duration::from_millis(10), Duration::from_millis(20)]);

    let start = Instant::now();
    let promise = RetriablePromise::spawn(policy, move || {
        let attempt = a.fetch_add(1, Ordering::SeqCst);
        async move { if attempt < 2 { Err(Unavailable) } else { Ok("loaded") } }
    });

    let (outcome, retries) = promise.wait().await;
    assert_eq!(outcome.unwrap(), "loaded");
    assert_eq!(retries, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(30));
}
