use prozess::config::EngineConfig;
use prozess::error::EngineError;
use prozess::model::{ModelResolver, SocketRef, StaticModelResolver};
use prozess::runtime::callstack::{CallStack, FrameKind};
use prozess::runtime::context::TokenContext;
use prozess::runtime::value::ParamValue;
use uuid::Uuid;

fn socket(process: &str, node: &str, name: &str) -> SocketRef {
    SocketRef::new(process, node, name)
}

#[test]
fn test_depth_bound_fails_without_mutation() {
    let mut stack = CallStack::new(2);
    stack
        .push_subprocess(socket("order", "a", "in"))
        .expect("first push");
    stack
        .push_subprocess(socket("order", "b", "in"))
        .expect("second push");

    let err = stack
        .push_subprocess(socket("order", "c", "in"))
        .expect_err("third push must exceed the bound");
    assert!(matches!(err, EngineError::CallStackOverflow { max: 2, .. }));

    // The failed push must not have touched the stack.
    assert_eq!(stack.depth(), 2);
    assert_eq!(stack.peek().unwrap().socket.node, "b");
}

#[test]
fn test_pop_peek_duality() {
    let mut stack = CallStack::default();
    stack
        .push_return_point(socket("order", "a", "out"))
        .expect("push");
    stack
        .push_subprocess(socket("billing", "entry", "in"))
        .expect("push");

    let peeked = stack.peek().expect("stack is not empty").clone();
    let (popped, _) = stack.pop().expect("pop");
    assert_eq!(peeked, popped);
    assert_eq!(stack.depth(), 1);
}

#[test]
fn test_pop_empty_stack_fails() {
    let mut stack = CallStack::default();
    let err = stack.pop().expect_err("empty pop must fail");
    assert!(matches!(err, EngineError::EmptyCallStack));
}

#[test]
fn test_shared_process_variables_survive_partial_pop() {
    let ctx = TokenContext::new(Uuid::new_v4(), &EngineConfig::default());

    // Frame A and frame B both reference process "order".
    ctx.push_subprocess(socket("order", "a", "in")).expect("push A");
    ctx.push_subprocess(socket("order", "b", "in")).expect("push B");

    ctx.declare_process_variable("#total", "order", true);
    ctx.set_process_variable("#total", ParamValue::Int(42))
        .expect("set variable");

    // Popping B must not clear "order" variables: frame A still references it.
    ctx.pop_frame().expect("pop B");
    assert_eq!(
        ctx.get_process_variable("#total").expect("get"),
        Some(ParamValue::Int(42))
    );

    // Popping A leaves no frame referencing "order": variables must go.
    ctx.pop_frame().expect("pop A");
    assert_eq!(ctx.get_process_variable("#total").expect("get"), None);
}

#[test]
fn test_pop_releases_only_unreferenced_processes() {
    let ctx = TokenContext::new(Uuid::new_v4(), &EngineConfig::default());

    ctx.push_subprocess(socket("order", "a", "in")).expect("push");
    ctx.push_subprocess(socket("billing", "entry", "in"))
        .expect("push");

    ctx.declare_process_variable("#order_no", "order", true);
    ctx.declare_process_variable("#invoice", "billing", true);

    // Popping the billing frame releases billing, not order.
    ctx.pop_frame().expect("pop billing");
    assert_eq!(ctx.get_process_variable("#invoice").expect("get"), None);
    assert!(ctx.has_param("#order_no"));
}

#[test]
fn test_contains_socket_reference_scans_continue_frames_only() {
    let mut stack = CallStack::default();
    let continue_socket = socket("order", "a", "out");
    let search_socket = socket("billing", "entry", "in");
    stack
        .push_return_point(continue_socket.clone())
        .expect("push");
    stack.push_subprocess(search_socket.clone()).expect("push");

    assert!(stack.contains_socket_reference(&continue_socket.qualified()));
    assert!(!stack.contains_socket_reference(&search_socket.qualified()));
}

#[test]
fn test_is_process_executing() {
    let mut stack = CallStack::default();
    stack.push_subprocess(socket("order", "a", "in")).expect("push");

    assert!(stack.is_process_executing("order"));
    assert!(!stack.is_process_executing("billing"));
}

#[test]
fn test_process_update_reresolves_frames() {
    let resolver = StaticModelResolver::new();
    let original = socket("order", "ship", "in");
    resolver.register_socket(original.clone());

    let mut stack = CallStack::default();
    stack.push_subprocess(original.clone()).expect("push");

    // Hot reload: same socket, now carrying a queue hint.
    resolver.register_socket(original.clone().with_queue("fast"));
    assert!(stack.perform_process_update(&resolver));
    assert_eq!(
        stack.peek().unwrap().socket.queue.as_deref(),
        Some("fast")
    );
}

#[test]
fn test_process_update_reports_stale_reference() {
    let resolver = StaticModelResolver::new();
    let stale = socket("order", "ship", "in");
    resolver.register_socket(stale.clone());

    let mut stack = CallStack::default();
    stack.push_subprocess(stale.clone()).expect("push");
    stack
        .push_subprocess(socket("order", "bill", "in"))
        .expect("push");

    // The reloaded definition dropped the "ship" node but kept "bill".
    resolver.remove_process("order");
    resolver.register_socket(socket("order", "bill", "in"));

    assert!(!stack.perform_process_update(&resolver));
    // The stale frame keeps its old reference for diagnosis.
    assert_eq!(stack.frames()[0].socket, stale);
}

#[test]
fn test_clear_releases_every_process_once() {
    let mut stack = CallStack::default();
    stack.push_subprocess(socket("order", "a", "in")).expect("push");
    stack.push_subprocess(socket("order", "b", "in")).expect("push");
    stack
        .push_subprocess(socket("billing", "entry", "in"))
        .expect("push");

    let released = stack.clear();
    assert_eq!(released.len(), 2);
    assert!(released.contains(&"order".to_string()));
    assert!(released.contains(&"billing".to_string()));
    assert!(stack.is_empty());
}

#[test]
fn test_frame_kind_codes_round_trip() {
    assert_eq!(FrameKind::from_code(FrameKind::Continue.as_code()), Some(FrameKind::Continue));
    assert_eq!(FrameKind::from_code(FrameKind::Search.as_code()), Some(FrameKind::Search));
    assert_eq!(FrameKind::from_code(7), None);
}

#[test]
fn test_qualified_name_parsing() {
    let parsed = SocketRef::parse_qualified("billing/v2.approve.out").expect("parse");
    assert_eq!(parsed.process, "billing/v2");
    assert_eq!(parsed.node, "approve");
    assert_eq!(parsed.socket, "out");

    // Process ids may contain dots; the last two segments stay node/socket.
    let dotted = SocketRef::parse_qualified("acme.billing.approve.out").expect("parse");
    assert_eq!(dotted.process, "acme.billing");

    assert!(SocketRef::parse_qualified("tooshort").is_none());
}

struct NoResolver;

impl ModelResolver for NoResolver {
    fn resolve_socket(&self, _qualified: &str) -> Option<SocketRef> {
        None
    }
}

#[test]
fn test_empty_stack_update_is_trivially_ok() {
    let mut stack = CallStack::default();
    assert!(stack.perform_process_update(&NoResolver));
}
