use async_trait::async_trait;
use prozess::config::EngineConfig;
use prozess::error::EngineError;
use prozess::model::SocketRef;
use prozess::runtime::context::TokenContext;
use prozess::runtime::lifecycle::{LifecycleRequest, LifecycleState};
use prozess::runtime::value::ParamValue;
use prozess::runtime::worker::{Handler, HandlerVerdict, Worker};
use prozess::service::{TokenContextService, TransientTokenContextService};
use std::sync::Arc;

fn service() -> Arc<TransientTokenContextService> {
    Arc::new(TransientTokenContextService::new(Arc::new(
        EngineConfig::default(),
    )))
}

async fn add_claimable(svc: &TransientTokenContextService) -> Arc<TokenContext> {
    let ctx = svc.create_context().await.expect("create");
    ctx.set_current_socket(Some(SocketRef::new("order", "ship", "in")));
    ctx.set_state(LifecycleState::Suspended);
    ctx.set_request(LifecycleRequest::Resume);
    svc.add_context(&ctx).await.expect("add");
    ctx
}

struct GreetingHandler;

#[async_trait]
impl Handler for GreetingHandler {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError> {
        ctx.check_termination()?;
        ctx.set_param("order.ship.result", ParamValue::Text(socket.qualified()))?;
        ctx.choose_exit_socket("done");
        Ok(HandlerVerdict::Completed)
    }
}

#[tokio::test]
async fn test_worker_claims_executes_and_completes() {
    let svc = service();
    let ctx = add_claimable(&svc).await;

    let worker = Worker::new(
        svc.clone(),
        Arc::new(GreetingHandler),
        "w1",
        &EngineConfig::default(),
    );
    let executed = worker.poll_once().await.expect("poll");
    assert_eq!(executed, 1);

    assert_eq!(ctx.state(), LifecycleState::Completed);
    assert_eq!(ctx.node_id().as_deref(), Some("w1"));
    assert_eq!(
        ctx.get_param("order.ship.result").expect("get"),
        Some(ParamValue::Text("order.ship.in".to_string()))
    );
    assert_eq!(ctx.chosen_exit().as_deref(), Some("done"));

    // Nothing claimable remains.
    assert_eq!(worker.poll_once().await.expect("poll"), 0);
}

struct YieldingHandler;

#[async_trait]
impl Handler for YieldingHandler {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        _socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError> {
        // A suspend request arrives mid-execution; the handler yields at
        // its next yield point.
        ctx.set_request(LifecycleRequest::SuspendMemory);
        Ok(HandlerVerdict::Yielded)
    }
}

#[tokio::test]
async fn test_suspend_memory_observed_at_yield_point_idles() {
    let svc = service();
    let ctx = add_claimable(&svc).await;

    let worker = Worker::new(
        svc.clone(),
        Arc::new(YieldingHandler),
        "w1",
        &EngineConfig::default(),
    );
    worker.poll_once().await.expect("poll");

    assert_eq!(ctx.state(), LifecycleState::Idling);
    assert_eq!(ctx.request(), LifecycleRequest::None);
}

struct KillableHandler;

#[async_trait]
impl Handler for KillableHandler {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        _socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError> {
        ctx.check_termination()?;
        Ok(HandlerVerdict::Completed)
    }
}

#[tokio::test]
async fn test_controller_kill_aborts_instead_of_failing() {
    let svc = service();
    let ctx = add_claimable(&svc).await;
    ctx.request_termination();

    let worker = Worker::new(
        svc.clone(),
        Arc::new(KillableHandler),
        "w1",
        &EngineConfig::default(),
    );
    worker.poll_once().await.expect("poll");

    assert_eq!(ctx.state(), LifecycleState::Aborted);
}

struct BrokenHandler;

#[async_trait]
impl Handler for BrokenHandler {
    async fn run(
        &self,
        ctx: &Arc<TokenContext>,
        _socket: &SocketRef,
    ) -> Result<HandlerVerdict, EngineError> {
        // Popping an empty stack is a fatal engine condition.
        ctx.pop_frame()?;
        Ok(HandlerVerdict::Completed)
    }
}

#[tokio::test]
async fn test_fatal_handler_error_drives_context_to_error_state() {
    let svc = service();
    let ctx = add_claimable(&svc).await;

    let worker = Worker::new(
        svc.clone(),
        Arc::new(BrokenHandler),
        "w1",
        &EngineConfig::default(),
    );
    worker.poll_once().await.expect("poll");

    assert_eq!(ctx.state(), LifecycleState::Error);
    // Position stays queryable for diagnosis.
    assert!(ctx.current_socket().is_some());
}

#[tokio::test]
async fn test_recover_reclaims_abandoned_contexts() {
    let svc = service();

    // A previous incarnation of "w1" died holding these.
    let stuck_selected = svc.create_context().await.expect("create");
    stuck_selected.set_state(LifecycleState::Selected);
    stuck_selected.set_node_id(Some("w1".to_string()));
    svc.add_context(&stuck_selected).await.expect("add");

    let stuck_running = svc.create_context().await.expect("create");
    stuck_running.set_state(LifecycleState::Running);
    stuck_running.set_node_id(Some("w1".to_string()));
    svc.add_context(&stuck_running).await.expect("add");

    let other_node = svc.create_context().await.expect("create");
    other_node.set_state(LifecycleState::Running);
    other_node.set_node_id(Some("w2".to_string()));
    svc.add_context(&other_node).await.expect("add");

    let worker = Worker::new(
        svc.clone(),
        Arc::new(GreetingHandler),
        "w1",
        &EngineConfig::default(),
    );
    let repaired = worker.recover().await.expect("recover");
    assert_eq!(repaired, 2);

    assert_eq!(stuck_selected.state(), LifecycleState::Suspended);
    assert_eq!(stuck_selected.request(), LifecycleRequest::Resume);
    assert_eq!(stuck_running.state(), LifecycleState::Suspended);
    assert_eq!(other_node.state(), LifecycleState::Running, "other nodes untouched");
}

#[tokio::test]
async fn test_batch_size_limits_claims_per_poll() {
    let svc = service();
    for _ in 0..5 {
        add_claimable(&svc).await;
    }

    let config = EngineConfig {
        batch_size: 2,
        ..EngineConfig::default()
    };
    let worker = Worker::new(svc.clone(), Arc::new(GreetingHandler), "w1", &config);

    assert_eq!(worker.poll_once().await.expect("poll"), 2);
    assert_eq!(worker.poll_once().await.expect("poll"), 2);
    assert_eq!(worker.poll_once().await.expect("poll"), 1);
}
