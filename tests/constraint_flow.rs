//! Cross-agent constraint propagation: make, ensure, aborts and the
//! temporary-failure protocol.

use std::sync::Arc;
use std::time::Duration;

use hyper_runtime::primitives::{ComputeExpr, EnsureConstraint, MakeConstraint, WaitExpr, new_hold};
use hyper_runtime::{
    Agent, AgentConfig, AgentContext, AgentName, ConditionSet, ConstraintState, ExecError, Expr,
    Message, NameServer, RecipeDef, RecipeTable, Sequence, Value,
};
use tokio::time::{sleep, timeout};

async fn start_system() -> (NameServer, std::net::SocketAddr) {
    let ns = NameServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = ns.local_addr();
    (ns, addr)
}

fn assign(
    dest: &'static str,
    expr: Expr,
) -> Box<dyn Fn(&Arc<AgentContext>) -> Sequence + Send + Sync> {
    Box::new(move |ctx| {
        let mut seq = Sequence::new();
        seq.push(Box::new(ComputeExpr::new(ctx.clone(), dest, expr.clone())));
        seq
    })
}

/// Agent `bee` exporting `k` with a recipe that establishes `k == 7`.
async fn start_bee(nameserver: std::net::SocketAddr) -> Agent {
    let agent = Agent::start(AgentConfig::new(AgentName::literal("bee"), nameserver))
        .await
        .unwrap();
    agent.export("k", Value::Int(0));
    let table = RecipeTable::new();
    table.install("k", Arc::new(RecipeDef::new("set_k", assign("k", Expr::int(7)))));
    agent.set_logic(Arc::new(table));
    agent
}

#[tokio::test]
async fn remote_make_proceeds_to_the_next_step() {
    let (ns, nameserver) = start_system().await;
    let bee = start_bee(nameserver).await;
    let alpha = Agent::start(AgentConfig::new(AgentName::literal("alpha"), nameserver))
        .await
        .unwrap();
    alpha.export("w", Value::Int(0));

    let ctx = alpha.ctx().clone();
    let goal = Expr::eq(Expr::var("k"), Expr::int(7));
    let mut seq = Sequence::new();
    seq.push(Box::new(MakeConstraint::new(ctx.clone(), "bee", goal, vec![])));
    seq.push(Box::new(ComputeExpr::new(ctx.clone(), "w", Expr::int(1))));

    assert_eq!(seq.run().await, Ok(()));
    assert_eq!(alpha.read("w").unwrap(), Value::Int(1));
    assert_eq!(bee.read("k").unwrap(), Value::Int(7));

    // Scoped remote variables evaluate through the proxy.
    let remote = hyper_runtime::async_eval(&ctx, &Expr::var("bee.k")).await;
    assert_eq!(remote, Ok(Some(Value::Int(7))));

    // An unknown remote variable is an invalid argument, not a transport
    // failure.
    let err = ctx.proxy().get("bee", "ghost").await.unwrap_err();
    assert!(matches!(err, ExecError::InvalidArgument(_)));

    alpha.shutdown().await;
    bee.shutdown().await;
    ns.stop().await;
}

#[tokio::test]
async fn make_against_an_unsatisfiable_goal_is_execution_ko() {
    let (ns, nameserver) = start_system().await;
    let bee = start_bee(nameserver).await;
    let alpha = Agent::start(AgentConfig::new(AgentName::literal("alpha"), nameserver))
        .await
        .unwrap();

    // No recipe is installed for `other`.
    let goal = Expr::eq(Expr::var("other"), Expr::int(1));
    let mut seq = Sequence::new();
    seq.push(Box::new(MakeConstraint::new(
        alpha.ctx().clone(),
        "bee",
        goal,
        vec![],
    )));
    assert_eq!(seq.run().await, Err(ExecError::ExecutionKo));

    alpha.shutdown().await;
    bee.shutdown().await;
    ns.stop().await;
}

#[tokio::test]
async fn abort_frame_interrupts_a_served_constraint() {
    let (ns, nameserver) = start_system().await;

    // Agent whose recipe waits forever on a flag nobody sets.
    let stuck = Agent::start(AgentConfig::new(AgentName::literal("stuck"), nameserver))
        .await
        .unwrap();
    stuck.export("go", Value::Bool(false));
    stuck.export("k", Value::Int(0));
    let table = RecipeTable::new();
    table.install(
        "k",
        Arc::new(RecipeDef::new(
            "wait_forever",
            Box::new(|ctx: &Arc<AgentContext>| {
                let mut seq = Sequence::new();
                seq.push(Box::new(WaitExpr::new(ctx.clone(), Expr::var("go"))));
                seq
            }),
        )),
    );
    stuck.set_logic(Arc::new(table));

    let client = hyper_runtime::NameClient::new(nameserver);
    let endpoints = client.resolve("stuck").await.unwrap();
    let link = hyper_runtime::PeerLink::new("stuck", endpoints);

    let goal = Expr::eq(Expr::var("k"), Expr::int(7));
    let mut answers = link
        .request(|id| Message::RequestConstraint {
            id,
            src: "driver".to_string(),
            constraint: goal.clone(),
            repeat: false,
            unify: vec![],
        })
        .await
        .unwrap();
    // Ack first; the recipe is now blocked on its wait.
    assert!(matches!(
        answers.recv().await.unwrap(),
        Message::RequestConstraintAck { .. }
    ));
    sleep(Duration::from_millis(50)).await;

    link.send(Message::Abort {
        src: "driver".to_string(),
        id: answers.id(),
    })
    .await
    .unwrap();

    let answer = timeout(Duration::from_secs(5), answers.recv())
        .await
        .expect("abort must answer")
        .unwrap();
    assert!(matches!(
        answer,
        Message::RequestConstraintAnswer {
            state: ConstraintState::Interrupted,
            ..
        }
    ));

    stuck.shutdown().await;
    ns.stop().await;
}

#[tokio::test]
async fn temporary_failure_pauses_the_caller_until_run_again() {
    let (ns, nameserver) = start_system().await;

    // `guarded` can only establish k once `ready` is true.
    let guarded = Agent::start(AgentConfig::new(AgentName::literal("guarded"), nameserver))
        .await
        .unwrap();
    guarded.export("ready", Value::Bool(false));
    guarded.export("k", Value::Int(0));
    let table = RecipeTable::new();
    table.install(
        "k",
        Arc::new(
            RecipeDef::new("guarded_set_k", assign("k", Expr::int(7)))
                .with_preconditions(ConditionSet::new(vec![Expr::var("ready")])),
        ),
    );
    guarded.set_logic(Arc::new(table));

    let alpha = Agent::start(AgentConfig::new(AgentName::literal("alpha"), nameserver))
        .await
        .unwrap();
    let goal = Expr::eq(Expr::var("k"), Expr::int(7));
    let mut seq = Sequence::new();
    seq.push(Box::new(MakeConstraint::new(
        alpha.ctx().clone(),
        "guarded",
        goal,
        vec![],
    )));

    let runner = tokio::spawn(async move { seq.run().await });
    // The precondition holds the request open without failing it.
    sleep(Duration::from_millis(200)).await;
    assert!(!runner.is_finished());
    assert_eq!(guarded.read("k").unwrap(), Value::Int(0));

    guarded.set("ready", Value::Bool(true)).unwrap();
    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("make must complete after run_again")
        .unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(guarded.read("k").unwrap(), Value::Int(7));

    alpha.shutdown().await;
    guarded.shutdown().await;
    ns.stop().await;
}

#[tokio::test]
async fn ensure_maintains_the_constraint_and_reestablishes_it() {
    let (ns, nameserver) = start_system().await;
    let bee = start_bee(nameserver).await;
    let alpha = Agent::start(AgentConfig::new(AgentName::literal("alpha"), nameserver))
        .await
        .unwrap();
    alpha.export("go", Value::Bool(false));

    let ctx = alpha.ctx().clone();
    let goal = Expr::eq(Expr::var("k"), Expr::int(7));
    let hold = new_hold();
    let mut seq = Sequence::new();
    seq.push(Box::new(EnsureConstraint::new(
        ctx.clone(),
        "bee",
        goal,
        vec![],
        hold.clone(),
    )));
    seq.push(Box::new(WaitExpr::new(ctx.clone(), Expr::var("go"))));

    let runner = tokio::spawn(async move { seq.run().await });

    // The ensure achieved its constraint and wrote back its hold.
    let mut achieved = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(10)).await;
        if bee.read("k").unwrap() == Value::Int(7) && hold.lock().unwrap().is_some() {
            achieved = true;
            break;
        }
    }
    assert!(achieved, "ensure never achieved its constraint");

    // Break the maintained constraint; the owner re-establishes it.
    bee.set("k", Value::Int(0)).unwrap();
    let mut restored = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(10)).await;
        if bee.read("k").unwrap() == Value::Int(7) {
            restored = true;
            break;
        }
    }
    assert!(restored, "maintained constraint was not re-established");

    // Let the sequence finish; its termination tears the ensure down.
    alpha.set("go", Value::Bool(true)).unwrap();
    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("sequence must finish")
        .unwrap();
    assert_eq!(result, Ok(()));

    alpha.shutdown().await;
    bee.shutdown().await;
    ns.stop().await;
}
