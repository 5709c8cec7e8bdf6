//! Behavioural tests for message, request, and response routing.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::{Value, json};

use crate::{
    CallError, Envelope, HandlerFailure, ListenerError, MessageListener, RegistrationError,
    RouterOptions,
};

use super::support::{ConnectedPair, connected_pair, eventually, strip_quotes};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct RuntimeFailure(String);

#[derive(Default)]
struct RoutingWorld {
    pair: Option<ConnectedPair>,
    outcome: Option<Result<Value, CallError>>,
    elapsed: Duration,
    registration: Option<Result<(), RegistrationError>>,
    typed_deliveries: Arc<AtomicUsize>,
    catch_all_deliveries: Arc<AtomicUsize>,
    concurrent: Vec<(Value, Result<Value, CallError>)>,
}

impl RoutingWorld {
    fn pair(&self) -> &ConnectedPair {
        self.pair.as_ref().expect("connection not established")
    }

    fn outcome(&self) -> &Result<Value, CallError> {
        self.outcome.as_ref().expect("no call was made")
    }
}

fn echo(envelope: &Envelope) -> Result<Value, HandlerFailure> {
    Ok(envelope.content().clone())
}

fn counting_listener(counter: &Arc<AtomicUsize>) -> Arc<dyn MessageListener> {
    let deliveries = Arc::clone(counter);
    Arc::new(move |_: &Envelope| -> Result<(), ListenerError> {
        deliveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[fixture]
fn world() -> RefCell<RoutingWorld> {
    RefCell::new(RoutingWorld::default())
}

#[given("a connected controller and agent")]
fn given_connected_pair(world: &RefCell<RoutingWorld>) {
    let options = RouterOptions::default();
    world.borrow_mut().pair = Some(connected_pair(&options, &options));
}

#[given("the agent echoes {message_type} requests")]
fn given_echo_handler(world: &RefCell<RoutingWorld>, message_type: String) {
    world
        .borrow()
        .pair()
        .agent
        .register_synchronous_handler(strip_quotes(&message_type), echo)
        .expect("register echo handler");
}

#[given("the agent fails {message_type} requests with {message}")]
fn given_failing_handler(world: &RefCell<RoutingWorld>, message_type: String, message: String) {
    let failure_message = strip_quotes(&message).to_owned();
    world
        .borrow()
        .pair()
        .agent
        .register_synchronous_handler(
            strip_quotes(&message_type),
            move |_: &Envelope| -> Result<Value, HandlerFailure> {
                Err(HandlerFailure::new(RuntimeFailure(failure_message.clone())))
            },
        )
        .expect("register failing handler");
}

#[given("the agent panics on {message_type} requests")]
fn given_panicking_handler(world: &RefCell<RoutingWorld>, message_type: String) {
    world
        .borrow()
        .pair()
        .agent
        .register_synchronous_handler(
            strip_quotes(&message_type),
            |_: &Envelope| -> Result<Value, HandlerFailure> { panic!("handler exploded") },
        )
        .expect("register panicking handler");
}

#[given("the agent listens for {message_type} messages")]
fn given_typed_listener(world: &RefCell<RoutingWorld>, message_type: String) {
    let world = world.borrow();
    let listener = counting_listener(&world.typed_deliveries);
    world
        .pair()
        .agent
        .register_permanent_listener(strip_quotes(&message_type), listener);
}

#[given("the agent listens for every message")]
fn given_catch_all_listener(world: &RefCell<RoutingWorld>) {
    let world = world.borrow();
    let listener = counting_listener(&world.catch_all_deliveries);
    world
        .pair()
        .agent
        .register_permanent_listener_for_all_messages(listener);
}

#[when("the controller calls {message_type} with {content}")]
fn when_controller_calls(world: &RefCell<RoutingWorld>, message_type: String, content: String) {
    let outcome = world.borrow().pair().controller.call(
        strip_quotes(&message_type),
        json!(strip_quotes(&content)),
        CALL_TIMEOUT,
    );
    world.borrow_mut().outcome = Some(outcome);
}

#[when("the controller calls {message_type} waiting {millis} milliseconds")]
fn when_controller_calls_with_timeout(
    world: &RefCell<RoutingWorld>,
    message_type: String,
    millis: u64,
) {
    let started = Instant::now();
    let outcome = world.borrow().pair().controller.call(
        strip_quotes(&message_type),
        json!("hi"),
        Duration::from_millis(millis),
    );
    let mut world = world.borrow_mut();
    world.elapsed = started.elapsed();
    world.outcome = Some(outcome);
}

#[when(
    "the controller calls {message_type} waiting {millis} milliseconds while closing the connection"
)]
fn when_controller_calls_while_closing(
    world: &RefCell<RoutingWorld>,
    message_type: String,
    millis: u64,
) {
    let controller = world.borrow().pair().controller.clone();
    let request_type = strip_quotes(&message_type).to_owned();
    let started = Instant::now();
    let caller = thread::spawn(move || {
        controller.call(&request_type, json!("hi"), Duration::from_millis(millis))
    });
    thread::sleep(Duration::from_millis(50));
    world.borrow().pair().controller.close();
    let outcome = caller.join().expect("caller thread");
    let mut world = world.borrow_mut();
    world.elapsed = started.elapsed();
    world.outcome = Some(outcome);
}

#[when("the agent registers another {message_type} handler")]
fn when_registering_duplicate(world: &RefCell<RoutingWorld>, message_type: String) {
    let registration = world.borrow().pair().agent.register_synchronous_handler(
        strip_quotes(&message_type),
        |_: &Envelope| -> Result<Value, HandlerFailure> { Ok(json!("replacement")) },
    );
    world.borrow_mut().registration = Some(registration);
}

#[when("the controller sends a {message_type} message")]
fn when_controller_sends(world: &RefCell<RoutingWorld>, message_type: String) {
    world
        .borrow()
        .pair()
        .controller
        .send_message(strip_quotes(&message_type), json!({ "state": "ready" }))
        .expect("send message");
}

#[when("the controller makes {count} concurrent {message_type} calls")]
fn when_concurrent_calls(world: &RefCell<RoutingWorld>, count: usize, message_type: String) {
    let controller = world.borrow().pair().controller.clone();
    let request_type = strip_quotes(&message_type).to_owned();
    let callers: Vec<_> = (0..count)
        .map(|index| {
            let caller = controller.clone();
            let call_type = request_type.clone();
            thread::spawn(move || {
                let content = json!({ "index": index });
                let outcome = caller.call(&call_type, content.clone(), CALL_TIMEOUT);
                (content, outcome)
            })
        })
        .collect();
    let results = callers
        .into_iter()
        .map(|caller| caller.join().expect("caller thread"))
        .collect();
    world.borrow_mut().concurrent = results;
}

#[then("the call returns {expected}")]
fn then_call_returns(world: &RefCell<RoutingWorld>, expected: String) {
    let world = world.borrow();
    match world.outcome() {
        Ok(value) => assert_eq!(value, &json!(strip_quotes(&expected))),
        Err(error) => panic!("call failed: {error}"),
    }
}

#[then("the call fails remotely with a {origin}")]
fn then_call_fails_remotely(world: &RefCell<RoutingWorld>, origin: String) {
    let world = world.borrow();
    let error = world.outcome().as_ref().expect_err("call should fail");
    let failure = error.remote_failure().expect("remote failure");
    assert!(
        failure.origin_type().ends_with(strip_quotes(&origin)),
        "unexpected origin type {}",
        failure.origin_type()
    );
}

#[then("the remote failure message is {message}")]
fn then_remote_message(world: &RefCell<RoutingWorld>, message: String) {
    let world = world.borrow();
    let error = world.outcome().as_ref().expect_err("call should fail");
    let failure = error.remote_failure().expect("remote failure");
    assert_eq!(failure.message(), strip_quotes(&message));
}

#[then("the call times out after at least {millis} milliseconds")]
fn then_call_times_out(world: &RefCell<RoutingWorld>, millis: u64) {
    let world = world.borrow();
    let error = world.outcome().as_ref().expect_err("call should time out");
    assert!(error.is_timeout(), "expected timeout, got {error}");
    assert!(
        world.elapsed >= Duration::from_millis(millis),
        "returned after {:?}",
        world.elapsed
    );
}

#[then("the registration is rejected as a duplicate")]
fn then_registration_rejected(world: &RefCell<RoutingWorld>) {
    let world = world.borrow();
    let registration = world.registration.as_ref().expect("no registration made");
    assert!(matches!(
        registration,
        Err(RegistrationError::DuplicateHandler { .. })
    ));
}

#[then("the original {message_type} handler still answers")]
fn then_original_handler_answers(world: &RefCell<RoutingWorld>, message_type: String) {
    let answer = world
        .borrow()
        .pair()
        .controller
        .call(strip_quotes(&message_type), json!("still here"), CALL_TIMEOUT)
        .expect("original handler answers");
    assert_eq!(answer, json!("still here"));
}

#[then("the typed listener saw {count} message")]
fn then_typed_deliveries(world: &RefCell<RoutingWorld>, count: usize) {
    let counter = Arc::clone(&world.borrow().typed_deliveries);
    assert_delivered(&counter, count);
}

#[then("the catch-all listener saw {count} message")]
fn then_catch_all_deliveries(world: &RefCell<RoutingWorld>, count: usize) {
    let counter = Arc::clone(&world.borrow().catch_all_deliveries);
    assert_delivered(&counter, count);
}

#[then("every concurrent call returns its own content")]
fn then_concurrent_calls_correlate(world: &RefCell<RoutingWorld>) {
    let world = world.borrow();
    assert!(!world.concurrent.is_empty());
    for (content, outcome) in &world.concurrent {
        match outcome {
            Ok(value) => assert_eq!(value, content),
            Err(error) => panic!("call for {content} failed: {error}"),
        }
    }
}

fn assert_delivered(counter: &AtomicUsize, count: usize) {
    assert!(
        eventually(DELIVERY_TIMEOUT, || counter.load(Ordering::SeqCst) >= count),
        "expected {count} deliveries, saw {}",
        counter.load(Ordering::SeqCst)
    );
    thread::sleep(SETTLE);
    assert_eq!(counter.load(Ordering::SeqCst), count);
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "An echo handler answers a synchronous call"
)]
fn echo_handler_answers(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "Handler failures travel back as remote failures"
)]
fn handler_failures_travel_back(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "A panicking handler still produces a response"
)]
fn panicking_handler_still_responds(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "Calls without a handler time out"
)]
fn calls_without_handler_time_out(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "Calls pending when the connection closes still time out"
)]
fn pending_calls_time_out_after_close(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "A second handler for the same type is rejected"
)]
fn duplicate_handler_rejected(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "Messages reach typed and catch-all listeners exactly once"
)]
fn listeners_receive_messages_once(world: RefCell<RoutingWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/message_routing.feature",
    name = "Concurrent calls are correlated independently"
)]
fn concurrent_calls_correlated(world: RefCell<RoutingWorld>) {
    let _ = world;
}
