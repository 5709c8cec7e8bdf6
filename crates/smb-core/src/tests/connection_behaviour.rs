//! Behavioural tests for connection establishment and teardown.

use std::cell::RefCell;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use crate::{
    ConnectionObserver, ConnectionState, IncomingConnection, Router, RouterOptions,
    TransportError, WaitError, connect,
};

use super::support::{ConnectedPair, RecordingObserver, connected_pair, eventually};

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ConnectionWorld {
    observer: Arc<RecordingObserver>,
    incoming: Option<IncomingConnection>,
    dialled: Option<Router>,
    accepted: Option<Result<Router, WaitError>>,
    pair: Option<ConnectedPair>,
}

impl ConnectionWorld {
    fn controller_options(&self) -> RouterOptions {
        let observer: Arc<dyn ConnectionObserver> = Arc::clone(&self.observer) as _;
        RouterOptions::default().with_observer(observer)
    }

    fn incoming(&self) -> &IncomingConnection {
        self.incoming.as_ref().expect("listener not prepared")
    }

    fn pair(&self) -> &ConnectedPair {
        self.pair.as_ref().expect("connection not established")
    }
}

#[fixture]
fn world() -> RefCell<ConnectionWorld> {
    RefCell::new(ConnectionWorld::default())
}

#[given("a controller waiting for an inbound connection")]
fn given_prepared_listener(world: &RefCell<ConnectionWorld>) {
    let options = world.borrow().controller_options();
    let incoming = IncomingConnection::prepare(&options).expect("prepare listener");
    world.borrow_mut().incoming = Some(incoming);
}

#[given("an observed connection between controller and agent")]
fn given_observed_connection(world: &RefCell<ConnectionWorld>) {
    let options = world.borrow().controller_options();
    let pair = connected_pair(&options, &RouterOptions::default());
    world.borrow_mut().pair = Some(pair);
}

#[when("the agent dials the published port")]
fn when_agent_dials(world: &RefCell<ConnectionWorld>) {
    let port = world.borrow().incoming().local_port();
    let dialled = connect("127.0.0.1", port, &RouterOptions::default()).expect("agent dials");
    let accepted = world.borrow().incoming().wait_for_connection(ACCEPT_TIMEOUT);
    let mut world = world.borrow_mut();
    world.dialled = Some(dialled);
    world.accepted = Some(accepted);
}

#[when("the controller waits {millis} milliseconds for the agent")]
fn when_controller_waits(world: &RefCell<ConnectionWorld>, millis: u64) {
    let accepted = world
        .borrow()
        .incoming()
        .wait_for_connection(Duration::from_millis(millis));
    world.borrow_mut().accepted = Some(accepted);
}

#[when("the agent closes the connection")]
fn when_agent_closes(world: &RefCell<ConnectionWorld>) {
    world.borrow().pair().agent.close();
}

#[when("both sides close the connection at the same time")]
fn when_both_close(world: &RefCell<ConnectionWorld>) {
    let (controller, agent) = {
        let world = world.borrow();
        let pair = world.pair();
        (pair.controller.clone(), pair.agent.clone())
    };
    let barrier = Arc::new(Barrier::new(2));
    let agent_barrier = Arc::clone(&barrier);
    let closer = thread::spawn(move || {
        agent_barrier.wait();
        agent.close();
    });
    barrier.wait();
    controller.close();
    closer.join().expect("agent closer");
}

#[then("both sides report a live connection")]
fn then_both_alive(world: &RefCell<ConnectionWorld>) {
    let world = world.borrow();
    let dialled = world.dialled.as_ref().expect("agent router");
    let accepted = world
        .accepted
        .as_ref()
        .expect("accept attempted")
        .as_ref()
        .expect("controller router");
    assert!(dialled.is_alive());
    assert!(accepted.is_alive());
    assert_eq!(accepted.state(), ConnectionState::Connected);
}

#[then("the controller observer saw {count} connection")]
fn then_connections_observed(world: &RefCell<ConnectionWorld>, count: usize) {
    assert_eq!(world.borrow().observer.connections(), count);
}

#[then("waiting fails with a timeout")]
fn then_wait_times_out(world: &RefCell<ConnectionWorld>) {
    let world = world.borrow();
    let accepted = world.accepted.as_ref().expect("wait attempted");
    assert!(
        matches!(accepted, Err(WaitError::Timeout { .. })),
        "expected a timeout, got {accepted:?}"
    );
}

#[then("the controller observer saw {count} disconnection")]
fn then_disconnections_observed(world: &RefCell<ConnectionWorld>, count: usize) {
    let observer = Arc::clone(&world.borrow().observer);
    assert!(
        eventually(NOTIFY_TIMEOUT, || observer.disconnections() >= count),
        "expected {count} disconnections, saw {}",
        observer.disconnections()
    );
    thread::sleep(SETTLE);
    assert_eq!(
        observer.disconnections(),
        count,
        "reasons: {:?}",
        observer.reasons()
    );
}

#[then("the controller connection is no longer alive")]
fn then_controller_dead(world: &RefCell<ConnectionWorld>) {
    let world = world.borrow();
    let controller = &world.pair().controller;
    assert!(!controller.is_alive());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[then("sending from the controller fails")]
fn then_send_fails(world: &RefCell<ConnectionWorld>) {
    let error = world
        .borrow()
        .pair()
        .controller
        .send_signal("ping")
        .expect_err("send after close");
    assert!(matches!(error, TransportError::Closed));
}

#[scenario(
    path = "tests/features/connection_lifecycle.feature",
    name = "An agent dials back to a prepared listener"
)]
fn agent_dials_back(world: RefCell<ConnectionWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/connection_lifecycle.feature",
    name = "Waiting without an agent times out"
)]
fn waiting_without_agent_times_out(world: RefCell<ConnectionWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/connection_lifecycle.feature",
    name = "The agent hanging up is reported once"
)]
fn agent_hang_up_reported_once(world: RefCell<ConnectionWorld>) {
    let _ = world;
}

#[scenario(
    path = "tests/features/connection_lifecycle.feature",
    name = "Racing closes on both sides are reported once"
)]
fn racing_closes_reported_once(world: RefCell<ConnectionWorld>) {
    let _ = world;
}
