mod common;

use common::Client;
use common::Ping;
use common::Squarer;
use common::Watcher;
use common::recv;
use common::system;
use common::wait_dead;

use tokio::sync::mpsc;

use troupe::Activation;
use troupe::Actor;
use troupe::ActorResult;
use troupe::ActorService;
use troupe::Answer;
use troupe::Behaviour;
use troupe::Command;
use troupe::Error;
use troupe::actor::LifecycleState;
use troupe::behaviour::Describe;
use troupe::behaviour::Filtered;
use troupe::behaviour::Status;
use troupe::command::CommandQueue;
use troupe::command::Promise;
use troupe::command::RequestHandle;

#[tokio::test(flavor = "multi_thread")]
async fn ping_is_squared_and_both_sides_exit_cleanly() {
    let system = system();
    let server = system.spawn(Squarer { strict: false });
    let (tx, mut replies) = mpsc::unbounded_channel();
    let client = system.spawn(Client { target: server.clone(), commands: vec![Ping(10)], report: tx });
    let (tx, mut closes) = mpsc::unbounded_channel();
    system.spawn(Watcher { targets: vec![server.clone(), client.clone()], report: tx });

    assert_eq!(recv(&mut replies).await, Ok(100));
    server.send_quit(None);
    for _ in 0..2 {
        let (name, error) = recv(&mut closes).await;
        assert_eq!(error, None, "{} closed with an error", name);
    }
    system.shutdown().await;
    assert_eq!(system.live_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_error_is_replied_and_server_survives() {
    let system = system();
    let server = system.spawn(Squarer { strict: true });
    let result = system.ask(&server, Ping(20)).await;
    assert!(matches!(result, Err(Error::Message(_))), "{:?}", result);
    assert!(!server.is_dead());
    assert_eq!(system.ask(&server, Ping(10)).await, Ok(100));
    server.send_quit(None);
    system.shutdown().await;
    assert_eq!(server.exit_status(), Some(Ok(())));
}

#[derive(Debug)]
struct Shout;

impl Command for Shout {
    type Reply = ();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_command_is_rejected() {
    let system = system();
    let server = system.spawn(Squarer { strict: false });
    let result = system.ask(&server, Shout).await;
    assert!(matches!(result, Err(Error::UnknownCommand(name)) if name.ends_with("Shout")));
    server.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_and_null_targets_answer_promptly() {
    let system = system();
    let server = system.spawn(Squarer { strict: false });
    server.send_quit(Some(Error::msg("bye")));
    wait_dead(&server).await;
    assert_eq!(server.close_error(), Some(Error::msg("bye")));
    assert_eq!(system.ask(&server, Ping(1)).await, Err(Error::ActorDead));
    assert_eq!(system.ask(&ActorService::null(), Ping(1)).await, Err(Error::ActorNull));
    system.shutdown().await;
}

//---------------------------------------------------------------------------

/// Pauses every `Ping` in a filter, asks `backend`, and resumes with the backend's answer
/// plus one. The handler adds one more.
struct Incrementer {
    backend: ActorService,
}

impl Actor for Incrementer {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|_a: &mut Self, _t, Ping(n): Ping| Ok(Answer::Value(n + 1)))
            .filter(|a: &mut Self, t, incoming| {
                let n = match incoming.command::<Ping>() {
                    Some(Ping(n)) => *n,
                    None => return Ok(Filtered::Pass(incoming)),
                };
                let paused = t.pause_command(incoming);
                let backend = a.backend.clone();
                t.request(&backend, Ping(n), move |_a: &mut Self, t, result| {
                    let mut paused = paused;
                    match result {
                        Ok(v) => {
                            paused.replace(Ping(v + 1));
                            t.resume_command(paused);
                        }
                        Err(e) => {
                            t.cancel_command(paused, e);
                        }
                    }
                    Ok(())
                });
                Ok(Filtered::Held)
            })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_pauses_forwards_and_resumes() {
    let system = system();
    let backend = system.spawn(Squarer { strict: true });
    let front = system.spawn(Incrementer { backend: backend.clone() });
    assert_eq!(system.ask(&front, Ping(10)).await, Ok(102));
    let failed = system.ask(&front, Ping(3)).await;
    assert!(matches!(failed, Err(Error::Message(_))), "{:?}", failed);
    front.send_quit(None);
    backend.send_quit(None);
    system.shutdown().await;
}

//---------------------------------------------------------------------------

#[derive(Debug)]
struct Enter(u64);

impl Command for Enter {
    type Reply = usize;
}

struct Unlock;
struct Reject;

/// Holds `Enter` commands while locked; answers each with its admission position.
struct Turnstile {
    locked: bool,
    admitted: Vec<u64>,
    queue: CommandQueue,
}

impl Actor for Turnstile {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|a: &mut Self, t, e: Enter| {
                if a.locked {
                    let paused = t.pause(e)?;
                    a.queue.push(paused);
                    return Ok(Answer::Pending);
                }
                a.admitted.push(e.0);
                Ok(Answer::Value(a.admitted.len()))
            })
            .on_message(|a: &mut Self, t, _u: Unlock| {
                a.locked = false;
                t.resume_commands(&mut a.queue);
                Ok(())
            })
            .on_message(|a: &mut Self, t, _r: Reject| {
                t.cancel_commands(&mut a.queue, Error::msg("closed"));
                Ok(())
            })
    }
}

fn turnstile() -> Turnstile {
    Turnstile { locked: true, admitted: Vec::new(), queue: CommandQueue::new() }
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_commands_keep_their_order() {
    let system = system();
    let gate = system.spawn(turnstile());
    let (tx, mut replies) = mpsc::unbounded_channel();
    system.spawn(Client { target: gate.clone(), commands: vec![Enter(1), Enter(2), Enter(3)], report: tx });

    let status = loop {
        let status = system.ask(&gate, Status).await.unwrap();
        if status.promises == 3 {
            break status;
        }
        tokio::task::yield_now().await;
    };
    assert_eq!(status.state, LifecycleState::Running);
    assert!(replies.try_recv().is_err());

    gate.send_message(Unlock);
    let mut positions = Vec::new();
    for _ in 0..3 {
        positions.push(recv(&mut replies).await.unwrap());
    }
    assert_eq!(positions, vec![1, 2, 3]);
    gate.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_queue_answers_every_waiter() {
    let system = system();
    let gate = system.spawn(turnstile());
    let (tx, mut replies) = mpsc::unbounded_channel();
    system.spawn(Client { target: gate.clone(), commands: vec![Enter(1), Enter(2)], report: tx });
    while system.ask(&gate, Status).await.unwrap().promises < 2 {
        tokio::task::yield_now().await;
    }
    gate.send_message(Reject);
    for _ in 0..2 {
        assert_eq!(recv(&mut replies).await, Err(Error::msg("closed")));
    }
    gate.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn quitting_answers_paused_commands_with_actor_dead() {
    let system = system();
    let gate = system.spawn(turnstile());
    let (tx, mut replies) = mpsc::unbounded_channel();
    system.spawn(Client { target: gate.clone(), commands: vec![Enter(7)], report: tx });
    while system.ask(&gate, Status).await.unwrap().promises < 1 {
        tokio::task::yield_now().await;
    }
    gate.send_quit(None);
    assert_eq!(recv(&mut replies).await, Err(Error::ActorDead));
    system.shutdown().await;
}

//---------------------------------------------------------------------------

struct Wait;

impl Command for Wait {
    type Reply = &'static str;
}

struct Open;

/// Answers `Wait` only once `Open` arrives, reporting what happened to each promise.
struct Gate {
    waiting: Vec<Promise<&'static str>>,
    report: mpsc::UnboundedSender<&'static str>,
}

impl Actor for Gate {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|a: &mut Self, t, _w: Wait| {
                let promise = t.promise_with_cancel(|a: &mut Self, _t: &mut Activation<Self>| {
                    let _ = a.report.send("cancelled");
                    Ok(())
                })?;
                a.waiting.push(promise);
                Ok(Answer::Pending)
            })
            .on_message(|a: &mut Self, t, _o: Open| {
                for promise in std::mem::take(&mut a.waiting).into_iter() {
                    let outcome = if promise.resolve(t, "open") { "resolved" } else { "stale" };
                    let _ = a.report.send(outcome);
                }
                Ok(())
            })
    }
}

/// Sends `Wait` and withdraws it straight away.
struct Impatient {
    gate: ActorService,
    report: mpsc::UnboundedSender<Result<&'static str, Error>>,
    handle: Option<RequestHandle>,
}

struct GiveUp;

impl Actor for Impatient {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_message(|a: &mut Self, t, _g: GiveUp| {
            if let Some(handle) = a.handle.take() {
                t.cancel_request(&handle);
            }
            Ok(())
        })
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        let gate = self.gate.clone();
        let handle = t.request(&gate, Wait, |a: &mut Self, t, result| {
            let _ = a.report.send(result);
            t.quit(None);
            Ok(())
        });
        self.handle = Some(handle);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn promises_resolve_once_and_never_after_cancel() {
    let system = system();
    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let gate = system.spawn(Gate { waiting: Vec::new(), report: tx });

    let (tx, mut replies) = mpsc::unbounded_channel();
    let impatient = system.spawn(Impatient { gate: gate.clone(), report: tx, handle: None });
    while system.ask(&gate, Status).await.unwrap().promises < 1 {
        tokio::task::yield_now().await;
    }
    impatient.send_message(GiveUp);
    assert_eq!(recv(&mut replies).await, Err(Error::Cancelled));
    assert_eq!(recv(&mut outcomes).await, "cancelled");

    let patient = {
        let system = system.clone();
        let gate = gate.clone();
        tokio::spawn(async move { system.ask(&gate, Wait).await })
    };
    while system.ask(&gate, Status).await.unwrap().promises < 1 {
        tokio::task::yield_now().await;
    }
    assert!(!patient.is_finished());
    gate.send_message(Open);
    assert_eq!(patient.await.unwrap(), Ok("open"));
    assert_eq!(recv(&mut outcomes).await, "stale");
    assert_eq!(recv(&mut outcomes).await, "resolved");
    assert!(outcomes.try_recv().is_err());

    gate.send_quit(None);
    system.shutdown().await;
}

//---------------------------------------------------------------------------

struct Front {
    backend: ActorService,
}

impl Actor for Front {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_command(|a: &mut Self, t, p: Ping| {
            let backend = a.backend.clone();
            t.delegate(&backend, p)?;
            Ok(Answer::Pending)
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delegated_commands_are_answered_by_the_delegate() {
    let system = system();
    let backend = system.spawn(Squarer { strict: false });
    let front = system.spawn(Front { backend: backend.clone() });
    assert_eq!(system.ask(&front, Ping(9)).await, Ok(81));
    let status = system.ask(&front, Status).await.unwrap();
    assert_eq!(status.promises, 0);
    front.send_quit(None);
    backend.send_quit(None);
    system.shutdown().await;
}

/// Delegates each `Ping` and then answers it as well. Only the delegate's answer counts.
struct Eager {
    backend: ActorService,
}

impl Actor for Eager {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_command(|a: &mut Self, t, p: Ping| {
            let backend = a.backend.clone();
            t.delegate(&backend, p)?;
            Ok(Answer::Value(0))
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn value_returned_after_delegating_is_ignored() {
    let system = system();
    let backend = system.spawn(Squarer { strict: false });
    let front = system.spawn(Eager { backend: backend.clone() });
    let (tx, mut replies) = mpsc::unbounded_channel();
    let client = system.spawn(Client { target: front.clone(), commands: vec![Ping(9), Ping(2)], report: tx });
    assert_eq!(recv(&mut replies).await, Ok(81));
    assert_eq!(recv(&mut replies).await, Ok(4));
    wait_dead(&client).await;
    assert!(replies.try_recv().is_err());
    front.send_quit(None);
    backend.send_quit(None);
    system.shutdown().await;
}

//---------------------------------------------------------------------------

struct Go;

/// Passes `Wait` on to `backend`. While `hold`, each `Wait` is first parked until `Go`.
struct Deferrer {
    backend: ActorService,
    hold: bool,
    held: CommandQueue,
}

impl Actor for Deferrer {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|a: &mut Self, t, w: Wait| {
                let backend = a.backend.clone();
                t.delegate(&backend, w)?;
                Ok(Answer::Pending)
            })
            .on_message(|a: &mut Self, t, _g: Go| {
                t.resume_commands(&mut a.held);
                Ok(())
            })
            .filter(|a: &mut Self, t, incoming| {
                if !a.hold || incoming.command::<Wait>().is_none() {
                    return Ok(Filtered::Pass(incoming));
                }
                let paused = t.pause_command(incoming);
                a.held.push(paused);
                Ok(Filtered::Held)
            })
    }
}

fn deferrer(backend: &ActorService, hold: bool) -> Deferrer {
    Deferrer { backend: backend.clone(), hold, held: CommandQueue::new() }
}

async fn wait_for_promises(system: &troupe::System, target: &ActorService, n: usize) {
    while system.ask(target, Status).await.unwrap().promises < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_after_delegation_goes_straight_to_the_delegate() {
    let system = system();
    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let gate = system.spawn(Gate { waiting: Vec::new(), report: tx });
    let front = system.spawn(deferrer(&gate, false));

    let (tx, mut replies) = mpsc::unbounded_channel();
    let impatient = system.spawn(Impatient { gate: front.clone(), report: tx, handle: None });
    wait_for_promises(&system, &gate, 1).await;
    assert_eq!(system.ask(&front, Status).await.unwrap().promises, 0);

    impatient.send_message(GiveUp);
    assert_eq!(recv(&mut replies).await, Err(Error::Cancelled));
    assert_eq!(recv(&mut outcomes).await, "cancelled");
    assert_eq!(system.ask(&gate, Status).await.unwrap().promises, 0);

    front.send_quit(None);
    gate.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resumed_then_delegated_commands_are_proxied() {
    let system = system();
    let (tx, mut outcomes) = mpsc::unbounded_channel();
    let gate = system.spawn(Gate { waiting: Vec::new(), report: tx });
    let front = system.spawn(deferrer(&gate, true));

    let (tx, mut replies) = mpsc::unbounded_channel();
    let impatient = system.spawn(Impatient { gate: front.clone(), report: tx, handle: None });
    wait_for_promises(&system, &front, 1).await;
    front.send_message(Go);
    wait_for_promises(&system, &gate, 1).await;
    let status = system.ask(&front, Status).await.unwrap();
    assert_eq!((status.promises, status.inflight), (1, 1));

    impatient.send_message(GiveUp);
    assert_eq!(recv(&mut replies).await, Err(Error::Cancelled));
    assert_eq!(recv(&mut outcomes).await, "cancelled");
    let status = system.ask(&front, Status).await.unwrap();
    assert_eq!((status.promises, status.inflight), (0, 0));

    let patient = {
        let system = system.clone();
        let front = front.clone();
        tokio::spawn(async move { system.ask(&front, Wait).await })
    };
    wait_for_promises(&system, &front, 1).await;
    front.send_message(Go);
    wait_for_promises(&system, &gate, 1).await;
    gate.send_message(Open);
    assert_eq!(patient.await.unwrap(), Ok("open"));
    assert_eq!(recv(&mut outcomes).await, "stale");
    assert_eq!(recv(&mut outcomes).await, "resolved");
    assert_eq!(system.ask(&front, Status).await.unwrap().promises, 0);

    front.send_quit(None);
    gate.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_actor_describes_itself() {
    let system = system();
    let server = system.spawn(Squarer { strict: false });
    let description = system.ask(&server, Describe).await.unwrap();
    assert_eq!(description.name, "Squarer");
    assert_eq!(description.commands.len(), 1);
    assert!(description.commands[0].ends_with("Ping"));
    assert!(description.messages.is_empty());

    let status = system.ask(&server, Status).await.unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!((status.commands, status.filters, status.inflight), (1, 0, 0));
    server.send_quit(None);
    system.shutdown().await;
}
