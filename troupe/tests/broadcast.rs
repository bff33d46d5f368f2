mod common;

use common::recv;
use common::system;

use tokio::sync::mpsc;

use troupe::Activation;
use troupe::Actor;
use troupe::ActorResult;
use troupe::ActorService;
use troupe::Answer;
use troupe::Behaviour;
use troupe::Command;
use troupe::Error;
use troupe::System;
use troupe::broadcaster::Broadcaster;
use troupe::broadcaster::DropPolicy;
use troupe::broadcaster::VecLog;
use troupe::stream::OutputOptions;
use troupe::stream::StreamEvent;
use troupe::stream::StreamId;
use troupe::stream::Streaming;
use troupe::stream::input_fn;

struct Follow {
    from: Option<u64>,
}

impl Command for Follow {
    type Reply = Streaming;
}

struct Publish(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Offsets {
    min: Option<u64>,
    consumers: usize,
    retained: usize,
}

struct GetOffsets;

impl Command for GetOffsets {
    type Reply = Offsets;
}

struct Hub {
    log: Broadcaster<VecLog<u32>>,
}

fn hub_log(hub: &mut Hub) -> &mut Broadcaster<VecLog<u32>> {
    &mut hub.log
}

impl Actor for Hub {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
            .on_command(|a: &mut Self, t, f: Follow| {
                a.log.subscribe(t, f.from, hub_log, OutputOptions::default())?;
                Ok(Answer::Value(Streaming))
            })
            .on_message(|a: &mut Self, t, Publish(n): Publish| {
                a.log.append(t, n);
                Ok(())
            })
            .on_command(|a: &mut Self, _t, _g: GetOffsets| {
                Ok(Answer::Value(Offsets {
                    min: a.log.min_offset(),
                    consumers: a.log.consumer_count(),
                    retained: a.log.log().len(),
                }))
            })
    }
}

/// Follows a hub from `from`, reporting every event. A slow follower takes one item and then
/// stops asking.
struct Follower {
    hub: ActorService,
    from: Option<u64>,
    slow: bool,
    stream: Option<StreamId>,
    report: mpsc::UnboundedSender<StreamEvent<u32>>,
}

fn follower(hub: &ActorService, from: Option<u64>, slow: bool, report: mpsc::UnboundedSender<StreamEvent<u32>>) -> Follower {
    Follower { hub: hub.clone(), from, slow, stream: None, report }
}

impl Actor for Follower {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        let hub = self.hub.clone();
        let credit = if self.slow { 1 } else { 16 };
        let input = input_fn(|a: &mut Self, t: &mut Activation<Self>, event: StreamEvent<u32>| {
            if let (true, Some(stream)) = (a.slow, a.stream) {
                t.suspend_stream(stream);
            }
            let _ = a.report.send(event);
            Ok(())
        });
        self.stream = Some(t.open_stream_with_credit(&hub, Follow { from: self.from }, credit, input));
        Ok(())
    }
}

async fn offsets(system: &System, hub: &ActorService) -> Offsets {
    system.ask(hub, GetOffsets).await.unwrap()
}

async fn wait_for_consumers(system: &System, hub: &ActorService, n: usize) {
    while offsets(system, hub).await.consumers != n {
        tokio::task::yield_now().await;
    }
}

async fn take_items(rx: &mut mpsc::UnboundedReceiver<StreamEvent<u32>>, n: usize) -> Vec<u32> {
    let mut items = Vec::new();
    while items.len() < n {
        match recv(rx).await {
            StreamEvent::Data(batch) => items.extend(batch),
            StreamEvent::Closed(e) => panic!("closed early: {:?}", e),
        }
    }
    items
}

#[tokio::test(flavor = "multi_thread")]
async fn followers_replay_from_their_offset_and_the_log_trims_behind_them() {
    let system = system();
    let hub = system.spawn(Hub { log: Broadcaster::new(VecLog::new()) });
    for n in 1..=5 {
        hub.send_message(Publish(n));
    }
    assert_eq!(offsets(&system, &hub).await, Offsets { min: None, consumers: 0, retained: 5 });

    let (tx, mut a) = mpsc::unbounded_channel();
    let slow = system.spawn(follower(&hub, Some(0), true, tx));
    assert_eq!(take_items(&mut a, 1).await, vec![1]);
    assert_eq!(offsets(&system, &hub).await, Offsets { min: Some(1), consumers: 1, retained: 4 });

    let (tx, mut b) = mpsc::unbounded_channel();
    system.spawn(follower(&hub, Some(3), false, tx));
    assert_eq!(take_items(&mut b, 2).await, vec![4, 5]);
    assert_eq!(offsets(&system, &hub).await, Offsets { min: Some(1), consumers: 2, retained: 4 });

    slow.send_quit(None);
    assert!(matches!(recv(&mut a).await, StreamEvent::Closed(None)));
    wait_for_consumers(&system, &hub, 1).await;
    assert_eq!(offsets(&system, &hub).await, Offsets { min: Some(5), consumers: 1, retained: 0 });

    hub.send_message(Publish(6));
    assert_eq!(take_items(&mut b, 1).await, vec![6]);

    hub.send_quit(None);
    assert!(matches!(recv(&mut b).await, StreamEvent::Closed(None)));
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn following_from_a_trimmed_offset_is_refused() {
    let system = system();
    let hub = system.spawn(Hub { log: Broadcaster::new(VecLog::new()) });
    let (tx, mut first) = mpsc::unbounded_channel();
    system.spawn(follower(&hub, None, false, tx));
    wait_for_consumers(&system, &hub, 1).await;
    hub.send_message(Publish(1));
    hub.send_message(Publish(2));
    assert_eq!(take_items(&mut first, 2).await, vec![1, 2]);

    let (tx, mut late) = mpsc::unbounded_channel();
    system.spawn(follower(&hub, Some(0), false, tx));
    match recv(&mut late).await {
        StreamEvent::Closed(error) => assert_eq!(error, Some(Error::OffsetOutOfRange(0))),
        StreamEvent::Data(items) => panic!("unexpected data {:?}", items),
    }
    hub.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn laggards_are_dropped_and_the_minimum_moves_on() {
    let system = system();
    let hub = system.spawn(Hub { log: Broadcaster::new(VecLog::new()).with_drop_policy(DropPolicy::MaxLag(2)) });
    let (tx, mut slow) = mpsc::unbounded_channel();
    system.spawn(follower(&hub, None, true, tx));
    let (tx, mut fast) = mpsc::unbounded_channel();
    system.spawn(follower(&hub, None, false, tx));
    wait_for_consumers(&system, &hub, 2).await;

    hub.send_message(Publish(1));
    assert_eq!(take_items(&mut slow, 1).await, vec![1]);
    assert_eq!(take_items(&mut fast, 1).await, vec![1]);

    for n in 2..=4 {
        hub.send_message(Publish(n));
        assert_eq!(take_items(&mut fast, 1).await, vec![n]);
    }
    match recv(&mut slow).await {
        StreamEvent::Closed(error) => assert_eq!(error, Some(Error::StreamConsumerSlow)),
        StreamEvent::Data(items) => panic!("suspended follower got {:?}", items),
    }
    assert_eq!(offsets(&system, &hub).await, Offsets { min: Some(4), consumers: 1, retained: 0 });

    hub.send_quit(None);
    system.shutdown().await;
}
