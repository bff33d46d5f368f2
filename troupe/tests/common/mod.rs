#![allow(dead_code)]

use std::time::Duration;

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
use troupe::config::SystemConfig;
use troupe::system::PluginRegistry;

pub fn system() -> System {
    System::new(SystemConfig::default().with_name("test"), PluginRegistry::new())
}

/// Polls until `service` is dead. Panics after five seconds.
pub async fn wait_dead(service: &ActorService) {
    for _ in 0..500 {
        if service.is_dead() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{:?} did not die", service);
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(v)) => v,
        Ok(None) => panic!("channel closed"),
        Err(_) => panic!("timed out waiting for a report"),
    }
}

#[derive(Debug, Clone)]
pub struct Ping(pub u64);

impl Command for Ping {
    type Reply = u64;
}

/// Squares pings. When `strict`, only `Ping(10)` is answered.
pub struct Squarer {
    pub strict: bool,
}

impl Actor for Squarer {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_command(|a: &mut Self, _t, Ping(n): Ping| {
            if a.strict && n != 10 {
                return Err(Error::msg(format!("refusing to square {}", n)));
            }
            Ok(Answer::Value(n * n))
        })
    }
}

/// Sends each command to `target` on start, in order, and reports every reply.
pub struct Client<C: Command> {
    pub target: ActorService,
    pub commands: Vec<C>,
    pub report: mpsc::UnboundedSender<Result<C::Reply, Error>>,
}

impl<C: Command> Actor for Client<C> {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        let target = self.target.clone();
        for command in std::mem::take(&mut self.commands).into_iter() {
            t.request(&target, command, |a: &mut Self, _t, result| {
                let _ = a.report.send(result);
                Ok(())
            });
        }
        Ok(())
    }
}

/// Monitors every target and reports each close as `(name, error)`.
pub struct Watcher {
    pub targets: Vec<ActorService>,
    pub report: mpsc::UnboundedSender<(String, Option<Error>)>,
}

impl Actor for Watcher {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new()
    }

    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        for target in self.targets.iter() {
            let name = target.name().to_owned();
            t.monitor(target, move |a: &mut Self, _t, error| {
                let _ = a.report.send((name, error));
                Ok(())
            });
        }
        Ok(())
    }
}
