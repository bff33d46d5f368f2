use std::time::Duration;

use troupe::Actor;
use troupe::ActorService;
use troupe::Answer;
use troupe::Behaviour;
use troupe::Command;
use troupe::Error;
use troupe::System;
use troupe::config::SystemConfig;
use troupe::system::PluginRegistry;

use troupe_services::restart::ChildReport;
use troupe_services::restart::ChildStatus;
use troupe_services::restart::RestartConfiguration;
use troupe_services::restart::RestartPolicy;
use troupe_services::restart::Restarter;
use troupe_services::restart::Supervisee;

struct Work;

impl Command for Work {
    type Reply = u32;
}

struct Worker;

impl Actor for Worker {
    fn behaviour(&self) -> Behaviour<Self> {
        Behaviour::new().on_command(|_a: &mut Self, _t, _w: Work| Ok(Answer::Value(7)))
    }
}

fn quick(policy: RestartPolicy) -> RestartConfiguration {
    RestartConfiguration {
        intensity: 5,
        period: Duration::from_secs(5),
        pause_time: Duration::from_millis(10),
        sleep_time: Duration::from_secs(30),
        restart_policy: policy,
    }
}

fn start(system: &System, config: RestartConfiguration) -> ActorService {
    Restarter::start(system, "worker-supervisor", config, |s: &System| s.spawn_named("worker", Worker))
}

async fn report(system: &System, restarter: &ActorService) -> ChildReport {
    system.ask(restarter, ChildStatus).await.unwrap()
}

async fn wait_until<F: Fn(&ChildReport) -> bool>(system: &System, restarter: &ActorService, f: F) -> ChildReport {
    for _ in 0..500 {
        let r = report(system, restarter).await;
        if f(&r) {
            return r;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("restarter never reached the expected state");
}

fn new_system() -> System {
    System::new(SystemConfig::default(), PluginRegistry::new())
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_child_is_replaced() {
    let system = new_system();
    let restarter = start(&system, quick(RestartPolicy::Always));
    let first = report(&system, &restarter).await;
    assert_eq!((first.starts, first.state), (1, Supervisee::Running));
    let child = first.child.unwrap();
    assert_eq!(system.ask(&child, Work).await, Ok(7));

    child.send_quit(Some(Error::msg("crash")));
    let second = wait_until(&system, &restarter, |r| r.starts == 2 && r.state == Supervisee::Running).await;
    assert_eq!(second.last_error, Some(Error::msg("crash")));
    let replacement = second.child.unwrap();
    assert_ne!(replacement, child);
    assert_eq!(system.ask(&replacement, Work).await, Ok(7));

    restarter.send_quit(None);
    system.shutdown().await;
    assert!(replacement.is_dead());
}

#[tokio::test(flavor = "multi_thread")]
async fn normal_exit_is_final_when_restarting_on_error_only() {
    let system = new_system();
    let restarter = start(&system, quick(RestartPolicy::OnErrorOnly));
    let child = report(&system, &restarter).await.child.unwrap();
    child.send_quit(None);
    let r = wait_until(&system, &restarter, |r| r.state == Supervisee::NotRunning).await;
    assert_eq!((r.starts, r.child), (1, None));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(report(&system, &restarter).await.starts, 1);

    restarter.send_quit(None);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn restarts_beyond_the_intensity_back_off() {
    let system = new_system();
    let mut config = quick(RestartPolicy::Always);
    config.intensity = 1;
    let restarter = start(&system, config);

    let child = report(&system, &restarter).await.child.unwrap();
    child.send_quit(Some(Error::msg("first")));
    let r = wait_until(&system, &restarter, |r| r.starts == 2 && r.state == Supervisee::Running).await;
    r.child.unwrap().send_quit(Some(Error::msg("second")));

    let r = wait_until(&system, &restarter, |r| r.state == Supervisee::Recovering).await;
    assert_eq!(r.last_error, Some(Error::msg("second")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let r = report(&system, &restarter).await;
    assert_eq!((r.starts, r.state), (2, Supervisee::Recovering));

    restarter.send_quit(None);
    tokio::time::timeout(Duration::from_secs(5), system.shutdown()).await.unwrap();
}
